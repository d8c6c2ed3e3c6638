//! Decides whether an inbound session belongs to the active call.
//!
//! SIP intermediaries do not rewrite identifiers consistently, so a session
//! is matched on any of three keys, tried in a fixed order: the dialog
//! `Call-ID`, the provider correlation header, and finally the `From` tag.
use crate::useragent::Session;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CORRELATION_HEADER: &str = "X-Twilio-CallSid";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub call_id: Option<String>,
    pub external_correlation_id: Option<String>,
    pub from_tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    Renegotiation,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKey {
    CallId,
    ExternalCorrelationId,
    FromTag,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Fingerprint `session` once, when it is attached.
///
/// The dialog `Call-ID` falls back to the transport session id when the
/// request carries none.
pub fn derive_identity(session: &dyn Session, correlation_header: &str) -> SessionIdentity {
    let request = session.request();
    let call_id = non_empty(request.as_ref().and_then(|r| r.call_id.as_deref()))
        .or_else(|| non_empty(Some(session.id().as_str())));
    let external_correlation_id =
        non_empty(request.as_ref().and_then(|r| r.header(correlation_header)));
    let from_tag = non_empty(request.as_ref().and_then(|r| r.from_tag.as_deref()));
    SessionIdentity {
        call_id,
        external_correlation_id,
        from_tag,
    }
}

fn same(a: &Option<String>, b: &Option<String>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

/// The first key, in priority order, that is set and equal on both sides.
pub fn matching_key(a: &SessionIdentity, b: &SessionIdentity) -> Option<IdentityKey> {
    if same(&a.call_id, &b.call_id) {
        Some(IdentityKey::CallId)
    } else if same(&a.external_correlation_id, &b.external_correlation_id) {
        Some(IdentityKey::ExternalCorrelationId)
    } else if same(&a.from_tag, &b.from_tag) {
        Some(IdentityKey::FromTag)
    } else {
        None
    }
}

/// Classify a session arriving while a call is active.
pub fn classify(new: &SessionIdentity, active: &SessionIdentity) -> Classification {
    match matching_key(new, active) {
        Some(_) => Classification::Renegotiation,
        None => Classification::Parallel,
    }
}

/// Without an active call every session is new.
pub fn correlate(new: &SessionIdentity, active: Option<&SessionIdentity>) -> Classification {
    match active {
        Some(active) => classify(new, active),
        None => Classification::New,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::testing::MockSession;
    use crate::useragent::SignalingRequest;

    fn identity(call_id: Option<&str>, external: Option<&str>, tag: Option<&str>) -> SessionIdentity {
        SessionIdentity {
            call_id: call_id.map(String::from),
            external_correlation_id: external.map(String::from),
            from_tag: tag.map(String::from),
        }
    }

    #[test]
    fn test_derive_identity() {
        let session = MockSession::inbound("s1")
            .with_request(
                SignalingRequest::new("A1@10.0.0.1")
                    .with_from_tag("tag-1")
                    .with_header("x-twilio-callsid", "CA42"),
            )
            .into_ref();
        let derived = derive_identity(session.as_ref(), DEFAULT_CORRELATION_HEADER);
        assert_eq!(derived.call_id.as_deref(), Some("A1@10.0.0.1"));
        assert_eq!(derived.external_correlation_id.as_deref(), Some("CA42"));
        assert_eq!(derived.from_tag.as_deref(), Some("tag-1"));
    }

    #[test]
    fn test_derive_identity_falls_back_to_session_id() {
        let session = MockSession::inbound("s9").without_request().into_ref();
        let derived = derive_identity(session.as_ref(), DEFAULT_CORRELATION_HEADER);
        assert_eq!(derived, identity(Some("s9"), None, None));

        let session = MockSession::inbound("s10")
            .with_request(SignalingRequest {
                call_id: Some(" ".to_string()),
                from_tag: Some(String::new()),
                headers: vec![],
            })
            .into_ref();
        let derived = derive_identity(session.as_ref(), DEFAULT_CORRELATION_HEADER);
        assert_eq!(derived, identity(Some("s10"), None, None));
    }

    #[test]
    fn test_classify_by_call_id() {
        let active = identity(Some("A1"), None, None);
        assert_eq!(
            classify(&identity(Some("A1"), None, None), &active),
            Classification::Renegotiation
        );
        assert_eq!(
            classify(&identity(Some("B2"), None, None), &active),
            Classification::Parallel
        );
    }

    #[test]
    fn test_classify_fallback_keys() {
        // intermediary rewrote the Call-ID but kept the provider id
        let active = identity(Some("A1"), Some("CA1"), Some("t1"));
        let rewritten = identity(Some("A1-b2bua"), Some("CA1"), Some("t9"));
        assert_eq!(
            matching_key(&rewritten, &active),
            Some(IdentityKey::ExternalCorrelationId)
        );
        let tag_only = identity(Some("X"), None, Some("t1"));
        assert_eq!(matching_key(&tag_only, &active), Some(IdentityKey::FromTag));
        assert_eq!(
            matching_key(&identity(Some("A1"), Some("CA1"), Some("t1")), &active),
            Some(IdentityKey::CallId)
        );
    }

    #[test]
    fn test_missing_fields_never_match() {
        let empty = SessionIdentity::default();
        assert_eq!(classify(&empty, &empty), Classification::Parallel);
        let active = identity(None, Some("CA1"), None);
        assert_eq!(
            classify(&identity(None, None, Some("CA1")), &active),
            Classification::Parallel
        );
    }

    #[test]
    fn test_correlate_without_active_call() {
        let new = identity(Some("A1"), None, None);
        assert_eq!(correlate(&new, None), Classification::New);
        assert_eq!(correlate(&new, Some(&new)), Classification::Renegotiation);
    }

    #[test]
    fn test_classify_symmetric_and_deterministic() {
        let values = [None, Some("A"), Some("B")];
        let mut identities = Vec::new();
        for call_id in values {
            for external in values {
                for tag in values {
                    identities.push(identity(call_id, external, tag));
                }
            }
        }
        for a in &identities {
            for b in &identities {
                let forward = classify(a, b);
                assert_eq!(forward, classify(b, a), "{:?} vs {:?}", a, b);
                assert_eq!(forward, classify(a, b));
                assert_eq!(matching_key(a, b), matching_key(b, a));
            }
        }
    }
}
