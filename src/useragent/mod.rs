//! Boundary to the SIP/WebRTC user agent.
//!
//! The user agent owns registration, dialogs and peer connections. The desk
//! core only borrows the sessions it hands over and reacts to the events it
//! emits; everything is expressed through the [`Session`] and
//! [`SignalingTransport`] traits so the core can be driven without a network.

use crate::negotiation::{CallOptions, NegotiationOptions, RtcConfiguration, SdpRewriter};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

pub mod config;
mod registration;
pub use config::{sanitize_domain, DialTarget, SipConfig};
pub use registration::{LinkStatus, RegisterOption, RegistrationEvent};

/// Transport assigned identifier of one signaling dialog
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Dialog status as tracked by the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Null,
    InviteSent,
    ProvisionalReceived,
    InviteReceived,
    WaitingForAnswer,
    Answered,
    WaitingForAck,
    Confirmed,
    Canceled,
    Terminated,
}

impl SessionStatus {
    pub fn is_answerable(self) -> bool {
        matches!(
            self,
            SessionStatus::Null
                | SessionStatus::InviteReceived
                | SessionStatus::ProvisionalReceived
                | SessionStatus::WaitingForAnswer
        )
    }

    pub fn is_ended(self) -> bool {
        matches!(self, SessionStatus::Canceled | SessionStatus::Terminated)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    pub user: Option<String>,
    pub display_name: Option<String>,
}

/// The request that created a dialog, reduced to what correlation needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingRequest {
    pub call_id: Option<String>,
    pub from_tag: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl SignalingRequest {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            ..Default::default()
        }
    }

    pub fn with_from_tag(mut self, tag: impl Into<String>) -> Self {
        self.from_tag = Some(tag.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Header lookup, case-insensitive on the name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateReason {
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
}

impl TerminateReason {
    fn with(status_code: u16, reason_phrase: &str) -> Self {
        Self {
            status_code: Some(status_code),
            reason_phrase: Some(reason_phrase.to_string()),
        }
    }

    /// Rejection of a renegotiation leg that could not be processed
    pub fn unprocessable_renegotiation() -> Self {
        Self::with(488, "Unable to process re-INVITE")
    }
}

/// Lifecycle events emitted by the user agent for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Progress,
    Accepted,
    Confirmed,
    Ended { cause: Option<String> },
    Failed { cause: Option<String> },
    PeerConnectionAttached,
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Ended { .. } | SessionEvent::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Progress => "progress",
            SessionEvent::Accepted => "accepted",
            SessionEvent::Confirmed => "confirmed",
            SessionEvent::Ended { .. } => "ended",
            SessionEvent::Failed { .. } => "failed",
            SessionEvent::PeerConnectionAttached => "peerconnection",
        }
    }
}

/// One signaling dialog, owned by the user agent.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;
    fn direction(&self) -> Direction;
    fn status(&self) -> SessionStatus;
    fn remote_identity(&self) -> RemoteIdentity;
    fn request(&self) -> Option<SignalingRequest>;

    fn negotiation_options(&self) -> NegotiationOptions;
    fn set_negotiation_options(&self, options: NegotiationOptions);
    /// Configuration of the attached peer connection, `None` until one exists
    fn peer_configuration(&self) -> Option<RtcConfiguration>;
    fn set_peer_configuration(&self, configuration: RtcConfiguration) -> Result<()>;
    /// Install the filter every local SDP body passes through before it is sent
    fn set_sdp_rewriter(&self, rewriter: SdpRewriter);

    async fn answer(&self, options: CallOptions) -> Result<()>;
    async fn terminate(&self, reason: TerminateReason) -> Result<()>;
    async fn hold(&self) -> Result<()>;
    async fn unhold(&self) -> Result<()>;
    async fn refer(&self, target: &str) -> Result<()>;
}

pub type SessionRef = Arc<dyn Session>;

/// Originates outbound dialogs. The resulting session is delivered back
/// through [`TransportEvent::NewSession`] like any other.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn call(&self, target: &DialTarget, options: CallOptions) -> Result<()>;
}

/// Everything the user agent reports to the desk core
#[derive(Clone)]
pub enum TransportEvent {
    NewSession(SessionRef),
    Session {
        session_id: SessionId,
        event: SessionEvent,
    },
    Registration(RegistrationEvent),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::NewSession(session) => f
                .debug_struct("NewSession")
                .field("session_id", &session.id())
                .field("direction", &session.direction())
                .finish(),
            TransportEvent::Session { session_id, event } => f
                .debug_struct("Session")
                .field("session_id", session_id)
                .field("event", event)
                .finish(),
            TransportEvent::Registration(event) => {
                f.debug_tuple("Registration").field(event).finish()
            }
        }
    }
}

pub type TransportEventSender = tokio::sync::mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = tokio::sync::mpsc::UnboundedReceiver<TransportEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_lookup() {
        let request = SignalingRequest::new("abc@host")
            .with_from_tag("f1")
            .with_header("X-Twilio-CallSid", "CA123");
        assert_eq!(request.header("x-twilio-callsid"), Some("CA123"));
        assert_eq!(request.header("X-Other"), None);
        assert_eq!(request.from_tag.as_deref(), Some("f1"));
    }

    #[test]
    fn test_answerable_status() {
        assert!(SessionStatus::InviteReceived.is_answerable());
        assert!(SessionStatus::WaitingForAnswer.is_answerable());
        assert!(!SessionStatus::Confirmed.is_answerable());
        assert!(!SessionStatus::Terminated.is_answerable());
        assert!(SessionStatus::Canceled.is_ended());
    }

    #[test]
    fn test_session_event_wire_format() {
        let event: SessionEvent =
            serde_json::from_str(r#"{"type":"failed","cause":"Busy"}"#).unwrap();
        assert_eq!(
            event,
            SessionEvent::Failed {
                cause: Some("Busy".to_string())
            }
        );
        assert!(event.is_terminal());
        assert!(!SessionEvent::PeerConnectionAttached.is_terminal());
    }
}
