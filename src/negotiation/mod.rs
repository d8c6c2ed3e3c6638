//! Non-trickle negotiation policy.
//!
//! Every session negotiated by the desk gathers all ICE candidates before
//! sending a single SDP body. The transport enables trickling by default, so
//! the policy is forced on three layers: the session negotiation options, the
//! peer connection configuration, and the outgoing SDP text.
use crate::media::{LocalStreamRef, MediaConstraints};
use crate::useragent::Session;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, sync::Arc, time::Duration};
use tracing::debug;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_ICE_GATHERING_TIMEOUT: Duration = Duration::from_millis(8000);

const ICE_OPTIONS: &str = "a=ice-options:";

static TRICKLE_OPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^a=ice-options:[^\n]*\btrickle\b").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
}

/// Session level negotiation options, as the transport sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationOptions {
    pub trickle: bool,
    pub ice_gathering_timeout: Option<Duration>,
    pub rtc_configuration: Option<RtcConfiguration>,
    pub constraints: MediaConstraints,
}

impl Default for NegotiationOptions {
    /// What the transport uses when nobody intervenes: trickle enabled.
    fn default() -> Self {
        Self {
            trickle: true,
            ice_gathering_timeout: None,
            rtc_configuration: None,
            constraints: MediaConstraints::default(),
        }
    }
}

/// Options passed to `answer` and to an outbound `call`.
///
/// For an outbound call the transport must install `sdp_rewriter` on the new
/// session before its offer leaves, since no session exists for
/// [`NegotiationPolicy::apply`] to act on yet.
#[derive(Clone)]
pub struct CallOptions {
    pub media_stream: LocalStreamRef,
    pub negotiation: NegotiationOptions,
    pub sdp_rewriter: SdpRewriter,
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("media_stream", &self.media_stream)
            .field("negotiation", &self.negotiation)
            .finish_non_exhaustive()
    }
}

/// Filter applied to every local SDP body right before it is sent.
pub type SdpRewriter = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationPolicy {
    ice_servers: Vec<IceServer>,
    transport_policy: IceTransportPolicy,
    gathering_timeout: Duration,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self::new(
            vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            IceTransportPolicy::All,
            DEFAULT_ICE_GATHERING_TIMEOUT,
        )
    }
}

impl NegotiationPolicy {
    pub fn new(
        ice_servers: Vec<IceServer>,
        transport_policy: IceTransportPolicy,
        gathering_timeout: Duration,
    ) -> Self {
        Self {
            ice_servers,
            transport_policy,
            gathering_timeout,
        }
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Merge the fixed server set into `existing`. A non-empty server list
    /// supplied by the transport is left untouched.
    pub fn rtc_configuration(&self, existing: Option<&RtcConfiguration>) -> RtcConfiguration {
        let ice_servers = match existing {
            Some(config) if !config.ice_servers.is_empty() => config.ice_servers.clone(),
            _ => self.ice_servers.clone(),
        };
        let ice_transport_policy = match (self.transport_policy, existing) {
            (IceTransportPolicy::Relay, _) => IceTransportPolicy::Relay,
            (_, Some(config)) => config.ice_transport_policy,
            (policy, None) => policy,
        };
        RtcConfiguration {
            ice_servers,
            ice_transport_policy,
        }
    }

    /// New negotiation options with trickling disabled.
    pub fn negotiation_options(&self, existing: &NegotiationOptions) -> NegotiationOptions {
        NegotiationOptions {
            trickle: false,
            ice_gathering_timeout: existing
                .ice_gathering_timeout
                .or(Some(self.gathering_timeout)),
            rtc_configuration: Some(self.rtc_configuration(existing.rtc_configuration.as_ref())),
            constraints: existing.constraints.clone(),
        }
    }

    /// Replacement for an attached peer connection configuration, `None` when
    /// the current one already satisfies the policy.
    pub fn peer_configuration(&self, current: &RtcConfiguration) -> Option<RtcConfiguration> {
        let merged = self.rtc_configuration(Some(current));
        if &merged == current {
            None
        } else {
            Some(merged)
        }
    }

    pub fn call_options(&self, media_stream: LocalStreamRef) -> CallOptions {
        CallOptions {
            media_stream,
            negotiation: self.negotiation_options(&NegotiationOptions::default()),
            sdp_rewriter: self.sdp_rewriter(),
        }
    }

    pub fn sdp_rewriter(&self) -> SdpRewriter {
        Arc::new(|sdp: &str| strip_trickle(sdp).into_owned())
    }

    /// Force the policy on `session`. Safe to call on every renegotiation and
    /// every time a peer connection gets attached.
    pub fn apply(&self, session: &dyn Session) -> Result<()> {
        let options = self.negotiation_options(&session.negotiation_options());
        session.set_negotiation_options(options);

        if let Some(current) = session.peer_configuration() {
            if let Some(updated) = self.peer_configuration(&current) {
                debug!(
                    session_id = %session.id(),
                    ice_servers = updated.ice_servers.len(),
                    "injecting ice servers into peer connection"
                );
                session.set_peer_configuration(updated)?;
            }
        }
        session.set_sdp_rewriter(self.sdp_rewriter());
        Ok(())
    }
}

/// Remove the `trickle` token from every `a=ice-options:` line, dropping the
/// line when nothing else is left on it. Line endings are preserved.
pub fn strip_trickle(sdp: &str) -> Cow<'_, str> {
    if !TRICKLE_OPTION.is_match(sdp) {
        return Cow::Borrowed(sdp);
    }
    let mut stripped = String::with_capacity(sdp.len());
    for line in sdp.split_inclusive('\n') {
        let content = line.trim_end_matches(['\r', '\n']);
        let ending = &line[content.len()..];
        let is_ice_options = content.len() >= ICE_OPTIONS.len()
            && content.as_bytes()[..ICE_OPTIONS.len()].eq_ignore_ascii_case(ICE_OPTIONS.as_bytes());
        if !is_ice_options {
            stripped.push_str(line);
            continue;
        }
        let (prefix, value) = content.split_at(ICE_OPTIONS.len());
        let remaining = value
            .split_whitespace()
            .filter(|option| !option.eq_ignore_ascii_case("trickle"))
            .collect::<Vec<_>>();
        if remaining.is_empty() {
            continue;
        }
        stripped.push_str(prefix);
        stripped.push_str(&remaining.join(" "));
        stripped.push_str(ending);
    }
    Cow::Owned(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::testing::{FakeStream, MockSession};

    const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=ice-options:trickle\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
a=candidate:1 1 udp 2122260223 192.168.1.10 54400 typ host\r\n\
a=ice-options:trickle renomination\r\n\
a=rtpmap:111 opus/48000/2\r\n";

    #[test]
    fn test_strip_trickle() {
        let stripped = strip_trickle(OFFER);
        assert!(!stripped.contains("trickle"));
        assert!(stripped.contains("a=ice-options:renomination\r\n"));
        assert!(stripped.contains("a=candidate:1 1 udp"));
        assert!(stripped.ends_with("a=rtpmap:111 opus/48000/2\r\n"));
        assert_eq!(stripped.lines().count(), OFFER.lines().count() - 1);
        // idempotent
        assert_eq!(strip_trickle(&stripped), stripped);
    }

    #[test]
    fn test_strip_trickle_untouched() {
        let sdp = "v=0\na=ice-ufrag:trickle\na=ice-options:renomination\n";
        assert!(matches!(strip_trickle(sdp), Cow::Borrowed(_)));
        assert_eq!(
            strip_trickle("v=0\nA=ICE-OPTIONS:Trickle\nm=audio 9 RTP/AVP 0"),
            "v=0\nm=audio 9 RTP/AVP 0"
        );
    }

    #[test]
    fn test_negotiation_options_merge() {
        let policy = NegotiationPolicy::default();
        let options = policy.negotiation_options(&NegotiationOptions::default());
        assert!(!options.trickle);
        assert_eq!(
            options.ice_gathering_timeout,
            Some(DEFAULT_ICE_GATHERING_TIMEOUT)
        );
        let config = options.rtc_configuration.clone().unwrap();
        assert_eq!(config.ice_servers, vec![IceServer::stun(DEFAULT_STUN_SERVER)]);

        let supplied = NegotiationOptions {
            ice_gathering_timeout: Some(Duration::from_secs(2)),
            rtc_configuration: Some(RtcConfiguration {
                ice_servers: vec![IceServer {
                    urls: vec!["turn:turn.example.com:3478".to_string()],
                    username: Some("u".to_string()),
                    credential: Some("p".to_string()),
                }],
                ice_transport_policy: IceTransportPolicy::All,
            }),
            ..Default::default()
        };
        let merged = policy.negotiation_options(&supplied);
        assert!(!merged.trickle);
        assert_eq!(merged.ice_gathering_timeout, Some(Duration::from_secs(2)));
        assert_eq!(merged.rtc_configuration, supplied.rtc_configuration);
        // merging again changes nothing
        assert_eq!(policy.negotiation_options(&merged), merged);
    }

    #[test]
    fn test_peer_configuration() {
        let policy = NegotiationPolicy::default();
        let injected = policy
            .peer_configuration(&RtcConfiguration::default())
            .unwrap();
        assert_eq!(injected.ice_servers.len(), 1);
        assert_eq!(policy.peer_configuration(&injected), None);

        let relay = NegotiationPolicy::new(
            vec![IceServer::stun("stun:a")],
            IceTransportPolicy::Relay,
            DEFAULT_ICE_GATHERING_TIMEOUT,
        );
        let updated = relay.peer_configuration(&injected).unwrap();
        assert_eq!(updated.ice_transport_policy, IceTransportPolicy::Relay);
        assert_eq!(updated.ice_servers, injected.ice_servers);
    }

    #[tokio::test]
    async fn test_apply_strips_outgoing_sdp() {
        let policy = NegotiationPolicy::default();
        let session = MockSession::inbound("s1").with_local_sdp(OFFER).into_ref();
        session.attach_peer_connection(RtcConfiguration::default());
        for _ in 0..3 {
            policy.apply(session.as_ref()).unwrap();
        }
        assert!(!session.negotiation_options().trickle);
        assert_eq!(
            session.peer_configuration().unwrap().ice_servers,
            policy.ice_servers()
        );

        session
            .answer(policy.call_options(FakeStream::new("mic-1")))
            .await
            .unwrap();
        let sent = session.sent_sdp();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].contains("a=ice-options:trickle"));
    }

    #[test]
    fn test_call_options_carry_rewriter() {
        let policy = NegotiationPolicy::default();
        let options = policy.call_options(FakeStream::new("mic-1"));
        assert!(!options.negotiation.trickle);
        let offer = (options.sdp_rewriter)(OFFER);
        assert!(!offer.contains("trickle"));
        assert!(offer.contains("a=ice-options:renomination\r\n"));
        assert!(format!("{:?}", options).starts_with("CallOptions"));
    }
}
