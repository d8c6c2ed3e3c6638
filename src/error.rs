use crate::call::AgentCallState;
use crate::useragent::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures produced by the desk core.
///
/// Failures local to a single session (`NegotiationFailed`,
/// `RenegotiationFailed`) never alter the primary call beyond the transition
/// documented for them; nothing here is fatal to the process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeskError {
    /// Microphone access refused. Sticky until the page is reloaded.
    #[error("microphone access denied")]
    PermissionDenied,

    #[error("microphone unavailable: {0}")]
    MediaUnavailable(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("transport rejected: {0}")]
    TransportRejected(String),

    /// A second inbound dialog arrived while a call is active. Resolved by
    /// discarding the new session, never surfaced.
    #[error("conflicting session {0}")]
    ConflictingSession(SessionId),

    #[error("renegotiation failed: {0}")]
    RenegotiationFailed(String),

    #[error("a call is already in progress")]
    CallInProgress,

    #[error("no active call")]
    NoActiveCall,

    #[error("cannot {action} while {state}")]
    InvalidState {
        state: AgentCallState,
        action: &'static str,
    },

    #[error("invalid dial target: {0:?}")]
    InvalidTarget(String),
}

pub type Result<T, E = DeskError> = std::result::Result<T, E>;

/// Category of a failure reported to the UI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PermissionDenied,
    MediaUnavailable,
    NegotiationFailed,
    TransportRejected,
}

impl DeskError {
    /// The alert to show the agent, if this failure is user-visible at all.
    pub fn alert_kind(&self) -> Option<AlertKind> {
        match self {
            DeskError::PermissionDenied => Some(AlertKind::PermissionDenied),
            DeskError::MediaUnavailable(_) => Some(AlertKind::MediaUnavailable),
            DeskError::NegotiationFailed(_) => Some(AlertKind::NegotiationFailed),
            DeskError::TransportRejected(_) => Some(AlertKind::TransportRejected),
            _ => None,
        }
    }
}
