use super::correlation::SessionIdentity;
use crate::useragent::{Direction, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCallState {
    #[default]
    Idle,
    Ringing,
    Dialing,
    Answering,
    Established,
    Held,
    Ended,
}

impl AgentCallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentCallState::Idle => "idle",
            AgentCallState::Ringing => "ringing",
            AgentCallState::Dialing => "dialing",
            AgentCallState::Answering => "answering",
            AgentCallState::Established => "established",
            AgentCallState::Held => "held",
            AgentCallState::Ended => "ended",
        }
    }

    /// A call is up and media flows (or is held).
    pub fn is_connected(&self) -> bool {
        matches!(self, AgentCallState::Established | AgentCallState::Held)
    }
}

impl fmt::Display for AgentCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single active call, as shown to the agent and reported to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub direction: Direction,
    pub counterparty_number: Option<String>,
    pub counterparty_name: Option<String>,
    /// Provider reference of the customer leg, used for CRM lookups
    pub customer_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
}

/// Immutable view of the desk, replaced as a whole on every transition.
///
/// `record`, `identity` and `session_id` are either all set or all empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSnapshot {
    pub state: AgentCallState,
    pub record: Option<CallRecord>,
    pub identity: Option<SessionIdentity>,
    pub session_id: Option<SessionId>,
    /// Number dialed by the agent, until the outbound session is attached
    pub pending_dial: Option<String>,
}

impl CallSnapshot {
    pub fn has_call(&self) -> bool {
        self.record.is_some()
    }

    pub fn is_current(&self, session_id: &SessionId) -> bool {
        self.session_id.as_ref() == Some(session_id)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.record.as_ref().map(|record| record.call_id.as_str())
    }
}
