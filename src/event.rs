use crate::call::{AgentCallState, CallRecord};
use crate::error::AlertKind;
use crate::useragent::LinkStatus;
use serde::{Deserialize, Serialize};

/// Events published to the UI boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeskEvent {
    /// The call state changed
    StateChanged {
        state: AgentCallState,
        record: Option<CallRecord>,
        timestamp: u64,
    },
    /// Connectivity to the SIP service changed
    Link { status: LinkStatus, timestamp: u64 },
    /// A failure the agent must be told about
    Alert {
        kind: AlertKind,
        message: String,
        timestamp: u64,
    },
}

impl DeskEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            DeskEvent::StateChanged { timestamp, .. } => *timestamp,
            DeskEvent::Link { timestamp, .. } => *timestamp,
            DeskEvent::Alert { timestamp, .. } => *timestamp,
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<DeskEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<DeskEvent>;
