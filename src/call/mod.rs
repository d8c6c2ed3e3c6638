//! Call lifecycle of the agent desk: one active call at a time.
pub mod correlation;
pub mod cues;
pub mod director;
pub mod guard;
pub mod machine;
pub mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use correlation::{Classification, SessionIdentity};
pub use cues::{CallCues, SilentCues};
pub use director::{AnswerOutcome, SessionDirector, SessionDirectorBuilder, TransferOutcome};
pub use guard::{AnswerGuard, AnswerPermit};
pub use state::{AgentCallState, CallRecord, CallSnapshot};
pub use crate::presence::TransferKind;

#[cfg(test)]
mod tests;
