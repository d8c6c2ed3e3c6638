//! The call state machine as a single pure function.
//!
//! [`transition`] maps the current [`CallSnapshot`] and one [`Input`] to the
//! next snapshot plus the side effects the director has to run. It performs
//! no I/O, so every transition can be exercised without a transport.
use super::correlation::SessionIdentity;
use super::state::{AgentCallState, CallRecord, CallSnapshot};
use crate::error::DeskError;
use crate::presence::{AgentStatus, PresenceEvent};
use crate::useragent::{Direction, SessionId};
use chrono::{DateTime, Utc};

/// Session lifecycle signals relevant to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Progress,
    Accepted,
    Confirmed,
    Ended,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Inbound session accepted into the empty slot
    Offer {
        session_id: SessionId,
        identity: SessionIdentity,
        record: CallRecord,
    },
    /// The agent dials a number
    Dial { number: String },
    /// Outbound session created by the pending dial
    Attach {
        session_id: SessionId,
        identity: SessionIdentity,
        record: CallRecord,
    },
    BeginAnswer { session_id: SessionId },
    /// The answer could not start (no microphone)
    AbortAnswer { session_id: SessionId },
    /// The answer exchange completed
    Answered { session_id: SessionId },
    Signal {
        session_id: SessionId,
        signal: Signal,
        at: DateTime<Utc>,
    },
    Hold,
    Unhold,
    Hangup,
    /// The dial never produced a session
    Abandon,
    /// Leave `Ended` for `Idle`
    Settle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Presence(PresenceEvent),
    StartRinging,
    StopCues,
    ReleaseAnswer(SessionId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub next: CallSnapshot,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// The input refers to a session or a phase that is no longer current
    Stale,
    /// The operation is not allowed in the current state
    Refused(DeskError),
}

impl Step {
    fn to(next: CallSnapshot) -> Self {
        Self {
            next,
            effects: Vec::new(),
        }
    }

    fn with(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

fn refused(current: &CallSnapshot, action: &'static str) -> Rejection {
    if current.state == AgentCallState::Idle {
        Rejection::Refused(DeskError::NoActiveCall)
    } else {
        Rejection::Refused(DeskError::InvalidState {
            state: current.state,
            action,
        })
    }
}

fn with_state(current: &CallSnapshot, state: AgentCallState) -> CallSnapshot {
    CallSnapshot {
        state,
        ..current.clone()
    }
}

/// Enter `Ended`: clear the slot, stop cues, release the guard and put the
/// agent back to ready.
fn end_call(current: &CallSnapshot) -> Step {
    let mut step = Step::to(CallSnapshot {
        state: AgentCallState::Ended,
        ..CallSnapshot::default()
    });
    if let Some(call_id) = current.call_id() {
        step = step.with(Effect::Presence(PresenceEvent::CallDropped {
            call_id: call_id.to_string(),
        }));
    }
    step = step.with(Effect::StopCues);
    if let Some(session_id) = &current.session_id {
        step = step.with(Effect::ReleaseAnswer(session_id.clone()));
    }
    step.with(Effect::Presence(PresenceEvent::AgentStatus {
        status: AgentStatus::Ready,
    }))
}

fn answered(current: &CallSnapshot) -> Option<PresenceEvent> {
    current.call_id().map(|call_id| PresenceEvent::CallAnswered {
        call_id: call_id.to_string(),
    })
}

pub fn transition(current: &CallSnapshot, input: &Input) -> Result<Step, Rejection> {
    use AgentCallState::*;

    match input {
        Input::Offer {
            session_id,
            identity,
            record,
        } => {
            if current.state != Idle {
                return Err(Rejection::Refused(DeskError::CallInProgress));
            }
            let next = CallSnapshot {
                state: Ringing,
                record: Some(record.clone()),
                identity: Some(identity.clone()),
                session_id: Some(session_id.clone()),
                pending_dial: None,
            };
            Ok(Step::to(next)
                .with(Effect::Presence(PresenceEvent::CallRinging {
                    record: record.clone(),
                }))
                .with(Effect::StartRinging))
        }
        Input::Dial { number } => {
            if current.state != Idle {
                return Err(Rejection::Refused(DeskError::CallInProgress));
            }
            Ok(Step::to(CallSnapshot {
                state: Dialing,
                pending_dial: Some(number.clone()),
                ..CallSnapshot::default()
            }))
        }
        Input::Attach {
            session_id,
            identity,
            record,
        } => {
            if current.state != Dialing || current.session_id.is_some() {
                return Err(Rejection::Refused(DeskError::CallInProgress));
            }
            Ok(Step::to(CallSnapshot {
                state: Dialing,
                record: Some(record.clone()),
                identity: Some(identity.clone()),
                session_id: Some(session_id.clone()),
                pending_dial: None,
            }))
        }
        Input::BeginAnswer { session_id } => {
            if !current.is_current(session_id) {
                return Err(Rejection::Stale);
            }
            match current.state {
                Ringing | Dialing => Ok(Step::to(with_state(current, Answering))),
                _ => Err(refused(current, "answer")),
            }
        }
        Input::AbortAnswer { session_id } => {
            if !current.is_current(session_id) || current.state != Answering {
                return Err(Rejection::Stale);
            }
            let back = match current.record.as_ref().map(|record| record.direction) {
                Some(Direction::Outbound) => Dialing,
                _ => Ringing,
            };
            Ok(Step::to(with_state(current, back))
                .with(Effect::ReleaseAnswer(session_id.clone())))
        }
        Input::Answered { session_id } => {
            if !current.is_current(session_id) || !matches!(current.state, Answering | Established)
            {
                return Err(Rejection::Stale);
            }
            let mut step = Step::to(current.clone());
            if let Some(event) = answered(current) {
                step = step.with(Effect::Presence(event));
            }
            Ok(step
                .with(Effect::StopCues)
                .with(Effect::ReleaseAnswer(session_id.clone())))
        }
        Input::Signal {
            session_id,
            signal,
            at,
        } => {
            if !current.is_current(session_id) {
                return Err(Rejection::Stale);
            }
            match (signal, current.state) {
                (Signal::Ended | Signal::Failed, _) => Ok(end_call(current)),
                (Signal::Accepted, Ringing | Dialing | Answering) => {
                    Ok(Step::to(with_state(current, Answering)).with(Effect::StopCues))
                }
                (Signal::Confirmed, Answering) => {
                    let mut next = with_state(current, Established);
                    if let Some(record) = next.record.as_mut() {
                        record.answered_at.get_or_insert(*at);
                    }
                    Ok(Step::to(next)
                        .with(Effect::StopCues)
                        .with(Effect::ReleaseAnswer(session_id.clone())))
                }
                _ => Ok(Step::to(current.clone())),
            }
        }
        Input::Hold => match current.state {
            Established => {
                let step = Step::to(with_state(current, Held));
                Ok(match current.call_id() {
                    Some(call_id) => step.with(Effect::Presence(PresenceEvent::CallHeld {
                        call_id: call_id.to_string(),
                    })),
                    None => step,
                })
            }
            _ => Err(refused(current, "hold")),
        },
        Input::Unhold => match current.state {
            Held => {
                let step = Step::to(with_state(current, Established));
                Ok(match current.call_id() {
                    Some(call_id) => step.with(Effect::Presence(PresenceEvent::CallUnheld {
                        call_id: call_id.to_string(),
                    })),
                    None => step,
                })
            }
            _ => Err(refused(current, "unhold")),
        },
        Input::Hangup => match current.state {
            Idle => Err(Rejection::Refused(DeskError::NoActiveCall)),
            Ended => Err(Rejection::Stale),
            _ => Ok(end_call(current)),
        },
        Input::Abandon => {
            if current.state != Dialing || current.session_id.is_some() {
                return Err(Rejection::Stale);
            }
            Ok(end_call(current))
        }
        Input::Settle => {
            if current.state != Ended {
                return Err(Rejection::Stale);
            }
            Ok(Step::to(CallSnapshot::default()))
        }
    }
}
