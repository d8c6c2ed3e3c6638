use crate::call::correlation::SessionIdentity;
use crate::call::machine::{transition, Effect, Input, Rejection, Signal};
use crate::call::state::{AgentCallState, CallRecord, CallSnapshot};
use crate::error::DeskError;
use crate::presence::{AgentStatus, PresenceEvent};
use crate::useragent::{Direction, SessionId};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn identity(call_id: &str) -> SessionIdentity {
    SessionIdentity {
        call_id: Some(call_id.to_string()),
        ..Default::default()
    }
}

fn record(call_id: &str, direction: Direction) -> CallRecord {
    CallRecord {
        call_id: call_id.to_string(),
        direction,
        counterparty_number: Some("5551234".to_string()),
        counterparty_name: Some("Alice".to_string()),
        customer_ref: Some("5551234".to_string()),
        started_at: Utc::now(),
        answered_at: None,
    }
}

fn offer(session_id: &str, call_id: &str) -> Input {
    Input::Offer {
        session_id: SessionId::from(session_id),
        identity: identity(call_id),
        record: record(call_id, Direction::Inbound),
    }
}

fn signal(session_id: &str, signal: Signal) -> Input {
    Input::Signal {
        session_id: SessionId::from(session_id),
        signal,
        at: Utc::now(),
    }
}

/// Apply `inputs` in order, failing on the first rejection.
fn run(inputs: &[Input]) -> CallSnapshot {
    inputs.iter().fold(CallSnapshot::default(), |snapshot, input| {
        transition(&snapshot, input)
            .unwrap_or_else(|e| panic!("{:?} rejected in {}: {:?}", input, snapshot.state, e))
            .next
    })
}

fn ringing() -> CallSnapshot {
    run(&[offer("s1", "X")])
}

fn established() -> CallSnapshot {
    run(&[
        offer("s1", "X"),
        Input::BeginAnswer {
            session_id: "s1".into(),
        },
        signal("s1", Signal::Accepted),
        signal("s1", Signal::Confirmed),
    ])
}

#[test]
fn test_offer_from_idle() {
    let step = transition(&CallSnapshot::default(), &offer("s1", "X")).unwrap();
    assert_eq!(step.next.state, AgentCallState::Ringing);
    assert_eq!(step.next.call_id(), Some("X"));
    assert_eq!(step.next.identity, Some(identity("X")));
    assert!(step.next.is_current(&"s1".into()));
    assert!(matches!(
        step.effects[0],
        Effect::Presence(PresenceEvent::CallRinging { ref record }) if record.call_id == "X"
    ));
    assert_eq!(step.effects[1], Effect::StartRinging);
}

#[test]
fn test_second_offer_is_refused() {
    for current in [ringing(), established()] {
        assert_eq!(
            transition(&current, &offer("s2", "Y")),
            Err(Rejection::Refused(DeskError::CallInProgress))
        );
    }
}

#[test]
fn test_answer_flow() {
    let current = ringing();
    let step = transition(
        &current,
        &Input::BeginAnswer {
            session_id: "s1".into(),
        },
    )
    .unwrap();
    assert_eq!(step.next.state, AgentCallState::Answering);
    assert!(step.effects.is_empty());

    let step = transition(&step.next, &signal("s1", Signal::Confirmed)).unwrap();
    assert_eq!(step.next.state, AgentCallState::Established);
    assert!(step.next.record.as_ref().unwrap().answered_at.is_some());
    assert!(step.effects.contains(&Effect::ReleaseAnswer("s1".into())));

    let step = transition(
        &step.next,
        &Input::Answered {
            session_id: "s1".into(),
        },
    )
    .unwrap();
    assert_eq!(step.next.state, AgentCallState::Established);
    assert_eq!(
        step.effects,
        vec![
            Effect::Presence(PresenceEvent::CallAnswered {
                call_id: "X".to_string()
            }),
            Effect::StopCues,
            Effect::ReleaseAnswer("s1".into()),
        ]
    );
}

#[test]
fn test_no_shortcut_from_idle_or_ringing_to_established() {
    let idle = CallSnapshot::default();
    assert_eq!(
        transition(&idle, &signal("s1", Signal::Confirmed)),
        Err(Rejection::Stale)
    );
    let current = ringing();
    let step = transition(&current, &signal("s1", Signal::Confirmed)).unwrap();
    assert_eq!(step.next.state, AgentCallState::Ringing);
}

#[test]
fn test_abort_answer_returns_to_ringing() {
    let answering = run(&[
        offer("s1", "X"),
        Input::BeginAnswer {
            session_id: "s1".into(),
        },
    ]);
    let step = transition(
        &answering,
        &Input::AbortAnswer {
            session_id: "s1".into(),
        },
    )
    .unwrap();
    assert_eq!(step.next.state, AgentCallState::Ringing);
    assert_eq!(step.effects, vec![Effect::ReleaseAnswer("s1".into())]);
    assert_eq!(step.next.record, answering.record);
}

#[test]
fn test_hold_unhold() {
    let current = established();
    let held = transition(&current, &Input::Hold).unwrap();
    assert_eq!(held.next.state, AgentCallState::Held);
    assert_eq!(
        held.effects,
        vec![Effect::Presence(PresenceEvent::CallHeld {
            call_id: "X".to_string()
        })]
    );
    let resumed = transition(&held.next, &Input::Unhold).unwrap();
    assert_eq!(resumed.next.state, AgentCallState::Established);
    assert_eq!(resumed.next.record, current.record);

    assert_eq!(
        transition(&ringing(), &Input::Hold),
        Err(Rejection::Refused(DeskError::InvalidState {
            state: AgentCallState::Ringing,
            action: "hold"
        }))
    );
    assert_eq!(
        transition(&CallSnapshot::default(), &Input::Unhold),
        Err(Rejection::Refused(DeskError::NoActiveCall))
    );
}

#[test]
fn test_end_clears_the_slot() {
    for current in [ringing(), established()] {
        let step = transition(&current, &signal("s1", Signal::Ended)).unwrap();
        assert_eq!(step.next.state, AgentCallState::Ended);
        assert!(step.next.record.is_none());
        assert!(step.next.identity.is_none());
        assert!(step.next.session_id.is_none());
        assert_eq!(
            step.effects,
            vec![
                Effect::Presence(PresenceEvent::CallDropped {
                    call_id: "X".to_string()
                }),
                Effect::StopCues,
                Effect::ReleaseAnswer("s1".into()),
                Effect::Presence(PresenceEvent::AgentStatus {
                    status: AgentStatus::Ready
                }),
            ]
        );
        let settled = transition(&step.next, &Input::Settle).unwrap();
        assert_eq!(settled.next, CallSnapshot::default());
    }
}

#[test]
fn test_events_of_other_sessions_are_stale() {
    let current = established();
    for signal_kind in [Signal::Ended, Signal::Failed, Signal::Confirmed] {
        assert_eq!(
            transition(&current, &signal("s2", signal_kind)),
            Err(Rejection::Stale)
        );
    }
    assert_eq!(
        transition(
            &current,
            &Input::Answered {
                session_id: "s2".into()
            }
        ),
        Err(Rejection::Stale)
    );
}

#[test]
fn test_answer_completion_after_hangup_is_ignored() {
    let answering = run(&[
        offer("s1", "X"),
        Input::BeginAnswer {
            session_id: "s1".into(),
        },
    ]);
    let ended = transition(&answering, &Input::Hangup).unwrap();
    assert!(ended.effects.contains(&Effect::ReleaseAnswer("s1".into())));
    let idle = transition(&ended.next, &Input::Settle).unwrap().next;
    assert_eq!(
        transition(
            &idle,
            &Input::Answered {
                session_id: "s1".into()
            }
        ),
        Err(Rejection::Stale)
    );
}

#[test]
fn test_dial_and_attach() {
    let dialing = transition(
        &CallSnapshot::default(),
        &Input::Dial {
            number: "5551234".to_string(),
        },
    )
    .unwrap()
    .next;
    assert_eq!(dialing.state, AgentCallState::Dialing);
    assert_eq!(dialing.pending_dial.as_deref(), Some("5551234"));
    assert!(!dialing.has_call());

    assert_eq!(
        transition(
            &dialing,
            &Input::Dial {
                number: "1".to_string()
            }
        ),
        Err(Rejection::Refused(DeskError::CallInProgress))
    );

    let attach = Input::Attach {
        session_id: "o1".into(),
        identity: identity("o1"),
        record: record("o1", Direction::Outbound),
    };
    let attached = transition(&dialing, &attach).unwrap().next;
    assert_eq!(attached.state, AgentCallState::Dialing);
    assert!(attached.pending_dial.is_none());
    assert_eq!(attached.call_id(), Some("o1"));
    assert!(transition(&attached, &attach).is_err());

    let answering = transition(&attached, &signal("o1", Signal::Accepted)).unwrap();
    assert_eq!(answering.next.state, AgentCallState::Answering);
    assert_eq!(answering.effects, vec![Effect::StopCues]);
    let up = transition(&answering.next, &signal("o1", Signal::Confirmed)).unwrap();
    assert_eq!(up.next.state, AgentCallState::Established);
}

#[test]
fn test_abandon_unattached_dial() {
    let dialing = run(&[Input::Dial {
        number: "5551234".to_string(),
    }]);
    let step = transition(&dialing, &Input::Abandon).unwrap();
    assert_eq!(step.next.state, AgentCallState::Ended);
    assert!(step.next.pending_dial.is_none());
    assert_eq!(
        step.effects,
        vec![
            Effect::StopCues,
            Effect::Presence(PresenceEvent::AgentStatus {
                status: AgentStatus::Ready
            }),
        ]
    );
    assert_eq!(transition(&ringing(), &Input::Abandon), Err(Rejection::Stale));
}

#[test]
fn test_hangup() {
    assert_eq!(
        transition(&CallSnapshot::default(), &Input::Hangup),
        Err(Rejection::Refused(DeskError::NoActiveCall))
    );
    let step = transition(&established(), &Input::Hangup).unwrap();
    assert_eq!(step.next.state, AgentCallState::Ended);
    assert_eq!(
        step.effects.first(),
        Some(&Effect::Presence(PresenceEvent::CallDropped {
            call_id: "X".to_string()
        }))
    );
}

/// Seeded random input sequences never produce more than one record, and a
/// record always comes with its identity and session.
#[test]
fn test_single_record_under_random_interleavings() {
    let mut rng = StdRng::seed_from_u64(0x5eed_1234_abcd_0001);
    let sessions = ["s1", "s2", "s3"];
    for _ in 0..200 {
        let mut snapshot = CallSnapshot::default();
        for _ in 0..40 {
            let session = sessions[rng.random_range(0..sessions.len())];
            let input = match rng.random_range(0..12) {
                0 | 1 => offer(session, session),
                2 => Input::BeginAnswer {
                    session_id: session.into(),
                },
                3 => Input::AbortAnswer {
                    session_id: session.into(),
                },
                4 => Input::Answered {
                    session_id: session.into(),
                },
                5 => signal(session, Signal::Accepted),
                6 => signal(session, Signal::Confirmed),
                7 => signal(session, Signal::Ended),
                8 => Input::Hold,
                9 => Input::Unhold,
                10 => Input::Hangup,
                _ => Input::Dial {
                    number: "5551234".to_string(),
                },
            };
            if let Ok(step) = transition(&snapshot, &input) {
                snapshot = step.next;
                if snapshot.state == AgentCallState::Ended {
                    snapshot = transition(&snapshot, &Input::Settle).unwrap().next;
                }
            }
            assert_eq!(snapshot.record.is_some(), snapshot.identity.is_some());
            assert_eq!(snapshot.record.is_some(), snapshot.session_id.is_some());
            if snapshot.state == AgentCallState::Idle {
                assert!(!snapshot.has_call());
            }
        }
    }
}
