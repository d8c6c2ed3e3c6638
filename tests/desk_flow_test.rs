#[cfg(test)]
mod desk_flow_tests {
    use deskphone::call::testing::{wait_for, DeskHarness, FakeMicrophone, MockSession};
    use deskphone::call::{AgentCallState, AnswerGuard, AnswerOutcome};
    use deskphone::config::Config;
    use deskphone::negotiation::strip_trickle;
    use deskphone::useragent::{SessionEvent, SessionId};
    use deskphone::DeskError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_inbound_call_with_renegotiation() {
        let desk = DeskHarness::start();

        let s1 = MockSession::inbound("s1").with_call_id("X").into_ref();
        desk.offer(&s1).await;
        let snapshot = desk.director.snapshot();
        assert_eq!(snapshot.state, AgentCallState::Ringing);
        assert_eq!(snapshot.call_id(), Some("X"));

        assert_eq!(
            desk.director.answer().await.unwrap(),
            AnswerOutcome::Answered
        );
        desk.signal(&s1, SessionEvent::Accepted).await;
        desk.signal(&s1, SessionEvent::Confirmed).await;
        assert_eq!(desk.director.snapshot().state, AgentCallState::Established);
        let record = desk.director.snapshot().record;

        let s2 = MockSession::inbound("s2").with_call_id("X").into_ref();
        desk.offer(&s2).await;
        let renegotiated = s2.clone();
        assert!(wait_for(Duration::from_secs(1), || renegotiated.answers().len() == 1).await);
        assert_eq!(desk.director.snapshot().record, record);
        assert_eq!(desk.director.snapshot().state, AgentCallState::Established);
        for sdp in s1.sent_sdp().iter().chain(s2.sent_sdp().iter()) {
            assert!(!sdp.contains("a=ice-options:trickle"));
        }

        desk.signal(&s1, SessionEvent::Ended { cause: None }).await;
        let snapshot = desk.director.snapshot();
        assert_eq!(snapshot.state, AgentCallState::Idle);
        assert!(snapshot.record.is_none());
        assert!(snapshot.identity.is_none());
        desk.director.shutdown().await;
    }

    #[tokio::test]
    async fn test_dial_target_uses_sanitized_domain() {
        let desk = DeskHarness::start();
        let target = desk.director.dial("5551234").await.unwrap();
        assert_eq!(target.to_string(), "5551234@pbx.example.com");
        assert_eq!(desk.director.snapshot().state, AgentCallState::Dialing);
        assert_eq!(desk.transport.calls()[0].0, target);
        assert!(!desk.transport.offers()[0].contains("a=ice-options:trickle"));
        desk.director.shutdown().await;
    }

    #[tokio::test]
    async fn test_permission_denial_is_sticky() {
        let desk = DeskHarness::with_microphone(FakeMicrophone::denying());
        let s1 = MockSession::inbound("s1").into_ref();
        desk.offer(&s1).await;

        assert_eq!(
            desk.director.answer().await.unwrap_err(),
            DeskError::PermissionDenied
        );
        assert_eq!(desk.director.snapshot().state, AgentCallState::Ringing);
        assert_eq!(
            desk.director.answer().await.unwrap_err(),
            DeskError::PermissionDenied
        );
        assert_eq!(desk.microphone.opens(), 1);
        assert!(s1.answers().is_empty());
    }

    #[test]
    fn test_answer_guard_fails_closed() {
        let guard = AnswerGuard::new();
        let s1 = SessionId::from("s1");
        let s2 = SessionId::from("s2");
        assert!(guard.try_begin_answer(&s1));
        assert!(!guard.try_begin_answer(&s1));
        assert!(!guard.try_begin_answer(&s2));
        guard.end_answer(&s1);
        guard.end_answer(&s1);
        assert!(guard.try_begin_answer(&s2));
    }

    #[test]
    fn test_default_config_policy() {
        let config = Config::default();
        let policy = config.policy();
        assert_eq!(
            policy.ice_servers()[0].urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
        let sdp = "v=0\r\na=ice-options:trickle\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
        assert_eq!(strip_trickle(sdp), "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
    }
}
