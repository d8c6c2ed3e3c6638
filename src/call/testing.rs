//! In-memory harness for the desk core.
//!
//! Provides scripted stand-ins for every collaborator of
//! [`SessionDirector`]: sessions, the signaling transport, the microphone,
//! the presence backend and the audio cues. [`DeskHarness`] wires them into a
//! running director so tests can drive it with transport events.
//!
//! ```rust,ignore
//! let desk = DeskHarness::start();
//! let s1 = MockSession::inbound("s1").with_call_id("X").into_ref();
//! desk.offer(&s1).await;
//! assert_eq!(desk.director.snapshot().state, AgentCallState::Ringing);
//! desk.director.answer().await?;
//! desk.signal(&s1, SessionEvent::Confirmed).await;
//! ```
use super::cues::CallCues;
use super::director::{SessionDirector, SessionDirectorBuilder};
use crate::config::Config;
use crate::media::{CaptureError, LocalMediaStream, LocalStreamRef, MediaConstraints, MicrophoneSource};
use crate::negotiation::{CallOptions, NegotiationOptions, RtcConfiguration, SdpRewriter};
use crate::presence::{PresenceEvent, PresenceSync};
use crate::useragent::{
    DialTarget, Direction, RemoteIdentity, Session, SessionEvent, SessionId, SessionStatus,
    SignalingRequest, SignalingTransport, SipConfig, TerminateReason, TransportEvent,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Local SDP answer used by [`MockSession`], advertises trickle ICE.
pub const TRICKLE_SDP: &str = "v=0\r\n\
o=- 20518 0 IN IP4 192.168.1.10\r\n\
s=-\r\n\
t=0 0\r\n\
a=ice-options:trickle\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=candidate:1 1 udp 2122260223 192.168.1.10 54400 typ host\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=sendrecv\r\n";

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug)]
pub struct FakeStream {
    id: String,
    active: AtomicBool,
}

impl FakeStream {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            active: AtomicBool::new(true),
        })
    }
}

impl LocalMediaStream for FakeStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MicrophoneState {
    opens: AtomicUsize,
    deny: AtomicBool,
    unavailable: AtomicBool,
    streams: Mutex<Vec<Arc<FakeStream>>>,
}

/// Microphone that grants access unless told otherwise. Clones share state.
#[derive(Clone, Default)]
pub struct FakeMicrophone {
    state: Arc<MicrophoneState>,
}

impl FakeMicrophone {
    /// Every prompt is refused
    pub fn denying() -> Self {
        let microphone = Self::default();
        microphone.state.deny.store(true, Ordering::SeqCst);
        microphone
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of permission prompts shown
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> Vec<Arc<FakeStream>> {
        self.state.streams.lock().unwrap().clone()
    }
}

#[async_trait]
impl MicrophoneSource for FakeMicrophone {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStreamRef, CaptureError> {
        if !constraints.audio {
            return Err(CaptureError::Unavailable("audio not requested".to_string()));
        }
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(CaptureError::Unavailable("no capture device".to_string()));
        }
        let n = self.state.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if self.state.deny.load(Ordering::SeqCst) {
            return Err(CaptureError::NotAllowed("permission dismissed".to_string()));
        }
        let stream = FakeStream::new(&format!("mic-{}", n));
        self.state.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

/// Scripted signaling dialog.
pub struct MockSession {
    id: SessionId,
    direction: Direction,
    status: Mutex<SessionStatus>,
    remote: RemoteIdentity,
    request: Option<SignalingRequest>,
    local_sdp: String,
    answer_failure: Option<String>,
    answer_latch: Option<Arc<Notify>>,
    options: Mutex<NegotiationOptions>,
    peer: Mutex<Option<RtcConfiguration>>,
    rewriter: Mutex<Option<SdpRewriter>>,
    answers: Mutex<Vec<CallOptions>>,
    terminations: Mutex<Vec<TerminateReason>>,
    refers: Mutex<Vec<String>>,
    holds: AtomicUsize,
    unholds: AtomicUsize,
    sent_sdp: Mutex<Vec<String>>,
}

impl MockSession {
    fn new(id: &str, direction: Direction, status: SessionStatus) -> Self {
        Self {
            id: SessionId::from(id),
            direction,
            status: Mutex::new(status),
            remote: RemoteIdentity::default(),
            request: Some(SignalingRequest::new(id)),
            local_sdp: TRICKLE_SDP.to_string(),
            answer_failure: None,
            answer_latch: None,
            options: Mutex::new(NegotiationOptions::default()),
            peer: Mutex::new(None),
            rewriter: Mutex::new(None),
            answers: Mutex::new(Vec::new()),
            terminations: Mutex::new(Vec::new()),
            refers: Mutex::new(Vec::new()),
            holds: AtomicUsize::new(0),
            unholds: AtomicUsize::new(0),
            sent_sdp: Mutex::new(Vec::new()),
        }
    }

    /// Incoming INVITE from `5551234`, its `Call-ID` equals `id`
    pub fn inbound(id: &str) -> Self {
        Self::new(id, Direction::Inbound, SessionStatus::InviteReceived)
            .with_remote(Some("5551234"), Some("Alice"))
    }

    pub fn outbound(id: &str) -> Self {
        Self::new(id, Direction::Outbound, SessionStatus::InviteSent)
    }

    pub fn with_request(mut self, request: SignalingRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn without_request(mut self) -> Self {
        self.request = None;
        self
    }

    pub fn with_call_id(mut self, call_id: &str) -> Self {
        let mut request = self.request.take().unwrap_or_default();
        request.call_id = Some(call_id.to_string());
        self.request = Some(request);
        self
    }

    pub fn with_remote(mut self, user: Option<&str>, display_name: Option<&str>) -> Self {
        self.remote = RemoteIdentity {
            user: user.map(String::from),
            display_name: display_name.map(String::from),
        };
        self
    }

    pub fn with_status(self, status: SessionStatus) -> Self {
        *self.status.lock().unwrap() = status;
        self
    }

    pub fn with_local_sdp(mut self, sdp: &str) -> Self {
        self.local_sdp = sdp.to_string();
        self
    }

    /// `answer` fails with `reason`
    pub fn failing_answer(mut self, reason: &str) -> Self {
        self.answer_failure = Some(reason.to_string());
        self
    }

    /// `answer` blocks until `latch` is notified
    pub fn with_answer_latch(mut self, latch: Arc<Notify>) -> Self {
        self.answer_latch = Some(latch);
        self
    }

    pub fn into_ref(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn attach_peer_connection(&self, configuration: RtcConfiguration) {
        *self.peer.lock().unwrap() = Some(configuration);
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn answers(&self) -> Vec<CallOptions> {
        self.answers.lock().unwrap().clone()
    }

    pub fn terminations(&self) -> Vec<TerminateReason> {
        self.terminations.lock().unwrap().clone()
    }

    pub fn refers(&self) -> Vec<String> {
        self.refers.lock().unwrap().clone()
    }

    pub fn hold_count(&self) -> usize {
        self.holds.load(Ordering::SeqCst)
    }

    pub fn unhold_count(&self) -> usize {
        self.unholds.load(Ordering::SeqCst)
    }

    /// Local SDP bodies as they left the session
    pub fn sent_sdp(&self) -> Vec<String> {
        self.sent_sdp.lock().unwrap().clone()
    }

    fn send_local_sdp(&self) -> String {
        let rewriter = self.rewriter.lock().unwrap().clone();
        let sdp = match rewriter {
            Some(rewrite) => rewrite(&self.local_sdp),
            None => self.local_sdp.clone(),
        };
        self.sent_sdp.lock().unwrap().push(sdp.clone());
        sdp
    }
}

#[async_trait]
impl Session for MockSession {
    fn id(&self) -> SessionId {
        self.id.clone()
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap()
    }

    fn remote_identity(&self) -> RemoteIdentity {
        self.remote.clone()
    }

    fn request(&self) -> Option<SignalingRequest> {
        self.request.clone()
    }

    fn negotiation_options(&self) -> NegotiationOptions {
        self.options.lock().unwrap().clone()
    }

    fn set_negotiation_options(&self, options: NegotiationOptions) {
        *self.options.lock().unwrap() = options;
    }

    fn peer_configuration(&self) -> Option<RtcConfiguration> {
        self.peer.lock().unwrap().clone()
    }

    fn set_peer_configuration(&self, configuration: RtcConfiguration) -> Result<()> {
        let mut peer = self.peer.lock().unwrap();
        if peer.is_none() {
            return Err(anyhow!("no peer connection attached"));
        }
        *peer = Some(configuration);
        Ok(())
    }

    fn set_sdp_rewriter(&self, rewriter: SdpRewriter) {
        *self.rewriter.lock().unwrap() = Some(rewriter);
    }

    async fn answer(&self, options: CallOptions) -> Result<()> {
        if let Some(latch) = &self.answer_latch {
            latch.notified().await;
        }
        self.answers.lock().unwrap().push(options);
        if let Some(reason) = &self.answer_failure {
            return Err(anyhow!("{}", reason));
        }
        self.send_local_sdp();
        self.set_status(SessionStatus::Answered);
        Ok(())
    }

    async fn terminate(&self, reason: TerminateReason) -> Result<()> {
        self.terminations.lock().unwrap().push(reason);
        self.set_status(SessionStatus::Terminated);
        Ok(())
    }

    async fn hold(&self) -> Result<()> {
        self.holds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unhold(&self) -> Result<()> {
        self.unholds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refer(&self, target: &str) -> Result<()> {
        self.refers.lock().unwrap().push(target.to_string());
        Ok(())
    }
}

/// Records outbound calls and creates the matching outbound session, which
/// sends its offer through the rewriter carried by the call options.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<(DialTarget, CallOptions)>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    offers: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
}

impl MockTransport {
    pub fn fail_calls(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<(DialTarget, CallOptions)> {
        self.calls.lock().unwrap().clone()
    }

    /// Offers sent by outbound calls, as they went on the wire
    pub fn offers(&self) -> Vec<String> {
        self.offers.lock().unwrap().clone()
    }

    /// Outbound session created by the last successful call
    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn call(&self, target: &DialTarget, options: CallOptions) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((target.clone(), options.clone()));
        if let Some(reason) = self.failure.lock().unwrap().clone() {
            return Err(anyhow!("{}", reason));
        }
        let session = MockSession::outbound(&Uuid::new_v4().to_string())
            .with_remote(Some(&target.user), None)
            .into_ref();
        session.set_negotiation_options(options.negotiation);
        session.set_sdp_rewriter(options.sdp_rewriter);
        let offer = session.send_local_sdp();
        self.offers.lock().unwrap().push(offer);
        self.sessions.lock().unwrap().push(session);
        Ok(())
    }
}

/// Presence backend that keeps every notification, optionally failing them.
#[derive(Default)]
pub struct RecordingPresence {
    events: Mutex<Vec<PresenceEvent>>,
    fail: bool,
}

impl RecordingPresence {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<PresenceEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl PresenceSync for RecordingPresence {
    async fn notify(&self, event: &PresenceEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        if self.fail {
            return Err(anyhow!("backend unavailable"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingCues {
    rings: AtomicUsize,
    stops: AtomicUsize,
    ringing: AtomicBool,
}

impl RecordingCues {
    pub fn rings(&self) -> usize {
        self.rings.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_ringing(&self) -> bool {
        self.ringing.load(Ordering::SeqCst)
    }
}

impl CallCues for RecordingCues {
    fn start_ringing(&self) {
        self.rings.fetch_add(1, Ordering::SeqCst);
        self.ringing.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.ringing.store(false, Ordering::SeqCst);
    }
}

/// A running [`SessionDirector`] wired to the fakes above.
pub struct DeskHarness {
    pub director: Arc<SessionDirector>,
    pub transport: Arc<MockTransport>,
    pub microphone: FakeMicrophone,
    pub presence: Arc<RecordingPresence>,
    pub cues: Arc<RecordingCues>,
}

impl DeskHarness {
    /// Agent `agent1` at `pbx.example.com:5061`
    pub fn config() -> Config {
        Config {
            sip: SipConfig {
                username: "agent1".to_string(),
                password: "secret".to_string(),
                domain: "pbx.example.com:5061".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn start() -> Self {
        Self::with_microphone(FakeMicrophone::default())
    }

    pub fn with_microphone(microphone: FakeMicrophone) -> Self {
        let transport = Arc::new(MockTransport::default());
        let presence = Arc::new(RecordingPresence::default());
        let cues = Arc::new(RecordingCues::default());
        let director = SessionDirectorBuilder::new()
            .with_config(Self::config())
            .with_transport(transport.clone())
            .with_microphone(Box::new(microphone.clone()))
            .with_presence(presence.clone())
            .with_cues(cues.clone())
            .build()
            .expect("failed to build session director");
        Self {
            director,
            transport,
            microphone,
            presence,
            cues,
        }
    }

    pub async fn offer(&self, session: &Arc<MockSession>) {
        self.director
            .handle(TransportEvent::NewSession(session.clone()))
            .await;
    }

    pub async fn signal(&self, session: &MockSession, event: SessionEvent) {
        self.director
            .handle(TransportEvent::Session {
                session_id: session.id(),
                event,
            })
            .await;
    }

    /// Wait until at least `count` presence notifications were delivered.
    pub async fn presence_events(&self, count: usize) -> Vec<PresenceEvent> {
        let presence = self.presence.clone();
        wait_for(Duration::from_secs(1), || presence.events().len() >= count).await;
        self.presence.events()
    }
}
