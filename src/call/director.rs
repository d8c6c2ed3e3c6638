use super::correlation::{correlate, derive_identity, Classification, SessionIdentity};
use super::cues::{CallCues, SilentCues};
use super::guard::AnswerGuard;
use super::machine::{transition, Effect, Input, Rejection, Signal};
use super::state::{AgentCallState, CallRecord, CallSnapshot};
use crate::config::Config;
use crate::error::{DeskError, Result};
use crate::event::{DeskEvent, EventReceiver, EventSender};
use crate::get_timestamp;
use crate::media::{MediaGate, MicrophoneSource};
use crate::negotiation::NegotiationPolicy;
use crate::presence::{
    create_presence_sync, AgentStatus, PresenceDispatcher, PresenceEvent, PresenceSync,
    TransferKind,
};
use crate::useragent::{
    DialTarget, Direction, LinkStatus, RegistrationEvent, Session, SessionEvent, SessionId,
    SessionRef, SignalingTransport, SipConfig, TerminateReason, TransportEvent,
    TransportEventReceiver,
};
use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    select,
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Answered,
    /// Another answer is running, this trigger was dropped
    AlreadyInProgress,
    /// The session already ended or was answered
    NotAnswerable,
    /// The call ended while the answer was in flight
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// A REFER was sent to the target
    Referred(DialTarget),
    /// Only the backend was told about the transfer
    NotifiedOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Primary,
    Renegotiation,
    Parallel,
}

struct Tracked {
    session: SessionRef,
    role: Role,
}

pub struct SessionDirectorBuilder {
    config: Option<Config>,
    transport: Option<Arc<dyn SignalingTransport>>,
    microphone: Option<Box<dyn MicrophoneSource>>,
    presence: Option<Arc<dyn PresenceSync>>,
    cues: Option<Arc<dyn CallCues>>,
    cancel_token: Option<CancellationToken>,
}

impl SessionDirectorBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            transport: None,
            microphone: None,
            presence: None,
            cues: None,
            cancel_token: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_microphone(mut self, microphone: Box<dyn MicrophoneSource>) -> Self {
        self.microphone = Some(microphone);
        self
    }

    pub fn with_presence(mut self, presence: Arc<dyn PresenceSync>) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn with_cues(mut self, cues: Arc<dyn CallCues>) -> Self {
        self.cues = Some(cues);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Must be called from within a tokio runtime: the presence worker is
    /// started here.
    pub fn build(self) -> anyhow::Result<Arc<SessionDirector>> {
        let config = self.config.unwrap_or_default();
        let transport = self
            .transport
            .ok_or_else(|| anyhow::anyhow!("signaling transport is required"))?;
        let microphone = self
            .microphone
            .ok_or_else(|| anyhow::anyhow!("microphone source is required"))?;
        let presence = match self.presence {
            Some(presence) => presence,
            None => create_presence_sync(config.presence.as_ref())?,
        };
        let cues = self.cues.unwrap_or_else(|| Arc::new(SilentCues));
        let cancel_token = self.cancel_token.unwrap_or_default();

        let (presence, presence_worker) =
            PresenceDispatcher::start(presence, cancel_token.child_token());
        let (events, _) = broadcast::channel(64);
        let (state, _) = watch::channel(CallSnapshot::default());

        info!(
            account = config.sip.account_uri(),
            correlation_header = config.correlation_header,
            "session director ready"
        );
        Ok(Arc::new(SessionDirector {
            policy: config.policy(),
            sip: config.sip,
            correlation_header: config.correlation_header,
            transport,
            media: Arc::new(MediaGate::new(microphone)),
            guard: Arc::new(AnswerGuard::new()),
            cues,
            presence,
            presence_worker: Mutex::new(Some(presence_worker)),
            state,
            events,
            link: Mutex::new(LinkStatus::default()),
            sessions: Mutex::new(HashMap::new()),
            cancel_token,
        }))
    }
}

/// Owns the single active-call slot and turns transport events and agent
/// actions into transitions of [`CallSnapshot`].
pub struct SessionDirector {
    sip: SipConfig,
    correlation_header: String,
    policy: NegotiationPolicy,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<MediaGate>,
    guard: Arc<AnswerGuard>,
    cues: Arc<dyn CallCues>,
    presence: PresenceDispatcher,
    presence_worker: Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<CallSnapshot>,
    events: EventSender,
    link: Mutex<LinkStatus>,
    sessions: Mutex<HashMap<SessionId, Tracked>>,
    cancel_token: CancellationToken,
}

fn rejection_error(rejection: Rejection) -> DeskError {
    match rejection {
        Rejection::Refused(e) => e,
        Rejection::Stale => DeskError::NoActiveCall,
    }
}

impl SessionDirector {
    pub fn snapshot(&self) -> CallSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallSnapshot> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Session holding the answer guard, if an answer is in flight
    pub fn answering(&self) -> Option<SessionId> {
        self.guard.owner()
    }

    pub async fn link_status(&self) -> LinkStatus {
        *self.link.lock().await
    }

    /// Consume transport events until the stream closes or the director is
    /// cancelled.
    pub async fn serve(&self, mut receiver: TransportEventReceiver) -> anyhow::Result<()> {
        let token = self.cancel_token.child_token();
        loop {
            select! {
                _ = token.cancelled() => {
                    info!("session director cancelled");
                    break;
                }
                event = receiver.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        info!("transport event stream closed");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    pub async fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::NewSession(session) => self.on_new_session(session).await,
            TransportEvent::Session { session_id, event } => {
                self.on_session_event(session_id, event).await
            }
            TransportEvent::Registration(event) => self.on_registration(event).await,
        }
    }

    /// Run `input` through the state machine and apply the resulting step.
    fn dispatch(&self, input: Input) -> std::result::Result<CallSnapshot, Rejection> {
        let mut outcome = Err(Rejection::Stale);
        let mut previous = AgentCallState::Idle;
        self.state.send_if_modified(|current| {
            previous = current.state;
            match transition(current, &input) {
                Ok(step) => {
                    let modified = step.next != *current;
                    *current = step.next.clone();
                    outcome = Ok(step);
                    modified
                }
                Err(rejection) => {
                    outcome = Err(rejection);
                    false
                }
            }
        });
        let step = outcome?;
        for effect in step.effects {
            self.run_effect(effect);
        }
        if step.next.state != previous {
            info!(from = %previous, to = %step.next.state, call_id = ?step.next.call_id(), "call state changed");
            self.publish(DeskEvent::StateChanged {
                state: step.next.state,
                record: step.next.record.clone(),
                timestamp: get_timestamp(),
            });
        }
        if step.next.state == AgentCallState::Ended {
            return self.dispatch(Input::Settle);
        }
        Ok(step.next)
    }

    fn run_effect(&self, effect: Effect) {
        match effect {
            Effect::Presence(event) => self.presence.send(event),
            Effect::StartRinging => self.cues.start_ringing(),
            Effect::StopCues => self.cues.stop(),
            Effect::ReleaseAnswer(session_id) => self.guard.end_answer(&session_id),
        }
    }

    fn publish(&self, event: DeskEvent) {
        // no subscriber is not an error
        self.events.send(event).ok();
    }

    fn alert(&self, error: &DeskError) {
        if let Some(kind) = error.alert_kind() {
            warn!(?kind, "{}", error);
            self.publish(DeskEvent::Alert {
                kind,
                message: error.to_string(),
                timestamp: get_timestamp(),
            });
        }
    }

    fn apply_policy(&self, session: &dyn Session) {
        if let Err(e) = self.policy.apply(session) {
            warn!(session_id = %session.id(), "failed to apply negotiation policy: {}", e);
        }
    }

    async fn track(&self, session: SessionRef, role: Role) {
        self.sessions
            .lock()
            .await
            .insert(session.id(), Tracked { session, role });
    }

    async fn session(&self, session_id: &SessionId) -> Option<SessionRef> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|tracked| tracked.session.clone())
    }

    async fn current_session(&self, snapshot: &CallSnapshot) -> Result<SessionRef> {
        match &snapshot.session_id {
            Some(session_id) => self.session(session_id).await.ok_or(DeskError::NoActiveCall),
            None => Err(DeskError::NoActiveCall),
        }
    }

    async fn on_new_session(&self, session: SessionRef) {
        let session_id = session.id();
        if self.sessions.lock().await.contains_key(&session_id) {
            debug!(%session_id, "session already tracked");
            return;
        }
        match session.direction() {
            Direction::Inbound => self.on_inbound(session).await,
            Direction::Outbound => self.on_outbound(session).await,
        }
    }

    async fn on_inbound(&self, session: SessionRef) {
        let session_id = session.id();
        let identity = derive_identity(session.as_ref(), &self.correlation_header);
        let snapshot = self.snapshot();

        match correlate(&identity, snapshot.identity.as_ref()) {
            Classification::New => {
                let remote = session.remote_identity();
                let record = CallRecord {
                    call_id: identity
                        .call_id
                        .clone()
                        .unwrap_or_else(|| session_id.to_string()),
                    direction: Direction::Inbound,
                    counterparty_name: remote.display_name.or_else(|| remote.user.clone()),
                    customer_ref: remote.user.clone(),
                    counterparty_number: remote.user,
                    started_at: Utc::now(),
                    answered_at: None,
                };
                self.apply_policy(session.as_ref());
                self.track(session.clone(), Role::Primary).await;
                let call_id = record.call_id.clone();
                match self.dispatch(Input::Offer {
                    session_id: session_id.clone(),
                    identity: identity.clone(),
                    record,
                }) {
                    Ok(_) => info!(%session_id, call_id, "incoming call"),
                    Err(_) => self.ignore_parallel(session, &identity).await,
                }
            }
            Classification::Renegotiation if snapshot.state.is_connected() => {
                self.renegotiate(session, &identity).await
            }
            Classification::Renegotiation | Classification::Parallel => {
                self.ignore_parallel(session, &identity).await
            }
        }
    }

    /// Auto-answer a renegotiation of the active call with the cached
    /// microphone stream. The call state is not touched.
    async fn renegotiate(&self, session: SessionRef, identity: &SessionIdentity) {
        let session_id = session.id();
        info!(%session_id, call_id = ?identity.call_id, "renegotiation of the active call");
        self.apply_policy(session.as_ref());
        self.track(session.clone(), Role::Renegotiation).await;

        let media = self.media.clone();
        let policy = self.policy.clone();
        tokio::spawn(async move {
            let result: anyhow::Result<()> = async {
                let stream = media.acquire().await?;
                session.answer(policy.call_options(stream)).await
            }
            .await;
            if let Err(e) = result {
                let error = DeskError::RenegotiationFailed(e.to_string());
                warn!(%session_id, "{}", error);
                if let Err(e) = session
                    .terminate(TerminateReason::unprocessable_renegotiation())
                    .await
                {
                    warn!(%session_id, "failed to reject renegotiation: {}", e);
                }
            }
        });
    }

    async fn ignore_parallel(&self, session: SessionRef, identity: &SessionIdentity) {
        let session_id = session.id();
        let active = self.snapshot().session_id;
        warn!(
            %session_id,
            call_id = ?identity.call_id,
            active = ?active,
            "{}, ignoring",
            DeskError::ConflictingSession(session_id.clone())
        );
        self.track(session, Role::Parallel).await;
    }

    async fn on_outbound(&self, session: SessionRef) {
        let session_id = session.id();
        let snapshot = self.snapshot();
        if snapshot.state != AgentCallState::Dialing || snapshot.session_id.is_some() {
            warn!(%session_id, state = %snapshot.state, "unsolicited outbound session, terminating");
            self.track(session.clone(), Role::Parallel).await;
            if let Err(e) = session.terminate(TerminateReason::default()).await {
                warn!(%session_id, "failed to terminate outbound session: {}", e);
            }
            return;
        }

        let identity = derive_identity(session.as_ref(), &self.correlation_header);
        let remote = session.remote_identity();
        // the transport may not echo the dialed number back unchanged
        let dialed = snapshot.pending_dial.clone().or(remote.user);
        let record = CallRecord {
            call_id: identity
                .call_id
                .clone()
                .unwrap_or_else(|| session_id.to_string()),
            direction: Direction::Outbound,
            counterparty_number: dialed.clone(),
            counterparty_name: remote.display_name.or_else(|| dialed.clone()),
            customer_ref: dialed,
            started_at: Utc::now(),
            answered_at: None,
        };
        self.apply_policy(session.as_ref());
        self.track(session.clone(), Role::Primary).await;
        match self.dispatch(Input::Attach {
            session_id: session_id.clone(),
            identity: identity.clone(),
            record,
        }) {
            Ok(_) => info!(%session_id, dialed = ?snapshot.pending_dial, "outbound call attached"),
            Err(_) => self.ignore_parallel(session, &identity).await,
        }
    }

    async fn on_session_event(&self, session_id: SessionId, event: SessionEvent) {
        let tracked = self
            .sessions
            .lock()
            .await
            .get(&session_id)
            .map(|tracked| (tracked.session.clone(), tracked.role));
        let Some((session, role)) = tracked else {
            debug!(%session_id, event = event.name(), "event for unknown session");
            return;
        };

        match (&event, role) {
            (SessionEvent::PeerConnectionAttached, _) => self.apply_policy(session.as_ref()),
            (_, Role::Primary) => self.on_primary_event(&session_id, &event),
            (_, Role::Renegotiation) => {
                info!(%session_id, event = event.name(), "renegotiation leg")
            }
            (_, Role::Parallel) => {
                info!(%session_id, event = event.name(), "ignored session")
            }
        }

        if event.is_terminal() {
            self.sessions.lock().await.remove(&session_id);
        }
    }

    fn on_primary_event(&self, session_id: &SessionId, event: &SessionEvent) {
        let signal = match event {
            SessionEvent::Progress => Signal::Progress,
            SessionEvent::Accepted => Signal::Accepted,
            SessionEvent::Confirmed => Signal::Confirmed,
            SessionEvent::Ended { .. } => Signal::Ended,
            SessionEvent::Failed { .. } => Signal::Failed,
            SessionEvent::PeerConnectionAttached => return,
        };
        let is_current = self.snapshot().is_current(session_id);
        if let (SessionEvent::Failed { cause }, true) = (event, is_current) {
            self.alert(&DeskError::TransportRejected(
                cause.clone().unwrap_or_else(|| "call failed".to_string()),
            ));
        }
        match self.dispatch(Input::Signal {
            session_id: session_id.clone(),
            signal,
            at: Utc::now(),
        }) {
            Ok(_) => debug!(%session_id, event = event.name(), "session event"),
            Err(Rejection::Stale) => {
                debug!(%session_id, event = event.name(), "stale session event")
            }
            Err(Rejection::Refused(e)) => {
                debug!(%session_id, event = event.name(), "session event refused: {}", e)
            }
        }
    }

    async fn on_registration(&self, event: RegistrationEvent) {
        let status = {
            let mut link = self.link.lock().await;
            *link = link.apply(&event);
            *link
        };
        info!(?event, ?status, "registration event");
        if let RegistrationEvent::RegistrationFailed { cause } = &event {
            self.alert(&DeskError::TransportRejected(cause.clone()));
        }
        self.publish(DeskEvent::Link {
            status,
            timestamp: get_timestamp(),
        });
    }

    /// Answer the ringing call.
    pub async fn answer(&self) -> Result<AnswerOutcome> {
        let snapshot = self.snapshot();
        let session = self.current_session(&snapshot).await?;
        let session_id = session.id();

        let status = session.status();
        if !status.is_answerable() {
            info!(%session_id, ?status, "session not answerable");
            return Ok(AnswerOutcome::NotAnswerable);
        }
        let Some(_permit) = self.guard.permit(&session_id) else {
            info!(%session_id, "answer already in progress");
            return Ok(AnswerOutcome::AlreadyInProgress);
        };
        match self.dispatch(Input::BeginAnswer {
            session_id: session_id.clone(),
        }) {
            Ok(_) => {}
            Err(Rejection::Stale) => return Ok(AnswerOutcome::Superseded),
            Err(Rejection::Refused(e)) => return Err(e),
        }

        let stream = match self.media.acquire().await {
            Ok(stream) => stream,
            Err(e) => {
                self.dispatch(Input::AbortAnswer {
                    session_id: session_id.clone(),
                })
                .ok();
                self.alert(&e);
                return Err(e);
            }
        };

        self.apply_policy(session.as_ref());
        if let Err(e) = session.answer(self.policy.call_options(stream)).await {
            let error = DeskError::NegotiationFailed(e.to_string());
            if self.snapshot().is_current(&session_id) {
                if let Err(e) = session.terminate(TerminateReason::default()).await {
                    warn!(%session_id, "failed to terminate session: {}", e);
                }
                self.dispatch(Input::Hangup).ok();
                self.alert(&error);
            }
            return Err(error);
        }

        match self.dispatch(Input::Answered {
            session_id: session_id.clone(),
        }) {
            Ok(_) => {
                info!(%session_id, "call answered");
                Ok(AnswerOutcome::Answered)
            }
            Err(_) => {
                info!(%session_id, "call ended before the answer completed");
                Ok(AnswerOutcome::Superseded)
            }
        }
    }

    /// Place an outbound call to `number` at the configured domain.
    pub async fn dial(&self, number: &str) -> Result<DialTarget> {
        let target = self.sip.dial_target(number)?;
        let state = self.snapshot().state;
        if state != AgentCallState::Idle {
            return Err(DeskError::CallInProgress);
        }
        let stream = match self.media.acquire().await {
            Ok(stream) => stream,
            Err(e) => {
                self.alert(&e);
                return Err(e);
            }
        };
        self.dispatch(Input::Dial {
            number: target.user.clone(),
        })
        .map_err(rejection_error)?;
        info!(target = %target, "dialing");

        if let Err(e) = self
            .transport
            .call(&target, self.policy.call_options(stream))
            .await
        {
            let error = DeskError::TransportRejected(e.to_string());
            self.dispatch(Input::Abandon).ok();
            self.alert(&error);
            return Err(error);
        }
        Ok(target)
    }

    pub async fn hangup(&self) -> Result<()> {
        let snapshot = self.snapshot();
        if snapshot.state == AgentCallState::Idle {
            return Err(DeskError::NoActiveCall);
        }
        if let Ok(session) = self.current_session(&snapshot).await {
            if let Err(e) = session.terminate(TerminateReason::default()).await {
                warn!(session_id = %session.id(), "failed to terminate session: {}", e);
            }
        }
        match self.dispatch(Input::Hangup) {
            Ok(_) | Err(Rejection::Stale) => Ok(()),
            Err(Rejection::Refused(e)) => Err(e),
        }
    }

    pub async fn hold(&self) -> Result<()> {
        let snapshot = self.snapshot();
        transition(&snapshot, &Input::Hold).map_err(rejection_error)?;
        let session = self.current_session(&snapshot).await?;
        session
            .hold()
            .await
            .map_err(|e| DeskError::TransportRejected(e.to_string()))?;
        self.dispatch(Input::Hold).map_err(rejection_error)?;
        Ok(())
    }

    pub async fn unhold(&self) -> Result<()> {
        let snapshot = self.snapshot();
        transition(&snapshot, &Input::Unhold).map_err(rejection_error)?;
        let session = self.current_session(&snapshot).await?;
        session
            .unhold()
            .await
            .map_err(|e| DeskError::TransportRejected(e.to_string()))?;
        self.dispatch(Input::Unhold).map_err(rejection_error)?;
        Ok(())
    }

    /// Transfer the connected call. Attended transfers are only reported to
    /// the backend.
    pub async fn transfer(&self, destination: &str, kind: TransferKind) -> Result<TransferOutcome> {
        let snapshot = self.snapshot();
        if !snapshot.state.is_connected() {
            return Err(match snapshot.state {
                AgentCallState::Idle => DeskError::NoActiveCall,
                state => DeskError::InvalidState {
                    state,
                    action: "transfer",
                },
            });
        }
        let target = self.sip.dial_target(destination)?;
        let session = self.current_session(&snapshot).await?;
        let call_id = snapshot.call_id().unwrap_or_default().to_string();

        info!(call_id, target = %target, kind = kind.as_str(), "transferring call");
        self.presence.send(PresenceEvent::CallTransferred {
            call_id,
            destination: target.user.clone(),
            kind,
        });
        match kind {
            TransferKind::Blind => {
                session
                    .refer(&target.uri())
                    .await
                    .map_err(|e| DeskError::TransportRejected(e.to_string()))?;
                Ok(TransferOutcome::Referred(target))
            }
            TransferKind::Attended => Ok(TransferOutcome::NotifiedOnly),
        }
    }

    pub fn set_ready(&self) {
        info!("agent ready");
        self.presence.send(PresenceEvent::AgentStatus {
            status: AgentStatus::Ready,
        });
    }

    pub fn set_not_ready(&self, reason: &str) {
        info!(reason, "agent not ready");
        self.presence.send(PresenceEvent::AgentStatus {
            status: AgentStatus::NotReady {
                reason: reason.to_string(),
            },
        });
    }

    /// Terminate live sessions, release the microphone and flush pending
    /// presence notifications.
    pub async fn shutdown(&self) {
        let sessions = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, tracked)| tracked.session)
            .collect::<Vec<_>>();
        for session in sessions {
            if session.status().is_ended() {
                continue;
            }
            if let Err(e) = session.terminate(TerminateReason::default()).await {
                warn!(session_id = %session.id(), "failed to terminate session: {}", e);
            }
        }
        if self.snapshot().state != AgentCallState::Idle {
            self.dispatch(Input::Hangup).ok();
        }
        self.media.release().await;
        self.cancel_token.cancel();
        let worker = self.presence_worker.lock().await.take();
        if let Some(worker) = worker {
            worker.await.ok();
        }
        info!("session director stopped");
    }
}
