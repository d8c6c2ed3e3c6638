//! Call and agent status notifications to the contact center backend.
//!
//! Notifications are fire-and-forget: they are queued by the director and
//! delivered in order by a single background worker. A failed delivery is
//! logged and never rolls back the local transition that produced it.
use crate::call::CallRecord;
use crate::version::get_useragent;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration, time::Instant};
use tokio::{select, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Blind,
    Attended,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Blind => "blind",
            TransferKind::Attended => "attended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentStatus {
    Ready,
    NotReady { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    CallRinging {
        record: CallRecord,
    },
    CallAnswered {
        call_id: String,
    },
    CallDropped {
        call_id: String,
    },
    CallHeld {
        call_id: String,
    },
    CallUnheld {
        call_id: String,
    },
    CallTransferred {
        call_id: String,
        destination: String,
        kind: TransferKind,
    },
    AgentStatus {
        status: AgentStatus,
    },
}

impl PresenceEvent {
    /// Backend route relative to the configured base url
    pub fn route(&self) -> &'static str {
        match self {
            PresenceEvent::CallRinging { .. } => "/api/call/ringing",
            PresenceEvent::CallAnswered { .. } => "/api/call/answer",
            PresenceEvent::CallDropped { .. } => "/api/call/drop",
            PresenceEvent::CallHeld { .. } => "/api/call/hold",
            PresenceEvent::CallUnheld { .. } => "/api/call/unhold",
            PresenceEvent::CallTransferred { .. } => "/api/call/transfer",
            PresenceEvent::AgentStatus {
                status: AgentStatus::Ready,
            } => "/api/agent/ready",
            PresenceEvent::AgentStatus {
                status: AgentStatus::NotReady { .. },
            } => "/api/agent/not-ready",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            PresenceEvent::CallRinging { record } => json!({
                "call_id": record.call_id,
                "caller_number": record.counterparty_number,
                "caller_name": record.counterparty_name,
                "customer_id": record.customer_ref,
                "direction": record.direction,
                "started_at": record.started_at.to_rfc3339(),
            }),
            PresenceEvent::CallAnswered { call_id }
            | PresenceEvent::CallDropped { call_id }
            | PresenceEvent::CallHeld { call_id }
            | PresenceEvent::CallUnheld { call_id } => json!({ "call_id": call_id }),
            PresenceEvent::CallTransferred {
                call_id,
                destination,
                kind,
            } => json!({
                "call_id": call_id,
                "transfer_to": destination,
                "transfer_type": kind.as_str(),
            }),
            PresenceEvent::AgentStatus {
                status: AgentStatus::Ready,
            } => json!({}),
            PresenceEvent::AgentStatus {
                status: AgentStatus::NotReady { reason },
            } => json!({ "reason": reason }),
        }
    }
}

#[async_trait]
pub trait PresenceSync: Send + Sync {
    async fn notify(&self, event: &PresenceEvent) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PresenceConfig {
    /// Base url of the backend, routes are appended to it
    pub url: String,
    pub headers: Option<HashMap<String, String>>,
    #[serde(default = "default_presence_timeout")]
    pub timeout_secs: u64,
}

fn default_presence_timeout() -> u64 {
    5
}

pub struct HttpPresenceSync {
    client: Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl HttpPresenceSync {
    pub fn new(config: &PresenceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(get_useragent())
            .build()?;
        let headers = config
            .headers
            .as_ref()
            .map(|headers| {
                headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            headers,
        })
    }
}

#[async_trait]
impl PresenceSync for HttpPresenceSync {
    async fn notify(&self, event: &PresenceEvent) -> Result<()> {
        let url = format!("{}{}", self.url, event.route());
        let mut request = self.client.post(&url);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let start_time = Instant::now();
        let response = request.json(&event.payload()).send().await.map_err(|e| {
            anyhow!("failed to send presence notification to {}: {}", url, e)
        })?;
        info!(
            url,
            elapsed = start_time.elapsed().as_millis(),
            status = ?response.status(),
            "presence notification"
        );
        if !response.status().is_success() {
            return Err(anyhow!(
                "presence notification to {} rejected: {}",
                url,
                response.status()
            ));
        }
        Ok(())
    }
}

/// Used when no backend is configured.
#[derive(Debug, Default)]
pub struct LogPresenceSync;

#[async_trait]
impl PresenceSync for LogPresenceSync {
    async fn notify(&self, event: &PresenceEvent) -> Result<()> {
        info!(route = event.route(), payload = %event.payload(), "presence notification");
        Ok(())
    }
}

pub fn create_presence_sync(config: Option<&PresenceConfig>) -> Result<Arc<dyn PresenceSync>> {
    match config {
        Some(config) => Ok(Arc::new(HttpPresenceSync::new(config)?)),
        None => Ok(Arc::new(LogPresenceSync)),
    }
}

/// Ordered, non-blocking delivery of presence notifications.
#[derive(Clone)]
pub struct PresenceDispatcher {
    sender: mpsc::UnboundedSender<PresenceEvent>,
}

impl PresenceDispatcher {
    pub fn start(
        sync: Arc<dyn PresenceSync>,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::run(sync, receiver, cancel_token));
        (Self { sender }, handle)
    }

    pub fn send(&self, event: PresenceEvent) {
        if self.sender.send(event).is_err() {
            debug!("presence dispatcher stopped, notification dropped");
        }
    }

    async fn run(
        sync: Arc<dyn PresenceSync>,
        mut receiver: mpsc::UnboundedReceiver<PresenceEvent>,
        cancel_token: CancellationToken,
    ) {
        loop {
            select! {
                biased;
                event = receiver.recv() => match event {
                    Some(event) => Self::deliver(sync.as_ref(), &event).await,
                    None => return,
                },
                _ = cancel_token.cancelled() => break,
            }
        }
        // flush what was queued before the cancellation
        while let Ok(event) = receiver.try_recv() {
            Self::deliver(sync.as_ref(), &event).await;
        }
        debug!("presence dispatcher stopped");
    }

    async fn deliver(sync: &dyn PresenceSync, event: &PresenceEvent) {
        if let Err(e) = sync.notify(event).await {
            warn!(route = event.route(), "presence notification failed: {}", e);
        }
    }
}
