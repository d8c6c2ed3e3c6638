use super::{CaptureError, LocalStreamRef, MediaConstraints, MicrophoneSource};
use crate::error::{DeskError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Acquires the microphone once and shares the stream with every session
/// negotiated while it stays active.
///
/// A refusal is remembered for the lifetime of the gate: later acquisitions
/// fail with [`DeskError::PermissionDenied`] without prompting again. This
/// keeps a denied agent from being hit by a prompt on every ring.
pub struct MediaGate {
    source: Box<dyn MicrophoneSource>,
    constraints: MediaConstraints,
    cached: Mutex<Option<LocalStreamRef>>,
    denied: AtomicBool,
}

impl MediaGate {
    pub fn new(source: Box<dyn MicrophoneSource>) -> Self {
        Self {
            source,
            constraints: MediaConstraints::default(),
            cached: Mutex::new(None),
            denied: AtomicBool::new(false),
        }
    }

    pub fn is_denied(&self) -> bool {
        self.denied.load(Ordering::Acquire)
    }

    /// Returns the cached stream if it is still active, otherwise opens a new
    /// one. Concurrent callers wait for a single acquisition.
    pub async fn acquire(&self) -> Result<LocalStreamRef> {
        if self.is_denied() {
            return Err(DeskError::PermissionDenied);
        }
        let mut cached = self.cached.lock().await;
        // a concurrent caller may have been refused while we waited
        if self.is_denied() {
            return Err(DeskError::PermissionDenied);
        }
        if let Some(stream) = cached.as_ref() {
            if stream.is_active() {
                return Ok(stream.clone());
            }
            debug!(stream_id = stream.id(), "cached microphone stream inactive");
        }

        match self.source.open(self.constraints.clone()).await {
            Ok(stream) => {
                info!(stream_id = stream.id(), "microphone stream acquired");
                *cached = Some(stream.clone());
                Ok(stream)
            }
            Err(CaptureError::NotAllowed(reason)) => {
                warn!(reason, "microphone access denied");
                self.denied.store(true, Ordering::Release);
                *cached = None;
                Err(DeskError::PermissionDenied)
            }
            Err(CaptureError::Unavailable(reason)) => {
                warn!(reason, "microphone unavailable");
                Err(DeskError::MediaUnavailable(reason))
            }
        }
    }

    /// Stop and forget the cached stream.
    pub async fn release(&self) {
        if let Some(stream) = self.cached.lock().await.take() {
            info!(stream_id = stream.id(), "releasing microphone stream");
            stream.stop();
        }
    }
}
