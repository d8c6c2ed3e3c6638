use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;

mod gate;
pub use gate::MediaGate;

/// The captured microphone stream.
pub trait LocalMediaStream: fmt::Debug + Send + Sync {
    fn id(&self) -> String;
    /// `false` once every track of the stream has ended
    fn is_active(&self) -> bool;
    fn stop(&self);
}

pub type LocalStreamRef = Arc<dyn LocalMediaStream>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The user or the browser policy refused microphone access
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Capture device access, one call may show a permission prompt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStreamRef, CaptureError>;
}
