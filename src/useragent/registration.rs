use super::config::SipConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Configuration handed to the SIP user agent when it is started.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RegisterOption {
    /// `wss://<host>:<port>` signaling socket
    pub server: String,
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
    pub register: bool,
    host: String,
}

impl RegisterOption {
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.username, self.host)
    }
}

impl From<&SipConfig> for RegisterOption {
    fn from(config: &SipConfig) -> Self {
        let option = Self {
            server: config.signaling_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            display_name: config
                .display_name
                .clone()
                .or_else(|| Some(config.username.clone())),
            register: config.register,
            host: config.host(),
        };
        info!(server = option.server, aor = option.aor(), "user agent register option");
        option
    }
}

/// Link level events from the user agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistrationEvent {
    Connected,
    Disconnected,
    Registered,
    Unregistered,
    RegistrationFailed { cause: String },
}

/// Connectivity of the agent to the SIP service, as shown to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connected,
    Registered,
}

impl LinkStatus {
    /// Status after `event`, starting from `self`.
    pub fn apply(self, event: &RegistrationEvent) -> LinkStatus {
        match event {
            RegistrationEvent::Connected => match self {
                LinkStatus::Registered => LinkStatus::Registered,
                _ => LinkStatus::Connected,
            },
            RegistrationEvent::Registered => LinkStatus::Registered,
            RegistrationEvent::Unregistered => match self {
                LinkStatus::Disconnected => LinkStatus::Disconnected,
                _ => LinkStatus::Connected,
            },
            RegistrationEvent::Disconnected | RegistrationEvent::RegistrationFailed { .. } => {
                LinkStatus::Disconnected
            }
        }
    }
}
