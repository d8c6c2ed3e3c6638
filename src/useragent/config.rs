use crate::error::{DeskError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

const DEFAULT_WSS_PORT: u16 = 7443;

static SCHEME_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)(?:[a-z][a-z0-9+.\-]*://|sips?:)").unwrap());
static LEADING_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^0-9A-Za-z.]+").unwrap());

/// SIP account of the agent desk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub username: String,
    pub password: String,
    /// Domain as typed by the operator, may carry a scheme or port
    pub domain: String,
    /// WebSocket Secure port of the signaling endpoint
    pub wss_port: u16,
    pub display_name: Option<String>,
    pub register: bool,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            domain: String::new(),
            wss_port: DEFAULT_WSS_PORT,
            display_name: None,
            register: true,
        }
    }
}

impl SipConfig {
    /// Bare host used for the signaling endpoint and every dial or transfer target.
    pub fn host(&self) -> String {
        sanitize_domain(&self.domain)
    }

    pub fn signaling_url(&self) -> String {
        format!("wss://{}:{}", self.host(), self.wss_port)
    }

    pub fn account_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.host())
    }

    pub fn dial_target(&self, number: &str) -> Result<DialTarget> {
        DialTarget::new(number, &self.host())
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.username.is_empty() {
            return Err("sip username is required".to_string());
        }
        if self.host().is_empty() {
            return Err(format!("sip domain {:?} has no usable host", self.domain));
        }
        Ok(())
    }
}

/// Reduce an operator supplied domain to a bare host.
///
/// Strips a scheme prefix, a stray transport indicator `s` directly in front
/// of a digit, any port or path suffix and leading punctuation.
pub fn sanitize_domain(domain: &str) -> String {
    let domain = domain.trim();
    let domain = SCHEME_PREFIX.replace(domain, "");
    let mut domain: &str = &domain;

    let mut chars = domain.chars();
    if let (Some('s'), Some(next)) = (chars.next(), chars.next()) {
        if next.is_ascii_digit() {
            domain = &domain[1..];
        }
    }

    let domain = domain.split(':').next().unwrap_or_default();
    let domain = domain.split('/').next().unwrap_or_default();
    LEADING_JUNK.replace(domain, "").into_owned()
}

/// `<digits>@<host>` destination of a dial or a blind transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialTarget {
    pub user: String,
    pub host: String,
}

impl DialTarget {
    pub fn new(number: &str, host: &str) -> Result<Self> {
        let user: String = number
            .chars()
            .filter(|c| !matches!(c, ' ' | '\t' | '-' | '(' | ')' | '.'))
            .collect();
        let valid = !user.is_empty()
            && user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '*' | '#' | '_'));
        if !valid || host.is_empty() {
            return Err(DeskError::InvalidTarget(format!("{}@{}", number, host)));
        }
        Ok(Self {
            user,
            host: host.to_string(),
        })
    }

    pub fn uri(&self) -> String {
        format!("sip:{}", self)
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}
