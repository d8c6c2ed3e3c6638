use crate::call::correlation::DEFAULT_CORRELATION_HEADER;
use crate::negotiation::{
    IceServer, IceTransportPolicy, NegotiationPolicy, DEFAULT_ICE_GATHERING_TIMEOUT,
    DEFAULT_STUN_SERVER,
};
use crate::presence::PresenceConfig;
use crate::useragent::SipConfig;
use crate::version::get_version_info;
use anyhow::{anyhow, Error};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, long_version = get_version_info())]
pub struct Cli {
    /// Config file, built-in defaults when omitted
    #[clap(long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the derived signaling endpoint, account and ICE servers
    Check,
    /// Print the SIP target a number would be dialed as
    Target { number: String },
    /// Print an SDP body with the trickle ICE markers removed
    Sdp { file: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub sip: SipConfig,
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub ice_gathering_timeout_ms: u64,
    /// Header carrying the provider call identifier
    pub correlation_header: String,
    pub presence: Option<PresenceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: None,
            log_file: None,
            sip: SipConfig::default(),
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            ice_transport_policy: IceTransportPolicy::All,
            ice_gathering_timeout_ms: DEFAULT_ICE_GATHERING_TIMEOUT.as_millis() as u64,
            correlation_header: DEFAULT_CORRELATION_HEADER.to_string(),
            presence: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn policy(&self) -> NegotiationPolicy {
        NegotiationPolicy::new(
            self.ice_servers.clone(),
            self.ice_transport_policy,
            Duration::from_millis(self.ice_gathering_timeout_ms),
        )
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.sip.validate().map_err(|e| anyhow!(e))?;
        if self.ice_servers.iter().all(|server| server.urls.is_empty()) {
            return Err(anyhow!("at least one ice server url is required"));
        }
        if self.correlation_header.trim().is_empty() {
            return Err(anyhow!("correlation_header must not be empty"));
        }
        Ok(())
    }
}
