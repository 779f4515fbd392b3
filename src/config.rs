use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::wire::{MANAGER_TOKEN, READER_TOKEN};

/// Role this node plays on the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Elects a manager and relays captures to it.
    Reader,
    /// Answers discover as the manager and stores relayed captures.
    Manager,
}

impl NodeRole {
    /// Token sent back to discover requests.
    pub fn token(&self) -> &'static str {
        match self {
            NodeRole::Reader => READER_TOKEN,
            NodeRole::Manager => MANAGER_TOKEN,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Reader => f.write_str("reader"),
            NodeRole::Manager => f.write_str("manager"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_role")]
    pub role: NodeRole,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,

    /// Skip a capture tick while the previous send is still in flight.
    #[serde(default)]
    pub single_flight: bool,

    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bound on one liveness round trip to the manager.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    #[serde(default = "default_mdns_enabled")]
    pub mdns_enabled: bool,

    #[serde(default = "default_mdns_query_interval_secs")]
    pub mdns_query_interval_secs: u64,

    #[serde(default = "default_idle_connection_timeout_secs")]
    pub idle_connection_timeout_secs: u64,
}

fn default_service_name() -> String {
    "phonendo-reader".to_string()
}

fn default_role() -> NodeRole {
    NodeRole::Reader
}

fn default_listen_addr() -> String {
    "/ip4/127.0.0.1/tcp/0".to_string()
}

fn default_capture_interval_ms() -> u64 {
    5000
}

fn default_max_concurrent_probes() -> usize {
    16
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_ping_timeout_secs() -> u64 {
    5
}

fn default_mdns_enabled() -> bool {
    true
}

fn default_mdns_query_interval_secs() -> u64 {
    20
}

fn default_idle_connection_timeout_secs() -> u64 {
    60
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        Self::from_source(config, std::env::var_os("ROLE").is_some())
    }

    /// Deserialize and validate. An explicitly set role must never be replaced
    /// by the default, so a parse failure is fatal when `role_pinned` is set.
    pub fn from_source(source: config::Config, role_pinned: bool) -> Result<Self> {
        let settings: Config = match source.try_deserialize() {
            Ok(settings) => settings,
            Err(e) if role_pinned => {
                return Err(e).context("invalid configuration with ROLE set");
            }
            Err(e) => {
                tracing::warn!("Invalid configuration in environment ({}), using defaults", e);
                Config::default()
            }
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture_interval_ms == 0 {
            bail!("CAPTURE_INTERVAL_MS must be greater than zero");
        }
        if self.ping_timeout_secs == 0 {
            bail!("PING_TIMEOUT_SECS must be greater than zero");
        }
        Ok(())
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn mdns_query_interval(&self) -> Duration {
        Duration::from_secs(self.mdns_query_interval_secs)
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            role: default_role(),
            listen_addr: default_listen_addr(),
            capture_interval_ms: default_capture_interval_ms(),
            single_flight: false,
            max_concurrent_probes: default_max_concurrent_probes(),
            request_timeout_secs: default_request_timeout_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            mdns_enabled: default_mdns_enabled(),
            mdns_query_interval_secs: default_mdns_query_interval_secs(),
            idle_connection_timeout_secs: default_idle_connection_timeout_secs(),
        }
    }
}
