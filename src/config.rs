//! Link configuration loaded from TOML

use anyhow::{Context, Result};
use safeway_shared::{link, RetryPolicy, ServiceId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Which transport carries the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Real RFCOMM Bluetooth (requires BlueZ)
    #[default]
    Rfcomm,
    /// TCP simulation (for development)
    TcpSimulation,
}

/// Configuration for the companion link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Name of the bonded device to connect to
    pub peer_name: String,
    /// Service to open on the peer
    pub service_uuid: Uuid,
    /// Attempts before giving up
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_delay_ms: u64,
    /// Bound on a single connect
    pub connect_timeout_ms: u64,
    /// Transport mode
    pub transport: TransportMode,
    /// Fixed RFCOMM channel; resolved from the service record when unset
    pub rfcomm_channel: Option<u8>,
    /// TCP simulation address (when transport is tcp_simulation)
    pub tcp_address: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            peer_name: link::DEFAULT_PEER_NAME.into(),
            service_uuid: ServiceId::SERIAL_PORT.uuid(),
            max_retries: link::MAX_RETRIES,
            retry_delay_ms: link::RETRY_DELAY_MS,
            connect_timeout_ms: link::CONNECT_TIMEOUT_MS,
            transport: TransportMode::default(),
            rfcomm_channel: None,
            tcp_address: "127.0.0.1:9000".into(),
        }
    }
}

impl LinkConfig {
    /// Load from `path`, or defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn service(&self) -> ServiceId {
        ServiceId::new(self.service_uuid)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}
