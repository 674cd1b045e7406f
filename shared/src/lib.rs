//! SafeWay Shared Link Types
//!
//! This crate provides the transport-independent types used by the
//! companion link: service identifiers, retry policy, the error taxonomy
//! and the connection state machine.

pub mod error;
pub mod state_machine;

use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub use error::LinkError;

/// Link parameters for the companion device
pub mod link {
    /// Name the companion device advertises once bonded
    pub const DEFAULT_PEER_NAME: &str = "raspberrypi";

    /// Serial port profile service class UUID
    pub const SERIAL_PORT_UUID: u128 = 0x00001101_0000_1000_8000_00805F9B34FB;

    /// Maximum connection attempts before giving up
    pub const MAX_RETRIES: u32 = 5;

    /// Fixed delay between connection attempts in milliseconds
    pub const RETRY_DELAY_MS: u64 = 5000;

    /// Upper bound on a single transport open in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 12000;
}

/// Identifier of the service to open on the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// The serial port profile (RFCOMM byte stream)
    pub const SERIAL_PORT: ServiceId = ServiceId(Uuid::from_u128(link::SERIAL_PORT_UUID));

    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::SERIAL_PORT
    }
}

impl From<Uuid> for ServiceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How persistently to try opening the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed before the flow is exhausted
    pub max_retries: u32,
    /// Fixed wait between a failed attempt and the next one
    pub retry_delay: Duration,
    /// Bound on a single transport open
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: link::MAX_RETRIES,
            retry_delay: Duration::from_millis(link::RETRY_DELAY_MS),
            connect_timeout: Duration::from_millis(link::CONNECT_TIMEOUT_MS),
        }
    }
}
