//! Directory trait and an in-memory implementation

use anyhow::Result;
use async_trait::async_trait;
use bluer::Address;
use std::sync::atomic::{AtomicBool, Ordering};

/// A bonded device as reported by the local radio stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedPeer {
    /// Advertised device name
    pub name: String,
    /// Bluetooth MAC address
    pub address: Address,
}

impl BondedPeer {
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// Source of bonded peers and adapter power state
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Whether the local adapter is powered
    async fn adapter_enabled(&self) -> Result<bool>;

    /// Power the local adapter on
    async fn enable_adapter(&self) -> Result<()>;

    /// All peers bonded with the local adapter
    async fn list_bonded_peers(&self) -> Result<Vec<BondedPeer>>;
}

/// Fixed set of peers, for simulated links and tests
#[derive(Debug)]
pub struct StaticDirectory {
    peers: Vec<BondedPeer>,
    enabled: AtomicBool,
}

impl StaticDirectory {
    /// Create a directory with a powered adapter
    pub fn new(peers: Vec<BondedPeer>) -> Self {
        Self {
            peers,
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a directory whose adapter starts powered off
    pub fn disabled(peers: Vec<BondedPeer>) -> Self {
        Self {
            peers,
            enabled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn adapter_enabled(&self) -> Result<bool> {
        Ok(self.enabled.load(Ordering::SeqCst))
    }

    async fn enable_adapter(&self) -> Result<()> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_bonded_peers(&self) -> Result<Vec<BondedPeer>> {
        Ok(self.peers.clone())
    }
}
