//! BlueZ-backed peer directory

use super::directory::{BondedPeer, PeerDirectory};
use anyhow::Result;
use async_trait::async_trait;
use bluer::{Adapter, Address, Session};
use std::fmt;
use tracing::{debug, info};

/// Peer directory over the default BlueZ adapter
pub struct BluezDirectory {
    session: Session,
    adapter: Adapter,
}

impl BluezDirectory {
    /// Open a BlueZ session on the default adapter
    pub async fn new() -> Result<Self> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("[BT] Using adapter {}", adapter.name());
        Ok(Self { session, adapter })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Bonded peer at `addr`, or `None` if it is not paired
    async fn bonded_peer(&self, addr: Address) -> bluer::Result<Option<BondedPeer>> {
        let device = self.adapter.device(addr)?;
        if !device.is_paired().await? {
            return Ok(None);
        }

        // Fall back to the alias, which BlueZ always has
        let name = match device.name().await? {
            Some(name) => name,
            None => device.alias().await?,
        };
        Ok(Some(BondedPeer::new(name, addr)))
    }
}

/// Skip a device whose properties cannot be read, e.g. one removed mid-listing
fn readable<E: fmt::Display>(
    addr: Address,
    peer: Result<Option<BondedPeer>, E>,
) -> Option<BondedPeer> {
    match peer {
        Ok(peer) => peer,
        Err(e) => {
            debug!("[BT] Skipping device {}: {}", addr, e);
            None
        }
    }
}

#[async_trait]
impl PeerDirectory for BluezDirectory {
    async fn adapter_enabled(&self) -> Result<bool> {
        Ok(self.adapter.is_powered().await?)
    }

    async fn enable_adapter(&self) -> Result<()> {
        info!("[BT] Powering on adapter {}", self.adapter.name());
        self.adapter.set_powered(true).await?;
        Ok(())
    }

    async fn list_bonded_peers(&self) -> Result<Vec<BondedPeer>> {
        let mut peers = Vec::new();

        for addr in self.adapter.device_addresses().await? {
            if let Some(peer) = readable(addr, self.bonded_peer(addr).await) {
                debug!("[BT] Bonded device {} ({})", peer.name, addr);
                peers.push(peer);
            }
        }

        Ok(peers)
    }

}
