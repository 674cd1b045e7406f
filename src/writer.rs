//! Writes bytes to the companion device through the shared link slot

use crate::connection::LinkSlot;
use crate::transport::TransportStream;
use bytes::Bytes;
use safeway_shared::LinkError;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Sends data over whatever link is currently in the slot
#[derive(Clone)]
pub struct LinkWriter {
    slot: LinkSlot,
}

impl LinkWriter {
    pub fn new(slot: LinkSlot) -> Self {
        Self { slot }
    }

    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    /// Write and flush `data`. Fails with `NotConnected` until a connection
    /// flow has published its link.
    pub async fn send(&self, data: Bytes) -> Result<(), LinkError> {
        let handle = self.slot.current().ok_or(LinkError::NotConnected)?;
        let mut stream = handle.stream().lock().await;

        let written = match stream.write_all(&data).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        drop(stream);

        if let Err(e) = written {
            // The link is dead; later sends report NotConnected
            warn!("[LINK] Write to {} failed, dropping link: {}", handle.peer().name, e);
            self.slot.discard(&handle);
            return Err(LinkError::Transport(e.to_string()));
        }

        debug!("[LINK] Sent {} bytes to {}", data.len(), handle.peer().name);
        Ok(())
    }

    /// Take the link out of the slot and close it
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let Some(handle) = self.slot.take() else {
            return Ok(());
        };

        info!("[LINK] Closing link to {}", handle.peer().name);
        let mut stream = handle.stream().lock().await;
        TransportStream::shutdown(&mut **stream)
            .await
            .map_err(|e| LinkError::Transport(format!("{:#}", e)))
    }
}
