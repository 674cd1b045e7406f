//! Transport trait abstraction for pluggable link backends

use crate::peer::BondedPeer;
use anyhow::Result;
use async_trait::async_trait;
use safeway_shared::ServiceId;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// A transport stream that can read and write bytes
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Close the transport gracefully
    async fn shutdown(&mut self) -> Result<()>;
}

/// Opens connection-oriented byte streams to bonded peers
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The stream type this transport produces
    type Stream: TransportStream;

    /// Open a stream to `service` on `peer`, blocking the calling task until
    /// the peer accepts or the attempt fails
    async fn open_stream(&self, peer: &BondedPeer, service: ServiceId) -> io::Result<Self::Stream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
