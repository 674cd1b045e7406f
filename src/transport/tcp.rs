//! TCP transport simulating the serial link during development

use crate::peer::BondedPeer;
use crate::transport::traits::{Transport, TransportStream};
use anyhow::Result;
use async_trait::async_trait;
use safeway_shared::ServiceId;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { inner: stream }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for TcpTransportStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Connects every peer to one fixed TCP address, ignoring radio addresses
pub struct TcpTransport {
    address: String,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpTransportStream;

    async fn open_stream(&self, peer: &BondedPeer, service: ServiceId) -> io::Result<Self::Stream> {
        debug!("[TCP] Simulating {} service {} at {}", peer.name, service, self.address);
        let stream = TcpStream::connect(&self.address).await?;
        Ok(TcpTransportStream::new(stream))
    }

    fn name(&self) -> &'static str {
        "TCP simulation"
    }
}
