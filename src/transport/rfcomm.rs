//! RFCOMM transport implementation for Bluetooth serial links

use crate::peer::BondedPeer;
use crate::transport::traits::{Transport, TransportStream};
use anyhow::Result;
use async_trait::async_trait;
use bluer::rfcomm::{Profile, Role, SocketAddr as RfcommAddr, Stream as RfcommStream};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use safeway_shared::ServiceId;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

/// RFCOMM stream wrapper implementing TransportStream
pub struct RfcommTransportStream {
    inner: RfcommStream,
    peer_addr: Address,
}

impl RfcommTransportStream {
    /// Create a new RFCOMM transport stream
    pub fn new(stream: RfcommStream, peer_addr: Address) -> Self {
        Self {
            inner: stream,
            peer_addr,
        }
    }
}

impl AsyncRead for RfcommTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RfcommTransportStream {
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
impl TransportStream for RfcommTransportStream {
    async fn shutdown(&mut self) -> Result<()> {
        debug!("[BT] Closing RFCOMM link to {}", self.peer_addr);
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// How the RFCOMM channel on the peer is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfcommTarget {
    /// Resolve the channel from the peer's service record
    ServiceRecord,
    /// Connect straight to a known channel
    Channel(u8),
}

impl From<Option<u8>> for RfcommTarget {
    fn from(channel: Option<u8>) -> Self {
        match channel {
            Some(ch) => RfcommTarget::Channel(ch),
            None => RfcommTarget::ServiceRecord,
        }
    }
}

/// RFCOMM transport for the companion device
pub struct RfcommTransport {
    session: Session,
    adapter: Adapter,
    target: RfcommTarget,
}

impl RfcommTransport {
    /// Create a new RFCOMM transport on an existing BlueZ session
    pub fn new(session: Session, adapter: Adapter, target: RfcommTarget) -> Self {
        Self {
            session,
            adapter,
            target,
        }
    }

    /// Register a client profile for the service and let BlueZ connect it
    async fn open_service_record(
        &self,
        peer: &BondedPeer,
        service: ServiceId,
    ) -> io::Result<RfcommStream> {
        let uuid = service.uuid();
        let profile = Profile {
            uuid,
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let mut profile_handle = self.session.register_profile(profile).await.map_err(to_io)?;
        let device = self.adapter.device(peer.address).map_err(to_io)?;

        debug!("[BT] Requesting profile {} on {}", uuid, peer.address);
        let connect = device.connect_profile(&uuid);
        tokio::pin!(connect);
        let mut connect_done = false;

        loop {
            tokio::select! {
                res = &mut connect, if !connect_done => {
                    res.map_err(to_io)?;
                    connect_done = true;
                }
                req = profile_handle.next() => {
                    match req {
                        Some(req) if req.device() == peer.address => return req.accept().map_err(to_io),
                        // Dropping the request rejects it
                        Some(req) => debug!("[BT] Ignoring profile connection from {}", req.device()),
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::NotConnected,
                                "profile handle closed before a connection arrived",
                            ))
                        }
                    }
                }
            }
        }
    }
}

fn to_io(err: bluer::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

#[async_trait]
impl Transport for RfcommTransport {
    type Stream = RfcommTransportStream;

    async fn open_stream(&self, peer: &BondedPeer, service: ServiceId) -> io::Result<Self::Stream> {
        info!("[BT] Connecting to {} ({}) via {:?}", peer.name, peer.address, self.target);

        let stream = match self.target {
            RfcommTarget::ServiceRecord => {
                self.open_service_record(peer, service).await?
            }
            RfcommTarget::Channel(channel) => {
                RfcommStream::connect(RfcommAddr::new(peer.address, channel)).await?
            }
        };

        info!("[BT] Connected to {}", peer.address);
        Ok(RfcommTransportStream::new(stream, peer.address))
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}
