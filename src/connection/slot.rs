//! Shared slot holding the open link for writers

use crate::peer::BondedPeer;
use crate::transport::TransportStream;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// Boxed stream as stored in the slot
pub type BoxedStream = Box<dyn TransportStream>;

/// Handle to an open link, cheap to clone
#[derive(Clone)]
pub struct LinkHandle {
    peer: Arc<BondedPeer>,
    generation: u64,
    stream: Arc<Mutex<BoxedStream>>,
}

impl LinkHandle {
    pub fn new(peer: BondedPeer, generation: u64, stream: BoxedStream) -> Self {
        Self {
            peer: Arc::new(peer),
            generation,
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    /// The peer this link is open to
    pub fn peer(&self) -> &BondedPeer {
        &self.peer
    }

    /// Connection flow that produced this link
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Exclusive access to the underlying stream
    pub fn stream(&self) -> &Arc<Mutex<BoxedStream>> {
        &self.stream
    }

    /// Whether two handles refer to the same open stream
    pub fn same_link(&self, other: &LinkHandle) -> bool {
        Arc::ptr_eq(&self.stream, &other.stream)
    }
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("peer", &self.peer.name)
            .field("address", &self.peer.address)
            .field("generation", &self.generation)
            .finish()
    }
}

struct SlotInner {
    generation: u64,
    handle: Option<LinkHandle>,
}

/// Single-writer holder for the current link
///
/// Each connection flow opens a new generation. A handle is only accepted
/// while its generation is current, so a flow that was cancelled cannot
/// publish a late connection.
#[derive(Clone)]
pub struct LinkSlot {
    inner: Arc<StdMutex<SlotInner>>,
}

impl LinkSlot {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(SlotInner {
                generation: 0,
                handle: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotInner> {
        // A poisoned slot still holds a consistent generation/handle pair
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new generation and return it
    pub fn next_generation(&self) -> u64 {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.generation
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Publish a handle if its generation is still current
    pub fn install(&self, handle: LinkHandle) -> bool {
        let mut inner = self.lock();
        if inner.generation != handle.generation {
            return false;
        }
        inner.handle = Some(handle);
        true
    }

    /// Invalidate `generation` if it is current, dropping its handle
    pub fn retire(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.generation += 1;
        if inner
            .handle
            .as_ref()
            .is_some_and(|h| h.generation == generation)
        {
            inner.handle = None;
        }
        true
    }

    /// Current link, if any
    pub fn current(&self) -> Option<LinkHandle> {
        self.lock().handle.clone()
    }

    /// Remove and return the current link
    pub fn take(&self) -> Option<LinkHandle> {
        self.lock().handle.take()
    }

    /// Remove `handle` if it is still the current link
    pub fn discard(&self, handle: &LinkHandle) -> bool {
        let mut inner = self.lock();
        if inner.handle.as_ref().is_some_and(|h| h.same_link(handle)) {
            inner.handle = None;
            return true;
        }
        false
    }

    pub fn is_connected(&self) -> bool {
        self.lock().handle.is_some()
    }
}

impl Default for LinkSlot {
    fn default() -> Self {
        Self::new()
    }
}
