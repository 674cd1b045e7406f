//! Connection management for the companion device link
//!
//! This module handles:
//! - Looking the target peer up among bonded devices
//! - Bounded fixed-delay retries of the transport open
//! - Cooperative cancellation of a running flow
//! - Publishing the open link into a shared slot for writers

mod dispatch;
mod listener;
mod manager;
pub(crate) mod slot;

pub use dispatch::{ChannelDispatcher, DispatchQueue, Dispatcher, InlineDispatcher, Job};
pub use listener::{ConnectionEvent, ConnectionListener, EventForwarder};
pub use manager::{ConnectSession, ConnectionManager, SessionCanceller};
pub use slot::{BoxedStream, LinkHandle, LinkSlot};
