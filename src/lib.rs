//! SafeWay companion link
//!
//! Finds the bonded companion device by name, opens a serial-port-profile
//! stream to it with bounded fixed-delay retries, and hands the open link to
//! writers through an explicitly owned slot.

pub mod config;
pub mod connection;
pub mod host;
pub mod peer;
pub mod permission;
pub mod transport;
pub mod writer;

pub use config::{LinkConfig, TransportMode};
pub use connection::{
    ConnectSession, ConnectionEvent, ConnectionListener, ConnectionManager, LinkHandle, LinkSlot,
};
pub use writer::LinkWriter;
