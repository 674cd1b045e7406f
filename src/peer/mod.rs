//! Peer Directory
//!
//! Looks up bonded (previously paired) devices on the local adapter so the
//! connection manager can resolve a peer name to an address.

mod bluez;
mod directory;

pub use bluez::BluezDirectory;
pub use directory::{BondedPeer, PeerDirectory, StaticDirectory};
