pub mod rfcomm;
pub mod tcp;
pub mod traits;

pub use rfcomm::{RfcommTarget, RfcommTransport, RfcommTransportStream};
pub use tcp::{TcpTransport, TcpTransportStream};
pub use traits::{Transport, TransportStream};
