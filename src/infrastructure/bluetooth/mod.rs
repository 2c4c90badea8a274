//! Bluetooth stack: discovery, the two transports, wire framing, the line
//! protocol, and the session that ties them together.

pub mod classic;
pub mod framing;
pub mod le;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod transport;

pub use classic::{ClassicConfig, ClassicTransport};
pub use le::{LeConfig, LeTransport};
pub use protocol::Command;
pub use scanner::Scanner;
pub use session::Session;
pub use transport::{Transport, TransportError, TransportKind};
