//! TCP reassembly
//!
//! Leaf components consumed by the session layer:
//! - `fsm`: SYN/ACK/FIN progression validator
//! - `options`: TCP option consistency check
//! - `defrag`: IPv4 defragmenter
//! - `buffer`: out-of-order segment buffer producing scatter-gather spans
//!
//! The orchestrating [`Assembler`] lives in `assembler`.

pub mod assembler;
pub mod buffer;
pub mod defrag;
pub mod fsm;
pub mod options;

pub use assembler::Assembler;
pub use buffer::{Span, StreamBuffer};
pub use defrag::Ipv4Defragmenter;
pub use fsm::TcpFsm;
pub use options::TcpOptionCheck;

use serde::{Deserialize, Serialize};

/// Direction of data flow within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Client to server (initiator)
    ClientToServer,
    /// Server to client (responder)
    ServerToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}
