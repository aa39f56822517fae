//! TCP session handling
//!
//! The factory classifies new 4-tuples by well-known port, allocates a
//! pair of directional stream readers and spawns one reader thread per
//! direction. Decoding runs once both directions have drained.

pub mod conversation;
pub mod factory;
pub mod reader;
pub mod session;

pub use conversation::{decode_conversation, ByteReader, ConversationInfo, DecodeError};
pub use factory::StreamFactory;
pub use reader::StreamReader;
pub use session::{SessionCore, TcpSession};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::record::Sink;
use crate::fingerprint::FingerprintEngine;
use crate::reassembly::Direction;
use crate::stats::{ErrorMap, Stats};

/// Well-known ports used for classification. Fixed constants, not
/// configuration.
pub const PORT_HTTP: u16 = 80;
pub const PORT_POP3: u16 = 110;
pub const PORT_SSH: u16 = 22;
pub const PORT_HTTPS: u16 = 443;

/// Session classification decided on the first packet of a 4-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Http,
    Pop3,
    Ssh,
    /// Unclassified TCP; still reconstructed for banners and harvesters
    Tcp,
    /// TLS and friends: tracked for FSM bookkeeping only, never decoded
    Encrypted,
}

impl StreamKind {
    /// Whether sessions of this kind get stream readers at all
    pub fn spawns_readers(&self) -> bool {
        !matches!(self, StreamKind::Encrypted)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Http => "HTTP",
            StreamKind::Pop3 => "POP3",
            StreamKind::Ssh => "SSH",
            StreamKind::Tcp => "TCP",
            StreamKind::Encrypted => "encrypted",
        }
    }
}

/// Classify a first packet by its ports.
/// Returns the kind and true when src/dst must be swapped so the client
/// is the side talking **to** the well-known port.
pub fn classify(src_port: u16, dst_port: u16) -> (StreamKind, bool) {
    if src_port == PORT_HTTPS || dst_port == PORT_HTTPS {
        return (StreamKind::Encrypted, src_port == PORT_HTTPS);
    }

    for (port, kind) in [
        (PORT_HTTP, StreamKind::Http),
        (PORT_POP3, StreamKind::Pop3),
        (PORT_SSH, StreamKind::Ssh),
    ] {
        if dst_port == port {
            return (kind, false);
        }
        if src_port == port {
            return (kind, true);
        }
    }

    (StreamKind::Tcp, false)
}

/// One reassembled chunk handed to a stream reader
#[derive(Debug, Clone)]
pub struct StreamData {
    pub raw: Vec<u8>,
    /// Capture timestamp of the packet that completed the chunk
    pub timestamp: DateTime<Utc>,
    pub dir: Direction,
}

/// Shared context threaded through session post-processing.
/// Owns the sink, the counters and the fingerprinting stores; constructed
/// once per engine, no process-wide state.
pub struct StreamPipeline {
    pub config: Config,
    pub sink: Arc<dyn Sink>,
    pub stats: Arc<Stats>,
    pub errors: Arc<ErrorMap>,
    pub fingerprint: FingerprintEngine,
}

impl StreamPipeline {
    /// Write a record, counting failures in the error map
    pub fn write_record(&self, record: &crate::core::record::Record) {
        match self.sink.write(record) {
            Ok(()) => {
                self.stats.inc(&self.stats.records_written);
            }
            Err(e) => {
                self.errors.inc(&format!("{}-write", record.kind()));
                tracing::warn!(error = %e, kind = record.kind(), "failed to write record");
            }
        }
    }
}
