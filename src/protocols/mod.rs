//! Application-layer stream decoders
//!
//! One decoder per classified protocol, each a state machine over the
//! reconstructed conversation bytes. Dispatch goes through the session's
//! [`StreamKind`] tag; there is no decoder inheritance.
//!
//! A parse error inside a decoder never aborts the stream: the replay
//! resynchronizes at the next message boundary and keeps going.

pub mod http;
pub mod pop3;
pub mod ssh;

use crate::stream::{ConversationInfo, StreamKind, StreamPipeline};

/// Decode a completed conversation according to its classification.
/// Generic TCP and encrypted sessions have nothing to decode here; their
/// banners and harvesters already ran in session post-processing.
pub fn decode_stream(kind: StreamKind, conv: &ConversationInfo, pipeline: &StreamPipeline) {
    match kind {
        StreamKind::Http => http::decode(conv, pipeline),
        StreamKind::Pop3 => pop3::decode(conv, pipeline),
        StreamKind::Ssh => ssh::decode(conv, pipeline),
        StreamKind::Tcp | StreamKind::Encrypted => {}
    }
}
