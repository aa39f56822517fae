//! Directional stream readers
//!
//! One reader thread per direction blocks on its bounded channel and
//! records every chunk for later conversation reconstruction. EOF comes
//! from the channel disconnecting (the session dropped the sender) or
//! from the dead-stream timeout, so a stalled reassembly never wedges a
//! reader forever.
//!
//! Cleanup follows a first-closer-defers, second-closer-executes
//! protocol: only the last direction to finish runs end-of-session
//! processing, exactly once.

use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, trace};

use crate::core::record::Record;
use crate::protocols::decode_stream;
use crate::reassembly::Direction;

use super::factory::ActiveCounter;
use super::session::SessionCore;
use super::{StreamData, StreamPipeline};

/// One direction of a session, drained by its own thread
pub struct StreamReader {
    rx: Receiver<StreamData>,
    core: Arc<SessionCore>,
    pipeline: Arc<StreamPipeline>,
    is_client: bool,
}

impl StreamReader {
    pub fn new(
        rx: Receiver<StreamData>,
        core: Arc<SessionCore>,
        pipeline: Arc<StreamPipeline>,
        is_client: bool,
    ) -> Self {
        Self {
            rx,
            core,
            pipeline,
            is_client,
        }
    }

    /// Drain the channel until EOF, then run cleanup. This is the body of
    /// the per-direction thread.
    pub fn run(self, active: Arc<ActiveCounter>) {
        let timeout = self.pipeline.config.stream.dead_stream();

        loop {
            match self.rx.recv_timeout(timeout) {
                Ok(chunk) => self.record(chunk),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    trace!(ident = %self.core.ident, "dead stream timeout");
                    break;
                }
            }
        }

        self.cleanup();
        active.done();
    }

    /// Append one chunk to the session record, under the session lock
    /// shared with the sibling direction.
    fn record(&self, chunk: StreamData) {
        let mut data = self.core.data.lock();
        let len = chunk.raw.len() as u64;

        if self.is_client {
            data.client_bytes += len;
            data.client_data.push(chunk);
        } else {
            data.server_bytes += len;
            if data.first_server_packet.is_none() {
                data.first_server_packet = Some(chunk.timestamp);
            }
            data.server_data.push(chunk);
        }
    }

    /// First closer only decrements; the second closer performs final
    /// processing before signalling the factory.
    fn cleanup(&self) {
        if self.core.countdown() {
            post_process(&self.core, &self.pipeline);
        }
    }
}

/// End-of-session processing: merge the conversation, record the service
/// banner, run credential harvesters and invoke the protocol decoder.
/// Runs exactly once per session, after both directions have drained.
pub fn post_process(core: &SessionCore, pipeline: &StreamPipeline) {
    let Some(conv) = core.conversation() else {
        return;
    };

    debug!(ident = %core.ident, kind = core.kind.name(), chunks = conv.data.len(), "session complete");

    let (bytes_client, bytes_server) = core.byte_counts();
    let stream_cfg = &pipeline.config.stream;

    // service banner: leading bytes of the server stream
    let banner = conv.side(Direction::ServerToClient, stream_cfg.banner_size);
    pipeline
        .fingerprint
        .save_service_banner(&conv, &banner, bytes_client, bytes_server, &pipeline.stats);

    // credential harvesters see the merged conversation head
    let mut raw = conv.raw();
    raw.truncate(stream_cfg.harvester_banner_size);
    for creds in pipeline
        .fingerprint
        .harvest_credentials(&raw, &conv, &pipeline.stats)
    {
        pipeline.write_record(&Record::Credentials(creds));
    }

    decode_stream(core.kind, &conv, pipeline);

    pipeline.stats.inc(&pipeline.stats.saved_sessions);
}
