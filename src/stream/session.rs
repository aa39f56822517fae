//! Bidirectional TCP session state
//!
//! [`SessionCore`] is shared between the packet path and the two reader
//! threads; its mutex is the single synchronization point for everything
//! both directions touch. [`TcpSession`] is the packet-path side: buffers,
//! state machine, option checker and the sending ends of the reader
//! channels. Channel closure is owned here, never by a direction.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{ReassemblyConfig, StreamConfig};
use crate::core::layers::TcpInfo;
use crate::reassembly::buffer::Span;
use crate::reassembly::{Direction, StreamBuffer, TcpFsm, TcpOptionCheck};
use crate::stats::{ErrorMap, Stats};

use super::conversation::ConversationInfo;
use super::{StreamData, StreamKind};

/// Chunk lists and byte counters shared between both directions
#[derive(Debug, Default)]
pub struct SessionData {
    pub client_data: Vec<StreamData>,
    pub server_data: Vec<StreamData>,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub first_server_packet: Option<DateTime<Utc>>,
    /// End-of-session processing already ran
    pub saved: bool,
}

/// State shared with the reader threads
pub struct SessionCore {
    pub ident: String,
    pub kind: StreamKind,
    pub client_ip: String,
    pub server_ip: String,
    pub client_port: u16,
    pub server_port: u16,
    pub first_packet: DateTime<Utc>,
    pub data: Mutex<SessionData>,
    /// Countdown from 2; the closer that reaches zero runs post-processing
    close_countdown: AtomicUsize,
}

impl SessionCore {
    pub fn new(
        ident: String,
        kind: StreamKind,
        client_ip: String,
        server_ip: String,
        client_port: u16,
        server_port: u16,
        first_packet: DateTime<Utc>,
    ) -> Self {
        Self {
            ident,
            kind,
            client_ip,
            server_ip,
            client_port,
            server_port,
            first_packet,
            data: Mutex::new(SessionData::default()),
            close_countdown: AtomicUsize::new(2),
        }
    }

    /// Decrement the close countdown.
    /// Returns true for the caller that closed the session last; only that
    /// caller runs end-of-session processing.
    pub fn countdown(&self) -> bool {
        self.close_countdown.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Merge both directions into a timestamp-sorted conversation.
    /// Returns None when post-processing already ran.
    pub fn conversation(&self) -> Option<ConversationInfo> {
        let mut data = self.data.lock();
        if data.saved {
            return None;
        }
        data.saved = true;

        let mut merged: Vec<StreamData> = Vec::with_capacity(
            data.client_data.len() + data.server_data.len(),
        );
        merged.extend(data.client_data.iter().cloned());
        merged.extend(data.server_data.iter().cloned());
        merged.sort_by_key(|d| d.timestamp);

        Some(ConversationInfo {
            ident: self.ident.clone(),
            client_ip: self.client_ip.clone(),
            server_ip: self.server_ip.clone(),
            client_port: self.client_port,
            server_port: self.server_port,
            first_client_packet: self.first_packet.timestamp_nanos_opt().unwrap_or(0),
            first_server_packet: data
                .first_server_packet
                .and_then(|t| t.timestamp_nanos_opt())
                .unwrap_or(0),
            data: merged,
        })
    }

    pub fn byte_counts(&self) -> (u64, u64) {
        let data = self.data.lock();
        (data.client_bytes, data.server_bytes)
    }
}

/// Packet-path side of one tracked connection
pub struct TcpSession {
    pub core: Arc<SessionCore>,

    fsm: TcpFsm,
    optchecker: TcpOptionCheck,
    fsm_err: bool,

    client_tx: Option<Sender<StreamData>>,
    server_tx: Option<Sender<StreamData>>,

    pub client_buffer: StreamBuffer,
    pub server_buffer: StreamBuffer,

    client_addr: (IpAddr, u16),

    pub client_fin: bool,
    pub server_fin: bool,
    pub rst: bool,
    pub closed: bool,

    pub last_seen: DateTime<Utc>,
}

impl TcpSession {
    pub fn new(
        core: Arc<SessionCore>,
        client_addr: (IpAddr, u16),
        client_tx: Option<Sender<StreamData>>,
        server_tx: Option<Sender<StreamData>>,
        config: &ReassemblyConfig,
        first_packet: DateTime<Utc>,
    ) -> Self {
        Self {
            core,
            fsm: TcpFsm::new(config.allow_missing_init),
            optchecker: TcpOptionCheck::new(),
            fsm_err: false,
            client_tx,
            server_tx,
            client_buffer: StreamBuffer::new(config.max_seq_gap, config.max_pending_bytes),
            server_buffer: StreamBuffer::new(config.max_seq_gap, config.max_pending_bytes),
            client_addr,
            client_fin: false,
            server_fin: false,
            rst: false,
            closed: false,
            last_seen: first_packet,
        }
    }

    /// Which direction a packet from this source belongs to
    pub fn direction_of(&self, src: (IpAddr, u16)) -> Direction {
        if src == self.client_addr {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }

    /// Decide whether a segment enters reassembly: state machine check,
    /// option consistency check, then the checksum verdict.
    pub fn accept(
        &mut self,
        tcp: &TcpInfo,
        dir: Direction,
        config: &ReassemblyConfig,
        stats: &Stats,
        errors: &ErrorMap,
    ) -> bool {
        if !self.fsm.check(tcp, dir) {
            debug!(ident = %self.core.ident, state = %self.fsm.state(), "segment rejected by FSM");
            stats.inc(&stats.reject_fsm);
            errors.inc("FSM");

            if !self.fsm_err {
                self.fsm_err = true;
                stats.inc(&stats.reject_conn_fsm);
            }

            if !config.ignore_fsm_errors {
                return false;
            }
        }

        if !config.no_option_check {
            if let Err(reason) = self.optchecker.accept(tcp, dir) {
                debug!(ident = %self.core.ident, reason = %reason, "segment rejected by option check");
                stats.inc(&stats.reject_opt);
                errors.inc("OptionChecker");
                return false;
            }
        }

        if config.verify_checksum && tcp.checksum_valid == Some(false) {
            debug!(ident = %self.core.ident, "segment rejected by checksum");
            stats.inc(&stats.reject_checksum);
            errors.inc("Checksum");
            return false;
        }

        true
    }

    /// Run one accepted segment through reassembly and deliver any
    /// released spans to the direction's reader.
    pub fn handle_segment(
        &mut self,
        tcp: &TcpInfo,
        dir: Direction,
        ts: DateTime<Utc>,
        reassembly: &ReassemblyConfig,
        stream: &StreamConfig,
        stats: &Stats,
    ) {
        if ts > self.last_seen {
            self.last_seen = ts;
        }

        // ISN capture
        if tcp.is_syn() && dir == Direction::ClientToServer {
            self.client_buffer.set_initial_seq(tcp.seq);
        } else if tcp.is_syn_ack() && dir == Direction::ServerToClient {
            self.server_buffer.set_initial_seq(tcp.seq);
        }

        if !tcp.payload.is_empty() {
            let buffer = match dir {
                Direction::ClientToServer => &mut self.client_buffer,
                Direction::ServerToClient => &mut self.server_buffer,
            };

            let outcome = buffer.add_segment(tcp.seq, &tcp.payload, ts);

            if outcome.queued_bytes > 0 {
                stats.inc(&stats.out_of_order_packets);
                stats.add(&stats.out_of_order_bytes, outcome.queued_bytes as u64);
            }
            if outcome.overlap_bytes > 0 {
                stats.inc(&stats.overlap_packets);
                stats.add(&stats.overlap_bytes, outcome.overlap_bytes as u64);
            }
            if outcome.dropped_bytes > 0 {
                stats.add(&stats.missed_bytes, outcome.dropped_bytes as u64);
            }

            if let Some(span) = outcome.span {
                self.feed(span, dir, reassembly, stream, stats);
            }
        }

        if tcp.flags.fin {
            match dir {
                Direction::ClientToServer => self.client_fin = true,
                Direction::ServerToClient => self.server_fin = true,
            }
        }
        if tcp.flags.rst {
            self.rst = true;
        }
    }

    /// Deliver a span to the direction's reader channel.
    ///
    /// Spans missing bytes are dropped rather than decoded; a span whose
    /// start was never seen passes only when mid-stream pickup is allowed.
    /// A full channel drops the chunk after the feed timeout, trading data
    /// loss for packet-path liveness.
    fn feed(
        &mut self,
        span: Span,
        dir: Direction,
        reassembly: &ReassemblyConfig,
        stream: &StreamConfig,
        stats: &Stats,
    ) {
        if span.chunks > 1 {
            stats.inc(&stats.reassembled);
        }
        stats.record_chunk(span.data.len());

        if span.skipped > 0 {
            stats.add(&stats.missed_bytes, span.skipped as u64);
            return;
        }
        if span.skipped == -1 && !reassembly.allow_missing_init {
            return;
        }

        let tx = match dir {
            Direction::ClientToServer => self.client_tx.as_ref(),
            Direction::ServerToClient => self.server_tx.as_ref(),
        };
        let Some(tx) = tx else {
            return;
        };

        let chunk = StreamData {
            raw: span.data,
            timestamp: span.timestamp,
            dir,
        };

        if tx.send_timeout(chunk, stream.feed_timeout()).is_err() {
            stats.inc(&stats.dropped_chunks);
        }
    }

    /// Jump over gaps in both directions, releasing parked data. Spans
    /// with a real gap are discarded (decoding an incomplete byte
    /// sequence is worse than dropping it).
    pub fn flush_pending(
        &mut self,
        reassembly: &ReassemblyConfig,
        stream: &StreamConfig,
        stats: &Stats,
    ) {
        for dir in [Direction::ClientToServer, Direction::ServerToClient] {
            loop {
                let buffer = match dir {
                    Direction::ClientToServer => &mut self.client_buffer,
                    Direction::ServerToClient => &mut self.server_buffer,
                };
                match buffer.skip_gap() {
                    Some(span) => self.feed(span, dir, reassembly, stream, stats),
                    None => break,
                }
            }
        }
    }

    /// Close the session: drop both senders so the readers see EOF.
    /// The map entry survives to tolerate a trailing ACK.
    pub fn close(&mut self) {
        self.closed = true;
        self.client_tx = None;
        self.server_tx = None;
    }

    /// Both directions finished, or the connection was reset
    pub fn is_complete(&self) -> bool {
        self.rst || (self.client_fin && self.server_fin)
    }

    /// Timestamp of the oldest parked out-of-order data, if any
    pub fn oldest_pending(&self) -> Option<DateTime<Utc>> {
        match (
            self.client_buffer.oldest_pending(),
            self.server_buffer.oldest_pending(),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
