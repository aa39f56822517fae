//! TCP reassembler
//!
//! Drives the whole per-packet path: IPv4 defragmentation, session
//! lookup/creation, segment acceptance (FSM, options, checksum),
//! out-of-order buffering and span delivery. Sessions are closed on
//! FIN/RST completion or by timeout-driven flushing; the map entry
//! survives closure to tolerate a trailing ACK.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core::layers::TcpInfo;
use crate::core::Packet;
use crate::stream::{StreamFactory, StreamPipeline, TcpSession};

use super::defrag::parse_tcp_segment;
use super::Ipv4Defragmenter;

/// Direction-insensitive 4-tuple identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    low: (IpAddr, u16),
    high: (IpAddr, u16),
}

impl SessionKey {
    pub fn new(a: (IpAddr, u16), b: (IpAddr, u16)) -> Self {
        if a < b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }
}

/// The packet-order reassembly driver. Single-threaded with respect to
/// packet order; everything concurrent hangs off the sessions it feeds.
pub struct Assembler {
    sessions: HashMap<SessionKey, TcpSession>,
    factory: StreamFactory,
    defrag: Ipv4Defragmenter,
    pipeline: Arc<StreamPipeline>,
    packet_count: u64,
}

impl Assembler {
    pub fn new(pipeline: Arc<StreamPipeline>) -> Self {
        Self {
            sessions: HashMap::new(),
            factory: StreamFactory::new(Arc::clone(&pipeline)),
            defrag: Ipv4Defragmenter::new(),
            pipeline,
            packet_count: 0,
        }
    }

    /// Submit one captured packet to reassembly.
    pub fn process_packet(&mut self, pkt: &Packet) {
        let stats = &self.pipeline.stats;
        let config = &self.pipeline.config.reassembly;

        stats.inc(&stats.packets);
        stats.add(&stats.data_bytes, pkt.raw_len as u64);

        // reassemble fragmented IPv4 datagrams before the TCP layer
        if config.defrag_ipv4 {
            if let Some(ip4) = pkt.layer3.as_ref().and_then(|l3| l3.as_ipv4()) {
                if ip4.is_fragmented() {
                    match self.defrag.process(ip4, pkt.timestamp) {
                        Some((_info, payload)) => {
                            stats.inc(&stats.ip_defrag);
                            if let Some(tcp) = parse_tcp_segment(&payload) {
                                let src = (ip4.src_addr.into(), tcp.src_port);
                                let dst = (ip4.dst_addr.into(), tcp.dst_port);
                                self.process_tcp(src, dst, &tcp, pkt.timestamp);
                                self.maybe_flush(pkt.timestamp);
                            }
                        }
                        None => debug!("fragment received"),
                    }
                    return;
                }
            }
        }

        let (Some(src_ip), Some(dst_ip)) = (pkt.src_ip(), pkt.dst_ip()) else {
            return;
        };
        let Some(tcp) = pkt.tcp() else {
            return;
        };

        let src = (src_ip, tcp.src_port);
        let dst = (dst_ip, tcp.dst_port);
        self.process_tcp(src, dst, tcp, pkt.timestamp);
        self.maybe_flush(pkt.timestamp);
    }

    fn process_tcp(
        &mut self,
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        tcp: &TcpInfo,
        ts: DateTime<Utc>,
    ) {
        let stats = &self.pipeline.stats;
        let reassembly = self.pipeline.config.reassembly.clone();
        let stream = self.pipeline.config.stream.clone();

        stats.add(&stats.total_payload, tcp.payload.len() as u64);

        let key = SessionKey::new(src, dst);
        let factory = &self.factory;
        let session = self
            .sessions
            .entry(key)
            .or_insert_with(|| factory.create_session(src, dst, ts));

        let dir = session.direction_of(src);

        if !session.accept(tcp, dir, &reassembly, stats, &self.pipeline.errors) {
            return;
        }

        session.handle_segment(tcp, dir, ts, &reassembly, &stream, stats);

        if session.is_complete() && !session.closed {
            debug!(ident = %session.core.ident, "session complete, closing streams");
            session.close();
        }
    }

    /// Force a flush pass every `flush_every` packets.
    fn maybe_flush(&mut self, ref_ts: DateTime<Utc>) {
        self.packet_count += 1;

        let config = &self.pipeline.config.reassembly;
        if config.flush_every == 0 || self.packet_count % config.flush_every != 0 {
            return;
        }

        let (flushed, closed) = self.flush_with_options(ref_ts);
        debug!(flushed, closed, "forced flush");
    }

    /// Flush sessions with pending data older than the close-pending
    /// timeout and fully close sessions inactive longer than the
    /// close-inactive timeout. Returns (flushed, closed).
    pub fn flush_with_options(&mut self, ref_ts: DateTime<Utc>) -> (usize, usize) {
        let config = self.pipeline.config.reassembly.clone();
        let stream = self.pipeline.config.stream.clone();
        let stats = Arc::clone(&self.pipeline.stats);

        let pending_cutoff = ref_ts - chrono::Duration::seconds(config.close_pending_timeout as i64);
        let inactive_cutoff = ref_ts - chrono::Duration::seconds(config.close_inactive_timeout as i64);

        let mut flushed = 0;
        let mut closed = 0;

        for session in self.sessions.values_mut() {
            if let Some(oldest) = session.oldest_pending() {
                if oldest < pending_cutoff {
                    session.flush_pending(&config, &stream, &stats);
                    flushed += 1;
                }
            }
        }

        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.last_seen < inactive_cutoff)
            .map(|(k, _)| *k)
            .collect();

        for key in expired {
            if let Some(mut session) = self.sessions.remove(&key) {
                session.close();
                closed += 1;
            }
        }

        // incomplete fragment sets age out on the same clock
        let defrag_cutoff = ref_ts - chrono::Duration::seconds(config.defrag_timeout as i64);
        self.defrag.discard_older(defrag_cutoff);

        (flushed, closed)
    }

    /// Close every remaining session. Called once at shutdown.
    pub fn flush_all(&mut self) -> usize {
        let config = self.pipeline.config.reassembly.clone();
        let stream = self.pipeline.config.stream.clone();
        let stats = Arc::clone(&self.pipeline.stats);

        let mut closed = 0;
        for (_, mut session) in self.sessions.drain() {
            session.flush_pending(&config, &stream, &stats);
            session.close();
            closed += 1;
        }

        info!(closed, "assembler flushed");
        closed
    }

    /// Wait for all session readers to drain, bounded by the timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.factory.wait(timeout)
    }

    pub fn active_readers(&self) -> usize {
        self.factory.active_readers()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::layers::TcpFlags;
    use crate::core::packet::testutil::*;
    use crate::core::record::{MemorySink, Record};
    use crate::fingerprint::FingerprintEngine;
    use crate::stats::{ErrorMap, Stats};
    use std::sync::atomic::Ordering;

    fn assembler_with_sink() -> (Assembler, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let pipeline = Arc::new(StreamPipeline {
            config: Config::default(),
            sink: sink.clone(),
            stats: Arc::new(Stats::new()),
            errors: Arc::new(ErrorMap::new()),
            fingerprint: FingerprintEngine::new(Default::default()).unwrap(),
        });
        (Assembler::new(pipeline), sink)
    }

    fn flags(syn: bool, ack: bool, fin: bool, psh: bool) -> TcpFlags {
        TcpFlags {
            syn,
            ack,
            fin,
            psh,
            ..Default::default()
        }
    }

    /// Full handshake, one request/response exchange, orderly shutdown
    fn run_http_session(assembler: &mut Assembler) {
        let c = client_ip();
        let s = server_ip();
        let mut ts = 0i64;
        let mut next = |pkt: Packet, a: &mut Assembler| {
            a.process_packet(&pkt);
        };

        let mut t = |v: &mut i64| {
            *v += 1_000_000;
            *v
        };

        next(tcp_packet(c, s, 50000, 80, flags(true, false, false, false), 100, b"", t(&mut ts)), assembler);
        next(tcp_packet(s, c, 80, 50000, flags(true, true, false, false), 500, b"", t(&mut ts)), assembler);
        next(tcp_packet(c, s, 50000, 80, flags(false, true, false, false), 101, b"", t(&mut ts)), assembler);

        next(
            tcp_packet(c, s, 50000, 80, flags(false, true, false, true), 101, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n", t(&mut ts)),
            assembler,
        );
        next(
            tcp_packet(s, c, 80, 50000, flags(false, true, false, true), 501, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", t(&mut ts)),
            assembler,
        );

        next(tcp_packet(c, s, 50000, 80, flags(false, true, true, false), 129, b"", t(&mut ts)), assembler);
        next(tcp_packet(s, c, 80, 50000, flags(false, true, true, false), 539, b"", t(&mut ts)), assembler);
    }

    #[test]
    fn test_end_to_end_http_session() {
        let (mut assembler, sink) = assembler_with_sink();

        run_http_session(&mut assembler);
        assert_eq!(assembler.session_count(), 1);

        assembler.flush_all();
        assert!(assembler.wait(Duration::from_secs(5)));

        let records: Vec<_> = sink.filter(|r| match r {
            Record::Http(h) => Some(h.clone()),
            _ => None,
        });
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "GET");
        assert_eq!(records[0].uri, "/x");
        assert_eq!(records[0].status_code, 200);
    }

    #[test]
    fn test_post_processing_runs_once() {
        let (mut assembler, _sink) = assembler_with_sink();

        run_http_session(&mut assembler);
        assembler.flush_all();
        assert!(assembler.wait(Duration::from_secs(5)));

        let stats = &assembler.pipeline.stats;
        assert_eq!(stats.saved_sessions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_inactive_session_closed_by_flush() {
        let (mut assembler, _) = assembler_with_sink();
        let c = client_ip();
        let s = server_ip();

        assembler.process_packet(&tcp_packet(c, s, 50000, 80, flags(true, false, false, false), 100, b"", 0));
        assert_eq!(assembler.session_count(), 1);

        // two minutes of idle time later
        let later = chrono::TimeZone::timestamp_nanos(&chrono::Utc, 300_000_000_000);
        let (_, closed) = assembler.flush_with_options(later);
        assert_eq!(closed, 1);
        assert_eq!(assembler.session_count(), 0);
    }

    #[test]
    fn test_encrypted_session_tracked_without_readers() {
        let (mut assembler, _) = assembler_with_sink();
        let c = client_ip();
        let s = server_ip();

        assembler.process_packet(&tcp_packet(c, s, 50000, 443, flags(true, false, false, false), 100, b"", 0));
        assert_eq!(assembler.session_count(), 1);
        assert_eq!(assembler.active_readers(), 0);
    }

    #[test]
    fn test_fragmented_datagram_reassembled() {
        use crate::core::layers::{Ipv4Info, Layer3};

        let (mut assembler, _) = assembler_with_sink();

        // build a TCP SYN inside a fragmented datagram
        let mut seg = vec![0u8; 20];
        seg[0..2].copy_from_slice(&50000u16.to_be_bytes());
        seg[2..4].copy_from_slice(&80u16.to_be_bytes());
        seg[4..8].copy_from_slice(&100u32.to_be_bytes());
        seg[12] = 5 << 4;
        seg[13] = 0x02; // SYN

        let frag = |offset: u16, mf: bool, data: &[u8], ts_ns: i64| Packet {
            timestamp: ts(ts_ns),
            ethernet: None,
            layer3: Some(Layer3::Ipv4(Ipv4Info {
                src_addr: "192.168.1.100".parse().unwrap(),
                dst_addr: "10.0.0.1".parse().unwrap(),
                protocol: 6,
                identification: 7,
                flags: if mf { 0x01 } else { 0 },
                fragment_offset: offset,
                fragment_data: data.to_vec(),
                ..Default::default()
            })),
            layer4: None,
            raw_len: (20 + data.len()) as u32,
        };

        assembler.process_packet(&frag(0, true, &seg[..16], 0));
        assert_eq!(assembler.session_count(), 0);

        assembler.process_packet(&frag(2, false, &seg[16..], 1));
        assert_eq!(assembler.session_count(), 1);

        let stats = &assembler.pipeline.stats;
        assert_eq!(stats.ip_defrag.load(Ordering::Relaxed), 1);
    }
}
