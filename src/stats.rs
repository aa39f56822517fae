//! Cumulative processing statistics
//!
//! Counters are atomics so the reader threads and the packet path can
//! update them without taking a lock. A summary table is rendered once at
//! shutdown; individual per-packet errors are never surfaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use tabled::{Table, Tabled};

/// Reassembly and decoding counters
#[derive(Debug, Default)]
pub struct Stats {
    /// Packets handed to the reassembler
    pub packets: AtomicU64,
    /// Raw bytes handed to the reassembler
    pub data_bytes: AtomicU64,
    /// Total TCP payload bytes seen
    pub total_payload: AtomicU64,
    /// IPv4 datagrams reassembled from fragments
    pub ip_defrag: AtomicU64,

    /// Segments rejected by the TCP state machine
    pub reject_fsm: AtomicU64,
    /// Connections with at least one FSM rejection
    pub reject_conn_fsm: AtomicU64,
    /// Segments rejected by the option checker
    pub reject_opt: AtomicU64,
    /// Segments rejected by checksum validation
    pub reject_checksum: AtomicU64,

    /// Bytes skipped because of unfilled gaps
    pub missed_bytes: AtomicU64,
    /// Spans assembled from more than one segment
    pub reassembled: AtomicU64,
    /// Segments buffered out of order
    pub out_of_order_packets: AtomicU64,
    /// Bytes buffered out of order
    pub out_of_order_bytes: AtomicU64,
    /// Bytes deduplicated from overlapping retransmissions
    pub overlap_bytes: AtomicU64,
    /// Segments overlapping already-delivered data
    pub overlap_packets: AtomicU64,
    /// Largest single span in bytes
    pub biggest_chunk_bytes: AtomicI64,

    /// Chunks dropped on a full reader channel
    pub dropped_chunks: AtomicU64,

    /// Sessions whose readers never exited before the shutdown deadline
    pub abandoned_sessions: AtomicU64,
    /// Completed and post-processed TCP sessions
    pub saved_sessions: AtomicU64,

    pub num_requests: AtomicU64,
    pub num_responses: AtomicU64,
    pub num_unmatched_responses: AtomicU64,
    pub num_unanswered_requests: AtomicU64,

    pub num_services: AtomicU64,
    pub num_credentials: AtomicU64,
    pub records_written: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, v: u64) {
        counter.fetch_add(v, Ordering::Relaxed);
    }

    /// Update the biggest-chunk high-water mark
    pub fn record_chunk(&self, len: usize) {
        let len = len as i64;
        let mut cur = self.biggest_chunk_bytes.load(Ordering::Relaxed);
        while len > cur {
            match self.biggest_chunk_bytes.compare_exchange_weak(
                cur,
                len,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => cur = v,
            }
        }
    }

    /// Render the shutdown summary as a two-column table
    pub fn summary(&self) -> String {
        let rows = vec![
            StatRow::new("packets", self.packets.load(Ordering::Relaxed)),
            StatRow::new("data bytes", self.data_bytes.load(Ordering::Relaxed)),
            StatRow::new("total TCP payload", self.total_payload.load(Ordering::Relaxed)),
            StatRow::new("IPv4 defragmented", self.ip_defrag.load(Ordering::Relaxed)),
            StatRow::new("rejected FSM", self.reject_fsm.load(Ordering::Relaxed)),
            StatRow::new("connections rejected FSM", self.reject_conn_fsm.load(Ordering::Relaxed)),
            StatRow::new("rejected options", self.reject_opt.load(Ordering::Relaxed)),
            StatRow::new("rejected checksum", self.reject_checksum.load(Ordering::Relaxed)),
            StatRow::new("missed bytes", self.missed_bytes.load(Ordering::Relaxed)),
            StatRow::new("reassembled chunks", self.reassembled.load(Ordering::Relaxed)),
            StatRow::new("out-of-order packets", self.out_of_order_packets.load(Ordering::Relaxed)),
            StatRow::new("out-of-order bytes", self.out_of_order_bytes.load(Ordering::Relaxed)),
            StatRow::new("overlap packets", self.overlap_packets.load(Ordering::Relaxed)),
            StatRow::new("overlap bytes", self.overlap_bytes.load(Ordering::Relaxed)),
            StatRow::new(
                "biggest chunk bytes",
                self.biggest_chunk_bytes.load(Ordering::Relaxed).max(0) as u64,
            ),
            StatRow::new("dropped chunks", self.dropped_chunks.load(Ordering::Relaxed)),
            StatRow::new("saved sessions", self.saved_sessions.load(Ordering::Relaxed)),
            StatRow::new("abandoned sessions", self.abandoned_sessions.load(Ordering::Relaxed)),
            StatRow::new("HTTP requests", self.num_requests.load(Ordering::Relaxed)),
            StatRow::new("HTTP responses", self.num_responses.load(Ordering::Relaxed)),
            StatRow::new(
                "unmatched responses",
                self.num_unmatched_responses.load(Ordering::Relaxed),
            ),
            StatRow::new(
                "unanswered requests",
                self.num_unanswered_requests.load(Ordering::Relaxed),
            ),
            StatRow::new("services", self.num_services.load(Ordering::Relaxed)),
            StatRow::new("credentials", self.num_credentials.load(Ordering::Relaxed)),
            StatRow::new("records written", self.records_written.load(Ordering::Relaxed)),
        ];

        Table::new(rows).to_string()
    }
}

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "TCP Stat")]
    name: &'static str,
    #[tabled(rename = "Value")]
    value: u64,
}

impl StatRow {
    fn new(name: &'static str, value: u64) -> Self {
        Self { name, value }
    }
}

/// Error-frequency map: error subject -> occurrence count
#[derive(Debug, Default)]
pub struct ErrorMap {
    inner: Mutex<HashMap<String, u64>>,
}

impl ErrorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence of an error subject
    pub fn inc(&self, subject: &str) {
        let mut map = self.inner.lock();
        *map.entry(subject.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, subject: &str) -> u64 {
        self.inner.lock().get(subject).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().values().sum()
    }

    /// Render the error table, or None when no errors were recorded
    pub fn summary(&self) -> Option<String> {
        let map = self.inner.lock();
        if map.is_empty() {
            return None;
        }

        let mut rows: Vec<ErrorRow> = map
            .iter()
            .map(|(subject, count)| ErrorRow {
                subject: subject.clone(),
                count: *count,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then(a.subject.cmp(&b.subject)));

        Some(Table::new(rows).to_string())
    }
}

#[derive(Tabled)]
struct ErrorRow {
    #[tabled(rename = "Error Subject")]
    subject: String,
    #[tabled(rename = "Count")]
    count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_biggest_chunk() {
        let stats = Stats::new();
        stats.record_chunk(100);
        stats.record_chunk(50);
        stats.record_chunk(200);
        assert_eq!(stats.biggest_chunk_bytes.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn test_error_map() {
        let errors = ErrorMap::new();
        assert!(errors.summary().is_none());

        errors.inc("HTTP-request");
        errors.inc("HTTP-request");
        errors.inc("POP3-response");

        assert_eq!(errors.count("HTTP-request"), 2);
        assert_eq!(errors.total(), 3);

        let table = errors.summary().unwrap();
        assert!(table.contains("HTTP-request"));
        assert!(table.contains("POP3-response"));
    }

    #[test]
    fn test_summary_renders() {
        let stats = Stats::new();
        stats.inc(&stats.packets);
        let table = stats.summary();
        assert!(table.contains("packets"));
        assert!(table.contains("rejected FSM"));
    }
}
