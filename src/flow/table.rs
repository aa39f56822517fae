//! Flow table with update-or-create semantics and timeout eviction
//!
//! A single mutex guards the whole map; critical sections are short. Every
//! `flush_interval` upserts the table is scanned and entries idle longer
//! than `flow_timeout` (relative to the latest packet timestamp) are moved
//! out and written on a detached thread, so ingestion never waits on the
//! sink.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::FlowConfig;
use crate::core::record::{FlowRecord, FlowScope, Record, Sink};
use crate::core::Packet;
use crate::stats::ErrorMap;

use super::FlowKey;

pub struct FlowTable {
    scope: FlowScope,
    items: Mutex<HashMap<FlowKey, FlowRecord>>,
    processed: AtomicU64,
    config: FlowConfig,
    sink: Arc<dyn Sink>,
    errors: Arc<ErrorMap>,
}

impl FlowTable {
    pub fn new(
        scope: FlowScope,
        config: FlowConfig,
        sink: Arc<dyn Sink>,
        errors: Arc<ErrorMap>,
    ) -> Self {
        Self {
            scope,
            items: Mutex::new(HashMap::new()),
            processed: AtomicU64::new(0),
            config,
            sink,
            errors,
        }
    }

    /// Update or create the flow for this packet.
    /// Returns true when a new entry was created.
    pub fn upsert(&self, pkt: &Packet) -> bool {
        let key = FlowKey::for_scope(self.scope, pkt);
        let ts = pkt.timestamp_nanos();

        let created = {
            let mut items = self.items.lock();

            match items.entry(key) {
                Entry::Occupied(mut entry) => {
                    update_record(entry.get_mut(), pkt, ts);
                    false
                }
                Entry::Vacant(entry) => {
                    entry.insert(new_record(self.scope, pkt, ts));
                    true
                }
            }
        };

        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.flush_interval != 0 && processed % self.config.flush_interval == 0 {
            self.flush_expired(ts);
        }

        created
    }

    /// Evict entries whose last-seen timestamp is older than the flow
    /// timeout relative to `now_ns` and write them out in the background.
    fn flush_expired(&self, now_ns: i64) {
        let timeout = Duration::seconds(self.config.flow_timeout as i64)
            .num_nanoseconds()
            .unwrap_or(i64::MAX);

        let expired: Vec<FlowRecord> = {
            let mut items = self.items.lock();
            let keys: Vec<FlowKey> = items
                .iter()
                .filter(|(_, r)| now_ns.saturating_sub(r.timestamp_last) > timeout)
                .map(|(k, _)| *k)
                .collect();

            keys.iter().filter_map(|k| items.remove(k)).collect()
        };

        if expired.is_empty() {
            return;
        }

        debug!(scope = %self.scope, count = expired.len(), "flushing expired flows");

        // write-out happens off the packet path; at-most-once, no retry
        let sink = Arc::clone(&self.sink);
        let errors = Arc::clone(&self.errors);
        std::thread::spawn(move || {
            for record in expired {
                if let Err(e) = sink.write(&Record::Flow(record)) {
                    errors.inc("flow-write");
                    warn!(error = %e, "failed to write flow record");
                }
            }
        });
    }

    /// Synchronously write out every remaining entry. Called at shutdown.
    pub fn flush_all(&self) {
        let remaining: Vec<FlowRecord> = {
            let mut items = self.items.lock();
            items.drain().map(|(_, r)| r).collect()
        };

        for record in remaining {
            if let Err(e) = self.sink.write(&Record::Flow(record)) {
                self.errors.inc("flow-write");
                warn!(error = %e, "failed to write flow record");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Look up a snapshot of the record for a packet's flow
    pub fn get(&self, pkt: &Packet) -> Option<FlowRecord> {
        let key = FlowKey::for_scope(self.scope, pkt);
        self.items.lock().get(&key).cloned()
    }
}

fn new_record(scope: FlowScope, pkt: &Packet, ts: i64) -> FlowRecord {
    let mut record = FlowRecord {
        scope: Some(scope),
        timestamp_first: ts,
        timestamp_last: ts,
        duration: 0,
        num_packets: 1,
        total_size: pkt.raw_len as u64,
        ..Default::default()
    };

    set_endpoints(&mut record, pkt);

    if let Some(eth) = &pkt.ethernet {
        let _ = eth;
        record.link_proto = "Ethernet".to_string();
    }
    if let Some(l3) = &pkt.layer3 {
        record.network_proto = l3.name().to_string();
    }
    if let Some(l4) = &pkt.layer4 {
        record.transport_proto = l4.name().to_string();
    }

    record
}

fn update_record(record: &mut FlowRecord, pkt: &Packet, ts: i64) {
    let mut calc_duration = false;

    // a packet captured before (or exactly at) the stored first-seen
    // timestamp establishes the true flow direction
    if record.timestamp_first >= ts {
        calc_duration = true;
        record.timestamp_first = ts;
        set_endpoints(record, pkt);
    }

    if record.timestamp_last < ts {
        record.timestamp_last = ts;
        calc_duration = true;
    }

    record.num_packets += 1;
    record.total_size += pkt.raw_len as u64;

    if calc_duration {
        record.duration = record.timestamp_last - record.timestamp_first;
    }
}

fn set_endpoints(record: &mut FlowRecord, pkt: &Packet) {
    if let Some(eth) = &pkt.ethernet {
        record.src_mac = eth.src_mac_string();
        record.dst_mac = eth.dst_mac_string();
    }
    if let Some(l3) = &pkt.layer3 {
        record.src_ip = l3.src_ip().to_string();
        record.dst_ip = l3.dst_ip().to_string();
    }
    if let Some(l4) = &pkt.layer4 {
        if let Some(sp) = l4.src_port() {
            record.src_port = sp.to_string();
        }
        if let Some(dp) = l4.dst_port() {
            record.dst_port = dp.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layers::TcpFlags;
    use crate::core::packet::testutil::*;
    use crate::core::record::MemorySink;

    fn table_with_sink(config: FlowConfig) -> (FlowTable, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let table = FlowTable::new(
            FlowScope::Connection,
            config,
            sink.clone(),
            Arc::new(ErrorMap::new()),
        );
        (table, sink)
    }

    fn packet_at(ts_ns: i64) -> Packet {
        tcp_packet(client_ip(), server_ip(), 50000, 80, TcpFlags::default(), 0, b"x", ts_ns)
    }

    #[test]
    fn test_upsert_create_then_update() {
        let (table, _) = table_with_sink(FlowConfig::default());

        assert!(table.upsert(&packet_at(1_000)));
        assert!(!table.upsert(&packet_at(2_000)));
        assert_eq!(table.len(), 1);

        let record = table.get(&packet_at(0)).unwrap();
        assert_eq!(record.num_packets, 2);
        assert_eq!(record.timestamp_first, 1_000);
        assert_eq!(record.timestamp_last, 2_000);
        assert_eq!(record.duration, 1_000);
    }

    #[test]
    fn test_duration_invariant() {
        let (table, _) = table_with_sink(FlowConfig::default());

        // out-of-order arrivals, duration must track last - first throughout
        for ts in [5_000i64, 2_000, 9_000, 3_000] {
            table.upsert(&packet_at(ts));
            let record = table.get(&packet_at(0)).unwrap();
            assert!(record.timestamp_first <= record.timestamp_last);
            assert_eq!(
                record.duration,
                record.timestamp_last - record.timestamp_first
            );
        }

        let record = table.get(&packet_at(0)).unwrap();
        assert_eq!(record.timestamp_first, 2_000);
        assert_eq!(record.timestamp_last, 9_000);
    }

    #[test]
    fn test_earlier_packet_rewrites_direction() {
        let (table, _) = table_with_sink(FlowConfig::default());

        // reply observed first: server appears as the source
        let reply = tcp_packet(server_ip(), client_ip(), 80, 50000, TcpFlags::default(), 0, b"", 5_000);
        // hash orientation differs per direction, so force the same key by
        // upserting the same direction twice with different timestamps
        table.upsert(&reply);

        let earlier = tcp_packet(server_ip(), client_ip(), 80, 50000, TcpFlags::default(), 0, b"", 1_000);
        table.upsert(&earlier);

        let record = table.get(&reply).unwrap();
        assert_eq!(record.timestamp_first, 1_000);
        assert_eq!(record.src_ip, "10.0.0.1");
    }

    #[test]
    fn test_eviction_after_flush_boundary() {
        let config = FlowConfig {
            flush_interval: 2,
            flow_timeout: 1, // second
        };
        let (table, sink) = table_with_sink(config);

        table.upsert(&packet_at(0));

        // second upsert for a different flow far in the future triggers the
        // flush scan; the first flow is idle longer than the timeout
        let late = tcp_packet(client_ip(), server_ip(), 50001, 80, TcpFlags::default(), 0, b"", 10_000_000_000);
        table.upsert(&late);

        // eviction write-out is asynchronous
        for _ in 0..50 {
            if sink.len() == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        assert_eq!(table.len(), 1);
        let flows = sink.filter(|r| match r {
            Record::Flow(f) => Some(f.clone()),
            _ => None,
        });
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].num_packets, 1);
    }

    #[test]
    fn test_flush_all() {
        let (table, sink) = table_with_sink(FlowConfig::default());
        table.upsert(&packet_at(1));
        table.upsert(&tcp_packet(client_ip(), server_ip(), 50001, 80, TcpFlags::default(), 0, b"", 2));

        table.flush_all();
        assert!(table.is_empty());
        assert_eq!(sink.len(), 2);
    }
}
