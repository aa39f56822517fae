//! Passive service identification store
//!
//! Services are keyed `serverIP:serverPort`. Every completed session
//! towards a service contributes its flow ident and, when longer than what
//! is already stored, its banner. Probe-extracted fields are merged with
//! deduplicated `"A | B"` concatenation.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::FingerprintConfig;
use crate::core::record::ServiceRecord;
use crate::stats::Stats;
use crate::stream::ConversationInfo;

use super::probes::ProbeSet;

/// Append information to a string using a `|` delimiter, deduplicated
pub fn add_info(old: &str, new: &str) -> String {
    if old.is_empty() {
        return new.to_string();
    }
    if new.is_empty() {
        return old.to_string();
    }
    if old.contains(new) {
        return old.to_string();
    }
    format!("{} | {}", old, new)
}

/// Best-effort service name for a well-known port
pub fn lookup_service_by_port(port: u16) -> &'static str {
    match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "domain",
        80 => "http",
        110 => "pop3",
        143 => "imap",
        443 => "https",
        587 => "submission",
        _ => "",
    }
}

/// All service records seen so far, keyed serverIP:serverPort
#[derive(Debug, Default)]
pub struct ServiceStore {
    items: Mutex<HashMap<String, ServiceRecord>>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a server banner for a completed session.
    ///
    /// An existing record gains the flow ident (deduplicated) and keeps
    /// the longest banner observed; probe matching runs on every call.
    pub fn save_banner(
        &self,
        probes: Option<&ProbeSet>,
        conv: &ConversationInfo,
        banner: &[u8],
        bytes_client: u64,
        bytes_server: u64,
        config: &FingerprintConfig,
        stats: &Stats,
    ) {
        // probing attempts with no server response carry no information
        if bytes_server == 0 {
            return;
        }

        let key = format!("{}:{}", conv.server_ip, conv.server_port);
        let mut items = self.items.lock();

        if let Some(existing) = items.get_mut(&key) {
            if let Some(probes) = probes {
                probes.match_banner(existing, banner, &conv.ident, config.stop_after_probe_match);
            }

            if existing.flows.iter().any(|f| f == &conv.ident) {
                return;
            }
            existing.flows.push(conv.ident.clone());

            // a longer response carries more identification signal
            if existing.banner.len() < banner.len() {
                existing.banner = String::from_utf8_lossy(banner).to_string();
                existing.timestamp = conv.first_client_packet;
            }
            return;
        }

        let mut service = ServiceRecord {
            timestamp: conv.first_client_packet,
            ip: conv.server_ip.clone(),
            port: conv.server_port,
            name: lookup_service_by_port(conv.server_port).to_string(),
            protocol: "TCP".to_string(),
            banner: String::from_utf8_lossy(banner).to_string(),
            bytes_server,
            bytes_client,
            flows: vec![conv.ident.clone()],
            ..Default::default()
        };

        if let Some(probes) = probes {
            probes.match_banner(&mut service, banner, &conv.ident, config.stop_after_probe_match);
        }

        debug!(key = %key, "new service");
        items.insert(key, service);
        stats.inc(&stats.num_services);
    }

    /// Drain every accumulated record. Called once at shutdown.
    pub fn drain(&self) -> Vec<ServiceRecord> {
        self.items.lock().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<ServiceRecord> {
        self.items.lock().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamData;

    fn conv(ident: &str) -> ConversationInfo {
        ConversationInfo {
            ident: ident.to_string(),
            client_ip: "192.168.1.100".into(),
            server_ip: "10.0.0.1".into(),
            client_port: 50000,
            server_port: 110,
            first_client_packet: 1_000,
            first_server_packet: 2_000,
            data: Vec::<StreamData>::new(),
        }
    }

    #[test]
    fn test_add_info() {
        assert_eq!(add_info("", "nginx"), "nginx");
        assert_eq!(add_info("nginx", ""), "nginx");
        assert_eq!(add_info("nginx", "nginx"), "nginx");
        assert_eq!(add_info("nginx", "1.25"), "nginx | 1.25");
        // substring already present is not repeated
        assert_eq!(add_info("nginx | 1.25", "1.25"), "nginx | 1.25");
    }

    #[test]
    fn test_new_service_created() {
        let store = ServiceStore::new();
        let stats = Stats::new();

        store.save_banner(
            None,
            &conv("a"),
            b"+OK POP server ready",
            10,
            20,
            &FingerprintConfig::default(),
            &stats,
        );

        let service = store.get("10.0.0.1:110").unwrap();
        assert_eq!(service.name, "pop3");
        assert_eq!(service.banner, "+OK POP server ready");
        assert_eq!(service.flows, vec!["a".to_string()]);
    }

    #[test]
    fn test_longest_banner_kept() {
        let store = ServiceStore::new();
        let stats = Stats::new();
        let config = FingerprintConfig::default();

        store.save_banner(None, &conv("a"), b"+OK", 1, 4, &config, &stats);
        store.save_banner(None, &conv("b"), b"+OK POP server ready", 1, 20, &config, &stats);
        store.save_banner(None, &conv("c"), b"+O", 1, 2, &config, &stats);

        let service = store.get("10.0.0.1:110").unwrap();
        assert_eq!(service.banner, "+OK POP server ready");
        assert_eq!(service.flows.len(), 3);
    }

    #[test]
    fn test_flow_deduplicated() {
        let store = ServiceStore::new();
        let stats = Stats::new();
        let config = FingerprintConfig::default();

        store.save_banner(None, &conv("a"), b"hi", 1, 2, &config, &stats);
        store.save_banner(None, &conv("a"), b"hi", 1, 2, &config, &stats);

        let service = store.get("10.0.0.1:110").unwrap();
        assert_eq!(service.flows.len(), 1);
    }

    #[test]
    fn test_empty_server_stream_ignored() {
        let store = ServiceStore::new();
        let stats = Stats::new();

        store.save_banner(
            None,
            &conv("a"),
            b"",
            5,
            0,
            &FingerprintConfig::default(),
            &stats,
        );
        assert!(store.is_empty());
    }
}
