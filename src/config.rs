//! Engine configuration
//!
//! Nested per-subsystem config structs with serde support.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the capture engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub reassembly: ReassemblyConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub flows: FlowConfig,

    #[serde(default)]
    pub fingerprint: FingerprintConfig,
}

/// TCP reassembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassemblyConfig {
    /// Force a flush pass every N processed packets (0 disables)
    pub flush_every: u64,

    /// Close streams with pending out-of-order data older than this (seconds)
    pub close_pending_timeout: u64,

    /// Fully close streams inactive longer than this (seconds)
    pub close_inactive_timeout: u64,

    /// Accept streams picked up mid-connection (no SYN observed)
    pub allow_missing_init: bool,

    /// Keep processing segments the state machine rejected
    pub ignore_fsm_errors: bool,

    /// Disable the TCP option consistency check
    pub no_option_check: bool,

    /// Drop segments whose checksum was flagged invalid by the capture layer
    pub verify_checksum: bool,

    /// Reassemble fragmented IPv4 datagrams before TCP processing
    pub defrag_ipv4: bool,

    /// Discard incomplete fragment sets older than this (seconds)
    pub defrag_timeout: u64,

    /// Largest sequence gap still buffered as out-of-order data
    pub max_seq_gap: u32,

    /// Out-of-order buffer cap per direction (bytes)
    pub max_pending_bytes: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            flush_every: 100,
            close_pending_timeout: 30,
            close_inactive_timeout: 120,
            allow_missing_init: true,
            ignore_fsm_errors: false,
            no_option_check: false,
            verify_checksum: false,
            defrag_ipv4: true,
            defrag_timeout: 30,
            max_seq_gap: 65535,
            max_pending_bytes: 1024 * 1024,
        }
    }
}

impl ReassemblyConfig {
    pub fn close_pending(&self) -> Duration {
        Duration::from_secs(self.close_pending_timeout)
    }

    pub fn close_inactive(&self) -> Duration {
        Duration::from_secs(self.close_inactive_timeout)
    }
}

/// Per-session stream reader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Capacity of the channel between reassembler and each stream reader.
    /// Backpressure policy: a full channel drops the chunk after
    /// `feed_timeout_ms` and counts it, keeping the packet path live.
    pub channel_capacity: usize,

    /// How long feeding a chunk may block before dropping it (milliseconds)
    pub feed_timeout_ms: u64,

    /// A reader with no data for this long reports EOF (seconds)
    pub dead_stream_timeout: u64,

    /// How long shutdown waits for reader threads to drain (seconds)
    pub shutdown_timeout: u64,

    /// Number of leading server-stream bytes kept as the service banner
    pub banner_size: usize,

    /// Number of leading conversation bytes fed to credential harvesters
    pub harvester_banner_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            feed_timeout_ms: 100,
            dead_stream_timeout: 10,
            shutdown_timeout: 5,
            banner_size: 512,
            harvester_banner_size: 4096,
        }
    }
}

impl StreamConfig {
    pub fn feed_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_timeout_ms)
    }

    pub fn dead_stream(&self) -> Duration {
        Duration::from_secs(self.dead_stream_timeout)
    }
}

/// Flow / connection table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Scan the table for expired entries every N upserts (0 disables)
    pub flush_interval: u64,

    /// Entries idle longer than this relative to the latest packet are
    /// evicted (seconds)
    pub flow_timeout: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            flush_interval: 1000,
            flow_timeout: 86_400,
        }
    }
}

/// Service / credential fingerprinting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintConfig {
    /// Master switch for the fingerprinting subsystem
    pub enabled: bool,

    /// Path to an nmap-service-probes file. When unset, only credential
    /// harvesters run.
    pub probe_file: Option<PathBuf>,

    /// Stop matching probes after the first hit
    pub stop_after_probe_match: bool,

    /// Stop running harvesters after the first hit
    pub stop_after_harvester_match: bool,

    /// Run credential harvesters over reconstructed conversations
    pub use_harvesters: bool,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_file: None,
            stop_after_probe_match: true,
            stop_after_harvester_match: true,
            use_harvesters: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.reassembly.flush_every, 100);
        assert!(config.reassembly.allow_missing_init);
        assert_eq!(config.stream.channel_capacity, 100);
        assert_eq!(config.flows.flush_interval, 1000);
        assert!(config.fingerprint.enabled);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reassembly.max_seq_gap, config.reassembly.max_seq_gap);
        assert_eq!(back.stream.banner_size, config.stream.banner_size);
    }
}
