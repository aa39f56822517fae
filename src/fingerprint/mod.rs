//! Passive service and credential fingerprinting
//!
//! Matches accumulated server banners against compiled probe signatures
//! and runs credential harvesters over reconstructed conversations.

pub mod credentials;
pub mod probes;
pub mod service;

pub use credentials::{run_harvesters, CredentialStore};
pub use probes::{ProbeSet, ServiceProbe};
pub use service::{add_info, lookup_service_by_port, ServiceStore};

use anyhow::Context;
use tracing::info;

use crate::config::FingerprintConfig;
use crate::core::record::{CredentialRecord, ServiceRecord};
use crate::stats::Stats;
use crate::stream::ConversationInfo;

/// The fingerprinting subsystem: probe signatures plus the service and
/// credential stores. Constructed once per engine.
pub struct FingerprintEngine {
    pub config: FingerprintConfig,
    probes: Option<ProbeSet>,
    services: ServiceStore,
    credentials: CredentialStore,
}

impl FingerprintEngine {
    /// Initialize the subsystem. A configured but unreadable probe file is
    /// fatal for fingerprinting, so the error propagates to the caller.
    pub fn new(config: FingerprintConfig) -> anyhow::Result<Self> {
        let probes = match (&config.enabled, &config.probe_file) {
            (true, Some(path)) => {
                let set = ProbeSet::load_from_file(path)
                    .context("fingerprinting initialization failed")?;
                Some(set)
            }
            _ => None,
        };

        if config.enabled && probes.is_none() {
            info!("no probe file configured, running harvesters only");
        }

        Ok(Self {
            config,
            probes,
            services: ServiceStore::new(),
            credentials: CredentialStore::new(),
        })
    }

    /// Engine with fingerprinting switched off entirely
    pub fn disabled() -> Self {
        Self {
            config: FingerprintConfig {
                enabled: false,
                use_harvesters: false,
                ..Default::default()
            },
            probes: None,
            services: ServiceStore::new(),
            credentials: CredentialStore::new(),
        }
    }

    pub fn probes(&self) -> Option<&ProbeSet> {
        self.probes.as_ref()
    }

    /// Record a service banner for a completed session
    pub fn save_service_banner(
        &self,
        conv: &ConversationInfo,
        banner: &[u8],
        bytes_client: u64,
        bytes_server: u64,
        stats: &Stats,
    ) {
        if !self.config.enabled {
            return;
        }

        self.services.save_banner(
            self.probes.as_ref(),
            conv,
            banner,
            bytes_client,
            bytes_server,
            &self.config,
            stats,
        );
    }

    /// Run the credential harvesters over a conversation; only previously
    /// unseen credentials are returned.
    pub fn harvest_credentials(
        &self,
        data: &[u8],
        conv: &ConversationInfo,
        stats: &Stats,
    ) -> Vec<CredentialRecord> {
        if !self.config.enabled || !self.config.use_harvesters {
            return Vec::new();
        }

        let found = run_harvesters(
            data,
            conv.client_port,
            conv.server_port,
            &conv.ident,
            conv.first_client_packet,
            self.config.stop_after_harvester_match,
        );

        let fresh: Vec<CredentialRecord> = found
            .into_iter()
            .filter(|c| self.credentials.insert(c))
            .collect();

        for _ in &fresh {
            stats.inc(&stats.num_credentials);
        }

        fresh
    }

    /// Register an externally harvested credential (e.g. from the HTTP or
    /// POP3 decoders), deduplicated against everything seen so far.
    pub fn register_credential(&self, creds: &CredentialRecord, stats: &Stats) -> bool {
        if !self.config.enabled {
            return false;
        }
        let fresh = self.credentials.insert(creds);
        if fresh {
            stats.inc(&stats.num_credentials);
        }
        fresh
    }

    /// Drain all accumulated service records at shutdown
    pub fn drain_services(&self) -> Vec<ServiceRecord> {
        self.services.drain()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}
