//! streamcap - passive TCP session capture, reassembly and dissection
//!
//! Reconstructs bidirectional TCP byte streams out of captured packets in
//! the presence of retransmission, reordering and IPv4 fragmentation,
//! decodes application-layer sessions (HTTP, POP3, the SSH handshake) and
//! maintains per-flow aggregation tables plus passive service/credential
//! fingerprinting.
//!
//! The crate consumes already-decoded packets (see [`core::Packet`]) and
//! hands structured records to a caller-provided [`core::Sink`]; capture
//! and serialization live outside.

pub mod config;
pub mod core;
pub mod error;
pub mod fingerprint;
pub mod flow;
pub mod protocols;
pub mod reassembly;
pub mod stats;
pub mod stream;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::core::record::{FlowScope, Record, Sink};
use crate::core::Packet;
use crate::fingerprint::FingerprintEngine;
use crate::flow::FlowTable;
use crate::reassembly::Assembler;
use crate::stats::{ErrorMap, Stats};
use crate::stream::StreamPipeline;

/// The capture engine: flow tables, TCP reassembly and fingerprinting
/// behind a single packet entry point. All state is owned here; there are
/// no process-wide singletons.
pub struct Engine {
    assembler: Assembler,
    tables: Vec<FlowTable>,
    pipeline: Arc<StreamPipeline>,
}

impl Engine {
    /// Build an engine from configuration and a record sink.
    ///
    /// Only fingerprinting initialization can fail here (a configured but
    /// unreadable probe file); per-packet errors are absorbed later.
    pub fn new(config: Config, sink: Arc<dyn Sink>) -> anyhow::Result<Self> {
        let stats = Arc::new(Stats::new());
        let errors = Arc::new(ErrorMap::new());

        let fingerprint = FingerprintEngine::new(config.fingerprint.clone())?;

        let tables = [
            FlowScope::Link,
            FlowScope::Network,
            FlowScope::Transport,
            FlowScope::Connection,
        ]
        .into_iter()
        .map(|scope| {
            FlowTable::new(
                scope,
                config.flows.clone(),
                Arc::clone(&sink),
                Arc::clone(&errors),
            )
        })
        .collect();

        let pipeline = Arc::new(StreamPipeline {
            config,
            sink,
            stats,
            errors,
            fingerprint,
        });

        Ok(Self {
            assembler: Assembler::new(Arc::clone(&pipeline)),
            tables,
            pipeline,
        })
    }

    /// Feed one captured packet through flow aggregation and reassembly.
    pub fn process_packet(&mut self, pkt: &Packet) {
        for table in &self.tables {
            table.upsert(pkt);
        }

        self.assembler.process_packet(pkt);
    }

    pub fn stats(&self) -> &Stats {
        &self.pipeline.stats
    }

    pub fn errors(&self) -> &ErrorMap {
        &self.pipeline.errors
    }

    pub fn session_count(&self) -> usize {
        self.assembler.session_count()
    }

    /// Drain everything and render the shutdown summary.
    ///
    /// Closes all sessions, waits (bounded) for the reader threads,
    /// flushes service records and flow tables synchronously, then closes
    /// the sink.
    pub fn shutdown(mut self) -> String {
        info!("waiting for last streams to finish processing");

        self.assembler.flush_all();

        let timeout = std::time::Duration::from_secs(self.pipeline.config.stream.shutdown_timeout);
        if !self.assembler.wait(timeout) {
            let leaked = self.assembler.active_readers() as u64;
            self.pipeline
                .stats
                .add(&self.pipeline.stats.abandoned_sessions, leaked);
            warn!(leaked, "readers did not drain before the shutdown deadline");
        }

        for service in self.pipeline.fingerprint.drain_services() {
            self.pipeline.write_record(&Record::Service(service));
        }

        for table in &self.tables {
            table.flush_all();
        }

        let (name, written) = self.pipeline.sink.close();
        info!(sink = %name, records = written, "sink closed");

        let mut summary = self.pipeline.stats.summary();
        if let Some(errors) = self.pipeline.errors.summary() {
            summary.push('\n');
            summary.push_str(&errors);
        }
        summary
    }
}
