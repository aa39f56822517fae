//! Session factory
//!
//! On the first packet of a new 4-tuple the factory classifies the
//! connection by well-known port, normalizes the client/server
//! orientation, and spawns one reader thread per direction for every
//! active classification. Encrypted sessions get no readers; they exist
//! only for state-machine bookkeeping.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::core::flow_ident;

use super::reader::StreamReader;
use super::session::{SessionCore, TcpSession};
use super::{classify, StreamPipeline};

/// Count of live reader threads, with shutdown rendezvous
pub struct ActiveCounter {
    count: Mutex<usize>,
    cv: Condvar,
}

impl ActiveCounter {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    pub fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until every reader exited or the timeout passed.
    /// Returns true when fully drained.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self.cv.wait_for(&mut count, deadline - now).timed_out() && *count > 0 {
                return false;
            }
        }
        true
    }
}

impl Default for ActiveCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates sessions and owns the reader-thread accounting
pub struct StreamFactory {
    pipeline: Arc<StreamPipeline>,
    active: Arc<ActiveCounter>,
}

impl StreamFactory {
    pub fn new(pipeline: Arc<StreamPipeline>) -> Self {
        Self {
            pipeline,
            active: Arc::new(ActiveCounter::new()),
        }
    }

    pub fn pipeline(&self) -> &Arc<StreamPipeline> {
        &self.pipeline
    }

    /// Handle a new 4-tuple: classify, normalize orientation, spawn the
    /// directional readers.
    pub fn create_session(
        &self,
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        first_packet: DateTime<Utc>,
    ) -> TcpSession {
        let (kind, swap) = classify(src.1, dst.1);
        let (client, server) = if swap { (dst, src) } else { (src, dst) };

        let ident = flow_ident(&client.0.to_string(), client.1, &server.0.to_string(), server.1);
        debug!(ident = %ident, kind = kind.name(), "new session");

        let core = Arc::new(SessionCore::new(
            ident,
            kind,
            client.0.to_string(),
            server.0.to_string(),
            client.1,
            server.1,
            first_packet,
        ));

        let (client_tx, server_tx) = if kind.spawns_readers() {
            let capacity = self.pipeline.config.stream.channel_capacity;
            let (ctx, crx) = bounded(capacity);
            let (stx, srx) = bounded(capacity);

            self.active.add(2);

            for (rx, is_client) in [(crx, true), (srx, false)] {
                let reader = StreamReader::new(
                    rx,
                    Arc::clone(&core),
                    Arc::clone(&self.pipeline),
                    is_client,
                );
                let active = Arc::clone(&self.active);
                let name = format!(
                    "stream-{}-{}",
                    if is_client { "client" } else { "server" },
                    core.ident
                );

                if let Err(e) = std::thread::Builder::new()
                    .name(name)
                    .spawn(move || reader.run(active))
                {
                    warn!(error = %e, "failed to spawn stream reader");
                    self.active.done();
                }
            }

            (Some(ctx), Some(stx))
        } else {
            (None, None)
        };

        TcpSession::new(
            core,
            client,
            client_tx,
            server_tx,
            &self.pipeline.config.reassembly,
            first_packet,
        )
    }

    pub fn active_readers(&self) -> usize {
        self.active.count()
    }

    /// Wait for all spawned readers to exit, bounded by the timeout.
    /// Returns true when every reader finished.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.active.wait(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::record::MemorySink;
    use crate::fingerprint::FingerprintEngine;
    use crate::stats::{ErrorMap, Stats};
    use crate::stream::StreamKind;

    fn pipeline() -> Arc<StreamPipeline> {
        Arc::new(StreamPipeline {
            config: Config::default(),
            sink: Arc::new(MemorySink::new()),
            stats: Arc::new(Stats::new()),
            errors: Arc::new(ErrorMap::new()),
            fingerprint: FingerprintEngine::disabled(),
        })
    }

    #[test]
    fn test_session_normalization() {
        let factory = StreamFactory::new(pipeline());

        // reply direction observed first: server port is the source
        let session = factory.create_session(
            ("10.0.0.1".parse().unwrap(), 80),
            ("192.168.1.100".parse().unwrap(), 50000),
            chrono::Utc::now(),
        );

        assert_eq!(session.core.kind, StreamKind::Http);
        assert_eq!(session.core.client_port, 50000);
        assert_eq!(session.core.server_port, 80);
        assert_eq!(
            session.core.ident,
            "192.168.1.100:50000->10.0.0.1:80"
        );

        // two readers spawned
        assert_eq!(factory.active_readers(), 2);
    }

    #[test]
    fn test_encrypted_session_spawns_nothing() {
        let factory = StreamFactory::new(pipeline());

        let session = factory.create_session(
            ("192.168.1.100".parse().unwrap(), 50000),
            ("10.0.0.1".parse().unwrap(), 443),
            chrono::Utc::now(),
        );

        assert_eq!(session.core.kind, StreamKind::Encrypted);
        assert_eq!(factory.active_readers(), 0);
    }

    #[test]
    fn test_wait_drains_after_close() {
        let factory = StreamFactory::new(pipeline());

        let mut session = factory.create_session(
            ("192.168.1.100".parse().unwrap(), 50000),
            ("10.0.0.1".parse().unwrap(), 80),
            chrono::Utc::now(),
        );
        assert_eq!(factory.active_readers(), 2);

        session.close();
        assert!(factory.wait(Duration::from_secs(5)));
        assert_eq!(factory.active_readers(), 0);
    }
}
