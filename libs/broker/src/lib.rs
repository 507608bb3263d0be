//! The herald broker: accepts framed connections, keeps one durable store
//! per topic, replays history to new subscribers and fans out new messages.

mod config;
mod connection;
mod error;
mod registry;
mod topic;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use herald_channel::FrameListener;

pub use config::{default_sweep_interval, BrokerConfig};
pub use error::BrokerError;

use connection::serve_connection;
use registry::TopicRegistry;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

// ═══════════════════════════════════════════════════════════════
//  Broker
// ═══════════════════════════════════════════════════════════════

/// A running broker. Dropping it stops accepting and closes connections
/// without waiting; call [`Broker::close`] to also drain and flush.
pub struct Broker {
    local_addr: SocketAddr,
    registry: Arc<TopicRegistry>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("local_addr", &self.local_addr)
            .field("topics", &self.registry.names())
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Broker {
    /// Prepare the storage root, recover existing topics, bind and start serving.
    pub async fn start(config: BrokerConfig) -> Result<Self, BrokerError> {
        let registry = Arc::new(TopicRegistry::new(
            config.storage_root.clone(),
            config.cache_duration,
        ));
        let recovered = {
            let registry = registry.clone();
            let root = config.storage_root.clone();
            tokio::task::spawn_blocking(move || -> Result<usize, BrokerError> {
                std::fs::create_dir_all(&root)
                    .map_err(|source| BrokerError::StorageRoot { path: root, source })?;
                registry.scan()
            })
            .await??
        };

        let listener = FrameListener::bind(&config.host, config.port, config.max_frame_len).await?;
        let local_addr = listener.local_addr().map_err(BrokerError::LocalAddr)?;

        tracing::info!(
            addr = %local_addr,
            root = %config.storage_root.display(),
            topics = recovered,
            cache_ms = config.cache_duration.as_millis() as u64,
            "broker started"
        );

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(accept_loop(
            listener,
            registry.clone(),
            shutdown.clone(),
            tracker.clone(),
        ));
        tracker.spawn(sweep_loop(registry.clone(), config.sweep_interval, shutdown.clone()));

        Ok(Self {
            local_addr,
            registry,
            shutdown,
            tracker,
        })
    }

    /// Address actually bound; useful when started on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Names of the topics currently loaded, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting, close every connection, wait for in-flight appends
    /// and sync all topic logs. Safe to call more than once.
    pub async fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(addr = %self.local_addr, "broker closing");
        }
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        for topic in self.registry.all() {
            if let Err(e) = topic.flush().await {
                tracing::error!(topic = %topic.name(), error = %e, "flush on close failed");
            }
        }
        tracing::debug!(addr = %self.local_addr, "broker closed");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Start a broker on all interfaces at `port`, storing topics under
/// `storage_root` and caching each message for `cache_duration_ms`.
pub async fn create_broker(
    port: u16,
    cache_duration_ms: u64,
    storage_root: impl Into<PathBuf>,
) -> Result<Broker, BrokerError> {
    Broker::start(BrokerConfig::new(
        port,
        Duration::from_millis(cache_duration_ms),
        storage_root,
    ))
    .await
}

// ═══════════════════════════════════════════════════════════════
//  Background tasks
// ═══════════════════════════════════════════════════════════════

async fn accept_loop(
    listener: FrameListener,
    registry: Arc<TopicRegistry>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let mut next_id: u64 = 0;
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(channel) => {
                next_id += 1;
                tracker.spawn(serve_connection(channel, next_id, registry.clone(), shutdown.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

async fn sweep_loop(registry: Arc<TopicRegistry>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for topic in registry.all() {
            topic.evict_expired().await;
        }
    }
    tracing::debug!("eviction sweep stopped");
}
