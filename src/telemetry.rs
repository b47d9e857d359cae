//! Telemetry facade
//!
//! The only entry point the rest of the application depends on:
//! - `lookup(node_ids)`: best current cache contents, never waits on
//!   a collector, schedules a refresh for misses as a side effect
//! - `agent_id()`: identity of the local collector, if one is running
//!
//! Which producers are active (local subprocess, socket pool, both or
//! neither) is hidden here. Callers must not assume freshness.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::cache::{spawn_flush_loop, FileStore, SnapshotStore, TtlCache};
use crate::collector::{self, SupervisorConfig, SupervisorHandle, SupervisorTimings};
use crate::pool::{self, PoolConfig, PoolManager};
use crate::schema::TelemetrySample;

/// Everything needed to bring the subsystem up.
#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    /// Snapshot file; `None` keeps the cache in memory only
    pub cache_path: Option<PathBuf>,
    pub ttl: Duration,
    pub flush_interval: Duration,

    /// Local collector, if enabled
    pub agent: Option<SupervisorConfig>,
    pub agent_timings: SupervisorTimings,

    /// Remote collector pool, if enabled
    pub pool: Option<PoolConfig>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            cache_path: None,
            ttl: Duration::from_secs(180),
            flush_interval: Duration::from_secs(10),
            agent: None,
            agent_timings: SupervisorTimings::default(),
            pool: None,
        }
    }
}

pub struct Telemetry {
    cache: Arc<TtlCache<TelemetrySample>>,
    supervisor: Option<SupervisorHandle>,
    pool: Option<PoolManager>,
    flush_task: Option<JoinHandle<()>>,
}

impl Telemetry {

    /// Starts the cache and whichever producers are configured.
    ///
    /// Never fails. A cache file that cannot be opened disables all
    /// producers; a producer with a configuration fault is skipped.
    pub async fn start(settings: TelemetrySettings) -> Self {
        let store: Option<Arc<dyn SnapshotStore>> = match &settings.cache_path {
            Some(path) => {
                let store = FileStore::new(path);
                if let Err(e) = store.ensure_accessible().await {
                    error!(target: "telemetry", "Cache file not accessible at {}: {}", path.display(), e);
                    warn!(target: "telemetry", "Device telemetry is disabled until resolved");
                    return Self::disabled(settings.ttl);
                }
                info!(target: "telemetry", "Using cache file at {}", path.display());
                Some(Arc::new(store) as Arc<dyn SnapshotStore>)
            }
            None => None,
        };

        let persistent = store.is_some();
        let cache = Arc::new(TtlCache::new(settings.ttl, store));
        cache.load().await;

        let flush_task = persistent.then(|| spawn_flush_loop(cache.clone(), settings.flush_interval));

        let supervisor = match settings.agent {
            Some(config) => collector::start(config, settings.agent_timings, cache.clone()).await,
            None => None,
        };

        let pool = match settings.pool {
            Some(config) => pool::start(config, cache.clone()).await,
            None => None,
        };

        if supervisor.is_none() && pool.is_none() {
            info!(target: "telemetry", "No collector is active, serving cached telemetry only");
        }

        Self {
            cache,
            supervisor,
            pool,
            flush_task,
        }
    }

    /// A facade with an empty in-memory cache and no producers.
    pub fn disabled(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(TtlCache::in_memory(ttl)),
            supervisor: None,
            pool: None,
            flush_task: None,
        }
    }

    /// Cached payloads for the requested nodes.
    ///
    /// Misses (absent or expired) are requested from every active
    /// producer, fire-and-forget. Their answers land in the cache for a
    /// later call.
    pub fn lookup(&self, node_ids: &[String]) -> HashMap<String, Value> {
        let (hits, misses) = self.cache.partition(node_ids);

        if !misses.is_empty() {
            debug!(target: "telemetry", "Requesting telemetry for {} uncached nodes", misses.len());

            if let Some(pool) = &self.pool {
                pool.request_refresh(&misses);
            }
            if let Some(supervisor) = &self.supervisor {
                supervisor.refresh();
            }
        }

        hits.into_iter().map(|(id, s)| (id, s.payload)).collect()
    }

    /// Self-reported identity of the local collector.
    pub fn agent_id(&self) -> Option<String> {
        self.supervisor.as_ref().and_then(SupervisorHandle::agent_id)
    }

    pub fn cache(&self) -> &Arc<TtlCache<TelemetrySample>> {
        &self.cache
    }

    pub fn pool(&self) -> Option<&PoolManager> {
        self.pool.as_ref()
    }

    pub fn supervisor(&self) -> Option<&SupervisorHandle> {
        self.supervisor.as_ref()
    }

    /// Stops the collector and the pool, then writes a final snapshot.
    ///
    /// ORDER:
    /// - timers first: flush loop, pool keepalives (the supervisor
    ///   cancels its heartbeat and restart timers itself before it
    ///   touches the child)
    /// - then the child process
    /// - then the member sockets
    pub async fn shutdown(self) {
        if let Some(task) = self.flush_task {
            task.abort();
        }

        if let Some(pool) = &self.pool {
            pool.stop_timers();
        }

        if let Some(supervisor) = self.supervisor {
            supervisor.shutdown().await;
        }

        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }

        if let Err(e) = self.cache.flush().await {
            warn!(target: "telemetry", "Final cache flush failed: {}", e);
        }
    }
}
