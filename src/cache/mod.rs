//! TTL key-value cache with coalesced disk persistence.
//!
//! This module provides:
//! - `TtlCache<V>`: string keys, per-entry absolute expiry, lazy eviction
//! - Periodic flush through a `SnapshotStore`, skipped when the
//!   serialized content hash did not change since the last write
//! - Startup reload that validates the whole snapshot or discards it
//!
//! Both collector transports (local subprocess and socket pool) write
//! into the same cache instance. Nothing here ever blocks on I/O while
//! holding the entry lock.

pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

use crate::metrics::METRICS;
use crate::schema::PersistedEntry;
use crate::util::{duration_ms, now_ms};

pub use store::{FileStore, SnapshotStore};

/// Poll delay while another flush holds the guard.
const FLUSH_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result of a single flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Snapshot written to the store
    Written,

    /// Content hash matched the last write, no I/O performed
    Unchanged,

    /// Cache has no store attached
    Disabled,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: i64,
}

/// Generic TTL cache.
///
/// Entries live in a key-ordered map so that serializing an unchanged
/// cache always yields identical bytes (and therefore the same hash).
pub struct TtlCache<V> {
    entries: Mutex<BTreeMap<String, Entry<V>>>,
    default_ttl: Duration,
    store: Option<Arc<dyn SnapshotStore>>,

    /// Hex SHA-256 of the last snapshot successfully written
    last_flush: Mutex<Option<String>>,

    /// Cooperative flush guard, see `flush`
    flushing: AtomicBool,
}

impl<V> TtlCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            default_ttl,
            store,
            last_flush: Mutex::new(None),
            flushing: AtomicBool::new(false),
        }
    }

    /// Cache without persistence.
    pub fn in_memory(default_ttl: Duration) -> Self {
        Self::new(default_ttl, None)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Stores `value` with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Stores `value`, expiring `ttl` from now. Overwrites any
    /// previous entry for the key.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = now_ms().saturating_add(duration_ms(ttl));
        self.lock_entries()
            .insert(key.into(), Entry { value, expires_at });
    }

    /// Returns the value if present and unexpired.
    ///
    /// An expired entry is deleted here; there is no background sweep.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, now_ms())
    }

    fn get_at(&self, key: &str, now: i64) -> Option<V> {
        let mut entries = self.lock_entries();
        let expired = entries.get(key)?.expires_at < now;

        if expired {
            entries.remove(key);
            return None;
        }

        entries.get(key).map(|e| e.value.clone())
    }

    /// Splits `keys` into cached hits and misses in one pass.
    ///
    /// Misses keep the caller's order and may contain duplicates if the
    /// caller passed duplicates.
    pub fn partition(&self, keys: &[String]) -> (HashMap<String, V>, Vec<String>) {
        let now = now_ms();
        let mut hits = HashMap::with_capacity(keys.len());
        let mut misses = Vec::new();

        for key in keys {
            match self.get_at(key, now) {
                Some(v) => {
                    hits.insert(key.clone(), v);
                }
                None => misses.push(key.clone()),
            }
        }

        (hits, misses)
    }

    /// Every stored value, including expired entries nobody has read yet.
    pub fn snapshot(&self) -> HashMap<String, V> {
        self.lock_entries()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Number of stored entries (expired but unread ones included).
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reloads the persisted snapshot into memory.
    ///
    /// All-or-nothing: if the snapshot does not parse, or any record
    /// fails validation, nothing is loaded and the cache starts cold.
    ///
    /// Records that expired while the process was down are skipped.
    /// Returns the number of records loaded.
    pub async fn load(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let bytes = match store.load().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(target: "cache", "No snapshot at {}, starting empty", store.describe());
                return 0;
            }
            Err(e) => {
                error!(target: "cache", "Failed to read snapshot at {}: {}", store.describe(), e);
                return 0;
            }
        };

        // A freshly created cache file is empty; that is not corruption.
        if bytes.iter().all(u8::is_ascii_whitespace) {
            debug!(target: "cache", "Snapshot at {} is empty", store.describe());
            return 0;
        }

        let records: Vec<PersistedEntry<V>> = match serde_json::from_slice(&bytes) {
            Ok(records) => records,
            Err(e) => {
                error!(target: "cache", "Discarding invalid snapshot at {}", store.describe());
                debug!(target: "cache", "Validation error: {}", e);
                return 0;
            }
        };

        let now = now_ms();
        let total = records.len();
        let mut count = 0;
        let mut entries = self.lock_entries();
        for PersistedEntry { key, value, expires } in records {
            if expires < now {
                continue;
            }
            entries.insert(key, Entry { value, expires_at: expires });
            count += 1;
        }

        info!(
            target: "cache",
            "Loaded {} entries from {} ({} already expired)",
            count,
            store.describe(),
            total - count
        );
        count
    }

    /// Writes the current contents to the store unless they hash to the
    /// same value as the last successful write.
    ///
    /// Concurrent flushes are serialized by a boolean guard polled every
    /// `FLUSH_POLL`. Mutation of the entries themselves is always short
    /// and synchronous, so the guard only has to keep two writers from
    /// interleaving on the store.
    pub async fn flush(&self) -> Result<FlushOutcome, CacheError> {
        let Some(store) = &self.store else {
            return Ok(FlushOutcome::Disabled);
        };

        while self.flushing.swap(true, Ordering::AcqRel) {
            sleep(FLUSH_POLL).await;
        }
        let _guard = FlushGuard(&self.flushing);

        let bytes = self.serialize()?;
        let hash = format!("{:x}", Sha256::digest(&bytes));

        if self.lock_last_flush().as_deref() == Some(hash.as_str()) {
            METRICS.cache_flush_skips.fetch_add(1, Ordering::Relaxed);
            return Ok(FlushOutcome::Unchanged);
        }

        store.store(&bytes).await?;
        *self.lock_last_flush() = Some(hash);

        METRICS.cache_flushes.fetch_add(1, Ordering::Relaxed);
        debug!(target: "cache", "Flushed cache to {}", store.describe());
        Ok(FlushOutcome::Written)
    }

    fn serialize(&self) -> Result<Vec<u8>, CacheError> {
        let entries = self.lock_entries();
        let records: Vec<PersistedEntry<&V>> = entries
            .iter()
            .map(|(key, e)| PersistedEntry {
                key: key.clone(),
                value: &e.value,
                expires: e.expires_at,
            })
            .collect();

        Ok(serde_json::to_vec(&records)?)
    }

    fn lock_entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last_flush(&self) -> MutexGuard<'_, Option<String>> {
        self.last_flush.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the flush flag even if the flush future is dropped midway.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Starts the recurring flush timer for `cache`.
///
/// The first flush happens one full `every` after start. Abort the
/// returned handle to stop it.
pub fn spawn_flush_loop<V>(cache: Arc<TtlCache<V>>, every: Duration) -> JoinHandle<()>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);

        loop {
            ticker.tick().await;
            if let Err(e) = cache.flush().await {
                warn!(target: "cache", "Cache flush failed: {}", e);
            }
        }
    })
}
