//! Single-flight request cache.
//!
//! [`RequestCache::execute`] guarantees that for any key at most one producer
//! runs at a time. Callers arriving while it runs attach to the same pending
//! result, and every attached caller observes the identical value or error.
//! Successful results are cached with a TTL under an entry-count and a byte
//! ceiling, evicting least recently used entries first.

mod key;
mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::{Dynamic, duration_ms, lock};
use crate::error::{CacheError, SharedError};
use crate::persist::{CACHE_INDEX_KEY, DurabilitySink, NoopSink, mirror_json};

pub use key::request_key;
pub use store::CacheItemInfo;

use store::{CacheEntry, CacheStore, Lookup};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Mirror the cache index into the durability sink after changes.
    pub persist_index: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_memory_bytes: 50 * 1024 * 1024,
            default_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            persist_index: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Falls back to the configured default TTL.
    pub ttl: Option<Duration>,
    /// Skip the cache lookup. Still joins a producer already in flight.
    pub force_refresh: bool,
    /// Read and write the cache. When off, only deduplication applies.
    pub enable_cache: bool,
    pub metadata: serde_json::Value,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            force_refresh: false,
            enable_cache: true,
            metadata: serde_json::Value::Null,
        }
    }
}

impl ExecuteOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.enable_cache = false;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Calls that attached to a producer already in flight.
    pub dedup_hits: u64,
    pub entries: usize,
    pub memory_bytes: usize,
    pub evictions: u64,
    pub expirations: u64,
    pub total_requests: u64,
    pub errors: u64,
}

/// A producer currently running for some key.
#[derive(Debug, Clone, Serialize)]
pub struct InFlightRequest {
    pub key: String,
    /// Callers waiting on the result, the one that started it included.
    pub waiters: usize,
    #[serde(with = "duration_ms")]
    pub running_for: Duration,
    pub metadata: serde_json::Value,
}

type Settled = Option<Result<Dynamic, CacheError>>;

struct Flight {
    rx: watch::Receiver<Settled>,
    waiters: usize,
    started_at: Instant,
    metadata: serde_json::Value,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    dedup_hits: u64,
    evictions: u64,
    expirations: u64,
    total_requests: u64,
    errors: u64,
}

struct CacheState {
    store: CacheStore,
    in_flight: HashMap<String, Flight>,
    counters: Counters,
}

struct CacheInner {
    config: CacheConfig,
    state: Mutex<CacheState>,
    sink: Arc<dyn DurabilitySink>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
    }
}

impl CacheInner {
    fn mirror_index(&self) {
        if !self.config.persist_index {
            return;
        }
        let index = lock(&self.state).store.index(Instant::now());
        mirror_json(self.sink.as_ref(), CACHE_INDEX_KEY, &index);
    }

    fn purge_expired(&self) -> usize {
        let purged = {
            let mut state = lock(&self.state);
            let purged = state.store.purge_expired(Instant::now());
            state.counters.expirations += purged as u64;
            purged
        };
        if purged > 0 {
            tracing::debug!(purged, "purged expired cache entries");
            self.mirror_index();
        }
        purged
    }
}

/// Cache with per-key request deduplication.
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct RequestCache {
    inner: Arc<CacheInner>,
}

impl RequestCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_sink(config, Arc::new(NoopSink))
    }

    pub fn with_sink(config: CacheConfig, sink: Arc<dyn DurabilitySink>) -> Self {
        let store = CacheStore::new(config.max_entries, config.max_memory_bytes);
        Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState {
                    store,
                    in_flight: HashMap::new(),
                    counters: Counters::default(),
                }),
                sink,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns the cached value for `key`, or runs `producer` for it.
    ///
    /// A live entry is returned without calling the producer. If a producer
    /// for `key` is already running, this call waits for its result instead
    /// of starting another. Errors are never cached.
    pub async fn execute<T, F, Fut>(
        &self,
        key: impl Into<String>,
        producer: F,
        options: ExecuteOptions,
    ) -> Result<T, CacheError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = key.into();
        let now = Instant::now();

        let mut rx = {
            let mut state = lock(&self.inner.state);
            state.counters.total_requests += 1;

            if options.enable_cache && !options.force_refresh {
                match state.store.get(&key, now) {
                    Lookup::Hit(value) => {
                        state.counters.hits += 1;
                        drop(state);
                        tracing::trace!(key, "cache hit");
                        return downcast(&key, value);
                    }
                    Lookup::Expired => state.counters.expirations += 1,
                    Lookup::Miss => {}
                }
            }

            match state.in_flight.get_mut(&key) {
                Some(flight) => {
                    flight.waiters += 1;
                    let rx = flight.rx.clone();
                    state.counters.dedup_hits += 1;
                    tracing::trace!(key, "attached to in-flight request");
                    rx
                }
                None => {
                    state.counters.misses += 1;
                    let (tx, rx) = watch::channel(None);
                    state.in_flight.insert(
                        key.clone(),
                        Flight {
                            rx: rx.clone(),
                            waiters: 1,
                            started_at: now,
                            metadata: options.metadata.clone(),
                        },
                    );

                    let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
                    tokio::spawn(produce(
                        Arc::downgrade(&self.inner),
                        key.clone(),
                        producer,
                        ttl,
                        options.enable_cache,
                        tx,
                    ));
                    rx
                }
            }
        };

        let settled = match rx.wait_for(Option::is_some).await {
            Ok(settled) => (*settled).clone(),
            Err(_) => None,
        };

        match settled {
            Some(Ok(value)) => downcast(&key, value),
            Some(Err(err)) => Err(err),
            None => {
                // the producer task died without reporting back
                forget_flight(&mut lock(&self.inner.state), &key, &rx);
                Err(CacheError::Aborted {
                    key,
                    reason: "producer stopped before settling".into(),
                })
            }
        }
    }

    /// Reads a live entry without producing anything.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut state = lock(&self.inner.state);
        state.counters.total_requests += 1;
        match state.store.get(key, Instant::now()) {
            Lookup::Hit(value) => {
                state.counters.hits += 1;
                value.downcast_ref::<T>().cloned()
            }
            Lookup::Expired => {
                state.counters.expirations += 1;
                state.counters.misses += 1;
                None
            }
            Lookup::Miss => {
                state.counters.misses += 1;
                None
            }
        }
    }

    /// Stores a value directly. Returns `false` when it doesn't fit the
    /// memory budget at all.
    pub fn set<T>(&self, key: impl Into<String>, value: T, ttl: Option<Duration>) -> bool
    where
        T: Serialize + Send + Sync + 'static,
    {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        let size = estimate_size(&value);
        let stored = store_entry(
            &mut lock(&self.inner.state),
            key.into(),
            Arc::new(value),
            size,
            ttl,
        );
        self.inner.mirror_index();
        stored
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let removed = lock(&self.inner.state).store.remove(key);
        if removed {
            self.inner.mirror_index();
        }
        removed
    }

    /// Removes every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let removed = lock(&self.inner.state).store.remove_prefix(prefix);
        if removed > 0 {
            self.inner.mirror_index();
        }
        removed
    }

    pub fn clear(&self) {
        let removed = lock(&self.inner.state).store.clear();
        tracing::debug!(removed, "cache cleared");
        self.inner.mirror_index();
    }

    /// Whether a live entry exists. Does not count as an access.
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inner.state)
            .store
            .contains_live(key, Instant::now())
    }

    pub fn in_flight(&self) -> Vec<InFlightRequest> {
        let now = Instant::now();
        let state = lock(&self.inner.state);
        let mut requests: Vec<_> = state
            .in_flight
            .iter()
            .map(|(key, flight)| InFlightRequest {
                key: key.clone(),
                waiters: flight.waiters,
                running_for: now.saturating_duration_since(flight.started_at),
                metadata: flight.metadata.clone(),
            })
            .collect();
        requests.sort_by(|a, b| a.key.cmp(&b.key));
        requests
    }

    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Current entries, most recently used first.
    pub fn index(&self) -> Vec<CacheItemInfo> {
        lock(&self.inner.state).store.index(Instant::now())
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = lock(&self.inner.state);
        let counters = &state.counters;
        let hit_rate = if counters.total_requests == 0 {
            0.0
        } else {
            counters.hits as f64 / counters.total_requests as f64
        };

        CacheMetrics {
            hits: counters.hits,
            misses: counters.misses,
            hit_rate,
            dedup_hits: counters.dedup_hits,
            entries: state.store.len(),
            memory_bytes: state.store.memory(),
            evictions: counters.evictions,
            expirations: counters.expirations,
            total_requests: counters.total_requests,
            errors: counters.errors,
        }
    }

    /// Starts the periodic expiry sweep. Returns `false` if it already runs.
    pub fn start_sweeper(&self) -> bool {
        let mut sweeper = lock(&self.inner.sweeper);
        if sweeper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.purge_expired();
            }
        }));
        true
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = lock(&self.inner.sweeper).take() {
            handle.abort();
        }
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache")
            .field("config", &self.inner.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

fn downcast<T>(key: &str, value: Dynamic) -> Result<T, CacheError>
where
    T: Clone + 'static,
{
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| CacheError::TypeMismatch { key: key.into() })
}

/// Approximate size of a value, measured as its JSON encoding. Values that
/// can't be serialized are sized by their in-memory layout.
/// Removes the flight for `key` only if it is still the one `rx` belongs to;
/// a newer producer may have registered under the same key since.
fn forget_flight(state: &mut CacheState, key: &str, rx: &watch::Receiver<Settled>) {
    if state.in_flight.get(key).is_some_and(|flight| flight.rx.same_channel(rx)) {
        state.in_flight.remove(key);
    }
}

fn estimate_size<T: Serialize>(value: &T) -> usize {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .unwrap_or_else(|_| std::mem::size_of::<T>())
}

fn store_entry(state: &mut CacheState, key: String, value: Dynamic, size: usize, ttl: Duration) -> bool {
    let entry = CacheEntry::new(value, size, ttl, Instant::now());
    let inserted = state.store.insert(key.clone(), entry);
    state.counters.evictions += inserted.evicted as u64;

    if !inserted.stored {
        tracing::debug!(key, size, "value exceeds the cache memory budget, not cached");
    }
    inserted.stored
}

async fn produce<T, F, Fut>(
    inner: Weak<CacheInner>,
    key: String,
    producer: F,
    ttl: Duration,
    enable_cache: bool,
    tx: watch::Sender<Settled>,
) where
    T: Serialize + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let result = producer().await;
    let inner = inner.upgrade();

    // cache and in-flight map change in one critical section, so a caller
    // arriving right after sees either the flight or the entry
    let settled = match result {
        Ok(value) => {
            let size = estimate_size(&value);
            let value: Dynamic = Arc::new(value);
            if let Some(inner) = &inner {
                let mut state = lock(&inner.state);
                if enable_cache {
                    store_entry(&mut state, key.clone(), value.clone(), size, ttl);
                }
                state.in_flight.remove(&key);
            }
            Ok(value)
        }
        Err(err) => {
            tracing::warn!(key, "cache producer failed: {err}");
            if let Some(inner) = &inner {
                let mut state = lock(&inner.state);
                state.counters.errors += 1;
                state.in_flight.remove(&key);
            }
            Err(CacheError::Producer {
                key: key.clone(),
                source: SharedError::from(err),
            })
        }
    };

    tx.send_replace(Some(settled));

    if let Some(inner) = inner {
        if enable_cache {
            inner.mirror_index();
        }
    }
}
