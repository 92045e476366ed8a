//! Stale-while-revalidate store with per-key singleflight.
//!
//! Every key owns a [`KeySlot`] inside one `DashMap`. The read-decide-write
//! sequence of [`MetricsCache::get`] runs under the slot's shard guard, which
//! is always released before awaiting, so "at most one fetch per key" holds
//! on a multi-threaded runtime without a global lock.
//!
//! Fetches run as spawned tasks wrapped in a [`Shared`] future. Waiters that
//! give up do not abandon the fetch, and the pending registration is always
//! cleared when the task settles.
//!
//! ## Generations
//!
//! Invalidation does not cancel an in-flight fetch. Instead each slot carries
//! a generation that every invalidation bumps; a fetch remembers the
//! generation it started under and its result is only stored if that is
//! still current. Waiters of an outdated fetch still receive its value, but a
//! miss that arrives after the invalidation starts a fresh fetch rather than
//! joining the outdated one.

use super::{CacheConfig, CacheOptions, CacheStats, KeyMetrics};
use crate::error::{Error, Result};
use crate::utils::fmt_duration;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ErasedValue = Arc<dyn Any + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<ErasedValue>>>;

struct CacheEntry {
    data: ErasedValue,
    fetched_at: Instant,
    stale_at: Instant,
}

struct PendingFetch {
    id: u64,
    generation: u64,
    /// Upgraded to `Blocking` once a miss joins a background refresh.
    kind: FetchKind,
    future: SharedFetch,
}

#[derive(Debug, Clone, Copy)]
struct RefreshBackoff {
    delay: Duration,
    retry_after: Instant,
}

#[derive(Default)]
struct KeySlot {
    entry: Option<CacheEntry>,
    pending: Option<PendingFetch>,
    generation: u64,
    backoff: Option<RefreshBackoff>,
    metrics: KeyMetrics,
}

impl KeySlot {
    fn refresh_allowed(&self, now: Instant) -> bool {
        self.pending.is_none() && self.backoff.is_none_or(|b| now >= b.retry_after)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    /// A miss; at least one caller is waiting on the result.
    Blocking,
    /// A refresh triggered by a stale read; nobody is waiting.
    Background,
}

struct Inner {
    slots: DashMap<String, KeySlot>,
    next_fetch_id: AtomicU64,
    config: CacheConfig,
    shutdown: CancellationToken,
}

/// Shared cache handle. Clone-cheap; clones observe the same entries.
///
/// Values of any `Clone + Send + Sync` type can be stored; a key is expected
/// to always be read with the same type.
#[derive(Clone)]
pub struct MetricsCache {
    inner: Arc<Inner>,
}

impl Default for MetricsCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl MetricsCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                next_fetch_id: AtomicU64::new(0),
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Read `key`, fetching it with `fetcher` when absent or expired.
    ///
    /// Fresh and stale entries are returned without awaiting anything; a
    /// stale read also schedules one background refresh. Misses wait on the
    /// key's single in-flight fetch and propagate its error. `None` options
    /// fall back to the instance defaults.
    pub async fn get<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: impl Into<Option<CacheOptions>>,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let options = options
            .into()
            .unwrap_or(self.inner.config.default_options);

        let fetch = {
            let now = Instant::now();
            let mut slot = self.inner.slots.entry(key.to_owned()).or_default();

            let cached = slot.entry.as_ref().and_then(|entry| {
                let value = entry.data.downcast_ref::<T>();
                if value.is_none() {
                    warn!(key, "cached value has an unexpected type, refetching");
                }
                value.map(|v| (v.clone(), entry.stale_at, entry.fetched_at + options.ttl))
            });

            match cached {
                Some((value, stale_at, _)) if now < stale_at => {
                    slot.metrics.hits += 1;
                    return Ok(value);
                }
                Some((value, _, expires_at)) if now < expires_at => {
                    slot.metrics.stale_hits += 1;
                    if slot.refresh_allowed(now) {
                        debug!(key, "serving stale entry, refreshing in background");
                        self.start_fetch(&mut slot, key, fetcher, options, FetchKind::Background);
                    }
                    return Ok(value);
                }
                _ => {}
            }

            slot.metrics.misses += 1;
            let generation = slot.generation;
            let in_flight = slot
                .pending
                .as_mut()
                .filter(|pending| pending.generation == generation)
                .map(|pending| {
                    pending.kind = FetchKind::Blocking;
                    pending.future.clone()
                });
            match in_flight {
                Some(future) => {
                    debug!(key, "joining in-flight fetch");
                    future
                }
                None => self.start_fetch(&mut slot, key, fetcher, options, FetchKind::Blocking),
            }
        };

        let value = fetch.await?;
        value.downcast_ref::<T>().cloned().ok_or_else(|| {
            Error::fetch(anyhow::anyhow!(
                "cache key `{key}` is shared by fetchers returning different types"
            ))
        })
    }

    /// Spawn the fetch for `key` and register it as the slot's pending fetch.
    ///
    /// The caller holds the slot's shard guard, so the task cannot settle
    /// before it is registered.
    fn start_fetch<T, F, Fut>(
        &self,
        slot: &mut KeySlot,
        key: &str,
        fetcher: F,
        options: CacheOptions,
        kind: FetchKind,
    ) -> SharedFetch
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let generation = slot.generation;
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();

        let task = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => Err(Error::Disposed),
                // The closure itself may panic before yielding a future.
                result = AssertUnwindSafe(async move { fetcher().await }).catch_unwind() => match result {
                    Ok(result) => result.map(|value| Arc::new(value) as ErasedValue),
                    Err(_) => Err(Error::fetch(anyhow::anyhow!("fetcher panicked"))),
                },
            };
            inner.settle(&key, id, generation, kind, &outcome, options);
            outcome
        });

        let future = task
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(Error::fetch(anyhow::anyhow!("fetch task failed: {e}"))))
            })
            .boxed()
            .shared();

        slot.pending = Some(PendingFetch {
            id,
            generation,
            kind,
            future: future.clone(),
        });
        future
    }

    /// Remove the entry for `key`.
    ///
    /// Always counts as an invalidation. A fetch already in flight for the key
    /// keeps running, but its result will not be stored. Returns whether an
    /// entry was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut slot = self.inner.slots.entry(key.to_owned()).or_default();
        slot.generation += 1;
        slot.metrics.invalidations += 1;
        let removed = slot.entry.take().is_some();
        debug!(key, removed, "invalidated cache entry");
        removed
    }

    /// Remove every entry whose key starts with `prefix`, returning how many
    /// were removed.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        for mut item in self.inner.slots.iter_mut() {
            if !item.key().starts_with(prefix) {
                continue;
            }
            let slot = item.value_mut();
            slot.generation += 1;
            if slot.entry.take().is_some() {
                slot.metrics.invalidations += 1;
                removed += 1;
            }
        }
        debug!(prefix, removed, "invalidated cache entries by prefix");
        removed
    }

    /// Remove all entries. Metrics and in-flight fetches are kept, but the
    /// fetches' results will not be stored.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for mut item in self.inner.slots.iter_mut() {
            let slot = item.value_mut();
            slot.generation += 1;
            if slot.entry.take().is_some() {
                removed += 1;
            }
        }
        debug!(removed, "cleared metrics cache");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for item in self.inner.slots.iter() {
            let slot = item.value();
            stats.size += usize::from(slot.entry.is_some());
            stats.pending_refreshes += usize::from(slot.pending.is_some());
            stats.accumulate(&slot.metrics);
        }
        stats.finish()
    }

    /// Counters for one key; zeroed if the key was never used.
    pub fn key_metrics(&self, key: &str) -> KeyMetrics {
        self.inner
            .slots
            .get(key)
            .map(|slot| slot.metrics.clone())
            .unwrap_or_default()
    }

    /// Counters for every key the cache has seen.
    pub fn all_metrics(&self) -> BTreeMap<String, KeyMetrics> {
        self.inner
            .slots
            .iter()
            .map(|item| (item.key().clone(), item.value().metrics.clone()))
            .collect()
    }

    /// Cancel in-flight fetches and drop every entry.
    ///
    /// Fetches started afterwards resolve to [`Error::Disposed`].
    pub fn dispose(&self) {
        self.inner.shutdown.cancel();
        let removed = self.clear();
        info!(removed, "metrics cache disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Inner {
    /// Record the outcome of fetch `id` and release its pending registration.
    fn settle(
        &self,
        key: &str,
        id: u64,
        generation: u64,
        kind: FetchKind,
        outcome: &Result<ErasedValue>,
        options: CacheOptions,
    ) {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return;
        };
        // A registered fetch may have gained waiters since it was spawned.
        let kind = slot
            .pending
            .take_if(|p| p.id == id)
            .map_or(kind, |pending| pending.kind);

        match outcome {
            Ok(value) if slot.generation == generation => {
                let now = Instant::now();
                slot.entry = Some(CacheEntry {
                    data: Arc::clone(value),
                    fetched_at: now,
                    stale_at: now + options.effective_stale_time(),
                });
                slot.backoff = None;
            }
            Ok(_) => {
                debug!(
                    key,
                    fetch_generation = generation,
                    current_generation = slot.generation,
                    "discarding fetch result that predates an invalidation"
                );
            }
            Err(err) => {
                slot.metrics.errors += 1;
                slot.metrics.last_error = Some(err.to_string());
                match kind {
                    FetchKind::Blocking => {
                        error!(key, error = %err, "failed to fetch cache entry");
                    }
                    FetchKind::Background => {
                        let delay = slot.backoff.map_or(self.config.refresh_backoff, |b| {
                            (b.delay * 2).min(self.config.max_refresh_backoff)
                        });
                        slot.backoff = Some(RefreshBackoff {
                            delay,
                            retry_after: Instant::now() + delay,
                        });
                        warn!(
                            key,
                            error = %err,
                            retry_in = fmt_duration(delay),
                            "background refresh failed, keeping stale entry"
                        );
                    }
                }
            }
        }
    }
}
