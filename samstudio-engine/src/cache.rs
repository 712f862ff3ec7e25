//! Reference-counted LRU cache of image embeddings
//!
//! Embeddings are keyed by (image identity, model version). Concurrent misses
//! on one key share a single backend computation, driven by whichever waiter
//! is polling it, so a caller that times out or is cancelled does not abort
//! the work for the others. Entries held by a lease are never evicted.

use futures::future::{BoxFuture, FutureExt, Shared as SharedFuture};
use lru::LruCache;
use parking_lot::Mutex;
use samstudio_core::{BackendError, Error, ImageId, Result};
use samstudio_model::{ImageEmbedding, ImageSource, ModelBackend};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbeddingKey {
    pub image: ImageId,
    pub model_version: String,
}

impl EmbeddingKey {
    pub fn new(image: ImageId, model_version: impl Into<String>) -> Self {
        Self {
            image,
            model_version: model_version.into(),
        }
    }
}

impl fmt::Display for EmbeddingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.image, self.model_version)
    }
}

/// Cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Backend embedding calls started
    pub computes: u64,
    pub evictions: u64,
    pub resident: usize,
    /// Resident entries with at least one lease
    pub pinned: usize,
    pub in_flight: usize,
}

type ComputeOutcome = std::result::Result<Arc<ImageEmbedding>, BackendError>;

/// Keeps a freshly computed entry pinned until every waiter has claimed it
/// or given up. Released when the last handle on the computation is dropped.
struct Hold {
    shared: Arc<Shared>,
    key: EmbeddingKey,
    embedding: Arc<ImageEmbedding>,
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.shared.release(&self.key, &self.embedding);
    }
}

#[derive(Clone)]
struct Handoff {
    /// Key under which the result was installed
    key: EmbeddingKey,
    embedding: Arc<ImageEmbedding>,
    _hold: Arc<Hold>,
}

type Delivery = std::result::Result<Handoff, BackendError>;

struct Resident {
    embedding: Arc<ImageEmbedding>,
    refs: usize,
}

struct InFlight {
    generation: u64,
    waiters: usize,
    computation: SharedFuture<BoxFuture<'static, Delivery>>,
}

struct State {
    resident: LruCache<EmbeddingKey, Resident>,
    in_flight: HashMap<EmbeddingKey, InFlight>,
    next_generation: u64,
    stats: CacheStats,
}

struct Shared {
    state: Mutex<State>,
    capacity: usize,
}

impl Shared {
    /// Drop unreferenced entries, least recently used first, until the
    /// resident count is within capacity.
    fn evict_excess(&self, state: &mut State) {
        while state.resident.len() > self.capacity {
            let victim = state
                .resident
                .iter()
                .rev()
                .find(|(_, entry)| entry.refs == 0)
                .map(|(key, _)| key.clone());

            match victim {
                Some(key) => {
                    state.resident.pop(&key);
                    state.stats.evictions += 1;
                    debug!("Evicted embedding {}", key);
                }
                // Everything over capacity is pinned; retry on next release.
                None => break,
            }
        }
    }

    /// Retire the in-flight entry and install a successful result, pinned
    /// by the returned delivery. The result is keyed by the model version the
    /// backend reported, which may differ from the requested one when the
    /// backend only learns its version while embedding. Returns `None` when
    /// every waiter is gone.
    fn finish(self: &Arc<Self>, key: &EmbeddingKey, generation: u64, outcome: ComputeOutcome) -> Option<Delivery> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.in_flight.get(key).map(|f| f.generation) != Some(generation) {
            return None;
        }
        state.in_flight.remove(key);

        let embedding = match outcome {
            Ok(embedding) => embedding,
            // Failures are handed to the waiters but never cached
            Err(e) => return Some(Err(e)),
        };

        let key = &EmbeddingKey::new(key.image.clone(), embedding.model_version.clone());
        let embedding = match state.resident.get_mut(key) {
            Some(entry) => {
                entry.refs += 1;
                entry.embedding.clone()
            }
            None => {
                state.resident.put(
                    key.clone(),
                    Resident {
                        embedding: embedding.clone(),
                        refs: 1,
                    },
                );
                embedding
            }
        };
        self.evict_excess(state);

        Some(Ok(Handoff {
            key: key.clone(),
            embedding: embedding.clone(),
            _hold: Arc::new(Hold {
                shared: self.clone(),
                key: key.clone(),
                embedding,
            }),
        }))
    }

    fn claim(self: &Arc<Self>, key: EmbeddingKey, embedding: Arc<ImageEmbedding>) -> EmbeddingLease {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let embedding = match state.resident.get_mut(&key) {
            Some(entry) => {
                entry.refs += 1;
                entry.embedding.clone()
            }
            None => {
                state.resident.put(
                    key.clone(),
                    Resident {
                        embedding: embedding.clone(),
                        refs: 1,
                    },
                );
                embedding
            }
        };
        self.evict_excess(state);
        EmbeddingLease {
            shared: self.clone(),
            key,
            embedding,
        }
    }

    fn release(&self, key: &EmbeddingKey, embedding: &Arc<ImageEmbedding>) {
        let mut state = self.state.lock();
        match state.resident.peek_mut(key) {
            Some(entry) if Arc::ptr_eq(&entry.embedding, embedding) => {
                if entry.refs == 0 {
                    error!("Reference count underflow for embedding {}", key);
                } else {
                    entry.refs -= 1;
                }
            }
            _ => {
                error!("Embedding {} was evicted while a lease was outstanding", key);
            }
        }
        self.evict_excess(&mut state);
    }
}

/// Shared handle to the embedding cache. Cheap to clone.
#[derive(Clone)]
pub struct EmbeddingCache {
    shared: Arc<Shared>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    resident: LruCache::unbounded(),
                    in_flight: HashMap::new(),
                    next_generation: 0,
                    stats: CacheStats::default(),
                }),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Return the embedding of `image` under the backend's current model
    /// version, computing it on a miss.
    ///
    /// `timeout` bounds how long this caller waits; the computation itself
    /// keeps running while any other caller still waits on it.
    pub async fn get_or_compute(
        &self,
        image: &ImageSource,
        backend: &Arc<dyn ModelBackend>,
        timeout: Duration,
    ) -> Result<EmbeddingLease> {
        let key = EmbeddingKey::new(image.id.clone(), backend.model_version());

        let (generation, computation) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if let Some(entry) = state.resident.get_mut(&key) {
                entry.refs += 1;
                let embedding = entry.embedding.clone();
                state.stats.hits += 1;
                debug!("Embedding cache hit for {}", key);
                return Ok(EmbeddingLease {
                    shared: self.shared.clone(),
                    key,
                    embedding,
                });
            }

            state.stats.misses += 1;
            if let Some(flight) = state.in_flight.get_mut(&key) {
                flight.waiters += 1;
                debug!("Joining in-flight embedding for {} ({} waiters)", key, flight.waiters);
                (flight.generation, flight.computation.clone())
            } else {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.stats.computes += 1;

                let computation = compute(
                    self.shared.clone(),
                    key.clone(),
                    generation,
                    image.clone(),
                    backend.clone(),
                )
                .boxed()
                .shared();
                state.in_flight.insert(
                    key.clone(),
                    InFlight {
                        generation,
                        waiters: 1,
                        computation: computation.clone(),
                    },
                );
                debug!("Embedding cache miss for {}, computing", key);
                (generation, computation)
            }
        };

        let _waiter = Waiter {
            shared: self.shared.clone(),
            key: key.clone(),
            generation,
        };

        let outcome = match tokio::time::timeout(timeout, computation).await {
            Ok(delivery) => delivery,
            Err(_) => {
                warn!("Timed out after {:?} waiting for embedding {}", timeout, key);
                return Err(Error::Backend(BackendError::Timeout(timeout.as_millis() as u64)));
            }
        };

        match outcome {
            Ok(handoff) => Ok(self.shared.claim(handoff.key.clone(), handoff.embedding.clone())),
            Err(source) => Err(Error::EmbeddingUnavailable {
                image: image.id.to_string(),
                source,
            }),
        }
    }

    /// Take an additional reference on a leased embedding, failing if the
    /// entry is no longer resident.
    pub fn retain(&self, lease: &EmbeddingLease) -> Result<EmbeddingLease> {
        let mut state = self.shared.state.lock();
        match state.resident.get_mut(&lease.key) {
            Some(entry) if Arc::ptr_eq(&entry.embedding, &lease.embedding) && entry.refs > 0 => {
                entry.refs += 1;
                Ok(EmbeddingLease {
                    shared: self.shared.clone(),
                    key: lease.key.clone(),
                    embedding: lease.embedding.clone(),
                })
            }
            _ => {
                error!("Embedding {} missing from cache while leased", lease.key);
                Err(Error::CacheEvictedMidFlight(lease.key.to_string()))
            }
        }
    }

    pub fn contains(&self, image: &ImageId, model_version: &str) -> bool {
        let key = EmbeddingKey::new(image.clone(), model_version);
        self.shared.state.lock().resident.contains(&key)
    }

    /// Outstanding leases on a resident entry
    pub fn ref_count(&self, image: &ImageId, model_version: &str) -> Option<usize> {
        let key = EmbeddingKey::new(image.clone(), model_version);
        self.shared.state.lock().resident.peek(&key).map(|e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().resident.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every unreferenced entry
    pub fn purge_idle(&self) -> usize {
        let mut state = self.shared.state.lock();
        let idle: Vec<EmbeddingKey> = state
            .resident
            .iter()
            .filter(|(_, e)| e.refs == 0)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &idle {
            state.resident.pop(key);
        }
        state.stats.evictions += idle.len() as u64;
        idle.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock();
        let mut stats = state.stats.clone();
        stats.resident = state.resident.len();
        stats.pinned = state.resident.iter().filter(|(_, e)| e.refs > 0).count();
        stats.in_flight = state.in_flight.len();
        stats
    }
}

async fn compute(
    shared: Arc<Shared>,
    key: EmbeddingKey,
    generation: u64,
    image: ImageSource,
    backend: Arc<dyn ModelBackend>,
) -> Delivery {
    let outcome = match backend.embed(&image).await {
        Ok(output) => {
            if output.model_version != key.model_version {
                info!(
                    "Backend {} reported model version {} for {}, caching under the reported version",
                    backend.name(),
                    output.model_version,
                    key
                );
            }
            Ok(Arc::new(ImageEmbedding::new(&image, output)))
        }
        Err(e) => {
            warn!("Embedding computation for {} failed: {}", key, e);
            Err(e)
        }
    };

    shared
        .finish(&key, generation, outcome)
        .unwrap_or_else(|| Err(BackendError::Unavailable("embedding computation was abandoned".to_string())))
}

/// Registers one caller waiting on an in-flight computation. The last waiter
/// to leave before completion drops the computation.
struct Waiter {
    shared: Arc<Shared>,
    key: EmbeddingKey,
    generation: u64,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let abandoned = match state.in_flight.get_mut(&self.key) {
            Some(flight) if flight.generation == self.generation => {
                flight.waiters = flight.waiters.saturating_sub(1);
                flight.waiters == 0
            }
            _ => false,
        };

        if abandoned {
            // Not yet finished, so no delivery is dropped under the lock
            state.in_flight.remove(&self.key);
            debug!("All waiters left; abandoned embedding computation for {}", self.key);
        }
    }
}

/// A counted reference to a resident embedding. The entry cannot be evicted
/// while any lease on it is alive; dropping the lease releases it.
pub struct EmbeddingLease {
    shared: Arc<Shared>,
    key: EmbeddingKey,
    embedding: Arc<ImageEmbedding>,
}

impl EmbeddingLease {
    pub fn key(&self) -> &EmbeddingKey {
        &self.key
    }

    pub fn embedding(&self) -> &Arc<ImageEmbedding> {
        &self.embedding
    }
}

impl std::ops::Deref for EmbeddingLease {
    type Target = ImageEmbedding;

    fn deref(&self) -> &ImageEmbedding {
        &self.embedding
    }
}

impl fmt::Debug for EmbeddingLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingLease").field("key", &self.key).finish()
    }
}

impl Drop for EmbeddingLease {
    fn drop(&mut self) {
        self.shared.release(&self.key, &self.embedding);
    }
}
