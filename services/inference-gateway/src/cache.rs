//! Model Cache: brand → loaded model, with one load in flight per brand.
//!
//! Each key moves Absent → Loading → Ready, Ready → Absent or
//! Loading → Absent. A `Loading` slot holds the flight's watch channel; every
//! caller for that brand subscribes to it and wakes on the single outcome. The
//! load itself runs on its own task, so a caller that goes away never aborts it.
//!
//! An eviction that lands while a load is in flight drops the claim. The load
//! still finishes and its outcome reaches the callers already waiting, but it
//! is not installed, and any file it wrote stays on disk.
//!
//! While an eviction deletes a brand's file the brand holds an `Evicting`
//! slot (and `evict_all` a cache-wide gate). Callers arriving meanwhile wait
//! for the deletion, so no load can read a file that is about to vanish.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{ModelError, Result};
use crate::loader::{LoadedModel, ModelLoader};
use crate::lookup::normalize_brand;
use crate::metrics::{self, CACHE_HITS, CACHE_MISSES, LOADS_STARTED, LOAD_LATENCY};
use crate::store::CheckpointStore;

type Outcome = Option<Result<Arc<LoadedModel>>>;

#[derive(Debug)]
struct Flight {
    id: u64,
    tx: watch::Sender<Outcome>,
}

type Gate = Arc<watch::Sender<bool>>;

#[derive(Debug)]
enum Slot {
    Loading(Arc<Flight>),
    Ready(Arc<LoadedModel>),
    Evicting(Gate),
}

#[derive(Debug, Default)]
struct Slots {
    by_brand: HashMap<String, Slot>,
    /// Set while `evict_all` is deleting files.
    clearing: Option<Gate>,
}

enum Claim {
    Hit(Arc<LoadedModel>),
    Flight(watch::Receiver<Outcome>),
    Deleting(watch::Receiver<bool>),
}

fn gate() -> Gate { Arc::new(watch::channel(false).0) }

fn is_gate(slot: Option<&Slot>, gate: &Gate) -> bool {
    matches!(slot, Some(Slot::Evicting(g)) if Arc::ptr_eq(g, gate))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionCounts {
    pub evicted_from_cache: usize,
    pub evicted_from_disk: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Loaded,
    Loading,
    OnDisk,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedModelInfo {
    pub brand: String,
    pub status: ModelStatus,
    pub in_memory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheSnapshot {
    pub total_in_memory: usize,
    pub total_on_disk: usize,
    pub models: Vec<CachedModelInfo>,
}

struct Inner {
    loader: Arc<dyn ModelLoader>,
    store: Arc<CheckpointStore>,
    slots: Mutex<Slots>,
    next_flight: AtomicU64,
}

/// Cheap to clone; clones share one map.
#[derive(Clone)]
pub struct ModelCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache").field("slots", &self.inner.slots.lock().by_brand.len()).finish()
    }
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>, store: Arc<CheckpointStore>) -> Self {
        Self {
            inner: Arc::new(Inner { loader, store, slots: Mutex::new(Slots::default()), next_flight: AtomicU64::new(1) }),
        }
    }

    pub fn store(&self) -> &Arc<CheckpointStore> { &self.inner.store }

    /// Returns the resident model for `brand`, loading it if needed. Concurrent
    /// callers for the same brand share one load and one outcome. A failed load
    /// leaves the brand absent, so the next call starts over.
    pub async fn get_or_load(&self, brand: &str) -> Result<Arc<LoadedModel>> {
        loop {
            let mut rx = match self.claim(brand) {
                Claim::Hit(model) => return Ok(model),
                Claim::Flight(rx) => rx,
                Claim::Deleting(mut done) => {
                    debug!(brand, "waiting for eviction to finish");
                    let _ = done.wait_for(|d| *d).await;
                    continue;
                }
            };
            let outcome = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| ModelError::Unexpected(format!("load for '{brand}' ended without an outcome")))?
                .clone();
            return outcome.unwrap_or_else(|| Err(ModelError::Unexpected(format!("load for '{brand}' ended without an outcome"))));
        }
    }

    fn claim(&self, brand: &str) -> Claim {
        let mut slots = self.inner.slots.lock();
        if let Some(gate) = &slots.clearing {
            return Claim::Deleting(gate.subscribe());
        }
        match slots.by_brand.get(brand) {
            Some(Slot::Ready(model)) => {
                CACHE_HITS.add(1, &[]);
                Claim::Hit(model.clone())
            }
            Some(Slot::Loading(flight)) => {
                CACHE_MISSES.add(1, &[KeyValue::new("path", "join")]);
                debug!(brand, flight = flight.id, "joining in-flight load");
                Claim::Flight(flight.tx.subscribe())
            }
            Some(Slot::Evicting(done)) => Claim::Deleting(done.subscribe()),
            None => {
                CACHE_MISSES.add(1, &[KeyValue::new("path", "lead")]);
                let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                let flight = Arc::new(Flight { id, tx });
                slots.by_brand.insert(brand.to_string(), Slot::Loading(flight.clone()));
                self.spawn_load(brand.to_string(), flight);
                Claim::Flight(rx)
            }
        }
    }

    fn spawn_load(&self, brand: String, flight: Arc<Flight>) {
        let inner = self.inner.clone();
        LOADS_STARTED.add(1, &[]);
        let span = info_span!("model_load", brand = %brand, flight = flight.id);
        tokio::spawn(
            async move {
                let started = Instant::now();
                let result = match AssertUnwindSafe(inner.loader.load(&brand)).catch_unwind().await {
                    Ok(r) => r.map(Arc::new),
                    Err(_) => Err(ModelError::Unexpected(format!("loader panicked for '{brand}'"))),
                };
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                let installed = {
                    let mut slots = inner.slots.lock();
                    let ours = matches!(slots.by_brand.get(&brand), Some(Slot::Loading(f)) if f.id == flight.id);
                    if ours {
                        match &result {
                            Ok(model) => {
                                slots.by_brand.insert(brand.clone(), Slot::Ready(model.clone()));
                            }
                            Err(_) => {
                                slots.by_brand.remove(&brand);
                            }
                        }
                    }
                    ours
                };
                match &result {
                    Ok(_) if installed => {
                        LOAD_LATENCY.record(elapsed_ms, &[KeyValue::new("outcome", "ok")]);
                        info!(elapsed_ms, "model cached");
                    }
                    Ok(_) => {
                        LOAD_LATENCY.record(elapsed_ms, &[KeyValue::new("outcome", "evicted")]);
                        info!(elapsed_ms, "load finished after eviction, not cached");
                    }
                    Err(e) => {
                        LOAD_LATENCY.record(elapsed_ms, &[KeyValue::new("outcome", "error")]);
                        metrics::record_load_failure(e.kind());
                        warn!(error=%e, retryable = e.is_retryable(), elapsed_ms, "model load failed");
                    }
                }
                flight.tx.send_replace(Some(result));
            }
            .instrument(span),
        );
    }

    pub fn contains(&self, brand: &str) -> bool {
        matches!(self.inner.slots.lock().by_brand.get(brand), Some(Slot::Ready(_)))
    }

    /// Brands with a resident model, sorted.
    pub fn loaded_brands(&self) -> Vec<String> {
        let mut brands: Vec<String> = self
            .inner
            .slots
            .lock()
            .by_brand
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(brand, _)| brand.clone())
            .collect();
        brands.sort();
        brands
    }

    /// Drops `brand` from memory (a resident model or an in-flight claim) and
    /// deletes its resolved checkpoint file. True if either had an effect.
    /// Loads for `brand` requested meanwhile wait until the file is gone.
    pub fn evict(&self, brand: &str) -> bool {
        let done = gate();
        let removed = self.inner.slots.lock().by_brand.insert(brand.to_string(), Slot::Evicting(done.clone()));
        let from_memory = match removed {
            Some(Slot::Ready(_)) => {
                info!(brand, "model evicted from memory");
                true
            }
            Some(Slot::Loading(flight)) => {
                info!(brand, flight = flight.id, "in-flight load detached by eviction");
                true
            }
            Some(Slot::Evicting(_)) | None => false,
        };
        let from_disk = self.inner.store.delete(brand);
        {
            let mut slots = self.inner.slots.lock();
            if is_gate(slots.by_brand.get(brand), &done) {
                slots.by_brand.remove(brand);
            }
        }
        done.send_replace(true);
        metrics::record_eviction("memory", from_memory as u64);
        metrics::record_eviction("disk", from_disk as u64);
        from_memory || from_disk
    }

    /// Empties the map and deletes every checkpoint in the models directory.
    /// The cache count covers resident models only.
    pub fn evict_all(&self) -> EvictionCounts {
        let done = gate();
        let evicted_from_cache = {
            let mut slots = self.inner.slots.lock();
            let ready = slots.by_brand.values().filter(|s| matches!(s, Slot::Ready(_))).count();
            slots.by_brand.retain(|_, s| matches!(s, Slot::Evicting(_)));
            slots.clearing = Some(done.clone());
            ready
        };
        let evicted_from_disk = self.inner.store.clear();
        {
            let mut slots = self.inner.slots.lock();
            if slots.clearing.as_ref().is_some_and(|g| Arc::ptr_eq(g, &done)) {
                slots.clearing = None;
            }
        }
        done.send_replace(true);
        metrics::record_eviction("memory", evicted_from_cache as u64);
        metrics::record_eviction("disk", evicted_from_disk as u64);
        warn!(evicted_from_cache, evicted_from_disk, "all brand models evicted");
        EvictionCounts { evicted_from_cache, evicted_from_disk }
    }

    /// Resident and loading brands plus on-disk checkpoints, one row per
    /// normalized brand. Memory rows win; only disk rows carry a size.
    pub fn snapshot(&self) -> CacheSnapshot {
        let mut models: Vec<CachedModelInfo> = {
            let slots = self.inner.slots.lock();
            slots
                .by_brand
                .iter()
                .filter_map(|(brand, slot)| {
                    let (status, in_memory) = match slot {
                        Slot::Ready(_) => (ModelStatus::Loaded, true),
                        Slot::Loading(_) => (ModelStatus::Loading, false),
                        Slot::Evicting(_) => return None,
                    };
                    Some(CachedModelInfo { brand: brand.clone(), status, in_memory, size_mb: None })
                })
                .collect()
        };
        let total_in_memory = models.iter().filter(|m| m.in_memory).count();
        let known: HashSet<String> = models.iter().map(|m| normalize_brand(&m.brand)).collect();
        let disk = self.inner.store.list();
        let total_on_disk = disk.len();
        models.extend(disk.into_iter().filter(|d| !known.contains(&d.brand)).map(|d| CachedModelInfo {
            brand: d.brand,
            status: ModelStatus::OnDisk,
            in_memory: false,
            size_mb: Some(size_mb(d.size_bytes)),
        }));
        models.sort_by(|a, b| a.brand.cmp(&b.brand));
        CacheSnapshot { total_in_memory, total_on_disk, models }
    }
}

fn size_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}
