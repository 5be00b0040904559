//! Bounded LRU cache of loaded PCA models (spec section 4.5).
//!
//! Grounded on `examples/original_source/src/pca_model_cache.{h,cpp}`:
//! same hit/miss/eviction bookkeeping, same "unlock while loading" shape
//! (here expressed by taking the loader as a parameter rather than holding
//! the mutex across the load), same byte-capacity-then-entry-count
//! eviction order.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tm_types::{ErrorCode, HasErrorCode};
use uuid::Uuid;

const DEFAULT_MAX_ENTRIES: usize = 100;
const DEFAULT_MAX_BYTES: usize = 512 * 1024 * 1024;
const DEFAULT_TTL_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to load model {model_run_id}: {source}")]
    Load {
        model_run_id: Uuid,
        #[source]
        source: tm_pca::PcaError,
    },
}

impl HasErrorCode for CacheError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::ArtifactLoadFailed
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModelCacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub ttl: Duration,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: DEFAULT_MAX_BYTES,
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub size: usize,
    pub bytes_used: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheEntry {
    model: std::sync::Arc<tm_pca::PcaModel>,
    artifact_path: String,
    last_access: Instant,
    memory_usage: usize,
}

struct CacheState {
    entries: HashMap<Uuid, CacheEntry>,
    bytes_used: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Thread-safe, keyed-by-`model_run_id` cache of loaded [`tm_pca::PcaModel`]s.
pub struct ModelCache {
    config: ModelCacheConfig,
    state: Mutex<CacheState>,
}

impl ModelCache {
    pub fn new(config: ModelCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                bytes_used: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Returns the cached model for `model_run_id` if it is fresh and keyed
    /// to the same `artifact_path`; otherwise loads it via `loader` (called
    /// with the cache lock released) and inserts it, evicting as needed.
    pub fn get_or_create<F>(
        &self,
        model_run_id: Uuid,
        artifact_path: &str,
        loader: F,
    ) -> Result<std::sync::Arc<tm_pca::PcaModel>, CacheError>
    where
        F: FnOnce(&str) -> Result<tm_pca::PcaModel, tm_pca::PcaError>,
    {
        let now = Instant::now();
        {
            let mut state = self.state.lock().expect("cache mutex poisoned");
            if let Some(entry) = state.entries.get(&model_run_id) {
                if now.duration_since(entry.last_access) > self.config.ttl {
                    let usage = entry.memory_usage;
                    state.entries.remove(&model_run_id);
                    state.bytes_used -= usage;
                    tracing::debug!(%model_run_id, "model cache TTL expired");
                } else if entry.artifact_path == artifact_path {
                    state.hits += 1;
                    let model = entry.model.clone();
                    state.entries.get_mut(&model_run_id).unwrap().last_access = now;
                    return Ok(model);
                } else {
                    tracing::warn!(%model_run_id, cached = %entry.artifact_path, requested = %artifact_path, "artifact path mismatch, reloading");
                    let usage = entry.memory_usage;
                    state.entries.remove(&model_run_id);
                    state.bytes_used -= usage;
                }
            }
            state.misses += 1;
        }

        let model = loader(artifact_path).map_err(|source| CacheError::Load { model_run_id, source })?;
        let usage = model.estimate_memory_usage();
        let model = std::sync::Arc::new(model);

        let mut state = self.state.lock().expect("cache mutex poisoned");

        if usage > self.config.max_bytes {
            tracing::error!(%model_run_id, usage, max_bytes = self.config.max_bytes, "model too large for cache, not caching");
            return Ok(model);
        }

        ensure_capacity(&mut state, usage, self.config.max_bytes);
        if state.entries.len() >= self.config.max_entries {
            evict_lru(&mut state);
        }

        state.entries.insert(
            model_run_id,
            CacheEntry {
                model: model.clone(),
                artifact_path: artifact_path.to_string(),
                last_access: now,
                memory_usage: usage,
            },
        );
        state.bytes_used += usage;

        Ok(model)
    }

    pub fn invalidate(&self, model_run_id: Uuid) {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        if let Some(entry) = state.entries.remove(&model_run_id) {
            state.bytes_used -= entry.memory_usage;
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        state.entries.clear();
        state.bytes_used = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("cache mutex poisoned");
        CacheStats {
            size: state.entries.len(),
            bytes_used: state.bytes_used,
            max_bytes: self.config.max_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }
}

fn ensure_capacity(state: &mut CacheState, additional_bytes: usize, max_bytes: usize) {
    while !state.entries.is_empty() && state.bytes_used + additional_bytes > max_bytes {
        evict_lru(state);
    }
}

fn evict_lru(state: &mut CacheState) {
    let Some((&oldest_id, _)) = state.entries.iter().min_by_key(|(_, e)| e.last_access) else {
        return;
    };
    if let Some(entry) = state.entries.remove(&oldest_id) {
        state.bytes_used -= entry.memory_usage;
        state.evictions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_model_json(n_bytes_components: usize) -> String {
        // Pad via extra components rows to grow estimate_memory_usage deterministically.
        let extra_rows = n_bytes_components / (5 * std::mem::size_of::<f64>());
        let mut components = vec![vec![1.0, 0.0, 0.0, 0.0, 0.0]];
        for _ in 0..extra_rows {
            components.push(vec![0.0, 1.0, 0.0, 0.0, 0.0]);
        }
        serde_json::json!({
            "meta": {"version": "v1", "features": []},
            "preprocessing": {"mean": [0.0,0.0,0.0,0.0,0.0], "scale": [1.0,1.0,1.0,1.0,1.0]},
            "model": {"components": components, "mean": [0.0,0.0,0.0,0.0,0.0], "explained_variance": [1.0], "n_components": 1},
            "thresholds": {"reconstruction_error": 0.5}
        })
        .to_string()
    }

    fn loader(body: String) -> impl Fn(&str) -> Result<tm_pca::PcaModel, tm_pca::PcaError> {
        move |path| tm_pca::PcaModel::load_from_str(path, &body)
    }

    #[test]
    fn miss_then_hit_increments_stats_without_reloading() {
        let cache = ModelCache::new(ModelCacheConfig::default());
        let id = Uuid::new_v4();
        let mut load_count = 0;
        cache
            .get_or_create(id, "a.json", |p| {
                load_count += 1;
                loader(fake_model_json(0))(p)
            })
            .unwrap();
        cache
            .get_or_create(id, "a.json", |p| {
                load_count += 1;
                loader(fake_model_json(0))(p)
            })
            .unwrap();
        assert_eq!(load_count, 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn mismatched_artifact_path_reloads() {
        let cache = ModelCache::new(ModelCacheConfig::default());
        let id = Uuid::new_v4();
        cache.get_or_create(id, "a.json", |p| loader(fake_model_json(0))(p)).unwrap();
        cache.get_or_create(id, "b.json", |p| loader(fake_model_json(0))(p)).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn evicts_lru_when_entry_count_exceeds_max() {
        let cache = ModelCache::new(ModelCacheConfig {
            max_entries: 2,
            ..ModelCacheConfig::default()
        });
        for i in 0..3 {
            let id = Uuid::new_v4();
            cache
                .get_or_create(id, &format!("{i}.json"), |p| loader(fake_model_json(0))(p))
                .unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn evicts_by_bytes_before_inserting_when_over_budget() {
        let cache = ModelCache::new(ModelCacheConfig {
            max_bytes: 400,
            max_entries: 100,
            ..ModelCacheConfig::default()
        });
        cache
            .get_or_create(Uuid::new_v4(), "a.json", |p| loader(fake_model_json(200))(p))
            .unwrap();
        cache
            .get_or_create(Uuid::new_v4(), "b.json", |p| loader(fake_model_json(200))(p))
            .unwrap();
        let stats = cache.stats();
        assert!(stats.bytes_used <= stats.max_bytes);
    }

    #[test]
    fn oversized_model_is_returned_uncached() {
        let cache = ModelCache::new(ModelCacheConfig {
            max_bytes: 32,
            ..ModelCacheConfig::default()
        });
        cache
            .get_or_create(Uuid::new_v4(), "a.json", |p| loader(fake_model_json(0))(p))
            .unwrap();
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn invalidate_removes_entry_and_frees_bytes() {
        let cache = ModelCache::new(ModelCacheConfig::default());
        let id = Uuid::new_v4();
        cache.get_or_create(id, "a.json", |p| loader(fake_model_json(0))(p)).unwrap();
        cache.invalidate(id);
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.bytes_used, 0);
    }
}
