//! Loaded models shared across streams.
//!
//! One LRU keyed by model location (resolved file path or endpoint URL).
//! Streams pin a model by holding its `Arc`; an entry is evictable only while
//! the cache holds the sole reference. Loading runs under the cache lock,
//! inference does not.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use lru::LruCache;

use crate::error::NvrError;

use super::model::{resolve_model_path, warn_if_large, LoadedModel, ModelKind, ModelSpec, API_MODEL};
use super::registry::LoaderRegistry;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelCacheStats {
    pub hits: u64,
    pub loads: u64,
    pub evictions: u64,
}

pub struct ModelCache {
    entries: Mutex<LruCache<String, Arc<LoadedModel>>>,
    loaders: LoaderRegistry,
    models_root: PathBuf,
    api_url: Option<String>,
    hits: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl ModelCache {
    pub fn new(capacity: usize, models_root: &Path, loaders: LoaderRegistry) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            loaders,
            models_root: models_root.to_path_buf(),
            api_url: None,
            hits: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Endpoint used for the `api-detection` model string.
    pub fn with_api_url(mut self, url: Option<String>) -> Self {
        self.api_url = url;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, LruCache<String, Arc<LoadedModel>>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("model cache lock poisoned"))
    }

    pub fn models_root(&self) -> &Path {
        &self.models_root
    }

    /// Kind and cache key for a model string.
    pub fn resolve(&self, model: &str) -> Result<(ModelKind, String)> {
        let kind = ModelKind::from_model(model)?;
        let location = match kind {
            ModelKind::Motion => {
                return Err(NvrError::config("motion detection does not load a model"))
            }
            ModelKind::Onvif => {
                return Err(NvrError::config(
                    "onvif detection events are not handled by the recording core",
                ))
            }
            ModelKind::Api if model.trim() == API_MODEL => self
                .api_url
                .clone()
                .ok_or_else(|| NvrError::config("api-detection selected but no api_detection_url configured"))?,
            ModelKind::Api => model.trim().to_string(),
            _ => {
                let path = resolve_model_path(&self.models_root, model.trim())?;
                path.to_string_lossy().into_owned()
            }
        };
        Ok((kind, location))
    }

    /// Cached model for `model`, loading it on a miss.
    pub fn get(&self, model: &str, threshold: f32) -> Result<Arc<LoadedModel>> {
        let (kind, location) = self.resolve(model)?;
        let mut entries = self.lock()?;
        if let Some(found) = entries.get(&location) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(found.clone());
        }
        if entries.len() >= entries.cap().get() {
            Self::evict_one(&mut entries)?;
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let spec = ModelSpec {
            kind,
            location: location.clone(),
            threshold: kind.effective_threshold(threshold),
        };
        if kind.is_file() {
            warn_if_large(Path::new(&location));
        }
        let backend = self.loaders.load(&spec)?;
        let loaded = Arc::new(LoadedModel::new(&spec, backend));
        log::info!(
            "detect: loaded {} model {} ({})",
            kind,
            location,
            loaded.backend_name()
        );
        entries.put(location, loaded.clone());
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(loaded)
    }

    /// Drop the least recently used model nobody else holds.
    fn evict_one(entries: &mut LruCache<String, Arc<LoadedModel>>) -> Result<()> {
        let victim = entries
            .iter()
            .rev()
            .find(|(_, model)| Arc::strong_count(model) == 1)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| {
                NvrError::exhausted(format!(
                    "model cache full: all {} models are in use",
                    entries.len()
                ))
            })?;
        entries.pop(&victim);
        log::info!("detect: unloaded model {}", victim);
        Ok(())
    }

    pub fn contains(&self, location: &str) -> bool {
        self.lock().map(|e| e.contains(location)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident model locations, most recently used first.
    pub fn resident(&self) -> Vec<String> {
        self.lock()
            .map(|e| e.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ModelCacheStats {
        ModelCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Teardown: unload every model. Returns how many were resident.
    pub fn unload_all(&self) -> usize {
        let Ok(mut entries) = self.lock() else {
            return 0;
        };
        let mut count = 0;
        while let Some((location, model)) = entries.pop_lru() {
            if Arc::strong_count(&model) > 1 {
                log::warn!("detect: unloading {} while a stream still holds it", location);
            }
            log::debug!("detect: unloaded model {}", location);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubLoader;
    use std::fs;
    use tempfile::tempdir;

    fn cache(capacity: usize, root: &Path) -> ModelCache {
        let mut loaders = LoaderRegistry::new();
        loaders.register(ModelKind::TfLite, StubLoader);
        ModelCache::new(capacity, root, loaders)
    }

    fn model_files(root: &Path, names: &[&str]) {
        for name in names {
            fs::write(root.join(name), b"weights").unwrap();
        }
    }

    #[test]
    fn second_lookup_hits() {
        let dir = tempdir().unwrap();
        model_files(dir.path(), &["a.tflite"]);
        let cache = cache(4, dir.path());
        let first = cache.get("a.tflite", 0.0).unwrap();
        let second = cache.get("a.tflite", 0.5).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats(), ModelCacheStats { hits: 1, loads: 1, evictions: 0 });
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_skips_pinned_models() {
        let dir = tempdir().unwrap();
        model_files(dir.path(), &["a.tflite", "b.tflite", "c.tflite"]);
        let cache = cache(2, dir.path());
        let pinned = cache.get("a.tflite", 0.0).unwrap();
        drop(cache.get("b.tflite", 0.0).unwrap());

        cache.get("c.tflite", 0.0).unwrap();
        assert!(cache.contains(pinned.location()));
        assert!(!cache.contains(&dir.path().join("b.tflite").to_string_lossy()));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn full_cache_of_pinned_models_is_exhausted() {
        let dir = tempdir().unwrap();
        model_files(dir.path(), &["a.tflite", "b.tflite"]);
        let cache = cache(1, dir.path());
        let _pinned = cache.get("a.tflite", 0.0).unwrap();
        let err = cache.get("b.tflite", 0.0).unwrap_err();
        assert!(matches!(
            NvrError::classify(&err),
            Some(NvrError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn unknown_runtime_and_motion_are_config_errors() {
        let dir = tempdir().unwrap();
        model_files(dir.path(), &["tiny.sod"]);
        let cache = cache(2, dir.path());
        for model in ["tiny.sod", "motion", "onvif", "api-detection"] {
            let err = cache.get(model, 0.0).unwrap_err();
            assert!(
                matches!(NvrError::classify(&err), Some(NvrError::Config(_))),
                "{}: {:#}",
                model,
                err
            );
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn unload_all_empties_cache() {
        let dir = tempdir().unwrap();
        model_files(dir.path(), &["a.tflite", "b.tflite"]);
        let cache = cache(4, dir.path());
        cache.get("a.tflite", 0.0).unwrap();
        cache.get("b.tflite", 0.0).unwrap();
        assert_eq!(cache.resident().len(), 2);
        assert_eq!(cache.unload_all(), 2);
        assert!(cache.is_empty());
    }
}
