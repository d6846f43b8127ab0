use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::error::NvrError;

use super::backend::DetectorBackend;
use super::model::{ModelKind, ModelLoader, ModelSpec};

/// Model runtimes, one loader per model kind.
///
/// SOD and TFLite have no built-in runtime; embedders register a loader for
/// them. ONNX (`backend-tract`) and remote API (`api-detection`) loaders are
/// registered by [`LoaderRegistry::with_builtin`] when their feature is on.
pub struct LoaderRegistry {
    loaders: HashMap<ModelKind, Arc<dyn ModelLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    /// Registry with every loader compiled into this build.
    pub fn with_builtin() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "backend-tract")]
        registry.register(ModelKind::Onnx, super::backends::TractLoader::default());
        #[cfg(feature = "api-detection")]
        registry.register(ModelKind::Api, super::backends::ApiLoader::default());
        registry
    }

    /// Register a loader, replacing any previous one for `kind`.
    pub fn register<L: ModelLoader + 'static>(&mut self, kind: ModelKind, loader: L) {
        log::debug!("detect: loader registered for {} models", kind);
        self.loaders.insert(kind, Arc::new(loader));
    }

    pub fn get(&self, kind: ModelKind) -> Option<Arc<dyn ModelLoader>> {
        self.loaders.get(&kind).cloned()
    }

    pub fn supports(&self, kind: ModelKind) -> bool {
        self.loaders.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<ModelKind> {
        self.loaders.keys().copied().collect()
    }

    /// Build and warm up a backend for `spec`.
    pub fn load(&self, spec: &ModelSpec) -> Result<Box<dyn DetectorBackend>> {
        let loader = self.get(spec.kind).ok_or_else(|| {
            NvrError::config(format!(
                "no runtime available for {} model '{}'",
                spec.kind, spec.location
            ))
        })?;
        let mut backend = loader.load(spec)?;
        backend.warm_up()?;
        Ok(backend)
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
