//! Model strings, thresholds and path resolution.
//!
//! A stream names its detector with one string: `motion`, a model file
//! (`*.realnet.sod`, `*.sod`, `*.tflite`, `*.onnx`), an `http(s)://` endpoint
//! or `api-detection` (the configured endpoint). Files resolve against the
//! models root first, then a fixed list of fallback directories.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectorBackend, FrameLayout, InputSpec};
use crate::detect::result::DetectionResult;
use crate::error::NvrError;

/// Model string that selects the built-in motion detector.
pub const MOTION_MODEL: &str = "motion";
/// Model string that selects the configured detection API endpoint.
pub const API_MODEL: &str = "api-detection";

pub const DEFAULT_MODEL_THRESHOLD: f32 = 0.3;
pub const DEFAULT_REALNET_THRESHOLD: f32 = 5.0;
pub const MAX_CNN_THRESHOLD: f32 = 0.4;

/// RealNet runs on fixed-size grayscale frames.
pub const REALNET_WIDTH: u32 = 640;
pub const REALNET_HEIGHT: u32 = 480;

/// Model files above this size log a warning on load.
pub const LARGE_MODEL_BYTES: u64 = 50 * 1024 * 1024;

const FALLBACK_MODEL_DIRS: [&str; 3] = ["./models", "/etc/nvr/models", "/usr/share/nvr/models"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Motion,
    SodCnn,
    SodRealNet,
    TfLite,
    Onnx,
    Api,
    Onvif,
}

impl ModelKind {
    pub fn from_model(model: &str) -> Result<Self> {
        let model = model.trim();
        if model.eq_ignore_ascii_case(MOTION_MODEL) {
            return Ok(ModelKind::Motion);
        }
        if model == API_MODEL || model.starts_with("http://") || model.starts_with("https://") {
            return Ok(ModelKind::Api);
        }
        if model.eq_ignore_ascii_case("onvif") {
            return Ok(ModelKind::Onvif);
        }
        let lower = model.to_ascii_lowercase();
        if lower.ends_with(".realnet.sod") {
            return Ok(ModelKind::SodRealNet);
        }
        match Path::new(&lower).extension().and_then(|e| e.to_str()) {
            Some("sod") => Ok(ModelKind::SodCnn),
            Some("tflite") => Ok(ModelKind::TfLite),
            Some("onnx") => Ok(ModelKind::Onnx),
            _ => Err(NvrError::config(format!("unknown model type '{}'", model))),
        }
    }

    /// Kinds backed by a file under the models root.
    pub fn is_file(self) -> bool {
        matches!(
            self,
            ModelKind::SodCnn | ModelKind::SodRealNet | ModelKind::TfLite | ModelKind::Onnx
        )
    }

    /// Threshold actually applied for a configured value (`<= 0` means unset).
    pub fn effective_threshold(self, configured: f32) -> f32 {
        let configured = (configured.is_finite() && configured > 0.0).then_some(configured);
        match self {
            ModelKind::SodRealNet => configured.unwrap_or(DEFAULT_REALNET_THRESHOLD),
            ModelKind::SodCnn => configured
                .map(|t| t.min(MAX_CNN_THRESHOLD))
                .unwrap_or(DEFAULT_MODEL_THRESHOLD),
            ModelKind::Motion => configured.unwrap_or(0.0),
            _ => configured.unwrap_or(DEFAULT_MODEL_THRESHOLD),
        }
    }

    /// Frame layout the kind's runtime expects when the backend does not say.
    pub fn default_input(self) -> InputSpec {
        match self {
            ModelKind::SodRealNet => InputSpec::gray().with_size(REALNET_WIDTH, REALNET_HEIGHT),
            ModelKind::SodCnn => InputSpec::rgb().with_layout(FrameLayout::PlanarRgb),
            ModelKind::Motion => InputSpec::gray(),
            _ => InputSpec::rgb(),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelKind::Motion => "motion",
            ModelKind::SodCnn => "sod",
            ModelKind::SodRealNet => "sod_realnet",
            ModelKind::TfLite => "tflite",
            ModelKind::Onnx => "onnx",
            ModelKind::Api => "api",
            ModelKind::Onvif => "onvif",
        };
        f.write_str(name)
    }
}

/// Locate a model file: absolute path, then `<models_root>/<model>`, then the
/// fallback directories.
pub fn resolve_model_path(models_root: &Path, model: &str) -> Result<PathBuf> {
    let direct = Path::new(model);
    if direct.is_absolute() {
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }
        return Err(NvrError::config(format!("model file {} not found", model)));
    }
    let mut candidates = vec![models_root.join(model)];
    candidates.extend(FALLBACK_MODEL_DIRS.iter().map(|dir| Path::new(dir).join(model)));
    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| {
            NvrError::config(format!(
                "model '{}' not found under {} or fallback directories",
                model,
                models_root.display()
            ))
        })
}

/// Everything a loader needs to build a backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSpec {
    pub kind: ModelKind,
    /// File path for file models, endpoint URL for API models.
    pub location: String,
    pub threshold: f32,
}

/// Builds a backend for one model kind.
pub trait ModelLoader: Send + Sync {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn DetectorBackend>>;
}

/// Loaded model shared by every stream that names it.
pub struct LoadedModel {
    kind: ModelKind,
    location: String,
    input: InputSpec,
    loaded_at: Instant,
    backend: Mutex<Box<dyn DetectorBackend>>,
}

impl LoadedModel {
    pub fn new(spec: &ModelSpec, backend: Box<dyn DetectorBackend>) -> Self {
        Self {
            kind: spec.kind,
            location: spec.location.clone(),
            input: backend.input().unwrap_or_else(|| spec.kind.default_input()),
            loaded_at: Instant::now(),
            backend: Mutex::new(backend),
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn input(&self) -> InputSpec {
        self.input
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    fn backend(&self) -> Result<MutexGuard<'_, Box<dyn DetectorBackend>>> {
        self.backend
            .lock()
            .map_err(|_| anyhow!("model {} lock poisoned", self.location))
    }

    pub fn backend_name(&self) -> String {
        self.backend()
            .map(|b| b.name().to_string())
            .unwrap_or_else(|_| "poisoned".to_string())
    }

    /// Inference holds only this model's lock.
    pub fn detect(&self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        self.backend()?.detect(pixels, width, height)
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("kind", &self.kind)
            .field("location", &self.location)
            .finish()
    }
}

/// Size check run before a file model is handed to its loader.
pub(crate) fn warn_if_large(path: &Path) {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() > LARGE_MODEL_BYTES {
            log::warn!(
                "detect: model {} is {} MB; loading may be slow",
                path.display(),
                meta.len() / (1024 * 1024)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn kinds_from_model_strings() {
        assert_eq!(ModelKind::from_model("motion").unwrap(), ModelKind::Motion);
        assert_eq!(ModelKind::from_model("face.realnet.sod").unwrap(), ModelKind::SodRealNet);
        assert_eq!(ModelKind::from_model("tiny20.sod").unwrap(), ModelKind::SodCnn);
        assert_eq!(ModelKind::from_model("ssd.TFLITE").unwrap(), ModelKind::TfLite);
        assert_eq!(ModelKind::from_model("yolo.onnx").unwrap(), ModelKind::Onnx);
        assert_eq!(ModelKind::from_model("api-detection").unwrap(), ModelKind::Api);
        assert_eq!(
            ModelKind::from_model("http://127.0.0.1:9001/api/v1/detect").unwrap(),
            ModelKind::Api
        );
        let err = ModelKind::from_model("weights.bin").unwrap_err();
        assert!(matches!(NvrError::classify(&err), Some(NvrError::Config(_))));
    }

    #[test]
    fn thresholds_follow_kind() {
        assert_eq!(ModelKind::SodCnn.effective_threshold(0.0), 0.3);
        assert_eq!(ModelKind::SodCnn.effective_threshold(0.7), MAX_CNN_THRESHOLD);
        assert_eq!(ModelKind::SodCnn.effective_threshold(0.25), 0.25);
        assert_eq!(ModelKind::TfLite.effective_threshold(0.0), 0.3);
        assert_eq!(ModelKind::TfLite.effective_threshold(0.7), 0.7);
        assert_eq!(ModelKind::SodRealNet.effective_threshold(0.0), 5.0);
        assert_eq!(ModelKind::SodRealNet.effective_threshold(8.0), 8.0);
    }

    #[test]
    fn default_inputs_follow_kind() {
        assert_eq!(
            ModelKind::SodRealNet.default_input(),
            InputSpec::gray().with_size(REALNET_WIDTH, REALNET_HEIGHT)
        );
        assert_eq!(ModelKind::SodCnn.default_input().layout, FrameLayout::PlanarRgb);
        assert_eq!(ModelKind::SodCnn.default_input().fixed_size, None);
        assert_eq!(ModelKind::TfLite.default_input(), InputSpec::rgb());
        assert_eq!(ModelKind::Motion.default_input(), InputSpec::gray());
    }

    #[test]
    fn resolves_under_models_root() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("ssd.tflite");
        fs::write(&model, b"model").unwrap();
        assert_eq!(resolve_model_path(dir.path(), "ssd.tflite").unwrap(), model);
        assert_eq!(
            resolve_model_path(dir.path(), model.to_str().unwrap()).unwrap(),
            model
        );
        let err = resolve_model_path(dir.path(), "missing-model-for-test.tflite").unwrap_err();
        assert!(matches!(NvrError::classify(&err), Some(NvrError::Config(_))));
    }
}
