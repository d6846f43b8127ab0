use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::model::{ModelLoader, ModelSpec};
use crate::detect::result::{Detection, DetectionResult};

pub const STUB_LABEL: &str = "object";
pub const STUB_CONFIDENCE: f32 = 0.85;

/// Stub backend for testing. Reports one full-frame `object` whenever the
/// frame's pixel hash differs from the previous frame's.
pub struct StubBackend {
    last_hash: Option<[u8; 32]>,
    frames: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            last_hash: None,
            frames: 0,
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn detect(&mut self, pixels: &[u8], _width: u32, _height: u32) -> Result<DetectionResult> {
        let current_hash: [u8; 32] = Sha256::digest(pixels).into();
        let changed = self.last_hash.is_some_and(|prev| prev != current_hash);
        self.last_hash = Some(current_hash);
        self.frames += 1;

        let mut result = DetectionResult::empty();
        if changed {
            result.push(Detection::new(STUB_LABEL, STUB_CONFIDENCE));
        }
        Ok(result)
    }
}

/// Loader that hands out [`StubBackend`]s for any model kind it is registered under.
#[derive(Clone, Copy, Debug, Default)]
pub struct StubLoader;

impl ModelLoader for StubLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn DetectorBackend>> {
        log::debug!("detect: stub runtime standing in for {}", spec.location);
        Ok(Box::new(StubBackend::new()))
    }
}
