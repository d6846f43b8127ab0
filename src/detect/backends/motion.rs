use std::time::Instant;

use anyhow::Result;

use crate::detect::backend::{DetectionCapability, DetectorBackend, InputSpec};
use crate::detect::motion::{MotionConfig, MotionDetector, MotionOutcome};
use crate::detect::result::DetectionResult;

/// Built-in `motion` model. Stateful, so every stream owns its own.
pub struct MotionBackend {
    detector: MotionDetector,
    last: MotionOutcome,
}

impl MotionBackend {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            detector: MotionDetector::new(config),
            last: MotionOutcome::default(),
        }
    }

    pub fn last_outcome(&self) -> MotionOutcome {
        self.last
    }
}

impl Default for MotionBackend {
    fn default() -> Self {
        Self::new(MotionConfig::default())
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::Motion)
    }

    fn input(&self) -> Option<InputSpec> {
        Some(InputSpec::gray())
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        self.last = self.detector.process(pixels, width, height, Instant::now())?;
        if self.last.detected {
            Ok(DetectionResult::motion(self.last.score))
        } else {
            Ok(DetectionResult::empty())
        }
    }
}
