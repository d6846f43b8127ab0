#![cfg(feature = "backend-tract")]
//! `*.onnx` models run in-process with tract.
//!
//! The graph takes one `1x3xHxW` f32 tensor scaled to `0..1` and returns a
//! score per class on its first output. Every class that clears the
//! threshold becomes a full-frame detection labelled `class_<n>`.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectionCapability, DetectorBackend, FrameLayout, InputSpec};
use crate::detect::model::{ModelLoader, ModelSpec};
use crate::detect::result::{Detection, DetectionResult};

pub const DEFAULT_INPUT_SIZE: u32 = 416;
const DEFAULT_THRESHOLD: f32 = 0.3;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>>;

pub struct TractBackend {
    plan: Plan,
    input_w: u32,
    input_h: u32,
    threshold: f32,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(path: P, input_w: u32, input_h: u32) -> Result<Self> {
        let path = path.as_ref();
        let shape = tvec!(1, 3, input_h as usize, input_w as usize);
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("detect: cannot read onnx model {}", path.display()))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), shape))
            .with_context(|| format!("detect: {} rejects a {}x{} input", path.display(), input_w, input_h))?
            .into_optimized()
            .with_context(|| format!("detect: optimizing {}", path.display()))?
            .into_runnable()
            .with_context(|| format!("detect: planning {}", path.display()))?;
        log::info!(
            "detect: onnx model {} ready at {}x{}",
            path.display(),
            input_w,
            input_h
        );
        Ok(Self {
            plan,
            input_w,
            input_h,
            threshold: DEFAULT_THRESHOLD,
        })
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    fn tensor(&self, planes: &[u8], width: u32, height: u32) -> Result<Tensor> {
        if (width, height) != (self.input_w, self.input_h) {
            return Err(anyhow!(
                "onnx input is {}x{}, frame is {}x{}",
                self.input_w,
                self.input_h,
                width,
                height
            ));
        }
        let (w, h) = (width as usize, height as usize);
        let area = w * h;
        if planes.len() != area * 3 {
            return Err(anyhow!("planar frame has {} bytes, want {}", planes.len(), area * 3));
        }
        let array = tract_ndarray::Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
            f32::from(planes[c * area + y * w + x]) / 255.0
        });
        Ok(array.into_tensor())
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        capability == DetectionCapability::ObjectDetection
    }

    fn input(&self) -> Option<InputSpec> {
        Some(
            InputSpec::rgb()
                .with_layout(FrameLayout::PlanarRgb)
                .with_size(self.input_w, self.input_h),
        )
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        let input = self.tensor(pixels, width, height)?;
        let outputs = self.plan.run(tvec!(input.into())).context("onnx run")?;
        let scores = outputs
            .first()
            .ok_or_else(|| anyhow!("onnx model returned nothing"))?
            .to_array_view::<f32>()
            .context("onnx scores are not f32")?;

        let mut result = DetectionResult::empty();
        for (class, score) in scores.iter().enumerate() {
            if score.is_finite() && *score >= self.threshold {
                result.push(Detection::new(&format!("class_{}", class), *score));
            }
        }
        Ok(result)
    }
}

/// Loads `*.onnx` models at a square input size.
#[derive(Clone, Copy, Debug)]
pub struct TractLoader {
    pub input_size: u32,
}

impl Default for TractLoader {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

impl ModelLoader for TractLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn DetectorBackend>> {
        let backend = TractBackend::new(&spec.location, self.input_size, self.input_size)?
            .with_threshold(spec.threshold);
        Ok(Box::new(backend))
    }
}
