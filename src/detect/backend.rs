use anyhow::Result;

use crate::detect::result::DetectionResult;

/// What a backend can answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    Motion,
    ObjectDetection,
}

/// Pixel layout a backend expects in `detect`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameLayout {
    /// Packed `RGBRGB...`, 3 bytes per pixel.
    Rgb24,
    /// One byte of luma per pixel.
    Gray8,
    /// Three contiguous planes `R..R G..G B..B`, each `width * height` bytes.
    PlanarRgb,
}

impl FrameLayout {
    pub fn channels(self) -> usize {
        match self {
            FrameLayout::Gray8 => 1,
            FrameLayout::Rgb24 | FrameLayout::PlanarRgb => 3,
        }
    }
}

/// Input a backend wants: layout plus an optional fixed resolution. Without
/// one the frame keeps its aspect ratio, longest side capped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputSpec {
    pub layout: FrameLayout,
    pub fixed_size: Option<(u32, u32)>,
}

impl InputSpec {
    pub const fn rgb() -> Self {
        Self {
            layout: FrameLayout::Rgb24,
            fixed_size: None,
        }
    }

    pub const fn gray() -> Self {
        Self {
            layout: FrameLayout::Gray8,
            fixed_size: None,
        }
    }

    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.fixed_size = Some((width, height));
        self
    }

    pub const fn with_layout(mut self, layout: FrameLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Bytes of one prepared frame at `width x height`.
    pub fn frame_bytes(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.layout.channels()
    }
}

/// Detector backend trait.
///
/// `detect` receives a packed frame in the layout announced by `input`. The
/// slice is borrowed from the frame buffer pool and goes back to it when the
/// call returns; backends must not keep it.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Input the backend insists on. `None` takes the layout its model kind
    /// is known to need.
    fn input(&self) -> Option<InputSpec> {
        None
    }

    /// Run detection on a frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult>;

    /// Optional warm-up hook, run once after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
