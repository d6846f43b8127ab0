//! Frame preparation: colour conversion, downscale and stride removal into a
//! pooled buffer in the layout the backend asked for.

use anyhow::{anyhow, Result};

use crate::error::NvrError;
use crate::media::{PixelFormat, VideoFrame};

use super::backend::{FrameLayout, InputSpec};
use super::pool::{BufferPool, PooledBuffer};

/// Longest side of a frame prepared for a backend without a fixed input size.
pub const MAX_SIDE: u32 = 416;

/// A packed frame on loan from the pool.
pub struct PreparedFrame<'p> {
    pub width: u32,
    pub height: u32,
    pub layout: FrameLayout,
    buffer: PooledBuffer<'p>,
}

impl PreparedFrame<'_> {
    pub fn pixels(&self) -> &[u8] {
        &self.buffer
    }
}

fn even_floor(v: u32) -> u32 {
    (v & !1).max(2)
}

/// Output size for a `width x height` source.
pub fn target_size(width: u32, height: u32, spec: &InputSpec) -> (u32, u32) {
    if let Some(size) = spec.fixed_size {
        return size;
    }
    let longest = width.max(height).max(1);
    if longest <= MAX_SIDE {
        return (even_floor(width), even_floor(height));
    }
    let scale = |v: u32| (v as u64 * MAX_SIDE as u64 / longest as u64) as u32;
    (even_floor(scale(width)), even_floor(scale(height)))
}

/// Convert `frame` for a backend expecting `spec`. A failed allocation at the
/// full target size is retried once at 75% of it when the size is not fixed.
pub fn prepare<'p>(frame: &VideoFrame, spec: &InputSpec, pool: &'p BufferPool) -> Result<PreparedFrame<'p>> {
    if !frame.is_valid() {
        return Err(anyhow!(
            "invalid frame {}x{} with {} planes",
            frame.width,
            frame.height,
            frame.planes.len()
        ));
    }
    let (mut width, mut height) = target_size(frame.width, frame.height, spec);
    let buffer = match pool.acquire(spec.frame_bytes(width, height)) {
        Ok(buffer) => buffer,
        Err(err) if spec.fixed_size.is_none() && is_exhausted(&err) => {
            width = even_floor(width * 3 / 4);
            height = even_floor(height * 3 / 4);
            log::debug!("prep: retrying at reduced size {}x{}", width, height);
            pool.acquire(spec.frame_bytes(width, height))?
        }
        Err(err) => return Err(err),
    };
    let mut prepared = PreparedFrame {
        width,
        height,
        layout: spec.layout,
        buffer,
    };
    fill(frame, &mut prepared)?;
    Ok(prepared)
}

fn is_exhausted(err: &anyhow::Error) -> bool {
    matches!(NvrError::classify(err), Some(NvrError::ResourceExhausted(_)))
}

fn fill(frame: &VideoFrame, out: &mut PreparedFrame<'_>) -> Result<()> {
    let (ow, oh) = (out.width as usize, out.height as usize);
    let (sw, sh) = (frame.width as usize, frame.height as usize);
    let plane = ow * oh;
    let layout = out.layout;
    let dst: &mut [u8] = &mut out.buffer;
    for oy in 0..oh {
        let sy = oy * sh / oh;
        for ox in 0..ow {
            let sx = ox * sw / ow;
            let i = oy * ow + ox;
            match layout {
                FrameLayout::Gray8 => dst[i] = luma_at(frame, sx, sy)?,
                FrameLayout::Rgb24 => {
                    let [r, g, b] = rgb_at(frame, sx, sy)?;
                    dst[i * 3] = r;
                    dst[i * 3 + 1] = g;
                    dst[i * 3 + 2] = b;
                }
                FrameLayout::PlanarRgb => {
                    let [r, g, b] = rgb_at(frame, sx, sy)?;
                    dst[i] = r;
                    dst[plane + i] = g;
                    dst[2 * plane + i] = b;
                }
            }
        }
    }
    Ok(())
}

fn sample(frame: &VideoFrame, plane: usize, x: usize, y: usize) -> Result<u8> {
    let stride = frame.strides[plane];
    frame.planes[plane]
        .get(y * stride + x)
        .copied()
        .ok_or_else(|| anyhow!("frame plane {} too short at ({}, {})", plane, x, y))
}

fn luma_at(frame: &VideoFrame, x: usize, y: usize) -> Result<u8> {
    match frame.format {
        PixelFormat::Yuv420p | PixelFormat::Gray8 => sample(frame, 0, x, y),
        PixelFormat::Rgb24 => {
            let r = sample(frame, 0, x * 3, y)? as u32;
            let g = sample(frame, 0, x * 3 + 1, y)? as u32;
            let b = sample(frame, 0, x * 3 + 2, y)? as u32;
            Ok(((77 * r + 150 * g + 29 * b) >> 8) as u8)
        }
    }
}

fn rgb_at(frame: &VideoFrame, x: usize, y: usize) -> Result<[u8; 3]> {
    match frame.format {
        PixelFormat::Rgb24 => Ok([
            sample(frame, 0, x * 3, y)?,
            sample(frame, 0, x * 3 + 1, y)?,
            sample(frame, 0, x * 3 + 2, y)?,
        ]),
        PixelFormat::Gray8 => {
            let v = sample(frame, 0, x, y)?;
            Ok([v, v, v])
        }
        PixelFormat::Yuv420p => {
            let luma = sample(frame, 0, x, y)? as f32;
            let u = sample(frame, 1, x / 2, y / 2)? as f32 - 128.0;
            let v = sample(frame, 2, x / 2, y / 2)? as f32 - 128.0;
            let clamp = |c: f32| c.round().clamp(0.0, 255.0) as u8;
            Ok([
                clamp(luma + 1.402 * v),
                clamp(luma - 0.344_136 * u - 0.714_136 * v),
                clamp(luma + 1.772 * u),
            ])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuv(width: u32, height: u32, luma: u8) -> VideoFrame {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        VideoFrame {
            width,
            height,
            format: PixelFormat::Yuv420p,
            planes: vec![vec![luma; w * h], vec![128; cw * ch], vec![128; cw * ch]],
            strides: vec![w, cw, cw],
            pts: None,
        }
    }

    #[test]
    fn target_keeps_aspect_and_even_sides() {
        assert_eq!(target_size(1920, 1080, &InputSpec::rgb()), (416, 234));
        assert_eq!(target_size(1280, 721, &InputSpec::rgb()), (416, 234));
        assert_eq!(target_size(320, 241, &InputSpec::rgb()), (320, 240));
        assert_eq!(
            target_size(1920, 1080, &InputSpec::gray().with_size(640, 480)),
            (640, 480)
        );
    }

    #[test]
    fn converts_to_rgb_and_gray() {
        let pool = BufferPool::new(2);
        let frame = yuv(64, 32, 100);
        let rgb = prepare(&frame, &InputSpec::rgb(), &pool).unwrap();
        assert_eq!((rgb.width, rgb.height), (64, 32));
        assert_eq!(rgb.pixels().len(), 64 * 32 * 3);
        assert!(rgb.pixels().iter().all(|&p| p == 100));
        let gray = prepare(&frame, &InputSpec::gray(), &pool).unwrap();
        assert_eq!(gray.pixels().len(), 64 * 32);
    }

    #[test]
    fn planar_layout_splits_channels() {
        let pool = BufferPool::new(1);
        let frame = VideoFrame {
            width: 2,
            height: 2,
            format: PixelFormat::Rgb24,
            planes: vec![vec![
                10, 20, 30, 10, 20, 30, 0, 0, // row 0 + padding
                10, 20, 30, 10, 20, 30, 0, 0,
            ]],
            strides: vec![8],
            pts: None,
        };
        let spec = InputSpec::rgb().with_layout(FrameLayout::PlanarRgb);
        let out = prepare(&frame, &spec, &pool).unwrap();
        assert_eq!(out.pixels(), &[10, 10, 10, 10, 20, 20, 20, 20, 30, 30, 30, 30]);
    }

    #[test]
    fn buffer_goes_back_to_pool() {
        let pool = BufferPool::new(1);
        let frame = yuv(32, 32, 50);
        drop(prepare(&frame, &InputSpec::gray(), &pool).unwrap());
        assert_eq!(pool.stats().in_use, 0);
        assert!(prepare(&frame, &InputSpec::gray(), &pool).is_ok());
    }
}
