//! Frame decoders feeding the detection pipeline.

use anyhow::Result;

use super::{Packet, StreamInfo};
#[cfg(not(feature = "rtsp-ffmpeg"))]
use crate::error::NvrError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv420p,
    Rgb24,
    Gray8,
}

impl PixelFormat {
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Rgb24 | PixelFormat::Gray8 => 1,
        }
    }
}

/// A decoded picture. Planes may carry row padding (`strides[i] >= row bytes`).
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Vec<u8>>,
    pub strides: Vec<usize>,
    pub pts: Option<i64>,
}

impl VideoFrame {
    /// Row `y` of `plane` with the stride padding cut off.
    pub fn row(&self, plane: usize, y: usize) -> Option<&[u8]> {
        let stride = *self.strides.get(plane)?;
        let width = match (self.format, plane) {
            (PixelFormat::Rgb24, _) => self.width as usize * 3,
            (PixelFormat::Yuv420p, 1 | 2) => (self.width as usize).div_ceil(2),
            _ => self.width as usize,
        };
        let start = y * stride;
        self.planes.get(plane)?.get(start..start + width)
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.planes.len() == self.format.plane_count()
            && self.strides.len() == self.planes.len()
    }
}

/// Decodes compressed video packets into pictures.
pub trait FrameDecoder: Send {
    fn name(&self) -> &'static str;

    /// Decode one access unit. `Ok(None)` means the decoder needs more input.
    fn decode(&mut self, packet: &Packet) -> Result<Option<VideoFrame>>;

    /// Every packet decodes on its own. Otherwise callers that sample the
    /// stream should only hand over keyframes.
    fn intra_only(&self) -> bool {
        false
    }
}

/// Decoder for the video track of the input at `url`.
pub fn open_decoder(url: &str, info: &StreamInfo) -> Result<Box<dyn FrameDecoder>> {
    if url.starts_with("stub://") {
        return Ok(Box::new(super::synthetic::SyntheticDecoder::new(info)));
    }
    #[cfg(feature = "rtsp-ffmpeg")]
    {
        Ok(Box::new(super::ffmpeg::FfmpegFrameDecoder::new(info)?))
    }
    #[cfg(not(feature = "rtsp-ffmpeg"))]
    {
        Err(NvrError::config(format!(
            "decoding {} from '{}' requires the rtsp-ffmpeg feature",
            info.codec, url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_skips_stride_padding() {
        let frame = VideoFrame {
            width: 2,
            height: 2,
            format: PixelFormat::Gray8,
            planes: vec![vec![1, 2, 0, 0, 3, 4, 0, 0]],
            strides: vec![4],
            pts: None,
        };
        assert!(frame.is_valid());
        assert_eq!(frame.row(0, 1), Some(&[3u8, 4][..]));
        assert_eq!(frame.row(0, 2), None);
    }
}
