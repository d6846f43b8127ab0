//! Media primitives shared by the readers and the muxers.
//!
//! - `Packet`: ref-counted compressed access unit. Cloning shares the payload.
//! - `StreamInfo`: per-track codec parameters captured when an input opens.
//! - `source`: demuxer trait + `open_input` routing (`stub://` or ffmpeg).
//! - `decode`: frame decoders feeding the detection pipeline.
//! - `h264`, `mp4`, `ts`: bitstream filter and the two container muxers.

pub mod decode;
#[cfg(feature = "rtsp-ffmpeg")]
pub(crate) mod ffmpeg;
pub mod h264;
pub mod mp4;
pub mod source;
pub(crate) mod synthetic;
pub mod ts;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use decode::{open_decoder, FrameDecoder, PixelFormat, VideoFrame};
pub use source::{open_input, Demuxer, Interrupter, ReadEvent};

/// Transport used to pull a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Onvif,
}

impl Protocol {
    /// UDP timestamps are corrected under the shared UDP lock; ONVIF URIs are
    /// RTSP over TCP once resolved.
    pub fn is_udp(self) -> bool {
        matches!(self, Protocol::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Onvif => "onvif",
        };
        f.write_str(name)
    }
}

/// Rational time base: one tick lasts `num / den` seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MPEG: TimeBase = TimeBase { num: 1, den: 90_000 };

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Ticks in one second (`den / num`), at least 1.
    pub fn ticks_per_second(self) -> i64 {
        if !self.is_valid() {
            return 1;
        }
        (self.den as i64 / self.num as i64).max(1)
    }

    pub fn to_seconds(self, ticks: i64) -> f64 {
        if !self.is_valid() {
            return 0.0;
        }
        ticks as f64 * self.num as f64 / self.den as f64
    }

    /// Rescales `ticks` from this time base into `to`, rounding to nearest.
    pub fn rescale(self, ticks: i64, to: TimeBase) -> i64 {
        if self == to || !self.is_valid() || !to.is_valid() {
            return ticks;
        }
        let num = ticks as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        let half = den / 2;
        let rounded = if num >= 0 { (num + half) / den } else { (num - half) / den };
        rounded as i64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::MPEG
    }
}

/// Frame rate as a rational (`num` frames every `den` seconds).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRate {
    pub num: i32,
    pub den: i32,
}

impl FrameRate {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn as_f64(self) -> f64 {
        if self.is_valid() {
            self.num as f64 / self.den as f64
        } else {
            0.0
        }
    }

    /// Duration of one frame expressed in `tb` ticks, or `None` when either side is invalid.
    pub fn frame_duration(self, tb: TimeBase) -> Option<i64> {
        if !self.is_valid() || !tb.is_valid() {
            return None;
        }
        let ticks = (tb.den as i64 * self.den as i64) / (tb.num as i64 * self.num as i64);
        (ticks > 0).then_some(ticks)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Data,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    H264,
    Hevc,
    Mjpeg,
    Aac,
    Opus,
    PcmAlaw,
    PcmMulaw,
    None,
}

impl CodecId {
    pub fn kind(self) -> Option<MediaKind> {
        match self {
            CodecId::H264 | CodecId::Hevc | CodecId::Mjpeg => Some(MediaKind::Video),
            CodecId::Aac | CodecId::Opus | CodecId::PcmAlaw | CodecId::PcmMulaw => {
                Some(MediaKind::Audio)
            }
            CodecId::None => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::H264 => "h264",
            CodecId::Hevc => "hevc",
            CodecId::Mjpeg => "mjpeg",
            CodecId::Aac => "aac",
            CodecId::Opus => "opus",
            CodecId::PcmAlaw => "pcm_alaw",
            CodecId::PcmMulaw => "pcm_mulaw",
            CodecId::None => "none",
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Audio sample format as reported by the demuxer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
    S32,
    F32,
    F32Planar,
    S16Planar,
}

/// Codec parameters of one elementary stream inside an input container.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub codec: CodecId,
    pub time_base: TimeBase,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<FrameRate>,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: Option<SampleFormat>,
    pub frame_size: u32,
    /// Codec private data: `avcC` record or Annex-B SPS/PPS for H.264,
    /// AudioSpecificConfig for AAC.
    pub extradata: Vec<u8>,
}

impl StreamInfo {
    pub fn video(index: usize, codec: CodecId, width: u32, height: u32) -> Self {
        Self {
            index,
            kind: MediaKind::Video,
            codec,
            time_base: TimeBase::MPEG,
            width,
            height,
            frame_rate: None,
            sample_rate: 0,
            channels: 0,
            sample_format: None,
            frame_size: 0,
            extradata: Vec::new(),
        }
    }

    pub fn audio(index: usize, codec: CodecId, sample_rate: u32, channels: u16) -> Self {
        Self {
            index,
            kind: MediaKind::Audio,
            codec,
            time_base: TimeBase::new(1, sample_rate.max(1) as i32),
            width: 0,
            height: 0,
            frame_rate: None,
            sample_rate,
            channels,
            sample_format: None,
            frame_size: 0,
            extradata: Vec::new(),
        }
    }

    pub fn with_time_base(mut self, time_base: TimeBase) -> Self {
        self.time_base = time_base;
        self
    }

    pub fn with_frame_rate(mut self, rate: FrameRate) -> Self {
        self.frame_rate = Some(rate);
        self
    }

    pub fn with_extradata(mut self, extradata: Vec<u8>) -> Self {
        self.extradata = extradata;
        self
    }
}

/// Index of the first video stream, the one readers dispatch.
pub fn find_video_stream(streams: &[StreamInfo]) -> Option<usize> {
    streams
        .iter()
        .find(|s| s.kind == MediaKind::Video)
        .map(|s| s.index)
}

/// Compressed access unit.
///
/// The payload sits behind an `Arc`, so `clone()` takes a new reference rather
/// than copying bytes. A pre-buffer slot owns exactly one such reference.
#[derive(Clone)]
pub struct Packet {
    data: Arc<[u8]>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub stream_index: usize,
    pub is_keyframe: bool,
}

impl Packet {
    pub fn new(data: impl Into<Arc<[u8]>>, stream_index: usize) -> Self {
        Self {
            data: data.into(),
            pts: None,
            dts: None,
            duration: 0,
            stream_index,
            is_keyframe: false,
        }
    }

    pub fn with_timestamps(mut self, pts: Option<i64>, dts: Option<i64>) -> Self {
        self.pts = pts;
        self.dts = dts;
        self
    }

    pub fn keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Same timing and flags over a new payload (bitstream filter output).
    pub fn with_payload(&self, data: Vec<u8>) -> Packet {
        Packet {
            data: data.into(),
            pts: self.pts,
            dts: self.dts,
            duration: self.duration,
            stream_index: self.stream_index,
            is_keyframe: self.is_keyframe,
        }
    }

    /// Number of live references to this packet's payload.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.data.len())
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("stream_index", &self.stream_index)
            .field("is_keyframe", &self.is_keyframe)
            .finish()
    }
}
