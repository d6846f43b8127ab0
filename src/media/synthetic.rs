//! Synthetic `stub://` source and its matching decoder.
//!
//! Packets look like a camera's H.264 elementary stream: Annex-B access units
//! with SPS/PPS in front of every IDR, 1/90000 timestamps and an optional audio
//! track. Slice payloads carry a small ASCII header (`NVRS f=<n>;m=<0|1>;`)
//! that the synthetic decoder turns into a picture, so motion windows scripted
//! in the URL show up in decoded frames.
//!
//! Query parameters:
//! `fps`, `gop`, `width`, `height`, `audio` (aac|opus|alaw|ulaw),
//! `missing_ts` (every Nth video packet loses both timestamps), `eof_after`
//! (video packets before EOF), `speed` (pacing multiplier, 0 = unpaced),
//! `motion_at` / `motion_for` (seconds), `fail_open`.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use url::Url;

use super::decode::{FrameDecoder, PixelFormat, VideoFrame};
use super::h264::{self, nal_type};
use super::source::{Demuxer, Interrupter, ReadEvent};
use super::{CodecId, FrameRate, Packet, SampleFormat, StreamInfo, TimeBase};
use crate::error::NvrError;

const MAGIC: &[u8] = b"NVRS";
const PACE_SLICE: Duration = Duration::from_millis(5);

#[derive(Clone, Debug)]
pub(crate) struct SyntheticConfig {
    pub name: String,
    pub fps: u32,
    pub gop: u32,
    pub width: u32,
    pub height: u32,
    pub audio: Option<CodecId>,
    pub missing_ts: u32,
    pub eof_after: Option<u64>,
    pub speed: f64,
    pub motion_at: Option<f64>,
    pub motion_for: f64,
    pub fail_open: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub".to_string(),
            fps: 10,
            gop: 10,
            width: 640,
            height: 480,
            audio: None,
            missing_ts: 0,
            eof_after: None,
            speed: 1.0,
            motion_at: None,
            motion_for: 2.0,
            fail_open: false,
        }
    }
}

impl SyntheticConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| anyhow!("invalid stub url '{}': {}", raw, e))?;
        if url.scheme() != "stub" {
            return Err(anyhow!("not a stub url: {}", raw));
        }
        let mut cfg = SyntheticConfig {
            name: url.host_str().unwrap_or("stub").to_string(),
            ..Default::default()
        };
        let mut gop = None;
        for (key, value) in url.query_pairs() {
            let value = value.as_ref();
            match key.as_ref() {
                "fps" => cfg.fps = parse_num(&key, value)?,
                "gop" => gop = Some(parse_num::<u32>(&key, value)?),
                "width" => cfg.width = parse_num(&key, value)?,
                "height" => cfg.height = parse_num(&key, value)?,
                "audio" => {
                    cfg.audio = match value {
                        "aac" => Some(CodecId::Aac),
                        "opus" => Some(CodecId::Opus),
                        "alaw" => Some(CodecId::PcmAlaw),
                        "ulaw" => Some(CodecId::PcmMulaw),
                        "none" | "" => None,
                        other => return Err(anyhow!("unsupported stub audio codec '{}'", other)),
                    }
                }
                "missing_ts" => cfg.missing_ts = parse_num(&key, value)?,
                "eof_after" => cfg.eof_after = Some(parse_num(&key, value)?),
                "speed" => cfg.speed = parse_num(&key, value)?,
                "motion_at" => cfg.motion_at = Some(parse_num(&key, value)?),
                "motion_for" => cfg.motion_for = parse_num(&key, value)?,
                "fail_open" => cfg.fail_open = value == "1" || value == "true",
                _ => log::debug!("source: ignoring stub parameter '{}'", key),
            }
        }
        if cfg.fps == 0 || cfg.width < 16 || cfg.height < 16 {
            return Err(anyhow!("stub url '{}' needs fps>0 and at least 16x16", raw));
        }
        cfg.gop = gop.unwrap_or(cfg.fps).max(1);
        if cfg.speed < 0.0 {
            cfg.speed = 0.0;
        }
        Ok(cfg)
    }

    fn frame_ticks(&self) -> i64 {
        (90_000 / self.fps as i64).max(1)
    }

    fn motion_active(&self, frame_no: u64) -> bool {
        let Some(start) = self.motion_at else {
            return false;
        };
        let t = frame_no as f64 / self.fps as f64;
        t >= start && t < start + self.motion_for
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub parameter '{}' has invalid value '{}'", key, value))
}

// ----------------------------------------------------------------------------
// Demuxer
// ----------------------------------------------------------------------------

pub(crate) struct SyntheticDemuxer {
    url: String,
    config: SyntheticConfig,
    streams: Vec<StreamInfo>,
    interrupter: Interrupter,
    sps: Vec<u8>,
    pps: Vec<u8>,
    frame_no: u64,
    audio_samples: u64,
    pending: VecDeque<Packet>,
    started: Instant,
}

impl SyntheticDemuxer {
    pub(crate) fn open(url: &str, interrupter: Interrupter) -> Result<Self> {
        let config = SyntheticConfig::parse(url)?;
        if config.fail_open {
            return Err(NvrError::transport(format!("connection refused: {}", url)));
        }
        let sps = h264::build_baseline_sps(config.width, config.height);
        let pps = h264::build_baseline_pps();
        let avc = h264::AvcConfig::from_parameter_sets(sps.clone(), pps.clone());

        let mut streams = vec![StreamInfo::video(0, CodecId::H264, config.width, config.height)
            .with_time_base(TimeBase::MPEG)
            .with_frame_rate(FrameRate::new(config.fps as i32, 1))
            .with_extradata(avc.to_record())];
        if let Some(codec) = config.audio {
            streams.push(audio_stream_info(codec));
        }

        Ok(Self {
            url: url.to_string(),
            config,
            streams,
            interrupter,
            sps,
            pps,
            frame_no: 0,
            audio_samples: 0,
            pending: VecDeque::new(),
            started: Instant::now(),
        })
    }

    fn pace(&self) -> Result<()> {
        if self.config.speed <= 0.0 {
            return Ok(());
        }
        let due = Duration::from_secs_f64(
            self.frame_no as f64 / (self.config.fps as f64 * self.config.speed),
        );
        loop {
            if self.interrupter.is_tripped() {
                return Err(NvrError::transport("read interrupted"));
            }
            let elapsed = self.started.elapsed();
            if elapsed >= due {
                return Ok(());
            }
            thread::sleep((due - elapsed).min(PACE_SLICE));
        }
    }

    fn next_video(&mut self) -> Packet {
        let n = self.frame_no;
        let keyframe = n % self.config.gop as u64 == 0;
        let motion = self.config.motion_active(n);

        let mut payload = Vec::new();
        payload.push(if keyframe { 0x65 } else { 0x41 });
        payload.extend_from_slice(MAGIC);
        payload.extend_from_slice(format!(" f={};m={};", n, motion as u8).as_bytes());
        let area = (self.config.width * self.config.height) as usize;
        let filler = if keyframe { area / 64 } else { area / 512 };
        payload.extend((0..filler).map(|i| 0x80 + (i % 0x7F) as u8));

        let mut au: Vec<&[u8]> = Vec::with_capacity(3);
        if keyframe {
            au.push(&self.sps);
            au.push(&self.pps);
        }
        au.push(&payload);
        let data = h264::nals_to_annex_b(au);

        let ticks = self.config.frame_ticks();
        let ts = n as i64 * ticks;
        let missing = self.config.missing_ts > 0 && (n + 1) % self.config.missing_ts as u64 == 0;
        let (pts, dts) = if missing { (None, None) } else { (Some(ts), Some(ts)) };

        self.frame_no += 1;
        Packet::new(data, 0)
            .with_timestamps(pts, dts)
            .with_duration(ticks)
            .keyframe(keyframe)
    }

    fn queue_audio(&mut self) {
        let Some(info) = self.streams.get(1) else {
            return;
        };
        let rate = info.sample_rate as u64;
        let frame = info.frame_size as u64;
        let (codec, index) = (info.codec, info.index);
        let video_end_samples = self.frame_no * rate / self.config.fps as u64;
        while self.audio_samples < video_end_samples {
            let size = match codec {
                CodecId::PcmAlaw | CodecId::PcmMulaw => frame as usize,
                _ => 96,
            };
            let data: Vec<u8> = (0..size).map(|i| 0x21 + (i % 0x5E) as u8).collect();
            let pts = self.audio_samples as i64;
            self.pending.push_back(
                Packet::new(data, index)
                    .with_timestamps(Some(pts), Some(pts))
                    .with_duration(frame as i64)
                    .keyframe(true),
            );
            self.audio_samples += frame;
        }
    }
}

fn audio_stream_info(codec: CodecId) -> StreamInfo {
    let (rate, frame_size, extradata) = match codec {
        CodecId::Aac => (48_000, 1024, vec![0x11, 0x88]),
        CodecId::Opus => (48_000, 960, Vec::new()),
        _ => (8_000, 160, Vec::new()),
    };
    let mut info = StreamInfo::audio(1, codec, rate, 1).with_extradata(extradata);
    info.sample_format = Some(SampleFormat::S16);
    info.frame_size = frame_size;
    info
}

impl Demuxer for SyntheticDemuxer {
    fn url(&self) -> &str {
        &self.url
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read(&mut self) -> Result<ReadEvent> {
        if let Some(pkt) = self.pending.pop_front() {
            return Ok(ReadEvent::Packet(pkt));
        }
        if self.interrupter.is_tripped() {
            return Err(NvrError::transport("read interrupted"));
        }
        if let Some(limit) = self.config.eof_after {
            if self.frame_no >= limit {
                return Ok(ReadEvent::Eof);
            }
        }
        self.pace()?;
        let video = self.next_video();
        self.queue_audio();
        Ok(ReadEvent::Packet(video))
    }
}

// ----------------------------------------------------------------------------
// Decoder
// ----------------------------------------------------------------------------

/// Renders the picture a synthetic slice describes: a static gradient, plus a
/// bright block that slides across the frame while motion is scripted.
pub(crate) struct SyntheticDecoder {
    width: u32,
    height: u32,
}

impl SyntheticDecoder {
    pub(crate) fn new(info: &StreamInfo) -> Self {
        Self {
            width: info.width.max(16),
            height: info.height.max(16),
        }
    }

    fn render(&self, frame_no: u64, motion: bool) -> VideoFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut luma = vec![0u8; w * h];
        for y in 0..h {
            for x in 0..w {
                luma[y * w + x] = 40 + (((x / 16) + (y / 16)) % 8) as u8 * 12;
            }
        }
        if motion {
            let bw = (w / 4).max(4);
            let bh = (h / 4).max(4);
            let travel = (w - bw).max(1);
            let x0 = (frame_no as usize * 8) % travel;
            let y0 = (h - bh) / 2;
            for y in y0..y0 + bh {
                luma[y * w + x0..y * w + x0 + bw].fill(235);
            }
        }
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        VideoFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Yuv420p,
            planes: vec![luma, vec![128; cw * ch], vec![128; cw * ch]],
            strides: vec![w, cw, cw],
            pts: None,
        }
    }
}

fn parse_slice_header(nal: &[u8]) -> Option<(u64, bool)> {
    let body = nal.get(1..)?;
    let rest = body.strip_prefix(MAGIC)?;
    let end = rest.iter().position(|b| *b >= 0x80).unwrap_or(rest.len());
    let text = std::str::from_utf8(&rest[..end]).ok()?;
    let mut frame_no = None;
    let mut motion = false;
    for field in text.trim().split(';') {
        if let Some(v) = field.strip_prefix("f=") {
            frame_no = v.parse().ok();
        } else if let Some(v) = field.strip_prefix("m=") {
            motion = v == "1";
        }
    }
    Some((frame_no?, motion))
}

impl FrameDecoder for SyntheticDecoder {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn decode(&mut self, packet: &Packet) -> Result<Option<VideoFrame>> {
        let data = packet.data();
        let nals = if h264::has_start_code(data) {
            h264::split_annex_b(data)
        } else {
            h264::split_avcc(data, 4)?
        };
        let slice = nals.into_iter().find(|nal| {
            matches!(
                h264::nal_unit_type(nal),
                Some(nal_type::IDR_SLICE) | Some(nal_type::NON_IDR_SLICE)
            )
        });
        let Some(slice) = slice else {
            return Ok(None);
        };
        let (frame_no, motion) = parse_slice_header(slice)
            .ok_or_else(|| anyhow!("slice is not a synthetic picture"))?;
        let mut frame = self.render(frame_no, motion);
        frame.pts = packet.pts;
        Ok(Some(frame))
    }

    fn intra_only(&self) -> bool {
        true
    }
}
