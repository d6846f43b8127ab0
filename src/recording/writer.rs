//! MP4 writer for one recording file.
//!
//! Nothing touches the disk until the first video keyframe: earlier video
//! packets are dropped. An audio packet that arrives first initializes the
//! file with a placeholder 640x480 H.264 track so video stays track 0.
//!
//! Timestamps are rebased to the first packet of each track. Output DTS is
//! strictly increasing per track, and PTS never runs more than one second of
//! ticks ahead of DTS.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::error::NvrError;
use crate::media::h264::{self, AnnexBFilter, AvcConfig};
use crate::media::mp4::{Mp4Metadata, Mp4Muxer, TrackConfig};
use crate::media::{CodecId, MediaKind, Packet, StreamInfo, TimeBase};

use super::store::{Recording, RecordingStore};

pub const PLACEHOLDER_WIDTH: u32 = 640;
pub const PLACEHOLDER_HEIGHT: u32 = 480;
const PLACEHOLDER_TIME_BASE: TimeBase = TimeBase::new(1, 30);
pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const AAC_FRAME_SIZE: u32 = 1024;
pub const OPUS_FRAME_SIZE: u32 = 960;
/// Files at or below this size are not reported to the store.
pub const MIN_RECORDING_BYTES: u64 = 1024;

/// Per-track timestamp rebasing.
#[derive(Clone, Debug)]
struct TrackTiming {
    time_base: TimeBase,
    first_dts: Option<i64>,
    first_pts: i64,
    last_dts: i64,
}

impl TrackTiming {
    fn new(time_base: TimeBase) -> Self {
        Self {
            time_base,
            first_dts: None,
            first_pts: 0,
            last_dts: 0,
        }
    }

    /// `(dts, pts)` for the muxer, in this track's time base.
    fn normalize(&mut self, pts: Option<i64>, dts: Option<i64>) -> (i64, i64) {
        let Some(first_dts) = self.first_dts else {
            let first_dts = dts.or(pts).unwrap_or(0);
            self.first_dts = Some(first_dts);
            self.first_pts = pts.or(dts).unwrap_or(0);
            self.last_dts = 0;
            let pts = pts.map(|p| (p - self.first_pts).max(0)).unwrap_or(0);
            return (0, pts.min(self.slack()));
        };

        let mut out_dts = match dts.or(pts) {
            Some(raw) => raw - first_dts,
            None => self.last_dts + 1,
        };
        if out_dts <= self.last_dts {
            log::debug!(
                "mp4: dts {} not after {}; using {}",
                out_dts,
                self.last_dts,
                self.last_dts + 1
            );
            out_dts = self.last_dts + 1;
        }
        let mut out_pts = pts.map(|p| (p - self.first_pts).max(0)).unwrap_or(out_dts);
        let ceiling = out_dts + self.slack();
        if out_pts > ceiling {
            log::debug!("mp4: pts {} more than 1s past dts {}; clamped", out_pts, out_dts);
            out_pts = ceiling;
        }
        self.last_dts = out_dts;
        (out_dts, out_pts)
    }

    /// One nominal second in this time base.
    fn slack(&self) -> i64 {
        self.time_base.ticks_per_second().max(1)
    }

    fn seconds(&self) -> f64 {
        self.time_base.to_seconds(self.last_dts)
    }
}

/// Time base the muxer track runs in: `1/den` as given, or 90 kHz when the
/// input time base has a non-unit numerator.
fn track_time_base(tb: TimeBase) -> TimeBase {
    if tb.is_valid() && tb.num == 1 {
        tb
    } else {
        TimeBase::MPEG
    }
}

struct AudioTrack {
    track: Option<usize>,
    input_time_base: TimeBase,
    timing: TrackTiming,
    frame_size: u32,
    codec: CodecId,
    packets: u64,
}

/// What a closed writer produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mp4CloseSummary {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub video_packets: u64,
    pub audio_packets: u64,
    /// Row written to the store, when one was.
    pub recording_id: Option<i64>,
}

pub struct Mp4Writer {
    path: PathBuf,
    stream: String,
    store: Option<Arc<dyn RecordingStore>>,
    muxer: Option<Mp4Muxer>,
    video_track: Option<usize>,
    video_input_time_base: TimeBase,
    video: TrackTiming,
    video_started: bool,
    placeholder_video: bool,
    filter: Option<AnnexBFilter>,
    codec: CodecId,
    width: u32,
    height: u32,
    fps: u32,
    audio: Option<AudioTrack>,
    started_at: i64,
    video_packets: u64,
    dropped: u64,
    failed: Option<String>,
    closed: bool,
}

impl Mp4Writer {
    /// A writer for `path`. The file is created on the first keyframe.
    pub fn new(path: &Path, stream: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            stream: stream.to_string(),
            store: None,
            muxer: None,
            video_track: None,
            video_input_time_base: TimeBase::MPEG,
            video: TrackTiming::new(TimeBase::MPEG),
            video_started: false,
            placeholder_video: false,
            filter: None,
            codec: CodecId::None,
            width: 0,
            height: 0,
            fps: 0,
            audio: None,
            started_at: chrono::Utc::now().timestamp(),
            video_packets: 0,
            dropped: 0,
            failed: None,
            closed: false,
        }
    }

    /// Report the finished file to `store` on close.
    pub fn with_store(mut self, store: Arc<dyn RecordingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn is_initialized(&self) -> bool {
        self.muxer.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.as_ref().is_some_and(|a| a.track.is_some())
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    pub fn video_packets(&self) -> u64 {
        self.video_packets
    }

    /// Packets discarded before initialization.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped
    }

    /// Seconds of video written so far.
    pub fn duration_seconds(&self) -> f64 {
        self.video.seconds()
    }

    /// Mux one packet of either kind. Returns whether it was written.
    pub fn write_packet(&mut self, packet: &Packet, info: &StreamInfo) -> Result<bool> {
        if self.closed {
            return Err(NvrError::mux(format!("mp4 {}: writer already closed", self.stream)));
        }
        if let Some(reason) = &self.failed {
            return Err(NvrError::mux(format!("mp4 {}: writer failed earlier: {}", self.stream, reason)));
        }
        let outcome = match info.kind {
            MediaKind::Video => self.write_video(packet, info),
            MediaKind::Audio => self.write_audio(packet, info),
            MediaKind::Data => Ok(false),
        };
        if let Err(err) = &outcome {
            if matches!(NvrError::classify(err), Some(NvrError::Mux(_))) {
                log::error!("mp4 {}: {:#}", self.stream, err);
                self.failed = Some(format!("{:#}", err));
            }
        }
        outcome
    }

    fn write_video(&mut self, packet: &Packet, info: &StreamInfo) -> Result<bool> {
        if self.muxer.is_none() {
            if !packet.is_keyframe {
                self.dropped += 1;
                return Ok(false);
            }
            self.init_with_video(packet, info)?;
        } else if self.placeholder_video && !self.video_started {
            if !packet.is_keyframe {
                self.dropped += 1;
                return Ok(false);
            }
            self.video_input_time_base = info.time_base;
            self.filter = (info.codec == CodecId::H264).then(|| AnnexBFilter::new(&info.extradata));
        }
        self.video_started = true;

        let track = self
            .video_track
            .ok_or_else(|| NvrError::mux("video track missing after init"))?;
        let filtered = match &self.filter {
            Some(filter) => filter.filter(packet),
            None => packet.clone(),
        };
        let target = self.video.time_base;
        let rescale = |ts: Option<i64>| ts.map(|t| self.video_input_time_base.rescale(t, target));
        let (pts, dts) = (rescale(filtered.pts), rescale(filtered.dts));
        let (dts, pts) = self.video.normalize(pts, dts);
        self.muxer_mut()?
            .write_sample(track, filtered.data(), dts, pts, packet.is_keyframe)?;
        self.video_packets += 1;
        Ok(true)
    }

    fn write_audio(&mut self, packet: &Packet, info: &StreamInfo) -> Result<bool> {
        if self.muxer.is_none() {
            self.init_placeholder()?;
        }
        if self.audio.is_none() {
            self.add_audio_track(info)?;
        }
        let Some(audio) = self.audio.as_mut() else {
            return Ok(false);
        };
        let Some(track) = audio.track else {
            return Ok(false);
        };
        let target = audio.timing.time_base;
        let input = audio.input_time_base;
        let rescale = |ts: Option<i64>| ts.map(|t| input.rescale(t, target));
        let (dts, pts) = audio.timing.normalize(rescale(packet.pts), rescale(packet.dts));
        audio.packets += 1;
        let muxer = self
            .muxer
            .as_mut()
            .ok_or_else(|| NvrError::mux("audio write before init"))?;
        muxer.write_sample(track, packet.data(), dts, pts, true)?;
        Ok(true)
    }

    fn muxer_mut(&mut self) -> Result<&mut Mp4Muxer> {
        self.muxer
            .as_mut()
            .ok_or_else(|| NvrError::mux(format!("mp4 {}: not initialized", self.stream)))
    }

    fn metadata(&self) -> Mp4Metadata {
        Mp4Metadata {
            title: Some(self.stream.clone()),
            encoder: Some(concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }

    fn create_muxer(&self) -> Result<Mp4Muxer> {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                log::warn!("mp4 {}: cannot create {}: {}", self.stream, parent.display(), err);
            }
        }
        Mp4Muxer::create(&self.path, self.metadata())
    }

    fn init_with_video(&mut self, keyframe: &Packet, info: &StreamInfo) -> Result<()> {
        let (width, height) = match (info.width, info.height) {
            (0, _) | (_, 0) => (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT),
            dims => dims,
        };
        let time_base = track_time_base(info.time_base);
        let filter = (info.codec == CodecId::H264).then(|| AnnexBFilter::new(&info.extradata));
        let extradata = match (&filter, info.codec) {
            (Some(filter), CodecId::H264) => {
                let framed = filter.filter(keyframe);
                if info.extradata.is_empty() {
                    h264::parameter_sets_in(framed.data())
                        .map(|cfg| cfg.to_record())
                        .ok_or_else(|| NvrError::mux("first keyframe carries no SPS/PPS"))?
                } else {
                    info.extradata.clone()
                }
            }
            _ => info.extradata.clone(),
        };
        let mut track = TrackConfig::video(info.codec, width, height, time_base.den as u32)
            .with_extradata(extradata);
        if let Some(duration) = info.frame_rate.and_then(|r| r.frame_duration(time_base)) {
            track = track.with_default_duration(duration as u32);
        }

        let mut muxer = self.create_muxer()?;
        let index = muxer.add_track(track)?;
        self.muxer = Some(muxer);
        self.video_track = Some(index);
        self.video_input_time_base = info.time_base;
        self.video = TrackTiming::new(time_base);
        self.filter = filter;
        self.codec = info.codec;
        self.width = width;
        self.height = height;
        self.fps = info.frame_rate.map(|r| r.as_f64().round() as u32).unwrap_or(0);
        log::info!(
            "mp4 {}: initialized {} {}x{} -> {}",
            self.stream,
            info.codec,
            width,
            height,
            self.path.display()
        );
        Ok(())
    }

    fn init_placeholder(&mut self) -> Result<()> {
        let sps = h264::build_baseline_sps(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT);
        let record = AvcConfig::from_parameter_sets(sps, h264::build_baseline_pps()).to_record();
        let track = TrackConfig::video(
            CodecId::H264,
            PLACEHOLDER_WIDTH,
            PLACEHOLDER_HEIGHT,
            PLACEHOLDER_TIME_BASE.den as u32,
        )
        .with_extradata(record);
        let mut muxer = self.create_muxer()?;
        let index = muxer.add_track(track)?;
        self.muxer = Some(muxer);
        self.video_track = Some(index);
        self.video = TrackTiming::new(PLACEHOLDER_TIME_BASE);
        self.placeholder_video = true;
        self.codec = CodecId::H264;
        self.width = PLACEHOLDER_WIDTH;
        self.height = PLACEHOLDER_HEIGHT;
        log::info!(
            "mp4 {}: audio arrived first; placeholder video track added",
            self.stream
        );
        Ok(())
    }

    /// Add the audio track. A second call is a no-op.
    pub fn add_audio_track(&mut self, info: &StreamInfo) -> Result<()> {
        if self.audio.is_some() {
            return Ok(());
        }
        if info.kind != MediaKind::Audio || info.codec == CodecId::None {
            return Err(NvrError::mux(format!(
                "mp4 {}: stream #{} is not an audio stream ({})",
                self.stream, info.index, info.codec
            )));
        }
        let channels = if info.channels == 0 { 1 } else { info.channels };
        let sample_rate = if info.sample_rate == 0 {
            DEFAULT_AUDIO_SAMPLE_RATE
        } else {
            info.sample_rate
        };
        let frame_size = match (info.frame_size, info.codec) {
            (0, CodecId::Opus) => OPUS_FRAME_SIZE,
            (0, _) => AAC_FRAME_SIZE,
            (size, _) => size,
        };
        let input_time_base = if info.time_base.is_valid() {
            info.time_base
        } else {
            TimeBase::new(1, sample_rate as i32)
        };

        self.audio = Some(AudioTrack {
            track: None,
            input_time_base,
            timing: TrackTiming::new(TimeBase::new(1, sample_rate as i32)),
            frame_size,
            codec: info.codec,
            packets: 0,
        });

        let config = TrackConfig::audio(info.codec, sample_rate, channels, frame_size)
            .with_extradata(info.extradata.clone());
        let index = self.muxer_mut()?.add_track(config)?;
        if let Some(audio) = self.audio.as_mut() {
            audio.track = Some(index);
            log::info!(
                "mp4 {}: audio track {} {} Hz x{} (frame size {})",
                self.stream,
                audio.codec,
                sample_rate,
                channels,
                audio.frame_size
            );
        }
        Ok(())
    }

    /// Write the trailer and report the file. Idempotent.
    pub fn close(&mut self) -> Result<Mp4CloseSummary> {
        let mut summary = Mp4CloseSummary {
            path: self.path.clone(),
            duration_seconds: self.duration_seconds(),
            video_packets: self.video_packets,
            audio_packets: self.audio.as_ref().map(|a| a.packets).unwrap_or(0),
            ..Default::default()
        };
        if self.closed {
            return Ok(summary);
        }
        self.closed = true;
        let Some(muxer) = self.muxer.take() else {
            log::info!("mp4 {}: closed before the first keyframe; no file", self.stream);
            return Ok(summary);
        };
        summary.size_bytes = muxer.finish()?;
        if summary.size_bytes <= MIN_RECORDING_BYTES {
            log::warn!(
                "mp4 {}: {} is only {} bytes; metadata not updated",
                self.stream,
                self.path.display(),
                summary.size_bytes
            );
            return Ok(summary);
        }
        summary.recording_id = self.update_metadata(&summary)?;
        log::info!(
            "mp4 {}: closed {} ({} bytes, {:.1}s)",
            self.stream,
            self.path.display(),
            summary.size_bytes,
            summary.duration_seconds
        );
        Ok(summary)
    }

    fn update_metadata(&self, summary: &Mp4CloseSummary) -> Result<Option<i64>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let now = chrono::Utc::now().timestamp();
        let path = self.path.to_string_lossy().into_owned();
        if let Some(mut row) = store.active_recording(&self.stream)? {
            row.file_path = path;
            row.end_time = Some(now);
            row.size_bytes = summary.size_bytes;
            row.width = self.width;
            row.height = self.height;
            row.fps = self.fps;
            row.codec = self.codec.name().to_string();
            row.is_complete = true;
            store.update_recording(&row)?;
            return Ok(Some(row.id));
        }
        let row = Recording {
            id: 0,
            stream_name: self.stream.clone(),
            file_path: path,
            start_time: self.started_at,
            end_time: Some(self.started_at + summary.duration_seconds.round() as i64),
            size_bytes: summary.size_bytes,
            width: self.width,
            height: self.height,
            fps: self.fps,
            codec: self.codec.name().to_string(),
            is_complete: true,
        };
        Ok(Some(store.add_recording(&row)?))
    }
}

impl Drop for Mp4Writer {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                log::error!("mp4 {}: close on drop failed: {:#}", self.stream, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mp4::inspect::read_summary;
    use crate::media::FrameRate;
    use crate::recording::store::MemoryStore;
    use tempfile::tempdir;

    const START: [u8; 4] = [0, 0, 0, 1];

    fn video_info() -> StreamInfo {
        StreamInfo::video(0, CodecId::H264, 320, 240).with_frame_rate(FrameRate::new(10, 1))
    }

    fn keyframe(pts: Option<i64>, dts: Option<i64>) -> Packet {
        let mut data = Vec::new();
        data.extend_from_slice(&START);
        data.extend_from_slice(&h264::build_baseline_sps(320, 240));
        data.extend_from_slice(&START);
        data.extend_from_slice(&h264::build_baseline_pps());
        data.extend_from_slice(&START);
        data.push(0x65);
        data.extend(std::iter::repeat(0xAB).take(1500));
        Packet::new(data, 0).with_timestamps(pts, dts).keyframe(true)
    }

    fn delta(pts: Option<i64>, dts: Option<i64>) -> Packet {
        let mut data = START.to_vec();
        data.push(0x41);
        data.extend(std::iter::repeat(0x11).take(400));
        Packet::new(data, 0).with_timestamps(pts, dts)
    }

    #[test]
    fn non_keyframes_before_init_are_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cam1/rec.mp4");
        let mut writer = Mp4Writer::new(&path, "cam1");
        let info = video_info();
        for i in 0..3 {
            assert!(!writer.write_packet(&delta(Some(i * 9000), Some(i * 9000)), &info).unwrap());
            assert!(!path.exists());
        }
        assert!(writer.write_packet(&keyframe(Some(27_000), Some(27_000)), &info).unwrap());
        assert!(writer.is_initialized());
        for i in 4..20 {
            writer.write_packet(&delta(Some(i * 9000), Some(i * 9000)), &info).unwrap();
        }
        let summary = writer.close().unwrap();
        assert_eq!(writer.dropped_packets(), 3);
        assert!(summary.size_bytes > MIN_RECORDING_BYTES);
        let mp4 = read_summary(&path).unwrap();
        assert_eq!(mp4.top_level[..2], ["ftyp".to_string(), "moov".to_string()]);
        assert_eq!(mp4.tracks[0].dts.len(), 17);
        assert_eq!(mp4.title.as_deref(), Some("cam1"));
    }

    #[test]
    fn timestamps_rebased_and_strictly_increasing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ts.mp4");
        let mut writer = Mp4Writer::new(&path, "cam1");
        let info = video_info();
        writer.write_packet(&keyframe(Some(900_000), Some(900_000)), &info).unwrap();
        let mut ts = 900_000;
        for i in 1..60 {
            ts += 9000;
            let packet = match i % 3 {
                0 => delta(None, None),
                1 if i == 31 => delta(Some(ts - 50_000), Some(ts - 50_000)),
                _ => delta(Some(ts + 400_000), Some(ts)),
            };
            writer.write_packet(&packet, &info).unwrap();
        }
        writer.close().unwrap();
        let track = &read_summary(&path).unwrap().tracks[0];
        assert_eq!(track.dts[0], 0);
        for pair in track.dts.windows(2) {
            assert!(pair[1] > pair[0], "{:?}", pair);
        }
        for (pts, dts) in track.pts.iter().zip(&track.dts) {
            assert!(*pts >= 0);
            assert!(*pts <= dts + 90_000);
        }
    }

    #[test]
    fn audio_first_gets_placeholder_video() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audio.mp4");
        let store = Arc::new(MemoryStore::new());
        let mut writer = Mp4Writer::new(&path, "cam1").with_store(store.clone());
        let mut audio = StreamInfo::audio(1, CodecId::Aac, 0, 0);
        audio.time_base = TimeBase::new(0, 0);
        for i in 0..40 {
            let packet = Packet::new(vec![0x21u8; 200], 1).with_timestamps(Some(i * 1024), Some(i * 1024));
            assert!(writer.write_packet(&packet, &audio).unwrap());
        }
        assert!(writer.has_audio());
        writer.add_audio_track(&audio).unwrap();
        let summary = writer.close().unwrap();
        let mp4 = read_summary(&path).unwrap();
        assert_eq!(mp4.tracks.len(), 2);
        assert_eq!((mp4.tracks[0].width, mp4.tracks[0].height), (640, 480));
        assert_eq!(mp4.tracks[1].timescale, DEFAULT_AUDIO_SAMPLE_RATE);
        assert_eq!(summary.audio_packets, 40);
        assert_eq!(store.list_recordings(Some("cam1")).unwrap().len(), 1);
    }

    #[test]
    fn close_updates_the_active_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("row.mp4");
        let store = Arc::new(MemoryStore::new());
        let id = store
            .add_recording(&Recording {
                stream_name: "cam1".to_string(),
                file_path: path.to_string_lossy().into_owned(),
                start_time: 1,
                ..Default::default()
            })
            .unwrap();
        let mut writer = Mp4Writer::new(&path, "cam1").with_store(store.clone());
        let info = video_info();
        writer.write_packet(&keyframe(Some(0), Some(0)), &info).unwrap();
        for i in 1..10 {
            writer.write_packet(&delta(Some(i * 9000), Some(i * 9000)), &info).unwrap();
        }
        let summary = writer.close().unwrap();
        assert_eq!(summary.recording_id, Some(id));
        let rows = store.list_recordings(Some("cam1")).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_complete);
        assert_eq!(rows[0].codec, "h264");
        assert_eq!((rows[0].width, rows[0].height, rows[0].fps), (320, 240, 10));
        assert!(writer.close().is_ok());
    }

    #[test]
    fn empty_writer_leaves_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("none.mp4");
        let store = Arc::new(MemoryStore::new());
        let mut writer = Mp4Writer::new(&path, "cam1").with_store(store.clone());
        let summary = writer.close().unwrap();
        assert_eq!(summary.size_bytes, 0);
        assert!(!path.exists());
        assert!(store.list_recordings(None).unwrap().is_empty());
    }

    #[test]
    fn hevc_is_a_mux_error() {
        let dir = tempdir().unwrap();
        let mut writer = Mp4Writer::new(&dir.path().join("h.mp4"), "cam1");
        let info = StreamInfo::video(0, CodecId::Hevc, 320, 240);
        let err = writer.write_packet(&keyframe(Some(0), Some(0)), &info).unwrap_err();
        assert!(matches!(NvrError::classify(&err), Some(NvrError::Mux(_))));
        assert!(writer.is_failed());
    }
}
