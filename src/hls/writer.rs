//! HLS segmenter: MPEG-TS segments plus a sliding `index.m3u8`.
//!
//! A segment is cut on the first keyframe at or past `segment_duration`
//! seconds. The playlist is rewritten (temp file + rename) after every cut.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::NvrError;
use crate::media::h264::AnnexBFilter;
use crate::media::ts::TsMuxer;
use crate::media::{CodecId, MediaKind, Packet, StreamInfo, TimeBase};

pub const DEFAULT_SEGMENT_DURATION: u32 = 2;
pub const MAX_SEGMENT_DURATION: u32 = 10;
/// Segment files older than this many indices behind the newest are deleted.
pub const SEGMENTS_KEPT_ON_DISK: u64 = 15;
pub const PLAYLIST_NAME: &str = "index.m3u8";

/// Non-positive becomes the 2 s default, anything above 10 s becomes 10 s.
pub fn effective_segment_duration(configured: i32) -> u32 {
    if configured <= 0 {
        DEFAULT_SEGMENT_DURATION
    } else {
        (configured as u32).min(MAX_SEGMENT_DURATION)
    }
}

pub fn segment_name(index: u64) -> String {
    format!("index{}.ts", index)
}

#[derive(Clone, Debug, PartialEq)]
pub struct SegmentEntry {
    pub index: u64,
    /// Duration in 90 kHz ticks.
    pub ticks: i64,
}

impl SegmentEntry {
    pub fn seconds(&self) -> f64 {
        self.ticks as f64 / 90_000.0
    }
}

struct OpenSegment {
    index: u64,
    path: PathBuf,
    muxer: TsMuxer<BufWriter<File>>,
    start_ts: i64,
    last_ts: i64,
    last_delta: i64,
}

pub struct HlsWriter {
    output_dir: PathBuf,
    stream_name: String,
    segment_duration: u32,
    list_size: usize,
    playlist: VecDeque<SegmentEntry>,
    current: Option<OpenSegment>,
    next_index: u64,
    filter: Option<AnnexBFilter>,
    codec: Option<CodecId>,
    last_dts: Option<i64>,
    packets_written: u64,
    closed: bool,
}

impl HlsWriter {
    /// Prepare `output_dir` (created if missing, checked for writability).
    pub fn create(
        output_dir: &Path,
        stream_name: &str,
        segment_duration: i32,
        list_size: usize,
    ) -> Result<Self> {
        ensure_writable_dir(output_dir)?;
        let segment_duration = effective_segment_duration(segment_duration);
        log::info!(
            "hls {}: writer at {} ({}s segments)",
            stream_name,
            output_dir.display(),
            segment_duration
        );
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            stream_name: stream_name.to_string(),
            segment_duration,
            list_size: list_size.max(1),
            playlist: VecDeque::new(),
            current: None,
            next_index: 0,
            filter: None,
            codec: None,
            last_dts: None,
            packets_written: 0,
            closed: false,
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn segment_duration(&self) -> u32 {
        self.segment_duration
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(PLAYLIST_NAME)
    }

    /// Completed segments currently listed in the playlist.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentEntry> {
        self.playlist.iter()
    }

    pub fn segments_completed(&self) -> u64 {
        self.next_index - u64::from(self.current.is_some())
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mux one video packet. Packets before the first keyframe are dropped.
    pub fn write_packet(&mut self, packet: &Packet, info: &StreamInfo) -> Result<()> {
        if self.closed {
            return Err(NvrError::mux(format!("hls {}: writer is closed", self.stream_name)));
        }
        if info.kind != MediaKind::Video {
            return Ok(());
        }
        if self.current.is_none() && !packet.is_keyframe {
            return Ok(());
        }
        if self.filter.is_none() || self.codec != Some(info.codec) {
            self.filter = Some(AnnexBFilter::new(&info.extradata));
            self.codec = Some(info.codec);
        }

        let (pts, dts) = to_mpeg_clock(packet, info.time_base);
        // TS needs rising DTS as well; duplicates are nudged by one tick.
        let dts = match self.last_dts {
            Some(last) if dts <= last => last + 1,
            _ => dts,
        };
        let pts = pts.max(dts);

        let cut = match &self.current {
            Some(seg) => {
                packet.is_keyframe
                    && dts - seg.start_ts >= self.segment_duration as i64 * 90_000
            }
            None => true,
        };
        if cut {
            if self.current.is_some() {
                self.finish_segment(Some(dts))?;
            }
            self.open_segment(info.codec, dts)?;
        }

        let filtered = match &self.filter {
            Some(filter) => filter.filter(packet),
            None => packet.clone(),
        };
        let seg = self
            .current
            .as_mut()
            .ok_or_else(|| NvrError::mux("no open segment"))?;
        seg.muxer
            .write_video(filtered.data(), pts, dts, packet.is_keyframe)?;
        if dts > seg.last_ts {
            seg.last_delta = dts - seg.last_ts;
            seg.last_ts = dts;
        }
        self.last_dts = Some(dts);
        self.packets_written += 1;
        Ok(())
    }

    fn open_segment(&mut self, codec: CodecId, start_ts: i64) -> Result<()> {
        let index = self.next_index;
        let path = self.output_dir.join(segment_name(index));
        let file = File::create(&path)
            .map_err(|e| NvrError::mux(format!("create {}: {}", path.display(), e)))?;
        let mut muxer = TsMuxer::new(BufWriter::new(file), codec)?;
        muxer.write_tables()?;
        self.current = Some(OpenSegment {
            index,
            path,
            muxer,
            start_ts,
            last_ts: start_ts,
            last_delta: 0,
        });
        self.next_index += 1;
        log::debug!("hls {}: opened {}", self.stream_name, segment_name(index));
        Ok(())
    }

    /// Close the open segment. `end_ts` is the start of the next one when
    /// known; otherwise the last frame's spacing is added.
    fn finish_segment(&mut self, end_ts: Option<i64>) -> Result<()> {
        let Some(mut seg) = self.current.take() else {
            return Ok(());
        };
        seg.muxer.flush()?;
        let end = end_ts.unwrap_or(seg.last_ts + seg.last_delta);
        let ticks = (end - seg.start_ts).max(1);
        drop(seg.muxer);
        log::debug!(
            "hls {}: closed {} ({:.3}s)",
            self.stream_name,
            seg.path.display(),
            ticks as f64 / 90_000.0
        );

        self.playlist.push_back(SegmentEntry {
            index: seg.index,
            ticks,
        });
        while self.playlist.len() > self.list_size {
            self.playlist.pop_front();
        }
        self.write_playlist(false)?;

        if seg.index >= SEGMENTS_KEPT_ON_DISK {
            let stale = self
                .output_dir
                .join(segment_name(seg.index - SEGMENTS_KEPT_ON_DISK));
            if stale.exists() {
                if let Err(err) = fs::remove_file(&stale) {
                    log::debug!("hls {}: cannot delete {}: {}", self.stream_name, stale.display(), err);
                }
            }
        }
        Ok(())
    }

    /// Text of the playlist for the current window.
    pub fn render_playlist(&self, ended: bool) -> String {
        let longest = self.playlist.iter().map(|s| s.ticks).max().unwrap_or(0);
        let target = (self.segment_duration as i64).max((longest + 89_999) / 90_000);
        let sequence = self.playlist.front().map(|s| s.index).unwrap_or(0);

        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", sequence));
        for seg in &self.playlist {
            out.push_str(&format!("#EXTINF:{:.6},\n", seg.seconds()));
            out.push_str(&segment_name(seg.index));
            out.push('\n');
        }
        if ended {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }

    fn write_playlist(&self, ended: bool) -> Result<()> {
        let path = self.playlist_path();
        let tmp = self.output_dir.join(format!("{}.tmp", PLAYLIST_NAME));
        let body = self.render_playlist(ended);
        let mut file = File::create(&tmp)
            .map_err(|e| NvrError::mux(format!("create {}: {}", tmp.display(), e)))?;
        file.write_all(body.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| NvrError::mux(format!("write {}: {}", tmp.display(), e)))?;
        drop(file);
        fs::rename(&tmp, &path)
            .map_err(|e| NvrError::mux(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Finish the open segment and mark the playlist ended. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.finish_segment(None)?;
        if !self.playlist.is_empty() {
            self.write_playlist(true)?;
        }
        log::info!(
            "hls {}: closed after {} segments",
            self.stream_name,
            self.next_index
        );
        Ok(())
    }
}

impl Drop for HlsWriter {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                log::error!("hls {}: close on drop failed: {:#}", self.stream_name, err);
            }
        }
    }
}

fn to_mpeg_clock(packet: &Packet, time_base: TimeBase) -> (i64, i64) {
    let pts = packet.pts.or(packet.dts).unwrap_or(0);
    let dts = packet.dts.or(packet.pts).unwrap_or(pts);
    (
        time_base.rescale(pts, TimeBase::MPEG),
        time_base.rescale(dts, TimeBase::MPEG),
    )
}

/// Create `dir` if needed and prove it is writable with a probe file.
pub fn ensure_writable_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let probe = dir.join(".write_test");
    File::create(&probe)
        .and_then(|mut f| f.write_all(b"ok"))
        .with_context(|| format!("{} is not writable", dir.display()))?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264;
    use crate::media::FrameRate;

    fn info() -> StreamInfo {
        StreamInfo::video(0, CodecId::H264, 320, 240).with_frame_rate(FrameRate::new(10, 1))
    }

    fn frame(n: i64, key: bool) -> Packet {
        let sps = h264::build_baseline_sps(320, 240);
        let pps = h264::build_baseline_pps();
        let data = if key {
            h264::nals_to_annex_b([&sps[..], &pps[..], &[0x65u8, 0x88, 0x80][..]])
        } else {
            h264::nals_to_annex_b([&[0x41u8, 0x9A, 0x80][..]])
        };
        Packet::new(data, 0)
            .with_timestamps(Some(n * 9000), Some(n * 9000))
            .keyframe(key)
    }

    #[test]
    fn segment_duration_clamps() {
        assert_eq!(effective_segment_duration(0), 2);
        assert_eq!(effective_segment_duration(-5), 2);
        assert_eq!(effective_segment_duration(4), 4);
        assert_eq!(effective_segment_duration(30), 10);
    }

    #[test]
    fn cuts_on_keyframes_and_writes_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = HlsWriter::create(dir.path(), "cam1", 1, 3).unwrap();
        // leading non-key frames are dropped
        w.write_packet(&frame(0, false), &info()).unwrap();
        assert_eq!(w.packets_written(), 0);
        for n in 1..=50 {
            w.write_packet(&frame(n, n % 10 == 1), &info()).unwrap();
        }
        w.close().unwrap();

        let playlist = fs::read_to_string(dir.path().join(PLAYLIST_NAME)).unwrap();
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:1\n"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
        assert_eq!(w.segments().count(), 3);
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:2\n"));
        assert!(playlist.contains("#EXTINF:1.000000,\nindex2.ts\n"));
        for i in 0..5 {
            let seg = fs::read(dir.path().join(segment_name(i))).unwrap();
            assert!(!seg.is_empty());
            assert_eq!(seg.len() % 188, 0);
        }
        assert!(!dir.path().join("index.m3u8.tmp").exists());
    }

    #[test]
    fn old_segments_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = HlsWriter::create(dir.path(), "cam1", 1, 5).unwrap();
        for n in 0..200 {
            w.write_packet(&frame(n, n % 10 == 0), &info()).unwrap();
        }
        w.close().unwrap();
        assert_eq!(w.segments_completed(), 20);
        assert!(!dir.path().join(segment_name(0)).exists());
        assert!(!dir.path().join(segment_name(4)).exists());
        assert!(dir.path().join(segment_name(19)).exists());
        assert!(dir.path().join(segment_name(5)).exists());
    }

    #[test]
    fn closed_writer_rejects_packets() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = HlsWriter::create(dir.path(), "cam1", 2, 5).unwrap();
        w.close().unwrap();
        w.close().unwrap();
        assert!(w.write_packet(&frame(0, true), &info()).is_err());
    }
}
