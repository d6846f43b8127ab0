//! Native MP4 muxer with faststart output.
//!
//! While recording, the file holds `ftyp` followed by an open-ended `mdat`
//! that samples are appended to. [`Mp4Muxer::finish`] writes the final layout
//! (`ftyp`, `moov`, `mdat`) to `<path>.faststart` by copying the sample region
//! behind a freshly built `moov`, then renames it over the original. A crash
//! mid-recording leaves `ftyp` + `mdat` on disk, which is what an interrupted
//! faststart muxer leaves as well.

mod boxes;
pub mod inspect;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use super::h264::{self, AvcConfig};
use super::{CodecId, MediaKind};
use crate::error::NvrError;

pub use boxes::aac_audio_specific_config as aac_config;

/// `udta` metadata written into the movie header.
#[derive(Clone, Debug, Default)]
pub struct Mp4Metadata {
    pub title: Option<String>,
    pub encoder: Option<String>,
}

impl Mp4Metadata {
    fn is_empty(&self) -> bool {
        self.title.is_none() && self.encoder.is_none()
    }
}

/// Parameters of one output track.
#[derive(Clone, Debug)]
pub struct TrackConfig {
    pub kind: MediaKind,
    pub codec: CodecId,
    /// Media timescale; sample timestamps are in these units.
    pub timescale: u32,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Duration assigned to the last sample.
    pub default_duration: u32,
    /// `avcC` record for H.264, AudioSpecificConfig for AAC.
    pub extradata: Vec<u8>,
}

impl TrackConfig {
    pub fn video(codec: CodecId, width: u32, height: u32, timescale: u32) -> Self {
        Self {
            kind: MediaKind::Video,
            codec,
            timescale,
            width,
            height,
            sample_rate: 0,
            channels: 0,
            default_duration: (timescale / 30).max(1),
            extradata: Vec::new(),
        }
    }

    pub fn audio(codec: CodecId, sample_rate: u32, channels: u16, frame_size: u32) -> Self {
        Self {
            kind: MediaKind::Audio,
            codec,
            timescale: sample_rate.max(1),
            width: 0,
            height: 0,
            sample_rate,
            channels,
            default_duration: frame_size.max(1),
            extradata: Vec::new(),
        }
    }

    pub fn with_extradata(mut self, extradata: Vec<u8>) -> Self {
        self.extradata = extradata;
        self
    }

    pub fn with_default_duration(mut self, duration: u32) -> Self {
        self.default_duration = duration.max(1);
        self
    }
}

#[derive(Clone, Copy, Debug)]
struct SampleRecord {
    /// Offset from the start of the `mdat` payload.
    offset: u64,
    size: u32,
    dts: i64,
    cts_offset: u32,
    sync: bool,
}

#[derive(Debug)]
struct Track {
    config: TrackConfig,
    timescale: u32,
    samples: Vec<SampleRecord>,
}

impl Track {
    fn sample_duration(&self, i: usize) -> u32 {
        match (self.samples.get(i), self.samples.get(i + 1)) {
            (Some(cur), Some(next)) => (next.dts - cur.dts).clamp(1, u32::MAX as i64) as u32,
            _ => self.config.default_duration,
        }
    }

    fn duration(&self) -> u64 {
        (0..self.samples.len())
            .map(|i| self.sample_duration(i) as u64)
            .sum()
    }
}

pub struct Mp4Muxer {
    path: PathBuf,
    file: BufWriter<File>,
    payload_start: u64,
    payload_len: u64,
    tracks: Vec<Track>,
    metadata: Mp4Metadata,
}

impl Mp4Muxer {
    /// Create `path` and write the provisional header.
    pub fn create(path: &Path, metadata: Mp4Metadata) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| NvrError::mux(format!("create {}: {}", path.display(), e)))?;
        let mut file = BufWriter::new(file);
        let ftyp = boxes::ftyp();
        file.write_all(&ftyp)
            .and_then(|_| file.write_all(&[0, 0, 0, 0]))
            .and_then(|_| file.write_all(b"mdat"))
            .map_err(|e| NvrError::mux(format!("write header {}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            payload_start: ftyp.len() as u64 + 8,
            payload_len: 0,
            tracks: Vec::new(),
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn sample_count(&self, track: usize) -> usize {
        self.tracks.get(track).map(|t| t.samples.len()).unwrap_or(0)
    }

    pub fn payload_bytes(&self) -> u64 {
        self.payload_len
    }

    /// Add a track; returns its index. Tracks may be added after samples of
    /// other tracks have been written.
    pub fn add_track(&mut self, mut config: TrackConfig) -> Result<usize> {
        if config.timescale == 0 {
            return Err(NvrError::mux("track timescale must be positive"));
        }
        match config.codec {
            CodecId::H264 => {
                let avc = AvcConfig::from_extradata(&config.extradata)
                    .map_err(|e| NvrError::mux(format!("h264 track needs SPS/PPS: {}", e)))?;
                config.extradata = avc.to_record();
            }
            CodecId::Aac | CodecId::Opus | CodecId::PcmAlaw | CodecId::PcmMulaw => {}
            other => {
                return Err(NvrError::mux(format!("codec {} is not supported in mp4", other)));
            }
        }
        let timescale = config.timescale;
        self.tracks.push(Track {
            config,
            timescale,
            samples: Vec::new(),
        });
        Ok(self.tracks.len() - 1)
    }

    /// Append one sample. `dts` must increase strictly per track; `pts` below
    /// `dts` is raised to `dts`. H.264 payloads are accepted in Annex-B form.
    pub fn write_sample(
        &mut self,
        track: usize,
        data: &[u8],
        dts: i64,
        pts: i64,
        sync: bool,
    ) -> Result<()> {
        let t = self
            .tracks
            .get(track)
            .ok_or_else(|| NvrError::mux(format!("no track {}", track)))?;
        if let Some(last) = t.samples.last() {
            if dts <= last.dts {
                return Err(NvrError::mux(format!(
                    "non-monotonic dts on track {}: {} after {}",
                    track, dts, last.dts
                )));
            }
        }
        let converted;
        let annex_b = h264::has_start_code(data) || data.starts_with(&[0, 0, 1]);
        let payload = if t.config.codec == CodecId::H264 && annex_b {
            converted = h264::annex_b_to_avcc(data);
            &converted[..]
        } else {
            data
        };
        if payload.is_empty() {
            return Ok(());
        }

        self.file
            .write_all(payload)
            .map_err(|e| NvrError::mux(format!("write sample {}: {}", self.path.display(), e)))?;
        let record = SampleRecord {
            offset: self.payload_len,
            size: payload.len() as u32,
            dts,
            cts_offset: (pts - dts).clamp(0, u32::MAX as i64) as u32,
            sync,
        };
        self.payload_len += payload.len() as u64;
        if let Some(t) = self.tracks.get_mut(track) {
            t.samples.push(record);
        }
        Ok(())
    }

    /// Write the faststart layout and return the final file size.
    pub fn finish(self) -> Result<u64> {
        let Mp4Muxer {
            path,
            file,
            payload_start,
            payload_len,
            tracks,
            metadata,
        } = self;
        let file = file
            .into_inner()
            .map_err(|e| NvrError::mux(format!("flush {}: {}", path.display(), e.error())))?;
        file.sync_all().ok();
        drop(file);

        let ftyp = boxes::ftyp();
        let mut moov = boxes::moov(&tracks, &metadata, 0);
        loop {
            let base = (ftyp.len() + moov.len()) as u64 + 16;
            let next = boxes::moov(&tracks, &metadata, base);
            if next.len() == moov.len() {
                moov = next;
                break;
            }
            moov = next;
        }

        let tmp = faststart_path(&path);
        let result = write_faststart(&path, &tmp, &ftyp, &moov, payload_start, payload_len);
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(NvrError::mux(format!("faststart {}: {:#}", path.display(), err)));
        }
        let size = fs::metadata(&path)
            .map(|m| m.len())
            .with_context(|| format!("stat {}", path.display()))?;
        Ok(size)
    }
}

fn faststart_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".faststart");
    PathBuf::from(name)
}

fn write_faststart(
    path: &Path,
    tmp: &Path,
    ftyp: &[u8],
    moov: &[u8],
    payload_start: u64,
    payload_len: u64,
) -> Result<()> {
    let mut src = File::open(path).with_context(|| format!("reopen {}", path.display()))?;
    src.seek(SeekFrom::Start(payload_start))?;

    let out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)
        .with_context(|| format!("create {}", tmp.display()))?;
    let mut out = BufWriter::new(out);
    out.write_all(ftyp)?;
    out.write_all(moov)?;
    out.write_all(&1u32.to_be_bytes())?;
    out.write_all(b"mdat")?;
    out.write_all(&(16 + payload_len).to_be_bytes())?;
    let copied = io::copy(&mut Read::by_ref(&mut src).take(payload_len), &mut out)?;
    if copied != payload_len {
        return Err(anyhow!(
            "sample data truncated: {} of {} bytes",
            copied,
            payload_len
        ));
    }
    out.flush()?;
    drop(out);
    fs::rename(tmp, path).with_context(|| format!("rename {}", tmp.display()))?;
    Ok(())
}
