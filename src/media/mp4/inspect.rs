//! Reads back the sample tables of an MP4 file.
//!
//! Used by the recording service to sanity-check finalized files and by tests
//! to assert on muxed timestamps.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{anyhow, Context, Result};

#[derive(Clone, Debug, Default)]
pub struct TrackSummary {
    pub handler: String,
    pub sample_entry: String,
    pub timescale: u32,
    pub width: u32,
    pub height: u32,
    /// Decode timestamps rebuilt from `stts`, starting at 0.
    pub dts: Vec<i64>,
    /// Presentation timestamps (`dts` plus `ctts` offsets).
    pub pts: Vec<i64>,
    pub sizes: Vec<u32>,
    /// 1-based sync sample numbers; empty `stss` means every sample is sync.
    pub sync_samples: Vec<u32>,
    pub chunk_offsets: Vec<u64>,
}

impl TrackSummary {
    pub fn duration_seconds(&self) -> f64 {
        match (self.dts.first(), self.dts.last()) {
            (Some(first), Some(last)) if self.timescale > 0 => {
                (last - first) as f64 / self.timescale as f64
            }
            _ => 0.0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Mp4Summary {
    pub top_level: Vec<String>,
    pub tracks: Vec<TrackSummary>,
    pub mdat_payload_offset: u64,
    pub title: Option<String>,
    pub encoder: Option<String>,
}

fn fourcc(bytes: &[u8]) -> String {
    bytes.iter().map(|b| *b as char).collect()
}

fn u32_at(data: &[u8], at: usize) -> Result<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| anyhow!("box truncated at {}", at))
}

fn u64_at(data: &[u8], at: usize) -> Result<u64> {
    let hi = u32_at(data, at)? as u64;
    let lo = u32_at(data, at + 4)? as u64;
    Ok((hi << 32) | lo)
}

/// Child boxes of `data` as `(fourcc, content)`.
fn children(data: &[u8]) -> Result<Vec<(String, &[u8])>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let size = u32_at(data, pos)? as u64;
        let name = fourcc(&data[pos + 4..pos + 8]);
        let (header, size) = match size {
            0 => (8, (data.len() - pos) as u64),
            1 => (16, u64_at(data, pos + 8)?),
            n => (8, n),
        };
        let end = pos + size as usize;
        if size < header as u64 || end > data.len() {
            return Err(anyhow!("box '{}' overruns its parent", name));
        }
        out.push((name, &data[pos + header..end]));
        pos = end;
    }
    Ok(out)
}

fn child<'a>(data: &'a [u8], name: &str) -> Result<Option<&'a [u8]>> {
    Ok(children(data)?
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, c)| c))
}

fn require<'a>(data: &'a [u8], name: &str) -> Result<&'a [u8]> {
    child(data, name)?.ok_or_else(|| anyhow!("missing '{}' box", name))
}

fn table(content: &[u8], entry_words: usize) -> Result<Vec<Vec<u32>>> {
    let count = u32_at(content, 4)? as usize;
    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let base = 8 + i * entry_words * 4;
        let mut row = Vec::with_capacity(entry_words);
        for w in 0..entry_words {
            row.push(u32_at(content, base + w * 4)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn parse_track(trak: &[u8]) -> Result<TrackSummary> {
    let mut summary = TrackSummary::default();
    let tkhd = require(trak, "tkhd")?;
    if tkhd.len() >= 8 {
        summary.width = u32_at(tkhd, tkhd.len() - 8)? >> 16;
        summary.height = u32_at(tkhd, tkhd.len() - 4)? >> 16;
    }

    let mdia = require(trak, "mdia")?;
    let mdhd = require(mdia, "mdhd")?;
    summary.timescale = if mdhd.first() == Some(&1) {
        u32_at(mdhd, 20)?
    } else {
        u32_at(mdhd, 12)?
    };
    let hdlr = require(mdia, "hdlr")?;
    summary.handler = fourcc(hdlr.get(8..12).ok_or_else(|| anyhow!("short hdlr"))?);

    let stbl = require(require(mdia, "minf")?, "stbl")?;
    let stsd = require(stbl, "stsd")?;
    summary.sample_entry = fourcc(stsd.get(12..16).ok_or_else(|| anyhow!("empty stsd"))?);

    let mut dts = 0i64;
    for row in table(require(stbl, "stts")?, 2)? {
        for _ in 0..row[0] {
            summary.dts.push(dts);
            dts += row[1] as i64;
        }
    }
    let mut offsets = Vec::with_capacity(summary.dts.len());
    if let Some(ctts) = child(stbl, "ctts")? {
        for row in table(ctts, 2)? {
            for _ in 0..row[0] {
                offsets.push(row[1] as i32 as i64);
            }
        }
    }
    summary.pts = summary
        .dts
        .iter()
        .enumerate()
        .map(|(i, d)| d + offsets.get(i).copied().unwrap_or(0))
        .collect();

    if let Some(stss) = child(stbl, "stss")? {
        summary.sync_samples = table(stss, 1)?.into_iter().map(|r| r[0]).collect();
    }

    let stsz = require(stbl, "stsz")?;
    let fixed = u32_at(stsz, 4)?;
    let count = u32_at(stsz, 8)? as usize;
    summary.sizes = if fixed != 0 {
        vec![fixed; count]
    } else {
        (0..count)
            .map(|i| u32_at(stsz, 12 + i * 4))
            .collect::<Result<_>>()?
    };

    if let Some(stco) = child(stbl, "stco")? {
        summary.chunk_offsets = table(stco, 1)?.into_iter().map(|r| r[0] as u64).collect();
    } else if let Some(co64) = child(stbl, "co64")? {
        let n = u32_at(co64, 4)? as usize;
        summary.chunk_offsets = (0..n)
            .map(|i| u64_at(co64, 8 + i * 8))
            .collect::<Result<_>>()?;
    }
    Ok(summary)
}

fn ilst_text(ilst: &[u8], name: &[u8; 4]) -> Result<Option<String>> {
    for (n, item) in children(ilst)? {
        if n != fourcc(name) {
            continue;
        }
        if let Some(data) = child(item, "data")? {
            return Ok(data.get(8..).map(|t| String::from_utf8_lossy(t).into_owned()));
        }
    }
    Ok(None)
}

/// Parse the top-level layout and the `moov` tables of `path`.
pub fn read_summary(path: &Path) -> Result<Mp4Summary> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file.metadata()?.len();
    let mut summary = Mp4Summary::default();
    let mut moov = None;

    let mut pos = 0u64;
    while pos + 8 <= len {
        file.seek(SeekFrom::Start(pos))?;
        let mut header = [0u8; 16];
        file.read_exact(&mut header[..8])?;
        let name = fourcc(&header[4..8]);
        let mut size = u32_at(&header, 0)? as u64;
        let mut header_len = 8u64;
        if size == 1 {
            file.read_exact(&mut header[8..16])?;
            size = u64_at(&header, 8)?;
            header_len = 16;
        } else if size == 0 {
            size = len - pos;
        }
        if size < header_len {
            return Err(anyhow!("corrupt box '{}' at {}", name, pos));
        }
        if name == "moov" {
            let mut content = vec![0u8; (size - header_len) as usize];
            file.read_exact(&mut content)?;
            moov = Some(content);
        } else if name == "mdat" {
            summary.mdat_payload_offset = pos + header_len;
        }
        summary.top_level.push(name);
        pos += size;
    }

    let moov = moov.ok_or_else(|| anyhow!("{} has no moov box", path.display()))?;
    for (name, content) in children(&moov)? {
        match name.as_str() {
            "trak" => summary.tracks.push(parse_track(content)?),
            "udta" => {
                if let Some(meta) = child(content, "meta")? {
                    if let Some(ilst) = child(meta.get(4..).unwrap_or_default(), "ilst")? {
                        summary.title = ilst_text(ilst, &[0xA9, b'n', b'a', b'm'])?;
                        summary.encoder = ilst_text(ilst, &[0xA9, b't', b'o', b'o'])?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(summary)
}
