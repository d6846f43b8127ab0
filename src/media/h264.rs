//! H.264 bitstream helpers.
//!
//! Cameras deliver either Annex-B (start-code framed) or AVCC (length
//! prefixed) access units. The HLS and MP4 muxers both take Annex-B, so every
//! video packet passes through [`AnnexBFilter`] first; the MP4 muxer converts
//! back to 4-byte length prefixes when it lays samples into `mdat`.

use anyhow::{anyhow, Result};

use crate::media::Packet;

/// NAL unit type constants.
pub mod nal_type {
    pub const NON_IDR_SLICE: u8 = 1;
    pub const IDR_SLICE: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
}

const START_CODE: [u8; 4] = [0, 0, 0, 1];

pub fn nal_unit_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// True when `data` opens with the 4-byte Annex-B start code.
pub fn has_start_code(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == START_CODE
}

fn has_short_start_code(data: &[u8]) -> bool {
    data.len() >= 3 && data[..3] == [0, 0, 1]
}

/// Split Annex-B data into NAL payloads (start codes removed).
///
/// Accepts both 3- and 4-byte start codes; trailing zero bytes belonging to a
/// following 4-byte start code are trimmed from the previous NAL.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &(_, payload_start)) in starts.iter().enumerate() {
        let mut end = match starts.get(idx + 1) {
            Some(&(next_code, _)) => next_code,
            None => data.len(),
        };
        while end > payload_start && data[end - 1] == 0 && idx + 1 < starts.len() {
            end -= 1;
        }
        if payload_start < end {
            nals.push(&data[payload_start..end]);
        }
    }
    nals
}

/// Split length-prefixed (AVCC) data into NAL payloads.
pub fn split_avcc(data: &[u8], length_size: usize) -> Result<Vec<&[u8]>> {
    if !(1..=4).contains(&length_size) {
        return Err(anyhow!("invalid NAL length size {}", length_size));
    }
    let mut nals = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if pos + length_size > data.len() {
            return Err(anyhow!("truncated NAL length at offset {}", pos));
        }
        let len = data[pos..pos + length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        pos += length_size;
        if len == 0 || pos + len > data.len() {
            return Err(anyhow!("NAL length {} overruns packet at offset {}", len, pos));
        }
        nals.push(&data[pos..pos + len]);
        pos += len;
    }
    Ok(nals)
}

pub fn nals_to_annex_b<'a>(nals: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
    }
    out
}

/// Annex-B to 4-byte length prefixes, the sample layout MP4 expects.
/// Access unit delimiters are dropped.
pub fn annex_b_to_avcc(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    for nal in split_annex_b(data) {
        if nal_unit_type(nal) == Some(nal_type::AUD) {
            continue;
        }
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// True when the access unit carries an IDR slice.
pub fn contains_idr(data: &[u8]) -> bool {
    split_annex_b(data)
        .iter()
        .any(|nal| nal_unit_type(nal) == Some(nal_type::IDR_SLICE))
}

// ----------------------------------------------------------------------------
// Decoder configuration (avcC)
// ----------------------------------------------------------------------------

/// Parsed `AVCDecoderConfigurationRecord`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AvcConfig {
    pub profile_idc: u8,
    pub profile_compat: u8,
    pub level_idc: u8,
    pub length_size: usize,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

impl AvcConfig {
    pub fn from_parameter_sets(sps: Vec<u8>, pps: Vec<u8>) -> Self {
        let (profile_idc, profile_compat, level_idc) = if sps.len() >= 4 {
            (sps[1], sps[2], sps[3])
        } else {
            (66, 0, 30)
        };
        Self {
            profile_idc,
            profile_compat,
            level_idc,
            length_size: 4,
            sps: vec![sps],
            pps: vec![pps],
        }
    }

    /// Parse either an `avcC` record or Annex-B SPS/PPS extradata.
    pub fn from_extradata(extradata: &[u8]) -> Result<Self> {
        if extradata.first() == Some(&1) {
            return Self::parse_record(extradata);
        }
        let mut sps = Vec::new();
        let mut pps = Vec::new();
        for nal in split_annex_b(extradata) {
            match nal_unit_type(nal) {
                Some(nal_type::SPS) => sps.push(nal.to_vec()),
                Some(nal_type::PPS) => pps.push(nal.to_vec()),
                _ => {}
            }
        }
        if sps.is_empty() || pps.is_empty() {
            return Err(anyhow!("extradata carries no SPS/PPS"));
        }
        let mut cfg = Self::from_parameter_sets(sps.remove(0), pps.remove(0));
        cfg.sps.extend(sps);
        cfg.pps.extend(pps);
        Ok(cfg)
    }

    fn parse_record(data: &[u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(anyhow!("avcC record too short ({} bytes)", data.len()));
        }
        let length_size = (data[4] & 0x03) as usize + 1;
        let mut pos = 5;
        let mut read_sets = |count: usize, pos: &mut usize| -> Result<Vec<Vec<u8>>> {
            let mut sets = Vec::with_capacity(count);
            for _ in 0..count {
                if *pos + 2 > data.len() {
                    return Err(anyhow!("avcC record truncated"));
                }
                let len = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
                *pos += 2;
                if *pos + len > data.len() {
                    return Err(anyhow!("avcC parameter set overruns record"));
                }
                sets.push(data[*pos..*pos + len].to_vec());
                *pos += len;
            }
            Ok(sets)
        };
        let sps_count = (data[pos] & 0x1F) as usize;
        pos += 1;
        let sps = read_sets(sps_count, &mut pos)?;
        let pps_count = *data.get(pos).ok_or_else(|| anyhow!("avcC record missing PPS count"))?;
        pos += 1;
        let pps = read_sets(pps_count as usize, &mut pos)?;
        Ok(Self {
            profile_idc: data[1],
            profile_compat: data[2],
            level_idc: data[3],
            length_size,
            sps,
            pps,
        })
    }

    /// Serialize as an `avcC` payload (without the box header).
    pub fn to_record(&self) -> Vec<u8> {
        let mut out = vec![
            1,
            self.profile_idc,
            self.profile_compat,
            self.level_idc,
            0xFC | (self.length_size.clamp(1, 4) as u8 - 1),
            0xE0 | (self.sps.len() as u8 & 0x1F),
        ];
        for sps in &self.sps {
            out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
            out.extend_from_slice(sps);
        }
        out.push(self.pps.len() as u8);
        for pps in &self.pps {
            out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
            out.extend_from_slice(pps);
        }
        out
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.sps.first().and_then(|sps| parse_sps_dimensions(sps))
    }

    /// Parameter sets as an Annex-B prefix.
    pub fn annex_b_prefix(&self) -> Vec<u8> {
        nals_to_annex_b(
            self.sps
                .iter()
                .chain(self.pps.iter())
                .map(|nal| nal.as_slice()),
        )
    }
}

/// Pull SPS/PPS from an Annex-B access unit (usually a keyframe).
pub fn parameter_sets_in(data: &[u8]) -> Option<AvcConfig> {
    let mut sps = None;
    let mut pps = None;
    for nal in split_annex_b(data) {
        match nal_unit_type(nal) {
            Some(nal_type::SPS) if sps.is_none() => sps = Some(nal.to_vec()),
            Some(nal_type::PPS) if pps.is_none() => pps = Some(nal.to_vec()),
            _ => {}
        }
    }
    Some(AvcConfig::from_parameter_sets(sps?, pps?))
}

// ----------------------------------------------------------------------------
// Bitstream filter (h264_mp4toannexb)
// ----------------------------------------------------------------------------

/// Rewrites H.264 packets into Annex-B framing.
///
/// Packets that already open with `00 00 00 01` pass through untouched. AVCC
/// packets are re-framed NAL by NAL; when an IDR arrives without in-band
/// parameter sets, the SPS/PPS from the stream's extradata are prepended.
/// Anything that is neither is treated as a bare NAL and gets a start code.
#[derive(Clone, Debug, Default)]
pub struct AnnexBFilter {
    config: Option<AvcConfig>,
}

impl AnnexBFilter {
    pub fn new(extradata: &[u8]) -> Self {
        let config = if extradata.is_empty() {
            None
        } else {
            AvcConfig::from_extradata(extradata).ok()
        };
        Self { config }
    }

    pub fn filter(&self, packet: &Packet) -> Packet {
        let data = packet.data();
        if has_start_code(data) {
            return packet.clone();
        }
        if has_short_start_code(data) {
            let mut out = Vec::with_capacity(data.len() + 1);
            out.push(0);
            out.extend_from_slice(data);
            return packet.with_payload(out);
        }

        let length_size = self.config.as_ref().map(|c| c.length_size).unwrap_or(4);
        match split_avcc(data, length_size) {
            Ok(nals) => {
                let has_idr = nals
                    .iter()
                    .any(|nal| nal_unit_type(nal) == Some(nal_type::IDR_SLICE));
                let has_sps = nals
                    .iter()
                    .any(|nal| nal_unit_type(nal) == Some(nal_type::SPS));
                let mut out = Vec::with_capacity(data.len() + 64);
                if has_idr && !has_sps {
                    if let Some(cfg) = &self.config {
                        out.extend_from_slice(&cfg.annex_b_prefix());
                    }
                }
                out.extend_from_slice(&nals_to_annex_b(nals));
                packet.with_payload(out)
            }
            Err(_) => {
                let mut out = Vec::with_capacity(data.len() + 4);
                out.extend_from_slice(&START_CODE);
                out.extend_from_slice(data);
                packet.with_payload(out)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// SPS parsing and synthesis
// ----------------------------------------------------------------------------

fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

fn insert_emulation_prevention(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + 4);
    let mut zeros = 0;
    for &b in rbsp {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn bits(&mut self, n: u32) -> Option<u32> {
        let mut v = 0u32;
        for _ in 0..n {
            v = (v << 1) | self.bit()?;
        }
        Some(v)
    }

    fn ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let rest = self.bits(zeros)?;
        Some((1u32 << zeros) - 1 + rest)
    }

    fn se(&mut self) -> Option<i32> {
        let k = self.ue()?;
        let magnitude = k.div_ceil(2) as i32;
        Some(if k % 2 == 1 { magnitude } else { -magnitude })
    }
}

#[derive(Default)]
struct BitWriter {
    out: Vec<u8>,
    bit_pos: u8,
}

impl BitWriter {
    fn bit(&mut self, b: u32) {
        if self.bit_pos == 0 {
            self.out.push(0);
        }
        if b != 0 {
            if let Some(last) = self.out.last_mut() {
                *last |= 1 << (7 - self.bit_pos);
            }
        }
        self.bit_pos = (self.bit_pos + 1) % 8;
    }

    fn bits(&mut self, n: u32, v: u32) {
        for i in (0..n).rev() {
            self.bit((v >> i) & 1);
        }
    }

    fn ue(&mut self, v: u32) {
        let x = v + 1;
        let len = 32 - x.leading_zeros();
        self.bits(len - 1, 0);
        self.bits(len, x);
    }

    fn se(&mut self, v: i32) {
        let mapped = if v > 0 { (v as u32) * 2 - 1 } else { (-v) as u32 * 2 };
        self.ue(mapped);
    }

    fn finish(mut self) -> Vec<u8> {
        self.bit(1);
        while self.bit_pos != 0 {
            self.bit(0);
        }
        self.out
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

/// Coded picture size from an SPS NAL (header byte included), cropping applied.
pub fn parse_sps_dimensions(sps: &[u8]) -> Option<(u32, u32)> {
    if nal_unit_type(sps) != Some(nal_type::SPS) {
        return None;
    }
    let rbsp = strip_emulation_prevention(&sps[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.bits(8)?;
    r.bits(16)?;
    r.ue()?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.bit()? == 1;
        }
        r.ue()?;
        r.ue()?;
        r.bit()?;
        if r.bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.ue()?;
    let poc_type = r.ue()?;
    if poc_type == 0 {
        r.ue()?;
    } else if poc_type == 1 {
        r.bit()?;
        r.se()?;
        r.se()?;
        let cycle = r.ue()?;
        for _ in 0..cycle {
            r.se()?;
        }
    }
    r.ue()?;
    r.bit()?;

    let width_mbs = r.ue()? + 1;
    let height_units = r.ue()? + 1;
    let frame_mbs_only = r.bit()?;
    if frame_mbs_only == 0 {
        r.bit()?;
    }
    r.bit()?;

    let mut width = width_mbs * 16;
    let mut height = (2 - frame_mbs_only) * height_units * 16;

    if r.bit()? == 1 {
        let (left, right, top, bottom) = (r.ue()?, r.ue()?, r.ue()?, r.ue()?);
        let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
        let (crop_x, crop_y) = if chroma_array_type == 0 {
            (1, 2 - frame_mbs_only)
        } else {
            let sub_w = if chroma_array_type == 3 { 1 } else { 2 };
            let sub_h = if chroma_array_type == 1 { 2 } else { 1 };
            (sub_w, sub_h * (2 - frame_mbs_only))
        };
        width = width.checked_sub((left + right) * crop_x)?;
        height = height.checked_sub((top + bottom) * crop_y)?;
    }
    Some((width, height))
}

/// Constrained-baseline SPS describing a `width` x `height` picture.
pub fn build_baseline_sps(width: u32, height: u32) -> Vec<u8> {
    let width_mbs = width.div_ceil(16).max(1);
    let height_mbs = height.div_ceil(16).max(1);
    let mut w = BitWriter::default();
    w.bits(8, 66);
    w.bits(8, 0xC0);
    w.bits(8, 30);
    w.ue(0);
    w.ue(0);
    w.ue(2);
    w.ue(1);
    w.bit(0);
    w.ue(width_mbs - 1);
    w.ue(height_mbs - 1);
    w.bit(1);
    w.bit(1);
    let crop_right = (width_mbs * 16 - width) / 2;
    let crop_bottom = (height_mbs * 16 - height) / 2;
    if crop_right > 0 || crop_bottom > 0 {
        w.bit(1);
        w.ue(0);
        w.ue(crop_right);
        w.ue(0);
        w.ue(crop_bottom);
    } else {
        w.bit(0);
    }
    w.bit(0);
    let mut sps = vec![0x67];
    sps.extend(insert_emulation_prevention(&w.finish()));
    sps
}

/// PPS matching [`build_baseline_sps`].
pub fn build_baseline_pps() -> Vec<u8> {
    let mut w = BitWriter::default();
    w.ue(0);
    w.ue(0);
    w.bit(0);
    w.bit(0);
    w.ue(0);
    w.ue(0);
    w.ue(0);
    w.bit(0);
    w.bits(2, 0);
    w.se(0);
    w.se(0);
    w.se(0);
    w.bit(1);
    w.bit(0);
    w.bit(0);
    let mut pps = vec![0x68];
    pps.extend(insert_emulation_prevention(&w.finish()));
    pps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        nals_to_annex_b(nals.iter().copied())
    }

    #[test]
    fn split_handles_mixed_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 0, 1, 0x65, 4, 5];
        let nals = split_annex_b(&data);
        assert_eq!(nals, vec![&[0x67, 1, 2][..], &[0x68, 3][..], &[0x65, 4, 5][..]]);
    }

    #[test]
    fn avcc_and_annex_b_convert_both_ways() {
        let data = annex_b(&[&[0x09, 0xF0], &[0x65, 0xAA, 0xBB]]);
        let avcc = annex_b_to_avcc(&data);
        assert_eq!(avcc, vec![0, 0, 0, 3, 0x65, 0xAA, 0xBB]);
        let nals = split_avcc(&avcc, 4).unwrap();
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
        assert!(split_avcc(&[0, 0, 0, 9, 1], 4).is_err());
    }

    #[test]
    fn synthesized_sps_round_trips_dimensions() {
        for (w, h) in [(640, 480), (1920, 1080), (1280, 720), (352, 288)] {
            let sps = build_baseline_sps(w, h);
            assert_eq!(parse_sps_dimensions(&sps), Some((w, h)), "{}x{}", w, h);
        }
    }

    #[test]
    fn avc_config_record_round_trip() {
        let cfg = AvcConfig::from_parameter_sets(build_baseline_sps(640, 480), build_baseline_pps());
        let record = cfg.to_record();
        let parsed = AvcConfig::from_extradata(&record).unwrap();
        assert_eq!(parsed, cfg);
        assert_eq!(parsed.dimensions(), Some((640, 480)));

        let from_annex_b = AvcConfig::from_extradata(&cfg.annex_b_prefix()).unwrap();
        assert_eq!(from_annex_b.sps, cfg.sps);
        assert_eq!(from_annex_b.pps, cfg.pps);
    }

    #[test]
    fn filter_passes_annex_b_through() {
        let pkt = Packet::new(annex_b(&[&[0x65, 1, 2, 3]]), 0).keyframe(true);
        let out = AnnexBFilter::default().filter(&pkt);
        assert_eq!(out.data(), pkt.data());
        // pass-through shares the original payload
        assert_eq!(pkt.ref_count(), 2);
    }

    #[test]
    fn filter_converts_avcc_and_injects_parameter_sets() {
        let cfg = AvcConfig::from_parameter_sets(build_baseline_sps(640, 480), build_baseline_pps());
        let filter = AnnexBFilter::new(&cfg.to_record());
        let pkt = Packet::new(vec![0, 0, 0, 3, 0x65, 0xAA, 0xBB], 0)
            .with_timestamps(Some(3000), Some(3000))
            .keyframe(true);
        let out = filter.filter(&pkt);
        assert!(has_start_code(out.data()));
        let nals = split_annex_b(out.data());
        let types: Vec<u8> = nals.iter().filter_map(|n| nal_unit_type(n)).collect();
        assert_eq!(types, vec![nal_type::SPS, nal_type::PPS, nal_type::IDR_SLICE]);
        assert_eq!(out.pts, Some(3000));
        assert!(out.is_keyframe);
    }

    #[test]
    fn filter_prefixes_bare_nal() {
        let pkt = Packet::new(vec![0x41, 0x9A, 0x00], 0);
        let out = AnnexBFilter::default().filter(&pkt);
        assert_eq!(out.data(), &[0, 0, 0, 1, 0x41, 0x9A, 0x00]);
    }
}
