//! ISO-BMFF box serialization for the `moov` tree.

use super::{Mp4Metadata, SampleRecord, Track};
use crate::media::{CodecId, MediaKind};

const MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];
const MOVIE_TIMESCALE: u32 = 1000;

pub(super) fn make_box(fourcc: &[u8; 4], content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + content.len());
    out.extend_from_slice(&((8 + content.len()) as u32).to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(content);
    out
}

fn full_box(fourcc: &[u8; 4], version: u8, flags: u32, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + content.len());
    body.push(version);
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(content);
    make_box(fourcc, &body)
}

fn container(fourcc: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    make_box(fourcc, &children.concat())
}

pub(super) fn ftyp() -> Vec<u8> {
    let mut content = Vec::new();
    content.extend_from_slice(b"isom");
    content.extend_from_slice(&0x200u32.to_be_bytes());
    for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
        content.extend_from_slice(brand);
    }
    make_box(b"ftyp", &content)
}

/// Chunk offsets are `base + sample.offset`; `base` is where the sample
/// payload begins in the final file.
pub(super) fn moov(tracks: &[Track], metadata: &Mp4Metadata, base: u64) -> Vec<u8> {
    let use_co64 = tracks
        .iter()
        .flat_map(|t| t.samples.last())
        .any(|s| base + s.offset + s.size as u64 > u32::MAX as u64);

    let movie_duration = tracks
        .iter()
        .map(|t| rescale_duration(t.duration(), t.timescale, MOVIE_TIMESCALE))
        .max()
        .unwrap_or(0);

    let mut children = vec![mvhd(movie_duration, tracks.len() as u32 + 1)];
    for (i, track) in tracks.iter().enumerate() {
        children.push(trak(track, i as u32 + 1, base, use_co64));
    }
    if !metadata.is_empty() {
        children.push(udta(metadata));
    }
    container(b"moov", &children)
}

fn rescale_duration(value: u64, from: u32, to: u32) -> u64 {
    if from == 0 {
        return 0;
    }
    ((value as u128 * to as u128) / from as u128) as u64
}

fn mvhd(duration: u64, next_track_id: u32) -> Vec<u8> {
    let mut c = Vec::new();
    c.extend_from_slice(&0u32.to_be_bytes());
    c.extend_from_slice(&0u32.to_be_bytes());
    c.extend_from_slice(&MOVIE_TIMESCALE.to_be_bytes());
    c.extend_from_slice(&(duration.min(u32::MAX as u64) as u32).to_be_bytes());
    c.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    c.extend_from_slice(&0x0100u16.to_be_bytes());
    c.extend_from_slice(&[0; 10]);
    for m in MATRIX {
        c.extend_from_slice(&m.to_be_bytes());
    }
    c.extend_from_slice(&[0; 24]);
    c.extend_from_slice(&next_track_id.to_be_bytes());
    full_box(b"mvhd", 0, 0, &c)
}

fn trak(track: &Track, track_id: u32, base: u64, use_co64: bool) -> Vec<u8> {
    container(
        b"trak",
        &[tkhd(track, track_id), mdia(track, base, use_co64)],
    )
}

fn tkhd(track: &Track, track_id: u32) -> Vec<u8> {
    let duration = rescale_duration(track.duration(), track.timescale, MOVIE_TIMESCALE);
    let is_audio = track.config.kind == MediaKind::Audio;
    let mut c = Vec::new();
    c.extend_from_slice(&0u32.to_be_bytes());
    c.extend_from_slice(&0u32.to_be_bytes());
    c.extend_from_slice(&track_id.to_be_bytes());
    c.extend_from_slice(&0u32.to_be_bytes());
    c.extend_from_slice(&(duration.min(u32::MAX as u64) as u32).to_be_bytes());
    c.extend_from_slice(&[0; 8]);
    c.extend_from_slice(&0i16.to_be_bytes());
    c.extend_from_slice(&(if is_audio { 1i16 } else { 0 }).to_be_bytes());
    c.extend_from_slice(&(if is_audio { 0x0100u16 } else { 0 }).to_be_bytes());
    c.extend_from_slice(&0u16.to_be_bytes());
    for m in MATRIX {
        c.extend_from_slice(&m.to_be_bytes());
    }
    let (w, h) = if is_audio {
        (0, 0)
    } else {
        (track.config.width, track.config.height)
    };
    c.extend_from_slice(&(w << 16).to_be_bytes());
    c.extend_from_slice(&(h << 16).to_be_bytes());
    full_box(b"tkhd", 0, 3, &c)
}

fn mdia(track: &Track, base: u64, use_co64: bool) -> Vec<u8> {
    let mut mdhd = Vec::new();
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    mdhd.extend_from_slice(&track.timescale.to_be_bytes());
    mdhd.extend_from_slice(&(track.duration().min(u32::MAX as u64) as u32).to_be_bytes());
    // 'und' packed ISO-639-2
    mdhd.extend_from_slice(&0x55C4u16.to_be_bytes());
    mdhd.extend_from_slice(&0u16.to_be_bytes());

    let (handler, name): (&[u8; 4], &[u8]) = match track.config.kind {
        MediaKind::Audio => (b"soun", b"SoundHandler\0"),
        _ => (b"vide", b"VideoHandler\0"),
    };
    let mut hdlr = Vec::new();
    hdlr.extend_from_slice(&0u32.to_be_bytes());
    hdlr.extend_from_slice(handler);
    hdlr.extend_from_slice(&[0; 12]);
    hdlr.extend_from_slice(name);

    container(
        b"mdia",
        &[
            full_box(b"mdhd", 0, 0, &mdhd),
            full_box(b"hdlr", 0, 0, &hdlr),
            minf(track, base, use_co64),
        ],
    )
}

fn minf(track: &Track, base: u64, use_co64: bool) -> Vec<u8> {
    let header = match track.config.kind {
        MediaKind::Audio => full_box(b"smhd", 0, 0, &[0; 4]),
        _ => full_box(b"vmhd", 0, 1, &[0; 8]),
    };
    let url = full_box(b"url ", 0, 1, &[]);
    let mut dref = 1u32.to_be_bytes().to_vec();
    dref.extend_from_slice(&url);
    let dinf = container(b"dinf", &[full_box(b"dref", 0, 0, &dref)]);
    container(b"minf", &[header, dinf, stbl(track, base, use_co64)])
}

fn stbl(track: &Track, base: u64, use_co64: bool) -> Vec<u8> {
    let samples = &track.samples;
    let mut children = vec![stsd(track), stts(track)];
    if samples.iter().any(|s| s.cts_offset != 0) {
        children.push(ctts(samples));
    }
    if track.config.kind == MediaKind::Video && samples.iter().any(|s| !s.sync) {
        children.push(stss(samples));
    }

    // one sample per chunk
    let mut stsc = 1u32.to_be_bytes().to_vec();
    stsc.extend_from_slice(&1u32.to_be_bytes());
    stsc.extend_from_slice(&1u32.to_be_bytes());
    stsc.extend_from_slice(&1u32.to_be_bytes());
    children.push(full_box(b"stsc", 0, 0, &stsc));

    let mut stsz = 0u32.to_be_bytes().to_vec();
    stsz.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    for s in samples {
        stsz.extend_from_slice(&s.size.to_be_bytes());
    }
    children.push(full_box(b"stsz", 0, 0, &stsz));

    let mut stco = (samples.len() as u32).to_be_bytes().to_vec();
    for s in samples {
        let offset = base + s.offset;
        if use_co64 {
            stco.extend_from_slice(&offset.to_be_bytes());
        } else {
            stco.extend_from_slice(&(offset as u32).to_be_bytes());
        }
    }
    children.push(full_box(if use_co64 { b"co64" } else { b"stco" }, 0, 0, &stco));

    container(b"stbl", &children)
}

fn stts(track: &Track) -> Vec<u8> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for i in 0..track.samples.len() {
        let delta = track.sample_duration(i);
        match runs.last_mut() {
            Some((count, d)) if *d == delta => *count += 1,
            _ => runs.push((1, delta)),
        }
    }
    let mut c = (runs.len() as u32).to_be_bytes().to_vec();
    for (count, delta) in runs {
        c.extend_from_slice(&count.to_be_bytes());
        c.extend_from_slice(&delta.to_be_bytes());
    }
    full_box(b"stts", 0, 0, &c)
}

fn ctts(samples: &[SampleRecord]) -> Vec<u8> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for s in samples {
        match runs.last_mut() {
            Some((count, off)) if *off == s.cts_offset => *count += 1,
            _ => runs.push((1, s.cts_offset)),
        }
    }
    let mut c = (runs.len() as u32).to_be_bytes().to_vec();
    for (count, offset) in runs {
        c.extend_from_slice(&count.to_be_bytes());
        c.extend_from_slice(&offset.to_be_bytes());
    }
    full_box(b"ctts", 0, 0, &c)
}

fn stss(samples: &[SampleRecord]) -> Vec<u8> {
    let sync: Vec<u32> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.sync)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let mut c = (sync.len() as u32).to_be_bytes().to_vec();
    for n in sync {
        c.extend_from_slice(&n.to_be_bytes());
    }
    full_box(b"stss", 0, 0, &c)
}

// ----------------------------------------------------------------------------
// Sample descriptions
// ----------------------------------------------------------------------------

fn stsd(track: &Track) -> Vec<u8> {
    let entry = match track.config.codec {
        CodecId::H264 => avc1(track),
        CodecId::Aac => audio_entry(track, b"mp4a", Some(esds(track))),
        CodecId::Opus => audio_entry(track, b"Opus", Some(dops(track))),
        CodecId::PcmAlaw => audio_entry(track, b"alaw", None),
        CodecId::PcmMulaw => audio_entry(track, b"ulaw", None),
        _ => Vec::new(),
    };
    let mut c = 1u32.to_be_bytes().to_vec();
    c.extend_from_slice(&entry);
    full_box(b"stsd", 0, 0, &c)
}

fn avc1(track: &Track) -> Vec<u8> {
    let cfg = &track.config;
    let mut c = Vec::new();
    c.extend_from_slice(&[0; 6]);
    c.extend_from_slice(&1u16.to_be_bytes());
    c.extend_from_slice(&[0; 16]);
    c.extend_from_slice(&(cfg.width as u16).to_be_bytes());
    c.extend_from_slice(&(cfg.height as u16).to_be_bytes());
    c.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    c.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    c.extend_from_slice(&0u32.to_be_bytes());
    c.extend_from_slice(&1u16.to_be_bytes());
    let mut compressor = [0u8; 32];
    let name = env!("CARGO_PKG_NAME").as_bytes();
    let len = name.len().min(31);
    compressor[0] = len as u8;
    compressor[1..1 + len].copy_from_slice(&name[..len]);
    c.extend_from_slice(&compressor);
    c.extend_from_slice(&0x0018u16.to_be_bytes());
    c.extend_from_slice(&(-1i16).to_be_bytes());
    c.extend_from_slice(&make_box(b"avcC", &cfg.extradata));
    make_box(b"avc1", &c)
}

fn audio_entry(track: &Track, fourcc: &[u8; 4], child: Option<Vec<u8>>) -> Vec<u8> {
    let cfg = &track.config;
    let bits = match cfg.codec {
        CodecId::PcmAlaw | CodecId::PcmMulaw => 8u16,
        _ => 16,
    };
    let mut c = Vec::new();
    c.extend_from_slice(&[0; 6]);
    c.extend_from_slice(&1u16.to_be_bytes());
    c.extend_from_slice(&[0; 8]);
    c.extend_from_slice(&cfg.channels.max(1).to_be_bytes());
    c.extend_from_slice(&bits.to_be_bytes());
    c.extend_from_slice(&[0; 4]);
    c.extend_from_slice(&((cfg.sample_rate.min(0xFFFF)) << 16).to_be_bytes());
    if let Some(child) = child {
        c.extend_from_slice(&child);
    }
    make_box(fourcc, &c)
}

fn descriptor(tag: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = vec![
        tag,
        0x80 | ((len >> 21) & 0x7F) as u8,
        0x80 | ((len >> 14) & 0x7F) as u8,
        0x80 | ((len >> 7) & 0x7F) as u8,
        (len & 0x7F) as u8,
    ];
    out.extend_from_slice(payload);
    out
}

const AAC_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

/// AAC-LC AudioSpecificConfig for a rate/channel pair.
pub fn aac_audio_specific_config(sample_rate: u32, channels: u16) -> Vec<u8> {
    let index = AAC_RATES
        .iter()
        .position(|r| *r == sample_rate)
        .unwrap_or(3) as u16;
    let channels = channels.clamp(1, 7);
    let bits: u16 = (2 << 11) | (index << 7) | (channels << 3);
    bits.to_be_bytes().to_vec()
}

fn esds(track: &Track) -> Vec<u8> {
    let cfg = &track.config;
    let asc = if cfg.extradata.is_empty() {
        aac_audio_specific_config(cfg.sample_rate, cfg.channels)
    } else {
        cfg.extradata.clone()
    };

    let mut dec_config = vec![0x40, 0x15, 0, 0, 0];
    dec_config.extend_from_slice(&0u32.to_be_bytes());
    dec_config.extend_from_slice(&0u32.to_be_bytes());
    dec_config.extend_from_slice(&descriptor(0x05, &asc));

    let mut es = Vec::new();
    es.extend_from_slice(&0u16.to_be_bytes());
    es.push(0);
    es.extend_from_slice(&descriptor(0x04, &dec_config));
    es.extend_from_slice(&descriptor(0x06, &[0x02]));

    full_box(b"esds", 0, 0, &descriptor(0x03, &es))
}

fn dops(track: &Track) -> Vec<u8> {
    let cfg = &track.config;
    let mut c = vec![0, cfg.channels.clamp(1, 2) as u8];
    c.extend_from_slice(&312u16.to_be_bytes());
    c.extend_from_slice(&cfg.sample_rate.to_be_bytes());
    c.extend_from_slice(&0i16.to_be_bytes());
    c.push(0);
    make_box(b"dOps", &c)
}

// ----------------------------------------------------------------------------
// User data
// ----------------------------------------------------------------------------

fn ilst_item(fourcc: &[u8; 4], text: &str) -> Vec<u8> {
    let mut data = 1u32.to_be_bytes().to_vec();
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(text.as_bytes());
    make_box(fourcc, &make_box(b"data", &data))
}

fn udta(metadata: &Mp4Metadata) -> Vec<u8> {
    let mut hdlr = Vec::new();
    hdlr.extend_from_slice(&0u32.to_be_bytes());
    hdlr.extend_from_slice(b"mdir");
    hdlr.extend_from_slice(b"appl");
    hdlr.extend_from_slice(&[0; 8]);
    hdlr.push(0);

    let mut items = Vec::new();
    if let Some(title) = &metadata.title {
        items.push(ilst_item(&[0xA9, b'n', b'a', b'm'], title));
    }
    if let Some(encoder) = &metadata.encoder {
        items.push(ilst_item(&[0xA9, b't', b'o', b'o'], encoder));
    }
    let mut meta = full_box(b"hdlr", 0, 0, &hdlr);
    meta.extend_from_slice(&container(b"ilst", &items));
    container(b"udta", &[full_box(b"meta", 0, 0, &meta)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_header_counts_itself() {
        let b = make_box(b"free", &[1, 2, 3]);
        assert_eq!(&b[..4], &11u32.to_be_bytes());
        assert_eq!(&b[4..8], b"free");
    }

    #[test]
    fn aac_config_for_common_rates() {
        assert_eq!(aac_audio_specific_config(48_000, 1), vec![0x11, 0x88]);
        assert_eq!(aac_audio_specific_config(44_100, 2), vec![0x12, 0x10]);
    }

    #[test]
    fn descriptor_uses_four_byte_length() {
        let d = descriptor(0x05, &[0x11, 0x88]);
        assert_eq!(d, vec![0x05, 0x80, 0x80, 0x80, 0x02, 0x11, 0x88]);
    }
}
