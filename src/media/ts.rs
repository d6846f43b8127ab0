//! MPEG transport stream muxer for HLS segments (video only).
//!
//! Each segment opens with PAT + PMT; every access unit becomes one PES packet
//! on PID 0x100 with PTS/DTS at 90 kHz and a PCR on the first TS packet.

use std::io::Write;

use anyhow::Result;

use super::h264::{self, nal_type};
use super::CodecId;
use crate::error::NvrError;

pub const PACKET_SIZE: usize = 188;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
const AUD: [u8; 6] = [0, 0, 0, 1, 0x09, 0xF0];
const TS_MASK: i64 = (1 << 33) - 1;

/// MPEG-2 CRC32 (poly 0x04C11DB7, no reflection, no final xor).
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn encode_timestamp(prefix: u8, ts: i64) -> [u8; 5] {
    let ts = ts & TS_MASK;
    [
        (prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1,
        ((ts >> 22) & 0xFF) as u8,
        ((((ts >> 15) & 0x7F) as u8) << 1) | 1,
        ((ts >> 7) & 0xFF) as u8,
        (((ts & 0x7F) as u8) << 1) | 1,
    ]
}

fn encode_pcr(base: i64) -> [u8; 6] {
    let base = base & TS_MASK;
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 1) as u8) << 7) | 0x7E,
        0x00,
    ]
}

pub struct TsMuxer<W: Write> {
    out: W,
    stream_type: u8,
    codec: CodecId,
    pat_cc: u8,
    pmt_cc: u8,
    video_cc: u8,
    bytes_written: u64,
}

impl<W: Write> TsMuxer<W> {
    pub fn new(out: W, codec: CodecId) -> Result<Self> {
        let stream_type = match codec {
            CodecId::H264 => 0x1B,
            CodecId::Hevc => 0x24,
            other => {
                return Err(NvrError::mux(format!("codec {} cannot be carried in HLS", other)));
            }
        };
        Ok(Self {
            out,
            stream_type,
            codec,
            pat_cc: 0,
            pmt_cc: 0,
            video_cc: 0,
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, packet: &[u8]) -> Result<()> {
        debug_assert_eq!(packet.len(), PACKET_SIZE);
        self.out
            .write_all(packet)
            .map_err(|e| NvrError::mux(format!("write ts packet: {}", e)))?;
        self.bytes_written += packet.len() as u64;
        Ok(())
    }

    fn write_section(&mut self, pid: u16, section: &[u8]) -> Result<()> {
        let cc = if pid == PAT_PID {
            let cc = self.pat_cc;
            self.pat_cc = (cc + 1) & 0x0F;
            cc
        } else {
            let cc = self.pmt_cc;
            self.pmt_cc = (cc + 1) & 0x0F;
            cc
        };
        let mut packet = Vec::with_capacity(PACKET_SIZE);
        packet.extend_from_slice(&[0x47, 0x40 | ((pid >> 8) as u8 & 0x1F), pid as u8, 0x10 | cc, 0x00]);
        packet.extend_from_slice(section);
        let crc = crc32_mpeg2(section);
        packet.extend_from_slice(&crc.to_be_bytes());
        packet.resize(PACKET_SIZE, 0xFF);
        self.emit(&packet)
    }

    /// PAT and PMT; written at the start of every segment.
    pub fn write_tables(&mut self) -> Result<()> {
        let pat = [
            0x00,
            0xB0,
            13,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0x00,
            0x01,
            0xE0 | (PMT_PID >> 8) as u8,
            PMT_PID as u8,
        ];
        self.write_section(PAT_PID, &pat)?;

        let pmt = [
            0x02,
            0xB0,
            18,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xF0,
            0x00,
            self.stream_type,
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xF0,
            0x00,
        ];
        self.write_section(PMT_PID, &pmt)
    }

    /// Mux one Annex-B access unit. Timestamps are in 90 kHz ticks.
    pub fn write_video(&mut self, data: &[u8], pts: i64, dts: i64, keyframe: bool) -> Result<()> {
        let needs_aud = self.codec == CodecId::H264
            && h264::split_annex_b(data)
                .first()
                .and_then(|nal| h264::nal_unit_type(nal))
                != Some(nal_type::AUD);

        let mut pes = Vec::with_capacity(data.len() + 32);
        pes.extend_from_slice(&[0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80]);
        if pts != dts {
            pes.extend_from_slice(&[0xC0, 10]);
            pes.extend_from_slice(&encode_timestamp(0x3, pts));
            pes.extend_from_slice(&encode_timestamp(0x1, dts));
        } else {
            pes.extend_from_slice(&[0x80, 5]);
            pes.extend_from_slice(&encode_timestamp(0x2, pts));
        }
        if needs_aud {
            pes.extend_from_slice(&AUD);
        }
        pes.extend_from_slice(data);

        let mut pos = 0;
        let mut first = true;
        while pos < pes.len() {
            let mut adaptation: Option<Vec<u8>> = None;
            if first {
                let mut body = vec![0x10 | if keyframe { 0x40 } else { 0x00 }];
                body.extend_from_slice(&encode_pcr(dts));
                adaptation = Some(body);
            }
            let used = adaptation.as_ref().map(|b| 1 + b.len()).unwrap_or(0);
            let room = PACKET_SIZE - 4 - used;
            let take = (pes.len() - pos).min(room);
            if take < room {
                let stuffing = room - take;
                match adaptation.as_mut() {
                    Some(body) => body.resize(body.len() + stuffing, 0xFF),
                    None => {
                        let mut body = Vec::new();
                        if stuffing > 1 {
                            body.push(0x00);
                            body.resize(stuffing - 1, 0xFF);
                        }
                        adaptation = Some(body);
                    }
                }
            }

            let cc = self.video_cc;
            self.video_cc = (cc + 1) & 0x0F;
            let pusi = if first { 0x40 } else { 0x00 };
            let afc = if adaptation.is_some() { 0x30 } else { 0x10 };
            let mut packet = Vec::with_capacity(PACKET_SIZE);
            packet.extend_from_slice(&[
                0x47,
                pusi | ((VIDEO_PID >> 8) as u8 & 0x1F),
                VIDEO_PID as u8,
                afc | cc,
            ]);
            if let Some(body) = adaptation {
                packet.push(body.len() as u8);
                packet.extend_from_slice(&body);
            }
            packet.extend_from_slice(&pes[pos..pos + take]);
            self.emit(&packet)?;
            pos += take;
            first = false;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out
            .flush()
            .map_err(|e| NvrError::mux(format!("flush ts segment: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_timestamp(b: &[u8]) -> i64 {
        (((b[0] as i64 >> 1) & 0x07) << 30)
            | ((b[1] as i64) << 22)
            | (((b[2] as i64) >> 1) << 15)
            | ((b[3] as i64) << 7)
            | ((b[4] as i64) >> 1)
    }

    #[test]
    fn crc_matches_reference_pat() {
        let pat = [0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00];
        assert_eq!(crc32_mpeg2(&pat), 0x2AB1_04B2);
    }

    #[test]
    fn timestamps_survive_encoding() {
        for ts in [0i64, 1, 90_000, 8_589_934_591] {
            assert_eq!(decode_timestamp(&encode_timestamp(0x2, ts)), ts);
        }
    }

    #[test]
    fn packets_are_aligned_and_sequenced() {
        let mut mux = TsMuxer::new(Vec::new(), CodecId::H264).unwrap();
        mux.write_tables().unwrap();
        let frame = h264::nals_to_annex_b([&[0x65u8; 1000][..]]);
        mux.write_video(&frame, 3600, 3600, true).unwrap();
        mux.write_video(&frame[..40], 7200, 7200, false).unwrap();
        let out = mux.into_inner();
        assert_eq!(out.len() % PACKET_SIZE, 0);

        let packets: Vec<&[u8]> = out.chunks(PACKET_SIZE).collect();
        assert!(packets.iter().all(|p| p[0] == 0x47));
        assert_eq!(&packets[0][1..3], &[0x40, 0x00]);
        assert_eq!(&packets[1][1..3], &[0x50, 0x00]);

        let video: Vec<&&[u8]> = packets
            .iter()
            .filter(|p| (((p[1] & 0x1F) as u16) << 8 | p[2] as u16) == VIDEO_PID)
            .collect();
        let ccs: Vec<u8> = video.iter().map(|p| p[3] & 0x0F).collect();
        let expected: Vec<u8> = (0..video.len() as u8).map(|i| i & 0x0F).collect();
        assert_eq!(ccs, expected);

        // first video packet: adaptation field with PCR + random access, then PES
        let first = video[0];
        assert_eq!(first[3] & 0x30, 0x30);
        assert_eq!(first[5] & 0x50, 0x50);
        let pes = &first[5 + first[4] as usize..];
        assert_eq!(&pes[..4], &[0, 0, 1, 0xE0]);
        assert_eq!(decode_timestamp(&pes[9..14]), 3600);
        // access unit delimiter inserted ahead of the slice
        assert_eq!(&pes[14..20], &AUD);
    }

    #[test]
    fn rejects_audio_codecs() {
        assert!(TsMuxer::new(Vec::new(), CodecId::Aac).is_err());
    }
}
