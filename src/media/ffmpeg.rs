//! ffmpeg-backed demuxer and decoder for real camera inputs.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::decode::{FrameDecoder, PixelFormat, VideoFrame};
use super::source::{Demuxer, Interrupter, ReadEvent};
use super::{CodecId, FrameRate, MediaKind, Packet, Protocol, SampleFormat, StreamInfo, TimeBase};
use crate::error::NvrError;

/// Socket timeout handed to the protocol layer, in microseconds. Bounds how
/// long a blocked read can outlive a tripped interrupter.
const IO_TIMEOUT_US: &str = "5000000";

pub(crate) struct FfmpegDemuxer {
    url: String,
    input: ffmpeg::format::context::Input,
    streams: Vec<StreamInfo>,
    interrupter: Interrupter,
}

impl FfmpegDemuxer {
    pub(crate) fn open(url: &str, protocol: Protocol, interrupter: Interrupter) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut options = ffmpeg::Dictionary::new();
        if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            options.set(
                "rtsp_transport",
                if protocol.is_udp() { "udp" } else { "tcp" },
            );
        }
        options.set("timeout", IO_TIMEOUT_US);

        let input = ffmpeg::format::input_with_dictionary(&url, options)
            .map_err(|e| NvrError::transport(format!("open '{}': {}", url, e)))?;

        let mut streams = Vec::new();
        for stream in input.streams() {
            streams.push(stream_info(&stream)?);
        }
        if super::find_video_stream(&streams).is_none() {
            return Err(NvrError::transport(format!("'{}' has no video track", url)));
        }

        Ok(Self {
            url: url.to_string(),
            input,
            streams,
            interrupter,
        })
    }
}

fn map_codec(id: ffmpeg::codec::Id) -> CodecId {
    use ffmpeg::codec::Id;
    match id {
        Id::H264 => CodecId::H264,
        Id::HEVC => CodecId::Hevc,
        Id::MJPEG => CodecId::Mjpeg,
        Id::AAC => CodecId::Aac,
        Id::OPUS => CodecId::Opus,
        Id::PCM_ALAW => CodecId::PcmAlaw,
        Id::PCM_MULAW => CodecId::PcmMulaw,
        _ => CodecId::None,
    }
}

fn map_sample_format(format: ffmpeg::format::Sample) -> Option<SampleFormat> {
    use ffmpeg::format::sample::Type;
    use ffmpeg::format::Sample;
    match format {
        Sample::I16(Type::Packed) => Some(SampleFormat::S16),
        Sample::I16(Type::Planar) => Some(SampleFormat::S16Planar),
        Sample::I32(_) => Some(SampleFormat::S32),
        Sample::F32(Type::Packed) => Some(SampleFormat::F32),
        Sample::F32(Type::Planar) => Some(SampleFormat::F32Planar),
        _ => None,
    }
}

fn extradata(params: &ffmpeg::codec::Parameters) -> Vec<u8> {
    // SAFETY: the parameters stay alive for the duration of the borrow and
    // extradata/extradata_size are kept consistent by libavformat.
    unsafe {
        let raw = params.as_ptr();
        if (*raw).extradata.is_null() || (*raw).extradata_size <= 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts((*raw).extradata, (*raw).extradata_size as usize).to_vec()
    }
}

fn stream_info(stream: &ffmpeg::format::stream::Stream) -> Result<StreamInfo> {
    let params = stream.parameters();
    let tb = stream.time_base();
    let time_base = TimeBase::new(tb.numerator(), tb.denominator());
    let codec = map_codec(params.id());
    let extra = extradata(&params);

    let info = match params.medium() {
        ffmpeg::media::Type::Video => {
            let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .context("load video codec parameters")?
                .decoder()
                .video()
                .context("inspect video stream")?;
            let rate = stream.avg_frame_rate();
            let mut info = StreamInfo::video(stream.index(), codec, decoder.width(), decoder.height());
            let fr = FrameRate::new(rate.numerator(), rate.denominator());
            if fr.is_valid() {
                info = info.with_frame_rate(fr);
            }
            info
        }
        ffmpeg::media::Type::Audio => {
            let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .context("load audio codec parameters")?
                .decoder()
                .audio()
                .context("inspect audio stream")?;
            let mut info =
                StreamInfo::audio(stream.index(), codec, decoder.rate(), decoder.channels());
            info.sample_format = map_sample_format(decoder.format());
            info.frame_size = decoder.frame_size();
            info
        }
        _ => {
            let mut info = StreamInfo::video(stream.index(), CodecId::None, 0, 0);
            info.kind = MediaKind::Data;
            info
        }
    };
    Ok(info.with_time_base(time_base).with_extradata(extra))
}

impl Demuxer for FfmpegDemuxer {
    fn url(&self) -> &str {
        &self.url
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read(&mut self) -> Result<ReadEvent> {
        if self.interrupter.is_tripped() {
            return Err(NvrError::transport("read interrupted"));
        }
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {
                let data = packet.data().unwrap_or_default().to_vec();
                Ok(ReadEvent::Packet(
                    Packet::new(data, packet.stream())
                        .with_timestamps(packet.pts(), packet.dts())
                        .with_duration(packet.duration())
                        .keyframe(packet.is_key()),
                ))
            }
            Err(ffmpeg::Error::Eof) => Ok(ReadEvent::Eof),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                Ok(ReadEvent::Again)
            }
            Err(e) => Err(NvrError::transport(format!("read '{}': {}", self.url, e))),
        }
    }
}

// ----------------------------------------------------------------------------
// Decoder
// ----------------------------------------------------------------------------

/// Decodes one access unit at a time: the packet is sent, the decoder is
/// drained with EOF and then flushed so the next keyframe starts clean.
pub(crate) struct FfmpegFrameDecoder {
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
}

impl FfmpegFrameDecoder {
    pub(crate) fn new(info: &StreamInfo) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let id = match info.codec {
            CodecId::H264 => ffmpeg::codec::Id::H264,
            CodecId::Hevc => ffmpeg::codec::Id::HEVC,
            CodecId::Mjpeg => ffmpeg::codec::Id::MJPEG,
            other => return Err(NvrError::config(format!("no decoder for codec {}", other))),
        };
        let codec = ffmpeg::decoder::find(id)
            .ok_or_else(|| NvrError::config(format!("ffmpeg has no {} decoder", info.codec)))?;
        let decoder = ffmpeg::codec::context::Context::new()
            .decoder()
            .open_as(codec)
            .context("open ffmpeg decoder")?
            .video()
            .context("open ffmpeg video decoder")?;
        Ok(Self {
            decoder,
            scaler: None,
        })
    }

    fn receive(&mut self) -> Result<Option<ffmpeg::frame::Video>> {
        let mut frame = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(frame)),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => Ok(None),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(anyhow!("receive frame: {}", e)),
        }
    }

    fn convert(&mut self, frame: &ffmpeg::frame::Video) -> Result<VideoFrame> {
        use ffmpeg::util::format::pixel::Pixel;
        let (width, height) = (frame.width(), frame.height());
        if matches!(frame.format(), Pixel::YUV420P | Pixel::YUVJ420P) {
            return Ok(VideoFrame {
                width,
                height,
                format: PixelFormat::Yuv420p,
                planes: (0..3).map(|i| frame.data(i).to_vec()).collect(),
                strides: (0..3).map(|i| frame.stride(i)).collect(),
                pts: frame.pts(),
            });
        }

        if self.scaler.is_none() {
            self.scaler = Some(
                ffmpeg::software::scaling::Context::get(
                    frame.format(),
                    width,
                    height,
                    Pixel::RGB24,
                    width,
                    height,
                    ffmpeg::software::scaling::flag::Flags::BILINEAR,
                )
                .context("create ffmpeg scaler")?,
            );
        }
        let mut rgb = ffmpeg::frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(frame, &mut rgb).context("scale frame to RGB")?;
        }
        Ok(VideoFrame {
            width,
            height,
            format: PixelFormat::Rgb24,
            planes: vec![rgb.data(0).to_vec()],
            strides: vec![rgb.stride(0)],
            pts: frame.pts(),
        })
    }
}

impl FrameDecoder for FfmpegFrameDecoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn decode(&mut self, packet: &Packet) -> Result<Option<VideoFrame>> {
        let mut av_packet = ffmpeg::Packet::copy(packet.data());
        av_packet.set_pts(packet.pts);
        av_packet.set_dts(packet.dts);
        self.decoder
            .send_packet(&av_packet)
            .context("send packet to ffmpeg decoder")?;

        let mut decoded = self.receive()?;
        if decoded.is_none() {
            self.decoder.send_eof().context("drain ffmpeg decoder")?;
            decoded = self.receive()?;
            self.decoder.flush();
        }
        match decoded {
            Some(frame) => Ok(Some(self.convert(&frame)?)),
            None => Ok(None),
        }
    }
}
