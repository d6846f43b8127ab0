//! HLS worker: drains the packet queue into the writer and samples frames
//! for detection.

use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::error::NvrError;
use crate::media::{open_decoder, FrameDecoder, Packet, StreamInfo};

use super::{HlsDetection, HlsShared};

const RECV_POLL: Duration = Duration::from_millis(100);

pub(crate) type QueuedPacket = (Packet, StreamInfo);

pub(crate) fn spawn(shared: Arc<HlsShared>, receiver: Receiver<QueuedPacket>) -> Result<JoinHandle<()>> {
    let name = shared.stream.clone();
    std::thread::Builder::new()
        .name(format!("hls-worker-{}", name))
        .spawn(move || worker_loop(&shared, &receiver))
        .with_context(|| format!("spawn hls worker for {}", name))
}

/// Decoder state for the detection side of the worker.
struct FrameSampler {
    decoder: Option<Box<dyn FrameDecoder>>,
    failed: bool,
}

impl FrameSampler {
    fn new() -> Self {
        Self {
            decoder: None,
            failed: false,
        }
    }

    fn feed(&mut self, shared: &HlsShared, detection: &HlsDetection, packet: &Packet, info: &StreamInfo) {
        if self.failed {
            return;
        }
        if self.decoder.is_none() {
            match open_decoder(&shared.url, info) {
                Ok(decoder) => {
                    log::info!("hls {}: {} decoder feeds detection", shared.stream, decoder.name());
                    self.decoder = Some(decoder);
                }
                Err(err) => {
                    log::error!("hls {}: no decoder for detection: {:#}", shared.stream, err);
                    self.failed = true;
                    return;
                }
            }
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };
        if !packet.is_keyframe && !decoder.intra_only() {
            return;
        }
        if !detection.pipeline.try_claim(&shared.stream, Instant::now()) {
            return;
        }
        match decoder.decode(packet) {
            Ok(Some(frame)) => {
                detection.worker.submit(frame);
            }
            Ok(None) => {}
            Err(err) => log::debug!("hls {}: decode failed: {:#}", shared.stream, err),
        }
    }
}

fn worker_loop(shared: &HlsShared, receiver: &Receiver<QueuedPacket>) {
    log::debug!("hls {}: worker started", shared.stream);
    let mut sampler = FrameSampler::new();
    while shared.running.load(Ordering::SeqCst) && !shared.shutdown.is_shutdown_initiated() {
        let (packet, info) = match receiver.recv_timeout(RECV_POLL) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(err) = write(shared, &packet, &info) {
            log::error!("hls {}: {:#}", shared.stream, err);
            shared.state.record_error();
        }
        if let Some(detection) = &shared.detection {
            sampler.feed(shared, detection, &packet, &info);
        }
    }
    log::debug!("hls {}: worker exit", shared.stream);
}

fn write(shared: &HlsShared, packet: &Packet, info: &StreamInfo) -> Result<()> {
    let mut writer = shared
        .writer
        .lock()
        .map_err(|_| NvrError::ShutdownRaced(format!("hls {} writer lock poisoned", shared.stream)))?;
    match writer.as_mut() {
        Some(writer) => writer.write_packet(packet, info),
        None => Ok(()),
    }
}
