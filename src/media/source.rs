//! Input demuxers.
//!
//! `open_input` routes `stub://` URLs to the synthetic demuxer and every other
//! URL to the ffmpeg backend (feature `rtsp-ffmpeg`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use super::{Packet, Protocol, StreamInfo};
#[cfg(not(feature = "rtsp-ffmpeg"))]
use crate::error::NvrError;

/// Outcome of one demuxer read.
#[derive(Debug)]
pub enum ReadEvent {
    Packet(Packet),
    /// Source ended (or the connection dropped cleanly).
    Eof,
    /// Nothing available right now; try again.
    Again,
}

/// A live input container.
pub trait Demuxer: Send {
    fn url(&self) -> &str;

    /// Stream table captured when the input was opened.
    fn streams(&self) -> &[StreamInfo];

    /// Read the next packet. Blocking reads must return once the demuxer's
    /// [`Interrupter`] is tripped.
    fn read(&mut self) -> Result<ReadEvent>;
}

/// Cross-thread switch that makes a blocked demuxer read give up.
///
/// The reader keeps one per context; `stop_reader` trips it before joining so
/// the thread leaves `read()` and drops the demuxer itself.
#[derive(Clone, Debug, Default)]
pub struct Interrupter(Arc<AtomicBool>);

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Open `url` over `protocol`.
pub fn open_input(
    url: &str,
    protocol: Protocol,
    interrupter: &Interrupter,
) -> Result<Box<dyn Demuxer>> {
    if url.starts_with("stub://") {
        let demuxer = super::synthetic::SyntheticDemuxer::open(url, interrupter.clone())?;
        log::info!("source: connected to {} (synthetic, {})", url, protocol);
        return Ok(Box::new(demuxer));
    }

    #[cfg(feature = "rtsp-ffmpeg")]
    {
        let demuxer = super::ffmpeg::FfmpegDemuxer::open(url, protocol, interrupter.clone())?;
        log::info!("source: connected to {} (ffmpeg, {})", url, protocol);
        Ok(Box::new(demuxer))
    }
    #[cfg(not(feature = "rtsp-ffmpeg"))]
    {
        let _ = protocol;
        Err(NvrError::config(format!(
            "input '{}' requires the rtsp-ffmpeg feature",
            url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupter_is_shared_between_clones() {
        let a = Interrupter::new();
        let b = a.clone();
        assert!(!b.is_tripped());
        a.trip();
        assert!(b.is_tripped());
        b.reset();
        assert!(!a.is_tripped());
    }

    #[test]
    fn stub_urls_open_synthetic_demuxer() {
        let demuxer = open_input("stub://cam?fps=10", Protocol::Tcp, &Interrupter::new()).unwrap();
        assert_eq!(demuxer.url(), "stub://cam?fps=10");
        assert!(!demuxer.streams().is_empty());
    }

    #[cfg(not(feature = "rtsp-ffmpeg"))]
    #[test]
    fn real_urls_need_ffmpeg_feature() {
        let err = open_input("rtsp://10.0.0.2/live", Protocol::Tcp, &Interrupter::new())
            .err()
            .unwrap();
        assert!(matches!(
            NvrError::classify(&err),
            Some(NvrError::Config(_))
        ));
    }
}
