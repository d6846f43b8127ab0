//! nvr-core
//!
//! This crate implements the ingest and recording core of a small network
//! video recorder.
//!
//! # Architecture
//!
//! Every stream runs on dedicated OS threads that share one composed
//! [`Runtime`]:
//!
//! 1. **Reader**: opens the source, repairs timestamps, reconnects with
//!    backoff and hands every packet to the stream's callback.
//! 2. **HLS**: a manager and a worker thread write `index.m3u8` plus MPEG-TS
//!    segments and sample decoded frames for detection.
//! 3. **Detection**: a per-stream worker runs the configured model under a
//!    global concurrency budget and triggers recordings on hits.
//! 4. **Recording**: MP4 files with `moov` first, opened continuously or on
//!    detection with a packet pre-roll buffer flushed into them.
//!
//! Shutdown walks components by priority (reader, HLS, detection, recording)
//! after clearing every stream's callbacks.
//!
//! # Module Structure
//!
//! - `media`: packets, sources, decoders, H.264 helpers, MP4 and TS muxers
//! - `reader`: per-stream input threads
//! - `hls`: live segment output
//! - `recording`: MP4 writer, recording table, metadata store, event sinks
//! - `prebuffer`: pre-roll packet rings
//! - `detect`: models, buffers, admission and the detection pipeline
//! - `state`: stream lifecycle registry and the handle adapter
//! - `shutdown`: priority-ordered shutdown coordinator
//! - `config`, `error`: configuration loading and the error taxonomy

pub mod config;
pub mod detect;
pub mod error;
pub mod hls;
pub mod media;
pub mod prebuffer;
pub mod reader;
pub mod recording;
pub mod runtime;
pub mod shutdown;
pub mod state;

pub use config::{MqttSettings, NvrConfig, StreamConfig};
pub use detect::{Detection, DetectionPipeline, DetectionResult};
pub use error::{NvrError, Recovery};
pub use hls::{HlsStream, HlsWriter};
pub use media::{CodecId, MediaKind, Packet, Protocol, StreamInfo, TimeBase};
pub use prebuffer::{BufferMode, PreBuffer, PreBufferPool};
pub use reader::{ReaderHandle, ReaderRegistry};
pub use recording::{Mp4Writer, RecordingStore, RecordingTable};
pub use runtime::{Runtime, StreamHealth};
pub use shutdown::{ComponentKind, ShutdownCoordinator};
pub use state::{Feature, StreamAdapter, StreamRegistry, StreamState, StreamStatus};
