//! MP4 recording: the per-file writer, the per-stream table that opens and
//! closes files on detection or continuously, and the metadata store and
//! event sinks they report to.

pub mod events;
pub mod store;
mod table;
mod writer;

pub use events::{mqtt_topic, Event, EventKind, EventSink, FanoutSink, LogSink, MemorySink, MqttSink, StoreSink};
pub use store::{MemoryStore, Recording, RecordingStore, SqliteStore};
pub use table::{RecordingMode, RecordingSettings, RecordingTable};
pub use writer::{
    Mp4CloseSummary, Mp4Writer, AAC_FRAME_SIZE, DEFAULT_AUDIO_SAMPLE_RATE, MIN_RECORDING_BYTES,
    OPUS_FRAME_SIZE, PLACEHOLDER_HEIGHT, PLACEHOLDER_WIDTH,
};
