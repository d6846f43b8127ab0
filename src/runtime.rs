//! The composed service graph.
//!
//! One `Runtime` owns every registry, pool and table and is shared behind an
//! `Arc`. Starting a stream wires its reader callback to the HLS queue and the
//! recording table; stopping it clears the callbacks before the reader is
//! asked to stop, then joins everything that was started for it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::config::NvrConfig;
use crate::detect::{DetectionPipeline, DetectionWorker, LoaderRegistry, ModelCache};
use crate::error::NvrError;
use crate::hls::{HlsContext, HlsDetection, HlsStream};
use crate::media::{Packet, StreamInfo};
use crate::prebuffer::PreBufferPool;
use crate::reader::{PacketCallback, ReaderHandle, ReaderRegistry};
use crate::recording::{
    EventSink, FanoutSink, LogSink, MemoryStore, MqttSink, RecordingSettings, RecordingStore,
    RecordingTable, SqliteStore, StoreSink,
};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport, SHUTDOWN_JOIN_TIMEOUT, STOP_JOIN_TIMEOUT};
use crate::state::{Feature, StreamAdapter, StreamController, StreamRegistry, StreamState, StreamStatus};

/// Threads started for one running stream.
#[derive(Default)]
struct ActiveStream {
    reader: Option<Arc<ReaderHandle>>,
    hls: Option<Arc<HlsStream>>,
    worker: Option<Arc<DetectionWorker>>,
}

/// One line of the periodic health report.
#[derive(Clone, Debug)]
pub struct StreamHealth {
    pub name: String,
    pub status: StreamStatus,
    pub fps: f64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub errors: u64,
    pub recording: bool,
    pub last_error: Option<String>,
}

pub struct Runtime {
    config: NvrConfig,
    shutdown: Arc<ShutdownCoordinator>,
    streams: Arc<StreamRegistry>,
    readers: ReaderRegistry,
    prebuffers: Arc<PreBufferPool>,
    detection: Arc<DetectionPipeline>,
    recordings: Arc<RecordingTable>,
    store: Arc<dyn RecordingStore>,
    events: Arc<dyn EventSink>,
    active: Mutex<HashMap<String, ActiveStream>>,
}

impl Runtime {
    /// Build the runtime with the store and event sinks `config` asks for:
    /// sqlite when `db_path` is set, MQTT when a broker is configured.
    pub fn new(config: NvrConfig) -> Result<Arc<Self>> {
        let store: Arc<dyn RecordingStore> = match &config.db_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let mut sinks: Vec<Arc<dyn EventSink>> =
            vec![Arc::new(LogSink), Arc::new(StoreSink::new(store.clone()))];
        if let Some(mqtt) = &config.mqtt {
            match MqttSink::connect(mqtt) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(err) => log::warn!("runtime: mqtt events disabled: {:#}", err),
            }
        }
        Self::with_services(config, store, Arc::new(FanoutSink::new(sinks)))
    }

    /// Build the runtime around an explicit store and event sink.
    pub fn with_services(
        config: NvrConfig,
        store: Arc<dyn RecordingStore>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        let shutdown = Arc::new(ShutdownCoordinator::new(config.shutdown_timeout));
        let streams = Arc::new(StreamRegistry::new(config.max_streams));
        for stream in &config.streams {
            streams.add(stream.clone())?;
        }
        let readers = ReaderRegistry::new(streams.clone(), shutdown.clone());
        let prebuffers = Arc::new(PreBufferPool::new(
            config.max_streams,
            config.prebuffer_mode,
            &config.storage_path,
        ));
        let recordings = Arc::new(RecordingTable::new(
            RecordingSettings {
                root: config.mp4_root(),
                segment_duration: config.mp4_segment_duration,
            },
            streams.clone(),
            prebuffers.clone(),
            store.clone(),
            events.clone(),
        ));
        let models = Arc::new(
            ModelCache::new(config.max_streams, &config.models_path, LoaderRegistry::with_builtin())
                .with_api_url(config.api_detection_url.clone()),
        );
        let detection = Arc::new(
            DetectionPipeline::new(models, config.concurrent_detections, events.clone())
                .with_trigger(recordings.clone()),
        );
        recordings.start_supervisor(shutdown.clone())?;
        log::info!(
            "runtime: {} streams configured, storage {}",
            streams.count(),
            config.storage_path.display()
        );

        Ok(Arc::new(Self {
            config,
            shutdown,
            streams,
            readers,
            prebuffers,
            detection,
            recordings,
            store,
            events,
            active: Mutex::new(HashMap::new()),
        }))
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, HashMap<String, ActiveStream>>> {
        self.active
            .lock()
            .map_err(|_| anyhow!("runtime stream table lock poisoned"))
    }

    fn state(&self, name: &str) -> Result<Arc<StreamState>> {
        self.streams
            .get(name)
            .ok_or_else(|| NvrError::config(format!("unknown stream '{}'", name)))
    }

    pub fn config(&self) -> &NvrConfig {
        &self.config
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn readers(&self) -> &ReaderRegistry {
        &self.readers
    }

    pub fn prebuffers(&self) -> &Arc<PreBufferPool> {
        &self.prebuffers
    }

    pub fn detection(&self) -> &Arc<DetectionPipeline> {
        &self.detection
    }

    pub fn recordings(&self) -> &Arc<RecordingTable> {
        &self.recordings
    }

    pub fn store(&self) -> &Arc<dyn RecordingStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Handle-based facade driving this runtime.
    pub fn adapter(self: &Arc<Self>) -> StreamAdapter {
        StreamAdapter::new(self.streams.clone(), self.clone())
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.lock_active().map(|a| a.contains_key(name)).unwrap_or(false)
    }

    pub fn active_streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock_active()
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// `<hls_root>/<stream>/index.m3u8` of a running stream with HLS output.
    pub fn hls_playlist(&self, name: &str) -> Option<PathBuf> {
        let active = self.lock_active().ok()?;
        active.get(name)?.hls.as_ref().map(|hls| hls.playlist_path())
    }

    /// Wait until the stream's reader has opened its input.
    pub fn wait_connected(&self, name: &str, timeout: Duration) -> bool {
        let reader = self
            .lock_active()
            .ok()
            .and_then(|a| a.get(name).and_then(|s| s.reader.clone()));
        reader.is_some_and(|r| r.wait_connected(timeout))
    }

    /// Start every configured stream. Failures park that stream in ERROR and
    /// do not stop the others. Returns how many started.
    pub fn start_all(&self) -> usize {
        let names: Vec<String> = self.streams.list().iter().map(|s| s.name().to_string()).collect();
        let mut started = 0;
        for name in names {
            match self.start_stream(&name) {
                Ok(()) => started += 1,
                Err(err) => log::error!("runtime: stream {} not started: {:#}", name, err),
            }
        }
        started
    }

    pub fn start_stream(&self, name: &str) -> Result<()> {
        let state = self.state(name)?;
        if self.shutdown.is_shutdown_initiated() {
            return Err(NvrError::ShutdownRaced(format!("stream {}: start during shutdown", name)).into());
        }
        let mut active = self.lock_active()?;
        if active.contains_key(name) {
            log::debug!("runtime: stream {} already running", name);
            return Ok(());
        }
        state.transition(StreamStatus::Starting)?;
        let mut entry = ActiveStream::default();
        if let Err(err) = self.launch(&state, &mut entry) {
            self.teardown(&state, entry, STOP_JOIN_TIMEOUT);
            state.set_error(format!("{:#}", err));
            return Err(err);
        }
        active.insert(name.to_string(), entry);
        Ok(())
    }

    fn launch(&self, state: &Arc<StreamState>, entry: &mut ActiveStream) -> Result<()> {
        let config = state.config()?;
        let name = config.name.as_str();
        let detection = config.wants_detection();
        if detection {
            self.detection.configure_stream(&config)?;
            self.prebuffers.acquire(name, config.fps, config.pre_roll_seconds)?;
            entry.worker = Some(Arc::new(DetectionWorker::spawn(
                name,
                self.detection.clone(),
                self.shutdown.clone(),
            )?));
        }
        if config.record {
            self.recordings.start_continuous(name)?;
        }

        // HLS managers exit while callbacks are off
        state.set_callbacks_enabled(true);
        if config.streaming_enabled || detection {
            let hls = HlsStream::start_recording_thread(HlsContext {
                state: state.clone(),
                output_dir: self.config.hls_root().join(name),
                list_size: self.config.hls_list_size,
                write_segments: config.streaming_enabled,
                shutdown: self.shutdown.clone(),
                detection: entry.worker.as_ref().map(|worker| HlsDetection {
                    pipeline: self.detection.clone(),
                    worker: worker.clone(),
                }),
            })?;
            entry.hls = Some(Arc::new(hls));
        }

        let callback = self.packet_callback(state, entry.hls.clone());
        let reader = self.readers.start_reader(name, false, Some(callback))?;
        if config.audio_enabled {
            self.readers.set_audio_callback(&reader, Some(self.audio_callback(state)));
        }
        entry.reader = Some(reader);
        log::info!(
            "runtime: stream {} started (hls {}, record {}, detection {})",
            name,
            config.streaming_enabled,
            config.record,
            detection
        );
        Ok(())
    }

    fn packet_callback(&self, state: &Arc<StreamState>, hls: Option<Arc<HlsStream>>) -> PacketCallback {
        let state = state.clone();
        let recordings = self.recordings.clone();
        Arc::new(move |packet: &Packet, info: &StreamInfo| -> Result<()> {
            if !state.callbacks_enabled() {
                return Ok(());
            }
            if let Some(hls) = &hls {
                hls.offer(packet, info);
            }
            recordings.on_packet(state.name(), packet, info)
        })
    }

    fn audio_callback(&self, state: &Arc<StreamState>) -> PacketCallback {
        let state = state.clone();
        let recordings = self.recordings.clone();
        Arc::new(move |packet: &Packet, info: &StreamInfo| -> Result<()> {
            if !state.callbacks_enabled() {
                return Ok(());
            }
            recordings.on_packet(state.name(), packet, info)
        })
    }

    /// Callbacks off, then reader, HLS, detection and recording in that order.
    fn teardown(&self, state: &StreamState, entry: ActiveStream, timeout: Duration) {
        let name = state.name();
        state.set_callbacks_enabled(false);
        if let Some(reader) = &entry.reader {
            self.readers.set_packet_callback(reader, None);
            self.readers.set_audio_callback(reader, None);
            if let Err(err) = self.readers.stop_reader_with_timeout(reader, timeout) {
                log::warn!("runtime: stream {}: {:#}", name, err);
            }
        }
        if let Some(hls) = &entry.hls {
            if let Err(err) = hls.stop_with_timeout(timeout) {
                log::warn!("runtime: stream {}: {:#}", name, err);
            }
        }
        if let Some(worker) = &entry.worker {
            if let Err(err) = worker.stop(timeout) {
                log::warn!("runtime: stream {}: {:#}", name, err);
            }
        }
        self.detection.remove_stream(name);
        if let Err(err) = self.recordings.stop_stream(name) {
            log::warn!("runtime: stream {}: {:#}", name, err);
        }
        match self.prebuffers.remove(name) {
            Ok(Some(stats)) => log::debug!("runtime: stream {} prebuffer released: {:?}", name, stats),
            Ok(None) => {}
            Err(err) => log::warn!("runtime: stream {}: {:#}", name, err),
        }
    }

    pub fn stop_stream(&self, name: &str) -> Result<()> {
        let state = self.state(name)?;
        let Some(entry) = self.lock_active()?.remove(name) else {
            return Ok(());
        };
        if let Err(err) = state.transition(StreamStatus::Stopping) {
            log::debug!("runtime: {:#}", err);
        }
        self.teardown(&state, entry, STOP_JOIN_TIMEOUT);
        if let Err(err) = state.transition(StreamStatus::Inactive) {
            log::debug!("runtime: {:#}", err);
        }
        log::info!("runtime: stream {} stopped", name);
        Ok(())
    }

    /// Toggle a feature. Recording changes apply live; the others restart a
    /// running stream.
    pub fn set_feature(&self, name: &str, feature: Feature, enabled: bool) -> Result<()> {
        let state = self.state(name)?;
        if !state.set_feature(feature, enabled)? || !self.is_active(name) {
            return Ok(());
        }
        match feature {
            Feature::Recording if enabled => self.recordings.start_continuous(name),
            Feature::Recording => self.recordings.stop_stream(name).map(|_| ()),
            _ => {
                self.stop_stream(name)?;
                self.start_stream(name)
            }
        }
    }

    pub fn health(&self) -> Vec<StreamHealth> {
        self.streams
            .list()
            .iter()
            .map(|state| {
                let stats = state.stats();
                StreamHealth {
                    name: state.name().to_string(),
                    status: state.status(),
                    fps: stats.fps,
                    frames_received: stats.frames_received,
                    frames_dropped: stats.frames_dropped,
                    errors: stats.errors,
                    recording: self.recordings.is_recording(state.name()),
                    last_error: state.last_error(),
                }
            })
            .collect()
    }

    /// Graceful stop of everything, highest priority first. Callbacks are
    /// cleared on every stream before any component is asked to stop.
    pub fn shutdown(&self) -> ShutdownReport {
        let entries: Vec<(String, ActiveStream)> = match self.lock_active() {
            Ok(mut active) => active.drain().collect(),
            Err(err) => {
                log::error!("runtime: {}", err);
                Vec::new()
            }
        };
        for (name, entry) in &entries {
            if let Some(state) = self.streams.get(name) {
                state.set_callbacks_enabled(false);
                if let Err(err) = state.transition(StreamStatus::Stopping) {
                    log::debug!("runtime: {:#}", err);
                }
            }
            if let Some(reader) = &entry.reader {
                self.readers.set_packet_callback(reader, None);
                self.readers.set_audio_callback(reader, None);
            }
        }

        let report = self.shutdown.shutdown();

        for (name, entry) in entries {
            let Some(state) = self.streams.get(&name) else {
                continue;
            };
            self.teardown(&state, entry, SHUTDOWN_JOIN_TIMEOUT);
            if let Err(err) = state.transition(StreamStatus::Inactive) {
                log::debug!("runtime: {:#}", err);
            }
        }
        self.readers.stop_all(SHUTDOWN_JOIN_TIMEOUT);
        if let Err(err) = self.recordings.stop_supervisor(SHUTDOWN_JOIN_TIMEOUT) {
            log::warn!("runtime: {:#}", err);
        }
        self.detection.shutdown();
        log::info!("runtime: shutdown complete");
        report
    }
}

impl StreamController for Runtime {
    fn start_stream(&self, name: &str) -> Result<()> {
        Runtime::start_stream(self, name)
    }

    fn stop_stream(&self, name: &str) -> Result<()> {
        Runtime::stop_stream(self, name)
    }

    fn set_stream_feature(&self, name: &str, feature: Feature, enabled: bool) -> Result<()> {
        self.set_feature(name, feature, enabled)
    }
}
