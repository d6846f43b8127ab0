//! Open MP4 recordings, one per stream.
//!
//! Continuous streams get a writer at start that rotates on the first video
//! keyframe past the segment length. Detection streams get a writer on the
//! first hit: the pre-buffer is flushed into it and it stays open until the
//! post-roll deadline, which every further hit pushes out.
//!
//! All writers and the per-stream recording data sit behind one lock. Packets
//! are pushed to the pre-buffer and written under that same lock, so a flush
//! never races a live write of the same packet.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::detect::{DetectionResult, DetectionTrigger};
use crate::error::NvrError;
use crate::media::{MediaKind, Packet, StreamInfo};
use crate::prebuffer::PreBufferPool;
use crate::shutdown::{join_with_timeout, ComponentKind, ComponentState, ShutdownCoordinator};
use crate::state::StreamRegistry;

use super::events::{Event, EventKind, EventSink};
use super::store::{Recording, RecordingStore};
use super::writer::{Mp4CloseSummary, Mp4Writer};

const RECORDING_PRIORITY: u8 = 30;
const SUPERVISOR_TICK: Duration = Duration::from_millis(500);
const TICK_SLICE: Duration = Duration::from_millis(25);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingMode {
    Continuous,
    /// Open until the post-roll deadline.
    Detection { until: Instant },
}

impl RecordingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordingMode::Continuous => "continuous",
            RecordingMode::Detection { .. } => "detection",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecordingSettings {
    /// `<mp4_root>`; files land in `<mp4_root>/<stream>/`.
    pub root: PathBuf,
    /// Continuous files rotate after this long.
    pub segment_duration: Duration,
}

struct Slot {
    writer: Mp4Writer,
    mode: RecordingMode,
    opened_at: Instant,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    continuous: HashSet<String>,
    /// Stream tables seen on each stream's packets, by stream index.
    infos: HashMap<String, Vec<StreamInfo>>,
}

impl Inner {
    fn remember(&mut self, stream: &str, info: &StreamInfo) {
        let infos = self.infos.entry(stream.to_string()).or_default();
        if infos.iter().any(|i| i.index == info.index) {
            return;
        }
        infos.push(info.clone());
    }
}

fn info_for<'a>(infos: Option<&'a Vec<StreamInfo>>, index: usize) -> Option<&'a StreamInfo> {
    infos?.iter().find(|i| i.index == index)
}

pub struct RecordingTable {
    settings: RecordingSettings,
    streams: Arc<StreamRegistry>,
    prebuffers: Arc<PreBufferPool>,
    store: Arc<dyn RecordingStore>,
    events: Arc<dyn EventSink>,
    inner: Mutex<Inner>,
    running: Arc<AtomicBool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RecordingTable {
    pub fn new(
        settings: RecordingSettings,
        streams: Arc<StreamRegistry>,
        prebuffers: Arc<PreBufferPool>,
        store: Arc<dyn RecordingStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            settings,
            streams,
            prebuffers,
            store,
            events,
            inner: Mutex::new(Inner::default()),
            running: Arc::new(AtomicBool::new(false)),
            supervisor: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("recording table lock poisoned"))
    }

    pub fn store(&self) -> &Arc<dyn RecordingStore> {
        &self.store
    }

    pub fn is_recording(&self, stream: &str) -> bool {
        self.lock().map(|inner| inner.slots.contains_key(stream)).unwrap_or(false)
    }

    pub fn mode(&self, stream: &str) -> Option<RecordingMode> {
        self.lock().ok()?.slots.get(stream).map(|s| s.mode)
    }

    /// Path of the file `stream` is currently recording to.
    pub fn current_path(&self, stream: &str) -> Option<PathBuf> {
        let inner = self.lock().ok()?;
        inner.slots.get(stream).map(|s| s.writer.path().to_path_buf())
    }

    pub fn active_count(&self) -> usize {
        self.lock().map(|inner| inner.slots.len()).unwrap_or(0)
    }

    fn file_path(&self, stream: &str) -> PathBuf {
        let dir = self.settings.root.join(stream);
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut path = dir.join(format!("recording_{}.mp4", stamp));
        let mut n = 1;
        while path.exists() {
            path = dir.join(format!("recording_{}_{}.mp4", stamp, n));
            n += 1;
        }
        path
    }

    fn open_slot(&self, stream: &str, mode: RecordingMode) -> Result<Slot> {
        let path = self.file_path(stream);
        let row = Recording {
            stream_name: stream.to_string(),
            file_path: path.to_string_lossy().into_owned(),
            start_time: chrono::Utc::now().timestamp(),
            ..Default::default()
        };
        if let Err(err) = self.store.add_recording(&row) {
            log::warn!("recording {}: store row not added: {:#}", stream, err);
        }
        let event = Event::new(EventKind::RecordingStart, stream, format!("{} recording started", mode.as_str()))
            .with_file(row.file_path.clone());
        if let Err(err) = self.events.publish(&event) {
            log::warn!("recording {}: start event: {:#}", stream, err);
        }
        log::info!("recording {}: opened {}", stream, path.display());
        Ok(Slot {
            writer: Mp4Writer::new(&path, stream).with_store(self.store.clone()),
            mode,
            opened_at: Instant::now(),
        })
    }

    fn finish_slot(&self, stream: &str, mut slot: Slot) -> Option<Mp4CloseSummary> {
        let summary = match slot.writer.close() {
            Ok(summary) => summary,
            Err(err) => {
                log::error!("recording {}: close failed: {:#}", stream, err);
                return None;
            }
        };
        let event = Event::new(
            EventKind::RecordingStop,
            stream,
            format!("recording stopped ({} bytes)", summary.size_bytes),
        )
        .with_file(summary.path.to_string_lossy().into_owned());
        if let Err(err) = self.events.publish(&event) {
            log::warn!("recording {}: stop event: {:#}", stream, err);
        }
        Some(summary)
    }

    /// Record `stream` continuously until [`RecordingTable::stop_stream`].
    pub fn start_continuous(&self, stream: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.continuous.insert(stream.to_string());
        match inner.slots.get_mut(stream) {
            Some(slot) => slot.mode = RecordingMode::Continuous,
            None => {
                let slot = self.open_slot(stream, RecordingMode::Continuous)?;
                inner.slots.insert(stream.to_string(), slot);
            }
        }
        Ok(())
    }

    /// Close whatever `stream` is recording and forget its stream table.
    pub fn stop_stream(&self, stream: &str) -> Result<Option<Mp4CloseSummary>> {
        let slot = {
            let mut inner = self.lock()?;
            inner.continuous.remove(stream);
            inner.infos.remove(stream);
            inner.slots.remove(stream)
        };
        Ok(slot.and_then(|slot| self.finish_slot(stream, slot)))
    }

    /// Packet fan-out entry: pre-buffer, then the open writer if any.
    pub fn on_packet(&self, stream: &str, packet: &Packet, info: &StreamInfo) -> Result<()> {
        let mut inner = self.lock()?;
        inner.remember(stream, info);
        if let Some(buffer) = self.prebuffers.get(stream) {
            buffer
                .lock()
                .map_err(|_| NvrError::ShutdownRaced(format!("prebuffer {} lock poisoned", stream)))?
                .push(packet);
        }

        if !inner.slots.contains_key(stream) && inner.continuous.contains(stream) {
            let slot = self.open_slot(stream, RecordingMode::Continuous)?;
            inner.slots.insert(stream.to_string(), slot);
        }
        let rotate = inner.slots.get(stream).is_some_and(|slot| {
            slot.mode == RecordingMode::Continuous
                && info.kind == MediaKind::Video
                && packet.is_keyframe
                && slot.writer.is_initialized()
                && slot.opened_at.elapsed() >= self.settings.segment_duration
        });
        if rotate {
            if let Some(old) = inner.slots.remove(stream) {
                log::info!("recording {}: rotating after {:?}", stream, old.opened_at.elapsed());
                self.finish_slot(stream, old);
            }
            let slot = self.open_slot(stream, RecordingMode::Continuous)?;
            inner.slots.insert(stream.to_string(), slot);
        }

        let Some(slot) = inner.slots.get_mut(stream) else {
            return Ok(());
        };
        // audio waits for the video keyframe so track 0 carries the real SPS
        if info.kind == MediaKind::Audio && !slot.writer.is_initialized() {
            return Ok(());
        }
        if let Err(err) = slot.writer.write_packet(packet, info) {
            if slot.writer.is_failed() {
                log::error!("recording {}: writer failed; file abandoned", stream);
                if let Some(failed) = inner.slots.remove(stream) {
                    self.finish_slot(stream, failed);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Close detection recordings whose post-roll ended before `now`.
    pub fn expire(&self, now: Instant) -> Vec<Mp4CloseSummary> {
        let expired: Vec<(String, Slot)> = match self.lock() {
            Ok(mut inner) => {
                let names: Vec<String> = inner
                    .slots
                    .iter()
                    .filter(|(_, s)| matches!(s.mode, RecordingMode::Detection { until } if until <= now))
                    .map(|(name, _)| name.clone())
                    .collect();
                names
                    .into_iter()
                    .filter_map(|name| inner.slots.remove(&name).map(|slot| (name, slot)))
                    .collect()
            }
            Err(err) => {
                log::error!("recording: {}", err);
                return Vec::new();
            }
        };
        expired
            .into_iter()
            .filter_map(|(name, slot)| {
                log::info!("recording {}: post-roll elapsed", name);
                self.finish_slot(&name, slot)
            })
            .collect()
    }

    /// Close every open writer. The table lock is taken once.
    pub fn close_all(&self) -> Vec<Mp4CloseSummary> {
        let slots: Vec<(String, Slot)> = match self.lock() {
            Ok(mut inner) => {
                inner.continuous.clear();
                inner.slots.drain().collect()
            }
            Err(err) => {
                log::error!("recording: {}", err);
                return Vec::new();
            }
        };
        if !slots.is_empty() {
            log::info!("recording: closing {} open files", slots.len());
        }
        slots
            .into_iter()
            .filter_map(|(name, slot)| self.finish_slot(&name, slot))
            .collect()
    }

    /// Spawn the 500 ms post-roll supervisor and register it for shutdown.
    /// Open files are closed when it exits.
    pub fn start_supervisor(self: &Arc<Self>, shutdown: Arc<ShutdownCoordinator>) -> Result<()> {
        let mut slot = self
            .supervisor
            .lock()
            .map_err(|_| anyhow!("recording supervisor lock poisoned"))?;
        if slot.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        let hook_running = self.running.clone();
        let component = shutdown.register(
            "recording supervisor",
            ComponentKind::Recording,
            RECORDING_PRIORITY,
            Some(Arc::new(move || hook_running.store(false, Ordering::SeqCst))),
        )?;
        let table = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("recording-supervisor".to_string())
            .spawn(move || {
                table.supervise(&shutdown);
                table.close_all();
                shutdown.update_state(component, ComponentState::Stopped);
                log::debug!("recording: supervisor exit");
            })
            .context("spawn recording supervisor")?;
        *slot = Some(handle);
        Ok(())
    }

    fn supervise(&self, shutdown: &ShutdownCoordinator) {
        let mut next_tick = Instant::now() + SUPERVISOR_TICK;
        while self.running.load(Ordering::SeqCst) && !shutdown.is_shutdown_initiated() {
            if Instant::now() < next_tick {
                std::thread::sleep(TICK_SLICE);
                continue;
            }
            next_tick += SUPERVISOR_TICK;
            self.expire(Instant::now());
        }
    }

    /// Stop the supervisor thread, closing every open file.
    pub fn stop_supervisor(&self, timeout: Duration) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        let handle = self
            .supervisor
            .lock()
            .map_err(|_| anyhow!("recording supervisor lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            join_with_timeout(handle, timeout, "recording supervisor");
        }
        self.close_all();
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.settings.root
    }
}

impl DetectionTrigger for RecordingTable {
    fn trigger(&self, stream: &str, result: &DetectionResult) -> Result<()> {
        let state = self
            .streams
            .get(stream)
            .ok_or_else(|| NvrError::config(format!("recording {}: unknown stream", stream)))?;
        let post_roll = Duration::from_secs(state.config()?.post_roll_seconds as u64);
        let until = Instant::now() + post_roll;

        let mut inner = self.lock()?;
        if let Some(slot) = inner.slots.get_mut(stream) {
            if let RecordingMode::Detection { until: current } = &mut slot.mode {
                *current = (*current).max(until);
                log::debug!("recording {}: post-roll extended", stream);
            }
            return Ok(());
        }

        let mut slot = self.open_slot(stream, RecordingMode::Detection { until })?;
        log::info!(
            "recording {}: triggered by {} detections",
            stream,
            result.detections.len()
        );
        if let Some(buffer) = self.prebuffers.get(stream) {
            let infos = inner.infos.get(stream);
            let mut buffer = buffer
                .lock()
                .map_err(|_| NvrError::ShutdownRaced(format!("prebuffer {} lock poisoned", stream)))?;
            let writer = &mut slot.writer;
            let written = buffer.flush(|packet| {
                let info = info_for(infos, packet.stream_index)
                    .ok_or_else(|| anyhow!("no stream #{} for {}", packet.stream_index, stream))?;
                if info.kind == MediaKind::Audio && !writer.is_initialized() {
                    return Ok(());
                }
                writer.write_packet(packet, info).map(|_| ())
            });
            log::info!("recording {}: {} pre-roll packets written", stream, written);
        }
        inner.slots.insert(stream.to_string(), slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::media::mp4::inspect::read_summary;
    use crate::media::{open_input, Demuxer, Interrupter, Protocol, ReadEvent};
    use crate::prebuffer::BufferMode;
    use crate::recording::events::MemorySink;
    use crate::recording::store::MemoryStore;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        table: Arc<RecordingTable>,
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        prebuffers: Arc<PreBufferPool>,
    }

    fn fixture(config: StreamConfig, segment: Duration) -> Fixture {
        let dir = tempdir().unwrap();
        let streams = Arc::new(StreamRegistry::new(4));
        streams.add(config).unwrap();
        let prebuffers = Arc::new(PreBufferPool::new(4, BufferMode::Memory, dir.path()));
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let table = Arc::new(RecordingTable::new(
            RecordingSettings {
                root: dir.path().join("mp4"),
                segment_duration: segment,
            },
            streams,
            prebuffers.clone(),
            store.clone(),
            sink.clone(),
        ));
        Fixture {
            _dir: dir,
            table,
            store,
            sink,
            prebuffers,
        }
    }

    fn feed(table: &RecordingTable, source: &mut Box<dyn Demuxer>, count: usize) {
        let streams = source.streams().to_vec();
        let mut fed = 0;
        while fed < count {
            if let ReadEvent::Packet(packet) = source.read().unwrap() {
                let info = &streams[packet.stream_index];
                table.on_packet("cam1", &packet, info).unwrap();
                fed += 1;
            }
        }
    }

    #[test]
    fn continuous_recording_closes_complete() {
        let fx = fixture(StreamConfig::new("cam1", "stub://cam1").with_recording(true), Duration::from_secs(900));
        let mut source = open_input("stub://cam1?fps=10&speed=0", Protocol::Tcp, &Interrupter::new()).unwrap();
        fx.table.start_continuous("cam1").unwrap();
        assert_eq!(fx.table.mode("cam1"), Some(RecordingMode::Continuous));
        feed(&fx.table, &mut source, 30);
        let path = fx.table.current_path("cam1").unwrap();
        assert!(path.starts_with(fx.table.root().join("cam1")));

        let summary = fx.table.stop_stream("cam1").unwrap().unwrap();
        assert_eq!(summary.video_packets, 30);
        let rows = fx.store.list_recordings(Some("cam1")).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_complete);
        assert_eq!(fx.sink.count(EventKind::RecordingStart), 1);
        assert_eq!(fx.sink.count(EventKind::RecordingStop), 1);
        assert!(!fx.table.is_recording("cam1"));
    }

    #[test]
    fn continuous_rotates_on_keyframes() {
        let fx = fixture(StreamConfig::new("cam1", "stub://cam1").with_recording(true), Duration::ZERO);
        let mut source = open_input("stub://cam1?fps=10&gop=10&speed=0", Protocol::Tcp, &Interrupter::new()).unwrap();
        fx.table.start_continuous("cam1").unwrap();
        feed(&fx.table, &mut source, 30);
        fx.table.close_all();
        // keyframes at 0, 10 and 20: two rotations
        assert_eq!(fx.sink.count(EventKind::RecordingStop), 3);
        let files: Vec<_> = std::fs::read_dir(fx.table.root().join("cam1")).unwrap().collect();
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn trigger_flushes_pre_roll_and_expires() {
        let mut config = StreamConfig::new("cam1", "stub://cam1").with_detection("motion", 1);
        config.pre_roll_seconds = 2;
        config.post_roll_seconds = 1;
        let fx = fixture(config, Duration::from_secs(900));
        fx.prebuffers.acquire("cam1", 10, 2).unwrap();
        let mut source = open_input("stub://cam1?fps=10&speed=0", Protocol::Tcp, &Interrupter::new()).unwrap();
        feed(&fx.table, &mut source, 50);
        assert!(!fx.table.is_recording("cam1"));

        fx.table.trigger("cam1", &DetectionResult::motion(0.9)).unwrap();
        assert!(fx.table.is_recording("cam1"));
        let path = fx.table.current_path("cam1").unwrap();
        assert!(fx.prebuffers.get("cam1").unwrap().lock().unwrap().is_empty());
        feed(&fx.table, &mut source, 5);
        fx.table.trigger("cam1", &DetectionResult::motion(0.8)).unwrap();

        assert!(fx.table.expire(Instant::now()).is_empty());
        let closed = fx.table.expire(Instant::now() + Duration::from_secs(5));
        assert_eq!(closed.len(), 1);
        assert!(!fx.table.is_recording("cam1"));

        // the 24-packet ring holds frames 26..49; writing starts at keyframe 30
        let track = &read_summary(&path).unwrap().tracks[0];
        assert_eq!(track.dts.len(), 20 + 5);
        assert_eq!(track.sync_samples.first(), Some(&1));
    }

    #[test]
    fn close_all_empties_the_table() {
        let fx = fixture(StreamConfig::new("cam1", "stub://cam1"), Duration::from_secs(900));
        fx.table.start_continuous("cam1").unwrap();
        let mut source = open_input("stub://cam1?fps=10&speed=0", Protocol::Tcp, &Interrupter::new()).unwrap();
        feed(&fx.table, &mut source, 12);
        let closed = fx.table.close_all();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].size_bytes > 1024);
        assert_eq!(fx.table.active_count(), 0);
        feed(&fx.table, &mut source, 5);
        assert_eq!(fx.table.active_count(), 0);
    }

    #[test]
    fn supervisor_closes_on_shutdown() {
        let fx = fixture(StreamConfig::new("cam1", "stub://cam1"), Duration::from_secs(900));
        let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_secs(3)));
        fx.table.start_supervisor(shutdown.clone()).unwrap();
        fx.table.start_continuous("cam1").unwrap();
        let mut source = open_input("stub://cam1?fps=10&speed=0", Protocol::Tcp, &Interrupter::new()).unwrap();
        feed(&fx.table, &mut source, 12);
        let report = shutdown.shutdown();
        assert_eq!(report.stopped, vec!["recording supervisor".to_string()]);
        assert_eq!(fx.table.active_count(), 0);
        assert!(fx.store.list_recordings(Some("cam1")).unwrap()[0].is_complete);
    }
}
