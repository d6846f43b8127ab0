//! Live HLS output per stream.
//!
//! Each stream gets a manager thread and a worker thread. The reader's packet
//! fan-out calls [`HlsStream::offer`], which queues a clone of the packet for
//! the worker. The worker writes segments and, when detection is on, decodes
//! sampled frames for the detection worker.
//!
//! The manager ticks every 500 ms. It stops on global shutdown, when the
//! stream enters STOPPING, when the stream's callbacks are disabled, or when
//! asked to; a worker that died while the manager still runs is restarted.
//! On stop the manager takes the writer out of the shared slot before it
//! closes it, so nothing else can close or write it again.

mod worker;
pub mod writer;

pub use writer::{effective_segment_duration, ensure_writable_dir, HlsWriter, SegmentEntry, PLAYLIST_NAME};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::detect::{DetectionPipeline, DetectionWorker};
use crate::media::{Packet, StreamInfo};
use crate::shutdown::{
    join_with_timeout, ComponentId, ComponentKind, ComponentState, ShutdownCoordinator,
    STOP_JOIN_TIMEOUT,
};
use crate::state::{StreamState, StreamStatus};

use self::worker::QueuedPacket;

const HLS_PRIORITY: u8 = 60;
const MANAGER_TICK: Duration = Duration::from_millis(500);
const TICK_SLICE: Duration = Duration::from_millis(25);
const WORKER_EXIT_GRACE: Duration = Duration::from_millis(100);
const PACKET_QUEUE: usize = 256;

/// Create a writer for `stream_name` under `output_dir`.
pub fn hls_writer_create(output_dir: &Path, stream_name: &str, segment_duration: i32) -> Result<HlsWriter> {
    HlsWriter::create(output_dir, stream_name, segment_duration, crate::config::DEFAULT_HLS_LIST_SIZE)
}

/// Detection hookup for the worker's frame sampler.
pub struct HlsDetection {
    pub pipeline: Arc<DetectionPipeline>,
    pub worker: Arc<DetectionWorker>,
}

/// Everything a stream's HLS threads need.
pub struct HlsContext {
    pub state: Arc<StreamState>,
    /// `<hls_root>/<stream>`
    pub output_dir: PathBuf,
    pub list_size: usize,
    /// Write segments. When false the worker only samples frames for detection.
    pub write_segments: bool,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub detection: Option<HlsDetection>,
}

pub(crate) struct HlsShared {
    stream: String,
    url: String,
    segment_duration: i32,
    output_dir: PathBuf,
    list_size: usize,
    write_segments: bool,
    state: Arc<StreamState>,
    shutdown: Arc<ShutdownCoordinator>,
    detection: Option<HlsDetection>,
    running: AtomicBool,
    writer: Mutex<Option<HlsWriter>>,
    sender: Mutex<Option<SyncSender<QueuedPacket>>>,
    queued: AtomicU64,
    dropped: AtomicU64,
    restarts: AtomicU64,
}

impl HlsShared {
    fn should_stop(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
            || self.shutdown.is_shutdown_initiated()
            || self.state.status() == StreamStatus::Stopping
            || !self.state.callbacks_enabled()
    }

    /// Fresh queue and worker thread.
    fn start_worker(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let (sender, receiver) = mpsc::sync_channel(PACKET_QUEUE);
        *self
            .sender
            .lock()
            .map_err(|_| anyhow!("hls {} sender lock poisoned", self.stream))? = Some(sender);
        worker::spawn(self.clone(), receiver)
    }

    fn close_queue(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    fn sleep_tick(&self) {
        let deadline = Instant::now() + MANAGER_TICK;
        while Instant::now() < deadline && !self.should_stop() {
            std::thread::sleep(TICK_SLICE);
        }
    }
}

/// HLS output of one stream: manager thread, worker thread, shared writer.
pub struct HlsStream {
    shared: Arc<HlsShared>,
    manager: Mutex<Option<JoinHandle<()>>>,
    component: ComponentId,
}

impl HlsStream {
    /// Start the manager, which opens the writer and starts the worker.
    pub fn start_recording_thread(ctx: HlsContext) -> Result<Self> {
        let config = ctx.state.config()?;
        let shared = Arc::new(HlsShared {
            stream: config.name.clone(),
            url: config.url.clone(),
            segment_duration: config.segment_duration,
            output_dir: ctx.output_dir,
            list_size: ctx.list_size,
            write_segments: ctx.write_segments,
            state: ctx.state,
            shutdown: ctx.shutdown.clone(),
            detection: ctx.detection,
            running: AtomicBool::new(true),
            writer: Mutex::new(None),
            sender: Mutex::new(None),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        });

        let hook_shared = shared.clone();
        let component = ctx.shutdown.register(
            &format!("hls {}", config.name),
            ComponentKind::HlsWriter,
            HLS_PRIORITY,
            Some(Arc::new(move || {
                hook_shared.running.store(false, Ordering::SeqCst);
            })),
        )?;

        let thread_shared = shared.clone();
        let manager = std::thread::Builder::new()
            .name(format!("hls-{}", config.name))
            .spawn(move || {
                if let Err(err) = manager_loop(&thread_shared, component) {
                    thread_shared.state.set_error(format!("hls: {:#}", err));
                }
                thread_shared.shutdown.update_state(component, ComponentState::Stopped);
            })
            .with_context(|| format!("spawn hls manager for {}", config.name))?;

        Ok(Self {
            shared,
            manager: Mutex::new(Some(manager)),
            component,
        })
    }

    pub fn stream(&self) -> &str {
        &self.shared.stream
    }

    /// Queue a clone of `packet` for the worker. A full queue drops the
    /// packet and counts it against the stream.
    pub fn offer(&self, packet: &Packet, info: &StreamInfo) -> bool {
        let Ok(sender) = self.shared.sender.lock() else {
            return false;
        };
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        match sender.try_send((packet.clone(), info.clone())) {
            Ok(()) => {
                self.shared.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                self.shared.state.record_drop();
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Manager alive and not asked to stop.
    pub fn is_recording(&self) -> bool {
        let alive = self
            .manager
            .lock()
            .map(|m| m.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false);
        alive && self.shared.running.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }

    /// `(queued, dropped)` packet counts.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.shared.queued.load(Ordering::Relaxed),
            self.shared.dropped.load(Ordering::Relaxed),
        )
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.shared.output_dir.join(PLAYLIST_NAME)
    }

    /// Stop the manager (which stops the worker and closes the writer) and
    /// join it. Idempotent.
    pub fn stop_recording_thread(&self) -> Result<()> {
        self.stop_with_timeout(STOP_JOIN_TIMEOUT)
    }

    pub fn stop_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        let manager = self
            .manager
            .lock()
            .map_err(|_| anyhow!("hls {} manager lock poisoned", self.shared.stream))?
            .take();
        if let Some(manager) = manager {
            join_with_timeout(manager, timeout, &format!("hls {}", self.shared.stream));
        }
        self.shared.shutdown.unregister(self.component);
        Ok(())
    }
}

fn manager_loop(shared: &Arc<HlsShared>, component: ComponentId) -> Result<()> {
    if shared.write_segments {
        let writer = HlsWriter::create(
            &shared.output_dir,
            &shared.stream,
            shared.segment_duration,
            shared.list_size,
        )?;
        *shared
            .writer
            .lock()
            .map_err(|_| anyhow!("hls {} writer lock poisoned", shared.stream))? = Some(writer);
    }
    let mut worker = shared.start_worker()?;
    shared.shutdown.update_state(component, ComponentState::Started);
    log::info!("hls {}: recording thread started", shared.stream);

    while !shared.should_stop() {
        shared.sleep_tick();
        if shared.should_stop() {
            break;
        }
        if worker.is_finished() {
            shared.restarts.fetch_add(1, Ordering::Relaxed);
            log::warn!("hls {}: worker died; restarting", shared.stream);
            if worker.join().is_err() {
                log::error!("hls {}: worker panicked", shared.stream);
            }
            worker = shared.start_worker()?;
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    shared.shutdown.update_state(component, ComponentState::Stopping);
    shared.close_queue();
    let writer = shared.writer.lock().ok().and_then(|mut slot| slot.take());
    std::thread::sleep(WORKER_EXIT_GRACE);
    join_with_timeout(worker, STOP_JOIN_TIMEOUT, &format!("hls worker {}", shared.stream));
    if let Some(mut writer) = writer {
        writer.close()?;
    }
    log::info!("hls {}: recording thread stopped", shared.stream);
    Ok(())
}
