//! Stream readers.
//!
//! One thread per reader opens the input, repairs timestamps and hands every
//! video packet, in source order, to the registered callback. Audio packets go
//! to a separate hook so the MP4 side can pick them up.
//!
//! Stop ordering: the callback slots are cleared first, then `running` drops,
//! then the demuxer's interrupter trips so a blocked read returns, then the
//! context leaves the registry, then the thread is joined. Once
//! [`ReaderRegistry::stop_reader`] returns after a successful join the
//! callback is never invoked again.

pub mod backoff;
pub mod timestamps;

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;

use crate::error::NvrError;
use crate::media::{
    find_video_stream, open_input, Demuxer, Interrupter, MediaKind, Packet, Protocol, ReadEvent,
    StreamInfo,
};
use crate::shutdown::{
    join_with_timeout, ComponentId, ComponentKind, ComponentState, ShutdownCoordinator,
    STOP_JOIN_TIMEOUT,
};
use crate::state::{StreamRegistry, StreamState, StreamStatus};

use backoff::{Backoff, Stall, StallAction};
use timestamps::{StreamTimestamps, TimestampTracker};

pub const CONNECT_ATTEMPTS: u32 = 5;
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);
const IDLE_POLL: Duration = Duration::from_millis(5);
const READER_PRIORITY: u8 = 80;

/// Receives one packet plus the codec parameters of its stream.
pub type PacketCallback = Arc<dyn Fn(&Packet, &StreamInfo) -> Result<()> + Send + Sync>;

type CallbackCell = ArcSwap<Option<PacketCallback>>;

fn empty_cell() -> CallbackCell {
    ArcSwap::from_pointee(None)
}

/// Shared between the reader thread and its controllers.
pub struct ReaderContext {
    name: String,
    url: String,
    protocol: Protocol,
    dedicated: bool,
    running: AtomicBool,
    connected: AtomicBool,
    callback: CallbackCell,
    audio_callback: CallbackCell,
    interrupter: Interrupter,
    streams: Mutex<Vec<StreamInfo>>,
    delivered: AtomicU64,
}

impl ReaderContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Video packets handed to a callback so far.
    pub fn packets_delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Stream table of the current input; empty until connected.
    pub fn streams(&self) -> Vec<StreamInfo> {
        self.streams.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn set_callback(&self, callback: Option<PacketCallback>) {
        self.callback.store(Arc::new(callback));
        fence(Ordering::SeqCst);
    }

    fn set_audio_callback(&self, callback: Option<PacketCallback>) {
        self.audio_callback.store(Arc::new(callback));
        fence(Ordering::SeqCst);
    }

    /// Steps one to three of the stop ordering. Never blocks.
    fn request_stop(&self) {
        self.set_callback(None);
        self.set_audio_callback(None);
        self.running.store(false, Ordering::SeqCst);
        self.interrupter.trip();
    }

    fn sleep_while_running(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }
}

pub struct ReaderHandle {
    id: u64,
    ctx: Arc<ReaderContext>,
    join: Mutex<Option<JoinHandle<()>>>,
    component: Option<ComponentId>,
}

impl ReaderHandle {
    pub fn context(&self) -> &ReaderContext {
        &self.ctx
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Poll until the input is open, the reader exits, or `timeout` passes.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.ctx.is_connected() {
                return true;
            }
            if !self.ctx.is_running() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.ctx.is_connected()
    }
}

/// Every live reader context.
pub struct ReaderRegistry {
    readers: Mutex<Vec<Arc<ReaderHandle>>>,
    streams: Arc<StreamRegistry>,
    timestamps: Arc<TimestampTracker>,
    shutdown: Arc<ShutdownCoordinator>,
    next_id: AtomicU64,
}

impl ReaderRegistry {
    pub fn new(streams: Arc<StreamRegistry>, shutdown: Arc<ShutdownCoordinator>) -> Self {
        Self {
            readers: Mutex::new(Vec::new()),
            streams,
            timestamps: Arc::new(TimestampTracker::new()),
            shutdown,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Arc<ReaderHandle>>>> {
        self.readers
            .lock()
            .map_err(|_| anyhow!("reader table lock poisoned"))
    }

    /// Start (or, for a shared reader, reuse) the reader of `name`.
    ///
    /// A non-dedicated reader is unique per stream: a second call returns the
    /// running one and installs `callback` on it. Dedicated readers always get
    /// their own input.
    pub fn start_reader(
        &self,
        name: &str,
        dedicated: bool,
        callback: Option<PacketCallback>,
    ) -> Result<Arc<ReaderHandle>> {
        let state = self
            .streams
            .get(name)
            .ok_or_else(|| NvrError::config(format!("unknown stream '{}'", name)))?;
        let config = state.config()?;

        let mut readers = self.lock()?;
        if !dedicated {
            if let Some(existing) = readers
                .iter()
                .find(|r| r.ctx.name == name && !r.ctx.dedicated && r.ctx.is_running())
            {
                if callback.is_some() {
                    existing.ctx.set_callback(callback);
                }
                return Ok(existing.clone());
            }
        }

        let ctx = Arc::new(ReaderContext {
            name: name.to_string(),
            url: config.url.clone(),
            protocol: config.protocol,
            dedicated,
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            callback: empty_cell(),
            audio_callback: empty_cell(),
            interrupter: Interrupter::new(),
            streams: Mutex::new(Vec::new()),
            delivered: AtomicU64::new(0),
        });
        ctx.set_callback(callback);

        let component = if dedicated {
            None
        } else {
            let hook_ctx = ctx.clone();
            Some(self.shutdown.register(
                &format!("reader {}", name),
                ComponentKind::Reader,
                READER_PRIORITY,
                Some(Arc::new(move || hook_ctx.request_stop())),
            )?)
        };

        let thread_ctx = ctx.clone();
        let tracker = self.timestamps.clone();
        let shutdown = self.shutdown.clone();
        let join = std::thread::Builder::new()
            .name(format!("reader-{}", name))
            .spawn(move || {
                reader_thread(&thread_ctx, &state, &tracker, &shutdown);
                if let Some(id) = component {
                    shutdown.update_state(id, ComponentState::Stopped);
                }
            })
            .with_context(|| format!("spawn reader thread for {}", name))?;
        if let Some(id) = component {
            self.shutdown.update_state(id, ComponentState::Started);
        }

        let handle = Arc::new(ReaderHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            ctx,
            join: Mutex::new(Some(join)),
            component,
        });
        readers.push(handle.clone());
        log::info!(
            "reader {}: started ({}{})",
            name,
            config.protocol,
            if dedicated { ", dedicated" } else { "" }
        );
        Ok(handle)
    }

    /// Swap the video callback. `None` clears it; the clear is visible before
    /// any later stop.
    pub fn set_packet_callback(&self, handle: &ReaderHandle, callback: Option<PacketCallback>) {
        handle.ctx.set_callback(callback);
    }

    pub fn set_audio_callback(&self, handle: &ReaderHandle, callback: Option<PacketCallback>) {
        handle.ctx.set_audio_callback(callback);
    }

    /// Stop with the normal 5 s join budget.
    pub fn stop_reader(&self, handle: &ReaderHandle) -> Result<()> {
        self.stop_reader_with_timeout(handle, STOP_JOIN_TIMEOUT)
    }

    /// Idempotent. Returns once the thread is joined or `timeout` elapsed.
    pub fn stop_reader_with_timeout(&self, handle: &ReaderHandle, timeout: Duration) -> Result<()> {
        handle.ctx.request_stop();
        {
            let mut readers = self.lock()?;
            readers.retain(|r| r.id != handle.id);
        }
        let join = handle
            .join
            .lock()
            .map_err(|_| anyhow!("reader {} join lock poisoned", handle.ctx.name))?
            .take();
        if let Some(join) = join {
            let what = format!("reader {}", handle.ctx.name);
            if join_with_timeout(join, timeout, &what) {
                log::info!("reader {}: stopped", handle.ctx.name);
            }
        }
        if let Some(id) = handle.component {
            self.shutdown.unregister(id);
        }
        Ok(())
    }

    /// The shared (non-dedicated) reader of `name`.
    pub fn get_reader(&self, name: &str) -> Option<Arc<ReaderHandle>> {
        self.lock()
            .ok()?
            .iter()
            .find(|r| r.ctx.name == name && !r.ctx.dedicated)
            .cloned()
    }

    pub fn get_reader_by_index(&self, index: usize) -> Option<Arc<ReaderHandle>> {
        self.lock().ok()?.get(index).cloned()
    }

    pub fn count(&self) -> usize {
        self.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Stop every reader, each with `timeout`.
    pub fn stop_all(&self, timeout: Duration) {
        let readers: Vec<Arc<ReaderHandle>> = match self.lock() {
            Ok(readers) => readers.clone(),
            Err(err) => {
                log::error!("reader: {}", err);
                return;
            }
        };
        for reader in &readers {
            reader.ctx.request_stop();
        }
        for reader in readers {
            if let Err(err) = self.stop_reader_with_timeout(&reader, timeout) {
                log::error!("reader {}: stop failed: {:#}", reader.ctx.name, err);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Thread body
// ----------------------------------------------------------------------------

fn reader_thread(
    ctx: &ReaderContext,
    state: &StreamState,
    tracker: &TimestampTracker,
    shutdown: &ShutdownCoordinator,
) {
    if let Err(err) = run_reader(ctx, state, tracker, shutdown) {
        if ctx.dedicated {
            log::error!("reader {}: {:#}", ctx.name, err);
        } else {
            state.set_error(format!("{:#}", err));
        }
    }
    ctx.running.store(false, Ordering::SeqCst);
    ctx.connected.store(false, Ordering::SeqCst);
    log::debug!("reader {}: thread exit", ctx.name);
}

fn mark(ctx: &ReaderContext, state: &StreamState, next: StreamStatus) {
    if ctx.dedicated {
        return;
    }
    if matches!(state.status(), StreamStatus::Stopping | StreamStatus::Inactive) {
        return;
    }
    if let Err(err) = state.transition(next) {
        log::debug!("reader {}: {:#}", ctx.name, err);
    }
}

/// Up to five attempts, 250 ms apart. `Ok(None)` means a stop arrived first.
fn connect(ctx: &ReaderContext) -> Result<Option<Box<dyn Demuxer>>> {
    let mut last_err = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        if !ctx.is_running() {
            return Ok(None);
        }
        match open_input(&ctx.url, ctx.protocol, &ctx.interrupter) {
            Ok(demuxer) => return Ok(Some(demuxer)),
            Err(err) => {
                log::warn!(
                    "reader {}: open attempt {}/{} failed: {:#}",
                    ctx.name,
                    attempt,
                    CONNECT_ATTEMPTS,
                    err
                );
                last_err = Some(err);
            }
        }
        if attempt < CONNECT_ATTEMPTS {
            ctx.sleep_while_running(CONNECT_RETRY_DELAY);
        }
    }
    let err = last_err.unwrap_or_else(|| NvrError::transport("no attempt made"));
    Err(err.context(format!(
        "could not open {} after {} attempts",
        ctx.url, CONNECT_ATTEMPTS
    )))
}

/// Capture the stream table of a freshly opened input.
fn adopt(ctx: &ReaderContext, demuxer: &dyn Demuxer) -> Result<usize> {
    let streams = demuxer.streams().to_vec();
    let video = find_video_stream(&streams)
        .ok_or_else(|| NvrError::config(format!("{} has no video stream", ctx.url)))?;
    if let Ok(mut slot) = ctx.streams.lock() {
        *slot = streams;
    }
    ctx.connected.store(true, Ordering::SeqCst);
    Ok(video)
}

fn info_for(streams: &[StreamInfo], index: usize) -> Option<StreamInfo> {
    streams.iter().find(|s| s.index == index).cloned()
}

fn run_reader(
    ctx: &ReaderContext,
    state: &StreamState,
    tracker: &TimestampTracker,
    shutdown: &ShutdownCoordinator,
) -> Result<()> {
    let Some(mut demuxer) = connect(ctx)? else {
        return Ok(());
    };
    let mut video_idx = adopt(ctx, demuxer.as_ref())?;
    let mut streams = ctx.streams();
    mark(ctx, state, StreamStatus::Active);
    log::info!("reader {}: connected, video stream #{}", ctx.name, video_idx);

    let mut backoff = Backoff::new(ctx.protocol);
    let mut video_ts = StreamTimestamps::new(ctx.protocol.is_udp());
    let mut audio_ts = StreamTimestamps::new(ctx.protocol.is_udp());

    while ctx.is_running() && !shutdown.is_shutdown_initiated() {
        if ctx.callback.load().is_none() {
            std::thread::sleep(IDLE_POLL);
            continue;
        }

        let stall = match demuxer.read() {
            Ok(ReadEvent::Packet(mut packet)) => {
                backoff.reset();
                let Some(info) = info_for(&streams, packet.stream_index) else {
                    continue;
                };
                if packet.stream_index == video_idx {
                    video_ts.correct(tracker, &mut packet, &info);
                    if !ctx.dedicated {
                        state.record_packet(packet.size());
                    }
                    let callback = ctx.callback.load_full();
                    if let Some(callback) = callback.as_ref() {
                        ctx.delivered.fetch_add(1, Ordering::SeqCst);
                        if let Err(err) = callback(&packet, &info) {
                            log::warn!("reader {}: packet callback failed: {:#}", ctx.name, err);
                            state.record_error();
                        }
                    }
                } else if info.kind == MediaKind::Audio {
                    audio_ts.correct(tracker, &mut packet, &info);
                    let callback = ctx.audio_callback.load_full();
                    if let Some(callback) = callback.as_ref() {
                        if let Err(err) = callback(&packet, &info) {
                            log::debug!("reader {}: audio callback failed: {:#}", ctx.name, err);
                        }
                    }
                }
                continue;
            }
            Ok(ReadEvent::Eof) => Stall::Eof,
            Ok(ReadEvent::Again) => Stall::Again,
            Err(err) => {
                if !ctx.is_running() {
                    break;
                }
                log::warn!("reader {}: read failed: {:#}", ctx.name, err);
                state.record_error();
                Stall::Eof
            }
        };

        let action = backoff.on_stall(stall);
        match action {
            StallAction::Retry(delay) => {
                log::debug!("reader {}: {:?}, retrying in {:?}", ctx.name, stall, delay);
                ctx.sleep_while_running(delay);
            }
            StallAction::Reopen(delay) => {
                log::warn!("reader {}: reconnecting in {:?}", ctx.name, delay);
                ctx.connected.store(false, Ordering::SeqCst);
                drop(demuxer);
                mark(ctx, state, StreamStatus::Reconnecting);
                ctx.sleep_while_running(delay);
                match reopen(ctx, &mut backoff, shutdown)? {
                    Some(next) => {
                        demuxer = next;
                        video_idx = adopt(ctx, demuxer.as_ref())?;
                        streams = ctx.streams();
                        backoff.reset();
                        mark(ctx, state, StreamStatus::Active);
                        log::info!("reader {}: reconnected", ctx.name);
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

/// Keep trying to open the input while running; failures back off.
fn reopen(
    ctx: &ReaderContext,
    backoff: &mut Backoff,
    shutdown: &ShutdownCoordinator,
) -> Result<Option<Box<dyn Demuxer>>> {
    while ctx.is_running() && !shutdown.is_shutdown_initiated() {
        match open_input(&ctx.url, ctx.protocol, &ctx.interrupter) {
            Ok(demuxer) => return Ok(Some(demuxer)),
            Err(err) => {
                if let Some(NvrError::Config(_)) = NvrError::classify(&err) {
                    return Err(err);
                }
                let delay = backoff.on_stall(Stall::Eof).delay();
                log::warn!(
                    "reader {}: reopen failed: {:#}; next attempt in {:?}",
                    ctx.name,
                    err,
                    delay
                );
                ctx.sleep_while_running(delay);
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;

    fn setup(url: &str) -> (Arc<StreamRegistry>, ReaderRegistry) {
        let streams = Arc::new(StreamRegistry::new(4));
        streams.add(StreamConfig::new("cam1", url)).unwrap();
        let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_secs(2)));
        let readers = ReaderRegistry::new(streams.clone(), shutdown);
        (streams, readers)
    }

    fn counter() -> (Arc<AtomicU64>, PacketCallback) {
        let seen = Arc::new(AtomicU64::new(0));
        let inner = seen.clone();
        let cb: PacketCallback = Arc::new(move |_pkt, _info| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (seen, cb)
    }

    #[test]
    fn delivers_video_and_marks_active() {
        let (streams, readers) = setup("stub://cam1?fps=50&speed=0");
        let state = streams.get("cam1").unwrap();
        state.transition(StreamStatus::Starting).unwrap();
        let (seen, cb) = counter();
        let handle = readers.start_reader("cam1", false, Some(cb)).unwrap();
        assert!(handle.wait_connected(Duration::from_secs(2)));
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) < 20 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(seen.load(Ordering::SeqCst) >= 20);
        assert_eq!(state.status(), StreamStatus::Active);
        readers.stop_reader(&handle).unwrap();
        readers.stop_reader(&handle).unwrap();
        assert_eq!(readers.count(), 0);
    }

    #[test]
    fn no_callback_after_stop() {
        let (_streams, readers) = setup("stub://cam1?fps=100&speed=0");
        let (seen, cb) = counter();
        let handle = readers.start_reader("cam1", false, Some(cb)).unwrap();
        assert!(handle.wait_connected(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(20));
        readers.stop_reader(&handle).unwrap();
        let after_stop = seen.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn shared_reader_is_reused() {
        let (_streams, readers) = setup("stub://cam1?fps=25");
        let a = readers.start_reader("cam1", false, None).unwrap();
        let (_seen, cb) = counter();
        let b = readers.start_reader("cam1", false, Some(cb)).unwrap();
        assert_eq!(a.id, b.id);
        let dedicated = readers.start_reader("cam1", true, None).unwrap();
        assert_ne!(dedicated.id, a.id);
        assert_eq!(readers.count(), 2);
        assert_eq!(readers.get_reader("cam1").unwrap().id, a.id);
        readers.stop_all(Duration::from_secs(2));
        assert_eq!(readers.count(), 0);
    }

    #[test]
    fn open_failure_parks_stream_in_error() {
        let (streams, readers) = setup("stub://cam1?fail_open=1");
        let state = streams.get("cam1").unwrap();
        state.transition(StreamStatus::Starting).unwrap();
        let handle = readers.start_reader("cam1", false, None).unwrap();
        // 5 attempts, 4 gaps of 250 ms
        let deadline = Instant::now() + Duration::from_secs(3);
        while state.status() != StreamStatus::Error && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(state.status(), StreamStatus::Error);
        assert!(state.last_error().unwrap().contains("after 5 attempts"));
        readers.stop_reader(&handle).unwrap();
    }

    #[test]
    fn eof_triggers_reconnect() {
        let (streams, readers) = setup("stub://cam1?fps=50&speed=0&eof_after=10");
        let state = streams.get("cam1").unwrap();
        state.transition(StreamStatus::Starting).unwrap();
        let (seen, cb) = counter();
        let handle = readers.start_reader("cam1", false, Some(cb)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while seen.load(Ordering::SeqCst) < 15 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(seen.load(Ordering::SeqCst) >= 15);
        assert!(state.stats().reconnects >= 1);
        readers.stop_reader(&handle).unwrap();
    }

    #[test]
    fn unknown_stream_is_config_error() {
        let (_streams, readers) = setup("stub://cam1");
        let err = readers.start_reader("nope", false, None).err().unwrap();
        assert!(matches!(NvrError::classify(&err), Some(NvrError::Config(_))));
    }
}
