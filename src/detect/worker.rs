//! One detection thread per stream.
//!
//! The HLS worker decodes a frame when the rate gate opens and hands it over
//! with [`DetectionWorker::submit`]. The queue holds a single frame; a frame
//! arriving while the previous one is still queued is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::media::VideoFrame;
use crate::shutdown::{join_with_timeout, ComponentId, ComponentKind, ComponentState, ShutdownCoordinator};

use super::pipeline::DetectionPipeline;

const DETECTION_PRIORITY: u8 = 50;
const QUEUE_DEPTH: usize = 1;
const RECV_POLL: Duration = Duration::from_millis(200);

pub struct DetectionWorker {
    stream: String,
    sender: Mutex<Option<SyncSender<VideoFrame>>>,
    running: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
    component: ComponentId,
    shutdown: Arc<ShutdownCoordinator>,
    submitted: AtomicU64,
    dropped: AtomicU64,
}

impl DetectionWorker {
    pub fn spawn(
        stream: &str,
        pipeline: Arc<DetectionPipeline>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(QUEUE_DEPTH);
        let running = Arc::new(AtomicBool::new(true));
        let hook_running = running.clone();
        let component = shutdown.register(
            &format!("detect {}", stream),
            ComponentKind::Detection,
            DETECTION_PRIORITY,
            Some(Arc::new(move || hook_running.store(false, Ordering::SeqCst))),
        )?;

        let name = stream.to_string();
        let thread_running = running.clone();
        let thread_shutdown = shutdown.clone();
        let join = std::thread::Builder::new()
            .name(format!("detect-{}", stream))
            .spawn(move || {
                detection_loop(&name, &pipeline, &receiver, &thread_running, &thread_shutdown);
                thread_shutdown.update_state(component, ComponentState::Stopped);
            })
            .with_context(|| format!("spawn detection thread for {}", stream))?;
        shutdown.update_state(component, ComponentState::Started);

        Ok(Self {
            stream: stream.to_string(),
            sender: Mutex::new(Some(sender)),
            running,
            join: Mutex::new(Some(join)),
            component,
            shutdown,
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue `frame`. Returns false when it was dropped.
    pub fn submit(&self, frame: VideoFrame) -> bool {
        let Ok(sender) = self.sender.lock() else {
            return false;
        };
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        match sender.try_send(frame) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("detect {}: busy, frame dropped", self.stream);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// `(submitted, dropped)` frame counts.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.submitted.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }

    /// Close the queue and join the thread. Idempotent.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.sender
            .lock()
            .map_err(|_| anyhow!("detect {} sender lock poisoned", self.stream))?
            .take();
        let join = self
            .join
            .lock()
            .map_err(|_| anyhow!("detect {} join lock poisoned", self.stream))?
            .take();
        if let Some(join) = join {
            join_with_timeout(join, timeout, &format!("detect {}", self.stream));
        }
        self.shutdown.unregister(self.component);
        Ok(())
    }
}

fn detection_loop(
    stream: &str,
    pipeline: &DetectionPipeline,
    receiver: &Receiver<VideoFrame>,
    running: &AtomicBool,
    shutdown: &ShutdownCoordinator,
) {
    log::debug!("detect {}: worker started", stream);
    while running.load(Ordering::SeqCst) && !shutdown.is_shutdown_initiated() {
        match receiver.recv_timeout(RECV_POLL) {
            Ok(frame) => {
                if let Err(err) = pipeline.process_frame(stream, &frame) {
                    log::warn!("detect {}: {:#}", stream, err);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("detect {}: worker exit", stream);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::detect::cache::ModelCache;
    use crate::detect::registry::LoaderRegistry;
    use crate::media::PixelFormat;
    use crate::recording::events::{EventKind, MemorySink};
    use std::time::Instant;

    fn frame(luma: u8) -> VideoFrame {
        VideoFrame {
            width: 64,
            height: 64,
            format: PixelFormat::Gray8,
            planes: vec![vec![luma; 64 * 64]],
            strides: vec![64],
            pts: None,
        }
    }

    #[test]
    fn frames_reach_the_pipeline_and_stop_joins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ModelCache::new(2, dir.path(), LoaderRegistry::new()));
        let sink = Arc::new(MemorySink::new());
        let pipeline = Arc::new(DetectionPipeline::new(cache, 2, sink.clone()));
        pipeline
            .configure_stream(&StreamConfig::new("cam1", "stub://cam1").with_detection("motion", 0))
            .unwrap();
        let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_secs(2)));
        let worker = DetectionWorker::spawn("cam1", pipeline.clone(), shutdown.clone()).unwrap();
        assert_eq!(shutdown.component_count(), 1);

        for luma in [20u8, 200] {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !worker.submit(frame(luma)) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.count(EventKind::DetectionHit) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sink.count(EventKind::DetectionHit), 1);

        worker.stop(Duration::from_secs(2)).unwrap();
        worker.stop(Duration::from_secs(2)).unwrap();
        assert!(!worker.submit(frame(0)));
        assert_eq!(shutdown.component_count(), 0);
    }
}
