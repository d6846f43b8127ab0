//! Per-stream detection on decoded frames.
//!
//! ```text
//! arrive -> validate -> (rate gate) -> prepare -> admit -> run
//!        -> hit: event + trigger / failure: log -> release buffer -> leave
//! ```
//!
//! The rate gate is [`DetectionPipeline::try_claim`]; callers check it before
//! they spend time decoding. Everything after it is
//! [`DetectionPipeline::process_frame`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::config::StreamConfig;
use crate::error::NvrError;
use crate::media::VideoFrame;
use crate::recording::events::{Event, EventKind, EventSink};

use super::admission::DetectionAdmission;
use super::backend::{DetectorBackend, InputSpec};
use super::backends::MotionBackend;
use super::cache::ModelCache;
use super::model::{LoadedModel, ModelKind};
use super::pool::BufferPool;
use super::prep;
use super::result::DetectionResult;

/// Receives positive results. The recording table implements this to flush
/// pre-roll and extend post-roll.
pub trait DetectionTrigger: Send + Sync {
    fn trigger(&self, stream: &str, result: &DetectionResult) -> Result<()>;
}

enum Engine {
    Motion(Mutex<MotionBackend>),
    Model(Arc<LoadedModel>),
}

impl Engine {
    fn input(&self) -> InputSpec {
        match self {
            Engine::Motion(backend) => backend
                .lock()
                .ok()
                .and_then(|b| b.input())
                .unwrap_or_else(|| ModelKind::Motion.default_input()),
            Engine::Model(model) => model.input(),
        }
    }
}

struct StreamDetection {
    model: String,
    kind: ModelKind,
    threshold: f32,
    interval: Duration,
    engine: Engine,
    last_run: Mutex<Option<Instant>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub dropped: u64,
    pub hits: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    dropped: AtomicU64,
    hits: AtomicU64,
    failures: AtomicU64,
}

pub struct DetectionPipeline {
    cache: Arc<ModelCache>,
    pool: BufferPool,
    admission: DetectionAdmission,
    events: Arc<dyn EventSink>,
    trigger: Option<Arc<dyn DetectionTrigger>>,
    streams: Mutex<HashMap<String, Arc<StreamDetection>>>,
    counters: Counters,
}

impl DetectionPipeline {
    pub fn new(cache: Arc<ModelCache>, concurrent_detections: usize, events: Arc<dyn EventSink>) -> Self {
        Self {
            cache,
            pool: BufferPool::default(),
            admission: DetectionAdmission::new(concurrent_detections),
            events,
            trigger: None,
            streams: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn DetectionTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<StreamDetection>>>> {
        self.streams
            .lock()
            .map_err(|_| anyhow!("detection stream table lock poisoned"))
    }

    fn entry(&self, stream: &str) -> Option<Arc<StreamDetection>> {
        self.lock().ok()?.get(stream).cloned()
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn admission(&self) -> &DetectionAdmission {
        &self.admission
    }

    /// Set up (or replace) detection for `config`. A stream without detection
    /// is removed. Model streams pin their model until removed.
    pub fn configure_stream(&self, config: &StreamConfig) -> Result<()> {
        if !config.wants_detection() {
            self.remove_stream(&config.name);
            return Ok(());
        }
        let model = config.detect_model.trim().to_string();
        let kind = ModelKind::from_model(&model)?;
        let engine = match kind {
            ModelKind::Motion => Engine::Motion(Mutex::new(MotionBackend::default())),
            _ => Engine::Model(self.cache.get(&model, config.detect_threshold)?),
        };
        let entry = Arc::new(StreamDetection {
            threshold: kind.effective_threshold(config.detect_threshold),
            interval: Duration::from_secs(u64::from(config.detect_interval)),
            model,
            kind,
            engine,
            last_run: Mutex::new(None),
        });
        log::info!(
            "detect {}: {} model {} (threshold {:.2}, every {}s)",
            config.name,
            entry.kind,
            entry.model,
            entry.threshold,
            config.detect_interval
        );
        self.lock()?.insert(config.name.clone(), entry);
        Ok(())
    }

    /// Returns whether the stream had detection configured.
    pub fn remove_stream(&self, stream: &str) -> bool {
        let removed = self
            .lock()
            .map(|mut streams| streams.remove(stream).is_some())
            .unwrap_or(false);
        if removed {
            log::debug!("detect {}: removed", stream);
        }
        removed
    }

    pub fn is_configured(&self, stream: &str) -> bool {
        self.entry(stream).is_some()
    }

    pub fn stream_count(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Rate gate. True when at least `detect_interval` seconds passed since
    /// the last claimed frame; the claim restarts the interval.
    pub fn try_claim(&self, stream: &str, now: Instant) -> bool {
        let Some(entry) = self.entry(stream) else {
            return false;
        };
        let Ok(mut last) = entry.last_run.lock() else {
            return false;
        };
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < entry.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Run detection on one decoded frame. A frame dropped for lack of a
    /// buffer yields an empty result.
    pub fn process_frame(&self, stream: &str, frame: &VideoFrame) -> Result<DetectionResult> {
        let entry = self
            .entry(stream)
            .ok_or_else(|| NvrError::config(format!("detection not configured for {}", stream)))?;
        self.counters.frames.fetch_add(1, Ordering::Relaxed);

        let prepared = match prep::prepare(frame, &entry.engine.input(), &self.pool) {
            Ok(prepared) => prepared,
            Err(err) if matches!(NvrError::classify(&err), Some(NvrError::ResourceExhausted(_))) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("detect {}: frame dropped: {:#}", stream, err);
                return Ok(DetectionResult::empty());
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Err(err.context(format!("detect {}: frame preparation", stream)));
            }
        };

        let guard = self.admission.admit(stream)?;
        let outcome = self.run(&entry, prepared.pixels(), prepared.width, prepared.height);
        drop(prepared);
        drop(guard);

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Err(err.context(format!("detect {}: {} inference", stream, entry.kind)));
            }
        };
        if !result.is_empty() {
            self.on_hit(stream, &result);
        }
        Ok(result)
    }

    fn run(&self, entry: &StreamDetection, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        match &entry.engine {
            Engine::Motion(backend) => backend
                .lock()
                .map_err(|_| anyhow!("motion detector lock poisoned"))?
                .detect(pixels, width, height),
            Engine::Model(model) => {
                let mut result = model.detect(pixels, width, height)?;
                result.retain_above(entry.threshold);
                Ok(result)
            }
        }
    }

    fn on_hit(&self, stream: &str, result: &DetectionResult) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        let description = match result.best() {
            Some(best) => format!("{} ({:.2})", result.labels(), best.confidence),
            None => result.labels(),
        };
        log::info!("detect {}: {}", stream, description);
        let event = Event::new(EventKind::DetectionHit, stream, description)
            .with_detections(result.detections.clone());
        if let Err(err) = self.events.publish(&event) {
            log::warn!("detect {}: event publish failed: {:#}", stream, err);
        }
        if let Some(trigger) = &self.trigger {
            if let Err(err) = trigger.trigger(stream, result) {
                log::error!("detect {}: recording trigger failed: {:#}", stream, err);
            }
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames: self.counters.frames.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Drop every stream, then unload the cache.
    pub fn shutdown(&self) {
        if let Ok(mut streams) = self.lock() {
            streams.clear();
        }
        let unloaded = self.cache.unload_all();
        log::info!("detect: pipeline stopped, {} models unloaded", unloaded);
    }
}
