//! Per-stream lifecycle state.
//!
//! `StreamRegistry` owns one `StreamState` per configured stream. A state
//! holds the config snapshot, the operational status, the feature switches,
//! counters and the last error behind one mutex. The `callbacks_enabled`
//! flag sits outside that mutex so the packet path can check it without
//! locking.
//!
//! Status machine:
//! ```text
//! INACTIVE -start-> STARTING -opened-> ACTIVE
//! ACTIVE -stop-> STOPPING -joined-> INACTIVE
//! ACTIVE -io-error-> RECONNECTING -opened-> ACTIVE
//! any -fatal-> ERROR
//! ```

pub mod adapter;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::config::StreamConfig;
use crate::error::NvrError;

pub use adapter::{StreamAdapter, StreamController, StreamHandle};

const FPS_SMOOTHING: f64 = 0.1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamStatus {
    #[default]
    Inactive,
    Starting,
    Active,
    Stopping,
    Error,
    Reconnecting,
}

impl StreamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Inactive => "INACTIVE",
            StreamStatus::Starting => "STARTING",
            StreamStatus::Active => "ACTIVE",
            StreamStatus::Stopping => "STOPPING",
            StreamStatus::Error => "ERROR",
            StreamStatus::Reconnecting => "RECONNECTING",
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: StreamStatus) -> bool {
        use StreamStatus::*;
        if self == next || next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Inactive, Starting)
                | (Starting, Active)
                | (Starting, Stopping)
                | (Active, Stopping)
                | (Active, Reconnecting)
                | (Reconnecting, Active)
                | (Reconnecting, Stopping)
                | (Stopping, Inactive)
                | (Error, Starting)
                | (Error, Stopping)
                | (Error, Inactive)
        )
    }

    /// A reader should exist in these states.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            StreamStatus::Starting | StreamStatus::Active | StreamStatus::Reconnecting
        )
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    Streaming,
    Recording,
    Detection,
    MotionDetection,
}

impl Feature {
    /// Toggling these while ACTIVE needs a stop/start cycle.
    pub fn requires_restart(self) -> bool {
        matches!(self, Feature::Detection | Feature::MotionDetection)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::Streaming => "streaming",
            Feature::Recording => "recording",
            Feature::Detection => "detection",
            Feature::MotionDetection => "motion_detection",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamFeatures {
    pub streaming: bool,
    pub recording: bool,
    pub detection: bool,
    pub motion_detection: bool,
}

impl StreamFeatures {
    pub fn from_config(config: &StreamConfig) -> Self {
        let motion = config.detect_enabled && config.detect_model == "motion";
        Self {
            streaming: config.streaming_enabled,
            recording: config.record,
            detection: config.wants_detection() && !motion,
            motion_detection: motion,
        }
    }

    pub fn get(&self, feature: Feature) -> bool {
        match feature {
            Feature::Streaming => self.streaming,
            Feature::Recording => self.recording,
            Feature::Detection => self.detection,
            Feature::MotionDetection => self.motion_detection,
        }
    }

    fn set(&mut self, feature: Feature, enabled: bool) {
        match feature {
            Feature::Streaming => self.streaming = enabled,
            Feature::Recording => self.recording = enabled,
            Feature::Detection => self.detection = enabled,
            Feature::MotionDetection => self.motion_detection = enabled,
        }
    }

    pub fn any_detection(&self) -> bool {
        self.detection || self.motion_detection
    }
}

#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    pub bytes_received: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub errors: u64,
    pub reconnects: u64,
    /// Exponentially smoothed packets per second.
    pub fps: f64,
    pub started_at: Option<Instant>,
    pub last_frame_time: Option<SystemTime>,
    last_frame_instant: Option<Instant>,
}

impl StreamStats {
    pub fn uptime(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }
}

#[derive(Debug)]
struct StateInner {
    config: StreamConfig,
    status: StreamStatus,
    features: StreamFeatures,
    stats: StreamStats,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct StreamState {
    name: String,
    inner: Mutex<StateInner>,
    callbacks_enabled: AtomicBool,
}

impl StreamState {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            name: config.name.clone(),
            inner: Mutex::new(StateInner {
                features: StreamFeatures::from_config(&config),
                config,
                status: StreamStatus::Inactive,
                stats: StreamStats::default(),
                last_error: None,
            }),
            callbacks_enabled: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StateInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("stream {} state lock poisoned", self.name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> Result<StreamConfig> {
        Ok(self.lock()?.config.clone())
    }

    /// Edit the config snapshot in place.
    pub fn update_config<F>(&self, edit: F) -> Result<StreamConfig>
    where
        F: FnOnce(&mut StreamConfig),
    {
        let mut inner = self.lock()?;
        edit(&mut inner.config);
        inner.config.name = self.name.clone();
        Ok(inner.config.clone())
    }

    pub fn status(&self) -> StreamStatus {
        self.lock().map(|i| i.status).unwrap_or(StreamStatus::Error)
    }

    /// Move to `next`. Same-state transitions are no-ops; edges outside the
    /// lifecycle graph are rejected. Returns the previous status.
    pub fn transition(&self, next: StreamStatus) -> Result<StreamStatus> {
        let mut inner = self.lock()?;
        let prev = inner.status;
        if prev == next {
            return Ok(prev);
        }
        if !prev.can_transition_to(next) {
            return Err(anyhow!(
                "stream {}: invalid transition {} -> {}",
                self.name,
                prev,
                next
            ));
        }
        inner.status = next;
        match next {
            StreamStatus::Starting => inner.last_error = None,
            StreamStatus::Active => {
                if inner.stats.started_at.is_none() {
                    inner.stats.started_at = Some(Instant::now());
                }
            }
            StreamStatus::Reconnecting => inner.stats.reconnects += 1,
            StreamStatus::Inactive => inner.stats.started_at = None,
            _ => {}
        }
        log::debug!("stream {}: {} -> {}", self.name, prev, next);
        Ok(prev)
    }

    /// Park in ERROR with a human-readable reason.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("stream {}: {}", self.name, message);
        if let Ok(mut inner) = self.lock() {
            inner.status = StreamStatus::Error;
            inner.stats.errors += 1;
            inner.last_error = Some(message);
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().ok().and_then(|i| i.last_error.clone())
    }

    pub fn features(&self) -> StreamFeatures {
        self.lock().map(|i| i.features).unwrap_or_default()
    }

    /// Returns whether the flag changed.
    pub fn set_feature(&self, feature: Feature, enabled: bool) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.features.get(feature) == enabled {
            return Ok(false);
        }
        inner.features.set(feature, enabled);
        match feature {
            Feature::Streaming => inner.config.streaming_enabled = enabled,
            Feature::Recording => inner.config.record = enabled,
            Feature::Detection | Feature::MotionDetection => {
                inner.config.detect_enabled = inner.features.any_detection();
            }
        }
        log::info!("stream {}: {} {}", self.name, feature, if enabled { "on" } else { "off" });
        Ok(true)
    }

    pub fn callbacks_enabled(&self) -> bool {
        self.callbacks_enabled.load(Ordering::SeqCst)
    }

    pub fn set_callbacks_enabled(&self, enabled: bool) {
        self.callbacks_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StreamStats {
        self.lock().map(|i| i.stats.clone()).unwrap_or_default()
    }

    pub fn record_packet(&self, bytes: usize) {
        if let Ok(mut inner) = self.lock() {
            let stats = &mut inner.stats;
            let now = Instant::now();
            if let Some(prev) = stats.last_frame_instant {
                let gap = now.duration_since(prev).as_secs_f64();
                if gap > 0.0 {
                    let instant_fps = 1.0 / gap;
                    stats.fps = if stats.fps == 0.0 {
                        instant_fps
                    } else {
                        stats.fps * (1.0 - FPS_SMOOTHING) + instant_fps * FPS_SMOOTHING
                    };
                }
            }
            stats.last_frame_instant = Some(now);
            stats.last_frame_time = Some(SystemTime::now());
            stats.bytes_received += bytes as u64;
            stats.frames_received += 1;
        }
    }

    pub fn record_drop(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.stats.frames_dropped += 1;
        }
    }

    pub fn record_error(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.stats.errors += 1;
        }
    }
}

/// Name -> state table with a fixed capacity.
pub struct StreamRegistry {
    states: Mutex<Vec<Arc<StreamState>>>,
    max_streams: usize,
}

impl StreamRegistry {
    pub fn new(max_streams: usize) -> Self {
        Self {
            states: Mutex::new(Vec::with_capacity(max_streams)),
            max_streams: max_streams.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Arc<StreamState>>>> {
        self.states
            .lock()
            .map_err(|_| anyhow!("stream registry lock poisoned"))
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    pub fn add(&self, config: StreamConfig) -> Result<Arc<StreamState>> {
        config.validate()?;
        let mut states = self.lock()?;
        if states.iter().any(|s| s.name == config.name) {
            return Err(NvrError::config(format!(
                "stream '{}' already exists",
                config.name
            )));
        }
        if states.len() >= self.max_streams {
            return Err(NvrError::exhausted(format!(
                "cannot add stream '{}': {} streams already registered",
                config.name, self.max_streams
            )));
        }
        let state = Arc::new(StreamState::new(config));
        states.push(state.clone());
        log::info!("stream {}: registered", state.name);
        Ok(state)
    }

    pub fn get(&self, name: &str) -> Option<Arc<StreamState>> {
        self.lock()
            .ok()?
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    pub fn get_by_index(&self, index: usize) -> Option<Arc<StreamState>> {
        self.lock().ok()?.get(index).cloned()
    }

    /// Drop a stream that is not running.
    pub fn remove(&self, name: &str) -> Result<Arc<StreamState>> {
        let mut states = self.lock()?;
        let pos = states
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| NvrError::config(format!("unknown stream '{}'", name)))?;
        let status = states[pos].status();
        if status.is_running() || status == StreamStatus::Stopping {
            return Err(anyhow!("stream {} is {}; stop it before removing", name, status));
        }
        let state = states.remove(pos);
        log::info!("stream {}: removed", name);
        Ok(state)
    }

    pub fn list(&self) -> Vec<Arc<StreamState>> {
        self.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .map(|s| {
                s.iter()
                    .filter(|st| st.status() == StreamStatus::Active)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> StreamConfig {
        StreamConfig::new(name, &format!("stub://{}", name))
    }

    #[test]
    fn lifecycle_edges() {
        let state = StreamState::new(cfg("cam1"));
        assert_eq!(state.status(), StreamStatus::Inactive);
        assert!(state.transition(StreamStatus::Active).is_err());
        state.transition(StreamStatus::Starting).unwrap();
        state.transition(StreamStatus::Active).unwrap();
        state.transition(StreamStatus::Reconnecting).unwrap();
        state.transition(StreamStatus::Active).unwrap();
        assert_eq!(state.stats().reconnects, 1);
        state.transition(StreamStatus::Stopping).unwrap();
        assert!(state.transition(StreamStatus::Active).is_err());
        state.transition(StreamStatus::Inactive).unwrap();
        assert_eq!(
            state.transition(StreamStatus::Inactive).unwrap(),
            StreamStatus::Inactive
        );
    }

    #[test]
    fn error_records_reason() {
        let state = StreamState::new(cfg("cam1"));
        state.transition(StreamStatus::Starting).unwrap();
        state.set_error("open failed after 5 attempts");
        assert_eq!(state.status(), StreamStatus::Error);
        assert_eq!(state.last_error().as_deref(), Some("open failed after 5 attempts"));
        state.transition(StreamStatus::Starting).unwrap();
        assert!(state.last_error().is_none());
    }

    #[test]
    fn features_follow_config() {
        let state = StreamState::new(cfg("cam1").with_detection("motion", 1));
        let f = state.features();
        assert!(f.motion_detection && !f.detection && f.streaming && !f.recording);
        assert!(state.set_feature(Feature::Recording, true).unwrap());
        assert!(!state.set_feature(Feature::Recording, true).unwrap());
        assert!(state.config().unwrap().record);
        state.set_feature(Feature::MotionDetection, false).unwrap();
        assert!(!state.config().unwrap().detect_enabled);
    }

    #[test]
    fn registry_enforces_capacity_and_uniqueness() {
        let reg = StreamRegistry::new(2);
        reg.add(cfg("a")).unwrap();
        assert!(reg.add(cfg("a")).is_err());
        reg.add(cfg("b")).unwrap();
        let err = reg.add(cfg("c")).unwrap_err();
        assert!(matches!(
            NvrError::classify(&err),
            Some(NvrError::ResourceExhausted(_))
        ));
        assert_eq!(reg.get_by_index(1).unwrap().name(), "b");
        assert!(reg.add(cfg("bad name")).is_err());
    }

    #[test]
    fn running_streams_cannot_be_removed() {
        let reg = StreamRegistry::new(4);
        let st = reg.add(cfg("a")).unwrap();
        st.transition(StreamStatus::Starting).unwrap();
        assert!(reg.remove("a").is_err());
        st.set_error("boom");
        reg.remove("a").unwrap();
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn packet_stats_accumulate() {
        let st = StreamState::new(cfg("a"));
        st.record_packet(100);
        st.record_packet(50);
        st.record_drop();
        let stats = st.stats();
        assert_eq!(stats.bytes_received, 150);
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.frames_dropped, 1);
        assert!(stats.last_frame_time.is_some());
    }
}
