//! Handle-based facade over the stream registry.
//!
//! Older call sites refer to streams through small integer handles. The
//! adapter keeps a fixed table of `handle -> stream name` behind one mutex and
//! forwards lifecycle requests to a `StreamController` (the runtime).

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use super::{Feature, StreamRegistry, StreamState, StreamStats, StreamStatus};
use crate::config::StreamConfig;
use crate::error::NvrError;

/// Opaque stream handle. Zero is never handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(u32);

impl StreamHandle {
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    fn slot(self) -> usize {
        self.0 as usize - 1
    }
}

/// Lifecycle operations the adapter delegates.
pub trait StreamController: Send + Sync {
    fn start_stream(&self, name: &str) -> Result<()>;
    fn stop_stream(&self, name: &str) -> Result<()>;
    fn set_stream_feature(&self, name: &str, feature: Feature, enabled: bool) -> Result<()>;
}

pub struct StreamAdapter {
    registry: Arc<StreamRegistry>,
    controller: Arc<dyn StreamController>,
    mapping: Mutex<Vec<Option<String>>>,
}

impl StreamAdapter {
    pub fn new(registry: Arc<StreamRegistry>, controller: Arc<dyn StreamController>) -> Self {
        let slots = registry.max_streams();
        Self {
            registry,
            controller,
            mapping: Mutex::new(vec![None; slots]),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Option<String>>>> {
        self.mapping
            .lock()
            .map_err(|_| anyhow!("stream adapter lock poisoned"))
    }

    /// Handle for `name`, allocating a mapping slot on first use.
    pub fn get_stream_by_name(&self, name: &str) -> Result<StreamHandle> {
        if self.registry.get(name).is_none() {
            return Err(NvrError::config(format!("unknown stream '{}'", name)));
        }
        let mut mapping = self.lock()?;
        if let Some(pos) = mapping.iter().position(|m| m.as_deref() == Some(name)) {
            return Ok(StreamHandle(pos as u32 + 1));
        }
        let free = mapping
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| NvrError::exhausted("stream handle table is full"))?;
        mapping[free] = Some(name.to_string());
        Ok(StreamHandle(free as u32 + 1))
    }

    /// Handle for the `index`-th registered stream.
    pub fn get_stream_by_index(&self, index: usize) -> Result<StreamHandle> {
        let state = self
            .registry
            .get_by_index(index)
            .ok_or_else(|| NvrError::config(format!("no stream at index {}", index)))?;
        self.get_stream_by_name(state.name())
    }

    fn state(&self, handle: StreamHandle) -> Result<Arc<StreamState>> {
        let name = {
            let mapping = self.lock()?;
            mapping
                .get(handle.slot())
                .cloned()
                .flatten()
                .ok_or_else(|| anyhow!("stale stream handle {}", handle.0))?
        };
        self.registry.get(&name).ok_or_else(|| {
            NvrError::ShutdownRaced(format!("stream '{}' was removed", name)).into()
        })
    }

    pub fn stream_name(&self, handle: StreamHandle) -> Result<String> {
        Ok(self.state(handle)?.name().to_string())
    }

    /// Forget the mapping for a removed stream.
    pub fn release(&self, name: &str) -> Result<()> {
        let mut mapping = self.lock()?;
        for slot in mapping.iter_mut() {
            if slot.as_deref() == Some(name) {
                *slot = None;
            }
        }
        Ok(())
    }

    pub fn start_stream(&self, handle: StreamHandle) -> Result<()> {
        let name = self.stream_name(handle)?;
        self.controller.start_stream(&name)
    }

    pub fn stop_stream(&self, handle: StreamHandle) -> Result<()> {
        let name = self.stream_name(handle)?;
        self.controller.stop_stream(&name)
    }

    pub fn is_stream_active(&self, handle: StreamHandle) -> bool {
        self.state(handle)
            .map(|s| s.status() == StreamStatus::Active)
            .unwrap_or(false)
    }

    pub fn get_stream_status(&self, handle: StreamHandle) -> Result<StreamStatus> {
        Ok(self.state(handle)?.status())
    }

    pub fn get_stream_stats(&self, handle: StreamHandle) -> Result<StreamStats> {
        Ok(self.state(handle)?.stats())
    }

    pub fn get_stream_config(&self, handle: StreamHandle) -> Result<StreamConfig> {
        self.state(handle)?.config()
    }

    pub fn set_stream_priority(&self, handle: StreamHandle, priority: u8) -> Result<()> {
        if priority > 100 {
            return Err(NvrError::config(format!("priority {} is outside 0-100", priority)));
        }
        self.state(handle)?.update_config(|c| c.priority = priority)?;
        Ok(())
    }

    pub fn set_stream_recording(&self, handle: StreamHandle, enabled: bool) -> Result<()> {
        let name = self.stream_name(handle)?;
        self.controller
            .set_stream_feature(&name, Feature::Recording, enabled)
    }

    pub fn set_stream_streaming(&self, handle: StreamHandle, enabled: bool) -> Result<()> {
        let name = self.stream_name(handle)?;
        self.controller
            .set_stream_feature(&name, Feature::Streaming, enabled)
    }

    /// Enable detection with `model` ("motion" selects the motion detector),
    /// or disable every detection feature.
    pub fn set_stream_detection(
        &self,
        handle: StreamHandle,
        enabled: bool,
        model: Option<&str>,
    ) -> Result<()> {
        let state = self.state(handle)?;
        let name = state.name().to_string();
        if let Some(model) = model {
            state.update_config(|c| c.detect_model = model.to_string())?;
        }
        let model = state.config()?.detect_model;
        if enabled && model.trim().is_empty() {
            return Err(NvrError::config(format!(
                "stream {}: detection needs a model",
                name
            )));
        }
        let motion = model == "motion";
        if enabled {
            let (on, off) = if motion {
                (Feature::MotionDetection, Feature::Detection)
            } else {
                (Feature::Detection, Feature::MotionDetection)
            };
            self.controller.set_stream_feature(&name, off, false)?;
            self.controller.set_stream_feature(&name, on, true)
        } else {
            self.controller
                .set_stream_feature(&name, Feature::Detection, false)?;
            self.controller
                .set_stream_feature(&name, Feature::MotionDetection, false)
        }
    }

    /// Update detection tuning; an ACTIVE stream with detection on restarts
    /// so the worker picks up the new values.
    pub fn set_stream_detection_params(
        &self,
        handle: StreamHandle,
        interval: u32,
        threshold: f32,
        pre_roll_seconds: u32,
        post_roll_seconds: u32,
    ) -> Result<()> {
        let state = self.state(handle)?;
        state.update_config(|c| {
            c.detect_interval = interval;
            c.detect_threshold = threshold;
            c.pre_roll_seconds = pre_roll_seconds;
            c.post_roll_seconds = post_roll_seconds;
        })?;
        if state.features().any_detection() && state.status() == StreamStatus::Active {
            log::info!("stream {}: restarting for new detection params", state.name());
            self.controller.stop_stream(state.name())?;
            self.controller.start_stream(state.name())?;
        }
        Ok(())
    }

    pub fn get_active_stream_count(&self) -> usize {
        self.registry.active_count()
    }

    pub fn get_total_stream_count(&self) -> usize {
        self.registry.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<String>>,
        registry: Option<Arc<StreamRegistry>>,
    }

    impl StreamController for Recorder {
        fn start_stream(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("start {}", name));
            Ok(())
        }
        fn stop_stream(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("stop {}", name));
            Ok(())
        }
        fn set_stream_feature(&self, name: &str, feature: Feature, enabled: bool) -> Result<()> {
            if let Some(state) = self.registry.as_ref().and_then(|r| r.get(name)) {
                state.set_feature(feature, enabled)?;
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {} {}", name, feature, enabled));
            Ok(())
        }
    }

    fn setup() -> (Arc<StreamRegistry>, Arc<Recorder>, StreamAdapter) {
        let registry = Arc::new(StreamRegistry::new(4));
        registry
            .add(StreamConfig::new("cam1", "stub://cam1"))
            .unwrap();
        registry
            .add(StreamConfig::new("cam2", "stub://cam2"))
            .unwrap();
        let recorder = Arc::new(Recorder {
            calls: StdMutex::new(Vec::new()),
            registry: Some(registry.clone()),
        });
        let adapter = StreamAdapter::new(registry.clone(), recorder.clone());
        (registry, recorder, adapter)
    }

    #[test]
    fn handles_are_stable_and_nonzero() {
        let (_reg, _rec, adapter) = setup();
        let a = adapter.get_stream_by_name("cam1").unwrap();
        let b = adapter.get_stream_by_index(1).unwrap();
        assert_ne!(a.raw(), 0);
        assert_ne!(a, b);
        assert_eq!(adapter.get_stream_by_name("cam1").unwrap(), a);
        assert_eq!(adapter.stream_name(b).unwrap(), "cam2");
        assert!(adapter.get_stream_by_name("nope").is_err());
        assert!(StreamHandle::from_raw(0).is_none());
    }

    #[test]
    fn removed_stream_handle_is_rejected() {
        let (reg, _rec, adapter) = setup();
        let h = adapter.get_stream_by_name("cam2").unwrap();
        reg.remove("cam2").unwrap();
        let err = adapter.get_stream_status(h).unwrap_err();
        assert!(matches!(
            NvrError::classify(&err),
            Some(NvrError::ShutdownRaced(_))
        ));
        adapter.release("cam2").unwrap();
        assert!(adapter.get_stream_status(h).is_err());
    }

    #[test]
    fn detection_toggle_picks_feature_by_model() {
        let (reg, rec, adapter) = setup();
        let h = adapter.get_stream_by_name("cam1").unwrap();
        adapter
            .set_stream_detection(h, true, Some("motion"))
            .unwrap();
        let f = reg.get("cam1").unwrap().features();
        assert!(f.motion_detection && !f.detection);
        adapter.set_stream_detection(h, false, None).unwrap();
        assert!(!reg.get("cam1").unwrap().features().any_detection());
        assert!(rec
            .calls
            .lock()
            .unwrap()
            .contains(&"cam1 motion_detection true".to_string()));
    }

    #[test]
    fn params_restart_only_active_detecting_streams() {
        let (reg, rec, adapter) = setup();
        let h = adapter.get_stream_by_name("cam1").unwrap();
        adapter.set_stream_detection_params(h, 2, 0.5, 3, 4).unwrap();
        assert!(rec.calls.lock().unwrap().is_empty());
        let cfg = adapter.get_stream_config(h).unwrap();
        assert_eq!((cfg.detect_interval, cfg.pre_roll_seconds), (2, 3));

        let state = reg.get("cam1").unwrap();
        state.set_feature(Feature::Detection, true).unwrap();
        state.transition(StreamStatus::Starting).unwrap();
        state.transition(StreamStatus::Active).unwrap();
        adapter.set_stream_detection_params(h, 1, 0.3, 5, 5).unwrap();
        let calls = rec.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["stop cam1".to_string(), "start cam1".to_string()]);
        assert_eq!(adapter.get_active_stream_count(), 1);
        assert_eq!(adapter.get_total_stream_count(), 2);
    }

    #[test]
    fn priority_is_bounded() {
        let (_reg, _rec, adapter) = setup();
        let h = adapter.get_stream_by_name("cam1").unwrap();
        adapter.set_stream_priority(h, 80).unwrap();
        assert_eq!(adapter.get_stream_config(h).unwrap().priority, 80);
        assert!(adapter.set_stream_priority(h, 101).is_err());
    }
}
