//! Priority-ordered graceful shutdown.
//!
//! Long-lived components register a stop hook and a priority (0-100). Loops
//! poll [`ShutdownCoordinator::is_shutdown_initiated`] on every tick. On
//! shutdown the coordinator walks components from the highest priority down,
//! calls each hook, then waits for the component to report `Stopped`. A
//! component that misses its deadline is force-marked `Stopped` and logged.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Join budget on the shutdown path.
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(3);
/// Join budget for a normal stop.
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentKind {
    Reader,
    HlsWriter,
    Mp4Writer,
    Detection,
    Recording,
    Other,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentKind::Reader => "reader",
            ComponentKind::HlsWriter => "hls",
            ComponentKind::Mp4Writer => "mp4",
            ComponentKind::Detection => "detection",
            ComponentKind::Recording => "recording",
            ComponentKind::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentState {
    Registered,
    Started,
    Stopping,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComponentId(usize);

pub type StopHook = Arc<dyn Fn() + Send + Sync>;

struct Component {
    id: ComponentId,
    name: String,
    kind: ComponentKind,
    priority: u8,
    state: ComponentState,
    stop: Option<StopHook>,
}

/// Outcome of one shutdown pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub forced: Vec<String>,
}

pub struct ShutdownCoordinator {
    initiated: AtomicBool,
    next_id: AtomicUsize,
    components: Mutex<Vec<Component>>,
    component_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(component_timeout: Duration) -> Self {
        Self {
            initiated: AtomicBool::new(false),
            next_id: AtomicUsize::new(1),
            components: Mutex::new(Vec::new()),
            component_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Component>>> {
        self.components
            .lock()
            .map_err(|_| anyhow!("shutdown coordinator lock poisoned"))
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Raise the process-wide flag without stopping anything yet.
    pub fn initiate(&self) {
        if !self.initiated.swap(true, Ordering::SeqCst) {
            log::info!("shutdown: initiated");
        }
    }

    pub fn register(
        &self,
        name: &str,
        kind: ComponentKind,
        priority: u8,
        stop: Option<StopHook>,
    ) -> Result<ComponentId> {
        let id = ComponentId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut components = self.lock()?;
        components.push(Component {
            id,
            name: name.to_string(),
            kind,
            priority: priority.min(100),
            state: ComponentState::Registered,
            stop,
        });
        log::debug!("shutdown: registered {} {} (priority {})", kind, name, priority);
        Ok(id)
    }

    pub fn update_state(&self, id: ComponentId, state: ComponentState) {
        if let Ok(mut components) = self.lock() {
            if let Some(c) = components.iter_mut().find(|c| c.id == id) {
                c.state = state;
            }
        }
    }

    pub fn unregister(&self, id: ComponentId) {
        if let Ok(mut components) = self.lock() {
            components.retain(|c| c.id != id);
        }
    }

    pub fn state(&self, id: ComponentId) -> Option<ComponentState> {
        self.lock()
            .ok()?
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.state)
    }

    pub fn component_count(&self) -> usize {
        self.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// `(name, kind, state)` of every registered component.
    pub fn components(&self) -> Vec<(String, ComponentKind, ComponentState)> {
        self.lock()
            .map(|c| {
                c.iter()
                    .map(|c| (c.name.clone(), c.kind, c.state))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stop every registered component, highest priority first.
    pub fn shutdown(&self) -> ShutdownReport {
        self.initiate();
        let mut order: Vec<(ComponentId, String, u8, Option<StopHook>)> = match self.lock() {
            Ok(mut components) => components
                .iter_mut()
                .filter(|c| c.state != ComponentState::Stopped)
                .map(|c| {
                    c.state = ComponentState::Stopping;
                    (c.id, c.name.clone(), c.priority, c.stop.clone())
                })
                .collect(),
            Err(err) => {
                log::error!("shutdown: {}", err);
                return ShutdownReport::default();
            }
        };
        order.sort_by(|a, b| b.2.cmp(&a.2));

        let mut report = ShutdownReport::default();
        for (id, name, priority, stop) in order {
            log::info!("shutdown: stopping {} (priority {})", name, priority);
            if let Some(stop) = stop {
                stop();
            }
            if self.wait_stopped(id, self.component_timeout) {
                report.stopped.push(name);
            } else {
                log::warn!(
                    "shutdown: {} did not stop within {:?}; marking stopped",
                    name,
                    self.component_timeout
                );
                self.update_state(id, ComponentState::Stopped);
                report.forced.push(name);
            }
        }
        log::info!(
            "shutdown: {} components stopped, {} forced",
            report.stopped.len(),
            report.forced.len()
        );
        report
    }

    fn wait_stopped(&self, id: ComponentId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state(id) {
                None | Some(ComponentState::Stopped) => return true,
                _ => {}
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Join `handle` if it finishes within `timeout`. On timeout the thread is
/// detached and logged as leaked; returns false.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, what: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("{}: thread did not exit within {:?}; leaking it", what, timeout);
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        log::error!("{}: thread panicked", what);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn stops_by_descending_priority() {
        let coord = Arc::new(ShutdownCoordinator::new(Duration::from_secs(1)));
        let order = Arc::new(StdMutex::new(Vec::new()));
        for (name, prio) in [("low", 10u8), ("high", 90), ("mid", 60)] {
            let order = order.clone();
            let coord_hook = coord.clone();
            let id_cell: Arc<StdMutex<Option<ComponentId>>> = Arc::new(StdMutex::new(None));
            let id_hook = id_cell.clone();
            let id = coord
                .register(
                    name,
                    ComponentKind::Other,
                    prio,
                    Some(Arc::new(move || {
                        order.lock().unwrap().push(name);
                        if let Some(id) = *id_hook.lock().unwrap() {
                            coord_hook.update_state(id, ComponentState::Stopped);
                        }
                    })),
                )
                .unwrap();
            *id_cell.lock().unwrap() = Some(id);
        }
        let report = coord.shutdown();
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
        assert_eq!(report.stopped.len(), 3);
        assert!(report.forced.is_empty());
        assert!(coord.is_shutdown_initiated());
    }

    #[test]
    fn unresponsive_component_is_forced() {
        let coord = ShutdownCoordinator::new(Duration::from_millis(100));
        let id = coord
            .register("stuck", ComponentKind::Reader, 50, None)
            .unwrap();
        coord.update_state(id, ComponentState::Started);
        let started = Instant::now();
        let report = coord.shutdown();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(report.forced, vec!["stuck".to_string()]);
        assert_eq!(coord.state(id), Some(ComponentState::Stopped));
    }

    #[test]
    fn join_gives_up_after_deadline() {
        let quick = std::thread::spawn(|| {});
        assert!(join_with_timeout(quick, Duration::from_secs(1), "quick"));
        let slow = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(400)));
        assert!(!join_with_timeout(slow, Duration::from_millis(50), "slow"));
    }

    #[test]
    fn unregistered_components_count_as_stopped() {
        let coord = ShutdownCoordinator::new(Duration::from_secs(5));
        let id = coord
            .register("gone", ComponentKind::HlsWriter, 60, None)
            .unwrap();
        coord.unregister(id);
        assert_eq!(coord.component_count(), 0);
        assert!(coord.wait_stopped(id, Duration::from_millis(10)));
    }
}
