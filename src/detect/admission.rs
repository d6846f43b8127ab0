//! Global cap on concurrent detections.
//!
//! Every running detection holds one slot carrying its stream name. The cap
//! is soft: past it the detection still runs and a "high detection load"
//! warning is logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};

#[derive(Debug, Default)]
struct Slots {
    names: Vec<Option<String>>,
    active: usize,
    peak: usize,
}

pub struct DetectionAdmission {
    capacity: usize,
    slots: Mutex<Slots>,
    overloads: AtomicU64,
}

impl DetectionAdmission {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(Slots {
                names: vec![None; capacity.max(1)],
                ..Default::default()
            }),
            overloads: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slots>> {
        self.slots
            .lock()
            .map_err(|_| anyhow!("detection admission lock poisoned"))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a slot for `stream`. Never refuses.
    pub fn admit(&self, stream: &str) -> Result<AdmissionGuard<'_>> {
        let mut slots = self.lock()?;
        let index = match slots.names.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                slots.names.push(None);
                slots.names.len() - 1
            }
        };
        slots.names[index] = Some(stream.to_string());
        slots.active += 1;
        slots.peak = slots.peak.max(slots.active);
        let active = slots.active;
        drop(slots);

        if active > self.capacity {
            self.overloads.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "detect {}: high detection load ({} running, limit {}); proceeding",
                stream,
                active,
                self.capacity
            );
        }
        Ok(AdmissionGuard { owner: self, index })
    }

    fn leave(&self, index: usize) {
        if let Ok(mut slots) = self.lock() {
            if let Some(slot) = slots.names.get_mut(index) {
                if slot.take().is_some() {
                    slots.active -= 1;
                }
            }
            let capacity = self.capacity;
            while slots.names.len() > capacity && matches!(slots.names.last(), Some(None)) {
                slots.names.pop();
            }
        }
    }

    pub fn active(&self) -> usize {
        self.lock().map(|s| s.active).unwrap_or(0)
    }

    /// Stream names currently holding a slot.
    pub fn active_streams(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.names.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn peak(&self) -> usize {
        self.lock().map(|s| s.peak).unwrap_or(0)
    }

    /// Admissions that went past the cap.
    pub fn overloads(&self) -> u64 {
        self.overloads.load(Ordering::Relaxed)
    }
}

/// Slot held for the duration of one detection.
pub struct AdmissionGuard<'a> {
    owner: &'a DetectionAdmission,
    index: usize,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.owner.leave(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_matches_named_slots() {
        let admission = DetectionAdmission::new(2);
        let a = admission.admit("cam1").unwrap();
        let b = admission.admit("cam2").unwrap();
        assert_eq!(admission.active(), 2);
        assert_eq!(admission.active_streams().len(), admission.active());
        drop(a);
        assert_eq!(admission.active(), 1);
        assert_eq!(admission.active_streams(), vec!["cam2".to_string()]);
        drop(b);
        assert_eq!(admission.active(), 0);
        assert_eq!(admission.overloads(), 0);
    }

    #[test]
    fn over_capacity_still_admits() {
        let admission = DetectionAdmission::new(2);
        let guards: Vec<_> = ["cam1", "cam2", "cam3"]
            .iter()
            .map(|s| admission.admit(s).unwrap())
            .collect();
        assert_eq!(admission.active(), 3);
        assert_eq!(admission.active_streams().len(), 3);
        assert_eq!(admission.overloads(), 1);
        drop(guards);
        assert_eq!(admission.active(), 0);
        assert_eq!(admission.peak(), 3);
        assert!(admission.active_streams().is_empty());
    }
}
