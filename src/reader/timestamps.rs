//! Missing/invalid timestamp repair on the read path.
//!
//! Every reader owns a [`StreamTimestamps`]; UDP readers additionally take the
//! process-wide [`TimestampTracker`] lock while correcting a packet so that
//! corrections across UDP streams are serialised.

use std::sync::{Mutex, MutexGuard};

use crate::media::{Packet, StreamInfo};

/// 1/30 s at the 90 kHz clock.
pub const DEFAULT_FRAME_DURATION: i64 = 2997;

/// Shared UDP correction lock.
#[derive(Debug, Default)]
pub struct TimestampTracker {
    udp: Mutex<()>,
}

impl TimestampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_udp(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`: a poisoned lock carries no broken state.
        self.udp.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-stream correction state.
#[derive(Clone, Debug)]
pub struct StreamTimestamps {
    is_udp: bool,
    initialized: bool,
    last_pts: i64,
    frame_duration: i64,
    repaired: u64,
}

impl StreamTimestamps {
    pub fn new(is_udp: bool) -> Self {
        Self {
            is_udp,
            initialized: false,
            last_pts: 0,
            frame_duration: 0,
            repaired: 0,
        }
    }

    pub fn is_udp(&self) -> bool {
        self.is_udp
    }

    pub fn frame_duration(&self) -> i64 {
        self.frame_duration
    }

    pub fn last_pts(&self) -> i64 {
        self.last_pts
    }

    /// Packets that needed a fill or a clamp.
    pub fn repaired(&self) -> u64 {
        self.repaired
    }

    fn init(&mut self, info: &StreamInfo) {
        self.last_pts = 0;
        self.frame_duration = info
            .frame_rate
            .and_then(|rate| rate.frame_duration(info.time_base))
            .unwrap_or(DEFAULT_FRAME_DURATION);
        self.initialized = true;
    }

    /// Repair `packet` in place.
    pub fn correct(&mut self, tracker: &TimestampTracker, packet: &mut Packet, info: &StreamInfo) {
        if self.is_udp {
            let _guard = tracker.lock_udp();
            self.apply(packet, info);
        } else {
            self.apply(packet, info);
        }
    }

    fn apply(&mut self, packet: &mut Packet, info: &StreamInfo) {
        if !self.initialized {
            self.init(info);
        }
        let before = (packet.pts, packet.dts);
        match (packet.pts, packet.dts) {
            (None, Some(dts)) => packet.pts = Some(dts),
            (Some(pts), None) => packet.dts = Some(pts),
            (None, None) => {
                let generated = if self.last_pts > 0 {
                    self.last_pts + self.frame_duration
                } else {
                    1
                };
                packet.pts = Some(generated);
                packet.dts = Some(generated);
            }
            (Some(_), Some(_)) => {}
        }
        if self.is_udp {
            if let (Some(pts), Some(dts)) = (packet.pts, packet.dts) {
                if pts <= 0 {
                    packet.pts = Some(dts.max(1));
                }
                if dts <= 0 {
                    packet.dts = Some(packet.pts.unwrap_or(1).max(1));
                }
            }
        }
        if let Some(pts) = packet.pts {
            if pts > 0 {
                self.last_pts = pts;
            }
        }
        if (packet.pts, packet.dts) != before {
            self.repaired += 1;
            log::debug!(
                "timestamps: repaired {:?}/{:?} -> {:?}/{:?}",
                before.0,
                before.1,
                packet.pts,
                packet.dts
            );
        }
    }
}
