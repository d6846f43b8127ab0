//! Packet pre-roll buffers.
//!
//! - `PreBuffer`: bounded ring of ref-counted packet clones for one stream.
//!   Pushing into a full ring drops the oldest packet.
//! - `PreBufferPool`: fixed number of slots, one buffer per stream.
//!
//! Every packet reference that enters a buffer leaves it exactly once: taken
//! by the caller, flushed, evicted, or cleared. `PreBufferStats` keeps the
//! arithmetic (`packets_in == packets_released + count`).

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::error::NvrError;
use crate::media::{Packet, TimeBase};

/// Upper bound on one ring, whatever fps and pre-roll ask for.
pub const MAX_BUFFER_PACKETS: usize = 4096;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    #[default]
    Memory,
    Disk,
    Hybrid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreBufferStats {
    pub packets_in: u64,
    pub packets_released: u64,
    pub total_packets_dropped: u64,
    pub count: usize,
    pub capacity: usize,
    pub current_bytes: usize,
    pub peak_bytes: usize,
}

/// `1.2 * fps * pre_roll_seconds`, at least one packet.
pub fn estimate_capacity(fps: u32, pre_roll_seconds: u32) -> usize {
    let est = (1.2 * fps as f64 * pre_roll_seconds as f64).ceil() as usize;
    est.clamp(1, MAX_BUFFER_PACKETS)
}

#[derive(Debug)]
pub struct PreBuffer {
    stream: String,
    packets: VecDeque<Packet>,
    capacity: usize,
    target_seconds: u32,
    time_base: TimeBase,
    mode: BufferMode,
    spill_dir: Option<PathBuf>,
    stats: PreBufferStats,
}

impl PreBuffer {
    pub fn new(stream: &str, capacity: usize, target_seconds: u32) -> Self {
        let capacity = capacity.clamp(1, MAX_BUFFER_PACKETS);
        Self {
            stream: stream.to_string(),
            packets: VecDeque::with_capacity(capacity),
            capacity,
            target_seconds,
            time_base: TimeBase::MPEG,
            mode: BufferMode::Memory,
            spill_dir: None,
            stats: PreBufferStats {
                capacity,
                ..Default::default()
            },
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    pub fn spill_dir(&self) -> Option<&Path> {
        self.spill_dir.as_deref()
    }

    /// Time base of the pushed packets, used for readiness.
    pub fn set_time_base(&mut self, time_base: TimeBase) {
        if time_base.is_valid() {
            self.time_base = time_base;
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PreBufferStats {
        PreBufferStats {
            count: self.packets.len(),
            ..self.stats
        }
    }

    fn release(&mut self, packet: Packet) {
        self.stats.current_bytes = self.stats.current_bytes.saturating_sub(packet.size());
        self.stats.packets_released += 1;
        drop(packet);
    }

    /// Store a clone of `packet`, evicting the oldest entry when full.
    pub fn push(&mut self, packet: &Packet) {
        if self.packets.len() >= self.capacity {
            if let Some(oldest) = self.packets.pop_front() {
                self.stats.total_packets_dropped += 1;
                self.release(oldest);
            }
        }
        self.stats.packets_in += 1;
        self.stats.current_bytes += packet.size();
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.current_bytes);
        self.packets.push_back(packet.clone());
    }

    /// Move the oldest packet out; the caller now owns that reference.
    pub fn take(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.stats.current_bytes = self.stats.current_bytes.saturating_sub(packet.size());
        self.stats.packets_released += 1;
        Some(packet)
    }

    /// A fresh reference to the oldest packet.
    pub fn peek(&self) -> Option<Packet> {
        self.packets.front().cloned()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    /// Hand every packet, oldest first, to `write`, then empty the ring.
    /// Each reference is released whether or not the write succeeded.
    /// Returns the number of successful writes.
    pub fn flush<F>(&mut self, mut write: F) -> usize
    where
        F: FnMut(&Packet) -> Result<()>,
    {
        let mut written = 0;
        while let Some(packet) = self.packets.pop_front() {
            match write(&packet) {
                Ok(()) => written += 1,
                Err(err) => log::debug!("prebuffer {}: flush write failed: {:#}", self.stream, err),
            }
            self.release(packet);
        }
        written
    }

    pub fn clear(&mut self) {
        while let Some(packet) = self.packets.pop_front() {
            self.release(packet);
        }
    }

    fn timestamp(packet: &Packet) -> Option<i64> {
        packet.pts.or(packet.dts)
    }

    /// Seconds between the oldest and newest buffered packet.
    pub fn duration_seconds(&self) -> f64 {
        let oldest = self.packets.iter().find_map(Self::timestamp);
        let newest = self.packets.iter().rev().find_map(Self::timestamp);
        match (oldest, newest) {
            (Some(o), Some(n)) if n > o => self.time_base.to_seconds(n - o),
            _ => 0.0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.duration_seconds() >= self.target_seconds as f64
    }
}

// ----------------------------------------------------------------------------
// Pool
// ----------------------------------------------------------------------------

pub type SharedPreBuffer = Arc<Mutex<PreBuffer>>;

/// Fixed set of per-stream buffers.
pub struct PreBufferPool {
    slots: Mutex<Vec<Option<SharedPreBuffer>>>,
    mode: BufferMode,
    storage_root: PathBuf,
}

impl PreBufferPool {
    pub fn new(max_streams: usize, mode: BufferMode, storage_root: &Path) -> Self {
        Self {
            slots: Mutex::new(vec![None; max_streams.max(1)]),
            mode,
            storage_root: storage_root.to_path_buf(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Option<SharedPreBuffer>>>> {
        self.slots
            .lock()
            .map_err(|_| anyhow!("prebuffer pool lock poisoned"))
    }

    /// Buffer for `stream`, created on first use with room for `pre_roll_seconds` at `fps`.
    pub fn acquire(&self, stream: &str, fps: u32, pre_roll_seconds: u32) -> Result<SharedPreBuffer> {
        let mut slots = self.lock()?;
        for slot in slots.iter().flatten() {
            let same = slot
                .lock()
                .map(|b| b.stream == stream)
                .map_err(|_| anyhow!("prebuffer {} lock poisoned", stream))?;
            if same {
                return Ok(slot.clone());
            }
        }
        let free = slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| NvrError::exhausted(format!("no free prebuffer slot for {}", stream)))?;

        let mut buffer = PreBuffer::new(stream, estimate_capacity(fps, pre_roll_seconds), pre_roll_seconds);
        buffer.mode = self.mode;
        if self.mode != BufferMode::Memory {
            let dir = self.storage_root.join(format!(".packet_buffer_{}", stream));
            match fs::create_dir_all(&dir) {
                Ok(()) => buffer.spill_dir = Some(dir),
                Err(err) => log::warn!(
                    "prebuffer {}: cannot create spill dir {}: {}",
                    stream,
                    dir.display(),
                    err
                ),
            }
        }
        log::info!(
            "prebuffer {}: {} packets for {}s pre-roll ({:?})",
            stream,
            buffer.capacity,
            pre_roll_seconds,
            self.mode
        );
        let shared = Arc::new(Mutex::new(buffer));
        slots[free] = Some(shared.clone());
        Ok(shared)
    }

    pub fn get(&self, stream: &str) -> Option<SharedPreBuffer> {
        let slots = self.lock().ok()?;
        slots
            .iter()
            .flatten()
            .find(|slot| slot.lock().map(|b| b.stream == stream).unwrap_or(false))
            .cloned()
    }

    /// Drop the stream's buffer, releasing everything still in it.
    /// Returns its final stats.
    pub fn remove(&self, stream: &str) -> Result<Option<PreBufferStats>> {
        let mut slots = self.lock()?;
        for slot in slots.iter_mut() {
            let matches = match slot {
                Some(buf) => buf.lock().map(|b| b.stream == stream).unwrap_or(false),
                None => false,
            };
            if matches {
                if let Some(buf) = slot.take() {
                    let mut guard = buf
                        .lock()
                        .map_err(|_| anyhow!("prebuffer {} lock poisoned", stream))?;
                    guard.clear();
                    return Ok(Some(guard.stats()));
                }
            }
        }
        Ok(None)
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .map(|slots| slots.iter().flatten().count())
            .unwrap_or(0)
    }

    /// Sum of the stats of every live buffer.
    pub fn totals(&self) -> PreBufferStats {
        let mut total = PreBufferStats::default();
        if let Ok(slots) = self.lock() {
            for slot in slots.iter().flatten() {
                if let Ok(buf) = slot.lock() {
                    let s = buf.stats();
                    total.packets_in += s.packets_in;
                    total.packets_released += s.packets_released;
                    total.total_packets_dropped += s.total_packets_dropped;
                    total.count += s.count;
                    total.capacity += s.capacity;
                    total.current_bytes += s.current_bytes;
                    total.peak_bytes += s.peak_bytes;
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pkt(ts: i64) -> Packet {
        Packet::new(vec![0u8; 100], 0).with_timestamps(Some(ts), Some(ts))
    }

    #[test]
    fn capacity_estimate() {
        assert_eq!(estimate_capacity(10, 5), 60);
        assert_eq!(estimate_capacity(0, 5), 1);
        assert_eq!(estimate_capacity(1000, 1000), MAX_BUFFER_PACKETS);
    }

    #[test]
    fn push_evicts_oldest_and_counts_drops() {
        let mut buf = PreBuffer::new("cam1", 3, 1);
        for i in 0..5 {
            buf.push(&pkt(i * 9000));
            assert!(buf.len() <= 3);
        }
        let stats = buf.stats();
        assert_eq!(stats.total_packets_dropped, 2);
        assert_eq!(stats.packets_in, 5);
        assert_eq!(stats.packets_released, 2);
        assert_eq!(buf.peek().unwrap().pts, Some(2 * 9000));
    }

    #[test]
    fn flush_releases_every_reference_once() {
        let mut buf = PreBuffer::new("cam1", 10, 1);
        let originals: Vec<Packet> = (0..6).map(|i| pkt(i * 3000)).collect();
        for p in &originals {
            buf.push(p);
        }
        assert!(originals.iter().all(|p| p.ref_count() == 2));

        let mut seen = Vec::new();
        let written = buf.flush(|p| {
            seen.push(p.pts.unwrap());
            if p.pts == Some(6000) {
                Err(anyhow!("disk full"))
            } else {
                Ok(())
            }
        });
        assert_eq!(written, 5);
        assert_eq!(seen, vec![0, 3000, 6000, 9000, 12000, 15000]);
        assert!(buf.is_empty());
        assert!(originals.iter().all(|p| p.ref_count() == 1));
        let stats = buf.stats();
        assert_eq!(stats.packets_in, stats.packets_released);
        assert_eq!(stats.current_bytes, 0);
        assert_eq!(stats.peak_bytes, 600);
    }

    #[test]
    fn take_moves_and_peek_clones() {
        let mut buf = PreBuffer::new("cam1", 4, 1);
        let p = pkt(0);
        buf.push(&p);
        let peeked = buf.peek().unwrap();
        assert_eq!(p.ref_count(), 3);
        drop(peeked);
        let taken = buf.take().unwrap();
        assert_eq!(p.ref_count(), 2);
        assert!(buf.take().is_none());
        drop(taken);
        assert_eq!(p.ref_count(), 1);
    }

    #[test]
    fn readiness_tracks_buffered_span() {
        let mut buf = PreBuffer::new("cam1", 100, 2);
        buf.push(&pkt(0));
        buf.push(&pkt(90_000));
        assert!(!buf.is_ready());
        buf.push(&Packet::new(vec![1], 0));
        buf.push(&pkt(180_000));
        assert!(buf.is_ready());
        assert!((buf.duration_seconds() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn pool_has_fixed_slots() {
        let dir = TempDir::new().unwrap();
        let pool = PreBufferPool::new(2, BufferMode::Memory, dir.path());
        let a = pool.acquire("a", 10, 5).unwrap();
        let again = pool.acquire("a", 10, 5).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        pool.acquire("b", 10, 5).unwrap();
        let err = pool.acquire("c", 10, 5).unwrap_err();
        assert!(matches!(
            NvrError::classify(&err),
            Some(NvrError::ResourceExhausted(_))
        ));

        a.lock().unwrap().push(&pkt(0));
        let stats = pool.remove("a").unwrap().unwrap();
        assert_eq!(stats.packets_in, stats.packets_released);
        assert_eq!(pool.active_count(), 1);
        pool.acquire("c", 10, 5).unwrap();
    }

    #[test]
    fn disk_mode_creates_spill_dir() {
        let dir = TempDir::new().unwrap();
        let pool = PreBufferPool::new(1, BufferMode::Disk, dir.path());
        let buf = pool.acquire("cam9", 10, 2).unwrap();
        let guard = buf.lock().unwrap();
        assert_eq!(guard.mode(), BufferMode::Disk);
        let spill = guard.spill_dir().unwrap();
        assert!(spill.ends_with(".packet_buffer_cam9"));
        assert!(spill.is_dir());
    }
}
