//! Reusable frame buffers for detection.
//!
//! A fixed number of slots, each holding at most one byte buffer. A request
//! takes an idle slot whose buffer is big enough, else an empty slot, else
//! replaces the buffer of the least recently used idle slot. Buffers go back
//! to their slot when the [`PooledBuffer`] guard drops.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::error::NvrError;

pub const POOL_SLOTS: usize = 8;
pub const ALLOC_RETRIES: u32 = 3;
pub const ALLOC_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Slot {
    buffer: Option<Vec<u8>>,
    in_use: bool,
    last_used: Instant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: usize,
    pub allocated_slots: usize,
    pub allocated_bytes: usize,
    pub reuses: u64,
    pub allocations: u64,
    pub failures: u64,
}

pub struct BufferPool {
    slots: Mutex<Vec<Slot>>,
    counters: Mutex<(u64, u64, u64)>,
    retry_delay: Duration,
}

impl BufferPool {
    pub fn new(slots: usize) -> Self {
        let now = Instant::now();
        Self {
            slots: Mutex::new(
                (0..slots.max(1))
                    .map(|_| Slot {
                        buffer: None,
                        in_use: false,
                        last_used: now,
                    })
                    .collect(),
            ),
            counters: Mutex::new((0, 0, 0)),
            retry_delay: ALLOC_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Slot>>> {
        self.slots
            .lock()
            .map_err(|_| anyhow!("buffer pool lock poisoned"))
    }

    fn count(&self, f: impl FnOnce(&mut (u64, u64, u64))) {
        if let Ok(mut counters) = self.counters.lock() {
            f(&mut counters);
        }
    }

    /// A zeroed buffer of exactly `size` bytes, retried a few times while the
    /// pool is busy or memory is short.
    pub fn acquire(&self, size: usize) -> Result<PooledBuffer<'_>> {
        for attempt in 0..ALLOC_RETRIES {
            match self.try_acquire(size) {
                Ok(Some(buffer)) => return Ok(buffer),
                Ok(None) => log::debug!("pool: no idle slot for {} bytes (attempt {})", size, attempt + 1),
                Err(err) => log::debug!("pool: allocation of {} bytes failed: {:#}", size, err),
            }
            if attempt + 1 < ALLOC_RETRIES {
                std::thread::sleep(self.retry_delay);
            }
        }
        self.count(|c| c.2 += 1);
        Err(NvrError::exhausted(format!(
            "no frame buffer of {} bytes after {} attempts",
            size, ALLOC_RETRIES
        )))
    }

    fn try_acquire(&self, size: usize) -> Result<Option<PooledBuffer<'_>>> {
        let mut slots = self.lock()?;

        let reusable = slots
            .iter()
            .position(|s| !s.in_use && s.buffer.as_ref().is_some_and(|b| b.capacity() >= size));
        if let Some(index) = reusable {
            let slot = &mut slots[index];
            let mut buffer = slot.buffer.take().unwrap_or_default();
            buffer.clear();
            buffer.resize(size, 0);
            slot.in_use = true;
            drop(slots);
            self.count(|c| c.0 += 1);
            return Ok(Some(PooledBuffer::new(self, index, buffer)));
        }

        let target = slots
            .iter()
            .position(|s| !s.in_use && s.buffer.is_none())
            .or_else(|| {
                slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !s.in_use)
                    .min_by_key(|(_, s)| s.last_used)
                    .map(|(i, _)| i)
            });
        let Some(index) = target else {
            return Ok(None);
        };
        slots[index].buffer = None;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size)
            .map_err(|e| anyhow!("cannot reserve {} bytes: {}", size, e))?;
        buffer.resize(size, 0);
        slots[index].in_use = true;
        drop(slots);
        self.count(|c| c.1 += 1);
        Ok(Some(PooledBuffer::new(self, index, buffer)))
    }

    fn release(&self, index: usize, buffer: Vec<u8>) {
        match self.slots.lock() {
            Ok(mut slots) => {
                if let Some(slot) = slots.get_mut(index) {
                    slot.buffer = Some(buffer);
                    slot.in_use = false;
                    slot.last_used = Instant::now();
                }
            }
            Err(_) => log::error!("pool: lock poisoned; dropping buffer of slot {}", index),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        if let Ok(slots) = self.lock() {
            stats.in_use = slots.iter().filter(|s| s.in_use).count();
            stats.allocated_slots = slots.iter().filter(|s| s.buffer.is_some()).count();
            stats.allocated_bytes = slots
                .iter()
                .filter_map(|s| s.buffer.as_ref())
                .map(Vec::capacity)
                .sum();
        }
        if let Ok(c) = self.counters.lock() {
            stats.reuses = c.0;
            stats.allocations = c.1;
            stats.failures = c.2;
        }
        stats
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(POOL_SLOTS)
    }
}

/// Buffer on loan from a [`BufferPool`].
pub struct PooledBuffer<'p> {
    pool: &'p BufferPool,
    index: usize,
    buffer: Option<Vec<u8>>,
}

impl<'p> PooledBuffer<'p> {
    fn new(pool: &'p BufferPool, index: usize, buffer: Vec<u8>) -> Self {
        Self {
            pool,
            index,
            buffer: Some(buffer),
        }
    }

    pub fn slot(&self) -> usize {
        self.index
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(self.index, buffer);
        }
    }
}
