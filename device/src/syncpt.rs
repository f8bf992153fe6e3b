// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Syncpoints, the hardware completion counters of the VI.
//!
//! A syncpoint has two values: `min`, the number of increments the hardware has performed, and
//! `max`, the number of increments software has asked for so far. Software reserves increments
//! with [`SyncpointPool::incr_max`], programs the hardware to perform them, and waits for `min`
//! to reach the returned threshold. All comparisons are wrap-aware.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

use crate::regs::TEGRA_CSI_BLOCKS;

/// Maximum number of syncpoints in a pool. Ids are encoded on 8 bits in the increment registers.
pub const MAX_SYNCPOINTS: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncpointError {
    #[error("no free syncpoint left")]
    Exhausted,
    #[error("timed out waiting for syncpoint {id} to reach {threshold} (currently {current})")]
    Timeout {
        id: u32,
        threshold: u32,
        current: u32,
    },
}

/// Id of a syncpoint allocated from a [`SyncpointPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncpointId(u32);

impl SyncpointId {
    #[cfg(feature = "sim")]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Value to program into the hardware.
    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Returns the current time of the raw monotonic clock, which is not subject to NTP
/// adjustments.
pub fn monotonic_raw() -> Duration {
    // SAFETY: all-zeroes is a valid `timespec`.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: `ts` is a valid timespec that outlives the call.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) } < 0 {
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Returns whether `value` has reached `threshold`, assuming both are less than half the
/// counter range apart.
pub fn threshold_reached(value: u32, threshold: u32) -> bool {
    (value.wrapping_sub(threshold) as i32) >= 0
}

#[derive(Debug, Default)]
struct Syncpoint {
    allocated: bool,
    min: u32,
    max: u32,
    /// Time of the last hardware increment.
    timestamp: Duration,
}

/// Set of syncpoints shared by the VI channels and the hardware that increments them.
pub struct SyncpointPool {
    syncpts: Mutex<Vec<Syncpoint>>,
    /// Signaled on every change of a `min` value.
    cond: Condvar,
}

impl SyncpointPool {
    /// Creates a pool of `count` syncpoints. Id 0 is reserved, so `count - 1` of them can be
    /// allocated.
    pub fn new(count: usize) -> Self {
        let count = count.clamp(1, MAX_SYNCPOINTS);
        let mut syncpts: Vec<Syncpoint> = Vec::with_capacity(count);
        syncpts.resize_with(count, Default::default);
        // Id 0 is never handed out.
        syncpts[0].allocated = true;

        Self {
            syncpts: Mutex::new(syncpts),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<Vec<Syncpoint>> {
        self.syncpts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a free syncpoint.
    pub fn alloc(&self) -> Result<SyncpointId, SyncpointError> {
        let mut syncpts = self.lock();
        let (index, syncpt) = syncpts
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.allocated)
            .ok_or(SyncpointError::Exhausted)?;
        syncpt.allocated = true;
        log::trace!("allocated syncpoint {}", index);
        Ok(SyncpointId(index as u32))
    }

    /// Returns `id` to the pool.
    pub fn put(&self, id: SyncpointId) {
        let mut syncpts = self.lock();
        if let Some(syncpt) = syncpts.get_mut(id.index()) {
            if !syncpt.allocated {
                log::warn!("syncpoint {} released twice", id.raw());
            }
            syncpt.allocated = false;
        }
    }

    /// Returns the number of syncpoints that can still be allocated.
    pub fn available(&self) -> usize {
        self.lock().iter().filter(|s| !s.allocated).count()
    }

    /// Reserves `incrs` increments on `id` and returns the value `min` will have once they are
    /// performed.
    pub fn incr_max(&self, id: SyncpointId, incrs: u32) -> u32 {
        let mut syncpts = self.lock();
        let syncpt = &mut syncpts[id.index()];
        syncpt.max = syncpt.max.wrapping_add(incrs);
        syncpt.max
    }

    pub fn read_min(&self, id: SyncpointId) -> u32 {
        self.lock()[id.index()].min
    }

    pub fn read_max(&self, id: SyncpointId) -> u32 {
        self.lock()[id.index()].max
    }

    /// Performs one increment of `id`, as the hardware does when a condition it was armed on is
    /// raised.
    pub fn cpu_incr(&self, id: SyncpointId) {
        let mut syncpts = self.lock();
        let syncpt = &mut syncpts[id.index()];
        syncpt.min = syncpt.min.wrapping_add(1);
        syncpt.timestamp = monotonic_raw();
        log::trace!("syncpoint {} incremented to {}", id.raw(), syncpt.min);
        drop(syncpts);
        self.cond.notify_all();
    }

    /// Discards all pending increments of `id` by moving `min` up to `max`. Returns the new value.
    pub fn set_min_eq_max(&self, id: SyncpointId) -> u32 {
        let mut syncpts = self.lock();
        let syncpt = &mut syncpts[id.index()];
        syncpt.min = syncpt.max;
        let value = syncpt.min;
        drop(syncpts);
        self.cond.notify_all();
        value
    }

    /// Waits for `min` of `id` to reach `threshold`, for at most `timeout`.
    ///
    /// Returns the time of the last increment of the syncpoint on success. A `timeout` too large
    /// to be represented as a deadline waits forever.
    pub fn wait_timeout(
        &self,
        id: SyncpointId,
        threshold: u32,
        timeout: Duration,
    ) -> Result<Duration, SyncpointError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut syncpts = self.lock();
        loop {
            let syncpt = &syncpts[id.index()];
            if threshold_reached(syncpt.min, threshold) {
                return Ok(syncpt.timestamp);
            }

            let Some(deadline) = deadline else {
                syncpts = self
                    .cond
                    .wait(syncpts)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(SyncpointError::Timeout {
                    id: id.raw(),
                    threshold,
                    current: syncpt.min,
                });
            }

            syncpts = self
                .cond
                .wait_timeout(syncpts, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Hardware event a syncpoint of a channel port is armed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncptEvent {
    FrameStart = 0,
    MwAckDone = 1,
}

/// Number of increments still queued in the hardware syncpoint FIFO from before a reset, per
/// port and event.
///
/// While an event has credit, arming it again would overflow the FIFO: the increment reserved for
/// the next frame is provided by one of the queued ones instead.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncptFifo {
    credit: [[u32; 2]; TEGRA_CSI_BLOCKS],
}

impl SyncptFifo {
    /// Consumes one credit of `event` on port `index`. Returns `true` if there was one, in which
    /// case the event must not be armed.
    pub fn take(&mut self, index: usize, event: SyncptEvent) -> bool {
        let credit = &mut self.credit[index][event as usize];
        if *credit == 0 {
            return false;
        }
        *credit -= 1;
        true
    }

    /// Records that the FIFO of `event` on port `index` is full.
    pub fn bank(&mut self, index: usize, event: SyncptEvent, depth: u32) {
        self.credit[index][event as usize] = depth;
    }

    pub fn credit(&self, index: usize, event: SyncptEvent) -> u32 {
        self.credit[index][event as usize]
    }

    /// Forgets all credit, once the VI has been powered off.
    pub fn clear(&mut self) {
        *self = Default::default();
    }
}
