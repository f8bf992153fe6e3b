// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! FIFO of frame buffers shared between the control plane and a worker thread.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::buffer::BufferState;
use crate::buffer::FrameBuffer;
use crate::BufferDoneSink;

/// Thread-safe FIFO of buffers, with a condition to wait for new entries on.
#[derive(Default)]
pub struct BufferQueue {
    entries: Mutex<VecDeque<FrameBuffer>>,
    wait: Condvar,
}

impl BufferQueue {
    pub fn new() -> Self {
        Default::default()
    }

    // Critical sections never leave the queue half-updated.
    fn lock(&self) -> MutexGuard<VecDeque<FrameBuffer>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `buffer` at the tail of the queue and wakes up waiters.
    pub fn enqueue(&self, buffer: FrameBuffer) {
        self.lock().push_back(buffer);
        self.wait.notify_all();
    }

    /// Removes and returns the buffer at the head of the queue, if any.
    pub fn dequeue(&self) -> Option<FrameBuffer> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Blocks until the queue has an entry or `stop` is set.
    ///
    /// Returns `false` if the wait ended because of `stop`, in which case the caller must not
    /// process the queue anymore. `stop` must be set before calling [`Self::wake_all`] for the
    /// waiter to notice it.
    pub fn wait_for_entry(&self, stop: &AtomicBool) -> bool {
        let mut entries = self.lock();
        loop {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            if !entries.is_empty() {
                return true;
            }
            entries = self
                .wait
                .wait(entries)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes up all the threads blocked in [`Self::wait_for_entry`].
    pub fn wake_all(&self) {
        // Taking the lock orders this wakeup after the check of a waiter about to sleep.
        let _entries = self.lock();
        self.wait.notify_all();
    }

    /// Removes all the buffers from the queue and returns them to `sink` with `state`.
    ///
    /// The queue is locked for the whole operation, so a concurrent `dequeue` either gets a buffer
    /// before the drain or finds the queue empty.
    pub fn drain<S: BufferDoneSink + ?Sized>(&self, state: BufferState, sink: &S) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        for mut buffer in entries.drain(..) {
            buffer.state = state;
            sink.buffer_done(buffer);
        }
        count
    }
}
