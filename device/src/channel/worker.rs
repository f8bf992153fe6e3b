// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capture and release threads of a channel.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;

use crate::BufferDoneSink;
use crate::CsiChannel;
use crate::ViRegisters;

use super::ChannelError;
use super::ChannelInner;

/// Point where the worker threads park while the channel is frozen.
#[derive(Debug, Default)]
pub(super) struct FreezeGate {
    frozen: Mutex<bool>,
    cond: Condvar,
}

impl FreezeGate {
    fn lock(&self) -> MutexGuard<bool> {
        self.frozen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn freeze(&self) {
        *self.lock() = true;
    }

    pub(super) fn thaw(&self) {
        *self.lock() = false;
        self.cond.notify_all();
    }

    /// Blocks while frozen, unless `stop` is set.
    fn wait_thawed(&self, stop: &AtomicBool) {
        let mut frozen = self.lock();
        while *frozen && !stop.load(Ordering::SeqCst) {
            frozen = self
                .cond
                .wait(frozen)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes up parked threads so they can notice their stop flag.
    fn wake_all(&self) {
        let _frozen = self.lock();
        self.cond.notify_all();
    }
}

/// Handles of the worker threads of a streaming channel.
pub(super) struct Workers {
    capture: JoinHandle<()>,
    release: JoinHandle<()>,
}

fn capture_thread<R, C, S>(inner: &ChannelInner<R, C, S>)
where
    R: ViRegisters,
    C: CsiChannel,
    S: BufferDoneSink,
{
    let stop = &inner.stop_capture;
    loop {
        inner.freeze.wait_thawed(stop);
        if !inner.capture_queue.wait_for_entry(stop) {
            break;
        }
        inner.freeze.wait_thawed(stop);
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let Some(buf) = inner.capture_queue.dequeue() else {
            continue;
        };
        let fmt = inner.format();
        inner.capture_frame(&mut inner.producer(), &fmt, buf);
    }
    log::debug!("{}: capture thread exiting", inner.config.name);
}

fn release_thread<R, C, S>(inner: &ChannelInner<R, C, S>)
where
    R: ViRegisters,
    C: CsiChannel,
    S: BufferDoneSink,
{
    let stop = &inner.stop_release;
    loop {
        inner.freeze.wait_thawed(stop);
        if !inner.inflight.wait_for_entry(stop) {
            break;
        }

        let Some(buf) = inner.inflight.dequeue() else {
            continue;
        };
        inner.release_frame(buf);
    }
    log::debug!("{}: release thread exiting", inner.config.name);
}

fn spawn_named<R, C, S>(
    inner: &Arc<ChannelInner<R, C, S>>,
    role: &'static str,
    body: fn(&ChannelInner<R, C, S>),
) -> Result<JoinHandle<()>, ChannelError>
where
    R: ViRegisters + 'static,
    C: CsiChannel + 'static,
    S: BufferDoneSink + 'static,
{
    let name = format!("{}-{}", inner.config.name, role);
    let inner = Arc::clone(inner);
    thread::Builder::new()
        .name(name)
        .spawn(move || body(&inner))
        .map_err(|e| ChannelError::ThreadSpawn(role, e))
}

fn join(handle: JoinHandle<()>, role: &str) {
    if handle.join().is_err() {
        log::error!("{} thread panicked", role);
    }
}

fn stop_capture<R, C, S>(inner: &ChannelInner<R, C, S>, handle: JoinHandle<()>) {
    inner.stop_capture.store(true, Ordering::SeqCst);
    inner.capture_queue.wake_all();
    inner.freeze.wake_all();
    join(handle, "capture");
}

/// Starts the capture and release threads of `inner`.
pub(super) fn spawn<R, C, S>(inner: &Arc<ChannelInner<R, C, S>>) -> Result<Workers, ChannelError>
where
    R: ViRegisters + 'static,
    C: CsiChannel + 'static,
    S: BufferDoneSink + 'static,
{
    let capture = spawn_named(inner, "capture", capture_thread::<R, C, S>)?;
    let release = match spawn_named(inner, "release", release_thread::<R, C, S>) {
        Ok(release) => release,
        Err(e) => {
            stop_capture(inner, capture);
            // Frames the capture thread already started.
            while let Some(buf) = inner.inflight.dequeue() {
                inner.release_frame(buf);
            }
            return Err(e);
        }
    };

    Ok(Workers { capture, release })
}

/// Stops the worker threads of `inner`.
///
/// The capture thread is stopped first. The buffers it left inflight are then completed from the
/// calling thread, concurrently with the release thread, which is stopped last.
pub(super) fn stop<R, C, S>(inner: &ChannelInner<R, C, S>, workers: Workers)
where
    R: ViRegisters,
    C: CsiChannel,
    S: BufferDoneSink,
{
    stop_capture(inner, workers.capture);

    while let Some(buf) = inner.inflight.dequeue() {
        inner.release_frame(buf);
    }

    inner.stop_release.store(true, Ordering::SeqCst);
    inner.inflight.wake_all();
    inner.freeze.wake_all();
    join(workers.release, "release");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::FreezeGate;

    #[test]
    fn freeze_gate() {
        let gate = Arc::new(FreezeGate::default());
        let stop = Arc::new(AtomicBool::new(false));

        // Not frozen, returns immediately.
        gate.wait_thawed(&stop);

        gate.freeze();
        let parked = {
            let gate = Arc::clone(&gate);
            let stop = Arc::clone(&stop);
            thread::spawn(move || gate.wait_thawed(&stop))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!parked.is_finished());
        gate.thaw();
        parked.join().unwrap();

        gate.freeze();
        let parked = {
            let gate = Arc::clone(&gate);
            let stop = Arc::clone(&stop);
            thread::spawn(move || gate.wait_thawed(&stop))
        };
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::SeqCst);
        gate.wake_all();
        parked.join().unwrap();
    }
}
