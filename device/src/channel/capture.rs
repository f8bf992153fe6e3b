// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame programming of the VI and the capture state machine.

use std::sync::atomic::Ordering;

use crate::buffer::BufferState;
use crate::buffer::FrameBuffer;
use crate::format::ChannelFormat;
use crate::format::VfCode;
use crate::regs::*;
use crate::syncpt::monotonic_raw;
use crate::syncpt::SyncpointId;
use crate::syncpt::SyncptEvent;
use crate::BufferDoneSink;
use crate::CsiChannel;
use crate::IoctlResult;
use crate::Subdevice;
use crate::ViRegisters;
use crate::ENOIOCTLCMD;

use super::CaptureState;
use super::ChannelInner;
use super::Producer;

/// Order in which an operation is applied to the sub-devices of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallOrder {
    /// From the sub-device closest to the VI to the source.
    Forward,
    Reverse,
}

/// Calls `op` on all `subdevs` in `order`.
///
/// All sub-devices are called even if one fails. Returns the first error, ignoring sub-devices
/// that do not implement the operation.
fn call_all<F>(
    subdevs: &mut [Box<dyn Subdevice>],
    order: CallOrder,
    what: &str,
    mut op: F,
) -> IoctlResult<()>
where
    F: FnMut(&mut dyn Subdevice) -> IoctlResult<()>,
{
    let mut result = Ok(());
    let mut call = |subdev: &mut Box<dyn Subdevice>| match op(subdev.as_mut()) {
        Ok(()) | Err(ENOIOCTLCMD) => (),
        Err(e) => {
            log::error!("{}: {} failed: {}", subdev.name(), what, e);
            if result.is_ok() {
                result = Err(e);
            }
        }
    };

    match order {
        CallOrder::Forward => subdevs.iter_mut().for_each(&mut call),
        CallOrder::Reverse => subdevs.iter_mut().rev().for_each(&mut call),
    }

    result
}

impl<R, C, S> ChannelInner<R, C, S>
where
    R: ViRegisters,
    C: CsiChannel,
    S: BufferDoneSink,
{
    pub(super) fn csi_read(&self, index: usize, reg: u32) -> u32 {
        self.regs.read(csi_base(self.config.ports[index]) + reg)
    }

    pub(super) fn csi_write(&self, index: usize, reg: u32, val: u32) {
        self.regs.write(csi_base(self.config.ports[index]) + reg, val)
    }

    /// Programs the image geometry and format of all the ports capturing `fmt`.
    pub(super) fn capture_setup(&self, fmt: &ChannelFormat) {
        let vfmt = fmt.vfmt;
        let (width, height) = fmt.port_geometry();
        let word_count = vfmt.word_count(width);
        let bypass = !(self.config.pg_mode
            || self.write_ispformat.load(Ordering::SeqCst)
            || matches!(vfmt.vf_code, VfCode::Yuv422 | VfCode::Rgb888));

        for index in 0..fmt.valid_ports() {
            self.csi_write(index, CSI_ERROR_STATUS, 0xffff_ffff);
            self.csi_write(index, CSI_IMAGE_DEF, image_def(bypass, vfmt.img_fmt));
            self.csi_write(index, CSI_IMAGE_DT, vfmt.img_dt);
            self.csi_write(index, CSI_IMAGE_SIZE_WC, word_count);
            self.csi_write(index, CSI_IMAGE_SIZE, image_size(width, height));
        }
    }

    /// Points the surfaces of all the ports capturing `fmt` at the buffer at `addr`.
    fn program_surfaces(&self, fmt: &ChannelFormat, addr: u64) {
        let stride = fmt.pix.bytesperline;
        for index in 0..fmt.valid_ports() {
            let surface0 = addr.wrapping_add(fmt.gang.offsets[index] as u64);
            self.csi_write(index, CSI_SURFACE0_OFFSET_MSB, (surface0 >> 32) as u32);
            self.csi_write(index, CSI_SURFACE0_OFFSET_LSB, surface0 as u32);
            self.csi_write(index, CSI_SURFACE0_STRIDE, stride);

            // The chroma plane follows the luma one.
            if fmt.vfmt.is_semiplanar() {
                let surface1 = surface0.wrapping_add((fmt.pix.sizeimage / 2) as u64);
                self.csi_write(index, CSI_SURFACE1_OFFSET_MSB, (surface1 >> 32) as u32);
                self.csi_write(index, CSI_SURFACE1_OFFSET_LSB, surface1 as u32);
                self.csi_write(index, CSI_SURFACE1_STRIDE, stride);
            }
        }
    }

    /// Triggers a single-shot capture on port `index`, unless one is already latched.
    fn arm_single_shot(&self, index: usize) {
        if self.csi_read(index, CSI_SINGLE_SHOT) != 0 {
            log::debug!(
                "{}: single shot already armed on port {}",
                self.config.name,
                index
            );
            return;
        }
        self.csi_write(index, CSI_SINGLE_SHOT, SINGLE_SHOT_CAPTURE);
    }

    /// Requests an increment of `id` once `cond` is raised.
    fn arm_syncpt(&self, cond: u32, id: SyncpointId) {
        self.regs.write(VI_INCR_SYNCPT, incr_syncpt(cond, id.raw()));
    }

    /// Resets the hardware if a restart has been requested since it was last set up, and starts
    /// the sub-devices if they are not streaming.
    fn resync(&self, producer: &mut Producer, fmt: &ChannelFormat) -> IoctlResult<()> {
        let restart_version = self.restart_version.load(Ordering::SeqCst);
        if restart_version == producer.capture_version && self.streaming.load(Ordering::SeqCst) {
            return Ok(());
        }

        log::debug!(
            "{}: resync to restart version {}",
            self.config.name,
            restart_version
        );
        self.ec_recover(producer, fmt);
        self.set_stream(true)?;
        producer.capture_version = restart_version;

        // Memory writes are only enabled once everything else is set up.
        for index in 0..fmt.valid_ports() {
            let val = self.csi_read(index, CSI_IMAGE_DEF);
            self.csi_write(index, CSI_IMAGE_DEF, val | IMAGE_DEF_DEST_MEM);
        }

        Ok(())
    }

    /// Captures the next frame into `buf`.
    ///
    /// On success the buffer is moved to the inflight queue, where the release thread waits for
    /// its memory write to complete. Otherwise it is returned right away and a restart is
    /// requested.
    pub(super) fn capture_frame(
        &self,
        producer: &mut Producer,
        fmt: &ChannelFormat,
        mut buf: FrameBuffer,
    ) {
        let valid_ports = fmt.valid_ports();
        self.program_surfaces(fmt, buf.addr);

        // Recovery discards pending syncpoint increments, so it must happen before the
        // thresholds of this frame are reserved.
        if let Err(e) = self.resync(producer, fmt) {
            log::error!("{}: failed to enable stream: {}", self.config.name, e);
            buf.state = BufferState::Error;
            buf.timestamp = monotonic_raw();
            self.set_capture_state(CaptureState::Error);
            self.release_buffer(buf);
            return;
        }

        let mut frame_start = [0u32; TEGRA_CSI_BLOCKS];
        for (index, port, syncpts) in self.ports(valid_ports) {
            frame_start[index] = self.pool.incr_max(syncpts.frame_start, 1);
            // Increments still queued from before the last reset stand in for this frame's.
            if !producer.fifo.take(index, SyncptEvent::FrameStart) {
                self.arm_syncpt(frame_start_cond(port), syncpts.frame_start);
            }

            buf.thresh[index] = self.pool.incr_max(syncpts.mw_ack_done, 1);
            if !producer.fifo.take(index, SyncptEvent::MwAckDone) {
                self.arm_syncpt(mw_ack_done_cond(port), syncpts.mw_ack_done);
            }
        }

        for index in 0..valid_ports {
            self.arm_single_shot(index);
        }

        self.set_capture_state(CaptureState::Good);
        let mut timestamp = None;
        let mut timed_out = false;
        for (index, _, syncpts) in self.ports(valid_ports) {
            match self.pool.wait_timeout(
                syncpts.frame_start,
                frame_start[index],
                self.config.timeout,
            ) {
                Ok(ts) => {
                    log::trace!(
                        "{}: got SOF syncpt for buf {} on port {}",
                        self.config.name,
                        buf.index,
                        index
                    );
                    timestamp = Some(ts);
                }
                Err(e) => {
                    log::error!(
                        "{}: frame start syncpt timeout on port {}: {}",
                        self.config.name,
                        index,
                        e
                    );
                    buf.state = BufferState::Error;
                    self.ec_recover(producer, fmt);
                    self.set_capture_state(CaptureState::Timeout);
                    timed_out = true;
                    break;
                }
            }
        }

        // The test pattern generator always reports a short frame.
        if !timed_out && !self.config.pg_mode {
            let err = self.error_status(valid_ports);
            if err != 0 {
                log::error!(
                    "{}: error {:#x} on frame {}",
                    self.config.name,
                    err,
                    self.sequence.load(Ordering::SeqCst)
                );
                buf.state = BufferState::Error;
                self.set_capture_state(CaptureState::Error);
            }
        }

        buf.timestamp = timestamp.unwrap_or_else(monotonic_raw);

        if self.capture_state() == CaptureState::Good {
            buf.version = producer.capture_version;
            self.inflight.enqueue(buf);
        } else {
            buf.state = BufferState::Error;
            self.restart_version.fetch_add(1, Ordering::SeqCst);
            self.release_buffer(buf);
        }
    }

    /// Captures the last frame into the next queued buffer, waiting only for its memory write.
    ///
    /// Used when stopping, to collect the frame the hardware may still be receiving.
    pub(super) fn capture_done(&self, producer: &mut Producer, fmt: &ChannelFormat) {
        let Some(mut buf) = self.capture_queue.dequeue() else {
            log::debug!("{}: no buffers in queue", self.config.name);
            return;
        };

        let valid_ports = fmt.valid_ports();
        let mut thresh = [0u32; TEGRA_CSI_BLOCKS];
        self.program_surfaces(fmt, buf.addr);
        for (index, port, syncpts) in self.ports(valid_ports) {
            thresh[index] = self.pool.incr_max(syncpts.mw_ack_done, 1);
            self.arm_syncpt(mw_ack_done_cond(port), syncpts.mw_ack_done);
            self.arm_single_shot(index);
        }

        let mut timestamp = None;
        for (index, _, syncpts) in self.ports(valid_ports) {
            match self
                .pool
                .wait_timeout(syncpts.mw_ack_done, thresh[index], self.config.timeout)
            {
                Ok(ts) => {
                    buf.state = BufferState::Done;
                    timestamp = Some(ts);
                }
                Err(e) => {
                    log::error!(
                        "{}: MW_ACK_DONE syncpt timeout on port {}: {}",
                        self.config.name,
                        index,
                        e
                    );
                    buf.state = BufferState::Error;
                    self.ec_recover(producer, fmt);
                    break;
                }
            }
        }

        buf.timestamp = timestamp.unwrap_or_else(monotonic_raw);
        self.release_buffer(buf);
        self.set_capture_state(CaptureState::Idle);
    }

    /// Waits for the memory write of the inflight buffer `buf` to complete and returns it.
    pub(super) fn release_frame(&self, mut buf: FrameBuffer) {
        buf.state = BufferState::Done;

        // The hardware has been or is about to be reset, so the frame will never complete.
        let restart_version = self.restart_version.load(Ordering::SeqCst);
        if buf.version != restart_version {
            log::debug!(
                "{}: buf {} captured at version {}, now {}",
                self.config.name,
                buf.index,
                buf.version,
                restart_version
            );
            buf.state = BufferState::Error;
            self.release_buffer(buf);
            return;
        }

        let valid_ports = self.format_ref().valid_ports();
        let mut timed_out = false;
        for (index, _, syncpts) in self.ports(valid_ports) {
            match self.pool.wait_timeout(
                syncpts.mw_ack_done,
                buf.thresh[index],
                self.config.timeout,
            ) {
                Ok(_) => log::trace!(
                    "{}: got EOF syncpt for buf {} on port {}",
                    self.config.name,
                    buf.index,
                    index
                ),
                Err(e) => {
                    log::error!(
                        "{}: MW_ACK_DONE syncpt timeout on port {}: {}",
                        self.config.name,
                        index,
                        e
                    );
                    timed_out = true;
                }
            }
        }

        // Recovery is left to the capture thread, which notices the restart before its next
        // frame.
        if timed_out {
            buf.state = BufferState::Error;
            self.restart_version.fetch_add(1, Ordering::SeqCst);
        }
        self.release_buffer(buf);
    }

    /// Returns `buf` to the sink, with its sequence number and payload size set.
    pub(super) fn release_buffer(&self, mut buf: FrameBuffer) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        buf.sequence = sequence;
        buf.bytesused = self.format_ref().pix.sizeimage;

        if sequence < self.config.discard_initial_frames && buf.state == BufferState::Done {
            log::debug!("{}: discarding initial frame {}", self.config.name, sequence);
            buf.state = BufferState::Error;
        }

        log::trace!(
            "{}: release buf {} seq {} state {:?}",
            self.config.name,
            buf.index,
            buf.sequence,
            buf.state
        );
        self.sink.buffer_done(buf);
    }

    /// Clears the error status of the first `valid_ports` ports, and returns the errors the CSI
    /// reported for the last frame.
    fn error_status(&self, valid_ports: usize) -> u32 {
        let mut err = 0;
        for index in 0..valid_ports {
            let val = self.csi_read(index, CSI_ERROR_STATUS);
            self.csi_write(index, CSI_ERROR_STATUS, val);
            err |= self.csi.error_status(index);
        }
        err
    }

    /// Starts or stops streaming on all the sub-devices.
    ///
    /// Sub-devices are started from the CSI bridge to the source and stopped in reverse order. If
    /// one of them fails to start, those already started are stopped again.
    pub(super) fn set_stream(&self, on: bool) -> IoctlResult<()> {
        let mut subdevs = self.subdevs();
        if !on {
            let res = call_all(&mut subdevs, CallOrder::Reverse, "stream off", |sd| {
                sd.s_stream(false)
            });
            self.streaming.store(false, Ordering::SeqCst);
            return res;
        }

        if let Err(e) = call_all(&mut subdevs, CallOrder::Forward, "stream on", |sd| {
            sd.s_stream(true)
        }) {
            let _ = call_all(&mut subdevs, CallOrder::Reverse, "stream off", |sd| {
                sd.s_stream(false)
            });
            self.streaming.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Powers all the sub-devices on or off, from the source to the CSI bridge.
    pub(super) fn set_power(&self, on: bool) -> IoctlResult<()> {
        let what = if on { "power on" } else { "power off" };
        call_all(&mut self.subdevs(), CallOrder::Reverse, what, |sd| {
            sd.s_power(on)
        })
    }

    /// Prepares the VI for error recovery before streaming starts.
    pub(super) fn ec_init(&self) {
        // A full syncpoint FIFO would otherwise stall the host interface.
        self.regs.write(VI_INCR_SYNCPT_CNTRL, INCR_SYNCPT_NO_STALL);
    }

    /// Forgets the syncpoint FIFO state once the VI is powered off.
    pub(super) fn ec_close(&self) {
        self.producer().fifo.clear();
    }

    /// Returns all the buffers of the capture queue with `state`.
    pub(super) fn queued_buf_done(&self, state: BufferState) {
        let count = self.capture_queue.drain(state, &self.sink);
        if count > 0 {
            log::debug!(
                "{}: returned {} queued buffer(s) as {:?}",
                self.config.name,
                count,
                state
            );
        }
    }
}
