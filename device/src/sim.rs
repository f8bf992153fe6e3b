// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Simulated VI, CSI and sub-devices.
//!
//! [`SimulatedVi`] implements [`ViRegisters`] on top of plain memory and services single-shot
//! captures by incrementing the syncpoints armed for the port, as the hardware does when a frame
//! starts and once it has been written to memory. Faults can be injected to exercise the error
//! paths of a channel without hardware.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use v4l2r::bindings;

use crate::format::MbusFormat;
use crate::regs::*;
use crate::sensor::SensorProperties;
use crate::syncpt::SyncpointId;
use crate::syncpt::SyncpointPool;
use crate::CsiChannel;
use crate::Subdevice;
use crate::ViRegisters;
use crate::ENOIOCTLCMD;

/// Error latched in `CSI_ERROR_STATUS` by a corrupted frame.
const SIM_FRAME_ERROR: u32 = 0x1;

#[derive(Debug, Default)]
struct ViState {
    regs: BTreeMap<u32, u32>,
    /// Pending syncpoint increments, as `(condition, syncpoint)`.
    armed: VecDeque<(u32, u32)>,
    /// Last syncpoint armed on each condition.
    last_armed: BTreeMap<u32, u32>,
    /// Increments left in an overflowed FIFO, per condition. They survive resets.
    stale: BTreeMap<u32, u32>,
    arm_count: usize,
    /// Errors reported by the CSI, per physical port.
    csi_errors: BTreeMap<u8, u32>,

    drop_frame_starts: u32,
    corrupt_frames: u32,
    stall_write_acks: u32,
}

impl ViState {
    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    /// Removes the first increment armed on `cond`, or takes one from the stale ones.
    fn take_armed(&mut self, cond: u32) -> Option<u32> {
        if let Some(pos) = self.armed.iter().position(|&(c, _)| c == cond) {
            return self.armed.remove(pos).map(|(_, id)| id);
        }

        let stale = self.stale.get_mut(&cond)?;
        if *stale == 0 {
            return None;
        }
        *stale -= 1;
        self.last_armed.get(&cond).copied()
    }
}

/// Simulated VI register aperture. Clones share the same state.
#[derive(Clone)]
pub struct SimulatedVi {
    state: Arc<Mutex<ViState>>,
    pool: Arc<SyncpointPool>,
}

impl SimulatedVi {
    /// Creates a VI incrementing the syncpoints of `pool`.
    pub fn new(pool: Arc<SyncpointPool>) -> Self {
        Self {
            state: Default::default(),
            pool,
        }
    }

    fn lock(&self) -> MutexGuard<ViState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a CSI bridge whose port `index` is the physical port `ports[index]`.
    pub fn csi(&self, ports: &[u8]) -> SimCsi {
        SimCsi {
            ports: ports.to_vec(),
            vi: Arc::clone(&self.state),
            calls: Default::default(),
        }
    }

    /// Makes the next `count` single shots never start a frame, leaving them armed.
    pub fn drop_frame_starts(&self, count: u32) {
        self.lock().drop_frame_starts = count;
    }

    /// Makes the next `count` frames come in with CSI errors.
    pub fn corrupt_frames(&self, count: u32) {
        self.lock().corrupt_frames = count;
    }

    /// Makes the memory write of the next `count` frames never complete.
    pub fn stall_write_acks(&self, count: u32) {
        self.lock().stall_write_acks = count;
    }

    /// Reports an overflow of the frame-start and write-ack syncpoint FIFOs of physical `port`,
    /// leaving `depth` increments in each.
    pub fn overflow_syncpt_fifo(&self, port: u8, depth: u32) {
        let mut state = self.lock();
        let mut bits = 0;
        for cond in [frame_start_cond(port), mw_ack_done_cond(port)] {
            bits |= incr_syncpt_error_bit(cond);
            state.stale.insert(cond, depth);
        }
        let error = state.reg(VI_INCR_SYNCPT_ERROR);
        state.regs.insert(VI_INCR_SYNCPT_ERROR, error | bits);
    }

    /// Sets bits of `VI_INCR_SYNCPT_ERROR`.
    pub fn set_syncpt_error(&self, bits: u32) {
        let mut state = self.lock();
        let error = state.reg(VI_INCR_SYNCPT_ERROR);
        state.regs.insert(VI_INCR_SYNCPT_ERROR, error | bits);
    }

    /// Sets bits of `CSI_ERROR_STATUS` of physical `port`.
    pub fn set_error_status(&self, port: u8, bits: u32) {
        let mut state = self.lock();
        let offset = csi_base(port) + CSI_ERROR_STATUS;
        let status = state.reg(offset);
        state.regs.insert(offset, status | bits);
    }

    /// Returns the number of syncpoint increments armed so far.
    pub fn arm_count(&self) -> usize {
        self.lock().arm_count
    }

    /// Returns the value of all the registers written so far.
    pub fn snapshot(&self) -> BTreeMap<u32, u32> {
        self.lock().regs.clone()
    }

    fn incr(&self, id: u32) {
        self.pool.cpu_incr(SyncpointId::from_raw(id));
    }

    /// Captures a frame on physical `port`.
    fn single_shot(&self, state: &mut ViState, port: u8) {
        let latch = csi_base(port) + CSI_SINGLE_SHOT;
        if state.drop_frame_starts > 0 {
            state.drop_frame_starts -= 1;
            log::debug!("sim: dropping frame start on port {}", port);
            state.regs.insert(latch, SINGLE_SHOT_CAPTURE);
            return;
        }

        if let Some(id) = state.take_armed(frame_start_cond(port)) {
            self.incr(id);
        }

        if state.corrupt_frames > 0 {
            state.corrupt_frames -= 1;
            let offset = csi_base(port) + CSI_ERROR_STATUS;
            let status = state.reg(offset);
            state.regs.insert(offset, status | SIM_FRAME_ERROR);
            *state.csi_errors.entry(port).or_default() |= SIM_FRAME_ERROR;
        }

        let ack = state.take_armed(mw_ack_done_cond(port));
        if state.stall_write_acks > 0 {
            state.stall_write_acks -= 1;
            log::debug!("sim: stalling write ack on port {}", port);
        } else if let Some(id) = ack {
            self.incr(id);
        }

        state.regs.insert(latch, 0);
    }
}

impl ViRegisters for SimulatedVi {
    fn read(&self, offset: u32) -> u32 {
        self.lock().reg(offset)
    }

    fn write(&self, offset: u32, val: u32) {
        let mut state = self.lock();

        if offset < csi_base(0) {
            match offset {
                VI_INCR_SYNCPT => {
                    let cond = (val >> 8) & 0xff;
                    let id = val & 0xff;
                    state.armed.push_back((cond, id));
                    state.last_armed.insert(cond, id);
                    state.arm_count += 1;
                }
                VI_INCR_SYNCPT_ERROR => {
                    let error = state.reg(offset);
                    state.regs.insert(offset, error & !val);
                }
                _ => {
                    state.regs.insert(offset, val);
                }
            }
            return;
        }

        let port = ((offset - csi_base(0)) / CSI_BLOCK_SIZE) as u8;
        match offset - csi_base(port) {
            CSI_ERROR_STATUS => {
                let status = state.reg(offset);
                state.regs.insert(offset, status & !val);
            }
            CSI_SW_RESET => {
                state.regs.insert(offset, val);
                if val != 0 {
                    state.regs.insert(csi_base(port) + CSI_SINGLE_SHOT, 0);
                    let conds = [frame_start_cond(port), mw_ack_done_cond(port)];
                    state.armed.retain(|(c, _)| !conds.contains(c));
                }
            }
            CSI_SINGLE_SHOT if val & SINGLE_SHOT_CAPTURE != 0 => {
                self.single_shot(&mut state, port);
            }
            _ => {
                state.regs.insert(offset, val);
            }
        }
    }
}

/// Call made by a channel to its CSI bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsiCall {
    StopPort(usize),
    StartPort(usize),
    ErrorRecover(usize),
}

/// Simulated CSI bridge, recording the calls it receives.
#[derive(Clone)]
pub struct SimCsi {
    ports: Vec<u8>,
    vi: Arc<Mutex<ViState>>,
    calls: Arc<Mutex<Vec<CsiCall>>>,
}

impl SimCsi {
    fn record(&self, call: CsiCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    /// Returns the calls received so far.
    pub fn calls(&self) -> Vec<CsiCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CsiChannel for SimCsi {
    fn stop_port(&self, index: usize) {
        self.record(CsiCall::StopPort(index));
    }

    fn start_port(&self, index: usize) {
        self.record(CsiCall::StartPort(index));
    }

    fn error_status(&self, index: usize) -> u32 {
        let Some(&port) = self.ports.get(index) else {
            return 0;
        };
        self.vi
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .csi_errors
            .remove(&port)
            .unwrap_or(0)
    }

    fn error_recover(&self, index: usize) {
        self.record(CsiCall::ErrorRecover(index));
    }
}

/// Log of sub-device calls shared by several [`SimSubdevice`]s, as `"name.op(arg)"` strings.
#[derive(Debug, Default, Clone)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn lock(&self) -> MutexGuard<Vec<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, name: &str, op: &str, arg: impl std::fmt::Display) {
        self.lock().push(format!("{}.{}({})", name, op, arg));
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubdevKind {
    /// Streams, but has no power control nor formats.
    Bridge,
    Sensor,
}

/// Simulated sub-device.
pub struct SimSubdevice {
    name: String,
    kind: SubdevKind,
    log: CallLog,
    codes: Vec<u32>,
    fmt: MbusFormat,
    properties: Option<SensorProperties>,
    fail_stream_on: AtomicU32,
}

impl SimSubdevice {
    /// Creates a bridge sub-device, which only implements streaming.
    pub fn bridge(name: &str, log: CallLog) -> Self {
        Self {
            name: name.to_owned(),
            kind: SubdevKind::Bridge,
            log,
            codes: Vec::new(),
            fmt: Default::default(),
            properties: None,
            fail_stream_on: AtomicU32::new(0),
        }
    }

    /// Creates a sensor producing the media bus `codes`, with `fmt` as active format.
    pub fn sensor(name: &str, log: CallLog, codes: Vec<u32>, fmt: MbusFormat) -> Self {
        Self {
            kind: SubdevKind::Sensor,
            codes,
            fmt,
            ..Self::bridge(name, log)
        }
    }

    pub fn with_properties(mut self, properties: SensorProperties) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Returns the log this sub-device records its calls in.
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Makes the next `count` stream on requests fail with `EIO`.
    pub fn fail_stream_on(&self, count: u32) {
        self.fail_stream_on.store(count, Ordering::SeqCst);
    }
}

impl Subdevice for SimSubdevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn s_stream(&mut self, on: bool) -> Result<(), i32> {
        self.log.push(&self.name, "s_stream", on);
        if on
            && self
                .fail_stream_on
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(libc::EIO);
        }
        Ok(())
    }

    fn s_power(&mut self, on: bool) -> Result<(), i32> {
        if self.kind == SubdevKind::Bridge {
            return Err(ENOIOCTLCMD);
        }
        self.log.push(&self.name, "s_power", on);
        Ok(())
    }

    fn enum_mbus_code(&self, index: u32) -> Option<u32> {
        self.codes.get(index as usize).copied()
    }

    fn get_fmt(&self) -> Result<MbusFormat, i32> {
        match self.kind {
            SubdevKind::Bridge => Err(ENOIOCTLCMD),
            SubdevKind::Sensor => Ok(self.fmt),
        }
    }

    fn set_fmt(&mut self, fmt: &mut MbusFormat, try_only: bool) -> Result<(), i32> {
        if self.kind == SubdevKind::Bridge {
            return Err(ENOIOCTLCMD);
        }
        self.log
            .push(&self.name, "set_fmt", if try_only { "try" } else { "active" });

        if !self.codes.contains(&fmt.code) {
            fmt.code = self.codes.first().copied().unwrap_or(self.fmt.code);
        }
        fmt.field = bindings::v4l2_field_V4L2_FIELD_NONE;
        if !try_only {
            self.fmt = *fmt;
        }
        Ok(())
    }

    fn sensor_properties(&self) -> Option<&SensorProperties> {
        self.properties.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::regs::*;
    use crate::syncpt::SyncpointPool;
    use crate::CsiChannel;
    use crate::ViRegisters;

    use super::SimulatedVi;

    #[test]
    fn single_shot_fires_armed_syncpoints() {
        let pool = Arc::new(SyncpointPool::new(8));
        let vi = SimulatedVi::new(Arc::clone(&pool));
        let sof = pool.alloc().unwrap();
        let ack = pool.alloc().unwrap();

        let sof_thresh = pool.incr_max(sof, 1);
        let ack_thresh = pool.incr_max(ack, 1);
        vi.write(VI_INCR_SYNCPT, incr_syncpt(frame_start_cond(1), sof.raw()));
        vi.write(VI_INCR_SYNCPT, incr_syncpt(mw_ack_done_cond(1), ack.raw()));
        assert_eq!(vi.arm_count(), 2);

        // Another port does not consume them.
        vi.write(csi_base(0) + CSI_SINGLE_SHOT, SINGLE_SHOT_CAPTURE);
        assert_eq!(pool.read_min(sof), 0);

        vi.write(csi_base(1) + CSI_SINGLE_SHOT, SINGLE_SHOT_CAPTURE);
        let timeout = Duration::from_millis(10);
        assert!(pool.wait_timeout(sof, sof_thresh, timeout).is_ok());
        assert!(pool.wait_timeout(ack, ack_thresh, timeout).is_ok());
        assert_eq!(vi.read(csi_base(1) + CSI_SINGLE_SHOT), 0);
    }

    #[test]
    fn reset_clears_latch_and_armed_increments() {
        let pool = Arc::new(SyncpointPool::new(8));
        let vi = SimulatedVi::new(Arc::clone(&pool));
        let sof = pool.alloc().unwrap();

        vi.write(VI_INCR_SYNCPT, incr_syncpt(frame_start_cond(0), sof.raw()));
        vi.drop_frame_starts(1);
        vi.write(csi_base(0) + CSI_SINGLE_SHOT, SINGLE_SHOT_CAPTURE);
        assert_eq!(vi.read(csi_base(0) + CSI_SINGLE_SHOT), SINGLE_SHOT_CAPTURE);

        vi.write(csi_base(0) + CSI_SW_RESET, SW_RESET_ALL);
        vi.write(csi_base(0) + CSI_SW_RESET, 0);
        assert_eq!(vi.read(csi_base(0) + CSI_SINGLE_SHOT), 0);

        vi.write(csi_base(0) + CSI_SINGLE_SHOT, SINGLE_SHOT_CAPTURE);
        assert_eq!(pool.read_min(sof), 0);
    }

    #[test]
    fn error_registers_are_write_one_to_clear() {
        let pool = Arc::new(SyncpointPool::new(8));
        let vi = SimulatedVi::new(pool);
        vi.set_syncpt_error(0b1010);
        vi.write(VI_INCR_SYNCPT_ERROR, 0b0010);
        assert_eq!(vi.read(VI_INCR_SYNCPT_ERROR), 0b1000);

        vi.set_error_status(2, 0xff);
        vi.write(csi_base(2) + CSI_ERROR_STATUS, 0x0f);
        assert_eq!(vi.read(csi_base(2) + CSI_ERROR_STATUS), 0xf0);
    }

    #[test]
    fn corrupted_frame_reported_by_csi() {
        let pool = Arc::new(SyncpointPool::new(8));
        let vi = SimulatedVi::new(pool);
        let csi = vi.csi(&[3]);
        vi.corrupt_frames(1);

        vi.write(csi_base(3) + CSI_SINGLE_SHOT, SINGLE_SHOT_CAPTURE);
        assert_ne!(vi.read(csi_base(3) + CSI_ERROR_STATUS), 0);
        assert_ne!(csi.error_status(0), 0);
        assert_eq!(csi.error_status(0), 0);

        vi.write(csi_base(3) + CSI_SINGLE_SHOT, SINGLE_SHOT_CAPTURE);
        assert_eq!(csi.error_status(0), 0);
    }
}
