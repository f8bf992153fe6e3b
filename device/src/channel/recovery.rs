// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recovery of the VI and CSI after a capture error.

use crate::format::ChannelFormat;
use crate::regs::*;
use crate::syncpt::SyncptEvent;
use crate::BufferDoneSink;
use crate::CsiChannel;
use crate::ViRegisters;

use super::ChannelInner;
use super::Producer;

impl<R, C, S> ChannelInner<R, C, S>
where
    R: ViRegisters,
    C: CsiChannel,
    S: BufferDoneSink,
{
    /// Resets the capture hardware of the ports capturing `fmt` and resynchronizes their
    /// syncpoints.
    ///
    /// Must only be called from the capture thread, or once it is stopped.
    pub(super) fn ec_recover(&self, producer: &mut Producer, fmt: &ChannelFormat) {
        self.log_capture_error(fmt.valid_ports());
        self.vi_csi_recover(producer, fmt);
    }

    fn log_capture_error(&self, valid_ports: usize) {
        for index in 0..valid_ports {
            let val = self.csi_read(index, CSI_ERROR_STATUS);
            log::debug!(
                "{}: port {} CSI_ERROR_STATUS {:#010x}",
                self.config.name,
                index,
                val
            );
        }
    }

    /// Resets the single shot latch of port `index`.
    pub(super) fn clear_single_shot(&self, index: usize) {
        self.csi_write(index, CSI_SW_RESET, SW_RESET_ALL);
        self.csi_write(index, CSI_SW_RESET, 0);
    }

    /// Clears the single shot requests still armed on the ports capturing `fmt`.
    pub(super) fn clear_armed_single_shots(&self, fmt: &ChannelFormat) {
        self.regs.write(VI_CG_CTRL, CG_DISABLE);
        for index in 0..fmt.valid_ports() {
            if self.csi_read(index, CSI_SINGLE_SHOT) != 0 {
                self.clear_single_shot(index);
            }
        }
        self.regs.write(VI_CG_CTRL, CG_ENABLE);
    }

    fn vi_csi_recover(&self, producer: &mut Producer, fmt: &ChannelFormat) {
        let valid_ports = fmt.valid_ports();
        let error_val = self.regs.read(VI_INCR_SYNCPT_ERROR);

        // The clock must run for the resets to take effect.
        self.regs.write(VI_CG_CTRL, CG_DISABLE);

        for index in 0..valid_ports {
            self.csi.error_recover(index);
            self.csi_write(index, CSI_IMAGE_DEF, 0);
            self.clear_single_shot(index);
        }

        // Syncpoint FIFOs which overflowed are full of increments that will still be delivered.
        let depth = self.config.syncpt_fifo_depth;
        for (index, port, _) in self.ports(valid_ports) {
            for (event, cond) in [
                (SyncptEvent::FrameStart, frame_start_cond(port)),
                (SyncptEvent::MwAckDone, mw_ack_done_cond(port)),
            ] {
                if error_val & incr_syncpt_error_bit(cond) != 0 {
                    log::warn!(
                        "{}: syncpt FIFO overflow for {:?} on port {}",
                        self.config.name,
                        event,
                        index
                    );
                    producer.fifo.bank(index, event, depth);
                }
            }
        }
        self.regs.write(VI_INCR_SYNCPT_ERROR, error_val);

        self.regs.write(VI_CG_CTRL, CG_ENABLE);

        self.capture_setup(fmt);
        for (index, _, syncpts) in self.ports(valid_ports) {
            self.csi.stop_port(index);
            self.csi.start_port(index);
            self.pool.set_min_eq_max(syncpts.frame_start);
            self.pool.set_min_eq_max(syncpts.mw_ack_done);
        }
    }
}
