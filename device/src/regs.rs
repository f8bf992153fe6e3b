// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Register map of the VI2 engine.
//!
//! The aperture starts with the VI-wide configuration registers, followed by one block of CSI
//! capture registers per physical CSI port, each [`CSI_BLOCK_SIZE`] bytes long.

/// Number of CSI ports (and thus of capture register blocks) on the VI.
pub const TEGRA_CSI_BLOCKS: usize = 6;

/// Syncpoint increment request: `incr_syncpt_cond(event) | syncpoint_id`.
pub const VI_INCR_SYNCPT: u32 = 0x000;
/// Syncpoint increment control.
pub const VI_INCR_SYNCPT_CNTRL: u32 = 0x004;
/// Syncpoint FIFO overflow status, one bit per condition. Write 1 to clear.
pub const VI_INCR_SYNCPT_ERROR: u32 = 0x008;
/// Clock gating control.
pub const VI_CG_CTRL: u32 = 0x0b8;

/// Lets software process syncpoint FIFO overflows instead of stalling the host interface.
pub const INCR_SYNCPT_NO_STALL: u32 = 1 << 8;

pub const CG_DISABLE: u32 = 0;
pub const CG_ENABLE: u32 = 1;

const CSI_BLOCKS_START: u32 = 0x100;
pub const CSI_BLOCK_SIZE: u32 = 0x100;

// Per-port registers, relative to `csi_base`.
pub const CSI_SW_RESET: u32 = 0x000;
pub const CSI_SINGLE_SHOT: u32 = 0x004;
pub const CSI_IMAGE_DEF: u32 = 0x00c;
pub const CSI_IMAGE_SIZE: u32 = 0x018;
pub const CSI_IMAGE_SIZE_WC: u32 = 0x01c;
pub const CSI_IMAGE_DT: u32 = 0x020;
pub const CSI_SURFACE0_OFFSET_MSB: u32 = 0x024;
pub const CSI_SURFACE0_OFFSET_LSB: u32 = 0x028;
pub const CSI_SURFACE1_OFFSET_MSB: u32 = 0x02c;
pub const CSI_SURFACE1_OFFSET_LSB: u32 = 0x030;
pub const CSI_SURFACE0_STRIDE: u32 = 0x054;
pub const CSI_SURFACE1_STRIDE: u32 = 0x058;
/// Write 1 to clear.
pub const CSI_ERROR_STATUS: u32 = 0x084;

/// Value pulsed into `CSI_SW_RESET` to reset the capture block, which also clears a pending
/// single-shot request.
pub const SW_RESET_ALL: u32 = 0xf;
pub const SINGLE_SHOT_CAPTURE: u32 = 0x1;

pub const IMAGE_DEF_DEST_MEM: u32 = 0x1;
pub const IMAGE_DEF_FORMAT_OFFSET: u32 = 16;
pub const BYPASS_PXL_TRANSFORM_OFFSET: u32 = 24;
pub const IMAGE_SIZE_HEIGHT_OFFSET: u32 = 16;

/// Depth of the hardware FIFO holding armed syncpoint increments.
pub const SYNCPT_FIFO_DEPTH: u32 = 2;

/// Alignment of the surfaces written by each port of a ganged capture.
pub const SURFACE_ALIGNMENT: u32 = 64;

/// Returns the offset of the capture register block of physical CSI port `port`.
pub const fn csi_base(port: u8) -> u32 {
    CSI_BLOCKS_START + port as u32 * CSI_BLOCK_SIZE
}

/// Syncpoint condition raised by the pixel parser of `port` at frame start.
pub const fn frame_start_cond(port: u8) -> u32 {
    5 + port as u32 * 4
}

/// Syncpoint condition raised by the memory writer of `port` once the frame has been written.
pub const fn mw_ack_done_cond(port: u8) -> u32 {
    7 + port as u32 * 4
}

/// Value to write into `VI_INCR_SYNCPT` to increment syncpoint `id` once `cond` is raised.
pub const fn incr_syncpt(cond: u32, id: u32) -> u32 {
    ((cond & 0xff) << 8) | (id & 0xff)
}

/// Bit of `VI_INCR_SYNCPT_ERROR` reporting a FIFO overflow for `cond`.
pub const fn incr_syncpt_error_bit(cond: u32) -> u32 {
    1 << cond
}

/// Value of `CSI_IMAGE_DEF` selecting `img_fmt`, with the pixel transform bypassed or not.
pub const fn image_def(bypass: bool, img_fmt: u32) -> u32 {
    ((bypass as u32) << BYPASS_PXL_TRANSFORM_OFFSET) | (img_fmt << IMAGE_DEF_FORMAT_OFFSET)
}

/// Value of `CSI_IMAGE_SIZE` for a `width` x `height` frame.
pub const fn image_size(width: u32, height: u32) -> u32 {
    (height << IMAGE_SIZE_HEIGHT_OFFSET) | width
}
