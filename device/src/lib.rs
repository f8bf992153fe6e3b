// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate contains the capture pipeline of the Tegra VI2 video input engine.
//!
//! A [`Channel`] accepts frame buffers from a user-facing video device, programs the VI and CSI
//! capture engines to write incoming sensor frames into them, waits on the hardware completion
//! signals (syncpoints), recovers from transient hardware errors, and hands every buffer back
//! exactly once through a [`BufferDoneSink`].
//!
//! The pipeline is independent of the platform it runs on and relies on a handful of traits to
//! reach the hardware and the rest of the camera stack:
//!
//! * The VI register aperture is accessed through [`ViRegisters`].
//! * The CSI bridge the channel is linked to is driven through [`CsiChannel`], which provides the
//!   port start/stop and error recovery hooks.
//! * Sensors and bridges in the media pipeline implement [`Subdevice`] and are called in
//!   pipeline order for stream, power and format operations.
//! * Completed buffers are sent to a [`BufferDoneSink`].
//!
//! # Anatomy of a capture
//!
//! Buffers queued with [`Channel::queue_buffer`] go to the capture queue. A producer thread
//! programs the surface registers for each buffer, arms the frame-start and memory-write-ack
//! syncpoints, triggers a single-shot capture and waits for the frame start. Buffers that started
//! correctly move to the inflight queue, where a consumer thread waits for the memory write to be
//! acknowledged before releasing them.
//!
//! Whenever a wait times out or a frame comes in corrupted, the restart version of the channel is
//! bumped. The producer notices the change before its next frame, resets the VI and CSI blocks and
//! resynchronizes the syncpoints. Buffers started under an older version are failed by the
//! consumer without touching the hardware.
//!
//! A simulated VI, usable for tests and bring-up without hardware, lives in the `sim` module.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod format;
pub mod queue;
pub mod regs;
pub mod sensor;
#[cfg(feature = "sim")]
pub mod sim;
pub mod syncpt;

pub use v4l2r;

use std::sync::mpsc;

pub use buffer::BufferState;
pub use buffer::FrameBuffer;
pub use channel::CaptureState;
pub use channel::Channel;
pub use channel::ChannelControl;
pub use channel::ChannelError;
pub use config::ChannelConfig;
pub use format::MbusFormat;
pub use sensor::SensorProperties;
pub use syncpt::SyncpointPool;

/// Result of an operation that reports failures to the video device as a `libc` error code.
pub type IoctlResult<T> = Result<T, i32>;

/// Error returned by sub-device operations that are not implemented.
///
/// This is a kernel-internal code that never reaches user-space: fan-out calls across the pipeline
/// ignore it, and format negotiation turns it into `ENOTTY`.
pub const ENOIOCTLCMD: i32 = 515;

/// Trait for accessing the VI register aperture.
///
/// Offsets are relative to the start of the aperture. See the [`regs`] module for the register
/// map.
pub trait ViRegisters: Send + Sync {
    /// Reads the 32-bit register at `offset`.
    fn read(&self, offset: u32) -> u32;
    /// Writes `val` into the 32-bit register at `offset`.
    fn write(&self, offset: u32, val: u32);
}

/// Trait for the CSI bridge a channel is linked to.
///
/// `index` is always the index of the port within the channel, not the physical CSI port number.
pub trait CsiChannel: Send + Sync {
    /// Stops reception on port `index`.
    fn stop_port(&self, index: usize);
    /// Starts reception on port `index`.
    fn start_port(&self, index: usize);
    /// Returns the errors latched by port `index` since the last call, or zero if the last frame
    /// was received cleanly.
    fn error_status(&self, index: usize) -> u32;
    /// Resets the PHY and pixel parser of port `index` after an error.
    fn error_recover(&self, index: usize);
}

/// Trait for the sub-devices of the media pipeline feeding a channel.
///
/// All operations default to returning [`ENOIOCTLCMD`], i.e. "not implemented", so sub-devices
/// only need to provide the ones they support.
pub trait Subdevice: Send {
    /// Name of the sub-device, used for logging.
    fn name(&self) -> &str;

    /// Starts or stops streaming.
    fn s_stream(&mut self, _on: bool) -> Result<(), i32> {
        Err(ENOIOCTLCMD)
    }

    /// Powers the sub-device on or off.
    fn s_power(&mut self, _on: bool) -> Result<(), i32> {
        Err(ENOIOCTLCMD)
    }

    /// Returns the media bus code supported at `index`, or `None` once all codes have been
    /// enumerated.
    fn enum_mbus_code(&self, _index: u32) -> Option<u32> {
        None
    }

    /// Returns the active format of the sub-device.
    fn get_fmt(&self) -> Result<MbusFormat, i32> {
        Err(ENOIOCTLCMD)
    }

    /// Negotiates `fmt` with the sub-device, adjusting it to the closest supported format. If
    /// `try_only` is set, the active format of the sub-device is left untouched.
    fn set_fmt(&mut self, _fmt: &mut MbusFormat, _try_only: bool) -> Result<(), i32> {
        Err(ENOIOCTLCMD)
    }

    /// Returns the mode properties of the sensor, if this sub-device is one.
    fn sensor_properties(&self) -> Option<&SensorProperties> {
        None
    }
}

/// Trait for receiving buffers once the channel is done with them.
///
/// `buffer_done` is called exactly once for every buffer passed to [`Channel::queue_buffer`],
/// with the terminal state, sequence number, payload size and timestamp filled in. It may be
/// called from any of the channel threads and must not block.
pub trait BufferDoneSink: Send + Sync {
    fn buffer_done(&self, buffer: FrameBuffer);
}

impl BufferDoneSink for mpsc::Sender<FrameBuffer> {
    fn buffer_done(&self, buffer: FrameBuffer) {
        if let Err(e) = self.send(buffer) {
            log::warn!("buffer {} completed after its receiver was closed", e.0.index);
        }
    }
}
