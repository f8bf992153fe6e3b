// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use v4l2r::bindings;

use crate::regs::TEGRA_CSI_BLOCKS;

/// Current status of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Buffer is owned by the channel and waiting to be filled, or is returned unfilled because
    /// streaming could not start.
    Queued,
    /// Buffer has been filled with a complete frame.
    Done,
    /// Buffer content is invalid.
    Error,
}

/// A frame buffer, as tracked by the capture pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Index of the buffer in the video device queue.
    pub index: u32,
    /// DMA address of the start of the buffer.
    pub addr: u64,
    pub state: BufferState,
    /// Memory-write-ack syncpoint thresholds of each port, reached once the frame is written.
    pub thresh: [u32; TEGRA_CSI_BLOCKS],
    /// Restart version of the channel when the capture of this buffer started.
    pub version: u32,
    /// Sequence number, set on release.
    pub sequence: u32,
    /// Size of the payload, set on release.
    pub bytesused: u32,
    /// Raw monotonic time of the start of the frame.
    pub timestamp: Duration,
}

impl FrameBuffer {
    pub fn new(index: u32, addr: u64) -> Self {
        Self {
            index,
            addr,
            state: BufferState::Queued,
            thresh: [0; TEGRA_CSI_BLOCKS],
            version: 0,
            sequence: 0,
            bytesused: 0,
            timestamp: Duration::ZERO,
        }
    }

    /// Returns the timestamp of the buffer in the form expected by V4L2.
    pub fn timeval(&self) -> bindings::timeval {
        bindings::timeval {
            tv_sec: self.timestamp.as_secs() as _,
            tv_usec: self.timestamp.subsec_micros() as _,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::BufferState;
    use super::FrameBuffer;

    #[test]
    fn new_buffer_is_queued() {
        let buffer = FrameBuffer::new(3, 0x8000_0000);
        assert_eq!(buffer.state, BufferState::Queued);
        assert_eq!(buffer.thresh, [0; 6]);
        assert_eq!(buffer.bytesused, 0);
    }

    #[test]
    fn timeval_conversion() {
        let mut buffer = FrameBuffer::new(0, 0);
        buffer.timestamp = Duration::new(12, 345_678_901);
        let tv = buffer.timeval();
        assert_eq!(tv.tv_sec, 12);
        assert_eq!(tv.tv_usec, 345_678);
    }
}
