// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Static configuration of a capture channel.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

use crate::format::GangMode;
use crate::regs::SYNCPT_FIFO_DEPTH;
use crate::regs::TEGRA_CSI_BLOCKS;

/// Default bound of every hardware wait. Leaves the CSI enough time to drop error frames and
/// catch good ones at the usual frame rates.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

/// Frame geometry above which a channel with several ports splits the frame across them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GangPolicy {
    /// How the frame is split between ports.
    pub split: GangMode,
    /// Frames must be strictly wider than this to be ganged.
    pub min_width: u32,
    /// Frames must be strictly taller than this to be ganged.
    pub min_height: u32,
}

impl Default for GangPolicy {
    fn default() -> Self {
        Self {
            split: GangMode::LeftRight,
            min_width: 1920,
            min_height: 1080,
        }
    }
}

/// Configuration of a [`crate::Channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Name of the channel, used for logging and for naming its threads.
    pub name: String,
    /// Physical CSI ports captured by the channel. Only the first one is used unless the frame is
    /// large enough to be ganged.
    pub ports: Vec<u8>,
    /// Bound of every hardware wait.
    pub timeout: Duration,
    /// Width alignment, in bytes.
    pub width_align: u32,
    /// Stride alignment, in bytes.
    pub stride_align: u32,
    /// Height alignment of the allocated surfaces, in lines.
    pub height_align: u32,
    /// Alignment of the image size, in bytes.
    pub size_align: u32,
    /// Whether the channel captures the internal test pattern generator instead of a sensor.
    pub pg_mode: bool,
    pub gang: GangPolicy,
    /// Number of frames to fail after each stream start, for sensors which output garbage while
    /// settling.
    pub discard_initial_frames: u32,
    /// Depth of the syncpoint FIFO of the VI.
    pub syncpt_fifo_depth: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: String::from("vi-output"),
            ports: vec![0],
            timeout: DEFAULT_TIMEOUT,
            width_align: 1,
            stride_align: 1,
            height_align: 1,
            size_align: 1,
            pg_mode: false,
            gang: Default::default(),
            discard_initial_frames: 0,
            syncpt_fifo_depth: SYNCPT_FIFO_DEPTH,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("a channel needs at least one CSI port")]
    NoPort,
    #[error("at most {TEGRA_CSI_BLOCKS} ports can be used by a channel")]
    TooManyPorts,
    #[error("CSI port {0} does not exist")]
    InvalidPort(u8),
    #[error("CSI port {0} is listed twice")]
    DuplicatePort(u8),
    #[error("timeout cannot be zero")]
    ZeroTimeout,
    #[error("alignments must be non-zero")]
    ZeroAlignment,
}

impl ChannelConfig {
    /// Checks that the configuration can be used to drive the hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::NoPort);
        }
        if self.ports.len() > TEGRA_CSI_BLOCKS {
            return Err(ConfigError::TooManyPorts);
        }

        let mut seen = BTreeSet::new();
        for &port in &self.ports {
            if port as usize >= TEGRA_CSI_BLOCKS {
                return Err(ConfigError::InvalidPort(port));
            }
            if !seen.insert(port) {
                return Err(ConfigError::DuplicatePort(port));
            }
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if [
            self.width_align,
            self.stride_align,
            self.height_align,
            self.size_align,
        ]
        .contains(&0)
        {
            return Err(ConfigError::ZeroAlignment);
        }

        Ok(())
    }
}
