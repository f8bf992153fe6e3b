// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of the sensor mode properties found in the device tree.
//!
//! Each mode of a sensor is described by a `modeN` child node of the sensor node, holding string
//! properties. The parsed modes are exposed to user-space as arrays of fixed-layout structures,
//! one array per property block, which [`SensorProperties::payload`] produces.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::Context;
use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::format::V4L2_PIX_FMT_SBGGR10;
use crate::format::V4L2_PIX_FMT_SBGGR12;
use crate::format::V4L2_PIX_FMT_SRGGB10;
use crate::format::V4L2_PIX_FMT_SRGGB12;

/// Maximum number of modes parsed for a sensor.
pub const MAX_NUM_SENSOR_MODES: usize = 30;

const SENSOR_MODE_PREFIX: &str = "mode";

/// A device tree node, as seen by the sensor property parser.
pub trait PropertyNode {
    /// Returns the value of string property `name`.
    fn property(&self, name: &str) -> Option<&str>;
    /// Returns the child node called `name`.
    fn child(&self, name: &str) -> Option<&dyn PropertyNode>;
}

/// In-memory property tree, for platforms which do not use a device tree and for tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PropertyTree {
    properties: BTreeMap<String, String>,
    children: BTreeMap<String, PropertyTree>,
}

impl PropertyTree {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_property(mut self, name: &str, value: &str) -> Self {
        self.properties.insert(name.to_owned(), value.to_owned());
        self
    }

    pub fn with_child(mut self, name: &str, child: PropertyTree) -> Self {
        self.children.insert(name.to_owned(), child);
        self
    }
}

impl PropertyNode for PropertyTree {
    fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    fn child(&self, name: &str) -> Option<&dyn PropertyNode> {
        self.children.get(name).map(|c| c as &dyn PropertyNode)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("mandatory property {0} is missing")]
    Missing(&'static str),
    #[error("property {name} has malformed value {value:?}")]
    Malformed { name: &'static str, value: String },
    #[error("unsupported pixel type {0:?}")]
    UnsupportedPixelType(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct SignalProperties {
    pub readout_orientation: u32,
    pub num_lanes: u32,
    pub mclk_freq: u32,
    pub cil_settletime: u32,
    pub discontinuous_clk: u32,
    pub dpcm_enable: u32,
    pub pixel_clock: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct ImageProperties {
    pub width: u32,
    pub height: u32,
    pub line_length: u32,
    pub pixel_format: u32,
    pub embedded_metadata_height: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct DvTimings {
    pub hfrontporch: u32,
    pub hsync: u32,
    pub hbackporch: u32,
    pub vfrontporch: u32,
    pub vsync: u32,
    pub vbackporch: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct ControlProperties {
    pub gain_factor: u32,
    pub framerate_factor: u32,
    pub inherent_gain: u32,
    pub min_gain_val: u32,
    pub max_gain_val: u32,
    pub min_hdr_ratio: u32,
    pub max_hdr_ratio: u32,
    pub min_framerate: u32,
    pub max_framerate: u32,
    reserved: u32,
    pub min_exp_time: u64,
    pub max_exp_time: u64,
}

/// All the properties of a sensor mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorMode {
    pub signal: SignalProperties,
    pub image: ImageProperties,
    pub dv_timings: DvTimings,
    pub control: ControlProperties,
}

/// Property block exposed as a read-only array control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyBlock {
    Signal,
    Image,
    Control,
    DvTimings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorProperties {
    pub modes: Vec<SensorMode>,
}

impl SensorProperties {
    /// Returns the concatenation of `block` for all the modes, in mode order.
    pub fn payload(&self, block: PropertyBlock) -> Vec<u8> {
        let mut payload = Vec::new();
        for mode in &self.modes {
            payload.extend_from_slice(match block {
                PropertyBlock::Signal => mode.signal.as_bytes(),
                PropertyBlock::Image => mode.image.as_bytes(),
                PropertyBlock::Control => mode.control.as_bytes(),
                PropertyBlock::DvTimings => mode.dv_timings.as_bytes(),
            });
        }
        payload
    }
}

/// Reads decimal property `name`. Returns `Ok(None)` if it is missing.
fn read_number<T: FromStr>(
    node: &dyn PropertyNode,
    name: &'static str,
) -> Result<Option<T>, PropertyError> {
    node.property(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| PropertyError::Malformed {
                    name,
                    value: value.to_owned(),
                })
        })
        .transpose()
}

fn mandatory<T: FromStr>(node: &dyn PropertyNode, name: &'static str) -> Result<T, PropertyError> {
    read_number(node, name)?.ok_or(PropertyError::Missing(name))
}

/// Reads optional property `name`, using `default` if it is missing or cannot be parsed.
fn optional<T: FromStr>(node: &dyn PropertyNode, name: &'static str, default: T) -> T {
    match read_number(node, name) {
        Ok(value) => value.unwrap_or(default),
        Err(e) => {
            log::warn!("{}, using default", e);
            default
        }
    }
}

fn parse_signal(node: &dyn PropertyNode) -> Result<SignalProperties, PropertyError> {
    Ok(SignalProperties {
        readout_orientation: optional(node, "readout_orientation", 0),
        num_lanes: optional(node, "num_lanes", 0),
        mclk_freq: optional(node, "mclk_khz", 0),
        pixel_clock: mandatory(node, "pix_clk_hz")?,
        cil_settletime: optional(node, "cil_settletime", 0),
        discontinuous_clk: node
            .property("discontinuous_clk")
            .map_or(true, |v| v == "yes") as u32,
        dpcm_enable: node.property("dpcm_enable").map_or(false, |v| v == "true") as u32,
    })
}

fn pixel_format_from_type(pixel_t: &str) -> Result<u32, PropertyError> {
    match pixel_t {
        "bayer_bggr10" => Ok(V4L2_PIX_FMT_SBGGR10),
        "bayer_rggb10" | "bayer_wdr_dol_rggb10" => Ok(V4L2_PIX_FMT_SRGGB10),
        "bayer_bggr12" => Ok(V4L2_PIX_FMT_SBGGR12),
        "bayer_rggb12" | "bayer_wdr_pwl_rggb12" => Ok(V4L2_PIX_FMT_SRGGB12),
        _ => Err(PropertyError::UnsupportedPixelType(pixel_t.to_owned())),
    }
}

fn parse_image(node: &dyn PropertyNode) -> Result<ImageProperties, PropertyError> {
    let width = mandatory(node, "active_w")?;
    let height = mandatory(node, "active_h")?;
    let line_length = mandatory(node, "line_length")?;
    let embedded_metadata_height = optional(node, "embedded_metadata_height", 0);

    // Older device trees describe the pixel type with three separate properties.
    let pixel_t = match node.property("pixel_t") {
        Some(pixel_t) => pixel_t.to_owned(),
        None => {
            let phase = node
                .property("pixel_phase")
                .ok_or(PropertyError::Missing("pixel_phase"))?;
            let mode_type = node
                .property("mode_type")
                .ok_or(PropertyError::Missing("mode_type"))?;
            let depth: u32 = mandatory(node, "csi_pixel_bit_depth")?;
            format!("{}_{}{}", mode_type, phase, depth)
        }
    };

    Ok(ImageProperties {
        width,
        height,
        line_length,
        pixel_format: pixel_format_from_type(&pixel_t)?,
        embedded_metadata_height,
    })
}

fn parse_dv_timings(node: &dyn PropertyNode) -> DvTimings {
    DvTimings {
        hfrontporch: optional(node, "horz_front_porch", 0),
        hsync: optional(node, "horz_sync", 0),
        hbackporch: optional(node, "horz_back_porch", 0),
        vfrontporch: optional(node, "vert_front_porch", 0),
        vsync: optional(node, "vert_sync", 0),
        vbackporch: optional(node, "vert_back_porch", 0),
    }
}

fn parse_control(node: &dyn PropertyNode) -> ControlProperties {
    // Sensors without gain control use fixed defaults for the whole block.
    let gain_factor = match read_number::<u32>(node, "gain_factor") {
        Ok(value) => value,
        Err(e) => {
            log::warn!("{}, ignoring", e);
            None
        }
    };
    let Some(gain_factor) = gain_factor else {
        return ControlProperties {
            gain_factor: 1,
            framerate_factor: 1,
            ..Default::default()
        };
    };

    ControlProperties {
        gain_factor,
        framerate_factor: optional(node, "framerate_factor", 1),
        inherent_gain: optional(node, "inherent_gain", 0),
        min_gain_val: optional(node, "min_gain_val", 0),
        max_gain_val: optional(node, "max_gain_val", 0),
        min_hdr_ratio: optional(node, "min_hdr_ratio", 0),
        max_hdr_ratio: optional(node, "max_hdr_ratio", 0),
        min_framerate: optional(node, "min_framerate", 0),
        max_framerate: optional(node, "max_framerate", 0),
        reserved: 0,
        min_exp_time: optional(node, "min_exp_time", 0),
        max_exp_time: optional(node, "max_exp_time", 0),
    }
}

fn parse_mode(node: &dyn PropertyNode) -> Result<SensorMode, PropertyError> {
    Ok(SensorMode {
        signal: parse_signal(node)?,
        image: parse_image(node)?,
        dv_timings: parse_dv_timings(node),
        control: parse_control(node),
    })
}

/// Parses the modes described under the sensor node `node`.
///
/// Modes are numbered from `mode0` and parsing stops at the first missing index. A sensor without
/// any mode is valid.
pub fn parse_sensor_properties(node: &dyn PropertyNode) -> anyhow::Result<SensorProperties> {
    let mut modes = Vec::new();
    for i in 0..MAX_NUM_SENSOR_MODES {
        let name = format!("{}{}", SENSOR_MODE_PREFIX, i);
        let Some(mode_node) = node.child(&name) else {
            break;
        };

        log::debug!("parsing {} properties", name);
        let mode = parse_mode(mode_node).with_context(|| format!("while parsing {}", name))?;
        modes.push(mode);
    }

    Ok(SensorProperties { modes })
}
