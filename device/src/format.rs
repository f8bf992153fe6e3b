// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pixel formats supported by the VI2 and the geometry computations derived from them.

use std::collections::BTreeMap;

use v4l2r::bindings;
use v4l2r::bindings::v4l2_pix_format;
use v4l2r::PixelFormat;

use crate::config::ChannelConfig;
use crate::config::GangPolicy;
use crate::regs::SURFACE_ALIGNMENT;
use crate::regs::TEGRA_CSI_BLOCKS;

pub const TEGRA_MIN_WIDTH: u32 = 32;
pub const TEGRA_MAX_WIDTH: u32 = 32768;
pub const TEGRA_MIN_HEIGHT: u32 = 32;
pub const TEGRA_MAX_HEIGHT: u32 = 32768;
pub const TEGRA_DEF_WIDTH: u32 = 1920;
pub const TEGRA_DEF_HEIGHT: u32 = 1080;

pub const V4L2_PIX_FMT_SBGGR8: u32 = PixelFormat::from_fourcc(b"BA81").to_u32();
pub const V4L2_PIX_FMT_SRGGB8: u32 = PixelFormat::from_fourcc(b"RGGB").to_u32();
pub const V4L2_PIX_FMT_SBGGR10: u32 = PixelFormat::from_fourcc(b"BG10").to_u32();
pub const V4L2_PIX_FMT_SRGGB10: u32 = PixelFormat::from_fourcc(b"RG10").to_u32();
pub const V4L2_PIX_FMT_SBGGR12: u32 = PixelFormat::from_fourcc(b"BG12").to_u32();
pub const V4L2_PIX_FMT_SRGGB12: u32 = PixelFormat::from_fourcc(b"RG12").to_u32();
pub const V4L2_PIX_FMT_ABGR32: u32 = PixelFormat::from_fourcc(b"AR24").to_u32();
pub const V4L2_PIX_FMT_UYVY: u32 = PixelFormat::from_fourcc(b"UYVY").to_u32();
pub const V4L2_PIX_FMT_NV16: u32 = PixelFormat::from_fourcc(b"NV16").to_u32();

pub const MEDIA_BUS_FMT_RGB888_1X24: u32 = 0x100a;
pub const MEDIA_BUS_FMT_UYVY8_2X8: u32 = 0x2006;
pub const MEDIA_BUS_FMT_SBGGR8_1X8: u32 = 0x3001;
pub const MEDIA_BUS_FMT_SBGGR10_1X10: u32 = 0x3007;
pub const MEDIA_BUS_FMT_SBGGR12_1X12: u32 = 0x3008;
pub const MEDIA_BUS_FMT_SRGGB10_1X10: u32 = 0x300f;
pub const MEDIA_BUS_FMT_SRGGB12_1X12: u32 = 0x3012;
pub const MEDIA_BUS_FMT_SRGGB8_1X8: u32 = 0x3014;

// Memory formats of the VI.
const T_L8: u32 = 16;
const T_R16_I: u32 = 32;
const T_A8R8G8B8: u32 = 65;
const T_U8_Y8__V8_Y8: u32 = 194;
const T_Y8__V8U8_N422: u32 = 226;

// CSI-2 data types.
const DT_YUV422_8: u32 = 0x1e;
const DT_RGB888: u32 = 0x24;
const DT_RAW8: u32 = 0x2a;
const DT_RAW10: u32 = 0x2b;
const DT_RAW12: u32 = 0x2c;

/// Class of a format, which decides whether the pixel transform of the VI can be bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfCode {
    Raw8,
    Raw10,
    Raw12,
    Rgb888,
    Yuv422,
}

/// Bytes per pixel, as a fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frac {
    pub numerator: u32,
    pub denominator: u32,
}

/// A pixel format the VI can write to memory, and the bus format it is captured from.
#[derive(Debug, PartialEq, Eq)]
pub struct VideoFormat {
    pub vf_code: VfCode,
    /// Bits per pixel on the CSI bus.
    pub bit_width: u32,
    /// Media bus code of the source.
    pub code: u32,
    pub bpp: Frac,
    /// Memory format, as programmed into `CSI_IMAGE_DEF`.
    pub img_fmt: u32,
    /// CSI-2 data type, as programmed into `CSI_IMAGE_DT`.
    pub img_dt: u32,
    pub fourcc: u32,
    pub description: &'static str,
}

impl VideoFormat {
    /// Returns the bytes-per-pixel fraction, with zero terms replaced by 1.
    fn bpp(&self) -> (u32, u32) {
        (self.bpp.numerator.max(1), self.bpp.denominator.max(1))
    }

    /// Returns the number of bytes a line of `width` pixels takes in memory.
    pub fn bytes_per_line(&self, width: u32) -> u32 {
        let (num, den) = self.bpp();
        width.saturating_mul(num) / den
    }

    /// Returns the number of bytes a line of `width` pixels takes on the CSI bus.
    pub fn word_count(&self, width: u32) -> u32 {
        width.saturating_mul(self.bit_width) / 8
    }

    /// Whether the chroma is stored in a second plane, written through surface 1.
    pub fn is_semiplanar(&self) -> bool {
        self.fourcc == V4L2_PIX_FMT_NV16
    }
}

macro_rules! video_format {
    ($vf:ident, $bits:expr, $code:expr, $num:expr, $den:expr, $img_fmt:expr, $dt:expr, $fourcc:expr, $desc:expr) => {
        VideoFormat {
            vf_code: VfCode::$vf,
            bit_width: $bits,
            code: $code,
            bpp: Frac {
                numerator: $num,
                denominator: $den,
            },
            img_fmt: $img_fmt,
            img_dt: $dt,
            fourcc: $fourcc,
            description: $desc,
        }
    };
}

/// All the formats supported by the VI2, in order of preference.
pub static VIDEO_FORMATS: [VideoFormat; 9] = [
    video_format!(Raw8, 8, MEDIA_BUS_FMT_SRGGB8_1X8, 1, 1, T_L8, DT_RAW8, V4L2_PIX_FMT_SRGGB8, "RGRG.. GBGB.."),
    video_format!(Raw8, 8, MEDIA_BUS_FMT_SBGGR8_1X8, 1, 1, T_L8, DT_RAW8, V4L2_PIX_FMT_SBGGR8, "BGBG.. GRGR.."),
    video_format!(Raw10, 10, MEDIA_BUS_FMT_SRGGB10_1X10, 2, 1, T_R16_I, DT_RAW10, V4L2_PIX_FMT_SRGGB10, "RGRG.. GBGB.."),
    video_format!(Raw10, 10, MEDIA_BUS_FMT_SBGGR10_1X10, 2, 1, T_R16_I, DT_RAW10, V4L2_PIX_FMT_SBGGR10, "BGBG.. GRGR.."),
    video_format!(Raw12, 12, MEDIA_BUS_FMT_SRGGB12_1X12, 2, 1, T_R16_I, DT_RAW12, V4L2_PIX_FMT_SRGGB12, "RGRG.. GBGB.."),
    video_format!(Raw12, 12, MEDIA_BUS_FMT_SBGGR12_1X12, 2, 1, T_R16_I, DT_RAW12, V4L2_PIX_FMT_SBGGR12, "BGBG.. GRGR.."),
    video_format!(Rgb888, 24, MEDIA_BUS_FMT_RGB888_1X24, 4, 1, T_A8R8G8B8, DT_RGB888, V4L2_PIX_FMT_ABGR32, "BGRA-8-8-8-8"),
    video_format!(Yuv422, 16, MEDIA_BUS_FMT_UYVY8_2X8, 2, 1, T_U8_Y8__V8_Y8, DT_YUV422_8, V4L2_PIX_FMT_UYVY, "YUV 4:2:2"),
    video_format!(Yuv422, 16, MEDIA_BUS_FMT_UYVY8_2X8, 1, 1, T_Y8__V8U8_N422, DT_YUV422_8, V4L2_PIX_FMT_NV16, "Y/CbCr 4:2:2"),
];

/// Media bus code of the format used when the source does not report any supported one.
pub const DEFAULT_MBUS_CODE: u32 = MEDIA_BUS_FMT_SRGGB10_1X10;

pub fn find_by_fourcc(fourcc: u32) -> Option<&'static VideoFormat> {
    VIDEO_FORMATS.iter().find(|f| f.fourcc == fourcc)
}

/// Returns all the formats that can be captured from media bus code `code`.
pub fn find_by_code(code: u32) -> impl Iterator<Item = &'static VideoFormat> {
    VIDEO_FORMATS.iter().filter(move |f| f.code == code)
}

pub fn default_format() -> &'static VideoFormat {
    // The table always contains the default code.
    find_by_code(DEFAULT_MBUS_CODE)
        .next()
        .unwrap_or(&VIDEO_FORMATS[0])
}

/// Set of formats a channel supports, keyed by fourcc.
#[derive(Debug, Default, Clone)]
pub struct FormatSet(BTreeMap<u32, &'static VideoFormat>);

impl FormatSet {
    pub fn insert(&mut self, format: &'static VideoFormat) {
        self.0.insert(format.fourcc, format);
    }

    pub fn get(&self, fourcc: u32) -> Option<&'static VideoFormat> {
        self.0.get(&fourcc).copied()
    }

    /// Returns the `index`th format of the set, for enumeration.
    pub fn nth(&self, index: usize) -> Option<&'static VideoFormat> {
        self.0.values().nth(index).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Format of the media bus between two sub-devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbusFormat {
    pub width: u32,
    pub height: u32,
    pub code: u32,
    pub field: u32,
    pub colorspace: u32,
}

impl MbusFormat {
    pub fn from_pix(pix: &v4l2_pix_format, code: u32) -> Self {
        Self {
            width: pix.width,
            height: pix.height,
            code,
            field: pix.field,
            colorspace: pix.colorspace,
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u32, b: u32) -> u32 {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

fn round_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align).saturating_mul(align)
}

fn round_down(value: u32, align: u32) -> u32 {
    if align <= 1 {
        return value;
    }
    value / align * align
}

/// Clamps `value` to `[low, high]`, with `high` winning if the range is empty.
fn clamp(value: u32, low: u32, high: u32) -> u32 {
    value.max(low).min(high)
}

/// Alignment constraints of a channel. All values are non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    /// In bytes.
    pub width: u32,
    /// In bytes.
    pub stride: u32,
    /// In lines.
    pub height: u32,
    /// In bytes.
    pub size: u32,
}

impl Alignment {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            width: config.width_align.max(1),
            stride: config.stride_align.max(1),
            height: config.height_align.max(1),
            size: config.size_align.max(1),
        }
    }

    /// Adjusts the width, height and stride of `pix` to what the VI can write for `format`.
    ///
    /// The width is aligned in bytes, to the least common multiple of the channel width alignment
    /// and of the format alignment, then clamped and converted back to pixels. A zero stride is
    /// replaced by the minimum one.
    pub fn align(&self, format: &VideoFormat, pix: &mut v4l2_pix_format) {
        let (num, den) = format.bpp();
        let bpl = format.bytes_per_line(pix.width);
        if pix.bytesperline == 0 {
            pix.bytesperline = bpl;
        }

        let fmt_align = if den == 1 { num } else { 1 };
        let align = lcm(self.width, fmt_align).max(1);
        let min_width = round_up(TEGRA_MIN_WIDTH, align);
        let max_width = round_down(TEGRA_MAX_WIDTH, align);
        let width = clamp(round_up(bpl, align), min_width, max_width);

        pix.width = width.saturating_mul(den) / num;
        pix.height = clamp(pix.height, TEGRA_MIN_HEIGHT, TEGRA_MAX_HEIGHT);

        let min_bpl = format.bytes_per_line(pix.width);
        let max_bpl = round_down(TEGRA_MAX_WIDTH, self.stride);
        pix.bytesperline = clamp(round_up(pix.bytesperline, self.stride), min_bpl, max_bpl);
    }

    /// Returns the size of a buffer holding `height` lines of `bytesperline` bytes of `format`.
    pub fn buffer_size(&self, format: &VideoFormat, bytesperline: u32, height: u32) -> u32 {
        let size = round_up(
            bytesperline.saturating_mul(round_up(height, self.height)),
            self.size,
        );
        if format.is_semiplanar() {
            size.saturating_mul(2)
        } else {
            size
        }
    }
}

/// How a frame is split between the ports of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GangMode {
    /// The frame comes from a single port.
    #[default]
    None,
    LeftRight,
    RightLeft,
    TopBottom,
    BottomTop,
}

impl GangMode {
    /// Returns the width of the part of a `width` pixels wide frame each port captures.
    pub fn port_width(self, width: u32) -> u32 {
        match self {
            GangMode::LeftRight | GangMode::RightLeft => width >> 1,
            GangMode::None | GangMode::TopBottom | GangMode::BottomTop => width,
        }
    }

    /// Returns the height of the part of a `height` lines high frame each port captures.
    pub fn port_height(self, height: u32) -> u32 {
        match self {
            GangMode::TopBottom | GangMode::BottomTop => height >> 1,
            GangMode::None | GangMode::LeftRight | GangMode::RightLeft => height,
        }
    }
}

/// Geometry of the part of the frame captured by each port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GangGeometry {
    pub mode: GangMode,
    /// Number of ports taking part in the capture.
    pub valid_ports: usize,
    pub width: u32,
    pub height: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    /// Offset from the start of the buffer at which each port writes.
    pub offsets: [u32; TEGRA_CSI_BLOCKS],
}

impl GangGeometry {
    pub fn new(
        mode: GangMode,
        valid_ports: usize,
        total_ports: usize,
        pix: &v4l2_pix_format,
        format: &VideoFormat,
    ) -> Self {
        let width = mode.port_width(pix.width);
        let height = mode.port_height(pix.height);
        let bytesperline = format.bytes_per_line(width);
        let sizeimage = bytesperline.saturating_mul(pix.height);

        let step = match mode {
            GangMode::None | GangMode::LeftRight | GangMode::RightLeft => bytesperline,
            GangMode::TopBottom | GangMode::BottomTop => sizeimage,
        };
        let step = round_up(step, SURFACE_ALIGNMENT);

        let mut offsets = [0; TEGRA_CSI_BLOCKS];
        for (i, offset) in offsets
            .iter_mut()
            .enumerate()
            .take(total_ports.min(TEGRA_CSI_BLOCKS))
        {
            *offset = step.saturating_mul(i as u32);
        }

        Self {
            mode,
            valid_ports,
            width,
            height,
            bytesperline,
            sizeimage,
            offsets,
        }
    }
}

/// Current format of a channel, and everything derived from it.
#[derive(Clone, Copy)]
pub struct ChannelFormat {
    pub pix: v4l2_pix_format,
    pub vfmt: &'static VideoFormat,
    pub align: Alignment,
    pub gang: GangGeometry,
}

impl ChannelFormat {
    pub fn new(
        vfmt: &'static VideoFormat,
        align: Alignment,
        width: u32,
        height: u32,
        total_ports: usize,
        policy: &GangPolicy,
    ) -> Self {
        let pix = v4l2_pix_format {
            field: bindings::v4l2_field_V4L2_FIELD_NONE,
            colorspace: bindings::v4l2_colorspace_V4L2_COLORSPACE_SRGB,
            ..Default::default()
        };
        let mut format = Self {
            pix,
            vfmt,
            align,
            gang: GangGeometry::new(GangMode::None, 1, total_ports, &pix, vfmt),
        };
        format.update(vfmt, width, height, 0, total_ports, policy);
        format
    }

    /// Switches to `vfmt` at `width` x `height`, aligning the geometry and recomputing the buffer
    /// size and gang geometry. A non-zero `preferred_stride` is honored if it fits the alignment
    /// constraints.
    pub fn update(
        &mut self,
        vfmt: &'static VideoFormat,
        width: u32,
        height: u32,
        preferred_stride: u32,
        total_ports: usize,
        policy: &GangPolicy,
    ) {
        self.vfmt = vfmt;
        self.pix.width = width;
        self.pix.height = height;
        self.pix.pixelformat = vfmt.fourcc;
        self.pix.bytesperline = if preferred_stride != 0 {
            preferred_stride
        } else {
            vfmt.bytes_per_line(width)
        };

        self.align.align(vfmt, &mut self.pix);
        self.pix.sizeimage = self
            .align
            .buffer_size(vfmt, self.pix.bytesperline, self.pix.height);

        let (mode, valid_ports) = if total_ports > 1
            && self.pix.width > policy.min_width
            && self.pix.height > policy.min_height
        {
            (policy.split, total_ports)
        } else {
            (GangMode::None, 1)
        };
        self.gang = GangGeometry::new(mode, valid_ports, total_ports, &self.pix, vfmt);
    }

    /// Recomputes the geometry after a change of the alignment constraints.
    pub fn realign(&mut self, total_ports: usize, policy: &GangPolicy) {
        let (width, height) = (self.pix.width, self.pix.height);
        self.update(self.vfmt, width, height, 0, total_ports, policy);
    }

    pub fn valid_ports(&self) -> usize {
        self.gang.valid_ports
    }

    /// Returns the width and height each port captures.
    pub fn port_geometry(&self) -> (u32, u32) {
        if self.gang.valid_ports > 1 {
            (self.gang.width, self.gang.height)
        } else {
            (self.pix.width, self.pix.height)
        }
    }
}

#[cfg(test)]
mod tests {
    use v4l2r::bindings::v4l2_pix_format;

    use crate::config::GangPolicy;

    use super::*;

    fn unaligned() -> Alignment {
        Alignment {
            width: 1,
            stride: 1,
            height: 1,
            size: 1,
        }
    }

    fn pix(width: u32, height: u32) -> v4l2_pix_format {
        v4l2_pix_format {
            width,
            height,
            ..Default::default()
        }
    }

    #[test]
    fn format_lookup() {
        assert_eq!(default_format().fourcc, V4L2_PIX_FMT_SRGGB10);
        assert_eq!(
            find_by_fourcc(V4L2_PIX_FMT_NV16).map(|f| f.vf_code),
            Some(VfCode::Yuv422)
        );
        assert_eq!(find_by_fourcc(0), None);

        let yuv: Vec<u32> = find_by_code(MEDIA_BUS_FMT_UYVY8_2X8)
            .map(|f| f.fourcc)
            .collect();
        assert_eq!(yuv, vec![V4L2_PIX_FMT_UYVY, V4L2_PIX_FMT_NV16]);
    }

    #[test]
    fn word_count() {
        let raw10 = find_by_fourcc(V4L2_PIX_FMT_SRGGB10).unwrap();
        assert_eq!(raw10.word_count(1920), 2400);
        let raw8 = find_by_fourcc(V4L2_PIX_FMT_SRGGB8).unwrap();
        assert_eq!(raw8.word_count(1920), 1920);
    }

    #[test]
    fn align_keeps_valid_geometry() {
        let raw10 = find_by_fourcc(V4L2_PIX_FMT_SRGGB10).unwrap();
        let mut p = pix(1000, 500);
        unaligned().align(raw10, &mut p);
        assert_eq!((p.width, p.height, p.bytesperline), (1000, 500, 2000));
    }

    #[test]
    fn align_width_to_lcm() {
        let raw10 = find_by_fourcc(V4L2_PIX_FMT_SRGGB10).unwrap();
        let align = Alignment {
            width: 64,
            ..unaligned()
        };
        let mut p = pix(1001, 500);
        align.align(raw10, &mut p);
        // 2002 bytes rounded up to 2048.
        assert_eq!(p.width, 1024);
        assert_eq!(p.bytesperline, 2048);
    }

    #[test]
    fn align_clamps() {
        let raw8 = find_by_fourcc(V4L2_PIX_FMT_SRGGB8).unwrap();
        let mut p = pix(10, 5);
        unaligned().align(raw8, &mut p);
        assert_eq!((p.width, p.height, p.bytesperline), (32, 32, 32));

        let mut p = pix(100_000, 40_000);
        unaligned().align(raw8, &mut p);
        assert_eq!((p.width, p.height), (TEGRA_MAX_WIDTH, TEGRA_MAX_HEIGHT));
        assert_eq!(p.bytesperline, TEGRA_MAX_WIDTH);
    }

    #[test]
    fn stride_alignment() {
        let raw8 = find_by_fourcc(V4L2_PIX_FMT_SRGGB8).unwrap();
        let align = Alignment {
            stride: 256,
            ..unaligned()
        };
        let mut p = pix(1000, 100);
        align.align(raw8, &mut p);
        assert_eq!(p.bytesperline, 1024);
    }

    #[test]
    fn buffer_size() {
        let raw10 = find_by_fourcc(V4L2_PIX_FMT_SRGGB10).unwrap();
        let align = Alignment {
            height: 16,
            size: 4096,
            ..unaligned()
        };
        assert_eq!(align.buffer_size(raw10, 3840, 1080), 3840 * 1088);
        assert_eq!(align.buffer_size(raw10, 100, 10), 4096);

        let nv16 = find_by_fourcc(V4L2_PIX_FMT_NV16).unwrap();
        assert_eq!(unaligned().buffer_size(nv16, 1920, 1080), 1920 * 1080 * 2);
    }

    #[test]
    fn gang_offsets_left_right() {
        let raw10 = find_by_fourcc(V4L2_PIX_FMT_SRGGB10).unwrap();
        let gang = GangGeometry::new(GangMode::LeftRight, 2, 2, &pix(3840, 2160), raw10);
        assert_eq!((gang.width, gang.height), (1920, 2160));
        assert_eq!(gang.bytesperline, 3840);
        assert_eq!(gang.sizeimage, 3840 * 2160);
        assert_eq!(gang.offsets, [0, 3840, 0, 0, 0, 0]);
    }

    #[test]
    fn gang_offsets_top_bottom() {
        let raw10 = find_by_fourcc(V4L2_PIX_FMT_SRGGB10).unwrap();
        let gang = GangGeometry::new(GangMode::BottomTop, 2, 2, &pix(3840, 2160), raw10);
        assert_eq!((gang.width, gang.height), (3840, 1080));
        assert_eq!(gang.offsets[1], 7680 * 2160);
    }

    /// Offsets are multiples of the surface alignment, and port 0 always writes at the start of
    /// the buffer.
    #[test]
    fn gang_offsets_are_aligned() {
        let raw8 = find_by_fourcc(V4L2_PIX_FMT_SRGGB8).unwrap();
        for mode in [
            GangMode::None,
            GangMode::LeftRight,
            GangMode::RightLeft,
            GangMode::TopBottom,
            GangMode::BottomTop,
        ] {
            for width in [1000, 1001, 4000] {
                let gang = GangGeometry::new(mode, 3, 3, &pix(width, 99), raw8);
                assert_eq!(gang.offsets[0], 0);
                let step = gang.offsets[1];
                assert_eq!(step % SURFACE_ALIGNMENT, 0);
                assert_eq!(gang.offsets[2], 2 * step);
                assert_eq!(&gang.offsets[3..], &[0, 0, 0]);
            }
        }

        let gang = GangGeometry::new(GangMode::LeftRight, 3, 3, &pix(1000, 99), raw8);
        assert_eq!(gang.offsets[..3], [0, 512, 1024]);
    }

    #[test]
    fn channel_format_gangs_large_frames() {
        let policy = GangPolicy::default();
        let raw10 = default_format();

        let format = ChannelFormat::new(raw10, unaligned(), 1920, 1080, 2, &policy);
        assert_eq!(format.valid_ports(), 1);
        assert_eq!(format.gang.mode, GangMode::None);
        assert_eq!(format.port_geometry(), (1920, 1080));
        assert_eq!(format.pix.sizeimage, 3840 * 1080);

        let format = ChannelFormat::new(raw10, unaligned(), 3840, 2160, 2, &policy);
        assert_eq!(format.valid_ports(), 2);
        assert_eq!(format.gang.mode, GangMode::LeftRight);
        assert_eq!(format.port_geometry(), (1920, 2160));

        let format = ChannelFormat::new(raw10, unaligned(), 3840, 2160, 1, &policy);
        assert_eq!(format.valid_ports(), 1);
    }

    #[test]
    fn channel_format_honors_stride() {
        let policy = GangPolicy::default();
        let mut format = ChannelFormat::new(default_format(), unaligned(), 640, 480, 1, &policy);
        assert_eq!(format.pix.bytesperline, 1280);

        format.update(default_format(), 640, 480, 1536, 1, &policy);
        assert_eq!(format.pix.bytesperline, 1536);
        assert_eq!(format.pix.sizeimage, 1536 * 480);
    }
}
