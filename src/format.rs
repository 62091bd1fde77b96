//! Pixel formats and usage flags as the host runtime encodes them.

use bitflags::bitflags;
use std::fmt;

/// Host pixel format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat(pub i32);

impl PixelFormat {
    pub const RGBA_8888: Self = Self(1);
    pub const RGBX_8888: Self = Self(2);
    pub const RGB_888: Self = Self(3);
    pub const RGB_565: Self = Self(4);
    pub const BGRA_8888: Self = Self(5);
    pub const YCBCR_422_SP: Self = Self(0x10);
    pub const YCRCB_420_SP: Self = Self(0x11);
    pub const YCBCR_422_I: Self = Self(0x14);
    pub const YV12: Self = Self(0x3231_5659);

    /// Every format the allocator can produce a stride for.
    pub const KNOWN: [PixelFormat; 9] = [
        Self::RGBA_8888,
        Self::RGBX_8888,
        Self::RGB_888,
        Self::RGB_565,
        Self::BGRA_8888,
        Self::YCBCR_422_SP,
        Self::YCRCB_420_SP,
        Self::YCBCR_422_I,
        Self::YV12,
    ];

    /// Bytes per pixel of the first plane, or 0 for an unknown format.
    ///
    /// Planar YUV formats only account for the luma plane; this is all that
    /// is needed to turn a byte stride into a pixel stride.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::RGBA_8888 | Self::RGBX_8888 | Self::BGRA_8888 => 4,
            Self::RGB_888 => 3,
            Self::RGB_565 | Self::YCBCR_422_I => 2,
            // planar; only Y is considered
            Self::YV12 | Self::YCBCR_422_SP | Self::YCRCB_420_SP => 1,
            _ => 0,
        }
    }

    pub fn is_known(self) -> bool {
        self.bytes_per_pixel() != 0
    }

    /// Extra rows of chroma stored below the luma plane, as (num, den) of the height.
    pub(crate) fn chroma_rows(self) -> (u64, u64) {
        match self {
            Self::YV12 | Self::YCRCB_420_SP => (1, 2),
            Self::YCBCR_422_SP => (1, 1),
            _ => (0, 1),
        }
    }

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::RGBA_8888 => "rgba8888",
            Self::RGBX_8888 => "rgbx8888",
            Self::RGB_888 => "rgb888",
            Self::RGB_565 => "rgb565",
            Self::BGRA_8888 => "bgra8888",
            Self::YCBCR_422_SP => "nv16",
            Self::YCRCB_420_SP => "nv21",
            Self::YCBCR_422_I => "yuyv",
            Self::YV12 => "yv12",
            _ => return None,
        })
    }

    /// Looks a format up by its short name (as printed by `name`).
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::KNOWN.into_iter().find(|f| f.name() == Some(name.as_str()))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "format({:#x})", self.0),
        }
    }
}

bitflags! {
    /// Usage flags a buffer is allocated or locked for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Usage: u32 {
        const SW_READ_RARELY = 0x0000_0002;
        const SW_READ_OFTEN = 0x0000_0003;
        const SW_READ_MASK = 0x0000_000f;
        const SW_WRITE_RARELY = 0x0000_0020;
        const SW_WRITE_OFTEN = 0x0000_0030;
        const SW_WRITE_MASK = 0x0000_00f0;
        const HW_TEXTURE = 0x0000_0100;
        const HW_RENDER = 0x0000_0200;
        const HW_2D = 0x0000_0400;
        const HW_COMPOSER = 0x0000_0800;
        const HW_FB = 0x0000_1000;
        const HW_VIDEO_ENCODER = 0x0001_0000;
    }
}

impl Usage {
    pub fn reads_sw(self) -> bool {
        self.intersects(Usage::SW_READ_MASK)
    }

    pub fn writes_sw(self) -> bool {
        self.intersects(Usage::SW_WRITE_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpp_classes() {
        assert_eq!(PixelFormat::RGBA_8888.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::RGBX_8888.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::BGRA_8888.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::RGB_888.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::RGB_565.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::YCBCR_422_I.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::YV12.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::YCBCR_422_SP.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::YCRCB_420_SP.bytes_per_pixel(), 1);
    }

    #[test]
    fn unknown_format_is_zero() {
        assert_eq!(PixelFormat(0).bytes_per_pixel(), 0);
        assert_eq!(PixelFormat(-1).bytes_per_pixel(), 0);
        assert!(!PixelFormat(0x7fff).is_known());
        assert_eq!(PixelFormat(0x7fff).to_string(), "format(0x7fff)");
    }

    #[test]
    fn names_round_trip() {
        for format in PixelFormat::KNOWN {
            let name = format.name().unwrap();
            assert_eq!(PixelFormat::from_name(name), Some(format));
        }
        assert_eq!(PixelFormat::from_name(" RGBA8888 "), Some(PixelFormat::RGBA_8888));
        assert_eq!(PixelFormat::from_name("argb2101010"), None);
    }

    #[test]
    fn usage_masks() {
        assert!(Usage::SW_READ_OFTEN.reads_sw());
        assert!(!Usage::SW_READ_OFTEN.writes_sw());
        assert!(Usage::SW_WRITE_RARELY.writes_sw());
        assert!(!Usage::HW_TEXTURE.reads_sw());
        assert_eq!(Usage::from_bits_retain(0x33), Usage::SW_READ_OFTEN | Usage::SW_WRITE_OFTEN);
    }
}
