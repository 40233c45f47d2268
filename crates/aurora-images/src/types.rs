//! Pixel formats and their size arithmetic.

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Bgra8,
    Dxt1,
    Dxt5,
}

impl PixelFormat {
    /// Bytes per pixel, or 0 for block-compressed formats.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Dxt1 | PixelFormat::Dxt5 => 0,
        }
    }

    /// Bytes needed for an image of these dimensions in this format.
    pub fn data_size(self, width: u32, height: u32) -> Result<u32> {
        if width >= 0x8000 || height >= 0x8000 {
            bail!("invalid dimensions {width}x{height}");
        }

        Ok(match self {
            PixelFormat::Rgb8 => width * height * 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => width * height * 4,
            PixelFormat::Dxt1 => 8.max(width.div_ceil(4) * height.div_ceil(4) * 8),
            PixelFormat::Dxt5 => 16.max(width.div_ceil(4) * height.div_ceil(4) * 16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::PixelFormat;

    #[test]
    fn data_sizes() {
        assert_eq!(PixelFormat::Rgb8.data_size(4, 24).unwrap(), 288);
        assert_eq!(PixelFormat::Rgba8.data_size(16, 16).unwrap(), 1024);
        assert_eq!(PixelFormat::Dxt1.data_size(16, 16).unwrap(), 128);
        assert_eq!(PixelFormat::Dxt5.data_size(16, 16).unwrap(), 256);

        // Block formats never go below one block.
        assert_eq!(PixelFormat::Dxt1.data_size(1, 1).unwrap(), 8);
        assert_eq!(PixelFormat::Dxt5.data_size(2, 2).unwrap(), 16);

        assert!(PixelFormat::Rgb8.data_size(0x8000, 4).is_err());
    }

    #[test]
    fn bytes_per_pixel_is_zero_for_compressed() {
        assert_eq!(PixelFormat::Rgb8.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Bgra8.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Dxt1.bytes_per_pixel(), 0);
        assert_eq!(PixelFormat::Dxt5.bytes_per_pixel(), 0);
    }
}
