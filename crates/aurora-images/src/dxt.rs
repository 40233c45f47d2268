//! DXT1/DXT5 block decompression to RGBA.

use crate::types::PixelFormat;

const BLOCK_PITCH: usize = 16;

/// Decompress one DXT1 or DXT5 surface into tightly packed RGBA8.
pub fn decompress(format: PixelFormat, data: &[u8], width: usize, height: usize) -> Vec<u8> {
    let block_size = match format {
        PixelFormat::Dxt1 => 8,
        PixelFormat::Dxt5 => 16,
        _ => panic!("not a block-compressed format: {format:?}"),
    };

    let mut rgba = vec![0u8; width * height * 4];
    let blocks_x = width.div_ceil(4);
    let blocks_y = height.div_ceil(4);

    // One decoded 4x4 block, four bytes per pixel.
    let mut block_rgba = [0u8; 64];

    for by in 0..blocks_y {
        for bx in 0..blocks_x {
            let idx = (by * blocks_x + bx) * block_size;
            if idx + block_size > data.len() {
                break;
            }
            let block = &data[idx..idx + block_size];

            match format {
                PixelFormat::Dxt1 => bcdec_rs::bc1(block, &mut block_rgba, BLOCK_PITCH),
                PixelFormat::Dxt5 => bcdec_rs::bc3(block, &mut block_rgba, BLOCK_PITCH),
                _ => unreachable!(),
            }

            for py in 0..4 {
                for px in 0..4 {
                    let x = bx * 4 + px;
                    let y = by * 4 + py;
                    if x >= width || y >= height {
                        continue;
                    }
                    let src = (py * 4 + px) * 4;
                    let dst = (y * width + x) * 4;
                    rgba[dst..dst + 4].copy_from_slice(&block_rgba[src..src + 4]);
                }
            }
        }
    }

    rgba
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solid_dxt1_block() {
        // Both endpoint colors pure red (5-6-5: 0xf800), all indices 0.
        let block = [0x00, 0xf8, 0x00, 0xf8, 0, 0, 0, 0];
        let rgba = decompress(PixelFormat::Dxt1, &block, 4, 4);
        assert_eq!(rgba.len(), 64);
        for px in rgba.chunks_exact(4) {
            assert_eq!(px, [255, 0, 0, 255]);
        }
    }

    #[test]
    fn solid_dxt5_block_carries_alpha() {
        // Alpha endpoints 0x80/0x80, indices 0; color endpoints pure blue.
        let mut block = [0u8; 16];
        block[0] = 0x80;
        block[1] = 0x80;
        block[8] = 0x1f;
        block[10] = 0x1f;
        let rgba = decompress(PixelFormat::Dxt5, &block, 4, 4);
        for px in rgba.chunks_exact(4) {
            assert_eq!(px, [0, 0, 255, 0x80]);
        }
    }

    #[test]
    fn partial_edge_blocks_are_cropped() {
        let block = [0x00, 0xf8, 0x00, 0xf8, 0, 0, 0, 0];
        let rgba = decompress(PixelFormat::Dxt1, &block, 2, 2);
        assert_eq!(rgba.len(), 16);
        for px in rgba.chunks_exact(4) {
            assert_eq!(px, [255, 0, 0, 255]);
        }
    }
}
