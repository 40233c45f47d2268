//! TPC texture loading.
//!
//! TPC is a compact binary texture container: a fixed 128-byte header,
//! mip-map payloads laid out layer-major, and an optional trailing TXI
//! metadata blob. Cube maps are encoded as a single texture whose height is
//! six times its width; the faces need rotating and partial swapping before
//! they line up with the usual Direct3D face order.

use std::io::{Cursor, Read};

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};

use crate::dxt;
use crate::types::PixelFormat;
use crate::util::{de_swizzle_offset, rotate90};

const ENCODING_GRAY: u8 = 0x01;
const ENCODING_RGB: u8 = 0x02;
const ENCODING_RGBA: u8 = 0x04;
const ENCODING_SWIZZLED_BGRA: u8 = 0x0C;

const HEADER_SIZE: usize = 128;

/// One mip level of one layer.
pub struct MipMap {
    pub width: u32,
    pub height: u32,
    pub size: u32,
    pub data: Vec<u8>,
}

pub struct Tpc {
    format: PixelFormat,
    layer_count: usize,
    is_cube_map: bool,
    /// Layer-major: all mips of face 0, then face 1, ...
    mip_maps: Vec<MipMap>,
    txi_data: Vec<u8>,
}

impl Tpc {
    pub fn load(data: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);

        let (mut tpc, encoding) =
            Self::read_header(&mut reader, data.len()).context("failed reading TPC header")?;
        tpc.read_data(&mut reader, encoding)
            .context("failed reading TPC image data")?;
        tpc.read_txi(&reader);
        tpc.fixup_cube_map()?;

        Ok(tpc)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn layer_count(&self) -> usize {
        self.layer_count
    }

    pub fn is_cube_map(&self) -> bool {
        self.is_cube_map
    }

    /// Mip levels per layer.
    pub fn mip_map_count(&self) -> usize {
        self.mip_maps.len() / self.layer_count
    }

    pub fn width(&self) -> u32 {
        self.mip_maps.first().map_or(0, |m| m.width)
    }

    pub fn height(&self) -> u32 {
        self.mip_maps.first().map_or(0, |m| m.height)
    }

    pub fn mip_maps(&self) -> &[MipMap] {
        &self.mip_maps
    }

    pub fn mip_map(&self, layer: usize, level: usize) -> Option<&MipMap> {
        if layer >= self.layer_count || level >= self.mip_map_count() {
            return None;
        }
        self.mip_maps.get(layer * self.mip_map_count() + level)
    }

    /// The embedded TXI metadata, if any.
    pub fn txi(&self) -> &[u8] {
        &self.txi_data
    }

    /// Convert block-compressed mips to RGBA8 in place.
    pub fn decompress(&mut self) {
        if !matches!(self.format, PixelFormat::Dxt1 | PixelFormat::Dxt5) {
            return;
        }

        for mip in &mut self.mip_maps {
            let rgba = dxt::decompress(
                self.format,
                &mip.data,
                mip.width as usize,
                mip.height as usize,
            );
            mip.size = rgba.len() as u32;
            mip.data = rgba;
        }
        self.format = PixelFormat::Rgba8;
    }

    fn read_header(reader: &mut Cursor<&[u8]>, total_len: usize) -> Result<(Self, u8)> {
        // Size in bytes of the layer-0 mip-0 payload; 0 means uncompressed.
        let mut data_size = reader.read_u32::<LittleEndian>()?;

        reader.read_u32::<LittleEndian>()?; // some float

        let width = reader.read_u16::<LittleEndian>()? as u32;
        let mut height = reader.read_u16::<LittleEndian>()? as u32;
        if width >= 0x8000 || height >= 0x8000 {
            bail!("unsupported image dimensions ({width}x{height})");
        }

        let encoding = reader.read_u8()?;
        let mip_map_count = reader.read_u8()? as usize;

        let mut reserved = [0u8; 114];
        reader.read_exact(&mut reserved)?;

        let mut layer_count = 1usize;
        let mut is_cube_map = false;

        let format;
        let min_data_size: u32;

        if data_size == 0 {
            // Uncompressed image data.
            match encoding {
                ENCODING_GRAY => {
                    // 8bpp grayscale, expanded to RGB on read.
                    format = PixelFormat::Rgb8;
                    min_data_size = 1;
                    data_size = width * height;
                }
                ENCODING_RGB => {
                    format = PixelFormat::Rgb8;
                    min_data_size = 3;
                    data_size = width * height * 3;
                }
                ENCODING_RGBA => {
                    format = PixelFormat::Rgba8;
                    min_data_size = 4;
                    data_size = width * height * 4;
                }
                ENCODING_SWIZZLED_BGRA => {
                    format = PixelFormat::Bgra8;
                    min_data_size = 4;
                    data_size = width * height * 4;
                }
                _ => bail!("unknown TPC raw encoding: {encoding}, {width}x{height}"),
            }
        } else if encoding == ENCODING_RGB {
            // S3TC DXT1.
            format = PixelFormat::Dxt1;
            min_data_size = 8;

            check_cube_map(width, &mut height, &mut layer_count, &mut is_cube_map);

            if data_size != (width * height) / 2 {
                bail!("invalid data size for a {width}x{height} DXT1 texture: {data_size}");
            }
        } else if encoding == ENCODING_RGBA {
            // S3TC DXT5.
            format = PixelFormat::Dxt5;
            min_data_size = 16;

            check_cube_map(width, &mut height, &mut layer_count, &mut is_cube_map);

            if data_size != width * height {
                bail!("invalid data size for a {width}x{height} DXT5 texture: {data_size}");
            }
        } else {
            bail!("unknown TPC encoding: {encoding} ({data_size})");
        }

        // Payload bytes an image of the given dimensions occupies in the
        // file. Grayscale is stored at one byte per pixel.
        let mip_payload_size = |w: u32, h: u32| -> Result<u32> {
            if encoding == ENCODING_GRAY {
                Ok(w * h)
            } else {
                format.data_size(w, h)
            }
        };

        let mut full_data_size = total_len - HEADER_SIZE;
        if full_data_size < layer_count * mip_payload_size(width, height)? as usize {
            bail!("image would not fit into the data");
        }

        let mut mip_maps = Vec::with_capacity(mip_map_count * layer_count);

        for _ in 0..layer_count {
            let mut layer_width = width;
            let mut layer_height = height;
            let mut layer_size = data_size;

            for _ in 0..mip_map_count {
                let mip_width = layer_width.max(1);
                let mip_height = layer_height.max(1);
                let mip_size = layer_size.max(min_data_size);

                let payload = mip_payload_size(mip_width, mip_height)?;
                if full_data_size < mip_size as usize || mip_size < payload {
                    break;
                }
                full_data_size -= mip_size as usize;

                mip_maps.push(MipMap {
                    width: mip_width,
                    height: mip_height,
                    size: mip_size,
                    data: Vec::new(),
                });

                layer_width >>= 1;
                layer_height >>= 1;
                layer_size >>= 2;

                if layer_width < 1 && layer_height < 1 {
                    break;
                }
            }
        }

        if mip_maps.len() % layer_count != 0 {
            bail!(
                "failed to correctly read all texture layers ({layer_count}, {mip_map_count}, {})",
                mip_maps.len()
            );
        }
        if mip_maps.len() < mip_map_count * layer_count {
            log::debug!(
                "TPC declares {} mip maps but only {} fit the data",
                mip_map_count * layer_count,
                mip_maps.len()
            );
        }

        let tpc = Self {
            format,
            layer_count,
            is_cube_map,
            mip_maps,
            txi_data: Vec::new(),
        };

        Ok((tpc, encoding))
    }

    fn read_data(&mut self, reader: &mut Cursor<&[u8]>, encoding: u8) -> Result<()> {
        for mip in &mut self.mip_maps {
            let mut data = vec![0u8; mip.size as usize];
            reader.read_exact(&mut data)?;

            // Power-of-two widths use the swizzled texture memory layout.
            let width_pot = mip.width & (mip.width - 1) == 0;

            if encoding == ENCODING_SWIZZLED_BGRA && width_pot {
                let mut out = vec![0u8; data.len()];
                de_swizzle(&mut out, &data, mip.width, mip.height);
                mip.data = out;
            } else if encoding == ENCODING_GRAY {
                // Unpack 8bpp grayscale into RGB.
                let pixels = (mip.width * mip.height) as usize;
                let mut out = vec![0u8; pixels * 3];
                for (i, &gray) in data.iter().enumerate().take(pixels) {
                    out[i * 3..i * 3 + 3].fill(gray);
                }
                mip.size = out.len() as u32;
                mip.data = out;
            } else {
                mip.data = data;
            }
        }

        Ok(())
    }

    fn read_txi(&mut self, reader: &Cursor<&[u8]>) {
        let pos = (reader.position() as usize).min(reader.get_ref().len());
        self.txi_data = reader.get_ref()[pos..].to_vec();
    }

    /// Rotate and swap the cube faces the way the original games do.
    fn fixup_cube_map(&mut self) -> Result<()> {
        if !self.is_cube_map {
            return Ok(());
        }

        let mip_count = self.mip_map_count();

        for j in 0..mip_count {
            let first = &self.mip_maps[j];
            let (width, height, size) = (first.width, first.height, first.size);

            for i in 1..self.layer_count {
                let mip = &self.mip_maps[i * mip_count + j];
                if mip.width != width || mip.height != height || mip.size != size {
                    bail!("cube map layer dimensions mismatch");
                }
            }
        }

        // Orient each face. Block-compressed faces have no per-pixel byte
        // size and pass through unrotated.
        let bpp = self.format.bytes_per_pixel();
        const ROTATION: [usize; 6] = [3, 1, 0, 2, 2, 0];
        for i in 0..self.layer_count {
            for j in 0..mip_count {
                let mip = &mut self.mip_maps[i * mip_count + j];
                rotate90(
                    &mut mip.data,
                    mip.width as usize,
                    mip.height as usize,
                    bpp,
                    ROTATION[i],
                );
            }
        }

        // The first two faces trade places at every mip level.
        for j in 0..mip_count {
            let (head, tail) = self.mip_maps.split_at_mut(mip_count);
            std::mem::swap(&mut head[j].data, &mut tail[j].data);
        }

        Ok(())
    }
}

fn check_cube_map(width: u32, height: &mut u32, layer_count: &mut usize, is_cube_map: &mut bool) {
    // A texture six times as tall as it is wide holds the six cube faces
    // stacked on top of each other (face-major, mips within each face).
    // Side lengths are powers of two, so height / width == 6 cannot happen
    // for a regular texture.
    if *height == 0 || width == 0 || *height / width != 6 {
        return;
    }

    *height /= 6;
    *layer_count = 6;
    *is_cube_map = true;
}

fn de_swizzle(dst: &mut [u8], src: &[u8], width: u32, height: u32) {
    let mut out = 0usize;
    for y in 0..height {
        for x in 0..width {
            let offset = de_swizzle_offset(x, y, width, height) as usize * 4;
            dst[out..out + 4].copy_from_slice(&src[offset..offset + 4]);
            out += 4;
        }
    }
}
