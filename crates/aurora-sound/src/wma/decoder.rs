//! The WMA v1/v2 codec proper.
//!
//! A decoder instance derives its entire table set (exponent band layouts,
//! spectral codebooks, noise table, MDCT set) from the stream parameters at
//! construction time and never mutates it afterwards. Per-packet state is
//! limited to the bit-reservoir overhang and the overlap-add tails.

use aurora_common::{sine_window, BitReader, Huffman, Mdct};
use log::warn;

use super::data;
use crate::audiostream::{AudioStream, PacketizedAudioStream, QueuingAudioStream};
use crate::error::{DecoderError, Result};

const CHANNELS_MAX: usize = 2;
const BLOCK_BITS_MIN: u32 = 7;

/// Max size of the bit-reservoir overhang carried between packets.
const SUPERFRAME_SIZE_MAX: usize = 16384;

const HIGH_BAND_SIZE_MAX: usize = 16;
const NOISE_TAB_SIZE: usize = 8192;

const LSP_POW_BITS: u32 = 7;
const LSP_COEF_COUNT: usize = 10;

/// Streaming WMA v1/v2 decoder with an owned PCM output queue.
pub struct WmaStream {
    version: i32,

    sample_rate: u32,
    channels: usize,
    bit_rate: u32,
    block_align: u32,

    // Feature flags from the stream extra-data.
    use_exp_huffman: bool,
    use_bit_reservoir: bool,
    use_variable_block_len: bool,
    use_noise_coding: bool,

    frame_len: usize,
    frame_len_bits: u32,
    block_size_count: usize,
    byte_offset_bits: u32,

    // Band layout, one entry per MDCT block size.
    coefs_start: usize,
    coefs_end: Vec<usize>,
    exponent_bands: Vec<Vec<u16>>,
    high_band_start: Vec<usize>,
    exponent_high_bands: Vec<Vec<usize>>,

    // Spectral run-level codebooks (index 1 covers the mid/side channel).
    coef_huffman: [Huffman; 2],
    coef_run_table: [Vec<u16>; 2],
    coef_level_table: [Vec<f32>; 2],

    // Perceptual noise substitution.
    noise_mult: f32,
    noise_table: Vec<f32>,
    noise_index: usize,
    hgain_huffman: Option<Huffman>,

    // Exponent decoding, either Huffman scale factors or LSP.
    exp_huffman: Option<Huffman>,
    lsp_cos_table: Vec<f32>,
    lsp_pow_e_table: Vec<f32>,
    lsp_pow_m_table1: Vec<f32>,
    lsp_pow_m_table2: Vec<f32>,

    mdct: Vec<Mdct>,
    mdct_window: Vec<Vec<f32>>,

    // Per-superframe state.
    last_superframe: Vec<u8>,
    last_superframe_len: usize,
    last_bitoffset: usize,
    reset_block_lengths: bool,

    // Per-frame state.
    cur_frame: usize,
    frame_pos: usize,
    cur_block: usize,
    block_len: usize,
    block_len_bits: u32,
    next_block_len_bits: u32,
    prev_block_len_bits: u32,

    // Per-block scratch.
    exponents_bsize: [usize; CHANNELS_MAX],
    exponents: [Vec<f32>; CHANNELS_MAX],
    max_exponent: [f32; CHANNELS_MAX],
    high_band_coded: [[bool; HIGH_BAND_SIZE_MAX]; CHANNELS_MAX],
    high_band_values: [[i32; HIGH_BAND_SIZE_MAX]; CHANNELS_MAX],
    coefs1: [Vec<f32>; CHANNELS_MAX],
    coefs: [Vec<f32>; CHANNELS_MAX],

    // Output.
    output: Vec<f32>,
    frame_out: [Vec<f32>; CHANNELS_MAX],
    queue: QueuingAudioStream,
}

impl WmaStream {
    pub fn new(
        version: i32,
        sample_rate: u32,
        channels: u8,
        bit_rate: u32,
        block_align: u32,
        extra_data: &[u8],
    ) -> Result<Self> {
        if version != 1 && version != 2 {
            return Err(DecoderError::Unsupported(format!(
                "unsupported WMA version {version}"
            )));
        }
        if sample_rate == 0 || sample_rate > 50000 {
            return Err(DecoderError::InvalidData(format!(
                "invalid sample rate {sample_rate}"
            )));
        }
        if channels == 0 || channels as usize > CHANNELS_MAX {
            return Err(DecoderError::Unsupported(format!(
                "unsupported channel count {channels}"
            )));
        }
        let channels = channels as usize;

        let flags = stream_flags(version, extra_data);
        let use_exp_huffman = (flags & 0x0001) != 0;
        let use_bit_reservoir = (flags & 0x0002) != 0;
        let mut use_variable_block_len = (flags & 0x0004) != 0;

        // Some v2 streams set the variable-block flag but never use it; they
        // are recognizable by this extra-data signature.
        if version == 2
            && extra_data.len() >= 8
            && u16::from_le_bytes([extra_data[4], extra_data[5]]) == 0x000D
        {
            use_variable_block_len = false;
        }

        let frame_len_bits = frame_bit_length(version, sample_rate);
        let frame_len = 1usize << frame_len_bits;

        let block_size_count = if use_variable_block_len {
            let mut count = ((flags >> 3) & 3) as u32 + 1;
            if bit_rate / channels as u32 >= 32000 {
                count += 2;
            }
            count.min(frame_len_bits - BLOCK_BITS_MIN) as usize + 1
        } else {
            1
        };

        let bps = bit_rate as f32 / (channels as u32 * sample_rate) as f32;
        let byte_offset_bits = ilog2(((bps * frame_len as f32 / 8.0 + 0.05) as u32).max(1)) + 2;

        let (use_noise_coding, high_freq, bps_adj) =
            noise_decision(version, sample_rate, channels, bps);

        let layout = BandLayout::compute(
            version,
            sample_rate,
            frame_len_bits,
            block_size_count,
            high_freq,
        );

        let noise_mult = if use_exp_huffman { 0.02 } else { 0.04 };
        let (noise_table, hgain_huffman) = if use_noise_coding {
            (
                build_noise_table(noise_mult),
                Some(Huffman::new(
                    &data::HGAIN_HUFF_CODES,
                    &data::HGAIN_HUFF_BITS,
                )?),
            )
        } else {
            (Vec::new(), None)
        };

        let (coef_huffman, coef_run_table, coef_level_table) =
            build_coef_huffman(sample_rate, bps_adj)?;

        let mdct: Vec<Mdct> = (0..block_size_count)
            .map(|i| Mdct::new(frame_len_bits - i as u32 + 1, 1.0))
            .collect();
        let mdct_window: Vec<Vec<f32>> = (0..block_size_count)
            .map(|i| sine_window(frame_len_bits - i as u32))
            .collect();

        let mut exp_huffman = None;
        let mut lsp_cos_table = Vec::new();
        let mut lsp_pow_e_table = Vec::new();
        let mut lsp_pow_m_table1 = Vec::new();
        let mut lsp_pow_m_table2 = Vec::new();
        if use_exp_huffman {
            exp_huffman = Some(Huffman::new(
                &data::SCALE_HUFF_CODES,
                &data::SCALE_HUFF_BITS,
            )?);
        } else {
            let wdel = std::f32::consts::PI / frame_len as f32;
            lsp_cos_table = (0..frame_len).map(|i| 2.0 * (wdel * i as f32).cos()).collect();

            lsp_pow_e_table = (0..256)
                .map(|i| 2.0f32.powf((i as i32 - 126) as f32 * -0.25))
                .collect();

            // Two-table linear interpolation of x^(-1/4) over the mantissa.
            lsp_pow_m_table1 = vec![0.0; 1 << LSP_POW_BITS];
            lsp_pow_m_table2 = vec![0.0; 1 << LSP_POW_BITS];
            let mut b = 1.0f32;
            for i in (0..1usize << LSP_POW_BITS).rev() {
                let m = (1usize << LSP_POW_BITS) + i;
                let a = (m as f32 * (0.5 / (1 << LSP_POW_BITS) as f32)).powf(-0.25);
                lsp_pow_m_table1[i] = 2.0 * a - b;
                lsp_pow_m_table2[i] = b - a;
                b = a;
            }
        }

        Ok(Self {
            version,
            sample_rate,
            channels,
            bit_rate,
            block_align,
            use_exp_huffman,
            use_bit_reservoir,
            use_variable_block_len,
            use_noise_coding,
            frame_len,
            frame_len_bits,
            block_size_count,
            byte_offset_bits,
            coefs_start: layout.coefs_start,
            coefs_end: layout.coefs_end,
            exponent_bands: layout.exponent_bands,
            high_band_start: layout.high_band_start,
            exponent_high_bands: layout.exponent_high_bands,
            coef_huffman,
            coef_run_table,
            coef_level_table,
            noise_mult,
            noise_table,
            noise_index: 0,
            hgain_huffman,
            exp_huffman,
            lsp_cos_table,
            lsp_pow_e_table,
            lsp_pow_m_table1,
            lsp_pow_m_table2,
            mdct,
            mdct_window,
            last_superframe: vec![0; SUPERFRAME_SIZE_MAX + 4],
            last_superframe_len: 0,
            last_bitoffset: 0,
            reset_block_lengths: true,
            cur_frame: 0,
            frame_pos: 0,
            cur_block: 0,
            block_len: frame_len,
            block_len_bits: frame_len_bits,
            next_block_len_bits: frame_len_bits,
            prev_block_len_bits: frame_len_bits,
            exponents_bsize: [0; CHANNELS_MAX],
            exponents: [vec![0.0; frame_len], vec![0.0; frame_len]],
            max_exponent: [1.0; CHANNELS_MAX],
            high_band_coded: [[false; HIGH_BAND_SIZE_MAX]; CHANNELS_MAX],
            high_band_values: [[0; HIGH_BAND_SIZE_MAX]; CHANNELS_MAX],
            coefs1: [vec![0.0; frame_len], vec![0.0; frame_len]],
            coefs: [vec![0.0; frame_len], vec![0.0; frame_len]],
            output: vec![0.0; frame_len * 2],
            frame_out: [vec![0.0; frame_len * 2], vec![0.0; frame_len * 2]],
            queue: QueuingAudioStream::new(sample_rate, channels),
        })
    }

    /// Output samples per channel and frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Compressed bit rate the stream was encoded at.
    pub fn bit_rate(&self) -> u32 {
        self.bit_rate
    }

    // ---- superframe demuxing ------------------------------------------------

    fn decode_superframe(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        let mut size = data.len();
        if self.block_align != 0 {
            if size < self.block_align as usize {
                return Err(DecoderError::InvalidData(format!(
                    "packet of {size} bytes is smaller than the block align"
                )));
            }
            size = self.block_align as usize;
        }
        let buf = &data[..size];

        let mut bits = BitReader::new(buf);
        self.cur_frame = 0;

        if !self.use_bit_reservoir {
            // One frame per packet, nothing carried over.
            let mut output = vec![0i16; self.channels * self.frame_len];
            self.decode_frame(&mut bits, &mut output)?;
            return Ok(output);
        }

        bits.skip(4); // superframe index

        let new_frame_count = bits.get_bits(4) as i32 - 1;
        if new_frame_count < 0 {
            return Err(DecoderError::InvalidData(format!(
                "superframe with frame count {new_frame_count}"
            )));
        }
        let new_frame_count = new_frame_count as usize;

        let frame_count = new_frame_count + usize::from(self.last_superframe_len > 0);
        let mut output = vec![0i16; frame_count * self.channels * self.frame_len];

        // Number of bits completing the previous superframe's overhang.
        let mut bit_offset = bits.get_bits(self.byte_offset_bits as usize + 3) as usize;

        if self.last_superframe_len > 0 {
            // Paste the complementary bits onto the overhang and decode the
            // carried frame from it. A failure here leaves its PCM silent
            // but does not fail the packet.
            if self.last_superframe_len + (bit_offset + 7) / 8 > SUPERFRAME_SIZE_MAX + 4 {
                return Err(DecoderError::InvalidData("bit reservoir overflow".into()));
            }

            let mut q = self.last_superframe_len;
            while bit_offset > 7 {
                self.last_superframe[q] = bits.get_bits(8) as u8;
                q += 1;
                bit_offset -= 8;
            }
            if bit_offset > 0 {
                self.last_superframe[q] = (bits.get_bits(bit_offset) as u8) << (8 - bit_offset);
                q += 1;
                bit_offset = 0;
            }
            self.last_superframe_len = q;

            let overhang = self.last_superframe[..q].to_vec();
            let mut last_bits = BitReader::new(&overhang);
            last_bits.skip(self.last_bitoffset as isize);

            if let Err(e) = self.decode_frame(&mut last_bits, &mut output) {
                warn!("carried-over WMA frame failed to decode: {e}");
            }
            self.cur_frame += 1;
        }

        // Skip whatever part of the complementary data we did not use.
        bits.skip(bit_offset as isize);

        // New superframe, new block lengths.
        self.reset_block_lengths = true;

        for _ in 0..new_frame_count {
            self.decode_frame(&mut bits, &mut output)?;
            self.cur_frame += 1;
        }

        // Save the unconsumed tail as the next overhang.
        let remaining_bits = bits.size() - bits.pos();
        if remaining_bits > 0 {
            let len = (remaining_bits + 7) / 8;
            if len > SUPERFRAME_SIZE_MAX + 4 {
                return Err(DecoderError::InvalidData("bit reservoir overflow".into()));
            }
            self.last_superframe_len = len;
            self.last_bitoffset = (8 - remaining_bits % 8) % 8;
            self.last_superframe[..len].copy_from_slice(&buf[size - len..]);
        } else {
            self.last_superframe_len = 0;
            self.last_bitoffset = 0;
        }

        Ok(output)
    }

    // ---- frame and block decoding -------------------------------------------

    fn decode_frame(&mut self, bits: &mut BitReader, output: &mut [i16]) -> Result<()> {
        self.frame_pos = 0;
        self.cur_block = 0;

        while !self.decode_block(bits)? {}

        // Interleave and clamp the finished first half of the window.
        let base = self.cur_frame * self.channels * self.frame_len;
        let out = &mut output[base..base + self.channels * self.frame_len];
        for i in 0..self.frame_len {
            for ch in 0..self.channels {
                out[i * self.channels + ch] = float_to_int16(self.frame_out[ch][i]);
            }
        }

        // Slide the overlap tail down for the next frame.
        for ch in 0..self.channels {
            self.frame_out[ch].copy_within(self.frame_len..self.frame_len * 2, 0);
        }

        Ok(())
    }

    /// Decode one block; returns true when the frame is complete.
    fn decode_block(&mut self, bits: &mut BitReader) -> Result<bool> {
        self.eval_block_length(bits)?;

        let bsize = (self.frame_len_bits - self.block_len_bits) as usize;

        let ms_stereo = self.channels == 2 && bits.get_bit() != 0;

        let mut has_channel = [false; CHANNELS_MAX];
        let mut any_coded = false;
        for ch in 0..self.channels {
            has_channel[ch] = bits.get_bit() != 0;
            any_coded |= has_channel[ch];
        }

        if any_coded {
            self.decode_channels(bits, bsize, ms_stereo, &mut has_channel)?;
        }

        self.calculate_imdct(bsize, ms_stereo, &has_channel);

        self.cur_block += 1;
        self.frame_pos += self.block_len;
        Ok(self.frame_pos >= self.frame_len)
    }

    fn eval_block_length(&mut self, bits: &mut BitReader) -> Result<()> {
        if self.use_variable_block_len {
            let n = ilog2(self.block_size_count as u32 - 1) as usize + 1;

            if self.reset_block_lengths {
                self.reset_block_lengths = false;

                let prev = bits.get_bits(n) as usize;
                if prev >= self.block_size_count {
                    return Err(DecoderError::InvalidData(format!(
                        "previous block length index {prev} out of range"
                    )));
                }
                self.prev_block_len_bits = self.frame_len_bits - prev as u32;

                let cur = bits.get_bits(n) as usize;
                if cur >= self.block_size_count {
                    return Err(DecoderError::InvalidData(format!(
                        "block length index {cur} out of range"
                    )));
                }
                self.block_len_bits = self.frame_len_bits - cur as u32;
            } else {
                self.prev_block_len_bits = self.block_len_bits;
                self.block_len_bits = self.next_block_len_bits;
            }

            let next = bits.get_bits(n) as usize;
            if next >= self.block_size_count {
                return Err(DecoderError::InvalidData(format!(
                    "next block length index {next} out of range"
                )));
            }
            self.next_block_len_bits = self.frame_len_bits - next as u32;
        } else {
            self.next_block_len_bits = self.frame_len_bits;
            self.prev_block_len_bits = self.frame_len_bits;
            self.block_len_bits = self.frame_len_bits;
        }

        if (self.frame_len_bits - self.block_len_bits) as usize >= self.block_size_count {
            return Err(DecoderError::InvalidData(
                "block length not initialized to a valid size".into(),
            ));
        }

        self.block_len = 1 << self.block_len_bits;
        if self.frame_pos + self.block_len > self.frame_len {
            return Err(DecoderError::InvalidData(format!(
                "frame length overflow in block {}",
                self.cur_block
            )));
        }

        Ok(())
    }

    fn decode_channels(
        &mut self,
        bits: &mut BitReader,
        bsize: usize,
        ms_stereo: bool,
        has_channel: &mut [bool; CHANNELS_MAX],
    ) -> Result<()> {
        let total_gain = read_total_gain(bits);
        let coef_bit_count = total_gain_to_bits(total_gain);

        let coef_n = self.coefs_end[bsize] as i32 - self.coefs_start as i32;
        let mut coef_count = [coef_n; CHANNELS_MAX];

        self.decode_noise(bits, bsize, has_channel, &mut coef_count)?;
        self.decode_exponents(bits, bsize, has_channel)?;
        self.decode_spectral_coefs(bits, ms_stereo, has_channel, &coef_count, coef_bit_count)?;

        let mdct_norm = self.normalized_mdct_length();
        self.calculate_mdct_coefficients(bsize, has_channel, &coef_count, total_gain, mdct_norm);

        if ms_stereo && has_channel[1] {
            // Reconstruct left/right from mid/side before the IMDCT.
            if !has_channel[0] {
                self.coefs[0][..self.block_len].fill(0.0);
                has_channel[0] = true;
            }
            let (c0, c1) = self.coefs.split_at_mut(1);
            butterfly_floats(
                &mut c0[0][..self.block_len],
                &mut c1[0][..self.block_len],
            );
        }

        Ok(())
    }

    /// High-band noise flags and gain values.
    fn decode_noise(
        &mut self,
        bits: &mut BitReader,
        bsize: usize,
        has_channel: &[bool; CHANNELS_MAX],
        coef_count: &mut [i32; CHANNELS_MAX],
    ) -> Result<()> {
        if !self.use_noise_coding {
            return Ok(());
        }

        let channels = self.channels;
        let Self {
            exponent_high_bands,
            high_band_coded,
            high_band_values,
            hgain_huffman,
            ..
        } = self;
        let bands = &exponent_high_bands[bsize];

        for ch in 0..channels {
            if !has_channel[ch] {
                continue;
            }
            for (j, &width) in bands.iter().enumerate() {
                let coded = bits.get_bit() != 0;
                high_band_coded[ch][j] = coded;

                // Noise-substituted bands transmit no coefficients.
                if coded {
                    coef_count[ch] -= width as i32;
                }
            }
        }

        for ch in 0..channels {
            if !has_channel[ch] {
                continue;
            }
            let mut val: Option<i32> = None;
            for j in 0..bands.len() {
                if !high_band_coded[ch][j] {
                    continue;
                }
                let next = match val {
                    None => bits.get_bits(7) as i32 - 19,
                    Some(prev) => {
                        let Some(huffman) = hgain_huffman.as_ref() else {
                            return Err(DecoderError::InvalidData(
                                "high-band gain code missing".into(),
                            ));
                        };
                        prev + huffman.get_symbol(bits)? as i32 - 18
                    }
                };
                high_band_values[ch][j] = next;
                val = Some(next);
            }
        }

        Ok(())
    }

    fn decode_exponents(
        &mut self,
        bits: &mut BitReader,
        bsize: usize,
        has_channel: &[bool; CHANNELS_MAX],
    ) -> Result<()> {
        // Short blocks may reuse the previous exponents.
        if !(self.block_len_bits == self.frame_len_bits || bits.get_bit() != 0) {
            return Ok(());
        }

        for ch in 0..self.channels {
            if !has_channel[ch] {
                continue;
            }
            if self.use_exp_huffman {
                self.decode_exp_huffman(bits, ch)?;
            } else {
                self.decode_exp_lsp(bits, ch)?;
            }
            self.exponents_bsize[ch] = bsize;
        }

        Ok(())
    }

    fn decode_exp_huffman(&mut self, bits: &mut BitReader, ch: usize) -> Result<()> {
        let bsize = (self.frame_len_bits - self.block_len_bits) as usize;
        let block_len = self.block_len;
        let version = self.version;

        let Self {
            exp_huffman,
            exponent_bands,
            exponents,
            max_exponent,
            ..
        } = self;
        let Some(huffman) = exp_huffman.as_ref() else {
            return Err(DecoderError::InvalidData(
                "exponent scale-factor code missing".into(),
            ));
        };

        let exps = &mut exponents[ch];
        let mut band_iter = exponent_bands[bsize].iter();
        let mut max_scale = 0.0f32;
        let mut q = 0usize;

        let mut last_exp: i32;
        if version == 1 {
            last_exp = bits.get_bits(5) as i32 + 10;
            let v = data::POW_TAB[(last_exp + 60) as usize];
            max_scale = v;

            let n = band_iter.next().copied().unwrap_or(0) as usize;
            let end = (q + n).min(exps.len());
            exps[q..end].fill(v);
            q = end;
        } else {
            last_exp = 36;
        }

        while q < block_len {
            let Some(&band) = band_iter.next() else {
                return Err(DecoderError::InvalidData(
                    "exponent band layout exhausted".into(),
                ));
            };

            // Same differential offset as the MPEG-4 AAC scale factors.
            last_exp += huffman.get_symbol(bits)? as i32 - 60;
            let idx = last_exp + 60;
            if idx < 0 || idx as usize >= data::POW_TAB.len() {
                return Err(DecoderError::InvalidData(format!(
                    "exponent out of range: {last_exp}"
                )));
            }

            let v = data::POW_TAB[idx as usize];
            if v > max_scale {
                max_scale = v;
            }

            let end = (q + band as usize).min(exps.len());
            exps[q..end].fill(v);
            q = end;
        }

        max_exponent[ch] = max_scale;
        Ok(())
    }

    /// Exponents coded as line spectral pairs (same idea as Vorbis floors).
    fn decode_exp_lsp(&mut self, bits: &mut BitReader, ch: usize) -> Result<()> {
        let mut lsp = [0.0f32; LSP_COEF_COUNT];
        for (i, coef) in lsp.iter_mut().enumerate() {
            let val = if i == 0 || i >= 8 {
                bits.get_bits(3)
            } else {
                bits.get_bits(4)
            };
            *coef = data::LSP_CODEBOOK[i][val as usize];
        }

        let block_len = self.block_len;
        let Self {
            lsp_cos_table,
            lsp_pow_e_table,
            lsp_pow_m_table1,
            lsp_pow_m_table2,
            exponents,
            max_exponent,
            ..
        } = self;

        max_exponent[ch] = lsp_to_curve(
            &mut exponents[ch][..block_len],
            lsp_cos_table,
            lsp_pow_e_table,
            lsp_pow_m_table1,
            lsp_pow_m_table2,
            &lsp,
        );
        Ok(())
    }

    fn decode_spectral_coefs(
        &mut self,
        bits: &mut BitReader,
        ms_stereo: bool,
        has_channel: &[bool; CHANNELS_MAX],
        coef_count: &[i32; CHANNELS_MAX],
        coef_bit_count: u32,
    ) -> Result<()> {
        let block_len = self.block_len;
        let frame_len_bits = self.frame_len_bits;
        let version = self.version;

        for ch in 0..self.channels {
            if has_channel[ch] {
                // The mid/side channel carries less energy and gets its own
                // codebook.
                let tindex = usize::from(ch == 1 && ms_stereo);

                let Self {
                    coef_huffman,
                    coef_run_table,
                    coef_level_table,
                    coefs1,
                    ..
                } = self;

                let ptr = &mut coefs1[ch][..block_len];
                ptr.fill(0.0);

                decode_run_level(
                    bits,
                    &coef_huffman[tindex],
                    &coef_level_table[tindex],
                    &coef_run_table[tindex],
                    version,
                    ptr,
                    0,
                    coef_count[ch],
                    block_len,
                    frame_len_bits,
                    coef_bit_count,
                )?;
            }

            if self.version == 1 && self.channels >= 2 {
                bits.skip(-((bits.pos() & 7) as isize));
            }
        }

        Ok(())
    }

    fn normalized_mdct_length(&self) -> f32 {
        let n4 = self.block_len / 2;
        let mut mdct_norm = 1.0 / n4 as f32;
        if self.version == 1 {
            mdct_norm *= (n4 as f32).sqrt();
        }
        mdct_norm
    }

    /// Turn decoded levels, exponents and noise into scaled MDCT inputs.
    fn calculate_mdct_coefficients(
        &mut self,
        bsize: usize,
        has_channel: &[bool; CHANNELS_MAX],
        coef_count: &[i32; CHANNELS_MAX],
        total_gain: i32,
        mdct_norm: f32,
    ) {
        let block_len = self.block_len;
        let coefs_start = self.coefs_start;
        let coefs_end = self.coefs_end[bsize];
        let high_band_start = self.high_band_start[bsize];
        let use_noise_coding = self.use_noise_coding;
        let noise_mult = self.noise_mult;

        for ch in 0..self.channels {
            if !has_channel[ch] {
                continue;
            }

            let esize = self.exponents_bsize[ch];
            let max_exp = self.max_exponent[ch];
            let mult = 10.0f32.powf(total_gain as f32 * 0.05) / max_exp * mdct_norm;

            let Self {
                exponents,
                coefs1,
                coefs,
                noise_table,
                noise_index,
                exponent_high_bands,
                high_band_coded,
                high_band_values,
                ..
            } = self;

            let exps = &exponents[ch][..];
            let coefs1_ch = &coefs1[ch][..];
            let coefs_ch = &mut coefs[ch];
            let mut cpos = 0usize;

            let mut next_noise = || {
                let v = noise_table[*noise_index];
                *noise_index = (*noise_index + 1) & (NOISE_TAB_SIZE - 1);
                v
            };

            if use_noise_coding {
                // Very low frequencies are pure shaped noise.
                for j in 0..coefs_start {
                    let noise = next_noise();
                    coefs_ch[cpos] = noise * exps[(j << bsize) >> esize] * mult;
                    cpos += 1;
                }

                let bands = &exponent_high_bands[bsize];

                // Mean power of each coded high band.
                let mut exp_power = [1.0f32; HIGH_BAND_SIZE_MAX];
                let mut eptr = (high_band_start << bsize) >> esize;
                let mut last_high_band = 0usize;
                for (k, &n) in bands.iter().enumerate() {
                    if high_band_coded[ch][k] {
                        let mut e2 = 0.0f32;
                        for j in 0..n {
                            let v = exps[eptr + ((j << bsize) >> esize)];
                            e2 += v * v;
                        }
                        exp_power[k] = e2 / n as f32;
                        last_high_band = k;
                    }
                    eptr += (n << bsize) >> esize;
                }

                // Main body: coded coefficients plus dither, or power-matched
                // noise where a high band was substituted.
                let mut eptr = (coefs_start << bsize) >> esize;
                let mut c1pos = 0usize;
                for band in 0..=bands.len() {
                    let (n, coded) = if band == 0 {
                        (high_band_start.saturating_sub(coefs_start), false)
                    } else {
                        (bands[band - 1], high_band_coded[ch][band - 1])
                    };

                    if coded {
                        let k = band - 1;
                        let mut mult1 = (exp_power[k] / exp_power[last_high_band]).sqrt();
                        mult1 *= 10.0f32.powf(high_band_values[ch][k] as f32 * 0.05);
                        mult1 /= max_exp * noise_mult;
                        mult1 *= mdct_norm;

                        for j in 0..n {
                            let noise = next_noise();
                            coefs_ch[cpos] = noise * exps[eptr + ((j << bsize) >> esize)] * mult1;
                            cpos += 1;
                        }
                    } else {
                        for j in 0..n {
                            let noise = next_noise();
                            coefs_ch[cpos] =
                                (coefs1_ch[c1pos] + noise) * exps[eptr + ((j << bsize) >> esize)] * mult;
                            c1pos += 1;
                            cpos += 1;
                        }
                    }
                    eptr += (n << bsize) >> esize;
                }

                // Very high frequencies: noise scaled by the last in-range
                // exponent.
                let n = block_len - coefs_end;
                let idx = eptr as i32 + ((-(1i32 << bsize)) >> esize);
                let mult1 = mult * exps[idx.max(0) as usize];
                for _ in 0..n {
                    let noise = next_noise();
                    coefs_ch[cpos] = noise * mult1;
                    cpos += 1;
                }
            } else {
                for _ in 0..coefs_start {
                    coefs_ch[cpos] = 0.0;
                    cpos += 1;
                }
                for j in 0..coef_count[ch] as usize {
                    coefs_ch[cpos] = coefs1_ch[j] * exps[(j << bsize) >> esize] * mult;
                    cpos += 1;
                }
                for _ in 0..block_len - coefs_end {
                    coefs_ch[cpos] = 0.0;
                    cpos += 1;
                }
            }
        }
    }

    /// Inverse MDCT plus windowed overlap-add into the frame buffer.
    fn calculate_imdct(&mut self, bsize: usize, ms_stereo: bool, has_channel: &[bool; CHANNELS_MAX]) {
        let block_len = self.block_len;
        let index = self.frame_len / 2 + self.frame_pos - block_len / 2;

        for ch in 0..self.channels {
            {
                let Self {
                    mdct,
                    coefs,
                    output,
                    ..
                } = self;

                if has_channel[ch] {
                    mdct[bsize].imdct(&mut output[..block_len * 2], &coefs[ch][..block_len]);
                } else if !(ms_stereo && ch == 1) {
                    // For mid/side with an uncoded side channel the previous
                    // channel's output is reused as-is.
                    output[..block_len * 2].fill(0.0);
                }
            }

            let Self {
                output,
                mdct_window,
                frame_out,
                frame_len_bits,
                block_len_bits,
                prev_block_len_bits,
                next_block_len_bits,
                ..
            } = self;

            overlap_window(
                &mut frame_out[ch][index..index + block_len * 2],
                &output[..block_len * 2],
                mdct_window,
                *frame_len_bits,
                *block_len_bits,
                *prev_block_len_bits,
                *next_block_len_bits,
            );
        }
    }
}

// ---- stateless helpers ------------------------------------------------------

fn ilog2(x: u32) -> u32 {
    31 - x.leading_zeros()
}

fn float_to_int16(v: f32) -> i16 {
    v.round().clamp(-32768.0, 32767.0) as i16
}

fn butterfly_floats(v1: &mut [f32], v2: &mut [f32]) {
    for (a, b) in v1.iter_mut().zip(v2) {
        let t = *a - *b;
        *a += *b;
        *b = t;
    }
}

/// The feature flag word lives at different extra-data offsets per version.
fn stream_flags(version: i32, extra_data: &[u8]) -> u16 {
    if version == 1 && extra_data.len() >= 4 {
        u16::from_le_bytes([extra_data[2], extra_data[3]])
    } else if version == 2 && extra_data.len() >= 6 {
        u16::from_le_bytes([extra_data[4], extra_data[5]])
    } else {
        0
    }
}

/// log2 of the number of output samples per frame.
fn frame_bit_length(version: i32, sample_rate: u32) -> u32 {
    if sample_rate <= 16000 {
        9
    } else if sample_rate <= 22050 || (sample_rate <= 32000 && version == 1) {
        10
    } else if sample_rate <= 48000 {
        11
    } else if sample_rate <= 96000 {
        12
    } else {
        13
    }
}

/// Decide whether perceptual noise substitution is used, and where the high
/// frequency band starts. Returns `(use_noise, high_freq, stereo-adjusted
/// bits-per-sample)`.
fn noise_decision(version: i32, sample_rate: u32, channels: usize, bps: f32) -> (bool, f32, f32) {
    let mut high_freq = sample_rate as f32 * 0.5;

    // v2 snaps the rate down to the nearest of its well-known rates.
    let rate_normalized = if version != 2 {
        sample_rate
    } else if sample_rate >= 44100 {
        44100
    } else if sample_rate >= 22050 {
        22050
    } else if sample_rate >= 16000 {
        16000
    } else if sample_rate >= 11025 {
        11025
    } else if sample_rate >= 8000 {
        8000
    } else {
        sample_rate
    };

    let bps_orig = bps;
    let bps = if channels == 2 { bps_orig * 1.6 } else { bps };

    let use_noise = if rate_normalized == 44100 {
        if bps >= 0.61 {
            false
        } else {
            high_freq *= 0.4;
            true
        }
    } else if rate_normalized == 22050 {
        if bps >= 1.16 {
            false
        } else {
            high_freq *= if bps >= 0.72 { 0.7 } else { 0.6 };
            true
        }
    } else if rate_normalized == 16000 {
        high_freq *= if bps_orig > 0.5 { 0.5 } else { 0.3 };
        true
    } else if rate_normalized == 11025 {
        high_freq *= 0.7;
        true
    } else if rate_normalized == 8000 {
        if bps_orig > 0.75 {
            false
        } else {
            high_freq *= if bps_orig <= 0.625 { 0.5 } else { 0.65 };
            true
        }
    } else {
        high_freq *= if bps_orig >= 0.8 {
            0.75
        } else if bps_orig >= 0.6 {
            0.6
        } else {
            0.5
        };
        true
    };

    (use_noise, high_freq, bps)
}

/// The per-block-size band layout derived at construction time.
struct BandLayout {
    coefs_start: usize,
    coefs_end: Vec<usize>,
    exponent_bands: Vec<Vec<u16>>,
    high_band_start: Vec<usize>,
    exponent_high_bands: Vec<Vec<usize>>,
}

impl BandLayout {
    fn compute(
        version: i32,
        sample_rate: u32,
        frame_len_bits: u32,
        block_size_count: usize,
        high_freq: f32,
    ) -> Self {
        let frame_len = 1usize << frame_len_bits;
        let coefs_start = if version == 1 { 3 } else { 0 };

        let mut exponent_bands = vec![Vec::new(); block_size_count];
        let mut coefs_end = vec![0; block_size_count];
        let mut high_band_start = vec![0; block_size_count];
        let mut exponent_high_bands = vec![Vec::new(); block_size_count];

        for k in 0..block_size_count {
            let block_len = frame_len >> k;

            if version == 1 {
                // Psycho-acoustic critical band partition.
                let mut row = Vec::new();
                let mut lpos = 0usize;
                for &freq in data::CRITICAL_FREQS.iter() {
                    let a = freq as usize;
                    let b = sample_rate as usize;
                    let pos = (((block_len * 2 * a) + (b >> 1)) / b).min(block_len);

                    row.push((pos - lpos) as u16);
                    if pos >= block_len {
                        break;
                    }
                    lpos = pos;
                }
                exponent_bands[0] = row;
            } else {
                let t = frame_len_bits - BLOCK_BITS_MIN - k as u32;
                let table = if t < 3 {
                    if sample_rate >= 44100 {
                        Some(&data::EXPONENT_BAND_44100[t as usize])
                    } else if sample_rate >= 32000 {
                        Some(&data::EXPONENT_BAND_32000[t as usize])
                    } else if sample_rate >= 22050 {
                        Some(&data::EXPONENT_BAND_22050[t as usize])
                    } else {
                        None
                    }
                } else {
                    None
                };

                if let Some(row) = table {
                    let n = row[0] as usize;
                    exponent_bands[k] = row[1..=n].iter().map(|&v| v as u16).collect();
                } else {
                    // Critical band partition, rounded to multiples of four.
                    let mut row = Vec::new();
                    let mut lpos = 0usize;
                    for &freq in data::CRITICAL_FREQS.iter() {
                        let a = freq as usize;
                        let b = sample_rate as usize;
                        let mut pos = ((block_len * 2 * a) + (b << 1)) / (4 * b);
                        pos <<= 2;
                        let pos = pos.min(block_len);

                        if pos > lpos {
                            row.push((pos - lpos) as u16);
                        }
                        if pos >= block_len {
                            break;
                        }
                        lpos = pos;
                    }
                    exponent_bands[k] = row;
                }
            }

            coefs_end[k] = (frame_len - ((frame_len * 9) / 100)) >> k;
            high_band_start[k] =
                ((block_len as f32 * 2.0 * high_freq) / sample_rate as f32 + 0.5) as usize;

            // Intersect each exponent band with the high-frequency range.
            let mut pos = 0usize;
            let mut high = Vec::new();
            for &band in &exponent_bands[k] {
                let start = pos.max(high_band_start[k]);
                pos += band as usize;
                let end = pos.min(coefs_end[k]);
                if end > start && high.len() < HIGH_BAND_SIZE_MAX {
                    high.push(end - start);
                }
            }
            exponent_high_bands[k] = high;
        }

        Self {
            coefs_start,
            coefs_end,
            exponent_bands,
            high_band_start,
            exponent_high_bands,
        }
    }
}

fn build_noise_table(noise_mult: f32) -> Vec<f32> {
    let norm = (1.0 / (1u64 << 31) as f32) * 3.0f32.sqrt() * noise_mult;
    let mut seed: u32 = 1;
    (0..NOISE_TAB_SIZE)
        .map(|_| {
            seed = seed.wrapping_mul(314159).wrapping_add(1);
            seed as i32 as f32 * norm
        })
        .collect()
}

type CoefTables = ([Huffman; 2], [Vec<u16>; 2], [Vec<f32>; 2]);

/// Pick the codebook pair for this rate/bit-rate combination and expand the
/// run-level side tables.
fn build_coef_huffman(sample_rate: u32, bps: f32) -> Result<CoefTables> {
    let mut table = 2;
    if sample_rate >= 32000 {
        if bps < 0.72 {
            table = 0;
        } else if bps < 1.16 {
            table = 1;
        }
    }

    let build = |idx: usize| -> Result<(Huffman, Vec<u16>, Vec<f32>)> {
        let book = &data::COEF_CODEBOOKS[table * 2 + idx];
        let huffman = Huffman::new(book.huff_codes, book.huff_bits)?;

        let n = book.huff_codes.len();
        let mut run_table = vec![0u16; n];
        let mut level_table = vec![0f32; n];

        let mut i = 2usize;
        let mut level = 1u16;
        for &count in book.levels {
            for j in 0..count {
                run_table[i] = j;
                level_table[i] = level as f32;
                i += 1;
            }
            level += 1;
        }

        Ok((huffman, run_table, level_table))
    };

    let (h0, r0, l0) = build(0)?;
    let (h1, r1, l1) = build(1)?;
    Ok(([h0, h1], [r0, r1], [l0, l1]))
}

fn read_total_gain(bits: &mut BitReader) -> i32 {
    let mut total_gain = 1;
    loop {
        let v = bits.get_bits(7) as i32;
        total_gain += v;
        if v != 127 {
            return total_gain;
        }
    }
}

fn total_gain_to_bits(total_gain: i32) -> u32 {
    if total_gain < 15 {
        13
    } else if total_gain < 32 {
        12
    } else if total_gain < 40 {
        11
    } else if total_gain < 45 {
        10
    } else {
        9
    }
}

/// Variable-width escape value: 8, 16, 24 or 31 bits, each extension gated
/// by a continuation bit.
fn get_large_val(bits: &mut BitReader) -> u32 {
    let mut count = 8;
    if bits.get_bit() != 0 {
        count += 8;
        if bits.get_bit() != 0 {
            count += 8;
            if bits.get_bit() != 0 {
                count += 7;
            }
        }
    }
    bits.get_bits(count)
}

/// Run-level RLE of the spectral coefficients.
#[allow(clippy::too_many_arguments)]
fn decode_run_level(
    bits: &mut BitReader,
    huffman: &Huffman,
    level_table: &[f32],
    run_table: &[u16],
    version: i32,
    ptr: &mut [f32],
    mut offset: i32,
    num_coefs: i32,
    block_len: usize,
    frame_len_bits: u32,
    coef_bit_count: u32,
) -> Result<()> {
    let coef_mask = block_len as i32 - 1;

    while offset < num_coefs {
        let code = huffman.get_symbol(bits)? as i32;

        if code > 1 {
            let sign = if bits.get_bit() != 0 { 1.0 } else { -1.0 };
            offset += run_table[code as usize] as i32;
            ptr[(offset & coef_mask) as usize] = level_table[code as usize] * sign;
        } else if code == 1 {
            // End of block.
            break;
        } else {
            // Escape-coded coefficient.
            let level = if version == 1 {
                let level = bits.get_bits(coef_bit_count as usize) as i32;
                offset += bits.get_bits(frame_len_bits as usize) as i32;
                level
            } else {
                let level = get_large_val(bits) as i32;
                if bits.get_bit() != 0 {
                    if bits.get_bit() != 0 {
                        if bits.get_bit() != 0 {
                            return Err(DecoderError::InvalidData(
                                "broken escape sequence".into(),
                            ));
                        }
                        offset += bits.get_bits(frame_len_bits as usize) as i32 + 4;
                    } else {
                        offset += bits.get_bits(2) as i32 + 1;
                    }
                }
                level
            };

            let sign = bits.get_bit() as i32 - 1;
            ptr[(offset & coef_mask) as usize] = ((level ^ sign) - sign) as f32;
        }

        offset += 1;
    }

    // The end-of-block code may be omitted on the last run.
    if offset > num_coefs {
        warn!("overflow in spectral run-level data, ignoring");
    }

    Ok(())
}

fn pow_m1_4(x: f32, e_table: &[f32], m_table1: &[f32], m_table2: &[f32]) -> f32 {
    let u = x.to_bits();
    let e = (u >> 23) as usize;
    let m = ((u >> (23 - LSP_POW_BITS)) & ((1 << LSP_POW_BITS) - 1)) as usize;

    // Interpolation scale in [1, 2).
    let t = f32::from_bits(((u << LSP_POW_BITS) & ((1 << 23) - 1)) | (127 << 23));

    e_table[e] * (m_table1[m] + m_table2[m] * t)
}

/// Evaluate the spectral envelope of a set of line spectral pairs.
fn lsp_to_curve(
    out: &mut [f32],
    cos_table: &[f32],
    e_table: &[f32],
    m_table1: &[f32],
    m_table2: &[f32],
    lsp: &[f32; LSP_COEF_COUNT],
) -> f32 {
    let mut val_max = 0.0f32;

    for (i, o) in out.iter_mut().enumerate() {
        let mut p = 0.5f32;
        let mut q = 0.5f32;
        let w = cos_table[i];

        let mut j = 1;
        while j < LSP_COEF_COUNT {
            q *= w - lsp[j - 1];
            p *= w - lsp[j];
            j += 2;
        }

        p *= p * (2.0 - w);
        q *= q * (2.0 + w);

        let v = pow_m1_4(p + q, e_table, m_table1, m_table2);
        if v > val_max {
            val_max = v;
        }
        *o = v;
    }

    val_max
}

/// Apply the MDCT window and add into the frame buffer.
///
/// When the windows overlap, their squared sum is always one (the MDCT
/// reconstruction rule). Where the block is longer than its neighbor, the
/// surplus region passes through flat.
fn overlap_window(
    out: &mut [f32],
    input: &[f32],
    windows: &[Vec<f32>],
    frame_len_bits: u32,
    block_len_bits: u32,
    prev_block_len_bits: u32,
    next_block_len_bits: u32,
) {
    let block_len = 1usize << block_len_bits;

    // Left (overlap with the previous block).
    if block_len_bits <= prev_block_len_bits {
        let win = &windows[(frame_len_bits - block_len_bits) as usize];
        for i in 0..block_len {
            out[i] = input[i] * win[i] + out[i];
        }
    } else {
        let prev_len = 1usize << prev_block_len_bits;
        let n = (block_len - prev_len) / 2;
        let win = &windows[(frame_len_bits - prev_block_len_bits) as usize];

        for i in 0..prev_len {
            out[n + i] = input[n + i] * win[i] + out[n + i];
        }
        out[n + prev_len..n + prev_len + n].copy_from_slice(&input[n + prev_len..n + prev_len + n]);
    }

    // Right (tail overlapping the next block).
    let out = &mut out[block_len..];
    let input = &input[block_len..];

    if block_len_bits <= next_block_len_bits {
        let win = &windows[(frame_len_bits - block_len_bits) as usize];
        for i in 0..block_len {
            out[i] = input[i] * win[block_len - 1 - i];
        }
    } else {
        let next_len = 1usize << next_block_len_bits;
        let n = (block_len - next_len) / 2;
        let win = &windows[(frame_len_bits - next_block_len_bits) as usize];

        out[..n].copy_from_slice(&input[..n]);
        for i in 0..next_len {
            out[n + i] = input[n + i] * win[next_len - 1 - i];
        }
        out[n + next_len..n + next_len + n].fill(0.0);
    }
}

// ---- stream interface -------------------------------------------------------

impl AudioStream for WmaStream {
    fn channels(&self) -> usize {
        self.channels
    }

    fn rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_buffer(&mut self, buffer: &mut [i16]) -> usize {
        self.queue.read_buffer(buffer)
    }

    fn end_of_data(&self) -> bool {
        self.queue.end_of_data()
    }

    fn end_of_stream(&self) -> bool {
        self.queue.end_of_stream()
    }
}

impl PacketizedAudioStream for WmaStream {
    fn queue_packet(&mut self, data: &[u8]) {
        match self.decode_superframe(data) {
            Ok(pcm) => self.queue.queue_buffer(pcm),
            Err(e) => {
                // A bad packet is dropped whole; the reservoir overhang is
                // no longer trustworthy either.
                warn!("dropping WMA packet: {e}");
                self.reset_block_lengths = true;
                self.last_superframe_len = 0;
                self.last_bitoffset = 0;
            }
        }
    }

    fn finish(&mut self) {
        self.queue.finish();
    }

    fn is_finished(&self) -> bool {
        self.queue.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Concatenate `(value, bit count)` chunks MSB-first into bytes.
    fn pack_bits(chunks: &[(u32, usize)]) -> Vec<u8> {
        let mut bits = Vec::new();
        for &(v, len) in chunks {
            for i in (0..len).rev() {
                bits.push((v >> i) & 1 != 0);
            }
        }
        let mut out = vec![0u8; bits.len().div_ceil(8)];
        for (i, b) in bits.iter().enumerate() {
            if *b {
                out[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        out
    }

    fn v2_stereo_128k() -> WmaStream {
        WmaStream::new(2, 44100, 2, 128000, 2973, &[0, 0, 0, 0, 0x03, 0]).unwrap()
    }

    #[test]
    fn construction_validates_parameters() {
        assert!(WmaStream::new(3, 44100, 2, 128000, 0, &[]).is_err());
        assert!(WmaStream::new(0, 44100, 2, 128000, 0, &[]).is_err());
        assert!(WmaStream::new(2, 0, 2, 128000, 0, &[]).is_err());
        assert!(WmaStream::new(2, 50001, 2, 128000, 0, &[]).is_err());
        assert!(WmaStream::new(2, 44100, 0, 128000, 0, &[]).is_err());
        assert!(WmaStream::new(2, 44100, 3, 128000, 0, &[]).is_err());

        assert!(WmaStream::new(2, 44100, 2, 128000, 2973, &[0, 0, 0, 0, 3, 0]).is_ok());
        assert!(WmaStream::new(1, 8000, 1, 6000, 0, &[]).is_ok());
    }

    #[test]
    fn frame_length_follows_sample_rate() {
        for (version, rate, frame_len) in [
            (2, 8000, 512),
            (2, 16000, 512),
            (2, 22050, 1024),
            (1, 32000, 1024),
            (2, 32000, 2048),
            (2, 44100, 2048),
            (2, 48000, 2048),
            (2, 50000, 4096),
        ] {
            let s = WmaStream::new(version, rate, 1, 64000, 0, &[]).unwrap();
            assert_eq!(s.frame_len(), frame_len, "{version}/{rate}");
        }
    }

    #[test]
    fn flag_word_location_depends_on_version() {
        // v1 reads the word at offset 2, v2 at offset 4.
        let v1 = WmaStream::new(1, 32000, 1, 32000, 0, &[0, 0, 0x01, 0x00]).unwrap();
        assert!(v1.use_exp_huffman && !v1.use_bit_reservoir);

        let v2 = WmaStream::new(2, 44100, 2, 128000, 0, &[0, 0, 0, 0, 0x03, 0]).unwrap();
        assert!(v2.use_exp_huffman && v2.use_bit_reservoir && !v2.use_variable_block_len);

        // Too-short extra data means no flags at all.
        let bare = WmaStream::new(2, 44100, 2, 128000, 0, &[0, 0]).unwrap();
        assert!(!bare.use_exp_huffman && !bare.use_bit_reservoir);
    }

    #[test]
    fn variable_block_lengths_and_the_000d_quirk() {
        // Flags 0x0007 plus a per-channel rate over 32 kbit raise the count
        // by two: B = min(1 + 2, 4) + 1.
        let s = WmaStream::new(2, 44100, 2, 128000, 0, &[0, 0, 0, 0, 0x07, 0]).unwrap();
        assert!(s.use_variable_block_len);
        assert_eq!(s.block_size_count, 4);

        // The 0x000D extra-data signature forces fixed blocks.
        let s = WmaStream::new(2, 44100, 2, 128000, 0, &[0, 0, 0, 0, 0x0d, 0, 0, 0]).unwrap();
        assert!(!s.use_variable_block_len);
        assert_eq!(s.block_size_count, 1);
    }

    #[test]
    fn noise_decision_matrix() {
        // 44100: plenty of bits, no noise; starved, noise with a 0.4 cutoff.
        let (on, _, _) = noise_decision(2, 44100, 2, 128000.0 / 88200.0);
        assert!(!on);
        let (on, hf, _) = noise_decision(2, 44100, 2, 32000.0 / 88200.0);
        assert!(on);
        assert!((hf - 8820.0).abs() < 1.0);

        // 22050 thresholds on the stereo-adjusted value.
        let (on, _, _) = noise_decision(2, 22050, 1, 1.2);
        assert!(!on);
        let (on, hf, _) = noise_decision(2, 22050, 1, 0.8);
        assert!(on && (hf - 11025.0 * 0.7).abs() < 1.0);
        let (on, hf, _) = noise_decision(2, 22050, 1, 0.5);
        assert!(on && (hf - 11025.0 * 0.6).abs() < 1.0);

        // 16000 and 11025 always use noise.
        let (on, hf, _) = noise_decision(2, 16000, 1, 0.6);
        assert!(on && (hf - 4000.0).abs() < 1.0);
        let (on, hf, _) = noise_decision(2, 16000, 1, 0.4);
        assert!(on && (hf - 2400.0).abs() < 1.0);
        let (on, hf, _) = noise_decision(1, 11025, 1, 0.9);
        assert!(on && (hf - 11025.0 * 0.5 * 0.7).abs() < 1.0);

        // 8000 splits three ways on the unadjusted value.
        let (on, _, _) = noise_decision(1, 8000, 1, 0.78);
        assert!(!on);
        let (on, hf, _) = noise_decision(1, 8000, 1, 0.625);
        assert!(on && (hf - 2000.0).abs() < 1.0);
        let (on, hf, _) = noise_decision(1, 8000, 1, 0.75);
        assert!(on && (hf - 2600.0).abs() < 1.0);

        // Rates with no profile of their own (only reachable in v1).
        let (on, hf, _) = noise_decision(1, 12000, 1, 0.85);
        assert!(on && (hf - 6000.0 * 0.75).abs() < 1.0);
        let (on, hf, _) = noise_decision(1, 12000, 1, 0.7);
        assert!(on && (hf - 6000.0 * 0.6).abs() < 1.0);
        let (on, hf, _) = noise_decision(1, 12000, 1, 0.5);
        assert!(on && (hf - 6000.0 * 0.5).abs() < 1.0);

        // v2 normalizes odd rates down before the lookup.
        let (on, hf, _) = noise_decision(2, 12000, 1, 0.5);
        assert!(on && (hf - 6000.0 * 0.7).abs() < 1.0);

        // Stereo adjustment is applied inside.
        let (_, _, adj) = noise_decision(2, 44100, 2, 1.0);
        assert!((adj - 1.6).abs() < 1e-6);
    }

    #[test]
    fn exponent_bands_cover_each_block_size_exactly() {
        // v2 with variable blocks: hard-coded rows and the computed
        // partition must both sum to their block length.
        let s = WmaStream::new(2, 44100, 2, 128000, 0, &[0, 0, 0, 0, 0x07, 0]).unwrap();
        for k in 0..s.block_size_count {
            let sum: usize = s.exponent_bands[k].iter().map(|&v| v as usize).sum();
            assert_eq!(sum, s.frame_len() >> k, "44100 block size {k}");
        }

        let s = WmaStream::new(2, 22050, 2, 64000, 0, &[0, 0, 0, 0, 0x07, 0]).unwrap();
        for k in 0..s.block_size_count {
            let sum: usize = s.exponent_bands[k].iter().map(|&v| v as usize).sum();
            assert_eq!(sum, s.frame_len() >> k, "22050 block size {k}");
        }

        // v1 uses the critical-band partition for its single block size.
        let s = WmaStream::new(1, 8000, 1, 6000, 0, &[]).unwrap();
        let sum: usize = s.exponent_bands[0].iter().map(|&v| v as usize).sum();
        assert_eq!(sum, s.frame_len());
    }

    #[test]
    fn high_bands_sit_between_cutoff_and_coefs_end() {
        let s = WmaStream::new(2, 44100, 2, 32000, 0, &[0, 0, 0, 0, 1, 0]).unwrap();
        assert!(s.use_noise_coding);
        for k in 0..s.block_size_count {
            let total: usize = s.exponent_high_bands[k].iter().sum();
            assert!(total <= s.coefs_end[k].saturating_sub(s.high_band_start[k]));
        }
    }

    #[test]
    fn noise_table_shape() {
        let s = WmaStream::new(2, 44100, 1, 20000, 0, &[0, 0, 0, 0, 1, 0]).unwrap();
        assert!(s.use_noise_coding);
        assert_eq!(s.noise_table.len(), NOISE_TAB_SIZE);

        let norm = (1.0 / (1u64 << 31) as f32) * 3.0f32.sqrt() * 0.02;
        assert!((s.noise_table[0] - 314160.0 * norm).abs() < 1e-9);

        let mean: f32 = s.noise_table.iter().sum::<f32>() / NOISE_TAB_SIZE as f32;
        assert!(mean.abs() < 1e-3);
        assert!(s.noise_table.iter().all(|v| v.abs() <= 0.04));
    }

    #[test]
    fn pow_tab_is_a_tenth_decade_ladder() {
        assert_eq!(data::POW_TAB.len(), 156);
        assert!((data::POW_TAB[60] - 1.0).abs() < 1e-6);
        for i in 0..data::POW_TAB.len() - 16 {
            let ratio = data::POW_TAB[i + 16] / data::POW_TAB[i];
            assert!((ratio - 10.0).abs() < 1e-3);
        }
    }

    #[test]
    fn run_level_tables_expand_the_level_runs() {
        let s = v2_stereo_128k();
        for t in 0..2 {
            let n = s.coef_run_table[t].len();
            assert_eq!(n, s.coef_level_table[t].len());
            // Symbols 0/1 are escape and end-of-block.
            assert_eq!(s.coef_level_table[t][0], 0.0);
            assert_eq!(s.coef_level_table[t][1], 0.0);
            assert_eq!(s.coef_run_table[t][2], 0);
            assert_eq!(s.coef_level_table[t][2], 1.0);
            // Levels never decrease along the symbol axis.
            for w in s.coef_level_table[t][2..].windows(2) {
                assert!(w[1] >= w[0]);
            }
        }
    }

    #[test]
    fn total_gain_ladder() {
        for (gain, bits) in [(1, 13), (14, 13), (15, 12), (31, 12), (32, 11), (39, 11), (40, 10), (44, 10), (45, 9), (200, 9)] {
            assert_eq!(total_gain_to_bits(gain), bits);
        }

        let data = pack_bits(&[(127, 7), (5, 7)]);
        let mut bits = BitReader::new(&data);
        assert_eq!(read_total_gain(&mut bits), 1 + 127 + 5);
    }

    #[test]
    fn large_val_field_widths() {
        let data = pack_bits(&[(0, 1), (0xab, 8)]);
        assert_eq!(get_large_val(&mut BitReader::new(&data)), 0xab);

        let data = pack_bits(&[(1, 1), (0, 1), (0xbeef, 16)]);
        assert_eq!(get_large_val(&mut BitReader::new(&data)), 0xbeef);

        let data = pack_bits(&[(1, 1), (1, 1), (0, 1), (0xc0ffe, 24)]);
        assert_eq!(get_large_val(&mut BitReader::new(&data)), 0xc0ffe);

        let data = pack_bits(&[(1, 1), (1, 1), (1, 1), (0x7eadbeef, 31)]);
        assert_eq!(get_large_val(&mut BitReader::new(&data)), 0x7eadbeef);
    }

    #[test]
    fn run_level_normal_eob_and_escapes() {
        // 0 -> escape, 1 -> EOB, 2/3 -> run-level codes.
        let huffman = Huffman::new(&[0b00, 0b01, 0b10, 0b11], &[2, 2, 2, 2]).unwrap();
        let levels = [0.0, 0.0, 1.0, 2.5];
        let runs = [0u16, 0, 0, 1];

        // Normal code: symbol 3, negative sign.
        let data = pack_bits(&[(0b11, 2), (0, 1), (0b01, 2)]);
        let mut bits = BitReader::new(&data);
        let mut ptr = [0.0f32; 16];
        decode_run_level(&mut bits, &huffman, &levels, &runs, 2, &mut ptr, 0, 10, 16, 4, 4).unwrap();
        assert_eq!(ptr[1], -2.5);

        // v1 escape: 4-bit level, 4-bit offset step.
        let data = pack_bits(&[(0b00, 2), (5, 4), (2, 4), (1, 1), (0b01, 2)]);
        let mut bits = BitReader::new(&data);
        let mut ptr = [0.0f32; 16];
        decode_run_level(&mut bits, &huffman, &levels, &runs, 1, &mut ptr, 0, 10, 16, 4, 4).unwrap();
        assert_eq!(ptr[2], 5.0);

        // v2 escape: large value, then a short offset extension.
        let data = pack_bits(&[
            (0b00, 2),
            (0, 1),
            (7, 8),
            (1, 1),
            (0, 1),
            (0b11, 2),
            (1, 1),
            (0b01, 2),
        ]);
        let mut bits = BitReader::new(&data);
        let mut ptr = [0.0f32; 16];
        decode_run_level(&mut bits, &huffman, &levels, &runs, 2, &mut ptr, 0, 10, 16, 4, 4).unwrap();
        assert_eq!(ptr[4], 7.0);

        // Three continuation bits in a row break the escape.
        let data = pack_bits(&[(0b00, 2), (0, 1), (0, 8), (1, 1), (1, 1), (1, 1)]);
        let mut bits = BitReader::new(&data);
        let mut ptr = [0.0f32; 16];
        let r = decode_run_level(&mut bits, &huffman, &levels, &runs, 2, &mut ptr, 0, 10, 16, 4, 4);
        assert!(r.is_err());
    }

    #[test]
    fn silence_packet_roundtrips_to_zero_pcm() {
        // v1 mono, LSP exponents, no reservoir: one frame per packet.
        let mut s = WmaStream::new(1, 8000, 1, 6000, 0, &[]).unwrap();
        assert_eq!(s.frame_len(), 512);
        s.queue_packet(&[0u8; 16]);

        let mut out = vec![1i16; 600];
        let n = s.read_buffer(&mut out);
        assert_eq!(n, 512);
        assert!(out[..n].iter().all(|&v| v == 0));
        assert!(s.end_of_data());

        // v2 stereo without a reservoir: exactly channels * frame_len.
        let mut s = WmaStream::new(2, 44100, 2, 128000, 0, &[0, 0, 0, 0, 0x01, 0]).unwrap();
        s.queue_packet(&[0u8; 64]);
        let mut out = vec![1i16; 5000];
        let n = s.read_buffer(&mut out);
        assert_eq!(n, 2 * 2048);
        assert!(out[..n].iter().all(|&v| v == 0));
    }

    #[test]
    fn zero_filled_reservoir_packet_is_dropped() {
        // The frame-count nibble decodes to -1: reset and drop.
        let mut s = v2_stereo_128k();
        s.queue_packet(&vec![0u8; 2973]);
        assert!(s.end_of_data());
        assert_eq!(s.last_superframe_len, 0);

        // Shorter than block align: also dropped.
        s.queue_packet(&[0u8; 100]);
        assert!(s.end_of_data());
    }

    #[test]
    fn bit_reservoir_carries_the_packet_tail() {
        let mut s = v2_stereo_128k();
        assert_eq!(s.byte_offset_bits, 10);

        // One new frame, no completion bits; the silent frame consumes
        // 3 bits (ms-stereo flag plus two channel flags).
        let mut packet = pack_bits(&[(0, 4), (2, 4), (0, 13)]);
        packet.resize(2973, 0);
        s.queue_packet(&packet);

        let mut out = vec![1i16; 8192];
        assert_eq!(s.read_buffer(&mut out), 2 * 2048);
        assert!(out[..4096].iter().all(|&v| v == 0));
        assert_eq!(s.last_superframe_len, (2973 * 8 - 24) / 8);
        assert_eq!(s.last_bitoffset, 0);

        // No new frames: only the carried-over frame is emitted, and the
        // tail ends mid-byte this time.
        let mut packet = pack_bits(&[(0, 4), (1, 4), (0, 13)]);
        packet.resize(2973, 0);
        s.queue_packet(&packet);

        assert_eq!(s.read_buffer(&mut out), 2 * 2048);
        let tail_bits: usize = 2973 * 8 - 21;
        assert_eq!(s.last_superframe_len, tail_bits.div_ceil(8));
        assert_eq!(s.last_bitoffset, (8 - tail_bits % 8) % 8);
        assert!(s.last_superframe_len <= SUPERFRAME_SIZE_MAX + 4);
    }

    #[test]
    fn hand_built_frame_decodes_through_the_exponent_path() {
        // v2 mono at a bit rate high enough to disable noise coding, with
        // Huffman-coded exponents and fixed blocks.
        let mut s = WmaStream::new(2, 44100, 1, 256000, 0, &[0, 0, 0, 0, 0x01, 0]).unwrap();
        assert!(!s.use_noise_coding && s.use_exp_huffman);

        let bands = s.exponent_bands[0].clone();
        let scale_code = (data::SCALE_HUFF_CODES[60], data::SCALE_HUFF_BITS[60] as usize);
        let book = &data::COEF_CODEBOOKS[4];
        let eob = (book.huff_codes[1], book.huff_bits[1] as usize);

        let mut chunks = vec![
            (1u32, 1usize), // channel 0 coded
            (50, 7),        // total gain 51
        ];
        // One zero delta per exponent band.
        for _ in &bands {
            chunks.push(scale_code);
        }
        chunks.push(eob);

        let packet = pack_bits(&chunks);
        s.queue_packet(&packet);

        let mut out = vec![1i16; 4096];
        let n = s.read_buffer(&mut out);
        assert_eq!(n, 2048);
        assert!(out[..n].iter().all(|&v| v == 0));

        // All deltas were zero, so the whole curve sits at powTab[36 + 60].
        assert_eq!(s.max_exponent[0], data::POW_TAB[96]);
        assert_eq!(s.noise_index, 0);
    }
}
