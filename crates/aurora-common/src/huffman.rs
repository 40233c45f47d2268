//! Prefix-code decoder built from explicit codewords and bit lengths.

use crate::bitstream::BitReader;
use crate::error::{Error, Result};

/// A canonical-or-not prefix code. Symbols default to the codeword index;
/// an explicit symbol table may override them.
pub struct Huffman {
    max_length: u8,
    /// Per bit length, the sorted `(codeword, symbol)` pairs of that length.
    codes: Vec<Vec<(u32, u32)>>,
}

impl Huffman {
    pub fn new(codes: &[u32], lengths: &[u8]) -> Result<Self> {
        Self::build(codes, lengths, None)
    }

    pub fn with_symbols(codes: &[u32], lengths: &[u8], symbols: &[u32]) -> Result<Self> {
        if symbols.len() != codes.len() {
            return Err(Error::InvalidData(
                "Huffman symbol count does not match code count".into(),
            ));
        }
        Self::build(codes, lengths, Some(symbols))
    }

    fn build(codes: &[u32], lengths: &[u8], symbols: Option<&[u32]>) -> Result<Self> {
        if codes.len() != lengths.len() || codes.is_empty() {
            return Err(Error::InvalidData("malformed Huffman code table".into()));
        }

        let max_length = *lengths.iter().max().unwrap_or(&0);
        if max_length == 0 || max_length > 32 {
            return Err(Error::InvalidData(format!(
                "unsupported Huffman code length {max_length}"
            )));
        }

        let mut by_length: Vec<Vec<(u32, u32)>> = vec![Vec::new(); max_length as usize + 1];
        for (i, (&code, &len)) in codes.iter().zip(lengths).enumerate() {
            if len == 0 || len > max_length {
                return Err(Error::InvalidData(format!("bad code length {len}")));
            }
            if u64::from(code) >= 1u64 << len {
                return Err(Error::InvalidData(format!(
                    "codeword {code:#x} does not fit in {len} bits"
                )));
            }
            let sym = symbols.map_or(i as u32, |s| s[i]);
            by_length[len as usize].push((code, sym));
        }

        for level in &mut by_length {
            level.sort_unstable_by_key(|&(code, _)| code);
            if level.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(Error::InvalidData("duplicate Huffman codeword".into()));
            }
        }

        Ok(Self {
            max_length,
            codes: by_length,
        })
    }

    /// Decode one symbol, consuming exactly the matched codeword's bits.
    pub fn get_symbol(&self, bits: &mut BitReader) -> Result<u32> {
        let mut code = 0u32;
        for len in 1..=self.max_length as usize {
            code = (code << 1) | bits.get_bit();
            let level = &self.codes[len];
            if let Ok(i) = level.binary_search_by_key(&code, |&(c, _)| c) {
                return Ok(level[i].1);
            }
        }
        Err(Error::InvalidData("no matching Huffman code".into()))
    }
}
