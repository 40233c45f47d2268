//! Shared primitives for the Aurora media decoders: an MSB-first bit reader,
//! a prefix-code (Huffman) decoder, a naive inverse MDCT and the standard
//! sine window.

pub mod bitstream;
pub mod error;
pub mod huffman;
pub mod mdct;
pub mod sinewindows;

pub use bitstream::BitReader;
pub use error::{Error, Result};
pub use huffman::Huffman;
pub use mdct::Mdct;
pub use sinewindows::sine_window;
