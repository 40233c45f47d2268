//! Image decoding for Aurora-engine game resources.
//!
//! The TPC container is the interesting piece: a compact binary texture
//! format with swizzled-pixel layouts, implicit mip chains and six-face
//! cube maps that need per-face rotation fix-ups.

pub mod dxt;
pub mod tpc;
pub mod types;
pub mod util;

pub use tpc::{MipMap, Tpc};
pub use types::PixelFormat;
