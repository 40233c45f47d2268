//! Audio decoding for Aurora-engine game resources.
//!
//! The centerpiece is the Windows Media Audio v1/v2 decoder: a packetized
//! decoder that consumes compressed superframes and queues interleaved
//! 16-bit PCM onto an owned audio stream.

pub mod audiostream;
pub mod error;
pub mod wma;

pub use audiostream::{AudioStream, PacketizedAudioStream, QueuingAudioStream};
pub use error::{DecoderError, Result};
pub use wma::WmaStream;
