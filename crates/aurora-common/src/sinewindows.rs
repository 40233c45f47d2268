//! The standard sine window used by 50%-overlap MDCT codecs.

/// Half window of length `2^bits`: `w[i] = sin((i + 0.5) * pi / 2N)`.
///
/// Two overlapping applications of this window sum to unit power, which is
/// what the MDCT reconstruction rule requires.
pub fn sine_window(bits: u32) -> Vec<f32> {
    let n = 1usize << bits;
    let step = std::f32::consts::PI / (2.0 * n as f32);
    (0..n).map(|i| ((i as f32 + 0.5) * step).sin()).collect()
}
