//! Register decoding: IEEE-754 reconstruction and derived metrics.
//!
//! The meter transmits each 32-bit float as two holding registers with the
//! halves swapped: the LOW half of the bit pattern arrives in the first
//! register, the HIGH half in the second. That order must be preserved
//! exactly or every decoded magnitude and sign is wrong.

use crate::error::DecodeFault;

const MANTISSA_BITS: u32 = 23;
const MANTISSA_MASK: u32 = (1 << MANTISSA_BITS) - 1;
const EXPONENT_MASK: u32 = 0xFF;
const EXPONENT_BIAS: i32 = 127;

/// Reconstruct a 32-bit IEEE-754 value from a half-swapped register pair.
///
/// `first_word` is the register that arrived first on the wire (the low half
/// of the bit pattern); `second_word` carries the high half. Bit patterns
/// with an all-ones exponent (NaN, infinity) are rejected so a constructed
/// reading only ever holds finite values.
pub fn decode_float32(first_word: u16, second_word: u16) -> Result<f64, DecodeFault> {
    let bits = (u32::from(second_word) << 16) | u32::from(first_word);

    let sign = bits >> 31;
    let exponent = ((bits >> MANTISSA_BITS) & EXPONENT_MASK) as i32;
    let mantissa = bits & MANTISSA_MASK;

    let scale = f64::from(1u32 << MANTISSA_BITS);
    let magnitude = match exponent {
        // Subnormals and zero: no implicit leading 1, fixed exponent.
        0 => (f64::from(mantissa) / scale) * 2f64.powi(1 - EXPONENT_BIAS),
        255 => return Err(DecodeFault::NonFinite(bits)),
        e => (1.0 + f64::from(mantissa) / scale) * 2f64.powi(e - EXPONENT_BIAS),
    };

    Ok(if sign == 1 { -magnitude } else { magnitude })
}

/// Phase imbalance: ratio of the maximum phase current to the mean.
///
/// A zero (or negative) mean has no meaningful ratio; it is reported as a
/// decode fault that aborts the cycle rather than propagating NaN into a
/// reading or inventing a sentinel magnitude.
pub fn compute_phase_imbalance(currents: [f64; 3]) -> Result<f64, DecodeFault> {
    let mean = currents.iter().sum::<f64>() / currents.len() as f64;
    if mean <= 0.0 {
        return Err(DecodeFault::ZeroMeanCurrent);
    }
    let max = currents.iter().cloned().fold(f64::MIN, f64::max);
    Ok(max / mean)
}
