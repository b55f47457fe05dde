//! fp32 <-> bf16 codec.
//!
//! Rounding is round-to-nearest-even on the 16 discarded mantissa bits:
//! `(bits + 0x7FFF + ((bits >> 16) & 1)) >> 16`. Every converter and the
//! fused store path go through [`float32_to_bfloat16`] so packed activations,
//! packed weights and bf16 outputs agree bit for bit across backends.

use half::bf16;

const SHIFT: u32 = 16;
const ROUND: u32 = 0x7FFF;
const HIGH_MASK: u32 = 0xFFFF_0000;

/// Rounds `x` to bf16 bits, ties to even. NaN stays a quiet NaN of the same sign.
#[inline(always)]
pub fn float32_to_bfloat16(x: f32) -> u16 {
    let bits = x.to_bits();
    if x.is_nan() {
        return ((bits >> SHIFT) as u16) | 0x0040;
    }
    let lsb = (bits >> SHIFT) & 1;
    (bits.wrapping_add(ROUND + lsb) >> SHIFT) as u16
}

/// Exact widening: the bf16 bits become the high half of the fp32 pattern.
#[inline(always)]
pub fn bfloat16_to_float32(x: u16) -> f32 {
    f32::from_bits((x as u32) << SHIFT)
}

/// `x` quantized to the nearest bf16 value, returned as fp32.
#[inline(always)]
pub fn round_to_bf16(x: f32) -> f32 {
    bfloat16_to_float32(float32_to_bfloat16(x))
}

#[inline(always)]
pub fn to_bf16(x: f32) -> bf16 {
    bf16::from_bits(float32_to_bfloat16(x))
}

/// Splits a little-endian pair of bf16 values packed in one `u32` into two
/// fp32 values: the even element (low half) and the odd element (high half).
#[inline(always)]
pub fn widen_interleaved_pair(pair: u32) -> (f32, f32) {
    (f32::from_bits(pair << SHIFT), f32::from_bits(pair & HIGH_MASK))
}

pub fn convert_f32_to_bf16(src: &[f32], dst: &mut [bf16]) {
    debug_assert_eq!(src.len(), dst.len());
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = to_bf16(s);
    }
}

pub fn convert_bf16_to_f32(src: &[bf16], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d = bfloat16_to_float32(s.to_bits());
    }
}

/// Rounds `src` into raw bf16 bits.
#[inline]
pub(crate) fn round_row(src: &[f32], dst: &mut [u16]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = float32_to_bfloat16(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_values_round_trip() {
        for &x in &[0.0f32, -0.0, 1.0, -2.5, 0.15625, 65536.0, f32::INFINITY] {
            assert_eq!(round_to_bf16(x).to_bits(), x.to_bits(), "{x}");
        }
    }

    #[test]
    fn ties_go_to_even_mantissa() {
        // 1.0 + 2^-8 sits exactly between 1.0 (even) and 1.0 + 2^-7 (odd).
        let tie_down = f32::from_bits(0x3F80_8000);
        assert_eq!(float32_to_bfloat16(tie_down), 0x3F80);
        // 1.0 + 3*2^-8 sits between 0x3F81 (odd) and 0x3F82 (even).
        let tie_up = f32::from_bits(0x3F81_8000);
        assert_eq!(float32_to_bfloat16(tie_up), 0x3F82);
        // Just above the boundary always rounds up.
        assert_eq!(float32_to_bfloat16(f32::from_bits(0x3F80_8001)), 0x3F81);
        assert_eq!(float32_to_bfloat16(f32::from_bits(0x3F80_7FFF)), 0x3F80);
    }

    #[test]
    fn agrees_with_half_for_finite_values() {
        let mut x = 0x0001_2345u32;
        for _ in 0..10_000 {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let f = f32::from_bits(x);
            if f.is_nan() {
                continue;
            }
            assert_eq!(float32_to_bfloat16(f), bf16::from_f32(f).to_bits(), "{x:#x}");
        }
    }

    #[test]
    fn nan_stays_nan() {
        assert!(bfloat16_to_float32(float32_to_bfloat16(f32::NAN)).is_nan());
        let neg = f32::from_bits(0xFFFF_FFFF);
        let r = bfloat16_to_float32(float32_to_bfloat16(neg));
        assert!(r.is_nan() && r.is_sign_negative());
    }

    #[test]
    fn widen_pair_splits_lanes() {
        let even = float32_to_bfloat16(1.5) as u32;
        let odd = float32_to_bfloat16(-3.0) as u32;
        let (a, b) = widen_interleaved_pair(even | (odd << 16));
        assert_eq!(a, 1.5);
        assert_eq!(b, -3.0);
    }
}
