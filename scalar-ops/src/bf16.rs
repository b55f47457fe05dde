/// fp32 -> bf16 bits, round to nearest, ties to even. NaN stays NaN.
#[inline(never)]
pub fn scalar_f32_to_bf16(x: f32) -> u16 {
    if x.is_nan() {
        return ((x.to_bits() >> 16) as u16) | 0x40;
    }
    let bits = x.to_bits() as u64;
    let upper = bits >> 16;
    let lower = bits & 0xFFFF;
    let rounded = if lower > 0x8000 || (lower == 0x8000 && upper & 1 == 1) {
        upper + 1
    } else {
        upper
    };
    rounded as u16
}

/// bf16 bits -> fp32, exact.
#[inline(never)]
pub fn scalar_bf16_to_f32(x: u16) -> f32 {
    f32::from_bits((x as u32) << 16)
}

/// `x` rounded to the nearest bf16 value.
pub fn scalar_round_bf16(x: f32) -> f32 {
    scalar_bf16_to_f32(scalar_f32_to_bf16(x))
}

/// Rounds every element of `x` to bf16 precision.
pub fn scalar_round_bf16_slice(x: &[f32]) -> Vec<f32> {
    x.iter().map(|&v| scalar_round_bf16(v)).collect()
}
