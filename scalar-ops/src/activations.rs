//! Activations over user-facing parameters, written independently of the
//! fused post-processing.

/// Activation selector mirroring the operator's kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    LeakyRelu,
    RestrictRange,
    Prelu,
    Elu,
    Hswish,
    Mish,
    HardSigmoid,
    Swish,
    Gelu,
}

fn erf(x: f64) -> f64 {
    // Abramowitz and Stegun 7.1.26
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let y = 1.0 - poly * (-x * x).exp();
    if x < 0.0 {
        -y
    } else {
        y
    }
}

/// `params` as for the operator: slope, bounds, per-channel slopes, etc.
#[inline(never)]
pub fn scalar_activate(kind: Activation, x: f32, params: &[f32], channel: usize) -> f32 {
    let v = x as f64;
    let r = match kind {
        Activation::Identity => v,
        Activation::Relu => v.max(0.0),
        Activation::LeakyRelu => {
            if v > 0.0 {
                v
            } else {
                v * params[0] as f64
            }
        }
        Activation::RestrictRange => v.max(params[0] as f64).min(params[1] as f64),
        Activation::Prelu => {
            if v > 0.0 {
                v
            } else {
                v * params[channel] as f64
            }
        }
        Activation::Elu => {
            if v >= 0.0 {
                v
            } else {
                params[0] as f64 * (v.exp() - 1.0)
            }
        }
        Activation::Hswish => {
            let (shift, scale) = (params[0] as f64, params[1] as f64);
            (v.min(shift) + shift).max(0.0) * scale * v
        }
        Activation::Mish => {
            if v > params[0] as f64 {
                v
            } else {
                v * v.exp().ln_1p().tanh()
            }
        }
        Activation::HardSigmoid => (v * params[0] as f64 + params[1] as f64).clamp(0.0, 1.0),
        Activation::Swish => v / (1.0 + (-(params[0] as f64) * v).exp()),
        Activation::Gelu => 0.5 * v * (1.0 + erf(v / std::f64::consts::SQRT_2)),
    };
    r as f32
}
