//! Activation functions fused into the convolution output.
//!
//! [`activate`] is the scalar evaluator over the user-facing parameters.
//! [`ActivationParams`] holds the normalized form consumed by the fused
//! post-processing: identity and relu become restrict-range, leaky-relu
//! becomes prelu with a per-channel slope table.

use crate::error::{ConvError, ConvResult};

/// Closed set of activations the post-processing stage can fuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    Identity,
    Relu,
    /// `params[0]`: negative slope.
    LeakyRelu,
    /// `params[0..2]`: lower and upper bound.
    RestrictRange,
    /// `params[c]`: negative slope of channel `c`.
    Prelu,
    /// `params[0]`: alpha.
    Elu,
    /// `params[0..2]`: shift, scale.
    Hswish,
    /// `params[0]`: threshold above which the input passes through.
    Mish,
    /// `params[0..2]`: scale, shift.
    HardSigmoid,
    /// `params[0]`: slope (beta).
    Swish,
    Gelu,
}

impl ActivationKind {
    pub const ALL: [ActivationKind; 11] = [
        ActivationKind::Identity,
        ActivationKind::Relu,
        ActivationKind::LeakyRelu,
        ActivationKind::RestrictRange,
        ActivationKind::Prelu,
        ActivationKind::Elu,
        ActivationKind::Hswish,
        ActivationKind::Mish,
        ActivationKind::HardSigmoid,
        ActivationKind::Swish,
        ActivationKind::Gelu,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ActivationKind::Identity => "identity",
            ActivationKind::Relu => "relu",
            ActivationKind::LeakyRelu => "leaky-relu",
            ActivationKind::RestrictRange => "restrict-range",
            ActivationKind::Prelu => "prelu",
            ActivationKind::Elu => "elu",
            ActivationKind::Hswish => "hswish",
            ActivationKind::Mish => "mish",
            ActivationKind::HardSigmoid => "hard-sigmoid",
            ActivationKind::Swish => "swish",
            ActivationKind::Gelu => "gelu",
        }
    }

    /// Number of user parameters the kind reads for `dst_c` output channels.
    pub fn param_count(self, dst_c: usize) -> usize {
        match self {
            ActivationKind::Identity | ActivationKind::Relu | ActivationKind::Gelu => 0,
            ActivationKind::LeakyRelu
            | ActivationKind::Elu
            | ActivationKind::Mish
            | ActivationKind::Swish => 1,
            ActivationKind::RestrictRange | ActivationKind::Hswish | ActivationKind::HardSigmoid => 2,
            ActivationKind::Prelu => dst_c,
        }
    }

    /// Kind actually executed by the fused post-processing.
    pub fn normalized(self) -> ActivationKind {
        match self {
            ActivationKind::Identity | ActivationKind::Relu => ActivationKind::RestrictRange,
            ActivationKind::LeakyRelu => ActivationKind::Prelu,
            other => other,
        }
    }
}

impl std::fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar activation over user-facing parameters.
#[inline]
pub fn activate(kind: ActivationKind, x: f32, params: &[f32], channel: usize) -> f32 {
    match kind {
        ActivationKind::Identity => x,
        ActivationKind::Relu => x.max(0.0),
        ActivationKind::LeakyRelu => leaky(x, params[0]),
        ActivationKind::RestrictRange => restrict_range(x, params[0], params[1]),
        ActivationKind::Prelu => leaky(x, params[channel]),
        ActivationKind::Elu => elu(x, params[0]),
        ActivationKind::Hswish => hswish(x, params[0], params[1]),
        ActivationKind::Mish => mish(x, params[0]),
        ActivationKind::HardSigmoid => hard_sigmoid(x, params[0], params[1]),
        ActivationKind::Swish => swish(x, params[0]),
        ActivationKind::Gelu => gelu(x),
    }
}

#[inline(always)]
pub(crate) fn leaky(x: f32, slope: f32) -> f32 {
    x.max(0.0) + slope * x.min(0.0)
}

#[inline(always)]
pub(crate) fn restrict_range(x: f32, lo: f32, hi: f32) -> f32 {
    x.max(lo).min(hi)
}

#[inline(always)]
pub(crate) fn elu(x: f32, alpha: f32) -> f32 {
    if x >= 0.0 {
        x
    } else {
        alpha * (x.exp() - 1.0)
    }
}

#[inline(always)]
pub(crate) fn hswish(x: f32, shift: f32, scale: f32) -> f32 {
    (x.min(shift) + shift).max(0.0) * scale * x
}

#[inline(always)]
pub(crate) fn mish(x: f32, threshold: f32) -> f32 {
    if x > threshold {
        x
    } else {
        x * (x.exp() + 1.0).ln().tanh()
    }
}

#[inline(always)]
pub(crate) fn hard_sigmoid(x: f32, scale: f32, shift: f32) -> f32 {
    (x * scale + shift).min(1.0).max(0.0)
}

#[inline(always)]
pub(crate) fn swish(x: f32, slope: f32) -> f32 {
    x / (1.0 + (-slope * x).exp())
}

#[inline(always)]
pub(crate) fn gelu(x: f32) -> f32 {
    x * 0.5 * (1.0 + erf(x * std::f32::consts::FRAC_1_SQRT_2))
}

/// Error function approximation (Abramowitz and Stegun 7.1.26).
#[inline(always)]
fn erf(x: f32) -> f32 {
    const A1: f32 = 0.254829592;
    const A2: f32 = -0.284496736;
    const A3: f32 = 1.421413741;
    const A4: f32 = -1.453152027;
    const A5: f32 = 1.061405429;
    const P: f32 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    sign * y
}

/// Normalized activation parameters, padded with zeros to a channel multiple.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationParams {
    kind: ActivationKind,
    data: Vec<f32>,
}

impl ActivationParams {
    /// Normalizes the user parameters of `kind` for `dst_c` channels.
    /// Per-channel tables are padded up to a multiple of `align`.
    pub fn new(kind: ActivationKind, params: &[f32], dst_c: usize, align: usize) -> ConvResult<Self> {
        let needed = kind.param_count(dst_c);
        if params.len() < needed {
            return Err(ConvError::InvalidParam(format!(
                "{kind} needs {needed} parameters, got {}",
                params.len()
            )));
        }
        let padded = dst_c.div_ceil(align.max(1)) * align.max(1);
        let data = match kind {
            ActivationKind::Identity => vec![-f32::MAX, f32::MAX],
            ActivationKind::Relu => vec![0.0, f32::MAX],
            ActivationKind::LeakyRelu => {
                let mut v = vec![0.0; padded];
                v[..dst_c].fill(params[0]);
                v
            }
            ActivationKind::Prelu => {
                let mut v = vec![0.0; padded];
                v[..dst_c].copy_from_slice(&params[..dst_c]);
                v
            }
            ActivationKind::RestrictRange | ActivationKind::Hswish | ActivationKind::HardSigmoid => {
                vec![params[0], params[1]]
            }
            ActivationKind::Elu | ActivationKind::Mish | ActivationKind::Swish => vec![params[0], 0.0],
            ActivationKind::Gelu => vec![0.0, 0.0],
        };
        Ok(Self {
            kind: kind.normalized(),
            data,
        })
    }

    /// Kind executed after normalization.
    pub fn kind(&self) -> ActivationKind {
        self.kind
    }

    pub fn per_channel(&self) -> bool {
        self.kind == ActivationKind::Prelu
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}
