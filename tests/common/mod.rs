//! Shared helpers: deterministic inputs, engine lists, reference runs.
#![allow(dead_code)]

use bf16_conv_kernels::{
    ActivationKind, CacheSizes, ConvOptions, ConvParam, Convolution16b, EngineKind, Tensor, TensorMut, TensorType,
};
use half::bf16;
use scalar_ops::activations::Activation;
use scalar_ops::bf16::scalar_round_bf16_slice;
use scalar_ops::conv::{scalar_conv_nhwc, ConvShape};

pub const BIG_CACHES: CacheSizes = CacheSizes::new(32 * 1024, 1 << 20, 8 << 20);

/// Engines exercised by the tests: the two that run anywhere plus whichever
/// hardware engines this CPU has.
pub fn engines() -> Vec<EngineKind> {
    [EngineKind::Portable, EngineKind::AmxEmulated, EngineKind::Avx512, EngineKind::Amx]
        .into_iter()
        .filter(|k| k.is_available())
        .collect()
}

/// Engines whose accumulation order is fixed, so results are bit-exact
/// across blockings.
pub fn exact_engines() -> Vec<EngineKind> {
    vec![EngineKind::Portable, EngineKind::AmxEmulated]
}

/// Deterministic values in roughly [-1, 1).
pub fn values(len: usize, seed: u64) -> Vec<f32> {
    let mut s = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407) | 1;
    (0..len)
        .map(|_| {
            s ^= s << 13;
            s ^= s >> 7;
            s ^= s << 17;
            ((s >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

pub fn shape_of(p: &ConvParam) -> ConvShape {
    ConvShape {
        batch: p.batch,
        src_c: p.src_c,
        src_h: p.src_h,
        src_w: p.src_w,
        dst_c: p.dst_c,
        kernel: (p.kernel_y, p.kernel_x),
        stride: (p.stride_y, p.stride_x),
        dilation: (p.dilation_y, p.dilation_x),
        pad: (p.pad_y, p.pad_x, p.pad_h, p.pad_w),
        group: p.group,
    }
}

pub fn reference_activation(kind: ActivationKind) -> Activation {
    match kind {
        ActivationKind::Identity => Activation::Identity,
        ActivationKind::Relu => Activation::Relu,
        ActivationKind::LeakyRelu => Activation::LeakyRelu,
        ActivationKind::RestrictRange => Activation::RestrictRange,
        ActivationKind::Prelu => Activation::Prelu,
        ActivationKind::Elu => Activation::Elu,
        ActivationKind::Hswish => Activation::Hswish,
        ActivationKind::Mish => Activation::Mish,
        ActivationKind::HardSigmoid => Activation::HardSigmoid,
        ActivationKind::Swish => Activation::Swish,
        ActivationKind::Gelu => Activation::Gelu,
    }
}

/// Inputs of one convolution case.
pub struct Case {
    pub p: ConvParam,
    pub src: Vec<f32>,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
    pub params: Vec<f32>,
}

impl Case {
    pub fn new(p: ConvParam, seed: u64) -> Self {
        let params = match p.activation {
            ActivationKind::LeakyRelu => vec![0.1],
            ActivationKind::RestrictRange => vec![-0.4, 0.6],
            ActivationKind::Prelu => values(p.dst_c, seed + 3).iter().map(|v| v.abs() * 0.3).collect(),
            ActivationKind::Elu => vec![0.8],
            ActivationKind::Hswish => vec![3.0, 1.0 / 6.0],
            ActivationKind::Mish => vec![20.0],
            ActivationKind::HardSigmoid => vec![0.2, 0.5],
            ActivationKind::Swish => vec![1.0],
            _ => vec![],
        };
        Self {
            src: values(p.batch * p.src_size(), seed),
            weight: values(p.weight_size(), seed + 1).iter().map(|v| v * 0.25).collect(),
            bias: values(p.dst_c, seed + 2),
            params,
            p,
        }
    }

    /// Direct convolution on bf16-rounded source and weights.
    pub fn reference(&self) -> Vec<f32> {
        let src = scalar_round_bf16_slice(&self.src);
        let weight = scalar_round_bf16_slice(&self.weight);
        scalar_conv_nhwc(
            &shape_of(&self.p),
            &src,
            &weight,
            Some(&self.bias),
            reference_activation(self.p.activation),
            &self.params,
        )
    }

    pub fn operator(&self, options: &ConvOptions) -> Convolution16b {
        init_logging();
        let mut conv = Convolution16b::with_options(&self.p, options).unwrap();
        conv.set_params(&self.weight, Some(&self.bias), &self.params).unwrap();
        conv
    }

    /// Runs the operator and returns the destination as fp32.
    pub fn run(&self, options: &ConvOptions) -> Vec<f32> {
        let mut conv = self.operator(options);
        let src_bf16: Vec<bf16> = self.src.iter().map(|&v| bf16::from_f32(v)).collect();
        let src = match self.p.src_type {
            TensorType::F32 => Tensor::F32(&self.src),
            TensorType::Bf16 => Tensor::Bf16(&src_bf16),
        };
        let len = self.p.batch * self.p.dst_size();
        match self.p.dst_type {
            TensorType::F32 => {
                let mut dst = vec![f32::NAN; len];
                conv.forward(src, None, TensorMut::F32(&mut dst)).unwrap();
                dst
            }
            TensorType::Bf16 => {
                let mut dst = vec![bf16::NAN; len];
                conv.forward(src, None, TensorMut::Bf16(&mut dst)).unwrap();
                dst.iter().map(|v| v.to_f32()).collect()
            }
        }
    }
}

/// `RUST_LOG=bf16_conv_kernels=debug` shows engine and blocking choices.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn options(engine: EngineKind) -> ConvOptions {
    ConvOptions::default().engine(engine).caches(BIG_CACHES)
}

/// Asserts `|got - expect| <= rel * (1 + |expect|)` element-wise.
pub fn assert_close(got: &[f32], expect: &[f32], rel: f32, what: &str) {
    assert_eq!(got.len(), expect.len(), "{what}: length");
    for (i, (&g, &e)) in got.iter().zip(expect).enumerate() {
        assert!(
            (g - e).abs() <= rel * (1.0 + e.abs()),
            "{what}: element {i} is {g}, expected {e}"
        );
    }
}

/// Tolerance for a destination type: fp32 accumulation, plus one bf16 ulp.
pub fn tolerance(dst: TensorType) -> f32 {
    match dst {
        TensorType::F32 => 2e-3,
        TensorType::Bf16 => 1e-2,
    }
}
