//! bf16-conv-kernels: convolution as bf16 GEMM on CPU.
//!
//! Receptive fields are packed into bf16 rows, multiplied against pre-packed
//! bf16 weights with fp32 accumulation and finished by a fused bias plus
//! activation store. The inner loops run on one of several engines:
//! - **AMX-BF16** tile registers (`TDPBF16PS`), when the CPU and OS allow it
//! - **AVX-512F** fused multiply-add over widened bf16 pairs
//! - **Portable** Rust with the same widening, on any target
//! - **Emulated tiles**: the AMX programs on a software tile file, for testing
//!
//! Selection is automatic (see [`EngineKind::detect`]) and can be forced with
//! [`ConvOptions`] or the `BF16_CONV_ENGINE` environment variable.
//!
//! [`InnerProduct16b`] and [`Deconvolution16b`] run on the same GEMM engine.
//!
//! # Quick Start
//!
//! ```ignore
//! use bf16_conv_kernels::{ConvParam, Convolution16b, Tensor, TensorMut};
//!
//! let p = ConvParam::new(1, 64, 8, 8, 64);
//! let mut conv = Convolution16b::new(&p)?;
//! conv.set_params(&weight, None, &[])?;
//! conv.forward(Tensor::F32(&src), None, TensorMut::F32(&mut dst))?;
//! ```

pub mod activation;
pub mod bf16;
pub mod cache_params;
pub mod config;
pub mod conv;
pub mod error;
pub mod inner_product;
pub mod kernels;

pub use activation::{activate, ActivationKind, ActivationParams};
pub use bf16::{bfloat16_to_float32, float32_to_bfloat16};
pub use cache_params::CacheSizes;
pub use config::{ConvOptions, EngineKind, ENGINE_ENV};
pub use conv::{
    AlgParam, ConvParam, ConvertKind, Convolution16b, Deconvolution16b, Scratch, Tensor, TensorLayout, TensorMut, TensorType,
};
pub use error::{ConvError, ConvResult};
pub use inner_product::InnerProduct16b;
pub use kernels::{TileEngine, TileKey, TileShape};
