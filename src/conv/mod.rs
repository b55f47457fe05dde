//! bf16 convolution front-end.
//!
//! [`Convolution16b`] picks an engine once at construction: the NHWC GEMM
//! engine (packed receptive fields reduced by tile or SIMD micro-kernels) for
//! ungrouped NHWC convolutions, the generic engine otherwise.
//!
//! ```ignore
//! use bf16_conv_kernels::{ActivationKind, ConvParam, Convolution16b, Tensor, TensorMut};
//!
//! let p = ConvParam::new(1, 64, 56, 56, 64).kernel(3, 3).pad(1).activation(ActivationKind::Relu);
//! let mut conv = Convolution16b::new(&p)?;
//! conv.set_params(&weight, Some(&bias), &[])?;
//! conv.forward(Tensor::F32(&src), None, TensorMut::F32(&mut dst))?;
//! ```

pub mod convert;
pub mod deconv;
mod driver;
pub mod gemm;
pub mod nhwc_gemm;
pub mod param;
mod weights;

use half::bf16;

pub use convert::ConvertKind;
pub use deconv::Deconvolution16b;
pub use gemm::GenericConv;
pub use nhwc_gemm::{NhwcGemm, Scratch};
pub use param::{AlgParam, ConvParam, TensorLayout, TensorType};

use crate::config::ConvOptions;
use crate::error::{ConvError, ConvResult};

/// Read-only tensor view.
#[derive(Debug, Clone, Copy)]
pub enum Tensor<'a> {
    F32(&'a [f32]),
    Bf16(&'a [bf16]),
}

impl Tensor<'_> {
    pub fn ty(&self) -> TensorType {
        match self {
            Tensor::F32(_) => TensorType::F32,
            Tensor::Bf16(_) => TensorType::Bf16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Tensor::F32(s) => s.len(),
            Tensor::Bf16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writable tensor view.
#[derive(Debug)]
pub enum TensorMut<'a> {
    F32(&'a mut [f32]),
    Bf16(&'a mut [bf16]),
}

impl TensorMut<'_> {
    pub fn ty(&self) -> TensorType {
        match self {
            TensorMut::F32(_) => TensorType::F32,
            TensorMut::Bf16(_) => TensorType::Bf16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorMut::F32(s) => s.len(),
            TensorMut::Bf16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Inner {
    NhwcGemm(NhwcGemm),
    Gemm(GenericConv),
}

/// Convolution with bf16 arithmetic and fp32 accumulation.
pub struct Convolution16b {
    inner: Inner,
}

impl Convolution16b {
    /// Engine and cache sizes from the environment and CPU detection.
    pub fn new(p: &ConvParam) -> ConvResult<Self> {
        Self::with_options(p, &ConvOptions::default())
    }

    pub fn with_options(p: &ConvParam, options: &ConvOptions) -> ConvResult<Self> {
        p.validate()?;
        let inner = if p.nhwc_gemm_preferable() {
            Inner::NhwcGemm(NhwcGemm::new(p, options)?)
        } else {
            Inner::Gemm(GenericConv::new(p)?)
        };
        Ok(Self { inner })
    }

    pub fn param(&self) -> &ConvParam {
        match &self.inner {
            Inner::NhwcGemm(c) => c.param(),
            Inner::Gemm(c) => c.param(),
        }
    }

    /// Engine and strategy in use, e.g. `nhwc-gemm[amx, NoDilation]`.
    pub fn description(&self) -> String {
        match &self.inner {
            Inner::NhwcGemm(c) => c.description(),
            Inner::Gemm(_) => "generic-gemm".to_string(),
        }
    }

    /// The NHWC GEMM engine, when selected.
    pub fn nhwc_gemm(&self) -> Option<&NhwcGemm> {
        match &self.inner {
            Inner::NhwcGemm(c) => Some(c),
            Inner::Gemm(_) => None,
        }
    }

    /// Bytes a caller-provided `forward` buffer must hold.
    pub fn external_buffer_size(&self) -> usize {
        match &self.inner {
            Inner::NhwcGemm(c) => c.external_buffer_size(),
            Inner::Gemm(c) => c.external_buffer_size(),
        }
    }

    /// Sets fp32 weights, optional bias (`dstC`) and activation parameters.
    /// Weight layout follows [`TensorLayout`].
    pub fn set_params(&mut self, weight: &[f32], bias: Option<&[f32]>, params: &[f32]) -> ConvResult<()> {
        match &mut self.inner {
            Inner::NhwcGemm(c) => c.set_params(weight, bias, params),
            Inner::Gemm(c) => c.set_params(weight, bias, params),
        }
    }

    pub fn forward(&mut self, src: Tensor<'_>, buf: Option<&mut [u8]>, dst: TensorMut<'_>) -> ConvResult<()> {
        match &mut self.inner {
            Inner::NhwcGemm(c) => c.forward(src, buf, dst),
            Inner::Gemm(c) => c.forward(src, buf, dst),
        }
    }

    /// Forward over output rows `rows` (across the batch); see
    /// [`NhwcGemm::forward_rows`]. Only the NHWC GEMM engine supports it.
    pub fn forward_rows(&self, src: Tensor<'_>, dst: TensorMut<'_>, rows: std::ops::Range<usize>, scratch: &mut Scratch) -> ConvResult<()> {
        self.partitionable()?.forward_rows(src, dst, rows, scratch)
    }

    /// Forward with output rows split across the rayon pool.
    pub fn forward_parallel(&self, src: Tensor<'_>, dst: TensorMut<'_>, tasks: usize) -> ConvResult<()> {
        self.partitionable()?.forward_parallel(src, dst, tasks)
    }

    fn partitionable(&self) -> ConvResult<&NhwcGemm> {
        self.nhwc_gemm()
            .ok_or_else(|| ConvError::Unsupported("row partitioning needs the NHWC GEMM engine".into()))
    }
}
