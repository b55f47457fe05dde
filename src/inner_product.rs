//! `C[M, N] = activation(A[M, K] x B[K, N] + bias)` in bf16 with fp32
//! accumulation, run as a 1x1 convolution over `M` positions.
//!
//! B is either constant, packed once by [`InnerProduct16b::set_params`], or
//! supplied with every [`InnerProduct16b::forward_with_b`] call as fp32 or
//! bf16 and packed into the forward buffer.

use crate::activation::ActivationKind;
use crate::config::ConvOptions;
use crate::conv::{ConvParam, NhwcGemm, Tensor, TensorMut, TensorType};
use crate::error::{ConvError, ConvResult};

pub struct InnerProduct16b {
    m: usize,
    n: usize,
    k: usize,
    /// Element type of a runtime B; `None` when B is constant.
    runtime_b: Option<TensorType>,
    conv: NhwcGemm,
}

impl InnerProduct16b {
    pub fn new(m: usize, n: usize, k: usize, a_type: TensorType, c_type: TensorType, activation: ActivationKind) -> ConvResult<Self> {
        Self::with_options(m, n, k, a_type, c_type, activation, &ConvOptions::default())
    }

    pub fn with_options(
        m: usize,
        n: usize,
        k: usize,
        a_type: TensorType,
        c_type: TensorType,
        activation: ActivationKind,
        options: &ConvOptions,
    ) -> ConvResult<Self> {
        Ok(Self {
            m,
            n,
            k,
            runtime_b: None,
            conv: Self::gemm(m, n, k, a_type, c_type, activation, options)?,
        })
    }

    /// Product whose B of type `b_type` arrives with each forward call.
    /// Bias and activation parameters still come from
    /// [`InnerProduct16b::set_params`] with an empty B; activations without
    /// parameters are ready to run without it.
    #[allow(clippy::too_many_arguments)]
    pub fn with_runtime_b(
        m: usize,
        n: usize,
        k: usize,
        a_type: TensorType,
        b_type: TensorType,
        c_type: TensorType,
        activation: ActivationKind,
        options: &ConvOptions,
    ) -> ConvResult<Self> {
        let mut conv = Self::gemm(m, n, k, a_type, c_type, activation, options)?;
        if conv.set_post_params(None, &[]).is_err() {
            log::debug!("inner product {m}x{n}x{k}: {activation:?} waits for its parameters");
        }
        Ok(Self { m, n, k, runtime_b: Some(b_type), conv })
    }

    fn gemm(
        m: usize,
        n: usize,
        k: usize,
        a_type: TensorType,
        c_type: TensorType,
        activation: ActivationKind,
        options: &ConvOptions,
    ) -> ConvResult<NhwcGemm> {
        // one column per position so the row blocking splits M
        let p = ConvParam::new(1, k, m, 1, n).activation(activation).types(a_type, c_type);
        NhwcGemm::new(&p, options)
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.m, self.n, self.k)
    }

    pub fn const_b(&self) -> bool {
        self.runtime_b.is_none()
    }

    pub fn description(&self) -> String {
        let b = if self.const_b() { "const-b" } else { "runtime-b" };
        format!("inner-product-{}x{}x{} {b} {}", self.m, self.n, self.k, self.conv.description())
    }

    /// Includes room for packing B when it is supplied per call.
    pub fn external_buffer_size(&self) -> usize {
        match self.runtime_b {
            None => self.conv.external_buffer_size(),
            Some(_) => self.conv.weight_buffer_size() + self.conv.external_buffer_size(),
        }
    }

    /// `b` is `[K][N]`, or empty for a runtime B.
    pub fn set_params(&mut self, b: &[f32], bias: Option<&[f32]>, params: &[f32]) -> ConvResult<()> {
        match self.runtime_b {
            None => self.conv.set_params(b, bias, params),
            Some(_) if b.is_empty() => self.conv.set_post_params(bias, params),
            Some(_) => Err(ConvError::InvalidParam("B is supplied with each forward call".into())),
        }
    }

    /// Forward with the constant B.
    pub fn forward(&mut self, a: Tensor<'_>, buf: Option<&mut [u8]>, c: TensorMut<'_>) -> ConvResult<()> {
        if !self.const_b() {
            return Err(ConvError::InvalidParam("runtime B needs forward_with_b".into()));
        }
        self.conv.forward(a, buf, c)
    }

    /// Forward with `b` (`[K][N]`) packed into `buf`, or into the internal
    /// buffer when `buf` is `None`.
    pub fn forward_with_b(&mut self, a: Tensor<'_>, b: Tensor<'_>, buf: Option<&mut [u8]>, c: TensorMut<'_>) -> ConvResult<()> {
        let Some(b_type) = self.runtime_b else {
            return Err(ConvError::InvalidParam("B is constant; use forward".into()));
        };
        if b.ty() != b_type {
            return Err(ConvError::TypeMismatch { what: "b", expected: b_type, actual: b.ty() });
        }
        self.conv.forward_with_weight(a, b, buf, c)
    }
}

#[cfg(test)]
mod tests {
    use half::bf16;

    use super::*;
    use crate::bf16::round_to_bf16;
    use crate::config::EngineKind;

    fn expected(a: &[f32], b: &[f32], bias: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
        let mut c = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for kk in 0..k {
                    acc += round_to_bf16(a[i * k + kk]) * round_to_bf16(b[kk * n + j]);
                }
                c[i * n + j] = (acc + bias[j]).max(0.0);
            }
        }
        c
    }

    #[test]
    fn test_small_product_with_bias_and_relu() {
        let (m, n, k) = (3, 5, 7);
        let opts = ConvOptions::default().engine(EngineKind::Portable);
        let mut ip = InnerProduct16b::with_options(m, n, k, TensorType::F32, TensorType::F32, ActivationKind::Relu, &opts).unwrap();
        let a: Vec<f32> = (0..m * k).map(|i| (i % 5) as f32 - 2.0).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 3) as f32 * 0.5).collect();
        let bias: Vec<f32> = (0..n).map(|j| j as f32 - 2.0).collect();
        ip.set_params(&b, Some(&bias), &[]).unwrap();
        let mut c = vec![0.0f32; m * n];
        ip.forward(Tensor::F32(&a), None, TensorMut::F32(&mut c)).unwrap();
        let expect = expected(&a, &b, &bias, m, n, k);
        for (i, (&got, &want)) in c.iter().zip(&expect).enumerate() {
            assert!((got - want).abs() < 1e-4, "{i}: {got} vs {want}");
        }
    }

    #[test]
    fn test_runtime_b_changes_between_calls() {
        let (m, n, k) = (4, 6, 9);
        let opts = ConvOptions::default().engine(EngineKind::Portable);
        let mut ip =
            InnerProduct16b::with_runtime_b(m, n, k, TensorType::F32, TensorType::Bf16, TensorType::F32, ActivationKind::Relu, &opts)
                .unwrap();
        assert!(!ip.const_b());
        let bias: Vec<f32> = (0..n).map(|j| j as f32 * 0.25).collect();
        ip.set_params(&[], Some(&bias), &[]).unwrap();
        let a: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32 - 3.0).collect();
        for round in 0..2 {
            let b: Vec<f32> = (0..k * n).map(|i| ((i + round * 5) % 4) as f32 - 1.5).collect();
            let b16: Vec<bf16> = b.iter().map(|&v| bf16::from_f32(v)).collect();
            let mut c = vec![f32::NAN; m * n];
            ip.forward_with_b(Tensor::F32(&a), Tensor::Bf16(&b16), None, TensorMut::F32(&mut c)).unwrap();
            let expect = expected(&a, &b, &bias, m, n, k);
            for (i, (&got, &want)) in c.iter().zip(&expect).enumerate() {
                assert!((got - want).abs() < 1e-4, "round {round} element {i}: {got} vs {want}");
            }
        }
    }

    #[test]
    fn test_b_mode_is_enforced() {
        let opts = ConvOptions::default().engine(EngineKind::Portable);
        let mut runtime =
            InnerProduct16b::with_runtime_b(2, 2, 2, TensorType::F32, TensorType::F32, TensorType::F32, ActivationKind::Identity, &opts)
                .unwrap();
        let mut c = vec![0.0f32; 4];
        let a = [1.0f32; 4];
        assert!(runtime.set_params(&[1.0; 4], None, &[]).is_err());
        assert!(runtime.forward(Tensor::F32(&a), None, TensorMut::F32(&mut c)).is_err());
        let b16 = [bf16::ONE; 4];
        assert!(matches!(
            runtime.forward_with_b(Tensor::F32(&a), Tensor::Bf16(&b16), None, TensorMut::F32(&mut c)),
            Err(ConvError::TypeMismatch { what: "b", .. })
        ));
        assert!(matches!(
            runtime.forward_with_b(Tensor::F32(&a), Tensor::F32(&[1.0; 3]), None, TensorMut::F32(&mut c)),
            Err(ConvError::SizeMismatch { what: "weight", .. })
        ));

        let mut constant =
            InnerProduct16b::with_options(2, 2, 2, TensorType::F32, TensorType::F32, ActivationKind::Identity, &opts).unwrap();
        constant.set_params(&[1.0; 4], None, &[]).unwrap();
        assert!(constant.forward_with_b(Tensor::F32(&a), Tensor::F32(&[1.0; 4]), None, TensorMut::F32(&mut c)).is_err());
    }
}
