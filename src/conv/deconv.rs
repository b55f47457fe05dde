//! NHWC deconvolution (transposed convolution) on the GEMM engine.
//!
//! One image is a single GEMM `rows[srcH*srcW, kY*kX*dstC] = src x weight`
//! run through [`NhwcGemm`] as a 1x1 convolution with fp32 output. The rows
//! are then scattered and summed into the destination (col2im), and bias plus
//! activation are applied per pixel.
//!
//! `ConvParam` is read with deconvolution geometry: `src_*` describe the
//! input, and the destination extent is
//! `stride * (src - 1) + dilation * (kernel - 1) + 1 - pad_begin - pad_end`.
//! Weights are `[srcC][kY][kX][dstC]`.

use super::nhwc_gemm::NhwcGemm;
use super::param::{align_hi, ConvParam, TensorLayout, TensorType};
use super::{Tensor, TensorMut};
use crate::activation::{ActivationKind, ActivationParams};
use crate::cache_params::AlignedVec;
use crate::config::ConvOptions;
use crate::error::{ConvError, ConvResult};
use crate::kernels::PostOp;

const ALIGN: usize = 64;

fn dst_extent(src: usize, stride: usize, kernel: usize, dilation: usize, pad_begin: usize, pad_end: usize) -> Option<usize> {
    let full = stride
        .checked_mul(src.checked_sub(1)?)?
        .checked_add(dilation.checked_mul(kernel.checked_sub(1)?)?)?
        .checked_add(1)?;
    full.checked_sub(pad_begin)?.checked_sub(pad_end)
}

struct Post {
    bias: Vec<f32>,
    act: ActivationParams,
    op: PostOp,
}

pub struct Deconvolution16b {
    p: ConvParam,
    dst_h: usize,
    dst_w: usize,
    gemm: NhwcGemm,
    post: Option<Post>,
    scratch: AlignedVec<u8>,
}

impl Deconvolution16b {
    pub fn new(p: &ConvParam) -> ConvResult<Self> {
        Self::with_options(p, &ConvOptions::default())
    }

    pub fn with_options(p: &ConvParam, options: &ConvOptions) -> ConvResult<Self> {
        let dims = [
            ("batch", p.batch),
            ("src_c", p.src_c),
            ("src_h", p.src_h),
            ("src_w", p.src_w),
            ("dst_c", p.dst_c),
            ("kernel_y", p.kernel_y),
            ("kernel_x", p.kernel_x),
            ("stride_y", p.stride_y),
            ("stride_x", p.stride_x),
            ("dilation_y", p.dilation_y),
            ("dilation_x", p.dilation_x),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(ConvError::InvalidParam(format!("{name} must be > 0")));
        }
        if p.layout != TensorLayout::Nhwc || p.group != 1 {
            return Err(ConvError::Unsupported(format!("deconvolution needs NHWC layout and group 1: {}", p.info())));
        }
        let dst_h = dst_extent(p.src_h, p.stride_y, p.kernel_y, p.dilation_y, p.pad_y, p.pad_h).unwrap_or(0);
        let dst_w = dst_extent(p.src_w, p.stride_x, p.kernel_x, p.dilation_x, p.pad_x, p.pad_w).unwrap_or(0);
        if dst_h == 0 || dst_w == 0 {
            return Err(ConvError::InvalidParam(format!("padding removes the whole deconvolution output: {}", p.info())));
        }
        let n = p.kernel_y * p.kernel_x * p.dst_c;
        let gemm_p = ConvParam::new(1, p.src_c, p.src_h, p.src_w, n).types(p.src_type, TensorType::F32);
        let gemm = NhwcGemm::new(&gemm_p, options)?;
        log::debug!("deconv {} -> {dst_h}x{dst_w}: {}", p.info(), gemm.description());
        Ok(Self {
            p: *p,
            dst_h,
            dst_w,
            gemm,
            post: None,
            scratch: AlignedVec::new(),
        })
    }

    pub fn param(&self) -> &ConvParam {
        &self.p
    }

    pub fn dst_h(&self) -> usize {
        self.dst_h
    }

    pub fn dst_w(&self) -> usize {
        self.dst_w
    }

    /// Destination elements of one image.
    pub fn dst_size(&self) -> usize {
        self.dst_h * self.dst_w * self.p.dst_c
    }

    pub fn weight_size(&self) -> usize {
        self.p.src_c * self.p.kernel_y * self.p.kernel_x * self.p.dst_c
    }

    pub fn description(&self) -> String {
        format!("deconv-{}", self.gemm.description())
    }

    /// GEMM rows and col2im accumulator, in floats.
    fn work_elems(&self) -> (usize, usize) {
        let p = &self.p;
        (p.src_h * p.src_w * p.kernel_y * p.kernel_x * p.dst_c, self.dst_size())
    }

    pub fn external_buffer_size(&self) -> usize {
        let (rows, acc) = self.work_elems();
        self.gemm.external_buffer_size() + ALIGN + align_hi(rows * 4, ALIGN) + acc * 4
    }

    /// Sets weights (`[srcC][kY][kX][dstC]`), optional bias and activation
    /// parameters.
    pub fn set_params(&mut self, weight: &[f32], bias: Option<&[f32]>, params: &[f32]) -> ConvResult<()> {
        let p = &self.p;
        if weight.len() != self.weight_size() {
            return Err(ConvError::size("weight", self.weight_size(), weight.len()));
        }
        let mut padded_bias = vec![0.0; p.dst_c];
        if let Some(bias) = bias {
            if bias.len() != p.dst_c {
                return Err(ConvError::size("bias", p.dst_c, bias.len()));
            }
            padded_bias.copy_from_slice(bias);
        }
        let act = ActivationParams::new(p.activation, params, p.dst_c, 1)?;
        let op = PostOp::new(&act, p.dst_type);
        // the scatter happens after the GEMM, so its own epilogue stays identity
        self.gemm.set_params(weight, None, &[])?;
        self.post = Some(Post { bias: padded_bias, act, op });
        Ok(())
    }

    pub fn forward(&mut self, src: Tensor<'_>, buf: Option<&mut [u8]>, dst: TensorMut<'_>) -> ConvResult<()> {
        match buf {
            Some(bytes) => self.run(src, bytes, dst),
            None => {
                let mut scratch = std::mem::take(&mut self.scratch);
                scratch.ensure_len(self.external_buffer_size());
                let result = self.run(src, scratch.as_mut_slice(), dst);
                self.scratch = scratch;
                result
            }
        }
    }

    fn run(&mut self, src: Tensor<'_>, bytes: &mut [u8], mut dst: TensorMut<'_>) -> ConvResult<()> {
        let p = self.p;
        if self.post.is_none() {
            return Err(ConvError::ParamsNotSet);
        }
        if src.ty() != p.src_type {
            return Err(ConvError::TypeMismatch { what: "src", expected: p.src_type, actual: src.ty() });
        }
        if dst.ty() != p.dst_type {
            return Err(ConvError::TypeMismatch { what: "dst", expected: p.dst_type, actual: dst.ty() });
        }
        if src.len() != p.batch * p.src_size() {
            return Err(ConvError::size("src", p.batch * p.src_size(), src.len()));
        }
        if dst.len() != p.batch * self.dst_size() {
            return Err(ConvError::size("dst", p.batch * self.dst_size(), dst.len()));
        }
        let required = self.external_buffer_size();
        if bytes.len() < required {
            return Err(ConvError::BufferTooSmall { required, actual: bytes.len() });
        }
        let (gemm_bytes, rest) = bytes.split_at_mut(self.gemm.external_buffer_size());
        let (rows_len, acc_len) = self.work_elems();
        let offset = rest.as_ptr().align_offset(ALIGN);
        let (rows_bytes, acc_bytes) = rest[offset..].split_at_mut(align_hi(rows_len * 4, ALIGN));
        let misaligned = |_| ConvError::InvalidParam("forward buffer is not aligned".into());
        let rows = bytemuck::try_cast_slice_mut::<u8, f32>(&mut rows_bytes[..rows_len * 4]).map_err(misaligned)?;
        let acc = bytemuck::try_cast_slice_mut::<u8, f32>(&mut acc_bytes[..acc_len * 4]).map_err(misaligned)?;

        let (src_size, dst_size) = (p.src_size(), self.dst_size());
        for b in 0..p.batch {
            let image = match src {
                Tensor::F32(s) => Tensor::F32(&s[b * src_size..(b + 1) * src_size]),
                Tensor::Bf16(s) => Tensor::Bf16(&s[b * src_size..(b + 1) * src_size]),
            };
            self.gemm.forward(image, Some(&mut *gemm_bytes), TensorMut::F32(&mut *rows))?;
            self.rows_to_image(rows, acc);
            let out = match &mut dst {
                TensorMut::F32(d) => bytemuck::cast_slice_mut::<f32, u8>(&mut d[b * dst_size..(b + 1) * dst_size]),
                TensorMut::Bf16(d) => bytemuck::cast_slice_mut::<_, u8>(&mut d[b * dst_size..(b + 1) * dst_size]),
            };
            self.bias_activation(acc, out);
        }
        Ok(())
    }

    /// Sums every GEMM row's `kY * kX` channel blocks into the output pixels
    /// they land on. Positions cut off by padding are skipped.
    fn rows_to_image(&self, rows: &[f32], acc: &mut [f32]) {
        let p = &self.p;
        let dst_c = p.dst_c;
        acc.fill(0.0);
        let mut chunks = rows.chunks_exact(dst_c);
        for sy in 0..p.src_h {
            for sx in 0..p.src_w {
                for ky in 0..p.kernel_y {
                    let dy = (sy * p.stride_y + ky * p.dilation_y).checked_sub(p.pad_y).filter(|&y| y < self.dst_h);
                    for kx in 0..p.kernel_x {
                        let dx = (sx * p.stride_x + kx * p.dilation_x).checked_sub(p.pad_x).filter(|&x| x < self.dst_w);
                        let Some(row) = chunks.next() else { return };
                        if let (Some(dy), Some(dx)) = (dy, dx) {
                            let d = &mut acc[(dy * self.dst_w + dx) * dst_c..][..dst_c];
                            for (d, s) in d.iter_mut().zip(row) {
                                *d += s;
                            }
                        }
                    }
                }
            }
        }
    }

    fn bias_activation(&self, acc: &[f32], out: &mut [u8]) {
        let Some(post) = &self.post else { return };
        let dst_c = self.p.dst_c;
        let pixel_bytes = dst_c * self.p.dst_type.size();
        for (src, dst) in acc.chunks_exact(dst_c).zip(out.chunks_exact_mut(pixel_bytes)) {
            // SAFETY: one pixel of accumulators, bias and per-channel params
            // hold dst_c floats, and `dst` holds dst_c destination elements.
            unsafe {
                post.op
                    .apply_row(src.as_ptr(), dst_c, post.bias.as_ptr(), post.act.as_slice().as_ptr(), dst.as_mut_ptr())
            };
        }
    }
}

impl std::fmt::Debug for Deconvolution16b {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deconvolution16b")
            .field("param", &self.p.info())
            .field("dst", &(self.dst_h, self.dst_w))
            .field("activation", &self.post.as_ref().map(|p| p.act.kind()).unwrap_or(ActivationKind::Identity))
            .finish()
    }
}
