//! Generic convolution for geometries the NHWC GEMM engine does not take:
//! grouped convolutions and the NCHW layout.
//!
//! Source and weights are rounded to bf16 first, receptive fields are
//! unrolled per group (im2row for NHWC, im2col for NCHW) and reduced with a
//! scalar GEMM in fp32.

use super::param::{ConvParam, TensorLayout};
use super::{Tensor, TensorMut};
use crate::activation::activate;
use crate::bf16::{bfloat16_to_float32, float32_to_bfloat16, to_bf16};
use crate::error::{ConvError, ConvResult};

pub struct GenericConv {
    p: ConvParam,
    weight: Vec<f32>,
    bias: Vec<f32>,
    params: Vec<f32>,
    ready: bool,
    buffer: Vec<f32>,
}

impl GenericConv {
    pub fn new(p: &ConvParam) -> ConvResult<Self> {
        p.validate()?;
        log::debug!("generic conv {}", p.info());
        Ok(Self {
            p: *p,
            weight: Vec::new(),
            bias: vec![0.0; p.dst_c],
            params: Vec::new(),
            ready: false,
            buffer: Vec::new(),
        })
    }

    pub fn param(&self) -> &ConvParam {
        &self.p
    }

    fn group_k(&self) -> usize {
        self.p.src_c / self.p.group * self.p.kernel_y * self.p.kernel_x
    }

    /// Elements of the rounded source image, one group's unrolled matrix and
    /// one fp32 output image.
    fn buffer_elems(&self) -> usize {
        self.p.src_size() + self.p.dst_h() * self.p.dst_w() * self.group_k() + self.p.dst_size()
    }

    pub fn external_buffer_size(&self) -> usize {
        self.buffer_elems() * 4 + 64
    }

    pub fn set_params(&mut self, weight: &[f32], bias: Option<&[f32]>, params: &[f32]) -> ConvResult<()> {
        let p = &self.p;
        if weight.len() != p.weight_size() {
            return Err(ConvError::size("weight", p.weight_size(), weight.len()));
        }
        let needed = p.activation.param_count(p.dst_c);
        if params.len() < needed {
            return Err(ConvError::InvalidParam(format!("{} needs {needed} parameters, got {}", p.activation, params.len())));
        }
        match bias {
            Some(b) if b.len() != p.dst_c => return Err(ConvError::size("bias", p.dst_c, b.len())),
            Some(b) => self.bias.copy_from_slice(b),
            None => self.bias.fill(0.0),
        }
        self.weight = weight.iter().map(|&w| bfloat16_to_float32(float32_to_bfloat16(w))).collect();
        self.params = params[..needed].to_vec();
        self.ready = true;
        Ok(())
    }

    pub fn forward(&mut self, src: Tensor<'_>, buf: Option<&mut [u8]>, mut dst: TensorMut<'_>) -> ConvResult<()> {
        let p = self.p;
        if !self.ready {
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
        if dst.len() != p.batch * p.dst_size() {
            return Err(ConvError::size("dst", p.batch * p.dst_size(), dst.len()));
        }

        let elems = self.buffer_elems();
        let mut internal = std::mem::take(&mut self.buffer);
        let work: &mut [f32] = match buf {
            Some(bytes) => {
                let required = self.external_buffer_size();
                if bytes.len() < required {
                    return Err(ConvError::BufferTooSmall { required, actual: bytes.len() });
                }
                let offset = bytes.as_ptr().align_offset(4);
                bytemuck::try_cast_slice_mut(&mut bytes[offset..offset + elems * 4])
                    .map_err(|_| ConvError::InvalidParam("forward buffer is not aligned".into()))?
            }
            None => {
                if internal.len() < elems {
                    log::trace!("generic conv buffer grew to {elems} floats");
                    internal.resize(elems, 0.0);
                }
                &mut internal[..elems]
            }
        };

        let (image, rest) = work.split_at_mut(p.src_size());
        let (out, unrolled) = rest.split_at_mut(p.dst_size());
        for b in 0..p.batch {
            let range = b * p.src_size()..(b + 1) * p.src_size();
            match src {
                Tensor::F32(s) => {
                    for (d, &v) in image.iter_mut().zip(&s[range]) {
                        *d = bfloat16_to_float32(float32_to_bfloat16(v));
                    }
                }
                Tensor::Bf16(s) => {
                    for (d, v) in image.iter_mut().zip(&s[range]) {
                        *d = v.to_f32();
                    }
                }
            }
            for g in 0..p.group {
                match p.layout {
                    TensorLayout::Nhwc => {
                        self.im2row(image, g, unrolled);
                        self.gemm_nhwc(unrolled, g, out);
                    }
                    TensorLayout::Nchw => {
                        self.im2col(image, g, unrolled);
                        self.gemm_nchw(unrolled, g, out);
                    }
                }
            }
            let dst_range = b * p.dst_size()..(b + 1) * p.dst_size();
            match dst {
                TensorMut::F32(ref mut d) => d[dst_range].copy_from_slice(out),
                TensorMut::Bf16(ref mut d) => {
                    for (o, &v) in d[dst_range].iter_mut().zip(out.iter()) {
                        *o = to_bf16(v);
                    }
                }
            }
        }
        self.buffer = internal;
        Ok(())
    }

    /// Source value at `(c, sy, sx)`, zero in the padding.
    fn pixel(&self, image: &[f32], c: usize, dy: usize, dx: usize, ky: usize, kx: usize) -> f32 {
        let p = &self.p;
        let sy = (dy * p.stride_y + ky * p.dilation_y).checked_sub(p.pad_y).filter(|&v| v < p.src_h);
        let sx = (dx * p.stride_x + kx * p.dilation_x).checked_sub(p.pad_x).filter(|&v| v < p.src_w);
        match (sy, sx, p.layout) {
            (Some(sy), Some(sx), TensorLayout::Nhwc) => image[(sy * p.src_w + sx) * p.src_c + c],
            (Some(sy), Some(sx), TensorLayout::Nchw) => image[(c * p.src_h + sy) * p.src_w + sx],
            _ => 0.0,
        }
    }

    /// Rows are output positions, columns `(ky, kx, c)` of group `g`.
    fn im2row(&self, image: &[f32], g: usize, out: &mut [f32]) {
        let p = &self.p;
        let cg = p.src_c / p.group;
        let mut i = 0;
        for dy in 0..p.dst_h() {
            for dx in 0..p.dst_w() {
                for ky in 0..p.kernel_y {
                    for kx in 0..p.kernel_x {
                        for c in 0..cg {
                            out[i] = self.pixel(image, g * cg + c, dy, dx, ky, kx);
                            i += 1;
                        }
                    }
                }
            }
        }
    }

    /// Rows are `(c, ky, kx)` of group `g`, columns output positions.
    fn im2col(&self, image: &[f32], g: usize, out: &mut [f32]) {
        let p = &self.p;
        let cg = p.src_c / p.group;
        let mut i = 0;
        for c in 0..cg {
            for ky in 0..p.kernel_y {
                for kx in 0..p.kernel_x {
                    for dy in 0..p.dst_h() {
                        for dx in 0..p.dst_w() {
                            out[i] = self.pixel(image, g * cg + c, dy, dx, ky, kx);
                            i += 1;
                        }
                    }
                }
            }
        }
    }

    fn finish(&self, acc: f32, d: usize) -> f32 {
        activate(self.p.activation, acc + self.bias[d], &self.params, d)
    }

    /// Weights `[kY][kX][srcC/group][dstC]`.
    fn gemm_nhwc(&self, rows: &[f32], g: usize, out: &mut [f32]) {
        let p = &self.p;
        let (k, dg) = (self.group_k(), p.dst_c / p.group);
        for (m, row) in rows.chunks_exact(k).enumerate() {
            for d in g * dg..(g + 1) * dg {
                let mut acc = 0.0f32;
                for (i, &a) in row.iter().enumerate() {
                    acc += a * self.weight[i * p.dst_c + d];
                }
                out[m * p.dst_c + d] = self.finish(acc, d);
            }
        }
    }

    /// Weights `[dstC][srcC/group][kY][kX]`.
    fn gemm_nchw(&self, cols: &[f32], g: usize, out: &mut [f32]) {
        let p = &self.p;
        let (k, dg) = (self.group_k(), p.dst_c / p.group);
        let m = p.dst_h() * p.dst_w();
        for d in g * dg..(g + 1) * dg {
            let w = &self.weight[d * k..(d + 1) * k];
            for pos in 0..m {
                let mut acc = 0.0f32;
                for (i, &wv) in w.iter().enumerate() {
                    acc += cols[i * m + pos] * wv;
                }
                out[d * m + pos] = self.finish(acc, d);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::TensorType;

    #[test]
    fn test_grouped_depthwise_nhwc() {
        // depthwise 3x3, every weight 1: output = sum of the valid neighbourhood
        let p = ConvParam::new(1, 2, 3, 3, 2).kernel(3, 3).pad(1).group(2);
        let mut conv = GenericConv::new(&p).unwrap();
        conv.set_params(&vec![1.0; p.weight_size()], None, &[]).unwrap();
        let src: Vec<f32> = (0..18).map(|i| if i % 2 == 0 { 1.0 } else { 2.0 }).collect();
        let mut dst = vec![0.0f32; p.dst_size()];
        conv.forward(Tensor::F32(&src), None, TensorMut::F32(&mut dst)).unwrap();
        // centre sees 9 taps, corner 4
        assert_eq!(dst[4 * 2], 9.0);
        assert_eq!(dst[4 * 2 + 1], 18.0);
        assert_eq!(dst[0], 4.0);
        assert_eq!(dst[1], 8.0);
    }

    #[test]
    fn test_nchw_matches_nhwc() {
        let nhwc = ConvParam::new(2, 4, 5, 5, 6).kernel(3, 3).stride(2, 2).pad(1).group(2);
        let nchw = nhwc.layout(TensorLayout::Nchw);
        let cg = 2;
        let w_nhwc: Vec<f32> = (0..nhwc.weight_size()).map(|i| (i % 9) as f32 * 0.25 - 1.0).collect();
        // [ky][kx][c][d] -> [d][c][ky][kx]
        let mut w_nchw = vec![0.0; w_nhwc.len()];
        for ky in 0..3 {
            for kx in 0..3 {
                for c in 0..cg {
                    for d in 0..6 {
                        w_nchw[((d * cg + c) * 3 + ky) * 3 + kx] = w_nhwc[((ky * 3 + kx) * cg + c) * 6 + d];
                    }
                }
            }
        }
        let src_nhwc: Vec<f32> = (0..2 * nhwc.src_size()).map(|i| (i % 7) as f32 - 3.0).collect();
        let mut src_nchw = vec![0.0; src_nhwc.len()];
        for b in 0..2 {
            for y in 0..5 {
                for x in 0..5 {
                    for c in 0..4 {
                        src_nchw[b * 100 + (c * 5 + y) * 5 + x] = src_nhwc[b * 100 + (y * 5 + x) * 4 + c];
                    }
                }
            }
        }
        let mut a = GenericConv::new(&nhwc).unwrap();
        a.set_params(&w_nhwc, None, &[]).unwrap();
        let mut b = GenericConv::new(&nchw).unwrap();
        b.set_params(&w_nchw, None, &[]).unwrap();
        let mut out_a = vec![0.0; 2 * nhwc.dst_size()];
        let mut out_b = vec![0.0; 2 * nhwc.dst_size()];
        a.forward(Tensor::F32(&src_nhwc), None, TensorMut::F32(&mut out_a)).unwrap();
        b.forward(Tensor::F32(&src_nchw), None, TensorMut::F32(&mut out_b)).unwrap();
        let (h, w) = (nhwc.dst_h(), nhwc.dst_w());
        for bi in 0..2 {
            for y in 0..h {
                for x in 0..w {
                    for d in 0..6 {
                        let va = out_a[bi * nhwc.dst_size() + (y * w + x) * 6 + d];
                        let vb = out_b[bi * nhwc.dst_size() + (d * h + y) * w + x];
                        assert!((va - vb).abs() < 1e-4, "b={bi} y={y} x={x} d={d}: {va} vs {vb}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_type_checked() {
        let p = ConvParam::new(1, 2, 3, 3, 2).group(2).types(TensorType::Bf16, TensorType::F32);
        let mut conv = GenericConv::new(&p).unwrap();
        conv.set_params(&[1.0; 2], None, &[]).unwrap();
        let mut dst = vec![0.0; p.dst_size()];
        let err = conv.forward(Tensor::F32(&[0.0; 18]), None, TensorMut::F32(&mut dst)).unwrap_err();
        assert!(matches!(err, ConvError::TypeMismatch { what: "src", .. }));
    }

    #[test]
    fn test_external_buffer_covers_all_scratch() {
        let p = ConvParam::new(2, 4, 5, 5, 6).kernel(3, 3).pad(1).group(2).types(TensorType::F32, TensorType::Bf16);
        let mut conv = GenericConv::new(&p).unwrap();
        let weight: Vec<f32> = (0..p.weight_size()).map(|i| (i % 5) as f32 * 0.5 - 1.0).collect();
        conv.set_params(&weight, None, &[]).unwrap();
        let src: Vec<f32> = (0..2 * p.src_size()).map(|i| (i % 9) as f32 * 0.25 - 1.0).collect();

        let mut internal = vec![half::bf16::ZERO; 2 * p.dst_size()];
        conv.forward(Tensor::F32(&src), None, TensorMut::Bf16(&mut internal)).unwrap();

        // same buffer twice, misaligned start; stale contents must not leak
        let mut bytes = vec![0xFFu8; conv.external_buffer_size() + 1];
        for _ in 0..2 {
            let mut dst = vec![half::bf16::ZERO; 2 * p.dst_size()];
            conv.forward(Tensor::F32(&src), Some(&mut bytes[1..]), TensorMut::Bf16(&mut dst)).unwrap();
            assert_eq!(dst, internal);
        }
        let short = conv.external_buffer_size() - 1;
        let mut dst = vec![half::bf16::ZERO; 2 * p.dst_size()];
        let err = conv.forward(Tensor::F32(&src), Some(&mut bytes[..short]), TensorMut::Bf16(&mut dst)).unwrap_err();
        assert!(matches!(err, ConvError::BufferTooSmall { .. }));
    }
}
