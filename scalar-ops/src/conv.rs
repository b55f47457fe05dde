//! Direct convolution, NHWC, weights `[kY][kX][srcC/group][dstC]`.

use crate::activations::{scalar_activate, Activation};

#[derive(Debug, Clone, Copy)]
pub struct ConvShape {
    pub batch: usize,
    pub src_c: usize,
    pub src_h: usize,
    pub src_w: usize,
    pub dst_c: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    /// top, left, bottom, right
    pub pad: (usize, usize, usize, usize),
    pub group: usize,
}

impl ConvShape {
    pub fn dst_h(&self) -> usize {
        (self.src_h + self.pad.0 + self.pad.2 - (self.dilation.0 * (self.kernel.0 - 1) + 1)) / self.stride.0 + 1
    }

    pub fn dst_w(&self) -> usize {
        (self.src_w + self.pad.1 + self.pad.3 - (self.dilation.1 * (self.kernel.1 - 1) + 1)) / self.stride.1 + 1
    }
}

/// `dst = activation(conv(src, weight) + bias)` in fp64 accumulation.
#[inline(never)]
pub fn scalar_conv_nhwc(
    s: &ConvShape,
    src: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    activation: Activation,
    params: &[f32],
) -> Vec<f32> {
    let (dst_h, dst_w) = (s.dst_h(), s.dst_w());
    let cg = s.src_c / s.group;
    let dg = s.dst_c / s.group;
    let mut dst = vec![0.0f32; s.batch * dst_h * dst_w * s.dst_c];
    for b in 0..s.batch {
        for dy in 0..dst_h {
            for dx in 0..dst_w {
                for d in 0..s.dst_c {
                    let g = d / dg;
                    let mut acc = 0.0f64;
                    for ky in 0..s.kernel.0 {
                        let sy = (dy * s.stride.0 + ky * s.dilation.0) as isize - s.pad.0 as isize;
                        if sy < 0 || sy >= s.src_h as isize {
                            continue;
                        }
                        for kx in 0..s.kernel.1 {
                            let sx = (dx * s.stride.1 + kx * s.dilation.1) as isize - s.pad.1 as isize;
                            if sx < 0 || sx >= s.src_w as isize {
                                continue;
                            }
                            for c in 0..cg {
                                let si = ((b * s.src_h + sy as usize) * s.src_w + sx as usize) * s.src_c + g * cg + c;
                                let wi = ((ky * s.kernel.1 + kx) * cg + c) * s.dst_c + d;
                                acc += src[si] as f64 * weight[wi] as f64;
                            }
                        }
                    }
                    let v = acc as f32 + bias.map_or(0.0, |bias| bias[d]);
                    dst[((b * dst_h + dy) * dst_w + dx) * s.dst_c + d] = scalar_activate(activation, v, params, d);
                }
            }
        }
    }
    dst
}

/// Transposed convolution, NHWC, weights `[srcC][kY][kX][dstC]`, in fp64
/// accumulation. `dst_h`/`dst_w` are the destination extents; each output
/// pixel gathers the source pixels whose kernel footprint covers it.
#[inline(never)]
#[allow(clippy::too_many_arguments)]
pub fn scalar_deconv_nhwc(
    s: &ConvShape,
    dst_h: usize,
    dst_w: usize,
    src: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    activation: Activation,
    params: &[f32],
) -> Vec<f32> {
    assert_eq!(s.group, 1);
    let mut dst = vec![0.0f32; s.batch * dst_h * dst_w * s.dst_c];
    for b in 0..s.batch {
        for dy in 0..dst_h {
            for dx in 0..dst_w {
                for d in 0..s.dst_c {
                    let mut acc = 0.0f64;
                    for ky in 0..s.kernel.0 {
                        // dy + padY = sy * strideY + ky * dilationY
                        let Some(ty) = (dy + s.pad.0).checked_sub(ky * s.dilation.0) else { continue };
                        if ty % s.stride.0 != 0 || ty / s.stride.0 >= s.src_h {
                            continue;
                        }
                        let sy = ty / s.stride.0;
                        for kx in 0..s.kernel.1 {
                            let Some(tx) = (dx + s.pad.1).checked_sub(kx * s.dilation.1) else { continue };
                            if tx % s.stride.1 != 0 || tx / s.stride.1 >= s.src_w {
                                continue;
                            }
                            let sx = tx / s.stride.1;
                            for c in 0..s.src_c {
                                let si = ((b * s.src_h + sy) * s.src_w + sx) * s.src_c + c;
                                let wi = ((c * s.kernel.0 + ky) * s.kernel.1 + kx) * s.dst_c + d;
                                acc += src[si] as f64 * weight[wi] as f64;
                            }
                        }
                    }
                    let v = acc as f32 + bias.map_or(0.0, |bias| bias[d]);
                    dst[((b * dst_h + dy) * dst_w + dx) * s.dst_c + d] = scalar_activate(activation, v, params, d);
                }
            }
        }
    }
    dst
}
