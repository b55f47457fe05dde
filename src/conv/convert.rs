//! Layout converter: materializes receptive fields as packed bf16 GEMM rows.
//!
//! One packed row per output position: every tap `(ky, kx)` in raster order
//! contributes `srcC` channels (zeros when the tap falls in the padding),
//! followed by a zero gap up to `bufK`.

use std::ops::Range;

use half::bf16;

use super::param::{AlgParam, ConvParam, TensorType};
use crate::bf16::{float32_to_bfloat16, round_row};

/// Source element accepted by the converter.
pub trait SrcElem: Copy + Send + Sync + 'static {
    const TYPE: TensorType;

    /// Writes `src` as bf16 bits: rounds fp32, copies bf16.
    fn pack(src: &[Self], dst: &mut [u16]);

    fn bf16_bits(self) -> u16;
}

impl SrcElem for f32 {
    const TYPE: TensorType = TensorType::F32;

    #[inline]
    fn pack(src: &[f32], dst: &mut [u16]) {
        round_row(src, dst);
    }

    #[inline]
    fn bf16_bits(self) -> u16 {
        float32_to_bfloat16(self)
    }
}

impl SrcElem for bf16 {
    const TYPE: TensorType = TensorType::Bf16;

    #[inline]
    fn pack(src: &[bf16], dst: &mut [u16]) {
        dst.copy_from_slice(bytemuck::cast_slice(src));
    }

    #[inline]
    fn bf16_bits(self) -> u16 {
        self.to_bits()
    }
}

/// Conversion strategy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertKind {
    /// bf16 1x1 source with `K == bufK`: the source already is the packed buffer.
    Identity,
    /// 1x1, stride 1, no padding: one source pixel per row.
    OneByOne,
    /// Undilated kernels: valid tap ranges precomputed, contiguous copies.
    NoDilation,
    /// Per-tap bounds checks.
    General,
}

/// Taps `t` in `0..kernel` with `0 <= origin + t - pad < extent`.
fn valid_taps(origin: usize, pad: usize, kernel: usize, extent: usize) -> (usize, usize) {
    let beg = pad.saturating_sub(origin).min(kernel);
    let end = (extent + pad).saturating_sub(origin).min(kernel).max(beg);
    (beg, end)
}

#[derive(Debug, Clone)]
pub struct Converter {
    kind: ConvertKind,
    p: ConvParam,
    dst_h: usize,
    dst_w: usize,
    k: usize,
    buf_k: usize,
    /// Valid `kx` range per output column (undilated path only).
    kx_ranges: Vec<(usize, usize)>,
}

impl Converter {
    pub fn new(p: &ConvParam, a: &AlgParam) -> Self {
        let kind = if p.is_1x1() {
            if p.src_type == TensorType::Bf16 && a.k == a.buf_k {
                ConvertKind::Identity
            } else {
                ConvertKind::OneByOne
            }
        } else if p.dilation_y == 1 && p.dilation_x == 1 {
            ConvertKind::NoDilation
        } else {
            ConvertKind::General
        };
        let dst_w = p.dst_w();
        let kx_ranges = if kind == ConvertKind::NoDilation {
            (0..dst_w)
                .map(|dx| valid_taps(dx * p.stride_x, p.pad_x, p.kernel_x, p.src_w))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            kind,
            p: *p,
            dst_h: p.dst_h(),
            dst_w,
            k: a.k,
            buf_k: a.buf_k,
            kx_ranges,
        }
    }

    pub fn kind(&self) -> ConvertKind {
        self.kind
    }

    /// Packs output rows `rows` (counted across the whole batch) into `dst`,
    /// which holds `rows.len() * dstW` rows of `bufK` elements.
    pub fn convert<S: SrcElem>(&self, src: &[S], rows: Range<usize>, dst: &mut [u16]) {
        let image_len = self.p.src_size();
        let row_len = self.dst_w * self.buf_k;
        for (y, out) in rows.zip(dst.chunks_exact_mut(row_len)) {
            let image = y / self.dst_h;
            let img = &src[image * image_len..(image + 1) * image_len];
            let dy = y % self.dst_h;
            match self.kind {
                ConvertKind::Identity | ConvertKind::OneByOne => self.one_by_one(img, dy, out),
                ConvertKind::NoDilation => self.no_dilation(img, dy, out),
                ConvertKind::General => self.general(img, dy, out),
            }
        }
    }

    fn one_by_one<S: SrcElem>(&self, img: &[S], dy: usize, out: &mut [u16]) {
        let c = self.p.src_c;
        let pixels = &img[dy * self.p.src_w * c..(dy + 1) * self.p.src_w * c];
        for (px, row) in pixels.chunks_exact(c).zip(out.chunks_exact_mut(self.buf_k)) {
            S::pack(px, &mut row[..c]);
            row[c..].fill(0);
        }
    }

    fn no_dilation<S: SrcElem>(&self, img: &[S], dy: usize, out: &mut [u16]) {
        let p = &self.p;
        let c = p.src_c;
        let tap_row = p.kernel_x * c;
        let (ky_beg, ky_end) = valid_taps(dy * p.stride_y, p.pad_y, p.kernel_y, p.src_h);
        for (dx, row) in out.chunks_exact_mut(self.buf_k).enumerate() {
            let (kx_beg, kx_end) = self.kx_ranges[dx];
            for (ky, seg) in row[..self.k].chunks_exact_mut(tap_row).enumerate() {
                if ky < ky_beg || ky >= ky_end || kx_beg == kx_end {
                    seg.fill(0);
                    continue;
                }
                let sy = dy * p.stride_y + ky - p.pad_y;
                let sx = dx * p.stride_x + kx_beg - p.pad_x;
                let from = (sy * p.src_w + sx) * c;
                seg[..kx_beg * c].fill(0);
                S::pack(&img[from..from + (kx_end - kx_beg) * c], &mut seg[kx_beg * c..kx_end * c]);
                seg[kx_end * c..].fill(0);
            }
            row[self.k..].fill(0);
        }
    }

    fn general<S: SrcElem>(&self, img: &[S], dy: usize, out: &mut [u16]) {
        let p = &self.p;
        let c = p.src_c;
        for (dx, row) in out.chunks_exact_mut(self.buf_k).enumerate() {
            let mut taps = row[..self.k].chunks_exact_mut(c);
            for ky in 0..p.kernel_y {
                let sy = (dy * p.stride_y + ky * p.dilation_y).checked_sub(p.pad_y).filter(|&v| v < p.src_h);
                for kx in 0..p.kernel_x {
                    let sx = (dx * p.stride_x + kx * p.dilation_x).checked_sub(p.pad_x).filter(|&v| v < p.src_w);
                    let Some(seg) = taps.next() else { return };
                    match (sy, sx) {
                        (Some(sy), Some(sx)) => {
                            let from = (sy * p.src_w + sx) * c;
                            S::pack(&img[from..from + c], seg);
                        }
                        _ => seg.fill(0),
                    }
                }
            }
            row[self.k..].fill(0);
        }
    }
}
