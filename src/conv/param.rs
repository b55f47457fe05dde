//! Operator geometry and derived tiling parameters.

use crate::activation::ActivationKind;
use crate::cache_params::CacheSizes;
use crate::error::{ConvError, ConvResult};

/// Element type of a source or destination tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorType {
    F32,
    Bf16,
}

impl TensorType {
    pub fn size(self) -> usize {
        match self {
            TensorType::F32 => 4,
            TensorType::Bf16 => 2,
        }
    }
}

/// Memory layout of source and destination images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorLayout {
    /// Channels last; weights are `[kY][kX][srcC/group][dstC]`.
    Nhwc,
    /// Channels first; weights are `[dstC][srcC/group][kY][kX]`.
    Nchw,
}

/// Immutable convolution geometry.
///
/// Padding is `(top, left, bottom, right)`. Destination extents are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParam {
    pub batch: usize,
    pub src_c: usize,
    pub src_h: usize,
    pub src_w: usize,
    pub dst_c: usize,
    pub kernel_y: usize,
    pub kernel_x: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub dilation_y: usize,
    pub dilation_x: usize,
    pub pad_y: usize,
    pub pad_x: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub group: usize,
    pub layout: TensorLayout,
    pub activation: ActivationKind,
    pub src_type: TensorType,
    pub dst_type: TensorType,
}

impl ConvParam {
    /// A 1x1, stride 1, ungrouped NHWC convolution with fp32 input and output.
    pub fn new(batch: usize, src_c: usize, src_h: usize, src_w: usize, dst_c: usize) -> Self {
        Self {
            batch,
            src_c,
            src_h,
            src_w,
            dst_c,
            kernel_y: 1,
            kernel_x: 1,
            stride_y: 1,
            stride_x: 1,
            dilation_y: 1,
            dilation_x: 1,
            pad_y: 0,
            pad_x: 0,
            pad_h: 0,
            pad_w: 0,
            group: 1,
            layout: TensorLayout::Nhwc,
            activation: ActivationKind::Identity,
            src_type: TensorType::F32,
            dst_type: TensorType::F32,
        }
    }

    pub fn kernel(mut self, ky: usize, kx: usize) -> Self {
        self.kernel_y = ky;
        self.kernel_x = kx;
        self
    }

    pub fn stride(mut self, sy: usize, sx: usize) -> Self {
        self.stride_y = sy;
        self.stride_x = sx;
        self
    }

    pub fn dilation(mut self, dy: usize, dx: usize) -> Self {
        self.dilation_y = dy;
        self.dilation_x = dx;
        self
    }

    /// Same padding on every side.
    pub fn pad(self, p: usize) -> Self {
        self.padding(p, p, p, p)
    }

    pub fn padding(mut self, top: usize, left: usize, bottom: usize, right: usize) -> Self {
        self.pad_y = top;
        self.pad_x = left;
        self.pad_h = bottom;
        self.pad_w = right;
        self
    }

    pub fn group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn activation(mut self, kind: ActivationKind) -> Self {
        self.activation = kind;
        self
    }

    pub fn types(mut self, src: TensorType, dst: TensorType) -> Self {
        self.src_type = src;
        self.dst_type = dst;
        self
    }

    fn dst_extent(src: usize, pad_begin: usize, pad_end: usize, kernel: usize, dilation: usize, stride: usize) -> Option<usize> {
        let span = dilation.checked_mul(kernel.checked_sub(1)?)?.checked_add(1)?;
        let padded = src.checked_add(pad_begin)?.checked_add(pad_end)?;
        let room = padded.checked_sub(span)?;
        Some(room / stride.max(1) + 1)
    }

    pub fn dst_h(&self) -> usize {
        Self::dst_extent(self.src_h, self.pad_y, self.pad_h, self.kernel_y, self.dilation_y, self.stride_y).unwrap_or(0)
    }

    pub fn dst_w(&self) -> usize {
        Self::dst_extent(self.src_w, self.pad_x, self.pad_w, self.kernel_x, self.dilation_x, self.stride_x).unwrap_or(0)
    }

    pub fn is_1x1(&self) -> bool {
        self.kernel_y == 1
            && self.kernel_x == 1
            && self.stride_y == 1
            && self.stride_x == 1
            && self.dilation_y == 1
            && self.dilation_x == 1
            && self.pad_y == 0
            && self.pad_x == 0
            && self.pad_h == 0
            && self.pad_w == 0
    }

    /// Source elements of one image.
    pub fn src_size(&self) -> usize {
        self.src_c * self.src_h * self.src_w
    }

    /// Destination elements of one image.
    pub fn dst_size(&self) -> usize {
        self.dst_c * self.dst_h() * self.dst_w()
    }

    /// Weight elements: `kY * kX * srcC/group * dstC`.
    pub fn weight_size(&self) -> usize {
        self.kernel_y * self.kernel_x * (self.src_c / self.group.max(1)) * self.dst_c
    }

    /// Validation predicate run once at construction.
    pub fn validate(&self) -> ConvResult<()> {
        let dims = [
            ("batch", self.batch),
            ("src_c", self.src_c),
            ("src_h", self.src_h),
            ("src_w", self.src_w),
            ("dst_c", self.dst_c),
            ("kernel_y", self.kernel_y),
            ("kernel_x", self.kernel_x),
            ("stride_y", self.stride_y),
            ("stride_x", self.stride_x),
            ("dilation_y", self.dilation_y),
            ("dilation_x", self.dilation_x),
            ("group", self.group),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(ConvError::InvalidParam(format!("{name} must be > 0")));
        }
        if self.src_c % self.group != 0 || self.dst_c % self.group != 0 {
            return Err(ConvError::InvalidParam(format!(
                "channels {}/{} are not divisible by group {}",
                self.src_c, self.dst_c, self.group
            )));
        }
        if self.dst_h() == 0 || self.dst_w() == 0 {
            return Err(ConvError::InvalidParam(format!(
                "kernel {}x{} (dilation {}x{}) does not fit padded source {}x{}",
                self.kernel_y, self.kernel_x, self.dilation_y, self.dilation_x, self.src_h, self.src_w
            )));
        }
        let sizes = [
            self.src_c.checked_mul(self.src_h).and_then(|v| v.checked_mul(self.src_w)),
            self.dst_c.checked_mul(self.dst_h()).and_then(|v| v.checked_mul(self.dst_w())),
            self.src_c
                .checked_mul(self.kernel_y)
                .and_then(|v| v.checked_mul(self.kernel_x))
                .and_then(|v| v.checked_mul(self.dst_h()))
                .and_then(|v| v.checked_mul(self.dst_w())),
        ];
        for s in sizes {
            match s.and_then(|v| v.checked_mul(self.batch)).and_then(|v| v.checked_mul(4)) {
                Some(v) if v <= isize::MAX as usize => {}
                _ => return Err(ConvError::InvalidParam("tensor size overflows usize".into())),
            }
        }
        Ok(())
    }

    /// Whether the NHWC GEMM engine handles this geometry.
    pub fn nhwc_gemm_preferable(&self) -> bool {
        self.layout == TensorLayout::Nhwc && self.group == 1
    }

    /// Short human-readable shape, for logs and benchmark ids.
    pub fn info(&self) -> String {
        format!(
            "{}x{}x{}x{}-{}x{}x{}-s{}x{}-d{}x{}-p{},{},{},{}-g{}-{}",
            self.batch,
            self.src_h,
            self.src_w,
            self.src_c,
            self.dst_c,
            self.kernel_y,
            self.kernel_x,
            self.stride_y,
            self.stride_x,
            self.dilation_y,
            self.dilation_x,
            self.pad_y,
            self.pad_x,
            self.pad_h,
            self.pad_w,
            self.group,
            self.activation,
        )
    }
}

#[inline(always)]
pub(crate) fn align_hi(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[inline(always)]
pub(crate) fn align_lo(value: usize, align: usize) -> usize {
    value / align * align
}

/// Tiling parameters derived once from a [`ConvParam`] and cache sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgParam {
    /// Output positions per image: `dstH * dstW`.
    pub m: usize,
    /// Reduction depth: `srcC * kY * kX`.
    pub k: usize,
    /// Output channels per weight slab.
    pub micro_d: usize,
    /// Output channels per micro-kernel call.
    pub micro_c: usize,
    /// Rows per body tile.
    pub micro_m: usize,
    /// Reduction granularity of the micro-kernels.
    pub micro_k: usize,
    pub buf_d: usize,
    pub buf_k: usize,
    pub macro_k: usize,
    pub macro_h: usize,
    pub macro_d: usize,
    /// Images fused into one GEMM.
    pub batch: usize,
    /// Packed rows per fused image group: `batch * m`.
    pub buf_m: usize,
    /// Destination element size in bytes.
    pub elem_d: usize,
}

impl AlgParam {
    pub const MICRO_D: usize = 16;
    pub const MICRO_C: usize = 32;
    pub const MICRO_M: usize = 32;

    pub fn new(p: &ConvParam, micro_k: usize, caches: CacheSizes) -> Self {
        let m = p.dst_h() * p.dst_w();
        let k = p.src_c * p.kernel_y * p.kernel_x;
        let micro_d = Self::MICRO_D;
        let buf_d = align_hi(p.dst_c, micro_d);
        let buf_k = align_hi(k, micro_k);
        let macro_k = align_lo(caches.l1 / micro_d / 2, micro_k).clamp(micro_k, buf_k);

        let mut batch = 1;
        let buf_size = m * buf_k * 2;
        if buf_size * 2 <= caches.l2 && p.batch > 1 {
            for b in 1..=p.batch {
                if p.batch % b == 0 && b * buf_size <= caches.l2 {
                    batch = b;
                }
            }
        }
        let dst_w = p.dst_w();
        let macro_h = (caches.l2 / macro_k / dst_w / 2).clamp(1, p.dst_h() * batch);
        let macro_d = align_lo(caches.l3 / macro_k / 2, micro_d).clamp(micro_d, buf_d);

        Self {
            m,
            k,
            micro_d,
            micro_c: Self::MICRO_C,
            micro_m: Self::MICRO_M,
            micro_k,
            buf_d,
            buf_k,
            macro_k,
            macro_h,
            macro_d,
            batch,
            buf_m: batch * m,
            elem_d: p.dst_type.size(),
        }
    }

    /// Whether the reduction is split over several K blocks.
    pub fn split_k(&self) -> bool {
        self.macro_k < self.buf_k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dst_extents() {
        let p = ConvParam::new(1, 8, 10, 12, 4).kernel(3, 3).stride(2, 2).pad(1);
        assert_eq!((p.dst_h(), p.dst_w()), (5, 6));
        let p = ConvParam::new(1, 8, 10, 10, 4).kernel(3, 3).dilation(2, 2);
        assert_eq!((p.dst_h(), p.dst_w()), (6, 6));
        let p = ConvParam::new(1, 8, 7, 7, 4).kernel(3, 3).padding(0, 1, 2, 0);
        assert_eq!((p.dst_h(), p.dst_w()), (7, 6));
    }

    #[test]
    fn test_validate() {
        assert!(ConvParam::new(1, 8, 8, 8, 8).validate().is_ok());
        assert!(ConvParam::new(0, 8, 8, 8, 8).validate().is_err());
        assert!(ConvParam::new(1, 8, 8, 8, 0).validate().is_err());
        assert!(ConvParam::new(1, 8, 2, 2, 8).kernel(3, 3).validate().is_err());
        assert!(ConvParam::new(1, 6, 8, 8, 8).group(4).validate().is_err());
        assert!(ConvParam::new(1, 8, 8, 8, 8).group(4).validate().is_ok());
    }

    #[test]
    fn test_alg_param_tile_path() {
        let p = ConvParam::new(1, 17, 9, 9, 33).kernel(3, 3).pad(1);
        let a = AlgParam::new(&p, 32, CacheSizes::new(32 * 1024, 1 << 20, 8 << 20));
        assert_eq!(a.k, 153);
        assert_eq!(a.buf_k, 160);
        assert_eq!(a.buf_d, 48);
        assert_eq!(a.buf_k % 32, 0);
        assert_eq!(a.macro_k, 160);
        assert_eq!(a.macro_d, 48);
        assert!(!a.split_k());
        assert_eq!(a.macro_h, 9);
    }

    #[test]
    fn test_alg_param_small_caches_split() {
        let p = ConvParam::new(1, 64, 8, 8, 64).kernel(3, 3).pad(1);
        let a = AlgParam::new(&p, 2, CacheSizes::new(2048, 8 * 1024, 6144));
        assert_eq!(a.buf_k, 576);
        assert_eq!(a.macro_k, 64);
        assert!(a.split_k());
        assert_eq!(a.macro_d, 48);
        assert_eq!(a.macro_h, 8 * 1024 / 64 / 8 / 2);
    }

    #[test]
    fn test_batch_fusion() {
        let p = ConvParam::new(6, 8, 4, 4, 8);
        let a = AlgParam::new(&p, 32, CacheSizes::new(32 * 1024, 1 << 20, 8 << 20));
        assert_eq!(a.batch, 6);
        assert_eq!(a.buf_m, 96);
        let a = AlgParam::new(&p, 32, CacheSizes::new(32 * 1024, 16 * 32 * 2 * 3, 8 << 20));
        assert_eq!(a.batch, 3);
    }
}
