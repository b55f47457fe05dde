//! NHWC convolution as a bf16 GEMM over packed receptive fields.
//!
//! `dst[M, dstC] = packed[M, K] x weight[K, dstC]`, blocked by macroD output
//! channels, macroK depth and macroH output rows. Images are fused into one
//! GEMM when their packed rows fit in L2 together (`AlgParam::batch`).

use std::ops::Range;

use rayon::prelude::*;

use super::convert::{ConvertKind, Converter, SrcElem};
use super::driver::{convolution_2, BlockArgs, LastTerm};
use super::param::{align_hi, AlgParam, ConvParam, TensorType};
use super::weights::{block_offset, pack_weights, pack_weights_into, packed_len};
use super::{Tensor, TensorMut};
use crate::activation::ActivationParams;
use crate::cache_params::AlignedVec;
use crate::config::{ConvOptions, EngineKind};
use crate::error::{ConvError, ConvResult};
use crate::kernels::simd::portable::Portable;
use crate::kernels::simd::SimdGemm;
use crate::kernels::tile::emulated::EmulatedIsa;
use crate::kernels::tile::TileGemm;
use crate::kernels::{PostOp, TileEngine, Tiler};

const ALIGN: usize = 64;
/// Bias and per-channel parameters are padded to this many channels.
const CHANNEL_PAD: usize = 32;

/// Per-thread working memory for [`NhwcGemm::forward_rows`].
#[derive(Default)]
pub struct Scratch {
    bytes: AlignedVec<u8>,
    config_loads: usize,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tile configuration loads issued by the last call that used this scratch.
    pub fn config_loads(&self) -> usize {
        self.config_loads
    }

    fn bytes(&mut self, len: usize) -> &mut [u8] {
        let old = self.bytes.capacity();
        if self.bytes.ensure_len(len) {
            log::trace!("conv scratch grew from {old} to {len} bytes");
        }
        self.bytes.as_mut_slice()
    }
}

struct Packed {
    /// Empty when weights arrive with each forward call.
    weight: AlignedVec<u16>,
    bias: Vec<f32>,
    act: ActivationParams,
    post: PostOp,
}

pub struct NhwcGemm {
    p: ConvParam,
    a: AlgParam,
    engine: EngineKind,
    converter: Converter,
    packed: Option<Packed>,
    scratch: Scratch,
}

impl NhwcGemm {
    pub fn new(p: &ConvParam, options: &ConvOptions) -> ConvResult<Self> {
        p.validate()?;
        if !p.nhwc_gemm_preferable() {
            return Err(ConvError::Unsupported(format!("NHWC GEMM needs NHWC layout and group 1: {}", p.info())));
        }
        let engine = options.resolve_engine()?;
        let a = AlgParam::new(p, engine.micro_k(), options.resolve_caches());
        let converter = Converter::new(p, &a);
        log::debug!(
            "nhwc-gemm {}: engine={} convert={:?} {:?}",
            p.info(),
            engine,
            converter.kind(),
            a
        );
        Ok(Self {
            p: *p,
            a,
            engine,
            converter,
            packed: None,
            scratch: Scratch::new(),
        })
    }

    pub fn param(&self) -> &ConvParam {
        &self.p
    }

    pub fn alg(&self) -> &AlgParam {
        &self.a
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn convert_kind(&self) -> ConvertKind {
        self.converter.kind()
    }

    pub fn description(&self) -> String {
        format!("nhwc-gemm[{}, {:?}]", self.engine, self.converter.kind())
    }

    /// Packed-row and partial-sum element counts.
    fn buffer_elems(&self) -> (usize, usize) {
        let packed = (self.a.buf_m + 1) * self.a.buf_k;
        let sum = if self.p.dst_type == TensorType::Bf16 && self.a.split_k() {
            self.a.macro_d * self.a.buf_m
        } else {
            0
        };
        (packed, sum)
    }

    /// Bytes a caller-provided forward buffer must hold.
    pub fn external_buffer_size(&self) -> usize {
        let (packed, sum) = self.buffer_elems();
        ALIGN + align_hi(packed * 2, ALIGN) + sum * 4
    }

    /// Packs `weight` (`[kY][kX][srcC][dstC]`), bias and activation parameters.
    pub fn set_params(&mut self, weight: &[f32], bias: Option<&[f32]>, params: &[f32]) -> ConvResult<()> {
        let p = &self.p;
        if weight.len() != p.weight_size() {
            return Err(ConvError::size("weight", p.weight_size(), weight.len()));
        }
        let mut packed = self.post_params(bias, params)?;
        packed.weight = pack_weights(p, &self.a, weight);
        self.packed = Some(packed);
        Ok(())
    }

    /// Sets bias and activation parameters only. Weights are then passed to
    /// every [`NhwcGemm::forward_with_weight`] call and packed there.
    pub fn set_post_params(&mut self, bias: Option<&[f32]>, params: &[f32]) -> ConvResult<()> {
        self.packed = Some(self.post_params(bias, params)?);
        Ok(())
    }

    fn post_params(&self, bias: Option<&[f32]>, params: &[f32]) -> ConvResult<Packed> {
        let p = &self.p;
        let mut padded_bias = vec![0.0; align_hi(p.dst_c, CHANNEL_PAD)];
        if let Some(bias) = bias {
            if bias.len() != p.dst_c {
                return Err(ConvError::size("bias", p.dst_c, bias.len()));
            }
            padded_bias[..p.dst_c].copy_from_slice(bias);
        }
        let act = ActivationParams::new(p.activation, params, p.dst_c, CHANNEL_PAD)?;
        let post = PostOp::new(&act, p.dst_type);
        Ok(Packed {
            weight: AlignedVec::new(),
            bias: padded_bias,
            act,
            post,
        })
    }

    /// Extra bytes [`NhwcGemm::forward_with_weight`] needs on top of
    /// [`NhwcGemm::external_buffer_size`] for the packed weights.
    pub fn weight_buffer_size(&self) -> usize {
        ALIGN + align_hi(packed_len(&self.a) * 2, ALIGN)
    }

    /// Full forward pass with weights (`[kY][kX][srcC][dstC]`, fp32 or bf16)
    /// packed into the working buffer first. `buf` must hold
    /// `weight_buffer_size() + external_buffer_size()` bytes.
    pub fn forward_with_weight(
        &mut self,
        src: Tensor<'_>,
        weight: Tensor<'_>,
        buf: Option<&mut [u8]>,
        dst: TensorMut<'_>,
    ) -> ConvResult<()> {
        if weight.len() != self.p.weight_size() {
            return Err(ConvError::size("weight", self.p.weight_size(), weight.len()));
        }
        match buf {
            Some(bytes) => self.run_packing(src, weight, dst, bytes),
            None => {
                let mut scratch = std::mem::take(&mut self.scratch);
                let bytes = scratch.bytes(self.weight_buffer_size() + self.external_buffer_size());
                let result = self.run_packing(src, weight, dst, bytes);
                self.scratch = scratch;
                result
            }
        }
    }

    fn run_packing(&self, src: Tensor<'_>, weight: Tensor<'_>, dst: TensorMut<'_>, bytes: &mut [u8]) -> ConvResult<()> {
        let packed = self.packed.as_ref().ok_or(ConvError::ParamsNotSet)?;
        let required = self.weight_buffer_size() + self.external_buffer_size();
        if bytes.len() < required {
            return Err(ConvError::BufferTooSmall { required, actual: bytes.len() });
        }
        let (weight_bytes, rest) = bytes.split_at_mut(self.weight_buffer_size());
        let offset = weight_bytes.as_ptr().align_offset(ALIGN);
        let len = packed_len(&self.a);
        let out = bytemuck::try_cast_slice_mut::<u8, u16>(&mut weight_bytes[offset..offset + len * 2])
            .map_err(|_| ConvError::InvalidParam("forward buffer is not aligned".into()))?;
        match weight {
            Tensor::F32(w) => pack_weights_into(&self.p, &self.a, w, out),
            Tensor::Bf16(w) => pack_weights_into(&self.p, &self.a, w, out),
        }
        self.run_with(packed, out, src, dst, 0..self.total_rows(), rest).map(|_| ())
    }

    /// Full forward pass using `buf` when given, the internal buffer otherwise.
    pub fn forward(&mut self, src: Tensor<'_>, buf: Option<&mut [u8]>, dst: TensorMut<'_>) -> ConvResult<()> {
        let rows = 0..self.total_rows();
        match buf {
            Some(bytes) => self.run(src, dst, rows, bytes).map(|_| ()),
            None => {
                let mut scratch = std::mem::take(&mut self.scratch);
                let result = self.forward_rows(src, dst, rows, &mut scratch);
                self.scratch = scratch;
                result
            }
        }
    }

    /// Output rows across the whole batch: `batch * dstH`.
    pub fn total_rows(&self) -> usize {
        self.p.batch * self.p.dst_h()
    }

    /// Computes output rows `rows` (counted across the whole batch). `src` is
    /// the full input; `dst` holds exactly the rows of the range. Disjoint
    /// ranges may run concurrently, each with its own scratch.
    pub fn forward_rows(&self, src: Tensor<'_>, dst: TensorMut<'_>, rows: Range<usize>, scratch: &mut Scratch) -> ConvResult<()> {
        let bytes = scratch.bytes(self.external_buffer_size());
        let loads = self.run(src, dst, rows, bytes)?;
        scratch.config_loads = loads;
        Ok(())
    }

    /// Splits the output rows into `tasks` ranges run on the rayon pool.
    pub fn forward_parallel(&self, src: Tensor<'_>, dst: TensorMut<'_>, tasks: usize) -> ConvResult<()> {
        let total = self.total_rows();
        let per_task = total.div_ceil(tasks.clamp(1, total.max(1))).max(1);
        let chunk = per_task * self.p.dst_w() * self.p.dst_c;
        match dst {
            TensorMut::F32(d) => d.par_chunks_mut(chunk).enumerate().try_for_each_init(Scratch::new, |scratch, (i, part)| {
                let beg = i * per_task;
                self.forward_rows(src, TensorMut::F32(part), beg..(beg + per_task).min(total), scratch)
            }),
            TensorMut::Bf16(d) => d.par_chunks_mut(chunk).enumerate().try_for_each_init(Scratch::new, |scratch, (i, part)| {
                let beg = i * per_task;
                self.forward_rows(src, TensorMut::Bf16(part), beg..(beg + per_task).min(total), scratch)
            }),
        }
    }

    fn check_io(&self, src: &Tensor<'_>, dst: &TensorMut<'_>, rows: &Range<usize>) -> ConvResult<()> {
        let p = &self.p;
        if src.ty() != p.src_type {
            return Err(ConvError::TypeMismatch { what: "src", expected: p.src_type, actual: src.ty() });
        }
        if dst.ty() != p.dst_type {
            return Err(ConvError::TypeMismatch { what: "dst", expected: p.dst_type, actual: dst.ty() });
        }
        if src.len() != p.batch * p.src_size() {
            return Err(ConvError::size("src", p.batch * p.src_size(), src.len()));
        }
        if rows.start > rows.end || rows.end > self.total_rows() {
            return Err(ConvError::InvalidParam(format!("rows {rows:?} outside 0..{}", self.total_rows())));
        }
        let expected = rows.len() * p.dst_w() * p.dst_c;
        if dst.len() != expected {
            return Err(ConvError::size("dst", expected, dst.len()));
        }
        Ok(())
    }

    /// Carves the packed-row and partial-sum regions out of `bytes`.
    fn carve<'b>(&self, bytes: &'b mut [u8]) -> ConvResult<(&'b mut [u16], &'b mut [f32])> {
        let required = self.external_buffer_size();
        if bytes.len() < required {
            return Err(ConvError::BufferTooSmall { required, actual: bytes.len() });
        }
        let (packed, sum) = self.buffer_elems();
        let offset = bytes.as_ptr().align_offset(ALIGN);
        let (_, rest) = bytes.split_at_mut(offset);
        let (packed_bytes, rest) = rest.split_at_mut(align_hi(packed * 2, ALIGN));
        let misaligned = |_| ConvError::InvalidParam("forward buffer is not aligned".into());
        let packed = bytemuck::try_cast_slice_mut::<u8, u16>(&mut packed_bytes[..packed * 2]).map_err(misaligned)?;
        let sum = bytemuck::try_cast_slice_mut::<u8, f32>(&mut rest[..sum * 4]).map_err(misaligned)?;
        Ok((packed, sum))
    }

    /// Returns the number of tile configuration loads.
    fn run(&self, src: Tensor<'_>, dst: TensorMut<'_>, rows: Range<usize>, bytes: &mut [u8]) -> ConvResult<usize> {
        let packed = self.packed.as_ref().ok_or(ConvError::ParamsNotSet)?;
        if packed.weight.is_empty() {
            return Err(ConvError::Unsupported("weights are passed with each forward call".into()));
        }
        self.run_with(packed, packed.weight.as_slice(), src, dst, rows, bytes)
    }

    fn run_with(
        &self,
        packed: &Packed,
        weight: &[u16],
        src: Tensor<'_>,
        dst: TensorMut<'_>,
        rows: Range<usize>,
        bytes: &mut [u8],
    ) -> ConvResult<usize> {
        debug_assert_eq!(weight.len(), packed_len(&self.a));
        self.check_io(&src, &dst, &rows)?;
        if rows.is_empty() {
            return Ok(0);
        }
        let (buf, sum) = self.carve(bytes)?;
        let dst_ptr = match dst {
            TensorMut::F32(d) => d.as_mut_ptr() as *mut u8,
            TensorMut::Bf16(d) => d.as_mut_ptr() as *mut u8,
        };
        let io = Io { weight: weight.as_ptr(), dst: dst_ptr, rows, buf, sum };
        match src {
            Tensor::F32(s) => self.dispatch(packed, s, io),
            Tensor::Bf16(s) => self.dispatch(packed, s, io),
        }
    }

    fn dispatch<S: SrcElem>(&self, packed: &Packed, src: &[S], io: Io<'_>) -> ConvResult<usize> {
        match self.engine {
            #[cfg(target_arch = "x86_64")]
            EngineKind::Amx => {
                let isa = crate::kernels::tile::amx::AmxIsa::new().ok_or(ConvError::EngineUnavailable("amx"))?;
                Ok(self.run_engine(Tiler::new(TileGemm::new(isa)), packed, src, io))
            }
            #[cfg(target_arch = "x86_64")]
            EngineKind::Avx512 => {
                let engine = SimdGemm::<crate::kernels::simd::avx512::Avx512>::new()
                    .ok_or(ConvError::EngineUnavailable("avx512"))?;
                Ok(self.run_engine(Tiler::new(engine), packed, src, io))
            }
            #[cfg(not(target_arch = "x86_64"))]
            EngineKind::Amx | EngineKind::Avx512 => Err(ConvError::EngineUnavailable(self.engine.name())),
            EngineKind::AmxEmulated => Ok(self.run_engine(Tiler::new(TileGemm::new(EmulatedIsa::new())), packed, src, io)),
            EngineKind::Portable => {
                let engine = SimdGemm::<Portable>::new().ok_or(ConvError::EngineUnavailable("portable"))?;
                Ok(self.run_engine(Tiler::new(engine), packed, src, io))
            }
        }
    }

    fn run_engine<E: TileEngine, S: SrcElem>(&self, mut tiler: Tiler<E>, packed: &Packed, src: &[S], io: Io<'_>) -> usize {
        debug_assert_eq!(E::MICRO_K, self.a.micro_k);
        let group_rows = self.a.batch * self.p.dst_h();
        let Io { weight, dst, rows, buf, sum } = io;
        let mut y = rows.start;
        while y < rows.end {
            let group_end = (y / group_rows + 1) * group_rows;
            let part = y..group_end.min(rows.end);
            // SAFETY: `part` lies in `rows`, the slices were sized by check_io and carve.
            unsafe { self.forward_group(&mut tiler, packed, weight, src, part.clone(), rows.start, dst, buf, sum) };
            y = part.end;
        }
        tiler.config_loads()
    }

    /// Runs rows `part` of one fused image group. `dst` points at row `origin`.
    #[allow(clippy::too_many_arguments)]
    unsafe fn forward_group<E: TileEngine, S: SrcElem>(
        &self,
        tiler: &mut Tiler<E>,
        packed: &Packed,
        weight: *const u16,
        src: &[S],
        part: Range<usize>,
        origin: usize,
        dst: *mut u8,
        buf: &mut [u16],
        sum: &mut [f32],
    ) {
        let (p, a) = (&self.p, &self.a);
        let dst_w = p.dst_w();
        let elem = a.elem_d;
        let dst_row_bytes = dst_w * p.dst_c * elem;
        let identity = self.converter.kind() == ConvertKind::Identity;
        let reuse = !(a.split_k() || p.dst_c > a.macro_d);

        for dc in (0..p.dst_c).step_by(a.macro_d) {
            let macro_d_cur = p.dst_c.min(dc + a.macro_d) - dc;
            for mak in (0..a.k).step_by(a.macro_k) {
                let macro_k_cur = a.buf_k.min(mak + a.macro_k) - mak;
                let weight = weight.add(block_offset(a, dc, mak));
                let last = mak + macro_k_cur == a.buf_k;
                let zero = if last { macro_k_cur == a.buf_k } else { mak == 0 };

                for y_beg in part.clone().step_by(a.macro_h) {
                    let y_end = part.end.min(y_beg + a.macro_h);
                    let row_base = if reuse { 0 } else { (y_beg - part.start) * dst_w };
                    let rows_src: *const u16 = if identity {
                        (src.as_ptr() as *const u16).add(y_beg * dst_w * a.buf_k)
                    } else {
                        if dc == 0 && mak == 0 {
                            let len = (y_end - y_beg) * dst_w * a.buf_k;
                            let out = &mut buf[row_base * a.buf_k..row_base * a.buf_k + len];
                            self.converter.convert(src, y_beg..y_end, out);
                        }
                        buf.as_ptr().add(row_base * a.buf_k)
                    };

                    let dst_row = dst.add((y_beg - origin) * dst_row_bytes);
                    let (sum_ptr, sum_stride) = match p.dst_type {
                        TensorType::F32 => ((dst_row as *mut f32).add(dc), p.dst_c),
                        // empty unless K is split; never dereferenced then
                        TensorType::Bf16 => (sum.as_mut_ptr().wrapping_add((y_beg - part.start) * dst_w * a.macro_d), a.macro_d),
                    };
                    let args = BlockArgs {
                        src: rows_src.add(mak),
                        src_stride: a.buf_k,
                        depth: macro_k_cur,
                        rows: (y_end - y_beg) * dst_w,
                        channels: macro_d_cur,
                        weight,
                        weight_slab: macro_k_cur * AlgParam::MICRO_D,
                        bias: packed.bias.as_ptr().add(dc),
                        params: if packed.post.per_channel() {
                            packed.act.as_slice().as_ptr().add(dc)
                        } else {
                            packed.act.as_slice().as_ptr()
                        },
                        zero,
                        sum: sum_ptr,
                        sum_stride,
                        last: last.then_some(LastTerm {
                            dst: dst_row.add(dc * elem),
                            dst_stride: p.dst_c * elem,
                            elem,
                            post: &packed.post,
                        }),
                    };
                    convolution_2(tiler, &args);
                }
            }
        }
    }
}

/// Per-call destination and scratch views.
struct Io<'b> {
    weight: *const u16,
    dst: *mut u8,
    rows: Range<usize>,
    buf: &'b mut [u16],
    sum: &'b mut [f32],
}
