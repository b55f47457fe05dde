//! Weight packing for the NHWC GEMM engine.
//!
//! Blocks nest as: macroD block over `bufD`, macroK block over `bufK`,
//! 16-channel slab, then `[kPair][16 channels][2]` bf16. One k-pair row of a
//! slab is 64 bytes, a tile row. Within a (macroD, macroK) block the slab
//! stride is `macroKcur * 16` elements.

use super::convert::SrcElem;
use super::param::{AlgParam, ConvParam};
use crate::cache_params::AlignedVec;

/// Packs fp32 weights `[kY][kX][srcC][dstC]` (row `k`, column `d`).
/// Taps past `K` and channels past `dstC` are zero.
pub(crate) fn pack_weights(p: &ConvParam, a: &AlgParam, weight: &[f32]) -> AlignedVec<u16> {
    let mut packed = AlignedVec::zeroed(packed_len(a));
    pack_weights_into(p, a, weight, packed.as_mut_slice());
    packed
}

/// Packed weight elements: `bufD * bufK`.
#[inline]
pub(crate) fn packed_len(a: &AlgParam) -> usize {
    a.buf_d * a.buf_k
}

/// Packs `weight` into `out` (`packed_len` elements), writing the zero
/// padding too so `out` may hold stale data.
pub(crate) fn pack_weights_into<W: SrcElem>(p: &ConvParam, a: &AlgParam, weight: &[W], out: &mut [u16]) {
    debug_assert_eq!(out.len(), packed_len(a));
    let mut pos = 0;
    for dc in (0..a.buf_d).step_by(a.macro_d) {
        let macro_d_cur = a.buf_d.min(dc + a.macro_d) - dc;
        for mak in (0..a.buf_k).step_by(a.macro_k) {
            let macro_k_cur = a.buf_k.min(mak + a.macro_k) - mak;
            for slab in (dc..dc + macro_d_cur).step_by(AlgParam::MICRO_D) {
                for k in (mak..mak + macro_k_cur).step_by(2) {
                    for d in slab..slab + AlgParam::MICRO_D {
                        for kk in k..k + 2 {
                            out[pos] = if kk < a.k && d < p.dst_c {
                                weight[kk * p.dst_c + d].bf16_bits()
                            } else {
                                0
                            };
                            pos += 1;
                        }
                    }
                }
            }
        }
    }
    debug_assert_eq!(pos, out.len());
}

/// Element offset of the block starting at channel `dc` and depth `mak`.
#[inline]
pub(crate) fn block_offset(a: &AlgParam, dc: usize, mak: usize) -> usize {
    let macro_d_cur = a.buf_d.min(dc + a.macro_d) - dc;
    dc * a.buf_k + mak * macro_d_cur
}
