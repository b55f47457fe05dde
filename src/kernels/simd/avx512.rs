//! AVX-512F row blocks: two 16-lane accumulators per row, masked at the
//! channel tail so partial tiles never touch memory past `cols`.

use std::arch::x86_64::*;

use super::{row_blocks, BlockFn, RowBlocks, ROW_BLOCK};
use crate::bf16::widen_interleaved_pair;
use crate::kernels::epilogue::tail_mask16;
use crate::kernels::{read_pair, MicroTile, Store};

pub struct Avx512;

impl RowBlocks for Avx512 {
    const NAME: &'static str = "avx512";
    const BLOCKS: [BlockFn; ROW_BLOCK + 1] = row_blocks!(block);

    fn available() -> bool {
        is_x86_feature_detected!("avx512f")
    }
}

unsafe fn block<const M: usize>(t: &MicroTile, row0: usize, out: Option<&Store<'_>>) {
    block_avx512::<M>(t, row0, out)
}

#[target_feature(enable = "avx512f")]
unsafe fn block_avx512<const M: usize>(t: &MicroTile, row0: usize, out: Option<&Store<'_>>) {
    let cols = t.cols;
    let m0: __mmask16 = tail_mask16(cols);
    let m1: __mmask16 = tail_mask16(cols.saturating_sub(16));
    let hi = _mm512_set1_epi32(0xFFFF_0000u32 as i32);

    let mut acc0 = [_mm512_setzero_ps(); M];
    let mut acc1 = [_mm512_setzero_ps(); M];
    if !t.zero {
        for i in 0..M {
            let sum = t.sum.add((row0 + i) * t.sum_stride);
            acc0[i] = _mm512_maskz_loadu_ps(m0, sum);
            acc1[i] = _mm512_maskz_loadu_ps(m1, sum.add(16));
        }
    }

    let weight0 = t.weight as *const i32;
    let weight1 = t.weight.add(t.weight_slab) as *const i32;
    let mut k = 0;
    while k < t.depth {
        let kp = k / 2;
        let p0 = _mm512_maskz_loadu_epi32(m0, weight0.add(kp * 16));
        let we0 = _mm512_castsi512_ps(_mm512_slli_epi32::<16>(p0));
        let wo0 = _mm512_castsi512_ps(_mm512_and_si512(p0, hi));
        if m1 != 0 {
            let p1 = _mm512_maskz_loadu_epi32(m1, weight1.add(kp * 16));
            let we1 = _mm512_castsi512_ps(_mm512_slli_epi32::<16>(p1));
            let wo1 = _mm512_castsi512_ps(_mm512_and_si512(p1, hi));
            for i in 0..M {
                let (se, so) = widen_interleaved_pair(read_pair(t.src.add((row0 + i) * t.src_stride + k)));
                let (se, so) = (_mm512_set1_ps(se), _mm512_set1_ps(so));
                acc0[i] = _mm512_fmadd_ps(se, we0, acc0[i]);
                acc0[i] = _mm512_fmadd_ps(so, wo0, acc0[i]);
                acc1[i] = _mm512_fmadd_ps(se, we1, acc1[i]);
                acc1[i] = _mm512_fmadd_ps(so, wo1, acc1[i]);
            }
        } else {
            for i in 0..M {
                let (se, so) = widen_interleaved_pair(read_pair(t.src.add((row0 + i) * t.src_stride + k)));
                acc0[i] = _mm512_fmadd_ps(_mm512_set1_ps(se), we0, acc0[i]);
                acc0[i] = _mm512_fmadd_ps(_mm512_set1_ps(so), wo0, acc0[i]);
            }
        }
        k += 2;
    }

    match out {
        None => {
            for i in 0..M {
                let sum = t.sum.add((row0 + i) * t.sum_stride);
                _mm512_mask_storeu_ps(sum, m0, acc0[i]);
                _mm512_mask_storeu_ps(sum.add(16), m1, acc1[i]);
            }
        }
        Some(store) => {
            let mut row = [0.0f32; 32];
            for i in 0..M {
                _mm512_storeu_ps(row.as_mut_ptr(), acc0[i]);
                _mm512_storeu_ps(row.as_mut_ptr().add(16), acc1[i]);
                store.row(row0 + i, row.as_ptr(), cols);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::Operands;
    use super::super::SimdGemm;
    use crate::kernels::{TileEngine, TileShape};

    #[test]
    fn test_matches_reference_within_rounding() {
        let Some(mut engine) = SimdGemm::<super::Avx512>::new() else {
            eprintln!("avx512f not available, skipping");
            return;
        };
        for (rows, cols) in [(32, 32), (13, 17), (3, 5), (25, 16)] {
            let ops = Operands::new(rows, cols, 64);
            let mut sum = vec![7.0f32; 32 * 32];
            unsafe {
                let kernel = SimdGemm::<super::Avx512>::KERNELS[TileShape::select(rows, cols).index()];
                kernel(&mut engine, &ops.tile(&mut sum, true), None);
            }
            for r in 0..32 {
                for c in 0..32 {
                    let got = sum[r * 32 + c];
                    if r < rows && c < cols {
                        let expect = ops.expected(r, c);
                        assert!((got - expect).abs() <= 1e-3 * expect.abs().max(1.0), "r={r} c={c}: {got} vs {expect}");
                    } else {
                        assert_eq!(got, 7.0, "wrote outside the tile at r={r} c={c}");
                    }
                }
            }
        }
    }
}
