//! Plain-Rust row blocks. Multiplies and adds stay separate (no fused
//! multiply-add) so the result does not depend on the target.

use super::{row_blocks, weight_pair_offset, BlockFn, RowBlocks, ROW_BLOCK};
use crate::bf16::widen_interleaved_pair;
use crate::kernels::{read_pair, MicroTile, Store};

pub struct Portable;

impl RowBlocks for Portable {
    const NAME: &'static str = "portable";
    const BLOCKS: [BlockFn; ROW_BLOCK + 1] = row_blocks!(block);

    fn available() -> bool {
        true
    }
}

unsafe fn block<const M: usize>(t: &MicroTile, row0: usize, out: Option<&Store<'_>>) {
    let cols = t.cols;
    let mut acc = [[0.0f32; 32]; M];
    if !t.zero {
        for (i, a) in acc.iter_mut().enumerate() {
            let sum = t.sum.add((row0 + i) * t.sum_stride);
            for (c, v) in a[..cols].iter_mut().enumerate() {
                *v = *sum.add(c);
            }
        }
    }

    let mut we = [0.0f32; 32];
    let mut wo = [0.0f32; 32];
    let mut k = 0;
    while k < t.depth {
        let kp = k / 2;
        for c in 0..cols {
            (we[c], wo[c]) = widen_interleaved_pair(read_pair(t.weight.add(weight_pair_offset(t, kp, c))));
        }
        for (i, a) in acc.iter_mut().enumerate() {
            let (se, so) = widen_interleaved_pair(read_pair(t.src.add((row0 + i) * t.src_stride + k)));
            for c in 0..cols {
                a[c] += se * we[c];
                a[c] += so * wo[c];
            }
        }
        k += 2;
    }

    match out {
        None => {
            for (i, a) in acc.iter().enumerate() {
                let sum = t.sum.add((row0 + i) * t.sum_stride);
                for (c, &v) in a[..cols].iter().enumerate() {
                    *sum.add(c) = v;
                }
            }
        }
        Some(store) => {
            for (i, a) in acc.iter().enumerate() {
                store.row(row0 + i, a.as_ptr(), cols);
            }
        }
    }
}
