//! Wide-SIMD realization of the micro-kernel family.
//!
//! The reduction steps one bf16 pair at a time (`MICRO_K = 2`): each packed
//! weight `u32` is widened into an even and an odd fp32 vector, each source
//! pair into two broadcast scalars, and `acc += even * even; acc += odd * odd`.
//! Rows are processed in blocks of up to [`ROW_BLOCK`] so the accumulators of
//! a block stay in registers.
//!
//! Unlike the tile engine, all four [`TileShape`](super::TileShape) entries
//! of the kernel table point at the same body. A SIMD kernel has no shape
//! state to load: it loops over `t.rows` in row blocks and masks `t.cols`,
//! so a 16-row or 16-channel shape is just a shorter loop or a narrower
//! mask.

#[cfg(target_arch = "x86_64")]
pub mod avx512;
pub mod portable;

use std::marker::PhantomData;

use super::{MicroKernel, MicroTile, Store, TileEngine, TileKey};

/// Rows per register block.
pub const ROW_BLOCK: usize = 12;

/// Processes rows `row0..row0 + M` of a tile.
pub type BlockFn = unsafe fn(&MicroTile, usize, Option<&Store<'_>>);

/// Row-block kernels of one instruction set, indexed by block height
/// (entry 0 is never called).
pub trait RowBlocks {
    const NAME: &'static str;
    const BLOCKS: [BlockFn; ROW_BLOCK + 1];

    fn available() -> bool;
}

/// Builds the `[BlockFn; 13]` table from a const-generic block function.
macro_rules! row_blocks {
    ($f:ident) => {
        [
            $f::<1> as $crate::kernels::simd::BlockFn,
            $f::<1>,
            $f::<2>,
            $f::<3>,
            $f::<4>,
            $f::<5>,
            $f::<6>,
            $f::<7>,
            $f::<8>,
            $f::<9>,
            $f::<10>,
            $f::<11>,
            $f::<12>,
        ]
    };
}
pub(crate) use row_blocks;

/// [`TileEngine`] over row blocks `B`.
pub struct SimdGemm<B: RowBlocks> {
    _blocks: PhantomData<B>,
}

impl<B: RowBlocks> SimdGemm<B> {
    /// `None` when the instruction set is missing on this CPU.
    pub fn new() -> Option<Self> {
        B::available().then_some(Self { _blocks: PhantomData })
    }
}

impl<B: RowBlocks> TileEngine for SimdGemm<B> {
    const MICRO_K: usize = 2;
    // one body for every shape, see the module docs
    const KERNELS: [MicroKernel<Self>; 4] = [gemm::<B>, gemm::<B>, gemm::<B>, gemm::<B>];

    fn name(&self) -> &'static str {
        B::NAME
    }

    fn configure(&mut self, _key: TileKey) {}
}

unsafe fn gemm<B: RowBlocks>(_e: &mut SimdGemm<B>, t: &MicroTile, out: Option<&Store<'_>>) {
    let mut row = 0;
    while row + ROW_BLOCK <= t.rows {
        B::BLOCKS[ROW_BLOCK](t, row, out);
        row += ROW_BLOCK;
    }
    if row < t.rows {
        B::BLOCKS[t.rows - row](t, row, out);
    }
}

/// Offset of the bf16 pair of channel `c` at pair index `kp` inside the
/// slab-major weight block.
#[inline(always)]
pub(crate) fn weight_pair_offset(t: &MicroTile, kp: usize, c: usize) -> usize {
    (c / 16) * t.weight_slab + kp * 32 + (c % 16) * 2
}
