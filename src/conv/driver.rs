//! Macro tiling driver: one channel block x one K block x a run of packed rows.

use crate::kernels::{MicroTile, PostOp, Store, TileEngine, TileKey, TileShape, Tiler};

/// Destination of a final K block.
pub(crate) struct LastTerm<'a> {
    pub dst: *mut u8,
    /// Bytes between destination rows.
    pub dst_stride: usize,
    /// Destination element size.
    pub elem: usize,
    pub post: &'a PostOp,
}

pub(crate) struct BlockArgs<'a> {
    /// First packed row at the K block's offset.
    pub src: *const u16,
    pub src_stride: usize,
    /// K elements in this block (multiple of the engine's `MICRO_K`).
    pub depth: usize,
    pub rows: usize,
    /// Output channels in this block.
    pub channels: usize,
    /// First slab of the packed weight block.
    pub weight: *const u16,
    /// Elements between consecutive 16-channel slabs.
    pub weight_slab: usize,
    /// Bias and activation parameters of the block's first channel.
    pub bias: *const f32,
    pub params: *const f32,
    pub zero: bool,
    pub sum: *mut f32,
    pub sum_stride: usize,
    /// `Some` on the final K block.
    pub last: Option<LastTerm<'a>>,
}

/// Runs the micro-kernels over a block: 32-channel chunks outside, 32-row
/// body tiles and one tail tile inside.
///
/// # Safety
/// Every pointer in `b` covers the rows, channels and depth it describes.
pub(crate) unsafe fn convolution_2<E: TileEngine>(tiler: &mut Tiler<E>, b: &BlockArgs<'_>) {
    let kernels = E::KERNELS;
    let body_rows = b.rows / 32 * 32;
    let tail_rows = b.rows - body_rows;
    let per_channel = b.last.as_ref().is_some_and(|l| l.post.per_channel());

    for dc in (0..b.channels).step_by(32) {
        let cols = (b.channels - dc).min(32);
        let weight = b.weight.add(dc / 16 * b.weight_slab);
        let params = if per_channel { b.params.add(dc) } else { b.params };

        let mut run = |row: usize, rows: usize| {
            let shape = TileShape::select(rows, cols);
            tiler.ensure(TileKey { shape, rows, cols });
            let tile = MicroTile {
                src: b.src.add(row * b.src_stride),
                src_stride: b.src_stride,
                weight,
                weight_slab: b.weight_slab,
                depth: b.depth,
                rows,
                cols,
                zero: b.zero,
                sum: b.sum.wrapping_add(row * b.sum_stride + dc),
                sum_stride: b.sum_stride,
            };
            let kernel = kernels[shape.index()];
            match &b.last {
                None => kernel(tiler.engine(), &tile, None),
                Some(last) => {
                    let store = Store {
                        dst: last.dst.add(row * last.dst_stride + dc * last.elem),
                        dst_stride: last.dst_stride,
                        bias: b.bias.add(dc),
                        params,
                        post: last.post,
                    };
                    kernel(tiler.engine(), &tile, Some(&store));
                }
            }
        };

        let mut row = 0;
        while row < body_rows {
            run(row, 32);
            row += 32;
        }
        if tail_rows > 0 {
            run(body_rows, tail_rows);
        }
    }
}
