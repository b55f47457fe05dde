//! Micro-kernel family.
//!
//! Every engine implements the same four fixed-shape kernels behind
//! [`TileEngine`]: 32x32, 32x16, 16x32 and 16x16 output elements (rows x
//! channels). The macro driver only sees this trait.
//!
//! | engine        | realization                         | K step |
//! |---------------|-------------------------------------|--------|
//! | `Amx`         | AMX-BF16 tiles, `TDPBF16PS`         | 32     |
//! | `AmxEmulated` | same tile programs on a software tile file | 32 |
//! | `Avx512`      | AVX-512F FMA with bf16 pair widening | 2     |
//! | `Portable`    | plain Rust, same widening           | 2      |

pub mod epilogue;
pub mod simd;
pub mod tile;

pub use epilogue::PostOp;

/// Canonical accumulator shapes, `rows x channels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileShape {
    S32x32,
    S32x16,
    S16x32,
    S16x16,
}

impl TileShape {
    pub const ALL: [TileShape; 4] = [TileShape::S32x32, TileShape::S32x16, TileShape::S16x32, TileShape::S16x16];

    /// Smallest shape covering `rows` (<= 32) and `cols` (<= 32).
    #[inline]
    pub fn select(rows: usize, cols: usize) -> TileShape {
        match (rows > 16, cols > 16) {
            (true, true) => TileShape::S32x32,
            (true, false) => TileShape::S32x16,
            (false, true) => TileShape::S16x32,
            (false, false) => TileShape::S16x16,
        }
    }

    #[inline]
    pub fn rows(self) -> usize {
        match self {
            TileShape::S32x32 | TileShape::S32x16 => 32,
            TileShape::S16x32 | TileShape::S16x16 => 16,
        }
    }

    #[inline]
    pub fn cols(self) -> usize {
        match self {
            TileShape::S32x32 | TileShape::S16x32 => 32,
            TileShape::S32x16 | TileShape::S16x16 => 16,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Active tile configuration: shape plus the actual extents it was sized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileKey {
    pub shape: TileShape,
    pub rows: usize,
    pub cols: usize,
}

/// Operands of one micro-kernel call.
///
/// `src` points at the first packed row at the current K offset, rows are
/// `src_stride` elements apart. `weight` points at the first 16-channel slab
/// of the current K block, the second slab is `weight_slab` elements further.
/// `sum` is the fp32 partial-sum area (`sum_stride` floats per row), read when
/// `zero` is false and written by interim calls.
#[derive(Debug, Clone, Copy)]
pub struct MicroTile {
    pub src: *const u16,
    pub src_stride: usize,
    pub weight: *const u16,
    pub weight_slab: usize,
    pub depth: usize,
    pub rows: usize,
    pub cols: usize,
    pub zero: bool,
    pub sum: *mut f32,
    pub sum_stride: usize,
}

/// Destination of a last-term call: bias, activation, store.
#[derive(Clone, Copy)]
pub struct Store<'a> {
    /// First element of the tile's first row.
    pub dst: *mut u8,
    /// Bytes between destination rows.
    pub dst_stride: usize,
    /// Bias of the tile's first channel.
    pub bias: *const f32,
    /// Per-channel activation parameters of the tile's first channel.
    pub params: *const f32,
    pub post: &'a PostOp,
}

impl Store<'_> {
    /// Applies the post-processing to one accumulator row.
    ///
    /// # Safety
    /// `acc` holds `cols` floats and row `row` of the destination is writable.
    #[inline(always)]
    pub unsafe fn row(&self, row: usize, acc: *const f32, cols: usize) {
        self.post
            .apply_row(acc, cols, self.bias, self.params, self.dst.add(row * self.dst_stride));
    }
}

/// Kernel entry: `None` spills to `sum`, `Some` fuses the post-processing.
pub type MicroKernel<E> = unsafe fn(&mut E, &MicroTile, Option<&Store<'_>>);

/// Capability implemented by every micro-kernel backend.
pub trait TileEngine: Sized {
    /// Reduction granularity; packed K is padded to a multiple of it.
    const MICRO_K: usize;
    /// Kernels indexed by [`TileShape::index`].
    const KERNELS: [MicroKernel<Self>; 4];

    fn name(&self) -> &'static str;

    /// Makes `key` the active tile configuration. The driver calls this only
    /// when the key changes.
    fn configure(&mut self, key: TileKey);
}

/// Tracks the active configuration so reconfiguration happens on change only.
pub struct Tiler<E: TileEngine> {
    engine: E,
    active: Option<TileKey>,
    loads: usize,
}

impl<E: TileEngine> Tiler<E> {
    pub fn new(engine: E) -> Self {
        Self { engine, active: None, loads: 0 }
    }

    #[inline(always)]
    pub fn ensure(&mut self, key: TileKey) {
        if self.active != Some(key) {
            self.engine.configure(key);
            self.active = Some(key);
            self.loads += 1;
        }
    }

    /// Number of configuration loads issued so far.
    pub fn config_loads(&self) -> usize {
        self.loads
    }

    #[inline(always)]
    pub fn engine(&mut self) -> &mut E {
        &mut self.engine
    }
}

/// Reads the bf16 pair at `p` as one little-endian `u32`.
#[inline(always)]
pub(crate) unsafe fn read_pair(p: *const u16) -> u32 {
    (p as *const u32).read_unaligned()
}
