//! Tile-register realization of the micro-kernel family.
//!
//! Register roles are fixed for every shape:
//!
//! ```text
//!   tmm0 tmm1    accumulators, rows 0..16   (channels 0..16 | 16..32)
//!   tmm2 tmm3    accumulators, rows 16..32
//!   tmm4 tmm5    packed source rows 0..16 | 16..32, 32 bf16 of K per row
//!   tmm6 tmm7    weight slabs 0 | 1, 16 k-pairs x 16 channels
//! ```
//!
//! Each 32-deep K chunk issues one `TDPBF16PS` per live accumulator. The
//! kernel bodies are generic over [`TileIsa`], implemented by the native AMX
//! instructions and by a software tile file.

#[cfg(target_arch = "x86_64")]
pub mod amx;
pub mod emulated;

use super::{MicroKernel, MicroTile, Store, TileEngine, TileKey, TileShape};

/// Bytes per tile row.
pub const TILE_ROW_BYTES: usize = 64;
/// K elements consumed per `TDPBF16PS`.
pub const TILE_K: usize = 32;

/// TILECFG memory layout (64 bytes, palette 1).
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileConfig {
    pub palette: u8,
    pub start_row: u8,
    _pad0: [u8; 14],
    pub colsb: [u16; 8],
    _pad1: [u8; 16],
    pub rows: [u8; 8],
    _pad2: [u8; 8],
}

impl TileConfig {
    fn empty() -> Self {
        Self {
            palette: 1,
            start_row: 0,
            _pad0: [0; 14],
            colsb: [0; 8],
            _pad1: [0; 16],
            rows: [0; 8],
            _pad2: [0; 8],
        }
    }

    /// Configuration for `key`: accumulator and source tiles sized to the
    /// actual rows, accumulator and weight tiles sized to the actual channels.
    pub fn for_key(key: TileKey) -> Self {
        let mut c = Self::empty();
        let (r, n) = (key.rows as u8, key.cols as u16);
        match key.shape {
            TileShape::S32x32 => {
                c.rows = [16, 16, r - 16, r - 16, 16, r - 16, 16, 16];
                c.colsb = [64, (n - 16) * 4, 64, (n - 16) * 4, 64, 64, 64, (n - 16) * 4];
            }
            TileShape::S32x16 => {
                c.rows[0] = 16;
                c.rows[2] = r - 16;
                c.rows[4] = 16;
                c.rows[5] = r - 16;
                c.rows[6] = 16;
                c.colsb[0] = n * 4;
                c.colsb[2] = n * 4;
                c.colsb[4] = 64;
                c.colsb[5] = 64;
                c.colsb[6] = n * 4;
            }
            TileShape::S16x32 => {
                c.rows[0] = r;
                c.rows[1] = r;
                c.rows[4] = r;
                c.rows[6] = 16;
                c.rows[7] = 16;
                c.colsb[0] = 64;
                c.colsb[1] = (n - 16) * 4;
                c.colsb[4] = 64;
                c.colsb[6] = 64;
                c.colsb[7] = (n - 16) * 4;
            }
            TileShape::S16x16 => {
                c.rows[0] = r;
                c.rows[4] = r;
                c.rows[6] = 16;
                c.colsb[0] = n * 4;
                c.colsb[4] = 64;
                c.colsb[6] = n * 4;
            }
        }
        c
    }

    /// Full 32x32 configuration.
    pub fn full() -> Self {
        Self::for_key(TileKey { shape: TileShape::S32x32, rows: 32, cols: 32 })
    }
}

/// Tile instruction set used by the kernel bodies. Strides are in bytes.
pub trait TileIsa {
    const NAME: &'static str;

    fn load_config(&mut self, cfg: &TileConfig);

    /// # Safety
    /// `t` is configured.
    unsafe fn zero(&mut self, t: usize);

    /// # Safety
    /// `base` is readable for the configured rows and column bytes of `t`.
    unsafe fn load(&mut self, t: usize, base: *const u8, stride: usize);

    /// Load with a non-temporal hint, for data read once.
    ///
    /// # Safety
    /// As [`TileIsa::load`].
    unsafe fn stream_load(&mut self, t: usize, base: *const u8, stride: usize);

    /// # Safety
    /// `base` is writable for the configured rows and column bytes of `t`.
    unsafe fn store(&mut self, t: usize, base: *mut u8, stride: usize);

    /// `c += a x b` over bf16 pairs into fp32.
    ///
    /// # Safety
    /// The three tiles are configured with compatible shapes.
    unsafe fn dpbf16ps(&mut self, c: usize, a: usize, b: usize);
}

/// Output staging for last-term calls: 32 rows of 32 floats.
#[repr(C, align(64))]
struct AccTile([f32; 32 * 32]);

const ACC_STRIDE: usize = 32 * 4;

/// [`TileEngine`] running the tile programs on `I`.
pub struct TileGemm<I: TileIsa> {
    isa: I,
    acc: Box<AccTile>,
}

impl<I: TileIsa> TileGemm<I> {
    pub fn new(isa: I) -> Self {
        Self { isa, acc: Box::new(AccTile([0.0; 32 * 32])) }
    }

    pub fn isa(&self) -> &I {
        &self.isa
    }
}

impl<I: TileIsa> TileEngine for TileGemm<I> {
    const MICRO_K: usize = TILE_K;
    const KERNELS: [MicroKernel<Self>; 4] = [gemm_32x32::<I>, gemm_32x16::<I>, gemm_16x32::<I>, gemm_16x16::<I>];

    fn name(&self) -> &'static str {
        I::NAME
    }

    fn configure(&mut self, key: TileKey) {
        self.isa.load_config(&TileConfig::for_key(key));
    }
}

/// Accumulator tiles of a shape and their (row, channel) origin.
const ACC_32X32: [(usize, usize, usize); 4] = [(0, 0, 0), (1, 0, 16), (2, 16, 0), (3, 16, 16)];
const ACC_32X16: [(usize, usize, usize); 2] = [(0, 0, 0), (2, 16, 0)];
const ACC_16X32: [(usize, usize, usize); 2] = [(0, 0, 0), (1, 0, 16)];
const ACC_16X16: [(usize, usize, usize); 1] = [(0, 0, 0)];

#[inline(always)]
unsafe fn sum_ptr(t: &MicroTile, row: usize, col: usize) -> *mut u8 {
    t.sum.add(row * t.sum_stride + col) as *mut u8
}

#[inline(always)]
unsafe fn init_acc<I: TileIsa>(isa: &mut I, t: &MicroTile, tiles: &[(usize, usize, usize)]) {
    for &(tile, row, col) in tiles {
        if t.zero {
            isa.zero(tile);
        } else {
            isa.load(tile, sum_ptr(t, row, col), t.sum_stride * 4);
        }
    }
}

#[inline(always)]
unsafe fn finish<I: TileIsa>(e: &mut TileGemm<I>, t: &MicroTile, out: Option<&Store<'_>>, tiles: &[(usize, usize, usize)]) {
    match out {
        None => {
            for &(tile, row, col) in tiles {
                e.isa.store(tile, sum_ptr(t, row, col), t.sum_stride * 4);
            }
        }
        Some(store) => {
            let acc = e.acc.0.as_mut_ptr();
            for &(tile, row, col) in tiles {
                e.isa.store(tile, acc.add(row * 32 + col) as *mut u8, ACC_STRIDE);
            }
            for r in 0..t.rows {
                store.row(r, acc.add(r * 32), t.cols);
            }
        }
    }
}

unsafe fn gemm_32x32<I: TileIsa>(e: &mut TileGemm<I>, t: &MicroTile, out: Option<&Store<'_>>) {
    let stride_s = t.src_stride * 2;
    let src0 = t.src as *const u8;
    let src1 = t.src.add(16 * t.src_stride) as *const u8;
    let weight0 = t.weight as *const u8;
    let weight1 = t.weight.add(t.weight_slab) as *const u8;
    let isa = &mut e.isa;

    init_acc(isa, t, &ACC_32X32);
    let mut k = 0;
    while k < t.depth {
        isa.stream_load(4, src0.add(k * 2), stride_s);
        isa.load(6, weight0.add(k * 32), TILE_ROW_BYTES);
        isa.dpbf16ps(0, 4, 6);
        isa.load(7, weight1.add(k * 32), TILE_ROW_BYTES);
        isa.dpbf16ps(1, 4, 7);
        isa.stream_load(5, src1.add(k * 2), stride_s);
        isa.dpbf16ps(2, 5, 6);
        isa.dpbf16ps(3, 5, 7);
        k += TILE_K;
    }
    finish(e, t, out, &ACC_32X32);
}

unsafe fn gemm_32x16<I: TileIsa>(e: &mut TileGemm<I>, t: &MicroTile, out: Option<&Store<'_>>) {
    let stride_s = t.src_stride * 2;
    let src0 = t.src as *const u8;
    let src1 = t.src.add(16 * t.src_stride) as *const u8;
    let weight0 = t.weight as *const u8;
    let isa = &mut e.isa;

    init_acc(isa, t, &ACC_32X16);
    let mut k = 0;
    while k < t.depth {
        isa.stream_load(4, src0.add(k * 2), stride_s);
        isa.load(6, weight0.add(k * 32), TILE_ROW_BYTES);
        isa.dpbf16ps(0, 4, 6);
        isa.stream_load(5, src1.add(k * 2), stride_s);
        isa.dpbf16ps(2, 5, 6);
        k += TILE_K;
    }
    finish(e, t, out, &ACC_32X16);
}

unsafe fn gemm_16x32<I: TileIsa>(e: &mut TileGemm<I>, t: &MicroTile, out: Option<&Store<'_>>) {
    let stride_s = t.src_stride * 2;
    let src0 = t.src as *const u8;
    let weight0 = t.weight as *const u8;
    let weight1 = t.weight.add(t.weight_slab) as *const u8;
    let isa = &mut e.isa;

    init_acc(isa, t, &ACC_16X32);
    let mut k = 0;
    while k < t.depth {
        isa.stream_load(4, src0.add(k * 2), stride_s);
        isa.load(6, weight0.add(k * 32), TILE_ROW_BYTES);
        isa.dpbf16ps(0, 4, 6);
        isa.load(7, weight1.add(k * 32), TILE_ROW_BYTES);
        isa.dpbf16ps(1, 4, 7);
        k += TILE_K;
    }
    finish(e, t, out, &ACC_16X32);
}

unsafe fn gemm_16x16<I: TileIsa>(e: &mut TileGemm<I>, t: &MicroTile, out: Option<&Store<'_>>) {
    let stride_s = t.src_stride * 2;
    let src0 = t.src as *const u8;
    let weight0 = t.weight as *const u8;
    let isa = &mut e.isa;

    init_acc(isa, t, &ACC_16X16);
    let mut k = 0;
    while k < t.depth {
        isa.stream_load(4, src0.add(k * 2), stride_s);
        isa.load(6, weight0.add(k * 32), TILE_ROW_BYTES);
        isa.dpbf16ps(0, 4, 6);
        k += TILE_K;
    }
    finish(e, t, out, &ACC_16X16);
}
