//! Software tile file executing the tile programs on any CPU.
//!
//! Eight tiles of 16 rows x 64 bytes. `dpbf16ps` follows the architectural
//! order: for each row `m`, each pair `k`, each column `n`, the even product
//! is added before the odd one. Denormal inputs are not flushed.

use super::{TileConfig, TileIsa};
use crate::bf16::widen_interleaved_pair;

const WORDS: usize = 16;

pub struct EmulatedIsa {
    cfg: TileConfig,
    tiles: Box<[[u32; WORDS * 16]; 8]>,
}

impl EmulatedIsa {
    pub fn new() -> Self {
        Self {
            cfg: TileConfig::full(),
            tiles: Box::new([[0; WORDS * 16]; 8]),
        }
    }

    pub fn config(&self) -> &TileConfig {
        &self.cfg
    }

    #[inline(always)]
    fn extent(&self, t: usize) -> (usize, usize) {
        (self.cfg.rows[t] as usize, self.cfg.colsb[t] as usize / 4)
    }
}

impl Default for EmulatedIsa {
    fn default() -> Self {
        Self::new()
    }
}

impl TileIsa for EmulatedIsa {
    const NAME: &'static str = "amx-emulated";

    fn load_config(&mut self, cfg: &TileConfig) {
        self.cfg = *cfg;
        for tile in self.tiles.iter_mut() {
            tile.fill(0);
        }
    }

    unsafe fn zero(&mut self, t: usize) {
        self.tiles[t].fill(0);
    }

    unsafe fn load(&mut self, t: usize, base: *const u8, stride: usize) {
        let (rows, words) = self.extent(t);
        let tile = &mut self.tiles[t];
        for r in 0..rows {
            let row = base.add(r * stride) as *const u32;
            for w in 0..words {
                tile[r * WORDS + w] = row.add(w).read_unaligned();
            }
        }
    }

    unsafe fn stream_load(&mut self, t: usize, base: *const u8, stride: usize) {
        self.load(t, base, stride)
    }

    unsafe fn store(&mut self, t: usize, base: *mut u8, stride: usize) {
        let (rows, words) = self.extent(t);
        let tile = &self.tiles[t];
        for r in 0..rows {
            let row = base.add(r * stride) as *mut u32;
            for w in 0..words {
                row.add(w).write_unaligned(tile[r * WORDS + w]);
            }
        }
    }

    unsafe fn dpbf16ps(&mut self, c: usize, a: usize, b: usize) {
        let (rows, n_cols) = self.extent(c);
        let pairs = self.cfg.colsb[a] as usize / 4;
        let at = self.tiles[a];
        let bt = self.tiles[b];
        let ct = &mut self.tiles[c];
        for m in 0..rows {
            for k in 0..pairs {
                let (a_even, a_odd) = widen_interleaved_pair(at[m * WORDS + k]);
                for n in 0..n_cols {
                    let (b_even, b_odd) = widen_interleaved_pair(bt[k * WORDS + n]);
                    let mut v = f32::from_bits(ct[m * WORDS + n]);
                    v += a_even * b_even;
                    v += a_odd * b_odd;
                    ct[m * WORDS + n] = v.to_bits();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bf16::float32_to_bfloat16;

    #[test]
    fn test_dpbf16ps_matches_pairwise_sum() {
        let mut isa = EmulatedIsa::new();
        isa.load_config(&TileConfig::full());
        // A: 16 rows x 32 bf16, B: 16 k-pairs x 16 columns x 2.
        let a: Vec<u16> = (0..16 * 32).map(|i| float32_to_bfloat16((i % 7) as f32 - 3.0)).collect();
        let b: Vec<u16> = (0..16 * 32).map(|i| float32_to_bfloat16((i % 5) as f32 * 0.5)).collect();
        let mut c = vec![0.0f32; 16 * 16];
        unsafe {
            isa.zero(0);
            isa.load(4, a.as_ptr() as *const u8, 64);
            isa.load(6, b.as_ptr() as *const u8, 64);
            isa.dpbf16ps(0, 4, 6);
            isa.store(0, c.as_mut_ptr() as *mut u8, 64);
        }
        let f = crate::bf16::bfloat16_to_float32;
        for m in 0..16 {
            for n in 0..16 {
                let mut expect = 0.0f32;
                for k in 0..16 {
                    expect += f(a[m * 32 + 2 * k]) * f(b[k * 32 + 2 * n]);
                    expect += f(a[m * 32 + 2 * k + 1]) * f(b[k * 32 + 2 * n + 1]);
                }
                assert_eq!(c[m * 16 + n], expect, "m={m} n={n}");
            }
        }
    }

    #[test]
    fn test_partial_store_respects_config() {
        let mut isa = EmulatedIsa::new();
        let mut cfg = TileConfig::full();
        cfg.rows[0] = 3;
        cfg.colsb[0] = 20;
        isa.load_config(&cfg);
        let src = vec![0x3F80_0000u32; 16 * 16];
        let mut dst = vec![0u32; 16 * 16];
        unsafe {
            isa.load(0, src.as_ptr() as *const u8, 64);
            isa.store(0, dst.as_mut_ptr() as *mut u8, 64);
        }
        for r in 0..16 {
            for w in 0..16 {
                let expect = if r < 3 && w < 5 { 0x3F80_0000 } else { 0 };
                assert_eq!(dst[r * 16 + w], expect, "r={r} w={w}");
            }
        }
    }
}
