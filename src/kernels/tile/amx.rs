//! Native AMX-BF16 tile instructions.
//!
//! Instructions are emitted as raw encodings so the crate builds on stable
//! toolchains without the AMX target features. Memory operands are always
//! `[rax + rcx*1]` (ModRM.rm = SIB, SIB = 0x08).

use std::arch::asm;
use std::arch::x86_64::{__cpuid, __cpuid_count, _xgetbv};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

use super::{TileConfig, TileIsa};

const CPUID_EDX_AMX_BF16: u32 = 1 << 22;
const CPUID_EDX_AMX_TILE: u32 = 1 << 24;
const CPUID_ECX_OSXSAVE: u32 = 1 << 27;
/// XCR0 bits 17 (XTILECFG) and 18 (XTILEDATA).
const XCR0_TILE_STATE: u64 = 0b11 << 17;

fn cpu_supports_amx() -> bool {
    if __cpuid(0).eax < 7 {
        return false;
    }
    let edx = __cpuid_count(7, 0).edx;
    edx & CPUID_EDX_AMX_TILE != 0 && edx & CPUID_EDX_AMX_BF16 != 0
}

#[target_feature(enable = "xsave")]
unsafe fn xcr0() -> u64 {
    _xgetbv(0)
}

fn os_enables_tile_state() -> bool {
    if __cpuid(1).ecx & CPUID_ECX_OSXSAVE == 0 {
        return false;
    }
    // SAFETY: OSXSAVE set means XGETBV is enabled.
    let xcr0 = unsafe { xcr0() };
    xcr0 & XCR0_TILE_STATE == XCR0_TILE_STATE
}

/// Requests XTILEDATA permission for the process.
#[cfg(target_os = "linux")]
fn request_permission() -> bool {
    const ARCH_REQ_XCOMP_PERM: libc::c_long = 0x1023;
    const XFEATURE_XTILEDATA: libc::c_long = 18;
    // SAFETY: arch_prctl with these arguments only changes xsave permissions.
    let ret = unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_REQ_XCOMP_PERM, XFEATURE_XTILEDATA) };
    ret == 0
}

#[cfg(not(target_os = "linux"))]
fn request_permission() -> bool {
    true
}

/// Whether AMX-TILE and AMX-BF16 are usable by this process. The check runs
/// once; the result is cached (0 = unknown, 1 = usable, 2 = not usable).
pub fn is_available() -> bool {
    static STATE: AtomicU8 = AtomicU8::new(0);
    match STATE.load(Ordering::Relaxed) {
        1 => return true,
        2 => return false,
        _ => {}
    }
    let ok = if !cpu_supports_amx() {
        false
    } else if !os_enables_tile_state() {
        log::warn!("CPU reports AMX but the OS does not enable tile state");
        false
    } else if !request_permission() {
        log::warn!("AMX tile data permission denied; falling back");
        false
    } else {
        true
    };
    STATE.store(if ok { 1 } else { 2 }, Ordering::Relaxed);
    ok
}

macro_rules! tile_mem {
    ($base:expr, $stride:expr, $bytes:literal, $($opt:ident),*) => {
        asm!(concat!(".byte ", $bytes), in("rax") $base, in("rcx") $stride, options($($opt),*))
    };
}

/// Hardware tile file. Tiles are per-thread state, so the handle stays on
/// the thread that created it; dropping it releases the tiles.
pub struct AmxIsa {
    _thread_bound: PhantomData<*const ()>,
}

impl AmxIsa {
    pub fn new() -> Option<Self> {
        is_available().then_some(Self { _thread_bound: PhantomData })
    }
}

impl Drop for AmxIsa {
    fn drop(&mut self) {
        // SAFETY: construction proved AMX usable; releasing unconfigured tiles is a no-op.
        // tilerelease
        unsafe { asm!(".byte 0xc4, 0xe2, 0x78, 0x49, 0xc0", options(nomem, nostack)) }
    }
}

impl TileIsa for AmxIsa {
    const NAME: &'static str = "amx";

    fn load_config(&mut self, cfg: &TileConfig) {
        let p = cfg as *const TileConfig;
        // SAFETY: `cfg` is a valid 64-byte palette 1 configuration.
        // ldtilecfg [rax]
        unsafe { asm!(".byte 0xc4, 0xe2, 0x78, 0x49, 0x00", in("rax") p, options(readonly, nostack)) }
    }

    #[inline(always)]
    unsafe fn zero(&mut self, t: usize) {
        match t {
            0 => asm!(".byte 0xc4, 0xe2, 0x7b, 0x49, 0xc0", options(nomem, nostack, preserves_flags)), // tilezero tmm0
            1 => asm!(".byte 0xc4, 0xe2, 0x7b, 0x49, 0xc8", options(nomem, nostack, preserves_flags)), // tilezero tmm1
            2 => asm!(".byte 0xc4, 0xe2, 0x7b, 0x49, 0xd0", options(nomem, nostack, preserves_flags)), // tilezero tmm2
            3 => asm!(".byte 0xc4, 0xe2, 0x7b, 0x49, 0xd8", options(nomem, nostack, preserves_flags)), // tilezero tmm3
            _ => unreachable!("tmm{t} is not an accumulator"),
        }
    }

    #[inline(always)]
    unsafe fn load(&mut self, t: usize, base: *const u8, stride: usize) {
        match t {
            0 => tile_mem!(base, stride, "0xc4, 0xe2, 0x7b, 0x4b, 0x04, 0x08", readonly, nostack, preserves_flags), // tileloadd tmm0, [rax + rcx]
            1 => tile_mem!(base, stride, "0xc4, 0xe2, 0x7b, 0x4b, 0x0c, 0x08", readonly, nostack, preserves_flags), // tileloadd tmm1, [rax + rcx]
            2 => tile_mem!(base, stride, "0xc4, 0xe2, 0x7b, 0x4b, 0x14, 0x08", readonly, nostack, preserves_flags), // tileloadd tmm2, [rax + rcx]
            3 => tile_mem!(base, stride, "0xc4, 0xe2, 0x7b, 0x4b, 0x1c, 0x08", readonly, nostack, preserves_flags), // tileloadd tmm3, [rax + rcx]
            6 => tile_mem!(base, stride, "0xc4, 0xe2, 0x7b, 0x4b, 0x34, 0x08", readonly, nostack, preserves_flags), // tileloadd tmm6, [rax + rcx]
            7 => tile_mem!(base, stride, "0xc4, 0xe2, 0x7b, 0x4b, 0x3c, 0x08", readonly, nostack, preserves_flags), // tileloadd tmm7, [rax + rcx]
            _ => unreachable!("tmm{t} is streamed"),
        }
    }

    #[inline(always)]
    unsafe fn stream_load(&mut self, t: usize, base: *const u8, stride: usize) {
        match t {
            4 => tile_mem!(base, stride, "0xc4, 0xe2, 0x79, 0x4b, 0x24, 0x08", readonly, nostack, preserves_flags), // tileloaddt1 tmm4, [rax + rcx]
            5 => tile_mem!(base, stride, "0xc4, 0xe2, 0x79, 0x4b, 0x2c, 0x08", readonly, nostack, preserves_flags), // tileloaddt1 tmm5, [rax + rcx]
            _ => unreachable!("tmm{t} is not a source tile"),
        }
    }

    #[inline(always)]
    unsafe fn store(&mut self, t: usize, base: *mut u8, stride: usize) {
        match t {
            0 => tile_mem!(base, stride, "0xc4, 0xe2, 0x7a, 0x4b, 0x04, 0x08", nostack, preserves_flags), // tilestored [rax + rcx], tmm0
            1 => tile_mem!(base, stride, "0xc4, 0xe2, 0x7a, 0x4b, 0x0c, 0x08", nostack, preserves_flags), // tilestored [rax + rcx], tmm1
            2 => tile_mem!(base, stride, "0xc4, 0xe2, 0x7a, 0x4b, 0x14, 0x08", nostack, preserves_flags), // tilestored [rax + rcx], tmm2
            3 => tile_mem!(base, stride, "0xc4, 0xe2, 0x7a, 0x4b, 0x1c, 0x08", nostack, preserves_flags), // tilestored [rax + rcx], tmm3
            _ => unreachable!("tmm{t} is not an accumulator"),
        }
    }

    #[inline(always)]
    unsafe fn dpbf16ps(&mut self, c: usize, a: usize, b: usize) {
        match (c, a, b) {
            (0, 4, 6) => asm!(".byte 0xc4, 0xe2, 0x4a, 0x5c, 0xc4", options(nomem, nostack, preserves_flags)), // tdpbf16ps tmm0, tmm4, tmm6
            (1, 4, 7) => asm!(".byte 0xc4, 0xe2, 0x42, 0x5c, 0xcc", options(nomem, nostack, preserves_flags)), // tdpbf16ps tmm1, tmm4, tmm7
            (2, 5, 6) => asm!(".byte 0xc4, 0xe2, 0x4a, 0x5c, 0xd5", options(nomem, nostack, preserves_flags)), // tdpbf16ps tmm2, tmm5, tmm6
            (3, 5, 7) => asm!(".byte 0xc4, 0xe2, 0x42, 0x5c, 0xdd", options(nomem, nostack, preserves_flags)), // tdpbf16ps tmm3, tmm5, tmm7
            _ => unreachable!("tdpbf16ps tmm{c}, tmm{a}, tmm{b} is not used"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_is_cached_and_consistent() {
        let first = is_available();
        assert_eq!(is_available(), first);
        assert_eq!(AmxIsa::new().is_some(), first);
        if !first {
            eprintln!("AMX not available, native tile handle not created");
        }
    }
}
