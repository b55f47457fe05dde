//! Runtime cache sizes for convolution blocking, plus a cache-line aligned buffer.
//!
//! L1D / L2 / L3 sizes are detected via CPUID leaf 4 (x86) or sysfs (Linux),
//! falling back to 32 KB / 1 MB / 8 MB. Values are computed once and cached in
//! a static `OnceLock`. Operators may override them (see `ConvOptions`), which
//! is how tests force multi-block K and channel paths on small shapes.

use std::alloc::Layout;
use std::sync::OnceLock;

/// Cache capacities in bytes used to size macro blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizes {
    pub l1: usize,
    pub l2: usize,
    pub l3: usize,
}

impl CacheSizes {
    pub const FALLBACK: CacheSizes = CacheSizes {
        l1: 32 * 1024,
        l2: 1024 * 1024,
        l3: 8 * 1024 * 1024,
    };

    pub const fn new(l1: usize, l2: usize, l3: usize) -> Self {
        Self { l1, l2, l3 }
    }

    /// Sizes of the host CPU, detected on first use.
    pub fn detected() -> Self {
        static CACHE_SIZES: OnceLock<CacheSizes> = OnceLock::new();
        *CACHE_SIZES.get_or_init(detect_cache_sizes)
    }
}

// ── Cache size detection ─────────────────────────────────────────────

fn detect_cache_sizes() -> CacheSizes {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(sizes) = detect_x86_cache() {
            log::debug!("cache sizes from CPUID: {sizes:?}");
            return sizes;
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(sizes) = detect_sysfs_cache() {
            log::debug!("cache sizes from sysfs: {sizes:?}");
            return sizes;
        }
    }
    log::debug!("cache size detection failed, using {:?}", CacheSizes::FALLBACK);
    CacheSizes::FALLBACK
}

#[cfg(target_arch = "x86_64")]
fn detect_x86_cache() -> Option<CacheSizes> {
    // CPUID leaf 4: deterministic cache parameters (Intel, AMD Zen+).
    let (mut l1, mut l2, mut l3) = (None, None, None);

    for sub in 0..16u32 {
        let info = std::arch::x86_64::__cpuid_count(4, sub);
        let cache_type = info.eax & 0x1F;
        if cache_type == 0 {
            break;
        }
        let level = (info.eax >> 5) & 0x7;
        let line_size = (info.ebx & 0xFFF) as usize + 1;
        let partitions = ((info.ebx >> 12) & 0x3FF) as usize + 1;
        let ways = ((info.ebx >> 22) & 0x3FF) as usize + 1;
        let sets = info.ecx as usize + 1;
        let size = line_size * partitions * ways * sets;

        match (level, cache_type) {
            (1, 1) => l1 = Some(size),
            (2, 3) | (2, 2) => l2 = Some(size),
            (3, 3) | (3, 2) => l3 = Some(size),
            _ => {}
        }
    }

    match (l1, l2) {
        (Some(l1), Some(l2)) => Some(CacheSizes::new(l1, l2, l3.unwrap_or(CacheSizes::FALLBACK.l3))),
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn detect_sysfs_cache() -> Option<CacheSizes> {
    let (mut l1, mut l2, mut l3) = (None, None, None);

    for idx in 0..8 {
        let base = format!("/sys/devices/system/cpu/cpu0/cache/index{idx}");
        let Ok(level) = std::fs::read_to_string(format!("{base}/level")) else {
            continue;
        };
        let Ok(ctype) = std::fs::read_to_string(format!("{base}/type")) else {
            continue;
        };
        let Ok(size) = std::fs::read_to_string(format!("{base}/size")) else {
            continue;
        };
        let size = parse_sysfs_size(size.trim())?;
        let level: u32 = level.trim().parse().ok()?;

        match (level, ctype.trim()) {
            (1, "Data") => l1 = Some(size),
            (2, "Unified") => l2 = Some(size),
            (3, "Unified") => l3 = Some(size),
            _ => {}
        }
    }

    match (l1, l2) {
        (Some(l1), Some(l2)) => Some(CacheSizes::new(l1, l2, l3.unwrap_or(CacheSizes::FALLBACK.l3))),
        _ => None,
    }
}

#[cfg(any(target_os = "linux", test))]
fn parse_sysfs_size(s: &str) -> Option<usize> {
    if let Some(kb) = s.strip_suffix('K') {
        kb.parse::<usize>().ok().map(|v| v * 1024)
    } else if let Some(mb) = s.strip_suffix('M') {
        mb.parse::<usize>().ok().map(|v| v * 1024 * 1024)
    } else {
        s.parse::<usize>().ok()
    }
}

// ── Cache-line aligned buffer ─────────────────────────────────────────

/// A zero-initialized buffer aligned to 64 bytes (cache line).
///
/// Packed rows and partial sums live here so tile loads never straddle cache
/// lines. Only grows: `resize_zeroed` to a smaller length keeps the capacity.
pub struct AlignedVec<T: bytemuck::Zeroable + Copy> {
    ptr: *mut T,
    len: usize,
    cap: usize,
}

// SAFETY: AlignedVec owns its allocation exclusively, like Vec<T>.
unsafe impl<T: bytemuck::Zeroable + Copy + Send> Send for AlignedVec<T> {}
unsafe impl<T: bytemuck::Zeroable + Copy + Sync> Sync for AlignedVec<T> {}

impl<T: bytemuck::Zeroable + Copy> AlignedVec<T> {
    const ALIGN: usize = 64;

    #[inline]
    pub fn new() -> Self {
        Self { ptr: std::ptr::null_mut(), len: 0, cap: 0 }
    }

    pub fn zeroed(len: usize) -> Self {
        let mut v = Self::new();
        v.resize_zeroed(len);
        v
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr
    }

    fn layout(cap: usize) -> Layout {
        match Layout::array::<T>(cap).and_then(|l| l.align_to(Self::ALIGN)) {
            Ok(layout) => layout,
            Err(_) => panic!("AlignedVec capacity overflow: {cap} elements"),
        }
    }

    /// Sets the length to `len` with every element zeroed. Reallocates only
    /// when `len` exceeds the current capacity.
    pub fn resize_zeroed(&mut self, len: usize) {
        assert!(std::mem::size_of::<T>() > 0, "zero-sized types are not supported");
        if len > self.cap {
            let layout = Self::layout(len);
            // SAFETY: layout has non-zero size because len > cap >= 0 and T is not a ZST.
            let new_ptr = unsafe { std::alloc::alloc_zeroed(layout) as *mut T };
            if new_ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            self.dealloc();
            self.ptr = new_ptr;
            self.cap = len;
        } else if len > 0 {
            // SAFETY: ptr is valid for cap >= len elements and T is Zeroable.
            unsafe { std::ptr::write_bytes(self.ptr, 0, len) };
        }
        self.len = len;
    }

    /// Sets the length to `len`, keeping existing contents. Returns true when
    /// the buffer had to be reallocated (new contents are zeroed).
    pub fn ensure_len(&mut self, len: usize) -> bool {
        if len > self.cap {
            self.resize_zeroed(len);
            true
        } else {
            self.len = len;
            false
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: ptr holds len initialized (zeroed or written) elements.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn dealloc(&mut self) {
        if !self.ptr.is_null() && self.cap > 0 {
            // SAFETY: ptr was allocated with exactly this layout.
            unsafe { std::alloc::dealloc(self.ptr as *mut u8, Self::layout(self.cap)) };
            self.ptr = std::ptr::null_mut();
            self.cap = 0;
        }
    }
}

impl<T: bytemuck::Zeroable + Copy> Drop for AlignedVec<T> {
    fn drop(&mut self) {
        self.dealloc();
    }
}

impl<T: bytemuck::Zeroable + Copy> Default for AlignedVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: bytemuck::Zeroable + Copy + std::fmt::Debug> std::fmt::Debug for AlignedVec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedVec").field("len", &self.len).field("cap", &self.cap).finish()
    }
}
