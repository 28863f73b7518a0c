//! Durability primitives.
//!
//! A store into a mapped region is only durable once it has been flushed out of the CPU caches
//! (or written back from the page cache) *and* the flushes have been ordered by a drain. Splitting
//! the two lets a caller issue many flushes for discontiguous ranges and pay for the barrier once.
use core::sync::atomic::{fence, Ordering};

use crate::{Region, Result};

/// Granularity of a cache flush instruction.
pub const CACHE_LINE: usize = 64;

/// Push `[offset, offset + length)` of the region towards the persistence domain.
///
/// This does not wait for the data to become durable, see [`drain`].
pub fn flush(region: &mut Region, offset: u64, length: u64) -> Result<()> {
    region.flush(offset, length)
}

/// Wait for all flushes previously issued by this thread to complete.
///
/// This is a global barrier and not scoped to any region.
pub fn drain() {
    #[cfg(target_arch = "x86_64")]
    // Safety: `sfence` is part of SSE, which is baseline on x86_64.
    unsafe {
        core::arch::x86_64::_mm_sfence()
    };

    #[cfg(not(target_arch = "x86_64"))]
    fence(Ordering::SeqCst);

    // Keep the compiler from moving later stores in front of the barrier.
    fence(Ordering::SeqCst);
}

/// Flush and drain as a single durability checkpoint.
pub fn persist(region: &mut Region, offset: u64, length: u64) -> Result<()> {
    region.persist(offset, length)
}

/// Whether the region is backed by persistent memory.
///
/// When it is not, flushes fall back to a synchronous page writeback. Durability is the same from
/// the caller's perspective, only slower.
pub fn is_pmem(region: &Region) -> bool {
    region.is_pmem()
}

/// Synchronously write back the pages of a range, regardless of the medium.
pub fn msync(region: &mut Region, offset: u64, length: u64) -> Result<()> {
    region.msync(offset, length)
}

/// Whether [`drain`] maps to a dedicated store fence instruction on this target.
pub fn has_hw_drain() -> bool {
    cfg!(target_arch = "x86_64")
}

/// Evict every cache line overlapping `[ptr, ptr + len)`.
///
/// # Safety
///
/// The range must lie within a live mapping.
pub(crate) unsafe fn flush_cache_lines(ptr: *const u8, len: usize) {
    if len == 0 {
        return;
    }

    let start = ptr as usize & !(CACHE_LINE - 1);
    let end = ptr as usize + len;

    #[cfg(target_arch = "x86_64")]
    for line in (start..end).step_by(CACHE_LINE) {
        core::arch::x86_64::_mm_clflush(line as *const u8);
    }

    // Without a flush instruction the caller falls back to `msync`. Ordering is all we can do.
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (start, end);
        fence(Ordering::Release);
    }
}
