//! The two ways a backing file ends up in our address space.
//!
//! A DAX capable file system accepts `MAP_SYNC`, after which CPU cache flushes are sufficient to
//! make stores durable. Everything else goes through the page cache via `memmap2` and needs an
//! `msync` for the same effect.
use core::ffi::{c_int, c_void};
use core::ptr::NonNull;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use memmap2::{MmapOptions, MmapRaw};

pub(crate) enum Mapping {
    /// A synchronous mapping of persistent memory. We own the address range and `munmap` it.
    Dax { ptr: NonNull<u8>, len: usize },
    /// A shared mapping of a regular file.
    Paged(MmapRaw),
}

// Safety: the `Dax` pointer is the exclusive owner of its mapping, just like `MmapRaw` is for the
// `Paged` variant. Nothing about the mapping is tied to the thread that created it.
unsafe impl Send for Mapping {}

impl Mapping {
    /// Map `len` bytes of `file`, trying a synchronous DAX mapping first if `probe_dax` is set.
    pub(crate) fn map(file: &File, len: usize, probe_dax: bool) -> io::Result<Self> {
        if probe_dax {
            if let Some(mapping) = Self::map_sync(file, len) {
                return Ok(mapping);
            }
        }

        let raw = MmapOptions::new().len(len).map_raw(file)?;
        Ok(Mapping::Paged(raw))
    }

    #[cfg(target_os = "linux")]
    fn map_sync(file: &File, len: usize) -> Option<Self> {
        // Not every libc release exports these, the values are part of the kernel ABI.
        const MAP_SHARED_VALIDATE: c_int = 0x03;
        const MAP_SYNC: c_int = 0x080000;

        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED_VALIDATE | MAP_SYNC,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            tracing::debug!(
                error = %io::Error::last_os_error(),
                "MAP_SYNC refused, not a DAX mapping"
            );
            return None;
        }

        let ptr = NonNull::new(ptr as *mut u8)?;
        Some(Mapping::Dax { ptr, len })
    }

    #[cfg(not(target_os = "linux"))]
    fn map_sync(_: &File, _: usize) -> Option<Self> {
        None
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        match self {
            Mapping::Dax { ptr, .. } => ptr.as_ptr(),
            Mapping::Paged(raw) => raw.as_mut_ptr(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Mapping::Dax { len, .. } => *len,
            Mapping::Paged(raw) => raw.len(),
        }
    }

    pub(crate) fn is_dax(&self) -> bool {
        matches!(self, Mapping::Dax { .. })
    }

    /// Synchronously write back the pages covering `[offset, offset + len)`.
    pub(crate) fn msync(&self, offset: usize, len: usize) -> io::Result<()> {
        match self {
            Mapping::Paged(raw) => raw.flush_range(offset, len),
            Mapping::Dax { ptr, .. } => {
                let page = page_size();
                let start = offset - offset % page;
                let len = len + (offset - start);
                // Safety: `start` is page aligned and in-bounds of our own mapping.
                let ret = unsafe {
                    libc::msync(ptr.as_ptr().add(start) as *mut c_void, len, libc::MS_SYNC)
                };

                if ret == -1 {
                    return Err(io::Error::last_os_error());
                }

                Ok(())
            }
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Mapping::Dax { ptr, len } = *self {
            // Safety: no more references to this region of memory, the region borrows of all
            // views end before the mapping is dropped.
            unsafe { libc::munmap(ptr.as_ptr() as *mut c_void, len) };
        }
    }
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

/// Size the file to exactly `len` bytes, every one of them backed by allocated storage.
///
/// A sparse file could fail a later store with `SIGBUS` when the file system runs out of space,
/// which is not something we can report as an error at that point. A longer file is truncated,
/// the file length is what a later open maps.
pub(crate) fn allocate(file: &File, len: u64) -> io::Result<()> {
    let off = libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds off_t"))?;

    if off == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero length mapping"));
    }

    if file.metadata()?.len() > len {
        file.set_len(len)?;
    }

    fallocate(file, off)
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn fallocate(file: &File, len: libc::off_t) -> io::Result<()> {
    match unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) } {
        0 => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

// FIXME: no preallocation primitive wired up here, the file may stay sparse.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn fallocate(file: &File, len: libc::off_t) -> io::Result<()> {
    let len = len as u64;
    if file.metadata()?.len() < len {
        file.set_len(len)?;
    }
    Ok(())
}
