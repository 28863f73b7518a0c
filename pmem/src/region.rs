use core::ops::Range;
use core::sync::atomic::AtomicU64;
use std::fs::{File, OpenOptions};
use std::io::SeekFrom;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::mmap::{self, Mapping};
use crate::persist::{self, flush_cache_lines};
use crate::{Error, MapOptions, Result};

/// A file mapped into memory for persistent load/store access.
///
/// The region owns a single cursor used by [`read`](Self::read), [`write`](Self::write) and
/// [`seek`](Self::seek). Pools built on top use the positional methods instead.
///
/// Writes are plain stores. They become durable with [`persist`](Self::persist), or with a
/// [`flush_scope`](Self::flush_scope) / [`persist_scope`](Self::persist_scope) guard, or at the
/// latest on [`close`](Self::close).
pub struct Region {
    /// `None` once closed.
    map: Option<Mapping>,
    /// Kept open for as long as the mapping lives.
    #[allow(dead_code)]
    file: Option<File>,
    path: PathBuf,
    len: usize,
    pmem: bool,
    cursor: u64,
    /// Ranges written since they were last flushed.
    pending: Pending,
}

#[derive(Default)]
struct Pending {
    ranges: Vec<Range<usize>>,
}

impl Region {
    /// Create (or reuse) the file at `path`, size it to `length` bytes and map them.
    pub fn create(path: impl AsRef<Path>, length: u64) -> Result<Self> {
        Self::map_file(path, length, &MapOptions::create())
    }

    /// Map an existing file in its entirety.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::map_file(path, 0, &MapOptions::default())
    }

    /// Open and map a file according to `options`.
    ///
    /// With `options.create` the file is sized to `length` bytes and fully allocated, a longer file
    /// is truncated. Otherwise the file must exist and `length` is either `0`, mapping the whole
    /// file, or at most the file length.
    pub fn map_file(path: impl AsRef<Path>, length: u64, options: &MapOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let alloc_err = |source| Error::AllocationError {
            path: path.clone(),
            length,
            source,
        };

        let file = if options.create {
            let mut open = OpenOptions::new();
            open.read(true).write(true).mode(options.mode);

            if options.exclusive {
                open.create_new(true);
            } else {
                open.create(true);
            }

            let file = open.open(&path).map_err(|err| Error::io(&path, err))?;
            mmap::allocate(&file, length).map_err(alloc_err)?;
            file
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|err| Error::io(&path, err))?
        };

        let file_len = file.metadata().map_err(|err| Error::io(&path, err))?.len();
        let length = match length {
            0 if !options.create => file_len,
            length if length <= file_len => length,
            length => {
                return Err(Error::InvalidRange {
                    offset: 0,
                    length,
                    limit: file_len,
                })
            }
        };

        if length == 0 {
            return Err(alloc_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            )));
        }

        let len = usize::try_from(length).map_err(|_| {
            alloc_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "length exceeds the address space",
            ))
        })?;

        let forced = options.resolved_force_pmem();
        let map = Mapping::map(&file, len, forced != Some(false))
            .map_err(|err| Error::io(&path, err))?;
        let pmem = forced.unwrap_or_else(|| map.is_dax());

        tracing::debug!(
            path = %path.display(),
            len,
            dax = map.is_dax(),
            pmem,
            "mapped region"
        );

        Ok(Region {
            map: Some(map),
            file: Some(file),
            path,
            len,
            pmem,
            cursor: 0,
            pending: Pending::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The mapped length in bytes, fixed at creation.
    pub fn len(&self) -> u64 {
        self.len as u64
    }

    /// Always `false` for a region that could be mapped, zero lengths fail with
    /// [`Error::AllocationError`].
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether stores reach persistence by cache flushes alone.
    pub fn is_pmem(&self) -> bool {
        self.pmem
    }

    pub fn is_closed(&self) -> bool {
        self.map.is_none()
    }

    /// The current cursor position.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Read from the cursor into `buf`, returning the number of bytes read.
    ///
    /// Fewer than `buf.len()` bytes are only returned at the end of the region.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let start = self.cursor as usize;
        let n = buf.len().min(self.len.saturating_sub(start));
        self.read_at(self.cursor, &mut buf[..n])?;
        self.cursor += n as u64;
        Ok(n)
    }

    /// Read up to `n` bytes from the cursor into a new buffer.
    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; n];
        let read = self.read(&mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Read everything from the cursor to the end of the region.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let rest = self.len.saturating_sub(self.cursor as usize);
        self.read_vec(rest)
    }

    /// Write `data` at the cursor and advance it.
    ///
    /// The region never grows, a write crossing its end fails without writing anything.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            self.mapping()?;
            return Ok(0);
        }

        self.write_at(self.cursor, data).map_err(|err| match err {
            Error::InvalidRange {
                offset,
                length,
                limit,
            } => Error::OutOfBounds {
                offset,
                length,
                limit,
            },
            other => other,
        })?;

        self.cursor += data.len() as u64;
        Ok(data.len())
    }

    /// Move the cursor.
    ///
    /// The resulting position must lie within `[0, len]`.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.mapping()?;

        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(d) => i128::from(self.cursor) + i128::from(d),
            SeekFrom::End(d) => self.len as i128 + i128::from(d),
        };

        if target < 0 || target > self.len as i128 {
            return Err(Error::InvalidOffset { offset: target });
        }

        self.cursor = target as u64;
        Ok(self.cursor)
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the region.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range(offset, buf.len() as u64)?;
        let base = self.mapping()?.as_ptr();
        // Safety: `range` was checked against the mapped length. The mapping stays alive while we
        // hold `&self`, and nobody else holds a reference into it that could be written through.
        unsafe {
            core::ptr::copy_nonoverlapping(base.add(range.start), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the region at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.range(offset, data.len() as u64)?;
        let base = self.mapping()?.as_ptr();
        // Safety: as in `read_at`, with `&mut self` guaranteeing exclusive access.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), base.add(range.start), data.len());
        }
        self.pending.mark(range);
        Ok(())
    }

    /// Fill `length` bytes at `offset` with zeros.
    pub fn zero_at(&mut self, offset: u64, length: u64) -> Result<()> {
        let range = self.range(offset, length)?;
        let base = self.mapping()?.as_ptr();
        // Safety: as in `write_at`.
        unsafe { core::ptr::write_bytes(base.add(range.start), 0, range.len()) };
        self.pending.mark(range);
        Ok(())
    }

    /// A bounds-checked view of the mapped bytes.
    ///
    /// Typed or array views over the mapping are meant to be built on top of this.
    pub fn slice(&self, offset: u64, length: u64) -> Result<&[u8]> {
        let range = self.range(offset, length)?;
        let base = self.mapping()?.as_ptr();
        // Safety: in-bounds of the mapping, which outlives the borrow of `self`. Mapped file
        // pages are always initialized.
        Ok(unsafe { core::slice::from_raw_parts(base.add(range.start), range.len()) })
    }

    /// A bounds-checked mutable view of the mapped bytes.
    ///
    /// The whole view counts as written and is flushed by the next scope barrier or on close.
    pub fn slice_mut(&mut self, offset: u64, length: u64) -> Result<&mut [u8]> {
        let range = self.range(offset, length)?;
        let base = self.mapping()?.as_ptr();
        self.pending.mark(range.clone());
        // Safety: as in `slice`, with `&mut self` guaranteeing exclusive access.
        Ok(unsafe { core::slice::from_raw_parts_mut(base.add(range.start), range.len()) })
    }

    /// An 8-byte cell of the mapping, for fail-atomic updates of metadata.
    ///
    /// An aligned 8-byte store can not be torn by a crash. Stores through the cell are not
    /// tracked as pending, the caller persists them explicitly.
    pub fn atomic_u64(&self, offset: u64) -> Result<&AtomicU64> {
        if offset % 8 != 0 {
            return Err(Error::Misaligned { offset });
        }

        let range = self.range(offset, 8)?;
        let base = self.mapping()?.as_ptr();
        // Safety: the mapping base is page aligned so `offset` aligned to 8 is aligned for
        // `AtomicU64`, which has the same in-memory representation as `u64`. The memory is
        // initialized and only ever accessed atomically through this method or copied while we
        // hold `&mut self`, which excludes a concurrent borrow of the cell.
        Ok(unsafe { &*(base.add(range.start) as *const AtomicU64) })
    }

    /// Push a range towards the persistence domain, without waiting.
    pub fn flush(&mut self, offset: u64, length: u64) -> Result<()> {
        let range = self.range(offset, length)?;
        self.flush_range(range.clone())?;
        self.pending.clear_within(&range);
        Ok(())
    }

    /// Flush a range and drain.
    pub fn persist(&mut self, offset: u64, length: u64) -> Result<()> {
        self.flush(offset, length)?;
        persist::drain();
        Ok(())
    }

    /// Write back the pages of a range with `msync`, whatever the medium.
    pub fn msync(&mut self, offset: u64, length: u64) -> Result<()> {
        let range = self.range(offset, length)?;
        self.mapping()?
            .msync(range.start, range.len())
            .map_err(|err| Error::io(&self.path, err))?;
        self.pending.clear_within(&range);
        Ok(())
    }

    /// Flush every range written since its last flush. Does not drain.
    pub fn flush_pending(&mut self) -> Result<()> {
        self.mapping()?;

        let ranges = core::mem::take(&mut self.pending.ranges);
        tracing::trace!(ranges = ranges.len(), "flushing pending writes");

        for range in ranges {
            self.flush_range(range)?;
        }

        Ok(())
    }

    /// Whether there are written ranges that have not been flushed yet.
    pub fn has_pending(&self) -> bool {
        !self.pending.ranges.is_empty()
    }

    /// Persist pending writes and unmap.
    ///
    /// Closing twice is fine, every other operation fails with [`Error::RegionClosed`] afterwards.
    pub fn close(&mut self) -> Result<()> {
        if self.map.is_none() {
            return Ok(());
        }

        if self.has_pending() {
            self.flush_pending()?;
            persist::drain();
        }

        self.map = None;
        self.file = None;
        tracing::debug!(path = %self.path.display(), "closed region");
        Ok(())
    }

    fn flush_range(&self, range: Range<usize>) -> Result<()> {
        let map = self.mapping()?;

        if self.pmem && cfg!(target_arch = "x86_64") {
            // Safety: `range` is within the live mapping.
            unsafe { flush_cache_lines(map.as_ptr().add(range.start), range.len()) };
            Ok(())
        } else {
            map.msync(range.start, range.len())
                .map_err(|err| Error::io(&self.path, err))
        }
    }

    fn mapping(&self) -> Result<&Mapping> {
        self.map.as_ref().ok_or(Error::RegionClosed)
    }

    fn range(&self, offset: u64, length: u64) -> Result<Range<usize>> {
        self.mapping()?;

        let invalid = Error::InvalidRange {
            offset,
            length,
            limit: self.len as u64,
        };

        match offset.checked_add(length) {
            Some(end) if end <= self.len as u64 => Ok(offset as usize..end as usize),
            _ => Err(invalid),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(path = %self.path.display(), %err, "failed to persist region on drop");
        }
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("pmem", &self.pmem)
            .field("cursor", &self.cursor)
            .field("closed", &self.map.is_none())
            .finish()
    }
}

impl Pending {
    /// Record a written range, merging with the most recent one where they touch.
    fn mark(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }

        if let Some(last) = self.ranges.last_mut() {
            if range.start <= last.end && last.start <= range.end {
                last.start = last.start.min(range.start);
                last.end = last.end.max(range.end);
                return;
            }
        }

        self.ranges.push(range);
    }

    /// Forget ranges that lie entirely within a flushed range.
    fn clear_within(&mut self, flushed: &Range<usize>) {
        self.ranges
            .retain(|r| !(flushed.start <= r.start && r.end <= flushed.end));
    }
}
