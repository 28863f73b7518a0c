use core::sync::atomic::Ordering;
use std::path::Path;

use pmem::{MapOptions, Region};

use crate::layout::{read_u64, Header, FRAME_HEADER, HEADER_SIZE, WRITE_OFFSET_AT};
use crate::{LogError, DEFAULT_POOL_SIZE, MIN_POOL_SIZE};

/// A log pool, opened by [`LogPool::create`] or [`LogPool::open`].
///
/// The pool lives on in its file after [`close`](Self::close) and can be reopened later.
pub struct LogPool {
    region: Region,
    header: Header,
}

/// An append in progress.
///
/// Frames copied into the entry are invisible until [`commit`](Self::commit). Dropping the entry
/// instead leaves the log exactly as it was, which is also what a crash before the commit store
/// looks like on the next open.
pub(crate) struct Entry<'lt> {
    pool: &'lt mut LogPool,
    /// The committed write offset this entry started from.
    start: u64,
    /// Where the next frame of this entry goes.
    end: u64,
}

/// Iterator over the committed contents of the log, see [`LogPool::entries`].
pub struct Entries<'lt> {
    data: &'lt [u8],
    pos: usize,
    chunk_size: usize,
    current: &'lt [u8],
}

impl LogPool {
    /// Create a new log pool of `pool_size` bytes.
    ///
    /// The file must not exist yet. Part of the pool is taken by the header, see
    /// [`nbyte`](Self::nbyte) for the usable space.
    pub fn create(path: impl AsRef<Path>, pool_size: u64) -> Result<Self, LogError> {
        Self::create_with(path, pool_size, &MapOptions::create_new())
    }

    /// Create a new log pool of [`DEFAULT_POOL_SIZE`] bytes.
    pub fn create_default(path: impl AsRef<Path>) -> Result<Self, LogError> {
        Self::create(path, DEFAULT_POOL_SIZE)
    }

    /// Create a new log pool, mapping the file with custom options.
    ///
    /// Options that allow an existing file resize it to exactly `pool_size` bytes.
    pub fn create_with(
        path: impl AsRef<Path>,
        pool_size: u64,
        options: &MapOptions,
    ) -> Result<Self, LogError> {
        if pool_size < MIN_POOL_SIZE {
            return Err(LogError::PoolTooSmall {
                pool_size,
                min: MIN_POOL_SIZE,
            });
        }

        let options = MapOptions {
            create: true,
            ..options.clone()
        };

        let mut region = Region::map_file(path, pool_size, &options)?;
        let header = Header::new(pool_size);

        region.zero_at(0, HEADER_SIZE)?;
        region.write_at(0, &header.encode())?;
        region.persist(0, HEADER_SIZE)?;

        tracing::debug!(
            path = %region.path().display(),
            pool_size,
            nbyte = header.nbyte(),
            "created log pool"
        );

        Ok(LogPool { region, header })
    }

    /// Open an existing log pool, validating its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let region = Region::open(path)?;
        let header = Self::read_header(&region)?;
        let pool = LogPool { region, header };

        let offset = pool.tell();
        if offset > header.nbyte() {
            return Err(LogError::Corrupt("write offset beyond the data area"));
        }

        tracing::debug!(
            path = %pool.region.path().display(),
            offset,
            nbyte = header.nbyte(),
            "opened log pool"
        );

        Ok(pool)
    }

    fn read_header(region: &Region) -> Result<Header, LogError> {
        if region.len() < HEADER_SIZE {
            return Err(LogError::Corrupt("file too small for a log pool"));
        }

        let header = Header::decode(region.slice(0, WRITE_OFFSET_AT)?)?;
        header.validate(region.len())?;
        Ok(header)
    }

    /// Usable space of the log, the pool size less the header.
    pub fn nbyte(&self) -> u64 {
        self.header.nbyte()
    }

    /// The current write offset within the usable space.
    ///
    /// Starts at zero and grows with every append by the payload and its 8-byte length prefix.
    pub fn tell(&self) -> u64 {
        self.write_offset().load(Ordering::Acquire)
    }

    pub fn is_pmem(&self) -> bool {
        self.region.is_pmem()
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Append `data` as one entry.
    ///
    /// The append is atomic: after a crash the entry is either fully present or absent. Appending
    /// an empty slice does nothing.
    pub fn append(&mut self, data: &[u8]) -> Result<(), LogError> {
        self.append_all(&[data])
    }

    /// Append several entries, all of them or none.
    ///
    /// Cheaper than separate appends, the whole batch is persisted with a single drain and
    /// committed by a single header update. If only persisting that update fails the batch stays
    /// visible to this handle, but is not known to be durable.
    pub fn append_all(&mut self, data: &[&[u8]]) -> Result<(), LogError> {
        let requested: u64 = data
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| FRAME_HEADER + d.len() as u64)
            .sum();

        if requested == 0 {
            return Ok(());
        }

        let mut entry = self.entry();
        entry.reserve(requested)?;

        for data in data.iter().filter(|d| !d.is_empty()) {
            entry.copy_frame(data)?;
        }

        let offset = entry.commit()?;
        tracing::trace!(entries = data.len(), requested, offset, "appended");
        Ok(())
    }

    /// Reset the write offset to zero.
    ///
    /// The old contents stay in place but are no longer reachable, the next append overwrites them.
    pub fn rewind(&mut self) -> Result<(), LogError> {
        self.write_offset().store(0, Ordering::Release);
        self.region.persist(WRITE_OFFSET_AT, 8)?;
        tracing::debug!(path = %self.region.path().display(), "rewound log");
        Ok(())
    }

    /// Lazily iterate the committed entries in append order.
    ///
    /// With a `chunk_size` of zero every entry is yielded whole. Otherwise entries are split into
    /// pieces of `chunk_size` bytes, the last piece of an entry possibly shorter.
    pub fn entries(&self, chunk_size: usize) -> Result<Entries<'_>, LogError> {
        let data = self.region.slice(self.header.start, self.tell())?;
        Ok(Entries {
            data,
            pos: 0,
            chunk_size,
            current: &[],
        })
    }

    /// Call `visit` for every entry (or chunk of an entry), from the beginning of the log.
    ///
    /// The walk stops early when `visit` returns `false`.
    pub fn walk(
        &self,
        chunk_size: usize,
        mut visit: impl FnMut(&[u8]) -> bool,
    ) -> Result<(), LogError> {
        for chunk in self.entries(chunk_size)? {
            if !visit(chunk) {
                break;
            }
        }

        Ok(())
    }

    /// Persist outstanding writes and unmap the pool.
    pub fn close(mut self) -> Result<(), LogError> {
        self.region.close()?;
        Ok(())
    }

    pub(crate) fn entry(&mut self) -> Entry<'_> {
        let start = self.tell();
        Entry {
            pool: self,
            start,
            end: start,
        }
    }

    fn write_offset(&self) -> &core::sync::atomic::AtomicU64 {
        self.region
            .atomic_u64(WRITE_OFFSET_AT)
            .expect("header cell is validated on open")
    }

    /// Whether the frames of `data` chain exactly up to its end.
    pub(crate) fn frames_consistent(data: &[u8]) -> bool {
        let mut pos = 0usize;

        while pos < data.len() {
            let Some(len) = frame_len(data, pos) else {
                return false;
            };

            match pos.checked_add(FRAME_HEADER as usize + len) {
                Some(next) if next <= data.len() => pos = next,
                _ => return false,
            }
        }

        true
    }

    pub(crate) fn committed(&self) -> Result<&[u8], LogError> {
        Ok(self.region.slice(self.header.start, self.tell())?)
    }
}

impl Entry<'_> {
    /// Ensure `requested` more bytes fit, before anything is written.
    pub(crate) fn reserve(&self, requested: u64) -> Result<(), LogError> {
        let available = self.pool.nbyte() - self.end;
        if requested > available {
            return Err(LogError::LogFull {
                requested,
                available,
            });
        }

        Ok(())
    }

    /// Copy one length-prefixed frame behind the previous ones.
    pub(crate) fn copy_frame(&mut self, data: &[u8]) -> Result<(), LogError> {
        let len = data.len() as u64;
        self.reserve(FRAME_HEADER + len)?;

        let at = self.pool.header.start + self.end;
        self.pool.region.write_at(at, &len.to_le_bytes())?;
        self.pool.region.write_at(at + FRAME_HEADER, data)?;
        self.end += FRAME_HEADER + len;
        Ok(())
    }

    /// Persist the frames, then publish them by storing the new write offset.
    ///
    /// An error persisting the offset itself leaves the entry visible to this handle. Whether it
    /// survives a crash is then unknown, a reopen shows either outcome.
    pub(crate) fn commit(self) -> Result<u64, LogError> {
        let Entry { pool, start, end } = self;

        if end == start {
            return Ok(end);
        }

        pool.region.persist(pool.header.start + start, end - start)?;
        pool.write_offset().store(end, Ordering::Release);
        pool.region.persist(WRITE_OFFSET_AT, 8)?;
        Ok(end)
    }
}

impl<'lt> Iterator for Entries<'lt> {
    type Item = &'lt [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_empty() {
            let len = frame_len(self.data, self.pos)?;
            let begin = self.pos + FRAME_HEADER as usize;
            let end = begin.checked_add(len).filter(|&end| end <= self.data.len())?;

            self.current = &self.data[begin..end];
            self.pos = end;
        }

        let take = match self.chunk_size {
            0 => self.current.len(),
            n => n.min(self.current.len()),
        };

        let (chunk, rest) = self.current.split_at(take);
        self.current = rest;
        Some(chunk)
    }
}

fn frame_len(data: &[u8], pos: usize) -> Option<usize> {
    let header_end = pos.checked_add(FRAME_HEADER as usize)?;
    if header_end > data.len() {
        return None;
    }

    usize::try_from(read_u64(data, pos)).ok()
}
