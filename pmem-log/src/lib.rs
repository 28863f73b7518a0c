//! A persistent memory resident log.
//!
//! The pool is a file holding a small header followed by the data area. Entries are appended
//! behind each other and read back in order with [`LogPool::walk`] or [`LogPool::entries`].
//!
//! An append first writes and persists the entry, and only then moves the write offset in the
//! header with a single 8-byte store, which is persisted in turn. A crash at any point therefore
//! leaves the offset before the interrupted entry, never after it, and a walk never observes bytes
//! that did not make it to the media.
//!
//! ```no_run
//! use pmem_log::LogPool;
//!
//! # fn main() -> Result<(), pmem_log::LogError> {
//! let mut log = LogPool::create_default("/mnt/pmem/log")?;
//! log.append(b"persistent logging!")?;
//!
//! log.walk(0, |entry| {
//!     println!("{}", String::from_utf8_lossy(entry));
//!     true
//! })?;
//! # Ok(())
//! # }
//! ```
mod layout;
mod pool;
#[cfg(test)]
mod tests;

pub use pool::{Entries, LogPool};

use std::path::Path;

use pmem::Version;

/// Pool size used by [`LogPool::create_default`].
pub const DEFAULT_POOL_SIZE: u64 = 2 << 20;

/// The smallest pool that still has a data area behind the header.
pub const MIN_POOL_SIZE: u64 = 2 * layout::HEADER_SIZE;

/// Bytes of each pool taken by the header.
pub const HEADER_SIZE: u64 = layout::HEADER_SIZE;

/// Layout version written into new pools.
pub const VERSION: Version = Version { major: 1, minor: 0 };

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log is full: {requested} bytes requested, {available} available")]
    LogFull { requested: u64, available: u64 },

    #[error("pool size {pool_size} is below the minimum of {min}")]
    PoolTooSmall { pool_size: u64, min: u64 },

    #[error("not a valid log pool: {0}")]
    Corrupt(&'static str),

    #[error(transparent)]
    Region(#[from] pmem::Error),
}

/// Check that this library supports at least log layout `major.minor`.
pub fn check_version(major: u32, minor: u32) -> Result<(), pmem::Error> {
    VERSION.satisfies(major, minor)
}

/// Check the consistency of the log pool at `path`.
///
/// Returns `Ok(false)` for a file that is not a consistent log pool. Using such a file with
/// [`LogPool::open`] either fails or produces a log with missing entries.
pub fn check(path: impl AsRef<Path>) -> Result<bool, LogError> {
    let pool = match LogPool::open(path) {
        Ok(pool) => pool,
        Err(LogError::Corrupt(reason)) => {
            tracing::debug!(reason, "log pool check failed");
            return Ok(false);
        }
        Err(err) => return Err(err),
    };

    let consistent = LogPool::frames_consistent(pool.committed()?);
    if !consistent {
        tracing::debug!("log pool frames do not chain to the write offset");
    }

    Ok(consistent)
}
