//! An array of fixed-size blocks resident in persistent memory.
//!
//! Every block write is atomic with respect to crashes: after a crash a block reads either as its
//! old or as its new contents, never as a mix. A write goes to the one spare slot of the pool,
//! which is persisted, and is then published by switching the block's map entry with a single
//! 8-byte store. The slot that backed the block before becomes the new spare.
//!
//! ```no_run
//! use pmem_blk::BlockPool;
//!
//! # fn main() -> Result<(), pmem_blk::BlkError> {
//! let mut pool = BlockPool::create("/mnt/pmem/blk", 256, 1 << 20)?;
//! pool.write(20, b"Hello, persistent!")?;
//!
//! let block = pool.read(20)?;
//! assert_eq!(&block[..18], b"Hello, persistent!");
//! # Ok(())
//! # }
//! ```
mod layout;
mod pool;

pub use pool::BlockPool;

use std::path::Path;

use pmem::Version;

/// The smallest block size a pool can be created with.
pub const MIN_BLOCK_SIZE: u64 = 64;

/// Pool size used by [`BlockPool::create_default`].
pub const DEFAULT_POOL_SIZE: u64 = 2 << 20;

/// Layout version written into new pools.
pub const VERSION: Version = Version { major: 1, minor: 0 };

#[derive(Debug, thiserror::Error)]
pub enum BlkError {
    #[error("block {block} out of range, the pool has {nblock} blocks")]
    IndexOutOfRange { block: u64, nblock: u64 },

    #[error("block size {block_size} invalid, must be at least {min} and fit 32 bits")]
    BlockSizeInvalid { block_size: usize, min: u64 },

    #[error("{len} bytes do not fit a block of {block_size} bytes")]
    DataTooLong { len: usize, block_size: u32 },

    #[error("buffer of {len} bytes does not match the block size {block_size}")]
    BufferSize { len: usize, block_size: u32 },

    #[error("block {block} is marked as bad")]
    BadBlock { block: u64 },

    #[error("pool size {pool_size} can not hold a single block of {block_size} bytes")]
    PoolTooSmall { pool_size: u64, block_size: u32 },

    #[error("not a valid block pool: {0}")]
    Corrupt(&'static str),

    #[error(transparent)]
    Region(#[from] pmem::Error),
}

/// The state of a block, stored along with its map entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// Holds data from a previous write.
    Used,
    /// Never written, reads as zeros.
    Free,
    /// Explicitly zeroed, reads as zeros.
    Zeroed,
    /// Marked bad, reads fail until the next write.
    Error,
}

impl BlockState {
    pub(crate) fn bits(self) -> u64 {
        match self {
            BlockState::Used => 0,
            BlockState::Free => 1,
            BlockState::Zeroed => 2,
            BlockState::Error => 3,
        }
    }

    pub(crate) fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => BlockState::Used,
            1 => BlockState::Free,
            2 => BlockState::Zeroed,
            _ => BlockState::Error,
        }
    }
}

/// Check that this library supports at least block pool layout `major.minor`.
pub fn check_version(major: u32, minor: u32) -> Result<(), pmem::Error> {
    VERSION.satisfies(major, minor)
}

/// Check the consistency of the block pool at `path`.
///
/// A `block_size` of zero accepts any block size, otherwise it must match the pool's. Returns
/// `Ok(false)` for a file that is not a consistent block pool.
pub fn check(path: impl AsRef<Path>, block_size: usize) -> Result<bool, BlkError> {
    let pool = match BlockPool::open(path) {
        Ok(pool) => pool,
        Err(BlkError::Corrupt(reason)) => {
            tracing::debug!(reason, "block pool check failed");
            return Ok(false);
        }
        Err(err) => return Err(err),
    };

    if block_size != 0 && block_size != pool.bsize() {
        tracing::debug!(
            expected = block_size,
            found = pool.bsize(),
            "block pool has a different block size"
        );
        return Ok(false);
    }

    Ok(true)
}
