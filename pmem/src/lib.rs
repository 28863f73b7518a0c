//! Persistent memory regions.
//!
//! A [`Region`] maps a fully allocated file for load/store access. Stores into the mapping are
//! ordinary memory writes and become durable with the primitives in [`persist`]: [`flush`] pushes
//! a range out of the CPU caches (or the page cache), [`drain`] waits for all prior flushes, and
//! [`persist()`] does both.
//!
//! On a DAX file system the mapping is established with `MAP_SYNC` and flushes are cache line
//! evictions. Anywhere else the same calls degrade to `msync`. Which one applies is reported by
//! [`is_pmem`], it is not an error to run on a regular file system.
//!
//! ```no_run
//! use pmem::Region;
//!
//! # fn main() -> pmem::Result<()> {
//! let mut region = Region::create("/mnt/pmem/data", 4096)?;
//! {
//!     let mut scope = region.persist_scope();
//!     scope.write(b"first")?;
//!     scope.write_at(1024, b"second")?;
//! } // one drain for both writes
//! region.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Not a transaction
//!
//! Nothing here orders the durability of two stores relative to each other, beyond what the caller
//! establishes with its own persist calls. The pool crates build their crash consistency on
//! exactly that: payload first, then one 8-byte commit store obtained from
//! [`Region::atomic_u64`].
#![cfg(target_family = "unix")]
mod error;
mod mmap;
mod options;
pub mod persist;
mod region;
mod scope;

pub use error::{Error, Result};
pub use options::{MapOptions, FORCE_PMEM_ENV};
pub use persist::{drain, flush, has_hw_drain, is_pmem, msync, persist};
pub use region::Region;
pub use scope::{Barrier, Scope};

/// A `major.minor` library or layout version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    /// The version of this library.
    pub const CURRENT: Version = Version { major: 1, minor: 0 };

    /// Succeeds if `self` is compatible with a requirement of `major.minor`.
    ///
    /// The major version must match exactly, the minor version must be at least the required one.
    pub fn satisfies(self, major: u32, minor: u32) -> Result<()> {
        if self.major == major && self.minor >= minor {
            Ok(())
        } else {
            Err(Error::Version {
                required_major: major,
                required_minor: minor,
                major: self.major,
                minor: self.minor,
            })
        }
    }
}

/// Check that this library provides at least version `major.minor`.
pub fn check_version(major: u32, minor: u32) -> Result<()> {
    Version::CURRENT.satisfies(major, minor)
}
