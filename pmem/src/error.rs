use std::path::PathBuf;

/// Errors of the mapped region and its durability primitives.
///
/// Every bounds violation carries the offending offset, the requested length and the limit it
/// ran into, so a caller can decide whether to retry with other parameters.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot allocate {length} bytes for {}: {source}", path.display())]
    AllocationError {
        path: PathBuf,
        length: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("range {offset}+{length} exceeds region length {limit}")]
    InvalidRange {
        offset: u64,
        length: u64,
        limit: u64,
    },

    #[error("access {offset}+{length} is out of bounds for region length {limit}")]
    OutOfBounds {
        offset: u64,
        length: u64,
        limit: u64,
    },

    #[error("invalid cursor position {offset}")]
    InvalidOffset { offset: i128 },

    #[error("offset {offset} is not aligned for an 8-byte cell")]
    Misaligned { offset: u64 },

    #[error("region is closed")]
    RegionClosed,

    #[error("version {required_major}.{required_minor} required, library is {major}.{minor}")]
    Version {
        required_major: u32,
        required_minor: u32,
        major: u32,
        minor: u32,
    },

    #[error("i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
