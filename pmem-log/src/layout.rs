//! On-media layout of a log pool.
//!
//! ```text
//! 0      8      12     16          24      32    40    44         64             72     4096
//! | magic | major | minor | pool size | start | end | crc | reserved | write offset | ... | data
//! ```
//!
//! All integers are little-endian. The CRC covers bytes `0..40`, the fields fixed at creation. The
//! write offset is relative to `start` and sits in its own cache line, it is the single word that
//! commits an append.
use pmem::Version;

use crate::LogError;

pub(crate) const MAGIC: [u8; 8] = *b"PMEMLOG\0";
pub(crate) const HEADER_SIZE: u64 = 4096;
pub(crate) const WRITE_OFFSET_AT: u64 = 64;
/// Length prefix of every entry.
pub(crate) const FRAME_HEADER: u64 = 8;

const CHECKSUMMED: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub version: Version,
    pub pool_size: u64,
    pub start: u64,
    pub end: u64,
}

impl Header {
    pub(crate) fn new(pool_size: u64) -> Self {
        Header {
            version: crate::VERSION,
            pool_size,
            start: HEADER_SIZE,
            end: pool_size,
        }
    }

    pub(crate) fn nbyte(&self) -> u64 {
        self.end - self.start
    }

    pub(crate) fn encode(&self) -> [u8; WRITE_OFFSET_AT as usize] {
        let mut buf = [0u8; WRITE_OFFSET_AT as usize];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.version.major.to_le_bytes());
        buf[12..16].copy_from_slice(&self.version.minor.to_le_bytes());
        buf[16..24].copy_from_slice(&self.pool_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.start.to_le_bytes());
        buf[32..40].copy_from_slice(&self.end.to_le_bytes());

        let crc = crc32fast::hash(&buf[..CHECKSUMMED]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, LogError> {
        if buf.len() < WRITE_OFFSET_AT as usize {
            return Err(LogError::Corrupt("header too small"));
        }

        if buf[0..8] != MAGIC {
            return Err(LogError::Corrupt("bad magic"));
        }

        let crc = u32::from_le_bytes(read_4(buf, 40));
        if crc != crc32fast::hash(&buf[..CHECKSUMMED]) {
            return Err(LogError::Corrupt("header checksum mismatch"));
        }

        let version = Version {
            major: u32::from_le_bytes(read_4(buf, 8)),
            minor: u32::from_le_bytes(read_4(buf, 12)),
        };

        if version.major != crate::VERSION.major {
            return Err(LogError::Corrupt("incompatible layout version"));
        }

        Ok(Header {
            version,
            pool_size: read_u64(buf, 16),
            start: read_u64(buf, 24),
            end: read_u64(buf, 32),
        })
    }

    /// Check the header against the actual size of the mapping.
    pub(crate) fn validate(&self, mapped: u64) -> Result<(), LogError> {
        if self.pool_size != mapped {
            return Err(LogError::Corrupt("pool size does not match the file"));
        }

        if self.start < HEADER_SIZE || self.start > self.end || self.end > self.pool_size {
            return Err(LogError::Corrupt("data area out of bounds"));
        }

        Ok(())
    }
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}
