//! On-media layout of a block pool.
//!
//! ```text
//! 0        4096                          data offset
//! | header | map: one u64 per block, ... | slot 0 | slot 1 | ... | slot nblock |
//! ```
//!
//! Header fields, little-endian:
//!
//! ```text
//! 0 magic | 8 major | 12 minor | 16 block size | 20 reserved | 24 nblock | 32 stride
//!         | 40 map offset | 48 data offset | 56 pool size | 64 crc of 0..64
//! ```
//!
//! There is one slot more than there are blocks. A map entry holds the slot currently backing its
//! block and the block state in the top two bits. The one slot no entry refers to is the spare.
use pmem::Version;

use crate::{BlkError, BlockState, MIN_BLOCK_SIZE};

pub(crate) const MAGIC: [u8; 8] = *b"PMEMBLK\0";
pub(crate) const HEADER_SIZE: u64 = 4096;
/// Slots are padded to whole cache lines.
pub(crate) const SLOT_ALIGN: u64 = 64;

const ENCODED: usize = 68;
const CHECKSUMMED: usize = 64;
const PAGE: u64 = 4096;

const STATE_SHIFT: u32 = 62;
const SLOT_MASK: u64 = (1 << STATE_SHIFT) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub version: Version,
    pub block_size: u32,
    pub nblock: u64,
    pub stride: u64,
    pub map_offset: u64,
    pub data_offset: u64,
    pub pool_size: u64,
}

impl Header {
    /// Fit as many blocks of `block_size` as possible into `pool_size`.
    pub(crate) fn plan(block_size: usize, pool_size: u64) -> Result<Self, BlkError> {
        let block_size = u32::try_from(block_size)
            .ok()
            .filter(|&bs| u64::from(bs) >= MIN_BLOCK_SIZE)
            .ok_or(BlkError::BlockSizeInvalid {
                block_size,
                min: MIN_BLOCK_SIZE,
            })?;

        let too_small = || BlkError::PoolTooSmall {
            pool_size,
            block_size,
        };

        let stride = round_up(u64::from(block_size), SLOT_ALIGN);
        let available = pool_size
            .checked_sub(HEADER_SIZE + stride)
            .ok_or_else(too_small)?;

        // Ignoring the padding of the map this is an upper bound, walk down until it fits.
        let mut nblock = available / (stride + 8);
        loop {
            if nblock == 0 {
                return Err(too_small());
            }

            let header = Self::with_blocks(block_size, stride, nblock, pool_size);
            if header.data_end() <= pool_size {
                return Ok(header);
            }

            nblock -= 1;
        }
    }

    fn with_blocks(block_size: u32, stride: u64, nblock: u64, pool_size: u64) -> Self {
        let map_offset = HEADER_SIZE;
        Header {
            version: crate::VERSION,
            block_size,
            nblock,
            stride,
            map_offset,
            data_offset: map_offset + round_up(nblock * 8, PAGE),
            pool_size,
        }
    }

    /// Number of physical slots, one more than blocks.
    pub(crate) fn nslot(&self) -> u64 {
        self.nblock + 1
    }

    pub(crate) fn data_end(&self) -> u64 {
        self.data_offset + self.nslot() * self.stride
    }

    pub(crate) fn map_entry_at(&self, block: u64) -> u64 {
        self.map_offset + 8 * block
    }

    pub(crate) fn slot_at(&self, slot: u64) -> u64 {
        self.data_offset + slot * self.stride
    }

    pub(crate) fn encode(&self) -> [u8; ENCODED] {
        let mut buf = [0u8; ENCODED];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.version.major.to_le_bytes());
        buf[12..16].copy_from_slice(&self.version.minor.to_le_bytes());
        buf[16..20].copy_from_slice(&self.block_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.nblock.to_le_bytes());
        buf[32..40].copy_from_slice(&self.stride.to_le_bytes());
        buf[40..48].copy_from_slice(&self.map_offset.to_le_bytes());
        buf[48..56].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[56..64].copy_from_slice(&self.pool_size.to_le_bytes());

        let crc = crc32fast::hash(&buf[..CHECKSUMMED]);
        buf[64..68].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, BlkError> {
        if buf.len() < ENCODED {
            return Err(BlkError::Corrupt("header too small"));
        }

        if buf[0..8] != MAGIC {
            return Err(BlkError::Corrupt("bad magic"));
        }

        let crc = u32::from_le_bytes(read_4(buf, 64));
        if crc != crc32fast::hash(&buf[..CHECKSUMMED]) {
            return Err(BlkError::Corrupt("header checksum mismatch"));
        }

        let version = Version {
            major: u32::from_le_bytes(read_4(buf, 8)),
            minor: u32::from_le_bytes(read_4(buf, 12)),
        };

        if version.major != crate::VERSION.major {
            return Err(BlkError::Corrupt("incompatible layout version"));
        }

        Ok(Header {
            version,
            block_size: u32::from_le_bytes(read_4(buf, 16)),
            nblock: read_u64(buf, 24),
            stride: read_u64(buf, 32),
            map_offset: read_u64(buf, 40),
            data_offset: read_u64(buf, 48),
            pool_size: read_u64(buf, 56),
        })
    }

    /// Check the header for internal consistency and against the mapped length.
    pub(crate) fn validate(&self, mapped: u64) -> Result<(), BlkError> {
        if self.pool_size != mapped {
            return Err(BlkError::Corrupt("pool size does not match the file"));
        }

        if u64::from(self.block_size) < MIN_BLOCK_SIZE
            || self.stride < u64::from(self.block_size)
            || self.stride % SLOT_ALIGN != 0
        {
            return Err(BlkError::Corrupt("invalid block size"));
        }

        if self.nblock == 0 || self.nblock > SLOT_MASK {
            return Err(BlkError::Corrupt("invalid block count"));
        }

        let map_end = self
            .nblock
            .checked_mul(8)
            .and_then(|len| len.checked_add(self.map_offset));
        let data_end = self
            .nslot()
            .checked_mul(self.stride)
            .and_then(|len| len.checked_add(self.data_offset));

        match (map_end, data_end) {
            (Some(map_end), Some(data_end))
                if self.map_offset >= HEADER_SIZE
                    && self.map_offset % 8 == 0
                    && map_end <= self.data_offset
                    && data_end <= self.pool_size => {}
            _ => return Err(BlkError::Corrupt("areas out of bounds")),
        }

        Ok(())
    }
}

pub(crate) fn encode_entry(slot: u64, state: BlockState) -> u64 {
    (state.bits() << STATE_SHIFT) | (slot & SLOT_MASK)
}

pub(crate) fn decode_entry(raw: u64) -> (u64, BlockState) {
    (raw & SLOT_MASK, BlockState::from_bits(raw >> STATE_SHIFT))
}

fn round_up(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}
