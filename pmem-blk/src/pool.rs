use core::sync::atomic::{AtomicU64, Ordering};
use std::path::Path;

use pmem::{MapOptions, Region};

use crate::layout::{decode_entry, encode_entry, Header, HEADER_SIZE};
use crate::{BlkError, BlockState, DEFAULT_POOL_SIZE};

/// A block pool, opened by [`BlockPool::create`] or [`BlockPool::open`].
pub struct BlockPool {
    region: Region,
    header: Header,
    /// The one slot not referenced by any map entry.
    spare: u64,
}

impl BlockPool {
    /// Create a new pool of `pool_size` bytes holding blocks of `block_size` bytes.
    ///
    /// The file must not exist yet. As many blocks as fit are created, see
    /// [`nblock`](Self::nblock). All of them start out reading as zeros.
    pub fn create(
        path: impl AsRef<Path>,
        block_size: usize,
        pool_size: u64,
    ) -> Result<Self, BlkError> {
        Self::create_with(path, block_size, pool_size, &MapOptions::create_new())
    }

    /// Create a new pool of [`DEFAULT_POOL_SIZE`] bytes.
    pub fn create_default(path: impl AsRef<Path>, block_size: usize) -> Result<Self, BlkError> {
        Self::create(path, block_size, DEFAULT_POOL_SIZE)
    }

    /// Create a new pool, mapping the file with custom options.
    ///
    /// Options that allow an existing file resize it to exactly `pool_size` bytes.
    pub fn create_with(
        path: impl AsRef<Path>,
        block_size: usize,
        pool_size: u64,
        options: &MapOptions,
    ) -> Result<Self, BlkError> {
        let header = Header::plan(block_size, pool_size)?;
        let options = MapOptions {
            create: true,
            ..options.clone()
        };

        let mut region = Region::map_file(path, pool_size, &options)?;

        // Block `n` starts on slot `n`, the last slot is the spare.
        let map: Vec<u8> = (0..header.nblock)
            .flat_map(|block| encode_entry(block, BlockState::Free).to_le_bytes())
            .collect();
        region.write_at(header.map_offset, &map)?;
        region.persist(header.map_offset, map.len() as u64)?;

        // The header goes last, a pool interrupted before this point does not open.
        region.zero_at(0, HEADER_SIZE)?;
        region.write_at(0, &header.encode())?;
        region.persist(0, HEADER_SIZE)?;

        tracing::debug!(
            path = %region.path().display(),
            pool_size,
            block_size,
            nblock = header.nblock,
            "created block pool"
        );

        Ok(BlockPool {
            region,
            spare: header.nblock,
            header,
        })
    }

    /// Open an existing pool, validating its header and map.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BlkError> {
        let region = Region::open(path)?;
        if region.len() < HEADER_SIZE {
            return Err(BlkError::Corrupt("file too small for a block pool"));
        }

        let header = Header::decode(region.slice(0, HEADER_SIZE)?)?;
        header.validate(region.len())?;

        let mut pool = BlockPool {
            region,
            header,
            spare: 0,
        };
        pool.spare = pool.find_spare()?;

        tracing::debug!(
            path = %pool.region.path().display(),
            block_size = header.block_size,
            nblock = header.nblock,
            spare = pool.spare,
            "opened block pool"
        );

        Ok(pool)
    }

    /// Open an existing pool, expecting blocks of `block_size` bytes.
    ///
    /// The block size recorded in the pool always wins. A mismatch is logged and otherwise
    /// ignored, a `block_size` of zero skips the comparison.
    pub fn open_with_block_size(
        path: impl AsRef<Path>,
        block_size: usize,
    ) -> Result<Self, BlkError> {
        let pool = Self::open(path)?;

        if block_size != 0 && block_size != pool.bsize() {
            tracing::warn!(
                requested = block_size,
                block_size = pool.bsize(),
                "ignoring requested block size, using the one of the pool"
            );
        }

        Ok(pool)
    }

    /// The size of each block in bytes.
    pub fn bsize(&self) -> usize {
        self.header.block_size as usize
    }

    /// The number of blocks in the pool.
    pub fn nblock(&self) -> u64 {
        self.header.nblock
    }

    pub fn is_pmem(&self) -> bool {
        self.region.is_pmem()
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Read a whole block.
    pub fn read(&self, block: u64) -> Result<Vec<u8>, BlkError> {
        let mut buf = vec![0; self.bsize()];
        self.read_into(block, &mut buf)?;
        Ok(buf)
    }

    /// Read a whole block into `buf`, which must be exactly one block long.
    pub fn read_into(&self, block: u64, buf: &mut [u8]) -> Result<(), BlkError> {
        if buf.len() != self.bsize() {
            return Err(BlkError::BufferSize {
                len: buf.len(),
                block_size: self.header.block_size,
            });
        }

        let (slot, state) = self.entry(block)?;
        match state {
            BlockState::Used => self.region.read_at(self.header.slot_at(slot), buf)?,
            BlockState::Free | BlockState::Zeroed => buf.fill(0),
            BlockState::Error => return Err(BlkError::BadBlock { block }),
        }

        Ok(())
    }

    /// Atomically replace the contents of a block.
    ///
    /// Data shorter than the block is padded with zeros. Writing a block marked bad clears the
    /// mark.
    pub fn write(&mut self, block: u64, data: &[u8]) -> Result<(), BlkError> {
        self.entry(block)?;
        let slot = self.stage(data)?;
        self.publish(block, slot, BlockState::Used)?;

        tracing::trace!(block, slot, len = data.len(), "wrote block");
        Ok(())
    }

    /// Atomically set a block to read as zeros.
    pub fn set_zero(&mut self, block: u64) -> Result<(), BlkError> {
        let (slot, _) = self.entry(block)?;
        self.publish(block, slot, BlockState::Zeroed)?;
        tracing::trace!(block, "zeroed block");
        Ok(())
    }

    /// Mark a block as bad, reads of it fail until it is written again.
    pub fn set_error(&mut self, block: u64) -> Result<(), BlkError> {
        let (slot, _) = self.entry(block)?;
        self.publish(block, slot, BlockState::Error)?;
        tracing::debug!(block, "marked block as bad");
        Ok(())
    }

    pub fn state(&self, block: u64) -> Result<BlockState, BlkError> {
        Ok(self.entry(block)?.1)
    }

    /// Persist outstanding writes and unmap the pool.
    pub fn close(mut self) -> Result<(), BlkError> {
        self.region.close()?;
        Ok(())
    }

    /// Copy `data` into the spare slot and persist it, without making it visible.
    pub(crate) fn stage(&mut self, data: &[u8]) -> Result<u64, BlkError> {
        let block_size = self.bsize();
        if data.len() > block_size {
            return Err(BlkError::DataTooLong {
                len: data.len(),
                block_size: self.header.block_size,
            });
        }

        let slot = self.spare;
        let at = self.header.slot_at(slot);
        self.region.write_at(at, data)?;
        self.region
            .zero_at(at + data.len() as u64, (block_size - data.len()) as u64)?;
        self.region.persist(at, block_size as u64)?;
        Ok(slot)
    }

    /// Point the map entry of `block` at `slot` and persist it, the commit of every block update.
    pub(crate) fn publish(
        &mut self,
        block: u64,
        slot: u64,
        state: BlockState,
    ) -> Result<(), BlkError> {
        self.switch(block, slot, state)?;
        self.region.persist(self.header.map_entry_at(block), 8)?;
        Ok(())
    }

    /// Store the new map entry of `block`, without persisting it.
    ///
    /// A slot given up by the store is the spare from here on, whether or not the entry is
    /// persisted afterwards. Visible to this handle, the switch is never undone.
    pub(crate) fn switch(
        &mut self,
        block: u64,
        slot: u64,
        state: BlockState,
    ) -> Result<(), BlkError> {
        let raw = self
            .map_cell(block)?
            .swap(encode_entry(slot, state), Ordering::AcqRel);

        let (old, _) = decode_entry(raw);
        if old != slot {
            self.spare = old;
        }

        Ok(())
    }

    pub(crate) fn spare(&self) -> u64 {
        self.spare
    }

    fn entry(&self, block: u64) -> Result<(u64, BlockState), BlkError> {
        let raw = self.map_cell(block)?.load(Ordering::Acquire);
        Ok(decode_entry(raw))
    }

    fn map_cell(&self, block: u64) -> Result<&AtomicU64, BlkError> {
        if block >= self.header.nblock {
            return Err(BlkError::IndexOutOfRange {
                block,
                nblock: self.header.nblock,
            });
        }

        Ok(self.region.atomic_u64(self.header.map_entry_at(block))?)
    }

    /// Every slot but one must be referenced exactly once, the remaining one is the spare.
    fn find_spare(&self) -> Result<u64, BlkError> {
        let mut referenced = vec![false; self.header.nslot() as usize];

        for block in 0..self.header.nblock {
            let (slot, _) = self.entry(block)?;
            let Some(seen) = referenced.get_mut(slot as usize) else {
                return Err(BlkError::Corrupt("map entry beyond the data area"));
            };

            if *seen {
                return Err(BlkError::Corrupt("slot referenced twice in the map"));
            }

            *seen = true;
        }

        // With `nblock` distinct references among `nblock + 1` slots exactly one is left.
        let spare = referenced
            .iter()
            .position(|&seen| !seen)
            .ok_or(BlkError::Corrupt("no spare slot"))?;

        Ok(spare as u64)
    }
}
