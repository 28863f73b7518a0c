use pmem::MapOptions;
use pmem_blk::{BlkError, BlockPool, BlockState, MIN_BLOCK_SIZE};
use proptest::prelude::*;

#[test]
fn write_close_reopen_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario.blk");

    let mut pool = BlockPool::create(&path, 256, 1 << 20).unwrap();
    assert_eq!(pool.bsize(), 256);
    assert!(pool.nblock() > 20);

    pool.write(20, b"Hello, persistent!").unwrap();
    pool.close().unwrap();

    let pool = BlockPool::open(&path).unwrap();
    let block = pool.read(20).unwrap();
    assert_eq!(&block[..18], b"Hello, persistent!");
    assert!(block[18..].iter().all(|&b| b == 0));
    assert_eq!(block.len() - 18, 238);
    assert!(pmem_blk::check(&path, 256).unwrap());
}

#[test]
fn fresh_blocks_read_as_zeros() {
    let dir = tempfile::tempdir().unwrap();
    let pool = BlockPool::create(dir.path().join("fresh.blk"), 512, 1 << 20).unwrap();

    for block in [0, 1, pool.nblock() - 1] {
        assert_eq!(pool.state(block).unwrap(), BlockState::Free);
        assert_eq!(pool.read(block).unwrap(), vec![0; 512]);
    }
}

#[test]
fn rewrite_replaces_whole_block() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = BlockPool::create(dir.path().join("rewrite.blk"), 128, 1 << 18).unwrap();

    pool.write(7, &[0xab; 128]).unwrap();
    pool.write(7, b"short").unwrap();

    let block = pool.read(7).unwrap();
    assert_eq!(&block[..5], b"short");
    assert!(block[5..].iter().all(|&b| b == 0));
    assert_eq!(pool.state(7).unwrap(), BlockState::Used);
}

#[test]
fn zeroed_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zero.blk");
    let mut pool = BlockPool::create(&path, 256, 1 << 20).unwrap();

    pool.write(4, &[0xff; 256]).unwrap();
    pool.set_zero(4).unwrap();
    assert_eq!(pool.state(4).unwrap(), BlockState::Zeroed);
    assert_eq!(pool.read(4).unwrap(), vec![0; 256]);
    drop(pool);

    let pool = BlockPool::open(&path).unwrap();
    assert_eq!(pool.read(4).unwrap(), vec![0; 256]);
}

#[test]
fn bad_block_until_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("error.blk");
    let mut pool = BlockPool::create(&path, 256, 1 << 20).unwrap();

    pool.write(9, b"lost").unwrap();
    pool.set_error(9).unwrap();
    assert!(matches!(pool.read(9), Err(BlkError::BadBlock { block: 9 })));
    pool.close().unwrap();

    let mut pool = BlockPool::open(&path).unwrap();
    assert_eq!(pool.state(9).unwrap(), BlockState::Error);
    assert!(matches!(pool.read(9), Err(BlkError::BadBlock { block: 9 })));

    pool.write(9, b"found").unwrap();
    assert_eq!(&pool.read(9).unwrap()[..5], b"found");
}

#[test]
fn argument_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = BlockPool::create(dir.path().join("args.blk"), 256, 1 << 20).unwrap();
    let nblock = pool.nblock();

    assert!(matches!(
        pool.read(nblock),
        Err(BlkError::IndexOutOfRange { block, .. }) if block == nblock
    ));
    assert!(matches!(
        pool.write(nblock, b"x"),
        Err(BlkError::IndexOutOfRange { .. })
    ));
    assert!(matches!(
        pool.set_zero(u64::MAX),
        Err(BlkError::IndexOutOfRange { .. })
    ));
    assert!(matches!(
        pool.write(0, &[1; 257]),
        Err(BlkError::DataTooLong { len: 257, block_size: 256 })
    ));
    assert!(matches!(
        pool.read_into(0, &mut [0; 255]),
        Err(BlkError::BufferSize { len: 255, .. })
    ));

    // Failed writes leave the block alone.
    assert_eq!(pool.state(0).unwrap(), BlockState::Free);
}

#[test]
fn create_failures() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        BlockPool::create(dir.path().join("tiny.blk"), MIN_BLOCK_SIZE as usize - 1, 1 << 20),
        Err(BlkError::BlockSizeInvalid { .. })
    ));
    assert!(matches!(
        BlockPool::create(dir.path().join("huge.blk"), 1 << 33, 1 << 20),
        Err(BlkError::BlockSizeInvalid { .. })
    ));
    assert!(matches!(
        BlockPool::create(dir.path().join("small.blk"), 4096, 8192),
        Err(BlkError::PoolTooSmall { .. })
    ));

    let path = dir.path().join("twice.blk");
    drop(BlockPool::create(&path, 64, 1 << 16).unwrap());
    assert!(matches!(
        BlockPool::create(&path, 64, 1 << 16),
        Err(BlkError::Region(pmem::Error::Io { .. }))
    ));

    let garbage = dir.path().join("garbage.blk");
    std::fs::write(&garbage, vec![0x17; 1 << 16]).unwrap();
    assert!(matches!(BlockPool::open(&garbage), Err(BlkError::Corrupt(_))));
    assert!(!pmem_blk::check(&garbage, 0).unwrap());
}

#[test]
fn block_size_mismatch_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mismatch.blk");
    drop(BlockPool::create(&path, 512, 1 << 20).unwrap());

    let pool = BlockPool::open_with_block_size(&path, 1024).unwrap();
    assert_eq!(pool.bsize(), 512);
    drop(pool);

    assert!(pmem_blk::check(&path, 0).unwrap());
    assert!(pmem_blk::check(&path, 512).unwrap());
    assert!(!pmem_blk::check(&path, 1024).unwrap());
}

#[test]
fn create_over_longer_file_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reused.blk");
    std::fs::write(&path, vec![0; 1 << 20]).unwrap();

    let mut pool = BlockPool::create_with(&path, 64, 1 << 16, &MapOptions::create()).unwrap();
    let nblock = pool.nblock();
    pool.write(2, b"kept").unwrap();
    pool.close().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1 << 16);

    let pool = BlockPool::open(&path).unwrap();
    assert_eq!(pool.nblock(), nblock);
    assert_eq!(&pool.read(2).unwrap()[..4], b"kept");
    assert!(pmem_blk::check(&path, 64).unwrap());
}

#[test]
fn versions() {
    assert!(pmem_blk::check_version(1, 0).is_ok());
    assert!(pmem_blk::check_version(2, 0).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn last_write_wins(writes in prop::collection::vec((0u64..16, prop::collection::vec(any::<u8>(), 0..=64)), 0..48)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prop.blk");
        let mut pool = BlockPool::create(&path, 64, 1 << 16).unwrap();

        let mut expected = vec![vec![0u8; 64]; 16];
        for (block, data) in &writes {
            pool.write(*block, data).unwrap();
            let slot = &mut expected[*block as usize];
            slot.fill(0);
            slot[..data.len()].copy_from_slice(data);
        }
        pool.close().unwrap();

        let pool = BlockPool::open(&path).unwrap();
        for (block, data) in expected.iter().enumerate() {
            prop_assert_eq!(&pool.read(block as u64).unwrap(), data);
        }
    }
}
