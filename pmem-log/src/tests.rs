use crate::layout::{Header, FRAME_HEADER, HEADER_SIZE};
use crate::{LogError, LogPool};

fn with_pool(pool_size: u64, method: impl FnOnce(&std::path::Path, LogPool)) {
    let dir = tempfile::tempdir().expect("to create a temporary directory");
    let path = dir.path().join("pool.log");
    let pool = LogPool::create(&path, pool_size).expect("to create a log pool");
    method(&path, pool)
}

fn collect(pool: &LogPool) -> Vec<Vec<u8>> {
    pool.entries(0).unwrap().map(<[u8]>::to_vec).collect()
}

#[test]
fn commit_not() {
    with_pool(1 << 16, |path, mut pool| {
        pool.append(b"committed").unwrap();
        let offset = pool.tell();

        // Payload written (and flushed by the close below), but the offset is never stored.
        let mut entry = pool.entry();
        entry.copy_frame(b"Hello, world!").unwrap();
        drop(entry);

        assert_eq!(pool.tell(), offset);
        pool.close().unwrap();

        let mut pool = LogPool::open(path).unwrap();
        assert_eq!(pool.tell(), offset);
        assert_eq!(collect(&pool), vec![b"committed".to_vec()]);
        assert!(crate::check(path).unwrap());

        // The abandoned bytes are simply overwritten.
        pool.append(b"next").unwrap();
        assert_eq!(collect(&pool), vec![b"committed".to_vec(), b"next".to_vec()]);
    });
}

#[test]
fn commit_once() {
    with_pool(1 << 16, |_, mut pool| {
        let mut entry = pool.entry();
        entry.copy_frame(b"one").unwrap();
        entry.copy_frame(b"two").unwrap();
        let end = entry.commit().unwrap();

        assert_eq!(end, 2 * FRAME_HEADER + 6);
        assert_eq!(pool.tell(), end);
        assert_eq!(collect(&pool), vec![b"one".to_vec(), b"two".to_vec()]);
    });
}

#[test]
fn entry_reserve_is_checked_before_writing() {
    with_pool(2 * HEADER_SIZE, |_, mut pool| {
        let nbyte = pool.nbyte();
        let entry = pool.entry();
        assert!(matches!(
            entry.reserve(nbyte + 1),
            Err(LogError::LogFull { requested, available }) if requested == nbyte + 1 && available == nbyte
        ));
    });
}

#[test]
fn frame_chain() {
    let mut data = vec![];
    assert!(LogPool::frames_consistent(&data));

    data.extend_from_slice(&3u64.to_le_bytes());
    data.extend_from_slice(b"abc");
    assert!(LogPool::frames_consistent(&data));

    // A frame header announcing more than is there.
    data.extend_from_slice(&100u64.to_le_bytes());
    data.extend_from_slice(b"short");
    assert!(!LogPool::frames_consistent(&data));

    // A truncated frame header.
    assert!(!LogPool::frames_consistent(&data[..13]));
}

#[test]
fn header_rejects_corruption() {
    let header = Header::new(1 << 20);
    let encoded = header.encode();
    assert_eq!(Header::decode(&encoded).unwrap(), header);

    let mut flipped = encoded;
    flipped[20] ^= 0x1;
    assert!(matches!(
        Header::decode(&flipped),
        Err(LogError::Corrupt("header checksum mismatch"))
    ));

    let mut magic = encoded;
    magic[0] = b'X';
    assert!(matches!(Header::decode(&magic), Err(LogError::Corrupt("bad magic"))));

    assert!(matches!(
        header.validate(1 << 19),
        Err(LogError::Corrupt(_))
    ));
}
