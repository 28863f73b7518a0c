use pmem::MapOptions;
use pmem_log::{LogError, LogPool, DEFAULT_POOL_SIZE, HEADER_SIZE, MIN_POOL_SIZE};
use proptest::prelude::*;

fn walk_all(pool: &LogPool, chunk_size: usize) -> Vec<Vec<u8>> {
    let mut seen = vec![];
    pool.walk(chunk_size, |chunk| {
        seen.push(chunk.to_vec());
        true
    })
    .unwrap();
    seen
}

#[test]
fn default_pool_single_append() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = LogPool::create_default(dir.path().join("default.log")).unwrap();

    assert_eq!(log.nbyte(), DEFAULT_POOL_SIZE - HEADER_SIZE);
    assert_eq!(log.tell(), 0);

    log.append(b"persistent logging!").unwrap();
    assert_eq!(walk_all(&log, 0), vec![b"persistent logging!".to_vec()]);
}

#[test]
fn entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reopen.log");

    let mut log = LogPool::create(&path, 1 << 16).unwrap();
    log.append(b"first").unwrap();
    log.append(b"second").unwrap();
    let offset = log.tell();
    log.close().unwrap();

    let log = LogPool::open(&path).unwrap();
    assert_eq!(log.tell(), offset);
    assert_eq!(walk_all(&log, 0), vec![b"first".to_vec(), b"second".to_vec()]);
    assert!(pmem_log::check(&path).unwrap());
}

#[test]
fn log_full_leaves_log_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = LogPool::create(dir.path().join("full.log"), MIN_POOL_SIZE).unwrap();

    let big = vec![0x5a; (log.nbyte() / 2) as usize];
    log.append(&big).unwrap();
    let offset = log.tell();

    let err = log.append(&big).unwrap_err();
    assert!(matches!(err, LogError::LogFull { .. }), "{err}");
    assert_eq!(log.tell(), offset);
    assert_eq!(walk_all(&log, 0), vec![big.clone()]);

    // A batch that does not fit as a whole is not partially applied either.
    let err = log.append_all(&[&b"fits"[..], &big[..]]).unwrap_err();
    assert!(matches!(err, LogError::LogFull { .. }), "{err}");
    assert_eq!(log.tell(), offset);
}

#[test]
fn chunked_walk_splits_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = LogPool::create(dir.path().join("chunks.log"), 1 << 16).unwrap();

    log.append(b"abcdefghij").unwrap();
    log.append(b"xy").unwrap();

    assert_eq!(
        walk_all(&log, 4),
        vec![
            b"abcd".to_vec(),
            b"efgh".to_vec(),
            b"ij".to_vec(),
            b"xy".to_vec()
        ]
    );

    // Restartable, and not consuming anything.
    assert_eq!(log.entries(4).unwrap().count(), 4);
    assert_eq!(log.entries(0).unwrap().count(), 2);
}

#[test]
fn walk_stops_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = LogPool::create(dir.path().join("stop.log"), 1 << 16).unwrap();
    log.append_all(&[&b"one"[..], &b"two"[..], &b"three"[..]]).unwrap();

    let mut visited = 0;
    log.walk(0, |_| {
        visited += 1;
        visited < 2
    })
    .unwrap();
    assert_eq!(visited, 2);
}

#[test]
fn rewind_hides_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rewind.log");
    let mut log = LogPool::create(&path, 1 << 16).unwrap();

    log.append(b"old").unwrap();
    log.rewind().unwrap();
    assert_eq!(log.tell(), 0);
    assert!(walk_all(&log, 0).is_empty());

    log.append(b"new").unwrap();
    drop(log);

    let log = LogPool::open(&path).unwrap();
    assert_eq!(walk_all(&log, 0), vec![b"new".to_vec()]);
}

#[test]
fn empty_append_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = LogPool::create(dir.path().join("empty.log"), 1 << 16).unwrap();
    log.append(b"").unwrap();
    assert_eq!(log.tell(), 0);
    assert!(walk_all(&log, 0).is_empty());
}

#[test]
fn create_and_open_failures() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fail.log");

    assert!(matches!(
        LogPool::create(&path, MIN_POOL_SIZE - 1),
        Err(LogError::PoolTooSmall { .. })
    ));

    let log = LogPool::create(&path, MIN_POOL_SIZE).unwrap();
    drop(log);
    assert!(matches!(
        LogPool::create(&path, MIN_POOL_SIZE),
        Err(LogError::Region(pmem::Error::Io { .. }))
    ));

    let garbage = dir.path().join("garbage.log");
    std::fs::write(&garbage, vec![0xee; 3 * HEADER_SIZE as usize]).unwrap();
    assert!(matches!(LogPool::open(&garbage), Err(LogError::Corrupt(_))));
    assert!(!pmem_log::check(&garbage).unwrap());
}

#[test]
fn create_over_longer_file_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reused.log");
    std::fs::write(&path, vec![0; 1 << 20]).unwrap();

    let mut log = LogPool::create_with(&path, 1 << 16, &MapOptions::create()).unwrap();
    log.append(b"kept").unwrap();
    log.close().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1 << 16);

    let log = LogPool::open(&path).unwrap();
    assert_eq!(log.nbyte(), (1 << 16) - HEADER_SIZE);
    assert_eq!(walk_all(&log, 0), vec![b"kept".to_vec()]);
}

#[test]
fn versions() {
    assert!(pmem_log::check_version(1, 0).is_ok());
    assert!(pmem_log::check_version(1000, 1000).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn walk_replays_appends(entries in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..512), 0..32)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prop.log");
        let mut log = LogPool::create(&path, 1 << 16).unwrap();

        for entry in &entries {
            log.append(entry).unwrap();
        }

        prop_assert_eq!(&walk_all(&log, 0), &entries);
        log.close().unwrap();

        let log = LogPool::open(&path).unwrap();
        prop_assert_eq!(&walk_all(&log, 0), &entries);
    }
}
