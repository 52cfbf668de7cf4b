//! Session lifecycle and cache behaviour across sessions.

mod common;

use std::sync::Arc;
use tempfile::TempDir;

use common::{FlakySource, GateSource, URL, ZipBuilder, noise};
use remotezip::{
    ArchiveSession, ByteRange, CacheConfig, CacheKey, CacheStore, Error, ErrorKind,
    MemorySource, SessionConfig, SessionState, Tier,
};

fn sample() -> Vec<u8> {
    ZipBuilder::new()
        .stored("README.md", b"# remote archive\n")
        .deflated("src/lib.rs", &b"pub fn answer() -> u32 { 42 }\n".repeat(50))
        .build()
}

fn disk_config(dir: &TempDir) -> SessionConfig {
    SessionConfig::default().with_cache(CacheConfig::at(dir.path()))
}

#[tokio::test]
async fn entries_need_a_loaded_directory() {
    let source = Arc::new(MemorySource::new(sample()));
    let session = ArchiveSession::new(URL, source.clone(), SessionConfig::default());

    assert_eq!(session.state(), SessionState::Uninitialized);
    let err = session.load_entry("README.md").await.unwrap_err();
    assert!(matches!(err, Error::DirectoryNotLoaded));
    assert_eq!(err.kind(), ErrorKind::DirectoryNotLoaded);
    assert!(session.start_entry("README.md").is_err());
    assert!(session.entries().is_err());
    assert!(source.requests().is_empty());
}

#[tokio::test]
async fn directory_load_is_idempotent() {
    let source = Arc::new(MemorySource::new(sample()));
    let session = ArchiveSession::new(URL, source.clone(), SessionConfig::default());

    let first = session.load_directory().await.unwrap();
    let second = session.load_directory().await.unwrap();
    assert_eq!(first.listing(), second.listing());
    assert_eq!(source.requests().len(), 1);
    assert_eq!(session.state(), SessionState::DirectoryReady);
    assert_eq!(
        session.entries().unwrap(),
        vec![("README.md".to_string(), 17), ("src/lib.rs".to_string(), 1500)]
    );
}

#[tokio::test]
async fn unknown_path_is_entry_not_found() {
    let session = ArchiveSession::new(
        URL,
        Arc::new(MemorySource::new(sample())),
        SessionConfig::default(),
    );
    session.load_directory().await.unwrap();
    assert!(matches!(
        session.load_entry("missing.txt").await,
        Err(Error::EntryNotFound(_))
    ));
}

#[tokio::test]
async fn loaded_entry_is_served_without_network() {
    let source = Arc::new(MemorySource::new(sample()));
    let session = ArchiveSession::new(URL, source.clone(), SessionConfig::default());
    session.load_directory().await.unwrap();

    let first = session.load_entry("README.md").await.unwrap();
    let again = session.load_entry("README.md").await.unwrap();
    assert_eq!(&first[..], b"# remote archive\n");
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(source.requests().len(), 2);
    assert!(session.directory().unwrap().get("README.md").unwrap().data.is_some());
}

#[tokio::test]
async fn a_second_session_reuses_the_disk_cache() {
    let dir = TempDir::new().unwrap();

    let first_source = Arc::new(MemorySource::new(sample()));
    let first = ArchiveSession::new(URL, first_source.clone(), disk_config(&dir));
    first.load_directory().await.unwrap();
    let lib = first.load_entry("src/lib.rs").await.unwrap();

    let second_source = Arc::new(MemorySource::new(sample()));
    let second = ArchiveSession::new(URL, second_source.clone(), disk_config(&dir));
    let directory = second.load_directory().await.unwrap();
    assert_eq!(directory.len(), 2);
    assert_eq!(second.load_entry("src/lib.rs").await.unwrap(), lib);
    assert!(second_source.requests().is_empty());
}

#[tokio::test]
async fn clear_cache_forces_the_network_again() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(sample()));
    let session = ArchiveSession::new(URL, source.clone(), disk_config(&dir));
    session.load_directory().await.unwrap();
    session.load_entry("README.md").await.unwrap();
    assert_eq!(source.requests().len(), 2);

    session.clear_cache().await.unwrap();
    assert!(session.directory().unwrap().get("README.md").unwrap().data.is_none());
    session.load_entry("README.md").await.unwrap();
    assert_eq!(source.requests().len(), 3);

    let fresh_source = Arc::new(MemorySource::new(sample()));
    let fresh = ArchiveSession::new(URL, fresh_source.clone(), disk_config(&dir));
    fresh.load_directory().await.unwrap();
    assert_eq!(fresh_source.requests().len(), 1);
}

#[tokio::test]
async fn clear_memory_cache_falls_back_to_disk() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(sample()));
    let session = ArchiveSession::new(URL, source.clone(), disk_config(&dir));
    session.load_directory().await.unwrap();
    session.load_entry("src/lib.rs").await.unwrap();

    session.clear_memory_cache().await;
    let key = CacheKey::entry(URL, "src/lib.rs");
    assert_eq!(session.cache().describe(&key).unwrap().tier, Tier::Disk);

    session.load_entry("src/lib.rs").await.unwrap();
    assert_eq!(source.requests().len(), 2);
    assert_eq!(session.cache().describe(&key).unwrap().tier, Tier::Both);
}

#[tokio::test]
async fn server_without_ranges_downloads_the_archive_once() {
    let source = Arc::new(MemorySource::new(sample()).ignoring_ranges());
    let session = ArchiveSession::new(URL, source.clone(), SessionConfig::default());

    let directory = session.load_directory().await.unwrap();
    assert!(!directory.supports_ranges);
    session.load_entry("README.md").await.unwrap();
    session.load_entry("src/lib.rs").await.unwrap();

    assert_eq!(source.full_downloads(), 1);
    assert_eq!(session.transferred_bytes(), sample().len() as u64);
}

#[tokio::test]
async fn failed_directory_load_can_be_retried() {
    let source = Arc::new(FlakySource::new(MemorySource::new(sample()), &[1]));
    let session = ArchiveSession::new(URL, source, SessionConfig::default());

    let err = session.load_directory().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(session.state(), SessionState::Uninitialized);

    session.load_directory().await.unwrap();
    assert_eq!(session.state(), SessionState::DirectoryReady);
}

#[tokio::test]
async fn unreadable_cached_directory_is_refetched() {
    let cache = Arc::new(CacheStore::new(&CacheConfig::memory_only()));
    cache
        .put(&CacheKey::directory(URL), Arc::from(&b"not json"[..]), Tier::Both)
        .await;

    let source = Arc::new(MemorySource::new(sample()));
    let session =
        ArchiveSession::with_cache(URL, source.clone(), SessionConfig::default(), cache);
    assert_eq!(session.load_directory().await.unwrap().len(), 2);
    assert_eq!(source.requests().len(), 1);
}

#[tokio::test]
async fn a_failed_entry_leaves_the_session_usable() {
    let mut archive = sample();
    let at = archive.windows(6).position(|w| w == b"remote").unwrap();
    archive[at] = b'R';

    let session = ArchiveSession::new(
        URL,
        Arc::new(MemorySource::new(archive)),
        SessionConfig::default(),
    );
    session.load_directory().await.unwrap();

    let err = session.load_entry("README.md").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    assert!(session.load_entry("src/lib.rs").await.is_ok());
    assert_eq!(session.state(), SessionState::DirectoryReady);
}

#[tokio::test]
async fn cancel_pause_and_resume_by_path() {
    let data = noise(3000, 21);
    let archive = ZipBuilder::new().stored("big.bin", &data).build();
    let source = Arc::new(GateSource::new(MemorySource::new(archive)));
    source.release(1);
    let config = SessionConfig::default().with_segment_size(1000);
    let session = ArchiveSession::new(URL, source.clone(), config);
    session.load_directory().await.unwrap();

    assert!(!session.cancel_entry("big.bin"));

    let task = session.start_entry("big.bin").unwrap();
    source.wait_for_waiting(1).await;
    assert_eq!(session.state(), SessionState::EntryLoading);
    assert!(session.pause_entry("big.bin"));
    assert!(session.resume_entry("big.bin"));
    assert!(session.cancel_entry("big.bin"));
    assert!(matches!(task.wait().await, Err(Error::Cancelled(_))));
    assert_eq!(session.state(), SessionState::DirectoryReady);

    // A fresh load starts a new task.
    source.release(10);
    assert_eq!(&session.load_entry("big.bin").await.unwrap()[..], &data[..]);
}

#[tokio::test]
async fn cancel_discards_an_interrupted_download() {
    let data = noise(3000, 22);
    let archive = ZipBuilder::new().stored("big.bin", &data).build();
    // Request 1 is the directory, 2 the first segment, 3 the second.
    let source = Arc::new(FlakySource::new(MemorySource::new(archive), &[3]));
    let config = SessionConfig::default().with_segment_size(1000);
    let session = ArchiveSession::new(URL, source.clone(), config);
    session.load_directory().await.unwrap();

    let resume_offset =
        |s: &ArchiveSession| s.directory().unwrap().get("big.bin").unwrap().resume_offset;
    assert!(session.load_entry("big.bin").await.is_err());
    assert_eq!(resume_offset(&session), 1000);

    assert!(session.cancel_entry("big.bin"));
    assert_eq!(resume_offset(&session), 0);
    assert!(!session.cancel_entry("big.bin"));

    assert_eq!(&session.load_entry("big.bin").await.unwrap()[..], &data[..]);
    let header = 30 + 7;
    assert_eq!(
        source.inner.requests()[1..],
        [
            ByteRange::span(0, header + 1000),
            ByteRange::span(0, header + 1000),
            ByteRange::span(header + 1000, header + 2000),
            ByteRange::span(header + 2000, header + 3000),
        ]
    );
}

#[tokio::test]
async fn evicted_entries_lose_their_data() {
    let archive = ZipBuilder::new()
        .stored("a.bin", &noise(100, 31))
        .stored("b.bin", &noise(100, 32))
        .build();
    let source = Arc::new(MemorySource::new(archive));
    let config = SessionConfig::default().with_cache(CacheConfig {
        root: None,
        memory_limit: Some(100),
    });
    let session = ArchiveSession::new(URL, source.clone(), config);
    session.load_directory().await.unwrap();

    session.load_entry("a.bin").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    session.load_entry("b.bin").await.unwrap();

    let directory = session.directory().unwrap();
    assert!(directory.get("a.bin").unwrap().data.is_none());
    assert!(directory.get("b.bin").unwrap().data.is_some());
    assert!(!session.cache().in_memory(&CacheKey::entry(URL, "a.bin")));

    // Evicted from a memory-only cache, so the network is needed again.
    session.load_entry("a.bin").await.unwrap();
    assert_eq!(source.requests().len(), 4);
}
