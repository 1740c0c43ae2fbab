#![allow(clippy::unwrap_used, missing_docs)]

use stargz_fs::cache::{BlobCache as _, CacheError, MemoryCache, fingerprint};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetch_misses_on_absent_key() {
    let cache = MemoryCache::new();
    let mut buf = [0_u8; 4];
    assert!(matches!(
        cache.fetch("absent", &mut buf).await,
        Err(CacheError::Miss)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_then_fetch_round_trips() {
    let cache = MemoryCache::new();
    cache.add("k", b"payload").await;

    let mut buf = [0_u8; 7];
    let n = cache.fetch("k", &mut buf).await.unwrap();
    assert_eq!(n, 7);
    assert_eq!(&buf, b"payload");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_add_is_a_no_op_observationally() {
    let cache = MemoryCache::new();
    cache.add("k", b"same").await;
    cache.add("k", b"same").await;

    let mut buf = [0_u8; 4];
    assert_eq!(cache.fetch("k", &mut buf).await.unwrap(), 4);
    assert_eq!(&buf, b"same");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_overwrites_previous_value() {
    let cache = MemoryCache::new();
    cache.add("k", b"old!").await;
    cache.add("k", b"new!").await;

    let mut buf = [0_u8; 4];
    cache.fetch("k", &mut buf).await.unwrap();
    assert_eq!(&buf, b"new!");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_fetches_see_consistent_buffers() {
    let cache = std::sync::Arc::new(MemoryCache::new());
    cache.add("k", &[7_u8; 256]).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = std::sync::Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            let mut buf = [0_u8; 256];
            let n = cache.fetch("k", &mut buf).await.unwrap();
            assert_eq!(n, 256);
            assert!(buf.iter().all(|&b| b == 7));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[test]
fn fingerprint_is_stable_and_distinct() {
    let a = fingerprint("sha256:abc", 0, 4096);
    let b = fingerprint("sha256:abc", 0, 4096);
    let c = fingerprint("sha256:abc", 4096, 4096);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 64);
    assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
}
