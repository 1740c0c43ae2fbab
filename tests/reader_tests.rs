#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{DIGEST, MockRegistry, insecure_all, no_credentials, reference};
use stargz_fs::cache::ChunkCache;
use stargz_fs::fs::filesystem::{BackgroundSectionReader, PrioritySectionReader};
use stargz_fs::reader::{ArchiveReader, ReaderError};
use stargz_fs::remote::{Resolver, UrlReader};
use stargz_fs::task::BackgroundTaskManager;

fn memory_cache() -> Arc<ChunkCache> {
    Arc::new(ChunkCache::Memory(stargz_fs::cache::MemoryCache::new()))
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

/// A small archive with a couple of files; chunk size 100.
fn sample_blob() -> (Vec<u8>, Vec<u8>) {
    let content = payload(350);
    let mut builder = stargz::Builder::new(100);
    builder.add_dir("etc", 0o755, 0, 0);
    builder.add_file("etc/os-release", b"NAME=test\nID=test\n", 0o644);
    builder.add_file("etc/data", &content, 0o600);
    builder.add_file("etc/empty", b"", 0o644);
    (builder.finish(), content)
}

async fn local_reader(blob: &[u8]) -> ArchiveReader<Vec<u8>> {
    ArchiveReader::new(
        Arc::new(blob.to_vec()),
        blob.len() as u64,
        memory_cache(),
        true,
    )
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn whole_file_round_trips() {
    let (blob, content) = sample_blob();
    let reader = local_reader(&blob).await;

    let file = reader.open_file("etc/data").unwrap();
    let mut out = vec![0_u8; content.len()];
    assert_eq!(file.read_at(&mut out, 0).await.unwrap(), content.len());
    assert_eq!(out, content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn byte_by_byte_reads_match() {
    let (blob, content) = sample_blob();
    let reader = local_reader(&blob).await;
    let file = reader.open_file("etc/data").unwrap();

    let mut out = Vec::with_capacity(content.len());
    let mut one = [0_u8; 1];
    for offset in 0..content.len() as u64 {
        assert_eq!(file.read_at(&mut one, offset).await.unwrap(), 1);
        out.push(one[0]);
    }
    assert_eq!(out, content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn arbitrary_splits_match() {
    let (blob, content) = sample_blob();
    let reader = local_reader(&blob).await;
    let file = reader.open_file("etc/data").unwrap();

    // Prime-sized windows so reads straddle every chunk boundary.
    for window in [1_usize, 3, 17, 99, 101, 149, 350] {
        let mut out = Vec::new();
        let mut offset = 0_u64;
        loop {
            let mut buf = vec![0_u8; window];
            let n = file.read_at(&mut buf, offset).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            offset += n as u64;
        }
        assert_eq!(out, content, "window {window} corrupted the stream");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_past_eof_are_short() {
    let (blob, content) = sample_blob();
    let reader = local_reader(&blob).await;
    let file = reader.open_file("etc/data").unwrap();

    let mut buf = vec![0_u8; 100];
    assert_eq!(file.read_at(&mut buf, content.len() as u64 - 10).await.unwrap(), 10);
    assert_eq!(file.read_at(&mut buf, content.len() as u64).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_files_read_empty() {
    let (blob, _) = sample_blob();
    let reader = local_reader(&blob).await;
    let file = reader.open_file("etc/empty").unwrap();

    let mut buf = [0_u8; 8];
    assert_eq!(file.read_at(&mut buf, 0).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_entries_fail_to_open() {
    let (blob, _) = sample_blob();
    let reader = local_reader(&blob).await;
    assert!(matches!(
        reader.open_file("etc/nope"),
        Err(ReaderError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupted_chunks_are_rejected() {
    let (blob, _) = sample_blob();
    let archive = stargz::Archive::open(&blob, blob.len() as u64).await.unwrap();
    let (_, entry) = archive.lookup("etc/data").unwrap();
    let tamper_at = entry.chunks[1].blob_offset as usize + 12;

    let mut bad = blob.clone();
    bad[tamper_at] ^= 0xff;

    let reader = local_reader(&bad).await;
    let file = reader.open_file("etc/data").unwrap();
    let mut out = vec![0_u8; 350];
    let err = file.read_at(&mut out, 0).await.unwrap_err();
    assert!(
        matches!(err, ReaderError::Corrupt { .. }),
        "expected Corrupt, got {err:?}"
    );
}

/// Build the full remote stack over a mock registry serving `blob`.
async fn remote_stack(
    registry: &Arc<MockRegistry>,
    http_chunk_size: u64,
) -> (
    ArchiveReader<PrioritySectionReader<MockRegistry>>,
    Arc<UrlReader<MockRegistry>>,
    Arc<BackgroundTaskManager>,
) {
    let size = registry.blob.len() as u64;
    let resolver = Arc::new(
        Resolver::new(Arc::clone(registry), &insecure_all(), no_credentials()).unwrap(),
    );
    let (url, transport) = resolver.resolve(&reference(), DIGEST).await.unwrap();
    let remote = Arc::new(UrlReader::new(
        resolver,
        reference(),
        DIGEST,
        url,
        transport,
        size,
        http_chunk_size,
        memory_cache(),
        Duration::from_secs(60),
    ));
    let tasks = BackgroundTaskManager::new(2, Duration::from_millis(5));
    let priority = Arc::new(PrioritySectionReader::new(
        Arc::clone(&remote),
        Arc::clone(&tasks),
    ));
    let reader = ArchiveReader::new(priority, size, memory_cache(), true)
        .await
        .unwrap();
    (reader, remote, tasks)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_read_issues_one_ranged_get() {
    // One small file at the front of the blob, a large filler after it so
    // the TOC and footer reads at open time stay out of the file's http
    // chunk region.
    let original = payload(300);
    // Noise-like filler so compression cannot pull the TOC into the http
    // chunk region the small file occupies.
    let filler: Vec<u8> = (0..8192_u64)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 7) as u8)
        .collect();
    let mut builder = stargz::Builder::new(50_000);
    builder.add_file("etc/os-release", &original, 0o644);
    builder.add_file("var/filler", &filler, 0o644);
    let blob = builder.finish();

    let registry = Arc::new(MockRegistry::serving(blob));
    let (reader, _, _) = remote_stack(&registry, 512).await;
    let after_open = registry.request_count();

    let file = reader.open_file("etc/os-release").unwrap();
    let mut out = vec![0_u8; 300];
    assert_eq!(file.read_at(&mut out, 0).await.unwrap(), 300);
    assert_eq!(out, original);
    assert_eq!(
        registry.request_count(),
        after_open + 1,
        "cold read should cost exactly one ranged GET"
    );

    // Warm read: identical bytes, zero additional requests.
    let mut warm = vec![0_u8; 300];
    assert_eq!(file.read_at(&mut warm, 0).await.unwrap(), 300);
    assert_eq!(warm, out);
    assert_eq!(registry.request_count(), after_open + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prefetch_commit_hydrates_the_prefix_only() {
    let eager = payload(400);
    let lazy = payload(6000);
    let mut builder = stargz::Builder::new(200);
    builder.add_file("eager", &eager, 0o644);
    builder.add_landmark();
    builder.add_file("lazy", &lazy, 0o644);
    let blob = builder.finish();

    let registry = Arc::new(MockRegistry::serving(blob));
    let (reader, _, _) = remote_stack(&registry, 256).await;

    let commit = reader.prefetch().await.unwrap().expect("landmark present");
    commit.commit().await.unwrap();
    let after_prefetch = registry.request_count();

    // The eager file is now fully cached: no further network traffic.
    let file = reader.open_file("eager").unwrap();
    let mut out = vec![0_u8; 400];
    assert_eq!(file.read_at(&mut out, 0).await.unwrap(), 400);
    assert_eq!(out, eager);
    assert_eq!(registry.request_count(), after_prefetch);

    // The lazy file sits past the landmark and still costs requests.
    let file = reader.open_file("lazy").unwrap();
    let mut out = vec![0_u8; 6000];
    assert_eq!(file.read_at(&mut out, 0).await.unwrap(), 6000);
    assert_eq!(out, lazy);
    assert!(
        registry.request_count() > after_prefetch,
        "reading past the prefetch prefix should reach the network"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn archives_without_landmark_skip_prefetch() {
    let (blob, _) = sample_blob();
    let registry = Arc::new(MockRegistry::serving(blob));
    let (reader, _, _) = remote_stack(&registry, 512).await;
    assert!(reader.prefetch().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_fetch_hydrates_whole_archive() {
    let (blob, content) = sample_blob();
    let registry = Arc::new(MockRegistry::serving(blob));
    let (reader, remote, tasks) = remote_stack(&registry, 512).await;

    let background = BackgroundSectionReader::new(
        Arc::clone(&remote),
        Arc::clone(&tasks),
        Duration::from_secs(120),
    );
    reader.fetch_all(&background).await.unwrap();
    let after_fetch = registry.request_count();

    // Every read is now cache-resident.
    let file = reader.open_file("etc/data").unwrap();
    let mut out = vec![0_u8; content.len()];
    assert_eq!(file.read_at(&mut out, 0).await.unwrap(), content.len());
    assert_eq!(out, content);
    assert_eq!(registry.request_count(), after_fetch);

    // Re-running skips every already-cached chunk.
    reader.fetch_all(&background).await.unwrap();
    assert_eq!(registry.request_count(), after_fetch);
}
