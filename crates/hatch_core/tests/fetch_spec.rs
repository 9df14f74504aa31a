use cache::PayloadCache;
use futures::StreamExt;
use hatch_core::fetch::collect_bytes;
use hatch_core::{ByteFetcher, CachingFetcher, FetchError, FsFetcher, MemoryFetcher};
use std::path::PathBuf;
use std::time::Duration;

async fn dist_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hatch_fetch_{}_{}", name, std::process::id()));
    if dir.exists() {
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
    tokio::fs::create_dir_all(dir.join("assets")).await.unwrap();
    dir
}

#[tokio::test]
async fn test_fs_fetcher_streams_file() {
    let dir = dist_dir("stream").await;
    tokio::fs::write(dir.join("assets/abc.module.wasm"), b"\0asm\x01\x00\x00\x00")
        .await
        .unwrap();

    let fetcher = FsFetcher::new(&dir).with_read_chunk(3);
    let stream = fetcher.fetch("/assets/abc.module.wasm").await.unwrap();
    let pieces: Vec<_> = stream.collect().await;
    assert_eq!(pieces.len(), 3);

    let bytes = collect_bytes(fetcher.fetch("assets/abc.module.wasm").await.unwrap())
        .await
        .unwrap();
    assert_eq!(bytes, b"\0asm\x01\x00\x00\x00");

    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn test_fs_fetcher_errors() {
    let dir = dist_dir("errors").await;
    let fetcher = FsFetcher::new(&dir);

    let err = fetcher.fetch("assets/missing.wasm").await.err().unwrap();
    assert_eq!(
        err,
        FetchError::NotFound {
            address: "assets/missing.wasm".to_string()
        }
    );

    // Never read outside the dist directory.
    let err = fetcher.fetch("../etc/passwd").await.err().unwrap();
    assert_eq!(err.to_string(), "../etc/passwd: address escapes the fetch root");

    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_memory_fetcher_latency() {
    let fetcher = MemoryFetcher::new()
        .with_payload("a.wasm", vec![1, 2, 3])
        .with_latency(Duration::from_millis(80));

    let start = tokio::time::Instant::now();
    let bytes = collect_bytes(fetcher.fetch("a.wasm").await.unwrap()).await.unwrap();
    assert_eq!(bytes, vec![1, 2, 3]);
    assert_eq!(start.elapsed(), Duration::from_millis(80));
    assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_caching_fetcher_serves_hits_from_cache() {
    let inner = MemoryFetcher::new().with_payload("/dist/f00d.module.wasm", b"\0asm-payload".to_vec());
    let fetcher = CachingFetcher::new(inner, PayloadCache::temporary().unwrap());

    let first = collect_bytes(fetcher.fetch("/dist/f00d.module.wasm").await.unwrap())
        .await
        .unwrap();
    let second = collect_bytes(fetcher.fetch("/dist/f00d.module.wasm").await.unwrap())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(fetcher.inner().fetch_count(), 1);
    assert!(fetcher.cache().contains("/dist/f00d.module.wasm").unwrap());

    // Misses are not cached.
    assert!(fetcher.fetch("/dist/none.module.wasm").await.is_err());
    assert!(!fetcher.cache().contains("/dist/none.module.wasm").unwrap());
}
