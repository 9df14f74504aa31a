mod common;

use common::{harness, local, Harness, RecordingRuntime};
use hatch_core::{
    factory, BundledScripts, Capabilities, ChunkId, ChunkManifest, ChunkStatus, FailureCategory, LoadError,
    LoaderConfig, MemoryFetcher, ModuleId,
};
use std::time::Duration;
use tokio::time::Instant;

fn lazy_chunk_script(scripts: BundledScripts) -> BundledScripts {
    scripts.with_script("1.bootstrap.js", |sink| {
        sink.deliver(
            vec![ChunkId::from("1")],
            vec![(
                ModuleId::from("lazy"),
                factory(|module, _| {
                    module.exports().set("ready", true);
                    Ok(())
                }),
            )],
        );
        Ok(())
    })
}

fn setup(scripts: BundledScripts, config: LoaderConfig) -> Harness {
    let mut manifest = ChunkManifest::new().with_installed("main");
    manifest.add_chunk("1", vec![]);
    harness(
        manifest,
        config,
        scripts,
        MemoryFetcher::new(),
        RecordingRuntime::new(Capabilities::BUFFERED_ONLY),
    )
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_fetch() {
    local(async {
        let h = setup(
            lazy_chunk_script(BundledScripts::new().with_latency(Duration::from_millis(50))),
            LoaderConfig::default(),
        );

        let first = h.loader.ensure_chunk("1");
        let second = h.loader.ensure_chunk("1");
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Pending);

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a, Ok(()));
        assert_eq!(b, Ok(()));
        assert_eq!(h.scripts.load_count(), 1);
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Installed);

        let lazy = h.loader.require("lazy").unwrap();
        assert_eq!(*lazy.get::<bool>("ready").unwrap(), true);

        // Installed chunks resolve without another fetch.
        h.loader.ensure_chunk("1").await.unwrap();
        assert_eq!(h.scripts.load_count(), 1);
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_load_completes_after_handle_is_dropped() {
    local(async {
        let h = setup(
            lazy_chunk_script(BundledScripts::new().with_latency(Duration::from_millis(50))),
            LoaderConfig::default(),
        );

        drop(h.loader.ensure_chunk("1"));
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Pending);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Installed);
        assert!(h.loader.has_module("lazy"));
        assert_eq!(h.scripts.load_count(), 1);

        h.loader.ensure_chunk("1").await.unwrap();
        assert_eq!(h.scripts.load_count(), 1);
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_initially_installed_chunk_needs_no_fetch() {
    local(async {
        let h = setup(BundledScripts::new(), LoaderConfig::default());
        assert_eq!(h.loader.chunk_status("main"), ChunkStatus::Installed);
        h.loader.ensure_chunk("main").await.unwrap();
        assert_eq!(h.scripts.load_count(), 0);
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_preemptive_delivery_installs_without_fetch() {
    local(async {
        let h = setup(lazy_chunk_script(BundledScripts::new()), LoaderConfig::default());

        h.loader.sink().deliver(
            vec![ChunkId::from("1")],
            vec![(ModuleId::from("lazy"), factory(|_, _| Ok(())))],
        );
        assert_eq!(h.loader.pump(), 1);
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Installed);
        assert!(h.loader.has_module("lazy"));

        h.loader.ensure_chunk("1").await.unwrap();
        assert_eq!(h.scripts.load_count(), 0);
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_timeout_resets_chunk_and_allows_retry() {
    local(async {
        let h = setup(
            lazy_chunk_script(BundledScripts::new().with_latency(Duration::from_secs(600))),
            LoaderConfig::default(),
        );

        let start = Instant::now();
        let err = h.loader.ensure_chunk("1").await.unwrap_err();
        assert_eq!(start.elapsed(), Duration::from_millis(120_000));
        assert_eq!(
            err,
            LoadError::ChunkLoadTimeout {
                chunk: ChunkId::from("1"),
                src: "1.bootstrap.js".to_string(),
            }
        );
        assert_eq!(err.to_string(), "loading chunk 1 failed (timeout: 1.bootstrap.js)");
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Unrequested);
        assert!(!h.loader.has_module("lazy"));

        // A retry is a fresh load, not a replay.
        let retry = h.loader.ensure_chunk("1").await.unwrap_err();
        assert_eq!(retry.category(), FailureCategory::Timeout);
        assert_eq!(h.scripts.load_count(), 2);

        let reported = h.sink.chunks.borrow();
        assert_eq!(reported.len(), 2);
        assert!(reported
            .iter()
            .all(|(chunk, e)| chunk.as_str() == "1" && e.category() == FailureCategory::Timeout));
        assert!(h.sink.loads.borrow().is_empty());
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_configured_timeout() {
    local(async {
        let h = setup(
            lazy_chunk_script(BundledScripts::new().with_latency(Duration::from_secs(10))),
            LoaderConfig::default().with_chunk_timeout(Duration::from_secs(2)),
        );

        let start = Instant::now();
        let err = h.loader.ensure_chunk("1").await.unwrap_err();
        assert_eq!(err.category(), FailureCategory::Timeout);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requesters_share_failure() {
    local(async {
        let h = setup(BundledScripts::new(), LoaderConfig::default());

        let (a, b) = tokio::join!(h.loader.ensure_chunk("1"), h.loader.ensure_chunk("1"));
        let expected = LoadError::ChunkLoadNetworkError {
            chunk: ChunkId::from("1"),
            src: "1.bootstrap.js".to_string(),
            reason: "no script is served at 1.bootstrap.js".to_string(),
        };
        assert_eq!(a, Err(expected.clone()));
        assert_eq!(b, Err(expected));
        assert_eq!(h.scripts.load_count(), 1);
        assert_eq!(h.sink.chunks.borrow().len(), 1);
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Unrequested);
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_script_error() {
    local(async {
        let scripts = BundledScripts::new().with_script("1.bootstrap.js", |_| anyhow::bail!("unexpected token"));
        let h = setup(scripts, LoaderConfig::default());

        let err = h.loader.ensure_chunk("1").await.unwrap_err();
        assert_eq!(
            err,
            LoadError::ChunkLoadScriptError {
                chunk: ChunkId::from("1"),
                src: "1.bootstrap.js".to_string(),
                reason: "unexpected token".to_string(),
            }
        );
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Unrequested);
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_script_that_delivers_nothing() {
    local(async {
        let scripts = BundledScripts::new().with_script("1.bootstrap.js", |_| Ok(()));
        let h = setup(scripts, LoaderConfig::default());

        let err = h.loader.ensure_chunk("1").await.unwrap_err();
        assert_eq!(err.category(), FailureCategory::Missing);
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Unrequested);
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_script_delivering_several_chunks() {
    local(async {
        // Chunk 1's script also carries chunk 2, which nobody asked for yet.
        let scripts = BundledScripts::new().with_script("1.bootstrap.js", |sink| {
            sink.deliver(
                vec![ChunkId::from("1"), ChunkId::from("2")],
                vec![
                    (ModuleId::from("lazy"), factory(|_, _| Ok(()))),
                    (ModuleId::from("extra"), factory(|_, _| Ok(()))),
                ],
            );
            Ok(())
        });
        let h = setup(scripts, LoaderConfig::default());

        h.loader.ensure_chunk("1").await.unwrap();
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Installed);
        assert_eq!(h.loader.chunk_status("2"), ChunkStatus::Installed);
        assert!(h.loader.has_module("extra"));

        h.loader.ensure_chunk("2").await.unwrap();
        assert_eq!(h.scripts.load_count(), 1);
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_ensure_chunks() {
    local(async {
        let h = setup(lazy_chunk_script(BundledScripts::new()), LoaderConfig::default());
        h.loader.ensure_chunks(["main", "1"]).await.unwrap();
        assert_eq!(h.loader.chunk_status("1"), ChunkStatus::Installed);

        let err = h.loader.ensure_chunks(["1", "404"]).await.unwrap_err();
        assert_eq!(err.category(), FailureCategory::Network);
    })
    .await
}
