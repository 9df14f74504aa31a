//! Tracing setup and the failure reporting surface.

use std::sync::Once;

use manifest::ChunkId;

use crate::error::LoadError;
use crate::registry::ModuleId;

static INIT: Once = Once::new();

/// Install a `fmt` subscriber filtered by `RUST_LOG`. Safe to call repeatedly.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Where chunk, binary and entry failures are reported.
pub trait ErrorSink {
    fn load_failed(&self, error: &LoadError);

    /// A chunk load failed, for its script or for one of its binaries.
    fn chunk_failed(&self, chunk: &ChunkId, error: &LoadError);

    fn entry_failed(&self, entry: &ModuleId, error: &anyhow::Error);
}

/// Reports failures as `tracing` error events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn load_failed(&self, error: &LoadError) {
        tracing::error!(
            id = error.subject(),
            category = %error.category(),
            "{}",
            error
        );
    }

    fn chunk_failed(&self, chunk: &ChunkId, error: &LoadError) {
        tracing::error!(
            chunk = %chunk,
            id = error.subject(),
            category = %error.category(),
            script = error.is_chunk_failure(),
            "{}",
            error
        );
    }

    fn entry_failed(&self, entry: &ModuleId, error: &anyhow::Error) {
        let category = error
            .downcast_ref::<LoadError>()
            .map(|e| e.category().as_str())
            .unwrap_or("module");
        tracing::error!(entry = %entry, category, "error importing entry module: {:#}", error);
    }
}
