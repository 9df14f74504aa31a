use futures::future::{self, FutureExt, LocalBoxFuture, Shared};
use manifest::{ChunkId, ChunkManifest};
use std::future::Future;
use std::rc::{Rc, Weak};

use crate::binary::{BinaryRuntime, BinarySlots};
use crate::chunks::ChunkTable;
use crate::config::LoaderConfig;
use crate::exports::Exports;
use crate::fetch::ByteFetcher;
use crate::logging::{ErrorSink, TracingErrorSink};
use crate::registry::{Factory, Module, ModuleId, ModuleRegistry};
use crate::transport::{ChunkPayload, DeliveryQueue, ScriptTransport};

/// Capabilities the hosting environment lends to the loader.
#[derive(Clone)]
pub struct Platform {
    pub scripts: Rc<dyn ScriptTransport>,
    pub fetcher: Rc<dyn ByteFetcher>,
    pub runtime: Rc<dyn BinaryRuntime>,
    pub errors: Rc<dyn ErrorSink>,
}

impl Platform {
    pub fn new(
        scripts: Rc<dyn ScriptTransport>,
        fetcher: Rc<dyn ByteFetcher>,
        runtime: Rc<dyn BinaryRuntime>,
    ) -> Self {
        Self {
            scripts,
            fetcher,
            runtime,
            errors: Rc::new(TracingErrorSink),
        }
    }

    pub fn with_error_sink(mut self, errors: Rc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }
}

pub(crate) struct LoaderInner {
    pub(crate) manifest: ChunkManifest,
    pub(crate) config: LoaderConfig,
    pub(crate) platform: Platform,
    pub(crate) registry: ModuleRegistry,
    pub(crate) chunks: ChunkTable,
    pub(crate) binaries: BinarySlots,
    pub(crate) deliveries: DeliveryQueue,
}

/// Handle to the loader shared by the host, running modules and in-flight
/// loads. Lives as long as the hosting process; cheap to clone.
///
/// Chunk and binary loads run as local tasks, so the loader must be driven
/// from inside a [`tokio::task::LocalSet`].
#[derive(Clone)]
pub struct Loader {
    pub(crate) inner: Rc<LoaderInner>,
}

/// Non-owning loader handle for callbacks that outlive a load.
#[derive(Clone)]
pub struct WeakLoader {
    inner: Weak<LoaderInner>,
}

impl WeakLoader {
    pub fn upgrade(&self) -> Option<Loader> {
        self.inner.upgrade().map(|inner| Loader { inner })
    }
}

/// Start `work` now on the local task set and share its outcome. The task
/// runs to completion whether or not anyone holds the handle.
pub(crate) fn spawn_shared<T, W, C>(work: W, cancelled: C) -> Shared<LocalBoxFuture<'static, T>>
where
    T: Clone + 'static,
    W: Future<Output = T> + 'static,
    C: FnOnce() -> T + 'static,
{
    let task = tokio::task::spawn_local(work);
    async move {
        match task.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => cancelled(),
        }
    }
    .boxed_local()
    .shared()
}

/// The program's entry: the chunks it needs and the module to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPoint {
    pub chunks: Vec<ChunkId>,
    pub module: ModuleId,
}

impl EntryPoint {
    pub fn new(module: impl Into<ModuleId>) -> Self {
        Self {
            chunks: Vec::new(),
            module: module.into(),
        }
    }

    pub fn with_chunk(mut self, chunk: impl Into<ChunkId>) -> Self {
        self.chunks.push(chunk.into());
        self
    }
}

impl Loader {
    pub fn new(manifest: ChunkManifest, config: LoaderConfig, platform: Platform) -> Self {
        let chunks = ChunkTable::default();
        for chunk in &manifest.installed {
            chunks.mark_installed(chunk.clone());
        }
        tracing::debug!(
            chunks = manifest.chunks.len(),
            binaries = manifest.binaries.len(),
            installed = manifest.installed.len(),
            "loader created"
        );

        Self {
            inner: Rc::new(LoaderInner {
                manifest,
                config,
                platform,
                registry: ModuleRegistry::new(),
                chunks,
                binaries: BinarySlots::default(),
                deliveries: DeliveryQueue::new(),
            }),
        }
    }

    pub fn manifest(&self) -> &ChunkManifest {
        &self.inner.manifest
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakLoader {
        WeakLoader {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Register a statically known module.
    pub fn register_module<F>(&self, id: impl Into<ModuleId>, body: F)
    where
        F: Fn(&Module, &Loader) -> anyhow::Result<()> + 'static,
    {
        self.inner.registry.register(id.into(), Rc::new(body));
    }

    /// Execute a module (once) and return its exports.
    ///
    /// Fails with [`LoadError::MissingModule`](crate::LoadError::MissingModule)
    /// when no factory is known, e.g. because its chunk is not installed yet.
    /// An error returned by the factory is passed through as is.
    pub fn require(&self, id: impl Into<ModuleId>) -> anyhow::Result<Exports> {
        self.inner.registry.require(self, &id.into())
    }

    pub fn has_module(&self, id: &str) -> bool {
        self.inner.registry.has_module(id)
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.inner.registry.is_loaded(id)
    }

    pub fn cached_exports(&self, id: &str) -> Option<Exports> {
        self.inner.registry.cached_exports(id)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    /// Merge a delivered payload.
    ///
    /// If any chunk it names is pending, the payload is staged on those
    /// chunks and reaches the registry only when one of them installs; the
    /// other chunks it names are installed along with it. Otherwise nobody is
    /// waiting: its modules are merged at once and every chunk it names
    /// becomes installed, so a later request needs no fetch.
    pub fn on_chunk_payload_delivered(&self, chunk_ids: Vec<ChunkId>, modules: Vec<(ModuleId, Factory)>) {
        let payload = Rc::new(ChunkPayload::new(chunk_ids, modules));
        let staged = payload
            .chunk_ids
            .iter()
            .filter(|chunk| self.inner.chunks.stage(chunk, &payload))
            .count();

        if staged > 0 {
            tracing::debug!(chunks = ?payload.chunk_ids, staged, "payload staged on pending chunks");
            return;
        }

        let merged = self.inner.registry.merge(payload.modules.iter().cloned());
        for chunk in &payload.chunk_ids {
            tracing::debug!(chunk = %chunk, modules = merged, "chunk installed ahead of request");
            self.inner.chunks.mark_installed(chunk.clone());
        }
    }

    /// Load the entry's chunks, then run the entry module.
    ///
    /// On failure the error goes to the platform's error sink and the entry
    /// module is not run.
    pub async fn run_entry(&self, entry: &EntryPoint) -> anyhow::Result<Exports> {
        let loads: Vec<_> = entry
            .chunks
            .iter()
            .map(|chunk| self.ensure_chunk(chunk.clone()))
            .collect();

        let result = match future::try_join_all(loads).await {
            Ok(_) => self.require(entry.module.clone()),
            Err(err) => Err(err.into()),
        };

        match &result {
            Ok(_) => tracing::info!(entry = %entry.module, "entry module running"),
            Err(err) => self.inner.platform.errors.entry_failed(&entry.module, err),
        }
        result
    }
}
