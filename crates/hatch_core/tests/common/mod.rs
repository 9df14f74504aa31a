#![allow(dead_code)]

use futures::future::LocalBoxFuture;
use hatch_core::fetch::ByteStream;
use hatch_core::{
    BinaryExports, BinaryRuntime, BundledScripts, Capabilities, ChunkId, ChunkManifest, CompiledBinary, ErrorSink,
    ImportTable, Loader, LoaderConfig, LoadError, MemoryFetcher, ModuleId, Platform, RuntimeError, WasmtimeRuntime,
};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

/// Assemble a text-format module.
pub fn wasm(source: &str) -> Vec<u8> {
    wat::parse_str(source).expect("invalid module text")
}

/// A header followed by a truncated section: fetches fine, never compiles.
pub fn broken_wasm() -> Vec<u8> {
    b"\0asm\x01\0\0\0\xff".to_vec()
}

/// Loads run as local tasks; every async test drives the loader through here.
pub async fn local<F: Future>(body: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(body).await
}

/// Wraps the wasmtime runtime and records which primitives were called.
pub struct RecordingRuntime {
    pub engine: WasmtimeRuntime,
    capabilities: Capabilities,
    calls: RefCell<Vec<&'static str>>,
}

impl RecordingRuntime {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            engine: WasmtimeRuntime::new(capabilities),
            capabilities,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.borrow_mut().push(call);
    }
}

impl BinaryRuntime for RecordingRuntime {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn compile_streaming(&self, bytes: ByteStream) -> LocalBoxFuture<'static, Result<CompiledBinary, RuntimeError>> {
        self.record("compile_streaming");
        self.engine.compile_streaming(bytes)
    }

    fn instantiate_streaming(
        &self,
        bytes: ByteStream,
        imports: ImportTable,
    ) -> LocalBoxFuture<'static, Result<BinaryExports, RuntimeError>> {
        self.record("instantiate_streaming");
        self.engine.instantiate_streaming(bytes, imports)
    }

    fn instantiate_compiled(
        &self,
        module: CompiledBinary,
        imports: ImportTable,
    ) -> LocalBoxFuture<'static, Result<BinaryExports, RuntimeError>> {
        self.record("instantiate_compiled");
        self.engine.instantiate_compiled(module, imports)
    }

    fn instantiate_bytes(
        &self,
        bytes: Vec<u8>,
        imports: ImportTable,
    ) -> LocalBoxFuture<'static, Result<BinaryExports, RuntimeError>> {
        self.record("instantiate_bytes");
        self.engine.instantiate_bytes(bytes, imports)
    }
}

/// Keeps every reported failure for inspection.
#[derive(Default)]
pub struct RecordingSink {
    pub loads: RefCell<Vec<LoadError>>,
    pub chunks: RefCell<Vec<(ChunkId, LoadError)>>,
    pub entries: RefCell<Vec<(ModuleId, String)>>,
}

impl ErrorSink for RecordingSink {
    fn load_failed(&self, error: &LoadError) {
        self.loads.borrow_mut().push(error.clone());
    }

    fn chunk_failed(&self, chunk: &ChunkId, error: &LoadError) {
        self.chunks.borrow_mut().push((chunk.clone(), error.clone()));
    }

    fn entry_failed(&self, entry: &ModuleId, error: &anyhow::Error) {
        self.entries.borrow_mut().push((entry.clone(), format!("{:#}", error)));
    }
}

pub struct Harness {
    pub loader: Loader,
    pub scripts: Rc<BundledScripts>,
    pub fetcher: Rc<MemoryFetcher>,
    pub runtime: Rc<RecordingRuntime>,
    pub sink: Rc<RecordingSink>,
}

pub fn harness(
    manifest: ChunkManifest,
    config: LoaderConfig,
    scripts: BundledScripts,
    fetcher: MemoryFetcher,
    runtime: RecordingRuntime,
) -> Harness {
    let scripts = Rc::new(scripts);
    let fetcher = Rc::new(fetcher);
    let runtime = Rc::new(runtime);
    let sink = Rc::new(RecordingSink::default());

    let platform = Platform::new(scripts.clone(), fetcher.clone(), runtime.clone()).with_error_sink(sink.clone());
    let loader = Loader::new(manifest, config, platform);

    Harness {
        loader,
        scripts,
        fetcher,
        runtime,
        sink,
    }
}

/// A loader with nothing deployed, for registry-only tests.
pub fn bare_loader() -> Loader {
    harness(
        ChunkManifest::new(),
        LoaderConfig::default(),
        BundledScripts::new(),
        MemoryFetcher::new(),
        RecordingRuntime::new(Capabilities::BUFFERED_ONLY),
    )
    .loader
}

pub fn load_error(err: &anyhow::Error) -> &LoadError {
    err.downcast_ref::<LoadError>().expect("not a LoadError")
}
