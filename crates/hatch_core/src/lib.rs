//! On-demand module loading runtime.
//!
//! A [`Loader`] owns the module registry, the chunk state table and the binary
//! module slots for the life of the hosting process. Modules are required
//! synchronously; chunks and binary modules are loaded on first use and every
//! concurrent requester shares one load.

pub mod binary;
pub mod chunks;
pub mod config;
pub mod error;
pub mod exports;
pub mod fetch;
pub mod host;
pub mod loader;
pub mod logging;
pub mod registry;
pub mod transport;

pub use binary::{
    host_func, BinaryExports, BinaryHandle, BinaryRuntime, BinaryStatus, Capabilities, CompiledBinary, HostFunc,
    ImportSource, ImportTable, RuntimeError, Strategy, Val, WasmtimeRuntime,
};
pub use chunks::{ChunkHandle, ChunkStatus};
pub use config::LoaderConfig;
pub use error::{FailureCategory, LoadError};
pub use exports::Exports;
pub use fetch::{ByteFetcher, ByteStream, CachingFetcher, FetchError, FsFetcher, MemoryFetcher};
pub use host::{input_imports, surface_imports, InputState, SharedSurface, Surface, TickDriver};
pub use loader::{EntryPoint, Loader, Platform, WeakLoader};
pub use logging::{ErrorSink, TracingErrorSink};
pub use manifest::{BinaryId, ChunkId, ChunkManifest};
pub use registry::{factory, Factory, Module, ModuleId, ModuleRegistry};
pub use transport::{BundledScripts, ChunkPayload, DeliverySink, ScriptRequest, ScriptTransport, TransportError};
