use std::rc::Rc;

use super::imports::ImportSource;
use super::runtime::{BinaryExports, BinaryRuntime, Capabilities, RuntimeError};
use crate::fetch::{collect_bytes, ByteStream};

/// Ways of turning a fetched payload into an instance, best first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Compile while bytes stream in, in parallel with producing the imports.
    CompileStreaming,
    /// Compile and instantiate straight from the stream.
    InstantiateStreaming,
    /// Buffer the whole payload, then instantiate.
    Buffered,
}

impl Strategy {
    pub const PRIORITY: [Strategy; 3] = [
        Strategy::CompileStreaming,
        Strategy::InstantiateStreaming,
        Strategy::Buffered,
    ];

    pub fn applies(self, capabilities: Capabilities, deferred_imports: bool) -> bool {
        match self {
            Strategy::CompileStreaming => capabilities.compile_streaming && deferred_imports,
            Strategy::InstantiateStreaming => capabilities.instantiate_streaming,
            Strategy::Buffered => true,
        }
    }

    pub fn select(capabilities: Capabilities, deferred_imports: bool) -> Strategy {
        Self::PRIORITY
            .into_iter()
            .find(|s| s.applies(capabilities, deferred_imports))
            .unwrap_or(Strategy::Buffered)
    }

    pub(crate) async fn run(
        self,
        runtime: Rc<dyn BinaryRuntime>,
        bytes: ByteStream,
        imports: ImportSource,
    ) -> Result<BinaryExports, RuntimeError> {
        match self {
            Strategy::CompileStreaming => {
                let (compiled, imports) =
                    futures::join!(runtime.compile_streaming(bytes), imports.resolve());
                runtime.instantiate_compiled(compiled?, imports).await
            }
            Strategy::InstantiateStreaming => {
                let imports = imports.resolve().await;
                runtime.instantiate_streaming(bytes, imports).await
            }
            Strategy::Buffered => {
                let bytes = collect_bytes(bytes).await?;
                let imports = imports.resolve().await;
                runtime.instantiate_bytes(bytes, imports).await
            }
        }
    }
}
