use manifest::{BinaryId, ChunkId};
use std::fmt;
use thiserror::Error;

use crate::registry::ModuleId;

/// Coarse origin of a load failure, used for structured reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    Module,
    Timeout,
    Network,
    Script,
    Missing,
    Fetch,
    Compile,
    Instantiate,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Module => "module",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Network => "network",
            FailureCategory::Script => "script",
            FailureCategory::Missing => "missing",
            FailureCategory::Fetch => "fetch",
            FailureCategory::Compile => "compile",
            FailureCategory::Instantiate => "instantiate",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the loader itself.
///
/// `Clone` because a single failure is replayed to every holder of a shared
/// chunk or binary handle.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("cannot find module '{0}'")]
    MissingModule(ModuleId),

    #[error("module '{0}' threw during evaluation and will not be evaluated again")]
    ModuleFailed(ModuleId),

    #[error("loading chunk {chunk} failed (timeout: {src})")]
    ChunkLoadTimeout { chunk: ChunkId, src: String },

    #[error("loading chunk {chunk} failed (error: {src}): {reason}")]
    ChunkLoadNetworkError {
        chunk: ChunkId,
        src: String,
        reason: String,
    },

    #[error("loading chunk {chunk} failed (script: {src}): {reason}")]
    ChunkLoadScriptError {
        chunk: ChunkId,
        src: String,
        reason: String,
    },

    /// The script loaded but never delivered the chunk's payload.
    #[error("loading chunk {chunk} failed (missing: {src})")]
    ChunkLoadMissing { chunk: ChunkId, src: String },

    #[error("binary module {0} has no deployed payload")]
    UnknownBinary(BinaryId),

    #[error("fetching binary module {binary} failed: {reason}")]
    BinaryFetchError { binary: BinaryId, reason: String },

    #[error("compiling binary module {binary} failed: {reason}")]
    BinaryCompileError { binary: BinaryId, reason: String },

    #[error("instantiating binary module {binary} failed: {reason}")]
    BinaryInstantiateError { binary: BinaryId, reason: String },
}

impl LoadError {
    pub fn category(&self) -> FailureCategory {
        match self {
            LoadError::MissingModule(_) | LoadError::ModuleFailed(_) => FailureCategory::Module,
            LoadError::ChunkLoadTimeout { .. } => FailureCategory::Timeout,
            LoadError::ChunkLoadNetworkError { .. } => FailureCategory::Network,
            LoadError::ChunkLoadScriptError { .. } => FailureCategory::Script,
            LoadError::ChunkLoadMissing { .. } => FailureCategory::Missing,
            LoadError::UnknownBinary(_) | LoadError::BinaryFetchError { .. } => {
                FailureCategory::Fetch
            }
            LoadError::BinaryCompileError { .. } => FailureCategory::Compile,
            LoadError::BinaryInstantiateError { .. } => FailureCategory::Instantiate,
        }
    }

    /// Id of the module, chunk or binary the failure belongs to.
    pub fn subject(&self) -> &str {
        match self {
            LoadError::MissingModule(id) | LoadError::ModuleFailed(id) => id.as_str(),
            LoadError::ChunkLoadTimeout { chunk, .. }
            | LoadError::ChunkLoadNetworkError { chunk, .. }
            | LoadError::ChunkLoadScriptError { chunk, .. }
            | LoadError::ChunkLoadMissing { chunk, .. } => chunk.as_str(),
            LoadError::UnknownBinary(binary)
            | LoadError::BinaryFetchError { binary, .. }
            | LoadError::BinaryCompileError { binary, .. }
            | LoadError::BinaryInstantiateError { binary, .. } => binary.as_str(),
        }
    }

    pub fn is_chunk_failure(&self) -> bool {
        matches!(
            self,
            LoadError::ChunkLoadTimeout { .. }
                | LoadError::ChunkLoadNetworkError { .. }
                | LoadError::ChunkLoadScriptError { .. }
                | LoadError::ChunkLoadMissing { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_and_subjects() {
        let timeout = LoadError::ChunkLoadTimeout {
            chunk: ChunkId::from("0"),
            src: "0.bootstrap.js".into(),
        };
        assert_eq!(timeout.category(), FailureCategory::Timeout);
        assert_eq!(timeout.subject(), "0");
        assert!(timeout.is_chunk_failure());
        assert_eq!(timeout.to_string(), "loading chunk 0 failed (timeout: 0.bootstrap.js)");

        let compile = LoadError::BinaryCompileError {
            binary: BinaryId::from("game.wasm"),
            reason: "bad header".into(),
        };
        assert_eq!(compile.category().to_string(), "compile");
        assert_eq!(compile.subject(), "game.wasm");
        assert!(!compile.is_chunk_failure());

        let unknown = LoadError::UnknownBinary(BinaryId::from("x.wasm"));
        assert_eq!(unknown.category(), FailureCategory::Fetch);
    }
}
