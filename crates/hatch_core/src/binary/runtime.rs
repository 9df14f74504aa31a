use futures::future::{self, FutureExt, LocalBoxFuture};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

use super::imports::ImportTable;
use crate::fetch::{ByteStream, FetchError};

/// Scalar passed across the host/binary boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Val {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Val::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Val::F64(v) => Some(*v),
            Val::F32(v) => Some(f64::from(*v)),
            _ => None,
        }
    }
}

/// A function callable across the boundary, in either direction.
pub type HostFunc = Rc<dyn Fn(&[Val]) -> anyhow::Result<Vec<Val>>>;

pub fn host_func<F>(f: F) -> HostFunc
where
    F: Fn(&[Val]) -> anyhow::Result<Vec<Val>> + 'static,
{
    Rc::new(f)
}

/// What the host platform can do with binary payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub compile_streaming: bool,
    pub instantiate_streaming: bool,
}

impl Capabilities {
    pub const BUFFERED_ONLY: Capabilities = Capabilities {
        compile_streaming: false,
        instantiate_streaming: false,
    };

    pub const FULL: Capabilities = Capabilities {
        compile_streaming: true,
        instantiate_streaming: true,
    };
}

/// Exported functions of an instantiated binary module.
#[derive(Clone, Default)]
pub struct BinaryExports(Rc<HashMap<String, HostFunc>>);

impl BinaryExports {
    pub fn new(funcs: HashMap<String, HostFunc>) -> Self {
        Self(Rc::new(funcs))
    }

    pub fn get(&self, name: &str) -> Option<HostFunc> {
        self.0.get(name).cloned()
    }

    pub fn call(&self, name: &str, args: &[Val]) -> anyhow::Result<Vec<Val>> {
        let func = self
            .0
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("binary module has no export named {}", name))?;
        func(args)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn ptr_eq(&self, other: &BinaryExports) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for BinaryExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryExports").field("names", &self.names()).finish()
    }
}

/// A compiled but not yet instantiated binary module. The artifact is
/// whatever the runtime that compiled it needs to instantiate it.
#[derive(Clone)]
pub struct CompiledBinary {
    artifact: Rc<dyn Any>,
    imports: Vec<(String, String)>,
}

impl CompiledBinary {
    pub fn new<T: Any>(artifact: T, imports: Vec<(String, String)>) -> Self {
        Self {
            artifact: Rc::new(artifact),
            imports,
        }
    }

    pub fn artifact<T: Any>(&self) -> Option<&T> {
        self.artifact.downcast_ref::<T>()
    }

    /// Declared `(namespace, symbol)` imports.
    pub fn imports(&self) -> &[(String, String)] {
        &self.imports
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Compile(String),
    #[error("{0}")]
    Instantiate(String),
}

/// The host's binary module engine.
///
/// Only the operations advertised by [`BinaryRuntime::capabilities`] are
/// called; the streaming ones default to reporting themselves unsupported.
pub trait BinaryRuntime {
    fn capabilities(&self) -> Capabilities;

    fn compile_streaming(
        &self,
        _bytes: ByteStream,
    ) -> LocalBoxFuture<'static, Result<CompiledBinary, RuntimeError>> {
        future::ready(Err(RuntimeError::Compile(
            "streaming compilation is not supported".to_string(),
        )))
        .boxed_local()
    }

    fn instantiate_streaming(
        &self,
        _bytes: ByteStream,
        _imports: ImportTable,
    ) -> LocalBoxFuture<'static, Result<BinaryExports, RuntimeError>> {
        future::ready(Err(RuntimeError::Instantiate(
            "streaming instantiation is not supported".to_string(),
        )))
        .boxed_local()
    }

    fn instantiate_compiled(
        &self,
        module: CompiledBinary,
        imports: ImportTable,
    ) -> LocalBoxFuture<'static, Result<BinaryExports, RuntimeError>>;

    fn instantiate_bytes(
        &self,
        bytes: Vec<u8>,
        imports: ImportTable,
    ) -> LocalBoxFuture<'static, Result<BinaryExports, RuntimeError>>;
}
