//! Binary module instantiation pipeline.
//!
//! Each binary id gets one attempt per process. Concurrent requests share the
//! attempt; a failure is terminal and replayed to every later request.

mod engine;
mod imports;
mod runtime;
mod strategy;

pub use imports::{ImportSource, ImportTable, ImportTableFactory};
pub use engine::WasmtimeRuntime;
pub use runtime::{
    host_func, BinaryExports, BinaryRuntime, Capabilities, CompiledBinary, HostFunc, RuntimeError, Val,
};
pub use strategy::Strategy;

use futures::future::{self, FutureExt, LocalBoxFuture, Shared};
use manifest::BinaryId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::LoadError;
use crate::loader::{spawn_shared, Loader};

pub type BinaryHandle = Shared<LocalBoxFuture<'static, Result<BinaryExports, LoadError>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryStatus {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

enum BinarySlot {
    Loading(BinaryHandle),
    Loaded(BinaryExports),
    Failed(LoadError),
}

#[derive(Default)]
pub(crate) struct BinarySlots {
    slots: RefCell<HashMap<BinaryId, BinarySlot>>,
    /// Exports of every loaded binary, for host glue that calls them directly.
    published: RefCell<HashMap<BinaryId, BinaryExports>>,
    factories: RefCell<HashMap<BinaryId, ImportTableFactory>>,
}

impl RuntimeError {
    pub fn into_load_error(self, binary: &BinaryId) -> LoadError {
        let binary = binary.clone();
        match self {
            RuntimeError::Fetch(err) => LoadError::BinaryFetchError {
                binary,
                reason: err.to_string(),
            },
            RuntimeError::Compile(reason) => LoadError::BinaryCompileError { binary, reason },
            RuntimeError::Instantiate(reason) => LoadError::BinaryInstantiateError { binary, reason },
        }
    }
}

impl Loader {
    /// Register the import table factory for a binary module.
    pub fn register_imports<F>(&self, binary: impl Into<BinaryId>, factory: F)
    where
        F: Fn(&Loader) -> ImportSource + 'static,
    {
        self.inner
            .binaries
            .factories
            .borrow_mut()
            .insert(binary.into(), Rc::new(factory));
    }

    pub fn binary_status(&self, binary: impl Into<BinaryId>) -> BinaryStatus {
        match self.inner.binaries.slots.borrow().get(&binary.into()) {
            None => BinaryStatus::NotLoaded,
            Some(BinarySlot::Loading(_)) => BinaryStatus::Loading,
            Some(BinarySlot::Loaded(_)) => BinaryStatus::Loaded,
            Some(BinarySlot::Failed(_)) => BinaryStatus::Failed,
        }
    }

    /// Exports published by a loaded binary module.
    pub fn binary_exports(&self, binary: impl Into<BinaryId>) -> Option<BinaryExports> {
        self.inner.binaries.published.borrow().get(&binary.into()).cloned()
    }

    pub fn instantiate_binary(&self, binary: impl Into<BinaryId>) -> BinaryHandle {
        let binary = binary.into();
        if let Some(slot) = self.inner.binaries.slots.borrow().get(&binary) {
            return match slot {
                BinarySlot::Loading(handle) => {
                    tracing::debug!(binary = %binary, "joining in-flight instantiation");
                    handle.clone()
                }
                BinarySlot::Loaded(exports) => future::ready(Ok(exports.clone())).boxed_local().shared(),
                BinarySlot::Failed(err) => future::ready(Err(err.clone())).boxed_local().shared(),
            };
        }

        let cancelled = LoadError::BinaryFetchError {
            binary: binary.clone(),
            reason: "instantiation cancelled".to_string(),
        };
        let handle = spawn_shared(self.clone().run_pipeline(binary.clone()), move || Err(cancelled));
        self.inner
            .binaries
            .slots
            .borrow_mut()
            .insert(binary, BinarySlot::Loading(handle.clone()));
        handle
    }

    async fn run_pipeline(self, binary: BinaryId) -> Result<BinaryExports, LoadError> {
        let outcome = self.instantiate_once(&binary).await;
        let slot = match &outcome {
            Ok(exports) => {
                self.inner
                    .binaries
                    .published
                    .borrow_mut()
                    .insert(binary.clone(), exports.clone());
                tracing::info!(binary = %binary, exports = exports.names().len(), "binary module instantiated");
                BinarySlot::Loaded(exports.clone())
            }
            Err(err) => {
                self.inner.platform.errors.load_failed(err);
                BinarySlot::Failed(err.clone())
            }
        };
        self.inner.binaries.slots.borrow_mut().insert(binary, slot);
        outcome
    }

    async fn instantiate_once(&self, binary: &BinaryId) -> Result<BinaryExports, LoadError> {
        let address = self
            .manifest()
            .binary_address(binary)
            .ok_or_else(|| LoadError::UnknownBinary(binary.clone()))?;

        let factory = self.inner.binaries.factories.borrow().get(binary).cloned();
        let imports = match factory {
            Some(factory) => factory(self),
            None => ImportSource::Ready(ImportTable::new()),
        };

        let runtime = self.inner.platform.runtime.clone();
        let strategy = Strategy::select(runtime.capabilities(), imports.is_deferred());
        tracing::debug!(binary = %binary, address = %address, ?strategy, "instantiating binary module");

        let bytes = self
            .inner
            .platform
            .fetcher
            .fetch(&address)
            .await
            .map_err(|err| RuntimeError::from(err).into_load_error(binary))?;

        strategy
            .run(runtime, bytes, imports)
            .await
            .map_err(|err| err.into_load_error(binary))
    }
}
