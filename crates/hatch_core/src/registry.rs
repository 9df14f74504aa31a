//! Module registry and execution cache.
//!
//! Factories are registered up front or merged in when a chunk arrives. A
//! factory runs the first time its module is required; its exports are cached
//! for the rest of the process and handed out by reference afterwards.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::LoadError;
use crate::exports::Exports;
use crate::loader::Loader;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ModuleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&ModuleId> for ModuleId {
    fn from(id: &ModuleId) -> Self {
        id.clone()
    }
}

impl std::borrow::Borrow<str> for ModuleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Module body. Receives its own record (for exports) and the loader (to
/// require other modules or request chunks).
pub type Factory = Rc<dyn Fn(&Module, &Loader) -> anyhow::Result<()>>;

pub fn factory<F>(body: F) -> Factory
where
    F: Fn(&Module, &Loader) -> anyhow::Result<()> + 'static,
{
    Rc::new(body)
}

/// A module record as seen by its own factory.
#[derive(Debug)]
pub struct Module {
    id: ModuleId,
    exports: Exports,
    loaded: Cell<bool>,
}

impl Module {
    fn new(id: ModuleId) -> Self {
        Self {
            id,
            exports: Exports::new(),
            loaded: Cell::new(false),
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    /// False while the factory is still running.
    pub fn is_loaded(&self) -> bool {
        self.loaded.get()
    }
}

enum CacheEntry {
    Live(Rc<Module>),
    Failed,
}

#[derive(Default)]
pub struct ModuleRegistry {
    factories: RefCell<HashMap<ModuleId, Factory>>,
    cache: RefCell<HashMap<ModuleId, CacheEntry>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations for the same id replace earlier ones.
    pub fn register(&self, id: ModuleId, factory: Factory) {
        self.factories.borrow_mut().insert(id, factory);
    }

    pub fn merge<I>(&self, modules: I) -> usize
    where
        I: IntoIterator<Item = (ModuleId, Factory)>,
    {
        let mut factories = self.factories.borrow_mut();
        let mut merged = 0;
        for (id, factory) in modules {
            factories.insert(id, factory);
            merged += 1;
        }
        merged
    }

    pub fn has_module(&self, id: &str) -> bool {
        self.factories.borrow().contains_key(id)
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        matches!(self.cache.borrow().get(id), Some(CacheEntry::Live(module)) if module.is_loaded())
    }

    /// Exports of a module that has started executing, without running anything.
    pub fn cached_exports(&self, id: &str) -> Option<Exports> {
        match self.cache.borrow().get(id) {
            Some(CacheEntry::Live(module)) => Some(module.exports.clone()),
            _ => None,
        }
    }

    pub fn module_count(&self) -> usize {
        self.factories.borrow().len()
    }

    pub(crate) fn require(&self, loader: &Loader, id: &ModuleId) -> anyhow::Result<Exports> {
        if let Some(entry) = self.cache.borrow().get(id) {
            return match entry {
                // In-progress modules resolve to their partial exports.
                CacheEntry::Live(module) => Ok(module.exports.clone()),
                CacheEntry::Failed => Err(LoadError::ModuleFailed(id.clone()).into()),
            };
        }

        let factory = self
            .factories
            .borrow()
            .get(id)
            .cloned()
            .ok_or_else(|| LoadError::MissingModule(id.clone()))?;

        let module = Rc::new(Module::new(id.clone()));
        self.cache
            .borrow_mut()
            .insert(id.clone(), CacheEntry::Live(module.clone()));

        tracing::trace!(module = %id, "evaluating module");
        if let Err(err) = factory(&module, loader) {
            tracing::debug!(module = %id, "module threw during evaluation: {:#}", err);
            self.cache.borrow_mut().insert(id.clone(), CacheEntry::Failed);
            return Err(err);
        }

        module.loaded.set(true);
        Ok(module.exports.clone())
    }
}
