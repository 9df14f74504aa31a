use futures::future::LocalBoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use super::runtime::{host_func, HostFunc, RuntimeError};
use crate::loader::Loader;
use crate::registry::ModuleId;

/// Host functions a binary module imports, by namespace and symbol.
#[derive(Clone, Default)]
pub struct ImportTable {
    namespaces: HashMap<String, HashMap<String, HostFunc>>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, namespace: impl Into<String>, symbol: impl Into<String>, func: HostFunc) {
        self.namespaces
            .entry(namespace.into())
            .or_default()
            .insert(symbol.into(), func);
    }

    pub fn with(mut self, namespace: impl Into<String>, symbol: impl Into<String>, func: HostFunc) -> Self {
        self.define(namespace, symbol, func);
        self
    }

    /// Add every function of `other`, replacing clashing symbols.
    pub fn merged(mut self, other: ImportTable) -> Self {
        for (namespace, symbols) in other.namespaces {
            self.namespaces.entry(namespace).or_default().extend(symbols);
        }
        self
    }

    pub fn get(&self, namespace: &str, symbol: &str) -> Option<&HostFunc> {
        self.namespaces.get(namespace)?.get(symbol)
    }

    /// Like [`ImportTable::get`], failing instantiation when absent.
    pub fn resolve(&self, namespace: &str, symbol: &str) -> Result<HostFunc, RuntimeError> {
        self.get(namespace, symbol).cloned().ok_or_else(|| {
            RuntimeError::Instantiate(format!("import {}.{} is not provided", namespace, symbol))
        })
    }

    pub fn len(&self) -> usize {
        self.namespaces.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Functions that forward each call to the export of the same name on
    /// `glue`, looked up when called. The glue module only has to be loaded
    /// by the time the binary calls into it, not when the table is built.
    pub fn forwarding(loader: &Loader, glue: impl Into<ModuleId>, namespace: &str, symbols: &[&str]) -> Self {
        let glue = glue.into();
        let mut table = Self::new();
        for symbol in symbols {
            let weak = loader.downgrade();
            let glue = glue.clone();
            let name = symbol.to_string();
            table.define(
                namespace,
                *symbol,
                host_func(move |args| {
                    let loader = weak
                        .upgrade()
                        .ok_or_else(|| anyhow::anyhow!("loader dropped before {} was called", name))?;
                    let exports = loader
                        .cached_exports(glue.as_str())
                        .ok_or_else(|| anyhow::anyhow!("glue module {} is not loaded", glue))?;
                    let target = exports
                        .get::<HostFunc>(&name)
                        .ok_or_else(|| anyhow::anyhow!("glue module {} does not export {}", glue, name))?;
                    target(args)
                }),
            );
        }
        table
    }
}

impl fmt::Debug for ImportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut symbols: Vec<String> = self
            .namespaces
            .iter()
            .flat_map(|(ns, syms)| syms.keys().map(move |s| format!("{}.{}", ns, s)))
            .collect();
        symbols.sort();
        f.debug_struct("ImportTable").field("symbols", &symbols).finish()
    }
}

/// An import table, ready now or produced asynchronously.
pub enum ImportSource {
    Ready(ImportTable),
    Deferred(LocalBoxFuture<'static, ImportTable>),
}

impl ImportSource {
    pub fn is_deferred(&self) -> bool {
        matches!(self, ImportSource::Deferred(_))
    }

    pub async fn resolve(self) -> ImportTable {
        match self {
            ImportSource::Ready(table) => table,
            ImportSource::Deferred(pending) => pending.await,
        }
    }
}

impl From<ImportTable> for ImportSource {
    fn from(table: ImportTable) -> Self {
        ImportSource::Ready(table)
    }
}

/// Builds the import table for one binary id, once, at instantiation time.
pub type ImportTableFactory = Rc<dyn Fn(&Loader) -> ImportSource>;
