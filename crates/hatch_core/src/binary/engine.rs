//! Binary runtime backed by wasmtime.
//!
//! Imports are linked from the [`ImportTable`] by the module's own import
//! section: every declared function import must be present in the table,
//! and the table travels with the instance's store so host functions are
//! looked up per call. Exported functions become [`BinaryExports`].

use anyhow::anyhow;
use futures::future::{self, FutureExt, LocalBoxFuture};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use wasmtime::{Engine, ExternType, Func, Linker, Module, Store};

use super::imports::ImportTable;
use super::runtime::{
    host_func, BinaryExports, BinaryRuntime, Capabilities, CompiledBinary, HostFunc, RuntimeError, Val,
};
use crate::fetch::{collect_bytes, ByteStream};

#[derive(Clone)]
pub struct WasmtimeRuntime {
    engine: Engine,
    capabilities: Capabilities,
    instantiations: Rc<Cell<usize>>,
}

impl Default for WasmtimeRuntime {
    fn default() -> Self {
        Self::new(Capabilities::FULL)
    }
}

impl WasmtimeRuntime {
    /// wasmtime compiles from complete bytes; the streaming capabilities
    /// only decide when the payload is collected relative to the imports.
    pub fn new(capabilities: Capabilities) -> Self {
        Self::with_engine(Engine::default(), capabilities)
    }

    pub fn with_engine(engine: Engine, capabilities: Capabilities) -> Self {
        Self {
            engine,
            capabilities,
            instantiations: Rc::new(Cell::new(0)),
        }
    }

    /// Successful instantiations so far.
    pub fn instantiations(&self) -> usize {
        self.instantiations.get()
    }

    fn compile(&self, bytes: &[u8]) -> Result<CompiledBinary, RuntimeError> {
        let module =
            Module::new(&self.engine, bytes).map_err(|err| RuntimeError::Compile(format!("{:#}", err)))?;
        let imports = module
            .imports()
            .map(|import| (import.module().to_string(), import.name().to_string()))
            .collect();
        Ok(CompiledBinary::new(module, imports))
    }

    fn link(&self, compiled: &CompiledBinary, imports: ImportTable) -> Result<BinaryExports, RuntimeError> {
        let module = compiled.artifact::<Module>().ok_or_else(|| {
            RuntimeError::Instantiate("module was compiled by a different runtime".to_string())
        })?;

        let mut linker: Linker<ImportTable> = Linker::new(&self.engine);
        for import in module.imports() {
            let (namespace, symbol) = (import.module(), import.name());
            imports.resolve(namespace, symbol)?;
            let ty = match import.ty() {
                ExternType::Func(ty) => ty,
                _ => {
                    return Err(RuntimeError::Instantiate(format!(
                        "import {}.{} is not a function",
                        namespace, symbol
                    )))
                }
            };

            let (ns, sym) = (namespace.to_string(), symbol.to_string());
            linker
                .func_new(namespace, symbol, ty, move |caller, params, results| {
                    let func = caller
                        .data()
                        .get(&ns, &sym)
                        .cloned()
                        .ok_or_else(|| anyhow!("import {}.{} is not provided", ns, sym))?;
                    let args = params.iter().map(from_wasm).collect::<anyhow::Result<Vec<_>>>()?;
                    write_results(&func(&args)?, results)
                })
                .map_err(|err| RuntimeError::Instantiate(format!("{:#}", err)))?;
        }

        let mut store = Store::new(&self.engine, imports);
        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|err| RuntimeError::Instantiate(format!("{:#}", err)))?;
        let funcs: Vec<(String, Func)> = instance
            .exports(&mut store)
            .filter_map(|export| {
                let name = export.name().to_string();
                export.into_func().map(|func| (name, func))
            })
            .collect();

        let store = Rc::new(RefCell::new(store));
        let exports: HashMap<String, HostFunc> = funcs
            .into_iter()
            .map(|(name, func)| (name.clone(), export_func(store.clone(), name, func)))
            .collect();

        self.instantiations.set(self.instantiations.get() + 1);
        Ok(BinaryExports::new(exports))
    }
}

fn export_func(store: Rc<RefCell<Store<ImportTable>>>, name: String, func: Func) -> HostFunc {
    host_func(move |args| {
        let mut store = store
            .try_borrow_mut()
            .map_err(|_| anyhow!("re-entrant call into binary export {}", name))?;
        let params: Vec<wasmtime::Val> = args.iter().map(to_wasm).collect();
        let mut results = vec![wasmtime::Val::I32(0); func.ty(&*store).results().len()];
        func.call(&mut *store, &params, &mut results)?;
        results.iter().map(from_wasm).collect()
    })
}

fn to_wasm(val: &Val) -> wasmtime::Val {
    match *val {
        Val::I32(v) => wasmtime::Val::I32(v),
        Val::I64(v) => wasmtime::Val::I64(v),
        Val::F32(v) => wasmtime::Val::F32(v.to_bits()),
        Val::F64(v) => wasmtime::Val::F64(v.to_bits()),
    }
}

fn from_wasm(val: &wasmtime::Val) -> anyhow::Result<Val> {
    match *val {
        wasmtime::Val::I32(v) => Ok(Val::I32(v)),
        wasmtime::Val::I64(v) => Ok(Val::I64(v)),
        wasmtime::Val::F32(bits) => Ok(Val::F32(f32::from_bits(bits))),
        wasmtime::Val::F64(bits) => Ok(Val::F64(f64::from_bits(bits))),
        _ => anyhow::bail!("only numeric values cross the binary boundary"),
    }
}

fn write_results(values: &[Val], results: &mut [wasmtime::Val]) -> anyhow::Result<()> {
    if values.len() != results.len() {
        anyhow::bail!(
            "host function returned {} values, the binary expects {}",
            values.len(),
            results.len()
        );
    }
    for (slot, value) in results.iter_mut().zip(values) {
        *slot = to_wasm(value);
    }
    Ok(())
}

impl BinaryRuntime for WasmtimeRuntime {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn compile_streaming(&self, bytes: ByteStream) -> LocalBoxFuture<'static, Result<CompiledBinary, RuntimeError>> {
        let this = self.clone();
        async move {
            let bytes = collect_bytes(bytes).await?;
            this.compile(&bytes)
        }
        .boxed_local()
    }

    fn instantiate_streaming(
        &self,
        bytes: ByteStream,
        imports: ImportTable,
    ) -> LocalBoxFuture<'static, Result<BinaryExports, RuntimeError>> {
        let this = self.clone();
        async move {
            let bytes = collect_bytes(bytes).await?;
            let module = this.compile(&bytes)?;
            this.link(&module, imports)
        }
        .boxed_local()
    }

    fn instantiate_compiled(
        &self,
        module: CompiledBinary,
        imports: ImportTable,
    ) -> LocalBoxFuture<'static, Result<BinaryExports, RuntimeError>> {
        future::ready(self.link(&module, imports)).boxed_local()
    }

    fn instantiate_bytes(
        &self,
        bytes: Vec<u8>,
        imports: ImportTable,
    ) -> LocalBoxFuture<'static, Result<BinaryExports, RuntimeError>> {
        let result = self.compile(&bytes).and_then(|module| self.link(&module, imports));
        future::ready(result).boxed_local()
    }
}
