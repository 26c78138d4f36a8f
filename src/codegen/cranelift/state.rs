//! Module-wide lowering state
//!
//! Everything that outlives a single method: the Cranelift module, imported
//! function and data declarations, the type memo, sticky fallbacks and the
//! attempt counter behind the method limit. Backends keep one
//! [`ModuleState`] behind a mutex; holding the lock for a whole method is the
//! only synchronisation the lowering engine needs.

use super::types::TypeCache;
use super::{CodegenError, CodegenResult};
use crate::codegen::runtime::RuntimeHelper;
use cranelift::prelude::{Signature, Type};
use cranelift_codegen::isa::CallConv;
use cranelift_codegen::Context;
use cranelift_frontend::FunctionBuilderContext;
use cranelift_jit::JITModule;
use cranelift_module::{DataId, FuncId, Linkage, Module};
use log::info;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Import resolved when an ahead-of-time artifact is loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredStub {
    /// Symbol the stub resolves to
    pub target: String,
    /// Name the generated code references
    pub stub: String,
    pub is_data: bool,
}

/// Declarations and caches shared by every method of one module
#[derive(Debug, Default)]
pub struct ModuleTables {
    pub type_cache: TypeCache,
    functions: HashMap<String, FuncId>,
    data: HashMap<String, DataId>,
    /// Symbols the JIT linker can resolve; `None` accepts everything
    resolvable: Option<HashSet<String>>,
    /// Ahead-of-time: imports go through load-time stubs
    deferred: Option<BTreeMap<String, DeferredStub>>,
    /// Methods defined in this module; calls bind to them directly
    local: HashSet<String>,
    /// Methods that fell back, with the reason
    rejected: HashMap<String, String>,
    attempts: usize,
    poisoned: Option<String>,
}

impl ModuleTables {
    /// Tables for a JIT module that can only link against `symbols`
    pub fn for_jit(symbols: impl IntoIterator<Item = String>) -> Self {
        Self {
            resolvable: Some(symbols.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Tables for an object module with deferred imports
    pub fn for_aot() -> Self {
        Self {
            deferred: Some(BTreeMap::new()),
            ..Self::default()
        }
    }

    pub fn is_aot(&self) -> bool {
        self.deferred.is_some()
    }

    /// Count one attempt against the method limit.
    ///
    /// Returns the fallback reason once the limit is exhausted.
    pub fn admit(&mut self, limit: Option<usize>, name: &str) -> Result<(), String> {
        if let Some(limit) = limit {
            if self.attempts >= limit {
                return Err(format!("method limit of {} reached", limit));
            }
            if self.attempts + 1 == limit {
                info!("LAST: {}", name);
            }
        }
        self.attempts += 1;
        Ok(())
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Remember that `method` must not be lowered again
    pub fn reject(&mut self, method: &str, reason: &str) {
        self.rejected.insert(method.to_string(), reason.to_string());
    }

    pub fn rejection(&self, method: &str) -> Option<&str> {
        self.rejected.get(method).map(|s| s.as_str())
    }

    /// A verifier failure makes the whole artifact unusable
    pub fn poison(&mut self, reason: &str) {
        if self.poisoned.is_none() {
            self.poisoned = Some(reason.to_string());
        }
    }

    pub fn poisoned(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }

    /// A compiled method becomes a valid direct-call target
    pub fn add_resolvable(&mut self, symbol: &str) {
        if let Some(set) = self.resolvable.as_mut() {
            set.insert(symbol.to_string());
        }
    }

    /// A method defined in this module needs no load-time stub
    pub fn add_local(&mut self, symbol: &str) {
        self.local.insert(symbol.to_string());
    }

    pub fn deferred_stubs(&self) -> Vec<DeferredStub> {
        self.deferred
            .as_ref()
            .map(|stubs| stubs.values().cloned().collect())
            .unwrap_or_default()
    }

    fn import_name(&mut self, symbol: &str, is_data: bool) -> CodegenResult<String> {
        if !is_data && self.local.contains(symbol) {
            return Ok(symbol.to_string());
        }
        if let Some(stubs) = self.deferred.as_mut() {
            let stub = format!("plt_{}", symbol);
            stubs.entry(symbol.to_string()).or_insert_with(|| DeferredStub {
                target: symbol.to_string(),
                stub: stub.clone(),
                is_data,
            });
            return Ok(stub);
        }
        if let Some(set) = self.resolvable.as_ref() {
            if !set.contains(symbol) {
                return Err(CodegenError::unsupported(format!("symbol {} cannot be resolved", symbol)));
            }
        }
        Ok(symbol.to_string())
    }

    /// Declare (once) an imported function
    pub fn import_function<M: Module>(
        &mut self,
        module: &mut M,
        symbol: &str,
        sig: &Signature,
    ) -> CodegenResult<FuncId> {
        if let Some(id) = self.functions.get(symbol) {
            return Ok(*id);
        }
        let name = self.import_name(symbol, false)?;
        let id = module.declare_function(&name, Linkage::Import, sig)?;
        self.functions.insert(symbol.to_string(), id);
        Ok(id)
    }

    /// Declare a call to the method being lowered.
    ///
    /// The declaration is the one the definition will use, so neither the
    /// JIT linker nor a load-time stub is involved.
    pub fn declare_self<M: Module>(&mut self, module: &mut M, symbol: &str, sig: &Signature) -> CodegenResult<FuncId> {
        Ok(module.declare_function(symbol, Linkage::Export, sig)?)
    }

    /// Declare (once) a runtime helper
    pub fn helper<M: Module>(
        &mut self,
        module: &mut M,
        helper: RuntimeHelper,
        ptr: Type,
        call_conv: CallConv,
    ) -> CodegenResult<FuncId> {
        let sig = helper.signature(ptr, call_conv);
        self.import_function(module, helper.symbol(), &sig)
    }

    /// Declare (once) an imported data symbol
    pub fn import_data<M: Module>(&mut self, module: &mut M, symbol: &str) -> CodegenResult<DataId> {
        if let Some(id) = self.data.get(symbol) {
            return Ok(*id);
        }
        let name = self.import_name(symbol, true)?;
        let id = module.declare_data(&name, Linkage::Import, false, false)?;
        self.data.insert(symbol.to_string(), id);
        Ok(id)
    }
}

/// A Cranelift module plus everything shared between its methods
pub struct ModuleState<M: Module> {
    pub module: M,
    pub tables: ModuleTables,
    /// Reused between methods; replaced after a failed lowering
    pub builder_context: FunctionBuilderContext,
    pub context: Context,
}

impl<M: Module> ModuleState<M> {
    pub fn new(module: M, tables: ModuleTables) -> Self {
        let context = module.make_context();
        Self {
            module,
            tables,
            builder_context: FunctionBuilderContext::new(),
            context,
        }
    }

    /// Drop whatever a failed lowering left in the builder context
    pub fn reset_builder(&mut self) {
        self.builder_context = FunctionBuilderContext::new();
        self.module.clear_context(&mut self.context);
    }
}

// SAFETY: the JIT module holds raw pointers into its own code memory. The
// state is only reached through the backend's mutex, so at most one thread
// touches those pointers at a time.
unsafe impl Send for ModuleState<JITModule> {}
