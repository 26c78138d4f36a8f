//! Cranelift Native Code Generation Backend
//!
//! Lowers one source method at a time to Cranelift IR and compiles it either
//! into executable memory ([`JitBackend`]) or into a relocatable object
//! ([`AotBackend`]).
//!
//! Architecture:
//! - `types`: maps source types to Cranelift value types and memory layouts
//! - `context`: per-method value table, homes and block bookkeeping
//! - `state`: module-wide declarations, sticky fallbacks and the method limit
//! - `blocks`: emission order and reachability
//! - `lower`: the lowering driver; `instructions`, `memory`, `calls`,
//!   `exceptions` and `phi` extend it
//! - `abi`: signatures and register-pair marshaling
//! - `controller`: fallback decisions
//! - `unwind`: region tables handed to the host unwinder

use super::runtime::RuntimeHooks;
use super::{CodegenError, CodegenResult};
use crate::config::LoweringConfig;
use crate::ir::{Method, TypeQueries};

use cranelift_codegen::isa::{self, OwnedTargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use log::{debug, info, warn};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use target_lexicon::Triple;

pub mod abi;
pub mod blocks;
mod calls;
pub mod context;
pub mod controller;
mod exceptions;
mod instructions;
pub mod lower;
mod memory;
mod phi;
pub mod state;
pub mod types;
pub mod unwind;

pub use controller::{precheck, Fallback, LoweringPhase, MethodOutcome};
pub use lower::{ExceptionalEdge, FinallySite, LoweredFunction, LoweringStats};
pub use state::{DeferredStub, ModuleState, ModuleTables};
pub use unwind::{MethodUnwindInfo, RegionEntry};

use controller::{absorb, lower_guarded};

/// Build the target ISA for `config`
pub fn build_isa(config: &LoweringConfig, pic: bool) -> CodegenResult<OwnedTargetIsa> {
    let triple = match &config.target {
        Some(target) => Triple::from_str(target)
            .map_err(|e| CodegenError::Config(format!("Invalid target triple {:?}: {}", target, e)))?,
        None => Triple::host(),
    };

    let mut flag_builder = settings::builder();
    flag_builder
        .set("use_colocated_libcalls", "false")
        .map_err(|e| CodegenError::InternalError(format!("Failed to set compiler flag: {}", e)))?;
    flag_builder
        .set("is_pic", if pic { "true" } else { "false" })
        .map_err(|e| CodegenError::InternalError(format!("Failed to set compiler flag: {}", e)))?;
    flag_builder
        .set("opt_level", config.opt_level.as_setting())
        .map_err(|e| CodegenError::InternalError(format!("Failed to set compiler flag: {}", e)))?;
    flag_builder
        .set("enable_verifier", if config.verify { "true" } else { "false" })
        .map_err(|e| CodegenError::InternalError(format!("Failed to set compiler flag: {}", e)))?;

    let isa_builder = isa::lookup(triple.clone())
        .map_err(|e| CodegenError::Config(format!("Unsupported target {}: {}", triple, e)))?;
    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| CodegenError::InternalError(format!("Failed to finalize ISA: {}", e)))
}

/// A function defined in a module, before the module is finalized
struct Defined {
    id: FuncId,
    size: u32,
    unwind: MethodUnwindInfo,
}

/// Verify and define a lowered method under its own name
fn define<M: Module>(
    state: &mut ModuleState<M>,
    method: &Method,
    lowered: LoweredFunction,
    config: &LoweringConfig,
) -> CodegenResult<Defined> {
    if config.verify {
        cranelift_codegen::verify_function(&lowered.func, state.module.isa())
            .map_err(|errors| CodegenError::BackendRejected(format!("{}: {}", method.name, errors)))?;
    }

    let id = state
        .module
        .declare_function(&method.name, Linkage::Export, &lowered.func.signature)?;
    state.context.func = lowered.func;
    let defined = state.module.define_function(id, &mut state.context);
    if let Err(err) = defined {
        state.module.clear_context(&mut state.context);
        return Err(err.into());
    }

    let (size, frame) = match state.context.compiled_code() {
        Some(code) => {
            let frame = code
                .create_unwind_info(state.module.isa())
                .map_err(|e| CodegenError::InternalError(format!("unwind info for {}: {}", method.name, e)))?;
            (code.code_info().total_size, frame)
        }
        None => (0, None),
    };
    state.module.clear_context(&mut state.context);

    debug!("defined {} ({} bytes)", method.name, size);
    Ok(Defined {
        id,
        size,
        unwind: MethodUnwindInfo {
            frame,
            regions: unwind::regions(method, &lowered.stats),
        },
    })
}

fn lock<T>(state: &Mutex<T>) -> CodegenResult<MutexGuard<'_, T>> {
    state
        .lock()
        .map_err(|_| CodegenError::InternalError("backend state lock poisoned".into()))
}

/// A method compiled into executable memory
#[derive(Debug, Clone)]
pub struct JitMethod {
    pub name: String,
    /// Entry point; valid for as long as the backend lives
    pub code: *const u8,
    pub size: u32,
    pub unwind: MethodUnwindInfo,
    pub stats: LoweringStats,
}

/// Compiles methods straight into executable memory
pub struct JitBackend {
    state: Mutex<ModuleState<JITModule>>,
    config: LoweringConfig,
}

impl JitBackend {
    pub fn new(config: LoweringConfig, hooks: &RuntimeHooks) -> CodegenResult<Self> {
        let isa = build_isa(&config, false)?;
        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        for (name, address) in hooks.symbols() {
            builder.symbol(name, address as *const u8);
        }
        let module = JITModule::new(builder);
        let tables = ModuleTables::for_jit(hooks.symbols().map(|(name, _)| name.to_string()));
        info!("JIT backend ready for {}", module.isa().triple());
        Ok(Self {
            state: Mutex::new(ModuleState::new(module, tables)),
            config,
        })
    }

    pub fn config(&self) -> &LoweringConfig {
        &self.config
    }

    /// Lower, compile and finalize one method
    pub fn compile(&self, method: &Method, types: &dyn TypeQueries) -> CodegenResult<MethodOutcome<JitMethod>> {
        let mut guard = lock(&self.state)?;
        let state = &mut *guard;

        let lowered = match lower_guarded(state, method, types, &self.config)? {
            MethodOutcome::Compiled(lowered) => lowered,
            MethodOutcome::NotLowerable(fallback) => return Ok(MethodOutcome::NotLowerable(fallback)),
        };
        let stats = lowered.stats.clone();
        let defined = match define(state, method, lowered, &self.config) {
            Ok(defined) => defined,
            Err(err) => return absorb(state, method, err),
        };

        state.module.finalize_definitions()?;
        let code = state.module.get_finalized_function(defined.id);
        state.tables.add_resolvable(&method.name);
        info!("compiled {} at {:p}", method.name, code);

        Ok(MethodOutcome::Compiled(JitMethod {
            name: method.name.clone(),
            code,
            size: defined.size,
            unwind: defined.unwind,
            stats,
        }))
    }

    /// Lower without compiling, for inspection
    pub fn lower_only(&self, method: &Method, types: &dyn TypeQueries) -> CodegenResult<MethodOutcome<LoweredFunction>> {
        let mut guard = lock(&self.state)?;
        lower_guarded(&mut guard, method, types, &self.config)
    }

    /// Reason `name` was handed back earlier, if it was
    pub fn rejection(&self, name: &str) -> CodegenResult<Option<String>> {
        Ok(lock(&self.state)?.tables.rejection(name).map(str::to_string))
    }
}

/// A method emitted into the object artifact
#[derive(Debug, Clone)]
pub struct AotMethod {
    pub name: String,
    pub symbol: String,
    pub size: u32,
    pub stats: LoweringStats,
}

/// A finished ahead-of-time artifact
#[derive(Debug, Clone)]
pub struct AotArtifact {
    pub object: Vec<u8>,
    /// Imports to resolve when the artifact is loaded
    pub stubs: Vec<DeferredStub>,
}

impl AotArtifact {
    pub fn write_to(&self, path: impl AsRef<Path>) -> CodegenResult<()> {
        std::fs::write(path, &self.object)?;
        Ok(())
    }
}

/// Compiles methods into one relocatable object
pub struct AotBackend {
    state: Mutex<ModuleState<ObjectModule>>,
    config: LoweringConfig,
}

impl AotBackend {
    pub fn new(config: LoweringConfig, name: &str) -> CodegenResult<Self> {
        let isa = build_isa(&config, true)?;
        let builder = ObjectBuilder::new(isa, name, cranelift_module::default_libcall_names())
            .map_err(|e| CodegenError::InternalError(format!("Failed to create object builder: {}", e)))?;
        let module = ObjectModule::new(builder);
        info!("AOT backend ready for {}", module.isa().triple());
        Ok(Self {
            state: Mutex::new(ModuleState::new(module, ModuleTables::for_aot())),
            config,
        })
    }

    /// Lower and emit one method.
    ///
    /// A function the verifier rejects poisons the artifact; every later call
    /// fails as well.
    pub fn compile(&self, method: &Method, types: &dyn TypeQueries) -> CodegenResult<MethodOutcome<AotMethod>> {
        let mut guard = lock(&self.state)?;
        let state = &mut *guard;
        if let Some(reason) = state.tables.poisoned() {
            return Err(CodegenError::BackendRejected(format!("artifact is poisoned: {}", reason)));
        }

        let lowered = match lower_guarded(state, method, types, &self.config)? {
            MethodOutcome::Compiled(lowered) => lowered,
            MethodOutcome::NotLowerable(fallback) => return Ok(MethodOutcome::NotLowerable(fallback)),
        };
        let stats = lowered.stats.clone();
        match define(state, method, lowered, &self.config) {
            Ok(defined) => {
                state.tables.add_local(&method.name);
                Ok(MethodOutcome::Compiled(AotMethod {
                    name: method.name.clone(),
                    symbol: method.name.clone(),
                    size: defined.size,
                    stats,
                }))
            }
            Err(CodegenError::BackendRejected(reason)) => {
                warn!("poisoning artifact: {}", reason);
                state.tables.poison(&reason);
                state.reset_builder();
                Err(CodegenError::BackendRejected(reason))
            }
            Err(err) => absorb(state, method, err),
        }
    }

    pub fn deferred_stubs(&self) -> CodegenResult<Vec<DeferredStub>> {
        Ok(lock(&self.state)?.tables.deferred_stubs())
    }

    /// Emit the object
    pub fn finish(self) -> CodegenResult<AotArtifact> {
        let state = self
            .state
            .into_inner()
            .map_err(|_| CodegenError::InternalError("backend state lock poisoned".into()))?;
        if let Some(reason) = state.tables.poisoned() {
            return Err(CodegenError::BackendRejected(format!("artifact is poisoned: {}", reason)));
        }
        let stubs = state.tables.deferred_stubs();
        let object = state
            .module
            .finish()
            .emit()
            .map_err(|e| CodegenError::InternalError(format!("Failed to emit object: {}", e)))?;
        info!("emitted object of {} bytes with {} deferred stubs", object.len(), stubs.len());
        Ok(AotArtifact { object, stubs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_isa() {
        let isa = build_isa(&LoweringConfig::default(), false).expect("host ISA");
        assert_eq!(isa.triple(), &Triple::host());
        assert!(!isa.flags().is_pic());
        assert!(build_isa(&LoweringConfig::default(), true).expect("pic ISA").flags().is_pic());
    }

    #[test]
    fn test_bad_triple_is_config_error() {
        let config = LoweringConfig {
            target: Some("not-a-target".into()),
            ..LoweringConfig::default()
        };
        assert!(matches!(build_isa(&config, false), Err(CodegenError::Config(_))));
    }
}
