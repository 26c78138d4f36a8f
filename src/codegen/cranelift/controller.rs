//! Failure and fallback control
//!
//! Lowering a method either succeeds or ends in a fallback: the method is
//! reported as not lowerable and the embedder compiles it with its other
//! backend. Only unsupported constructs end that way. Invariant violations
//! and backend rejections are returned as errors and never absorbed.
//!
//! A fallback is sticky. The method's name is remembered with its reason and
//! any later attempt returns the same fallback without lowering again.

use super::lower::{lower_method, LoweredFunction};
use super::state::ModuleState;
use super::{CodegenError, CodegenResult};
use crate::config::LoweringConfig;
use crate::ir::{ClauseKind, Method, TypeQueries};
use cranelift_module::Module;
use log::{debug, info};
use std::fmt;

/// Lowering state of one method; failure is final
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoweringPhase {
    Lowering,
    Failed(String),
}

/// Why a method was handed back to the fallback backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    pub method: String,
    pub reason: String,
    /// This backend must not be asked to compile the method again
    pub do_not_retry: bool,
}

impl fmt::Display for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not lowerable: {}", self.method, self.reason)
    }
}

/// Result of compiling one method
#[derive(Debug, Clone, PartialEq)]
pub enum MethodOutcome<T> {
    Compiled(T),
    NotLowerable(Fallback),
}

impl<T> MethodOutcome<T> {
    pub fn is_compiled(&self) -> bool {
        matches!(self, MethodOutcome::Compiled(_))
    }

    pub fn compiled(self) -> Option<T> {
        match self {
            MethodOutcome::Compiled(value) => Some(value),
            MethodOutcome::NotLowerable(_) => None,
        }
    }

    pub fn fallback(&self) -> Option<&Fallback> {
        match self {
            MethodOutcome::Compiled(_) => None,
            MethodOutcome::NotLowerable(fallback) => Some(fallback),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MethodOutcome<U> {
        match self {
            MethodOutcome::Compiled(value) => MethodOutcome::Compiled(f(value)),
            MethodOutcome::NotLowerable(fallback) => MethodOutcome::NotLowerable(fallback),
        }
    }
}

pub(crate) fn fallback<T>(method: &Method, reason: impl Into<String>) -> MethodOutcome<T> {
    MethodOutcome::NotLowerable(Fallback {
        method: method.name.clone(),
        reason: reason.into(),
        do_not_retry: true,
    })
}

/// Method-level shapes rejected before any lowering
pub fn precheck(method: &Method) -> CodegenResult<()> {
    if method.saves_lmf {
        return Err(CodegenError::unsupported("method saves an LMF frame"));
    }
    if method.pinvoke {
        return Err(CodegenError::unsupported("pinvoke wrapper"));
    }
    if method.signature.varargs {
        return Err(CodegenError::unsupported("variadic signature"));
    }
    if let Some(clause) = method
        .clauses
        .iter()
        .find(|c| !matches!(c.kind, ClauseKind::Catch | ClauseKind::Finally))
    {
        return Err(CodegenError::unsupported(format!("{:?} clause", clause.kind)));
    }
    if method.blocks.is_empty() {
        return Err(CodegenError::invariant(format!("{} has no blocks", method.name)));
    }
    Ok(())
}

/// Lower `method` into `state`'s module, turning unsupported constructs into
/// a sticky fallback
pub(crate) fn lower_guarded<M: Module>(
    state: &mut ModuleState<M>,
    method: &Method,
    types: &dyn TypeQueries,
    config: &LoweringConfig,
) -> CodegenResult<MethodOutcome<LoweredFunction>> {
    if let Some(reason) = state.tables.rejection(&method.name) {
        debug!("{} was rejected before: {}", method.name, reason);
        return Ok(fallback(method, reason));
    }
    if let Err(reason) = state.tables.admit(config.method_limit, &method.name) {
        info!("{} not attempted: {}", method.name, reason);
        return Ok(fallback(method, reason));
    }

    let result = precheck(method).and_then(|()| {
        lower_method(
            &mut state.module,
            &mut state.tables,
            &mut state.builder_context,
            method,
            types,
            config,
        )
    });
    match result {
        Ok(lowered) => Ok(MethodOutcome::Compiled(lowered)),
        Err(err) => absorb(state, method, err),
    }
}

/// Turn a recoverable error into a recorded fallback; anything else is
/// returned unchanged
pub(crate) fn absorb<M: Module, T>(
    state: &mut ModuleState<M>,
    method: &Method,
    err: CodegenError,
) -> CodegenResult<MethodOutcome<T>> {
    state.reset_builder();
    if !err.is_recoverable() {
        return Err(err);
    }
    let reason = err.to_string();
    info!("{} falls back: {}", method.name, reason);
    state.tables.reject(&method.name, &reason);
    Ok(fallback(method, reason))
}
