//! Runtime helper catalogue
//!
//! Generated code never unwinds by itself. Everything exception related goes
//! through a small set of helper routines the embedding runtime provides:
//!
//! - raising helpers (`throw`, `throw corlib exception`, `resume unwind`)
//!   either unwind natively and never return, or record the exception as
//!   *pending* on the current thread and return
//! - after every call the generated code asks whether an exception is
//!   pending. Inside a try region it enters the clause's landing block;
//!   elsewhere the method returns at once and leaves the exception pending
//!   for its caller
//! - a landing block asks whether a catch clause takes the pending exception
//!   (`exception matches`), then announces the clause (`begin unwind`) and
//!   takes the exception object (`fetch exception`)
//!
//! [`RuntimeHooks`] maps helpers (and any other imported symbol) to
//! addresses for the JIT. The default implementations below keep the pending
//! exception in a thread-local slot. A core-library exception is represented
//! by its type token, so a catch clause matches when the token is equal.

use cranelift::prelude::{types as ctypes, AbiParam, Signature, Type};
use cranelift_codegen::isa::CallConv;
use std::cell::Cell;

/// Routines generated code calls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuntimeHelper {
    /// `(exception object)`; raises a managed exception
    ThrowException,
    /// `(type token, pc offset)`; raises a core-library exception
    ThrowCorlibException,
    /// `(exception object)`; continues unwinding after a finally block ran
    /// on the exceptional path
    ResumeUnwind,
    /// `() -> exception object or null`
    ExceptionPending,
    /// `(clause index)`; marks the start of a landing sequence
    BeginUnwind,
    /// `() -> exception object`; takes the pending exception
    FetchException,
    /// `(exception object, type token) -> nonzero` when a catch clause for
    /// the token takes the exception
    ExceptionMatches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HelperType {
    Ptr,
    I32,
}

impl HelperType {
    fn lower(self, ptr: Type) -> Type {
        match self {
            HelperType::Ptr => ptr,
            HelperType::I32 => ctypes::I32,
        }
    }
}

impl RuntimeHelper {
    pub const ALL: [RuntimeHelper; 7] = [
        RuntimeHelper::ThrowException,
        RuntimeHelper::ThrowCorlibException,
        RuntimeHelper::ResumeUnwind,
        RuntimeHelper::ExceptionPending,
        RuntimeHelper::BeginUnwind,
        RuntimeHelper::FetchException,
        RuntimeHelper::ExceptionMatches,
    ];

    /// Linker-visible symbol name
    pub fn symbol(self) -> &'static str {
        match self {
            RuntimeHelper::ThrowException => "methodjit_throw_exception",
            RuntimeHelper::ThrowCorlibException => "methodjit_throw_corlib_exception",
            RuntimeHelper::ResumeUnwind => "methodjit_resume_unwind",
            RuntimeHelper::ExceptionPending => "methodjit_exception_pending",
            RuntimeHelper::BeginUnwind => "methodjit_begin_unwind",
            RuntimeHelper::FetchException => "methodjit_fetch_exception",
            RuntimeHelper::ExceptionMatches => "methodjit_exception_matches",
        }
    }

    fn params(self) -> &'static [HelperType] {
        match self {
            RuntimeHelper::ThrowException | RuntimeHelper::ResumeUnwind => &[HelperType::Ptr],
            RuntimeHelper::ThrowCorlibException => &[HelperType::I32, HelperType::I32],
            RuntimeHelper::BeginUnwind => &[HelperType::I32],
            RuntimeHelper::ExceptionMatches => &[HelperType::Ptr, HelperType::I32],
            RuntimeHelper::ExceptionPending | RuntimeHelper::FetchException => &[],
        }
    }

    fn returns(self) -> Option<HelperType> {
        match self {
            RuntimeHelper::ExceptionPending | RuntimeHelper::FetchException => Some(HelperType::Ptr),
            RuntimeHelper::ExceptionMatches => Some(HelperType::I32),
            _ => None,
        }
    }

    /// Control does not continue normally after the call
    pub fn raises(self) -> bool {
        matches!(
            self,
            RuntimeHelper::ThrowException
                | RuntimeHelper::ThrowCorlibException
                | RuntimeHelper::ResumeUnwind
        )
    }

    /// Cranelift signature of the helper
    pub fn signature(self, ptr: Type, call_conv: CallConv) -> Signature {
        let mut sig = Signature::new(call_conv);
        for param in self.params() {
            sig.params.push(AbiParam::new(param.lower(ptr)));
        }
        if let Some(ret) = self.returns() {
            sig.returns.push(AbiParam::new(ret.lower(ptr)));
        }
        sig
    }

    fn default_address(self) -> usize {
        match self {
            RuntimeHelper::ThrowException => default_throw_exception as usize,
            RuntimeHelper::ThrowCorlibException => default_throw_corlib_exception as usize,
            RuntimeHelper::ResumeUnwind => default_resume_unwind as usize,
            RuntimeHelper::ExceptionPending => default_exception_pending as usize,
            RuntimeHelper::BeginUnwind => default_begin_unwind as usize,
            RuntimeHelper::FetchException => default_fetch_exception as usize,
            RuntimeHelper::ExceptionMatches => default_exception_matches as usize,
        }
    }
}

/// Symbol addresses handed to the JIT linker
#[derive(Debug, Clone)]
pub struct RuntimeHooks {
    symbols: Vec<(String, usize)>,
}

impl Default for RuntimeHooks {
    fn default() -> Self {
        Self {
            symbols: RuntimeHelper::ALL
                .iter()
                .map(|h| (h.symbol().to_string(), h.default_address()))
                .collect(),
        }
    }
}

impl RuntimeHooks {
    /// Replace the implementation of one helper
    pub fn with_helper(mut self, helper: RuntimeHelper, address: usize) -> Self {
        self.set(helper.symbol(), address);
        self
    }

    /// Make an extra symbol (a direct-call target, an AOT constant) resolvable
    pub fn with_symbol(mut self, name: &str, address: usize) -> Self {
        self.set(name, address);
        self
    }

    fn set(&mut self, name: &str, address: usize) {
        match self.symbols.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = address,
            None => self.symbols.push((name.to_string(), address)),
        }
    }

    pub fn address_of(&self, name: &str) -> Option<usize> {
        self.symbols.iter().find(|(n, _)| n == name).map(|(_, a)| *a)
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, usize)> {
        self.symbols.iter().map(|(n, a)| (n.as_str(), *a))
    }
}

thread_local! {
    static PENDING: Cell<usize> = const { Cell::new(0) };
    static UNWIND_CLAUSE: Cell<i32> = const { Cell::new(-1) };
}

/// Record `exception` as pending on the current thread.
///
/// Callees that raise without unwinding natively call this and return; the
/// caller's landing block picks the exception up.
pub fn set_pending_exception(exception: usize) {
    PENDING.with(|p| p.set(exception));
}

/// Pending exception of the current thread, or 0
pub fn pending_exception() -> usize {
    PENDING.with(|p| p.get())
}

/// Clause index announced by the most recent landing block, or -1
pub fn last_unwind_clause() -> i32 {
    UNWIND_CLAUSE.with(|c| c.get())
}

extern "C" fn default_throw_exception(exception: usize) {
    log::debug!("raising exception object {:#x}", exception);
    set_pending_exception(exception);
}

extern "C" fn default_throw_corlib_exception(type_token: i32, pc_offset: i32) {
    log::debug!("raising core library exception {:#x} at offset {}", type_token, pc_offset);
    set_pending_exception(type_token as u32 as usize);
}

extern "C" fn default_resume_unwind(exception: usize) {
    set_pending_exception(exception);
}

extern "C" fn default_exception_pending() -> usize {
    pending_exception()
}

extern "C" fn default_begin_unwind(clause: i32) {
    UNWIND_CLAUSE.with(|c| c.set(clause));
}

extern "C" fn default_fetch_exception() -> usize {
    PENDING.with(|p| p.replace(0))
}

extern "C" fn default_exception_matches(exception: usize, type_token: i32) -> i32 {
    i32::from(exception == type_token as u32 as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_signatures() {
        let sig = RuntimeHelper::ThrowCorlibException.signature(ctypes::I64, CallConv::SystemV);
        assert_eq!(sig.params.len(), 2);
        assert!(sig.returns.is_empty());

        let sig = RuntimeHelper::ExceptionPending.signature(ctypes::I64, CallConv::SystemV);
        assert_eq!(sig.returns[0].value_type, ctypes::I64);
        assert!(RuntimeHelper::ResumeUnwind.raises());
        assert!(!RuntimeHelper::FetchException.raises());

        let sig = RuntimeHelper::ResumeUnwind.signature(ctypes::I64, CallConv::SystemV);
        assert_eq!(sig.params[0].value_type, ctypes::I64);
        let sig = RuntimeHelper::ExceptionMatches.signature(ctypes::I64, CallConv::SystemV);
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.returns[0].value_type, ctypes::I32);
    }

    #[test]
    fn test_hooks_override() {
        let hooks = RuntimeHooks::default()
            .with_helper(RuntimeHelper::ThrowException, 0x1000)
            .with_symbol("callee", 0x2000);
        assert_eq!(hooks.address_of("methodjit_throw_exception"), Some(0x1000));
        assert_eq!(hooks.address_of("callee"), Some(0x2000));
        assert_eq!(hooks.symbols().count(), RuntimeHelper::ALL.len() + 1);
    }

    #[test]
    fn test_pending_slot_is_taken_once() {
        set_pending_exception(0xdead);
        assert_eq!(default_exception_pending(), 0xdead);
        assert_eq!(default_fetch_exception(), 0xdead);
        assert_eq!(pending_exception(), 0);
        default_begin_unwind(2);
        assert_eq!(last_unwind_clause(), 2);
    }

    #[test]
    fn test_default_raise_leaves_exception_pending() {
        default_throw_corlib_exception(0x0200_0010, 0);
        assert!(default_exception_matches(pending_exception(), 0x0200_0010) != 0);
        assert_eq!(default_exception_matches(pending_exception(), 0x0200_0011), 0);

        let exception = default_fetch_exception();
        default_resume_unwind(exception);
        assert_eq!(pending_exception(), 0x0200_0010);

        default_throw_exception(0xbeef);
        assert_eq!(default_fetch_exception(), 0xbeef);
    }
}
