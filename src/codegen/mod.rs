//! Code Generation Module
//!
//! Lowers source methods to Cranelift IR and hands them to a Cranelift module
//! for just-in-time or ahead-of-time code emission.
//!
//! Architecture:
//! - `runtime`: helper routines the generated code calls into
//! - `cranelift`: the lowering engine and the JIT/AOT backends

pub mod cranelift;
pub mod runtime;

use cranelift_module::ModuleError;
use thiserror::Error;

/// Result type for code generation operations
pub type CodegenResult<T> = Result<T, CodegenError>;

/// Errors that can occur during code generation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodegenError {
    /// Construct the lowering engine does not implement; the method falls back
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),
    /// The source IR broke one of its own guarantees
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    /// Cranelift's verifier or code emitter rejected the generated function
    #[error("Backend rejected function: {0}")]
    BackendRejected(String),
    /// Symbol resolution error
    #[error("Symbol resolution error: {0}")]
    SymbolResolution(String),
    /// Invalid operator configuration
    #[error("Configuration error: {0}")]
    Config(String),
    /// IO error during code generation
    #[error("IO error: {0}")]
    IoError(String),
    /// Internal compiler error
    #[error("Internal compiler error: {0}")]
    InternalError(String),
}

impl CodegenError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        CodegenError::UnsupportedFeature(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        CodegenError::InvariantViolation(msg.into())
    }

    /// Only unsupported constructs are absorbed into a fallback
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodegenError::UnsupportedFeature(_))
    }
}

impl From<std::io::Error> for CodegenError {
    fn from(err: std::io::Error) -> Self {
        CodegenError::IoError(err.to_string())
    }
}

impl From<ModuleError> for CodegenError {
    fn from(err: ModuleError) -> Self {
        match err {
            ModuleError::Compilation(cranelift_codegen::CodegenError::Verifier(errors)) => {
                CodegenError::BackendRejected(errors.to_string())
            }
            ModuleError::Compilation(other) => CodegenError::UnsupportedFeature(format!(
                "code emission failed: {}",
                other
            )),
            ModuleError::IncompatibleDeclaration(name) => CodegenError::UnsupportedFeature(
                format!("incompatible declaration of {}", name),
            ),
            ModuleError::IncompatibleSignature(name, ..) => CodegenError::UnsupportedFeature(
                format!("incompatible signature for {}", name),
            ),
            other => CodegenError::SymbolResolution(other.to_string()),
        }
    }
}
