pub mod codegen;
pub mod config;
pub mod ir;

pub use codegen::cranelift::{
    AotArtifact, AotBackend, AotMethod, Fallback, JitBackend, JitMethod, LoweredFunction, LoweringStats,
    MethodOutcome,
};
pub use codegen::runtime::{RuntimeHelper, RuntimeHooks};
pub use codegen::{CodegenError, CodegenResult};
pub use config::{LoweringConfig, OptLevel};
pub use ir::{Method, MethodBuilder, MethodBundle, TypeQueries, TypeTable};
