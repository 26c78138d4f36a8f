//! Operator configuration
//!
//! Settings come from a JSON file (or defaults) and a couple of environment
//! overrides that are handy while bisecting a miscompilation.

use crate::codegen::{CodegenError, CodegenResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable overriding [`LoweringConfig::method_limit`]
pub const ENV_METHOD_LIMIT: &str = "METHODJIT_COUNT";
/// Environment variable enabling [`LoweringConfig::dump_ir`]
pub const ENV_DUMP_IR: &str = "METHODJIT_DUMP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    /// Value of Cranelift's `opt_level` setting
    pub fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoweringConfig {
    /// Attempt at most this many methods, then fall back for everything
    pub method_limit: Option<usize>,
    /// Run the Cranelift verifier on every lowered function
    pub verify: bool,
    pub opt_level: OptLevel,
    /// Target triple; the host when absent
    pub target: Option<String>,
    /// Log the generated Cranelift IR at debug level
    pub dump_ir: bool,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            method_limit: None,
            verify: cfg!(debug_assertions),
            opt_level: OptLevel::default(),
            target: None,
            dump_ir: false,
        }
    }
}

impl LoweringConfig {
    pub fn from_json(text: &str) -> CodegenResult<Self> {
        serde_json::from_str(text).map_err(|e| CodegenError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> CodegenResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Apply `METHODJIT_COUNT` and `METHODJIT_DUMP`
    pub fn with_env_overrides(mut self) -> CodegenResult<Self> {
        if let Ok(count) = std::env::var(ENV_METHOD_LIMIT) {
            let limit = count.trim().parse::<usize>().map_err(|_| {
                CodegenError::Config(format!("{} must be a method count, got {:?}", ENV_METHOD_LIMIT, count))
            })?;
            self.method_limit = Some(limit);
        }
        if let Ok(dump) = std::env::var(ENV_DUMP_IR) {
            self.dump_ir = !matches!(dump.as_str(), "" | "0" | "false");
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = LoweringConfig::from_json(r#"{"method_limit": 3, "opt_level": "none"}"#)
            .expect("config should parse");
        assert_eq!(config.method_limit, Some(3));
        assert_eq!(config.opt_level, OptLevel::None);
        assert!(!config.dump_ir);
        assert!(config.target.is_none());
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = LoweringConfig::from_json("{").expect_err("should fail");
        assert!(matches!(err, CodegenError::Config(_)));
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("methodjit.json");
        std::fs::write(&path, r#"{"verify": true, "target": "x86_64-unknown-linux-gnu"}"#)
            .expect("write config");
        let config = LoweringConfig::from_file(&path).expect("config should load");
        assert!(config.verify);
        assert_eq!(config.target.as_deref(), Some("x86_64-unknown-linux-gnu"));
    }
}
