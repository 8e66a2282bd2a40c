// config.rs - compiler configuration
//
// Loaded from TOML or built in code. The configuration participates in
// cache keys, so two compilations of the same module with different
// settings never share artifacts.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// What to do with a function the translator cannot compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Reject the whole module.
    Fail,
    /// Interpret the function and log a warning.
    #[default]
    Warn,
    /// Interpret the function without complaint.
    Silent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub fallback: FallbackPolicy,
    /// Upper bound on functions packed into one code unit.
    pub max_functions_per_unit: usize,
    /// Prefix for generated code unit names.
    pub unit_prefix: String,
    /// Function indices to interpret even when they would compile.
    pub force_interpret: Vec<u32>,
}

impl Default for CompilerConfig {
    fn default() -> CompilerConfig {
        CompilerConfig {
            fallback: FallbackPolicy::default(),
            max_functions_per_unit: 200,
            unit_prefix: "wasm".to_string(),
            force_interpret: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("max_functions_per_unit must be at least 1")]
    EmptyUnitBound,
}

impl CompilerConfig {
    pub fn from_toml_file(path: &Path) -> Result<CompilerConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: CompilerConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_functions_per_unit == 0 {
            return Err(ConfigError::EmptyUnitBound);
        }
        Ok(())
    }

    /// Canonical form fed into cache keys. Serialization is stable across
    /// runs for equal configurations.
    pub fn cache_fingerprint(&self) -> String {
        toml::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_warn() {
        let config = CompilerConfig::default();
        assert_eq!(config.fallback, FallbackPolicy::Warn);
        assert_eq!(config.max_functions_per_unit, 200);
    }

    #[test]
    fn test_parse_toml() {
        let config: CompilerConfig = toml::from_str(
            r#"
            fallback = "fail"
            max_functions_per_unit = 8
            unit_prefix = "app"
            force_interpret = [3, 7]
            "#,
        )
        .unwrap();
        assert_eq!(config.fallback, FallbackPolicy::Fail);
        assert_eq!(config.max_functions_per_unit, 8);
        assert_eq!(config.unit_prefix, "app");
        assert_eq!(config.force_interpret, vec![3, 7]);
    }

    #[test]
    fn test_fingerprint_differs_with_settings() {
        let a = CompilerConfig::default();
        let mut b = CompilerConfig::default();
        b.max_functions_per_unit = 1;
        assert_ne!(a.cache_fingerprint(), b.cache_fingerprint());
    }

    #[test]
    fn test_zero_unit_bound_rejected() {
        let mut config = CompilerConfig::default();
        config.max_functions_per_unit = 0;
        assert!(config.validate().is_err());
    }
}
