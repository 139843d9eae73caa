//! Engine configuration.
//!
//! Validation happens before any core component is constructed: a config
//! with out-of-range values never reaches the rotation engine.

use serde::Deserialize;
use thiserror::Error;

/// Inclusive bounds for the per-elastic-key material count.
pub const MIN_MATERIALS: u32 = 1;
pub const MAX_MATERIALS: u32 = 100;

/// Audit sampling rate bounds, in percent.
pub const MAX_SAMPLE_RATE: u8 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_materials must be between {MIN_MATERIALS} and {MAX_MATERIALS}, got {0}")]
    MaxMaterialsOutOfRange(u32),

    #[error("audit_sample_rate must be between 0 and {MAX_SAMPLE_RATE}, got {0}")]
    SampleRateOutOfRange(u8),
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Default materials bound for newly created elastic keys.
    #[serde(default = "default_max_materials")]
    pub max_materials: u32,

    /// Whether audit events are emitted at all.
    #[serde(default = "default_audit_enabled")]
    pub audit_enabled: bool,

    /// Percentage of create/rotate events to audit (0–100), decided
    /// independently per event.
    #[serde(default = "default_sample_rate")]
    pub audit_sample_rate: u8,
}

fn default_max_materials() -> u32 {
    10
}

fn default_audit_enabled() -> bool {
    true
}

fn default_sample_rate() -> u8 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_materials: default_max_materials(),
            audit_enabled: default_audit_enabled(),
            audit_sample_rate: default_sample_rate(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_max_materials(self.max_materials)?;
        if self.audit_sample_rate > MAX_SAMPLE_RATE {
            return Err(ConfigError::SampleRateOutOfRange(self.audit_sample_rate));
        }
        Ok(())
    }
}

/// Shared bound check, also applied to per-key overrides.
pub(crate) fn validate_max_materials(value: u32) -> Result<(), ConfigError> {
    if !(MIN_MATERIALS..=MAX_MATERIALS).contains(&value) {
        return Err(ConfigError::MaxMaterialsOutOfRange(value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_materials() {
        let config = EngineConfig {
            max_materials: 0,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::MaxMaterialsOutOfRange(0))
        );
    }

    #[test]
    fn rejects_excess_materials() {
        let config = EngineConfig {
            max_materials: 101,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_sample_rate_over_100() {
        let config = EngineConfig {
            audit_sample_rate: 101,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::SampleRateOutOfRange(101)));
    }

    #[test]
    fn bounds_are_inclusive() {
        for max_materials in [MIN_MATERIALS, MAX_MATERIALS] {
            let config = EngineConfig {
                max_materials,
                audit_sample_rate: 0,
                ..EngineConfig::default()
            };
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_materials, 10);
        assert!(config.audit_enabled);
        assert_eq!(config.audit_sample_rate, 100);
    }
}
