//! Configuration for the security layer

use crate::audit_trail::AuditConfig;
use crate::credential_validator::CredentialPolicy;
use crate::encryption::EncryptionConfig;
use crate::retry::RetryPolicy;
use crate::sanitizer::{normalize_field, SanitizerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid environment value {var}={value}")]
    Env { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Security layer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Retry policy for outbound operations
    pub retry: RetryPolicy,

    /// Sanitizer configuration
    pub sanitizer: SanitizerConfig,

    /// Credential strength thresholds
    pub credentials: CredentialPolicy,

    /// Key derivation cost
    pub encryption: EncryptionConfig,

    /// Audit trail configuration
    pub audit: AuditConfig,
}

impl SecurityConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SecurityConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by `FLOW_*` variables resolved through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = SecurityConfig::default();

        if let Some(value) = parse_var(&lookup, "FLOW_RETRY_MAX_RETRIES")? {
            config.retry.max_retries = value;
        }

        if let Some(value) = parse_var(&lookup, "FLOW_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay_ms = value;
        }

        if let Some(value) = parse_var(&lookup, "FLOW_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay_ms = value;
        }

        if let Some(value) = parse_flag(&lookup, "FLOW_RETRY_JITTER")? {
            config.retry.jitter = value;
        }

        if let Some(value) = parse_flag(&lookup, "FLOW_SANITIZER_ENABLED")? {
            config.sanitizer.enable_sanitization = value;
        }

        if let Some(value) = parse_flag(&lookup, "FLOW_SANITIZER_STRICT")? {
            config.sanitizer.strict_mode = value;
        }

        if let Some(path) = lookup("FLOW_AUDIT_LOG_PATH").filter(|p| !p.trim().is_empty()) {
            config.audit.log_path = Some(PathBuf::from(path));
        }

        if let Some(value) = parse_var(&lookup, "FLOW_MIN_SECRET_LENGTH")? {
            config.credentials.min_secret_length = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        self.retry
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("retry: {e}")))?;

        self.encryption
            .params()
            .map_err(|e| ConfigError::Invalid(format!("encryption: {e}")))?;

        if self.sanitizer.max_depth == 0 {
            return Err(ConfigError::Invalid(
                "sanitizer: max_depth must be at least 1".to_string(),
            ));
        }

        if let Some(field) = self
            .sanitizer
            .sensitive_fields
            .iter()
            .find(|field| normalize_field(field).is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "sanitizer: sensitive field {field:?} is empty after normalization"
            )));
        }

        if self.credentials.min_secret_length == 0 {
            return Err(ConfigError::Invalid(
                "credentials: min_secret_length must be at least 1".to_string(),
            ));
        }

        if !self.credentials.min_entropy_bits.is_finite() || self.credentials.min_entropy_bits < 0.0
        {
            return Err(ConfigError::Invalid(format!(
                "credentials: min_entropy_bits must be a non-negative number, got {}",
                self.credentials.min_entropy_bits
            )));
        }

        if self.audit.max_events == 0 {
            return Err(ConfigError::Invalid(
                "audit: max_events must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };

    let parsed = value.trim().parse::<T>();
    parsed.map(Some).map_err(|_| ConfigError::Env { var, value })
}

fn parse_flag<F>(lookup: &F, var: &'static str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Env { var, value }),
        },
        None => Ok(None),
    }
}
