//! Credential Validation
//!
//! Shape and strength checks for tenant credentials, run before any network
//! call is made with them. Checks run in a fixed order and stop at the first
//! failure:
//! 1. Required fields present and well-formed
//! 2. Injection-indicative substrings
//! 3. Client secret strength
//! 4. Absolute HTTP(S) URLs
//!
//! The injection and weak-secret checks are string heuristics. They are
//! defense in depth, not a security boundary.

use crate::retry::ErrorCode;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const MIN_CLIENT_SECRET_LENGTH: usize = 16;

/// Shannon entropy floor, in bits per character
pub const MIN_SECRET_ENTROPY_BITS: f64 = 3.0;

pub const MIN_CLIENT_ID_LENGTH: usize = 3;

pub const MAX_CREDENTIAL_FIELD_LENGTH: usize = 512;

/// Compared after lowercasing and stripping trailing digits
const COMMON_SECRETS: &[&str] = &[
    "password",
    "passw0rd",
    "changeme",
    "secret",
    "clientsecret",
    "letmein",
    "welcome",
    "qwerty",
    "qwertyuiop",
    "admin",
    "administrator",
    "default",
    "test",
];

lazy_static! {
    static ref INJECTION_PATTERNS: Vec<Regex> = [
        // Quote immediately followed by a comment marker: '-- "# `/*
        r#"['"`]\s*(?:--|#|/\*)"#,
        // Tautologies: ' or '1'='1
        r#"(?i)['"]\s*or\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#,
        // Stacked statements
        r"(?i);\s*(?:drop|delete|insert|update|truncate|alter|exec|shutdown)\b",
        r"(?i)\bunion\s+(?:all\s+)?select\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("injection pattern must compile"))
    .collect();
}

/// Machine-readable failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialErrorCode {
    Malformed,
    WeakSecret,
    InjectionSuspected,
}

impl CredentialErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "CREDENTIAL_MALFORMED",
            Self::WeakSecret => "CREDENTIAL_WEAK_SECRET",
            Self::InjectionSuspected => "CREDENTIAL_INJECTION_SUSPECTED",
        }
    }
}

impl fmt::Display for CredentialErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential validation failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {field} {message}")]
pub struct CredentialValidationError {
    pub code: CredentialErrorCode,

    /// Offending field, as named in the credential document (`clientSecret`)
    pub field: &'static str,

    pub message: String,
}

impl CredentialValidationError {
    fn new(code: CredentialErrorCode, field: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            field,
            message: message.into(),
        }
    }

    fn malformed(field: &'static str, message: impl Into<String>) -> Self {
        Self::new(CredentialErrorCode::Malformed, field, message)
    }
}

impl ErrorCode for CredentialValidationError {
    fn error_code(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.code.as_str())
    }
}

pub type Result<T> = std::result::Result<T, CredentialValidationError>;

/// Tenant credentials for the Flow service
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub base_url: String,
    pub tenant: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub auth_base_url: Option<String>,
}

impl Credentials {
    pub fn new(
        base_url: impl Into<String>,
        tenant: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            tenant: tenant.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_base_url: None,
        }
    }

    pub fn with_auth_base_url(mut self, auth_base_url: impl Into<String>) -> Self {
        self.auth_base_url = Some(auth_base_url.into());
        self
    }

    /// Non-secret identifying fields, for audit metadata
    pub fn summary(&self) -> Value {
        json!({
            "baseUrl": self.base_url,
            "tenant": self.tenant,
            "clientId": self.client_id,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url)
            .field("tenant", &self.tenant)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("auth_base_url", &self.auth_base_url)
            .finish()
    }
}

/// How a weak client secret is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    #[default]
    Reject,
    Warn,
}

/// Credential strength thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialPolicy {
    pub min_secret_length: usize,
    pub min_entropy_bits: f64,
    pub weak_secret: Enforcement,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            min_secret_length: MIN_CLIENT_SECRET_LENGTH,
            min_entropy_bits: MIN_SECRET_ENTROPY_BITS,
            weak_secret: Enforcement::Reject,
        }
    }
}

/// Credential validator
#[derive(Debug, Clone, Default)]
pub struct CredentialValidator {
    policy: CredentialPolicy,
}

impl CredentialValidator {
    pub fn new(policy: CredentialPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CredentialPolicy {
        &self.policy
    }

    /// Validate credentials, failing on the first violated check
    pub fn validate(&self, credentials: &Credentials) -> Result<()> {
        self.check_required(credentials)?;
        self.check_injection(credentials)?;

        if let Err(weak) = self.check_secret_strength(&credentials.client_secret) {
            match self.policy.weak_secret {
                Enforcement::Reject => return Err(weak),
                Enforcement::Warn => warn!(
                    field = weak.field,
                    reason = %weak.message,
                    "Weak client secret accepted"
                ),
            }
        }

        check_url("baseUrl", &credentials.base_url)?;
        if let Some(auth_base_url) = &credentials.auth_base_url {
            check_url("authBaseUrl", auth_base_url)?;
        }

        debug!(
            client_id = %credentials.client_id,
            tenant = %credentials.tenant,
            "Credentials validated"
        );
        Ok(())
    }

    fn check_required(&self, credentials: &Credentials) -> Result<()> {
        let client_id = credentials.client_id.trim();
        if client_id.is_empty() {
            return Err(CredentialValidationError::malformed("clientId", "is required"));
        }
        if credentials.client_secret.trim().is_empty() {
            return Err(CredentialValidationError::malformed(
                "clientSecret",
                "is required",
            ));
        }
        if credentials.tenant.trim().is_empty() {
            return Err(CredentialValidationError::malformed("tenant", "is required"));
        }

        if client_id.chars().count() < MIN_CLIENT_ID_LENGTH {
            return Err(CredentialValidationError::malformed(
                "clientId",
                format!("must be at least {MIN_CLIENT_ID_LENGTH} characters"),
            ));
        }
        if credentials
            .client_id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(CredentialValidationError::malformed(
                "clientId",
                "must not contain whitespace or control characters",
            ));
        }
        if credentials.client_secret.chars().any(char::is_control) {
            return Err(CredentialValidationError::malformed(
                "clientSecret",
                "must not contain control characters",
            ));
        }

        for (field, value) in [
            ("clientId", &credentials.client_id),
            ("clientSecret", &credentials.client_secret),
            ("tenant", &credentials.tenant),
        ] {
            let length = value.chars().count();
            if length > MAX_CREDENTIAL_FIELD_LENGTH {
                return Err(CredentialValidationError::malformed(
                    field,
                    format!("exceeds {MAX_CREDENTIAL_FIELD_LENGTH} characters (got {length})"),
                ));
            }
        }

        Ok(())
    }

    fn check_injection(&self, credentials: &Credentials) -> Result<()> {
        for (field, value) in [
            ("clientId", &credentials.client_id),
            ("clientSecret", &credentials.client_secret),
            ("tenant", &credentials.tenant),
        ] {
            if INJECTION_PATTERNS.iter().any(|pattern| pattern.is_match(value)) {
                warn!(field, "Injection-indicative credential input rejected");
                return Err(CredentialValidationError::new(
                    CredentialErrorCode::InjectionSuspected,
                    field,
                    "contains injection-indicative input",
                ));
            }
        }
        Ok(())
    }

    fn check_secret_strength(&self, secret: &str) -> Result<()> {
        let weak = |message: String| {
            Err(CredentialValidationError::new(
                CredentialErrorCode::WeakSecret,
                "clientSecret",
                message,
            ))
        };

        let length = secret.chars().count();
        if length < self.policy.min_secret_length {
            return weak(format!(
                "must be at least {} characters (got {length})",
                self.policy.min_secret_length
            ));
        }

        if secret.chars().all(|c| c.is_ascii_lowercase()) {
            return weak("must not be a single lowercase word".to_string());
        }

        let stem = secret
            .to_ascii_lowercase()
            .trim_end_matches(|c: char| c.is_ascii_digit() || c == '!')
            .to_string();
        if stem.is_empty() || COMMON_SECRETS.contains(&stem.as_str()) {
            return weak("is a commonly used secret".to_string());
        }

        let entropy = shannon_entropy(secret);
        if entropy < self.policy.min_entropy_bits {
            return weak(format!(
                "entropy {entropy:.2} bits/char is below {:.2}",
                self.policy.min_entropy_bits
            ));
        }

        Ok(())
    }
}

fn check_url(field: &'static str, value: &str) -> Result<()> {
    let url = Url::parse(value.trim()).map_err(|error| {
        CredentialValidationError::malformed(field, format!("is not a valid URL: {error}"))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(CredentialValidationError::malformed(
            field,
            format!("must use http or https, not {}", url.scheme()),
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(CredentialValidationError::malformed(field, "must include a host"));
    }

    Ok(())
}

/// Shannon entropy of `value` in bits per character
pub fn shannon_entropy(value: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in value.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }

    let total = value.chars().count() as f64;
    if total == 0.0 {
        return 0.0;
    }

    counts
        .values()
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Failure of a credential-guarded operation
#[derive(Error, Debug)]
pub enum GuardedError<E> {
    #[error("Credential validation failed: {0}")]
    Validation(#[from] CredentialValidationError),

    #[error("Operation failed: {0}")]
    Operation(#[source] E),
}

/// Validate `credentials`, then run `operation`. The operation never runs
/// with credentials that failed validation.
pub async fn with_validated_credentials<T, E, F, Fut>(
    validator: &CredentialValidator,
    credentials: &Credentials,
    operation: F,
) -> std::result::Result<T, GuardedError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    validator.validate(credentials)?;
    operation().await.map_err(GuardedError::Operation)
}
