//! Security layer for the Flow provider
//!
//! Provides the credential-security and resilience core used by the
//! provider when it authenticates against the Flow service:
//! - Credential validation before any network call
//! - Authenticated encryption of cached tokens
//! - Classified retry with exponential backoff
//! - Explicit dependency container (no process-wide singletons)
//! - Pattern-driven redaction of secrets and PII
//! - Tamper-evident security audit trail
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Flow provider (caller)                 │
//! └─────────────────────────────────────────────────────┘
//!                          ↓ resolves from
//! ┌─────────────────────────────────────────────────────┐
//! │                DependencyContainer                  │
//! ├─────────────────────────────────────────────────────┤
//! │ CredentialValidator │ EncryptionService │ Retry    │
//! │ SecureLogger → SecurityAuditTrail → DataSanitizer  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! ## Credential Validation (`credential_validator`)
//! - Required fields, injection heuristics, secret strength, URL shape
//! - Machine-readable error codes (malformed / weak / injection)
//! - `with_validated_credentials` guard for operations
//!
//! ## Encryption (`encryption`)
//! - Argon2id key derivation
//! - AES-256-GCM with associated data
//! - Keys zeroized on drop
//!
//! ## Retry (`retry`)
//! - Retryable vs fatal classification by error-code prefix
//! - `min(max, base * multiplier^(n-1))` backoff with optional jitter
//! - Cancellation between attempts
//!
//! ## Sanitization (`sanitizer`)
//! - Ordered pattern table, extensible with custom patterns
//! - Field-name denylist
//! - Depth limited and idempotent
//!
//! ## Audit Trail (`audit_trail`, `secure_logger`)
//! - Sanitized metadata, SHA-256 hash chain
//! - Optional JSON-lines persistence
//! - Logging never breaks the caller's operation
//!
//! # Usage Examples
//!
//! ## Wiring
//!
//! ```rust,no_run
//! use flow_security::{bootstrap, SecurityConfig, SecurityServices};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SecurityConfig::from_env()?;
//! let container = bootstrap(&config);
//! let services = SecurityServices::resolve(&container)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Validated, retried token fetch
//!
//! ```rust,no_run
//! use flow_security::{
//!     with_validated_credentials, Credentials, CredentialValidator, EnhancedRetry,
//!     OperationError,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = Credentials::new(
//!     "https://flow.example.com",
//!     "acme",
//!     "flow-client-01",
//!     "Xk9#mP2$vL7@qR4!wT6z",
//! );
//! let validator = CredentialValidator::default();
//! let retry = EnhancedRetry::with_defaults();
//!
//! let token = with_validated_credentials(&validator, &credentials, || async {
//!     retry
//!         .execute(|| async { Ok::<_, OperationError>("token".to_string()) }, "fetch_token")
//!         .await
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sealing a token
//!
//! ```rust,no_run
//! use flow_security::{EncryptionConfig, EncryptionService};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = EncryptionService::new(&EncryptionConfig::default())?;
//! let salt = EncryptionService::generate_salt();
//! let key = service.generate_key("passphrase", &salt)?;
//!
//! let sealed = service.seal_str("refresh-token", &key, "flow.refresh_token")?;
//! let token = service.open_str(&sealed, &key, "flow.refresh_token")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sanitizing
//!
//! ```rust
//! use flow_security::DataSanitizer;
//! use serde_json::json;
//!
//! let sanitizer = DataSanitizer::default();
//! let result = sanitizer.sanitize(&json!({ "clientSecret": "hunter2", "user": "a@b.io" }));
//! assert_eq!(result.sanitized["clientSecret"], "[REDACTED]");
//! assert_eq!(result.sanitized["user"], "[REDACTED_EMAIL]");
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod audit_trail;
pub mod config;
pub mod container;
pub mod credential_validator;
pub mod encryption;
pub mod retry;
pub mod sanitizer;
pub mod secure_logger;
pub mod services;

// Re-exports for convenience
pub use audit_trail::{
    AuditConfig, AuditError, AuditEvent, AuditEventType, AuditOutcome, AuditStats,
    SecurityAuditTrail,
};
pub use config::{ConfigError, SecurityConfig};
pub use container::{ContainerError, DependencyContainer, Lifetime};
pub use credential_validator::{
    with_validated_credentials, CredentialErrorCode, CredentialPolicy, CredentialValidationError,
    CredentialValidator, Credentials, Enforcement, GuardedError,
};
pub use encryption::{
    EncryptedPayload, EncryptionConfig, EncryptionError, EncryptionKey, EncryptionService,
};
pub use retry::{EnhancedRetry, ErrorCode, OperationError, PolicyError, RetryError, RetryPolicy};
pub use sanitizer::{
    DataSanitizer, SanitizationPattern, SanitizationResult, SanitizerConfig, SanitizerError,
    SanitizerStats,
};
pub use secure_logger::{
    HttpRequestLog, LogLevel, LogRecord, LogSink, MemorySink, SecureLogger, TracingSink,
};
pub use services::{bootstrap, SecurityServices};
