//! Composition root
//!
//! Registers every security component in a [`DependencyContainer`] under the
//! well-known [`keys`], as singletons. Callers own the container and pass it
//! (or the resolved [`SecurityServices`]) down explicitly.

use crate::audit_trail::SecurityAuditTrail;
use crate::config::SecurityConfig;
use crate::container::{BoxError, ContainerError, DependencyContainer, Lifetime};
use crate::credential_validator::CredentialValidator;
use crate::encryption::EncryptionService;
use crate::retry::EnhancedRetry;
use crate::sanitizer::DataSanitizer;
use crate::secure_logger::SecureLogger;
use std::sync::Arc;
use tracing::info;

/// Registration keys
pub mod keys {
    pub const CONFIG: &str = "config";
    pub const CREDENTIAL_VALIDATOR: &str = "credential_validator";
    pub const ENCRYPTION_SERVICE: &str = "encryption_service";
    pub const ENHANCED_RETRY: &str = "enhanced_retry";
    pub const DATA_SANITIZER: &str = "data_sanitizer";
    pub const SECURITY_AUDIT_TRAIL: &str = "security_audit_trail";
    pub const SECURE_LOGGER: &str = "secure_logger";
}

/// Build a container wired from `config`. Components are created lazily on
/// first resolution; any registration can be replaced before then.
pub fn bootstrap(config: &SecurityConfig) -> DependencyContainer {
    let container = DependencyContainer::new();

    container.register_instance(keys::CONFIG, Arc::new(config.clone()));

    container.try_register(
        keys::CREDENTIAL_VALIDATOR,
        |c| -> Result<CredentialValidator, ContainerError> {
            let config = c.resolve::<SecurityConfig>(keys::CONFIG)?;
            Ok(CredentialValidator::new(config.credentials.clone()))
        },
        Lifetime::Singleton,
    );

    container.try_register(
        keys::ENCRYPTION_SERVICE,
        |c| -> Result<EncryptionService, BoxError> {
            let config = c.resolve::<SecurityConfig>(keys::CONFIG)?;
            Ok(EncryptionService::new(&config.encryption)?)
        },
        Lifetime::Singleton,
    );

    container.try_register(
        keys::ENHANCED_RETRY,
        |c| -> Result<EnhancedRetry, BoxError> {
            let config = c.resolve::<SecurityConfig>(keys::CONFIG)?;
            Ok(EnhancedRetry::new(config.retry.clone())?)
        },
        Lifetime::Singleton,
    );

    container.try_register(
        keys::DATA_SANITIZER,
        |c| -> Result<DataSanitizer, ContainerError> {
            let config = c.resolve::<SecurityConfig>(keys::CONFIG)?;
            Ok(DataSanitizer::new(config.sanitizer.clone()))
        },
        Lifetime::Singleton,
    );

    container.try_register(
        keys::SECURITY_AUDIT_TRAIL,
        |c| -> Result<SecurityAuditTrail, ContainerError> {
            let config = c.resolve::<SecurityConfig>(keys::CONFIG)?;
            let sanitizer = c.resolve::<DataSanitizer>(keys::DATA_SANITIZER)?;
            Ok(SecurityAuditTrail::new(config.audit.clone(), sanitizer))
        },
        Lifetime::Singleton,
    );

    container.try_register(
        keys::SECURE_LOGGER,
        |c| -> Result<SecureLogger, ContainerError> {
            let sanitizer = c.resolve::<DataSanitizer>(keys::DATA_SANITIZER)?;
            let audit = c.resolve::<SecurityAuditTrail>(keys::SECURITY_AUDIT_TRAIL)?;
            Ok(SecureLogger::new(sanitizer, audit))
        },
        Lifetime::Singleton,
    );

    info!(services = container.len(), "Security services registered");
    container
}

/// Every security component, resolved from one container
#[derive(Debug, Clone)]
pub struct SecurityServices {
    pub config: Arc<SecurityConfig>,
    pub validator: Arc<CredentialValidator>,
    pub encryption: Arc<EncryptionService>,
    pub retry: Arc<EnhancedRetry>,
    pub sanitizer: Arc<DataSanitizer>,
    pub audit: Arc<SecurityAuditTrail>,
    pub logger: Arc<SecureLogger>,
}

impl SecurityServices {
    pub fn resolve(container: &DependencyContainer) -> Result<Self, ContainerError> {
        Ok(Self {
            config: container.resolve(keys::CONFIG)?,
            validator: container.resolve(keys::CREDENTIAL_VALIDATOR)?,
            encryption: container.resolve(keys::ENCRYPTION_SERVICE)?,
            retry: container.resolve(keys::ENHANCED_RETRY)?,
            sanitizer: container.resolve(keys::DATA_SANITIZER)?,
            audit: container.resolve(keys::SECURITY_AUDIT_TRAIL)?,
            logger: container.resolve(keys::SECURE_LOGGER)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitizer::SanitizationPattern;

    #[test]
    fn test_bootstrap_registers_every_component() {
        let container = bootstrap(&SecurityConfig::default());
        assert_eq!(container.len(), 7);
        for key in [
            keys::CONFIG,
            keys::CREDENTIAL_VALIDATOR,
            keys::ENCRYPTION_SERVICE,
            keys::ENHANCED_RETRY,
            keys::DATA_SANITIZER,
            keys::SECURITY_AUDIT_TRAIL,
            keys::SECURE_LOGGER,
        ] {
            assert!(container.is_registered(key), "{key}");
        }
    }

    #[test]
    fn test_components_share_singletons() {
        let container = bootstrap(&SecurityConfig::default());
        let services = SecurityServices::resolve(&container).unwrap();

        assert!(Arc::ptr_eq(services.logger.audit_trail(), &services.audit));
        let again = SecurityServices::resolve(&container).unwrap();
        assert!(Arc::ptr_eq(&services.sanitizer, &again.sanitizer));
        assert!(Arc::ptr_eq(&services.retry, &again.retry));
    }

    #[test]
    fn test_substitute_before_first_resolution() {
        let container = bootstrap(&SecurityConfig::default());
        let sanitizer = DataSanitizer::default();
        sanitizer
            .add_custom_pattern(
                SanitizationPattern::new("tenant_id", r"\btenant-\d+\b", "[TENANT]", "Tenant ids")
                    .unwrap(),
            )
            .unwrap();
        container.register_instance(keys::DATA_SANITIZER, Arc::new(sanitizer));

        let services = SecurityServices::resolve(&container).unwrap();
        assert_eq!(services.sanitizer.get_stats().custom_patterns, 1);
        assert_eq!(services.sanitizer.sanitize_str("tenant-7"), "[TENANT]");
    }

    #[test]
    fn test_invalid_config_surfaces_as_factory_error() {
        let mut config = SecurityConfig::default();
        config.retry.base_delay_ms = 60_000;

        let container = bootstrap(&config);
        assert!(matches!(
            container.resolve::<EnhancedRetry>(keys::ENHANCED_RETRY),
            Err(ContainerError::Factory { .. })
        ));
    }
}
