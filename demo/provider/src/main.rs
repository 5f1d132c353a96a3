//! Flow Provider Demo
//!
//! Runs one authenticated token fetch through the security layer:
//! credential validation, retried fetch against a flaky endpoint, token
//! sealing and the audit trail.

use flow_security::{
    bootstrap, with_validated_credentials, AuditEventType, AuditOutcome, Credentials,
    EncryptionService, HttpRequestLog, OperationError, SecurityConfig, SecurityServices,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

const TOKEN_CONTEXT: &str = "flow.access_token";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration
    let config = if let Ok(config_path) = std::env::var("FLOW_SECURITY_CONFIG") {
        info!("Loading config from: {}", config_path);
        SecurityConfig::from_file(&config_path)?
    } else {
        info!("Loading config from environment variables");
        SecurityConfig::from_env()?
    };

    let container = bootstrap(&config);
    let services = SecurityServices::resolve(&container)?;
    let credentials = credentials_from_env();
    let correlation_id = Uuid::new_v4().to_string();

    services.logger.info(
        "Starting token fetch",
        json!({ "correlationId": correlation_id, "credentials": credentials.summary() }),
    );

    // Fails twice with a transient error, then succeeds
    let attempts = Arc::new(AtomicU32::new(0));
    let started = Instant::now();
    let token = with_validated_credentials(&services.validator, &credentials, || {
        let attempts = attempts.clone();
        let retry = services.retry.clone();
        async move {
            retry
                .execute(
                    || {
                        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        async move {
                            if attempt < 3 {
                                Err(OperationError::new("ECONNRESET", "connection reset by peer"))
                            } else {
                                Ok(format!("flow-access-{}", Uuid::new_v4().simple()))
                            }
                        }
                    },
                    "fetch_access_token",
                )
                .await
        }
    })
    .await;

    let request = HttpRequestLog {
        method: "POST".to_string(),
        url: format!(
            "{}/oauth/token",
            credentials.auth_base_url.as_deref().unwrap_or(&credentials.base_url)
        ),
        status: Some(if token.is_ok() { 200 } else { 401 }),
        correlation_id: correlation_id.clone(),
        headers: BTreeMap::from([(
            "Authorization".to_string(),
            format!("Basic {}", credentials.client_id),
        )]),
        duration_ms: Some(started.elapsed().as_millis() as u64),
    };
    services.logger.log_request(&request);

    let token = match token {
        Ok(token) => {
            services.logger.log_auth(
                AuditEventType::AuthenticationSuccess,
                &correlation_id,
                AuditOutcome::Success,
                json!({ "attempts": attempts.load(Ordering::SeqCst) }),
            );
            token
        }
        Err(error) => {
            services.logger.log_auth(
                AuditEventType::AuthenticationFailure,
                &correlation_id,
                AuditOutcome::Failure,
                json!({ "error": error.to_string() }),
            );
            return Err(error.into());
        }
    };

    // Seal the token at rest
    let salt = EncryptionService::generate_salt();
    let key = services
        .encryption
        .generate_key(&credentials.client_secret, &salt)?;
    services.audit.log_encryption_event(
        AuditEventType::KeyDerivation,
        &correlation_id,
        AuditOutcome::Success,
        json!({ "saltLength": salt.len() }),
    );

    let sealed = services.encryption.seal_str(&token, &key, TOKEN_CONTEXT)?;
    services.audit.log_encryption_event(
        AuditEventType::Encryption,
        &correlation_id,
        AuditOutcome::Success,
        json!({ "context": TOKEN_CONTEXT, "ciphertextLength": sealed.ciphertext.len() }),
    );

    let opened = services.encryption.open_str(&sealed, &key, TOKEN_CONTEXT)?;
    services.audit.log_encryption_event(
        AuditEventType::Decryption,
        &correlation_id,
        AuditOutcome::from_success(opened == token),
        json!({ "context": TOKEN_CONTEXT }),
    );

    services.logger.info(
        "Token sealed",
        json!({ "correlationId": correlation_id, "sealed": sealed }),
    );

    info!(intact = services.audit.verify_integrity()?, "Audit chain checked");
    println!(
        "{}",
        serde_json::to_string_pretty(&services.audit.get_audit_stats())?
    );

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = matches!(std::env::var("FLOW_LOG_JSON").as_deref(), Ok("1") | Ok("true"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn credentials_from_env() -> Credentials {
    let var = |name: &str, fallback: &str| std::env::var(name).unwrap_or_else(|_| fallback.to_string());

    let credentials = Credentials::new(
        var("FLOW_BASE_URL", "https://flow.example.com"),
        var("FLOW_TENANT", "acme"),
        var("FLOW_CLIENT_ID", "flow-client-01"),
        var("FLOW_CLIENT_SECRET", "Xk9#mP2$vL7@qR4!wT6z"),
    );

    match std::env::var("FLOW_AUTH_BASE_URL") {
        Ok(auth_base_url) => credentials.with_auth_base_url(auth_base_url),
        Err(_) => credentials,
    }
}
