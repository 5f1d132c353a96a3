//! Secure Logger
//!
//! Logging facade that runs every message and payload through the
//! [`DataSanitizer`] before it reaches a [`LogSink`], and mirrors
//! authentication and request events into the [`SecurityAuditTrail`].

use crate::audit_trail::{AuditEventType, AuditOutcome, SecurityAuditTrail};
use crate::sanitizer::DataSanitizer;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A sanitized log record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub fields: Value,
    pub timestamp: DateTime<Utc>,
}

/// Destination for sanitized log records
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &LogRecord);
}

/// Forwards records to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: &LogRecord) {
        let fields = &record.fields;
        match record.level {
            LogLevel::Debug => debug!(target: "flow_security", %fields, "{}", record.message),
            LogLevel::Info => info!(target: "flow_security", %fields, "{}", record.message),
            LogLevel::Warn => warn!(target: "flow_security", %fields, "{}", record.message),
            LogLevel::Error => error!(target: "flow_security", %fields, "{}", record.message),
        }
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &LogRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Outbound HTTP request summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestLog {
    pub method: String,
    pub url: String,

    /// Response status; `None` when no response arrived
    pub status: Option<u16>,

    pub correlation_id: String,
    pub headers: BTreeMap<String, String>,
    pub duration_ms: Option<u64>,
}

impl HttpRequestLog {
    pub fn outcome(&self) -> AuditOutcome {
        match self.status {
            Some(status) if status < 400 => AuditOutcome::Success,
            Some(401) | Some(403) => AuditOutcome::Denied,
            _ => AuditOutcome::Failure,
        }
    }
}

/// Sanitizing logger
pub struct SecureLogger {
    sanitizer: Arc<DataSanitizer>,
    audit: Arc<SecurityAuditTrail>,
    sink: Arc<dyn LogSink>,
}

impl SecureLogger {
    /// Logger emitting through `tracing`
    pub fn new(sanitizer: Arc<DataSanitizer>, audit: Arc<SecurityAuditTrail>) -> Self {
        Self::with_sink(sanitizer, audit, Arc::new(TracingSink))
    }

    pub fn with_sink(
        sanitizer: Arc<DataSanitizer>,
        audit: Arc<SecurityAuditTrail>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            sanitizer,
            audit,
            sink,
        }
    }

    pub fn audit_trail(&self) -> &Arc<SecurityAuditTrail> {
        &self.audit
    }

    /// Sanitize and emit one record
    pub fn log(&self, level: LogLevel, message: &str, data: Value) {
        let record = LogRecord {
            level,
            message: self.sanitizer.sanitize_str(message),
            fields: self.sanitizer.scrub(&data),
            timestamp: Utc::now(),
        };
        self.sink.emit(&record);
    }

    pub fn debug(&self, message: &str, data: Value) {
        self.log(LogLevel::Debug, message, data);
    }

    pub fn info(&self, message: &str, data: Value) {
        self.log(LogLevel::Info, message, data);
    }

    pub fn warn(&self, message: &str, data: Value) {
        self.log(LogLevel::Warn, message, data);
    }

    pub fn error(&self, message: &str, data: Value) {
        self.log(LogLevel::Error, message, data);
    }

    /// Log an authentication event and record it in the audit trail
    pub fn log_auth(
        &self,
        event_type: AuditEventType,
        correlation_id: &str,
        outcome: AuditOutcome,
        details: Value,
    ) {
        let details = self.sanitizer.scrub(&details);
        let level = if outcome == AuditOutcome::Success {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };

        self.log(
            level,
            &format!("Authentication event: {}", event_type.as_str()),
            json!({
                "eventType": event_type.as_str(),
                "correlationId": correlation_id,
                "outcome": outcome.as_str(),
                "details": details.clone(),
            }),
        );
        self.audit
            .log_authentication_event(event_type, correlation_id, outcome, details);
    }

    /// Log an outbound HTTP request and record it in the audit trail
    pub fn log_request(&self, request: &HttpRequestLog) {
        let outcome = request.outcome();
        let headers: Map<String, Value> = request
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();

        let metadata = self.sanitizer.scrub(&json!({
            "method": request.method,
            "url": request.url,
            "status": request.status,
            "durationMs": request.duration_ms,
            "headers": headers,
        }));

        let level = match outcome {
            AuditOutcome::Success => LogLevel::Info,
            _ => LogLevel::Warn,
        };
        let url = metadata
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.log(
            level,
            &format!("{} {}", request.method, url),
            json!({
                "correlationId": request.correlation_id,
                "request": metadata.clone(),
            }),
        );
        self.audit.log_event(
            AuditEventType::ApiRequest,
            &request.correlation_id,
            outcome,
            metadata,
        );
    }
}

impl std::fmt::Debug for SecureLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureLogger")
            .field("audit", &self.audit)
            .finish()
    }
}
