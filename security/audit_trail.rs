//! Security Audit Trail
//!
//! Append-only ledger of security events:
//! - Authentication attempts, successes, failures and token refreshes
//! - Credential validation outcomes
//! - Encryption, decryption and key derivation
//! - Outbound API requests and security violations
//!
//! Features:
//! - Metadata is always scrubbed by the [`DataSanitizer`] before storage
//! - Tamper detection with a SHA-256 hash chain
//! - Optional JSON-lines persistence
//! - Bounded in-memory retention
//!
//! Recording never fails from the caller's point of view. Persistence errors
//! are logged and counted, and the event stays in memory.

use crate::sanitizer::DataSanitizer;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_EVENTS: usize = 10_000;

/// Audit trail errors
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Integrity check failed: {0}")]
    IntegrityFailure(String),
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// Audit event type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Authentication events
    AuthenticationAttempt,
    AuthenticationSuccess,
    AuthenticationFailure,
    TokenRefresh,
    CredentialValidation,

    // Cryptographic events
    Encryption,
    Decryption,
    KeyDerivation,

    // Traffic and policy events
    ApiRequest,
    SecurityViolation,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationAttempt => "authentication_attempt",
            Self::AuthenticationSuccess => "authentication_success",
            Self::AuthenticationFailure => "authentication_failure",
            Self::TokenRefresh => "token_refresh",
            Self::CredentialValidation => "credential_validation",
            Self::Encryption => "encryption",
            Self::Decryption => "decryption",
            Self::KeyDerivation => "key_derivation",
            Self::ApiRequest => "api_request",
            Self::SecurityViolation => "security_violation",
        }
    }
}

/// Audit outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
        }
    }

    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// Audit event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// Unique event ID
    pub event_id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    pub event_type: AuditEventType,

    /// Ties together the events of one logical operation
    pub correlation_id: String,

    pub outcome: AuditOutcome,

    /// Sanitized metadata
    pub metadata: Value,

    /// Previous event hash (for hash chain)
    pub previous_hash: String,

    /// Current event hash
    pub hash: String,
}

impl AuditEvent {
    fn new(
        event_type: AuditEventType,
        correlation_id: String,
        outcome: AuditOutcome,
        metadata: Value,
        previous_hash: String,
    ) -> Self {
        let mut event = Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            correlation_id,
            outcome,
            metadata,
            previous_hash,
            hash: String::new(),
        };

        event.hash = event.compute_hash();
        event
    }

    /// Compute event hash
    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();

        // Every field except the hash itself
        hasher.update(self.event_id.as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.event_type.as_str().as_bytes());
        hasher.update(self.correlation_id.as_bytes());
        hasher.update(self.outcome.as_str().as_bytes());
        hasher.update(self.metadata.to_string().as_bytes());
        hasher.update(self.previous_hash.as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Verify event hash
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

/// Audit trail configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines file to append events to; memory only when unset
    pub log_path: Option<PathBuf>,

    /// Events retained in memory; the oldest are evicted first
    pub max_events: usize,

    pub enable_hash_chain: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            max_events: DEFAULT_MAX_EVENTS,
            enable_hash_chain: true,
        }
    }
}

/// Aggregate counters over the retained events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    pub total_events: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_outcome: BTreeMap<String, usize>,

    /// Events with a `failure` or `denied` outcome
    pub failures: usize,

    pub persistence_failures: u64,
    pub evicted_events: u64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

struct TrailState {
    events: VecDeque<AuditEvent>,

    /// Expected `previous_hash` of the oldest retained event
    anchor_hash: String,

    last_hash: String,
    file: Option<File>,
    persistence_failures: u64,
    evicted_events: u64,
}

/// Security audit trail
pub struct SecurityAuditTrail {
    config: AuditConfig,
    sanitizer: Arc<DataSanitizer>,
    state: Mutex<TrailState>,
}

impl SecurityAuditTrail {
    /// Create an audit trail, opening (and continuing the chain of) the
    /// configured log file. A log file that cannot be opened is counted as a
    /// persistence failure and the trail records in memory only.
    pub fn new(config: AuditConfig, sanitizer: Arc<DataSanitizer>) -> Self {
        let (file, last_hash, persistence_failures) = match &config.log_path {
            Some(path) => match open_log(path) {
                Ok((file, last_hash)) => {
                    debug!(path = %path.display(), "Audit log opened");
                    (Some(file), last_hash, 0)
                }
                Err(e) => {
                    error!(
                        path = %path.display(),
                        error = %e,
                        "Audit log unavailable, recording in memory only"
                    );
                    (None, String::new(), 1)
                }
            },
            None => (None, String::new(), 0),
        };

        Self {
            config,
            sanitizer,
            state: Mutex::new(TrailState {
                events: VecDeque::new(),
                anchor_hash: last_hash.clone(),
                last_hash,
                file,
                persistence_failures,
                evicted_events: 0,
            }),
        }
    }

    /// Memory-only trail with default retention
    pub fn in_memory(sanitizer: Arc<DataSanitizer>) -> Self {
        Self {
            config: AuditConfig::default(),
            sanitizer,
            state: Mutex::new(TrailState {
                events: VecDeque::new(),
                anchor_hash: String::new(),
                last_hash: String::new(),
                file: None,
                persistence_failures: 0,
                evicted_events: 0,
            }),
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Record an authentication-related event
    pub fn log_authentication_event(
        &self,
        event_type: AuditEventType,
        correlation_id: &str,
        outcome: AuditOutcome,
        metadata: Value,
    ) {
        self.log_event(event_type, correlation_id, outcome, metadata);
    }

    /// Record an encryption, decryption or key derivation event
    pub fn log_encryption_event(
        &self,
        event_type: AuditEventType,
        correlation_id: &str,
        outcome: AuditOutcome,
        metadata: Value,
    ) {
        self.log_event(event_type, correlation_id, outcome, metadata);
    }

    /// Sanitize `metadata`, append the event and return its id
    pub fn log_event(
        &self,
        event_type: AuditEventType,
        correlation_id: &str,
        outcome: AuditOutcome,
        metadata: Value,
    ) -> Uuid {
        let metadata = self.sanitizer.scrub(&metadata);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let previous_hash = if self.config.enable_hash_chain {
            state.last_hash.clone()
        } else {
            String::new()
        };
        let event = AuditEvent::new(
            event_type,
            correlation_id.to_string(),
            outcome,
            metadata,
            previous_hash,
        );

        if let Some(file) = state.file.as_mut() {
            if let Err(e) = append_line(file, &event) {
                state.persistence_failures += 1;
                error!(
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to persist audit event"
                );
            }
        }

        if self.config.enable_hash_chain {
            state.last_hash = event.hash.clone();
        }

        let event_id = event.event_id;
        state.events.push_back(event);
        while state.events.len() > self.config.max_events.max(1) {
            if let Some(evicted) = state.events.pop_front() {
                state.anchor_hash = evicted.hash;
                state.evicted_events += 1;
            }
        }

        if outcome != AuditOutcome::Success {
            warn!(
                event_type = event_type.as_str(),
                correlation_id,
                outcome = outcome.as_str(),
                "Security event recorded"
            );
        } else {
            debug!(
                event_type = event_type.as_str(),
                correlation_id, "Security event recorded"
            );
        }

        event_id
    }

    /// Retained events, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.state.lock().events.iter().cloned().collect()
    }

    pub fn events_for_correlation(&self, correlation_id: &str) -> Vec<AuditEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| event.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    pub fn events_of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Counters computed over the retained events
    pub fn get_audit_stats(&self) -> AuditStats {
        let state = self.state.lock();
        let mut by_type = BTreeMap::new();
        let mut by_outcome = BTreeMap::new();
        let mut failures = 0;

        for event in &state.events {
            *by_type.entry(event.event_type.as_str().to_string()).or_insert(0) += 1;
            *by_outcome.entry(event.outcome.as_str().to_string()).or_insert(0) += 1;
            if event.outcome != AuditOutcome::Success {
                failures += 1;
            }
        }

        AuditStats {
            total_events: state.events.len(),
            by_type,
            by_outcome,
            failures,
            persistence_failures: state.persistence_failures,
            evicted_events: state.evicted_events,
            first_event_at: state.events.front().map(|event| event.timestamp),
            last_event_at: state.events.back().map(|event| event.timestamp),
        }
    }

    /// Verify the hash chain over the retained events and, when persisting,
    /// over the log file
    pub fn verify_integrity(&self) -> Result<bool> {
        let state = self.state.lock();

        let mut previous_hash = state.anchor_hash.clone();
        for (i, event) in state.events.iter().enumerate() {
            if !event.verify_hash() {
                return Err(AuditError::IntegrityFailure(format!(
                    "Event hash mismatch at retained event {}",
                    i + 1
                )));
            }
            if self.config.enable_hash_chain && event.previous_hash != previous_hash {
                return Err(AuditError::IntegrityFailure(format!(
                    "Hash chain broken at retained event {}",
                    i + 1
                )));
            }
            previous_hash = event.hash.clone();
        }
        let persisting = state.file.is_some();
        drop(state);

        match &self.config.log_path {
            Some(path) if persisting => verify_file(path, self.config.enable_hash_chain),
            _ => Ok(true),
        }
    }
}

impl std::fmt::Debug for SecurityAuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityAuditTrail")
            .field("config", &self.config)
            .field("events", &self.state.lock().events.len())
            .finish()
    }
}

fn append_line(file: &mut File, event: &AuditEvent) -> Result<()> {
    let mut json =
        serde_json::to_string(event).map_err(|e| AuditError::Serialization(e.to_string()))?;
    json.push('\n');

    file.write_all(json.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Open `path` for appending and return the hash of its last readable event
fn open_log(path: &Path) -> Result<(File, String)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let last_hash = last_hash(path)?;

    // A torn final line must not swallow the next event
    if file.metadata()?.len() > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            file.write_all(b"\n")?;
        }
    }

    Ok((file, last_hash))
}

/// Hash of the last parsable event in the log; unreadable lines are skipped
fn last_hash(path: &Path) -> Result<String> {
    let reader = BufReader::new(File::open(path)?);
    let mut last_hash = String::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => last_hash = event.hash,
            Err(e) => warn!(
                path = %path.display(),
                line = i + 1,
                error = %e,
                "Skipping unreadable audit log line"
            ),
        }
    }

    Ok(last_hash)
}

fn verify_file(path: &Path, hash_chain: bool) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }

    let reader = BufReader::new(File::open(path)?);
    let mut previous_hash = String::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        // Torn writes are skipped; a corrupted event still breaks the chain
        let event: AuditEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = i + 1, error = %e, "Skipping unreadable audit log line");
                continue;
            }
        };

        if !event.verify_hash() {
            return Err(AuditError::IntegrityFailure(format!(
                "Event hash mismatch at line {}",
                i + 1
            )));
        }

        if hash_chain && event.previous_hash != previous_hash {
            return Err(AuditError::IntegrityFailure(format!(
                "Hash chain broken at line {}",
                i + 1
            )));
        }

        previous_hash = event.hash;
    }

    Ok(true)
}
