//! Property-based tests for security invariants
//!
//! These tests use proptest to verify:
//! - Round trip: decrypt(encrypt(m, k, ad), k, ad) == m
//! - Tamper detection: any single-byte change to ciphertext, IV or tag fails
//! - Context binding: a different associated data value fails
//! - Sanitizer idempotency: re-sanitizing detects nothing new

use flow_security::encryption::{EncryptionError, KEY_LEN};
use flow_security::{DataSanitizer, EncryptionConfig, EncryptionKey, EncryptionService};
use proptest::prelude::*;
use proptest::sample::Index;
use regex::Regex;
use serde_json::{json, Map, Value};

const CONTEXT: &[u8] = b"flow.access_token";

fn service() -> EncryptionService {
    EncryptionService::new(&EncryptionConfig {
        kdf_memory_kib: 1024,
        kdf_iterations: 1,
        kdf_parallelism: 1,
    })
    .unwrap()
}

/// Strategy for generating raw keys
fn key_strategy() -> impl Strategy<Value = EncryptionKey> {
    any::<[u8; KEY_LEN]>().prop_map(EncryptionKey::from_bytes)
}

/// Strategy for generating optional associated data
fn associated_data_strategy() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop::option::of(prop::collection::vec(any::<u8>(), 0..64))
}

/// Strategy for generating free-text fragments, sensitive or not
fn fragment_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z]{1,10}",
        "[a-z]{3,8}\\.[a-z]{3,8}@[a-z]{3,8}\\.(com|org|io)",
        "[0-9]{3}-[0-9]{2}-[0-9]{4}",
        "4[0-9]{3} [0-9]{4} [0-9]{4} [0-9]{4}",
        (0u8..=255, 0u8..=255, 0u8..=255, 0u8..=255)
            .prop_map(|(a, b, c, d)| format!("{a}.{b}.{c}.{d}")),
        "Bearer [A-Za-z0-9]{16,32}",
        "postgres://[a-z]{3,8}:[a-z0-9]{6,12}@[a-z]{3,8}:5432/[a-z]{3,8}",
        "password=[A-Za-z0-9]{6,12}",
    ]
}

/// Strategy for generating sentences made of fragments
fn text_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(fragment_strategy(), 1..8).prop_map(|fragments| fragments.join(" "))
}

/// Strategy for generating field names, some of them denylisted
fn key_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("clientSecret".to_string()),
        Just("refresh_token".to_string()),
        Just("note".to_string()),
        Just("message".to_string()),
        "[a-z]{3,8}",
    ]
}

/// Strategy for generating nested documents
fn document_strategy() -> impl Strategy<Value = Value> {
    (
        prop::collection::vec((key_name_strategy(), text_strategy()), 1..6),
        prop::collection::vec(text_strategy(), 0..4),
    )
        .prop_map(|(fields, items)| {
            let inner: Map<String, Value> = fields
                .into_iter()
                .map(|(key, text)| (key, Value::String(text)))
                .collect();
            json!({
                "outer": { "inner": inner },
                "items": items,
            })
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: decrypt(encrypt(m)) == m under the same key and associated data
    #[test]
    fn prop_round_trip(
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
        key in key_strategy(),
        associated_data in associated_data_strategy(),
    ) {
        let service = service();
        let ad = associated_data.as_deref();

        let payload = service.encrypt(&plaintext, &key, ad).unwrap();
        let decrypted = service
            .decrypt(&payload.ciphertext, &payload.iv, &key, &payload.auth_tag, ad)
            .unwrap();

        prop_assert_eq!(decrypted, plaintext);
    }

    /// Property: any single-byte mutation of ciphertext, IV or tag is rejected
    #[test]
    fn prop_single_byte_tamper_rejected(
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
        key in key_strategy(),
        target in 0usize..3,
        index in any::<Index>(),
        flip in 1u8..=255,
    ) {
        let service = service();
        let mut payload = service.encrypt(&plaintext, &key, Some(CONTEXT)).unwrap();

        let field = match target {
            0 => &mut payload.ciphertext,
            1 => &mut payload.iv,
            _ => &mut payload.auth_tag,
        };
        let position = index.index(field.len());
        field[position] ^= flip;

        let result = service.open(&payload, &key, Some(CONTEXT));
        prop_assert!(matches!(result, Err(EncryptionError::Decryption)));
    }

    /// Property: a payload cannot be opened under a different context
    #[test]
    fn prop_context_is_bound(
        plaintext in "[ -~]{1,64}",
        key in key_strategy(),
        context in "[a-z.]{1,24}",
        other in "[a-z.]{1,24}",
    ) {
        prop_assume!(context != other);
        let service = service();

        let payload = service.seal_str(&plaintext, &key, &context).unwrap();
        prop_assert_eq!(service.open_str(&payload, &key, &context).unwrap(), plaintext);
        prop_assert!(matches!(
            service.open_str(&payload, &key, &other),
            Err(EncryptionError::Decryption)
        ));
    }

    /// Property: sanitizing twice detects nothing the second time
    #[test]
    fn prop_sanitize_idempotent(document in document_strategy()) {
        let sanitizer = DataSanitizer::default();

        let first = sanitizer.sanitize(&document);
        let second = sanitizer.sanitize(&first.sanitized);

        prop_assert!(second.detected_patterns.is_empty(), "{:?}", second.detected_patterns);
        prop_assert!(second.sanitized_fields.is_empty());
        prop_assert_eq!(second.sanitized, first.sanitized);
    }

    /// Property: no email-shaped or denylisted value survives
    #[test]
    fn prop_sanitized_output_has_no_secrets(document in document_strategy()) {
        let email = Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap();
        let result = DataSanitizer::default().sanitize(&document);

        let rendered = result.sanitized.to_string();
        prop_assert!(!email.is_match(&rendered), "{}", rendered);
        prop_assert!(!rendered.contains("postgres://"));
        prop_assert!(!rendered.contains("password="));

        if let Some(inner) = result.sanitized["outer"]["inner"].as_object() {
            for key in ["clientSecret", "refresh_token"] {
                if let Some(value) = inner.get(key) {
                    prop_assert_eq!(value, &json!("[REDACTED]"));
                }
            }
        }
    }
}
