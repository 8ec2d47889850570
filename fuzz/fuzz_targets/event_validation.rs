#![no_main]

//! Fuzz target for event validation.
//!
//! Source, idempotency key and payload all come straight from request
//! headers and bodies. Validation must never panic and must agree with
//! the standalone key parser.

use bytes::Bytes;
use hermes_core::{Event, IdempotencyKey, ValidationError};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let mut parts = text.splitn(3, '\n');
    let source = parts.next().unwrap_or_default();
    let key = parts.next().unwrap_or_default();
    let payload = Bytes::copy_from_slice(parts.next().unwrap_or_default().as_bytes());

    let event = Event::builder(source, key, payload.clone()).build();

    match event.validate() {
        Ok(parsed) => {
            assert!(!payload.is_empty());
            assert!(!source.trim().is_empty());
            assert_eq!(parsed.as_str(), key);
        },
        Err(ValidationError::EmptyPayload) => assert!(payload.is_empty()),
        Err(ValidationError::MissingSource) => assert!(source.trim().is_empty()),
        Err(_) => assert!(IdempotencyKey::parse(key).is_err()),
    }
});
