#![no_main]

//! Fuzz target for inbound signature headers.
//!
//! Signature headers arrive from untrusted producers. Parsing and
//! verification must never panic, and a header the parser rejects must
//! never verify.

use hermes_core::signature;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let header = String::from_utf8_lossy(data);
    let parsed = signature::parse_signature(&header);

    for secret in ["", "secret", "a-much-longer-shared-secret-used-by-producers"] {
        let verified = signature::verify(data, &header, secret);
        if parsed.is_err() {
            assert!(verified.is_err());
        }
    }

    if let Some((payload, secret)) = split(data) {
        if let Ok(signed) = signature::sign(payload, secret) {
            assert!(signature::verify(payload, &signed, secret).is_ok());
        }
    }
});

/// Splits the input into a payload and a UTF-8 secret at the first zero
/// byte.
fn split(data: &[u8]) -> Option<(&[u8], &str)> {
    let at = data.iter().position(|b| *b == 0)?;
    let secret = std::str::from_utf8(&data[at + 1..]).ok()?;
    Some((&data[..at], secret))
}
