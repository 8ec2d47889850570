//! HMAC-SHA256 payload signatures.
//!
//! Used both to verify signed inbound webhooks and to sign outbound HTTPS
//! deliveries. Accepted header formats:
//!
//! - `sha256=<hex>` (GitHub style, also what hermes sends)
//! - `v1=<hex>`
//! - `<hex>` (64 raw hex characters)

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature format hermes emits.
pub const SIGNATURE_PREFIX: &str = "sha256=";

const DIGEST_LEN: usize = 32;

/// Signature verification errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// No signature was supplied.
    #[error("signature header missing")]
    MissingSignature,

    /// The signature is not in a recognised format.
    #[error("invalid signature format: {0}")]
    InvalidFormat(String),

    /// The signature does not match the payload.
    #[error("signature verification failed")]
    VerificationFailed,

    /// The secret is unusable.
    #[error("invalid secret key")]
    InvalidSecret,
}

/// Signs a payload and returns the `sha256=<hex>` header value.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret is empty.
pub fn sign(payload: &[u8], secret: &str) -> Result<String, SignatureError> {
    let mac = keyed(payload, secret)?;
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Verifies a signature header against a payload.
///
/// The digest comparison is constant-time.
///
/// # Errors
///
/// Returns `MissingSignature` for an empty header, `InvalidFormat` when the
/// header cannot be parsed, `InvalidSecret` for an empty secret and
/// `VerificationFailed` when the digest does not match.
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> Result<(), SignatureError> {
    if signature.trim().is_empty() {
        return Err(SignatureError::MissingSignature);
    }

    let digest = parse_signature(signature)?;
    keyed(payload, secret)?.verify_slice(&digest).map_err(|_| SignatureError::VerificationFailed)
}

/// Decodes a signature header into raw digest bytes.
///
/// # Errors
///
/// Returns `SignatureError::InvalidFormat` when the header has an unknown
/// prefix, is not hex, or does not decode to a SHA-256 digest.
pub fn parse_signature(signature: &str) -> Result<Vec<u8>, SignatureError> {
    let signature = signature.trim();
    let hex_part = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .or_else(|| signature.strip_prefix("v1="))
        .unwrap_or(signature);

    if hex_part.len() != DIGEST_LEN * 2 {
        return Err(SignatureError::InvalidFormat(format!(
            "expected 'sha256=<hex>', 'v1=<hex>' or 64 hex characters, got {} characters",
            signature.len()
        )));
    }

    hex::decode(hex_part).map_err(|e| SignatureError::InvalidFormat(e.to_string()))
}

fn keyed(payload: &[u8], secret: &str) -> Result<HmacSha256, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(payload);
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_payload_verifies() {
        let signature = sign(b"{\"zen\":\"hi\"}", "topsecret").unwrap();

        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), 7 + 64);
        assert_eq!(verify(b"{\"zen\":\"hi\"}", &signature, "topsecret"), Ok(()));
    }

    #[test]
    fn known_vector_matches() {
        // RFC 4231 test case 2
        let signature = sign(b"what do ya want for nothing?", "Jefe").unwrap();
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn alternate_formats_verify() {
        let hex_digest = sign(b"payload", "s").unwrap().trim_start_matches("sha256=").to_string();

        assert_eq!(verify(b"payload", &format!("v1={hex_digest}"), "s"), Ok(()));
        assert_eq!(verify(b"payload", &hex_digest, "s"), Ok(()));
    }

    #[test]
    fn tampered_payload_fails() {
        let signature = sign(b"payload", "s").unwrap();
        assert_eq!(verify(b"payload!", &signature, "s"), Err(SignatureError::VerificationFailed));
        assert_eq!(verify(b"payload", &signature, "other"), Err(SignatureError::VerificationFailed));
    }

    #[test]
    fn malformed_headers_rejected() {
        assert_eq!(verify(b"p", "", "s"), Err(SignatureError::MissingSignature));
        assert!(matches!(verify(b"p", "sha256=abc", "s"), Err(SignatureError::InvalidFormat(_))));
        assert!(matches!(parse_signature(&"z".repeat(64)), Err(SignatureError::InvalidFormat(_))));
        assert!(matches!(parse_signature("md5=abcdef"), Err(SignatureError::InvalidFormat(_))));
    }

    #[test]
    fn empty_secret_rejected() {
        assert_eq!(sign(b"p", ""), Err(SignatureError::InvalidSecret));
    }
}
