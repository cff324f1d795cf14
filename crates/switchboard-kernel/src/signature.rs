use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature is not valid base64")]
    Malformed,
    #[error("signature does not match request body")]
    Mismatch,
    #[error("webhook secret is empty")]
    EmptySecret,
}

/// Base64 HMAC-SHA256 of the raw request body keyed by the shared secret.
pub fn sign_body(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mac = keyed_mac(secret, body)?;
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Checks a provider signature header against the raw body.
///
/// Accepts the bare base64 value or a `sha256=` prefixed one. Comparison is
/// constant-time.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    header: Option<&str>,
) -> Result<(), SignatureError> {
    let header = header
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(SignatureError::Missing)?;
    let encoded = header.strip_prefix("sha256=").unwrap_or(header);
    let provided = STANDARD
        .decode(encoded)
        .map_err(|_| SignatureError::Malformed)?;

    keyed_mac(secret, body)?
        .verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}

fn keyed_mac(secret: &[u8], body: &[u8]) -> Result<HmacSha256, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::EmptySecret)?;
    mac.update(body);
    Ok(mac)
}
