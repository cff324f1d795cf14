mod fallback;
mod session;
mod signature;

pub use fallback::{FailureKind, FallbackMessages};
pub use session::{decide_message, ConversationSession, Decision, SessionPolicy};
pub use signature::{sign_body, verify_signature, SignatureError};

use sha2::{Digest, Sha256};
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Event id for payloads that carry no message id.
/// Identical redeliveries hash to the same id.
pub fn stable_event_id(conversation_id: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conversation_id.as_bytes());
    hasher.update([0]);
    hasher.update(body);
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("evt_{short}")
}

/// Exponential delay before retry number `attempt` (0-based), capped at 30s.
pub fn backoff_delay(base: Duration, attempt: usize) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt.min(16) as u32).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
