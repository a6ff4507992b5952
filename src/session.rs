use serde_json::Value;
use sha2::{Digest, Sha256};

/// Derives an opaque session-affinity key from the conversation. The hash
/// covers the first user message and the system prompt, so follow-up turns
/// of one conversation keep landing on the same key while unrelated
/// conversations diverge.
pub fn session_hash(body: &Value) -> Option<String> {
    let mut hasher = Sha256::new();

    if let Some(system) = body.get("system") {
        hasher.update(system.to_string().as_bytes());
    }

    let first_user = body
        .get("messages")
        .and_then(|m| m.as_array())
        .and_then(|messages| {
            messages
                .iter()
                .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
        })?;
    hasher.update(first_user.to_string().as_bytes());

    Some(hex::encode(&hasher.finalize()[..16]))
}
