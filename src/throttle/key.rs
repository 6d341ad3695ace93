//! Throttle key construction.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::Result;

/// Build a throttle key of the form `{prefix}_{user_id}_{hash}`.
///
/// The hash covers the JSON serialisation of `payload`, so identical
/// payloads for the same user map to the same key and any change in the
/// payload yields a fresh one. Uses `DefaultHasher` (SipHash): stable for
/// the life of the process, which is as long as the cache lives.
///
/// ```rust
/// # use loopcal::request_key;
/// let key = request_key("persona", "user1", &["standup", "gym"]).unwrap();
/// assert!(key.starts_with("persona_user1_"));
/// ```
pub fn request_key<P: Serialize + ?Sized>(prefix: &str, user_id: &str, payload: &P) -> Result<String> {
    let body = serde_json::to_string(payload)?;
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    Ok(format!("{prefix}_{user_id}_{}", base36(hasher.finish())))
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_payload_same_key() {
        let payload = json!({"events": ["a", "b"]});
        let k1 = request_key("digest", "u1", &payload).unwrap();
        let k2 = request_key("digest", "u1", &payload).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn key_differs_on_payload() {
        let k1 = request_key("digest", "u1", &json!({"n": 1})).unwrap();
        let k2 = request_key("digest", "u1", &json!({"n": 2})).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn key_differs_on_user_and_prefix() {
        let payload = json!([1, 2, 3]);
        let base = request_key("persona", "u1", &payload).unwrap();
        assert_ne!(base, request_key("persona", "u2", &payload).unwrap());
        assert_ne!(base, request_key("digest", "u1", &payload).unwrap());
    }

    #[test]
    fn base36_encoding() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(u64::MAX), "3w5e11264sgsf");
    }
}
