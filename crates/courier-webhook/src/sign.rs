//! HMAC-SHA256 payload signing.
//!
//! Signatures are computed over the canonical JSON form of the payload
//! (keys sorted, no whitespace). Receivers must canonicalize the same way;
//! the delivered body bytes are exactly the signed bytes.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use courier_types::canonical_json;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Signature-SHA256";

/// Compute the `X-Signature-SHA256` header value for `payload` under `secret`.
pub fn sign_payload(secret: &str, payload: &Value) -> String {
    let canonical = canonical_json(payload);
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| HmacSha256::new_from_slice(b"-").expect("hmac accepts any key"));
    mac.update(canonical.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a received signature against `payload` and `secret`.
///
/// Accepts iff the payload, secret, and canonicalization all match the
/// sender's; comparison is constant-time via the MAC verify primitive.
pub fn verify_signature(secret: &str, payload: &Value, header_value: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let canonical = canonical_json(payload);
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(canonical.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let payload = json!({"task_id": "t1", "status": "completed"});
        let signature = sign_payload("s1", &payload);
        assert!(signature.starts_with("sha256="));
        assert!(verify_signature("s1", &payload, &signature));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let payload = json!({"task_id": "t1"});
        let signature = sign_payload("s1", &payload);
        let tampered = json!({"task_id": "t2"});
        assert!(!verify_signature("s1", &tampered, &signature));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = json!({"task_id": "t1"});
        let signature = sign_payload("s1", &payload);
        assert!(!verify_signature("s2", &payload, &signature));
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(sign_payload("secret", &a), sign_payload("secret", &b));
    }

    #[test]
    fn test_malformed_header_rejected() {
        let payload = json!({});
        assert!(!verify_signature("s1", &payload, "md5=abcd"));
        assert!(!verify_signature("s1", &payload, "sha256=nothex"));
    }
}
