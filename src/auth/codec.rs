//! Unverified decoding of compact signed tokens
//!
//! Only the payload segment is read, to learn the expiry and the identity
//! claims. Signatures are checked by the provider, never here.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value as JsonValue};

/// Tokens are treated as expired this many seconds before `exp`.
pub const DEFAULT_EXPIRY_BUFFER_SECS: i64 = 300;

/// Decoded token payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    inner: Map<String, JsonValue>,
}

impl Claims {
    pub fn new(inner: Map<String, JsonValue>) -> Self {
        Self { inner }
    }

    /// Expiry as unix seconds, if present and numeric.
    pub fn expiry(&self) -> Option<i64> {
        match self.inner.get("exp")? {
            JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn subject(&self) -> Option<&str> {
        self.inner.get("sub").and_then(|v| v.as_str())
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.inner.get(key)
    }

    pub fn into_map(self) -> Map<String, JsonValue> {
        self.inner
    }
}

/// Decode the payload of `token`. Returns `None` on any malformed input.
pub fn decode(token: &str) -> Option<Claims> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    if payload.is_empty() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    match serde_json::from_slice::<JsonValue>(&bytes).ok()? {
        JsonValue::Object(map) => Some(Claims::new(map)),
        _ => None,
    }
}

/// Build an unsigned `header.payload.` token carrying `claims`.
#[cfg(test)]
pub fn encode_unsigned(claims: &Map<String, JsonValue>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    // Serializing a map of JSON values cannot fail.
    let payload = URL_SAFE_NO_PAD.encode(JsonValue::Object(claims.clone()).to_string());
    format!("{}.{}.", header, payload)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Expiry check against the wall clock.
pub fn is_expired(token: &str, buffer_secs: i64) -> bool {
    is_expired_at(token, buffer_secs, now())
}

/// Expired when undecodable, missing `exp`, or `exp <= now + buffer`.
pub fn is_expired_at(token: &str, buffer_secs: i64, now: i64) -> bool {
    match decode(token).and_then(|c| c.expiry()) {
        Some(exp) => exp <= now + buffer_secs,
        None => true,
    }
}
