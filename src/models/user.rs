//! User projection lifted from provider attributes or ID token claims

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Namespace prefix the provider puts on custom attributes.
const CUSTOM_PREFIX: &str = "custom:";

/// Role that passes every role check.
pub const ADMIN_ROLE: &str = "admin";

/// Signed-in user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Stable unique id (`sub`)
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
    pub api_key: Option<String>,
    /// Remaining attributes, prefix already stripped
    #[serde(default)]
    pub claims: Map<String, JsonValue>,
}

fn strip_namespace(name: &str) -> &str {
    name.strip_prefix(CUSTOM_PREFIX).unwrap_or(name)
}

fn as_bool(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn as_string(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

impl User {
    /// Flatten a provider attribute set into a `User`.
    ///
    /// Returns `None` when there is no subject; a user is never fabricated.
    pub fn from_attributes<I>(attributes: I) -> Option<Self>
    where
        I: IntoIterator<Item = (String, JsonValue)>,
    {
        let mut flat: Map<String, JsonValue> = attributes
            .into_iter()
            .map(|(name, value)| (strip_namespace(&name).to_string(), value))
            .collect();

        let subject = flat.remove("sub").and_then(as_string)?;
        if subject.is_empty() {
            return None;
        }
        let email = flat.remove("email").and_then(as_string).unwrap_or_default();
        let email_verified = flat
            .remove("email_verified")
            .map(|v| as_bool(&v))
            .unwrap_or(false);
        let api_key = flat
            .remove("apiKey")
            .or_else(|| flat.remove("api_key"))
            .and_then(as_string);

        Some(Self {
            subject,
            email,
            email_verified,
            api_key,
            claims: flat,
        })
    }

    /// Role claim, if any.
    pub fn role(&self) -> Option<&str> {
        self.claims.get("role").and_then(|v| v.as_str())
    }

    /// True if the user holds `role` or the admin override.
    pub fn has_role(&self, role: &str) -> bool {
        matches!(self.role(), Some(r) if r == role || r == ADMIN_ROLE)
    }
}
