//! Identity provider boundary
//!
//! The session core consumes three provider operations. Every call returns a
//! tagged result instead of raising, so expected outcomes (challenges,
//! rejected credentials, throttling) are plain values.

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

use super::tokens::SessionTokens;

/// Provider error codes the session core distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    NotAuthorized,
    UserNotFound,
    UserNotConfirmed,
    TooManyRequests,
    InvalidParameter,
    CodeMismatch,
    CodeExpired,
    /// The call did not complete within the request timeout.
    Timeout,
    /// Transport failure before any provider verdict.
    Network,
    /// Any other provider code, kept verbatim.
    Other(String),
}

impl ErrorCode {
    /// Map a wire code to an `ErrorCode`.
    ///
    /// Accepts OAuth-style snake case codes as well as exception names
    /// (`NotAuthorizedException`).
    pub fn from_wire(code: &str) -> Self {
        let normalized: String = code
            .trim_end_matches("Exception")
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "notauthorized" | "invalidgrant" | "unauthorizedclient" | "invalidclient" => {
                Self::NotAuthorized
            }
            "usernotfound" => Self::UserNotFound,
            "usernotconfirmed" | "unconfirmeduser" => Self::UserNotConfirmed,
            "toomanyrequests" | "slowdown" | "toomanyfailedattempts" => Self::TooManyRequests,
            "invalidparameter" | "invalidrequest" => Self::InvalidParameter,
            "codemismatch" => Self::CodeMismatch,
            "expiredcode" | "codeexpired" => Self::CodeExpired,
            _ => Self::Other(code.to_string()),
        }
    }

    /// Localized message key shown to the user for this code.
    pub fn message_key(&self) -> &'static str {
        match self {
            Self::NotAuthorized => "auth.error.invalidCredentials",
            Self::UserNotFound => "auth.error.userNotFound",
            Self::UserNotConfirmed => "auth.error.userNotConfirmed",
            Self::TooManyRequests => "auth.error.tooManyRequests",
            Self::InvalidParameter => "auth.error.invalidParameter",
            Self::CodeMismatch => "auth.error.codeMismatch",
            Self::CodeExpired => "auth.error.codeExpired",
            Self::Timeout | Self::Network | Self::Other(_) => "auth.error.generic",
        }
    }

    /// Codes after which the session can only be recovered by signing in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotAuthorized | Self::UserNotFound)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAuthorized => f.write_str("not authorized"),
            Self::UserNotFound => f.write_str("user not found"),
            Self::UserNotConfirmed => f.write_str("user not confirmed"),
            Self::TooManyRequests => f.write_str("too many requests"),
            Self::InvalidParameter => f.write_str("invalid parameter"),
            Self::CodeMismatch => f.write_str("code mismatch"),
            Self::CodeExpired => f.write_str("code expired"),
            Self::Timeout => f.write_str("timeout"),
            Self::Network => f.write_str("network error"),
            Self::Other(code) => f.write_str(code),
        }
    }
}

/// English text for a message key, for terminal output.
pub fn message_text(key: &str) -> &'static str {
    match key {
        "auth.error.invalidCredentials" => "Incorrect email or password.",
        "auth.error.userNotFound" => "No account exists for this email.",
        "auth.error.userNotConfirmed" => "This account has not been confirmed yet.",
        "auth.error.tooManyRequests" => "Too many attempts. Please wait and try again.",
        "auth.error.invalidParameter" => "The request was invalid. Check your input.",
        "auth.error.codeMismatch" => "The verification code is incorrect.",
        "auth.error.codeExpired" => "The verification code has expired.",
        _ => "Authentication failed. Please try again.",
    }
}

/// Error returned by a provider call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Outcome of a password sign-in that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum SignInResponse {
    Tokens(SessionTokens),
    /// An additional step (second factor, password change) is required.
    Challenge {
        name: String,
        session: Option<String>,
    },
}

/// Tokens returned by a refresh grant.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Some providers do not reissue the ID token on refresh.
    pub id_token: Option<String>,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
}

/// The three provider operations the session core uses.
pub trait IdentityProvider: Send + Sync {
    fn password_sign_in<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, ProviderResult<SignInResponse>>;

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, ProviderResult<RefreshedTokens>>;

    /// Raw user attributes, names possibly namespaced.
    fn get_user<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Vec<(String, JsonValue)>>>;
}
