//! Authentication for the license dashboard
//!
//! Password sign-in against the OAuth2 identity provider, token storage,
//! and single-flight refresh of expiring access tokens.

pub mod codec;
pub mod manager;
pub mod oauth;
pub mod provider;
pub mod tokens;

#[cfg(test)]
pub mod testing;

pub use manager::{RefreshError, SessionManager, SessionValidity, SignInResult};
pub use oauth::OAuthProvider;
pub use provider::message_text;
pub use tokens::TokenStore;
