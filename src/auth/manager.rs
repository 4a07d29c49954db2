//! Session manager: every interaction with the identity provider
//!
//! The manager is the single source of truth for whether the stored
//! credential set is usable. Expected failures come back as values;
//! only storage failures on sign-in propagate as errors.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use super::codec;
use super::provider::{ErrorCode, IdentityProvider, ProviderError, SignInResponse};
use super::tokens::{SessionTokens, TokenStore};
use crate::models::User;

/// Outcome of a password sign-in.
#[derive(Debug, Clone, PartialEq)]
pub enum SignInResult {
    /// Tokens were issued and stored.
    Success(SessionTokens),
    /// The provider wants another step; nothing was stored.
    Challenge {
        name: String,
        session: Option<String>,
    },
    /// Credentials rejected or provider unavailable; nothing was stored.
    Failed {
        code: ErrorCode,
        message_key: &'static str,
        message: String,
    },
}

/// Why a refresh did not produce tokens.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RefreshError {
    #[error("no refresh token stored")]
    NoRefreshToken,
    /// The provider rejected the session; local credentials were cleared.
    #[error("session rejected: {0}")]
    Terminal(ProviderError),
    /// Worth retrying later; local credentials were left alone.
    #[error("refresh failed: {0}")]
    Transient(ProviderError),
    #[error("could not store refreshed tokens: {0}")]
    Storage(String),
}

impl RefreshError {
    /// True when the session cannot come back without a new sign-in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NoRefreshToken | Self::Terminal(_))
    }
}

pub type RefreshResult = std::result::Result<SessionTokens, RefreshError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignOutResult {
    pub success: bool,
}

/// Result of re-checking a session that was believed valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionValidity {
    Valid,
    /// Gone for good: no tokens, or the provider rejected the refresh.
    Invalid,
    /// Could not be confirmed right now; the session was kept.
    Unreachable,
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

pub struct SessionManager {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<TokenStore>,
    expiry_buffer_secs: i64,
    /// The refresh currently talking to the provider, if any.
    in_flight: Mutex<Option<SharedRefresh>>,
}

/// Clear local credentials, logging instead of failing.
fn clear_local(store: &TokenStore) -> SignOutResult {
    match store.clear() {
        Ok(()) => SignOutResult { success: true },
        Err(e) => {
            tracing::error!("Failed to clear stored credentials: {:#}", e);
            SignOutResult { success: false }
        }
    }
}

/// One provider refresh round trip. Never run concurrently; see
/// [`SessionManager::refresh_access_token`].
async fn refresh_once(provider: Arc<dyn IdentityProvider>, store: Arc<TokenStore>) -> RefreshResult {
    let refresh_token = match store.read_refresh() {
        Some(t) => t,
        None => {
            tracing::info!("No refresh token stored, cannot refresh");
            clear_local(&store);
            return Err(RefreshError::NoRefreshToken);
        }
    };

    tracing::info!("Refreshing access token...");

    match provider.refresh(&refresh_token).await {
        Ok(fresh) => {
            if fresh.refresh_token.is_some() {
                tracing::debug!("Provider rotated the refresh token");
            }
            let stored = store
                .write_refreshed(
                    &refresh_token,
                    &fresh.access_token,
                    fresh.id_token.as_deref(),
                    fresh.refresh_token.as_deref(),
                )
                .map_err(|e| RefreshError::Storage(format!("{:#}", e)))?;
            tracing::info!("Access token refreshed");
            Ok(stored)
        }
        Err(e) if e.code.is_terminal() => {
            tracing::warn!("Refresh rejected ({}), signing out locally", e);
            clear_local(&store);
            Err(RefreshError::Terminal(e))
        }
        Err(e) => {
            tracing::warn!("Refresh failed, session kept for retry: {}", e);
            Err(RefreshError::Transient(e))
        }
    }
}

impl SessionManager {
    pub fn new(provider: Arc<dyn IdentityProvider>, store: Arc<TokenStore>) -> Self {
        Self {
            provider,
            store,
            expiry_buffer_secs: codec::DEFAULT_EXPIRY_BUFFER_SECS,
            in_flight: Mutex::new(None),
        }
    }

    pub fn with_expiry_buffer(mut self, secs: i64) -> Self {
        self.expiry_buffer_secs = secs;
        self
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Password sign-in. Tokens are stored on success only.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignInResult> {
        tracing::debug!("Signing in {}", email);

        match self.provider.password_sign_in(email, password).await {
            Ok(SignInResponse::Tokens(tokens)) => {
                self.store.write(&tokens)?;
                tracing::info!("Signed in");
                Ok(SignInResult::Success(tokens))
            }
            Ok(SignInResponse::Challenge { name, session }) => {
                tracing::info!("Sign-in needs another step: {}", name);
                Ok(SignInResult::Challenge { name, session })
            }
            Err(e) => {
                tracing::info!("Sign-in failed: {}", e);
                Ok(SignInResult::Failed {
                    message_key: e.code.message_key(),
                    code: e.code,
                    message: e.message,
                })
            }
        }
    }

    /// Exchange the stored refresh token for new tokens.
    ///
    /// Concurrent callers share one provider call and all observe its
    /// outcome. The shared slot is emptied once the call settles, whatever
    /// the result.
    pub async fn refresh_access_token(&self) -> RefreshResult {
        let pending = {
            let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(pending) => {
                    tracing::debug!("Joining in-flight refresh");
                    pending.clone()
                }
                None => {
                    let fresh = refresh_once(self.provider.clone(), self.store.clone())
                        .boxed()
                        .shared();
                    *slot = Some(fresh.clone());
                    fresh
                }
            }
        };

        let result = pending.clone().await;

        let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
            *slot = None;
        }
        result
    }

    /// True while a provider refresh is outstanding.
    #[cfg(test)]
    pub fn refresh_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stored access token, refreshed first if it is about to expire.
    ///
    /// Every authenticated API call goes through here.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        let token = self.store.read_access()?;
        if !codec::is_expired(&token, self.expiry_buffer_secs) {
            return Some(token);
        }

        tracing::debug!("Access token expired or expiring soon");
        match self.refresh_access_token().await {
            Ok(tokens) => Some(tokens.access_token),
            Err(_) => None,
        }
    }

    /// Fetch and flatten the current user from the provider.
    pub async fn get_current_user(&self) -> Option<User> {
        let token = self.get_valid_access_token().await?;

        match self.provider.get_user(&token).await {
            Ok(attributes) => {
                let user = User::from_attributes(attributes);
                match &user {
                    Some(u) => {
                        if let Err(e) = self.store.write_user(u) {
                            tracing::warn!("Could not cache user info: {:#}", e);
                        }
                    }
                    None => tracing::warn!("User info has no subject"),
                }
                user
            }
            Err(e) if e.code.is_terminal() => {
                tracing::warn!("User lookup rejected ({}), signing out", e);
                self.sign_out();
                None
            }
            Err(e) => {
                tracing::warn!("User lookup failed: {}", e);
                None
            }
        }
    }

    /// User projection from the stored ID token, without a provider call.
    pub fn user_from_id_token(&self) -> Option<User> {
        let claims = codec::decode(&self.store.read_id()?)?;
        User::from_attributes(claims.into_map())
    }

    /// Last user projection stored by [`Self::get_current_user`].
    pub fn cached_user(&self) -> Option<User> {
        self.store.read_user()
    }

    /// May refresh as a side effect; not a cheap check.
    pub async fn is_authenticated(&self) -> bool {
        self.get_valid_access_token().await.is_some()
    }

    /// Like [`Self::is_authenticated`], but tells a dead session apart from
    /// a provider that could not be reached.
    pub async fn validate_session(&self) -> SessionValidity {
        let Some(token) = self.store.read_access() else {
            return SessionValidity::Invalid;
        };
        if !codec::is_expired(&token, self.expiry_buffer_secs) {
            return SessionValidity::Valid;
        }

        match self.refresh_access_token().await {
            Ok(_) => SessionValidity::Valid,
            Err(e) if e.is_terminal() => SessionValidity::Invalid,
            Err(_) => SessionValidity::Unreachable,
        }
    }

    /// Best-effort local sign-out. Never fails.
    pub fn sign_out(&self) -> SignOutResult {
        tracing::debug!("Clearing stored credentials");
        clear_local(&self.store)
    }
}
