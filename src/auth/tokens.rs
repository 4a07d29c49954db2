//! Session token storage
//!
//! Wraps the durable and session storage scopes. Every mutation goes
//! through [`TokenStore::write`], [`TokenStore::write_refreshed`] or
//! [`TokenStore::clear`], which update the tokens and the `isLoggedIn`
//! mirror together.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::models::User;
use crate::storage::KeyValueStore;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const ID_TOKEN_KEY: &str = "idToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_INFO_KEY: &str = "userInfo";
pub const LOGGED_IN_KEY: &str = "isLoggedIn";

/// The three tokens issued on sign-in.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokens {
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens")
            .field("access_token", &"<redacted>")
            .field("id_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Credential storage over a durable and a session scope.
pub struct TokenStore {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    // Serializes multi-scope writes so readers never see the flag and the
    // tokens disagree.
    write_lock: Mutex<()>,
}

impl TokenStore {
    /// Build the store and bring the session flag in line with the tokens.
    pub fn new(durable: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Result<Self> {
        let store = Self {
            durable,
            session,
            write_lock: Mutex::new(()),
        };
        store.reconcile()?;
        Ok(store)
    }

    fn reconcile(&self) -> Result<()> {
        if self.is_consistent() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let flag = self.has_tokens().then_some("true");
        tracing::debug!("Reconciling session flag with stored tokens");
        self.session
            .apply(&[(LOGGED_IN_KEY, flag)])
            .context("Failed to reconcile session flag")
    }

    fn has_tokens(&self) -> bool {
        self.durable.contains(ACCESS_TOKEN_KEY) && self.durable.contains(REFRESH_TOKEN_KEY)
    }

    /// Persist a complete token set.
    pub fn write(&self, tokens: &SessionTokens) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.durable
            .apply(&[
                (ACCESS_TOKEN_KEY, Some(tokens.access_token.as_str())),
                (ID_TOKEN_KEY, Some(tokens.id_token.as_str())),
                (REFRESH_TOKEN_KEY, Some(tokens.refresh_token.as_str())),
            ])
            .context("Failed to store session tokens")?;
        self.session
            .apply(&[(LOGGED_IN_KEY, Some("true"))])
            .context("Failed to set session flag")
    }

    /// Persist the result of a refresh made with `used_refresh_token`.
    ///
    /// The refresh token and ID token are only replaced when the provider
    /// issued new ones. Fails without writing if the stored refresh token
    /// changed or vanished while the refresh was in flight.
    pub fn write_refreshed(
        &self,
        used_refresh_token: &str,
        access_token: &str,
        id_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<SessionTokens> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let current = self
            .durable
            .get(REFRESH_TOKEN_KEY)
            .context("Session was cleared during refresh")?;
        if current != used_refresh_token {
            anyhow::bail!("Session changed during refresh");
        }

        let id_token = match id_token {
            Some(t) => t.to_string(),
            None => self.durable.get(ID_TOKEN_KEY).unwrap_or_default(),
        };
        let refresh_token = refresh_token.map(String::from).unwrap_or(current);

        self.durable
            .apply(&[
                (ACCESS_TOKEN_KEY, Some(access_token)),
                (ID_TOKEN_KEY, Some(id_token.as_str())),
                (REFRESH_TOKEN_KEY, Some(refresh_token.as_str())),
            ])
            .context("Failed to store refreshed tokens")?;
        self.session
            .apply(&[(LOGGED_IN_KEY, Some("true"))])
            .context("Failed to set session flag")?;

        Ok(SessionTokens {
            access_token: access_token.to_string(),
            id_token,
            refresh_token,
        })
    }

    pub fn read_access(&self) -> Option<String> {
        self.durable.get(ACCESS_TOKEN_KEY)
    }

    pub fn read_id(&self) -> Option<String> {
        self.durable.get(ID_TOKEN_KEY)
    }

    pub fn read_refresh(&self) -> Option<String> {
        self.durable.get(REFRESH_TOKEN_KEY)
    }

    /// Cached user projection, if one was stored and still parses.
    pub fn read_user(&self) -> Option<User> {
        let raw = self.durable.get(USER_INFO_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!("Ignoring unreadable cached user: {}", e);
                None
            }
        }
    }

    pub fn write_user(&self, user: &User) -> Result<()> {
        let raw = serde_json::to_string(user).context("Failed to serialize user")?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.durable
            .apply(&[(USER_INFO_KEY, Some(raw.as_str()))])
            .context("Failed to store user info")
    }

    /// Remove every credential key from both scopes.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        // Flag first: a failure past this point leaves "logged out" with
        // stale tokens, which reconcile() repairs on next open.
        self.session
            .apply(&[(LOGGED_IN_KEY, None)])
            .context("Failed to clear session flag")?;
        self.durable
            .apply(&[
                (ACCESS_TOKEN_KEY, None),
                (ID_TOKEN_KEY, None),
                (REFRESH_TOKEN_KEY, None),
                (USER_INFO_KEY, None),
            ])
            .context("Failed to clear session tokens")
    }

    /// Derived purely from token presence.
    pub fn is_logged_in(&self) -> bool {
        self.has_tokens()
    }

    /// True when the session flag agrees with token presence.
    pub fn is_consistent(&self) -> bool {
        self.session.contains(LOGGED_IN_KEY) == self.has_tokens()
    }

    /// True when no credential key remains in either scope.
    pub fn is_empty(&self) -> bool {
        [ACCESS_TOKEN_KEY, ID_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_INFO_KEY]
            .iter()
            .all(|k| !self.durable.contains(k))
            && !self.session.contains(LOGGED_IN_KEY)
    }
}
