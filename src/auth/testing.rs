//! Scriptable in-process identity provider for tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value as JsonValue};

use super::codec;
use super::manager::SessionManager;
use super::provider::{
    ErrorCode, IdentityProvider, ProviderError, ProviderResult, RefreshedTokens, SignInResponse,
};
use super::tokens::{SessionTokens, TokenStore};
use crate::storage::MemoryStore;

pub const EMAIL: &str = "trader@example.com";
pub const PASSWORD: &str = "correct horse";
pub const SUBJECT: &str = "7d3f0c1e-user";

/// What the next call of a given kind does.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(ErrorCode),
    Challenge(String),
}

/// Build an unsigned token for `subject` expiring `expires_in` seconds from now.
pub fn token_expiring_in(expires_in: i64, extra: JsonValue) -> String {
    let mut claims = json!({
        "sub": SUBJECT,
        "exp": chrono::Utc::now().timestamp() + expires_in,
    });
    if let (Some(base), JsonValue::Object(extra)) = (claims.as_object_mut(), extra) {
        base.extend(extra);
    }
    match claims {
        JsonValue::Object(map) => codec::encode_unsigned(&map),
        _ => unreachable!(),
    }
}

pub struct FakeProvider {
    sign_in: Mutex<Behavior>,
    refresh: Mutex<Behavior>,
    user: Mutex<Behavior>,
    sign_in_delay: Mutex<Duration>,
    refresh_delay: Mutex<Duration>,
    rotate_refresh: Mutex<bool>,
    role: Mutex<Option<String>>,
    lifetime_secs: i64,
    serial: AtomicUsize,
    pub sign_in_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub user_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            sign_in: Mutex::new(Behavior::Succeed),
            refresh: Mutex::new(Behavior::Succeed),
            user: Mutex::new(Behavior::Succeed),
            sign_in_delay: Mutex::new(Duration::ZERO),
            refresh_delay: Mutex::new(Duration::ZERO),
            rotate_refresh: Mutex::new(false),
            role: Mutex::new(None),
            lifetime_secs: 3600,
            serial: AtomicUsize::new(0),
            sign_in_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            user_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_sign_in(&self, behavior: Behavior) {
        *self.sign_in.lock().unwrap() = behavior;
    }

    pub fn set_refresh(&self, behavior: Behavior) {
        *self.refresh.lock().unwrap() = behavior;
    }

    pub fn set_user(&self, behavior: Behavior) {
        *self.user.lock().unwrap() = behavior;
    }

    pub fn set_sign_in_delay(&self, delay: Duration) {
        *self.sign_in_delay.lock().unwrap() = delay;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn set_rotate_refresh(&self, rotate: bool) {
        *self.rotate_refresh.lock().unwrap() = rotate;
    }

    pub fn set_role(&self, role: Option<&str>) {
        *self.role.lock().unwrap() = role.map(String::from);
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn next_serial(&self) -> usize {
        self.serial.fetch_add(1, Ordering::SeqCst)
    }

    fn mint(&self, kind: &str) -> String {
        let mut extra = json!({
            "token_use": kind,
            "jti": self.next_serial(),
            "email": EMAIL,
            "email_verified": true,
        });
        if let Some(role) = self.role.lock().unwrap().clone() {
            extra["custom:role"] = JsonValue::String(role);
        }
        token_expiring_in(self.lifetime_secs, extra)
    }

    fn fail(code: &ErrorCode) -> ProviderError {
        ProviderError::new(code.clone(), format!("scripted failure: {}", code))
    }
}

impl IdentityProvider for FakeProvider {
    fn password_sign_in<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, ProviderResult<SignInResponse>> {
        async move {
            self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.sign_in_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let behavior = self.sign_in.lock().unwrap().clone();
            match behavior {
                Behavior::Succeed if username == EMAIL && password == PASSWORD => {
                    Ok(SignInResponse::Tokens(SessionTokens {
                        access_token: self.mint("access"),
                        id_token: self.mint("id"),
                        refresh_token: format!("refresh-{}", self.next_serial()),
                    }))
                }
                Behavior::Succeed => Err(Self::fail(&ErrorCode::NotAuthorized)),
                Behavior::Challenge(name) => Ok(SignInResponse::Challenge {
                    name,
                    session: Some("challenge-session".into()),
                }),
                Behavior::Fail(code) => Err(Self::fail(&code)),
            }
        }
        .boxed()
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, ProviderResult<RefreshedTokens>> {
        async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.refresh_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let behavior = self.refresh.lock().unwrap().clone();
            match behavior {
                Behavior::Succeed => {
                    let rotate = *self.rotate_refresh.lock().unwrap();
                    Ok(RefreshedTokens {
                        access_token: self.mint("access"),
                        id_token: Some(self.mint("id")),
                        refresh_token: rotate
                            .then(|| format!("{}-r{}", refresh_token, self.next_serial())),
                    })
                }
                Behavior::Challenge(name) => Err(Self::fail(&ErrorCode::Other(name))),
                Behavior::Fail(code) => Err(Self::fail(&code)),
            }
        }
        .boxed()
    }

    fn get_user<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Vec<(String, JsonValue)>>> {
        async move {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self.user.lock().unwrap().clone();
            match behavior {
                Behavior::Succeed => {
                    let claims = codec::decode(access_token)
                        .ok_or_else(|| Self::fail(&ErrorCode::NotAuthorized))?;
                    let mut attrs: Vec<(String, JsonValue)> = vec![
                        ("sub".into(), json!(claims.subject().unwrap_or_default())),
                        ("email".into(), json!(EMAIL)),
                        ("email_verified".into(), json!("true")),
                        ("custom:apiKey".into(), json!("ea-key-0001")),
                    ];
                    if let Some(role) = claims.get("custom:role") {
                        attrs.push(("custom:role".into(), role.clone()));
                    }
                    Ok(attrs)
                }
                Behavior::Challenge(name) => Err(Self::fail(&ErrorCode::Other(name))),
                Behavior::Fail(code) => Err(Self::fail(&code)),
            }
        }
        .boxed()
    }
}

/// Manager over fresh in-memory stores.
pub fn manager_with(provider: Arc<FakeProvider>) -> (Arc<SessionManager>, Arc<TokenStore>) {
    let store = Arc::new(
        TokenStore::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
            .expect("memory stores never fail"),
    );
    let manager = Arc::new(SessionManager::new(provider, store.clone()));
    (manager, store)
}

/// Store a token set directly, bypassing sign-in.
pub fn seed_tokens(store: &TokenStore, access_token: String) {
    store
        .write(&SessionTokens {
            access_token,
            id_token: token_expiring_in(3600, json!({"email": EMAIL})),
            refresh_token: "refresh-seeded".into(),
        })
        .expect("memory stores never fail");
}
