//! Live session state and the proactive refresh scheduler
//!
//! A [`SessionContext`] owns the in-memory session state for the life of
//! the process, publishes it on a `watch` channel, keeps at most one refresh
//! timer armed, and navigates away when the session ends.

pub mod guard;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::{RefreshError, SessionManager, SessionValidity, SignInResult};
use crate::config::SessionSettings;
use crate::models::User;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    Authenticated,
    Unauthenticated,
}

/// Snapshot of the live session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub status: SessionStatus,
    pub is_loading: bool,
    pub user: Option<User>,
}

impl SessionState {
    fn initializing() -> Self {
        Self {
            status: SessionStatus::Initializing,
            is_loading: true,
            user: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }
}

/// Foreground state of the client surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Moves the client to another route.
pub trait Navigator: Send + Sync {
    fn navigate(&self, target: &str);
}

/// Navigator for a terminal client: there is nowhere to go, so the
/// target is logged.
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, target: &str) {
        tracing::info!("Navigate to {}", target);
    }
}

struct Inner {
    manager: Arc<SessionManager>,
    navigator: Arc<dyn Navigator>,
    state: watch::Sender<SessionState>,
    refresh_interval: Duration,
    sign_out_redirect: String,
    initialized: AtomicBool,
    /// Set once the current session has been signed out; re-armed on entry
    /// to `Authenticated`.
    signed_out: AtomicBool,
    /// Bumped on every entry to `Authenticated`.
    episode: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Settles a state left loading by an `initialize` or `sign_in` future
/// that was dropped before it finished.
struct LoadingGuard<'a> {
    inner: &'a Inner,
    restart_initialize: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let settled = self.inner.state.send_if_modified(|s| {
            if !s.is_loading {
                return false;
            }
            s.is_loading = false;
            if s.status == SessionStatus::Initializing {
                s.status = SessionStatus::Unauthenticated;
            }
            true
        });
        if settled && self.restart_initialize {
            tracing::debug!("Initialization cancelled, next call runs it again");
            self.inner.initialized.store(false, Ordering::SeqCst);
        }
    }
}

impl Inner {
    fn set_unauthenticated(&self) {
        self.state.send_replace(SessionState {
            status: SessionStatus::Unauthenticated,
            is_loading: false,
            user: None,
        });
    }

    fn set_authenticated(&self, user: Option<User>) {
        self.signed_out.store(false, Ordering::SeqCst);
        self.episode.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(SessionState {
            status: SessionStatus::Authenticated,
            is_loading: false,
            user,
        });
    }

    fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    /// User from the provider; falls back to the ID token (then the cache)
    /// when the provider is unreachable but the session survived.
    async fn load_user(&self) -> Option<User> {
        if let Some(user) = self.manager.get_current_user().await {
            return Some(user);
        }
        if !self.manager.store().is_logged_in() {
            return None;
        }
        tracing::debug!("Using ID token claims for the user");
        self.manager
            .user_from_id_token()
            .or_else(|| self.manager.cached_user())
    }

    /// Load the user and enter `Authenticated`, unless loading the user
    /// ended the session.
    async fn establish(inner: &Arc<Self>) {
        let user = inner.load_user().await;
        if inner.manager.store().is_logged_in() {
            inner.set_authenticated(user);
            Self::schedule_refresh(inner);
        } else {
            tracing::info!("Session ended while loading the user");
            inner.set_unauthenticated();
        }
    }

    /// Arm the refresh timer, replacing any armed one.
    fn schedule_refresh(inner: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let delay = inner.refresh_interval;

        let mut slot = inner.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Detach: from here on this task may re-arm or cancel freely
            // without aborting itself.
            inner
                .timer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            Self::on_refresh_timer(&inner).await;
        }));
        tracing::debug!("Refresh timer armed for {:?}", delay);
    }

    async fn on_refresh_timer(inner: &Arc<Self>) {
        tracing::debug!("Refresh timer fired");
        let episode = inner.episode.load(Ordering::SeqCst);
        let result = inner.manager.refresh_access_token().await;

        if inner.episode.load(Ordering::SeqCst) != episode {
            tracing::debug!("Signed in again during refresh, leaving the new session alone");
            return;
        }
        match result {
            Ok(_) if inner.is_authenticated() => Self::schedule_refresh(inner),
            Ok(_) => tracing::debug!("Session ended during refresh, timer not re-armed"),
            Err(RefreshError::Storage(e)) if inner.manager.store().is_logged_in() => {
                // Someone else stored a newer session; keep it.
                tracing::info!("Refreshed tokens not stored ({}), keeping current session", e);
                if inner.is_authenticated() {
                    Self::schedule_refresh(inner);
                }
            }
            Err(e) => {
                tracing::info!("Scheduled refresh failed ({}), signing out", e);
                inner.sign_out();
            }
        }
    }

    fn cancel_refresh(&self) {
        let previous = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = previous {
            handle.abort();
            tracing::debug!("Refresh timer cancelled");
        }
    }

    fn sign_out(&self) {
        if self.signed_out.swap(true, Ordering::SeqCst) {
            tracing::debug!("Sign-out already done for this session");
            return;
        }

        self.cancel_refresh();
        self.set_unauthenticated();
        if !self.manager.sign_out().success {
            tracing::warn!("Stored credentials could not be fully cleared");
        }
        tracing::info!("Signed out, redirecting to {}", self.sign_out_redirect);
        self.navigator.navigate(&self.sign_out_redirect);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let handle = self
            .timer
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Handle to the live session. Clones share the same session.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<Inner>,
}

impl SessionContext {
    pub fn new(
        manager: Arc<SessionManager>,
        navigator: Arc<dyn Navigator>,
        settings: &SessionSettings,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::initializing());
        Self {
            inner: Arc::new(Inner {
                manager,
                navigator,
                state,
                refresh_interval: settings.refresh_interval(),
                sign_out_redirect: settings.sign_out_redirect.clone(),
                initialized: AtomicBool::new(false),
                signed_out: AtomicBool::new(false),
                episode: AtomicU64::new(0),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.inner.manager
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn has_pending_refresh(&self) -> bool {
        self.inner
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Restore the stored session. Runs at most once per context, unless a
    /// run is cancelled part way; always leaves `is_loading` false.
    pub async fn initialize(&self) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            tracing::debug!("Session already initialized");
            return;
        }
        let _settle = LoadingGuard {
            inner: &self.inner,
            restart_initialize: true,
        };

        let manager = &self.inner.manager;
        let store = manager.store();
        if store.read_access().is_none() || store.read_refresh().is_none() {
            tracing::debug!("No complete stored session");
            manager.sign_out();
            self.inner.set_unauthenticated();
            return;
        }

        if manager.is_authenticated().await {
            Inner::establish(&self.inner).await;
        } else {
            tracing::info!("Stored session is no longer valid");
            manager.sign_out();
            self.inner.set_unauthenticated();
        }
    }

    /// Sign in. On success the session becomes `Authenticated` and the
    /// refresh timer is armed; challenges and failures are returned as-is.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignInResult> {
        self.inner.state.send_modify(|s| s.is_loading = true);
        // Failures, challenges and cancellation all settle here.
        let _settle = LoadingGuard {
            inner: &self.inner,
            restart_initialize: false,
        };

        let result = self.inner.manager.sign_in(email, password).await;
        if let Ok(SignInResult::Success(_)) = &result {
            self.inner.initialized.store(true, Ordering::SeqCst);
            Inner::establish(&self.inner).await;
        }
        result
    }

    /// End the session and navigate to the sign-out target. Repeated calls
    /// before the next sign-in do nothing.
    pub fn sign_out(&self) {
        self.inner.sign_out();
    }

    /// Re-check the session when the client comes back to the foreground.
    ///
    /// Only a session the provider rejected is signed out; an unreachable
    /// provider keeps the session for the next scheduled attempt.
    pub async fn on_visibility_change(&self, visibility: Visibility) {
        if visibility != Visibility::Visible || !self.inner.is_authenticated() {
            return;
        }

        match self.inner.manager.validate_session().await {
            SessionValidity::Valid => tracing::debug!("Session still valid"),
            SessionValidity::Unreachable => {
                tracing::info!("Could not re-validate session, keeping it");
            }
            SessionValidity::Invalid => {
                tracing::info!("Session invalidated elsewhere");
                self.inner.sign_out();
            }
        }
    }

    /// Cancel the refresh timer. Dropping the last handle does the same.
    pub fn shutdown(&self) {
        self.inner.cancel_refresh();
    }
}

/// Navigator that records every target.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNavigator {
    visits: Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingNavigator {
    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Navigator for RecordingNavigator {
    fn navigate(&self, target: &str) {
        self.visits.lock().unwrap().push(target.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::{
        manager_with, seed_tokens, token_expiring_in, Behavior, FakeProvider, EMAIL, PASSWORD,
    };
    use crate::auth::provider::ErrorCode;
    use crate::auth::TokenStore;
    use serde_json::json;

    const FIFTY_MINUTES: Duration = Duration::from_secs(50 * 60);

    fn context_with(
        provider: Arc<FakeProvider>,
    ) -> (SessionContext, Arc<TokenStore>, Arc<RecordingNavigator>) {
        let (manager, store) = manager_with(provider);
        let navigator = Arc::new(RecordingNavigator::default());
        let ctx = SessionContext::new(manager, navigator.clone(), &SessionSettings::default());
        (ctx, store, navigator)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_initialize_without_tokens() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, navigator) = context_with(provider.clone());
        assert_eq!(ctx.state().status, SessionStatus::Initializing);
        assert!(ctx.state().is_loading);

        ctx.initialize().await;
        let state = ctx.state();
        assert_eq!(state.status, SessionStatus::Unauthenticated);
        assert!(!state.is_loading);
        assert!(state.user.is_none());
        assert!(store.is_empty());
        assert!(!ctx.has_pending_refresh());
        assert!(navigator.visits().is_empty());
        assert_eq!(provider.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_tears_down_partial_session() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, _) = context_with(provider);
        seed_tokens(&store, token_expiring_in(3600, json!({})));
        // Only a stale user cache is left behind.
        store.clear().unwrap();
        store
            .write_user(&User::from_attributes(vec![("sub".into(), json!("u"))]).unwrap())
            .unwrap();

        ctx.initialize().await;
        assert_eq!(ctx.state().status, SessionStatus::Unauthenticated);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_restores_valid_session() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, _) = context_with(provider.clone());
        seed_tokens(&store, token_expiring_in(3600, json!({})));

        ctx.initialize().await;
        let state = ctx.state();
        assert!(state.is_authenticated());
        assert!(!state.is_loading);
        assert_eq!(state.user.unwrap().email, EMAIL);
        assert!(ctx.has_pending_refresh());
        assert_eq!(provider.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, _) = context_with(provider.clone());
        seed_tokens(&store, token_expiring_in(3600, json!({})));

        ctx.initialize().await;
        ctx.clone().initialize().await;
        assert_eq!(provider.user_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initialize_with_rejected_session() {
        let provider = Arc::new(FakeProvider::new());
        provider.set_refresh(Behavior::Fail(ErrorCode::NotAuthorized));
        let (ctx, store, navigator) = context_with(provider);
        seed_tokens(&store, token_expiring_in(10, json!({})));

        ctx.initialize().await;
        assert_eq!(ctx.state().status, SessionStatus::Unauthenticated);
        assert!(!ctx.state().is_loading);
        assert!(store.is_empty());
        assert!(!ctx.has_pending_refresh());
        // Settling on mount is silent.
        assert!(navigator.visits().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_with_unreachable_provider_settles() {
        let provider = Arc::new(FakeProvider::new());
        provider.set_refresh(Behavior::Fail(ErrorCode::Network));
        let (ctx, store, _) = context_with(provider);
        seed_tokens(&store, token_expiring_in(10, json!({})));

        ctx.initialize().await;
        assert_eq!(ctx.state().status, SessionStatus::Unauthenticated);
        assert!(!ctx.state().is_loading);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sign_in_failure_leaves_session_alone() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, _) = context_with(provider);
        ctx.initialize().await;

        let result = ctx.sign_in(EMAIL, "nope").await.unwrap();
        assert!(matches!(result, SignInResult::Failed { .. }));
        let state = ctx.state();
        assert_eq!(state.status, SessionStatus::Unauthenticated);
        assert!(!state.is_loading);
        assert!(!ctx.has_pending_refresh());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sign_in_challenge_is_returned() {
        let provider = Arc::new(FakeProvider::new());
        provider.set_sign_in(Behavior::Challenge("NEW_PASSWORD_REQUIRED".into()));
        let (ctx, _, _) = context_with(provider);

        let result = ctx.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert!(matches!(result, SignInResult::Challenge { ref name, .. } if name == "NEW_PASSWORD_REQUIRED"));
        assert!(!ctx.state().is_authenticated());
        assert!(!ctx.state().is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_refresh_then_rejection() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, navigator) = context_with(provider.clone());
        ctx.initialize().await;

        let result = ctx.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert!(matches!(result, SignInResult::Success(_)));
        let state = ctx.state();
        assert!(state.is_authenticated());
        assert_eq!(state.user.as_ref().map(|u| u.email.as_str()), Some(EMAIL));
        assert!(store.read_access().is_some());
        assert!(ctx.has_pending_refresh());
        assert_eq!(provider.refresh_count(), 0);

        // First tick: fresh tokens, timer re-armed.
        let before = store.read_access();
        tokio::time::sleep(FIFTY_MINUTES + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(provider.refresh_count(), 1);
        assert!(ctx.state().is_authenticated());
        assert!(ctx.has_pending_refresh());
        assert_ne!(store.read_access(), before);

        // Second tick: provider rejects, session ends.
        provider.set_refresh(Behavior::Fail(ErrorCode::NotAuthorized));
        tokio::time::sleep(FIFTY_MINUTES).await;
        settle().await;
        assert_eq!(provider.refresh_count(), 2);
        assert_eq!(ctx.state().status, SessionStatus::Unauthenticated);
        assert!(store.is_empty());
        assert!(store.is_consistent());
        assert!(!ctx.has_pending_refresh());
        assert_eq!(navigator.visits(), vec!["/login".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_scheduled_failure_signs_out() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, navigator) = context_with(provider.clone());
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();

        provider.set_refresh(Behavior::Fail(ErrorCode::Timeout));
        tokio::time::sleep(FIFTY_MINUTES + Duration::from_millis(10)).await;
        settle().await;
        assert!(!ctx.state().is_authenticated());
        assert!(store.is_empty());
        assert_eq!(navigator.visits().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_timer_outstanding() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, _) = context_with(provider.clone());
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();

        // Re-establishing re-arms: earlier timers must not also fire.
        tokio::time::sleep(Duration::from_secs(600)).await;
        store.clear().unwrap();
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();

        tokio::time::sleep(FIFTY_MINUTES + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_from_previous_session_leaves_new_one_alone() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, navigator) = context_with(provider.clone());
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();

        // Timer fires; the provider is slow to answer.
        provider.set_refresh_delay(Duration::from_secs(10));
        tokio::time::sleep(FIFTY_MINUTES + Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(provider.refresh_count(), 1);

        // Signing in again replaces the refresh token the old refresh used.
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();
        let fresh = store.read_refresh();
        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        assert!(ctx.state().is_authenticated());
        assert!(store.is_logged_in());
        assert_eq!(store.read_refresh(), fresh);
        assert!(navigator.visits().is_empty());
        assert!(ctx.has_pending_refresh());

        // The new session keeps its own schedule.
        provider.set_refresh_delay(Duration::ZERO);
        tokio::time::sleep(FIFTY_MINUTES).await;
        settle().await;
        assert_eq!(provider.refresh_count(), 2);
        assert!(ctx.state().is_authenticated());
        assert!(ctx.has_pending_refresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_initialize_does_not_stay_loading() {
        let provider = Arc::new(FakeProvider::new());
        provider.set_refresh_delay(Duration::from_secs(60));
        let (ctx, store, _) = context_with(provider.clone());
        seed_tokens(&store, token_expiring_in(10, json!({})));

        let attempt = tokio::time::timeout(Duration::from_secs(5), ctx.initialize()).await;
        assert!(attempt.is_err());
        let state = ctx.state();
        assert_eq!(state.status, SessionStatus::Unauthenticated);
        assert!(!state.is_loading);
        assert!(store.is_logged_in());

        // The next call restores the session instead of returning early.
        ctx.initialize().await;
        assert!(ctx.state().is_authenticated());
        assert!(!ctx.state().is_loading);
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_sign_in_does_not_stay_loading() {
        let provider = Arc::new(FakeProvider::new());
        provider.set_sign_in_delay(Duration::from_secs(60));
        let (ctx, store, _) = context_with(provider.clone());
        ctx.initialize().await;
        let mut rx = ctx.subscribe();

        let attempt = tokio::time::timeout(Duration::from_secs(5), ctx.sign_in(EMAIL, PASSWORD)).await;
        assert!(attempt.is_err());
        assert_eq!(provider.sign_in_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let state = rx.borrow_and_update().clone();
        assert_eq!(state.status, SessionStatus::Unauthenticated);
        assert!(!state.is_loading);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sign_in_carries_provider_role() {
        let provider = Arc::new(FakeProvider::new());
        provider.set_role(Some("admin"));
        let (ctx, _, _) = context_with(provider);

        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();
        let user = ctx.state().user.unwrap();
        assert!(user.has_role("admin"));
        assert!(user.has_role("reseller"));
    }

    #[tokio::test]
    async fn test_double_sign_out_redirects_once() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, navigator) = context_with(provider);
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();

        let other = ctx.clone();
        ctx.sign_out();
        other.sign_out();
        assert_eq!(navigator.visits(), vec!["/login".to_string()]);
        assert!(store.is_empty());
        assert!(!ctx.has_pending_refresh());

        // A new session may be signed out again.
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();
        ctx.sign_out();
        assert_eq!(navigator.visits().len(), 2);
    }

    #[tokio::test]
    async fn test_visibility_rechecks_session() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, navigator) = context_with(provider.clone());
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();

        // Still valid: nothing happens.
        ctx.on_visibility_change(Visibility::Visible).await;
        assert!(ctx.state().is_authenticated());

        // Another client signed out: tokens gone.
        store.clear().unwrap();
        ctx.on_visibility_change(Visibility::Hidden).await;
        assert!(ctx.state().is_authenticated());
        ctx.on_visibility_change(Visibility::Visible).await;
        assert!(!ctx.state().is_authenticated());
        assert_eq!(navigator.visits().len(), 1);
    }

    #[tokio::test]
    async fn test_visibility_keeps_session_when_provider_unreachable() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, store, navigator) = context_with(provider.clone());
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();

        // Expired access token, provider down.
        seed_tokens(&store, token_expiring_in(30, json!({})));
        provider.set_refresh(Behavior::Fail(ErrorCode::Network));
        ctx.on_visibility_change(Visibility::Visible).await;
        assert!(ctx.state().is_authenticated());
        assert!(navigator.visits().is_empty());

        provider.set_refresh(Behavior::Fail(ErrorCode::NotAuthorized));
        ctx.on_visibility_change(Visibility::Visible).await;
        assert!(!ctx.state().is_authenticated());
        assert_eq!(navigator.visits().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, _, _) = context_with(provider);
        let mut rx = ctx.subscribe();

        ctx.initialize().await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().status, SessionStatus::Unauthenticated);

        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert!(rx.borrow_and_update().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_timer() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, _, _) = context_with(provider.clone());
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert!(ctx.has_pending_refresh());

        drop(ctx);
        tokio::time::sleep(FIFTY_MINUTES * 2).await;
        settle().await;
        assert_eq!(provider.refresh_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_timer() {
        let provider = Arc::new(FakeProvider::new());
        let (ctx, _, _) = context_with(provider.clone());
        ctx.sign_in(EMAIL, PASSWORD).await.unwrap();

        ctx.shutdown();
        assert!(!ctx.has_pending_refresh());
        tokio::time::sleep(FIFTY_MINUTES * 2).await;
        settle().await;
        assert_eq!(provider.refresh_count(), 0);
        assert!(ctx.state().is_authenticated());
    }
}
