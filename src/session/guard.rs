//! Route protection
//!
//! Maps the session state to what a route may show, and sends
//! unauthenticated visitors to the login page with their destination kept
//! in `returnUrl`.

use std::sync::Arc;

use crate::config::RouteSettings;

use super::{Navigator, SessionState};

const RETURN_URL_PARAM: &str = "returnUrl";

/// Who may see a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAccess {
    Public,
    Protected,
    Admin,
}

/// What a guarded route renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardView {
    Loading,
    /// Unauthenticated; a login redirect has been issued.
    Fallback,
    Children,
    AccessDenied,
}

/// Static path classification.
#[derive(Debug, Clone)]
pub struct RouteTable {
    login_path: String,
    public: Vec<String>,
    admin: Vec<String>,
    admin_role: String,
}

/// `path` is `prefix` or lies beneath it.
fn under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path == "/";
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Drop any query string or fragment.
fn path_only(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}

impl RouteTable {
    pub fn from_settings(settings: &RouteSettings) -> Self {
        Self {
            login_path: settings.login_path.clone(),
            public: settings.public.clone(),
            admin: settings.admin.clone(),
            admin_role: settings.admin_role.clone(),
        }
    }

    /// Unknown paths are protected.
    pub fn classify(&self, path: &str) -> RouteAccess {
        let path = path_only(path);
        if self.public.iter().any(|p| under(path, p)) {
            RouteAccess::Public
        } else if self.admin.iter().any(|p| under(path, p)) {
            RouteAccess::Admin
        } else {
            RouteAccess::Protected
        }
    }

    pub fn required_role(&self, path: &str) -> Option<&str> {
        match self.classify(path) {
            RouteAccess::Admin => Some(self.admin_role.as_str()),
            _ => None,
        }
    }

    /// `<login>?returnUrl=<path>`, form-urlencoded.
    pub fn login_redirect(&self, path: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(path.as_bytes()).collect();
        format!("{}?{}={}", self.login_path, RETURN_URL_PARAM, encoded)
    }
}

/// Where to go after sign-in, from the login page's query string.
///
/// Only same-site absolute paths are honoured; anything else is `/`.
pub fn return_target(query: &str) -> String {
    let query = query.strip_prefix('?').unwrap_or(query);
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == RETURN_URL_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|target| target.starts_with('/') && !target.starts_with("//"))
        .unwrap_or_else(|| "/".to_string())
}

/// Guard for the routes of one client.
pub struct RouteGuard {
    table: RouteTable,
    navigator: Arc<dyn Navigator>,
    required_role: Option<String>,
    redirect_issued: bool,
}

impl RouteGuard {
    pub fn new(table: RouteTable, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            table,
            navigator,
            required_role: None,
            redirect_issued: false,
        }
    }

    /// Require `role` on every protected route, not only admin ones.
    pub fn with_required_role(mut self, role: impl Into<String>) -> Self {
        self.required_role = Some(role.into());
        self
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Decide what `path` shows for `state`.
    ///
    /// Repeated renders while unauthenticated issue one redirect; the next
    /// one is only possible after the session has been authenticated again.
    pub fn render(&mut self, state: &SessionState, path: &str) -> GuardView {
        let access = self.table.classify(path);
        if access == RouteAccess::Public {
            return GuardView::Children;
        }
        if state.is_loading {
            return GuardView::Loading;
        }

        if !state.is_authenticated() {
            if !self.redirect_issued {
                self.redirect_issued = true;
                let target = self.table.login_redirect(path);
                tracing::debug!("Redirecting to {}", target);
                self.navigator.navigate(&target);
            }
            return GuardView::Fallback;
        }
        self.redirect_issued = false;

        let role = self
            .required_role
            .as_deref()
            .or_else(|| self.table.required_role(path));
        match role {
            Some(role) if !state.user.as_ref().is_some_and(|u| u.has_role(role)) => {
                tracing::debug!("{} needs role {}", path, role);
                GuardView::AccessDenied
            }
            _ => GuardView::Children,
        }
    }
}
