//! CLI command handlers

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::api::ApiClient;
use crate::auth::{codec, message_text, OAuthProvider, SessionManager, SignInResult, TokenStore};
use crate::config::Settings;
use crate::session::guard::{return_target, RouteGuard, RouteTable};
use crate::session::{LogNavigator, SessionContext};
use crate::storage::{FileStore, MemoryStore};

/// Environment variable read instead of prompting for the password.
const PASSWORD_ENV: &str = "EA_LICENSE_PASSWORD";

/// Loaded settings plus the live session built from them.
pub struct App {
    pub settings: Settings,
    pub session: SessionContext,
}

impl App {
    /// Load settings from `settings_path` (or the default location) and open
    /// the stored session.
    pub fn open(settings_path: Option<&Path>) -> Result<Self> {
        let settings = match settings_path {
            Some(path) => Settings::load_from(path)?,
            None => Settings::load()?,
        };

        let credentials = FileStore::open(Settings::credentials_path()?)?;
        tracing::debug!("Credentials at {}", credentials.path().display());
        let store = Arc::new(TokenStore::new(
            Arc::new(credentials),
            Arc::new(MemoryStore::new()),
        )?);
        let provider = OAuthProvider::new(&settings.provider, settings.session.request_timeout())
            .context("Invalid identity provider settings")?;
        let manager = Arc::new(
            SessionManager::new(Arc::new(provider), store)
                .with_expiry_buffer(settings.session.expiry_buffer_secs),
        );
        let session = SessionContext::new(manager, Arc::new(LogNavigator), &settings.session);

        Ok(Self { settings, session })
    }

    fn guard(&self) -> RouteGuard {
        RouteGuard::new(
            RouteTable::from_settings(&self.settings.routes),
            Arc::new(LogNavigator),
        )
    }
}

/// Write a default settings file.
pub fn init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(p) => p,
        None => Settings::settings_path()?,
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Settings::default().save_to(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_string())
}

pub async fn login(app: &App, email: Option<String>, return_url: Option<String>) -> Result<()> {
    let email = match email {
        Some(e) => e,
        None => prompt("Email")?,
    };
    let password = match std::env::var(PASSWORD_ENV) {
        Ok(p) => p,
        Err(_) => prompt("Password")?,
    };

    match app.session.sign_in(&email, &password).await? {
        SignInResult::Success(_) => {
            let state = app.session.state();
            let who = state.user.map(|u| u.email).unwrap_or(email);
            println!("Signed in as {}", who);
            let query = return_url
                .map(|u| format!("returnUrl={}", u))
                .unwrap_or_default();
            println!("Continue to {}", return_target(&query));
            Ok(())
        }
        SignInResult::Challenge { name, .. } => {
            bail!(
                "The identity provider requires another step ({}); complete it in the web dashboard",
                name
            )
        }
        SignInResult::Failed { message_key, message, .. } => {
            tracing::debug!("Provider said: {}", message);
            bail!("{}", message_text(message_key))
        }
    }
}

pub fn logout(app: &App) -> Result<()> {
    app.session.sign_out();
    if !app.session.manager().store().is_empty() {
        bail!("Some stored credentials could not be removed");
    }
    println!("Logged out");
    Ok(())
}

pub async fn status(app: &App) -> Result<()> {
    let store = app.session.manager().store();

    match store.read_access() {
        Some(token) => {
            let expiry = codec::decode(&token).and_then(|c| c.expiry());
            let buffer = app.settings.session.expiry_buffer_secs;
            if codec::is_expired(&token, buffer) {
                println!("Access token:  expired");
            } else {
                println!("Access token:  valid");
            }
            let expires_at =
                expiry.and_then(|e| chrono::DateTime::<chrono::Utc>::from_timestamp(e, 0));
            if let Some(exp) = expires_at {
                println!("  expires_at:  {}", exp.to_rfc3339());
            }
        }
        None => println!("Access token:  none"),
    }
    match store.read_refresh() {
        Some(_) => println!("Refresh token: present"),
        None => println!("Refresh token: none"),
    }
    if !store.is_consistent() {
        println!("Warning: session flag disagrees with stored tokens");
    }

    app.session.initialize().await;
    let state = app.session.state();
    if state.is_authenticated() {
        let who = state.user.map(|u| u.email).unwrap_or_default();
        println!("Session:       signed in {}", who);
        if app.session.has_pending_refresh() {
            let minutes = app.settings.session.refresh_interval().as_secs() / 60;
            println!("  next refresh in {} min", minutes);
        }
    } else {
        println!("Session:       signed out");
    }
    Ok(())
}

pub async fn whoami(app: &App) -> Result<()> {
    app.session.initialize().await;
    let state = app.session.state();
    if !state.is_authenticated() {
        bail!("Not logged in. Run 'ea-license login'.");
    }
    let user = state
        .user
        .context("Signed in, but no user details are available")?;

    println!("Subject:  {}", user.subject);
    println!("Email:    {}{}", user.email, if user.email_verified { "" } else { " (unverified)" });
    if let Some(role) = user.role() {
        println!("Role:     {}", role);
    }
    if let Some(key) = &user.api_key {
        println!("API key:  {}", key);
    }
    Ok(())
}

pub async fn token(app: &App) -> Result<()> {
    let token = app
        .session
        .manager()
        .get_valid_access_token()
        .await
        .context("Not logged in. Run 'ea-license login'.")?;
    println!("{}", token);
    Ok(())
}

/// Show what the dashboard would render for `path`.
pub async fn check(app: &App, path: &str, role: Option<String>) -> Result<()> {
    app.session.initialize().await;
    let mut guard = match role {
        Some(role) => app.guard().with_required_role(role),
        None => app.guard(),
    };
    let state = app.session.state();
    let view = guard.render(&state, path);
    println!("{} ({:?}): {:?}", path, guard.table().classify(path), view);
    Ok(())
}

/// GET an API path and print the JSON. Ctrl-C cancels the request.
pub async fn api(app: &App, path: &str) -> Result<()> {
    if app.settings.api_base_url.is_empty() {
        bail!("api_base_url is not set in settings.toml");
    }
    let client = ApiClient::new(
        app.settings.api_base_url.clone(),
        app.session.manager().clone(),
        app.settings.session.request_timeout(),
    );

    let request_id = ApiClient::request_id();
    let request = client.get_json(&request_id, path);
    tokio::pin!(request);

    let body = tokio::select! {
        result = &mut request => result,
        _ = tokio::signal::ctrl_c() => {
            client.cancel(&request_id);
            request.await
        }
    }?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn watch(app: &App, path: &str) -> Result<()> {
    app.session.initialize().await;
    crate::watch::run(app.session.clone(), app.guard(), path).await
}
