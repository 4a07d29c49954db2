//! Configuration and credential file locations

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identity provider endpoints and client registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// OAuth2 client ID (public client)
    pub client_id: String,
    /// Client secret, for confidential clients only
    pub client_secret: Option<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: Vec<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            client_id: "ea-license-dashboard".to_string(),
            client_secret: None,
            authorize_url: "https://auth.example.com/oauth2/authorize".to_string(),
            token_url: "https://auth.example.com/oauth2/token".to_string(),
            userinfo_url: "https://auth.example.com/oauth2/userInfo".to_string(),
            scopes: vec![
                "openid".to_string(),
                "email".to_string(),
                "profile".to_string(),
                "offline_access".to_string(),
            ],
        }
    }
}

/// Token lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Delay between proactive refreshes (50 minutes)
    pub refresh_interval_secs: u64,
    /// Tokens count as expired this long before `exp`
    pub expiry_buffer_secs: i64,
    /// Per-request timeout for provider and API calls
    pub request_timeout_secs: u64,
    /// Where sign-out navigates to
    pub sign_out_redirect: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 50 * 60,
            expiry_buffer_secs: crate::auth::codec::DEFAULT_EXPIRY_BUFFER_SECS,
            request_timeout_secs: 30,
            sign_out_redirect: "/login".to_string(),
        }
    }
}

impl SessionSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Route classification for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteSettings {
    pub login_path: String,
    /// Path prefixes reachable without a session
    pub public: Vec<String>,
    /// Path prefixes that additionally need `admin_role`
    pub admin: Vec<String>,
    pub admin_role: String,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            login_path: "/login".to_string(),
            public: vec![
                "/login".to_string(),
                "/register".to_string(),
                "/forgot-password".to_string(),
            ],
            admin: vec!["/admin".to_string()],
            admin_role: "admin".to_string(),
        }
    }
}

/// Application settings (`settings.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the license dashboard API
    pub api_base_url: String,
    pub provider: ProviderSettings,
    pub session: SessionSettings,
    pub routes: RouteSettings,
}

impl Settings {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "ea-license", "ea-license")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get settings file path
    pub fn settings_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("settings.toml"))
    }

    /// Get credentials file path
    pub fn credentials_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("credentials.toml"))
    }

    /// Load settings from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::settings_path()?)
    }

    /// Load settings from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read settings file")?;
        toml::from_str(&content).context("Failed to parse settings file")
    }

    /// Save settings to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(path, content).context("Failed to write settings file")?;
        Ok(())
    }
}
