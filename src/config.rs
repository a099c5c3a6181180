//! Layered configuration for the Taskify server.
//!
//! Settings are resolved in four layers, later layers winning:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file (`taskify.toml` or `--config <path>`)
//! 3. Environment variables (a `.env` file is loaded first by the CLI)
//! 4. CLI flags
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 5000
//! frontend_url = "https://app.taskify.dev"
//!
//! [database]
//! path = "/var/lib/taskify/taskify.db"
//!
//! [auth]
//! access_secret = "..."
//! refresh_secret = "..."
//! access_expiry = "15m"
//! refresh_expiry = "7d"
//! secure_cookies = true
//!
//! [email]
//! sendgrid_api_key = "SG...."
//! from = "no-reply@taskify.dev"
//!
//! [google]
//! client_id = "..."
//! client_secret = "..."
//! redirect_uri = "https://api.taskify.dev/api/v1/calendar/callback"
//!
//! [logging]
//! format = "json"
//! directory = "/var/log/taskify"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "taskify.toml";

const DEV_ACCESS_SECRET: &str = "taskify-dev-access-secret";
const DEV_REFRESH_SECRET: &str = "taskify-dev-refresh-secret";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origin of the web client, used for CORS and links in emails.
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    /// Permissive CORS and built-in development secrets.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_frontend_url() -> String {
    "http://localhost:5173".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            frontend_url: default_frontend_url(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".taskify/taskify.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub access_secret: String,
    #[serde(default)]
    pub refresh_secret: String,
    /// Access token lifetime, e.g. `"15m"`.
    #[serde(default = "default_access_expiry")]
    pub access_expiry: String,
    /// Refresh token lifetime, e.g. `"7d"`.
    #[serde(default = "default_refresh_expiry")]
    pub refresh_expiry: String,
    /// Mark auth cookies `Secure` (requires HTTPS).
    #[serde(default)]
    pub secure_cookies: bool,
}

fn default_access_expiry() -> String {
    "15m".to_string()
}

fn default_refresh_expiry() -> String {
    "7d".to_string()
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            access_secret: String::new(),
            refresh_secret: String::new(),
            access_expiry: default_access_expiry(),
            refresh_expiry: default_refresh_expiry(),
            secure_cookies: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSection {
    /// SendGrid API key. Email delivery is disabled when unset.
    #[serde(default)]
    pub sendgrid_api_key: Option<String>,
    #[serde(default = "default_from")]
    pub from: String,
}

fn default_from() -> String {
    "no-reply@taskify.app".to_string()
}

impl Default for EmailSection {
    fn default() -> Self {
        Self {
            sendgrid_api_key: None,
            from: default_from(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoogleSection {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

impl GoogleSection {
    /// Calendar sync is available only with all three OAuth settings present.
    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some() && self.redirect_uri.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rolling log files, in addition to stderr.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// The complete taskify.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskifyConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub email: EmailSection,
    #[serde(default)]
    pub google: GoogleSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl TaskifyConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse taskify.toml")
    }

    /// Resolve file and environment layers.
    ///
    /// An explicit `path` must exist; otherwise `taskify.toml` in the working
    /// directory is used when present.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid PORT '{}'", port))?;
        }
        if let Some(url) = lookup("FRONTEND_URL") {
            self.server.frontend_url = url;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.path = database_path_from_url(&url);
        }
        if let Some(secret) = lookup("JWT_ACCESS_SECRET") {
            self.auth.access_secret = secret;
        }
        if let Some(secret) = lookup("JWT_REFRESH_SECRET") {
            self.auth.refresh_secret = secret;
        }
        if let Some(expiry) = lookup("JWT_ACCESS_EXPIRY") {
            self.auth.access_expiry = expiry;
        }
        if let Some(expiry) = lookup("JWT_REFRESH_EXPIRY") {
            self.auth.refresh_expiry = expiry;
        }
        if let Some(secure) = lookup("COOKIE_SECURE") {
            self.auth.secure_cookies = secure == "true" || secure == "1";
        }
        if let Some(key) = lookup("SENDGRID_API_KEY") {
            self.email.sendgrid_api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(from) = lookup("SENDGRID_FROM_EMAIL") {
            self.email.from = from;
        }
        if let Some(id) = lookup("GOOGLE_CLIENT_ID") {
            self.google.client_id = Some(id).filter(|v| !v.is_empty());
        }
        if let Some(secret) = lookup("GOOGLE_CLIENT_SECRET") {
            self.google.client_secret = Some(secret).filter(|v| !v.is_empty());
        }
        if let Some(uri) = lookup("GOOGLE_REDIRECT_URI") {
            self.google.redirect_uri = Some(uri).filter(|v| !v.is_empty());
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(dir) = lookup("LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Apply CLI overrides (highest precedence).
    pub fn with_cli_args(mut self, port: Option<u16>, db_path: Option<PathBuf>, dev: bool) -> Self {
        if let Some(port) = port {
            self.server.port = port;
        }
        if let Some(db_path) = db_path {
            self.database.path = db_path;
        }
        if dev {
            self.server.dev_mode = true;
        }
        self
    }

    /// Check the configuration is usable and fill in development secrets.
    ///
    /// Outside dev mode both JWT secrets are required.
    pub fn validate(&mut self) -> Result<()> {
        if self.server.dev_mode {
            if self.auth.access_secret.is_empty() {
                self.auth.access_secret = DEV_ACCESS_SECRET.to_string();
            }
            if self.auth.refresh_secret.is_empty() {
                self.auth.refresh_secret = DEV_REFRESH_SECRET.to_string();
            }
        }
        if self.auth.access_secret.is_empty() {
            anyhow::bail!("JWT_ACCESS_SECRET is required (or run with --dev)");
        }
        if self.auth.refresh_secret.is_empty() {
            anyhow::bail!("JWT_REFRESH_SECRET is required (or run with --dev)");
        }
        for (key, value) in [
            ("auth.access_expiry", &self.auth.access_expiry),
            ("auth.refresh_expiry", &self.auth.refresh_expiry),
        ] {
            let ttl = parse_duration(value).with_context(|| format!("Invalid {}", key))?;
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| chrono::Utc::now().checked_add_signed(ttl))
                .with_context(|| format!("Invalid {}: '{}' is too long", key, value))?;
        }
        Ok(())
    }

    pub fn access_ttl(&self) -> Result<Duration> {
        parse_duration(&self.auth.access_expiry)
    }

    pub fn refresh_ttl(&self) -> Result<Duration> {
        parse_duration(&self.auth.refresh_expiry)
    }

    /// Render the effective configuration as TOML with secrets masked.
    pub fn redacted_toml(&self) -> Result<String> {
        let mut copy = self.clone();
        copy.auth.access_secret = redact(&copy.auth.access_secret);
        copy.auth.refresh_secret = redact(&copy.auth.refresh_secret);
        copy.email.sendgrid_api_key = copy.email.sendgrid_api_key.as_deref().map(redact);
        copy.google.client_secret = copy.google.client_secret.as_deref().map(redact);
        toml::to_string_pretty(&copy).context("Failed to serialize configuration")
    }
}

fn redact(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        "********".to_string()
    }
}

/// Accept both bare paths and `sqlite://` / `file:` URLs.
fn database_path_from_url(url: &str) -> PathBuf {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .or_else(|| url.strip_prefix("file:"))
        .unwrap_or(url);
    PathBuf::from(path)
}

/// Parse a duration such as `"15m"`, `"7d"`, `"12h"`, `"30s"` or a bare
/// number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        anyhow::bail!("Empty duration");
    }
    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = digits
        .parse()
        .with_context(|| format!("Invalid duration '{}'", value))?;
    let multiplier: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        _ => anyhow::bail!("Invalid duration unit in '{}': expected s, m, h or d", value),
    };
    let seconds = amount
        .checked_mul(multiplier)
        .with_context(|| format!("Duration '{}' is too large", value))?;
    Ok(Duration::from_secs(seconds))
}
