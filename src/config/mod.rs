use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Upper bound for a whole request, matching calls included
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// HMAC key for signing session cookies
    #[serde(default = "default_session_secret")]
    pub secret: String,
    /// Cookie max-age and absolute session lifetime in seconds
    #[serde(default = "default_session_max_age")]
    pub max_age_seconds: i64,
    /// Mark the cookie `Secure` (set when served over HTTPS)
    #[serde(default)]
    pub cookie_secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: default_session_secret(),
            max_age_seconds: default_session_max_age(),
            cookie_secure: false,
        }
    }
}

fn default_session_secret() -> String {
    // Sessions do not survive a restart unless a secret is configured
    uuid::Uuid::new_v4().simple().to_string()
}

fn default_session_max_age() -> i64 {
    60 * 60
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_verification_code_ttl")]
    pub verification_code_ttl_minutes: i64,
    #[serde(default = "default_reset_code_ttl")]
    pub reset_code_ttl_minutes: i64,
    #[serde(default = "default_temp_password_ttl")]
    pub temp_password_ttl_hours: i64,
    /// Wrong reset codes tolerated before the code is revoked
    #[serde(default = "default_max_reset_failures")]
    pub max_reset_failures: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            verification_code_ttl_minutes: default_verification_code_ttl(),
            reset_code_ttl_minutes: default_reset_code_ttl(),
            temp_password_ttl_hours: default_temp_password_ttl(),
            max_reset_failures: default_max_reset_failures(),
        }
    }
}

fn default_verification_code_ttl() -> i64 {
    24 * 60
}

fn default_reset_code_ttl() -> i64 {
    60
}

fn default_max_reset_failures() -> i64 {
    5
}

fn default_temp_password_ttl() -> i64 {
    72
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Base URL of the matching job service
    #[serde(default = "default_jobs_url")]
    pub base_url: String,
    /// Timeout for a single matching call, kept below the request timeout
    #[serde(default = "default_jobs_timeout")]
    pub timeout_seconds: u64,
    /// Shared secret for signed job write-backs; callbacks are disabled without it
    pub callback_secret: Option<String>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            base_url: default_jobs_url(),
            timeout_seconds: default_jobs_timeout(),
            callback_secret: None,
        }
    }
}

fn default_jobs_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_jobs_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_requests")]
    pub api_requests_per_window: u32,
    #[serde(default = "default_auth_requests")]
    pub auth_requests_per_window: u32,
    #[serde(default = "default_callback_requests")]
    pub callback_requests_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Key buckets by `X-Forwarded-For`/`X-Real-IP`. Only safe behind a proxy
    /// that overwrites those headers.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_requests_per_window: default_api_requests(),
            auth_requests_per_window: default_auth_requests(),
            callback_requests_per_window: default_callback_requests(),
            window_seconds: default_window_seconds(),
            cleanup_interval: default_cleanup_interval(),
            trust_proxy_headers: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_requests() -> u32 {
    1200
}

fn default_auth_requests() -> u32 {
    20
}

fn default_callback_requests() -> u32 {
    600
}

fn default_window_seconds() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)?
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };

        config.check()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse configuration file")
    }

    pub fn check(&self) -> Result<()> {
        if self.session.secret.len() < 16 {
            anyhow::bail!("session.secret must be at least 16 characters");
        }
        if self.jobs.timeout_seconds >= self.server.request_timeout_seconds {
            warn!(
                jobs_timeout = self.jobs.timeout_seconds,
                request_timeout = self.server.request_timeout_seconds,
                "Matching job timeout is not shorter than the request timeout"
            );
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }
}
