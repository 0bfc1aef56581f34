//! Process configuration.
//!
//! Everything is read from the environment (after `.env` is loaded by the
//! binary); unset or unparsable variables fall back to the defaults of the
//! individual service configs.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::database::MaintenanceConfig;
use crate::notification::DispatchConfig;
use crate::receiver::ReceiverConfig;
use crate::template::TemplateConfig;
use crate::verification::VerificationConfig;

/// Top-level configuration of the service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    /// Directory holding file-backed vendor tokens.
    pub token_cache_dir: PathBuf,
    /// Verify SMTP server certificates.
    pub ssl_global: bool,
    pub dispatch: DispatchConfig,
    pub verification: VerificationConfig,
    pub template: TemplateConfig,
    pub receiver: ReceiverConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:notifyd.db?mode=rwc".to_string(),
            log_dir: "logs".to_string(),
            token_cache_dir: PathBuf::from("cache"),
            ssl_global: false,
            dispatch: DispatchConfig::default(),
            verification: VerificationConfig::default(),
            template: TemplateConfig::default(),
            receiver: ReceiverConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `DATABASE_URL`, `LOG_DIR`
    /// - `NOTIFY_TEMPLATE_DIR`, `NOTIFY_DEFAULT_LANG`, `NOTIFY_FORCE_INIT_TOPICS`, `NOTIFY_BRAND`
    /// - `NOTIFY_TOKEN_CACHE_DIR`, `NOTIFY_SSL_GLOBAL`
    /// - `NOTIFY_WORKER_COUNT`, `NOTIFY_SEND_TIMEOUT_SECS`, `NOTIFY_EMAIL_TIMEOUT_SECS`
    /// - `NOTIFY_MAX_SEND_TIMES`, `NOTIFY_RESEND_SCOPE_SECS`
    /// - `NOTIFY_VERIFY_EXPIRE_INTERVAL_SECS`, `NOTIFY_VERIFY_VALID_INTERVAL_SECS`
    /// - `NOTIFY_RETENTION_DAYS`, `NOTIFY_IMPLICIT_ADMIN_VERIFY`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(url) = env_string("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = env_string("LOG_DIR") {
            config.log_dir = dir;
        }
        if let Some(dir) = env_string("NOTIFY_TOKEN_CACHE_DIR") {
            config.token_cache_dir = PathBuf::from(dir);
        }
        if let Some(ssl) = env_parse("NOTIFY_SSL_GLOBAL") {
            config.ssl_global = ssl;
        }

        if let Some(dir) = env_string("NOTIFY_TEMPLATE_DIR") {
            config.template.template_dir = PathBuf::from(dir);
        }
        if let Some(lang) = env_string("NOTIFY_DEFAULT_LANG") {
            config.template.default_lang = lang;
        }
        if let Some(brand) = env_string("NOTIFY_BRAND") {
            config.template.brand = brand;
        }
        if let Some(topics) = env_string("NOTIFY_FORCE_INIT_TOPICS") {
            config.template.force_init_topics = topics
                .split(',')
                .map(|t| t.trim().to_uppercase())
                .filter(|t| !t.is_empty())
                .collect();
        }

        if let Some(workers) = env_parse::<usize>("NOTIFY_WORKER_COUNT")
            && workers > 0
        {
            config.dispatch.worker_count = workers;
        }
        if let Some(timeout) = env_secs("NOTIFY_SEND_TIMEOUT_SECS") {
            config.dispatch.send_timeout = timeout;
        }
        if let Some(timeout) = env_secs("NOTIFY_EMAIL_TIMEOUT_SECS") {
            config.dispatch.email_timeout = timeout;
        }
        if let Some(max) = env_parse("NOTIFY_MAX_SEND_TIMES") {
            config.dispatch.max_send_times = max;
        }
        if let Some(scope) = env_secs("NOTIFY_RESEND_SCOPE_SECS") {
            config.dispatch.resend_scope = scope;
        }

        if let Some(interval) = env_secs("NOTIFY_VERIFY_EXPIRE_INTERVAL_SECS") {
            config.verification.expire_interval = interval;
        }
        if let Some(interval) = env_secs("NOTIFY_VERIFY_VALID_INTERVAL_SECS") {
            config.verification.valid_interval = interval;
        }

        if let Some(days) = env_parse("NOTIFY_RETENTION_DAYS") {
            config.maintenance.retention_days = days;
        }
        if let Some(implicit) = env_parse("NOTIFY_IMPLICIT_ADMIN_VERIFY") {
            config.receiver.implicit_admin_verify = implicit;
        }

        config
    }
}
