use crate::models::{ChatContext, ChatMode};
use anyhow::{Context, Result};
use keyring::Entry;
use std::path::PathBuf;
use std::str::FromStr;

const KEYRING_SERVICE: &str = "tutorchat";

const DEFAULT_PROXY_URL: &str = "http://localhost:54321/functions/v1/ai-chat";
const DEFAULT_DATABASE_URL: &str = "sqlite://tutorchat.sqlite";
const DEFAULT_ANON_KEY_REF: &str = "env:TUTORCHAT_ANON_KEY";
const DEFAULT_UPLOAD_DIR: &str = "uploads";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub proxy_url: String,
    pub database_url: String,
    pub upload_dir: PathBuf,
    // Where to find the public key for guest requests: 'env:VAR' or 'keyring'
    pub anon_key_ref: Option<String>,
    pub default_mode: ChatMode,
    pub level: String,
    pub language: Option<String>,
    pub subject: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            anon_key_ref: Some(DEFAULT_ANON_KEY_REF.to_string()),
            default_mode: ChatMode::Mentor,
            level: "school".to_string(),
            language: Some("en".to_string()),
            subject: None,
        }
    }
}

impl AppConfig {
    /// Reads `TUTORCHAT_*` variables, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let default_mode = match non_empty("TUTORCHAT_MODE") {
            Some(raw) => ChatMode::from_str(&raw).context("Invalid TUTORCHAT_MODE")?,
            None => defaults.default_mode,
        };

        Ok(Self {
            proxy_url: non_empty("TUTORCHAT_PROXY_URL").unwrap_or(defaults.proxy_url),
            database_url: non_empty("TUTORCHAT_DATABASE_URL").unwrap_or(defaults.database_url),
            upload_dir: non_empty("TUTORCHAT_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            anon_key_ref: non_empty("TUTORCHAT_ANON_KEY_REF").or(defaults.anon_key_ref),
            default_mode,
            level: non_empty("TUTORCHAT_LEVEL").unwrap_or(defaults.level),
            language: non_empty("TUTORCHAT_LANGUAGE").or(defaults.language),
            subject: non_empty("TUTORCHAT_SUBJECT"),
        })
    }

    pub fn chat_context(&self, mode: ChatMode) -> ChatContext {
        ChatContext {
            mode,
            level: self.level.clone(),
            subject: self.subject.clone(),
            language: self.language.clone(),
        }
    }
}

/// Resolves a secret reference: `env:VAR` reads the environment,
/// `keyring` reads the OS keyring entry stored under `account`.
pub fn resolve_secret(secret_ref: Option<&str>, account: &str) -> Result<String> {
    match secret_ref {
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving secret from environment variable: {}", env_var_name);
            std::env::var(env_var_name).context(format!(
                "Failed to get secret from environment variable '{}'",
                env_var_name
            ))
        }
        Some("keyring") => {
            let entry = Entry::new(KEYRING_SERVICE, account).context("Failed to create keyring entry")?;
            log::debug!("Retrieving secret from keyring for account: {}", account);
            entry.get_password().context(format!(
                "Failed to get secret from keyring for '{}'",
                account
            ))
        }
        Some(other) => Err(anyhow::anyhow!("Unsupported secret reference format: {}", other)),
        None => Err(anyhow::anyhow!("Secret reference not set for '{}'", account)),
    }
}
