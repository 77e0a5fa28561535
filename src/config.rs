use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub templates: TemplateConfig,
    pub poller: PollerConfig,
    pub broadcast: BroadcastConfig,
    pub window: WindowConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.campaign-relay/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Account that inbound webhook traffic is attributed to.
    pub account_id: String,
    pub api_base: String,
    pub api_version: String,
    pub phone_number_id: Option<String>,
    pub business_account_id: Option<String>,
    pub access_token: Option<String>,
    pub default_language: String,
    pub default_category: String,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub webhook_path: String,
    pub verify_token: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            account_id: "default".to_string(),
            api_base: "https://graph.facebook.com".to_string(),
            api_version: "v19.0".to_string(),
            phone_number_id: None,
            business_account_id: None,
            access_token: None,
            default_language: "en_US".to_string(),
            default_category: "MARKETING".to_string(),
            retry_attempts: 3,
            retry_base_ms: 500,
            webhook_path: "/v1/channels/whatsapp/webhook".to_string(),
            verify_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub max_body_len: usize,
    pub max_urls: usize,
    pub extra_denylist: Vec<String>,
    pub lookback_days: i64,
    pub spam_window_minutes: i64,
    pub spam_threshold: i64,
    pub list_cache_ttl_seconds: i64,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            max_body_len: 1024,
            max_urls: 3,
            extra_denylist: Vec::new(),
            lookback_days: 90,
            spam_window_minutes: 60,
            spam_threshold: 10,
            list_cache_ttl_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub initial_delay_seconds: u64,
    pub interval_seconds: u64,
    pub max_attempts: u32,
    pub shutdown_grace_seconds: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_delay_seconds: 5,
            interval_seconds: 300,
            max_attempts: 288,
            shutdown_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub pacing_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { pacing_ms: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub free_window_hours: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            free_window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

fn env_override(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        if let Ok(raw) = fs::read_to_string(&config_path) {
            match serde_json::from_str::<Config>(&raw) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(err) => tracing::warn!(
                    path = %config_path.display(),
                    "ignoring unreadable config: {err}"
                ),
            }
        }
    }

    apply_env_overrides(&mut cfg);
    cfg
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(token) = env_override("CAMPAIGN_RELAY_TOKEN") {
        cfg.auth.token = Some(token);
    }

    if let Some(url) = env_override("CAMPAIGN_RELAY_DATABASE_URL") {
        cfg.database.url = Some(url);
    }

    if let Some(path) = env_override("CAMPAIGN_RELAY_SQLITE_PATH") {
        cfg.database.sqlite_path = path;
    }

    if let Some(token) = env_override("CAMPAIGN_RELAY_PROVIDER_TOKEN") {
        cfg.provider.access_token = Some(token);
    }

    if let Some(id) = env_override("CAMPAIGN_RELAY_PHONE_NUMBER_ID") {
        cfg.provider.phone_number_id = Some(id);
    }

    if let Some(id) = env_override("CAMPAIGN_RELAY_BUSINESS_ACCOUNT_ID") {
        cfg.provider.business_account_id = Some(id);
    }

    if let Some(token) = env_override("CAMPAIGN_RELAY_VERIFY_TOKEN") {
        cfg.provider.verify_token = Some(token);
    }

    if let Some(account) = env_override("CAMPAIGN_RELAY_ACCOUNT_ID") {
        cfg.provider.account_id = account;
    }

    if let Some(base) = env_override("CAMPAIGN_RELAY_PROVIDER_API_BASE") {
        cfg.provider.api_base = base;
    }

    if let Some(port) = env_override("CAMPAIGN_RELAY_PORT").and_then(|v| v.parse().ok()) {
        cfg.server.port = port;
    }
}

pub fn resolve_config_path() -> PathBuf {
    env::var("CAMPAIGN_RELAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.campaign-relay/campaign-relay.json"))
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}?mode=rwc", path.to_string_lossy())
}
