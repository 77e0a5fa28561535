use campaign_relay::config::{
    apply_env_overrides, expand_tilde, load_config, resolve_config_path, resolve_database_url,
    Config,
};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 8092);
    assert!(cfg.auth.token.is_none());
    assert!(cfg.database.url.is_none());
    assert_eq!(cfg.database.sqlite_path, "~/.campaign-relay/state.sqlite");
    assert!(!cfg.logging.json);
}

#[test]
fn test_default_provider_config() {
    let cfg = Config::default();
    assert_eq!(cfg.provider.account_id, "default");
    assert_eq!(cfg.provider.api_base, "https://graph.facebook.com");
    assert_eq!(cfg.provider.api_version, "v19.0");
    assert_eq!(cfg.provider.default_language, "en_US");
    assert_eq!(cfg.provider.default_category, "MARKETING");
    assert_eq!(cfg.provider.retry_attempts, 3);
    assert_eq!(cfg.provider.webhook_path, "/v1/channels/whatsapp/webhook");
    assert!(cfg.provider.phone_number_id.is_none());
}

#[test]
fn test_default_template_config() {
    let cfg = Config::default();
    assert_eq!(cfg.templates.max_body_len, 1024);
    assert_eq!(cfg.templates.max_urls, 3);
    assert_eq!(cfg.templates.lookback_days, 90);
    assert_eq!(cfg.templates.spam_window_minutes, 60);
    assert_eq!(cfg.templates.spam_threshold, 10);
    assert!(cfg.templates.extra_denylist.is_empty());
}

#[test]
fn test_default_poller_and_window() {
    let cfg = Config::default();
    assert_eq!(cfg.poller.initial_delay_seconds, 5);
    assert_eq!(cfg.poller.interval_seconds, 300);
    assert_eq!(cfg.poller.max_attempts, 288);
    assert_eq!(cfg.window.free_window_hours, 24);
    assert_eq!(cfg.broadcast.pacing_ms, 200);
}

#[test]
fn test_expand_tilde() {
    let path = expand_tilde("~/relay/state.sqlite");
    assert!(path.to_string_lossy().ends_with("relay/state.sqlite"));
    assert!(!path.to_string_lossy().starts_with('~'));
    assert_eq!(expand_tilde("/var/lib/relay.db").to_string_lossy(), "/var/lib/relay.db");
}

#[test]
fn test_resolve_database_url_prefers_explicit_url() {
    let mut cfg = Config::default();
    cfg.database.url = Some("postgres://relay@localhost/relay".to_string());
    assert_eq!(resolve_database_url(&cfg), "postgres://relay@localhost/relay");
}

#[test]
fn test_resolve_database_url_sqlite() {
    let dir = TempDir::new().unwrap();
    let mut cfg = Config::default();
    cfg.database.sqlite_path = dir.path().join("nested/state.sqlite").to_string_lossy().to_string();
    let url = resolve_database_url(&cfg);
    assert!(url.starts_with("sqlite://"));
    assert!(url.ends_with("state.sqlite?mode=rwc"));
    assert!(dir.path().join("nested").exists());
}

#[test]
fn test_config_from_json() {
    let raw = r#"{
        "server": {"port": 9000},
        "provider": {"phone_number_id": "1100", "retry_attempts": 5},
        "templates": {"extra_denylist": ["crypto"]}
    }"#;
    let cfg: Config = serde_json::from_str(raw).unwrap();
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.provider.phone_number_id.as_deref(), Some("1100"));
    assert_eq!(cfg.provider.retry_attempts, 5);
    assert_eq!(cfg.provider.api_version, "v19.0");
    assert_eq!(cfg.templates.extra_denylist, vec!["crypto".to_string()]);
}

// Environment variables are process-wide, so every env case lives in one test.
#[test]
fn test_env_overrides_and_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("campaign-relay.json");
    fs::write(&path, r#"{"auth": {"token": "from-file"}, "broadcast": {"pacing_ms": 0}}"#).unwrap();

    std::env::set_var("CAMPAIGN_RELAY_CONFIG", &path);
    assert_eq!(resolve_config_path(), path);
    let cfg = load_config();
    assert_eq!(cfg.auth.token.as_deref(), Some("from-file"));
    assert_eq!(cfg.broadcast.pacing_ms, 0);

    std::env::set_var("CAMPAIGN_RELAY_TOKEN", "from-env");
    std::env::set_var("CAMPAIGN_RELAY_ACCOUNT_ID", "acct-env");
    std::env::set_var("CAMPAIGN_RELAY_PORT", "7001");
    std::env::set_var("CAMPAIGN_RELAY_VERIFY_TOKEN", "   ");
    let mut cfg = Config::default();
    apply_env_overrides(&mut cfg);
    assert_eq!(cfg.auth.token.as_deref(), Some("from-env"));
    assert_eq!(cfg.provider.account_id, "acct-env");
    assert_eq!(cfg.server.port, 7001);
    assert!(cfg.provider.verify_token.is_none());

    for key in [
        "CAMPAIGN_RELAY_CONFIG",
        "CAMPAIGN_RELAY_TOKEN",
        "CAMPAIGN_RELAY_ACCOUNT_ID",
        "CAMPAIGN_RELAY_PORT",
        "CAMPAIGN_RELAY_VERIFY_TOKEN",
    ] {
        std::env::remove_var(key);
    }
    let default_path = resolve_config_path();
    assert!(default_path.to_string_lossy().contains(".campaign-relay"));
}
