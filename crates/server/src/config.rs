use std::{fs, path::Path};

use anyhow::Context;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Unique per instance; peers route relay handoffs by it.
    pub instance_id: String,
    /// URL peers use to reach this instance's internal endpoint. Defaults
    /// to the bind address, which only works on a single host.
    pub advertise_url: Option<String>,
    pub presence_ttl_seconds: u64,
    pub offline_max_per_user: usize,
    pub offline_retention_hours: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/chat.db".into(),
            instance_id: format!("node-{}", Uuid::new_v4().simple()),
            advertise_url: None,
            presence_ttl_seconds: 30,
            offline_max_per_user: 500,
            offline_retention_hours: 72,
        }
    }
}

/// Subset of `Settings` a `server.toml` may override.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_bind: Option<String>,
    database_url: Option<String>,
    instance_id: Option<String>,
    advertise_url: Option<String>,
    presence_ttl_seconds: Option<u64>,
    offline_max_per_user: Option<usize>,
    offline_retention_hours: Option<u64>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(error) => tracing::warn!(%error, "ignoring malformed server.toml"),
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("INSTANCE_ID") {
        settings.instance_id = v;
    }
    if let Ok(v) = std::env::var("ADVERTISE_URL") {
        settings.advertise_url = Some(v);
    }
    if let Ok(v) = std::env::var("PRESENCE_TTL_SECONDS") {
        if let Ok(parsed) = v.parse() {
            settings.presence_ttl_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("OFFLINE_MAX_PER_USER") {
        if let Ok(parsed) = v.parse() {
            settings.offline_max_per_user = parsed;
        }
    }
    if let Ok(v) = std::env::var("OFFLINE_RETENTION_HOURS") {
        if let Ok(parsed) = v.parse() {
            settings.offline_retention_hours = parsed;
        }
    }

    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_bind {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.instance_id {
        settings.instance_id = v;
    }
    if let Some(v) = file_cfg.advertise_url {
        settings.advertise_url = Some(v);
    }
    if let Some(v) = file_cfg.presence_ttl_seconds {
        settings.presence_ttl_seconds = v;
    }
    if let Some(v) = file_cfg.offline_max_per_user {
        settings.offline_max_per_user = v;
    }
    if let Some(v) = file_cfg.offline_retention_hours {
        settings.offline_retention_hours = v;
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }
    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }
    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for database url '{database_url}'")
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
