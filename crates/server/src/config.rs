use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use server_api::{BackfillDelivery, RelayConfig, OUTBOUND_QUEUE_CAPACITY};
use shared::domain::MessageStatus;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_ttl_seconds: i64,
    pub default_message_status: MessageStatus,
    pub backfill_delivery: BackfillDelivery,
    pub collaborator_timeout_ms: u64,
    pub outbound_queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/relay.db".into(),
            jwt_secret: "dev-relay-secret".into(),
            jwt_ttl_seconds: 60 * 60 * 24,
            default_message_status: MessageStatus::Sent,
            backfill_delivery: BackfillDelivery::Joiner,
            collaborator_timeout_ms: 5_000,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl Settings {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            default_message_status: self.default_message_status,
            backfill_delivery: self.backfill_delivery,
            collaborator_timeout: Duration::from_millis(self.collaborator_timeout_ms),
            outbound_queue_capacity: self.outbound_queue_capacity,
        }
    }

    /// Applies one flat key. Keys match `server.toml` and the `APP__` env
    /// suffixes, lowercased.
    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "bind_addr" => self.server_bind = value.to_string(),
            "database_url" => self.database_url = value.to_string(),
            "jwt_secret" => self.jwt_secret = value.to_string(),
            "jwt_ttl_seconds" => match value.trim().parse::<i64>() {
                Ok(parsed) if parsed > 0 => self.jwt_ttl_seconds = parsed,
                _ => warn!(key, value, "ignoring invalid setting"),
            },
            "default_message_status" => match value.parse::<MessageStatus>() {
                Ok(status) => self.default_message_status = status,
                Err(error) => warn!(key, value, %error, "ignoring invalid setting"),
            },
            "backfill_delivery" => match value.parse::<BackfillDelivery>() {
                Ok(delivery) => self.backfill_delivery = delivery,
                Err(error) => warn!(key, value, %error, "ignoring invalid setting"),
            },
            "collaborator_timeout_ms" => match value.trim().parse::<u64>() {
                Ok(parsed) if parsed > 0 => self.collaborator_timeout_ms = parsed,
                _ => warn!(key, value, "ignoring invalid setting"),
            },
            "outbound_queue_capacity" => match value.trim().parse::<usize>() {
                Ok(parsed) if parsed > 0 => self.outbound_queue_capacity = parsed,
                _ => warn!(key, value, "ignoring invalid setting"),
            },
            _ => {}
        }
    }
}

const SETTING_KEYS: &[&str] = &[
    "bind_addr",
    "database_url",
    "jwt_secret",
    "jwt_ttl_seconds",
    "default_message_status",
    "backfill_delivery",
    "collaborator_timeout_ms",
    "outbound_queue_capacity",
];

pub fn load_settings() -> Settings {
    let file_cfg = fs::read_to_string("server.toml").ok();
    settings_from_sources(file_cfg.as_deref(), |name| std::env::var(name).ok())
}

/// Defaults, then `server.toml`, then the unprefixed legacy variables, then
/// `APP__*` variables. Later sources win.
pub fn settings_from_sources(
    file_cfg: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file_cfg {
        match toml::from_str::<HashMap<String, String>>(raw) {
            Ok(file_cfg) => {
                for key in SETTING_KEYS {
                    if let Some(v) = file_cfg.get(*key) {
                        settings.apply(key, v);
                    }
                }
            }
            Err(error) => warn!(%error, "ignoring unreadable server.toml"),
        }
    }

    for (legacy, key) in [
        ("SERVER_BIND", "bind_addr"),
        ("DATABASE_URL", "database_url"),
        ("JWT_SECRET", "jwt_secret"),
    ] {
        if let Some(v) = env(legacy) {
            settings.apply(key, &v);
        }
    }

    for key in SETTING_KEYS {
        if let Some(v) = env(&format!("APP__{}", key.to_ascii_uppercase())) {
            settings.apply(key, &v);
        }
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn is_windows_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

pub(crate) fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if is_windows_drive_path(path) {
            return format!("sqlite:{}", path.replace('\\', "/"));
        }
        return raw_database_url.to_string();
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");
    if is_windows_drive_path(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
