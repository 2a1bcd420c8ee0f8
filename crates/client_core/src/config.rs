use std::{collections::HashMap, fs, path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "chat.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Hosted,
    Local,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hosted" => Ok(BackendKind::Hosted),
            "local" => Ok(BackendKind::Local),
            other => Err(anyhow!("unknown backend kind '{other}' (expected hosted or local)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub backend: BackendKind,
    pub backend_url: Option<String>,
    pub anon_key: Option<String>,
    pub database_url: String,
    pub realtime_heartbeat_secs: u64,
    pub log_filter: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            backend_url: None,
            anon_key: None,
            database_url: "sqlite://./data/chat.db".into(),
            realtime_heartbeat_secs: 30,
            log_filter: "info".into(),
        }
    }
}

impl ClientSettings {
    pub fn realtime_heartbeat(&self) -> Duration {
        Duration::from_secs(self.realtime_heartbeat_secs.max(1))
    }
}

/// Defaults, then `chat.toml` in the working directory, then the environment.
/// A file that fails to parse is logged and the keys it did not get to keep
/// their defaults.
pub fn load_settings() -> ClientSettings {
    let raw = fs::read_to_string(DEFAULT_SETTINGS_FILE).ok();
    settings_from(raw.as_deref(), |key| std::env::var(key).ok())
}

pub(crate) fn settings_from(
    raw: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Some(raw) = raw {
        if let Err(err) = apply_file(&mut settings, raw) {
            warn!(file = DEFAULT_SETTINGS_FILE, error = %format!("{err:#}"), "invalid settings file");
        }
    }
    apply_env(&mut settings, lookup);
    settings
}

/// Like [`load_settings`] but with an explicit file that must exist and parse.
pub fn load_settings_from(path: &Path) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    apply_file(&mut settings, &raw)
        .with_context(|| format!("invalid settings file {}", path.display()))?;
    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub(crate) fn apply_file(settings: &mut ClientSettings, raw: &str) -> anyhow::Result<()> {
    let file_cfg = toml::from_str::<HashMap<String, toml::Value>>(raw)?;
    let text = |key: &str| -> Option<String> {
        file_cfg.get(key).map(|value| match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };

    if let Some(v) = text("backend") {
        settings.backend = v.parse()?;
    }
    if let Some(v) = text("backend_url") {
        settings.backend_url = Some(v);
    }
    if let Some(v) = text("anon_key") {
        settings.anon_key = Some(v);
    }
    if let Some(v) = text("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = text("realtime_heartbeat_secs") {
        settings.realtime_heartbeat_secs = v
            .parse()
            .with_context(|| format!("realtime_heartbeat_secs must be an integer, got {v}"))?;
    }
    if let Some(v) = text("log") {
        settings.log_filter = v;
    }
    Ok(())
}

/// Each key is read as `CHAT_<NAME>` and then `APP__<NAME>`; the latter wins.
pub(crate) fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| {
        lookup(&format!("APP__{name}")).or_else(|| lookup(&format!("CHAT_{name}")))
    };

    if let Some(v) = var("BACKEND") {
        if let Ok(kind) = v.parse() {
            settings.backend = kind;
        }
    }
    if let Some(v) = var("BACKEND_URL") {
        settings.backend_url = Some(v);
    }
    if let Some(v) = var("ANON_KEY") {
        settings.anon_key = Some(v);
    }
    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("REALTIME_HEARTBEAT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.realtime_heartbeat_secs = parsed;
        }
    }
    if let Some(v) = var("LOG") {
        settings.log_filter = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
