use std::{fs, io, path::Path, str::FromStr, time::Duration};

use anyhow::Context;
use client_core::{EventScope, ListenerSettings};
use event_queue::QueueSettings;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub project: Option<String>,
    pub all_projects: bool,
    /// Zero keeps registrations until their operation completes.
    pub registration_ttl_seconds: u64,
    pub early_completion_grace_ms: u64,
    pub max_buffered_completions: usize,
    pub reconnect_delay_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            project: None,
            all_projects: false,
            registration_ttl_seconds: 3600,
            early_completion_grace_ms: 10_000,
            max_buffered_completions: 256,
            reconnect_delay_ms: 5_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl Settings {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            registration_ttl: (self.registration_ttl_seconds > 0)
                .then(|| Duration::from_secs(self.registration_ttl_seconds)),
            early_completion_grace: Duration::from_millis(self.early_completion_grace_ms),
            max_buffered_completions: self.max_buffered_completions,
        }
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        let scope = if self.all_projects {
            EventScope::AllProjects
        } else if let Some(project) = &self.project {
            EventScope::Project(project.clone())
        } else {
            EventScope::DefaultProject
        };
        ListenerSettings {
            scope,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSettings {
    server_url: Option<String>,
    project: Option<String>,
    all_projects: Option<bool>,
    registration_ttl_seconds: Option<u64>,
    early_completion_grace_ms: Option<u64>,
    max_buffered_completions: Option<usize>,
    reconnect_delay_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

/// Defaults, then `path` if it exists, then `OPWATCH_*` and `APP__*` environment variables.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()))
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file: FileSettings = toml::from_str(raw)?;

    if let Some(v) = file.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file.project {
        settings.project = Some(v);
    }
    if let Some(v) = file.all_projects {
        settings.all_projects = v;
    }
    if let Some(v) = file.registration_ttl_seconds {
        settings.registration_ttl_seconds = v;
    }
    if let Some(v) = file.early_completion_grace_ms {
        settings.early_completion_grace_ms = v;
    }
    if let Some(v) = file.max_buffered_completions {
        settings.max_buffered_completions = v;
    }
    if let Some(v) = file.reconnect_delay_ms {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = file.sweep_interval_ms {
        settings.sweep_interval_ms = v;
    }

    Ok(())
}

fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env_value(&lookup, "SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env_value(&lookup, "PROJECT") {
        settings.project = Some(v);
    }
    if let Some(v) = parsed_env_value(&lookup, "ALL_PROJECTS") {
        settings.all_projects = v;
    }
    if let Some(v) = parsed_env_value(&lookup, "REGISTRATION_TTL_SECONDS") {
        settings.registration_ttl_seconds = v;
    }
    if let Some(v) = parsed_env_value(&lookup, "EARLY_COMPLETION_GRACE_MS") {
        settings.early_completion_grace_ms = v;
    }
    if let Some(v) = parsed_env_value(&lookup, "MAX_BUFFERED_COMPLETIONS") {
        settings.max_buffered_completions = v;
    }
    if let Some(v) = parsed_env_value(&lookup, "RECONNECT_DELAY_MS") {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = parsed_env_value(&lookup, "SWEEP_INTERVAL_MS") {
        settings.sweep_interval_ms = v;
    }
}

// APP__ takes precedence over OPWATCH_.
fn env_value(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(&format!("APP__{key}")).or_else(|| lookup(&format!("OPWATCH_{key}")))
}

fn parsed_env_value<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env_value(lookup, key)?;
    match raw.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
