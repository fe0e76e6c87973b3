use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "console.toml";

const MAX_HISTORY_LIMIT: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendRoute {
    /// POST to the REST endpoint; the response acknowledges the send.
    Rest,
    /// Publish a `send-message` envelope and wait for the push echo.
    Socket,
}

impl SendRoute {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rest" => Some(Self::Rest),
            "socket" | "ws" => Some(Self::Socket),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_path: String,
    pub typing_idle_ms: u64,
    pub typing_display_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub history_limit: u32,
    pub send_route: SendRoute,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_path: "/ws".into(),
            typing_idle_ms: 1500,
            typing_display_ms: 3000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            history_limit: 50,
            send_route: SendRoute::Rest,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    server_url: Option<String>,
    ws_path: Option<String>,
    typing_idle_ms: Option<u64>,
    typing_display_ms: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    history_limit: Option<u32>,
    send_route: Option<SendRoute>,
}

impl ClientSettings {
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn typing_display(&self) -> Duration {
        Duration::from_millis(self.typing_display_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let file: SettingsFile = toml::from_str(raw).context("invalid settings file")?;
        let mut settings = Self::default();
        settings.merge_file(file);
        Ok(settings.normalized())
    }

    fn merge_file(&mut self, file: SettingsFile) {
        if let Some(v) = file.server_url {
            self.server_url = v;
        }
        if let Some(v) = file.ws_path {
            self.ws_path = v;
        }
        if let Some(v) = file.typing_idle_ms {
            self.typing_idle_ms = v;
        }
        if let Some(v) = file.typing_display_ms {
            self.typing_display_ms = v;
        }
        if let Some(v) = file.reconnect_initial_ms {
            self.reconnect_initial_ms = v;
        }
        if let Some(v) = file.reconnect_max_ms {
            self.reconnect_max_ms = v;
        }
        if let Some(v) = file.history_limit {
            self.history_limit = v;
        }
        if let Some(v) = file.send_route {
            self.send_route = v;
        }
    }

    /// Applies `APP__*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("APP__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("APP__WS_PATH") {
            self.ws_path = v;
        }
        override_number(&lookup, "APP__TYPING_IDLE_MS", &mut self.typing_idle_ms);
        override_number(&lookup, "APP__TYPING_DISPLAY_MS", &mut self.typing_display_ms);
        override_number(
            &lookup,
            "APP__RECONNECT_INITIAL_MS",
            &mut self.reconnect_initial_ms,
        );
        override_number(&lookup, "APP__RECONNECT_MAX_MS", &mut self.reconnect_max_ms);
        override_number(&lookup, "APP__HISTORY_LIMIT", &mut self.history_limit);
        if let Some(v) = lookup("APP__SEND_ROUTE") {
            match SendRoute::parse(&v) {
                Some(route) => self.send_route = route,
                None => warn!("config: ignoring unknown APP__SEND_ROUTE={v}"),
            }
        }
    }

    fn normalized(mut self) -> Self {
        self.history_limit = self.history_limit.clamp(1, MAX_HISTORY_LIMIT);
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            self.reconnect_max_ms = self.reconnect_initial_ms;
        }
        if !self.ws_path.starts_with('/') {
            self.ws_path = format!("/{}", self.ws_path);
        }
        self.server_url = self.server_url.trim_end_matches('/').to_string();
        self
    }
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("config: ignoring non-numeric {key}={raw}"),
        }
    }
}

/// Defaults, then the settings file if present, then `APP__*` variables.
pub fn load_settings(path: impl AsRef<Path>) -> ClientSettings {
    let path = path.as_ref();
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match ClientSettings::from_toml_str(&raw) {
            Ok(settings) => settings,
            Err(err) => {
                warn!("config: {}: {err:#}; using defaults", path.display());
                ClientSettings::default()
            }
        },
        Err(_) => ClientSettings::default(),
    };
    settings.apply_env_overrides(|key| std::env::var(key).ok());
    settings.normalized()
}
