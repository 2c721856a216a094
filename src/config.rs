use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub panel: PanelConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub view: ViewConfig,
    #[serde(default)]
    pub status_listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PanelConfig {
    pub base_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_dashboard_interval_secs")]
    pub dashboard_interval_secs: u64,
    #[serde(default = "default_system_interval_secs")]
    pub system_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ViewConfig {
    #[serde(default = "default_bar_width")]
    pub bar_width: usize,
    #[serde(default = "default_activity_limit")]
    pub activity_limit: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            dashboard_interval_secs: default_dashboard_interval_secs(),
            system_interval_secs: default_system_interval_secs(),
        }
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            bar_width: default_bar_width(),
            activity_limit: default_activity_limit(),
        }
    }
}

impl PollingConfig {
    pub fn dashboard_interval(&self) -> Duration {
        Duration::from_secs(self.dashboard_interval_secs)
    }

    pub fn system_interval(&self) -> Duration {
        Duration::from_secs(self.system_interval_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_panel(&self.panel)?;
        validate_polling(&self.polling)?;
        validate_view(&self.view)?;

        if let Some(listen) = self.status_listen.as_deref() {
            if SocketAddr::from_str(listen).is_err() {
                return Err(ConfigError::Validation(
                    "поле status_listen должно быть корректным адресом host:port".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../panelwatch.yaml.example")
    }
}

fn validate_panel(cfg: &PanelConfig) -> Result<(), ConfigError> {
    let base = cfg.base_url.trim();
    if base.is_empty() {
        return Err(ConfigError::Validation(
            "поле panel.base_url обязательно".to_string(),
        ));
    }
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(ConfigError::Validation(format!(
            "panel.base_url '{base}' должен начинаться с http:// или https://"
        )));
    }
    if cfg.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "panel.timeout_ms должен быть > 0".to_string(),
        ));
    }
    if cfg.token_env.trim().is_empty() {
        return Err(ConfigError::Validation(
            "panel.token_env не должен быть пустым".to_string(),
        ));
    }
    let has_username = cfg
        .username
        .as_deref()
        .is_some_and(|u| !u.trim().is_empty());
    if has_username && cfg.password_env.trim().is_empty() {
        return Err(ConfigError::Validation(
            "panel.password_env обязателен, если задан panel.username".to_string(),
        ));
    }
    Ok(())
}

fn validate_polling(cfg: &PollingConfig) -> Result<(), ConfigError> {
    if cfg.dashboard_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "polling.dashboard_interval_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.system_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "polling.system_interval_secs должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_view(cfg: &ViewConfig) -> Result<(), ConfigError> {
    if !(5..=100).contains(&cfg.bar_width) {
        return Err(ConfigError::Validation(
            "view.bar_width должно быть в диапазоне 5..100".to_string(),
        ));
    }
    if cfg.activity_limit < 1 {
        return Err(ConfigError::Validation(
            "view.activity_limit должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn default_token_env() -> String {
    "PANEL_TOKEN".to_string()
}

fn default_password_env() -> String {
    "PANEL_PASSWORD".to_string()
}

const fn default_timeout_ms() -> u64 {
    10_000
}

const fn default_dashboard_interval_secs() -> u64 {
    30
}

const fn default_system_interval_secs() -> u64 {
    5
}

const fn default_bar_width() -> usize {
    20
}

const fn default_activity_limit() -> usize {
    10
}
