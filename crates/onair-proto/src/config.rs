use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub buttons: ButtonsConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Key-value store holding the catalog snapshot and resumption record.
    #[serde(default = "default_store_file")]
    pub store_file: PathBuf,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

/// TCP control socket used by controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    /// Explicit mpv binary; falls back to a `PATH` lookup.
    #[serde(default)]
    pub mpv_binary: Option<PathBuf>,
}

/// Catalog source — a local TOML station file, else an m3u path or URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    #[serde(default)]
    pub m3u_url: String,
    #[serde(default = "default_refresh_on_start")]
    pub refresh_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonsConfig {
    /// Window inside which consecutive headset-hook presses count as one gesture.
    #[serde(default = "default_click_window_ms")]
    pub click_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Shown as the title when a stream sends empty metadata and the item has
    /// no station name.
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_file: default_store_file(),
            pid_file: default_pid_file(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_control_port(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            port: default_http_port(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            mpv_binary: None,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            stations_toml: default_stations_toml(),
            m3u_url: String::new(),
            refresh_on_start: default_refresh_on_start(),
        }
    }
}

impl Default for ButtonsConfig {
    fn default() -> Self {
        Self {
            click_window_ms: default_click_window_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
        }
    }
}

fn default_store_file() -> PathBuf {
    platform::data_dir().join("store.json")
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("daemon.pid")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    8990
}

fn default_volume() -> f32 {
    0.5
}

fn default_stations_toml() -> PathBuf {
    platform::config_dir().join("stations.toml")
}

fn default_refresh_on_start() -> bool {
    true
}

fn default_click_window_ms() -> u64 {
    crate::clicks::DEFAULT_CLICK_WINDOW_MS
}

fn default_app_name() -> String {
    "onair".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            control: ControlConfig::default(),
            http: HttpConfig::default(),
            player: PlayerConfig::default(),
            catalog: CatalogConfig::default(),
            buttons: ButtonsConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.control.port, 9876);
        assert_eq!(config.control.bind_address, "127.0.0.1");
        assert_eq!(config.buttons.click_window_ms, 300);
        assert_eq!(config.session.app_name, "onair");
        assert!(config.daemon.store_file.ends_with("onair/store.json"));
        assert!(config.catalog.stations_toml.ends_with("onair/stations.toml"));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [buttons]
            click_window_ms = 450

            [session]
            app_name = "kitchen radio"
            "#,
        )
        .unwrap();
        assert_eq!(config.buttons.click_window_ms, 450);
        assert_eq!(config.session.app_name, "kitchen radio");
        assert_eq!(config.http.port, 8990);
        assert!(config.catalog.refresh_on_start);
    }
}
