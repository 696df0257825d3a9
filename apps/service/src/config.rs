use std::{env, fs, path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFailed(std::io::Error),
    #[error("failed to write config file: {0}")]
    WriteFailed(std::io::Error),
    #[error("failed to parse config file: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config path available (set XDG_CONFIG_HOME or HOME)")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub control: Control,
    pub probe: Probe,
    pub store: Store,
    pub notify: Notify,
    pub updater: Updater,
}

/// Where and how to reach the local overlay-network control port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Control {
    pub host: String,
    pub port: u16,
    /// Password authentication; takes precedence over the cookie file.
    pub password: Option<String>,
    /// Cookie-file authentication.
    pub cookie_file: Option<path::PathBuf>,
}

impl Default for Control {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 9051, password: None, cookie_file: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Probe {
    pub socks_host: String,
    pub socks_port: u16,
    /// Per-read deadline for the probe sockets, seconds.
    pub timeout_secs: u64,
    /// Hard deadline for one whole probe round, seconds.
    pub round_timeout_secs: u64,
    /// Delay between consecutive circuit-build requests, milliseconds.
    pub pacing_ms: u64,
    /// Domains whose honest resolution is established over a trusted path
    /// before any probing starts.
    pub reference_domains: Vec<String>,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            socks_host: "127.0.0.1".into(),
            socks_port: 9052,
            timeout_secs: 10,
            round_timeout_secs: 300,
            pacing_ms: 3000,
            reference_domains: vec![
                "www.youporn.com".into(),
                "youporn.com".into(),
                "www.torproject.org".into(),
                "www.i2p2.de".into(),
                "torrentfreak.com".into(),
                "blockchain.info".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Store {
    pub path: String,
}

impl Default for Store {
    fn default() -> Self {
        Self { path: "weather.db".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Notify {
    /// Delivery endpoint; rendered notices are POSTed here as JSON.
    /// Unset means notices are only logged.
    pub endpoint: Option<String>,
    pub sender: String,
    /// Base URL used to build unsubscribe/preferences links.
    pub base_url: String,
}

impl Default for Notify {
    fn default() -> Self {
        Self {
            endpoint: None,
            sender: "relay-weather-ops@example.org".into(),
            base_url: "https://weather.example.org".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Updater {
    /// Interval between full check cycles, seconds.
    pub interval_secs: u64,
    /// Re-fetch the consensus cache when older than this many hours.
    pub directory_max_age_hours: i64,
    /// Default node-down grace period for new subscriptions, hours.
    pub default_grace_hours: i64,
    /// Welcome mails only go out once the deployment is this many days old.
    pub welcome_after_days: i64,
}

impl Default for Updater {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            directory_max_age_hours: 2,
            default_grace_hours: 4,
            welcome_after_days: 2,
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/relay-weather/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Ok(home_dir) = env::var("HOME") {
        path::PathBuf::from(home_dir).join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("relay-weather/config.toml"))
}

impl Config {
    /// Generate Config structure from file.
    ///
    /// Creates a default config at the default path (or the specified path)
    /// if one does not exist yet.
    pub fn from_config(optional_path: Option<&path::Path>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path)
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path).map_err(ConfigError::ReadFailed)?;
            Ok(toml::from_str(raw_string.as_str())?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        fs::write(path, config_str).map_err(ConfigError::WriteFailed)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.timeout_secs)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.round_timeout_secs)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.probe.pacing_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.control.port, 9051);
        assert_eq!(config.probe.socks_port, 9052);
        assert_eq!(config.probe.timeout_secs, 10);
        assert!(!config.probe.reference_domains.is_empty());
    }

    #[test]
    fn partial_config_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [control]
            port = 9151
            password = "hunter2"

            [store]
            path = "/var/lib/weather/weather.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.control.port, 9151);
        assert_eq!(config.control.password.as_deref(), Some("hunter2"));
        assert_eq!(config.store.path, "/var/lib/weather/weather.db");
        // untouched sections keep defaults
        assert_eq!(config.probe.socks_port, 9052);
        assert_eq!(config.updater.interval_secs, 3600);
    }

    #[test]
    fn config_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::default();
        config.write_config(&path).unwrap();

        let loaded = Config::from_config(Some(&path)).unwrap();
        assert_eq!(loaded.probe.reference_domains, config.probe.reference_domains);
    }
}
