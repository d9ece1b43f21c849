//! Bridge settings, kept in `config.json` under the bridge home directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use uwb_link::{LinkConfig, ReplyTiming};

pub const HOME_ENV: &str = "UWB_BRIDGE_HOME";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the HTTP API binds to
    pub listen_addr: String,
    /// Exact advertised name of the anchor; empty accepts any anchor
    pub name_filter: String,
    pub preferred_mtu: u16,
    pub ack_timeout_ms: u64,
    pub quiet_period_ms: u64,
    pub overall_timeout_ms: u64,
    /// Default filter directive; `RUST_LOG` wins when set
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let timing = ReplyTiming::default();
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            name_filter: "UWB_ANCHOR_01".to_string(),
            preferred_mtu: uwb_proto::ble::PREFERRED_ATT_MTU,
            ack_timeout_ms: timing.ack_timeout.as_millis() as u64,
            quiet_period_ms: timing.quiet_period.as_millis() as u64,
            overall_timeout_ms: timing.overall_timeout.as_millis() as u64,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine home directory; set {HOME_ENV}")]
    NoHome,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// `$UWB_BRIDGE_HOME`, else `~/.uwb-bridge`
pub fn bridge_home() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|h| h.join(".uwb-bridge"))
        .ok_or(ConfigError::NoHome)
}

impl BridgeConfig {
    /// Read `config.json` from `home`, writing the defaults there first if missing
    pub fn load_or_create(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join(CONFIG_FILE);
        let io = |source| ConfigError::Io {
            path: path.clone(),
            source,
        };

        if !path.exists() {
            std::fs::create_dir_all(home).map_err(io)?;
            let config = Self::default();
            let data = serde_json::to_string_pretty(&config).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            std::fs::write(&path, data).map_err(io)?;
            return Ok(config);
        }

        let data = std::fs::read_to_string(&path).map_err(io)?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn reply_timing(&self) -> ReplyTiming {
        ReplyTiming {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            quiet_period: Duration::from_millis(self.quiet_period_ms),
            overall_timeout: Duration::from_millis(self.overall_timeout_ms),
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            name_filter: Some(self.name_filter.clone()).filter(|f| !f.is_empty()),
            preferred_mtu: self.preferred_mtu,
            ..LinkConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("uwb-bridge-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn writes_defaults_on_first_run() {
        let home = scratch("first-run");
        let config = BridgeConfig::load_or_create(&home).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert!(home.join(CONFIG_FILE).exists());

        // second load reads the file back
        assert_eq!(BridgeConfig::load_or_create(&home).unwrap(), config);
        std::fs::remove_dir_all(&home).unwrap();
    }

    #[test]
    fn missing_fields_take_defaults() {
        let home = scratch("partial");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join(CONFIG_FILE), r#"{"name_filter": "", "quiet_period_ms": 500}"#).unwrap();

        let config = BridgeConfig::load_or_create(&home).unwrap();
        assert_eq!(config.quiet_period_ms, 500);
        assert_eq!(config.ack_timeout_ms, 1500);
        assert_eq!(config.link_config().name_filter, None);
        assert_eq!(config.reply_timing().quiet_period, Duration::from_millis(500));
        std::fs::remove_dir_all(&home).unwrap();
    }

    #[test]
    fn bad_file_is_reported() {
        let home = scratch("bad");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join(CONFIG_FILE), "{not json").unwrap();
        assert!(matches!(
            BridgeConfig::load_or_create(&home),
            Err(ConfigError::Parse { .. })
        ));
        std::fs::remove_dir_all(&home).unwrap();
    }
}
