use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::DEFAULT_OUTBOX_CAPACITY;

/// Hub configuration, loaded from TOML. Every field is optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address workers connect to.
    pub service: SocketAddr,
    /// Address of the HTTP/WebSocket listener for front-ends.
    pub web: SocketAddr,
    /// Root of the action scripts (`<logic_dir>/<group>/<action>.lua`).
    pub logic_dir: PathBuf,
    /// Seconds between action catalog rescans.
    pub scan_interval_secs: u64,
    /// Frames a single connection may have queued before sends to it fail.
    pub outbox_capacity: usize,
    /// Seconds a new worker has to send its Register frame.
    pub register_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            service: SocketAddr::from(([127, 0, 0, 1], 8888)),
            web: SocketAddr::from(([127, 0, 0, 1], 8080)),
            logic_dir: PathBuf::from("./logic"),
            scan_interval_secs: 600,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            register_timeout_secs: 5,
        }
    }
}

impl HubConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs.max(1))
    }
}

/// `$XDG_CONFIG_HOME/relayhub/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("relayhub").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: HubConfig = toml::from_str("").unwrap();
        assert_eq!(config.service, "127.0.0.1:8888".parse().unwrap());
        assert_eq!(config.web, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.logic_dir, PathBuf::from("./logic"));
        assert_eq!(config.scan_interval(), Duration::from_secs(600));
        assert_eq!(config.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            service = "0.0.0.0:9000"
            web = "0.0.0.0:9001"
            logic_dir = "/srv/logic"
            scan_interval_secs = 30
            outbox_capacity = 16
            register_timeout_secs = 2
        "#;
        let config: HubConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.service.port(), 9000);
        assert_eq!(config.web.port(), 9001);
        assert_eq!(config.logic_dir, PathBuf::from("/srv/logic"));
        assert_eq!(config.scan_interval(), Duration::from_secs(30));
        assert_eq!(config.outbox_capacity, 16);
        assert_eq!(config.register_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config: HubConfig =
            toml::from_str("scan_interval_secs = 0\nregister_timeout_secs = 0").unwrap();
        assert_eq!(config.scan_interval(), Duration::from_secs(1));
        assert_eq!(config.register_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = HubConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "service = 12").unwrap();

        let err = HubConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(ref p, _) if p == &path));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn load_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        std::fs::write(&path, "scan_interval_secs = 42").unwrap();

        let config = HubConfig::load(&path).unwrap().expect("file exists");
        assert_eq!(config.scan_interval_secs, 42);
        assert_eq!(config.service.port(), 8888);
    }
}
