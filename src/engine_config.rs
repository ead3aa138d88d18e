//! Engine configuration object handed to the supervisor
//!
//! Assembling the configuration is the panel's job; this module only types the
//! fields the control plane reads and carries everything else through verbatim.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Inbound tag reserved for the engine's management API
pub const API_INBOUND_TAG: &str = "api";

/// Full engine configuration, serialized to the config file before each start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub log: LogSection,

    #[serde(default)]
    pub inbounds: Vec<InboundSection>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub loglevel: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundSection {
    #[serde(default)]
    pub tag: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    #[serde(default)]
    pub protocol: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EngineConfig {
    /// Port of the inbound tagged for management API use
    pub fn api_port(&self) -> Option<u16> {
        self.inbounds
            .iter()
            .find(|inbound| inbound.tag == API_INBOUND_TAG)
            .map(|inbound| inbound.port)
            .filter(|port| *port > 0)
    }

    /// Access-log path, or `None` when access logging is disabled
    pub fn access_log_path(&self) -> Option<PathBuf> {
        match self.log.access.trim() {
            "" | "none" => None,
            path => Some(PathBuf::from(path)),
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Source of the configuration used on every (re)start
pub trait ConfigProvider: Send + Sync {
    fn engine_config(&self) -> Result<EngineConfig>;
}

/// Reads the configuration from a JSON file on every call
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for FileConfigProvider {
    fn engine_config(&self) -> Result<EngineConfig> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            CoreError::Config(format!("{}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| CoreError::Config(format!("{}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "log": {"access": "/var/log/xray/access.log", "loglevel": "warning", "dnsLog": false},
        "api": {"tag": "api", "services": ["StatsService"]},
        "inbounds": [
            {"tag": "api", "port": 62789, "listen": "127.0.0.1", "protocol": "dokodemo-door",
             "settings": {"address": "127.0.0.1"}},
            {"tag": "inbound-443", "port": 443, "protocol": "vless"}
        ],
        "outbounds": [{"tag": "direct", "protocol": "freedom"}]
    }"#;

    #[test]
    fn test_api_port_from_tagged_inbound() {
        let config: EngineConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.api_port(), Some(62789));
        assert_eq!(config.inbounds.len(), 2);
    }

    #[test]
    fn test_api_port_missing() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"inbounds": [{"tag": "in", "port": 80}]}"#).unwrap();
        assert_eq!(config.api_port(), None);
    }

    #[test]
    fn test_access_log_path() {
        let mut config: EngineConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(
            config.access_log_path(),
            Some(PathBuf::from("/var/log/xray/access.log"))
        );

        config.log.access = "none".into();
        assert_eq!(config.access_log_path(), None);

        config.log.access = String::new();
        assert_eq!(config.access_log_path(), None);
    }

    #[test]
    fn test_unknown_fields_survive_serialization() {
        let config: EngineConfig = serde_json::from_str(SAMPLE).unwrap();
        let json = config.to_json_pretty().unwrap();
        let reparsed: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(reparsed["api"]["services"][0], "StatsService");
        assert_eq!(reparsed["outbounds"][0]["protocol"], "freedom");
        assert_eq!(reparsed["log"]["dnsLog"], false);
        assert_eq!(reparsed["inbounds"][0]["settings"]["address"], "127.0.0.1");

        let again: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_file_provider() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("template.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let provider = FileConfigProvider::new(&path);
        let config = provider.engine_config().unwrap();
        assert_eq!(config.api_port(), Some(62789));

        let missing = FileConfigProvider::new(tmp.path().join("missing.json"));
        assert!(matches!(missing.engine_config(), Err(CoreError::Config(_))));
    }
}
