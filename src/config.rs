//! TOML configuration.
//!
//! ```toml
//! host_name = "persona"
//! backend_storage = "es"
//!
//! [log]
//! level = "info"
//!
//! [elasticsearch]
//! hosts = ["http://localhost:9200"]
//! default_index = "persona"
//!
//! [etcd]
//! addrs = ["http://localhost:2379"]
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration for
//! a local Elasticsearch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::codec::SEPARATOR;
use crate::storage::{BackendKind, MAX_PAGE_SIZE};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deployment name. Namespaces every key on the etcd backend.
    pub host_name: String,

    /// `"es"`, `"elasticsearch"` or `"etcd"`.
    pub backend_storage: String,

    pub log: LogConfig,
    pub elasticsearch: ElasticsearchConfig,
    pub etcd: EtcdConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub hosts: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub default_index: String,
    /// Hits fetched per search request by unbounded queries.
    pub page_size: usize,
    /// Wait for a refresh on writes so they are immediately searchable.
    pub refresh_writes: bool,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub addrs: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    /// Use an embedded sled store at this path instead of a cluster.
    pub embedded_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_name: "persona".to_string(),
            backend_storage: "es".to_string(),
            log: LogConfig::default(),
            elasticsearch: ElasticsearchConfig::default(),
            etcd: EtcdConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["http://localhost:9200".to_string()],
            username: None,
            password: None,
            default_index: "persona".to_string(),
            page_size: MAX_PAGE_SIZE,
            refresh_writes: false,
            timeout_secs: 5,
        }
    }
}

impl ElasticsearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            addrs: vec!["http://localhost:2379".to_string()],
            username: None,
            password: None,
            timeout_secs: 5,
            embedded_path: None,
        }
    }
}

impl EtcdConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates a configuration string.
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn backend_kind(&self) -> ConfigResult<BackendKind> {
        self.backend_storage
            .parse::<BackendKind>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.host_name.is_empty() {
            return Err(ConfigError::Invalid("host_name must not be empty".to_string()));
        }
        if self.host_name.contains(SEPARATOR) {
            return Err(ConfigError::Invalid(
                "host_name must not contain U+001F".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.log.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log.level must be one of {:?}, got {:?}",
                LOG_LEVELS, self.log.level
            )));
        }

        match self.backend_kind()? {
            BackendKind::Elasticsearch => {
                let es = &self.elasticsearch;
                if es.hosts.is_empty() {
                    return Err(ConfigError::Invalid(
                        "elasticsearch.hosts must list at least one host".to_string(),
                    ));
                }
                if es.default_index.is_empty() {
                    return Err(ConfigError::Invalid(
                        "elasticsearch.default_index must not be empty".to_string(),
                    ));
                }
                if es.page_size == 0 || es.page_size > MAX_PAGE_SIZE {
                    return Err(ConfigError::Invalid(format!(
                        "elasticsearch.page_size must be in 1..={}",
                        MAX_PAGE_SIZE
                    )));
                }
                if es.timeout_secs == 0 {
                    return Err(ConfigError::Invalid(
                        "elasticsearch.timeout_secs must be positive".to_string(),
                    ));
                }
            }
            BackendKind::Etcd => {
                let etcd = &self.etcd;
                if etcd.embedded_path.is_none() && etcd.addrs.is_empty() {
                    return Err(ConfigError::Invalid(
                        "etcd.addrs must list at least one endpoint".to_string(),
                    ));
                }
                if etcd.timeout_secs == 0 {
                    return Err(ConfigError::Invalid(
                        "etcd.timeout_secs must be positive".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.host_name, "persona");
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Elasticsearch);
        assert_eq!(config.elasticsearch.page_size, 1000);
        assert_eq!(config.elasticsearch.timeout(), Duration::from_secs(5));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_load_etcd_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
host_name = "node-a"
backend_storage = "etcd"

[etcd]
addrs = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
username = "root"
password = "secret"
timeout_secs = 3
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Etcd);
        assert_eq!(config.etcd.addrs.len(), 2);
        assert_eq!(config.etcd.username.as_deref(), Some("root"));
        assert_eq!(config.etcd.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/persona.toml"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_toml_str(r#"backend_storage = "redis""#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str(r#"host_name = """#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[elasticsearch]\npage_size = 5000"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[log]\nlevel = \"loud\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str("host_name = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_embedded_etcd_needs_no_addrs() {
        let config = Config::from_toml_str(
            "backend_storage = \"etcd\"\n[etcd]\naddrs = []\nembedded_path = \"/tmp/persona\"",
        )
        .unwrap();
        assert_eq!(config.etcd.embedded_path, Some(PathBuf::from("/tmp/persona")));
    }
}
