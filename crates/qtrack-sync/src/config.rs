use std::path::{Path, PathBuf};
use std::time::Duration;

use qtrack_adapters::{ApiCredential, SourceEndpoint};
use qtrack_core::{RangeError, SourceKind};
use qtrack_storage::{BackoffPolicy, HttpClientConfig};
use serde::Deserialize;
use thiserror::Error;

pub const TOKEN_VAR: &str = "USAJOBS_API_TOKEN";
pub const USER_AGENT_VAR: &str = "USAJOBS_USER_AGENT";
pub const DEFAULT_USER_AGENT: &str = "qtrack/0.1 (questionnaire tracker)";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set; the current source needs an API token")]
    MissingCredential(&'static str),
    #[error("invalid value for {var}: `{value}`")]
    InvalidEnv { var: &'static str, value: String },
    #[error("reading source registry {path}: {source}")]
    RegistryRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing source registry {path}: {source}")]
    RegistryParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid date range: {0}")]
    Range(#[from] RangeError),
    #[error("no years requested")]
    NoYears,
    #[error("building http client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub registry_path: PathBuf,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub min_request_interval_ms: u64,
    pub max_workers: usize,
    pub current_lookback_days: u32,
    pub api_token: Option<String>,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            logs_dir: PathBuf::from("./logs"),
            registry_path: PathBuf::from("./sources.yaml"),
            http_timeout_secs: 30,
            max_retries: 3,
            min_request_interval_ms: 250,
            max_workers: 4,
            current_lookback_days: 1,
            api_token: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset and blank values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            data_dir: get("QTRACK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            logs_dir: get("QTRACK_LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.logs_dir),
            registry_path: get("QTRACK_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_path),
            http_timeout_secs: parse_var(&get, "QTRACK_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            max_retries: parse_var(&get, "QTRACK_MAX_RETRIES", defaults.max_retries)?,
            min_request_interval_ms: parse_var(
                &get,
                "QTRACK_MIN_REQUEST_INTERVAL_MS",
                defaults.min_request_interval_ms,
            )?,
            max_workers: parse_var(&get, "QTRACK_MAX_WORKERS", defaults.max_workers)?,
            current_lookback_days: parse_var(
                &get,
                "QTRACK_CURRENT_LOOKBACK_DAYS",
                defaults.current_lookback_days,
            )?,
            api_token: get(TOKEN_VAR).map(|t| t.trim().to_string()),
            user_agent: get(USER_AGENT_VAR).unwrap_or(defaults.user_agent),
        })
    }

    pub fn with_data_dir(mut self, data_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = data_dir {
            self.data_dir = dir;
        }
        self
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
            min_request_interval: Duration::from_millis(self.min_request_interval_ms),
        }
    }

    pub fn credential(&self) -> Result<ApiCredential, ConfigError> {
        let token = self
            .api_token
            .clone()
            .ok_or(ConfigError::MissingCredential(TOKEN_VAR))?;
        Ok(ApiCredential::new(token, self.user_agent.clone()))
    }
}

fn parse_var<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: SourceKind,
    pub display_name: String,
    #[serde(flatten)]
    pub endpoint: SourceEndpoint,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self {
            sources: vec![
                SourceConfig {
                    source: SourceKind::Historical,
                    display_name: "USAJobs Historic JOA".to_string(),
                    endpoint: SourceEndpoint::usajobs_default(),
                    notes: None,
                },
                SourceConfig {
                    source: SourceKind::Current,
                    display_name: "USAJobs Search".to_string(),
                    endpoint: SourceEndpoint::usajobs_default(),
                    notes: None,
                },
            ],
        }
    }
}

impl SourceRegistry {
    /// Read `path`, or fall back to the built-in endpoints when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::RegistryRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::RegistryParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn endpoint(&self, source: SourceKind) -> SourceEndpoint {
        self.sources
            .iter()
            .find(|s| s.source == source)
            .map(|s| s.endpoint.clone())
            .unwrap_or_else(SourceEndpoint::usajobs_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_workers, 4);
        assert!(config.api_token.is_none());
        assert!(matches!(
            config.credential(),
            Err(ConfigError::MissingCredential(TOKEN_VAR))
        ));
    }

    #[test]
    fn env_values_override_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("QTRACK_DATA_DIR", "/srv/qtrack"),
            ("QTRACK_MAX_RETRIES", "5"),
            ("QTRACK_MIN_REQUEST_INTERVAL_MS", "0"),
            ("USAJOBS_API_TOKEN", " tok "),
            ("USAJOBS_USER_AGENT", "ops@example.org"),
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/qtrack"));
        let http = config.http_client_config();
        assert_eq!(http.backoff.max_retries, 5);
        assert_eq!(http.min_request_interval, Duration::ZERO);
        assert_eq!(http.user_agent.as_deref(), Some("ops@example.org"));
        assert_eq!(config.api_token.as_deref(), Some("tok"));
        assert!(config.credential().is_ok());
    }

    #[test]
    fn malformed_numbers_are_config_errors() {
        let err = SyncConfig::from_lookup(lookup(&[("QTRACK_MAX_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "QTRACK_MAX_WORKERS", .. }));
    }

    #[test]
    fn registry_parses_and_falls_back_per_source() {
        let registry = SourceRegistry::parse(
            r#"
sources:
  - source: historical
    display_name: Mirror
    base_url: http://localhost:9000
    page_size: 50
"#,
        )
        .unwrap();
        let historical = registry.endpoint(SourceKind::Historical);
        assert_eq!(historical.base_url, "http://localhost:9000");
        assert_eq!(historical.page_size, 50);
        assert_eq!(historical.max_pages, 200);
        assert_eq!(registry.endpoint(SourceKind::Current), SourceEndpoint::usajobs_default());
    }

    #[test]
    fn workspace_registry_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::load(&path).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.endpoint(SourceKind::Current).max_pages, 40);
    }

    #[test]
    fn missing_registry_file_uses_builtin_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(registry.sources.len(), 2);
    }
}
