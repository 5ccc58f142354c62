//! Type-safe configuration loader using the `config` crate,
//! with manual environment-variable overrides for core settings.

use serde::Deserialize;
use std::{env, time::Duration};
use config::{Config, ConfigError, File};

use crate::model::Function;

/// Top-level settings loaded from `Config.toml`
/// and then overridden (where applicable) by environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// HTTP bind address for metrics & health endpoints
    #[serde(default = "default_server_bind")]
    pub server_bind: String,

    #[serde(default)]
    pub core: CoreSettings,

    #[serde(default)]
    pub query: QuerySettings,

    pub storage: StorageSettings,
}

/// Process-wide rules that used to live in mutable globals.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CoreSettings {
    #[serde(default = "default_endpoint_name_max_length")]
    pub endpoint_name_max_length: usize,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            endpoint_name_max_length: default_endpoint_name_max_length(),
        }
    }
}

impl CoreSettings {
    /// Cut an endpoint name to at most `endpoint_name_max_length` characters.
    pub fn format_endpoint_name<'a>(&self, endpoint_name: &'a str) -> &'a str {
        match endpoint_name.char_indices().nth(self.endpoint_name_max_length) {
            Some((cut, _)) => &endpoint_name[..cut],
            None => endpoint_name,
        }
    }
}

/// Knobs shared by every storage realization.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QuerySettings {
    /// Used whenever a caller names an aggregation we do not recognise.
    #[serde(default = "default_fallback_function")]
    pub fallback_function: Function,

    /// The one aggregation top-N rankings are computed with.
    #[serde(default = "default_fallback_function")]
    pub top_n_function: Function,

    /// Terms-aggregation size for grouped document-store queries.
    /// Groups beyond it are dropped by the engine without notice.
    #[serde(default = "default_max_group_buckets")]
    pub max_group_buckets: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            fallback_function: default_fallback_function(),
            top_n_function: default_fallback_function(),
            max_group_buckets: default_max_group_buckets(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageSelector {
    Elasticsearch,
    Sqlite,
    Mysql,
    Postgresql,
}

impl std::str::FromStr for StorageSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "elasticsearch" => Ok(StorageSelector::Elasticsearch),
            "sqlite" => Ok(StorageSelector::Sqlite),
            "mysql" => Ok(StorageSelector::Mysql),
            "postgresql" | "postgres" => Ok(StorageSelector::Postgresql),
            other => Err(format!("unknown storage selector `{other}`")),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Which realization binds the query contracts
    pub selector: StorageSelector,

    #[serde(default)]
    pub elasticsearch: Option<ElasticsearchSettings>,

    #[serde(default)]
    pub jdbc: Option<JdbcSettings>,
}

#[derive(Deserialize, Clone)]
pub struct ElasticsearchSettings {
    /// Base URL, e.g. "http://localhost:9200"
    pub url: String,

    /// Prefix prepended to every index name as `namespace_index`
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

// Hand-written so the password never reaches the logs.
impl std::fmt::Debug for ElasticsearchSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticsearchSettings")
            .field("url", &self.url)
            .field("namespace", &self.namespace)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JdbcSettings {
    /// Connection URL, e.g. "postgres://…", "mysql://…", "sqlite::memory:"
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Upper bound on waiting for a pooled connection
    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
}

fn default_server_bind() -> String {
    "0.0.0.0:12800".to_string()
}

fn default_endpoint_name_max_length() -> usize {
    150
}

fn default_fallback_function() -> Function {
    Function::Avg
}

fn default_max_group_buckets() -> usize {
    1000
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Settings {
    /// Load settings from `Config.toml` (if present),
    /// then apply any overrides from these environment variables:
    ///
    /// - `APP__STORAGE_SELECTOR`
    /// - `APP__DATABASE_URL`
    /// - `APP__ELASTICSEARCH_URL`
    /// - `APP__SERVER_BIND`
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config")
    }

    pub fn from_file(name: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name(name).required(false))
            .build()?;

        let mut settings: Settings = cfg.try_deserialize()?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = env::var("APP__STORAGE_SELECTOR") {
            self.storage.selector = val.parse().map_err(ConfigError::Message)?;
        }
        if let Ok(val) = env::var("APP__DATABASE_URL") {
            match self.storage.jdbc.as_mut() {
                Some(jdbc) => jdbc.url = val,
                None => {
                    self.storage.jdbc = Some(JdbcSettings {
                        url: val,
                        max_connections: default_max_connections(),
                        acquire_timeout: default_acquire_timeout(),
                    })
                }
            }
        }
        if let Ok(val) = env::var("APP__ELASTICSEARCH_URL") {
            match self.storage.elasticsearch.as_mut() {
                Some(es) => es.url = val,
                None => {
                    self.storage.elasticsearch = Some(ElasticsearchSettings {
                        url: val,
                        namespace: None,
                        user: None,
                        password: None,
                        request_timeout: default_request_timeout(),
                    })
                }
            }
        }
        if let Ok(val) = env::var("APP__SERVER_BIND") {
            self.server_bind = val;
        }
        Ok(())
    }
}
