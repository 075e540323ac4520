use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::warn;

/// Environment variable holding the processor concurrency
pub const CONCURRENCY_ENV: &str = "QUEUE_CONCURRENCY";

const DEFAULT_SCHEMA: &str = "jobqueue";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_REDIS_HOST: &str = "127.0.0.1";
const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_REDIS_PREFIX: &str = "queues";

/// Named connections and the one used when a dispatch names none.
///
/// ```
/// use jobqueue::config::{ConnectionConfig, QueueConfig};
///
/// let config: QueueConfig = serde_json::from_str(r#"{
///     "default": "redis",
///     "connections": {
///         "redis": { "driver": "redis", "host": "cache", "password": "s3cret", "db": 2 },
///         "sync": { "driver": "sync" }
///     }
/// }"#).unwrap();
///
/// let Some(ConnectionConfig::Redis(redis)) = config.connections.get("redis") else {
///     panic!("redis connection expected");
/// };
/// assert_eq!(redis.connection_url(), "redis://:s3cret@cache:6379/2");
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub default: String,
    pub connections: BTreeMap<String, ConnectionConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let mut connections = BTreeMap::new();
        connections.insert(
            "sync".to_string(),
            ConnectionConfig::Sync { queue: None },
        );
        connections.insert(
            "memory".to_string(),
            ConnectionConfig::Memory { queue: None },
        );
        Self {
            default: "memory".to_string(),
            connections,
        }
    }
}

/// One backing store, selected by its `driver` tag
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Sync {
        #[serde(default)]
        queue: Option<String>,
    },
    Memory {
        #[serde(default)]
        queue: Option<String>,
    },
    Database(DatabaseConnectionConfig),
    Redis(RedisConnectionConfig),
}

impl ConnectionConfig {
    /// Queue used by dispatches on this connection that name none
    pub fn default_queue(&self) -> Option<&str> {
        match self {
            ConnectionConfig::Sync { queue } | ConnectionConfig::Memory { queue } => {
                queue.as_deref()
            }
            ConnectionConfig::Database(db) => db.queue.as_deref(),
            ConnectionConfig::Redis(redis) => redis.queue.as_deref(),
        }
    }
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DatabaseConnectionConfig {
    pub url: String,
    /// Schema holding the `jobs` and `failed_jobs` tables
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub queue: Option<String>,
}

impl DatabaseConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: default_schema(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            queue: None,
        }
    }
}

fn default_host() -> String {
    DEFAULT_REDIS_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_REDIS_PORT
}

fn default_prefix() -> String {
    DEFAULT_REDIS_PREFIX.to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RedisConnectionConfig {
    /// Full connection string, takes precedence over the individual parts
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: u32,
    /// Prepended to every key
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub queue: Option<String>,
}

impl Default for RedisConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: DEFAULT_REDIS_PORT,
            password: None,
            db: 0,
            prefix: default_prefix(),
            queue: None,
        }
    }
}

impl RedisConnectionConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// `url` when set, otherwise `redis://[:password@]host:port[/db]` with the
    /// password percent-encoded
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        let auth = match &self.password {
            Some(password) if !password.is_empty() => format!(":{}@", encode_userinfo(password)),
            _ => String::new(),
        };
        let db = match self.db {
            0 => String::new(),
            db => format!("/{db}"),
        };
        format!("redis://{auth}{}:{}{db}", self.host, self.port)
    }
}

/// Percent-encodes everything but RFC 3986 unreserved characters
fn encode_userinfo(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Concurrency from `QUEUE_CONCURRENCY`, 1 when unset or invalid
pub fn concurrency_from_env() -> usize {
    parse_concurrency(std::env::var(CONCURRENCY_ENV).ok().as_deref())
}

pub(crate) fn parse_concurrency(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return 1;
    };
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => value,
        _ => {
            warn!(
                value = raw,
                "Invalid {CONCURRENCY_ENV}, expected a positive integer. Using 1"
            );
            1
        }
    }
}
