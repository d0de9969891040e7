//! Configuration handling for the storage adapter.
//!
//! This module provides configuration management via CLI arguments and environment variables.
//! Per-tenant storage settings travel as query parameters on the tenant's connection URL.

use crate::models::{StorageConfig, StorageConfigError, validate_tenant_id};
use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

// Bootstrap defaults: retry every 10s for up to an hour
pub const DEFAULT_BOOTSTRAP_RETRY_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_BOOTSTRAP_MAX_WAIT_MS: u64 = 60 * 60 * 1000;
pub const TEST_BOOTSTRAP_RETRY_INTERVAL_MS: u64 = 50;
pub const TEST_BOOTSTRAP_MAX_WAIT_MS: u64 = 1_000;

/// Connection pool configuration options parsed from database URL.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10 for MySQL/PostgreSQL, 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to test connections before use (default: true)
    pub test_before_acquire: Option<bool>,
}

impl PoolOptions {
    /// Get max_connections with default value based on database type.
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    /// Get min_connections with default value.
    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    /// Get test_before_acquire with default value.
    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if min == 0 {
                return Err("min_connections must be greater than 0".to_string());
            }
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        Ok(())
    }
}

/// How long pool bootstrap tolerates an unreachable database.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BootstrapOptions {
    /// Sleep between construction attempts in milliseconds (default: 10s)
    pub retry_interval_ms: Option<u64>,
    /// Total time budget in milliseconds (default: 1 hour)
    pub max_wait_ms: Option<u64>,
}

impl BootstrapOptions {
    /// Short intervals for test configurations.
    pub fn for_tests() -> Self {
        Self {
            retry_interval_ms: Some(TEST_BOOTSTRAP_RETRY_INTERVAL_MS),
            max_wait_ms: Some(TEST_BOOTSTRAP_MAX_WAIT_MS),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(
            self.retry_interval_ms
                .unwrap_or(DEFAULT_BOOTSTRAP_RETRY_INTERVAL_MS),
        )
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms.unwrap_or(DEFAULT_BOOTSTRAP_MAX_WAIT_MS))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.retry_interval_ms == Some(0) {
            return Err("bootstrap_retry_interval_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// One tenant's storage configuration parsed from a CLI argument.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    /// Tenant identifier. From "id=url" format, or derived from database name, or "public".
    pub id: String,
    pub storage: StorageConfig,
}

impl TenantConfig {
    /// Storage option keys that we extract from URL query parameters.
    const STORAGE_OPTION_KEYS: &'static [&'static str] = &[
        "schema",
        "table_prefix",
        "disabled",
        "max_connections",
        "min_connections",
        "idle_timeout",
        "acquire_timeout",
        "test_before_acquire",
        "bootstrap_retry_interval_ms",
        "bootstrap_max_wait_ms",
    ];

    /// Parse a tenant config from CLI argument.
    ///
    /// # Format
    ///
    /// - `connection_string` - Uses database name as tenant ID
    /// - `id=connection_string` - Named tenant
    /// - `connection_string?schema=s&table_prefix=p_` - Tables under `s.p_*`
    ///
    /// # Examples
    ///
    /// ```text
    /// postgres://auth:pw@db:5432/auth                          # tenant "auth"
    /// acme=postgres://auth:pw@db:5432/auth?schema=acme         # named, own schema
    /// t1=mysql://auth:pw@db/auth?table_prefix=t1_&max_connections=5
    /// ```
    pub fn parse(s: &str) -> Result<Self, StorageConfigError> {
        // Split name=url format (only if '=' before ':')
        let scheme_pos = s.find(':').unwrap_or(s.len());
        let (explicit_name, url_str) = match s[..scheme_pos].find('=') {
            Some(idx) => (Some(&s[..idx]), &s[idx + 1..]),
            None => (None, s),
        };

        let mut url =
            Url::parse(url_str).map_err(|e| StorageConfigError::InvalidUrl(e.to_string()))?;
        let mut opts = Self::extract_options(&mut url, Self::STORAGE_OPTION_KEYS);

        let pool_options = Self::parse_pool_options(&mut opts);
        pool_options
            .validate()
            .map_err(StorageConfigError::InvalidOption)?;

        let bootstrap = BootstrapOptions {
            retry_interval_ms: opts
                .remove("bootstrap_retry_interval_ms")
                .and_then(|v| v.parse().ok()),
            max_wait_ms: opts
                .remove("bootstrap_max_wait_ms")
                .and_then(|v| v.parse().ok()),
        };
        bootstrap
            .validate()
            .map_err(StorageConfigError::InvalidOption)?;

        let disabled = opts
            .remove("disabled")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let database = Self::db_name(&url);
        let id = explicit_name
            .map(|n| n.trim().to_string())
            .or(database)
            .unwrap_or_else(|| "public".to_string());
        validate_tenant_id(&id)?;

        let mut storage = StorageConfig::new(url.to_string())?
            .with_pool_options(pool_options)
            .with_bootstrap(bootstrap);
        storage.schema = opts.remove("schema").filter(|s| !s.is_empty());
        storage.table_prefix = opts.remove("table_prefix").unwrap_or_default();
        storage.disabled = disabled;

        Ok(Self { id, storage })
    }

    /// Parse pool options from extracted URL query parameters.
    fn parse_pool_options(opts: &mut HashMap<String, String>) -> PoolOptions {
        PoolOptions {
            max_connections: opts.remove("max_connections").and_then(|v| v.parse().ok()),
            min_connections: opts.remove("min_connections").and_then(|v| v.parse().ok()),
            idle_timeout_secs: opts.remove("idle_timeout").and_then(|v| v.parse().ok()),
            acquire_timeout_secs: opts.remove("acquire_timeout").and_then(|v| v.parse().ok()),
            test_before_acquire: opts.remove("test_before_acquire").and_then(|v| {
                if v.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if v.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None // Invalid value ignored
                }
            }),
        }
    }

    /// Extract storage options from URL query params, keeping others for the driver.
    /// Uses proper URL encoding to preserve special characters in remaining params.
    fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
        let mut opts = HashMap::new();
        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter_map(|(k, v)| {
                let key_lower = k.to_ascii_lowercase();
                if keys.contains(&key_lower.as_str()) {
                    opts.insert(key_lower, v.into_owned());
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();

        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
        opts
    }

    fn db_name(url: &Url) -> Option<String> {
        url.path()
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches(".sqlite").trim_end_matches(".db"))
            .filter(|s| !s.is_empty())
            .map(String::from)
    }
}

/// Configuration for the storage adapter binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "authstore-sql",
    about = "Relational storage adapter for authentication services",
    version,
    author
)]
pub struct Config {
    /// Tenant storage targets.
    /// Format: "connection_string" or "id=connection_string".
    /// Can be specified multiple times; tenants sharing a target share one pool.
    #[arg(
        short = 't',
        long = "tenant",
        value_name = "URL",
        env = "AUTHSTORE_TENANT",
        value_delimiter = ','
    )]
    pub tenants: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "AUTHSTORE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "AUTHSTORE_JSON_LOGS")]
    pub json_logs: bool,

    /// Skip the startup `SELECT 1` probe through the transaction executor
    #[arg(long, env = "AUTHSTORE_SKIP_PROBE")]
    pub skip_probe: bool,
}

impl Config {
    /// Parse all tenant configurations.
    pub fn parse_tenants(&self) -> Result<Vec<TenantConfig>, StorageConfigError> {
        self.tenants.iter().map(|s| TenantConfig::parse(s)).collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenants: Vec::new(),
            log_level: "info".to_string(),
            json_logs: false,
            skip_probe: false,
        }
    }
}
