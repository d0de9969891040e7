//! Identity of a physical database target.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, StorageConfig};
use url::Url;

/// Derived identity of a physical database target.
///
/// Two tenants whose configurations resolve to the same engine, host, port,
/// database, credentials, schema and table prefix get equal keys and therefore
/// share one pool and one config object. Immutable once derived.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    db_type: DatabaseType,
    host: String,
    port: Option<u16>,
    database: String,
    user: String,
    /// Part of the identity, never printed.
    password: String,
    schema: String,
    table_prefix: String,
}

impl ResourceKey {
    /// Derive the key for a storage configuration.
    pub fn derive(config: &StorageConfig) -> DbResult<Self> {
        let schema = config.schema.clone().unwrap_or_default();
        let table_prefix = config.table_prefix.clone();

        if config.db_type == DatabaseType::SQLite {
            // File path is the whole identity; query flags like mode=rwc don't change the target.
            let database = config
                .connection_string
                .split('?')
                .next()
                .unwrap_or_default()
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:")
                .to_string();
            return Ok(Self {
                db_type: config.db_type,
                host: String::new(),
                port: None,
                database,
                user: String::new(),
                password: String::new(),
                schema,
                table_prefix,
            });
        }

        let url = Url::parse(&config.connection_string).map_err(|e| {
            DbError::invalid_input(format!("Invalid connection URL: {}", e))
        })?;

        Ok(Self {
            db_type: config.db_type,
            host: url.host_str().unwrap_or("localhost").to_ascii_lowercase(),
            port: url.port().or_else(|| config.db_type.default_port()),
            database: url.path().trim_start_matches('/').to_string(),
            user: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
            schema,
            table_prefix,
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engine = self.db_type.display_name().to_lowercase();
        match self.port {
            Some(port) => write!(
                f,
                "{}://{}@{}:{}/{}",
                engine, self.user, self.host, port, self.database
            )?,
            None => write!(f, "{}:{}", engine, self.database)?,
        }
        if !self.schema.is_empty() {
            write!(f, "#{}", self.schema)?;
        }
        if !self.table_prefix.is_empty() {
            write!(f, "[{}]", self.table_prefix)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ResourceKey").field(&self.to_string()).finish()
    }
}
