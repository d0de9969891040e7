//! Connection-related data models.
//!
//! This module defines the engine enumeration and the per-target storage
//! configuration value object that pools and executors read.

use crate::config::{BootstrapOptions, PoolOptions};
use serde::{Deserialize, Serialize};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL => Some(3306),
            Self::SQLite => None,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Storage configuration for one physical database target.
///
/// Produced by the configuration loader and only ever read by the pool
/// manager and executors. Tenants resolving to the same target share one
/// instance through the resource distributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_type: DatabaseType,
    /// Driver URL with storage-specific query keys removed. Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
    /// Schema the recipe tables live in. None means the engine default.
    #[serde(default)]
    pub schema: Option<String>,
    /// Prefix applied to every recipe table name.
    #[serde(default)]
    pub table_prefix: String,
    #[serde(default)]
    pub pool_options: PoolOptions,
    #[serde(default)]
    pub bootstrap: BootstrapOptions,
    /// Administratively disabled storage fails every transaction on acquire.
    #[serde(default)]
    pub disabled: bool,
}

impl StorageConfig {
    /// Create a new storage configuration with default options.
    pub fn new(connection_string: impl Into<String>) -> Result<Self, StorageConfigError> {
        let connection_string = connection_string.into();
        let db_type = DatabaseType::from_connection_string(&connection_string)
            .ok_or_else(|| StorageConfigError::UnknownDatabaseType(connection_string.clone()))?;

        Ok(Self {
            db_type,
            connection_string,
            schema: None,
            table_prefix: String::new(),
            pool_options: PoolOptions::default(),
            bootstrap: BootstrapOptions::default(),
            disabled: false,
        })
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_pool_options(mut self, pool_options: PoolOptions) -> Self {
        self.pool_options = pool_options;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapOptions) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Qualified name of a recipe table, honoring schema and prefix.
    pub fn table_name(&self, table: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}{}", schema, self.table_prefix, table),
            None => format!("{}{}", self.table_prefix, table),
        }
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        // Simple masking: replace password in URL
        if let Some(at_pos) = self.connection_string.find('@') {
            let scheme_end = self.connection_string.find("://").map_or(0, |p| p + 3);
            if let Some(colon_pos) = self.connection_string[scheme_end..at_pos].rfind(':') {
                let colon_pos = scheme_end + colon_pos;
                let prefix = &self.connection_string[..colon_pos + 1];
                let suffix = &self.connection_string[at_pos..];
                return format!("{}****{}", prefix, suffix);
            }
        }
        self.connection_string.clone()
    }
}

/// Errors that can occur when creating a storage configuration.
#[derive(Debug, thiserror::Error)]
pub enum StorageConfigError {
    /// Tenant ID is empty
    #[error("Tenant ID cannot be empty")]
    EmptyId,

    /// Tenant ID contains invalid characters
    #[error("Tenant ID contains invalid characters: {0}")]
    InvalidId(String),

    /// Could not determine database type from connection string
    #[error("Unknown database type in connection string: {0}")]
    UnknownDatabaseType(String),

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

/// Validate a tenant identifier: non-empty, alphanumerics plus `-` and `_`.
pub fn validate_tenant_id(id: &str) -> Result<(), StorageConfigError> {
    if id.is_empty() {
        return Err(StorageConfigError::EmptyId);
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(StorageConfigError::InvalidId(id.to_string()));
    }
    Ok(())
}
