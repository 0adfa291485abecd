//! Store configuration.
//!
//! Read once when a store is built and never re-validated afterwards.

use crate::error::{ConfigError, LarderResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Connection used when none is configured.
pub const DEFAULT_CONNECTION: &str = "default";

/// Store name reported to write observers when none is configured.
pub const DEFAULT_STORE_NAME: &str = "remote";

/// Configuration for a cache store and its locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Name reported in write notifications.
    #[serde(default = "default_store_name")]
    pub store_name: String,
    /// Namespace prefix prepended by the remote store and to lock names.
    #[serde(default)]
    pub prefix: String,
    /// Named connection for cache operations.
    #[serde(default = "default_connection")]
    pub connection: String,
    /// Named connection for locks. Falls back to `connection`.
    #[serde(default)]
    pub lock_connection: Option<String>,
}

fn default_store_name() -> String {
    DEFAULT_STORE_NAME.to_string()
}

fn default_connection() -> String {
    DEFAULT_CONNECTION.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_name: default_store_name(),
            prefix: String::new(),
            connection: default_connection(),
            lock_connection: None,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    pub fn with_lock_connection(mut self, connection: impl Into<String>) -> Self {
        self.lock_connection = Some(connection.into());
        self
    }

    /// The connection locks should use.
    pub fn lock_connection(&self) -> &str {
        self.lock_connection.as_deref().unwrap_or(&self.connection)
    }

    /// Create StoreConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `LARDER_STORE_NAME`: Name reported to observers (default: "remote")
    /// - `LARDER_CACHE_PREFIX`: Namespace prefix (default: empty)
    /// - `LARDER_CACHE_CONNECTION`: Cache connection name (default: "default")
    /// - `LARDER_LOCK_CONNECTION`: Lock connection name (default: cache connection)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            store_name: lookup("LARDER_STORE_NAME").unwrap_or_else(default_store_name),
            prefix: lookup("LARDER_CACHE_PREFIX").unwrap_or_default(),
            connection: lookup("LARDER_CACHE_CONNECTION").unwrap_or_else(default_connection),
            lock_connection: lookup("LARDER_LOCK_CONNECTION").filter(|s| !s.is_empty()),
        }
    }

    /// Parse a TOML table.
    pub fn from_toml_str(contents: &str) -> LarderResult<Self> {
        let config: StoreConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_path(path: &Path) -> LarderResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> LarderResult<()> {
        if self.connection.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "connection".to_string(),
            }
            .into());
        }
        if let Some(lock) = &self.lock_connection {
            if lock.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "lock_connection".to_string(),
                    value: lock.clone(),
                    reason: "must not be blank when set".to_string(),
                }
                .into());
            }
        }
        if self.prefix.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                field: "prefix".to_string(),
                value: self.prefix.clone(),
                reason: "must not contain whitespace".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
