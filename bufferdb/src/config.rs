//! Index configuration module.
//!
//! This module provides configuration for a [`BufferedBTree`](crate::BufferedBTree),
//! either built in code or loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `BUFFERDB_BUFFER_SIZE`: Split threshold / node buffer flush threshold (default: `3`)
//! - `BUFFERDB_NUM_PARTITIONS`: Number of partition logs (default: `4`)
//! - `BUFFERDB_STORAGE_PATH`: Directory holding the partition logs (default: `./data`)
//! - `BUFFERDB_SYNC_STRATEGY`: `coarse` or `optimistic` (default: `coarse`)
//! - `BUFFERDB_MAX_RESTARTS`: Optimistic restarts before giving up (default: `100000`)
//! - `BUFFERDB_SYNC_ON_APPEND`: `true` to `fsync` every log append (default: `false`)
//!
//! # Invariants
//!
//! After [`IndexConfig::validate`] succeeds:
//! - `buffer_size >= 2`, so a split never leaves an empty sibling
//! - `num_partitions >= 1`
//! - `max_restarts >= 1`

use std::path::PathBuf;

use crate::btree::SyncStrategy;

/// Index configuration.
#[derive(Debug, Clone)]
#[allow(clippy::disallowed_methods)] // Clone needed to hand a copy to the tree
pub struct IndexConfig {
    /// A node splits once it holds more than this many keys, and eagerly
    /// drains its buffer once the buffer holds more than this many entries.
    pub buffer_size: usize,
    /// Number of partition logs. Fixed for the life of the storage directory.
    pub num_partitions: usize,
    /// Directory holding `partition_{i}.dat`.
    pub storage_path: PathBuf,
    /// Node synchronization strategy for the whole tree.
    pub strategy: SyncStrategy,
    /// Upper bound on optimistic restarts for a single operation.
    pub max_restarts: usize,
    /// Call `sync_data` after every log append.
    pub sync_on_append: bool,
}

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl IndexConfig {
    /// Default split threshold.
    pub const DEFAULT_BUFFER_SIZE: usize = 3;
    /// Default number of partitions.
    pub const DEFAULT_NUM_PARTITIONS: usize = 4;
    /// Default storage directory.
    pub const DEFAULT_STORAGE_PATH: &'static str = "./data";
    /// Default optimistic restart bound.
    pub const DEFAULT_MAX_RESTARTS: usize = 100_000;

    /// Configuration with the given core settings and defaults for the rest.
    #[must_use]
    pub fn new(buffer_size: usize, num_partitions: usize, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            buffer_size,
            num_partitions,
            storage_path: storage_path.into(),
            strategy: SyncStrategy::default(),
            max_restarts: Self::DEFAULT_MAX_RESTARTS,
            sync_on_append: false,
        }
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    #[must_use]
    pub const fn with_sync_on_append(mut self, sync_on_append: bool) -> Self {
        self.sync_on_append = sync_on_append;
        self
    }

    /// Keys below this count make a non-root node underflow.
    #[must_use]
    pub const fn min_keys(&self) -> usize {
        self.buffer_size / 2
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is set but unparseable, or if the
    /// resulting configuration fails [`IndexConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let buffer_size =
            parse_or(&lookup, "BUFFERDB_BUFFER_SIZE", Self::DEFAULT_BUFFER_SIZE)?;
        let num_partitions =
            parse_or(&lookup, "BUFFERDB_NUM_PARTITIONS", Self::DEFAULT_NUM_PARTITIONS)?;
        let storage_path = lookup("BUFFERDB_STORAGE_PATH")
            .map_or_else(|| PathBuf::from(Self::DEFAULT_STORAGE_PATH), PathBuf::from);
        let strategy = parse_or(&lookup, "BUFFERDB_SYNC_STRATEGY", SyncStrategy::default())?;
        let max_restarts =
            parse_or(&lookup, "BUFFERDB_MAX_RESTARTS", Self::DEFAULT_MAX_RESTARTS)?;
        let sync_on_append = parse_or(&lookup, "BUFFERDB_SYNC_ON_APPEND", false)?;

        let config = Self {
            buffer_size,
            num_partitions,
            storage_path,
            strategy,
            max_restarts,
            sync_on_append,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that every setting is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < 2 {
            return Err(ConfigError::InvalidValue {
                name: "buffer_size".to_string(),
                message: format!("{} is too small (must be at least 2)", self.buffer_size),
            });
        }
        if self.num_partitions == 0 {
            return Err(ConfigError::InvalidValue {
                name: "num_partitions".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_restarts == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_restarts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}': {e}"),
            }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = IndexConfig::from_lookup(lookup_from(&[])).expect("defaults");
        assert_eq!(config.buffer_size, 3);
        assert_eq!(config.num_partitions, 4);
        assert_eq!(config.storage_path, PathBuf::from("./data"));
        assert_eq!(config.strategy, SyncStrategy::Coarse);
        assert_eq!(config.max_restarts, 100_000);
        assert!(!config.sync_on_append);
        assert_eq!(config.min_keys(), 1);
    }

    #[test]
    fn test_values_from_environment() {
        let config = IndexConfig::from_lookup(lookup_from(&[
            ("BUFFERDB_BUFFER_SIZE", "8"),
            ("BUFFERDB_NUM_PARTITIONS", "16"),
            ("BUFFERDB_STORAGE_PATH", "/tmp/index"),
            ("BUFFERDB_SYNC_STRATEGY", "optimistic"),
            ("BUFFERDB_MAX_RESTARTS", "50"),
            ("BUFFERDB_SYNC_ON_APPEND", "true"),
        ]))
        .expect("valid config");

        assert_eq!(config.buffer_size, 8);
        assert_eq!(config.num_partitions, 16);
        assert_eq!(config.storage_path, PathBuf::from("/tmp/index"));
        assert_eq!(config.strategy, SyncStrategy::Optimistic);
        assert_eq!(config.max_restarts, 50);
        assert!(config.sync_on_append);
        assert_eq!(config.min_keys(), 4);
    }

    #[test]
    fn test_unparseable_value() {
        let error = IndexConfig::from_lookup(lookup_from(&[("BUFFERDB_BUFFER_SIZE", "lots")]))
            .expect_err("should reject");
        let ConfigError::InvalidValue { name, message } = error;
        assert_eq!(name, "BUFFERDB_BUFFER_SIZE");
        assert!(message.contains("lots"));
    }

    #[test]
    fn test_unknown_strategy() {
        let result =
            IndexConfig::from_lookup(lookup_from(&[("BUFFERDB_SYNC_STRATEGY", "sharded")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validate_rejects_small_buffer() {
        let error = IndexConfig::new(1, 4, "./data")
            .validate()
            .expect_err("buffer size 1 is invalid");
        assert!(error.to_string().contains("buffer_size"));
    }

    #[test]
    fn test_validate_rejects_zero_partitions() {
        assert!(IndexConfig::new(3, 0, "./data").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_restarts() {
        let config = IndexConfig::new(3, 2, "./data").with_max_restarts(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_methods() {
        let config = IndexConfig::new(4, 2, "/var/lib/index")
            .with_strategy(SyncStrategy::Optimistic)
            .with_max_restarts(10)
            .with_sync_on_append(true);
        assert_eq!(config.strategy, SyncStrategy::Optimistic);
        assert_eq!(config.max_restarts, 10);
        assert!(config.sync_on_append);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_error_display_invalid() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}
