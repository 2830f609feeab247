//! Engine configuration.
//!
//! Configuration can be built in code or loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `TIDEKV_MIN_DEGREE`: B-tree minimum degree (default: `64`)
//! - `TIDEKV_IO_HANDLES`: pooled file handles for async I/O (default: `8`)
//! - `TIDEKV_ALLOCATOR_CAPACITY`: distinct free sizes remembered (default: `1024`)
//! - `TIDEKV_CACHE_CAPACITY`: front-cache entries, 0 disables (default: `128`)
//! - `TIDEKV_MAX_RECORD_SIZE`: largest encoded node or value in bytes (default: 16 MiB)
//!
//! # Invariants
//!
//! A config that passed [`EngineConfig::validate`] has `min_degree >= 2`,
//! `io_handles >= 1` and `allocator_capacity >= 1`.

use std::str::FromStr;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum degree `t`: non-root nodes hold between `t - 1` and `2t - 1` keys.
    pub min_degree: usize,
    /// Number of independent file handles used by background I/O.
    pub io_handles: usize,
    /// Bound on the allocator's size index.
    pub allocator_capacity: usize,
    /// Entries kept by the `AsyncDb` front cache.
    pub cache_capacity: usize,
    /// Upper bound on one encoded record; larger length fields read as corruption.
    pub max_record_size: u64,
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

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_degree: Self::DEFAULT_MIN_DEGREE,
            io_handles: Self::DEFAULT_IO_HANDLES,
            allocator_capacity: Self::DEFAULT_ALLOCATOR_CAPACITY,
            cache_capacity: Self::DEFAULT_CACHE_CAPACITY,
            max_record_size: Self::DEFAULT_MAX_RECORD_SIZE,
        }
    }
}

impl EngineConfig {
    pub const DEFAULT_MIN_DEGREE: usize = 64;
    pub const DEFAULT_IO_HANDLES: usize = 8;
    pub const DEFAULT_ALLOCATOR_CAPACITY: usize = 1024;
    pub const DEFAULT_CACHE_CAPACITY: usize = 128;
    pub const DEFAULT_MAX_RECORD_SIZE: u64 = 16 * 1024 * 1024;

    /// Set the B-tree minimum degree.
    #[must_use]
    pub const fn with_min_degree(mut self, min_degree: usize) -> Self {
        self.min_degree = min_degree;
        self
    }

    /// Set the size of the file handle pool.
    #[must_use]
    pub const fn with_io_handles(mut self, io_handles: usize) -> Self {
        self.io_handles = io_handles;
        self
    }

    /// Set the allocator's size-index capacity.
    #[must_use]
    pub const fn with_allocator_capacity(mut self, capacity: usize) -> Self {
        self.allocator_capacity = capacity;
        self
    }

    /// Set the front-cache capacity.
    #[must_use]
    pub const fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the largest accepted record size.
    #[must_use]
    pub const fn with_max_record_size(mut self, bytes: u64) -> Self {
        self.max_record_size = bytes;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse, or if the
    /// resulting config fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through `var`, which returns a variable's value or
    /// `None` when it is unset.
    pub fn from_vars<F: Fn(&str) -> Option<String>>(var: F) -> Result<Self, ConfigError> {
        let config = Self {
            min_degree: load(&var, "TIDEKV_MIN_DEGREE", Self::DEFAULT_MIN_DEGREE)?,
            io_handles: load(&var, "TIDEKV_IO_HANDLES", Self::DEFAULT_IO_HANDLES)?,
            allocator_capacity: load(
                &var,
                "TIDEKV_ALLOCATOR_CAPACITY",
                Self::DEFAULT_ALLOCATOR_CAPACITY,
            )?,
            cache_capacity: load(&var, "TIDEKV_CACHE_CAPACITY", Self::DEFAULT_CACHE_CAPACITY)?,
            max_record_size: load(&var, "TIDEKV_MAX_RECORD_SIZE", Self::DEFAULT_MAX_RECORD_SIZE)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the bounds every engine component relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_degree < 2 {
            return Err(invalid("min_degree", "must be at least 2"));
        }
        if self.io_handles == 0 {
            return Err(invalid("io_handles", "must be at least 1"));
        }
        if self.allocator_capacity == 0 {
            return Err(invalid("allocator_capacity", "must be at least 1"));
        }
        if self.max_record_size == 0 || self.max_record_size > u64::from(u32::MAX) {
            return Err(invalid("max_record_size", "must be between 1 and 4 GiB"));
        }
        Ok(())
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}

/// Read and parse one variable, or return the default if unset.
fn load<T: FromStr>(
    var: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a valid number"),
        }),
        None => Ok(default),
    }
}
