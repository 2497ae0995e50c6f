//! Pool configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Resource pool configuration.
///
/// Immutable once the pool is built.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Pool name, used in logs and metric labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Maximum total number of resources, both idle and borrowed.
    ///
    /// Default is 5. Values less than 1 are raised to 1.
    #[serde(default = "PoolConfig::default_max_size")]
    pub max_size: usize,
    /// Minimum number of idle resources kept ready in the pool.
    ///
    /// Default is 0. Never exceeds [`Self::max_size`].
    #[serde(default)]
    pub min_idle: usize,
    /// Time after which an unused idle resource is destroyed.
    ///
    /// Default is 30 seconds.
    #[serde(default = "PoolConfig::default_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Time after which a borrowed resource is considered abandoned and is destroyed.
    ///
    /// Default is 30 seconds.
    #[serde(default = "PoolConfig::default_timeout", with = "humantime_serde")]
    pub borrow_timeout: Duration,
    /// Interval between runs of pool maintenance.
    ///
    /// Default is 5 seconds.
    #[serde(
        default = "PoolConfig::default_maintenance_interval",
        alias = "janitor_interval",
        with = "humantime_serde"
    )]
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: None,
            max_size: Self::default_max_size(),
            min_idle: 0,
            idle_timeout: Self::default_timeout(),
            borrow_timeout: Self::default_timeout(),
            maintenance_interval: Self::default_maintenance_interval(),
        }
    }
}

impl PoolConfig {
    /// Default value for [`Self::max_size`].
    #[must_use]
    #[inline]
    fn default_max_size() -> usize {
        5
    }

    /// Default value for [`Self::idle_timeout`] and [`Self::borrow_timeout`].
    #[must_use]
    #[inline]
    fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// Default value for [`Self::maintenance_interval`].
    #[must_use]
    #[inline]
    fn default_maintenance_interval() -> Duration {
        Duration::from_secs(5)
    }

    /// Create builder for loading pool configuration from external sources.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Set pool name.
    #[must_use]
    pub fn with_name(mut self, name: impl ToString) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set maximum pool size.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set minimum number of idle resources.
    #[must_use]
    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Set idle resource timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set borrowed resource timeout.
    #[must_use]
    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_timeout = timeout;
        self
    }

    /// Set interval between maintenance runs.
    #[must_use]
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Name used in logs and metrics.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("default")
    }

    /// Check configuration and clamp sizes into allowed ranges.
    ///
    /// # Errors
    ///
    /// Returns `Err` if maintenance interval is zero.
    pub fn normalize(mut self) -> Result<Self, ConfigError> {
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("maintenance_interval"));
        }
        self.max_size = self.max_size.max(1);
        self.min_idle = self.min_idle.min(self.max_size);
        Ok(self)
    }
}

/// Builder for pool configuration.
///
/// Sources are layered in the order they were added; later sources override earlier ones.
#[must_use]
pub struct PoolConfigBuilder {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfigBuilder {
    /// Alternative method to construct a pool configuration builder.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
        }
    }

    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful, or if resulting values are
    /// invalid.
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        self.builder
            .build()?
            .try_deserialize::<PoolConfig>()?
            .normalize()
    }

    /// Add a custom object implementing [`Source`] trait as a source of pool configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of pool configuration.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add environment variables as a source of pool configuration.
    ///
    /// Variable names are made of the prefix, a double underscore and a field name, as in
    /// `DBPOOL__MAX_SIZE`.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(env_source(prefix.as_ref()))
    }
}

/// Environment source for a flat configuration struct.
///
/// No key separator is set, since field names contain underscores themselves.
fn env_source(prefix: &str) -> config::Environment {
    config::Environment::with_prefix(prefix).prefix_separator("__")
}
