//! Runtime and server configuration.
//!
//! Both structs follow the same shape: `Default` carries production values,
//! `with_*` setters chain, and `validate()` is called once by the component
//! that consumes the config.

use std::net::SocketAddr;
use std::time::Duration;
use vesper_common::{DEFAULT_POOL_CAPACITY, Result, VesperError};

/// Default number of concurrent outbound calls a single request may make.
pub const DEFAULT_OUTBOUND_LIMIT: usize = 10;

/// Default cap on request and outbound response bodies read into memory.
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Default number of iterations a single loop may run before Boa aborts it.
pub const DEFAULT_MAX_LOOP_ITERATIONS: u64 = 1_000_000;

/// Configuration of the shard fleet and everything it creates per request.
///
/// # Example
///
/// ```
/// use vesper_server::RuntimeConfig;
/// use std::time::Duration;
///
/// let config = RuntimeConfig::new()
///     .with_shards(4)
///     .with_outbound_limit(16)
///     .with_fetch_timeout(Duration::from_secs(5));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Number of interpreter shards
    pub shards: usize,
    /// Weighted admission limit for outbound calls, per request
    pub outbound_limit: usize,
    /// Capacity of every object pool the runtime creates
    pub pool_capacity: usize,
    /// Timeout applied to each outbound fetch
    pub fetch_timeout: Duration,
    /// Boa loop iteration limit; `None` lets a synchronous loop run forever
    pub max_loop_iterations: Option<u64>,
    /// Maximum number of body bytes buffered for a script
    pub max_body_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            shards,
            outbound_limit: DEFAULT_OUTBOUND_LIMIT,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            fetch_timeout: Duration::from_secs(10),
            max_loop_iterations: Some(DEFAULT_MAX_LOOP_ITERATIONS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_outbound_limit(mut self, limit: usize) -> Self {
        self.outbound_limit = limit;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_max_loop_iterations(mut self, iterations: u64) -> Self {
        self.max_loop_iterations = Some(iterations);
        self
    }

    /// Removes the loop limit. A handler stuck in a synchronous loop then
    /// survives an interrupting reload.
    pub fn without_loop_limit(mut self) -> Self {
        self.max_loop_iterations = None;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `VesperError::InvalidConfig` if:
    /// - `shards` is zero or larger than 1024
    /// - `outbound_limit` or `pool_capacity` is zero
    /// - `fetch_timeout` is zero or longer than one hour
    /// - `max_loop_iterations` is `Some(0)`
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 || self.shards > 1024 {
            return Err(VesperError::InvalidConfig(format!(
                "shards must be between 1 and 1024 (got {})",
                self.shards
            )));
        }
        if self.outbound_limit == 0 {
            return Err(VesperError::InvalidConfig(
                "outbound limit must be greater than zero".into(),
            ));
        }
        if self.pool_capacity == 0 {
            return Err(VesperError::InvalidConfig(
                "pool capacity must be greater than zero".into(),
            ));
        }
        if self.fetch_timeout.is_zero() || self.fetch_timeout > Duration::from_secs(3600) {
            return Err(VesperError::InvalidConfig(format!(
                "fetch timeout must be between 1ms and 1 hour (got {}ms)",
                self.fetch_timeout.as_millis()
            )));
        }
        if self.max_loop_iterations == Some(0) {
            return Err(VesperError::InvalidConfig(
                "loop iteration limit must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of the HTTP front end.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Path prefix of the admin endpoints (reload, metrics, info)
    pub admin_prefix: String,
    pub admin_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            admin_prefix: "/_vesper".to_string(),
            admin_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Self::default()
        }
    }

    pub fn with_admin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.admin_prefix = prefix.into();
        self
    }

    pub fn without_admin(mut self) -> Self {
        self.admin_enabled = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let prefix = &self.admin_prefix;
        if self.admin_enabled
            && (!prefix.starts_with('/') || prefix.len() < 2 || prefix.ends_with('/'))
        {
            return Err(VesperError::InvalidConfig(format!(
                "admin prefix must look like /name (got {:?})",
                self.admin_prefix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_runtime_config() {
        let config = RuntimeConfig::default();
        assert!(config.shards >= 1);
        assert_eq!(config.outbound_limit, 10);
        assert_eq!(config.pool_capacity, 2048);
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.max_loop_iterations, Some(DEFAULT_MAX_LOOP_ITERATIONS));
        assert!(config.validate().is_ok());
        assert_eq!(config.without_loop_limit().max_loop_iterations, None);
    }

    #[test]
    fn test_builder_chaining() {
        let config = RuntimeConfig::new()
            .with_shards(3)
            .with_outbound_limit(2)
            .with_pool_capacity(8)
            .with_max_loop_iterations(50_000)
            .with_max_body_bytes(1024);

        assert_eq!(config.shards, 3);
        assert_eq!(config.outbound_limit, 2);
        assert_eq!(config.pool_capacity, 8);
        assert_eq!(config.max_loop_iterations, Some(50_000));
        assert_eq!(config.max_body_bytes, 1024);
    }

    #[test]
    fn test_validate_rejects_zero_shards() {
        let err = RuntimeConfig::new().with_shards(0).validate().unwrap_err();
        assert!(err.to_string().contains("shards"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        assert!(RuntimeConfig::new().with_outbound_limit(0).validate().is_err());
        assert!(RuntimeConfig::new().with_pool_capacity(0).validate().is_err());
        assert!(RuntimeConfig::new().with_max_loop_iterations(0).validate().is_err());
    }

    #[test]
    fn test_validate_fetch_timeout_bounds() {
        assert!(RuntimeConfig::new().with_fetch_timeout(Duration::ZERO).validate().is_err());
        assert!(RuntimeConfig::new()
            .with_fetch_timeout(Duration::from_secs(7200))
            .validate()
            .is_err());
    }

    #[test]
    fn test_server_config_prefix_validation() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(ServerConfig::new(addr).validate().is_ok());
        assert!(ServerConfig::new(addr).with_admin_prefix("admin").validate().is_err());
        assert!(ServerConfig::new(addr).with_admin_prefix("/admin/").validate().is_err());
        assert!(ServerConfig::new(addr).with_admin_prefix("bad").without_admin().validate().is_ok());
    }
}
