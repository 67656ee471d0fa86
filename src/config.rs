//! Runtime configuration.
//!
//! Process-wide settings come from the environment (`REDIS_URL`, `APP_ENV`
//! or `NODE_ENV`, `APTOS_NETWORK`, `GIT_HASH`), usually through the CLI's `env` fallbacks.
//! Component configs follow the `Default` + `with_*` builder convention.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default Redis connection URL.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default CoinGecko API base URL.
pub const DEFAULT_COINGECKO_URL: &str = "https://api.coingecko.com/api/v3";

/// Aptos network whose fullnode REST API the daemons poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AptosNetwork {
    Mainnet,
    Testnet,
    Devnet,
    /// Explicit fullnode base URL, e.g. a local node.
    Custom(String),
}

impl AptosNetwork {
    /// Base URL of the fullnode REST API, without a trailing slash.
    pub fn base_url(&self) -> &str {
        match self {
            AptosNetwork::Mainnet => "https://fullnode.mainnet.aptoslabs.com/v1",
            AptosNetwork::Testnet => "https://fullnode.testnet.aptoslabs.com/v1",
            AptosNetwork::Devnet => "https://fullnode.devnet.aptoslabs.com/v1",
            AptosNetwork::Custom(url) => url.trim_end_matches('/'),
        }
    }
}

impl fmt::Display for AptosNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AptosNetwork::Mainnet => write!(f, "mainnet"),
            AptosNetwork::Testnet => write!(f, "testnet"),
            AptosNetwork::Devnet => write!(f, "devnet"),
            AptosNetwork::Custom(url) => write!(f, "{}", url),
        }
    }
}

impl FromStr for AptosNetwork {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(AptosNetwork::Mainnet),
            "testnet" => Ok(AptosNetwork::Testnet),
            "devnet" => Ok(AptosNetwork::Devnet),
            _ if trimmed.starts_with("http://") || trimmed.starts_with("https://") => {
                Ok(AptosNetwork::Custom(trimmed.to_string()))
            }
            _ => Err(ConfigError::UnknownNetwork(trimmed.to_string())),
        }
    }
}

/// Process-wide configuration shared by every component.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Deployment environment name ("production", "development", ...).
    pub environment: String,
    /// Network the daemons observe.
    pub network: AptosNetwork,
    /// Build identifier reported in monitoring snapshots.
    pub git_hash: Option<String>,
    /// CoinGecko API base URL.
    pub coingecko_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            environment: "development".to_string(),
            network: AptosNetwork::Mainnet,
            git_hash: None,
            coingecko_url: DEFAULT_COINGECKO_URL.to_string(),
        }
    }
}

impl AppConfig {
    /// Reads the configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(env) = environment_name(
            std::env::var("APP_ENV").ok(),
            std::env::var("NODE_ENV").ok(),
        ) {
            config.environment = env;
        }
        if let Ok(network) = std::env::var("APTOS_NETWORK") {
            config.network = network.parse()?;
        }
        config.git_hash = std::env::var("GIT_HASH").ok().filter(|h| !h.is_empty());
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would only fail later, at connect time.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheme_ok = ["redis://", "rediss://", "unix://", "redis+unix://"]
            .iter()
            .any(|scheme| self.redis_url.starts_with(scheme));
        if !scheme_ok {
            return Err(ConfigError::InvalidValue {
                name: "REDIS_URL".to_string(),
                reason: format!("'{}' is not a redis:// URL", self.redis_url),
            });
        }
        if !(self.coingecko_url.starts_with("http://") || self.coingecko_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                name: "coingecko_url".to_string(),
                reason: format!("'{}' is not an http(s) URL", self.coingecko_url),
            });
        }
        Ok(())
    }

    /// Returns whether this is a production deployment.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the environment name.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Sets the observed network.
    pub fn with_network(mut self, network: AptosNetwork) -> Self {
        self.network = network;
        self
    }

    /// Sets the git hash.
    pub fn with_git_hash(mut self, git_hash: impl Into<String>) -> Self {
        self.git_hash = Some(git_hash.into());
        self
    }

    /// Sets the CoinGecko API base URL.
    pub fn with_coingecko_url(mut self, url: impl Into<String>) -> Self {
        self.coingecko_url = url.into();
        self
    }
}

/// `APP_ENV` wins over the legacy `NODE_ENV`; blank values are ignored.
fn environment_name(app_env: Option<String>, node_env: Option<String>) -> Option<String> {
    app_env
        .into_iter()
        .chain(node_env)
        .map(|env| env.trim().to_string())
        .find(|env| !env.is_empty())
}

/// Configuration for the rate-limited request broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum requests inside the per-second window.
    pub max_requests_per_second: usize,
    /// Maximum requests inside the quota window.
    pub max_requests_per_quota_window: usize,
    /// Length of the quota window.
    pub quota_window: Duration,
    /// How long an identical URL is served from the in-flight entry.
    pub dedup_window: Duration,
    /// Local timeout for a submitted request.
    pub request_timeout: Duration,
    /// How often stats are persisted and stale state is pruned.
    pub stats_interval: Duration,
    /// Blocking-pop timeout of the response listener.
    pub response_poll_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 8,
            max_requests_per_quota_window: 4000,
            quota_window: Duration::from_secs(300),
            dedup_window: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            stats_interval: Duration::from_secs(1),
            response_poll_timeout: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    /// Sets the per-second cap.
    pub fn with_max_requests_per_second(mut self, limit: usize) -> Self {
        self.max_requests_per_second = limit;
        self
    }

    /// Sets the quota cap and its window.
    pub fn with_quota(mut self, limit: usize, window: Duration) -> Self {
        self.max_requests_per_quota_window = limit;
        self.quota_window = window;
        self
    }

    /// Sets the dedup window.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Sets the local request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the stats interval.
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }
}

/// Configuration for the request processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Blocking-pop timeout on the request queue.
    pub poll_timeout: Duration,
    /// Delays between 429 retries; its length bounds the retry count.
    pub retry_delays: Vec<Duration>,
    /// Per-attempt HTTP timeout.
    pub fetch_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            fetch_timeout: Duration::from_secs(15),
        }
    }
}

impl ProcessorConfig {
    /// Sets the poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the retry delay table.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Sets the per-attempt fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

/// Configuration shared by daemon runners.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Blocking-pop timeout on the daemon's response queue.
    pub response_poll_timeout: Duration,
    /// Local timeout for a queued request.
    pub request_timeout: Duration,
    /// Time allowed for the loops to stop.
    pub shutdown_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            response_poll_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    /// Sets the response poll timeout.
    pub fn with_response_poll_timeout(mut self, timeout: Duration) -> Self {
        self.response_poll_timeout = timeout;
        self
    }

    /// Sets the local request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        assert_eq!("mainnet".parse::<AptosNetwork>().unwrap(), AptosNetwork::Mainnet);
        assert_eq!("TESTNET".parse::<AptosNetwork>().unwrap(), AptosNetwork::Testnet);
        assert_eq!(
            "http://localhost:8080/v1/".parse::<AptosNetwork>().unwrap(),
            AptosNetwork::Custom("http://localhost:8080/v1/".to_string())
        );
        assert!("moonnet".parse::<AptosNetwork>().is_err());
    }

    #[test]
    fn test_custom_base_url_strips_trailing_slash() {
        let network = AptosNetwork::Custom("http://localhost:8080/v1/".to_string());
        assert_eq!(network.base_url(), "http://localhost:8080/v1");
    }

    #[test]
    fn test_broker_config_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.max_requests_per_second, 8);
        assert_eq!(config.max_requests_per_quota_window, 4000);
        assert_eq!(config.quota_window, Duration::from_secs(300));
        assert_eq!(config.dedup_window, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_processor_config_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
        assert_eq!(
            config.retry_delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5)
            ]
        );
        assert_eq!(config.fetch_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_app_config_builder() {
        let config = AppConfig::default()
            .with_redis_url("redis://cache:6380")
            .with_environment("production")
            .with_network(AptosNetwork::Testnet)
            .with_git_hash("abc123");

        assert_eq!(config.redis_url, "redis://cache:6380");
        assert!(config.is_production());
        assert_eq!(config.network.base_url(), "https://fullnode.testnet.aptoslabs.com/v1");
        assert_eq!(config.git_hash.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_environment_name_prefers_app_env() {
        let some = |s: &str| Some(s.to_string());
        assert_eq!(environment_name(some("staging"), some("production")), some("staging"));
        assert_eq!(environment_name(None, some("production")), some("production"));
        assert_eq!(environment_name(some("  "), some("production")), some("production"));
        assert_eq!(environment_name(None, None), None);
    }

    #[test]
    fn test_validate_rejects_non_redis_url() {
        assert!(AppConfig::default().validate().is_ok());
        assert!(AppConfig::default()
            .with_redis_url("rediss://cache:6380/0")
            .validate()
            .is_ok());

        let err = AppConfig::default()
            .with_redis_url("localhost:6379")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name == "REDIS_URL"));
    }
}
