//! Configuration management for the hermes daemon.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hermes_core::Destination;
use hermes_delivery::{
    BackoffStrategy, CircuitConfig, ClientConfig, GitConfig, IdempotencyConfig, RelayConfig,
    RetryPolicy, Route, RoutingConfig, RoutingTable,
};
use serde::{Deserialize, Serialize};

/// Default configuration file, relative to the working directory.
pub const CONFIG_FILE: &str = "hermes.toml";

/// Environment variable naming an alternative configuration file.
pub const CONFIG_PATH_ENV: &str = "HERMES_CONFIG";

/// Prefix of environment overrides. Nested keys are separated by `__`,
/// e.g. `HERMES_SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "HERMES_";

/// Complete daemon configuration.
///
/// Configuration is loaded in priority order:
/// 1. `HERMES_`-prefixed environment variables (highest priority)
/// 2. Configuration file (`hermes.toml`, or the path in `$HERMES_CONFIG`)
/// 3. Built-in defaults (lowest priority)
///
/// The routing table lives in the same file as `[[destinations]]` and
/// `[[routes]]` tables. Without any routes the relay rejects every event
/// with `NoRoute`.
///
/// # Example
///
/// ```no_run
/// use hermes_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.server.host, config.server.port);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP ingress settings.
    pub server: ServerSettings,
    /// Admission limits and dedupe window.
    pub relay: RelaySettings,
    /// Default retry policy.
    pub retry: RetrySettings,
    /// Circuit breaker thresholds.
    pub circuit: CircuitSettings,
    /// Outbound delivery client.
    pub client: ClientSettings,
    /// SSH git mirror transport.
    pub git: GitSettings,
    /// Known destinations.
    pub destinations: Vec<Destination>,
    /// Ordered routing rules.
    pub routes: Vec<Route>,
}

/// HTTP ingress settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Largest accepted request body in bytes.
    pub max_payload_bytes: usize,
    /// Shared secret for inbound HMAC signatures. Unsigned requests are
    /// accepted when unset.
    #[serde(skip_serializing)]
    pub inbound_secret: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            max_payload_bytes: 10 * 1024 * 1024,
            inbound_secret: None,
        }
    }
}

/// Admission limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Events accepted but not yet completed.
    pub max_in_flight: usize,
    /// Bound of each destination queue.
    pub queue_depth: usize,
    /// Longest wait for all branches of one event, in seconds.
    pub completion_timeout_secs: u64,
    /// Longest wait for workers to drain on shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Remembered idempotency keys. Zero disables deduplication.
    pub dedupe_capacity: usize,
    /// How long an idempotency key is remembered, in seconds.
    pub dedupe_window_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            max_in_flight: relay.max_in_flight,
            queue_depth: relay.queue_depth,
            completion_timeout_secs: relay.completion_timeout.as_secs(),
            shutdown_timeout_secs: relay.shutdown_timeout.as_secs(),
            dedupe_capacity: relay.idempotency.capacity,
            dedupe_window_secs: relay.idempotency.ttl.as_secs(),
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per destination, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on any single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Additive jitter factor in `[0.0, 1.0)`.
    pub jitter_factor: f64,
    /// Total budget across all attempts in seconds.
    pub max_elapsed_secs: u64,
    /// Cap on a destination's `Retry-After` hint in seconds.
    pub max_retry_after_secs: u64,
    /// Delay growth.
    pub backoff: BackoffStrategy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: duration_ms(policy.base_delay),
            max_delay_ms: duration_ms(policy.max_delay),
            jitter_factor: policy.jitter_factor,
            max_elapsed_secs: policy.max_elapsed.as_secs(),
            max_retry_after_secs: policy.max_retry_after.as_secs(),
            backoff: policy.backoff_strategy,
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    /// Consecutive transient failures that open a circuit.
    pub failure_threshold: u32,
    /// Initial open period in seconds.
    pub cooldown_secs: u64,
    /// Cap for the doubled open period in seconds.
    pub max_cooldown_secs: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        let circuit = CircuitConfig::default();
        Self {
            failure_threshold: circuit.failure_threshold,
            cooldown_secs: circuit.cooldown.as_secs(),
            max_cooldown_secs: circuit.max_cooldown.as_secs(),
        }
    }
}

/// Delivery client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// User agent for HTTPS deliveries.
    pub user_agent: String,
    /// Accept plain `http://` destinations.
    pub allow_insecure_http: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            timeout_ms: duration_ms(client.timeout),
            user_agent: client.user_agent,
            allow_insecure_http: client.allow_insecure_http,
        }
    }
}

/// SSH git transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    /// Directory holding one mirror per destination.
    pub mirror_root: PathBuf,
    /// Private key for ssh. The ssh agent is used when unset.
    pub identity_file: Option<PathBuf>,
    /// Trust any host key instead of checking `known_hosts`.
    pub skip_host_key_check: bool,
}

impl Default for GitSettings {
    fn default() -> Self {
        let git = GitConfig::default();
        Self {
            mirror_root: git.mirror_root,
            identity_file: git.identity_file,
            skip_host_key_check: git.skip_host_key_check,
        }
    }
}

impl Config {
    /// Loads configuration from defaults, the configuration file and
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the merged
    /// configuration fails validation.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from);
        Self::from_figment(Self::figment(&path))
    }

    /// Layered providers for a given configuration file.
    ///
    /// A missing file is not an error; it simply contributes nothing.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config", "log_format"]).split("__"))
    }

    /// Extracts and validates configuration from arbitrary providers.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts to the relay's configuration.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_in_flight: self.relay.max_in_flight,
            queue_depth: self.relay.queue_depth,
            completion_timeout: Duration::from_secs(self.relay.completion_timeout_secs),
            shutdown_timeout: self.shutdown_timeout(),
            idempotency: IdempotencyConfig {
                capacity: self.relay.dedupe_capacity,
                ttl: Duration::from_secs(self.relay.dedupe_window_secs),
            },
            retry: self.retry_policy(),
            circuit: self.circuit_config(),
        }
    }

    /// Converts to the default retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter_factor: self.retry.jitter_factor,
            max_elapsed: Duration::from_secs(self.retry.max_elapsed_secs),
            max_retry_after: Duration::from_secs(self.retry.max_retry_after_secs),
            backoff_strategy: self.retry.backoff,
        }
    }

    /// Converts to circuit breaker configuration.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit.failure_threshold,
            cooldown: Duration::from_secs(self.circuit.cooldown_secs),
            max_cooldown: Duration::from_secs(self.circuit.max_cooldown_secs),
        }
    }

    /// Converts to delivery client configuration.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_millis(self.client.timeout_ms),
            user_agent: self.client.user_agent.clone(),
            allow_insecure_http: self.client.allow_insecure_http,
        }
    }

    /// Converts to git transport configuration.
    pub fn git_config(&self) -> GitConfig {
        GitConfig {
            mirror_root: self.git.mirror_root.clone(),
            identity_file: self.git.identity_file.clone(),
            skip_host_key_check: self.git.skip_host_key_check,
        }
    }

    /// Destinations and routes as loaded.
    pub fn routing_config(&self) -> RoutingConfig {
        RoutingConfig { destinations: self.destinations.clone(), routes: self.routes.clone() }
    }

    /// Builds the immutable routing table.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate destinations, routes naming unknown
    /// destinations and empty routes.
    pub fn routing_table(&self) -> Result<RoutingTable> {
        RoutingTable::build(self.routing_config()).context("invalid routing configuration")
    }

    /// Longest wait for the relay to drain on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.shutdown_timeout_secs)
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Parses the server socket address from host and port.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn server_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        SocketAddr::from_str(&addr).context("invalid server address")
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns the first nonsensical value found.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be greater than 0");
        }

        if self.server.max_payload_bytes == 0 {
            anyhow::bail!("server.max_payload_bytes must be greater than 0");
        }

        if self.server.inbound_secret.as_deref().is_some_and(|s| s.trim().is_empty()) {
            anyhow::bail!("server.inbound_secret must not be empty when set");
        }

        if self.relay.max_in_flight == 0 {
            anyhow::bail!("relay.max_in_flight must be greater than 0");
        }

        if self.relay.queue_depth == 0 {
            anyhow::bail!("relay.queue_depth must be greater than 0");
        }

        if self.relay.completion_timeout_secs == 0 {
            anyhow::bail!("relay.completion_timeout_secs must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be greater than 0");
        }

        if !(0.0..1.0).contains(&self.retry.jitter_factor) {
            anyhow::bail!("retry.jitter_factor must be in [0.0, 1.0)");
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.base_delay_ms cannot exceed retry.max_delay_ms");
        }

        if self.retry.max_elapsed_secs == 0 {
            anyhow::bail!("retry.max_elapsed_secs must be greater than 0");
        }

        if self.retry.max_elapsed_secs >= self.relay.completion_timeout_secs {
            anyhow::bail!("retry.max_elapsed_secs must be less than relay.completion_timeout_secs");
        }

        if self.retry.max_retry_after_secs == 0 {
            anyhow::bail!("retry.max_retry_after_secs must be greater than 0");
        }

        if self.circuit.failure_threshold == 0 {
            anyhow::bail!("circuit.failure_threshold must be greater than 0");
        }

        if self.circuit.cooldown_secs == 0 {
            anyhow::bail!("circuit.cooldown_secs must be greater than 0");
        }

        if self.circuit.cooldown_secs > self.circuit.max_cooldown_secs {
            anyhow::bail!("circuit.cooldown_secs cannot exceed circuit.max_cooldown_secs");
        }

        if self.client.timeout_ms == 0 {
            anyhow::bail!("client.timeout_ms must be greater than 0");
        }

        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
