//! Configuration for the ntopng exporter.
//!
//! Values come from built-in defaults, an optional JSON5 file, and the
//! environment variables the exporter has always honoured, in that order.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use nettel_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::backoff::RetryPolicy;
use crate::client::{BasicCredential, NtopngEndpoints};
use crate::enumerator::EnumerationPolicy;
use crate::http::RESERVED_PATHS;
use crate::metrics::TrackedMetric;
use crate::poller::{FixedHostname, HostnameSource, PollerSettings, SystemHostname};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] nettel_common::Error),
    #[error("Invalid value for {var}: {message}")]
    Env { var: String, message: String },
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// ntopng REST API settings.
    #[serde(default)]
    pub ntopng: NtopngConfig,

    /// Prometheus scrape endpoint settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Poll loop settings.
    #[serde(default)]
    pub poller: PollerConfig,

    /// Retry and back-off for upstream requests.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Shutdown behaviour.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// ntopng connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct NtopngConfig {
    /// Scheme and host, without port (default: "http://localhost").
    #[serde(default = "default_ntopng_url")]
    pub url: String,

    #[serde(default = "default_ntopng_port")]
    pub port: u16,

    #[serde(default = "default_credential")]
    pub username: String,

    #[serde(default = "default_credential")]
    pub password: String,
}

fn default_ntopng_url() -> String {
    "http://localhost".to_string()
}

fn default_ntopng_port() -> u16 {
    3000
}

fn default_credential() -> String {
    "admin".to_string()
}

impl Default for NtopngConfig {
    fn default() -> Self {
        Self {
            url: default_ntopng_url(),
            port: default_ntopng_port(),
            username: default_credential(),
            password: default_credential(),
        }
    }
}

impl std::fmt::Debug for NtopngConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtopngConfig")
            .field("url", &self.url)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl NtopngConfig {
    /// Base URL including the port, e.g. `http://localhost:3000`.
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.url.trim_end_matches('/'), self.port)
    }

    pub fn endpoints(&self) -> NtopngEndpoints {
        NtopngEndpoints::new(self.base_url())
    }

    pub fn credential(&self) -> BasicCredential {
        BasicCredential::new(&self.username, &self.password)
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to bind (default: "0.0.0.0").
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port to listen on (default: 8888).
    #[serde(default = "default_prometheus_port")]
    pub port: u16,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: "nettel").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_prometheus_port() -> u16 {
    8888
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "nettel".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_prometheus_port(),
            path: default_path(),
            prefix: default_prefix(),
        }
    }
}

impl PrometheusConfig {
    /// Socket address of the scrape endpoint.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.bind_address.parse().map_err(|_| {
            ConfigError::Validation(format!("Invalid bind address: {}", self.bind_address))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Replace bind address and port with `listen` ("host:port").
    pub fn set_listen(&mut self, listen: &str) -> Result<(), ConfigError> {
        let addr: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::Validation(format!("Invalid listen address: {}", listen)))?;
        self.bind_address = addr.ip().to_string();
        self.port = addr.port();
        Ok(())
    }
}

/// Poll loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Pause between poll cycles (seconds).
    #[serde(default = "default_idle_delay")]
    pub idle_delay_secs: u64,

    /// Behaviour when interfaces cannot be enumerated at startup.
    #[serde(default)]
    pub on_enumeration_failure: EnumerationPolicy,

    /// Value of the `hostname` label; "auto" resolves it on every update.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Counters to track.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<TrackedMetric>,
}

fn default_idle_delay() -> u64 {
    2
}

fn default_hostname() -> String {
    "auto".to_string()
}

fn default_metrics() -> Vec<TrackedMetric> {
    TrackedMetric::ALL.to_vec()
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            idle_delay_secs: default_idle_delay(),
            on_enumeration_failure: EnumerationPolicy::default(),
            hostname: default_hostname(),
            metrics: default_metrics(),
        }
    }
}

impl PollerConfig {
    pub fn settings(&self) -> PollerSettings {
        PollerSettings {
            metrics: self.metrics.clone(),
            idle_delay: Duration::from_secs(self.idle_delay_secs),
            enumeration_policy: self.on_enumeration_failure,
        }
    }

    pub fn hostname_source(&self) -> Box<dyn HostnameSource> {
        if self.hostname == "auto" {
            Box::new(SystemHostname)
        } else {
            Box::new(FixedHostname(self.hostname.clone()))
        }
    }
}

/// Retry configuration for upstream requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per request before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Back-off base (seconds).
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,

    /// Back-off multiplier per attempt.
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
}

fn default_max_attempts() -> u32 {
    40
}

fn default_base_delay() -> f64 {
    1.0
}

fn default_growth_factor() -> f64 {
    1.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            growth_factor: default_growth_factor(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> Result<RetryPolicy, ConfigError> {
        let base_delay = Duration::try_from_secs_f64(self.base_delay_secs).map_err(|e| {
            ConfigError::Validation(format!(
                "base_delay_secs {} is not a valid duration: {}",
                self.base_delay_secs, e
            ))
        })?;
        Ok(RetryPolicy::new(
            self.max_attempts,
            base_delay,
            self.growth_factor,
        ))
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for tasks after the shutdown signal (seconds).
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

fn default_grace_period() -> u64 {
    2
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ExporterConfig = nettel_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = nettel_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("NTOPNG_API_URL") {
            info!(NTOPNG_API_URL = %url, "Using ntopng URL from environment");
            self.ntopng.url = url;
        }
        if let Some(port) = lookup("NTOPNG_API_PORT") {
            info!(NTOPNG_API_PORT = %port, "Using ntopng port from environment");
            self.ntopng.port = parse_port("NTOPNG_API_PORT", &port)?;
        }
        if let Some(username) = lookup("NTOPNG_USERNAME") {
            info!(NTOPNG_USERNAME = %username, "Using ntopng username from environment");
            self.ntopng.username = username;
        }
        if let Some(password) = lookup("NTOPNG_PASSWORD") {
            info!("NTOPNG_PASSWORD set");
            self.ntopng.password = password;
        }
        if let Some(port) = lookup("PROMETHEUS_PORT") {
            info!(PROMETHEUS_PORT = %port, "Using scrape port from environment");
            self.prometheus.port = parse_port("PROMETHEUS_PORT", &port)?;
        }
        if let Some(path) = lookup("PROMETHEUS_ENDPOINT") {
            info!(PROMETHEUS_ENDPOINT = %path, "Using scrape path from environment");
            self.prometheus.path = path;
        }

        self.validate()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ntopng.url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "ntopng url must not be empty".to_string(),
            ));
        }

        if self.ntopng.port == 0 {
            return Err(ConfigError::Validation(
                "ntopng port must be > 0".to_string(),
            ));
        }

        if self.prometheus.port == 0 {
            return Err(ConfigError::Validation(
                "prometheus port must be > 0".to_string(),
            ));
        }

        self.prometheus.listen_addr()?;

        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.prometheus.path.contains([':', '*']) {
            return Err(ConfigError::Validation(
                "Metrics path must not contain route parameters".to_string(),
            ));
        }

        if RESERVED_PATHS.contains(&self.prometheus.path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} is reserved",
                self.prometheus.path
            )));
        }

        if self.poller.metrics.is_empty() {
            return Err(ConfigError::Validation(
                "At least one metric must be tracked".to_string(),
            ));
        }

        let mut metrics = self.poller.metrics.clone();
        metrics.sort();
        metrics.dedup();
        if metrics.len() != self.poller.metrics.len() {
            return Err(ConfigError::Validation(
                "Tracked metrics must not contain duplicates".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_attempts must be > 0".to_string(),
            ));
        }

        if !(self.retry.base_delay_secs.is_finite() && self.retry.base_delay_secs > 0.0) {
            return Err(ConfigError::Validation(
                "base_delay_secs must be > 0".to_string(),
            ));
        }
        self.retry.policy()?;

        if !(self.retry.growth_factor.is_finite() && self.retry.growth_factor >= 1.0) {
            return Err(ConfigError::Validation(
                "growth_factor must be >= 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_port(var: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|e| ConfigError::Env {
        var: var.to_string(),
        message: format!("{}: {}", value, e),
    })
}
