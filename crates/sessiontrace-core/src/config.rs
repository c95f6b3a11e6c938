//! Configuration system for SessionTrace
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard path)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation into typed, immutable [`PipelineSettings`]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

/// Environment variable pointing at a config file
pub const CONFIG_ENV: &str = "SESSIONTRACE_CONFIG";

/// System-wide config file location
pub const SYSTEM_CONFIG_PATH: &str = "/etc/sessiontrace/config.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

/// Complete service configuration, as written in TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service settings
    pub service: ServiceSettings,

    /// Ingestion listener settings
    pub listener: ListenerSettings,

    /// Queue, worker and batching settings
    pub pipeline: ProcessingSettings,

    /// Span export settings
    pub export: ExportSettings,

    /// Circuit breaker settings
    pub breaker: BreakerSettings,

    /// Correlation store settings
    pub correlation: CorrelationSettings,

    /// Self-observability endpoint settings
    pub metrics: MetricsSettings,
}

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Verbose logging
    pub debug_mode: bool,

    /// `service.name` for spans without a process type
    pub service_name: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            debug_mode: false,
            service_name: "unknown-service".to_string(),
        }
    }
}

/// Ingestion listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Longest accepted frame, newline excluded
    pub max_frame_bytes: usize,

    /// How long a producer waits for queue space (seconds)
    pub enqueue_timeout_secs: f64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_frame_bytes: 1024 * 1024,
            enqueue_timeout_secs: 0.05,
        }
    }
}

/// Queue, worker and batching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Number of workers
    pub worker_count: usize,

    /// Queue capacity
    pub queue_maxsize: usize,

    /// Spans per batch
    pub batch_size: usize,

    /// Maximum age of an open batch (seconds)
    pub batch_timeout_secs: f64,

    /// Concurrent exporter tasks
    pub export_concurrency: usize,

    /// Sealed batches waiting for an exporter task
    pub export_queue_capacity: usize,

    /// Drain time on shutdown (seconds)
    pub shutdown_grace_secs: f64,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            worker_count: 8,
            queue_maxsize: 10_000,
            batch_size: 200,
            batch_timeout_secs: 0.2,
            export_concurrency: 2,
            export_queue_capacity: 16,
            shutdown_grace_secs: 10.0,
        }
    }
}

/// Span export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// OTLP/HTTP traces endpoint
    pub endpoint: String,

    /// Per-request timeout (seconds)
    pub timeout_secs: f64,

    /// Local retries for transient failures
    pub max_retries: u32,

    /// First retry delay, doubled per attempt (seconds)
    pub retry_backoff_secs: f64,

    /// Extra headers sent with every request
    pub headers: BTreeMap<String, String>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://jaeger:4318/v1/traces".to_string(),
            timeout_secs: 5.0,
            max_retries: 2,
            retry_backoff_secs: 0.5,
            headers: BTreeMap::new(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failed exports that open the breaker
    pub failure_threshold: u32,

    /// How long the breaker stays open (seconds)
    pub cooldown_secs: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30.0,
        }
    }
}

/// Correlation store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSettings {
    /// Store base URL; empty disables the side channel
    pub url: String,

    /// API token
    pub token: String,

    /// Organization
    pub org: String,

    /// Bucket
    pub bucket: String,

    /// Records buffered before new ones are dropped
    pub buffer: usize,

    /// Records per write
    pub batch_size: usize,

    /// Maximum time between writes (seconds)
    pub flush_interval_secs: f64,

    /// Per-request timeout (seconds)
    pub timeout_secs: f64,

    /// Measurement for logon records
    pub logon_measurement: String,

    /// Measurement for logoff records
    pub logoff_measurement: String,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            url: "http://victoriametrics:8428".to_string(),
            token: String::new(),
            org: String::new(),
            bucket: "traces".to_string(),
            buffer: 10_000,
            batch_size: 1_000,
            flush_interval_secs: 1.0,
            timeout_secs: 5.0,
            logon_measurement: "uberAgent:logonTraceMap".to_string(),
            logoff_measurement: "uberAgent:logoffTraceMap".to_string(),
        }
    }
}

/// Self-observability endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ServiceConfig {
    /// Copy with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.correlation.token.is_empty() {
            copy.correlation.token = "********".to_string();
        }
        for (name, value) in copy.export.headers.iter_mut() {
            let lower = name.to_ascii_lowercase();
            if lower.contains("authorization") || lower.contains("key") || lower.contains("token") {
                *value = "********".to_string();
            }
        }
        copy
    }

    /// Render as TOML
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| invalid(format!("Failed to serialize config: {}", e)))
    }

    /// Check every value and build the typed settings
    pub fn validate(&self) -> ConfigResult<PipelineSettings> {
        let listen_addr = resolve("listener", &self.listener.host, self.listener.port)?;
        let metrics_addr = resolve("metrics", &self.metrics.host, self.metrics.port)?;
        if listen_addr.port() != 0 && listen_addr == metrics_addr {
            return Err(invalid(format!(
                "Listener and metrics endpoint both bind {}",
                listen_addr
            )));
        }

        if self.listener.max_frame_bytes < 64 {
            return Err(invalid("max_frame_bytes must be at least 64"));
        }

        let p = &self.pipeline;
        at_least_one("worker_count", p.worker_count)?;
        at_least_one("queue_maxsize", p.queue_maxsize)?;
        at_least_one("batch_size", p.batch_size)?;
        at_least_one("export_concurrency", p.export_concurrency)?;
        at_least_one("export_queue_capacity", p.export_queue_capacity)?;

        let export_endpoint = http_url("export endpoint", &self.export.endpoint)?;
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker failure_threshold must be at least 1"));
        }

        let mut export_headers = Vec::with_capacity(self.export.headers.len());
        for (name, value) in &self.export.headers {
            if name.trim().is_empty() {
                return Err(invalid("export header names cannot be empty"));
            }
            export_headers.push((name.trim().to_string(), value.clone()));
        }

        if self.service.service_name.trim().is_empty() {
            return Err(invalid("service_name cannot be empty"));
        }

        let correlation = if self.correlation.url.trim().is_empty() {
            None
        } else {
            let c = &self.correlation;
            at_least_one("correlation buffer", c.buffer)?;
            at_least_one("correlation batch_size", c.batch_size)?;
            if c.bucket.trim().is_empty() {
                return Err(invalid("correlation bucket cannot be empty"));
            }
            Some(CorrelationStoreSettings {
                url: http_url("correlation store url", &c.url)?,
                token: Some(c.token.clone()).filter(|t| !t.is_empty()),
                org: c.org.clone(),
                bucket: c.bucket.clone(),
                buffer: c.buffer,
                batch_size: c.batch_size,
                flush_interval: positive_secs("correlation flush_interval_secs", c.flush_interval_secs)?,
                timeout: positive_secs("correlation timeout_secs", c.timeout_secs)?,
                logon_measurement: c.logon_measurement.clone(),
                logoff_measurement: c.logoff_measurement.clone(),
            })
        };

        Ok(PipelineSettings {
            debug_mode: self.service.debug_mode,
            service_name: self.service.service_name.trim().to_string(),
            listen_addr,
            max_frame_bytes: self.listener.max_frame_bytes,
            enqueue_timeout: non_negative_secs("enqueue_timeout_secs", self.listener.enqueue_timeout_secs)?,
            metrics_addr,
            worker_count: p.worker_count,
            queue_capacity: p.queue_maxsize,
            batch_size: p.batch_size,
            batch_timeout: positive_secs("batch_timeout_secs", p.batch_timeout_secs)?,
            export_concurrency: p.export_concurrency,
            export_queue_capacity: p.export_queue_capacity,
            shutdown_grace: non_negative_secs("shutdown_grace_secs", p.shutdown_grace_secs)?,
            export_endpoint,
            export_timeout: positive_secs("export timeout_secs", self.export.timeout_secs)?,
            export_max_retries: self.export.max_retries,
            export_retry_backoff: non_negative_secs(
                "export retry_backoff_secs",
                self.export.retry_backoff_secs,
            )?,
            export_headers,
            breaker_failure_threshold: self.breaker.failure_threshold,
            breaker_cooldown: positive_secs("breaker cooldown_secs", self.breaker.cooldown_secs)?,
            correlation,
        })
    }
}

/// Validated, typed configuration used to build the service
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub debug_mode: bool,
    pub service_name: String,

    pub listen_addr: SocketAddr,
    pub max_frame_bytes: usize,
    pub enqueue_timeout: Duration,
    pub metrics_addr: SocketAddr,

    pub worker_count: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub export_concurrency: usize,
    pub export_queue_capacity: usize,
    pub shutdown_grace: Duration,

    pub export_endpoint: Url,
    pub export_timeout: Duration,
    pub export_max_retries: u32,
    pub export_retry_backoff: Duration,
    pub export_headers: Vec<(String, String)>,

    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,

    /// `None` when the side channel is disabled
    pub correlation: Option<CorrelationStoreSettings>,
}

/// Validated correlation store settings
#[derive(Debug, Clone)]
pub struct CorrelationStoreSettings {
    pub url: Url,
    pub token: Option<String>,
    pub org: String,
    pub bucket: String,
    pub buffer: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub timeout: Duration,
    pub logon_measurement: String,
    pub logoff_measurement: String,
}

fn resolve(what: &str, host: &str, port: u16) -> ConfigResult<SocketAddr> {
    if host.trim().is_empty() {
        return Err(invalid(format!("{} host cannot be empty", what)));
    }
    (host.trim(), port)
        .to_socket_addrs()
        .map_err(|e| invalid(format!("{} address {}:{}: {}", what, host, port, e)))?
        .next()
        .ok_or_else(|| invalid(format!("{} address {}:{} did not resolve", what, host, port)))
}

fn http_url(what: &str, raw: &str) -> ConfigResult<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| invalid(format!("{} '{}': {}", what, raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!(
            "{} '{}': unsupported scheme {}",
            what, raw, other
        ))),
    }
}

fn at_least_one(what: &str, value: usize) -> ConfigResult<()> {
    if value == 0 {
        return Err(invalid(format!("{} must be at least 1", what)));
    }
    Ok(())
}

fn positive_secs(what: &str, secs: f64) -> ConfigResult<Duration> {
    if secs <= 0.0 {
        return Err(invalid(format!("{} must be greater than 0", what)));
    }
    non_negative_secs(what, secs)
}

fn non_negative_secs(what: &str, secs: f64) -> ConfigResult<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| invalid(format!("{} is not a valid duration: {}", what, secs)))
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,

    /// Environment lookup, swappable for tests
    env: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl ConfigLoader {
    /// Create a loader reading the process environment
    pub fn new() -> Self {
        Self {
            cli_path: None,
            env: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Replace the environment lookup
    pub fn with_env<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(env);
        self
    }

    /// Load configuration with the following precedence:
    /// 1. Environment variables
    /// 2. Config file (CLI --config, then SESSIONTRACE_CONFIG, then /etc)
    /// 3. Default values
    pub fn load(&self) -> ConfigResult<ServiceConfig> {
        let mut config = match self.find_config_file()? {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                ServiceConfig::default()
            }
        };

        self.apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Load, then validate into typed settings
    pub fn load_settings(&self) -> ConfigResult<(ServiceConfig, PipelineSettings)> {
        let config = self.load()?;
        let settings = config.validate()?;
        Ok((config, settings))
    }

    /// Find the config file to use
    ///
    /// An explicitly requested file that does not exist is an error.
    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::NotFound(path.clone()));
        }

        if let Some(env_path) = (self.env)(CONFIG_ENV).filter(|p| !p.is_empty()) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(ConfigError::NotFound(path));
        }

        let path = PathBuf::from(SYSTEM_CONFIG_PATH);
        if path.exists() {
            return Ok(Some(path));
        }

        Ok(None)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> ConfigResult<ServiceConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: ServiceConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// First non-empty value among `keys`
    fn lookup(&self, keys: &[&str]) -> Option<(String, String)> {
        keys.iter().find_map(|key| {
            (self.env)(key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| (key.to_string(), v.trim().to_string()))
        })
    }

    fn parsed<T: FromStr>(&self, keys: &[&str]) -> ConfigResult<Option<T>> {
        match self.lookup(keys) {
            Some((key, raw)) => raw
                .parse()
                .map(Some)
                .map_err(|_| invalid(format!("{}: cannot parse '{}'", key, raw))),
            None => Ok(None),
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut ServiceConfig) -> ConfigResult<()> {
        // Service
        if let Some((key, raw)) = self.lookup(&["DEBUG_MODE"]) {
            config.service.debug_mode = parse_bool(&key, &raw)?;
        }
        if let Some((_, val)) = self.lookup(&["SERVICE_NAME"]) {
            config.service.service_name = val;
        }

        // Listener
        if let Some((_, val)) = self.lookup(&["LISTEN_HOST"]) {
            config.listener.host = val;
        }
        if let Some(val) = self.parsed(&["LISTEN_PORT"])? {
            config.listener.port = val;
        }
        if let Some(val) = self.parsed(&["MAX_FRAME_BYTES"])? {
            config.listener.max_frame_bytes = val;
        }
        if let Some(val) = self.parsed(&["ENQUEUE_TIMEOUT"])? {
            config.listener.enqueue_timeout_secs = val;
        }

        // Metrics endpoint
        if let Some((_, val)) = self.lookup(&["METRICS_HOST"]) {
            config.metrics.host = val;
        }
        if let Some(val) = self.parsed(&["METRICS_PORT"])? {
            config.metrics.port = val;
        }

        // Pipeline
        if let Some(val) = self.parsed(&["WORKER_COUNT"])? {
            config.pipeline.worker_count = val;
        }
        if let Some(val) = self.parsed(&["QUEUE_MAXSIZE"])? {
            config.pipeline.queue_maxsize = val;
        }
        if let Some(val) = self.parsed(&["BATCH_SIZE"])? {
            config.pipeline.batch_size = val;
        }
        if let Some(val) = self.parsed(&["BATCH_TIMEOUT"])? {
            config.pipeline.batch_timeout_secs = val;
        }
        if let Some(val) = self.parsed(&["EXPORT_CONCURRENCY"])? {
            config.pipeline.export_concurrency = val;
        }
        if let Some(val) = self.parsed(&["EXPORT_QUEUE_CAPACITY"])? {
            config.pipeline.export_queue_capacity = val;
        }
        if let Some(val) = self.parsed(&["SHUTDOWN_GRACE"])? {
            config.pipeline.shutdown_grace_secs = val;
        }

        // Export
        if let Some((_, val)) = self.lookup(&["EXPORT_ENDPOINT", "OTEL_EXPORTER_OTLP_ENDPOINT"]) {
            config.export.endpoint = val;
        }
        if let Some(val) = self.parsed(&["EXPORT_TIMEOUT"])? {
            config.export.timeout_secs = val;
        }
        if let Some(val) = self.parsed(&["EXPORT_MAX_RETRIES"])? {
            config.export.max_retries = val;
        }
        if let Some(val) = self.parsed(&["EXPORT_RETRY_BACKOFF"])? {
            config.export.retry_backoff_secs = val;
        }
        if let Some((key, raw)) = self.lookup(&["EXPORT_HEADERS"]) {
            config.export.headers.extend(parse_headers(&key, &raw)?);
        }

        // Breaker
        if let Some(val) = self.parsed(&["BREAKER_FAILURE_THRESHOLD"])? {
            config.breaker.failure_threshold = val;
        }
        if let Some(val) = self.parsed(&["BREAKER_COOLDOWN"])? {
            config.breaker.cooldown_secs = val;
        }

        // Correlation. An explicitly empty URL disables the side channel.
        if let Some(url) = ["CORRELATION_STORE_URL", "INFLUX_URL"]
            .iter()
            .find_map(|key| (self.env)(key))
        {
            config.correlation.url = url.trim().to_string();
        }
        if let Some((_, val)) = self.lookup(&["CORRELATION_STORE_TOKEN", "INFLUX_TOKEN"]) {
            config.correlation.token = val;
        }
        if let Some((_, val)) = self.lookup(&["CORRELATION_STORE_ORG", "INFLUX_ORG"]) {
            config.correlation.org = val;
        }
        if let Some((_, val)) = self.lookup(&["CORRELATION_STORE_BUCKET", "INFLUX_BUCKET"]) {
            config.correlation.bucket = val;
        }
        if let Some(val) = self.parsed(&["CORRELATION_BUFFER"])? {
            config.correlation.buffer = val;
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(key: &str, raw: &str) -> ConfigResult<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(format!("{}: '{}' is not a boolean", key, raw))),
    }
}

/// `k=v,k2=v2`
fn parse_headers(key: &str, raw: &str) -> ConfigResult<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Ok((name.trim().to_string(), value.trim().to_string()))
            }
            _ => {
                warn!("Malformed entry in {}: {}", key, pair);
                Err(invalid(format!("{}: expected name=value, got '{}'", key, pair)))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn loader_with(vars: &[(&str, &str)]) -> ConfigLoader {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConfigLoader::new().with_env(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.listener.port, 5000);
        assert_eq!(config.metrics.port, 8000);
        assert_eq!(config.pipeline.worker_count, 8);
        assert_eq!(config.pipeline.batch_size, 200);
        assert_eq!(config.export.endpoint, "http://jaeger:4318/v1/traces");
        assert_eq!(config.correlation.bucket, "traces");

        let settings = config.validate().unwrap();
        assert_eq!(settings.batch_timeout, Duration::from_millis(200));
        assert_eq!(settings.enqueue_timeout, Duration::from_millis(50));
        assert_eq!(settings.breaker_cooldown, Duration::from_secs(30));
        assert!(settings.correlation.is_some());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [pipeline]
            batch_size = 50
        "#;
        let config: ServiceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pipeline.batch_size, 50);
        // Other fields should be default
        assert_eq!(config.pipeline.queue_maxsize, 10_000);
        assert_eq!(config.listener.host, "0.0.0.0");
    }

    #[test]
    fn test_load_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [listener]
            port = 6000

            [export]
            endpoint = "http://collector:4318/v1/traces"
            headers = {{ "x-tenant" = "blue" }}
            "#
        )
        .unwrap();

        let loader = loader_with(&[
            ("LISTEN_PORT", "7000"),
            ("BATCH_TIMEOUT", "0.5"),
            ("DEBUG_MODE", "yes"),
            ("EXPORT_HEADERS", "authorization=Bearer abc, x-env=prod"),
        ])
        .with_cli_path(Some(file.path().to_path_buf()));

        let (config, settings) = loader.load_settings().unwrap();
        assert_eq!(config.listener.port, 7000);
        assert_eq!(settings.listen_addr.port(), 7000);
        assert_eq!(settings.export_endpoint.as_str(), "http://collector:4318/v1/traces");
        assert_eq!(settings.batch_timeout, Duration::from_millis(500));
        assert!(settings.debug_mode);
        assert_eq!(settings.export_headers.len(), 3);
        assert!(settings
            .export_headers
            .contains(&("authorization".to_string(), "Bearer abc".to_string())));
    }

    #[test]
    fn test_env_aliases() {
        let loader = loader_with(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "https://otel.example:4318/v1/traces"),
            ("INFLUX_URL", "http://influx:8086"),
            ("INFLUX_TOKEN", "secret"),
        ]);
        let (_, settings) = loader.load_settings().unwrap();
        assert_eq!(settings.export_endpoint.scheme(), "https");
        let correlation = settings.correlation.unwrap();
        assert_eq!(correlation.url.as_str(), "http://influx:8086/");
        assert_eq!(correlation.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_empty_correlation_url_disables() {
        let loader = loader_with(&[("CORRELATION_STORE_URL", "")]);
        let (_, settings) = loader.load_settings().unwrap();
        assert!(settings.correlation.is_none());
    }

    #[test]
    fn test_unparseable_env_is_error() {
        for (key, value) in [
            ("WORKER_COUNT", "many"),
            ("BATCH_TIMEOUT", "fast"),
            ("DEBUG_MODE", "maybe"),
            ("LISTEN_PORT", "70000"),
            ("EXPORT_HEADERS", "novalue"),
        ] {
            let result = loader_with(&[(key, value)]).load();
            assert!(
                matches!(result, Err(ConfigError::ValidationError(_))),
                "{}={} should fail",
                key,
                value
            );
        }
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut config = ServiceConfig::default();
        config.pipeline.worker_count = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.pipeline.batch_timeout_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.pipeline.batch_timeout_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.export.endpoint = "ftp://collector/v1/traces".to_string();
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.metrics.port = config.listener.port;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_cli_config_is_error() {
        let loader = loader_with(&[]).with_cli_path(Some(PathBuf::from("/nonexistent/st.toml")));
        assert!(matches!(loader.load(), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_redacted_and_serialized() {
        let mut config = ServiceConfig::default();
        config.correlation.token = "secret".to_string();
        config
            .export
            .headers
            .insert("Authorization".to_string(), "Bearer x".to_string());

        let toml_str = config.redacted().to_toml().unwrap();
        assert!(toml_str.contains("[pipeline]"));
        assert!(!toml_str.contains("secret"));
        assert!(!toml_str.contains("Bearer x"));
    }
}
