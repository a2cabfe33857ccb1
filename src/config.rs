//! Configuration Module
//!
//! Builds the proxy settings once at process start from defaults, an optional
//! YAML file, environment variables and command-line arguments (in that order
//! of precedence, last wins). The resulting [`Config`] is validated and then
//! shared read-only as `Arc<Config>`.

use crate::{ProxyError, Result};
use clap::{Arg, ArgMatches, Command};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Custom deserializer for Duration from string format like "30s", "500ms", "5m"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);

        if number.is_empty() {
            return Err(format!("No number found in duration string: '{}'", s));
        }

        let value: f64 = number
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", number, e))?;

        let seconds = match unit.trim() {
            "" | "s" | "sec" | "secs" | "seconds" => value,
            "ms" | "millis" | "milliseconds" => value / 1000.0,
            "m" | "min" | "mins" | "minutes" => value * 60.0,
            "h" | "hr" | "hours" => value * 3600.0,
            other => return Err(format!("Unknown duration unit: {}", other)),
        };

        Ok(Duration::from_secs_f64(seconds))
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inbound listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Transport timeout applied to every forwarded upstream call
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_request_timeout"
    )]
    pub request_timeout: Duration,
    /// Upper bound for draining pending cache writes on shutdown
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_shutdown_timeout"
    )]
    pub shutdown_timeout: Duration,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            request_timeout: default_request_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Upstream transformation engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_health_check_timeout"
    )]
    pub health_check_timeout: Duration,
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_health_check_interval"
    )]
    pub health_check_interval: Duration,
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_check_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_interval() -> Duration {
    Duration::from_millis(500)
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            health_path: default_health_path(),
            health_check_timeout: default_health_check_timeout(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Target bucket; required, there is no default
    #[serde(default)]
    pub bucket: String,
    /// Optional key prefix; empty means keys are stored at the bucket root
    #[serde(default)]
    pub folder: String,
    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// 0 leaves concurrent uploads unbounded
    #[serde(default)]
    pub max_concurrent_uploads: usize,
}

fn default_storage_endpoint() -> String {
    "https://s3.amazonaws.com".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            folder: String::new(),
            endpoint: default_storage_endpoint(),
            region: default_region(),
            max_concurrent_uploads: 0,
        }
    }
}

/// Application logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// When set, logs are also written to a daily-rotated file under this directory
    #[serde(default)]
    pub app_log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            app_log_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches, |name| std::env::var(name).ok())
    }

    /// Build configuration from parsed arguments and an environment lookup
    pub fn from_matches<F>(matches: &ArgMatches, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides(env)?;
        config.apply_cli_overrides(matches)?;
        config.validate()?;

        Ok(config)
    }

    /// Build CLI argument parser
    pub fn build_cli() -> Command {
        Command::new("imgcache-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Cache-on-write proxy in front of an image transformation engine")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("YAML configuration file path"),
            )
            .arg(
                Arg::new("bucket")
                    .long("bucket")
                    .value_name("NAME")
                    .help("Bucket receiving cached results"),
            )
            .arg(
                Arg::new("folder")
                    .long("folder")
                    .value_name("PREFIX")
                    .help("Key prefix inside the bucket (default: none)"),
            )
            .arg(
                Arg::new("storage-endpoint")
                    .long("storage-endpoint")
                    .value_name("URL")
                    .help("Object storage endpoint (default: https://s3.amazonaws.com)"),
            )
            .arg(
                Arg::new("bind")
                    .long("bind")
                    .value_name("ADDR")
                    .help("Listen address (default: 0.0.0.0:8080)"),
            )
            .arg(
                Arg::new("upstream")
                    .long("upstream")
                    .value_name("URL")
                    .help("Upstream engine base URL (default: http://127.0.0.1:8081)"),
            )
            .arg(
                Arg::new("health-check-timeout")
                    .long("health-check-timeout")
                    .value_name("SECONDS")
                    .help("How long to wait for the upstream to become healthy (default: 30)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level filter (default: info)"),
            )
    }

    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bucket) = env("S3_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Some(folder) = env("S3_FOLDER") {
            self.storage.folder = folder;
        }
        if let Some(endpoint) = env("S3_ENDPOINT") {
            self.storage.endpoint = endpoint;
        }
        if let Some(region) = env("AWS_REGION") {
            self.storage.region = region;
        }
        if let Some(limit) = env("MAX_CONCURRENT_UPLOADS") {
            self.storage.max_concurrent_uploads = parse_number("MAX_CONCURRENT_UPLOADS", &limit)?;
        }
        if let Some(bind) = env("BIND_ADDRESS") {
            self.server.bind_address = bind;
        }
        if let Some(timeout) = env("REQUEST_TIMEOUT") {
            self.server.request_timeout = parse_duration_value("REQUEST_TIMEOUT", &timeout)?;
        }
        if let Some(timeout) = env("SHUTDOWN_TIMEOUT") {
            self.server.shutdown_timeout = parse_duration_value("SHUTDOWN_TIMEOUT", &timeout)?;
        }
        if let Some(url) = env("UPSTREAM_URL") {
            self.upstream.url = url;
        }
        if let Some(path) = env("UPSTREAM_HEALTH_PATH") {
            self.upstream.health_path = path;
        }
        if let Some(secs) = env("HEALTH_CHECK_TIMEOUT") {
            self.upstream.health_check_timeout =
                Duration::from_secs(parse_number("HEALTH_CHECK_TIMEOUT", &secs)?);
        }
        if let Some(level) = env("LOG_LEVEL") {
            self.logging.log_level = level;
        }
        if let Some(dir) = env("APP_LOG_DIR") {
            self.logging.app_log_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    fn apply_cli_overrides(&mut self, matches: &ArgMatches) -> Result<()> {
        if let Some(bucket) = matches.get_one::<String>("bucket") {
            self.storage.bucket = bucket.clone();
        }
        if let Some(folder) = matches.get_one::<String>("folder") {
            self.storage.folder = folder.clone();
        }
        if let Some(endpoint) = matches.get_one::<String>("storage-endpoint") {
            self.storage.endpoint = endpoint.clone();
        }
        if let Some(bind) = matches.get_one::<String>("bind") {
            self.server.bind_address = bind.clone();
        }
        if let Some(upstream) = matches.get_one::<String>("upstream") {
            self.upstream.url = upstream.clone();
        }
        if let Some(secs) = matches.get_one::<String>("health-check-timeout") {
            self.upstream.health_check_timeout =
                Duration::from_secs(parse_number("--health-check-timeout", secs)?);
        }
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }
        Ok(())
    }

    /// Reject settings the proxy cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.storage.bucket.trim().is_empty() {
            return Err(ProxyError::ConfigError(
                "Bucket name is required (S3_BUCKET or --bucket)".to_string(),
            ));
        }

        self.bind_socket_addr()?;

        if !self.upstream.url.starts_with("http://") {
            return Err(ProxyError::ConfigError(format!(
                "Upstream URL must be a plain http:// URL: {}",
                self.upstream.url
            )));
        }

        if !self.upstream.health_path.starts_with('/') {
            return Err(ProxyError::ConfigError(format!(
                "Upstream health path must start with '/': {}",
                self.upstream.health_path
            )));
        }

        if self.upstream.health_check_timeout.is_zero() {
            return Err(ProxyError::ConfigError(
                "Health check timeout must be greater than zero".to_string(),
            ));
        }

        if self.upstream.health_check_interval.is_zero() {
            return Err(ProxyError::ConfigError(
                "Health check interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed listen address
    pub fn bind_socket_addr(&self) -> Result<SocketAddr> {
        self.server.bind_address.parse().map_err(|e| {
            ProxyError::ConfigError(format!(
                "Invalid bind address '{}': {}",
                self.server.bind_address, e
            ))
        })
    }

    /// Upstream base URL without a trailing slash
    pub fn upstream_base(&self) -> &str {
        self.upstream.url.trim_end_matches('/')
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ProxyError::ConfigError(format!("Invalid value for {}: '{}' ({})", name, value, e)))
}

fn parse_duration_value(name: &str, value: &str) -> Result<Duration> {
    duration_serde::parse_duration(value)
        .map_err(|e| ProxyError::ConfigError(format!("Invalid value for {}: {}", name, e)))
}
