use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Pre-compiled regex for hostname validation (compiled once at first use)
static HOSTNAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][-a-zA-Z0-9\.]*[a-zA-Z0-9]$").unwrap());

#[derive(Debug, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub database: Option<DatabaseSection>,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub logging: Option<LoggingSection>,
    #[serde(default)]
    pub worker: Option<WorkerSection>,
    #[serde(default)]
    pub extraction: Option<ExtractionSection>,
    #[serde(default)]
    pub api: Option<ApiSection>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSection {
    pub driver: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerSection {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub stale_claim_timeout_secs: Option<u64>,
    #[serde(default)]
    pub claim_batch_size: Option<usize>,
    #[serde(default)]
    pub embedded_workers: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ExtractionSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub output_tail_lines: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ApiSection {
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Load a RawConfigFile from a path. The format is inferred from the extension: .toml, .yaml/.yml, .json
pub fn load_raw_from_file<P: AsRef<Path>>(path: P) -> Result<RawConfigFile, ConfigError> {
    let path = path.as_ref();
    let s = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    parse_config_str(&s, ext.as_deref())
}

/// Parse configuration from a string with optional format hint
#[inline]
fn parse_config_str(s: &str, ext: Option<&str>) -> Result<RawConfigFile, ConfigError> {
    match ext {
        #[cfg(feature = "toml")]
        Some("toml") => toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        #[cfg(feature = "yaml")]
        Some("yaml" | "yml") => {
            serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        #[cfg(feature = "json")]
        Some("json") => serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        _ => parse_config_auto(s),
    }
}

/// Try to parse config by attempting each enabled format
#[inline]
fn parse_config_auto(s: &str) -> Result<RawConfigFile, ConfigError> {
    #[cfg(feature = "yaml")]
    if let Ok(cfg) = serde_yaml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "toml")]
    if let Ok(cfg) = toml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "json")]
    if let Ok(cfg) = serde_json::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(any(feature = "yaml", feature = "toml", feature = "json"))]
    {
        Err(ConfigError::Parse(
            "failed to parse config as any supported format".into(),
        ))
    }

    #[cfg(not(any(feature = "yaml", feature = "toml", feature = "json")))]
    {
        let _ = s; // suppress unused warning
        Err(ConfigError::Parse("no config format enabled".into()))
    }
}

/// Concrete application configuration with defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub worker: WorkerSettings,
    pub extraction: ExtractionConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseConfig {
    pub driver: String,
    pub path: Option<String>,
    pub max_connections: Option<u32>,
}

impl DatabaseConfig {
    /// The connection URL for the configured path, adding the `sqlite://`
    /// scheme to bare file paths.
    pub fn url(&self) -> Option<String> {
        let path = self.path.as_deref()?.trim();
        if path.is_empty() {
            return None;
        }
        Some(if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite://{path}")
        })
    }
}

/// Worker identity and claim timing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSettings {
    /// Fixed worker id; generated per process when unset.
    pub id: Option<String>,
    pub poll_interval_ms: u64,
    pub stale_claim_timeout_secs: u64,
    pub claim_batch_size: usize,
    /// Workers the `serve` command runs alongside the HTTP server.
    pub embedded_workers: usize,
}

impl WorkerSettings {
    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[inline]
    pub fn stale_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_claim_timeout_secs)
    }
}

/// How `claude_extraction` jobs launch the extraction agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub output_tail_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiConfig {
    /// Bearer token required on `/api/jobs*` when set.
    #[serde(skip_serializing)]
    pub admin_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 6100,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
            database: DatabaseConfig {
                driver: "sqlite".to_string(),
                path: Some("sqlite://kiln.sqlite".to_string()),
                max_connections: None,
            },
            worker: WorkerSettings {
                id: None,
                poll_interval_ms: 2_000,
                stale_claim_timeout_secs: 30 * 60,
                claim_batch_size: 16,
                embedded_workers: 1,
            },
            extraction: ExtractionConfig {
                command: "claude".to_string(),
                args: vec!["--print".to_string()],
                timeout_secs: 60 * 60,
                output_tail_lines: 40,
            },
            api: ApiConfig { admin_token: None },
        }
    }
}

#[inline]
fn parse_bool(s: &str) -> Result<bool, ()> {
    // Avoid allocation by checking bytes directly for common cases
    let bytes = s.as_bytes();
    match bytes {
        b"1" | b"true" | b"TRUE" | b"True" | b"yes" | b"YES" | b"Yes" | b"y" | b"Y" => Ok(true),
        b"0" | b"false" | b"FALSE" | b"False" | b"no" | b"NO" | b"No" | b"n" | b"N" => Ok(false),
        _ => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" => Ok(true),
            "false" | "no" | "n" => Ok(false),
            _ => Err(()),
        },
    }
}

/// Split on whitespace, honouring double quotes; used for `KILN_EXTRACTION_ARGS`.
#[inline]
fn split_args(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut started = false;
    for c in s.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            c if c.is_whitespace() && !quoted => {
                if started {
                    args.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        args.push(current);
    }
    args
}

/// Helper macro to apply optional value if present
macro_rules! apply_opt {
    ($target:expr, $source:expr) => {
        if let Some(v) = $source {
            $target = v;
        }
    };
    ($target:expr, $source:expr, wrap) => {
        if let Some(v) = $source {
            $target = Some(v);
        }
    };
}

/// Helper macro to apply option field directly if it has a value
macro_rules! apply_opt_field {
    ($target:expr, $source:expr) => {
        if $source.is_some() {
            $target = $source;
        }
    };
}

/// Load concrete `Config` from optional file and environment variables.
/// Environment variables take precedence over file values and defaults.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();

    if let Some(p) = path {
        let raw = load_raw_from_file(p)?;
        if let Some(server) = raw.server {
            apply_opt!(cfg.server.host, server.host);
            apply_opt!(cfg.server.port, server.port);
        }
        if let Some(logging) = raw.logging {
            apply_opt!(cfg.logging.level, logging.level);
            apply_opt!(cfg.logging.json, logging.json);
        }
        if let Some(db) = raw.database {
            cfg.database.driver = db.driver;
            apply_opt_field!(cfg.database.path, db.path);
            apply_opt_field!(cfg.database.max_connections, db.max_connections);
        }
        if let Some(w) = raw.worker {
            apply_opt_field!(cfg.worker.id, w.id);
            apply_opt!(cfg.worker.poll_interval_ms, w.poll_interval_ms);
            apply_opt!(cfg.worker.stale_claim_timeout_secs, w.stale_claim_timeout_secs);
            apply_opt!(cfg.worker.claim_batch_size, w.claim_batch_size);
            apply_opt!(cfg.worker.embedded_workers, w.embedded_workers);
        }
        if let Some(x) = raw.extraction {
            apply_opt!(cfg.extraction.command, x.command);
            apply_opt!(cfg.extraction.args, x.args);
            apply_opt!(cfg.extraction.timeout_secs, x.timeout_secs);
            apply_opt!(cfg.extraction.output_tail_lines, x.output_tail_lines);
        }
        if let Some(api) = raw.api {
            apply_opt!(cfg.api.admin_token, api.admin_token, wrap);
        }
    }

    // Apply environment variable overrides (env takes precedence)
    apply_env_overrides(&mut cfg)?;

    Ok(cfg)
}

/// Helper to parse env var as a specific type
#[inline]
fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

/// Helper to parse env var as bool
#[inline]
fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(v) => parse_bool(&v)
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("invalid {}", key))),
        Err(_) => Ok(None),
    }
}

/// Helper to get env var as string
#[inline]
fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Apply all environment variable overrides to config
fn apply_env_overrides(cfg: &mut Config) -> Result<(), ConfigError> {
    // Server
    if let Some(v) = env_str("KILN_SERVER_HOST") {
        cfg.server.host = v;
    }
    if let Some(v) = env_parse::<u16>("KILN_SERVER_PORT")? {
        cfg.server.port = v;
    }

    // Logging
    if let Some(v) = env_str("KILN_LOG_LEVEL") {
        cfg.logging.level = v;
    }
    if let Some(v) = env_bool("KILN_LOG_JSON")? {
        cfg.logging.json = v;
    }

    // Database
    if let Some(v) = env_str("KILN_DATABASE_DRIVER") {
        cfg.database.driver = v;
    }
    if let Some(v) = env_str("KILN_DATABASE_PATH") {
        cfg.database.path = Some(v);
    }
    // Alias matching the usual DATABASE_URL convention
    if let Some(v) = env_str("KILN_DATABASE_URL") {
        cfg.database.path = Some(v);
    }
    if let Some(v) = env_parse::<u32>("KILN_DATABASE_MAX_CONNECTIONS")? {
        cfg.database.max_connections = Some(v);
    }

    // Worker
    if let Some(v) = env_str("KILN_WORKER_ID") {
        cfg.worker.id = Some(v);
    }
    if let Some(v) = env_parse::<u64>("KILN_WORKER_POLL_INTERVAL_MS")? {
        cfg.worker.poll_interval_ms = v;
    }
    if let Some(v) = env_parse::<u64>("KILN_WORKER_STALE_CLAIM_TIMEOUT_SECS")? {
        cfg.worker.stale_claim_timeout_secs = v;
    }
    if let Some(v) = env_parse::<usize>("KILN_WORKER_CLAIM_BATCH_SIZE")? {
        cfg.worker.claim_batch_size = v;
    }
    if let Some(v) = env_parse::<usize>("KILN_WORKER_EMBEDDED")? {
        cfg.worker.embedded_workers = v;
    }

    // Extraction
    if let Some(v) = env_str("KILN_EXTRACTION_COMMAND") {
        cfg.extraction.command = v;
    }
    if let Some(v) = env_str("KILN_EXTRACTION_ARGS") {
        cfg.extraction.args = split_args(&v);
    }
    if let Some(v) = env_parse::<u64>("KILN_EXTRACTION_TIMEOUT_SECS")? {
        cfg.extraction.timeout_secs = v;
    }
    if let Some(v) = env_parse::<usize>("KILN_EXTRACTION_OUTPUT_TAIL_LINES")? {
        cfg.extraction.output_tail_lines = v;
    }

    // API
    if let Some(v) = env_str("KILN_ADMIN_TOKEN") {
        cfg.api.admin_token = Some(v).filter(|t| !t.is_empty());
    }

    Ok(())
}

/// Validate higher-level constraints on the resolved configuration.
pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.port == 0 {
        return Err(ConfigError::Validation("server.port must be > 0".into()));
    }
    // validate server.host: allow IPs or simple hostname pattern
    let host_ok = cfg.server.host.parse::<std::net::IpAddr>().is_ok()
        || HOSTNAME_REGEX.is_match(&cfg.server.host);
    if !host_ok {
        return Err(ConfigError::Validation(format!(
            "invalid server.host: {}",
            cfg.server.host
        )));
    }

    if cfg.database.driver != "sqlite" {
        return Err(ConfigError::Validation(format!(
            "unsupported database driver: {}",
            cfg.database.driver
        )));
    }
    if cfg.database.url().is_none() {
        return Err(ConfigError::Validation(
            "database.path must be set".to_string(),
        ));
    }
    if cfg.database.max_connections == Some(0) {
        return Err(ConfigError::Validation(
            "database.max_connections must be > 0".to_string(),
        ));
    }

    if cfg.worker.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "worker.poll_interval_ms must be > 0".into(),
        ));
    }
    if cfg.worker.stale_claim_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "worker.stale_claim_timeout_secs must be > 0".into(),
        ));
    }
    if cfg.worker.claim_batch_size == 0 {
        return Err(ConfigError::Validation(
            "worker.claim_batch_size must be > 0".into(),
        ));
    }
    if cfg.worker.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "worker.id cannot be empty if provided".into(),
        ));
    }

    if cfg.extraction.command.trim().is_empty() {
        return Err(ConfigError::Validation(
            "extraction.command must be set".into(),
        ));
    }
    if cfg.extraction.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "extraction.timeout_secs must be > 0".into(),
        ));
    }
    Ok(())
}
