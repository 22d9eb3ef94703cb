//! Configuration for pulser
//!
//! Settings come from a YAML file (explicit path, `./.pulser.yml`, or
//! `~/.config/pulser/pulser.yml`), then CLI flags / `PULSER_*` variables on
//! top. [`Config::resolve`] validates the result and turns queue names into
//! URLs, producing the immutable [`RelaySettings`] every component shares.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cli::{Backend, Cli};
use crate::error::PulseError;
use crate::queue::{DEFAULT_VISIBILITY_TIMEOUT_SECS, MAX_WAIT_TIME_SECONDS, QueueClient};

/// Default pulse interval
pub const DEFAULT_EMIT_INTERVAL: &str = "15m";

/// Default pulse offset
pub const DEFAULT_OFFSET: &str = "0s";

/// Default long-poll wait per receive
pub const DEFAULT_WAIT_TIME_SECONDS: u32 = 20;

/// Default sleep after a failed receive
pub const DEFAULT_RECEIVE_BACKOFF_MS: u64 = 1000;

/// Default SQS-compatible endpoint (ElasticMQ's default port)
pub const DEFAULT_ENDPOINT: &str = "http://localhost:9324";

/// A queue given either by URL or by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueRef {
    pub url: Option<String>,
    pub name: Option<String>,
}

impl QueueRef {
    fn is_set(&self) -> bool {
        non_empty(&self.url).is_some() || non_empty(&self.name).is_some()
    }
}

/// Main pulser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue messages are read from (and requeued to)
    pub inbound: QueueRef,

    /// Queue messages are released to
    pub outbound: QueueRef,

    /// Pulse interval (humantime, e.g. `15m`)
    #[serde(rename = "emit-interval")]
    pub emit_interval: String,

    /// Shift applied to each pulse (humantime, optional leading `-`)
    pub offset: String,

    /// Long-poll wait per receive in the poll loop
    #[serde(rename = "wait-time-seconds")]
    pub wait_time_seconds: u32,

    /// Sleep after a failed receive
    #[serde(rename = "receive-backoff-ms")]
    pub receive_backoff_ms: u64,

    /// Visibility timeout for the memory backend
    #[serde(rename = "visibility-timeout-seconds")]
    pub visibility_timeout_seconds: u32,

    /// Queue backend
    pub backend: Backend,

    /// Queue service endpoint for the sqs backend
    pub endpoint: String,

    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inbound: QueueRef::default(),
            outbound: QueueRef::default(),
            emit_interval: DEFAULT_EMIT_INTERVAL.to_string(),
            offset: DEFAULT_OFFSET.to_string(),
            wait_time_seconds: DEFAULT_WAIT_TIME_SECONDS,
            receive_backoff_ms: DEFAULT_RECEIVE_BACKOFF_MS,
            visibility_timeout_seconds: DEFAULT_VISIBILITY_TIMEOUT_SECS,
            backend: Backend::Sqs,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            log_level: None,
        }
    }
}

impl Config {
    /// Load config with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for path in default_paths() {
            if path.exists() {
                return Self::load_from_file(&path).context(format!("Failed to load config from {}", path.display()));
            }
        }

        debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        debug!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Layer CLI flags (and their env vars) over file values
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(url) = &cli.in_queue_url {
            self.inbound.url = Some(url.clone());
        }
        if let Some(name) = &cli.in_queue_name {
            self.inbound.name = Some(name.clone());
        }
        if let Some(url) = &cli.out_queue_url {
            self.outbound.url = Some(url.clone());
        }
        if let Some(name) = &cli.out_queue_name {
            self.outbound.name = Some(name.clone());
        }
        if let Some(interval) = &cli.emit_interval {
            self.emit_interval = interval.clone();
        }
        if let Some(offset) = &cli.offset {
            self.offset = offset.clone();
        }
        if let Some(endpoint) = &cli.endpoint {
            self.endpoint = endpoint.clone();
        }
        if let Some(backend) = cli.backend {
            self.backend = backend;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = Some(level.clone());
        }
    }

    /// Check everything that can be checked without the queue service
    pub fn validate(&self) -> Result<(), PulseError> {
        if !self.inbound.is_set() {
            return Err(PulseError::Configuration(
                "either inbound queue url or inbound queue name is required".to_string(),
            ));
        }
        if !self.outbound.is_set() {
            return Err(PulseError::Configuration(
                "either outbound queue url or outbound queue name is required".to_string(),
            ));
        }
        let interval = self.emit_interval()?;
        if interval.num_milliseconds() <= 0 {
            return Err(PulseError::Configuration(format!(
                "emit-interval must be at least 1ms, got '{}'",
                self.emit_interval
            )));
        }
        if interval.subsec_nanos() % 1_000_000 != 0 {
            return Err(PulseError::Configuration(format!(
                "emit-interval must be a whole number of milliseconds, got '{}'",
                self.emit_interval
            )));
        }
        self.offset()?;
        if self.wait_time_seconds > MAX_WAIT_TIME_SECONDS {
            return Err(PulseError::Configuration(format!(
                "wait-time-seconds must be at most {}, got {}",
                MAX_WAIT_TIME_SECONDS, self.wait_time_seconds
            )));
        }
        Ok(())
    }

    /// Startup warning for combinations that run but are unlikely to work
    pub fn mode_warning(&self, mode: ExecutionMode) -> Option<String> {
        match (mode, self.backend) {
            (ExecutionMode::Lambda, Backend::Sqs) => Some(format!(
                "sqs backend sends unsigned requests to {}; AWS-hosted queues will reject them",
                self.endpoint
            )),
            (ExecutionMode::Lambda, Backend::Memory) => {
                Some("memory backend under the Lambda runtime keeps released messages in this process".to_string())
            }
            (ExecutionMode::Poll, _) => None,
        }
    }

    pub fn emit_interval(&self) -> Result<TimeDelta, PulseError> {
        parse_signed_duration(&self.emit_interval)
            .map_err(|e| PulseError::Configuration(format!("emit-interval parse failed: {}", e)))
    }

    pub fn offset(&self) -> Result<TimeDelta, PulseError> {
        parse_signed_duration(&self.offset).map_err(|e| PulseError::Configuration(format!("offset parse failed: {}", e)))
    }

    /// Validate and resolve queue names into an immutable settings value
    pub async fn resolve(&self, client: &dyn QueueClient) -> Result<RelaySettings, PulseError> {
        self.validate()?;
        let inbound_queue_url = resolve_queue(client, "inbound", &self.inbound).await?;
        let outbound_queue_url = resolve_queue(client, "outbound", &self.outbound).await?;

        Ok(RelaySettings {
            inbound_queue_url,
            outbound_queue_url,
            emit_interval: self.emit_interval()?,
            offset: self.offset()?,
            wait_time_seconds: self.wait_time_seconds,
            receive_backoff: Duration::from_millis(self.receive_backoff_ms),
        })
    }
}

fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(".pulser.yml")];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("pulser").join("pulser.yml"));
    }
    paths
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

async fn resolve_queue(client: &dyn QueueClient, role: &str, queue: &QueueRef) -> Result<String, PulseError> {
    if let Some(url) = non_empty(&queue.url) {
        return Ok(url.to_string());
    }
    let Some(name) = non_empty(&queue.name) else {
        return Err(PulseError::Configuration(format!(
            "either {role} queue url or {role} queue name is required"
        )));
    };

    info!(%role, queue_name = %name, "Resolving queue url");
    client.get_queue_url(name).await.map_err(|e| {
        PulseError::Configuration(format!("can not get {} queue url for '{}': {}", role, name, e))
    })
}

/// Parse a humantime duration with an optional leading `-`
pub fn parse_signed_duration(s: &str) -> Result<TimeDelta, String> {
    let s = s.trim();
    let (negative, magnitude) = match s.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if magnitude.is_empty() {
        return Err(format!("empty duration: '{}'", s));
    }

    let std_duration = if magnitude == "0" {
        Duration::ZERO
    } else {
        humantime::parse_duration(magnitude).map_err(|e| format!("'{}': {}", s, e))?
    };
    let delta = TimeDelta::from_std(std_duration).map_err(|e| format!("'{}': {}", s, e))?;
    Ok(if negative { -delta } else { delta })
}

/// Resolved, immutable relay settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub inbound_queue_url: String,
    pub outbound_queue_url: String,
    pub emit_interval: TimeDelta,
    pub offset: TimeDelta,
    pub wait_time_seconds: u32,
    pub receive_backoff: Duration,
}

impl RelaySettings {
    /// Settings with default wait and backoff
    pub fn new(
        inbound_queue_url: impl Into<String>,
        outbound_queue_url: impl Into<String>,
        emit_interval: TimeDelta,
        offset: TimeDelta,
    ) -> Self {
        Self {
            inbound_queue_url: inbound_queue_url.into(),
            outbound_queue_url: outbound_queue_url.into(),
            emit_interval,
            offset,
            wait_time_seconds: DEFAULT_WAIT_TIME_SECONDS,
            receive_backoff: Duration::from_millis(DEFAULT_RECEIVE_BACKOFF_MS),
        }
    }
}

/// How the process is hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Continuous receive/route/delete loop
    Poll,
    /// Batch events pushed by the Lambda runtime
    Lambda,
}

impl ExecutionMode {
    /// Pick the mode from the process environment
    pub fn detect() -> Self {
        Self::from_env(
            std::env::var("AWS_EXECUTION_ENV").ok().as_deref(),
            std::env::var("AWS_LAMBDA_RUNTIME_API").ok().as_deref(),
        )
    }

    pub fn from_env(execution_env: Option<&str>, runtime_api: Option<&str>) -> Self {
        let in_lambda = execution_env.is_some_and(|e| e.starts_with("AWS_Lambda"))
            || runtime_api.is_some_and(|api| !api.is_empty());
        if in_lambda { ExecutionMode::Lambda } else { ExecutionMode::Poll }
    }
}
