//! # Cluster Statcord
//!
//! A background telemetry agent that lives inside a sharded chat-bot process.
//! Every interval it aggregates what the local cluster has observed (active
//! users, command invocations, command popularity, memory/CPU load and the
//! network bandwidth delta) and posts one snapshot to the Statcord cluster
//! endpoint, tagged with the cluster id.
//!
//! ## Architecture Overview
//!
//! ```text
//! host events ──► CounterStore ──► SnapshotBuilder ──► Transport ──► statcord
//!                      ▲                 ▲                  │
//!                      │           SystemMetrics            ▼
//!                      └──────────── PostingLoop ◄──── ErrorHook
//! ```
//!
//! The loop never takes the host down: every failure is confined to the tick
//! it happened in, reported through the [`ErrorHook`], and the next tick runs
//! on schedule. Delivery is fire-and-forget: a failed snapshot is not retried.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::sync::watch;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{sleep, Instant as TokioInstant};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Networking, System Information
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use reqwest::{Client as HttpClient, Url};
use sysinfo::{Networks, System as SysInfoSystem};

// ----------------------------------------------------------------------------
// Configuration & Validation
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use validator::{Validate, ValidationError};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Agent version - follows semantic versioning
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AGENT_NAME: &str = "cluster-statcord";
pub const AGENT_FULL_NAME: &str = "Cluster Statcord Agent";

/// Statcord API root; the cluster endpoint is resolved relative to it.
pub const DEFAULT_BASE_URL: &str = "https://api.statcord.com/v3/";

/// Path of the cluster stats endpoint under the API root.
pub const CLUSTERS_PATH: &str = "clusters";

/// Seconds between two posts.
pub const DEFAULT_POST_INTERVAL_SECS: u64 = 60;

/// Upper bound for a single POST, so a hung request cannot stall ticks.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Smallest accepted interval or timeout.
pub const MIN_DURATION_SECS: u64 = 1;

/// Longest rate-limit wait the loop will honour.
pub const MAX_RATE_LIMIT_WAIT_SECS: u64 = 3_600;

/// The agent keeps one long-lived connection to the endpoint.
pub const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 1;

/// Environment prefix for configuration overrides (`STATCORD_API_KEY`, ...).
pub const ENV_PREFIX: &str = "STATCORD_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Cluster Identity
// ----------------------------------------------------------------------------

/// Opaque cluster identifier, forwarded verbatim in every report.
///
/// Statcord accepts either a number or a string, so both survive the round
/// trip through configuration and onto the wire unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterId {
    Number(i64),
    Text(String),
}

impl Display for ClusterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClusterId::Number(n) => write!(f, "{}", n),
            ClusterId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ClusterId {
    fn from(value: i64) -> Self {
        ClusterId::Number(value)
    }
}

impl From<&str> for ClusterId {
    fn from(value: &str) -> Self {
        ClusterId::Text(value.to_string())
    }
}

impl From<String> for ClusterId {
    fn from(value: String) -> Self {
        ClusterId::Text(value)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Host-side Types
// ----------------------------------------------------------------------------

/// A command-invocation notification from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInvocation {
    /// Id of the invoking user
    pub user_id: String,
    /// Name of the invoked command
    pub command: String,
}

impl CommandInvocation {
    pub fn new(user_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            command: command.into(),
        }
    }
}

/// One guild as seen by the host. The member count may be unknown
/// (e.g. a guild that has not been chunked yet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildInfo {
    pub id: String,
    #[serde(default)]
    pub member_count: Option<u64>,
}

impl GuildInfo {
    pub fn new(id: impl Into<String>, member_count: Option<u64>) -> Self {
        Self {
            id: id.into(),
            member_count,
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Metric Types
// ----------------------------------------------------------------------------

/// Invocation count of one command within an interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularCommand {
    pub name: String,
    pub count: u64,
}

/// Memory gauges read from the system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryReading {
    /// Used memory in bytes
    pub used_bytes: u64,
    /// Used memory as a percentage of total
    pub load_percent: f32,
}

/// Percentages go on the wire with one decimal place.
fn format_percent(value: f32) -> String {
    format!("{:.1}", value)
}

fn round_percent(value: f64) -> f32 {
    ((value * 10.0).round() / 10.0) as f32
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Agent Errors
// ----------------------------------------------------------------------------

/// The main error type for the agent.
/// Only `Config` is allowed to escape to the caller; everything else stays
/// inside the tick that produced it.
#[derive(Error, Debug)]
pub enum StatcordError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Rate limited by statcord, retry in {wait_secs}s")]
    RateLimited { wait_secs: u64 },

    #[error("Request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Posting task panicked: {0}")]
    Panicked(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StatcordError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StatcordError::Config(_))
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            StatcordError::Config(_) => "config",
            StatcordError::RateLimited { .. } => "rate_limited",
            StatcordError::RequestFailed { .. } => "request_failed",
            StatcordError::Transport(_) => "transport",
            StatcordError::Metrics(_) => "metrics",
            StatcordError::Host(_) => "host",
            StatcordError::Serialization(_) => "serialization",
            StatcordError::Io(_) => "io",
            StatcordError::Panicked(_) => "panicked",
            StatcordError::Internal(_) => "internal",
        }
    }

    /// Seconds the endpoint asked us to wait, if this is a rate limit.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StatcordError::RateLimited { wait_secs } => Some(Duration::from_secs(*wait_secs)),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Metrics & Host Errors
// ----------------------------------------------------------------------------

/// A system-metrics source could not produce a reading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricsError {
    #[error("Metric source '{source_name}' unavailable: {message}")]
    Unavailable { source_name: String, message: String },
}

impl MetricsError {
    pub fn unavailable(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        MetricsError::Unavailable {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// The host could not answer a query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Host is not ready")]
    NotReady,

    #[error("Host has no bot user identity yet")]
    MissingIdentity,
}

// ----------------------------------------------------------------------------
// 4.4 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for agent operations
pub type StatcordResult<T> = Result<T, StatcordError>;

/// Result type for system-metrics reads
pub type MetricsResult<T> = Result<T, MetricsError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Typed replacement for keyword configuration:
// - TOML file parsing
// - Environment variable overrides (STATCORD_*)
// - Validation once, before the agent is built
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AgentConfig {
    /// Statcord API key
    #[validate(custom = "validate_not_blank")]
    pub api_key: String,

    /// Cluster identifier attached to every report
    pub cluster_id: ClusterId,

    /// Report memory gauges
    #[serde(default = "default_true")]
    pub track_memory: bool,

    /// Report CPU load
    #[serde(default = "default_true")]
    pub track_cpu: bool,

    /// Report network bandwidth delta
    #[serde(default = "default_true")]
    pub track_bandwidth: bool,

    /// Log outgoing payloads and responses
    #[serde(default)]
    pub debug: bool,

    /// API root, the cluster endpoint is `<base_url>clusters`
    #[serde(default = "default_base_url")]
    #[validate(custom = "validate_base_url")]
    pub base_url: String,

    /// Time between posts
    #[serde(default = "default_post_interval", with = "humantime_serde")]
    pub post_interval: Duration,

    /// Timeout for a single POST
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Skip ticks while a rate-limit wait is pending
    #[serde(default)]
    pub respect_rate_limit: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Fixed host description used by the command line tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standalone: Option<StandaloneHostConfig>,
}

impl AgentConfig {
    /// Create a configuration with default toggles.
    pub fn new(api_key: impl Into<String>, cluster_id: impl Into<ClusterId>) -> Self {
        Self {
            api_key: api_key.into(),
            cluster_id: cluster_id.into(),
            track_memory: true,
            track_cpu: true,
            track_bandwidth: true,
            debug: false,
            base_url: default_base_url(),
            post_interval: default_post_interval(),
            request_timeout: default_request_timeout(),
            respect_rate_limit: false,
            logging: LoggingConfig::default(),
            standalone: None,
        }
    }

    pub fn with_memory(mut self, enabled: bool) -> Self {
        self.track_memory = enabled;
        self
    }

    pub fn with_cpu(mut self, enabled: bool) -> Self {
        self.track_cpu = enabled;
        self
    }

    pub fn with_bandwidth(mut self, enabled: bool) -> Self {
        self.track_bandwidth = enabled;
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_post_interval(mut self, interval: Duration) -> Self {
        self.post_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_respect_rate_limit(mut self, enabled: bool) -> Self {
        self.respect_rate_limit = enabled;
        self
    }

    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::ValidationFailed {
            message: e.to_string(),
        })?;

        if let ClusterId::Text(id) = &self.cluster_id {
            if id.trim().is_empty() {
                return Err(ConfigError::missing_field("cluster_id"));
            }
        }

        if self.post_interval < Duration::from_secs(MIN_DURATION_SECS) {
            return Err(ConfigError::invalid_value(
                "post_interval",
                format!("must be at least {}s", MIN_DURATION_SECS),
            ));
        }

        if self.request_timeout < Duration::from_secs(MIN_DURATION_SECS) {
            return Err(ConfigError::invalid_value(
                "request_timeout",
                format!("must be at least {}s", MIN_DURATION_SECS),
            ));
        }

        self.endpoint()?;
        Ok(())
    }

    /// Full URL of the cluster endpoint.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let mut base = self.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }

        let base = Url::parse(&base)
            .map_err(|e| ConfigError::invalid_value("base_url", e.to_string()))?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(ConfigError::invalid_value(
                "base_url",
                format!("unsupported scheme '{}'", base.scheme()),
            ));
        }

        base.join(CLUSTERS_PATH)
            .map_err(|e| ConfigError::invalid_value("base_url", e.to_string()))
    }

    /// Render a template configuration file
    pub fn generate_default_config() -> String {
        let mut config = Self::new("statcord.com-REPLACE_ME", ClusterId::Number(0));
        config.standalone = Some(StandaloneHostConfig::default());
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some("must not be empty".into());
        return Err(err);
    }
    Ok(())
}

fn validate_base_url(value: &str) -> Result<(), ValidationError> {
    match Url::parse(value.trim()) {
        Ok(_) => Ok(()),
        Err(e) => {
            let mut err = ValidationError::new("base_url");
            err.message = Some(format!("invalid base url: {}", e).into());
            Err(err)
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.into()
}

fn default_post_interval() -> Duration {
    Duration::from_secs(DEFAULT_POST_INTERVAL_SECS)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.2 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ----------------------------------------------------------------------------
// 5.3 Standalone Host Configuration
// ----------------------------------------------------------------------------

/// Describes a fixed host for running the agent outside a bot process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandaloneHostConfig {
    /// Bot user id reported as `id`
    pub bot_id: String,

    /// Guilds reported by the host
    #[serde(default)]
    pub guilds: Vec<GuildInfo>,
}

impl Default for StandaloneHostConfig {
    fn default() -> Self {
        Self {
            bot_id: "0".into(),
            guilds: Vec::new(),
        }
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> StatcordResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| StatcordError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| StatcordError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| StatcordError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "statcord::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: COUNTER STORE
// ============================================================================
// Per-interval accumulation state. Recording and draining share one mutex so
// that a drain is a single atomic read-and-reset: an invocation recorded
// concurrently lands in exactly one of two adjacent snapshots.
// ============================================================================

#[derive(Debug, Default)]
struct IntervalCounters {
    /// Distinct user ids in first-seen order
    active: Vec<String>,
    seen: HashSet<String>,
    commands: u64,
    /// Command counts in first-seen order
    popular: Vec<PopularCommand>,
    popular_index: HashMap<String, usize>,
}

/// What one drain hands over to the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainedCounters {
    pub active_users: Vec<String>,
    pub command_count: u64,
    pub popularity: Vec<PopularCommand>,
}

impl DrainedCounters {
    pub fn is_empty(&self) -> bool {
        self.command_count == 0 && self.active_users.is_empty() && self.popularity.is_empty()
    }
}

/// Mutable accumulation state owned by one agent.
#[derive(Debug)]
pub struct CounterStore {
    counters: Mutex<IntervalCounters>,
    bandwidth_baseline: AtomicU64,
}

impl CounterStore {
    /// Create a store whose bandwidth baseline starts at `initial_bandwidth`.
    pub fn new(initial_bandwidth: u64) -> Self {
        Self {
            counters: Mutex::new(IntervalCounters::default()),
            bandwidth_baseline: AtomicU64::new(initial_bandwidth),
        }
    }

    /// Record one command invocation.
    pub fn record_command_invocation(&self, user_id: &str, command: &str) {
        let mut guard = self.counters.lock();
        let counters = &mut *guard;

        counters.commands += 1;

        if !counters.seen.contains(user_id) {
            counters.seen.insert(user_id.to_string());
            counters.active.push(user_id.to_string());
        }

        match counters.popular_index.get(command).copied() {
            Some(idx) => counters.popular[idx].count += 1,
            None => {
                counters.popular_index.insert(command.to_string(), counters.popular.len());
                counters.popular.push(PopularCommand {
                    name: command.to_string(),
                    count: 1,
                });
            }
        }
    }

    /// Capture and reset the per-interval counters in one step.
    pub fn drain_and_reset(&self) -> DrainedCounters {
        let taken = std::mem::take(&mut *self.counters.lock());
        DrainedCounters {
            active_users: taken.active,
            command_count: taken.commands,
            popularity: taken.popular,
        }
    }

    /// Return the bytes moved since the previous call and store `current`
    /// as the new baseline. A counter that went backwards (interface reset)
    /// yields zero.
    pub fn update_bandwidth_baseline(&self, current: u64) -> u64 {
        let previous = self.bandwidth_baseline.swap(current, AtomicOrdering::AcqRel);
        current.saturating_sub(previous)
    }

    pub fn bandwidth_baseline(&self) -> u64 {
        self.bandwidth_baseline.load(AtomicOrdering::Acquire)
    }

    /// Commands recorded since the last drain.
    pub fn pending_commands(&self) -> u64 {
        self.counters.lock().commands
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new(0)
    }
}

// ============================================================================
// SECTION 8: SYSTEM METRICS SOURCE
// ============================================================================

/// Polled source of local system gauges.
pub trait SystemMetrics: Send + Sync {
    /// Used memory and memory load.
    fn memory(&self) -> MetricsResult<MemoryReading>;

    /// CPU load since the previous call, in percent.
    fn cpu_load(&self) -> MetricsResult<f32>;

    /// Cumulative bytes sent plus received across all interfaces.
    fn network_bytes_total(&self) -> MetricsResult<u64>;
}

/// [`SystemMetrics`] backed by `sysinfo`.
///
/// The CPU sampler is refreshed once on construction so that the first
/// real reading covers a meaningful window instead of an instant.
pub struct SysinfoMetrics {
    system: Mutex<SysInfoSystem>,
    networks: Mutex<Networks>,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        let mut system = SysInfoSystem::new();
        system.refresh_memory();
        system.refresh_cpu();

        Self {
            system: Mutex::new(system),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SysinfoMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysinfoMetrics").finish_non_exhaustive()
    }
}

impl SystemMetrics for SysinfoMetrics {
    fn memory(&self) -> MetricsResult<MemoryReading> {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(MetricsError::unavailable("memory", "total memory reported as zero"));
        }
        let used = system.used_memory();

        Ok(MemoryReading {
            used_bytes: used,
            load_percent: round_percent(used as f64 / total as f64 * 100.0),
        })
    }

    fn cpu_load(&self) -> MetricsResult<f32> {
        let mut system = self.system.lock();
        system.refresh_cpu();

        let usage = system.global_cpu_info().cpu_usage();
        if !usage.is_finite() {
            return Err(MetricsError::unavailable("cpu", "non-finite cpu usage"));
        }
        Ok(round_percent(usage as f64))
    }

    fn network_bytes_total(&self) -> MetricsResult<u64> {
        let mut networks = self.networks.lock();
        networks.refresh();

        Ok(networks
            .iter()
            .map(|(_, data)| data.total_received() + data.total_transmitted())
            .sum())
    }
}

// ============================================================================
// SECTION 9: HOST INTEGRATION
// ============================================================================

/// The bot process the agent is embedded in.
#[async_trait]
pub trait Host: Send + Sync {
    /// Resolve once the host has finished its connection handshake and
    /// guild/member data is populated.
    async fn wait_until_ready(&self);

    /// True once the host is shutting down.
    fn is_closed(&self) -> bool;

    /// The bot's own user id, if known.
    fn bot_user_id(&self) -> Option<String>;

    /// Live guild list.
    fn guilds(&self) -> Vec<GuildInfo>;
}

/// A host with a fixed identity and guild list.
#[derive(Debug)]
pub struct StaticHost {
    bot_id: RwLock<Option<String>>,
    guilds: RwLock<Vec<GuildInfo>>,
    ready: watch::Sender<bool>,
    closed: AtomicBool,
}

impl StaticHost {
    /// A host that still has to be marked ready.
    pub fn new(bot_id: Option<String>, guilds: Vec<GuildInfo>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            bot_id: RwLock::new(bot_id),
            guilds: RwLock::new(guilds),
            ready,
            closed: AtomicBool::new(false),
        }
    }

    /// A host that is ready from the start.
    pub fn ready(bot_id: impl Into<String>, guilds: Vec<GuildInfo>) -> Self {
        let host = Self::new(Some(bot_id.into()), guilds);
        host.mark_ready();
        host
    }

    pub fn from_config(config: &StandaloneHostConfig) -> Self {
        Self::ready(config.bot_id.clone(), config.guilds.clone())
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    pub fn set_bot_id(&self, bot_id: impl Into<String>) {
        *self.bot_id.write() = Some(bot_id.into());
    }

    pub fn set_guilds(&self, guilds: Vec<GuildInfo>) {
        *self.guilds.write() = guilds;
    }

    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
    }
}

#[async_trait]
impl Host for StaticHost {
    async fn wait_until_ready(&self) {
        let mut rx = self.ready.subscribe();
        loop {
            let ready = *rx.borrow_and_update();
            if ready {
                return;
            }
            // The sender lives in self, so the channel cannot close under us.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    fn bot_user_id(&self) -> Option<String> {
        self.bot_id.read().clone()
    }

    fn guilds(&self) -> Vec<GuildInfo> {
        self.guilds.read().clone()
    }
}

// ============================================================================
// SECTION 10: METRICS SNAPSHOT
// ============================================================================

/// One immutable bundle of metrics covering exactly one interval.
///
/// Gauges for disabled metrics are `None` and go on the wire as `"0"`.
#[derive(Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub bot_id: String,
    pub api_key: String,
    pub cluster_id: ClusterId,
    pub server_count: u64,
    pub user_count: u64,
    pub memory: Option<MemoryReading>,
    pub cpu_load: Option<f32>,
    pub bandwidth_delta: Option<u64>,
    pub command_count: u64,
    pub active_users: Vec<String>,
    pub popular: Vec<PopularCommand>,
}

impl Debug for MetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsSnapshot")
            .field("bot_id", &self.bot_id)
            .field("api_key", &"<redacted>")
            .field("cluster_id", &self.cluster_id)
            .field("server_count", &self.server_count)
            .field("user_count", &self.user_count)
            .field("memory", &self.memory)
            .field("cpu_load", &self.cpu_load)
            .field("bandwidth_delta", &self.bandwidth_delta)
            .field("command_count", &self.command_count)
            .field("active_users", &self.active_users)
            .field("popular", &self.popular)
            .finish()
    }
}

/// Wire shape of a popular-command entry; counts travel as strings.
#[derive(Debug, Serialize)]
struct WirePopular<'a> {
    name: &'a str,
    count: String,
}

/// Wire shape of the cluster stats body.
#[derive(Debug, Serialize)]
struct WirePayload<'a> {
    id: &'a str,
    key: &'a str,
    servers: String,
    users: String,
    commands: String,
    active: &'a [String],
    popular: Vec<WirePopular<'a>>,
    memactive: String,
    memload: String,
    cpuload: String,
    bandwidth: String,
    cluster_id: &'a ClusterId,
}

impl MetricsSnapshot {
    fn wire(&self) -> WirePayload<'_> {
        WirePayload {
            id: &self.bot_id,
            key: &self.api_key,
            servers: self.server_count.to_string(),
            users: self.user_count.to_string(),
            commands: self.command_count.to_string(),
            active: &self.active_users,
            popular: self
                .popular
                .iter()
                .map(|p| WirePopular {
                    name: &p.name,
                    count: p.count.to_string(),
                })
                .collect(),
            memactive: self
                .memory
                .map(|m| m.used_bytes.to_string())
                .unwrap_or_else(|| "0".into()),
            memload: self
                .memory
                .map(|m| format_percent(m.load_percent))
                .unwrap_or_else(|| "0".into()),
            cpuload: self.cpu_load.map(format_percent).unwrap_or_else(|| "0".into()),
            bandwidth: self
                .bandwidth_delta
                .map(|b| b.to_string())
                .unwrap_or_else(|| "0".into()),
            cluster_id: &self.cluster_id,
        }
    }

    /// The request body as JSON.
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self.wire()).unwrap_or(JsonValue::Null)
    }

    /// The request body with the api key masked, for logs.
    pub fn redacted_json(&self) -> JsonValue {
        let mut value = self.to_json();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("key".into(), json!("<redacted>"));
        }
        value
    }
}

impl Serialize for MetricsSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.wire().serialize(serializer)
    }
}

// ----------------------------------------------------------------------------
// 10.1 Snapshot Builder
// ----------------------------------------------------------------------------

/// Reads the counters, the host and the system gauges into one snapshot.
///
/// The counters are drained last, after every fallible query, so a failing
/// metrics source leaves the interval's invocations in place for the next
/// tick rather than losing them.
pub struct SnapshotBuilder<'a> {
    store: &'a CounterStore,
    host: &'a dyn Host,
    metrics: &'a dyn SystemMetrics,
    config: &'a AgentConfig,
}

impl Debug for SnapshotBuilder<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotBuilder")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(
        store: &'a CounterStore,
        host: &'a dyn Host,
        metrics: &'a dyn SystemMetrics,
        config: &'a AgentConfig,
    ) -> Self {
        Self {
            store,
            host,
            metrics,
            config,
        }
    }

    pub fn build(&self) -> StatcordResult<MetricsSnapshot> {
        let bot_id = self.host.bot_user_id().ok_or(HostError::MissingIdentity)?;

        let guilds = self.host.guilds();
        let server_count = guilds.len() as u64;
        let user_count: u64 = guilds.iter().filter_map(|g| g.member_count).sum();

        let memory = if self.config.track_memory {
            Some(self.metrics.memory()?)
        } else {
            None
        };

        let cpu_load = if self.config.track_cpu {
            Some(self.metrics.cpu_load()?)
        } else {
            None
        };

        let bandwidth_delta = if self.config.track_bandwidth {
            let current = self.metrics.network_bytes_total()?;
            Some(self.store.update_bandwidth_baseline(current))
        } else {
            None
        };

        let drained = self.store.drain_and_reset();

        trace!(
            target: "statcord::snapshot",
            servers = server_count,
            users = user_count,
            commands = drained.command_count,
            active = drained.active_users.len(),
            "Snapshot built"
        );

        Ok(MetricsSnapshot {
            bot_id,
            api_key: self.config.api_key.clone(),
            cluster_id: self.config.cluster_id.clone(),
            server_count,
            user_count,
            memory,
            cpu_load,
            bandwidth_delta,
            command_count: drained.command_count,
            active_users: drained.active_users,
            popular: drained.popularity,
        })
    }
}

// ============================================================================
// SECTION 11: TRANSPORT
// ============================================================================

/// Delivers a snapshot and classifies the answer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, snapshot: &MetricsSnapshot) -> StatcordResult<JsonValue>;
}

/// Map a status code and raw body to the outcome of a post.
///
/// - `200`: the parsed body; empty or falsy bodies become `{}`, non-JSON
///   bodies become a JSON string of the raw text.
/// - `429`: `RateLimited` with the whole seconds from the body's `wait`.
/// - anything else: `RequestFailed` with the raw body.
pub fn classify_response(status: u16, body: &str) -> StatcordResult<JsonValue> {
    let parsed = serde_json::from_str::<JsonValue>(body).ok();

    match status {
        200 => Ok(match parsed {
            Some(value) if !is_falsy(&value) => value,
            Some(_) => json!({}),
            None if body.trim().is_empty() => json!({}),
            None => JsonValue::String(body.to_string()),
        }),
        429 => {
            let wait_secs = parsed
                .as_ref()
                .and_then(|v| v.get("wait"))
                .and_then(wait_seconds)
                .unwrap_or(0);
            Err(StatcordError::RateLimited { wait_secs })
        }
        _ => Err(StatcordError::RequestFailed {
            status,
            body: body.to_string(),
        }),
    }
}

fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(a) => a.is_empty(),
        JsonValue::Object(o) => o.is_empty(),
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
    }
}

fn wait_seconds(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.trunc() as u64)),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f.trunc() as u64),
        _ => None,
    }
}

/// [`Transport`] over one shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: HttpClient,
    endpoint: Url,
}

impl HttpTransport {
    /// Open the long-lived session for `config`'s endpoint.
    pub fn new(config: &AgentConfig) -> StatcordResult<Self> {
        let endpoint = config.endpoint()?;

        let client = HttpClient::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
            .user_agent(format!("{}/{}", AGENT_NAME, AGENT_VERSION))
            .build()?;

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, snapshot: &MetricsSnapshot) -> StatcordResult<JsonValue> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(snapshot)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;

        debug!(
            target: "statcord::transport",
            status,
            bytes = text.len(),
            "Statcord responded"
        );

        classify_response(status, &text)
    }
}

// ============================================================================
// SECTION 12: ERROR REPORTING & AGENT STATISTICS
// ============================================================================

/// Receives every per-tick error.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn on_error(&self, error: &StatcordError);
}

/// Default hook: one error line per failed tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorHook;

#[async_trait]
impl ErrorHook for LogErrorHook {
    async fn on_error(&self, error: &StatcordError) {
        error!(
            target: "statcord::loop",
            category = error.category(),
            "{}",
            posting_exception_message(error)
        );
    }
}

fn posting_exception_message(error: &StatcordError) -> String {
    format!("Statcord posting exception occurred: {}", error)
}

/// Tracks loop outcomes with atomic counters.
#[derive(Debug, Default)]
pub struct AgentStats {
    ticks: AtomicU64,
    posts_succeeded: AtomicU64,
    rate_limited: AtomicU64,
    failures: AtomicU64,
    skipped_ticks: AtomicU64,
    last_success: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<(DateTime<Utc>, String)>>,
}

/// Point-in-time copy of [`AgentStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatsSnapshot {
    pub ticks: u64,
    pub posts_succeeded: u64,
    pub rate_limited: u64,
    pub failures: u64,
    pub skipped_ticks: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AgentStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_tick(&self) {
        self.ticks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_skip(&self) {
        self.skipped_ticks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_success(&self) {
        self.posts_succeeded.fetch_add(1, AtomicOrdering::Relaxed);
        *self.last_success.write() = Some(Utc::now());
    }

    fn record_error(&self, error: &StatcordError) {
        if matches!(error, StatcordError::RateLimited { .. }) {
            self.rate_limited.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.failures.fetch_add(1, AtomicOrdering::Relaxed);
        }
        *self.last_error.write() = Some((Utc::now(), error.to_string()));
    }

    pub fn snapshot(&self) -> AgentStatsSnapshot {
        let last_error = self.last_error.read().clone();
        AgentStatsSnapshot {
            ticks: self.ticks.load(AtomicOrdering::Relaxed),
            posts_succeeded: self.posts_succeeded.load(AtomicOrdering::Relaxed),
            rate_limited: self.rate_limited.load(AtomicOrdering::Relaxed),
            failures: self.failures.load(AtomicOrdering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(AtomicOrdering::Relaxed),
            last_success: *self.last_success.read(),
            last_error_at: last_error.as_ref().map(|(at, _)| *at),
            last_error: last_error.map(|(_, msg)| msg),
        }
    }
}

// ============================================================================
// SECTION 13: STATCORD CLIENT & POSTING LOOP
// ============================================================================
// WaitingForHostReady -> Running -> (Building -> Sending -> Idle) -> Running
// The loop ends when the host closes or the client is shut down.
// ============================================================================

/// Builder for [`StatcordClient`].
pub struct StatcordClientBuilder {
    config: AgentConfig,
    host: Arc<dyn Host>,
    metrics: Option<Arc<dyn SystemMetrics>>,
    transport: Option<Arc<dyn Transport>>,
    error_hook: Option<Arc<dyn ErrorHook>>,
}

impl Debug for StatcordClientBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatcordClientBuilder")
            .field("cluster_id", &self.config.cluster_id)
            .finish_non_exhaustive()
    }
}

impl StatcordClientBuilder {
    pub fn metrics(mut self, metrics: Arc<dyn SystemMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn error_hook(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.error_hook = Some(hook);
        self
    }

    /// Validate the configuration and assemble the client. Configuration
    /// problems are the only errors that reach the caller.
    pub fn build(self) -> StatcordResult<StatcordClient> {
        self.config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new(&self.config)?),
        };
        let metrics: Arc<dyn SystemMetrics> = match self.metrics {
            Some(m) => m,
            None => Arc::new(SysinfoMetrics::new()),
        };

        let baseline = if self.config.track_bandwidth {
            metrics.network_bytes_total().unwrap_or_else(|e| {
                warn!(
                    target: "statcord::metrics",
                    error = %e,
                    "Could not read initial bandwidth counter, starting from zero"
                );
                0
            })
        } else {
            0
        };

        if self.config.debug {
            info!(target: "statcord::debug", "Statcord debug mode enabled");
        }

        Ok(StatcordClient {
            config: self.config,
            host: self.host,
            metrics,
            transport,
            error_hook: self.error_hook.unwrap_or_else(|| Arc::new(LogErrorHook)),
            counters: CounterStore::new(baseline),
            stats: AgentStats::new(),
            shutdown: CancellationToken::new(),
            rate_limited_until: Mutex::new(None),
        })
    }
}

/// The telemetry agent.
pub struct StatcordClient {
    config: AgentConfig,
    host: Arc<dyn Host>,
    metrics: Arc<dyn SystemMetrics>,
    transport: Arc<dyn Transport>,
    error_hook: Arc<dyn ErrorHook>,
    counters: CounterStore,
    stats: AgentStats,
    shutdown: CancellationToken,
    rate_limited_until: Mutex<Option<TokioInstant>>,
}

impl Debug for StatcordClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatcordClient")
            .field("cluster_id", &self.config.cluster_id)
            .field("counters", &self.counters)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl StatcordClient {
    pub fn builder(config: AgentConfig, host: Arc<dyn Host>) -> StatcordClientBuilder {
        StatcordClientBuilder {
            config,
            host,
            metrics: None,
            transport: None,
            error_hook: None,
        }
    }

    /// Client with the default sysinfo metrics, HTTP transport and log hook.
    pub fn new(config: AgentConfig, host: Arc<dyn Host>) -> StatcordResult<Self> {
        Self::builder(config, host).build()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    pub fn stats(&self) -> AgentStatsSnapshot {
        self.stats.snapshot()
    }

    /// Record a command invocation from the host's event path.
    pub fn command_run(&self, invocation: &CommandInvocation) {
        self.counters
            .record_command_invocation(&invocation.user_id, &invocation.command);
    }

    /// Build the next snapshot, draining the counters.
    pub fn build_snapshot(&self) -> StatcordResult<MetricsSnapshot> {
        SnapshotBuilder::new(
            &self.counters,
            self.host.as_ref(),
            self.metrics.as_ref(),
            &self.config,
        )
        .build()
    }

    /// Build one snapshot and post it.
    pub async fn post_data(&self) -> StatcordResult<JsonValue> {
        let snapshot = self.build_snapshot()?;

        if self.config.debug {
            info!(
                target: "statcord::debug",
                payload = %snapshot.redacted_json(),
                "Posting data"
            );
        }

        let response = self.transport.send(&snapshot).await?;

        if self.config.debug {
            info!(target: "statcord::debug", response = %response, "Statcord response");
        }

        Ok(response)
    }

    /// Spawn the posting loop on the current runtime.
    pub fn start_loop(self: &Arc<Self>) -> TokioJoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run_loop().await })
    }

    /// Stop the posting loop. A post still in flight is abandoned.
    pub fn shutdown(&self) {
        info!(target: "statcord::loop", "Shutdown signal received");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The posting loop. Waits for the host, then posts every
    /// `post_interval` until the host closes or the client shuts down.
    pub async fn run_loop(&self) {
        tokio::select! {
            _ = self.host.wait_until_ready() => {}
            _ = self.shutdown.cancelled() => {
                debug!(target: "statcord::loop", "Shut down before host became ready");
                return;
            }
        }

        if self.config.debug {
            info!(target: "statcord::debug", "Statcord auto post has started");
        }
        info!(
            target: "statcord::loop",
            cluster_id = %self.config.cluster_id,
            interval_secs = self.config.post_interval.as_secs(),
            "Posting loop started"
        );

        while !self.host.is_closed() && !self.shutdown.is_cancelled() {
            tokio::select! {
                _ = self.tick() => {}
                _ = self.shutdown.cancelled() => break,
            }

            tokio::select! {
                _ = sleep(self.config.post_interval) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!(target: "statcord::loop", "Posting loop stopped");
    }

    async fn tick(&self) {
        self.stats.record_tick();

        if let Some(remaining) = self.rate_limit_remaining() {
            self.stats.record_skip();
            debug!(
                target: "statcord::loop",
                remaining_secs = remaining.as_secs(),
                "Skipping tick while rate limited"
            );
            return;
        }

        let attempt = async {
            let result = self.post_data().await;
            if let Err(error) = &result {
                self.note_rate_limit(error);
            }
            result
        };

        let result = match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(StatcordError::Panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(_) => self.stats.record_success(),
            Err(error) => {
                self.stats.record_error(&error);
                self.error_hook.on_error(&error).await;
            }
        }
    }

    fn note_rate_limit(&self, error: &StatcordError) {
        if !self.config.respect_rate_limit {
            return;
        }
        if let Some(wait) = error.retry_after() {
            let wait = wait.min(Duration::from_secs(MAX_RATE_LIMIT_WAIT_SECS));
            let now = TokioInstant::now();
            *self.rate_limited_until.lock() = Some(now.checked_add(wait).unwrap_or(now));
        }
    }

    fn rate_limit_remaining(&self) -> Option<Duration> {
        let mut until = self.rate_limited_until.lock();
        let deadline = (*until)?;
        let now = TokioInstant::now();
        if deadline > now {
            Some(deadline - now)
        } else {
            *until = None;
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// SECTION 14: TESTS
// ============================================================================
