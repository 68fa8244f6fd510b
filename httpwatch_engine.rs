//! # HttpWatch Engine - Access Log Traffic Monitor
//!
//! Follows an HTTP access log, folds every request into fixed-length time
//! buckets, keeps those buckets in a time-indexed store and evaluates
//! hysteresis alerts against the store after every flush.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              HTTPWATCH ENGINE                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  TAILER → EVENT QUEUE → INTERVAL AGGREGATOR → METRICS STORE                 │
//! │                                   │                                         │
//! │                                   └─ flush observers: REPORTER, ALERTS      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded ingestion**: the event queue never grows past its capacity
//! - **Windowed queries**: sum and average over counters and rates with exact bucket boundaries
//! - **Hysteresis alerts**: separate trigger and recovery windows per alert
//! - **Bounded alert pool**: evaluations fan out to a fixed number of workers
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports, grouped by concern.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::mem;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::runtime::Handle as RuntimeHandle;
use tokio::signal;
use tokio::sync::{broadcast, Mutex as TokioMutex, Notify, Semaphore};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ----------------------------------------------------------------------------
// Concurrency Primitives & Channels
// ----------------------------------------------------------------------------
use flume::{Receiver as FlumeReceiver, Sender as FlumeSender, TrySendError};
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;
use compact_str::CompactString;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter, Layer};

// ----------------------------------------------------------------------------
// Time, Patterns & Identifiers
// ----------------------------------------------------------------------------
use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults and limits for every stage of the pipeline.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "httpwatch-engine";
pub const ENGINE_FULL_NAME: &str = "HttpWatch Access Log Monitor";

// ----------------------------------------------------------------------------
// Queue & Pipeline
// ----------------------------------------------------------------------------

/// Default capacity of the event queue between tailer and aggregator
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default bounded wait for the next event (milliseconds)
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;

/// Default bucket length (milliseconds)
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10_000;

/// Smallest flush interval accepted when rates are normalised per second
pub const MIN_FLUSH_INTERVAL_SECONDS_UNIT_MS: u64 = 1_000;

// ----------------------------------------------------------------------------
// Alerting
// ----------------------------------------------------------------------------

/// Default size of the alert evaluation pool
pub const DEFAULT_ALERT_POOL_SIZE: usize = 2;

/// Upper bound for the alert evaluation pool
pub const MAX_ALERT_POOL_SIZE: usize = 64;

/// Grace period granted to in-flight alert evaluations on shutdown (milliseconds)
pub const DEFAULT_ALERT_SHUTDOWN_GRACE_MS: u64 = 1_000;

/// Capacity of the alert transition broadcast channel
pub const ALERT_BROADCAST_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Tailer & Reporter
// ----------------------------------------------------------------------------

/// Default access log followed by the tailer
pub const DEFAULT_ACCESS_LOG_PATH: &str = "/tmp/access.log";

/// Default destination of the dedicated alerts log
pub const DEFAULT_ALERTS_LOG_PATH: &str = "/tmp/alerts.log";

/// Default tailer polling interval (milliseconds)
pub const DEFAULT_TAILER_POLL_MS: u64 = 100;

/// Lines read per tailer poll before yielding
pub const DEFAULT_MAX_LINES_PER_POLL: usize = 10_000;

/// Sections listed in each report
pub const DEFAULT_REPORT_MAX_SECTIONS: usize = 5;

// ----------------------------------------------------------------------------
// Log Targets
// ----------------------------------------------------------------------------

pub const TARGET_ENGINE: &str = "httpwatch::engine";
pub const TARGET_CONFIG: &str = "httpwatch::config";
pub const TARGET_AGGREGATOR: &str = "httpwatch::aggregator";
pub const TARGET_STORE: &str = "httpwatch::store";
pub const TARGET_ALERTS: &str = "httpwatch::alerts";
pub const TARGET_REPORT: &str = "httpwatch::report";
pub const TARGET_TAILER: &str = "httpwatch::tailer";

// ----------------------------------------------------------------------------
// Date Formats
// ----------------------------------------------------------------------------

/// Timestamp format of the common log format, e.g. `09/May/2018:16:00:42 +0000`
pub const ACCESS_LOG_TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Alert message timestamp
pub const ALERT_TIME_FORMAT: &str = "%d/%b/%Y %H:%M:%S";

/// Report header timestamp
pub const REPORT_TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Events, buckets, counter naming and the clock abstraction.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Time
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Source of wall-clock time for the aggregator and the alert engine.
pub trait TimeSource: Send + Sync + Debug {
    fn now_millis(&self) -> EpochMillis;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_millis(&self) -> EpochMillis {
        Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for deterministic windows.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: EpochMillis) -> Self {
        Self { now: AtomicI64::new(start) }
    }

    pub fn set(&self, now: EpochMillis) {
        self.now.store(now, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, AtomicOrdering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_millis(&self) -> EpochMillis {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

/// Render epoch milliseconds in local time, falling back to the raw number.
pub fn format_local_millis(millis: EpochMillis, pattern: &str) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(at) => at.format(pattern).to_string(),
        None => millis.to_string(),
    }
}

fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ----------------------------------------------------------------------------
// 3.2 Counter Naming
// ----------------------------------------------------------------------------

pub const COUNTER_HITS: &str = "hits";
pub const COUNTER_ERRORS: &str = "errors";
pub const COUNTER_SUCCESSES: &str = "successes";
pub const SECTION_PREFIX: &str = "section";
pub const COUNTER_DELIMITER: char = ':';

/// `section:<method><path>:<counter>`
pub fn section_counter(section_key: &str, counter: &str) -> String {
    let mut name = String::with_capacity(SECTION_PREFIX.len() + section_key.len() + counter.len() + 2);
    name.push_str(SECTION_PREFIX);
    name.push(COUNTER_DELIMITER);
    name.push_str(section_key);
    name.push(COUNTER_DELIMITER);
    name.push_str(counter);
    name
}

/// Inverse of [`section_counter`] for a given counter suffix.
pub fn section_key_of<'a>(counter_name: &'a str, counter: &str) -> Option<&'a str> {
    counter_name
        .strip_prefix(SECTION_PREFIX)?
        .strip_prefix(COUNTER_DELIMITER)?
        .strip_suffix(counter)?
        .strip_suffix(COUNTER_DELIMITER)
}

// ----------------------------------------------------------------------------
// 3.3 HTTP Method
// ----------------------------------------------------------------------------

/// Request methods accepted in access log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Connect,
    Trace,
    Options,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = ();

    /// Case-sensitive, as written on the wire.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "CONNECT" => Ok(HttpMethod::Connect),
            "TRACE" => Ok(HttpMethod::Trace),
            "OPTIONS" => Ok(HttpMethod::Options),
            "PATCH" => Ok(HttpMethod::Patch),
            _ => Err(()),
        }
    }
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Log Event
// ----------------------------------------------------------------------------

/// One parsed access log line. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Client address
    pub remote_host: Option<CompactString>,
    /// RFC 1413 identity
    pub ident: Option<CompactString>,
    /// Authenticated user
    pub auth_user: Option<CompactString>,
    pub method: HttpMethod,
    /// Requested resource as written in the request line
    pub path: String,
    /// First path segment, e.g. `/api`
    pub section: CompactString,
    pub status: u16,
    pub size_bytes: u64,
    pub timestamp: DateTime<FixedOffset>,
    pub raw_line: String,
}

impl LogEvent {
    pub fn new(
        method: HttpMethod,
        section: impl Into<CompactString>,
        status: u16,
        size_bytes: u64,
        timestamp: DateTime<FixedOffset>,
        raw_line: impl Into<String>,
    ) -> Self {
        let section = section.into();
        Self {
            remote_host: None,
            ident: None,
            auth_user: None,
            method,
            path: section.to_string(),
            section,
            status,
            size_bytes,
            timestamp,
            raw_line: raw_line.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_remote_host(mut self, host: Option<CompactString>) -> Self {
        self.remote_host = host;
        self
    }

    pub fn with_ident(mut self, ident: Option<CompactString>) -> Self {
        self.ident = ident;
        self
    }

    pub fn with_auth_user(mut self, user: Option<CompactString>) -> Self {
        self.auth_user = user;
        self
    }

    /// Grouping key for per-section counters: method and section glued together (`POST/api`).
    pub fn section_key(&self) -> String {
        let mut key = String::with_capacity(self.method.as_str().len() + self.section.len());
        key.push_str(self.method.as_str());
        key.push_str(&self.section);
        key
    }

    /// 4xx and 5xx responses count as errors.
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

// ----------------------------------------------------------------------------
// 3.5 Rate Unit
// ----------------------------------------------------------------------------

/// Unit used to normalise bucket counters into rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateUnit {
    #[default]
    Seconds,
    Milliseconds,
}

impl RateUnit {
    /// Number of whole units in `interval`, never less than one.
    pub fn units_in(&self, interval: Duration) -> u64 {
        let units = match self {
            RateUnit::Seconds => interval.as_secs(),
            RateUnit::Milliseconds => u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        };
        units.max(1)
    }

    /// Suffix used in "requests/<unit>" labels.
    pub fn symbol(&self) -> &'static str {
        match self {
            RateUnit::Seconds => "s",
            RateUnit::Milliseconds => "ms",
        }
    }
}

impl Display for RateUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RateUnit::Seconds => write!(f, "seconds"),
            RateUnit::Milliseconds => write!(f, "milliseconds"),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.6 Interval Metrics (bucket)
// ----------------------------------------------------------------------------

/// Counters and rates of one closed aggregation window `[start_time, end_time)`.
///
/// Buckets are shared as `Arc<IntervalMetrics>` once flushed and never mutated again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalMetrics {
    pub start_time: EpochMillis,
    pub end_time: EpochMillis,
    counters: AHashMap<String, u64>,
    rates: AHashMap<String, u64>,
}

impl IntervalMetrics {
    pub fn new(start_time: EpochMillis, end_time: EpochMillis) -> Self {
        Self { start_time, end_time, ..Self::default() }
    }

    pub fn with_counter(mut self, name: &str, value: u64) -> Self {
        self.counters.insert(name.to_owned(), value);
        self
    }

    pub fn with_rate(mut self, name: &str, value: u64) -> Self {
        self.rates.insert(name.to_owned(), value);
        self
    }

    pub fn increment(&mut self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&mut self, name: &str, value: u64) {
        match self.counters.get_mut(name) {
            Some(current) => *current += value,
            None => {
                self.counters.insert(name.to_owned(), value);
            }
        }
    }

    pub fn set_interval(&mut self, start_time: EpochMillis, end_time: EpochMillis) {
        self.start_time = start_time;
        self.end_time = end_time;
    }

    /// One rate per counter: `counter / units` with integer truncation.
    pub fn compute_rates(&mut self, units: u64) {
        let units = units.max(1);
        self.rates = self
            .counters
            .iter()
            .map(|(name, value)| (name.clone(), value / units))
            .collect();
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn rate(&self, name: &str) -> u64 {
        self.rates.get(name).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.counters.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per concern, all convertible into MonitorError.
// Configuration problems are fatal at startup; everything else degrades.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Monitor Errors
// ----------------------------------------------------------------------------

/// The main error type of the monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MonitorError::Config(_) => false,
            MonitorError::Parse(_) => true,
            MonitorError::Store(e) => e.is_recoverable(),
            MonitorError::Queue(e) => e.is_recoverable(),
            MonitorError::Io(_) => true,
            MonitorError::Logging(_) => false,
            MonitorError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            MonitorError::Config(_) => "config",
            MonitorError::Parse(_) => "parse",
            MonitorError::Store(_) => "store",
            MonitorError::Queue(_) => "queue",
            MonitorError::Io(_) => "io",
            MonitorError::Logging(_) => "logging",
            MonitorError::Internal(_) => "internal",
        }
    }
}

/// Result type alias for monitor operations
pub type MonitorResult<T> = Result<T, MonitorError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String, source: Option<Box<dyn StdError + Send + Sync>> },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Unknown alert kind '{name}'")]
    UnknownAlertKind { name: String },

    #[error("Poll timeout ({poll_timeout_ms}ms) is larger than the flush interval ({flush_interval_ms}ms)")]
    PollTimeoutExceedsFlushInterval { poll_timeout_ms: u64, flush_interval_ms: u64 },

    #[error("Failed to render configuration: {message}")]
    RenderFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue { field: field.into(), message: message.into() }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField { field: field.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Parse Errors
// ----------------------------------------------------------------------------

/// Rejected access log input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid log line, {reason}: {line}")]
    InvalidLogLine { reason: String, line: String },
}

impl ParseError {
    pub fn invalid(reason: impl Into<String>, line: &str) -> Self {
        ParseError::InvalidLogLine { reason: reason.into(), line: line.to_owned() }
    }

    pub fn reason(&self) -> &str {
        match self {
            ParseError::InvalidLogLine { reason, .. } => reason,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Store Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Metrics store is empty, no data yet")]
    Empty,

    #[error("Bucket starting at {start_time} was rejected: {reason}")]
    Rejected { start_time: EpochMillis, reason: String },
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::Empty => true,
            StoreError::Rejected { .. } => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ----------------------------------------------------------------------------
// 4.5 Queue Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Event queue is full, event dropped")]
    Full,

    #[error("Event queue is closed")]
    Closed,
}

impl QueueError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, QueueError::Full)
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - Built-in defaults
// - TOML file
// - HTTPWATCH_* environment overrides (`__` separates nested keys)
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of the monitor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Access log follower
    #[serde(default)]
    pub tailer: TailerConfig,

    /// Event queue between tailer and aggregator
    #[serde(default)]
    pub queue: QueueConfig,

    /// Bucket timing
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Bucket history
    #[serde(default)]
    pub store: StoreConfig,

    /// Console report
    #[serde(default)]
    pub reporter: ReporterConfig,

    /// Alert definitions and evaluation pool
    #[serde(default)]
    pub alerter: AlerterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }

        Self::extract(Self::figment().merge(Toml::file(path)))
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(Self::figment())
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
            source: Some(Box::new(e)),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed("HTTPWATCH_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string(), source: None })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let aggregator = &self.aggregator;
        if aggregator.poll_timeout_ms > aggregator.flush_interval_ms {
            return Err(ConfigError::PollTimeoutExceedsFlushInterval {
                poll_timeout_ms: aggregator.poll_timeout_ms,
                flush_interval_ms: aggregator.flush_interval_ms,
            });
        }
        if aggregator.poll_timeout_ms == 0 {
            return Err(ConfigError::invalid_value("aggregator.poll_timeout_ms", "must be at least 1ms"));
        }
        if aggregator.rate_unit == RateUnit::Seconds
            && aggregator.flush_interval_ms < MIN_FLUSH_INTERVAL_SECONDS_UNIT_MS
        {
            return Err(ConfigError::invalid_value(
                "aggregator.flush_interval_ms",
                format!(
                    "must be at least {}ms when rates are per second",
                    MIN_FLUSH_INTERVAL_SECONDS_UNIT_MS
                ),
            ));
        }

        if self.queue.capacity == 0 {
            return Err(ConfigError::invalid_value("queue.capacity", "must be at least 1"));
        }

        if self.alerter.pool_size == 0 || self.alerter.pool_size > MAX_ALERT_POOL_SIZE {
            return Err(ConfigError::invalid_value(
                "alerter.pool_size",
                format!("must be between 1 and {}", MAX_ALERT_POOL_SIZE),
            ));
        }

        if self.reporter.max_sections == 0 {
            return Err(ConfigError::invalid_value("reporter.max_sections", "must be at least 1"));
        }

        if self.tailer.poll_interval_ms == 0 {
            return Err(ConfigError::invalid_value("tailer.poll_interval_ms", "must be at least 1ms"));
        }
        if self.tailer.max_lines_per_poll == 0 {
            return Err(ConfigError::invalid_value("tailer.max_lines_per_poll", "must be at least 1"));
        }

        if let Some(0) = self.store.retention_buckets {
            return Err(ConfigError::invalid_value("store.retention_buckets", "must be at least 1 when set"));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("expected one of {}", LOG_FORMATS.join(", ")),
            ));
        }

        Ok(())
    }

    /// Render this configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::RenderFailed { message: e.to_string() })
    }

    /// Create a default config file
    pub fn generate_default_config() -> Result<String, ConfigError> {
        Self::default().to_toml_string()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Tailer Configuration
// ----------------------------------------------------------------------------

/// Access log follower settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailerConfig {
    /// File to follow
    pub path: PathBuf,
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound on lines consumed per poll
    pub max_lines_per_poll: usize,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_ACCESS_LOG_PATH),
            poll_interval_ms: DEFAULT_TAILER_POLL_MS,
            max_lines_per_poll: DEFAULT_MAX_LINES_PER_POLL,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.3 Queue Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of buffered events
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// What producers do when the queue is full
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: default_queue_capacity(), backpressure: BackpressurePolicy::default() }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

// ----------------------------------------------------------------------------
// 5.4 Aggregator Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Bounded wait for the next event, must not exceed the flush interval
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Bucket length
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Rate normalisation unit
    #[serde(default)]
    pub rate_unit: RateUnit,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout(),
            flush_interval_ms: default_flush_interval(),
            rate_unit: RateUnit::default(),
        }
    }
}

fn default_poll_timeout() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_flush_interval() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

// ----------------------------------------------------------------------------
// 5.5 Store & Reporter Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Keep at most this many buckets; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_buckets: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sections listed per report
    #[serde(default = "default_max_sections")]
    pub max_sections: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self { enabled: true, max_sections: default_max_sections() }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_sections() -> usize {
    DEFAULT_REPORT_MAX_SECTIONS
}

// ----------------------------------------------------------------------------
// 5.6 Alerter Configuration
// ----------------------------------------------------------------------------

/// Alert pool settings and alert definitions.
///
/// Only the names listed in `enabled` are built. A definition's kind defaults
/// to its name, so `[alerter.alerts.traffic]` builds a high-traffic alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlerterConfig {
    /// Number of concurrent alert evaluations
    #[serde(default = "default_alert_pool_size")]
    pub pool_size: usize,

    /// Bounded wait for in-flight evaluations on shutdown
    #[serde(default = "default_alert_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Alert names to build
    #[serde(default = "default_enabled_alerts")]
    pub enabled: Vec<String>,

    /// Definitions keyed by alert name
    #[serde(default = "default_alert_definitions")]
    pub alerts: BTreeMap<String, AlertDefinition>,
}

impl Default for AlerterConfig {
    fn default() -> Self {
        Self {
            pool_size: default_alert_pool_size(),
            shutdown_grace_ms: default_alert_shutdown_grace(),
            enabled: default_enabled_alerts(),
            alerts: default_alert_definitions(),
        }
    }
}

fn default_alert_pool_size() -> usize {
    DEFAULT_ALERT_POOL_SIZE
}

fn default_alert_shutdown_grace() -> u64 {
    DEFAULT_ALERT_SHUTDOWN_GRACE_MS
}

fn default_enabled_alerts() -> Vec<String> {
    vec!["traffic".into()]
}

fn default_alert_definitions() -> BTreeMap<String, AlertDefinition> {
    let mut alerts = BTreeMap::new();
    alerts.insert("traffic".into(), AlertDefinition::new(10, 120_000, 120_000));
    alerts.insert("nodata".into(), AlertDefinition::new(0, 60_000, 60_000));
    alerts
}

/// Raw alert parameters. Values stay loose until the alert is built so a
/// single bad definition can be skipped without rejecting the whole file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertDefinition {
    /// Alert kind identifier; the definition name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<AlertParam>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_window_ms: Option<AlertParam>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_window_ms: Option<AlertParam>,
}

impl AlertDefinition {
    pub fn new(threshold: i64, alert_window_ms: i64, recovery_window_ms: i64) -> Self {
        Self {
            kind: None,
            threshold: Some(AlertParam::Int(threshold)),
            alert_window_ms: Some(AlertParam::Int(alert_window_ms)),
            recovery_window_ms: Some(AlertParam::Int(recovery_window_ms)),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// An alert parameter as written: a number, or text that should hold one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlertParam {
    Int(i64),
    Text(String),
}

impl AlertParam {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AlertParam::Int(value) => Some(*value),
            AlertParam::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl Display for AlertParam {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AlertParam::Int(value) => write!(f, "{}", value),
            AlertParam::Text(text) => write!(f, "{}", text),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.7 Logging Configuration
// ----------------------------------------------------------------------------

/// Recognised log level names
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Recognised console formats
pub const LOG_FORMATS: &[&str] = &["pretty", "compact", "json"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is unset
    pub level: String,
    /// Console format: pretty, compact or json
    pub format: String,
    /// ANSI colors on the console
    pub colors: bool,
    /// Include file and line in console records
    pub source_location: bool,
    /// Dedicated alerts log; alert transitions are copied there
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "compact".into(),
            colors: true,
            source_location: false,
            alerts_file: Some(PathBuf::from(DEFAULT_ALERTS_LOG_PATH)),
        }
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Console output filtered by EnvFilter, plus an optional alerts file that
// only receives records from the alerts target.
// ============================================================================

/// Keeps the non-blocking alerts writer alive; flushes on drop.
#[derive(Debug)]
pub struct LoggingGuard {
    _alerts_writer: Option<WorkerGuard>,
}

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn alerts_file_layer<S>(writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + Send + Sync + 'static,
{
    subscriber_fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(Targets::new().with_target(TARGET_ALERTS, LevelFilter::INFO))
        .boxed()
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> MonitorResult<LoggingGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let (alerts_writer, alerts_guard) = match &config.alerts_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| MonitorError::Logging(format!("invalid alerts file: {}", path.display())))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let result = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    subscriber_fmt::layer()
                        .json()
                        .with_target(true)
                        .with_file(config.source_location)
                        .with_line_number(config.source_location)
                        .with_thread_names(true)
                        .with_filter(env_filter),
                )
                .with(alerts_writer.map(alerts_file_layer));
            tracing::subscriber::set_global_default(subscriber)
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    subscriber_fmt::layer()
                        .pretty()
                        .with_ansi(config.colors)
                        .with_target(true)
                        .with_file(config.source_location)
                        .with_line_number(config.source_location)
                        .with_thread_names(true)
                        .with_filter(env_filter),
                )
                .with(alerts_writer.map(alerts_file_layer));
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    subscriber_fmt::layer()
                        .compact()
                        .with_ansi(config.colors)
                        .with_target(true)
                        .with_filter(env_filter),
                )
                .with(alerts_writer.map(alerts_file_layer));
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    result.map_err(|e| MonitorError::Logging(format!("Failed to set logger: {}", e)))?;

    info!(
        target: TARGET_ENGINE,
        level = %config.level,
        format = %config.format,
        alerts_file = ?config.alerts_file,
        "Logging initialized"
    );

    Ok(LoggingGuard { _alerts_writer: alerts_guard })
}

// ============================================================================
// SECTION 7: EVENT QUEUE & BACKPRESSURE
// ============================================================================
// Bounded FIFO between the log producer and the aggregator:
// - flume bounded channel underneath
// - block or drop-newest when full
// - counters for sent, received and dropped events
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Backpressure Policy
// ----------------------------------------------------------------------------

/// What a producer does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for space
    #[default]
    Block,
    /// Reject the incoming event
    DropNewest,
}

// ----------------------------------------------------------------------------
// 7.2 Queue Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct QueueStats {
    /// Events accepted by the queue
    pub sent: AtomicU64,
    /// Events handed to the consumer
    pub received: AtomicU64,
    /// Events rejected because the queue was full
    pub dropped: AtomicU64,
    /// Deepest queue length observed
    pub high_water_mark: AtomicUsize,
}

impl QueueStats {
    pub fn record_send(&self, depth: usize) {
        self.sent.fetch_add(1, AtomicOrdering::Relaxed);
        self.high_water_mark.fetch_max(depth, AtomicOrdering::Relaxed);
    }

    pub fn record_receive(&self) {
        self.received.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            sent: self.sent.load(AtomicOrdering::Relaxed),
            received: self.received.load(AtomicOrdering::Relaxed),
            dropped: self.dropped.load(AtomicOrdering::Relaxed),
            high_water_mark: self.high_water_mark.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub high_water_mark: usize,
}

// ----------------------------------------------------------------------------
// 7.3 Queue Endpoints
// ----------------------------------------------------------------------------

/// Constructor for the producer and consumer halves.
#[derive(Debug)]
pub struct EventQueue;

impl EventQueue {
    /// Create a bounded queue. A zero capacity is raised to one.
    pub fn bounded(capacity: usize, policy: BackpressurePolicy) -> (EventSender, EventReceiver) {
        let capacity = capacity.max(1);
        let (sender, receiver) = flume::bounded(capacity);
        let stats = Arc::new(QueueStats::default());
        (
            EventSender { inner: sender, policy, capacity, stats: Arc::clone(&stats) },
            EventReceiver { inner: receiver, stats },
        )
    }
}

/// Producer half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    inner: FlumeSender<LogEvent>,
    policy: BackpressurePolicy,
    capacity: usize,
    stats: Arc<QueueStats>,
}

impl EventSender {
    /// Enqueue following the configured policy.
    ///
    /// `Block` suspends until there is room; `DropNewest` returns
    /// [`QueueError::Full`] immediately.
    pub async fn send(&self, event: LogEvent) -> Result<(), QueueError> {
        match self.policy {
            BackpressurePolicy::Block => {
                self.inner.send_async(event).await.map_err(|_| QueueError::Closed)?;
                self.stats.record_send(self.inner.len());
                Ok(())
            }
            BackpressurePolicy::DropNewest => self.try_send(event),
        }
    }

    /// Blocking variant of [`EventSender::send`] for producers on plain threads.
    pub fn send_blocking(&self, event: LogEvent) -> Result<(), QueueError> {
        match self.policy {
            BackpressurePolicy::Block => {
                self.inner.send(event).map_err(|_| QueueError::Closed)?;
                self.stats.record_send(self.inner.len());
                Ok(())
            }
            BackpressurePolicy::DropNewest => self.try_send(event),
        }
    }

    /// Enqueue without waiting, whatever the policy.
    pub fn try_send(&self, event: LogEvent) -> Result<(), QueueError> {
        match self.inner.try_send(event) {
            Ok(()) => {
                self.stats.record_send(self.inner.len());
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.stats.record_drop();
                Err(QueueError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Result of a bounded wait on the queue.
#[derive(Debug)]
pub enum RecvOutcome {
    Event(LogEvent),
    Timeout,
    /// Every sender is gone and the queue is drained
    Closed,
}

/// Consumer half, owned by the aggregator.
#[derive(Debug)]
pub struct EventReceiver {
    inner: FlumeReceiver<LogEvent>,
    stats: Arc<QueueStats>,
}

impl EventReceiver {
    /// Wait at most `wait` for the next event.
    pub async fn recv_timeout(&self, wait: Duration) -> RecvOutcome {
        match timeout(wait, self.inner.recv_async()).await {
            Ok(Ok(event)) => {
                self.stats.record_receive();
                RecvOutcome::Event(event)
            }
            Ok(Err(_)) => RecvOutcome::Closed,
            Err(_) => RecvOutcome::Timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }
}

// ============================================================================
// SECTION 8: INTERVAL ACCUMULATOR
// ============================================================================

/// Counters of the bucket currently being filled. Owned by the aggregation loop.
#[derive(Debug, Default)]
pub struct IntervalAccumulator {
    current: IntervalMetrics,
    events: u64,
}

impl IntervalAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one event: `hits`, then `errors` (status >= 400) or `successes`,
    /// then the same pair scoped to the event's section.
    pub fn record(&mut self, event: &LogEvent) {
        let outcome = if event.is_error() { COUNTER_ERRORS } else { COUNTER_SUCCESSES };
        let section_key = event.section_key();

        self.current.increment(COUNTER_HITS);
        self.current.increment(outcome);
        self.current.increment(&section_counter(&section_key, COUNTER_HITS));
        self.current.increment(&section_counter(&section_key, outcome));
        self.events += 1;
    }

    /// Hand over the open bucket and start an empty one.
    pub fn take(&mut self) -> IntervalMetrics {
        self.events = 0;
        mem::take(&mut self.current)
    }

    pub fn current(&self) -> &IntervalMetrics {
        &self.current
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events == 0
    }
}

// ============================================================================
// SECTION 9: METRICS STORE
// ============================================================================
// Time-ordered bucket history with windowed queries.
//
// Window rule for sum/average queries at (now, window):
//   lower = now - window
//   0 when the store is empty or lower < first bucket start
//   otherwise every bucket with lower <= start < now
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Store Trait
// ----------------------------------------------------------------------------

/// Bucket history shared between one writer and many readers.
pub trait MetricsStore: Send + Sync + Debug {
    /// Append a bucket keyed by its start time and fold it into the cumulative sums.
    fn insert(&self, bucket: Arc<IntervalMetrics>) -> StoreResult<()>;

    /// Sum of `name` over the window.
    fn sum_counter(&self, name: &str, now_ms: EpochMillis, window_ms: u64) -> u64;

    /// Truncated mean of counter `name` over the window.
    fn average_counter(&self, name: &str, now_ms: EpochMillis, window_ms: u64) -> u64;

    /// Truncated mean of rate `name` over the window.
    fn average_rate(&self, name: &str, now_ms: EpochMillis, window_ms: u64) -> u64;

    /// All-time total of counter `name`.
    fn cumulative_sum(&self, name: &str) -> u64;

    /// Most recent bucket.
    fn latest(&self) -> StoreResult<Arc<IntervalMetrics>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// 9.2 In-Memory Store
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreInner {
    buckets: BTreeMap<EpochMillis, Arc<IntervalMetrics>>,
    cumulative: AHashMap<String, u64>,
}

/// In-memory store behind a single reader-writer lock, so bucket history and
/// cumulative sums are always observed together.
#[derive(Debug, Default)]
pub struct InMemoryMetricsStore {
    inner: RwLock<StoreInner>,
    /// Oldest buckets are evicted beyond this many; windows reaching past the
    /// oldest kept bucket then answer 0
    retention: Option<usize>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Option<usize>) -> Self {
        Self { inner: RwLock::new(StoreInner::default()), retention: retention.map(|r| r.max(1)) }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::with_retention(config.retention_buckets)
    }

    /// Start times of every stored bucket, oldest first.
    pub fn bucket_start_times(&self) -> Vec<EpochMillis> {
        self.inner.read().buckets.keys().copied().collect()
    }

    /// Fold `extract` over the buckets selected by the window rule.
    /// `None` when the window is not covered by the stored history.
    fn fold_window<F>(&self, now_ms: EpochMillis, window_ms: u64, extract: F) -> Option<(u64, u64)>
    where
        F: Fn(&IntervalMetrics) -> u64,
    {
        let inner = self.inner.read();
        let first_start = *inner.buckets.keys().next()?;
        let lower_bound = now_ms.saturating_sub(i64::try_from(window_ms).unwrap_or(i64::MAX));
        if lower_bound < first_start {
            return None;
        }

        let (sum, count) = inner
            .buckets
            .range(lower_bound..now_ms)
            .fold((0u64, 0u64), |(sum, count), (_, bucket)| (sum + extract(bucket), count + 1));
        Some((sum, count))
    }

    fn average(folded: Option<(u64, u64)>) -> u64 {
        match folded {
            Some((sum, count)) if count > 0 => sum / count,
            _ => 0,
        }
    }
}

impl MetricsStore for InMemoryMetricsStore {
    fn insert(&self, bucket: Arc<IntervalMetrics>) -> StoreResult<()> {
        let mut inner = self.inner.write();
        for (name, value) in bucket.counters() {
            match inner.cumulative.get_mut(name) {
                Some(total) => *total += value,
                None => {
                    inner.cumulative.insert(name.to_owned(), value);
                }
            }
        }

        let start_time = bucket.start_time;
        if inner.buckets.insert(start_time, bucket).is_some() {
            warn!(target: TARGET_STORE, start_time, "Bucket start time already stored, overwriting");
        }

        if let Some(retention) = self.retention {
            while inner.buckets.len() > retention {
                if let Some((evicted, _)) = inner.buckets.pop_first() {
                    trace!(target: TARGET_STORE, evicted, "Bucket evicted by retention");
                }
            }
        }

        trace!(target: TARGET_STORE, start_time, buckets = inner.buckets.len(), "Bucket stored");
        Ok(())
    }

    fn sum_counter(&self, name: &str, now_ms: EpochMillis, window_ms: u64) -> u64 {
        self.fold_window(now_ms, window_ms, |bucket| bucket.counter(name))
            .map(|(sum, _)| sum)
            .unwrap_or(0)
    }

    fn average_counter(&self, name: &str, now_ms: EpochMillis, window_ms: u64) -> u64 {
        Self::average(self.fold_window(now_ms, window_ms, |bucket| bucket.counter(name)))
    }

    fn average_rate(&self, name: &str, now_ms: EpochMillis, window_ms: u64) -> u64 {
        Self::average(self.fold_window(now_ms, window_ms, |bucket| bucket.rate(name)))
    }

    fn cumulative_sum(&self, name: &str) -> u64 {
        self.inner.read().cumulative.get(name).copied().unwrap_or(0)
    }

    fn latest(&self) -> StoreResult<Arc<IntervalMetrics>> {
        self.inner
            .read()
            .buckets
            .values()
            .next_back()
            .cloned()
            .ok_or(StoreError::Empty)
    }

    fn len(&self) -> usize {
        self.inner.read().buckets.len()
    }
}

// ============================================================================
// SECTION 10: QUEUE, ACCUMULATOR & STORE TESTS
// ============================================================================

#[cfg(test)]
mod store_tests {
    use super::*;
    use proptest::prelude::*;

    fn event(method: HttpMethod, section: &str, status: u16) -> LogEvent {
        let timestamp = DateTime::parse_from_str("09/May/2018:16:00:42 +0000", ACCESS_LOG_TIME_FORMAT).unwrap();
        LogEvent::new(method, section, status, 0, timestamp, "")
    }

    /// Two buckets: start 1 {test=20, test2=40}, start 2 {test=10, test3=30}.
    fn build_store() -> InMemoryMetricsStore {
        let store = InMemoryMetricsStore::new();
        let first = IntervalMetrics::new(1, 2)
            .with_counter("test", 20)
            .with_counter("test2", 40)
            .with_rate("test", 2)
            .with_rate("test2", 4);
        let second = IntervalMetrics::new(2, 3)
            .with_counter("test", 10)
            .with_counter("test3", 30)
            .with_rate("test", 1)
            .with_rate("test3", 3);
        store.insert(Arc::new(first)).unwrap();
        store.insert(Arc::new(second)).unwrap();
        store
    }

    #[test]
    fn test_section_counter_naming() {
        assert_eq!(section_counter("POST/api", COUNTER_HITS), "section:POST/api:hits");
        assert_eq!(section_key_of("section:POST/api:hits", COUNTER_HITS), Some("POST/api"));
        assert_eq!(section_key_of("section:POST/api:errors", COUNTER_HITS), None);
        assert_eq!(section_key_of("hits", COUNTER_HITS), None);
    }

    #[test]
    fn test_accumulator_counts_globals_and_sections() {
        let mut acc = IntervalAccumulator::new();
        acc.record(&event(HttpMethod::Get, "/api", 200));
        acc.record(&event(HttpMethod::Get, "/api", 404));
        acc.record(&event(HttpMethod::Post, "/b", 500));

        let bucket = acc.current();
        assert_eq!(bucket.counter("hits"), 3);
        assert_eq!(bucket.counter("errors"), 2);
        assert_eq!(bucket.counter("successes"), 1);
        assert_eq!(bucket.counter("section:GET/api:hits"), 2);
        assert_eq!(bucket.counter("section:GET/api:errors"), 1);
        assert_eq!(bucket.counter("section:GET/api:successes"), 1);
        assert_eq!(bucket.counter("section:POST/b:hits"), 1);
        assert_eq!(bucket.counter("section:POST/b:errors"), 1);
        assert_eq!(bucket.counter("section:POST/b:successes"), 0);
        assert_eq!(bucket.counter_count(), 8);
        assert_eq!(acc.events(), 3);
    }

    #[test]
    fn test_accumulator_take_resets() {
        let mut acc = IntervalAccumulator::new();
        acc.record(&event(HttpMethod::Get, "/api", 399));
        let taken = acc.take();
        assert_eq!(taken.counter("successes"), 1);
        assert!(acc.is_empty());
        assert!(acc.current().is_empty());
    }

    #[test]
    fn test_rate_truncation() {
        let mut bucket = IntervalMetrics::new(0, 2000).with_counter("a", 10).with_counter("b", 5).with_counter("c", 1);
        bucket.compute_rates(RateUnit::Seconds.units_in(Duration::from_millis(2000)));
        assert_eq!(bucket.rate("a"), 5);
        assert_eq!(bucket.rate("b"), 2);
        assert_eq!(bucket.rate("c"), 0);
    }

    #[test]
    fn test_rate_unit_never_zero() {
        assert_eq!(RateUnit::Seconds.units_in(Duration::from_millis(500)), 1);
        assert_eq!(RateUnit::Milliseconds.units_in(Duration::from_millis(2)), 2);
        assert_eq!(RateUnit::Milliseconds.units_in(Duration::ZERO), 1);
    }

    #[test]
    fn test_cumulative_sums() {
        let store = build_store();
        assert_eq!(store.cumulative_sum("test"), 30);
        assert_eq!(store.cumulative_sum("test2"), 40);
        assert_eq!(store.cumulative_sum("test3"), 30);
        assert_eq!(store.cumulative_sum("test4"), 0);
    }

    #[test]
    fn test_average_counter() {
        let store = build_store();
        assert_eq!(store.average_counter("test", 5, 3), 10);
        assert_eq!(store.average_counter("test", 5, 4), 15);
        assert_eq!(store.average_counter("test", 5, 1), 0);
        assert_eq!(store.average_counter("test2", 3, 1), 0);
        assert_eq!(store.average_counter("test2", 3, 2), 20);
        assert_eq!(store.average_counter("test3", 3, 1), 30);
        assert_eq!(store.average_counter("test3", 3, 2), 15);
    }

    #[test]
    fn test_sum_counter() {
        let store = build_store();
        assert_eq!(store.sum_counter("test", 5, 1), 0);
        assert_eq!(store.sum_counter("test", 5, 3), 10);
        assert_eq!(store.sum_counter("test", 5, 4), 30);
        assert_eq!(store.sum_counter("test2", 5, 3), 0);
        assert_eq!(store.sum_counter("test2", 5, 4), 40);
        assert_eq!(store.sum_counter("test2", 1, 2), 0);
    }

    #[test]
    fn test_average_rate() {
        let store = build_store();
        assert_eq!(store.average_rate("test", 5, 1), 0);
        assert_eq!(store.average_rate("test", 5, 3), 1);
        assert_eq!(store.average_rate("test", 5, 4), 1);
        assert_eq!(store.average_rate("test2", 5, 3), 0);
        assert_eq!(store.average_rate("test", 1, 2), 0);
    }

    #[test]
    fn test_window_coverage_boundary() {
        let store = build_store();
        // lower bound 4 lies after both buckets
        assert_eq!(store.sum_counter("test", 5, 1), 0);
        // [1, 3) holds both starts
        assert_eq!(store.sum_counter("test", 3, 2), 30);
        // a bucket starting exactly at now is excluded
        assert_eq!(store.sum_counter("test", 2, 1), 20);
        // window reaching before the first bucket is not covered
        assert_eq!(store.sum_counter("test", 3, 3), 0);
    }

    #[test]
    fn test_empty_store() {
        let store = InMemoryMetricsStore::new();
        assert!(store.is_empty());
        assert_eq!(store.sum_counter("test", 5, 1), 0);
        assert_eq!(store.average_counter("test", 5, 1), 0);
        assert_eq!(store.average_rate("test", 5, 1), 0);
        assert_eq!(store.cumulative_sum("test"), 0);
        assert_eq!(store.latest().unwrap_err(), StoreError::Empty);
    }

    #[test]
    fn test_latest_is_last_start_time() {
        let store = build_store();
        let latest = store.latest().unwrap();
        assert_eq!(latest.start_time, 2);
        assert_eq!(latest.counter("test3"), 30);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let store = InMemoryMetricsStore::with_retention(Some(2));
        for start in 0..5 {
            store.insert(Arc::new(IntervalMetrics::new(start, start + 1).with_counter("hits", 1))).unwrap();
        }
        assert_eq!(store.bucket_start_times(), vec![3, 4]);
        assert_eq!(store.cumulative_sum("hits"), 5);
        // window reaching start 2 is no longer covered
        assert_eq!(store.sum_counter("hits", 5, 3), 0);
        assert_eq!(store.sum_counter("hits", 5, 2), 2);
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let store = Arc::new(InMemoryMetricsStore::new());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for start in 0..500 {
                    store
                        .insert(Arc::new(IntervalMetrics::new(start, start + 1).with_counter("hits", 2)))
                        .unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let total = store.cumulative_sum("hits");
                        assert_eq!(total % 2, 0);
                        let _ = store.average_counter("hits", 250, 10);
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.len(), 500);
        assert_eq!(store.cumulative_sum("hits"), 1000);
    }

    #[test]
    fn test_queue_drop_newest_rejects_when_full() {
        let (tx, rx) = EventQueue::bounded(2, BackpressurePolicy::DropNewest);
        tx.try_send(event(HttpMethod::Get, "/a", 200)).unwrap();
        tx.try_send(event(HttpMethod::Get, "/a", 200)).unwrap();
        assert_eq!(tx.try_send(event(HttpMethod::Get, "/a", 200)), Err(QueueError::Full));
        assert_eq!(tx.len(), 2);
        let stats = tx.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.high_water_mark, 2);
        drop(rx);
        assert_eq!(tx.try_send(event(HttpMethod::Get, "/a", 200)), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_queue_block_waits_for_space() {
        let (tx, rx) = EventQueue::bounded(1, BackpressurePolicy::Block);
        tx.send(event(HttpMethod::Get, "/a", 200)).await.unwrap();

        let blocked = timeout(Duration::from_millis(50), tx.send(event(HttpMethod::Get, "/b", 200))).await;
        assert!(blocked.is_err(), "send should wait while the queue is full");
        assert_eq!(tx.len(), 1);

        match rx.recv_timeout(Duration::from_millis(50)).await {
            RecvOutcome::Event(e) => assert_eq!(e.section, "/a"),
            other => panic!("unexpected outcome {:?}", other),
        }
        tx.send(event(HttpMethod::Get, "/c", 200)).await.unwrap();
        assert_eq!(rx.stats().received, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_blocking_producer_thread() {
        let (tx, rx) = EventQueue::bounded(1, BackpressurePolicy::Block);
        let producer = std::thread::spawn(move || {
            for section in ["/a", "/b", "/c"] {
                tx.send_blocking(event(HttpMethod::Get, section, 200)).unwrap();
            }
            tx.stats()
        });

        let mut sections = Vec::new();
        while sections.len() < 3 {
            match rx.recv_timeout(Duration::from_secs(5)).await {
                RecvOutcome::Event(e) => sections.push(e.section.to_string()),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        let stats = producer.join().unwrap();
        assert_eq!(sections, vec!["/a", "/b", "/c"]);
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.dropped, 0);
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)).await, RecvOutcome::Closed));
    }

    #[tokio::test]
    async fn test_receiver_timeout_and_close() {
        let (tx, rx) = EventQueue::bounded(4, BackpressurePolicy::Block);
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)).await, RecvOutcome::Timeout));
        tx.try_send(event(HttpMethod::Put, "/x", 201)).unwrap();
        drop(tx);
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)).await, RecvOutcome::Event(_)));
        assert!(matches!(rx.recv_timeout(Duration::from_millis(10)).await, RecvOutcome::Closed));
    }

    proptest! {
        #[test]
        fn prop_queries_are_idempotent(
            counts in proptest::collection::vec(0u64..1000, 1..20),
            now in 0i64..40,
            window in 0u64..40,
        ) {
            let store = InMemoryMetricsStore::new();
            for (i, count) in counts.iter().enumerate() {
                let start = i as i64 * 2;
                let mut bucket = IntervalMetrics::new(start, start + 2).with_counter("hits", *count);
                bucket.compute_rates(2);
                store.insert(Arc::new(bucket)).unwrap();
            }
            prop_assert_eq!(store.sum_counter("hits", now, window), store.sum_counter("hits", now, window));
            prop_assert_eq!(store.average_counter("hits", now, window), store.average_counter("hits", now, window));
            prop_assert_eq!(store.average_rate("hits", now, window), store.average_rate("hits", now, window));
            prop_assert!(store.average_counter("hits", now, window) <= store.sum_counter("hits", now, window));
            prop_assert_eq!(store.cumulative_sum("hits"), counts.iter().sum::<u64>());
        }

        #[test]
        fn prop_start_times_stay_ordered(starts in proptest::collection::btree_set(0i64..10_000, 1..50)) {
            let store = InMemoryMetricsStore::new();
            for start in starts.iter().rev() {
                store.insert(Arc::new(IntervalMetrics::new(*start, start + 1))).unwrap();
            }
            let stored = store.bucket_start_times();
            prop_assert!(stored.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(stored.len(), starts.len());
            prop_assert_eq!(store.latest().unwrap().start_time, *starts.iter().next_back().unwrap());
        }
    }
}

// ============================================================================
// SECTION 11: FLUSH OBSERVERS & INTERVAL AGGREGATOR
// ============================================================================
// A single loop owns the open bucket:
//   1. close and flush it once more than F has elapsed since the last flush
//   2. wait at most P for the next event and count it
// Observers run synchronously, in registration order, after the store
// accepts the bucket. Cancellation exits the loop without a final flush.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Flush Observer
// ----------------------------------------------------------------------------

/// Callback invoked with every bucket the store accepted.
pub trait FlushObserver: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Runs on the aggregation loop; a slow observer delays the next cycle.
    fn on_flush(&self, bucket: &Arc<IntervalMetrics>);
}

// ----------------------------------------------------------------------------
// 11.2 Aggregator Settings & Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorSettings {
    /// Bounded wait for the next event
    pub poll_timeout: Duration,
    /// Bucket length, also the rate denominator
    pub flush_interval: Duration,
    pub rate_unit: RateUnit,
}

impl AggregatorSettings {
    pub fn new(poll_timeout: Duration, flush_interval: Duration, rate_unit: RateUnit) -> Self {
        Self { poll_timeout, flush_interval, rate_unit }
    }

    pub fn from_config(config: &AggregatorConfig) -> Self {
        Self {
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            rate_unit: config.rate_unit,
        }
    }
}

#[derive(Debug, Default)]
pub struct AggregatorStats {
    /// Buckets accepted by the store
    pub flushes: AtomicU64,
    /// Events counted into buckets
    pub events: AtomicU64,
    /// Buckets the store refused
    pub rejected: AtomicU64,
}

impl AggregatorStats {
    pub fn snapshot(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            flushes: self.flushes.load(AtomicOrdering::Relaxed),
            events: self.events.load(AtomicOrdering::Relaxed),
            rejected: self.rejected.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStatsSnapshot {
    pub flushes: u64,
    pub events: u64,
    pub rejected: u64,
}

// ----------------------------------------------------------------------------
// 11.3 Interval Aggregator
// ----------------------------------------------------------------------------

/// Turns the event stream into fixed-length buckets.
#[derive(Debug)]
pub struct IntervalAggregator {
    settings: AggregatorSettings,
    receiver: EventReceiver,
    store: Arc<dyn MetricsStore>,
    clock: Arc<dyn TimeSource>,
    observers: Vec<Arc<dyn FlushObserver>>,
    accumulator: IntervalAccumulator,
    last_flush: EpochMillis,
    stats: Arc<AggregatorStats>,
}

impl IntervalAggregator {
    /// Fails when the poll timeout exceeds the flush interval: the loop could
    /// then sleep through a bucket boundary.
    pub fn new(
        settings: AggregatorSettings,
        receiver: EventReceiver,
        store: Arc<dyn MetricsStore>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, ConfigError> {
        if settings.poll_timeout > settings.flush_interval {
            return Err(ConfigError::PollTimeoutExceedsFlushInterval {
                poll_timeout_ms: u64::try_from(settings.poll_timeout.as_millis()).unwrap_or(u64::MAX),
                flush_interval_ms: u64::try_from(settings.flush_interval.as_millis()).unwrap_or(u64::MAX),
            });
        }

        let last_flush = clock.now_millis();
        Ok(Self {
            settings,
            receiver,
            store,
            clock,
            observers: Vec::new(),
            accumulator: IntervalAccumulator::new(),
            last_flush,
            stats: Arc::new(AggregatorStats::default()),
        })
    }

    /// Observers are notified in the order they were added.
    pub fn add_observer(&mut self, observer: Arc<dyn FlushObserver>) {
        debug!(target: TARGET_AGGREGATOR, observer = observer.name(), "Flush observer registered");
        self.observers.push(observer);
    }

    pub fn stats(&self) -> Arc<AggregatorStats> {
        Arc::clone(&self.stats)
    }

    pub fn settings(&self) -> AggregatorSettings {
        self.settings
    }

    /// Count one event into the open bucket.
    pub fn record(&mut self, event: &LogEvent) {
        self.accumulator.record(event);
        self.stats.events.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Close `bucket` over `[start, end)`, derive its rates from the configured
    /// flush interval and hand it to the store. Observers only see buckets the
    /// store accepted.
    pub fn flush(
        &self,
        mut bucket: IntervalMetrics,
        start: EpochMillis,
        end: EpochMillis,
    ) -> Arc<IntervalMetrics> {
        bucket.set_interval(start, end);
        bucket.compute_rates(self.settings.rate_unit.units_in(self.settings.flush_interval));
        let bucket = Arc::new(bucket);

        match self.store.insert(Arc::clone(&bucket)) {
            Ok(()) => {
                self.stats.flushes.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(
                    target: TARGET_AGGREGATOR,
                    start,
                    end,
                    hits = bucket.counter(COUNTER_HITS),
                    "Bucket flushed"
                );
                for observer in &self.observers {
                    observer.on_flush(&bucket);
                }
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(target: TARGET_AGGREGATOR, start, end, error = %e, "Store rejected bucket");
            }
        }

        bucket
    }

    /// Flush the open bucket when more than one flush interval has elapsed.
    pub fn flush_if_due(&mut self) -> Option<Arc<IntervalMetrics>> {
        let now = self.clock.now_millis();
        if now - self.last_flush <= duration_to_millis(self.settings.flush_interval) {
            return None;
        }

        let bucket = self.accumulator.take();
        let flushed = self.flush(bucket, self.last_flush, now);
        self.last_flush = self.clock.now_millis();
        Some(flushed)
    }

    /// Run until `shutdown` fires. The partial bucket is discarded on exit.
    pub async fn run(mut self, shutdown: CancellationToken) -> AggregatorStatsSnapshot {
        info!(
            target: TARGET_AGGREGATOR,
            poll_timeout_ms = self.settings.poll_timeout.as_millis() as u64,
            flush_interval_ms = self.settings.flush_interval.as_millis() as u64,
            rate_unit = %self.settings.rate_unit,
            observers = self.observers.len(),
            "Aggregator started"
        );

        let mut producers_gone = false;
        loop {
            self.flush_if_due();

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                outcome = self.receiver.recv_timeout(self.settings.poll_timeout) => Some(outcome),
            };

            match outcome {
                None => break,
                Some(RecvOutcome::Event(event)) => self.record(&event),
                Some(RecvOutcome::Timeout) => {}
                Some(RecvOutcome::Closed) => {
                    if !producers_gone {
                        producers_gone = true;
                        debug!(target: TARGET_AGGREGATOR, "Event queue closed, flushing empty buckets");
                    }
                    // no producer left to wake us; keep the flush cadence
                    let cancelled = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => true,
                        _ = sleep(self.settings.poll_timeout) => false,
                    };
                    if cancelled {
                        break;
                    }
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            target: TARGET_AGGREGATOR,
            flushes = stats.flushes,
            events = stats.events,
            discarded_events = self.accumulator.events(),
            "Aggregator stopped"
        );
        stats
    }
}

// ============================================================================
// SECTION 12: AGGREGATOR TESTS
// ============================================================================


// ============================================================================
// SECTION 13: ALERT RULES & STATE MACHINE
// ============================================================================
// Each alert is Normal or Alerting. One evaluation:
//   1. pick the alert window (Normal) or the recovery window (Alerting)
//   2. compute the monitored value over that window
//   3. record value and evaluation time
//   4. emit a trigger or recovery transition when the breach state flips
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Alert Kinds
// ----------------------------------------------------------------------------

/// Closed set of alert kinds, addressed in configuration by identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    /// Average hits rate over the window
    HighTraffic,
    /// Sum of hits over the window
    NoTraffic,
}

impl AlertKind {
    pub const ALL: [AlertKind; 2] = [AlertKind::HighTraffic, AlertKind::NoTraffic];

    /// Configuration identifier
    pub fn identifier(&self) -> &'static str {
        match self {
            AlertKind::HighTraffic => "traffic",
            AlertKind::NoTraffic => "nodata",
        }
    }

    /// Human label used in alert messages
    pub fn label(&self) -> &'static str {
        match self {
            AlertKind::HighTraffic => "High traffic",
            AlertKind::NoTraffic => "No traffic",
        }
    }

    /// Build the rule implementing this kind.
    pub fn rule(&self) -> Box<dyn AlertRule> {
        match self {
            AlertKind::HighTraffic => Box::new(HighTrafficRule),
            AlertKind::NoTraffic => Box::new(NoTrafficRule),
        }
    }
}

impl FromStr for AlertKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.identifier() == s)
            .ok_or_else(|| ConfigError::UnknownAlertKind { name: s.to_owned() })
    }
}

impl Display for AlertKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ----------------------------------------------------------------------------
// 13.2 Alert Rules
// ----------------------------------------------------------------------------

/// Metric and breach condition of an alert kind.
pub trait AlertRule: Send + Sync + Debug {
    fn kind(&self) -> AlertKind;

    /// Monitored value over `[now - window, now)`.
    fn compute_value(&self, store: &dyn MetricsStore, now_ms: EpochMillis, window_ms: u64) -> u64;

    /// True while the alert should be active.
    fn evaluate(&self, value: u64, threshold: i64) -> bool {
        exceeds(value, threshold)
    }

    /// Trigger message for a value observed at `at_ms`.
    fn describe(&self, value: u64, at_ms: EpochMillis) -> String {
        format!(
            "{} alert triggered - value={}, at={}",
            self.kind().label(),
            value,
            format_local_millis(at_ms, ALERT_TIME_FORMAT)
        )
    }
}

/// `value > threshold` for an unsigned value and a signed threshold.
pub fn exceeds(value: u64, threshold: i64) -> bool {
    match u64::try_from(threshold) {
        Ok(threshold) => value > threshold,
        Err(_) => true,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HighTrafficRule;

impl AlertRule for HighTrafficRule {
    fn kind(&self) -> AlertKind {
        AlertKind::HighTraffic
    }

    fn compute_value(&self, store: &dyn MetricsStore, now_ms: EpochMillis, window_ms: u64) -> u64 {
        store.average_rate(COUNTER_HITS, now_ms, window_ms)
    }
}

/// Sums hits over the window and breaches on `value > threshold`, the same
/// comparison as [`HighTrafficRule`]. It is meant to be used with a threshold
/// near zero; the comparison is not inverted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTrafficRule;

impl AlertRule for NoTrafficRule {
    fn kind(&self) -> AlertKind {
        AlertKind::NoTraffic
    }

    fn compute_value(&self, store: &dyn MetricsStore, now_ms: EpochMillis, window_ms: u64) -> u64 {
        store.sum_counter(COUNTER_HITS, now_ms, window_ms)
    }
}

// ----------------------------------------------------------------------------
// 13.3 Alert State & Transitions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertState {
    pub alerting: bool,
    /// Value computed by the last evaluation
    pub last_value: u64,
    /// When the last evaluation ran
    pub last_check: Option<EpochMillis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transition {
    Triggered,
    Recovered,
}

/// Emitted when an alert enters or leaves the alerting state.
#[derive(Debug, Clone)]
pub struct AlertTransition {
    pub id: Uuid,
    pub alert: CompactString,
    pub kind: AlertKind,
    pub transition: Transition,
    pub value: u64,
    pub at_ms: EpochMillis,
    pub message: String,
}

/// Snapshot of one alert for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertStatus {
    pub name: CompactString,
    pub kind: AlertKind,
    pub threshold: i64,
    pub state: AlertState,
}

// ----------------------------------------------------------------------------
// 13.4 Alert
// ----------------------------------------------------------------------------

/// A configured alert with its hysteresis state.
#[derive(Debug)]
pub struct Alert {
    name: CompactString,
    rule: Box<dyn AlertRule>,
    threshold: i64,
    alert_window_ms: u64,
    recovery_window_ms: u64,
    state: AlertState,
}

impl Alert {
    pub fn new(
        name: impl Into<CompactString>,
        rule: Box<dyn AlertRule>,
        threshold: i64,
        alert_window_ms: u64,
        recovery_window_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            rule,
            threshold,
            alert_window_ms,
            recovery_window_ms,
            state: AlertState::default(),
        }
    }

    pub fn high_traffic(threshold: i64, alert_window_ms: u64, recovery_window_ms: u64) -> Self {
        Self::new("traffic", Box::new(HighTrafficRule), threshold, alert_window_ms, recovery_window_ms)
    }

    pub fn no_traffic(threshold: i64, alert_window_ms: u64, recovery_window_ms: u64) -> Self {
        Self::new("nodata", Box::new(NoTrafficRule), threshold, alert_window_ms, recovery_window_ms)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AlertKind {
        self.rule.kind()
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    pub fn is_alerting(&self) -> bool {
        self.state.alerting
    }

    pub fn state(&self) -> AlertState {
        self.state
    }

    pub fn status(&self) -> AlertStatus {
        AlertStatus { name: self.name.clone(), kind: self.kind(), threshold: self.threshold, state: self.state }
    }

    /// Lookback used by the next evaluation.
    pub fn active_window_ms(&self) -> u64 {
        if self.state.alerting {
            self.recovery_window_ms
        } else {
            self.alert_window_ms
        }
    }

    /// Evaluate against `store` at `now_ms`. Returns a transition only when
    /// the alerting state flips.
    pub fn evaluate(&mut self, store: &dyn MetricsStore, now_ms: EpochMillis) -> Option<AlertTransition> {
        let window_ms = self.active_window_ms();
        let value = self.rule.compute_value(store, now_ms, window_ms);
        self.state.last_value = value;
        self.state.last_check = Some(now_ms);

        let breached = self.rule.evaluate(value, self.threshold);
        let transition = match (self.state.alerting, breached) {
            (false, true) => Transition::Triggered,
            (true, false) => Transition::Recovered,
            _ => return None,
        };
        self.state.alerting = breached;

        let description = self.rule.describe(value, now_ms);
        let message = match transition {
            Transition::Triggered => description,
            Transition::Recovered => format!("Recovery - {}", description),
        };

        Some(AlertTransition {
            id: Uuid::new_v4(),
            alert: self.name.clone(),
            kind: self.kind(),
            transition,
            value,
            at_ms: now_ms,
            message,
        })
    }

    #[cfg(test)]
    fn set_alerting(&mut self, alerting: bool) {
        self.state.alerting = alerting;
    }
}

// ----------------------------------------------------------------------------
// 13.5 Alert Construction From Configuration
// ----------------------------------------------------------------------------

fn alert_number(name: &str, key: &str, param: Option<&AlertParam>) -> Result<i64, ConfigError> {
    let field = format!("alerter.alerts.{}.{}", name, key);
    let param = param.ok_or_else(|| ConfigError::missing_field(field.clone()))?;
    param
        .as_i64()
        .ok_or_else(|| ConfigError::invalid_value(field, format!("'{}' is not a number", param)))
}

fn alert_window(name: &str, key: &str, param: Option<&AlertParam>) -> Result<u64, ConfigError> {
    let value = alert_number(name, key, param)?;
    u64::try_from(value).map_err(|_| {
        ConfigError::invalid_value(format!("alerter.alerts.{}.{}", name, key), "window must not be negative")
    })
}

/// Build one alert from its definition.
pub fn build_alert(name: &str, definition: &AlertDefinition) -> Result<Alert, ConfigError> {
    let kind: AlertKind = definition.kind.as_deref().unwrap_or(name).parse()?;
    let threshold = alert_number(name, "threshold", definition.threshold.as_ref())?;
    let alert_window_ms = alert_window(name, "alert_window_ms", definition.alert_window_ms.as_ref())?;
    let recovery_window_ms = alert_window(name, "recovery_window_ms", definition.recovery_window_ms.as_ref())?;
    Ok(Alert::new(name, kind.rule(), threshold, alert_window_ms, recovery_window_ms))
}

/// Build every enabled alert. Unknown or malformed definitions are skipped
/// with a warning; the remaining alerts still load.
pub fn build_alerts(config: &AlerterConfig) -> Vec<Alert> {
    let mut alerts = Vec::with_capacity(config.enabled.len());
    for name in &config.enabled {
        let Some(definition) = config.alerts.get(name) else {
            warn!(target: TARGET_CONFIG, alert = %name, "Enabled alert has no definition, skipping");
            continue;
        };
        match build_alert(name, definition) {
            Ok(alert) => {
                info!(
                    target: TARGET_CONFIG,
                    alert = %name,
                    kind = alert.kind().identifier(),
                    threshold = alert.threshold,
                    alert_window_ms = alert.alert_window_ms,
                    recovery_window_ms = alert.recovery_window_ms,
                    "Alert loaded"
                );
                alerts.push(alert);
            }
            Err(e) => warn!(target: TARGET_CONFIG, alert = %name, error = %e, "Invalid alert definition, skipping"),
        }
    }
    alerts
}

// ============================================================================
// SECTION 14: ALERT ENGINE
// ============================================================================
// Flush observer that fans alert evaluations out to a bounded pool:
// - one task per alert per flush, spawned on a TaskTracker
// - a semaphore caps concurrent evaluations at the pool size
// - a per-alert mutex keeps evaluations of one alert from interleaving
// - shutdown stops submissions, cancels tasks and waits a bounded grace period
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertEngineSettings {
    pub pool_size: usize,
    pub shutdown_grace: Duration,
}

impl AlertEngineSettings {
    pub fn from_config(config: &AlerterConfig) -> Self {
        Self {
            pool_size: config.pool_size.max(1),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        }
    }
}

impl Default for AlertEngineSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_ALERT_POOL_SIZE,
            shutdown_grace: Duration::from_millis(DEFAULT_ALERT_SHUTDOWN_GRACE_MS),
        }
    }
}

#[derive(Debug, Default)]
pub struct AlertEngineStats {
    /// Evaluation tasks submitted
    pub dispatched: AtomicU64,
    /// Evaluations that ran to completion
    pub evaluated: AtomicU64,
    /// Trigger and recovery transitions
    pub transitions: AtomicU64,
    /// Flush notifications ignored after shutdown
    pub ignored_flushes: AtomicU64,
}

impl AlertEngineStats {
    pub fn snapshot(&self) -> AlertEngineStatsSnapshot {
        AlertEngineStatsSnapshot {
            dispatched: self.dispatched.load(AtomicOrdering::Relaxed),
            evaluated: self.evaluated.load(AtomicOrdering::Relaxed),
            transitions: self.transitions.load(AtomicOrdering::Relaxed),
            ignored_flushes: self.ignored_flushes.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertEngineStatsSnapshot {
    pub dispatched: u64,
    pub evaluated: u64,
    pub transitions: u64,
    pub ignored_flushes: u64,
}

/// Evaluates every alert after each flush.
#[derive(Debug)]
pub struct AlertEngine {
    alerts: Vec<Arc<TokioMutex<Alert>>>,
    store: Arc<dyn MetricsStore>,
    clock: Arc<dyn TimeSource>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    accepting: AtomicBool,
    runtime: RuntimeHandle,
    transitions: broadcast::Sender<AlertTransition>,
    settings: AlertEngineSettings,
    stats: Arc<AlertEngineStats>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// Decrements the in-flight count when an evaluation task ends, however it ends.
#[derive(Debug)]
struct InFlight {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl AlertEngine {
    /// Must be called from within a Tokio runtime; evaluations are spawned on it.
    pub fn new(
        alerts: Vec<Alert>,
        store: Arc<dyn MetricsStore>,
        clock: Arc<dyn TimeSource>,
        settings: AlertEngineSettings,
    ) -> MonitorResult<Self> {
        let runtime = RuntimeHandle::try_current()
            .map_err(|e| MonitorError::Internal(format!("alert engine needs a Tokio runtime: {}", e)))?;
        let (transitions, _) = broadcast::channel(ALERT_BROADCAST_CAPACITY);

        Ok(Self {
            alerts: alerts.into_iter().map(|alert| Arc::new(TokioMutex::new(alert))).collect(),
            store,
            clock,
            workers: Arc::new(Semaphore::new(settings.pool_size.max(1))),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            runtime,
            transitions,
            settings,
            stats: Arc::new(AlertEngineStats::default()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        })
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.len()
    }

    /// Receive every transition emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<AlertTransition> {
        self.transitions.subscribe()
    }

    pub fn stats(&self) -> AlertEngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(AtomicOrdering::Acquire)
    }

    /// Current state of every alert, waiting for in-flight evaluations.
    pub async fn statuses(&self) -> Vec<AlertStatus> {
        let mut statuses = Vec::with_capacity(self.alerts.len());
        for alert in &self.alerts {
            statuses.push(alert.lock().await.status());
        }
        statuses
    }

    /// Submit one evaluation task per alert. Returns how many were submitted.
    pub fn dispatch(&self) -> usize {
        if !self.is_accepting() {
            self.stats.ignored_flushes.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(target: TARGET_ALERTS, "Alert engine stopped, flush ignored");
            return 0;
        }

        for slot in &self.alerts {
            let slot = Arc::clone(slot);
            let store = Arc::clone(&self.store);
            let clock = Arc::clone(&self.clock);
            let workers = Arc::clone(&self.workers);
            let cancel = self.cancel.clone();
            let transitions = self.transitions.clone();
            let stats = Arc::clone(&self.stats);

            self.stats.dispatched.fetch_add(1, AtomicOrdering::Relaxed);
            self.in_flight.fetch_add(1, AtomicOrdering::AcqRel);
            let in_flight = InFlight { count: Arc::clone(&self.in_flight), idle: Arc::clone(&self.idle) };
            self.tracker.spawn_on(
                async move {
                    let _in_flight = in_flight;
                    let mut alert = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        guard = slot.lock() => guard,
                    };
                    let _permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        permit = workers.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return,
                        },
                    };

                    let now = clock.now_millis();
                    if let Some(transition) = alert.evaluate(store.as_ref(), now) {
                        stats.transitions.fetch_add(1, AtomicOrdering::Relaxed);
                        publish_transition(&transitions, transition);
                    }
                    stats.evaluated.fetch_add(1, AtomicOrdering::Relaxed);
                    trace!(
                        target: TARGET_ALERTS,
                        alert = alert.name(),
                        value = alert.state().last_value,
                        alerting = alert.is_alerting(),
                        "Alert evaluated"
                    );
                },
                &self.runtime,
            );
        }

        self.alerts.len()
    }

    /// Stop accepting flushes, cancel pending evaluations and wait up to the
    /// grace period. Returns true when every task finished in time.
    pub async fn shutdown(&self) -> bool {
        self.accepting.store(false, AtomicOrdering::Release);
        self.tracker.close();
        self.cancel.cancel();

        let drained = timeout(self.settings.shutdown_grace, self.tracker.wait()).await.is_ok();
        if drained {
            info!(target: TARGET_ENGINE, "Alert engine stopped");
        } else {
            warn!(
                target: TARGET_ENGINE,
                pending = self.tracker.len(),
                grace_ms = self.settings.shutdown_grace.as_millis() as u64,
                "Alert engine grace period elapsed, abandoning evaluations"
            );
        }
        drained
    }

    /// Evaluations submitted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(AtomicOrdering::Acquire)
    }

    /// Wait until every submitted evaluation has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // register before checking so a completion in between is not missed
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn publish_transition(sender: &broadcast::Sender<AlertTransition>, transition: AlertTransition) {
    match transition.transition {
        Transition::Triggered => warn!(
            target: TARGET_ALERTS,
            alert = %transition.alert,
            value = transition.value,
            id = %transition.id,
            "{}",
            transition.message
        ),
        Transition::Recovered => info!(
            target: TARGET_ALERTS,
            alert = %transition.alert,
            value = transition.value,
            id = %transition.id,
            "{}",
            transition.message
        ),
    }
    // no subscribers is fine
    let _ = sender.send(transition);
}

impl FlushObserver for AlertEngine {
    fn name(&self) -> &str {
        "alerts"
    }

    fn on_flush(&self, _bucket: &Arc<IntervalMetrics>) {
        self.dispatch();
    }
}

// ============================================================================
// SECTION 15: ALERT TESTS
// ============================================================================


// ============================================================================
// SECTION 16: CONSOLE REPORTER
// ============================================================================
// Per-flush traffic report: all-time totals from the store, interval totals
// from the flushed bucket and the busiest sections of that bucket.
// ============================================================================

const REPORT_FOOTER: &str = "-------------------------------------------------------------------------------";

/// Integer percentage, 0 on an empty denominator.
fn percent(part: u64, total: u64) -> u64 {
    if total == 0 {
        0
    } else {
        100 * part / total
    }
}

/// Flush observer rendering the traffic report.
#[derive(Debug)]
pub struct SectionReporter {
    store: Arc<dyn MetricsStore>,
    max_sections: usize,
    rate_unit: RateUnit,
}

impl SectionReporter {
    /// `rate_unit` must match the aggregator's, it only labels the bucket rates.
    pub fn new(store: Arc<dyn MetricsStore>, max_sections: usize, rate_unit: RateUnit) -> Self {
        Self { store, max_sections, rate_unit }
    }

    /// Busiest sections of `bucket` by hits, ties broken by name.
    pub fn top_sections(bucket: &IntervalMetrics, max_sections: usize) -> Vec<(&str, u64)> {
        let mut sections: Vec<(&str, u64)> = bucket
            .counters()
            .filter_map(|(name, hits)| section_key_of(name, COUNTER_HITS).map(|section| (section, hits)))
            .collect();
        sections.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        sections.truncate(max_sections);
        sections
    }

    /// Report lines for one flushed bucket.
    pub fn render(&self, bucket: &IntervalMetrics) -> Vec<String> {
        let historical_hits = self.store.cumulative_sum(COUNTER_HITS);
        let historical_errors = self.store.cumulative_sum(COUNTER_ERRORS);
        let hits = bucket.counter(COUNTER_HITS);
        let errors = bucket.counter(COUNTER_ERRORS);
        let sections = Self::top_sections(bucket, self.max_sections);

        let mut lines = Vec::with_capacity(6 + sections.len());
        lines.push(format!(
            "---HTTP monitor report between {} and {}---",
            format_local_millis(bucket.start_time, REPORT_TIME_FORMAT),
            format_local_millis(bucket.end_time, REPORT_TIME_FORMAT)
        ));
        lines.push(format!(
            "Total hits since start: {} | Total error rate:    {}%",
            historical_hits,
            percent(historical_errors, historical_hits)
        ));
        lines.push(format!(
            "Interval hits:          {} | Interval requests/{}: {} | Interval error rate: {}%",
            hits,
            self.rate_unit.symbol(),
            bucket.rate(COUNTER_HITS),
            percent(errors, hits)
        ));

        if !sections.is_empty() {
            lines.push(format!("*** Top {} sections by traffic", self.max_sections));
            lines.push("Method/Section: Traffic part | Hit count | Error rate (4XX, 5XX)".to_owned());
            for (section, section_hits) in sections {
                let section_errors = bucket.counter(&section_counter(section, COUNTER_ERRORS));
                lines.push(format!(
                    "{}: {}% | {} | {}%",
                    section,
                    percent(section_hits, hits),
                    section_hits,
                    percent(section_errors, section_hits)
                ));
            }
        }

        lines.push(REPORT_FOOTER.to_owned());
        lines
    }
}

impl FlushObserver for SectionReporter {
    fn name(&self) -> &str {
        "report"
    }

    fn on_flush(&self, bucket: &Arc<IntervalMetrics>) {
        for line in self.render(bucket) {
            info!(target: TARGET_REPORT, "{}", line);
        }
    }
}

#[cfg(test)]
mod reporter_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_top_sections_by_hits() {
        let bucket = IntervalMetrics::new(0, 1)
            .with_counter("hits", 30)
            .with_counter("section:POST/api1:errors", 5)
            .with_counter("section:POST/api1:hits", 10)
            .with_counter("section:POST/api2:hits", 5)
            .with_counter("section:GET/api3:hits", 1)
            .with_counter("section:PUT/api4:hits", 20)
            .with_counter("section:GET/api5:hits", 50)
            .with_counter("section:GET/api5:successes", 42);

        let top = SectionReporter::top_sections(&bucket, 3);
        assert_eq!(top, vec![("GET/api5", 50), ("PUT/api4", 20), ("POST/api1", 10)]);
    }

    #[test]
    fn test_top_sections_ties_and_empty() {
        let bucket = IntervalMetrics::new(0, 1)
            .with_counter("section:GET/b:hits", 2)
            .with_counter("section:GET/a:hits", 2);
        assert_eq!(SectionReporter::top_sections(&bucket, 5), vec![("GET/a", 2), ("GET/b", 2)]);
        assert!(SectionReporter::top_sections(&IntervalMetrics::new(0, 1), 3).is_empty());
    }

    #[test]
    fn test_render_report() {
        let store = Arc::new(InMemoryMetricsStore::new());
        store
            .insert(Arc::new(IntervalMetrics::new(0, 2_000).with_counter(COUNTER_HITS, 6).with_counter(COUNTER_ERRORS, 1)))
            .unwrap();
        let bucket = IntervalMetrics::new(2_000, 4_000)
            .with_counter(COUNTER_HITS, 4)
            .with_counter(COUNTER_ERRORS, 1)
            .with_counter("section:GET/api:hits", 3)
            .with_counter("section:GET/api:errors", 1)
            .with_counter("section:POST/users:hits", 1)
            .with_rate(COUNTER_HITS, 2);
        store.insert(Arc::new(bucket.clone())).unwrap();

        let reporter = SectionReporter::new(store, 5, RateUnit::Seconds);
        let expected = vec![
            format!(
                "---HTTP monitor report between {} and {}---",
                format_local_millis(2_000, REPORT_TIME_FORMAT),
                format_local_millis(4_000, REPORT_TIME_FORMAT)
            ),
            "Total hits since start: 10 | Total error rate:    20%".to_owned(),
            "Interval hits:          4 | Interval requests/s: 2 | Interval error rate: 25%".to_owned(),
            "*** Top 5 sections by traffic".to_owned(),
            "Method/Section: Traffic part | Hit count | Error rate (4XX, 5XX)".to_owned(),
            "GET/api: 75% | 3 | 33%".to_owned(),
            "POST/users: 25% | 1 | 0%".to_owned(),
            REPORT_FOOTER.to_owned(),
        ];
        assert_eq!(reporter.render(&bucket), expected);
    }

    #[test]
    fn test_render_empty_bucket() {
        let reporter = SectionReporter::new(Arc::new(InMemoryMetricsStore::new()), 5, RateUnit::Seconds);
        let lines = reporter.render(&IntervalMetrics::new(0, 1_000));
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "Total hits since start: 0 | Total error rate:    0%");
        assert_eq!(lines[2], "Interval hits:          0 | Interval requests/s: 0 | Interval error rate: 0%");
        assert_eq!(lines[3].len(), 79);
    }

    #[test]
    fn test_rate_label_follows_unit() {
        let reporter = SectionReporter::new(Arc::new(InMemoryMetricsStore::new()), 5, RateUnit::Milliseconds);
        let bucket = IntervalMetrics::new(0, 50).with_counter(COUNTER_HITS, 100).with_rate(COUNTER_HITS, 2);
        let lines = reporter.render(&bucket);
        assert_eq!(lines[2], "Interval hits:          100 | Interval requests/ms: 2 | Interval error rate: 0%");
    }
}

// ============================================================================
// SECTION 17: ACCESS LOG PARSER
// ============================================================================
// Common log format:
//   host ident user [dd/Mon/yyyy:HH:MM:SS +zzzz] "METHOD /path PROTO" status size
// ============================================================================

/// Turns one raw line into an event, or says why it can't.
pub trait LogParser: Send + Sync + Debug {
    fn parse(&self, line: &str) -> Result<LogEvent, ParseError>;
}

static COMMON_LOG_PATTERN: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| {
    Regex::new(r#"^(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}) (\S+) (\S+) \[(.+?)\] "(.+?)" (\d{3}) (\d+|-)$"#)
});

/// Apache access log parser.
#[derive(Debug, Clone)]
pub struct ApacheLogParser {
    pattern: Regex,
}

impl ApacheLogParser {
    pub fn new() -> MonitorResult<Self> {
        let pattern = COMMON_LOG_PATTERN
            .as_ref()
            .map_err(|e| MonitorError::Internal(format!("access log pattern failed to compile: {}", e)))?;
        Ok(Self { pattern: pattern.clone() })
    }

    /// `METHOD RESOURCE PROTOCOL`
    pub fn split_request<'a>(request: &'a str, line: &str) -> Result<(&'a str, &'a str, &'a str), ParseError> {
        if request.is_empty() {
            return Err(ParseError::invalid("request empty", line));
        }
        let tokens: Vec<&str> = request.split(' ').collect();
        match tokens.as_slice() {
            [method, resource, protocol] => Ok((*method, *resource, *protocol)),
            _ => Err(ParseError::invalid("request not matching [METHOD RESOURCE PROTOCOL]", line)),
        }
    }

    /// Leading slash up to, not including, the next `/` or `?`.
    pub fn parse_section<'a>(resource: &'a str, line: &str) -> Result<&'a str, ParseError> {
        if !resource.starts_with('/') {
            return Err(ParseError::invalid("request resource missing starting slash", line));
        }
        let end = resource[1..]
            .find(|c: char| c == '/' || c == '?')
            .map(|index| index + 1)
            .unwrap_or(resource.len());
        Ok(&resource[..end])
    }
}

fn none_if_hyphen(field: &str) -> Option<CompactString> {
    (field != "-").then(|| CompactString::from(field))
}

impl LogParser for ApacheLogParser {
    fn parse(&self, line: &str) -> Result<LogEvent, ParseError> {
        if line.is_empty() {
            return Err(ParseError::invalid("empty", line));
        }
        let captures = self.pattern.captures(line).ok_or_else(|| ParseError::invalid("bad format", line))?;

        let (method, resource, _protocol) = Self::split_request(&captures[5], line)?;
        let section = Self::parse_section(resource, line)?;
        let method: HttpMethod = method
            .parse()
            .map_err(|_| ParseError::invalid(format!("invalid http method {}", method), line))?;
        let status: u16 = captures[6].parse().map_err(|_| ParseError::invalid("bad status", line))?;
        let size_bytes = match &captures[7] {
            "-" => 0,
            size => size.parse().map_err(|_| ParseError::invalid("size out of range", line))?,
        };
        let timestamp = DateTime::parse_from_str(&captures[4], ACCESS_LOG_TIME_FORMAT)
            .map_err(|_| ParseError::invalid("date field not matching pattern", line))?;

        Ok(LogEvent::new(method, section, status, size_bytes, timestamp, line)
            .with_path(resource)
            .with_remote_host(none_if_hyphen(&captures[1]))
            .with_ident(none_if_hyphen(&captures[2]))
            .with_auth_user(none_if_hyphen(&captures[3])))
    }
}

#[cfg(test)]
mod parser_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn parser() -> ApacheLogParser {
        ApacheLogParser::new().unwrap()
    }

    #[test]
    fn test_parse_valid_line() {
        let line = r#"127.0.0.1 - frank [09/May/2018:16:00:42 +0000] "POST /api/user HTTP/1.0" 200 34"#;
        let event = parser().parse(line).unwrap();
        assert_eq!(event.raw_line, line);
        assert_eq!(event.remote_host.as_deref(), Some("127.0.0.1"));
        assert_eq!(event.ident, None);
        assert_eq!(event.auth_user.as_deref(), Some("frank"));
        assert_eq!(event.method, HttpMethod::Post);
        assert_eq!(event.path, "/api/user");
        assert_eq!(event.section, "/api");
        assert_eq!(event.section_key(), "POST/api");
        assert_eq!(event.status, 200);
        assert_eq!(event.size_bytes, 34);
        assert_eq!(event.timestamp.format(ACCESS_LOG_TIME_FORMAT).to_string(), "09/May/2018:16:00:42 +0000");
    }

    #[test]
    fn test_parse_hyphen_size_and_ident() {
        let line = r#"127.0.0.1 bob frank [09/May/2018:16:00:42 +0000] "POST /api/user HTTP/1.0" 200 -"#;
        let event = parser().parse(line).unwrap();
        assert_eq!(event.ident.as_deref(), Some("bob"));
        assert_eq!(event.size_bytes, 0);
    }

    #[rstest]
    #[case("/api/user", "/api")]
    #[case("/bob", "/bob")]
    #[case("/bob?city=bordeaux&ts=123", "/bob")]
    #[case("/index.html", "/index.html")]
    #[case("/index.php?where=bordeaux", "/index.php")]
    #[case("/", "/")]
    fn test_section_extraction(#[case] resource: &str, #[case] expected: &str) {
        assert_eq!(ApacheLogParser::parse_section(resource, resource).unwrap(), expected);
    }

    #[test]
    fn test_split_request() {
        let request = "GET /bob HTTP/1.0";
        assert_eq!(ApacheLogParser::split_request(request, request).unwrap(), ("GET", "/bob", "HTTP/1.0"));
        for request in ["", "GET GET /bob HTTP/1.0", "/bob HTTP/1.0"] {
            assert!(ApacheLogParser::split_request(request, request).is_err());
        }
    }

    #[rstest]
    #[case::empty("", "empty")]
    #[case::missing_host(r#"- frank [09/May/2018:16:00:42 +0000] "POST /api/user HTTP/1.0" 200 34"#, "bad format")]
    #[case::short_host(r#"192.169.1 - frank [09/May/2018:16:00:42 +0000] "POST /api/user HTTP/1.0" 200 34"#, "bad format")]
    #[case::long_status(r#"127.0.0.1 - frank [09/May/2018:16:00:42 +0000] "POST /api/user HTTP/1.0" 4044 34"#, "bad format")]
    #[case::trailing_text(r#"127.0.0.1 - frank [09/May/2018:16:00:42 +0000] "POST /api/user HTTP/1.0" 200 34 extra"#, "bad format")]
    #[case::missing_zone(r#"127.0.0.1 - frank [09/May/2018:16:00:42] "POST /api/user HTTP/1.0" 200 34"#, "date field not matching pattern")]
    #[case::extra_token(r#"127.0.0.1 - frank [09/May/2018:16:00:42 +0000] "GET GET /bob HTTP/1.0" 200 34"#, "request not matching [METHOD RESOURCE PROTOCOL]")]
    #[case::unknown_method(r#"127.0.0.1 - frank [09/May/2018:16:00:42 +0000] "FETCH /api HTTP/1.0" 200 34"#, "invalid http method FETCH")]
    #[case::relative_path(r#"127.0.0.1 - frank [09/May/2018:16:00:42 +0000] "GET api/user HTTP/1.0" 200 34"#, "request resource missing starting slash")]
    fn test_invalid_lines(#[case] line: &str, #[case] reason: &str) {
        let error = parser().parse(line).unwrap_err();
        assert_eq!(error.reason(), reason);
        assert!(error.to_string().ends_with(line));
    }

    #[test]
    fn test_patch_is_accepted() {
        let line = r#"10.0.0.2 - - [09/May/2018:16:00:42 -0700] "PATCH /users/42 HTTP/1.1" 500 12"#;
        let event = parser().parse(line).unwrap();
        assert_eq!(event.method, HttpMethod::Patch);
        assert_eq!(event.auth_user, None);
        assert!(event.is_error());
    }
}

// ============================================================================
// SECTION 18: LOG TAILER
// ============================================================================
// Polls one access log for appended lines:
// - starts at end of file, so only new traffic is counted
// - inode change (rotation) or size shrink (truncation) rewinds to offset 0
// - a missing file is waited for
// - only newline-terminated lines are consumed
// ============================================================================

#[derive(Debug, Default)]
pub struct TailerStats {
    /// Complete non-empty lines read
    pub lines_read: AtomicU64,
    /// Lines the parser rejected
    pub invalid_lines: AtomicU64,
    /// Events accepted by the queue
    pub enqueued: AtomicU64,
    /// Events refused by a full queue
    pub dropped: AtomicU64,
    /// Rotations and truncations seen
    pub rewinds: AtomicU64,
}

impl TailerStats {
    pub fn snapshot(&self) -> TailerStatsSnapshot {
        TailerStatsSnapshot {
            lines_read: self.lines_read.load(AtomicOrdering::Relaxed),
            invalid_lines: self.invalid_lines.load(AtomicOrdering::Relaxed),
            enqueued: self.enqueued.load(AtomicOrdering::Relaxed),
            dropped: self.dropped.load(AtomicOrdering::Relaxed),
            rewinds: self.rewinds.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TailerStatsSnapshot {
    pub lines_read: u64,
    pub invalid_lines: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub rewinds: u64,
}

/// Result of one poll.
#[derive(Debug, Default)]
pub struct TailBatch {
    pub events: Vec<LogEvent>,
    pub invalid: usize,
}

#[cfg(unix)]
fn inode_of(metadata: &fs::Metadata) -> u64 {
    std::os::unix::fs::MetadataExt::ino(metadata)
}

#[cfg(not(unix))]
fn inode_of(_metadata: &fs::Metadata) -> u64 {
    0
}

/// 0 when the file does not exist.
fn file_inode(path: &Path) -> u64 {
    fs::metadata(path).map(|m| inode_of(&m)).unwrap_or(0)
}

/// Access log follower feeding the event queue.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    /// Read offset in bytes
    offset: u64,
    /// For rotation detection
    inode: u64,
    poll_interval: Duration,
    max_lines_per_poll: usize,
    parser: Arc<dyn LogParser>,
    stats: Arc<TailerStats>,
}

impl LogTailer {
    pub fn new(config: &TailerConfig, parser: Arc<dyn LogParser>) -> Self {
        let (offset, inode) = match fs::metadata(&config.path) {
            Ok(metadata) => (metadata.len(), inode_of(&metadata)),
            Err(_) => (0, 0),
        };

        Self {
            path: config.path.clone(),
            offset,
            inode,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            max_lines_per_poll: config.max_lines_per_poll.max(1),
            parser,
            stats: Arc::new(TailerStats::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn stats(&self) -> Arc<TailerStats> {
        Arc::clone(&self.stats)
    }

    /// Rewind when the path now points at a different file.
    fn check_rotation(&mut self) -> bool {
        let current_inode = file_inode(&self.path);
        if current_inode != self.inode && current_inode != 0 {
            self.inode = current_inode;
            self.offset = 0;
            true
        } else {
            false
        }
    }

    /// Complete lines appended since the last read, at most `max_lines_per_poll`.
    pub fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let file_len = file.metadata()?.len();
        if file_len < self.offset {
            debug!(
                target: TARGET_TAILER,
                path = %self.path.display(),
                offset = self.offset,
                len = file_len,
                "Access log truncated, reading from start"
            );
            self.offset = 0;
            self.stats.rewinds.fetch_add(1, AtomicOrdering::Relaxed);
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.offset))?;

        let mut lines = Vec::new();
        let mut buf = Vec::with_capacity(256);
        while lines.len() < self.max_lines_per_poll {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            // a trailing partial line stays unread until the writer finishes it
            if read == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            self.offset += read as u64;

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
            if !line.is_empty() {
                lines.push(line.to_owned());
            }
        }

        Ok(lines)
    }

    /// Read and parse whatever was appended since the last poll.
    pub fn poll(&mut self) -> TailBatch {
        if self.check_rotation() {
            self.stats.rewinds.fetch_add(1, AtomicOrdering::Relaxed);
            info!(target: TARGET_TAILER, path = %self.path.display(), "Access log rotated, reading from start");
        }

        let lines = match self.read_new_lines() {
            Ok(lines) => lines,
            Err(e) => {
                warn!(target: TARGET_TAILER, path = %self.path.display(), error = %e, "Failed to read access log");
                return TailBatch::default();
            }
        };

        let mut batch = TailBatch { events: Vec::with_capacity(lines.len()), invalid: 0 };
        for line in &lines {
            self.stats.lines_read.fetch_add(1, AtomicOrdering::Relaxed);
            match self.parser.parse(line) {
                Ok(event) => batch.events.push(event),
                Err(e) => {
                    batch.invalid += 1;
                    self.stats.invalid_lines.fetch_add(1, AtomicOrdering::Relaxed);
                    warn!(target: TARGET_TAILER, reason = e.reason(), "{}", e);
                }
            }
        }
        batch
    }

    /// Poll until `shutdown` fires, pushing parsed events into the queue.
    pub async fn run(mut self, sender: EventSender, shutdown: CancellationToken) -> TailerStatsSnapshot {
        info!(
            target: TARGET_TAILER,
            path = %self.path.display(),
            offset = self.offset,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting to tail access log"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        'tail: loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'tail,
                _ = ticker.tick() => {}
            }

            let batch = self.poll();
            for event in batch.events {
                let sent = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'tail,
                    sent = sender.send(event) => sent,
                };
                match sent {
                    Ok(()) => {
                        self.stats.enqueued.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                    Err(QueueError::Full) => {
                        self.stats.dropped.fetch_add(1, AtomicOrdering::Relaxed);
                        trace!(target: TARGET_TAILER, "Event queue full, event dropped");
                    }
                    Err(QueueError::Closed) => {
                        warn!(target: TARGET_TAILER, "Event queue closed, stopping tailer");
                        break 'tail;
                    }
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            target: TARGET_TAILER,
            path = %self.path.display(),
            lines = stats.lines_read,
            invalid = stats.invalid_lines,
            dropped = stats.dropped,
            "Stopping to tail access log"
        );
        stats
    }
}


// ============================================================================
// SECTION 19: MONITOR
// ============================================================================
// Wires tailer → queue → aggregator → store, with the reporter and the alert
// engine as flush observers. Shutdown order:
//   1. stop the tailer
//   2. stop the aggregator and wait for it (partial bucket discarded)
//   3. shut the alert engine down within its grace period
// ============================================================================

/// Totals reported when the monitor stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    pub buckets_flushed: u64,
    pub events_aggregated: u64,
    pub lines_read: u64,
    pub invalid_lines: u64,
    pub events_dropped: u64,
    pub total_hits: u64,
    pub alert_transitions: u64,
    pub uptime: Duration,
}

/// The assembled monitor. The tailer is opened at construction, so lines
/// appended after [`Monitor::new`] returns are counted.
#[derive(Debug)]
pub struct Monitor {
    config: MonitorConfig,
    clock: Arc<dyn TimeSource>,
    store: Arc<InMemoryMetricsStore>,
    tailer: LogTailer,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> MonitorResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn TimeSource>) -> MonitorResult<Self> {
        config.validate()?;
        let parser: Arc<dyn LogParser> = Arc::new(ApacheLogParser::new()?);
        let tailer = LogTailer::new(&config.tailer, parser);
        let store = Arc::new(InMemoryMetricsStore::from_config(&config.store));
        Ok(Self { config, clock, store, tailer })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<InMemoryMetricsStore> {
        Arc::clone(&self.store)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> MonitorResult<MonitorSummary> {
        let started = Instant::now();
        let Self { config, clock, store, tailer } = self;

        info!(target: TARGET_ENGINE, version = ENGINE_VERSION, "Starting {}", ENGINE_FULL_NAME);
        log_effective_config(&config);

        let (sender, receiver) = EventQueue::bounded(config.queue.capacity, config.queue.backpressure);
        let mut aggregator = IntervalAggregator::new(
            AggregatorSettings::from_config(&config.aggregator),
            receiver,
            store.clone(),
            Arc::clone(&clock),
        )?;

        if config.reporter.enabled {
            aggregator.add_observer(Arc::new(SectionReporter::new(
                store.clone(),
                config.reporter.max_sections,
                config.aggregator.rate_unit,
            )));
        }
        let alert_engine = Arc::new(AlertEngine::new(
            build_alerts(&config.alerter),
            store.clone(),
            Arc::clone(&clock),
            AlertEngineSettings::from_config(&config.alerter),
        )?);
        aggregator.add_observer(alert_engine.clone());

        let tailer_stop = CancellationToken::new();
        let aggregator_stop = CancellationToken::new();
        let tailer_task = tokio::spawn(tailer.run(sender, tailer_stop.clone()));
        let aggregator_task = tokio::spawn(aggregator.run(aggregator_stop.clone()));

        info!(target: TARGET_ENGINE, alerts = alert_engine.alert_count(), "Monitor started");
        shutdown.cancelled().await;
        info!(target: TARGET_ENGINE, "Starting graceful shutdown");

        tailer_stop.cancel();
        let tailer_stats = tailer_task
            .await
            .map_err(|e| MonitorError::Internal(format!("tailer task failed: {}", e)))?;

        aggregator_stop.cancel();
        let aggregator_stats = aggregator_task
            .await
            .map_err(|e| MonitorError::Internal(format!("aggregator task failed: {}", e)))?;

        alert_engine.shutdown().await;

        let summary = MonitorSummary {
            buckets_flushed: aggregator_stats.flushes,
            events_aggregated: aggregator_stats.events,
            lines_read: tailer_stats.lines_read,
            invalid_lines: tailer_stats.invalid_lines,
            events_dropped: tailer_stats.dropped,
            total_hits: store.cumulative_sum(COUNTER_HITS),
            alert_transitions: alert_engine.stats().transitions,
            uptime: started.elapsed(),
        };
        info!(
            target: TARGET_ENGINE,
            buckets = summary.buckets_flushed,
            hits = summary.total_hits,
            duration_ms = summary.uptime.as_millis() as u64,
            "Monitor shutdown complete"
        );
        Ok(summary)
    }
}

/// Startup record of the settings in force.
fn log_effective_config(config: &MonitorConfig) {
    info!(
        target: TARGET_CONFIG,
        access_log = %config.tailer.path.display(),
        flush_interval_ms = config.aggregator.flush_interval_ms,
        poll_timeout_ms = config.aggregator.poll_timeout_ms,
        rate_unit = %config.aggregator.rate_unit,
        queue_capacity = config.queue.capacity,
        backpressure = ?config.queue.backpressure,
        alert_pool_size = config.alerter.pool_size,
        enabled_alerts = ?config.alerter.enabled,
        "Effective configuration"
    );
    match toml::to_string(config) {
        Ok(rendered) => debug!(target: TARGET_CONFIG, "\n{}", rendered),
        Err(e) => debug!(target: TARGET_CONFIG, error = %e, "Failed to render configuration"),
    }
}

// ============================================================================
// SECTION 20: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 20.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// HttpWatch CLI
#[derive(Parser, Debug)]
#[command(
    name = "httpwatch",
    author = "AIOps Team",
    version,
    about = "Live HTTP access log monitor with traffic reports and alerts",
    long_about = "HttpWatch follows an HTTP access log, aggregates requests into fixed \
                  time buckets, prints a traffic report per bucket and raises alerts \
                  when windowed traffic crosses configured thresholds."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "httpwatch.toml", env = "HTTPWATCH_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "HTTPWATCH_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start monitoring (default)
    Run {
        /// Access log to follow, overrides tailer.path
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        /// Print the parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// 20.2 CLI Handler Functions
// ----------------------------------------------------------------------------

fn millis(ms: u64) -> humantime::FormattedDuration {
    humantime::format_duration(Duration::from_millis(ms))
}

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> MonitorResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match MonitorConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Access log: {}", config.tailer.path.display());
            println!("  • Flush interval: {}", millis(config.aggregator.flush_interval_ms));
            println!("  • Poll timeout: {}", millis(config.aggregator.poll_timeout_ms));
            println!("  • Rates per: {}", config.aggregator.rate_unit);
            println!("  • Queue: {} events, {:?} when full", config.queue.capacity, config.queue.backpressure);
            println!("  • Alert pool: {} workers", config.alerter.pool_size);
            println!("  • Alerts:");
            for name in &config.alerter.enabled {
                match config.alerter.alerts.get(name).map(|definition| build_alert(name, definition)) {
                    Some(Ok(alert)) => println!(
                        "    - {} ({}): threshold {}, window {}, recovery {}",
                        name,
                        alert.kind().label(),
                        alert.threshold(),
                        millis(alert.alert_window_ms),
                        millis(alert.recovery_window_ms)
                    ),
                    Some(Err(e)) => println!("    - {} skipped: {}", name, e),
                    None => println!("    - {} skipped: no definition", name),
                }
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(MonitorError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> MonitorResult<()> {
    let config_str = MonitorConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Package: {}", ENGINE_NAME);
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Access log tailing with rotation detection");
    println!("  • Time-bucketed traffic metrics");
    println!("  • Hysteresis alerts on a bounded worker pool");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => Ok("SIGTERM"),
            received = signal::ctrl_c() => received.map(|_| "SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok("SIGINT")
    }
}

// ============================================================================
// SECTION 21: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the HttpWatch monitor
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run { .. }) | None => {}
    }

    let config_found = cli.config.exists();
    let mut config = if config_found {
        MonitorConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        MonitorConfig::from_env().context("Invalid configuration from environment")?
    };
    if let Some(Commands::Run { file: Some(file) }) = &cli.command {
        config.tailer.path = file.clone();
    }

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _logging = init_logging(&logging_config)?;

    info!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    if !config_found {
        warn!(target: TARGET_CONFIG, "Config file not found at {}, using defaults", cli.config.display());
    }

    let monitor = Monitor::new(config)?;
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(name) => {
                info!(target: TARGET_ENGINE, "Received {}", name);
                signal_token.cancel();
            }
            Err(e) => error!(target: TARGET_ENGINE, error = %e, "Failed to listen for shutdown signals"),
        }
    });

    let summary = match monitor.run(shutdown).await {
        Ok(summary) => summary,
        Err(e) => {
            error!(
                target: TARGET_ENGINE,
                category = e.category(),
                recoverable = e.is_recoverable(),
                error = %e,
                "Monitor stopped with an error"
            );
            return Err(e.into());
        }
    };
    info!(
        target: TARGET_ENGINE,
        buckets = summary.buckets_flushed,
        lines = summary.lines_read,
        invalid = summary.invalid_lines,
        dropped = summary.events_dropped,
        hits = summary.total_hits,
        alerts = summary.alert_transitions,
        "Ran for {}",
        humantime::format_duration(Duration::from_secs(summary.uptime.as_secs()))
    );

    Ok(())
}

// ============================================================================
// SECTION 22: CONFIGURATION & PIPELINE TESTS
// ============================================================================

#[cfg(test)]
mod config_tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = MonitorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.aggregator.flush_interval_ms, 10_000);
        assert_eq!(config.aggregator.poll_timeout_ms, 500);
        assert_eq!(config.queue.backpressure, BackpressurePolicy::Block);
        assert_eq!(config.alerter.enabled, vec!["traffic".to_owned()]);
        assert_eq!(config.store.retention_buckets, None);
    }

    #[test]
    fn test_parse_toml() {
        let config = MonitorConfig::from_toml_str(
            r#"
            [tailer]
            path = "/var/log/nginx/access.log"

            [queue]
            capacity = 64
            backpressure = "drop_newest"

            [aggregator]
            poll_timeout_ms = 100
            flush_interval_ms = 2000
            rate_unit = "milliseconds"

            [store]
            retention_buckets = 720

            [alerter]
            pool_size = 4

            [alerter.alerts.traffic]
            threshold = "15"
            alert_window_ms = 30000
            recovery_window_ms = 60000
            "#,
        )
        .unwrap();

        assert_eq!(config.tailer.path, PathBuf::from("/var/log/nginx/access.log"));
        assert_eq!(config.queue.backpressure, BackpressurePolicy::DropNewest);
        assert_eq!(config.aggregator.rate_unit, RateUnit::Milliseconds);
        assert_eq!(config.store.retention_buckets, Some(720));
        assert_eq!(config.alerter.pool_size, 4);

        let alerts = build_alerts(&config.alerter);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].threshold(), 15);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let too_long_poll = MonitorConfig::from_toml_str(
            "[aggregator]\npoll_timeout_ms = 5000\nflush_interval_ms = 1000\n",
        );
        assert!(matches!(too_long_poll, Err(ConfigError::PollTimeoutExceedsFlushInterval { .. })));

        let sub_second = MonitorConfig::from_toml_str("[aggregator]\npoll_timeout_ms = 10\nflush_interval_ms = 500\n");
        assert!(matches!(sub_second, Err(ConfigError::InvalidValue { ref field, .. }) if field == "aggregator.flush_interval_ms"));

        let no_workers = MonitorConfig::from_toml_str("[alerter]\npool_size = 0\n");
        assert!(matches!(no_workers, Err(ConfigError::InvalidValue { ref field, .. }) if field == "alerter.pool_size"));

        let empty_queue = MonitorConfig::from_toml_str("[queue]\ncapacity = 0\n");
        assert!(matches!(empty_queue, Err(ConfigError::InvalidValue { .. })));

        let bad_level = MonitorConfig::from_toml_str("[logging]\nlevel = \"loud\"\n");
        assert!(matches!(bad_level, Err(ConfigError::InvalidValue { ref field, .. }) if field == "logging.level"));

        let bad_toml = MonitorConfig::from_toml_str("[queue\n");
        assert!(matches!(bad_toml, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = MonitorConfig::generate_default_config().unwrap();
        assert!(rendered.contains("[alerter.alerts.traffic]"));
        let parsed = MonitorConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.alerter.alerts.len(), 2);
        assert_eq!(parsed.logging.alerts_file, Some(PathBuf::from(DEFAULT_ALERTS_LOG_PATH)));
    }

    #[test]
    fn test_generate_config_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("generated.toml");
        handle_generate_config(Some(&path)).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(!written.is_empty());
        assert_eq!(written, MonitorConfig::generate_default_config().unwrap());
        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.queue.capacity, MonitorConfig::default().queue.capacity);
    }

    #[test]
    fn test_alerts_file_layer_keeps_only_alerts() {
        let dir = TempDir::new().unwrap();
        let appender = tracing_appender::rolling::never(dir.path(), "alerts.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let subscriber = tracing_subscriber::registry().with(alerts_file_layer(writer));

        tracing::subscriber::with_default(subscriber, || {
            warn!(target: TARGET_ALERTS, "High traffic alert triggered - value=5");
            info!(target: TARGET_REPORT, "Interval hits: 5");
        });
        drop(guard);

        let written = fs::read_to_string(dir.path().join("alerts.log")).unwrap();
        assert!(written.contains("High traffic alert triggered - value=5"));
        assert!(!written.contains("Interval hits"));
    }

    #[test]
    fn test_error_categories() {
        let config: MonitorError = ConfigError::missing_field("tailer.path").into();
        assert_eq!(config.category(), "config");
        assert!(!config.is_recoverable());

        let full: MonitorError = QueueError::Full.into();
        assert_eq!(full.category(), "queue");
        assert!(full.is_recoverable());
        let closed: MonitorError = QueueError::Closed.into();
        assert!(!closed.is_recoverable());

        let empty: MonitorError = StoreError::Empty.into();
        assert_eq!(empty.category(), "store");
        assert!(empty.is_recoverable());
        let rejected: MonitorError = StoreError::Rejected { start_time: 0, reason: "full".into() }.into();
        assert!(!rejected.is_recoverable());

        let io: MonitorError = io::Error::new(ErrorKind::NotFound, "gone").into();
        assert_eq!(io.category(), "io");
        assert!(io.is_recoverable());
        assert_eq!(MonitorError::Internal("boom".into()).category(), "internal");
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(MonitorConfig::load(&missing), Err(ConfigError::FileNotFound { .. })));

        let path = dir.path().join("httpwatch.toml");
        fs::write(&path, "[reporter]\nmax_sections = 3\n").unwrap();
        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.reporter.max_sections, 3);
        assert!(config.reporter.enabled);
    }

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["httpwatch", "--debug", "run", "--file", "/tmp/other.log"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(cli.command, Some(Commands::Run { file: Some(ref f) }) if f == Path::new("/tmp/other.log")));

        let cli = Cli::try_parse_from(["httpwatch", "validate", "--verbose"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Validate { verbose: true })));

        let cli = Cli::try_parse_from(["httpwatch", "generate-config"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::GenerateConfig { output: None })));
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const LINES: [&str; 4] = [
        r#"127.0.0.1 - james [09/May/2018:16:00:39 +0000] "GET /report HTTP/1.0" 200 123"#,
        r#"127.0.0.1 - jill [09/May/2018:16:00:41 +0000] "GET /api/user HTTP/1.0" 200 234"#,
        r#"127.0.0.1 - frank [09/May/2018:16:00:42 +0000] "POST /api/user HTTP/1.0" 503 12"#,
        "this is not an access log line",
    ];

    fn test_config(path: &Path) -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.tailer.path = path.to_path_buf();
        config.tailer.poll_interval_ms = 5;
        config.aggregator = AggregatorConfig {
            poll_timeout_ms: 5,
            flush_interval_ms: 50,
            rate_unit: RateUnit::Milliseconds,
        };
        config.alerter.enabled = vec!["traffic".into(), "nodata".into()];
        config.logging.alerts_file = None;
        config
    }

    #[test]
    fn test_monitor_rejects_invalid_config() {
        let mut config = MonitorConfig::default();
        config.aggregator.poll_timeout_ms = config.aggregator.flush_interval_ms + 1;
        assert!(matches!(
            Monitor::new(config),
            Err(MonitorError::Config(ConfigError::PollTimeoutExceedsFlushInterval { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_end_to_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        fs::write(&path, format!("{}\n", LINES[0])).unwrap();

        let monitor = Monitor::new(test_config(&path)).unwrap();
        let store = monitor.store();

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        for line in LINES {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(shutdown.clone()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.cumulative_sum(COUNTER_HITS) < 3 && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.lines_read, 4);
        assert_eq!(summary.invalid_lines, 1);
        assert_eq!(summary.events_dropped, 0);
        assert_eq!(summary.total_hits, 3);
        assert_eq!(summary.events_aggregated, 3);
        assert!(summary.buckets_flushed >= 1);
        assert_eq!(store.cumulative_sum(COUNTER_ERRORS), 1);
        assert_eq!(store.cumulative_sum("section:GET/api:hits"), 1);
        assert_eq!(store.cumulative_sum("section:GET/report:hits"), 1);
    }
}
