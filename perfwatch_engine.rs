//! # Perfwatch Engine - Real-Time Performance Monitor
//!
//! Continuously ingests performance samples (latency, throughput, host resource
//! usage), keeps them in bounded memory, and surfaces statistical summaries, trend
//! direction and threshold-based issues. A multi-threaded workload simulator drives
//! the pipeline with synthetic events so the monitor can be exercised end to end.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            PERFWATCH ENGINE                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  GENERATOR → BOUNDED QUEUE → WORKERS ──callback──┐                           │
//! │                                                  ▼                           │
//! │  RESOURCE SAMPLER ─────────────────────────→ METRICS COLLECTOR               │
//! │                                               (ring · latency window ·       │
//! │                                                throughput counter)           │
//! │                                                  │                           │
//! │                                   ANALYZER (trends · issues) → REPORTER      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded memory**: FIFO rings for samples and raw latencies
//! - **Streaming statistics**: percentiles, mean, sample standard deviation
//! - **Trend & issue detection**: quarter-over-quarter trends, threshold alerts
//! - **Backpressure-aware simulation**: bounded queue, timed enqueue, drop accounting
//! - **Reports**: console, HTML and JSON renderings of the same report bundle

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Debug, Display, Formatter, Write as FmtWrite};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam_channel::{
    bounded, Receiver as CrossbeamReceiver, RecvTimeoutError, SendTimeoutError,
    Sender as CrossbeamSender,
};
use parking_lot::{Mutex, RwLock};
use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

// ----------------------------------------------------------------------------
// Time, Math & Randomness
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

// ----------------------------------------------------------------------------
// System Information
// ----------------------------------------------------------------------------
use sysinfo::System as SysInfoSystem;

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use clap::{Parser, Subcommand, ValueEnum};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "perfwatch-engine";
pub const ENGINE_FULL_NAME: &str = "Perfwatch Performance Monitor";

// ----------------------------------------------------------------------------
// Buffer Sizes
// ----------------------------------------------------------------------------

/// Default capacity of the sample ring
pub const DEFAULT_METRICS_BUFFER_SIZE: usize = 10_000;

/// Default capacity of the raw latency window
pub const DEFAULT_LATENCY_BUFFER_SIZE: usize = 1_000;

/// Default capacity of the simulator work queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default resource sampling interval (seconds)
pub const DEFAULT_SAMPLING_INTERVAL_SECS: f64 = 1.0;

/// Default interval between periodic analyses (seconds)
pub const DEFAULT_ANALYSIS_INTERVAL_SECS: f64 = 60.0;

/// Minimum elapsed time before the throughput counter yields a rate
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(1);

/// Look-back window for resource and throughput issue detection
pub const ISSUE_LOOKBACK: Duration = Duration::from_secs(300);

/// Slice used when polling a cancellation token from a blocking thread
pub const CANCELLATION_POLL: Duration = Duration::from_millis(50);

/// Upper bound on waiting for a background thread to exit
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default producer enqueue timeout before an event is dropped
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(50);

/// Default consumer dequeue timeout (bounds cancellation latency while idle)
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Generator lag after which pacing restarts from "now" instead of bursting
pub const PACING_CATCH_UP_LIMIT: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Analysis Thresholds
// ----------------------------------------------------------------------------

pub const DEFAULT_CPU_THRESHOLD: f64 = 80.0;
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 85.0;
pub const DEFAULT_LATENCY_P95_THRESHOLD_MS: f64 = 1000.0;
pub const DEFAULT_MIN_THROUGHPUT: f64 = 100.0;

/// CPU mean above this is reported as critical rather than warning
pub const CRITICAL_CPU_PERCENT: f64 = 90.0;

/// Memory mean above this is reported as critical rather than warning
pub const CRITICAL_MEMORY_PERCENT: f64 = 95.0;

/// Relative change between first and last quarter that counts as a trend
pub const TREND_CHANGE_RATIO: f64 = 0.10;

// ----------------------------------------------------------------------------
// Workload Shapes
// ----------------------------------------------------------------------------

/// Length of one bursty cycle
pub const BURSTY_CYCLE_SECS: f64 = 30.0;
/// Peak phase of a bursty cycle: [0, 5)
pub const BURSTY_PEAK_SECS: f64 = 5.0;
/// Shoulder phase of a bursty cycle: [5, 10)
pub const BURSTY_SHOULDER_SECS: f64 = 10.0;

// ----------------------------------------------------------------------------
// Callback Kinds
// ----------------------------------------------------------------------------

/// Callback kind for a processed event's latency (milliseconds)
pub const KIND_LATENCY: &str = "latency";
/// Callback kind for an event accepted into the work queue
pub const KIND_THROUGHPUT_EVENT: &str = "throughput_event";
/// Operation label used for throughput callbacks
pub const DEFAULT_OPERATION: &str = "default";

// ----------------------------------------------------------------------------
// Configuration & Reporting
// ----------------------------------------------------------------------------

/// Prefix for environment overrides (`PERFWATCH_THRESHOLDS__CPU_USAGE=70`)
pub const ENV_PREFIX: &str = "PERFWATCH_";

/// Config files probed, in order, when no explicit path is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["perfwatch.toml", "config/perfwatch.toml"];

/// Most recent raw samples listed in the HTML report
pub const REPORT_RAW_SAMPLE_LIMIT: usize = 100;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Samples, issues, trends and the statistics snapshots handed to callers.
// Everything here is plain data: cloned out of the collector, never shared.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Nanosecond Wall-Clock Time
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current time: the wall clock read once at first use, advanced by a
    /// monotonic clock. Never goes backwards within a process.
    #[inline]
    pub fn now() -> Self {
        let anchor = &*CLOCK_ANCHOR;
        Self(anchor.wall_nanos.saturating_add(duration_nanos(anchor.instant.elapsed())))
    }

    /// Unanchored wall-clock reading
    pub fn wall_clock() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration_nanos(duration))
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Duration between two timestamps (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_nanos(duration)))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(duration)))
    }

    /// Inclusive on both ends
    #[inline]
    pub fn is_within(&self, start: Timestamp, end: Timestamp) -> bool {
        self.0 >= start.0 && self.0 <= end.0
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }

    pub const EPOCH: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(i64::MAX);
}

struct ClockAnchor {
    instant: Instant,
    wall_nanos: i64,
}

static CLOCK_ANCHOR: Lazy<ClockAnchor> = Lazy::new(|| ClockAnchor {
    instant: Instant::now(),
    wall_nanos: Timestamp::wall_clock().as_nanos(),
});

#[inline]
fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Tags - Insertion-Ordered Key-Value Pairs
// ----------------------------------------------------------------------------

/// A single sample tag, e.g. `operation=processor_0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: CompactString,
    pub value: CompactString,
}

impl Tag {
    #[inline]
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Tags kept inline; samples rarely carry more than one or two.
pub type Tags = SmallVec<[Tag; 4]>;

/// Map-like access over [`Tags`] that preserves insertion order.
pub trait TagsExt {
    fn get(&self, key: &str) -> Option<&str>;

    fn contains_key(&self, key: &str) -> bool;

    /// Replace the value of an existing key or append a new tag
    fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>;

    fn remove_key(&mut self, key: &str) -> Option<Tag>;
}

impl TagsExt for Tags {
    fn get(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|t| t.key.as_str() == key)
            .map(|t| t.value.as_str())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.iter().any(|t| t.key.as_str() == key)
    }

    fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        let key = key.into();
        let value = value.into();

        if let Some(tag) = self.iter_mut().find(|t| t.key == key) {
            tag.value = value;
        } else {
            self.push(Tag { key, value });
        }
    }

    fn remove_key(&mut self, key: &str) -> Option<Tag> {
        let pos = self.iter().position(|t| t.key.as_str() == key)?;
        Some(self.remove(pos))
    }
}

/// Build a [`Tags`] collection from `key => value` pairs
#[macro_export]
macro_rules! tags {
    () => {
        smallvec::smallvec![]
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        smallvec::smallvec![
            $($crate::Tag::new($key, $value)),+
        ]
    };
}

fn serialize_tags<S: Serializer>(tags: &Tags, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(tags.iter().map(|t| (t.key.as_str(), t.value.as_str())))
}

// ----------------------------------------------------------------------------
// 3.3 Metric Kinds
// ----------------------------------------------------------------------------

/// What a sample measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Latency,
    Throughput,
    CpuUsage,
    MemoryUsage,
    MemoryUsed,
    Custom,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Latency,
        MetricKind::Throughput,
        MetricKind::CpuUsage,
        MetricKind::MemoryUsage,
        MetricKind::MemoryUsed,
        MetricKind::Custom,
    ];

    /// Host resource kinds appended by the background sampler
    pub const SYSTEM: [MetricKind; 3] = [
        MetricKind::CpuUsage,
        MetricKind::MemoryUsage,
        MetricKind::MemoryUsed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Latency => "latency",
            MetricKind::Throughput => "throughput",
            MetricKind::CpuUsage => "cpu_usage",
            MetricKind::MemoryUsage => "memory_usage",
            MetricKind::MemoryUsed => "memory_used",
            MetricKind::Custom => "custom",
        }
    }

    pub fn default_unit(&self) -> &'static str {
        match self {
            MetricKind::Latency => "ms",
            MetricKind::Throughput => "events/sec",
            MetricKind::CpuUsage | MetricKind::MemoryUsage => "%",
            MetricKind::MemoryUsed => "MB",
            MetricKind::Custom => "",
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| MonitorError::invalid_input("metric_kind", format!("unknown metric kind '{}'", s)))
    }
}

// ----------------------------------------------------------------------------
// 3.4 Sample - One Observation
// ----------------------------------------------------------------------------

/// A single recorded observation. Immutable once stored; readers get clones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub kind: MetricKind,
    pub value: f64,
    pub unit: CompactString,
    #[serde(serialize_with = "serialize_tags")]
    pub tags: Tags,
}

impl Sample {
    /// New sample stamped now, with the kind's default unit and no tags
    pub fn new(kind: MetricKind, value: f64) -> Self {
        Self {
            timestamp: Timestamp::now(),
            kind,
            value,
            unit: CompactString::new(kind.default_unit()),
            tags: Tags::new(),
        }
    }

    /// Latency sample tagged with the operation that produced it
    pub fn latency(value_ms: f64, operation: &str) -> Self {
        Self::new(MetricKind::Latency, value_ms).with_tag("operation", operation)
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<CompactString>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        self.tags.set(key, value);
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key)
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}={:.3}{}", self.timestamp, self.kind, self.value, self.unit)?;
        for tag in &self.tags {
            write!(f, " {}", tag)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 3.5 Severity, Issues & Trends
// ----------------------------------------------------------------------------

/// Severity of a detected issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// CSS color used by the HTML report
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Info => "#3498db",
            Severity::Warning => "#e67e22",
            Severity::Critical => "#e74c3c",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which threshold an issue breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    HighCpuUsage,
    HighMemoryUsage,
    HighLatency,
    LowThroughput,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::HighCpuUsage => "high_cpu_usage",
            IssueKind::HighMemoryUsage => "high_memory_usage",
            IssueKind::HighLatency => "high_latency",
            IssueKind::LowThroughput => "low_throughput",
        }
    }
}

impl Display for IssueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold breach found by the analyzer. Produced fresh per analysis call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub observed_value: f64,
    pub threshold: f64,
    pub description: String,
}

impl Issue {
    pub fn new(kind: IssueKind, severity: Severity, observed_value: f64, threshold: f64) -> Self {
        let description = match kind {
            IssueKind::HighCpuUsage => format!(
                "Average CPU usage {:.1}% exceeds threshold {:.1}%",
                observed_value, threshold
            ),
            IssueKind::HighMemoryUsage => format!(
                "Average memory usage {:.1}% exceeds threshold {:.1}%",
                observed_value, threshold
            ),
            IssueKind::HighLatency => format!(
                "P95 latency {:.2}ms exceeds threshold {:.2}ms",
                observed_value, threshold
            ),
            IssueKind::LowThroughput => format!(
                "Average throughput {:.2} events/sec is below minimum {:.2}",
                observed_value, threshold
            ),
        };

        Self {
            kind,
            severity,
            observed_value,
            threshold,
            description,
        }
    }
}

/// Direction of a metric over its analysis window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    /// Fewer than two observations
    Unknown,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Stable => "stable",
            TrendDirection::Unknown => "unknown",
        }
    }
}

impl Display for TrendDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary statistics and direction for one metric kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trend {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub direction: TrendDirection,
}

impl Trend {
    /// Values must be in timestamp order. `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        Some(Self {
            count: values.len(),
            mean: StatisticalFunctions::mean(values),
            min: StatisticalFunctions::min(values),
            max: StatisticalFunctions::max(values),
            std_dev: StatisticalFunctions::std_dev(values),
            direction: PerformanceAnalyzer::classify_direction(values),
        })
    }
}

/// Percentile snapshot over the latency window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

impl LatencyStats {
    /// `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let sorted = StatisticalFunctions::sorted(values);
        Some(Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: StatisticalFunctions::mean(&sorted),
            median: StatisticalFunctions::percentile_sorted(&sorted, 50.0),
            p95: StatisticalFunctions::percentile_sorted(&sorted, 95.0),
            p99: StatisticalFunctions::percentile_sorted(&sorted, 99.0),
            count: sorted.len(),
        })
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Monitor Errors
// ----------------------------------------------------------------------------

/// The main error type. Subsystem errors convert into it with `?`.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("Invalid input for '{field}': {message}")]
    InvalidInput { field: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        MonitorError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the pipeline can keep running after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            MonitorError::Config(_) => false,
            MonitorError::Simulation(e) => e.is_recoverable(),
            MonitorError::Report(_) => true,
            MonitorError::Sampler(_) => true,
            MonitorError::InvalidInput { .. } => true,
            MonitorError::Io(_) => true,
            MonitorError::Internal(_) => false,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            MonitorError::Config(_) => "config",
            MonitorError::Simulation(_) => "simulation",
            MonitorError::Report(_) => "report",
            MonitorError::Sampler(_) => "sampler",
            MonitorError::InvalidInput { .. } => "invalid_input",
            MonitorError::Io(_) => "io",
            MonitorError::Internal(_) => "internal",
        }
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to write configuration to {path}: {message}")]
    WriteFailed { path: PathBuf, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Simulation Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Unknown workload profile '{name}' (expected low, medium, high or bursty)")]
    UnknownWorkload { name: String },

    #[error("Unknown scenario '{name}'")]
    UnknownScenario { name: String },

    #[error("Invalid simulator setting '{field}': {message}")]
    InvalidSettings { field: String, message: String },

    #[error("Failed to spawn thread '{thread}': {source}")]
    SpawnFailed {
        thread: String,
        #[source]
        source: std::io::Error,
    },
}

impl SimulationError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        SimulationError::InvalidSettings {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SimulationError::SpawnFailed { .. })
    }
}

/// A single event the processor failed on. Counted and discarded, never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("processing of {event_type} event {event_id} failed after {elapsed_ms:.2}ms: {reason}")]
pub struct ProcessingFailure {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub elapsed_ms: f64,
    pub reason: CompactString,
}

// ----------------------------------------------------------------------------
// 4.4 Report & Sampler Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Unsupported report format '{format}' (expected console, html or json)")]
    UnsupportedFormat { format: String },

    #[error("Failed to serialize report: {message}")]
    Serialize { message: String },

    #[error("Failed to render report: {message}")]
    Render { message: String },

    #[error("Failed to write report to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    #[error("Resource '{resource}' is unavailable on this host")]
    Unavailable { resource: &'static str },

    #[error("Resource sampling failed: {message}")]
    Failed { message: String },
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - Built-in defaults
// - TOML file (explicit path or first of DEFAULT_CONFIG_PATHS)
// - PERFWATCH_ environment overrides, `__` separating sections
// A broken file never stops the monitor: defaults are used and the
// diagnostic is kept for the operator.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Sampling and analysis cadence
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Buffer capacities
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Issue detection thresholds
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Simulator defaults
    #[serde(default)]
    pub simulation: SimulationSettings,

    /// Report defaults
    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::extract(figment)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::extract(figment)
    }

    /// Parse a TOML document (no environment overrides)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// First existing config file: the explicit path if given, else the defaults
    pub fn discover(explicit: Option<&Path>) -> Option<PathBuf> {
        match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => DEFAULT_CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.is_file()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive_secs("monitoring.interval", self.monitoring.interval)?;
        check_positive_secs("monitoring.analysis_interval", self.monitoring.analysis_interval)?;

        if self.metrics.buffer_size == 0 {
            return Err(ConfigError::invalid_value(
                "metrics.buffer_size",
                "buffer size must be at least 1",
            ));
        }
        if self.metrics.latency_buffer_size == 0 {
            return Err(ConfigError::invalid_value(
                "metrics.latency_buffer_size",
                "latency buffer size must be at least 1",
            ));
        }

        let thresholds = [
            ("thresholds.cpu_usage", self.thresholds.cpu_usage),
            ("thresholds.memory_usage", self.thresholds.memory_usage),
            ("thresholds.latency_p95", self.thresholds.latency_p95),
            ("thresholds.min_throughput", self.thresholds.min_throughput),
        ];
        for (field, value) in thresholds {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("threshold must be a non-negative number, got {}", value),
                ));
            }
        }

        let sim = &self.simulation;
        if !(0.0..=1.0).contains(&sim.error_rate) {
            return Err(ConfigError::invalid_value(
                "simulation.error_rate",
                format!("error rate must be within [0, 1], got {}", sim.error_rate),
            ));
        }
        if !sim.min_processing_ms.is_finite() || sim.min_processing_ms < 0.0 {
            return Err(ConfigError::invalid_value(
                "simulation.min_processing_ms",
                "processing time must be a non-negative number",
            ));
        }
        if !sim.max_processing_ms.is_finite() || sim.max_processing_ms < sim.min_processing_ms {
            return Err(ConfigError::invalid_value(
                "simulation.max_processing_ms",
                format!(
                    "max processing time {} is below min processing time {}",
                    sim.max_processing_ms, sim.min_processing_ms
                ),
            ));
        }
        if Scenario::named(&sim.default_scenario).is_err() {
            return Err(ConfigError::invalid_value(
                "simulation.default_scenario",
                format!("unknown scenario '{}'", sim.default_scenario),
            ));
        }

        if !self.reporting.default_hours.is_finite() || self.reporting.default_hours <= 0.0 {
            return Err(ConfigError::invalid_value(
                "reporting.default_hours",
                "report window must be a positive number of hours",
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn check_positive_secs(field: &str, secs: f64) -> Result<(), ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::invalid_value(
            field,
            format!("interval must be a positive number of seconds, got {}", secs),
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 5.2 Monitoring & Buffer Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Resource sampling interval in seconds
    #[serde(default = "default_sampling_interval")]
    pub interval: f64,

    /// Periodic analysis interval in seconds
    #[serde(default = "default_analysis_interval")]
    pub analysis_interval: f64,
}

impl MonitoringConfig {
    pub fn sampling_interval(&self) -> Duration {
        secs_to_duration(self.interval)
    }

    pub fn analysis_period(&self) -> Duration {
        secs_to_duration(self.analysis_interval)
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval: default_sampling_interval(),
            analysis_interval: default_analysis_interval(),
        }
    }
}

fn default_sampling_interval() -> f64 {
    DEFAULT_SAMPLING_INTERVAL_SECS
}

fn default_analysis_interval() -> f64 {
    DEFAULT_ANALYSIS_INTERVAL_SECS
}

/// Seconds to a `Duration`; non-positive or NaN input gives zero, overflow saturates.
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Hours to a `Duration` with the same clamping as [`secs_to_duration`].
pub fn hours_to_duration(hours: f64) -> Duration {
    secs_to_duration(hours * 3600.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Capacity of the sample ring
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Capacity of the raw latency window
    #[serde(default = "default_latency_buffer_size")]
    pub latency_buffer_size: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            latency_buffer_size: default_latency_buffer_size(),
        }
    }
}

fn default_buffer_size() -> usize {
    DEFAULT_METRICS_BUFFER_SIZE
}

fn default_latency_buffer_size() -> usize {
    DEFAULT_LATENCY_BUFFER_SIZE
}

// ----------------------------------------------------------------------------
// 5.3 Thresholds
// ----------------------------------------------------------------------------

/// Issue detection thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Mean CPU usage (%) above which an issue is raised
    #[serde(default = "default_cpu_threshold")]
    pub cpu_usage: f64,

    /// Mean memory usage (%) above which an issue is raised
    #[serde(default = "default_memory_threshold")]
    pub memory_usage: f64,

    /// P95 latency (ms) above which an issue is raised
    #[serde(default = "default_latency_threshold")]
    pub latency_p95: f64,

    /// Mean throughput (events/sec) below which an issue is raised
    #[serde(default = "default_min_throughput")]
    pub min_throughput: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_usage: default_cpu_threshold(),
            memory_usage: default_memory_threshold(),
            latency_p95: default_latency_threshold(),
            min_throughput: default_min_throughput(),
        }
    }
}

fn default_cpu_threshold() -> f64 {
    DEFAULT_CPU_THRESHOLD
}

fn default_memory_threshold() -> f64 {
    DEFAULT_MEMORY_THRESHOLD
}

fn default_latency_threshold() -> f64 {
    DEFAULT_LATENCY_P95_THRESHOLD_MS
}

fn default_min_throughput() -> f64 {
    DEFAULT_MIN_THROUGHPUT
}

// ----------------------------------------------------------------------------
// 5.4 Simulation & Reporting Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Scenario used when none is named on the command line
    #[serde(default = "default_scenario")]
    pub default_scenario: String,

    /// Run length in seconds for the default scenario
    #[serde(default = "default_simulation_duration")]
    pub default_duration: u64,

    #[serde(default = "default_min_processing_ms")]
    pub min_processing_ms: f64,

    #[serde(default = "default_max_processing_ms")]
    pub max_processing_ms: f64,

    /// Probability that a worker fails an event
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            default_scenario: default_scenario(),
            default_duration: default_simulation_duration(),
            min_processing_ms: default_min_processing_ms(),
            max_processing_ms: default_max_processing_ms(),
            error_rate: default_error_rate(),
        }
    }
}

fn default_scenario() -> String {
    "normal_load".into()
}

fn default_simulation_duration() -> u64 {
    300
}

fn default_min_processing_ms() -> f64 {
    1.0
}

fn default_max_processing_ms() -> f64 {
    10.0
}

fn default_error_rate() -> f64 {
    0.01
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportingConfig {
    #[serde(default = "default_report_format")]
    pub default_format: ReportFormat,

    /// Report window in hours
    #[serde(default = "default_report_hours")]
    pub default_hours: f64,

    /// Directory for reports written without an explicit path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            default_format: default_report_format(),
            default_hours: default_report_hours(),
            output_dir: None,
        }
    }
}

fn default_report_format() -> ReportFormat {
    ReportFormat::Html
}

fn default_report_hours() -> f64 {
    1.0
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to this file instead of stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Enable ANSI colors (ignored for file output)
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source file and line
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
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

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.6 Configuration Manager
// ----------------------------------------------------------------------------

/// Holds the effective configuration and swaps it atomically on update.
pub struct ConfigManager {
    config: ArcSwap<MonitorConfig>,
    config_path: Option<PathBuf>,
    /// Why defaults were substituted, if they were
    diagnostic: Option<String>,
    callbacks: RwLock<Vec<Box<dyn Fn(&MonitorConfig) + Send + Sync>>>,
}

impl ConfigManager {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            config_path: None,
            diagnostic: None,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Strict load: any problem with the file is an error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = MonitorConfig::load(&path)?;
        let mut manager = Self::new(config);
        manager.config_path = Some(path.as_ref().to_path_buf());
        Ok(manager)
    }

    /// Never fails. A missing, malformed or invalid file yields defaults and a
    /// diagnostic retrievable through [`ConfigManager::diagnostic`].
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        let Some(path) = MonitorConfig::discover(explicit) else {
            return match MonitorConfig::from_env() {
                Ok(config) => Self::new(config),
                Err(e) => Self::with_diagnostic(MonitorConfig::default(), None, e),
            };
        };

        match MonitorConfig::load(&path) {
            Ok(config) => {
                let mut manager = Self::new(config);
                manager.config_path = Some(path);
                manager
            }
            Err(e) => Self::with_diagnostic(MonitorConfig::default(), Some(path), e),
        }
    }

    fn with_diagnostic(config: MonitorConfig, path: Option<PathBuf>, error: ConfigError) -> Self {
        let mut manager = Self::new(config);
        manager.config_path = path;
        manager.diagnostic = Some(error.to_string());
        manager
    }

    /// Current configuration snapshot
    pub fn get(&self) -> Arc<MonitorConfig> {
        self.config.load_full()
    }

    /// File the configuration came from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    /// Validate and swap in a new configuration, then notify listeners
    pub fn update(&self, config: MonitorConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config.store(Arc::new(config.clone()));

        let callbacks = self.callbacks.read();
        for callback in callbacks.iter() {
            callback(&config);
        }

        info!(target: "perfwatch::config", "Configuration updated");
        Ok(())
    }

    pub fn on_update<F>(&self, callback: F)
    where
        F: Fn(&MonitorConfig) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Box::new(callback));
    }

    /// Write the current configuration as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_failed = |message: String| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            message,
        };

        let rendered = toml::to_string_pretty(&*self.get()).map_err(|e| write_failed(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_failed(e.to_string()))?;
        }
        fs::write(path, rendered).map_err(|e| write_failed(e.to_string()))?;

        info!(target: "perfwatch::config", path = %path.display(), "Configuration saved");
        Ok(())
    }
}

impl Debug for ConfigManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config", &*self.config.load())
            .field("config_path", &self.config_path)
            .field("diagnostic", &self.diagnostic)
            .finish()
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`. Output goes to stderr (or a file) so
// console reports on stdout stay clean.
// ============================================================================

/// Initialize the global subscriber. Keep the returned guard alive for the
/// lifetime of the process when logging to a file.
pub fn init_logging(config: &LoggingConfig) -> MonitorResult<Option<WorkerGuard>> {
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

    let (writer, guard, ansi) = match &config.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| MonitorError::invalid_input("logging.file", "log file path has no file name"))?;
            fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, config.colors),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format.as_str() {
        "json" => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            )
            .try_init(),
        "compact" => registry
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .try_init(),
        _ => registry
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            )
            .try_init(),
    };
    result.map_err(|e| MonitorError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "perfwatch::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(guard)
}

// ============================================================================
// SECTION 7: BOUNDED RING
// ============================================================================
// Fixed-capacity FIFO. Appending past capacity evicts the oldest entry.
// Not synchronized on its own: the collector guards it with its lock.
// ============================================================================

/// Fixed-capacity, insertion-ordered buffer with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct BoundedRing<T> {
    items: VecDeque<T>,
    capacity: usize,
    total_pushed: u64,
    evicted: u64,
}

impl<T> BoundedRing<T> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            total_pushed: 0,
            evicted: 0,
        }
    }

    /// Append an item, returning the evicted one if the ring was full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        self.total_pushed += 1;
        evicted
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter()
    }

    /// Drop all items. Lifetime counters are kept.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            capacity: self.capacity,
            len: self.items.len(),
            total_pushed: self.total_pushed,
            evicted: self.evicted,
        }
    }
}

impl<T: Clone> BoundedRing<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingStats {
    pub capacity: usize,
    pub len: usize,
    pub total_pushed: u64,
    pub evicted: u64,
}

// ============================================================================
// SECTION 8: THROUGHPUT COUNTER
// ============================================================================

/// Windowed event counter.
///
/// A rate is only produced once at least [`THROUGHPUT_WINDOW`] has elapsed
/// since the window started; earlier reads return 0 and leave the count
/// untouched, so events are never lost, only reported late.
#[derive(Debug, Clone)]
pub struct ThroughputCounter {
    count: u64,
    window_start: Instant,
    total_events: u64,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            total_events: 0,
        }
    }

    /// Add `count` events. Zero is a no-op.
    pub fn record(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        self.count = self.count.saturating_add(count);
        self.total_events = self.total_events.saturating_add(count);
    }

    /// Events per second since the window started, resetting the window.
    /// Returns 0 without resetting if the window is younger than one second.
    pub fn rate_at(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < THROUGHPUT_WINDOW {
            return 0.0;
        }

        let rate = self.count as f64 / elapsed.as_secs_f64();
        self.count = 0;
        self.window_start = now;
        rate
    }

    /// Current rate without consuming the window
    pub fn peek_rate_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed.is_zero() {
            return 0.0;
        }
        self.count as f64 / elapsed.as_secs_f64()
    }

    pub fn reset_at(&mut self, now: Instant) {
        self.count = 0;
        self.window_start = now;
    }

    /// Events counted in the current window
    #[inline]
    pub fn pending(&self) -> u64 {
        self.count
    }

    /// Events counted since creation; not affected by reads or resets
    #[inline]
    pub fn total_events(&self) -> u64 {
        self.total_events
    }
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SECTION 9: STATISTICS
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Statistical Functions
// ----------------------------------------------------------------------------

/// Descriptive statistics over `f64` slices. Empty input yields 0.
#[derive(Debug)]
pub struct StatisticalFunctions;

impl StatisticalFunctions {
    pub fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    /// Sample variance (n - 1 denominator); 0 for fewer than two values.
    pub fn variance(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let mean = Self::mean(values);
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
    }

    pub fn std_dev(values: &[f64]) -> f64 {
        Self::variance(values).sqrt()
    }

    pub fn min(values: &[f64]) -> f64 {
        values
            .iter()
            .copied()
            .map(OrderedFloat)
            .min()
            .map_or(0.0, |v| v.into_inner())
    }

    pub fn max(values: &[f64]) -> f64 {
        values
            .iter()
            .copied()
            .map(OrderedFloat)
            .max()
            .map_or(0.0, |v| v.into_inner())
    }

    /// Ascending copy of `values`
    pub fn sorted(values: &[f64]) -> Vec<f64> {
        let mut sorted = values.to_vec();
        sorted.sort_unstable_by_key(|v| OrderedFloat(*v));
        sorted
    }

    /// Percentile `p` (0-100) of ascending `sorted` data.
    ///
    /// Rank is `p/100 * (n - 1)`. An integral rank selects that element,
    /// otherwise the two neighbours are interpolated by the fractional part.
    pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }

        let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;

        if lower == upper {
            sorted[lower]
        } else {
            let weight = rank - lower as f64;
            let value = sorted[lower] + (sorted[upper] - sorted[lower]) * weight;
            value.min(sorted[upper]).max(sorted[lower])
        }
    }

    pub fn percentile(values: &[f64], p: f64) -> f64 {
        Self::percentile_sorted(&Self::sorted(values), p)
    }

    pub fn median(values: &[f64]) -> f64 {
        Self::percentile(values, 50.0)
    }
}

// ----------------------------------------------------------------------------
// 9.2 Atomic Float
// ----------------------------------------------------------------------------

/// An atomic f64 stored as bits in an `AtomicU64`.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    #[inline]
    pub fn new(val: f64) -> Self {
        Self {
            bits: AtomicU64::new(val.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> f64 {
        f64::from_bits(self.bits.load(ordering))
    }

    #[inline]
    pub fn store(&self, val: f64, ordering: AtomicOrdering) {
        self.bits.store(val.to_bits(), ordering);
    }

    /// Add using a CAS loop, returning the previous value
    pub fn fetch_add(&self, val: f64, ordering: AtomicOrdering) -> f64 {
        let mut current = self.bits.load(AtomicOrdering::Relaxed);
        loop {
            let new = (f64::from_bits(current) + val).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, new, ordering, AtomicOrdering::Relaxed)
            {
                Ok(previous) => return f64::from_bits(previous),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Raise `target` to `value` if larger
fn fetch_max_usize(target: &AtomicUsize, value: usize) {
    let mut current = target.load(AtomicOrdering::Relaxed);
    while value > current {
        match target.compare_exchange_weak(current, value, AtomicOrdering::Relaxed, AtomicOrdering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

// ============================================================================
// SECTION 10: RESOURCE SAMPLING
// ============================================================================

/// One reading of host resources
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: f64,
}

/// Source of host resource readings for the background sampler.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> Result<ResourceSnapshot, SamplerError>;
}

/// `sysinfo`-backed sampler. CPU usage is a delta between refreshes, so the
/// same `System` is kept across ticks.
pub struct SysinfoSampler {
    system: SysInfoSystem,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = SysInfoSystem::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<ResourceSnapshot, SamplerError> {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(SamplerError::Unavailable { resource: "memory" });
        }
        let used = self.system.used_memory();
        let cpu = f64::from(self.system.global_cpu_info().cpu_usage());
        if !cpu.is_finite() {
            return Err(SamplerError::Failed {
                message: format!("non-finite CPU reading {}", cpu),
            });
        }

        Ok(ResourceSnapshot {
            cpu_percent: cpu,
            memory_percent: used as f64 / total as f64 * 100.0,
            memory_used_mb: used as f64 / (1024.0 * 1024.0),
        })
    }
}

impl Debug for SysinfoSampler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysinfoSampler")
            .field("total_memory", &self.system.total_memory())
            .finish()
    }
}

// ============================================================================
// SECTION 11: METRICS COLLECTOR
// ============================================================================
// Owns the sample ring, the latency window and the throughput counter behind
// a single lock. Writers hold it only to mutate; readers copy what they need
// and compute outside it. A background thread appends host resource samples.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Shared State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct MetricBuffers {
    samples: BoundedRing<Sample>,
    latencies: BoundedRing<f64>,
    throughput: ThroughputCounter,
}

impl MetricBuffers {
    /// Stamp and append under the caller's lock so ring order is timestamp order
    fn push_now(&mut self, kind: MetricKind, value: f64) {
        self.samples.push(Sample::new(kind, value));
    }
}

#[derive(Debug, Default)]
struct SamplerCounters {
    ticks: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug)]
struct SamplerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct CollectorInner {
    buffers: Mutex<MetricBuffers>,
    counters: SamplerCounters,
    sampler: Mutex<Option<SamplerHandle>>,
    shutdown: CancellationToken,
}

impl Drop for CollectorInner {
    fn drop(&mut self) {
        if let Some(sampler) = self.sampler.get_mut().take() {
            sampler.token.cancel();
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Collector
// ----------------------------------------------------------------------------

/// Thread-safe metrics store. Clones share the same buffers.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<CollectorInner>,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig, shutdown: CancellationToken) -> Self {
        let buffers = MetricBuffers {
            samples: BoundedRing::new(config.buffer_size),
            latencies: BoundedRing::new(config.latency_buffer_size),
            throughput: ThroughputCounter::new(),
        };

        Self {
            inner: Arc::new(CollectorInner {
                buffers: Mutex::new(buffers),
                counters: SamplerCounters::default(),
                sampler: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Collector with explicit capacities and its own shutdown token
    pub fn with_capacity(buffer_size: usize, latency_buffer_size: usize) -> Self {
        let config = MetricsConfig {
            buffer_size,
            latency_buffer_size,
        };
        Self::new(&config, CancellationToken::new())
    }

    // ---- Recording ----

    /// Record one latency observation for `operation`. Non-finite values are ignored.
    pub fn record_latency(&self, value_ms: f64, operation: &str) {
        if !value_ms.is_finite() {
            debug!(target: "perfwatch::collector", operation, "Ignoring non-finite latency");
            return;
        }

        let mut buffers = self.inner.buffers.lock();
        let sample = Sample::new(MetricKind::Latency, value_ms).with_tag("operation", operation);
        buffers.samples.push(sample);
        buffers.latencies.push(value_ms);
    }

    /// Count `count` events towards throughput. Zero is a no-op.
    pub fn record_throughput_event(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.inner.buffers.lock().throughput.record(count);
    }

    /// Append an arbitrary sample, keeping its own timestamp.
    /// Latency samples also feed the latency window.
    pub fn record(&self, sample: Sample) {
        if !sample.value.is_finite() {
            debug!(target: "perfwatch::collector", kind = %sample.kind, "Ignoring non-finite sample");
            return;
        }

        let mut buffers = self.inner.buffers.lock();
        if sample.kind == MetricKind::Latency {
            buffers.latencies.push(sample.value);
        }
        buffers.samples.push(sample);
    }

    // ---- Queries ----

    /// Percentile snapshot over the latency window, `None` when it is empty
    pub fn current_latency_stats(&self) -> Option<LatencyStats> {
        let window = self.inner.buffers.lock().latencies.to_vec();
        LatencyStats::from_values(&window)
    }

    /// Events per second since the last successful read (see [`ThroughputCounter::rate_at`])
    pub fn current_throughput(&self) -> f64 {
        self.inner.buffers.lock().throughput.rate_at(Instant::now())
    }

    /// Rate of the current throughput window without consuming it
    pub fn peek_throughput(&self) -> f64 {
        self.inner.buffers.lock().throughput.peek_rate_at(Instant::now())
    }

    /// Samples with `start <= timestamp <= end`, in insertion order.
    /// An inverted range is empty.
    pub fn metrics_in_range(&self, start: Timestamp, end: Timestamp) -> Vec<Sample> {
        if start > end {
            return Vec::new();
        }

        let buffers = self.inner.buffers.lock();
        buffers
            .samples
            .iter()
            .filter(|s| s.timestamp.is_within(start, end))
            .cloned()
            .collect()
    }

    /// Samples from the last `window`
    pub fn recent_metrics(&self, window: Duration) -> Vec<Sample> {
        let now = Timestamp::now();
        self.metrics_in_range(now.sub_duration(window), now)
    }

    /// Every sample currently held, oldest first
    pub fn all_metrics(&self) -> Vec<Sample> {
        self.inner.buffers.lock().samples.to_vec()
    }

    /// Empty both buffers and restart the throughput window. Idempotent.
    pub fn clear(&self) {
        let mut buffers = self.inner.buffers.lock();
        buffers.samples.clear();
        buffers.latencies.clear();
        buffers.throughput.reset_at(Instant::now());
        debug!(target: "perfwatch::collector", "Collector buffers cleared");
    }

    pub fn stats(&self) -> CollectorStats {
        let (samples, latencies, pending, total) = {
            let buffers = self.inner.buffers.lock();
            (
                buffers.samples.stats(),
                buffers.latencies.stats(),
                buffers.throughput.pending(),
                buffers.throughput.total_events(),
            )
        };

        CollectorStats {
            samples,
            latencies,
            pending_throughput_events: pending,
            total_throughput_events: total,
            sampler_ticks: self.inner.counters.ticks.load(AtomicOrdering::Relaxed),
            sampler_errors: self.inner.counters.errors.load(AtomicOrdering::Relaxed),
            collecting: self.is_collecting(),
        }
    }

    // ---- Background sampling ----

    /// Start the resource sampler backed by `sysinfo`. No-op if already running.
    pub fn start_collection(&self, interval: Duration) -> MonitorResult<()> {
        if self.is_collecting() {
            debug!(target: "perfwatch::collector", "Resource sampler already running");
            return Ok(());
        }
        self.start_collection_with(interval, Box::new(SysinfoSampler::new()))
    }

    /// Start the resource sampler with a caller-supplied source
    pub fn start_collection_with(
        &self,
        interval: Duration,
        sampler: Box<dyn ResourceSampler>,
    ) -> MonitorResult<()> {
        if interval.is_zero() {
            return Err(MonitorError::invalid_input(
                "interval",
                "sampling interval must be greater than zero",
            ));
        }

        let mut slot = self.inner.sampler.lock();
        if slot.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            debug!(target: "perfwatch::collector", "Resource sampler already running");
            return Ok(());
        }

        let token = self.inner.shutdown.child_token();
        let thread_token = token.clone();
        let inner = Arc::downgrade(&self.inner);
        let handle = thread::Builder::new()
            .name("perfwatch-sampler".into())
            .spawn(move || run_sampler(inner, sampler, interval, thread_token))?;

        *slot = Some(SamplerHandle { token, handle });
        info!(
            target: "perfwatch::collector",
            interval_ms = interval.as_millis() as u64,
            "Resource sampler started"
        );
        Ok(())
    }

    /// Stop the resource sampler. Idempotent; waits at most [`DEFAULT_JOIN_TIMEOUT`].
    pub fn stop_collection(&self) {
        let Some(SamplerHandle { token, handle }) = self.inner.sampler.lock().take() else {
            return;
        };

        token.cancel();
        if join_with_timeout(handle, DEFAULT_JOIN_TIMEOUT) {
            info!(target: "perfwatch::collector", "Resource sampler stopped");
        } else {
            warn!(
                target: "perfwatch::collector",
                timeout_ms = DEFAULT_JOIN_TIMEOUT.as_millis() as u64,
                "Resource sampler did not stop in time, detaching"
            );
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.inner
            .sampler
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// One sampler tick: read resources, then append cpu, memory and (if
    /// non-zero) throughput samples. Failures are logged and counted.
    pub fn sample_resources(&self, sampler: &mut dyn ResourceSampler) -> Result<(), SamplerError> {
        self.inner.counters.ticks.fetch_add(1, AtomicOrdering::Relaxed);

        let snapshot = match sampler.sample() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.inner.counters.errors.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(target: "perfwatch::collector", error = %e, "Resource sampling failed");
                return Err(e);
            }
        };

        let mut buffers = self.inner.buffers.lock();
        let throughput = buffers.throughput.rate_at(Instant::now());
        buffers.push_now(MetricKind::CpuUsage, snapshot.cpu_percent);
        buffers.push_now(MetricKind::MemoryUsage, snapshot.memory_percent);
        buffers.push_now(MetricKind::MemoryUsed, snapshot.memory_used_mb);
        if throughput > 0.0 {
            buffers.push_now(MetricKind::Throughput, throughput);
        }
        drop(buffers);

        trace!(
            target: "perfwatch::collector",
            cpu = snapshot.cpu_percent,
            memory = snapshot.memory_percent,
            throughput,
            "Resource sample recorded"
        );
        Ok(())
    }
}

impl Debug for MetricsCollector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("stats", &self.stats())
            .finish()
    }
}

impl MetricsCallback for MetricsCollector {
    fn on_metric(&self, kind: &str, value: f64, operation: &str) {
        match kind {
            KIND_LATENCY => self.record_latency(value, operation),
            KIND_THROUGHPUT_EVENT => {
                let count = if value.is_finite() && value > 0.0 { value.round() as u64 } else { 0 };
                self.record_throughput_event(count);
            }
            other => debug!(target: "perfwatch::collector", kind = other, "Ignoring unknown callback kind"),
        }
    }
}

/// Collector occupancy and sampler health
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStats {
    pub samples: RingStats,
    pub latencies: RingStats,
    pub pending_throughput_events: u64,
    pub total_throughput_events: u64,
    pub sampler_ticks: u64,
    pub sampler_errors: u64,
    pub collecting: bool,
}

// ----------------------------------------------------------------------------
// 11.3 Sampler Thread
// ----------------------------------------------------------------------------

fn run_sampler(
    inner: Weak<CollectorInner>,
    mut sampler: Box<dyn ResourceSampler>,
    interval: Duration,
    token: CancellationToken,
) {
    debug!(target: "perfwatch::collector", "Sampler thread running");

    loop {
        // Exit once every collector handle is gone
        let Some(inner) = inner.upgrade() else { break };
        let collector = MetricsCollector { inner };
        let _ = collector.sample_resources(sampler.as_mut());
        drop(collector);

        if wait_for_cancellation(&token, interval) {
            break;
        }
    }

    debug!(target: "perfwatch::collector", "Sampler thread exiting");
}

/// Sleep up to `timeout`, waking early on cancellation. Returns true if cancelled.
pub fn wait_for_cancellation(token: &CancellationToken, timeout: Duration) -> bool {
    // `None` means the timeout is too large to represent: wait for cancellation only
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if token.is_cancelled() {
            return true;
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                (deadline - now).min(CANCELLATION_POLL)
            }
            None => CANCELLATION_POLL,
        };
        thread::sleep(slice);
    }
}

/// Join `handle` if it finishes within `timeout`; otherwise leave it detached.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    while !handle.is_finished() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }

    let name = handle.thread().name().unwrap_or("unnamed").to_owned();
    if handle.join().is_err() {
        error!(target: "perfwatch::runtime", thread = %name, "Background thread panicked");
    }
    true
}

// ============================================================================
// SECTION 12: PERFORMANCE ANALYZER
// ============================================================================
// Stateless queries over the collector: per-kind trends over a window and
// threshold-based issue detection.
// ============================================================================

#[derive(Debug, Clone)]
pub struct PerformanceAnalyzer {
    collector: MetricsCollector,
    thresholds: Thresholds,
}

impl PerformanceAnalyzer {
    /// Analyzer using the default thresholds
    pub fn new(collector: MetricsCollector) -> Self {
        Self::with_thresholds(collector, Thresholds::default())
    }

    pub fn with_thresholds(collector: MetricsCollector, thresholds: Thresholds) -> Self {
        Self {
            collector,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    // ---- Trends ----

    /// Per-kind trends over the last `window`
    pub fn analyze_trends(&self, window: Duration) -> BTreeMap<MetricKind, Trend> {
        Self::trends_from_samples(&self.collector.recent_metrics(window))
    }

    /// Per-kind trends over the last `hours` hours
    pub fn analyze_trends_hours(&self, hours: f64) -> BTreeMap<MetricKind, Trend> {
        self.analyze_trends(hours_to_duration(hours))
    }

    /// Group samples by kind in timestamp order and summarize each group
    pub fn trends_from_samples(samples: &[Sample]) -> BTreeMap<MetricKind, Trend> {
        let mut ordered: Vec<&Sample> = samples.iter().collect();
        ordered.sort_by_key(|s| s.timestamp);

        let mut series: BTreeMap<MetricKind, Vec<f64>> = BTreeMap::new();
        for sample in ordered {
            series.entry(sample.kind).or_default().push(sample.value);
        }

        series
            .into_iter()
            .filter_map(|(kind, values)| Trend::from_values(&values).map(|trend| (kind, trend)))
            .collect()
    }

    /// Compare the mean of the first and last quarter of `values`.
    ///
    /// Fewer than two values is `Unknown`; fewer than four (an empty quarter)
    /// is `Stable`. A change beyond ±[`TREND_CHANGE_RATIO`] of the first
    /// quarter's magnitude is a trend. A zero first quarter falls back to the
    /// sign of the last quarter.
    pub fn classify_direction(values: &[f64]) -> TrendDirection {
        let n = values.len();
        if n < 2 {
            return TrendDirection::Unknown;
        }

        let quarter = n / 4;
        if quarter < 1 {
            return TrendDirection::Stable;
        }

        let first = StatisticalFunctions::mean(&values[..quarter]);
        let last = StatisticalFunctions::mean(&values[n - quarter..]);

        if first == 0.0 {
            return if last > 0.0 {
                TrendDirection::Increasing
            } else if last < 0.0 {
                TrendDirection::Decreasing
            } else {
                TrendDirection::Stable
            };
        }

        let change = (last - first) / first.abs();
        if change > TREND_CHANGE_RATIO {
            TrendDirection::Increasing
        } else if change < -TREND_CHANGE_RATIO {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        }
    }

    // ---- Issues ----

    /// Threshold breaches, in the order cpu, memory, latency, throughput.
    ///
    /// Resource and throughput checks use the mean of the last
    /// [`ISSUE_LOOKBACK`]; latency uses the current window's p95. A kind
    /// without samples never produces an issue.
    pub fn identify_issues(&self, thresholds: Option<&Thresholds>) -> Vec<Issue> {
        let thresholds = thresholds.copied().unwrap_or(self.thresholds);
        let recent = self.collector.recent_metrics(ISSUE_LOOKBACK);
        let latency = self.collector.current_latency_stats();
        Self::issues_from(&recent, latency.as_ref(), &thresholds)
    }

    /// Issue detection over an explicit sample set
    pub fn issues_from(
        samples: &[Sample],
        latency: Option<&LatencyStats>,
        thresholds: &Thresholds,
    ) -> Vec<Issue> {
        let mean_of = |kind: MetricKind| -> Option<f64> {
            let values: Vec<f64> = samples
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| s.value)
                .collect();
            (!values.is_empty()).then(|| StatisticalFunctions::mean(&values))
        };

        let mut issues = Vec::new();

        if let Some(cpu) = mean_of(MetricKind::CpuUsage) {
            if cpu > thresholds.cpu_usage {
                let severity = if cpu > CRITICAL_CPU_PERCENT {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                issues.push(Issue::new(IssueKind::HighCpuUsage, severity, cpu, thresholds.cpu_usage));
            }
        }

        if let Some(memory) = mean_of(MetricKind::MemoryUsage) {
            if memory > thresholds.memory_usage {
                let severity = if memory > CRITICAL_MEMORY_PERCENT {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                issues.push(Issue::new(
                    IssueKind::HighMemoryUsage,
                    severity,
                    memory,
                    thresholds.memory_usage,
                ));
            }
        }

        if let Some(stats) = latency {
            if stats.p95 > thresholds.latency_p95 {
                issues.push(Issue::new(
                    IssueKind::HighLatency,
                    Severity::Warning,
                    stats.p95,
                    thresholds.latency_p95,
                ));
            }
        }

        if let Some(throughput) = mean_of(MetricKind::Throughput) {
            if throughput < thresholds.min_throughput {
                issues.push(Issue::new(
                    IssueKind::LowThroughput,
                    Severity::Warning,
                    throughput,
                    thresholds.min_throughput,
                ));
            }
        }

        issues
    }
}

// ============================================================================
// SECTION 13: WORKLOAD SIMULATOR
// ============================================================================
// One generator thread paces synthetic events into a bounded queue; a pool of
// worker threads drains it, simulating processing latency and failures, and
// reports back through a MetricsCallback. Full queues drop events after a
// short enqueue timeout, so producers never block indefinitely.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Workload Profiles
// ----------------------------------------------------------------------------

/// Event generation rate profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadProfile {
    /// 10 events/sec
    Low,
    /// 100 events/sec
    Medium,
    /// 1000 events/sec
    High,
    /// Repeating 30s cycle: 2000/s for 5s, 500/s for 5s, 50/s for 20s
    Bursty,
}

impl WorkloadProfile {
    pub const ALL: [WorkloadProfile; 4] = [
        WorkloadProfile::Low,
        WorkloadProfile::Medium,
        WorkloadProfile::High,
        WorkloadProfile::Bursty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadProfile::Low => "low",
            WorkloadProfile::Medium => "medium",
            WorkloadProfile::High => "high",
            WorkloadProfile::Bursty => "bursty",
        }
    }

    /// Events per second at `elapsed` since the run started
    pub fn rate_at(&self, elapsed: Duration) -> f64 {
        match self {
            WorkloadProfile::Low => 10.0,
            WorkloadProfile::Medium => 100.0,
            WorkloadProfile::High => 1000.0,
            WorkloadProfile::Bursty => {
                let position = elapsed.as_secs_f64() % BURSTY_CYCLE_SECS;
                if position < BURSTY_PEAK_SECS {
                    2000.0
                } else if position < BURSTY_SHOULDER_SECS {
                    500.0
                } else {
                    50.0
                }
            }
        }
    }
}

impl Display for WorkloadProfile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadProfile {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkloadProfile::ALL
            .into_iter()
            .find(|profile| profile.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SimulationError::UnknownWorkload { name: s.to_owned() })
    }
}

// ----------------------------------------------------------------------------
// 13.2 Scenario Presets
// ----------------------------------------------------------------------------

/// Named simulation preset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub workload: WorkloadProfile,
    pub workers: usize,
    pub buffer_size: usize,
    pub duration: Duration,
}

impl Scenario {
    const PRESETS: [Scenario; 5] = [
        Scenario {
            name: "normal_load",
            description: "Steady medium load with headroom",
            workload: WorkloadProfile::Medium,
            workers: 4,
            buffer_size: 1000,
            duration: Duration::from_secs(300),
        },
        Scenario {
            name: "high_load",
            description: "Sustained high event rate",
            workload: WorkloadProfile::High,
            workers: 4,
            buffer_size: 1000,
            duration: Duration::from_secs(300),
        },
        Scenario {
            name: "overload",
            description: "High rate against too few workers and a small queue",
            workload: WorkloadProfile::High,
            workers: 2,
            buffer_size: 500,
            duration: Duration::from_secs(300),
        },
        Scenario {
            name: "bursty_traffic",
            description: "Periodic traffic spikes",
            workload: WorkloadProfile::Bursty,
            workers: 6,
            buffer_size: 2000,
            duration: Duration::from_secs(600),
        },
        Scenario {
            name: "memory_intensive",
            description: "Medium load with a deep queue",
            workload: WorkloadProfile::Medium,
            workers: 8,
            buffer_size: 5000,
            duration: Duration::from_secs(300),
        },
    ];

    pub fn all() -> &'static [Scenario] {
        &Self::PRESETS
    }

    /// Look up a preset by name. Unknown names are an error, never a fallback.
    pub fn named(name: &str) -> Result<Scenario, SimulationError> {
        Self::PRESETS
            .iter()
            .find(|scenario| scenario.name == name.trim())
            .cloned()
            .ok_or_else(|| SimulationError::UnknownScenario { name: name.to_owned() })
    }

    /// Simulator configuration for this preset, with processing settings from config
    pub fn simulator_config(&self, settings: &SimulationSettings) -> SimulatorConfig {
        SimulatorConfig {
            workload: self.workload,
            workers: self.workers,
            buffer_size: self.buffer_size,
            min_processing_ms: settings.min_processing_ms,
            max_processing_ms: settings.max_processing_ms,
            error_rate: settings.error_rate,
            ..SimulatorConfig::default()
        }
    }
}

// ----------------------------------------------------------------------------
// 13.3 Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserAction,
    SensorReading,
    Transaction,
    LogEntry,
    MetricUpdate,
    Alert,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::UserAction,
        EventType::SensorReading,
        EventType::Transaction,
        EventType::LogEntry,
        EventType::MetricUpdate,
        EventType::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserAction => "user_action",
            EventType::SensorReading => "sensor_reading",
            EventType::Transaction => "transaction",
            EventType::LogEntry => "log_entry",
            EventType::MetricUpdate => "metric_update",
            EventType::Alert => "alert",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synthetic unit of work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub created_at: Timestamp,
    pub event_type: EventType,
    pub payload: JsonMap<String, JsonValue>,
    /// 1 (lowest) to 5 (highest)
    pub priority: u8,
}

/// Produces random events with type-specific payloads.
#[derive(Debug)]
pub struct EventGenerator {
    rng: StdRng,
    sequence: u64,
}

const REGIONS: &[&str] = &["us-east", "us-west", "eu-west", "eu-central", "ap-south"];
const USER_ACTIONS: &[&str] = &["login", "logout", "view_page", "click", "purchase", "search"];
const SENSOR_UNITS: &[&str] = &["celsius", "percent", "pascal", "lux"];
const CURRENCIES: &[&str] = &["USD", "EUR", "GBP", "JPY"];
const LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR"];
const COMPONENTS: &[&str] = &["api", "database", "cache", "queue", "auth"];
const METRIC_NAMES: &[&str] = &["cpu_usage", "memory_usage", "disk_io", "network_io"];
const ALERT_SEVERITIES: &[&str] = &["low", "medium", "high", "critical"];

impl EventGenerator {
    /// Seeded generators are reproducible (apart from UUIDs)
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
            sequence: 0,
        }
    }

    pub fn next_event(&mut self) -> Event {
        self.sequence += 1;
        let event_type = EventType::ALL[self.rng.gen_range(0..EventType::ALL.len())];
        let payload = self.payload_for(event_type);

        Event {
            id: Uuid::new_v4(),
            created_at: Timestamp::now(),
            event_type,
            payload,
            priority: self.rng.gen_range(1..=5),
        }
    }

    /// Events generated so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn pick(&mut self, options: &[&'static str]) -> &'static str {
        options.choose(&mut self.rng).copied().unwrap_or_default()
    }

    fn payload_for(&mut self, event_type: EventType) -> JsonMap<String, JsonValue> {
        let mut payload = JsonMap::new();
        payload.insert("source".into(), json!(format!("source_{}", self.rng.gen_range(1..=100))));
        payload.insert("region".into(), json!(self.pick(REGIONS)));

        let fields = match event_type {
            EventType::UserAction => json!({
                "user_id": format!("user_{}", self.rng.gen_range(1..=10_000)),
                "action": self.pick(USER_ACTIONS),
                "session_id": Uuid::new_v4().to_string(),
            }),
            EventType::SensorReading => json!({
                "sensor_id": format!("sensor_{}", self.rng.gen_range(1..=1_000)),
                "value": self.rng.gen_range(0.0..100.0),
                "unit": self.pick(SENSOR_UNITS),
            }),
            EventType::Transaction => json!({
                "transaction_id": Uuid::new_v4().to_string(),
                "amount": (self.rng.gen_range(1.0..10_000.0_f64) * 100.0).round() / 100.0,
                "currency": self.pick(CURRENCIES),
                "merchant": format!("merchant_{}", self.rng.gen_range(1..=500)),
            }),
            EventType::LogEntry => json!({
                "level": self.pick(LOG_LEVELS),
                "message": format!("Log message {}", self.sequence),
                "component": self.pick(COMPONENTS),
            }),
            EventType::MetricUpdate => json!({
                "metric_name": self.pick(METRIC_NAMES),
                "value": self.rng.gen_range(0.0..100.0),
                "host": format!("host_{}", self.rng.gen_range(1..=50)),
            }),
            EventType::Alert => json!({
                "alert_id": Uuid::new_v4().to_string(),
                "severity": self.pick(ALERT_SEVERITIES),
                "description": format!("Alert triggered for condition {}", self.rng.gen_range(1..=100)),
            }),
        };

        if let JsonValue::Object(fields) = fields {
            payload.extend(fields);
        }
        payload
    }
}

// ----------------------------------------------------------------------------
// 13.4 Event Processing
// ----------------------------------------------------------------------------

/// Result of a successful processing step
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent {
    pub event: Event,
    pub latency_ms: f64,
}

/// Simulates work: sleeps for a random duration and fails at `error_rate`.
#[derive(Debug)]
pub struct DataProcessor {
    min_processing_ms: f64,
    max_processing_ms: f64,
    error_rate: f64,
    rng: StdRng,
}

impl DataProcessor {
    pub fn new(min_processing_ms: f64, max_processing_ms: f64, error_rate: f64, seed: Option<u64>) -> Self {
        let min_processing_ms = min_processing_ms.max(0.0);
        Self {
            min_processing_ms,
            max_processing_ms: max_processing_ms.max(min_processing_ms),
            error_rate: error_rate.clamp(0.0, 1.0),
            rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
        }
    }

    /// Process one event. A failure consumes the event and is returned as `Err`.
    pub fn process(&mut self, mut event: Event) -> Result<ProcessedEvent, ProcessingFailure> {
        let started = Instant::now();

        let delay_ms = if self.max_processing_ms > self.min_processing_ms {
            self.rng.gen_range(self.min_processing_ms..=self.max_processing_ms)
        } else {
            self.min_processing_ms
        };
        thread::sleep(Duration::from_secs_f64(delay_ms / 1000.0));

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if self.rng.gen_bool(self.error_rate) {
            return Err(ProcessingFailure {
                event_id: event.id,
                event_type: event.event_type,
                elapsed_ms,
                reason: CompactString::new("simulated processing error"),
            });
        }

        event
            .payload
            .insert("processed_at".into(), json!(Utc::now().to_rfc3339()));
        event
            .payload
            .insert("processing_time_ms".into(), json!(elapsed_ms));

        Ok(ProcessedEvent {
            event,
            latency_ms: elapsed_ms,
        })
    }
}

// ----------------------------------------------------------------------------
// 13.5 Metrics Callback
// ----------------------------------------------------------------------------

/// Receives `(kind, value, operation)` reports from the simulator.
///
/// Kinds are [`KIND_LATENCY`] (milliseconds, once per processed event) and
/// [`KIND_THROUGHPUT_EVENT`] (value 1, once per event accepted into the queue).
/// Called concurrently from every simulator thread.
pub trait MetricsCallback: Send + Sync {
    fn on_metric(&self, kind: &str, value: f64, operation: &str);
}

impl<F> MetricsCallback for F
where
    F: Fn(&str, f64, &str) + Send + Sync,
{
    fn on_metric(&self, kind: &str, value: f64, operation: &str) {
        self(kind, value, operation)
    }
}

// ----------------------------------------------------------------------------
// 13.6 Simulator Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulatorConfig {
    pub workload: WorkloadProfile,
    pub workers: usize,
    /// Work queue capacity
    pub buffer_size: usize,
    pub min_processing_ms: f64,
    pub max_processing_ms: f64,
    pub error_rate: f64,
    pub enqueue_timeout: Duration,
    pub dequeue_timeout: Duration,
    /// Per-thread bound when stopping
    pub join_timeout: Duration,
    /// Seed for reproducible event streams and failure injection
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            workload: WorkloadProfile::Medium,
            workers: 4,
            buffer_size: DEFAULT_QUEUE_CAPACITY,
            min_processing_ms: default_min_processing_ms(),
            max_processing_ms: default_max_processing_ms(),
            error_rate: default_error_rate(),
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            seed: None,
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.workers == 0 {
            return Err(SimulationError::invalid("workers", "at least one worker is required"));
        }
        if self.buffer_size == 0 {
            return Err(SimulationError::invalid("buffer_size", "queue capacity must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(SimulationError::invalid(
                "error_rate",
                format!("must be within [0, 1], got {}", self.error_rate),
            ));
        }
        if !self.min_processing_ms.is_finite()
            || !self.max_processing_ms.is_finite()
            || self.min_processing_ms < 0.0
            || self.max_processing_ms < self.min_processing_ms
        {
            return Err(SimulationError::invalid(
                "processing_ms",
                format!(
                    "expected 0 <= min <= max, got min {} max {}",
                    self.min_processing_ms, self.max_processing_ms
                ),
            ));
        }
        if self.dequeue_timeout.is_zero() {
            return Err(SimulationError::invalid("dequeue_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 13.7 Simulation Statistics
// ----------------------------------------------------------------------------

/// Live counters, updated lock-free by every simulator thread.
#[derive(Debug, Default)]
pub struct SimulationStats {
    generated: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    total_processing_ms: AtomicF64,
    queue_high_water_mark: AtomicUsize,
}

impl SimulationStats {
    fn reset(&self) {
        self.generated.store(0, AtomicOrdering::Relaxed);
        self.processed.store(0, AtomicOrdering::Relaxed);
        self.failed.store(0, AtomicOrdering::Relaxed);
        self.dropped.store(0, AtomicOrdering::Relaxed);
        self.total_processing_ms.store(0.0, AtomicOrdering::Relaxed);
        self.queue_high_water_mark.store(0, AtomicOrdering::Relaxed);
    }

    fn record_generated(&self) {
        self.generated.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_processed(&self, latency_ms: f64) {
        self.processed.fetch_add(1, AtomicOrdering::Relaxed);
        self.total_processing_ms.fetch_add(latency_ms, AtomicOrdering::Relaxed);
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn observe_depth(&self, depth: usize) {
        fetch_max_usize(&self.queue_high_water_mark, depth);
    }

    fn snapshot(&self, queue_depth: usize, running: bool, elapsed: Duration) -> SimulationSnapshot {
        let generated = self.generated.load(AtomicOrdering::Relaxed);
        let processed = self.processed.load(AtomicOrdering::Relaxed);
        let failed = self.failed.load(AtomicOrdering::Relaxed);
        let total_ms = self.total_processing_ms.load(AtomicOrdering::Relaxed);

        SimulationSnapshot {
            events_generated: generated,
            events_processed: processed,
            events_failed: failed,
            events_dropped: self.dropped.load(AtomicOrdering::Relaxed),
            queue_depth,
            queue_high_water_mark: self.queue_high_water_mark.load(AtomicOrdering::Relaxed),
            average_processing_time_ms: if processed > 0 { total_ms / processed as f64 } else { 0.0 },
            success_rate: processed as f64 / generated.max(1) as f64 * 100.0,
            error_rate: failed as f64 / (processed + failed).max(1) as f64 * 100.0,
            running,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }
}

/// Point-in-time view of a simulation run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationSnapshot {
    pub events_generated: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_dropped: u64,
    pub queue_depth: usize,
    pub queue_high_water_mark: usize,
    pub average_processing_time_ms: f64,
    /// processed / generated, percent. `events_generated` includes events
    /// dropped under backpressure, so drops lower this rate.
    pub success_rate: f64,
    /// failed / (processed + failed), percent
    pub error_rate: f64,
    pub running: bool,
    pub elapsed_secs: f64,
}

// ----------------------------------------------------------------------------
// 13.8 Simulator
// ----------------------------------------------------------------------------

struct SimulationRun {
    token: CancellationToken,
    generator: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    started_at: Instant,
}

/// Generator + worker pool over a bounded queue. `start` and `stop` may be
/// called any number of times; counters reset at each start.
pub struct WorkloadSimulator {
    config: SimulatorConfig,
    callback: Arc<dyn MetricsCallback>,
    stats: Arc<SimulationStats>,
    shutdown: CancellationToken,
    run: Mutex<Option<SimulationRun>>,
    /// Receiver of the latest run's queue, kept to report its depth after stop
    queue: Mutex<Option<CrossbeamReceiver<Event>>>,
    last_elapsed: Mutex<Duration>,
}

impl WorkloadSimulator {
    pub fn new(config: SimulatorConfig, callback: Arc<dyn MetricsCallback>) -> Result<Self, SimulationError> {
        config.validate()?;
        Ok(Self {
            config,
            callback,
            stats: Arc::new(SimulationStats::default()),
            shutdown: CancellationToken::new(),
            run: Mutex::new(None),
            queue: Mutex::new(None),
            last_elapsed: Mutex::new(Duration::ZERO),
        })
    }

    /// Runs are cancelled when `token` is
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }

    /// Spawn the generator and workers. No-op while running.
    pub fn start(&self) -> Result<(), SimulationError> {
        let mut run = self.run.lock();
        if run.is_some() {
            debug!(target: "perfwatch::simulator", "Simulation already running");
            return Ok(());
        }

        self.stats.reset();
        let token = self.shutdown.child_token();
        let (tx, rx) = bounded::<Event>(self.config.buffer_size);

        let mut workers = Vec::with_capacity(self.config.workers);
        for index in 0..self.config.workers {
            let worker = Worker {
                operation: format!("processor_{}", index),
                queue: rx.clone(),
                processor: DataProcessor::new(
                    self.config.min_processing_ms,
                    self.config.max_processing_ms,
                    self.config.error_rate,
                    self.config.seed.map(|seed| seed.wrapping_add(index as u64 + 1)),
                ),
                stats: Arc::clone(&self.stats),
                callback: Arc::clone(&self.callback),
                token: token.clone(),
                dequeue_timeout: self.config.dequeue_timeout,
            };
            let name = worker.operation.clone();

            match thread::Builder::new().name(name.clone()).spawn(move || worker.run()) {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    self.abort_spawn(&token, workers);
                    return Err(SimulationError::SpawnFailed { thread: name, source });
                }
            }
        }

        let generator = Generator {
            workload: self.config.workload,
            events: EventGenerator::new(self.config.seed),
            queue: tx,
            stats: Arc::clone(&self.stats),
            callback: Arc::clone(&self.callback),
            token: token.clone(),
            enqueue_timeout: self.config.enqueue_timeout,
        };
        let generator = match thread::Builder::new()
            .name("perfwatch-generator".into())
            .spawn(move || generator.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                self.abort_spawn(&token, workers);
                return Err(SimulationError::SpawnFailed {
                    thread: "perfwatch-generator".into(),
                    source,
                });
            }
        };

        *self.queue.lock() = Some(rx);
        *run = Some(SimulationRun {
            token,
            generator,
            workers,
            started_at: Instant::now(),
        });

        info!(
            target: "perfwatch::simulator",
            workload = %self.config.workload,
            workers = self.config.workers,
            buffer_size = self.config.buffer_size,
            "Workload simulation started"
        );
        Ok(())
    }

    fn abort_spawn(&self, token: &CancellationToken, spawned: Vec<JoinHandle<()>>) {
        token.cancel();
        for handle in spawned {
            join_with_timeout(handle, self.config.join_timeout);
        }
    }

    /// Cancel and join every thread, each bounded by `join_timeout`. Idempotent.
    pub fn stop(&self) {
        let Some(run) = self.run.lock().take() else {
            return;
        };

        run.token.cancel();
        let mut detached = 0usize;
        for handle in std::iter::once(run.generator).chain(run.workers) {
            if !join_with_timeout(handle, self.config.join_timeout) {
                detached += 1;
            }
        }
        *self.last_elapsed.lock() = run.started_at.elapsed();

        if detached > 0 {
            warn!(
                target: "perfwatch::simulator",
                detached,
                "Some simulator threads did not stop in time"
            );
        }

        let snapshot = self.stats();
        info!(
            target: "perfwatch::simulator",
            generated = snapshot.events_generated,
            processed = snapshot.events_processed,
            failed = snapshot.events_failed,
            dropped = snapshot.events_dropped,
            queue_depth = snapshot.queue_depth,
            "Workload simulation stopped"
        );
    }

    /// Start, run for `duration` (or until the shutdown token fires), stop.
    /// Blocks the calling thread.
    pub fn run_for(&self, duration: Duration) -> Result<SimulationSnapshot, SimulationError> {
        self.start()?;
        wait_for_cancellation(&self.shutdown, duration);
        self.stop();
        Ok(self.stats())
    }

    pub fn stats(&self) -> SimulationSnapshot {
        let queue_depth = self.queue.lock().as_ref().map_or(0, |rx| rx.len());
        let (running, elapsed) = match self.run.lock().as_ref() {
            Some(run) => (true, run.started_at.elapsed()),
            None => (false, *self.last_elapsed.lock()),
        };
        self.stats.snapshot(queue_depth, running, elapsed)
    }
}

impl Drop for WorkloadSimulator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Debug for WorkloadSimulator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadSimulator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// 13.9 Simulator Threads
// ----------------------------------------------------------------------------

struct Generator {
    workload: WorkloadProfile,
    events: EventGenerator,
    queue: CrossbeamSender<Event>,
    stats: Arc<SimulationStats>,
    callback: Arc<dyn MetricsCallback>,
    token: CancellationToken,
    enqueue_timeout: Duration,
}

impl Generator {
    /// Deadline-based pacing: the next event is due one period after the
    /// previous deadline, not after the previous send returned.
    fn run(mut self) {
        let started = Instant::now();
        let mut next_due = started;

        while !self.token.is_cancelled() {
            let now = Instant::now();
            if next_due > now {
                if wait_for_cancellation(&self.token, next_due - now) {
                    break;
                }
            } else if now - next_due > PACING_CATCH_UP_LIMIT {
                next_due = now;
            }

            let event = self.events.next_event();
            self.stats.record_generated();

            match self.queue.send_timeout(event, self.enqueue_timeout) {
                Ok(()) => {
                    self.stats.observe_depth(self.queue.len());
                    self.callback.on_metric(KIND_THROUGHPUT_EVENT, 1.0, DEFAULT_OPERATION);
                }
                Err(SendTimeoutError::Timeout(event)) => {
                    self.stats.record_dropped();
                    debug!(
                        target: "perfwatch::simulator",
                        event_id = %event.id,
                        "Work queue full, dropping event"
                    );
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.stats.record_dropped();
                    break;
                }
            }

            let rate = self.workload.rate_at(started.elapsed());
            next_due += Duration::from_secs_f64(1.0 / rate);
        }

        debug!(target: "perfwatch::simulator", generated = self.events.sequence(), "Generator exiting");
    }
}

struct Worker {
    operation: String,
    queue: CrossbeamReceiver<Event>,
    processor: DataProcessor,
    stats: Arc<SimulationStats>,
    callback: Arc<dyn MetricsCallback>,
    token: CancellationToken,
    dequeue_timeout: Duration,
}

impl Worker {
    fn run(mut self) {
        while !self.token.is_cancelled() {
            let event = match self.queue.recv_timeout(self.dequeue_timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match self.processor.process(event) {
                Ok(processed) => {
                    self.stats.record_processed(processed.latency_ms);
                    self.callback.on_metric(KIND_LATENCY, processed.latency_ms, &self.operation);
                }
                Err(failure) => {
                    self.stats.record_failed();
                    debug!(
                        target: "perfwatch::simulator",
                        worker = %self.operation,
                        error = %failure,
                        "Event processing failed"
                    );
                }
            }
        }

        debug!(target: "perfwatch::simulator", worker = %self.operation, "Worker exiting");
    }
}

// ============================================================================
// SECTION 14: REPORTING
// ============================================================================
// One report bundle built from the collector and analyzer, rendered as a
// console summary, a standalone HTML page, or JSON.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Report Format
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Console,
    Html,
    Json,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Console => "console",
            ReportFormat::Html => "html",
            ReportFormat::Json => "json",
        }
    }

    /// File extension for written reports
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Console => "txt",
            ReportFormat::Html => "html",
            ReportFormat::Json => "json",
        }
    }
}

impl Display for ReportFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "console" | "text" => Ok(ReportFormat::Console),
            "html" => Ok(ReportFormat::Html),
            "json" => Ok(ReportFormat::Json),
            _ => Err(ReportError::UnsupportedFormat { format: s.to_owned() }),
        }
    }
}

// ----------------------------------------------------------------------------
// 14.2 Report Data
// ----------------------------------------------------------------------------

/// Descriptive statistics for one metric kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub unit: CompactString,
}

impl MetricSummary {
    pub fn from_values(values: &[f64], unit: &str) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        Some(Self {
            count: values.len(),
            mean: StatisticalFunctions::mean(values),
            median: StatisticalFunctions::median(values),
            min: StatisticalFunctions::min(values),
            max: StatisticalFunctions::max(values),
            std_dev: StatisticalFunctions::std_dev(values),
            unit: CompactString::new(unit),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub total_samples: usize,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub window_hours: f64,
    pub generated_at: DateTime<Utc>,
}

/// Everything a rendered report shows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportData {
    pub summary: ReportSummary,
    pub latency_stats: Option<LatencyStats>,
    pub system_stats: BTreeMap<MetricKind, MetricSummary>,
    pub throughput_stats: Option<MetricSummary>,
    pub all_metrics: BTreeMap<MetricKind, MetricSummary>,
    pub trends: BTreeMap<MetricKind, Trend>,
    pub issues: Vec<Issue>,
    pub raw_samples: Vec<Sample>,
}

impl ReportData {
    /// Build the bundle from a sample window. Deterministic apart from `generated_at`.
    /// Issues are evaluated over every given sample.
    pub fn from_parts(
        samples: Vec<Sample>,
        latency_stats: Option<LatencyStats>,
        window: Duration,
        thresholds: &Thresholds,
    ) -> Self {
        let mut by_kind: BTreeMap<MetricKind, Vec<f64>> = BTreeMap::new();
        for sample in &samples {
            by_kind.entry(sample.kind).or_default().push(sample.value);
        }

        let all_metrics: BTreeMap<MetricKind, MetricSummary> = by_kind
            .iter()
            .filter_map(|(kind, values)| {
                let unit = samples
                    .iter()
                    .find(|s| s.kind == *kind)
                    .map_or(kind.default_unit(), |s| s.unit.as_str());
                MetricSummary::from_values(values, unit).map(|summary| (*kind, summary))
            })
            .collect();

        let system_stats = all_metrics
            .iter()
            .filter(|(kind, _)| MetricKind::SYSTEM.contains(kind))
            .map(|(kind, summary)| (*kind, summary.clone()))
            .collect();
        let throughput_stats = all_metrics.get(&MetricKind::Throughput).cloned();

        let summary = ReportSummary {
            total_samples: samples.len(),
            start_time: samples.iter().map(|s| s.timestamp).min(),
            end_time: samples.iter().map(|s| s.timestamp).max(),
            window_hours: window.as_secs_f64() / 3600.0,
            generated_at: Utc::now(),
        };

        let trends = PerformanceAnalyzer::trends_from_samples(&samples);
        let issues = PerformanceAnalyzer::issues_from(&samples, latency_stats.as_ref(), thresholds);

        Self {
            summary,
            latency_stats,
            system_stats,
            throughput_stats,
            all_metrics,
            trends,
            issues,
            raw_samples: samples,
        }
    }

    pub fn with_issues(mut self, issues: Vec<Issue>) -> Self {
        self.issues = issues;
        self
    }
}

// ----------------------------------------------------------------------------
// 14.3 Reporter
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PerformanceReporter {
    collector: MetricsCollector,
}

impl PerformanceReporter {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }

    /// Snapshot the last `window` of samples plus the current latency window.
    /// Issues cover only the last [`ISSUE_LOOKBACK`], matching
    /// [`PerformanceAnalyzer::identify_issues`].
    pub fn collect(&self, window: Duration, thresholds: &Thresholds) -> ReportData {
        let samples = self.collector.recent_metrics(window);
        let latency = self.collector.current_latency_stats();
        let recent = self.collector.recent_metrics(ISSUE_LOOKBACK);
        let issues = PerformanceAnalyzer::issues_from(&recent, latency.as_ref(), thresholds);
        ReportData::from_parts(samples, latency, window, thresholds).with_issues(issues)
    }

    pub fn render(data: &ReportData, format: ReportFormat) -> Result<String, ReportError> {
        match format {
            ReportFormat::Console => render_console(data),
            ReportFormat::Html => render_html(data),
            ReportFormat::Json => serde_json::to_string_pretty(data)
                .map_err(|e| ReportError::Serialize { message: e.to_string() }),
        }
    }

    /// Collect, render and write a report, creating parent directories.
    /// Returns the rendered report's size in bytes.
    pub fn write_report(
        &self,
        path: &Path,
        format: ReportFormat,
        window: Duration,
        thresholds: &Thresholds,
    ) -> Result<usize, ReportError> {
        let data = self.collect(window, thresholds);
        let rendered = Self::render(&data, format)?;
        let io_error = |source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, &rendered).map_err(io_error)?;

        info!(
            target: "perfwatch::report",
            path = %path.display(),
            format = %format,
            samples = data.summary.total_samples,
            issues = data.issues.len(),
            "Report written"
        );
        Ok(rendered.len())
    }

    /// `performance_report_<YYYYmmdd_HHMMSS>.<ext>` under `dir` (or the working directory)
    pub fn default_report_path(dir: Option<&Path>, format: ReportFormat) -> PathBuf {
        let name = format!(
            "performance_report_{}.{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            format.extension()
        );
        match dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}

// ----------------------------------------------------------------------------
// 14.4 Renderers
// ----------------------------------------------------------------------------

fn render_error(e: fmt::Error) -> ReportError {
    ReportError::Render { message: e.to_string() }
}

fn render_console(data: &ReportData) -> Result<String, ReportError> {
    write_console(data).map_err(render_error)
}

fn write_console(data: &ReportData) -> Result<String, fmt::Error> {
    let mut out = String::new();
    let rule = "=".repeat(60);

    writeln!(out, "{}", rule)?;
    writeln!(out, "PERFORMANCE REPORT")?;
    writeln!(out, "{}", rule)?;
    writeln!(out, "Generated: {}", data.summary.generated_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    writeln!(out, "Window: {:.2} hours", data.summary.window_hours)?;
    writeln!(out, "Total samples: {}", data.summary.total_samples)?;
    if let (Some(start), Some(end)) = (data.summary.start_time, data.summary.end_time) {
        writeln!(out, "Range: {} .. {}", start, end)?;
    }

    writeln!(out)?;
    writeln!(out, "LATENCY")?;
    match &data.latency_stats {
        Some(l) => {
            writeln!(out, "  count: {}", l.count)?;
            writeln!(out, "  mean: {:.2}ms  median: {:.2}ms", l.mean, l.median)?;
            writeln!(out, "  p95: {:.2}ms  p99: {:.2}ms", l.p95, l.p99)?;
            writeln!(out, "  min: {:.2}ms  max: {:.2}ms", l.min, l.max)?;
        }
        None => writeln!(out, "  no latency data")?,
    }

    writeln!(out)?;
    writeln!(out, "METRICS")?;
    if data.all_metrics.is_empty() {
        writeln!(out, "  no samples in window")?;
    }
    for (kind, m) in &data.all_metrics {
        let direction = data
            .trends
            .get(kind)
            .map_or(TrendDirection::Unknown, |t| t.direction);
        writeln!(
            out,
            "  {:<14} n={:<6} mean={:.2}{} min={:.2} max={:.2} std={:.2} trend={}",
            kind.as_str(),
            m.count,
            m.mean,
            m.unit,
            m.min,
            m.max,
            m.std_dev,
            direction
        )?;
    }

    writeln!(out)?;
    writeln!(out, "ISSUES")?;
    if data.issues.is_empty() {
        writeln!(out, "  none detected")?;
    }
    for issue in &data.issues {
        writeln!(out, "  [{}] {}: {}", issue.severity.as_str().to_uppercase(), issue.kind, issue.description)?;
    }
    writeln!(out, "{}", rule)?;

    Ok(out)
}

/// Escape text for interpolation into HTML
pub fn html_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

const HTML_STYLE: &str = "body{font-family:sans-serif;margin:2em;color:#2c3e50}\
table{border-collapse:collapse;margin-bottom:1.5em}\
th,td{border:1px solid #ddd;padding:4px 10px;text-align:right}\
th{background:#f4f6f7}td.name{text-align:left}\
.issue{padding:6px 10px;margin:4px 0;border-left:4px solid}";

fn render_html(data: &ReportData) -> Result<String, ReportError> {
    write_html(data).map_err(render_error)
}

fn write_html(data: &ReportData) -> Result<String, fmt::Error> {
    let mut out = String::new();

    writeln!(out, "<!DOCTYPE html>")?;
    writeln!(out, "<html><head><meta charset=\"utf-8\"><title>Performance Report</title>")?;
    writeln!(out, "<style>{}</style></head><body>", HTML_STYLE)?;
    writeln!(out, "<h1>Performance Report</h1>")?;
    writeln!(
        out,
        "<p>Generated {} &middot; window {:.2} h &middot; {} samples</p>",
        html_escape(&data.summary.generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
        data.summary.window_hours,
        data.summary.total_samples
    )?;

    writeln!(out, "<h2>Latency</h2>")?;
    match &data.latency_stats {
        Some(l) => {
            writeln!(out, "<table><tr><th>count</th><th>mean</th><th>median</th><th>p95</th><th>p99</th><th>min</th><th>max</th></tr>")?;
            writeln!(
                out,
                "<tr><td>{}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td></tr></table>",
                l.count, l.mean, l.median, l.p95, l.p99, l.min, l.max
            )?;
        }
        None => writeln!(out, "<p>No latency data.</p>")?,
    }

    writeln!(out, "<h2>Metrics</h2>")?;
    writeln!(out, "<table><tr><th>metric</th><th>count</th><th>mean</th><th>median</th><th>min</th><th>max</th><th>std dev</th><th>unit</th><th>trend</th></tr>")?;
    for (kind, m) in &data.all_metrics {
        let direction = data
            .trends
            .get(kind)
            .map_or(TrendDirection::Unknown, |t| t.direction);
        writeln!(
            out,
            "<tr><td class=\"name\">{}</td><td>{}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td><td>{}</td><td>{}</td></tr>",
            html_escape(kind.as_str()),
            m.count,
            m.mean,
            m.median,
            m.min,
            m.max,
            m.std_dev,
            html_escape(&m.unit),
            direction
        )?;
    }
    writeln!(out, "</table>")?;

    writeln!(out, "<h2>Issues</h2>")?;
    if data.issues.is_empty() {
        writeln!(out, "<p>No issues detected.</p>")?;
    }
    for issue in &data.issues {
        writeln!(
            out,
            "<div class=\"issue\" style=\"border-color:{}\"><strong>{}</strong> {}</div>",
            issue.severity.color(),
            html_escape(&issue.severity.as_str().to_uppercase()),
            html_escape(&issue.description)
        )?;
    }

    let skip = data.raw_samples.len().saturating_sub(REPORT_RAW_SAMPLE_LIMIT);
    writeln!(out, "<h2>Recent Samples</h2>")?;
    writeln!(out, "<table><tr><th>time</th><th>metric</th><th>value</th><th>unit</th><th>tags</th></tr>")?;
    for sample in data.raw_samples.iter().skip(skip) {
        let tags = sample
            .tags
            .iter()
            .map(|t| format!("{}={}", t.key, t.value))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            out,
            "<tr><td class=\"name\">{}</td><td class=\"name\">{}</td><td>{:.3}</td><td>{}</td><td class=\"name\">{}</td></tr>",
            html_escape(&sample.timestamp.to_string()),
            html_escape(sample.kind.as_str()),
            sample.value,
            html_escape(&sample.unit),
            html_escape(&tags)
        )?;
    }
    writeln!(out, "</table>")?;
    writeln!(out, "</body></html>")?;

    Ok(out)
}

// ============================================================================
// SECTION 15: MONITOR APPLICATION
// ============================================================================
// Wires configuration, collector, analyzer, reporter and an optional
// simulator together, and runs the periodic analysis loop on Tokio.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Application State
// ----------------------------------------------------------------------------

/// Point-in-time view of the whole monitor
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub collector: CollectorStats,
    pub latency: Option<LatencyStats>,
    pub throughput: f64,
    pub simulation: Option<SimulationSnapshot>,
}

pub struct MonitorApp {
    config: Arc<ConfigManager>,
    collector: MetricsCollector,
    analyzer: PerformanceAnalyzer,
    reporter: PerformanceReporter,
    shutdown: CancellationToken,
    simulator: Mutex<Option<Arc<WorkloadSimulator>>>,
}

impl MonitorApp {
    pub fn new(config: Arc<ConfigManager>) -> Self {
        let shutdown = CancellationToken::new();
        let current = config.get();
        let collector = MetricsCollector::new(&current.metrics, shutdown.clone());
        let analyzer = PerformanceAnalyzer::with_thresholds(collector.clone(), current.thresholds);
        let reporter = PerformanceReporter::new(collector.clone());

        Self {
            config,
            collector,
            analyzer,
            reporter,
            shutdown,
            simulator: Mutex::new(None),
        }
    }

    pub fn config(&self) -> Arc<MonitorConfig> {
        self.config.get()
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    pub fn analyzer(&self) -> &PerformanceAnalyzer {
        &self.analyzer
    }

    /// Cancelling this token ends any running monitoring session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            collector: self.collector.stats(),
            latency: self.collector.current_latency_stats(),
            throughput: self.collector.peek_throughput(),
            simulation: self.simulator.lock().as_ref().map(|sim| sim.stats()),
        }
    }

    // ---- Sessions ----

    /// Monitor until `duration` elapses, Ctrl-C, or shutdown. With a scenario
    /// name, the scenario's simulator feeds the collector meanwhile.
    pub async fn start_monitoring(
        &self,
        scenario: Option<&str>,
        duration: Option<Duration>,
    ) -> MonitorResult<Option<SimulationSnapshot>> {
        let simulation = match scenario {
            Some(name) => {
                let scenario = Scenario::named(name)?;
                Some(scenario.simulator_config(&self.config.get().simulation))
            }
            None => None,
        };
        self.run_session(simulation, duration).await
    }

    /// Run `scenario` (optionally with a different workload) for `duration`
    /// and return the simulator's final statistics.
    pub async fn run_simulation(
        &self,
        scenario: &str,
        workload: Option<WorkloadProfile>,
        duration: Duration,
    ) -> MonitorResult<SimulationSnapshot> {
        let scenario = Scenario::named(scenario)?;
        let mut simulation = scenario.simulator_config(&self.config.get().simulation);
        if let Some(workload) = workload {
            simulation.workload = workload;
        }

        self.run_session(Some(simulation), Some(duration))
            .await?
            .ok_or_else(|| MonitorError::Internal("simulation produced no statistics".into()))
    }

    async fn run_session(
        &self,
        simulation: Option<SimulatorConfig>,
        duration: Option<Duration>,
    ) -> MonitorResult<Option<SimulationSnapshot>> {
        let config = self.config.get();
        self.collector
            .start_collection(config.monitoring.sampling_interval())?;

        if let Some(sim_config) = simulation {
            info!(
                target: "perfwatch::app",
                workload = %sim_config.workload,
                workers = sim_config.workers,
                buffer_size = sim_config.buffer_size,
                "Starting workload simulation"
            );
            let callback: Arc<dyn MetricsCallback> = Arc::new(self.collector.clone());
            let simulator = WorkloadSimulator::new(sim_config, callback)
                .map(|sim| Arc::new(sim.with_shutdown(self.shutdown.child_token())));
            let started = simulator.and_then(|sim| sim.start().map(|()| sim));
            match started {
                Ok(sim) => *self.simulator.lock() = Some(sim),
                Err(e) => {
                    self.stop_all().await?;
                    return Err(e.into());
                }
            }
        }

        let session = self.shutdown.child_token();
        let analysis = tokio::spawn(analysis_loop(
            self.analyzer.clone(),
            self.simulator.lock().clone(),
            config.monitoring.analysis_period(),
            session.clone(),
        ));

        info!(
            target: "perfwatch::app",
            duration_secs = duration.map(|d| d.as_secs_f64()),
            "Monitoring started"
        );

        let deadline = async {
            match duration {
                Some(duration) => sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = deadline => info!(target: "perfwatch::app", "Monitoring duration elapsed"),
            _ = wait_for_interrupt() => info!(target: "perfwatch::app", "Interrupt received, shutting down"),
            _ = self.shutdown.cancelled() => info!(target: "perfwatch::app", "Shutdown requested"),
        }

        session.cancel();
        if let Err(e) = analysis.await {
            error!(target: "perfwatch::app", error = %e, "Analysis loop terminated abnormally");
        }

        let snapshot = self.stop_all().await?;
        for issue in self.analyzer.identify_issues(None) {
            warn!(
                target: "perfwatch::app",
                kind = %issue.kind,
                severity = %issue.severity,
                "{}",
                issue.description
            );
        }
        info!(target: "perfwatch::app", "Monitoring stopped");
        Ok(snapshot)
    }

    /// Stop the simulator and the sampler off the async runtime; both join threads
    async fn stop_all(&self) -> MonitorResult<Option<SimulationSnapshot>> {
        let simulator = self.simulator.lock().take();
        let collector = self.collector.clone();

        tokio::task::spawn_blocking(move || {
            let snapshot = simulator.map(|sim| {
                sim.stop();
                sim.stats()
            });
            collector.stop_collection();
            snapshot
        })
        .await
        .map_err(|e| MonitorError::Internal(format!("shutdown task failed: {}", e)))
    }

    // ---- Reports ----

    pub fn render_report(&self, format: ReportFormat, hours: f64) -> MonitorResult<String> {
        let thresholds = self.config.get().thresholds;
        let data = self.reporter.collect(hours_to_duration(hours), &thresholds);
        Ok(PerformanceReporter::render(&data, format)?)
    }

    /// Write a report to `output`, or to a timestamped file in the configured
    /// report directory. Returns the path written.
    pub fn generate_report(
        &self,
        format: ReportFormat,
        hours: f64,
        output: Option<&Path>,
    ) -> MonitorResult<PathBuf> {
        let config = self.config.get();
        let path = match output {
            Some(path) => path.to_path_buf(),
            None => PerformanceReporter::default_report_path(config.reporting.output_dir.as_deref(), format),
        };
        self.reporter
            .write_report(&path, format, hours_to_duration(hours), &config.thresholds)?;
        Ok(path)
    }
}

impl Drop for MonitorApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Debug for MonitorApp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorApp")
            .field("config_path", &self.config.config_path())
            .field("collector", &self.collector)
            .field("simulating", &self.simulator.lock().is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 15.2 Analysis Loop
// ----------------------------------------------------------------------------

async fn analysis_loop(
    analyzer: PerformanceAnalyzer,
    simulator: Option<Arc<WorkloadSimulator>>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => run_analysis(&analyzer, simulator.as_deref()),
        }
    }

    debug!(target: "perfwatch::app", "Analysis loop exited");
}

fn run_analysis(analyzer: &PerformanceAnalyzer, simulator: Option<&WorkloadSimulator>) {
    let issues = analyzer.identify_issues(None);
    for issue in &issues {
        match issue.severity {
            Severity::Critical => error!(
                target: "perfwatch::analyzer",
                kind = %issue.kind,
                observed = issue.observed_value,
                threshold = issue.threshold,
                "{}",
                issue.description
            ),
            _ => warn!(
                target: "perfwatch::analyzer",
                kind = %issue.kind,
                observed = issue.observed_value,
                threshold = issue.threshold,
                "{}",
                issue.description
            ),
        }
    }

    let collector = analyzer.collector();
    let stats = collector.stats();
    let p95 = collector.current_latency_stats().map(|l| l.p95);
    match simulator.map(WorkloadSimulator::stats) {
        Some(sim) => info!(
            target: "perfwatch::analyzer",
            samples = stats.samples.len,
            p95_ms = p95,
            throughput = collector.peek_throughput(),
            generated = sim.events_generated,
            processed = sim.events_processed,
            dropped = sim.events_dropped,
            queue_depth = sim.queue_depth,
            issues = issues.len(),
            "Status"
        ),
        None => info!(
            target: "perfwatch::analyzer",
            samples = stats.samples.len,
            p95_ms = p95,
            throughput = collector.peek_throughput(),
            issues = issues.len(),
            "Status"
        ),
    }
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn wait_for_interrupt() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(target: "perfwatch::app", error = %e, "Unable to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

// ============================================================================
// SECTION 16: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Perfwatch CLI
#[derive(Parser, Debug)]
#[command(
    name = "perfwatch",
    version,
    about = "Real-time performance monitor with a built-in workload simulator",
    long_about = "Perfwatch collects latency, throughput and host resource samples into \
                  bounded buffers, reports percentiles, trends and threshold breaches, \
                  and can drive itself with a multi-threaded synthetic workload."
)]
pub struct Cli {
    /// Configuration file path (default: perfwatch.toml or config/perfwatch.toml)
    #[arg(short, long, env = "PERFWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(short, long, env = "PERFWATCH_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Monitor the host, optionally driven by a simulated workload
    Start {
        /// Monitor only, without a simulated workload
        #[arg(long)]
        no_simulate: bool,

        /// Scenario to simulate (default: simulation.default_scenario)
        #[arg(short, long)]
        scenario: Option<String>,

        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(short = 't', long)]
        duration: Option<u64>,
    },

    /// Run a simulation scenario and print its statistics
    Simulate {
        /// Scenario to run (default: simulation.default_scenario)
        #[arg(short, long)]
        scenario: Option<String>,

        /// Duration in seconds
        #[arg(short = 't', long)]
        duration: Option<u64>,

        /// Override the scenario's workload profile
        #[arg(short, long, value_enum)]
        workload: Option<WorkloadProfile>,
    },

    /// Collect for a while, then write a performance report
    Report {
        /// Output path (default: timestamped file; console prints to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Report format (default: reporting.default_format)
        #[arg(short, long, value_enum)]
        format: Option<ReportFormat>,

        /// Report window in hours (default: reporting.default_hours)
        #[arg(long)]
        hours: Option<f64>,

        /// Seconds to collect before reporting
        #[arg(long, default_value_t = 5)]
        collect_for: u64,

        /// Simulate this scenario while collecting
        #[arg(short, long)]
        scenario: Option<String>,
    },

    /// List simulation scenarios
    Scenarios,

    /// Show the effective configuration
    Config {
        /// Write it to this path as TOML instead
        #[arg(short, long)]
        write: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 16.2 CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_version() {
    println!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Bounded metric buffers with percentile latency windows");
    println!("  • Trend and threshold analysis");
    println!("  • Multi-threaded workload simulation with backpressure");
    println!("  • Console, HTML and JSON reports");
}

fn handle_scenarios() {
    println!("📋 Available scenarios:");
    for scenario in Scenario::all() {
        println!(
            "  • {:<18} {:<7} workers={:<2} queue={:<5} {:>4}s  {}",
            scenario.name,
            scenario.workload.as_str(),
            scenario.workers,
            scenario.buffer_size,
            scenario.duration.as_secs(),
            scenario.description
        );
    }
}

fn handle_config(manager: &ConfigManager, write: Option<&Path>) -> MonitorResult<()> {
    match write {
        Some(path) => {
            manager.save(path)?;
            println!("✅ Configuration written to: {}", path.display());
        }
        None => {
            match manager.config_path() {
                Some(path) => println!("# Loaded from {}", path.display()),
                None => println!("# Built-in defaults"),
            }
            let rendered = toml::to_string_pretty(&*manager.get())
                .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
            println!("{}", rendered);
        }
    }
    Ok(())
}

fn print_simulation_summary(snapshot: &SimulationSnapshot) {
    println!("\n📊 Simulation Summary:");
    println!("  • Duration: {:.1}s", snapshot.elapsed_secs);
    println!("  • Events generated: {}", snapshot.events_generated);
    println!("  • Events processed: {}", snapshot.events_processed);
    println!("  • Events failed: {}", snapshot.events_failed);
    println!("  • Events dropped: {}", snapshot.events_dropped);
    println!("  • Queue depth at stop: {}", snapshot.queue_depth);
    println!("  • Queue high-water mark: {}", snapshot.queue_high_water_mark);
    println!("  • Avg processing time: {:.2}ms", snapshot.average_processing_time_ms);
    println!("  • Success rate: {:.2}%", snapshot.success_rate);
    println!("  • Error rate: {:.2}%", snapshot.error_rate);
}

/// Scenario duration precedence: explicit flag, then the configured default
/// for the default scenario, then the preset's own duration.
fn resolve_duration(config: &MonitorConfig, scenario: &str, explicit: Option<u64>) -> MonitorResult<Duration> {
    if let Some(secs) = explicit {
        return Ok(Duration::from_secs(secs));
    }
    if scenario == config.simulation.default_scenario {
        return Ok(Duration::from_secs(config.simulation.default_duration));
    }
    Ok(Scenario::named(scenario)?.duration)
}

async fn handle_start(
    app: &MonitorApp,
    no_simulate: bool,
    scenario: Option<String>,
    duration: Option<u64>,
) -> MonitorResult<()> {
    let config = app.config();
    let scenario = if no_simulate {
        None
    } else {
        Some(scenario.unwrap_or_else(|| config.simulation.default_scenario.clone()))
    };

    match &scenario {
        Some(name) => println!("🚀 Monitoring with simulated scenario '{}' (Ctrl-C to stop)", name),
        None => println!("🚀 Monitoring host resources (Ctrl-C to stop)"),
    }

    let snapshot = app
        .start_monitoring(scenario.as_deref(), duration.map(Duration::from_secs))
        .await?;
    if let Some(snapshot) = &snapshot {
        print_simulation_summary(snapshot);
    }

    let status = app.status();
    println!("\n✅ Monitoring finished: {} samples held", status.collector.samples.len);
    Ok(())
}

async fn handle_simulate(
    app: &MonitorApp,
    scenario: Option<String>,
    duration: Option<u64>,
    workload: Option<WorkloadProfile>,
) -> MonitorResult<()> {
    let config = app.config();
    let scenario = scenario.unwrap_or_else(|| config.simulation.default_scenario.clone());
    let duration = resolve_duration(&config, &scenario, duration)?;

    println!("🚀 Running scenario '{}' for {}s", scenario, duration.as_secs());
    let snapshot = app.run_simulation(&scenario, workload, duration).await?;
    print_simulation_summary(&snapshot);

    if let Some(latency) = app.collector().current_latency_stats() {
        println!("\n⏱  Latency: p50 {:.2}ms  p95 {:.2}ms  p99 {:.2}ms", latency.median, latency.p95, latency.p99);
    }
    Ok(())
}

async fn handle_report(
    app: &MonitorApp,
    output: Option<PathBuf>,
    format: Option<ReportFormat>,
    hours: Option<f64>,
    collect_for: u64,
    scenario: Option<String>,
) -> MonitorResult<()> {
    let config = app.config();
    let format = format.unwrap_or(config.reporting.default_format);
    let hours = hours.unwrap_or(config.reporting.default_hours);

    if collect_for > 0 {
        println!("⏳ Collecting for {}s...", collect_for);
        app.start_monitoring(scenario.as_deref(), Some(Duration::from_secs(collect_for)))
            .await?;
    }

    if format == ReportFormat::Console && output.is_none() {
        println!("{}", app.render_report(format, hours)?);
        return Ok(());
    }

    let path = app.generate_report(format, hours, output.as_deref())?;
    println!("✅ Report written to: {}", path.display());
    Ok(())
}

// ============================================================================
// SECTION 17: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need configuration or logging
    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::Scenarios => {
            handle_scenarios();
            return Ok(());
        }
        _ => {}
    }

    let manager = ConfigManager::load_or_default(cli.config.as_deref());

    let mut logging_config = manager.get().logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _log_guard = init_logging(&logging_config).context("failed to initialize logging")?;

    if let Some(diagnostic) = manager.diagnostic() {
        warn!(target: "perfwatch::config", diagnostic, "Using default configuration");
    }
    info!(target: "perfwatch::app", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    if let Commands::Config { write } = &cli.command {
        handle_config(&manager, write.as_deref()).context("config command failed")?;
        return Ok(());
    }

    let app = MonitorApp::new(Arc::new(manager));
    match cli.command {
        Commands::Start {
            no_simulate,
            scenario,
            duration,
        } => handle_start(&app, no_simulate, scenario, duration)
            .await
            .context("monitoring failed")?,
        Commands::Simulate {
            scenario,
            duration,
            workload,
        } => handle_simulate(&app, scenario, duration, workload)
            .await
            .context("simulation failed")?,
        Commands::Report {
            output,
            format,
            hours,
            collect_for,
            scenario,
        } => handle_report(&app, output, format, hours, collect_for, scenario)
            .await
            .context("report generation failed")?,
        Commands::Version | Commands::Scenarios | Commands::Config { .. } => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 18: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_timestamp_operations() {
        let ts1 = Timestamp::now();
        std::thread::sleep(Duration::from_millis(10));
        let ts2 = Timestamp::now();

        assert!(ts2 > ts1);
        assert!(ts2.duration_since(ts1).as_millis() >= 10);
        assert_eq!(ts1.duration_since(ts2), Duration::ZERO);

        let base = Timestamp::from_secs(100);
        assert_eq!(base.add_duration(Duration::from_millis(1500)).as_millis(), 101_500);
        assert_eq!(base.sub_duration(Duration::from_secs(40)), Timestamp::from_secs(60));
        assert_eq!(Timestamp::MAX.add_duration(Duration::from_secs(1)), Timestamp::MAX);
    }

    #[test]
    fn test_timestamp_now_never_goes_backwards() {
        let mut previous = Timestamp::now();
        for _ in 0..10_000 {
            let current = Timestamp::now();
            assert!(current >= previous);
            previous = current;
        }

        let skew = Timestamp::now().as_nanos() - Timestamp::wall_clock().as_nanos();
        assert!(skew.abs() < 5_000_000_000);
    }

    #[test]
    fn test_timestamp_range_is_inclusive() {
        let start = Timestamp::from_secs(10);
        let end = Timestamp::from_secs(20);

        assert!(start.is_within(start, end));
        assert!(end.is_within(start, end));
        assert!(!Timestamp::from_secs(21).is_within(start, end));
        assert_eq!(Timestamp::EPOCH.to_string(), "1970-01-01 00:00:00.000 UTC");
    }

    #[test]
    fn test_tags() {
        let mut tags: Tags = tags!["host" => "web-01", "env" => "prod"];

        assert_eq!(tags.get("host"), Some("web-01"));
        assert_eq!(tags.get("missing"), None);

        tags.set("host", "web-02");
        assert_eq!(tags.get("host"), Some("web-02"));
        assert_eq!(tags.len(), 2);

        tags.set("region", "eu-west");
        assert_eq!(tags[2].key.as_str(), "region");

        assert!(tags.remove_key("env").is_some());
        assert!(!tags.contains_key("env"));
    }

    #[test]
    fn test_sample_builders() {
        let sample = Sample::latency(12.5, "checkout")
            .with_tag("region", "us-east")
            .at(Timestamp::from_secs(5));

        assert_eq!(sample.kind, MetricKind::Latency);
        assert_eq!(sample.unit.as_str(), "ms");
        assert_eq!(sample.tag("operation"), Some("checkout"));
        assert_eq!(sample.timestamp, Timestamp::from_secs(5));

        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["kind"], "latency");
        assert_eq!(json["tags"]["region"], "us-east");
    }

    #[test]
    fn test_metric_kind_parsing() {
        assert_eq!("cpu_usage".parse::<MetricKind>().unwrap(), MetricKind::CpuUsage);
        assert_eq!(MetricKind::MemoryUsed.default_unit(), "MB");
        assert!("disk".parse::<MetricKind>().is_err());
    }

    #[test]
    fn test_bounded_ring_eviction() {
        let mut ring = BoundedRing::new(3);
        for i in 1..=3 {
            assert_eq!(ring.push(i), None);
        }
        assert_eq!(ring.push(4), Some(1));
        ring.push(5);

        assert_eq!(ring.to_vec(), vec![3, 4, 5]);
        assert_eq!(
            ring.stats(),
            RingStats {
                capacity: 3,
                len: 3,
                total_pushed: 5,
                evicted: 2,
            }
        );

        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.stats().total_pushed, 5);
    }

    #[test]
    fn test_bounded_ring_zero_capacity() {
        let mut ring = BoundedRing::new(0);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.to_vec(), vec!["b"]);
    }

    #[test]
    fn test_throughput_counter_delays_short_windows() {
        let t0 = Instant::now();
        let mut counter = ThroughputCounter::starting_at(t0);

        counter.record(50);
        assert_eq!(counter.rate_at(t0 + Duration::from_millis(500)), 0.0);
        assert_eq!(counter.pending(), 50);

        counter.record(50);
        counter.record(0);
        assert!(approx(counter.rate_at(t0 + Duration::from_secs(2)), 50.0));
        assert_eq!(counter.pending(), 0);
        assert_eq!(counter.total_events(), 100);

        // Window restarted at the read
        assert_eq!(counter.rate_at(t0 + Duration::from_millis(2500)), 0.0);
    }

    #[test]
    fn test_throughput_peek_does_not_consume() {
        let t0 = Instant::now();
        let mut counter = ThroughputCounter::starting_at(t0);
        counter.record(10);

        assert!(approx(counter.peek_rate_at(t0 + Duration::from_secs(2)), 5.0));
        assert_eq!(counter.pending(), 10);
    }

    #[test]
    fn test_percentiles() {
        let values = [5.0, 1.0, 4.0, 2.0, 3.0];

        assert!(approx(StatisticalFunctions::median(&values), 3.0));
        assert!(approx(StatisticalFunctions::percentile(&values, 95.0), 4.8));
        assert!(approx(StatisticalFunctions::percentile(&values, 0.0), 1.0));
        assert!(approx(StatisticalFunctions::percentile(&values, 100.0), 5.0));
        assert!(approx(StatisticalFunctions::median(&[1.0, 2.0, 3.0, 4.0]), 2.5));
        assert_eq!(StatisticalFunctions::percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_sample_std_dev() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!(approx(StatisticalFunctions::mean(&values), 5.0));
        assert!(approx(StatisticalFunctions::variance(&values), 32.0 / 7.0));
        assert_eq!(StatisticalFunctions::std_dev(&[3.0]), 0.0);
    }

    #[test]
    fn test_latency_stats() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let stats = LatencyStats::from_values(&values).unwrap();

        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert!(approx(stats.mean, 50.5));
        assert!(approx(stats.median, 50.5));
        assert!(approx(stats.p95, 95.05));
        assert!(approx(stats.p99, 99.01));
        assert!(LatencyStats::from_values(&[]).is_none());
    }

    #[test]
    fn test_atomic_f64() {
        let value = AtomicF64::new(1.5);
        value.fetch_add(2.0, AtomicOrdering::Relaxed);
        assert_eq!(value.load(AtomicOrdering::Relaxed), 3.5);

        let hwm = AtomicUsize::new(3);
        fetch_max_usize(&hwm, 2);
        fetch_max_usize(&hwm, 7);
        assert_eq!(hwm.load(AtomicOrdering::Relaxed), 7);
    }

    #[test]
    fn test_duration_conversions() {
        assert_eq!(secs_to_duration(1.5), Duration::from_millis(1500));
        assert_eq!(secs_to_duration(-1.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::INFINITY), Duration::MAX);
        assert_eq!(hours_to_duration(0.5), Duration::from_secs(1800));
    }

    #[test]
    fn test_wait_for_cancellation() {
        let token = CancellationToken::new();
        assert!(!wait_for_cancellation(&token, Duration::from_millis(10)));

        token.cancel();
        let started = Instant::now();
        assert!(wait_for_cancellation(&token, Duration::MAX));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_config_defaults() {
        let config = MonitorConfig::default();

        assert_eq!(config.monitoring.interval, 1.0);
        assert_eq!(config.monitoring.analysis_interval, 60.0);
        assert_eq!(config.metrics.buffer_size, 10_000);
        assert_eq!(config.metrics.latency_buffer_size, 1_000);
        assert_eq!(config.thresholds.cpu_usage, 80.0);
        assert_eq!(config.thresholds.memory_usage, 85.0);
        assert_eq!(config.thresholds.latency_p95, 1000.0);
        assert_eq!(config.thresholds.min_throughput, 100.0);
        assert_eq!(config.simulation.default_scenario, "normal_load");
        assert_eq!(config.simulation.default_duration, 300);
        assert_eq!(config.reporting.default_format, ReportFormat::Html);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_roundtrip() {
        let rendered = MonitorConfig::generate_default_config();
        let parsed = MonitorConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, MonitorConfig::default());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = MonitorConfig::from_toml_str(
            r#"
            [thresholds]
            cpu_usage = 70.0

            [reporting]
            default_format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.thresholds.cpu_usage, 70.0);
        assert_eq!(config.thresholds.memory_usage, 85.0);
        assert_eq!(config.reporting.default_format, ReportFormat::Json);
        assert_eq!(config.metrics, MetricsConfig::default());
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        let cases = [
            ("[metrics]\nbuffer_size = 0", "metrics.buffer_size"),
            ("[monitoring]\ninterval = 0.0", "monitoring.interval"),
            ("[thresholds]\ncpu_usage = -1.0", "thresholds.cpu_usage"),
            ("[simulation]\nerror_rate = 1.5", "simulation.error_rate"),
            ("[simulation]\nmin_processing_ms = 20.0\nmax_processing_ms = 10.0", "simulation.max_processing_ms"),
            ("[simulation]\ndefault_scenario = \"meltdown\"", "simulation.default_scenario"),
        ];

        for (toml_str, expected_field) in cases {
            match MonitorConfig::from_toml_str(toml_str) {
                Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, expected_field),
                other => panic!("expected invalid {}, got {:?}", expected_field, other),
            }
        }
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perfwatch.toml");
        fs::write(&path, "[metrics]\nlatency_buffer_size = 250\n").unwrap();

        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.metrics.latency_buffer_size, 250);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            MonitorConfig::load(&missing),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_config_manager_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[metrics\nbuffer_size = ").unwrap();

        let manager = ConfigManager::load_or_default(Some(&path));
        assert_eq!(*manager.get(), MonitorConfig::default());
        assert!(manager.diagnostic().is_some());

        let missing = ConfigManager::load_or_default(Some(&dir.path().join("nope.toml")));
        assert!(missing.diagnostic().unwrap().contains("not found"));
    }

    #[test]
    fn test_config_manager_update_and_save() {
        let manager = ConfigManager::new(MonitorConfig::default());
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        manager.on_update(move |_| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        let mut invalid = MonitorConfig::default();
        invalid.metrics.buffer_size = 0;
        assert!(manager.update(invalid).is_err());
        assert_eq!(notified.load(AtomicOrdering::SeqCst), 0);

        let mut updated = MonitorConfig::default();
        updated.thresholds.cpu_usage = 60.0;
        manager.update(updated.clone()).unwrap();
        assert_eq!(notified.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(manager.get().thresholds.cpu_usage, 60.0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("perfwatch.toml");
        manager.save(&path).unwrap();
        let reloaded = ConfigManager::from_file(&path).unwrap();
        assert_eq!(*reloaded.get(), updated);
    }

    #[test]
    fn test_error_categories() {
        let err: MonitorError = SimulationError::UnknownScenario { name: "x".into() }.into();
        assert_eq!(err.category(), "simulation");
        assert!(err.is_recoverable());

        let err: MonitorError = ConfigError::invalid_value("a", "b").into();
        assert!(!err.is_recoverable());
    }
}

#[cfg(test)]
mod collector_tests {
    use super::*;

    fn snapshot(cpu: f64, memory: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: cpu,
            memory_percent: memory,
            memory_used_mb: 2048.0,
        }
    }

    #[test]
    fn test_latency_window_count_is_bounded() {
        let collector = MetricsCollector::with_capacity(100, 10);
        for i in 0..25 {
            collector.record_latency(f64::from(i), "op");
        }

        let stats = collector.current_latency_stats().unwrap();
        assert_eq!(stats.count, 10);
        assert_eq!(stats.min, 15.0);
        assert_eq!(stats.max, 24.0);
        assert_eq!(collector.all_metrics().len(), 25);
    }

    #[test]
    fn test_sample_ring_keeps_most_recent() {
        let collector = MetricsCollector::with_capacity(5, 5);
        for i in 0..8 {
            collector.record(Sample::new(MetricKind::Custom, f64::from(i)));
        }

        let values: Vec<f64> = collector.all_metrics().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(collector.stats().samples.evicted, 3);
    }

    #[test]
    fn test_metrics_in_range() {
        let collector = MetricsCollector::with_capacity(100, 10);
        for secs in 1..=5 {
            collector.record(
                Sample::new(MetricKind::Custom, secs as f64).at(Timestamp::from_secs(secs)),
            );
        }

        let in_range = collector.metrics_in_range(Timestamp::from_secs(2), Timestamp::from_secs(4));
        let values: Vec<f64> = in_range.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);

        assert!(collector
            .metrics_in_range(Timestamp::from_secs(4), Timestamp::from_secs(2))
            .is_empty());
        assert!(collector
            .metrics_in_range(Timestamp::from_secs(10), Timestamp::from_secs(20))
            .is_empty());
        assert_eq!(
            collector
                .metrics_in_range(Timestamp::from_secs(3), Timestamp::from_secs(3))
                .len(),
            1
        );
    }

    #[test]
    fn test_recorded_latency_sample_is_tagged() {
        let collector = MetricsCollector::with_capacity(10, 10);
        collector.record_latency(4.2, "processor_1");

        let samples = collector.recent_metrics(Duration::from_secs(60));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].kind, MetricKind::Latency);
        assert_eq!(samples[0].tag("operation"), Some("processor_1"));
    }

    #[test]
    fn test_non_finite_values_are_ignored() {
        let collector = MetricsCollector::with_capacity(10, 10);
        collector.record_latency(f64::NAN, "op");
        collector.record(Sample::new(MetricKind::CpuUsage, f64::INFINITY));

        assert!(collector.all_metrics().is_empty());
        assert!(collector.current_latency_stats().is_none());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let collector = MetricsCollector::with_capacity(10, 10);
        collector.record_latency(1.0, "op");
        collector.record_throughput_event(5);

        collector.clear();
        assert!(collector.all_metrics().is_empty());
        assert!(collector.current_latency_stats().is_none());
        assert_eq!(collector.current_throughput(), 0.0);
        assert_eq!(collector.stats().pending_throughput_events, 0);

        collector.clear();
        assert!(collector.all_metrics().is_empty());
        assert_eq!(collector.stats().samples.len, 0);
    }

    #[test]
    fn test_clones_share_buffers() {
        let collector = MetricsCollector::with_capacity(10, 10);
        let other = collector.clone();
        other.record_latency(3.0, "op");
        assert_eq!(collector.current_latency_stats().unwrap().count, 1);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        const WRITERS: u64 = 6;
        const PER_WRITER: u64 = 2_000;
        let total = WRITERS * PER_WRITER;

        for ring_capacity in [20_000usize, 5_000] {
            let collector = MetricsCollector::with_capacity(ring_capacity, 1_000);

            thread::scope(|scope| {
                for writer in 0..WRITERS {
                    let collector = &collector;
                    scope.spawn(move || {
                        for i in 0..PER_WRITER {
                            collector.record_latency((writer * 100_000 + i) as f64, "op");
                            collector.record_throughput_event(1);
                        }
                    });
                }

                let collector = &collector;
                scope.spawn(move || {
                    for _ in 0..200 {
                        if let Some(stats) = collector.current_latency_stats() {
                            assert!(stats.count <= 1_000);
                            assert!(stats.p95 <= stats.p99);
                        }
                        assert!(collector.recent_metrics(Duration::from_secs(60)).len() <= ring_capacity);
                    }
                });
            });

            let samples = collector.all_metrics();
            let expected_len = (total as usize).min(ring_capacity);
            assert_eq!(samples.len(), expected_len);
            assert_eq!(collector.current_latency_stats().unwrap().count, 1_000);

            let stats = collector.stats();
            assert_eq!(stats.samples.total_pushed, total);
            assert_eq!(stats.samples.evicted, total - expected_len as u64);
            assert_eq!(stats.total_throughput_events, total);

            let unique: std::collections::HashSet<u64> =
                samples.iter().map(|s| s.value as u64).collect();
            assert_eq!(unique.len(), samples.len());

            assert!(samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
            for writer in 0..WRITERS {
                let own: Vec<u64> = samples
                    .iter()
                    .map(|s| s.value as u64)
                    .filter(|v| v / 100_000 == writer)
                    .collect();
                assert!(own.windows(2).all(|w| w[0] + 1 == w[1]));
                if ring_capacity as u64 >= total {
                    assert_eq!(own.len() as u64, PER_WRITER);
                }
            }
        }
    }

    #[test]
    fn test_sample_resources_appends_system_samples() {
        let collector = MetricsCollector::with_capacity(100, 10);
        let mut sampler = MockResourceSampler::new();
        sampler
            .expect_sample()
            .times(1)
            .returning(|| Ok(snapshot(42.0, 55.0)));

        collector.sample_resources(&mut sampler).unwrap();

        let kinds: Vec<MetricKind> = collector.all_metrics().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![MetricKind::CpuUsage, MetricKind::MemoryUsage, MetricKind::MemoryUsed]
        );
        assert_eq!(collector.stats().sampler_ticks, 1);
    }

    #[test]
    fn test_sample_resources_failure_is_counted() {
        let collector = MetricsCollector::with_capacity(100, 10);
        let mut sampler = MockResourceSampler::new();
        sampler.expect_sample().returning(|| {
            Err(SamplerError::Failed {
                message: "procfs unavailable".into(),
            })
        });

        assert!(collector.sample_resources(&mut sampler).is_err());
        assert!(collector.sample_resources(&mut sampler).is_err());

        let stats = collector.stats();
        assert_eq!(stats.sampler_ticks, 2);
        assert_eq!(stats.sampler_errors, 2);
        assert!(collector.all_metrics().is_empty());
    }

    #[test]
    fn test_background_sampler_start_stop() {
        let collector = MetricsCollector::with_capacity(1000, 10);
        let mut sampler = MockResourceSampler::new();
        sampler.expect_sample().returning(|| Ok(snapshot(10.0, 20.0)));

        collector
            .start_collection_with(Duration::from_millis(20), Box::new(sampler))
            .unwrap();
        assert!(collector.is_collecting());

        std::thread::sleep(Duration::from_millis(150));
        collector.stop_collection();
        collector.stop_collection();

        assert!(!collector.is_collecting());
        let stats = collector.stats();
        assert!(stats.sampler_ticks >= 1);
        assert!(stats.samples.len >= 3);

        // No more samples once stopped
        let held = collector.all_metrics().len();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(collector.all_metrics().len(), held);
    }

    #[test]
    fn test_sampler_keeps_running_after_errors() {
        let collector = MetricsCollector::with_capacity(1000, 10);
        let mut sampler = MockResourceSampler::new();
        let mut calls = 0u32;
        sampler.expect_sample().returning(move || {
            calls += 1;
            if calls % 2 == 1 {
                Err(SamplerError::Unavailable { resource: "memory" })
            } else {
                Ok(snapshot(10.0, 20.0))
            }
        });

        collector
            .start_collection_with(Duration::from_millis(10), Box::new(sampler))
            .unwrap();
        std::thread::sleep(Duration::from_millis(150));
        collector.stop_collection();

        let stats = collector.stats();
        assert!(stats.sampler_errors >= 1);
        assert!(stats.sampler_ticks > stats.sampler_errors);
        assert!(stats.samples.len >= 3);
    }

    #[test]
    fn test_zero_sampling_interval_is_rejected() {
        let collector = MetricsCollector::with_capacity(10, 10);
        let sampler = MockResourceSampler::new();
        let result = collector.start_collection_with(Duration::ZERO, Box::new(sampler));

        assert!(matches!(result, Err(MonitorError::InvalidInput { .. })));
        assert!(!collector.is_collecting());
    }

    #[test]
    fn test_shutdown_token_stops_sampler() {
        let token = CancellationToken::new();
        let collector = MetricsCollector::new(&MetricsConfig::default(), token.clone());
        let mut sampler = MockResourceSampler::new();
        sampler.expect_sample().returning(|| Ok(snapshot(1.0, 2.0)));

        collector
            .start_collection_with(Duration::from_millis(10), Box::new(sampler))
            .unwrap();
        token.cancel();
        std::thread::sleep(Duration::from_millis(200));

        assert!(!collector.is_collecting());
    }

    #[test]
    fn test_collector_as_metrics_callback() {
        let collector = MetricsCollector::with_capacity(10, 10);
        let callback: &dyn MetricsCallback = &collector;

        callback.on_metric(KIND_LATENCY, 7.5, "processor_0");
        callback.on_metric(KIND_THROUGHPUT_EVENT, 1.0, DEFAULT_OPERATION);
        callback.on_metric("queue_depth", 3.0, DEFAULT_OPERATION);

        assert_eq!(collector.current_latency_stats().unwrap().count, 1);
        assert_eq!(collector.stats().total_throughput_events, 1);
        assert_eq!(collector.all_metrics().len(), 1);
    }
}

#[cfg(test)]
mod analyzer_tests {
    use super::*;
    use test_case::test_case;

    fn analyzer_with(samples: &[(MetricKind, f64)], thresholds: Thresholds) -> PerformanceAnalyzer {
        let collector = MetricsCollector::with_capacity(1000, 1000);
        for (kind, value) in samples {
            collector.record(Sample::new(*kind, *value));
        }
        PerformanceAnalyzer::with_thresholds(collector, thresholds)
    }

    #[test_case(&[10.0, 20.0, 30.0, 40.0], TrendDirection::Increasing ; "strictly increasing")]
    #[test_case(&[40.0, 30.0, 20.0, 10.0], TrendDirection::Decreasing ; "strictly decreasing")]
    #[test_case(&[5.0; 8], TrendDirection::Stable ; "constant")]
    #[test_case(&[100.0, 101.0, 99.0, 105.0], TrendDirection::Stable ; "within ten percent")]
    #[test_case(&[1.0, 2.0, 3.0], TrendDirection::Stable ; "empty quarter")]
    #[test_case(&[1.0], TrendDirection::Unknown ; "single value")]
    #[test_case(&[], TrendDirection::Unknown ; "no values")]
    #[test_case(&[0.0, 0.0, 0.0, 5.0], TrendDirection::Increasing ; "zero baseline rising")]
    #[test_case(&[0.0, 0.0, 0.0, -5.0], TrendDirection::Decreasing ; "zero baseline falling")]
    #[test_case(&[0.0, 0.0, 0.0, 0.0], TrendDirection::Stable ; "all zero")]
    fn test_classify_direction(values: &[f64], expected: TrendDirection) {
        assert_eq!(PerformanceAnalyzer::classify_direction(values), expected);
    }

    #[test]
    fn test_trends_sort_by_timestamp() {
        let samples: Vec<Sample> = [(4, 40.0), (1, 10.0), (3, 30.0), (2, 20.0)]
            .into_iter()
            .map(|(secs, value)| Sample::new(MetricKind::CpuUsage, value).at(Timestamp::from_secs(secs)))
            .collect();

        let trends = PerformanceAnalyzer::trends_from_samples(&samples);
        let cpu = &trends[&MetricKind::CpuUsage];
        assert_eq!(cpu.direction, TrendDirection::Increasing);
        assert_eq!(cpu.count, 4);
        assert_eq!(cpu.mean, 25.0);
        assert_eq!(cpu.min, 10.0);
        assert_eq!(cpu.max, 40.0);
    }

    #[test]
    fn test_analyze_trends_groups_by_kind() {
        let analyzer = analyzer_with(
            &[
                (MetricKind::CpuUsage, 10.0),
                (MetricKind::MemoryUsage, 50.0),
                (MetricKind::CpuUsage, 12.0),
            ],
            Thresholds::default(),
        );

        let trends = analyzer.analyze_trends(Duration::from_secs(60));
        assert_eq!(trends.len(), 2);
        assert_eq!(trends[&MetricKind::CpuUsage].count, 2);
        assert_eq!(trends[&MetricKind::MemoryUsage].direction, TrendDirection::Unknown);
        assert!(analyzer.analyze_trends_hours(1.0).contains_key(&MetricKind::CpuUsage));
    }

    #[test]
    fn test_high_cpu_is_single_critical_issue() {
        let samples = vec![(MetricKind::CpuUsage, 95.0); 10];
        let thresholds = Thresholds {
            cpu_usage: 80.0,
            ..Thresholds::default()
        };
        let analyzer = analyzer_with(&samples, thresholds);

        let issues = analyzer.identify_issues(None);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::HighCpuUsage);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert_eq!(issues[0].observed_value, 95.0);
        assert_eq!(issues[0].threshold, 80.0);
    }

    #[test_case(MetricKind::CpuUsage, 85.0, Severity::Warning ; "cpu warning")]
    #[test_case(MetricKind::CpuUsage, 90.0, Severity::Warning ; "cpu at critical boundary")]
    #[test_case(MetricKind::MemoryUsage, 90.0, Severity::Warning ; "memory warning")]
    #[test_case(MetricKind::MemoryUsage, 96.0, Severity::Critical ; "memory critical")]
    fn test_resource_issue_severity(kind: MetricKind, value: f64, expected: Severity) {
        let analyzer = analyzer_with(&[(kind, value)], Thresholds::default());
        let issues = analyzer.identify_issues(None);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, expected);
    }

    #[test]
    fn test_no_samples_no_issues() {
        let analyzer = analyzer_with(&[], Thresholds::default());
        assert!(analyzer.identify_issues(None).is_empty());
    }

    #[test]
    fn test_issue_order_and_kinds() {
        let analyzer = analyzer_with(
            &[
                (MetricKind::Throughput, 5.0),
                (MetricKind::MemoryUsage, 88.0),
                (MetricKind::CpuUsage, 85.0),
            ],
            Thresholds::default(),
        );
        for _ in 0..20 {
            analyzer.collector().record_latency(2500.0, "slow");
        }

        let kinds: Vec<IssueKind> = analyzer.identify_issues(None).iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![
                IssueKind::HighCpuUsage,
                IssueKind::HighMemoryUsage,
                IssueKind::HighLatency,
                IssueKind::LowThroughput,
            ]
        );
    }

    #[test]
    fn test_threshold_override() {
        let analyzer = analyzer_with(&[(MetricKind::CpuUsage, 85.0)], Thresholds::default());
        let relaxed = Thresholds {
            cpu_usage: 99.0,
            ..Thresholds::default()
        };

        assert_eq!(analyzer.identify_issues(None).len(), 1);
        assert!(analyzer.identify_issues(Some(&relaxed)).is_empty());
    }

    #[test]
    fn test_old_samples_are_outside_lookback() {
        let collector = MetricsCollector::with_capacity(100, 100);
        let old = Timestamp::now().sub_duration(ISSUE_LOOKBACK + Duration::from_secs(60));
        collector.record(Sample::new(MetricKind::CpuUsage, 99.0).at(old));

        let analyzer = PerformanceAnalyzer::new(collector);
        assert!(analyzer.identify_issues(None).is_empty());
    }
}

#[cfg(test)]
mod simulator_tests {
    use super::*;
    use test_case::test_case;

    fn quick_config(workload: WorkloadProfile) -> SimulatorConfig {
        SimulatorConfig {
            workload,
            workers: 2,
            buffer_size: 100,
            min_processing_ms: 1.0,
            max_processing_ms: 5.0,
            error_rate: 0.01,
            seed: Some(7),
            ..SimulatorConfig::default()
        }
    }

    fn noop_callback() -> Arc<dyn MetricsCallback> {
        Arc::new(|_: &str, _: f64, _: &str| {})
    }

    fn assert_accounting(stats: &SimulationSnapshot) {
        assert_eq!(
            stats.events_generated,
            stats.events_processed
                + stats.events_failed
                + stats.events_dropped
                + stats.queue_depth as u64
        );
    }

    #[test_case(WorkloadProfile::Low, 0.0, 10.0)]
    #[test_case(WorkloadProfile::Medium, 0.0, 100.0)]
    #[test_case(WorkloadProfile::High, 12.0, 1000.0)]
    #[test_case(WorkloadProfile::Bursty, 3.0, 2000.0)]
    #[test_case(WorkloadProfile::Bursty, 7.0, 500.0)]
    #[test_case(WorkloadProfile::Bursty, 15.0, 50.0)]
    #[test_case(WorkloadProfile::Bursty, 29.5, 50.0)]
    #[test_case(WorkloadProfile::Bursty, 32.0, 2000.0)]
    fn test_workload_rates(profile: WorkloadProfile, elapsed_secs: f64, expected: f64) {
        assert_eq!(profile.rate_at(Duration::from_secs_f64(elapsed_secs)), expected);
    }

    #[test]
    fn test_workload_parsing() {
        assert_eq!("HIGH".parse::<WorkloadProfile>().unwrap(), WorkloadProfile::High);
        assert!(matches!(
            "extreme".parse::<WorkloadProfile>(),
            Err(SimulationError::UnknownWorkload { .. })
        ));
    }

    #[test]
    fn test_scenario_presets() {
        assert_eq!(Scenario::all().len(), 5);

        let overload = Scenario::named("overload").unwrap();
        assert_eq!(overload.workload, WorkloadProfile::High);
        assert_eq!(overload.workers, 2);
        assert_eq!(overload.buffer_size, 500);

        let bursty = Scenario::named("bursty_traffic").unwrap();
        assert_eq!(bursty.duration, Duration::from_secs(600));

        assert!(matches!(
            Scenario::named("meltdown"),
            Err(SimulationError::UnknownScenario { .. })
        ));
    }

    #[test]
    fn test_scenario_uses_configured_processing() {
        let settings = SimulationSettings {
            min_processing_ms: 2.0,
            max_processing_ms: 4.0,
            error_rate: 0.2,
            ..SimulationSettings::default()
        };
        let config = Scenario::named("memory_intensive").unwrap().simulator_config(&settings);

        assert_eq!(config.workers, 8);
        assert_eq!(config.buffer_size, 5000);
        assert_eq!(config.min_processing_ms, 2.0);
        assert_eq!(config.error_rate, 0.2);
    }

    #[test]
    fn test_event_generator_payloads() {
        let mut generator = EventGenerator::new(Some(42));
        for _ in 0..50 {
            let event = generator.next_event();
            assert!((1..=5).contains(&event.priority));
            assert!(event.payload.contains_key("source"));
            assert!(event.payload.contains_key("region"));

            let type_key = match event.event_type {
                EventType::UserAction => "user_id",
                EventType::SensorReading => "sensor_id",
                EventType::Transaction => "transaction_id",
                EventType::LogEntry => "level",
                EventType::MetricUpdate => "metric_name",
                EventType::Alert => "alert_id",
            };
            assert!(event.payload.contains_key(type_key), "missing {}", type_key);
        }
        assert_eq!(generator.sequence(), 50);
    }

    #[test]
    fn test_seeded_generators_agree() {
        let mut a = EventGenerator::new(Some(9));
        let mut b = EventGenerator::new(Some(9));
        for _ in 0..20 {
            let (ea, eb) = (a.next_event(), b.next_event());
            assert_eq!(ea.event_type, eb.event_type);
            assert_eq!(ea.priority, eb.priority);
        }
    }

    #[test]
    fn test_processor_success_and_failure() {
        let mut generator = EventGenerator::new(Some(1));

        let mut ok = DataProcessor::new(1.0, 2.0, 0.0, Some(1));
        let processed = ok.process(generator.next_event()).unwrap();
        assert!(processed.latency_ms >= 1.0);
        assert!(processed.event.payload.contains_key("processed_at"));
        assert!(processed.event.payload.contains_key("processing_time_ms"));

        let mut failing = DataProcessor::new(0.0, 0.0, 1.0, Some(1));
        let event = generator.next_event();
        let id = event.id;
        let failure = failing.process(event).unwrap_err();
        assert_eq!(failure.event_id, id);
        assert!(failure.to_string().contains("failed"));
    }

    #[test]
    fn test_invalid_simulator_config() {
        let mut config = quick_config(WorkloadProfile::Low);
        config.workers = 0;
        assert!(WorkloadSimulator::new(config, noop_callback()).is_err());

        let mut config = quick_config(WorkloadProfile::Low);
        config.error_rate = 2.0;
        assert!(matches!(
            config.validate(),
            Err(SimulationError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn test_stats_before_start() {
        let simulator = WorkloadSimulator::new(quick_config(WorkloadProfile::Low), noop_callback()).unwrap();
        let stats = simulator.stats();

        assert!(!stats.running);
        assert_eq!(stats.events_generated, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.error_rate, 0.0);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let simulator = WorkloadSimulator::new(quick_config(WorkloadProfile::Low), noop_callback()).unwrap();

        simulator.start().unwrap();
        simulator.start().unwrap();
        assert!(simulator.is_running());

        simulator.stop();
        simulator.stop();
        assert!(!simulator.is_running());
        assert_accounting(&simulator.stats());
    }

    #[test]
    fn test_end_to_end_low_workload() {
        let collector = MetricsCollector::with_capacity(10_000, 1_000);
        let callback: Arc<dyn MetricsCallback> = Arc::new(collector.clone());
        let simulator = WorkloadSimulator::new(quick_config(WorkloadProfile::Low), callback).unwrap();

        let stats = simulator.run_for(Duration::from_secs(5)).unwrap();

        assert!(!stats.running);
        assert!(stats.events_generated > 0);
        assert!(stats.events_processed + stats.events_failed <= stats.events_generated);
        assert_accounting(&stats);
        assert!(collector.current_latency_stats().is_some());
        assert!(collector.stats().total_throughput_events > 0);
    }

    #[test]
    fn test_backpressure_drops_events() {
        let config = SimulatorConfig {
            workload: WorkloadProfile::High,
            workers: 1,
            buffer_size: 10,
            min_processing_ms: 20.0,
            max_processing_ms: 30.0,
            error_rate: 0.0,
            enqueue_timeout: Duration::from_millis(1),
            seed: Some(3),
            ..SimulatorConfig::default()
        };
        let accepted = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&accepted);
        let callback: Arc<dyn MetricsCallback> = Arc::new(move |kind: &str, _: f64, _: &str| {
            if kind == KIND_THROUGHPUT_EVENT {
                counter.fetch_add(1, AtomicOrdering::Relaxed);
            }
        });
        let simulator = WorkloadSimulator::new(config, callback).unwrap();

        let stats = simulator.run_for(Duration::from_secs(1)).unwrap();

        assert!(stats.queue_high_water_mark <= 10);
        assert!(stats.queue_high_water_mark > 0);
        assert!(stats.events_dropped > 0);
        assert_eq!(stats.events_failed, 0);
        assert_accounting(&stats);
        assert_eq!(
            accepted.load(AtomicOrdering::Relaxed),
            stats.events_generated - stats.events_dropped
        );
        let expected_rate = stats.events_processed as f64 / stats.events_generated as f64 * 100.0;
        assert!((stats.success_rate - expected_rate).abs() < 1e-9);
        assert!(stats.success_rate < 100.0);
    }

    #[test]
    fn test_shutdown_token_ends_run() {
        let token = CancellationToken::new();
        let simulator = WorkloadSimulator::new(quick_config(WorkloadProfile::Medium), noop_callback())
            .unwrap()
            .with_shutdown(token.clone());

        simulator.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        token.cancel();

        let started = Instant::now();
        let stats = simulator.run_for(Duration::from_secs(30)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_accounting(&stats);
    }
}
