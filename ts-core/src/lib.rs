use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Milliseconds since Unix epoch.
pub type Timestamp = i64;

pub const MINUTE_MS: i64 = 60_000;

/// Format of the end cursor sent to the evaluation service.
pub const END_CURSOR_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Chart interval. Names match the exchange kline intervals the service expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeFrame {
    Minutes(u32),
    Hours(u32),
    Days(u32),
    Weeks(u32),
    Months(u32),
}

impl TimeFrame {
    /// Human-readable name (used in requests and persisted state).
    pub fn name(&self) -> String {
        match *self {
            TimeFrame::Minutes(m) => format!("{m}m"),
            TimeFrame::Hours(h) => format!("{h}h"),
            TimeFrame::Days(d) => format!("{d}d"),
            TimeFrame::Weeks(w) => format!("{w}w"),
            TimeFrame::Months(m) => format!("{m}M"),
        }
    }

    /// Parse e.g. "1m", "15m", "1h", "4h", "1d", "1w", "1M".
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() < 2 {
            return None;
        }
        let (count, unit) = s.split_at(s.len() - 1);
        let count: u32 = count.parse().ok().filter(|c| *c > 0)?;
        match unit {
            "m" => Some(TimeFrame::Minutes(count)),
            "h" => Some(TimeFrame::Hours(count)),
            "d" => Some(TimeFrame::Days(count)),
            "w" => Some(TimeFrame::Weeks(count)),
            "M" => Some(TimeFrame::Months(count)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimeFrameError(String);

impl fmt::Display for ParseTimeFrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid timeframe: {}", self.0)
    }
}

impl std::error::Error for ParseTimeFrameError {}

impl FromStr for TimeFrame {
    type Err = ParseTimeFrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeFrame::from_str(s).ok_or_else(|| ParseTimeFrameError(s.to_string()))
    }
}

impl TryFrom<String> for TimeFrame {
    type Error = ParseTimeFrameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeFrame> for String {
    fn from(tf: TimeFrame) -> Self {
        tf.name()
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

pub trait HasTimestamp {
    fn ts(&self) -> Timestamp;
}

/// One point of a computed result: a timestamp plus whatever named values the
/// computation emitted for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    #[serde(alias = "timestamp")]
    pub time: Timestamp,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl SeriesPoint {
    pub fn new(time: Timestamp) -> Self {
        Self {
            time,
            values: Map::new(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

impl HasTimestamp for SeriesPoint {
    fn ts(&self) -> Timestamp {
        self.time
    }
}

/// Series kept sorted by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSeries<T> {
    data: Vec<T>,
}

impl<T> Default for TimeSeries<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

impl<T: HasTimestamp> TimeSeries<T> {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Build from samples in any order. Equal timestamps keep their input order.
    pub fn from_unsorted(mut samples: Vec<T>) -> Self {
        samples.sort_by_key(|s| s.ts());
        Self { data: samples }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn first(&self) -> Option<&T> {
        self.data.first()
    }

    pub fn last(&self) -> Option<&T> {
        self.data.last()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

pub type Series = TimeSeries<SeriesPoint>;

// ---------- Market context ---------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarketContextError {
    #[error("no symbol selected")]
    MissingSymbol,
    #[error("no interval selected")]
    MissingInterval,
}

/// What the user is currently looking at: symbol, interval and the end of the
/// evaluation window. Every recompute is evaluated against this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    pub symbol: Option<String>,
    pub interval: Option<TimeFrame>,
    pub end: String,
}

impl Default for MarketContext {
    fn default() -> Self {
        Self {
            symbol: None,
            interval: None,
            end: default_end_cursor(),
        }
    }
}

impl MarketContext {
    pub fn new(symbol: impl Into<String>, interval: TimeFrame) -> Self {
        Self {
            symbol: Some(symbol.into()),
            interval: Some(interval),
            end: default_end_cursor(),
        }
    }

    pub fn with_end(mut self, end: impl Into<String>) -> Self {
        self.end = end.into();
        self
    }

    /// Both symbol and interval must be chosen before anything can be evaluated.
    pub fn require(&self) -> Result<ResolvedContext, MarketContextError> {
        let symbol = self
            .symbol
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(MarketContextError::MissingSymbol)?;
        let interval = self.interval.ok_or(MarketContextError::MissingInterval)?;
        Ok(ResolvedContext {
            symbol: symbol.to_string(),
            interval,
            end: self.end.clone(),
        })
    }
}

/// A market context with every field present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedContext {
    pub symbol: String,
    pub interval: TimeFrame,
    pub end: String,
}

/// Yesterday at the current wall-clock time, second precision.
pub fn default_end_cursor() -> String {
    let yesterday = Utc::now().naive_utc() - ChronoDuration::days(1);
    format_end_cursor(yesterday)
}

pub fn format_end_cursor(at: NaiveDateTime) -> String {
    at.format(END_CURSOR_FORMAT).to_string()
}
