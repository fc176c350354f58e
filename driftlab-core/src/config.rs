//! Validated engine configuration and the configuration error class.
//!
//! Everything in here is checked when the config is built, never when it is
//! used, so a bad setting fails before any simulation work starts.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::calendar::{Granularity, Market, TradingCalendar};
use crate::domain::InstrumentError;

/// Fatal configuration problems. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("drift threshold {threshold} must be strictly greater than acceptable slippage {slippage}")]
    ThresholdNotAboveSlippage { threshold: f64, slippage: f64 },

    #[error("drift threshold {0} must be strictly less than 1.0")]
    ThresholdTooLarge(f64),

    #[error("{field} must be a finite non-negative number, got {value}")]
    NegativeValue { field: &'static str, value: f64 },

    #[error("missing required date: {0}")]
    MissingDate(&'static str),

    #[error("date range is inverted: start {start} is after end {end}")]
    InvertedRange { start: String, end: String },

    #[error("timezone mismatch: {field} carries offset {found} but {tz} is at {expected} on that date")]
    TimezoneMismatch {
        field: &'static str,
        tz: String,
        found: String,
        expected: String,
    },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("unknown market '{0}'")]
    UnknownMarket(String),

    #[error("unknown granularity '{0}' (expected \"day\" or \"minute\")")]
    UnknownGranularity(String),

    #[error("unknown drift mode '{0}' (expected \"absolute\" or \"relative\")")]
    UnknownDriftMode(String),

    #[error("invalid instrument: {0}")]
    Instrument(#[from] InstrumentError),

    #[error("invalid target weight for {symbol}: {weight}")]
    InvalidWeight { symbol: String, weight: f64 },

    #[error("config parse error: {0}")]
    Parse(String),
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.parse::<Tz>()
        .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))
}

/// Settings for the data layer: which grid to build, where to persist it,
/// and which fallbacks the resolver may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    pub market: Market,
    pub granularity: Granularity,
    pub timezone: Tz,
    /// Extra sessions fetched before the requested start.
    pub warmup_sessions: usize,
    /// Provider returns split/dividend adjusted prices.
    pub auto_adjust: bool,
    pub cache_dir: PathBuf,
    /// Namespace directory under `cache_dir`.
    pub provider: String,
    /// Entries older than this are refetched.
    pub max_age_secs: Option<u64>,
    /// Ignore both cache layers and refetch.
    pub force_refresh: bool,
    /// Whether the quote collaborator's bid/ask midpoint may price a position.
    pub allow_quote_fallback: bool,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            market: Market::Nyse,
            granularity: Granularity::Day,
            timezone: chrono_tz::America::New_York,
            warmup_sessions: 0,
            auto_adjust: true,
            cache_dir: PathBuf::from("data/cache"),
            provider: "default".to_string(),
            max_age_secs: None,
            force_refresh: false,
            allow_quote_fallback: false,
        }
    }
}

impl DataSettings {
    pub fn calendar(&self) -> TradingCalendar {
        TradingCalendar::new(self.market)
    }

    pub fn max_age(&self) -> Option<chrono::Duration> {
        self.max_age_secs
            .and_then(|s| i64::try_from(s).ok())
            .map(chrono::Duration::seconds)
    }

    /// Provider names become directory names.
    pub fn provider_dir(&self) -> String {
        self.provider
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect()
    }
}

pub(crate) fn non_negative(field: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::NegativeValue { field, value })
    }
}
