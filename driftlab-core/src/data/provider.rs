//! Bar and quote source traits plus the data error class.
//!
//! Sources are untrusted: whatever frame a [`BarSource`] returns is
//! re-validated for the required columns before anything reads it. The cache
//! layer sits above these traits; sources know nothing about it.

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::Granularity;
use crate::domain::{Instrument, QuotePair};

/// Columns every fetched frame must carry.
pub const REQUIRED_COLUMNS: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

/// Structured error types for data operations.
#[derive(Debug, Error)]
pub enum DataError {
    /// The source failed or returned nothing for the whole range. Fatal for
    /// this key only.
    #[error("data unavailable for {key}: {reason}")]
    DataUnavailable { key: String, reason: String },

    /// The source returned a frame without a required column. This is a
    /// source configuration problem, not a transient one.
    #[error("source '{source_name}' returned no '{column}' column")]
    MissingColumn { source_name: String, column: String },

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("parquet I/O error: {0}")]
    Parquet(String),
}

impl DataError {
    pub fn unavailable(key: impl Into<String>, reason: impl Into<String>) -> Self {
        DataError::DataUnavailable {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Best bid/ask/last from a live quote collaborator. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub bid_time: Option<DateTime<Utc>>,
    pub ask_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
}

impl QuoteSnapshot {
    /// Bid/ask midpoint, when both sides are present and positive.
    pub fn midpoint(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 && bid.is_finite() && ask.is_finite() => {
                Some((bid + ask) / 2.0)
            }
            _ => None,
        }
    }
}

/// Raw bar fetch collaborator.
///
/// Returns a frame with (at least) `timestamp`, `open`, `high`, `low`,
/// `close`, `volume`. `timestamp` may be Int64 epoch milliseconds, a Datetime,
/// or a Date column. Rows need not be sorted, aligned, or unique.
pub trait BarSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch raw bars for a pair over an inclusive date range.
    fn fetch(
        &self,
        pair: &QuotePair,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DataFrame, DataError>;
}

/// Live quote collaborator, used only by the resolver's fallback tier.
pub trait QuoteSource: Send + Sync {
    fn get_quote(&self, instrument: &Instrument) -> Option<QuoteSnapshot>;
}

/// Check a fetched frame for every required column.
pub fn validate_columns(df: &DataFrame, source_name: &str) -> Result<(), DataError> {
    for column in REQUIRED_COLUMNS {
        if df.column(column).is_err() {
            return Err(DataError::MissingColumn {
                source_name: source_name.to_string(),
                column: column.to_string(),
            });
        }
    }
    Ok(())
}
