//! Bar — one sampled OHLCV record on the calendar grid.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Timestamps are UTC instants; the owning [`Series`] carries the timezone
/// the grid was built in.
///
/// [`Series`]: crate::data::Series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Zero volume: the row was inserted by reindexing, not printed by the
    /// provider.
    pub fn is_synthetic(&self) -> bool {
        self.volume <= 0.0
    }

    /// `[timestamp, timestamp + step)` holds `at`.
    pub fn covers(&self, at: DateTime<Utc>, step: Duration) -> bool {
        self.timestamp <= at && at < self.timestamp + step
    }

    /// Name of the first non-finite price field.
    pub fn non_finite_field(&self) -> Option<&'static str> {
        [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ]
        .into_iter()
        .find(|(_, v)| !v.is_finite())
        .map(|(name, _)| name)
    }
}
