//! Canonical cache keys.
//!
//! A key is a readable, deterministic, filesystem-safe string built from
//! every field that changes what a query returns. It is used both as the
//! in-memory map key and as the on-disk file stem.

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::calendar::{DateRange, Granularity, Market};
use crate::config::DataSettings;
use crate::domain::QuotePair;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to build (and name) one series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarRequest {
    pub pair: QuotePair,
    pub market: Market,
    pub granularity: Granularity,
    pub timezone: Tz,
    pub adjusted: bool,
    pub range: DateRange,
}

impl BarRequest {
    /// A request shaped by the data settings. The range is widened backwards
    /// by the configured warm-up sessions.
    pub fn from_settings(
        pair: QuotePair,
        granularity: Granularity,
        range: DateRange,
        settings: &DataSettings,
    ) -> Self {
        let calendar = settings.calendar();
        let start = calendar.shift_sessions_back(range.start, settings.warmup_sessions);
        Self {
            pair,
            market: settings.market,
            granularity,
            timezone: settings.timezone,
            adjusted: settings.auto_adjust,
            range: DateRange::new(start, range.end),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey(
            [
                self.pair.base.cache_token(),
                self.pair.quote.cache_token(),
                self.market.key_token().to_string(),
                self.granularity.as_str().to_string(),
                tz_token(self.timezone),
                if self.adjusted { "adj" } else { "raw" }.to_string(),
                date_token(self.range.start),
                date_token(self.range.end),
            ]
            .join("_"),
        )
    }
}

fn tz_token(tz: Tz) -> String {
    tz.name().replace(['/', ' '], "-")
}

fn date_token(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
