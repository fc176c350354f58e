//! Trading calendar — session boundaries and the valid sampling grid.
//!
//! Everything here is pure: the session table is derived from rule sets,
//! so the same (market, range, granularity, timezone) tuple always yields
//! the same timestamps.

pub mod holidays;

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;

/// Market identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    /// US equities, regular hours 09:30–16:00 America/New_York.
    Nyse,
    /// Around the clock, every UTC day.
    Crypto,
    /// Monday–Friday, full UTC days.
    Forex,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Nyse => "NYSE",
            Market::Crypto => "24/7",
            Market::Forex => "FX",
        }
    }

    /// Token used inside cache keys.
    pub fn key_token(&self) -> &'static str {
        match self {
            Market::Nyse => "NYSE",
            Market::Crypto => "CRYPTO",
            Market::Forex => "FOREX",
        }
    }
}

impl FromStr for Market {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NYSE" | "NASDAQ" | "XNYS" | "US_EQUITY" => Ok(Market::Nyse),
            "24/7" | "CRYPTO" => Ok(Market::Crypto),
            "FX" | "FOREX" => Ok(Market::Forex),
            _ => Err(ConfigError::UnknownMarket(s.to_string())),
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sampling granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Minute,
}

impl Granularity {
    /// Width of one bar.
    pub fn step(&self) -> Duration {
        match self {
            Granularity::Day => Duration::days(1),
            Granularity::Minute => Duration::minutes(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Minute => "minute",
        }
    }
}

impl FromStr for Granularity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" | "1d" => Ok(Granularity::Day),
            "minute" | "1m" => Ok(Granularity::Minute),
            _ => Err(ConfigError::UnknownGranularity(s.to_string())),
        }
    }
}

/// Inclusive calendar-date range. A range whose end precedes its start is
/// zero-length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start
            .iter_days()
            .take_while(move |d| *d <= self.end)
    }
}

/// One trading session. `open` inclusive, `close` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub date: NaiveDate,
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
}

impl Session {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.open <= ts && ts < self.close
    }
}

/// Rule-based trading calendar for one market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingCalendar {
    market: Market,
}

impl TradingCalendar {
    pub fn new(market: Market) -> Self {
        Self { market }
    }

    pub fn market(&self) -> Market {
        self.market
    }

    /// The exchange's own timezone.
    pub fn exchange_tz(&self) -> Tz {
        match self.market {
            Market::Nyse => chrono_tz::America::New_York,
            Market::Crypto | Market::Forex => chrono_tz::UTC,
        }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
        match self.market {
            Market::Nyse => !weekend && !holidays::is_nyse_holiday(date),
            Market::Crypto => true,
            Market::Forex => !weekend,
        }
    }

    /// Session boundaries for `date`, or `None` on a closed day.
    pub fn session_on(&self, date: NaiveDate) -> Option<Session> {
        if !self.is_trading_day(date) {
            return None;
        }
        match self.market {
            Market::Nyse => {
                let tz = self.exchange_tz();
                let close_time = if holidays::is_nyse_early_close(date) {
                    NaiveTime::from_hms_opt(13, 0, 0)?
                } else {
                    NaiveTime::from_hms_opt(16, 0, 0)?
                };
                let open = local_instant(tz, date.and_time(NaiveTime::from_hms_opt(9, 30, 0)?))?;
                let close = local_instant(tz, date.and_time(close_time))?;
                Some(Session { date, open, close })
            }
            Market::Crypto | Market::Forex => {
                let open = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
                Some(Session {
                    date,
                    open,
                    close: open + Duration::days(1),
                })
            }
        }
    }

    /// Ordered sessions within an inclusive date range.
    pub fn sessions(&self, range: &DateRange) -> Vec<Session> {
        if range.is_empty() {
            return Vec::new();
        }
        range.days().filter_map(|d| self.session_on(d)).collect()
    }

    /// The session whose `[open, close)` contains `ts`.
    pub fn session_containing(&self, ts: DateTime<Utc>) -> Option<Session> {
        let local_date = ts.with_timezone(&self.exchange_tz()).date_naive();
        self.session_on(local_date).filter(|s| s.contains(ts))
    }

    /// Every valid sample timestamp in the range.
    ///
    /// Daily: one timestamp per session, at local midnight of the session date
    /// in `tz`. Minute: every minute from open (inclusive) to close (exclusive).
    pub fn sample_timestamps(
        &self,
        range: &DateRange,
        granularity: Granularity,
        tz: Tz,
    ) -> Vec<DateTime<Utc>> {
        let sessions = self.sessions(range);
        match granularity {
            Granularity::Day => sessions
                .iter()
                .filter_map(|s| local_midnight(s.date, tz))
                .collect(),
            Granularity::Minute => {
                let step = granularity.step();
                let mut out = Vec::new();
                for s in &sessions {
                    let mut t = s.open;
                    while t < s.close {
                        out.push(t);
                        t += step;
                    }
                }
                out
            }
        }
    }

    /// Snap a provider timestamp onto the sampling grid.
    ///
    /// Daily stamps at exactly 00:00 UTC are treated as date-only values
    /// (most providers emit daily bars that way); other daily stamps take
    /// their local date in `tz`. Minute stamps floor to the minute.
    pub fn normalize(&self, ts: DateTime<Utc>, granularity: Granularity, tz: Tz) -> Option<DateTime<Utc>> {
        match granularity {
            Granularity::Day => {
                let date = if ts.time() == NaiveTime::MIN {
                    ts.date_naive()
                } else {
                    ts.with_timezone(&tz).date_naive()
                };
                local_midnight(date, tz)
            }
            Granularity::Minute => {
                let secs = ts.timestamp();
                DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(60), 0)
            }
        }
    }

    /// The date `n` sessions before `date` (used to extend a request by a
    /// warm-up period). Returns `date` itself for `n == 0`.
    pub fn shift_sessions_back(&self, date: NaiveDate, n: usize) -> NaiveDate {
        let mut current = date;
        let mut found = 0;
        // Bounded walk: no market closes for more than a week at a time.
        let max_days = n.saturating_mul(7).saturating_add(14);
        let mut walked = 0;
        while found < n && walked < max_days {
            current -= Duration::days(1);
            walked += 1;
            if self.is_trading_day(current) {
                found += 1;
            }
        }
        current
    }
}

/// Local midnight of `date` in `tz`, falling forward past DST gaps.
pub fn local_midnight(date: NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
    local_instant(tz, date.and_time(NaiveTime::MIN))
        .or_else(|| local_instant(tz, date.and_time(NaiveTime::from_hms_opt(1, 0, 0)?)))
}

fn local_instant(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}
