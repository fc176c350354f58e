//! Synthetic bar source for tests and offline development.
//!
//! Produces a seeded random walk from a starting price of 100.0 on the
//! market's sessions. The seed comes from the pair, so the same pair always
//! yields the same bars.

use chrono::{Duration, NaiveDate};
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::provider::{BarSource, DataError};
use crate::calendar::{DateRange, Granularity, Market, TradingCalendar};
use crate::domain::QuotePair;

#[derive(Debug, Clone)]
pub struct SyntheticSource {
    calendar: TradingCalendar,
    start_price: f64,
    /// Drop every n-th row to exercise gap filling.
    gap_every: Option<usize>,
}

impl SyntheticSource {
    pub fn new(market: Market) -> Self {
        Self {
            calendar: TradingCalendar::new(market),
            start_price: 100.0,
            gap_every: None,
        }
    }

    pub fn with_start_price(mut self, price: f64) -> Self {
        self.start_price = price;
        self
    }

    pub fn with_gaps(mut self, every: usize) -> Self {
        self.gap_every = (every > 1).then_some(every);
        self
    }
}

impl BarSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn fetch(
        &self,
        pair: &QuotePair,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DataFrame, DataError> {
        let seed_input = format!("{}|{}", pair.base.cache_token(), pair.quote.cache_token());
        let seed: [u8; 32] = *blake3::hash(seed_input.as_bytes()).as_bytes();
        let mut rng = StdRng::from_seed(seed);

        // Daily rows are stamped date-only (00:00 UTC), the way most
        // providers deliver them; minute rows at the exchange minute.
        let sessions = self.calendar.sessions(&DateRange::new(start, end));
        let mut stamps = Vec::new();
        for session in &sessions {
            match granularity {
                Granularity::Day => {
                    stamps.push(session.date.and_hms_opt(0, 0, 0).map(|t| t.and_utc()));
                }
                Granularity::Minute => {
                    let mut t = session.open;
                    while t < session.close {
                        stamps.push(Some(t));
                        t += Duration::minutes(1);
                    }
                }
            }
        }

        let max_move = match granularity {
            Granularity::Day => 0.03,
            Granularity::Minute => 0.002,
        };

        let mut timestamps = Vec::with_capacity(stamps.len());
        let mut opens = Vec::with_capacity(stamps.len());
        let mut highs = Vec::with_capacity(stamps.len());
        let mut lows = Vec::with_capacity(stamps.len());
        let mut closes = Vec::with_capacity(stamps.len());
        let mut volumes = Vec::with_capacity(stamps.len());
        let mut price = self.start_price;

        for (i, stamp) in stamps.into_iter().enumerate() {
            let Some(stamp) = stamp else { continue };
            let ret: f64 = rng.gen_range(-max_move..max_move);
            let open = price;
            let close = price * (1.0 + ret);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
            let volume = rng.gen_range(500_000.0..5_000_000.0_f64).round();
            price = close;

            if self.gap_every.is_some_and(|n| i % n == n - 1) {
                continue;
            }
            timestamps.push(stamp.timestamp_millis());
            opens.push(open);
            highs.push(high);
            lows.push(low);
            closes.push(close);
            volumes.push(volume);
        }

        DataFrame::new(vec![
            Column::new("timestamp".into(), timestamps),
            Column::new("open".into(), opens),
            Column::new("high".into(), highs),
            Column::new("low".into(), lows),
            Column::new("close".into(), closes),
            Column::new("volume".into(), volumes),
        ])
        .map_err(|e| DataError::Provider(format!("synthetic frame: {e}")))
    }
}
