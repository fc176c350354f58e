//! Price resolver: point-in-time and windowed queries over cached series,
//! plus the tiered fallback used when marking positions to market.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::calendar::{DateRange, Granularity, TradingCalendar};
use crate::config::DataSettings;
use crate::data::{BarRequest, BarSource, BarStore, CacheKey, DataError, QuoteSource, Series};
use crate::domain::{Bar, Instrument, InstrumentError, QuotePair};

#[derive(Debug, Error)]
pub enum PriceError {
    /// Not enough bars before the search point. Usually a warm-up problem.
    #[error("insufficient history: requested {requested} bars, {available} available")]
    InsufficientHistory { requested: usize, available: usize },

    /// The search point lies outside the series.
    #[error("{at} is outside the series range [{first:?}, {last:?}]")]
    OutOfRange {
        at: DateTime<Utc>,
        first: Option<DateTime<Utc>>,
        last: Option<DateTime<Utc>>,
    },

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("invalid instrument: {0}")]
    Instrument(#[from] InstrumentError),
}

/// Which fallback tier produced a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    /// Open of the traded bar containing the query time.
    Snapshot,
    /// Close of the latest traded bar at or before the query time.
    LastTrade,
    /// Bid/ask midpoint from the quote collaborator.
    QuoteMid,
    /// The last price this instrument resolved to, carried forward.
    ForwardFill,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub price: f64,
    pub source: PriceSource,
}

/// Last successfully resolved price for an instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Answers "what is the price at simulated time T".
///
/// Series are built lazily, one per (pair, granularity), over the session's
/// date range widened by the warm-up.
pub struct PriceResolver {
    settings: DataSettings,
    calendar: TradingCalendar,
    range: DateRange,
    store: BarStore,
    source: Arc<dyn BarSource>,
    quotes: Option<Arc<dyn QuoteSource>>,
    anchors: RwLock<HashMap<Instrument, Anchor>>,
}

impl PriceResolver {
    pub fn new(settings: DataSettings, range: DateRange, source: Arc<dyn BarSource>) -> Self {
        let store = BarStore::from_settings(&settings);
        Self {
            calendar: settings.calendar(),
            settings,
            range,
            store,
            source,
            quotes: None,
            anchors: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_quote_source(mut self, quotes: Arc<dyn QuoteSource>) -> Self {
        self.quotes = Some(quotes);
        self
    }

    /// Replace the store built from settings (tests point it at a temp dir).
    pub fn with_store(mut self, store: BarStore) -> Self {
        self.store = store;
        self
    }

    pub fn settings(&self) -> &DataSettings {
        &self.settings
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    pub fn store(&self) -> &BarStore {
        &self.store
    }

    pub fn source(&self) -> &dyn BarSource {
        self.source.as_ref()
    }

    /// The request a (pair, granularity) maps to.
    pub fn request_for(&self, pair: QuotePair, granularity: Granularity) -> BarRequest {
        BarRequest::from_settings(pair, granularity, self.range, &self.settings)
    }

    /// Load or build the series for a pair. Both legs are validated first.
    pub fn series(
        &self,
        instrument: &Instrument,
        quote: &Instrument,
        granularity: Granularity,
    ) -> Result<Arc<Series>, PriceError> {
        let pair = QuotePair::new(instrument.clone(), quote.clone())?;
        let request = self.request_for(pair, granularity);
        Ok(self
            .store
            .fetch_and_cache(&request, self.source.as_ref(), &self.calendar)?)
    }

    /// Open of the bar containing `at`, at the configured granularity.
    ///
    /// The open, not the close: the simulated broker fills at the bar open,
    /// so the "current price" has to agree with the fill price.
    pub fn last_price(
        &self,
        instrument: &Instrument,
        quote: &Instrument,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>, PriceError> {
        let series = self.series(instrument, quote, self.settings.granularity)?;
        Ok(series.bar_containing(at).map(|b| b.open))
    }

    /// Exactly `length` consecutive bars ending at the greatest timestamp
    /// `<= at - timeshift`.
    ///
    /// With `exclude_incomplete`, the bar whose interval contains the search
    /// time is still forming and the window ends one bar earlier. That covers
    /// a bar stamped exactly at the search time as well as a daily bar
    /// stamped at local midnight when searched from the session open.
    #[allow(clippy::too_many_arguments)]
    pub fn window(
        &self,
        instrument: &Instrument,
        quote: &Instrument,
        length: usize,
        granularity: Granularity,
        at: DateTime<Utc>,
        timeshift: Duration,
        exclude_incomplete: bool,
    ) -> Result<Vec<Bar>, PriceError> {
        let series = self.series(instrument, quote, granularity)?;
        window_from_series(&series, length, at - timeshift, exclude_incomplete)
    }

    /// Tiered price lookup for valuation. Never fails: data problems are
    /// logged and the next tier is tried. `None` means the caller should
    /// exclude the instrument.
    pub fn resolve_with_fallback(
        &self,
        instrument: &Instrument,
        quote: &Instrument,
        at: DateTime<Utc>,
    ) -> Option<Resolution> {
        match self.series(instrument, quote, self.settings.granularity) {
            Ok(series) => {
                if let Some(bar) = series.bar_containing(at).filter(|b| !b.is_synthetic()) {
                    return Some(Resolution {
                        price: bar.open,
                        source: PriceSource::Snapshot,
                    });
                }
                if let Some(bar) = series.last_traded_at_or_before(at) {
                    return Some(Resolution {
                        price: bar.close,
                        source: PriceSource::LastTrade,
                    });
                }
            }
            Err(e) => {
                warn!(symbol = %instrument, error = %e, "no historical series, trying fallbacks");
            }
        }

        if self.settings.allow_quote_fallback {
            if let Some(mid) = self
                .quotes
                .as_ref()
                .and_then(|q| q.get_quote(instrument))
                .and_then(|snapshot| snapshot.midpoint())
            {
                debug!(symbol = %instrument, price = mid, "priced from quote midpoint");
                return Some(Resolution {
                    price: mid,
                    source: PriceSource::QuoteMid,
                });
            }
        }

        if let Some(anchor) = self.anchor(instrument) {
            warn!(
                symbol = %instrument,
                price = anchor.price,
                anchored_at = %anchor.at,
                "forward-filling last known price"
            );
            return Some(Resolution {
                price: anchor.price,
                source: PriceSource::ForwardFill,
            });
        }

        warn!(symbol = %instrument, at = %at, "no price available, excluding from valuation");
        None
    }

    /// Record `price` as the instrument's forward-fill anchor.
    pub fn record_anchor(&self, instrument: &Instrument, price: f64, at: DateTime<Utc>) {
        if !price.is_finite() {
            return;
        }
        self.anchors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instrument.clone(), Anchor { price, at });
    }

    pub fn anchor(&self, instrument: &Instrument) -> Option<Anchor> {
        self.anchors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instrument)
            .copied()
    }

    /// Warm several series sequentially. Failures are reported per key and
    /// do not stop the rest.
    pub fn prefetch(
        &self,
        instruments: &[Instrument],
        quote: &Instrument,
        granularity: Granularity,
    ) -> Vec<(CacheKey, Result<usize, PriceError>)> {
        instruments
            .iter()
            .filter_map(|instrument| {
                let pair = QuotePair::new(instrument.clone(), quote.clone()).ok()?;
                let request = self.request_for(pair, granularity);
                let key = request.cache_key();
                let result = self
                    .store
                    .fetch_and_cache(&request, self.source.as_ref(), &self.calendar)
                    .map(|s| s.len())
                    .map_err(PriceError::from);
                Some((key, result))
            })
            .collect()
    }
}

/// Window lookup over a single series.
pub fn window_from_series(
    series: &Series,
    length: usize,
    search: DateTime<Utc>,
    exclude_incomplete: bool,
) -> Result<Vec<Bar>, PriceError> {
    let out_of_range = || PriceError::OutOfRange {
        at: search,
        first: series.first_timestamp(),
        last: series.last_timestamp(),
    };

    let last = series.last_timestamp().ok_or_else(out_of_range)?;
    if search >= last + series.step() {
        return Err(out_of_range());
    }
    let idx = series.index_at_or_before(search).ok_or_else(out_of_range)?;
    let available = if exclude_incomplete && series.bars()[idx].covers(search, series.step()) {
        idx
    } else {
        idx + 1
    };

    if available < length {
        return Err(PriceError::InsufficientHistory {
            requested: length,
            available,
        });
    }
    Ok(series.bars()[available - length..available].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Market;
    use crate::data::{QuoteSnapshot, SyntheticSource};
    use chrono::{NaiveDate, TimeZone};
    use polars::prelude::DataFrame;

    fn jan(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn resolver(dir: &std::path::Path) -> PriceResolver {
        let settings = DataSettings {
            cache_dir: dir.to_path_buf(),
            provider: "synthetic".into(),
            ..DataSettings::default()
        };
        PriceResolver::new(
            settings,
            DateRange::new(jan(2), jan(31)),
            Arc::new(SyntheticSource::new(Market::Nyse)),
        )
    }

    /// 10:00 New York on a January day.
    fn ny_morning(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 15, 0, 0).unwrap()
    }

    #[test]
    fn last_price_is_open_of_containing_bar() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();

        let series = r.series(&spy, &usd, Granularity::Day).unwrap();
        let bar = series.bar_containing(ny_morning(3)).unwrap().clone();
        let price = r.last_price(&spy, &usd, ny_morning(3)).unwrap().unwrap();
        assert_eq!(price, bar.open);
        assert_ne!(price, bar.close);
    }

    #[test]
    fn last_price_outside_series_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let before = Utc.with_ymd_and_hms(2023, 12, 1, 15, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap();
        assert_eq!(r.last_price(&spy, &usd, before).unwrap(), None);
        assert_eq!(r.last_price(&spy, &usd, after).unwrap(), None);
    }

    #[test]
    fn invalid_leg_fails_before_query() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let bad = Instrument::equity("  ");
        let err = r.last_price(&bad, &Instrument::usd(), ny_morning(3)).unwrap_err();
        assert!(matches!(err, PriceError::Instrument(_)));
    }

    #[test]
    fn window_lengths_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let at = ny_morning(5); // Friday, 4th session of the range

        let bars = r
            .window(&spy, &usd, 3, Granularity::Day, at, Duration::zero(), false)
            .unwrap();
        assert_eq!(bars.len(), 3);
        assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(bars[2].timestamp <= at);

        let err = r
            .window(&spy, &usd, 10, Granularity::Day, at, Duration::zero(), false)
            .unwrap_err();
        assert!(matches!(
            err,
            PriceError::InsufficientHistory { requested: 10, available: 4 }
        ));

        let early = Utc.with_ymd_and_hms(2023, 12, 29, 15, 0, 0).unwrap();
        let err = r
            .window(&spy, &usd, 1, Granularity::Day, early, Duration::zero(), false)
            .unwrap_err();
        assert!(matches!(err, PriceError::OutOfRange { .. }));

        let late = Utc.with_ymd_and_hms(2024, 2, 15, 15, 0, 0).unwrap();
        let err = r
            .window(&spy, &usd, 1, Granularity::Day, late, Duration::zero(), false)
            .unwrap_err();
        assert!(matches!(err, PriceError::OutOfRange { .. }));
    }

    #[test]
    fn exclude_incomplete_steps_back_on_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let series = r.series(&spy, &usd, Granularity::Day).unwrap();
        let third = series.bars()[2].timestamp;

        let with = r
            .window(&spy, &usd, 1, Granularity::Day, third, Duration::zero(), true)
            .unwrap();
        assert_eq!(with[0].timestamp, series.bars()[1].timestamp);

        let without = r
            .window(&spy, &usd, 1, Granularity::Day, third, Duration::zero(), false)
            .unwrap();
        assert_eq!(without[0].timestamp, third);

        // Timeshift moves the search point back a full day.
        let shifted = r
            .window(&spy, &usd, 1, Granularity::Day, third, Duration::days(1), false)
            .unwrap();
        assert_eq!(shifted[0].timestamp, series.bars()[1].timestamp);

        // Stepping back off the first bar is a warm-up shortfall, not the
        // end of the data.
        let first = series.bars()[0].timestamp;
        let err = r
            .window(&spy, &usd, 1, Granularity::Day, first, Duration::zero(), true)
            .unwrap_err();
        assert!(matches!(
            err,
            PriceError::InsufficientHistory { requested: 1, available: 0 }
        ));
    }

    #[test]
    fn exclude_incomplete_hides_the_daily_bar_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let series = r.series(&spy, &usd, Granularity::Day).unwrap();

        // Wednesday the 3rd at the open: the bar stamped at local midnight
        // covers this instant, so only Tuesday's bar is complete.
        let open = Utc.with_ymd_and_hms(2024, 1, 3, 14, 30, 0).unwrap();
        let today = series.bar_containing(open).unwrap().timestamp;
        let bars = r
            .window(&spy, &usd, 1, Granularity::Day, open, Duration::zero(), true)
            .unwrap();
        assert!(bars[0].timestamp < today);
        assert_eq!(bars[0].timestamp, series.bars()[0].timestamp);
        assert!(!bars[0].covers(open, series.step()));

        let err = r
            .window(&spy, &usd, 2, Granularity::Day, open, Duration::zero(), true)
            .unwrap_err();
        assert!(matches!(
            err,
            PriceError::InsufficientHistory { requested: 2, available: 1 }
        ));

        // Saturday: Friday's bar has finished and is included.
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 15, 0, 0).unwrap();
        let bars = r
            .window(&spy, &usd, 1, Granularity::Day, saturday, Duration::zero(), true)
            .unwrap();
        assert_eq!(bars[0].timestamp, series.bar_containing(ny_morning(5)).unwrap().timestamp);
    }

    struct FailingSource;

    impl BarSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        fn fetch(
            &self,
            _pair: &QuotePair,
            _granularity: Granularity,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<DataFrame, DataError> {
            Err(DataError::Provider("connection refused".into()))
        }
    }

    struct FixedQuote(f64, f64);

    impl QuoteSource for FixedQuote {
        fn get_quote(&self, _instrument: &Instrument) -> Option<QuoteSnapshot> {
            Some(QuoteSnapshot {
                bid: Some(self.0),
                ask: Some(self.1),
                last: None,
                bid_time: None,
                ask_time: None,
                last_time: None,
            })
        }
    }

    fn failing_resolver(dir: &std::path::Path, allow_quotes: bool) -> PriceResolver {
        let settings = DataSettings {
            cache_dir: dir.to_path_buf(),
            allow_quote_fallback: allow_quotes,
            ..DataSettings::default()
        };
        PriceResolver::new(settings, DateRange::new(jan(2), jan(31)), Arc::new(FailingSource))
            .with_quote_source(Arc::new(FixedQuote(4.0, 6.0)))
    }

    #[test]
    fn fallback_snapshot_tier() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let spy = Instrument::equity("SPY");
        let res = r
            .resolve_with_fallback(&spy, &Instrument::usd(), ny_morning(3))
            .unwrap();
        assert_eq!(res.source, PriceSource::Snapshot);
    }

    #[test]
    fn fallback_last_trade_after_series_end() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let series = r.series(&spy, &usd, Granularity::Day).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 2, 5, 15, 0, 0).unwrap();
        let res = r.resolve_with_fallback(&spy, &usd, late).unwrap();
        assert_eq!(res.source, PriceSource::LastTrade);
        assert_eq!(res.price, series.bars().last().unwrap().close);
    }

    #[test]
    fn fallback_quote_only_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Instrument::option("SPY", 500.0, jan(31), crate::domain::OptionRight::Call);

        let allowed = failing_resolver(dir.path(), true);
        let res = allowed
            .resolve_with_fallback(&opt, &Instrument::usd(), ny_morning(3))
            .unwrap();
        assert_eq!(res, Resolution { price: 5.0, source: PriceSource::QuoteMid });

        let denied = failing_resolver(dir.path(), false);
        assert!(denied
            .resolve_with_fallback(&opt, &Instrument::usd(), ny_morning(3))
            .is_none());
    }

    #[test]
    fn fallback_forward_fills_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let r = failing_resolver(dir.path(), false);
        let opt = Instrument::option("SPY", 500.0, jan(31), crate::domain::OptionRight::Put);
        r.record_anchor(&opt, 7.25, ny_morning(2));

        let res = r
            .resolve_with_fallback(&opt, &Instrument::usd(), ny_morning(3))
            .unwrap();
        assert_eq!(res, Resolution { price: 7.25, source: PriceSource::ForwardFill });
        assert_eq!(r.anchor(&opt).unwrap().at, ny_morning(2));
    }

    #[test]
    fn prefetch_reports_each_key() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let results = r.prefetch(
            &[Instrument::equity("SPY"), Instrument::equity("QQQ")],
            &Instrument::usd(),
            Granularity::Day,
        );
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(21))));
        assert_ne!(results[0].0, results[1].0);
    }
}
