//! Series — the ordered, gap-free bars for one cache key.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use polars::prelude::*;

use super::cache_key::CacheKey;
use super::provider::DataError;
use crate::calendar::Granularity;
use crate::domain::Bar;

/// Ordered bars on the calendar grid, plus the timezone the grid was built in.
///
/// Invariant: timestamps strictly increase.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub key: CacheKey,
    pub timezone: Tz,
    pub granularity: Granularity,
    bars: Vec<Bar>,
}

impl Series {
    /// Build a series, rejecting out-of-order or duplicate timestamps.
    pub fn new(
        key: CacheKey,
        timezone: Tz,
        granularity: Granularity,
        bars: Vec<Bar>,
    ) -> Result<Self, DataError> {
        if let Some(w) = bars.windows(2).find(|w| w[0].timestamp >= w[1].timestamp) {
            return Err(DataError::Validation(format!(
                "{key}: timestamps not strictly increasing at {}",
                w[1].timestamp
            )));
        }
        if let Some((bar, field)) = bars.iter().find_map(|b| b.non_finite_field().map(|f| (b, f))) {
            return Err(DataError::Validation(format!(
                "{key}: {field} is not finite at {}",
                bar.timestamp
            )));
        }
        Ok(Self {
            key,
            timezone,
            granularity,
            bars,
        })
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Width of one bar; decides containment.
    pub fn step(&self) -> Duration {
        self.granularity.step()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.first().map(|b| b.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.timestamp)
    }

    /// Index of the bar with the greatest timestamp `<= at`.
    pub fn index_at_or_before(&self, at: DateTime<Utc>) -> Option<usize> {
        let after = self.bars.partition_point(|b| b.timestamp <= at);
        after.checked_sub(1)
    }

    /// The bar whose `[timestamp, timestamp + step)` holds `at`.
    pub fn bar_containing(&self, at: DateTime<Utc>) -> Option<&Bar> {
        let bar = &self.bars[self.index_at_or_before(at)?];
        bar.covers(at, self.step()).then_some(bar)
    }

    /// Latest bar at or before `at` that carried real traded volume.
    pub fn last_traded_at_or_before(&self, at: DateTime<Utc>) -> Option<&Bar> {
        let idx = self.index_at_or_before(at)?;
        self.bars[..=idx].iter().rev().find(|b| !b.is_synthetic())
    }

    /// Deterministic BLAKE3 hash over every bar.
    pub fn data_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for bar in &self.bars {
            hasher.update(&bar.timestamp.timestamp_millis().to_le_bytes());
            hasher.update(&bar.open.to_le_bytes());
            hasher.update(&bar.high.to_le_bytes());
            hasher.update(&bar.low.to_le_bytes());
            hasher.update(&bar.close.to_le_bytes());
            hasher.update(&bar.volume.to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Columnar form persisted by the bar store: `timestamp` as epoch
    /// milliseconds, prices and volume as f64.
    pub fn to_dataframe(&self) -> Result<DataFrame, DataError> {
        let timestamps: Vec<i64> = self
            .bars
            .iter()
            .map(|b| b.timestamp.timestamp_millis())
            .collect();
        let opens: Vec<f64> = self.bars.iter().map(|b| b.open).collect();
        let highs: Vec<f64> = self.bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = self.bars.iter().map(|b| b.low).collect();
        let closes: Vec<f64> = self.bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = self.bars.iter().map(|b| b.volume).collect();

        DataFrame::new(vec![
            Column::new("timestamp".into(), timestamps),
            Column::new("open".into(), opens),
            Column::new("high".into(), highs),
            Column::new("low".into(), lows),
            Column::new("close".into(), closes),
            Column::new("volume".into(), volumes),
        ])
        .map_err(|e| DataError::Parquet(format!("dataframe creation: {e}")))
    }

    /// Inverse of [`Series::to_dataframe`]. Nulls are rejected; a persisted
    /// series is always fully filled.
    pub fn from_dataframe(
        key: CacheKey,
        timezone: Tz,
        granularity: Granularity,
        df: &DataFrame,
    ) -> Result<Self, DataError> {
        let column_err = |e: PolarsError| DataError::Parquet(format!("column read: {e}"));

        let ts_ca = df
            .column("timestamp")
            .map_err(column_err)?
            .i64()
            .map_err(|e| DataError::Parquet(format!("timestamp column type: {e}")))?
            .clone();
        let mut values = Vec::with_capacity(5);
        for name in ["open", "high", "low", "close", "volume"] {
            let ca = df
                .column(name)
                .map_err(column_err)?
                .f64()
                .map_err(|e| DataError::Parquet(format!("{name} column type: {e}")))?
                .clone();
            values.push(ca);
        }

        let n = df.height();
        let mut bars = Vec::with_capacity(n);
        for i in 0..n {
            let millis = ts_ca
                .get(i)
                .ok_or_else(|| DataError::Validation(format!("null timestamp at row {i}")))?;
            let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or_else(|| DataError::Validation(format!("timestamp out of range at row {i}")))?;
            let field = |col: usize| {
                values[col]
                    .get(i)
                    .ok_or_else(|| DataError::Validation(format!("null value at row {i}")))
            };
            bars.push(Bar {
                timestamp,
                open: field(0)?,
                high: field(1)?,
                low: field(2)?,
                close: field(3)?,
                volume: field(4)?,
            });
        }

        Self::new(key, timezone, granularity, bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> CacheKey {
        use crate::calendar::{DateRange, Market};
        use crate::data::BarRequest;
        use crate::domain::{Instrument, QuotePair};
        let d = chrono::NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        BarRequest {
            pair: QuotePair::with_default_quote(Instrument::equity("SPY")).unwrap(),
            market: Market::Nyse,
            granularity: Granularity::Minute,
            timezone: chrono_tz::America::New_York,
            adjusted: true,
            range: DateRange::new(d, d),
        }
        .cache_key()
    }

    fn bar(minute: u32, open: f64, volume: f64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 14, 30 + minute, 0).unwrap(),
            open,
            high: open + 1.0,
            low: open - 1.0,
            close: open + 0.5,
            volume,
        }
    }

    fn series() -> Series {
        Series::new(
            key(),
            chrono_tz::America::New_York,
            Granularity::Minute,
            vec![bar(0, 100.0, 10.0), bar(1, 101.0, 0.0), bar(2, 102.0, 5.0)],
        )
        .unwrap()
    }

    #[test]
    fn rejects_duplicates() {
        let result = Series::new(
            key(),
            chrono_tz::UTC,
            Granularity::Minute,
            vec![bar(0, 1.0, 1.0), bar(0, 1.0, 1.0)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn containment_uses_step() {
        let s = series();
        let mid = Utc.with_ymd_and_hms(2024, 1, 2, 14, 31, 30).unwrap();
        assert_eq!(s.bar_containing(mid).unwrap().open, 101.0);

        let before = Utc.with_ymd_and_hms(2024, 1, 2, 14, 29, 59).unwrap();
        assert!(s.bar_containing(before).is_none());

        let after = Utc.with_ymd_and_hms(2024, 1, 2, 14, 33, 0).unwrap();
        assert!(s.bar_containing(after).is_none());
    }

    #[test]
    fn last_traded_skips_synthetic_rows() {
        let s = series();
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 14, 31, 0).unwrap();
        assert_eq!(s.last_traded_at_or_before(at).unwrap().open, 100.0);
    }

    #[test]
    fn dataframe_roundtrip_preserves_hash() {
        let s = series();
        let df = s.to_dataframe().unwrap();
        let back =
            Series::from_dataframe(s.key.clone(), s.timezone, s.granularity, &df).unwrap();
        assert_eq!(back, s);
        assert_eq!(back.data_hash(), s.data_hash());
    }
}
