//! Calendar alignment: normalize raw rows, reindex onto the session grid,
//! and fill the synthetic rows reindexing inserts.
//!
//! Fill order matters. Close forward-fill runs first, then open/high/low take
//! the row's close, then any open still missing back-fills from the nearest
//! later close, and only then do high/low/close fall back to open. Reordering
//! these steps resolves gaps at the start and end of a series incorrectly.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use polars::prelude::*;
use std::collections::BTreeMap;

use super::provider::{validate_columns, DataError};
use crate::calendar::{Granularity, TradingCalendar};
use crate::domain::Bar;

/// One row on the grid. `None` marks a value the provider did not supply.
#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    pub timestamp: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

impl GridRow {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
        }
    }

    pub fn has_prices(&self) -> bool {
        self.open.is_some() || self.high.is_some() || self.low.is_some() || self.close.is_some()
    }

    fn into_bar(self) -> Option<Bar> {
        Some(Bar {
            timestamp: self.timestamp,
            open: self.open?,
            high: self.high?,
            low: self.low?,
            close: self.close?,
            volume: self.volume?,
        })
    }
}

impl From<&Bar> for GridRow {
    fn from(bar: &Bar) -> Self {
        Self {
            timestamp: bar.timestamp,
            open: Some(bar.open),
            high: Some(bar.high),
            low: Some(bar.low),
            close: Some(bar.close),
            volume: Some(bar.volume),
        }
    }
}

/// Extract rows from an untrusted source frame.
///
/// Required columns are validated first. Non-finite values become `None`.
pub fn rows_from_frame(df: &DataFrame, source_name: &str) -> Result<Vec<GridRow>, DataError> {
    validate_columns(df, source_name)?;

    let timestamps = timestamp_column(df)?;
    let mut values = Vec::with_capacity(5);
    for name in ["open", "high", "low", "close", "volume"] {
        let col = df
            .column(name)
            .map_err(|e| DataError::Validation(format!("{name}: {e}")))?
            .cast(&DataType::Float64)
            .map_err(|e| DataError::Validation(format!("{name} is not numeric: {e}")))?;
        let ca = col
            .f64()
            .map_err(|e| DataError::Validation(format!("{name} column type: {e}")))?
            .clone();
        values.push(ca);
    }

    let mut rows = Vec::with_capacity(timestamps.len());
    for (i, ts) in timestamps.into_iter().enumerate() {
        let Some(timestamp) = ts else { continue };
        let get = |col: usize| values[col].get(i).filter(|v| v.is_finite());
        rows.push(GridRow {
            timestamp,
            open: get(0),
            high: get(1),
            low: get(2),
            close: get(3),
            volume: get(4),
        });
    }
    Ok(rows)
}

/// Timestamps as UTC instants. Accepts Int64 epoch milliseconds, Datetime of
/// any unit, or Date.
fn timestamp_column(df: &DataFrame) -> Result<Vec<Option<DateTime<Utc>>>, DataError> {
    let col = df
        .column("timestamp")
        .map_err(|e| DataError::Validation(format!("timestamp: {e}")))?;
    let cast_err = |e: PolarsError| DataError::Validation(format!("timestamp cast: {e}"));

    let out: Vec<Option<DateTime<Utc>>> = match col.dtype() {
        DataType::Datetime(unit, _) => {
            let unit = *unit;
            let ca = col.cast(&DataType::Int64).map_err(cast_err)?;
            let ints = ca.i64().map_err(cast_err)?;
            ints.into_iter()
                .map(|v| {
                    v.and_then(|raw| match unit {
                        TimeUnit::Milliseconds => DateTime::<Utc>::from_timestamp_millis(raw),
                        TimeUnit::Microseconds => DateTime::<Utc>::from_timestamp_micros(raw),
                        TimeUnit::Nanoseconds => Some(DateTime::<Utc>::from_timestamp_nanos(raw)),
                    })
                })
                .collect()
        }
        DataType::Date => {
            let ca = col.cast(&DataType::Int32).map_err(cast_err)?;
            let days = ca.i32().map_err(cast_err)?;
            days.into_iter()
                .map(|v| v.and_then(|d| DateTime::<Utc>::from_timestamp(i64::from(d) * 86_400, 0)))
                .collect()
        }
        DataType::Int64 | DataType::Int32 | DataType::UInt64 | DataType::UInt32 => {
            let ca = col.cast(&DataType::Int64).map_err(cast_err)?;
            let ints = ca.i64().map_err(cast_err)?;
            ints.into_iter()
                .map(|v| v.and_then(DateTime::<Utc>::from_timestamp_millis))
                .collect()
        }
        other => {
            return Err(DataError::Validation(format!(
                "timestamp column has unsupported type {other}"
            )))
        }
    };
    Ok(out)
}

/// Snap every row onto the grid. Rows that collapse onto the same grid
/// timestamp keep the later one. Output is sorted ascending.
pub fn normalize_rows(
    rows: Vec<GridRow>,
    calendar: &TradingCalendar,
    granularity: Granularity,
    tz: Tz,
) -> Vec<GridRow> {
    let mut by_ts: BTreeMap<DateTime<Utc>, GridRow> = BTreeMap::new();
    for mut row in rows {
        let Some(ts) = calendar.normalize(row.timestamp, granularity, tz) else {
            continue;
        };
        row.timestamp = ts;
        by_ts.insert(ts, row);
    }
    by_ts.into_values().collect()
}

/// Place normalized rows onto `grid`. Grid slots without a row become empty
/// rows; rows off the grid are dropped.
pub fn reindex(rows: Vec<GridRow>, grid: &[DateTime<Utc>]) -> Vec<GridRow> {
    let mut by_ts: BTreeMap<DateTime<Utc>, GridRow> =
        rows.into_iter().map(|r| (r.timestamp, r)).collect();
    grid.iter()
        .map(|ts| by_ts.remove(ts).unwrap_or_else(|| GridRow::empty(*ts)))
        .collect()
}

/// Fill missing values in place. Running it twice is a no-op.
pub fn fill(rows: &mut [GridRow]) {
    // 1. volume defaults to zero
    for row in rows.iter_mut() {
        row.volume.get_or_insert(0.0);
    }

    // A close taken from an open in step 5 still has to reach its
    // neighbours; one more pass does that and then nothing is left open.
    if fill_prices(rows) {
        fill_prices(rows);
    }
}

/// Steps 2 to 5. Returns whether step 5 supplied a close from an open.
fn fill_prices(rows: &mut [GridRow]) -> bool {
    // 2. close forward-fill
    let mut last_close = None;
    for row in rows.iter_mut() {
        match row.close {
            Some(c) => last_close = Some(c),
            None => row.close = last_close,
        }
    }

    // 3. open/high/low default to the (filled) close
    for row in rows.iter_mut() {
        if let Some(c) = row.close {
            row.open.get_or_insert(c);
            row.high.get_or_insert(c);
            row.low.get_or_insert(c);
        }
    }

    // 4. open back-fill from the nearest later close
    let mut next_close = None;
    for row in rows.iter_mut().rev() {
        if row.open.is_none() {
            row.open = next_close;
        }
        if let Some(c) = row.close {
            next_close = Some(c);
        }
    }

    // 5. high/low/close default to open
    let mut close_from_open = false;
    for row in rows.iter_mut() {
        if let Some(o) = row.open {
            row.high.get_or_insert(o);
            row.low.get_or_insert(o);
            if row.close.is_none() {
                row.close = Some(o);
                close_from_open = true;
            }
        }
    }
    close_from_open
}

/// Full pipeline from raw rows to gap-free bars.
///
/// Returns `None` when no row landed on the grid, i.e. the source supplied
/// nothing usable for the range.
pub fn align_to_calendar(
    rows: Vec<GridRow>,
    calendar: &TradingCalendar,
    grid: &[DateTime<Utc>],
    granularity: Granularity,
    tz: Tz,
) -> Option<Vec<Bar>> {
    let normalized = normalize_rows(rows, calendar, granularity, tz);
    let mut reindexed = reindex(normalized, grid);
    if !reindexed.iter().any(GridRow::has_prices) {
        return None;
    }
    fill(&mut reindexed);
    reindexed.into_iter().map(GridRow::into_bar).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{DateRange, Market};
    use chrono::{NaiveDate, TimeZone};

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn row(day: u32, close: Option<f64>) -> GridRow {
        GridRow {
            close,
            volume: close.map(|_| 100.0),
            ..GridRow::empty(ts(day))
        }
    }

    #[test]
    fn fill_ordering_near_edges() {
        // [missing, 10, missing, 12, missing]
        let mut rows = vec![
            row(1, None),
            row(2, Some(10.0)),
            row(3, None),
            row(4, Some(12.0)),
            row(5, None),
        ];
        fill(&mut rows);

        // Leading gap: open back-fills from the first later close, then
        // high/low/close take that open.
        assert_eq!(rows[0].open, Some(10.0));
        assert_eq!(rows[0].close, Some(10.0));
        assert_eq!(rows[0].volume, Some(0.0));
        // Interior gap: close forward-fills, OHL take it.
        assert_eq!(rows[2].close, Some(10.0));
        assert_eq!(rows[2].open, Some(10.0));
        // Trailing gap: forward-fill.
        assert_eq!(rows[4].close, Some(12.0));
        assert_eq!(rows[4].high, Some(12.0));
    }

    #[test]
    fn fill_keeps_provider_values() {
        let mut rows = vec![GridRow {
            open: Some(9.0),
            high: Some(11.0),
            low: Some(8.0),
            close: Some(10.0),
            volume: Some(5.0),
            ..GridRow::empty(ts(2))
        }];
        let before = rows.clone();
        fill(&mut rows);
        assert_eq!(rows, before);
    }

    #[test]
    fn fill_twice_is_noop() {
        let mut rows = vec![row(1, None), row(2, Some(10.0)), row(3, None)];
        fill(&mut rows);
        let once = rows.clone();
        fill(&mut rows);
        assert_eq!(rows, once);
    }

    #[test]
    fn open_only_row_still_seeds_its_neighbours() {
        let mut rows = vec![
            row(1, None),
            GridRow { open: Some(7.0), ..GridRow::empty(ts(2)) },
            row(3, None),
        ];
        fill(&mut rows);
        assert!(rows.iter().all(|r| r.close == Some(7.0) && r.open == Some(7.0)));
        let once = rows.clone();
        fill(&mut rows);
        assert_eq!(rows, once);
    }

    #[test]
    fn reindex_inserts_missing_sessions_and_drops_off_grid_rows() {
        let cal = TradingCalendar::new(Market::Nyse);
        let tz = chrono_tz::America::New_York;
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        );
        let grid = cal.sample_timestamps(&range, Granularity::Day, tz);
        assert_eq!(grid.len(), 4);

        // Provider stamps daily bars at 00:00 UTC; the Saturday row is off-grid.
        let raw = vec![row(2, Some(100.0)), row(4, Some(102.0)), row(6, Some(103.0))];
        let bars = align_to_calendar(raw, &cal, &grid, Granularity::Day, tz).unwrap();

        assert_eq!(bars.len(), 4);
        assert_eq!(
            bars.iter().map(|b| b.timestamp).collect::<Vec<_>>(),
            grid
        );
        // 2024-01-03 was missing: filled from the prior close, zero volume.
        assert_eq!(bars[1].close, 100.0);
        assert!(bars[1].is_synthetic());
        assert_eq!(bars[2].close, 102.0);
    }

    #[test]
    fn nothing_on_grid_means_no_series() {
        let cal = TradingCalendar::new(Market::Nyse);
        let tz = chrono_tz::America::New_York;
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
        );
        let grid = cal.sample_timestamps(&range, Granularity::Day, tz);
        assert!(align_to_calendar(vec![row(20, Some(1.0))], &cal, &grid, Granularity::Day, tz).is_none());
    }

    #[test]
    fn duplicate_rows_keep_the_later_one() {
        let cal = TradingCalendar::new(Market::Crypto);
        let base = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 5).unwrap();
        let rows = vec![
            GridRow { close: Some(1.0), ..GridRow::empty(base) },
            GridRow { close: Some(2.0), ..GridRow::empty(base + chrono::Duration::seconds(20)) },
        ];
        let out = normalize_rows(rows, &cal, Granularity::Minute, chrono_tz::UTC);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].close, Some(2.0));
    }

    #[test]
    fn frame_rows_accept_millis_and_nulls() {
        let df = DataFrame::new(vec![
            Column::new("timestamp".into(), vec![ts(2).timestamp_millis(), ts(3).timestamp_millis()]),
            Column::new("open".into(), vec![Some(1.0), None]),
            Column::new("high".into(), vec![2.0, 2.0]),
            Column::new("low".into(), vec![0.5, 0.5]),
            Column::new("close".into(), vec![1.5, f64::NAN]),
            Column::new("volume".into(), vec![10i64, 20]),
        ])
        .unwrap();
        let rows = rows_from_frame(&df, "test").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, ts(2));
        assert_eq!(rows[1].open, None);
        assert_eq!(rows[1].close, None);
        assert_eq!(rows[1].volume, Some(20.0));
    }
}
