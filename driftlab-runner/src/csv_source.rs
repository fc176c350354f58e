//! Bar source over a directory of CSV files.
//!
//! Looks for `{SYMBOL}_{granularity}.csv` first and falls back to
//! `{SYMBOL}.csv`. The header row must name `timestamp`, `open`, `high`,
//! `low`, `close` and `volume` (any order, case-insensitive, extra columns
//! ignored). Empty cells are read as missing values and left for the
//! calendar alignment to fill.
//!
//! Timestamps may be `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` (taken as UTC) or
//! RFC 3339.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

use driftlab_core::calendar::Granularity;
use driftlab_core::data::{BarSource, DataError, REQUIRED_COLUMNS};
use driftlab_core::domain::QuotePair;

#[derive(Debug, Clone)]
pub struct CsvBarSource {
    dir: PathBuf,
}

impl CsvBarSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn file_for(&self, pair: &QuotePair, granularity: Granularity) -> Option<PathBuf> {
        let symbol = pair.base.symbol.replace('/', "-");
        [
            self.dir.join(format!("{symbol}_{}.csv", granularity.as_str())),
            self.dir.join(format!("{symbol}.csv")),
        ]
        .into_iter()
        .find(|p| p.is_file())
    }
}

struct Columns {
    timestamp: Vec<i64>,
    values: [Vec<Option<f64>>; 5],
}

impl BarSource for CsvBarSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn fetch(
        &self,
        pair: &QuotePair,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DataFrame, DataError> {
        let path = self.file_for(pair, granularity).ok_or_else(|| DataError::SymbolNotFound {
            symbol: pair.base.symbol.clone(),
        })?;
        let columns = read_file(&path, self.name(), start, end)?;
        debug!(path = %path.display(), rows = columns.timestamp.len(), "read csv bars");

        let [open, high, low, close, volume] = columns.values;
        DataFrame::new(vec![
            Column::new("timestamp".into(), columns.timestamp),
            Column::new("open".into(), open),
            Column::new("high".into(), high),
            Column::new("low".into(), low),
            Column::new("close".into(), close),
            Column::new("volume".into(), volume),
        ])
        .map_err(|e| DataError::Provider(format!("csv frame: {e}")))
    }
}

fn read_file(path: &Path, source_name: &str, start: NaiveDate, end: NaiveDate) -> Result<Columns, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| DataError::Provider(format!("{}: {e}", path.display())))?;

    let headers = reader
        .headers()
        .map_err(|e| DataError::Provider(format!("{}: {e}", path.display())))?
        .clone();
    let mut index = [0usize; 6];
    for (slot, name) in index.iter_mut().zip(REQUIRED_COLUMNS) {
        *slot = headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| DataError::MissingColumn {
                source_name: source_name.to_string(),
                column: name.to_string(),
            })?;
    }

    let mut out = Columns {
        timestamp: Vec::new(),
        values: Default::default(),
    };
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| DataError::Provider(format!("{}: {e}", path.display())))?;
        let row = line + 2;
        let raw_ts = record.get(index[0]).unwrap_or_default();
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| {
            DataError::Validation(format!("{}:{row}: bad timestamp '{raw_ts}'", path.display()))
        })?;
        let date = timestamp.date_naive();
        if date < start || date > end {
            continue;
        }

        out.timestamp.push(timestamp.timestamp_millis());
        for (col, &idx) in out.values.iter_mut().zip(&index[1..]) {
            let cell = record.get(idx).unwrap_or_default();
            let value = if cell.is_empty() {
                None
            } else {
                Some(cell.parse::<f64>().map_err(|e| {
                    DataError::Validation(format!("{}:{row}: '{cell}': {e}", path.display()))
                })?)
            };
            col.push(value);
        }
    }
    Ok(out)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}
