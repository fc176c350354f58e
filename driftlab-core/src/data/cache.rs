//! Bar store: parquet cache of calendar-aligned series, one file per key.
//!
//! Layout: `{cache_dir}/{provider}/{cache_key}.parquet` plus a
//! `{cache_key}.meta.json` sidecar.
//!
//! Features:
//! - Atomic writes (unique temp file, rename into place)
//! - Quarantine for corrupt files (`{cache_key}.parquet.quarantined`)
//! - Staleness from the sidecar's `cached_at`
//! - In-memory layer owned by the store, one entry per key

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::align::{align_to_calendar, rows_from_frame};
use super::cache_key::{BarRequest, CacheKey};
use super::provider::{BarSource, DataError};
use super::series::Series;
use crate::calendar::{Granularity, TradingCalendar};
use crate::config::DataSettings;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Metadata sidecar for one cached series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub key: String,
    pub timezone: Tz,
    pub granularity: Granularity,
    pub bar_count: usize,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub data_hash: String,
    pub cached_at: DateTime<Utc>,
    pub source: String,
}

/// Cache status for a single key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub key: String,
    pub cached: bool,
    pub in_memory: bool,
    pub bar_count: Option<usize>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub cached_at: Option<DateTime<Utc>>,
}

/// Where a returned series came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    MemoryHit,
    DiskHit,
    Fetched,
}

/// The bar store. Owned by a session and passed by reference; there is no
/// process-wide cache.
pub struct BarStore {
    root: PathBuf,
    max_age: Option<chrono::Duration>,
    force_refresh: bool,
    memory: RwLock<HashMap<CacheKey, Arc<Series>>>,
}

impl BarStore {
    /// A store rooted at `{cache_dir}/{provider}`.
    pub fn new(cache_dir: impl AsRef<Path>, provider: &str) -> Self {
        Self {
            root: cache_dir.as_ref().join(provider),
            max_age: None,
            force_refresh: false,
            memory: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &DataSettings) -> Self {
        let mut store = Self::new(&settings.cache_dir, &settings.provider_dir());
        store.max_age = settings.max_age();
        store.force_refresh = settings.force_refresh;
        store
    }

    pub fn with_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn series_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{key}.parquet"))
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{key}.meta.json"))
    }

    /// Series already resident in memory.
    pub fn cached(&self, key: &CacheKey) -> Option<Arc<Series>> {
        self.memory
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn remember(&self, key: CacheKey, series: Arc<Series>) {
        self.memory
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, series);
    }

    /// Drop the in-memory layer; disk entries stay.
    pub fn clear_memory(&self) {
        self.memory
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Read the sidecar for a key.
    pub fn get_meta(&self, key: &CacheKey) -> Option<CacheMeta> {
        let content = fs::read_to_string(self.meta_path(key)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Read a persisted series from disk.
    ///
    /// Returns `None` when absent or unreadable. A parquet file that cannot
    /// be decoded is quarantined so the next run refetches instead of failing
    /// again. A readable file whose content disagrees with the sidecar is
    /// only a miss: a concurrent writer renames the parquet file before the
    /// sidecar, so the pair can briefly disagree while both halves are valid.
    pub fn load(&self, key: &CacheKey) -> Option<Series> {
        let path = self.series_path(key);
        if !path.exists() {
            return None;
        }
        let Some(meta) = self.get_meta(key) else {
            debug!(key = %key, "cache entry has no readable sidecar, treating as miss");
            return None;
        };

        let series = match read_series(&path, key, &meta) {
            Ok(series) => series,
            Err(e) => {
                let quarantine = path.with_extension("parquet.quarantined");
                warn!(
                    key = %key,
                    path = %path.display(),
                    error = %e,
                    "quarantining corrupt cache file"
                );
                let _ = fs::rename(&path, &quarantine);
                return None;
            }
        };
        if matches_meta(&series, &meta) {
            return Some(series);
        }

        // The sidecar may have landed since it was first read.
        if let Some(fresh) = self.get_meta(key).filter(|fresh| *fresh != meta) {
            if matches_meta(&series, &fresh) {
                return Some(series);
            }
        }
        debug!(
            key = %key,
            bars = series.len(),
            expected = meta.bar_count,
            "cache entry does not match its sidecar, treating as miss"
        );
        None
    }

    /// Persist a series: parquet first, then the sidecar, each via a unique
    /// temp file renamed into place. Neither file is ever seen half-written;
    /// a reader landing between the two renames gets a miss from
    /// [`BarStore::load`], never a quarantine.
    pub fn save(&self, key: &CacheKey, series: &Series, source: &str) -> Result<CacheMeta, DataError> {
        self.save_at(key, series, source, Utc::now())
    }

    fn save_at(
        &self,
        key: &CacheKey,
        series: &Series,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<CacheMeta, DataError> {
        let (Some(first), Some(last)) = (series.first_timestamp(), series.last_timestamp()) else {
            return Err(DataError::Cache(format!("{key}: refusing to cache an empty series")));
        };

        fs::create_dir_all(&self.root)
            .map_err(|e| DataError::Cache(format!("failed to create dir: {e}")))?;

        let mut df = series.to_dataframe()?;
        let path = self.series_path(key);
        let tmp = unique_tmp(&path);
        write_parquet(&mut df, &tmp)?;
        rename_into_place(&tmp, &path)?;

        let meta = CacheMeta {
            key: key.to_string(),
            timezone: series.timezone,
            granularity: series.granularity,
            bar_count: series.len(),
            first_timestamp: first,
            last_timestamp: last,
            data_hash: series.data_hash(),
            cached_at: now,
            source: source.to_string(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| DataError::Cache(format!("meta serialization: {e}")))?;
        let meta_path = self.meta_path(key);
        let meta_tmp = unique_tmp(&meta_path);
        fs::write(&meta_tmp, meta_json).map_err(|e| DataError::Cache(format!("meta write: {e}")))?;
        rename_into_place(&meta_tmp, &meta_path)?;

        Ok(meta)
    }

    /// An entry is stale when it was cached before the request's last
    /// session closed, or is older than `max_age`.
    pub fn is_stale(
        &self,
        meta: &CacheMeta,
        request: &BarRequest,
        calendar: &TradingCalendar,
        now: DateTime<Utc>,
    ) -> bool {
        let last_close = calendar.sessions(&request.range).last().map(|s| s.close);
        if last_close.is_some_and(|close| meta.cached_at < close) {
            return true;
        }
        self.max_age
            .is_some_and(|max_age| now - meta.cached_at > max_age)
    }

    /// Memory hit, then disk hit (unless forced or stale), then fetch,
    /// align, persist.
    ///
    /// `force_refresh` only skips the disk layer: a key is still built at
    /// most once per store.
    pub fn fetch_and_cache(
        &self,
        request: &BarRequest,
        source: &dyn BarSource,
        calendar: &TradingCalendar,
    ) -> Result<Arc<Series>, DataError> {
        self.fetch_and_cache_at(request, source, calendar, Utc::now())
            .map(|(series, _)| series)
    }

    /// [`BarStore::fetch_and_cache`] with an explicit wall clock, reporting
    /// which layer answered.
    pub fn fetch_and_cache_at(
        &self,
        request: &BarRequest,
        source: &dyn BarSource,
        calendar: &TradingCalendar,
        now: DateTime<Utc>,
    ) -> Result<(Arc<Series>, CacheOutcome), DataError> {
        let key = request.cache_key();

        if let Some(series) = self.cached(&key) {
            return Ok((series, CacheOutcome::MemoryHit));
        }
        if !self.force_refresh {
            if let Some(meta) = self.get_meta(&key) {
                if self.is_stale(&meta, request, calendar, now) {
                    info!(key = %key, cached_at = %meta.cached_at, "cache entry stale, refetching");
                } else if let Some(series) = self.load(&key) {
                    let series = Arc::new(series);
                    self.remember(key, Arc::clone(&series));
                    return Ok((series, CacheOutcome::DiskHit));
                }
            }
        }

        let df = source
            .fetch(&request.pair, request.granularity, request.range.start, request.range.end)
            .map_err(|e| match e {
                DataError::MissingColumn { .. } => e,
                other => DataError::unavailable(key.as_str(), other.to_string()),
            })?;
        let rows = rows_from_frame(&df, source.name())?;
        if rows.is_empty() {
            return Err(DataError::unavailable(key.as_str(), "source returned no rows"));
        }

        let grid = calendar.sample_timestamps(&request.range, request.granularity, request.timezone);
        let bars = align_to_calendar(rows, calendar, &grid, request.granularity, request.timezone)
            .ok_or_else(|| {
                DataError::unavailable(key.as_str(), "no source rows fall on the session grid")
            })?;

        let series = Series::new(key.clone(), request.timezone, request.granularity, bars)?;
        let meta = self.save_at(&key, &series, source.name(), now)?;
        debug!(key = %key, bars = meta.bar_count, source = source.name(), "cached series");

        let series = Arc::new(series);
        self.remember(key, Arc::clone(&series));
        Ok((series, CacheOutcome::Fetched))
    }

    /// Inspect several keys at once.
    pub fn status(&self, keys: &[CacheKey]) -> Vec<CacheStatus> {
        keys.iter()
            .map(|key| {
                let meta = self.get_meta(key);
                CacheStatus {
                    key: key.to_string(),
                    cached: meta.is_some() && self.series_path(key).exists(),
                    in_memory: self.cached(key).is_some(),
                    bar_count: meta.as_ref().map(|m| m.bar_count),
                    first_timestamp: meta.as_ref().map(|m| m.first_timestamp),
                    last_timestamp: meta.as_ref().map(|m| m.last_timestamp),
                    cached_at: meta.as_ref().map(|m| m.cached_at),
                }
            })
            .collect()
    }
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn unique_tmp(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.{n}.tmp", std::process::id()));
    PathBuf::from(name)
}

fn rename_into_place(tmp: &Path, path: &Path) -> Result<(), DataError> {
    fs::rename(tmp, path).map_err(|e| {
        let _ = fs::remove_file(tmp);
        DataError::Cache(format!("atomic rename failed: {e}"))
    })
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), DataError> {
    let file = fs::File::create(path).map_err(|e| DataError::Parquet(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| {
            let _ = fs::remove_file(path);
            DataError::Parquet(format!("write parquet: {e}"))
        })?;
    Ok(())
}

fn read_series(path: &Path, key: &CacheKey, meta: &CacheMeta) -> Result<Series, DataError> {
    let file = fs::File::open(path).map_err(|e| DataError::Parquet(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::Parquet(format!("read: {e}")))?;
    if df.height() == 0 {
        return Err(DataError::Validation("empty parquet file".into()));
    }
    Series::from_dataframe(key.clone(), meta.timezone, meta.granularity, &df)
}

fn matches_meta(series: &Series, meta: &CacheMeta) -> bool {
    series.len() == meta.bar_count && series.data_hash() == meta.data_hash
}
