//! Historical data: sources, calendar alignment, series, and the bar store.

pub mod align;
pub mod cache;
pub mod cache_key;
pub mod provider;
pub mod series;
pub mod synthetic;

pub use align::{align_to_calendar, fill, reindex, rows_from_frame, GridRow};
pub use cache::{BarStore, CacheMeta, CacheOutcome, CacheStatus};
pub use cache_key::{BarRequest, CacheKey};
pub use provider::{BarSource, DataError, QuoteSnapshot, QuoteSource, REQUIRED_COLUMNS};
pub use series::Series;
pub use synthetic::SyntheticSource;
