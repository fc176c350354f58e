//! DriftLab Core — historical data resolution and drift rebalancing.
//!
//! This crate contains the deterministic heart of the simulator:
//! - Trading calendar (sessions, sample grid, timestamp normalization)
//! - Bar store (calendar-aligned parquet cache with atomic writes)
//! - Price resolver (point-in-time, windowed, and tiered fallback lookups)
//! - Portfolio valuation with forward-fill anchors
//! - Drift calculation and the two-phase rebalance planner
//! - Simulation clock with a structural no-stall guarantee
//!
//! The library emits `tracing` events but never installs a subscriber.

pub mod calendar;
pub mod clock;
pub mod config;
pub mod data;
pub mod domain;
pub mod pricing;
pub mod rebalance;
pub mod valuation;

pub use calendar::{DateRange, Granularity, Market, Session, TradingCalendar};
pub use clock::{ClockError, ClockState, IterationOutcome, Phase, SimulationClock};
pub use config::{ConfigError, DataSettings};
pub use pricing::{PriceError, PriceResolver, PriceSource, Resolution};
pub use valuation::{value_portfolio, StaleValuationWarning, Valuation};
