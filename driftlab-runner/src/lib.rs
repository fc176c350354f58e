//! DriftLab Runner — session orchestration on top of `driftlab-core`.
//!
//! This crate provides:
//! - Session config loading and validation (TOML)
//! - The backtest session loop and the strategy lifecycle
//! - A simulated broker behind the order transmission seam
//! - A CSV bar source for local data
//! - Parallel cache prefetch
//! - A live scheduler with bounded concurrent job instances
//! - Equity curve and result export

pub mod broker;
pub mod config;
pub mod csv_source;
pub mod export;
pub mod live;
pub mod prefetch;
pub mod session;

use thiserror::Error;

use driftlab_core::clock::ClockError;
use driftlab_core::config::ConfigError;
use driftlab_core::data::DataError;
use driftlab_core::rebalance::DriftError;
use driftlab_core::PriceError;

pub use broker::{BrokerError, OrderAck, OrderStatus, OrderTransmitter, SimulatedBroker};
pub use config::{SessionConfig, SessionFile};
pub use csv_source::CsvBarSource;
pub use export::{equity_curve_csv, load_summary, orders_csv, save_artifacts, ResultSummary};
pub use live::{LiveError, LiveSchedule, LiveScheduler, SchedulerReport, ShutdownSignal};
pub use prefetch::{prefetch_parallel, PrefetchReport};
pub use session::{
    EquityPoint, RebalanceReport, Session, SessionResult, StopReason, Strategy, StrategyContext,
};

/// Errors from the runner.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("data error: {0}")]
    Data(#[from] DataError),
    #[error("price error: {0}")]
    Price(#[from] PriceError),
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("drift error: {0}")]
    Drift(#[from] DriftError),
    /// Raised by strategy code; aborts the run after `on_strategy_end`.
    #[error("strategy error: {0}")]
    Strategy(String),
    #[error("export error: {0}")]
    Export(String),
}
