//! Drift-based rebalancing: configuration, drift rows, and the order planner.

pub mod config;
pub mod drift;
pub mod planner;

pub use config::{DriftMode, FeeModel, RebalanceConfig, RebalanceSettings};
pub use drift::{
    compute_drift, drift_from_valuation, drift_value, holdings_from, should_rebalance, DriftError,
    DriftRow, Holding, COVER, LIQUIDATE,
};
pub use planner::{
    BuyPlan, PlanningSkip, PriceLookup, RebalancePlan, RebalancePlanner, ResolverPrices, SellPlan,
    SkipReason,
};
