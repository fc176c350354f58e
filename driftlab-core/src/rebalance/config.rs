//! Rebalance settings and their validation.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::config::{non_negative, ConfigError};

/// How drift is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftMode {
    /// `target_weight - current_weight`
    Absolute,
    /// `(target_weight - current_weight) / |target_weight|`
    Relative,
}

impl FromStr for DriftMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "absolute" => Ok(DriftMode::Absolute),
            "relative" => Ok(DriftMode::Relative),
            _ => Err(ConfigError::UnknownDriftMode(s.to_string())),
        }
    }
}

/// Linear trading fees: a flat amount per order plus a fraction of notional.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeeModel {
    pub flat: f64,
    pub percent: f64,
}

impl FeeModel {
    pub fn new(flat: f64, percent: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            flat: non_negative("flat_fee", flat)?,
            percent: non_negative("percent_fee", percent)?,
        })
    }

    pub fn free() -> Self {
        Self::default()
    }

    /// Fee for an order of the given notional.
    pub fn fee(&self, notional: f64) -> f64 {
        self.flat + notional.abs() * self.percent
    }
}

/// Raw, unvalidated rebalance settings as they appear in a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceSettings {
    pub drift_mode: DriftMode,
    pub drift_threshold: f64,
    pub acceptable_slippage: f64,
    pub flat_fee: f64,
    pub percent_fee: f64,
    pub shorting: bool,
    pub fractional_shares: bool,
    pub only_rebalance_drifted_assets: bool,
}

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            drift_mode: DriftMode::Absolute,
            drift_threshold: 0.05,
            acceptable_slippage: 0.005,
            flat_fee: 0.0,
            percent_fee: 0.0,
            shorting: false,
            fractional_shares: false,
            only_rebalance_drifted_assets: false,
        }
    }
}

/// Validated rebalance configuration.
///
/// The threshold must sit strictly between the acceptable slippage and 1.0;
/// this is checked once here and never again at evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceConfig {
    drift_mode: DriftMode,
    threshold: f64,
    slippage: f64,
    fees: FeeModel,
    shorting: bool,
    fractional_shares: bool,
    only_rebalance_drifted_assets: bool,
}

impl RebalanceConfig {
    pub fn new(settings: RebalanceSettings) -> Result<Self, ConfigError> {
        let slippage = non_negative("acceptable_slippage", settings.acceptable_slippage)?;
        let threshold = settings.drift_threshold;
        if threshold.is_nan() || threshold <= slippage {
            return Err(ConfigError::ThresholdNotAboveSlippage { threshold, slippage });
        }
        if threshold >= 1.0 {
            return Err(ConfigError::ThresholdTooLarge(threshold));
        }
        Ok(Self {
            drift_mode: settings.drift_mode,
            threshold,
            slippage,
            fees: FeeModel::new(settings.flat_fee, settings.percent_fee)?,
            shorting: settings.shorting,
            fractional_shares: settings.fractional_shares,
            only_rebalance_drifted_assets: settings.only_rebalance_drifted_assets,
        })
    }

    pub fn drift_mode(&self) -> DriftMode {
        self.drift_mode
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn slippage(&self) -> f64 {
        self.slippage
    }

    pub fn fees(&self) -> FeeModel {
        self.fees
    }

    pub fn shorting(&self) -> bool {
        self.shorting
    }

    pub fn fractional_shares(&self) -> bool {
        self.fractional_shares
    }

    pub fn only_rebalance_drifted_assets(&self) -> bool {
        self.only_rebalance_drifted_assets
    }
}
