//! Drift calculation: current versus target weight, per asset.
//!
//! Rows are rebuilt from scratch on every evaluation; nothing carries over.

use std::collections::HashSet;
use thiserror::Error;

use super::config::DriftMode;
use crate::domain::{Instrument, Position};
use crate::valuation::Valuation;

/// Drift sentinel: sell the whole position.
pub const LIQUIDATE: f64 = -1.0;
/// Drift sentinel: buy back the whole short.
pub const COVER: f64 = 1.0;

#[derive(Debug, Error, PartialEq)]
pub enum DriftError {
    #[error("{symbol}: {field} is not finite")]
    NonFinite { symbol: String, field: &'static str },

    #[error("{symbol} has more than one target weight")]
    DuplicateTarget { symbol: String },
}

/// One asset's drift evaluation. Fields are validated finite at construction
/// and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftRow {
    symbol: String,
    instrument: Instrument,
    is_quote_asset: bool,
    current_quantity: f64,
    current_value: f64,
    current_weight: f64,
    target_weight: f64,
    target_value: f64,
    drift: f64,
    priced: bool,
}

impl DriftRow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instrument: Instrument,
        is_quote_asset: bool,
        current_quantity: f64,
        current_value: f64,
        current_weight: f64,
        target_weight: f64,
        target_value: f64,
        drift: f64,
    ) -> Result<Self, DriftError> {
        let symbol = instrument.to_string();
        for (field, value) in [
            ("current_quantity", current_quantity),
            ("current_value", current_value),
            ("current_weight", current_weight),
            ("target_weight", target_weight),
            ("target_value", target_value),
            ("drift", drift),
        ] {
            if !value.is_finite() {
                return Err(DriftError::NonFinite { symbol, field });
            }
        }
        Ok(Self {
            symbol,
            instrument,
            is_quote_asset,
            current_quantity,
            current_value,
            current_weight,
            target_weight,
            target_value,
            drift,
            priced: true,
        })
    }

    /// Mark the row as built from a holding with no price. Its drift is
    /// forced to zero so it can neither trigger nor join a rebalance.
    pub fn into_unpriced(mut self) -> Self {
        self.priced = false;
        self.drift = 0.0;
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn is_quote_asset(&self) -> bool {
        self.is_quote_asset
    }

    pub fn current_quantity(&self) -> f64 {
        self.current_quantity
    }

    pub fn current_value(&self) -> f64 {
        self.current_value
    }

    pub fn current_weight(&self) -> f64 {
        self.current_weight
    }

    pub fn target_weight(&self) -> f64 {
        self.target_weight
    }

    pub fn target_value(&self) -> f64 {
        self.target_value
    }

    pub fn drift(&self) -> f64 {
        self.drift
    }

    pub fn is_priced(&self) -> bool {
        self.priced
    }

    /// Strictly above the threshold.
    pub fn exceeds(&self, threshold: f64) -> bool {
        self.drift.abs() > threshold
    }
}

/// Drift for one asset.
pub fn drift_value(
    is_quote_asset: bool,
    current_quantity: f64,
    current_weight: f64,
    target_weight: f64,
    mode: DriftMode,
) -> f64 {
    if is_quote_asset {
        return 0.0;
    }
    if current_weight == 0.0 && target_weight == 0.0 {
        return 0.0;
    }
    if target_weight == 0.0 {
        if current_quantity > 0.0 {
            return LIQUIDATE;
        }
        if current_quantity < 0.0 {
            return COVER;
        }
    }
    if current_quantity == 0.0 && target_weight != 0.0 {
        return target_weight.signum();
    }
    let diff = target_weight - current_weight;
    match mode {
        DriftMode::Absolute => diff,
        // Explicit zero-target guard: never divide by |0|.
        DriftMode::Relative if target_weight == 0.0 => 0.0,
        DriftMode::Relative => diff / target_weight.abs(),
    }
}

/// A held instrument and its marked value.
///
/// An unpriced holding is one the valuation had to exclude. It carries a
/// zero value and must not be read as underweight.
#[derive(Debug, Clone, PartialEq)]
pub struct Holding {
    pub instrument: Instrument,
    pub quantity: f64,
    pub value: f64,
    pub priced: bool,
}

impl Holding {
    pub fn new(instrument: Instrument, quantity: f64, value: f64) -> Self {
        Self {
            instrument,
            quantity,
            value,
            priced: true,
        }
    }

    pub fn unpriced(instrument: Instrument, quantity: f64) -> Self {
        Self {
            instrument,
            quantity,
            value: 0.0,
            priced: false,
        }
    }
}

/// Pair positions with their marked values.
pub fn holdings_from(positions: &[Position], valuation: &Valuation) -> Vec<Holding> {
    positions
        .iter()
        .filter(|p| !p.is_flat())
        .map(|p| match valuation.value_of(&p.instrument) {
            Some(value) => Holding::new(p.instrument.clone(), p.quantity, value),
            None => Holding::unpriced(p.instrument.clone(), p.quantity),
        })
        .collect()
}

/// Build one row per held or targeted instrument, then the quote row.
///
/// Order: targets in the order given, then held instruments without a
/// target, then the quote asset. Weights are fractions of
/// `cash + Σ holding values`.
pub fn compute_drift(
    holdings: &[Holding],
    cash: f64,
    quote: &Instrument,
    targets: &[(Instrument, f64)],
    mode: DriftMode,
) -> Result<Vec<DriftRow>, DriftError> {
    let mut seen = HashSet::new();
    for (instrument, weight) in targets {
        if !weight.is_finite() {
            return Err(DriftError::NonFinite {
                symbol: instrument.to_string(),
                field: "target_weight",
            });
        }
        if !seen.insert(instrument) {
            return Err(DriftError::DuplicateTarget {
                symbol: instrument.to_string(),
            });
        }
    }

    let non_quote = holdings.iter().filter(|h| &h.instrument != quote);
    let quote_held: f64 = holdings
        .iter()
        .filter(|h| &h.instrument == quote)
        .map(|h| h.quantity)
        .sum();
    let total = cash + quote_held + non_quote.clone().map(|h| h.value).sum::<f64>();
    let weight_of = |value: f64| if total > 0.0 { value / total } else { 0.0 };

    let mut rows = Vec::with_capacity(targets.len() + holdings.len() + 1);

    for (instrument, target_weight) in targets.iter().filter(|(i, _)| i != quote) {
        let held = holdings.iter().find(|h| &h.instrument == instrument);
        let quantity = held.map_or(0.0, |h| h.quantity);
        let value = held.map_or(0.0, |h| h.value);
        let current_weight = weight_of(value);
        let drift = drift_value(false, quantity, current_weight, *target_weight, mode);
        let row = DriftRow::new(
            instrument.clone(),
            false,
            quantity,
            value,
            current_weight,
            *target_weight,
            target_weight * total,
            drift,
        )?;
        rows.push(if held.is_some_and(|h| !h.priced) {
            row.into_unpriced()
        } else {
            row
        });
    }

    for holding in non_quote.filter(|h| !seen.contains(&h.instrument)) {
        let current_weight = weight_of(holding.value);
        let drift = drift_value(false, holding.quantity, current_weight, 0.0, mode);
        let row = DriftRow::new(
            holding.instrument.clone(),
            false,
            holding.quantity,
            holding.value,
            current_weight,
            0.0,
            0.0,
            drift,
        )?;
        rows.push(if holding.priced { row } else { row.into_unpriced() });
    }

    let quote_cash = cash + quote_held;
    let quote_target = targets
        .iter()
        .find(|(i, _)| i == quote)
        .map(|(_, w)| *w)
        .unwrap_or_else(|| 1.0 - targets.iter().map(|(_, w)| w).sum::<f64>());
    rows.push(DriftRow::new(
        quote.clone(),
        true,
        quote_cash,
        quote_cash,
        weight_of(quote_cash),
        quote_target,
        quote_target * total,
        0.0,
    )?);

    Ok(rows)
}

/// Rows, positions and valuation in one step.
pub fn drift_from_valuation(
    positions: &[Position],
    valuation: &Valuation,
    quote: &Instrument,
    targets: &[(Instrument, f64)],
    mode: DriftMode,
) -> Result<Vec<DriftRow>, DriftError> {
    compute_drift(&holdings_from(positions, valuation), valuation.cash, quote, targets, mode)
}

/// A rebalance is due when any row's |drift| is strictly above `threshold`.
pub fn should_rebalance(rows: &[DriftRow], threshold: f64) -> bool {
    rows.iter().any(|r| r.exceeds(threshold))
}
