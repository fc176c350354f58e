//! Portfolio valuation: mark every position to market through the resolver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{Instrument, Position};
use crate::pricing::{PriceResolver, PriceSource};

/// Non-fatal valuation problem, logged and returned with the valuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StaleValuationWarning {
    /// Priced from the forward-fill anchor.
    ForwardFilled { symbol: String, price: f64 },
    /// No tier produced a price; the position is left out of the total.
    Excluded { symbol: String, quantity: f64 },
}

/// One marked position.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetValue {
    pub instrument: Instrument,
    pub quantity: f64,
    pub price: f64,
    pub value: f64,
    pub source: Option<PriceSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub at: DateTime<Utc>,
    pub cash: f64,
    pub total: f64,
    /// Marked positions in input order. Excluded instruments are absent.
    pub assets: Vec<AssetValue>,
    pub warnings: Vec<StaleValuationWarning>,
}

impl Valuation {
    pub fn value_of(&self, instrument: &Instrument) -> Option<f64> {
        self.assets
            .iter()
            .find(|a| &a.instrument == instrument)
            .map(|a| a.value)
    }

    pub fn price_of(&self, instrument: &Instrument) -> Option<f64> {
        self.assets
            .iter()
            .find(|a| &a.instrument == instrument)
            .map(|a| a.price)
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// total = cash + Σ quantity × price × multiplier.
///
/// Positions in the quote asset are worth 1 per unit. Every resolution that
/// is not itself a forward-fill becomes the instrument's new anchor.
/// Summation follows the input order, so a deterministic position list gives
/// a bit-identical total.
pub fn value_portfolio(
    positions: &[Position],
    quote: &Instrument,
    cash: f64,
    resolver: &PriceResolver,
    at: DateTime<Utc>,
) -> Valuation {
    let mut total = cash;
    let mut assets = Vec::with_capacity(positions.len());
    let mut warnings = Vec::new();

    for position in positions.iter().filter(|p| !p.is_flat()) {
        let instrument = &position.instrument;

        if instrument == quote {
            total += position.quantity;
            assets.push(AssetValue {
                instrument: instrument.clone(),
                quantity: position.quantity,
                price: 1.0,
                value: position.quantity,
                source: None,
            });
            continue;
        }

        let Some(resolution) = resolver.resolve_with_fallback(instrument, quote, at) else {
            warnings.push(StaleValuationWarning::Excluded {
                symbol: instrument.to_string(),
                quantity: position.quantity,
            });
            continue;
        };

        if resolution.source == PriceSource::ForwardFill {
            warnings.push(StaleValuationWarning::ForwardFilled {
                symbol: instrument.to_string(),
                price: resolution.price,
            });
        } else {
            resolver.record_anchor(instrument, resolution.price, at);
        }

        let value = position.market_value(resolution.price);
        total += value;
        assets.push(AssetValue {
            instrument: instrument.clone(),
            quantity: position.quantity,
            price: resolution.price,
            value,
            source: Some(resolution.source),
        });
    }

    if !warnings.is_empty() {
        warn!(at = %at, count = warnings.len(), total, "valuation used stale or missing prices");
    }

    Valuation {
        at,
        cash,
        total,
        assets,
        warnings,
    }
}
