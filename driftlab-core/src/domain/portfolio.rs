//! Portfolio — aggregate state of cash + all open positions.

use super::instrument::Instrument;
use super::order::OrderSide;
use super::position::Position;
use std::collections::BTreeMap;

/// Aggregate portfolio state.
///
/// Positions are keyed by the instrument's cache token so iteration order is
/// stable across runs; valuation sums in that order.
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub cash: f64,
    pub initial_capital: f64,
    pub quote: Instrument,
    positions: BTreeMap<String, Position>,
    pub total_fees: f64,
}

impl Portfolio {
    pub fn new(initial_capital: f64, quote: Instrument) -> Self {
        Self {
            cash: initial_capital,
            initial_capital,
            quote,
            positions: BTreeMap::new(),
            total_fees: 0.0,
        }
    }

    /// Open (non-flat) positions in deterministic order.
    pub fn positions(&self) -> Vec<Position> {
        self.positions
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect()
    }

    /// Get a position by instrument (if exists and not flat).
    pub fn get_position(&self, instrument: &Instrument) -> Option<&Position> {
        self.positions
            .get(&instrument.cache_token())
            .filter(|p| !p.is_flat())
    }

    pub fn quantity(&self, instrument: &Instrument) -> f64 {
        self.get_position(instrument).map_or(0.0, |p| p.quantity)
    }

    /// Seed a position directly, e.g. when restoring broker state.
    pub fn set_position(&mut self, position: Position) {
        self.positions
            .insert(position.instrument.cache_token(), position);
    }

    /// Apply a fill: moves cash by the notional and fee, updates the position.
    pub fn apply_fill(
        &mut self,
        instrument: &Instrument,
        side: OrderSide,
        quantity: f64,
        price: f64,
        fee: f64,
    ) {
        let signed = quantity * side.sign();
        let notional = quantity * price * instrument.multiplier();
        match side {
            OrderSide::Buy => self.cash -= notional + fee,
            OrderSide::Sell => self.cash += notional - fee,
        }
        self.total_fees += fee;
        self.positions
            .entry(instrument.cache_token())
            .or_insert_with(|| Position::new(instrument.clone(), 0.0, 0.0))
            .apply_fill(signed, price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_move_cash_and_positions() {
        let mut portfolio = Portfolio::new(10_000.0, Instrument::usd());
        let spy = Instrument::equity("SPY");

        portfolio.apply_fill(&spy, OrderSide::Buy, 10.0, 100.0, 1.0);
        assert_eq!(portfolio.cash, 10_000.0 - 1_000.0 - 1.0);
        assert_eq!(portfolio.quantity(&spy), 10.0);

        portfolio.apply_fill(&spy, OrderSide::Sell, 10.0, 110.0, 1.0);
        assert_eq!(portfolio.cash, 10_000.0 - 1_001.0 + 1_099.0);
        assert!(portfolio.get_position(&spy).is_none());
        assert!(portfolio.positions().is_empty());
        assert_eq!(portfolio.total_fees, 2.0);
    }

    #[test]
    fn positions_iterate_in_stable_order() {
        let mut portfolio = Portfolio::new(0.0, Instrument::usd());
        portfolio.set_position(Position::new(Instrument::equity("MSFT"), 1.0, 1.0));
        portfolio.set_position(Position::new(Instrument::equity("AAPL"), 1.0, 1.0));
        let symbols: Vec<String> = portfolio
            .positions()
            .into_iter()
            .map(|p| p.instrument.symbol)
            .collect();
        assert_eq!(symbols, vec!["AAPL", "MSFT"]);
    }
}
