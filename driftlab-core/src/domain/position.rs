use serde::{Deserialize, Serialize};

use super::instrument::Instrument;

/// Holding in one instrument. Mutated only by fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: Instrument,
    /// Signed: negative quantities are short.
    pub quantity: f64,
    pub avg_fill_price: f64,
}

impl Position {
    pub fn new(instrument: Instrument, quantity: f64, avg_fill_price: f64) -> Self {
        Self {
            instrument,
            quantity,
            avg_fill_price,
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > 0.0
    }

    pub fn is_short(&self) -> bool {
        self.quantity < 0.0
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }

    pub fn market_value(&self, current_price: f64) -> f64 {
        self.quantity * current_price * self.instrument.multiplier()
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        self.quantity * (current_price - self.avg_fill_price) * self.instrument.multiplier()
    }

    /// Apply a signed fill, keeping a volume-weighted average price while the
    /// position grows and resetting it when the position flips sides.
    pub fn apply_fill(&mut self, signed_qty: f64, price: f64) {
        let new_qty = self.quantity + signed_qty;
        let same_direction = self.quantity == 0.0 || self.quantity.signum() == signed_qty.signum();
        if same_direction {
            let total_cost = self.quantity * self.avg_fill_price + signed_qty * price;
            self.avg_fill_price = if new_qty != 0.0 { total_cost / new_qty } else { 0.0 };
        } else if new_qty != 0.0 && new_qty.signum() != self.quantity.signum() {
            // Crossed through flat: the remainder was opened at this price.
            self.avg_fill_price = price;
        }
        self.quantity = new_qty;
        if self.quantity == 0.0 {
            self.avg_fill_price = 0.0;
        }
    }
}
