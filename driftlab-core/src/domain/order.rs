//! Order intents produced by the rebalance planner.
//!
//! The core never tracks fill state; an intent is handed to the order
//! transmission collaborator and forgotten.

use serde::{Deserialize, Serialize};

use super::instrument::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

/// What kind of order and its price parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    /// Fill at the current bar's open.
    Market,
    /// Fill at limit price or better.
    Limit { limit_price: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Day,
    Gtc,
}

/// An order the planner wants placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub instrument: Instrument,
    pub quote: Instrument,
    /// Always positive; direction lives in `side`.
    pub quantity: f64,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
}

impl OrderIntent {
    pub fn limit(
        instrument: Instrument,
        quote: Instrument,
        side: OrderSide,
        quantity: f64,
        limit_price: f64,
    ) -> Self {
        Self {
            instrument,
            quote,
            quantity,
            side,
            order_type: OrderType::Limit { limit_price },
            time_in_force: TimeInForce::Day,
        }
    }

    pub fn market(instrument: Instrument, quote: Instrument, side: OrderSide, quantity: f64) -> Self {
        Self {
            instrument,
            quote,
            quantity,
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
        }
    }

    pub fn signed_quantity(&self) -> f64 {
        self.quantity * self.side.sign()
    }

    pub fn limit_price(&self) -> Option<f64> {
        match self.order_type {
            OrderType::Limit { limit_price } => Some(limit_price),
            OrderType::Market => None,
        }
    }

    /// Quote-currency notional at the limit price (market orders have none).
    pub fn notional(&self) -> Option<f64> {
        self.limit_price()
            .map(|p| self.quantity * p * self.instrument.multiplier())
    }
}
