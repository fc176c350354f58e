//! Order transmission: the broker seam and the simulated fill model.
//!
//! Fill rules for [`SimulatedBroker`]:
//! - Fill price is the open of the bar containing the clock time, the same
//!   price the resolver reports as "current".
//! - Limit buys fill when open <= limit, limit sells when open >= limit.
//!   A day order that is not marketable expires unfilled.
//! - Fees come from the session's linear fee model.
//! - A buy that would take cash below zero is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use driftlab_core::domain::{OrderIntent, OrderSide, Portfolio};
use driftlab_core::rebalance::FeeModel;
use driftlab_core::{PriceError, PriceResolver};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no price for {symbol} at {at}")]
    NoPrice { symbol: String, at: DateTime<Utc> },

    #[error("order quantity must be positive and finite, got {0}")]
    InvalidQuantity(f64),

    #[error(transparent)]
    Price(#[from] PriceError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled { price: f64, fee: f64 },
    /// Limit not marketable at the fill price; the day order lapsed.
    Expired { market_price: f64 },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub intent: OrderIntent,
    pub at: DateTime<Utc>,
    pub status: OrderStatus,
}

impl OrderAck {
    pub fn is_filled(&self) -> bool {
        matches!(self.status, OrderStatus::Filled { .. })
    }
}

/// The broker collaborator. Orders are submitted once; there are no retries.
pub trait OrderTransmitter {
    fn submit(&mut self, intent: &OrderIntent, at: DateTime<Utc>) -> Result<OrderAck, BrokerError>;

    /// Called between the sell and buy phases of a rebalance.
    fn settle(&mut self, _delay: Duration) {}

    /// Holdings and cash as the broker sees them.
    fn portfolio(&self) -> &Portfolio;
}

/// Fills against historical bars.
pub struct SimulatedBroker {
    resolver: Arc<PriceResolver>,
    fees: FeeModel,
    portfolio: Portfolio,
    history: Vec<OrderAck>,
}

impl SimulatedBroker {
    pub fn new(resolver: Arc<PriceResolver>, portfolio: Portfolio, fees: FeeModel) -> Self {
        Self {
            resolver,
            fees,
            portfolio,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[OrderAck] {
        &self.history
    }

    pub fn portfolio_mut(&mut self) -> &mut Portfolio {
        &mut self.portfolio
    }

    fn marketable(intent: &OrderIntent, price: f64) -> bool {
        match (intent.limit_price(), intent.side) {
            (None, _) => true,
            (Some(limit), OrderSide::Buy) => price <= limit,
            (Some(limit), OrderSide::Sell) => price >= limit,
        }
    }

    fn status_for(&mut self, intent: &OrderIntent, at: DateTime<Utc>) -> Result<OrderStatus, BrokerError> {
        let price = self
            .resolver
            .last_price(&intent.instrument, &intent.quote, at)?
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| BrokerError::NoPrice {
                symbol: intent.instrument.to_string(),
                at,
            })?;

        if !Self::marketable(intent, price) {
            return Ok(OrderStatus::Expired { market_price: price });
        }

        let notional = intent.quantity * price * intent.instrument.multiplier();
        let fee = self.fees.fee(notional);
        if intent.side == OrderSide::Buy && notional + fee > self.portfolio.cash + 1e-9 {
            return Ok(OrderStatus::Rejected {
                reason: format!(
                    "insufficient cash: need {:.2}, have {:.2}",
                    notional + fee,
                    self.portfolio.cash
                ),
            });
        }

        self.portfolio
            .apply_fill(&intent.instrument, intent.side, intent.quantity, price, fee);
        Ok(OrderStatus::Filled { price, fee })
    }
}

impl OrderTransmitter for SimulatedBroker {
    fn submit(&mut self, intent: &OrderIntent, at: DateTime<Utc>) -> Result<OrderAck, BrokerError> {
        if !(intent.quantity.is_finite() && intent.quantity > 0.0) {
            return Err(BrokerError::InvalidQuantity(intent.quantity));
        }
        let status = self.status_for(intent, at)?;
        match &status {
            OrderStatus::Filled { price, fee } => info!(
                symbol = %intent.instrument,
                side = ?intent.side,
                quantity = intent.quantity,
                price,
                fee,
                "order filled"
            ),
            other => debug!(symbol = %intent.instrument, status = ?other, "order not filled"),
        }
        let ack = OrderAck {
            intent: intent.clone(),
            at,
            status,
        };
        self.history.push(ack.clone());
        Ok(ack)
    }

    /// Simulated fills are immediate; there is nothing to wait for.
    fn settle(&mut self, delay: Duration) {
        debug!(delay_ms = delay.as_millis() as u64, "settle delay skipped in simulation");
    }

    fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }
}
