//! Two-phase rebalance planning: every sell is sized before any buy, because
//! buy sizing spends the cash the sells free up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, warn};

use super::config::RebalanceConfig;
use super::drift::{DriftRow, COVER, LIQUIDATE};
use crate::domain::{Instrument, OrderIntent, OrderSide, TickPolicy};
use crate::pricing::{PriceError, PriceResolver};

/// Where the planner gets the reference price for a row.
pub trait PriceLookup {
    fn price(&self, instrument: &Instrument) -> Result<Option<f64>, PriceError>;
}

/// Bar-open prices from the resolver at one simulated instant.
pub struct ResolverPrices<'a> {
    pub resolver: &'a PriceResolver,
    pub quote: &'a Instrument,
    pub at: DateTime<Utc>,
}

impl PriceLookup for ResolverPrices<'_> {
    fn price(&self, instrument: &Instrument) -> Result<Option<f64>, PriceError> {
        self.resolver.last_price(instrument, self.quote, self.at)
    }
}

impl PriceLookup for HashMap<Instrument, f64> {
    fn price(&self, instrument: &Instrument) -> Result<Option<f64>, PriceError> {
        Ok(self.get(instrument).copied())
    }
}

/// Why a row produced no order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    NoPrice,
    /// Held, but the valuation could not mark it.
    Unpriced,
    PriceLookupFailed(String),
    /// `only_rebalance_drifted_assets` and |drift| within threshold.
    WithinThreshold,
    ShortingDisabled,
    InsufficientCash,
    /// Sizing rounded to nothing.
    ZeroQuantity,
}

/// A drift row dropped from the plan. The rest of the plan proceeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningSkip {
    pub symbol: String,
    pub side: OrderSide,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SellPlan {
    pub orders: Vec<OrderIntent>,
    pub skips: Vec<PlanningSkip>,
    /// Proceeds if every sell fills at its limit, net of fees.
    pub estimated_proceeds: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuyPlan {
    pub orders: Vec<OrderIntent>,
    pub skips: Vec<PlanningSkip>,
    /// Notional plus fees of every buy.
    pub total_cost: f64,
    pub cash_remaining: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebalancePlan {
    pub sells: SellPlan,
    pub buys: BuyPlan,
}

impl RebalancePlan {
    /// Sells first, then buys.
    pub fn orders(&self) -> impl Iterator<Item = &OrderIntent> {
        self.sells.orders.iter().chain(self.buys.orders.iter())
    }

    pub fn skips(&self) -> impl Iterator<Item = &PlanningSkip> {
        self.sells.skips.iter().chain(self.buys.skips.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.sells.orders.is_empty() && self.buys.orders.is_empty()
    }
}

/// Turns drift rows into sized limit orders.
pub struct RebalancePlanner<'a> {
    config: &'a RebalanceConfig,
    quote: &'a Instrument,
}

impl<'a> RebalancePlanner<'a> {
    pub fn new(config: &'a RebalanceConfig, quote: &'a Instrument) -> Self {
        Self { config, quote }
    }

    /// Rows by descending |drift|; ties keep input order.
    fn ordered<'r>(&self, rows: &'r [DriftRow]) -> Vec<&'r DriftRow> {
        let mut sorted: Vec<&DriftRow> = rows
            .iter()
            .filter(|r| !r.is_quote_asset() && r.instrument() != self.quote)
            .collect();
        sorted.sort_by(|a, b| b.drift().abs().total_cmp(&a.drift().abs()));
        sorted
    }

    fn skip(&self, row: &DriftRow, side: OrderSide, reason: SkipReason) -> PlanningSkip {
        match &reason {
            SkipReason::NoPrice | SkipReason::Unpriced | SkipReason::PriceLookupFailed(_) => {
                error!(symbol = row.symbol(), ?side, ?reason, "cannot price rebalance row, skipping")
            }
            SkipReason::WithinThreshold => {
                debug!(symbol = row.symbol(), drift = row.drift(), "drift within threshold, skipping")
            }
            _ => warn!(symbol = row.symbol(), ?side, ?reason, "rebalance row skipped"),
        }
        PlanningSkip {
            symbol: row.symbol().to_string(),
            side,
            reason,
        }
    }

    /// Unpriced rows on the side they would have traded: long targets look
    /// like buys, everything else like sells.
    fn unpriced(&self, rows: &[DriftRow], side: OrderSide) -> Vec<PlanningSkip> {
        self.ordered(rows)
            .into_iter()
            .filter(|r| !r.is_priced())
            .filter(|r| {
                let wants = if r.target_weight() > 0.0 { OrderSide::Buy } else { OrderSide::Sell };
                wants == side
            })
            .map(|r| self.skip(r, side, SkipReason::Unpriced))
            .collect()
    }

    fn gated(&self, row: &DriftRow) -> bool {
        self.config.only_rebalance_drifted_assets() && !row.exceeds(self.config.threshold())
    }

    fn reference_price(&self, row: &DriftRow, prices: &dyn PriceLookup) -> Result<f64, SkipReason> {
        match prices.price(row.instrument()) {
            Ok(Some(p)) if p.is_finite() && p > 0.0 => Ok(p),
            Ok(_) => Err(SkipReason::NoPrice),
            Err(e) => Err(SkipReason::PriceLookupFailed(e.to_string())),
        }
    }

    fn lot_floor(&self, instrument: &Instrument, quantity: f64) -> f64 {
        instrument
            .validate_quantity(quantity, self.config.fractional_shares(), TickPolicy::RoundDown)
            .unwrap_or(0.0)
    }

    /// Phase one: every row with negative drift.
    ///
    /// Limit = price × (1 − slippage), rounded up to the tick. A full
    /// liquidation sells the whole position; a partial sell is floored;
    /// a fresh short is only sized when shorting is enabled.
    pub fn plan_sells(&self, rows: &[DriftRow], prices: &dyn PriceLookup) -> SellPlan {
        let mut plan = SellPlan {
            skips: self.unpriced(rows, OrderSide::Sell),
            ..SellPlan::default()
        };
        let fees = self.config.fees();

        for row in self.ordered(rows).into_iter().filter(|r| r.drift() < 0.0) {
            if self.gated(row) {
                plan.skips.push(self.skip(row, OrderSide::Sell, SkipReason::WithinThreshold));
                continue;
            }
            let price = match self.reference_price(row, prices) {
                Ok(p) => p,
                Err(reason) => {
                    plan.skips.push(self.skip(row, OrderSide::Sell, reason));
                    continue;
                }
            };
            let instrument = row.instrument();
            let limit = instrument
                .round_price_side_aware(price * (1.0 - self.config.slippage()), OrderSide::Sell);
            let unit_value = limit * instrument.multiplier();
            let current = row.current_quantity();

            let quantity = if row.drift() == LIQUIDATE && current > 0.0 {
                current
            } else if current == 0.0 {
                if !self.config.shorting() {
                    plan.skips.push(self.skip(row, OrderSide::Sell, SkipReason::ShortingDisabled));
                    continue;
                }
                self.lot_floor(instrument, row.target_value().abs() / unit_value)
            } else if current < 0.0 && !self.config.shorting() {
                plan.skips.push(self.skip(row, OrderSide::Sell, SkipReason::ShortingDisabled));
                continue;
            } else {
                let raw = (row.current_value() - row.target_value()) / unit_value;
                let floored = self.lot_floor(instrument, raw);
                if self.config.shorting() || current < 0.0 {
                    floored
                } else {
                    floored.min(current)
                }
            };

            if !(quantity > 0.0) {
                plan.skips.push(self.skip(row, OrderSide::Sell, SkipReason::ZeroQuantity));
                continue;
            }

            let notional = quantity * unit_value;
            plan.estimated_proceeds += notional - fees.fee(notional);
            plan.orders.push(OrderIntent::limit(
                instrument.clone(),
                self.quote.clone(),
                OrderSide::Sell,
                quantity,
                limit,
            ));
        }
        plan
    }

    /// Phase two: every row with positive drift, against `available_cash`.
    ///
    /// Limit = price × (1 + slippage), rounded down to the tick. The fee solve
    /// is direct since fees are linear:
    /// `affordable = (cash − flat) / (limit × multiplier × (1 + percent))`.
    pub fn plan_buys(&self, rows: &[DriftRow], available_cash: f64, prices: &dyn PriceLookup) -> BuyPlan {
        let mut cash = available_cash.max(0.0);
        let mut plan = BuyPlan {
            skips: self.unpriced(rows, OrderSide::Buy),
            ..BuyPlan::default()
        };
        let fees = self.config.fees();

        for row in self.ordered(rows).into_iter().filter(|r| r.drift() > 0.0) {
            if self.gated(row) {
                plan.skips.push(self.skip(row, OrderSide::Buy, SkipReason::WithinThreshold));
                continue;
            }
            let price = match self.reference_price(row, prices) {
                Ok(p) => p,
                Err(reason) => {
                    plan.skips.push(self.skip(row, OrderSide::Buy, reason));
                    continue;
                }
            };
            let instrument = row.instrument();
            let limit = instrument
                .round_price_side_aware(price * (1.0 + self.config.slippage()), OrderSide::Buy);
            if !(limit > 0.0) {
                plan.skips.push(self.skip(row, OrderSide::Buy, SkipReason::NoPrice));
                continue;
            }
            let unit_value = limit * instrument.multiplier();

            let affordable = (cash - fees.flat) / (unit_value * (1.0 + fees.percent));
            if !(affordable > 0.0) {
                plan.skips.push(self.skip(row, OrderSide::Buy, SkipReason::InsufficientCash));
                continue;
            }

            let current = row.current_quantity();
            let desired = if row.drift() == COVER && current < 0.0 {
                current.abs()
            } else {
                let spend = (row.target_value() - row.current_value()).min(cash);
                spend / unit_value
            };
            let quantity = self.lot_floor(instrument, desired.min(affordable));

            if !(quantity > 0.0) {
                plan.skips.push(self.skip(row, OrderSide::Buy, SkipReason::ZeroQuantity));
                continue;
            }

            let notional = quantity * unit_value;
            let cost = notional + fees.fee(notional);
            cash -= cost;
            plan.total_cost += cost;
            plan.orders.push(OrderIntent::limit(
                instrument.clone(),
                self.quote.clone(),
                OrderSide::Buy,
                quantity,
                limit,
            ));
        }
        plan.cash_remaining = cash;
        plan
    }

    /// Both phases, assuming every sell fills at its limit before the buys.
    pub fn plan(&self, rows: &[DriftRow], cash: f64, prices: &dyn PriceLookup) -> RebalancePlan {
        let sells = self.plan_sells(rows, prices);
        let buys = self.plan_buys(rows, cash + sells.estimated_proceeds, prices);
        RebalancePlan { sells, buys }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OptionRight;
    use crate::rebalance::config::{DriftMode, RebalanceSettings};
    use crate::rebalance::drift::{compute_drift, Holding};
    use chrono::NaiveDate;

    fn config(settings: RebalanceSettings) -> RebalanceConfig {
        RebalanceConfig::new(settings).unwrap()
    }

    fn default_config() -> RebalanceConfig {
        config(RebalanceSettings::default())
    }

    fn prices(entries: &[(&Instrument, f64)]) -> HashMap<Instrument, f64> {
        entries.iter().map(|(i, p)| ((*i).clone(), *p)).collect()
    }

    #[test]
    fn full_liquidation_sells_everything_at_rounded_limit() {
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let holdings = vec![Holding::new(spy.clone(), 10.0, 1_000.0)];
        let rows = compute_drift(&holdings, 0.0, &usd, &[], DriftMode::Absolute).unwrap();
        let cfg = default_config();
        let planner = RebalancePlanner::new(&cfg, &usd);

        let plan = planner.plan(&rows, 0.0, &prices(&[(&spy, 100.0)]));
        assert_eq!(plan.sells.orders.len(), 1);
        assert!(plan.buys.orders.is_empty());
        let order = &plan.sells.orders[0];
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.quantity, 10.0);
        assert_eq!(order.limit_price(), Some(99.5));
    }

    #[test]
    fn sell_limit_rounds_up_to_the_cent() {
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let holdings = vec![Holding::new(spy.clone(), 3.0, 300.03)];
        let rows = compute_drift(&holdings, 0.0, &usd, &[], DriftMode::Absolute).unwrap();
        let cfg = default_config();
        let plan = RebalancePlanner::new(&cfg, &usd).plan_sells(&rows, &prices(&[(&spy, 100.01)]));
        // 100.01 × 0.995 = 99.50995 → 99.51
        assert_eq!(plan.orders[0].limit_price(), Some(99.51));
    }

    #[test]
    fn partial_sell_floors_and_buy_uses_freed_cash() {
        let a = Instrument::equity("AAA");
        let b = Instrument::equity("BBB");
        let usd = Instrument::usd();
        let holdings = vec![
            Holding::new(a.clone(), 80.0, 8_000.0),
            Holding::new(b.clone(), 20.0, 2_000.0),
        ];
        let targets = vec![(a.clone(), 0.5), (b.clone(), 0.5)];
        let rows = compute_drift(&holdings, 0.0, &usd, &targets, DriftMode::Absolute).unwrap();
        let cfg = config(RebalanceSettings {
            acceptable_slippage: 0.0,
            drift_threshold: 0.05,
            ..RebalanceSettings::default()
        });
        let planner = RebalancePlanner::new(&cfg, &usd);
        let px = prices(&[(&a, 100.0), (&b, 100.0)]);

        let plan = planner.plan(&rows, 0.0, &px);
        // AAA: (8000 − 5000) / 100 = 30 shares.
        assert_eq!(plan.sells.orders[0].quantity, 30.0);
        assert_eq!(plan.sells.estimated_proceeds, 3_000.0);
        // BBB: min(5000 − 2000, 3000) / 100 = 30 shares.
        assert_eq!(plan.buys.orders[0].quantity, 30.0);
        assert_eq!(plan.buys.cash_remaining, 0.0);
        // Sells come first.
        let sides: Vec<OrderSide> = plan.orders().map(|o| o.side).collect();
        assert_eq!(sides, vec![OrderSide::Sell, OrderSide::Buy]);
    }

    #[test]
    fn buys_respect_fees_and_cash() {
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let targets = vec![(spy.clone(), 1.0)];
        let rows = compute_drift(&[], 1_000.0, &usd, &targets, DriftMode::Absolute).unwrap();
        let cfg = config(RebalanceSettings {
            acceptable_slippage: 0.0,
            flat_fee: 5.0,
            percent_fee: 0.01,
            ..RebalanceSettings::default()
        });
        let plan = RebalancePlanner::new(&cfg, &usd).plan_buys(&rows, 1_000.0, &prices(&[(&spy, 99.0)]));

        // affordable = (1000 − 5) / (99 × 1.01) = 9.95 → 9 shares
        assert_eq!(plan.orders[0].quantity, 9.0);
        let notional = 9.0 * 99.0;
        assert!((plan.total_cost - (notional + 5.0 + notional * 0.01)).abs() < 1e-9);
        assert!(plan.total_cost <= 1_000.0);
    }

    #[test]
    fn fractional_shares_round_to_lot() {
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let targets = vec![(spy.clone(), 1.0)];
        let rows = compute_drift(&[], 1_000.0, &usd, &targets, DriftMode::Absolute).unwrap();
        let cfg = config(RebalanceSettings {
            acceptable_slippage: 0.0,
            fractional_shares: true,
            ..RebalanceSettings::default()
        });
        let plan = RebalancePlanner::new(&cfg, &usd).plan_buys(&rows, 1_000.0, &prices(&[(&spy, 300.0)]));
        let qty = plan.orders[0].quantity;
        assert!(qty > 3.0 && qty <= 1_000.0 / 300.0);
    }

    #[test]
    fn options_size_in_contracts() {
        let call = Instrument::option(
            "SPY",
            500.0,
            NaiveDate::from_ymd_opt(2024, 6, 21).unwrap(),
            OptionRight::Call,
        );
        let usd = Instrument::usd();
        let targets = vec![(call.clone(), 0.5)];
        let rows = compute_drift(&[], 10_000.0, &usd, &targets, DriftMode::Absolute).unwrap();
        let cfg = config(RebalanceSettings {
            acceptable_slippage: 0.0,
            ..RebalanceSettings::default()
        });
        let plan = RebalancePlanner::new(&cfg, &usd).plan_buys(&rows, 10_000.0, &prices(&[(&call, 12.0)]));
        // 5000 / (12 × 100) = 4.17 → 4 contracts
        assert_eq!(plan.orders[0].quantity, 4.0);
        assert_eq!(plan.total_cost, 4_800.0);
    }

    #[test]
    fn fresh_short_needs_shorting_enabled() {
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let targets = vec![(spy.clone(), -0.5)];
        let rows = compute_drift(&[], 10_000.0, &usd, &targets, DriftMode::Absolute).unwrap();
        let px = prices(&[(&spy, 100.0)]);

        let long_only = default_config();
        let plan = RebalancePlanner::new(&long_only, &usd).plan_sells(&rows, &px);
        assert!(plan.orders.is_empty());
        assert_eq!(plan.skips[0].reason, SkipReason::ShortingDisabled);

        let shorting = config(RebalanceSettings {
            shorting: true,
            ..RebalanceSettings::default()
        });
        let plan = RebalancePlanner::new(&shorting, &usd).plan_sells(&rows, &px);
        // 5000 / 99.5 = 50.25 → 50
        assert_eq!(plan.orders[0].quantity, 50.0);
    }

    #[test]
    fn cover_buys_back_whole_short() {
        let spy = Instrument::equity("SPY");
        let usd = Instrument::usd();
        let holdings = vec![Holding::new(spy.clone(), -5.0, -500.0)];
        let rows = compute_drift(&holdings, 2_000.0, &usd, &[], DriftMode::Absolute).unwrap();
        let cfg = config(RebalanceSettings {
            shorting: true,
            ..RebalanceSettings::default()
        });
        let plan = RebalancePlanner::new(&cfg, &usd).plan(&rows, 2_000.0, &prices(&[(&spy, 100.0)]));
        assert!(plan.sells.orders.is_empty());
        assert_eq!(plan.buys.orders[0].quantity, 5.0);
        assert_eq!(plan.buys.orders[0].side, OrderSide::Buy);
    }

    #[test]
    fn unpriced_row_is_skipped_not_fatal() {
        let a = Instrument::equity("AAA");
        let b = Instrument::equity("BBB");
        let usd = Instrument::usd();
        let targets = vec![(a.clone(), 0.5), (b.clone(), 0.5)];
        let rows = compute_drift(&[], 1_000.0, &usd, &targets, DriftMode::Absolute).unwrap();
        let cfg = default_config();
        let plan = RebalancePlanner::new(&cfg, &usd).plan_buys(&rows, 1_000.0, &prices(&[(&b, 10.0)]));
        assert_eq!(plan.orders.len(), 1);
        assert_eq!(plan.orders[0].instrument, b);
        assert_eq!(plan.skips[0].symbol, "AAA");
        assert_eq!(plan.skips[0].reason, SkipReason::NoPrice);
    }

    #[test]
    fn unpriced_holding_is_not_topped_up() {
        let spy = Instrument::equity("SPY");
        let halt = Instrument::equity("HALT");
        let usd = Instrument::usd();
        let holdings = vec![Holding::new(spy.clone(), 5.0, 500.0), Holding::unpriced(halt.clone(), 40.0)];
        let targets = vec![(spy.clone(), 0.5), (halt.clone(), 0.5)];
        let rows = compute_drift(&holdings, 1_500.0, &usd, &targets, DriftMode::Absolute).unwrap();
        let cfg = default_config();
        // A stale quote for HALT exists; the planner still must not use it.
        let px = prices(&[(&spy, 100.0), (&halt, 10.0)]);

        let plan = RebalancePlanner::new(&cfg, &usd).plan(&rows, 1_500.0, &px);
        assert!(plan.orders().all(|o| o.instrument == spy));
        assert!(plan.sells.skips.is_empty());
        assert_eq!(plan.buys.skips.len(), 1);
        assert_eq!(plan.buys.skips[0].symbol, "HALT");
        assert_eq!(plan.buys.skips[0].reason, SkipReason::Unpriced);
    }

    #[test]
    fn only_drifted_assets_gate() {
        let a = Instrument::equity("AAA");
        let b = Instrument::equity("BBB");
        let usd = Instrument::usd();
        // AAA is 0.52 vs 0.5 target (within 0.05); BBB is 0.38 vs 0.5.
        let holdings = vec![
            Holding::new(a.clone(), 52.0, 5_200.0),
            Holding::new(b.clone(), 38.0, 3_800.0),
        ];
        let targets = vec![(a.clone(), 0.5), (b.clone(), 0.5)];
        let rows = compute_drift(&holdings, 1_000.0, &usd, &targets, DriftMode::Absolute).unwrap();
        let px = prices(&[(&a, 100.0), (&b, 100.0)]);

        let gated = config(RebalanceSettings {
            only_rebalance_drifted_assets: true,
            acceptable_slippage: 0.0,
            ..RebalanceSettings::default()
        });
        let plan = RebalancePlanner::new(&gated, &usd).plan(&rows, 1_000.0, &px);
        assert!(plan.sells.orders.is_empty());
        assert_eq!(plan.sells.skips[0].reason, SkipReason::WithinThreshold);
        assert_eq!(plan.buys.orders.len(), 1);

        let ungated = config(RebalanceSettings {
            acceptable_slippage: 0.0,
            ..RebalanceSettings::default()
        });
        let plan = RebalancePlanner::new(&ungated, &usd).plan(&rows, 1_000.0, &px);
        assert_eq!(plan.sells.orders.len(), 1);
    }
}
