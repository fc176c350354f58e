//! Backtest session: the clock-driven loop and the strategy lifecycle.
//!
//! Per session the loop calls `before_market_opens`, then
//! `on_trading_iteration` until the strategy closes the session or the clock
//! reaches the close, then `after_market_closes`. `initialize` runs once
//! before the first session and `on_strategy_end` runs once at the end, also
//! when the loop stops early.
//!
//! The clock owns time. A strategy only ever sees a [`ClockState`] copy and
//! ends each iteration by returning an [`IterationOutcome`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use driftlab_core::calendar::Granularity;
use driftlab_core::clock::{ClockState, IterationOutcome, Phase, SimulationClock};
use driftlab_core::data::BarSource;
use driftlab_core::domain::{Bar, Instrument, Portfolio};
use driftlab_core::rebalance::{
    drift_from_valuation, should_rebalance, BuyPlan, DriftRow, RebalancePlanner, ResolverPrices,
    SellPlan,
};
use driftlab_core::{value_portfolio, PriceError, PriceResolver, Valuation};

use crate::broker::{OrderAck, OrderTransmitter, SimulatedBroker};
use crate::config::SessionConfig;
use crate::live::ShutdownSignal;
use crate::RunError;

// ── Strategy seam ────────────────────────────────────────────────────

/// Lifecycle callbacks. Only `on_trading_iteration` is required.
pub trait Strategy {
    fn initialize(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), RunError> {
        Ok(())
    }

    fn before_market_opens(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), RunError> {
        Ok(())
    }

    fn on_trading_iteration(&mut self, ctx: &mut StrategyContext<'_>) -> Result<IterationOutcome, RunError>;

    fn after_market_closes(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), RunError> {
        Ok(())
    }

    fn on_strategy_end(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), RunError> {
        Ok(())
    }
}

/// What one `rebalance` call did.
#[derive(Debug, Clone)]
pub struct RebalanceReport {
    pub at: DateTime<Utc>,
    pub triggered: bool,
    pub valuation: Valuation,
    pub rows: Vec<DriftRow>,
    pub sells: SellPlan,
    pub buys: BuyPlan,
    pub acks: Vec<OrderAck>,
}

/// The strategy's view of the session during one callback.
pub struct StrategyContext<'a> {
    clock: ClockState,
    config: &'a SessionConfig,
    resolver: &'a PriceResolver,
    broker: &'a mut dyn OrderTransmitter,
}

impl<'a> StrategyContext<'a> {
    pub fn new(
        clock: ClockState,
        config: &'a SessionConfig,
        resolver: &'a PriceResolver,
        broker: &'a mut dyn OrderTransmitter,
    ) -> Self {
        Self {
            clock,
            config,
            resolver,
            broker,
        }
    }

    pub fn clock(&self) -> ClockState {
        self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now
    }

    pub fn config(&self) -> &SessionConfig {
        self.config
    }

    pub fn portfolio(&self) -> &Portfolio {
        self.broker.portfolio()
    }

    /// Price the simulated broker would fill at right now.
    pub fn last_price(&self, instrument: &Instrument) -> Result<Option<f64>, PriceError> {
        self.resolver.last_price(instrument, &self.config.quote, self.clock.now)
    }

    /// The last `length` completed bars. The bar whose interval contains the
    /// current time is still forming and is never included.
    ///
    /// Asking for more bars than the warm-up provides is
    /// [`PriceError::InsufficientHistory`]; strategies that start trading
    /// before their lookback is filled should match on it.
    pub fn window(
        &self,
        instrument: &Instrument,
        length: usize,
        granularity: Granularity,
        timeshift: Duration,
    ) -> Result<Vec<Bar>, PriceError> {
        self.resolver.window(
            instrument,
            &self.config.quote,
            length,
            granularity,
            self.clock.now,
            timeshift,
            true,
        )
    }

    pub fn valuation(&self) -> Valuation {
        let portfolio = self.broker.portfolio();
        value_portfolio(
            &portfolio.positions(),
            &self.config.quote,
            portfolio.cash,
            self.resolver,
            self.clock.now,
        )
    }

    pub fn drift(&self) -> Result<(Valuation, Vec<DriftRow>), RunError> {
        let valuation = self.valuation();
        let rows = drift_from_valuation(
            &self.broker.portfolio().positions(),
            &valuation,
            &self.config.quote,
            &self.config.targets,
            self.config.rebalance.drift_mode(),
        )?;
        Ok((valuation, rows))
    }

    pub fn submit(&mut self, intent: &driftlab_core::domain::OrderIntent) -> Result<OrderAck, RunError> {
        Ok(self.broker.submit(intent, self.clock.now)?)
    }

    /// Bring the portfolio back to its targets if any asset has drifted past
    /// the threshold.
    ///
    /// Sells are planned and submitted first. After the settle delay the buys
    /// are sized against the cash the broker actually reports.
    pub fn rebalance(&mut self) -> Result<RebalanceReport, RunError> {
        let (valuation, rows) = self.drift()?;
        let config = &self.config.rebalance;
        let mut report = RebalanceReport {
            at: self.clock.now,
            triggered: should_rebalance(&rows, config.threshold()),
            valuation,
            rows,
            sells: SellPlan::default(),
            buys: BuyPlan::default(),
            acks: Vec::new(),
        };
        if !report.triggered {
            return Ok(report);
        }

        let planner = RebalancePlanner::new(config, &self.config.quote);
        let prices = ResolverPrices {
            resolver: self.resolver,
            quote: &self.config.quote,
            at: self.clock.now,
        };

        report.sells = planner.plan_sells(&report.rows, &prices);
        for intent in &report.sells.orders {
            report.acks.push(self.broker.submit(intent, self.clock.now)?);
        }
        self.broker.settle(self.config.fill_settle_delay);

        let cash = self.broker.portfolio().cash;
        report.buys = planner.plan_buys(&report.rows, cash, &prices);
        for intent in &report.buys.orders {
            report.acks.push(self.broker.submit(intent, self.clock.now)?);
        }

        info!(
            at = %self.clock.now,
            sells = report.sells.orders.len(),
            buys = report.buys.orders.len(),
            filled = report.acks.iter().filter(|a| a.is_filled()).count(),
            "rebalanced"
        );
        Ok(report)
    }
}

// ── Session loop ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub at: DateTime<Utc>,
    pub cash: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Every session ran.
    Completed,
    /// The resolver ran past the end of the data.
    DataExhausted,
    /// The shutdown signal fired.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionResult {
    pub stop_reason: StopReason,
    pub final_state: ClockState,
    pub iterations: u64,
    pub sessions_run: usize,
    pub equity_curve: Vec<EquityPoint>,
    pub orders: Vec<OrderAck>,
    pub final_portfolio: Portfolio,
}

impl SessionResult {
    pub fn final_value(&self) -> Option<f64> {
        self.equity_curve.last().map(|p| p.total)
    }
}

/// One backtest over the configured range.
pub struct Session {
    config: SessionConfig,
    resolver: Arc<PriceResolver>,
    broker: SimulatedBroker,
    shutdown: Option<ShutdownSignal>,
}

impl Session {
    pub fn new(config: SessionConfig, source: Arc<dyn BarSource>) -> Self {
        let resolver = Arc::new(PriceResolver::new(config.data.clone(), config.range, source));
        Self::with_resolver(config, resolver)
    }

    pub fn with_resolver(config: SessionConfig, resolver: Arc<PriceResolver>) -> Self {
        let portfolio = Portfolio::new(config.initial_cash, config.quote.clone());
        let broker = SimulatedBroker::new(Arc::clone(&resolver), portfolio, config.rebalance.fees());
        Self {
            config,
            resolver,
            broker,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    pub fn resolver(&self) -> &Arc<PriceResolver> {
        &self.resolver
    }

    pub fn broker_mut(&mut self) -> &mut SimulatedBroker {
        &mut self.broker
    }

    fn context(&mut self, state: ClockState) -> StrategyContext<'_> {
        StrategyContext::new(state, &self.config, &self.resolver, &mut self.broker)
    }

    fn mark(&self, state: ClockState) -> EquityPoint {
        let portfolio = self.broker.portfolio();
        let valuation = value_portfolio(
            &portfolio.positions(),
            &self.config.quote,
            portfolio.cash,
            &self.resolver,
            state.now,
        );
        EquityPoint {
            at: state.now,
            cash: portfolio.cash,
            total: valuation.total,
        }
    }

    /// Run every session. `on_strategy_end` runs even when a callback fails;
    /// the callback's error is then returned.
    pub fn run(&mut self, strategy: &mut dyn Strategy) -> Result<SessionResult, RunError> {
        let calendar = self.config.calendar();
        let mut clock = SimulationClock::new(&calendar, &self.config.range, self.config.granularity());
        let mut equity_curve = Vec::new();

        let outcome = self.drive(&mut clock, strategy, &mut equity_curve);

        let end_state = clock.finish();
        let end = strategy.on_strategy_end(&mut self.context(end_state));
        let stop_reason = outcome?;
        end?;

        let sessions_run = match stop_reason {
            StopReason::Completed => clock.sessions().len(),
            _ => end_state.session_index + 1,
        };
        info!(
            ?stop_reason,
            iterations = end_state.iteration,
            sessions = sessions_run,
            "session finished"
        );
        Ok(SessionResult {
            stop_reason,
            final_state: end_state,
            iterations: end_state.iteration,
            sessions_run,
            equity_curve,
            orders: self.broker.history().to_vec(),
            final_portfolio: self.broker.portfolio().clone(),
        })
    }

    fn drive(
        &mut self,
        clock: &mut SimulationClock,
        strategy: &mut dyn Strategy,
        equity_curve: &mut Vec<EquityPoint>,
    ) -> Result<StopReason, RunError> {
        if clock.is_finished() {
            warn!(range = ?self.config.range, "no trading sessions in range");
            return Ok(StopReason::Completed);
        }
        strategy.initialize(&mut self.context(clock.state()))?;

        loop {
            if self.shutdown.as_ref().is_some_and(ShutdownSignal::is_triggered) {
                info!(at = %clock.now(), "shutdown requested, stopping session");
                return Ok(StopReason::Shutdown);
            }
            let state = clock.state();
            match state.phase {
                Phase::BeforeOpen => {
                    strategy.before_market_opens(&mut self.context(state))?;
                    clock.advance_phase()?;
                }
                Phase::Trading => {
                    let outcome = match strategy.on_trading_iteration(&mut self.context(state)) {
                        Ok(outcome) => outcome,
                        Err(RunError::Price(PriceError::OutOfRange { at, last: Some(last), .. }))
                            if at > last =>
                        {
                            info!(%at, %last, "ran past the end of the data, finishing early");
                            return Ok(StopReason::DataExhausted);
                        }
                        Err(e) => return Err(e),
                    };
                    equity_curve.push(self.mark(state));
                    clock.complete_iteration(outcome)?;
                }
                Phase::AfterClose => {
                    strategy.after_market_closes(&mut self.context(state))?;
                    clock.advance_phase()?;
                }
                Phase::SessionComplete => {
                    clock.advance_phase()?;
                }
                Phase::Finished => return Ok(StopReason::Completed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionFile;
    use driftlab_core::calendar::Market;
    use driftlab_core::data::SyntheticSource;

    fn config(dir: &std::path::Path, end: &str) -> SessionConfig {
        let mut file = SessionFile::default();
        file.session.start = Some("2024-01-02".into());
        file.session.end = Some(end.into());
        file.data.cache_dir = dir.to_path_buf();
        file.data.provider = "synthetic".into();
        file.validate().unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
    }

    impl Strategy for Recorder {
        fn initialize(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), RunError> {
            self.calls.push("initialize");
            Ok(())
        }

        fn before_market_opens(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), RunError> {
            self.calls.push("before_market_opens");
            Ok(())
        }

        fn on_trading_iteration(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<IterationOutcome, RunError> {
            self.calls.push("on_trading_iteration");
            Ok(IterationOutcome::one_tick())
        }

        fn after_market_closes(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), RunError> {
            self.calls.push("after_market_closes");
            Ok(())
        }

        fn on_strategy_end(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), RunError> {
            self.calls.push("on_strategy_end");
            Ok(())
        }
    }

    #[test]
    fn callbacks_run_in_lifecycle_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(config(dir.path(), "2024-01-03"), Arc::new(SyntheticSource::new(Market::Nyse)));
        let mut strategy = Recorder::default();
        let result = session.run(&mut strategy).unwrap();

        assert_eq!(
            strategy.calls,
            vec![
                "initialize",
                "before_market_opens",
                "on_trading_iteration",
                "after_market_closes",
                "before_market_opens",
                "on_trading_iteration",
                "after_market_closes",
                "on_strategy_end",
            ]
        );
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.sessions_run, 2);
        assert_eq!(result.equity_curve.len(), 2);
        assert_eq!(result.final_value(), Some(100_000.0));
    }

    struct Failing;

    impl Strategy for Failing {
        fn on_trading_iteration(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<IterationOutcome, RunError> {
            Err(RunError::Strategy("boom".into()))
        }
    }

    #[test]
    fn callback_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(config(dir.path(), "2024-01-03"), Arc::new(SyntheticSource::new(Market::Nyse)));
        assert!(matches!(session.run(&mut Failing), Err(RunError::Strategy(_))));
    }

    /// Reads the last completed bar each iteration, tolerating a short
    /// warm-up.
    #[derive(Default)]
    struct LastBar {
        shortfalls: usize,
        seen: Vec<(DateTime<Utc>, Bar)>,
    }

    impl Strategy for LastBar {
        fn on_trading_iteration(&mut self, ctx: &mut StrategyContext<'_>) -> Result<IterationOutcome, RunError> {
            let granularity = ctx.config().granularity();
            match ctx.window(&Instrument::equity("SPY"), 1, granularity, Duration::zero()) {
                Ok(mut bars) => self.seen.extend(bars.pop().map(|bar| (ctx.now(), bar))),
                Err(PriceError::InsufficientHistory { .. }) => self.shortfalls += 1,
                Err(e) => return Err(e.into()),
            }
            Ok(if granularity == Granularity::Minute && !self.seen.is_empty() {
                IterationOutcome::CloseSession
            } else {
                IterationOutcome::one_tick()
            })
        }
    }

    fn minute_config(dir: &std::path::Path) -> SessionConfig {
        let mut file = SessionFile::default();
        file.session.start = Some("2024-01-02".into());
        file.session.end = Some("2024-01-02".into());
        file.data.granularity = "minute".into();
        file.data.cache_dir = dir.to_path_buf();
        file.data.provider = "synthetic".into();
        file.validate().unwrap()
    }

    #[test]
    fn warmup_shortfall_is_not_end_of_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(minute_config(dir.path()), Arc::new(SyntheticSource::new(Market::Nyse)));
        let mut strategy = LastBar::default();
        let result = session.run(&mut strategy).unwrap();

        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(strategy.shortfalls, 1);
        assert_eq!(result.iterations, 2);
        let (now, bar) = &strategy.seen[0];
        assert_eq!(bar.timestamp + Duration::minutes(1), *now);
    }

    #[test]
    fn unhandled_warmup_shortfall_is_an_error() {
        struct Impatient;
        impl Strategy for Impatient {
            fn on_trading_iteration(&mut self, ctx: &mut StrategyContext<'_>) -> Result<IterationOutcome, RunError> {
                ctx.window(&Instrument::equity("SPY"), 1, Granularity::Minute, Duration::zero())?;
                Ok(IterationOutcome::one_tick())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(minute_config(dir.path()), Arc::new(SyntheticSource::new(Market::Nyse)));
        let err = session.run(&mut Impatient).unwrap_err();
        assert!(
            matches!(
                err,
                RunError::Price(PriceError::InsufficientHistory { requested: 1, available: 0 })
            ),
            "{err}"
        );
    }

    #[test]
    fn daily_window_never_shows_todays_bar() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(config(dir.path(), "2024-01-05"), Arc::new(SyntheticSource::new(Market::Nyse)));
        let mut strategy = LastBar::default();
        let result = session.run(&mut strategy).unwrap();

        assert_eq!(result.stop_reason, StopReason::Completed);
        // Jan 2 has nothing completed before it; Jan 3-5 each see the prior day.
        assert_eq!(strategy.shortfalls, 1);
        assert_eq!(strategy.seen.len(), 3);
        for (now, bar) in &strategy.seen {
            assert!(!bar.covers(*now, Duration::days(1)), "{} covers {now}", bar.timestamp);
            assert!(*now - bar.timestamp < Duration::days(2));
        }
    }

    #[test]
    fn shutdown_stops_before_the_first_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut session = Session::new(config(dir.path(), "2024-01-31"), Arc::new(SyntheticSource::new(Market::Nyse)))
            .with_shutdown(signal);
        let mut strategy = Recorder::default();
        let result = session.run(&mut strategy).unwrap();
        assert_eq!(result.stop_reason, StopReason::Shutdown);
        assert_eq!(result.iterations, 0);
        assert_eq!(strategy.calls, vec!["initialize", "on_strategy_end"]);
    }
}
