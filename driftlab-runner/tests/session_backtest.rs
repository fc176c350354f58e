//! End-to-end sessions: config file → data source → session loop → broker
//! → artifacts.

use chrono::Duration;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use driftlab_core::calendar::{Granularity, Market};
use driftlab_core::clock::IterationOutcome;
use driftlab_core::data::SyntheticSource;
use driftlab_core::domain::Instrument;
use driftlab_runner::{
    load_summary, prefetch_parallel, save_artifacts, CsvBarSource, OrderStatus, RebalanceReport,
    RunError, Session, SessionConfig, StopReason, Strategy, StrategyContext,
};

fn toml_config(cache_dir: &Path, provider: &str, end: &str, targets: &str) -> String {
    format!(
        r#"
[session]
start = "2024-01-02"
end = "{end}"
initial_cash = 100000.0

[data]
market = "nyse"
granularity = "day"
cache_dir = "{}"
provider = "{provider}"

[rebalance]
drift_mode = "absolute"
drift_threshold = 0.05
acceptable_slippage = 0.005

{targets}
"#,
        cache_dir.display()
    )
}

const SIXTY_FORTY: &str = r#"
[[targets]]
symbol = "SPY"
weight = 0.6

[[targets]]
symbol = "TLT"
weight = 0.4
"#;

/// Checks drift once per session and rebalances when it is past threshold.
#[derive(Default)]
struct DailyRebalancer {
    reports: Vec<RebalanceReport>,
    ended: bool,
}

impl Strategy for DailyRebalancer {
    fn on_trading_iteration(&mut self, ctx: &mut StrategyContext<'_>) -> Result<IterationOutcome, RunError> {
        self.reports.push(ctx.rebalance()?);
        Ok(IterationOutcome::CloseSession)
    }

    fn on_strategy_end(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), RunError> {
        self.ended = true;
        Ok(())
    }
}

#[test]
fn sixty_forty_on_synthetic_data() {
    let dir = tempfile::tempdir().unwrap();
    let config =
        SessionConfig::from_toml_str(&toml_config(dir.path(), "synthetic", "2024-01-31", SIXTY_FORTY)).unwrap();
    let targets: Vec<Instrument> = config.targets.iter().map(|(i, _)| i.clone()).collect();
    let quote = config.quote.clone();

    let mut session = Session::new(config, Arc::new(SyntheticSource::new(Market::Nyse)));
    let prefetch = prefetch_parallel(session.resolver(), &targets, &quote, &[Granularity::Day]);
    assert!(prefetch.is_complete());
    assert_eq!(prefetch.loaded.len(), 2);

    let mut strategy = DailyRebalancer::default();
    let result = session.run(&mut strategy).unwrap();

    assert!(strategy.ended);
    assert_eq!(result.stop_reason, StopReason::Completed);
    // NYSE sessions Jan 2-31, 2024 (New Year and MLK day closed).
    assert_eq!(result.sessions_run, 21);
    assert_eq!(result.equity_curve.len(), 21);
    assert_eq!(strategy.reports.len(), 21);

    // All cash at the start: both targets are unheld and drift by their full weight.
    let first = &strategy.reports[0];
    assert!(first.triggered);
    assert!(first.sells.orders.is_empty());
    assert_eq!(first.buys.orders.len(), 2);
    assert!(first.acks.iter().all(|a| a.is_filled()));

    let spy = Instrument::equity("SPY");
    let tlt = Instrument::equity("TLT");
    assert!(result.final_portfolio.quantity(&spy) > 0.0);
    assert!(result.final_portfolio.quantity(&tlt) > 0.0);
    assert!(result.final_portfolio.cash >= 0.0);
    assert!(result
        .orders
        .iter()
        .all(|a| !matches!(a.status, OrderStatus::Rejected { .. })));

    // Just after the first rebalance every weight sits inside the threshold.
    let second = &strategy.reports[1];
    for row in second.rows.iter().filter(|r| !r.is_quote_asset()) {
        assert!(
            (row.current_weight() - row.target_weight()).abs() < 0.05,
            "{} at {:.4} vs {:.4}",
            row.symbol(),
            row.current_weight(),
            row.target_weight()
        );
    }

    // Total value only moves with prices; nothing leaks.
    let total = result.final_value().unwrap();
    assert!(total > 50_000.0 && total < 200_000.0, "total {total}");

    let run_dir = save_artifacts(&result, dir.path(), "sixty_forty").unwrap();
    let summary = load_summary(&run_dir).unwrap();
    assert_eq!(summary.sessions_run, 21);
    assert_eq!(summary.orders_filled + summary.orders_unfilled, result.orders.len());
    assert!((summary.final_value - total).abs() < 1e-6);
}

fn write_spy_csv(dir: &Path) {
    fs::write(
        dir.join("SPY.csv"),
        "timestamp,open,high,low,close,volume\n\
         2024-01-02,100,101,99,100.5,1000\n\
         2024-01-03,100.5,102,100,101,1200\n\
         2024-01-04,101,101.5,100,100.8,900\n\
         2024-01-05,100.8,101,100.2,100.9,1100\n",
    )
    .unwrap();
}

/// Rebalances on the first iteration only.
#[derive(Default)]
struct BuyOnce {
    done: bool,
}

impl Strategy for BuyOnce {
    fn on_trading_iteration(&mut self, ctx: &mut StrategyContext<'_>) -> Result<IterationOutcome, RunError> {
        if !self.done {
            ctx.rebalance()?;
            self.done = true;
        }
        Ok(IterationOutcome::one_tick())
    }
}

#[test]
fn csv_file_session_fills_at_the_open() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("bars");
    fs::create_dir_all(&data_dir).unwrap();
    write_spy_csv(&data_dir);

    let config_path = dir.path().join("session.toml");
    let targets = "[[targets]]\nsymbol = \"SPY\"\nweight = 1.0\n";
    let text = toml_config(&dir.path().join("cache"), "csv", "2024-01-05", targets)
        .replace("initial_cash = 100000.0", "initial_cash = 10000.0");
    fs::write(&config_path, text).unwrap();
    let config = SessionConfig::load(&config_path).unwrap();

    let mut session = Session::new(config, Arc::new(CsvBarSource::new(&data_dir)));
    let result = session.run(&mut BuyOnce::default()).unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    assert_eq!(result.sessions_run, 4);
    assert_eq!(result.orders.len(), 1);
    // limit 100.50, 10_000 / 100.50 floors to 99 whole shares, filled at the 100.00 open.
    assert_eq!(result.orders[0].status, OrderStatus::Filled { price: 100.0, fee: 0.0 });
    let spy = Instrument::equity("SPY");
    assert_eq!(result.final_portfolio.quantity(&spy), 99.0);
    assert!((result.final_portfolio.cash - 100.0).abs() < 1e-9);

    // Marked at each day's open: last point is Jan 5 at 100.8.
    let last = result.equity_curve.last().unwrap();
    assert!((last.total - (100.0 + 99.0 * 100.8)).abs() < 1e-6);
}

/// Looks further ahead than the data reaches.
struct PeekAhead;

impl Strategy for PeekAhead {
    fn on_trading_iteration(&mut self, ctx: &mut StrategyContext<'_>) -> Result<IterationOutcome, RunError> {
        let spy = Instrument::equity("SPY");
        ctx.window(&spy, 1, Granularity::Day, Duration::days(-30))?;
        Ok(IterationOutcome::one_tick())
    }
}

#[test]
fn running_past_the_data_ends_the_session_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig::from_toml_str(&toml_config(
        dir.path(),
        "synthetic",
        "2024-01-12",
        "[[targets]]\nsymbol = \"SPY\"\nweight = 1.0\n",
    ))
    .unwrap();
    let mut session = Session::new(config, Arc::new(SyntheticSource::new(Market::Nyse)));
    let result = session.run(&mut PeekAhead).unwrap();

    assert_eq!(result.stop_reason, StopReason::DataExhausted);
    assert_eq!(result.sessions_run, 1);
    assert!(result.equity_curve.is_empty());
}

#[test]
fn missing_csv_symbol_surfaces_as_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig::from_toml_str(&toml_config(
        &dir.path().join("cache"),
        "csv",
        "2024-01-05",
        "[[targets]]\nsymbol = \"QQQ\"\nweight = 1.0\n",
    ))
    .unwrap();
    let mut session = Session::new(config, Arc::new(CsvBarSource::new(dir.path())));

    // Valuation falls back quietly; the explicit price query does not.
    struct AskPrice;
    impl Strategy for AskPrice {
        fn on_trading_iteration(&mut self, ctx: &mut StrategyContext<'_>) -> Result<IterationOutcome, RunError> {
            ctx.last_price(&Instrument::equity("QQQ"))?;
            Ok(IterationOutcome::CloseSession)
        }
    }
    let err = session.run(&mut AskPrice).unwrap_err();
    assert!(matches!(err, RunError::Price(_)), "{err}");
}
