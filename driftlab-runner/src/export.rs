//! Session artifacts: a JSON summary plus CSV equity curve and order tape.
//!
//! Persisted summaries carry a `schema_version`. Newer versions are rejected
//! on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use driftlab_core::domain::Position;

use crate::broker::{OrderAck, OrderStatus};
use crate::session::{EquityPoint, SessionResult, StopReason};
use crate::RunError;

/// Current schema version for persisted artifacts.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Headline numbers for one finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub stop_reason: StopReason,
    pub finished_at: DateTime<Utc>,
    pub sessions_run: usize,
    pub iterations: u64,
    pub initial_cash: f64,
    pub final_cash: f64,
    pub final_value: f64,
    pub total_return: f64,
    pub total_fees: f64,
    pub orders_filled: usize,
    pub orders_unfilled: usize,
    pub positions: Vec<Position>,
}

impl ResultSummary {
    pub fn from_result(result: &SessionResult) -> Self {
        let portfolio = &result.final_portfolio;
        let initial_cash = portfolio.initial_capital;
        let final_value = result.final_value().unwrap_or(portfolio.cash);
        let filled = result.orders.iter().filter(|a| a.is_filled()).count();
        Self {
            schema_version: SCHEMA_VERSION,
            stop_reason: result.stop_reason,
            finished_at: result.final_state.now,
            sessions_run: result.sessions_run,
            iterations: result.iterations,
            initial_cash,
            final_cash: portfolio.cash,
            final_value,
            total_return: if initial_cash > 0.0 {
                final_value / initial_cash - 1.0
            } else {
                0.0
            },
            total_fees: portfolio.total_fees,
            orders_filled: filled,
            orders_unfilled: result.orders.len() - filled,
            positions: portfolio.positions(),
        }
    }

    pub fn to_json(&self) -> Result<String, RunError> {
        serde_json::to_string_pretty(self).map_err(|e| RunError::Export(format!("summary to JSON: {e}")))
    }

    /// Parse a summary, rejecting schema versions newer than this build.
    pub fn from_json(json: &str) -> Result<Self, RunError> {
        let summary: Self =
            serde_json::from_str(json).map_err(|e| RunError::Export(format!("summary from JSON: {e}")))?;
        if summary.schema_version > SCHEMA_VERSION {
            return Err(RunError::Export(format!(
                "unsupported schema version {} (max supported: {SCHEMA_VERSION})",
                summary.schema_version
            )));
        }
        Ok(summary)
    }
}

fn csv_err(e: impl std::fmt::Display) -> RunError {
    RunError::Export(format!("csv: {e}"))
}

fn finish(wtr: csv::Writer<Vec<u8>>) -> Result<String, RunError> {
    let data = wtr.into_inner().map_err(csv_err)?;
    String::from_utf8(data).map_err(csv_err)
}

/// Columns: timestamp, cash, total.
pub fn equity_curve_csv(points: &[EquityPoint]) -> Result<String, RunError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["timestamp", "cash", "total"]).map_err(csv_err)?;
    for p in points {
        wtr.write_record([
            p.at.to_rfc3339(),
            format!("{:.2}", p.cash),
            format!("{:.2}", p.total),
        ])
        .map_err(csv_err)?;
    }
    finish(wtr)
}

/// Columns: timestamp, symbol, side, quantity, limit_price, status, price, fee, detail.
pub fn orders_csv(acks: &[OrderAck]) -> Result<String, RunError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "timestamp",
        "symbol",
        "side",
        "quantity",
        "limit_price",
        "status",
        "price",
        "fee",
        "detail",
    ])
    .map_err(csv_err)?;

    for ack in acks {
        let (status, price, fee, detail) = match &ack.status {
            OrderStatus::Filled { price, fee } => ("filled", format!("{price:.6}"), format!("{fee:.2}"), String::new()),
            OrderStatus::Expired { market_price } => {
                ("expired", format!("{market_price:.6}"), String::new(), String::new())
            }
            OrderStatus::Rejected { reason } => ("rejected", String::new(), String::new(), reason.clone()),
        };
        wtr.write_record([
            ack.at.to_rfc3339(),
            ack.intent.instrument.to_string(),
            format!("{:?}", ack.intent.side),
            format!("{:.6}", ack.intent.quantity),
            ack.intent.limit_price().map(|p| format!("{p:.6}")).unwrap_or_default(),
            status.to_string(),
            price,
            fee,
            detail,
        ])
        .map_err(csv_err)?;
    }
    finish(wtr)
}

/// Write `summary.json`, `equity.csv` and `orders.csv` under
/// `output_dir/{name}/`. Returns the run directory.
pub fn save_artifacts(result: &SessionResult, output_dir: &Path, name: &str) -> Result<PathBuf, RunError> {
    let run_dir = output_dir.join(name);
    let io = |e: std::io::Error| RunError::Export(format!("{}: {e}", run_dir.display()));
    std::fs::create_dir_all(&run_dir).map_err(io)?;

    std::fs::write(run_dir.join("summary.json"), ResultSummary::from_result(result).to_json()?).map_err(io)?;
    std::fs::write(run_dir.join("equity.csv"), equity_curve_csv(&result.equity_curve)?).map_err(io)?;
    std::fs::write(run_dir.join("orders.csv"), orders_csv(&result.orders)?).map_err(io)?;
    Ok(run_dir)
}

/// Read back `summary.json` from a run directory.
pub fn load_summary(run_dir: &Path) -> Result<ResultSummary, RunError> {
    let path = run_dir.join("summary.json");
    let json = std::fs::read_to_string(&path)
        .map_err(|e| RunError::Export(format!("failed to read {}: {e}", path.display())))?;
    ResultSummary::from_json(&json)
}
