//! Session configuration: the TOML file and its validated form.
//!
//! The file is deserialized into [`SessionFile`] (plain strings and numbers)
//! and then validated once into [`SessionConfig`]. Nothing downstream sees
//! an unvalidated value.
//!
//! ```toml
//! [session]
//! start = "2024-01-02"
//! end = "2024-03-28T16:00:00-04:00"
//! initial_cash = 100000.0
//!
//! [data]
//! market = "nyse"
//! granularity = "day"
//! timezone = "America/New_York"
//! warmup_sessions = 20
//!
//! [rebalance]
//! drift_threshold = 0.05
//! acceptable_slippage = 0.005
//!
//! [[targets]]
//! symbol = "SPY"
//! weight = 0.6
//! ```

use chrono::{DateTime, NaiveDate, Offset, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use driftlab_core::calendar::{DateRange, Granularity, Market};
use driftlab_core::config::{parse_timezone, ConfigError, DataSettings};
use driftlab_core::domain::{Instrument, OptionRight};
use driftlab_core::rebalance::{RebalanceConfig, RebalanceSettings};

// ── Raw file ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFile {
    pub session: SessionSection,
    pub data: DataSection,
    pub rebalance: RebalanceSettings,
    pub targets: Vec<TargetSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// `YYYY-MM-DD` or RFC 3339 with an offset.
    pub start: Option<String>,
    pub end: Option<String>,
    pub initial_cash: f64,
    /// Quote currency symbol.
    pub quote: String,
    /// Pause between the sell and buy phases of a rebalance.
    pub fill_settle_delay_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            initial_cash: 100_000.0,
            quote: "USD".to_string(),
            fill_settle_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    pub market: String,
    pub granularity: String,
    /// Defaults to the market's exchange timezone.
    pub timezone: Option<String>,
    pub warmup_sessions: usize,
    pub auto_adjust: bool,
    pub cache_dir: PathBuf,
    pub provider: String,
    pub max_age_secs: Option<u64>,
    pub force_refresh: bool,
    pub allow_quote_fallback: bool,
}

impl Default for DataSection {
    fn default() -> Self {
        let settings = DataSettings::default();
        Self {
            market: settings.market.as_str().to_string(),
            granularity: settings.granularity.as_str().to_string(),
            timezone: None,
            warmup_sessions: settings.warmup_sessions,
            auto_adjust: settings.auto_adjust,
            cache_dir: settings.cache_dir,
            provider: settings.provider,
            max_age_secs: settings.max_age_secs,
            force_refresh: settings.force_refresh,
            allow_quote_fallback: settings.allow_quote_fallback,
        }
    }
}

/// One target allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub symbol: String,
    pub weight: f64,
    #[serde(default)]
    pub asset: AssetSpec,
    /// Options only.
    #[serde(default)]
    pub strike: Option<f64>,
    /// Options and dated futures.
    #[serde(default)]
    pub expiry: Option<NaiveDate>,
    #[serde(default)]
    pub right: Option<RightSpec>,
    /// Futures only.
    #[serde(default)]
    pub multiplier: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetSpec {
    #[default]
    Equity,
    Crypto,
    Forex,
    Option,
    Future,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RightSpec {
    Call,
    Put,
}

impl TargetSpec {
    fn instrument(&self) -> Result<Instrument, ConfigError> {
        let instrument = match self.asset {
            AssetSpec::Equity => Instrument::equity(&self.symbol),
            AssetSpec::Crypto => Instrument::crypto(&self.symbol),
            AssetSpec::Forex => Instrument::forex(&self.symbol),
            AssetSpec::Option => {
                let expiry = self.expiry.ok_or(ConfigError::MissingDate("targets.expiry"))?;
                let right = match self.right {
                    Some(RightSpec::Put) => OptionRight::Put,
                    _ => OptionRight::Call,
                };
                Instrument::option(&self.symbol, self.strike.unwrap_or(f64::NAN), expiry, right)
            }
            AssetSpec::Future => {
                Instrument::future(&self.symbol, self.expiry, self.multiplier.unwrap_or(1.0))
            }
        };
        instrument.validate()?;
        Ok(instrument)
    }
}

// ── Validated config ─────────────────────────────────────────────────

/// Everything a session needs, checked.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub range: DateRange,
    pub data: DataSettings,
    pub rebalance: RebalanceConfig,
    pub targets: Vec<(Instrument, f64)>,
    pub quote: Instrument,
    pub initial_cash: f64,
    pub fill_settle_delay: Duration,
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: SessionFile = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        file.validate()
    }

    pub fn calendar(&self) -> driftlab_core::TradingCalendar {
        self.data.calendar()
    }

    pub fn granularity(&self) -> Granularity {
        self.data.granularity
    }
}

impl SessionFile {
    /// Validate every field. The first problem found is returned.
    pub fn validate(self) -> Result<SessionConfig, ConfigError> {
        let market: Market = self.data.market.parse()?;
        let granularity: Granularity = self.data.granularity.parse()?;
        let timezone = match &self.data.timezone {
            Some(name) => parse_timezone(name)?,
            None => default_timezone(market),
        };

        let start = self
            .session
            .start
            .as_deref()
            .ok_or(ConfigError::MissingDate("session.start"))
            .and_then(|s| parse_session_date("session.start", s, timezone))?;
        let end = self
            .session
            .end
            .as_deref()
            .ok_or(ConfigError::MissingDate("session.end"))
            .and_then(|s| parse_session_date("session.end", s, timezone))?;
        if start > end {
            return Err(ConfigError::InvertedRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }

        let initial_cash = self.session.initial_cash;
        if !(initial_cash.is_finite() && initial_cash >= 0.0) {
            return Err(ConfigError::NegativeValue {
                field: "session.initial_cash",
                value: initial_cash,
            });
        }

        let quote = Instrument::forex(self.session.quote.trim());
        quote.validate()?;

        let rebalance = RebalanceConfig::new(self.rebalance)?;

        let mut targets = Vec::with_capacity(self.targets.len());
        for spec in &self.targets {
            if !spec.weight.is_finite() || spec.weight.abs() > 1.0 {
                return Err(ConfigError::InvalidWeight {
                    symbol: spec.symbol.clone(),
                    weight: spec.weight,
                });
            }
            targets.push((spec.instrument()?, spec.weight));
        }

        let data = DataSettings {
            market,
            granularity,
            timezone,
            warmup_sessions: self.data.warmup_sessions,
            auto_adjust: self.data.auto_adjust,
            cache_dir: self.data.cache_dir,
            provider: self.data.provider,
            max_age_secs: self.data.max_age_secs,
            force_refresh: self.data.force_refresh,
            allow_quote_fallback: self.data.allow_quote_fallback,
        };

        Ok(SessionConfig {
            range: DateRange::new(start, end),
            data,
            rebalance,
            targets,
            quote,
            initial_cash,
            fill_settle_delay: Duration::from_millis(self.session.fill_settle_delay_ms),
        })
    }
}

fn default_timezone(market: Market) -> Tz {
    match market {
        Market::Nyse => chrono_tz::America::New_York,
        Market::Crypto | Market::Forex => chrono_tz::UTC,
    }
}

/// A plain date, or an RFC 3339 timestamp whose offset must agree with the
/// session timezone at that instant. Returns the local date.
fn parse_session_date(field: &'static str, value: &str, tz: Tz) -> Result<NaiveDate, ConfigError> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date);
    }
    let stamped = DateTime::parse_from_rfc3339(value)
        .map_err(|e| ConfigError::Parse(format!("{field}: '{value}' is not a date or RFC 3339 timestamp: {e}")))?;
    let expected = tz.offset_from_utc_datetime(&stamped.naive_utc()).fix();
    if *stamped.offset() != expected {
        return Err(ConfigError::TimezoneMismatch {
            field,
            tz: tz.name().to_string(),
            found: stamped.offset().to_string(),
            expected: expected.to_string(),
        });
    }
    Ok(stamped.with_timezone(&tz).date_naive())
}
