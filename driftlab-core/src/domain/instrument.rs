//! Instrument identity, contract multipliers, and tick/lot rounding.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

use super::order::OrderSide;

/// Tolerance used when snapping a price or quantity onto its grid.
///
/// `99.5 / 0.01` is `9950.000000000002` in binary floating point; without the
/// snap a round-up would land one tick too high.
const GRID_EPSILON: f64 = 1e-9;

/// Tick/lot rounding policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum TickPolicy {
    /// Reject values that aren't already aligned
    Reject,
    /// Round to nearest step
    RoundNearest,
    /// Round down (more conservative for buys)
    RoundDown,
    /// Round up (more conservative for sells)
    RoundUp,
}

/// Option right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionRight {
    Call,
    Put,
}

/// Coarse asset class used for calendar and precision decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetClass {
    Equity,
    Crypto,
    Forex,
    Option,
    Future,
}

/// Class-specific attributes of an instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstrumentKind {
    Equity,
    Crypto,
    Forex,
    Option {
        strike: f64,
        expiry: NaiveDate,
        right: OptionRight,
    },
    Future {
        expiry: Option<NaiveDate>,
        multiplier: f64,
    },
}

// Structural equality: floating attributes compare by bit pattern so that
// `Eq` and `Hash` agree and instruments can key hash maps.
impl PartialEq for InstrumentKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Equity, Self::Equity)
            | (Self::Crypto, Self::Crypto)
            | (Self::Forex, Self::Forex) => true,
            (
                Self::Option {
                    strike: s1,
                    expiry: e1,
                    right: r1,
                },
                Self::Option {
                    strike: s2,
                    expiry: e2,
                    right: r2,
                },
            ) => s1.to_bits() == s2.to_bits() && e1 == e2 && r1 == r2,
            (
                Self::Future {
                    expiry: e1,
                    multiplier: m1,
                },
                Self::Future {
                    expiry: e2,
                    multiplier: m2,
                },
            ) => e1 == e2 && m1.to_bits() == m2.to_bits(),
            _ => false,
        }
    }
}

impl Eq for InstrumentKind {}

impl Hash for InstrumentKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Equity | Self::Crypto | Self::Forex => {}
            Self::Option {
                strike,
                expiry,
                right,
            } => {
                strike.to_bits().hash(state);
                expiry.hash(state);
                right.hash(state);
            }
            Self::Future { expiry, multiplier } => {
                expiry.hash(state);
                multiplier.to_bits().hash(state);
            }
        }
    }
}

/// A tradable thing. Immutable value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub kind: InstrumentKind,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, kind: InstrumentKind) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
        }
    }

    pub fn equity(symbol: impl Into<String>) -> Self {
        Self::new(symbol, InstrumentKind::Equity)
    }

    pub fn crypto(symbol: impl Into<String>) -> Self {
        Self::new(symbol, InstrumentKind::Crypto)
    }

    pub fn forex(symbol: impl Into<String>) -> Self {
        Self::new(symbol, InstrumentKind::Forex)
    }

    pub fn option(
        underlying: impl Into<String>,
        strike: f64,
        expiry: NaiveDate,
        right: OptionRight,
    ) -> Self {
        Self::new(
            underlying,
            InstrumentKind::Option {
                strike,
                expiry,
                right,
            },
        )
    }

    pub fn future(symbol: impl Into<String>, expiry: Option<NaiveDate>, multiplier: f64) -> Self {
        Self::new(symbol, InstrumentKind::Future { expiry, multiplier })
    }

    /// The implied quote leg when a caller omits one.
    pub fn usd() -> Self {
        Self::forex("USD")
    }

    pub fn asset_class(&self) -> AssetClass {
        match self.kind {
            InstrumentKind::Equity => AssetClass::Equity,
            InstrumentKind::Crypto => AssetClass::Crypto,
            InstrumentKind::Forex => AssetClass::Forex,
            InstrumentKind::Option { .. } => AssetClass::Option,
            InstrumentKind::Future { .. } => AssetClass::Future,
        }
    }

    /// Value of one unit of quantity per unit of quoted price.
    ///
    /// Options are quoted per share but a contract controls 100 shares.
    pub fn multiplier(&self) -> f64 {
        match self.kind {
            InstrumentKind::Option { .. } => 100.0,
            InstrumentKind::Future { multiplier, .. } => multiplier,
            _ => 1.0,
        }
    }

    /// Minimum price increment, or `None` for full precision.
    pub fn tick_size(&self) -> Option<f64> {
        match self.kind {
            InstrumentKind::Equity | InstrumentKind::Option { .. } | InstrumentKind::Future { .. } => {
                Some(0.01)
            }
            InstrumentKind::Forex => Some(0.00001),
            InstrumentKind::Crypto => None,
        }
    }

    /// Smallest tradable quantity step.
    ///
    /// Whole units unless `fractional` is set; crypto always trades in
    /// satoshi-sized steps.
    pub fn lot_size(&self, fractional: bool) -> f64 {
        match self.kind {
            InstrumentKind::Crypto => 1e-8,
            InstrumentKind::Equity if fractional => 1e-6,
            _ => 1.0,
        }
    }

    /// Stable token used inside cache keys and file names.
    ///
    /// Distinct instruments always produce distinct tokens: anything in the
    /// symbol other than ASCII letters, digits and `.` is percent-encoded, so
    /// `-` and `_` stay free to act as separators.
    pub fn cache_token(&self) -> String {
        let symbol = escape_symbol(&self.symbol);
        match &self.kind {
            InstrumentKind::Equity => format!("{symbol}-equity"),
            InstrumentKind::Crypto => format!("{symbol}-crypto"),
            InstrumentKind::Forex => format!("{symbol}-forex"),
            InstrumentKind::Option {
                strike,
                expiry,
                right,
            } => {
                let r = match right {
                    OptionRight::Call => "C",
                    OptionRight::Put => "P",
                };
                format!("{symbol}-option-{}-{r}-{strike}", expiry.format("%Y%m%d"))
            }
            InstrumentKind::Future { expiry, multiplier } => match expiry {
                Some(e) => format!("{symbol}-future-{}-x{multiplier}", e.format("%Y%m%d")),
                None => format!("{symbol}-future-cont-x{multiplier}"),
            },
        }
    }

    /// Check that the instrument can be used in a query.
    pub fn validate(&self) -> Result<(), InstrumentError> {
        if self.symbol.trim().is_empty() {
            return Err(InstrumentError::EmptySymbol);
        }
        match self.kind {
            InstrumentKind::Option { strike, .. } if !(strike.is_finite() && strike > 0.0) => {
                Err(InstrumentError::InvalidStrike {
                    symbol: self.symbol.clone(),
                    strike,
                })
            }
            InstrumentKind::Future { multiplier, .. }
                if !(multiplier.is_finite() && multiplier > 0.0) =>
            {
                Err(InstrumentError::InvalidMultiplier {
                    symbol: self.symbol.clone(),
                    multiplier,
                })
            }
            _ => Ok(()),
        }
    }

    /// Round price according to policy. Full-precision instruments pass through.
    pub fn round_price(&self, price: f64, policy: TickPolicy) -> f64 {
        match self.tick_size() {
            Some(tick) => round_to_step(price, tick, policy),
            None => price,
        }
    }

    /// Round a limit price toward the book: buys round down, sells round up.
    pub fn round_price_side_aware(&self, price: f64, side: OrderSide) -> f64 {
        let policy = match side {
            OrderSide::Buy => TickPolicy::RoundDown,
            OrderSide::Sell => TickPolicy::RoundUp,
        };
        self.round_price(price, policy)
    }

    /// Validate quantity respects the lot size.
    pub fn validate_quantity(
        &self,
        qty: f64,
        fractional: bool,
        policy: TickPolicy,
    ) -> Result<f64, InstrumentError> {
        let lot_size = self.lot_size(fractional);
        let lots = qty / lot_size;

        if policy == TickPolicy::Reject && !on_grid(lots) {
            return Err(InstrumentError::InvalidLotSize {
                quantity: qty,
                lot_size,
            });
        }

        Ok(round_to_step(qty, lot_size, policy))
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InstrumentKind::Option {
                strike,
                expiry,
                right,
            } => write!(f, "{} {} {:?} {}", self.symbol, expiry, right, strike),
            _ => write!(f, "{}", self.symbol),
        }
    }
}

fn escape_symbol(symbol: &str) -> String {
    let mut out = String::with_capacity(symbol.len());
    for byte in symbol.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn on_grid(steps: f64) -> bool {
    (steps - steps.round()).abs() < GRID_EPSILON * steps.abs().max(1.0)
}

fn round_to_step(value: f64, step: f64, policy: TickPolicy) -> f64 {
    let raw = value / step;
    let nearest = raw.round();
    let steps = if on_grid(raw) {
        nearest
    } else {
        match policy {
            TickPolicy::RoundNearest => nearest,
            TickPolicy::RoundDown => raw.floor(),
            TickPolicy::RoundUp => raw.ceil(),
            TickPolicy::Reject => raw,
        }
    };
    // Multiply-then-divide by the inverse keeps 0.01 steps free of
    // representation noise like 99.51000000000001.
    let inverse = (1.0 / step).round();
    if inverse > 0.0 && ((1.0 / step) - inverse).abs() < GRID_EPSILON {
        steps / inverse
    } else {
        steps * step
    }
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("instrument symbol is empty")]
    EmptySymbol,

    #[error("option {symbol} has invalid strike {strike}")]
    InvalidStrike { symbol: String, strike: f64 },

    #[error("future {symbol} has invalid multiplier {multiplier}")]
    InvalidMultiplier { symbol: String, multiplier: f64 },

    #[error("Quantity {quantity} does not respect lot_size {lot_size}")]
    InvalidLotSize { quantity: f64, lot_size: f64 },
}
