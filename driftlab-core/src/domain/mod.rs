//! Domain types: instruments, bars, positions, order intents, portfolio.

pub mod bar;
pub mod instrument;
pub mod order;
pub mod portfolio;
pub mod position;

pub use bar::Bar;
pub use instrument::{AssetClass, Instrument, InstrumentError, InstrumentKind, OptionRight, TickPolicy};
pub use order::{OrderIntent, OrderSide, OrderType, TimeInForce};
pub use portfolio::Portfolio;
pub use position::Position;

/// An (instrument, quote-instrument) pairing used for every price lookup.
///
/// Both legs are validated at construction, before any query can run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct QuotePair {
    pub base: Instrument,
    pub quote: Instrument,
}

impl QuotePair {
    pub fn new(base: Instrument, quote: Instrument) -> Result<Self, InstrumentError> {
        base.validate()?;
        quote.validate()?;
        Ok(Self { base, quote })
    }

    /// Pair against the default USD quote.
    pub fn with_default_quote(base: Instrument) -> Result<Self, InstrumentError> {
        Self::new(base, Instrument::usd())
    }
}
