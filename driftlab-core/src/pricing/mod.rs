//! Price resolution.

pub mod resolver;

pub use resolver::{window_from_series, Anchor, PriceError, PriceResolver, PriceSource, Resolution};
