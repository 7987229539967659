//! Async building blocks that don't belong to any one crate.

mod single_flight;

pub use crate::single_flight::SingleFlight;
