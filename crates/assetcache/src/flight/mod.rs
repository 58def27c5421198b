//! Computations that run at most once and are shared by all their waiters.

mod keyed;
mod value;

pub use keyed::KeyedSingleFlightCache;
pub use value::{Aborted, FlightError, FlightState, Panicked, SharedError, SingleFlightValue};
