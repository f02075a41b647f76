//! Failure guards: adaptive pacing and circuit breaking.

pub mod breaker;
pub mod rate;

pub use breaker::CircuitBreaker;
pub use rate::RateController;
