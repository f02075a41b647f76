//! Evasion layer: block-page detection and the recovery state machine.

pub mod detectors;
pub mod engine;
pub mod interstitial;

pub use detectors::{AGE_GATE_BODY_MARKER, CHALLENGE_TITLE_MARKER, PageClass};
pub use engine::{EvasionEngine, EvasionError};
pub use interstitial::{SolverClient, SolverError};
