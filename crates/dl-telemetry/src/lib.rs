//! Logging setup shared by the devloop binary and tests.
//!
//! Every crate logs through `tracing` with structured fields; this crate
//! only decides where those events go and in what format.

pub mod logging;
