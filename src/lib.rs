//! Core library for the flowcell_daq application.
//!
//! Automates a flow-cell electrochemistry campaign: for every electrolyte
//! channel and bath temperature it routes fluids, waits for the bath to settle,
//! runs a voltammetry sweep while recording video, then cleans and degasses the
//! cell before the next one. The binary in `main.rs` wires configuration,
//! logging and devices together; everything else lives here.

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;

pub use error::{AppResult, DaqError};
