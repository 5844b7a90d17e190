//! Derived parameters: flow splits and the experiment matrix.
//!
//! Each electrolyte is mixed on-chip from a concentrated stock and a diluent.
//! For a target concentration `c` and stock `s`, the dilution fraction `c / s`
//! decides how a branch's total flow is split between the two inlets:
//!
//! ```text
//! concentrated = total * c / s
//! diluent      = total * (1 - c / s)
//! ```
//!
//! Everything here is pure and runs before any device is touched, so an
//! impossible target is reported as a configuration error up front instead of
//! half-way through a campaign.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::hardware::FlowChannel;

/// Stock and per-step targets for one electrolyte branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Electrolyte {
    /// Concentration of the concentrated stock
    pub stock: f64,
    /// Target concentration for each temperature step
    pub targets: Vec<f64>,
    /// Total branch flow (µL/min) for each temperature step
    pub total_flows: Vec<f64>,
}

/// Split of one branch's total flow between stock and diluent inlets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowSplit {
    /// Flow through the concentrated inlet
    pub concentrated: f64,
    /// Flow through the diluent inlet
    pub diluent: f64,
}

/// Compute the stock/diluent split for one target.
///
/// # Errors
///
/// `DaqError::Configuration` unless `0 <= target <= stock`, `stock > 0`,
/// `total >= 0` and every value is finite.
pub fn split_flow(target: f64, stock: f64, total: f64) -> AppResult<FlowSplit> {
    if !(target.is_finite() && stock.is_finite() && total.is_finite()) {
        return Err(DaqError::Configuration(format!(
            "non-finite flow parameters (target {target}, stock {stock}, total {total})"
        )));
    }
    if stock <= 0.0 {
        return Err(DaqError::Configuration(format!(
            "stock concentration must be positive, got {stock}"
        )));
    }
    if target < 0.0 || target > stock {
        return Err(DaqError::Configuration(format!(
            "target concentration {target} outside 0..={stock} (stock)"
        )));
    }
    if total < 0.0 {
        return Err(DaqError::Configuration(format!(
            "total flow must not be negative, got {total}"
        )));
    }

    let fraction = target / stock;
    Ok(FlowSplit {
        concentrated: total * fraction,
        diluent: total * (1.0 - fraction),
    })
}

/// Working flow targets for the four channels at one temperature step (µL/min).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowPlan {
    /// Concentrated anolyte
    pub a1: f64,
    /// Anolyte diluent
    pub a2: f64,
    /// Concentrated catholyte
    pub b1: f64,
    /// Catholyte diluent
    pub b2: f64,
}

impl FlowPlan {
    /// Build a plan from the anolyte and catholyte splits.
    pub fn from_splits(anolyte: FlowSplit, catholyte: FlowSplit) -> Self {
        Self {
            a1: anolyte.concentrated,
            a2: anolyte.diluent,
            b1: catholyte.concentrated,
            b2: catholyte.diluent,
        }
    }

    /// Target for a single channel.
    pub fn rate(&self, channel: FlowChannel) -> f64 {
        match channel {
            FlowChannel::A1 => self.a1,
            FlowChannel::A2 => self.a2,
            FlowChannel::B1 => self.b1,
            FlowChannel::B2 => self.b2,
        }
    }
}

/// Derive one [`FlowPlan`] per temperature step.
///
/// Both electrolytes must list a target and a total flow for every step.
pub fn derive_flow_plans(
    anolyte: &Electrolyte,
    catholyte: &Electrolyte,
    steps: usize,
) -> AppResult<Vec<FlowPlan>> {
    for (name, electrolyte) in [("anolyte", anolyte), ("catholyte", catholyte)] {
        if electrolyte.targets.len() < steps || electrolyte.total_flows.len() < steps {
            return Err(DaqError::Configuration(format!(
                "{name}: {steps} temperature steps need {steps} targets and total flows \
                 (got {} and {})",
                electrolyte.targets.len(),
                electrolyte.total_flows.len()
            )));
        }
    }

    (0..steps)
        .map(|step| {
            let a = split_flow(anolyte.targets[step], anolyte.stock, anolyte.total_flows[step])
                .map_err(|e| step_error("anolyte", step, e))?;
            let b = split_flow(
                catholyte.targets[step],
                catholyte.stock,
                catholyte.total_flows[step],
            )
            .map_err(|e| step_error("catholyte", step, e))?;
            Ok(FlowPlan::from_splits(a, b))
        })
        .collect()
}

fn step_error(name: &str, step: usize, err: DaqError) -> DaqError {
    match err {
        DaqError::Configuration(msg) => {
            DaqError::Configuration(format!("{name} step {step}: {msg}"))
        }
        other => other,
    }
}

/// One run of the phase sequence: a channel at a target temperature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatrixCell {
    /// Valve 1 position of the electrolyte channel
    pub channel: u8,
    /// Target bath temperature (°C)
    pub temperature_c: f64,
    /// Index into the per-step flow plans
    pub step: usize,
}

/// Cartesian product of channels and temperatures, channel-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentMatrix {
    channels: Vec<u8>,
    temperatures: Vec<f64>,
}

impl ExperimentMatrix {
    /// Build the matrix; both lists must be non-empty and temperatures finite.
    pub fn new(channels: Vec<u8>, temperatures: Vec<f64>) -> AppResult<Self> {
        if channels.is_empty() {
            return Err(DaqError::Configuration("no channels configured".into()));
        }
        if temperatures.is_empty() {
            return Err(DaqError::Configuration("no temperatures configured".into()));
        }
        if let Some(bad) = temperatures.iter().find(|t| !t.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "temperature {bad} is not finite"
            )));
        }
        Ok(Self {
            channels,
            temperatures,
        })
    }

    /// Channels in run order.
    pub fn channels(&self) -> &[u8] {
        &self.channels
    }

    /// Temperatures in run order.
    pub fn temperatures(&self) -> &[f64] {
        &self.temperatures
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.channels.len() * self.temperatures.len()
    }

    /// Always false; construction rejects empty matrices.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cells for one channel, in temperature order.
    pub fn cells_for(&self, channel: u8) -> impl Iterator<Item = MatrixCell> + '_ {
        self.temperatures
            .iter()
            .enumerate()
            .map(move |(step, &temperature_c)| MatrixCell {
                channel,
                temperature_c,
                step,
            })
    }

    /// All cells, channel-major.
    pub fn cells(&self) -> impl Iterator<Item = MatrixCell> + '_ {
        self.channels
            .iter()
            .flat_map(move |&channel| self.cells_for(channel))
    }
}
