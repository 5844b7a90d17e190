//! Phase catalogue.
//!
//! A phase is one step of the fixed campaign sequence with its valve routing,
//! channel flows and how long to stay there. Specs are built once from
//! configuration and never mutated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::{DurationConfig, FlowRateConfig, ValveConfig};
use crate::experiment::plan::FlowPlan;

/// Every phase the sequencer can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Wash before a channel's first temperature step
    ChannelWash,
    /// Bring the bath back to the initial temperature before a channel
    SettleInitial,
    /// Route both valves to washing solvent
    Wash,
    /// Replace the solvent with the cell's electrolyte
    PurgeChannel,
    /// Wait for the bath to reach the cell temperature
    SettleTemperature,
    /// Apply working flows and let them stabilize
    SettleFlow,
    /// Measurement sweep with video recording
    Measure,
    /// High flow over the electrode with washing solvent
    FlushElectrode,
    /// Fast cleaning sweeps
    CleanElectrode,
    /// Push an air slug through to remove trapped bubbles
    Degas,
    /// Wash after the last cell
    FinalWash,
    /// Return the bath to the initial temperature
    CoolDown,
    /// Zero all flows
    Shutdown,
}

impl Phase {
    /// Phases of one matrix cell, in execution order.
    pub const CELL_SEQUENCE: [Phase; 8] = [
        Phase::Wash,
        Phase::PurgeChannel,
        Phase::SettleTemperature,
        Phase::SettleFlow,
        Phase::Measure,
        Phase::FlushElectrode,
        Phase::CleanElectrode,
        Phase::Degas,
    ];

    /// Terminal phases after the matrix, in execution order.
    pub const TERMINAL_SEQUENCE: [Phase; 3] =
        [Phase::FinalWash, Phase::CoolDown, Phase::Shutdown];

    /// Stable name used in logs and reports; the same string serde writes.
    pub fn name(self) -> &'static str {
        match self {
            Phase::ChannelWash => "channel-wash",
            Phase::SettleInitial => "settle-initial",
            Phase::Wash => "wash",
            Phase::PurgeChannel => "purge-channel",
            Phase::SettleTemperature => "settle-temperature",
            Phase::SettleFlow => "settle-flow",
            Phase::Measure => "measure",
            Phase::FlushElectrode => "flush-electrode",
            Phase::CleanElectrode => "clean-electrode",
            Phase::Degas => "degas",
            Phase::FinalWash => "final-wash",
            Phase::CoolDown => "cool-down",
            Phase::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Target positions for both valves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValveRouting {
    /// Valve 1 position
    pub inlet: u8,
    /// Valve 2 position
    pub catholyte: u8,
}

/// Flow targets applied by a phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlowSetting {
    /// Same rate on all four channels (µL/min)
    Uniform(f64),
    /// Channel-specific working flows
    Plan(FlowPlan),
}

/// How a phase decides it is done.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dwell {
    /// Fixed wait
    Fixed(Duration),
    /// Bath convergence to the given temperature (°C)
    Converge(f64),
}

/// Fluidic entry state of a phase plus its completion condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSpec {
    /// Which phase
    pub phase: Phase,
    /// Valve routing, if the phase changes it
    pub routing: Option<ValveRouting>,
    /// Flow targets
    pub flows: FlowSetting,
    /// Completion condition
    pub dwell: Dwell,
}

/// Builds phase specs from the configured rates, durations and positions.
#[derive(Debug, Clone)]
pub struct PhaseCatalogue {
    valves: ValveConfig,
    rates: FlowRateConfig,
    durations: DurationConfig,
}

impl PhaseCatalogue {
    /// Capture the configuration the specs are derived from.
    pub fn new(valves: ValveConfig, rates: FlowRateConfig, durations: DurationConfig) -> Self {
        Self {
            valves,
            rates,
            durations,
        }
    }

    /// Configured durations.
    pub fn durations(&self) -> &DurationConfig {
        &self.durations
    }

    /// Both valves on washing solvent / catholyte.
    pub fn wash_routing(&self) -> ValveRouting {
        ValveRouting {
            inlet: self.valves.wash_position,
            catholyte: self.valves.catholyte_position,
        }
    }

    /// Both valves on air.
    pub fn air_routing(&self) -> ValveRouting {
        ValveRouting {
            inlet: self.valves.air_position_inlet,
            catholyte: self.valves.air_position_catholyte,
        }
    }

    /// Washing routing and flow for `phase` (wash, channel wash, final wash).
    pub fn wash(&self, phase: Phase) -> PhaseSpec {
        PhaseSpec {
            phase,
            routing: Some(self.wash_routing()),
            flows: FlowSetting::Uniform(self.rates.washing),
            dwell: Dwell::Fixed(self.durations.wash),
        }
    }

    /// Route the channel in and push the washing solvent out.
    pub fn purge(&self, channel: u8) -> PhaseSpec {
        PhaseSpec {
            phase: Phase::PurgeChannel,
            routing: Some(ValveRouting {
                inlet: channel,
                catholyte: self.valves.catholyte_position,
            }),
            flows: FlowSetting::Uniform(self.rates.washing),
            dwell: Dwell::Fixed(self.durations.purge),
        }
    }

    /// Low flow while the bath converges to `celsius`.
    pub fn settle_temperature(&self, phase: Phase, celsius: f64) -> PhaseSpec {
        PhaseSpec {
            phase,
            routing: None,
            flows: FlowSetting::Uniform(self.rates.waiting),
            dwell: Dwell::Converge(celsius),
        }
    }

    /// Working flows for the step.
    pub fn settle_flow(&self, plan: FlowPlan) -> PhaseSpec {
        PhaseSpec {
            phase: Phase::SettleFlow,
            routing: None,
            flows: FlowSetting::Plan(plan),
            dwell: Dwell::Fixed(self.durations.flow_stabilization),
        }
    }

    /// Washing solvent at flush rate over the electrode.
    pub fn flush(&self) -> PhaseSpec {
        PhaseSpec {
            phase: Phase::FlushElectrode,
            routing: Some(self.wash_routing()),
            flows: FlowSetting::Uniform(self.rates.flushing),
            dwell: Dwell::Fixed(self.durations.flow_stabilization + self.durations.flush),
        }
    }

    /// Cleaning flow, stabilized before the cleaning sweeps.
    pub fn clean(&self) -> PhaseSpec {
        PhaseSpec {
            phase: Phase::CleanElectrode,
            routing: None,
            flows: FlowSetting::Uniform(self.rates.cleaning),
            dwell: Dwell::Fixed(self.durations.flow_stabilization),
        }
    }

    /// Bubble-removal flow, stabilized before the air slug.
    pub fn degas(&self) -> PhaseSpec {
        PhaseSpec {
            phase: Phase::Degas,
            routing: None,
            flows: FlowSetting::Uniform(self.rates.bubble_removal),
            dwell: Dwell::Fixed(self.durations.flow_stabilization),
        }
    }

    /// Regulator response time applied with every flow target.
    pub fn response_time_s(&self) -> u32 {
        self.rates.response_time_s
    }
}
