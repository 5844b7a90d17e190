//! Hardware capability traits for the flow-cell rig.
//!
//! Every collaborator the sequencer talks to is described by a small async
//! trait. Implementations handle vendor protocol details; the experiment code
//! only ever sees `Arc<dyn Trait>` handles bundled in [`Devices`].
//!
//! # Available Implementations
//!
//! - [`bath::LineBath`] / `bath::SerialBath` - circulating bath over a CR-terminated line protocol
//! - [`mock`] - simulated versions of every device for tests and dry runs

pub mod bath;
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One of the four pressure-driven flow channels.
///
/// A1/A2 feed the anolyte (concentrated / diluent), B1/B2 the catholyte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowChannel {
    /// Concentrated anolyte
    A1,
    /// Anolyte diluent
    A2,
    /// Concentrated catholyte
    B1,
    /// Catholyte diluent
    B2,
}

impl FlowChannel {
    /// All channels in controller index order.
    pub const ALL: [FlowChannel; 4] = [
        FlowChannel::A1,
        FlowChannel::A2,
        FlowChannel::B1,
        FlowChannel::B2,
    ];

    /// Controller channel index.
    pub fn index(self) -> usize {
        match self {
            FlowChannel::A1 => 0,
            FlowChannel::A2 => 1,
            FlowChannel::B1 => 2,
            FlowChannel::B2 => 3,
        }
    }

    /// Short label used in logs.
    pub fn label(self) -> &'static str {
        match self {
            FlowChannel::A1 => "A1",
            FlowChannel::A2 => "A2",
            FlowChannel::B1 => "B1",
            FlowChannel::B2 => "B2",
        }
    }
}

impl fmt::Display for FlowChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The two rotary valves of the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Valve {
    /// Valve 1: selects washing solvent, one of the electrolyte channels, or air.
    Inlet,
    /// Valve 2: selects catholyte or air.
    Catholyte,
}

impl Valve {
    /// Valve channel index on the controller.
    pub fn index(self) -> usize {
        match self {
            Valve::Inlet => 0,
            Valve::Catholyte => 1,
        }
    }
}

impl fmt::Display for Valve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "valve[{}]", self.index() + 1)
    }
}

/// Flow regulator capability (pressure controller with flow-sensor feedback).
#[async_trait]
pub trait FlowRegulator: Send + Sync {
    /// Set the regulated flow target of a channel in µL/min.
    async fn set_target(&self, channel: FlowChannel, ul_per_min: f64) -> Result<()>;

    /// Set the regulation response time of a channel in seconds.
    async fn set_response_time(&self, channel: FlowChannel, seconds: u32) -> Result<()>;

    /// Read the measured flow of a channel in µL/min.
    async fn read_value(&self, channel: FlowChannel) -> Result<f64>;
}

/// Rotary valve capability.
#[async_trait]
pub trait ValvePositioner: Send + Sync {
    /// Move a valve to a position.
    async fn set_position(&self, valve: Valve, position: u8) -> Result<()>;

    /// Current position of a valve.
    async fn position(&self, valve: Valve) -> Result<u8>;

    /// Number of valve channels detected on the controller.
    async fn channel_count(&self) -> Result<usize>;
}

/// Circulating temperature bath capability.
#[async_trait]
pub trait TemperatureBath: Send + Sync {
    /// Switch the bath to run mode.
    async fn set_on(&self) -> Result<()>;

    /// Command a new setpoint in °C.
    async fn set_setpoint(&self, celsius: f64) -> Result<()>;

    /// Setpoint currently held by the bath in °C.
    async fn read_setpoint(&self) -> Result<f64>;

    /// Measured bath temperature in °C.
    async fn read_temperature(&self) -> Result<f64>;
}

/// Cyclic voltammetry sweep parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepParameters {
    /// Initial potential (V)
    pub initial_v: f64,
    /// First vertex potential (V)
    pub vertex1_v: f64,
    /// Second vertex potential (V)
    pub vertex2_v: f64,
    /// Final potential (V)
    pub final_v: f64,
    /// Scan rate (V/s)
    pub scan_rate_v_per_s: f64,
    /// Potential increment (V)
    pub increment_v: f64,
    /// Number of sweeps
    pub sweep_count: u32,
    /// Current sensitivity (A/V)
    pub sensitivity_a_per_v: f64,
}

impl SweepParameters {
    /// Nominal measurement time: `(vertex1 - initial) / scan_rate * sweep_count`.
    ///
    /// Returns zero for parameter sets that would give a negative or non-finite
    /// time; configuration validation rejects those before a run starts.
    pub fn duration(&self) -> Duration {
        let window = self.vertex1_v - self.initial_v;
        let seconds = window / self.scan_rate_v_per_s * f64::from(self.sweep_count);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
    }

    /// Check the parameters describe a sweep that can actually run.
    pub fn validate(&self, name: &str) -> std::result::Result<(), String> {
        let values = [
            self.initial_v,
            self.vertex1_v,
            self.vertex2_v,
            self.final_v,
            self.scan_rate_v_per_s,
            self.increment_v,
            self.sensitivity_a_per_v,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(format!("{name}: sweep parameters must be finite"));
        }
        if self.scan_rate_v_per_s <= 0.0 {
            return Err(format!("{name}: scan rate must be positive"));
        }
        if self.increment_v <= 0.0 {
            return Err(format!("{name}: potential increment must be positive"));
        }
        if self.sweep_count == 0 {
            return Err(format!("{name}: sweep count must be at least 1"));
        }
        if self.vertex1_v <= self.initial_v {
            return Err(format!(
                "{name}: first vertex ({} V) must be above the initial potential ({} V)",
                self.vertex1_v, self.initial_v
            ));
        }
        Ok(())
    }
}

/// A sweep to run, with the data file it should produce.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRequest {
    /// Potential program
    pub parameters: SweepParameters,
    /// Base file name for the data file
    pub file_name: String,
    /// Header written into the data file
    pub header: String,
}

/// Potentiostat capability.
#[async_trait]
pub trait PotentiostatRunner: Send + Sync {
    /// Run a sweep to completion. Blocks for the sweep duration.
    async fn run_sweep(&self, request: &SweepRequest) -> Result<()>;
}

/// Video recorder capability.
#[async_trait]
pub trait VideoRecorder: Send + Sync {
    /// Record into `output` until `max_duration` elapses or
    /// [`stop_session`](Self::stop_session) is called. Resolves when the
    /// session has ended and the file is closed.
    async fn start_session(&self, max_duration: Duration, output: &Path) -> Result<()>;

    /// Ask a running session to end early. No-op when idle.
    async fn stop_session(&self) -> Result<()>;
}

/// Device handles owned by the top-level process and injected into every component.
#[derive(Clone)]
pub struct Devices {
    /// The four flow channels
    pub flow: Arc<dyn FlowRegulator>,
    /// Both rotary valves
    pub valves: Arc<dyn ValvePositioner>,
    /// Temperature bath
    pub bath: Arc<dyn TemperatureBath>,
    /// Potentiostat
    pub potentiostat: Arc<dyn PotentiostatRunner>,
    /// Video recorder
    pub recorder: Arc<dyn VideoRecorder>,
}

/// Video file path for a measurement key.
pub fn video_path(data_dir: &Path, file_key: &str) -> PathBuf {
    data_dir.join(format!("{file_key}.mp4"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep() -> SweepParameters {
        SweepParameters {
            initial_v: 0.25,
            vertex1_v: 0.55,
            vertex2_v: 0.4,
            final_v: 0.3,
            scan_rate_v_per_s: 0.002,
            increment_v: 0.001,
            sweep_count: 1,
            sensitivity_a_per_v: 1e-4,
        }
    }

    #[test]
    fn test_sweep_duration_matches_vertex_span() {
        let duration = sweep().duration();
        assert!((duration.as_secs_f64() - 150.0).abs() < 1e-6);

        let mut twice = sweep();
        twice.sweep_count = 2;
        assert!((twice.duration().as_secs_f64() - 300.0).abs() < 1e-6);
    }

    #[test]
    fn test_sweep_validation() {
        assert!(sweep().validate("measurement").is_ok());

        let mut inverted = sweep();
        inverted.vertex1_v = 0.1;
        assert!(inverted.validate("measurement").is_err());
        assert_eq!(inverted.duration(), Duration::ZERO);

        let mut stalled = sweep();
        stalled.scan_rate_v_per_s = 0.0;
        assert!(stalled.validate("measurement").is_err());
    }

    #[test]
    fn test_channel_indices() {
        let indices: Vec<usize> = FlowChannel::ALL.iter().map(|c| c.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(Valve::Catholyte.to_string(), "valve[2]");
    }
}
