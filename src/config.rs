//! Experiment configuration using Figment.
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults (`ExperimentConfig::default()`)
//! 2. The TOML file passed to [`ExperimentConfig::load_from`]
//! 3. Environment variables prefixed with `FLOWCELL_`
//!
//! Nested keys are separated by a double underscore so that field names can
//! keep their own underscores:
//!
//! ```text
//! FLOWCELL_APPLICATION__LOG_LEVEL=debug
//! FLOWCELL_FLOW_RATES__WASHING=250
//! FLOWCELL_DURATIONS__FLOW_STABILIZATION=45s
//! ```
//!
//! Durations use humantime notation (`30s`, `2m`, `1h 30m`).
//!
//! # Example
//!
//! ```no_run
//! use flowcell_daq::config::ExperimentConfig;
//!
//! let config = ExperimentConfig::load_from("config/experiment.toml")?;
//! println!("{} cells", config.matrix()?.len());
//! # Ok::<(), flowcell_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::experiment::acquisition::JoinPolicy;
use crate::experiment::convergence::ConvergencePolicy;
use crate::experiment::phases::PhaseCatalogue;
use crate::experiment::plan::{derive_flow_plans, Electrolyte, ExperimentMatrix, FlowPlan};
use crate::hardware::SweepParameters;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "FLOWCELL_";

/// Top-level configuration of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device selection and connection parameters
    pub devices: DeviceConfig,
    /// Valve positions and the channels to run
    pub valves: ValveConfig,
    /// Temperature steps
    pub temperatures: TemperatureConfig,
    /// Anolyte branch
    pub anolyte: Electrolyte,
    /// Catholyte branch
    pub catholyte: Electrolyte,
    /// Fixed flow rates of the non-working phases
    pub flow_rates: FlowRateConfig,
    /// Fixed dwell times
    pub durations: DurationConfig,
    /// Bath convergence policy
    pub convergence: ConvergencePolicy,
    /// Measurement sweep
    pub measurement: SweepParameters,
    /// Cleaning sweep
    pub cleaning: SweepParameters,
    /// Video recording around the measurement
    pub recording: RecordingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Campaign name, copied into the run report
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Directory for data files, videos and the run report
    pub data_dir: PathBuf,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable
    Pretty,
    /// One JSON object per line
    Json,
}

/// Which bath implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BathBackend {
    /// Serial line protocol
    Serial,
    /// In-process simulation
    Simulated,
}

/// Device connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bath implementation used with `--simulate`
    pub bath: BathBackend,
    /// Serial port of the bath (e.g. "/dev/ttyUSB0", "COM3")
    pub bath_port: String,
    /// Baud rate of the bath
    pub bath_baud: u32,
    /// Per-request timeout of the bath
    #[serde(with = "humantime_serde")]
    pub bath_timeout: Duration,
    /// Heating/cooling rate of the simulated bath (°C/s)
    pub simulated_bath_rate: f64,
}

/// Valve positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValveConfig {
    /// Valve 1 positions of the electrolyte channels, in run order
    pub channels: Vec<u8>,
    /// Valve 1 position of the washing solvent
    pub wash_position: u8,
    /// Valve 2 position of the catholyte
    pub catholyte_position: u8,
    /// Valve 1 position open to air
    pub air_position_inlet: u8,
    /// Valve 2 position open to air
    pub air_position_catholyte: u8,
}

/// Temperature steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    /// Cell temperatures in run order (°C)
    pub working: Vec<f64>,
    /// Start and end temperature (°C)
    pub initial: f64,
}

/// Fixed flow rates (µL/min).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowRateConfig {
    /// While the bath settles
    pub waiting: f64,
    /// Electrode flush
    pub flushing: f64,
    /// Cleaning sweeps
    pub cleaning: f64,
    /// Bubble removal
    pub bubble_removal: f64,
    /// Wash and purge
    pub washing: f64,
    /// Regulator response time sent with every target (s)
    pub response_time_s: u32,
}

/// Fixed dwell times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurationConfig {
    /// Wash dwell
    #[serde(with = "humantime_serde")]
    pub wash: Duration,
    /// Purge dwell
    #[serde(with = "humantime_serde")]
    pub purge: Duration,
    /// Flush dwell, on top of stabilization
    #[serde(with = "humantime_serde")]
    pub flush: Duration,
    /// Wait after any flow change
    #[serde(with = "humantime_serde")]
    pub flow_stabilization: Duration,
    /// Dwell after the air slug
    #[serde(with = "humantime_serde")]
    pub bubble_removal: Duration,
    /// How long the valves stay on air
    #[serde(with = "humantime_serde")]
    pub air_hold: Duration,
}

/// Join behaviour of the acquisition tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMode {
    /// Join within `join_grace`, force-stopping stragglers
    Bounded,
    /// Return at the deadline and leave the tasks running
    Detached,
}

/// Recording parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Delay between sweep start and recording start
    #[serde(with = "humantime_serde")]
    pub lead_delay: Duration,
    /// Recording time on top of the measurement duration
    #[serde(with = "humantime_serde")]
    pub extra_budget: Duration,
    /// Join behaviour
    pub join: JoinMode,
    /// Grace period for `bounded`
    #[serde(with = "humantime_serde")]
    pub join_grace: Duration,
}

// ============================================================================
// Defaults
// ============================================================================

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "flowcell".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bath: BathBackend::Simulated,
            bath_port: "/dev/ttyUSB0".to_string(),
            bath_baud: 19200,
            bath_timeout: Duration::from_secs(1),
            simulated_bath_rate: 0.05,
        }
    }
}

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            channels: (1..=6).collect(),
            wash_position: 0,
            catholyte_position: 0,
            air_position_inlet: 7,
            air_position_catholyte: 1,
        }
    }
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            working: vec![10.0, 20.0, 30.0, 40.0, 50.0],
            initial: 20.0,
        }
    }
}

impl Default for FlowRateConfig {
    fn default() -> Self {
        Self {
            waiting: 50.0,
            flushing: 600.0,
            cleaning: 150.0,
            bubble_removal: 400.0,
            washing: 200.0,
            response_time_s: 60,
        }
    }
}

impl Default for DurationConfig {
    fn default() -> Self {
        Self {
            wash: Duration::from_secs(60),
            purge: Duration::from_secs(60),
            flush: Duration::from_secs(30),
            flow_stabilization: Duration::from_secs(30),
            bubble_removal: Duration::from_secs(60),
            air_hold: Duration::from_secs(2),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            lead_delay: Duration::from_secs(1),
            extra_budget: Duration::ZERO,
            join: JoinMode::Bounded,
            join_grace: Duration::from_secs(10),
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            devices: DeviceConfig::default(),
            valves: ValveConfig::default(),
            temperatures: TemperatureConfig::default(),
            anolyte: Electrolyte {
                stock: 80.0,
                targets: vec![40.0; 5],
                total_flows: vec![300.0; 5],
            },
            catholyte: Electrolyte {
                stock: 1.0,
                targets: vec![0.5; 5],
                total_flows: vec![300.0; 5],
            },
            flow_rates: FlowRateConfig::default(),
            durations: DurationConfig::default(),
            convergence: ConvergencePolicy::default(),
            measurement: SweepParameters {
                initial_v: 0.25,
                vertex1_v: 0.55,
                vertex2_v: 0.4,
                final_v: 0.3,
                scan_rate_v_per_s: 0.002,
                increment_v: 0.001,
                sweep_count: 1,
                sensitivity_a_per_v: 1e-4,
            },
            cleaning: SweepParameters {
                initial_v: 0.2,
                vertex1_v: 0.6,
                vertex2_v: 0.2,
                final_v: 0.2,
                scan_rate_v_per_s: 0.1,
                increment_v: 0.001,
                sweep_count: 200,
                sensitivity_a_per_v: 1e-3,
            },
            recording: RecordingConfig::default(),
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl ExperimentConfig {
    /// Load defaults, then `path`, then `FLOWCELL_` environment overrides, and validate.
    ///
    /// # Errors
    ///
    /// `DaqError::Config` if a layer cannot be parsed or has the wrong shape,
    /// `DaqError::Configuration` if the merged configuration is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without touching a device.
    ///
    /// Flow plans and the matrix are derived here so an impossible target is
    /// caught at startup.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let reserved = [
            ("wash_position", self.valves.wash_position),
            ("air_position_inlet", self.valves.air_position_inlet),
        ];
        let mut seen = std::collections::HashSet::new();
        for &channel in &self.valves.channels {
            if !seen.insert(channel) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate channel {channel} in valves.channels"
                )));
            }
            if let Some((name, _)) = reserved.iter().find(|(_, pos)| *pos == channel) {
                return Err(DaqError::Configuration(format!(
                    "Channel {channel} collides with valves.{name}"
                )));
            }
        }

        if !self.temperatures.initial.is_finite() {
            return Err(DaqError::Configuration(
                "temperatures.initial must be finite".into(),
            ));
        }

        let rates = [
            ("waiting", self.flow_rates.waiting),
            ("flushing", self.flow_rates.flushing),
            ("cleaning", self.flow_rates.cleaning),
            ("bubble_removal", self.flow_rates.bubble_removal),
            ("washing", self.flow_rates.washing),
        ];
        if let Some((name, rate)) = rates.iter().find(|(_, r)| !r.is_finite() || *r < 0.0) {
            return Err(DaqError::Configuration(format!(
                "flow_rates.{name} must be a non-negative number, got {rate}"
            )));
        }

        self.measurement
            .validate("measurement")
            .map_err(DaqError::Configuration)?;
        self.cleaning
            .validate("cleaning")
            .map_err(DaqError::Configuration)?;

        if self.convergence.poll_interval.is_zero() {
            return Err(DaqError::Configuration(
                "convergence.poll_interval must be greater than zero".into(),
            ));
        }

        self.matrix()?;
        self.flow_plans()?;
        Ok(())
    }

    /// Channel × temperature matrix.
    pub fn matrix(&self) -> AppResult<ExperimentMatrix> {
        ExperimentMatrix::new(
            self.valves.channels.clone(),
            self.temperatures.working.clone(),
        )
    }

    /// One flow plan per temperature step.
    pub fn flow_plans(&self) -> AppResult<Vec<FlowPlan>> {
        derive_flow_plans(
            &self.anolyte,
            &self.catholyte,
            self.temperatures.working.len(),
        )
    }

    /// Phase specs derived from this configuration.
    pub fn catalogue(&self) -> PhaseCatalogue {
        PhaseCatalogue::new(
            self.valves.clone(),
            self.flow_rates.clone(),
            self.durations.clone(),
        )
    }

    /// Join policy of the acquisition coordinator.
    pub fn join_policy(&self) -> JoinPolicy {
        match self.recording.join {
            JoinMode::Bounded => JoinPolicy::Bounded {
                grace: self.recording.join_grace,
            },
            JoinMode::Detached => JoinPolicy::Detached,
        }
    }

    /// Recording budget: measurement duration plus the configured extra.
    pub fn recording_budget(&self) -> Duration {
        self.measurement.duration() + self.recording.extra_budget
    }
}
