//! Experiment orchestration for the flow-cell campaign.
//!
//! # Architecture
//!
//! - **plan**: pure derivation of flow splits and the channel × temperature matrix
//! - **phases**: the fixed phase sequence and the fluidic state of each phase
//! - **convergence**: closed-loop settling of the bath (or any setpoint)
//! - **fluidics**: the single writer for flow channels and valves
//! - **acquisition**: potentiostat sweep with concurrent video recording
//! - **sequencer**: drives the matrix through the phases and shuts down safely
//! - **report**: persisted trace of a run
//!
//! # Example
//!
//! ```rust,ignore
//! use flowcell_daq::experiment::Sequencer;
//!
//! let sequencer = Sequencer::new(&config, devices)?;
//! let report = sequencer.run_until(ctrl_c).await?;
//! report.write_json(&path)?;
//! ```

pub mod acquisition;
pub mod convergence;
pub mod fluidics;
pub mod phases;
pub mod plan;
pub mod report;
pub mod sequencer;

pub use acquisition::{
    AcquisitionCoordinator, AcquisitionOutcome, AcquisitionTask, JoinPolicy, TaskStatus,
};
pub use convergence::{
    wait_for_convergence, BathSetpoint, ConvergencePolicy, FlowSetpoint, Setpoint,
};
pub use fluidics::Fluidics;
pub use phases::{Phase, PhaseCatalogue, PhaseSpec};
pub use plan::{
    derive_flow_plans, split_flow, Electrolyte, ExperimentMatrix, FlowPlan, FlowSplit, MatrixCell,
};
pub use report::{CellOutcome, CellRecord, PhaseRecord, RunReport};
pub use sequencer::Sequencer;
