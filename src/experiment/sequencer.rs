//! Phase sequencer: drives the channel × temperature matrix through the fixed
//! phase sequence and always finishes with the terminal phases.
//!
//! ```text
//! per channel:  ChannelWash → SettleInitial
//! per cell:     Wash → PurgeChannel → SettleTemperature → SettleFlow → Measure
//!               → FlushElectrode → CleanElectrode → Degas ─┐
//!                 ▲                                       │ next cell
//!                 └───────────────────────────────────────┘
//! after matrix: FinalWash → CoolDown → Shutdown
//! ```
//!
//! A device failure or convergence timeout aborts the current cell only.
//! Cancellation stops the matrix at the next await point, and a panic in the
//! control code stops it where it happened. Either way any acquisition in
//! flight is ended first, then the terminal phases run with flows zeroed last.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::ExperimentConfig;
use crate::error::{AppResult, DaqError};
use crate::experiment::acquisition::{
    cleaning_key, measurement_key, AcquisitionCoordinator, AcquisitionOutcome, AcquisitionTask,
    TaskStatus, CLEANING_HEADER, MEASUREMENT_HEADER,
};
use crate::experiment::convergence::{wait_for_convergence, BathSetpoint};
use crate::experiment::fluidics::Fluidics;
use crate::experiment::phases::{Dwell, Phase, PhaseCatalogue, PhaseSpec};
use crate::experiment::plan::{ExperimentMatrix, FlowPlan, MatrixCell};
use crate::experiment::report::{CellOutcome, CellRecord, RunReport};
use crate::hardware::{video_path, Devices, SweepRequest, TemperatureBath};

/// Runs one campaign against a set of devices.
pub struct Sequencer {
    config: ExperimentConfig,
    matrix: ExperimentMatrix,
    plans: Vec<FlowPlan>,
    catalogue: PhaseCatalogue,
    fluidics: Fluidics,
    bath: Arc<dyn TemperatureBath>,
    acquisition: AcquisitionCoordinator,
}

impl Sequencer {
    /// Validate the configuration, derive the matrix and flow plans, and bind devices.
    ///
    /// # Errors
    ///
    /// `DaqError::Configuration` for anything that would fail mid-run; no
    /// device is touched.
    pub fn new(config: &ExperimentConfig, devices: Devices) -> AppResult<Self> {
        config.validate()?;
        let matrix = config.matrix()?;
        let plans = config.flow_plans()?;
        let catalogue = config.catalogue();

        Ok(Self {
            config: config.clone(),
            matrix,
            plans,
            catalogue,
            fluidics: Fluidics::new(
                devices.flow,
                devices.valves,
                config.flow_rates.response_time_s,
            ),
            bath: devices.bath,
            acquisition: AcquisitionCoordinator::new(devices.potentiostat, devices.recorder),
        })
    }

    /// The matrix this sequencer will run.
    pub fn matrix(&self) -> &ExperimentMatrix {
        &self.matrix
    }

    /// Run the whole campaign.
    pub async fn run(self) -> AppResult<RunReport> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run the campaign, stopping the matrix early when `shutdown` resolves.
    ///
    /// The terminal phases always run. Errors inside the matrix are recorded in
    /// the report rather than returned.
    ///
    /// # Errors
    ///
    /// Only the startup check can fail the call, before any flow is changed.
    pub async fn run_until<F>(self, shutdown: F) -> AppResult<RunReport>
    where
        F: Future<Output = ()>,
    {
        let mut report = RunReport::new(&self.config.application.name);
        info!(
            run_id = %report.run_id,
            cells = self.matrix.len(),
            channels = ?self.matrix.channels(),
            temperatures = ?self.matrix.temperatures(),
            "starting campaign"
        );

        self.fluidics.verify().await?;

        let stopped = tokio::select! {
            result = AssertUnwindSafe(self.run_matrix(&mut report)).catch_unwind() => {
                result.err().map(|panic| DaqError::Panicked(panic_message(&*panic)))
            }
            () = shutdown => Some(DaqError::Cancelled),
        };

        if let Some(reason) = stopped {
            if matches!(reason, DaqError::Cancelled) {
                warn!(
                    completed = report.completed_cells(),
                    "cancellation requested, running shutdown sequence"
                );
                report.cancelled = true;
            } else {
                error!(error = %reason, "matrix stopped, running shutdown sequence");
                report.fault = Some(reason.to_string());
            }
            record_interrupted_cell(&mut report, &reason);
            self.acquisition
                .abort_in_flight(self.config.recording.join_grace)
                .await;
        }

        self.run_terminal(&mut report).await;
        report.finished_at = Some(chrono::Utc::now());
        info!(
            run_id = %report.run_id,
            completed = report.completed_cells(),
            attempted = report.cells.len(),
            cancelled = report.cancelled,
            "campaign finished"
        );
        Ok(report)
    }

    async fn run_matrix(&self, report: &mut RunReport) {
        for &channel in self.matrix.channels() {
            let span = info_span!("channel", channel);
            if let Err((phase, e)) = self
                .prepare_channel(channel, report)
                .instrument(span.clone())
                .await
            {
                error!(channel, %phase, error = %e, "channel preparation failed, skipping channel");
                for cell in self.matrix.cells_for(channel) {
                    report.cells.push(CellRecord {
                        channel,
                        temperature_c: cell.temperature_c,
                        outcome: CellOutcome::Aborted {
                            phase,
                            reason: e.to_string(),
                        },
                    });
                }
                continue;
            }

            for cell in self.matrix.cells_for(channel) {
                let cell_span =
                    info_span!(parent: &span, "cell", temperature_c = cell.temperature_c);
                let outcome = match self.run_cell(cell, report).instrument(cell_span).await {
                    Ok((measurement, recording)) => CellOutcome::Completed {
                        measurement,
                        recording,
                    },
                    Err((phase, e)) => {
                        error!(
                            channel,
                            temperature_c = cell.temperature_c,
                            %phase,
                            error = %e,
                            cell_fatal = e.is_cell_fatal(),
                            "cell aborted"
                        );
                        CellOutcome::Aborted {
                            phase,
                            reason: e.to_string(),
                        }
                    }
                };
                report.cells.push(CellRecord {
                    channel,
                    temperature_c: cell.temperature_c,
                    outcome,
                });
            }
        }
    }

    async fn prepare_channel(
        &self,
        channel: u8,
        report: &mut RunReport,
    ) -> Result<(), (Phase, DaqError)> {
        let initial = self.config.temperatures.initial;
        let steps = [
            self.catalogue.wash(Phase::ChannelWash),
            self.catalogue.settle_temperature(Phase::SettleInitial, initial),
        ];
        for spec in steps {
            enter(report, spec.phase, Some(channel), Some(initial));
            self.execute(&spec).await.map_err(|e| (spec.phase, e))?;
        }
        Ok(())
    }

    async fn run_cell(
        &self,
        cell: MatrixCell,
        report: &mut RunReport,
    ) -> Result<(TaskStatus, TaskStatus), (Phase, DaqError)> {
        let mut acquired = None;
        for phase in Phase::CELL_SEQUENCE {
            enter(report, phase, Some(cell.channel), Some(cell.temperature_c));
            if let Some(outcome) = self
                .run_cell_phase(phase, cell)
                .await
                .map_err(|e| (phase, e))?
            {
                acquired = Some(outcome);
            }
        }
        Ok(acquired
            .map(|o| (o.measurement, o.recording))
            .unwrap_or((TaskStatus::Detached, TaskStatus::Detached)))
    }

    async fn run_cell_phase(
        &self,
        phase: Phase,
        cell: MatrixCell,
    ) -> AppResult<Option<AcquisitionOutcome>> {
        match phase {
            Phase::Wash => self.execute(&self.catalogue.wash(phase)).await?,
            Phase::PurgeChannel => self.execute(&self.catalogue.purge(cell.channel)).await?,
            Phase::SettleTemperature => {
                self.execute(&self.catalogue.settle_temperature(phase, cell.temperature_c))
                    .await?
            }
            Phase::SettleFlow => {
                let plan = self.plans.get(cell.step).copied().ok_or_else(|| {
                    DaqError::Configuration(format!("no flow plan for step {}", cell.step))
                })?;
                info!(a1 = plan.a1, a2 = plan.a2, b1 = plan.b1, b2 = plan.b2, "working flows");
                self.execute(&self.catalogue.settle_flow(plan)).await?
            }
            Phase::Measure => return Ok(Some(self.measure(cell).await)),
            Phase::FlushElectrode => self.execute(&self.catalogue.flush()).await?,
            Phase::CleanElectrode => self.clean(cell).await?,
            Phase::Degas => self.degas().await?,
            Phase::ChannelWash
            | Phase::SettleInitial
            | Phase::FinalWash
            | Phase::CoolDown
            | Phase::Shutdown => {
                return Err(DaqError::Configuration(format!(
                    "{phase} is not part of a matrix cell"
                )))
            }
        }
        Ok(None)
    }

    /// Apply a phase's fluidic state, then wait out its dwell.
    async fn execute(&self, spec: &PhaseSpec) -> AppResult<()> {
        self.fluidics.apply(spec).await?;
        match spec.dwell {
            Dwell::Fixed(duration) => sleep(duration).await,
            Dwell::Converge(target) => {
                self.bath
                    .set_on()
                    .await
                    .map_err(|e| DaqError::device("bath", e))?;
                let setpoint = BathSetpoint::new(self.bath.as_ref())
                    .with_flow_readout(self.fluidics.regulator());
                wait_for_convergence(&setpoint, target, &self.config.convergence).await?;
            }
        }
        Ok(())
    }

    async fn measure(&self, cell: MatrixCell) -> AcquisitionOutcome {
        let key = measurement_key(&cell, &self.config.measurement);
        let task = AcquisitionTask {
            sweep: SweepRequest {
                parameters: self.config.measurement.clone(),
                file_name: key.clone(),
                header: MEASUREMENT_HEADER.to_string(),
            },
            video_path: video_path(&self.config.application.data_dir, &key),
            recording_budget: self.config.recording_budget(),
            lead_delay: self.config.recording.lead_delay,
            join: self.config.join_policy(),
        };
        self.acquisition.run(task).await
    }

    async fn clean(&self, cell: MatrixCell) -> AppResult<()> {
        self.execute(&self.catalogue.clean()).await?;
        let request = SweepRequest {
            parameters: self.config.cleaning.clone(),
            file_name: cleaning_key(&cell),
            header: CLEANING_HEADER.to_string(),
        };
        if let Err(e) = self.acquisition.run_sweep(&request).await {
            warn!(error = %e, "cleaning sweep failed, continuing");
        }
        Ok(())
    }

    async fn degas(&self) -> AppResult<()> {
        self.execute(&self.catalogue.degas()).await?;
        let durations = self.catalogue.durations();

        self.fluidics.route(self.catalogue.air_routing()).await?;
        sleep(durations.air_hold).await;
        self.fluidics.route(self.catalogue.wash_routing()).await?;
        sleep(durations.bubble_removal).await;
        Ok(())
    }

    /// FinalWash, CoolDown, Shutdown. Every step is attempted.
    async fn run_terminal(&self, report: &mut RunReport) {
        let initial = self.config.temperatures.initial;
        let mut errors = Vec::new();

        for spec in [
            self.catalogue.wash(Phase::FinalWash),
            self.catalogue.settle_temperature(Phase::CoolDown, initial),
        ] {
            enter(report, spec.phase, None, None);
            if let Err(e) = guarded(self.execute(&spec)).await {
                error!(phase = %spec.phase, error = %e, "terminal phase failed");
                errors.push(e);
            }
        }

        enter(report, Phase::Shutdown, None, None);
        if let Err(e) = guarded(self.fluidics.zero()).await {
            error!(error = %e, "could not zero flows");
            errors.push(e);
        }

        if !errors.is_empty() {
            let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
            let err = DaqError::ShutdownFailed(errors);
            report.shutdown_error = Some(format!("{err}: {}", details.join("; ")));
        }
    }
}

/// Run a shutdown step, turning a panic into an error so later steps still run.
async fn guarded<F>(step: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    AssertUnwindSafe(step)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(DaqError::Panicked(panic_message(&*panic))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Close out the cell that was in progress when the matrix stopped early.
fn record_interrupted_cell(report: &mut RunReport, reason: &DaqError) {
    let Some(last) = report.phases.last() else {
        return;
    };
    if !Phase::CELL_SEQUENCE.contains(&last.phase) {
        return;
    }
    if let (Some(channel), Some(temperature_c)) = (last.channel, last.temperature_c) {
        let phase = last.phase;
        report.cells.push(CellRecord {
            channel,
            temperature_c,
            outcome: CellOutcome::Aborted {
                phase,
                reason: reason.to_string(),
            },
        });
    }
}

fn enter(
    report: &mut RunReport,
    phase: Phase,
    channel: Option<u8>,
    temperature_c: Option<f64>,
) {
    info!(%phase, ?channel, ?temperature_c, "entering phase");
    report.enter(phase, channel, temperature_c);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JoinMode;
    use crate::experiment::convergence::ConvergencePolicy;
    use crate::hardware::mock::SimulatedRig;
    use crate::hardware::Valve;
    use std::time::Duration;

    /// One channel, one temperature, fast sweeps.
    fn small_config() -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.valves.channels = vec![2];
        config.temperatures.working = vec![20.0];
        config.anolyte.targets.truncate(1);
        config.anolyte.total_flows.truncate(1);
        config.catholyte.targets.truncate(1);
        config.catholyte.total_flows.truncate(1);
        config.measurement.scan_rate_v_per_s = 0.1;
        config.measurement.vertex1_v = 0.45;
        config.measurement.initial_v = 0.25;
        config.cleaning.sweep_count = 1;
        config.convergence = ConvergencePolicy {
            poll_interval: Duration::from_secs(1),
            hold_count: 2,
            timeout: Some(Duration::from_secs(600)),
        };
        config.recording.join = JoinMode::Bounded;
        config.recording.join_grace = Duration::from_secs(2);
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_cell_phase_order() {
        let rig = SimulatedRig::new(20.0, 1.0);
        let sequencer = Sequencer::new(&small_config(), rig.devices()).unwrap();

        let report = sequencer.run().await.unwrap();

        assert_eq!(
            report.phases_for(2),
            vec![
                Phase::ChannelWash,
                Phase::SettleInitial,
                Phase::Wash,
                Phase::PurgeChannel,
                Phase::SettleTemperature,
                Phase::SettleFlow,
                Phase::Measure,
                Phase::FlushElectrode,
                Phase::CleanElectrode,
                Phase::Degas,
            ]
        );
        let tail: Vec<Phase> = report
            .phases
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(|r| r.phase)
            .collect();
        assert_eq!(tail, Phase::TERMINAL_SEQUENCE.to_vec());
        assert_eq!(report.completed_cells(), 1);
        assert!(report.shutdown_error.is_none());
        assert_eq!(rig.flow.targets().await, [0.0; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degas_goes_through_air_and_back() {
        let rig = SimulatedRig::new(20.0, 1.0);
        let sequencer = Sequencer::new(&small_config(), rig.devices()).unwrap();
        sequencer.run().await.unwrap();

        let moves = rig.valves.journal().await;
        let air = moves
            .windows(2)
            .position(|w| w == [(Valve::Inlet, 7), (Valve::Catholyte, 1)])
            .expect("valves never routed to air");
        assert_eq!(moves[air + 2], (Valve::Inlet, 0));
        assert_eq!(moves[air + 3], (Valve::Catholyte, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_use_expected_file_keys() {
        let rig = SimulatedRig::new(20.0, 1.0);
        let sequencer = Sequencer::new(&small_config(), rig.devices()).unwrap();
        sequencer.run().await.unwrap();

        let names: Vec<(String, String)> = rig
            .potentiostat
            .sweeps()
            .await
            .into_iter()
            .map(|s| (s.request.file_name, s.request.header))
            .collect();
        assert_eq!(
            names,
            vec![
                ("2_250mV_450mV_100mVs_20oC".to_string(), "CV".to_string()),
                ("2__20oC".to_string(), "CV_cleaning".to_string()),
            ]
        );
        let sessions = rig.recorder.sessions().await;
        assert!(sessions[0].output.ends_with("2_250mV_450mV_100mVs_20oC.mp4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleaning_failure_does_not_abort_cell() {
        let rig = SimulatedRig::new(20.0, 1.0);
        rig.potentiostat.set_failing(true);
        let sequencer = Sequencer::new(&small_config(), rig.devices()).unwrap();

        let report = sequencer.run().await.unwrap();

        assert_eq!(report.completed_cells(), 1);
        match &report.cells[0].outcome {
            CellOutcome::Completed { measurement, .. } => {
                assert!(matches!(measurement, TaskStatus::Failed(_)))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_invalid_config_is_rejected_before_devices() {
        let rig = SimulatedRig::new(20.0, 1.0);
        let mut config = small_config();
        config.anolyte.targets[0] = 100.0;
        assert!(matches!(
            Sequencer::new(&config, rig.devices()),
            Err(DaqError::Configuration(_))
        ));
    }
}
