//! End-to-end campaigns against the simulated rig on a paused clock.

use async_trait::async_trait;
use flowcell_daq::config::ExperimentConfig;
use flowcell_daq::experiment::convergence::ConvergencePolicy;
use flowcell_daq::experiment::{CellOutcome, Phase, Sequencer};
use flowcell_daq::hardware::mock::{MockBath, SimulatedRig};
use flowcell_daq::hardware::{PotentiostatRunner, SweepRequest, TemperatureBath, Valve};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Channels {1, 2} at {10, 20} °C, starting and ending at 20 °C.
fn campaign_config() -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.application.name = "e2e".into();
    config.valves.channels = vec![1, 2];
    config.temperatures.working = vec![10.0, 20.0];
    config.temperatures.initial = 20.0;
    for electrolyte in [&mut config.anolyte, &mut config.catholyte] {
        electrolyte.targets.truncate(2);
        electrolyte.total_flows.truncate(2);
    }
    // 0.25 V → 0.45 V at 0.1 V/s: two-second measurement
    config.measurement.vertex1_v = 0.45;
    config.measurement.scan_rate_v_per_s = 0.1;
    config.cleaning.sweep_count = 1;
    config.convergence = ConvergencePolicy {
        poll_interval: Duration::from_secs(1),
        hold_count: 3,
        timeout: Some(Duration::from_secs(600)),
    };
    config
}

#[tokio::test(start_paused = true)]
async fn test_two_channel_two_temperature_campaign() {
    let rig = SimulatedRig::new(20.0, 0.5);
    let sequencer = Sequencer::new(&campaign_config(), rig.devices()).unwrap();

    let report = sequencer.run().await.unwrap();

    assert_eq!(report.count(Phase::Measure), 4);
    assert_eq!(report.count(Phase::SettleTemperature), 4);
    assert_eq!(report.completed_cells(), 4);
    assert!(!report.cancelled);
    assert!(report.shutdown_error.is_none());

    // Every measurement is preceded by its own temperature and flow settling.
    let phases: Vec<Phase> = report.phases.iter().map(|r| r.phase).collect();
    for (i, phase) in phases.iter().enumerate() {
        if *phase == Phase::Measure {
            assert_eq!(phases[i - 1], Phase::SettleFlow);
            assert_eq!(phases[i - 2], Phase::SettleTemperature);
            assert_eq!(
                report.phases[i - 2].temperature_c,
                report.phases[i].temperature_c
            );
        }
    }

    // Cells run channel-major.
    let cells: Vec<(u8, f64)> = report
        .cells
        .iter()
        .map(|c| (c.channel, c.temperature_c))
        .collect();
    assert_eq!(cells, vec![(1, 10.0), (1, 20.0), (2, 10.0), (2, 20.0)]);

    assert_eq!(&phases[phases.len() - 3..], &Phase::TERMINAL_SEQUENCE);

    // Cool-down returns the bath to the initial temperature.
    assert_eq!(
        rig.bath.setpoint_history().await,
        vec![20.0, 10.0, 20.0, 10.0, 20.0]
    );
    assert_eq!(rig.flow.targets().await, [0.0; 4]);

    // Recording trails each measurement by the lead delay.
    let sweeps = rig.potentiostat.sweeps().await;
    let sessions = rig.recorder.sessions().await;
    let measurements: Vec<_> = sweeps
        .iter()
        .filter(|s| s.request.header == "CV")
        .collect();
    assert_eq!(measurements.len(), 4);
    assert_eq!(sessions.len(), 4);
    for (sweep, session) in measurements.iter().zip(&sessions) {
        assert_eq!(session.started_at - sweep.started_at, Duration::from_secs(1));
    }
}

#[tokio::test(start_paused = true)]
async fn test_valve_fault_aborts_only_affected_channel() {
    let rig = SimulatedRig::new(20.0, 0.5);
    rig.valves.reject_position(Valve::Inlet, 2).await;
    let sequencer = Sequencer::new(&campaign_config(), rig.devices()).unwrap();

    let report = sequencer.run().await.unwrap();

    assert_eq!(report.completed_cells(), 2);
    for cell in report.cells.iter().filter(|c| c.channel == 2) {
        match &cell.outcome {
            CellOutcome::Aborted { phase, reason } => {
                assert_eq!(*phase, Phase::PurgeChannel);
                assert!(reason.contains("valve[1]"), "{reason}");
            }
            other => panic!("channel 2 should abort, got {other:?}"),
        }
    }
    // Channel 2 never reached temperature settling.
    assert!(!report.phases_for(2).contains(&Phase::SettleTemperature));
    assert_eq!(report.last_phase(), Some(Phase::Shutdown));
    assert_eq!(rig.flow.targets().await, [0.0; 4]);
}

#[tokio::test(start_paused = true)]
async fn test_bath_timeout_aborts_cell_and_continues() {
    // A bath that cannot move: 10 °C is unreachable, 20 °C is already there.
    let rig = SimulatedRig::new(20.0, 0.0);
    let mut config = campaign_config();
    config.valves.channels = vec![1];
    config.convergence.timeout = Some(Duration::from_secs(60));
    let sequencer = Sequencer::new(&config, rig.devices()).unwrap();

    let report = sequencer.run().await.unwrap();

    assert_eq!(report.cells.len(), 2);
    match &report.cells[0].outcome {
        CellOutcome::Aborted { phase, reason } => {
            assert_eq!(*phase, Phase::SettleTemperature);
            assert!(reason.contains("did not converge"), "{reason}");
        }
        other => panic!("10 °C cell should time out, got {other:?}"),
    }
    assert!(matches!(report.cells[1].outcome, CellOutcome::Completed { .. }));
    assert_eq!(report.count(Phase::Measure), 1);
    assert!(report.shutdown_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_still_shuts_down() {
    let rig = SimulatedRig::new(20.0, 0.5);
    let sequencer = Sequencer::new(&campaign_config(), rig.devices()).unwrap();

    // Lands in the first cell's wash.
    let report = sequencer
        .run_until(tokio::time::sleep(Duration::from_secs(90)))
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.completed_cells(), 0);
    assert_eq!(report.cells.len(), 1);
    match &report.cells[0].outcome {
        CellOutcome::Aborted { phase, reason } => {
            assert_eq!(*phase, Phase::Wash);
            assert_eq!(reason, "Run cancelled");
        }
        other => panic!("interrupted cell should be aborted, got {other:?}"),
    }
    assert_eq!(
        report.phases_for(1),
        vec![Phase::ChannelWash, Phase::SettleInitial, Phase::Wash]
    );
    let tail: Vec<Phase> = report.phases.iter().skip(3).map(|r| r.phase).collect();
    assert_eq!(tail, Phase::TERMINAL_SEQUENCE.to_vec());
    assert_eq!(rig.flow.targets().await, [0.0; 4]);
    assert!(report.finished_at.is_some());
}

/// Clears the flag when the sweep future is dropped, whether it finished or was aborted.
struct ActiveSweep(Arc<AtomicBool>);

impl Drop for ActiveSweep {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Potentiostat whose measurement sweeps run far longer than their nominal time.
struct StuckPotentiostat {
    active: Arc<AtomicBool>,
    started: Arc<Notify>,
}

#[async_trait]
impl PotentiostatRunner for StuckPotentiostat {
    async fn run_sweep(&self, request: &SweepRequest) -> anyhow::Result<()> {
        if request.header != "CV" {
            return Ok(());
        }
        self.active.store(true, Ordering::SeqCst);
        let _active = ActiveSweep(Arc::clone(&self.active));
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(200)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_measurement_ends_sweep_before_shutdown() {
    let rig = SimulatedRig::new(20.0, 0.5);
    let active = Arc::new(AtomicBool::new(false));
    let started = Arc::new(Notify::new());
    let mut devices = rig.devices();
    devices.potentiostat = Arc::new(StuckPotentiostat {
        active: Arc::clone(&active),
        started: Arc::clone(&started),
    });
    let sequencer = Sequencer::new(&campaign_config(), devices).unwrap();

    // Cancel once the recording has joined the sweep.
    let shutdown = async move {
        started.notified().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
    };
    let report = sequencer.run_until(shutdown).await.unwrap();

    assert!(report.cancelled);
    assert!(!active.load(Ordering::SeqCst), "sweep outlived the run");
    match &report.cells[0].outcome {
        CellOutcome::Aborted { phase, reason } => {
            assert_eq!(*phase, Phase::Measure);
            assert_eq!(reason, "Run cancelled");
        }
        other => panic!("interrupted cell should be aborted, got {other:?}"),
    }
    let phases: Vec<Phase> = report.phases.iter().map(|r| r.phase).collect();
    assert_eq!(&phases[phases.len() - 4..phases.len() - 3], &[Phase::Measure]);
    assert_eq!(&phases[phases.len() - 3..], &Phase::TERMINAL_SEQUENCE);

    let sessions = rig.recorder.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].stopped);
    assert!(sessions[0].ended_at.is_some());
    assert_eq!(rig.flow.targets().await, [0.0; 4]);
}

/// Bath whose driver panics on the first read after being sent to `trip_at`.
struct FaultyBath {
    inner: MockBath,
    trip_at: f64,
    tripped: AtomicBool,
}

#[async_trait]
impl TemperatureBath for FaultyBath {
    async fn set_on(&self) -> anyhow::Result<()> {
        self.inner.set_on().await
    }

    async fn set_setpoint(&self, celsius: f64) -> anyhow::Result<()> {
        self.inner.set_setpoint(celsius).await
    }

    async fn read_setpoint(&self) -> anyhow::Result<f64> {
        self.inner.read_setpoint().await
    }

    async fn read_temperature(&self) -> anyhow::Result<f64> {
        let setpoint = self.inner.read_setpoint().await?;
        if setpoint == self.trip_at && !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("bath driver fault");
        }
        self.inner.read_temperature().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_driver_panic_still_reaches_shutdown() {
    let rig = SimulatedRig::new(20.0, 0.5);
    let mut devices = rig.devices();
    devices.bath = Arc::new(FaultyBath {
        inner: MockBath::new(20.0, 0.5),
        trip_at: 10.0,
        tripped: AtomicBool::new(false),
    });
    let sequencer = Sequencer::new(&campaign_config(), devices).unwrap();

    let report = sequencer.run().await.unwrap();

    assert!(!report.cancelled);
    let fault = report.fault.as_deref().unwrap_or_default();
    assert!(fault.contains("bath driver fault"), "{fault}");
    assert_eq!(report.cells.len(), 1);
    match &report.cells[0].outcome {
        CellOutcome::Aborted { phase, reason } => {
            assert_eq!(*phase, Phase::SettleTemperature);
            assert!(reason.contains("panicked"), "{reason}");
        }
        other => panic!("cell should abort on the panic, got {other:?}"),
    }
    let phases: Vec<Phase> = report.phases.iter().map(|r| r.phase).collect();
    assert_eq!(&phases[phases.len() - 3..], &Phase::TERMINAL_SEQUENCE);
    assert!(report.shutdown_error.is_none());
    assert_eq!(rig.flow.targets().await, [0.0; 4]);
}
