//! Concurrent acquisition: a timed sweep with video recording alongside.
//!
//! The measurement task starts first; the recording task follows after a short
//! lead delay so the camera never misses the start of the sweep. The
//! coordinator then waits out the nominal measurement time `T`.
//!
//! What happens at `T` depends on the [`JoinPolicy`]:
//!
//! - `Detached`: return immediately and leave both tasks to finish on their own
//!   (the recorder stops itself at its budget).
//! - `Bounded { grace }`: give both tasks until `T + grace`; a recording still
//!   running is asked to stop, a sweep still running is aborted and awaited.
//!
//! If the run is cancelled mid-acquisition, [`AcquisitionCoordinator::abort_in_flight`]
//! ends both tasks before the caller touches the fluidics again.
//!
//! Task failures are logged and reported, never propagated: acquisition is
//! best-effort and the phase sequence continues on its timer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{info, warn};

use crate::error::DaqError;
use crate::experiment::plan::MatrixCell;
use crate::hardware::{PotentiostatRunner, SweepParameters, SweepRequest, VideoRecorder};

/// Data file header for measurement sweeps.
pub const MEASUREMENT_HEADER: &str = "CV";
/// Data file header for cleaning sweeps.
pub const CLEANING_HEADER: &str = "CV_cleaning";

/// File key for a measurement: channel, sweep window, scan rate and temperature.
///
/// e.g. `3_250mV_550mV_2mVs_20oC`
pub fn measurement_key(cell: &MatrixCell, sweep: &SweepParameters) -> String {
    format!(
        "{}_{:.0}mV_{:.0}mV_{:.0}mVs_{:.0}oC",
        cell.channel,
        sweep.initial_v * 1000.0,
        sweep.vertex1_v * 1000.0,
        sweep.scan_rate_v_per_s * 1000.0,
        cell.temperature_c
    )
}

/// File key for the cleaning sweeps of a cell: channel and temperature with an
/// empty sweep-window field, e.g. `3__20oC`.
pub fn cleaning_key(cell: &MatrixCell) -> String {
    format!("{}__{:.0}oC", cell.channel, cell.temperature_c)
}

/// What the coordinator does once the nominal measurement time has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinPolicy {
    /// Return at the deadline without joining either task.
    Detached,
    /// Join both tasks within `grace` of the deadline, force-stopping stragglers.
    Bounded {
        /// Extra time allowed past the deadline
        grace: Duration,
    },
}

/// One measurement-with-recording job.
#[derive(Debug, Clone)]
pub struct AcquisitionTask {
    /// Sweep to run
    pub sweep: SweepRequest,
    /// Video output file
    pub video_path: PathBuf,
    /// Maximum recording length; at least the measurement duration
    pub recording_budget: Duration,
    /// Delay between measurement start and recording start
    pub lead_delay: Duration,
    /// Behaviour at the deadline
    pub join: JoinPolicy,
}

impl AcquisitionTask {
    /// Nominal measurement duration `T`.
    pub fn duration(&self) -> Duration {
        self.sweep.parameters.duration()
    }
}

/// How one of the two tasks ended, as far as the coordinator knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum TaskStatus {
    /// Finished without error
    Completed,
    /// Finished with an error or panicked
    Failed(String),
    /// Recording still running at the join deadline and stopped on request
    ForceStopped,
    /// Sweep still running at the join deadline and aborted
    Aborted,
    /// Left running under `JoinPolicy::Detached`
    Detached,
}

impl TaskStatus {
    /// True when the task ended on its own without error.
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

/// Timing and result of one acquisition.
#[derive(Debug, Clone)]
pub struct AcquisitionOutcome {
    /// When the measurement task was spawned
    pub measurement_started: Instant,
    /// When the recording task was spawned
    pub recording_started: Instant,
    /// When control returned to the caller
    pub returned_at: Instant,
    /// Measurement result
    pub measurement: TaskStatus,
    /// Recording result
    pub recording: TaskStatus,
}

type TaskHandle = JoinHandle<anyhow::Result<()>>;

/// One of the two acquisition tasks. The handle is cleared once its result is taken.
struct Spawned {
    what: &'static str,
    handle: Option<TaskHandle>,
}

impl Spawned {
    fn new(what: &'static str, handle: TaskHandle) -> Self {
        Self {
            what,
            handle: Some(handle),
        }
    }

    fn is_joined(&self) -> bool {
        self.handle.is_none()
    }

    /// Take the result if the task has ended; a running task is left in place.
    async fn poll(&mut self) -> TaskStatus {
        match self.handle.take() {
            Some(handle) if handle.is_finished() => status_of(handle.await, self.what),
            running => {
                self.handle = running;
                TaskStatus::Detached
            }
        }
    }

    /// Wait until `deadline` for the task to end. `None` while it is still running.
    async fn join_until(&mut self, deadline: Instant) -> Option<TaskStatus> {
        let handle = self.handle.as_mut()?;
        let result = timeout_at(deadline, handle).await.ok()?;
        self.handle = None;
        Some(status_of(result, self.what))
    }

    /// Abort the task and wait until it has been torn down.
    async fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            // Either cancelled or finished just before the abort landed.
            let _ = handle.await;
        }
    }
}

/// Tasks of the acquisition in progress.
struct InFlight {
    measurement: Spawned,
    recording: Option<Spawned>,
}

/// Runs the potentiostat and recorder together.
///
/// Holds only the two acquisition handles, so nothing it does can touch the
/// flow channels or valves. Tasks that outlive a call to [`run`](Self::run),
/// because the call was dropped or the policy detached them, stay reachable
/// through [`abort_in_flight`](Self::abort_in_flight).
pub struct AcquisitionCoordinator {
    potentiostat: Arc<dyn PotentiostatRunner>,
    recorder: Arc<dyn VideoRecorder>,
    in_flight: Mutex<Option<InFlight>>,
}

impl AcquisitionCoordinator {
    /// Wrap the potentiostat and recorder handles.
    pub fn new(
        potentiostat: Arc<dyn PotentiostatRunner>,
        recorder: Arc<dyn VideoRecorder>,
    ) -> Self {
        Self {
            potentiostat,
            recorder,
            in_flight: Mutex::new(None),
        }
    }

    /// Run a sweep synchronously, without recording. Failures are returned.
    pub async fn run_sweep(&self, request: &SweepRequest) -> Result<(), DaqError> {
        self.potentiostat
            .run_sweep(request)
            .await
            .map_err(|e| DaqError::Acquisition(format!("sweep '{}': {e:#}", request.file_name)))
    }

    /// Run measurement and recording concurrently and return no earlier than `T`
    /// after the measurement started.
    pub async fn run(&self, task: AcquisitionTask) -> AcquisitionOutcome {
        let duration = task.duration();
        // Held until both tasks are settled. If this future is dropped first the
        // tasks stay in the slot.
        let mut slot = self.in_flight.lock().await;
        let measurement_started = Instant::now();
        let deadline = measurement_started + duration;

        info!(
            file = %task.sweep.file_name,
            ?duration,
            lead = ?task.lead_delay,
            "starting measurement"
        );
        let tasks = slot.insert(InFlight {
            measurement: Spawned::new("measurement", self.spawn_sweep(task.sweep.clone())),
            recording: None,
        });

        sleep(task.lead_delay).await;

        let recording_started = Instant::now();
        info!(
            path = %task.video_path.display(),
            budget = ?task.recording_budget,
            "starting recording"
        );
        let recording_task = tasks.recording.insert(Spawned::new(
            "recording",
            self.spawn_recording(task.recording_budget, task.video_path.clone()),
        ));

        sleep_until(deadline).await;

        let (measurement, recording) = match task.join {
            JoinPolicy::Detached => (
                tasks.measurement.poll().await,
                recording_task.poll().await,
            ),
            JoinPolicy::Bounded { grace } => {
                let join_deadline = deadline + grace;
                let measurement = match tasks.measurement.join_until(join_deadline).await {
                    Some(status) => status,
                    None => {
                        warn!(?grace, "measurement still running past deadline, aborting");
                        tasks.measurement.abort().await;
                        TaskStatus::Aborted
                    }
                };
                let recording = match recording_task.join_until(join_deadline).await {
                    Some(status) => status,
                    None => {
                        warn!(?grace, "recording still running past deadline, stopping it");
                        self.force_stop(recording_task, grace).await
                    }
                };
                (measurement, recording)
            }
        };
        if tasks.measurement.is_joined() && recording_task.is_joined() {
            *slot = None;
        }

        let returned_at = Instant::now();
        let elapsed = returned_at - measurement_started;
        info!(?measurement, ?recording, ?elapsed, "acquisition finished");

        AcquisitionOutcome {
            measurement_started,
            recording_started,
            returned_at,
            measurement,
            recording,
        }
    }

    /// Stop whatever acquisition is still in flight and wait for both tasks to end.
    ///
    /// The sweep is aborted outright. The recording is asked to stop and given
    /// `grace` to close its file before it is aborted too.
    pub async fn abort_in_flight(&self, grace: Duration) {
        let Some(mut tasks) = self.in_flight.lock().await.take() else {
            return;
        };
        if !tasks.measurement.is_joined() {
            warn!("aborting measurement in flight");
            tasks.measurement.abort().await;
        }
        if let Some(recording) = tasks.recording.as_mut().filter(|r| !r.is_joined()) {
            warn!(?grace, "stopping recording in flight");
            let status = self.force_stop(recording, grace).await;
            info!(?status, "recording closed");
        }
    }

    fn spawn_sweep(&self, request: SweepRequest) -> TaskHandle {
        let potentiostat = Arc::clone(&self.potentiostat);
        tokio::spawn(async move { potentiostat.run_sweep(&request).await })
    }

    fn spawn_recording(&self, budget: Duration, path: PathBuf) -> TaskHandle {
        let recorder = Arc::clone(&self.recorder);
        tokio::spawn(async move { recorder.start_session(budget, &path).await })
    }

    async fn force_stop(&self, recording: &mut Spawned, grace: Duration) -> TaskStatus {
        if let Err(e) = self.recorder.stop_session().await {
            warn!(error = %format!("{e:#}"), "stop_session failed");
        }
        match recording.join_until(Instant::now() + grace).await {
            Some(TaskStatus::Failed(reason)) => TaskStatus::Failed(reason),
            Some(_) => TaskStatus::ForceStopped,
            None => {
                warn!("recording ignored stop request, aborting task");
                recording.abort().await;
                TaskStatus::ForceStopped
            }
        }
    }
}

fn status_of(result: Result<anyhow::Result<()>, JoinError>, what: &str) -> TaskStatus {
    match result {
        Ok(Ok(())) => TaskStatus::Completed,
        Ok(Err(e)) => {
            let err = DaqError::Acquisition(format!("{what}: {e:#}"));
            warn!(error = %err, "acquisition task failed");
            TaskStatus::Failed(err.to_string())
        }
        Err(join_err) => {
            let err = DaqError::Acquisition(format!("{what} task did not complete: {join_err}"));
            warn!(error = %err, "acquisition task failed");
            TaskStatus::Failed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockPotentiostat, MockRecorder};

    /// 0 V → 0.5 V at 0.125 V/s: T = 4 s.
    fn four_second_sweep() -> SweepRequest {
        SweepRequest {
            parameters: SweepParameters {
                initial_v: 0.0,
                vertex1_v: 0.5,
                vertex2_v: 0.0,
                final_v: 0.0,
                scan_rate_v_per_s: 0.125,
                increment_v: 0.001,
                sweep_count: 1,
                sensitivity_a_per_v: 1e-4,
            },
            file_name: "1_0mV_500mV_125mVs_20oC".into(),
            header: MEASUREMENT_HEADER.into(),
        }
    }

    fn task(join: JoinPolicy, budget: Duration) -> AcquisitionTask {
        AcquisitionTask {
            sweep: four_second_sweep(),
            video_path: PathBuf::from("clip.mp4"),
            recording_budget: budget,
            lead_delay: Duration::from_secs(1),
            join,
        }
    }

    fn coordinator(
        recorder: MockRecorder,
    ) -> (Arc<MockPotentiostat>, Arc<MockRecorder>, AcquisitionCoordinator) {
        let pstat = Arc::new(MockPotentiostat::new());
        let recorder = Arc::new(recorder);
        let coordinator = AcquisitionCoordinator::new(pstat.clone(), recorder.clone());
        (pstat, recorder, coordinator)
    }

    #[test]
    fn test_measurement_key_format() {
        let cell = MatrixCell {
            channel: 3,
            temperature_c: 20.0,
            step: 1,
        };
        let sweep = SweepParameters {
            initial_v: 0.25,
            vertex1_v: 0.55,
            vertex2_v: 0.4,
            final_v: 0.3,
            scan_rate_v_per_s: 0.002,
            increment_v: 0.001,
            sweep_count: 1,
            sensitivity_a_per_v: 1e-4,
        };
        assert_eq!(measurement_key(&cell, &sweep), "3_250mV_550mV_2mVs_20oC");
        assert_eq!(cleaning_key(&cell), "3__20oC");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_lags_measurement_by_lead() {
        let (pstat, recorder, coordinator) = coordinator(MockRecorder::new());
        let job = task(
            JoinPolicy::Bounded {
                grace: Duration::from_secs(2),
            },
            Duration::from_secs(5),
        );
        assert_eq!(job.duration(), Duration::from_secs(4));

        let outcome = coordinator.run(job).await;

        let sweep_start = pstat.sweeps().await[0].started_at;
        let record_start = recorder.sessions().await[0].started_at;
        let lag = record_start - sweep_start;
        assert!(
            lag >= Duration::from_secs(1) && lag <= Duration::from_millis(1050),
            "lag {lag:?}"
        );
        assert!(outcome.returned_at - outcome.measurement_started >= Duration::from_secs(4));
        assert!(outcome.measurement.is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_no_earlier_than_measurement_duration() {
        let (_, _, coordinator) = coordinator(MockRecorder::new());
        let mut job = task(JoinPolicy::Detached, Duration::from_secs(10));
        job.sweep.parameters.vertex1_v = 1.25;
        job.sweep.parameters.scan_rate_v_per_s = 0.25;
        assert_eq!(job.duration(), Duration::from_secs(5));

        let outcome = coordinator.run(job).await;

        let elapsed = outcome.returned_at - outcome.measurement_started;
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_millis(5100));
        assert_eq!(
            outcome.recording_started - outcome.measurement_started,
            Duration::from_secs(1)
        );
        // Recording budget outlives the sweep: still running when we return.
        assert_eq!(outcome.recording, TaskStatus::Detached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_join_force_stops_long_recording() {
        // Warm-up pushes the recording far past the deadline.
        let (_, recorder, coordinator) =
            coordinator(MockRecorder::with_warmup(Duration::from_secs(4)));
        let grace = Duration::from_secs(2);
        let outcome = coordinator
            .run(task(JoinPolicy::Bounded { grace }, Duration::from_secs(4)))
            .await;

        assert_eq!(outcome.recording, TaskStatus::ForceStopped);
        let elapsed = outcome.returned_at - outcome.measurement_started;
        assert!(elapsed <= Duration::from_secs(4) + grace * 2);
        let sessions = recorder.sessions().await;
        assert!(sessions[0].stopped);
        assert!(sessions[0].ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_measurement_failure_is_contained() {
        let (pstat, recorder, coordinator) = coordinator(MockRecorder::new());
        pstat.set_failing(true);

        let outcome = coordinator
            .run(task(
                JoinPolicy::Bounded {
                    grace: Duration::from_secs(2),
                },
                Duration::from_secs(4),
            ))
            .await;

        assert!(
            matches!(outcome.measurement, TaskStatus::Failed(ref msg) if msg.contains("measurement"))
        );
        // No cancellation propagation: the recording still ran its budget.
        assert!(outcome.recording.is_completed());
        assert!(!recorder.sessions().await[0].stopped);
        assert!(outcome.returned_at - outcome.measurement_started >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_run_is_aborted_in_flight() {
        let (pstat, recorder, coordinator) = coordinator(MockRecorder::new());
        let job = task(
            JoinPolicy::Bounded {
                grace: Duration::from_secs(2),
            },
            Duration::from_secs(10),
        );

        // Dropped at 2 s, with the sweep and the recording both running.
        let interrupted =
            tokio::time::timeout(Duration::from_secs(2), coordinator.run(job)).await;
        assert!(interrupted.is_err());
        assert!(coordinator.in_flight.lock().await.is_some());

        coordinator.abort_in_flight(Duration::from_secs(1)).await;

        assert!(coordinator.in_flight.lock().await.is_none());
        assert_eq!(pstat.sweeps().await.len(), 1);
        let sessions = recorder.sessions().await;
        assert!(sessions[0].stopped);
        assert!(sessions[0].ended_at.is_some());

        // Nothing left to stop.
        coordinator.abort_in_flight(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_run_leaves_nothing_in_flight() {
        let (_, _, coordinator) = coordinator(MockRecorder::new());
        coordinator
            .run(task(
                JoinPolicy::Bounded {
                    grace: Duration::from_secs(2),
                },
                Duration::from_secs(4),
            ))
            .await;
        assert!(coordinator.in_flight.lock().await.is_none());
    }
}
