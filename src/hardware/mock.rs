//! Mock Hardware Implementations
//!
//! Provides simulated rig devices for testing without physical hardware.
//! All mock devices use async-safe operations (`tokio::time::sleep`, not
//! `std::thread::sleep`) and `tokio::time::Instant`, so tests can run them on a
//! paused clock.
//!
//! # Available Mocks
//!
//! - `MockFlowRegulator` - Four channels with ideal regulation
//! - `MockValvePositioner` - Two valves, optional rejected positions
//! - `MockBath` - Linear approach to setpoint at a fixed rate while running
//! - `MockPotentiostat` - Sweeps take their nominal duration
//! - `MockRecorder` - Frame loop bounded by the session budget
//!
//! Every mock keeps a journal of the commands it received so tests can assert
//! on ordering.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::hardware::{
    Devices, FlowChannel, FlowRegulator, PotentiostatRunner, SweepRequest, TemperatureBath,
    Valve, ValvePositioner, VideoRecorder,
};

// =============================================================================
// MockFlowRegulator
// =============================================================================

/// Commands seen by [`MockFlowRegulator`].
#[derive(Debug, Clone, PartialEq)]
pub enum FlowCommand {
    /// `set_target(channel, value)`
    Target(FlowChannel, f64),
    /// `set_response_time(channel, seconds)`
    ResponseTime(FlowChannel, u32),
}

/// Flow regulator whose measured flow always equals its target.
#[derive(Default)]
pub struct MockFlowRegulator {
    targets: RwLock<[f64; 4]>,
    journal: Mutex<Vec<FlowCommand>>,
}

impl MockFlowRegulator {
    /// Create with all channels at zero flow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current targets in channel order A1, A2, B1, B2.
    pub async fn targets(&self) -> [f64; 4] {
        *self.targets.read().await
    }

    /// Every command received so far.
    pub async fn journal(&self) -> Vec<FlowCommand> {
        self.journal.lock().await.clone()
    }
}

#[async_trait]
impl FlowRegulator for MockFlowRegulator {
    async fn set_target(&self, channel: FlowChannel, ul_per_min: f64) -> Result<()> {
        if !ul_per_min.is_finite() || ul_per_min < 0.0 {
            bail!("MockFlowRegulator: invalid target {ul_per_min} on {channel}");
        }
        self.targets.write().await[channel.index()] = ul_per_min;
        self.journal
            .lock()
            .await
            .push(FlowCommand::Target(channel, ul_per_min));
        Ok(())
    }

    async fn set_response_time(&self, channel: FlowChannel, seconds: u32) -> Result<()> {
        self.journal
            .lock()
            .await
            .push(FlowCommand::ResponseTime(channel, seconds));
        Ok(())
    }

    async fn read_value(&self, channel: FlowChannel) -> Result<f64> {
        Ok(self.targets.read().await[channel.index()])
    }
}

// =============================================================================
// MockValvePositioner
// =============================================================================

/// Two-valve positioner.
pub struct MockValvePositioner {
    positions: RwLock<[u8; 2]>,
    rejected: RwLock<HashSet<(Valve, u8)>>,
    channel_count: usize,
    journal: Mutex<Vec<(Valve, u8)>>,
}

impl MockValvePositioner {
    /// Create with both valves at position 0.
    pub fn new() -> Self {
        Self::with_channel_count(2)
    }

    /// Create reporting a custom number of valve channels.
    pub fn with_channel_count(channel_count: usize) -> Self {
        Self {
            positions: RwLock::new([0, 0]),
            rejected: RwLock::new(HashSet::new()),
            channel_count,
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Make every move of `valve` to `position` fail.
    pub async fn reject_position(&self, valve: Valve, position: u8) {
        self.rejected.write().await.insert((valve, position));
    }

    /// Every successful move so far.
    pub async fn journal(&self) -> Vec<(Valve, u8)> {
        self.journal.lock().await.clone()
    }
}

impl Default for MockValvePositioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ValvePositioner for MockValvePositioner {
    async fn set_position(&self, valve: Valve, position: u8) -> Result<()> {
        if self.rejected.read().await.contains(&(valve, position)) {
            bail!("MockValvePositioner: {valve} cannot reach position {position}");
        }
        self.positions.write().await[valve.index()] = position;
        self.journal.lock().await.push((valve, position));
        Ok(())
    }

    async fn position(&self, valve: Valve) -> Result<u8> {
        Ok(self.positions.read().await[valve.index()])
    }

    async fn channel_count(&self) -> Result<usize> {
        Ok(self.channel_count)
    }
}

// =============================================================================
// MockBath
// =============================================================================

struct BathState {
    running: bool,
    setpoint: f64,
    temperature: f64,
    updated: Instant,
}

/// Bath that moves linearly towards its setpoint while running.
pub struct MockBath {
    state: Mutex<BathState>,
    rate_c_per_s: f64,
    setpoints: Mutex<Vec<f64>>,
}

impl MockBath {
    /// Create a stopped bath at `temperature` approaching setpoints at `rate_c_per_s`.
    pub fn new(temperature: f64, rate_c_per_s: f64) -> Self {
        Self {
            state: Mutex::new(BathState {
                running: false,
                setpoint: temperature,
                temperature,
                updated: Instant::now(),
            }),
            rate_c_per_s,
            setpoints: Mutex::new(Vec::new()),
        }
    }

    /// Distinct setpoints commanded so far, in order.
    pub async fn setpoint_history(&self) -> Vec<f64> {
        self.setpoints.lock().await.clone()
    }

    /// Whether `set_on` has been called.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    fn advance(state: &mut BathState, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.updated).as_secs_f64();
        state.updated = now;
        if !state.running {
            return;
        }
        let gap = state.setpoint - state.temperature;
        let step = rate * elapsed;
        if gap.abs() <= step {
            state.temperature = state.setpoint;
        } else {
            state.temperature += step * gap.signum();
        }
    }
}

#[async_trait]
impl TemperatureBath for MockBath {
    async fn set_on(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::advance(&mut state, self.rate_c_per_s);
        state.running = true;
        Ok(())
    }

    async fn set_setpoint(&self, celsius: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::advance(&mut state, self.rate_c_per_s);
        state.setpoint = celsius;
        drop(state);

        let mut history = self.setpoints.lock().await;
        if history.last() != Some(&celsius) {
            history.push(celsius);
        }
        Ok(())
    }

    async fn read_setpoint(&self) -> Result<f64> {
        Ok(self.state.lock().await.setpoint)
    }

    async fn read_temperature(&self) -> Result<f64> {
        let mut state = self.state.lock().await;
        Self::advance(&mut state, self.rate_c_per_s);
        Ok(state.temperature)
    }
}

// =============================================================================
// MockPotentiostat
// =============================================================================

/// A sweep seen by [`MockPotentiostat`].
#[derive(Debug, Clone)]
pub struct SweepRecord {
    /// Request as received
    pub request: SweepRequest,
    /// When the sweep started
    pub started_at: Instant,
}

/// Potentiostat whose sweeps take their nominal duration.
#[derive(Default)]
pub struct MockPotentiostat {
    sweeps: Mutex<Vec<SweepRecord>>,
    fail: AtomicBool,
}

impl MockPotentiostat {
    /// Create a working potentiostat.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sweeps fail immediately.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// All sweeps started so far.
    pub async fn sweeps(&self) -> Vec<SweepRecord> {
        self.sweeps.lock().await.clone()
    }
}

#[async_trait]
impl PotentiostatRunner for MockPotentiostat {
    async fn run_sweep(&self, request: &SweepRequest) -> Result<()> {
        self.sweeps.lock().await.push(SweepRecord {
            request: request.clone(),
            started_at: Instant::now(),
        });
        if self.fail.load(Ordering::SeqCst) {
            bail!("MockPotentiostat: sweep '{}' failed", request.file_name);
        }
        let duration = request.parameters.duration();
        debug!(file = %request.file_name, ?duration, "MockPotentiostat: sweeping");
        sleep(duration).await;
        Ok(())
    }
}

// =============================================================================
// MockRecorder
// =============================================================================

/// A recording session seen by [`MockRecorder`].
#[derive(Debug, Clone)]
pub struct RecordingSession {
    /// Output file
    pub output: PathBuf,
    /// When `start_session` was called
    pub started_at: Instant,
    /// When the session closed
    pub ended_at: Option<Instant>,
    /// Frames pushed to the file
    pub frames: u64,
    /// Ended by `stop_session` rather than by its budget
    pub stopped: bool,
}

/// Recorder that pushes frames until its budget elapses or it is stopped.
pub struct MockRecorder {
    frame_period: Duration,
    warmup: Duration,
    stop: Notify,
    sessions: Mutex<Vec<RecordingSession>>,
}

impl MockRecorder {
    /// Create a 25 fps recorder with no warm-up.
    pub fn new() -> Self {
        Self::with_warmup(Duration::ZERO)
    }

    /// Create a recorder that spends `warmup` preparing before its budget starts
    /// counting, the way the camera SDK does.
    pub fn with_warmup(warmup: Duration) -> Self {
        Self {
            frame_period: Duration::from_millis(40),
            warmup,
            stop: Notify::new(),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// All sessions started so far.
    pub async fn sessions(&self) -> Vec<RecordingSession> {
        self.sessions.lock().await.clone()
    }
}

impl Default for MockRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VideoRecorder for MockRecorder {
    async fn start_session(&self, max_duration: Duration, output: &Path) -> Result<()> {
        let index = {
            let mut sessions = self.sessions.lock().await;
            sessions.push(RecordingSession {
                output: output.to_path_buf(),
                started_at: Instant::now(),
                ended_at: None,
                frames: 0,
                stopped: false,
            });
            sessions.len() - 1
        };

        let stop = self.stop.notified();
        tokio::pin!(stop);

        let mut frames = 0_u64;
        let stopped = tokio::select! {
            _ = &mut stop => true,
            _ = async {
                sleep(self.warmup).await;
                let deadline = Instant::now() + max_duration;
                while Instant::now() + self.frame_period <= deadline {
                    sleep(self.frame_period).await;
                    frames += 1;
                }
            } => false,
        };

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(index) {
            session.ended_at = Some(Instant::now());
            session.frames = frames;
            session.stopped = stopped;
        }
        debug!(output = %output.display(), frames, stopped, "MockRecorder: session closed");
        Ok(())
    }

    async fn stop_session(&self) -> Result<()> {
        self.stop.notify_waiters();
        Ok(())
    }
}

// =============================================================================
// SimulatedRig
// =============================================================================

/// A full set of simulated devices with typed handles kept for inspection.
#[derive(Clone)]
pub struct SimulatedRig {
    /// Flow channels
    pub flow: Arc<MockFlowRegulator>,
    /// Valves
    pub valves: Arc<MockValvePositioner>,
    /// Bath
    pub bath: Arc<MockBath>,
    /// Potentiostat
    pub potentiostat: Arc<MockPotentiostat>,
    /// Recorder
    pub recorder: Arc<MockRecorder>,
}

impl SimulatedRig {
    /// Build a rig whose bath starts at `temperature` and moves at `bath_rate_c_per_s`.
    pub fn new(temperature: f64, bath_rate_c_per_s: f64) -> Self {
        Self {
            flow: Arc::new(MockFlowRegulator::new()),
            valves: Arc::new(MockValvePositioner::new()),
            bath: Arc::new(MockBath::new(temperature, bath_rate_c_per_s)),
            potentiostat: Arc::new(MockPotentiostat::new()),
            recorder: Arc::new(MockRecorder::new()),
        }
    }

    /// Trait-object handles for the sequencer.
    pub fn devices(&self) -> Devices {
        Devices {
            flow: self.flow.clone(),
            valves: self.valves.clone(),
            bath: self.bath.clone(),
            potentiostat: self.potentiostat.clone(),
            recorder: self.recorder.clone(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SweepParameters;

    #[tokio::test(start_paused = true)]
    async fn test_mock_bath_approaches_setpoint() {
        let bath = MockBath::new(20.0, 0.5);

        // Not running: setpoint alone does not move the temperature
        bath.set_setpoint(10.0).await.unwrap();
        sleep(Duration::from_secs(4)).await;
        assert_eq!(bath.read_temperature().await.unwrap(), 20.0);

        bath.set_on().await.unwrap();
        sleep(Duration::from_secs(4)).await;
        let t = bath.read_temperature().await.unwrap();
        assert!((t - 18.0).abs() < 1e-9, "got {t}");

        sleep(Duration::from_secs(60)).await;
        assert_eq!(bath.read_temperature().await.unwrap(), 10.0);
        assert_eq!(bath.setpoint_history().await, vec![10.0]);
    }

    #[tokio::test]
    async fn test_mock_flow_reads_back_target() {
        let flow = MockFlowRegulator::new();
        flow.set_target(FlowChannel::B2, 150.0).await.unwrap();
        assert_eq!(flow.read_value(FlowChannel::B2).await.unwrap(), 150.0);
        assert_eq!(flow.targets().await, [0.0, 0.0, 0.0, 150.0]);
        assert!(flow.set_target(FlowChannel::A1, -1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_valve_rejection() {
        let valves = MockValvePositioner::new();
        valves.reject_position(Valve::Inlet, 3).await;

        valves.set_position(Valve::Inlet, 2).await.unwrap();
        assert!(valves.set_position(Valve::Inlet, 3).await.is_err());
        assert_eq!(valves.position(Valve::Inlet).await.unwrap(), 2);
        assert_eq!(valves.journal().await, vec![(Valve::Inlet, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_potentiostat_takes_sweep_duration() {
        let pstat = MockPotentiostat::new();
        let request = SweepRequest {
            parameters: SweepParameters {
                initial_v: 0.0,
                vertex1_v: 0.5,
                vertex2_v: 0.0,
                final_v: 0.0,
                scan_rate_v_per_s: 0.25,
                increment_v: 0.001,
                sweep_count: 1,
                sensitivity_a_per_v: 1e-4,
            },
            file_name: "short_sweep".into(),
            header: "CV".into(),
        };

        let start = Instant::now();
        pstat.run_sweep(&request).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        pstat.set_failing(true);
        assert!(pstat.run_sweep(&request).await.is_err());
        assert_eq!(pstat.sweeps().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_recorder_self_terminates() {
        let recorder = MockRecorder::new();
        let start = Instant::now();
        recorder
            .start_session(Duration::from_secs(2), Path::new("clip.mp4"))
            .await
            .unwrap();

        assert!(start.elapsed() <= Duration::from_secs(2));
        let sessions = recorder.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].frames, 50);
        assert!(!sessions[0].stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_recorder_stops_on_request() {
        let recorder = Arc::new(MockRecorder::new());
        let session = {
            let recorder = recorder.clone();
            tokio::spawn(async move {
                recorder
                    .start_session(Duration::from_secs(60), Path::new("long.mp4"))
                    .await
            })
        };

        sleep(Duration::from_secs(1)).await;
        recorder.stop_session().await.unwrap();
        session.await.unwrap().unwrap();

        let sessions = recorder.sessions().await;
        assert!(sessions[0].stopped);
        assert!(sessions[0].frames < 60 * 25);
    }
}
