//! Closed-loop "wait until a measured quantity matches its setpoint".
//!
//! The waiter resends the setpoint every poll, reads the quantity back and
//! compares both at one-decimal resolution (the bath reports to 0.1 °C). A
//! match must then hold for `hold_count` further polls before the quantity is
//! considered settled; any miss in between restarts the count. This debounces
//! overshoot and sensor jitter without a floating tolerance band.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::hardware::{FlowChannel, FlowRegulator, TemperatureBath};

/// A quantity that can be commanded and read back.
#[async_trait]
pub trait Setpoint: Send + Sync {
    /// Name used in logs and errors.
    fn label(&self) -> &str;

    /// Send the setpoint. Must be safe to repeat.
    async fn command(&self, target: f64) -> anyhow::Result<()>;

    /// Read the current value.
    async fn sample(&self) -> anyhow::Result<f64>;
}

/// Polling cadence, debounce and time bound of a wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergencePolicy {
    /// Spacing between polls
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Matching polls required after the first match
    #[serde(default = "default_hold_count")]
    pub hold_count: u32,
    /// Give up after this long; `None` waits forever
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Option<Duration>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_hold_count() -> u32 {
    10
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(2 * 60 * 60))
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            hold_count: default_hold_count(),
            timeout: default_timeout(),
        }
    }
}

/// Summary of a successful wait.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceReport {
    /// Final reading
    pub measured: f64,
    /// Polls issued, including the holding ones
    pub polls: u32,
    /// Time from first command to success
    pub elapsed: Duration,
}

/// Compare two values the way the instrument displays them (one decimal).
pub fn matches_at_resolution(measured: f64, target: f64) -> bool {
    format!("{measured:.1}") == format!("{target:.1}")
}

/// Block until `setpoint` reads back `target` for `1 + hold_count` consecutive polls.
///
/// # Errors
///
/// `DaqError::DeviceCommand` if commanding or sampling fails,
/// `DaqError::ConvergenceTimeout` if the policy's timeout elapses first.
pub async fn wait_for_convergence<S>(
    setpoint: &S,
    target: f64,
    policy: &ConvergencePolicy,
) -> AppResult<ConvergenceReport>
where
    S: Setpoint + ?Sized,
{
    let started = Instant::now();
    let deadline = policy.timeout.map(|t| started + t);
    let mut consecutive = 0_u32;
    let mut polls = 0_u32;
    let mut last = None;

    loop {
        setpoint
            .command(target)
            .await
            .map_err(|e| DaqError::device(setpoint.label(), e))?;
        let measured = setpoint
            .sample()
            .await
            .map_err(|e| DaqError::device(setpoint.label(), e))?;
        polls += 1;
        last = Some(measured);

        if matches_at_resolution(measured, target) {
            consecutive += 1;
        } else {
            if consecutive > 0 {
                debug!(
                    label = setpoint.label(),
                    measured,
                    target,
                    "match lost, restarting hold"
                );
            }
            consecutive = 0;
        }

        info!(
            label = setpoint.label(),
            target = format_args!("{target:.2}"),
            measured,
            hold = consecutive.saturating_sub(1),
            hold_required = policy.hold_count,
            "setpoint poll"
        );

        if consecutive > policy.hold_count {
            let elapsed = started.elapsed();
            info!(label = setpoint.label(), measured, polls, ?elapsed, "converged");
            return Ok(ConvergenceReport {
                measured,
                polls,
                elapsed,
            });
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(DaqError::ConvergenceTimeout {
                    label: setpoint.label().to_string(),
                    target,
                    last_measured: last,
                    waited: started.elapsed(),
                });
            }
        }

        sleep(policy.poll_interval).await;
    }
}

/// Bath temperature as a [`Setpoint`].
///
/// Every poll sends `SS`, reads `RS` and `RT`, matching how the bath firmware
/// expects to be driven. When a flow regulator is attached, the branch totals
/// are logged alongside.
pub struct BathSetpoint<'a> {
    bath: &'a dyn TemperatureBath,
    flow: Option<&'a dyn FlowRegulator>,
}

impl<'a> BathSetpoint<'a> {
    /// Wrap a bath.
    pub fn new(bath: &'a dyn TemperatureBath) -> Self {
        Self { bath, flow: None }
    }

    /// Also log measured anolyte (A1+A2) and catholyte (B1+B2) flow each poll.
    pub fn with_flow_readout(mut self, flow: &'a dyn FlowRegulator) -> Self {
        self.flow = Some(flow);
        self
    }
}

#[async_trait]
impl Setpoint for BathSetpoint<'_> {
    fn label(&self) -> &str {
        "bath"
    }

    async fn command(&self, target: f64) -> anyhow::Result<()> {
        self.bath.set_setpoint(target).await
    }

    async fn sample(&self) -> anyhow::Result<f64> {
        let setpoint = self.bath.read_setpoint().await?;
        let temperature = self.bath.read_temperature().await?;

        if let Some(flow) = self.flow {
            let anolyte =
                flow.read_value(FlowChannel::A1).await? + flow.read_value(FlowChannel::A2).await?;
            let catholyte =
                flow.read_value(FlowChannel::B1).await? + flow.read_value(FlowChannel::B2).await?;
            debug!(
                setpoint,
                temperature,
                anolyte_ul_min = format_args!("{anolyte:.0}"),
                catholyte_ul_min = format_args!("{catholyte:.0}"),
                "bath readout"
            );
        }
        Ok(temperature)
    }
}

/// One flow channel as a [`Setpoint`].
pub struct FlowSetpoint<'a> {
    regulator: &'a dyn FlowRegulator,
    channel: FlowChannel,
    label: String,
}

impl<'a> FlowSetpoint<'a> {
    /// Wrap one channel of a regulator.
    pub fn new(regulator: &'a dyn FlowRegulator, channel: FlowChannel) -> Self {
        Self {
            regulator,
            channel,
            label: format!("flow[{channel}]"),
        }
    }
}

#[async_trait]
impl Setpoint for FlowSetpoint<'_> {
    fn label(&self) -> &str {
        &self.label
    }

    async fn command(&self, target: f64) -> anyhow::Result<()> {
        self.regulator.set_target(self.channel, target).await
    }

    async fn sample(&self) -> anyhow::Result<f64> {
        self.regulator.read_value(self.channel).await
    }
}
