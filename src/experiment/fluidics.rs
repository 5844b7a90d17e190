//! Flow/valve command façade.
//!
//! Turns a [`PhaseSpec`] into the primitive regulator and valve calls. A
//! single [`Fluidics::apply`] routes both valves and sets all four channels;
//! it never waits for the fluid to respond, that is the sequencer's job.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::experiment::phases::{FlowSetting, PhaseSpec, ValveRouting};
use crate::hardware::{FlowChannel, FlowRegulator, Valve, ValvePositioner};

/// Exclusive writer for the flow channels and valves.
pub struct Fluidics {
    flow: Arc<dyn FlowRegulator>,
    valves: Arc<dyn ValvePositioner>,
    response_time_s: u32,
}

impl Fluidics {
    /// Wrap the shared handles; `response_time_s` accompanies every flow target.
    pub fn new(
        flow: Arc<dyn FlowRegulator>,
        valves: Arc<dyn ValvePositioner>,
        response_time_s: u32,
    ) -> Self {
        Self {
            flow,
            valves,
            response_time_s,
        }
    }

    /// The regulator, for read-only sampling.
    pub fn regulator(&self) -> &dyn FlowRegulator {
        self.flow.as_ref()
    }

    /// Check the controller exposes both valves and log where they are.
    pub async fn verify(&self) -> AppResult<()> {
        let count = self
            .valves
            .channel_count()
            .await
            .map_err(|e| DaqError::device("valves", e))?;
        if count < 2 {
            return Err(DaqError::Configuration(format!(
                "controller reports {count} valve channel(s), two are required"
            )));
        }
        for valve in [Valve::Inlet, Valve::Catholyte] {
            let position = self
                .valves
                .position(valve)
                .await
                .map_err(|e| DaqError::device(valve.to_string(), e))?;
            info!(%valve, position, "valve position");
        }
        for channel in FlowChannel::ALL {
            let value = self
                .flow
                .read_value(channel)
                .await
                .map_err(|e| DaqError::device(format!("flow[{channel}]"), e))?;
            info!(%channel, ul_per_min = value, "flow reading");
        }
        Ok(())
    }

    /// Move valve 1 then valve 2.
    pub async fn route(&self, routing: ValveRouting) -> AppResult<()> {
        for (valve, position) in [
            (Valve::Inlet, routing.inlet),
            (Valve::Catholyte, routing.catholyte),
        ] {
            self.valves
                .set_position(valve, position)
                .await
                .map_err(|e| DaqError::device(valve.to_string(), e))?;
        }
        debug!(inlet = routing.inlet, catholyte = routing.catholyte, "valves routed");
        Ok(())
    }

    /// Set target and response time on all four channels.
    pub async fn set_flows(&self, setting: &FlowSetting) -> AppResult<()> {
        for channel in FlowChannel::ALL {
            let rate = match setting {
                FlowSetting::Uniform(rate) => *rate,
                FlowSetting::Plan(plan) => plan.rate(channel),
            };
            let device = format!("flow[{channel}]");
            self.flow
                .set_target(channel, rate)
                .await
                .map_err(|e| DaqError::device(device.clone(), e))?;
            self.flow
                .set_response_time(channel, self.response_time_s)
                .await
                .map_err(|e| DaqError::device(device, e))?;
        }
        debug!(?setting, "flows set");
        Ok(())
    }

    /// Apply a phase's routing (if any) and flows.
    pub async fn apply(&self, spec: &PhaseSpec) -> AppResult<()> {
        if let Some(routing) = spec.routing {
            self.route(routing).await?;
        }
        self.set_flows(&spec.flows).await
    }

    /// Stop all flow. Tries every channel even if one fails.
    pub async fn zero(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        for channel in FlowChannel::ALL {
            if let Err(e) = self.flow.set_target(channel, 0.0).await {
                errors.push(DaqError::device(format!("flow[{channel}]"), e));
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::phases::{Dwell, Phase};
    use crate::experiment::plan::FlowPlan;
    use crate::hardware::mock::{FlowCommand, MockFlowRegulator, MockValvePositioner};
    use std::time::Duration;

    fn rig() -> (Arc<MockFlowRegulator>, Arc<MockValvePositioner>, Fluidics) {
        let flow = Arc::new(MockFlowRegulator::new());
        let valves = Arc::new(MockValvePositioner::new());
        let fluidics = Fluidics::new(flow.clone(), valves.clone(), 60);
        (flow, valves, fluidics)
    }

    #[tokio::test]
    async fn test_apply_routes_then_sets_all_channels() {
        let (flow, valves, fluidics) = rig();
        let spec = PhaseSpec {
            phase: Phase::PurgeChannel,
            routing: Some(ValveRouting {
                inlet: 3,
                catholyte: 0,
            }),
            flows: FlowSetting::Uniform(200.0),
            dwell: Dwell::Fixed(Duration::from_secs(60)),
        };

        fluidics.apply(&spec).await.unwrap();

        assert_eq!(
            valves.journal().await,
            vec![(Valve::Inlet, 3), (Valve::Catholyte, 0)]
        );
        assert_eq!(flow.targets().await, [200.0; 4]);
        let journal = flow.journal().await;
        assert_eq!(journal.len(), 8);
        assert_eq!(journal[0], FlowCommand::Target(FlowChannel::A1, 200.0));
        assert_eq!(journal[1], FlowCommand::ResponseTime(FlowChannel::A1, 60));
    }

    #[tokio::test]
    async fn test_plan_sets_channel_specific_flows() {
        let (flow, valves, fluidics) = rig();
        let plan = FlowPlan {
            a1: 150.0,
            a2: 150.0,
            b1: 240.0,
            b2: 60.0,
        };
        fluidics.set_flows(&FlowSetting::Plan(plan)).await.unwrap();

        assert_eq!(flow.targets().await, [150.0, 150.0, 240.0, 60.0]);
        assert!(valves.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_valve_failure_is_device_error() {
        let (_, valves, fluidics) = rig();
        valves.reject_position(Valve::Inlet, 5).await;

        let err = fluidics
            .route(ValveRouting {
                inlet: 5,
                catholyte: 0,
            })
            .await
            .unwrap_err();
        assert!(err.is_cell_fatal());
        assert!(err.to_string().contains("valve[1]"));
    }

    #[tokio::test]
    async fn test_verify_requires_two_valves() {
        let flow = Arc::new(MockFlowRegulator::new());
        let valves = Arc::new(MockValvePositioner::with_channel_count(1));
        let fluidics = Fluidics::new(flow, valves, 60);

        let err = fluidics.verify().await.unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_zero_stops_every_channel() {
        let (flow, _, fluidics) = rig();
        fluidics
            .set_flows(&FlowSetting::Uniform(400.0))
            .await
            .unwrap();
        fluidics.zero().await.unwrap();
        assert_eq!(flow.targets().await, [0.0; 4]);
    }
}
