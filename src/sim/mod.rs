// src/sim/mod.rs
//
// Simulator boundary.
//
// The traffic micro-simulation is an external collaborator. Everything the
// control core needs from it goes through `TrafficSimulator`; every query
// returns a `SimResult` and call sites decide the safe fallback:
// - observation queries  → empty state
// - metric queries       → zeroed snapshot / no lane-flow data
// - phase queries        → skip this decision tick
// Only `SimError::Terminated` ends an episode or session.

pub mod synthetic;

use std::collections::BTreeMap;
use std::fmt;

use crate::rl::observation::RawObservation;
use crate::rl::reward::{LaneFlow, TrafficMetricsSnapshot};
use crate::types::{Action, LaneId, PhaseDef, SimTime, TlsId};

pub use synthetic::{SyntheticConfig, SyntheticSimulator};

#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    /// A read against the simulator failed.
    Query { what: String, reason: String },
    /// A command (e.g. set phase) was rejected.
    Command { what: String, reason: String },
    /// The simulator has no intersection with this id.
    UnknownIntersection { tls_id: String },
    /// The simulator connection is gone; the session cannot continue.
    Terminated { reason: String },
}

impl SimError {
    pub fn query(what: impl Into<String>, reason: impl Into<String>) -> Self {
        SimError::Query {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Session-fatal errors end the current episode/session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SimError::Terminated { .. })
    }
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Query { what, reason } => write!(f, "query {} failed: {}", what, reason),
            SimError::Command { what, reason } => {
                write!(f, "command {} failed: {}", what, reason)
            }
            SimError::UnknownIntersection { tls_id } => {
                write!(f, "unknown intersection '{}'", tls_id)
            }
            SimError::Terminated { reason } => write!(f, "simulator terminated: {}", reason),
        }
    }
}

impl std::error::Error for SimError {}

pub type SimResult<T> = Result<T, SimError>;

/// Result of one batched, agent-driven simulator step.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// Next raw observation per intersection.
    pub observations: BTreeMap<TlsId, RawObservation>,
    /// Base reward per intersection (the simulator's own reward function).
    pub rewards: BTreeMap<TlsId, f64>,
    /// Episode finished.
    pub done: bool,
}

impl StepOutcome {
    /// Base reward for an intersection; 0 if the simulator reported none.
    pub fn reward_for(&self, tls_id: &str) -> f64 {
        self.rewards.get(tls_id).copied().unwrap_or(0.0)
    }
}

/// The traffic micro-simulation as seen by the control core.
///
/// Implementations are single-threaded and must not be stepped from more
/// than one caller at a time.
pub trait TrafficSimulator {
    /// All signal-controlled intersections.
    fn traffic_light_ids(&self) -> SimResult<Vec<TlsId>>;

    /// Start a new episode; returns the initial observation per intersection.
    fn reset(&mut self) -> SimResult<BTreeMap<TlsId, RawObservation>>;

    /// Apply one action per intersection and advance one control interval.
    fn step(&mut self, actions: &BTreeMap<TlsId, Action>) -> SimResult<StepOutcome>;

    /// Advance one simulator step with the signal programs running on their
    /// own (runtime sessions issue phase commands separately).
    fn advance(&mut self) -> SimResult<()>;

    /// Current simulated time in seconds.
    fn time(&self) -> SimResult<SimTime>;

    fn controlled_lanes(&self, tls_id: &str) -> SimResult<Vec<LaneId>>;
    fn lane_halting(&self, lane: &str) -> SimResult<u32>;
    fn lane_waiting_time(&self, lane: &str) -> SimResult<f64>;
    fn lane_mean_speed(&self, lane: &str) -> SimResult<f64>;
    fn lane_vehicle_count(&self, lane: &str) -> SimResult<u32>;

    fn phase(&self, tls_id: &str) -> SimResult<usize>;
    fn program_id(&self, tls_id: &str) -> SimResult<String>;
    fn signal_state(&self, tls_id: &str) -> SimResult<String>;
    fn phases(&self, tls_id: &str) -> SimResult<Vec<PhaseDef>>;
    fn set_phase(&mut self, tls_id: &str, phase: usize) -> SimResult<()>;

    /// Release the simulator connection. Idempotent.
    fn close(&mut self);
}

/// Sorted, de-duplicated controlled lanes.
pub fn unique_lanes<S: TrafficSimulator + ?Sized>(sim: &S, tls_id: &str) -> SimResult<Vec<LaneId>> {
    let mut lanes = sim.controlled_lanes(tls_id)?;
    lanes.sort();
    lanes.dedup();
    Ok(lanes)
}

/// Runtime observation: halting vehicles per unique controlled lane.
pub fn observe_queues<S: TrafficSimulator + ?Sized>(
    sim: &S,
    tls_id: &str,
) -> SimResult<RawObservation> {
    let lanes = unique_lanes(sim, tls_id)?;
    let mut queues = Vec::with_capacity(lanes.len());
    for lane in &lanes {
        queues.push(sim.lane_halting(lane)? as f64);
    }
    Ok(RawObservation::Sequence(queues))
}

/// Metrics snapshot for reward shaping.
///
/// Any failure in the core readings yields `TrafficMetricsSnapshot::zeroed()`.
/// Lane-flow data is collected separately and left `None` if a speed or
/// count query fails, which switches the reward to its fallback term.
pub fn collect_metrics<S: TrafficSimulator + ?Sized>(
    sim: &S,
    tls_id: &str,
) -> TrafficMetricsSnapshot {
    let core = read_core_metrics(sim, tls_id);

    let (lanes, mut snapshot) = match core {
        Ok(v) => v,
        Err(_) => return TrafficMetricsSnapshot::zeroed(),
    };

    let flow: SimResult<Vec<LaneFlow>> = lanes
        .iter()
        .map(|lane| {
            Ok(LaneFlow {
                mean_speed: sim.lane_mean_speed(lane)?,
                vehicle_count: sim.lane_vehicle_count(lane)?,
            })
        })
        .collect();
    snapshot.lane_flow = flow.ok();
    snapshot
}

fn read_core_metrics<S: TrafficSimulator + ?Sized>(
    sim: &S,
    tls_id: &str,
) -> SimResult<(Vec<LaneId>, TrafficMetricsSnapshot)> {
    let lanes = unique_lanes(sim, tls_id)?;
    let mut snapshot = TrafficMetricsSnapshot {
        queues: Vec::with_capacity(lanes.len()),
        ..TrafficMetricsSnapshot::default()
    };
    for lane in &lanes {
        snapshot.queues.push(sim.lane_halting(lane)?);
        snapshot.total_waiting_time += sim.lane_waiting_time(lane)?.max(0.0);
        snapshot.vehicles_passed += sim.lane_vehicle_count(lane)?;
    }
    Ok((lanes, snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_is_the_only_fatal_error() {
        assert!(SimError::Terminated { reason: "closed".into() }.is_fatal());
        assert!(!SimError::query("phase", "timeout").is_fatal());
        assert!(!SimError::UnknownIntersection { tls_id: "X".into() }.is_fatal());
    }

    #[test]
    fn missing_reward_reads_as_zero() {
        let mut outcome = StepOutcome::default();
        outcome.rewards.insert("J7".to_string(), -3.0);
        assert_eq!(outcome.reward_for("J7"), -3.0);
        assert_eq!(outcome.reward_for("J9"), 0.0);
    }
}
