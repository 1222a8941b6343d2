// src/rl/reward.rs
//
// Reward shaping for the tabular learner.
//
// r_t = queue + waiting + efficiency
//
//   queue      = w_queue * basic_reward                     (simulator's own signal)
//   waiting    = -w_wait * (max(0, ΔW)/10 + W/1000)          (W = accumulated waiting)
//   efficiency = w_eff * mean_lanes(v * min(n/5, 1)) / 10    (live lane flow)
//              | w_eff * max(0, Δpassed) * 0.1               (fallback, no lane flow)
//
// Everything here is a pure function of its inputs.

use serde::{Deserialize, Serialize};

/// Live flow reading for one lane group.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LaneFlow {
    /// Mean speed over the last simulator step (m/s).
    pub mean_speed: f64,
    /// Vehicles on the lane over the last simulator step.
    pub vehicle_count: u32,
}

impl LaneFlow {
    /// Speed weighted by occupancy, capped at five vehicles; 0 for empty lanes.
    pub fn flow_score(&self) -> f64 {
        if self.vehicle_count == 0 {
            return 0.0;
        }
        let occupancy = (self.vehicle_count as f64 / 5.0).min(1.0);
        (self.mean_speed * occupancy).max(0.0)
    }
}

/// Aggregate traffic readings for one intersection at one tick.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficMetricsSnapshot {
    /// Halting vehicles per lane group.
    pub queues: Vec<u32>,
    /// Accumulated waiting time over all lane groups (seconds).
    pub total_waiting_time: f64,
    /// Vehicles counted on the lane groups over the last step.
    pub vehicles_passed: u32,
    /// Per-lane flow readings; `None` when speed data was unavailable.
    pub lane_flow: Option<Vec<LaneFlow>>,
}

impl TrafficMetricsSnapshot {
    /// Zeroed metrics used when the simulator cannot be queried.
    pub fn zeroed() -> Self {
        Self {
            queues: vec![0; crate::types::STATE_WIDTH],
            total_waiting_time: 0.0,
            vehicles_passed: 0,
            lane_flow: None,
        }
    }

    pub fn total_queue(&self) -> u32 {
        self.queues.iter().sum()
    }
}

/// Weights on the three reward components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardWeights {
    pub queue: f64,
    pub waiting: f64,
    pub efficiency: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            queue: 1.0,
            waiting: 0.4,
            efficiency: 0.3,
        }
    }
}

/// Per-tick reward breakdown, kept for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RewardComponents {
    pub queue: f64,
    pub waiting: f64,
    pub efficiency: f64,
}

impl RewardComponents {
    pub fn total(&self) -> f64 {
        self.queue + self.waiting + self.efficiency
    }
}

/// Multi-component reward model.
#[derive(Debug, Clone, Default)]
pub struct RewardModel {
    weights: RewardWeights,
}

impl RewardModel {
    pub fn new(weights: RewardWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RewardWeights {
        &self.weights
    }

    /// Enhanced scalar reward for one intersection and tick.
    ///
    /// `_tls_id` identifies the intersection the metrics belong to; the
    /// computation itself only depends on the snapshots.
    pub fn reward(
        &self,
        _tls_id: &str,
        prev: &TrafficMetricsSnapshot,
        current: &TrafficMetricsSnapshot,
        basic_reward: f64,
    ) -> f64 {
        self.components(prev, current, basic_reward).total()
    }

    pub fn components(
        &self,
        prev: &TrafficMetricsSnapshot,
        current: &TrafficMetricsSnapshot,
        basic_reward: f64,
    ) -> RewardComponents {
        RewardComponents {
            queue: self.weights.queue * basic_reward,
            waiting: self.waiting_component(prev, current),
            efficiency: self.efficiency_component(prev, current),
        }
    }

    fn waiting_component(
        &self,
        prev: &TrafficMetricsSnapshot,
        current: &TrafficMetricsSnapshot,
    ) -> f64 {
        let increase = (current.total_waiting_time - prev.total_waiting_time).max(0.0);
        let absolute = current.total_waiting_time / 100.0;
        -self.weights.waiting * (increase / 10.0 + absolute * 0.1)
    }

    fn efficiency_component(
        &self,
        prev: &TrafficMetricsSnapshot,
        current: &TrafficMetricsSnapshot,
    ) -> f64 {
        match &current.lane_flow {
            Some(lanes) if lanes.is_empty() => 0.0,
            Some(lanes) => {
                let total: f64 = lanes.iter().map(LaneFlow::flow_score).sum();
                self.weights.efficiency * (total / lanes.len() as f64) / 10.0
            }
            None => {
                let passed = current.vehicles_passed.saturating_sub(prev.vehicles_passed);
                self.weights.efficiency * passed as f64 * 0.1
            }
        }
    }
}
