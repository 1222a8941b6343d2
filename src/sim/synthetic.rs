// src/sim/synthetic.rs
//
// Deterministic in-process traffic simulator.
//
// A small stand-in for a micro-simulation: each intersection has four
// approach lanes driven by a four-phase program (GGrr, yyrr, rrGG, rryy).
// Vehicles arrive per lane per second (Bernoulli), queue at red, and leave at
// the saturation flow while their lane is green.
//
// Two driving modes share the same dynamics:
// - `step(actions)`: agent-driven. Green phases hold until an agent asks to
//   switch (subject to the environment's own min-green), yellow phases run
//   their program time and then advance. Each step covers `delta_time`
//   seconds and reports base reward = -(total halting vehicles).
// - `advance()`: program-driven, one second at a time. Every phase runs its
//   program duration; `set_phase` overrides the program from outside.
//
// All randomness comes from a ChaCha8 RNG seeded with `seed + episode`.

use std::collections::{BTreeMap, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::{SimError, SimResult, StepOutcome, TrafficSimulator};
use crate::rl::observation::RawObservation;
use crate::types::{is_yellow_state, Action, LaneId, PhaseDef, SimTime, TlsId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Intersection identifiers.
    pub intersections: Vec<TlsId>,
    /// Arrival probability per second for each of the four approach lanes.
    pub arrival_rates: [f64; 4],
    /// Vehicles discharged per second from a green lane.
    pub saturation_flow: f64,
    /// Free-flow speed (m/s) of a discharging vehicle.
    pub free_speed: f64,
    /// Program duration of green phases (seconds).
    pub green_time: SimTime,
    /// Program duration of yellow phases (seconds).
    pub yellow_time: SimTime,
    /// Environment-side minimum green in agent-driven mode (seconds).
    pub min_green: SimTime,
    /// Seconds covered by one agent-driven `step`.
    pub delta_time: u32,
    /// Episode length in seconds (agent-driven mode reports done after it).
    pub episode_seconds: SimTime,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            intersections: vec![
                "J11".to_string(),
                "J13".to_string(),
                "J7".to_string(),
                "J9".to_string(),
            ],
            arrival_rates: [0.12, 0.12, 0.07, 0.07],
            saturation_flow: 0.5,
            free_speed: 13.89,
            green_time: 30.0,
            yellow_time: 3.0,
            min_green: 5.0,
            delta_time: 5,
            episode_seconds: 1800.0,
            seed: 42,
        }
    }
}

impl SyntheticConfig {
    /// Phase program shared by every intersection.
    pub fn program(&self) -> Vec<PhaseDef> {
        vec![
            PhaseDef::new("GGrr", self.green_time),
            PhaseDef::new("yyrr", self.yellow_time),
            PhaseDef::new("rrGG", self.green_time),
            PhaseDef::new("rryy", self.yellow_time),
        ]
    }
}

#[derive(Debug, Clone)]
struct Lane {
    id: LaneId,
    /// Arrival times of queued (halting) vehicles.
    queue: VecDeque<SimTime>,
    /// Vehicles that moved through the stop line during the last second.
    moving: u32,
    /// Fractional discharge capacity carried between seconds.
    capacity: f64,
}

#[derive(Debug, Clone)]
struct Intersection {
    lanes: Vec<Lane>,
    phase: usize,
    phase_elapsed: SimTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Agent,
    Program,
}

pub struct SyntheticSimulator {
    cfg: SyntheticConfig,
    program: Vec<PhaseDef>,
    intersections: BTreeMap<TlsId, Intersection>,
    rng: ChaCha8Rng,
    time: SimTime,
    episode: u64,
    closed: bool,
}

impl SyntheticSimulator {
    pub fn new(cfg: SyntheticConfig) -> Self {
        let program = cfg.program();
        let rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let mut sim = Self {
            cfg,
            program,
            intersections: BTreeMap::new(),
            rng,
            time: 0.0,
            episode: 0,
            closed: false,
        };
        sim.rebuild();
        sim
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.cfg
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of `reset` calls so far.
    pub fn episodes_started(&self) -> u64 {
        self.episode
    }

    fn rebuild(&mut self) {
        self.intersections = self
            .cfg
            .intersections
            .iter()
            .map(|tls| {
                let lanes = (0..4)
                    .map(|i| Lane {
                        id: format!("{tls}_{i}"),
                        queue: VecDeque::new(),
                        moving: 0,
                        capacity: 0.0,
                    })
                    .collect();
                (
                    tls.clone(),
                    Intersection {
                        lanes,
                        phase: 0,
                        phase_elapsed: 0.0,
                    },
                )
            })
            .collect();
        self.time = 0.0;
    }

    fn ensure_open(&self) -> SimResult<()> {
        if self.closed {
            Err(SimError::Terminated {
                reason: "synthetic simulator closed".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn intersection(&self, tls_id: &str) -> SimResult<&Intersection> {
        self.ensure_open()?;
        self.intersections
            .get(tls_id)
            .ok_or_else(|| SimError::UnknownIntersection {
                tls_id: tls_id.to_string(),
            })
    }

    fn lane(&self, lane_id: &str) -> SimResult<&Lane> {
        self.ensure_open()?;
        self.intersections
            .values()
            .flat_map(|i| i.lanes.iter())
            .find(|l| l.id == lane_id)
            .ok_or_else(|| SimError::query(format!("lane {lane_id}"), "no such lane"))
    }

    fn observations(&self) -> BTreeMap<TlsId, RawObservation> {
        self.intersections
            .iter()
            .map(|(tls, i)| {
                let queues = i.lanes.iter().map(|l| l.queue.len() as f64).collect();
                (tls.clone(), RawObservation::Sequence(queues))
            })
            .collect()
    }

    /// Advance the dynamics by one second.
    fn tick_second(&mut self, mode: Mode) {
        let now = self.time;
        let rates = self.cfg.arrival_rates;
        let saturation = self.cfg.saturation_flow;

        for inter in self.intersections.values_mut() {
            let state = self.program[inter.phase].state.as_bytes();
            for (idx, lane) in inter.lanes.iter_mut().enumerate() {
                if self.rng.gen::<f64>() < rates[idx] {
                    lane.queue.push_back(now);
                }
                lane.moving = 0;
                let green = matches!(state.get(idx), Some(b'G') | Some(b'g'));
                if green {
                    lane.capacity += saturation;
                    while lane.capacity >= 1.0 && lane.queue.pop_front().is_some() {
                        lane.moving += 1;
                        lane.capacity -= 1.0;
                    }
                    if lane.queue.is_empty() {
                        lane.capacity = lane.capacity.min(1.0);
                    }
                } else {
                    lane.capacity = 0.0;
                }
            }

            inter.phase_elapsed += 1.0;
            let current = &self.program[inter.phase];
            let expires = match mode {
                Mode::Program => true,
                Mode::Agent => current.is_yellow(),
            };
            if expires && inter.phase_elapsed >= current.duration {
                inter.phase = (inter.phase + 1) % self.program.len();
                inter.phase_elapsed = 0.0;
            }
        }

        self.time += 1.0;
    }
}

impl TrafficSimulator for SyntheticSimulator {
    fn traffic_light_ids(&self) -> SimResult<Vec<TlsId>> {
        self.ensure_open()?;
        Ok(self.intersections.keys().cloned().collect())
    }

    fn reset(&mut self) -> SimResult<BTreeMap<TlsId, RawObservation>> {
        self.ensure_open()?;
        self.rng = ChaCha8Rng::seed_from_u64(self.cfg.seed.wrapping_add(self.episode));
        self.episode += 1;
        self.rebuild();
        Ok(self.observations())
    }

    fn step(&mut self, actions: &BTreeMap<TlsId, Action>) -> SimResult<StepOutcome> {
        self.ensure_open()?;
        for (tls, action) in actions {
            let min_green = self.cfg.min_green;
            let n = self.program.len();
            let inter = self
                .intersections
                .get_mut(tls)
                .ok_or_else(|| SimError::UnknownIntersection {
                    tls_id: tls.clone(),
                })?;
            let in_green = !is_yellow_state(&self.program[inter.phase].state);
            if *action == Action::Switch && in_green && inter.phase_elapsed >= min_green {
                inter.phase = (inter.phase + 1) % n;
                inter.phase_elapsed = 0.0;
            }
        }

        for _ in 0..self.cfg.delta_time.max(1) {
            self.tick_second(Mode::Agent);
        }

        let rewards = self
            .intersections
            .iter()
            .map(|(tls, i)| {
                let halting: usize = i.lanes.iter().map(|l| l.queue.len()).sum();
                (tls.clone(), -(halting as f64))
            })
            .collect();

        Ok(StepOutcome {
            observations: self.observations(),
            rewards,
            done: self.time >= self.cfg.episode_seconds,
        })
    }

    fn advance(&mut self) -> SimResult<()> {
        self.ensure_open()?;
        self.tick_second(Mode::Program);
        Ok(())
    }

    fn time(&self) -> SimResult<SimTime> {
        self.ensure_open()?;
        Ok(self.time)
    }

    fn controlled_lanes(&self, tls_id: &str) -> SimResult<Vec<LaneId>> {
        Ok(self
            .intersection(tls_id)?
            .lanes
            .iter()
            .map(|l| l.id.clone())
            .collect())
    }

    fn lane_halting(&self, lane: &str) -> SimResult<u32> {
        Ok(self.lane(lane)?.queue.len() as u32)
    }

    fn lane_waiting_time(&self, lane: &str) -> SimResult<f64> {
        let now = self.time;
        Ok(self.lane(lane)?.queue.iter().map(|&t| now - t).sum())
    }

    fn lane_mean_speed(&self, lane: &str) -> SimResult<f64> {
        let l = self.lane(lane)?;
        let count = l.queue.len() as u32 + l.moving;
        if count == 0 {
            return Ok(0.0);
        }
        Ok(self.cfg.free_speed * l.moving as f64 / count as f64)
    }

    fn lane_vehicle_count(&self, lane: &str) -> SimResult<u32> {
        let l = self.lane(lane)?;
        Ok(l.queue.len() as u32 + l.moving)
    }

    fn phase(&self, tls_id: &str) -> SimResult<usize> {
        Ok(self.intersection(tls_id)?.phase)
    }

    fn program_id(&self, tls_id: &str) -> SimResult<String> {
        self.intersection(tls_id)?;
        Ok("0".to_string())
    }

    fn signal_state(&self, tls_id: &str) -> SimResult<String> {
        let phase = self.intersection(tls_id)?.phase;
        Ok(self.program[phase].state.clone())
    }

    fn phases(&self, tls_id: &str) -> SimResult<Vec<PhaseDef>> {
        self.intersection(tls_id)?;
        Ok(self.program.clone())
    }

    fn set_phase(&mut self, tls_id: &str, phase: usize) -> SimResult<()> {
        self.ensure_open()?;
        let n = self.program.len();
        let inter = self
            .intersections
            .get_mut(tls_id)
            .ok_or_else(|| SimError::UnknownIntersection {
                tls_id: tls_id.to_string(),
            })?;
        if phase >= n {
            return Err(SimError::Command {
                what: format!("set_phase({tls_id}, {phase})"),
                reason: format!("program has {n} phases"),
            });
        }
        inter.phase = phase;
        inter.phase_elapsed = 0.0;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
