// src/control/agent.rs
//
// Runtime controller for one intersection: frozen Q-table + fallback policy
// driving a PhaseController, plus periodic statistics reports.

use serde::{Deserialize, Serialize};

use super::phase::{PhaseController, TickOutcome};
use crate::config::ControlConfig;
use crate::logging::{LogThrottle, Verbosity, VERBOSITY_DEBUG, VERBOSITY_SUMMARY};
use crate::rl::observation::StateEncoder;
use crate::rl::policy::{DecisionPolicy, DecisionSource};
use crate::rl::q_table::QTable;
use crate::sim::{observe_queues, unique_lanes, SimError, TrafficSimulator};
use crate::stats::{StatsReport, StatsSender};
use crate::types::{DiscretizedState, SimTime, TlsId};

/// One decision tick as seen from the agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentTick {
    pub outcome: TickOutcome,
    /// Discretized observation at the tick.
    pub state: DiscretizedState,
    /// Set when the policy was consulted.
    pub source: Option<DecisionSource>,
}

pub struct IntersectionAgent {
    tls_id: TlsId,
    table: QTable,
    policy: DecisionPolicy,
    controller: PhaseController,
    encoder: StateEncoder,
    stats: Option<StatsSender>,
    observe_log: LogThrottle,
    report_log: LogThrottle,
    verbosity: Verbosity,
}

impl IntersectionAgent {
    pub fn new(tls_id: impl Into<TlsId>, table: QTable, cfg: &ControlConfig, seed: u64) -> Self {
        let tls_id = tls_id.into();
        Self {
            controller: PhaseController::new(tls_id.clone(), cfg.min_green, cfg.yellow_time),
            policy: DecisionPolicy::new(seed),
            tls_id,
            table,
            encoder: StateEncoder,
            stats: None,
            observe_log: LogThrottle::new(10),
            report_log: LogThrottle::new(10),
            verbosity: VERBOSITY_SUMMARY,
        }
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self.policy = self.policy.with_verbosity(verbosity);
        self.controller = self.controller.with_verbosity(verbosity);
        self
    }

    pub fn with_stats(mut self, sender: StatsSender) -> Self {
        self.stats = Some(sender);
        self
    }

    pub fn tls_id(&self) -> &str {
        &self.tls_id
    }

    pub fn table(&self) -> &QTable {
        &self.table
    }

    pub fn controller(&self) -> &PhaseController {
        &self.controller
    }

    /// Log the intersection's status and check that phase commands take
    /// effect (set the phase two ahead, read it back, restore it).
    ///
    /// Returns whether the control check passed. Only fatal errors propagate.
    pub fn startup<S: TrafficSimulator + ?Sized>(&mut self, sim: &mut S) -> Result<bool, SimError> {
        match self.verify_control(sim) {
            Ok(ok) => Ok(ok),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                eprintln!("[control] {}: WARN: could not verify control: {}", self.tls_id, err);
                Ok(false)
            }
        }
    }

    fn verify_control<S: TrafficSimulator + ?Sized>(&mut self, sim: &mut S) -> Result<bool, SimError> {
        let phase = sim.phase(&self.tls_id)?;
        let program = sim.program_id(&self.tls_id)?;
        let lanes = unique_lanes(&*sim, &self.tls_id)?;
        if self.verbosity >= VERBOSITY_SUMMARY {
            eprintln!(
                "[control] {} status: phase={}, program={}, controls {} lanes, {} known states",
                self.tls_id,
                phase,
                program,
                lanes.len(),
                self.table.len()
            );
        }

        let phases = sim.phases(&self.tls_id)?;
        if phases.len() <= 1 {
            return Ok(true);
        }
        let target = (phase + 2) % phases.len();
        sim.set_phase(&self.tls_id, target)?;
        // Restore the original phase even when the read-back failed.
        let seen = sim.phase(&self.tls_id);
        let restored = sim.set_phase(&self.tls_id, phase);
        let seen = match (seen, restored) {
            (_, Err(err)) if err.is_fatal() => return Err(err),
            (Err(err), _) => return Err(err),
            (Ok(seen), restored) => {
                restored?;
                seen
            }
        };

        let ok = seen == target;
        if ok {
            if self.verbosity >= VERBOSITY_SUMMARY {
                eprintln!("[control] {}: control test ok ({} -> {})", self.tls_id, phase, target);
            }
        } else {
            eprintln!(
                "[control] {}: WARN: control test failed (phase {} != requested {})",
                self.tls_id, seen, target
            );
        }
        Ok(ok)
    }

    /// Observe, then run one PhaseController tick with this agent's policy.
    pub fn decide_tick<S: TrafficSimulator + ?Sized>(
        &mut self,
        sim: &mut S,
        now: SimTime,
    ) -> Result<AgentTick, SimError> {
        let state = match observe_queues(&*sim, &self.tls_id) {
            Ok(obs) => self.encoder.encode(&obs),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                if self.observe_log.hit() && self.verbosity >= VERBOSITY_SUMMARY {
                    eprintln!(
                        "[control] {}: WARN: observation failed, using empty state: {}",
                        self.tls_id, err
                    );
                }
                DiscretizedState::EMPTY
            }
        };

        let mut source = None;
        let tls_id = &self.tls_id;
        let table = &self.table;
        let policy = &mut self.policy;
        let outcome = self.controller.tick(sim, now, || {
            let (action, from) = policy.decide_with_source(tls_id, state, table);
            source = Some(from);
            action
        })?;

        match outcome {
            TickOutcome::Switched { to, .. } if self.verbosity >= VERBOSITY_SUMMARY => {
                eprintln!(
                    "[control] ### PHASE CHANGE ### {}: switching to phase {} (state: {}), sim time: {:.1}s",
                    self.tls_id, to, state, now
                );
            }
            _ if self.verbosity >= VERBOSITY_DEBUG => {
                eprintln!(
                    "[control] {} t={:.0}s state={} -> {:?} ({:?})",
                    self.tls_id, now, state, outcome, source
                );
            }
            _ => {}
        }

        Ok(AgentTick {
            outcome,
            state,
            source,
        })
    }

    /// Current totals over unique controlled lanes: (halting, waiting seconds).
    pub fn read_totals<S: TrafficSimulator + ?Sized>(&self, sim: &S) -> Result<(u32, f64), SimError> {
        let mut queue = 0;
        let mut waiting = 0.0;
        for lane in unique_lanes(sim, &self.tls_id)? {
            queue += sim.lane_halting(&lane)?;
            waiting += sim.lane_waiting_time(&lane)?.max(0.0);
        }
        Ok((queue, waiting))
    }

    /// Send one statistics report. Non-fatal failures are logged and the
    /// report is skipped.
    pub fn report_stats<S: TrafficSimulator + ?Sized>(
        &mut self,
        sim: &S,
    ) -> Result<Option<StatsReport>, SimError> {
        let (queue, waiting) = match self.read_totals(sim) {
            Ok(totals) => totals,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                if self.report_log.hit() {
                    eprintln!("[control] {}: WARN: stats report failed: {}", self.tls_id, err);
                }
                return Ok(None);
            }
        };
        let report = StatsReport::new(self.tls_id.clone(), queue, waiting);
        if let Some(sender) = &self.stats {
            if !sender.send(&report) && self.report_log.hit() {
                eprintln!("[control] {}: WARN: coordinator unreachable", self.tls_id);
            }
        }
        Ok(Some(report))
    }
}
