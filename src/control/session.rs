// src/control/session.rs
//
// Runtime control session: one simulator, one agent per traffic light, one
// statistics coordinator.
//
// The simulator advances one step at a time with its own programs running.
// On top of that, on simulated-time cadences:
//   - decision (default 5 s): every agent runs one PhaseController tick,
//     in sorted intersection order, before the simulator advances again
//   - report   (default 10 s): every agent sends a stats message
//   - summary  (default 30 s): the coordinator prints its aggregated report
//
// Baseline sessions run the same loop with no agents, so the fixed-time
// programs are measured under identical sampling.
//
// Only `SimError::Terminated` ends a session. Other failed advances or clock
// reads are counted and the loop carries on, up to
// `MAX_CONSECUTIVE_SIM_ERRORS` failures in a row.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::agent::IntersectionAgent;
use super::phase::TickOutcome;
use crate::config::{Config, ControlConfig};
use crate::logging::{LogThrottle, Verbosity, VERBOSITY_SUMMARY};
use crate::loop_scheduler::LoopScheduler;
use crate::rl::artifact::PolicyArtifact;
use crate::sim::{unique_lanes, SimError, TrafficSimulator};
use crate::stats::{stats_channel, StatsAggregator, StatsInbox};
use crate::telemetry::{PhaseChange, TelemetrySink};
use crate::types::{SimTime, TlsId};

/// Back-to-back non-fatal simulator failures tolerated before giving up.
pub const MAX_CONSECUTIVE_SIM_ERRORS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    /// Agents drive the signals from the learned tables.
    Learned,
    /// Fixed-time programs only.
    Baseline,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Learned => f.write_str("learned"),
            SessionMode::Baseline => f.write_str("baseline"),
        }
    }
}

/// End-of-session figures (also the `session_end` telemetry payload).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub mode: Option<SessionMode>,
    pub steps: u64,
    /// Simulated seconds covered.
    pub sim_seconds: SimTime,
    /// Mean over steps of the network-wide halting vehicle count.
    pub mean_total_queue: f64,
    /// Mean over steps of the network-wide accumulated waiting time.
    pub mean_total_waiting: f64,
    pub decision_ticks: u64,
    pub phase_changes: u64,
    pub skipped_ticks: u64,
    pub reports_sent: u64,
    /// Non-fatal advance / clock failures that were stepped over.
    pub sim_errors: u64,
    /// Stopped by the stop flag.
    pub interrupted: bool,
    /// Ended because the simulator went away.
    pub terminated: bool,
}

/// Network-wide lane totals at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct NetworkSample {
    vehicles: u32,
    halting: u32,
    waiting: f64,
}

pub struct ControlSession<S: TrafficSimulator> {
    sim: S,
    cfg: ControlConfig,
    mode: SessionMode,
    tls_ids: Vec<TlsId>,
    agents: Vec<IntersectionAgent>,
    inbox: StatsInbox,
    aggregator: StatsAggregator,
    telemetry: TelemetrySink,
    stop: Option<Arc<AtomicBool>>,
    sample_log: LogThrottle,
    sim_error_log: LogThrottle,
    verbosity: Verbosity,
}

impl<S: TrafficSimulator> ControlSession<S> {
    /// Learned-policy session: one agent per traffic light with its table
    /// from `artifact` (empty if the artifact has none).
    pub fn new(sim: S, cfg: &Config, artifact: &PolicyArtifact) -> Result<Self, SimError> {
        let mut session = Self::build(sim, cfg, SessionMode::Learned)?;
        let (sender, inbox) = stats_channel();
        session.inbox = inbox;
        session.agents = session
            .tls_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                IntersectionAgent::new(
                    id.clone(),
                    artifact.table_for(id),
                    &cfg.control,
                    cfg.control.seed.wrapping_add(i as u64),
                )
                .with_verbosity(cfg.verbosity)
                .with_stats(sender.clone())
            })
            .collect();
        Ok(session)
    }

    /// Fixed-time session with no agents.
    pub fn baseline(sim: S, cfg: &Config) -> Result<Self, SimError> {
        Self::build(sim, cfg, SessionMode::Baseline)
    }

    fn build(mut sim: S, cfg: &Config, mode: SessionMode) -> Result<Self, SimError> {
        let mut tls_ids = match sim.traffic_light_ids() {
            Ok(ids) => ids,
            Err(err) => {
                sim.close();
                return Err(err);
            }
        };
        tls_ids.sort();
        let (_, inbox) = stats_channel();
        Ok(Self {
            sim,
            cfg: cfg.control.clone(),
            mode,
            tls_ids,
            agents: Vec::new(),
            inbox,
            aggregator: StatsAggregator::new(0.0),
            telemetry: TelemetrySink::off(),
            stop: None,
            sample_log: LogThrottle::new(10),
            sim_error_log: LogThrottle::new(10),
            verbosity: cfg.verbosity,
        })
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// The session ends at the next step once the flag is set.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn tls_ids(&self) -> &[TlsId] {
        &self.tls_ids
    }

    pub fn agents(&self) -> &[IntersectionAgent] {
        &self.agents
    }

    pub fn aggregator(&self) -> &StatsAggregator {
        &self.aggregator
    }

    /// Run until the configured duration, the stop flag, or simulator
    /// termination. Always closes the simulator.
    pub fn run(&mut self) -> Result<SessionSummary, SimError> {
        let result = self.run_loop();
        self.sim.close();
        if let Ok(summary) = &result {
            self.telemetry.session_end(summary);
        }
        self.telemetry.flush();
        if self.verbosity >= VERBOSITY_SUMMARY {
            eprintln!("[control] simulator closed");
        }
        result
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }

    fn run_loop(&mut self) -> Result<SessionSummary, SimError> {
        let start = self.sim.time()?;
        let duration = self.cfg.duration;
        self.aggregator = StatsAggregator::new(start);

        if self.verbosity >= VERBOSITY_SUMMARY {
            eprintln!(
                "[control] starting {} session for {:.0}s: traffic lights {:?}",
                self.mode, duration, self.tls_ids
            );
        }
        for agent in self.agents.iter_mut() {
            agent.startup(&mut self.sim)?;
        }

        let mut scheduler = LoopScheduler::new(
            start,
            self.cfg.decision_interval,
            self.cfg.report_interval,
            self.cfg.summary_interval,
        );
        let mut summary = SessionSummary {
            mode: Some(self.mode),
            ..SessionSummary::default()
        };
        let mut queue_sum = 0.0;
        let mut waiting_sum = 0.0;
        let mut now = start;
        let mut consecutive_errors = 0u32;

        'steps: loop {
            if self.stop_requested() {
                summary.interrupted = true;
                eprintln!("[control] session interrupted");
                break;
            }
            if now - start >= duration {
                break;
            }

            if let Err(err) = self.sim.advance() {
                if self.give_up_on("advance", &err, &mut summary, &mut consecutive_errors) {
                    break;
                }
                continue;
            }
            summary.steps += 1;
            now = match self.sim.time() {
                Ok(t) => t,
                Err(err) => {
                    if self.give_up_on("clock read", &err, &mut summary, &mut consecutive_errors) {
                        break;
                    }
                    continue;
                }
            };
            consecutive_errors = 0;

            let sample = self.sample_network();
            queue_sum += sample.halting as f64;
            waiting_sum += sample.waiting;

            let every = self.cfg.progress_every_steps;
            if every > 0 && summary.steps % every == 0 && self.verbosity >= VERBOSITY_SUMMARY {
                let avg_wait = if sample.vehicles > 0 {
                    sample.waiting / sample.vehicles as f64
                } else {
                    0.0
                };
                eprintln!(
                    "[control] Time: {:.0}s ({:.1}%) | Vehicles: {} | Waiting: {} | Avg Wait: {:.1}s",
                    now,
                    (now - start) / duration.max(f64::EPSILON) * 100.0,
                    sample.vehicles,
                    sample.halting,
                    avg_wait
                );
            }

            if scheduler.decision_due(now) {
                scheduler.mark_decision_ran(now);
                for agent in self.agents.iter_mut() {
                    let tick = match agent.decide_tick(&mut self.sim, now) {
                        Ok(tick) => tick,
                        Err(err) => {
                            eprintln!("[sim] simulation ended: {}", err);
                            summary.terminated = true;
                            break 'steps;
                        }
                    };
                    summary.decision_ticks += 1;
                    match tick.outcome {
                        TickOutcome::Switched { from, to } => {
                            summary.phase_changes += 1;
                            self.telemetry.phase_change(PhaseChange {
                                tls_id: agent.tls_id(),
                                from,
                                to,
                                sim_time: now,
                                state: tick.state,
                                source: tick.source,
                            });
                        }
                        TickOutcome::Skipped => summary.skipped_ticks += 1,
                        _ => {}
                    }
                }
            }

            if scheduler.report_due(now) {
                scheduler.mark_report_ran(now);
                for agent in self.agents.iter_mut() {
                    match agent.report_stats(&self.sim) {
                        Ok(Some(_)) => summary.reports_sent += 1,
                        Ok(None) => {}
                        Err(err) => {
                            eprintln!("[sim] simulation ended: {}", err);
                            summary.terminated = true;
                            break 'steps;
                        }
                    }
                }
                self.aggregator.drain(&mut self.inbox, now);
            }

            if scheduler.summary_due(now) {
                scheduler.mark_summary_ran(now);
                self.aggregator.drain(&mut self.inbox, now);
                if self.verbosity >= VERBOSITY_SUMMARY && self.mode == SessionMode::Learned {
                    match self.aggregator.render_report(now) {
                        Some(report) => eprintln!("[coordinator]\n{}", report),
                        None => eprintln!("[coordinator] no statistics available yet"),
                    }
                }
            }
        }

        summary.sim_seconds = now - start;
        if summary.steps > 0 {
            summary.mean_total_queue = queue_sum / summary.steps as f64;
            summary.mean_total_waiting = waiting_sum / summary.steps as f64;
        }

        if self.verbosity >= VERBOSITY_SUMMARY {
            eprintln!(
                "[control] {} session done: {} steps ({:.0}s), mean queue {:.2}, mean waiting {:.1}s, {} phase changes, {} skipped ticks",
                self.mode,
                summary.steps,
                summary.sim_seconds,
                summary.mean_total_queue,
                summary.mean_total_waiting,
                summary.phase_changes,
                summary.skipped_ticks
            );
        }
        Ok(summary)
    }

    /// Account for a failed advance or clock read. True when the session
    /// must end: the simulator is gone, or it keeps failing.
    fn give_up_on(
        &mut self,
        what: &str,
        err: &SimError,
        summary: &mut SessionSummary,
        consecutive: &mut u32,
    ) -> bool {
        if err.is_fatal() {
            eprintln!("[sim] simulation ended: {}", err);
            summary.terminated = true;
            return true;
        }
        summary.sim_errors += 1;
        *consecutive += 1;
        if *consecutive >= MAX_CONSECUTIVE_SIM_ERRORS {
            eprintln!(
                "[sim] ERROR: {} failed {} times in a row, ending session: {}",
                what, consecutive, err
            );
            return true;
        }
        if self.sim_error_log.hit() {
            eprintln!(
                "[sim] WARN: {} failed, continuing ({} failures): {}",
                what,
                self.sim_error_log.count(),
                err
            );
        }
        false
    }

    /// Totals over every intersection's unique controlled lanes. Intersections
    /// whose queries fail are left out of the sample.
    fn sample_network(&mut self) -> NetworkSample {
        let mut sample = NetworkSample::default();
        for id in &self.tls_ids {
            match read_lane_totals(&self.sim, id) {
                Ok(s) => {
                    sample.vehicles += s.vehicles;
                    sample.halting += s.halting;
                    sample.waiting += s.waiting;
                }
                Err(err) => {
                    if self.sample_log.hit() {
                        eprintln!("[control] {}: WARN: metrics sample failed: {}", id, err);
                    }
                }
            }
        }
        sample
    }
}

fn read_lane_totals<S: TrafficSimulator + ?Sized>(
    sim: &S,
    tls_id: &str,
) -> Result<NetworkSample, SimError> {
    let mut sample = NetworkSample::default();
    for lane in unique_lanes(sim, tls_id)? {
        sample.vehicles += sim.lane_vehicle_count(&lane)?;
        sample.halting += sim.lane_halting(&lane)?;
        sample.waiting += sim.lane_waiting_time(&lane)?.max(0.0);
    }
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::q_table::QTableSet;
    use crate::sim::{SyntheticConfig, SyntheticSimulator};

    fn config(duration: SimTime) -> Config {
        let mut cfg = Config::default();
        cfg.verbosity = 0;
        cfg.control.duration = duration;
        cfg.synthetic = SyntheticConfig {
            intersections: vec!["J9".to_string(), "J7".to_string()],
            ..SyntheticConfig::default()
        };
        cfg
    }

    #[test]
    fn session_runs_for_duration_and_closes_simulator() {
        let cfg = config(60.0);
        let artifact = PolicyArtifact::new(QTableSet::new());
        let mut session =
            ControlSession::new(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg, &artifact)
                .unwrap();
        assert_eq!(session.tls_ids(), &["J7".to_string(), "J9".to_string()]);

        let summary = session.run().unwrap();
        assert_eq!(summary.steps, 60);
        assert_eq!(summary.sim_seconds, 60.0);
        // Decisions at 5, 10, ..., 60 for two agents.
        assert_eq!(summary.decision_ticks, 24);
        // Reports at 10, 20, ..., 60 for two agents.
        assert_eq!(summary.reports_sent, 12);
        assert_eq!(session.aggregator().intersections(), 2);
        assert!(!summary.interrupted && !summary.terminated);
    }

    #[test]
    fn baseline_session_has_no_agents() {
        let cfg = config(40.0);
        let mut session =
            ControlSession::baseline(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg).unwrap();
        assert!(session.agents().is_empty());
        let summary = session.run().unwrap();
        assert_eq!(summary.mode, Some(SessionMode::Baseline));
        assert_eq!(summary.steps, 40);
        assert_eq!(summary.decision_ticks, 0);
        assert_eq!(summary.phase_changes, 0);
    }

    #[test]
    fn stop_flag_ends_session_immediately() {
        let cfg = config(600.0);
        let stop = Arc::new(AtomicBool::new(true));
        let mut session =
            ControlSession::baseline(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg)
                .unwrap()
                .with_stop_flag(stop);
        let summary = session.run().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.steps, 0);
    }
}
