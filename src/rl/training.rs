// src/rl/training.rs
//
// Episodic tabular Q-learning over a batched multi-intersection simulator.
//
// Per episode:
//   reset → encode initial states, collect initial metrics
//   until done or step cap:
//     epsilon-greedy action per intersection (sorted id order)
//     one batched simulator step
//     per intersection: metrics → enhanced reward → Q update → advance state
//   decay epsilon
//
// A simulator error aborts the current episode; `SimError::Terminated` (or
// the stop flag) ends training. The simulator is always closed on exit.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::artifact::{ArtifactError, PolicyArtifact};
use super::observation::{RawObservation, StateEncoder};
use super::policy::EpsilonGreedy;
use super::q_table::{total_states, QTable, QTableSet};
use super::reward::{RewardModel, TrafficMetricsSnapshot};
use crate::config::{Config, TrainingConfig};
use crate::logging::{Verbosity, VERBOSITY_DEBUG, VERBOSITY_SUMMARY};
use crate::sim::{collect_metrics, SimError, TrafficSimulator};
use crate::telemetry::TelemetrySink;
use crate::types::{Action, DiscretizedState, TlsId};

/// Episodes averaged for the final reward figure.
pub const FINAL_AVERAGE_WINDOW: usize = 50;

#[derive(Debug)]
pub enum TrainingError {
    /// The simulator failed before any episode could start.
    Sim(SimError),
    /// The learned tables could not be persisted.
    Artifact(ArtifactError),
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Sim(err) => write!(f, "training could not start: {}", err),
            TrainingError::Artifact(err) => write!(f, "could not persist q-tables: {}", err),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Sim(err) => Some(err),
            TrainingError::Artifact(err) => Some(err),
        }
    }
}

impl From<ArtifactError> for TrainingError {
    fn from(err: ArtifactError) -> Self {
        TrainingError::Artifact(err)
    }
}

/// Per-episode record (also the `episode_end` telemetry payload).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    /// 0-based episode index.
    pub episode: u32,
    pub steps: u32,
    /// Sum over steps and intersections of the enhanced reward.
    pub total_reward: f64,
    /// Epsilon after this episode's decay.
    pub epsilon: f64,
    /// States across all tables at the end of the episode.
    pub states_learned: usize,
    /// The episode ended on a simulator error rather than done / step cap.
    pub aborted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub episodes: Vec<EpisodeSummary>,
    pub final_epsilon: f64,
    pub total_states: usize,
    /// Training stopped early (stop flag or fatal simulator error).
    pub interrupted: bool,
}

impl TrainingSummary {
    pub fn episodes_completed(&self) -> usize {
        self.episodes.len()
    }

    /// Mean reward of the last `window` episodes (0 with no episodes).
    pub fn average_reward(&self, window: usize) -> f64 {
        let n = self.episodes.len().min(window);
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = self.episodes[self.episodes.len() - n..]
            .iter()
            .map(|e| e.total_reward)
            .sum();
        sum / n as f64
    }

    pub fn final_average(&self) -> f64 {
        self.average_reward(FINAL_AVERAGE_WINDOW)
    }
}

/// Outcome of one episode's step loop.
struct EpisodeRun {
    steps: u32,
    total_reward: f64,
    error: Option<SimError>,
    stopped: bool,
}

pub struct Trainer<S: TrafficSimulator> {
    sim: S,
    cfg: TrainingConfig,
    reward: RewardModel,
    encoder: StateEncoder,
    policy: EpsilonGreedy,
    tables: QTableSet,
    tls_ids: Vec<TlsId>,
    telemetry: TelemetrySink,
    stop: Option<Arc<AtomicBool>>,
    verbosity: Verbosity,
}

impl<S: TrafficSimulator> Trainer<S> {
    pub fn new(sim: S, cfg: &Config) -> Self {
        Self {
            sim,
            policy: EpsilonGreedy::new(cfg.training.seed),
            cfg: cfg.training.clone(),
            reward: RewardModel::new(cfg.reward),
            encoder: StateEncoder,
            tables: QTableSet::new(),
            tls_ids: Vec::new(),
            telemetry: TelemetrySink::off(),
            stop: None,
            verbosity: cfg.verbosity,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Training stops at the next step once the flag is set.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn tables(&self) -> &QTableSet {
        &self.tables
    }

    pub fn into_tables(self) -> QTableSet {
        self.tables
    }

    /// Intersections under training, in decision order.
    pub fn tls_ids(&self) -> &[TlsId] {
        &self.tls_ids
    }

    /// Write every table to one artifact at `path`.
    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        PolicyArtifact::new(self.tables.clone()).save(path)?;
        if self.verbosity >= VERBOSITY_SUMMARY {
            eprintln!(
                "[train] q-tables saved to {} ({} tables, {} states)",
                path.display(),
                self.tables.len(),
                total_states(&self.tables)
            );
        }
        Ok(())
    }

    /// Run all episodes. Always closes the simulator.
    pub fn run(&mut self) -> Result<TrainingSummary, TrainingError> {
        let result = self.run_episodes();
        self.sim.close();
        self.telemetry.flush();
        result
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }

    fn run_episodes(&mut self) -> Result<TrainingSummary, TrainingError> {
        let mut epsilon = self.cfg.epsilon.tracker();
        let mut summary = TrainingSummary {
            final_epsilon: epsilon.epsilon(),
            ..TrainingSummary::default()
        };

        if self.verbosity >= VERBOSITY_SUMMARY {
            eprintln!(
                "[train] starting {} episodes (max {} steps, alpha={}, gamma={}, epsilon={})",
                self.cfg.episodes,
                self.cfg.max_steps,
                self.cfg.alpha,
                self.cfg.gamma,
                epsilon.epsilon()
            );
        }

        for episode in 0..self.cfg.episodes {
            if self.stop_requested() {
                summary.interrupted = true;
                break;
            }

            let observations = match self.sim.reset() {
                Ok(obs) => obs,
                Err(err) => {
                    eprintln!("[train] ERROR: reset failed at episode {}: {}", episode, err);
                    if summary.episodes.is_empty() {
                        return Err(TrainingError::Sim(err));
                    }
                    summary.interrupted = true;
                    break;
                }
            };
            if self.tls_ids.is_empty() {
                self.init_intersections(&observations);
            }

            let run = self.run_episode(observations, epsilon.epsilon());
            let eps_after = epsilon.end_episode(episode);

            if let Some(err) = &run.error {
                eprintln!(
                    "[train] WARN: episode {} aborted after {} steps: {}",
                    episode, run.steps, err
                );
            }

            let record = EpisodeSummary {
                episode,
                steps: run.steps,
                total_reward: run.total_reward,
                epsilon: eps_after,
                states_learned: total_states(&self.tables),
                aborted: run.error.is_some(),
            };
            self.telemetry.episode_end(&record);
            summary.episodes.push(record);
            summary.final_epsilon = eps_after;

            let every = self.cfg.progress_every as usize;
            if self.verbosity >= VERBOSITY_SUMMARY
                && every > 0
                && summary.episodes.len() % every == 0
            {
                eprintln!(
                    "[train] Episode {}/{}, Avg Enhanced Reward: {:.2}, Epsilon: {:.3}, Steps: {}",
                    episode + 1,
                    self.cfg.episodes,
                    summary.average_reward(every),
                    eps_after,
                    run.steps
                );
            }

            let fatal = run.error.as_ref().map_or(false, SimError::is_fatal);
            if run.stopped || fatal {
                summary.interrupted = true;
                break;
            }
        }

        summary.total_states = total_states(&self.tables);
        if self.verbosity >= VERBOSITY_SUMMARY {
            if summary.interrupted {
                eprintln!("[train] training interrupted");
            }
            eprintln!(
                "[train] complete: {} episodes, final average reward {:.2}, {} states learned",
                summary.episodes_completed(),
                summary.final_average(),
                summary.total_states
            );
        }
        Ok(summary)
    }

    fn init_intersections(
        &mut self,
        observations: &BTreeMap<TlsId, RawObservation>,
    ) {
        self.tls_ids = observations.keys().cloned().collect();
        if self.tls_ids.is_empty() {
            self.tls_ids = self.sim.traffic_light_ids().unwrap_or_default();
            self.tls_ids.sort();
        }
        for id in &self.tls_ids {
            self.tables.entry(id.clone()).or_insert_with(QTable::new);
        }
        if self.verbosity >= VERBOSITY_SUMMARY {
            eprintln!("[train] traffic lights: {:?}", self.tls_ids);
        }
    }

    fn run_episode(
        &mut self,
        observations: BTreeMap<TlsId, RawObservation>,
        epsilon: f64,
    ) -> EpisodeRun {
        let mut states: BTreeMap<TlsId, DiscretizedState> = BTreeMap::new();
        let mut prev_metrics: BTreeMap<TlsId, TrafficMetricsSnapshot> = BTreeMap::new();
        for id in &self.tls_ids {
            states.insert(id.clone(), self.encoder.encode_opt(observations.get(id)));
            prev_metrics.insert(id.clone(), collect_metrics(&self.sim, id));
        }

        let mut run = EpisodeRun {
            steps: 0,
            total_reward: 0.0,
            error: None,
            stopped: false,
        };
        let mut done = false;

        while !done && run.steps < self.cfg.max_steps {
            if self.stop_requested() {
                run.stopped = true;
                break;
            }

            let mut actions: BTreeMap<TlsId, Action> = BTreeMap::new();
            for id in &self.tls_ids {
                let state = states.get(id).copied().unwrap_or(DiscretizedState::EMPTY);
                let table = self.tables.entry(id.clone()).or_default();
                actions.insert(id.clone(), self.policy.select(table, state, epsilon));
            }

            let outcome = match self.sim.step(&actions) {
                Ok(outcome) => outcome,
                Err(err) => {
                    run.error = Some(err);
                    break;
                }
            };
            done = outcome.done;

            for id in &self.tls_ids {
                let state = states.get(id).copied().unwrap_or(DiscretizedState::EMPTY);
                let action = actions.get(id).copied().unwrap_or(Action::Keep);
                let current = collect_metrics(&self.sim, id);
                let reward = match prev_metrics.get(id) {
                    Some(prev) => self.reward.reward(id, prev, &current, outcome.reward_for(id)),
                    None => self.reward.reward(
                        id,
                        &TrafficMetricsSnapshot::zeroed(),
                        &current,
                        outcome.reward_for(id),
                    ),
                };
                let next_state = self.encoder.encode_opt(outcome.observations.get(id));

                self.tables.entry(id.clone()).or_default().update(
                    state,
                    action,
                    reward,
                    next_state,
                    self.cfg.alpha,
                    self.cfg.gamma,
                );

                if self.verbosity >= VERBOSITY_DEBUG {
                    eprintln!(
                        "[train] {} step {}: {} {} -> {} r={:.3}",
                        id, run.steps, state, action, next_state, reward
                    );
                }

                states.insert(id.clone(), next_state);
                prev_metrics.insert(id.clone(), current);
                run.total_reward += reward;
            }

            run.steps += 1;
        }

        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SyntheticConfig, SyntheticSimulator};

    fn small_config(episodes: u32) -> Config {
        let mut cfg = Config::default();
        cfg.training.episodes = episodes;
        cfg.training.max_steps = 20;
        cfg.verbosity = 0;
        cfg.synthetic = SyntheticConfig {
            intersections: vec!["J7".to_string(), "J9".to_string()],
            episode_seconds: 100.0,
            ..SyntheticConfig::default()
        };
        cfg
    }

    #[test]
    fn episodes_respect_step_cap_and_done() {
        let cfg = small_config(3);
        let mut trainer = Trainer::new(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg);
        let summary = trainer.run().unwrap();
        assert_eq!(summary.episodes_completed(), 3);
        // 100 s episode at 5 s per step reports done after 20 steps.
        assert!(summary.episodes.iter().all(|e| e.steps == 20 && !e.aborted));
        assert_eq!(trainer.tls_ids(), &["J7".to_string(), "J9".to_string()]);
        assert!(summary.total_states > 0);
    }

    #[test]
    fn epsilon_is_recorded_after_decay() {
        let cfg = small_config(2);
        let mut trainer = Trainer::new(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg);
        let summary = trainer.run().unwrap();
        assert!((summary.episodes[0].epsilon - 0.998).abs() < 1e-12);
        assert!((summary.final_epsilon - 0.998 * 0.998).abs() < 1e-12);
    }

    #[test]
    fn stop_flag_interrupts_before_first_episode() {
        let cfg = small_config(5);
        let stop = Arc::new(AtomicBool::new(true));
        let mut trainer = Trainer::new(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg)
            .with_stop_flag(stop);
        let summary = trainer.run().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.episodes_completed(), 0);
    }

    #[test]
    fn closed_simulator_fails_training_start() {
        let cfg = small_config(2);
        let mut sim = SyntheticSimulator::new(cfg.synthetic.clone());
        sim.close();
        let mut trainer = Trainer::new(sim, &cfg);
        assert!(matches!(trainer.run(), Err(TrainingError::Sim(_))));
    }

    #[test]
    fn average_reward_uses_trailing_window() {
        let summary = TrainingSummary {
            episodes: (0..4)
                .map(|i| EpisodeSummary {
                    episode: i,
                    steps: 1,
                    total_reward: i as f64,
                    epsilon: 1.0,
                    states_learned: 0,
                    aborted: false,
                })
                .collect(),
            ..TrainingSummary::default()
        };
        assert_eq!(summary.average_reward(2), 2.5);
        assert_eq!(summary.final_average(), 1.5);
        assert_eq!(TrainingSummary::default().final_average(), 0.0);
    }
}
