// src/config.rs
//
// Central configuration for qsignal.
// This is the single source of truth for training hyperparameters, the
// runtime control cadences and timing constraints, reward weights, and the
// synthetic simulator used by the binaries.
//
// `Config::default()` carries the reference values; `Config::from_env()`
// layers QSIGNAL_* environment overrides on top of it.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use crate::logging::Verbosity;
use crate::rl::policy::EpsilonSchedule;
use crate::rl::reward::RewardWeights;
use crate::sim::synthetic::SyntheticConfig;
use crate::types::SimTime;

/// Human-readable config / release version.
pub const CONFIG_VERSION: &str = "qsignal-cfg-v1";

/// Default location of the learned policy artifact.
pub const DEFAULT_ARTIFACT_PATH: &str = "models/q_tables.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub version: &'static str,
    /// Tabular Q-learning hyperparameters.
    pub training: TrainingConfig,
    /// Runtime decision engine cadences and timing constraints.
    pub control: ControlConfig,
    /// Reward shaping weights.
    pub reward: RewardWeights,
    /// In-process simulator used by the binaries and tests.
    pub synthetic: SyntheticConfig,
    /// Learned policy artifact location (written by training, read at runtime).
    pub artifact_path: PathBuf,
    /// Verbosity for stderr diagnostics.
    pub verbosity: Verbosity,
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Number of training episodes.
    pub episodes: u32,
    /// Step cap per episode (guards against a simulator that never reports done).
    pub max_steps: u32,
    /// Learning rate.
    pub alpha: f64,
    /// Discount factor.
    pub gamma: f64,
    /// Exploration schedule.
    pub epsilon: EpsilonSchedule,
    /// Seed for the exploration RNG (and the synthetic simulator).
    pub seed: u64,
    /// Print a progress line every N episodes (0 disables).
    pub progress_every: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            episodes: 600,
            max_steps: 1800,
            alpha: 0.1,
            gamma: 0.95,
            epsilon: EpsilonSchedule::default(),
            seed: 42,
            progress_every: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Seconds between decision ticks.
    pub decision_interval: SimTime,
    /// Seconds between statistics reports sent to the aggregator.
    pub report_interval: SimTime,
    /// Seconds between aggregated statistics printouts.
    pub summary_interval: SimTime,
    /// Minimum green time before a switch may be considered.
    pub min_green: SimTime,
    /// Yellow duration. Informational: the simulator's program enforces it.
    pub yellow_time: SimTime,
    /// Session length in simulated seconds.
    pub duration: SimTime,
    /// Print a progress line every N simulator steps (0 disables).
    pub progress_every_steps: u64,
    /// Seed for the runtime fallback RNG.
    pub seed: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            decision_interval: 5.0,
            report_interval: 10.0,
            summary_interval: 30.0,
            min_green: 5.0,
            yellow_time: 3.0,
            duration: 1800.0,
            progress_every_steps: 100,
            seed: 7,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            training: TrainingConfig::default(),
            control: ControlConfig::default(),
            reward: RewardWeights::default(),
            synthetic: SyntheticConfig::default(),
            artifact_path: PathBuf::from(DEFAULT_ARTIFACT_PATH),
            verbosity: 1,
        }
    }
}

impl Config {
    /// Build a config from defaults plus environment overrides.
    ///
    /// Recognised variables:
    ///
    ///   - QSIGNAL_EPISODES           (u32)
    ///   - QSIGNAL_MAX_STEPS          (u32)
    ///   - QSIGNAL_ALPHA              (f64)
    ///   - QSIGNAL_GAMMA              (f64)
    ///   - QSIGNAL_SEED               (u64)
    ///   - QSIGNAL_DECISION_INTERVAL  (f64, seconds)
    ///   - QSIGNAL_MIN_GREEN          (f64, seconds)
    ///   - QSIGNAL_ARTIFACT_PATH      (path)
    ///
    /// Any variable that fails to parse is ignored with a warning.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        override_from_env("QSIGNAL_EPISODES", &mut cfg.training.episodes);
        override_from_env("QSIGNAL_MAX_STEPS", &mut cfg.training.max_steps);
        override_from_env("QSIGNAL_ALPHA", &mut cfg.training.alpha);
        override_from_env("QSIGNAL_GAMMA", &mut cfg.training.gamma);
        if override_from_env("QSIGNAL_SEED", &mut cfg.training.seed) {
            cfg.synthetic.seed = cfg.training.seed;
        }
        override_from_env(
            "QSIGNAL_DECISION_INTERVAL",
            &mut cfg.control.decision_interval,
        );
        override_from_env("QSIGNAL_MIN_GREEN", &mut cfg.control.min_green);

        if let Ok(raw) = env::var("QSIGNAL_ARTIFACT_PATH") {
            if raw.trim().is_empty() {
                eprintln!("[config] WARN: empty QSIGNAL_ARTIFACT_PATH; ignoring");
            } else {
                cfg.artifact_path = PathBuf::from(raw.trim());
                eprintln!(
                    "[config] QSIGNAL_ARTIFACT_PATH = {} (overrode default)",
                    cfg.artifact_path.display()
                );
            }
        }

        cfg
    }

    /// Log the effective configuration at startup (stderr).
    pub fn log_startup(&self, binary: &str) {
        eprintln!(
            "[config] {} | cfg={} | episodes={} max_steps={} alpha={} gamma={} seed={} | decision={}s min_green={}s | artifact={}",
            binary,
            self.version,
            self.training.episodes,
            self.training.max_steps,
            self.training.alpha,
            self.training.gamma,
            self.training.seed,
            self.control.decision_interval,
            self.control.min_green,
            self.artifact_path.display()
        );
    }
}

/// Apply one environment override. Returns true if the value changed.
fn override_from_env<T>(name: &str, slot: &mut T) -> bool
where
    T: FromStr + Display,
{
    let Ok(raw) = env::var(name) else {
        return false;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => {
            eprintln!("[config] {name} = {v} (overrode default)");
            *slot = v;
            true
        }
        Err(_) => {
            eprintln!(
                "[config] WARN: could not parse {} = {:?}; using default {}",
                name, raw, slot
            );
            false
        }
    }
}
