// src/rl/policy.rs
//
// Action selection.
//
// Two policies read the same Q-tables:
// - EpsilonGreedy: training-time exploration over a lazily grown table.
// - DecisionPolicy: runtime lookup over a frozen table, with a layered
//   fallback for states the training runs never visited:
//     1. known state  → argmax, except near-ties (< 0.1 apart) which SWITCH
//     2. (0,0,0,0)    → KEEP with p=0.8, SWITCH with p=0.2
//     3. similar state sharing ≥ 2 buckets → its argmax
//     4. otherwise    → SWITCH
//
// The fallback constants are fixed; they are part of the published
// behaviour of trained policies.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::q_table::QTable;
use crate::logging::{LogThrottle, Verbosity, VERBOSITY_DEBUG, VERBOSITY_SUMMARY};
use crate::types::{Action, DiscretizedState};

/// Known states whose action values are closer than this prefer SWITCH.
pub const NEAR_TIE_MARGIN: f64 = 0.1;

/// Probability of KEEP for the never-seen empty state.
pub const EMPTY_STATE_KEEP_PROB: f64 = 0.8;

/// Minimum number of matching buckets for a similar-state lookup.
pub const MIN_SIMILARITY: usize = 2;

// ---------------------------------------------------------------------------
// Exploration schedule
// ---------------------------------------------------------------------------

/// Multiplicative epsilon decay with optional rate changes at fixed episodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpsilonSchedule {
    /// Epsilon at the first episode.
    pub start: f64,
    /// Floor.
    pub min: f64,
    /// Initial per-episode decay factor.
    pub decay: f64,
    /// `(episode, decay)` pairs: after decaying at the end of `episode`
    /// (0-based), switch to the new factor.
    pub checkpoints: Vec<(u32, f64)>,
}

impl Default for EpsilonSchedule {
    fn default() -> Self {
        Self {
            start: 1.0,
            min: 0.01,
            decay: 0.998,
            checkpoints: vec![(300, 0.997), (400, 0.996), (500, 0.995)],
        }
    }
}

impl EpsilonSchedule {
    /// Constant schedule (no decay). Useful for evaluation runs.
    pub fn constant(epsilon: f64) -> Self {
        Self {
            start: epsilon,
            min: epsilon,
            decay: 1.0,
            checkpoints: Vec::new(),
        }
    }

    pub fn tracker(&self) -> EpsilonTracker {
        EpsilonTracker {
            epsilon: self.start,
            decay: self.decay,
            schedule: self.clone(),
        }
    }

    /// Epsilon in effect during each of the first `episodes` episodes.
    pub fn trajectory(&self, episodes: u32) -> Vec<f64> {
        let mut tracker = self.tracker();
        (0..episodes)
            .map(|ep| {
                let eps = tracker.epsilon();
                tracker.end_episode(ep);
                eps
            })
            .collect()
    }
}

/// Live epsilon state while training.
#[derive(Debug, Clone)]
pub struct EpsilonTracker {
    epsilon: f64,
    decay: f64,
    schedule: EpsilonSchedule,
}

impl EpsilonTracker {
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Apply end-of-episode decay, then any checkpoint for this episode.
    pub fn end_episode(&mut self, episode: u32) -> f64 {
        self.epsilon = (self.epsilon * self.decay).max(self.schedule.min);
        if let Some(&(_, next)) = self
            .schedule
            .checkpoints
            .iter()
            .find(|(at, _)| *at == episode)
        {
            self.decay = next;
        }
        self.epsilon
    }
}

// ---------------------------------------------------------------------------
// Training policy
// ---------------------------------------------------------------------------

/// Epsilon-greedy action selection with a seeded RNG.
pub struct EpsilonGreedy {
    rng: ChaCha8Rng,
}

impl EpsilonGreedy {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// With probability `epsilon` a uniformly random action, otherwise the
    /// greedy one (ties → KEEP). Looking the state up creates its entry.
    pub fn select(&mut self, table: &mut QTable, state: DiscretizedState, epsilon: f64) -> Action {
        if self.rng.gen::<f64>() < epsilon {
            if self.rng.gen_range(0..Action::ALL.len()) == 0 {
                Action::Keep
            } else {
                Action::Switch
            }
        } else {
            table.get(state).argmax()
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime policy
// ---------------------------------------------------------------------------

/// Which layer of the runtime policy produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSource {
    /// Argmax over a known state.
    Learned,
    /// Known state with near-tied values; SWITCH preferred.
    NearTie,
    /// Unseen empty state; 80/20 keep/switch draw.
    EmptyState,
    /// Unseen state resolved through the most similar known state.
    Similar { similarity: usize },
    /// Nothing usable; SWITCH.
    Exploratory,
}

/// Greedy runtime policy with layered fallback.
pub struct DecisionPolicy {
    rng: ChaCha8Rng,
    empty_state_log: LogThrottle,
    verbosity: Verbosity,
}

impl DecisionPolicy {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            empty_state_log: LogThrottle::new(10),
            verbosity: 0,
        }
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn decide(&mut self, tls_id: &str, state: DiscretizedState, table: &QTable) -> Action {
        self.decide_with_source(tls_id, state, table).0
    }

    pub fn decide_with_source(
        &mut self,
        tls_id: &str,
        state: DiscretizedState,
        table: &QTable,
    ) -> (Action, DecisionSource) {
        if let Some(values) = table.peek(&state) {
            if values.spread() < NEAR_TIE_MARGIN {
                return (Action::Switch, DecisionSource::NearTie);
            }
            return (values.argmax(), DecisionSource::Learned);
        }

        if state.is_empty() {
            let action = if self.rng.gen::<f64>() < EMPTY_STATE_KEEP_PROB {
                Action::Keep
            } else {
                Action::Switch
            };
            if self.empty_state_log.hit() && self.verbosity >= VERBOSITY_SUMMARY {
                eprintln!(
                    "[control] {}: empty state {}, conservative default -> {} (seen {}x)",
                    tls_id,
                    state,
                    action,
                    self.empty_state_log.count()
                );
            }
            return (action, DecisionSource::EmptyState);
        }

        if let Some((action, similarity)) = similar_state_action(state, table) {
            return (action, DecisionSource::Similar { similarity });
        }

        if self.verbosity >= VERBOSITY_DEBUG {
            eprintln!(
                "[control] {}: unknown state {}, defaulting to {}",
                tls_id,
                state,
                Action::Switch
            );
        }
        (Action::Switch, DecisionSource::Exploratory)
    }
}

/// Greedy action of the known state most similar to `target`.
///
/// Walks the table in first-visit order; the earliest state reaching the
/// highest similarity wins. Returns None unless that similarity is at least
/// `MIN_SIMILARITY`.
pub fn similar_state_action(target: DiscretizedState, table: &QTable) -> Option<(Action, usize)> {
    let mut best: Option<(Action, usize)> = None;
    for (known, values) in table.iter() {
        let similarity = target.similarity(known);
        if best.map_or(true, |(_, s)| similarity > s) {
            best = Some((values.argmax(), similarity));
        }
    }
    best.filter(|&(_, s)| s >= MIN_SIMILARITY)
}
