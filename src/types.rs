// src/types.rs
//
// Common shared types for the qsignal control core.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable traffic-light (intersection) identifier, e.g. "J7".
pub type TlsId = String;

/// Lane identifier as reported by the simulator.
pub type LaneId = String;

/// Simulated time in seconds.
pub type SimTime = f64;

/// Number of lane groups in a discretized state.
pub const STATE_WIDTH: usize = 4;

/// Highest congestion bucket.
pub const MAX_BUCKET: u8 = 4;

/// Abstract per-intersection decision.
///
/// The discriminants are the action indices used in the Q-table
/// (`ActionValues[0]` is KEEP, `ActionValues[1]` is SWITCH).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    /// Leave the current phase untouched.
    Keep = 0,
    /// Advance to the next eligible non-yellow phase.
    Switch = 1,
}

impl Action {
    pub const ALL: [Action; 2] = [Action::Keep, Action::Switch];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Map an action index back to an Action. Returns None if out of range.
    pub fn from_index(index: usize) -> Option<Action> {
        match index {
            0 => Some(Action::Keep),
            1 => Some(Action::Switch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Keep => "keep",
            Action::Switch => "switch",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discretized congestion state: exactly four buckets in `0..=4`.
///
/// Ordering is lexicographic over the buckets, which fixes the iteration
/// order of every Q-table (and therefore similarity-search tie-breaking).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct DiscretizedState([u8; STATE_WIDTH]);

impl DiscretizedState {
    /// The all-zero state (fully idle intersection, or a degraded reading).
    pub const EMPTY: DiscretizedState = DiscretizedState([0; STATE_WIDTH]);

    /// Build a state from buckets, clamping each into `0..=MAX_BUCKET`.
    pub fn new(buckets: [u8; STATE_WIDTH]) -> Self {
        DiscretizedState(buckets.map(|b| b.min(MAX_BUCKET)))
    }

    pub fn buckets(&self) -> &[u8; STATE_WIDTH] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Number of positions at which the two states hold the same bucket.
    pub fn similarity(&self, other: &DiscretizedState) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .filter(|(a, b)| a == b)
            .count()
    }
}

impl fmt::Display for DiscretizedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "({a}, {b}, {c}, {d})")
    }
}

impl TryFrom<Vec<u8>> for DiscretizedState {
    type Error = String;

    fn try_from(raw: Vec<u8>) -> Result<Self, Self::Error> {
        let buckets: [u8; STATE_WIDTH] = raw
            .as_slice()
            .try_into()
            .map_err(|_| format!("expected {} buckets, got {}", STATE_WIDTH, raw.len()))?;
        if let Some(bad) = buckets.iter().find(|&&b| b > MAX_BUCKET) {
            return Err(format!("bucket {bad} out of range 0..={MAX_BUCKET}"));
        }
        Ok(DiscretizedState(buckets))
    }
}

impl From<DiscretizedState> for Vec<u8> {
    fn from(state: DiscretizedState) -> Self {
        state.0.to_vec()
    }
}

/// Action-value pair for one state: `[Q(s, KEEP), Q(s, SWITCH)]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionValues(pub [f64; 2]);

impl ActionValues {
    pub fn get(&self, action: Action) -> f64 {
        self.0[action.index()]
    }

    pub fn get_mut(&mut self, action: Action) -> &mut f64 {
        &mut self.0[action.index()]
    }

    /// Highest value over both actions.
    pub fn max_value(&self) -> f64 {
        self.0[0].max(self.0[1])
    }

    /// Argmax over actions; exact ties go to the lowest index (KEEP).
    pub fn argmax(&self) -> Action {
        if self.0[1] > self.0[0] {
            Action::Switch
        } else {
            Action::Keep
        }
    }

    /// Absolute gap between the two action values.
    pub fn spread(&self) -> f64 {
        (self.0[0] - self.0[1]).abs()
    }
}

/// One entry of a simulator phase program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDef {
    /// Signal-state string, one character per controlled link (e.g. "GGrr").
    pub state: String,
    /// Program duration of the phase in seconds.
    pub duration: SimTime,
}

impl PhaseDef {
    pub fn new(state: &str, duration: SimTime) -> Self {
        Self {
            state: state.to_string(),
            duration,
        }
    }

    pub fn is_yellow(&self) -> bool {
        is_yellow_state(&self.state)
    }
}

/// True if a signal-state string carries a yellow indicator (`y` or `Y`).
pub fn is_yellow_state(state: &str) -> bool {
    state.chars().any(|c| c.eq_ignore_ascii_case(&'y'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_prefers_keep_on_exact_tie() {
        assert_eq!(ActionValues([0.0, 0.0]).argmax(), Action::Keep);
        assert_eq!(ActionValues([-1.5, -1.5]).argmax(), Action::Keep);
        assert_eq!(ActionValues([-1.0, 0.5]).argmax(), Action::Switch);
    }

    #[test]
    fn state_similarity_counts_matching_positions() {
        let a = DiscretizedState::new([1, 2, 3, 4]);
        let b = DiscretizedState::new([1, 2, 0, 4]);
        assert_eq!(a.similarity(&b), 3);
        assert_eq!(a.similarity(&DiscretizedState::EMPTY), 0);
    }

    #[test]
    fn state_serde_rejects_out_of_range_bucket() {
        let ok: DiscretizedState = serde_json::from_str("[0,1,2,4]").unwrap();
        assert_eq!(ok, DiscretizedState::new([0, 1, 2, 4]));
        assert!(serde_json::from_str::<DiscretizedState>("[0,1,2,5]").is_err());
        assert!(serde_json::from_str::<DiscretizedState>("[0,1,2]").is_err());
    }

    #[test]
    fn yellow_indicator_is_case_insensitive() {
        assert!(is_yellow_state("yyrr"));
        assert!(is_yellow_state("rrYr"));
        assert!(!is_yellow_state("GGrr"));
    }
}
