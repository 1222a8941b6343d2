// src/rl/mod.rs
//
// Tabular reinforcement learning: state encoding, reward shaping, Q-tables,
// action selection, training and the persisted policy artifact.

pub mod artifact;
pub mod observation;
pub mod policy;
pub mod q_table;
pub mod reward;
pub mod training;

pub use artifact::{ArtifactError, PolicyArtifact, ARTIFACT_VERSION};
pub use observation::{
    bucket, discretize, extract_readings, ObservationError, ObservationValue, RawObservation,
    StateEncoder,
};
pub use policy::{
    similar_state_action, DecisionPolicy, DecisionSource, EpsilonGreedy, EpsilonSchedule,
    EpsilonTracker, EMPTY_STATE_KEEP_PROB, MIN_SIMILARITY, NEAR_TIE_MARGIN,
};
pub use q_table::{total_states, QEntry, QTable, QTableSet};
pub use reward::{LaneFlow, RewardComponents, RewardModel, RewardWeights, TrafficMetricsSnapshot};
pub use training::{EpisodeSummary, Trainer, TrainingError, TrainingSummary};
