//! qsignal core library.
//!
//! Decentralised traffic-signal control with tabular Q-learning: one
//! Q-table per intersection is learned offline against a batched
//! simulator, then frozen and served by per-intersection runtime agents.
//! The binaries (`src/main.rs`, `src/bin/train.rs`) are thin harnesses
//! around these components.

pub mod config;
pub mod control;
pub mod logging;
pub mod loop_scheduler;
pub mod rl;
pub mod shutdown;
pub mod sim;
pub mod stats;
pub mod telemetry;
pub mod types;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::{Config, ControlConfig, TrainingConfig};

pub use control::{
    ControlSession, IntersectionAgent, PhaseController, PhaseRuntimeState, SessionMode,
    SessionSummary, TickOutcome,
};

pub use logging::{LogThrottle, Verbosity};

pub use loop_scheduler::LoopScheduler;

pub use rl::{
    DecisionPolicy, EpsilonGreedy, EpsilonSchedule, PolicyArtifact, QTable, QTableSet,
    RawObservation, RewardModel, StateEncoder, Trainer, TrainingSummary,
    TrafficMetricsSnapshot,
};

pub use sim::{SimError, SyntheticConfig, SyntheticSimulator, TrafficSimulator};

pub use stats::{StatsAggregator, StatsReport};

pub use telemetry::TelemetrySink;

pub use types::{Action, ActionValues, DiscretizedState, TlsId};

// --- End-to-end: train, persist, serve --------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Short training run, artifact round trip, then a runtime session that
    /// serves the learned tables.
    #[test]
    fn trained_tables_drive_a_runtime_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");

        let mut cfg = Config::default();
        cfg.verbosity = 0;
        cfg.training.episodes = 3;
        cfg.training.max_steps = 40;
        cfg.control.duration = 120.0;

        let mut trainer = Trainer::new(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg);
        let summary = trainer.run().unwrap();
        assert_eq!(summary.episodes_completed(), 3);
        trainer.save(&path).unwrap();

        let artifact = PolicyArtifact::load(&path).unwrap();
        assert_eq!(artifact.tables.len(), 4);

        let mut session =
            ControlSession::new(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg, &artifact)
                .unwrap();
        assert!(session.agents().iter().all(|a| !a.table().is_empty()));
        let run = session.run().unwrap();
        assert_eq!(run.steps, 120);
        assert_eq!(run.decision_ticks, 4 * 24);
    }
}
