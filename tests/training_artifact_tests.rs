// tests/training_artifact_tests.rs
//
// Offline training and the persisted policy artifact.
//
// These tests verify:
// 1. Training is reproducible: same seed, same tables.
// 2. Tables survive a save/load round trip with identical greedy actions,
//    and keep the first-visit order the similarity fallback relies on.
// 3. With alpha = 0 no value ever moves away from zero.
// 4. Episode records reach the JSONL telemetry stream.
// 5. The stop flag and a dead simulator end training cleanly.
// 6. Corrupt or foreign artifacts degrade to the fallback policy.

use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use qsignal::config::Config;
use qsignal::rl::{
    DecisionPolicy, DecisionSource, PolicyArtifact, QTable, QTableSet, Trainer, TrainingError,
};
use qsignal::sim::{SyntheticSimulator, TrafficSimulator};
use qsignal::telemetry::{TelemetryConfig, TelemetrySink};
use qsignal::types::{Action, ActionValues, DiscretizedState};

/// Helper: quiet config for a short run.
fn short_config(episodes: u32, max_steps: u32) -> Config {
    let mut cfg = Config::default();
    cfg.verbosity = 0;
    cfg.training.episodes = episodes;
    cfg.training.max_steps = max_steps;
    cfg
}

/// Helper: train on the synthetic simulator and return the tables.
fn train(cfg: &Config) -> QTableSet {
    let mut trainer = Trainer::new(SyntheticSimulator::new(cfg.synthetic.clone()), cfg);
    trainer.run().unwrap();
    trainer.into_tables()
}

// =============================================================================
// Learning
// =============================================================================

/// Test that two runs with the same seeds learn identical tables.
#[test]
fn test_training_is_deterministic() {
    let cfg = short_config(4, 60);
    let a = train(&cfg);
    let b = train(&cfg);
    assert_eq!(a.len(), 4);
    assert_eq!(a, b);
}

/// Test that every intersection learns some states and values move.
#[test]
fn test_training_populates_tables() {
    let tables = train(&short_config(3, 80));
    for (tls, table) in &tables {
        assert!(table.len() >= 1, "{tls} learned nothing");
    }
    let moved = tables
        .values()
        .flat_map(|t| t.iter())
        .any(|(_, v)| v.0 != [0.0, 0.0]);
    assert!(moved);
}

/// Test that a zero learning rate leaves every value at its default.
#[test]
fn test_zero_alpha_freezes_values() {
    let mut cfg = short_config(2, 50);
    cfg.training.alpha = 0.0;
    let tables = train(&cfg);
    assert!(tables
        .values()
        .flat_map(|t| t.iter())
        .all(|(_, v)| v.0 == [0.0, 0.0]));
}

/// Test that the summary tracks episodes, epsilon and states.
#[test]
fn test_training_summary() {
    let cfg = short_config(5, 30);
    let mut trainer = Trainer::new(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg);
    let summary = trainer.run().unwrap();

    assert_eq!(summary.episodes_completed(), 5);
    assert!(!summary.interrupted);
    assert!(summary.episodes.iter().all(|e| e.steps == 30 && !e.aborted));
    assert!(summary.final_epsilon < 1.0);
    assert_eq!(
        summary.total_states,
        trainer.tables().values().map(QTable::len).sum::<usize>()
    );
    assert!(summary.episodes.iter().all(|e| e.total_reward.is_finite()));
}

// =============================================================================
// Persistence
// =============================================================================

/// Test that reloaded tables give the same greedy action for every state.
#[test]
fn test_saved_tables_reload_with_same_actions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("q_tables.json");

    let cfg = short_config(3, 60);
    let mut trainer = Trainer::new(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg);
    trainer.run().unwrap();
    trainer.save(&path).unwrap();

    let loaded = PolicyArtifact::load(&path).unwrap();
    assert_eq!(&loaded.tables, trainer.tables());
    for (tls, table) in trainer.tables() {
        let reloaded = loaded.table_for(tls);
        for (state, _) in table.iter() {
            assert_eq!(reloaded.best_action(state), table.best_action(state));
        }
    }
}

/// Test that a reloaded artifact resolves similarity ties to the state that
/// was visited first, even when that state sorts after its rival.
#[test]
fn test_reloaded_artifact_keeps_similarity_tie_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("q_tables.json");

    let mut table = QTable::new();
    table.insert(DiscretizedState::new([3, 3, 1, 1]), ActionValues([0.0, 4.0]));
    table.insert(DiscretizedState::new([0, 0, 1, 1]), ActionValues([4.0, 0.0]));
    let mut tables = QTableSet::new();
    tables.insert("J7".to_string(), table);
    PolicyArtifact::new(tables).save(&path).unwrap();

    let reloaded = PolicyArtifact::load(&path).unwrap().table_for("J7");
    let order: Vec<DiscretizedState> = reloaded.iter().map(|(s, _)| *s).collect();
    assert_eq!(
        order,
        vec![DiscretizedState::new([3, 3, 1, 1]), DiscretizedState::new([0, 0, 1, 1])]
    );

    // [2, 2, 1, 1] shares two buckets with both known states.
    let mut policy = DecisionPolicy::new(0);
    assert_eq!(
        policy.decide_with_source("J7", DiscretizedState::new([2, 2, 1, 1]), &reloaded),
        (Action::Switch, DecisionSource::Similar { similarity: 2 })
    );
}

/// Test that unreadable artifacts fall back to empty tables.
#[test]
fn test_bad_artifacts_fall_back_to_empty() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("missing.json");
    assert!(PolicyArtifact::load(&missing).is_err());
    assert!(PolicyArtifact::load_or_empty(&missing).tables.is_empty());

    let garbage = dir.path().join("garbage.json");
    fs::write(&garbage, "not json").unwrap();
    assert!(PolicyArtifact::load_or_empty(&garbage).tables.is_empty());

    let future = dir.path().join("future.json");
    fs::write(&future, r#"{"format_version": 99, "tables": {}}"#).unwrap();
    assert!(PolicyArtifact::load(&future).is_err());

    // A missing intersection gets an empty table.
    assert!(PolicyArtifact::new(QTableSet::new()).table_for("J7").is_empty());
}

// =============================================================================
// Telemetry and shutdown
// =============================================================================

/// Test that each episode writes one schema-tagged `episode_end` record.
#[test]
fn test_episode_telemetry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("train.jsonl");

    let cfg = short_config(3, 20);
    let sink = TelemetrySink::from_config(TelemetryConfig::jsonl(&path));
    let mut trainer =
        Trainer::new(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg).with_telemetry(sink);
    trainer.run().unwrap();
    drop(trainer);

    let text = fs::read_to_string(&path).unwrap();
    let records: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 3);
    for (i, rec) in records.iter().enumerate() {
        assert_eq!(rec["event"], "episode_end");
        assert_eq!(rec["schema_version"], 1);
        assert_eq!(rec["episode"], i as u64);
        assert_eq!(rec["steps"], 20);
    }
}

/// Test that a pre-set stop flag ends training before the first episode.
#[test]
fn test_stop_flag_interrupts() {
    let cfg = short_config(10, 20);
    let stop = Arc::new(AtomicBool::new(true));
    let mut trainer =
        Trainer::new(SyntheticSimulator::new(cfg.synthetic.clone()), &cfg).with_stop_flag(stop);
    let summary = trainer.run().unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.episodes_completed(), 0);
}

/// Test that a simulator that cannot start an episode is an error.
#[test]
fn test_dead_simulator_fails_training() {
    let cfg = short_config(2, 20);
    let mut sim = SyntheticSimulator::new(cfg.synthetic.clone());
    sim.close();
    let mut trainer = Trainer::new(sim, &cfg);
    match trainer.run() {
        Err(TrainingError::Sim(err)) => assert!(err.is_fatal()),
        other => panic!("expected simulator error, got {:?}", other.map(|s| s.episodes)),
    }
}
