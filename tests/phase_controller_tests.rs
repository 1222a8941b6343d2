// tests/phase_controller_tests.rs
//
// PhaseController behaviour against a scripted simulator.
//
// These tests verify:
// 1. No decision (and no policy call) while the signal is yellow.
// 2. No decision before min_green has elapsed in the current phase.
// 3. SWITCH moves to the next non-yellow phase and restarts the phase clock.
// 4. Phase changes made outside the controller restart the phase clock.
// 5. Non-fatal query failures skip the tick; termination propagates.
// 6. Randomized tick sequences never violate the yellow / min-green guards.

use std::cell::Cell;
use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use qsignal::control::{PhaseController, TickOutcome};
use qsignal::rl::RawObservation;
use qsignal::sim::{SimError, SimResult, StepOutcome, TrafficSimulator};
use qsignal::types::{Action, LaneId, PhaseDef, SimTime, TlsId};

const TLS: &str = "J7";

/// Single-intersection simulator whose phase is moved only by `set_phase`
/// (or directly by the test).
struct ScriptedSim {
    program: Vec<PhaseDef>,
    phase: usize,
    fail_phase_query: bool,
    terminated: bool,
    set_calls: Cell<u32>,
}

impl ScriptedSim {
    fn new(program: Vec<PhaseDef>) -> Self {
        Self {
            program,
            phase: 0,
            fail_phase_query: false,
            terminated: false,
            set_calls: Cell::new(0),
        }
    }

    fn check(&self) -> SimResult<()> {
        if self.terminated {
            return Err(SimError::Terminated {
                reason: "connection closed".to_string(),
            });
        }
        Ok(())
    }
}

impl TrafficSimulator for ScriptedSim {
    fn traffic_light_ids(&self) -> SimResult<Vec<TlsId>> {
        Ok(vec![TLS.to_string()])
    }
    fn reset(&mut self) -> SimResult<BTreeMap<TlsId, RawObservation>> {
        Ok(BTreeMap::new())
    }
    fn step(&mut self, _actions: &BTreeMap<TlsId, Action>) -> SimResult<StepOutcome> {
        Ok(StepOutcome::default())
    }
    fn advance(&mut self) -> SimResult<()> {
        Ok(())
    }
    fn time(&self) -> SimResult<SimTime> {
        Ok(0.0)
    }
    fn controlled_lanes(&self, _tls_id: &str) -> SimResult<Vec<LaneId>> {
        Ok(vec!["J7_0".to_string()])
    }
    fn lane_halting(&self, _lane: &str) -> SimResult<u32> {
        Ok(0)
    }
    fn lane_waiting_time(&self, _lane: &str) -> SimResult<f64> {
        Ok(0.0)
    }
    fn lane_mean_speed(&self, _lane: &str) -> SimResult<f64> {
        Ok(0.0)
    }
    fn lane_vehicle_count(&self, _lane: &str) -> SimResult<u32> {
        Ok(0)
    }
    fn phase(&self, _tls_id: &str) -> SimResult<usize> {
        self.check()?;
        if self.fail_phase_query {
            return Err(SimError::query("phase", "timeout"));
        }
        Ok(self.phase)
    }
    fn program_id(&self, _tls_id: &str) -> SimResult<String> {
        Ok("0".to_string())
    }
    fn signal_state(&self, _tls_id: &str) -> SimResult<String> {
        self.check()?;
        Ok(self.program[self.phase].state.clone())
    }
    fn phases(&self, _tls_id: &str) -> SimResult<Vec<PhaseDef>> {
        self.check()?;
        Ok(self.program.clone())
    }
    fn set_phase(&mut self, _tls_id: &str, phase: usize) -> SimResult<()> {
        self.check()?;
        self.set_calls.set(self.set_calls.get() + 1);
        self.phase = phase;
        Ok(())
    }
    fn close(&mut self) {
        self.terminated = true;
    }
}

fn four_phase() -> Vec<PhaseDef> {
    vec![
        PhaseDef::new("GGrr", 30.0),
        PhaseDef::new("yyrr", 3.0),
        PhaseDef::new("rrGG", 30.0),
        PhaseDef::new("rryy", 3.0),
    ]
}

fn controller() -> PhaseController {
    PhaseController::new(TLS, 5.0, 3.0).with_verbosity(0)
}

/// Test that the first tick only starts the phase clock.
#[test]
fn test_first_tick_waits_for_min_green() {
    let mut sim = ScriptedSim::new(four_phase());
    let mut ctl = controller();
    let outcome = ctl.tick(&mut sim, 5.0, || Action::Switch).unwrap();
    assert_eq!(outcome, TickOutcome::MinGreenPending);
    assert_eq!(ctl.state().last_phase, Some(0));
    assert_eq!(ctl.state().phase_entry_time, 5.0);
}

/// Test that a SWITCH after min_green goes to the next green and restarts the clock.
#[test]
fn test_switch_after_min_green_skips_yellow() {
    let mut sim = ScriptedSim::new(four_phase());
    let mut ctl = controller();
    ctl.tick(&mut sim, 5.0, || Action::Switch).unwrap();

    let outcome = ctl.tick(&mut sim, 10.0, || Action::Switch).unwrap();
    assert_eq!(outcome, TickOutcome::Switched { from: 0, to: 2 });
    assert_eq!(sim.phase, 2);
    assert_eq!(ctl.state().phase_entry_time, 10.0);
    assert_eq!(ctl.state().time_in_phase, 0.0);
    assert_eq!(ctl.phase_changes(), 1);

    // The new phase has not served min_green yet.
    let outcome = ctl.tick(&mut sim, 14.0, || Action::Switch).unwrap();
    assert_eq!(outcome, TickOutcome::MinGreenPending);
}

/// Test that KEEP leaves the phase untouched.
#[test]
fn test_keep_does_nothing() {
    let mut sim = ScriptedSim::new(four_phase());
    let mut ctl = controller();
    ctl.tick(&mut sim, 0.0, || Action::Keep).unwrap();
    assert_eq!(ctl.tick(&mut sim, 5.0, || Action::Keep).unwrap(), TickOutcome::Kept);
    assert_eq!(sim.phase, 0);
    assert_eq!(sim.set_calls.get(), 0);
}

/// Test that the policy is not consulted while the signal is yellow.
#[test]
fn test_yellow_suppresses_policy() {
    let mut sim = ScriptedSim::new(four_phase());
    sim.phase = 1;
    let mut ctl = controller();
    let consulted = Cell::new(false);
    for t in [0.0, 5.0, 10.0, 60.0] {
        let outcome = ctl
            .tick(&mut sim, t, || {
                consulted.set(true);
                Action::Switch
            })
            .unwrap();
        assert_eq!(outcome, TickOutcome::SuppressedYellow);
    }
    assert!(!consulted.get());
    assert_eq!(sim.phase, 1);
}

/// Test that an externally changed phase restarts the phase clock.
#[test]
fn test_external_phase_change_restarts_clock() {
    let mut sim = ScriptedSim::new(four_phase());
    let mut ctl = controller();
    ctl.tick(&mut sim, 0.0, || Action::Keep).unwrap();
    assert_eq!(ctl.tick(&mut sim, 20.0, || Action::Keep).unwrap(), TickOutcome::Kept);

    // The program (or an operator) moves the signal on its own.
    sim.phase = 2;
    let outcome = ctl.tick(&mut sim, 25.0, || Action::Switch).unwrap();
    assert_eq!(outcome, TickOutcome::MinGreenPending);
    assert_eq!(ctl.state().last_phase, Some(2));
    assert_eq!(ctl.state().phase_entry_time, 25.0);
}

/// Test that the green search wraps around a program whose other phases
/// are all yellow.
#[test]
fn test_single_green_program_wraps_to_itself() {
    let program = vec![
        PhaseDef::new("GG", 30.0),
        PhaseDef::new("yy", 3.0),
        PhaseDef::new("Yy", 3.0),
    ];
    let mut sim = ScriptedSim::new(program);
    let mut ctl = controller();
    ctl.tick(&mut sim, 0.0, || Action::Switch).unwrap();
    assert_eq!(
        ctl.tick(&mut sim, 5.0, || Action::Switch).unwrap(),
        TickOutcome::Switched { from: 0, to: 0 }
    );
    // Re-entering the same phase restarts the clock too.
    assert_eq!(ctl.state().phase_entry_time, 5.0);
}

/// Test that a mixed yellow state (e.g. "gy") counts as yellow.
#[test]
fn test_partial_yellow_state_is_suppressed() {
    let mut sim = ScriptedSim::new(vec![PhaseDef::new("gy", 30.0), PhaseDef::new("GG", 30.0)]);
    let mut ctl = controller();
    for t in [0.0, 10.0] {
        assert_eq!(
            ctl.tick(&mut sim, t, || Action::Switch).unwrap(),
            TickOutcome::SuppressedYellow
        );
    }
}

/// Test that a failed phase query skips the tick without changing anything.
#[test]
fn test_query_failure_skips_tick() {
    let mut sim = ScriptedSim::new(four_phase());
    sim.fail_phase_query = true;
    let mut ctl = controller();
    for t in [0.0, 5.0, 10.0] {
        assert_eq!(ctl.tick(&mut sim, t, || Action::Switch).unwrap(), TickOutcome::Skipped);
    }
    assert_eq!(ctl.skipped_ticks(), 3);
    assert_eq!(ctl.state().last_phase, None);
    assert_eq!(sim.set_calls.get(), 0);
}

/// Test that simulator termination propagates to the caller.
#[test]
fn test_termination_is_fatal() {
    let mut sim = ScriptedSim::new(four_phase());
    sim.close();
    let mut ctl = controller();
    let err = ctl.tick(&mut sim, 0.0, || Action::Switch).unwrap_err();
    assert!(err.is_fatal());
}

/// Test that random tick sequences, random actions and random external
/// phase changes never switch while yellow or before min_green.
#[test]
fn test_randomized_ticks_respect_guards() {
    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let program = four_phase();
    let mut sim = ScriptedSim::new(program.clone());
    let mut ctl = controller();

    let mut now = 0.0;
    let mut last_change: Option<(usize, SimTime)> = None;
    for _ in 0..5000 {
        now += rng.gen_range(1..=7) as f64;
        if rng.gen::<f64>() < 0.1 {
            sim.phase = rng.gen_range(0..program.len());
        }
        // Phase as seen at the top of this tick, and since when.
        let before = sim.phase;
        last_change = match last_change {
            Some((p, since)) if p == before => Some((p, since)),
            _ => Some((before, now)),
        };

        let action = if rng.gen::<bool>() { Action::Switch } else { Action::Keep };
        let outcome = ctl.tick(&mut sim, now, || action).unwrap();

        if let TickOutcome::Switched { from, to } = outcome {
            let (_, since) = last_change.unwrap();
            assert_eq!(from, before);
            assert!(!program[from].is_yellow(), "switched out of yellow at t={now}");
            assert!(now - since >= 5.0, "switched before min_green at t={now}");
            assert!(!program[to].is_yellow());
            last_change = Some((to, now));
        } else {
            assert_eq!(sim.phase, before);
        }
    }
    assert!(ctl.phase_changes() > 0);
}
