// src/control/phase.rs
//
// Per-intersection phase state machine for runtime control.
//
// One decision tick:
//   1. read the simulator phase; a change since the last tick (external, or
//      the simulator's own program) restarts the phase clock
//   2. yellow signal            → no action
//   3. time_in_phase < min_green → no action
//   4. consult the policy; SWITCH moves to the next non-yellow phase of the
//      program (at most `num_phases` candidates), KEEP does nothing
//
// Non-fatal simulator errors skip the tick; `SimError::Terminated`
// propagates to the session.

use serde::{Deserialize, Serialize};

use crate::logging::{LogThrottle, Verbosity, VERBOSITY_SUMMARY};
use crate::sim::{SimError, TrafficSimulator};
use crate::types::{is_yellow_state, Action, PhaseDef, SimTime, TlsId};

/// What a decision tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickOutcome {
    /// Signal is yellow; the policy was not consulted.
    SuppressedYellow,
    /// Current phase has not served its minimum green yet.
    MinGreenPending,
    /// Policy chose KEEP.
    Kept,
    /// Policy chose SWITCH and the phase was changed.
    Switched { from: usize, to: usize },
    /// Policy chose SWITCH but the program has no non-yellow phase to go to.
    NoEligiblePhase,
    /// A simulator query or command failed; nothing was changed.
    Skipped,
}

impl TickOutcome {
    pub fn switched(&self) -> bool {
        matches!(self, TickOutcome::Switched { .. })
    }
}

/// Mutable per-intersection phase bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRuntimeState {
    /// Phase observed at the previous tick; None before the first tick.
    pub last_phase: Option<usize>,
    /// Simulated time at which `last_phase` was first observed or set.
    pub phase_entry_time: SimTime,
    /// Seconds spent in the current phase as of the last tick.
    pub time_in_phase: SimTime,
}

impl PhaseRuntimeState {
    /// Record the phase seen at `now`, restarting the clock on a change.
    pub fn observe(&mut self, phase: usize, now: SimTime) {
        if self.last_phase != Some(phase) {
            self.last_phase = Some(phase);
            self.phase_entry_time = now;
            self.time_in_phase = 0.0;
        } else {
            self.time_in_phase = now - self.phase_entry_time;
        }
    }

    /// Record a phase this controller set at `now`.
    pub fn entered(&mut self, phase: usize, now: SimTime) {
        self.last_phase = Some(phase);
        self.phase_entry_time = now;
        self.time_in_phase = 0.0;
    }
}

/// Next non-yellow phase after `current`, trying at most `phases.len()`
/// candidates. None if every candidate is yellow or the program is empty.
pub fn next_green_phase(phases: &[PhaseDef], current: usize) -> Option<usize> {
    let n = phases.len();
    if n == 0 {
        return None;
    }
    let mut next = (current + 1) % n;
    let mut attempts = 0;
    while phases[next].is_yellow() && attempts < n {
        next = (next + 1) % n;
        attempts += 1;
    }
    (attempts < n).then_some(next)
}

pub struct PhaseController {
    tls_id: TlsId,
    min_green: SimTime,
    yellow_time: SimTime,
    state: PhaseRuntimeState,
    phase_changes: u64,
    skipped_ticks: u64,
    failure_log: LogThrottle,
    verbosity: Verbosity,
}

impl PhaseController {
    pub fn new(tls_id: impl Into<TlsId>, min_green: SimTime, yellow_time: SimTime) -> Self {
        Self {
            tls_id: tls_id.into(),
            min_green,
            yellow_time,
            state: PhaseRuntimeState::default(),
            phase_changes: 0,
            skipped_ticks: 0,
            failure_log: LogThrottle::new(10),
            verbosity: VERBOSITY_SUMMARY,
        }
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn tls_id(&self) -> &str {
        &self.tls_id
    }

    pub fn state(&self) -> &PhaseRuntimeState {
        &self.state
    }

    pub fn min_green(&self) -> SimTime {
        self.min_green
    }

    /// Configured yellow duration (enforced by the signal program itself).
    pub fn yellow_time(&self) -> SimTime {
        self.yellow_time
    }

    pub fn phase_changes(&self) -> u64 {
        self.phase_changes
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks
    }

    /// Run one decision tick at simulated time `now`.
    ///
    /// `decide` is only called once the yellow and min-green guards pass.
    pub fn tick<S, F>(&mut self, sim: &mut S, now: SimTime, decide: F) -> Result<TickOutcome, SimError>
    where
        S: TrafficSimulator + ?Sized,
        F: FnOnce() -> Action,
    {
        let phase = match sim.phase(&self.tls_id) {
            Ok(p) => p,
            Err(err) => return self.skip("phase", err),
        };
        self.state.observe(phase, now);

        let signal = match sim.signal_state(&self.tls_id) {
            Ok(s) => s,
            Err(err) => return self.skip("signal state", err),
        };
        if is_yellow_state(&signal) {
            return Ok(TickOutcome::SuppressedYellow);
        }

        if self.state.time_in_phase < self.min_green {
            return Ok(TickOutcome::MinGreenPending);
        }

        if decide() == Action::Keep {
            return Ok(TickOutcome::Kept);
        }

        let phases = match sim.phases(&self.tls_id) {
            Ok(p) => p,
            Err(err) => return self.skip("phase program", err),
        };
        let Some(next) = next_green_phase(&phases, phase) else {
            return Ok(TickOutcome::NoEligiblePhase);
        };

        if let Err(err) = sim.set_phase(&self.tls_id, next) {
            return self.skip("set phase", err);
        }
        self.state.entered(next, now);
        self.phase_changes += 1;
        Ok(TickOutcome::Switched {
            from: phase,
            to: next,
        })
    }

    fn skip(&mut self, what: &str, err: SimError) -> Result<TickOutcome, SimError> {
        if err.is_fatal() {
            return Err(err);
        }
        self.skipped_ticks += 1;
        if self.failure_log.hit() && self.verbosity >= VERBOSITY_SUMMARY {
            eprintln!(
                "[control] {}: WARN: {} failed, skipping tick ({} failures): {}",
                self.tls_id,
                what,
                self.failure_log.count(),
                err
            );
        }
        Ok(TickOutcome::Skipped)
    }
}
