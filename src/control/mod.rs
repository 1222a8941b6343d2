// src/control/mod.rs
//
// Runtime decision engine: per-intersection agents over a frozen policy.

pub mod agent;
pub mod phase;
pub mod session;

pub use agent::{AgentTick, IntersectionAgent};
pub use phase::{next_green_phase, PhaseController, PhaseRuntimeState, TickOutcome};
pub use session::{ControlSession, SessionMode, SessionSummary, MAX_CONSECUTIVE_SIM_ERRORS};
