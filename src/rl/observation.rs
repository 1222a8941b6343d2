// src/rl/observation.rs
//
// Raw simulator observations and the state encoder.
//
// The simulator hands each intersection a loosely shaped reading: a flat
// vector of per-lane values, a keyed mapping, or a single scalar. The encoder
// flattens whichever shape arrives into a list of numbers, buckets each one,
// and pads/truncates to the fixed state width. Training and runtime share
// this exact function so the learned table and the live lookups agree.

use std::fmt;

use serde_json::Value as JsonValue;

use crate::types::{DiscretizedState, STATE_WIDTH};

/// One value inside a keyed observation.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationValue {
    Number(f64),
    Numbers(Vec<f64>),
    /// Anything non-numeric (labels, flags). Skipped during extraction.
    Other,
}

/// Raw per-intersection observation as supplied by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub enum RawObservation {
    /// Flat per-lane-group readings, used as-is.
    Sequence(Vec<f64>),
    /// Keyed readings in the collaborator's own iteration order.
    Mapping(Vec<(String, ObservationValue)>),
    /// A single reading.
    Scalar(f64),
    /// A single reading that still has to be parsed.
    Text(String),
}

impl RawObservation {
    /// Convert a JSON observation. Object keys keep the order they arrived
    /// in (`serde_json` is built with `preserve_order`).
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Array(items) => {
                let numbers: Option<Vec<f64>> = items.iter().map(JsonValue::as_f64).collect();
                match numbers {
                    Some(v) => RawObservation::Sequence(v),
                    // Mixed arrays are unreadable as a sequence.
                    None => RawObservation::Text(value.to_string()),
                }
            }
            JsonValue::Object(map) => RawObservation::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), ObservationValue::from_json(v)))
                    .collect(),
            ),
            JsonValue::Number(n) => match n.as_f64() {
                Some(v) => RawObservation::Scalar(v),
                None => RawObservation::Text(n.to_string()),
            },
            JsonValue::String(s) => RawObservation::Text(s.clone()),
            other => RawObservation::Text(other.to_string()),
        }
    }
}

impl ObservationValue {
    fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Number(n) => n
                .as_f64()
                .map(ObservationValue::Number)
                .unwrap_or(ObservationValue::Other),
            JsonValue::Array(items) => items
                .iter()
                .map(JsonValue::as_f64)
                .collect::<Option<Vec<f64>>>()
                .map(ObservationValue::Numbers)
                .unwrap_or(ObservationValue::Other),
            _ => ObservationValue::Other,
        }
    }
}

/// Why a raw observation could not be read.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationError {
    /// A scalar reading that does not parse as a number.
    Unparseable { raw: String },
    /// NaN or infinite reading.
    NonFinite { value: f64 },
}

impl fmt::Display for ObservationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationError::Unparseable { raw } => {
                write!(f, "cannot extract queue lengths from {:?}", raw)
            }
            ObservationError::NonFinite { value } => {
                write!(f, "non-finite queue reading {}", value)
            }
        }
    }
}

impl std::error::Error for ObservationError {}

/// Map one queue reading to its congestion bucket.
///
/// 0 → 0, (0, 3] → 1, (3, 6] → 2, (6, 10] → 3, above 10 → 4. Negative
/// readings fall in bucket 1 like any other non-zero value up to 3.
pub fn bucket(queue_length: f64) -> u8 {
    if queue_length == 0.0 {
        0
    } else if queue_length <= 3.0 {
        1
    } else if queue_length <= 6.0 {
        2
    } else if queue_length <= 10.0 {
        3
    } else {
        4
    }
}

/// Flatten a raw observation into its numeric readings.
pub fn extract_readings(obs: &RawObservation) -> Result<Vec<f64>, ObservationError> {
    let readings = match obs {
        RawObservation::Sequence(values) => values.clone(),
        RawObservation::Mapping(entries) => {
            let mut out = Vec::new();
            for (_, value) in entries {
                match value {
                    ObservationValue::Number(v) => out.push(*v),
                    ObservationValue::Numbers(vs) => out.extend_from_slice(vs),
                    ObservationValue::Other => {}
                }
            }
            out
        }
        RawObservation::Scalar(v) => vec![*v],
        RawObservation::Text(raw) => {
            let v = raw
                .trim()
                .parse::<f64>()
                .map_err(|_| ObservationError::Unparseable { raw: raw.clone() })?;
            vec![v]
        }
    };

    if let Some(&bad) = readings.iter().find(|v| !v.is_finite()) {
        return Err(ObservationError::NonFinite { value: bad });
    }
    Ok(readings)
}

/// Discretize readings: bucket the first four, pad missing positions with 0.
pub fn discretize(readings: &[f64]) -> DiscretizedState {
    let mut buckets = [0u8; STATE_WIDTH];
    for (slot, &q) in buckets.iter_mut().zip(readings.iter()) {
        *slot = bucket(q);
    }
    DiscretizedState::new(buckets)
}

/// Stateless encoder shared by training and runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateEncoder;

impl StateEncoder {
    /// Encode an observation; unreadable input degrades to the all-zero state.
    pub fn encode(&self, obs: &RawObservation) -> DiscretizedState {
        self.try_encode(obs).unwrap_or(DiscretizedState::EMPTY)
    }

    /// Encode an observation, surfacing extraction failures to the caller.
    pub fn try_encode(&self, obs: &RawObservation) -> Result<DiscretizedState, ObservationError> {
        extract_readings(obs).map(|r| discretize(&r))
    }

    /// Encode an optional observation (an intersection missing from the
    /// simulator's observation map reads as the empty state).
    pub fn encode_opt(&self, obs: Option<&RawObservation>) -> DiscretizedState {
        obs.map(|o| self.encode(o)).unwrap_or(DiscretizedState::EMPTY)
    }
}
