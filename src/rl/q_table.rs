// src/rl/q_table.rs
//
// Tabular action-value store, one per intersection.
//
// Entries keep first-visit order: iteration, serialization and the runtime
// similarity search all walk states in the order training first met them.
// Overwriting a state keeps its position.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::{Action, ActionValues, DiscretizedState, TlsId};

/// One serialized table entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QEntry {
    pub state: DiscretizedState,
    pub values: ActionValues,
}

/// Mapping from discretized state to action values.
///
/// Entries are created lazily with `(0.0, 0.0)` and never removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<QEntry>", into = "Vec<QEntry>")]
pub struct QTable {
    entries: IndexMap<DiscretizedState, ActionValues>,
}

impl QTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values for `state`, inserting the zero default if absent.
    pub fn get(&mut self, state: DiscretizedState) -> ActionValues {
        *self.entries.entry(state).or_default()
    }

    /// Values for `state` without creating an entry.
    pub fn peek(&self, state: &DiscretizedState) -> Option<&ActionValues> {
        self.entries.get(state)
    }

    pub fn contains(&self, state: &DiscretizedState) -> bool {
        self.entries.contains_key(state)
    }

    /// Greedy action for a known state (ties → KEEP). None if the state was
    /// never visited; the runtime policy supplies the fallback.
    pub fn best_action(&self, state: &DiscretizedState) -> Option<Action> {
        self.entries.get(state).map(ActionValues::argmax)
    }

    /// One-step tabular Q-learning update:
    ///
    /// Q[s][a] += alpha * (reward + gamma * max(Q[s']) - Q[s][a])
    ///
    /// Both `state` and `next_state` get entries if they had none.
    pub fn update(
        &mut self,
        state: DiscretizedState,
        action: Action,
        reward: f64,
        next_state: DiscretizedState,
        alpha: f64,
        gamma: f64,
    ) {
        let next_max = self.get(next_state).max_value();
        let q = self.entries.entry(state).or_default().get_mut(action);
        *q += alpha * (reward + gamma * next_max - *q);
    }

    /// Overwrite the values for a state.
    pub fn insert(&mut self, state: DiscretizedState, values: ActionValues) {
        self.entries.insert(state, values);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in first-visit order.
    pub fn iter(&self) -> impl Iterator<Item = (&DiscretizedState, &ActionValues)> {
        self.entries.iter()
    }
}

impl From<Vec<QEntry>> for QTable {
    fn from(entries: Vec<QEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.state, e.values)).collect(),
        }
    }
}

impl From<QTable> for Vec<QEntry> {
    fn from(table: QTable) -> Self {
        table
            .entries
            .into_iter()
            .map(|(state, values)| QEntry { state, values })
            .collect()
    }
}

/// All intersections' tables, keyed by intersection identifier.
pub type QTableSet = BTreeMap<TlsId, QTable>;

/// Total number of states across a table set.
pub fn total_states(tables: &QTableSet) -> usize {
    tables.values().map(QTable::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(b: [u8; 4]) -> DiscretizedState {
        DiscretizedState::new(b)
    }

    #[test]
    fn get_creates_zero_default_idempotently() {
        let mut t = QTable::new();
        assert!(t.is_empty());
        assert_eq!(t.get(s([1, 0, 0, 0])), ActionValues([0.0, 0.0]));
        assert_eq!(t.get(s([1, 0, 0, 0])), ActionValues([0.0, 0.0]));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn update_applies_one_step_rule() {
        let mut t = QTable::new();
        t.insert(s([0, 1, 0, 0]), ActionValues([2.0, 4.0]));
        t.update(s([1, 1, 1, 1]), Action::Switch, -1.0, s([0, 1, 0, 0]), 0.1, 0.95);
        // 0 + 0.1 * (-1 + 0.95*4 - 0) = 0.28
        let v = t.peek(&s([1, 1, 1, 1])).copied().unwrap();
        assert!((v.get(Action::Switch) - 0.28).abs() < 1e-12);
        assert_eq!(v.get(Action::Keep), 0.0);
    }

    #[test]
    fn update_creates_next_state_entry() {
        let mut t = QTable::new();
        t.update(s([1, 0, 0, 0]), Action::Keep, 1.0, s([2, 0, 0, 0]), 0.5, 0.9);
        assert!(t.contains(&s([2, 0, 0, 0])));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn zero_reward_zero_alpha_leaves_values_unchanged() {
        let mut t = QTable::new();
        t.insert(s([3, 3, 0, 1]), ActionValues([-0.7, 1.25]));
        t.insert(s([0, 0, 0, 1]), ActionValues([5.0, 9.0]));
        let before = t.clone();
        for action in Action::ALL {
            t.update(s([3, 3, 0, 1]), action, 0.0, s([0, 0, 0, 1]), 0.0, 0.95);
        }
        assert_eq!(t, before);
    }

    #[test]
    fn best_action_only_for_known_states() {
        let mut t = QTable::new();
        t.insert(s([1, 2, 3, 4]), ActionValues([0.5, 0.5]));
        assert_eq!(t.best_action(&s([1, 2, 3, 4])), Some(Action::Keep));
        assert_eq!(t.best_action(&s([4, 3, 2, 1])), None);
    }

    #[test]
    fn entries_keep_first_visit_order_through_serde() {
        let mut t = QTable::new();
        t.get(s([3, 0, 0, 0]));
        t.update(s([1, 0, 0, 0]), Action::Keep, 1.0, s([2, 0, 0, 0]), 0.5, 0.9);
        // Overwriting does not move an entry.
        t.insert(s([3, 0, 0, 0]), ActionValues([1.0, 0.0]));

        let order = |t: &QTable| t.iter().map(|(st, _)| *st).collect::<Vec<_>>();
        let expected = vec![s([3, 0, 0, 0]), s([2, 0, 0, 0]), s([1, 0, 0, 0])];
        assert_eq!(order(&t), expected);

        let back: QTable = serde_json::from_str(&serde_json::to_string(&t).unwrap()).unwrap();
        assert_eq!(order(&back), expected);
    }

    #[test]
    fn table_serializes_as_entry_list() {
        let mut t = QTable::new();
        t.insert(s([0, 1, 2, 3]), ActionValues([1.0, -1.0]));
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"[{"state":[0,1,2,3],"values":[1.0,-1.0]}]"#);
        let back: QTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
