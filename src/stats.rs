// src/stats.rs
//
// Statistics messaging between intersection agents and the coordinator.
//
// Wire payload (one message per report):
//
//   "<tls_id>|queue:<int>|waiting:<float, 2 dp>"
//
// Agents send fire-and-forget over an unbounded channel; the coordinator
// drains the inbox without blocking, keeps a bounded per-intersection
// history and periodically renders an aggregated report. Malformed payloads
// are logged and dropped.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::types::{SimTime, TlsId};

/// Readings kept per intersection.
pub const HISTORY_CAPACITY: usize = 100;

/// Readings averaged in each report.
pub const REPORT_WINDOW: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub tls_id: TlsId,
    /// Halting vehicles over the intersection's unique controlled lanes.
    pub queue: f64,
    /// Accumulated waiting time over the same lanes (seconds).
    pub waiting: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatsParseError {
    /// Missing or blank intersection identifier.
    MissingId,
    /// A field that is not `key:value`.
    MalformedField { field: String },
    /// A value that does not parse as a number.
    InvalidNumber { key: String, value: String },
    /// A required key was absent.
    MissingKey { key: &'static str },
}

impl fmt::Display for StatsParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsParseError::MissingId => write!(f, "missing intersection id"),
            StatsParseError::MalformedField { field } => {
                write!(f, "malformed field '{}' (expected key:value)", field)
            }
            StatsParseError::InvalidNumber { key, value } => {
                write!(f, "invalid number for '{}': '{}'", key, value)
            }
            StatsParseError::MissingKey { key } => write!(f, "missing key '{}'", key),
        }
    }
}

impl std::error::Error for StatsParseError {}

impl StatsReport {
    pub fn new(tls_id: impl Into<TlsId>, queue: u32, waiting: f64) -> Self {
        Self {
            tls_id: tls_id.into(),
            queue: queue as f64,
            waiting,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}|queue:{:.0}|waiting:{:.2}",
            self.tls_id, self.queue, self.waiting
        )
    }

    /// Parse a wire payload. Unknown keys are accepted and ignored.
    pub fn parse(payload: &str) -> Result<Self, StatsParseError> {
        let mut parts = payload.split('|');
        let tls_id = match parts.next() {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => return Err(StatsParseError::MissingId),
        };

        let mut queue = None;
        let mut waiting = None;
        for field in parts {
            let mut kv = field.split(':');
            let (key, value) = match (kv.next(), kv.next(), kv.next()) {
                (Some(k), Some(v), None) => (k.trim(), v.trim()),
                _ => {
                    return Err(StatsParseError::MalformedField {
                        field: field.to_string(),
                    })
                }
            };
            let number: f64 = value.parse().map_err(|_| StatsParseError::InvalidNumber {
                key: key.to_string(),
                value: value.to_string(),
            })?;
            match key {
                "queue" => queue = Some(number),
                "waiting" => waiting = Some(number),
                _ => {}
            }
        }

        Ok(Self {
            tls_id,
            queue: queue.ok_or(StatsParseError::MissingKey { key: "queue" })?,
            waiting: waiting.ok_or(StatsParseError::MissingKey { key: "waiting" })?,
        })
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Sending half held by every agent.
#[derive(Debug, Clone)]
pub struct StatsSender {
    tx: mpsc::UnboundedSender<String>,
}

impl StatsSender {
    /// Fire-and-forget. Returns false if the coordinator is gone.
    pub fn send(&self, report: &StatsReport) -> bool {
        self.send_raw(report.encode())
    }

    pub fn send_raw(&self, payload: String) -> bool {
        self.tx.send(payload).is_ok()
    }
}

/// Receiving half held by the coordinator.
#[derive(Debug)]
pub struct StatsInbox {
    rx: mpsc::UnboundedReceiver<String>,
}

impl StatsInbox {
    /// Everything queued right now; never blocks.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(payload) => out.push(payload),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }
}

pub fn stats_channel() -> (StatsSender, StatsInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StatsSender { tx }, StatsInbox { rx })
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IntersectionStatsHistory {
    queue: VecDeque<f64>,
    waiting: VecDeque<f64>,
    last_update: SimTime,
}

impl IntersectionStatsHistory {
    pub fn push(&mut self, queue: f64, waiting: f64, now: SimTime) {
        self.queue.push_back(queue);
        self.waiting.push_back(waiting);
        while self.queue.len() > HISTORY_CAPACITY {
            self.queue.pop_front();
            self.waiting.pop_front();
        }
        self.last_update = now;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn last_update(&self) -> SimTime {
        self.last_update
    }

    pub fn current_queue(&self) -> Option<f64> {
        self.queue.back().copied()
    }

    /// Mean of the last `REPORT_WINDOW` queue readings.
    pub fn recent_queue(&self) -> Option<f64> {
        recent_mean(&self.queue)
    }

    /// Mean of the last `REPORT_WINDOW` waiting readings.
    pub fn recent_waiting(&self) -> Option<f64> {
        recent_mean(&self.waiting)
    }
}

fn recent_mean(values: &VecDeque<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len().min(REPORT_WINDOW);
    let sum: f64 = values.iter().rev().take(n).sum();
    Some(sum / n as f64)
}

/// Coordinator-side statistics store.
#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    histories: BTreeMap<TlsId, IntersectionStatsHistory>,
    malformed: u64,
    started_at: SimTime,
}

impl StatsAggregator {
    pub fn new(started_at: SimTime) -> Self {
        Self {
            started_at,
            ..Self::default()
        }
    }

    /// Record one payload received at simulated time `now`.
    pub fn ingest(&mut self, payload: &str, now: SimTime) -> Result<(), StatsParseError> {
        match StatsReport::parse(payload) {
            Ok(report) => {
                self.histories
                    .entry(report.tls_id)
                    .or_default()
                    .push(report.queue, report.waiting, now);
                Ok(())
            }
            Err(err) => {
                self.malformed += 1;
                eprintln!("[coordinator] WARN: dropping stats message {payload:?}: {err}");
                Err(err)
            }
        }
    }

    /// Ingest everything waiting in the inbox. Returns the number accepted.
    pub fn drain(&mut self, inbox: &mut StatsInbox, now: SimTime) -> usize {
        inbox
            .drain()
            .iter()
            .filter(|payload| self.ingest(payload, now).is_ok())
            .count()
    }

    pub fn history(&self, tls_id: &str) -> Option<&IntersectionStatsHistory> {
        self.histories.get(tls_id)
    }

    pub fn intersections(&self) -> usize {
        self.histories.len()
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Sum over intersections of the recent queue and waiting averages.
    pub fn global_totals(&self) -> (f64, f64) {
        self.histories.values().fold((0.0, 0.0), |(q, w), h| {
            (
                q + h.recent_queue().unwrap_or(0.0),
                w + h.recent_waiting().unwrap_or(0.0),
            )
        })
    }

    /// Multi-line human-readable report; None before the first reading.
    pub fn render_report(&self, now: SimTime) -> Option<String> {
        if self.histories.values().all(IntersectionStatsHistory::is_empty) {
            return None;
        }
        let rule = "=".repeat(60);
        let mut out = String::new();
        out.push_str(&format!("{rule}\n"));
        out.push_str(&format!("TRAFFIC STATISTICS REPORT - sim time {now:.0}s\n"));
        out.push_str(&format!("Runtime: {:.0}s\n", now - self.started_at));
        out.push_str(&format!("{rule}\n"));

        for (tls_id, h) in &self.histories {
            let (Some(avg_queue), Some(avg_waiting), Some(current)) =
                (h.recent_queue(), h.recent_waiting(), h.current_queue())
            else {
                continue;
            };
            out.push_str(&format!("\nIntersection {tls_id}:\n"));
            out.push_str(&format!("  Average Queue Length: {avg_queue:.2} vehicles\n"));
            out.push_str(&format!("  Average Waiting Time: {avg_waiting:.2} seconds\n"));
            out.push_str(&format!("  Current Queue: {current:.0} vehicles\n"));
            out.push_str(&format!("  Last Update: {:.0}s\n", h.last_update()));
        }

        let (total_queue, total_waiting) = self.global_totals();
        out.push_str(&format!("\n{}\n", "-".repeat(60)));
        out.push_str("GLOBAL STATISTICS:\n");
        out.push_str(&format!("  Total Average Queue: {total_queue:.2} vehicles\n"));
        out.push_str(&format!("  Total Average Waiting: {total_waiting:.2} seconds\n"));
        out.push_str(&format!("  Active Intersections: {}\n", self.histories.len()));
        out.push_str(&rule);
        Some(out)
    }
}
