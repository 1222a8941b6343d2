// src/loop_scheduler.rs
//
// Deterministic single-thread scheduler for the runtime cadences:
// decisions, statistics reports and aggregated summaries, all measured in
// simulated seconds.

use crate::types::SimTime;

#[derive(Debug, Clone)]
pub struct LoopScheduler {
    decision_interval: SimTime,
    report_interval: SimTime,
    summary_interval: SimTime,
    next_decision: SimTime,
    next_report: SimTime,
    next_summary: SimTime,
}

impl LoopScheduler {
    /// All cadences first fire one full interval after `base`.
    pub fn new(
        base: SimTime,
        decision_interval: SimTime,
        report_interval: SimTime,
        summary_interval: SimTime,
    ) -> Self {
        let decision = positive(decision_interval);
        let report = positive(report_interval);
        let summary = positive(summary_interval);
        Self {
            decision_interval: decision,
            report_interval: report,
            summary_interval: summary,
            next_decision: base + decision,
            next_report: base + report,
            next_summary: base + summary,
        }
    }

    pub fn next_decision(&self) -> SimTime {
        self.next_decision
    }

    pub fn decision_due(&self, now: SimTime) -> bool {
        now >= self.next_decision
    }

    pub fn report_due(&self, now: SimTime) -> bool {
        now >= self.next_report
    }

    pub fn summary_due(&self, now: SimTime) -> bool {
        now >= self.next_summary
    }

    pub fn mark_decision_ran(&mut self, now: SimTime) {
        self.next_decision = catch_up(self.next_decision, self.decision_interval, now);
    }

    pub fn mark_report_ran(&mut self, now: SimTime) {
        self.next_report = catch_up(self.next_report, self.report_interval, now);
    }

    pub fn mark_summary_ran(&mut self, now: SimTime) {
        self.next_summary = catch_up(self.next_summary, self.summary_interval, now);
    }
}

fn positive(interval: SimTime) -> SimTime {
    if interval.is_finite() && interval > 0.0 {
        interval
    } else {
        1.0
    }
}

/// Next deadline strictly after `now`; missed slots are dropped, not replayed.
fn catch_up(mut next: SimTime, interval: SimTime, now: SimTime) -> SimTime {
    while next <= now {
        next += interval;
    }
    next
}
