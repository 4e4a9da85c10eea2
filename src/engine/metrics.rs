//! Engine run metrics and statistics.
//!
//! Two levels of visibility, both cheap when unused:
//!
//! - [`RunMetrics`] is always collected: per window pass counts and timings,
//!   useful to spot grammars that need many passes to settle.
//! - [`Statistics`] is collected only with `Options::statistics`: per rule,
//!   contextual test and set counters, the raw material for a grammar
//!   profiler.
//!
//! ## Design notes
//!
//! - Counters are indexed by [`RuleId`], [`ContextId`] and [`SetId`]; the
//!   vectors are sized from the grammar once.
//! - Timings use `Instant` and are summed, not sampled.

use crate::grammar::Grammar;
use crate::{ContextId, RuleId, SetId};
use std::time::Duration;

// --- Metrics -----------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct RunMetrics {
    /// Time spent applying rules, over all windows.
    pub total: Duration,
    /// Windows that were run.
    pub windows: usize,
    /// Rule applications that changed something.
    pub fired: usize,
    /// One entry per run window, in stream order.
    pub per_window: Vec<WindowMetrics>,
}

/// Timing and pass counts for one window.
#[derive(Debug, Default, Clone)]
pub struct WindowMetrics {
    pub number: u32,
    /// Cohorts in the window when it was run, begin cohort excluded.
    pub cohorts: usize,
    /// Passes over rule lists, all sections together.
    pub passes: usize,
    pub fired: usize,
    /// Times the window was restarted after a DELIMIT split it.
    pub restarts: usize,
    pub duration: Duration,
}

impl RunMetrics {
    pub(crate) fn record(&mut self, window: WindowMetrics) {
        self.total += window.duration;
        self.windows += 1;
        self.fired += window.fired;
        self.per_window.push(window);
    }
}

// --- Statistics --------------------------------------------------------------

/// Match/fail counters with accumulated time.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MatchStats {
    pub matched: u64,
    pub failed: u64,
    pub time: Duration,
}

impl MatchStats {
    pub(crate) fn count(&mut self, matched: bool, time: Duration) {
        if matched {
            self.matched += 1;
        } else {
            self.failed += 1;
        }
        self.time += time;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RuleStats {
    /// Cohorts where target and tests matched.
    pub matched: u64,
    /// Cohorts where the target matched but a test failed.
    pub failed: u64,
    /// Applications that changed the window.
    pub fired: u64,
    pub time: Duration,
}

#[derive(Debug, Default, Clone)]
pub struct Statistics {
    pub rules: Vec<RuleStats>,
    pub contexts: Vec<MatchStats>,
    pub sets: Vec<MatchStats>,
}

impl Statistics {
    pub(crate) fn for_grammar(grammar: &Grammar) -> Self {
        Statistics {
            rules: vec![RuleStats::default(); grammar.rules.len()],
            contexts: vec![MatchStats::default(); grammar.contexts.len()],
            sets: vec![MatchStats::default(); grammar.sets.len()],
        }
    }

    pub fn rule(&self, id: RuleId) -> Option<&RuleStats> {
        self.rules.get(id.index())
    }

    pub fn context(&self, id: ContextId) -> Option<&MatchStats> {
        self.contexts.get(id.index())
    }

    pub fn set(&self, id: SetId) -> Option<&MatchStats> {
        self.sets.get(id.index())
    }

    pub(crate) fn rule_mut(&mut self, id: RuleId) -> Option<&mut RuleStats> {
        self.rules.get_mut(id.index())
    }

    /// Rules ordered by accumulated time, slowest first.
    pub fn slowest_rules(&self) -> Vec<(RuleId, RuleStats)> {
        let mut out: Vec<(RuleId, RuleStats)> =
            self.rules.iter().enumerate().map(|(i, s)| (RuleId::from_index(i), *s)).collect();
        out.sort_by(|a, b| b.1.time.cmp(&a.1.time).then(a.0.cmp(&b.0)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_metrics_accumulate() {
        let mut m = RunMetrics::default();
        m.record(WindowMetrics { number: 1, fired: 2, duration: Duration::from_millis(3), ..Default::default() });
        m.record(WindowMetrics { number: 2, fired: 1, duration: Duration::from_millis(4), ..Default::default() });
        assert_eq!(m.windows, 2);
        assert_eq!(m.fired, 3);
        assert_eq!(m.total, Duration::from_millis(7));
    }

    #[test]
    fn slowest_rules_first() {
        let mut s = Statistics { rules: vec![RuleStats::default(); 3], ..Default::default() };
        s.rules[1].time = Duration::from_millis(9);
        s.rules[2].time = Duration::from_millis(4);
        let order: Vec<RuleId> = s.slowest_rules().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![RuleId(1), RuleId(2), RuleId(0)]);
    }
}
