//! The rule loop.
//!
//! ```text
//! run_window(w)
//!   └─ run_sections                       restart while DELIMIT splits w
//!        ├─ BEFORE-SECTIONS   ─┐
//!        ├─ section 0..=i      ├─ run_until_clean: passes until nothing fired
//!        └─ AFTER-SECTIONS    ─┘    └─ run_rule_list: JUMP, ITERATE
//!                                          └─ run_rule: every cohort of w
//!                                               └─ run_on_cohort: target,
//!                                                  tests, dependency target,
//!                                                  then apply / EXECUTE / WITH
//! ```
//!
//! ## Design notes
//!
//! - Valid rules are recomputed before every pass; a rule whose target cannot
//!   match anything in the window is skipped without visiting cohorts.
//! - Tests run once per candidate reading when the outcome can differ between
//!   readings: the target set binds something, or a test looks at the target
//!   cohort itself (offset 0). Otherwise they run once per cohort.
//! - Targets are taken from a snapshot of the window at rule start; cohorts a
//!   rule adds are visited on the next pass.

use crate::grammar::{Rule, RuleFlags, RuleKind, Scan, Section, SetType, Traversal};
use crate::{CohortId, ContextId, RuleId};

use super::actions::{Hit, RunOutcome};
use super::context::{EngineContext, MatchState, Matcher};
use super::metrics::WindowMetrics;
use super::trigger;
use std::time::Instant;

/// JUMPs taken in one rule list before it is abandoned.
const MAX_JUMPS: usize = 10_000;
/// Nesting of EXECUTE and WITH.
const MAX_DEPTH: usize = 16;
/// Immediate re-runs of an ITERATE or REPEAT rule.
const MAX_REPEAT: usize = 100;

/// What one rule did on one cohort.
#[derive(Debug, Default)]
struct Step {
    outcome: RunOutcome,
    /// Rule index to continue at, from a JUMP.
    jump: Option<usize>,
}

impl EngineContext<'_> {
    /// Run the grammar over a buffered window.
    pub(crate) fn run_window(&mut self, window: u32) -> WindowMetrics {
        let started = Instant::now();
        let mut metrics = WindowMetrics { number: window, ..WindowMetrics::default() };
        self.replay_variables(window);
        self.remembered_mark = None;
        while self.run_sections(window, &mut metrics).contains(RunOutcome::DELIMITED) {
            metrics.restarts += 1;
        }
        metrics.cohorts = self.buffer.window(window).map_or(0, |w| w.len().saturating_sub(1));
        metrics.duration = started.elapsed();
        tracing::debug!(
            window,
            cohorts = metrics.cohorts,
            passes = metrics.passes,
            fired = metrics.fired,
            restarts = metrics.restarts,
            "window done"
        );
        metrics
    }

    /// Variables set or removed by stream commands and rules of this window.
    fn replay_variables(&mut self, window: u32) {
        let Some(w) = self.buffer.window(window) else { return };
        for (key, value) in &w.variables_set {
            self.variables.insert(*key, *value);
        }
        for key in &w.variables_rem {
            self.variables.remove(key);
        }
    }

    fn run_sections(&mut self, window: u32, metrics: &mut WindowMetrics) -> RunOutcome {
        let grammar = self.grammar;
        let mut outcome = self.run_until_clean(&grammar.index.before, window, metrics);
        if outcome.contains(RunOutcome::DELIMITED) {
            return outcome;
        }
        for (n, section) in grammar.sections().enumerate() {
            if self.options.sections.is_some_and(|limit| n >= limit) {
                break;
            }
            let rules = grammar.index.cumulative_section(section);
            outcome |= self.run_until_clean(&rules, window, metrics);
            if outcome.contains(RunOutcome::DELIMITED) {
                return outcome;
            }
        }
        outcome | self.run_until_clean(&grammar.index.after, window, metrics)
    }

    /// Repeat a rule list until a pass changes nothing, or a run limit is hit.
    fn run_until_clean(&mut self, rules: &[RuleId], window: u32, metrics: &mut WindowMetrics) -> RunOutcome {
        let mut outcome = RunOutcome::empty();
        if rules.is_empty() {
            return outcome;
        }
        let mut passes = 0;
        loop {
            passes += 1;
            metrics.passes += 1;
            trigger::index_window(self.grammar, &mut self.buffer, window);
            let pass = self.run_rule_list(rules, window, 0, metrics);
            outcome |= pass;
            let limited = self.options.single_run || self.options.max_runs.is_some_and(|max| passes >= max);
            if pass.contains(RunOutcome::DELIMITED) || !pass.contains(RunOutcome::FIRED) || limited {
                return outcome;
            }
        }
    }

    /// One pass over `rules` in order.
    pub(crate) fn run_rule_list(
        &mut self,
        rules: &[RuleId],
        window: u32,
        depth: usize,
        metrics: &mut WindowMetrics,
    ) -> RunOutcome {
        let grammar = self.grammar;
        let mut outcome = RunOutcome::empty();
        let mut jumps = 0;
        let mut i = 0;
        while i < rules.len() {
            let rule = grammar.rule(rules[i]);
            i += 1;
            if !self.rule_enabled(rule, window) {
                continue;
            }
            let repeat = rule.flags.intersects(RuleFlags::ITERATE | RuleFlags::REPEAT);
            let mut step = self.run_rule(rule, window, depth, metrics);
            let mut again = 0;
            while repeat && fired_only(step.outcome) && again < MAX_REPEAT {
                again += 1;
                step = self.run_rule(rule, window, depth, metrics);
                outcome |= RunOutcome::FIRED;
            }
            outcome |= step.outcome;
            if outcome.contains(RunOutcome::DELIMITED) {
                return outcome;
            }
            if let Some(anchor) = step.jump {
                jumps += 1;
                if jumps > MAX_JUMPS {
                    tracing::warn!(rule = rule.display_name(), line = rule.line, "too many jumps, ending pass");
                    return outcome;
                }
                i = rules.iter().position(|r| r.index() >= anchor).unwrap_or(rules.len());
            }
        }
        outcome
    }

    fn rule_enabled(&self, rule: &Rule, window: u32) -> bool {
        if rule.section == Section::Null {
            return false;
        }
        if self.options.no_mappings && rule.kind.is_mapping() {
            return false;
        }
        if self.options.no_corrections && rule.kind.is_correction() {
            return false;
        }
        self.buffer.window(window).is_some_and(|w| w.valid_rules.contains(rule.id.0))
    }

    /// Try a rule on every cohort of the window.
    fn run_rule(&mut self, rule: &Rule, window: u32, depth: usize, metrics: &mut WindowMetrics) -> Step {
        let Some(w) = self.buffer.window(window) else { return Step::default() };
        let mut targets: Vec<CohortId> = w.cohorts.iter().skip(1).copied().collect();
        if rule.flags.contains(RuleFlags::REVERSE) {
            targets.reverse();
        }
        let mut step = Step::default();
        for cohort in targets {
            let one = self.run_on_cohort(rule, cohort, window, None, depth, metrics);
            step.outcome |= one.outcome;
            if one.jump.is_some() || one.outcome.contains(RunOutcome::DELIMITED) {
                step.jump = one.jump;
                break;
            }
        }
        step
    }

    /// Match and apply a rule on one cohort. `mark` seeds the mark (inner
    /// rules of WITH).
    fn run_on_cohort(
        &mut self,
        rule: &Rule,
        cohort: CohortId,
        window: u32,
        mark: Option<CohortId>,
        depth: usize,
        metrics: &mut WindowMetrics,
    ) -> Step {
        let started = self.options.statistics.then(Instant::now);
        let step = self.run_on_cohort_inner(rule, cohort, window, mark, depth, metrics);
        if let (Some(started), Some(stats)) = (started, self.stats.rule_mut(rule.id)) {
            stats.time += started.elapsed();
        }
        step
    }

    fn run_on_cohort_inner(
        &mut self,
        rule: &Rule,
        cohort: CohortId,
        window: u32,
        mark: Option<CohortId>,
        depth: usize,
        metrics: &mut WindowMetrics,
    ) -> Step {
        let grammar = self.grammar;
        if !self.is_target(rule, cohort, window) {
            return Step::default();
        }
        if rule.flags.contains(RuleFlags::RESETX) {
            self.remembered_mark = None;
        }
        let remembered = if rule.flags.contains(RuleFlags::REMEMBERX) { self.remembered_mark } else { None };
        let mut state = MatchState::for_target(cohort, remembered);
        if mark.is_some() {
            state.mark = mark;
        }
        state.look_deleted = rule.flags.contains(RuleFlags::LOOKDELETED);
        state.look_delayed = rule.flags.contains(RuleFlags::LOOKDELAYED);

        let candidates = self.candidate_readings(rule, cohort, &mut state);
        if candidates.is_empty() {
            return Step::default();
        }
        let (selected, last, bound) = self.run_tests(rule, cohort, &candidates, state);
        let Some(mut state) = bound else {
            self.count_rule(rule.id, false);
            if rule.kind == RuleKind::Iff && self.remove(rule, cohort, &candidates) {
                return self.fired(rule, cohort, RunOutcome::FIRED, metrics);
            }
            return Step::default();
        };

        let other = match rule.dep_target {
            Some(dep) => match self.dependency_target(rule, dep, cohort, &mut state) {
                Some(found) => Some(found),
                None => {
                    self.count_rule(rule.id, false);
                    return Step::default();
                }
            },
            None => None,
        };
        self.count_rule(rule.id, true);
        if rule.flags.contains(RuleFlags::REMEMBERX) {
            self.remembered_mark = state.mark;
        }

        match rule.kind {
            RuleKind::Jump => {
                let anchor = rule.jump_to.as_deref().and_then(|a| grammar.anchor(a));
                tracing::debug!(rule = rule.display_name(), line = rule.line, anchor = ?anchor, "jump");
                Step { outcome: RunOutcome::empty(), jump: anchor }
            }
            RuleKind::Execute => {
                let (Some(from), Some(to)) = (
                    rule.jump_to.as_deref().and_then(|a| grammar.anchor(a)),
                    rule.jump_end.as_deref().and_then(|a| grammar.anchor(a)),
                ) else {
                    return Step::default();
                };
                if depth >= MAX_DEPTH {
                    tracing::warn!(rule = rule.display_name(), line = rule.line, "EXECUTE nested too deep");
                    return Step::default();
                }
                let range: Vec<RuleId> = grammar
                    .rules
                    .get(from..to.min(grammar.rules.len()))
                    .unwrap_or_default()
                    .iter()
                    .filter(|r| r.parent.is_none())
                    .map(|r| r.id)
                    .collect();
                let outcome = self.run_rule_list(&range, window, depth + 1, metrics);
                Step { outcome, jump: None }
            }
            RuleKind::With => {
                if depth >= MAX_DEPTH {
                    tracing::warn!(rule = rule.display_name(), line = rule.line, "WITH nested too deep");
                    return Step::default();
                }
                let mut outcome = RunOutcome::empty();
                for sub in &rule.sub_rules {
                    let sub = grammar.rule(*sub);
                    if !self.rule_enabled(sub, window) {
                        continue;
                    }
                    let step = self.run_on_cohort(sub, cohort, window, Some(last), depth + 1, metrics);
                    outcome |= step.outcome;
                    if outcome.contains(RunOutcome::DELIMITED) {
                        break;
                    }
                }
                Step { outcome, jump: None }
            }
            _ => {
                let ops = self.operands(rule, &mut state);
                let hit = Hit { cohort, readings: selected, other };
                let outcome = self.apply(rule, &hit, &ops);
                if outcome.is_empty() {
                    return Step::default();
                }
                self.fired(rule, cohort, outcome, metrics)
            }
        }
    }

    fn fired(&mut self, rule: &Rule, cohort: CohortId, outcome: RunOutcome, metrics: &mut WindowMetrics) -> Step {
        metrics.fired += 1;
        if self.options.statistics {
            if let Some(stats) = self.stats.rule_mut(rule.id) {
                stats.fired += 1;
            }
        }
        let global = self.buffer.get(cohort).map(|c| c.global_number);
        tracing::debug!(rule = rule.display_name(), line = rule.line, cohort = ?global, "rule fired");
        Step { outcome, jump: None }
    }

    fn count_rule(&mut self, rule: RuleId, matched: bool) {
        if !self.options.statistics {
            return;
        }
        if let Some(stats) = self.stats.rule_mut(rule) {
            if matched {
                stats.matched += 1;
            } else {
                stats.failed += 1;
            }
        }
    }

    /// Cheap per-cohort filters before any set is matched.
    fn is_target(&self, rule: &Rule, id: CohortId, window: u32) -> bool {
        let Some(cohort) = self.buffer.get(id) else { return false };
        if cohort.window != window || cohort.is_removed() || cohort.is_begin() || cohort.readings.is_empty() {
            return false;
        }
        if rule.wordform.is_some_and(|wf| wf != cohort.wordform) {
            return false;
        }
        let enclosed = cohort.encl_depth > 0;
        if (rule.flags.contains(RuleFlags::ENCL_INNER) && !enclosed)
            || (rule.flags.contains(RuleFlags::ENCL_OUTER) && enclosed)
        {
            return false;
        }
        let last = self.buffer.window(window).and_then(|w| w.last()) == Some(id);
        if rule.kind == RuleKind::Delimit && last {
            return false;
        }
        let single = cohort.readings.len() == 1;
        let mapping_target = self.grammar.set(rule.target).kind.contains(SetType::MAPPING);
        !(single && rule.kind.is_disambiguation() && !mapping_target)
    }

    /// Live readings the rule may act on: the target matches and the reading
    /// is not excluded by protection, one-shot history or prior mapping.
    fn candidate_readings(&mut self, rule: &Rule, id: CohortId, state: &mut MatchState) -> Vec<usize> {
        let allow_magic = self.options.allow_magic_readings;
        let guarded = rule.kind.is_disambiguation() || rule.kind.is_mapping() || rule.kind.is_correction();
        let mut m = self.matcher(state);
        let buffer = m.buffer;
        let Some(cohort) = buffer.get(id) else { return Vec::new() };
        let mut out = Vec::new();
        for (i, reading) in cohort.readings.iter().enumerate() {
            if reading.noprint && !allow_magic {
                continue;
            }
            if guarded && reading.immutable {
                continue;
            }
            if rule.kind.is_one_shot() && reading.was_hit_by(rule.id) {
                continue;
            }
            if rule.kind.is_mapping() && reading.mapped {
                continue;
            }
            // Each reading binds its own unifiers.
            m.state.clear_bindings();
            if m.reading_level_matches(cohort, reading, rule.target, rule.sub_reading) {
                out.push(i);
            }
        }
        out
    }

    /// Run the rule's tests. Returns the readings that passed, the cohort the
    /// last test ended on, and the bindings of the first passing reading.
    fn run_tests(
        &mut self,
        rule: &Rule,
        id: CohortId,
        candidates: &[usize],
        mut state: MatchState,
    ) -> (Vec<usize>, CohortId, Option<MatchState>) {
        let grammar = self.grammar;
        let per_reading = grammar.set(rule.target).is_context_dependent()
            || rule.tests.iter().any(|t| looks_at_target(grammar.context(*t)));
        let mut selected = Vec::new();
        let mut last = id;
        let mut bound = None;
        if !per_reading {
            let mut m = self.matcher(&mut state);
            let buffer = m.buffer;
            let first = buffer.get(id).and_then(|c| c.readings.get(candidates[0]));
            m.state.target_baseform = first.map_or(0, |r| r.baseform);
            if let Some(found) = m.all_tests(&rule.tests, id) {
                return (candidates.to_vec(), found, Some(state));
            }
            return (selected, last, None);
        }
        for &i in candidates {
            state.clear_bindings();
            let mut m = self.matcher(&mut state);
            let buffer = m.buffer;
            let Some(cohort) = buffer.get(id) else { break };
            let Some(reading) = cohort.readings.get(i) else { continue };
            if !m.reading_level_matches(cohort, reading, rule.target, rule.sub_reading) {
                continue;
            }
            m.state.target_reading = Some(i);
            m.state.target_baseform = reading.baseform;
            if let Some(found) = m.all_tests(&rule.tests, id) {
                selected.push(i);
                last = found;
                if bound.is_none() {
                    bound = Some(state.clone());
                }
            }
        }
        if let Some(b) = bound.as_mut() {
            b.target_reading = None;
        }
        (selected, last, bound)
    }

    /// Cohort a dependency, relation or structural rule links to: the
    /// dependency target (or its `A` attachment) that also passes the
    /// dependency tests.
    fn dependency_target(
        &mut self,
        rule: &Rule,
        dep: ContextId,
        id: CohortId,
        state: &mut MatchState,
    ) -> Option<CohortId> {
        let mut m = self.matcher(state);
        m.state.attach_to = None;
        let found = m.run_test(dep, id);
        let attach = m.state.attach_to.or(found)?;
        m.all_tests(&rule.dep_tests, attach)?;
        Some(attach)
    }
}

impl Matcher<'_, '_> {
    /// Every test passes from `anchor`; returns where the last one ended.
    fn all_tests(&mut self, tests: &[ContextId], anchor: CohortId) -> Option<CohortId> {
        let mut last = anchor;
        for test in tests {
            last = self.run_test(*test, anchor)?;
        }
        Some(last)
    }
}

/// Fired without splitting the window.
fn fired_only(outcome: RunOutcome) -> bool {
    outcome.contains(RunOutcome::FIRED) && !outcome.contains(RunOutcome::DELIMITED)
}

/// A direct test of the target cohort itself.
fn looks_at_target(test: &crate::grammar::ContextualTest) -> bool {
    let p = &test.position;
    test.offset == 0
        && test.tmpl.is_none()
        && test.ors.is_empty()
        && matches!(p.traversal, Traversal::Window)
        && matches!(p.scan, Scan::Exact)
        && !p.jump_mark
}
