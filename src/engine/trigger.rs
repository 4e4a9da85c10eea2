//! Trigger scanning (window pre-classification).
//!
//! Before a rule pass the engine asks two cheap questions, both answered from
//! the tags present in the window and the grammar's trigger indices
//! (`grammar/index.rs`):
//!
//! - **Possible sets** (`Cohort::possible_sets`): which used sets could match
//!   some reading of this cohort. The set matcher rejects anything outside
//!   this bitset without walking a trie.
//! - **Valid rules** (`SingleWindow::valid_rules`): which rules have a target
//!   set that could match anywhere in the window. The rule loop skips the rest.
//!
//! ## Design notes
//!
//! - This is a *heuristic* scan. False positives are acceptable because the
//!   matcher still evaluates every set in full; false negatives are not.
//! - Deleted and delayed readings count towards possible sets, so tests that
//!   look into them are not pruned.
//! - Both views go stale when readings change; actions refresh the cohort they
//!   touched and the rule loop recomputes valid rules before every pass.

use crate::grammar::{Grammar, IntervalVec, SetBits};
use crate::window::{Cohort, WindowBuffer};

/// Recompute the possible sets of one cohort.
pub(crate) fn index_cohort(grammar: &Grammar, cohort: &mut Cohort) {
    let mut sets: SetBits = grammar.index.sets_any.clone();
    for reading in cohort.all_readings(true, true).flat_map(|r| r.chain()) {
        for tag in &reading.tags {
            if let Some(bits) = grammar.sets_by_tag(*tag) {
                sets.union_with(bits);
            }
        }
    }
    cohort.possible_sets = sets;
}

/// Rules whose target could match a live reading of the window.
pub(crate) fn valid_rules(grammar: &Grammar, buffer: &WindowBuffer, window: u32) -> IntervalVec {
    let mut rules = grammar.index.rules_any.clone();
    let Some(w) = buffer.window(window) else { return rules };
    for id in w.cohorts.iter().skip(1) {
        let Some(cohort) = buffer.get(*id) else { continue };
        for reading in cohort.readings.iter().flat_map(|r| r.chain()) {
            for tag in &reading.tags {
                if let Some(found) = grammar.rules_by_tag(*tag) {
                    rules.extend_from(found);
                }
            }
        }
    }
    rules
}

/// Refresh `valid_rules` of a buffered window.
pub(crate) fn index_window(grammar: &Grammar, buffer: &mut WindowBuffer, window: u32) {
    let rules = valid_rules(grammar, buffer, window);
    if let Some(w) = buffer.window_mut(window) {
        w.valid_rules = rules;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{Rule, RuleKind};
    use crate::window::Reading;
    use crate::{GrammarBuilder, SetId};

    fn grammar() -> (Grammar, SetId, SetId, SetId) {
        let mut g = GrammarBuilder::new();
        let n = g.list("N", &["N"]).unwrap();
        let v = g.list("V", &["V"]).unwrap();
        let re = g.list("S", &["\"<.*s>\"r"]).unwrap();
        g.rule(Rule::new(RuleKind::Select, n)).unwrap();
        g.rule(Rule::new(RuleKind::Remove, v)).unwrap();
        g.rule(Rule::new(RuleKind::Select, re)).unwrap();
        (g.build().unwrap(), n, v, re)
    }

    fn cohort_with(grammar: &Grammar, buffer: &mut WindowBuffer, tag: &str) -> crate::CohortId {
        let wf = 12_345;
        let id = buffer.alloc_cohort(wf);
        let mut reading = Reading::new(wf);
        if let Some(t) = grammar.tags.lookup(tag) {
            reading.push_tag(t);
        }
        reading.rehash(&grammar.tags);
        buffer.cohort_mut(id).append_reading(reading);
        id
    }

    #[test]
    fn possible_sets_follow_reading_tags() {
        let (grammar, n, v, re) = grammar();
        let mut buffer = WindowBuffer::new();
        let id = cohort_with(&grammar, &mut buffer, "V");
        index_cohort(&grammar, buffer.cohort_mut(id));
        let sets = &buffer.cohort(id).possible_sets;
        assert!(sets.contains(v));
        assert!(sets.contains(re));
        assert!(!sets.contains(n));
    }

    #[test]
    fn deleted_readings_still_count() {
        let (grammar, n, _, _) = grammar();
        let mut buffer = WindowBuffer::new();
        let id = cohort_with(&grammar, &mut buffer, "N");
        let cohort = buffer.cohort_mut(id);
        let reading = cohort.readings.remove(0);
        cohort.deleted.push(reading);
        index_cohort(&grammar, cohort);
        assert!(buffer.cohort(id).possible_sets.contains(n));
    }

    #[test]
    fn valid_rules_skip_the_begin_cohort() {
        let (grammar, _, _, _) = grammar();
        let mut buffer = WindowBuffer::new();
        let mut window = buffer.new_window();
        let begin = cohort_with(&grammar, &mut buffer, "N");
        let verb = cohort_with(&grammar, &mut buffer, "V");
        window.cohorts = vec![begin, verb];
        let number = window.number;
        buffer.next.push_back(window);
        index_window(&grammar, &mut buffer, number);
        let rules: Vec<u32> = buffer.window(number).unwrap().valid_rules.iter().collect();
        assert_eq!(rules, vec![1, 2]);
    }
}
