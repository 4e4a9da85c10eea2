//! One processing unit, typically a sentence.

use crate::grammar::IntervalVec;
use crate::{CohortId, RuleId, TagHash};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct SingleWindow {
    pub number: u32,
    /// Cohorts in order; index 0 is the `>>>` begin cohort.
    pub cohorts: Vec<CohortId>,
    /// Plain text preceding the first cohort.
    pub text: String,
    /// Plain text following the last cohort.
    pub text_post: String,
    /// Variables set while this window was current: key → value (`None` for a
    /// bare key).
    pub variables_set: BTreeMap<TagHash, Option<TagHash>>,
    /// Variables removed while this window was current.
    pub variables_rem: BTreeSet<TagHash>,
    /// Stream commands to emit after the window.
    pub commands: Vec<String>,
    /// Hard boundary: the window must be flushed once processed.
    pub flush_after: bool,
    /// Rules that can possibly match in this window.
    pub valid_rules: IntervalVec,
    /// EXTERNAL ONCE rules already run on this window.
    pub hit_external: BTreeSet<RuleId>,
    /// Input dependency number → global number, filled while reading.
    pub dep_map: HashMap<u32, u32>,
    /// Input relation id (`ID:n`) → global number.
    pub relation_map: HashMap<u32, u32>,
}

impl SingleWindow {
    pub fn new(number: u32) -> Self {
        SingleWindow { number, ..SingleWindow::default() }
    }

    /// Number of cohorts including the begin cohort.
    pub fn len(&self) -> usize {
        self.cohorts.len()
    }

    /// True when the window holds only its begin cohort (or nothing).
    pub fn is_empty(&self) -> bool {
        self.cohorts.len() <= 1
    }

    pub fn position(&self, cohort: CohortId) -> Option<usize> {
        self.cohorts.iter().position(|c| *c == cohort)
    }

    pub fn last(&self) -> Option<CohortId> {
        if self.is_empty() { None } else { self.cohorts.last().copied() }
    }

    /// Record a variable assignment made by a rule or stream command.
    pub fn record_set_variable(&mut self, key: TagHash, value: Option<TagHash>) {
        self.variables_rem.remove(&key);
        self.variables_set.insert(key, value);
    }

    pub fn record_rem_variable(&mut self, key: TagHash) {
        self.variables_set.remove(&key);
        self.variables_rem.insert(key);
    }
}
