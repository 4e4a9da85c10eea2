//! Grammar indexing.
//!
//! This module holds the *static* side of the engine: the structures derived
//! from the full grammar that let a run skip rules and sets that cannot
//! possibly match.
//!
//! Application is split into two phases:
//!
//! 1. **Index the grammar** (this module, [`Grammar::reindex`]): compute set
//!    properties and the maps from tags to the sets and rules they can
//!    trigger.
//! 2. **Run** (see `engine/`): collect the tags present in a window, derive
//!    its candidate rules and each cohort's possible sets (`trigger.rs`), and
//!    only evaluate those.
//!
//! ## Triggers
//!
//! A set can only match a reading that contains one of its *trigger* tags:
//! for a plain tag list, its first tag in frequency order (every tag of the
//! list must be present, so any one of them is a sound trigger). Lists with
//! special tags (regex, numeric, variables, `*`) cannot be decided by tag
//! presence and make the set trigger on *every* cohort. Composite sets
//! trigger on the union of the triggers of the first set of each OR-run.
//!
//! ## Invariants
//!
//! - Pruning is an over-approximation: an index may list a rule or set that
//!   does not match, never omit one that could.
//! - Child sets and referenced tests always have lower ids than their users,
//!   so single passes in id order are bottom-up.

use crate::{RuleId, SetId, TagHash};

use super::Grammar;
use super::rule::Section;
use super::set::SetType;
use super::tag::TagType;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Sorted, merged list of inclusive `u32` ranges, used for rule numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalVec {
    ranges: Vec<(u32, u32)>,
}

impl IntervalVec {
    pub fn new() -> Self {
        IntervalVec::default()
    }

    /// Returns `false` if `value` was already present.
    pub fn insert(&mut self, value: u32) -> bool {
        let idx = self.ranges.partition_point(|r| r.1 < value);
        if idx < self.ranges.len() && self.ranges[idx].0 <= value {
            return false;
        }
        let joins_prev = idx > 0 && self.ranges[idx - 1].1 + 1 == value;
        let joins_next = idx < self.ranges.len() && value + 1 == self.ranges[idx].0;
        match (joins_prev, joins_next) {
            (true, true) => {
                self.ranges[idx - 1].1 = self.ranges[idx].1;
                self.ranges.remove(idx);
            }
            (true, false) => self.ranges[idx - 1].1 = value,
            (false, true) => self.ranges[idx].0 = value,
            (false, false) => self.ranges.insert(idx, (value, value)),
        }
        true
    }

    pub fn contains(&self, value: u32) -> bool {
        let idx = self.ranges.partition_point(|r| r.1 < value);
        idx < self.ranges.len() && self.ranges[idx].0 <= value
    }

    pub fn extend_from(&mut self, other: &IntervalVec) {
        for v in other.iter() {
            self.insert(v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(a, b)| a..=b)
    }

    pub fn len(&self) -> usize {
        self.ranges.iter().map(|&(a, b)| (b - a) as usize + 1).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Number of stored ranges (the compressed size).
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }
}

/// Growable bitset over set ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetBits {
    words: Vec<u64>,
}

impl SetBits {
    pub fn insert(&mut self, set: SetId) {
        let (w, b) = (set.index() / 64, set.index() % 64);
        if self.words.len() <= w {
            self.words.resize(w + 1, 0);
        }
        self.words[w] |= 1 << b;
    }

    pub fn contains(&self, set: SetId) -> bool {
        let (w, b) = (set.index() / 64, set.index() % 64);
        self.words.get(w).is_some_and(|word| word & (1 << b) != 0)
    }

    pub fn union_with(&mut self, other: &SetBits) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= *b;
        }
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = SetId> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            (0..64).filter(move |b| word & (1u64 << b) != 0).map(move |b| SetId::from_index(w * 64 + b))
        })
    }
}

/// One-word Bloom filter over tag hashes, for early rejection of membership
/// tests. False positives only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Bloomish(u64);

impl Bloomish {
    #[inline]
    fn bits(hash: TagHash) -> u64 {
        (1u64 << (hash & 63)) | (1u64 << ((hash >> 6) & 63))
    }

    #[inline]
    pub fn insert(&mut self, hash: TagHash) {
        self.0 |= Self::bits(hash);
    }

    #[inline]
    pub fn may_contain(&self, hash: TagHash) -> bool {
        let bits = Self::bits(hash);
        self.0 & bits == bits
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Trigger tags of a set: the tags whose presence makes it possibly match.
#[derive(Debug, Clone, Default)]
struct Triggers {
    tags: BTreeSet<TagHash>,
    /// Triggers on every cohort.
    any: bool,
}

/// Derived lookup tables, rebuilt by [`Grammar::reindex`].
#[derive(Debug, Clone, Default)]
pub struct GrammarIndex {
    /// Rules whose target is the set.
    pub rules_by_set: HashMap<SetId, IntervalVec>,
    /// Rules whose target set triggers on the tag.
    pub rules_by_tag: HashMap<TagHash, IntervalVec>,
    /// Rules whose target set triggers on every cohort.
    pub rules_any: IntervalVec,
    /// Used sets triggering on the tag.
    pub sets_by_tag: HashMap<TagHash, SetBits>,
    /// Used sets triggering on every cohort.
    pub sets_any: SetBits,
    pub before: Vec<RuleId>,
    pub after: Vec<RuleId>,
    /// Rules of each numbered section, in grammar order.
    pub sections: BTreeMap<u32, Vec<RuleId>>,
    pub has_dependency_rules: bool,
    pub has_relation_rules: bool,
}

impl GrammarIndex {
    /// Rules to run for the numbered section `section`: all rules of sections
    /// `0..=section`, in grammar order.
    pub fn cumulative_section(&self, section: u32) -> Vec<RuleId> {
        let mut rules: Vec<RuleId> = self.sections.range(..=section).flat_map(|(_, r)| r.iter().copied()).collect();
        rules.sort_unstable();
        rules
    }
}

pub(crate) fn reindex(grammar: &mut Grammar) {
    compute_set_kinds(grammar);
    mark_used_sets(grammar);

    let triggers = compute_triggers(grammar);
    let mut index = GrammarIndex::default();

    for set in grammar.sets.iter().filter(|s| s.kind.contains(SetType::USED)) {
        let t = &triggers[set.id.index()];
        if t.any {
            index.sets_any.insert(set.id);
        }
        for tag in &t.tags {
            index.sets_by_tag.entry(*tag).or_default().insert(set.id);
        }
    }

    for rule in &grammar.rules {
        index.rules_by_set.entry(rule.target).or_default().insert(rule.id.0);
        let t = &triggers[rule.target.index()];
        if t.any {
            index.rules_any.insert(rule.id.0);
        }
        for tag in &t.tags {
            index.rules_by_tag.entry(*tag).or_default().insert(rule.id.0);
        }

        use super::rule::RuleKind::*;
        match rule.kind {
            SetParent | SetChild | MoveAfter | MoveBefore | Switch => index.has_dependency_rules = true,
            AddRelation | AddRelations | SetRelation | SetRelations | RemRelation | RemRelations => {
                index.has_relation_rules = true
            }
            _ => {}
        }

        if rule.parent.is_some() {
            continue;
        }
        match rule.section {
            Section::Before => index.before.push(rule.id),
            Section::After => index.after.push(rule.id),
            Section::Main(n) => index.sections.entry(n).or_default().push(rule.id),
            Section::Null => {}
        }
    }

    grammar.index = index;
}

fn compute_set_kinds(grammar: &mut Grammar) {
    for i in 0..grammar.sets.len() {
        let mut kind = grammar.sets[i].kind & (SetType::TAG_UNIFY | SetType::SET_UNIFY);
        let set = &grammar.sets[i];
        if set.is_composite() {
            let all_or = set.set_ops.iter().all(|op| *op == super::set::SetOp::Or);
            for child in &set.sets {
                let ck = grammar.sets[child.index()].kind;
                kind |= ck & (SetType::SPECIAL | SetType::MAPPING);
                if ck.intersects(SetType::TAG_UNIFY | SetType::SET_UNIFY | SetType::CHILD_UNIFY) {
                    kind |= SetType::CHILD_UNIFY;
                }
                if all_or && ck.contains(SetType::ANY) {
                    kind |= SetType::ANY;
                }
            }
        } else {
            if !set.trie_special.is_empty() {
                kind |= SetType::SPECIAL;
            }
            let tags = &grammar.tags;
            let mapping = |t: TagHash| tags.get(t).is_some_and(|tag| tag.kind.contains(TagType::MAPPING));
            if set.trie.any_tag(&mapping) || set.trie_special.any_tag(&mapping) {
                kind |= SetType::MAPPING;
            }
            let any_tag = grammar.tag_any;
            if set.trie_special.iter().any(|(t, node)| *t == any_tag && node.terminal) {
                kind |= SetType::ANY;
            }
        }
        grammar.sets[i].kind = kind;
    }
}

fn mark_used_sets(grammar: &mut Grammar) {
    let mut used = vec![false; grammar.sets.len()];
    let mut mark = |s: SetId| {
        if let Some(u) = used.get_mut(s.index()) {
            *u = true;
        }
    };
    for rule in &grammar.rules {
        mark(rule.target);
    }
    for test in &grammar.contexts {
        test.sets().for_each(&mut mark);
    }
    for set in [grammar.delimiters, grammar.soft_delimiters, grammar.text_delimiters].into_iter().flatten() {
        mark(set);
    }
    for tag in grammar.tags.iter() {
        for (_, set) in &tag.varstring_sets {
            mark(*set);
        }
    }
    for i in (0..grammar.sets.len()).rev() {
        if used[i] {
            for child in grammar.sets[i].sets.clone() {
                used[child.index()] = true;
            }
        }
    }
    for (set, used) in grammar.sets.iter_mut().zip(used) {
        set.kind.set(SetType::USED, used);
    }
}

fn compute_triggers(grammar: &Grammar) -> Vec<Triggers> {
    let mut out: Vec<Triggers> = Vec::with_capacity(grammar.sets.len());
    for set in &grammar.sets {
        let mut t = Triggers::default();
        if set.is_composite() {
            for run in set.runs() {
                if let Some((_, first)) = run.first() {
                    let child = &out[first.index()];
                    t.any |= child.any;
                    t.tags.extend(child.tags.iter().copied());
                }
            }
        } else {
            t.tags.extend(set.trie.iter().map(|(tag, _)| *tag));
            if !set.trie_special.is_empty() {
                t.any = true;
            }
        }
        out.push(t);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_vec_merges_neighbours() {
        let mut iv = IntervalVec::new();
        for v in [5, 3, 4, 10, 9, 1] {
            assert!(iv.insert(v));
        }
        assert!(!iv.insert(4));
        assert_eq!(iv.iter().collect::<Vec<_>>(), vec![1, 3, 4, 5, 9, 10]);
        assert_eq!(iv.range_count(), 3);
        assert!(iv.contains(9));
        assert!(!iv.contains(2));
        assert!(iv.insert(2));
        assert_eq!(iv.range_count(), 2);
        assert_eq!(iv.len(), 7);
    }

    #[test]
    fn set_bits_union_and_iterate() {
        let mut a = SetBits::default();
        a.insert(SetId(3));
        let mut b = SetBits::default();
        b.insert(SetId(130));
        a.union_with(&b);
        assert!(a.contains(SetId(130)));
        assert!(!a.contains(SetId(4)));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![SetId(3), SetId(130)]);
        a.clear();
        assert!(a.is_empty());
    }

    #[test]
    fn bloom_has_no_false_negatives() {
        let mut bloom = Bloomish::default();
        for h in [17u32, 99_999, 4_000_000_000] {
            bloom.insert(h);
        }
        for h in [17u32, 99_999, 4_000_000_000] {
            assert!(bloom.may_contain(h));
        }
    }
}
