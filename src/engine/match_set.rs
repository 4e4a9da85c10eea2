//! Set matching: does a reading (or a cohort) satisfy a set?
//!
//! ```text
//! cohort_matches(cohort, set)          any reading (normal) / every reading (careful)
//!   └─ reading_matches(reading, set)   possible_sets pre-filter, result cache
//!        └─ eval_set                   composite runs, $$ / && unification
//!             ├─ walk_plain            trie walk by membership
//!             └─ walk_special          trie walk evaluating special tags
//! ```
//!
//! ## Invariants
//!
//! - The cache is only consulted for sets that are not context dependent;
//!   anything involving unification, variables, positions, captures or
//!   numeric extremes is evaluated every time.
//! - A failfast tag that matches aborts its whole set, not only the branch.

use crate::grammar::{NumericValue, SetOp, SetType, SubReading, TagSource, TagType};
use crate::window::{Cohort, Reading};
use crate::{CohortId, SetId, TagHash};

use super::context::Matcher;
use crate::grammar::TagTrie;
use std::time::Instant;

/// Which readings of a cohort take part in a cohort-level match.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CohortMatch {
    pub careful: bool,
    pub sub: SubReading,
    pub deleted: bool,
    pub delayed: bool,
}

enum Walk {
    Found,
    NotFound,
    /// A failfast tag matched.
    Abort,
}

impl Matcher<'_, '_> {
    // --- Cohort level ---------------------------------------------------------

    /// Normal match: some reading satisfies `set`. Careful match: every
    /// reading does, and there is at least one.
    pub(crate) fn cohort_matches(&mut self, id: CohortId, set: SetId, how: CohortMatch) -> bool {
        let buffer = self.buffer;
        let Some(cohort) = buffer.get(id) else { return false };
        let local_reading = self.local_reading(id, how);
        let mut any = false;
        for (idx, reading) in cohort.all_readings(how.deleted, how.delayed).enumerate() {
            if local_reading.is_some_and(|r| r != idx) {
                continue;
            }
            let matched = self.reading_level_matches(cohort, reading, set, how.sub);
            if how.careful && !matched {
                return false;
            }
            if matched && !how.careful {
                return true;
            }
            any |= matched;
        }
        any
    }

    /// While a rule's tests run per target reading, a normal test on the
    /// target cohort itself only looks at that reading.
    fn local_reading(&self, id: CohortId, how: CohortMatch) -> Option<usize> {
        if how.careful || self.state.target != Some(id) {
            return None;
        }
        self.state.target_reading
    }

    /// Match at a sub-reading level; [`SubReading::Any`] tries every level.
    pub(crate) fn reading_level_matches(
        &mut self,
        cohort: &Cohort,
        reading: &Reading,
        set: SetId,
        sub: SubReading,
    ) -> bool {
        match sub {
            SubReading::Any => reading.chain().any(|r| self.reading_matches(cohort, r, set)),
            level => reading.level(level).is_some_and(|r| self.reading_matches(cohort, r, set)),
        }
    }

    // --- Reading level --------------------------------------------------------

    pub(crate) fn reading_matches(&mut self, cohort: &Cohort, reading: &Reading, set_id: SetId) -> bool {
        let grammar = self.grammar;
        let set = grammar.set(set_id);
        if set.kind.contains(SetType::USED) && !cohort.possible_sets.contains(set_id) {
            return false;
        }
        let cacheable = !set.is_context_dependent() && reading.hash != 0;
        if cacheable {
            if let Some(hit) = self.cache.get(&(reading.hash, set_id)) {
                return *hit;
            }
        }
        let started = self.stats.is_some().then(Instant::now);
        let matched = self.eval_set(cohort, reading, set_id);
        if let (Some(stats), Some(started)) = (self.stats.as_deref_mut(), started) {
            if let Some(s) = stats.sets.get_mut(set_id.index()) {
                s.count(matched, started.elapsed());
            }
        }
        if cacheable {
            self.cache.insert((reading.hash, set_id), matched);
        }
        matched
    }

    /// Evaluate without the cohort pre-filter or the cache.
    pub(crate) fn eval_set(&mut self, cohort: &Cohort, reading: &Reading, set_id: SetId) -> bool {
        let grammar = self.grammar;
        let set = grammar.set(set_id);
        if set.kind.contains(SetType::TAG_UNIFY) {
            return self.eval_tag_unify(cohort, reading, set_id);
        }
        if set.kind.contains(SetType::SET_UNIFY) {
            return self.eval_set_unify(cohort, reading, set_id);
        }
        if set.is_composite() {
            for run in set.runs() {
                let mut matched = false;
                let mut failfast = false;
                for (i, (op, child)) in run.iter().enumerate() {
                    if i == 0 {
                        matched = self.eval_set(cohort, reading, *child);
                        continue;
                    }
                    match op {
                        Some(SetOp::Plus) if matched => matched = self.eval_set(cohort, reading, *child),
                        Some(SetOp::Minus) if matched => matched = !self.eval_set(cohort, reading, *child),
                        Some(SetOp::FailFast) if matched => {
                            if self.eval_set(cohort, reading, *child) {
                                matched = false;
                                failfast = true;
                            }
                        }
                        _ => {}
                    }
                }
                if matched {
                    return true;
                }
                if failfast {
                    return false;
                }
            }
            return false;
        }
        self.leaf_path(cohort, reading, set_id).is_some()
    }

    /// The tag list through which a leaf set matches, if it does.
    fn leaf_path(&mut self, cohort: &Cohort, reading: &Reading, set_id: SetId) -> Option<Vec<TagHash>> {
        let grammar = self.grammar;
        let set = grammar.set(set_id);
        if set.kind.contains(SetType::ANY) {
            return Some(vec![grammar.tag_any]);
        }
        let mut path = Vec::new();
        if walk_plain(&set.trie, reading, &mut path) {
            return Some(path);
        }
        path.clear();
        match self.walk_special(&set.trie_special, cohort, reading, &mut path) {
            Walk::Found => Some(path),
            Walk::NotFound | Walk::Abort => None,
        }
    }

    /// The tag list through which any leaf below `set_id` matches.
    fn any_path(&mut self, cohort: &Cohort, reading: &Reading, set_id: SetId) -> Option<Vec<TagHash>> {
        let grammar = self.grammar;
        let set = grammar.set(set_id);
        if !set.is_composite() {
            return self.leaf_path(cohort, reading, set_id);
        }
        if !self.eval_set(cohort, reading, set_id) {
            return None;
        }
        set.sets.iter().find_map(|child| self.any_path(cohort, reading, *child))
    }

    fn eval_tag_unify(&mut self, cohort: &Cohort, reading: &Reading, set_id: SetId) -> bool {
        if let Some(bound) = self.state.unif_tags.get(&set_id).cloned() {
            return bound.iter().all(|t| matches!(self.eval_tag(cohort, reading, *t), Some(true)));
        }
        let Some(&inner) = self.grammar.set(set_id).sets.first() else { return false };
        match self.any_path(cohort, reading, inner) {
            Some(path) => {
                self.state.unif_tags.insert(set_id, path);
                true
            }
            None => false,
        }
    }

    fn eval_set_unify(&mut self, cohort: &Cohort, reading: &Reading, set_id: SetId) -> bool {
        if let Some(bound) = self.state.unif_sets.get(&set_id).copied() {
            return self.eval_set(cohort, reading, bound);
        }
        let Some(&inner) = self.grammar.set(set_id).sets.first() else { return false };
        let inner_set = self.grammar.set(inner);
        let candidates: Vec<SetId> = if inner_set.is_composite() { inner_set.sets.clone() } else { vec![inner] };
        for child in candidates {
            if self.eval_set(cohort, reading, child) {
                self.state.unif_sets.insert(set_id, child);
                return true;
            }
        }
        false
    }

    fn walk_special(&mut self, trie: &TagTrie, cohort: &Cohort, reading: &Reading, path: &mut Vec<TagHash>) -> Walk {
        for (tag, node) in trie.iter() {
            match self.eval_tag(cohort, reading, *tag) {
                None => return Walk::Abort,
                Some(false) => continue,
                Some(true) => {}
            }
            path.push(*tag);
            if node.terminal {
                return Walk::Found;
            }
            if let Some(children) = &node.children {
                match self.walk_special(children, cohort, reading, path) {
                    Walk::Found => return Walk::Found,
                    Walk::Abort => return Walk::Abort,
                    Walk::NotFound => {}
                }
            }
            path.pop();
        }
        Walk::NotFound
    }

    // --- Tag level ------------------------------------------------------------

    /// `Some(matched)`, or `None` when a failfast tag matched.
    pub(crate) fn eval_tag(&mut self, cohort: &Cohort, reading: &Reading, hash: TagHash) -> Option<bool> {
        let tags = self.tags;
        let Some(tag) = tags.tag(hash) else { return Some(reading.contains(hash)) };
        if !tag.is_special() {
            return Some(reading.contains(hash));
        }
        if let Some(inner) = tag.failfast_of {
            return match self.eval_tag(cohort, reading, inner) {
                Some(true) => None,
                _ => Some(true),
            };
        }
        let kind = tag.kind;
        let matched = if kind.contains(TagType::ANY) {
            true
        } else if kind.contains(TagType::TARGET) {
            self.state.target == Some(cohort.id)
        } else if kind.contains(TagType::MARK) {
            self.state.mark == Some(cohort.id)
        } else if kind.contains(TagType::ATTACHTO) {
            self.state.attach_to == Some(cohort.id)
        } else if kind.contains(TagType::PAR_LEFT) {
            cohort.is_pleft
        } else if kind.contains(TagType::PAR_RIGHT) {
            cohort.is_pright
        } else if kind.contains(TagType::ENCL) {
            cohort.encl_depth > 0
        } else if kind.contains(TagType::SAME_BASIC) {
            self.state.target_baseform != 0 && reading.baseform == self.state.target_baseform
        } else if let Some((key, value)) = tag.variable {
            match self.variables.get(&key) {
                Some(current) => value.is_none() || *current == value,
                None => false,
            }
        } else if kind.contains(TagType::META) {
            let Some(re) = tag.regex.as_ref() else { return Some(false) };
            match re.captures(&cohort.text) {
                Some(caps) => {
                    self.record_captures(&caps);
                    true
                }
                None => false,
            }
        } else if kind.contains(TagType::NUMERICAL) {
            self.eval_numeric(cohort, reading, hash)
        } else if kind.contains(TagType::VARSTRING) {
            let expanded = self.expand_varstring(hash);
            expanded.and_then(|text| self.tags.lookup(&text)).is_some_and(|h| reading.contains(h))
        } else if kind.intersects(TagType::REGEXP | TagType::CASE_INSENSITIVE) {
            self.eval_regex(reading, hash)
        } else {
            reading.contains(hash)
        };
        Some(matched)
    }

    fn eval_regex(&mut self, reading: &Reading, hash: TagHash) -> bool {
        let tags = self.tags;
        let Some(tag) = tags.tag(hash) else { return false };
        let Some(re) = tag.regex.as_ref() else { return false };
        let class = tag.kind & (TagType::WORDFORM | TagType::BASEFORM | TagType::TEXTUAL);
        let candidates: &[TagHash] = if class.is_empty() { &reading.tags } else { &reading.tags_textual };
        for candidate in candidates {
            let Some(other) = tags.tag(*candidate) else { continue };
            if !class.is_empty() && !same_textual_class(class, other.kind) {
                continue;
            }
            if let Some(caps) = re.captures(&other.text) {
                self.record_captures(&caps);
                return true;
            }
        }
        false
    }

    fn record_captures(&mut self, caps: &regex::Captures<'_>) {
        if caps.len() <= 1 {
            return;
        }
        self.state.captures =
            caps.iter().skip(1).map(|m| m.map_or(String::new(), |m| m.as_str().to_string())).collect();
    }

    fn eval_numeric(&self, cohort: &Cohort, reading: &Reading, hash: TagHash) -> bool {
        let Some(cmp) = self.tags.tag(hash).and_then(|t| t.comparison.as_ref()) else { return false };
        let resolved = match cmp.value {
            NumericValue::Value(v) => v,
            NumericValue::Min => match cohort.num_min.get(&cmp.key) {
                Some(v) => *v,
                None => return false,
            },
            NumericValue::Max => match cohort.num_max.get(&cmp.key) {
                Some(v) => *v,
                None => return false,
            },
        };
        reading.tags_numerical.iter().any(|t| {
            let Some(other) = self.tags.tag(*t).and_then(|t| t.comparison.as_ref()) else { return false };
            let NumericValue::Value(value) = other.value else { return false };
            other.key == cmp.key && cmp.admits(resolved, other.op, value)
        })
    }

    /// Expand a varstring tag with the current captures and unified sets.
    pub(crate) fn expand_varstring(&self, hash: TagHash) -> Option<String> {
        let tag = self.tags.tag(hash)?;
        let grammar = self.grammar;
        let state = &*self.state;
        let tags = self.tags;
        Some(tag.expand_varstring(&state.captures, |set| {
            let bound = state.unif_tags.iter().find(|(unifier, _)| {
                **unifier == set || grammar.set(**unifier).sets.first() == Some(&set)
            });
            bound.map(|(_, list)| list.iter().map(|t| tags.text(*t)).collect::<Vec<_>>().join(" "))
        }))
    }
}

fn same_textual_class(class: TagType, other: TagType) -> bool {
    if class.contains(TagType::WORDFORM) {
        other.contains(TagType::WORDFORM)
    } else if class.contains(TagType::BASEFORM) {
        other.contains(TagType::BASEFORM)
    } else {
        other.contains(TagType::TEXTUAL) && !other.intersects(TagType::WORDFORM | TagType::BASEFORM)
    }
}

fn walk_plain(trie: &TagTrie, reading: &Reading, path: &mut Vec<TagHash>) -> bool {
    for (tag, node) in trie.iter() {
        if !reading.contains(*tag) {
            continue;
        }
        path.push(*tag);
        if node.terminal {
            return true;
        }
        if let Some(children) = &node.children {
            if walk_plain(children, reading, path) {
                return true;
            }
        }
        path.pop();
    }
    false
}
