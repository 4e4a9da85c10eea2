//! Rule actions: what a matched rule does to its target.
//!
//! ```text
//! apply(rule, hit, operands)
//!   ├─ readings    SELECT REMOVE IFF MAP ADD REPLACE APPEND SUBSTITUTE COPY
//!   │              UNMAP PROTECT UNPROTECT MATCH
//!   ├─ links       SETPARENT SETCHILD (ADD|SET|REM)RELATION(S)
//!   ├─ structure   MOVE SWITCH REMCOHORT ADDCOHORT SPLITCOHORT MERGECOHORTS
//!   │              DELIMIT
//!   ├─ variables   SETVARIABLE REMVARIABLE
//!   └─ external    EXTERNAL ONCE / ALWAYS
//! ```
//!
//! Every action reports whether it changed the window. The rule loop only
//! re-runs a section when something changed, so an action that leaves the
//! window as it was must report `false` even when the rule matched.
//!
//! ## Invariants
//!
//! - A cohort never loses its last live reading unless the rule is unsafe.
//! - One-shot rules record themselves in `hit_by` of every reading they
//!   applied to, including readings they create.
//! - After a structural change the window is renumbered and only its last
//!   cohort carries the `<<<` tag.

use crate::error::ExternalError;
use crate::grammar::{Grammar, Rule, RuleFlags, RuleKind, TagSource, TagType, hash_text};
use crate::window::{CohortFlags, Reading};
use crate::{CohortId, DEP_ROOT, RuleId, SetId, TagHash};

use super::context::{EngineContext, MatchState};
use super::external::{ExternalCohort, ExternalWindow};
use std::collections::BTreeSet;

bitflags::bitflags! {
    /// What running a rule (or a list of rules) did to the window.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct RunOutcome: u8 {
        const FIRED     = 1 << 0;
        /// The window was split; the caller must restart on the shortened
        /// window.
        const DELIMITED = 1 << 1;
    }
}

/// Tags a rule writes, resolved for one application.
#[derive(Debug, Clone, Default)]
pub(crate) struct Operands {
    /// Maplist tag lists in declaration order.
    pub maplist: Vec<Vec<TagHash>>,
    pub sublist: Vec<TagHash>,
}

impl Operands {
    fn flat(&self) -> Vec<TagHash> {
        self.maplist.iter().flatten().copied().collect()
    }

    fn first(&self) -> Option<TagHash> {
        self.maplist.iter().flatten().next().copied()
    }
}

/// Where a matched rule applies.
#[derive(Debug, Clone)]
pub(crate) struct Hit {
    pub cohort: CohortId,
    /// Indices into the cohort's live readings, ascending.
    pub readings: Vec<usize>,
    /// The other end of link and structural rules.
    pub other: Option<CohortId>,
}

/// A tag waiting to be interned after matching released the context.
enum Pending {
    Tag(TagHash),
    Text(String),
}

impl<'g> EngineContext<'g> {
    // --- Operands -------------------------------------------------------------

    /// Resolve maplist and sublist with the bindings of `state`. Unified
    /// maplists use the bound list; varstrings are expanded and interned.
    pub(crate) fn operands(&mut self, rule: &Rule, state: &mut MatchState) -> Operands {
        let grammar = self.grammar;
        let (maplist, sublist) = {
            let m = self.matcher(state);
            let resolve = |list: &[TagHash]| -> Vec<Pending> {
                list.iter()
                    .map(|t| {
                        let varstring = m.tags.tag(*t).is_some_and(|tag| tag.kind.contains(TagType::VARSTRING));
                        match varstring.then(|| m.expand_varstring(*t)).flatten() {
                            Some(text) => Pending::Text(text),
                            None => Pending::Tag(*t),
                        }
                    })
                    .collect()
            };
            let lists_of = |set: Option<SetId>| -> Vec<Vec<Pending>> {
                let Some(set) = set else { return Vec::new() };
                if let Some(bound) = m.state.unif_tags.get(&set) {
                    return vec![resolve(bound)];
                }
                set_lists(grammar, set).iter().map(|l| resolve(l)).collect()
            };
            (lists_of(rule.maplist), lists_of(rule.sublist))
        };
        let mut intern = |list: Vec<Pending>| -> Vec<TagHash> {
            list.into_iter()
                .filter_map(|p| match p {
                    Pending::Tag(t) => Some(t),
                    Pending::Text(text) => self.tags.intern(&text),
                })
                .collect()
        };
        Operands {
            maplist: maplist.into_iter().map(&mut intern).collect(),
            sublist: sublist.into_iter().flat_map(&mut intern).collect(),
        }
    }

    // --- Dispatch -------------------------------------------------------------

    /// Apply a matched rule. Flow-control kinds are handled by the rule loop.
    pub(crate) fn apply(&mut self, rule: &Rule, hit: &Hit, ops: &Operands) -> RunOutcome {
        let changed = match rule.kind {
            RuleKind::Select => self.select(rule, hit),
            RuleKind::Remove => self.remove(rule, hit.cohort, &hit.readings),
            RuleKind::Iff => self.select(rule, hit),
            RuleKind::Map | RuleKind::Add => self.map(rule, hit, &ops.flat()),
            RuleKind::Replace => self.replace(rule, hit, &ops.flat()),
            RuleKind::Append => self.append(rule, hit, &ops.flat()),
            RuleKind::Substitute => self.substitute(rule, hit, &ops.sublist, &ops.flat()),
            RuleKind::Copy => self.copy(rule, hit, ops),
            RuleKind::Unmap => self.unmap(rule, hit),
            RuleKind::Protect | RuleKind::Unprotect => self.protect(rule, hit, rule.kind == RuleKind::Protect),
            RuleKind::Match => {
                self.mark_hit(rule.id, hit);
                false
            }
            RuleKind::SetParent | RuleKind::SetChild => self.set_dependency(rule, hit),
            RuleKind::AddRelation
            | RuleKind::AddRelations
            | RuleKind::SetRelation
            | RuleKind::SetRelations
            | RuleKind::RemRelation
            | RuleKind::RemRelations => self.set_relation(rule, hit, ops),
            RuleKind::MoveAfter | RuleKind::MoveBefore => self.move_cohort(rule, hit),
            RuleKind::Switch => self.switch_cohorts(rule, hit),
            RuleKind::RemCohort => self.remove_cohort(hit.cohort),
            RuleKind::AddCohortAfter | RuleKind::AddCohortBefore => self.add_cohort(rule, hit, ops),
            RuleKind::SplitCohort => self.split_cohort(rule, hit, ops),
            RuleKind::MergeCohorts => self.merge_cohorts(rule, hit, ops),
            RuleKind::SetVariable => self.set_variable(hit.cohort, ops),
            RuleKind::RemVariable => self.rem_variable(hit.cohort, ops),
            RuleKind::Delimit => {
                return if self.delimit(hit.cohort) {
                    RunOutcome::FIRED | RunOutcome::DELIMITED
                } else {
                    RunOutcome::empty()
                };
            }
            RuleKind::ExternalOnce | RuleKind::ExternalAlways => self.run_external(rule, hit.cohort),
            RuleKind::Jump | RuleKind::Execute | RuleKind::With => false,
        };
        if changed { RunOutcome::FIRED } else { RunOutcome::empty() }
    }

    fn mark_hit(&mut self, rule: RuleId, hit: &Hit) {
        let Some(cohort) = self.buffer.get_mut(hit.cohort) else { return };
        for i in &hit.readings {
            if let Some(r) = cohort.readings.get_mut(*i) {
                record_hit(r, rule);
            }
        }
    }

    // --- Disambiguation -------------------------------------------------------

    /// Keep only the selected readings.
    fn select(&mut self, rule: &Rule, hit: &Hit) -> bool {
        let Some(cohort) = self.buffer.get(hit.cohort) else { return false };
        let drop: Vec<usize> = (0..cohort.readings.len()).filter(|i| !hit.readings.contains(i)).collect();
        if hit.readings.is_empty() || drop.is_empty() {
            return false;
        }
        let changed = self.remove(rule, hit.cohort, &drop);
        if changed {
            self.mark_hit(rule.id, &Hit { readings: (0..hit.readings.len()).collect(), ..hit.clone() });
        }
        changed
    }

    /// Move readings to the deleted (or delayed) list. Refused when it would
    /// empty the cohort of a safe rule.
    pub(crate) fn remove(&mut self, rule: &Rule, id: CohortId, drop: &[usize]) -> bool {
        let unsafe_rule = rule.flags.contains(RuleFlags::UNSAFE)
            || (self.options.unsafe_by_default && !rule.flags.contains(RuleFlags::SAFE));
        let Some(cohort) = self.buffer.get_mut(id) else { return false };
        if drop.is_empty() || (drop.len() >= cohort.readings.len() && !unsafe_rule) {
            return false;
        }
        let delayed = rule.flags.contains(RuleFlags::DELAYED);
        let mut kept = Vec::with_capacity(cohort.readings.len());
        for (i, mut reading) in std::mem::take(&mut cohort.readings).into_iter().enumerate() {
            if !drop.contains(&i) {
                kept.push(reading);
                continue;
            }
            record_hit(&mut reading, rule.id);
            reading.deleted = true;
            if delayed { cohort.delayed.push(reading) } else { cohort.deleted.push(reading) }
        }
        cohort.readings = kept;
        self.refresh_cohort(id);
        true
    }

    // --- Mapping and correction -----------------------------------------------

    /// MAP and ADD. Several mapping tags split the reading into one copy per
    /// mapping tag, in preferred-target order.
    fn map(&mut self, rule: &Rule, hit: &Hit, tags: &[TagHash]) -> bool {
        let is_mapping = |t: &TagHash| self.tags.tag(*t).is_some_and(|t| t.is_mapping());
        let (mut mapping, plain): (Vec<TagHash>, Vec<TagHash>) = tags.iter().partition(|t| is_mapping(t));
        let preferred = &self.grammar.preferred_targets;
        mapping.sort_by_key(|t| preferred.iter().position(|p| p == t).unwrap_or(usize::MAX));
        let Some(cohort) = self.buffer.get_mut(hit.cohort) else { return false };
        let mut changed = false;
        for &i in hit.readings.iter().rev() {
            let Some(reading) = cohort.readings.get_mut(i) else { continue };
            if mapping.len() <= 1 {
                if let Some(level) = reading.level_mut(rule.sub_reading) {
                    for tag in tags {
                        changed |= level.push_tag(*tag);
                    }
                }
                record_hit(reading, rule.id);
                reading.mapped = rule.kind == RuleKind::Map || reading.mapped;
                continue;
            }
            let base = reading.clone();
            let copies: Vec<Reading> = mapping
                .iter()
                .map(|m| {
                    let mut copy = base.clone();
                    if let Some(level) = copy.level_mut(rule.sub_reading) {
                        for tag in plain.iter().chain(std::iter::once(m)) {
                            level.push_tag(*tag);
                        }
                    }
                    record_hit(&mut copy, rule.id);
                    copy.mapped = true;
                    copy
                })
                .collect();
            cohort.readings.splice(i..=i, copies);
            changed = true;
        }
        if changed {
            self.refresh_cohort(hit.cohort);
        }
        changed
    }

    /// Replace everything but the wordform, baseform and window markers.
    fn replace(&mut self, rule: &Rule, hit: &Hit, tags: &[TagHash]) -> bool {
        let grammar = self.grammar;
        let has_baseform =
            tags.iter().any(|t| self.tags.tag(*t).is_some_and(|t| t.kind.contains(TagType::BASEFORM)));
        let Some(cohort) = self.buffer.get_mut(hit.cohort) else { return false };
        let mut changed = false;
        for &i in &hit.readings {
            let Some(reading) = cohort.readings.get_mut(i) else { continue };
            record_hit(reading, rule.id);
            let Some(level) = reading.level_mut(rule.sub_reading) else { continue };
            let mut list = vec![level.wordform];
            if !has_baseform && level.baseform != 0 {
                list.push(level.baseform);
            }
            for t in tags {
                if !list.contains(t) {
                    list.push(*t);
                }
            }
            for marker in [grammar.tag_begin, grammar.tag_end] {
                if level.tags_list.contains(&marker) && !list.contains(&marker) {
                    list.push(marker);
                }
            }
            if level.tags_list != list {
                level.tags_list = list;
                changed = true;
            }
        }
        if changed {
            self.refresh_cohort(hit.cohort);
        }
        changed
    }

    /// Add a new reading made of the maplist, unless an identical one exists.
    fn append(&mut self, rule: &Rule, hit: &Hit, tags: &[TagHash]) -> bool {
        let Some(wordform) = self.buffer.get(hit.cohort).map(|c| c.wordform) else { return false };
        let mut reading = self.make_reading(wordform, tags);
        record_hit(&mut reading, rule.id);
        self.mark_hit(rule.id, hit);
        let Some(cohort) = self.buffer.get_mut(hit.cohort) else { return false };
        if cohort.readings.iter().any(|r| r.tags_list == reading.tags_list) {
            return false;
        }
        cohort.append_reading(reading);
        self.refresh_cohort(hit.cohort);
        true
    }

    /// Remove the sublist tags and insert the maplist where the first of them
    /// stood.
    fn substitute(&mut self, rule: &Rule, hit: &Hit, remove: &[TagHash], insert: &[TagHash]) -> bool {
        let Some(cohort) = self.buffer.get_mut(hit.cohort) else { return false };
        let mut changed = false;
        for &i in &hit.readings {
            let Some(reading) = cohort.readings.get_mut(i) else { continue };
            record_hit(reading, rule.id);
            let Some(level) = reading.level_mut(rule.sub_reading) else { continue };
            let at = remove.iter().filter_map(|t| level.remove_tag(*t)).min();
            let Some(mut at) = at else { continue };
            for tag in insert {
                if !level.tags_list.contains(tag) {
                    level.tags_list.insert(at.min(level.tags_list.len()), *tag);
                    at += 1;
                }
            }
            changed = true;
        }
        if changed {
            self.refresh_cohort(hit.cohort);
        }
        changed
    }

    /// Insert a copy of each selected reading with the maplist added and the
    /// sublist removed.
    fn copy(&mut self, rule: &Rule, hit: &Hit, ops: &Operands) -> bool {
        let add = ops.flat();
        let Some(cohort) = self.buffer.get_mut(hit.cohort) else { return false };
        let mut changed = false;
        for &i in hit.readings.iter().rev() {
            let Some(reading) = cohort.readings.get_mut(i) else { continue };
            record_hit(reading, rule.id);
            let mut copy = reading.clone();
            if let Some(level) = copy.level_mut(rule.sub_reading) {
                for tag in &ops.sublist {
                    level.remove_tag(*tag);
                }
                for tag in &add {
                    level.push_tag(*tag);
                }
            }
            if cohort.readings.iter().any(|r| r.tags_list == copy.tags_list && r.next == copy.next) {
                continue;
            }
            cohort.readings.insert(i + 1, copy);
            changed = true;
        }
        if changed {
            self.refresh_cohort(hit.cohort);
        }
        changed
    }

    /// Strips mapping tags; UNMAPLAST strips only the last one.
    fn unmap(&mut self, rule: &Rule, hit: &Hit) -> bool {
        let tags = &self.tags;
        let last_only = rule.flags.contains(RuleFlags::UNMAPLAST);
        let Some(cohort) = self.buffer.get_mut(hit.cohort) else { return false };
        let mut changed = false;
        for &i in &hit.readings {
            let Some(reading) = cohort.readings.get_mut(i) else { continue };
            if last_only && reading.was_hit_by(rule.id) {
                continue;
            }
            record_hit(reading, rule.id);
            let Some(level) = reading.level_mut(rule.sub_reading) else { continue };
            let before = level.tags_list.len();
            let is_mapping = |t: &TagHash| tags.tag(*t).is_some_and(|t| t.is_mapping());
            if last_only {
                if let Some(at) = level.tags_list.iter().rposition(is_mapping) {
                    level.tags_list.remove(at);
                }
            } else {
                level.tags_list.retain(|t| !is_mapping(t));
            }
            changed |= level.tags_list.len() != before || level.mapped;
            level.mapped = false;
        }
        if changed {
            self.refresh_cohort(hit.cohort);
        }
        changed
    }

    fn protect(&mut self, rule: &Rule, hit: &Hit, on: bool) -> bool {
        let Some(cohort) = self.buffer.get_mut(hit.cohort) else { return false };
        let mut changed = false;
        for &i in &hit.readings {
            let Some(reading) = cohort.readings.get_mut(i) else { continue };
            record_hit(reading, rule.id);
            changed |= reading.immutable != on;
            reading.immutable = on;
        }
        changed
    }

    // --- Links ----------------------------------------------------------------

    fn set_dependency(&mut self, rule: &Rule, hit: &Hit) -> bool {
        let Some(other) = hit.other else { return false };
        self.mark_hit(rule.id, hit);
        match rule.kind {
            RuleKind::SetParent => self.attach(hit.cohort, other, rule.flags),
            _ => self.attach(other, hit.cohort, rule.flags),
        }
    }

    fn set_relation(&mut self, rule: &Rule, hit: &Hit, ops: &Operands) -> bool {
        let (Some(other), Some(label)) = (hit.other, ops.first()) else { return false };
        self.mark_hit(rule.id, hit);
        self.relate(rule.kind, hit.cohort, other, label, ops.sublist.first().copied())
    }

    // --- Structure ------------------------------------------------------------

    /// MOVE AFTER / MOVE BEFORE within one window; `WITHCHILD` moves the
    /// subtree along.
    fn move_cohort(&mut self, rule: &Rule, hit: &Hit) -> bool {
        let Some(target) = hit.other else { return false };
        let Some(window) = self.same_window(hit.cohort, target) else { return false };
        self.mark_hit(rule.id, hit);
        let moving = if rule.flags.contains(RuleFlags::WITHCHILD) {
            self.subtree_in_window(hit.cohort, window)
        } else {
            vec![hit.cohort]
        };
        if moving.contains(&target) {
            return false;
        }
        let Some(w) = self.buffer.window_mut(window) else { return false };
        let before = w.cohorts.clone();
        w.cohorts.retain(|id| !moving.contains(id));
        let Some(at) = w.position(target) else {
            w.cohorts = before;
            return false;
        };
        let at = if rule.kind == RuleKind::MoveAfter { at + 1 } else { at.max(1) };
        w.cohorts.splice(at..at, moving);
        if w.cohorts == before {
            return false;
        }
        self.settle_window(window);
        true
    }

    fn switch_cohorts(&mut self, rule: &Rule, hit: &Hit) -> bool {
        let Some(other) = hit.other.filter(|o| *o != hit.cohort) else { return false };
        let Some(window) = self.same_window(hit.cohort, other) else { return false };
        self.mark_hit(rule.id, hit);
        let Some(w) = self.buffer.window_mut(window) else { return false };
        let (Some(a), Some(b)) = (w.position(hit.cohort), w.position(other)) else { return false };
        w.cohorts.swap(a, b);
        self.settle_window(window);
        true
    }

    /// REMCOHORT: children move up to the removed cohort's parent; the cohort
    /// is kept on its predecessor for tracing.
    pub(crate) fn remove_cohort(&mut self, id: CohortId) -> bool {
        let Some(cohort) = self.buffer.get(id) else { return false };
        let (window, global, parent) = (cohort.window, cohort.global_number, cohort.dep_parent);
        let children: Vec<u32> = cohort.dep_children.iter().copied().collect();
        let Some(w) = self.buffer.window_mut(window) else { return false };
        if w.len() <= 2 {
            tracing::debug!(cohort = global, "refusing to remove the only cohort of a window");
            return false;
        }
        let Some(pos) = w.position(id) else { return false };
        w.cohorts.remove(pos);
        let previous = w.cohorts[pos - 1];

        self.detach(id);
        for child in children {
            let Some(child_id) = self.buffer.by_global(child) else { continue };
            if let Some(c) = self.buffer.get_mut(child_id) {
                c.dep_parent = parent;
            }
            if let Some(p) = parent.filter(|p| *p != DEP_ROOT).and_then(|p| self.buffer.by_global(p)) {
                if let Some(p) = self.buffer.get_mut(p) {
                    p.dep_children.insert(child);
                }
            }
        }
        if let Some(c) = self.buffer.get_mut(id) {
            c.flags |= CohortFlags::REMOVED;
            c.dep_children.clear();
        }
        if let Some(p) = self.buffer.get_mut(previous) {
            p.removed.push(id);
        }
        self.settle_window(window);
        true
    }

    /// ADDCOHORT: the maplist holds the new wordform followed by the tags of
    /// its readings, one reading per list.
    fn add_cohort(&mut self, rule: &Rule, hit: &Hit, ops: &Operands) -> bool {
        let Some(window) = self.buffer.get(hit.cohort).map(|c| c.window) else { return false };
        let Some(wordform) = self.find_kind(&ops.flat(), TagType::WORDFORM) else {
            tracing::warn!(rule = rule.display_name(), line = rule.line, "ADDCOHORT without a wordform tag");
            return false;
        };
        self.mark_hit(rule.id, hit);
        let id = self.new_cohort(wordform, window, rule.id, &ops.maplist);
        let Some(w) = self.buffer.window_mut(window) else { return false };
        let Some(pos) = w.position(hit.cohort) else { return false };
        let at = if rule.kind == RuleKind::AddCohortAfter { pos + 1 } else { pos.max(1) };
        w.cohorts.insert(at, id);
        self.settle_window(window);
        true
    }

    /// SPLITCOHORT: one new cohort per maplist list. The last one is the head:
    /// it takes over the parent and children, the others attach to it.
    fn split_cohort(&mut self, rule: &Rule, hit: &Hit, ops: &Operands) -> bool {
        let Some(cohort) = self.buffer.get(hit.cohort) else { return false };
        let (window, wordform, parent) = (cohort.window, cohort.wordform, cohort.dep_parent);
        let children: Vec<u32> = cohort.dep_children.iter().copied().collect();
        if ops.maplist.len() < 2 {
            return false;
        }
        let mut parts = Vec::with_capacity(ops.maplist.len());
        for list in &ops.maplist {
            let wf = self.find_kind(list, TagType::WORDFORM).unwrap_or(wordform);
            parts.push(self.new_cohort(wf, window, rule.id, std::slice::from_ref(list)));
        }
        let Some(w) = self.buffer.window_mut(window) else { return false };
        let Some(pos) = w.position(hit.cohort) else { return false };
        w.cohorts.splice(pos..=pos, parts.iter().copied());
        self.buffer.renumber(window);

        let head = parts[parts.len() - 1];
        let head_global = self.buffer.cohort(head).global_number;
        self.detach(hit.cohort);
        for part in &parts[..parts.len() - 1] {
            self.attach(*part, head, RuleFlags::ALLOWLOOP | RuleFlags::ALLOWCROSS);
        }
        if let Some(h) = self.buffer.get_mut(head) {
            h.dep_parent = parent;
        }
        if let Some(p) = parent.filter(|p| *p != DEP_ROOT).and_then(|p| self.buffer.by_global(p)) {
            if let Some(p) = self.buffer.get_mut(p) {
                p.dep_children.insert(head_global);
            }
        }
        self.adopt_children(head, &children);
        self.retire(hit.cohort, parts[0]);
        self.settle_window(window);
        true
    }

    /// MERGECOHORTS: the range from the target to the other cohort becomes
    /// one cohort built from the maplist, keeping the links that leave the
    /// range.
    fn merge_cohorts(&mut self, rule: &Rule, hit: &Hit, ops: &Operands) -> bool {
        let Some(other) = hit.other else { return false };
        let Some(window) = self.same_window(hit.cohort, other) else { return false };
        let Some(w) = self.buffer.window(window) else { return false };
        let (Some(a), Some(b)) = (w.position(hit.cohort), w.position(other)) else { return false };
        let (lo, hi) = (a.min(b).max(1), a.max(b));
        let range: Vec<CohortId> = w.cohorts[lo..=hi].to_vec();
        let globals: BTreeSet<u32> =
            range.iter().filter_map(|id| self.buffer.get(*id)).map(|c| c.global_number).collect();

        let mut parent = None;
        let mut children = Vec::new();
        for c in range.iter().filter_map(|id| self.buffer.get(*id)) {
            if parent.is_none() {
                parent = c.dep_parent.filter(|p| !globals.contains(p));
            }
            children.extend(c.dep_children.iter().copied().filter(|g| !globals.contains(g)));
        }
        let wordform = self
            .find_kind(&ops.flat(), TagType::WORDFORM)
            .or_else(|| self.buffer.get(range[0]).map(|c| c.wordform))
            .unwrap_or_default();
        let merged = self.new_cohort(wordform, window, rule.id, &ops.maplist);

        for id in &range {
            self.detach(*id);
        }
        let Some(w) = self.buffer.window_mut(window) else { return false };
        w.cohorts.splice(lo..=hi, std::iter::once(merged));
        self.buffer.renumber(window);
        if let Some(m) = self.buffer.get_mut(merged) {
            m.dep_parent = parent;
        }
        if let Some(p) = parent.filter(|p| *p != DEP_ROOT).and_then(|p| self.buffer.by_global(p)) {
            let merged_global = self.buffer.cohort(merged).global_number;
            if let Some(p) = self.buffer.get_mut(p) {
                p.dep_children.insert(merged_global);
            }
        }
        self.adopt_children(merged, &children);
        for id in range {
            self.retire(id, merged);
        }
        self.settle_window(window);
        true
    }

    /// DELIMIT: everything after `id` moves to a new window queued right
    /// after this one.
    pub(crate) fn delimit(&mut self, id: CohortId) -> bool {
        let Some(window) = self.buffer.get(id).map(|c| c.window) else { return false };
        let Some(w) = self.buffer.window_mut(window) else { return false };
        let Some(pos) = w.position(id) else { return false };
        if pos + 1 >= w.len() {
            return false;
        }
        let tail = w.cohorts.split_off(pos + 1);
        let text_post = std::mem::take(&mut w.text_post);
        let flush_after = std::mem::take(&mut w.flush_after);

        let mut split = self.buffer.new_window();
        let begin = self.new_begin_cohort(split.number);
        split.cohorts.push(begin);
        split.cohorts.extend(tail);
        split.text_post = text_post;
        split.flush_after = flush_after;
        let number = split.number;
        if let Some(at) = self.buffer.next.iter().position(|w| w.number == window) {
            self.buffer.next.insert(at + 1, split);
        } else {
            self.buffer.next.push_front(split);
        }
        tracing::debug!(window, new_window = number, at = pos, "window delimited");
        self.settle_window(window);
        self.settle_window(number);
        true
    }

    // --- Variables ------------------------------------------------------------

    /// Key and value of the first maplist tag: a `VAR:k=v` tag names both,
    /// any other tag is the key and the sublist's first tag the value.
    fn variable_operand(&self, ops: &Operands) -> Option<(TagHash, Option<TagHash>)> {
        let first = ops.first()?;
        let tag = self.tags.tag(first)?;
        Some(match tag.variable {
            Some(pair) => pair,
            None => (
                hash_text(&tag.text, 0),
                ops.sublist.first().map(|v| hash_text(self.tags.text(*v), 0)),
            ),
        })
    }

    fn set_variable(&mut self, id: CohortId, ops: &Operands) -> bool {
        let Some((key, value)) = self.variable_operand(ops) else { return false };
        let changed = self.variables.get(&key) != Some(&value);
        self.variables.insert(key, value);
        let window = self.buffer.get(id).map(|c| c.window);
        if let Some(w) = window.and_then(|n| self.buffer.window_mut(n)) {
            w.record_set_variable(key, value);
        }
        changed
    }

    fn rem_variable(&mut self, id: CohortId, ops: &Operands) -> bool {
        let Some((key, _)) = self.variable_operand(ops) else { return false };
        let changed = self.variables.remove(&key).is_some();
        let window = self.buffer.get(id).map(|c| c.window);
        if let Some(w) = window.and_then(|n| self.buffer.window_mut(n)) {
            w.record_rem_variable(key);
        }
        changed
    }

    // --- External -------------------------------------------------------------

    /// Hand the window to the external handler and take back its readings.
    fn run_external(&mut self, rule: &Rule, id: CohortId) -> bool {
        let Some(program) = rule.external.as_deref() else { return false };
        let Some(window) = self.buffer.get(id).map(|c| c.window) else { return false };
        if rule.kind == RuleKind::ExternalOnce {
            let Some(w) = self.buffer.window_mut(window) else { return false };
            if !w.hit_external.insert(rule.id) {
                return false;
            }
        }
        let Some(request) = self.external_window(window) else { return false };
        let ids: Vec<CohortId> =
            self.buffer.window(window).map(|w| w.cohorts.iter().skip(1).copied().collect()).unwrap_or_default();
        let Some(handler) = self.external.as_mut() else {
            tracing::debug!(program, "no external handler installed, skipping");
            return false;
        };
        let response = handler.exchange(program, request).and_then(|response| {
            if response.cohorts.len() == ids.len() {
                Ok(response)
            } else {
                Err(ExternalError::CohortCount {
                    program: program.to_string(),
                    expected: ids.len(),
                    got: response.cohorts.len(),
                })
            }
        });
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(program, error = %err, "external program failed");
                return false;
            }
        };
        let mut changed = false;
        for (id, cohort) in ids.into_iter().zip(response.cohorts) {
            changed |= self.replace_readings(id, &cohort);
        }
        changed
    }

    fn external_window(&self, window: u32) -> Option<ExternalWindow> {
        let w = self.buffer.window(window)?;
        let end = self.grammar.tag_end;
        let cohorts = w
            .cohorts
            .iter()
            .skip(1)
            .filter_map(|id| self.buffer.get(*id))
            .map(|c| ExternalCohort {
                wordform: self.tags.text(c.wordform).to_string(),
                readings: c
                    .readings
                    .iter()
                    .map(|r| {
                        r.tags_list[1..]
                            .iter()
                            .filter(|t| **t != end)
                            .map(|t| self.tags.text(*t).to_string())
                            .collect()
                    })
                    .collect(),
            })
            .collect();
        Some(ExternalWindow { number: window, cohorts })
    }

    fn replace_readings(&mut self, id: CohortId, cohort: &ExternalCohort) -> bool {
        let Some(wordform) = self.buffer.get(id).map(|c| c.wordform) else { return false };
        let mut readings = Vec::with_capacity(cohort.readings.len());
        for tags in &cohort.readings {
            let hashes: Vec<TagHash> = tags.iter().filter_map(|t| self.tags.intern(t)).collect();
            readings.push(self.make_reading(wordform, &hashes));
        }
        if readings.is_empty() {
            return false;
        }
        let Some(c) = self.buffer.get_mut(id) else { return false };
        let same = c.readings.len() == readings.len()
            && c.readings.iter().zip(&readings).all(|(a, b)| a.tags_list == b.tags_list);
        if same {
            return false;
        }
        c.readings.clear();
        for reading in readings {
            c.append_reading(reading);
        }
        self.refresh_cohort(id);
        true
    }

    // --- Cohort helpers -------------------------------------------------------

    /// The `>>>` pseudo cohort that opens a window.
    pub(crate) fn new_begin_cohort(&mut self, window: u32) -> CohortId {
        let begin = self.grammar.tag_begin;
        let id = self.buffer.alloc_cohort(begin);
        let reading = self.make_reading(begin, &[]);
        if let Some(c) = self.buffer.get_mut(id) {
            c.flags |= CohortFlags::BEGIN;
            c.window = window;
            c.dep_self = c.global_number;
            c.append_reading(reading);
        }
        self.refresh_cohort(id);
        id
    }

    /// A cohort created by a rule: one reading per tag list (wordform tags
    /// dropped), or a bare reading when no list has tags left.
    fn new_cohort(&mut self, wordform: TagHash, window: u32, rule: RuleId, lists: &[Vec<TagHash>]) -> CohortId {
        let id = self.buffer.alloc_cohort(wordform);
        let mut readings = Vec::new();
        for list in lists {
            let tags: Vec<TagHash> = list
                .iter()
                .copied()
                .filter(|t| !self.tags.tag(*t).is_some_and(|t| t.kind.contains(TagType::WORDFORM)))
                .collect();
            if !tags.is_empty() {
                readings.push(self.make_reading(wordform, &tags));
            }
        }
        if readings.is_empty() {
            readings.push(self.make_reading(wordform, &[]));
        }
        if let Some(c) = self.buffer.get_mut(id) {
            c.window = window;
            c.dep_self = c.global_number;
            for mut reading in readings {
                record_hit(&mut reading, rule);
                c.append_reading(reading);
            }
        }
        self.refresh_cohort(id);
        id
    }

    fn find_kind(&self, tags: &[TagHash], kind: TagType) -> Option<TagHash> {
        tags.iter().copied().find(|t| self.tags.tag(*t).is_some_and(|t| t.kind.contains(kind)))
    }

    fn same_window(&self, a: CohortId, b: CohortId) -> Option<u32> {
        let (a, b) = (self.buffer.get(a)?, self.buffer.get(b)?);
        if a.window != b.window || b.is_begin() {
            return None;
        }
        Some(a.window)
    }

    /// `root` and its descendants inside `window`, in window order.
    fn subtree_in_window(&self, root: CohortId, window: u32) -> Vec<CohortId> {
        let mut found = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(c) = self.buffer.get(id).filter(|c| c.window == window) else { continue };
            if !found.insert(id) {
                continue;
            }
            stack.extend(c.dep_children.iter().filter_map(|g| self.buffer.by_global(*g)));
        }
        let Some(w) = self.buffer.window(window) else { return vec![root] };
        w.cohorts.iter().copied().filter(|id| found.contains(id)).collect()
    }

    /// Re-point `children` (global numbers) at `parent`.
    fn adopt_children(&mut self, parent: CohortId, children: &[u32]) {
        let parent_global = self.buffer.cohort(parent).global_number;
        for child in children {
            if let Some(c) = self.buffer.by_global(*child).and_then(|id| self.buffer.get_mut(id)) {
                c.dep_parent = Some(parent_global);
            }
        }
        if let Some(p) = self.buffer.get_mut(parent) {
            p.dep_children.extend(children.iter().copied());
        }
    }

    /// Mark a replaced cohort as removed and keep it on `keeper` for tracing.
    fn retire(&mut self, id: CohortId, keeper: CohortId) {
        if let Some(c) = self.buffer.get_mut(id) {
            c.flags |= CohortFlags::REMOVED;
            c.dep_parent = None;
            c.dep_children.clear();
        }
        if let Some(k) = self.buffer.get_mut(keeper) {
            k.removed.push(id);
        }
    }

    /// Renumber after a structural change and move `<<<` to the last cohort.
    pub(crate) fn settle_window(&mut self, window: u32) {
        self.buffer.renumber(window);
        let end = self.grammar.tag_end;
        let Some(ids) = self.buffer.window(window).map(|w| w.cohorts.clone()) else { return };
        let last = ids.len().saturating_sub(1);
        for (i, id) in ids.into_iter().enumerate().skip(1) {
            let Some(cohort) = self.buffer.get_mut(id) else { continue };
            let mut touched = false;
            for reading in cohort.readings.iter_mut() {
                touched |= if i == last { reading.push_tag(end) } else { reading.remove_tag(end).is_some() };
            }
            if touched {
                self.refresh_cohort(id);
            }
        }
    }
}

/// Composite sets contribute the lists of their members.
fn set_lists(grammar: &Grammar, set: SetId) -> Vec<Vec<TagHash>> {
    let s = grammar.set(set);
    if !s.is_composite() {
        return s.lists.clone();
    }
    s.sets.iter().flat_map(|child| set_lists(grammar, *child)).collect()
}

fn record_hit(reading: &mut Reading, rule: RuleId) {
    if !reading.hit_by.contains(&rule) {
        reading.hit_by.push(rule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GrammarBuilder;
    use crate::api::Options;

    struct Fixture {
        grammar: Grammar,
        rule: Rule,
    }

    fn fixture(kind: RuleKind, maplist: &[&str]) -> Fixture {
        let mut g = GrammarBuilder::new();
        let any = g.list("ANY", &["*"]).unwrap();
        let mut rule = Rule::new(kind, any);
        if !maplist.is_empty() {
            let out = g.list("OUT", maplist).unwrap();
            rule = rule.maplist(out);
            if kind.needs_sublist() {
                rule = rule.sublist(out);
            }
        }
        g.list("IN", &["N", "V", "ADJ", "\"<x>\""]).unwrap();
        let id = g.rule(rule).unwrap();
        let grammar = g.build().unwrap();
        let rule = grammar.rule(id).clone();
        Fixture { grammar, rule }
    }

    fn window(ctx: &mut EngineContext<'_>, readings: &[&[&str]]) -> Vec<CohortId> {
        let mut w = ctx.buffer.new_window();
        let number = w.number;
        w.cohorts.push(ctx.new_begin_cohort(number));
        let mut ids = Vec::new();
        for (i, tags) in readings.iter().enumerate() {
            let wf = ctx.tags.intern(&format!("\"<w{i}>\"")).unwrap();
            let id = ctx.buffer.alloc_cohort(wf);
            for t in *tags {
                let hashes: Vec<TagHash> = t.split(' ').filter_map(|x| ctx.tags.intern(x)).collect();
                let reading = ctx.make_reading(wf, &hashes);
                ctx.buffer.cohort_mut(id).append_reading(reading);
            }
            ctx.buffer.cohort_mut(id).window = number;
            ctx.refresh_cohort(id);
            w.cohorts.push(id);
            ids.push(id);
        }
        ctx.buffer.current = Some(w);
        ctx.settle_window(number);
        ids
    }

    fn texts(ctx: &EngineContext<'_>, id: CohortId) -> Vec<String> {
        ctx.buffer
            .cohort(id)
            .readings
            .iter()
            .map(|r| r.tags_list[1..].iter().map(|t| ctx.tags.text(*t)).collect::<Vec<_>>().join(" "))
            .collect()
    }

    fn hit(id: CohortId, readings: &[usize]) -> Hit {
        Hit { cohort: id, readings: readings.to_vec(), other: None }
    }

    #[test]
    fn remove_refuses_to_empty_a_cohort() {
        let f = fixture(RuleKind::Remove, &[]);
        let mut ctx = EngineContext::new(&f.grammar, Options::default());
        let ids = window(&mut ctx, &[&["\"a\" N", "\"a\" V"]]);
        assert!(!ctx.remove(&f.rule, ids[0], &[0, 1]));
        assert_eq!(ctx.buffer.cohort(ids[0]).readings.len(), 2);
        assert!(ctx.remove(&f.rule, ids[0], &[1]));
        assert_eq!(ctx.buffer.cohort(ids[0]).deleted.len(), 1);
        assert!(ctx.buffer.cohort(ids[0]).deleted[0].was_hit_by(f.rule.id));
    }

    #[test]
    fn select_is_a_no_op_when_everything_matched() {
        let f = fixture(RuleKind::Select, &[]);
        let mut ctx = EngineContext::new(&f.grammar, Options::default());
        let ids = window(&mut ctx, &[&["\"a\" N", "\"a\" V"]]);
        let ops = Operands::default();
        assert_eq!(ctx.apply(&f.rule, &hit(ids[0], &[0, 1]), &ops), RunOutcome::empty());
        assert_eq!(ctx.apply(&f.rule, &hit(ids[0], &[1]), &ops), RunOutcome::FIRED);
        assert_eq!(texts(&ctx, ids[0]), vec!["\"a\" V <<<"]);
    }

    #[test]
    fn map_splits_on_several_mapping_tags() {
        let f = fixture(RuleKind::Map, &["@SUBJ", "@OBJ"]);
        let mut ctx = EngineContext::new(&f.grammar, Options::default());
        let ids = window(&mut ctx, &[&["\"a\" N"]]);
        let ops = Operands { maplist: f.grammar.set(f.rule.maplist.unwrap()).lists.clone(), sublist: vec![] };
        assert_eq!(ctx.apply(&f.rule, &hit(ids[0], &[0]), &ops), RunOutcome::FIRED);
        assert_eq!(texts(&ctx, ids[0]), vec!["\"a\" N <<< @SUBJ", "\"a\" N <<< @OBJ"]);
        assert!(ctx.buffer.cohort(ids[0]).readings.iter().all(|r| r.mapped && r.was_hit_by(f.rule.id)));
    }

    #[test]
    fn unmaplast_strips_one_mapping_tag_once() {
        let mut f = fixture(RuleKind::Unmap, &[]);
        f.rule.flags |= RuleFlags::UNMAPLAST;
        let mut ctx = EngineContext::new(&f.grammar, Options::default());
        let ids = window(&mut ctx, &[&["\"a\" N @SUBJ @OBJ"]]);
        assert!(ctx.unmap(&f.rule, &hit(ids[0], &[0])));
        assert_eq!(texts(&ctx, ids[0]), vec!["\"a\" N @SUBJ <<<"]);
        assert!(!ctx.unmap(&f.rule, &hit(ids[0], &[0])));

        f.rule.flags = RuleFlags::empty();
        assert!(ctx.unmap(&f.rule, &hit(ids[0], &[0])));
        assert_eq!(texts(&ctx, ids[0]), vec!["\"a\" N <<<"]);
    }

    #[test]
    fn replace_keeps_wordform_baseform_and_markers() {
        let f = fixture(RuleKind::Replace, &["V", "PL"]);
        let mut ctx = EngineContext::new(&f.grammar, Options::default());
        let ids = window(&mut ctx, &[&["\"a\" N SG"]]);
        let v = ctx.tags.lookup("V").unwrap();
        let pl = ctx.tags.lookup("PL").unwrap();
        assert!(ctx.replace(&f.rule, &hit(ids[0], &[0]), &[v, pl, v]));
        assert_eq!(texts(&ctx, ids[0]), vec!["\"a\" V PL <<<"]);
        assert!(!ctx.replace(&f.rule, &hit(ids[0], &[0]), &[v, pl]));

        let b = ctx.tags.intern("\"b\"").unwrap();
        assert!(ctx.replace(&f.rule, &hit(ids[0], &[0]), &[b, v]));
        assert_eq!(texts(&ctx, ids[0]), vec!["\"b\" V <<<"]);
    }

    #[test]
    fn substitute_keeps_the_position_of_the_first_removed_tag() {
        let f = fixture(RuleKind::Substitute, &["ADJ"]);
        let mut ctx = EngineContext::new(&f.grammar, Options::default());
        let ids = window(&mut ctx, &[&["\"a\" N SG"]]);
        let n = ctx.tags.lookup("N").unwrap();
        let adj = ctx.tags.lookup("ADJ").unwrap();
        assert!(ctx.substitute(&f.rule, &hit(ids[0], &[0]), &[n], &[adj]));
        assert_eq!(texts(&ctx, ids[0]), vec!["\"a\" ADJ SG <<<"]);
        assert!(!ctx.substitute(&f.rule, &hit(ids[0], &[0]), &[n], &[adj]));
    }

    #[test]
    fn remcohort_reattaches_children_and_moves_the_end_tag() {
        let f = fixture(RuleKind::RemCohort, &[]);
        let mut ctx = EngineContext::new(&f.grammar, Options::default());
        let ids = window(&mut ctx, &[&["\"a\" N"], &["\"b\" V"], &["\"c\" N"]]);
        assert!(ctx.attach(ids[2], ids[1], RuleFlags::empty()));
        assert!(ctx.attach(ids[1], ids[0], RuleFlags::empty()));
        assert!(ctx.remove_cohort(ids[1]));
        let head = ctx.buffer.cohort(ids[0]).global_number;
        assert_eq!(ctx.buffer.cohort(ids[2]).dep_parent, Some(head));
        assert!(ctx.buffer.cohort(ids[1]).is_removed());
        assert_eq!(ctx.buffer.cohort(ids[0]).removed, vec![ids[1]]);
        assert_eq!(texts(&ctx, ids[2]), vec!["\"c\" N <<<"]);

        assert!(ctx.remove_cohort(ids[2]));
        assert_eq!(texts(&ctx, ids[0]), vec!["\"a\" N <<<"]);
        assert!(!ctx.remove_cohort(ids[0]));
    }

    #[test]
    fn delimit_queues_the_tail_as_a_new_window() {
        let f = fixture(RuleKind::Delimit, &[]);
        let mut ctx = EngineContext::new(&f.grammar, Options::default());
        let ids = window(&mut ctx, &[&["\"a\" N"], &["\"b\" V"], &["\"c\" N"]]);
        assert!(ctx.delimit(ids[0]));
        assert!(!ctx.delimit(ids[0]));
        let current = ctx.buffer.current.as_ref().unwrap();
        assert_eq!(current.cohorts.len(), 2);
        let split = &ctx.buffer.next[0];
        assert_eq!(split.cohorts[1..], ids[1..]);
        assert_eq!(ctx.buffer.cohort(ids[1]).local_number, 1);
        assert_eq!(texts(&ctx, ids[0]), vec!["\"a\" N <<<"]);
        assert_eq!(texts(&ctx, ids[1]), vec!["\"b\" V"]);
    }

    #[test]
    fn variables_record_their_window() {
        let f = fixture(RuleKind::SetVariable, &["VAR:mode=fast"]);
        let mut ctx = EngineContext::new(&f.grammar, Options::default());
        let ids = window(&mut ctx, &[&["\"a\" N"]]);
        let ops = Operands { maplist: f.grammar.set(f.rule.maplist.unwrap()).lists.clone(), sublist: vec![] };
        assert!(ctx.set_variable(ids[0], &ops));
        assert!(!ctx.set_variable(ids[0], &ops));
        let key = hash_text("mode", 0);
        assert_eq!(ctx.variables.get(&key), Some(&Some(hash_text("fast", 0))));
        assert!(ctx.buffer.current.as_ref().unwrap().variables_set.contains_key(&key));
        assert!(ctx.rem_variable(ids[0], &ops));
        assert!(ctx.variables.is_empty());
    }
}
