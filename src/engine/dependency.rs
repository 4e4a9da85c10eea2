//! Dependency trees, relations and enclosures.
//!
//! Links are stored on the cohorts by global number (`dep_parent`,
//! `dep_children`, `relations`), so they survive window shifts and stop
//! resolving once the other end has been flushed.
//!
//! ## Invariants
//!
//! - `dep_children` of a cohort always mirrors the `dep_parent` of its
//!   children; `attach` and `detach` keep both sides in step.
//! - An attachment that would create a cycle (unless loops are allowed) or
//!   cross an existing arc (when crossing is forbidden) is refused and logged.

use crate::grammar::{RuleFlags, RuleKind};
use crate::{CohortId, DEP_ROOT, TagHash};

use super::context::EngineContext;
use crate::window::CohortFlags;
use std::collections::BTreeSet;

/// A `R:label:n` input tag waiting for its window to close, when every `ID:n`
/// of the window is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRelation {
    pub from: CohortId,
    pub label: TagHash,
    pub to_input: u32,
}

impl EngineContext<'_> {
    // --- Dependency edits -----------------------------------------------------

    /// Make `parent` the dependency parent of `child`. Returns whether
    /// anything changed.
    pub(crate) fn attach(&mut self, child: CohortId, parent: CohortId, flags: RuleFlags) -> bool {
        let (Some(c), Some(p)) = (self.buffer.get(child), self.buffer.get(parent)) else { return false };
        let (child_global, parent_global) = (c.global_number, p.global_number);
        if child == parent {
            tracing::warn!(cohort = child_global, "refusing to attach a cohort to itself");
            return false;
        }
        if c.dep_parent == Some(parent_global) {
            return false;
        }
        let allow_loops = self.options.dep_allow_loops || flags.contains(RuleFlags::ALLOWLOOP);
        if !allow_loops && self.would_loop(child_global, parent) {
            tracing::warn!(child = child_global, parent = parent_global, "attachment would create a dependency loop");
            return false;
        }
        let no_crossing = self.options.dep_no_crossing && !flags.contains(RuleFlags::ALLOWCROSS);
        if no_crossing && self.would_cross(child, parent) {
            tracing::warn!(child = child_global, parent = parent_global, "attachment would cross an existing arc");
            return false;
        }
        self.detach(child);
        if let Some(c) = self.buffer.get_mut(child) {
            c.dep_parent = Some(parent_global);
        }
        if let Some(p) = self.buffer.get_mut(parent) {
            p.dep_children.insert(child_global);
        }
        true
    }

    /// Remove `child` from its parent's children and clear its parent.
    pub(crate) fn detach(&mut self, child: CohortId) {
        let Some(c) = self.buffer.get_mut(child) else { return };
        let child_global = c.global_number;
        let Some(old) = c.dep_parent.take() else { return };
        if old == DEP_ROOT {
            return;
        }
        if let Some(p) = self.buffer.by_global(old).and_then(|id| self.buffer.get_mut(id)) {
            p.dep_children.remove(&child_global);
        }
    }

    /// Walking up from `parent` reaches `child_global`.
    fn would_loop(&self, child_global: u32, parent: CohortId) -> bool {
        let mut seen = BTreeSet::new();
        let mut at = self.buffer.get(parent);
        while let Some(cohort) = at {
            if cohort.global_number == child_global {
                return true;
            }
            if !seen.insert(cohort.global_number) {
                return false;
            }
            at = cohort
                .dep_parent
                .filter(|p| *p != DEP_ROOT)
                .and_then(|p| self.buffer.by_global(p))
                .and_then(|id| self.buffer.get(id));
        }
        false
    }

    /// The arc `child → parent` would cross another arc of the same window.
    fn would_cross(&self, child: CohortId, parent: CohortId) -> bool {
        let (Some(c), Some(p)) = (self.buffer.get(child), self.buffer.get(parent)) else { return false };
        if c.window != p.window {
            return false;
        }
        let Some(window) = self.buffer.window(c.window) else { return false };
        let (lo, hi) = (c.local_number.min(p.local_number), c.local_number.max(p.local_number));
        let inside = |x: u32| lo < x && x < hi;
        let outside = |x: u32| x < lo || hi < x;
        for id in window.cohorts.iter().skip(1) {
            if *id == child {
                continue;
            }
            let Some(other) = self.buffer.get(*id) else { continue };
            let Some(head) = other.dep_parent.filter(|g| *g != DEP_ROOT).and_then(|g| self.buffer.by_global(g)) else {
                continue;
            };
            let Some(head) = self.buffer.get(head).filter(|h| h.window == c.window) else { continue };
            let (x, y) = (other.local_number, head.local_number);
            if (inside(x) && outside(y)) || (outside(x) && inside(y)) {
                return true;
            }
        }
        false
    }

    // --- Relations ------------------------------------------------------------

    /// Apply a relation rule between two cohorts. `reverse` labels the
    /// opposite edge of the two-way kinds.
    pub(crate) fn relate(
        &mut self,
        kind: RuleKind,
        from: CohortId,
        to: CohortId,
        label: TagHash,
        reverse: Option<TagHash>,
    ) -> bool {
        let (Some(a), Some(b)) = (self.buffer.get(from), self.buffer.get(to)) else { return false };
        let (from_global, to_global) = (a.global_number, b.global_number);
        let two_way = matches!(kind, RuleKind::AddRelations | RuleKind::SetRelations | RuleKind::RemRelations);
        let edit = |cohort: &mut crate::window::Cohort, label: TagHash, target: u32| match kind {
            RuleKind::AddRelation | RuleKind::AddRelations => cohort.add_relation(label, target),
            RuleKind::SetRelation | RuleKind::SetRelations => cohort.set_relation(label, target),
            RuleKind::RemRelation | RuleKind::RemRelations => cohort.remove_relation(label, target),
            _ => false,
        };
        let mut changed = self.buffer.get_mut(from).is_some_and(|c| edit(c, label, to_global));
        if two_way {
            let back = reverse.unwrap_or(label);
            changed |= self.buffer.get_mut(to).is_some_and(|c| edit(c, back, from_global));
        }
        changed
    }

    // --- Window close ---------------------------------------------------------

    /// Turn input dependency numbers into global numbers and fill in the
    /// children sets.
    pub(crate) fn reflow_dependencies(&mut self, window: u32) {
        let Some(w) = self.buffer.window(window) else { return };
        let ids = w.cohorts.clone();
        let dep_map = w.dep_map.clone();
        let mut edges = Vec::new();
        for id in ids {
            let Some(cohort) = self.buffer.get_mut(id) else { continue };
            cohort.dep_self = cohort.global_number;
            if !cohort.flags.contains(CohortFlags::DEP_INPUT) {
                continue;
            }
            cohort.dep_parent = match cohort.dep_parent {
                Some(DEP_ROOT) => Some(DEP_ROOT),
                Some(input) => match dep_map.get(&input) {
                    Some(global) => Some(*global),
                    None => {
                        tracing::warn!(
                            cohort = cohort.global_number,
                            parent = input,
                            "dependency parent not found in window, ignoring it"
                        );
                        None
                    }
                },
                None => None,
            };
            if let Some(parent) = cohort.dep_parent.filter(|p| *p != DEP_ROOT) {
                edges.push((cohort.global_number, parent));
            }
        }
        for (child, parent) in edges {
            if let Some(p) = self.buffer.by_global(parent).and_then(|id| self.buffer.get_mut(id)) {
                p.dep_children.insert(child);
            }
        }
    }

    /// Create the relations named by `R:label:n` input tags.
    pub(crate) fn resolve_relations(&mut self, window: u32, pending: Vec<PendingRelation>) {
        let Some(w) = self.buffer.window(window) else { return };
        let map = w.relation_map.clone();
        for rel in pending {
            let Some(target) = map.get(&rel.to_input) else {
                tracing::warn!(relation = rel.to_input, "relation target not found in window, ignoring it");
                continue;
            };
            if let Some(c) = self.buffer.get_mut(rel.from) {
                c.add_relation(rel.label, *target);
            }
        }
    }

    /// Compute enclosure depth and parents from the parenthesis cohorts.
    /// Parentheses sit at the outer depth, the cohorts between them one
    /// deeper.
    pub(crate) fn annotate_enclosures(&mut self, window: u32) {
        let Some(w) = self.buffer.window(window) else { return };
        let ids = w.cohorts.clone();
        let mut open: Vec<u32> = Vec::new();
        for id in ids {
            let Some(cohort) = self.buffer.get_mut(id) else { continue };
            if cohort.is_pright && !cohort.is_pleft {
                open.pop();
            }
            cohort.encl_depth = open.len() as u32;
            cohort.encl_parent = open.last().copied();
            if cohort.is_pleft && !cohort.is_pright {
                open.push(cohort.global_number);
            }
        }
    }
}
