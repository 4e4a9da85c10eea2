//! Contextual tests: resolve the cohorts a test looks at, then decide.
//!
//! ```text
//! run_test(id, anchor)                 stats + trace
//!   └─ eval(test, anchor)
//!        ├─ tmpl ─► template (optionally re-positioned), then own LINK
//!        ├─ ors  ─► each alternative, then own LINK from its result
//!        └─ plain
//!             ├─ candidates: window offset / scan, absolute, dependency,
//!             │              relation, enclosure (barriers cut here)
//!             ├─ NOT / ALL / NONE / exists over the candidates
//!             └─ settle: marks, then LINK from the found cohort
//! ```
//!
//! A test returns the cohort the chain ended on, so callers can re-anchor on
//! it. `None` is failure.
//!
//! ## Invariants
//!
//! - `barrier` is checked before the target and stops before its cohort;
//!   `cbarrier` is a careful match checked after the target and stops after
//!   its cohort.
//! - `NOT` inverts only the node's own target match; `NEGATE` inverts the
//!   node together with its linked chain.
//! - Window crossing only happens with a span flag or `always_span`.

use crate::grammar::{
    ContextualTest, DepAxis, DepDepth, DepStep, EnclosureEdge, OriginPassing, Pick, Quantifier, Scan, Side,
    Traversal,
};
use crate::window::Reading;
use crate::{CohortId, ContextId};

use super::context::Matcher;
use super::match_set::CohortMatch;
use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

/// A window position: window number and index into its cohort list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    window: u32,
    index: usize,
}

/// One direction of an in-progress window scan.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    at: Slot,
    step: i32,
}

/// Candidate cohorts of one test, produced lazily for window scans.
enum Candidates {
    List(VecDeque<CohortId>),
    Scan { first: Option<Slot>, cursors: [Option<Cursor>; 2], turn: usize },
}

impl Matcher<'_, '_> {
    /// Evaluate a contextual test from `anchor`. Returns the cohort the test
    /// (and its linked chain) ended on.
    pub(crate) fn run_test(&mut self, id: ContextId, anchor: CohortId) -> Option<CohortId> {
        let grammar = self.grammar;
        let test = grammar.context(id);
        let started = self.stats.is_some().then(Instant::now);
        let found = self.eval(test, anchor);
        if let (Some(stats), Some(started)) = (self.stats.as_deref_mut(), started) {
            if let Some(s) = stats.contexts.get_mut(id.index()) {
                s.count(found.is_some(), started.elapsed());
            }
        }
        tracing::trace!(
            context = id.0,
            line = test.line,
            anchor = anchor.0,
            found = ?found.map(|c| c.0),
            "contextual test"
        );
        found
    }

    fn eval(&mut self, test: &ContextualTest, anchor: CohortId) -> Option<CohortId> {
        if let Some(tmpl) = test.tmpl {
            return self.eval_template(test, tmpl, anchor);
        }
        let anchor = if test.position.jump_mark { self.state.mark.unwrap_or(anchor) } else { anchor };
        let found = if test.ors.is_empty() { self.eval_plain(test, anchor) } else { self.eval_ors(test, anchor) };
        if !test.position.negate {
            return found;
        }
        match found {
            Some(_) => None,
            None => Some(anchor),
        }
    }

    fn eval_template(&mut self, test: &ContextualTest, tmpl: ContextId, anchor: CohortId) -> Option<CohortId> {
        let grammar = self.grammar;
        let template = grammar.context(tmpl);
        let found = if test.position.tmpl_override && template.ors.is_empty() {
            let mut local = template.clone();
            local.position = test.position;
            local.position.tmpl_override = false;
            local.offset = test.offset;
            local.offset_sub = test.offset_sub;
            self.eval(&local, anchor)
        } else {
            self.run_test(tmpl, anchor)
        }?;
        match test.linked {
            Some(linked) => self.run_test(linked, found),
            None => Some(found),
        }
    }

    fn eval_ors(&mut self, test: &ContextualTest, anchor: CohortId) -> Option<CohortId> {
        for alternative in &test.ors {
            let Some(found) = self.run_test(*alternative, anchor) else { continue };
            match test.linked {
                None => return Some(found),
                Some(linked) => {
                    if let Some(end) = self.run_test(linked, found) {
                        return Some(end);
                    }
                }
            }
        }
        None
    }

    fn eval_plain(&mut self, test: &ContextualTest, anchor: CohortId) -> Option<CohortId> {
        let target = test.target?;
        if test.position.traversal == Traversal::BagOfTags {
            return self.eval_bag_of_tags(test, anchor);
        }
        let pos = test.position;
        let how = CohortMatch {
            careful: pos.careful,
            sub: test.offset_sub,
            deleted: pos.look_deleted || self.state.look_deleted,
            delayed: pos.look_delayed || self.state.look_delayed,
        };
        let mut candidates = self.candidates(test, anchor);

        if pos.not {
            let mut last = None;
            while let Some(c) = self.next_candidate(test, &mut candidates) {
                if self.cohort_matches(c, target, how) {
                    return None;
                }
                last = Some(c);
            }
            return match last {
                Some(c) => self.settle(test, c),
                None => Some(self.begin_of(anchor)),
            };
        }

        match pos.quantifier {
            Quantifier::Exists => {
                while let Some(c) = self.next_candidate(test, &mut candidates) {
                    if !self.cohort_matches(c, target, how) {
                        continue;
                    }
                    if let Some(end) = self.settle(test, c) {
                        return Some(end);
                    }
                    if pos.scan == Scan::First {
                        return None;
                    }
                }
                None
            }
            Quantifier::All => {
                let mut last = None;
                while let Some(c) = self.next_candidate(test, &mut candidates) {
                    if !self.cohort_matches(c, target, how) {
                        return None;
                    }
                    last = Some(c);
                }
                self.settle(test, last?)
            }
            Quantifier::None => {
                let mut last = None;
                while let Some(c) = self.next_candidate(test, &mut candidates) {
                    if self.cohort_matches(c, target, how) {
                        let linked = match test.linked {
                            Some(linked) => self.run_test(linked, c).is_some(),
                            None => true,
                        };
                        if linked {
                            return None;
                        }
                    }
                    last = Some(c);
                }
                Some(last.unwrap_or_else(|| self.begin_of(anchor)))
            }
        }
    }

    /// Record marks for a found cohort, then follow the LINK.
    fn settle(&mut self, test: &ContextualTest, found: CohortId) -> Option<CohortId> {
        if test.position.set_mark {
            self.state.mark = Some(found);
        }
        if test.position.attach_to {
            self.state.attach_to = Some(found);
        }
        match test.linked {
            Some(linked) => self.run_test(linked, found),
            None => Some(found),
        }
    }

    /// Match the target set against every tag of the anchor's window at once.
    fn eval_bag_of_tags(&mut self, test: &ContextualTest, anchor: CohortId) -> Option<CohortId> {
        let target = test.target?;
        let buffer = self.buffer;
        let cohort = buffer.get(anchor)?;
        let window = buffer.window(cohort.window)?;
        let mut bag = Reading::new(cohort.wordform);
        for id in &window.cohorts {
            let Some(other) = buffer.get(*id) else { continue };
            for reading in other.all_readings(test.position.look_deleted, test.position.look_delayed) {
                for tag in reading.chain().flat_map(|r| r.tags_list.iter()) {
                    bag.push_tag(*tag);
                }
            }
        }
        bag.rehash(self.tags);
        let matched = self.eval_set(cohort, &bag, target);
        if matched == test.position.not {
            return None;
        }
        self.settle(test, anchor)
    }

    // --- Candidates -----------------------------------------------------------

    fn candidates(&mut self, test: &ContextualTest, anchor: CohortId) -> Candidates {
        let pos = test.position;
        match pos.traversal {
            Traversal::Window | Traversal::Absolute => {
                let start = match pos.traversal {
                    Traversal::Absolute => self.absolute_slot(anchor, test.offset),
                    _ => self.offset_slot(test, anchor, test.offset),
                };
                let Some(start) = start else { return Candidates::List(VecDeque::new()) };
                if pos.scan == Scan::Exact {
                    let single: VecDeque<CohortId> = self.cohort_at(start).into_iter().collect();
                    return Candidates::List(single);
                }
                let cursors = match (pos.traversal, test.offset.signum()) {
                    (Traversal::Window, 0) => {
                        [Some(Cursor { at: start, step: 1 }), Some(Cursor { at: start, step: -1 })]
                    }
                    (Traversal::Absolute, sign) if sign < 0 => [Some(Cursor { at: start, step: -1 }), None],
                    (Traversal::Absolute, _) => [Some(Cursor { at: start, step: 1 }), None],
                    (_, sign) => [Some(Cursor { at: start, step: sign }), None],
                };
                Candidates::Scan { first: Some(start), cursors, turn: 0 }
            }
            Traversal::Dependency(step) => Candidates::List(self.dependency_candidates(test, step, anchor)),
            Traversal::Relation => Candidates::List(self.relation_candidates(test, anchor)),
            Traversal::Enclosure(edge) => {
                Candidates::List(self.enclosure_candidate(edge, anchor).into_iter().collect())
            }
            Traversal::BagOfTags => Candidates::List(VecDeque::new()),
        }
    }

    fn next_candidate(&mut self, test: &ContextualTest, candidates: &mut Candidates) -> Option<CohortId> {
        match candidates {
            Candidates::List(list) => list.pop_front(),
            Candidates::Scan { first, cursors, turn } => {
                if let Some(slot) = first.take() {
                    let id = self.cohort_at(slot)?;
                    match self.barrier_at(test, id) {
                        Stop::Before => {
                            *cursors = [None, None];
                            return None;
                        }
                        Stop::After => *cursors = [None, None],
                        Stop::No => {}
                    }
                    return Some(id);
                }
                loop {
                    let k = if cursors[*turn].is_some() { *turn } else { 1 - *turn };
                    let cursor = cursors[k]?;
                    *turn = 1 - k;
                    let Some(next) = self.scan_step(test, cursor.at, cursor.step) else {
                        cursors[k] = None;
                        continue;
                    };
                    let Some(id) = self.cohort_at(next) else {
                        cursors[k] = None;
                        continue;
                    };
                    if test.position.origin == OriginPassing::NoPass && self.state.origin == Some(id) {
                        cursors[k] = None;
                        continue;
                    }
                    match self.barrier_at(test, id) {
                        Stop::Before => {
                            cursors[k] = None;
                            continue;
                        }
                        Stop::After => cursors[k] = None,
                        Stop::No => cursors[k] = Some(Cursor { at: next, step: cursor.step }),
                    }
                    return Some(id);
                }
            }
        }
    }

    fn barrier_at(&mut self, test: &ContextualTest, id: CohortId) -> Stop {
        if self.options.ignore_barriers {
            return Stop::No;
        }
        let how = CohortMatch {
            careful: false,
            sub: test.offset_sub,
            deleted: test.position.look_deleted,
            delayed: test.position.look_delayed,
        };
        if let Some(barrier) = test.barrier {
            if self.cohort_matches(id, barrier, how) {
                return Stop::Before;
            }
        }
        if let Some(cbarrier) = test.cbarrier {
            if self.cohort_matches(id, cbarrier, CohortMatch { careful: true, ..how }) {
                return Stop::After;
            }
        }
        Stop::No
    }

    // --- Window positions -----------------------------------------------------

    fn slot_of(&self, id: CohortId) -> Option<Slot> {
        let cohort = self.buffer.get(id)?;
        let window = self.buffer.window(cohort.window)?;
        let local = cohort.local_number as usize;
        let index = if window.cohorts.get(local) == Some(&id) { local } else { window.position(id)? };
        Some(Slot { window: window.number, index })
    }

    fn cohort_at(&self, slot: Slot) -> Option<CohortId> {
        self.buffer.window(slot.window)?.cohorts.get(slot.index).copied()
    }

    fn begin_of(&self, anchor: CohortId) -> CohortId {
        self.slot_of(anchor)
            .and_then(|s| self.cohort_at(Slot { window: s.window, index: 0 }))
            .unwrap_or(anchor)
    }

    fn may_span(&self, test: &ContextualTest, step: i32) -> bool {
        self.options.always_span || if step > 0 { test.position.span_right } else { test.position.span_left }
    }

    /// The slot `offset` cohorts away from the anchor. Overflowing a window
    /// continues in its neighbour, begin cohort included.
    fn offset_slot(&self, test: &ContextualTest, anchor: CohortId, offset: i32) -> Option<Slot> {
        let start = self.slot_of(anchor)?;
        let mut window = self.buffer.window(start.window)?;
        let mut pos = start.index as i64 + offset as i64;
        loop {
            let len = window.len() as i64;
            if (0..len).contains(&pos) {
                return Some(Slot { window: window.number, index: pos as usize });
            }
            if pos >= len {
                if !self.may_span(test, 1) {
                    return None;
                }
                window = self.buffer.neighbor(window.number, 1)?;
                pos -= len;
            } else {
                if !self.may_span(test, -1) {
                    return None;
                }
                window = self.buffer.neighbor(window.number, -1)?;
                pos += window.len() as i64;
            }
        }
    }

    /// `@n` is index `n` of the anchor's window, `@-n` counts from its end.
    fn absolute_slot(&self, anchor: CohortId, offset: i32) -> Option<Slot> {
        let start = self.slot_of(anchor)?;
        let len = self.buffer.window(start.window)?.len() as i64;
        let index = if offset < 0 { len + offset as i64 } else { offset as i64 };
        if (0..len).contains(&index) { Some(Slot { window: start.window, index: index as usize }) } else { None }
    }

    /// One scan step. Left scans reach the begin cohort; crossing to the right
    /// skips the next window's begin cohort.
    fn scan_step(&self, test: &ContextualTest, at: Slot, step: i32) -> Option<Slot> {
        let window = self.buffer.window(at.window)?;
        if step > 0 {
            if at.index + 1 < window.len() {
                return Some(Slot { window: at.window, index: at.index + 1 });
            }
            if !self.may_span(test, 1) {
                return None;
            }
            let next = self.buffer.neighbor(at.window, 1)?;
            (next.len() > 1).then_some(Slot { window: next.number, index: 1 })
        } else {
            if at.index > 0 {
                return Some(Slot { window: at.window, index: at.index - 1 });
            }
            if !self.may_span(test, -1) {
                return None;
            }
            let prev = self.buffer.neighbor(at.window, -1)?;
            prev.len().checked_sub(1).map(|index| Slot { window: prev.number, index })
        }
    }

    // --- Dependency, relations, enclosures -------------------------------------

    /// A live cohort by global number, if a test from `anchor` may reach it.
    fn reachable(&self, test: &ContextualTest, anchor_window: u32, global: u32) -> Option<CohortId> {
        let id = self.buffer.by_global(global)?;
        let cohort = self.buffer.get(id)?;
        if cohort.is_removed() {
            return None;
        }
        if cohort.window == anchor_window {
            return Some(id);
        }
        let step = if self.buffer.order(cohort.window) > self.buffer.order(anchor_window) { 1 } else { -1 };
        self.may_span(test, step).then_some(id)
    }

    fn parent_of(&self, test: &ContextualTest, anchor_window: u32, id: CohortId) -> Option<CohortId> {
        let parent = self.buffer.get(id)?.dep_parent?;
        self.reachable(test, anchor_window, parent)
    }

    fn children_of(&self, test: &ContextualTest, anchor_window: u32, id: CohortId) -> Vec<CohortId> {
        let Some(cohort) = self.buffer.get(id) else { return Vec::new() };
        cohort.dep_children.iter().filter_map(|g| self.reachable(test, anchor_window, *g)).collect()
    }

    fn is_barrier(&mut self, test: &ContextualTest, step: DepStep, id: CohortId) -> Stop {
        if step.depth == DepDepth::Global {
            return Stop::No;
        }
        self.barrier_at(test, id)
    }

    fn dependency_candidates(&mut self, test: &ContextualTest, step: DepStep, anchor: CohortId) -> VecDeque<CohortId> {
        let Some(anchor_cohort) = self.buffer.get(anchor) else { return VecDeque::new() };
        let window = anchor_cohort.window;
        let mut out = Vec::new();
        if step.include_self {
            out.push(anchor);
        }
        match step.axis {
            DepAxis::Parent => {
                let mut seen = BTreeSet::from([anchor]);
                let mut at = anchor;
                while let Some(parent) = self.parent_of(test, window, at) {
                    if !seen.insert(parent) {
                        break;
                    }
                    if step.depth == DepDepth::Direct {
                        out.push(parent);
                        break;
                    }
                    match self.is_barrier(test, step, parent) {
                        Stop::Before => break,
                        Stop::After => {
                            out.push(parent);
                            break;
                        }
                        Stop::No => out.push(parent),
                    }
                    at = parent;
                }
            }
            DepAxis::Child => {
                let mut seen = BTreeSet::from([anchor]);
                let mut queue = VecDeque::from([anchor]);
                while let Some(at) = queue.pop_front() {
                    for child in self.children_of(test, window, at) {
                        if !seen.insert(child) {
                            continue;
                        }
                        if step.depth == DepDepth::Direct {
                            out.push(child);
                            continue;
                        }
                        match self.is_barrier(test, step, child) {
                            Stop::Before => continue,
                            Stop::After => out.push(child),
                            Stop::No => {
                                out.push(child);
                                queue.push_back(child);
                            }
                        }
                    }
                }
            }
            DepAxis::Sibling => {
                if let Some(parent) = self.parent_of(test, window, anchor) {
                    out.extend(self.children_of(test, window, parent).into_iter().filter(|c| *c != anchor));
                }
            }
        }
        self.side_and_pick(test, anchor, out)
    }

    fn relation_candidates(&mut self, test: &ContextualTest, anchor: CohortId) -> VecDeque<CohortId> {
        let Some(cohort) = self.buffer.get(anchor) else { return VecDeque::new() };
        let window = cohort.window;
        let out: Vec<CohortId> =
            cohort.related(test.relation).into_iter().filter_map(|g| self.reachable(test, window, g)).collect();
        self.side_and_pick(test, anchor, out)
    }

    fn side_and_pick(&self, test: &ContextualTest, anchor: CohortId, mut out: Vec<CohortId>) -> VecDeque<CohortId> {
        let key = |id: &CohortId| self.buffer.get(*id).map(|c| (self.buffer.order(c.window), c.local_number));
        let anchor_key = key(&anchor);
        match test.position.side {
            Side::Both => {}
            Side::Left => out.retain(|c| *c == anchor || key(c) < anchor_key),
            Side::Right => out.retain(|c| *c == anchor || key(c) > anchor_key),
        }
        match test.position.pick {
            Pick::Each => out.into(),
            Pick::Leftmost => out.iter().copied().min_by_key(key).into_iter().collect(),
            Pick::Rightmost => out.iter().copied().max_by_key(key).into_iter().collect(),
        }
    }

    /// Left: the opening parenthesis around the anchor. Right: the matching
    /// closing one.
    fn enclosure_candidate(&self, edge: EnclosureEdge, anchor: CohortId) -> Option<CohortId> {
        let cohort = self.buffer.get(anchor)?;
        if cohort.encl_depth == 0 {
            return None;
        }
        match edge {
            EnclosureEdge::Left => self.buffer.by_global(cohort.encl_parent?),
            EnclosureEdge::Right => {
                let depth = cohort.encl_depth - 1;
                let slot = self.slot_of(anchor)?;
                let window = self.buffer.window(slot.window)?;
                window.cohorts[slot.index + 1..]
                    .iter()
                    .copied()
                    .find(|id| self.buffer.get(*id).is_some_and(|c| c.is_pright && c.encl_depth == depth))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    No,
    /// `BARRIER`: stop, excluding the cohort.
    Before,
    /// `CBARRIER`: stop, including the cohort.
    After,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Options;
    use crate::engine::context::{EngineContext, MatchState};
    use crate::grammar::{Grammar, GrammarBuilder, RuleFlags};
    use crate::{SetId, TagHash};

    /// Queue a window and make it current; the old current window moves to
    /// the look-behind. Each cohort is `"base" TAGS | "base" TAGS`. Index 0
    /// of the result is the begin cohort.
    fn window(ctx: &mut EngineContext<'_>, cohorts: &[&str]) -> Vec<CohortId> {
        let mut w = ctx.buffer.new_window();
        let number = w.number;
        w.cohorts.push(ctx.new_begin_cohort(number));
        for (i, text) in cohorts.iter().enumerate() {
            let wf = ctx.tags.intern(&format!("\"<w{number}.{i}>\"")).unwrap();
            let id = ctx.buffer.alloc_cohort(wf);
            for reading in text.split(" | ") {
                let tags: Vec<TagHash> = reading.split(' ').filter_map(|t| ctx.tags.intern(t)).collect();
                let reading = ctx.make_reading(wf, &tags);
                ctx.buffer.cohort_mut(id).append_reading(reading);
            }
            ctx.buffer.cohort_mut(id).window = number;
            ctx.refresh_cohort(id);
            w.cohorts.push(id);
        }
        let ids = w.cohorts.clone();
        ctx.buffer.next.push_back(w);
        ctx.buffer.shift();
        ctx.buffer.renumber(number);
        ids
    }

    fn run(ctx: &mut EngineContext<'_>, test: ContextId, anchor: CohortId) -> Option<CohortId> {
        let mut state = MatchState::for_target(anchor, None);
        ctx.matcher(&mut state).run_test(test, anchor)
    }

    struct Pos {
        det: SetId,
        n: SetId,
        v: SetId,
        adj: SetId,
        adv: SetId,
    }

    fn pos(g: &mut GrammarBuilder) -> Pos {
        Pos {
            det: g.list("DET", &["DET"]).unwrap(),
            n: g.list("N", &["N"]).unwrap(),
            v: g.list("V", &["V"]).unwrap(),
            adj: g.list("ADJ", &["ADJ"]).unwrap(),
            adv: g.list("ADV", &["ADV"]).unwrap(),
        }
    }

    fn context(grammar: &Grammar) -> EngineContext<'_> {
        EngineContext::new(grammar, Options::default())
    }

    #[test]
    fn barrier_excludes_and_cbarrier_needs_a_careful_match() {
        let mut g = GrammarBuilder::new();
        let p = pos(&mut g);
        let barrier = g.context(ContextualTest::scan(-1, p.det).barrier(p.n)).unwrap();
        let cbarrier = g.context(ContextualTest::scan(-1, p.det).cbarrier(p.n)).unwrap();
        let through = g.context(ContextualTest::scan(-1, p.n).cbarrier(p.n)).unwrap();
        let grammar = g.build().unwrap();
        let mut ctx = context(&grammar);

        let ambiguous = window(&mut ctx, &["\"the\" DET", "\"old\" ADJ | \"old\" N", "\"walk\" V"]);
        assert_eq!(run(&mut ctx, barrier, ambiguous[3]), None);
        assert_eq!(run(&mut ctx, cbarrier, ambiguous[3]), Some(ambiguous[1]));

        let settled = window(&mut ctx, &["\"the\" DET", "\"man\" N", "\"walk\" V"]);
        assert_eq!(run(&mut ctx, barrier, settled[3]), None);
        assert_eq!(run(&mut ctx, cbarrier, settled[3]), None);
        assert_eq!(run(&mut ctx, through, settled[3]), Some(settled[2]));
    }

    #[test]
    fn quantifiers_and_negation() {
        let mut g = GrammarBuilder::new();
        let p = pos(&mut g);
        let all_n = g.context(ContextualTest::scan(1, p.n).all()).unwrap();
        let all_v = g.context(ContextualTest::scan(1, p.v).all()).unwrap();
        let none_v = g.context(ContextualTest::scan(1, p.v).none()).unwrap();
        let none_n = g.context(ContextualTest::scan(1, p.n).none()).unwrap();
        let verb_next = g.context(ContextualTest::at(1, p.v)).unwrap();
        let noun_then_verb = g.context(ContextualTest::at(1, p.n).link(verb_next)).unwrap();
        let negated = g.context(ContextualTest::at(1, p.n).link(verb_next).negate()).unwrap();
        let not_noun = g.context(ContextualTest::at(1, p.n).link(verb_next).not()).unwrap();
        let grammar = g.build().unwrap();
        let mut ctx = context(&grammar);
        let ids = window(&mut ctx, &["\"walk\" V", "\"dog\" N", "\"cat\" N"]);

        assert_eq!(run(&mut ctx, all_n, ids[1]), Some(ids[3]));
        assert_eq!(run(&mut ctx, all_v, ids[1]), None);
        assert_eq!(run(&mut ctx, none_v, ids[1]), Some(ids[3]));
        assert_eq!(run(&mut ctx, none_n, ids[1]), None);
        assert_eq!(run(&mut ctx, none_n, ids[3]), Some(ids[0]));

        assert_eq!(run(&mut ctx, noun_then_verb, ids[1]), None);
        assert_eq!(run(&mut ctx, negated, ids[1]), Some(ids[1]));
        assert_eq!(run(&mut ctx, not_noun, ids[1]), None);
    }

    #[test]
    fn templates_resolve_and_take_the_callers_position() {
        let mut g = GrammarBuilder::new();
        let p = pos(&mut g);
        let next_noun = g.context(ContextualTest::at(1, p.n)).unwrap();
        g.template("NEXT-N", next_noun).unwrap();
        let tmpl = g.template_ref("NEXT-N").unwrap();
        let plain = g.context(ContextualTest::template(tmpl)).unwrap();
        let moved = g.context(ContextualTest::template_at(tmpl, 2)).unwrap();
        let adverb_next = g.context(ContextualTest::at(1, p.adv)).unwrap();
        let linked = g.context(ContextualTest::template(tmpl).link(adverb_next)).unwrap();
        let adj_next = g.context(ContextualTest::at(1, p.adj)).unwrap();
        let either = g.or_context(vec![adj_next, plain]).unwrap();
        let grammar = g.build().unwrap();
        let mut ctx = context(&grammar);
        let ids = window(&mut ctx, &["\"walk\" V", "\"old\" ADJ", "\"man\" N", "\"now\" ADV"]);

        assert_eq!(run(&mut ctx, plain, ids[1]), None);
        assert_eq!(run(&mut ctx, moved, ids[1]), Some(ids[3]));
        assert_eq!(run(&mut ctx, plain, ids[2]), Some(ids[3]));
        assert_eq!(run(&mut ctx, linked, ids[2]), Some(ids[4]));
        assert_eq!(run(&mut ctx, linked, ids[1]), None);
        assert_eq!(run(&mut ctx, either, ids[1]), Some(ids[2]));
        assert_eq!(run(&mut ctx, either, ids[2]), Some(ids[3]));
        assert_eq!(run(&mut ctx, either, ids[3]), None);
    }

    #[test]
    fn dependency_axes_and_depths() {
        let mut g = GrammarBuilder::new();
        let p = pos(&mut g);
        let parent_v = g.context(ContextualTest::parent(p.v)).unwrap();
        let ancestor_v = g.context(ContextualTest::parent(p.v).deep()).unwrap();
        let blocked = g.context(ContextualTest::parent(p.v).deep().barrier(p.n)).unwrap();
        let global = g.context(ContextualTest::parent(p.v).global().barrier(p.n)).unwrap();
        let child_det = g.context(ContextualTest::child(p.det)).unwrap();
        let descendant_det = g.context(ContextualTest::child(p.det).deep()).unwrap();
        let sibling_adv = g.context(ContextualTest::sibling(p.adv)).unwrap();
        let self_v = g.context(ContextualTest::child(p.v).with_self()).unwrap();
        let child_v = g.context(ContextualTest::child(p.v)).unwrap();
        let grammar = g.build().unwrap();
        let mut ctx = context(&grammar);
        let ids = window(&mut ctx, &["\"the\" DET", "\"dog\" N", "\"bark\" V", "\"loudly\" ADV"]);
        let (the, dog, barks, loudly) = (ids[1], ids[2], ids[3], ids[4]);
        assert!(ctx.attach(the, dog, RuleFlags::empty()));
        assert!(ctx.attach(dog, barks, RuleFlags::empty()));
        assert!(ctx.attach(loudly, barks, RuleFlags::empty()));

        assert_eq!(run(&mut ctx, parent_v, the), None);
        assert_eq!(run(&mut ctx, parent_v, dog), Some(barks));
        assert_eq!(run(&mut ctx, ancestor_v, the), Some(barks));
        assert_eq!(run(&mut ctx, blocked, the), None);
        assert_eq!(run(&mut ctx, global, the), Some(barks));
        assert_eq!(run(&mut ctx, child_det, barks), None);
        assert_eq!(run(&mut ctx, descendant_det, barks), Some(the));
        assert_eq!(run(&mut ctx, sibling_adv, dog), Some(loudly));
        assert_eq!(run(&mut ctx, sibling_adv, loudly), None);
        assert_eq!(run(&mut ctx, self_v, barks), Some(barks));
        assert_eq!(run(&mut ctx, child_v, barks), None);
    }

    #[test]
    fn scans_cross_windows_only_when_spanning() {
        let mut g = GrammarBuilder::new();
        let p = pos(&mut g);
        let det_left = g.context(ContextualTest::scan(-1, p.det)).unwrap();
        let det_left_span = g.context(ContextualTest::scan(-1, p.det).span_left()).unwrap();
        let two_back = g.context(ContextualTest::at(-2, p.det)).unwrap();
        let two_back_span = g.context(ContextualTest::at(-2, p.det).span_left()).unwrap();
        let verb_right = g.context(ContextualTest::scan(1, p.v)).unwrap();
        let verb_right_span = g.context(ContextualTest::scan(1, p.v).span_right()).unwrap();
        let grammar = g.build().unwrap();

        let mut ctx = context(&grammar);
        let first = window(&mut ctx, &["\"the\" DET"]);
        let second = window(&mut ctx, &["\"walk\" V | \"walk\" N"]);
        assert_eq!(run(&mut ctx, det_left, second[1]), None);
        assert_eq!(run(&mut ctx, det_left_span, second[1]), Some(first[1]));
        assert_eq!(run(&mut ctx, two_back, second[1]), None);
        assert_eq!(run(&mut ctx, two_back_span, second[1]), Some(first[1]));
        assert_eq!(run(&mut ctx, verb_right, first[1]), None);
        assert_eq!(run(&mut ctx, verb_right_span, first[1]), Some(second[1]));

        let options = Options { always_span: true, ..Options::default() };
        let mut ctx = EngineContext::new(&grammar, options);
        let first = window(&mut ctx, &["\"the\" DET"]);
        let second = window(&mut ctx, &["\"walk\" V | \"walk\" N"]);
        assert_eq!(run(&mut ctx, det_left, second[1]), Some(first[1]));
    }

    #[test]
    fn left_scans_reach_the_begin_cohort() {
        let mut g = GrammarBuilder::new();
        let begin = g.list("BEGIN", &[">>>"]).unwrap();
        let p = pos(&mut g);
        let to_begin = g.context(ContextualTest::scan(-1, begin).barrier(p.v)).unwrap();
        let grammar = g.build().unwrap();
        let mut ctx = context(&grammar);
        let ids = window(&mut ctx, &["\"the\" DET", "\"dog\" N", "\"ran\" V", "\"home\" ADV"]);

        assert_eq!(run(&mut ctx, to_begin, ids[2]), Some(ids[0]));
        assert_eq!(run(&mut ctx, to_begin, ids[4]), None);
    }
}
