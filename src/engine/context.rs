//! Engine state shared by the matcher, the actions and the rule loop.
//!
//! [`EngineContext`] replaces what would otherwise be process-wide state: the
//! runtime tag table, the window buffer, the variable map, the set-match cache
//! and the statistics all live here and are handed down explicitly.
//!
//! Matching only reads the window buffer but writes caches and bindings, so
//! it runs through a [`Matcher`], a bundle of split borrows of the context.
//! Actions take `&mut EngineContext` after matching is done.

use crate::api::Options;
use crate::grammar::{Grammar, Tag, TagSource, TagTable};
use crate::window::{Reading, WindowBuffer};
use crate::{CohortId, SetId, TagHash};

use super::external::ExternalHandler;
use super::metrics::{RunMetrics, Statistics};
use super::output::OutputView;
use std::collections::HashMap;

/// Variable key (hash of the key text) to value; `None` is a bare key.
pub(crate) type Variables = HashMap<TagHash, Option<TagHash>>;

/// `(reading hash, set)` → matched. Only for sets whose result depends on the
/// reading alone.
pub(crate) type SetCache = HashMap<(u32, SetId), bool>;

// --- Tags --------------------------------------------------------------------

/// Grammar tags plus tags first seen at run time (input tags, varstring
/// expansions). Runtime hashes never collide with grammar hashes.
#[derive(Debug)]
pub(crate) struct TagStore<'g> {
    grammar: &'g TagTable,
    runtime: TagTable,
}

impl<'g> TagStore<'g> {
    pub(crate) fn new(grammar: &'g TagTable) -> Self {
        TagStore { grammar, runtime: TagTable::new(grammar.mapping_prefix()) }
    }

    /// Intern a tag; malformed text is logged and dropped.
    pub(crate) fn intern(&mut self, text: &str) -> Option<TagHash> {
        match self.runtime.intern_avoiding(text, Some(self.grammar)) {
            Ok(hash) => Some(hash),
            Err(err) => {
                tracing::warn!(tag = text, error = %err, "dropping malformed tag");
                None
            }
        }
    }

    pub(crate) fn lookup(&self, text: &str) -> Option<TagHash> {
        self.grammar.lookup(text).or_else(|| self.runtime.lookup(text))
    }

    pub(crate) fn runtime_len(&self) -> usize {
        self.runtime.len()
    }
}

impl TagSource for TagStore<'_> {
    fn tag(&self, hash: TagHash) -> Option<&Tag> {
        self.grammar.get(hash).or_else(|| self.runtime.get(hash))
    }
}

// --- Match state -------------------------------------------------------------

/// Bindings made while one rule is evaluated on one target.
#[derive(Debug, Clone, Default)]
pub(crate) struct MatchState {
    /// The rule's target cohort (`_TARGET_`).
    pub target: Option<CohortId>,
    /// The target reading, by index, while tests run per reading.
    pub target_reading: Option<usize>,
    pub target_baseform: TagHash,
    /// Where scans with `O` stop.
    pub origin: Option<CohortId>,
    /// Set by `X` tests, read by `x` tests and `_MARK_`.
    pub mark: Option<CohortId>,
    /// Set by `A` tests; overrides the attachment point of dependency rules.
    pub attach_to: Option<CohortId>,
    /// `$$SET` bindings: the tag list matched first.
    pub unif_tags: HashMap<SetId, Vec<TagHash>>,
    /// `&&SET` bindings: the child set matched first.
    pub unif_sets: HashMap<SetId, SetId>,
    /// Capture groups of the last regex tag that matched.
    pub captures: Vec<String>,
    /// Rule-level LOOKDELETED and LOOKDELAYED.
    pub look_deleted: bool,
    pub look_delayed: bool,
}

impl MatchState {
    /// Fresh bindings for one target; the mark starts on the target unless a
    /// remembered one is carried over.
    pub(crate) fn for_target(target: CohortId, remember_mark: Option<CohortId>) -> Self {
        MatchState {
            target: Some(target),
            origin: Some(target),
            mark: remember_mark.or(Some(target)),
            ..MatchState::default()
        }
    }

    pub(crate) fn clear_bindings(&mut self) {
        self.unif_tags.clear();
        self.unif_sets.clear();
        self.captures.clear();
    }
}

// --- Context -----------------------------------------------------------------

pub(crate) struct EngineContext<'g> {
    pub grammar: &'g Grammar,
    pub options: Options,
    pub tags: TagStore<'g>,
    pub buffer: WindowBuffer,
    pub variables: Variables,
    pub cache: SetCache,
    pub stats: Statistics,
    pub metrics: RunMetrics,
    pub external: Option<Box<dyn ExternalHandler + 'g>>,
    /// Mark kept across cohorts by REMEMBERX rules.
    pub remembered_mark: Option<CohortId>,
    /// Windows run since the caches were last reset.
    pub since_reset: u32,
    /// The input carried dependency or relation tags.
    pub seen_dependencies: bool,
    pub seen_relations: bool,
}

impl std::fmt::Debug for EngineContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("options", &self.options)
            .field("runtime_tags", &self.tags.runtime_len())
            .field("live_cohorts", &self.buffer.live_cohorts())
            .field("variables", &self.variables.len())
            .field("cache", &self.cache.len())
            .field("external", &self.external.is_some())
            .finish()
    }
}

impl<'g> EngineContext<'g> {
    pub(crate) fn new(grammar: &'g Grammar, options: Options) -> Self {
        EngineContext {
            grammar,
            options,
            tags: TagStore::new(&grammar.tags),
            buffer: WindowBuffer::new(),
            variables: Variables::new(),
            cache: SetCache::new(),
            stats: Statistics::for_grammar(grammar),
            metrics: RunMetrics::default(),
            external: None,
            remembered_mark: None,
            since_reset: 0,
            seen_dependencies: false,
            seen_relations: false,
        }
    }

    /// Borrow the context for matching with `state` as the binding table.
    pub(crate) fn matcher<'a>(&'a mut self, state: &'a mut MatchState) -> Matcher<'a, 'g> {
        Matcher {
            grammar: self.grammar,
            options: &self.options,
            buffer: &self.buffer,
            tags: &self.tags,
            variables: &self.variables,
            cache: &mut self.cache,
            stats: if self.options.statistics { Some(&mut self.stats) } else { None },
            state,
        }
    }

    /// Rebuild the derived views of a cohort after its readings changed.
    pub(crate) fn refresh_cohort(&mut self, id: CohortId) {
        let Some(cohort) = self.buffer.get_mut(id) else { return };
        for reading in cohort.readings.iter_mut().chain(cohort.deleted.iter_mut()).chain(cohort.delayed.iter_mut()) {
            reading.rehash(&self.tags);
        }
        cohort.update_num_extremes(&self.tags);
        super::trigger::index_cohort(self.grammar, cohort);
    }

    /// A new reading for `cohort` with `tags` after the wordform.
    pub(crate) fn make_reading(&mut self, wordform: TagHash, tags: &[TagHash]) -> Reading {
        let mut reading = self.buffer.new_reading(wordform);
        for tag in tags {
            reading.push_tag(*tag);
        }
        reading.rehash(&self.tags);
        reading
    }

    pub(crate) fn output_view(&self) -> OutputView<'_> {
        let index = &self.grammar.index;
        OutputView {
            grammar: self.grammar,
            tags: &self.tags,
            buffer: &self.buffer,
            trace: self.options.trace,
            dependencies: self.seen_dependencies || index.has_dependency_rules,
            relations: self.seen_relations || index.has_relation_rules,
        }
    }

    /// Drop cached set results and pooled readings.
    pub(crate) fn reset_caches(&mut self) {
        tracing::debug!(entries = self.cache.len(), "resetting set-match cache");
        self.cache.clear();
        self.since_reset = 0;
    }
}

/// Split borrows of an [`EngineContext`] for one matching session.
pub(crate) struct Matcher<'a, 'g> {
    pub grammar: &'g Grammar,
    pub options: &'a Options,
    pub buffer: &'a WindowBuffer,
    pub tags: &'a TagStore<'g>,
    pub variables: &'a Variables,
    pub cache: &'a mut SetCache,
    pub stats: Option<&'a mut Statistics>,
    pub state: &'a mut MatchState,
}
