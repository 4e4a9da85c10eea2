//! The grammar: tags, sets, contextual tests and rules.
//!
//! A [`Grammar`] is built once through a [`GrammarBuilder`] (the programmatic
//! loading interface; textual and binary grammar readers are expected to
//! drive the same builder) and is immutable while it is applied.
//!
//! ```text
//! GrammarBuilder ── tag / list / set ──────────► TagTable, Vec<Set>
//!                ── context (dedup.rs) ────────► Vec<ContextualTest>
//!                ── rule / with_block / anchor ► Vec<Rule>, anchors
//!                ── build ─┬─ validate references, flags, anchors
//!                          ├─ fill tries in tag-frequency order
//!                          └─ reindex (index.rs)
//!                                  │
//!                                  v
//!                               Grammar
//! ```
//!
//! ## Responsibilities by module
//!
//! - `tag.rs`: tag classification and interning.
//! - `trie.rs`: tag-list tries and static set algebra.
//! - `set.rs`: set structure and operator runs.
//! - `contextual_test.rs`: positions and contextual tests.
//! - `rule.rs`: rule kinds, flags and sections.
//! - `dedup.rs`: content keys for sharing identical tests.
//! - `index.rs`: interval lists, bitsets and the tag/set/rule indices.
//! - `builder.rs`: validation and assembly.

#[path = "grammar/builder.rs"]
mod builder;
#[path = "grammar/contextual_test.rs"]
mod contextual_test;
#[path = "grammar/dedup.rs"]
mod dedup;
#[path = "grammar/index.rs"]
mod index;
#[path = "grammar/rule.rs"]
mod rule;
#[path = "grammar/set.rs"]
mod set;
#[path = "grammar/tag.rs"]
mod tag;
#[path = "grammar/trie.rs"]
mod trie;

pub use builder::GrammarBuilder;
pub use contextual_test::{
    ContextualTest, DepAxis, DepDepth, DepStep, EnclosureEdge, OriginPassing, Pick, PosFlags, Position, Quantifier,
    Scan, Side, SubReading, Traversal,
};
pub use index::{Bloomish, GrammarIndex, IntervalVec, SetBits};
pub use rule::{Rule, RuleFlags, RuleKind, Section};
pub use set::{Set, SetOp, SetType, StaticSetOp};
pub use tag::{Comparison, ComparisonOp, NumericValue, Tag, TagSource, TagTable, TagType, hash_text};
pub use trie::{TagTrie, TrieNode};

use crate::{ContextId, RuleId, SetId, TagHash};
use std::collections::HashMap;

/// An indexed, immutable rule database.
#[derive(Debug, Clone)]
pub struct Grammar {
    pub tags: TagTable,
    pub sets: Vec<Set>,
    pub set_names: HashMap<String, SetId>,
    pub contexts: Vec<ContextualTest>,
    pub templates: HashMap<String, ContextId>,
    pub rules: Vec<Rule>,
    /// Named positions in the rule list, for JUMP and EXECUTE.
    pub anchors: HashMap<String, usize>,
    pub delimiters: Option<SetId>,
    pub soft_delimiters: Option<SetId>,
    pub text_delimiters: Option<SetId>,
    /// Mapping tags in order of preference; readings split by mapping tag are
    /// ordered by it.
    pub preferred_targets: Vec<TagHash>,
    /// `(left, right)` wordforms of parenthesis pairs.
    pub parentheses: Vec<(TagHash, TagHash)>,
    pub tag_any: TagHash,
    pub tag_begin: TagHash,
    pub tag_end: TagHash,
    pub index: GrammarIndex,
}

impl Grammar {
    /// Recompute cached set properties and all indices.
    pub fn reindex(&mut self) {
        index::reindex(self);
    }

    pub fn tag(&self, hash: TagHash) -> Option<&Tag> {
        self.tags.get(hash)
    }

    /// # Panics
    /// On an id that did not come from this grammar's builder.
    pub fn set(&self, id: SetId) -> &Set {
        &self.sets[id.index()]
    }

    pub fn set_by_name(&self, name: &str) -> Option<&Set> {
        self.set_names.get(name).map(|id| self.set(*id))
    }

    /// # Panics
    /// On an id that did not come from this grammar's builder.
    pub fn context(&self, id: ContextId) -> &ContextualTest {
        &self.contexts[id.index()]
    }

    /// # Panics
    /// On an id that did not come from this grammar's builder.
    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.index()]
    }

    pub fn anchor(&self, name: &str) -> Option<usize> {
        self.anchors.get(name).copied()
    }

    pub fn rules_by_tag(&self, tag: TagHash) -> Option<&IntervalVec> {
        self.index.rules_by_tag.get(&tag)
    }

    pub fn rules_by_set(&self, set: SetId) -> Option<&IntervalVec> {
        self.index.rules_by_set.get(&set)
    }

    pub fn sets_by_tag(&self, tag: TagHash) -> Option<&SetBits> {
        self.index.sets_by_tag.get(&tag)
    }

    /// Numbered sections present in the grammar, ascending.
    pub fn sections(&self) -> impl Iterator<Item = u32> + '_ {
        self.index.sections.keys().copied()
    }
}
