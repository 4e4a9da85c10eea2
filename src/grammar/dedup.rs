//! Deduplication keys for contextual tests.
//!
//! Grammars repeat the same contextual test across many rules (`(-1 DET)`
//! appears everywhere). The builder stores each distinct test once and hands
//! out the existing [`ContextId`] when an equal test is added again. Sharing
//! matters beyond memory: per-test statistics and templates refer to the
//! shared node.
//!
//! ## What counts as "the same test"
//!
//! Everything that influences evaluation: position, offsets, relation label,
//! the referenced sets, and the referenced tests (by id, which is sound
//! because referenced tests are themselves deduplicated first). The source
//! line and the assigned id do not take part.

use crate::{ContextId, SetId, TagHash};

use super::contextual_test::{ContextualTest, Position, SubReading};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ContextKey {
    pub(crate) position: Position,
    pub(crate) offset: i32,
    pub(crate) offset_sub: SubReading,
    pub(crate) relation: Option<TagHash>,
    pub(crate) target: Option<SetId>,
    pub(crate) barrier: Option<SetId>,
    pub(crate) cbarrier: Option<SetId>,
    pub(crate) linked: Option<ContextId>,
    pub(crate) ors: Vec<ContextId>,
    pub(crate) tmpl: Option<ContextId>,
}

impl ContextKey {
    pub(crate) fn from_test(test: &ContextualTest) -> Self {
        ContextKey {
            position: test.position,
            offset: test.offset,
            offset_sub: test.offset_sub,
            relation: test.relation,
            target: test.target,
            barrier: test.barrier,
            cbarrier: test.cbarrier,
            linked: test.linked,
            ors: test.ors.clone(),
            tmpl: test.tmpl,
        }
    }

    /// Stable content hash, stored on the test.
    pub(crate) fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}
