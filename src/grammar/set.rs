//! Sets: named predicates over readings.
//!
//! A leaf set is a collection of tag lists kept in two tries: `trie` for lists
//! made only of plain tags (matched by membership) and `trie_special` for lists
//! containing at least one special tag (regex, numeric, variable, ...). A
//! composite set is a left-to-right expression over child sets:
//!
//! ```text
//! A OR B + C - D OR E      ==      A  |  (B & C & !D)  |  E
//! ```
//!
//! A run of non-OR operators binds tighter than OR. `^` (failfast) makes the
//! whole set fail when its right operand matches.

use crate::{SetId, TagHash};

use super::trie::TagTrie;

bitflags::bitflags! {
    /// Cached properties of a set, computed by [`Grammar::reindex`].
    ///
    /// [`Grammar::reindex`]: crate::Grammar::reindex
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SetType: u32 {
        /// Matches every reading (`(*)`).
        const ANY         = 1 << 0;
        /// Contains special tags somewhere below.
        const SPECIAL     = 1 << 1;
        /// `$$SET`: binds the matching tag list for the rest of the rule.
        const TAG_UNIFY   = 1 << 2;
        /// `&&SET`: binds the matching child set for the rest of the rule.
        const SET_UNIFY   = 1 << 3;
        /// A unifying set occurs somewhere below.
        const CHILD_UNIFY = 1 << 4;
        /// Contains mapping tags somewhere below.
        const MAPPING     = 1 << 5;
        /// Referenced, directly or through another set, by a rule or test.
        const USED        = 1 << 6;
    }
}

/// Runtime set operator between two neighbouring child sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOp {
    Or,
    Plus,
    Minus,
    FailFast,
}

/// Set operators evaluated once, at grammar build time, on the member tag
/// lists of two leaf sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaticSetOp {
    /// `\`
    Difference,
    /// `∩`
    Intersection,
    /// `∆`
    SymmetricDifference,
    /// `OR` of two leaf sets, flattened.
    Union,
}

#[derive(Debug, Clone)]
pub struct Set {
    pub id: SetId,
    pub name: String,
    pub kind: SetType,
    pub trie: TagTrie,
    pub trie_special: TagTrie,
    /// Member tag lists in the order they were declared; used where order
    /// matters (tags added by MAP/ADD, new cohorts).
    pub lists: Vec<Vec<TagHash>>,
    pub sets: Vec<SetId>,
    pub set_ops: Vec<SetOp>,
}

impl Set {
    pub(crate) fn leaf(id: SetId, name: impl Into<String>) -> Self {
        Set {
            id,
            name: name.into(),
            kind: SetType::empty(),
            trie: TagTrie::new(),
            trie_special: TagTrie::new(),
            lists: Vec::new(),
            sets: Vec::new(),
            set_ops: Vec::new(),
        }
    }

    #[inline]
    pub fn is_composite(&self) -> bool {
        !self.sets.is_empty()
    }

    #[inline]
    pub fn is_unifying(&self) -> bool {
        self.kind.intersects(SetType::TAG_UNIFY | SetType::SET_UNIFY)
    }

    /// Results of matching this set may depend on more than the reading:
    /// unification bindings, variables, positional markers, captures.
    #[inline]
    pub fn is_context_dependent(&self) -> bool {
        self.kind.intersects(SetType::SPECIAL | SetType::TAG_UNIFY | SetType::SET_UNIFY | SetType::CHILD_UNIFY)
    }

    /// All member tags in declaration order, flattened.
    pub fn flat_tags(&self) -> impl Iterator<Item = TagHash> + '_ {
        self.lists.iter().flatten().copied()
    }

    /// Group child sets into OR-separated runs: each run is a chain of
    /// `(operator-from-previous, set)` pairs, the first with `None`.
    pub fn runs(&self) -> Vec<Vec<(Option<SetOp>, SetId)>> {
        let mut runs = Vec::new();
        let mut current: Vec<(Option<SetOp>, SetId)> = Vec::new();
        for (i, set) in self.sets.iter().enumerate() {
            let op = if i == 0 { None } else { self.set_ops.get(i - 1).copied() };
            if op == Some(SetOp::Or) {
                runs.push(std::mem::take(&mut current));
                current.push((None, *set));
            } else {
                current.push((op, *set));
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }
        runs
    }
}
