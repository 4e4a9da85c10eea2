//! Readings: one candidate analysis of a cohort.
//!
//! A reading keeps its tags twice. `tags_list` is the insertion-ordered list
//! used for output and for positional edits (MAP, ADD with BEFORE/AFTER,
//! SUBSTITUTE). The sorted views (`tags`, `tags_plain`, `tags_textual`,
//! `tags_numerical`) and the Bloom filters are derived from it by
//! [`Reading::rehash`] and are what matching looks at.
//!
//! ## Invariants
//!
//! - After any edit of `tags_list`, `rehash` must run before the reading is
//!   matched again.
//! - `tags_list` always contains the wordform tag, so wordform sets match
//!   through the ordinary membership test.

use crate::grammar::{Bloomish, SubReading, TagSource, TagType};
use crate::{RuleId, TagHash};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    pub wordform: TagHash,
    /// First baseform tag of `tags_list`, 0 if none.
    pub baseform: TagHash,
    pub tags_list: Vec<TagHash>,
    /// Sorted and deduplicated `tags_list`.
    pub tags: Vec<TagHash>,
    /// Sorted tags that are neither textual nor numeric.
    pub tags_plain: Vec<TagHash>,
    /// Sorted wordform, baseform and `<...>` tags.
    pub tags_textual: Vec<TagHash>,
    /// Numeric tags, in `tags_list` order.
    pub tags_numerical: Vec<TagHash>,
    pub bloom: Bloomish,
    pub bloom_plain: Bloomish,
    pub bloom_textual: Bloomish,
    /// The mapping tag of the reading, if any.
    pub mapping: Option<TagHash>,
    pub mapped: bool,
    pub deleted: bool,
    /// Internal reading that is never printed (magic readings, cohorts created
    /// without analyses).
    pub noprint: bool,
    /// Set by PROTECT: disambiguation and mapping rules leave it alone.
    pub immutable: bool,
    /// Rules that touched this reading, in order.
    pub hit_by: Vec<RuleId>,
    pub hash: u32,
    /// Hash over the plain tags only.
    pub hash_plain: u32,
    /// Input order; stable output ordering after splits.
    pub number: u32,
    /// Sub-reading chain.
    pub next: Option<Box<Reading>>,
}

impl Reading {
    pub fn new(wordform: TagHash) -> Self {
        Reading { wordform, tags_list: vec![wordform], ..Reading::default() }
    }

    /// Clear the reading for reuse, keeping allocations.
    pub fn reset(&mut self) {
        self.wordform = 0;
        self.baseform = 0;
        self.tags_list.clear();
        self.tags.clear();
        self.tags_plain.clear();
        self.tags_textual.clear();
        self.tags_numerical.clear();
        self.bloom.clear();
        self.bloom_plain.clear();
        self.bloom_textual.clear();
        self.mapping = None;
        self.mapped = false;
        self.deleted = false;
        self.noprint = false;
        self.immutable = false;
        self.hit_by.clear();
        self.hash = 0;
        self.hash_plain = 0;
        self.number = 0;
        self.next = None;
    }

    /// Rebuild the sorted views, filters and hashes of this reading and its
    /// sub-readings from `tags_list`.
    pub fn rehash(&mut self, tags: &impl TagSource) {
        self.tags.clear();
        self.tags.extend_from_slice(&self.tags_list);
        self.tags.sort_unstable();
        self.tags.dedup();

        self.tags_plain.clear();
        self.tags_textual.clear();
        self.tags_numerical.clear();
        self.bloom.clear();
        self.bloom_plain.clear();
        self.bloom_textual.clear();
        self.mapping = None;
        self.baseform = 0;

        for &hash in &self.tags_list {
            let kind = tags.tag(hash).map_or(TagType::empty(), |t| t.kind);
            if kind.contains(TagType::BASEFORM) && self.baseform == 0 {
                self.baseform = hash;
            }
            if kind.contains(TagType::MAPPING) && self.mapping.is_none() {
                self.mapping = Some(hash);
            }
            if kind.contains(TagType::NUMERICAL) && !self.tags_numerical.contains(&hash) {
                self.tags_numerical.push(hash);
            }
        }

        for &hash in &self.tags {
            let kind = tags.tag(hash).map_or(TagType::empty(), |t| t.kind);
            self.bloom.insert(hash);
            if kind.contains(TagType::TEXTUAL) {
                self.tags_textual.push(hash);
                self.bloom_textual.insert(hash);
            } else if !kind.contains(TagType::NUMERICAL) {
                self.tags_plain.push(hash);
                self.bloom_plain.insert(hash);
            }
        }
        self.mapped = self.mapping.is_some();

        let mut hash = self.tags.iter().fold(0, |h, t| mix(h, *t));
        let hash_plain = self.tags_plain.iter().fold(0, |h, t| mix(h, *t));
        if let Some(next) = self.next.as_mut() {
            next.rehash(tags);
            hash = mix(hash, next.hash);
        }
        self.hash = hash;
        self.hash_plain = hash_plain;
    }

    #[inline]
    pub fn contains(&self, tag: TagHash) -> bool {
        self.bloom.may_contain(tag) && self.tags.binary_search(&tag).is_ok()
    }

    /// Every tag in `list` is present.
    pub fn contains_all(&self, list: &[TagHash]) -> bool {
        list.iter().all(|t| self.contains(*t))
    }

    /// Append `tag` to `tags_list` unless present. Call [`rehash`](Self::rehash)
    /// afterwards.
    pub fn push_tag(&mut self, tag: TagHash) -> bool {
        if self.tags_list.contains(&tag) {
            return false;
        }
        self.tags_list.push(tag);
        true
    }

    /// Remove every occurrence of `tag`; returns the first index it was found
    /// at.
    pub fn remove_tag(&mut self, tag: TagHash) -> Option<usize> {
        let first = self.tags_list.iter().position(|t| *t == tag)?;
        self.tags_list.retain(|t| *t != tag);
        Some(first)
    }

    pub fn was_hit_by(&self, rule: RuleId) -> bool {
        self.hit_by.contains(&rule)
    }

    /// This reading and its sub-readings, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &Reading> {
        std::iter::successors(Some(self), |r| r.next.as_deref())
    }

    pub fn depth(&self) -> usize {
        self.chain().count()
    }

    /// The reading at a sub-reading level. `Level(-1)` is the deepest;
    /// `Any` resolves to the reading itself (callers iterate [`chain`](Self::chain)
    /// for "any level").
    pub fn level(&self, sub: SubReading) -> Option<&Reading> {
        match sub {
            SubReading::Any | SubReading::Level(0) => Some(self),
            SubReading::Level(n) if n > 0 => self.chain().nth(n as usize),
            SubReading::Level(n) => {
                let depth = self.depth() as i32;
                let idx = depth + n;
                if idx < 0 { None } else { self.chain().nth(idx as usize) }
            }
        }
    }

    pub fn level_mut(&mut self, sub: SubReading) -> Option<&mut Reading> {
        let idx = match sub {
            SubReading::Any | SubReading::Level(0) => 0,
            SubReading::Level(n) if n > 0 => n as usize,
            SubReading::Level(n) => {
                let idx = self.depth() as i32 + n;
                if idx < 0 {
                    return None;
                }
                idx as usize
            }
        };
        let mut cur = self;
        for _ in 0..idx {
            cur = cur.next.as_deref_mut()?;
        }
        Some(cur)
    }
}

/// sdbm step over a whole tag hash.
#[inline]
fn mix(hash: u32, value: u32) -> u32 {
    value.wrapping_add(hash << 6).wrapping_add(hash << 16).wrapping_sub(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::TagTable;

    fn reading(table: &mut TagTable, tags: &[&str]) -> Reading {
        let wf = table.intern("\"<cats>\"").unwrap();
        let mut r = Reading::new(wf);
        for t in tags {
            let h = table.intern(t).unwrap();
            r.push_tag(h);
        }
        r.rehash(table);
        r
    }

    #[test]
    fn rehash_builds_views() {
        let mut table = TagTable::default();
        let r = reading(&mut table, &["\"cat\"", "N", "PL", "@SUBJ", "<W:20>"]);
        let n = table.lookup("N").unwrap();
        let base = table.lookup("\"cat\"").unwrap();
        assert!(r.contains(n));
        assert_eq!(r.baseform, base);
        assert_eq!(r.mapping, table.lookup("@SUBJ"));
        assert!(r.mapped);
        assert_eq!(r.tags_textual.len(), 2);
        assert_eq!(r.tags_numerical.len(), 1);
        assert_eq!(r.tags_plain.len(), 3);
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let mut table = TagTable::default();
        let a = reading(&mut table, &["N", "PL"]);
        let b = reading(&mut table, &["PL", "N"]);
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.tags_list, b.tags_list);
    }

    #[test]
    fn sub_reading_levels() {
        let mut table = TagTable::default();
        let mut top = reading(&mut table, &["\"house\"", "N"]);
        let mut mid = reading(&mut table, &["\"boat\"", "N"]);
        mid.next = Some(Box::new(reading(&mut table, &["\"tree\"", "N"])));
        top.next = Some(Box::new(mid));
        top.rehash(&table);
        let tree = table.lookup("\"tree\"").unwrap();
        assert_eq!(top.depth(), 3);
        assert_eq!(top.level(SubReading::Level(-1)).map(|r| r.baseform), Some(tree));
        assert_eq!(top.level(SubReading::Level(2)).map(|r| r.baseform), Some(tree));
        assert!(top.level(SubReading::Level(3)).is_none());
        assert!(top.level(SubReading::Level(-4)).is_none());
    }
}
