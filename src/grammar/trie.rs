//! Prefix tree of tag lists.
//!
//! A set's member tag lists (`(N PL)`, `(V)`) are stored in a trie keyed by
//! tag. Each list is sorted by global tag frequency (rarest tag first) before
//! insertion, so that matching branches on the most selective tag first and
//! shared prefixes are tested once.
//!
//! A node may be terminal and still have children: inserting `(N)` and
//! `(N PL)` keeps both lists, and [`TagTrie::tag_lists`] returns exactly the
//! deduplicated lists that were inserted, independent of insertion order.

use crate::TagHash;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrieNode {
    /// A tag list ends here.
    pub terminal: bool,
    pub children: Option<Box<TagTrie>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagTrie {
    nodes: BTreeMap<TagHash, TrieNode>,
}

impl TagTrie {
    pub fn new() -> Self {
        TagTrie::default()
    }

    /// Insert a tag list in the given order. Returns `false` if the exact
    /// list was already present.
    pub fn insert(&mut self, tags: &[TagHash]) -> bool {
        let Some((&first, rest)) = tags.split_first() else {
            return false;
        };
        let node = self.nodes.entry(first).or_default();
        if rest.is_empty() {
            let fresh = !node.terminal;
            node.terminal = true;
            return fresh;
        }
        node.children.get_or_insert_with(Default::default).insert(rest)
    }

    /// Insert a tag list after sorting it by `frequency` (ascending, ties by
    /// hash) and removing duplicate tags.
    pub fn insert_by_frequency(&mut self, tags: &[TagHash], frequency: impl Fn(TagHash) -> u32) -> bool {
        let mut sorted: Vec<TagHash> = tags.to_vec();
        sorted.sort_unstable_by_key(|t| (frequency(*t), *t));
        sorted.dedup();
        self.insert(&sorted)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TagHash, &TrieNode)> {
        self.nodes.iter()
    }

    /// Every stored tag list, each sorted by hash, the whole sorted.
    pub fn tag_lists(&self) -> Vec<Vec<TagHash>> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.collect(&mut path, &mut out);
        for list in &mut out {
            list.sort_unstable();
        }
        out.sort();
        out
    }

    fn collect(&self, path: &mut Vec<TagHash>, out: &mut Vec<Vec<TagHash>>) {
        for (tag, node) in &self.nodes {
            path.push(*tag);
            if node.terminal {
                out.push(path.clone());
            }
            if let Some(children) = &node.children {
                children.collect(path, out);
            }
            path.pop();
        }
    }

    /// Number of stored tag lists.
    pub fn len(&self) -> usize {
        self.nodes
            .values()
            .map(|n| usize::from(n.terminal) + n.children.as_ref().map_or(0, |c| c.len()))
            .sum()
    }

    /// Every tag occurring anywhere in the trie.
    pub fn all_tags(&self) -> BTreeSet<TagHash> {
        let mut out = BTreeSet::new();
        self.visit_tags(&mut |t| {
            out.insert(t);
        });
        out
    }

    pub fn visit_tags(&self, f: &mut impl FnMut(TagHash)) {
        for (tag, node) in &self.nodes {
            f(*tag);
            if let Some(children) = &node.children {
                children.visit_tags(f);
            }
        }
    }

    /// Does any tag satisfy `pred`?
    pub fn any_tag(&self, pred: &impl Fn(TagHash) -> bool) -> bool {
        self.nodes.iter().any(|(tag, node)| pred(*tag) || node.children.as_ref().is_some_and(|c| c.any_tag(pred)))
    }

    fn from_lists(lists: impl IntoIterator<Item = Vec<TagHash>>) -> Self {
        let mut trie = TagTrie::new();
        for list in lists {
            trie.insert(&list);
        }
        trie
    }

    /// Tag lists in `self` but not in `other`.
    pub fn difference(&self, other: &TagTrie) -> TagTrie {
        let theirs: BTreeSet<_> = other.tag_lists().into_iter().collect();
        TagTrie::from_lists(self.tag_lists().into_iter().filter(|l| !theirs.contains(l)))
    }

    /// Tag lists in both.
    pub fn intersection(&self, other: &TagTrie) -> TagTrie {
        let theirs: BTreeSet<_> = other.tag_lists().into_iter().collect();
        TagTrie::from_lists(self.tag_lists().into_iter().filter(|l| theirs.contains(l)))
    }

    /// Tag lists in exactly one of the two.
    pub fn symmetric_difference(&self, other: &TagTrie) -> TagTrie {
        let ours: BTreeSet<_> = self.tag_lists().into_iter().collect();
        let theirs: BTreeSet<_> = other.tag_lists().into_iter().collect();
        TagTrie::from_lists(ours.symmetric_difference(&theirs).cloned())
    }

    /// Tag lists of both.
    pub fn union(&self, other: &TagTrie) -> TagTrie {
        let mut trie = self.clone();
        for list in other.tag_lists() {
            trie.insert(&list);
        }
        trie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_is_independent_of_insertion_order() {
        let lists: Vec<Vec<TagHash>> = vec![vec![3, 1], vec![2], vec![1, 3, 5], vec![3, 1], vec![7, 2]];
        let mut forward = TagTrie::new();
        for l in &lists {
            forward.insert_by_frequency(l, |_| 0);
        }
        let mut backward = TagTrie::new();
        for l in lists.iter().rev() {
            backward.insert_by_frequency(l, |_| 0);
        }
        assert_eq!(forward.tag_lists(), backward.tag_lists());
        assert_eq!(forward.tag_lists(), vec![vec![1, 3], vec![1, 3, 5], vec![2], vec![2, 7]]);
        assert_eq!(forward.len(), 4);
    }

    #[test]
    fn prefix_lists_are_kept_alongside_longer_lists() {
        let mut trie = TagTrie::new();
        assert!(trie.insert(&[1, 2]));
        assert!(trie.insert(&[1]));
        assert!(!trie.insert(&[1]));
        assert_eq!(trie.tag_lists(), vec![vec![1], vec![1, 2]]);
    }

    #[test]
    fn frequency_decides_branching_tag() {
        let mut trie = TagTrie::new();
        trie.insert_by_frequency(&[10, 20], |t| if t == 20 { 1 } else { 5 });
        assert_eq!(trie.iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec![20]);
    }

    #[test]
    fn static_set_algebra_on_lists() {
        let a = TagTrie::from_lists(vec![vec![1], vec![2], vec![3, 4]]);
        let b = TagTrie::from_lists(vec![vec![2], vec![5]]);
        assert_eq!(a.difference(&b).tag_lists(), vec![vec![1], vec![3, 4]]);
        assert_eq!(a.intersection(&b).tag_lists(), vec![vec![2]]);
        assert_eq!(a.symmetric_difference(&b).tag_lists(), vec![vec![1], vec![3, 4], vec![5]]);
        assert_eq!(a.union(&b).len(), 4);
    }
}
