//! Cohorts: one token slot with its candidate readings.

use crate::grammar::{SetBits, TagSource};
use crate::{CohortId, TagHash};

use super::reading::Reading;
use std::collections::{BTreeMap, BTreeSet, HashMap};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CohortFlags: u32 {
        /// Removed by REMCOHORT; kept only so traces can print it.
        const REMOVED    = 1 << 0;
        /// Dependency information came from the input.
        const DEP_INPUT  = 1 << 1;
        /// Has outgoing relations.
        const RELATED    = 1 << 2;
        /// `num_min`/`num_max` need recomputing.
        const NUM_DIRTY  = 1 << 3;
        /// The `>>>` pseudo cohort opening a window.
        const BEGIN      = 1 << 4;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cohort {
    pub id: CohortId,
    /// Stream-wide number, unique for the lifetime of the applicator. Used by
    /// dependency links and relations.
    pub global_number: u32,
    /// Position inside the window; the begin cohort is 0.
    pub local_number: u32,
    /// Number of the window the cohort belongs to.
    pub window: u32,
    pub wordform: TagHash,
    /// Wordform-only pseudo reading.
    pub wread: Reading,
    pub readings: Vec<Reading>,
    pub deleted: Vec<Reading>,
    pub delayed: Vec<Reading>,
    /// Number given in input dependency tags while the window fills; the
    /// global number once the window is closed.
    pub dep_self: u32,
    /// Global number of the parent; `Some(0)` is the root.
    pub dep_parent: Option<u32>,
    pub dep_children: BTreeSet<u32>,
    /// Label tag → global numbers of related cohorts.
    pub relations: BTreeMap<TagHash, BTreeSet<u32>>,
    /// Smallest and largest value per numeric key over all readings.
    pub num_min: HashMap<TagHash, f64>,
    pub num_max: HashMap<TagHash, f64>,
    /// Sets that can possibly match some reading of the cohort.
    pub possible_sets: SetBits,
    /// Plain text following the cohort in the input.
    pub text: String,
    pub flags: CohortFlags,
    /// Parenthesis nesting depth, 0 outside any enclosure.
    pub encl_depth: u32,
    /// Global number of the opening parenthesis of the innermost enclosure.
    pub encl_parent: Option<u32>,
    pub is_pleft: bool,
    pub is_pright: bool,
    /// Cohorts removed right after this one, for trace output.
    pub removed: Vec<CohortId>,
}

impl Cohort {
    pub fn new(id: CohortId, global_number: u32, wordform: TagHash) -> Self {
        Cohort { id, global_number, wordform, wread: Reading::new(wordform), ..Cohort::default() }
    }

    #[inline]
    pub fn is_begin(&self) -> bool {
        self.flags.contains(CohortFlags::BEGIN)
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.flags.contains(CohortFlags::REMOVED)
    }

    /// Live readings, optionally followed by deleted and delayed ones.
    pub fn all_readings(&self, deleted: bool, delayed: bool) -> impl Iterator<Item = &Reading> {
        let deleted: &[Reading] = if deleted { &self.deleted[..] } else { &[] };
        let delayed: &[Reading] = if delayed { &self.delayed[..] } else { &[] };
        self.readings.iter().chain(deleted).chain(delayed)
    }

    /// Append a reading, numbering it after the existing ones.
    pub fn append_reading(&mut self, mut reading: Reading) {
        reading.number = (self.readings.len() + self.deleted.len() + self.delayed.len()) as u32 + 1;
        self.readings.push(reading);
        self.flags |= CohortFlags::NUM_DIRTY;
    }

    /// Recompute `num_min`/`num_max` from the live readings' numeric tags.
    pub fn update_num_extremes(&mut self, tags: &impl TagSource) {
        self.num_min.clear();
        self.num_max.clear();
        for reading in &self.readings {
            for tag in reading.chain().flat_map(|r| r.tags_numerical.iter()) {
                let Some(cmp) = tags.tag(*tag).and_then(|t| t.comparison.as_ref()) else { continue };
                let crate::grammar::NumericValue::Value(v) = cmp.value else { continue };
                let min = self.num_min.entry(cmp.key).or_insert(v);
                *min = min.min(v);
                let max = self.num_max.entry(cmp.key).or_insert(v);
                *max = max.max(v);
            }
        }
        self.flags.remove(CohortFlags::NUM_DIRTY);
    }

    pub fn add_relation(&mut self, label: TagHash, target: u32) -> bool {
        self.flags |= CohortFlags::RELATED;
        self.relations.entry(label).or_default().insert(target)
    }

    /// Replace all relations with `label` by one to `target`.
    pub fn set_relation(&mut self, label: TagHash, target: u32) -> bool {
        let entry = self.relations.entry(label).or_default();
        if entry.len() == 1 && entry.contains(&target) {
            return false;
        }
        entry.clear();
        entry.insert(target);
        self.flags |= CohortFlags::RELATED;
        true
    }

    pub fn remove_relation(&mut self, label: TagHash, target: u32) -> bool {
        let Some(entry) = self.relations.get_mut(&label) else { return false };
        let removed = entry.remove(&target);
        if entry.is_empty() {
            self.relations.remove(&label);
        }
        removed
    }

    /// Related cohorts under `label`, or under any label.
    pub fn related(&self, label: Option<TagHash>) -> BTreeSet<u32> {
        match label {
            Some(l) => self.relations.get(&l).cloned().unwrap_or_default(),
            None => self.relations.values().flatten().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::TagTable;

    #[test]
    fn numeric_extremes_follow_readings() {
        let mut table = TagTable::default();
        let wf = table.intern("\"<x>\"").unwrap();
        let mut cohort = Cohort::new(CohortId(0), 1, wf);
        for t in ["<W:10>", "<W:40>", "<W:25>"] {
            let mut r = Reading::new(wf);
            r.push_tag(table.intern(t).unwrap());
            r.rehash(&table);
            cohort.append_reading(r);
        }
        assert!(cohort.flags.contains(CohortFlags::NUM_DIRTY));
        cohort.update_num_extremes(&table);
        let key = table.get(table.lookup("<W:10>").unwrap()).unwrap().comparison.as_ref().unwrap().key;
        assert_eq!(cohort.num_min.get(&key), Some(&10.0));
        assert_eq!(cohort.num_max.get(&key), Some(&40.0));
        assert_eq!(cohort.readings[2].number, 3);
    }

    #[test]
    fn relations_add_set_remove() {
        let mut cohort = Cohort::new(CohortId(0), 1, 7);
        assert!(cohort.add_relation(5, 3));
        assert!(!cohort.add_relation(5, 3));
        assert!(cohort.add_relation(5, 4));
        assert!(cohort.set_relation(5, 9));
        assert_eq!(cohort.related(Some(5)).into_iter().collect::<Vec<_>>(), vec![9]);
        assert!(cohort.remove_relation(5, 9));
        assert!(cohort.related(None).is_empty());
    }
}
