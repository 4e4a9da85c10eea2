//! The window buffer: a cohort arena plus the previous/current/next window
//! deques.
//!
//! ```text
//!   previous (look-behind)      current        next (look-ahead)
//! [ w1 ][ w2 ]  ◄── shift ──  [ w3 ]  ◄── shift ──  [ w4 ][ w5 ]
//!    │
//!    └── pop_oldest: emitted, cohorts released to the arena
//! ```
//!
//! Cohorts live in slots addressed by [`CohortId`]; windows only hold ids.
//! Dependency links and relations use global numbers, resolved through
//! `cohort_map`, so a link to a released cohort simply stops resolving.
//!
//! ## Invariants
//!
//! - A slot is `Some` exactly while its cohort belongs to a buffered window
//!   (or to a window's `removed` list).
//! - Global numbers are never reused.

use crate::{CohortId, TagHash};

use super::cohort::Cohort;
use super::reading::Reading;
use super::single_window::SingleWindow;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct WindowBuffer {
    slots: Vec<Option<Cohort>>,
    free: Vec<CohortId>,
    /// Released readings, reused by [`WindowBuffer::new_reading`].
    reading_pool: Vec<Reading>,
    pub previous: VecDeque<SingleWindow>,
    pub current: Option<SingleWindow>,
    pub next: VecDeque<SingleWindow>,
    cohort_map: HashMap<u32, CohortId>,
    cohort_counter: u32,
    window_counter: u32,
}

impl WindowBuffer {
    pub fn new() -> Self {
        WindowBuffer::default()
    }

    // --- Cohort arena ---------------------------------------------------------

    /// Allocate a cohort with a fresh global number.
    pub fn alloc_cohort(&mut self, wordform: TagHash) -> CohortId {
        self.cohort_counter += 1;
        let global = self.cohort_counter;
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                CohortId::from_index(self.slots.len() - 1)
            }
        };
        self.slots[id.index()] = Some(Cohort::new(id, global, wordform));
        self.cohort_map.insert(global, id);
        id
    }

    /// Release a cohort; its readings go back to the pool.
    pub fn free_cohort(&mut self, id: CohortId) {
        let Some(cohort) = self.slots.get_mut(id.index()).and_then(Option::take) else { return };
        if self.cohort_map.get(&cohort.global_number) == Some(&id) {
            self.cohort_map.remove(&cohort.global_number);
        }
        for removed in &cohort.removed {
            self.free_cohort(*removed);
        }
        for reading in cohort.readings.into_iter().chain(cohort.deleted).chain(cohort.delayed) {
            self.recycle_reading(reading);
        }
        self.free.push(id);
    }

    pub fn get(&self, id: CohortId) -> Option<&Cohort> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: CohortId) -> Option<&mut Cohort> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// # Panics
    /// If `id` was released.
    pub fn cohort(&self, id: CohortId) -> &Cohort {
        match self.get(id) {
            Some(c) => c,
            None => panic!("cohort slot {} is not live", id.0),
        }
    }

    /// # Panics
    /// If `id` was released.
    pub fn cohort_mut(&mut self, id: CohortId) -> &mut Cohort {
        match self.get_mut(id) {
            Some(c) => c,
            None => panic!("cohort slot {} is not live", id.0),
        }
    }

    /// The live cohort with a global number.
    pub fn by_global(&self, global: u32) -> Option<CohortId> {
        self.cohort_map.get(&global).copied()
    }

    /// Point a global number at another cohort (used when cohorts merge).
    pub fn remap_global(&mut self, global: u32, id: CohortId) {
        self.cohort_map.insert(global, id);
    }

    pub fn live_cohorts(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // --- Reading pool ---------------------------------------------------------

    pub fn new_reading(&mut self, wordform: TagHash) -> Reading {
        match self.reading_pool.pop() {
            Some(mut r) => {
                r.wordform = wordform;
                r.tags_list.push(wordform);
                r
            }
            None => Reading::new(wordform),
        }
    }

    pub fn recycle_reading(&mut self, mut reading: Reading) {
        reading.reset();
        self.reading_pool.push(reading);
    }

    // --- Windows --------------------------------------------------------------

    /// A new, unqueued window with the next window number.
    pub fn new_window(&mut self) -> SingleWindow {
        self.window_counter += 1;
        SingleWindow::new(self.window_counter)
    }

    pub fn window(&self, number: u32) -> Option<&SingleWindow> {
        self.windows().find(|w| w.number == number)
    }

    pub fn window_mut(&mut self, number: u32) -> Option<&mut SingleWindow> {
        self.previous
            .iter_mut()
            .chain(self.current.iter_mut())
            .chain(self.next.iter_mut())
            .find(|w| w.number == number)
    }

    /// All buffered windows in stream order.
    pub fn windows(&self) -> impl Iterator<Item = &SingleWindow> {
        self.previous.iter().chain(self.current.iter()).chain(self.next.iter())
    }

    /// The window `delta` steps away from window `number` (negative is
    /// earlier).
    pub fn neighbor(&self, number: u32, delta: i32) -> Option<&SingleWindow> {
        let at = self.order(number)?.checked_add_signed(delta as isize)?;
        self.windows().nth(at)
    }

    /// Stream position of a buffered window. Window numbers follow creation
    /// order, which differs from stream order once a window has been split.
    pub fn order(&self, number: u32) -> Option<usize> {
        self.windows().position(|w| w.number == number)
    }

    pub fn current_number(&self) -> Option<u32> {
        self.current.as_ref().map(|w| w.number)
    }

    /// Move the current window to `previous` and the first queued window into
    /// `current`. Returns whether there is a new current window.
    pub fn shift(&mut self) -> bool {
        if let Some(w) = self.current.take() {
            self.previous.push_back(w);
        }
        self.current = self.next.pop_front();
        self.current.is_some()
    }

    /// Take the oldest look-behind window out of the buffer. Its cohorts stay
    /// allocated until [`release_window`](Self::release_window).
    pub fn pop_oldest(&mut self) -> Option<SingleWindow> {
        self.previous.pop_front()
    }

    /// Release every cohort of a window that has left the buffer.
    pub fn release_window(&mut self, window: SingleWindow) {
        for id in window.cohorts {
            self.free_cohort(id);
        }
    }

    /// Refresh `local_number` and `window` of every cohort of a window.
    pub fn renumber(&mut self, number: u32) {
        let Some(ids) = self.window(number).map(|w| w.cohorts.clone()) else { return };
        for (i, id) in ids.into_iter().enumerate() {
            if let Some(c) = self.get_mut(id) {
                c.local_number = i as u32;
                c.window = number;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_reused_but_numbers_are_not() {
        let mut buf = WindowBuffer::new();
        let a = buf.alloc_cohort(1);
        let b = buf.alloc_cohort(1);
        assert_eq!(buf.cohort(b).global_number, 2);
        buf.free_cohort(a);
        assert_eq!(buf.by_global(1), None);
        let c = buf.alloc_cohort(1);
        assert_eq!(c, a);
        assert_eq!(buf.cohort(c).global_number, 3);
        assert_eq!(buf.live_cohorts(), 2);
    }

    #[test]
    fn readings_are_recycled() {
        let mut buf = WindowBuffer::new();
        let id = buf.alloc_cohort(9);
        let mut r = buf.new_reading(9);
        r.push_tag(4);
        buf.cohort_mut(id).append_reading(r);
        buf.free_cohort(id);
        let r = buf.new_reading(11);
        assert_eq!(r.tags_list, vec![11]);
        assert!(r.tags_list.capacity() >= 2);
    }

    #[test]
    fn shift_moves_windows_along() {
        let mut buf = WindowBuffer::new();
        for _ in 0..3 {
            let w = buf.new_window();
            buf.next.push_back(w);
        }
        assert!(buf.shift());
        assert!(buf.shift());
        assert_eq!(buf.current_number(), Some(2));
        assert_eq!(buf.neighbor(2, -1).map(|w| w.number), Some(1));
        assert_eq!(buf.neighbor(2, 1).map(|w| w.number), Some(3));
        assert_eq!(buf.neighbor(2, 2).map(|w| w.number), None);
        assert_eq!(buf.neighbor(1, -1).map(|w| w.number), None);
        assert_eq!(buf.neighbor(1, 2).map(|w| w.number), Some(3));
        assert_eq!(buf.pop_oldest().map(|w| w.number), Some(1));
    }
}
