//! In-flight text: readings, cohorts and windows.
//!
//! Everything here is mutable while a grammar is applied; the engine owns one
//! [`WindowBuffer`] per applicator.
//!
//! ```text
//! WindowBuffer
//!  ├─ slots: Vec<Option<Cohort>>        (arena, CohortId = slot index)
//!  │           └─ Cohort
//!  │               ├─ readings / deleted / delayed: Vec<Reading>
//!  │               │                                  └─ next: sub-reading chain
//!  │               └─ dep_parent, dep_children, relations (global numbers)
//!  └─ previous | current | next: SingleWindow (cohort ids + variables)
//! ```
//!
//! ## Responsibilities by module
//!
//! - `reading.rs`: tag views, Bloom filters and hashing of one analysis.
//! - `cohort.rs`: one token with readings, dependency and relation edges.
//! - `single_window.rs`: ordered cohort ids plus per-window state.
//! - `buffer.rs`: the arena, reading pool and window deques.

#[path = "window/buffer.rs"]
mod buffer;
#[path = "window/cohort.rs"]
mod cohort;
#[path = "window/reading.rs"]
mod reading;
#[path = "window/single_window.rs"]
mod single_window;

pub use buffer::WindowBuffer;
pub use cohort::{Cohort, CohortFlags};
pub use reading::Reading;
pub use single_window::SingleWindow;
