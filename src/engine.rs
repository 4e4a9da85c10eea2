//! Rule application engine.
//!
//! The engine runs a compiled [`Grammar`](crate::Grammar) over the current
//! window of a [`WindowBuffer`](crate::WindowBuffer). Everything mutable
//! during a run lives in one `EngineContext`; matching borrows it through a
//! `Matcher`, actions take it by `&mut`.
//!
//! ## How the parts work together
//!
//! ```text
//! Applicator ── close window ──► next ──► current ──► previous ──► OutputSink
//!                                           │
//!                    run_window (run_rules.rs)
//!                      BEFORE-SECTIONS, sections 1..=n cumulative and
//!                      AFTER-SECTIONS, each repeated until a pass fires nothing
//!                        │ index_window (trigger.rs): possible sets, valid rules
//!                        │ per rule, per target cohort:
//!                        │   target set    (match_set.rs)
//!                        │   tests         (contextual.rs)
//!                        │   operands + apply (actions.rs)
//!                        └ DELIMIT restarts the sections on the shortened window
//! ```
//!
//! ## Responsibilities by module
//!
//! - `context.rs`: `EngineContext`, the runtime tag store, `MatchState` (the
//!   per-rule bindings) and the `Matcher` borrow bundle.
//! - `match_set.rs`: set and tag matching against readings and cohorts,
//!   including numeric comparisons, regular expressions, unification and
//!   varstrings.
//! - `contextual.rs`: positions, scans, barriers, LINK chains, templates and
//!   dependency or relation traversal.
//! - `actions.rs`: what each rule kind does to readings, cohorts and windows.
//! - `dependency.rs`: attaching and detaching, relations, and the per-window
//!   bookkeeping of input numbers and enclosures.
//! - `run_rules.rs`: the section loop, jumps, nested rule lists and rule
//!   filtering.
//! - `trigger.rs`: cheap pre-classification of cohorts and windows.
//! - `external.rs`: the [`ExternalHandler`] seam for `EXTERNAL` rules.
//! - `output.rs`: [`OutputSink`], [`OutputView`] and the CG text writer.
//! - `metrics.rs`: run metrics and optional per rule statistics.
//!
//! ## Invariants
//!
//! - Only the current window is ever the target of a rule; earlier and later
//!   windows are context only.
//! - Every action that changes the readings of a cohort refreshes that
//!   cohort's derived views before the next match.
//! - A pass that fires no rule ends the section; nothing else does except
//!   the run caps in [`Options`](crate::Options).

#[path = "engine/actions.rs"]
mod actions;
#[path = "engine/context.rs"]
mod context;
#[path = "engine/contextual.rs"]
mod contextual;
#[path = "engine/dependency.rs"]
mod dependency;
#[path = "engine/external.rs"]
mod external;
#[path = "engine/match_set.rs"]
mod match_set;
#[path = "engine/metrics.rs"]
mod metrics;
#[path = "engine/output.rs"]
mod output;
#[path = "engine/run_rules.rs"]
mod run_rules;
#[path = "engine/trigger.rs"]
mod trigger;


pub(crate) use context::{EngineContext, MatchState};
pub(crate) use dependency::PendingRelation;
pub(crate) use match_set::CohortMatch;

pub use external::{ExternalCohort, ExternalHandler, ExternalWindow};
pub use metrics::{MatchStats, RuleStats, RunMetrics, Statistics, WindowMetrics};
pub use output::{CgTextWriter, OutputSink, OutputView};
