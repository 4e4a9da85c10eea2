//! A Constraint Grammar rule engine.
//!
//! Constraint Grammar (CG) disambiguates morphologically analysed text. Input
//! arrives as *cohorts* (one per token), each offering several candidate
//! *readings*; a grammar of contextual rules removes, selects, maps and
//! restructures readings until a disambiguated analysis remains.
//!
//! ```text
//! InputItem stream ──► Applicator ──► WindowBuffer (previous | current | next)
//!                          │
//!                          │ per current window
//!                          v
//!                  sections until clean pass ──► OutputSink
//! ```
//!
//! The crate is organised as:
//!
//! - [`grammar`]: tags, sets, contextual tests, rules, indices and the
//!   [`GrammarBuilder`].
//! - [`window`]: the mutable in-flight data: [`Reading`], [`Cohort`],
//!   [`SingleWindow`] and the [`WindowBuffer`] arena.
//! - `engine`: the context matcher, rule actions and the fixpoint loop.
//! - [`Applicator`] (in `api.rs`): the public driver.
//!
//! # Example
//! ```
//! use constraint_grammar::{
//!     Applicator, CgTextWriter, ContextualTest, GrammarBuilder, InputCohort, InputItem, Options, Rule, RuleKind,
//! };
//!
//! let mut g = GrammarBuilder::new();
//! let any = g.list("ANY", &["*"]).unwrap();
//! let verb = g.list("VERB", &["V"]).unwrap();
//! let only_verbs = g.context(ContextualTest::at(0, verb)).unwrap();
//! g.rule(Rule::new(RuleKind::Select, any).named("keep").test(only_verbs)).unwrap();
//! let grammar = g.build().unwrap();
//!
//! let mut out = CgTextWriter::new(Vec::new());
//! let mut app = Applicator::new(&grammar, Options::default());
//! let run = InputCohort::new("run").reading("run", &["V"]).reading("run", &["N"]);
//! app.run([InputItem::Cohort(run)], &mut out).unwrap();
//!
//! let text = String::from_utf8(out.into_inner()).unwrap();
//! assert_eq!(text, "\"<run>\"\n\t\"run\" V\n");
//! ```

#[macro_use]
mod macros;
mod api;
mod engine;
mod error;
pub mod grammar;
pub mod window;

pub use api::{Applicator, CMD_EXIT, CMD_FLUSH, InputCohort, InputItem, InputReading, Options};
pub use engine::{
    CgTextWriter, ExternalCohort, ExternalHandler, ExternalWindow, MatchStats, OutputSink, OutputView, RuleStats,
    RunMetrics, Statistics, WindowMetrics,
};
pub use error::{ExternalError, GrammarError};
pub use grammar::{
    ContextualTest, Grammar, GrammarBuilder, Position, Rule, RuleFlags, RuleKind, Section, Set, SetOp, StaticSetOp,
    SubReading, Tag,
};
pub use window::{Cohort, Reading, SingleWindow, WindowBuffer};

// --- Identifiers ------------------------------------------------------------

/// Tag identity: the hash of the tag text (see [`grammar::TagTable`]).
pub type TagHash = u32;

arena_id!(
    /// Index of a set in [`Grammar::sets`].
    SetId
);
arena_id!(
    /// Index of a contextual test in [`Grammar::contexts`].
    ContextId
);
arena_id!(
    /// Index of a rule in [`Grammar::rules`]; also its position in grammar order.
    RuleId
);
arena_id!(
    /// Slot of a cohort in the [`WindowBuffer`] arena. Slots are reused after
    /// their window has been flushed.
    CohortId
);

// --- Well-known tags --------------------------------------------------------

/// The "any" tag.
pub const STR_ANY: &str = "*";
/// Carried by the pseudo cohort opening every window.
pub const STR_BEGIN: &str = ">>>";
/// Carried by the readings of the last cohort of every window.
pub const STR_END: &str = "<<<";
pub const STR_TARGET: &str = "_TARGET_";
pub const STR_MARK: &str = "_MARK_";
pub const STR_ATTACHTO: &str = "_ATTACHTO_";
pub const STR_PAR_LEFT: &str = "_LEFT_";
pub const STR_PAR_RIGHT: &str = "_RIGHT_";
pub const STR_ENCL: &str = "_ENCL_";
pub const STR_SAME_BASIC: &str = "_SAME_BASIC_";

/// Dependency parent number of a cohort attached to the root.
pub const DEP_ROOT: u32 = 0;
