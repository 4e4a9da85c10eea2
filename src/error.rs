//! Error types.
//!
//! Grammar construction is the only place where the engine can fail hard: a
//! malformed grammar is rejected as a whole by [`GrammarBuilder::build`]. Once a
//! [`Grammar`] exists, applying it never errors; data problems in the input are
//! reported through `tracing` and skipped.
//!
//! [`GrammarBuilder::build`]: crate::GrammarBuilder::build
//! [`Grammar`]: crate::Grammar

use thiserror::Error;

/// A grammar could not be built.
#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("empty tag")]
    EmptyTag,

    #[error("invalid regular expression in tag {tag}: {source}")]
    InvalidRegex {
        tag: String,
        #[source]
        source: regex::Error,
    },

    #[error("malformed numeric tag {0}")]
    MalformedNumeric(String),

    #[error("set {0} is defined twice")]
    DuplicateSet(String),

    #[error("set {0} is empty")]
    EmptySet(String),

    #[error("unknown set {0}")]
    UnknownSet(String),

    #[error("set id {0} does not exist")]
    DanglingSet(u32),

    #[error("contextual test id {0} does not exist")]
    DanglingContext(u32),

    #[error("rule id {0} does not exist")]
    DanglingRule(u32),

    #[error("set {name}: {operands} operands do not fit {operators} operators")]
    OperatorArity { name: String, operators: usize, operands: usize },

    #[error("set {0} is composite and cannot take part in a static set operation")]
    NotStatic(String),

    #[error("unknown template {0}")]
    UnknownTemplate(String),

    #[error("template {0} is defined twice")]
    DuplicateTemplate(String),

    #[error("anchor {0} is defined twice")]
    DuplicateAnchor(String),

    #[error("rule on line {line}: anchor {anchor} does not exist")]
    UnknownAnchor { line: u32, anchor: String },

    #[error("rule on line {line}: anchor range {from}..{to} is empty or reversed")]
    EmptyAnchorRange { line: u32, from: String, to: String },

    #[error("rule on line {line}: flags {a} and {b} are mutually exclusive")]
    ConflictingFlags { line: u32, a: &'static str, b: &'static str },

    #[error("rule on line {line}: only WITH rules carry inner rules")]
    InvalidWith { line: u32 },

    #[error("rule on line {line}: {kind} needs {what}")]
    MissingOperand { line: u32, kind: &'static str, what: &'static str },
}

/// An external collaborator (see [`ExternalHandler`]) failed.
///
/// [`ExternalHandler`]: crate::ExternalHandler
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("external program {program} failed: {message}")]
    Failed { program: String, message: String },

    #[error("external program {program} returned {got} cohorts, expected {expected}")]
    CohortCount { program: String, expected: usize, got: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
