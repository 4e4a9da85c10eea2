//! The external collaborator behind `EXTERNAL ONCE/ALWAYS` rules.
//!
//! The engine does not spawn processes. A rule names a program; the installed
//! [`ExternalHandler`] receives the window in textual form and returns it with
//! new readings. The cohort count must not change.

use crate::error::ExternalError;

/// One cohort as handed to an external handler. Readings exclude the
/// wordform and the `<<<` marker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExternalCohort {
    pub wordform: String,
    pub readings: Vec<Vec<String>>,
}

/// A window as handed to an external handler, without its begin cohort.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExternalWindow {
    pub number: u32,
    pub cohorts: Vec<ExternalCohort>,
}

/// Answers `EXTERNAL` rules. Any `FnMut(&str, ExternalWindow)` closure is a
/// handler.
pub trait ExternalHandler {
    fn exchange(&mut self, program: &str, window: ExternalWindow) -> Result<ExternalWindow, ExternalError>;
}

impl<F> ExternalHandler for F
where
    F: FnMut(&str, ExternalWindow) -> Result<ExternalWindow, ExternalError>,
{
    fn exchange(&mut self, program: &str, window: ExternalWindow) -> Result<ExternalWindow, ExternalError> {
        self(program, window)
    }
}
