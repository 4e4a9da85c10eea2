//! Output: handing finished windows to a sink.
//!
//! The engine knows nothing about file formats. A finished window is passed
//! to an [`OutputSink`] together with an [`OutputView`], which resolves tag
//! texts, dependency numbers, relations and rule names. [`CgTextWriter`]
//! writes the CG text format:
//!
//! ```text
//! "<wordform>"
//! 	"baseform" TAG TAG @MAP #2->0 ID:2 R:label:1 NAME:12
//! 		"sub-reading" TAG
//! ;	"deleted" TAG RULE:7          (trace only)
//! ```
//!
//! ## Design notes
//!
//! - Dependencies print in window-local numbers; a parent in another window
//!   prints as its global number.
//! - The begin cohort, the `>>>`/`<<<` markers and `noprint` readings never
//!   print.

use crate::grammar::{Grammar, TagSource, TagType};
use crate::window::{Cohort, Reading, SingleWindow, WindowBuffer};
use crate::{CohortId, DEP_ROOT, RuleId, TagHash};

use std::io::{self, Write};

/// Read-only access to everything a sink needs to print a window.
pub struct OutputView<'a> {
    pub(crate) grammar: &'a Grammar,
    pub(crate) tags: &'a dyn TagSource,
    pub(crate) buffer: &'a WindowBuffer,
    pub(crate) trace: bool,
    pub(crate) dependencies: bool,
    pub(crate) relations: bool,
}

impl<'a> OutputView<'a> {
    pub fn tag_text(&self, hash: TagHash) -> &'a str {
        self.tags.text(hash)
    }

    pub fn cohort(&self, id: CohortId) -> Option<&'a Cohort> {
        self.buffer.get(id)
    }

    /// Print `hit_by` rule names and deleted readings.
    pub fn trace(&self) -> bool {
        self.trace
    }

    /// `NAME:line` of a rule, as printed in traces.
    pub fn rule_label(&self, rule: RuleId) -> String {
        let rule = self.grammar.rule(rule);
        format!("{}:{}", rule.display_name(), rule.line)
    }

    /// `(self, parent)` as printed in `#self->parent`, when the stream carries
    /// dependencies.
    pub fn dependency(&self, cohort: &Cohort) -> Option<(u32, u32)> {
        if !self.dependencies {
            return None;
        }
        let parent = match cohort.dep_parent {
            None | Some(DEP_ROOT) => 0,
            Some(global) => self.output_number(cohort, global),
        };
        Some((cohort.local_number, parent))
    }

    /// `(label, target)` of every outgoing relation.
    pub fn relations(&self, cohort: &Cohort) -> Vec<(&'a str, u32)> {
        cohort
            .relations
            .iter()
            .flat_map(|(label, targets)| targets.iter().map(move |t| (*label, *t)))
            .map(|(label, target)| (self.tag_text(label), self.output_number(cohort, target)))
            .collect()
    }

    /// Whether cohorts print their `ID:n`.
    pub fn has_relations(&self) -> bool {
        self.relations
    }

    fn output_number(&self, from: &Cohort, global: u32) -> u32 {
        match self.buffer.by_global(global).and_then(|id| self.buffer.get(id)) {
            Some(other) if other.window == from.window => other.local_number,
            _ => global,
        }
    }

    /// The text of one reading line, without indentation or `;`.
    pub fn reading_line(&self, cohort: &Cohort, reading: &Reading, top: bool) -> String {
        let mut parts: Vec<String> = Vec::new();
        if reading.baseform != 0 {
            parts.push(self.tag_text(reading.baseform).to_string());
        }
        let markers = [self.grammar.tag_begin, self.grammar.tag_end];
        let mut seen: Vec<TagHash> = Vec::new();
        for tag in &reading.tags_list {
            if markers.contains(tag) || seen.contains(tag) {
                continue;
            }
            seen.push(*tag);
            let kind = self.tags.tag(*tag).map_or(TagType::empty(), |t| t.kind);
            if kind.intersects(TagType::WORDFORM | TagType::BASEFORM) {
                continue;
            }
            parts.push(self.tag_text(*tag).to_string());
        }
        if top {
            if let Some((me, parent)) = self.dependency(cohort) {
                parts.push(format!("#{me}->{parent}"));
            }
            if self.relations {
                parts.push(format!("ID:{}", cohort.local_number));
                for (label, target) in self.relations(cohort) {
                    parts.push(format!("R:{label}:{target}"));
                }
            }
        }
        if self.trace {
            parts.extend(reading.hit_by.iter().map(|r| self.rule_label(*r)));
        }
        parts.join(" ")
    }
}

/// Receives finished windows in stream order.
pub trait OutputSink {
    fn emit_cohort(&mut self, view: &OutputView<'_>, cohort: &Cohort) -> io::Result<()>;

    fn emit_stream_command(&mut self, command: &str) -> io::Result<()>;

    fn emit_plain_text_line(&mut self, line: &str) -> io::Result<()>;

    /// Leading text, every cohort but the begin cohort, trailing text.
    fn emit_window(&mut self, view: &OutputView<'_>, window: &SingleWindow) -> io::Result<()> {
        if !window.text.is_empty() {
            self.emit_plain_text_line(&window.text)?;
        }
        for id in window.cohorts.iter().skip(1) {
            if let Some(cohort) = view.cohort(*id) {
                self.emit_cohort(view, cohort)?;
            }
        }
        if !window.text_post.is_empty() {
            self.emit_plain_text_line(&window.text_post)?;
        }
        Ok(())
    }
}

/// Writes the CG text format.
#[derive(Debug)]
pub struct CgTextWriter<W: Write> {
    out: W,
}

impl<W: Write> CgTextWriter<W> {
    pub fn new(out: W) -> Self {
        CgTextWriter { out }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_reading(
        &mut self,
        view: &OutputView<'_>,
        cohort: &Cohort,
        reading: &Reading,
        prefix: &str,
    ) -> io::Result<()> {
        if reading.noprint {
            return Ok(());
        }
        for (depth, level) in reading.chain().enumerate() {
            let indent = "\t".repeat(depth + 1);
            writeln!(self.out, "{prefix}{indent}{}", view.reading_line(cohort, level, depth == 0))?;
        }
        Ok(())
    }

    fn write_cohort(&mut self, view: &OutputView<'_>, cohort: &Cohort, prefix: &str) -> io::Result<()> {
        writeln!(self.out, "{prefix}{}", view.tag_text(cohort.wordform))?;
        for reading in &cohort.readings {
            self.write_reading(view, cohort, reading, prefix)?;
        }
        if view.trace() {
            for reading in cohort.deleted.iter().chain(&cohort.delayed) {
                self.write_reading(view, cohort, reading, ";")?;
            }
        }
        if !cohort.text.is_empty() {
            self.emit_plain_text_line(&cohort.text)?;
        }
        Ok(())
    }
}

impl<W: Write> OutputSink for CgTextWriter<W> {
    fn emit_cohort(&mut self, view: &OutputView<'_>, cohort: &Cohort) -> io::Result<()> {
        self.write_cohort(view, cohort, "")?;
        if view.trace() {
            for id in &cohort.removed {
                if let Some(removed) = view.cohort(*id) {
                    self.write_cohort(view, removed, ";")?;
                }
            }
        }
        Ok(())
    }

    fn emit_stream_command(&mut self, command: &str) -> io::Result<()> {
        writeln!(self.out, "{command}")
    }

    fn emit_plain_text_line(&mut self, line: &str) -> io::Result<()> {
        if line.ends_with('\n') { write!(self.out, "{line}") } else { writeln!(self.out, "{line}") }
    }
}
