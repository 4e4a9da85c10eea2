use crate::engine::{
    CohortMatch, EngineContext, ExternalHandler, MatchState, OutputSink, PendingRelation, RunMetrics, Statistics,
};
use crate::grammar::{Grammar, TagSource, hash_text};
use crate::window::{CohortFlags, Reading, SingleWindow};
use crate::{CohortId, SetId, TagHash};
use std::io;

/// Stream command that makes the applicator process and emit everything it
/// buffered.
pub const CMD_FLUSH: &str = "<STREAMCMD:FLUSH>";
pub const CMD_EXIT: &str = "<STREAMCMD:EXIT>";

/// Options that affect rule application.
#[derive(Debug, Clone)]
pub struct Options {
    /// Passes per section before moving on, `None` for "until clean".
    pub max_runs: Option<usize>,
    /// One pass per section.
    pub single_run: bool,
    /// Run only the first N numbered sections.
    pub sections: Option<usize>,
    /// Let every contextual test cross window boundaries.
    pub always_span: bool,
    /// Windows kept before and after the current one.
    pub num_windows: usize,
    /// Cohorts after which a soft delimiter closes the window.
    pub soft_limit: usize,
    /// Cohorts after which the window is closed regardless.
    pub hard_limit: usize,
    pub dep_allow_loops: bool,
    pub dep_no_crossing: bool,
    /// Skip MAP, ADD and REPLACE rules.
    pub no_mappings: bool,
    /// Skip SUBSTITUTE, APPEND and COPY rules.
    pub no_corrections: bool,
    /// REMOVE may delete the last reading unless the rule says SAFE.
    pub unsafe_by_default: bool,
    /// Rules may target `noprint` readings.
    pub allow_magic_readings: bool,
    pub ignore_barriers: bool,
    /// Print the rules that touched each reading, and deleted readings.
    pub trace: bool,
    /// Collect per rule, test and set counters.
    pub statistics: bool,
    /// Windows between set-cache resets; 0 never resets.
    pub reset_after: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_runs: None,
            single_run: false,
            sections: None,
            always_span: false,
            num_windows: 2,
            soft_limit: 300,
            hard_limit: 500,
            dep_allow_loops: false,
            dep_no_crossing: false,
            no_mappings: false,
            no_corrections: false,
            unsafe_by_default: false,
            allow_magic_readings: true,
            ignore_barriers: false,
            trace: false,
            statistics: false,
            reset_after: 1000,
        }
    }
}

// --- Input -------------------------------------------------------------------

/// One reading of an input cohort. Tags are given as text; dependency
/// (`#3->1`) and relation (`ID:3`, `R:obj:4`) tags are taken out of the
/// reading and applied to the cohort.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputReading {
    /// With or without the surrounding quotes.
    pub baseform: String,
    pub tags: Vec<String>,
    pub sub: Option<Box<InputReading>>,
}

impl InputReading {
    pub fn new(baseform: impl Into<String>, tags: &[&str]) -> Self {
        InputReading {
            baseform: baseform.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            sub: None,
        }
    }

    /// Chain a sub-reading below this one.
    pub fn sub(mut self, reading: InputReading) -> Self {
        self.sub = Some(Box::new(reading));
        self
    }
}

/// A token with its candidate readings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputCohort {
    /// With or without the surrounding `"<` `>"`.
    pub wordform: String,
    pub readings: Vec<InputReading>,
}

impl InputCohort {
    pub fn new(wordform: impl Into<String>) -> Self {
        InputCohort { wordform: wordform.into(), readings: Vec::new() }
    }

    pub fn reading(self, baseform: &str, tags: &[&str]) -> Self {
        self.with_reading(InputReading::new(baseform, tags))
    }

    pub fn with_reading(mut self, reading: InputReading) -> Self {
        self.readings.push(reading);
        self
    }
}

/// One item of the input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputItem {
    Cohort(InputCohort),
    /// A plain-text line between cohorts.
    Text(String),
    /// Process and emit everything buffered.
    Flush,
    /// Process what is buffered and ignore the rest of the stream.
    Exit,
    SetVariable { key: String, value: Option<String> },
    RemVariable(String),
}

// --- Applicator --------------------------------------------------------------

/// Applies a grammar to a stream of input items.
///
/// Windows are filled from the input, closed at delimiters, run once
/// `num_windows` later windows are buffered, and emitted once they fall out of
/// the look-behind. [`finish`](Self::finish) drains everything.
pub struct Applicator<'g> {
    ctx: EngineContext<'g>,
    /// The window being filled from input, not yet visible to rules.
    filling: Option<SingleWindow>,
    pending_relations: Vec<PendingRelation>,
    exited: bool,
}

impl std::fmt::Debug for Applicator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applicator")
            .field("ctx", &self.ctx)
            .field("filling", &self.filling.as_ref().map(|w| w.len()))
            .field("exited", &self.exited)
            .finish()
    }
}

impl<'g> Applicator<'g> {
    pub fn new(grammar: &'g Grammar, options: Options) -> Self {
        Applicator {
            ctx: EngineContext::new(grammar, options),
            filling: None,
            pending_relations: Vec::new(),
            exited: false,
        }
    }

    /// Install the handler that answers EXTERNAL rules.
    pub fn set_external(&mut self, handler: impl ExternalHandler + 'g) {
        self.ctx.external = Some(Box::new(handler));
    }

    pub fn options(&self) -> &Options {
        &self.ctx.options
    }

    /// Counters collected with [`Options::statistics`].
    pub fn statistics(&self) -> Option<&Statistics> {
        self.ctx.options.statistics.then_some(&self.ctx.stats)
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.ctx.metrics
    }

    /// Feed every item, then [`finish`](Self::finish).
    pub fn run<I>(&mut self, items: I, out: &mut dyn OutputSink) -> io::Result<()>
    where
        I: IntoIterator<Item = InputItem>,
    {
        for item in items {
            if self.exited {
                break;
            }
            self.push(item, out)?;
        }
        self.finish(out)
    }

    /// Feed one item. Windows that are done are written to `out`.
    pub fn push(&mut self, item: InputItem, out: &mut dyn OutputSink) -> io::Result<()> {
        if self.exited {
            return Ok(());
        }
        match item {
            InputItem::Cohort(cohort) => {
                let id = self.add_cohort(&cohort);
                if let Some(reason) = self.break_reason(id) {
                    tracing::trace!(reason, "closing window");
                    self.close_window(out)?;
                }
            }
            InputItem::Text(line) => {
                let delimits = self.is_text_delimiter(&line);
                self.add_text(&line);
                if delimits {
                    self.close_window(out)?;
                }
            }
            InputItem::Flush => {
                self.close_window(out)?;
                self.drain(out)?;
                out.emit_stream_command(CMD_FLUSH)?;
            }
            InputItem::Exit => {
                self.finish(out)?;
                out.emit_stream_command(CMD_EXIT)?;
                self.exited = true;
            }
            InputItem::SetVariable { key, value } => {
                let command = match &value {
                    Some(v) => format!("<STREAMCMD:SETVAR:{key}={v}>"),
                    None => format!("<STREAMCMD:SETVAR:{key}>"),
                };
                let window = self.filling_window();
                window.record_set_variable(hash_text(&key, 0), value.map(|v| hash_text(&v, 0)));
                window.commands.push(command);
            }
            InputItem::RemVariable(key) => {
                let window = self.filling_window();
                window.record_rem_variable(hash_text(&key, 0));
                window.commands.push(format!("<STREAMCMD:REMVAR:{key}>"));
            }
        }
        Ok(())
    }

    /// Close the open window and process and emit everything buffered.
    pub fn finish(&mut self, out: &mut dyn OutputSink) -> io::Result<()> {
        self.close_window(out)?;
        self.drain(out)
    }

    // --- Filling ----------------------------------------------------------------

    fn filling_window(&mut self) -> &mut SingleWindow {
        let window = match self.filling.take() {
            Some(window) => window,
            None => {
                let mut window = self.ctx.buffer.new_window();
                window.cohorts.push(self.ctx.new_begin_cohort(window.number));
                window
            }
        };
        self.filling.insert(window)
    }

    fn add_cohort(&mut self, input: &InputCohort) -> CohortId {
        let number = self.filling_window().number;
        let wordform = self.intern(&quoted(&input.wordform, "\"<", ">\""));
        let id = self.ctx.buffer.alloc_cohort(wordform);
        let global = self.ctx.buffer.cohort(id).global_number;

        let mut readings = Vec::with_capacity(input.readings.len());
        for reading in &input.readings {
            readings.push(self.input_reading(id, global, wordform, reading));
        }
        if readings.is_empty() {
            let mut reading = self.ctx.make_reading(wordform, &[]);
            reading.noprint = true;
            readings.push(reading);
        }

        let parentheses = &self.ctx.grammar.parentheses;
        let cohort = self.ctx.buffer.cohort_mut(id);
        cohort.window = number;
        cohort.is_pleft = parentheses.iter().any(|(l, _)| *l == wordform);
        cohort.is_pright = parentheses.iter().any(|(_, r)| *r == wordform);
        for reading in readings {
            cohort.append_reading(reading);
        }
        self.ctx.refresh_cohort(id);
        if let Some(window) = self.filling.as_mut() {
            window.cohorts.push(id);
            if let Some(c) = self.ctx.buffer.get_mut(id) {
                c.local_number = window.cohorts.len() as u32 - 1;
            }
        }
        id
    }

    /// Build one reading, applying dependency and relation tags to the cohort.
    fn input_reading(&mut self, id: CohortId, global: u32, wordform: TagHash, input: &InputReading) -> Reading {
        let mut tags = Vec::with_capacity(input.tags.len() + 1);
        if !input.baseform.is_empty() {
            tags.push(self.intern(&quoted(&input.baseform, "\"", "\"")));
        }
        for text in &input.tags {
            let Some(hash) = self.ctx.tags.intern(text) else { continue };
            let tag = self.ctx.tags.tag(hash);
            if let Some((me, parent)) = tag.and_then(|t| t.dep) {
                self.ctx.seen_dependencies = true;
                let cohort = self.ctx.buffer.cohort_mut(id);
                cohort.dep_self = me;
                cohort.dep_parent = Some(parent);
                cohort.flags |= CohortFlags::DEP_INPUT;
                if let Some(window) = self.filling.as_mut() {
                    window.dep_map.insert(me, global);
                }
                continue;
            }
            if let Some((label, n)) = tag.and_then(|t| t.relation.clone()) {
                self.ctx.seen_relations = true;
                if label.is_empty() {
                    if let Some(window) = self.filling.as_mut() {
                        window.relation_map.insert(n, global);
                    }
                } else if let Some(label) = self.ctx.tags.intern(&label) {
                    self.pending_relations.push(PendingRelation { from: id, label, to_input: n });
                }
                continue;
            }
            tags.push(hash);
        }
        let mut reading = self.ctx.make_reading(wordform, &tags);
        if let Some(sub) = &input.sub {
            reading.next = Some(Box::new(self.input_reading(id, global, wordform, sub)));
        }
        reading
    }

    fn intern(&mut self, text: &str) -> TagHash {
        self.ctx.tags.intern(text).unwrap_or(self.ctx.grammar.tag_any)
    }

    /// Text goes after the last cohort, or before the window when it has
    /// none yet.
    fn add_text(&mut self, line: &str) {
        let window = self.filling_window();
        let last = (window.len() > 1).then(|| window.last()).flatten();
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        match last.and_then(|id| self.ctx.buffer.get_mut(id)) {
            Some(cohort) => cohort.text.push_str(&line),
            None => {
                if let Some(window) = self.filling.as_mut() {
                    window.text.push_str(&line);
                }
            }
        }
    }

    // --- Window boundaries --------------------------------------------------------

    /// Why the window should close after cohort `id`, if it should.
    fn break_reason(&mut self, id: CohortId) -> Option<&'static str> {
        let grammar = self.ctx.grammar;
        let size = self.filling.as_ref().map_or(0, |w| w.len().saturating_sub(1));
        if grammar.delimiters.is_some_and(|set| self.cohort_in(id, set)) {
            return Some("delimiter");
        }
        if size >= self.ctx.options.soft_limit && grammar.soft_delimiters.is_some_and(|set| self.cohort_in(id, set)) {
            tracing::debug!(cohorts = size, "soft limit reached at a soft delimiter");
            return Some("soft delimiter");
        }
        if size >= self.ctx.options.hard_limit {
            tracing::warn!(cohorts = size, "hard window limit reached, forcing a window break");
            return Some("hard limit");
        }
        None
    }

    fn cohort_in(&mut self, id: CohortId, set: SetId) -> bool {
        let mut state = MatchState::default();
        self.ctx.matcher(&mut state).cohort_matches(id, set, CohortMatch::default())
    }

    fn is_text_delimiter(&self, line: &str) -> bool {
        let grammar = self.ctx.grammar;
        let Some(set) = grammar.text_delimiters else { return false };
        grammar
            .set(set)
            .flat_tags()
            .filter_map(|t| grammar.tag(t).and_then(|t| t.regex.as_ref()))
            .any(|re| re.is_match(line.trim_end()))
    }

    /// Queue the filling window and run whatever has enough look-ahead.
    fn close_window(&mut self, out: &mut dyn OutputSink) -> io::Result<()> {
        let Some(window) = self.filling.take() else { return Ok(()) };
        let number = window.number;
        self.ctx.buffer.next.push_back(window);
        self.ctx.settle_window(number);
        self.ctx.reflow_dependencies(number);
        let pending = std::mem::take(&mut self.pending_relations);
        self.ctx.resolve_relations(number, pending);
        self.ctx.annotate_enclosures(number);
        self.step(out, false)
    }

    // --- Running and emitting -------------------------------------------------------

    /// Run queued windows while more than `num_windows` follow them (all of
    /// them with `drain`), and emit windows that left the look-behind.
    fn step(&mut self, out: &mut dyn OutputSink, drain: bool) -> io::Result<()> {
        let keep = self.ctx.options.num_windows;
        while self.ctx.buffer.next.len() > if drain { 0 } else { keep } {
            self.ctx.buffer.shift();
            let Some(number) = self.ctx.buffer.current_number() else { break };
            let metrics = self.ctx.run_window(number);
            self.ctx.metrics.record(metrics);
            self.ctx.since_reset += 1;
            let reset_after = self.ctx.options.reset_after;
            if reset_after > 0 && self.ctx.since_reset >= reset_after {
                self.ctx.reset_caches();
            }
            while self.ctx.buffer.previous.len() > keep {
                self.emit_oldest(out)?;
            }
        }
        Ok(())
    }

    fn drain(&mut self, out: &mut dyn OutputSink) -> io::Result<()> {
        self.step(out, true)?;
        if let Some(current) = self.ctx.buffer.current.take() {
            self.ctx.buffer.previous.push_back(current);
        }
        while !self.ctx.buffer.previous.is_empty() {
            self.emit_oldest(out)?;
        }
        Ok(())
    }

    fn emit_oldest(&mut self, out: &mut dyn OutputSink) -> io::Result<()> {
        let Some(window) = self.ctx.buffer.pop_oldest() else { return Ok(()) };
        for command in &window.commands {
            out.emit_stream_command(command)?;
        }
        let result = out.emit_window(&self.ctx.output_view(), &window);
        self.ctx.buffer.release_window(window);
        result
    }
}

/// Wrap `text` in `open`/`close` unless it already is.
fn quoted(text: &str, open: &str, close: &str) -> String {
    if text.len() >= open.len() + close.len() && text.starts_with(open) && text.ends_with(close) {
        text.to_string()
    } else {
        format!("{open}{text}{close}")
    }
}
