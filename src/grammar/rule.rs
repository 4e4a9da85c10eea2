//! Rules: one grammar statement each.

use crate::error::GrammarError;
use crate::{ContextId, RuleId, SetId, TagHash};

use super::contextual_test::SubReading;

/// The action keyword of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Select,
    Remove,
    /// SELECT when the tests hold, REMOVE otherwise.
    Iff,
    Map,
    Add,
    Replace,
    Append,
    Substitute,
    Copy,
    Unmap,
    Protect,
    Unprotect,
    SetParent,
    SetChild,
    AddRelation,
    AddRelations,
    SetRelation,
    SetRelations,
    RemRelation,
    RemRelations,
    MoveAfter,
    MoveBefore,
    Switch,
    RemCohort,
    AddCohortAfter,
    AddCohortBefore,
    SplitCohort,
    MergeCohorts,
    SetVariable,
    RemVariable,
    Delimit,
    Match,
    Jump,
    Execute,
    ExternalOnce,
    ExternalAlways,
    With,
}

impl RuleKind {
    pub fn keyword(self) -> &'static str {
        match self {
            RuleKind::Select => "SELECT",
            RuleKind::Remove => "REMOVE",
            RuleKind::Iff => "IFF",
            RuleKind::Map => "MAP",
            RuleKind::Add => "ADD",
            RuleKind::Replace => "REPLACE",
            RuleKind::Append => "APPEND",
            RuleKind::Substitute => "SUBSTITUTE",
            RuleKind::Copy => "COPY",
            RuleKind::Unmap => "UNMAP",
            RuleKind::Protect => "PROTECT",
            RuleKind::Unprotect => "UNPROTECT",
            RuleKind::SetParent => "SETPARENT",
            RuleKind::SetChild => "SETCHILD",
            RuleKind::AddRelation => "ADDRELATION",
            RuleKind::AddRelations => "ADDRELATIONS",
            RuleKind::SetRelation => "SETRELATION",
            RuleKind::SetRelations => "SETRELATIONS",
            RuleKind::RemRelation => "REMRELATION",
            RuleKind::RemRelations => "REMRELATIONS",
            RuleKind::MoveAfter => "MOVE-AFTER",
            RuleKind::MoveBefore => "MOVE-BEFORE",
            RuleKind::Switch => "SWITCH",
            RuleKind::RemCohort => "REMCOHORT",
            RuleKind::AddCohortAfter => "ADDCOHORT-AFTER",
            RuleKind::AddCohortBefore => "ADDCOHORT-BEFORE",
            RuleKind::SplitCohort => "SPLITCOHORT",
            RuleKind::MergeCohorts => "MERGECOHORTS",
            RuleKind::SetVariable => "SETVARIABLE",
            RuleKind::RemVariable => "REMVARIABLE",
            RuleKind::Delimit => "DELIMIT",
            RuleKind::Match => "MATCH",
            RuleKind::Jump => "JUMP",
            RuleKind::Execute => "EXECUTE",
            RuleKind::ExternalOnce => "EXTERNAL-ONCE",
            RuleKind::ExternalAlways => "EXTERNAL-ALWAYS",
            RuleKind::With => "WITH",
        }
    }

    /// Only removes readings; counted as a correction-free disambiguation step.
    pub fn is_disambiguation(self) -> bool {
        matches!(self, RuleKind::Select | RuleKind::Remove | RuleKind::Iff)
    }

    /// Adds or rewrites mapping tags (skipped with `Options::no_mappings`).
    pub fn is_mapping(self) -> bool {
        matches!(self, RuleKind::Map | RuleKind::Add | RuleKind::Replace)
    }

    /// Rewrites readings in place (skipped with `Options::no_corrections`).
    pub fn is_correction(self) -> bool {
        matches!(self, RuleKind::Substitute | RuleKind::Append | RuleKind::Copy)
    }

    /// Needs a dependency target context.
    pub fn needs_dep_target(self) -> bool {
        matches!(
            self,
            RuleKind::SetParent
                | RuleKind::SetChild
                | RuleKind::AddRelation
                | RuleKind::AddRelations
                | RuleKind::SetRelation
                | RuleKind::SetRelations
                | RuleKind::RemRelation
                | RuleKind::RemRelations
                | RuleKind::MoveAfter
                | RuleKind::MoveBefore
                | RuleKind::Switch
                | RuleKind::MergeCohorts
        )
    }

    /// Needs a maplist.
    pub fn needs_maplist(self) -> bool {
        matches!(
            self,
            RuleKind::Map
                | RuleKind::Add
                | RuleKind::Replace
                | RuleKind::Append
                | RuleKind::Substitute
                | RuleKind::Copy
                | RuleKind::AddRelation
                | RuleKind::AddRelations
                | RuleKind::SetRelation
                | RuleKind::SetRelations
                | RuleKind::RemRelation
                | RuleKind::RemRelations
                | RuleKind::AddCohortAfter
                | RuleKind::AddCohortBefore
                | RuleKind::SplitCohort
                | RuleKind::MergeCohorts
                | RuleKind::SetVariable
                | RuleKind::RemVariable
        )
    }

    /// Needs a sublist in addition to the maplist.
    pub fn needs_sublist(self) -> bool {
        matches!(
            self,
            RuleKind::Substitute | RuleKind::AddRelations | RuleKind::SetRelations | RuleKind::RemRelations
        )
    }

    /// Applied at most once per reading: the rule is recorded in `hit_by` and
    /// not applied again to a reading that carries it.
    pub fn is_one_shot(self) -> bool {
        matches!(
            self,
            RuleKind::Map
                | RuleKind::Add
                | RuleKind::Append
                | RuleKind::Substitute
                | RuleKind::Copy
                | RuleKind::MoveAfter
                | RuleKind::MoveBefore
                | RuleKind::Switch
                | RuleKind::AddCohortAfter
                | RuleKind::AddCohortBefore
                | RuleKind::SplitCohort
                | RuleKind::MergeCohorts
                | RuleKind::ExternalOnce
        )
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RuleFlags: u64 {
        const NEAREST     = 1 << 0;
        const ALLOWLOOP   = 1 << 1;
        const DELAYED     = 1 << 2;
        const LOOKDELETED = 1 << 3;
        const LOOKDELAYED = 1 << 4;
        const UNSAFE      = 1 << 5;
        const SAFE        = 1 << 6;
        const REMEMBERX   = 1 << 7;
        const RESETX      = 1 << 8;
        const KEEPORDER   = 1 << 9;
        const VARYORDER   = 1 << 10;
        const ENCL_INNER  = 1 << 11;
        const ENCL_OUTER  = 1 << 12;
        const ENCL_FINAL  = 1 << 13;
        const ENCL_ANY    = 1 << 14;
        const ALLOWCROSS  = 1 << 15;
        const WITHCHILD   = 1 << 16;
        const NOCHILD     = 1 << 17;
        const ITERATE     = 1 << 18;
        const NOITERATE   = 1 << 19;
        const UNMAPLAST   = 1 << 20;
        const REVERSE     = 1 << 21;
        const REPEAT      = 1 << 22;
        const BEFORE      = 1 << 23;
        const AFTER       = 1 << 24;
    }
}

const EXCLUSIVE_FLAGS: &[(RuleFlags, &str, RuleFlags, &str)] = &[
    (RuleFlags::SAFE, "SAFE", RuleFlags::UNSAFE, "UNSAFE"),
    (RuleFlags::ITERATE, "ITERATE", RuleFlags::NOITERATE, "NOITERATE"),
    (RuleFlags::BEFORE, "BEFORE", RuleFlags::AFTER, "AFTER"),
    (RuleFlags::REMEMBERX, "REMEMBERX", RuleFlags::RESETX, "RESETX"),
    (RuleFlags::WITHCHILD, "WITHCHILD", RuleFlags::NOCHILD, "NOCHILD"),
    (RuleFlags::KEEPORDER, "KEEPORDER", RuleFlags::VARYORDER, "VARYORDER"),
    (RuleFlags::ENCL_INNER, "ENCL_INNER", RuleFlags::ENCL_OUTER, "ENCL_OUTER"),
    (RuleFlags::ENCL_INNER, "ENCL_INNER", RuleFlags::ENCL_FINAL, "ENCL_FINAL"),
    (RuleFlags::ENCL_INNER, "ENCL_INNER", RuleFlags::ENCL_ANY, "ENCL_ANY"),
    (RuleFlags::ENCL_OUTER, "ENCL_OUTER", RuleFlags::ENCL_FINAL, "ENCL_FINAL"),
    (RuleFlags::ENCL_OUTER, "ENCL_OUTER", RuleFlags::ENCL_ANY, "ENCL_ANY"),
    (RuleFlags::ENCL_FINAL, "ENCL_FINAL", RuleFlags::ENCL_ANY, "ENCL_ANY"),
];

impl RuleFlags {
    /// Reject combinations that contradict each other.
    pub fn validate(self, line: u32) -> Result<(), GrammarError> {
        for (a, a_name, b, b_name) in EXCLUSIVE_FLAGS {
            if self.contains(*a) && self.contains(*b) {
                return Err(GrammarError::ConflictingFlags { line, a: a_name, b: b_name });
            }
        }
        Ok(())
    }
}

/// Which pass group a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    /// `BEFORE-SECTIONS`: run once per window before the numbered sections.
    Before,
    /// `SECTION n` (0-based).
    Main(u32),
    /// `AFTER-SECTIONS`: run after the numbered sections.
    After,
    /// `NULL-SECTION`: parsed but never run.
    Null,
}

impl Default for Section {
    fn default() -> Self {
        Section::Main(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Position in the grammar's rule list; assigned by the builder.
    pub id: RuleId,
    pub name: Option<String>,
    pub line: u32,
    pub kind: RuleKind,
    /// Restricts the rule to cohorts with this wordform.
    pub wordform: Option<TagHash>,
    pub target: SetId,
    pub tests: Vec<ContextId>,
    pub dep_target: Option<ContextId>,
    pub dep_tests: Vec<ContextId>,
    pub maplist: Option<SetId>,
    pub sublist: Option<SetId>,
    pub flags: RuleFlags,
    pub section: Section,
    /// Reading level the target set is tested against.
    pub sub_reading: SubReading,
    /// Inner rules of a WITH block.
    pub sub_rules: Vec<RuleId>,
    /// Outer WITH rule, for inner rules.
    pub parent: Option<RuleId>,
    /// Anchor of a JUMP, or start anchor of an EXECUTE.
    pub jump_to: Option<String>,
    /// End anchor of an EXECUTE.
    pub jump_end: Option<String>,
    /// Program of an EXTERNAL rule.
    pub external: Option<String>,
}

impl Rule {
    pub fn new(kind: RuleKind, target: SetId) -> Self {
        Rule {
            id: RuleId(0),
            name: None,
            line: 0,
            kind,
            wordform: None,
            target,
            tests: Vec::new(),
            dep_target: None,
            dep_tests: Vec::new(),
            maplist: None,
            sublist: None,
            flags: RuleFlags::empty(),
            section: Section::default(),
            sub_reading: SubReading::default(),
            sub_rules: Vec::new(),
            parent: None,
            jump_to: None,
            jump_end: None,
            external: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    pub fn wordform(mut self, tag: TagHash) -> Self {
        self.wordform = Some(tag);
        self
    }

    pub fn test(mut self, test: ContextId) -> Self {
        self.tests.push(test);
        self
    }

    pub fn dep_target(mut self, test: ContextId) -> Self {
        self.dep_target = Some(test);
        self
    }

    pub fn dep_test(mut self, test: ContextId) -> Self {
        self.dep_tests.push(test);
        self
    }

    pub fn maplist(mut self, set: SetId) -> Self {
        self.maplist = Some(set);
        self
    }

    pub fn sublist(mut self, set: SetId) -> Self {
        self.sublist = Some(set);
        self
    }

    pub fn flags(mut self, flags: RuleFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn section(mut self, section: Section) -> Self {
        self.section = section;
        self
    }

    pub fn sub_reading(mut self, sub: SubReading) -> Self {
        self.sub_reading = sub;
        self
    }

    pub fn jump_to(mut self, anchor: impl Into<String>) -> Self {
        self.jump_to = Some(anchor.into());
        self
    }

    pub fn execute(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.jump_to = Some(from.into());
        self.jump_end = Some(to.into());
        self
    }

    pub fn external(mut self, program: impl Into<String>) -> Self {
        self.external = Some(program.into());
        self
    }

    /// Name used in traces: the rule name, or the keyword.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.kind.keyword())
    }

    /// Every context the rule refers to directly.
    pub fn contexts(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.tests.iter().chain(self.dep_target.iter()).chain(self.dep_tests.iter()).copied()
    }

    pub(crate) fn check_operands(&self) -> Result<(), GrammarError> {
        let missing = |what| GrammarError::MissingOperand { line: self.line, kind: self.kind.keyword(), what };
        if self.kind.needs_dep_target() && self.dep_target.is_none() {
            return Err(missing("a dependency target"));
        }
        if self.kind.needs_maplist() && self.maplist.is_none() {
            return Err(missing("a tag list"));
        }
        if self.kind.needs_sublist() && self.sublist.is_none() {
            return Err(missing("a second tag list"));
        }
        match self.kind {
            RuleKind::Jump if self.jump_to.is_none() => Err(missing("an anchor")),
            RuleKind::Execute if self.jump_to.is_none() || self.jump_end.is_none() => Err(missing("two anchors")),
            RuleKind::ExternalOnce | RuleKind::ExternalAlways if self.external.is_none() => {
                Err(missing("a program"))
            }
            RuleKind::With if self.sub_rules.is_empty() => Err(missing("inner rules")),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_flags_are_rejected() {
        assert!(RuleFlags::SAFE.validate(1).is_ok());
        let err = (RuleFlags::SAFE | RuleFlags::UNSAFE).validate(7).unwrap_err();
        assert!(matches!(err, GrammarError::ConflictingFlags { line: 7, a: "SAFE", b: "UNSAFE" }));
        assert!((RuleFlags::ENCL_OUTER | RuleFlags::ENCL_ANY).validate(1).is_err());
    }

    #[test]
    fn operands_are_checked_per_kind() {
        let rule = Rule::new(RuleKind::SetParent, SetId(0)).line(3);
        assert!(matches!(rule.check_operands(), Err(GrammarError::MissingOperand { line: 3, .. })));
        let rule = Rule::new(RuleKind::Select, SetId(0));
        assert!(rule.check_operands().is_ok());
        assert_eq!(rule.display_name(), "SELECT");
    }

    #[test]
    fn sections_order_before_main_after() {
        assert!(Section::Before < Section::Main(0));
        assert!(Section::Main(3) < Section::After);
    }
}
