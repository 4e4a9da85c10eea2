//! Contextual tests: the positional predicates of a rule's `IF` clause.
//!
//! A test names *where* to look (the [`Position`] plus an offset) and *what*
//! must be found there (a target set). Tests compose in three ways:
//!
//! ```text
//! (-1 ADJ LINK 1 DET)        linked:  re-anchor at the cohort found by -1
//! ((1 N) OR (1 PRON))        ors:     alternatives from the same anchor
//! (T:np)                     tmpl:    reference to a shared named test
//! ```
//!
//! Positions are modelled as a struct of enums and booleans. [`PosFlags`] is
//! the bit-packed form used by grammar serializers; [`Position::from_flags`]
//! and [`Position::to_flags`] convert at that boundary.

use crate::{ContextId, SetId, TagHash};

bitflags::bitflags! {
    /// Bit-packed position flags, as stored by compiled grammars.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PosFlags: u64 {
        const CAREFUL        = 1 << 0;
        const NEGATE         = 1 << 1;
        const NOT            = 1 << 2;
        const SCANFIRST      = 1 << 3;
        const SCANALL        = 1 << 4;
        const ABSOLUTE       = 1 << 5;
        const SPAN_RIGHT     = 1 << 6;
        const SPAN_LEFT      = 1 << 7;
        const SPAN_BOTH      = 1 << 8;
        const DEP_PARENT     = 1 << 9;
        const DEP_SIBLING    = 1 << 10;
        const DEP_CHILD      = 1 << 11;
        const PASS_ORIGIN    = 1 << 12;
        const NO_PASS_ORIGIN = 1 << 13;
        const LEFT_PAR       = 1 << 14;
        const RIGHT_PAR      = 1 << 15;
        const SELF           = 1 << 16;
        const NONE           = 1 << 17;
        const ALL            = 1 << 18;
        const DEP_DEEP       = 1 << 19;
        const MARK_SET       = 1 << 20;
        const MARK_JUMP      = 1 << 21;
        const LOOK_DELETED   = 1 << 22;
        const LOOK_DELAYED   = 1 << 23;
        const TMPL_OVERRIDE  = 1 << 24;
        const RELATION       = 1 << 26;
        const ATTACH_TO      = 1 << 27;
        const BAG_OF_TAGS    = 1 << 29;
        const DEP_GLOB       = 1 << 30;
        const LEFT           = 1 << 32;
        const RIGHT          = 1 << 33;
        const LEFTMOST       = 1 << 34;
        const RIGHTMOST      = 1 << 35;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepAxis {
    #[default]
    Parent,
    Child,
    Sibling,
}

/// How far a dependency step reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepDepth {
    /// One hop (`p`, `c`, `s`).
    #[default]
    Direct,
    /// Transitive (`pp`, `cc`); barriers cut the walk.
    Deep,
    /// Transitive over the whole tree, ignoring barriers.
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepStep {
    pub axis: DepAxis,
    pub depth: DepDepth,
    /// The anchor itself is also a candidate (`cS`, `pS`).
    pub include_self: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnclosureEdge {
    /// The opening parenthesis of the innermost enclosure around the anchor.
    Left,
    /// The closing parenthesis of the innermost enclosure around the anchor.
    Right,
}

/// Where the candidate cohorts of a test come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Traversal {
    /// Offset relative to the anchor, in cohorts.
    #[default]
    Window,
    /// Offset from the window start (`@1` first real cohort, `@-1` last).
    Absolute,
    Dependency(DepStep),
    /// Cohorts related by a labelled relation (`r:LABEL`, `r:*`).
    Relation,
    Enclosure(EnclosureEdge),
    /// The union of all tags in the window, tested as one reading.
    BagOfTags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scan {
    /// Only the cohort at the offset.
    #[default]
    Exact,
    /// `*`: walk outward and stop at the first cohort matching the target.
    First,
    /// `**`: walk outward until the target and the linked chain both match.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Quantifier {
    /// Some candidate must satisfy the test.
    #[default]
    Exists,
    /// Every candidate must satisfy the test (and there must be one).
    All,
    /// No candidate may satisfy the target together with its linked chain.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OriginPassing {
    /// Scans may pass the rule's target cohort unless the rule says otherwise.
    #[default]
    Default,
    /// `o`: scans may run past the rule's target cohort.
    Pass,
    /// `O`: scans stop before the rule's target cohort.
    NoPass,
}

/// Restriction of dependency and relation candidates to one side of the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Side {
    #[default]
    Both,
    Left,
    Right,
}

/// Which of several dependency or relation candidates to consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Pick {
    #[default]
    Each,
    Leftmost,
    Rightmost,
}

/// Decoded position of a contextual test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Position {
    pub traversal: Traversal,
    pub scan: Scan,
    pub quantifier: Quantifier,
    /// `C`: every reading of the candidate must match.
    pub careful: bool,
    /// `NOT`: invert the target match of this node.
    pub not: bool,
    /// `NEGATE`: invert the result of this node including its linked chain.
    pub negate: bool,
    pub span_left: bool,
    pub span_right: bool,
    pub origin: OriginPassing,
    /// `X`: remember the found cohort as the mark.
    pub set_mark: bool,
    /// `x`: start from the mark instead of the anchor.
    pub jump_mark: bool,
    /// `A`: the found cohort becomes the attachment point of dependency rules.
    pub attach_to: bool,
    pub look_deleted: bool,
    pub look_delayed: bool,
    /// A template reference whose own offset and position replace the
    /// template's.
    pub tmpl_override: bool,
    pub side: Side,
    pub pick: Pick,
}

impl Position {
    pub fn from_flags(flags: PosFlags) -> Self {
        let traversal = if flags.contains(PosFlags::ABSOLUTE) {
            Traversal::Absolute
        } else if flags.intersects(PosFlags::DEP_PARENT | PosFlags::DEP_CHILD | PosFlags::DEP_SIBLING) {
            let axis = if flags.contains(PosFlags::DEP_PARENT) {
                DepAxis::Parent
            } else if flags.contains(PosFlags::DEP_CHILD) {
                DepAxis::Child
            } else {
                DepAxis::Sibling
            };
            let depth = if flags.contains(PosFlags::DEP_GLOB) {
                DepDepth::Global
            } else if flags.contains(PosFlags::DEP_DEEP) {
                DepDepth::Deep
            } else {
                DepDepth::Direct
            };
            Traversal::Dependency(DepStep { axis, depth, include_self: flags.contains(PosFlags::SELF) })
        } else if flags.contains(PosFlags::RELATION) {
            Traversal::Relation
        } else if flags.contains(PosFlags::LEFT_PAR) {
            Traversal::Enclosure(EnclosureEdge::Left)
        } else if flags.contains(PosFlags::RIGHT_PAR) {
            Traversal::Enclosure(EnclosureEdge::Right)
        } else if flags.contains(PosFlags::BAG_OF_TAGS) {
            Traversal::BagOfTags
        } else {
            Traversal::Window
        };

        let scan = if flags.contains(PosFlags::SCANALL) {
            Scan::All
        } else if flags.contains(PosFlags::SCANFIRST) {
            Scan::First
        } else {
            Scan::Exact
        };
        let quantifier = if flags.contains(PosFlags::ALL) {
            Quantifier::All
        } else if flags.contains(PosFlags::NONE) {
            Quantifier::None
        } else {
            Quantifier::Exists
        };
        let both = flags.contains(PosFlags::SPAN_BOTH);
        let origin = if flags.contains(PosFlags::NO_PASS_ORIGIN) {
            OriginPassing::NoPass
        } else if flags.contains(PosFlags::PASS_ORIGIN) {
            OriginPassing::Pass
        } else {
            OriginPassing::Default
        };
        let side = if flags.contains(PosFlags::LEFT) {
            Side::Left
        } else if flags.contains(PosFlags::RIGHT) {
            Side::Right
        } else {
            Side::Both
        };
        let pick = if flags.contains(PosFlags::LEFTMOST) {
            Pick::Leftmost
        } else if flags.contains(PosFlags::RIGHTMOST) {
            Pick::Rightmost
        } else {
            Pick::Each
        };

        Position {
            traversal,
            scan,
            quantifier,
            careful: flags.contains(PosFlags::CAREFUL),
            not: flags.contains(PosFlags::NOT),
            negate: flags.contains(PosFlags::NEGATE),
            span_left: both || flags.contains(PosFlags::SPAN_LEFT),
            span_right: both || flags.contains(PosFlags::SPAN_RIGHT),
            origin,
            set_mark: flags.contains(PosFlags::MARK_SET),
            jump_mark: flags.contains(PosFlags::MARK_JUMP),
            attach_to: flags.contains(PosFlags::ATTACH_TO),
            look_deleted: flags.contains(PosFlags::LOOK_DELETED),
            look_delayed: flags.contains(PosFlags::LOOK_DELAYED),
            tmpl_override: flags.contains(PosFlags::TMPL_OVERRIDE),
            side,
            pick,
        }
    }

    pub fn to_flags(&self) -> PosFlags {
        let mut flags = PosFlags::empty();
        match self.traversal {
            Traversal::Window => {}
            Traversal::Absolute => flags |= PosFlags::ABSOLUTE,
            Traversal::Dependency(step) => {
                flags |= match step.axis {
                    DepAxis::Parent => PosFlags::DEP_PARENT,
                    DepAxis::Child => PosFlags::DEP_CHILD,
                    DepAxis::Sibling => PosFlags::DEP_SIBLING,
                };
                match step.depth {
                    DepDepth::Direct => {}
                    DepDepth::Deep => flags |= PosFlags::DEP_DEEP,
                    DepDepth::Global => flags |= PosFlags::DEP_GLOB,
                }
                flags.set(PosFlags::SELF, step.include_self);
            }
            Traversal::Relation => flags |= PosFlags::RELATION,
            Traversal::Enclosure(EnclosureEdge::Left) => flags |= PosFlags::LEFT_PAR,
            Traversal::Enclosure(EnclosureEdge::Right) => flags |= PosFlags::RIGHT_PAR,
            Traversal::BagOfTags => flags |= PosFlags::BAG_OF_TAGS,
        }
        match self.scan {
            Scan::Exact => {}
            Scan::First => flags |= PosFlags::SCANFIRST,
            Scan::All => flags |= PosFlags::SCANALL,
        }
        match self.quantifier {
            Quantifier::Exists => {}
            Quantifier::All => flags |= PosFlags::ALL,
            Quantifier::None => flags |= PosFlags::NONE,
        }
        match (self.span_left, self.span_right) {
            (true, true) => flags |= PosFlags::SPAN_BOTH,
            (true, false) => flags |= PosFlags::SPAN_LEFT,
            (false, true) => flags |= PosFlags::SPAN_RIGHT,
            (false, false) => {}
        }
        match self.origin {
            OriginPassing::Default => {}
            OriginPassing::Pass => flags |= PosFlags::PASS_ORIGIN,
            OriginPassing::NoPass => flags |= PosFlags::NO_PASS_ORIGIN,
        }
        match self.side {
            Side::Both => {}
            Side::Left => flags |= PosFlags::LEFT,
            Side::Right => flags |= PosFlags::RIGHT,
        }
        match self.pick {
            Pick::Each => {}
            Pick::Leftmost => flags |= PosFlags::LEFTMOST,
            Pick::Rightmost => flags |= PosFlags::RIGHTMOST,
        }
        flags.set(PosFlags::CAREFUL, self.careful);
        flags.set(PosFlags::NOT, self.not);
        flags.set(PosFlags::NEGATE, self.negate);
        flags.set(PosFlags::MARK_SET, self.set_mark);
        flags.set(PosFlags::MARK_JUMP, self.jump_mark);
        flags.set(PosFlags::ATTACH_TO, self.attach_to);
        flags.set(PosFlags::LOOK_DELETED, self.look_deleted);
        flags.set(PosFlags::LOOK_DELAYED, self.look_delayed);
        flags.set(PosFlags::TMPL_OVERRIDE, self.tmpl_override);
        flags
    }

    /// The test looks at more than one cohort.
    pub fn is_scanning(&self) -> bool {
        self.scan != Scan::Exact
    }
}

/// Which level of a cohort's reading chain a test or rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubReading {
    /// `0` is the main reading, `1` its first sub-reading, `-1` the deepest.
    Level(i32),
    /// Any level.
    Any,
}

impl Default for SubReading {
    fn default() -> Self {
        SubReading::Level(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextualTest {
    /// Assigned by the grammar builder.
    pub id: ContextId,
    pub position: Position,
    pub offset: i32,
    pub offset_sub: SubReading,
    /// Label of a relation traversal; `None` means any label.
    pub relation: Option<TagHash>,
    pub target: Option<SetId>,
    pub barrier: Option<SetId>,
    pub cbarrier: Option<SetId>,
    pub linked: Option<ContextId>,
    pub ors: Vec<ContextId>,
    pub tmpl: Option<ContextId>,
    pub line: u32,
    /// Content hash, assigned by the grammar builder.
    pub hash: u64,
}

impl ContextualTest {
    fn blank() -> Self {
        ContextualTest {
            id: ContextId(0),
            position: Position::default(),
            offset: 0,
            offset_sub: SubReading::default(),
            relation: None,
            target: None,
            barrier: None,
            cbarrier: None,
            linked: None,
            ors: Vec::new(),
            tmpl: None,
            line: 0,
            hash: 0,
        }
    }

    /// `(offset SET)`
    pub fn at(offset: i32, target: SetId) -> Self {
        ContextualTest { offset, target: Some(target), ..Self::blank() }
    }

    /// `(offset* SET)`
    pub fn scan(offset: i32, target: SetId) -> Self {
        let mut test = Self::at(offset, target);
        test.position.scan = Scan::First;
        test
    }

    /// `(offset** SET)`
    pub fn scan_all(offset: i32, target: SetId) -> Self {
        let mut test = Self::at(offset, target);
        test.position.scan = Scan::All;
        test
    }

    /// `(@offset SET)`
    pub fn absolute(offset: i32, target: SetId) -> Self {
        let mut test = Self::at(offset, target);
        test.position.traversal = Traversal::Absolute;
        test
    }

    pub fn dependency(axis: DepAxis, target: SetId) -> Self {
        let mut test = Self::at(0, target);
        test.position.traversal = Traversal::Dependency(DepStep { axis, ..DepStep::default() });
        test
    }

    /// `(p SET)`
    pub fn parent(target: SetId) -> Self {
        Self::dependency(DepAxis::Parent, target)
    }

    /// `(c SET)`
    pub fn child(target: SetId) -> Self {
        Self::dependency(DepAxis::Child, target)
    }

    /// `(s SET)`
    pub fn sibling(target: SetId) -> Self {
        Self::dependency(DepAxis::Sibling, target)
    }

    /// `(r:LABEL SET)`; `None` for `r:*`.
    pub fn related(label: Option<TagHash>, target: SetId) -> Self {
        let mut test = Self::at(0, target);
        test.position.traversal = Traversal::Relation;
        test.relation = label;
        test
    }

    /// `(L SET)` / `(R SET)`
    pub fn enclosure(edge: EnclosureEdge, target: SetId) -> Self {
        let mut test = Self::at(0, target);
        test.position.traversal = Traversal::Enclosure(edge);
        test
    }

    /// `(B SET)`
    pub fn bag_of_tags(target: SetId) -> Self {
        let mut test = Self::at(0, target);
        test.position.traversal = Traversal::BagOfTags;
        test
    }

    /// `((..) OR (..))`
    pub fn any_of(alternatives: Vec<ContextId>) -> Self {
        ContextualTest { ors: alternatives, ..Self::blank() }
    }

    /// `(T:name)`
    pub fn template(tmpl: ContextId) -> Self {
        ContextualTest { tmpl: Some(tmpl), ..Self::blank() }
    }

    /// `(offset T:name)`: template with this test's position and offset.
    pub fn template_at(tmpl: ContextId, offset: i32) -> Self {
        let mut test = Self::template(tmpl);
        test.offset = offset;
        test.position.tmpl_override = true;
        test
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn careful(mut self) -> Self {
        self.position.careful = true;
        self
    }

    pub fn not(mut self) -> Self {
        self.position.not = true;
        self
    }

    pub fn negate(mut self) -> Self {
        self.position.negate = true;
        self
    }

    pub fn all(mut self) -> Self {
        self.position.quantifier = Quantifier::All;
        self
    }

    pub fn none(mut self) -> Self {
        self.position.quantifier = Quantifier::None;
        self
    }

    pub fn barrier(mut self, set: SetId) -> Self {
        self.barrier = Some(set);
        self
    }

    pub fn cbarrier(mut self, set: SetId) -> Self {
        self.cbarrier = Some(set);
        self
    }

    pub fn link(mut self, linked: ContextId) -> Self {
        self.linked = Some(linked);
        self
    }

    pub fn span_left(mut self) -> Self {
        self.position.span_left = true;
        self
    }

    pub fn span_right(mut self) -> Self {
        self.position.span_right = true;
        self
    }

    pub fn span_both(self) -> Self {
        self.span_left().span_right()
    }

    pub fn deep(mut self) -> Self {
        if let Traversal::Dependency(step) = &mut self.position.traversal {
            step.depth = DepDepth::Deep;
        }
        self
    }

    pub fn global(mut self) -> Self {
        if let Traversal::Dependency(step) = &mut self.position.traversal {
            step.depth = DepDepth::Global;
        }
        self
    }

    pub fn with_self(mut self) -> Self {
        if let Traversal::Dependency(step) = &mut self.position.traversal {
            step.include_self = true;
        }
        self
    }

    pub fn sub(mut self, sub: SubReading) -> Self {
        self.offset_sub = sub;
        self
    }

    pub fn set_mark(mut self) -> Self {
        self.position.set_mark = true;
        self
    }

    pub fn from_mark(mut self) -> Self {
        self.position.jump_mark = true;
        self
    }

    pub fn attach(mut self) -> Self {
        self.position.attach_to = true;
        self
    }

    pub fn look_deleted(mut self) -> Self {
        self.position.look_deleted = true;
        self
    }

    pub fn look_delayed(mut self) -> Self {
        self.position.look_delayed = true;
        self
    }

    pub fn origin(mut self, origin: OriginPassing) -> Self {
        self.position.origin = origin;
        self
    }

    pub fn side(mut self, side: Side) -> Self {
        self.position.side = side;
        self
    }

    pub fn pick(mut self, pick: Pick) -> Self {
        self.position.pick = pick;
        self
    }

    pub fn line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// Every context this one refers to.
    pub fn references(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.linked.iter().chain(self.ors.iter()).chain(self.tmpl.iter()).copied()
    }

    /// Every set this one refers to.
    pub fn sets(&self) -> impl Iterator<Item = SetId> + '_ {
        self.target.iter().chain(self.barrier.iter()).chain(self.cbarrier.iter()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_dependency_flags() {
        let pos = Position::from_flags(PosFlags::DEP_CHILD | PosFlags::DEP_DEEP | PosFlags::SELF | PosFlags::ALL);
        assert_eq!(
            pos.traversal,
            Traversal::Dependency(DepStep { axis: DepAxis::Child, depth: DepDepth::Deep, include_self: true })
        );
        assert_eq!(pos.quantifier, Quantifier::All);
        assert!(!pos.is_scanning());
    }

    #[test]
    fn span_both_expands_to_both_sides() {
        let pos = Position::from_flags(PosFlags::SPAN_BOTH | PosFlags::SCANFIRST | PosFlags::CAREFUL);
        assert!(pos.span_left && pos.span_right && pos.careful);
        assert_eq!(pos.to_flags(), PosFlags::SPAN_BOTH | PosFlags::SCANFIRST | PosFlags::CAREFUL);
    }

    #[test]
    fn builder_methods_compose() {
        let test = ContextualTest::scan(1, SetId(3)).barrier(SetId(4)).not().link(ContextId(2));
        assert_eq!(test.position.scan, Scan::First);
        assert!(test.position.not);
        assert_eq!(test.sets().collect::<Vec<_>>(), vec![SetId(3), SetId(4)]);
        assert_eq!(test.references().collect::<Vec<_>>(), vec![ContextId(2)]);
        let flags = test.position.to_flags();
        assert_eq!(Position::from_flags(flags), test.position);
    }
}
