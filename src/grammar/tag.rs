//! Tags and the tag table.
//!
//! A tag is the atomic symbol of both grammars and annotated input: a wordform
//! (`"<cats>"`), a baseform (`"cat"`), a plain morphological tag (`N`, `PL`), a
//! mapping tag (`@SUBJ`), or one of the special forms that are not compared by
//! identity but evaluated against a reading (regular expressions, numeric
//! comparisons, variables, positional markers, ...).
//!
//! Tags are interned in a [`TagTable`] and referred to by their [`TagHash`]
//! everywhere else. The hash is an sdbm hash of the tag text; on a collision
//! with a different text the seed is bumped until a free slot is found, so a
//! hash identifies exactly one text within one table.

use crate::error::GrammarError;
use crate::{SetId, TagHash};
use regex::Regex;
use std::collections::HashMap;

bitflags::bitflags! {
    /// Classification of a tag. A tag can carry several bits at once (a
    /// baseform regex is `BASEFORM | TEXTUAL | REGEXP | SPECIAL`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TagType: u32 {
        const ANY              = 1 << 0;
        const NUMERICAL        = 1 << 1;
        const MAPPING          = 1 << 2;
        const VARIABLE         = 1 << 3;
        const META             = 1 << 4;
        const WORDFORM         = 1 << 5;
        const BASEFORM         = 1 << 6;
        const TEXTUAL          = 1 << 7;
        const DEPENDENCY       = 1 << 8;
        const SAME_BASIC       = 1 << 9;
        const FAILFAST         = 1 << 10;
        const CASE_INSENSITIVE = 1 << 11;
        const REGEXP           = 1 << 12;
        const PAR_LEFT         = 1 << 13;
        const PAR_RIGHT        = 1 << 14;
        const VARSTRING        = 1 << 15;
        const TARGET           = 1 << 16;
        const MARK             = 1 << 17;
        const ATTACHTO         = 1 << 18;
        const SPECIAL          = 1 << 19;
        const ENCL             = 1 << 20;
        const RELATION         = 1 << 21;

        /// Bits that make a tag "special": it cannot be matched by a plain
        /// membership test on a reading's tag set.
        const NEEDS_EVALUATION = Self::ANY.bits()
            | Self::NUMERICAL.bits()
            | Self::VARIABLE.bits()
            | Self::META.bits()
            | Self::FAILFAST.bits()
            | Self::CASE_INSENSITIVE.bits()
            | Self::REGEXP.bits()
            | Self::VARSTRING.bits()
            | Self::TARGET.bits()
            | Self::MARK.bits()
            | Self::ATTACHTO.bits()
            | Self::PAR_LEFT.bits()
            | Self::PAR_RIGHT.bits()
            | Self::ENCL.bits()
            | Self::SAME_BASIC.bits();
    }
}

/// Comparison operator of a numeric tag `<KEY op VALUE>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Equals,
    LessThan,
    GreaterThan,
    LessEquals,
    GreaterEquals,
    NotEquals,
}

impl ComparisonOp {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "=" | ":" => ComparisonOp::Equals,
            "<" => ComparisonOp::LessThan,
            ">" => ComparisonOp::GreaterThan,
            "<=" => ComparisonOp::LessEquals,
            ">=" => ComparisonOp::GreaterEquals,
            "!=" | "<>" => ComparisonOp::NotEquals,
            _ => return None,
        })
    }
}

/// Right-hand side of a numeric comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericValue {
    Value(f64),
    /// The smallest value any reading of the cohort carries for the key.
    Min,
    /// The largest value any reading of the cohort carries for the key.
    Max,
}

/// Parsed form of a numeric tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    /// Hash of the key text (`W` in `<W>50>`), shared by all tags with that key.
    pub key: TagHash,
    pub op: ComparisonOp,
    pub value: NumericValue,
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    lo: f64,
    lo_incl: bool,
    hi: f64,
    hi_incl: bool,
}

impl Interval {
    fn of(op: ComparisonOp, v: f64) -> Option<Self> {
        let inf = f64::INFINITY;
        Some(match op {
            ComparisonOp::Equals => Interval { lo: v, lo_incl: true, hi: v, hi_incl: true },
            ComparisonOp::LessThan => Interval { lo: -inf, lo_incl: false, hi: v, hi_incl: false },
            ComparisonOp::LessEquals => Interval { lo: -inf, lo_incl: false, hi: v, hi_incl: true },
            ComparisonOp::GreaterThan => Interval { lo: v, lo_incl: false, hi: inf, hi_incl: false },
            ComparisonOp::GreaterEquals => Interval { lo: v, lo_incl: true, hi: inf, hi_incl: false },
            ComparisonOp::NotEquals => return None,
        })
    }

    fn overlaps(&self, other: &Interval) -> bool {
        let (lo, lo_incl) = if self.lo > other.lo {
            (self.lo, self.lo_incl)
        } else if other.lo > self.lo {
            (other.lo, other.lo_incl)
        } else {
            (self.lo, self.lo_incl && other.lo_incl)
        };
        let (hi, hi_incl) = if self.hi < other.hi {
            (self.hi, self.hi_incl)
        } else if other.hi < self.hi {
            (other.hi, other.hi_incl)
        } else {
            (self.hi, self.hi_incl && other.hi_incl)
        };
        lo < hi || (lo == hi && lo_incl && hi_incl)
    }
}

impl Comparison {
    /// Does a grammar-side comparison admit a reading-side one?
    ///
    /// Both sides denote a range of values; the test holds when the ranges
    /// share at least one value. `resolved` is the grammar value after `MIN`
    /// or `MAX` has been replaced by the cohort's extreme.
    pub fn admits(&self, resolved: f64, reading_op: ComparisonOp, reading_value: f64) -> bool {
        match (self.op, reading_op) {
            (ComparisonOp::NotEquals, ComparisonOp::Equals) => resolved != reading_value,
            (ComparisonOp::Equals, ComparisonOp::NotEquals) => resolved != reading_value,
            (ComparisonOp::NotEquals, _) | (_, ComparisonOp::NotEquals) => true,
            (g, r) => match (Interval::of(g, resolved), Interval::of(r, reading_value)) {
                (Some(a), Some(b)) => a.overlaps(&b),
                _ => false,
            },
        }
    }
}

/// A single interned tag.
#[derive(Debug, Clone)]
pub struct Tag {
    pub hash: TagHash,
    /// Text as written, including quotes, angle brackets and suffix flags.
    pub text: String,
    pub kind: TagType,
    /// Compiled, fully anchored pattern for regular expression and
    /// case-insensitive tags; unanchored for `META:` tags.
    pub regex: Option<Regex>,
    pub comparison: Option<Comparison>,
    /// `(self, parent)` of an input dependency tag `#x->y`.
    pub dep: Option<(u32, u32)>,
    /// `(label, target)` of an input relation tag `R:label:n`; `ID:n` is kept
    /// with an empty label.
    pub relation: Option<(String, u32)>,
    /// `(key, value)` of a `VAR:key` or `VAR:key=value` tag.
    pub variable: Option<(TagHash, Option<TagHash>)>,
    /// For a failfast tag `^X`, the hash of `X`.
    pub failfast_of: Option<TagHash>,
    /// `{NAME}` references of a varstring, resolved by the grammar builder.
    pub varstring_sets: Vec<(String, SetId)>,
}

impl Tag {
    #[inline]
    pub fn is_special(&self) -> bool {
        self.kind.contains(TagType::SPECIAL)
    }

    #[inline]
    pub fn is_mapping(&self) -> bool {
        self.kind.contains(TagType::MAPPING)
    }

    /// Template text of a varstring (`VSTR:` stripped).
    pub fn varstring_template(&self) -> Option<&str> {
        if self.kind.contains(TagType::VARSTRING) { self.text.strip_prefix("VSTR:") } else { None }
    }

    /// Expand a varstring against regex captures (`$1..$9`) and unified sets
    /// (`{NAME}`).
    pub fn expand_varstring(&self, captures: &[String], set_text: impl Fn(SetId) -> Option<String>) -> String {
        let Some(template) = self.varstring_template() else {
            return self.text.clone();
        };
        let mut out = String::with_capacity(template.len());
        let mut chars = template.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '$' {
                if let Some(&(_, d)) = chars.peek() {
                    if let Some(n) = d.to_digit(10).filter(|n| *n > 0) {
                        chars.next();
                        if let Some(cap) = captures.get(n as usize - 1) {
                            out.push_str(cap);
                        }
                        continue;
                    }
                }
            } else if c == '{' {
                if let Some(end) = template[i..].find('}') {
                    let name = &template[i + 1..i + end];
                    if let Some((_, set)) = self.varstring_sets.iter().find(|(n, _)| n == name) {
                        if let Some(text) = set_text(*set) {
                            out.push_str(&text);
                        }
                        for _ in 0..name.chars().count() + 1 {
                            chars.next();
                        }
                        continue;
                    }
                }
            }
            out.push(c);
        }
        out
    }

    /// Classify `text`. The hash is assigned by [`TagTable::intern`].
    pub(crate) fn parse(text: &str, mapping_prefix: char) -> Result<Tag, GrammarError> {
        if text.is_empty() {
            return Err(GrammarError::EmptyTag);
        }
        let mut tag = Tag {
            hash: 0,
            text: text.to_string(),
            kind: TagType::empty(),
            regex: None,
            comparison: None,
            dep: None,
            relation: None,
            variable: None,
            failfast_of: None,
            varstring_sets: Vec::new(),
        };

        match text {
            crate::STR_ANY => tag.kind |= TagType::ANY,
            crate::STR_TARGET => tag.kind |= TagType::TARGET,
            crate::STR_MARK => tag.kind |= TagType::MARK,
            crate::STR_ATTACHTO => tag.kind |= TagType::ATTACHTO,
            crate::STR_PAR_LEFT => tag.kind |= TagType::PAR_LEFT,
            crate::STR_PAR_RIGHT => tag.kind |= TagType::PAR_RIGHT,
            crate::STR_ENCL => tag.kind |= TagType::ENCL,
            crate::STR_SAME_BASIC => tag.kind |= TagType::SAME_BASIC,
            _ => tag.classify(mapping_prefix)?,
        }

        if tag.kind.intersects(TagType::NEEDS_EVALUATION) {
            tag.kind |= TagType::SPECIAL;
        }
        Ok(tag)
    }

    fn classify(&mut self, mapping_prefix: char) -> Result<(), GrammarError> {
        let text = self.text.as_str();

        if let Some(template) = text.strip_prefix("VSTR:") {
            if !template.is_empty() {
                self.kind |= TagType::VARSTRING;
                return Ok(());
            }
        }

        if let Some(var) = text.strip_prefix("VAR:") {
            let (key, value) = match var.split_once('=') {
                Some((k, v)) => (k, Some(hash_text(v, 0))),
                None => (var, None),
            };
            self.kind |= TagType::VARIABLE;
            self.variable = Some((hash_text(key, 0), value));
            return Ok(());
        }

        if let Some(pattern) = text.strip_prefix("META:") {
            let pattern = pattern.trim_matches('/');
            self.kind |= TagType::META;
            self.regex = Some(compile(text, pattern)?);
            return Ok(());
        }

        if let Some(caps) = regex!(r"^#(\d+)->(\d+)$").captures(text) {
            self.kind |= TagType::DEPENDENCY;
            self.dep = Some((caps[1].parse().unwrap_or(0), caps[2].parse().unwrap_or(0)));
            return Ok(());
        }
        if let Some(caps) = regex!(r"^ID:(\d+)$").captures(text) {
            self.kind |= TagType::RELATION;
            self.relation = Some((String::new(), caps[1].parse().unwrap_or(0)));
            return Ok(());
        }
        if let Some(caps) = regex!(r"^R:([^:]+):(\d+)$").captures(text) {
            self.kind |= TagType::RELATION;
            self.relation = Some((caps[1].to_string(), caps[2].parse().unwrap_or(0)));
            return Ok(());
        }

        let (body, is_regex, icase) = split_suffix(text);

        if body.starts_with("\"<") && body.ends_with(">\"") && body.len() >= 4 {
            self.kind |= TagType::WORDFORM | TagType::TEXTUAL;
        } else if body.starts_with('"') && body.ends_with('"') && body.len() >= 2 {
            self.kind |= TagType::BASEFORM | TagType::TEXTUAL;
        } else if body.starts_with('<') && body.ends_with('>') && body.len() >= 2 {
            if let Some(caps) = regex!(r"^<([^<>=:!]+?)(<=|>=|!=|<>|=|:|<|>)(-?\d+(?:\.\d+)?|MIN|MAX)>$").captures(body) {
                let op = ComparisonOp::parse(&caps[2]).ok_or_else(|| GrammarError::MalformedNumeric(text.into()))?;
                let value = match &caps[3] {
                    "MIN" => NumericValue::Min,
                    "MAX" => NumericValue::Max,
                    v => NumericValue::Value(v.parse().map_err(|_| GrammarError::MalformedNumeric(text.into()))?),
                };
                self.kind |= TagType::NUMERICAL;
                self.comparison = Some(Comparison { key: hash_text(&caps[1], 0), op, value });
                return Ok(());
            }
            self.kind |= TagType::TEXTUAL;
        } else if text.starts_with(mapping_prefix) && text.len() > mapping_prefix.len_utf8() {
            self.kind |= TagType::MAPPING;
        }

        if is_regex {
            let pattern = body.strip_prefix('/').and_then(|b| b.strip_suffix('/')).unwrap_or(body);
            let anchored = if icase { format!("(?i)^(?:{pattern})$") } else { format!("^(?:{pattern})$") };
            self.kind |= TagType::REGEXP;
            self.regex = Some(compile(text, &anchored)?);
        } else if icase {
            self.kind |= TagType::CASE_INSENSITIVE;
            self.regex = Some(compile(text, &format!("(?i)^{}$", regex::escape(body)))?);
        }
        Ok(())
    }
}

/// Strip `r`/`i` suffix flags from a delimited tag (`"..."r`, `<...>i`,
/// `/.../ri`). Undelimited text is returned unchanged.
fn split_suffix(text: &str) -> (&str, bool, bool) {
    let body = text.trim_end_matches(['r', 'i']);
    let suffix = &text[body.len()..];
    if suffix.is_empty() || suffix.len() > 2 || body.len() < 2 {
        return (text, false, false);
    }
    let delimited = (body.starts_with('"') && body.ends_with('"'))
        || (body.starts_with('<') && body.ends_with('>'))
        || (body.starts_with('/') && body.ends_with('/'));
    if !delimited {
        return (text, false, false);
    }
    (body, suffix.contains('r'), suffix.contains('i'))
}

fn compile(tag: &str, pattern: &str) -> Result<Regex, GrammarError> {
    Regex::new(pattern).map_err(|source| GrammarError::InvalidRegex { tag: tag.to_string(), source })
}

/// sdbm hash of `text`, mixed with `seed`.
pub fn hash_text(text: &str, seed: u32) -> TagHash {
    let mut hash: u32 = seed;
    for c in text.chars() {
        hash = (c as u32).wrapping_add(hash << 6).wrapping_add(hash << 16).wrapping_sub(hash);
    }
    hash
}

/// Read access to interned tags, implemented by the grammar's table and by
/// the engine's layered runtime store.
pub trait TagSource {
    fn tag(&self, hash: TagHash) -> Option<&Tag>;

    fn text(&self, hash: TagHash) -> &str {
        self.tag(hash).map_or("", |t| t.text.as_str())
    }
}

impl TagSource for TagTable {
    fn tag(&self, hash: TagHash) -> Option<&Tag> {
        self.get(hash)
    }
}

/// Interning table for tags.
#[derive(Debug, Clone)]
pub struct TagTable {
    tags: HashMap<TagHash, Tag>,
    by_text: HashMap<String, TagHash>,
    mapping_prefix: char,
}

impl Default for TagTable {
    fn default() -> Self {
        TagTable::new('@')
    }
}

impl TagTable {
    pub fn new(mapping_prefix: char) -> Self {
        TagTable { tags: HashMap::new(), by_text: HashMap::new(), mapping_prefix }
    }

    pub fn mapping_prefix(&self) -> char {
        self.mapping_prefix
    }

    /// Intern `text`, returning the existing hash if it is already known.
    pub fn intern(&mut self, text: &str) -> Result<TagHash, GrammarError> {
        self.intern_avoiding(text, None)
    }

    /// Like [`intern`](Self::intern), but never hands out a hash that `other`
    /// uses for a different text. Runtime tables use this so that tags created
    /// while applying a grammar never shadow grammar tags.
    pub fn intern_avoiding(&mut self, text: &str, other: Option<&TagTable>) -> Result<TagHash, GrammarError> {
        if let Some(&hash) = self.by_text.get(text) {
            return Ok(hash);
        }
        if let Some(hash) = other.and_then(|o| o.lookup(text)) {
            return Ok(hash);
        }

        let mut tag = Tag::parse(text, self.mapping_prefix)?;
        if let Some(inner) = text.strip_prefix('^').filter(|rest| !rest.is_empty()) {
            let inner_hash = self.intern_avoiding(inner, other)?;
            if let Some(inner_tag) = self.get(inner_hash).or_else(|| other.and_then(|o| o.get(inner_hash))) {
                tag.kind = inner_tag.kind | TagType::FAILFAST | TagType::SPECIAL;
            }
            tag.failfast_of = Some(inner_hash);
        }

        let mut seed = 0;
        let hash = loop {
            let hash = hash_text(text, seed);
            let taken = hash == 0
                || self.tags.contains_key(&hash)
                || other.is_some_and(|o| o.tags.contains_key(&hash));
            if !taken {
                break hash;
            }
            seed += 1;
        };
        tag.hash = hash;
        self.by_text.insert(text.to_string(), hash);
        self.tags.insert(hash, tag);
        Ok(hash)
    }

    pub fn get(&self, hash: TagHash) -> Option<&Tag> {
        self.tags.get(&hash)
    }

    pub fn lookup(&self, text: &str) -> Option<TagHash> {
        self.by_text.get(text).copied()
    }

    pub(crate) fn get_mut(&mut self, hash: TagHash) -> Option<&mut Tag> {
        self.tags.get_mut(&hash)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Tag {
        Tag::parse(text, '@').unwrap()
    }

    #[test]
    fn classifies_textual_tags() {
        assert!(parse("\"<cats>\"").kind.contains(TagType::WORDFORM | TagType::TEXTUAL));
        assert!(parse("\"cat\"").kind.contains(TagType::BASEFORM));
        assert!(!parse("\"cat\"").is_special());
        assert!(parse("@SUBJ").is_mapping());
        assert_eq!(parse("N").kind, TagType::empty());
        assert!(parse("*").kind.contains(TagType::ANY | TagType::SPECIAL));
    }

    #[test]
    fn regex_and_case_insensitive_tags_match_full_text() {
        let re = parse("\"<.*ing>\"r");
        assert!(re.kind.contains(TagType::REGEXP | TagType::WORDFORM));
        let compiled = re.regex.as_ref().unwrap();
        assert!(compiled.is_match("\"<running>\""));
        assert!(!compiled.is_match("\"<running>\" extra"));

        let icase = parse("\"Paris\"i");
        assert!(icase.kind.contains(TagType::CASE_INSENSITIVE));
        assert!(icase.regex.as_ref().unwrap().is_match("\"paris\""));
        assert!(!icase.regex.as_ref().unwrap().is_match("\"parish\""));
    }

    #[test]
    fn plain_words_ending_in_r_or_i_are_not_regexes() {
        let tag = parse("Noir");
        assert!(tag.regex.is_none());
        assert!(!tag.is_special());
    }

    #[test]
    fn parses_numeric_comparisons() {
        let tag = parse("<W>=50>");
        let cmp = tag.comparison.unwrap();
        assert_eq!(cmp.op, ComparisonOp::GreaterEquals);
        assert_eq!(cmp.value, NumericValue::Value(50.0));
        assert_eq!(cmp.key, hash_text("W", 0));
        assert!(tag.kind.contains(TagType::NUMERICAL | TagType::SPECIAL));
        assert_eq!(parse("<W:MAX>").comparison.unwrap().value, NumericValue::Max);
    }

    #[test]
    fn numeric_admission_is_range_overlap() {
        let ge50 = parse("<W>=50>").comparison.unwrap();
        assert!(ge50.admits(50.0, ComparisonOp::Equals, 50.0));
        assert!(ge50.admits(50.0, ComparisonOp::Equals, 70.0));
        assert!(!ge50.admits(50.0, ComparisonOp::Equals, 49.0));
        assert!(ge50.admits(50.0, ComparisonOp::LessThan, 60.0));
        assert!(!ge50.admits(50.0, ComparisonOp::LessThan, 50.0));

        let ne = parse("<W!=3>").comparison.unwrap();
        assert!(ne.admits(3.0, ComparisonOp::Equals, 4.0));
        assert!(!ne.admits(3.0, ComparisonOp::Equals, 3.0));
    }

    #[test]
    fn parses_input_side_structure_tags() {
        assert_eq!(parse("#3->1").dep, Some((3, 1)));
        assert_eq!(parse("R:subj:4").relation, Some(("subj".to_string(), 4)));
        let var = parse("VAR:mode=strict");
        assert_eq!(var.variable, Some((hash_text("mode", 0), Some(hash_text("strict", 0)))));
    }

    #[test]
    fn invalid_regex_is_a_grammar_error() {
        assert!(matches!(Tag::parse("\"(\"r", '@'), Err(GrammarError::InvalidRegex { .. })));
    }

    #[test]
    fn interning_is_stable_and_failfast_wraps_inner_tag() {
        let mut table = TagTable::default();
        let a = table.intern("N").unwrap();
        assert_eq!(table.intern("N").unwrap(), a);
        let ff = table.intern("^N").unwrap();
        let tag = table.get(ff).unwrap();
        assert!(tag.kind.contains(TagType::FAILFAST));
        assert_eq!(tag.failfast_of, Some(a));
    }

    #[test]
    fn runtime_table_never_reuses_grammar_hashes() {
        let mut grammar = TagTable::default();
        let n = grammar.intern("N").unwrap();
        let mut runtime = TagTable::default();
        assert_eq!(runtime.intern_avoiding("N", Some(&grammar)).unwrap(), n);
        let fresh = runtime.intern_avoiding("PL", Some(&grammar)).unwrap();
        assert!(grammar.get(fresh).is_none());
    }

    #[test]
    fn varstring_expands_captures() {
        let tag = parse("VSTR:@$1-of");
        assert_eq!(tag.expand_varstring(&["head".to_string()], |_| None), "@head-of");
    }
}
