//! Programmatic grammar construction.
//!
//! The builder hands out ids as objects are added. Sets, tests and rules may
//! only refer to ids that already exist, so a built grammar is acyclic and
//! every reference is valid.

use crate::error::GrammarError;
use crate::{ContextId, RuleId, STR_ANY, STR_BEGIN, STR_END, SetId, TagHash};

use super::contextual_test::ContextualTest;
use super::dedup::ContextKey;
use super::index::GrammarIndex;
use super::rule::{Rule, RuleKind};
use super::set::{Set, SetOp, SetType, StaticSetOp};
use super::tag::TagTable;
use super::trie::TagTrie;
use super::Grammar;
use std::collections::HashMap;

#[derive(Debug)]
pub struct GrammarBuilder {
    tags: TagTable,
    sets: Vec<Set>,
    set_names: HashMap<String, SetId>,
    contexts: Vec<ContextualTest>,
    context_keys: HashMap<ContextKey, ContextId>,
    templates: HashMap<String, ContextId>,
    rules: Vec<Rule>,
    anchors: HashMap<String, usize>,
    delimiters: Option<SetId>,
    soft_delimiters: Option<SetId>,
    text_delimiters: Option<SetId>,
    preferred_targets: Vec<TagHash>,
    parentheses: Vec<(TagHash, TagHash)>,
    tag_any: TagHash,
    tag_begin: TagHash,
    tag_end: TagHash,
}

impl Default for GrammarBuilder {
    fn default() -> Self {
        GrammarBuilder::new()
    }
}

impl GrammarBuilder {
    pub fn new() -> Self {
        GrammarBuilder::with_mapping_prefix('@')
    }

    /// Mapping tags start with `prefix` (`@` by default).
    pub fn with_mapping_prefix(prefix: char) -> Self {
        let mut tags = TagTable::new(prefix);
        let mut well_known = |text| tags.intern(text).unwrap_or_default();
        let (tag_any, tag_begin, tag_end) = (well_known(STR_ANY), well_known(STR_BEGIN), well_known(STR_END));
        GrammarBuilder {
            tags,
            sets: Vec::new(),
            set_names: HashMap::new(),
            contexts: Vec::new(),
            context_keys: HashMap::new(),
            templates: HashMap::new(),
            rules: Vec::new(),
            anchors: HashMap::new(),
            delimiters: None,
            soft_delimiters: None,
            text_delimiters: None,
            preferred_targets: Vec::new(),
            parentheses: Vec::new(),
            tag_any,
            tag_begin,
            tag_end,
        }
    }

    pub fn tag(&mut self, text: &str) -> Result<TagHash, GrammarError> {
        self.tags.intern(text)
    }

    pub fn set_id(&self, name: &str) -> Result<SetId, GrammarError> {
        self.set_names.get(name).copied().ok_or_else(|| GrammarError::UnknownSet(name.to_string()))
    }

    fn push_set(&mut self, name: Option<&str>, build: impl FnOnce(&mut Set)) -> Result<SetId, GrammarError> {
        let id = SetId::from_index(self.sets.len());
        let name = match name {
            Some(n) if self.set_names.contains_key(n) => return Err(GrammarError::DuplicateSet(n.to_string())),
            Some(n) => n.to_string(),
            None => format!("_S{}_", id.0),
        };
        let mut set = Set::leaf(id, name.clone());
        build(&mut set);
        self.set_names.insert(name, id);
        self.sets.push(set);
        Ok(id)
    }

    fn intern_lists(&mut self, name: &str, lists: &[&[&str]]) -> Result<Vec<Vec<TagHash>>, GrammarError> {
        let mut out = Vec::with_capacity(lists.len());
        for list in lists {
            let mut hashes = Vec::with_capacity(list.len());
            for text in *list {
                hashes.push(self.tags.intern(text)?);
            }
            if !hashes.is_empty() {
                out.push(hashes);
            }
        }
        if out.is_empty() {
            return Err(GrammarError::EmptySet(name.to_string()));
        }
        Ok(out)
    }

    /// `LIST name = a b c ;`: one single-tag list per element.
    pub fn list(&mut self, name: &str, tags: &[&str]) -> Result<SetId, GrammarError> {
        let lists: Vec<&[&str]> = tags.iter().map(std::slice::from_ref).collect();
        self.list_of(name, &lists)
    }

    /// `LIST name = (a b) c ;`: arbitrary tag lists.
    pub fn list_of(&mut self, name: &str, lists: &[&[&str]]) -> Result<SetId, GrammarError> {
        let lists = self.intern_lists(name, lists)?;
        self.push_set(Some(name), |set| set.lists = lists)
    }

    /// An unnamed set, as written inline in a rule (`(N PL)`).
    pub fn inline(&mut self, lists: &[&[&str]]) -> Result<SetId, GrammarError> {
        let lists = self.intern_lists("inline set", lists)?;
        self.push_set(None, |set| set.lists = lists)
    }

    /// An unnamed single-list set, used for maplists (`MAP (@SUBJ)`).
    pub fn tags(&mut self, tags: &[&str]) -> Result<SetId, GrammarError> {
        self.inline(&[tags])
    }

    /// `SET name = A OR B - C ;`
    pub fn set(&mut self, name: &str, operands: &[SetId], ops: &[SetOp]) -> Result<SetId, GrammarError> {
        if operands.is_empty() || operands.len() != ops.len() + 1 {
            return Err(GrammarError::OperatorArity {
                name: name.to_string(),
                operators: ops.len(),
                operands: operands.len(),
            });
        }
        for operand in operands {
            self.check_set(*operand)?;
        }
        let (operands, ops) = (operands.to_vec(), ops.to_vec());
        self.push_set(Some(name), |set| {
            set.sets = operands;
            set.set_ops = ops;
        })
    }

    /// Set operators decided at build time on the member lists of two leaf
    /// sets (`\`, `∩`, `∆`, flattened `OR`).
    pub fn static_set(&mut self, name: &str, a: SetId, op: StaticSetOp, b: SetId) -> Result<SetId, GrammarError> {
        let trie_of = |this: &Self, id: SetId| -> Result<TagTrie, GrammarError> {
            this.check_set(id)?;
            let set = &this.sets[id.index()];
            if set.is_composite() {
                return Err(GrammarError::NotStatic(set.name.clone()));
            }
            let mut trie = TagTrie::new();
            for list in &set.lists {
                let mut sorted = list.clone();
                sorted.sort_unstable();
                sorted.dedup();
                trie.insert(&sorted);
            }
            Ok(trie)
        };
        let (ta, tb) = (trie_of(self, a)?, trie_of(self, b)?);
        let result = match op {
            StaticSetOp::Difference => ta.difference(&tb),
            StaticSetOp::Intersection => ta.intersection(&tb),
            StaticSetOp::SymmetricDifference => ta.symmetric_difference(&tb),
            StaticSetOp::Union => ta.union(&tb),
        };
        let lists = result.tag_lists();
        if lists.is_empty() {
            return Err(GrammarError::EmptySet(name.to_string()));
        }
        self.push_set(Some(name), |set| set.lists = lists)
    }

    /// `$$name`: binds the tag list matched first for the rest of the rule.
    pub fn unify_tags(&mut self, of: SetId) -> Result<SetId, GrammarError> {
        self.unifier(of, "$$", SetType::TAG_UNIFY)
    }

    /// `&&name`: binds the child set matched first for the rest of the rule.
    pub fn unify_sets(&mut self, of: SetId) -> Result<SetId, GrammarError> {
        self.unifier(of, "&&", SetType::SET_UNIFY)
    }

    fn unifier(&mut self, of: SetId, prefix: &str, kind: SetType) -> Result<SetId, GrammarError> {
        self.check_set(of)?;
        let name = format!("{prefix}{}", self.sets[of.index()].name);
        if let Some(id) = self.set_names.get(&name) {
            return Ok(*id);
        }
        self.push_set(Some(&name), |set| {
            set.sets = vec![of];
            set.kind = kind;
        })
    }

    fn check_set(&self, id: SetId) -> Result<(), GrammarError> {
        if id.index() < self.sets.len() { Ok(()) } else { Err(GrammarError::DanglingSet(id.0)) }
    }

    fn check_context(&self, id: ContextId) -> Result<(), GrammarError> {
        if id.index() < self.contexts.len() { Ok(()) } else { Err(GrammarError::DanglingContext(id.0)) }
    }

    /// Add a contextual test, sharing an existing equal one.
    pub fn context(&mut self, mut test: ContextualTest) -> Result<ContextId, GrammarError> {
        for set in test.sets() {
            self.check_set(set)?;
        }
        for linked in test.references() {
            self.check_context(linked)?;
        }
        let key = ContextKey::from_test(&test);
        if let Some(id) = self.context_keys.get(&key) {
            return Ok(*id);
        }
        let id = ContextId::from_index(self.contexts.len());
        test.id = id;
        test.hash = key.content_hash();
        self.context_keys.insert(key, id);
        self.contexts.push(test);
        Ok(id)
    }

    /// `((a) OR (b))`
    pub fn or_context(&mut self, alternatives: Vec<ContextId>) -> Result<ContextId, GrammarError> {
        self.context(ContextualTest::any_of(alternatives))
    }

    /// `TEMPLATE name = ... ;`
    pub fn template(&mut self, name: &str, test: ContextId) -> Result<(), GrammarError> {
        self.check_context(test)?;
        if self.templates.insert(name.to_string(), test).is_some() {
            return Err(GrammarError::DuplicateTemplate(name.to_string()));
        }
        Ok(())
    }

    pub fn template_ref(&self, name: &str) -> Result<ContextId, GrammarError> {
        self.templates.get(name).copied().ok_or_else(|| GrammarError::UnknownTemplate(name.to_string()))
    }

    /// `ANCHOR name ;`: marks the position of the next rule.
    pub fn anchor(&mut self, name: &str) -> Result<(), GrammarError> {
        if self.anchors.insert(name.to_string(), self.rules.len()).is_some() {
            return Err(GrammarError::DuplicateAnchor(name.to_string()));
        }
        Ok(())
    }

    fn check_rule(&self, rule: &Rule) -> Result<(), GrammarError> {
        rule.flags.validate(rule.line)?;
        for set in std::iter::once(rule.target).chain(rule.maplist).chain(rule.sublist) {
            self.check_set(set)?;
        }
        for ctx in rule.contexts() {
            self.check_context(ctx)?;
        }
        Ok(())
    }

    fn push_rule(&mut self, mut rule: Rule) -> RuleId {
        let id = RuleId::from_index(self.rules.len());
        rule.id = id;
        if let Some(name) = &rule.name {
            self.anchors.entry(name.clone()).or_insert(id.index());
        }
        self.rules.push(rule);
        id
    }

    pub fn rule(&mut self, rule: Rule) -> Result<RuleId, GrammarError> {
        self.check_rule(&rule)?;
        if rule.kind == RuleKind::With {
            return Err(GrammarError::MissingOperand { line: rule.line, kind: "WITH", what: "inner rules" });
        }
        rule.check_operands()?;
        Ok(self.push_rule(rule))
    }

    /// `WITH target IF (...) { inner rules }`: the inner rules run on every
    /// cohort the outer rule matches, right after it matched.
    pub fn with_block(&mut self, outer: Rule, inner: Vec<Rule>) -> Result<RuleId, GrammarError> {
        if outer.kind != RuleKind::With {
            return Err(GrammarError::InvalidWith { line: outer.line });
        }
        if inner.is_empty() {
            return Err(GrammarError::MissingOperand { line: outer.line, kind: "WITH", what: "inner rules" });
        }
        self.check_rule(&outer)?;
        for rule in &inner {
            self.check_rule(rule)?;
            rule.check_operands()?;
        }
        let section = outer.section;
        let outer_id = self.push_rule(outer);
        let mut children = Vec::with_capacity(inner.len());
        for mut rule in inner {
            rule.parent = Some(outer_id);
            rule.section = section;
            children.push(self.push_rule(rule));
        }
        self.rules[outer_id.index()].sub_rules = children;
        Ok(outer_id)
    }

    /// `DELIMITERS = ... ;`
    pub fn delimiters(&mut self, set: SetId) -> Result<(), GrammarError> {
        self.check_set(set)?;
        self.delimiters = Some(set);
        Ok(())
    }

    /// `SOFT-DELIMITERS = ... ;`
    pub fn soft_delimiters(&mut self, set: SetId) -> Result<(), GrammarError> {
        self.check_set(set)?;
        self.soft_delimiters = Some(set);
        Ok(())
    }

    /// `TEXT-DELIMITERS = /regex/r ;`
    pub fn text_delimiters(&mut self, set: SetId) -> Result<(), GrammarError> {
        self.check_set(set)?;
        self.text_delimiters = Some(set);
        Ok(())
    }

    /// `PREFERRED-TARGETS = ... ;`
    pub fn preferred_targets(&mut self, tags: &[&str]) -> Result<(), GrammarError> {
        for text in tags {
            let hash = self.tags.intern(text)?;
            self.preferred_targets.push(hash);
        }
        Ok(())
    }

    /// `PARENTHESES = ("<(>" "<)>") ;`, given as wordform tags.
    pub fn parentheses(&mut self, left: &str, right: &str) -> Result<(), GrammarError> {
        let pair = (self.tags.intern(left)?, self.tags.intern(right)?);
        self.parentheses.push(pair);
        Ok(())
    }

    /// Validate, fill the tries and index.
    pub fn build(mut self) -> Result<Grammar, GrammarError> {
        self.resolve_varstrings()?;
        self.check_anchors()?;
        self.fill_tries();

        let mut grammar = Grammar {
            tags: self.tags,
            sets: self.sets,
            set_names: self.set_names,
            contexts: self.contexts,
            templates: self.templates,
            rules: self.rules,
            anchors: self.anchors,
            delimiters: self.delimiters,
            soft_delimiters: self.soft_delimiters,
            text_delimiters: self.text_delimiters,
            preferred_targets: self.preferred_targets,
            parentheses: self.parentheses,
            tag_any: self.tag_any,
            tag_begin: self.tag_begin,
            tag_end: self.tag_end,
            index: GrammarIndex::default(),
        };
        grammar.reindex();
        Ok(grammar)
    }

    fn check_anchors(&self) -> Result<(), GrammarError> {
        for rule in &self.rules {
            let resolve = |name: &Option<String>| -> Result<Option<usize>, GrammarError> {
                match name {
                    None => Ok(None),
                    Some(n) => self
                        .anchors
                        .get(n)
                        .copied()
                        .filter(|pos| *pos <= self.rules.len())
                        .map(Some)
                        .ok_or_else(|| GrammarError::UnknownAnchor { line: rule.line, anchor: n.clone() }),
                }
            };
            let from = resolve(&rule.jump_to)?;
            let to = resolve(&rule.jump_end)?;
            if let (Some(from), Some(to)) = (from, to) {
                let (Some(a), Some(b)) = (&rule.jump_to, &rule.jump_end) else { continue };
                if from >= to || (from..to).contains(&rule.id.index()) {
                    return Err(GrammarError::EmptyAnchorRange { line: rule.line, from: a.clone(), to: b.clone() });
                }
            }
        }
        Ok(())
    }

    fn resolve_varstrings(&mut self) -> Result<(), GrammarError> {
        let pending: Vec<(TagHash, String)> = self
            .tags
            .iter()
            .filter_map(|t| t.varstring_template().map(|tpl| (t.hash, tpl.to_string())))
            .collect();
        for (hash, template) in pending {
            let mut refs = Vec::new();
            for caps in regex!(r"\{([^{}]+)\}").captures_iter(&template) {
                let name = caps[1].to_string();
                let id = self.set_id(&name)?;
                refs.push((name, id));
            }
            if let Some(tag) = self.tags.get_mut(hash) {
                tag.varstring_sets = refs;
            }
        }
        Ok(())
    }

    /// Insert every leaf list into its set's trie, rarest tag first. Lists
    /// containing a special tag go to the special trie.
    fn fill_tries(&mut self) {
        let mut frequency: HashMap<TagHash, u32> = HashMap::new();
        for set in &self.sets {
            for tag in set.lists.iter().flatten() {
                *frequency.entry(*tag).or_default() += 1;
            }
        }
        let freq = |t: TagHash| frequency.get(&t).copied().unwrap_or(0);
        for set in &mut self.sets {
            if set.is_composite() {
                continue;
            }
            for list in &set.lists {
                let special = list.iter().any(|t| self.tags.get(*t).is_some_and(|tag| tag.is_special()));
                let trie = if special { &mut set.trie_special } else { &mut set.trie };
                trie.insert_by_frequency(list, freq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{SetOp, Traversal};

    #[test]
    fn identical_tests_are_shared() {
        let mut g = GrammarBuilder::new();
        let det = g.list("DET", &["DET"]).unwrap();
        let a = g.context(ContextualTest::at(-1, det).line(1)).unwrap();
        let b = g.context(ContextualTest::at(-1, det).line(2)).unwrap();
        let c = g.context(ContextualTest::at(1, det)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn references_must_exist() {
        let mut g = GrammarBuilder::new();
        assert!(matches!(g.context(ContextualTest::at(1, SetId(42))), Err(GrammarError::DanglingSet(42))));
        let n = g.list("N", &["N"]).unwrap();
        let dangling = ContextualTest::at(1, n).link(ContextId(7));
        assert!(matches!(g.context(dangling), Err(GrammarError::DanglingContext(7))));
        assert!(matches!(g.set("X", &[n], &[SetOp::Or]), Err(GrammarError::OperatorArity { .. })));
        assert!(matches!(g.list("N", &["M"]), Err(GrammarError::DuplicateSet(_))));
    }

    #[test]
    fn special_lists_go_to_the_special_trie() {
        let mut g = GrammarBuilder::new();
        let s = g.list_of("S", &[&["N"], &["\"<.*s>\"r", "N"]]).unwrap();
        g.rule(Rule::new(RuleKind::Select, s)).unwrap();
        let grammar = g.build().unwrap();
        let set = grammar.set(s);
        assert_eq!(set.trie.len(), 1);
        assert_eq!(set.trie_special.len(), 1);
        assert!(set.kind.contains(SetType::SPECIAL | SetType::USED));
        assert!(grammar.index.rules_any.contains(0));
    }

    #[test]
    fn static_difference_is_computed_on_lists() {
        let mut g = GrammarBuilder::new();
        let a = g.list("A", &["N", "V", "ADJ"]).unwrap();
        let b = g.list("B", &["V"]).unwrap();
        let d = g.static_set("D", a, StaticSetOp::Difference, b).unwrap();
        let grammar = g.build().unwrap();
        let lists = grammar.set(d).trie.tag_lists();
        assert_eq!(lists.len(), 2);
        let v = grammar.tags.lookup("V").unwrap();
        assert!(lists.iter().all(|l| !l.contains(&v)));
    }

    #[test]
    fn jump_needs_an_existing_anchor() {
        let mut g = GrammarBuilder::new();
        let n = g.list("N", &["N"]).unwrap();
        g.rule(Rule::new(RuleKind::Jump, n).jump_to("nowhere").line(4)).unwrap();
        assert!(matches!(g.build(), Err(GrammarError::UnknownAnchor { line: 4, .. })));

        let mut g = GrammarBuilder::new();
        let n = g.list("N", &["N"]).unwrap();
        g.anchor("end").unwrap();
        g.rule(Rule::new(RuleKind::Select, n).named("first")).unwrap();
        g.rule(Rule::new(RuleKind::Jump, n).jump_to("first")).unwrap();
        let grammar = g.build().unwrap();
        assert_eq!(grammar.anchor("first"), Some(0));
        assert_eq!(grammar.anchor("end"), Some(0));
    }

    #[test]
    fn with_blocks_keep_inner_rules_out_of_sections() {
        let mut g = GrammarBuilder::new();
        let n = g.list("N", &["N"]).unwrap();
        let map = g.tags(&["@X"]).unwrap();
        let outer = g
            .with_block(Rule::new(RuleKind::With, n), vec![Rule::new(RuleKind::Map, n).maplist(map)])
            .unwrap();
        let grammar = g.build().unwrap();
        assert_eq!(grammar.rule(outer).sub_rules, vec![RuleId(1)]);
        assert_eq!(grammar.index.sections.get(&0), Some(&vec![outer]));
    }

    #[test]
    fn templates_resolve_by_name() {
        let mut g = GrammarBuilder::new();
        let n = g.list("N", &["N"]).unwrap();
        let np = g.context(ContextualTest::parent(n)).unwrap();
        g.template("np", np).unwrap();
        assert_eq!(g.template_ref("np").unwrap(), np);
        assert!(matches!(g.contexts[np.index()].position.traversal, Traversal::Dependency(_)));
        assert!(g.template_ref("vp").is_err());
    }

    #[test]
    fn varstring_set_references_are_resolved() {
        let mut g = GrammarBuilder::new();
        let _ = g.list("CASE", &["NOM", "ACC"]).unwrap();
        let vs = g.tag("VSTR:@{CASE}").unwrap();
        let grammar = g.build().unwrap();
        assert_eq!(grammar.tag(vs).unwrap().varstring_sets.len(), 1);
    }
}
