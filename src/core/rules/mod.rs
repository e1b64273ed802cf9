//! Rule model and registry.
//!
//! A `RuleSpec` is an immutable description of one transformation. The
//! `RuleSet` keeps rules in registration order and hands them out in the
//! fixed category order the planner evaluates them in.

mod loader;

pub use loader::{load_ruleset, parse_ruleset, LoadedRuleset, RuleFormat};

use std::collections::HashSet;

use glob_match::glob_match;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matcher::{find_matches, MatchSpan};

// ============================================================================
// Types
// ============================================================================

/// Rule categories, declared in evaluation order.
///
/// Reference fixup runs implicitly between `FileRename` and `ImportRemoval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    FileRename,
    ImportRemoval,
    ApiMigration,
    IdentifierRename,
    StyleNormalization,
}

impl RuleCategory {
    pub const ORDER: [RuleCategory; 5] = [
        RuleCategory::FileRename,
        RuleCategory::ImportRemoval,
        RuleCategory::ApiMigration,
        RuleCategory::IdentifierRename,
        RuleCategory::StyleNormalization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::FileRename => "file_rename",
            RuleCategory::ImportRemoval => "import_removal",
            RuleCategory::ApiMigration => "api_migration",
            RuleCategory::IdentifierRename => "identifier_rename",
            RuleCategory::StyleNormalization => "style_normalization",
        }
    }

    /// Renames must be idempotent; every other category may opt into a guard.
    pub fn is_rename(&self) -> bool {
        matches!(self, RuleCategory::FileRename | RuleCategory::IdentifierRename)
    }
}

/// How a pattern string is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Exact text; the replacement is inserted verbatim.
    #[default]
    Literal,
    /// Regular expression; the replacement may reference groups (`$1`, `${name}`).
    Regex,
}

/// Which boundary discipline a match must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    /// Never split an identifier on either side.
    #[default]
    Word,
    /// Only inside a single string literal, never touching its delimiters.
    StringLiteral,
    /// Any occurrence.
    FreeText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyClass {
    #[default]
    Idempotent,
    RequiresGuard,
}

/// Which files a rule is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AppliesTo {
    #[default]
    All,
    Globs(Vec<String>),
}

impl AppliesTo {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            AppliesTo::All => true,
            AppliesTo::Globs(globs) => globs.iter().any(|g| glob_match(g, path)),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, AppliesTo::All)
    }
}

impl Serialize for AppliesTo {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            AppliesTo::All => serializer.serialize_str("all"),
            AppliesTo::Globs(globs) => globs.serialize(serializer),
        }
    }
}

/// Pattern plus boundary rules. The compiled regex is derived, never configured.
#[derive(Debug, Clone, Serialize)]
pub struct Matcher {
    pub pattern: String,
    pub kind: PatternKind,
    pub boundary: Boundary,
    #[serde(skip)]
    regex: Regex,
}

impl Matcher {
    pub fn new(pattern: &str, kind: PatternKind, boundary: Boundary) -> std::result::Result<Self, regex::Error> {
        let source = match kind {
            PatternKind::Literal => regex::escape(pattern),
            PatternKind::Regex => pattern.to_string(),
        };

        Ok(Self {
            pattern: pattern.to_string(),
            kind,
            boundary,
            regex: Regex::new(&source)?,
        })
    }

    /// Word-bounded exact match for an identifier.
    pub fn identifier(name: &str) -> std::result::Result<Self, regex::Error> {
        Self::new(name, PatternKind::Literal, Boundary::Word)
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

/// One declarative transformation.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSpec {
    pub id: String,
    pub category: RuleCategory,
    pub matcher: Matcher,
    pub replacement: String,
    pub safety: SafetyClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    pub applies_to: AppliesTo,
    #[serde(skip)]
    guard_regex: Option<Regex>,
}

impl RuleSpec {
    pub fn new(
        id: impl Into<String>,
        category: RuleCategory,
        matcher: Matcher,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            matcher,
            replacement: replacement.into(),
            safety: SafetyClass::Idempotent,
            guard: None,
            applies_to: AppliesTo::All,
            guard_regex: None,
        }
    }

    /// Convenience for the common case: a literal, word-bounded rule.
    pub fn literal(
        id: impl Into<String>,
        category: RuleCategory,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self> {
        let id = id.into();
        let matcher = Matcher::identifier(pattern)
            .map_err(|e| Error::rule_invalid(&id, format!("pattern does not compile: {}", e)))?;
        Ok(Self::new(id, category, matcher, replacement))
    }

    pub fn with_applies_to(mut self, applies_to: AppliesTo) -> Self {
        self.applies_to = applies_to;
        self
    }

    /// Mark the rule as non-idempotent, skipped wherever `guard` already matches.
    pub fn with_guard(mut self, guard: &str) -> Result<Self> {
        let compiled = Regex::new(guard)
            .map_err(|e| Error::rule_invalid(&self.id, format!("guard does not compile: {}", e)))?;
        self.safety = SafetyClass::RequiresGuard;
        self.guard = Some(guard.to_string());
        self.guard_regex = Some(compiled);
        Ok(self)
    }

    pub fn is_idempotent(&self) -> bool {
        self.safety == SafetyClass::Idempotent
    }

    /// True when the guard says this rule was already applied to `content`.
    pub fn guard_matches(&self, content: &str) -> bool {
        self.guard_regex
            .as_ref()
            .map(|re| re.is_match(content))
            .unwrap_or(false)
    }

    /// Render the replacement text for one match.
    pub fn render(&self, span: &MatchSpan) -> String {
        match self.matcher.kind {
            PatternKind::Literal => self.replacement.clone(),
            PatternKind::Regex => {
                let names: Vec<Option<&str>> = self.matcher.regex().capture_names().collect();
                expand_template(&self.replacement, &span.captured_groups, &names)
            }
        }
    }

    /// Registration-time checks.
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::rule_invalid(&self.id, "id must not be empty"));
        }

        if self.matcher.pattern.is_empty() {
            return Err(Error::rule_invalid(&self.id, "pattern must not be empty"));
        }

        if self.safety == SafetyClass::RequiresGuard && self.guard_regex.is_none() {
            return Err(Error::rule_invalid(
                &self.id,
                "requires_guard rules must declare a guard",
            ));
        }

        if self.category.is_rename() {
            if !self.is_idempotent() {
                return Err(Error::rule_invalid(
                    &self.id,
                    format!("{} rules must be idempotent", self.category.as_str()),
                ));
            }

            if self.category == RuleCategory::IdentifierRename
                && self.matcher.boundary != Boundary::Word
            {
                return Err(Error::rule_invalid(
                    &self.id,
                    "identifier_rename rules must use word boundaries",
                ));
            }

            if self.matches_own_output() {
                return Err(Error::rule_invalid(
                    &self.id,
                    format!(
                        "pattern '{}' matches its own replacement '{}'",
                        self.matcher.pattern, self.replacement
                    ),
                ));
            }
        }

        Ok(())
    }

    /// Would the matcher fire again on what it writes?
    ///
    /// Group references are dropped from the template; only the fixed text
    /// the rule always emits is checked.
    fn matches_own_output(&self) -> bool {
        let emitted = match self.matcher.kind {
            PatternKind::Literal => self.replacement.clone(),
            PatternKind::Regex => expand_template(&self.replacement, &[], &[]),
        };

        let sample = match self.matcher.boundary {
            Boundary::StringLiteral => format!("\"{}\"", emitted),
            _ => emitted,
        };

        !find_matches(&sample, &self.matcher, &self.id).spans.is_empty()
    }
}

// ============================================================================
// Template expansion
// ============================================================================

/// Expand `$N`, `${N}`, `$name`, `${name}` and `$$` against captured groups.
///
/// Unknown or unmatched groups expand to nothing, as in `regex::Captures::expand`.
pub(crate) fn expand_template(
    template: &str,
    groups: &[Option<String>],
    names: &[Option<&str>],
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];

        if let Some(after) = rest.strip_prefix('$') {
            out.push('$');
            rest = after;
            continue;
        }

        let (name, consumed) = if let Some(braced) = rest.strip_prefix('{') {
            match braced.find('}') {
                Some(close) => (&braced[..close], close + 2),
                None => {
                    out.push('$');
                    continue;
                }
            }
        } else {
            let len = rest
                .char_indices()
                .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            (&rest[..len], len)
        };

        if name.is_empty() {
            out.push('$');
            continue;
        }

        let index = match name.parse::<usize>() {
            Ok(i) => Some(i),
            Err(_) => names.iter().position(|n| *n == Some(name)),
        };

        if let Some(Some(Some(value))) = index.map(|i| groups.get(i)) {
            out.push_str(value);
        }

        rest = &rest[consumed..];
    }

    out.push_str(rest);
    out
}

// ============================================================================
// Registry
// ============================================================================

/// Ordered, id-unique collection of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RuleSpec>,
    ids: HashSet<String>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from rules in registration order.
    pub fn from_rules(rules: impl IntoIterator<Item = RuleSpec>) -> Result<Self> {
        let mut set = Self::new();
        for rule in rules {
            set.register(rule)?;
        }
        Ok(set)
    }

    pub fn register(&mut self, rule: RuleSpec) -> Result<()> {
        if self.ids.contains(&rule.id) {
            return Err(Error::rule_duplicate_id(&rule.id));
        }
        rule.validate()?;
        self.ids.insert(rule.id.clone());
        self.rules.push(rule);
        Ok(())
    }

    /// Rules in evaluation order: by category, then registration order.
    pub fn ordered(&self) -> Vec<&RuleSpec> {
        let mut ordered: Vec<&RuleSpec> = self.rules.iter().collect();
        ordered.sort_by_key(|r| r.category);
        ordered
    }

    pub fn in_category(&self, category: RuleCategory) -> impl Iterator<Item = &RuleSpec> {
        self.rules.iter().filter(move |r| r.category == category)
    }

    pub fn get(&self, id: &str) -> Option<&RuleSpec> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn regex_rule(id: &str, category: RuleCategory, pattern: &str, replacement: &str) -> RuleSpec {
        let matcher = Matcher::new(pattern, PatternKind::Regex, Boundary::FreeText).unwrap();
        RuleSpec::new(id, category, matcher, replacement)
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut set = RuleSet::new();
        set.register(RuleSpec::literal("a", RuleCategory::ApiMigration, "x", "y").unwrap())
            .unwrap();
        let err = set
            .register(RuleSpec::literal("a", RuleCategory::StyleNormalization, "p", "q").unwrap())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RuleDuplicateId);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn ordered_follows_category_then_registration() {
        let set = RuleSet::from_rules(vec![
            RuleSpec::literal("style", RuleCategory::StyleNormalization, "a", "b").unwrap(),
            RuleSpec::literal("api-1", RuleCategory::ApiMigration, "c", "d").unwrap(),
            RuleSpec::literal("rename", RuleCategory::FileRename, "e.txt", "f.txt").unwrap(),
            RuleSpec::literal("api-2", RuleCategory::ApiMigration, "g", "h").unwrap(),
            RuleSpec::literal("imports", RuleCategory::ImportRemoval, "import x;", "").unwrap(),
        ])
        .unwrap();

        let ids: Vec<&str> = set.ordered().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["rename", "imports", "api-1", "api-2", "style"]);
    }

    #[test]
    fn rename_rule_matching_its_own_output_is_invalid() {
        let rule = regex_rule("grow", RuleCategory::IdentifierRename, "foo", "foofoo");
        let err = RuleSet::from_rules(vec![rule]).unwrap_err();
        assert_eq!(err.code, ErrorCode::RuleInvalid);
    }

    #[test]
    fn identifier_rename_requires_word_boundary() {
        let rule = regex_rule("free", RuleCategory::IdentifierRename, "old_idx", "oldIdx");
        let err = RuleSet::from_rules(vec![rule]).unwrap_err();
        assert!(err.message.contains("word boundaries"));
    }

    #[test]
    fn word_rename_into_longer_identifier_is_fine() {
        // `foo` does not match inside `foo_bar`, so the rule cannot re-fire.
        let rule = RuleSpec::literal("r", RuleCategory::IdentifierRename, "foo", "foo_bar").unwrap();
        assert!(RuleSet::from_rules(vec![rule]).is_ok());
    }

    #[test]
    fn rename_rules_cannot_require_guards() {
        let rule = RuleSpec::literal("r", RuleCategory::FileRename, "a.txt", "b.txt").unwrap()
            .with_guard("b\\.txt")
            .unwrap();
        let err = RuleSet::from_rules(vec![rule]).unwrap_err();
        assert!(err.message.contains("idempotent"));
    }

    #[test]
    fn guard_must_compile() {
        let err = RuleSpec::literal("g", RuleCategory::ApiMigration, "x", "y").unwrap()
            .with_guard("(unclosed")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RuleInvalid);
    }

    #[test]
    fn applies_to_globs() {
        let scope = AppliesTo::Globs(vec!["lib/**/*.dart".to_string()]);
        assert!(scope.matches("lib/core/a.dart"));
        assert!(!scope.matches("test/a.dart"));
        assert!(AppliesTo::All.matches("anything"));
    }

    #[test]
    fn template_expansion() {
        let groups = vec![
            Some("withOpacity(0.5)".to_string()),
            Some("0.5".to_string()),
            None,
        ];
        let names = vec![None, Some("alpha"), Some("missing")];

        assert_eq!(
            expand_template("withValues(alpha: $1)", &groups, &names),
            "withValues(alpha: 0.5)"
        );
        assert_eq!(expand_template("${alpha}x", &groups, &names), "0.5x");
        assert_eq!(expand_template("$$1", &groups, &names), "$1");
        assert_eq!(expand_template("a${missing}b", &groups, &names), "ab");
        assert_eq!(expand_template("cost: $", &groups, &names), "cost: $");
    }
}
