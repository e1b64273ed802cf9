//! Ruleset files: JSON, TOML or YAML, chosen by extension.

use std::path::Path;

use serde::Deserialize;

use super::{AppliesTo, Boundary, Matcher, PatternKind, RuleCategory, RuleSet, RuleSpec, SafetyClass};
use crate::error::{Error, Result};
use crate::utils::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFormat {
    Json,
    Toml,
    Yaml,
}

impl RuleFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(RuleFormat::Json),
            Some("toml") => Ok(RuleFormat::Toml),
            Some("yaml") | Some("yml") => Ok(RuleFormat::Yaml),
            other => Err(Error::validation_invalid_argument(
                "rules",
                format!(
                    "Unsupported ruleset extension '{}'. Use .json, .toml, .yaml or .yml",
                    other.unwrap_or("")
                ),
            )),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RuleFormat::Json => "json",
            RuleFormat::Toml => "toml",
            RuleFormat::Yaml => "yaml",
        }
    }
}

/// A registered ruleset plus the file-selection defaults it carries.
#[derive(Debug, Clone)]
pub struct LoadedRuleset {
    pub rules: RuleSet,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

// ============================================================================
// On-disk shape
// ============================================================================

#[derive(Debug, Deserialize)]
struct RulesetFile {
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    id: String,
    category: RuleCategory,
    pattern: String,
    #[serde(default)]
    kind: PatternKind,
    #[serde(default)]
    boundary: Boundary,
    #[serde(default)]
    replacement: String,
    /// Absent means idempotent, or requires_guard when a guard is given.
    #[serde(default)]
    safety: Option<SafetyClass>,
    #[serde(default)]
    guard: Option<String>,
    #[serde(default)]
    applies_to: Option<AppliesToEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AppliesToEntry {
    One(String),
    Many(Vec<String>),
}

impl AppliesToEntry {
    fn into_scope(self) -> AppliesTo {
        let globs = match self {
            AppliesToEntry::One(s) => vec![s],
            AppliesToEntry::Many(v) => v,
        };

        if globs.is_empty() || globs.iter().any(|g| g == "all") {
            AppliesTo::All
        } else {
            AppliesTo::Globs(globs)
        }
    }
}

impl RuleEntry {
    fn into_rule(self) -> Result<RuleSpec> {
        let matcher = Matcher::new(&self.pattern, self.kind, self.boundary).map_err(|e| {
            Error::rule_invalid(&self.id, format!("pattern does not compile: {}", e))
        })?;

        let scope = self
            .applies_to
            .map(AppliesToEntry::into_scope)
            .unwrap_or_default();

        let rule = RuleSpec::new(self.id, self.category, matcher, self.replacement)
            .with_applies_to(scope);

        match (self.safety, self.guard) {
            (Some(SafetyClass::Idempotent), Some(_)) => Err(Error::rule_invalid(
                &rule.id,
                "idempotent rules must not declare a guard",
            )),
            (_, Some(guard)) => rule.with_guard(&guard),
            (Some(SafetyClass::RequiresGuard), None) => Err(Error::rule_invalid(
                &rule.id,
                "requires_guard rules must declare a guard",
            )),
            (_, None) => Ok(rule),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Read and register a ruleset file.
pub fn load_ruleset(path: &Path) -> Result<LoadedRuleset> {
    let format = RuleFormat::from_path(path)?;
    let content = io::read_file(path, &format!("read ruleset {}", path.display()))?;
    parse_ruleset(&content, format, &path.display().to_string())
}

/// Parse ruleset text. `origin` only labels errors.
pub fn parse_ruleset(content: &str, format: RuleFormat, origin: &str) -> Result<LoadedRuleset> {
    let parsed: RulesetFile = match format {
        RuleFormat::Json => serde_json::from_str(content)
            .map_err(|e| Error::config_invalid_file(origin, format.as_str(), e.to_string()))?,
        RuleFormat::Toml => toml::from_str(content)
            .map_err(|e| Error::config_invalid_file(origin, format.as_str(), e.to_string()))?,
        RuleFormat::Yaml => serde_yml::from_str(content)
            .map_err(|e| Error::config_invalid_file(origin, format.as_str(), e.to_string()))?,
    };

    for (key, globs) in [("include", &parsed.include), ("exclude", &parsed.exclude)] {
        if globs.iter().any(|g| g.trim().is_empty()) {
            return Err(Error::config_invalid_value(
                key,
                Some(String::new()),
                "glob must not be empty",
            ));
        }
    }

    let mut rules = RuleSet::new();
    for entry in parsed.rules {
        rules.register(entry.into_rule()?)?;
    }

    Ok(LoadedRuleset {
        rules,
        include: parsed.include,
        exclude: parsed.exclude,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn parses_json_with_defaults() {
        let json = r#"{
            "include": ["lib/**/*.dart"],
            "rules": [
                { "id": "share", "category": "api_migration",
                  "pattern": "Share.share(", "replacement": "SharePlus.share(",
                  "boundary": "free_text" },
                { "id": "opacity", "category": "api_migration", "kind": "regex",
                  "pattern": "\\.withOpacity\\(([0-9.]+)\\)",
                  "replacement": ".withValues(alpha: $1)", "boundary": "free_text",
                  "applies_to": ["lib/ui/**"] }
            ]
        }"#;

        let loaded = parse_ruleset(json, RuleFormat::Json, "rules.json").unwrap();
        assert_eq!(loaded.include, vec!["lib/**/*.dart".to_string()]);
        assert_eq!(loaded.rules.len(), 2);

        let share = loaded.rules.get("share").unwrap();
        assert_eq!(share.matcher.kind, PatternKind::Literal);
        assert!(share.is_idempotent());
        assert!(share.applies_to.is_all());

        let opacity = loaded.rules.get("opacity").unwrap();
        assert_eq!(opacity.matcher.kind, PatternKind::Regex);
        assert!(!opacity.applies_to.matches("lib/main.dart"));
    }

    #[test]
    fn parses_toml() {
        let toml = r#"
            exclude = ["**/*.g.dart"]

            [[rules]]
            id = "global-db"
            category = "file_rename"
            pattern = "GlobalDB.dart"
            replacement = "global_db.dart"

            [[rules]]
            id = "override"
            category = "style_normalization"
            kind = "regex"
            pattern = '(\n\s+)(bool\s+showLyrics)'
            replacement = '$1@override$1$2'
            boundary = "free_text"
            safety = "requires_guard"
            guard = '@override\s+bool\s+showLyrics'
        "#;

        let loaded = parse_ruleset(toml, RuleFormat::Toml, "rules.toml").unwrap();
        assert_eq!(loaded.exclude, vec!["**/*.g.dart".to_string()]);
        let guarded = loaded.rules.get("override").unwrap();
        assert_eq!(guarded.safety, SafetyClass::RequiresGuard);
        assert!(guarded.guard_matches("  @override\n  bool showLyrics = true;"));
    }

    #[test]
    fn parses_yaml() {
        let yaml = "rules:\n  - id: enum-jis\n    category: identifier_rename\n    pattern: eng_JIS\n    replacement: engJis\n";
        let loaded = parse_ruleset(yaml, RuleFormat::Yaml, "rules.yaml").unwrap();
        assert_eq!(
            loaded.rules.get("enum-jis").unwrap().category,
            RuleCategory::IdentifierRename
        );
    }

    #[test]
    fn duplicate_ids_fail_the_load() {
        let json = r#"{ "rules": [
            { "id": "x", "category": "api_migration", "pattern": "a", "replacement": "b" },
            { "id": "x", "category": "style_normalization", "pattern": "c", "replacement": "d" }
        ] }"#;
        let err = parse_ruleset(json, RuleFormat::Json, "rules.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::RuleDuplicateId);
    }

    #[test]
    fn guarded_rule_without_guard_is_rejected() {
        let json = r#"{ "rules": [
            { "id": "g", "category": "api_migration", "pattern": "a",
              "replacement": "b", "safety": "requires_guard" }
        ] }"#;
        let err = parse_ruleset(json, RuleFormat::Json, "rules.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::RuleInvalid);
    }

    #[test]
    fn idempotent_rule_with_guard_is_rejected() {
        let json = r#"{ "rules": [
            { "id": "g", "category": "style_normalization", "pattern": "a",
              "replacement": "b", "safety": "idempotent", "guard": "b" }
        ] }"#;
        let err = parse_ruleset(json, RuleFormat::Json, "rules.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::RuleInvalid);
        assert!(err.message.contains("must not declare a guard"));
    }

    #[test]
    fn guard_without_safety_implies_requires_guard() {
        let json = r#"{ "rules": [
            { "id": "g", "category": "style_normalization", "pattern": "a",
              "replacement": "b", "guard": "b" }
        ] }"#;
        let loaded = parse_ruleset(json, RuleFormat::Json, "rules.json").unwrap();
        assert!(!loaded.rules.get("g").unwrap().is_idempotent());
    }

    #[test]
    fn bad_regex_is_reported_against_rule() {
        let json = r#"{ "rules": [
            { "id": "broken", "category": "api_migration", "kind": "regex",
              "pattern": "(", "replacement": "" }
        ] }"#;
        let err = parse_ruleset(json, RuleFormat::Json, "rules.json").unwrap_err();
        assert_eq!(err.details["ruleId"], "broken");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let err = parse_ruleset("{ not json", RuleFormat::Json, "rules.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidFile);
    }

    #[test]
    fn empty_selection_glob_is_rejected() {
        let err = parse_ruleset(r#"{ "exclude": [""] }"#, RuleFormat::Json, "rules.json").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(RuleFormat::from_path(Path::new("r.yml")).unwrap(), RuleFormat::Yaml);
        assert!(RuleFormat::from_path(Path::new("r.txt")).is_err());
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(
            &path,
            r#"{ "rules": [ { "id": "a", "category": "api_migration", "pattern": "x", "replacement": "y" } ] }"#,
        )
        .unwrap();

        let loaded = load_ruleset(&path).unwrap();
        assert_eq!(loaded.rules.len(), 1);
    }
}
