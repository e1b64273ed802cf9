//! Rewrite planning for one file.
//!
//! Rules run in category order, then registration order, each against the
//! content left by the rules before it. Within one category a rule may not
//! rewrite text an earlier rule of that category produced. Edits of one rule
//! are applied from the end of the text backwards so offsets stay valid.

use std::collections::HashSet;

use serde::Serialize;

use crate::catalog::SourceFile;
use crate::error::{Error, Result};
use crate::fixup::RenameEvent;
use crate::log_status;
use crate::matcher::{find_matches, is_ident_char, line_of, BoundaryAmbiguity, MatchSpan};
use crate::report::RuleHit;
use crate::rules::{RuleCategory, RuleSet, RuleSpec};

// ============================================================================
// Plan types
// ============================================================================

/// One committed edit. Offsets refer to the content as it stood when the
/// step runs, after every earlier step.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub span: MatchSpan,
    pub replacement: String,
    pub category: RuleCategory,
    /// Exact text replaced; wider than the match for whole-line removals.
    pub before: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FilePlan {
    pub path: String,
    pub steps: Vec<PlanStep>,
    /// Identifier renames made here. Every one is collision-checked; those of
    /// scoped rules are also carried to the rest of the catalog.
    pub renames: Vec<RenameEvent>,
    pub ambiguities: Vec<BoundaryAmbiguity>,
    /// Guarded rules skipped because their guard already matched.
    pub guarded: Vec<String>,
    pub result: String,
}

impl FilePlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Occurrences per rule, in first-hit order.
    pub fn hits(&self) -> Vec<RuleHit> {
        let mut hits: Vec<RuleHit> = Vec::new();
        for step in &self.steps {
            match hits.iter_mut().find(|h| h.rule_id == step.span.rule_id) {
                Some(hit) => hit.occurrences += 1,
                None => hits.push(RuleHit {
                    rule_id: step.span.rule_id.clone(),
                    occurrences: 1,
                }),
            }
        }
        hits
    }
}

/// File renames computed from one path.
#[derive(Debug, Clone, Default)]
pub struct RenamePlan {
    /// Chained events: each starts from the previous event's new name.
    pub events: Vec<RenameEvent>,
    pub ambiguities: Vec<BoundaryAmbiguity>,
}

struct Edit {
    start: usize,
    end: usize,
    span: MatchSpan,
    replacement: String,
}

// ============================================================================
// Planner
// ============================================================================

pub struct RewritePlanner<'a> {
    rules: &'a RuleSet,
}

impl<'a> RewritePlanner<'a> {
    pub fn new(rules: &'a RuleSet) -> Self {
        Self { rules }
    }

    /// Apply every FileRename rule to the file's current path.
    pub fn plan_renames(&self, file: &SourceFile) -> RenamePlan {
        let mut plan = RenamePlan::default();
        let mut current = file.path().to_string();

        for rule in self.rules.in_category(RuleCategory::FileRename) {
            if !rule.applies_to.matches(&current) {
                continue;
            }

            let outcome = find_matches(&current, &rule.matcher, &rule.id);
            log_ambiguities(&current, &outcome.ambiguities);
            plan.ambiguities.extend(outcome.ambiguities);

            let renamed = rewrite_all(&current, rule, &outcome.spans);
            if renamed != current {
                plan.events
                    .push(RenameEvent::file(current.clone(), renamed.clone(), &rule.id));
                current = renamed;
            }
        }

        plan
    }

    /// Plan every content rule for one file. Rules named in `suppressed` are
    /// left out, which is how a rolled-back rename is re-planned.
    pub fn plan(&self, file: &SourceFile, suppressed: &HashSet<String>) -> FilePlan {
        self.plan_categories(file, suppressed, &RuleCategory::ORDER[1..])
    }

    /// Like `plan`, restricted to the rules of `categories`.
    pub fn plan_categories(
        &self,
        file: &SourceFile,
        suppressed: &HashSet<String>,
        categories: &[RuleCategory],
    ) -> FilePlan {
        let mut plan = FilePlan {
            path: file.path().to_string(),
            ..Default::default()
        };
        let mut content = file.content().to_string();
        let mut consumed: Vec<(usize, usize)> = Vec::new();
        let mut category: Option<RuleCategory> = None;

        for rule in self.rules.ordered() {
            if rule.category == RuleCategory::FileRename
                || !categories.contains(&rule.category)
                || suppressed.contains(&rule.id)
                || !rule.applies_to.matches(file.path())
            {
                continue;
            }

            if category != Some(rule.category) {
                consumed.clear();
                category = Some(rule.category);
            }

            if !rule.is_idempotent() && rule.guard_matches(&content) {
                log_status!("plan", "{}: guard for '{}' already satisfied", file.path(), rule.id);
                plan.guarded.push(rule.id.clone());
                continue;
            }

            let outcome = find_matches(&content, &rule.matcher, &rule.id);
            log_ambiguities(file.path(), &outcome.ambiguities);
            plan.ambiguities.extend(outcome.ambiguities);

            let mut edits: Vec<Edit> = Vec::new();
            for span in outcome.spans {
                let replacement = rule.render(&span);
                if replacement == span.matched() {
                    continue;
                }

                let (start, end) = if rule.category == RuleCategory::ImportRemoval
                    && replacement.is_empty()
                {
                    whole_line(&content, span.start, span.end)
                } else {
                    (span.start, span.end)
                };

                let overlaps_consumed = consumed.iter().any(|&(s, e)| start < e && s < end);
                let overlaps_edit = edits.iter().any(|e| start < e.end && e.start < end);
                if overlaps_consumed || overlaps_edit {
                    log_status!(
                        "plan",
                        "{}: '{}' skipped at offset {}, text already rewritten",
                        file.path(),
                        rule.id,
                        start
                    );
                    continue;
                }

                edits.push(Edit {
                    start,
                    end,
                    span,
                    replacement,
                });
            }

            if edits.is_empty() {
                continue;
            }

            if rule.category == RuleCategory::IdentifierRename {
                for edit in &edits {
                    let old = edit.span.matched();
                    if !is_identifier(old) || !is_identifier(&edit.replacement) {
                        continue;
                    }
                    let event = RenameEvent::identifier(old, edit.replacement.clone(), &rule.id);
                    if !plan.renames.contains(&event) {
                        plan.renames.push(event);
                    }
                }
            }

            for edit in edits.into_iter().rev() {
                let before = content[edit.start..edit.end].to_string();
                let line = line_of(&content, edit.start);
                content.replace_range(edit.start..edit.end, &edit.replacement);

                let new_end = edit.start + edit.replacement.len();
                shift_regions(&mut consumed, edit.end, new_end as isize - edit.end as isize);
                consumed.push((edit.start, new_end));

                plan.steps.push(PlanStep {
                    span: MatchSpan {
                        start: edit.start,
                        end: edit.end,
                        ..edit.span
                    },
                    replacement: edit.replacement,
                    category: rule.category,
                    before,
                    line,
                });
            }
        }

        plan.result = content;
        plan
    }

    /// Replay a plan against the file's content.
    ///
    /// Every step must find exactly the text it was planned against.
    pub fn apply(&self, file: &SourceFile, plan: &FilePlan) -> Result<String> {
        let mut content = file.content().to_string();

        for step in &plan.steps {
            let (start, end) = (step.span.start, step.span.end);
            if content.get(start..end) != Some(step.before.as_str()) {
                return Err(Error::internal_unexpected(format!(
                    "Plan for {} is stale at offset {} (rule '{}')",
                    file.path(),
                    start,
                    step.span.rule_id
                )));
            }
            content.replace_range(start..end, &step.replacement);
        }

        Ok(content)
    }

    /// Idempotent rules that would still change `content` (or, for file
    /// renames, `path`), with the number of remaining matches.
    pub fn residual(
        &self,
        path: &str,
        content: &str,
        excluded: &HashSet<String>,
    ) -> Vec<(String, usize)> {
        let mut residual = Vec::new();

        for rule in self.rules.ordered() {
            if !rule.is_idempotent()
                || excluded.contains(&rule.id)
                || !rule.applies_to.matches(path)
            {
                continue;
            }

            let text = match rule.category {
                RuleCategory::FileRename => path,
                _ => content,
            };

            let remaining = find_matches(text, &rule.matcher, &rule.id)
                .spans
                .iter()
                .filter(|span| rule.render(span) != span.matched())
                .count();

            if remaining > 0 {
                residual.push((rule.id.clone(), remaining));
            }
        }

        residual
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn log_ambiguities(path: &str, ambiguities: &[BoundaryAmbiguity]) {
    for a in ambiguities {
        log_status!(
            "match",
            "{}: '{}' skipped at {}..{} ({:?})",
            path,
            a.rule_id,
            a.start,
            a.end,
            a.reason
        );
    }
}

/// Replace every span in `text`, back to front.
fn rewrite_all(text: &str, rule: &RuleSpec, spans: &[MatchSpan]) -> String {
    let mut out = text.to_string();
    for span in spans.iter().rev() {
        let replacement = rule.render(span);
        if replacement != span.matched() {
            out.replace_range(span.start..span.end, &replacement);
        }
    }
    out
}

/// Widen `[start, end)` to its whole line, newline included, when nothing but
/// whitespace shares the line with it.
fn whole_line(content: &str, start: usize, end: usize) -> (usize, usize) {
    let line_start = content[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = if content[..end].ends_with('\n') {
        end
    } else {
        content[end..]
            .find('\n')
            .map(|i| end + i + 1)
            .unwrap_or(content.len())
    };

    let blank_before = content[line_start..start].trim().is_empty();
    let blank_after = content[end..line_end].trim().is_empty();

    if blank_before && blank_after {
        (line_start, line_end)
    } else {
        (start, end)
    }
}

fn shift_regions(regions: &mut [(usize, usize)], from: usize, delta: isize) {
    for region in regions.iter_mut() {
        if region.0 >= from {
            region.0 = (region.0 as isize + delta) as usize;
            region.1 = (region.1 as isize + delta) as usize;
        }
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_') && chars.all(is_ident_char)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{AppliesTo, Boundary, Matcher, PatternKind};

    fn literal(id: &str, category: RuleCategory, pattern: &str, replacement: &str) -> RuleSpec {
        RuleSpec::literal(id, category, pattern, replacement).unwrap()
    }

    fn regex(id: &str, category: RuleCategory, pattern: &str, replacement: &str) -> RuleSpec {
        let matcher = Matcher::new(pattern, PatternKind::Regex, Boundary::FreeText).unwrap();
        RuleSpec::new(id, category, matcher, replacement)
    }

    fn plan_for(rules: Vec<RuleSpec>, content: &str) -> FilePlan {
        let set = RuleSet::from_rules(rules).unwrap();
        let file = SourceFile::new("lib/a.dart", content);
        RewritePlanner::new(&set).plan(&file, &HashSet::new())
    }

    #[test]
    fn word_rule_leaves_longer_identifiers_alone() {
        let plan = plan_for(
            vec![literal("r", RuleCategory::IdentifierRename, "foo", "bar")],
            "foobar123 foo",
        );
        assert_eq!(plan.result, "foobar123 bar");
        assert_eq!(plan.hits()[0].occurrences, 1);
    }

    #[test]
    fn later_categories_see_earlier_edits() {
        let plan = plan_for(
            vec![
                literal("y-z", RuleCategory::StyleNormalization, "Y", "Z"),
                literal("x-y", RuleCategory::ApiMigration, "X", "Y"),
            ],
            "X",
        );
        assert_eq!(plan.result, "Z");
        let order: Vec<&str> = plan.steps.iter().map(|s| s.span.rule_id.as_str()).collect();
        assert_eq!(order, vec!["x-y", "y-z"]);
    }

    #[test]
    fn same_category_does_not_rewrite_fresh_text() {
        let plan = plan_for(
            vec![
                literal("x-y", RuleCategory::ApiMigration, "X", "Y"),
                literal("y-z", RuleCategory::ApiMigration, "Y", "Z"),
            ],
            "X Y",
        );
        assert_eq!(plan.result, "Y Z");
    }

    #[test]
    fn regex_rule_renders_groups() {
        let plan = plan_for(
            vec![regex(
                "opacity",
                RuleCategory::ApiMigration,
                r"\.withOpacity\(([0-9.]+)\)",
                ".withValues(alpha: $1)",
            )],
            "a.withOpacity(0.5); b.withOpacity(1)",
        );
        assert_eq!(plan.result, "a.withValues(alpha: 0.5); b.withValues(alpha: 1)");
        assert_eq!(plan.steps[0].line, 1);
    }

    #[test]
    fn no_op_matches_are_not_hits() {
        let plan = plan_for(
            vec![regex("same", RuleCategory::StyleNormalization, r"(\w+)", "$1")],
            "abc def",
        );
        assert!(plan.is_empty());
        assert_eq!(plan.result, "abc def");
    }

    #[test]
    fn import_removal_drops_the_whole_line() {
        let content = "import 'a.dart';\n  import 'unused.dart';  \nvoid main() {}\n";
        let plan = plan_for(
            vec![RuleSpec::new(
                "unused",
                RuleCategory::ImportRemoval,
                Matcher::new("import 'unused.dart';", PatternKind::Literal, Boundary::FreeText)
                    .unwrap(),
                "",
            )],
            content,
        );
        assert_eq!(plan.result, "import 'a.dart';\nvoid main() {}\n");
    }

    #[test]
    fn import_removal_inside_a_line_keeps_the_line() {
        let plan = plan_for(
            vec![RuleSpec::new(
                "inline",
                RuleCategory::ImportRemoval,
                Matcher::new("show Foo", PatternKind::Literal, Boundary::FreeText).unwrap(),
                "",
            )],
            "import 'a.dart' show Foo;\n",
        );
        assert_eq!(plan.result, "import 'a.dart' ;\n");
    }

    #[test]
    fn guarded_rule_skips_already_applied_files() {
        let rule = regex(
            "override",
            RuleCategory::StyleNormalization,
            r"(\n\s+)(bool\s+showLyrics)",
            "$1@override$1$2",
        )
        .with_guard(r"@override\s+bool\s+showLyrics")
        .unwrap();

        let first = plan_for(vec![rule.clone()], "class A {\n  bool showLyrics = true;\n}");
        assert_eq!(first.result, "class A {\n  @override\n  bool showLyrics = true;\n}");

        let second = plan_for(vec![rule], &first.result);
        assert!(second.is_empty());
        assert_eq!(second.guarded, vec!["override"]);
    }

    #[test]
    fn applies_to_limits_rules() {
        let rule = literal("scoped", RuleCategory::ApiMigration, "x", "y")
            .with_applies_to(AppliesTo::Globs(vec!["test/**".to_string()]));
        let plan = plan_for(vec![rule], "x");
        assert!(plan.is_empty());
    }

    #[test]
    fn identifier_rename_emits_event() {
        let rule = literal("jis", RuleCategory::IdentifierRename, "eng_JIS", "engJis")
            .with_applies_to(AppliesTo::Globs(vec!["lib/*.dart".to_string()]));
        let plan = plan_for(vec![rule], "enum L { eng_JIS }\nL.eng_JIS");

        assert_eq!(plan.result, "enum L { engJis }\nL.engJis");
        assert_eq!(plan.renames.len(), 1);
        assert_eq!(plan.renames[0].old_name, "eng_JIS");
        assert_eq!(plan.renames[0].new_name, "engJis");
    }

    #[test]
    fn unscoped_identifier_rename_emits_event_too() {
        let rule = literal("n", RuleCategory::IdentifierRename, "oldName", "newName");
        let plan = plan_for(vec![rule], "var oldName = 1;");
        assert_eq!(plan.renames, vec![RenameEvent::identifier("oldName", "newName", "n")]);
    }

    #[test]
    fn plan_categories_runs_only_those_rules() {
        let set = RuleSet::from_rules(vec![
            literal("api", RuleCategory::ApiMigration, "a", "b"),
            literal("style", RuleCategory::StyleNormalization, "c", "d"),
        ])
        .unwrap();
        let file = SourceFile::new("x.txt", "a c");
        let plan = RewritePlanner::new(&set).plan_categories(
            &file,
            &HashSet::new(),
            &[RuleCategory::StyleNormalization],
        );
        assert_eq!(plan.result, "a d");
    }

    #[test]
    fn apply_replays_plan() {
        let set = RuleSet::from_rules(vec![
            literal("a", RuleCategory::ApiMigration, "one", "uno"),
            literal("b", RuleCategory::StyleNormalization, "uno", "eins"),
            literal("c", RuleCategory::StyleNormalization, "two", "zwei"),
        ])
        .unwrap();
        let file = SourceFile::new("x.txt", "one two one\ntwo");
        let planner = RewritePlanner::new(&set);
        let plan = planner.plan(&file, &HashSet::new());

        assert_eq!(planner.apply(&file, &plan).unwrap(), plan.result);
        assert_eq!(plan.result, "eins zwei eins\nzwei");
    }

    #[test]
    fn apply_rejects_stale_plan() {
        let set =
            RuleSet::from_rules(vec![literal("a", RuleCategory::ApiMigration, "one", "uno")]).unwrap();
        let planner = RewritePlanner::new(&set);
        let plan = planner.plan(&SourceFile::new("x.txt", "one"), &HashSet::new());
        assert!(planner.apply(&SourceFile::new("x.txt", "two"), &plan).is_err());
    }

    #[test]
    fn second_plan_over_result_is_empty() {
        let set = RuleSet::from_rules(vec![
            literal("a", RuleCategory::ApiMigration, "Share", "SharePlus"),
            regex("b", RuleCategory::StyleNormalization, r"\s+;", ";"),
        ])
        .unwrap();
        let planner = RewritePlanner::new(&set);
        let first = planner.plan(&SourceFile::new("x.dart", "Share.share(x) ;"), &HashSet::new());
        let second = planner.plan(&SourceFile::new("x.dart", first.result.clone()), &HashSet::new());

        assert_eq!(first.result, "SharePlus.share(x);");
        assert!(second.is_empty());
        assert!(planner.residual("x.dart", &first.result, &HashSet::new()).is_empty());
    }

    #[test]
    fn residual_names_rules_that_still_match() {
        let set = RuleSet::from_rules(vec![
            literal("x-y", RuleCategory::ApiMigration, "X", "Y"),
            literal("y-x", RuleCategory::StyleNormalization, "Y", "X"),
        ])
        .unwrap();
        let planner = RewritePlanner::new(&set);
        let plan = planner.plan(&SourceFile::new("f", "X"), &HashSet::new());

        assert_eq!(plan.result, "X");
        assert_eq!(
            planner.residual("f", &plan.result, &HashSet::new()),
            vec![("x-y".to_string(), 1)]
        );
    }

    #[test]
    fn file_renames_chain() {
        let set = RuleSet::from_rules(vec![
            literal("case", RuleCategory::FileRename, "GlobalDB.dart", "global_db.dart"),
            RuleSpec::new(
                "move",
                RuleCategory::FileRename,
                Matcher::new("lib/global_db", PatternKind::Literal, Boundary::FreeText).unwrap(),
                "lib/db/global_db",
            ),
        ])
        .unwrap();
        let plan = RewritePlanner::new(&set).plan_renames(&SourceFile::new("lib/GlobalDB.dart", ""));

        assert_eq!(plan.events.len(), 2);
        assert_eq!(plan.events[0].new_name, "lib/global_db.dart");
        assert_eq!(plan.events[1].old_name, "lib/global_db.dart");
        assert_eq!(plan.events[1].new_name, "lib/db/global_db.dart");
    }
}
