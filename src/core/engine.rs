//! Run orchestration.
//!
//! A run is strictly sequential and owns the catalog mutably for its whole
//! length, so every rename and its fixup happen in one exclusive section.
//!
//! Phases:
//! 1. renames: FileRename rules over every path, each event fixed up at once
//! 2. content: remaining categories in catalog-wide stages, identifier
//!    renames vetted per stage and carried once every file has been planned
//! 3. verification: idempotent rules re-scanned over the final tree
//! 4. persist (skipped for dry runs)
//! 5. run log (skipped for dry runs)

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::catalog::FileCatalog;
use crate::error::{Error, ErrorCode, Result};
use crate::fixup::{self, FixupResult, RenameEvent};
use crate::log_status;
use crate::matcher::BoundaryAmbiguity;
use crate::planner::{FilePlan, RewritePlanner};
use crate::report::{
    AmbiguityRecord, ChangedSpan, FileReport, IdempotencyViolation, PersistFailureRecord,
    RenameRecord, RenameStatus, RunReport,
};
use crate::rules::{RuleCategory, RuleSet};
use crate::run_log::{self, RunLog};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub roots: Vec<PathBuf>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub dry_run: bool,
    /// Ruleset label recorded in the run log.
    pub ruleset: Option<String>,
}

/// Content categories run over the whole catalog one stage at a time, so a
/// carried identifier rename lands after every file's earlier categories.
const CONTENT_STAGES: [&[RuleCategory]; 3] = [
    &[RuleCategory::ImportRemoval, RuleCategory::ApiMigration],
    &[RuleCategory::IdentifierRename],
    &[RuleCategory::StyleNormalization],
];

/// Load the tree, run every pass, and (unless dry-run) write the results.
///
/// Per-file problems end up in the report; only failures that prevent the
/// run from starting are returned as errors.
pub fn run(rules: &RuleSet, options: &RunOptions) -> Result<RunReport> {
    let mut catalog = FileCatalog::load(&options.roots, &options.include, &options.exclude)?;
    let run_id = uuid::Uuid::new_v4().to_string();

    log_status!(
        "run",
        "{} rules over {} files{}",
        rules.len(),
        catalog.len(),
        if options.dry_run { " (dry run)" } else { "" }
    );

    let mut pass = Pass::new(rules, run_id, options.dry_run, &catalog);
    pass.rename_phase(&mut catalog);
    pass.content_phase(&mut catalog);
    pass.verify(&catalog);

    if !options.dry_run {
        pass.persist(&catalog);
    }

    let mut report = pass.finish(&catalog);

    if !options.dry_run {
        if let Some(root) = options.roots.first() {
            let log = RunLog::new(report.clone(), &options.roots, options.ruleset.clone());
            if let Err(e) = run_log::save(&log, root) {
                log_status!("run", "Failed to write run log: {}", e);
                report.persist_failures.push(PersistFailureRecord {
                    path: run_log::run_log_path(root).display().to_string(),
                    code: ErrorCode::PersistFailed.as_str().to_string(),
                    message: describe(&e),
                });
                report.finish();
            }
        }
    }

    log_status!(
        "run",
        "Done: {} changed, {} renamed, exit code {}",
        report.summary.files_changed,
        report.summary.files_renamed,
        report.summary.exit_code
    );

    Ok(report)
}

/// Turn a failed run into an error value, for callers that want `?`.
pub fn ensure_success(report: &RunReport) -> Result<()> {
    if !report.persist_failures.is_empty() {
        let first = &report.persist_failures[0];
        return Err(Error::persist_failed(&first.path, &first.message, 2));
    }

    if let Some(record) = report.renames.iter().find(|r| r.is_rolled_back()) {
        return Err(Error::rename_collision(
            record.event.kind.as_str(),
            &record.event.old_name,
            &record.event.new_name,
            match &record.status {
                RenameStatus::RolledBack { reason } => reason.as_str(),
                RenameStatus::Applied { .. } => "",
            },
        ));
    }

    if !report.idempotent {
        let mut ids: Vec<String> = report.violations.iter().map(|v| v.rule_id.clone()).collect();
        ids.sort();
        ids.dedup();
        return Err(Error::idempotency_violation(ids));
    }

    Ok(())
}

fn describe(error: &Error) -> String {
    match error.details.get("error").and_then(|v| v.as_str()) {
        Some(detail) => format!("{}: {}", error.message, detail),
        None => error.message.clone(),
    }
}

// ============================================================================
// Pass state
// ============================================================================

struct Pass<'a> {
    rules: &'a RuleSet,
    planner: RewritePlanner<'a>,
    report: RunReport,
    /// Load-time paths, in enumeration order.
    originals: Vec<String>,
    errored: HashSet<String>,
    /// Rules whose rename was rolled back, per original path.
    rolled_back: HashMap<String, HashSet<String>>,
}

impl<'a> Pass<'a> {
    fn new(rules: &'a RuleSet, run_id: String, dry_run: bool, catalog: &FileCatalog) -> Self {
        let mut report = RunReport::new(run_id, dry_run);
        report.skipped = catalog.skipped().to_vec();
        for file in catalog.files() {
            report
                .files
                .push(FileReport::new(file.original_path(), file.loaded_hash()));
        }

        Self {
            rules,
            planner: RewritePlanner::new(rules),
            report,
            originals: catalog.files().iter().map(|f| f.original_path().to_string()).collect(),
            errored: HashSet::new(),
            rolled_back: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Phase 1: file renames
    // ------------------------------------------------------------------------

    fn rename_phase(&mut self, catalog: &mut FileCatalog) {
        if self.rules.in_category(RuleCategory::FileRename).next().is_none() {
            return;
        }

        for original in self.originals.clone() {
            let Some(file) = catalog.by_original(&original) else {
                continue;
            };
            let plan = self.planner.plan_renames(file);
            let path = file.path().to_string();
            self.record_ambiguities(&path, plan.ambiguities);

            for event in plan.events {
                match fixup::apply(&event, catalog) {
                    Ok(result) => {
                        self.add_hits(&original, &event.originating_rule_id, 1);
                        self.record_fixup(&event, &result);
                    }
                    Err(e) => {
                        self.fail_rename(&original, &event, &e);
                        break;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Phase 2: content rules
    // ------------------------------------------------------------------------

    fn content_phase(&mut self, catalog: &mut FileCatalog) {
        for categories in CONTENT_STAGES {
            self.content_stage(catalog, categories);
        }
    }

    /// Run `categories` over every file, then carry the stage's identifier
    /// renames. Collisions are checked against the catalog as the stage found
    /// it; a colliding rule is dropped from the files that produced the event
    /// and those files are re-planned.
    fn content_stage(&mut self, catalog: &mut FileCatalog, categories: &[RuleCategory]) {
        let mut suppressed: HashMap<String, HashSet<String>> = HashMap::new();
        let mut rejected: Vec<(RenameEvent, Error)> = Vec::new();
        let none = HashSet::new();

        let plans = loop {
            let plans: Vec<(String, FilePlan)> = self
                .originals
                .iter()
                .filter(|original| !self.errored.contains(*original))
                .filter_map(|original| {
                    let file = catalog.by_original(original)?;
                    let held = suppressed.get(original).unwrap_or(&none);
                    let plan = self.planner.plan_categories(file, held, categories);
                    Some((original.clone(), plan))
                })
                .collect();

            let collisions = vet_renames(&plans, catalog);
            if collisions.is_empty() {
                break plans;
            }

            for (event, error) in collisions {
                for (original, plan) in &plans {
                    if plan.renames.contains(&event) {
                        suppressed
                            .entry(original.clone())
                            .or_default()
                            .insert(event.originating_rule_id.clone());
                        self.roll_back(original, &event);
                    }
                }
                rejected.push((event, error));
            }
        };

        for (event, error) in &rejected {
            self.record_rolled_back(event, error);
        }

        let mut vetted: Vec<(RenameEvent, usize)> = Vec::new();
        for (original, plan) in plans {
            let Some(file) = catalog.by_original(&original) else {
                continue;
            };
            let committed = match self.planner.apply(file, &plan) {
                Ok(content) => content,
                Err(e) => {
                    log_status!("plan", "{}: {}", plan.path, e);
                    self.errored.insert(original.clone());
                    self.issue(&original, format!("planning failed: {}", e));
                    continue;
                }
            };

            for event in &plan.renames {
                match vetted.iter_mut().find(|(e, _)| e == event) {
                    Some((_, files)) => *files += 1,
                    None => vetted.push((event.clone(), 1)),
                }
            }

            if let Some(file) = catalog.by_original_mut(&original) {
                file.set_content(committed);
            }
            self.record_plan(&original, plan);
        }

        for (event, files) in vetted {
            if !self.is_scoped(&event.originating_rule_id) {
                // The rule already ran on every file it applies to.
                self.report.renames.push(RenameRecord {
                    event,
                    status: RenameStatus::Applied {
                        files_updated: files,
                    },
                });
                continue;
            }

            match fixup::carry(&event, catalog) {
                Ok(result) => self.record_fixup(&event, &result),
                Err(e) => log_status!(
                    "fixup",
                    "{} -> {} not carried: {}",
                    event.old_name,
                    event.new_name,
                    e.message
                ),
            }
        }
    }

    fn is_scoped(&self, rule_id: &str) -> bool {
        self.rules
            .get(rule_id)
            .is_some_and(|rule| !rule.applies_to.is_all())
    }

    // ------------------------------------------------------------------------
    // Phase 3: verification
    // ------------------------------------------------------------------------

    fn verify(&mut self, catalog: &FileCatalog) {
        let none = HashSet::new();

        for file in catalog.files() {
            let excluded = self
                .rolled_back
                .get(file.original_path())
                .unwrap_or(&none);

            for (rule_id, remaining) in self.planner.residual(file.path(), file.content(), excluded) {
                log_status!(
                    "run",
                    "Idempotency violation: '{}' still matches {}x in {}",
                    rule_id,
                    remaining,
                    file.path()
                );
                self.report.violations.push(IdempotencyViolation {
                    rule_id: rule_id.clone(),
                    path: file.path().to_string(),
                    remaining,
                });
                self.issue(
                    file.original_path(),
                    format!("rule '{}' still matches {}x", rule_id, remaining),
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Phase 4: persist
    // ------------------------------------------------------------------------

    fn persist(&mut self, catalog: &FileCatalog) {
        let summary = catalog.persist_except(&self.errored);

        for failure in summary.failures {
            let message = describe(&failure.error);
            self.report.persist_failures.push(PersistFailureRecord {
                path: failure.path.clone(),
                code: failure.error.code.as_str().to_string(),
                message: message.clone(),
            });
            self.errored.insert(failure.path.clone());
            self.issue(&failure.path, format!("write failed: {}", message));
        }
    }

    fn finish(mut self, catalog: &FileCatalog) -> RunReport {
        for record in &mut self.report.files {
            if let Some(file) = catalog.by_original(&record.original_path) {
                record.path = file.path().to_string();
                record.prior_paths = file.prior_paths().to_vec();
                record.post_hash = file.content_hash().to_string();
            }
            record.settle(self.errored.contains(&record.original_path));
        }

        self.report.finish();
        self.report
    }

    // ------------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------------

    fn add_hits(&mut self, original: &str, rule_id: &str, occurrences: usize) {
        if let Some(record) = self.report.file_mut(original) {
            record.add_hits(rule_id, occurrences);
        }
    }

    fn issue(&mut self, original: &str, issue: String) {
        if let Some(record) = self.report.file_mut(original) {
            record.issues.push(issue);
        }
    }

    fn record_plan(&mut self, original: &str, plan: FilePlan) {
        let hits = plan.hits();
        let path = plan.path.clone();
        self.record_ambiguities(&path, plan.ambiguities);

        let Some(record) = self.report.file_mut(original) else {
            return;
        };
        for hit in hits {
            record.add_hits(&hit.rule_id, hit.occurrences);
        }
        record.changes.extend(plan.steps.into_iter().map(|step| ChangedSpan {
            rule_id: step.span.rule_id,
            line: step.line,
            before: step.before,
            after: step.replacement,
        }));
    }

    /// Record references rewritten by a fixup.
    fn record_fixup(&mut self, event: &RenameEvent, result: &FixupResult) {
        let files_updated = result.touched.len();
        for touched in &result.touched {
            if let Some(record) = self.report.file_mut(&touched.original_path) {
                record.add_hits(&event.originating_rule_id, touched.occurrences);
                record.changes.extend(touched.changes.iter().cloned());
            }
        }

        self.report.renames.push(RenameRecord {
            event: event.clone(),
            status: RenameStatus::Applied { files_updated },
        });
    }

    fn fail_rename(&mut self, original: &str, event: &RenameEvent, error: &Error) {
        self.record_rolled_back(event, error);
        self.roll_back(original, event);
    }

    fn record_rolled_back(&mut self, event: &RenameEvent, error: &Error) {
        log_status!(
            "fixup",
            "Rolled back {} -> {} ({}): {}",
            event.old_name,
            event.new_name,
            event.originating_rule_id,
            error.message
        );

        self.report.renames.push(RenameRecord {
            event: event.clone(),
            status: RenameStatus::RolledBack {
                reason: describe_collision(error),
            },
        });
    }

    /// Exclude the event's rule from `original` for verification and note it.
    fn roll_back(&mut self, original: &str, event: &RenameEvent) {
        self.rolled_back
            .entry(original.to_string())
            .or_default()
            .insert(event.originating_rule_id.clone());
        self.issue(
            original,
            format!("rename {} -> {} rolled back", event.old_name, event.new_name),
        );
    }

    fn record_ambiguities(&mut self, path: &str, ambiguities: Vec<BoundaryAmbiguity>) {
        self.report
            .ambiguities
            .extend(ambiguities.into_iter().map(|ambiguity| AmbiguityRecord {
                path: path.to_string(),
                ambiguity,
            }));
    }
}

fn describe_collision(error: &Error) -> String {
    match error.details.get("conflictsWith").and_then(|v| v.as_str()) {
        Some(other) => format!("{} (conflicts with {})", error.message, other),
        None => error.message.clone(),
    }
}

/// Identifier renames across `plans` that would collide. An event planned
/// by several files is checked once.
fn vet_renames(plans: &[(String, FilePlan)], catalog: &FileCatalog) -> Vec<(RenameEvent, Error)> {
    let mut accepted: Vec<&RenameEvent> = Vec::new();
    let mut claimed = HashSet::new();
    let mut collisions: Vec<(RenameEvent, Error)> = Vec::new();

    for (_, plan) in plans {
        for event in &plan.renames {
            if accepted.contains(&event) || collisions.iter().any(|(e, _)| e == event) {
                continue;
            }
            match fixup::check_collision(event, catalog, &claimed) {
                Ok(()) => {
                    claimed.insert(event.new_name.clone());
                    accepted.push(event);
                }
                Err(e) => collisions.push((event.clone(), e)),
            }
        }
    }

    collisions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::FileStatus;
    use crate::rules::{AppliesTo, RuleSpec};
    use std::fs;

    fn tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    fn options(dir: &tempfile::TempDir, dry_run: bool) -> RunOptions {
        RunOptions {
            roots: vec![dir.path().to_path_buf()],
            dry_run,
            ..Default::default()
        }
    }

    #[test]
    fn clean_run_writes_and_logs() {
        let dir = tree(&[("a.txt", "old name"), ("b.txt", "nothing")]);
        let rules = RuleSet::from_rules(vec![
            RuleSpec::literal("r", RuleCategory::ApiMigration, "old", "new").unwrap(),
        ])
        .unwrap();

        let report = run(&rules, &options(&dir, false)).unwrap();

        assert!(report.is_success());
        assert_eq!(report.file("a.txt").unwrap().status, FileStatus::ChangedCleanly);
        assert_eq!(report.file("b.txt").unwrap().status, FileStatus::Unchanged);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new name");
        assert!(run_log::run_log_path(dir.path()).exists());
        assert!(ensure_success(&report).is_ok());
    }

    #[test]
    fn identifier_collision_rolls_back_only_that_rule() {
        let dir = tree(&[
            ("lib/enums.dart", "enum L { eng_JIS }\nvar x = oldApi();"),
            ("lib/other.dart", "var engJis = 1;"),
        ]);
        let rules = RuleSet::from_rules(vec![
            RuleSpec::literal("api", RuleCategory::ApiMigration, "oldApi", "newApi").unwrap(),
            RuleSpec::literal("jis", RuleCategory::IdentifierRename, "eng_JIS", "engJis")
                .unwrap()
                .with_applies_to(AppliesTo::Globs(vec!["lib/enums.dart".to_string()])),
        ])
        .unwrap();

        let report = run(&rules, &options(&dir, false)).unwrap();

        assert_eq!(report.exit_code(), 2);
        assert!(report.idempotent);
        assert_eq!(
            fs::read_to_string(dir.path().join("lib/enums.dart")).unwrap(),
            "enum L { eng_JIS }\nvar x = newApi();"
        );
        assert_eq!(
            report.file("lib/enums.dart").unwrap().status,
            FileStatus::ChangedWithResidualIssues
        );
        let err = ensure_success(&report).unwrap_err();
        assert_eq!(err.code, ErrorCode::RenameCollision);
    }

    #[test]
    fn errored_file_is_held_back_from_persist() {
        let dir = tree(&[("a.txt", "old"), ("b.txt", "old")]);
        let rules = RuleSet::from_rules(vec![
            RuleSpec::literal("r", RuleCategory::ApiMigration, "old", "new").unwrap(),
        ])
        .unwrap();
        let opts = options(&dir, false);
        let mut catalog = FileCatalog::load(&opts.roots, &opts.include, &opts.exclude).unwrap();

        let mut pass = Pass::new(&rules, "run".to_string(), false, &catalog);
        pass.content_phase(&mut catalog);
        pass.errored.insert("a.txt".to_string());
        pass.persist(&catalog);
        let report = pass.finish(&catalog);

        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old");
        assert_eq!(fs::read_to_string(dir.path().join("b.txt")).unwrap(), "new");
        let a = report.file("a.txt").unwrap();
        assert_eq!(a.status, FileStatus::UntouchedDueToError);
        assert_eq!(a.post_hash, a.pre_hash);
        assert_eq!(report.file("b.txt").unwrap().status, FileStatus::ChangedCleanly);
    }
}
