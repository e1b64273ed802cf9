//! Run report: what every file went through, and whether the run converged.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::catalog::SkippedFile;
use crate::fixup::RenameEvent;
use crate::matcher::BoundaryAmbiguity;

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleHit {
    pub rule_id: String,
    pub occurrences: usize,
}

/// One rewritten run of text, for the diff-style listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedSpan {
    pub rule_id: String,
    pub line: usize,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Unchanged,
    ChangedCleanly,
    ChangedWithResidualIssues,
    UntouchedDueToError,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Unchanged => "unchanged",
            FileStatus::ChangedCleanly => "changed cleanly",
            FileStatus::ChangedWithResidualIssues => "changed with residual issues",
            FileStatus::UntouchedDueToError => "untouched due to error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    /// Final path.
    pub path: String,
    pub original_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_paths: Vec<String>,
    pub status: FileStatus,
    pub rules: Vec<RuleHit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<ChangedSpan>,
    pub pre_hash: String,
    pub post_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl FileReport {
    pub fn new(original_path: &str, pre_hash: &str) -> Self {
        Self {
            path: original_path.to_string(),
            original_path: original_path.to_string(),
            prior_paths: Vec::new(),
            status: FileStatus::Unchanged,
            rules: Vec::new(),
            changes: Vec::new(),
            pre_hash: pre_hash.to_string(),
            post_hash: pre_hash.to_string(),
            issues: Vec::new(),
        }
    }

    pub fn add_hits(&mut self, rule_id: &str, occurrences: usize) {
        if occurrences == 0 {
            return;
        }
        match self.rules.iter_mut().find(|h| h.rule_id == rule_id) {
            Some(hit) => hit.occurrences += occurrences,
            None => self.rules.push(RuleHit {
                rule_id: rule_id.to_string(),
                occurrences,
            }),
        }
    }

    pub fn is_changed(&self) -> bool {
        self.pre_hash != self.post_hash || self.path != self.original_path
    }

    /// Derive the status once hashes and issues are final. `errored` means
    /// the file's own pass or write failed, so the disk still holds the
    /// loaded file at its original path.
    pub fn settle(&mut self, errored: bool) {
        if errored {
            self.post_hash = self.pre_hash.clone();
            self.path = self.original_path.clone();
            self.prior_paths.clear();
        }
        self.status = match (errored, self.is_changed(), self.issues.is_empty()) {
            (true, _, _) => FileStatus::UntouchedDueToError,
            (false, true, true) => FileStatus::ChangedCleanly,
            (false, true, false) => FileStatus::ChangedWithResidualIssues,
            (false, false, true) => FileStatus::Unchanged,
            (false, false, false) => FileStatus::UntouchedDueToError,
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RenameStatus {
    Applied { files_updated: usize },
    RolledBack { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRecord {
    #[serde(flatten)]
    pub event: RenameEvent,
    #[serde(flatten)]
    pub status: RenameStatus,
}

impl RenameRecord {
    pub fn is_rolled_back(&self) -> bool {
        matches!(self.status, RenameStatus::RolledBack { .. })
    }
}

/// An idempotent rule that still matches after the pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyViolation {
    pub rule_id: String,
    pub path: String,
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbiguityRecord {
    pub path: String,
    #[serde(flatten)]
    pub ambiguity: BoundaryAmbiguity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistFailureRecord {
    pub path: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub files_scanned: usize,
    pub files_changed: usize,
    pub files_renamed: usize,
    pub files_failed: usize,
    pub total_replacements: usize,
    pub renames_applied: usize,
    pub renames_rolled_back: usize,
    pub ambiguities: usize,
    pub idempotent: bool,
    pub success: bool,
    pub exit_code: i32,
}

// ============================================================================
// RunReport
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub dry_run: bool,
    pub files: Vec<FileReport>,
    pub renames: Vec<RenameRecord>,
    pub violations: Vec<IdempotencyViolation>,
    pub ambiguities: Vec<AmbiguityRecord>,
    pub persist_failures: Vec<PersistFailureRecord>,
    #[serde(default)]
    pub skipped: Vec<SkippedFile>,
    /// True only if the re-scan found nothing for every idempotent rule.
    pub idempotent: bool,
    pub summary: RunSummary,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            dry_run,
            files: Vec::new(),
            renames: Vec::new(),
            violations: Vec::new(),
            ambiguities: Vec::new(),
            persist_failures: Vec::new(),
            skipped: Vec::new(),
            idempotent: true,
            summary: RunSummary::default(),
        }
    }

    /// Record for a file, by the path it had at load time.
    pub fn file_mut(&mut self, original_path: &str) -> Option<&mut FileReport> {
        self.files
            .iter_mut()
            .find(|f| f.original_path == original_path)
    }

    pub fn file(&self, path: &str) -> Option<&FileReport> {
        self.files
            .iter()
            .find(|f| f.path == path)
            .or_else(|| self.files.iter().find(|f| f.original_path == path))
    }

    /// Per-file rule hits, keyed by final path. Files no rule touched are left out.
    pub fn hits(&self) -> BTreeMap<String, Vec<RuleHit>> {
        self.files
            .iter()
            .filter(|f| !f.rules.is_empty())
            .map(|f| (f.path.clone(), f.rules.clone()))
            .collect()
    }

    /// Did `rule_id` touch the file that is (or was) at `path`?
    pub fn touched(&self, rule_id: &str, path: &str) -> bool {
        self.files
            .iter()
            .filter(|f| {
                f.path == path || f.original_path == path || f.prior_paths.iter().any(|p| p == path)
            })
            .any(|f| f.rules.iter().any(|h| h.rule_id == rule_id))
    }

    /// Highest applicable code wins: persist (3), collision (2), idempotency (1).
    pub fn exit_code(&self) -> i32 {
        if !self.persist_failures.is_empty() {
            3
        } else if self.renames.iter().any(RenameRecord::is_rolled_back) {
            2
        } else if !self.idempotent {
            1
        } else {
            0
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    /// Fill in the summary from the records.
    pub fn finish(&mut self) {
        self.idempotent = self.violations.is_empty();
        self.summary = RunSummary {
            files_scanned: self.files.len(),
            files_changed: self
                .files
                .iter()
                .filter(|f| {
                    matches!(
                        f.status,
                        FileStatus::ChangedCleanly | FileStatus::ChangedWithResidualIssues
                    )
                })
                .count(),
            files_renamed: self
                .files
                .iter()
                .filter(|f| f.path != f.original_path)
                .count(),
            files_failed: self
                .files
                .iter()
                .filter(|f| f.status == FileStatus::UntouchedDueToError)
                .count(),
            total_replacements: self
                .files
                .iter()
                .flat_map(|f| f.rules.iter())
                .map(|h| h.occurrences)
                .sum(),
            renames_applied: self.renames.iter().filter(|r| !r.is_rolled_back()).count(),
            renames_rolled_back: self.renames.iter().filter(|r| r.is_rolled_back()).count(),
            ambiguities: self.ambiguities.len(),
            idempotent: self.idempotent,
            success: self.is_success(),
            exit_code: self.exit_code(),
        };
    }

    /// Human-readable listing with the changed spans in diff style.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " (dry run)" } else { "" };
        let _ = writeln!(out, "Run {}{}", self.run_id, mode);

        for file in &self.files {
            if file.status == FileStatus::Unchanged {
                continue;
            }

            if file.path != file.original_path {
                let _ = writeln!(
                    out,
                    "\n{} -> {}: {}",
                    file.original_path,
                    file.path,
                    file.status.as_str()
                );
            } else {
                let _ = writeln!(out, "\n{}: {}", file.path, file.status.as_str());
            }

            for hit in &file.rules {
                let _ = writeln!(out, "  {} x{}", hit.rule_id, hit.occurrences);
            }
            for change in &file.changes {
                let _ = writeln!(out, "  @@ line {} [{}]", change.line, change.rule_id);
                for line in change.before.lines() {
                    let _ = writeln!(out, "  - {}", line);
                }
                for line in change.after.lines() {
                    let _ = writeln!(out, "  + {}", line);
                }
            }
            for issue in &file.issues {
                let _ = writeln!(out, "  ! {}", issue);
            }
        }

        if !self.renames.is_empty() {
            let _ = writeln!(out, "\nRenames:");
            for record in &self.renames {
                let outcome = match &record.status {
                    RenameStatus::Applied { files_updated } => {
                        format!("applied, {} files updated", files_updated)
                    }
                    RenameStatus::RolledBack { reason } => format!("rolled back: {}", reason),
                };
                let _ = writeln!(
                    out,
                    "  {} {} -> {} [{}] {}",
                    record.event.kind.as_str(),
                    record.event.old_name,
                    record.event.new_name,
                    record.event.originating_rule_id,
                    outcome
                );
            }
        }

        if !self.violations.is_empty() {
            let _ = writeln!(out, "\nIdempotency violations:");
            for v in &self.violations {
                let _ = writeln!(out, "  {} still matches {}x in {}", v.rule_id, v.remaining, v.path);
            }
        }

        if !self.persist_failures.is_empty() {
            let _ = writeln!(out, "\nWrite failures:");
            for failure in &self.persist_failures {
                let _ = writeln!(out, "  {}: {}", failure.path, failure.message);
            }
        }

        let s = &self.summary;
        let _ = writeln!(
            out,
            "\n{} files scanned, {} changed, {} renamed, {} failed; {} replacements; {} renames applied, {} rolled back; idempotent: {}",
            s.files_scanned,
            s.files_changed,
            s.files_renamed,
            s.files_failed,
            s.total_replacements,
            s.renames_applied,
            s.renames_rolled_back,
            if s.idempotent { "yes" } else { "no" }
        );

        out
    }
}
