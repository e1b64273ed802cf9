use std::fmt::Write as _;

use clap::{Args, ValueEnum};
use serde::Serialize;

use retrofit::report::{FileReport, IdempotencyViolation, RenameRecord, RunSummary};
use retrofit::run_log::{self, DriftEntry, DriftKind};

use super::{expand_path, CmdResult};

#[derive(Args)]
pub struct ReportArgs {
    /// Root directory the run was made against
    #[arg(long, default_value = ".")]
    pub root: String,

    /// Output format
    #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
    pub format: ReportFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Json,
    Text,
}

#[derive(Serialize)]
#[serde(tag = "command")]
pub enum ReportOutput {
    #[serde(rename = "report")]
    Report {
        run_id: String,
        created_at: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ruleset: Option<String>,
        summary: RunSummary,
        files: Vec<FileReport>,
        renames: Vec<RenameRecord>,
        violations: Vec<IdempotencyViolation>,
        drift: Vec<DriftEntry>,
    },
}

pub fn run(args: ReportArgs) -> CmdResult<ReportOutput> {
    let root = expand_path(&args.root);
    let log = run_log::load(&root)?;
    let drift = run_log::detect_drift(&log);
    let report = log.report;

    Ok((
        ReportOutput::Report {
            run_id: log.run_id,
            created_at: log.created_at,
            ruleset: log.ruleset,
            summary: report.summary,
            files: report.files,
            renames: report.renames,
            violations: report.violations,
            drift,
        },
        0,
    ))
}

pub fn run_text(args: ReportArgs) -> retrofit::Result<(String, i32)> {
    let root = expand_path(&args.root);
    let log = run_log::load(&root)?;
    let drift = run_log::detect_drift(&log);

    let mut out = format!("Logged {}\n", log.created_at);
    if let Some(ruleset) = &log.ruleset {
        let _ = writeln!(out, "Ruleset {}", ruleset);
    }
    out.push_str(&log.report.render_text());

    if !drift.is_empty() {
        let _ = writeln!(out, "\nDrift since this run:");
        for entry in &drift {
            let what = match entry.kind {
                DriftKind::Modified => "modified",
                DriftKind::Missing => "missing",
            };
            let _ = writeln!(out, "  {}: {}", entry.path, what);
        }
    }

    Ok((out, 0))
}
