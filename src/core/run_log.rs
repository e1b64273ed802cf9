//! Persisted run log and drift detection.
//!
//! Every non-dry run leaves its report in `<root>/.retrofit/run-log.json`.
//! The log answers "did rule X touch file Y" and, compared with the tree,
//! shows files changed outside the engine since the run.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::report::{FileStatus, RunReport};
use crate::utils::hash::content_hash;
use crate::utils::io;

const RUN_LOG_DIR: &str = ".retrofit";
const RUN_LOG_FILE: &str = "run-log.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    /// RFC 3339 timestamp.
    pub created_at: String,
    pub roots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset: Option<String>,
    pub report: RunReport,
}

impl RunLog {
    pub fn new(report: RunReport, roots: &[PathBuf], ruleset: Option<String>) -> Self {
        Self {
            run_id: report.run_id.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            roots: roots.iter().map(|r| r.display().to_string()).collect(),
            ruleset,
            report,
        }
    }

    pub fn touched(&self, rule_id: &str, path: &str) -> bool {
        self.report.touched(rule_id, path)
    }

    fn disk_path(&self, key: &str) -> Option<PathBuf> {
        match self.roots.as_slice() {
            [single] => Some(Path::new(single).join(key)),
            roots => {
                let (head, rest) = key.split_once('/')?;
                roots
                    .iter()
                    .map(Path::new)
                    .find(|r| r.file_name().is_some_and(|n| n.to_string_lossy() == head))
                    .map(|r| r.join(rest))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    Modified,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftEntry {
    pub path: String,
    pub kind: DriftKind,
    pub expected_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_hash: Option<String>,
}

/// Location of the run log for a root directory.
pub fn run_log_path(root: &Path) -> PathBuf {
    root.join(RUN_LOG_DIR).join(RUN_LOG_FILE)
}

pub fn save(log: &RunLog, root: &Path) -> Result<PathBuf> {
    let path = run_log_path(root);
    let json = serde_json::to_string_pretty(log)
        .map_err(|e| Error::internal_json(e.to_string(), Some("serialize run log".to_string())))?;
    io::write_file_atomic(&path, &json, "write run log")?;
    Ok(path)
}

pub fn load(root: &Path) -> Result<RunLog> {
    let path = run_log_path(root);
    if !path.exists() {
        return Err(Error::run_log_not_found(path.display().to_string()));
    }

    let content = io::read_file(&path, "read run log")?;
    serde_json::from_str(&content).map_err(|e| {
        Error::config_invalid_file(path.display().to_string(), "json", e.to_string())
    })
}

/// Files whose on-disk content no longer matches what the run left behind.
pub fn detect_drift(log: &RunLog) -> Vec<DriftEntry> {
    let mut drift = Vec::new();

    for file in &log.report.files {
        // A file that failed to write still holds its pre-run content.
        let (path, expected) = if file.status == FileStatus::UntouchedDueToError {
            (&file.original_path, &file.pre_hash)
        } else {
            (&file.path, &file.post_hash)
        };

        let Some(disk) = log.disk_path(path) else {
            continue;
        };

        match fs::read(&disk) {
            Ok(bytes) => {
                let actual = content_hash(&String::from_utf8_lossy(&bytes));
                if &actual != expected {
                    drift.push(DriftEntry {
                        path: path.clone(),
                        kind: DriftKind::Modified,
                        expected_hash: expected.clone(),
                        actual_hash: Some(actual),
                    });
                }
            }
            Err(_) => drift.push(DriftEntry {
                path: path.clone(),
                kind: DriftKind::Missing,
                expected_hash: expected.clone(),
                actual_hash: None,
            }),
        }
    }

    drift
}
