//! Reference fixup: carry a rename to every reference in the catalog.
//!
//! File renames move the file inside the catalog, then rewrite references to
//! the old path found in string literals, `#include <...>` style regions,
//! and bare occurrences of the full old path. Identifier renames rewrite every
//! word-bounded occurrence of the old identifier.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::FileCatalog;
use crate::error::{Error, Result};
use crate::log_status;
use crate::matcher::{find_matches, is_ident_char, line_of, literal_regions, word_bounded};
use crate::report::ChangedSpan;
use crate::rules::Matcher;

static ANGLE_INCLUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#\s*(?:include|import)\s*<([^>\n]+)>").unwrap()
});

static SCHEME_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:(?:[^/\\:]+[/\\])?").unwrap()
});

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenameKind {
    File,
    Identifier,
}

impl RenameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenameKind::File => "file",
            RenameKind::Identifier => "identifier",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameEvent {
    pub old_name: String,
    pub new_name: String,
    pub kind: RenameKind,
    pub originating_rule_id: String,
}

impl RenameEvent {
    pub fn file(old: impl Into<String>, new: impl Into<String>, rule_id: &str) -> Self {
        Self {
            old_name: old.into(),
            new_name: new.into(),
            kind: RenameKind::File,
            originating_rule_id: rule_id.to_string(),
        }
    }

    pub fn identifier(old: impl Into<String>, new: impl Into<String>, rule_id: &str) -> Self {
        Self {
            old_name: old.into(),
            new_name: new.into(),
            kind: RenameKind::Identifier,
            originating_rule_id: rule_id.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TouchedFile {
    /// Path at load time, the stable key for reporting.
    pub original_path: String,
    pub occurrences: usize,
    pub changes: Vec<ChangedSpan>,
}

#[derive(Debug, Clone, Default)]
pub struct FixupResult {
    pub touched: Vec<TouchedFile>,
}

impl FixupResult {
    pub fn files_updated(&self) -> usize {
        self.touched.len()
    }

    pub fn occurrences(&self) -> usize {
        self.touched.iter().map(|t| t.occurrences).sum()
    }
}

struct Rewrite {
    start: usize,
    end: usize,
    after: String,
}

// ============================================================================
// Entry points
// ============================================================================

/// Fail if applying `event` would merge two distinct entities.
///
/// `claimed` holds new names already taken by other events that are about
/// to be applied alongside this one.
pub fn check_collision(
    event: &RenameEvent,
    catalog: &FileCatalog,
    claimed: &HashSet<String>,
) -> Result<()> {
    if claimed.contains(&event.new_name) {
        return Err(Error::rename_collision(
            event.kind.as_str(),
            &event.old_name,
            &event.new_name,
            "another rename in the same run",
        ));
    }

    match event.kind {
        RenameKind::File => Ok(()),
        RenameKind::Identifier => {
            let matcher = identifier_matcher(event)?;
            for file in catalog.files() {
                if !find_matches(file.content(), &matcher, &event.originating_rule_id)
                    .spans
                    .is_empty()
                {
                    return Err(Error::rename_collision(
                        "identifier",
                        &event.old_name,
                        &event.new_name,
                        file.path(),
                    ));
                }
            }
            Ok(())
        }
    }
}

/// Apply one rename event to the catalog and rewrite every reference.
///
/// A file rename that collides leaves the catalog untouched.
pub fn apply(event: &RenameEvent, catalog: &mut FileCatalog) -> Result<FixupResult> {
    match event.kind {
        RenameKind::File => apply_file(event, catalog),
        RenameKind::Identifier => {
            check_collision(event, catalog, &HashSet::new())?;
            apply_identifier(event, catalog)
        }
    }
}

/// Apply an identifier event that already passed `check_collision` against
/// the catalog as it stood before its own edits were committed.
pub(crate) fn carry(event: &RenameEvent, catalog: &mut FileCatalog) -> Result<FixupResult> {
    match event.kind {
        RenameKind::File => apply_file(event, catalog),
        RenameKind::Identifier => apply_identifier(event, catalog),
    }
}

fn identifier_matcher(event: &RenameEvent) -> Result<Matcher> {
    Matcher::identifier(&event.new_name).map_err(|e| {
        Error::rule_invalid(&event.originating_rule_id, format!("bad identifier: {}", e))
    })
}

// ============================================================================
// Identifier renames
// ============================================================================

fn apply_identifier(event: &RenameEvent, catalog: &mut FileCatalog) -> Result<FixupResult> {
    let matcher = Matcher::identifier(&event.old_name).map_err(|e| {
        Error::rule_invalid(&event.originating_rule_id, format!("bad identifier: {}", e))
    })?;

    let mut result = FixupResult::default();

    for file in catalog.files_mut() {
        let outcome = find_matches(file.content(), &matcher, &event.originating_rule_id);
        if outcome.spans.is_empty() {
            continue;
        }

        let rewrites: Vec<Rewrite> = outcome
            .spans
            .iter()
            .map(|s| Rewrite {
                start: s.start,
                end: s.end,
                after: event.new_name.clone(),
            })
            .collect();

        let (content, changes) = splice(file.content(), &rewrites, &event.originating_rule_id);
        result.touched.push(TouchedFile {
            original_path: file.original_path().to_string(),
            occurrences: changes.len(),
            changes,
        });
        file.set_content(content);
    }

    log_status!(
        "fixup",
        "{} -> {}: {} occurrences in {} files",
        event.old_name,
        event.new_name,
        result.occurrences(),
        result.files_updated()
    );

    Ok(result)
}

// ============================================================================
// File renames
// ============================================================================

fn apply_file(event: &RenameEvent, catalog: &mut FileCatalog) -> Result<FixupResult> {
    catalog.rename(&event.old_name, &event.new_name)?;

    let old = event.old_name.as_str();
    let new = event.new_name.as_str();
    let others: Vec<String> = catalog
        .paths()
        .into_iter()
        .filter(|p| p != new)
        .collect();

    let mut planned = Vec::new();
    for file in catalog.files() {
        let rewrites = file_references(file.content(), file.path(), old, new, &others);
        if !rewrites.is_empty() {
            planned.push((file.original_path().to_string(), rewrites));
        }
    }

    let mut result = FixupResult::default();
    for (original, rewrites) in planned {
        let Some(file) = catalog.by_original_mut(&original) else {
            continue;
        };
        let (content, changes) = splice(file.content(), &rewrites, &event.originating_rule_id);
        result.touched.push(TouchedFile {
            original_path: original,
            occurrences: changes.len(),
            changes,
        });
        file.set_content(content);
    }

    log_status!(
        "fixup",
        "{} -> {}: {} references in {} files",
        old,
        new,
        result.occurrences(),
        result.files_updated()
    );

    Ok(result)
}

/// Every rewrite needed in one file for a move from `old` to `new`.
fn file_references(
    content: &str,
    referencing: &str,
    old: &str,
    new: &str,
    others: &[String],
) -> Vec<Rewrite> {
    let mut rewrites = Vec::new();
    let literals = literal_regions(content);

    let mut regions: Vec<(usize, usize)> = literals
        .iter()
        .filter(|r| r.terminated)
        .map(|r| (r.start, r.end))
        .collect();
    regions.extend(
        ANGLE_INCLUDE
            .captures_iter(content)
            .filter_map(|c| c.get(1))
            .map(|m| (m.start(), m.end())),
    );

    for &(start, end) in &regions {
        if let Some(after) = rewrite_reference(&content[start..end], referencing, old, new, others) {
            rewrites.push(Rewrite { start, end, after });
        }
    }

    // Bare occurrences of the full path outside reference regions.
    let pattern = old
        .split('/')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"[/\\]");
    let Ok(bare) = Regex::new(&format!("(?i){}", pattern)) else {
        return rewrites;
    };

    for m in bare.find_iter(content) {
        let (start, end) = (m.start(), m.end());
        let inside_region = regions.iter().any(|&(s, e)| s <= start && start < e);
        if inside_region || !path_bounded(content, start, end) {
            continue;
        }
        let after = with_separator_style(new, m.as_str());
        if after != m.as_str() {
            rewrites.push(Rewrite { start, end, after });
        }
    }

    rewrites.sort_by_key(|r| r.start);
    rewrites
}

/// Rewrite one reference body that names `old`, or `None` if it does not.
fn rewrite_reference(
    body: &str,
    referencing: &str,
    old: &str,
    new: &str,
    others: &[String],
) -> Option<String> {
    if body.is_empty() || body.contains('\n') {
        return None;
    }

    let unified = body.replace('\\', "/");
    let dir = parent_dir(referencing);

    // Explicitly relative: resolve against the referencing file.
    if unified.starts_with("./") || unified.starts_with("../") {
        let resolved = join_normalized(dir, &unified)?;
        if !same_ignoring_case(&resolved, old) {
            return None;
        }
        let mut relative = relative_between(dir, new);
        if unified.starts_with("./") && !relative.starts_with("../") {
            relative = format!("./{}", relative);
        }
        return Some(with_separator_style(&relative, body));
    }

    let prefix_len = SCHEME_PREFIX
        .find(&unified)
        .map(|m| m.end())
        .or_else(|| unified.starts_with('/').then_some(1))
        .unwrap_or(0);
    let (prefix, rest) = unified.split_at(prefix_len);

    // Bare relative body: only a reference if it does not resolve to
    // some other file next to the referencing one.
    if prefix.is_empty() {
        if let Some(resolved) = join_normalized(dir, rest) {
            if same_ignoring_case(&resolved, old) {
                let relative = relative_between(dir, new);
                return Some(with_separator_style(&relative, body));
            }
            if others.iter().any(|o| same_ignoring_case(o, &resolved)) {
                return None;
            }
        }
    }

    if !is_segment_suffix(old, rest) {
        return None;
    }
    if others.iter().any(|o| is_segment_suffix(o, rest)) {
        return None;
    }

    let covered = &old[..old.len() - rest.len()];
    // `get` is None when the cut lands inside a multi-byte character.
    new.get(..covered.len())
        .filter(|head| same_ignoring_case(head, covered))?;

    let rewritten = format!("{}{}", &body[..prefix.len()], &new[covered.len()..]);
    Some(with_separator_style(&rewritten, body))
}

// ============================================================================
// Path helpers
// ============================================================================

fn same_ignoring_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// `rest` names `path` or a trailing run of its segments.
fn is_segment_suffix(path: &str, rest: &str) -> bool {
    if rest.is_empty() || rest.len() > path.len() {
        return false;
    }
    let split = path.len() - rest.len();
    if !path.is_char_boundary(split) || !same_ignoring_case(&path[split..], rest) {
        return false;
    }
    split == 0 || path[..split].ends_with('/')
}

/// Join and collapse `.` and `..`; `None` if the result escapes the root.
fn join_normalized(dir: &str, relative: &str) -> Option<String> {
    let mut segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }
    Some(segments.join("/"))
}

fn relative_between(from_dir: &str, to: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    let target: Vec<&str> = to.split('/').collect();

    let common = from
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count()
        .min(target.len().saturating_sub(1));

    let mut parts: Vec<&str> = vec![".."; from.len() - common];
    parts.extend_from_slice(&target[common..]);
    parts.join("/")
}

fn with_separator_style(path: &str, original: &str) -> String {
    if original.contains('\\') && !original.contains('/') {
        path.replace('/', "\\")
    } else {
        path.to_string()
    }
}

fn path_bounded(content: &str, start: usize, end: usize) -> bool {
    let before_ok = !content[..start]
        .chars()
        .next_back()
        .is_some_and(|c| is_ident_char(c) || matches!(c, '/' | '\\' | '.' | '-'));

    let mut after = content[end..].chars();
    let after_ok = match after.next() {
        None => true,
        Some(c) if is_ident_char(c) || matches!(c, '/' | '\\' | '-') => false,
        Some('.') => !after.next().is_some_and(is_ident_char),
        Some(_) => true,
    };

    before_ok && after_ok && word_bounded(content, start, end)
}

// ============================================================================
// Splicing
// ============================================================================

fn splice(content: &str, rewrites: &[Rewrite], rule_id: &str) -> (String, Vec<ChangedSpan>) {
    let mut out = String::with_capacity(content.len());
    let mut changes = Vec::new();
    let mut cursor = 0;

    for rewrite in rewrites {
        if rewrite.start < cursor {
            continue;
        }
        out.push_str(&content[cursor..rewrite.start]);
        out.push_str(&rewrite.after);
        changes.push(ChangedSpan {
            rule_id: rule_id.to_string(),
            line: line_of(content, rewrite.start),
            before: content[rewrite.start..rewrite.end].to_string(),
            after: rewrite.after.clone(),
        });
        cursor = rewrite.end;
    }

    out.push_str(&content[cursor..]);
    (out, changes)
}
