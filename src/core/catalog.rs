//! File catalog: the only owner of file content during a run.
//!
//! Files are keyed by their path relative to the root, with `/` separators.
//! With several roots, each key is prefixed with the root's directory name.
//! Nothing touches the disk between `load` and `persist`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use glob_match::glob_match;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::log_status;
use crate::utils::hash::content_hash;
use crate::utils::io;

/// Directories to always skip at any depth (dependency/VCS/state directories).
const ALWAYS_SKIP_DIRS: &[&str] = &[".git", ".svn", ".hg", "node_modules", "vendor", ".retrofit"];

/// Directories to skip only at the root level (build output directories).
const ROOT_ONLY_SKIP_DIRS: &[&str] = &["build", "dist", "target"];

// ============================================================================
// SourceFile
// ============================================================================

#[derive(Debug, Clone)]
pub struct SourceFile {
    path: String,
    prior_paths: Vec<String>,
    content: String,
    content_hash: String,
    loaded_hash: String,
    original_path: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = normalize(&path.into());
        let content = content.into();
        let hash = content_hash(&content);
        Self {
            original_path: path.clone(),
            path,
            prior_paths: Vec::new(),
            content,
            content_hash: hash.clone(),
            loaded_hash: hash,
        }
    }

    /// Current path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Paths this file occupied earlier in the run, oldest first.
    pub fn prior_paths(&self) -> &[String] {
        &self.prior_paths
    }

    /// Path at load time.
    pub fn original_path(&self) -> &str {
        &self.original_path
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn loaded_hash(&self) -> &str {
        &self.loaded_hash
    }

    pub fn is_changed(&self) -> bool {
        self.content_hash != self.loaded_hash
    }

    pub fn is_renamed(&self) -> bool {
        self.path != self.original_path
    }

    pub(crate) fn set_content(&mut self, content: String) {
        if content != self.content {
            self.content_hash = content_hash(&content);
            self.content = content;
        }
    }

    fn move_to(&mut self, new_path: String) {
        let old = std::mem::replace(&mut self.path, new_path);
        self.prior_paths.push(old);
    }
}

/// Normalize a path-like name to catalog key form.
pub fn normalize(name: &str) -> String {
    let unified = name.replace('\\', "/");
    unified.trim_start_matches("./").to_string()
}

fn same_path_ignoring_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

// ============================================================================
// Persist results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PersistFailure {
    /// Original path of the file that could not be written.
    pub path: String,
    pub error: Error,
}

#[derive(Debug, Clone, Default)]
pub struct PersistSummary {
    pub written: Vec<String>,
    pub renamed: Vec<(String, String)>,
    pub failures: Vec<PersistFailure>,
}

// ============================================================================
// FileCatalog
// ============================================================================

#[derive(Debug, Clone)]
struct Root {
    dir: PathBuf,
    label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileCatalog {
    roots: Vec<Root>,
    files: Vec<SourceFile>,
    skipped: Vec<SkippedFile>,
}

impl FileCatalog {
    /// Walk `roots`, keeping files that match an include glob (all files when
    /// none are given) and no exclude glob. Globs are matched against the
    /// path relative to its root.
    pub fn load(roots: &[PathBuf], include: &[String], exclude: &[String]) -> Result<Self> {
        if roots.is_empty() {
            return Err(Error::validation_invalid_argument(
                "root",
                "At least one root directory is required",
            ));
        }

        let multi = roots.len() > 1;
        let mut catalog = FileCatalog {
            roots: Vec::new(),
            files: Vec::new(),
            skipped: Vec::new(),
        };

        for (index, dir) in roots.iter().enumerate() {
            if !dir.is_dir() {
                return Err(Error::validation_invalid_argument(
                    "root",
                    format!("Not a directory: {}", dir.display()),
                ));
            }

            let label = if multi {
                let name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| format!("root{}", index));
                if catalog.roots.iter().any(|r| r.label.as_deref() == Some(&name)) {
                    return Err(Error::validation_invalid_argument(
                        "root",
                        format!("Two roots share the directory name '{}'", name),
                    ));
                }
                Some(name)
            } else {
                None
            };

            let mut paths = Vec::new();
            walk_recursive(dir, dir, &mut paths);

            for path in paths {
                let relative = path
                    .strip_prefix(dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");

                if !include.is_empty() && !include.iter().any(|g| glob_match(g, &relative)) {
                    continue;
                }
                if exclude.iter().any(|g| glob_match(g, &relative)) {
                    continue;
                }

                let key = match &label {
                    Some(l) => format!("{}/{}", l, relative),
                    None => relative,
                };

                let bytes = match fs::read(&path) {
                    Ok(b) => b,
                    Err(e) => {
                        catalog.skip(key, e.to_string());
                        continue;
                    }
                };

                match String::from_utf8(bytes) {
                    Ok(content) => catalog.files.push(SourceFile::new(key, content)),
                    Err(_) => catalog.skip(key, "not valid UTF-8".to_string()),
                }
            }

            catalog.roots.push(Root {
                dir: dir.clone(),
                label,
            });
        }

        catalog.files.sort_by(|a, b| a.path.cmp(&b.path));
        log_status!(
            "catalog",
            "Loaded {} files ({} skipped)",
            catalog.files.len(),
            catalog.skipped.len()
        );

        Ok(catalog)
    }

    /// Catalog over in-memory files rooted at `root`. Nothing is read from disk.
    pub fn from_files(root: impl Into<PathBuf>, files: Vec<SourceFile>) -> Self {
        let mut files = files;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        FileCatalog {
            roots: vec![Root {
                dir: root.into(),
                label: None,
            }],
            files,
            skipped: Vec::new(),
        }
    }

    fn skip(&mut self, path: String, reason: String) {
        log_status!("catalog", "Skipping {}: {}", path, reason);
        self.skipped.push(SkippedFile { path, reason });
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn skipped(&self) -> &[SkippedFile] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Current paths in enumeration order.
    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Look a file up by current path, then by any prior path, then by
    /// current path ignoring case.
    pub fn resolve(&self, name: &str) -> Option<&SourceFile> {
        self.resolve_index(name).map(|i| &self.files[i])
    }

    pub(crate) fn resolve_index(&self, name: &str) -> Option<usize> {
        let name = normalize(name);
        self.files
            .iter()
            .position(|f| f.path == name)
            .or_else(|| {
                self.files
                    .iter()
                    .position(|f| f.prior_paths.iter().any(|p| *p == name))
            })
            .or_else(|| {
                self.files
                    .iter()
                    .position(|f| same_path_ignoring_case(&f.path, &name))
            })
    }

    /// Look a file up by the path it had at load time.
    pub fn by_original(&self, original: &str) -> Option<&SourceFile> {
        self.files.iter().find(|f| f.original_path == original)
    }

    pub(crate) fn by_original_mut(&mut self, original: &str) -> Option<&mut SourceFile> {
        self.files.iter_mut().find(|f| f.original_path == original)
    }

    pub(crate) fn files_mut(&mut self) -> &mut [SourceFile] {
        &mut self.files
    }

    /// Disk location of a catalog key.
    pub fn disk_path(&self, key: &str) -> Option<PathBuf> {
        match self.roots.as_slice() {
            [single] if single.label.is_none() => Some(single.dir.join(key)),
            roots => {
                let (head, rest) = key.split_once('/')?;
                roots
                    .iter()
                    .find(|r| r.label.as_deref() == Some(head))
                    .map(|r| r.dir.join(rest))
            }
        }
    }

    /// Move a file to `new_path` within the catalog.
    ///
    /// Fails with a rename collision when another file already holds the new
    /// path, or when the new path exists on disk and is not a location this
    /// catalog loaded. A rename that only changes case is allowed.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let index = self.resolve_index(old).ok_or_else(|| {
            Error::validation_invalid_argument("rename", format!("No catalog file named '{}'", old))
        })?;
        let new = normalize(new);

        if self.files[index].path == new {
            return Ok(());
        }

        if let Some(other) = self
            .files
            .iter()
            .enumerate()
            .find(|(i, f)| *i != index && same_path_ignoring_case(&f.path, &new))
        {
            return Err(Error::rename_collision(
                "file",
                self.files[index].path.clone(),
                new,
                other.1.path.clone(),
            ));
        }

        let disk = self.disk_path(&new).ok_or_else(|| {
            Error::validation_invalid_argument(
                "rename",
                format!("'{}' is not inside any root", new),
            )
        })?;

        if disk.exists()
            && !self
                .files
                .iter()
                .any(|f| same_path_ignoring_case(&f.original_path, &new))
        {
            return Err(Error::rename_collision(
                "file",
                self.files[index].path.clone(),
                new.clone(),
                disk.display().to_string(),
            ));
        }

        self.files[index].move_to(new);
        Ok(())
    }

    /// Write every changed or renamed file.
    ///
    /// Every file about to be written is first checked against its on-disk
    /// bytes; a file modified since load is not overwritten. Each write is
    /// retried once.
    pub fn persist(&self) -> PersistSummary {
        self.persist_except(&HashSet::new())
    }

    /// `persist`, leaving out the files whose original path is in `held`.
    pub fn persist_except(&self, held: &HashSet<String>) -> PersistSummary {
        let mut summary = PersistSummary::default();

        let pending: Vec<&SourceFile> = self
            .files
            .iter()
            .filter(|f| !held.contains(&f.original_path))
            .filter(|f| f.is_changed() || f.is_renamed())
            .collect();

        let mut ready = Vec::new();
        for file in pending {
            match self.check_unmodified(file) {
                Ok(()) => ready.push(file),
                Err(error) => {
                    log_status!("persist", "Not writing {}: {}", file.original_path, error);
                    summary.failures.push(PersistFailure {
                        path: file.original_path.clone(),
                        error,
                    });
                }
            }
        }

        for file in ready {
            match self.write_one(file) {
                Ok(()) => {
                    if file.is_renamed() {
                        summary
                            .renamed
                            .push((file.original_path.clone(), file.path.clone()));
                    }
                    summary.written.push(file.path.clone());
                }
                Err(error) => {
                    log_status!("persist", "Failed to write {}: {}", file.path, error);
                    summary.failures.push(PersistFailure {
                        path: file.original_path.clone(),
                        error,
                    });
                }
            }
        }

        log_status!(
            "persist",
            "Wrote {} files, {} renamed, {} failed",
            summary.written.len(),
            summary.renamed.len(),
            summary.failures.len()
        );

        summary
    }

    fn check_unmodified(&self, file: &SourceFile) -> Result<()> {
        let disk = self.original_disk_path(file)?;
        let current = fs::read(&disk)
            .map_err(|e| Error::persist_failed(file.original_path.clone(), e.to_string(), 0))?;

        if content_hash(&String::from_utf8_lossy(&current)) != file.loaded_hash {
            return Err(Error::persist_failed(
                file.original_path.clone(),
                "file changed on disk since it was loaded",
                0,
            ));
        }

        Ok(())
    }

    fn original_disk_path(&self, file: &SourceFile) -> Result<PathBuf> {
        self.disk_path(&file.original_path)
            .ok_or_else(|| Error::persist_failed(file.original_path.clone(), "no root for path", 0))
    }

    fn write_one(&self, file: &SourceFile) -> Result<()> {
        let target = self
            .disk_path(&file.path)
            .ok_or_else(|| Error::persist_failed(file.path.clone(), "no root for path", 0))?;

        if file.is_renamed() && same_path_ignoring_case(&file.path, &file.original_path) {
            // Case-only rename: move the entry first so the old name is not
            // left behind on case-sensitive filesystems.
            let source = self.original_disk_path(file)?;
            fs::rename(&source, &target)
                .map_err(|e| Error::persist_failed(file.path.clone(), e.to_string(), 1))?;
        }

        write_with_retry(&target, &file.content, &file.path)?;

        if file.is_renamed() && !same_path_ignoring_case(&file.path, &file.original_path) {
            let vacated_by_all = !self
                .files
                .iter()
                .any(|f| same_path_ignoring_case(&f.path, &file.original_path));
            if vacated_by_all {
                let source = self.original_disk_path(file)?;
                io::remove_file(&source, &format!("remove {}", file.original_path)).map_err(
                    |e| Error::persist_failed(file.original_path.clone(), e.message, 1),
                )?;
            }
        }

        Ok(())
    }
}

fn write_with_retry(path: &Path, content: &str, label: &str) -> Result<()> {
    let operation = format!("write {}", label);
    match io::write_file_atomic(path, content, &operation) {
        Ok(()) => Ok(()),
        Err(first) => {
            log_status!("persist", "Retrying {}: {}", label, first.message);
            io::write_file_atomic(path, content, &operation).map_err(|e| {
                let detail = e.details["error"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or(e.message);
                Error::persist_failed(label, detail, 2)
            })
        }
    }
}

// ============================================================================
// File walking
// ============================================================================

fn walk_recursive(dir: &Path, root: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    let is_root = dir == root;

    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            continue;
        }

        let path = entry.path();
        if file_type.is_dir() {
            let name = entry.file_name().to_string_lossy().to_string();
            if ALWAYS_SKIP_DIRS.contains(&name.as_str()) {
                continue;
            }
            if is_root && ROOT_ONLY_SKIP_DIRS.contains(&name.as_str()) {
                continue;
            }
            walk_recursive(&path, root, files);
        } else if file_type.is_file() {
            files.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    #[test]
    fn load_is_lexicographic_and_skips_vendor_dirs() {
        let dir = tree(&[
            ("lib/b.dart", "b"),
            ("lib/a.dart", "a"),
            ("node_modules/x.js", "x"),
            ("lib/build/keep.dart", "k"),
            ("build/out.dart", "o"),
            (".retrofit/run-log.json", "{}"),
        ]);

        let catalog = FileCatalog::load(&[dir.path().to_path_buf()], &[], &[]).unwrap();
        assert_eq!(
            catalog.paths(),
            vec!["lib/a.dart", "lib/b.dart", "lib/build/keep.dart"]
        );
    }

    #[test]
    fn include_and_exclude_globs() {
        let dir = tree(&[
            ("lib/a.dart", ""),
            ("lib/a.g.dart", ""),
            ("README.md", ""),
        ]);

        let catalog = FileCatalog::load(
            &[dir.path().to_path_buf()],
            &["**/*.dart".to_string()],
            &["**/*.g.dart".to_string()],
        )
        .unwrap();
        assert_eq!(catalog.paths(), vec!["lib/a.dart"]);
    }

    #[test]
    fn non_utf8_files_are_skipped_and_listed() {
        let dir = tree(&[("a.txt", "ok")]);
        fs::write(dir.path().join("b.bin"), [0xff, 0xfe, 0x00]).unwrap();

        let catalog = FileCatalog::load(&[dir.path().to_path_buf()], &[], &[]).unwrap();
        assert_eq!(catalog.paths(), vec!["a.txt"]);
        assert_eq!(catalog.skipped()[0].path, "b.bin");
    }

    #[test]
    fn multiple_roots_are_prefixed() {
        let one = tree(&[("a.txt", "")]);
        let two = tree(&[("b.txt", "")]);
        let roots = vec![one.path().to_path_buf(), two.path().to_path_buf()];

        let catalog = FileCatalog::load(&roots, &[], &[]).unwrap();
        let one_name = one.path().file_name().unwrap().to_string_lossy().to_string();
        let key = format!("{}/a.txt", one_name);
        assert!(catalog.resolve(&key).is_some());
        assert_eq!(catalog.disk_path(&key).unwrap(), one.path().join("a.txt"));
    }

    #[test]
    fn resolve_by_prior_path_and_case() {
        let mut catalog = FileCatalog::from_files(
            "/nonexistent",
            vec![SourceFile::new("lib/GlobalDB.dart", "x")],
        );
        catalog.rename("lib/GlobalDB.dart", "lib/db/global.dart").unwrap();

        assert_eq!(catalog.resolve("lib/GlobalDB.dart").unwrap().path(), "lib/db/global.dart");
        assert!(catalog.resolve("LIB/DB/GLOBAL.DART").is_some());
        assert!(catalog.resolve(".\\lib\\db\\global.dart").is_some());
        assert_eq!(catalog.files()[0].prior_paths(), ["lib/GlobalDB.dart"]);
    }

    #[test]
    fn rename_onto_another_file_collides() {
        let mut catalog = FileCatalog::from_files(
            "/nonexistent",
            vec![SourceFile::new("P.ext", "p"), SourceFile::new("R.ext", "r")],
        );
        catalog.rename("P.ext", "Q.ext").unwrap();
        let err = catalog.rename("R.ext", "Q.ext").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::RenameCollision);
        assert_eq!(catalog.resolve("R.ext").unwrap().path(), "R.ext");
    }

    #[test]
    fn rename_onto_untracked_disk_file_collides() {
        let dir = tree(&[("a.txt", "a"), ("ignored.bin", "")]);
        let mut catalog =
            FileCatalog::load(&[dir.path().to_path_buf()], &["*.txt".to_string()], &[]).unwrap();
        assert!(catalog.rename("a.txt", "ignored.bin").is_err());
    }

    #[test]
    fn case_only_rename_is_allowed() {
        let dir = tree(&[("GlobalDB.dart", "x")]);
        let mut catalog = FileCatalog::load(&[dir.path().to_path_buf()], &[], &[]).unwrap();
        catalog.rename("GlobalDB.dart", "global_db.dart").unwrap();

        let summary = catalog.persist();
        assert!(summary.failures.is_empty());
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["global_db.dart"]);
    }

    #[test]
    fn persist_writes_only_changed_files() {
        let dir = tree(&[("a.txt", "old"), ("b.txt", "same")]);
        let mut catalog = FileCatalog::load(&[dir.path().to_path_buf()], &[], &[]).unwrap();
        catalog.files_mut()[0].set_content("new".to_string());
        catalog.files_mut()[1].set_content("same".to_string());

        let summary = catalog.persist();
        assert_eq!(summary.written, vec!["a.txt"]);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new");
    }

    #[test]
    fn persist_moves_renamed_files_and_creates_dirs() {
        let dir = tree(&[("lib/old.dart", "content")]);
        let mut catalog = FileCatalog::load(&[dir.path().to_path_buf()], &[], &[]).unwrap();
        catalog.rename("lib/old.dart", "lib/nested/new.dart").unwrap();

        let summary = catalog.persist();
        assert_eq!(summary.renamed.len(), 1);
        assert!(!dir.path().join("lib/old.dart").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("lib/nested/new.dart")).unwrap(),
            "content"
        );
    }

    #[test]
    fn persist_except_leaves_held_files_alone() {
        let dir = tree(&[("a.txt", "a"), ("b.txt", "b")]);
        let mut catalog = FileCatalog::load(&[dir.path().to_path_buf()], &[], &[]).unwrap();
        catalog.files_mut()[0].set_content("a2".to_string());
        catalog.files_mut()[1].set_content("b2".to_string());

        let held: HashSet<String> = ["a.txt".to_string()].into_iter().collect();
        let summary = catalog.persist_except(&held);

        assert_eq!(summary.written, vec!["b.txt"]);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dir.path().join("b.txt")).unwrap(), "b2");
    }

    #[test]
    fn persist_refuses_files_modified_since_load() {
        let dir = tree(&[("a.txt", "old")]);
        let mut catalog = FileCatalog::load(&[dir.path().to_path_buf()], &[], &[]).unwrap();
        catalog.files_mut()[0].set_content("ours".to_string());
        fs::write(dir.path().join("a.txt"), "theirs").unwrap();

        let summary = catalog.persist();
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].error.code, crate::error::ErrorCode::PersistFailed);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "theirs");
    }
}
