//! Install-tree file operations: backup, staged deploy, restore.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// A parsed exclude rule.
///
/// Supported shapes: exact relative path, `dir/` and `dir/**` prefixes,
/// and glob patterns such as `*.ext`.
#[derive(Clone, Debug)]
enum Rule {
    Exact(PathBuf),
    Prefix(PathBuf),
    Glob(glob::Pattern),
}

/// Compiled exclude pattern list.
///
/// Matching paths are not taken from the new package; they survive from
/// the previous install layout instead.
#[derive(Clone, Debug, Default)]
pub(crate) struct ExcludePatterns {
    rules: Vec<Rule>,
}

impl ExcludePatterns {
    /// Compile a pattern list, warning on (and skipping) invalid globs.
    pub(crate) fn parse(patterns: &[String]) -> Self {
        let mut rules = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let rule = if let Some(prefix) = raw.strip_suffix("/**") {
                Rule::Prefix(PathBuf::from(prefix))
            } else if let Some(prefix) = raw.strip_suffix('/') {
                Rule::Prefix(PathBuf::from(prefix))
            } else if raw.chars().any(|c| matches!(c, '*' | '?' | '[')) {
                match glob::Pattern::new(raw) {
                    Ok(pattern) => Rule::Glob(pattern),
                    Err(e) => {
                        log::warn!("skipping invalid exclude pattern '{}': {}", raw, e);
                        continue;
                    }
                }
            } else {
                Rule::Exact(PathBuf::from(raw))
            };
            rules.push(rule);
        }
        Self { rules }
    }

    /// Whether a path (relative to the install root) is excluded.
    pub(crate) fn matches(&self, rel: &Path) -> bool {
        self.rules.iter().any(|rule| match rule {
            Rule::Exact(path) => rel == path,
            Rule::Prefix(prefix) => rel.starts_with(prefix),
            Rule::Glob(pattern) => pattern.matches_path(rel),
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Which side of the exclude filter to copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Keep {
    /// Regular payload: everything not excluded.
    NotExcluded,
    /// Preserved local state: only excluded entries.
    Excluded,
}

/// Recursively copy a tree, filtering by the exclude rules.
fn copy_filtered(src: &Path, dst: &Path, excludes: &ExcludePatterns, keep: Keep) -> Result<u64> {
    let mut copied = 0u64;
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk '{}'", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walked path under source root");
        if rel.as_os_str().is_empty() {
            continue;
        }

        let excluded = excludes.matches(rel);
        let wanted = match keep {
            Keep::NotExcluded => !excluded,
            Keep::Excluded => excluded,
        };
        // Directories are created on demand below; skipping one here must
        // not skip its children, which are matched on their own paths.
        if entry.file_type().is_dir() {
            continue;
        }
        if !wanted {
            continue;
        }

        let target = dst.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        if entry.file_type().is_symlink() {
            let link = std::fs::read_link(entry.path())
                .with_context(|| format!("failed to read link '{}'", entry.path().display()))?;
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("failed to link '{}'", target.display()))?;
        } else {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "failed to copy '{}' to '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
        copied += 1;
    }
    Ok(copied)
}

/// Full tree copy, no filtering.
pub(crate) fn copy_dir(src: &Path, dst: &Path) -> Result<u64> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("failed to create '{}'", dst.display()))?;
    copy_filtered(src, dst, &ExcludePatterns::default(), Keep::NotExcluded)
}

/// Snapshot the install directory before any destructive step.
///
/// A pre-existing backup for the same version is discarded first.
pub(crate) fn backup(install_dir: &Path, backup_dir: &Path) -> Result<()> {
    if backup_dir.exists() {
        std::fs::remove_dir_all(backup_dir)
            .with_context(|| format!("failed to clear '{}'", backup_dir.display()))?;
    }
    let copied = copy_dir(install_dir, backup_dir)?;
    log::info!(
        "backed up {} file(s) to '{}'",
        copied,
        backup_dir.display()
    );
    Ok(())
}

/// Stage the new tree next to the install directory.
///
/// New files land in `<install_dir>.new`; excluded entries are carried
/// over from the current install instead of the package.
pub(crate) fn stage(
    source: &Path,
    install_dir: &Path,
    excludes: &ExcludePatterns,
) -> Result<PathBuf> {
    let staged = staging_path(install_dir);
    if staged.exists() {
        std::fs::remove_dir_all(&staged)
            .with_context(|| format!("failed to clear '{}'", staged.display()))?;
    }
    std::fs::create_dir_all(&staged)
        .with_context(|| format!("failed to create '{}'", staged.display()))?;

    copy_filtered(source, &staged, excludes, Keep::NotExcluded)?;
    if !excludes.is_empty() && install_dir.exists() {
        copy_filtered(install_dir, &staged, excludes, Keep::Excluded)?;
    }
    Ok(staged)
}

/// Swap the staged tree into place.
///
/// Delete-then-rename keeps the half-replaced window down to the rename.
pub(crate) fn swap(staged: &Path, install_dir: &Path) -> Result<()> {
    if install_dir.exists() {
        std::fs::remove_dir_all(install_dir)
            .with_context(|| format!("failed to remove '{}'", install_dir.display()))?;
    }
    std::fs::rename(staged, install_dir).with_context(|| {
        format!(
            "failed to move '{}' to '{}'",
            staged.display(),
            install_dir.display()
        )
    })
}

/// Restore the install directory from a backup, by rename or copy.
pub(crate) fn restore(backup_dir: &Path, install_dir: &Path) -> Result<()> {
    if install_dir.exists() {
        std::fs::remove_dir_all(install_dir)
            .with_context(|| format!("failed to remove '{}'", install_dir.display()))?;
    }
    if std::fs::rename(backup_dir, install_dir).is_ok() {
        return Ok(());
    }
    copy_dir(backup_dir, install_dir)
        .with_context(|| format!("failed to restore from '{}'", backup_dir.display()))?;
    Ok(())
}

/// Sibling staging directory for an install path.
fn staging_path(install_dir: &Path) -> PathBuf {
    let mut name = install_dir
        .file_name()
        .unwrap_or_default()
        .to_os_string();
    name.push(".new");
    install_dir.with_file_name(name)
}
