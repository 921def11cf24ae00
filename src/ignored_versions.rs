//! Persistent set of update versions to skip.
//!
//! Failed updates are recorded here (by the orchestrator, or by the updater
//! on rollback) so the same broken version is never attempted twice.
//! Membership is monotonic within a deployment; clearing the file is an
//! external, manual operation.

use crate::utils;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File location, relative to the data directory.
static IGNORED_VERSIONS_PATH: &str = "ignored_versions.json";

/// Store for the persisted set of ignored version strings.
///
/// Single-writer by construction: the agent-side orchestrator and the
/// updater never run at the same time, and in-process access goes through
/// one mutex.
#[derive(Debug)]
pub(crate) struct IgnoredVersions {
    path: PathBuf,
    versions: Mutex<BTreeSet<String>>,
}

impl IgnoredVersions {
    /// Load the store from the given data directory.
    ///
    /// A missing file is an empty set; a malformed file is an error, not a
    /// silent reset, so a corrupt store never re-enables broken updates.
    pub(crate) fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(IGNORED_VERSIONS_PATH);
        let versions = match std::fs::read(&path) {
            Ok(content) => serde_json::from_slice(&content)
                .with_context(|| format!("failed to parse '{}'", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read '{}'", path.display()))
            }
        };

        Ok(Self {
            path,
            versions: Mutex::new(versions),
        })
    }

    /// Whether the given version is ignored.
    pub(crate) fn contains(&self, version: &str) -> bool {
        self.versions
            .lock()
            .expect("poisoned ignored-versions set")
            .contains(version)
    }

    /// Record a version as ignored and persist the set.
    ///
    /// Adding an already-present version is a no-op.
    pub(crate) fn add(&self, version: &str) -> Result<()> {
        let mut versions = self.versions.lock().expect("poisoned ignored-versions set");
        if !versions.insert(version.to_string()) {
            return Ok(());
        }

        let content = serde_json::to_vec_pretty(&*versions)?;
        utils::atomic_write(&self.path, &content)
            .with_context(|| format!("failed to persist '{}'", self.path.display()))
    }
}
