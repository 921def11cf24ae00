//! Miscellaneous utility functions.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::os::unix::net as std_net;
use std::path::{Path, PathBuf};

/// Atomically replace the file at `path` with the given content.
///
/// The content is first written to a temporary file in the same directory,
/// then moved over the destination, so readers never observe a partially
/// written file.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("no parent directory for '{}'", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory '{}'", dir.display()))?;

    let mut tmpfile = tempfile::Builder::new()
        .prefix(".outpost.")
        .suffix(".partial")
        .tempfile_in(dir)
        .with_context(|| format!("failed to create temporary file under '{}'", dir.display()))?;
    tmpfile
        .write_all(content)
        .and_then(|_| tmpfile.flush())
        .with_context(|| format!("failed to write content for '{}'", path.display()))?;
    tmpfile
        .persist(path)
        .with_context(|| format!("failed to persist '{}'", path.display()))?;
    Ok(())
}

/// Hex-encoded SHA-256 digest of a file, streamed in chunks.
pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open '{}'", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Single-instance guard, backed by a Unix-domain socket.
///
/// Binding succeeds only while no other live process holds the socket: a
/// connect probe distinguishes a running instance from a stale file left
/// behind by an unclean shutdown.
#[derive(Debug)]
pub(crate) struct InstanceGuard {
    path: PathBuf,
    _listener: std_net::UnixListener,
}

impl InstanceGuard {
    /// Acquire the process-wide instance lock at the given socket path.
    pub(crate) fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory '{}'", parent.display()))?;
        }

        if std_net::UnixStream::connect(path).is_ok() {
            bail!("another agent instance is already running");
        }
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                bail!("failed to remove stale lock socket: {}", e);
            }
        }

        let listener = std_net::UnixListener::bind(path)
            .with_context(|| format!("failed to bind instance lock at '{}'", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            _listener: listener,
        })
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Retained failure dumps; older reports beyond this are pruned.
const MAX_ERROR_REPORTS: usize = 64;

/// Best-effort JSON failure dump under `<data_dir>/error_reports/`.
///
/// Reporting must never mask the original failure, so all errors here are
/// logged and swallowed.
pub(crate) fn write_error_report(data_dir: &Path, kind: &str, payload: &serde_json::Value) {
    let dir = data_dir.join("error_reports");
    let fname = format!(
        "{}-{}.json",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"),
        kind
    );
    let report = serde_json::json!({
        "kind": kind,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "details": payload,
    });
    let content = match serde_json::to_vec_pretty(&report) {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to serialize error report: {}", e);
            return;
        }
    };
    if let Err(e) = atomic_write(&dir.join(fname), &content) {
        log::error!("failed to write error report: {}", e);
    }
    prune_error_reports(&dir);
}

/// Drop the oldest reports; timestamped names sort chronologically.
fn prune_error_reports(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("failed to scan error reports: {}", e);
            return;
        }
    };
    let mut names: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
        .collect();
    if names.len() <= MAX_ERROR_REPORTS {
        return;
    }

    names.sort();
    for stale in &names[..names.len() - MAX_ERROR_REPORTS] {
        if let Err(e) = std::fs::remove_file(stale) {
            log::error!("failed to prune error report '{}': {}", stale.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_content() {
        let tmpdir = tempfile::tempdir().unwrap();
        let target = tmpdir.path().join("sub").join("state.json");

        atomic_write(&target, b"first").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"first");

        atomic_write(&target, b"second").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");
    }

    #[test]
    fn test_sha256_file() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("payload.bin");
        std::fs::write(&path, b"abc").unwrap();

        // Well-known digest of "abc".
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_instance_guard_exclusive() {
        let tmpdir = tempfile::tempdir().unwrap();
        let sock = tmpdir.path().join("agent.lock");

        let guard = InstanceGuard::acquire(&sock).unwrap();
        InstanceGuard::acquire(&sock).unwrap_err();
        drop(guard);

        // A released lock can be re-acquired.
        let _guard = InstanceGuard::acquire(&sock).unwrap();
    }

    #[test]
    fn test_instance_guard_stale_socket() {
        let tmpdir = tempfile::tempdir().unwrap();
        let sock = tmpdir.path().join("agent.lock");

        // Leave a socket file behind without a live holder.
        let listener = std_net::UnixListener::bind(&sock).unwrap();
        drop(listener);
        assert!(sock.exists());

        let _guard = InstanceGuard::acquire(&sock).unwrap();
    }

    #[test]
    fn test_error_report_written() {
        let tmpdir = tempfile::tempdir().unwrap();
        write_error_report(
            tmpdir.path(),
            "update_failure",
            &serde_json::json!({"version": "1.2.3"}),
        );

        let entries: Vec<_> = std::fs::read_dir(tmpdir.path().join("error_reports"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_error_reports_are_pruned() {
        let tmpdir = tempfile::tempdir().unwrap();
        let dir = tmpdir.path().join("error_reports");
        std::fs::create_dir_all(&dir).unwrap();

        // Pre-seed more reports than the retention cap.
        for i in 0..(MAX_ERROR_REPORTS + 10) {
            std::fs::write(dir.join(format!("20200101T000000.{:03}-old.json", i)), b"{}").unwrap();
        }

        write_error_report(tmpdir.path(), "recent", &serde_json::json!({}));

        let count = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(count, MAX_ERROR_REPORTS);

        // The freshly written report survived the prune.
        let survivors: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(survivors.iter().any(|n| n.contains("-recent.json")));
    }
}
