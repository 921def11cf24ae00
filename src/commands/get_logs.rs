//! Log collection handler.

use super::{CommandOutputResult, CommandRequest, HandlerCtx};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Collect agent log files into a compressed archive.
///
/// Files are taken from `<data_dir>/logs/`, filtered by modification date
/// and filename prefix. The archive path is reported in stdout; uploading
/// it is the control plane's separate concern.
pub(super) async fn run(
    req: &CommandRequest,
    cancel: CancellationToken,
    ctx: &HandlerCtx,
) -> Result<CommandOutputResult> {
    let from = match parse_date_param(req, "from") {
        Ok(d) => d,
        Err(e) => {
            return Ok(CommandOutputResult::handler_error(
                "InvalidParameter",
                format!("{:#}", e),
            ))
        }
    };
    let to = match parse_date_param(req, "to") {
        Ok(d) => d,
        Err(e) => {
            return Ok(CommandOutputResult::handler_error(
                "InvalidParameter",
                format!("{:#}", e),
            ))
        }
    };
    let prefix = req.param_str("prefix").map(|p| p.to_string());

    if cancel.is_cancelled() {
        anyhow::bail!("cancelled before log collection");
    }

    let base = ctx.data_dir.join("logs");
    let (archive, count) =
        tokio::task::spawn_blocking(move || collect_archive(&base, prefix.as_deref(), from, to))
            .await
            .context("log collection task failed")??;

    Ok(CommandOutputResult {
        stdout: format!("collected {} file(s) into {}", count, archive.display()),
        ..Default::default()
    })
}

fn parse_date_param(req: &CommandRequest, key: &str) -> Result<Option<NaiveDate>> {
    let raw = match req.param_str(key) {
        Some(r) => r,
        None => return Ok(None),
    };
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid '{}' date '{}', expected YYYY-MM-DD", key, raw))?;
    Ok(Some(date))
}

/// Walk the log directory and pack matching files into a `.tar.gz`.
fn collect_archive(
    base: &Path,
    prefix: Option<&str>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<(PathBuf, usize)> {
    let canonical_base = base
        .canonicalize()
        .with_context(|| format!("log directory '{}' is not accessible", base.display()))?;

    let archive_file = tempfile::Builder::new()
        .prefix("outpost-logs-")
        .suffix(".tar.gz")
        .tempfile()
        .context("failed to create archive file")?;

    let encoder = GzEncoder::new(archive_file.as_file(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut count = 0usize;

    for entry in walkdir::WalkDir::new(&canonical_base).follow_links(true) {
        let entry = entry.context("failed to walk log directory")?;
        if !entry.file_type().is_file() {
            continue;
        }

        // Containment check: refuse anything resolving outside the base,
        // e.g. through a symlinked subdirectory.
        let resolved = entry
            .path()
            .canonicalize()
            .with_context(|| format!("failed to resolve '{}'", entry.path().display()))?;
        if !resolved.starts_with(&canonical_base) {
            log::warn!(
                "skipping '{}': escapes the log directory",
                entry.path().display()
            );
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if let Some(prefix) = prefix {
            if !name.starts_with(prefix) {
                continue;
            }
        }
        if !within_range(&entry.metadata()?.modified()?, from, to) {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(&canonical_base)
            .expect("walked path under base");
        builder
            .append_path_with_name(entry.path(), rel)
            .with_context(|| format!("failed to archive '{}'", entry.path().display()))?;
        count += 1;
    }

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .context("failed to finalize archive")?;

    let (_, path) = archive_file
        .keep()
        .context("failed to keep archive file")?;
    Ok((path, count))
}

fn within_range(mtime: &std::time::SystemTime, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    let date = DateTime::<Utc>::from(*mtime).date_naive();
    if let Some(from) = from {
        if date < from {
            return false;
        }
    }
    if let Some(to) = to {
        if date > to {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandKind, SoftwareIndex};
    use crate::control_plane::ClientBuilder;
    use flate2::read::GzDecoder;
    use std::sync::Arc;

    fn ctx_in(dir: &Path) -> HandlerCtx {
        HandlerCtx {
            data_dir: dir.to_path_buf(),
            http: Arc::new(ClientBuilder::new("http://localhost:9/").build().unwrap()),
            software_index: SoftwareIndex::load(dir),
        }
    }

    fn archive_names(path: &Path) -> Vec<String> {
        let file = std::fs::File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn collects_matching_files() {
        let tmpdir = tempfile::tempdir().unwrap();
        let logs = tmpdir.path().join("logs");
        std::fs::create_dir_all(logs.join("archive")).unwrap();
        std::fs::write(logs.join("agent-2026-07-30.log"), b"one").unwrap();
        std::fs::write(logs.join("agent-2026-07-31.log"), b"two").unwrap();
        std::fs::write(logs.join("updater-2026-07-31.log"), b"three").unwrap();
        std::fs::write(logs.join("archive").join("agent-old.log"), b"four").unwrap();

        let mut req = CommandRequest::mock(CommandKind::GetLogs, "");
        req.params.insert(
            "prefix".to_string(),
            serde_json::Value::String("agent-".to_string()),
        );
        let out = run(&req, CancellationToken::new(), &ctx_in(tmpdir.path()))
            .await
            .unwrap();

        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.starts_with("collected 3 file(s)"));

        let path = out.stdout.rsplit(" into ").next().unwrap();
        let names = archive_names(Path::new(path));
        assert!(names.contains(&"agent-2026-07-30.log".to_string()));
        assert!(names.contains(&"archive/agent-old.log".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("updater-")));
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn date_range_filters_by_mtime() {
        let tmpdir = tempfile::tempdir().unwrap();
        let logs = tmpdir.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("agent.log"), b"now").unwrap();

        // Everything written above is "today"; a future-only range is empty.
        let mut req = CommandRequest::mock(CommandKind::GetLogs, "");
        req.params.insert(
            "from".to_string(),
            serde_json::Value::String("2100-01-01".to_string()),
        );
        let out = run(&req, CancellationToken::new(), &ctx_in(tmpdir.path()))
            .await
            .unwrap();

        assert!(out.stdout.starts_with("collected 0 file(s)"));
        let path = out.stdout.rsplit(" into ").next().unwrap();
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn invalid_date_is_rejected() {
        let tmpdir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmpdir.path().join("logs")).unwrap();

        let mut req = CommandRequest::mock(CommandKind::GetLogs, "");
        req.params.insert(
            "from".to_string(),
            serde_json::Value::String("31/07/2026".to_string()),
        );
        let out = run(&req, CancellationToken::new(), &ctx_in(tmpdir.path()))
            .await
            .unwrap();

        assert_eq!(out.error_code.as_deref(), Some("InvalidParameter"));
    }

    #[tokio::test]
    async fn symlink_escape_is_skipped() {
        let tmpdir = tempfile::tempdir().unwrap();
        let logs = tmpdir.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(tmpdir.path().join("outside.log"), b"secret").unwrap();
        std::os::unix::fs::symlink(tmpdir.path().join("outside.log"), logs.join("inside.log"))
            .unwrap();
        std::fs::write(logs.join("agent.log"), b"fine").unwrap();

        let req = CommandRequest::mock(CommandKind::GetLogs, "");
        let out = run(&req, CancellationToken::new(), &ctx_in(tmpdir.path()))
            .await
            .unwrap();

        assert!(out.stdout.starts_with("collected 1 file(s)"));
        let path = out.stdout.rsplit(" into ").next().unwrap();
        let names = archive_names(Path::new(path));
        assert_eq!(names, vec!["agent.log".to_string()]);
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn missing_log_directory_is_an_error() {
        let tmpdir = tempfile::tempdir().unwrap();
        let req = CommandRequest::mock(CommandKind::GetLogs, "");
        run(&req, CancellationToken::new(), &ctx_in(tmpdir.path()))
            .await
            .unwrap_err();
    }
}
