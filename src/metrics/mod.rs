//! Metrics endpoint over a Unix-domain socket.
//!
//! Textual Prometheus exposition of the default registry. A Unix-domain
//! socket keeps the surface local-only; scraping is the host's concern.

use actix::prelude::*;
use anyhow::{bail, Context as _, Result};
use std::os::unix::net as std_net;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::net as tokio_net;

/// Default Unix socket path.
static SOCKET_PATH: &str = "/run/outpost/metrics.promsock";

/// Metrics exposition service.
#[derive(Debug)]
pub(crate) struct MetricsService {
    path: PathBuf,
    listener: std_net::UnixListener,
}

impl MetricsService {
    /// Create the metrics service on the default socket path.
    pub(crate) fn bind_socket() -> Result<Self> {
        Self::bind_socket_at(SOCKET_PATH)
            .with_context(|| format!("failed to setup metrics service on '{}'", SOCKET_PATH))
    }

    /// Create the metrics service on a specific socket path.
    pub(crate) fn bind_socket_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                bail!("failed to remove stale socket file: {}", e);
            }
        }
        let listener = std_net::UnixListener::bind(path)
            .context("failed to bind metrics service to Unix socket")?;
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    /// Gather metrics from the default registry, in textual exposition format.
    fn gather_text() -> Result<Vec<u8>> {
        use prometheus::Encoder;

        let metric_families = prometheus::gather();
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

/// Incoming scrape connection.
struct Connection {
    stream: tokio_net::UnixStream,
}

impl Message for Connection {
    type Result = ();
}

impl Actor for MetricsService {
    type Context = actix::Context<Self>;

    fn started(&mut self, ctx: &mut actix::Context<Self>) {
        let listener = self
            .listener
            .try_clone()
            .expect("failed to clone metrics listener");
        listener
            .set_nonblocking(true)
            .expect("failed to move metrics listener into nonblocking mode");
        let async_listener = tokio_net::UnixListener::from_std(listener)
            .expect("failed to create async metrics listener");

        // Manual stream unfolding keeps the async listener alive for the
        // whole duration of the stream.
        let connections = futures::stream::unfold(async_listener, |l| async move {
            loop {
                if let Ok((stream, _addr)) = l.accept().await {
                    break Some((Connection { stream }, l));
                }
            }
        });
        ctx.add_stream(connections);

        log::debug!(
            "metrics service listening on '{}'",
            self.path.display()
        );
    }
}

impl StreamHandler<Connection> for MetricsService {
    fn handle(&mut self, item: Connection, _ctx: &mut actix::Context<MetricsService>) {
        let mut stream = item.stream;
        actix::spawn(async move {
            match MetricsService::gather_text() {
                Ok(body) => {
                    if let Err(e) = stream.write_all(&body).await {
                        log::warn!("failed to write metrics: {}", e);
                    }
                }
                Err(e) => log::warn!("failed to encode metrics: {}", e),
            }
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_socket_at() {
        // Error path (EPERM or EISDIR).
        MetricsService::bind_socket_at("/proc").unwrap_err();

        let tmpdir = tempfile::tempdir().unwrap();
        let tmp_socket_path = tmpdir.path().join("test-socket");
        // Create a socket file and leave it behind on disk.
        let service = MetricsService::bind_socket_at(&tmp_socket_path).unwrap();
        drop(service);
        // Make sure that the next run can remove it and start normally.
        let service = MetricsService::bind_socket_at(&tmp_socket_path).unwrap();
        drop(service);
    }

    #[test]
    fn test_gather_text_encodes() {
        let text = MetricsService::gather_text().unwrap();
        // The default registry is shared; content depends on test order,
        // but encoding itself must always succeed.
        String::from_utf8(text).unwrap();
    }
}
