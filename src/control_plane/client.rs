//! HTTP client plumbing.

use crate::identity::Position;
use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Default timeout for HTTP requests completion (30 minutes).
const DEFAULT_HTTP_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Identification API path endpoint (v1).
pub(crate) static V1_IDENTIFY: &str = "v1/agents/identify";

/// Token refresh API path endpoint (v1).
pub(crate) static V1_TOKEN: &str = "v1/agents/token";

/// Identification request body.
#[derive(Debug, Serialize)]
struct IdentifyRequest<'a> {
    /// Hardware fingerprint, stable across reinstalls.
    fingerprint: &'a str,
    /// Position requested by the operator, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<&'a Position>,
}

/// Identification response body.
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct IdentifyResponse {
    /// Assigned agent identifier.
    pub(crate) agent_id: String,
    /// Session bearer token, to be sealed before storage.
    pub(crate) token: String,
    /// Position as recorded by the control plane.
    #[serde(default)]
    pub(crate) position: Position,
}

/// Token refresh response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Client to make outgoing API requests.
#[derive(Clone, Debug)]
pub(crate) struct Client {
    /// Base URL for API endpoint.
    api_base: reqwest::Url,
    /// Asynchronous reqwest client.
    hclient: reqwest::Client,
}

impl Client {
    /// Exchange a hardware fingerprint for an agent identity.
    pub(crate) async fn identify(
        &self,
        fingerprint: &str,
        position: Option<&Position>,
    ) -> Result<IdentifyResponse> {
        let body = IdentifyRequest {
            fingerprint,
            position,
        };
        let resp = self
            .new_request(Method::POST, V1_IDENTIFY)?
            .json(&body)
            .send()
            .await
            .context("identification request failed")?
            .error_for_status()
            .context("identification rejected")?;

        resp.json::<IdentifyResponse>()
            .await
            .context("malformed identification response")
    }

    /// Refresh the session bearer token.
    pub(crate) async fn refresh_token(&self, agent_id: &str, token: &str) -> Result<String> {
        let resp = self
            .new_request(Method::POST, V1_TOKEN)?
            .bearer_auth(token)
            .json(&serde_json::json!({ "agent_id": agent_id }))
            .send()
            .await
            .context("token refresh request failed")?
            .error_for_status()
            .context("token refresh rejected")?;

        let body = resp
            .json::<TokenResponse>()
            .await
            .context("malformed token refresh response")?;
        Ok(body.token)
    }

    /// Download an opaque package to the given path, streaming to disk.
    ///
    /// Returns the number of bytes written. The URL is absolute, as handed
    /// out by the control plane; it is not resolved against the API base.
    pub(crate) async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let url = reqwest::Url::parse(url).with_context(|| format!("failed to parse '{}'", url))?;
        let resp = self
            .hclient
            .get(url)
            .send()
            .await
            .context("download request failed")?
            .error_for_status()
            .context("download rejected")?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create '{}'", dest.display()))?;

        let mut written: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("download stream failed")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write '{}'", dest.display()))?;
            written = written.saturating_add(chunk.len() as u64);
        }
        file.flush().await?;

        Ok(written)
    }

    /// Return a request builder with base URL and common headers set.
    fn new_request<S: AsRef<str>>(
        &self,
        method: reqwest::Method,
        url_suffix: S,
    ) -> Result<reqwest::RequestBuilder> {
        let url = self.api_base.clone().join(url_suffix.as_ref())?;
        let builder = self
            .hclient
            .request(method, url)
            .header("content-type", "application/json");
        Ok(builder)
    }
}

/// Client builder.
#[derive(Clone, Debug)]
pub(crate) struct ClientBuilder {
    /// Base URL for API endpoint (mandatory).
    api_base: String,
    /// Asynchronous reqwest client (custom).
    hclient: Option<reqwest::Client>,
}

impl ClientBuilder {
    /// Return a new builder for the given base API endpoint URL.
    pub(crate) fn new<T>(api_base: T) -> Self
    where
        T: Into<String>,
    {
        Self {
            api_base: api_base.into(),
            hclient: None,
        }
    }

    /// Set (or reset) the HTTP client to use.
    #[allow(dead_code)]
    pub(crate) fn http_client(self, hclient: Option<reqwest::Client>) -> Self {
        let mut builder = self;
        builder.hclient = hclient;
        builder
    }

    /// Build a client with specified parameters.
    pub(crate) fn build(self) -> Result<Client> {
        let hclient = match self.hclient {
            Some(client) => client,
            None => reqwest::ClientBuilder::new()
                .timeout(DEFAULT_HTTP_COMPLETION_TIMEOUT)
                .build()?,
        };

        let api_base = reqwest::Url::parse(&self.api_base)
            .with_context(|| format!("failed to parse '{}'", &self.api_base))?;
        Ok(Client { api_base, hclient })
    }
}
