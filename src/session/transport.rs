//! WebSocket event transport.

use super::events::Envelope;
use anyhow::Context;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// Client-type tag sent on the handshake.
static CLIENT_TYPE: &str = "endpoint-agent";

/// Transport-level identification, sent as handshake headers.
#[derive(Clone, Debug)]
pub(crate) struct Identification {
    pub(crate) agent_id: String,
    pub(crate) bearer_token: String,
}

/// Connection-phase errors.
#[derive(Debug, Error)]
pub(crate) enum ConnectError {
    /// The server answered the handshake with an HTTP rejection.
    #[error("handshake rejected with HTTP status {status}")]
    Rejected { status: u16 },
    /// Anything else: DNS, TCP, TLS, protocol.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ConnectError {
    /// Whether a token refresh may unblock the next attempt.
    pub(crate) fn wants_token_refresh(&self) -> bool {
        matches!(self, ConnectError::Rejected { status: 401 | 403 })
    }
}

/// An established event transport.
///
/// Owned exclusively by the session runner; dropped on every disconnect and
/// rebuilt by the reconnect path.
#[derive(Debug)]
pub(crate) struct Transport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport {
    /// Connect and identify to the control plane.
    pub(crate) async fn connect(
        events_url: &Url,
        identification: &Identification,
    ) -> Result<Self, ConnectError> {
        let mut request = events_url
            .as_str()
            .into_client_request()
            .context("failed to build handshake request")?;
        let headers = request.headers_mut();
        headers.insert("x-outpost-client", HeaderValue::from_static(CLIENT_TYPE));
        headers.insert(
            "x-outpost-agent-id",
            HeaderValue::from_str(&identification.agent_id)
                .context("agent ID is not a valid header value")?,
        );
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", identification.bearer_token))
                .context("bearer token is not a valid header value")?,
        );

        let (stream, _response) = match tokio_tungstenite::connect_async(request).await {
            Ok(ok) => ok,
            Err(tungstenite::Error::Http(response)) => {
                return Err(ConnectError::Rejected {
                    status: response.status().as_u16(),
                })
            }
            Err(e) => {
                return Err(ConnectError::Failed(
                    anyhow::Error::new(e).context("transport connect failed"),
                ))
            }
        };

        Ok(Self { stream })
    }

    /// Send one outbound envelope, fire-and-forget semantics at the caller.
    pub(crate) async fn send(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        let text = serde_json::to_string(envelope).context("failed to encode envelope")?;
        self.stream
            .send(Message::Text(text))
            .await
            .context("failed to send event")
    }

    /// Receive the next inbound envelope.
    ///
    /// Non-text frames are skipped, parse failures are logged and discarded
    /// without dropping the connection. `None` means the transport is gone.
    pub(crate) async fn next_event(&mut self) -> Option<Envelope> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => {
                        log::warn!("discarding malformed inbound frame: {}", e);
                    }
                },
                Ok(Message::Close(frame)) => {
                    log::info!("transport closed by server: {:?}", frame);
                    return None;
                }
                // Ping/Pong are answered by the library on flush.
                Ok(_) => {}
                Err(e) => {
                    log::warn!("transport receive error: {}", e);
                    return None;
                }
            }
        }
    }

    /// Close the transport, best-effort.
    pub(crate) async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_statuses_wanting_refresh() {
        assert!(ConnectError::Rejected { status: 401 }.wants_token_refresh());
        assert!(ConnectError::Rejected { status: 403 }.wants_token_refresh());
        assert!(!ConnectError::Rejected { status: 500 }.wants_token_refresh());
        assert!(!ConnectError::Failed(anyhow::anyhow!("net down")).wants_token_refresh());
    }

    #[tokio::test]
    async fn connect_failure_is_not_a_rejection() {
        // Nothing listens on this port.
        let url = Url::parse("ws://127.0.0.1:9/events").unwrap();
        let identification = Identification {
            agent_id: "agent-1".to_string(),
            bearer_token: "tok".to_string(),
        };
        match Transport::connect(&url, &identification).await {
            Err(ConnectError::Failed(_)) => {}
            other => panic!("unexpected connect outcome: {:?}", other),
        }
    }
}
