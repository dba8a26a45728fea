//! Server-side upgrade operation.
//!
//! Runs the WebSocket server handshake on an accepted stream. If the session
//! configures a before-upgrade hook, the hook sees the HTTP request first and
//! either lets the handshake proceed (optionally attaching a per-connection
//! value) or rejects it with a status code and body. A rejected handshake
//! starts no connection and fires no lifecycle hooks.

// ============================================================================
// Imports
// ============================================================================

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::debug;

use crate::config::{Attachment, SessionConfig};
use crate::error::{Error, Result};

use super::{Transport, WsTransport};

// ============================================================================
// Types
// ============================================================================

/// HTTP request of an incoming handshake.
pub type UpgradeRequest = tokio_tungstenite::tungstenite::handshake::server::Request;

/// Verdict of the before-upgrade hook.
pub enum UpgradeDecision {
    /// Continue the handshake; the value becomes the connection attachment.
    Proceed(Option<Attachment>),
    /// Answer with `status` and `body` instead of upgrading.
    Reject {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

impl UpgradeDecision {
    /// Proceeds without a connection attachment.
    #[inline]
    #[must_use]
    pub fn proceed() -> Self {
        Self::Proceed(None)
    }

    /// Proceeds and attaches `value` to the connection.
    #[inline]
    #[must_use]
    pub fn proceed_with(value: impl std::any::Any + Send + Sync) -> Self {
        Self::Proceed(Some(std::sync::Arc::new(value)))
    }

    /// Rejects the handshake.
    #[inline]
    #[must_use]
    pub fn reject(status: u16, body: impl Into<String>) -> Self {
        Self::Reject {
            status,
            body: body.into(),
        }
    }
}

/// Result of a successful upgrade.
pub struct Upgraded {
    /// The established link.
    pub transport: Box<dyn Transport>,
    /// Value returned by the before-upgrade hook.
    pub attachment: Option<Attachment>,
}

// ============================================================================
// upgrade
// ============================================================================

/// Performs the server handshake on `stream`.
///
/// # Errors
///
/// - [`Error::Rejected`] if the before-upgrade hook rejected the request
/// - [`Error::Connection`] if the handshake itself failed
pub async fn upgrade<S>(stream: S, config: &SessionConfig) -> Result<Upgraded>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut attachment = None;
    let mut rejected = None;

    let callback = |request: &UpgradeRequest,
                    response: Response|
     -> std::result::Result<Response, ErrorResponse> {
        let Some(hook) = &config.hooks().before_upgrade else {
            return Ok(response);
        };

        match hook(request, config.attachment()) {
            UpgradeDecision::Proceed(value) => {
                attachment = value;
                Ok(response)
            }
            UpgradeDecision::Reject { status, body } => {
                rejected = Some(status);
                let mut error = ErrorResponse::new(Some(body));
                *error.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
                Err(error)
            }
        }
    };

    let handshake = accept_hdr_async(stream, callback).await;

    match handshake {
        Ok(ws_stream) => Ok(Upgraded {
            transport: Box::new(WsTransport::new(ws_stream)),
            attachment,
        }),
        Err(WsError::Http(_)) if rejected.is_some() => {
            let status = rejected.unwrap_or_default();
            debug!(status, "Upgrade rejected by hook");
            Err(Error::rejected(status))
        }
        Err(e) => Err(Error::connection(format!("WebSocket upgrade failed: {e}"))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::client_async;

    use crate::frame::{Frame, FrameKind};

    async fn accept_one(
        config: std::sync::Arc<SessionConfig>,
    ) -> (String, tokio::task::JoinHandle<Result<Upgraded>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            upgrade(stream, &config).await
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_upgrade_without_hook() {
        let (url, server) = accept_one(SessionConfig::new()).await;
        let stream = TcpStream::connect(url.trim_start_matches("ws://").trim_end_matches("/ws"))
            .await
            .unwrap();
        let (client, _) = client_async(url.as_str(), stream).await.unwrap();

        let upgraded = server.await.unwrap().unwrap();
        assert!(upgraded.attachment.is_none());

        let (_, mut writer) = Box::new(WsTransport::new(client)).split();
        writer.write_frame(FrameKind::Text, b"hi".to_vec()).await.unwrap();

        let (mut reader, _) = upgraded.transport.split();
        assert_eq!(reader.read_frame().await.unwrap(), Frame::text("hi"));
    }

    #[tokio::test]
    async fn test_hook_attachment_is_returned() {
        let config = SessionConfig::builder()
            .before_upgrade(|request, _| {
                let user = request.uri().query().unwrap_or_default().to_string();
                UpgradeDecision::proceed_with(user)
            })
            .build()
            .unwrap();
        let (url, server) = accept_one(config).await;
        let addr = url.trim_start_matches("ws://").trim_end_matches("/ws").to_string();
        let stream = TcpStream::connect(addr).await.unwrap();
        let _client = client_async(format!("{url}?alice"), stream).await.unwrap();

        let upgraded = server.await.unwrap().unwrap();
        let user = upgraded
            .attachment
            .as_ref()
            .and_then(|a| a.downcast_ref::<String>())
            .cloned();
        assert_eq!(user.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_rejection_returns_status_to_peer() {
        let config = SessionConfig::builder()
            .before_upgrade(|_, _| UpgradeDecision::reject(401, "no token"))
            .build()
            .unwrap();
        let (url, server) = accept_one(config).await;
        let addr = url.trim_start_matches("ws://").trim_end_matches("/ws").to_string();
        let stream = TcpStream::connect(addr).await.unwrap();

        let client = client_async(url.as_str(), stream).await;
        match client {
            Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
            other => panic!("expected HTTP rejection, got {:?}", other.map(|_| ())),
        }

        let result = server.await.unwrap();
        assert!(matches!(result, Err(Error::Rejected { status: 401 })));
    }
}
