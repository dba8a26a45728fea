//! Client-side dial operation.
//!
//! # Dial Flow
//!
//! 1. Validate the target URL (`ws://` only)
//! 2. Collect extra handshake headers from the headers hook
//! 3. Open TCP, directly or through the configured proxy
//! 4. Run the WebSocket client handshake over that stream
//!
//! TLS is not supported: `wss://` targets are rejected with
//! [`Error::InvalidUrl`] before any socket is opened.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, info};
use url::Url;

use crate::config::SessionConfig;
use crate::error::{Error, Result};

use super::proxy;
use super::{Transport, WsTransport};

// ============================================================================
// Connector
// ============================================================================

/// Something that can produce a fresh transport on demand.
///
/// The client session driver calls [`connect`](Connector::connect) once per
/// attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes a new transport.
    ///
    /// # Errors
    ///
    /// Any error; the driver treats every failure as a closed connection and
    /// retries after the reconnect interval.
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn Transport>>;

    /// Human-readable target for logs.
    fn target(&self) -> &str {
        "<custom>"
    }
}

/// [`Connector`] dialing a WebSocket URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Creates a connector for `url`.
    #[inline]
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn Transport>> {
        dial(&self.url, config).await
    }

    fn target(&self) -> &str {
        &self.url
    }
}

// ============================================================================
// dial
// ============================================================================

/// Dials a WebSocket endpoint.
///
/// # Errors
///
/// - [`Error::InvalidUrl`] if the URL is malformed or not `ws`
/// - [`Error::Config`] if the headers hook returns an invalid header
/// - [`Error::Io`] / [`Error::Proxy`] if the TCP or proxy leg fails
/// - [`Error::Connection`] if the WebSocket handshake fails
pub async fn dial(url: &str, config: &SessionConfig) -> Result<Box<dyn Transport>> {
    let target = parse_target(url)?;
    let host = target
        .host_str()
        .ok_or_else(|| Error::invalid_url(url, "missing host"))?;
    let port = target
        .port_or_known_default()
        .ok_or_else(|| Error::invalid_url(url, "missing port"))?;

    let mut request = url.into_client_request()?;
    if let Some(headers) = &config.hooks().headers {
        for (name, value) in headers(config.attachment()) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::config(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| Error::config(format!("invalid value for header '{name}': {e}")))?;
            request.headers_mut().insert(name, value);
        }
    }

    let stream = proxy::connect(config.proxy(), host, port).await?;
    stream.set_nodelay(true)?;
    debug!(url, "TCP connected, starting WebSocket handshake");

    let (ws_stream, response) = client_async(request, stream)
        .await
        .map_err(|e| Error::connection(format!("WebSocket handshake with {url} failed: {e}")))?;

    info!(url, status = response.status().as_u16(), "WebSocket connection established");

    Ok(Box::new(WsTransport::new(ws_stream)))
}

fn parse_target(url: &str) -> Result<Url> {
    let target = Url::parse(url).map_err(|e| Error::invalid_url(url, e.to_string()))?;
    match target.scheme() {
        "ws" => Ok(target),
        "wss" => Err(Error::invalid_url(url, "wss is not supported, TLS is not enabled")),
        other => Err(Error::invalid_url(
            url,
            format!("unsupported scheme '{other}', expected ws"),
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================
