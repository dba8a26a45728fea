//! Proxy configuration and tunnelling.
//!
//! Client dials can be routed through a SOCKS5 proxy (RFC 1928, with
//! optional RFC 1929 username/password auth) or an HTTP proxy using
//! `CONNECT`. The WebSocket handshake then runs over the tunnelled stream.
//!
//! # Example
//!
//! ```
//! use duplex_ws::ProxyConfig;
//!
//! // SOCKS5 proxy, as in `127.0.0.1:1080`
//! let proxy = ProxyConfig::socks5("127.0.0.1", 1080);
//!
//! // HTTP proxy with auth
//! let proxy = ProxyConfig::http("proxy.example.com", 8080)
//!     .with_credentials("user", "pass");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::IpAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, lookup_host};
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_UNACCEPTABLE: u8 = 0xFF;
const PASSWORD_AUTH_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Upper bound for the proxy's HTTP response head.
const MAX_HTTP_HEAD: usize = 8 * 1024;

// ============================================================================
// ProxyType
// ============================================================================

/// Proxy protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// HTTP proxy tunnelling via `CONNECT`.
    Http,

    /// SOCKS v5 proxy.
    #[serde(rename = "socks5")]
    Socks5,

    /// Direct connection (no proxy).
    #[default]
    Direct,
}

impl ProxyType {
    /// Returns the string representation.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Socks5 => "socks5",
            Self::Direct => "direct",
        }
    }
}

// ============================================================================
// ProxyConfig
// ============================================================================

/// Proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy type.
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,

    /// Proxy hostname.
    pub host: String,

    /// Proxy port.
    pub port: u16,

    /// Username for authentication (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for authentication (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Let the SOCKS5 proxy resolve target hostnames.
    #[serde(rename = "proxyDns", default)]
    pub proxy_dns: bool,
}

// ============================================================================
// ProxyConfig - Constructors
// ============================================================================

impl ProxyConfig {
    /// Creates a new proxy configuration.
    #[must_use]
    pub fn new(proxy_type: ProxyType, host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_type,
            host: host.into(),
            port,
            username: None,
            password: None,
            proxy_dns: false,
        }
    }

    /// Creates an HTTP `CONNECT` proxy configuration.
    #[inline]
    #[must_use]
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(ProxyType::Http, host, port)
    }

    /// Creates a SOCKS5 proxy configuration.
    #[inline]
    #[must_use]
    pub fn socks5(host: impl Into<String>, port: u16) -> Self {
        Self::new(ProxyType::Socks5, host, port)
    }

    /// Parses the `IP:Port` form, e.g. `127.0.0.1:1080`, as a SOCKS5 proxy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address has no valid port.
    pub fn socks5_addr(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::config(format!("proxy address '{addr}' lacks a port")))?;
        let port = port
            .parse()
            .map_err(|_| Error::config(format!("proxy address '{addr}' has an invalid port")))?;
        Ok(Self::socks5(host.trim_matches(['[', ']']), port))
    }

    /// Creates a direct (no proxy) configuration.
    #[inline]
    #[must_use]
    pub fn direct() -> Self {
        Self::new(ProxyType::Direct, String::new(), 0)
    }
}

// ============================================================================
// ProxyConfig - Builder Methods
// ============================================================================

impl ProxyConfig {
    /// Sets authentication credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Lets the proxy resolve hostnames (SOCKS5 only).
    #[must_use]
    pub fn with_proxy_dns(mut self, proxy_dns: bool) -> Self {
        self.proxy_dns = proxy_dns;
        self
    }
}

// ============================================================================
// ProxyConfig - Predicates
// ============================================================================

impl ProxyConfig {
    /// Returns `true` if this proxy has authentication configured.
    #[inline]
    #[must_use]
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Returns `true` if dials bypass the proxy.
    #[inline]
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.proxy_type == ProxyType::Direct
    }

    /// Checks that the proxy can be dialed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a missing host or port, or SOCKS5
    /// credentials longer than 255 bytes.
    pub fn validate(&self) -> Result<()> {
        if self.is_direct() {
            return Ok(());
        }
        if self.host.is_empty() || self.port == 0 {
            return Err(Error::config("proxy requires a host and a non-zero port"));
        }
        if self.proxy_type == ProxyType::Socks5 {
            let too_long = |s: &Option<String>| s.as_ref().is_some_and(|s| s.len() > 255);
            if too_long(&self.username) || too_long(&self.password) {
                return Err(Error::config(
                    "SOCKS5 credentials are limited to 255 bytes",
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tunnelling
// ============================================================================

/// Opens a TCP stream to `host:port`, through `proxy` unless it is direct.
///
/// # Errors
///
/// - [`Error::Io`] if a TCP connect fails
/// - [`Error::Proxy`] if the proxy refuses or answers garbage
pub async fn connect(proxy: Option<&ProxyConfig>, host: &str, port: u16) -> Result<TcpStream> {
    let Some(proxy) = proxy.filter(|p| !p.is_direct()) else {
        return Ok(TcpStream::connect((host, port)).await?);
    };

    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
    debug!(proxy = proxy.proxy_type.as_str(), proxy_host = %proxy.host, target = %host, port, "Tunnelling through proxy");

    match proxy.proxy_type {
        ProxyType::Socks5 => socks5_handshake(&mut stream, proxy, host, port).await?,
        ProxyType::Http => http_connect(&mut stream, proxy, host, port).await?,
        ProxyType::Direct => {}
    }

    Ok(stream)
}

async fn socks5_handshake(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<()> {
    // Method negotiation
    let greeting: &[u8] = if proxy.has_auth() {
        &[SOCKS_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
    } else {
        &[SOCKS_VERSION, 1, AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(Error::proxy(format!("unexpected SOCKS version {}", choice[0])));
    }

    match choice[1] {
        AUTH_NONE => {}
        AUTH_PASSWORD => socks5_authenticate(stream, proxy).await?,
        AUTH_UNACCEPTABLE => {
            return Err(Error::proxy("proxy accepted none of the offered auth methods"));
        }
        other => return Err(Error::proxy(format!("proxy chose unsupported auth method {other}"))),
    }

    // CONNECT request
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match resolve_target(host, port, proxy.proxy_dns).await? {
        Target::Ip(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Target::Ip(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Target::Domain(name) => {
            let len = u8::try_from(name.len())
                .map_err(|_| Error::proxy("target hostname longer than 255 bytes"))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(name.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(Error::proxy(format!(
            "SOCKS5 connect failed: {}",
            socks5_reply_message(head[1])
        )));
    }

    // Skip the bound address
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => usize::from(stream.read_u8().await?),
        other => return Err(Error::proxy(format!("unknown address type {other}"))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

async fn socks5_authenticate(stream: &mut TcpStream, proxy: &ProxyConfig) -> Result<()> {
    let username = proxy.username.as_deref().unwrap_or_default();
    let password = proxy.password.as_deref().unwrap_or_default();

    let mut request = vec![PASSWORD_AUTH_VERSION];
    for field in [username, password] {
        let len = u8::try_from(field.len())
            .map_err(|_| Error::proxy("SOCKS5 credentials longer than 255 bytes"))?;
        request.push(len);
        request.extend_from_slice(field.as_bytes());
    }
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::proxy("SOCKS5 authentication rejected"));
    }
    Ok(())
}

fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

enum Target {
    Ip(IpAddr),
    Domain(String),
}

async fn resolve_target(host: &str, port: u16, proxy_dns: bool) -> Result<Target> {
    let bare = host.trim_matches(['[', ']']);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(Target::Ip(ip));
    }
    if proxy_dns {
        return Ok(Target::Domain(host.to_string()));
    }

    lookup_host((host, port))
        .await?
        .next()
        .map(|addr| Target::Ip(addr.ip()))
        .ok_or_else(|| Error::connection(format!("no address found for {host}")))
}

async fn http_connect(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<()> {
    let authority = format!("{host}:{port}");
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
        let token = BASE64.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(&mut *stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;

    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::proxy(format!("malformed proxy response: {}", status_line.trim())))?;

    // Drain the remaining head
    let mut consumed = status_line.len();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        consumed += read;
        if read == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if consumed > MAX_HTTP_HEAD {
            return Err(Error::proxy("proxy response head too large"));
        }
    }

    if !reader.buffer().is_empty() {
        return Err(Error::proxy("proxy sent data before the tunnel was established"));
    }

    if status != 200 {
        return Err(Error::proxy(format!("proxy CONNECT answered {status}")));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
