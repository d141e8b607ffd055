//! HTTP proxy support for the session handshake and the socket.
//!
//! A configured proxy is mandatory once set: if it cannot be reached or
//! refuses the tunnel, connecting fails with
//! [`RtmClientError::InvalidConfiguration`] and no direct connection is
//! attempted.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::rtm::client::RtmClientError;

const MAX_TUNNEL_RESPONSE_BYTES: usize = 8 * 1024;

/// Network intermediary used for every connection a client makes.
#[derive(Clone, Debug)]
pub struct ProxySettings {
    url: String,
    credentials: Option<(String, SecretString)>,
}

impl ProxySettings {
    /// Proxy at `url`, e.g. `http://127.0.0.1:8080`. Only `http://` proxies
    /// are supported.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().to_string(),
            credentials: None,
        }
    }

    /// Adds basic credentials sent with every proxied request.
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: SecretString) -> Self {
        self.credentials = Some((username.into(), password));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Checks that the proxy URL is usable and returns its `host:port`.
    pub fn authority(&self) -> Result<String, RtmClientError> {
        let parsed = Url::parse(&self.url).map_err(|err| {
            RtmClientError::InvalidConfiguration(format!("proxy url `{}`: {err}", self.url))
        })?;
        if parsed.scheme() != "http" {
            return Err(RtmClientError::InvalidConfiguration(format!(
                "proxy scheme `{}` is not supported, expected http",
                parsed.scheme()
            )));
        }
        let host = parsed.host_str().ok_or_else(|| {
            RtmClientError::InvalidConfiguration(format!("proxy url `{}` has no host", self.url))
        })?;
        let port = parsed.port_or_known_default().unwrap_or(80);
        Ok(format!("{host}:{port}"))
    }

    pub(crate) fn to_reqwest(&self) -> Result<reqwest::Proxy, RtmClientError> {
        self.authority()?;
        let proxy = reqwest::Proxy::all(self.url.as_str()).map_err(|err| {
            RtmClientError::InvalidConfiguration(format!("proxy url `{}`: {err}", self.url))
        })?;
        Ok(match &self.credentials {
            Some((username, password)) => proxy.basic_auth(username, password.expose_secret()),
            None => proxy,
        })
    }

    fn authorization_header(&self) -> Option<String> {
        self.credentials.as_ref().map(|(username, password)| {
            let token =
                BASE64_STANDARD.encode(format!("{username}:{}", password.expose_secret()));
            format!("Basic {token}")
        })
    }
}

/// Opens a TCP tunnel to `host:port` through `proxy` with `CONNECT`.
pub(crate) async fn open_tunnel(
    proxy: &ProxySettings,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, RtmClientError> {
    let authority = proxy.authority()?;
    let target = format!("{host}:{port}");

    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(&authority)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(event = "proxy_unreachable", proxy = %authority, error = %err);
            return Err(RtmClientError::InvalidConfiguration(format!(
                "proxy {authority} unreachable: {err}"
            )));
        }
        Err(_) => {
            warn!(event = "proxy_unreachable", proxy = %authority, error = "timeout");
            return Err(RtmClientError::InvalidConfiguration(format!(
                "proxy {authority} did not accept a connection within {}ms",
                timeout.as_millis()
            )));
        }
    };

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(authorization) = proxy.authorization_header() {
        request.push_str(&format!("Proxy-Authorization: {authorization}\r\n"));
    }
    request.push_str("\r\n");

    let status_line = match tokio::time::timeout(timeout, async {
        stream.write_all(request.as_bytes()).await?;
        read_response_head(&mut stream).await
    })
    .await
    {
        Ok(Ok(head)) => head,
        Ok(Err(err)) => {
            return Err(RtmClientError::InvalidConfiguration(format!(
                "proxy {authority} failed during CONNECT: {err}"
            )));
        }
        Err(_) => {
            return Err(RtmClientError::InvalidConfiguration(format!(
                "proxy {authority} did not answer CONNECT within {}ms",
                timeout.as_millis()
            )));
        }
    };

    match parse_status(&status_line) {
        Some(status) if (200..300).contains(&status) => {
            debug!(event = "proxy_tunnel_open", proxy = %authority, target = %target);
            Ok(stream)
        }
        _ => {
            warn!(event = "proxy_rejected_tunnel", proxy = %authority, status_line = %status_line);
            Err(RtmClientError::InvalidConfiguration(format!(
                "proxy {authority} rejected tunnel to {target}: {status_line}"
            )))
        }
    }
}

// Reads byte by byte so nothing past the header block is consumed.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_TUNNEL_RESPONSE_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "proxy response headers too large",
            ));
        }
        head.push(stream.read_u8().await?);
    }
    let text = String::from_utf8_lossy(&head);
    Ok(text.lines().next().unwrap_or_default().trim().to_string())
}

fn parse_status(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
