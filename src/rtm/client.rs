//! Connection manager: session-start handshake, socket setup, and the
//! worker task that owns the websocket.
//!
//! There is no reconnect loop. A failed connect leaves nothing running, and
//! a session whose socket dies is closed for good; callers create a new one.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async_tls, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::gate::{self, GateError};
use crate::rtm::correlation::{PendingRequests, RequestError};
use crate::rtm::dispatch::{Dispatcher, EventHandlers, LifecycleEvent};
use crate::rtm::presence::{Roster, SelfIdentity, User};
use crate::rtm::proto::{
    ClientMessage, HandshakeRequest, HandshakeResponse, InboundFrame, ServerEvent,
};
use crate::rtm::proxy::{self, ProxySettings};
use crate::rtm::session::RtmSession;
use crate::rtm::state::{ConnectionState, SessionState};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Production API base for the session-start handshake.
pub const RTM_API_BASE_URL: &str = "https://slack.com/api";
/// Local development API base.
pub const LOCAL_RTM_API_BASE_URL: &str = "http://localhost:3000/api";

type RtmSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RtmDefaults;

impl RtmDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HELLO_TIMEOUT: Duration = Duration::from_secs(15);
    pub const SUBSCRIBE_ROSTER_PRESENCE: bool = false;
}

#[derive(Clone, Debug)]
pub struct RtmClientOptions {
    /// Bound on TCP/TLS setup for both the handshake and the socket.
    pub connect_timeout: Duration,
    /// Bound on the whole session-start request.
    pub handshake_timeout: Duration,
    /// Bound on waiting for the server's `hello` after the socket opens.
    pub hello_timeout: Duration,
    /// Subscribe to presence for the whole roster right after connecting.
    pub subscribe_roster_presence: bool,
}

impl Default for RtmClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: RtmDefaults::CONNECT_TIMEOUT,
            handshake_timeout: RtmDefaults::HANDSHAKE_TIMEOUT,
            hello_timeout: RtmDefaults::HELLO_TIMEOUT,
            subscribe_roster_presence: RtmDefaults::SUBSCRIBE_ROSTER_PRESENCE,
        }
    }
}

/// Entry point for creating sessions.
#[derive(Clone)]
pub struct RtmClient {
    token: SecretString,
    local: bool,
    api_base_override: Option<String>,
    proxy: Option<ProxySettings>,
    options: RtmClientOptions,
}

impl RtmClient {
    /// Creates a client for the production service.
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            local: false,
            api_base_override: None,
            proxy: None,
            options: RtmClientOptions::default(),
        }
    }

    /// Enables or disables local mode API routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit API base, e.g. `http://127.0.0.1:9000/api`.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        let api_base = api_base.into();
        self.api_base_override = Some(api_base.trim_end().trim_end_matches('/').to_string());
        self
    }

    /// Replaces the timeouts and presence behaviour used by [`connect`](Self::connect).
    pub fn with_options(mut self, options: RtmClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Routes every connection through `proxy`. There is no fallback to a
    /// direct connection when the proxy is unusable.
    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Options applied to the next connect.
    pub fn options(&self) -> &RtmClientOptions {
        &self.options
    }

    /// Configured proxy, if connections are routed through one.
    pub fn proxy(&self) -> Option<&ProxySettings> {
        self.proxy.as_ref()
    }

    /// Opens a session.
    ///
    /// Resolves once the server has greeted the socket. `handlers` are in
    /// place before the first event is read, so nothing pushed right after
    /// the greeting is missed.
    pub async fn connect(&self, handlers: EventHandlers) -> Result<RtmSession, RtmClientError> {
        if let Some(proxy) = self.proxy.as_ref() {
            proxy.authority()?;
        }

        let handshake = self.handshake().await?;
        let url = handshake.url.ok_or_else(|| {
            RtmClientError::Protocol("handshake response missing socket url".to_string())
        })?;
        let myself = handshake.myself.ok_or_else(|| {
            RtmClientError::Protocol("handshake response missing self identity".to_string())
        })?;
        let roster = Roster::from_users(handshake.users.into_iter().map(User::from));
        let state = Arc::new(SessionState::new(
            SelfIdentity {
                id: myself.id,
                name: myself.name,
            },
            roster,
        ));

        let socket = match self.open_greeted_socket(&url).await {
            Ok(socket) => socket,
            Err(err) => {
                state.transition(ConnectionState::Disconnected);
                warn!(event = "session_connect_failed", error = %err);
                return Err(err);
            }
        };
        state.transition(ConnectionState::Connected);

        let pending = Arc::new(PendingRequests::new());
        let dispatcher = Arc::new(Dispatcher::new(
            handlers,
            Arc::clone(&state),
            Arc::clone(&pending),
        ));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        dispatcher.emit_lifecycle(LifecycleEvent::Connected);

        let worker = tokio::spawn(session_worker(
            socket,
            outbound_rx,
            shutdown_rx,
            Arc::clone(&dispatcher),
            Arc::clone(&state),
            Arc::clone(&pending),
        ));

        info!(
            event = "session_connected",
            user = %state.myself().id,
            roster = state.user_count(),
            proxied = self.proxy.is_some()
        );

        let session = RtmSession::from_parts(
            RtmSender::new(outbound_tx),
            state,
            pending,
            dispatcher,
            shutdown_tx,
            worker,
        );

        if self.options.subscribe_roster_presence {
            let ids = session.state().roster_ids();
            session.subscribe_presence_changes(ids)?;
        }

        Ok(session)
    }

    fn api_base(&self) -> &str {
        if let Some(api_base) = self.api_base_override.as_deref() {
            return api_base;
        }
        if self.local {
            LOCAL_RTM_API_BASE_URL
        } else {
            RTM_API_BASE_URL
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{method}", self.api_base())
    }

    fn http_client(&self) -> Result<Client, RtmClientError> {
        let builder = Client::builder().connect_timeout(self.options.connect_timeout);
        let builder = match self.proxy.as_ref() {
            Some(proxy) => builder.proxy(proxy.to_reqwest()?),
            None => builder.no_proxy(),
        };
        builder.build().map_err(RtmClientError::Transport)
    }

    async fn handshake(&self) -> Result<HandshakeResponse, RtmClientError> {
        let endpoint = self.endpoint("rtm.start");
        let request = HandshakeRequest {
            batch_presence_aware: true,
        };

        let response = self
            .http_client()?
            .post(&endpoint)
            .timeout(self.options.handshake_timeout)
            .bearer_auth(self.token.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|err| self.classify_transport(err))?;
        let status = response.status();

        if self.proxy.is_some() && is_proxy_failure_status(status) {
            return Err(RtmClientError::InvalidConfiguration(format!(
                "proxy answered handshake with http {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|err| self.classify_transport(err))?;

        if !status.is_success() {
            return Err(RtmClientError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        let parsed: HandshakeResponse = serde_json::from_str(&body)?;
        if !parsed.ok {
            return Err(RtmClientError::Handshake(
                parsed
                    .error
                    .unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }
        debug!(event = "handshake_ok", users = parsed.users.len());
        Ok(parsed)
    }

    fn classify_transport(&self, err: reqwest::Error) -> RtmClientError {
        match self.proxy.as_ref() {
            Some(proxy) => {
                warn!(event = "proxy_handshake_failed", proxy = %proxy.url(), error = %err);
                RtmClientError::InvalidConfiguration(format!(
                    "handshake through proxy {} failed: {err}",
                    proxy.url()
                ))
            }
            None => RtmClientError::Transport(err),
        }
    }

    async fn open_greeted_socket(&self, url: &str) -> Result<RtmSocket, RtmClientError> {
        let mut socket = self.open_socket(url).await?;
        gate::bounded("hello", self.options.hello_timeout, recv_hello(&mut socket)).await??;
        Ok(socket)
    }

    async fn open_socket(&self, url: &str) -> Result<RtmSocket, RtmClientError> {
        let request = url.into_client_request()?;

        let Some(proxy) = self.proxy.as_ref() else {
            let connect = async { connect_async(request).await.map(|(socket, _)| socket) };
            return Ok(
                gate::bounded("socket_connect", self.options.connect_timeout, connect).await??,
            );
        };

        let (host, port) = socket_authority(request.uri())?;
        let stream = proxy::open_tunnel(proxy, &host, port, self.options.connect_timeout).await?;
        let upgrade = async { client_async_tls(request, stream).await.map(|(socket, _)| socket) };
        match gate::bounded("socket_upgrade", self.options.connect_timeout, upgrade).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(err)) => Err(RtmClientError::InvalidConfiguration(format!(
                "socket upgrade through proxy {} failed: {err}",
                proxy.url()
            ))),
            Err(err) => Err(RtmClientError::InvalidConfiguration(format!(
                "socket upgrade through proxy {} stalled: {err}",
                proxy.url()
            ))),
        }
    }
}

/// Outbound half of a session. Frames are written by the worker in the
/// order they were queued.
#[derive(Clone, Debug)]
pub(crate) struct RtmSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl RtmSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self { tx }
    }

    pub(crate) fn send(&self, message: ClientMessage) -> Result<(), RtmClientError> {
        self.tx
            .send(message)
            .map_err(|_| RtmClientError::SendQueueClosed)
    }
}

/// Errors produced while opening or driving a session.
#[derive(Debug, Error)]
pub enum RtmClientError {
    /// Network options are unusable: a bad proxy URL, or a proxy that is
    /// unreachable or refuses the connection.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Session-start request failed in transport.
    #[error("handshake request failed: {0}")]
    Transport(reqwest::Error),

    #[error("handshake http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Session-start answered with `ok: false`.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound message queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,

    /// The session is not connected.
    #[error("session is not connected")]
    NotConnected,

    /// Protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Timeout(#[from] GateError),
}

impl RtmClientError {
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

fn is_proxy_failure_status(status: StatusCode) -> bool {
    status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
        || status == StatusCode::BAD_GATEWAY
        || status == StatusCode::GATEWAY_TIMEOUT
}

fn socket_authority(uri: &Uri) -> Result<(String, u16), RtmClientError> {
    let host = uri
        .host()
        .ok_or_else(|| RtmClientError::Protocol(format!("socket url {uri} has no host")))?;
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("wss") | Some("https") => 443,
        _ => 80,
    });
    Ok((host.trim_matches(['[', ']']).to_string(), port))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

async fn recv_hello<S>(socket: &mut WebSocketStream<S>) -> Result<(), RtmClientError>
where
    WebSocketStream<S>:
        futures_util::Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return match InboundFrame::classify(&text)? {
                    InboundFrame::Event(ServerEvent::Hello {}) => Ok(()),
                    InboundFrame::Event(ServerEvent::Error { error }) => Err(
                        RtmClientError::Protocol(format!("server error before hello: {}", error.msg)),
                    ),
                    _ => Err(RtmClientError::Protocol(
                        "expected first server message to be hello".to_string(),
                    )),
                };
            }
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(RtmClientError::Protocol(
                    "socket closed before hello".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(RtmClientError::Protocol(
                    "received non-text frame before hello".to_string(),
                ));
            }
            Some(Err(err)) => return Err(RtmClientError::WebSocket(err)),
            None => {
                return Err(RtmClientError::Protocol(
                    "socket ended before hello".to_string(),
                ));
            }
        }
    }
}

enum WorkerExit {
    Shutdown,
    Lost(String),
}

async fn session_worker(
    mut socket: RtmSocket,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
    dispatcher: Arc<Dispatcher>,
    state: Arc<SessionState>,
    pending: Arc<PendingRequests>,
) {
    let exit = loop {
        tokio::select! {
            _ = &mut shutdown_rx => break WorkerExit::Shutdown,
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(client_msg) => {
                        if let Err(err) = send_client_message(&mut socket, &client_msg).await {
                            if let Some(id) = client_msg.correlation_id() {
                                pending.fail(id, RequestError::Disconnected);
                            }
                            break WorkerExit::Lost(format!("send failed: {err}"));
                        }
                    }
                    None => break WorkerExit::Shutdown,
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => dispatcher.handle_text(&text),
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break WorkerExit::Lost("pong failed".to_string());
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "no reason".to_string());
                        break WorkerExit::Lost(format!("closed by server: {reason}"));
                    }
                    Some(Ok(_)) => debug!(event = "non_text_frame_dropped"),
                    Some(Err(err)) => break WorkerExit::Lost(format!("websocket error: {err}")),
                    None => break WorkerExit::Lost("socket ended".to_string()),
                }
            }
        }
    };

    state.transition(ConnectionState::Closing);
    // Later sends fail fast; anything already queued is flushed below.
    outbound_rx.close();
    let reason = match exit {
        WorkerExit::Shutdown => {
            let _ = socket.close(None).await;
            "closed by client".to_string()
        }
        WorkerExit::Lost(reason) => reason,
    };
    let flushed = pending.cancel_all(RequestError::Disconnected);
    state.transition(ConnectionState::Closed);

    info!(event = "session_closed", reason = %reason, flushed);
    dispatcher.emit_lifecycle(LifecycleEvent::Disconnected { reason });
}

async fn send_client_message<S>(
    socket: &mut WebSocketStream<S>,
    message: &ClientMessage,
) -> Result<(), RtmClientError>
where
    WebSocketStream<S>: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use tokio_tungstenite::tungstenite::http::Uri;

    use super::{
        is_proxy_failure_status, socket_authority, summarize_error_body, RtmClient,
        RtmClientOptions, RtmDefaults, LOCAL_RTM_API_BASE_URL, RTM_API_BASE_URL,
    };
    use reqwest::StatusCode;

    fn client() -> RtmClient {
        RtmClient::new(SecretString::new("xoxb-test".to_string()))
    }

    #[test]
    fn rtm_client_uses_production_api_by_default() {
        assert_eq!(client().api_base(), RTM_API_BASE_URL);
        assert_eq!(
            client().endpoint("rtm.start"),
            format!("{RTM_API_BASE_URL}/rtm.start")
        );
    }

    #[test]
    fn rtm_client_uses_local_api_when_enabled() {
        assert_eq!(
            client().with_local_mode(true).api_base(),
            LOCAL_RTM_API_BASE_URL
        );
    }

    #[test]
    fn api_base_override_takes_precedence() {
        let client = client()
            .with_local_mode(true)
            .with_api_base("http://127.0.0.1:9000/api/ ");
        assert_eq!(client.api_base(), "http://127.0.0.1:9000/api");
    }

    #[test]
    fn options_default_from_constants() {
        let options = RtmClientOptions::default();
        assert_eq!(options.connect_timeout, RtmDefaults::CONNECT_TIMEOUT);
        assert_eq!(options.hello_timeout, RtmDefaults::HELLO_TIMEOUT);
        assert!(!options.subscribe_roster_presence);
    }

    #[test]
    fn proxy_class_statuses_are_recognized() {
        assert!(is_proxy_failure_status(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
        ));
        assert!(is_proxy_failure_status(StatusCode::BAD_GATEWAY));
        assert!(!is_proxy_failure_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn socket_authority_defaults_ports_by_scheme() {
        let uri: Uri = "wss://rtm.example.test/ws/abc".parse().expect("uri");
        assert_eq!(
            socket_authority(&uri).expect("authority"),
            ("rtm.example.test".to_string(), 443)
        );
        let uri: Uri = "ws://127.0.0.1:4000/ws".parse().expect("uri");
        assert_eq!(
            socket_authority(&uri).expect("authority"),
            ("127.0.0.1".to_string(), 4000)
        );
    }

    #[test]
    fn error_body_prefers_structured_error() {
        assert_eq!(
            summarize_error_body(r#"{"ok":false,"error":"invalid_auth"}"#),
            "invalid_auth"
        );
        assert_eq!(summarize_error_body("plain failure"), "plain failure");
    }
}
