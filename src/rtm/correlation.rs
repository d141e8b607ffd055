//! Request/response correlation.
//!
//! Every outbound request that expects a reply is stamped with an identifier
//! from a monotonically increasing counter and parked in a table together
//! with its continuation. The receive loop resolves entries by `reply_to`;
//! session close flushes whatever is left.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::rtm::proto::{MessageTs, Presence, ReplyFrame};

/// Channel plus server timestamp; the only handle needed to reference a
/// message later.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageIdentity {
    pub channel: String,
    pub ts: MessageTs,
}

impl MessageIdentity {
    pub fn new(channel: impl Into<String>, ts: impl Into<MessageTs>) -> Self {
        Self {
            channel: channel.into(),
            ts: ts.into(),
        }
    }
}

/// Acknowledgement of a sent message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageSent {
    pub channel: String,
    pub ts: MessageTs,
    pub text: String,
}

impl MessageSent {
    pub fn identity(&self) -> MessageIdentity {
        MessageIdentity::new(self.channel.clone(), self.ts.clone())
    }
}

/// Acknowledgement of a deleted message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletedResponse {
    pub ok: bool,
    pub channel: String,
    pub ts: MessageTs,
}

/// Acknowledgement of a manual presence declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresenceAck {
    pub presence: Presence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pong {
    pub reply_to: u64,
}

/// Typed reply delivered to a continuation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    MessageSent(MessageSent),
    Deleted(DeletedResponse),
    Presence(PresenceAck),
    Pong(Pong),
}

/// What a pending request was, kept so its reply can be typed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    SendMessage { channel: String, text: String },
    DeleteMessage { channel: String, ts: MessageTs },
    SetPresence { presence: Presence },
    Ping,
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::SendMessage { .. } => "send_message",
            RequestKind::DeleteMessage { .. } => "delete_message",
            RequestKind::SetPresence { .. } => "set_presence",
            RequestKind::Ping => "ping",
        }
    }

    fn reply_from(&self, frame: ReplyFrame) -> Result<Reply, RequestError> {
        if !frame.ok {
            return Err(RequestError::Rejected {
                request: self.name(),
                error: frame
                    .error
                    .map(|error| error.msg)
                    .filter(|msg| !msg.is_empty())
                    .unwrap_or_else(|| "unknown_error".to_string()),
            });
        }

        match self {
            RequestKind::SendMessage { channel, text } => {
                let ts = frame.ts.ok_or(RequestError::MalformedReply {
                    request: self.name(),
                    detail: "missing ts",
                })?;
                Ok(Reply::MessageSent(MessageSent {
                    channel: frame.channel.unwrap_or_else(|| channel.clone()),
                    ts,
                    text: frame.text.unwrap_or_else(|| text.clone()),
                }))
            }
            RequestKind::DeleteMessage { channel, ts } => Ok(Reply::Deleted(DeletedResponse {
                ok: true,
                channel: frame.channel.unwrap_or_else(|| channel.clone()),
                ts: frame.ts.unwrap_or_else(|| ts.clone()),
            })),
            RequestKind::SetPresence { presence } => Ok(Reply::Presence(PresenceAck {
                presence: frame.presence.unwrap_or(*presence),
            })),
            RequestKind::Ping => Ok(Reply::Pong(Pong {
                reply_to: frame.reply_to,
            })),
        }
    }
}

/// Failure delivered through a request's own continuation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The session closed before a reply arrived.
    #[error("session disconnected before reply")]
    Disconnected,

    /// The service answered with `ok: false`.
    #[error("{request} rejected: {error}")]
    Rejected {
        request: &'static str,
        error: String,
    },

    /// The reply did not carry what the request needs.
    #[error("{request} reply malformed: {detail}")]
    MalformedReply {
        request: &'static str,
        detail: &'static str,
    },
}

/// Conversion from a [`Reply`] into the concrete acknowledgement a caller
/// awaits.
pub trait FromReply: Sized {
    fn from_reply(reply: Reply) -> Result<Self, RequestError>;
}

macro_rules! impl_from_reply {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl FromReply for $ty {
            fn from_reply(reply: Reply) -> Result<Self, RequestError> {
                match reply {
                    Reply::$variant(value) => Ok(value),
                    _ => Err(RequestError::MalformedReply {
                        request: $name,
                        detail: "reply type mismatch",
                    }),
                }
            }
        }
    };
}

impl_from_reply!(MessageSent, MessageSent, "send_message");
impl_from_reply!(DeletedResponse, Deleted, "delete_message");
impl_from_reply!(PresenceAck, Presence, "set_presence");
impl_from_reply!(Pong, Pong, "ping");

type Continuation = oneshot::Sender<Result<Reply, RequestError>>;

/// Future resolving to the typed reply of one request.
///
/// Returned immediately by send operations; awaiting it is the caller's
/// choice.
#[derive(Debug)]
pub struct PendingReply<T> {
    id: u64,
    rx: oneshot::Receiver<Result<Reply, RequestError>>,
    _reply: PhantomData<fn() -> T>,
}

impl<T> PendingReply<T> {
    pub(crate) fn new(id: u64, rx: oneshot::Receiver<Result<Reply, RequestError>>) -> Self {
        Self {
            id,
            rx,
            _reply: PhantomData,
        }
    }

    /// Correlation identifier stamped on the outbound frame.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> PendingReply<T>
where
    T: FromReply + Send + 'static,
{
    /// Invokes `callback` with the outcome once the reply arrives.
    pub fn on_reply<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<T, RequestError>) + Send + 'static,
    {
        tokio::spawn(async move {
            callback(self.await);
        })
    }
}

impl<T: FromReply> Future for PendingReply<T> {
    type Output = Result<T, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(Ok(reply))) => Poll::Ready(T::from_reply(reply)),
            Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(err)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    continuation: Continuation,
    created_at: Instant,
}

/// Outcome of resolving one entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub id: u64,
    pub kind: RequestKind,
    pub ok: bool,
    pub elapsed: Duration,
}

/// Table of in-flight requests keyed by correlation identifier.
#[derive(Debug)]
pub struct PendingRequests {
    next_id: AtomicU64,
    table: Mutex<HashMap<u64, PendingRequest>>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh identifier and parks a continuation under it.
    pub fn register(
        &self,
        kind: RequestKind,
    ) -> (u64, oneshot::Receiver<Result<Reply, RequestError>>) {
        let (tx, rx) = oneshot::channel();
        // u64 ids are never reused within a session.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(event = "request_registered", id, kind = kind.name());
        self.lock().insert(
            id,
            PendingRequest {
                kind,
                continuation: tx,
                created_at: Instant::now(),
            },
        );
        (id, rx)
    }

    /// Resolves the entry matching `frame.reply_to`.
    ///
    /// Unknown or already-resolved identifiers are a logged no-op and return
    /// `None`.
    pub fn resolve(&self, frame: ReplyFrame) -> Option<Resolved> {
        let id = frame.reply_to;
        let Some(entry) = self.lock().remove(&id) else {
            debug!(event = "stale_correlation", id, ok = frame.ok);
            return None;
        };

        let elapsed = entry.created_at.elapsed();
        let outcome = entry.kind.reply_from(frame);
        let ok = outcome.is_ok();
        debug!(
            event = "request_resolved",
            id,
            kind = entry.kind.name(),
            ok,
            elapsed_ms = elapsed.as_millis() as u64
        );
        // The caller may have dropped its PendingReply; nothing to deliver then.
        let _ = entry.continuation.send(outcome);

        Some(Resolved {
            id,
            kind: entry.kind,
            ok,
            elapsed,
        })
    }

    /// Resolves a single entry with `error`.
    pub fn fail(&self, id: u64, error: RequestError) -> Option<RequestKind> {
        let entry = self.lock().remove(&id)?;
        debug!(event = "request_failed", id, kind = entry.kind.name(), error = %error);
        let _ = entry.continuation.send(Err(error));
        Some(entry.kind)
    }

    /// Resolves every outstanding entry with `error` and clears the table.
    pub fn cancel_all(&self, error: RequestError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!(event = "request_cancelled", id, kind = entry.kind.name(), error = %error);
            let _ = entry.continuation.send(Err(error.clone()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn has_pending(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::rtm::proto::ErrorMsg;

    fn ok_reply(reply_to: u64) -> ReplyFrame {
        ReplyFrame {
            reply_to,
            ok: true,
            channel: None,
            ts: None,
            text: None,
            presence: None,
            error: None,
        }
    }

    fn send_kind(channel: &str) -> RequestKind {
        RequestKind::SendMessage {
            channel: channel.to_string(),
            text: "hello".to_string(),
        }
    }

    #[test]
    fn identifiers_are_unique_and_increasing() {
        let pending = PendingRequests::new();
        let (a, _rx_a) = pending.register(RequestKind::Ping);
        let (b, _rx_b) = pending.register(RequestKind::Ping);
        let (c, _rx_c) = pending.register(RequestKind::Ping);
        assert!(a < b && b < c);
        assert_eq!(pending.pending_count(), 3);
    }

    #[tokio::test]
    async fn resolve_delivers_typed_reply_once() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register(send_kind("C1"));
        let reply: PendingReply<MessageSent> = PendingReply::new(id, rx);

        let mut frame = ok_reply(id);
        frame.ts = Some(MessageTs::from("1700000000.000100"));
        frame.text = Some("hello".to_string());

        let resolved = pending.resolve(frame.clone()).expect("entry resolved");
        assert_eq!(resolved.kind, send_kind("C1"));
        assert!(resolved.ok);
        assert!(pending.resolve(frame).is_none());
        assert!(!pending.has_pending(id));

        let sent = reply.await.expect("message sent");
        assert_eq!(sent.channel, "C1");
        assert_eq!(sent.text, "hello");
        assert_eq!(sent.ts.as_str(), "1700000000.000100");
    }

    #[test]
    fn resolving_unknown_identifier_is_a_no_op() {
        let pending = PendingRequests::new();
        assert!(pending.resolve(ok_reply(999)).is_none());
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn rejected_reply_surfaces_service_error() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register(send_kind("C1"));
        let reply: PendingReply<MessageSent> = PendingReply::new(id, rx);

        let mut frame = ok_reply(id);
        frame.ok = false;
        frame.error = Some(ErrorMsg {
            code: Some(2),
            msg: "message text is missing".to_string(),
        });
        let resolved = pending.resolve(frame).expect("entry resolved");
        assert!(!resolved.ok);

        assert_eq!(
            reply.await,
            Err(RequestError::Rejected {
                request: "send_message",
                error: "message text is missing".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn send_reply_without_ts_is_malformed() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register(send_kind("C1"));
        let reply: PendingReply<MessageSent> = PendingReply::new(id, rx);
        pending.resolve(ok_reply(id));
        assert!(matches!(
            reply.await,
            Err(RequestError::MalformedReply { .. })
        ));
    }

    #[tokio::test]
    async fn send_reply_without_text_keeps_submitted_text() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register(send_kind("C1"));
        let reply: PendingReply<MessageSent> = PendingReply::new(id, rx);
        pending.resolve(ReplyFrame {
            ts: Some(MessageTs::from("1700000000.000100")),
            ..ok_reply(id)
        });

        let sent = reply.await.expect("sent");
        assert_eq!(sent.channel, "C1");
        assert_eq!(sent.text, "hello");
    }

    #[tokio::test]
    async fn delete_reply_falls_back_to_request_identity() {
        let pending = PendingRequests::new();
        let ts = MessageTs::from("1700000000.000200");
        let (id, rx) = pending.register(RequestKind::DeleteMessage {
            channel: "C9".to_string(),
            ts: ts.clone(),
        });
        let reply: PendingReply<DeletedResponse> = PendingReply::new(id, rx);
        pending.resolve(ok_reply(id));

        let deleted = reply.await.expect("deleted");
        assert!(deleted.ok);
        assert_eq!(deleted.channel, "C9");
        assert_eq!(deleted.ts, ts);
    }

    #[tokio::test]
    async fn cancel_all_flushes_with_error() {
        let pending = PendingRequests::new();
        let (id_a, rx_a) = pending.register(RequestKind::Ping);
        let (id_b, rx_b) = pending.register(send_kind("C1"));
        let a: PendingReply<Pong> = PendingReply::new(id_a, rx_a);
        let b: PendingReply<MessageSent> = PendingReply::new(id_b, rx_b);

        assert_eq!(pending.cancel_all(RequestError::Disconnected), 2);
        assert_eq!(pending.pending_count(), 0);
        assert_eq!(a.await, Err(RequestError::Disconnected));
        assert_eq!(b.await, Err(RequestError::Disconnected));
        assert_eq!(pending.cancel_all(RequestError::Disconnected), 0);
    }

    #[tokio::test]
    async fn dropped_table_reads_as_disconnected() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register(RequestKind::Ping);
        let reply: PendingReply<Pong> = PendingReply::new(id, rx);
        drop(pending);
        assert_eq!(reply.await, Err(RequestError::Disconnected));
    }

    #[tokio::test]
    async fn on_reply_invokes_callback() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register(RequestKind::Ping);
        let reply: PendingReply<Pong> = PendingReply::new(id, rx);
        let (tx, done) = oneshot::channel();
        let task = reply.on_reply(move |outcome| {
            let _ = tx.send(outcome);
        });
        pending.resolve(ok_reply(id));
        task.await.expect("callback task");
        assert_eq!(done.await.expect("outcome"), Ok(Pong { reply_to: id }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_cross_wire() {
        const N: u64 = 64;
        let pending = Arc::new(PendingRequests::new());

        let mut registrations = Vec::new();
        for n in 0..N {
            let pending = Arc::clone(&pending);
            registrations.push(tokio::spawn(async move {
                let channel = format!("C{n}");
                let (id, rx) = pending.register(send_kind(&channel));
                (id, channel, PendingReply::<MessageSent>::new(id, rx))
            }));
        }

        let mut replies = Vec::new();
        for task in registrations {
            replies.push(task.await.expect("register task"));
        }
        let ids: HashSet<u64> = replies.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids.len() as u64, N);

        // Resolve from several tasks, odd ids first and in reverse.
        let mut order: Vec<u64> = ids.iter().copied().collect();
        order.sort_by_key(|id| (id % 2 == 0, std::cmp::Reverse(*id)));
        let mut resolvers = Vec::new();
        for chunk in order.chunks(8) {
            let pending = Arc::clone(&pending);
            let chunk = chunk.to_vec();
            resolvers.push(tokio::spawn(async move {
                for id in chunk {
                    let mut frame = ok_reply(id);
                    frame.ts = Some(MessageTs::new(format!("ts-{id}")));
                    frame.text = Some(format!("text-{id}"));
                    assert!(pending.resolve(frame).is_some());
                }
            }));
        }
        for task in resolvers {
            task.await.expect("resolve task");
        }

        for (id, channel, reply) in replies {
            let sent = reply.await.expect("reply");
            assert_eq!(sent.channel, channel);
            assert_eq!(sent.ts.as_str(), format!("ts-{id}"));
            assert_eq!(sent.text, format!("text-{id}"));
        }
        assert_eq!(pending.pending_count(), 0);
    }
}
