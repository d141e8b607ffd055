//! Caller-facing session handle.
//!
//! `RtmSession` wraps the worker started by [`RtmClient::connect`]: it sends
//! correlated requests, manages presence subscriptions, and lets callers
//! register handlers while the session runs. Send operations never block;
//! they return a [`PendingReply`] that resolves when the service answers or
//! with [`RequestError::Disconnected`] once the session is gone.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::rtm::client::{RtmClient, RtmClientError, RtmSender};
use crate::rtm::correlation::{
    DeletedResponse, MessageIdentity, MessageSent, PendingReply, PendingRequests, PresenceAck,
    Pong, RequestError, RequestKind,
};
use crate::rtm::dispatch::{
    Dispatcher, EventHandlers, EventKind, HandlerResult, LifecycleEvent, MessageDeleted,
    MessageEvent,
};
use crate::rtm::presence::{PresenceChange, SelfIdentity, User};
use crate::rtm::proto::{ClientMessage, Presence};
use crate::rtm::state::{ConnectionState, SessionState};

/// One live connection to the realtime service.
///
/// Requests are correlated to their replies and resolve as
/// [`PendingReply`] futures; pushed events go to the registered handlers.
/// The session closes on [`close`](Self::close), on drop, or when the socket
/// is lost, and every request still outstanding then fails with
/// [`RequestError::Disconnected`].
pub struct RtmSession {
    sender: RtmSender,
    state: Arc<SessionState>,
    pending: Arc<PendingRequests>,
    dispatcher: Arc<Dispatcher>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RtmSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtmSession")
            .field("state", &self.state.connection_state())
            .field("myself", self.state.myself())
            .field("pending", &self.pending.pending_count())
            .finish()
    }
}

impl RtmSession {
    /// Connects a new session with `handlers` registered before the first
    /// event.
    pub async fn connect(
        client: &RtmClient,
        handlers: EventHandlers,
    ) -> Result<Self, RtmClientError> {
        client.connect(handlers).await
    }

    pub(crate) fn from_parts(
        sender: RtmSender,
        state: Arc<SessionState>,
        pending: Arc<PendingRequests>,
        dispatcher: Arc<Dispatcher>,
        shutdown: oneshot::Sender<()>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            sender,
            state,
            pending,
            dispatcher,
            shutdown: Mutex::new(Some(shutdown)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    /// Shared session state, the same view handlers receive.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn myself(&self) -> &SelfIdentity {
        self.state.myself()
    }

    /// Snapshot of the roster with the latest known presence per user.
    pub fn users(&self) -> Vec<User> {
        self.state.users()
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.pending_count()
    }

    /// Closes the session. Idempotent.
    ///
    /// Requests still in flight resolve with [`RequestError::Disconnected`],
    /// and lifecycle handlers see a final `Disconnected` event.
    pub async fn close(&self) {
        self.state.transition(ConnectionState::Closing);

        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(event = "session_worker_join_failed", error = %err);
            }
        }

        let flushed = self.pending.cancel_all(RequestError::Disconnected);
        if flushed > 0 {
            debug!(event = "close_flushed_pending", flushed);
        }
        self.state.transition(ConnectionState::Closed);
    }

    /// Posts `text` to `channel`. The reply carries the server timestamp that
    /// identifies the message for later deletion.
    pub fn send_message(
        &self,
        channel: impl Into<String>,
        text: impl Into<String>,
    ) -> PendingReply<MessageSent> {
        let channel = channel.into();
        let text = text.into();
        let (id, rx) = self.pending.register(RequestKind::SendMessage {
            channel: channel.clone(),
            text: text.clone(),
        });
        self.submit(id, ClientMessage::Message { id, channel, text });
        PendingReply::new(id, rx)
    }

    /// Deletes a message previously returned by
    /// [`send_message`](Self::send_message).
    pub fn delete_message(&self, identity: &MessageIdentity) -> PendingReply<DeletedResponse> {
        let (id, rx) = self.pending.register(RequestKind::DeleteMessage {
            channel: identity.channel.clone(),
            ts: identity.ts.clone(),
        });
        self.submit(
            id,
            ClientMessage::MessageDelete {
                id,
                channel: identity.channel.clone(),
                ts: identity.ts.clone(),
            },
        );
        PendingReply::new(id, rx)
    }

    /// Declares this user's presence.
    ///
    /// On acknowledgement, presence handlers see exactly one manual change
    /// for self, even if the service also pushes its own notification.
    pub fn emit_presence(&self, presence: Presence) -> PendingReply<PresenceAck> {
        let (id, rx) = self
            .pending
            .register(RequestKind::SetPresence { presence });
        // Registered before the frame goes out so the ack cannot outrun it.
        self.state.presence_tracker().echoes.expect(id, presence);
        if !self.submit(id, ClientMessage::SetPresence { id, presence }) {
            self.state.presence_tracker().echoes.abandon(id);
        }
        PendingReply::new(id, rx)
    }

    /// Round-trips a ping through the service.
    pub fn ping(&self) -> PendingReply<Pong> {
        let (id, rx) = self.pending.register(RequestKind::Ping);
        self.submit(id, ClientMessage::Ping { id });
        PendingReply::new(id, rx)
    }

    /// Asks the service to push presence changes for `user`.
    ///
    /// Returns `Ok(false)` when `user` was already subscribed; no frame is
    /// sent in that case.
    pub fn subscribe_presence_change(
        &self,
        user: impl Into<String>,
    ) -> Result<bool, RtmClientError> {
        self.subscribe_presence_changes([user.into()])
    }

    /// Batch form of [`subscribe_presence_change`](Self::subscribe_presence_change).
    pub fn subscribe_presence_changes<I, S>(&self, users: I) -> Result<bool, RtmClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.is_connected() {
            return Err(RtmClientError::NotConnected);
        }
        // The service replaces the subscription set on every `presence_sub`,
        // so the full set is sent each time it grows.
        let Some(ids) = self.state.presence_tracker().subscriptions.add(users) else {
            return Ok(false);
        };
        debug!(event = "presence_subscribe", count = ids.len());
        self.sender.send(ClientMessage::PresenceSub { ids })?;
        Ok(true)
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&SessionState, &MessageEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.dispatcher
            .register(|handlers| handlers.add_message(handler));
    }

    pub fn on_message_deleted<F>(&self, handler: F)
    where
        F: Fn(&SessionState, &MessageDeleted) -> HandlerResult + Send + Sync + 'static,
    {
        self.dispatcher
            .register(|handlers| handlers.add_message_deleted(handler));
    }

    pub fn on_presence_changed<F>(&self, handler: F)
    where
        F: Fn(&SessionState, &PresenceChange) -> HandlerResult + Send + Sync + 'static,
    {
        self.dispatcher
            .register(|handlers| handlers.add_presence_changed(handler));
    }

    pub fn on_lifecycle<F>(&self, handler: F)
    where
        F: Fn(&SessionState, &LifecycleEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.dispatcher
            .register(|handlers| handlers.add_lifecycle(handler));
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.dispatcher.handler_count(kind)
    }

    // Returns whether the frame was queued. On failure the request has
    // already been resolved with `Disconnected`.
    fn submit(&self, id: u64, message: ClientMessage) -> bool {
        if !self.is_connected() {
            self.pending.fail(id, RequestError::Disconnected);
            return false;
        }
        if self.sender.send(message).is_err() {
            self.pending.fail(id, RequestError::Disconnected);
            return false;
        }
        true
    }
}

impl Drop for RtmSession {
    fn drop(&mut self) {
        let shutdown = self
            .shutdown
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
    }
}
