//! Inbound frame routing.
//!
//! Every text frame read by the session worker lands here. Replies resolve a
//! pending request; push events fan out to the handlers registered for their
//! kind, in registration order. A failing handler is logged and skipped; it
//! never stops delivery to the handlers after it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use tracing::{debug, warn};

use crate::rtm::correlation::{MessageIdentity, PendingRequests, RequestKind};
use crate::rtm::presence::{PresenceChange, PresenceOrigin, PresenceUpdate};
use crate::rtm::proto::{InboundFrame, MessageTs, Presence, ReplyFrame, ServerEvent};
use crate::rtm::state::SessionState;

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

/// Subscriber callback for events of type `E`.
///
/// Handlers run on the session's receive loop; they get read access to the
/// session (roster, self identity) alongside the event.
pub type Handler<E> = Arc<dyn Fn(&SessionState, &E) -> HandlerResult + Send + Sync>;

/// Chat message pushed by the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    pub channel: String,
    pub user: Option<String>,
    pub text: Option<String>,
    pub ts: Option<MessageTs>,
    pub subtype: Option<String>,
}

/// A message was removed from a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageDeleted {
    pub identity: MessageIdentity,
}

/// Connection lifecycle notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The server greeted the session; requests may flow.
    Connected,
    /// The server announced it is about to drop the connection.
    Goodbye,
    /// The server reported a connection-level error.
    ServerError { code: Option<i64>, message: String },
    /// The session is gone; pending requests were flushed.
    Disconnected { reason: String },
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    Message,
    MessageDeleted,
    PresenceChanged,
    Lifecycle,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Message => "message",
            EventKind::MessageDeleted => "message_deleted",
            EventKind::PresenceChanged => "presence_changed",
            EventKind::Lifecycle => "lifecycle",
        })
    }
}

/// Handler sets keyed by event kind.
///
/// Build one before connecting so that no early event is missed; more
/// handlers can be added on the live session.
///
/// ```rust,no_run
/// use rtm_sdk::rtm::dispatch::EventHandlers;
///
/// let handlers = EventHandlers::new().on_presence_changed(|session, change| {
///     if change.user == session.myself().id {
///         println!("now {}", change.presence);
///     }
///     Ok(())
/// });
/// # let _ = handlers;
/// ```
#[derive(Clone, Default)]
pub struct EventHandlers {
    message: Vec<Handler<MessageEvent>>,
    message_deleted: Vec<Handler<MessageDeleted>>,
    presence_changed: Vec<Handler<PresenceChange>>,
    lifecycle: Vec<Handler<LifecycleEvent>>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("message", &self.message.len())
            .field("message_deleted", &self.message_deleted.len())
            .field("presence_changed", &self.presence_changed.len())
            .field("lifecycle", &self.lifecycle.len())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SessionState, &MessageEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_message(handler);
        self
    }

    pub fn add_message<F>(&mut self, handler: F)
    where
        F: Fn(&SessionState, &MessageEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.message.push(Arc::new(handler));
    }

    pub fn on_message_deleted<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SessionState, &MessageDeleted) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_message_deleted(handler);
        self
    }

    pub fn add_message_deleted<F>(&mut self, handler: F)
    where
        F: Fn(&SessionState, &MessageDeleted) -> HandlerResult + Send + Sync + 'static,
    {
        self.message_deleted.push(Arc::new(handler));
    }

    pub fn on_presence_changed<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SessionState, &PresenceChange) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_presence_changed(handler);
        self
    }

    pub fn add_presence_changed<F>(&mut self, handler: F)
    where
        F: Fn(&SessionState, &PresenceChange) -> HandlerResult + Send + Sync + 'static,
    {
        self.presence_changed.push(Arc::new(handler));
    }

    pub fn on_lifecycle<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SessionState, &LifecycleEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_lifecycle(handler);
        self
    }

    pub fn add_lifecycle<F>(&mut self, handler: F)
    where
        F: Fn(&SessionState, &LifecycleEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.lifecycle.push(Arc::new(handler));
    }

    /// Number of handlers registered for `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Message => self.message.len(),
            EventKind::MessageDeleted => self.message_deleted.len(),
            EventKind::PresenceChanged => self.presence_changed.len(),
            EventKind::Lifecycle => self.lifecycle.len(),
        }
    }
}

pub(crate) struct Dispatcher {
    handlers: RwLock<EventHandlers>,
    state: Arc<SessionState>,
    pending: Arc<PendingRequests>,
}

impl Dispatcher {
    pub(crate) fn new(
        handlers: EventHandlers,
        state: Arc<SessionState>,
        pending: Arc<PendingRequests>,
    ) -> Self {
        Self {
            handlers: RwLock::new(handlers),
            state,
            pending,
        }
    }

    pub(crate) fn register(&self, update: impl FnOnce(&mut EventHandlers)) {
        let mut guard = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        update(&mut guard);
    }

    pub(crate) fn handler_count(&self, kind: EventKind) -> usize {
        self.read_handlers().count(kind)
    }

    /// Decodes one text frame and routes it. Never fails: undecodable and
    /// unrecognized frames are logged and dropped.
    pub(crate) fn handle_text(&self, text: &str) {
        match InboundFrame::classify(text) {
            Ok(frame) => self.handle_frame(frame),
            Err(err) => warn!(event = "frame_decode_failed", error = %err, len = text.len()),
        }
    }

    pub(crate) fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Reply(reply) => self.handle_reply(reply),
            InboundFrame::Event(event) => self.handle_event(event),
            InboundFrame::Unrecognized { kind } => {
                debug!(event = "frame_unrecognized", kind = %kind);
            }
        }
    }

    pub(crate) fn emit_lifecycle(&self, event: LifecycleEvent) {
        let handlers = self.snapshot(|handlers| &handlers.lifecycle);
        self.deliver(EventKind::Lifecycle, &handlers, &event);
    }

    fn handle_reply(&self, reply: ReplyFrame) {
        let Some(resolved) = self.pending.resolve(reply) else {
            return;
        };

        if let RequestKind::SetPresence { presence } = resolved.kind {
            if resolved.ok {
                self.state
                    .presence_tracker()
                    .echoes
                    .acknowledge(resolved.id, presence);
                self.deliver_presence(
                    self.state.myself().id.clone(),
                    presence,
                    PresenceOrigin::Manual,
                );
            } else {
                self.state.presence_tracker().echoes.abandon(resolved.id);
            }
        }
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Hello {} => debug!(event = "duplicate_hello"),
            ServerEvent::Goodbye {} => self.emit_lifecycle(LifecycleEvent::Goodbye),
            ServerEvent::Error { error } => self.emit_lifecycle(LifecycleEvent::ServerError {
                code: error.code,
                message: error.msg,
            }),
            ServerEvent::Message {
                channel,
                subtype,
                deleted_ts: Some(deleted_ts),
                ..
            } if subtype.as_deref() == Some("message_deleted") => {
                let deleted = MessageDeleted {
                    identity: MessageIdentity::new(channel, deleted_ts),
                };
                let handlers = self.snapshot(|handlers| &handlers.message_deleted);
                self.deliver(EventKind::MessageDeleted, &handlers, &deleted);
            }
            ServerEvent::Message {
                channel,
                user,
                text,
                ts,
                subtype,
                ..
            } => {
                let message = MessageEvent {
                    channel,
                    user,
                    text,
                    ts,
                    subtype,
                };
                let handlers = self.snapshot(|handlers| &handlers.message);
                self.deliver(EventKind::Message, &handlers, &message);
            }
            ServerEvent::PresenceChange {
                user,
                users,
                presence,
            } => {
                for id in user.into_iter().chain(users.into_iter().flatten()) {
                    self.deliver_presence(id, presence, PresenceOrigin::Observed);
                }
            }
            ServerEvent::ManualPresenceChange { presence } => {
                let deliver = self.state.presence_tracker().echoes.accept_push(presence);
                if deliver {
                    self.deliver_presence(
                        self.state.myself().id.clone(),
                        presence,
                        PresenceOrigin::Manual,
                    );
                } else {
                    debug!(event = "manual_presence_echo_suppressed", presence = %presence);
                }
            }
            ServerEvent::Unknown => debug!(event = "frame_unrecognized"),
        }
    }

    fn deliver_presence(&self, user: String, presence: Presence, origin: PresenceOrigin) {
        let update = self.state.apply_presence(&user, presence);
        let known_user = update != PresenceUpdate::UnknownUser;
        if !known_user {
            debug!(event = "presence_for_unknown_user", user = %user, presence = %presence);
        }

        let change = PresenceChange {
            user,
            presence,
            origin,
            previous: update.previous(),
            known_user,
        };
        let handlers = self.snapshot(|handlers| &handlers.presence_changed);
        self.deliver(EventKind::PresenceChanged, &handlers, &change);
    }

    fn deliver<E>(&self, kind: EventKind, handlers: &[Handler<E>], event: &E) {
        for (index, handler) in handlers.iter().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(self.state.as_ref(), event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event = "handler_failed", kind = %kind, index, error = %err);
                }
                Err(_) => {
                    warn!(event = "handler_panicked", kind = %kind, index);
                }
            }
        }
    }

    // Handlers are cloned out so a handler may register further handlers.
    fn snapshot<E>(
        &self,
        pick: impl FnOnce(&EventHandlers) -> &Vec<Handler<E>>,
    ) -> Vec<Handler<E>> {
        pick(&self.read_handlers()).clone()
    }

    fn read_handlers(&self) -> RwLockReadGuard<'_, EventHandlers> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::rtm::correlation::{PendingReply, PresenceAck};
    use crate::rtm::presence::{Roster, SelfIdentity, User};
    use crate::rtm::state::ConnectionState;

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            name: id.to_lowercase(),
            real_name: None,
            is_bot: false,
            deleted: false,
            presence: None,
        }
    }

    fn fixture(
        handlers: EventHandlers,
    ) -> (Dispatcher, Arc<SessionState>, Arc<PendingRequests>) {
        let state = Arc::new(SessionState::new(
            SelfIdentity {
                id: "U0".to_string(),
                name: "me".to_string(),
            },
            Roster::from_users(vec![user("U0"), user("U1")]),
        ));
        state.transition(ConnectionState::Connected);
        let pending = Arc::new(PendingRequests::new());
        let dispatcher = Dispatcher::new(handlers, Arc::clone(&state), Arc::clone(&pending));
        (dispatcher, state, pending)
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, EventHandlers) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);
        let handlers = EventHandlers::new()
            .on_presence_changed(move |_, change| {
                first
                    .lock()
                    .expect("lock")
                    .push(format!("a:{}:{}", change.user, change.presence));
                Ok(())
            })
            .on_presence_changed(move |_, change| {
                second
                    .lock()
                    .expect("lock")
                    .push(format!("b:{}:{}", change.user, change.presence));
                Ok(())
            });
        (seen, handlers)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let (seen, handlers) = recorder();
        let (dispatcher, state, _) = fixture(handlers);

        dispatcher.handle_text(r#"{"type":"presence_change","user":"U1","presence":"active"}"#);

        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["a:U1:active".to_string(), "b:U1:active".to_string()]
        );
        assert_eq!(state.presence_of("U1"), Some(Presence::Active));
    }

    #[test]
    fn failing_and_panicking_handlers_are_isolated() {
        let delivered = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&delivered);
        let handlers = EventHandlers::new()
            .on_message(|_, _| Err("boom".into()))
            .on_message(|_, _| panic!("handler bug"))
            .on_message(move |_, _| {
                *counter.lock().expect("lock") += 1;
                Ok(())
            });
        let (dispatcher, _, _) = fixture(handlers);

        let frame = r#"{"type":"message","channel":"C1","user":"U1","text":"hi","ts":"1.000"}"#;
        dispatcher.handle_text(frame);
        dispatcher.handle_text(frame);

        assert_eq!(*delivered.lock().expect("lock"), 2);
    }

    #[test]
    fn batch_presence_fans_out_per_user_without_growing_roster() {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let handlers = EventHandlers::new().on_presence_changed(move |_, change| {
            sink.lock().expect("lock").push(change.clone());
            Ok(())
        });
        let (dispatcher, state, _) = fixture(handlers);

        dispatcher.handle_text(
            r#"{"type":"presence_change","users":["U1","U404"],"presence":"away"}"#,
        );

        let changes = changes.lock().expect("lock");
        assert_eq!(changes.len(), 2);
        assert!(changes[0].known_user);
        assert_eq!(changes[0].origin, PresenceOrigin::Observed);
        assert!(!changes[1].known_user);
        assert_eq!(changes[1].user, "U404");
        assert_eq!(state.user_count(), 2);
        assert!(state.user("U404").is_none());
    }

    #[test]
    fn garbage_and_unknown_frames_are_dropped() {
        let (seen, handlers) = recorder();
        let (dispatcher, _, _) = fixture(handlers);

        dispatcher.handle_text("{{{");
        dispatcher.handle_text(r#"{"type":"team_join","user":{}}"#);
        dispatcher.handle_text(r#"{"type":"presence_change","user":"U1","presence":"active"}"#);

        assert_eq!(seen.lock().expect("lock").len(), 2);
    }

    #[test]
    fn deletion_push_is_routed_to_deleted_handlers() {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deleted);
        let handlers = EventHandlers::new()
            .on_message(|_, _| Err("should not see deletions".into()))
            .on_message_deleted(move |_, event| {
                sink.lock().expect("lock").push(event.identity.clone());
                Ok(())
            });
        let (dispatcher, _, _) = fixture(handlers);

        dispatcher.handle_text(
            r#"{"type":"message","subtype":"message_deleted","channel":"C1","deleted_ts":"1700000000.000100"}"#,
        );

        assert_eq!(
            *deleted.lock().expect("lock"),
            vec![MessageIdentity::new("C1", "1700000000.000100")]
        );
    }

    #[tokio::test]
    async fn presence_ack_synthesizes_one_manual_change() {
        let manual = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&manual);
        let handlers = EventHandlers::new().on_presence_changed(move |_, change| {
            if change.is_manual() {
                sink.lock().expect("lock").push(change.presence);
            }
            Ok(())
        });
        let (dispatcher, state, pending) = fixture(handlers);

        let (id, rx) = pending.register(RequestKind::SetPresence {
            presence: Presence::Away,
        });
        state.presence_tracker().echoes.expect(id, Presence::Away);
        let reply: PendingReply<PresenceAck> = PendingReply::new(id, rx);

        dispatcher.handle_text(&format!(r#"{{"ok":true,"reply_to":{id},"presence":"away"}}"#));
        dispatcher.handle_text(r#"{"type":"manual_presence_change","presence":"away"}"#);

        assert_eq!(
            reply.await.expect("ack"),
            PresenceAck {
                presence: Presence::Away
            }
        );
        assert_eq!(*manual.lock().expect("lock"), vec![Presence::Away]);
        assert_eq!(state.presence_of("U0"), Some(Presence::Away));
    }

    #[test]
    fn manual_change_from_elsewhere_is_delivered() {
        let manual = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&manual);
        let handlers = EventHandlers::new().on_presence_changed(move |session, change| {
            if change.is_manual() && change.user == session.myself().id {
                *sink.lock().expect("lock") += 1;
            }
            Ok(())
        });
        let (dispatcher, _, _) = fixture(handlers);

        dispatcher.handle_text(r#"{"type":"manual_presence_change","presence":"active"}"#);
        assert_eq!(*manual.lock().expect("lock"), 1);
    }

    #[test]
    fn stale_reply_is_ignored() {
        let (dispatcher, _, pending) = fixture(EventHandlers::new());
        dispatcher.handle_text(r#"{"ok":true,"reply_to":77}"#);
        assert_eq!(pending.pending_count(), 0);
    }

    #[test]
    fn events_reach_only_handlers_of_their_kind() {
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let (on_message, on_lifecycle) = (Arc::clone(&kinds), Arc::clone(&kinds));
        let handlers = EventHandlers::new()
            .on_message(move |_, _| {
                on_message.lock().expect("lock").push(EventKind::Message);
                Ok(())
            })
            .on_lifecycle(move |_, _| {
                on_lifecycle.lock().expect("lock").push(EventKind::Lifecycle);
                Ok(())
            });
        let (dispatcher, _, _) = fixture(handlers);

        dispatcher.handle_text(r#"{"type":"message","channel":"C1","user":"U1","text":"hi","ts":"1.0"}"#);
        dispatcher.handle_text(r#"{"type":"goodbye"}"#);

        assert_eq!(
            *kinds.lock().expect("lock"),
            vec![EventKind::Message, EventKind::Lifecycle]
        );
    }

    #[test]
    fn handlers_can_be_added_later() {
        let (dispatcher, _, _) = fixture(EventHandlers::new());
        let hits = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&hits);
        dispatcher.register(move |handlers| {
            handlers.add_lifecycle(move |_, event| {
                if *event == LifecycleEvent::Goodbye {
                    *sink.lock().expect("lock") += 1;
                }
                Ok(())
            });
        });
        assert_eq!(dispatcher.handler_count(EventKind::Lifecycle), 1);

        dispatcher.handle_text(r#"{"type":"goodbye"}"#);
        assert_eq!(*hits.lock().expect("lock"), 1);
    }
}
