//! Session state shared between caller tasks and the receive loop.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use tracing::debug;

use crate::rtm::presence::{PresenceTracker, PresenceUpdate, Roster, SelfIdentity, User};
use crate::rtm::proto::Presence;

/// Connection lifecycle of a single session object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Sessions are single-use: once `Closed`, nothing re-enters `Connected`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Closing)
                | (Connected, Closing)
                | (Closing, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read side of a session handed to event handlers and exposed by
/// [`RtmSession::state`](crate::rtm::session::RtmSession::state).
#[derive(Debug)]
pub struct SessionState {
    connection: RwLock<ConnectionState>,
    myself: SelfIdentity,
    roster: RwLock<Roster>,
    presence: Mutex<PresenceTracker>,
}

impl SessionState {
    pub(crate) fn new(myself: SelfIdentity, roster: Roster) -> Self {
        Self {
            connection: RwLock::new(ConnectionState::Connecting),
            myself,
            roster: RwLock::new(roster),
            presence: Mutex::new(PresenceTracker::default()),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Applies `next` if legal; returns whether the state changed.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut guard = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let current = *guard;
        if !current.can_transition_to(next) {
            return false;
        }
        *guard = next;
        debug!(event = "connection_state", from = %current, to = %next);
        true
    }

    /// The user this session is authenticated as.
    pub fn myself(&self) -> &SelfIdentity {
        &self.myself
    }

    /// Snapshot of the roster.
    pub fn users(&self) -> Vec<User> {
        self.read_roster().users().to_vec()
    }

    pub fn user(&self, id: &str) -> Option<User> {
        self.read_roster().get(id).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.read_roster().len()
    }

    pub fn roster_ids(&self) -> Vec<String> {
        self.read_roster().ids()
    }

    pub fn presence_of(&self, id: &str) -> Option<Presence> {
        self.read_roster().get(id).and_then(|user| user.presence)
    }

    pub fn all_presences_known(&self) -> bool {
        self.read_roster().all_presences_known()
    }

    pub(crate) fn apply_presence(&self, id: &str, presence: Presence) -> PresenceUpdate {
        self.roster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(id, presence)
    }

    pub(crate) fn presence_tracker(&self) -> MutexGuard<'_, PresenceTracker> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_roster(&self) -> RwLockReadGuard<'_, Roster> {
        self.roster.read().unwrap_or_else(PoisonError::into_inner)
    }
}
