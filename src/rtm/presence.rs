//! Roster and presence bookkeeping.
//!
//! The roster is seeded once from the session handshake; presence traffic
//! only ever updates existing entries; it never adds users.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::rtm::proto::{Presence, UserMsg};

/// Current user of the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfIdentity {
    pub id: String,
    pub name: String,
}

/// Roster entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub real_name: Option<String>,
    pub is_bot: bool,
    pub deleted: bool,
    /// `None` until the first presence observation.
    pub presence: Option<Presence>,
}

impl From<UserMsg> for User {
    fn from(msg: UserMsg) -> Self {
        Self {
            id: msg.id,
            name: msg.name,
            real_name: msg.real_name,
            is_bot: msg.is_bot,
            deleted: msg.deleted,
            presence: msg.presence,
        }
    }
}

/// Where a presence change came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceOrigin {
    /// Pushed by the service after observing the user.
    Observed,
    /// Declared by this session (or another client of the same user).
    Manual,
}

/// Presence-change event delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceChange {
    pub user: String,
    pub presence: Presence,
    pub origin: PresenceOrigin,
    /// Previous presence; `None` when unknown or the user is not in the
    /// roster.
    pub previous: Option<Presence>,
    /// Whether the user is part of the roster.
    pub known_user: bool,
}

impl PresenceChange {
    pub fn is_manual(&self) -> bool {
        self.origin == PresenceOrigin::Manual
    }
}

/// Result of applying one observation to the roster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceUpdate {
    UnknownUser,
    FirstObservation,
    Changed { previous: Presence },
    Unchanged,
}

impl PresenceUpdate {
    pub fn previous(&self) -> Option<Presence> {
        match self {
            PresenceUpdate::Changed { previous } => Some(*previous),
            _ => None,
        }
    }
}

/// Users known to the session, each identifier at most once, in handshake
/// order.
#[derive(Clone, Debug, Default)]
pub struct Roster {
    users: Vec<User>,
    index: HashMap<String, usize>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a roster, keeping the first entry for any repeated identifier.
    pub fn from_users<I>(users: I) -> Self
    where
        I: IntoIterator<Item = User>,
    {
        let mut roster = Self::new();
        for user in users {
            roster.insert(user);
        }
        roster
    }

    /// Inserts a user; returns `false` when the identifier is already present.
    pub fn insert(&mut self, user: User) -> bool {
        if self.index.contains_key(&user.id) {
            return false;
        }
        self.index.insert(user.id.clone(), self.users.len());
        self.users.push(user);
        true
    }

    pub fn get(&self, id: &str) -> Option<&User> {
        self.index.get(id).map(|&slot| &self.users[slot])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn ids(&self) -> Vec<String> {
        self.users.iter().map(|user| user.id.clone()).collect()
    }

    pub fn all_presences_known(&self) -> bool {
        self.users.iter().all(|user| user.presence.is_some())
    }

    /// Records an observed presence for `id`.
    pub fn apply(&mut self, id: &str, presence: Presence) -> PresenceUpdate {
        let Some(&slot) = self.index.get(id) else {
            return PresenceUpdate::UnknownUser;
        };
        let user = &mut self.users[slot];
        let update = match user.presence {
            None => PresenceUpdate::FirstObservation,
            Some(previous) if previous == presence => PresenceUpdate::Unchanged,
            Some(previous) => PresenceUpdate::Changed { previous },
        };
        user.presence = Some(presence);
        update
    }
}

/// Set of users whose presence this session asked the service to push.
#[derive(Clone, Debug, Default)]
pub struct PresenceSubscriptions {
    ids: BTreeSet<String>,
}

impl PresenceSubscriptions {
    /// Adds `ids`; returns the full subscription set when anything was new,
    /// `None` when every id was already subscribed.
    pub fn add<I, S>(&mut self, ids: I) -> Option<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        for id in ids {
            changed |= self.ids.insert(id.into());
        }
        changed.then(|| self.ids.iter().cloned().collect())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
struct AwaitingEcho {
    presence: Presence,
    pushed: bool,
}

/// Keeps self-initiated presence changes to exactly one manual event.
///
/// An emission is acknowledged through its correlated reply, and the
/// service may additionally push `manual_presence_change` for the same
/// transition, before or after the reply. The reply is the one that gets
/// delivered; a matching push on either side of it is swallowed.
///
/// Acknowledged emissions whose push has not arrived yet are queued, one
/// entry per emission. A push matching none of them means the service moved
/// on, so the queue is dropped and the push is delivered.
#[derive(Clone, Debug, Default)]
pub struct ManualEchoes {
    awaiting: HashMap<u64, AwaitingEcho>,
    echoed: VecDeque<Presence>,
}

impl ManualEchoes {
    pub fn expect(&mut self, request_id: u64, presence: Presence) {
        self.awaiting.insert(
            request_id,
            AwaitingEcho {
                presence,
                pushed: false,
            },
        );
    }

    /// Called on acknowledgement, right before the synthesized manual event
    /// is delivered.
    pub fn acknowledge(&mut self, request_id: u64, presence: Presence) {
        let already_pushed = self
            .awaiting
            .remove(&request_id)
            .is_some_and(|entry| entry.pushed);
        if !already_pushed {
            self.echoed.push_back(presence);
        }
    }

    pub fn abandon(&mut self, request_id: u64) {
        self.awaiting.remove(&request_id);
    }

    /// Called for a server-pushed manual change. Returns `true` when it
    /// should be delivered.
    pub fn accept_push(&mut self, presence: Presence) -> bool {
        if let Some(entry) = self
            .awaiting
            .values_mut()
            .find(|entry| entry.presence == presence && !entry.pushed)
        {
            entry.pushed = true;
            return false;
        }
        if let Some(slot) = self.echoed.iter().position(|echo| *echo == presence) {
            self.echoed.remove(slot);
            return false;
        }
        self.echoed.clear();
        true
    }
}

/// Presence state shared between callers and the receive loop.
#[derive(Clone, Debug, Default)]
pub struct PresenceTracker {
    pub subscriptions: PresenceSubscriptions,
    pub echoes: ManualEchoes,
}

/// Counts distinct users seen in presence deliveries.
///
/// Consumers waiting for "every roster user has a presence" should compare
/// [`PresenceCounter::observe`] against the roster size; re-sent changes for
/// an already-counted user do not advance it.
#[derive(Clone, Debug, Default)]
pub struct PresenceCounter {
    seen: HashSet<String>,
}

impl PresenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `change` and returns the number of distinct users observed.
    pub fn observe(&mut self, change: &PresenceChange) -> usize {
        self.seen.insert(change.user.clone());
        self.seen.len()
    }

    pub fn count(&self) -> usize {
        self.seen.len()
    }
}
