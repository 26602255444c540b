//! The two pieces of shared state behind the hub.
//!
//! `PresenceRegistry` is a single map under a reader-writer lock so presence
//! queries take a shared lock and never wait on the hub loop.
//! `MembershipIndex` is sharded (`DashMap`) because joins arrive from every
//! read pump concurrently.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use parking_lot::RwLock;

use parley_core::{ConversationId, UserId};

use crate::session::Session;

/// Result of registering a session.
#[derive(Debug)]
pub struct Registration {
    /// Session previously registered for the same user, if any.
    pub replaced: Option<Session>,
    /// Sessions of every other online user at the moment of registration.
    pub others: Vec<Session>,
}

/// UserId -> live session, at most one per user.
#[derive(Default)]
pub struct PresenceRegistry {
    sessions: RwLock<HashMap<UserId, Session>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session`, replacing any entry for the same user, and return
    /// the other online sessions as one atomic snapshot.
    pub fn register(&self, session: Session) -> Registration {
        let mut sessions = self.sessions.write();
        let others = sessions
            .values()
            .filter(|s| s.user_id != session.user_id)
            .cloned()
            .collect();
        let replaced = sessions.insert(session.user_id.clone(), session);
        Registration { replaced, others }
    }

    /// Remove the entry for `session`'s user only if it still belongs to this
    /// connection. Returns whether anything was removed.
    pub fn unregister(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&session.user_id) {
            Some(current) if current.is_same_connection(session) => {
                sessions.remove(&session.user_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<Session> {
        self.sessions.read().get(user_id).cloned()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.sessions.read().contains_key(user_id)
    }

    /// Online users, sorted for stable output.
    pub fn list_online(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.sessions.read().keys().cloned().collect();
        users.sort();
        users
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Session> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    pub fn online_count(&self) -> usize {
        self.sessions.read().len()
    }
}

/// ConversationId -> users subscribed to its live events. Additive only.
#[derive(Default)]
pub struct MembershipIndex {
    conversations: DashMap<ConversationId, HashSet<UserId>>,
}

impl MembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user_id` to the conversation, creating it on first join.
    /// Returns false if the user was already a member.
    pub fn join(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.conversations
            .entry(conversation_id.clone())
            .or_default()
            .insert(user_id.clone())
    }

    /// Members of a conversation, or `None` if nobody ever joined it.
    pub fn members(&self, conversation_id: &ConversationId) -> Option<Vec<UserId>> {
        self.conversations
            .get(conversation_id)
            .map(|set| set.iter().cloned().collect())
    }

    pub fn is_member(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.conversations
            .get(conversation_id)
            .is_some_and(|set| set.contains(user_id))
    }
}
