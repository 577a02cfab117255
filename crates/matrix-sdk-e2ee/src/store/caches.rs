// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Collection of small in-memory stores that cache Olm objects and guard
//! their mutation.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock as StdRwLock},
};

use dashmap::DashMap;
use ruma::{OwnedRoomId, RoomId};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::olm::{OutboundGroupSession, Session};

/// In-memory store for Olm Sessions.
#[derive(Debug, Default, Clone)]
pub struct SessionStore {
    entries: Arc<DashMap<String, Arc<Mutex<Vec<Session>>>>>,
}

impl SessionStore {
    /// Create a new empty Session store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(sessions: &Mutex<Vec<Session>>, session: Session) -> bool {
        let mut sessions = sessions.lock().await;

        if let Some(existing) = sessions.iter_mut().find(|s| s.session_id() == session.session_id())
        {
            *existing = session;
            false
        } else {
            sessions.push(session);
            true
        }
    }

    /// Add a session to the store.
    ///
    /// A session with the same id replaces the stored one. Returns true if
    /// the session was new.
    pub async fn add(&self, session: Session) -> bool {
        let sessions_lock = self
            .entries
            .entry(session.sender_key.to_base64())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();

        Self::insert(&sessions_lock, session).await
    }

    /// Add a session to the store if the sessions of its sender key are
    /// cached.
    ///
    /// Senders that aren't cached are loaded from the backend on first
    /// access, a partial entry would hide their other sessions.
    pub async fn add_if_cached(&self, session: Session) -> bool {
        let Some(sessions_lock) = self.get(&session.sender_key.to_base64()) else {
            return false;
        };

        Self::insert(&sessions_lock, session).await
    }

    /// Get all the sessions that belong to the given sender key.
    pub fn get(&self, sender_key: &str) -> Option<Arc<Mutex<Vec<Session>>>> {
        self.entries.get(sender_key).map(|s| s.clone())
    }

    /// Cache the sessions of a sender key, unless an entry already exists.
    ///
    /// Returns the cached entry.
    pub fn set_for_sender(
        &self,
        sender_key: &str,
        sessions: Vec<Session>,
    ) -> Arc<Mutex<Vec<Session>>> {
        self.entries
            .entry(sender_key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(sessions)))
            .clone()
    }
}

/// In-memory store holding the active outbound group session of each room.
#[derive(Debug, Default, Clone)]
pub struct GroupSessionCache {
    sessions: Arc<DashMap<OwnedRoomId, OutboundGroupSession>>,
}

impl GroupSessionCache {
    /// Get the active session of the given room, if one is cached.
    pub fn get(&self, room_id: &RoomId) -> Option<OutboundGroupSession> {
        self.sessions.get(room_id).map(|s| s.clone())
    }

    /// Cache a session, replacing the previous session of the room.
    pub fn insert(&self, session: OutboundGroupSession) {
        self.sessions.insert(session.room_id().to_owned(), session);
    }

    /// Forget the session of the given room.
    pub fn remove(&self, room_id: &RoomId) -> Option<OutboundGroupSession> {
        self.sessions.remove(room_id).map(|(_, s)| s)
    }
}

/// Per-session locks.
///
/// Olm sessions are keyed by `olm|<user id>|<sender key>`, Megolm sessions by
/// `megolm|<sender key>|<session id>`. Network calls must never be made while
/// one of these locks is held.
#[derive(Debug, Default, Clone)]
pub struct SessionLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    /// The lock key of the Olm sessions we share with the given device key.
    pub fn olm_key(user_id: &str, sender_key: &str) -> String {
        format!("olm|{user_id}|{sender_key}")
    }

    /// The lock key of a Megolm session.
    pub fn megolm_key(sender_key: &str, session_id: &str) -> String {
        format!("megolm|{sender_key}|{session_id}")
    }

    /// The lock key guarding the session cache entry of a sender key.
    ///
    /// Held while the sessions are loaded from the backend and while new
    /// sessions are added to the cache, never while other locks are taken.
    pub fn cache_key(sender_key: &str) -> String {
        format!("cache|{sender_key}")
    }

    fn get_or_create(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_owned()).or_default().clone()
    }

    /// Acquire the lock with the given key.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.get_or_create(key).lock_owned().await
    }

    /// Acquire every lock that was ever handed out.
    ///
    /// Locks are taken in key order so two callers can't deadlock each other.
    pub async fn lock_all(&self) -> Vec<OwnedMutexGuard<()>> {
        let mut locks: Vec<_> =
            self.locks.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        locks.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut guards = Vec::with_capacity(locks.len());

        for (_, lock) in locks {
            guards.push(lock.lock_owned().await);
        }

        guards
    }
}

/// The kind of a stored object that failed to load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QuarantineKind {
    /// An Olm session.
    Session,
    /// An inbound group session.
    InboundGroupSession,
    /// An outbound group session.
    OutboundGroupSession,
}

/// A stored object that couldn't be unpickled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuarantinedEntry {
    /// What kind of object failed to load.
    pub kind: QuarantineKind,
    /// The id of the object.
    pub id: String,
    /// Why loading failed.
    pub reason: String,
}

/// Stored objects that failed to load and are skipped from now on.
#[derive(Debug, Default, Clone)]
pub struct Quarantine {
    entries: Arc<StdRwLock<BTreeMap<(QuarantineKind, String), String>>>,
}

impl Quarantine {
    /// Put an object into quarantine.
    pub fn insert(&self, kind: QuarantineKind, id: &str, reason: impl Into<String>) {
        self.entries.write().unwrap().insert((kind, id.to_owned()), reason.into());
    }

    /// Is the given object quarantined.
    pub fn contains(&self, kind: QuarantineKind, id: &str) -> bool {
        self.entries.read().unwrap().contains_key(&(kind, id.to_owned()))
    }

    /// Get all quarantined objects.
    pub fn entries(&self) -> Vec<QuarantinedEntry> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|((kind, id), reason)| QuarantinedEntry {
                kind: *kind,
                id: id.clone(),
                reason: reason.clone(),
            })
            .collect()
    }

    /// Is the quarantine empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ruma::{device_id, user_id};

    use super::*;
    use crate::olm::Account;

    #[tokio::test]
    async fn sessions_are_replaced_by_id() {
        let alice = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let mut bob = Account::with_device_id(user_id!("@bob:localhost"), device_id!("BOB"));
        bob.generate_one_time_keys(1);

        let bob_device = crate::identities::DeviceData::from_account(&bob);
        let session = alice
            .create_outbound_session(&bob_device, &bob.signed_one_time_keys())
            .unwrap();

        let store = SessionStore::new();
        let sender_key = session.sender_key.to_base64();

        assert!(!store.add_if_cached(session.clone()).await);
        assert!(store.get(&sender_key).is_none());

        assert!(store.add(session.clone()).await);
        assert!(!store.add(session.clone()).await);
        assert!(!store.add_if_cached(session).await);
        assert_eq!(store.get(&sender_key).unwrap().lock().await.len(), 1);
    }

    #[tokio::test]
    async fn loaded_sessions_dont_replace_a_cached_entry() {
        let alice = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let mut bob = Account::with_device_id(user_id!("@bob:localhost"), device_id!("BOB"));
        bob.generate_one_time_keys(2);

        let bob_device = crate::identities::DeviceData::from_account(&bob);
        let one_time_keys = bob.signed_one_time_keys();
        let first = alice.create_outbound_session(&bob_device, &one_time_keys).unwrap();
        let second = alice.create_outbound_session(&bob_device, &one_time_keys).unwrap();
        let sender_key = first.sender_key.to_base64();

        let store = SessionStore::new();
        let cached = store.set_for_sender(&sender_key, vec![first]);
        let loaded = store.set_for_sender(&sender_key, vec![second]);

        assert!(Arc::ptr_eq(&cached, &loaded));
        assert_eq!(loaded.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn session_locks_are_exclusive() {
        let locks = SessionLocks::default();
        let key = SessionLocks::megolm_key("sender", "session");

        let guard = locks.lock(&key).await;
        assert!(tokio::time::timeout(Duration::from_millis(10), locks.lock(&key)).await.is_err());

        drop(guard);
        let guards = locks.lock_all().await;
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn quarantine() {
        let quarantine = Quarantine::default();
        assert!(quarantine.is_empty());

        quarantine.insert(QuarantineKind::Session, "id", "bad pickle");

        assert!(quarantine.contains(QuarantineKind::Session, "id"));
        assert!(!quarantine.contains(QuarantineKind::InboundGroupSession, "id"));
        assert_eq!(quarantine.entries()[0].reason, "bad pickle");
    }
}
