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

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock as StdRwLock,
};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};

use super::{
    BackupKeys, CryptoStore, CryptoStoreError, PendingChanges, RoomKeyCounts, RoomSettings,
    TrackedUser,
};
use crate::{
    identities::{DeviceData, UserIdentityData},
    olm::{
        PickledAccount, PickledCrossSigningIdentity, PickledInboundGroupSession,
        PickledOutboundGroupSession, PickledSession,
    },
};

type SenderKey = String;
type SessionId = String;

#[derive(Debug, Default)]
struct MemoryStoreInner {
    account: Option<PickledAccount>,
    identity: Option<PickledCrossSigningIdentity>,
    sessions: HashMap<SenderKey, BTreeMap<SessionId, PickledSession>>,
    inbound_group_sessions: BTreeMap<(SenderKey, SessionId), PickledInboundGroupSession>,
    outbound_group_sessions: BTreeMap<OwnedRoomId, PickledOutboundGroupSession>,
    message_index_digests: HashMap<(SenderKey, SessionId), BTreeMap<u32, String>>,
    tracked_users: BTreeMap<OwnedUserId, TrackedUser>,
    devices: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceData>>,
    identities: BTreeMap<OwnedUserId, UserIdentityData>,
    backup_keys: BackupKeys,
    room_settings: BTreeMap<OwnedRoomId, RoomSettings>,
}

/// An in-memory only store that will forget all the E2EE key once it's dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: StdRwLock<MemoryStoreInner>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<PickledAccount>, CryptoStoreError> {
        Ok(self.inner.read().unwrap().account.clone())
    }

    async fn load_identity(
        &self,
    ) -> Result<Option<PickledCrossSigningIdentity>, CryptoStoreError> {
        Ok(self.inner.read().unwrap().identity.clone())
    }

    async fn save_changes(&self, changes: PendingChanges) -> Result<(), CryptoStoreError> {
        // A single write guard keeps the whole batch atomic for readers.
        let mut inner = self.inner.write().unwrap();

        if let Some(account) = changes.account {
            inner.account = Some(account);
        }

        if let Some(identity) = changes.private_identity {
            inner.identity = Some(identity);
        }

        for session in changes.sessions {
            inner
                .sessions
                .entry(session.sender_key.to_base64())
                .or_default()
                .insert(session.session_id.clone(), session);
        }

        for session in changes.inbound_group_sessions {
            let key = (session.sender_key.to_base64(), session.session_id.clone());
            inner.inbound_group_sessions.insert(key, session);
        }

        for session in changes.outbound_group_sessions {
            inner.outbound_group_sessions.insert(session.room_id.clone(), session);
        }

        for digest in changes.message_index_digests {
            inner
                .message_index_digests
                .entry((digest.sender_key, digest.session_id))
                .or_default()
                .insert(digest.message_index, digest.digest);
        }

        for device in changes.devices {
            inner
                .devices
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), device);
        }

        for identity in changes.identities {
            inner.identities.insert(identity.user_id().to_owned(), identity);
        }

        for user in changes.tracked_users {
            inner.tracked_users.insert(user.user_id.clone(), user);
        }

        if let Some(backup_keys) = changes.backup_keys {
            inner.backup_keys = backup_keys;
        }

        inner.room_settings.extend(changes.room_settings);

        Ok(())
    }

    async fn get_sessions(
        &self,
        sender_key: &str,
    ) -> Result<Vec<PickledSession>, CryptoStoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .sessions
            .get(sender_key)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_all_sessions(&self) -> Result<Vec<PickledSession>, CryptoStoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .sessions
            .values()
            .flat_map(|s| s.values().cloned())
            .collect())
    }

    async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<PickledInboundGroupSession>, CryptoStoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .inbound_group_sessions
            .get(&(sender_key.to_owned(), session_id.to_owned()))
            .cloned())
    }

    async fn get_inbound_group_sessions_with_id(
        &self,
        session_id: &str,
    ) -> Result<Vec<PickledInboundGroupSession>, CryptoStoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .inbound_group_sessions
            .values()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn get_inbound_group_sessions(
        &self,
    ) -> Result<Vec<PickledInboundGroupSession>, CryptoStoreError> {
        Ok(self.inner.read().unwrap().inbound_group_sessions.values().cloned().collect())
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError> {
        let inner = self.inner.read().unwrap();
        let total = inner.inbound_group_sessions.len();
        let backed_up = inner.inbound_group_sessions.values().filter(|s| s.backed_up).count();

        Ok(RoomKeyCounts { total, backed_up })
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<PickledInboundGroupSession>, CryptoStoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .inbound_group_sessions
            .values()
            .filter(|s| !s.backed_up)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        sessions: &[(String, String)],
    ) -> Result<(), CryptoStoreError> {
        let mut inner = self.inner.write().unwrap();

        for key in sessions {
            if let Some(session) = inner.inbound_group_sessions.get_mut(key) {
                session.backed_up = true;
            }
        }

        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<(), CryptoStoreError> {
        let mut inner = self.inner.write().unwrap();

        for session in inner.inbound_group_sessions.values_mut() {
            session.backed_up = false;
        }

        Ok(())
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<PickledOutboundGroupSession>, CryptoStoreError> {
        Ok(self.inner.read().unwrap().outbound_group_sessions.get(room_id).cloned())
    }

    async fn get_message_index_digest(
        &self,
        sender_key: &str,
        session_id: &str,
        message_index: u32,
    ) -> Result<Option<String>, CryptoStoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .message_index_digests
            .get(&(sender_key.to_owned(), session_id.to_owned()))
            .and_then(|d| d.get(&message_index))
            .cloned())
    }

    async fn remove_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<bool, CryptoStoreError> {
        let mut inner = self.inner.write().unwrap();
        let key = (sender_key.to_owned(), session_id.to_owned());

        inner.message_index_digests.remove(&key);
        Ok(inner.inbound_group_sessions.remove(&key).is_some())
    }

    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>, CryptoStoreError> {
        Ok(self.inner.read().unwrap().tracked_users.values().cloned().collect())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>, CryptoStoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .devices
            .get(user_id)
            .and_then(|d| d.get(device_id))
            .cloned())
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>, CryptoStoreError> {
        Ok(self.inner.read().unwrap().devices.get(user_id).cloned().unwrap_or_default())
    }

    async fn get_user_identity(
        &self,
        user_id: &UserId,
    ) -> Result<Option<UserIdentityData>, CryptoStoreError> {
        Ok(self.inner.read().unwrap().identities.get(user_id).cloned())
    }

    async fn load_backup_keys(&self) -> Result<BackupKeys, CryptoStoreError> {
        Ok(self.inner.read().unwrap().backup_keys.clone())
    }

    async fn get_room_settings(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<RoomSettings>, CryptoStoreError> {
        Ok(self.inner.read().unwrap().room_settings.get(room_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id, user_id};

    use super::*;
    use crate::{
        olm::{Account, InboundGroupSession},
        store::{MessageIndexDigest, PickleKey},
    };

    async fn pickled_inbound(pickle_key: &PickleKey) -> PickledInboundGroupSession {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let (_, inbound) = account
            .create_group_session_pair(room_id!("!test:localhost"), Default::default())
            .await
            .unwrap();

        inbound.pickle(pickle_key).await
    }

    #[tokio::test]
    async fn account_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load_account().await.unwrap().is_none());

        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let pickle = account.pickle(&PickleKey::new());

        let changes = PendingChanges { account: Some(pickle), ..Default::default() };
        store.save_changes(changes).await.unwrap();

        let loaded = store.load_account().await.unwrap().unwrap();
        assert_eq!(loaded.device_id, "ALICE");
    }

    #[tokio::test]
    async fn backup_state_of_group_sessions() {
        let store = MemoryStore::new();
        let pickle_key = PickleKey::new();
        let session = pickled_inbound(&pickle_key).await;
        let key = (session.sender_key.to_base64(), session.session_id.clone());

        let changes =
            PendingChanges { inbound_group_sessions: vec![session], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        assert_eq!(store.inbound_group_session_counts().await.unwrap().backed_up, 0);
        assert_eq!(store.inbound_group_sessions_for_backup(10).await.unwrap().len(), 1);

        store.mark_inbound_group_sessions_as_backed_up(&[key]).await.unwrap();

        let counts = store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 1, backed_up: 1 });
        assert!(store.inbound_group_sessions_for_backup(10).await.unwrap().is_empty());

        store.reset_backup_state().await.unwrap();
        assert_eq!(store.inbound_group_session_counts().await.unwrap().backed_up, 0);
    }

    #[tokio::test]
    async fn group_sessions_by_id() {
        let store = MemoryStore::new();
        let pickle_key = PickleKey::new();
        let session = pickled_inbound(&pickle_key).await;
        let session_id = session.session_id.clone();
        let sender_key = session.sender_key.to_base64();

        let changes =
            PendingChanges { inbound_group_sessions: vec![session], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        assert!(store
            .get_inbound_group_session(&sender_key, &session_id)
            .await
            .unwrap()
            .is_some());
        assert!(store.get_inbound_group_session("other", &session_id).await.unwrap().is_none());
        assert_eq!(store.get_inbound_group_sessions_with_id(&session_id).await.unwrap().len(), 1);

        let loaded = store.get_inbound_group_sessions().await.unwrap().remove(0);
        assert!(InboundGroupSession::from_pickle(&loaded, &pickle_key).is_ok());
    }

    #[tokio::test]
    async fn message_index_digests() {
        let store = MemoryStore::new();
        let digest = MessageIndexDigest {
            sender_key: "sender".to_owned(),
            session_id: "session".to_owned(),
            message_index: 3,
            digest: "digest".to_owned(),
        };

        let changes = PendingChanges { message_index_digests: vec![digest], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        let stored = store.get_message_index_digest("sender", "session", 3).await.unwrap();
        assert_eq!(stored.as_deref(), Some("digest"));
        assert!(store.get_message_index_digest("sender", "session", 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removing_a_group_session_drops_its_digests() {
        let store = MemoryStore::new();
        let session = pickled_inbound(&PickleKey::new()).await;
        let sender_key = session.sender_key.to_base64();
        let session_id = session.session_id.clone();

        let digest = MessageIndexDigest {
            sender_key: sender_key.clone(),
            session_id: session_id.clone(),
            message_index: 0,
            digest: "digest".to_owned(),
        };
        let changes = PendingChanges {
            inbound_group_sessions: vec![session],
            message_index_digests: vec![digest],
            ..Default::default()
        };
        store.save_changes(changes).await.unwrap();

        assert!(store.remove_inbound_group_session(&sender_key, &session_id).await.unwrap());
        assert!(store.get_inbound_group_session(&sender_key, &session_id).await.unwrap().is_none());
        assert!(store
            .get_message_index_digest(&sender_key, &session_id, 0)
            .await
            .unwrap()
            .is_none());

        assert!(!store.remove_inbound_group_session(&sender_key, &session_id).await.unwrap());
    }

    #[tokio::test]
    async fn tracked_users_are_replaced() {
        let store = MemoryStore::new();
        let alice = user_id!("@alice:localhost").to_owned();

        let changes = PendingChanges {
            tracked_users: vec![TrackedUser { user_id: alice.clone(), dirty: true }],
            ..Default::default()
        };
        store.save_changes(changes).await.unwrap();

        let changes = PendingChanges {
            tracked_users: vec![TrackedUser { user_id: alice, dirty: false }],
            ..Default::default()
        };
        store.save_changes(changes).await.unwrap();

        let users = store.load_tracked_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert!(!users[0].dirty);
    }
}
