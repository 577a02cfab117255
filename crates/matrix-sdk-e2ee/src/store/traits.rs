// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, RoomId, UserId};

use super::{
    BackupKeys, CryptoStoreError, PendingChanges, RoomKeyCounts, RoomSettings, TrackedUser,
};
use crate::{
    identities::{DeviceData, UserIdentityData},
    olm::{
        PickledAccount, PickledCrossSigningIdentity, PickledInboundGroupSession,
        PickledOutboundGroupSession, PickledSession,
    },
};

/// Represents a store that the engine uses to store E2EE data (such as
/// cryptographic keys).
///
/// Secrets only ever reach the store in their pickled, encrypted, form.
#[async_trait]
pub trait CryptoStore: fmt::Debug + Send + Sync {
    /// Load an account that was previously stored.
    async fn load_account(&self) -> Result<Option<PickledAccount>, CryptoStoreError>;

    /// Try to load a private cross signing identity, if one is stored.
    async fn load_identity(
        &self,
    ) -> Result<Option<PickledCrossSigningIdentity>, CryptoStoreError>;

    /// Save the set of changes to the store.
    ///
    /// The changes are applied atomically, either all of them or none are
    /// persisted.
    async fn save_changes(&self, changes: PendingChanges) -> Result<(), CryptoStoreError>;

    /// Get all the sessions that belong to the given sender key.
    async fn get_sessions(&self, sender_key: &str)
        -> Result<Vec<PickledSession>, CryptoStoreError>;

    /// Get all the Olm sessions of the store.
    async fn get_all_sessions(&self) -> Result<Vec<PickledSession>, CryptoStoreError>;

    /// Get the inbound group session with the given sender key and session
    /// id.
    async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<PickledInboundGroupSession>, CryptoStoreError>;

    /// Get all the inbound group sessions that share the given session id,
    /// independent of their sender key.
    async fn get_inbound_group_sessions_with_id(
        &self,
        session_id: &str,
    ) -> Result<Vec<PickledInboundGroupSession>, CryptoStoreError>;

    /// Get all the inbound group sessions we have stored.
    async fn get_inbound_group_sessions(
        &self,
    ) -> Result<Vec<PickledInboundGroupSession>, CryptoStoreError>;

    /// Get the number of inbound group sessions we have and how many of them
    /// are backed up.
    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError>;

    /// Get up to `limit` inbound group sessions that have not been backed up
    /// yet.
    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<PickledInboundGroupSession>, CryptoStoreError>;

    /// Mark the given inbound group sessions, identified by their sender key
    /// and session id, as backed up.
    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        sessions: &[(String, String)],
    ) -> Result<(), CryptoStoreError>;

    /// Reset the backup state of all the stored inbound group sessions.
    async fn reset_backup_state(&self) -> Result<(), CryptoStoreError>;

    /// Get the outbound group session of the given room, if any.
    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<PickledOutboundGroupSession>, CryptoStoreError>;

    /// Get the digest of the ciphertext that consumed the given message index
    /// of a Megolm session.
    async fn get_message_index_digest(
        &self,
        sender_key: &str,
        session_id: &str,
        message_index: u32,
    ) -> Result<Option<String>, CryptoStoreError>;

    /// Remove an inbound group session together with the message index
    /// digests recorded for it.
    ///
    /// Returns true if a session was removed.
    async fn remove_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<bool, CryptoStoreError>;

    /// Load the list of users whose devices we are keeping track of.
    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>, CryptoStoreError>;

    /// Get the device for the given user with the given device ID.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>, CryptoStoreError>;

    /// Get all the devices of the given user.
    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>, CryptoStoreError>;

    /// Get the public cross-signing identity of the given user.
    async fn get_user_identity(
        &self,
        user_id: &UserId,
    ) -> Result<Option<UserIdentityData>, CryptoStoreError>;

    /// Get the backup keys we have stored.
    async fn load_backup_keys(&self) -> Result<BackupKeys, CryptoStoreError>;

    /// Get the settings of the given room.
    async fn get_room_settings(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<RoomSettings>, CryptoStoreError>;
}
