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
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, RwLock as StdRwLock},
};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use tracing::{debug, info, instrument, trace, warn};

use super::{
    Device, DeviceData, LocalTrust, MasterPubkey, SelfSigningPubkey, TrustResolver,
    UserIdentityData, UserSigningPubkey,
};
use crate::{
    engine_events::{AnomalyKind, EngineEvent, SecurityAnomaly},
    error::OlmResult,
    olm::PrivateCrossSigningIdentity,
    store::{Changes, CryptoStoreError, Store, TrackedUser},
    transport::{CryptoTransport, RetryPolicy},
    types::{requests::KeysQueryResponse, DeviceKeys},
};

/// The devices that changed while handling a key query.
#[derive(Clone, Debug, Default)]
pub struct DeviceChanges {
    /// Devices we didn't know about before.
    pub new: Vec<DeviceData>,
    /// Known devices whose signatures changed.
    pub changed: Vec<DeviceData>,
    /// Devices that disappeared from the server.
    pub deleted: Vec<DeviceData>,
}

impl DeviceChanges {
    fn extend(&mut self, other: DeviceChanges) {
        self.new.extend(other.new);
        self.changed.extend(other.changed);
        self.deleted.extend(other.deleted);
    }

    /// Did anything change.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// The cross-signing identities that changed while handling a key query.
#[derive(Clone, Debug, Default)]
pub struct IdentityChanges {
    /// Identities we didn't know about before.
    pub new: Vec<UserIdentityData>,
    /// Identities whose keys or signatures changed.
    pub changed: Vec<UserIdentityData>,
}

enum DeviceChange {
    New(DeviceData),
    Updated(DeviceData),
    None,
}

/// Keeps the devices and cross-signing identities of the users we share
/// rooms with up to date.
#[derive(Clone, Debug)]
pub struct IdentityManager {
    store: Store,
    transport: Arc<dyn CryptoTransport>,
    retry: RetryPolicy,
    trust: TrustResolver,
    /// The tracked users and their outdated flag.
    tracked_users: Arc<StdRwLock<BTreeMap<OwnedUserId, bool>>>,
}

impl IdentityManager {
    pub fn new(
        store: Store,
        transport: Arc<dyn CryptoTransport>,
        retry: RetryPolicy,
        trust: TrustResolver,
    ) -> Self {
        Self { store, transport, retry, trust, tracked_users: Default::default() }
    }

    fn user_id(&self) -> &UserId {
        self.store.user_id()
    }

    /// The resolver computing the trust of devices.
    pub fn trust(&self) -> &TrustResolver {
        &self.trust
    }

    /// Load the tracked users from the store.
    pub async fn load_tracked_users(&self) -> Result<(), CryptoStoreError> {
        let users = self.store.load_tracked_users().await?;
        let mut tracked = self.tracked_users.write().unwrap();

        for user in users {
            tracked.insert(user.user_id, user.dirty);
        }

        Ok(())
    }

    /// Start tracking the devices of the given users.
    ///
    /// Users we didn't track before are marked as outdated, their devices get
    /// fetched the next time they are needed.
    pub async fn update_tracked_users(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> Result<(), CryptoStoreError> {
        let new_users: Vec<_> = {
            let mut tracked = self.tracked_users.write().unwrap();

            users
                .into_iter()
                .filter_map(|u| {
                    if tracked.contains_key(u) {
                        return None;
                    }
                    tracked.insert(u.to_owned(), true);
                    Some(TrackedUser { user_id: u.to_owned(), dirty: true })
                })
                .collect()
        };

        if !new_users.is_empty() {
            debug!(count = new_users.len(), "Tracking new users");

            let changes = Changes { tracked_users: new_users, ..Default::default() };
            self.store.save_changes(changes).await?;
        }

        Ok(())
    }

    /// Flag the device list of a tracked user as outdated, called when the
    /// server notifies us about a device list change.
    pub async fn mark_outdated(&self, user_id: &UserId) -> Result<(), CryptoStoreError> {
        let changed = match self.tracked_users.write().unwrap().get_mut(user_id) {
            Some(dirty) if !*dirty => {
                *dirty = true;
                true
            }
            _ => false,
        };

        if changed {
            trace!(?user_id, "Marking the device list of a user as outdated");

            let tracked = TrackedUser { user_id: user_id.to_owned(), dirty: true };
            self.store
                .save_changes(Changes { tracked_users: vec![tracked], ..Default::default() })
                .await?;
        }

        Ok(())
    }

    /// Is the device list of the given user outdated.
    pub fn is_outdated(&self, user_id: &UserId) -> bool {
        self.tracked_users.read().unwrap().get(user_id).copied().unwrap_or(false)
    }

    /// Is the given user tracked.
    pub fn is_tracked(&self, user_id: &UserId) -> bool {
        self.tracked_users.read().unwrap().contains_key(user_id)
    }

    /// Get the users whose device lists need to be fetched.
    pub fn users_for_key_query(&self) -> Vec<OwnedUserId> {
        self.tracked_users
            .read()
            .unwrap()
            .iter()
            .filter(|(_, dirty)| **dirty)
            .map(|(u, _)| u.clone())
            .collect()
    }

    /// Fetch the keys of the given users from the server and ingest them.
    #[instrument(skip(self))]
    pub async fn query_keys(
        &self,
        users: &[OwnedUserId],
    ) -> OlmResult<(DeviceChanges, IdentityChanges)> {
        let transport = self.transport.clone();
        let response = self.retry.run("keys_query", || transport.query_keys(users)).await?;

        self.receive_keys_query_response(users, &response).await
    }

    /// Fetch the keys of the users that are outdated, out of the given set.
    async fn refresh_outdated(&self, users: &[&UserId]) -> OlmResult<()> {
        let outdated: Vec<OwnedUserId> =
            users.iter().filter(|u| self.is_outdated(u)).map(|u| (*u).to_owned()).collect();

        if !outdated.is_empty() {
            self.query_keys(&outdated).await?;
        }

        Ok(())
    }

    /// Receive a successful keys query response.
    ///
    /// Returns the devices and identities that are new or changed. Every
    /// queried user is marked as up to date.
    pub async fn receive_keys_query_response(
        &self,
        queried_users: &[OwnedUserId],
        response: &KeysQueryResponse,
    ) -> OlmResult<(DeviceChanges, IdentityChanges)> {
        debug!(
            users = ?response.device_keys.keys().collect::<BTreeSet<_>>(),
            "Handling a keys query response"
        );

        let mut devices = DeviceChanges::default();

        for (user_id, device_map) in &response.device_keys {
            devices.extend(self.update_user_devices(user_id, device_map).await?);
        }

        let (identities, private_identity) = self.handle_cross_signing_keys(response).await?;

        let tracked_users: Vec<_> = {
            let mut tracked = self.tracked_users.write().unwrap();

            queried_users
                .iter()
                .filter_map(|u| {
                    tracked.get_mut(u).map(|dirty| {
                        *dirty = false;
                        TrackedUser { user_id: u.clone(), dirty: false }
                    })
                })
                .collect()
        };

        let changes = Changes {
            devices: devices
                .new
                .iter()
                .chain(&devices.changed)
                .chain(&devices.deleted)
                .cloned()
                .collect(),
            identities: identities.new.iter().chain(&identities.changed).cloned().collect(),
            private_identity,
            tracked_users,
            ..Default::default()
        };

        self.store.save_changes(changes).await?;

        let changed_users: BTreeSet<_> = devices
            .new
            .iter()
            .chain(&devices.changed)
            .chain(&devices.deleted)
            .map(|d| d.user_id().to_owned())
            .chain(identities.new.iter().chain(&identities.changed).map(|i| i.user_id().to_owned()))
            .collect();

        if !changed_users.is_empty() {
            self.trust.clear();

            for user_id in changed_users {
                self.store.emit(EngineEvent::TrustChanged { user_id: Some(user_id) });
            }
        }

        debug!(
            new_devices = devices.new.len(),
            changed_devices = devices.changed.len(),
            deleted_devices = devices.deleted.len(),
            new_identities = identities.new.len(),
            changed_identities = identities.changed.len(),
            "Finished handling of the keys/query response"
        );

        Ok((devices, identities))
    }

    /// Insert or update the devices of a user from a complete device list.
    ///
    /// Devices with an invalid self-signature are dropped, devices whose
    /// identity keys changed keep their stored keys, devices missing from the
    /// list are marked as deleted.
    pub async fn upsert_devices(
        &self,
        user_id: &UserId,
        devices: &BTreeMap<OwnedDeviceId, DeviceKeys>,
    ) -> OlmResult<DeviceChanges> {
        let changes = self.update_user_devices(user_id, devices).await?;

        let devices: Vec<_> = changes
            .new
            .iter()
            .chain(&changes.changed)
            .chain(&changes.deleted)
            .cloned()
            .collect();

        if !devices.is_empty() {
            self.store.save_changes(Changes { devices, ..Default::default() }).await?;
            self.trust.clear();
            self.store.emit(EngineEvent::TrustChanged { user_id: Some(user_id.to_owned()) });
        }

        Ok(changes)
    }

    async fn update_or_create_device(
        &self,
        device_keys: &DeviceKeys,
    ) -> Result<DeviceChange, CryptoStoreError> {
        let user_id = &device_keys.user_id;
        let device_id = &device_keys.device_id;

        let device = match DeviceData::try_from(device_keys) {
            Ok(d) => d,
            Err(error) => {
                warn!(?user_id, ?device_id, ?error, "Dropping a device with an invalid signature");

                self.store.emit(EngineEvent::InvalidDeviceSignature {
                    user_id: user_id.clone(),
                    device_id: device_id.clone(),
                });

                return Ok(DeviceChange::None);
            }
        };

        if let Some(mut stored) = self.store.get_device_data(user_id, device_id).await? {
            if !stored.has_same_identity_keys(device_keys) {
                warn!(
                    ?user_id,
                    ?device_id,
                    "The identity keys of a known device changed, keeping the stored keys"
                );

                self.store.emit(EngineEvent::DeviceKeysChanged {
                    user_id: user_id.clone(),
                    device_id: device_id.clone(),
                });

                return Ok(DeviceChange::None);
            }

            if stored.as_device_keys() == device_keys && !stored.is_deleted() {
                Ok(DeviceChange::None)
            } else {
                stored.update_device_keys(device_keys.clone());
                Ok(DeviceChange::Updated(stored))
            }
        } else if user_id == self.user_id() && device_id == self.store.device_id() {
            // The server must not lie about our own keys.
            let own_keys = self.store.static_account().unsigned_device_keys();

            if device.has_same_identity_keys(&own_keys) {
                let mut device = device;
                device.set_trust_state(LocalTrust::Verified);

                trace!(?user_id, ?device_id, "Adding our own device, marking it as verified");
                Ok(DeviceChange::New(device))
            } else {
                warn!(?user_id, ?device_id, "The server returned wrong keys for our own device");
                Ok(DeviceChange::None)
            }
        } else {
            trace!(?user_id, ?device_id, "Adding a new device to the device store");
            Ok(DeviceChange::New(device))
        }
    }

    async fn update_user_devices(
        &self,
        user_id: &UserId,
        device_map: &BTreeMap<OwnedDeviceId, DeviceKeys>,
    ) -> Result<DeviceChanges, CryptoStoreError> {
        let mut changes = DeviceChanges::default();

        for (device_id, device_keys) in device_map {
            if user_id != device_keys.user_id || *device_id != device_keys.device_id {
                warn!(
                    ?user_id,
                    ?device_id,
                    device_key_user = ?device_keys.user_id,
                    device_key_device_id = ?device_keys.device_id,
                    "Mismatch in the device keys payload",
                );
                continue;
            }

            match self.update_or_create_device(device_keys).await? {
                DeviceChange::New(d) => changes.new.push(d),
                DeviceChange::Updated(d) => changes.changed.push(d),
                DeviceChange::None => (),
            }
        }

        let stored = self.store.get_user_devices_data(user_id).await?;

        for (device_id, mut device) in stored {
            if device_map.contains_key(&device_id) {
                continue;
            }

            if user_id == self.user_id() && device_id == self.store.device_id() {
                warn!(?user_id, ?device_id, "Our own device might have been deleted");
            } else {
                debug!(?user_id, ?device_id, "Marking a device as deleted");
                device.mark_as_deleted();
                changes.deleted.push(device);
            }
        }

        Ok(changes)
    }

    /// Build the public identity of a user out of the keys in a key query
    /// response.
    fn identity_from_response(
        &self,
        user_id: &UserId,
        master_key: &crate::types::CrossSigningKey,
        response: &KeysQueryResponse,
    ) -> Option<UserIdentityData> {
        let master_key = match MasterPubkey::try_from(master_key.clone()) {
            Ok(k) => k,
            Err(error) => {
                warn!(?user_id, ?error, "Invalid master key");
                return None;
            }
        };

        if master_key.user_id() != user_id {
            warn!(?user_id, "The master key belongs to another user");
            return None;
        }

        if let Err(error) = master_key.verify_self_signature() {
            warn!(?user_id, ?error, "The master key has an invalid self-signature");
            self.store.report_anomaly(SecurityAnomaly::new(
                AnomalyKind::InvalidSignature,
                format!("invalid master key self-signature of {user_id}: {error}"),
            ));
            return None;
        }

        let Some(self_signing) = response.self_signing_keys.get(user_id) else {
            warn!(?user_id, "A user is missing their self-signing key");
            return None;
        };

        let self_signing = match SelfSigningPubkey::try_from(self_signing.clone()) {
            Ok(k) => k,
            Err(error) => {
                warn!(?user_id, ?error, "Invalid self-signing key");
                return None;
            }
        };

        let user_signing = if user_id == self.user_id() {
            let user_signing = response.user_signing_keys.get(user_id).cloned();

            match user_signing.map(UserSigningPubkey::try_from).transpose() {
                Ok(k) => k,
                Err(error) => {
                    warn!(?user_id, ?error, "Invalid user-signing key");
                    return None;
                }
            }
        } else {
            None
        };

        match UserIdentityData::new(master_key, self_signing, user_signing) {
            Ok(identity) => Some(identity),
            Err(error) => {
                warn!(?user_id, ?error, "The subkeys of a user aren't signed by their master key");
                self.store.report_anomaly(SecurityAnomaly::new(
                    AnomalyKind::InvalidSignature,
                    format!("invalid cross-signing subkey signature of {user_id}: {error}"),
                ));
                None
            }
        }
    }

    /// Check our public identity against our private one.
    ///
    /// If the master keys don't match our identity was rotated by another
    /// device and the private keys we hold are useless. Returns the cleared
    /// private identity in that case.
    async fn check_private_identity(
        &self,
        identity: &UserIdentityData,
    ) -> Option<PrivateCrossSigningIdentity> {
        let private_identity = self.store.private_identity();
        let private_master = private_identity.master_public_key().await?;

        if &private_master == identity.master_key() {
            None
        } else {
            info!("Our cross-signing identity was rotated, forgetting the private keys");

            private_identity.replace_with(PrivateCrossSigningIdentity::empty(self.user_id())).await;
            Some(private_identity)
        }
    }

    async fn handle_cross_signing_keys(
        &self,
        response: &KeysQueryResponse,
    ) -> Result<(IdentityChanges, Option<PrivateCrossSigningIdentity>), CryptoStoreError> {
        let mut changes = IdentityChanges::default();
        let mut private_identity = None;

        for (user_id, master_key) in &response.master_keys {
            let Some(identity) = self.identity_from_response(user_id, master_key, response) else {
                continue;
            };

            if user_id == self.user_id() {
                private_identity = self.check_private_identity(&identity).await;
            }

            match self.store.get_user_identity(user_id).await? {
                Some(stored) if stored == identity => {}
                Some(_) => {
                    debug!(?user_id, "Updated the cross-signing identity of a user");
                    changes.changed.push(identity);
                }
                None => {
                    debug!(?user_id, "Added the cross-signing identity of a user");
                    changes.new.push(identity);
                }
            }
        }

        Ok((changes, private_identity))
    }

    /// Get a device, refreshing the device list of its owner first if it is
    /// outdated.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> OlmResult<Option<Device>> {
        self.refresh_outdated(&[user_id]).await?;

        let Some(inner) = self.store.get_device_data(user_id, device_id).await? else {
            return Ok(None);
        };

        if inner.is_deleted() {
            return Ok(None);
        }

        let trust_level = self.trust.compute_trust(user_id, device_id).await?;

        Ok(Some(Device { inner, trust_level }))
    }

    /// Get the devices of the given users, outdated device lists are
    /// refreshed first.
    pub async fn devices_for_users(
        &self,
        user_ids: &[&UserId],
    ) -> OlmResult<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Device>>> {
        self.refresh_outdated(user_ids).await?;

        let mut result = BTreeMap::new();

        for user_id in user_ids {
            let mut devices = BTreeMap::new();

            for (device_id, inner) in self.store.get_user_devices_data(user_id).await? {
                let trust_level = self.trust.compute_trust(user_id, &device_id).await?;
                devices.insert(device_id, Device { inner, trust_level });
            }

            result.insert((*user_id).to_owned(), devices);
        }

        Ok(result)
    }

    /// Set the local trust state of a device.
    pub async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> OlmResult<bool> {
        let Some(mut device) = self.store.get_device_data(user_id, device_id).await? else {
            return Ok(false);
        };

        info!(?user_id, ?device_id, ?trust, "Changing the local trust of a device");

        device.set_trust_state(trust);
        self.store.save_changes(Changes { devices: vec![device], ..Default::default() }).await?;

        self.trust.clear();
        self.store.emit(EngineEvent::TrustChanged { user_id: Some(user_id.to_owned()) });

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use futures_util::StreamExt;
    use ruma::{device_id, user_id};

    use super::*;
    use crate::{
        identities::{device::testing::signed_device_keys, TrustLevel},
        test_helpers::MockTransport,
    };

    async fn manager() -> (IdentityManager, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let store = Store::open(
            user_id!("@alice:localhost"),
            device_id!("ALICE"),
            Arc::new(crate::store::MemoryStore::new()),
            crate::store::PickleKey::new(),
        )
        .await
        .unwrap();

        let trust = TrustResolver::new(store.clone());
        let manager = IdentityManager::new(store, transport.clone(), RetryPolicy::default(), trust);

        (manager, transport)
    }

    fn device_map(keys: &[&DeviceKeys]) -> BTreeMap<OwnedDeviceId, DeviceKeys> {
        keys.iter().map(|k| (k.device_id.clone(), (*k).clone())).collect()
    }

    #[tokio::test]
    async fn tracked_users() {
        let (manager, _) = manager().await;
        let bob = user_id!("@bob:localhost");

        assert!(manager.users_for_key_query().is_empty());
        manager.update_tracked_users([bob]).await.unwrap();

        assert!(manager.is_tracked(bob));
        assert!(manager.is_outdated(bob));
        assert_eq!(manager.users_for_key_query(), vec![bob.to_owned()]);

        let response = KeysQueryResponse::default();
        manager.receive_keys_query_response(&[bob.to_owned()], &response).await.unwrap();
        assert!(!manager.is_outdated(bob));

        manager.mark_outdated(bob).await.unwrap();
        assert!(manager.is_outdated(bob));

        // Untracked users aren't marked.
        let carol = user_id!("@carol:localhost");
        manager.mark_outdated(carol).await.unwrap();
        assert!(!manager.is_outdated(carol));
    }

    #[tokio::test]
    async fn devices_are_added_and_deleted() {
        let (manager, _) = manager().await;
        let bob = user_id!("@bob:localhost");

        let (first, _) = signed_device_keys("@bob:localhost", "FIRST");
        let (second, _) = signed_device_keys("@bob:localhost", "SECOND");

        let changes = manager.upsert_devices(bob, &device_map(&[&first, &second])).await.unwrap();
        assert_eq!(changes.new.len(), 2);

        let changes = manager.upsert_devices(bob, &device_map(&[&first])).await.unwrap();
        assert_eq!(changes.deleted.len(), 1);
        assert_eq!(changes.deleted[0].device_id(), "SECOND");

        assert!(manager.get_device(bob, device_id!("SECOND")).await.unwrap().is_none());
        let device = manager.get_device(bob, device_id!("FIRST")).await.unwrap().unwrap();
        assert_eq!(device.trust_level(), TrustLevel::Unverified);
    }

    #[tokio::test]
    async fn changed_device_keys_are_rejected() {
        let (manager, _) = manager().await;
        let bob = user_id!("@bob:localhost");
        let mut events = manager.store.subscribe();

        let (original, _) = signed_device_keys("@bob:localhost", "BOBDEVICE");
        manager.upsert_devices(bob, &device_map(&[&original])).await.unwrap();

        let (replacement, _) = signed_device_keys("@bob:localhost", "BOBDEVICE");
        let changes = manager.upsert_devices(bob, &device_map(&[&replacement])).await.unwrap();
        assert!(changes.is_empty());

        let stored = manager.store.get_device_data(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert_eq!(stored.unwrap().ed25519_key(), original.ed25519_key());

        let mut saw_change = false;
        while let Some(Ok(event)) = events.next().await {
            if let EngineEvent::DeviceKeysChanged { device_id, .. } = event {
                assert_eq!(device_id, "BOBDEVICE");
                saw_change = true;
                break;
            }
        }
        assert!(saw_change);
    }

    #[tokio::test]
    async fn invalid_device_signatures_are_dropped() {
        let (manager, _) = manager().await;
        let bob = user_id!("@bob:localhost");
        let mut events = manager.store.subscribe();

        let (mut keys, _) = signed_device_keys("@bob:localhost", "BOBDEVICE");
        keys.algorithms.clear();

        let changes = manager.upsert_devices(bob, &device_map(&[&keys])).await.unwrap();
        assert!(changes.is_empty());

        let event = events.next().await;
        assert_let!(Some(Ok(EngineEvent::InvalidDeviceSignature { device_id, .. })) = event);
        assert_eq!(device_id, "BOBDEVICE");
    }

    #[tokio::test]
    async fn outdated_users_are_queried() {
        let (manager, transport) = manager().await;
        let bob = user_id!("@bob:localhost");

        let (keys, _) = signed_device_keys("@bob:localhost", "BOBDEVICE");
        transport.add_device_keys(keys);

        manager.update_tracked_users([bob]).await.unwrap();

        let devices = manager.devices_for_users(&[bob]).await.unwrap();
        assert!(devices[bob].contains_key(device_id!("BOBDEVICE")));
        assert!(!manager.is_outdated(bob));
    }

    #[tokio::test]
    async fn cross_signing_identities_are_ingested() {
        let (manager, _) = manager().await;
        let bob = user_id!("@bob:localhost");

        let identity = PrivateCrossSigningIdentity::new(bob.to_owned());
        let upload = identity.as_upload_request().await;

        let mut response = KeysQueryResponse::default();
        response.master_keys.insert(bob.to_owned(), upload.master_key.clone().unwrap());
        response.self_signing_keys.insert(bob.to_owned(), upload.self_signing_key.unwrap());

        let (_, identities) =
            manager.receive_keys_query_response(&[bob.to_owned()], &response).await.unwrap();
        assert_eq!(identities.new.len(), 1);

        // A self-signing key that isn't signed by the master key is refused.
        let other = PrivateCrossSigningIdentity::new(bob.to_owned());
        let other_upload = other.as_upload_request().await;
        response.self_signing_keys.insert(bob.to_owned(), other_upload.self_signing_key.unwrap());

        let (_, identities) =
            manager.receive_keys_query_response(&[bob.to_owned()], &response).await.unwrap();
        assert!(identities.new.is_empty() && identities.changed.is_empty());

        let stored = manager.store.get_user_identity(bob).await.unwrap().unwrap();
        assert_eq!(stored.master_key().as_ref(), &upload.master_key.unwrap());
    }

    #[tokio::test]
    async fn local_trust_changes_the_trust_level() {
        let (manager, _) = manager().await;
        let bob = user_id!("@bob:localhost");

        let (keys, _) = signed_device_keys("@bob:localhost", "BOBDEVICE");
        manager.upsert_devices(bob, &device_map(&[&keys])).await.unwrap();

        let changed =
            manager.set_local_trust(bob, device_id!("BOBDEVICE"), LocalTrust::Verified).await;
        assert!(changed.unwrap());

        let device = manager.get_device(bob, device_id!("BOBDEVICE")).await.unwrap().unwrap();
        assert!(device.is_verified());
    }
}
