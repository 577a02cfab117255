// Copyright 2024 The Matrix.org Foundation C.I.C.
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

//! An in-memory homeserver that several engines can share in tests.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use ruma::{device_id, user_id, DeviceId, OwnedDeviceId, OwnedUserId, RoomId, UserId};

use crate::{
    identities::{IdentityManager, TrustResolver},
    session_manager::SessionManager,
    store::{MemoryStore, PickleKey, Store},
    transport::{CryptoTransport, RetryPolicy, TransportError},
    types::{
        backup::{BackupVersion, KeyBackupData, RoomKeyBackup, RoomKeyBackupInfo},
        events::ToDeviceEvent,
        requests::{
            KeysClaimResponse, KeysQueryResponse, KeysUploadRequest, SignatureUploadRequest,
            ToDeviceRequest, UploadSigningKeysRequest,
        },
        CrossSigningKey, DeviceKeys, SignedKey,
    },
};

#[derive(Debug, Default)]
struct ServerState {
    device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,
    one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<String, SignedKey>>>,
    master_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    self_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    user_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    inboxes: BTreeMap<(OwnedUserId, OwnedDeviceId), Vec<ToDeviceEvent>>,
    backup: Option<BackupVersion>,
    backup_counter: u64,
    room_keys: RoomKeyBackup,
}

impl ServerState {
    fn check_version(&self, version: &str) -> Result<(), TransportError> {
        match &self.backup {
            Some(backup) if backup.version == version => Ok(()),
            _ => Err(TransportError::WrongBackupVersion(version.to_owned())),
        }
    }

    fn key_count(&self) -> u64 {
        self.room_keys.values().map(|r| r.len() as u64).sum()
    }
}

/// The state every [`MockTransport`] connected to it shares.
#[derive(Debug, Default)]
pub(crate) struct MockHomeserver {
    state: StdMutex<ServerState>,
}

/// A [`CryptoTransport`] that talks to a [`MockHomeserver`] as a single
/// device.
#[derive(Debug)]
pub(crate) struct MockTransport {
    server: Arc<MockHomeserver>,
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    failures: AtomicU32,
}

impl MockTransport {
    /// A transport for `@alice:localhost` on a fresh homeserver.
    pub(crate) fn new() -> Self {
        Self::connect(Arc::default(), user_id!("@alice:localhost"), device_id!("ALICE"))
    }

    /// A transport for the given device on the given homeserver.
    pub(crate) fn connect(
        server: Arc<MockHomeserver>,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Self {
        Self {
            server,
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            failures: AtomicU32::new(0),
        }
    }

    /// Publish device keys as if their owner uploaded them.
    pub(crate) fn add_device_keys(&self, keys: DeviceKeys) {
        self.server
            .state
            .lock()
            .unwrap()
            .device_keys
            .entry(keys.user_id.clone())
            .or_default()
            .insert(keys.device_id.clone(), keys);
    }

    /// Make the next `count` requests fail with a timeout.
    pub(crate) fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Take the to-device events that were sent to this device.
    pub(crate) fn to_device_events(&self) -> Vec<ToDeviceEvent> {
        self.server
            .state
            .lock()
            .unwrap()
            .inboxes
            .remove(&(self.user_id.clone(), self.device_id.clone()))
            .unwrap_or_default()
    }

    /// The number of room keys in the current backup.
    pub(crate) fn backed_up_key_count(&self) -> u64 {
        self.server.state.lock().unwrap().key_count()
    }

    /// The master key the server holds for the given user.
    pub(crate) fn master_key(&self, user_id: &UserId) -> Option<CrossSigningKey> {
        self.server.state.lock().unwrap().master_keys.get(user_id).cloned()
    }

    fn check_failure(&self) -> Result<(), TransportError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
            .is_ok();

        if failed {
            Err(TransportError::Timeout)
        } else {
            Ok(())
        }
    }
}

/// Open a store backed by a fresh [`MemoryStore`].
pub(crate) async fn memory_store(user_id: &UserId, device_id: &DeviceId) -> Store {
    Store::open(user_id, device_id, Arc::new(MemoryStore::new()), PickleKey::new()).await.unwrap()
}

/// The components of a single device that published its keys on a
/// [`MockHomeserver`].
#[derive(Debug)]
pub(crate) struct TestDevice {
    pub(crate) store: Store,
    pub(crate) transport: Arc<MockTransport>,
    pub(crate) identities: IdentityManager,
    pub(crate) sessions: SessionManager,
}

impl TestDevice {
    /// Create the device, upload its device keys and a handful of one-time
    /// keys and start tracking `@alice:localhost` and `@bob:localhost`.
    pub(crate) async fn new(
        server: Arc<MockHomeserver>,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Self {
        let transport = Arc::new(MockTransport::connect(server, user_id, device_id));
        let store = memory_store(user_id, device_id).await;

        let request = {
            let mut account = store.account().await;
            account.generate_one_time_keys(5);
            account.keys_for_upload()
        };
        let count = transport.upload_keys(request).await.unwrap();
        store.account().await.receive_keys_upload_response(count);
        store.save_account().await.unwrap();

        let trust = TrustResolver::new(store.clone());
        let identities =
            IdentityManager::new(store.clone(), transport.clone(), RetryPolicy::default(), trust);
        identities
            .update_tracked_users([user_id!("@alice:localhost"), user_id!("@bob:localhost")])
            .await
            .unwrap();

        let sessions = SessionManager::new(
            store.clone(),
            identities.clone(),
            transport.clone(),
            RetryPolicy::default(),
        );

        Self { store, transport, identities, sessions }
    }

    /// Alice and Bob, each with a single device on the same homeserver.
    pub(crate) async fn pair() -> (Self, Self) {
        let server = Arc::new(MockHomeserver::default());
        let alice = Self::new(server.clone(), user_id!("@alice:localhost"), device_id!("ALICE"));
        let alice = alice.await;
        let bob = Self::new(server, user_id!("@bob:localhost"), device_id!("BOB")).await;

        (alice, bob)
    }
}

#[async_trait]
impl CryptoTransport for MockTransport {
    async fn upload_keys(&self, request: KeysUploadRequest) -> Result<u64, TransportError> {
        self.check_failure()?;
        let mut state = self.server.state.lock().unwrap();

        if let Some(device_keys) = request.device_keys {
            state
                .device_keys
                .entry(self.user_id.clone())
                .or_default()
                .insert(self.device_id.clone(), device_keys);
        }

        let keys = state
            .one_time_keys
            .entry(self.user_id.clone())
            .or_default()
            .entry(self.device_id.clone())
            .or_default();
        keys.extend(request.one_time_keys);

        Ok(keys.len() as u64)
    }

    async fn query_keys(
        &self,
        users: &[OwnedUserId],
    ) -> Result<KeysQueryResponse, TransportError> {
        self.check_failure()?;
        let state = self.server.state.lock().unwrap();
        let mut response = KeysQueryResponse::default();

        for user_id in users {
            let devices = state.device_keys.get(user_id).cloned().unwrap_or_default();
            response.device_keys.insert(user_id.clone(), devices);

            if let Some(key) = state.master_keys.get(user_id) {
                response.master_keys.insert(user_id.clone(), key.clone());
            }

            if let Some(key) = state.self_signing_keys.get(user_id) {
                response.self_signing_keys.insert(user_id.clone(), key.clone());
            }

            if *user_id == self.user_id {
                if let Some(key) = state.user_signing_keys.get(user_id) {
                    response.user_signing_keys.insert(user_id.clone(), key.clone());
                }
            }
        }

        Ok(response)
    }

    async fn claim_one_time_keys(
        &self,
        devices: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    ) -> Result<KeysClaimResponse, TransportError> {
        self.check_failure()?;
        let mut state = self.server.state.lock().unwrap();
        let mut response = KeysClaimResponse::default();

        for (user_id, device_ids) in devices {
            for device_id in device_ids {
                let claimed = state
                    .one_time_keys
                    .get_mut(&user_id)
                    .and_then(|d| d.get_mut(&device_id))
                    .and_then(|keys| keys.pop_first());

                if let Some((key_id, key)) = claimed {
                    response
                        .one_time_keys
                        .entry(user_id.clone())
                        .or_default()
                        .insert(device_id, BTreeMap::from([(key_id, key)]));
                }
            }
        }

        Ok(response)
    }

    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError> {
        self.check_failure()?;
        let mut state = self.server.state.lock().unwrap();

        for (user_id, messages) in &request.messages {
            for (device_id, content) in messages {
                state.inboxes.entry((user_id.clone(), device_id.clone())).or_default().push(
                    ToDeviceEvent {
                        sender: self.user_id.clone(),
                        event_type: request.event_type.clone(),
                        content: content.clone(),
                    },
                );
            }
        }

        Ok(())
    }

    async fn create_backup_version(
        &self,
        info: RoomKeyBackupInfo,
    ) -> Result<String, TransportError> {
        self.check_failure()?;
        let mut state = self.server.state.lock().unwrap();

        state.backup_counter += 1;
        let version = state.backup_counter.to_string();

        state.backup = Some(BackupVersion { version: version.clone(), info, count: 0 });
        state.room_keys.clear();

        Ok(version)
    }

    async fn get_backup_version(&self) -> Result<Option<BackupVersion>, TransportError> {
        self.check_failure()?;
        let state = self.server.state.lock().unwrap();

        Ok(state.backup.clone().map(|mut b| {
            b.count = state.key_count();
            b
        }))
    }

    async fn delete_backup_version(&self, version: &str) -> Result<(), TransportError> {
        self.check_failure()?;
        let mut state = self.server.state.lock().unwrap();

        state.check_version(version).map_err(|_| TransportError::NotFound)?;
        state.backup = None;
        state.room_keys.clear();

        Ok(())
    }

    async fn put_room_keys(
        &self,
        version: &str,
        keys: RoomKeyBackup,
    ) -> Result<(), TransportError> {
        self.check_failure()?;
        let mut state = self.server.state.lock().unwrap();
        state.check_version(version)?;

        for (room_id, sessions) in keys {
            state.room_keys.entry(room_id).or_default().extend(sessions);
        }

        Ok(())
    }

    async fn get_room_key(
        &self,
        version: &str,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<KeyBackupData>, TransportError> {
        self.check_failure()?;
        let state = self.server.state.lock().unwrap();
        state.check_version(version)?;

        Ok(state.room_keys.get(room_id).and_then(|r| r.get(session_id)).cloned())
    }

    async fn get_room_keys(&self, version: &str) -> Result<RoomKeyBackup, TransportError> {
        self.check_failure()?;
        let state = self.server.state.lock().unwrap();
        state.check_version(version)?;

        Ok(state.room_keys.clone())
    }

    async fn upload_signing_keys(
        &self,
        request: UploadSigningKeysRequest,
    ) -> Result<(), TransportError> {
        self.check_failure()?;
        let mut state = self.server.state.lock().unwrap();

        if let Some(key) = request.master_key {
            state.master_keys.insert(self.user_id.clone(), key);
        }
        if let Some(key) = request.self_signing_key {
            state.self_signing_keys.insert(self.user_id.clone(), key);
        }
        if let Some(key) = request.user_signing_key {
            state.user_signing_keys.insert(self.user_id.clone(), key);
        }

        Ok(())
    }

    async fn upload_signatures(
        &self,
        request: SignatureUploadRequest,
    ) -> Result<(), TransportError> {
        self.check_failure()?;
        let mut state = self.server.state.lock().unwrap();
        let bad_request =
            |message: &str| TransportError::Server { status: 400, message: message.to_owned() };

        for (user_id, keys) in request.signed_keys {
            for (key_id, signed) in keys {
                let device_id: OwnedDeviceId = key_id.as_str().into();
                let device =
                    state.device_keys.get_mut(&user_id).and_then(|d| d.get_mut(&device_id));

                if let Some(device) = device {
                    let signed: DeviceKeys = serde_json::from_value(signed)
                        .map_err(|_| bad_request("malformed device keys"))?;
                    device.signatures.extend(signed.signatures);
                    continue;
                }

                let master = state
                    .master_keys
                    .get_mut(&user_id)
                    .filter(|k| k.get_first_key().is_some_and(|k| k.to_base64() == key_id));

                if let Some(master) = master {
                    let signed: CrossSigningKey = serde_json::from_value(signed)
                        .map_err(|_| bad_request("malformed master key"))?;
                    master.signatures.extend(signed.signatures);
                } else {
                    return Err(bad_request("unknown key"));
                }
            }
        }

        Ok(())
    }
}
