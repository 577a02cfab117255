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

use std::sync::Arc;

use as_variant::as_variant;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, trace, warn, Span};
use vodozemac::{
    olm::{IdentityKeys, OlmMessage},
    Curve25519PublicKey, Ed25519PublicKey,
};

use crate::{
    backups::BackupMachine,
    engine_events::{EngineEvent, SecurityAnomaly},
    error::{CrossSigningError, EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    gossiping::GossipMachine,
    identities::{Device, IdentityManager, LocalTrust, TrustLevel, TrustResolver},
    key_export::{ExportedRoomKey, RoomKeyImportResult},
    olm::{
        ciphertext_digest, CrossSigningKeyExport, EncryptionSettings, InboundGroupSession,
        PrivateCrossSigningIdentity,
    },
    session_manager::{GroupSessionManager, SessionManager, ShareResult},
    settings::EngineSettings,
    store::{
        Changes, CryptoStore, CryptoStoreError, ImportOutcome, PickleKey, RoomSettings,
        SessionLocks, Store,
    },
    transport::{CryptoTransport, RetryPolicy},
    types::{
        events::{
            EncryptedContent, EncryptedRoomEvent, ForwardedRoomKeyContent, MegolmV1Content,
            RoomKeyContent, RoomKeyRequestContent, ToDeviceEvent, FORWARDED_ROOM_KEY,
            ROOM_ENCRYPTED, ROOM_KEY, ROOM_KEY_REQUEST,
        },
        requests::{SignatureUploadRequest, ToDeviceRequest},
    },
};

/// How much we trust the device that sent a room event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationState {
    /// The sending device is verified, locally or through cross-signing.
    Trusted,
    /// We know the sending device but nothing vouches for it.
    Untrusted,
    /// We don't know the device that owns the room key.
    UnknownDevice,
    /// The room key was forwarded to us or restored from a backup, we can't
    /// tell who created it.
    Imported,
}

/// A successfully decrypted room event.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The device that owns the room key, if we know it.
    pub sender_device: Option<OwnedDeviceId>,
    /// The type of the decrypted event.
    pub event_type: String,
    /// The content of the decrypted event.
    pub content: Value,
    /// The Megolm message index the event was encrypted at.
    pub message_index: u32,
    /// How much we trust the sender of the event.
    pub verification_state: VerificationState,
}

/// State machine implementation of the Olm/Megolm encryption protocol used for
/// Matrix end to end encryption.
#[derive(Clone)]
pub struct OlmMachine {
    inner: Arc<OlmMachineInner>,
}

struct OlmMachineInner {
    /// Store for the encryption keys.
    /// Persists all the encryption keys so a client can resume the session
    /// without the need to create new keys.
    store: Store,
    settings: EngineSettings,
    transport: Arc<dyn CryptoTransport>,
    retry: RetryPolicy,
    /// State machine handling public user identities and devices, keeping track
    /// of when a key query needs to be done and handling one.
    identities: IdentityManager,
    /// A state machine that handles Olm sessions creation.
    sessions: SessionManager,
    /// A state machine that keeps track of our outbound group sessions.
    group_sessions: GroupSessionManager,
    /// The state machine that is responsible to handle outgoing and incoming
    /// key requests.
    gossip: GossipMachine,
    /// A state machine that handles creating room key backups.
    backup: BackupMachine,
    /// Serializes the processing of to-device batches.
    pipeline: Mutex<()>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .finish()
    }
}

impl OlmMachine {
    /// Create a new `OlmMachine` with the given [`CryptoStore`].
    ///
    /// The account is restored from the store, a new one is created if the
    /// store doesn't contain one. Only a failure to load the account makes
    /// this fail, other broken entries are quarantined.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this machine.
    ///
    /// * `device_id` - The unique id of the device that owns this machine.
    ///
    /// * `backend` - A `CryptoStore` implementation that will be used to
    ///   store the encryption keys.
    ///
    /// * `pickle_key` - The key that encrypts every secret in the store.
    ///
    /// * `transport` - The connection to the homeserver.
    #[instrument(skip(backend, pickle_key, transport, settings))]
    pub async fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        backend: Arc<dyn CryptoStore>,
        pickle_key: PickleKey,
        transport: Arc<dyn CryptoTransport>,
        settings: EngineSettings,
    ) -> Result<Self, CryptoStoreError> {
        let store = Store::open(user_id, device_id, backend, pickle_key).await?;
        let retry = RetryPolicy::new(settings.retry.clone());

        let trust = TrustResolver::new(store.clone());
        let identities =
            IdentityManager::new(store.clone(), transport.clone(), retry.clone(), trust);
        identities.load_tracked_users().await?;
        identities.update_tracked_users([user_id]).await?;

        let sessions = SessionManager::new(
            store.clone(),
            identities.clone(),
            transport.clone(),
            retry.clone(),
        );
        let group_sessions =
            GroupSessionManager::new(store.clone(), identities.clone(), sessions.clone());
        let gossip = GossipMachine::new(
            store.clone(),
            identities.clone(),
            sessions.clone(),
            settings.gossip.clone(),
        );
        let backup = BackupMachine::new(
            store.clone(),
            identities.clone(),
            transport.clone(),
            retry.clone(),
            settings.backup.clone(),
        );

        if let Err(error) = backup.load_from_store().await {
            warn!(?error, "Couldn't restore the state of the room key backup");
        }

        debug!(
            ed25519_key = %store.static_account().identity_keys.ed25519,
            curve25519_key = %store.static_account().identity_keys.curve25519,
            "Created a new OlmMachine"
        );

        Ok(Self {
            inner: Arc::new(OlmMachineInner {
                store,
                settings,
                transport,
                retry,
                identities,
                sessions,
                group_sessions,
                gossip,
                backup,
                pipeline: Mutex::new(()),
            }),
        })
    }

    /// The unique user id that owns this `OlmMachine` instance.
    pub fn user_id(&self) -> &UserId {
        self.inner.store.user_id()
    }

    /// The unique device ID that identifies this `OlmMachine`.
    pub fn device_id(&self) -> &DeviceId {
        self.inner.store.device_id()
    }

    /// Get the public parts of our Olm identity keys.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.inner.store.static_account().identity_keys()
    }

    /// Get the crypto store associated with this `OlmMachine` instance.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// The settings the machine was created with.
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Receive the events the engine publishes, trust changes, backup state
    /// changes and security anomalies.
    pub fn subscribe(&self) -> BroadcastStream<EngineEvent> {
        self.inner.store.subscribe()
    }

    /// Get the backup related state machine.
    pub fn backup_machine(&self) -> &BackupMachine {
        &self.inner.backup
    }

    /// Export the room keys of the sessions the predicate accepts.
    ///
    /// Every key is exported at its first known index. Use
    /// [`encrypt_room_key_export`](crate::key_export::encrypt_room_key_export)
    /// to protect the keys with a passphrase.
    pub async fn export_room_keys(
        &self,
        mut predicate: impl FnMut(&InboundGroupSession) -> bool,
    ) -> OlmResult<Vec<ExportedRoomKey>> {
        self.check_closed()?;

        let sessions = self.inner.store.get_inbound_group_sessions().await?;
        let mut exported = Vec::new();

        for session in sessions.iter().filter(|s| predicate(s)) {
            exported.push(ExportedRoomKey::from_session(session).await);
        }

        info!(count = exported.len(), "Exported room keys");

        Ok(exported)
    }

    /// Import room keys from an export.
    ///
    /// Imported keys are marked as such. Keys we already have in an
    /// equal or better version are left alone and invalid keys are skipped.
    #[instrument(skip_all, fields(total = keys.len()))]
    pub async fn import_room_keys(
        &self,
        keys: Vec<ExportedRoomKey>,
    ) -> OlmResult<RoomKeyImportResult> {
        self.check_closed()?;

        let mut result = RoomKeyImportResult { total: keys.len(), ..Default::default() };

        for key in keys {
            let session = match key.to_session() {
                Ok(session) => session,
                Err(error) => {
                    let session_id = key.session_id.as_str();
                    warn!(room_id = ?key.room_id, session_id, ?error, "Invalid room key");
                    continue;
                }
            };

            match self.inner.store.import_inbound_group_session(session).await {
                Ok(ImportOutcome::Stored) => result.imported += 1,
                Ok(ImportOutcome::Unchanged) => {}
                Err(MegolmError::Store(e)) => return Err(e.into()),
                Err(error) => {
                    warn!(
                        room_id = ?key.room_id,
                        session_id = %key.session_id,
                        ?error,
                        "Rejected a room key"
                    );
                }
            }
        }

        info!(imported = result.imported, "Imported room keys");

        if result.imported > 0 {
            self.inner.backup.room_keys_added();
        }

        Ok(result)
    }

    /// Get the state machine that requests and forwards room keys.
    pub fn gossip_machine(&self) -> &GossipMachine {
        &self.inner.gossip
    }

    /// Has the machine been shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.store.is_closed()
    }

    fn check_closed(&self) -> OlmResult<()> {
        if self.is_closed() {
            Err(OlmError::Closed)
        } else {
            Ok(())
        }
    }

    /// Upload our device keys, if the server doesn't know them yet, and top
    /// up the one-time keys on the server.
    ///
    /// Returns `false` if there was nothing to upload.
    #[instrument(skip_all)]
    pub async fn upload_keys(&self) -> OlmResult<bool> {
        self.check_closed()?;

        let request = {
            let mut account = self.inner.store.account().await;
            account.generate_one_time_keys_if_needed();
            let request = account.keys_for_upload();

            if request.device_keys.is_none() && request.one_time_keys.is_empty() {
                trace!("No keys need to be uploaded");
                return Ok(false);
            }

            request
        };

        let transport = self.inner.transport.clone();
        let count = self.inner.retry.run("keys_upload", || transport.upload_keys(request.clone()));
        let count = count.await?;

        self.inner.store.account().await.receive_keys_upload_response(count);
        self.inner.store.save_account().await?;

        Ok(true)
    }

    /// Start tracking the devices of the given users.
    pub async fn update_tracked_users(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<()> {
        self.check_closed()?;
        Ok(self.inner.identities.update_tracked_users(users).await?)
    }

    /// Flag the device list of a user as outdated, called for device list
    /// updates the server tells us about.
    pub async fn mark_outdated(&self, user_id: &UserId) -> OlmResult<()> {
        self.check_closed()?;
        Ok(self.inner.identities.mark_outdated(user_id).await?)
    }

    /// Fetch the keys of every tracked user whose device list is outdated.
    ///
    /// Returns the number of users that were queried.
    #[instrument(skip_all)]
    pub async fn query_keys(&self) -> OlmResult<usize> {
        self.check_closed()?;

        let users = self.inner.identities.users_for_key_query();

        if users.is_empty() {
            return Ok(0);
        }

        let (devices, identities) = self.inner.identities.query_keys(&users).await?;

        debug!(
            users = users.len(),
            new_devices = devices.new.len(),
            changed_devices = devices.changed.len(),
            deleted_devices = devices.deleted.len(),
            new_identities = identities.new.len(),
            changed_identities = identities.changed.len(),
            "Finished a key query"
        );

        Ok(users.len())
    }

    /// Get a device of a user, its trust level included.
    ///
    /// The device list of the user is refreshed first if it is outdated.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> OlmResult<Option<Device>> {
        self.check_closed()?;
        self.inner.identities.get_device(user_id, device_id).await
    }

    /// Mark a device as verified or blacklisted, or reset its local trust.
    ///
    /// Returns `false` if we don't know the device.
    pub async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> OlmResult<bool> {
        self.check_closed()?;
        self.inner.identities.set_local_trust(user_id, device_id, trust).await
    }

    /// Receive a batch of to-device events from the sync loop.
    ///
    /// Batches are processed one at a time, the events of a batch in the
    /// order they arrived in. Room keys, room key requests and forwarded
    /// room keys are consumed by the machine, every other event is returned,
    /// decrypted if it was encrypted.
    ///
    /// Events that fail to decrypt are logged and dropped, only store
    /// failures abort the batch.
    #[instrument(skip_all, fields(event_count = events.len()))]
    pub async fn receive_to_device_events(
        &self,
        events: Vec<ToDeviceEvent>,
    ) -> OlmResult<Vec<ToDeviceEvent>> {
        let _pipeline = self.inner.pipeline.lock().await;
        self.check_closed()?;

        let mut processed = Vec::with_capacity(events.len());

        for event in events {
            let sender = event.sender.clone();
            let event_type = event.event_type.clone();

            match self.receive_to_device_event(event).await {
                Ok(Some(event)) => processed.push(event),
                Ok(None) => {}
                Err(OlmError::Store(error)) => return Err(error.into()),
                Err(error) => {
                    if let Some(anomaly) = SecurityAnomaly::from_olm_error(&error) {
                        warn!(
                            ?sender,
                            %event_type,
                            ?error,
                            "Rejected a suspicious to-device event"
                        );
                        self.inner.store.report_anomaly(anomaly);
                    } else {
                        warn!(?sender, %event_type, ?error, "Failed to handle a to-device event");
                    }
                }
            }
        }

        Ok(processed)
    }

    async fn receive_to_device_event(
        &self,
        event: ToDeviceEvent,
    ) -> OlmResult<Option<ToDeviceEvent>> {
        match event.event_type.as_str() {
            ROOM_ENCRYPTED => {
                let content = EncryptedContent::from_json(&event.content)?;
                let Some(content) = as_variant!(content, EncryptedContent::OlmV1) else {
                    return Err(EventError::UnsupportedAlgorithm.into());
                };

                let payload =
                    self.inner.sessions.decrypt_to_device(&event.sender, &content).await?;

                trace!(
                    sender = ?payload.sender,
                    sender_device = ?payload.sender_device,
                    event_type = %payload.event_type,
                    "Decrypted a to-device event"
                );

                match payload.event_type.as_str() {
                    ROOM_KEY => {
                        let room_key: RoomKeyContent = serde_json::from_value(payload.content)?;
                        self.receive_room_key(content.sender_key, payload.keys.ed25519, &room_key)
                            .await?;

                        Ok(None)
                    }
                    FORWARDED_ROOM_KEY => {
                        let forwarded: ForwardedRoomKeyContent =
                            serde_json::from_value(payload.content)?;
                        self.receive_forwarded_room_key(
                            &event.sender,
                            content.sender_key,
                            &forwarded,
                        )
                        .await?;

                        Ok(None)
                    }
                    _ => Ok(Some(ToDeviceEvent {
                        sender: payload.sender,
                        event_type: payload.event_type,
                        content: payload.content,
                    })),
                }
            }
            ROOM_KEY_REQUEST => {
                let content: RoomKeyRequestContent = serde_json::from_value(event.content)?;
                self.inner.gossip.receive_incoming_key_request(&event.sender, &content);

                Ok(None)
            }
            _ => Ok(Some(event)),
        }
    }

    #[instrument(
        skip_all,
        fields(room_id = ?content.room_id, session_id = %content.session_id)
    )]
    async fn receive_room_key(
        &self,
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        content: &RoomKeyContent,
    ) -> OlmResult<()> {
        let history_visibility =
            self.inner.store.get_room_settings(&content.room_id).await?.history_visibility;
        let session = InboundGroupSession::from_room_key_content(
            sender_key,
            signing_key,
            content,
            history_visibility,
        )?;

        match self.inner.store.import_inbound_group_session(session).await {
            Ok(outcome) => {
                info!(sender_key = %sender_key.to_base64(), ?outcome, "Received a room key");

                if outcome == ImportOutcome::Stored {
                    self.inner.backup.room_keys_added();
                }

                let gossip = &self.inner.gossip;
                if gossip.request_state(&content.session_id).is_some_and(|s| s.is_outstanding()) {
                    gossip.cancel_key_request(&content.session_id);
                }
            }
            Err(MegolmError::Store(error)) => return Err(error.into()),
            Err(error) => warn!(?error, "Rejected a room key"),
        }

        Ok(())
    }

    async fn receive_forwarded_room_key(
        &self,
        sender: &UserId,
        forwarder_key: Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
    ) -> OlmResult<()> {
        match self.inner.gossip.receive_forwarded_room_key(sender, forwarder_key, content).await {
            Ok(Some(ImportOutcome::Stored)) => self.inner.backup.room_keys_added(),
            Ok(_) => {}
            Err(MegolmError::Store(error)) => return Err(error.into()),
            // The gossip machine already logged and recorded the rejection.
            Err(_) => {}
        }

        Ok(())
    }

    /// Decrypt an Olm message of the given sender.
    ///
    /// The advanced session, and the account if a one-time key was used up,
    /// are persisted before the plaintext is returned.
    pub async fn decrypt_olm(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<String> {
        self.check_closed()?;

        let result = self.inner.sessions.decrypt_olm(sender, sender_key, message).await;

        if let Some(anomaly) = result.as_ref().err().and_then(SecurityAnomaly::from_olm_error) {
            self.inner.store.report_anomaly(anomaly);
        }

        result
    }

    /// Encrypt a to-device event for a single device.
    ///
    /// Returns the content of an `m.room.encrypted` to-device event, an Olm
    /// session is established first if we don't share one with the device.
    pub async fn encrypt_to_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        event_type: &str,
        content: Value,
    ) -> OlmResult<Value> {
        self.check_closed()?;
        self.inner.sessions.encrypt(user_id, device_id, event_type, content).await
    }

    /// Get the settings of the room, defaults are taken from the machine's
    /// settings.
    pub async fn room_settings(&self, room_id: &RoomId) -> OlmResult<RoomSettings> {
        Ok(self.inner.store.get_room_settings(room_id).await?)
    }

    /// Store new settings for a room.
    ///
    /// The outbound group session of the room is rotated the next time the
    /// room key gets shared if the settings changed.
    pub async fn set_room_settings(
        &self,
        room_id: &RoomId,
        settings: RoomSettings,
    ) -> OlmResult<()> {
        self.check_closed()?;

        let changes = Changes {
            room_settings: [(room_id.to_owned(), settings)].into(),
            ..Default::default()
        };
        Ok(self.inner.store.save_changes(changes).await?)
    }

    async fn encryption_settings(&self, room_id: &RoomId) -> OlmResult<EncryptionSettings> {
        let room_settings = self.inner.store.get_room_settings(room_id).await?;
        let mut settings = self.inner.settings.encryption.clone();

        settings.algorithm = room_settings.algorithm;
        settings.only_allow_trusted_devices |= room_settings.only_allow_trusted_devices;

        if let Some(history_visibility) = room_settings.history_visibility {
            settings.history_visibility = history_visibility;
        }

        Ok(settings)
    }

    /// Make sure the given users can decrypt the next event we send to the
    /// room.
    ///
    /// The outbound group session is created or rotated as needed and its
    /// room key is sent to every device that didn't receive it yet. Devices
    /// that won't receive it get an `m.room_key.withheld` notice. A device
    /// counts as served once the request carrying its message was sent, so a
    /// failed send is retried by the next call.
    #[instrument(skip_all, fields(?room_id, users = users.len()))]
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[&UserId],
    ) -> OlmResult<ShareResult> {
        self.check_closed()?;

        let settings = self.encryption_settings(room_id).await?;
        let result = self.inner.group_sessions.share_room_key(room_id, users, settings).await?;

        for request in &result.requests {
            self.send_to_device(request).await?;
            self.inner.group_sessions.mark_request_as_sent(room_id, &request.txn_id).await?;
        }

        Ok(result)
    }

    /// Encrypt a room event with the outbound group session of the room.
    ///
    /// [`OlmMachine::share_room_key`] needs to run first. Returns the content
    /// of an `m.room.encrypted` room event.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<Value> {
        if self.is_closed() {
            return Err(MegolmError::Closed);
        }

        self.inner.group_sessions.encrypt(room_id, event_type, content).await
    }

    /// Invalidate the outbound group session of the room, the next share
    /// creates a new one.
    ///
    /// Returns `true` if a session was invalidated.
    pub async fn discard_room_key(&self, room_id: &RoomId) -> OlmResult<bool> {
        self.check_closed()?;
        self.inner.group_sessions.invalidate_group_session(room_id).await
    }

    /// Decrypt an event from a room timeline.
    ///
    /// If we don't have the room key a key request is queued and
    /// [`MegolmError::UnknownInboundSessionId`] is returned. A key request is
    /// queued as well if we only know the session from a later message
    /// index.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The ID of the room where the event was sent to.
    ///
    /// * `event` - The event that should be decrypted.
    #[instrument(
        skip_all,
        fields(?room_id, sender = ?event.sender, event_id = ?event.event_id, session_id)
    )]
    pub async fn decrypt_room_event(
        &self,
        room_id: &RoomId,
        event: &EncryptedRoomEvent,
    ) -> MegolmResult<DecryptedRoomEvent> {
        if self.is_closed() {
            return Err(MegolmError::Closed);
        }

        let content = EncryptedContent::from_json(&event.content)?;
        let Some(content) = as_variant!(content, EncryptedContent::MegolmV1) else {
            warn!("Received an encrypted room event with an unsupported algorithm");
            return Err(EventError::UnsupportedAlgorithm.into());
        };

        Span::current().record("session_id", content.session_id.as_str());

        let result = self.decrypt_megolm_event(room_id, event, &content).await;

        if let Err(e) = &result {
            if e.is_pending_key() {
                self.request_room_key(room_id, &event.sender, &content).await;
            } else if matches!(
                e,
                MegolmError::MismatchedSender { .. }
                    | MegolmError::EventError(EventError::MismatchedRoom(..))
            ) {
                if let Some(anomaly) = SecurityAnomaly::from_megolm_error(e) {
                    self.inner.store.report_anomaly(anomaly);
                }
            }

            warn!("Failed to decrypt a room event: {e}");
        }

        result
    }

    async fn decrypt_megolm_event(
        &self,
        room_id: &RoomId,
        event: &EncryptedRoomEvent,
        content: &MegolmV1Content,
    ) -> MegolmResult<DecryptedRoomEvent> {
        let store = &self.inner.store;
        let sender_key = content.sender_key.to_base64();

        let Some(session) = store.get_inbound_group_session(&sender_key, &content.session_id).await?
        else {
            // A session with this id from another sender means the event
            // lies about its origin.
            if !store.get_inbound_group_sessions_with_id(&content.session_id).await?.is_empty() {
                return Err(MegolmError::MismatchedSender {
                    session_id: content.session_id.clone(),
                    claimed_sender_key: content.sender_key,
                });
            }

            return Err(MegolmError::UnknownInboundSessionId {
                room_id: room_id.to_owned(),
                sender_key: content.sender_key,
                session_id: content.session_id.clone(),
            });
        };

        if session.room_id() != room_id {
            return Err(EventError::MismatchedRoom(
                session.room_id().to_owned(),
                Some(room_id.to_owned()),
            )
            .into());
        }

        let decrypted = {
            let _guard = store
                .locks()
                .lock(&SessionLocks::megolm_key(&sender_key, &content.session_id))
                .await;

            let decrypted = session.decrypt(content).await?;
            let digest = ciphertext_digest(&content.ciphertext);

            if let Some(entry) = store
                .check_message_index(
                    &sender_key,
                    &content.session_id,
                    decrypted.message_index,
                    digest,
                )
                .await?
            {
                store
                    .save_changes(Changes {
                        message_index_digests: vec![entry],
                        ..Default::default()
                    })
                    .await?;
            }

            decrypted
        };

        let (verification_state, sender_device) =
            self.get_verification_state(&session, &event.sender).await?;

        trace!(
            message_index = decrypted.message_index,
            ?verification_state,
            "Successfully decrypted a room event"
        );

        Ok(DecryptedRoomEvent {
            sender: event.sender.clone(),
            sender_device,
            event_type: decrypted.payload.event_type,
            content: decrypted.payload.content,
            message_index: decrypted.message_index,
            verification_state,
        })
    }

    async fn get_verification_state(
        &self,
        session: &InboundGroupSession,
        sender: &UserId,
    ) -> MegolmResult<(VerificationState, Option<OwnedDeviceId>)> {
        let device =
            self.inner.store.get_device_from_curve_key(sender, session.sender_key()).await?;

        let Some(device) = device else {
            let state = if session.has_been_imported() {
                VerificationState::Imported
            } else {
                VerificationState::UnknownDevice
            };

            return Ok((state, None));
        };

        let device_id = device.device_id().to_owned();

        if session.has_been_imported() {
            return Ok((VerificationState::Imported, Some(device_id)));
        }

        // The device has to own the signing key the room key was sent with.
        if device.ed25519_key() != Some(session.signing_key()) {
            return Ok((VerificationState::Untrusted, Some(device_id)));
        }

        let state = match self.inner.identities.trust().compute_trust(sender, &device_id).await? {
            TrustLevel::Verified => VerificationState::Trusted,
            _ => VerificationState::Untrusted,
        };

        Ok((state, Some(device_id)))
    }

    async fn request_room_key(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        content: &MegolmV1Content,
    ) {
        let request = self.inner.gossip.create_key_request(
            room_id,
            sender,
            content.sender_key,
            &content.session_id,
        );

        match request.await {
            Ok(true) => debug!("Queued a room key request"),
            Ok(false) => {}
            Err(error) => warn!(?error, "Couldn't queue a room key request"),
        }
    }

    /// Send out the queued key requests, their cancellations, and the room
    /// keys we decided to forward to our other devices.
    ///
    /// Returns the number of to-device requests that were sent.
    #[instrument(skip_all)]
    pub async fn send_outgoing_requests(&self) -> OlmResult<usize> {
        self.check_closed()?;

        let gossip = &self.inner.gossip;
        let forwards = gossip.collect_incoming_requests().await?;
        let mut sent = 0;

        for request in &forwards {
            self.send_to_device(request).await?;
            sent += 1;
        }

        for request in gossip.outgoing_requests() {
            self.send_to_device(&request).await?;
            gossip.mark_request_as_sent(&request.txn_id);
            sent += 1;
        }

        Ok(sent)
    }

    async fn send_to_device(&self, request: &ToDeviceRequest) -> OlmResult<()> {
        if request.is_empty() {
            return Ok(());
        }

        let transport = &self.inner.transport;
        self.inner.retry.run("send_to_device", || transport.send_to_device(request)).await?;

        Ok(())
    }

    /// Create a new cross-signing identity and upload it.
    ///
    /// Our own device gets signed by the new self-signing key and the master
    /// key gets a signature of our device key. The private keys are stored.
    #[instrument(skip_all)]
    pub async fn bootstrap_cross_signing(&self) -> Result<(), CrossSigningError> {
        if self.is_closed() {
            return Err(CrossSigningError::Closed);
        }

        let (identity, signing_keys, signatures) = {
            let account = self.inner.store.account().await;
            PrivateCrossSigningIdentity::with_account(&account).await?
        };

        info!("Created a new cross-signing identity");

        let public_identity = identity.to_public_identity().await?;
        let transport = &self.inner.transport;

        self.inner
            .retry
            .run("upload_signing_keys", || transport.upload_signing_keys(signing_keys.clone()))
            .await?;
        self.inner
            .retry
            .run("upload_signatures", || transport.upload_signatures(signatures.clone()))
            .await?;

        identity.mark_as_shared();

        let private_identity = self.inner.store.private_identity();
        private_identity.replace_with(identity).await;

        self.inner
            .store
            .save_changes(Changes {
                private_identity: Some(private_identity),
                identities: vec![public_identity],
                ..Default::default()
            })
            .await?;

        self.cross_signing_changed(self.user_id()).await
    }

    /// Sign one of our own devices with our self-signing key and upload the
    /// signature.
    #[instrument(skip(self))]
    pub async fn sign_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<SignatureUploadRequest, CrossSigningError> {
        if self.is_closed() {
            return Err(CrossSigningError::Closed);
        }

        self.refresh_user(user_id).await;

        let device = self
            .inner
            .store
            .get_device_data(user_id, device_id)
            .await?
            .filter(|d| !d.is_deleted())
            .ok_or_else(|| {
                CrossSigningError::UnknownDevice(user_id.to_owned(), device_id.to_owned())
            })?;

        let request = self.inner.store.private_identity().sign_device(&device).await?;
        self.upload_signatures(&request).await?;
        self.cross_signing_changed(user_id).await?;

        Ok(request)
    }

    /// Sign the master key of another user with our user-signing key and
    /// upload the signature.
    #[instrument(skip(self))]
    pub async fn sign_user(
        &self,
        user_id: &UserId,
    ) -> Result<SignatureUploadRequest, CrossSigningError> {
        if self.is_closed() {
            return Err(CrossSigningError::Closed);
        }

        self.refresh_user(user_id).await;

        let identity = self
            .inner
            .store
            .get_user_identity(user_id)
            .await?
            .ok_or_else(|| CrossSigningError::MissingIdentity(user_id.to_owned()))?;

        let request = self.inner.store.private_identity().sign_user(&identity).await?;
        self.upload_signatures(&request).await?;
        self.cross_signing_changed(user_id).await?;

        Ok(request)
    }

    /// Export the private parts of our cross-signing identity.
    pub async fn export_cross_signing_keys(&self) -> CrossSigningKeyExport {
        self.inner.store.private_identity().export_secrets().await
    }

    async fn upload_signatures(
        &self,
        request: &SignatureUploadRequest,
    ) -> Result<(), CrossSigningError> {
        let transport = &self.inner.transport;
        self.inner
            .retry
            .run("upload_signatures", || transport.upload_signatures(request.clone()))
            .await?;

        Ok(())
    }

    /// Bring the keys of the user up to date if they are outdated, the
    /// stored keys are used if that fails.
    async fn refresh_user(&self, user_id: &UserId) {
        let identities = &self.inner.identities;

        if identities.is_outdated(user_id) {
            if let Err(error) = identities.query_keys(&[user_id.to_owned()]).await {
                warn!(?user_id, ?error, "Couldn't refresh the keys of a user");
            }
        }
    }

    /// Our view of the user's keys changed, fetch them again and forget the
    /// trust we computed.
    async fn cross_signing_changed(&self, user_id: &UserId) -> Result<(), CrossSigningError> {
        self.inner.identities.mark_outdated(user_id).await?;
        self.inner.identities.trust().clear();
        self.inner.store.emit(EngineEvent::TrustChanged { user_id: Some(user_id.to_owned()) });

        Ok(())
    }

    /// Shut the machine down.
    ///
    /// Waits for the batch of to-device events that is being processed and
    /// for every session that is in use, persists the account and rejects
    /// every further operation with a `Closed` error.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> OlmResult<()> {
        let _pipeline = self.inner.pipeline.lock().await;

        if self.is_closed() {
            return Ok(());
        }

        let _locks = self.inner.store.locks().lock_all().await;

        self.inner.store.save_account().await?;
        self.inner.store.close();

        info!("The encryption engine was shut down");

        Ok(())
    }
}
