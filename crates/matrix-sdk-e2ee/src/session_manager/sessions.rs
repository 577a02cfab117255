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
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde_json::Value;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey};

use crate::{
    error::{EventError, OlmError, OlmResult, SessionCreationError},
    identities::{DeviceData, IdentityManager},
    olm::Session,
    store::{Changes, SessionLocks, Store},
    transport::{CryptoTransport, RetryPolicy},
    types::events::{DecryptedOlmPayload, OlmV1Content},
};

/// Establishes Olm sessions with other devices and uses them to encrypt and
/// decrypt to-device messages.
#[derive(Debug, Clone)]
pub struct SessionManager {
    store: Store,
    identities: IdentityManager,
    transport: Arc<dyn CryptoTransport>,
    retry: RetryPolicy,
}

impl SessionManager {
    pub fn new(
        store: Store,
        identities: IdentityManager,
        transport: Arc<dyn CryptoTransport>,
        retry: RetryPolicy,
    ) -> Self {
        Self { store, identities, transport, retry }
    }

    fn lock_key(user_id: &UserId, sender_key: Curve25519PublicKey) -> String {
        SessionLocks::olm_key(user_id.as_str(), &sender_key.to_base64())
    }

    /// Get the most recently used session we share with the given device
    /// key.
    async fn most_recent_session(
        &self,
        sender_key: Curve25519PublicKey,
    ) -> OlmResult<Option<Session>> {
        let Some(sessions) = self.store.get_sessions(&sender_key.to_base64()).await? else {
            return Ok(None);
        };

        let sessions = sessions.lock().await;
        Ok(sessions.iter().max_by_key(|s| s.last_use_time).cloned())
    }

    /// Make sure we share an Olm session with every one of the given
    /// devices.
    ///
    /// One-time keys are claimed for the devices that don't have a session
    /// yet. Returns the devices for which no session could be established.
    #[instrument(skip_all)]
    pub async fn ensure_sessions(
        &self,
        devices: &[&DeviceData],
    ) -> OlmResult<BTreeSet<(OwnedUserId, OwnedDeviceId)>> {
        let mut missing: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>> = BTreeMap::new();
        let mut unreachable = BTreeSet::new();

        for device in devices {
            let Some(curve_key) = device.curve25519_key() else {
                warn!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    "Device is missing a Curve25519 key, can't establish an Olm session"
                );
                unreachable.insert((device.user_id().to_owned(), device.device_id().to_owned()));
                continue;
            };

            if self.most_recent_session(curve_key).await?.is_none() {
                missing
                    .entry(device.user_id().to_owned())
                    .or_default()
                    .push(device.device_id().to_owned());
            }
        }

        if missing.is_empty() {
            return Ok(unreachable);
        }

        debug!(?missing, "Claiming one-time keys for devices without an Olm session");

        // No lock is held while we wait for the server.
        let response = self
            .retry
            .run("keys_claim", || self.transport.claim_one_time_keys(missing.clone()))
            .await?;

        let account = self.store.account().await;
        let mut new_sessions = Vec::new();

        for device in devices {
            let is_missing = missing
                .get(device.user_id())
                .is_some_and(|d| d.iter().any(|id| id == device.device_id()));

            if !is_missing {
                continue;
            }

            let key_map = response
                .one_time_keys
                .get(device.user_id())
                .and_then(|d| d.get(device.device_id()));

            let Some(key_map) = key_map else {
                warn!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    "The server didn't return a one-time key for the device"
                );
                unreachable.insert((device.user_id().to_owned(), device.device_id().to_owned()));
                continue;
            };

            match account.create_outbound_session(device, key_map) {
                Ok(session) => new_sessions.push(session),
                Err(error) => {
                    warn!(
                        user_id = ?device.user_id(),
                        device_id = ?device.device_id(),
                        ?error,
                        "Couldn't establish an Olm session with the claimed one-time key"
                    );
                    unreachable
                        .insert((device.user_id().to_owned(), device.device_id().to_owned()));
                }
            }
        }

        drop(account);

        if !new_sessions.is_empty() {
            info!(count = new_sessions.len(), "Established new outbound Olm sessions");
            let changes = Changes { sessions: new_sessions, ..Default::default() };
            self.store.save_changes(changes).await?;
        }

        Ok(unreachable)
    }

    /// Encrypt the given content for a single device of a user.
    ///
    /// Returns the content of an `m.room.encrypted` to-device event.
    pub async fn encrypt(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        event_type: &str,
        content: Value,
    ) -> OlmResult<Value> {
        let device = self
            .identities
            .get_device(user_id, device_id)
            .await?
            .ok_or_else(|| OlmError::UnknownDevice(user_id.to_owned(), device_id.to_owned()))?;

        self.encrypt_for_device(device.data(), event_type, content).await
    }

    /// Encrypt the given content for the given device, establishing a new
    /// Olm session if needed.
    #[instrument(
        skip_all,
        fields(user_id = ?device.user_id(), device_id = ?device.device_id())
    )]
    pub(crate) async fn encrypt_for_device(
        &self,
        device: &DeviceData,
        event_type: &str,
        content: Value,
    ) -> OlmResult<Value> {
        let no_session = || {
            OlmError::NoOlmSessionAvailable(device.user_id().to_owned(), device.device_id().into())
        };

        let curve_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        if self.most_recent_session(curve_key).await?.is_none() {
            self.ensure_sessions(&[device]).await?;
        }

        let _guard = self.store.locks().lock(&Self::lock_key(device.user_id(), curve_key)).await;

        let mut session = self.most_recent_session(curve_key).await?.ok_or_else(no_session)?;
        let encrypted = session.encrypt(device, event_type, content).await?;

        self.store.save_changes(Changes { sessions: vec![session], ..Default::default() }).await?;

        Ok(encrypted)
    }

    /// Try to decrypt the message with every session we share with the
    /// sender, the most recently used session first.
    async fn try_existing_sessions(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<Option<String>> {
        let Some(sessions) = self.store.get_sessions(&sender_key.to_base64()).await? else {
            return Ok(None);
        };

        let mut candidates = sessions.lock().await.clone();
        candidates.sort_by_key(|s| Reverse(s.last_use_time));

        for mut session in candidates {
            let matches = match message {
                OlmMessage::PreKey(m) => {
                    // A pre-key message that doesn't belong to this session will
                    // never decrypt with it.
                    if !session.matches_pre_key_message(m).await {
                        continue;
                    }
                    true
                }
                OlmMessage::Normal(_) => false,
            };

            match session.decrypt(message).await {
                Ok(plaintext) => {
                    trace!(session_id = session.session_id(), "Decrypted an Olm message");
                    self.store
                        .save_changes(Changes { sessions: vec![session], ..Default::default() })
                        .await?;

                    return Ok(Some(plaintext));
                }
                Err(error) if matches => {
                    warn!(
                        ?sender,
                        session_id = session.session_id(),
                        ?error,
                        "A matching Olm session failed to decrypt a pre-key message"
                    );
                    return Err(error);
                }
                Err(_) => continue,
            }
        }

        Ok(None)
    }

    /// Decrypt an Olm message that was sent to us.
    ///
    /// The advanced session, and the account if a one-time key got used up,
    /// are persisted before the plaintext is returned.
    #[instrument(skip_all, fields(sender = ?sender, sender_key = %sender_key.to_base64()))]
    pub async fn decrypt_olm(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<String> {
        let _guard = self.store.locks().lock(&Self::lock_key(sender, sender_key)).await;

        if let Some(plaintext) = self.try_existing_sessions(sender, sender_key, message).await? {
            return Ok(plaintext);
        }

        match message {
            OlmMessage::Normal(_) => {
                warn!("None of our Olm sessions could decrypt a normal Olm message");
                Err(OlmError::UnknownOlmSession(sender.to_owned(), sender_key))
            }
            OlmMessage::PreKey(m) => {
                let mut account = self.store.account().await;
                let (session, plaintext) = account.create_inbound_session(sender, sender_key, m)?;
                let pickle = account.pickle(self.store.pickle_key());
                drop(account);

                self.store
                    .save_changes(Changes {
                        account: Some(pickle),
                        sessions: vec![session],
                        ..Default::default()
                    })
                    .await?;

                Ok(plaintext)
            }
        }
    }

    /// Decrypt the content of an Olm encrypted to-device event and check
    /// that the payload was meant for us.
    pub async fn decrypt_to_device(
        &self,
        sender: &UserId,
        content: &OlmV1Content,
    ) -> OlmResult<DecryptedOlmPayload> {
        let identity_keys = &self.store.static_account().identity_keys;

        let ciphertext = content
            .ciphertext
            .get(&identity_keys.curve25519.to_base64())
            .ok_or(EventError::MissingCiphertext)?;
        let message = OlmMessage::try_from(ciphertext)?;

        let plaintext = self.decrypt_olm(sender, content.sender_key, &message).await?;

        self.parse_payload(sender, content.sender_key, &plaintext).await
    }

    async fn parse_payload(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        plaintext: &str,
    ) -> OlmResult<DecryptedOlmPayload> {
        let payload: DecryptedOlmPayload = serde_json::from_str(plaintext)?;
        let our_ed25519 = self.store.static_account().identity_keys.ed25519;

        if payload.sender != sender {
            return Err(EventError::MismatchedSender(payload.sender, sender.to_owned()).into());
        }

        if payload.recipient != self.store.user_id() {
            return Err(EventError::MismatchedRecipient(payload.recipient).into());
        }

        if payload.recipient_keys.ed25519 != our_ed25519 {
            return Err(EventError::MismatchedKeys(
                Box::new(our_ed25519),
                Box::new(payload.recipient_keys.ed25519),
            )
            .into());
        }

        // The claimed signing key has to belong to the device that owns the
        // sender key, if we know that device.
        if let Some(device) = self.store.get_device_from_curve_key(sender, sender_key).await? {
            if let Some(ed25519) = device.ed25519_key().filter(|k| *k != payload.keys.ed25519) {
                return Err(EventError::MismatchedKeys(
                    Box::new(ed25519),
                    Box::new(payload.keys.ed25519),
                )
                .into());
            }
        }

        Ok(payload)
    }
}
