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

use std::collections::{BTreeMap, BTreeSet};

use ruma::{OwnedDeviceId, OwnedUserId, RoomId, TransactionId, UserId};
use serde_json::Value;
use tracing::{debug, info, instrument, trace, warn};

use super::SessionManager;
use crate::{
    error::{MegolmError, MegolmResult, OlmError, OlmResult},
    identities::{Device, IdentityManager, TrustLevel},
    olm::{EncryptionSettings, OutboundGroupSession, ShareInfo, ShareInfoSet},
    store::{Changes, Store},
    types::{
        events::{WithheldCode, ROOM_ENCRYPTED, ROOM_KEY, ROOM_KEY_WITHHELD},
        requests::ToDeviceRequest,
    },
};

/// The maximum number of to-device messages a single request carries.
const MAX_TO_DEVICE_MESSAGES: usize = 250;

/// The devices that should receive the room key of a room.
#[derive(Debug, Default)]
pub struct Recipients {
    /// The devices, keyed by their owner.
    pub devices: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Device>>,
    /// Devices that were left out because of their trust state.
    pub withheld: BTreeMap<(OwnedUserId, OwnedDeviceId), WithheldCode>,
}

impl Recipients {
    /// The user and device ids of the recipients.
    pub fn targets(&self) -> BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>> {
        self.devices
            .iter()
            .map(|(user_id, devices)| (user_id.clone(), devices.keys().cloned().collect()))
            .collect()
    }

    fn all_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().flat_map(|d| d.values())
    }
}

/// The outcome of sharing a room key.
#[derive(Debug, Default)]
pub struct ShareResult {
    /// The to-device requests carrying the room key or withheld notices,
    /// they need to be sent out before the first message encrypted with the
    /// session.
    ///
    /// Requests of earlier shares that weren't sent yet are included.
    pub requests: Vec<ToDeviceRequest>,
    /// Devices we couldn't establish an Olm session with.
    pub missing_sessions: BTreeSet<(OwnedUserId, OwnedDeviceId)>,
    /// Devices that won't receive the room key, with the reason.
    pub withheld: BTreeMap<(OwnedUserId, OwnedDeviceId), WithheldCode>,
}

impl ShareResult {
    /// The number of devices the room key is sent to.
    pub fn message_count(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| r.event_type == ROOM_ENCRYPTED)
            .map(|r| r.message_count())
            .sum()
    }

    /// The number of withheld notices that are sent out.
    pub fn withheld_count(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| r.event_type == ROOM_KEY_WITHHELD)
            .map(|r| r.message_count())
            .sum()
    }
}

/// A to-device message and what it tells its recipient about the session.
type ShareMessage = (OwnedUserId, OwnedDeviceId, Value, ShareInfo);

/// Creates, rotates and shares the outbound group sessions of our rooms.
#[derive(Debug, Clone)]
pub struct GroupSessionManager {
    store: Store,
    identities: IdentityManager,
    sessions: SessionManager,
}

impl GroupSessionManager {
    pub fn new(store: Store, identities: IdentityManager, sessions: SessionManager) -> Self {
        Self { store, identities, sessions }
    }

    /// Collect the devices of the given users that are allowed to receive
    /// room keys.
    ///
    /// Blacklisted devices never receive room keys, if the settings only
    /// allow trusted devices unverified devices are left out as well. Our
    /// own device is always skipped.
    pub async fn collect_recipients(
        &self,
        users: &[&UserId],
        settings: &EncryptionSettings,
    ) -> OlmResult<Recipients> {
        let mut recipients = Recipients::default();

        for (user_id, devices) in self.identities.devices_for_users(users).await? {
            for (device_id, device) in devices {
                if &*user_id == self.store.user_id() && &*device_id == self.store.device_id() {
                    continue;
                }

                let withheld = match device.trust_level() {
                    TrustLevel::Blacklisted => Some(WithheldCode::Blacklisted),
                    TrustLevel::Verified => None,
                    _ if settings.only_allow_trusted_devices => Some(WithheldCode::Unverified),
                    _ => None,
                };

                if let Some(code) = withheld {
                    trace!(?user_id, ?device_id, %code, "Withholding the room key from a device");
                    recipients.withheld.insert((user_id.clone(), device_id), code);
                } else {
                    let devices = recipients.devices.entry(user_id.clone()).or_default();
                    devices.insert(device_id, device);
                }
            }
        }

        Ok(recipients)
    }

    /// Get the outbound group session of the room, creating a new one if
    /// there is none or if the current one needs to be rotated.
    ///
    /// A session is rotated when it expired, when it was invalidated, when
    /// the settings of the room changed, or when a device that received the
    /// session isn't a target anymore and the room doesn't share its history.
    #[instrument(skip_all, fields(?room_id))]
    pub async fn ensure_outbound_session(
        &self,
        room_id: &RoomId,
        targets: &BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>,
        settings: EncryptionSettings,
    ) -> OlmResult<OutboundGroupSession> {
        if let Some(session) = self.store.get_outbound_group_session(room_id).await? {
            let rotation_reason = if session.invalidated() {
                Some("the session was invalidated")
            } else if session.expired() {
                Some("the session expired")
            } else if *session.settings() != settings {
                Some("the room settings changed")
            } else if settings.hides_history() && session.recipients_narrowed(targets) {
                Some("a recipient left the room")
            } else {
                None
            };

            match rotation_reason {
                None => return Ok(session),
                Some(reason) => {
                    info!(old_session_id = session.session_id(), reason, "Rotating the room key");
                }
            }
        }

        let (outbound, inbound) =
            self.store.static_account().create_group_session_pair(room_id, settings).await?;

        debug!(session_id = outbound.session_id(), "Created a new outbound group session");

        self.store
            .save_changes(Changes {
                inbound_group_sessions: vec![inbound],
                outbound_group_sessions: vec![outbound.clone()],
                ..Default::default()
            })
            .await?;

        Ok(outbound)
    }

    /// Encrypt the room key of the room for every recipient that didn't
    /// receive it yet, and tell the devices that won't receive it why.
    ///
    /// The recipients only count as served once
    /// [`GroupSessionManager::mark_request_as_sent`] was called for the
    /// request carrying their message.
    #[instrument(skip_all, fields(?room_id))]
    pub async fn share_session_if_needed(
        &self,
        room_id: &RoomId,
        recipients: &Recipients,
    ) -> OlmResult<ShareResult> {
        let session = self.outbound_session(room_id).await?;

        let mut result =
            ShareResult { withheld: recipients.withheld.clone(), ..Default::default() };

        let devices: Vec<&Device> = recipients
            .all_devices()
            .filter(|d| {
                let (user_id, device_id) = (d.user_id(), d.device_id());
                !matches!(session.is_shared_with(user_id, device_id), Some(ShareInfo::Shared(_)))
                    && !session.is_pending_for(user_id, device_id)
            })
            .collect();

        let mut room_keys = Vec::with_capacity(devices.len());

        if !devices.is_empty() {
            let device_data: Vec<_> = devices.iter().map(|d| d.data()).collect();
            result.missing_sessions = self.sessions.ensure_sessions(&device_data).await?;

            let content = serde_json::to_value(session.as_content().await)?;
            let message_index = session.message_index().await;

            for device in devices {
                let id = (device.user_id().to_owned(), device.device_id().to_owned());

                if result.missing_sessions.contains(&id) {
                    continue;
                }

                let encrypted =
                    self.sessions.encrypt_for_device(device.data(), ROOM_KEY, content.clone());

                match encrypted.await {
                    Ok(encrypted) => {
                        if let Some(sender_key) = device.curve25519_key() {
                            let info = ShareInfo::new_shared(sender_key, message_index);
                            room_keys.push((id.0, id.1, encrypted, info));
                        }
                    }
                    Err(OlmError::NoOlmSessionAvailable(..)) => {
                        warn!(user_id = ?id.0, device_id = ?id.1, "No Olm session for a recipient");
                        result.missing_sessions.insert(id);
                    }
                    Err(e) => return Err(e),
                }
            }

            for id in &result.missing_sessions {
                result.withheld.insert(id.clone(), WithheldCode::NoOlm);
            }
        }

        let notices: Vec<ShareMessage> = result
            .withheld
            .iter()
            .filter(|((user_id, device_id), _)| {
                session.is_shared_with(user_id, device_id).is_none()
                    && !session.is_pending_for(user_id, device_id)
            })
            .map(|((user_id, device_id), code)| {
                let content = serde_json::to_value(session.withheld_content(*code))?;
                Ok((user_id.clone(), device_id.clone(), content, ShareInfo::Withheld(*code)))
            })
            .collect::<Result<_, serde_json::Error>>()?;

        if room_keys.is_empty() && notices.is_empty() {
            trace!("The room key was already shared with every recipient");
        } else {
            info!(
                session_id = session.session_id(),
                recipients = room_keys.len(),
                withheld = notices.len(),
                missing = result.missing_sessions.len(),
                "Sharing the room key"
            );

            let requests = chunk_messages(ROOM_ENCRYPTED, &room_keys)
                .into_iter()
                .chain(chunk_messages(ROOM_KEY_WITHHELD, &notices));

            for (request, share_infos) in requests {
                session.add_request(request, share_infos);
            }

            self.store
                .save_changes(Changes {
                    outbound_group_sessions: vec![session.clone()],
                    ..Default::default()
                })
                .await?;
        }

        result.requests = session.pending_requests();

        Ok(result)
    }

    /// Record that a request returned by a share was sent out, its recipients
    /// won't receive the room key again.
    pub async fn mark_request_as_sent(
        &self,
        room_id: &RoomId,
        request_id: &TransactionId,
    ) -> OlmResult<()> {
        let session = self.outbound_session(room_id).await?;

        if session.mark_request_as_sent(request_id) {
            self.store
                .save_changes(Changes {
                    outbound_group_sessions: vec![session],
                    ..Default::default()
                })
                .await?;
        }

        Ok(())
    }

    async fn outbound_session(&self, room_id: &RoomId) -> OlmResult<OutboundGroupSession> {
        self.store
            .get_outbound_group_session(room_id)
            .await?
            .ok_or_else(|| OlmError::MissingOutboundSession(room_id.to_owned()))
    }

    /// Make sure the given users can decrypt the next message sent to the
    /// room, rotating the session if needed.
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[&UserId],
        settings: EncryptionSettings,
    ) -> OlmResult<ShareResult> {
        let recipients = self.collect_recipients(users, &settings).await?;
        self.ensure_outbound_session(room_id, &recipients.targets(), settings).await?;
        self.share_session_if_needed(room_id, &recipients).await
    }

    /// Encrypt a room event with the outbound group session of the room.
    ///
    /// Returns the content of an `m.room.encrypted` room event.
    #[instrument(skip_all, fields(?room_id, event_type))]
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<Value> {
        let session = self
            .store
            .get_outbound_group_session(room_id)
            .await?
            .ok_or_else(|| MegolmError::MissingOutboundSession(room_id.to_owned()))?;

        let encrypted = session.encrypt(event_type, content).await?;

        trace!(
            session_id = session.session_id(),
            message_count = session.message_count(),
            "Encrypted a room event"
        );

        self.store
            .save_changes(Changes { outbound_group_sessions: vec![session], ..Default::default() })
            .await?;

        Ok(encrypted)
    }

    /// Invalidate the outbound group session of the room so the next share
    /// creates a fresh one.
    ///
    /// Returns true if a session was invalidated.
    pub async fn invalidate_group_session(&self, room_id: &RoomId) -> OlmResult<bool> {
        let Some(session) = self.store.get_outbound_group_session(room_id).await? else {
            return Ok(false);
        };

        info!(?room_id, session_id = session.session_id(), "Invalidating the room key");

        session.invalidate_session();
        self.store
            .save_changes(Changes { outbound_group_sessions: vec![session], ..Default::default() })
            .await?;

        Ok(true)
    }
}

/// Pack the to-device messages into as few requests as possible.
fn chunk_messages(
    event_type: &str,
    messages: &[ShareMessage],
) -> Vec<(ToDeviceRequest, ShareInfoSet)> {
    messages
        .chunks(MAX_TO_DEVICE_MESSAGES)
        .map(|chunk| {
            let mut request = ToDeviceRequest::new(event_type);
            let mut share_infos = ShareInfoSet::new();

            for (user_id, device_id, content, info) in chunk {
                request.add_message(user_id, device_id.clone(), content.clone());
                share_infos.entry(user_id.clone()).or_default().insert(device_id.clone(), *info);
            }

            (request, share_infos)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches2::assert_matches;
    use ruma::{
        device_id, events::room::history_visibility::HistoryVisibility, room_id, user_id,
    };
    use serde_json::json;

    use super::*;
    use crate::{
        identities::LocalTrust,
        olm::InboundGroupSession,
        test_helpers::TestDevice,
        types::events::{EncryptedContent, RoomKeyContent, RoomKeyWithheldContent},
    };

    fn manager(device: &TestDevice) -> GroupSessionManager {
        GroupSessionManager::new(
            device.store.clone(),
            device.identities.clone(),
            device.sessions.clone(),
        )
    }

    fn bob_id() -> &'static UserId {
        user_id!("@bob:localhost")
    }

    async fn mark_as_sent(manager: &GroupSessionManager, room_id: &RoomId, result: &ShareResult) {
        for request in &result.requests {
            manager.mark_request_as_sent(room_id, &request.txn_id).await.unwrap();
        }
    }

    /// Decrypt the room key Bob received and turn it into an inbound session.
    async fn receive_room_key(bob: &TestDevice, request: &ToDeviceRequest) -> InboundGroupSession {
        let content = &request.messages[bob_id()][device_id!("BOB")];
        assert_matches!(EncryptedContent::from_json(content).unwrap(), EncryptedContent::OlmV1(c));

        let payload =
            bob.sessions.decrypt_to_device(user_id!("@alice:localhost"), &c).await.unwrap();
        assert_eq!(payload.event_type, ROOM_KEY);

        let room_key: RoomKeyContent = serde_json::from_value(payload.content).unwrap();
        let signing_key = payload.keys.ed25519;
        InboundGroupSession::from_room_key_content(c.sender_key, signing_key, &room_key, None)
            .unwrap()
    }

    #[tokio::test]
    async fn room_keys_are_shared_once() {
        let (alice, bob) = TestDevice::pair().await;
        let manager = manager(&alice);
        let room_id = room_id!("!test:localhost");

        let result =
            manager.share_room_key(room_id, &[bob_id()], EncryptionSettings::default()).await;
        let result = result.unwrap();

        assert_eq!(result.requests.len(), 1);
        assert_eq!(result.message_count(), 1);
        assert!(result.missing_sessions.is_empty());

        let inbound = receive_room_key(&bob, &result.requests[0]).await;
        mark_as_sent(&manager, room_id, &result).await;

        let encrypted =
            manager.encrypt(room_id, "m.room.message", json!({ "body": "Hello" })).await.unwrap();
        assert_matches!(
            EncryptedContent::from_json(&encrypted).unwrap(),
            EncryptedContent::MegolmV1(content)
        );
        assert_eq!(content.session_id, inbound.session_id());

        let decrypted = inbound.decrypt(&content).await.unwrap();
        assert_eq!(decrypted.payload.content, json!({ "body": "Hello" }));
        assert_eq!(decrypted.message_index, 0);

        // Sharing again doesn't produce any new requests.
        let result =
            manager.share_room_key(room_id, &[bob_id()], EncryptionSettings::default()).await;
        assert!(result.unwrap().requests.is_empty());
    }

    #[tokio::test]
    async fn unsent_room_keys_are_returned_again() {
        let (alice, bob) = TestDevice::pair().await;
        let manager = manager(&alice);
        let room_id = room_id!("!test:localhost");
        let bob_device = device_id!("BOB");

        let first =
            manager.share_room_key(room_id, &[bob_id()], EncryptionSettings::default()).await;
        let first = first.unwrap();
        assert_eq!(first.requests.len(), 1);

        let session = alice.store.get_outbound_group_session(room_id).await.unwrap().unwrap();
        assert!(session.is_pending_for(bob_id(), bob_device));
        assert!(session.is_shared_with(bob_id(), bob_device).is_none());

        // The request never made it out, the next share hands it back.
        let second =
            manager.share_room_key(room_id, &[bob_id()], EncryptionSettings::default()).await;
        let second = second.unwrap();
        assert_eq!(second.requests.len(), 1);
        assert_eq!(second.requests[0].txn_id, first.requests[0].txn_id);
        receive_room_key(&bob, &second.requests[0]).await;

        mark_as_sent(&manager, room_id, &second).await;
        assert_matches!(
            session.is_shared_with(bob_id(), bob_device),
            Some(ShareInfo::Shared(shared))
        );
        assert_eq!(shared.message_index, 0);

        let third =
            manager.share_room_key(room_id, &[bob_id()], EncryptionSettings::default()).await;
        assert!(third.unwrap().requests.is_empty());
    }

    #[tokio::test]
    async fn our_own_session_can_be_decrypted() {
        let (alice, _) = TestDevice::pair().await;
        let manager = manager(&alice);
        let room_id = room_id!("!test:localhost");

        manager.share_room_key(room_id, &[], EncryptionSettings::default()).await.unwrap();
        let encrypted = manager.encrypt(room_id, "m.room.message", json!({})).await.unwrap();
        assert_matches!(
            EncryptedContent::from_json(&encrypted).unwrap(),
            EncryptedContent::MegolmV1(content)
        );

        let inbound = alice
            .store
            .get_inbound_group_session(&content.sender_key.to_base64(), &content.session_id)
            .await
            .unwrap()
            .unwrap();
        inbound.decrypt(&content).await.unwrap();
    }

    #[tokio::test]
    async fn sessions_rotate_after_the_message_limit() {
        let (alice, _) = TestDevice::pair().await;
        let manager = manager(&alice);
        let room_id = room_id!("!test:localhost");
        let settings = EncryptionSettings { rotation_period_msgs: 1, ..Default::default() };

        manager.share_room_key(room_id, &[bob_id()], settings.clone()).await.unwrap();
        let first = alice.store.get_outbound_group_session(room_id).await.unwrap().unwrap();

        manager.encrypt(room_id, "m.room.message", json!({})).await.unwrap();
        assert_matches!(
            manager.encrypt(room_id, "m.room.message", json!({})).await,
            Err(MegolmError::SessionExpired(_))
        );

        manager.share_room_key(room_id, &[bob_id()], settings).await.unwrap();
        let second = alice.store.get_outbound_group_session(room_id).await.unwrap().unwrap();

        assert_ne!(first.session_id(), second.session_id());
    }

    #[tokio::test]
    async fn leaving_members_rotate_sessions_that_hide_history() {
        let (alice, _) = TestDevice::pair().await;
        let manager = manager(&alice);
        let room_id = room_id!("!test:localhost");

        for (visibility, rotates) in
            [(HistoryVisibility::Joined, true), (HistoryVisibility::Shared, false)]
        {
            let settings = EncryptionSettings {
                history_visibility: visibility,
                rotation_period: Duration::from_secs(3600 * 24),
                ..Default::default()
            };

            manager.invalidate_group_session(room_id).await.unwrap();
            let result = manager.share_room_key(room_id, &[bob_id()], settings.clone()).await;
            mark_as_sent(&manager, room_id, &result.unwrap()).await;
            let before = alice.store.get_outbound_group_session(room_id).await.unwrap().unwrap();

            // Bob left the room.
            manager.share_room_key(room_id, &[], settings).await.unwrap();
            let after = alice.store.get_outbound_group_session(room_id).await.unwrap().unwrap();

            assert_eq!(before.session_id() != after.session_id(), rotates);
        }
    }

    #[tokio::test]
    async fn untrusted_devices_are_withheld() {
        let (alice, _) = TestDevice::pair().await;
        let manager = manager(&alice);
        let room_id = room_id!("!test:localhost");

        let settings =
            EncryptionSettings { only_allow_trusted_devices: true, ..Default::default() };
        let result = manager.share_room_key(room_id, &[bob_id()], settings).await.unwrap();

        let bob_device = (bob_id().to_owned(), device_id!("BOB").to_owned());
        assert_eq!(result.message_count(), 0);
        assert_eq!(result.withheld_count(), 1);
        assert_eq!(result.withheld.get(&bob_device), Some(&WithheldCode::Unverified));

        let notice = &result.requests[0];
        assert_eq!(notice.event_type, ROOM_KEY_WITHHELD);
        let content: RoomKeyWithheldContent =
            serde_json::from_value(notice.messages[bob_id()][device_id!("BOB")].clone()).unwrap();
        assert_eq!(content.code, WithheldCode::Unverified);
        assert_eq!(content.room_id.as_deref(), Some(room_id));
        mark_as_sent(&manager, room_id, &result).await;

        let trust = LocalTrust::Verified;
        alice.identities.set_local_trust(bob_id(), device_id!("BOB"), trust).await.unwrap();

        let settings =
            EncryptionSettings { only_allow_trusted_devices: true, ..Default::default() };
        let result = manager.share_room_key(room_id, &[bob_id()], settings).await.unwrap();
        assert_eq!(result.message_count(), 1);
        assert_eq!(result.withheld_count(), 0);
    }

    #[tokio::test]
    async fn blacklisted_devices_never_receive_keys() {
        let (alice, _) = TestDevice::pair().await;
        let manager = manager(&alice);
        let room_id = room_id!("!test:localhost");

        // Make sure Bob's device is known before we blacklist it.
        alice.identities.get_device(bob_id(), device_id!("BOB")).await.unwrap().unwrap();
        alice
            .identities
            .set_local_trust(bob_id(), device_id!("BOB"), LocalTrust::BlackListed)
            .await
            .unwrap();

        let result =
            manager.share_room_key(room_id, &[bob_id()], EncryptionSettings::default()).await;
        let result = result.unwrap();

        assert_eq!(result.message_count(), 0);
        assert_eq!(result.withheld_count(), 1);
        assert_eq!(result.withheld.values().collect::<Vec<_>>(), [&WithheldCode::Blacklisted]);

        // The notice goes out once.
        mark_as_sent(&manager, room_id, &result).await;
        let result =
            manager.share_room_key(room_id, &[bob_id()], EncryptionSettings::default()).await;
        assert!(result.unwrap().requests.is_empty());
    }

    #[tokio::test]
    async fn devices_without_one_time_keys_are_reported() {
        let (alice, _) = TestDevice::pair().await;
        let manager = manager(&alice);
        let room_id = room_id!("!test:localhost");

        let (keys, _) = crate::identities::device::testing::signed_device_keys(
            "@bob:localhost",
            "BOBPHONE",
        );
        alice.transport.add_device_keys(keys);
        alice.identities.mark_outdated(bob_id()).await.unwrap();

        let result =
            manager.share_room_key(room_id, &[bob_id()], EncryptionSettings::default()).await;
        let result = result.unwrap();

        let phone = (bob_id().to_owned(), device_id!("BOBPHONE").to_owned());
        assert_eq!(result.message_count(), 1);
        assert!(result.missing_sessions.contains(&phone));
        assert_eq!(result.withheld.get(&phone), Some(&WithheldCode::NoOlm));
        assert_eq!(result.withheld_count(), 1);
    }

    #[test]
    fn messages_are_chunked() {
        let info = ShareInfo::Withheld(WithheldCode::Unavailable);
        let messages: Vec<_> = (0..MAX_TO_DEVICE_MESSAGES + 1)
            .map(|i| {
                let device_id = OwnedDeviceId::from(format!("DEVICE{i}"));
                (bob_id().to_owned(), device_id, json!({}), info)
            })
            .collect();

        let requests = chunk_messages(ROOM_ENCRYPTED, &messages);

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0.message_count(), MAX_TO_DEVICE_MESSAGES);
        assert_eq!(requests[1].0.message_count(), 1);
        assert_eq!(requests[1].1[bob_id()].len(), 1);
        assert!(requests.iter().all(|(r, _)| r.event_type == ROOM_ENCRYPTED));
    }
}
