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
    cmp::max,
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use ruma::{
    events::room::history_visibility::HistoryVisibility, DeviceId, OwnedDeviceId, OwnedRoomId,
    OwnedTransactionId, OwnedUserId, RoomId, SecondsSinceUnixEpoch, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vodozemac::{
    megolm::{GroupSession, GroupSessionPickle, SessionConfig, SessionKey},
    Curve25519PublicKey, PickleError,
};

use super::super::StaticAccountData;
use crate::{
    error::{MegolmError, SessionCreationError},
    store::PickleKey,
    types::{
        events::{
            EncryptedContent, MegolmV1Content, RoomKeyContent, RoomKeyWithheldContent,
            WithheldCode,
        },
        requests::ToDeviceRequest,
        serde_curve_key, EventEncryptionAlgorithm,
    },
};

const ROTATION_PERIOD: Duration = Duration::from_millis(604800000);
const ROTATION_MESSAGES: u64 = 100;

#[cfg(not(feature = "_disable-minimum-rotation-period-ms"))]
const MINIMUM_ROTATION_PERIOD: Duration = Duration::from_secs(3600);
#[cfg(feature = "_disable-minimum-rotation-period-ms")]
const MINIMUM_ROTATION_PERIOD: Duration = Duration::from_millis(0);

/// Settings for an encrypted room.
///
/// This determines the algorithm and rotation periods of a group session.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
    /// The history visibility of the room when the session was created.
    pub history_visibility: HistoryVisibility,
    /// Should untrusted devices receive the room key, or should they be
    /// excluded from the conversation.
    #[serde(default)]
    pub only_allow_trusted_devices: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            history_visibility: HistoryVisibility::Shared,
            only_allow_trusted_devices: false,
        }
    }
}

impl EncryptionSettings {
    /// Has a session that encrypted `message_count` messages and is `age` old
    /// reached the end of its life.
    ///
    /// Since the settings are provided by users the message count is clamped
    /// to `1..=10000` and the period to at least one hour.
    pub fn rotation_expired(&self, message_count: u64, age: Duration) -> bool {
        let rotation_period_msgs = self.rotation_period_msgs.clamp(1, 10_000);
        let rotation_period = max(self.rotation_period, MINIMUM_ROTATION_PERIOD);

        message_count >= rotation_period_msgs || age >= rotation_period
    }

    /// Does the history visibility of the room hide history from new members,
    /// sessions need to be rotated when members leave in such rooms.
    pub fn hides_history(&self) -> bool {
        matches!(self.history_visibility, HistoryVisibility::Joined | HistoryVisibility::Invited)
    }
}

/// Information about the room key a device received.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedWith {
    /// The Curve25519 key of the device that received the room key.
    #[serde(with = "serde_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The first message index the device is able to decrypt.
    pub message_index: u32,
}

/// What a device was sent for an outbound group session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareInfo {
    /// The device received the room key.
    Shared(SharedWith),
    /// The device was told that it won't receive the room key.
    Withheld(WithheldCode),
}

impl ShareInfo {
    /// Create the share info of a device that received the room key.
    pub fn new_shared(sender_key: Curve25519PublicKey, message_index: u32) -> Self {
        ShareInfo::Shared(SharedWith { sender_key, message_index })
    }
}

/// A map of user ids and device ids to a [`ShareInfo`].
pub type ShareInfoSet = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ShareInfo>>;

/// Outbound group session.
///
/// Outbound group sessions are used to exchange room messages between a group
/// of participants. Outbound group sessions are used to encrypt the room
/// messages.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<GroupSession>>,
    our_account: StaticAccountData,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    pub(crate) creation_time: SecondsSinceUnixEpoch,
    message_count: Arc<AtomicU64>,
    invalidated: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
    shared_with: Arc<DashMap<OwnedUserId, DashMap<OwnedDeviceId, ShareInfo>>>,
    /// Requests carrying the room key or withheld notices that weren't sent
    /// out yet, recorded as shared once the send succeeds.
    to_share_with: Arc<DashMap<OwnedTransactionId, (ToDeviceRequest, ShareInfoSet)>>,
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

impl OutboundGroupSession {
    fn session_config(
        algorithm: &EventEncryptionAlgorithm,
    ) -> Result<SessionConfig, SessionCreationError> {
        match algorithm {
            EventEncryptionAlgorithm::MegolmV1AesSha2 => Ok(SessionConfig::version_1()),
            _ => Err(SessionCreationError::UnsupportedAlgorithm(algorithm.to_owned())),
        }
    }

    /// Create a new outbound group session for the given room.
    ///
    /// Outbound group sessions are used to encrypt room messages.
    ///
    /// # Arguments
    ///
    /// * `our_account` - The account that creates this session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `settings` - Settings determining the algorithm and rotation period of
    ///   the outbound group session.
    pub fn new(
        our_account: StaticAccountData,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Result<Self, SessionCreationError> {
        let config = Self::session_config(&settings.algorithm)?;

        let session = GroupSession::new(config);
        let session_id = session.session_id();

        Ok(OutboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            our_account,
            session_id: session_id.into(),
            room_id: room_id.to_owned(),
            creation_time: SecondsSinceUnixEpoch::now(),
            message_count: Arc::new(AtomicU64::new(0)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
            shared_with: Default::default(),
            to_share_with: Default::default(),
        })
    }

    /// Get the id of the room this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 key of the device that created this session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.our_account.identity_keys.curve25519
    }

    /// Get the encryption settings of this outbound session.
    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// The number of messages this session encrypted.
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    /// This should be called if an the user wishes to rotate this session.
    pub fn invalidate_session(&self) {
        self.invalidated.store(true, Ordering::Relaxed)
    }

    /// Has the session been invalidated.
    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Relaxed)
    }

    fn age(&self) -> Duration {
        let creation_time = Duration::from_secs(self.creation_time.get().into());
        let now = Duration::from_secs(SecondsSinceUnixEpoch::now().get().into());

        // A creation time in the future counts as expired.
        now.checked_sub(creation_time).unwrap_or(Duration::MAX)
    }

    /// Check if the session has expired and if it should be rotated.
    ///
    /// A session will expire after some time or if enough messages have been
    /// encrypted using it.
    pub fn expired(&self) -> bool {
        self.settings.rotation_expired(self.message_count(), self.age())
    }

    /// Get the session key of this session.
    ///
    /// A session key can be used to to create an `InboundGroupSession`.
    pub async fn session_key(&self) -> SessionKey {
        self.inner.lock().await.session_key()
    }

    /// Gets the current message index of the session.
    pub async fn message_index(&self) -> u32 {
        self.inner.lock().await.message_index()
    }

    /// Get the `m.room_key` content that shares this session.
    pub async fn as_content(&self) -> RoomKeyContent {
        RoomKeyContent {
            algorithm: self.settings.algorithm.clone(),
            room_id: self.room_id.clone(),
            session_id: self.session_id().to_owned(),
            session_key: self.session_key().await.to_base64(),
        }
    }

    /// Encrypt a room message for the given room.
    ///
    /// The room key needs to be shared with the recipients before the
    /// encrypted content is sent out.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The plaintext type of the event, the outer type of the
    ///   event will become `m.room.encrypted`.
    ///
    /// * `content` - The plaintext content of the message that should be
    ///   encrypted.
    pub async fn encrypt(&self, event_type: &str, content: Value) -> Result<Value, MegolmError> {
        if self.invalidated() || self.expired() {
            return Err(MegolmError::SessionExpired(self.room_id.clone()));
        }

        let plaintext = json!({
            "content": content,
            "room_id": &self.room_id,
            "type": event_type,
        })
        .to_string();

        let ciphertext = {
            let mut session = self.inner.lock().await;
            self.message_count.fetch_add(1, Ordering::SeqCst);
            session.encrypt(&plaintext)
        };

        let content = EncryptedContent::MegolmV1(MegolmV1Content {
            sender_key: self.sender_key(),
            session_id: self.session_id().to_owned(),
            ciphertext: ciphertext.to_base64(),
            device_id: self.our_account.device_id.clone(),
        });

        Ok(serde_json::to_value(content)?)
    }

    /// The `m.room_key.withheld` content telling a device that it won't
    /// receive this session.
    pub fn withheld_content(&self, code: WithheldCode) -> RoomKeyWithheldContent {
        let (room_id, session_id) = match code {
            WithheldCode::NoOlm => (None, None),
            _ => (Some(self.room_id.clone()), Some(self.session_id().to_owned())),
        };

        RoomKeyWithheldContent {
            algorithm: self.settings.algorithm.clone(),
            code,
            reason: Some(code.to_string()),
            room_id,
            session_id,
            sender_key: self.sender_key(),
            from_device: Some(self.our_account.device_id.clone()),
        }
    }

    /// What the given device was sent for this session, if the request
    /// carrying it was sent out.
    pub fn is_shared_with(&self, user_id: &UserId, device_id: &DeviceId) -> Option<ShareInfo> {
        self.shared_with.get(user_id).and_then(|d| d.get(device_id).map(|i| *i))
    }

    /// Is a request for the given device waiting to be sent out.
    pub fn is_pending_for(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.to_share_with.iter().any(|e| {
            let (_, share_infos) = e.value();
            share_infos.get(user_id).is_some_and(|d| d.contains_key(device_id))
        })
    }

    /// Remember a request that carries the room key or withheld notices,
    /// the recipients count as shared once it was sent.
    pub(crate) fn add_request(&self, request: ToDeviceRequest, share_infos: ShareInfoSet) {
        self.to_share_with.insert(request.txn_id.clone(), (request, share_infos));
    }

    /// The requests that still need to be sent out.
    pub fn pending_requests(&self) -> Vec<ToDeviceRequest> {
        self.to_share_with.iter().map(|e| e.value().0.clone()).collect()
    }

    /// Record the recipients of a sent request.
    ///
    /// Returns false if no request with the given id was pending.
    pub(crate) fn mark_request_as_sent(&self, request_id: &TransactionId) -> bool {
        let Some((_, (request, share_infos))) = self.to_share_with.remove(request_id) else {
            warn!(
                ?request_id,
                session_id = self.session_id(),
                "Marking a room key request as sent, but no such request is pending"
            );
            return false;
        };

        info!(
            ?request_id,
            session_id = self.session_id(),
            %request.event_type,
            recipients = request.message_count(),
            "Marking a request carrying a room key or withheld notices as sent"
        );

        for (user_id, infos) in share_infos {
            self.shared_with.entry(user_id).or_default().extend(infos);
        }

        true
    }

    /// Get the set of users and devices that received this session or a
    /// withheld notice for it.
    pub fn shared_with(&self) -> ShareInfoSet {
        self.shared_with
            .iter()
            .map(|e| {
                let devices = e.value().iter().map(|d| (d.key().clone(), *d.value())).collect();
                (e.key().clone(), devices)
            })
            .collect()
    }

    /// Did a device that received this session drop out of the given set of
    /// recipients.
    pub fn recipients_narrowed(
        &self,
        recipients: &BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>,
    ) -> bool {
        self.shared_with.iter().any(|e| {
            let targets = recipients.get(e.key());

            e.value().iter().any(|d| {
                matches!(d.value(), ShareInfo::Shared(_))
                    && !targets.is_some_and(|targets| targets.contains(d.key()))
            })
        })
    }

    /// Get the session as a pickle that can be persisted.
    pub async fn pickle(&self, pickle_key: &PickleKey) -> PickledOutboundGroupSession {
        let pickle = self.inner.lock().await.pickle().encrypt(pickle_key.as_bytes());

        PickledOutboundGroupSession {
            pickle,
            room_id: self.room_id.clone(),
            settings: (*self.settings).clone(),
            creation_time: self.creation_time,
            message_count: self.message_count(),
            invalidated: self.invalidated(),
            shared_with: self.shared_with(),
            requests: self
                .to_share_with
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    /// Restore a Session from a previously pickled one.
    pub fn from_pickle(
        our_account: StaticAccountData,
        pickle: &PickledOutboundGroupSession,
        pickle_key: &PickleKey,
    ) -> Result<Self, PickleError> {
        let inner = GroupSessionPickle::from_encrypted(&pickle.pickle, pickle_key.as_bytes())?;
        let session = GroupSession::from_pickle(inner);
        let session_id = session.session_id();

        debug!(session_id, room_id = ?pickle.room_id, "Restored an outbound group session");

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            our_account,
            session_id: session_id.into(),
            room_id: pickle.room_id.clone(),
            creation_time: pickle.creation_time,
            message_count: Arc::new(AtomicU64::new(pickle.message_count)),
            invalidated: Arc::new(AtomicBool::new(pickle.invalidated)),
            settings: Arc::new(pickle.settings.clone()),
            shared_with: Arc::new(
                pickle
                    .shared_with
                    .iter()
                    .map(|(user_id, devices)| {
                        (user_id.clone(), devices.iter().map(|(d, i)| (d.clone(), *i)).collect())
                    })
                    .collect(),
            ),
            to_share_with: Arc::new(
                pickle.requests.iter().map(|(id, r)| (id.clone(), r.clone())).collect(),
            ),
        })
    }
}

/// A pickled version of an `OutboundGroupSession`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an outbound group session.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PickledOutboundGroupSession {
    /// The encrypted pickle string holding the Megolm session.
    pub pickle: String,
    /// The room id this session is used for.
    pub room_id: OwnedRoomId,
    /// The settings this session adheres to.
    pub settings: EncryptionSettings,
    /// The timestamp when this session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The number of messages this session has already encrypted.
    pub message_count: u64,
    /// Is the session invalidated.
    pub invalidated: bool,
    /// The set of users and devices that received the session.
    pub shared_with: ShareInfoSet,
    /// Requests carrying the room key that weren't sent out yet.
    #[serde(default)]
    pub requests: BTreeMap<OwnedTransactionId, (ToDeviceRequest, ShareInfoSet)>,
}
