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
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
};

use ruma::{events::room::history_visibility::HistoryVisibility, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use vodozemac::{
    megolm::{
        ExportedSessionKey, InboundGroupSession as InnerSession, InboundGroupSessionPickle,
        MegolmMessage, SessionConfig, SessionKey, SessionOrdering,
    },
    Curve25519PublicKey, Ed25519PublicKey, PickleError,
};

use crate::{
    error::{EventError, MegolmResult, SessionCreationError},
    store::PickleKey,
    types::{
        backup::BackedUpRoomKey,
        events::{ForwardedRoomKeyContent, MegolmPayload, MegolmV1Content, RoomKeyContent},
        serde_curve_key, serde_ed25519_key, EventEncryptionAlgorithm, ED25519,
    },
};

/// Hash a Megolm ciphertext for the replay ledger.
///
/// The ledger remembers which ciphertext consumed a message index, a
/// different ciphertext for a known index is a replay.
pub(crate) fn ciphertext_digest(ciphertext: &str) -> String {
    vodozemac::base64_encode(Sha256::digest(ciphertext.as_bytes()))
}

/// A decrypted room event together with the index of the message that
/// carried it.
#[derive(Clone, Debug)]
pub struct DecryptedMegolmPayload {
    /// The plaintext of the event.
    pub payload: MegolmPayload,
    /// The Megolm message index the event was encrypted with.
    pub message_index: u32,
}

/// Inbound group session.
///
/// Inbound group sessions are used to exchange room messages between a group
/// of participants. Inbound group sessions are used to decrypt the room
/// messages.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    first_known_index: u32,
    sender_key: Curve25519PublicKey,
    signing_key: Ed25519PublicKey,
    room_id: OwnedRoomId,
    algorithm: EventEncryptionAlgorithm,
    forwarding_chain: Vec<String>,
    imported: bool,
    backed_up: Arc<AtomicBool>,
    history_visibility: Option<HistoryVisibility>,
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("first_known_index", &self.first_known_index)
            .field("imported", &self.imported)
            .finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
            && self.sender_key == other.sender_key
            && self.first_known_index == other.first_known_index
    }
}

impl InboundGroupSession {
    /// Create a new inbound group session for the given room.
    ///
    /// These sessions are used to decrypt room messages.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public Curve25519 key of the account that sent us
    ///   the session.
    ///
    /// * `signing_key` - The public Ed25519 key of the account that sent us
    ///   the session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    ///   messages.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
        history_visibility: Option<HistoryVisibility>,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::version_1());

        Self::from_inner(
            session,
            sender_key,
            signing_key,
            room_id.to_owned(),
            Vec::new(),
            false,
            history_visibility,
        )
    }

    fn from_inner(
        session: InnerSession,
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: OwnedRoomId,
        forwarding_chain: Vec<String>,
        imported: bool,
        history_visibility: Option<HistoryVisibility>,
    ) -> Self {
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key,
            signing_key,
            room_id,
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            forwarding_chain,
            imported,
            backed_up: Arc::new(AtomicBool::new(false)),
            history_visibility,
        }
    }

    fn check_session_id(&self, claimed: &str) -> Result<(), SessionCreationError> {
        if self.session_id() == claimed {
            Ok(())
        } else {
            Err(SessionCreationError::SessionIdMismatch {
                claimed: claimed.to_owned(),
                actual: self.session_id().to_owned(),
            })
        }
    }

    /// Create a session from a `m.room_key` event that arrived over an Olm
    /// channel with the given device.
    pub fn from_room_key_content(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        content: &RoomKeyContent,
        history_visibility: Option<HistoryVisibility>,
    ) -> Result<Self, SessionCreationError> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(SessionCreationError::UnsupportedAlgorithm(content.algorithm.clone()));
        }

        let session_key = SessionKey::from_base64(&content.session_key)?;
        let session =
            Self::new(sender_key, signing_key, &content.room_id, &session_key, history_visibility);
        session.check_session_id(&content.session_id)?;

        Ok(session)
    }

    /// Create a session from a `m.forwarded_room_key` event.
    ///
    /// The Curve25519 key of the device that forwarded the key gets appended
    /// to the forwarding chain and the session is marked as imported.
    pub fn from_forwarded_key(
        forwarder_key: Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Self, SessionCreationError> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(SessionCreationError::UnsupportedAlgorithm(content.algorithm.clone()));
        }

        let session_key = ExportedSessionKey::from_base64(&content.session_key)?;
        let inner = InnerSession::import(&session_key, SessionConfig::version_1());

        let mut forwarding_chain = content.forwarding_curve25519_key_chain.clone();
        forwarding_chain.push(forwarder_key.to_base64());

        let session = Self::from_inner(
            inner,
            content.sender_key,
            content.sender_claimed_ed25519_key,
            content.room_id.clone(),
            forwarding_chain,
            true,
            None,
        );
        session.check_session_id(&content.session_id)?;

        Ok(session)
    }

    /// Create a session from a decrypted room key of the server-side backup.
    pub fn from_backup(
        room_id: &RoomId,
        session_id: &str,
        backup: &BackedUpRoomKey,
    ) -> Result<Self, SessionCreationError> {
        if backup.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(SessionCreationError::UnsupportedAlgorithm(backup.algorithm.clone()));
        }

        let signing_key = backup
            .sender_claimed_keys
            .get(ED25519)
            .ok_or(SessionCreationError::MissingSenderClaimedKey)?;
        let signing_key = Ed25519PublicKey::from_base64(signing_key)?;

        let session_key = ExportedSessionKey::from_base64(&backup.session_key)?;
        let inner = InnerSession::import(&session_key, SessionConfig::version_1());

        let session = Self::from_inner(
            inner,
            backup.sender_key,
            signing_key,
            room_id.to_owned(),
            backup.forwarding_curve25519_key_chain.clone(),
            true,
            None,
        );
        session.check_session_id(session_id)?;

        Ok(session)
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room where this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Get the sender key that this session was received from.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// Get the Ed25519 key the creator of the session claimed to own.
    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key
    }

    /// The algorithm this session uses.
    pub fn algorithm(&self) -> &EventEncryptionAlgorithm {
        &self.algorithm
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// The Curve25519 keys of the devices that forwarded this session to us.
    pub fn forwarding_chain(&self) -> &[String] {
        &self.forwarding_chain
    }

    /// Was the session imported, either forwarded or restored from a backup,
    /// instead of being received from its creator.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// The history visibility of the room when the session was created.
    pub fn history_visibility(&self) -> Option<&HistoryVisibility> {
        self.history_visibility.as_ref()
    }

    /// Has the session been backed up to the server.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(SeqCst)
    }

    /// Reset the backup state of the inbound group session.
    pub fn reset_backup_state(&self) {
        self.backed_up.store(false, SeqCst)
    }

    /// For testing, allow to manually mark this group session to have been
    /// backed up.
    pub fn mark_as_backed_up(&self) {
        self.backed_up.store(true, SeqCst)
    }

    /// Export this session at the given message index.
    pub async fn export_at_index(&self, message_index: u32) -> ExportedSessionKey {
        let message_index = std::cmp::max(self.first_known_index(), message_index);

        self.inner.lock().await.export_at(message_index).expect("Can't export session")
    }

    /// Get the content of a `m.forwarded_room_key` event that shares this
    /// session with another device.
    pub async fn to_forwarded_content(&self) -> ForwardedRoomKeyContent {
        ForwardedRoomKeyContent {
            algorithm: self.algorithm.clone(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            session_id: self.session_id().to_owned(),
            session_key: self.export_at_index(self.first_known_index).await.to_base64(),
            sender_claimed_ed25519_key: self.signing_key,
            forwarding_curve25519_key_chain: self.forwarding_chain.clone(),
        }
    }

    /// Get the plaintext that gets encrypted into the server-side backup.
    pub async fn to_backup(&self) -> BackedUpRoomKey {
        BackedUpRoomKey {
            algorithm: self.algorithm.clone(),
            sender_key: self.sender_key,
            session_key: self.export_at_index(self.first_known_index).await.to_base64(),
            sender_claimed_keys: BTreeMap::from([(
                ED25519.to_owned(),
                self.signing_key.to_base64(),
            )]),
            forwarding_curve25519_key_chain: self.forwarding_chain.clone(),
        }
    }

    /// Check if the two sessions share a ratchet and which one of them is
    /// able to decrypt more messages.
    ///
    /// `Better` means that this session knows an earlier ratchet state than
    /// `other`.
    pub async fn compare(&self, other: &InboundGroupSession) -> SessionOrdering {
        // The same object can't be compared, we would deadlock while trying to
        // acquire the same lock twice.
        if Arc::ptr_eq(&self.inner, &other.inner) {
            SessionOrdering::Equal
        } else if self.sender_key != other.sender_key
            || self.signing_key != other.signing_key
            || self.algorithm != other.algorithm
            || self.room_id != other.room_id
        {
            SessionOrdering::Unconnected
        } else {
            let mut other = other.inner.lock().await;
            self.inner.lock().await.compare(&mut other)
        }
    }

    /// Decrypt the content of a Megolm encrypted room event.
    ///
    /// The room id inside the plaintext must match the room of the session.
    pub async fn decrypt(
        &self,
        content: &MegolmV1Content,
    ) -> MegolmResult<DecryptedMegolmPayload> {
        let message = MegolmMessage::from_base64(&content.ciphertext)?;
        let decrypted = self.inner.lock().await.decrypt(&message)?;

        let payload: MegolmPayload = serde_json::from_slice(&decrypted.plaintext)?;

        if payload.room_id != self.room_id {
            return Err(
                EventError::MismatchedRoom(self.room_id.clone(), Some(payload.room_id)).into()
            );
        }

        Ok(DecryptedMegolmPayload { payload, message_index: decrypted.message_index })
    }

    /// Store the group session as a base64 encoded string.
    pub async fn pickle(&self, pickle_key: &PickleKey) -> PickledInboundGroupSession {
        let pickle = self.inner.lock().await.pickle().encrypt(pickle_key.as_bytes());

        PickledInboundGroupSession {
            session_id: self.session_id().to_owned(),
            pickle,
            sender_key: self.sender_key,
            signing_key: self.signing_key,
            room_id: self.room_id.clone(),
            forwarding_chain: self.forwarding_chain.clone(),
            imported: self.imported,
            backed_up: self.backed_up(),
            history_visibility: self.history_visibility.clone(),
        }
    }

    /// Restore a Session from a previously pickled string.
    pub fn from_pickle(
        pickle: &PickledInboundGroupSession,
        pickle_key: &PickleKey,
    ) -> Result<Self, PickleError> {
        let inner =
            InboundGroupSessionPickle::from_encrypted(&pickle.pickle, pickle_key.as_bytes())?;

        let session = Self::from_inner(
            InnerSession::from_pickle(inner),
            pickle.sender_key,
            pickle.signing_key,
            pickle.room_id.clone(),
            pickle.forwarding_chain.clone(),
            pickle.imported,
            pickle.history_visibility.clone(),
        );
        session.backed_up.store(pickle.backed_up, SeqCst);

        Ok(session)
    }
}

/// A pickled version of an `InboundGroupSession`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an InboundGroupSession.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PickledInboundGroupSession {
    /// The unique id of the session.
    pub session_id: String,
    /// The encrypted pickle string holding the Megolm ratchet.
    pub pickle: String,
    /// The public Curve25519 key of the account that sent us the session.
    #[serde(with = "serde_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The public Ed25519 key of the account that sent us the session.
    #[serde(with = "serde_ed25519_key")]
    pub signing_key: Ed25519PublicKey,
    /// The id of the room that the session is used in.
    pub room_id: OwnedRoomId,
    /// The list of Curve25519 keys that forwarded us this session.
    #[serde(default)]
    pub forwarding_chain: Vec<String>,
    /// Flag remembering if the session was imported.
    pub imported: bool,
    /// Flag remembering if the session has been backed up.
    #[serde(default)]
    pub backed_up: bool,
    /// History visibility of the room when the session was created.
    #[serde(default)]
    pub history_visibility: Option<HistoryVisibility>,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;
    use vodozemac::megolm::SessionOrdering;

    use super::*;
    use crate::{
        error::MegolmError,
        olm::{Account, OutboundGroupSession},
        types::events::EncryptedContent,
    };

    async fn session_pair() -> (OutboundGroupSession, InboundGroupSession) {
        let account =
            Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));

        account
            .create_group_session_pair(room_id!("!test:localhost"), Default::default())
            .await
            .unwrap()
    }

    async fn encrypt(outbound: &OutboundGroupSession, body: &str) -> MegolmV1Content {
        let content = outbound.encrypt("m.room.message", json!({ "body": body })).await.unwrap();

        assert_matches!(
            EncryptedContent::from_json(&content).unwrap(),
            EncryptedContent::MegolmV1(content)
        );
        content
    }

    #[tokio::test]
    async fn decryption() {
        let (outbound, inbound) = session_pair().await;

        let content = encrypt(&outbound, "It's a secret to everybody").await;
        let decrypted = inbound.decrypt(&content).await.unwrap();

        assert_eq!(decrypted.message_index, 0);
        assert_eq!(decrypted.payload.event_type, "m.room.message");
        assert_eq!(decrypted.payload.content["body"], "It's a secret to everybody");
    }

    #[tokio::test]
    async fn sessions_imported_at_a_later_index_cant_decrypt_earlier_messages() {
        let (outbound, inbound) = session_pair().await;

        let first = encrypt(&outbound, "first").await;
        let second = encrypt(&outbound, "second").await;

        let mut forwarded = inbound.to_forwarded_content().await;
        forwarded.session_key = inbound.export_at_index(1).await.to_base64();

        let forwarder = Account::new(user_id!("@bob:localhost"));
        let forwarder_key = forwarder.identity_keys().curve25519;
        let imported = InboundGroupSession::from_forwarded_key(forwarder_key, &forwarded).unwrap();

        assert_eq!(imported.first_known_index(), 1);
        assert!(imported.has_been_imported());
        assert_eq!(imported.forwarding_chain().len(), 1);

        assert_matches!(imported.decrypt(&first).await, Err(MegolmError::Decryption(_)));
        assert_eq!(imported.decrypt(&second).await.unwrap().message_index, 1);

        assert_eq!(inbound.compare(&imported).await, SessionOrdering::Better);
        assert_eq!(imported.compare(&inbound).await, SessionOrdering::Worse);
    }

    #[tokio::test]
    async fn unrelated_sessions_are_unconnected() {
        let (_, first) = session_pair().await;
        let (_, second) = session_pair().await;

        assert_eq!(first.compare(&second).await, SessionOrdering::Unconnected);
        assert_eq!(first.compare(&first).await, SessionOrdering::Equal);
    }

    #[tokio::test]
    async fn backup_export_and_import() {
        let (outbound, inbound) = session_pair().await;
        let content = encrypt(&outbound, "backed up").await;

        let backup = inbound.to_backup().await;
        let restored =
            InboundGroupSession::from_backup(inbound.room_id(), inbound.session_id(), &backup)
                .unwrap();

        assert!(restored.has_been_imported());
        assert_eq!(restored.signing_key(), inbound.signing_key());
        assert_eq!(restored.decrypt(&content).await.unwrap().payload.content["body"], "backed up");

        assert_matches!(
            InboundGroupSession::from_backup(inbound.room_id(), "wrong id", &backup),
            Err(SessionCreationError::SessionIdMismatch { .. })
        );
    }

    #[tokio::test]
    async fn pickling() {
        let pickle_key = PickleKey::new();
        let (outbound, inbound) = session_pair().await;
        inbound.mark_as_backed_up();

        let pickle = inbound.pickle(&pickle_key).await;
        let unpickled = InboundGroupSession::from_pickle(&pickle, &pickle_key).unwrap();

        assert_eq!(unpickled, inbound);
        assert!(unpickled.backed_up());
        assert_eq!(unpickled.room_id(), pickle.room_id);

        let content = encrypt(&outbound, "pickled").await;
        unpickled.decrypt(&content).await.unwrap();

        assert!(InboundGroupSession::from_pickle(&pickle, &PickleKey::new()).is_err());
    }

    #[test]
    fn ciphertext_digests_are_stable() {
        assert_eq!(ciphertext_digest("ciphertext"), ciphertext_digest("ciphertext"));
        assert_ne!(ciphertext_digest("ciphertext"), ciphertext_digest("other"));
    }
}
