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

//! Moving the state of a device from one store into another.
//!
//! A [`MigrationBlob`] carries the account, the Olm and Megolm sessions, the
//! private cross-signing keys and the tracked users of a device. The objects
//! in the blob are pickled with a key that is generated for every blob and
//! travels inside of it, the blob must be treated like the secrets it
//! contains.
//!
//! The binary layout is a single version byte followed by the MessagePack
//! encoding of the versioned body.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

use crate::{
    error::CrossSigningError,
    olm::{
        Account, CrossSigningKeyExport, InboundGroupSession, PickledAccount,
        PickledInboundGroupSession, PickledSession, PrivateCrossSigningIdentity, Session,
    },
    store::{
        CryptoStore, CryptoStoreError, PendingChanges, PickleKey, QuarantineKind,
        QuarantinedEntry, Store, TrackedUser,
    },
};

const VERSION_1: u8 = 1;

/// Error type for exporting or importing a [`MigrationBlob`].
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The blob was created by a version of the format we don't understand.
    #[error("unsupported migration blob version {0}")]
    UnsupportedVersion(u8),

    /// The blob contains no data at all.
    #[error("the migration blob is empty")]
    Empty,

    /// The body of the blob couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),

    /// The body of the blob couldn't be encoded.
    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),

    /// The pickle key inside the blob has the wrong length.
    #[error("the pickle key of the migration blob is malformed")]
    InvalidPickleKey,

    /// The account couldn't be restored, nothing was imported.
    #[error("the account of the migration blob couldn't be unpickled: {0}")]
    Account(#[source] vodozemac::PickleError),

    /// The target store already belongs to a device.
    #[error("the target store already contains an account")]
    AccountExists,

    /// The private cross-signing keys couldn't be restored.
    #[error(transparent)]
    CrossSigning(#[from] CrossSigningError),

    /// The source or the target store failed.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

#[derive(Serialize, Deserialize)]
struct MigrationBlobV1 {
    pickled_account: PickledAccount,
    pickled_sessions: Vec<PickledSession>,
    pickled_inbound_group_sessions: Vec<PickledInboundGroupSession>,
    pickle_key: Vec<u8>,
    cross_signing_export: Option<CrossSigningKeyExport>,
    tracked_users: Vec<TrackedUser>,
}

impl MigrationBlobV1 {
    fn pickle_key(&self) -> Result<PickleKey, MigrationError> {
        let bytes: &[u8; 32] =
            self.pickle_key.as_slice().try_into().map_err(|_| MigrationError::InvalidPickleKey)?;

        Ok(PickleKey::from_bytes(bytes))
    }
}

impl Drop for MigrationBlobV1 {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.pickle_key);
    }
}

/// The outcome of importing a [`MigrationBlob`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// The number of Olm sessions that were imported.
    pub sessions: usize,
    /// The number of room keys that were imported.
    pub inbound_group_sessions: usize,
    /// The number of users whose device lists we keep tracking.
    pub tracked_users: usize,
    /// Were private cross-signing keys imported.
    pub cross_signing_keys: bool,
    /// The entries that couldn't be unpickled and were left behind.
    pub quarantined: Vec<QuarantinedEntry>,
}

/// The state of a device, ready to be moved into another store.
#[derive(Clone)]
pub struct MigrationBlob {
    bytes: Zeroizing<Vec<u8>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for MigrationBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationBlob")
            .field("version", &self.version())
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl MigrationBlob {
    /// Wrap bytes that were previously produced by [`MigrationBlob::as_bytes`].
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes: Zeroizing::new(bytes) }
    }

    /// The binary form of the blob.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The format version the blob claims to use.
    pub fn version(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    fn encode(body: &MigrationBlobV1) -> Result<Self, MigrationError> {
        let mut bytes = Zeroizing::new(vec![VERSION_1]);
        rmp_serde::encode::write_named(&mut *bytes, body)?;

        Ok(Self { bytes })
    }

    fn decode(&self) -> Result<MigrationBlobV1, MigrationError> {
        let (version, body) = self.bytes.split_first().ok_or(MigrationError::Empty)?;

        if *version != VERSION_1 {
            return Err(MigrationError::UnsupportedVersion(*version));
        }

        Ok(rmp_serde::from_slice(body)?)
    }

    /// Export the state of the given store.
    ///
    /// Objects that fail to load from the store are skipped, they end up in
    /// the quarantine of the store.
    #[instrument(skip_all, fields(user_id = ?store.user_id(), device_id = ?store.device_id()))]
    pub async fn export_from(store: &Store) -> Result<Self, MigrationError> {
        let blob_key = PickleKey::new();

        let pickled_account = store.account().await.pickle(&blob_key);

        let mut pickled_sessions = Vec::new();

        for pickle in store.backend().get_all_sessions().await? {
            if store.quarantine().contains(QuarantineKind::Session, &pickle.session_id) {
                continue;
            }

            match Session::from_pickle(store.static_account().clone(), &pickle, store.pickle_key())
            {
                Ok(session) => pickled_sessions.push(session.pickle(&blob_key).await),
                Err(error) => {
                    warn!(session_id = %pickle.session_id, ?error, "Quarantining an Olm session");
                    store.quarantine().insert(
                        QuarantineKind::Session,
                        &pickle.session_id,
                        error.to_string(),
                    );
                }
            }
        }

        let mut pickled_inbound_group_sessions = Vec::new();

        for session in store.get_inbound_group_sessions().await? {
            pickled_inbound_group_sessions.push(session.pickle(&blob_key).await);
        }

        let identity = store.private_identity();
        let cross_signing_export = if identity.has_master_key().await
            || identity.can_sign_devices().await
        {
            Some(identity.export_secrets().await)
        } else {
            None
        };

        let body = MigrationBlobV1 {
            pickled_account,
            pickled_sessions,
            pickled_inbound_group_sessions,
            pickle_key: blob_key.as_bytes().to_vec(),
            cross_signing_export,
            tracked_users: store.load_tracked_users().await?,
        };

        info!(
            sessions = body.pickled_sessions.len(),
            inbound_group_sessions = body.pickled_inbound_group_sessions.len(),
            "Exported the state of the device"
        );

        Self::encode(&body)
    }

    /// Import the blob into an empty store backend.
    ///
    /// Every object is pickled again with the given pickle key. Open the
    /// [`Store`] on top of the backend once the import finished.
    ///
    /// Entries that can't be unpickled aren't written, they are reported in
    /// the returned [`MigrationReport`]. Only a broken account fails the
    /// whole import.
    #[instrument(skip_all)]
    pub async fn import_into(
        &self,
        backend: &dyn CryptoStore,
        pickle_key: &PickleKey,
    ) -> Result<MigrationReport, MigrationError> {
        let body = self.decode()?;
        let blob_key = body.pickle_key()?;

        if backend.load_account().await?.is_some() {
            return Err(MigrationError::AccountExists);
        }

        let account = Account::from_pickle(&body.pickled_account, &blob_key)
            .map_err(MigrationError::Account)?;
        let static_account = account.static_data().clone();

        let mut report = MigrationReport::default();
        let mut changes = PendingChanges {
            account: Some(account.pickle(pickle_key)),
            tracked_users: body.tracked_users.clone(),
            ..Default::default()
        };

        for pickle in &body.pickled_sessions {
            match Session::from_pickle(static_account.clone(), pickle, &blob_key) {
                Ok(session) => changes.sessions.push(session.pickle(pickle_key).await),
                Err(error) => report.quarantined.push(QuarantinedEntry {
                    kind: QuarantineKind::Session,
                    id: pickle.session_id.clone(),
                    reason: error.to_string(),
                }),
            }
        }

        for pickle in &body.pickled_inbound_group_sessions {
            match InboundGroupSession::from_pickle(pickle, &blob_key) {
                Ok(session) => {
                    changes.inbound_group_sessions.push(session.pickle(pickle_key).await)
                }
                Err(error) => report.quarantined.push(QuarantinedEntry {
                    kind: QuarantineKind::InboundGroupSession,
                    id: format!("{}|{}", pickle.sender_key.to_base64(), pickle.session_id),
                    reason: error.to_string(),
                }),
            }
        }

        if let Some(export) = &body.cross_signing_export {
            let identity =
                PrivateCrossSigningIdentity::from_secrets(static_account.user_id.clone(), export)?;
            // The public keys were uploaded by the device we migrate from.
            identity.mark_as_shared();
            changes.private_identity = Some(identity.pickle(pickle_key).await);
            report.cross_signing_keys = true;
        }

        report.sessions = changes.sessions.len();
        report.inbound_group_sessions = changes.inbound_group_sessions.len();
        report.tracked_users = changes.tracked_users.len();

        for entry in &report.quarantined {
            warn!(kind = ?entry.kind, id = %entry.id, reason = %entry.reason, "Skipped an entry");
        }

        backend.save_changes(changes).await?;

        info!(
            sessions = report.sessions,
            inbound_group_sessions = report.inbound_group_sessions,
            quarantined = report.quarantined.len(),
            "Imported a migration blob"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches2::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;

    use super::*;
    use crate::{
        olm::EncryptionSettings,
        store::MemoryStore,
        test_helpers::{MockHomeserver, TestDevice},
        types::events::EncryptedContent,
    };

    async fn device_with_state() -> (TestDevice, InboundGroupSession) {
        let server = Arc::new(MockHomeserver::default());
        let alice = TestDevice::new(server.clone(), user_id!("@alice:localhost"), device_id!("A"))
            .await;
        let bob = TestDevice::new(server, user_id!("@bob:localhost"), device_id!("B")).await;

        // An Olm session between the two devices.
        let encrypted = bob
            .sessions
            .encrypt(alice.store.user_id(), alice.store.device_id(), "m.dummy", json!({}))
            .await
            .unwrap();
        assert_matches!(EncryptedContent::from_json(&encrypted), Ok(EncryptedContent::OlmV1(c)));
        alice.sessions.decrypt_to_device(bob.store.user_id(), &c).await.unwrap();

        let (_, session) = alice
            .store
            .static_account()
            .create_group_session_pair(room_id!("!test:localhost"), EncryptionSettings::default())
            .await
            .unwrap();
        alice.store.import_inbound_group_session(session.clone()).await.unwrap();

        (alice, session)
    }

    #[tokio::test]
    async fn blobs_roundtrip_into_a_new_store() {
        let (alice, session) = device_with_state().await;
        let blob = MigrationBlob::export_from(&alice.store).await.unwrap();
        assert_eq!(blob.version(), Some(1));

        let backend = Arc::new(MemoryStore::new());
        let pickle_key = PickleKey::new();
        let report = blob.import_into(&*backend, &pickle_key).await.unwrap();

        assert_eq!(report.sessions, 1);
        assert_eq!(report.inbound_group_sessions, 1);
        assert_eq!(report.tracked_users, alice.store.load_tracked_users().await.unwrap().len());
        assert!(report.quarantined.is_empty());

        let store = Store::open(alice.store.user_id(), alice.store.device_id(), backend, pickle_key)
            .await
            .unwrap();

        assert_eq!(
            store.static_account().identity_keys(),
            alice.store.static_account().identity_keys()
        );

        let sender_key = session.sender_key().to_base64();
        let imported = store.get_inbound_group_session(&sender_key, session.session_id());
        let imported = imported.await.unwrap().unwrap();
        assert_eq!(
            imported.export_at_index(0).await.to_base64(),
            session.export_at_index(0).await.to_base64()
        );

        assert_eq!(store.backend().get_all_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cross_signing_keys_survive_the_migration() {
        let (alice, _) = device_with_state().await;

        let identity = PrivateCrossSigningIdentity::new(alice.store.user_id().to_owned());
        let master_key = identity.master_public_key().await;
        identity.mark_as_shared();
        alice.store.private_identity().replace_with(identity).await;

        let blob = MigrationBlob::export_from(&alice.store).await.unwrap();

        let backend = Arc::new(MemoryStore::new());
        let pickle_key = PickleKey::new();
        let report = blob.import_into(&*backend, &pickle_key).await.unwrap();
        assert!(report.cross_signing_keys);

        let store = Store::open(alice.store.user_id(), alice.store.device_id(), backend, pickle_key)
            .await
            .unwrap();

        assert!(master_key.is_some());
        assert_eq!(store.private_identity().master_public_key().await, master_key);
        assert!(store.private_identity().shared());
    }

    #[tokio::test]
    async fn broken_entries_are_reported() {
        let (alice, session) = device_with_state().await;
        let blob = MigrationBlob::export_from(&alice.store).await.unwrap();

        let mut body = blob.decode().unwrap();
        body.pickled_inbound_group_sessions = vec![session.pickle(&PickleKey::new()).await];
        let blob = MigrationBlob::encode(&body).unwrap();

        let backend = Arc::new(MemoryStore::new());
        let report = blob.import_into(&*backend, &PickleKey::new()).await.unwrap();

        assert_eq!(report.sessions, 1);
        assert_eq!(report.inbound_group_sessions, 0);
        assert_eq!(report.quarantined.len(), 1);
        assert_eq!(report.quarantined[0].kind, QuarantineKind::InboundGroupSession);
        assert!(backend.get_inbound_group_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_versions_are_rejected() {
        let (alice, _) = device_with_state().await;
        let blob = MigrationBlob::export_from(&alice.store).await.unwrap();

        let mut bytes = blob.as_bytes().to_vec();
        bytes[0] = 2;

        let backend = MemoryStore::new();
        let blob = MigrationBlob::from_bytes(bytes);
        assert_matches!(
            blob.import_into(&backend, &PickleKey::new()).await,
            Err(MigrationError::UnsupportedVersion(2))
        );

        let blob = MigrationBlob::from_bytes(Vec::new());
        assert_matches!(
            blob.import_into(&backend, &PickleKey::new()).await,
            Err(MigrationError::Empty)
        );
    }

    #[tokio::test]
    async fn importing_into_a_used_store_fails() {
        let (alice, _) = device_with_state().await;
        let blob = MigrationBlob::export_from(&alice.store).await.unwrap();

        assert_matches!(
            blob.import_into(&**alice.store.backend(), &PickleKey::new()).await,
            Err(MigrationError::AccountExists)
        );
    }
}
