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

//! Types and traits to implement the storage layer for the [`OlmMachine`]
//!
//! The storage layer for the [`OlmMachine`] can be customized using a trait.
//! Implementing your own [`CryptoStore`]
//!
//! An in-memory only store is provided, persistent stores implement the same
//! trait.
//!
//! Only pickled objects cross the [`CryptoStore`] boundary, the [`Store`]
//! wrapper unpickles them and keeps the live objects cached.
//!
//! [`OlmMachine`]: crate::OlmMachine

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ruma::{
    events::room::history_visibility::HistoryVisibility, DeviceId, OwnedDeviceId, OwnedRoomId,
    OwnedUserId, RoomId, UserId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, warn};
use vodozemac::megolm::SessionOrdering;

mod caches;
mod memorystore;
mod pickle_key;
mod traits;

pub use caches::{
    GroupSessionCache, Quarantine, QuarantineKind, QuarantinedEntry, SessionLocks, SessionStore,
};
pub use memorystore::MemoryStore;
pub use pickle_key::{EncryptedPickleKey, EncryptedValue, KdfInfo, PickleKey, PickleKeyError};
pub use traits::CryptoStore;

use crate::{
    engine_events::{EngineEvent, SecurityAnomaly},
    error::{MegolmError, MegolmResult},
    identities::{DeviceData, UserIdentityData},
    olm::{
        Account, InboundGroupSession, OutboundGroupSession, PickledAccount,
        PickledCrossSigningIdentity, PickledInboundGroupSession, PickledOutboundGroupSession,
        PickledSession, PrivateCrossSigningIdentity, Session, SigningError, StaticAccountData,
    },
    types::EventEncryptionAlgorithm,
};

/// How many events the broadcast channel buffers for slow subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Aggregated changes to be saved in the database, every secret in here is
/// already pickled.
#[derive(Debug, Default)]
pub struct PendingChanges {
    /// The pickled account, replaces the stored one.
    pub account: Option<PickledAccount>,
    /// The pickled private cross-signing identity.
    pub private_identity: Option<PickledCrossSigningIdentity>,
    /// Olm sessions, a session with a known id replaces the stored one.
    pub sessions: Vec<PickledSession>,
    /// Inbound group sessions, keyed by sender key and session id.
    pub inbound_group_sessions: Vec<PickledInboundGroupSession>,
    /// Outbound group sessions, one per room.
    pub outbound_group_sessions: Vec<PickledOutboundGroupSession>,
    /// Newly consumed Megolm message indices.
    pub message_index_digests: Vec<MessageIndexDigest>,
    /// New or updated devices.
    pub devices: Vec<DeviceData>,
    /// New or updated cross-signing identities.
    pub identities: Vec<UserIdentityData>,
    /// Users whose device list we track, with their dirty flag.
    pub tracked_users: Vec<TrackedUser>,
    /// The backup keys, replaces the stored ones.
    pub backup_keys: Option<BackupKeys>,
    /// Per-room encryption settings.
    pub room_settings: BTreeMap<OwnedRoomId, RoomSettings>,
}

impl PendingChanges {
    /// Are there any changes stored or is this an empty `PendingChanges`.
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.private_identity.is_none()
            && self.sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.message_index_digests.is_empty()
            && self.devices.is_empty()
            && self.identities.is_empty()
            && self.tracked_users.is_empty()
            && self.backup_keys.is_none()
            && self.room_settings.is_empty()
    }
}

/// Aggregated changes of live objects, the [`Store`] pickles them before they
/// reach the [`CryptoStore`].
#[derive(Default)]
pub struct Changes {
    /// An account that was already pickled, the [`Store`] owns the live one.
    pub account: Option<PickledAccount>,
    /// Our private cross-signing identity.
    pub private_identity: Option<PrivateCrossSigningIdentity>,
    /// Olm sessions that were created or advanced.
    pub sessions: Vec<Session>,
    /// Inbound group sessions that passed the import rules.
    pub inbound_group_sessions: Vec<InboundGroupSession>,
    /// Outbound group sessions that were created, shared or advanced.
    pub outbound_group_sessions: Vec<OutboundGroupSession>,
    /// Newly consumed Megolm message indices.
    pub message_index_digests: Vec<MessageIndexDigest>,
    /// New or updated devices.
    pub devices: Vec<DeviceData>,
    /// New or updated cross-signing identities.
    pub identities: Vec<UserIdentityData>,
    /// Users whose device list we track, with their dirty flag.
    pub tracked_users: Vec<TrackedUser>,
    /// The backup keys, sealed with the pickle key.
    pub backup_keys: Option<BackupKeys>,
    /// Per-room encryption settings.
    pub room_settings: BTreeMap<OwnedRoomId, RoomSettings>,
}

impl Changes {
    /// Are there any changes stored or is this an empty `Changes` struct.
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.private_identity.is_none()
            && self.sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.message_index_digests.is_empty()
            && self.devices.is_empty()
            && self.identities.is_empty()
            && self.tracked_users.is_empty()
            && self.backup_keys.is_none()
            && self.room_settings.is_empty()
    }
}

/// The digest of the ciphertext that consumed a message index of a Megolm
/// session.
///
/// Digests live as long as their inbound group session, removing the session
/// removes them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIndexDigest {
    /// The base64 encoded Curve25519 key of the session's sender.
    pub sender_key: String,
    /// The id of the Megolm session.
    pub session_id: String,
    /// The consumed message index.
    pub message_index: u32,
    /// The base64 encoded SHA-256 digest of the ciphertext.
    pub digest: String,
}

/// A user for which we are tracking the list of devices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedUser {
    /// The user ID of the user.
    pub user_id: OwnedUserId,
    /// The outdate/dirty flag of the user, remembers if the list of devices
    /// for the user is considered to be out of date. If the list of devices is
    /// out of date, a `/keys/query` request should be sent out for this user.
    pub dirty: bool,
}

/// Struct holding info about how many room keys the store has.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of room keys the store has.
    pub total: usize,
    /// The number of backed up room keys the store has.
    pub backed_up: usize,
}

/// Stored versions of the backup keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupKeys {
    /// The key used to decrypt backed up room keys, sealed with the pickle
    /// key.
    pub decryption_key: Option<EncryptedValue>,
    /// The version that we are using for backups.
    pub backup_version: Option<String>,
}

/// Information on a room's encryption settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,

    /// Should untrusted devices receive the room key, or should they be
    /// excluded from the conversation.
    pub only_allow_trusted_devices: bool,

    /// The history visibility of the room, used to decide if the room key
    /// needs to be rotated when members leave.
    pub history_visibility: Option<HistoryVisibility>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            only_allow_trusted_devices: false,
            history_visibility: None,
        }
    }
}

/// The result of importing an inbound group session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The session was new or better than the stored one and was stored.
    Stored,
    /// We already had a session that is at least as good.
    Unchanged,
}

/// The crypto store's error type.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The store contains an account for a different user or device.
    #[error(
        "the account in the store doesn't match the account in the constructor: \
        expected {}:{}, got {}:{}", .expected.0, .expected.1, .got.0, .got.1
    )]
    MismatchedAccount {
        /// The expected user ID and device ID.
        expected: (OwnedUserId, OwnedDeviceId),
        /// The user ID and device ID found in the store.
        got: (OwnedUserId, OwnedDeviceId),
    },

    /// An error occurred while unpickling an Olm entity.
    #[error("error while unpickling: {0}")]
    Pickle(#[from] vodozemac::PickleError),

    /// An error occurred while unpickling a cross-signing key.
    #[error("error while unpickling a signing key: {0}")]
    Signing(#[from] SigningError),

    /// A value failed to be decrypted with the pickle key.
    #[error(transparent)]
    PickleKey(#[from] PickleKeyError),

    /// The store failed to (de)serialize a data type.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A problem with the underlying database backend
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl CryptoStoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `StoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// A `Result` type alias for the crypto store.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

struct StoreInner {
    static_account: StaticAccountData,
    account: Mutex<Account>,
    identity: PrivateCrossSigningIdentity,
    backend: Arc<dyn CryptoStore>,
    pickle_key: PickleKey,
    sessions: SessionStore,
    outbound_group_sessions: GroupSessionCache,
    locks: SessionLocks,
    quarantine: Quarantine,
    events: broadcast::Sender<EngineEvent>,
    closed: AtomicBool,
}

/// A wrapper for our [`CryptoStore`] trait object.
///
/// The wrapper unpickles the stored objects, caches them, and hands out the
/// per-session locks. Objects that fail to unpickle are quarantined and
/// skipped from then on.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .field("backend", &self.inner.backend)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a new store wrapper around the given account and backend.
    pub fn new(
        account: Account,
        identity: PrivateCrossSigningIdentity,
        backend: Arc<dyn CryptoStore>,
        pickle_key: PickleKey,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(StoreInner {
                static_account: account.static_data().clone(),
                account: Mutex::new(account),
                identity,
                backend,
                pickle_key,
                sessions: SessionStore::new(),
                outbound_group_sessions: GroupSessionCache::default(),
                locks: SessionLocks::default(),
                quarantine: Quarantine::default(),
                events,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Open the store for the given user and device.
    ///
    /// Restores the account and the private cross-signing identity from the
    /// backend, a new account is created and persisted if none is stored.
    #[instrument(skip(backend, pickle_key))]
    pub async fn open(
        user_id: &UserId,
        device_id: &DeviceId,
        backend: Arc<dyn CryptoStore>,
        pickle_key: PickleKey,
    ) -> Result<Self> {
        let account = match backend.load_account().await? {
            Some(pickle) => {
                if pickle.user_id != user_id || pickle.device_id != device_id {
                    return Err(CryptoStoreError::MismatchedAccount {
                        expected: (user_id.to_owned(), device_id.to_owned()),
                        got: (pickle.user_id, pickle.device_id),
                    });
                }

                debug!("Restored an Olm account");
                Account::from_pickle(&pickle, &pickle_key)?
            }
            None => {
                let account = Account::with_device_id(user_id, device_id);
                info!(
                    ed25519_key = %account.identity_keys().ed25519,
                    curve25519_key = %account.identity_keys().curve25519,
                    "Created a new Olm account"
                );

                let changes = PendingChanges {
                    account: Some(account.pickle(&pickle_key)),
                    ..Default::default()
                };
                backend.save_changes(changes).await?;

                account
            }
        };

        let identity = match backend.load_identity().await? {
            Some(pickle) => match PrivateCrossSigningIdentity::from_pickle(&pickle, &pickle_key) {
                Ok(identity) => identity,
                Err(error) => {
                    warn!(?error, "Couldn't restore our private cross-signing identity");
                    PrivateCrossSigningIdentity::empty(user_id)
                }
            },
            None => PrivateCrossSigningIdentity::empty(user_id),
        };

        Ok(Self::new(account, identity, backend, pickle_key))
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.inner.static_account.user_id
    }

    /// Our own device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.static_account.device_id
    }

    /// The immutable data of our account.
    pub fn static_account(&self) -> &StaticAccountData {
        &self.inner.static_account
    }

    /// Lock and get the account.
    pub async fn account(&self) -> MutexGuard<'_, Account> {
        self.inner.account.lock().await
    }

    /// Our private cross-signing identity.
    pub fn private_identity(&self) -> PrivateCrossSigningIdentity {
        self.inner.identity.clone()
    }

    /// The backend this store wraps.
    pub fn backend(&self) -> &Arc<dyn CryptoStore> {
        &self.inner.backend
    }

    /// The key that protects every secret in the backend.
    pub fn pickle_key(&self) -> &PickleKey {
        &self.inner.pickle_key
    }

    /// The per-session locks.
    pub fn locks(&self) -> &SessionLocks {
        &self.inner.locks
    }

    /// The objects that failed to load.
    pub fn quarantine(&self) -> &Quarantine {
        &self.inner.quarantine
    }

    /// Receive the events the engine publishes.
    pub fn subscribe(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.inner.events.subscribe())
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn report_anomaly(&self, anomaly: SecurityAnomaly) {
        warn!(kind = ?anomaly.kind, description = anomaly.description, "Security anomaly");
        self.emit(EngineEvent::SecurityAnomaly(anomaly));
    }

    /// Stop accepting work.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Has the store been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Pickle and persist the given changes, the caches are updated once the
    /// backend accepted them.
    pub async fn save_changes(&self, changes: Changes) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let pickle_key = self.pickle_key();

        let private_identity = match &changes.private_identity {
            Some(identity) => Some(identity.pickle(pickle_key).await),
            None => None,
        };

        let mut sessions = Vec::with_capacity(changes.sessions.len());
        for session in &changes.sessions {
            sessions.push(session.pickle(pickle_key).await);
        }

        let mut inbound_group_sessions = Vec::with_capacity(changes.inbound_group_sessions.len());
        for session in &changes.inbound_group_sessions {
            inbound_group_sessions.push(session.pickle(pickle_key).await);
        }

        let mut outbound_group_sessions =
            Vec::with_capacity(changes.outbound_group_sessions.len());
        for session in &changes.outbound_group_sessions {
            outbound_group_sessions.push(session.pickle(pickle_key).await);
        }

        let pending = PendingChanges {
            account: changes.account,
            private_identity,
            sessions,
            inbound_group_sessions,
            outbound_group_sessions,
            message_index_digests: changes.message_index_digests,
            devices: changes.devices,
            identities: changes.identities,
            tracked_users: changes.tracked_users,
            backup_keys: changes.backup_keys,
            room_settings: changes.room_settings,
        };

        self.inner.backend.save_changes(pending).await?;

        for session in changes.sessions {
            let _guard =
                self.locks().lock(&SessionLocks::cache_key(&session.sender_key.to_base64())).await;
            self.inner.sessions.add_if_cached(session).await;
        }

        for session in changes.outbound_group_sessions {
            self.inner.outbound_group_sessions.insert(session);
        }

        Ok(())
    }

    /// Persist the current state of our account.
    pub async fn save_account(&self) -> Result<()> {
        let pickle = self.account().await.pickle(self.pickle_key());
        self.save_changes(Changes { account: Some(pickle), ..Default::default() }).await
    }

    /// Get all the Olm sessions we share with the given sender key.
    ///
    /// The sessions are loaded into the cache on first access.
    pub async fn get_sessions(
        &self,
        sender_key: &str,
    ) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        if let Some(sessions) = self.inner.sessions.get(sender_key) {
            return Ok(Some(sessions));
        }

        let _guard = self.locks().lock(&SessionLocks::cache_key(sender_key)).await;

        // Someone else might have loaded the sessions while we waited.
        if let Some(sessions) = self.inner.sessions.get(sender_key) {
            return Ok(Some(sessions));
        }

        let pickles = self.inner.backend.get_sessions(sender_key).await?;

        if pickles.is_empty() {
            return Ok(None);
        }

        let sessions = pickles
            .iter()
            .filter(|p| !self.quarantine().contains(QuarantineKind::Session, &p.session_id))
            .filter_map(|p| {
                Session::from_pickle(self.inner.static_account.clone(), p, self.pickle_key())
                    .map_err(|error| {
                        warn!(session_id = %p.session_id, ?error, "Quarantining an Olm session");
                        self.quarantine().insert(
                            QuarantineKind::Session,
                            &p.session_id,
                            error.to_string(),
                        );
                    })
                    .ok()
            })
            .collect();

        Ok(Some(self.inner.sessions.set_for_sender(sender_key, sessions)))
    }

    fn unpickle_inbound(&self, pickle: &PickledInboundGroupSession) -> Option<InboundGroupSession> {
        let id = format!("{}|{}", pickle.sender_key.to_base64(), pickle.session_id);

        if self.quarantine().contains(QuarantineKind::InboundGroupSession, &id) {
            return None;
        }

        match InboundGroupSession::from_pickle(pickle, self.pickle_key()) {
            Ok(session) => Some(session),
            Err(error) => {
                warn!(session_id = %pickle.session_id, ?error, "Quarantining a group session");
                self.quarantine().insert(
                    QuarantineKind::InboundGroupSession,
                    &id,
                    error.to_string(),
                );
                None
            }
        }
    }

    /// Get the inbound group session with the given sender key and session
    /// id.
    pub async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self
            .inner
            .backend
            .get_inbound_group_session(sender_key, session_id)
            .await?
            .and_then(|p| self.unpickle_inbound(&p)))
    }

    /// Get every inbound group session that carries the given session id.
    pub async fn get_inbound_group_sessions_with_id(
        &self,
        session_id: &str,
    ) -> Result<Vec<InboundGroupSession>> {
        let pickles = self.inner.backend.get_inbound_group_sessions_with_id(session_id).await?;
        Ok(pickles.iter().filter_map(|p| self.unpickle_inbound(p)).collect())
    }

    /// Get all the inbound group sessions we have.
    pub async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        let pickles = self.inner.backend.get_inbound_group_sessions().await?;
        Ok(pickles.iter().filter_map(|p| self.unpickle_inbound(p)).collect())
    }

    /// Get up to `limit` inbound group sessions that still need to be backed
    /// up.
    pub async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>> {
        let pickles = self.inner.backend.inbound_group_sessions_for_backup(limit).await?;
        Ok(pickles.iter().filter_map(|p| self.unpickle_inbound(p)).collect())
    }

    /// Mark the given sessions as backed up.
    pub async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        sessions: &[InboundGroupSession],
    ) -> Result<()> {
        let keys: Vec<_> = sessions
            .iter()
            .map(|s| (s.sender_key().to_base64(), s.session_id().to_owned()))
            .collect();

        self.inner.backend.mark_inbound_group_sessions_as_backed_up(&keys).await?;

        for session in sessions {
            session.mark_as_backed_up();
        }

        Ok(())
    }

    /// Mark every inbound group session as not backed up.
    pub async fn reset_backup_state(&self) -> Result<()> {
        self.inner.backend.reset_backup_state().await
    }

    /// How many room keys we have and how many of them are backed up.
    pub async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        self.inner.backend.inbound_group_session_counts().await
    }

    /// Store an inbound group session if it improves what we have.
    ///
    /// * Nothing stored under the sender key and session id: the session is
    ///   stored.
    /// * The stored session knows the same or an earlier index: nothing
    ///   changes.
    /// * The candidate knows an earlier index: it replaces the stored one if
    ///   both ratchets connect, otherwise the import is rejected.
    ///
    /// The replay ledger of the session is kept on an upgrade, indices that
    /// were already consumed stay bound to their ciphertext.
    #[instrument(skip_all, fields(session_id = session.session_id()))]
    pub async fn import_inbound_group_session(
        &self,
        session: InboundGroupSession,
    ) -> MegolmResult<ImportOutcome> {
        let sender_key = session.sender_key().to_base64();
        let _guard = self
            .locks()
            .lock(&SessionLocks::megolm_key(&sender_key, session.session_id()))
            .await;

        if let Some(stored) =
            self.get_inbound_group_session(&sender_key, session.session_id()).await?
        {
            match session.compare(&stored).await {
                SessionOrdering::Better => {
                    info!(
                        stored_index = stored.first_known_index(),
                        imported_index = session.first_known_index(),
                        "Replacing a room key with a better version"
                    );
                }
                SessionOrdering::Unconnected => {
                    let error = MegolmError::MismatchedSessions(session.session_id().to_owned());

                    if let Some(anomaly) = SecurityAnomaly::from_megolm_error(&error) {
                        self.report_anomaly(anomaly);
                    }

                    return Err(error);
                }
                SessionOrdering::Equal | SessionOrdering::Worse => {
                    debug!(
                        stored_index = stored.first_known_index(),
                        imported_index = session.first_known_index(),
                        "Ignoring a room key, we already have a better version"
                    );

                    return Ok(ImportOutcome::Unchanged);
                }
            }
        }

        self.save_changes(Changes { inbound_group_sessions: vec![session], ..Default::default() })
            .await?;

        Ok(ImportOutcome::Stored)
    }

    /// Remove an inbound group session and its replay ledger.
    pub async fn remove_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<bool> {
        let _guard = self.locks().lock(&SessionLocks::megolm_key(sender_key, session_id)).await;
        self.inner.backend.remove_inbound_group_session(sender_key, session_id).await
    }

    /// Get the active outbound group session of the given room.
    pub async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>> {
        if let Some(session) = self.inner.outbound_group_sessions.get(room_id) {
            return Ok(Some(session));
        }

        let id = room_id.as_str();

        if self.quarantine().contains(QuarantineKind::OutboundGroupSession, id) {
            return Ok(None);
        }

        let Some(pickle) = self.inner.backend.get_outbound_group_session(room_id).await? else {
            return Ok(None);
        };

        match OutboundGroupSession::from_pickle(
            self.inner.static_account.clone(),
            &pickle,
            self.pickle_key(),
        ) {
            Ok(session) => {
                self.inner.outbound_group_sessions.insert(session.clone());
                Ok(Some(session))
            }
            Err(error) => {
                warn!(?room_id, ?error, "Quarantining an outbound group session");
                self.quarantine().insert(
                    QuarantineKind::OutboundGroupSession,
                    id,
                    error.to_string(),
                );
                Ok(None)
            }
        }
    }

    /// Check a decrypted message index against the replay ledger.
    ///
    /// Returns the digest that needs to be recorded, `None` if the same
    /// ciphertext was already seen at this index. A different ciphertext at a
    /// recorded index is a replay.
    pub async fn check_message_index(
        &self,
        sender_key: &str,
        session_id: &str,
        message_index: u32,
        digest: String,
    ) -> MegolmResult<Option<MessageIndexDigest>> {
        match self
            .inner
            .backend
            .get_message_index_digest(sender_key, session_id, message_index)
            .await?
        {
            Some(stored) if stored == digest => Ok(None),
            Some(_) => {
                let error = MegolmError::MegolmReplayAttack {
                    session_id: session_id.to_owned(),
                    index: message_index,
                };

                if let Some(anomaly) = SecurityAnomaly::from_megolm_error(&error) {
                    self.report_anomaly(anomaly);
                }

                Err(error)
            }
            None => Ok(Some(MessageIndexDigest {
                sender_key: sender_key.to_owned(),
                session_id: session_id.to_owned(),
                message_index,
                digest,
            })),
        }
    }

    /// Get the device of the given user with the given device id.
    pub async fn get_device_data(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>> {
        self.inner.backend.get_device(user_id, device_id).await
    }

    /// Get all the devices of the given user, devices that were deleted on
    /// the server are skipped.
    pub async fn get_user_devices_data(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>> {
        let mut devices = self.inner.backend.get_user_devices(user_id).await?;
        devices.retain(|_, d| !d.is_deleted());
        Ok(devices)
    }

    /// Find the device of the given user that owns the given Curve25519 key.
    pub async fn get_device_from_curve_key(
        &self,
        user_id: &UserId,
        curve_key: vodozemac::Curve25519PublicKey,
    ) -> Result<Option<DeviceData>> {
        Ok(self
            .get_user_devices_data(user_id)
            .await?
            .into_values()
            .find(|d| d.curve25519_key() == Some(curve_key)))
    }

    /// Get the public cross-signing identity of the given user.
    pub async fn get_user_identity(&self, user_id: &UserId) -> Result<Option<UserIdentityData>> {
        self.inner.backend.get_user_identity(user_id).await
    }

    /// Load the users whose device lists we track.
    pub async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>> {
        self.inner.backend.load_tracked_users().await
    }

    /// Load the stored backup keys.
    pub async fn load_backup_keys(&self) -> Result<BackupKeys> {
        self.inner.backend.load_backup_keys().await
    }

    /// Get the settings of the given room, the defaults if none are stored.
    pub async fn get_room_settings(&self, room_id: &RoomId) -> Result<RoomSettings> {
        Ok(self.inner.backend.get_room_settings(room_id).await?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use futures_util::{FutureExt, StreamExt};
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;

    use super::*;
    use crate::{olm::EncryptionSettings, types::events::EncryptedContent};

    async fn store() -> Store {
        Store::open(
            user_id!("@alice:localhost"),
            device_id!("ALICE"),
            Arc::new(MemoryStore::new()),
            PickleKey::new(),
        )
        .await
        .unwrap()
    }

    async fn session_pair(store: &Store) -> (OutboundGroupSession, InboundGroupSession) {
        store
            .static_account()
            .create_group_session_pair(room_id!("!test:localhost"), EncryptionSettings::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_creates_and_restores_the_account() {
        let backend: Arc<dyn CryptoStore> = Arc::new(MemoryStore::new());
        let pickle_key = PickleKey::new();
        let alice = user_id!("@alice:localhost");

        let store = Store::open(alice, device_id!("ALICE"), backend.clone(), pickle_key.clone())
            .await
            .unwrap();
        let identity_keys = store.account().await.identity_keys();

        let restored = Store::open(alice, device_id!("ALICE"), backend.clone(), pickle_key.clone())
            .await
            .unwrap();
        assert_eq!(restored.account().await.identity_keys(), identity_keys);

        let result = Store::open(alice, device_id!("OTHER"), backend, pickle_key).await;
        assert_let!(Err(CryptoStoreError::MismatchedAccount { .. }) = result);
    }

    #[tokio::test]
    async fn open_with_the_wrong_pickle_key_fails() {
        let backend: Arc<dyn CryptoStore> = Arc::new(MemoryStore::new());
        let alice = user_id!("@alice:localhost");

        Store::open(alice, device_id!("ALICE"), backend.clone(), PickleKey::new()).await.unwrap();

        let result = Store::open(alice, device_id!("ALICE"), backend, PickleKey::new()).await;
        assert_let!(Err(CryptoStoreError::Pickle(_)) = result);
    }

    #[tokio::test]
    async fn importing_a_new_session_stores_it() {
        let store = store().await;
        let (_, inbound) = session_pair(&store).await;

        let outcome = store.import_inbound_group_session(inbound.clone()).await.unwrap();
        assert_eq!(outcome, ImportOutcome::Stored);

        let outcome = store.import_inbound_group_session(inbound.clone()).await.unwrap();
        assert_eq!(outcome, ImportOutcome::Unchanged);

        let sender_key = inbound.sender_key().to_base64();
        assert!(store
            .get_inbound_group_session(&sender_key, inbound.session_id())
            .await
            .unwrap()
            .is_some());
    }

    async fn session_at(inbound: &InboundGroupSession, session_key: String) -> InboundGroupSession {
        let mut backup = inbound.to_backup().await;
        backup.session_key = session_key;
        InboundGroupSession::from_backup(inbound.room_id(), inbound.session_id(), &backup).unwrap()
    }

    #[tokio::test]
    async fn importing_a_worse_session_is_ignored() {
        let store = store().await;
        let (_, inbound) = session_pair(&store).await;
        store.import_inbound_group_session(inbound.clone()).await.unwrap();

        let later = session_at(&inbound, inbound.export_at_index(1).await.to_base64()).await;
        assert_eq!(later.first_known_index(), 1);

        let outcome = store.import_inbound_group_session(later).await.unwrap();
        assert_eq!(outcome, ImportOutcome::Unchanged);
    }

    #[tokio::test]
    async fn importing_a_better_session_replaces_the_stored_one() {
        let store = store().await;
        let (outbound, inbound) = session_pair(&store).await;
        let sender_key = inbound.sender_key().to_base64();

        let first = outbound.encrypt("m.room.message", json!({ "body": "first" })).await.unwrap();
        assert_let!(Ok(EncryptedContent::MegolmV1(first)) = EncryptedContent::from_json(&first));
        let later = session_at(&inbound, inbound.export_at_index(1).await.to_base64()).await;
        store.import_inbound_group_session(later).await.unwrap();

        let stored = store.get_inbound_group_session(&sender_key, inbound.session_id()).await;
        assert_eq!(stored.unwrap().unwrap().first_known_index(), 1);

        let mut events = store.subscribe();
        let outcome = store.import_inbound_group_session(inbound.clone()).await.unwrap();
        assert_eq!(outcome, ImportOutcome::Stored);

        let stored = store
            .get_inbound_group_session(&sender_key, inbound.session_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.first_known_index(), 0);
        assert!(stored.decrypt(&first).await.is_ok());

        // Upgrades are not anomalies.
        assert!(events.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn upgrades_keep_the_replay_ledger() {
        let store = store().await;
        let (_, inbound) = session_pair(&store).await;
        let sender_key = inbound.sender_key().to_base64();

        let later = session_at(&inbound, inbound.export_at_index(1).await.to_base64()).await;
        store.import_inbound_group_session(later).await.unwrap();

        let digest = store
            .check_message_index(&sender_key, inbound.session_id(), 1, "seen".to_owned())
            .await
            .unwrap()
            .unwrap();
        store
            .save_changes(Changes { message_index_digests: vec![digest], ..Default::default() })
            .await
            .unwrap();

        store.import_inbound_group_session(inbound.clone()).await.unwrap();

        let replay = store
            .check_message_index(&sender_key, inbound.session_id(), 1, "other".to_owned())
            .await;
        assert_let!(Err(MegolmError::MegolmReplayAttack { index: 1, .. }) = replay);
    }

    #[tokio::test]
    async fn removing_a_session_forgets_its_ledger() {
        let store = store().await;
        let (_, inbound) = session_pair(&store).await;
        let sender_key = inbound.sender_key().to_base64();
        let session_id = inbound.session_id().to_owned();
        store.import_inbound_group_session(inbound).await.unwrap();

        let digest = store
            .check_message_index(&sender_key, &session_id, 0, "seen".to_owned())
            .await
            .unwrap()
            .unwrap();
        store
            .save_changes(Changes { message_index_digests: vec![digest], ..Default::default() })
            .await
            .unwrap();

        assert!(store.remove_inbound_group_session(&sender_key, &session_id).await.unwrap());
        assert!(store.get_inbound_group_session(&sender_key, &session_id).await.unwrap().is_none());

        let fresh =
            store.check_message_index(&sender_key, &session_id, 0, "other".to_owned()).await;
        assert_let!(Ok(Some(_)) = fresh);
    }

    #[tokio::test]
    async fn unconnected_sessions_are_rejected() {
        let store = store().await;
        let (_, inbound) = session_pair(&store).await;

        let later = session_at(&inbound, inbound.export_at_index(1).await.to_base64()).await;
        store.import_inbound_group_session(later).await.unwrap();

        // Same session id and sender key, but a different ratchet. The
        // exported key is a version byte and the index followed by the
        // ratchet.
        let mut forged =
            vodozemac::base64_decode(inbound.export_at_index(0).await.to_base64()).unwrap();
        forged[5] ^= 0xff;
        let forged = session_at(&inbound, vodozemac::base64_encode(forged)).await;

        let result = store.import_inbound_group_session(forged).await;
        assert_let!(Err(MegolmError::MismatchedSessions(_)) = result);
    }

    #[tokio::test]
    async fn replayed_message_indices_are_detected() {
        let store = store().await;

        let digest = store
            .check_message_index("sender", "session", 0, "first".to_owned())
            .await
            .unwrap()
            .unwrap();
        store
            .save_changes(Changes { message_index_digests: vec![digest], ..Default::default() })
            .await
            .unwrap();

        let same = store.check_message_index("sender", "session", 0, "first".to_owned()).await;
        assert_let!(Ok(None) = same);

        let replay = store.check_message_index("sender", "session", 0, "second".to_owned()).await;
        assert_let!(Err(MegolmError::MegolmReplayAttack { index: 0, .. }) = replay);
    }

    #[tokio::test]
    async fn corrupted_sessions_are_quarantined() {
        let store = store().await;
        let (_, inbound) = session_pair(&store).await;

        let pickle = inbound.pickle(&PickleKey::new()).await;
        store
            .backend()
            .save_changes(PendingChanges {
                inbound_group_sessions: vec![pickle],
                ..Default::default()
            })
            .await
            .unwrap();

        let sender_key = inbound.sender_key().to_base64();
        let loaded = store.get_inbound_group_session(&sender_key, inbound.session_id()).await;
        assert!(loaded.unwrap().is_none());
        assert!(store.quarantine().contains(
            QuarantineKind::InboundGroupSession,
            &format!("{sender_key}|{}", inbound.session_id())
        ));
    }

    #[tokio::test]
    async fn outbound_sessions_are_cached() {
        let store = store().await;
        let (outbound, _) = session_pair(&store).await;
        let room_id = outbound.room_id().to_owned();

        assert!(store.get_outbound_group_session(&room_id).await.unwrap().is_none());

        store
            .save_changes(Changes {
                outbound_group_sessions: vec![outbound.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let loaded = store.get_outbound_group_session(&room_id).await.unwrap().unwrap();
        assert_eq!(loaded.session_id(), outbound.session_id());
    }
}
