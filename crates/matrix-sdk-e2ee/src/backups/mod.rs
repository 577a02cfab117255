// Copyright 2021 The Matrix.org Foundation C.I.C.
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

//! Server-side backup support for room keys
//!
//! This module implements support for server-side backups using the
//! `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm.
//!
//! The [`BackupMachine`] moves through the states of [`BackupState`], every
//! transition is published through an observable and through the
//! [`EngineEvent`] channel of the store.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex as StdMutex},
};

use eyeball::{SharedObservable, Subscriber};
use ruma::{DeviceId, OwnedDeviceId, RoomId};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    engine_events::EngineEvent,
    error::{MegolmError, SignatureError},
    identities::{IdentityManager, TrustLevel},
    olm::{InboundGroupSession, VerifyJson},
    settings::BackupSettings,
    store::{BackupKeys, Changes, CryptoStoreError, ImportOutcome, RoomKeyCounts, Store},
    transport::{Backoff, CryptoTransport, RetryPolicy, TransportError},
    types::{
        backup::{KeyBackupData, MegolmV1AuthData, RoomKeyBackup, RoomKeyBackupInfo},
        ED25519,
    },
};

mod keys;

pub use keys::{
    BackupRecoveryKey, DecodeError, DecryptionError, MegolmV1BackupKey, PassphraseInfo,
};
pub use crate::types::backup::MEGOLM_BACKUP_V1;

/// The state of the room key backup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackupState {
    /// No backup is active.
    #[default]
    Disabled,
    /// We're fetching the current backup version from the server.
    CheckingServer,
    /// The server has a backup, but none of its signatures are trusted.
    NotTrusted,
    /// The backup is active and every room key is backed up.
    ReadyToBackUp,
    /// The backup is active and some room keys still need to be uploaded.
    WillBackUp,
    /// A batch of room keys is being uploaded.
    BackingUp,
    /// The server replaced or deleted the backup version we were using.
    WrongBackupVersion,
    /// A new backup version is being created.
    Enabling,
}

impl BackupState {
    /// Are room keys being backed up in this state.
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::ReadyToBackUp | Self::WillBackUp | Self::BackingUp)
    }
}

/// Error type for the room key backup.
#[derive(Debug, Error)]
pub enum BackupError {
    /// No backup is active.
    #[error("no backup is active")]
    NotEnabled,

    /// The server doesn't have a backup.
    #[error("the server doesn't have a backup")]
    NoBackup,

    /// The backup uses an algorithm we don't support.
    #[error("the backup algorithm {0} isn't supported")]
    UnsupportedAlgorithm(String),

    /// The recovery key doesn't belong to the backup.
    #[error("the recovery key doesn't match the public key of the backup version {0}")]
    KeyMismatch(String),

    /// A passphrase was given but the backup wasn't created from one.
    #[error("the backup version {0} wasn't created from a passphrase")]
    MissingPassphraseInfo(String),

    /// The server replaced or deleted the backup version.
    #[error("the backup version {0} isn't the current version on the server")]
    WrongBackupVersion(String),

    /// The recovery key couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The auth data couldn't be signed.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// A request to the homeserver failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The engine has been shut down.
    #[error("the encryption engine has been shut down")]
    Closed,
}

/// The secret that unlocks a backup.
#[derive(Clone)]
pub enum BackupRecovery {
    /// The base58 encoded recovery key.
    Key(String),
    /// The passphrase the backup key was derived from.
    Passphrase(String),
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackupRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(_) => f.write_str("BackupRecovery::Key(<redacted>)"),
            Self::Passphrase(_) => f.write_str("BackupRecovery::Passphrase(<redacted>)"),
        }
    }
}

/// The outcome of a restore from the backup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreResult {
    /// How many room keys the backup contained.
    pub total: usize,
    /// How many of them were new or better than the ones we had.
    pub imported: usize,
}

/// The result of a signature verification of a signed JSON object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignatureVerification {
    /// The result of the signature verification using the public key of our own
    /// device.
    pub device_signature: SignatureState,
    /// The result of the signature verification using the public key of our own
    /// user identity.
    pub user_identity_signature: SignatureState,
    /// The result of the signature verification using public keys of other
    /// devices we own.
    pub other_signatures: BTreeMap<OwnedDeviceId, SignatureState>,
}

impl SignatureVerification {
    /// Is the result considered to be trusted?
    ///
    /// This tells us if the result has a valid signature from any of the
    /// following:
    ///
    /// * Our own device
    /// * Our own user identity, provided the identity is trusted as well
    /// * Any of our own devices, provided the device is trusted as well
    pub fn trusted(&self) -> bool {
        self.device_signature.trusted()
            || self.user_identity_signature.trusted()
            || self.other_signatures.values().any(|s| s.trusted())
    }
}

/// The result of a signature check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignatureState {
    /// The signature is missing.
    #[default]
    Missing,
    /// The signature is invalid.
    Invalid,
    /// The signature is valid but the device or user identity that created the
    /// signature is not trusted.
    ValidButNotTrusted,
    /// The signature is valid and the device or user identity that created the
    /// signature is trusted.
    ValidAndTrusted,
}

impl SignatureState {
    /// Is the state considered to be trusted?
    pub fn trusted(self) -> bool {
        self == SignatureState::ValidAndTrusted
    }

    /// Did we find a valid signature?
    pub fn signed(self) -> bool {
        self == SignatureState::ValidButNotTrusted || self == SignatureState::ValidAndTrusted
    }

    fn from_result(result: Result<(), SignatureError>, trusted: bool) -> Self {
        match result {
            Ok(()) if trusted => SignatureState::ValidAndTrusted,
            Ok(()) => SignatureState::ValidButNotTrusted,
            Err(SignatureError::NoSignatureFound) => SignatureState::Missing,
            Err(_) => SignatureState::Invalid,
        }
    }
}

/// A state machine that handles backing up room keys.
///
/// A backup becomes active after [`BackupMachine::create_version`] or after
/// [`BackupMachine::check_server_version`] found a trusted backup on the
/// server. Room keys are then uploaded in batches by
/// [`BackupMachine::backup_sessions`].
#[derive(Clone)]
pub struct BackupMachine {
    store: Store,
    identities: IdentityManager,
    transport: Arc<dyn CryptoTransport>,
    retry: RetryPolicy,
    settings: BackupSettings,
    backup_key: Arc<RwLock<Option<MegolmV1BackupKey>>>,
    state: SharedObservable<BackupState>,
    backoff: Arc<StdMutex<Backoff>>,
    upload_lock: Arc<Mutex<()>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackupMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupMachine")
            .field("state", &self.state())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl BackupMachine {
    pub(crate) fn new(
        store: Store,
        identities: IdentityManager,
        transport: Arc<dyn CryptoTransport>,
        retry: RetryPolicy,
        settings: BackupSettings,
    ) -> Self {
        let backoff = Backoff::new(settings.initial_backoff, settings.max_backoff);

        Self {
            store,
            identities,
            transport,
            retry,
            settings,
            backup_key: Default::default(),
            state: SharedObservable::new(BackupState::Disabled),
            backoff: Arc::new(StdMutex::new(backoff)),
            upload_lock: Default::default(),
        }
    }

    /// Reactivate the backup we were using before a restart.
    ///
    /// Only works if we still hold the private key of the backup, otherwise
    /// [`BackupMachine::check_server_version`] needs to run.
    pub(crate) async fn load_from_store(&self) -> Result<(), BackupError> {
        let BackupKeys { decryption_key: Some(key), backup_version: Some(version) } =
            self.store.load_backup_keys().await?
        else {
            return Ok(());
        };

        let recovery_key = BackupRecoveryKey::decrypt(&key, self.store.pickle_key())
            .map_err(CryptoStoreError::from)?;
        let backup_key = recovery_key.megolm_v1_public_key();
        backup_key.set_version(version);

        debug!(?backup_key, "Restored the backup key from the store");

        *self.backup_key.write().await = Some(backup_key);
        self.settle_state().await
    }

    /// The current state of the backup.
    pub fn state(&self) -> BackupState {
        self.state.get()
    }

    /// Subscribe to the state changes of the backup.
    pub fn subscribe_to_state(&self) -> Subscriber<BackupState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: BackupState) {
        if self.state.set_if_not_eq(state).is_some() {
            info!(?state, "The backup state changed");
            self.store.emit(EngineEvent::BackupStateChanged(state));
        }
    }

    fn check_closed(&self) -> Result<(), BackupError> {
        if self.store.is_closed() {
            Err(BackupError::Closed)
        } else {
            Ok(())
        }
    }

    /// Are we able to back up room keys to the server?
    pub async fn enabled(&self) -> bool {
        self.backup_key.read().await.as_ref().is_some_and(|k| k.backup_version().is_some())
    }

    /// The public key of the active backup.
    pub async fn backup_key(&self) -> Option<MegolmV1BackupKey> {
        self.backup_key.read().await.clone()
    }

    /// Get the number of backed up room keys and the total number of room keys.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError> {
        self.store.inbound_group_session_counts().await
    }

    /// Let the machine know that new room keys were stored.
    pub fn room_keys_added(&self) {
        if self.state() == BackupState::ReadyToBackUp {
            self.set_state(BackupState::WillBackUp);
        }
    }

    /// Move to the steady state that matches the backup progress.
    async fn settle_state(&self) -> Result<(), BackupError> {
        let counts = self.room_key_counts().await?;

        if counts.backed_up < counts.total {
            self.set_state(BackupState::WillBackUp);
        } else {
            self.set_state(BackupState::ReadyToBackUp);
        }

        Ok(())
    }

    /// Forget the active backup and the stored backup keys.
    async fn deactivate(&self) -> Result<(), BackupError> {
        self.backup_key.write().await.take();
        self.backoff.lock().unwrap().success();

        let changes = Changes { backup_keys: Some(BackupKeys::default()), ..Default::default() };
        self.store.save_changes(changes).await?;
        self.store.reset_backup_state().await?;

        Ok(())
    }

    async fn activate(&self, public_key: MegolmV1BackupKey) -> Result<(), BackupError> {
        self.backoff.lock().unwrap().success();
        *self.backup_key.write().await = Some(public_key);
        self.settle_state().await
    }

    /// Store the private key of a backup, so the backup survives a restart.
    pub async fn save_recovery_key(
        &self,
        recovery_key: &BackupRecoveryKey,
        version: String,
    ) -> Result<(), CryptoStoreError> {
        let backup_keys = BackupKeys {
            decryption_key: Some(recovery_key.encrypt(self.store.pickle_key())),
            backup_version: Some(version),
        };

        let changes = Changes { backup_keys: Some(backup_keys), ..Default::default() };
        self.store.save_changes(changes).await
    }

    /// Get the private key of the backup, if we have it.
    pub async fn recovery_key(&self) -> Result<Option<BackupRecoveryKey>, CryptoStoreError> {
        let keys = self.store.load_backup_keys().await?;

        keys.decryption_key
            .map(|k| BackupRecoveryKey::decrypt(&k, self.store.pickle_key()))
            .transpose()
            .map_err(Into::into)
    }

    /// Create a new backup version with a random key and enable it.
    ///
    /// The auth data is signed by our device and, if we have one, by our
    /// master key. Switching to the new version resets the backup state of
    /// every room key.
    pub async fn create_version(&self, algorithm: &str) -> Result<BackupRecoveryKey, BackupError> {
        if algorithm != MEGOLM_BACKUP_V1 {
            return Err(BackupError::UnsupportedAlgorithm(algorithm.to_owned()));
        }

        self.create_version_with_key(BackupRecoveryKey::new()).await
    }

    /// Create a new backup version with a key derived from a passphrase and
    /// enable it.
    pub async fn create_version_from_passphrase(
        &self,
        passphrase: &str,
    ) -> Result<BackupRecoveryKey, BackupError> {
        self.create_version_with_key(BackupRecoveryKey::new_from_passphrase(passphrase)).await
    }

    #[instrument(skip_all)]
    async fn create_version_with_key(
        &self,
        recovery_key: BackupRecoveryKey,
    ) -> Result<BackupRecoveryKey, BackupError> {
        self.check_closed()?;
        self.set_state(BackupState::Enabling);

        match self.upload_new_version(&recovery_key).await {
            Ok(backup_key) => {
                info!(?backup_key, "Created and enabled a new backup version");
                self.activate(backup_key).await?;

                Ok(recovery_key)
            }
            Err(e) => {
                warn!(error = ?e, "Failed to create a new backup version");
                self.set_state(BackupState::Disabled);

                Err(e)
            }
        }
    }

    async fn upload_new_version(
        &self,
        recovery_key: &BackupRecoveryKey,
    ) -> Result<MegolmV1BackupKey, BackupError> {
        let auth_data = self.sign_auth_data(recovery_key.auth_data()).await?;
        let info = RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data);

        let version = self
            .retry
            .run("create_backup_version", || self.transport.create_backup_version(info.clone()))
            .await?;

        self.save_recovery_key(recovery_key, version.clone()).await?;
        self.store.reset_backup_state().await?;

        let backup_key = recovery_key.megolm_v1_public_key();
        backup_key.set_version(version);

        Ok(backup_key)
    }

    async fn sign_auth_data(
        &self,
        mut auth_data: MegolmV1AuthData,
    ) -> Result<MegolmV1AuthData, SignatureError> {
        let json = serde_json::to_value(&auth_data)?;
        let user_id = self.store.user_id().to_owned();

        let signature = self.store.account().await.sign_json(json.clone())?;
        auth_data.signatures.add_signature(
            user_id.clone(),
            self.store.static_account().signing_key_id(),
            signature,
        );

        if let Some((key_id, signature)) =
            self.store.private_identity().sign_json_with_master(json).await?
        {
            auth_data.signatures.add_signature(user_id, key_id, signature);
        }

        Ok(auth_data)
    }

    /// Check if our own device has signed the given auth data.
    fn check_own_device_signature(&self, auth_data: &MegolmV1AuthData) -> SignatureState {
        let account = self.store.static_account();
        let result = account.identity_keys().ed25519.verify_json(
            account.user_id(),
            &account.signing_key_id(),
            auth_data,
        );

        SignatureState::from_result(result, true)
    }

    /// Check if our own cross-signing user identity has signed the given auth
    /// data.
    async fn check_own_identity_signature(
        &self,
        auth_data: &MegolmV1AuthData,
    ) -> Result<SignatureState, CryptoStoreError> {
        // Holding the private master key makes the identity trusted.
        if let Some(master) = self.store.private_identity().master_public_key().await {
            return Ok(SignatureState::from_result(master.has_signed(auth_data), true));
        }

        let Some(identity) = self.store.get_user_identity(self.store.user_id()).await? else {
            return Ok(SignatureState::Missing);
        };

        let trusted = self.identities.trust().is_identity_trusted(&identity).await?;

        Ok(SignatureState::from_result(identity.master_key().has_signed(auth_data), trusted))
    }

    /// Check if the auth data has been signed by any of our other devices.
    async fn test_device_signatures(
        &self,
        auth_data: &MegolmV1AuthData,
    ) -> Result<BTreeMap<OwnedDeviceId, SignatureState>, CryptoStoreError> {
        let mut result = BTreeMap::new();

        let Some(user_signatures) = auth_data.signatures.get(self.store.user_id()) else {
            return Ok(result);
        };

        for key_id in user_signatures.keys() {
            let Some(device_id) = key_id.strip_prefix(&format!("{ED25519}:")) else {
                continue;
            };
            let device_id: &DeviceId = device_id.into();

            // Our own device gets checked by check_own_device_signature().
            if device_id == self.store.device_id() {
                continue;
            }

            let state = self.test_ed25519_device_signature(device_id, auth_data).await?;
            result.insert(device_id.to_owned(), state);

            if state.trusted() {
                break;
            }
        }

        Ok(result)
    }

    async fn test_ed25519_device_signature(
        &self,
        device_id: &DeviceId,
        auth_data: &MegolmV1AuthData,
    ) -> Result<SignatureState, CryptoStoreError> {
        // Signatures of the master key end up here as well, there is no
        // device for them.
        let Some(device) = self.store.get_device_data(self.store.user_id(), device_id).await?
        else {
            trace!(?device_id, "Device not found, can't check signature");
            return Ok(SignatureState::Missing);
        };

        let trusted = self.identities.trust().compute_trust(self.store.user_id(), device_id).await?
            == TrustLevel::Verified;

        Ok(SignatureState::from_result(device.has_signed(auth_data), trusted))
    }

    /// Verify the signatures of a backup version we downloaded from the
    /// server.
    pub async fn verify_backup(
        &self,
        backup_info: &RoomKeyBackupInfo,
    ) -> Result<SignatureVerification, CryptoStoreError> {
        let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) = backup_info else {
            return Ok(Default::default());
        };

        trace!(?auth_data, "Verifying backup auth data");

        let device_signature = self.check_own_device_signature(auth_data);
        let user_identity_signature = self.check_own_identity_signature(auth_data).await?;

        let other_signatures = if device_signature.trusted() || user_identity_signature.trusted() {
            Default::default()
        } else {
            self.test_device_signatures(auth_data).await?
        };

        Ok(SignatureVerification { device_signature, user_identity_signature, other_signatures })
    }

    /// Fetch the current backup version from the server and enable it if we
    /// trust it.
    #[instrument(skip_all)]
    pub async fn check_server_version(&self) -> Result<BackupState, BackupError> {
        self.check_closed()?;
        self.set_state(BackupState::CheckingServer);

        match self.check_server_version_helper().await {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(error = ?e, "Failed to check the backup version on the server");
                self.set_state(BackupState::Disabled);

                Err(e)
            }
        }
    }

    async fn check_server_version_helper(&self) -> Result<BackupState, BackupError> {
        let version =
            self.retry.run("get_backup_version", || self.transport.get_backup_version()).await?;

        let Some(version) = version else {
            info!("The server doesn't have a backup");
            self.deactivate().await?;
            self.set_state(BackupState::Disabled);

            return Ok(BackupState::Disabled);
        };

        let stored = self.store.load_backup_keys().await?;
        let verification = self.verify_backup(&version.info).await?;

        let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) = version.info else {
            warn!(version = %version.version, "The backup on the server uses an unknown algorithm");
            self.deactivate().await?;
            self.set_state(BackupState::NotTrusted);

            return Ok(BackupState::NotTrusted);
        };

        if !verification.trusted() {
            info!(version = %version.version, ?verification, "The backup isn't trusted");

            if stored.backup_version.is_some() {
                self.deactivate().await?;
            }

            self.set_state(BackupState::NotTrusted);

            return Ok(BackupState::NotTrusted);
        }

        if stored.backup_version.as_deref() != Some(version.version.as_str()) {
            debug!(
                previous = stored.backup_version,
                version = %version.version,
                "Switching to a new backup version"
            );

            self.store.reset_backup_state().await?;

            // The private key of another version is useless now.
            let decryption_key = match &stored.decryption_key {
                Some(key) => BackupRecoveryKey::decrypt(key, self.store.pickle_key())
                    .ok()
                    .filter(|k| k.megolm_v1_public_key().public_key() == auth_data.public_key)
                    .map(|_| key.clone()),
                None => None,
            };

            let backup_keys =
                BackupKeys { decryption_key, backup_version: Some(version.version.clone()) };
            self.store
                .save_changes(Changes { backup_keys: Some(backup_keys), ..Default::default() })
                .await?;
        }

        let backup_key = MegolmV1BackupKey::new(auth_data.public_key, Some(version.version));
        info!(?backup_key, "Enabling the backup found on the server");

        self.activate(backup_key).await?;

        Ok(self.state())
    }

    /// Encrypt and upload a batch of room keys that aren't backed up yet.
    ///
    /// Returns the number of room keys that were backed up. After a failed
    /// upload nothing is marked as backed up and further calls return `0`
    /// until the backoff window passed.
    #[instrument(skip_all)]
    pub async fn backup_sessions(&self) -> Result<usize, BackupError> {
        self.check_closed()?;
        let _guard = self.upload_lock.lock().await;

        let Some(backup_key) = self.backup_key.read().await.clone() else {
            return Err(BackupError::NotEnabled);
        };
        let Some(version) = backup_key.backup_version() else {
            return Err(BackupError::NotEnabled);
        };

        if self.backoff.lock().unwrap().is_waiting() {
            trace!("Still backing off after a failed upload");
            return Ok(0);
        }

        let sessions =
            self.store.inbound_group_sessions_for_backup(self.settings.batch_size).await?;

        if sessions.is_empty() {
            trace!("No room keys need to be backed up");
            self.set_state(BackupState::ReadyToBackUp);

            return Ok(0);
        }

        self.set_state(BackupState::BackingUp);

        let mut keys = RoomKeyBackup::new();

        for session in &sessions {
            let data = backup_key.encrypt(session).await;
            keys.entry(session.room_id().to_owned())
                .or_default()
                .insert(session.session_id().to_owned(), data);
        }

        let result = self
            .retry
            .run("put_room_keys", || self.transport.put_room_keys(&version, keys.clone()))
            .await;

        match result {
            Ok(()) => {
                self.store.mark_inbound_group_sessions_as_backed_up(&sessions).await?;
                self.backoff.lock().unwrap().success();

                debug!(count = sessions.len(), version, "Backed up a batch of room keys");

                self.settle_state().await?;

                Ok(sessions.len())
            }
            Err(TransportError::WrongBackupVersion(_) | TransportError::NotFound) => {
                warn!(version, "The backup version was replaced or deleted on the server");

                self.deactivate().await?;
                self.set_state(BackupState::WrongBackupVersion);

                Err(BackupError::WrongBackupVersion(version))
            }
            Err(e) => {
                let delay = self.backoff.lock().unwrap().failure();
                warn!(?delay, error = ?e, "Failed to upload room keys, backing off");

                self.set_state(BackupState::WillBackUp);

                Err(e.into())
            }
        }
    }

    fn decrypt_backed_up_key(
        recovery_key: &BackupRecoveryKey,
        room_id: &RoomId,
        session_id: &str,
        data: &KeyBackupData,
    ) -> Option<InboundGroupSession> {
        let key = match recovery_key.decrypt_v1(&data.session_data) {
            Ok(key) => key,
            Err(error) => {
                warn!(?room_id, session_id, ?error, "Couldn't decrypt a backed up room key");
                return None;
            }
        };

        InboundGroupSession::from_backup(room_id, session_id, &key)
            .map_err(|error| {
                warn!(?room_id, session_id, ?error, "Couldn't import a backed up room key");
            })
            .ok()
    }

    /// Download every room key of the current backup and import them.
    ///
    /// The recovery key, or the key derived from the passphrase, must match
    /// the public key of the backup. Restored room keys are marked as
    /// imported, keys we already have in a better version are left alone.
    #[instrument(skip_all)]
    pub async fn restore(&self, recovery: BackupRecovery) -> Result<RestoreResult, BackupError> {
        self.check_closed()?;

        let version = self
            .retry
            .run("get_backup_version", || self.transport.get_backup_version())
            .await?
            .ok_or(BackupError::NoBackup)?;

        let auth_data = match &version.info {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) => auth_data,
            RoomKeyBackupInfo::Other { algorithm, .. } => {
                return Err(BackupError::UnsupportedAlgorithm(algorithm.clone()));
            }
        };

        let recovery_key = match recovery {
            BackupRecovery::Key(key) => BackupRecoveryKey::from_base58(&key)?,
            BackupRecovery::Passphrase(passphrase) => {
                let (Some(salt), Some(rounds)) =
                    (&auth_data.private_key_salt, auth_data.private_key_iterations)
                else {
                    return Err(BackupError::MissingPassphraseInfo(version.version));
                };

                BackupRecoveryKey::from_passphrase(&passphrase, salt, rounds)
            }
        };

        if recovery_key.megolm_v1_public_key().public_key() != auth_data.public_key {
            return Err(BackupError::KeyMismatch(version.version));
        }

        let room_keys = self
            .retry
            .run("get_room_keys", || self.transport.get_room_keys(&version.version))
            .await?;

        let active_version = self.backup_key.read().await.as_ref().and_then(|k| k.backup_version());
        let from_active_backup = active_version.as_deref() == Some(version.version.as_str());

        let mut result = RestoreResult::default();

        for (room_id, sessions) in room_keys {
            for (session_id, data) in sessions {
                result.total += 1;

                let Some(session) =
                    Self::decrypt_backed_up_key(&recovery_key, &room_id, &session_id, &data)
                else {
                    continue;
                };

                if from_active_backup {
                    session.mark_as_backed_up();
                }

                match self.store.import_inbound_group_session(session).await {
                    Ok(ImportOutcome::Stored) => result.imported += 1,
                    Ok(ImportOutcome::Unchanged) => {}
                    Err(MegolmError::Store(e)) => return Err(e.into()),
                    Err(error) => {
                        warn!(?room_id, session_id, ?error, "Rejected a backed up room key");
                    }
                }
            }
        }

        info!(
            version = %version.version,
            total = result.total,
            imported = result.imported,
            "Restored room keys from the backup"
        );

        self.store.emit(EngineEvent::TrustChanged { user_id: None });

        Ok(result)
    }

    /// Disable and reset our backup state.
    ///
    /// This will remove the backup key and reset the backup state of each
    /// room key we have.
    #[instrument(skip(self))]
    pub async fn disable_backup(&self) -> Result<(), BackupError> {
        debug!("Disabling key backup and resetting backup state for room keys");

        let _guard = self.upload_lock.lock().await;
        self.deactivate().await?;
        self.set_state(BackupState::Disabled);

        debug!("Done disabling backup");

        Ok(())
    }

    /// Delete a backup version from the server, disabling the backup if it
    /// was the active one.
    #[instrument(skip(self))]
    pub async fn delete_version(&self, version: &str) -> Result<(), BackupError> {
        self.check_closed()?;

        self.retry
            .run("delete_backup_version", || self.transport.delete_backup_version(version))
            .await?;

        let active_version = self.backup_key.read().await.as_ref().and_then(|k| k.backup_version());

        if active_version.as_deref() == Some(version) {
            self.disable_backup().await?;
        }

        Ok(())
    }
}
