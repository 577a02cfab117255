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

use std::{collections::BTreeMap, fmt, ops::Deref, sync::Arc};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, trace};
use vodozemac::{
    olm::{
        Account as InnerAccount, AccountPickle, IdentityKeys, PreKeyMessage, SessionConfig,
    },
    Curve25519PublicKey, Ed25519Signature, PickleError,
};

use super::{
    utility::to_signable_json, EncryptionSettings, InboundGroupSession, OutboundGroupSession,
    Session,
};
use crate::{
    error::{EventError, OlmResult, SessionCreationError, SignatureError},
    identities::DeviceData,
    store::PickleKey,
    types::{
        key_id, requests::KeysUploadRequest, CrossSigningKey, DeviceKeys, SignedKey,
        SIGNED_CURVE25519,
    },
};

/// A pickled version of an [`Account`].
///
/// Holds all the information that needs to be stored in a database to restore
/// an account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device id of the account owner.
    pub device_id: OwnedDeviceId,
    /// The encrypted pickle of the Olm account.
    pub pickle: String,
    /// Was the account shared.
    pub shared: bool,
    /// The number of uploaded one-time keys we have on the server.
    pub uploaded_signed_key_count: u64,
}

/// The parts of an [`Account`] that never change once it was created.
///
/// This is cheap to clone and is handed to every session we create.
#[derive(Clone)]
pub struct StaticAccountData {
    /// The user_id this account belongs to.
    pub user_id: OwnedUserId,
    /// The device_id of this entry.
    pub device_id: OwnedDeviceId,
    /// The associated identity keys.
    pub identity_keys: Arc<IdentityKeys>,
}

impl fmt::Debug for StaticAccountData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAccountData")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("curve25519_key", &self.identity_keys.curve25519.to_base64())
            .finish()
    }
}

impl StaticAccountData {
    /// Get the user id of the owner of the account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Get the device ID that owns this account.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the public parts of the identity keys for the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        *self.identity_keys
    }

    /// The key id of our Ed25519 device key, `ed25519:<device_id>`.
    pub fn signing_key_id(&self) -> String {
        DeviceKeys::ed25519_key_id(&self.device_id)
    }

    /// Create a group session pair.
    ///
    /// This session pair can be used to encrypt and decrypt messages meant
    /// for a large group of participants.
    ///
    /// The outbound session is used to encrypt messages while the inbound one
    /// is used to decrypt messages encrypted by the outbound one.
    pub async fn create_group_session_pair(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Result<(OutboundGroupSession, InboundGroupSession), SessionCreationError> {
        trace!(?room_id, algorithm = %settings.algorithm, "Creating a new outbound group session");

        let visibility = settings.history_visibility.clone();
        let outbound = OutboundGroupSession::new(self.clone(), room_id, settings)?;
        let inbound = InboundGroupSession::new(
            self.identity_keys.curve25519,
            self.identity_keys.ed25519,
            room_id,
            &outbound.session_key().await,
            Some(visibility),
        );

        Ok((outbound, inbound))
    }

    /// Get the unsigned device keys of our device.
    pub fn unsigned_device_keys(&self) -> DeviceKeys {
        DeviceKeys::new(
            self.user_id.clone(),
            self.device_id.clone(),
            self.identity_keys.curve25519,
            self.identity_keys.ed25519,
        )
    }
}

/// Account holding identity keys for which sessions can be created.
///
/// An account is the central identity for encrypted communication between two
/// devices.
pub struct Account {
    pub(crate) static_data: StaticAccountData,
    /// `vodozemac` account.
    inner: Box<InnerAccount>,
    /// Is this account ready to encrypt messages? (i.e. has it shared keys with
    /// a homeserver)
    shared: bool,
    /// The number of signed one-time keys we have uploaded to the server.
    /// Depending on the count we will suggest the client to upload new keys.
    uploaded_signed_key_count: u64,
}

impl Deref for Account {
    type Target = StaticAccountData;

    fn deref(&self) -> &Self::Target {
        &self.static_data
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("identity_keys", &self.identity_keys())
            .field("shared", &self.shared())
            .finish()
    }
}

impl Account {
    fn new_helper(account: InnerAccount, user_id: &UserId, device_id: &DeviceId) -> Self {
        let identity_keys = account.identity_keys();

        Self {
            static_data: StaticAccountData {
                user_id: user_id.into(),
                device_id: device_id.into(),
                identity_keys: Arc::new(identity_keys),
            },
            inner: Box::new(account),
            shared: false,
            uploaded_signed_key_count: 0,
        }
    }

    /// Create a fresh new account, this will generate the identity key-pair.
    pub fn with_device_id(user_id: &UserId, device_id: &DeviceId) -> Self {
        let account = InnerAccount::new();

        Self::new_helper(account, user_id, device_id)
    }

    /// Create a new account with a random device id.
    pub fn new(user_id: &UserId) -> Self {
        let device_id = DeviceId::new();
        Self::with_device_id(user_id, &device_id)
    }

    /// Get the immutable data for this account.
    pub fn static_data(&self) -> &StaticAccountData {
        &self.static_data
    }

    /// Has the account been shared with the server.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Get the number of one-time keys the server holds for us.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_signed_key_count
    }

    /// Update the uploaded key count.
    ///
    /// # Arguments
    ///
    /// * `new_count` - The new count that was reported by the server.
    pub fn update_uploaded_key_count(&mut self, new_count: u64) {
        self.uploaded_signed_key_count = new_count;
    }

    /// Get the currently unpublished one-time keys.
    pub fn one_time_keys(&self) -> BTreeMap<String, Curve25519PublicKey> {
        self.inner
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| (key_id.to_base64(), key))
            .collect()
    }

    /// Generate count number of one-time keys.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        let _ = self.inner.generate_one_time_keys(count);
    }

    /// Get the maximum number of one-time keys we should keep on the server.
    ///
    /// This is half of the number of keys the account can hold, so the server
    /// can be topped up while old keys are still in flight.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys() / 2
    }

    /// Generate new one-time keys if the server is running low on them.
    ///
    /// Returns the number of keys that were generated, `None` if the server
    /// holds enough keys.
    pub fn generate_one_time_keys_if_needed(&mut self) -> Option<u64> {
        // Keys that weren't uploaded yet are handed out again instead.
        if !self.one_time_keys().is_empty() {
            return Some(0);
        }

        let count = self.uploaded_key_count();
        let max_keys = self.max_one_time_keys();

        if count >= max_keys as u64 {
            return None;
        }

        let key_count = (max_keys as u64) - count;
        let key_count: usize = key_count.try_into().unwrap_or(max_keys);

        self.generate_one_time_keys(key_count);

        Some(key_count as u64)
    }

    /// Get the device keys and one-time keys that need to be uploaded.
    ///
    /// The device keys are only part of the request if the account wasn't
    /// shared yet.
    pub fn keys_for_upload(&self) -> KeysUploadRequest {
        KeysUploadRequest {
            device_keys: (!self.shared()).then(|| self.device_keys()),
            one_time_keys: self.signed_one_time_keys(),
        }
    }

    /// Mark the current set of one-time keys as being published.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Process the response of a keys upload.
    #[instrument(skip_all, fields(one_time_key_count))]
    pub fn receive_keys_upload_response(&mut self, one_time_key_count: u64) {
        if !self.shared() {
            debug!("Marking account as shared");
        }

        self.mark_as_shared();
        self.mark_keys_as_published();
        self.update_uploaded_key_count(one_time_key_count);

        info!(one_time_key_count, "Uploaded one-time keys");
    }

    /// Sign the given string using the accounts signing key.
    pub fn sign(&self, string: &str) -> Ed25519Signature {
        self.inner.sign(string)
    }

    /// Convert a JSON value to the canonical representation and sign the JSON
    /// string.
    ///
    /// # Arguments
    ///
    /// * `json` - The value that should be converted into a canonical JSON
    ///   string.
    pub fn sign_json(&self, json: Value) -> Result<Ed25519Signature, SignatureError> {
        Ok(self.sign(&to_signable_json(json)?))
    }

    /// Sign the device keys of the account and return them so they can be
    /// uploaded.
    pub fn device_keys(&self) -> DeviceKeys {
        let mut device_keys = self.unsigned_device_keys();

        let json_device_keys =
            serde_json::to_value(&device_keys).expect("device key is always safe to serialize");
        let signature = self
            .sign_json(json_device_keys)
            .expect("Newly created device keys can always be signed");

        device_keys.signatures.add_signature(
            self.user_id().to_owned(),
            self.signing_key_id(),
            signature,
        );

        device_keys
    }

    /// Add a signature of our device key to the given cross-signing key.
    pub fn sign_cross_signing_key(
        &self,
        cross_signing_key: &mut CrossSigningKey,
    ) -> Result<(), SignatureError> {
        let signature = self.sign_json(serde_json::to_value(&*cross_signing_key)?)?;

        cross_signing_key.signatures.add_signature(
            self.user_id().to_owned(),
            self.signing_key_id(),
            signature,
        );

        Ok(())
    }

    /// Sign a single one-time key.
    pub fn sign_key(&self, key: Curve25519PublicKey) -> SignedKey {
        let mut signed_key = SignedKey { key: key.to_base64(), signatures: Default::default() };

        let json = serde_json::to_value(&signed_key).expect("a signed key is always serializable");
        let signature = self.sign_json(json).expect("a signed key is always an object");

        signed_key.signatures.add_signature(
            self.user_id().to_owned(),
            self.signing_key_id(),
            signature,
        );

        signed_key
    }

    /// Generate, sign and prepare one-time keys to be uploaded.
    ///
    /// The keys are keyed by `signed_curve25519:<key id>`.
    pub fn signed_one_time_keys(&self) -> BTreeMap<String, SignedKey> {
        self.one_time_keys()
            .into_iter()
            .map(|(name, key)| (key_id(SIGNED_CURVE25519, &name), self.sign_key(key)))
            .collect()
    }

    /// Create a new session with another account given a one-time key.
    ///
    /// Returns the newly created session or a `SessionCreationError` if
    /// creating a session failed.
    ///
    /// # Arguments
    ///
    /// * `device` - The other account's device.
    ///
    /// * `key_map` - A map from the algorithm and device ID to the one-time key
    ///   that the other account created and shared with us.
    #[instrument(
        skip_all,
        fields(user_id = ?device.user_id(), device_id = ?device.device_id())
    )]
    pub fn create_outbound_session(
        &self,
        device: &DeviceData,
        key_map: &BTreeMap<String, SignedKey>,
    ) -> Result<Session, SessionCreationError> {
        let (key_id, one_time_key) = key_map.iter().next().ok_or_else(|| {
            SessionCreationError::OneTimeKeyMissing(
                device.user_id().to_owned(),
                device.device_id().into(),
            )
        })?;

        if !key_id.starts_with(&format!("{SIGNED_CURVE25519}:")) {
            return Err(SessionCreationError::OneTimeKeyNotSigned(
                device.user_id().to_owned(),
                device.device_id().into(),
            ));
        }

        device.verify_one_time_key(one_time_key).map_err(|error| {
            SessionCreationError::InvalidSignature {
                one_time_key: one_time_key.key.clone(),
                signing_key: device.ed25519_key().map(Box::new),
                error: Box::new(error),
            }
        })?;

        let identity_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().to_owned(),
                device.device_id().into(),
            )
        })?;

        let one_time_key = Curve25519PublicKey::from_base64(&one_time_key.key)?;

        let session = self.inner.create_outbound_session(
            SessionConfig::version_1(),
            identity_key,
            one_time_key,
        );

        debug!(session_id = session.session_id(), "Created a new outbound Olm session");

        Ok(Session::new(
            self.static_data.clone(),
            device.user_id().to_owned(),
            Some(device.device_id().to_owned()),
            identity_key,
            session,
        ))
    }

    /// Create a new session with another account given a pre-key Olm message.
    ///
    /// Returns the newly created session and the decrypted plaintext. The
    /// one-time key that was used is removed from the account.
    ///
    /// # Arguments
    ///
    /// * `sender` - The user that sent the pre-key message.
    ///
    /// * `their_identity_key` - The other account's identity/curve25519 key.
    ///
    /// * `message` - A pre-key Olm message that was sent to us by the other
    ///   account.
    pub fn create_inbound_session(
        &mut self,
        sender: &UserId,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> OlmResult<(Session, String)> {
        let result = self
            .inner
            .create_inbound_session(their_identity_key, message)
            .map_err(SessionCreationError::from)?;

        let plaintext =
            String::from_utf8(result.plaintext).map_err(|_| EventError::MalformedCiphertext)?;

        debug!(
            session_id = result.session.session_id(),
            "Created a new inbound Olm session from a pre-key message"
        );

        let session = Session::new(
            self.static_data.clone(),
            sender.to_owned(),
            None,
            their_identity_key,
            result.session,
        );

        Ok((session, plaintext))
    }

    /// Get a serializable, encrypted, version of the `Account` so it can be
    /// persisted.
    pub fn pickle(&self, pickle_key: &PickleKey) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id().to_owned(),
            device_id: self.device_id().to_owned(),
            pickle: self.inner.pickle().encrypt(pickle_key.as_bytes()),
            shared: self.shared(),
            uploaded_signed_key_count: self.uploaded_key_count(),
        }
    }

    /// Restore an account from a previously pickled one.
    ///
    /// # Arguments
    ///
    /// * `pickle` - The pickled version of the Account.
    ///
    /// * `pickle_key` - The key the account was pickled with.
    pub fn from_pickle(
        pickle: &PickledAccount,
        pickle_key: &PickleKey,
    ) -> Result<Self, PickleError> {
        let inner = AccountPickle::from_encrypted(&pickle.pickle, pickle_key.as_bytes())?;
        let account = InnerAccount::from_pickle(inner);

        let mut account = Self::new_helper(account, &pickle.user_id, &pickle.device_id);
        account.shared = pickle.shared;
        account.uploaded_signed_key_count = pickle.uploaded_signed_key_count;

        Ok(account)
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.identity_keys() == other.identity_keys() && self.shared() == other.shared()
    }
}
