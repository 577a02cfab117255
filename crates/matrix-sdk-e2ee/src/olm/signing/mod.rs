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

mod pk_signing;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

pub use pk_signing::{
    MasterSigning, PickledMasterSigning, PickledSelfSigning, PickledSigning, PickledUserSigning,
    SelfSigning, Signing, SigningError, UserSigning,
};
use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use vodozemac::Ed25519Signature;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::Account;
use crate::{
    error::{CrossSigningError, SignatureError},
    identities::{DeviceData, MasterPubkey, SelfSigningPubkey, UserIdentityData, UserSigningPubkey},
    store::PickleKey,
    types::{
        requests::{SignatureUploadRequest, UploadSigningKeysRequest},
        KeyUsage,
    },
};

/// The private seeds of a cross-signing identity, base64 encoded.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CrossSigningKeyExport {
    /// The seed of the master key.
    pub master_key: Option<String>,
    /// The seed of the self-signing key.
    pub self_signing_key: Option<String>,
    /// The seed of the user-signing key.
    pub user_signing_key: Option<String>,
}

impl fmt::Debug for CrossSigningKeyExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossSigningKeyExport")
            .field("master_key", &self.master_key.is_some())
            .field("self_signing_key", &self.self_signing_key.is_some())
            .field("user_signing_key", &self.user_signing_key.is_some())
            .finish_non_exhaustive()
    }
}

/// Private cross signing identity.
///
/// This object holds the private and public ed25519 key triplet that is used
/// for cross signing.
///
/// The object might be completely empty or have only some of the key pairs
/// available.
///
/// It can be used to sign devices or other identities.
#[derive(Clone)]
pub struct PrivateCrossSigningIdentity {
    user_id: OwnedUserId,
    shared: Arc<AtomicBool>,
    pub(crate) master_key: Arc<Mutex<Option<MasterSigning>>>,
    pub(crate) user_signing_key: Arc<Mutex<Option<UserSigning>>>,
    pub(crate) self_signing_key: Arc<Mutex<Option<SelfSigning>>>,
}

impl fmt::Debug for PrivateCrossSigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateCrossSigningIdentity")
            .field("user_id", &self.user_id)
            .field("shared", &self.shared())
            .finish_non_exhaustive()
    }
}

/// The pickled version of a [`PrivateCrossSigningIdentity`].
///
/// Can be used to store the identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PickledCrossSigningIdentity {
    /// The user id of the identity owner.
    pub user_id: OwnedUserId,
    /// Have the public keys of the identity been shared.
    pub shared: bool,
    /// The encrypted master key.
    pub master_key: Option<PickledMasterSigning>,
    /// The encrypted self-signing key.
    pub self_signing_key: Option<PickledSelfSigning>,
    /// The encrypted user-signing key.
    pub user_signing_key: Option<PickledUserSigning>,
}

impl PrivateCrossSigningIdentity {
    /// Get the user id that this identity belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Is the identity empty.
    ///
    /// An empty identity doesn't contain any private keys.
    pub async fn is_empty(&self) -> bool {
        let has_master = self.master_key.lock().await.is_some();
        let has_user = self.user_signing_key.lock().await.is_some();
        let has_self = self.self_signing_key.lock().await.is_some();

        !(has_master && has_user && has_self)
    }

    /// Can we sign our own devices, i.e. do we have a self signing key.
    pub async fn can_sign_devices(&self) -> bool {
        self.self_signing_key.lock().await.is_some()
    }

    /// Do we have the master key.
    pub async fn has_master_key(&self) -> bool {
        self.master_key.lock().await.is_some()
    }

    /// Get the public part of the master key, if we have one.
    pub async fn master_public_key(&self) -> Option<MasterPubkey> {
        self.master_key.lock().await.as_ref().map(|m| m.public_key.to_owned())
    }

    /// Get the public part of the self-signing key, if we have one.
    pub async fn self_signing_public_key(&self) -> Option<SelfSigningPubkey> {
        self.self_signing_key.lock().await.as_ref().map(|k| k.public_key.to_owned())
    }

    /// Get the public part of the user-signing key, if we have one.
    pub async fn user_signing_public_key(&self) -> Option<UserSigningPubkey> {
        self.user_signing_key.lock().await.as_ref().map(|k| k.public_key.to_owned())
    }

    /// Create a new empty identity.
    pub fn empty(user_id: &UserId) -> Self {
        Self {
            user_id: user_id.into(),
            shared: Arc::new(AtomicBool::new(false)),
            master_key: Arc::new(Mutex::new(None)),
            self_signing_key: Arc::new(Mutex::new(None)),
            user_signing_key: Arc::new(Mutex::new(None)),
        }
    }

    fn from_keys(
        user_id: OwnedUserId,
        master: Option<MasterSigning>,
        self_signing: Option<SelfSigning>,
        user_signing: Option<UserSigning>,
    ) -> Self {
        Self {
            user_id,
            shared: Arc::new(AtomicBool::new(false)),
            master_key: Arc::new(Mutex::new(master)),
            self_signing_key: Arc::new(Mutex::new(self_signing)),
            user_signing_key: Arc::new(Mutex::new(user_signing)),
        }
    }

    fn sign_subkeys(
        master: &MasterSigning,
        self_signing: Option<&mut SelfSigning>,
        user_signing: Option<&mut UserSigning>,
    ) -> Result<(), SignatureError> {
        if let Some(self_signing) = self_signing {
            let mut public_key = self_signing.public_key.as_ref().clone();
            master.sign_subkey(&mut public_key)?;
            self_signing.public_key = SelfSigningPubkey::from_trusted(public_key);
        }

        if let Some(user_signing) = user_signing {
            let mut public_key = user_signing.public_key.as_ref().clone();
            master.sign_subkey(&mut public_key)?;
            user_signing.public_key = UserSigningPubkey::from_trusted(public_key);
        }

        Ok(())
    }

    /// Create a new identity for the given user with a fresh set of keys.
    ///
    /// The self-signing and user-signing keys are signed by the new master
    /// key.
    pub fn new(user_id: OwnedUserId) -> Self {
        let master = MasterSigning::new(&user_id);
        let mut self_signing = SelfSigning::new(&user_id);
        let mut user_signing = UserSigning::new(&user_id);

        Self::sign_subkeys(&master, Some(&mut self_signing), Some(&mut user_signing))
            .expect("Can't sign our freshly created subkeys");

        Self::from_keys(user_id, Some(master), Some(self_signing), Some(user_signing))
    }

    /// Create a new cross signing identity and sign our own device with it.
    ///
    /// The master key additionally carries a signature of our device key.
    /// Returns the identity and the requests that upload the public keys and
    /// the new signature of our device.
    pub async fn with_account(
        account: &Account,
    ) -> Result<(Self, UploadSigningKeysRequest, SignatureUploadRequest), SignatureError> {
        let mut master = MasterSigning::new(account.user_id());
        let mut self_signing = SelfSigning::new(account.user_id());
        let mut user_signing = UserSigning::new(account.user_id());

        let mut public_master = master.public_key.as_ref().clone();
        account.sign_cross_signing_key(&mut public_master)?;
        master.public_key = MasterPubkey::from_trusted(public_master);

        Self::sign_subkeys(&master, Some(&mut self_signing), Some(&mut user_signing))?;

        let mut device_keys = account.device_keys();
        self_signing.sign_device(&mut device_keys)?;

        let mut signature_request = SignatureUploadRequest::default();
        signature_request.add(
            account.user_id(),
            account.device_id().to_string(),
            serde_json::to_value(&device_keys)?,
        );

        let identity = Self::from_keys(
            account.user_id().to_owned(),
            Some(master),
            Some(self_signing),
            Some(user_signing),
        );
        let upload_request = identity.as_upload_request().await;

        Ok((identity, upload_request, signature_request))
    }

    /// Mark the identity as shared.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst)
    }

    /// Has the identity been shared.
    ///
    /// A shared identity here means that the public keys of the identity have
    /// been uploaded to the server.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Move the keys of the given identity into this one.
    ///
    /// Every clone of this identity sees the new keys.
    pub(crate) async fn replace_with(&self, other: Self) {
        *self.master_key.lock().await = other.master_key.lock().await.take();
        *self.self_signing_key.lock().await = other.self_signing_key.lock().await.take();
        *self.user_signing_key.lock().await = other.user_signing_key.lock().await.take();
        self.shared.store(other.shared(), Ordering::SeqCst);
    }

    /// Get the public parts of the identity as an upload request.
    pub async fn as_upload_request(&self) -> UploadSigningKeysRequest {
        UploadSigningKeysRequest {
            master_key: self
                .master_key
                .lock()
                .await
                .as_ref()
                .map(|k| k.public_key.as_ref().clone()),
            self_signing_key: self
                .self_signing_key
                .lock()
                .await
                .as_ref()
                .map(|k| k.public_key.as_ref().clone()),
            user_signing_key: self
                .user_signing_key
                .lock()
                .await
                .as_ref()
                .map(|k| k.public_key.as_ref().clone()),
        }
    }

    /// Get the public identity that belongs to this private identity.
    ///
    /// Fails if one of the keys is missing or if the subkeys aren't signed by
    /// the master key.
    pub async fn to_public_identity(&self) -> Result<UserIdentityData, SignatureError> {
        let master = self.master_public_key().await.ok_or(SignatureError::MissingSigningKey)?;
        let self_signing =
            self.self_signing_public_key().await.ok_or(SignatureError::MissingSigningKey)?;
        let user_signing = self.user_signing_public_key().await;

        UserIdentityData::new(master, self_signing, user_signing)
    }

    /// Export the private seeds of the identity.
    pub async fn export_secrets(&self) -> CrossSigningKeyExport {
        CrossSigningKeyExport {
            master_key: self.master_key.lock().await.as_ref().map(|m| m.export_seed()),
            self_signing_key: self.self_signing_key.lock().await.as_ref().map(|m| m.export_seed()),
            user_signing_key: self.user_signing_key.lock().await.as_ref().map(|m| m.export_seed()),
        }
    }

    /// Restore an identity from previously exported seeds.
    ///
    /// If the master key is part of the export the subkeys get signed by it
    /// again, Ed25519 signatures are deterministic so the restored public keys
    /// are identical to the original ones.
    pub fn from_secrets(
        user_id: OwnedUserId,
        export: &CrossSigningKeyExport,
    ) -> Result<Self, CrossSigningError> {
        let master = export
            .master_key
            .as_deref()
            .map(|s| MasterSigning::from_base64(&user_id, s))
            .transpose()?;
        let mut self_signing = export
            .self_signing_key
            .as_deref()
            .map(|s| SelfSigning::from_base64(&user_id, s))
            .transpose()?;
        let mut user_signing = export
            .user_signing_key
            .as_deref()
            .map(|s| UserSigning::from_base64(&user_id, s))
            .transpose()?;

        if let Some(master) = &master {
            Self::sign_subkeys(master, self_signing.as_mut(), user_signing.as_mut())?;
        }

        Ok(Self::from_keys(user_id, master, self_signing, user_signing))
    }

    /// Sign the given device with our self-signing key.
    ///
    /// The self-signature of the device is checked before we add ours.
    /// Returns a request that uploads the new signature.
    pub async fn sign_device(
        &self,
        device: &DeviceData,
    ) -> Result<SignatureUploadRequest, CrossSigningError> {
        if device.user_id() != self.user_id() {
            return Err(CrossSigningError::UserIdMismatch(device.user_id().to_owned()));
        }

        device.verify_device_keys(device.as_device_keys())?;

        let mut device_keys = device.as_device_keys().clone();

        self.self_signing_key
            .lock()
            .await
            .as_ref()
            .ok_or(CrossSigningError::MissingSigningKey(KeyUsage::SelfSigning))?
            .sign_device(&mut device_keys)?;

        debug!(
            user_id = ?device.user_id(),
            device_id = ?device.device_id(),
            "Signed a device with our self-signing key"
        );

        let mut request = SignatureUploadRequest::default();
        request.add(
            device.user_id(),
            device.device_id().to_string(),
            serde_json::to_value(&device_keys).map_err(SignatureError::from)?,
        );

        Ok(request)
    }

    /// Sign the master key of another user with our user-signing key.
    ///
    /// Returns a request that uploads the new signature.
    pub async fn sign_user(
        &self,
        identity: &UserIdentityData,
    ) -> Result<SignatureUploadRequest, CrossSigningError> {
        let master_key = identity.master_key();
        master_key.verify_self_signature()?;

        let signed_key = self
            .user_signing_key
            .lock()
            .await
            .as_ref()
            .ok_or(CrossSigningError::MissingSigningKey(KeyUsage::UserSigning))?
            .sign_user(master_key)?;

        let key_id = master_key.get_first_key().ok_or(SignatureError::MissingSigningKey)?;

        debug!(user_id = ?identity.user_id(), "Signed the master key of a user");

        let mut request = SignatureUploadRequest::default();
        request.add(
            identity.user_id(),
            key_id.to_base64(),
            serde_json::to_value(&signed_key).map_err(SignatureError::from)?,
        );

        Ok(request)
    }

    /// Sign a JSON object with our master key, returns the key id and the
    /// signature, or `None` if we don't have the master key.
    pub(crate) async fn sign_json_with_master(
        &self,
        json: Value,
    ) -> Result<Option<(String, Ed25519Signature)>, SignatureError> {
        match self.master_key.lock().await.as_ref() {
            Some(master) => Ok(Some((master.inner.key_id(), master.sign_json(json)?))),
            None => Ok(None),
        }
    }

    /// Store the cross signing identity as a pickle.
    pub async fn pickle(&self, pickle_key: &PickleKey) -> PickledCrossSigningIdentity {
        PickledCrossSigningIdentity {
            user_id: self.user_id.clone(),
            shared: self.shared(),
            master_key: self.master_key.lock().await.as_ref().map(|m| m.pickle(pickle_key)),
            self_signing_key: self
                .self_signing_key
                .lock()
                .await
                .as_ref()
                .map(|m| m.pickle(pickle_key)),
            user_signing_key: self
                .user_signing_key
                .lock()
                .await
                .as_ref()
                .map(|m| m.pickle(pickle_key)),
        }
    }

    /// Restore the private cross signing identity from a pickle.
    pub fn from_pickle(
        pickle: &PickledCrossSigningIdentity,
        pickle_key: &PickleKey,
    ) -> Result<Self, SigningError> {
        let master = pickle
            .master_key
            .as_ref()
            .map(|m| MasterSigning::from_pickle(m, pickle_key))
            .transpose()?;
        let self_signing = pickle
            .self_signing_key
            .as_ref()
            .map(|m| SelfSigning::from_pickle(m, pickle_key))
            .transpose()?;
        let user_signing = pickle
            .user_signing_key
            .as_ref()
            .map(|m| UserSigning::from_pickle(m, pickle_key))
            .transpose()?;

        let identity = Self::from_keys(pickle.user_id.clone(), master, self_signing, user_signing);
        identity.shared.store(pickle.shared, Ordering::SeqCst);

        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id};

    use super::*;
    use crate::identities::DeviceData;

    fn account() -> Account {
        Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"))
    }

    #[tokio::test]
    async fn bootstrapping_signs_our_device() {
        let account = account();
        let (identity, upload, signatures) =
            PrivateCrossSigningIdentity::with_account(&account).await.unwrap();

        assert!(!identity.is_empty().await);
        assert!(upload.master_key.is_some());
        assert!(upload.self_signing_key.is_some());
        assert!(upload.user_signing_key.is_some());

        let public = identity.to_public_identity().await.unwrap();
        let own_device = DeviceData::from_account(&account);
        public.master_key().is_signed_by_device(&own_device).unwrap();

        let device_keys = &signatures.signed_keys[account.user_id()]["ALICEDEVICE"];
        let device_keys = serde_json::from_value(device_keys.clone()).unwrap();
        public.self_signing_key().verify_device_keys(&device_keys).unwrap();
    }

    #[tokio::test]
    async fn exported_secrets_restore_the_identity() {
        let identity = PrivateCrossSigningIdentity::new(user_id!("@alice:localhost").to_owned());
        let export = identity.export_secrets().await;

        let restored =
            PrivateCrossSigningIdentity::from_secrets(identity.user_id().to_owned(), &export)
                .unwrap();

        assert_eq!(
            identity.to_public_identity().await.unwrap(),
            restored.to_public_identity().await.unwrap()
        );
    }

    #[tokio::test]
    async fn pickling() {
        let pickle_key = PickleKey::new();
        let identity = PrivateCrossSigningIdentity::new(user_id!("@alice:localhost").to_owned());
        identity.mark_as_shared();

        let pickle = identity.pickle(&pickle_key).await;
        let unpickled = PrivateCrossSigningIdentity::from_pickle(&pickle, &pickle_key).unwrap();

        assert!(unpickled.shared());
        assert_eq!(identity.master_public_key().await, unpickled.master_public_key().await);
    }

    #[tokio::test]
    async fn devices_of_other_users_cant_be_signed() {
        let identity = PrivateCrossSigningIdentity::new(user_id!("@alice:localhost").to_owned());
        let bob = Account::new(user_id!("@bob:localhost"));

        assert_matches!(
            identity.sign_device(&DeviceData::from_account(&bob)).await,
            Err(CrossSigningError::UserIdMismatch(_))
        );

        let empty = PrivateCrossSigningIdentity::empty(user_id!("@alice:localhost"));
        assert_matches!(
            empty.sign_device(&DeviceData::from_account(&account())).await,
            Err(CrossSigningError::MissingSigningKey(KeyUsage::SelfSigning))
        );
    }

    #[tokio::test]
    async fn other_users_can_be_signed() {
        let alice = PrivateCrossSigningIdentity::new(user_id!("@alice:localhost").to_owned());
        let bob = PrivateCrossSigningIdentity::new(user_id!("@bob:localhost").to_owned());
        let bob_public = bob.to_public_identity().await.unwrap();

        let request = alice.sign_user(&bob_public).await.unwrap();
        let key_id = bob_public.master_key().get_first_key().unwrap().to_base64();
        let signed: crate::types::CrossSigningKey =
            serde_json::from_value(request.signed_keys[bob.user_id()][&key_id].clone()).unwrap();

        let alice_public = alice.to_public_identity().await.unwrap();
        let signed = MasterPubkey::try_from(signed).unwrap();
        alice_public.user_signing_key().unwrap().verify_master_key(&signed).unwrap();
    }
}
