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

use ruma::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use vodozemac::{Ed25519PublicKey, Ed25519SecretKey, Ed25519Signature, KeyError};
use zeroize::Zeroize;

use crate::{
    error::SignatureError,
    identities::{MasterPubkey, SelfSigningPubkey, UserSigningPubkey},
    olm::utility::to_signable_json,
    store::{EncryptedValue, PickleKey, PickleKeyError},
    types::{key_id, CrossSigningKey, DeviceKeys, KeyUsage, ED25519},
};

/// Error type reporting failures in the signing operations.
#[derive(Debug, Error)]
pub enum SigningError {
    /// The pickled seed couldn't be decrypted.
    #[error(transparent)]
    Decryption(#[from] PickleKeyError),

    /// The decrypted seed isn't a valid Ed25519 key.
    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    /// The seed has the wrong length.
    #[error("the seed of the signing key has an invalid length")]
    InvalidSeedLength,
}

/// A private Ed25519 key used for cross-signing.
#[derive(Clone)]
pub struct Signing {
    inner: Arc<Ed25519SecretKey>,
    public_key: Ed25519PublicKey,
}

impl std::fmt::Debug for Signing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signing").field("public_key", &self.public_key.to_base64()).finish()
    }
}

impl PartialEq for Signing {
    fn eq(&self, other: &Signing) -> bool {
        self.public_key == other.public_key
    }
}

/// The pickled, encrypted, seed of a [`Signing`] key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PickledSigning(EncryptedValue);

impl Signing {
    pub fn new() -> Self {
        Self::from_secret_key(Ed25519SecretKey::new())
    }

    fn from_secret_key(secret_key: Ed25519SecretKey) -> Self {
        let public_key = secret_key.public_key();

        Self { inner: Arc::new(secret_key), public_key }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_secret_key(Ed25519SecretKey::from_slice(seed))
    }

    pub fn from_base64(seed: &str) -> Result<Self, KeyError> {
        Ok(Self::from_secret_key(Ed25519SecretKey::from_base64(seed)?))
    }

    /// Export the seed of the key as unpadded base64.
    pub fn to_base64(&self) -> String {
        self.inner.to_base64()
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        self.public_key
    }

    /// The key id of the key, `ed25519:<public key>`.
    pub fn key_id(&self) -> String {
        key_id(ED25519, &self.public_key.to_base64())
    }

    pub fn cross_signing_key(&self, user_id: &UserId, usage: KeyUsage) -> CrossSigningKey {
        CrossSigningKey::new(user_id.to_owned(), usage, self.public_key)
    }

    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.inner.sign(message.as_bytes())
    }

    pub fn sign_json(&self, json: Value) -> Result<Ed25519Signature, SignatureError> {
        Ok(self.sign(&to_signable_json(json)?))
    }

    pub fn pickle(&self, pickle_key: &PickleKey) -> PickledSigning {
        let mut seed = self.inner.to_bytes();
        let pickle = PickledSigning(pickle_key.encrypt_bytes(seed.as_slice()));

        seed.zeroize();

        pickle
    }

    pub fn from_pickle(
        pickle: &PickledSigning,
        pickle_key: &PickleKey,
    ) -> Result<Self, SigningError> {
        let mut decrypted = pickle_key.decrypt_bytes(&pickle.0)?;

        let seed = <[u8; 32]>::try_from(decrypted.as_slice());
        decrypted.zeroize();

        let mut seed = seed.map_err(|_| SigningError::InvalidSeedLength)?;
        let signing = Self::from_seed(&seed);
        seed.zeroize();

        Ok(signing)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct MasterSigning {
    pub inner: Signing,
    pub public_key: MasterPubkey,
}

#[derive(Clone, PartialEq, Debug)]
pub struct SelfSigning {
    pub inner: Signing,
    pub public_key: SelfSigningPubkey,
}

#[derive(Clone, PartialEq, Debug)]
pub struct UserSigning {
    pub inner: Signing,
    pub public_key: UserSigningPubkey,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PickledMasterSigning {
    pickle: PickledSigning,
    public_key: CrossSigningKey,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PickledSelfSigning {
    pickle: PickledSigning,
    public_key: CrossSigningKey,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PickledUserSigning {
    pickle: PickledSigning,
    public_key: CrossSigningKey,
}

impl MasterSigning {
    pub fn new(user_id: &UserId) -> Self {
        Self::from_signing(user_id, Signing::new())
    }

    fn from_signing(user_id: &UserId, inner: Signing) -> Self {
        let public_key =
            MasterPubkey::from_trusted(inner.cross_signing_key(user_id, KeyUsage::Master));

        Self { inner, public_key }
    }

    pub fn from_base64(user_id: &UserId, seed: &str) -> Result<Self, KeyError> {
        Ok(Self::from_signing(user_id, Signing::from_base64(seed)?))
    }

    pub fn export_seed(&self) -> String {
        self.inner.to_base64()
    }

    pub fn pickle(&self, pickle_key: &PickleKey) -> PickledMasterSigning {
        PickledMasterSigning {
            pickle: self.inner.pickle(pickle_key),
            public_key: self.public_key.as_ref().clone(),
        }
    }

    pub fn from_pickle(
        pickle: &PickledMasterSigning,
        pickle_key: &PickleKey,
    ) -> Result<Self, SigningError> {
        let inner = Signing::from_pickle(&pickle.pickle, pickle_key)?;

        Ok(Self { inner, public_key: MasterPubkey::from_trusted(pickle.public_key.clone()) })
    }

    /// Sign a self-signing or user-signing key with the master key.
    pub fn sign_subkey(&self, subkey: &mut CrossSigningKey) -> Result<(), SignatureError> {
        let signature = self.inner.sign_json(serde_json::to_value(&*subkey)?)?;

        subkey.signatures.add_signature(
            self.public_key.user_id().to_owned(),
            self.inner.key_id(),
            signature,
        );

        Ok(())
    }

    /// Sign an arbitrary signed JSON object, for example backup auth data.
    pub fn sign_json(&self, json: Value) -> Result<Ed25519Signature, SignatureError> {
        self.inner.sign_json(json)
    }
}

impl SelfSigning {
    pub fn new(user_id: &UserId) -> Self {
        Self::from_signing(user_id, Signing::new())
    }

    fn from_signing(user_id: &UserId, inner: Signing) -> Self {
        let key = inner.cross_signing_key(user_id, KeyUsage::SelfSigning);
        let public_key = SelfSigningPubkey::from_trusted(key);

        Self { inner, public_key }
    }

    pub fn from_base64(user_id: &UserId, seed: &str) -> Result<Self, KeyError> {
        Ok(Self::from_signing(user_id, Signing::from_base64(seed)?))
    }

    pub fn export_seed(&self) -> String {
        self.inner.to_base64()
    }

    pub fn pickle(&self, pickle_key: &PickleKey) -> PickledSelfSigning {
        PickledSelfSigning {
            pickle: self.inner.pickle(pickle_key),
            public_key: self.public_key.as_ref().clone(),
        }
    }

    pub fn from_pickle(
        pickle: &PickledSelfSigning,
        pickle_key: &PickleKey,
    ) -> Result<Self, SigningError> {
        let inner = Signing::from_pickle(&pickle.pickle, pickle_key)?;

        Ok(Self { inner, public_key: SelfSigningPubkey::from_trusted(pickle.public_key.clone()) })
    }

    /// Add a self-signing signature to the given device keys.
    pub fn sign_device(&self, device_keys: &mut DeviceKeys) -> Result<(), SignatureError> {
        let signature = self.inner.sign_json(serde_json::to_value(&*device_keys)?)?;

        device_keys.signatures.add_signature(
            self.public_key.user_id().to_owned(),
            self.inner.key_id(),
            signature,
        );

        Ok(())
    }
}

impl UserSigning {
    pub fn new(user_id: &UserId) -> Self {
        Self::from_signing(user_id, Signing::new())
    }

    fn from_signing(user_id: &UserId, inner: Signing) -> Self {
        let key = inner.cross_signing_key(user_id, KeyUsage::UserSigning);
        let public_key = UserSigningPubkey::from_trusted(key);

        Self { inner, public_key }
    }

    pub fn from_base64(user_id: &UserId, seed: &str) -> Result<Self, KeyError> {
        Ok(Self::from_signing(user_id, Signing::from_base64(seed)?))
    }

    pub fn export_seed(&self) -> String {
        self.inner.to_base64()
    }

    pub fn pickle(&self, pickle_key: &PickleKey) -> PickledUserSigning {
        PickledUserSigning {
            pickle: self.inner.pickle(pickle_key),
            public_key: self.public_key.as_ref().clone(),
        }
    }

    pub fn from_pickle(
        pickle: &PickledUserSigning,
        pickle_key: &PickleKey,
    ) -> Result<Self, SigningError> {
        let inner = Signing::from_pickle(&pickle.pickle, pickle_key)?;

        Ok(Self { inner, public_key: UserSigningPubkey::from_trusted(pickle.public_key.clone()) })
    }

    /// Sign the master key of another user, returns a copy of the master key
    /// carrying only our new signature.
    pub fn sign_user(&self, master_key: &MasterPubkey) -> Result<CrossSigningKey, SignatureError> {
        let mut master_key = master_key.as_ref().clone();
        let signature = self.inner.sign_json(serde_json::to_value(&master_key)?)?;

        master_key.signatures = Default::default();
        master_key.signatures.add_signature(
            self.public_key.user_id().to_owned(),
            self.inner.key_id(),
            signature,
        );

        Ok(master_key)
    }
}

#[cfg(test)]
mod tests {
    use ruma::user_id;

    use super::*;
    use crate::olm::utility::VerifyJson;

    #[test]
    fn signing_pickle_roundtrip() {
        let pickle_key = PickleKey::new();
        let signing = Signing::new();

        let pickle = signing.pickle(&pickle_key);
        let unpickled = Signing::from_pickle(&pickle, &pickle_key).unwrap();

        assert_eq!(signing, unpickled);
        assert_eq!(signing.to_base64(), unpickled.to_base64());
        assert!(Signing::from_pickle(&pickle, &PickleKey::new()).is_err());
    }

    #[test]
    fn master_key_signs_subkeys() {
        let user_id = user_id!("@alice:localhost");
        let master = MasterSigning::new(user_id);
        let self_signing = SelfSigning::new(user_id);

        let mut subkey = self_signing.public_key.as_ref().clone();
        master.sign_subkey(&mut subkey).unwrap();

        master
            .inner
            .public_key()
            .verify_json(user_id, &master.inner.key_id(), &subkey)
            .unwrap();
    }

    #[test]
    fn seeds_restore_the_same_key() {
        let user_id = user_id!("@alice:localhost");
        let master = MasterSigning::new(user_id);

        let restored = MasterSigning::from_base64(user_id, &master.export_seed()).unwrap();

        assert_eq!(master.public_key, restored.public_key);
    }
}
