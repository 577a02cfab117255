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
use vodozemac::Ed25519PublicKey;

use crate::{
    error::SignatureError,
    olm::utility::VerifyJson,
    types::{CrossSigningKey, DeviceKeys, KeyUsage, SignedJsonObject, Signatures},
};

macro_rules! cross_signing_pubkey {
    ($(#[$meta:meta])* $name:ident, $usage:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(try_from = "CrossSigningKey", into = "CrossSigningKey")]
        pub struct $name(Arc<CrossSigningKey>);

        impl $name {
            /// Wrap a key that we created ourselves or that was already
            /// checked.
            pub(crate) fn from_trusted(key: CrossSigningKey) -> Self {
                Self(Arc::new(key))
            }

            /// Get the user id of the key's owner.
            pub fn user_id(&self) -> &UserId {
                &self.0.user_id
            }

            /// Get the Ed25519 key and its key id.
            pub fn get_first_key_and_id(&self) -> Option<(&str, Ed25519PublicKey)> {
                self.0.get_first_key_and_id()
            }

            /// Get the Ed25519 key.
            pub fn get_first_key(&self) -> Option<Ed25519PublicKey> {
                self.0.get_first_key()
            }

            /// Get the signatures of the key.
            pub fn signatures(&self) -> &Signatures {
                &self.0.signatures
            }

            /// Check that the given object was signed by this key.
            pub(crate) fn has_signed(
                &self,
                signed_object: &impl SignedJsonObject,
            ) -> Result<(), SignatureError> {
                let (key_id, key) =
                    self.get_first_key_and_id().ok_or(SignatureError::MissingSigningKey)?;

                key.verify_json(self.user_id(), key_id, signed_object)
            }
        }

        impl AsRef<CrossSigningKey> for $name {
            fn as_ref(&self) -> &CrossSigningKey {
                &self.0
            }
        }

        impl TryFrom<CrossSigningKey> for $name {
            type Error = SignatureError;

            fn try_from(key: CrossSigningKey) -> Result<Self, Self::Error> {
                if key.keys.len() != 1 {
                    Err(SignatureError::MissingSigningKey)
                } else if !key.has_usage($usage) {
                    Err(SignatureError::InvalidKeyUsage)
                } else if key.get_first_key().is_none() {
                    Err(SignatureError::InvalidKeyId)
                } else {
                    Ok(Self(Arc::new(key)))
                }
            }
        }

        impl From<$name> for CrossSigningKey {
            fn from(key: $name) -> Self {
                Arc::unwrap_or_clone(key.0)
            }
        }
    };
}

cross_signing_pubkey!(
    /// Wrapper for a cross signing key marking it as the master key.
    ///
    /// Master keys are used to sign other cross signing keys, the self signing
    /// and user signing keys of an user will be signed by their master key.
    MasterPubkey,
    KeyUsage::Master
);

cross_signing_pubkey!(
    /// Wrapper for a cross signing key marking it as a self signing key.
    ///
    /// Self signing keys are used to sign the user's own devices.
    SelfSigningPubkey,
    KeyUsage::SelfSigning
);

cross_signing_pubkey!(
    /// Wrapper for a cross signing key marking it as a user signing key.
    ///
    /// User signing keys are used to sign the master keys of other users.
    UserSigningPubkey,
    KeyUsage::UserSigning
);

impl MasterPubkey {
    /// A stable fingerprint of the key, the unpadded base64 public key.
    pub fn fingerprint(&self) -> Option<String> {
        self.get_first_key().map(|k| k.to_base64())
    }

    /// Check that the given subkey belongs to the same user and was signed by
    /// this master key.
    pub fn verify_subkey(&self, subkey: &CrossSigningKey) -> Result<(), SignatureError> {
        if subkey.user_id != *self.user_id() {
            return Err(SignatureError::UserIdMismatch);
        }

        self.has_signed(subkey)
    }

    /// Check the signature the master key made over itself.
    ///
    /// A master key doesn't need to carry such a signature, if it does the
    /// signature must be valid.
    pub fn verify_self_signature(&self) -> Result<(), SignatureError> {
        let Some((key_id, _)) = self.get_first_key_and_id() else {
            return Err(SignatureError::MissingSigningKey);
        };

        if self.signatures().get_signature(self.user_id(), key_id).is_some() {
            self.has_signed(self.as_ref())
        } else {
            Ok(())
        }
    }

    /// Was this master key signed by the given device of the same user.
    pub(crate) fn is_signed_by_device(
        &self,
        device: &super::DeviceData,
    ) -> Result<(), SignatureError> {
        if device.user_id() != self.user_id() {
            return Err(SignatureError::UserIdMismatch);
        }

        device.has_signed(self.as_ref())
    }
}

impl SelfSigningPubkey {
    /// Check that the given device keys were signed by this self-signing key.
    pub fn verify_device_keys(&self, device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        if device_keys.user_id != *self.user_id() {
            return Err(SignatureError::UserIdMismatch);
        }

        self.has_signed(device_keys)
    }
}

impl UserSigningPubkey {
    /// Check that the master key of another user was signed by this
    /// user-signing key.
    pub fn verify_master_key(&self, master_key: &MasterPubkey) -> Result<(), SignatureError> {
        self.has_signed(master_key.as_ref())
    }
}

/// The public cross-signing identity of a user.
///
/// Only our own identity carries a user-signing key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentityData {
    master_key: MasterPubkey,
    self_signing_key: SelfSigningPubkey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_signing_key: Option<UserSigningPubkey>,
}

impl UserIdentityData {
    /// Create a new identity from its public cross-signing keys.
    ///
    /// All keys must belong to the same user and the subkeys must be signed
    /// by the master key.
    pub fn new(
        master_key: MasterPubkey,
        self_signing_key: SelfSigningPubkey,
        user_signing_key: Option<UserSigningPubkey>,
    ) -> Result<Self, SignatureError> {
        master_key.verify_subkey(self_signing_key.as_ref())?;

        if let Some(user_signing_key) = &user_signing_key {
            master_key.verify_subkey(user_signing_key.as_ref())?;
        }

        Ok(Self { master_key, self_signing_key, user_signing_key })
    }

    /// Get the user id of this identity.
    pub fn user_id(&self) -> &UserId {
        self.master_key.user_id()
    }

    /// Get the public master key of the identity.
    pub fn master_key(&self) -> &MasterPubkey {
        &self.master_key
    }

    /// Get the public self-signing key of the identity.
    pub fn self_signing_key(&self) -> &SelfSigningPubkey {
        &self.self_signing_key
    }

    /// Get the public user-signing key of the identity, only known for our
    /// own identity.
    pub fn user_signing_key(&self) -> Option<&UserSigningPubkey> {
        self.user_signing_key.as_ref()
    }

    /// Was the given device signed by the self-signing key of this identity.
    pub fn is_device_signed(&self, device: &super::DeviceData) -> bool {
        self.self_signing_key.verify_device_keys(device.as_device_keys()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::user_id;

    use super::*;
    use crate::olm::PrivateCrossSigningIdentity;

    #[tokio::test]
    async fn identity_checks_subkey_signatures() {
        let identity = PrivateCrossSigningIdentity::new(user_id!("@alice:localhost").to_owned());
        let public = identity.to_public_identity().await.unwrap();

        assert_eq!(public.user_id(), "@alice:localhost");
        assert!(public.user_signing_key().is_some());
        public.master_key().verify_self_signature().unwrap();

        let other = PrivateCrossSigningIdentity::new(user_id!("@alice:localhost").to_owned());
        let other = other.to_public_identity().await.unwrap();

        assert_matches!(
            UserIdentityData::new(
                public.master_key().clone(),
                other.self_signing_key().clone(),
                None
            ),
            Err(SignatureError::VerificationError(_))
        );
    }

    #[test]
    fn key_usage_is_checked() {
        let key = CrossSigningKey::new(
            user_id!("@alice:localhost").to_owned(),
            KeyUsage::SelfSigning,
            vodozemac::Ed25519SecretKey::new().public_key(),
        );

        assert_matches!(MasterPubkey::try_from(key.clone()), Err(SignatureError::InvalidKeyUsage));
        assert!(SelfSigningPubkey::try_from(key).is_ok());
    }
}
