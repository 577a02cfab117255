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

use std::{fmt, ops::Deref};

use ruma::{DeviceId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use super::TrustLevel;
use crate::{
    error::SignatureError,
    olm::{utility::VerifyJson, Account},
    types::{DeviceKeys, EventEncryptionAlgorithm, SignedJsonObject, SignedKey, Signatures},
};

/// The local trust state of a device.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified,
    /// The device been blacklisted from communicating.
    BlackListed,
    /// The trust state of the device is being ignored.
    Ignored,
    /// The trust state is unset.
    #[default]
    Unset,
}

/// A read-only version of a device we learned about through a key query.
///
/// The identity keys of a device never change, a key query that returns
/// different keys for a known device is rejected.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceData {
    device_keys: DeviceKeys,
    #[serde(default)]
    local_trust: LocalTrust,
    #[serde(default)]
    deleted: bool,
}

impl fmt::Debug for DeviceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceData")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .field("keys", &self.device_keys.keys)
            .field("local_trust", &self.local_trust)
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl TryFrom<&DeviceKeys> for DeviceData {
    type Error = SignatureError;

    /// Create a device from freshly received device keys, the self-signature
    /// of the keys is verified.
    fn try_from(device_keys: &DeviceKeys) -> Result<Self, Self::Error> {
        let device = Self::new(device_keys.clone(), LocalTrust::Unset);
        device.verify_device_keys(device_keys)?;

        Ok(device)
    }
}

impl DeviceData {
    /// Create a new Device, this constructor skips signature verification of
    /// the keys, `TryFrom` should be used for completely new devices we
    /// receive.
    pub fn new(device_keys: DeviceKeys, local_trust: LocalTrust) -> Self {
        Self { device_keys, local_trust, deleted: false }
    }

    /// Create the device data of our own device, our own device is always
    /// trusted.
    pub fn from_account(account: &Account) -> Self {
        Self::new(account.device_keys(), LocalTrust::Verified)
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.device_keys.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_keys.device_id
    }

    /// Get the Curve25519 key of the given device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.device_keys.curve25519_key()
    }

    /// Get the Ed25519 key of the given device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.device_keys.ed25519_key()
    }

    /// Get the list of algorithms this device supports.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.device_keys.algorithms
    }

    /// Get a map containing all the device signatures.
    pub fn signatures(&self) -> &Signatures {
        &self.device_keys.signatures
    }

    /// Get the device keys this device was created from.
    pub fn as_device_keys(&self) -> &DeviceKeys {
        &self.device_keys
    }

    /// Get the trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        self.local_trust
    }

    /// Is the device locally marked as trusted.
    pub fn is_locally_trusted(&self) -> bool {
        self.local_trust == LocalTrust::Verified
    }

    /// Is the device locally marked as blacklisted.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust == LocalTrust::BlackListed
    }

    /// Set the trust state of the device to the given state.
    pub(crate) fn set_trust_state(&mut self, state: LocalTrust) {
        self.local_trust = state;
    }

    /// Is the device deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Mark the device as deleted.
    pub(crate) fn mark_as_deleted(&mut self) {
        self.deleted = true;
    }

    /// Does the given device keys object carry the same identity keys as we
    /// do.
    pub(crate) fn has_same_identity_keys(&self, device_keys: &DeviceKeys) -> bool {
        self.curve25519_key() == device_keys.curve25519_key()
            && self.ed25519_key() == device_keys.ed25519_key()
    }

    /// Replace the device keys, used when the keys are unchanged but the
    /// signatures of the object got updated, for example when our device got
    /// cross-signed.
    pub(crate) fn update_device_keys(&mut self, device_keys: DeviceKeys) {
        self.device_keys = device_keys;
        self.deleted = false;
    }

    /// Check that the given signed object was signed by this device.
    pub(crate) fn has_signed(
        &self,
        signed_object: &impl SignedJsonObject,
    ) -> Result<(), SignatureError> {
        let key = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        key.verify_json(
            self.user_id(),
            &DeviceKeys::ed25519_key_id(self.device_id()),
            signed_object,
        )
    }

    /// Verify the self-signature of the given device keys.
    pub(crate) fn verify_device_keys(
        &self,
        device_keys: &DeviceKeys,
    ) -> Result<(), SignatureError> {
        self.has_signed(device_keys)
    }

    /// Verify that a claimed one-time key was signed by this device.
    pub(crate) fn verify_one_time_key(
        &self,
        one_time_key: &SignedKey,
    ) -> Result<(), SignatureError> {
        self.has_signed(one_time_key)
    }
}

/// A device together with the trust the engine computed for it.
#[derive(Clone, Debug)]
pub struct Device {
    pub(crate) inner: DeviceData,
    pub(crate) trust_level: TrustLevel,
}

impl Deref for Device {
    type Target = DeviceData;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Device {
    /// The computed trust level of the device.
    pub fn trust_level(&self) -> TrustLevel {
        self.trust_level
    }

    /// Is the device verified, either locally or through cross-signing.
    pub fn is_verified(&self) -> bool {
        self.trust_level == TrustLevel::Verified
    }

    /// Get the underlying device data.
    pub fn data(&self) -> &DeviceData {
        &self.inner
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use ruma::{OwnedDeviceId, UserId};
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519SecretKey};

    use crate::{olm::utility::to_signable_json, types::DeviceKeys};

    /// Create device keys signed by a freshly generated key, returns the keys
    /// and the signing key.
    pub(crate) fn signed_device_keys(user: &str, device: &str) -> (DeviceKeys, Ed25519SecretKey) {
        let user_id = UserId::parse(user).unwrap();
        let device_id: OwnedDeviceId = device.into();
        let signing_key = Ed25519SecretKey::new();

        let mut keys = DeviceKeys::new(
            user_id.clone(),
            device_id.clone(),
            Curve25519PublicKey::from(&Curve25519SecretKey::new()),
            signing_key.public_key(),
        );

        let canonical = to_signable_json(serde_json::to_value(&keys).unwrap()).unwrap();
        keys.signatures.add_signature(
            user_id,
            DeviceKeys::ed25519_key_id(&device_id),
            signing_key.sign(canonical.as_bytes()),
        );

        (keys, signing_key)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};

    use super::{testing::signed_device_keys, *};

    #[test]
    fn self_signed_devices_are_accepted() {
        let (keys, _) = signed_device_keys("@alice:localhost", "ALICEDEVICE");

        let device = DeviceData::try_from(&keys).unwrap();

        assert_eq!(device.user_id(), "@alice:localhost");
        assert_eq!(device.device_id(), "ALICEDEVICE");
        assert_eq!(device.local_trust_state(), LocalTrust::Unset);
        assert!(!device.is_deleted());
    }

    #[test]
    fn tampered_devices_are_rejected() {
        let (mut keys, _) = signed_device_keys("@alice:localhost", "ALICEDEVICE");
        keys.keys.insert(
            "curve25519:ALICEDEVICE".to_owned(),
            Curve25519PublicKey::from(&Curve25519SecretKey::new()).to_base64(),
        );

        assert_matches!(DeviceData::try_from(&keys), Err(SignatureError::VerificationError(_)));

        let (mut keys, _) = signed_device_keys("@alice:localhost", "ALICEDEVICE");
        keys.signatures = Signatures::new();
        assert_matches!(DeviceData::try_from(&keys), Err(SignatureError::NoSignatureFound));
    }

    #[test]
    fn identity_key_changes_are_detected() {
        let (keys, _) = signed_device_keys("@alice:localhost", "ALICEDEVICE");
        let (other_keys, _) = signed_device_keys("@alice:localhost", "ALICEDEVICE");

        let device = DeviceData::try_from(&keys).unwrap();

        assert!(device.has_same_identity_keys(&keys));
        assert!(!device.has_same_identity_keys(&other_keys));
    }
}
