// Copyright 2022 The Matrix.org Foundation C.I.C.
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

//! Module containing the key and event types the engine speaks.
//!
//! The types deserialize directly into vodozemac keys where the protocol
//! carries a key, and they support lossless serialization cycles in a
//! canonical JSON supported way, meaning the white-space and field order
//! won't be preserved but the data will.

pub mod backup;
pub mod events;
pub mod requests;

use std::{collections::BTreeMap, fmt};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize, Serializer};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

/// The prefix of Ed25519 key ids, `ed25519:<key name>`.
pub const ED25519: &str = "ed25519";
/// The prefix of Curve25519 key ids, `curve25519:<key name>`.
pub const CURVE25519: &str = "curve25519";
/// The prefix of signed one-time key ids, `signed_curve25519:<key name>`.
pub const SIGNED_CURVE25519: &str = "signed_curve25519";

/// Build a key id of the form `<algorithm>:<key name>`.
pub fn key_id(algorithm: &str, key_name: &str) -> String {
    format!("{algorithm}:{key_name}")
}

/// An encryption algorithm to be used to encrypt messages sent to a room or
/// to a device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum EventEncryptionAlgorithm {
    /// Olm version 1 using Curve25519, AES-256, and SHA-256.
    OlmV1Curve25519AesSha2,
    /// Megolm version 1 using AES-256 and SHA-256.
    MegolmV1AesSha2,
    /// An algorithm we don't know about.
    Unknown(String),
}

impl EventEncryptionAlgorithm {
    /// The wire name of the algorithm.
    pub fn as_str(&self) -> &str {
        match self {
            Self::OlmV1Curve25519AesSha2 => "m.olm.v1.curve25519-aes-sha2",
            Self::MegolmV1AesSha2 => "m.megolm.v1.aes-sha2",
            Self::Unknown(a) => a,
        }
    }
}

impl From<String> for EventEncryptionAlgorithm {
    fn from(value: String) -> Self {
        match value.as_str() {
            "m.olm.v1.curve25519-aes-sha2" => Self::OlmV1Curve25519AesSha2,
            "m.megolm.v1.aes-sha2" => Self::MegolmV1AesSha2,
            _ => Self::Unknown(value),
        }
    }
}

impl From<EventEncryptionAlgorithm> for String {
    fn from(value: EventEncryptionAlgorithm) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for EventEncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signatures for a signed object.
///
/// A map from the signing user to a map of key ids to base64 encoded
/// signatures.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signatures(BTreeMap<OwnedUserId, BTreeMap<String, String>>);

impl Signatures {
    /// Create a new, empty, signatures collection.
    pub fn new() -> Self {
        Signatures(Default::default())
    }

    /// Add the given signature from the given signer and the given key_id to
    /// the collection.
    pub fn add_signature(
        &mut self,
        signer: OwnedUserId,
        key_id: String,
        signature: Ed25519Signature,
    ) -> Option<String> {
        self.0.entry(signer).or_default().insert(key_id, signature.to_base64())
    }

    /// Try to find an Ed25519 signature from the given signer with the given
    /// key id.
    ///
    /// Signatures that can't be decoded are treated as missing.
    pub fn get_signature(&self, signer: &UserId, key_id: &str) -> Option<Ed25519Signature> {
        let signature = self.get(signer)?.get(key_id)?;
        Ed25519Signature::from_base64(signature).ok()
    }

    /// Get the map of signatures that belong to the given user.
    pub fn get(&self, signer: &UserId) -> Option<&BTreeMap<String, String>> {
        self.0.get(signer)
    }

    /// Merge the signatures of another collection into this one.
    pub fn extend(&mut self, other: Signatures) {
        for (user, signatures) in other.0 {
            self.0.entry(user).or_default().extend(signatures);
        }
    }

    /// Do we hold any signatures or is our collection completely empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// How many signatures do we currently hold.
    pub fn signature_count(&self) -> usize {
        self.0.values().map(|u| u.len()).sum()
    }
}

impl<'de> Deserialize<'de> for Signatures {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let map: BTreeMap<OwnedUserId, BTreeMap<String, String>> =
            Deserialize::deserialize(deserializer)?;

        Ok(Signatures(map))
    }
}

impl Serialize for Signatures {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

// Vodozemac serializes keys directly as a byteslice, while matrix likes to
// base64 encode all byte slices.
//
// These modules make sure that we serialize/deserialize in a Matrix compatible
// way, use them with `#[serde(with = "...")]`.

/// Serde helpers for base64 encoded Curve25519 keys.
pub mod serde_curve_key {
    use serde::{Deserialize, Deserializer, Serializer};
    use vodozemac::Curve25519PublicKey;

    /// Serialize the key as an unpadded base64 string.
    pub fn serialize<S>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&key.to_base64())
    }

    /// Deserialize the key from a base64 string.
    pub fn deserialize<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let key: String = Deserialize::deserialize(de)?;
        Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
    }
}

/// Serde helpers for base64 encoded Ed25519 keys.
pub mod serde_ed25519_key {
    use serde::{Deserialize, Deserializer, Serializer};
    use vodozemac::Ed25519PublicKey;

    /// Serialize the key as an unpadded base64 string.
    pub fn serialize<S>(key: &Ed25519PublicKey, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&key.to_base64())
    }

    /// Deserialize the key from a base64 string.
    pub fn deserialize<'de, D>(de: D) -> Result<Ed25519PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let key: String = Deserialize::deserialize(de)?;
        Ed25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
    }
}

/// An object that carries signatures over its own canonical JSON form.
pub trait SignedJsonObject: Serialize {
    /// The signatures of the object.
    fn signatures(&self) -> &Signatures;
}

/// Identity keys for a device, in the shape of a `/keys/query` response.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceKeys {
    /// The ID of the user the device belongs to.
    pub user_id: OwnedUserId,

    /// The ID of the device these keys belong to.
    pub device_id: OwnedDeviceId,

    /// The encryption algorithms supported by this device.
    pub algorithms: Vec<EventEncryptionAlgorithm>,

    /// Public identity keys, keyed by `<algorithm>:<device_id>`.
    pub keys: BTreeMap<String, String>,

    /// Signatures for the device key object.
    #[serde(default)]
    pub signatures: Signatures,
}

impl DeviceKeys {
    /// Create device keys for the given device from a pair of identity keys.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        curve25519: Curve25519PublicKey,
        ed25519: Ed25519PublicKey,
    ) -> Self {
        let keys = BTreeMap::from([
            (key_id(CURVE25519, device_id.as_str()), curve25519.to_base64()),
            (key_id(ED25519, device_id.as_str()), ed25519.to_base64()),
        ]);

        Self {
            user_id,
            device_id,
            algorithms: vec![
                EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
                EventEncryptionAlgorithm::MegolmV1AesSha2,
            ],
            keys,
            signatures: Signatures::new(),
        }
    }

    /// Get the key id of the Ed25519 key of the given device.
    pub fn ed25519_key_id(device_id: &DeviceId) -> String {
        key_id(ED25519, device_id.as_str())
    }

    /// Get the Curve25519 key of the device, if it has a valid one.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        let key = self.keys.get(&key_id(CURVE25519, self.device_id.as_str()))?;
        Curve25519PublicKey::from_base64(key).ok()
    }

    /// Get the Ed25519 key of the device, if it has a valid one.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        let key = self.keys.get(&Self::ed25519_key_id(&self.device_id))?;
        Ed25519PublicKey::from_base64(key).ok()
    }
}

impl SignedJsonObject for DeviceKeys {
    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}

/// A signed Curve25519 one-time key.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SignedKey {
    /// The base64 encoded Curve25519 key.
    pub key: String,

    /// Signatures for the key object.
    #[serde(default)]
    pub signatures: Signatures,
}

impl SignedKey {
    /// The Curve25519 key, if it's valid.
    pub fn key(&self) -> Option<Curve25519PublicKey> {
        Curve25519PublicKey::from_base64(&self.key).ok()
    }
}

impl SignedJsonObject for SignedKey {
    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}

/// What a cross-signing key is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    /// The master key of the user.
    Master,
    /// The key that signs the user's own devices.
    SelfSigning,
    /// The key that signs other users' master keys.
    UserSigning,
}

/// A cross-signing key, in the shape of a `/keys/query` response.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CrossSigningKey {
    /// The ID of the user the key belongs to.
    pub user_id: OwnedUserId,

    /// What the key is used for.
    pub usage: Vec<KeyUsage>,

    /// The public key, the map must have exactly one entry.
    pub keys: BTreeMap<String, String>,

    /// Signatures of the key, only optional for the master key.
    #[serde(default, skip_serializing_if = "Signatures::is_empty")]
    pub signatures: Signatures,
}

impl CrossSigningKey {
    /// Create a new, unsigned, cross-signing key for the given usage.
    pub fn new(user_id: OwnedUserId, usage: KeyUsage, public_key: Ed25519PublicKey) -> Self {
        let encoded = public_key.to_base64();
        let keys = BTreeMap::from([(key_id(ED25519, &encoded), encoded)]);

        Self { user_id, usage: vec![usage], keys, signatures: Signatures::new() }
    }

    /// Get the key id and the Ed25519 key of this cross-signing key.
    pub fn get_first_key_and_id(&self) -> Option<(&str, Ed25519PublicKey)> {
        let (key_id, key) = self.keys.iter().next()?;
        let key = Ed25519PublicKey::from_base64(key).ok()?;
        Some((key_id.as_str(), key))
    }

    /// Get the Ed25519 key of this cross-signing key.
    pub fn get_first_key(&self) -> Option<Ed25519PublicKey> {
        self.get_first_key_and_id().map(|(_, k)| k)
    }

    /// Is the key meant to be used for the given usage.
    pub fn has_usage(&self, usage: KeyUsage) -> bool {
        self.usage.contains(&usage)
    }
}

impl SignedJsonObject for CrossSigningKey {
    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}
