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

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use super::{serde_curve_key, EventEncryptionAlgorithm, SignedJsonObject, Signatures};

/// The wire name of the only backup algorithm we support.
pub const MEGOLM_BACKUP_V1: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// Auth data for the `m.megolm_backup.v1.curve25519-aes-sha2` backup
/// algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmV1AuthData {
    /// The Curve25519 public key used to encrypt the backups.
    #[serde(with = "serde_curve_key")]
    pub public_key: Curve25519PublicKey,

    /// Signatures of the auth_data, as Signed JSON.
    #[serde(default)]
    pub signatures: Signatures,

    /// The salt used to derive the backup key from a passphrase, if one was
    /// used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_salt: Option<String>,

    /// The number of PBKDF2 rounds used to derive the backup key from a
    /// passphrase, if one was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_iterations: Option<u32>,
}

impl MegolmV1AuthData {
    /// Create a new, unsigned, [`MegolmV1AuthData`] from a public Curve25519
    /// key.
    pub fn new(public_key: Curve25519PublicKey) -> Self {
        Self {
            public_key,
            signatures: Signatures::new(),
            private_key_salt: None,
            private_key_iterations: None,
        }
    }
}

impl SignedJsonObject for MegolmV1AuthData {
    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}

/// Information pertaining to a room key backup.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "BackupInfoHelper")]
pub enum RoomKeyBackupInfo {
    /// The `m.megolm_backup.v1.curve25519-aes-sha2` variant of a backup.
    MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData),
    /// Any other unknown backup variant.
    Other {
        /// The algorithm of the unknown backup variant.
        algorithm: String,
        /// The auth data of the unknown backup variant.
        auth_data: BTreeMap<String, Value>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupInfoHelper {
    algorithm: String,
    auth_data: Value,
}

impl TryFrom<BackupInfoHelper> for RoomKeyBackupInfo {
    type Error = serde_json::Error;

    fn try_from(value: BackupInfoHelper) -> Result<Self, Self::Error> {
        Ok(match value.algorithm.as_str() {
            MEGOLM_BACKUP_V1 => {
                let data: MegolmV1AuthData = serde_json::from_value(value.auth_data)?;
                RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data)
            }
            _ => RoomKeyBackupInfo::Other {
                algorithm: value.algorithm,
                auth_data: serde_json::from_value(value.auth_data)?,
            },
        })
    }
}

impl Serialize for RoomKeyBackupInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let helper = match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => BackupInfoHelper {
                algorithm: MEGOLM_BACKUP_V1.to_owned(),
                auth_data: serde_json::to_value(d).map_err(serde::ser::Error::custom)?,
            },
            RoomKeyBackupInfo::Other { algorithm, auth_data } => BackupInfoHelper {
                algorithm: algorithm.to_owned(),
                auth_data: serde_json::to_value(auth_data.clone())
                    .map_err(serde::ser::Error::custom)?,
            },
        };

        helper.serialize(serializer)
    }
}

/// A backup version as returned by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupVersion {
    /// The opaque version string the server assigned to the backup.
    pub version: String,

    /// The algorithm and auth data of the backup.
    #[serde(flatten)]
    pub info: RoomKeyBackupInfo,

    /// The number of keys stored in the backup.
    #[serde(default)]
    pub count: u64,
}

/// The encrypted payload of a single backed up room key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// The base64 encoded ephemeral Curve25519 key used for the ECDH step.
    pub ephemeral: String,

    /// The base64 encoded ciphertext.
    pub ciphertext: String,

    /// The base64 encoded MAC of the ciphertext.
    pub mac: String,
}

/// A single backed up room key, as stored on the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The index of the first message in the session that the key can
    /// decrypt.
    pub first_message_index: u32,

    /// The number of times this key has been forwarded.
    pub forwarded_count: u32,

    /// Whether the device backing up the key verified the device that the
    /// key is from.
    pub is_verified: bool,

    /// The encrypted session data.
    pub session_data: EncryptedSessionData,
}

/// The plaintext that gets encrypted into [`EncryptedSessionData`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The Curve25519 key of the device which initiated the session
    /// originally.
    #[serde(with = "serde_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The base64 encoded exported session key.
    pub session_key: String,

    /// The Ed25519 key of the device which initiated the session originally.
    pub sender_claimed_keys: BTreeMap<String, String>,

    /// Chain of Curve25519 keys through which this session was forwarded.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// Backed up room keys, keyed by room id and then by session id.
pub type RoomKeyBackup = BTreeMap<OwnedRoomId, BTreeMap<String, KeyBackupData>>;

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use serde_json::json;

    use super::RoomKeyBackupInfo;

    #[test]
    fn serialization() {
        let json = json!({
            "algorithm": "m.megolm_backup.v2",
            "auth_data": {
                "some": "data"
            }
        });

        let deserialized: RoomKeyBackupInfo = serde_json::from_value(json.clone()).unwrap();
        assert_matches!(deserialized, RoomKeyBackupInfo::Other { algorithm: _, auth_data: _ });

        let serialized = serde_json::to_value(deserialized).unwrap();
        assert_eq!(json, serialized);

        let json = json!({
            "algorithm": "m.megolm_backup.v1.curve25519-aes-sha2",
            "auth_data": {
                "public_key":"XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM",
                "signatures": {
                    "@alice:example.org": {
                        "ed25519:deviceid": "signature"
                    }
                },
                "private_key_salt": "saltsalt",
                "private_key_iterations": 500000,
            }
        });

        let deserialized: RoomKeyBackupInfo = serde_json::from_value(json.clone()).unwrap();
        assert_matches!(&deserialized, RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data));
        assert_eq!(data.private_key_iterations, Some(500_000));

        let serialized = serde_json::to_value(deserialized).unwrap();
        similar_asserts::assert_eq!(json, serialized);
    }
}
