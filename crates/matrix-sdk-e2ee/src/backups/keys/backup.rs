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

use std::sync::{Arc, Mutex};

use vodozemac::{base64_encode, Curve25519PublicKey, Curve25519SecretKey, KeyError};
use zeroize::Zeroizing;

use crate::{
    ciphers::{AesHmacSha2Key, TRUNCATED_MAC_SIZE},
    olm::InboundGroupSession,
    types::backup::{EncryptedSessionData, KeyBackupData, MegolmV1AuthData, MEGOLM_BACKUP_V1},
};

#[derive(Debug)]
struct InnerBackupKey {
    key: Curve25519PublicKey,
    version: Mutex<Option<String>>,
}

/// The public part of a backup key.
#[derive(Clone)]
pub struct MegolmV1BackupKey {
    inner: Arc<InnerBackupKey>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for MegolmV1BackupKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MegolmV1BackupKey")
            .field("key", &self.to_base64())
            .field("version", &self.backup_version())
            .finish()
    }
}

impl PartialEq for MegolmV1BackupKey {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl MegolmV1BackupKey {
    pub(crate) fn new(key: Curve25519PublicKey, version: Option<String>) -> Self {
        Self { inner: InnerBackupKey { key, version: Mutex::new(version) }.into() }
    }

    /// Get the full name of the backup algorithm this backup key supports.
    pub fn backup_algorithm(&self) -> &str {
        MEGOLM_BACKUP_V1
    }

    /// Try to create a new `MegolmV1BackupKey` from a base 64 encoded string.
    pub fn from_base64(public_key: &str) -> Result<Self, KeyError> {
        let key = Curve25519PublicKey::from_base64(public_key)?;
        Ok(Self::new(key, None))
    }

    /// Convert the [`MegolmV1BackupKey`] to a base 64 encoded string.
    pub fn to_base64(&self) -> String {
        self.inner.key.to_base64()
    }

    /// The Curve25519 key room keys get encrypted to.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.inner.key
    }

    /// Get the backup version that this key is used with, if any.
    pub fn backup_version(&self) -> Option<String> {
        self.inner.version.lock().unwrap().clone()
    }

    /// Set the backup version that this `MegolmV1BackupKey` will be used with.
    ///
    /// The key won't be able to encrypt room keys unless a version has been
    /// set.
    pub fn set_version(&self, version: String) {
        *self.inner.version.lock().unwrap() = Some(version);
    }

    /// The unsigned auth data announcing this key.
    pub fn auth_data(&self) -> MegolmV1AuthData {
        MegolmV1AuthData::new(self.inner.key)
    }

    /// Encrypt a room key for the backup.
    ///
    /// A fresh ephemeral key is agreed with the backup key, the shared secret
    /// is expanded into the AES key, the MAC key and the IV.
    pub(crate) async fn encrypt(&self, session: &InboundGroupSession) -> KeyBackupData {
        // Only whether the key came directly from its creator matters here.
        let forwarded_count = u32::from(session.has_been_imported());
        let first_message_index = session.first_known_index();

        let key = session.to_backup().await;
        let key =
            Zeroizing::new(serde_json::to_vec(&key).expect("Can't serialize exported room key"));

        let ephemeral = Curve25519SecretKey::new();
        let shared_secret = ephemeral.diffie_hellman(&self.inner.key);
        let (cipher, iv) = AesHmacSha2Key::from_backup_shared_secret(shared_secret.as_bytes());

        let ciphertext = cipher.encrypt_with_iv(key.to_vec(), &iv);
        let mac = cipher.create_mac_tag(&ciphertext);

        KeyBackupData {
            first_message_index,
            forwarded_count,
            is_verified: false,
            session_data: EncryptedSessionData {
                ephemeral: Curve25519PublicKey::from(&ephemeral).to_base64(),
                ciphertext: base64_encode(&ciphertext),
                mac: base64_encode(&mac.as_bytes()[..TRUNCATED_MAC_SIZE]),
            },
        }
    }
}
