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

use std::fmt;

use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::{base64_decode, base64_encode};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ciphers::{AesHmacSha2Key, IV_SIZE, MAC_SIZE, SALT_SIZE};

const KEY_SIZE: usize = 32;
#[cfg(not(test))]
const KDF_ROUNDS: u32 = 200_000;
#[cfg(test)]
const KDF_ROUNDS: u32 = 1000;

const VALUE_INFO: &[u8] = b"matrix-sdk-e2ee pickle value";

/// Error type for the decryption of values protected by a [`PickleKey`].
#[derive(Debug, Error)]
pub enum PickleKeyError {
    /// The ciphertext wasn't valid base64.
    #[error(transparent)]
    Decode(#[from] vodozemac::Base64DecodeError),

    /// A field had an unexpected length.
    #[error("the encrypted value has an invalid {0} length")]
    InvalidLength(&'static str),

    /// The MAC didn't match, the key is wrong or the data was tampered with.
    #[error("the MAC of the encrypted value didn't match")]
    Mac,

    /// The encrypted value uses a version we don't understand.
    #[error("unsupported encrypted value version {0}")]
    UnsupportedVersion(u8),
}

/// Version specific info for the key derivation method that is used.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum KdfInfo {
    /// PBKDF2 with HMAC-SHA-512.
    Pbkdf2 {
        /// The number of PBKDF rounds that were used when deriving the key.
        rounds: u32,
        /// The base64 encoded salt.
        salt: String,
    },
}

/// A value encrypted with AES-CTR-256 and authenticated with HMAC-SHA-256.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedValue {
    version: u8,
    iv: String,
    ciphertext: String,
    mac: String,
}

impl EncryptedValue {
    const VERSION: u8 = 1;

    fn seal(key: &AesHmacSha2Key, plaintext: &[u8]) -> Self {
        let (ciphertext, iv) = key.encrypt(plaintext.to_vec());
        let mac = key.create_mac_tag(&ciphertext);

        Self {
            version: Self::VERSION,
            iv: base64_encode(iv),
            ciphertext: base64_encode(&ciphertext),
            mac: base64_encode(mac.as_bytes()),
        }
    }

    fn open(&self, key: &AesHmacSha2Key) -> Result<Vec<u8>, PickleKeyError> {
        if self.version != Self::VERSION {
            return Err(PickleKeyError::UnsupportedVersion(self.version));
        }

        let iv: [u8; IV_SIZE] = base64_decode(&self.iv)?
            .try_into()
            .map_err(|_| PickleKeyError::InvalidLength("IV"))?;
        let mac: [u8; MAC_SIZE] = base64_decode(&self.mac)?
            .try_into()
            .map_err(|_| PickleKeyError::InvalidLength("MAC"))?;
        let ciphertext = base64_decode(&self.ciphertext)?;

        key.verify_mac(&ciphertext, &mac).map_err(|_| PickleKeyError::Mac)?;

        Ok(key.decrypt(ciphertext, &iv))
    }
}

/// An encrypted version of our pickle key, this can be safely stored in a
/// database.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPickleKey {
    /// Info about the key derivation method that was used to expand the
    /// passphrase into an encryption key.
    pub kdf_info: KdfInfo,
    /// The encrypted pickle key.
    pub ciphertext: EncryptedValue,
}

/// A pickle key that will be used to encrypt all the private keys for Olm.
///
/// Accounts, sessions and group sessions are pickled by vodozemac with this
/// key, the cross-signing seeds are sealed with a key derived from it.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct PickleKey(Box<[u8; KEY_SIZE]>);

impl fmt::Debug for PickleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PickleKey").field(&"<redacted>").finish()
    }
}

impl Default for PickleKey {
    fn default() -> Self {
        let mut key = Box::new([0u8; KEY_SIZE]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self(key)
    }
}

impl PickleKey {
    /// Generate a new random pickle key.
    pub fn new() -> Self {
        Default::default()
    }

    /// Create a pickle key from raw bytes.
    pub fn from_bytes(bytes: &[u8; KEY_SIZE]) -> Self {
        Self(Box::new(*bytes))
    }

    /// Get the raw AES256 key.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn value_key(&self) -> AesHmacSha2Key {
        AesHmacSha2Key::from_secret(&self.0, VALUE_INFO)
    }

    /// Encrypt an arbitrary byte string with this pickle key.
    pub(crate) fn encrypt_bytes(&self, plaintext: &[u8]) -> EncryptedValue {
        EncryptedValue::seal(&self.value_key(), plaintext)
    }

    /// Decrypt a byte string that was encrypted with [`Self::encrypt_bytes`].
    pub(crate) fn decrypt_bytes(&self, value: &EncryptedValue) -> Result<Vec<u8>, PickleKeyError> {
        value.open(&self.value_key())
    }

    /// Encrypt and export our pickle key using the given passphrase.
    ///
    /// # Arguments
    ///
    /// * `passphrase` - The passphrase that should be used to encrypt the
    ///   pickle key.
    pub fn encrypt(&self, passphrase: &str) -> EncryptedPickleKey {
        let mut salt = [0u8; SALT_SIZE];
        thread_rng().fill_bytes(&mut salt);

        let key = AesHmacSha2Key::from_passphrase(passphrase, KDF_ROUNDS, &salt);

        EncryptedPickleKey {
            kdf_info: KdfInfo::Pbkdf2 { rounds: KDF_ROUNDS, salt: base64_encode(salt) },
            ciphertext: EncryptedValue::seal(&key, self.0.as_slice()),
        }
    }

    /// Restore a pickle key from an encrypted export.
    ///
    /// # Arguments
    ///
    /// * `passphrase` - The passphrase that was used to encrypt the pickle
    ///   key.
    ///
    /// * `encrypted` - The exported and encrypted version of the pickle key.
    pub fn from_encrypted(
        passphrase: &str,
        encrypted: &EncryptedPickleKey,
    ) -> Result<Self, PickleKeyError> {
        let key = match &encrypted.kdf_info {
            KdfInfo::Pbkdf2 { rounds, salt } => {
                let salt: [u8; SALT_SIZE] = base64_decode(salt)?
                    .try_into()
                    .map_err(|_| PickleKeyError::InvalidLength("salt"))?;
                AesHmacSha2Key::from_passphrase(passphrase, *rounds, &salt)
            }
        };

        let mut decrypted = encrypted.ciphertext.open(&key)?;
        let result = <[u8; KEY_SIZE]>::try_from(decrypted.as_slice())
            .map(|k| Self::from_bytes(&k))
            .map_err(|_| PickleKeyError::InvalidLength("key"));

        decrypted.zeroize();

        result
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;

    use super::*;

    #[test]
    fn generating() {
        assert_ne!(PickleKey::new(), PickleKey::new());
    }

    #[test]
    fn encrypting() {
        let passphrase = "it's a secret to everybody";
        let pickle_key = PickleKey::new();

        let encrypted = pickle_key.encrypt(passphrase);
        let decrypted = PickleKey::from_encrypted(passphrase, &encrypted).unwrap();

        assert_eq!(pickle_key, decrypted);
        assert_matches!(
            PickleKey::from_encrypted("wrong passphrase", &encrypted),
            Err(PickleKeyError::Mac)
        );
    }

    #[test]
    fn values_roundtrip_and_are_authenticated() {
        let pickle_key = PickleKey::new();

        let encrypted = pickle_key.encrypt_bytes(b"cross-signing seed");
        assert_eq!(pickle_key.decrypt_bytes(&encrypted).unwrap(), b"cross-signing seed");

        assert_matches!(PickleKey::new().decrypt_bytes(&encrypted), Err(PickleKeyError::Mac));
    }

    #[test]
    fn debug_output_is_redacted() {
        let pickle_key = PickleKey::from_bytes(&[42u8; 32]);
        assert_eq!(format!("{pickle_key:?}"), r#"PickleKey("<redacted>")"#);
    }
}
