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

use hmac::Hmac;
use itertools::Itertools;
use pbkdf2::pbkdf2;
use rand::{distributions::Alphanumeric, thread_rng, Rng, RngCore};
use sha2::Sha512;
use thiserror::Error;
use vodozemac::{base64_decode, base64_encode, Curve25519PublicKey, Curve25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::MegolmV1BackupKey;
use crate::{
    ciphers::{AesHmacSha2Key, TRUNCATED_MAC_SIZE},
    store::{EncryptedValue, PickleKey, PickleKeyError},
    types::backup::{BackedUpRoomKey, EncryptedSessionData, MegolmV1AuthData},
};

#[cfg(not(test))]
const PBKDF_ROUNDS: u32 = 500_000;
#[cfg(test)]
const PBKDF_ROUNDS: u32 = 1000;
const SALT_LENGTH: usize = 32;

/// Error type for the decoding of a [`BackupRecoveryKey`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The key didn't start with `0x8B 0x01`.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte didn't match, the key was most likely mistyped.
    #[error("The parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),
    /// The decoded key has the wrong number of bytes.
    #[error("The decoded recovery key has a invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
    /// The key isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
}

/// Error type for the decryption of a backed up room key.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// The ephemeral key of the backed up room key isn't a valid key.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// A field of the backed up room key wasn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),

    /// The MAC of the backed up room key didn't match.
    #[error("the MAC of the backed up room key didn't match")]
    Mac,

    /// The decrypted room key couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The PBKDF2 parameters that turn a passphrase into a [`BackupRecoveryKey`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassphraseInfo {
    /// The salt that was mixed into the passphrase.
    pub private_key_salt: String,
    /// The number of PBKDF2 rounds.
    pub private_key_iterations: u32,
}

/// The private part of a backup key.
///
/// Whoever holds it can decrypt every room key of the backup, treat it like a
/// password.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct BackupRecoveryKey {
    key: Box<[u8; BackupRecoveryKey::KEY_SIZE]>,
    #[zeroize(skip)]
    passphrase_info: Option<PassphraseInfo>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupRecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupRecoveryKey")
            .field("public_key", &self.megolm_v1_public_key().to_base64())
            .field("passphrase_info", &self.passphrase_info)
            .finish_non_exhaustive()
    }
}

impl TryFrom<String> for BackupRecoveryKey {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_base58(&value)
    }
}

impl std::fmt::Display for BackupRecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = Zeroizing::new(self.to_base58());
        write!(f, "{}", string.as_str())
    }
}

impl BackupRecoveryKey {
    const KEY_SIZE: usize = 32;
    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Create a new random recovery key.
    pub fn new() -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self { key, passphrase_info: None }
    }

    /// Create a recovery key from its raw bytes.
    pub fn from_bytes(bytes: &[u8; Self::KEY_SIZE]) -> Self {
        Self { key: Box::new(*bytes), passphrase_info: None }
    }

    /// Try to create a recovery key from a base64 encoded string.
    pub fn from_base64(key: &str) -> Result<Self, DecodeError> {
        let decoded = Zeroizing::new(base64_decode(key)?);

        if decoded.len() != Self::KEY_SIZE {
            Err(DecodeError::Length(Self::KEY_SIZE, decoded.len()))
        } else {
            let mut key = Box::new([0u8; Self::KEY_SIZE]);
            key.copy_from_slice(&decoded);

            Ok(Self { key, passphrase_info: None })
        }
    }

    /// Export the recovery key as a base64 encoded string.
    pub fn to_base64(&self) -> String {
        base64_encode(self.key.as_slice())
    }

    /// Try to parse the human readable base58 form of the recovery key.
    ///
    /// Whitespace is ignored.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        let value: Zeroizing<String> =
            Zeroizing::new(value.chars().filter(|c| !c.is_whitespace()).collect());

        let decoded = Zeroizing::new(
            bs58::decode(value.as_str()).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
        );

        let expected_length = Self::PREFIX.len() + Self::KEY_SIZE + 1;

        if decoded.len() != expected_length {
            return Err(DecodeError::Length(expected_length, decoded.len()));
        }

        let prefix = [decoded[0], decoded[1]];
        let key = &decoded[Self::PREFIX.len()..Self::PREFIX.len() + Self::KEY_SIZE];
        let expected_parity = decoded[expected_length - 1];
        let parity = Self::parity_byte(key);

        if prefix != Self::PREFIX {
            Err(DecodeError::Prefix(Self::PREFIX, prefix))
        } else if expected_parity != parity {
            Err(DecodeError::Parity(expected_parity, parity))
        } else {
            let mut bytes = Box::new([0u8; Self::KEY_SIZE]);
            bytes.copy_from_slice(key);

            Ok(Self { key: bytes, passphrase_info: None })
        }
    }

    /// Export the recovery key in its human readable base58 form.
    ///
    /// The key is prefixed with `0x8B 0x01`, followed by a parity byte, and
    /// split into groups of four characters.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_ref(),
                self.key.as_slice(),
                [Self::parity_byte(self.key.as_slice())].as_ref(),
            ]
            .concat(),
        );

        let encoded = Zeroizing::new(
            bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string(),
        );
        let chars = Zeroizing::new(encoded.chars().collect::<Vec<char>>());

        chars.chunks(Self::DISPLAY_CHUNK_SIZE).map(|c| c.iter().collect::<String>()).join(" ")
    }

    /// Derive the recovery key from a passphrase, using the salt and the
    /// number of rounds of an existing backup.
    pub fn from_passphrase(passphrase: &str, salt: &str, rounds: u32) -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);

        pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), salt.as_bytes(), rounds, key.as_mut_slice())
            .expect(
                "We should be able to expand a passphrase of any length due to \
                 HMAC being able to be initialized with any input size",
            );

        Self {
            key,
            passphrase_info: Some(PassphraseInfo {
                private_key_salt: salt.to_owned(),
                private_key_iterations: rounds,
            }),
        }
    }

    /// Derive a new recovery key from a passphrase with a fresh random salt.
    pub fn new_from_passphrase(passphrase: &str) -> Self {
        let salt: String =
            thread_rng().sample_iter(Alphanumeric).take(SALT_LENGTH).map(char::from).collect();

        Self::from_passphrase(passphrase, &salt, PBKDF_ROUNDS)
    }

    /// The PBKDF2 parameters, if the key was derived from a passphrase.
    pub fn passphrase_info(&self) -> Option<&PassphraseInfo> {
        self.passphrase_info.as_ref()
    }

    fn secret_key(&self) -> Box<Curve25519SecretKey> {
        Box::new(Curve25519SecretKey::from_slice(&self.key))
    }

    /// Get the public part of the key.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        let public_key = Curve25519PublicKey::from(&*self.secret_key());
        MegolmV1BackupKey::new(public_key, None)
    }

    /// The unsigned auth data of a backup that uses this key.
    pub fn auth_data(&self) -> MegolmV1AuthData {
        let mut auth_data = self.megolm_v1_public_key().auth_data();

        if let Some(info) = &self.passphrase_info {
            auth_data.private_key_salt = Some(info.private_key_salt.clone());
            auth_data.private_key_iterations = Some(info.private_key_iterations);
        }

        auth_data
    }

    /// Decrypt a room key of a `m.megolm_backup.v1.curve25519-aes-sha2`
    /// backup.
    pub fn decrypt_v1(
        &self,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, DecryptionError> {
        let ephemeral = Curve25519PublicKey::from_base64(&session_data.ephemeral)?;
        let ciphertext = base64_decode(&session_data.ciphertext)?;
        let mac = base64_decode(&session_data.mac)?;

        if mac.len() != TRUNCATED_MAC_SIZE {
            return Err(DecryptionError::Mac);
        }

        let shared_secret = self.secret_key().diffie_hellman(&ephemeral);
        let (cipher, iv) = AesHmacSha2Key::from_backup_shared_secret(shared_secret.as_bytes());

        cipher.verify_truncated_mac(&ciphertext, &mac).map_err(|_| DecryptionError::Mac)?;

        let plaintext = Zeroizing::new(cipher.decrypt(ciphertext, &iv));

        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Seal the key with the pickle key so it can be stored.
    pub(crate) fn encrypt(&self, pickle_key: &PickleKey) -> EncryptedValue {
        pickle_key.encrypt_bytes(self.key.as_slice())
    }

    /// Open a key that was sealed with [`BackupRecoveryKey::encrypt`].
    pub(crate) fn decrypt(
        value: &EncryptedValue,
        pickle_key: &PickleKey,
    ) -> Result<Self, PickleKeyError> {
        let bytes = Zeroizing::new(pickle_key.decrypt_bytes(value)?);

        let bytes: &[u8; Self::KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PickleKeyError::InvalidLength("backup key"))?;

        Ok(Self::from_bytes(bytes))
    }
}

impl Default for BackupRecoveryKey {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use proptest::prelude::*;

    use super::*;

    const TEST_KEY: [u8; 32] = [
        0x77, 0x07, 0x6D, 0x0A, 0x73, 0x18, 0xA5, 0x7D, 0x3C, 0x16, 0xC1, 0x72, 0x51, 0xB2, 0x66,
        0x45, 0xDF, 0x4C, 0x2F, 0x87, 0xEB, 0xC0, 0x99, 0x2A, 0xB1, 0x77, 0xFB, 0xA5, 0x1D, 0xB9,
        0x2C, 0x2A,
    ];

    #[test]
    fn base64_decoding() {
        let key = BackupRecoveryKey::new();

        let base64 = key.to_base64();
        let decoded = BackupRecoveryKey::from_base64(&base64).unwrap();
        assert_eq!(key.key, decoded.key);

        assert_matches!(
            BackupRecoveryKey::from_base64(&base64_encode([0u8; 16])),
            Err(DecodeError::Length(32, 16))
        );
    }

    #[test]
    fn base58_form_is_chunked_and_prefixed() {
        let key = BackupRecoveryKey::from_bytes(&TEST_KEY);
        let encoded = key.to_base58();

        assert!(encoded.starts_with("Es"));
        assert!(encoded.split(' ').all(|chunk| chunk.len() <= 4));
        assert!(encoded.split(' ').rev().skip(1).all(|chunk| chunk.len() == 4));
        assert_eq!(encoded, key.to_string());

        let decoded = BackupRecoveryKey::from_base58(&encoded).unwrap();
        assert_eq!(decoded.key.as_ref(), &TEST_KEY);
    }

    #[test]
    fn base58_errors() {
        let key = BackupRecoveryKey::from_bytes(&TEST_KEY);
        let bytes = [BackupRecoveryKey::PREFIX.as_ref(), TEST_KEY.as_ref()].concat();

        let mut bad_parity = bytes.clone();
        bad_parity.push(BackupRecoveryKey::parity_byte(&TEST_KEY) ^ 1);
        let bad_parity = bs58::encode(bad_parity).into_string();
        assert_matches!(BackupRecoveryKey::from_base58(&bad_parity), Err(DecodeError::Parity(..)));

        let mut bad_prefix = bytes;
        bad_prefix[0] = 0;
        bad_prefix.push(BackupRecoveryKey::parity_byte(&TEST_KEY));
        let bad_prefix = bs58::encode(bad_prefix).into_string();
        assert_matches!(BackupRecoveryKey::from_base58(&bad_prefix), Err(DecodeError::Prefix(..)));

        let truncated: String = key.to_base58().chars().take(20).collect();
        assert_matches!(BackupRecoveryKey::from_base58(&truncated), Err(DecodeError::Length(..)));

        assert_matches!(BackupRecoveryKey::from_base58("0OIl"), Err(DecodeError::Base58(_)));
    }

    #[test]
    fn passphrases_derive_the_same_key() {
        let key = BackupRecoveryKey::new_from_passphrase("correct horse battery staple");
        let info = key.passphrase_info().unwrap().clone();

        assert_eq!(info.private_key_salt.len(), SALT_LENGTH);
        assert_eq!(info.private_key_iterations, PBKDF_ROUNDS);

        let derived = BackupRecoveryKey::from_passphrase(
            "correct horse battery staple",
            &info.private_key_salt,
            info.private_key_iterations,
        );
        assert_eq!(key.key, derived.key);

        let auth_data = key.auth_data();
        assert_eq!(auth_data.private_key_salt, Some(info.private_key_salt.clone()));
        assert_eq!(auth_data.public_key, derived.megolm_v1_public_key().public_key());

        let wrong = BackupRecoveryKey::from_passphrase(
            "wrong horse",
            &info.private_key_salt,
            info.private_key_iterations,
        );
        assert_ne!(wrong.megolm_v1_public_key(), key.megolm_v1_public_key());
    }

    #[test]
    fn sealed_keys_can_be_opened() {
        let pickle_key = PickleKey::new();
        let key = BackupRecoveryKey::new();

        let sealed = key.encrypt(&pickle_key);
        let opened = BackupRecoveryKey::decrypt(&sealed, &pickle_key).unwrap();
        assert_eq!(key.key, opened.key);

        assert!(BackupRecoveryKey::decrypt(&sealed, &PickleKey::new()).is_err());
    }

    #[test]
    fn debug_output_redacts_the_key() {
        let key = BackupRecoveryKey::from_bytes(&TEST_KEY);
        let debug = format!("{key:?}");

        assert!(!debug.contains(&key.to_base64()));
        assert!(debug.contains(&key.megolm_v1_public_key().to_base64()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn base58_roundtrip(bytes in any::<[u8; 32]>()) {
            let key = BackupRecoveryKey::from_bytes(&bytes);
            let decoded = BackupRecoveryKey::from_base58(&key.to_base58()).unwrap();

            prop_assert_eq!(decoded.key.as_ref(), &bytes);
        }
    }
}
