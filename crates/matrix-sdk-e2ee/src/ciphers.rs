// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use aes::{
    cipher::{generic_array::GenericArray, IvSizeUser, KeyIvInit, KeySizeUser, StreamCipher},
    Aes256,
};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{
    digest::{FixedOutput, MacError},
    Hmac, Mac as _,
};
use pbkdf2::pbkdf2;
use rand::{thread_rng, RngCore};
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) const IV_SIZE: usize = 16;
pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const SALT_SIZE: usize = 16;
pub(crate) const MAC_SIZE: usize = 32;
/// Room key backups only transmit the first 8 bytes of the MAC.
pub(crate) const TRUNCATED_MAC_SIZE: usize = 8;

const BACKUP_KEY_MATERIAL_SIZE: usize = KEY_SIZE * 2 + IV_SIZE;

type Aes256Ctr = Ctr128BE<Aes256>;

type Aes256Key = GenericArray<u8, <Aes256Ctr as KeySizeUser>::KeySize>;
type Aes256Iv = GenericArray<u8, <Aes256Ctr as IvSizeUser>::IvSize>;
type HmacSha256Key = [u8; KEY_SIZE];

/// An authentication tag for the HMAC-SHA-256 message authentication algorithm.
#[derive(Debug)]
pub(crate) struct HmacSha256Mac([u8; MAC_SIZE]);

impl HmacSha256Mac {
    /// Represent the MAC tag as an array of bytes.
    pub(crate) fn as_bytes(&self) -> &[u8; MAC_SIZE] {
        &self.0
    }
}

/// Keys used for our combination of AES-CTR-256 and HMAC-SHA-256.
///
/// ⚠️  This struct provides low-level cryptographic primitives.
///
/// This combination is used in the following places:
///
/// 1. Room key backups, where the keys and the IV are derived from an ECDH
///    shared secret.
/// 2. Passphrase protected pickle keys.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct AesHmacSha2Key {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
}

impl AesHmacSha2Key {
    /// Create a [`AesHmacSha2Key`] from a passphrase.
    ///
    /// The passphrase is expanded using PBKDF2 with HMAC-SHA-512.
    pub(crate) fn from_passphrase(
        passphrase: &str,
        pbkdf_rounds: u32,
        salt: &[u8; SALT_SIZE],
    ) -> Self {
        let mut expanded_keys = [0u8; KEY_SIZE * 2];

        pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), salt, pbkdf_rounds, &mut expanded_keys)
            .expect(
                "We should be able to expand a passphrase of any length due to \
                 HMAC being able to be initialized with any input size",
            );

        let (aes_key, mac_key) = Self::split_keys(&expanded_keys);

        expanded_keys.zeroize();

        Self { aes_key, mac_key }
    }

    /// Expand an ECDH shared secret into a key pair and an initialization
    /// vector.
    ///
    /// HKDF-SHA-256 with an empty salt and empty info produces 80 bytes: the
    /// AES key, the MAC key, and the IV, in that order.
    pub(crate) fn from_backup_shared_secret(shared_secret: &[u8; 32]) -> (Self, [u8; IV_SIZE]) {
        let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
        let mut expanded = [0u8; BACKUP_KEY_MATERIAL_SIZE];

        hkdf.expand(&[], &mut expanded)
            .expect("We should be able to expand the shared secret into 80 bytes");

        let mut keys = [0u8; KEY_SIZE * 2];
        keys.copy_from_slice(&expanded[..KEY_SIZE * 2]);

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&expanded[KEY_SIZE * 2..]);

        let (aes_key, mac_key) = Self::split_keys(&keys);

        keys.zeroize();
        expanded.zeroize();

        (Self { aes_key, mac_key }, iv)
    }

    /// Derive a key pair from a 32 byte secret, domain separated by `info`.
    pub(crate) fn from_secret(secret: &[u8; 32], info: &[u8]) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, secret);
        let mut expanded = [0u8; KEY_SIZE * 2];

        hkdf.expand(info, &mut expanded)
            .expect("We should be able to expand the secret into 64 bytes");

        let (aes_key, mac_key) = Self::split_keys(&expanded);

        expanded.zeroize();

        Self { aes_key, mac_key }
    }

    /// Encrypt the given plaintext and return the ciphertext and the
    /// initialization vector.
    ///
    /// ⚠️  This method is a low-level cryptographic primitive.
    ///
    /// The method does not provide authenticity. You *must* call the
    /// [`AesHmacSha2Key::create_mac_tag()`] method after the encryption step to
    /// create a authentication tag.
    pub(crate) fn encrypt(&self, plaintext: Vec<u8>) -> (Vec<u8>, [u8; IV_SIZE]) {
        let initialization_vector = Self::generate_iv();
        let ciphertext = self.encrypt_with_iv(plaintext, &initialization_vector);

        (ciphertext, initialization_vector)
    }

    /// Encrypt the given plaintext with a caller provided initialization
    /// vector.
    ///
    /// The IV must never be reused with the same key.
    pub(crate) fn encrypt_with_iv(
        &self,
        mut plaintext: Vec<u8>,
        initialization_vector: &[u8; IV_SIZE],
    ) -> Vec<u8> {
        let mut cipher =
            Aes256Ctr::new(self.aes_key(), Aes256Iv::from_slice(initialization_vector));
        cipher.apply_keystream(&mut plaintext);

        plaintext
    }

    /// Create an authentication tag for the given ciphertext.
    ///
    /// ⚠️  This method is a low-level cryptographic primitive.
    pub(crate) fn create_mac_tag(&self, ciphertext: &[u8]) -> HmacSha256Mac {
        let mut mac = [0u8; MAC_SIZE];
        let mac_array = GenericArray::from_mut_slice(&mut mac);

        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key())
            .expect("We should be able to create a new HMAC object from our 32 byte MAC key");

        hmac.update(ciphertext);
        hmac.finalize_into(mac_array);

        HmacSha256Mac(mac)
    }

    /// Verify an authentication tag for the given, encrypted, message.
    ///
    /// The comparison runs in constant time. This method *must* be called
    /// before a call to [`AesHmacSha2Key::decrypt()`].
    pub(crate) fn verify_mac(&self, message: &[u8], mac: &[u8; MAC_SIZE]) -> Result<(), MacError> {
        let mac_array = GenericArray::from_slice(mac);

        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key())
            .expect("We should be able to create a new HMAC object from our 32 byte MAC key");

        hmac.update(message);
        hmac.verify(mac_array)
    }

    /// Verify an authentication tag that was truncated to its leftmost bytes.
    pub(crate) fn verify_truncated_mac(&self, message: &[u8], mac: &[u8]) -> Result<(), MacError> {
        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key())
            .expect("We should be able to create a new HMAC object from our 32 byte MAC key");

        hmac.update(message);
        hmac.verify_truncated_left(mac)
    }

    /// Decrypt the given ciphertext and return the decrypted plaintext.
    ///
    /// The method does not provide authenticity. You *must* call the
    /// [`AesHmacSha2Key::verify_mac()`] method before the decryption step to
    /// verify the authentication tag.
    pub(crate) fn decrypt(
        &self,
        mut ciphertext: Vec<u8>,
        initialization_vector: &[u8; IV_SIZE],
    ) -> Vec<u8> {
        let initialization_vector = Aes256Iv::from_slice(initialization_vector.as_slice());
        let mut cipher = Aes256Ctr::new(self.aes_key(), initialization_vector);
        cipher.apply_keystream(&mut ciphertext);

        ciphertext
    }

    fn split_keys(
        expanded_keys: &[u8; KEY_SIZE * 2],
    ) -> (Box<[u8; KEY_SIZE]>, Box<[u8; KEY_SIZE]>) {
        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);

        aes_key.copy_from_slice(&expanded_keys[0..KEY_SIZE]);
        mac_key.copy_from_slice(&expanded_keys[KEY_SIZE..KEY_SIZE * 2]);

        (aes_key, mac_key)
    }

    /// Generate a new, random initialization vector.
    fn generate_iv() -> [u8; IV_SIZE] {
        let mut rng = thread_rng();
        let mut iv = [0u8; IV_SIZE];

        rng.fill_bytes(&mut iv);

        Self::clamp_iv(iv)
    }

    /// Bit 63 of the IV is cleared so the 64 bit counter never overflows into
    /// the nonce half, whichever way an implementation splits the block.
    fn clamp_iv(iv: [u8; IV_SIZE]) -> [u8; IV_SIZE] {
        let mut iv = u128::from_be_bytes(iv);
        iv &= !(1 << 63);
        iv.to_be_bytes()
    }

    fn aes_key(&self) -> &Aes256Key {
        Aes256Key::from_slice(self.aes_key.as_slice())
    }

    fn mac_key(&self) -> &HmacSha256Key {
        &self.mac_key
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encryption_roundtrip() {
        let plaintext = "It's a secret to everybody";

        let salt = [0u8; SALT_SIZE];
        let key = AesHmacSha2Key::from_passphrase("My passphrase", 10, &salt);

        let (ciphertext, iv) = key.encrypt(plaintext.as_bytes().to_vec());
        let mac = key.create_mac_tag(&ciphertext);

        key.verify_mac(&ciphertext, mac.as_bytes())
            .expect("The MAC tag should be successfully verified");
        let decrypted = key.decrypt(ciphertext, &iv);

        assert_eq!(
            plaintext.as_bytes(),
            decrypted,
            "An encryption roundtrip should produce the same plaintext"
        );
    }

    #[test]
    fn backup_key_derivation_is_deterministic() {
        let secret = [7u8; 32];

        let (first, first_iv) = AesHmacSha2Key::from_backup_shared_secret(&secret);
        let (second, second_iv) = AesHmacSha2Key::from_backup_shared_secret(&secret);

        assert_eq!(first_iv, second_iv);

        let ciphertext = first.encrypt_with_iv(b"room key".to_vec(), &first_iv);
        let mac = first.create_mac_tag(&ciphertext);

        second.verify_mac(&ciphertext, mac.as_bytes()).unwrap();
        assert_eq!(second.decrypt(ciphertext, &second_iv), b"room key");

        let (other, _) = AesHmacSha2Key::from_backup_shared_secret(&[8u8; 32]);
        assert!(other.verify_mac(b"room key", mac.as_bytes()).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_the_mac() {
        let key = AesHmacSha2Key::from_passphrase("passphrase", 10, &[1u8; SALT_SIZE]);
        let (mut ciphertext, _) = key.encrypt(b"payload".to_vec());
        let mac = key.create_mac_tag(&ciphertext);

        ciphertext[0] ^= 1;

        assert!(key.verify_mac(&ciphertext, mac.as_bytes()).is_err());
    }

    #[test]
    fn truncated_macs_are_verified() {
        let (key, iv) = AesHmacSha2Key::from_backup_shared_secret(&[5u8; 32]);
        let ciphertext = key.encrypt_with_iv(b"room key".to_vec(), &iv);
        let mac = key.create_mac_tag(&ciphertext);

        let truncated = &mac.as_bytes()[..TRUNCATED_MAC_SIZE];
        key.verify_truncated_mac(&ciphertext, truncated).unwrap();

        let mut tampered = truncated.to_vec();
        tampered[0] ^= 1;
        assert!(key.verify_truncated_mac(&ciphertext, &tampered).is_err());
    }

    #[test]
    fn generated_ivs_are_clamped() {
        for _ in 0..32 {
            let iv = AesHmacSha2Key::generate_iv();
            assert_eq!(u128::from_be_bytes(iv) & (1 << 63), 0);
        }
    }

    proptest! {
        #[test]
        fn arbitrary_plaintexts_roundtrip(
            plaintext in proptest::collection::vec(any::<u8>(), 0..512)
        ) {
            let (key, iv) = AesHmacSha2Key::from_backup_shared_secret(&[3u8; 32]);

            let ciphertext = key.encrypt_with_iv(plaintext.clone(), &iv);
            let mac = key.create_mac_tag(&ciphertext);

            prop_assert!(key.verify_mac(&ciphertext, mac.as_bytes()).is_ok());
            prop_assert_eq!(key.decrypt(ciphertext, &iv), plaintext);
        }
    }
}
