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

//! Passphrase protected room key exports, in the format other Matrix clients
//! read and write.

use std::collections::BTreeMap;

use rand::{thread_rng, RngCore};
use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::{base64_decode, base64_encode, Curve25519PublicKey};
use zeroize::Zeroizing;

use crate::{
    ciphers::{AesHmacSha2Key, IV_SIZE, MAC_SIZE, SALT_SIZE},
    error::SessionCreationError,
    olm::InboundGroupSession,
    types::{backup::BackedUpRoomKey, serde_curve_key, EventEncryptionAlgorithm},
};

const VERSION: u8 = 1;
const HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";
const FOOTER: &str = "-----END MEGOLM SESSION DATA-----";
const LINE_LENGTH: usize = 96;
const ROUNDS_SIZE: usize = 4;
const HEADER_SIZE: usize = 1 + SALT_SIZE + IV_SIZE + ROUNDS_SIZE;

/// The PBKDF2 round count other clients use for their exports.
pub const DEFAULT_EXPORT_ROUNDS: u32 = 500_000;

/// Error type for the decryption of a room key export.
#[derive(Error, Debug)]
pub enum KeyExportError {
    /// The export is missing its header or footer line.
    #[error("the key export doesn't contain valid headers")]
    InvalidHeaders,
    /// The export was created by a newer version of the format.
    #[error("the key export has an unsupported version {0}")]
    UnsupportedVersion(u8),
    /// The export is shorter than its fixed size parts.
    #[error("the key export is too short")]
    TooShort,
    /// Exports can't be protected by an empty passphrase.
    #[error("the passphrase of a key export can't be empty")]
    EmptyPassphrase,
    /// The MAC didn't match, the passphrase is most likely wrong.
    #[error("the MAC of the key export didn't match, wrong passphrase?")]
    InvalidMac,
    /// The export isn't valid base64.
    #[error(transparent)]
    Decode(#[from] vodozemac::Base64DecodeError),
    /// The decrypted export isn't a list of room keys.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The outcome of a room key import.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// How many room keys the export contained.
    pub total: usize,
    /// How many of them were new or better than the ones we had.
    pub imported: usize,
}

/// A room key in the exported form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room where the session is used.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device which initiated the session
    /// originally.
    #[serde(with = "serde_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The id of the session.
    pub session_id: String,
    /// The base64 encoded session key, exported at its first known index.
    pub session_key: String,
    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Chain of Curve25519 keys through which this session was forwarded.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl ExportedRoomKey {
    /// Export the given session at its first known index.
    pub async fn from_session(session: &InboundGroupSession) -> Self {
        let BackedUpRoomKey {
            algorithm,
            sender_key,
            session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain,
        } = session.to_backup().await;

        Self {
            algorithm,
            room_id: session.room_id().to_owned(),
            sender_key,
            session_id: session.session_id().to_owned(),
            session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain,
        }
    }

    /// Turn the exported key back into a session, marked as imported.
    pub fn to_session(&self) -> Result<InboundGroupSession, SessionCreationError> {
        let key = BackedUpRoomKey {
            algorithm: self.algorithm.clone(),
            sender_key: self.sender_key,
            session_key: self.session_key.clone(),
            sender_claimed_keys: self.sender_claimed_keys.clone(),
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain.clone(),
        };

        InboundGroupSession::from_backup(&self.room_id, &self.session_id, &key)
    }
}

/// Encrypt the room keys with a passphrase and wrap them in the armored
/// export format.
///
/// The keys of the AES-CTR-256 cipher and HMAC-SHA-256 MAC are expanded from
/// the passphrase with PBKDF2-SHA-512 and the given number of rounds.
pub fn encrypt_room_key_export(
    keys: &[ExportedRoomKey],
    passphrase: &str,
    rounds: u32,
) -> Result<String, KeyExportError> {
    if passphrase.is_empty() {
        return Err(KeyExportError::EmptyPassphrase);
    }

    let plaintext = Zeroizing::new(serde_json::to_vec(keys)?);

    let mut salt = [0u8; SALT_SIZE];
    thread_rng().fill_bytes(&mut salt);

    let key = AesHmacSha2Key::from_passphrase(passphrase, rounds, &salt);
    let (ciphertext, iv) = key.encrypt(plaintext.to_vec());

    let mut body = Vec::with_capacity(HEADER_SIZE + ciphertext.len() + MAC_SIZE);
    body.push(VERSION);
    body.extend_from_slice(&salt);
    body.extend_from_slice(&iv);
    body.extend_from_slice(&rounds.to_be_bytes());
    body.extend_from_slice(&ciphertext);

    let mac = key.create_mac_tag(&body);
    body.extend_from_slice(mac.as_bytes());

    Ok(armor(&body))
}

/// Decrypt an armored room key export with the passphrase it was created
/// with.
pub fn decrypt_room_key_export(
    export: &str,
    passphrase: &str,
) -> Result<Vec<ExportedRoomKey>, KeyExportError> {
    if passphrase.is_empty() {
        return Err(KeyExportError::EmptyPassphrase);
    }

    let body = unarmor(export)?;

    if body.len() < HEADER_SIZE + MAC_SIZE {
        return Err(KeyExportError::TooShort);
    }

    if body[0] != VERSION {
        return Err(KeyExportError::UnsupportedVersion(body[0]));
    }

    let (signed, mac) = body.split_at(body.len() - MAC_SIZE);

    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&signed[1..1 + SALT_SIZE]);

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&signed[1 + SALT_SIZE..1 + SALT_SIZE + IV_SIZE]);

    let mut rounds = [0u8; ROUNDS_SIZE];
    rounds.copy_from_slice(&signed[1 + SALT_SIZE + IV_SIZE..HEADER_SIZE]);
    let rounds = u32::from_be_bytes(rounds);

    let mut tag = [0u8; MAC_SIZE];
    tag.copy_from_slice(mac);

    let key = AesHmacSha2Key::from_passphrase(passphrase, rounds, &salt);
    key.verify_mac(signed, &tag).map_err(|_| KeyExportError::InvalidMac)?;

    let plaintext = Zeroizing::new(key.decrypt(signed[HEADER_SIZE..].to_vec(), &iv));

    Ok(serde_json::from_slice(&plaintext)?)
}

fn armor(body: &[u8]) -> String {
    let encoded = base64_encode(body);
    let mut armored = String::with_capacity(encoded.len() + HEADER.len() + FOOTER.len() + 64);

    armored.push_str(HEADER);
    armored.push('\n');

    let mut rest = encoded.as_str();

    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(LINE_LENGTH));
        armored.push_str(line);
        armored.push('\n');
        rest = tail;
    }

    armored.push_str(FOOTER);
    armored
}

fn unarmor(export: &str) -> Result<Vec<u8>, KeyExportError> {
    let mut lines = export.lines().map(str::trim).skip_while(|l| *l != HEADER);

    if lines.next().is_none() {
        return Err(KeyExportError::InvalidHeaders);
    }

    let mut encoded = String::new();

    for line in lines {
        if line == FOOTER {
            return Ok(base64_decode(encoded.trim_end_matches('='))?);
        }

        encoded.push_str(line);
    }

    Err(KeyExportError::InvalidHeaders)
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, room_id, user_id};

    use super::*;
    use crate::olm::Account;

    async fn exported_key() -> ExportedRoomKey {
        let account =
            Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let (_, inbound) = account
            .static_data()
            .create_group_session_pair(room_id!("!test:localhost"), Default::default())
            .await
            .unwrap();

        ExportedRoomKey::from_session(&inbound).await
    }

    #[tokio::test]
    async fn exports_round_trip_with_the_right_passphrase() {
        let key = exported_key().await;
        let export = encrypt_room_key_export(&[key.clone()], "1234", 10).unwrap();

        assert!(export.starts_with(HEADER));
        assert!(export.ends_with(FOOTER));
        assert!(export.lines().all(|l| l.len() <= LINE_LENGTH));

        let decrypted = decrypt_room_key_export(&export, "1234").unwrap();
        assert_eq!(decrypted.len(), 1);
        assert_eq!(decrypted[0].session_id, key.session_id);
        assert_eq!(decrypted[0].session_key, key.session_key);

        let session = decrypted[0].to_session().unwrap();
        assert_eq!(session.session_id(), key.session_id);
        assert_eq!(session.room_id(), room_id!("!test:localhost"));
    }

    #[tokio::test]
    async fn wrong_passphrases_fail_the_mac() {
        let export = encrypt_room_key_export(&[exported_key().await], "1234", 10).unwrap();

        assert_matches!(decrypt_room_key_export(&export, "4321"), Err(KeyExportError::InvalidMac));
        assert_matches!(
            decrypt_room_key_export(&export, ""),
            Err(KeyExportError::EmptyPassphrase)
        );
    }

    #[test]
    fn malformed_exports_are_rejected() {
        assert_matches!(
            decrypt_room_key_export("no headers here", "1234"),
            Err(KeyExportError::InvalidHeaders)
        );

        let missing_footer = format!("{HEADER}\nAQID\n");
        assert_matches!(
            decrypt_room_key_export(&missing_footer, "1234"),
            Err(KeyExportError::InvalidHeaders)
        );

        let short = armor(&[VERSION, 1, 2, 3]);
        assert_matches!(decrypt_room_key_export(&short, "1234"), Err(KeyExportError::TooShort));

        let mut body = vec![2u8];
        body.resize(HEADER_SIZE + MAC_SIZE, 0);
        assert_matches!(
            decrypt_room_key_export(&armor(&body), "1234"),
            Err(KeyExportError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn surrounding_text_and_padding_are_ignored() {
        let export = encrypt_room_key_export(&[], "passphrase", 10).unwrap();
        let padded = export.replace(FOOTER, &format!("==\n{FOOTER}"));
        let wrapped = format!("Some preamble\n  {padded}  \ntrailing text");

        assert!(decrypt_room_key_export(&wrapped, "passphrase").unwrap().is_empty());
    }
}
