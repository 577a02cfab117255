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

use ruma::{CanonicalJsonError, OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    store::CryptoStoreError,
    transport::TransportError,
    types::{EventEncryptionAlgorithm, KeyUsage},
};

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The received room key couldn't be converted into a valid Megolm session.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// A request to the homeserver failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A signature couldn't be created or checked.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The Olm message couldn't be decrypted with the session it was meant
    /// for.
    #[error(transparent)]
    Decryption(#[from] vodozemac::olm::DecryptionError),

    /// Encryption failed because the device does not have a valid Olm session
    /// with us and no usable one-time key could be claimed.
    #[error("no Olm session is available for the device {1} of user {0}")]
    NoOlmSessionAvailable(OwnedUserId, OwnedDeviceId),

    /// A normal Olm message arrived that none of our sessions can decrypt.
    #[error("no Olm session from {0} with sender key {1} can decrypt the message")]
    UnknownOlmSession(OwnedUserId, Curve25519PublicKey),

    /// We don't know anything about the given device.
    #[error("the device {1} of user {0} is unknown")]
    UnknownDevice(OwnedUserId, OwnedDeviceId),

    /// There is no outbound group session for the given room.
    #[error("no outbound group session exists for the room {0}")]
    MissingOutboundSession(OwnedRoomId),

    /// The engine has been shut down.
    #[error("the encryption engine has been shut down")]
    Closed,
}

impl OlmError {
    /// Can the operation succeed if it's retried later on.
    pub fn is_retryable(&self) -> bool {
        match self {
            OlmError::NoOlmSessionAvailable(..) => true,
            OlmError::Transport(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Is this an error that signals a possible attack.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            OlmError::Signature(_)
                | OlmError::EventError(
                    EventError::MismatchedSender(..)
                        | EventError::MismatchedKeys(..)
                        | EventError::MismatchedRecipient(..)
                )
        )
    }
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the event. A key request has been queued.
    #[error("can't find the room key {session_id} from {sender_key} in room {room_id}")]
    UnknownInboundSessionId {
        /// The room the event was sent to.
        room_id: OwnedRoomId,
        /// The Curve25519 key the event claims to be sent from.
        sender_key: Curve25519PublicKey,
        /// The id of the missing session.
        session_id: String,
    },

    /// The message index was already used to decrypt a different ciphertext.
    #[error("the message index {index} of session {session_id} was replayed")]
    MegolmReplayAttack {
        /// The id of the session.
        session_id: String,
        /// The reused message index.
        index: u32,
    },

    /// The sender key the event claims doesn't match the provenance of the
    /// session it was encrypted with.
    #[error(
        "the claimed sender key {claimed_sender_key} doesn't match the provenance of the \
         session {session_id}"
    )]
    MismatchedSender {
        /// The id of the session.
        session_id: String,
        /// The sender key the event claims.
        claimed_sender_key: Curve25519PublicKey,
    },

    /// Two sessions share an id but not a ratchet.
    #[error("the session {0} shares its id with a stored but unrelated session")]
    MismatchedSessions(String),

    /// The outbound group session can't be used anymore and needs to be
    /// rotated.
    #[error("the outbound group session for room {0} has expired")]
    SessionExpired(OwnedRoomId),

    /// There is no outbound group session for the given room.
    #[error("no outbound group session exists for the room {0}")]
    MissingOutboundSession(OwnedRoomId),

    /// The encrypted megolm message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// The event could not have been decrypted.
    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The engine has been shut down.
    #[error("the encryption engine has been shut down")]
    Closed,
}

impl MegolmError {
    /// Is the failure caused by a missing room key that could arrive later.
    ///
    /// This includes sessions we know, but only from a later message index.
    pub fn is_pending_key(&self) -> bool {
        matches!(
            self,
            MegolmError::UnknownInboundSessionId { .. }
                | MegolmError::Decryption(
                    vodozemac::megolm::DecryptionError::UnknownMessageIndex(..)
                )
        )
    }

    /// Is this an error that signals a possible attack.
    ///
    /// These are never retried and are always reported.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            MegolmError::MegolmReplayAttack { .. }
                | MegolmError::MismatchedSender { .. }
                | MegolmError::MismatchedSessions(_)
                | MegolmError::EventError(EventError::MismatchedRoom(..))
        )
    }
}

/// Error that occurs when decrypting an event that is malformed.
#[derive(Error, Debug)]
pub enum EventError {
    /// The Encrypted message has been encrypted with a unsupported algorithm.
    #[error("the Encrypted message has been encrypted with a unsupported algorithm.")]
    UnsupportedAlgorithm,

    /// The provided JSON value isn't an object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The event content couldn't be deserialized.
    #[error("the event content is malformed: {0}")]
    Json(#[from] SerdeError),

    /// The encrypted message is missing a signing key of the sender.
    #[error("the encrypted message is missing a signing key of the sender")]
    MissingSigningKey,

    /// The Encrypted message doesn't contain a ciphertext for our device.
    #[error("the Encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    /// The ciphertext couldn't be decoded into an Olm message.
    #[error("the ciphertext of the Encrypted message couldn't be decoded")]
    MalformedCiphertext,

    /// The sender of the plaintext doesn't match the sender of the encrypted
    /// message.
    #[error(
        "the sender of the plaintext doesn't match the sender of the encrypted \
        message, got {0}, expected {1}"
    )]
    MismatchedSender(OwnedUserId, OwnedUserId),

    /// The plaintext was meant for another user or device.
    #[error("the decrypted event was meant for {0}, not for us")]
    MismatchedRecipient(OwnedUserId),

    /// The public key that was part of the message doesn't match the key we
    /// have stored.
    #[error(
        "the public key that was part of the message doesn't match the key we \
        have stored, expected {0}, got {1}"
    )]
    MismatchedKeys(Box<Ed25519PublicKey>, Box<Ed25519PublicKey>),

    /// The room ID of the room key doesn't match the room ID of the decrypted
    /// event.
    #[error(
        "the room id of the room key doesn't match the room id of the \
        decrypted event: expected {0}, got {1:?}"
    )]
    MismatchedRoom(OwnedRoomId, Option<OwnedRoomId>),
}

/// Error type describing different errors that happen when we check or create
/// signatures for a Matrix JSON object.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signature was made using an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The ID of the signing key isn't a valid key ID.
    #[error("the ID of the signing key is invalid")]
    InvalidKeyId,

    /// The signing key that should create or check a signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The cross-signing key isn't meant to be used for the given purpose.
    #[error("the cross-signing key doesn't have the expected usage")]
    InvalidKeyUsage,

    /// The user id of signing key differs from the user id that provided the
    /// signature.
    #[error("the user id of the signing key differs user id that provided the signature")]
    UserIdMismatch,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// The signature couldn't be verified.
    #[error(transparent)]
    VerificationError(#[from] vodozemac::SignatureError),

    /// The public key isn't a valid ed25519 key.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The signed object couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] CanonicalJsonError),

    /// The signed object couldn't be serialized.
    #[error(transparent)]
    SerializationError(#[from] SerdeError),
}

/// Error that occurs when a room key can't be converted into a valid Megolm
/// session, or an Olm session can't be established.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// The requested one-time key isn't a signed curve key.
    #[error(
        "Failed to create a new Olm session for {0} {1}, the requested \
        one-time key isn't a signed curve key"
    )]
    OneTimeKeyNotSigned(OwnedUserId, OwnedDeviceId),

    /// The signed one-time key is missing.
    #[error(
        "Tried to create a new Olm session for {0} {1}, but the signed \
        one-time key is missing"
    )]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),

    /// Failed to verify the one-time key signatures.
    #[error(
        "Failed to verify the signature of a one-time key, key: {one_time_key}, \
        signing_key: {signing_key:?}: {error:?}"
    )]
    InvalidSignature {
        /// The one-time key that failed the signature verification.
        one_time_key: String,
        /// The key that was used to verify the signature.
        signing_key: Option<Box<Ed25519PublicKey>>,
        /// The exact error describing why the signature verification failed.
        error: Box<SignatureError>,
    },

    /// The user's device is missing a curve25519 key.
    #[error(
        "Tried to create an Olm session for {0} {1}, but the device is missing \
        a curve25519 key"
    )]
    DeviceMissingCurveKey(OwnedUserId, OwnedDeviceId),

    /// The room key uses an algorithm we don't support.
    #[error("the room key uses the unsupported algorithm {0}")]
    UnsupportedAlgorithm(EventEncryptionAlgorithm),

    /// Error deserializing the one-time key.
    #[error("Error deserializing the one-time key: {0}")]
    InvalidJson(#[from] SerdeError),

    /// The given curve25519 key is not a valid key.
    #[error("The given curve25519 key is not a valid key")]
    InvalidCurveKey(#[from] vodozemac::KeyError),

    /// Error when creating an Olm Session from an incoming Olm message.
    #[error(transparent)]
    InboundCreationFailed(#[from] vodozemac::olm::SessionCreationError),

    /// The session key of a room key couldn't be decoded.
    #[error(transparent)]
    InvalidSessionKey(#[from] vodozemac::megolm::SessionKeyDecodeError),

    /// The room key didn't contain the Ed25519 key of the session creator.
    #[error("the room key is missing the Ed25519 key of the session creator")]
    MissingSenderClaimedKey,

    /// The session id the room key claims doesn't match the session key.
    #[error("the session id {claimed} doesn't match the session key, expected {actual}")]
    SessionIdMismatch {
        /// The session id the room key claimed.
        claimed: String,
        /// The session id of the session key.
        actual: String,
    },
}

/// Error type for the cross-signing operations.
#[derive(Error, Debug)]
pub enum CrossSigningError {
    /// Our cross-signing identity doesn't hold the private key that is needed
    /// for the operation.
    #[error("the private {0:?} key is missing from our cross-signing identity")]
    MissingSigningKey(KeyUsage),

    /// The object that should be signed belongs to the wrong user.
    #[error("can't sign keys of {0}, they belong to another user")]
    UserIdMismatch(OwnedUserId),

    /// The device that should be signed is unknown.
    #[error("the device {1} of user {0} is unknown")]
    UnknownDevice(OwnedUserId, OwnedDeviceId),

    /// The user whose identity should be signed doesn't have one.
    #[error("the user {0} doesn't have a cross-signing identity")]
    MissingIdentity(OwnedUserId),

    /// A signature couldn't be created or checked.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// A seed of an exported key isn't a valid key.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The homeserver request failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The engine has been shut down.
    #[error("the encryption engine has been shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use vodozemac::megolm::{GroupSession, InboundGroupSession, SessionConfig};

    use super::*;

    #[test]
    fn unknown_message_indices_are_pending_keys() {
        let mut outbound = GroupSession::new(SessionConfig::version_1());
        let first = outbound.encrypt("first");

        // The inbound session only knows the ratchet from the second message on.
        let mut inbound =
            InboundGroupSession::new(&outbound.session_key(), SessionConfig::version_1());
        let error = MegolmError::Decryption(inbound.decrypt(&first).unwrap_err());

        assert!(error.is_pending_key());
        assert!(!error.is_security_relevant());
    }
}
