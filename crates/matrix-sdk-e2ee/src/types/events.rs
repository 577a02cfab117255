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

//! Event content types for the to-device and room events the engine
//! consumes and produces.

use std::{collections::BTreeMap, fmt};

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{olm::OlmMessage, Curve25519PublicKey, Ed25519PublicKey};

use super::{serde_curve_key, serde_ed25519_key, EventEncryptionAlgorithm};
use crate::error::EventError;

/// The event type of encrypted events.
pub const ROOM_ENCRYPTED: &str = "m.room.encrypted";
/// The event type of room key distribution messages.
pub const ROOM_KEY: &str = "m.room_key";
/// The event type of room key requests.
pub const ROOM_KEY_REQUEST: &str = "m.room_key_request";
/// The event type of forwarded room keys.
pub const FORWARDED_ROOM_KEY: &str = "m.forwarded_room_key";
/// The event type of notices that a room key won't be sent.
pub const ROOM_KEY_WITHHELD: &str = "m.room_key.withheld";

/// A to-device event as handed to us by the sync loop.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToDeviceEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,

    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The content of the event.
    pub content: Value,
}

/// An encrypted room event as handed to us by the sync loop.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EncryptedRoomEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,

    /// The unique id of the event, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// The `m.room.encrypted` content.
    pub content: Value,
}

/// The content of an `m.room.encrypted` event.
///
/// The set of algorithms is closed, unknown algorithms deserialize into
/// [`EncryptedContent::Unknown`] so callers handle every case explicitly.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "algorithm")]
pub enum EncryptedContent {
    /// Olm encrypted to-device content.
    #[serde(rename = "m.olm.v1.curve25519-aes-sha2")]
    OlmV1(OlmV1Content),
    /// Megolm encrypted room content.
    #[serde(rename = "m.megolm.v1.aes-sha2")]
    MegolmV1(MegolmV1Content),
    /// Content encrypted with an algorithm we don't support.
    #[serde(other)]
    Unknown,
}

impl EncryptedContent {
    /// Parse the content of an `m.room.encrypted` event.
    pub fn from_json(content: &Value) -> Result<Self, EventError> {
        if !content.is_object() {
            return Err(EventError::NotAnObject);
        }

        Ok(serde_json::from_value(content.clone())?)
    }

    /// Serialize the content into a JSON value.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// A single Olm ciphertext, keyed by the recipient's Curve25519 key.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OlmCiphertext {
    /// The Olm message type, 0 for pre-key and 1 for normal messages.
    #[serde(rename = "type")]
    pub message_type: usize,

    /// The base64 encoded ciphertext.
    pub body: String,
}

impl From<OlmMessage> for OlmCiphertext {
    fn from(message: OlmMessage) -> Self {
        let (message_type, body) = message.to_parts();
        Self { message_type, body }
    }
}

impl TryFrom<&OlmCiphertext> for OlmMessage {
    type Error = EventError;

    fn try_from(value: &OlmCiphertext) -> Result<Self, Self::Error> {
        OlmMessage::from_parts(value.message_type, &value.body)
            .map_err(|_| EventError::MalformedCiphertext)
    }
}

/// The content of an Olm encrypted `m.room.encrypted` to-device event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OlmV1Content {
    /// The Curve25519 key of the sender.
    #[serde(with = "serde_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The ciphertexts, keyed by the recipient's Curve25519 key.
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

/// The content of a Megolm encrypted `m.room.encrypted` room event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MegolmV1Content {
    /// The Curve25519 key of the sender.
    #[serde(with = "serde_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The id of the Megolm session used to encrypt the event.
    pub session_id: String,

    /// The base64 encoded Megolm message.
    pub ciphertext: String,

    /// The id of the device that sent the event.
    pub device_id: OwnedDeviceId,
}

/// The `keys` object of a decrypted Olm payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OlmPayloadKeys {
    /// The Ed25519 key of the device.
    #[serde(with = "serde_ed25519_key")]
    pub ed25519: Ed25519PublicKey,
}

/// The plaintext of an Olm encrypted to-device event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DecryptedOlmPayload {
    /// The user that sent the event.
    pub sender: OwnedUserId,

    /// The device that sent the event.
    pub sender_device: OwnedDeviceId,

    /// The signing key of the sending device.
    pub keys: OlmPayloadKeys,

    /// The user the event is meant for.
    pub recipient: OwnedUserId,

    /// The signing key of the device the event is meant for.
    pub recipient_keys: OlmPayloadKeys,

    /// The type of the inner event.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The content of the inner event.
    pub content: Value,
}

/// The content of an `m.room_key` to-device event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomKeyContent {
    /// The encryption algorithm the key is meant for.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room the key is meant for.
    pub room_id: OwnedRoomId,

    /// The id of the Megolm session.
    pub session_id: String,

    /// The base64 encoded Megolm session key.
    pub session_key: String,
}

/// The content of an `m.forwarded_room_key` to-device event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ForwardedRoomKeyContent {
    /// The encryption algorithm the key is meant for.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room the key is meant for.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device that created the session.
    #[serde(with = "serde_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The id of the Megolm session.
    pub session_id: String,

    /// The base64 encoded exported Megolm session key.
    pub session_key: String,

    /// The Ed25519 key the session creator claimed to own.
    #[serde(with = "serde_ed25519_key")]
    pub sender_claimed_ed25519_key: Ed25519PublicKey,

    /// The Curve25519 keys of the devices that forwarded this key, oldest
    /// first.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// The action of a key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRequestAction {
    /// A new request.
    Request,
    /// Cancel a previous request.
    RequestCancellation,
}

/// The room key a key request is asking for.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RequestedKeyInfo {
    /// The encryption algorithm of the requested key.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room of the requested key.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device that created the session.
    #[serde(with = "serde_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The id of the requested session.
    pub session_id: String,
}

/// The content of an `m.room_key_request` to-device event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomKeyRequestContent {
    /// Is this a request or a cancellation.
    pub action: KeyRequestAction,

    /// The requested key, only present for requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,

    /// The unique id of the request.
    pub request_id: OwnedTransactionId,

    /// The device that is requesting the key.
    pub requesting_device_id: OwnedDeviceId,
}

/// A machine-readable code for why a room key was not sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum WithheldCode {
    /// The user or device was blacklisted.
    #[serde(rename = "m.blacklisted")]
    Blacklisted,

    /// The device is unverified and the room only shares keys with verified
    /// devices.
    #[serde(rename = "m.unverified")]
    Unverified,

    /// The device is not allowed to have the key, usually sent in response to
    /// a key request.
    #[serde(rename = "m.unauthorised")]
    Unauthorised,

    /// The requested key was not found.
    #[serde(rename = "m.unavailable")]
    Unavailable,

    /// An Olm session could not be established.
    #[serde(rename = "m.no_olm")]
    NoOlm,
}

impl fmt::Display for WithheldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            WithheldCode::Blacklisted => "The sender has blocked you.",
            WithheldCode::Unverified => "The sender has disabled encrypting to unverified devices.",
            WithheldCode::Unauthorised => "You are not authorised to read the message.",
            WithheldCode::Unavailable => "The requested key was not found.",
            WithheldCode::NoOlm => "Unable to establish a secure channel.",
        };

        f.write_str(string)
    }
}

/// The content of an `m.room_key.withheld` to-device event.
///
/// Sent in the clear to devices that won't receive the room key of a session,
/// so they can tell their user why a message can't be decrypted.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoomKeyWithheldContent {
    /// The encryption algorithm of the withheld key.
    pub algorithm: EventEncryptionAlgorithm,

    /// Why the key was withheld.
    pub code: WithheldCode,

    /// A human readable version of the code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// The room of the withheld session, absent for `m.no_olm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,

    /// The id of the withheld session, absent for `m.no_olm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// The Curve25519 key of the device that withholds the key.
    #[serde(with = "serde_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The device that withholds the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_device: Option<OwnedDeviceId>,
}

/// The plaintext of a Megolm encrypted room event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MegolmPayload {
    /// The type of the inner event.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The content of the inner event.
    pub content: Value,

    /// The room the event was sent to.
    pub room_id: OwnedRoomId,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use serde_json::json;
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};

    use super::*;

    #[test]
    fn encrypted_content_dispatches_on_algorithm() {
        let sender_key = Curve25519PublicKey::from(&Curve25519SecretKey::new());

        let megolm = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "sender_key": sender_key.to_base64(),
            "session_id": "SESSIONID",
            "ciphertext": "AwgAEhAA",
            "device_id": "BOBDEVICE",
        });

        let content = EncryptedContent::from_json(&megolm).unwrap();
        assert_matches!(content, EncryptedContent::MegolmV1(c));
        assert_eq!(c.session_id, "SESSIONID");

        let unknown = json!({ "algorithm": "m.megolm.v2.aes-sha2", "ciphertext": "foo" });
        assert_matches!(EncryptedContent::from_json(&unknown).unwrap(), EncryptedContent::Unknown);

        assert_matches!(EncryptedContent::from_json(&json!("foo")), Err(EventError::NotAnObject));
    }

    #[test]
    fn withheld_content_without_a_session() {
        let sender_key = Curve25519PublicKey::from(&Curve25519SecretKey::new());
        let content = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "code": "m.no_olm",
            "reason": "Unable to establish a secure channel.",
            "sender_key": sender_key.to_base64(),
            "from_device": "ALICEDEVICE",
        });

        let withheld: RoomKeyWithheldContent = serde_json::from_value(content.clone()).unwrap();

        assert_eq!(withheld.code, WithheldCode::NoOlm);
        assert!(withheld.session_id.is_none());
        assert_eq!(withheld.reason.as_deref(), Some(withheld.code.to_string().as_str()));
        similar_asserts::assert_eq!(serde_json::to_value(&withheld).unwrap(), content);

        let unknown = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "code": "m.something_else",
            "sender_key": sender_key.to_base64(),
        });
        assert!(serde_json::from_value::<RoomKeyWithheldContent>(unknown).is_err());
    }

    #[test]
    fn key_request_cancellation_has_no_body() {
        let content = json!({
            "action": "request_cancellation",
            "request_id": "1495474790150.19",
            "requesting_device_id": "RJYKSTBOIE",
        });

        let request: RoomKeyRequestContent = serde_json::from_value(content.clone()).unwrap();

        assert_eq!(request.action, KeyRequestAction::RequestCancellation);
        assert!(request.body.is_none());
        similar_asserts::assert_eq!(serde_json::to_value(&request).unwrap(), content);
    }
}
