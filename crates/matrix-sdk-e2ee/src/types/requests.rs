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

//! Requests the engine produces and responses it consumes, in the shape of
//! the corresponding client-server API bodies.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CrossSigningKey, DeviceKeys, SignedKey};

/// Customized version of the `/sendToDevice` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// Type of event being sent to each device.
    pub event_type: String,

    /// A request identifier unique to the access token used to send the
    /// request.
    pub txn_id: OwnedTransactionId,

    /// A map of users to devices to a content for a message event to be sent
    /// to the user's device. Individual message events can be sent to devices,
    /// but all events must be of the same type. The device id `*` targets all
    /// of the user's devices.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
}

impl ToDeviceRequest {
    /// Create a new owned to-device request with a fresh transaction id.
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_owned(),
            txn_id: TransactionId::new(),
            messages: BTreeMap::new(),
        }
    }

    /// Add a message for the given device.
    pub fn add_message(&mut self, user_id: &UserId, device_id: OwnedDeviceId, content: Value) {
        self.messages.entry(user_id.to_owned()).or_default().insert(device_id, content);
    }

    /// Gets the total number of messages in the request.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|d| d.len()).sum()
    }

    /// Is the request empty.
    pub fn is_empty(&self) -> bool {
        self.message_count() == 0
    }
}

/// The body of a `/keys/upload` request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// The identity keys of our device, only uploaded once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,

    /// Signed one-time keys, keyed by `signed_curve25519:<key id>`.
    #[serde(default)]
    pub one_time_keys: BTreeMap<String, SignedKey>,
}

/// The body of a `/keys/query` response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// The device keys of the queried users.
    #[serde(default)]
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,

    /// The master keys of the queried users.
    #[serde(default)]
    pub master_keys: BTreeMap<OwnedUserId, CrossSigningKey>,

    /// The self-signing keys of the queried users.
    #[serde(default)]
    pub self_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,

    /// The user-signing keys, only returned for our own user.
    #[serde(default)]
    pub user_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
}

/// The body of a `/keys/claim` response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// One-time keys for the queried devices.
    #[serde(default)]
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<String, SignedKey>>>,
}

/// The body of a `/keys/device_signing/upload` request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UploadSigningKeysRequest {
    /// The user's master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<CrossSigningKey>,

    /// The user's self-signing key, signed by the master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signing_key: Option<CrossSigningKey>,

    /// The user's user-signing key, signed by the master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_signing_key: Option<CrossSigningKey>,
}

/// The body of a `/keys/signatures/upload` request.
///
/// A map from the user id to a map of key ids, a device id or the base64
/// encoded public master key, to the signed key object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SignatureUploadRequest {
    /// The signed keys.
    pub signed_keys: BTreeMap<OwnedUserId, BTreeMap<String, Value>>,
}

impl SignatureUploadRequest {
    /// Add a signed key object to the request.
    pub fn add(&mut self, user_id: &UserId, key_id: String, signed_key: Value) {
        self.signed_keys.entry(user_id.to_owned()).or_default().insert(key_id, signed_key);
    }

    /// Is there anything to upload.
    pub fn is_empty(&self) -> bool {
        self.signed_keys.values().all(|k| k.is_empty())
    }
}
