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

//! Requesting missing room keys from other devices and answering such
//! requests.

mod machine;

use std::collections::{BTreeMap, BTreeSet};

pub use machine::GossipMachine;
use ruma::{DeviceId, OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId};
use serde::{Deserialize, Serialize};

use crate::types::{
    events::{KeyRequestAction, RequestedKeyInfo, RoomKeyRequestContent, ROOM_KEY_REQUEST},
    requests::ToDeviceRequest,
};

/// The lifecycle of an outgoing key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRequestState {
    /// The request was created but not yet sent out.
    Idle,
    /// The request was sent and we're waiting for a forwarded key.
    Requested,
    /// The key that came back couldn't be accepted.
    Declined,
    /// The request was cancelled before anyone answered it.
    TimedOut,
    /// We received the requested key.
    Fulfilled,
}

impl KeyRequestState {
    /// Does the request still occupy the request slot of its session.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, KeyRequestState::Idle | KeyRequestState::Requested)
    }
}

/// An error describing why a key share request won't be honored.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeyForwardDecision {
    /// Room keys are only forwarded to our own devices.
    #[error("the requesting device belongs to another user")]
    NotOwnDevice,
    /// The key request is from a device we own, yet we don't trust it.
    #[error("requesting device isn't trusted")]
    UntrustedDevice,
    /// The room doesn't let new devices read its history.
    #[error("the history visibility of the room doesn't allow sharing the key")]
    HistoryNotShared,
    /// The requested session belongs to a different room.
    #[error("the requested session belongs to another room")]
    MismatchedRoom,
}

/// A struct describing an outgoing key request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipRequest {
    /// The unique id of the key request.
    pub request_id: OwnedTransactionId,
    /// The room key we're asking for.
    pub info: RequestedKeyInfo,
    /// The devices the request is sent to.
    pub recipients: BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>,
    /// Where the request is in its lifecycle.
    pub state: KeyRequestState,
}

impl GossipRequest {
    fn new(
        info: RequestedKeyInfo,
        recipients: BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>,
    ) -> Self {
        Self { request_id: TransactionId::new(), info, recipients, state: KeyRequestState::Idle }
    }

    fn to_device_request(&self, content: &RoomKeyRequestContent) -> ToDeviceRequest {
        let content =
            serde_json::to_value(content).expect("We can always serialize a room key request");
        let mut request = ToDeviceRequest::new(ROOM_KEY_REQUEST);

        for (user_id, devices) in &self.recipients {
            for device_id in devices {
                request.add_message(user_id, device_id.clone(), content.clone());
            }
        }

        request
    }

    /// The `m.room_key_request` messages, the transaction id of the
    /// to-device request is the request id.
    fn to_request(&self, own_device_id: &DeviceId) -> ToDeviceRequest {
        let content = RoomKeyRequestContent {
            action: KeyRequestAction::Request,
            body: Some(self.info.clone()),
            request_id: self.request_id.clone(),
            requesting_device_id: own_device_id.to_owned(),
        };

        let mut request = self.to_device_request(&content);
        request.txn_id = self.request_id.clone();

        request
    }

    fn to_cancellation(&self, own_device_id: &DeviceId) -> ToDeviceRequest {
        let content = RoomKeyRequestContent {
            action: KeyRequestAction::RequestCancellation,
            body: None,
            request_id: self.request_id.clone(),
            requesting_device_id: own_device_id.to_owned(),
        };

        self.to_device_request(&content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct RequestInfo {
    sender: OwnedUserId,
    requesting_device_id: OwnedDeviceId,
    request_id: OwnedTransactionId,
}

impl RequestInfo {
    fn new(
        sender: OwnedUserId,
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self { sender, requesting_device_id, request_id }
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id, user_id};
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};

    use super::*;
    use crate::types::EventEncryptionAlgorithm;

    fn request() -> GossipRequest {
        let info = RequestedKeyInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id!("!test:localhost").to_owned(),
            sender_key: Curve25519PublicKey::from(&Curve25519SecretKey::new()),
            session_id: "SESSION".to_owned(),
        };
        let recipients = BTreeMap::from([(
            user_id!("@alice:localhost").to_owned(),
            BTreeSet::from([device_id!("A").to_owned(), device_id!("B").to_owned()]),
        )]);

        GossipRequest::new(info, recipients)
    }

    #[test]
    fn requests_are_sent_to_every_recipient() {
        let gossip_request = request();
        let request = gossip_request.to_request(device_id!("OWN"));

        assert_eq!(request.txn_id, gossip_request.request_id);
        assert_eq!(request.event_type, ROOM_KEY_REQUEST);
        assert_eq!(request.message_count(), 2);

        let content = &request.messages[user_id!("@alice:localhost")][device_id!("A")];
        let content: RoomKeyRequestContent = serde_json::from_value(content.clone()).unwrap();

        assert_eq!(content.action, KeyRequestAction::Request);
        assert_eq!(content.body, Some(gossip_request.info.clone()));
        assert_eq!(content.requesting_device_id.as_str(), "OWN");
    }

    #[test]
    fn cancellations_reuse_the_request_id() {
        let gossip_request = request();
        let cancellation = gossip_request.to_cancellation(device_id!("OWN"));

        assert_ne!(cancellation.txn_id, gossip_request.request_id);

        let content = &cancellation.messages[user_id!("@alice:localhost")][device_id!("B")];
        let content: RoomKeyRequestContent = serde_json::from_value(content.clone()).unwrap();

        assert_eq!(content.action, KeyRequestAction::RequestCancellation);
        assert_eq!(content.request_id, gossip_request.request_id);
        assert!(content.body.is_none());
    }

    #[test]
    fn only_fresh_and_sent_requests_are_outstanding() {
        assert!(KeyRequestState::Idle.is_outstanding());
        assert!(KeyRequestState::Requested.is_outstanding());
        assert!(!KeyRequestState::Declined.is_outstanding());
        assert!(!KeyRequestState::TimedOut.is_outstanding());
        assert!(!KeyRequestState::Fulfilled.is_outstanding());
    }
}
