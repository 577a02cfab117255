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

use std::{collections::BTreeMap, fmt, sync::Arc};

use ruma::{OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{field::debug, instrument, Span};
use vodozemac::{
    olm::{OlmMessage, PreKeyMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey, PickleError,
};

use super::StaticAccountData;
use crate::{
    error::{EventError, OlmResult},
    identities::DeviceData,
    store::PickleKey,
    types::{
        events::{EncryptedContent, OlmCiphertext, OlmV1Content},
        serde_curve_key,
    },
};

/// Cryptographic session that enables secure communication between two
/// `Account`s
#[derive(Clone)]
pub struct Session {
    /// Our own account data.
    pub(crate) our_account: StaticAccountData,
    /// The user on the other side of the session.
    pub user_id: OwnedUserId,
    /// The device on the other side of the session, unknown for sessions that
    /// were created from a pre-key message.
    pub device_id: Option<OwnedDeviceId>,
    /// The `vodozemac` session.
    pub inner: Arc<Mutex<InnerSession>>,
    /// Our sessionId
    pub session_id: Arc<str>,
    /// The Curve25519 key of the other side of the session.
    pub sender_key: Curve25519PublicKey,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("sender_key", &self.sender_key.to_base64())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        our_account: StaticAccountData,
        user_id: OwnedUserId,
        device_id: Option<OwnedDeviceId>,
        sender_key: Curve25519PublicKey,
        inner: InnerSession,
    ) -> Self {
        let now = SecondsSinceUnixEpoch::now();
        let session_id = inner.session_id();

        Self {
            our_account,
            user_id,
            device_id,
            inner: Arc::new(Mutex::new(inner)),
            session_id: session_id.into(),
            sender_key,
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Was this pre-key message created by the other side of this session.
    pub async fn matches_pre_key_message(&self, message: &PreKeyMessage) -> bool {
        self.inner.lock().await.session_keys() == message.session_keys()
    }

    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or a [`OlmError`] if decryption
    /// failed.
    ///
    /// [`OlmError`]: crate::error::OlmError
    pub async fn decrypt(&mut self, message: &OlmMessage) -> OlmResult<String> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        let plaintext =
            String::from_utf8(plaintext).map_err(|_| EventError::MalformedCiphertext)?;

        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(plaintext)
    }

    /// Encrypt the given plaintext as a OlmMessage.
    #[instrument(skip_all, fields(session))]
    pub(crate) async fn encrypt_helper(&mut self, plaintext: &str) -> OlmMessage {
        let mut session = self.inner.lock().await;

        Span::current().record("session", debug(&*session));
        let message = session.encrypt(plaintext);

        self.last_use_time = SecondsSinceUnixEpoch::now();
        message
    }

    /// Encrypt the given event content as an `m.room.encrypted` event
    /// content.
    ///
    /// # Arguments
    ///
    /// * `recipient_device` - The device for which this message is going to be
    ///   encrypted, this needs to be the device that was used to create this
    ///   session with.
    ///
    /// * `event_type` - The type of the event content.
    ///
    /// * `content` - The content of the event.
    pub async fn encrypt(
        &mut self,
        recipient_device: &DeviceData,
        event_type: &str,
        content: Value,
    ) -> OlmResult<Value> {
        let plaintext = {
            let recipient_signing_key =
                recipient_device.ed25519_key().ok_or(EventError::MissingSigningKey)?;

            let payload = json!({
                "sender": self.our_account.user_id(),
                "sender_device": self.our_account.device_id(),
                "keys": {
                    "ed25519": self.our_account.identity_keys.ed25519.to_base64(),
                },
                "recipient": recipient_device.user_id(),
                "recipient_keys": {
                    "ed25519": recipient_signing_key.to_base64(),
                },
                "type": event_type,
                "content": content,
            });

            serde_json::to_string(&payload)?
        };

        let ciphertext = self.encrypt_helper(&plaintext).await;

        let content = EncryptedContent::OlmV1(OlmV1Content {
            sender_key: self.our_account.identity_keys.curve25519,
            ciphertext: BTreeMap::from([(
                self.sender_key.to_base64(),
                OlmCiphertext::from(ciphertext),
            )]),
        });

        Ok(serde_json::to_value(content)?)
    }

    /// Store the session as an encrypted pickle.
    pub async fn pickle(&self, pickle_key: &PickleKey) -> PickledSession {
        let pickle = self.inner.lock().await.pickle().encrypt(pickle_key.as_bytes());

        PickledSession {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            session_id: self.session_id.to_string(),
            pickle,
            sender_key: self.sender_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a Session from a previously pickled one.
    ///
    /// # Arguments
    ///
    /// * `our_account` - The static data of our own account.
    ///
    /// * `pickle` - The pickled version of the `Session`.
    ///
    /// * `pickle_key` - The key the session was pickled with.
    pub fn from_pickle(
        our_account: StaticAccountData,
        pickle: &PickledSession,
        pickle_key: &PickleKey,
    ) -> Result<Self, PickleError> {
        let inner = SessionPickle::from_encrypted(&pickle.pickle, pickle_key.as_bytes())?;
        let session = InnerSession::from_pickle(inner);
        let session_id = session.session_id();

        Ok(Session {
            our_account,
            user_id: pickle.user_id.clone(),
            device_id: pickle.device_id.clone(),
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        })
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a `Session`.
///
/// Holds all the information that needs to be stored in a database to restore
/// a Session.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PickledSession {
    /// The user on the other side of the session.
    pub user_id: OwnedUserId,
    /// The device on the other side of the session, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,
    /// The unique id of the session.
    pub session_id: String,
    /// The encrypted pickle string holding the Olm Session.
    pub pickle: String,
    /// The curve25519 key of the other user that we share this session with.
    #[serde(with = "serde_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The relative time elapsed since the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The relative time elapsed since the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use proptest::prelude::*;
    use ruma::{device_id, user_id};
    use serde_json::json;
    use vodozemac::olm::OlmMessage;

    use super::*;
    use crate::{
        olm::Account,
        types::events::{DecryptedOlmPayload, EncryptedContent},
    };

    async fn session_pair() -> (Account, Account, Session) {
        let alice = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let mut bob = Account::with_device_id(user_id!("@bob:localhost"), device_id!("BOB"));

        bob.generate_one_time_keys(1);
        let one_time_keys = bob.signed_one_time_keys();
        bob.mark_keys_as_published();

        let session = alice
            .create_outbound_session(&DeviceData::from_account(&bob), &one_time_keys)
            .unwrap();

        (alice, bob, session)
    }

    fn extract_message(content: &Value, recipient: &Account) -> OlmMessage {
        assert_matches!(EncryptedContent::from_json(content).unwrap(), EncryptedContent::OlmV1(c));
        let ciphertext = &c.ciphertext[&recipient.identity_keys().curve25519.to_base64()];
        OlmMessage::try_from(ciphertext).unwrap()
    }

    #[tokio::test]
    async fn encrypt_and_decrypt() {
        let (alice, mut bob, mut alice_session) = session_pair().await;
        let bob_device = DeviceData::from_account(&bob);

        let content = alice_session
            .encrypt(&bob_device, "m.dummy", json!({ "body": "hello" }))
            .await
            .unwrap();

        let message = extract_message(&content, &bob);
        assert_matches!(&message, OlmMessage::PreKey(pre_key));

        let (mut bob_session, plaintext) = bob
            .create_inbound_session(alice.user_id(), alice.identity_keys().curve25519, pre_key)
            .unwrap();

        assert_eq!(bob_session.session_id(), alice_session.session_id());
        assert!(bob_session.matches_pre_key_message(pre_key).await);

        let payload: DecryptedOlmPayload = serde_json::from_str(&plaintext).unwrap();
        assert_eq!(payload.sender, alice.user_id());
        assert_eq!(payload.recipient, bob.user_id());
        assert_eq!(payload.recipient_keys.ed25519, bob.identity_keys().ed25519);
        assert_eq!(payload.event_type, "m.dummy");
        assert_eq!(payload.content, json!({ "body": "hello" }));

        let alice_device = DeviceData::from_account(&alice);
        let reply = bob_session.encrypt(&alice_device, "m.dummy", json!({})).await.unwrap();
        let reply = extract_message(&reply, &alice);

        assert_matches!(&reply, OlmMessage::Normal(_));
        alice_session.decrypt(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn pickling() {
        let pickle_key = PickleKey::new();
        let (alice, _, session) = session_pair().await;

        let pickle = session.pickle(&pickle_key).await;
        let unpickled =
            Session::from_pickle(alice.static_data().clone(), &pickle, &pickle_key).unwrap();

        assert_eq!(unpickled, session);
        assert_eq!(unpickled.sender_key, session.sender_key);
        assert_eq!(unpickled.device_id.as_deref(), Some(device_id!("BOB")));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn olm_roundtrip(body in "\\PC{0,256}") {
            futures_executor::block_on(async {
                let (alice, mut bob, mut session) = session_pair().await;
                let bob_device = DeviceData::from_account(&bob);

                let content =
                    session.encrypt(&bob_device, "m.dummy", json!({ "body": body })).await.unwrap();
                let message = extract_message(&content, &bob);
                let OlmMessage::PreKey(pre_key) = message else {
                    panic!("The first message should be a pre-key message")
                };

                let sender_key = alice.identity_keys().curve25519;
                let (_, plaintext) =
                    bob.create_inbound_session(alice.user_id(), sender_key, &pre_key).unwrap();
                let payload: DecryptedOlmPayload = serde_json::from_str(&plaintext).unwrap();

                prop_assert_eq!(payload.content["body"].as_str(), Some(body.as_str()));
                Ok(())
            })?;
        }
    }
}
