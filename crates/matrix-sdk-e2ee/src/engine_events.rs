// Copyright 2024 The Matrix.org Foundation C.I.C.
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

//! Notifications the engine publishes for the application.

use ruma::{OwnedDeviceId, OwnedUserId};

use crate::{
    backups::BackupState,
    error::{EventError, MegolmError, OlmError},
};

/// An event published on the broadcast channel of the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// The trust of the given user's devices needs to be recomputed, `None`
    /// means every user is affected.
    TrustChanged {
        /// The affected user.
        user_id: Option<OwnedUserId>,
    },

    /// The room key backup moved to a new state.
    BackupStateChanged(BackupState),

    /// Something happened that might be an attack.
    SecurityAnomaly(SecurityAnomaly),

    /// A key query returned different identity keys for a device we already
    /// knew about. The stored keys were kept.
    DeviceKeysChanged {
        /// The owner of the device.
        user_id: OwnedUserId,
        /// The device with the changed keys.
        device_id: OwnedDeviceId,
    },

    /// A device failed its self-signature check and was dropped.
    InvalidDeviceSignature {
        /// The owner of the device.
        user_id: OwnedUserId,
        /// The device that failed the check.
        device_id: OwnedDeviceId,
    },
}

/// The kind of a [`SecurityAnomaly`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnomalyKind {
    /// A Megolm message index was reused for a different ciphertext.
    ReplayAttack,
    /// The claimed sender of a message doesn't match its provenance.
    MismatchedSender,
    /// The room of a decrypted event doesn't match the room of its session.
    MismatchedRoom,
    /// Two unrelated sessions share the same id.
    MismatchedSessions,
    /// A to-device event was encrypted for another user.
    MismatchedRecipient,
    /// A signing key in a decrypted payload doesn't match the keys we know.
    MismatchedKeys,
    /// A signature failed to verify.
    InvalidSignature,
}

/// A security relevant failure, reported to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityAnomaly {
    /// What happened.
    pub kind: AnomalyKind,
    /// A human readable description of the failure.
    pub description: String,
}

impl SecurityAnomaly {
    /// Create a new anomaly.
    pub fn new(kind: AnomalyKind, description: impl Into<String>) -> Self {
        Self { kind, description: description.into() }
    }

    /// Map a Megolm failure to an anomaly, if it is security relevant.
    pub fn from_megolm_error(error: &MegolmError) -> Option<Self> {
        let kind = match error {
            MegolmError::MegolmReplayAttack { .. } => AnomalyKind::ReplayAttack,
            MegolmError::MismatchedSender { .. } => AnomalyKind::MismatchedSender,
            MegolmError::MismatchedSessions(_) => AnomalyKind::MismatchedSessions,
            MegolmError::EventError(EventError::MismatchedRoom(..)) => AnomalyKind::MismatchedRoom,
            _ => return None,
        };

        Some(Self::new(kind, error.to_string()))
    }

    /// Map an Olm failure to an anomaly, if it is security relevant.
    pub fn from_olm_error(error: &OlmError) -> Option<Self> {
        let kind = match error {
            OlmError::Signature(_) => AnomalyKind::InvalidSignature,
            OlmError::EventError(e) => match e {
                EventError::MismatchedSender(..) => AnomalyKind::MismatchedSender,
                EventError::MismatchedRecipient(..) => AnomalyKind::MismatchedRecipient,
                EventError::MismatchedKeys(..) => AnomalyKind::MismatchedKeys,
                _ => return None,
            },
            _ => return None,
        };

        Some(Self::new(kind, error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use ruma::{room_id, user_id};
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};

    use super::*;
    use crate::error::SignatureError;

    #[test]
    fn only_security_relevant_errors_become_anomalies() {
        let replay = MegolmError::MegolmReplayAttack { session_id: "id".to_owned(), index: 3 };
        let anomaly = SecurityAnomaly::from_megolm_error(&replay).unwrap();
        assert_eq!(anomaly.kind, AnomalyKind::ReplayAttack);
        assert!(anomaly.description.contains('3'));

        let room = MegolmError::EventError(EventError::MismatchedRoom(
            room_id!("!a:localhost").to_owned(),
            Some(room_id!("!b:localhost").to_owned()),
        ));
        assert_eq!(
            SecurityAnomaly::from_megolm_error(&room).map(|a| a.kind),
            Some(AnomalyKind::MismatchedRoom)
        );

        let missing = MegolmError::UnknownInboundSessionId {
            room_id: room_id!("!a:localhost").to_owned(),
            sender_key: Curve25519PublicKey::from(&Curve25519SecretKey::new()),
            session_id: "id".to_owned(),
        };
        assert!(SecurityAnomaly::from_megolm_error(&missing).is_none());
    }

    #[test]
    fn olm_errors_become_anomalies() {
        let recipient =
            OlmError::from(EventError::MismatchedRecipient(user_id!("@carol:localhost").into()));
        let anomaly = SecurityAnomaly::from_olm_error(&recipient).unwrap();
        assert_eq!(anomaly.kind, AnomalyKind::MismatchedRecipient);
        assert!(anomaly.description.contains("@carol:localhost"));

        let signature = OlmError::from(SignatureError::UnsupportedAlgorithm);
        assert_eq!(
            SecurityAnomaly::from_olm_error(&signature).map(|a| a.kind),
            Some(AnomalyKind::InvalidSignature)
        );

        assert!(SecurityAnomaly::from_olm_error(&OlmError::Closed).is_none());
        assert!(SecurityAnomaly::from_olm_error(&EventError::MissingCiphertext.into()).is_none());

        for error in [recipient, signature] {
            assert!(error.is_security_relevant());
        }
    }
}
