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

use ruma::{CanonicalJsonValue, UserId};
use serde_json::Value;
use vodozemac::Ed25519PublicKey;

use crate::{error::SignatureError, types::SignedJsonObject};

/// Turn a JSON value into the canonical string that gets signed.
///
/// The `signatures` and `unsigned` fields are not part of the signed content.
pub(crate) fn to_signable_json(mut value: Value) -> Result<String, SignatureError> {
    let json_object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    let _ = json_object.remove("signatures");
    let _ = json_object.remove("unsigned");

    let canonical_json: CanonicalJsonValue = value.try_into()?;
    Ok(canonical_json.to_string())
}

/// Verification of Matrix signed JSON objects with an Ed25519 key.
pub trait VerifyJson {
    /// Verify a signed JSON object.
    ///
    /// The object must carry a signature from the given user with the given
    /// key id.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user who signed the JSON object.
    ///
    /// * `key_id` - The id of the key that signed the JSON object, for example
    ///   `ed25519:DEVICEID`.
    ///
    /// * `signed_object` - The object that should be verified.
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &str,
        signed_object: &impl SignedJsonObject,
    ) -> Result<(), SignatureError>;

    /// Verify a canonicalized string against a signature taken from a signed
    /// object.
    fn verify_canonicalized_json(
        &self,
        user_id: &UserId,
        key_id: &str,
        signed_object: &impl SignedJsonObject,
        canonical_json: &str,
    ) -> Result<(), SignatureError>;
}

impl VerifyJson for Ed25519PublicKey {
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &str,
        signed_object: &impl SignedJsonObject,
    ) -> Result<(), SignatureError> {
        let canonical_json = to_signable_json(serde_json::to_value(signed_object)?)?;
        self.verify_canonicalized_json(user_id, key_id, signed_object, &canonical_json)
    }

    fn verify_canonicalized_json(
        &self,
        user_id: &UserId,
        key_id: &str,
        signed_object: &impl SignedJsonObject,
        canonical_json: &str,
    ) -> Result<(), SignatureError> {
        if !key_id.starts_with("ed25519:") {
            return Err(SignatureError::UnsupportedAlgorithm);
        }

        let signature = signed_object
            .signatures()
            .get_signature(user_id, key_id)
            .ok_or(SignatureError::NoSignatureFound)?;

        Ok(self.verify(canonical_json.as_bytes(), &signature)?)
    }
}
