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


//! Megolm group sessions, the outbound half encrypts room messages and the
//! inbound half decrypts them.

mod inbound;
mod outbound;

pub(crate) use inbound::ciphertext_digest;
pub use inbound::{DecryptedMegolmPayload, InboundGroupSession, PickledInboundGroupSession};
pub use outbound::{
    EncryptionSettings, OutboundGroupSession, PickledOutboundGroupSession, ShareInfo, ShareInfoSet,
    SharedWith,
};
pub use vodozemac::megolm::{ExportedSessionKey, SessionKey, SessionOrdering};
