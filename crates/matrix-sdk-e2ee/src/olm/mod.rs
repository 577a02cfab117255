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

//! The Olm and Megolm primitives of the engine.
//!
//! An [`Account`] holds the long-lived identity keys of our device, Olm
//! [`Session`]s encrypt to-device messages between two devices, group
//! sessions encrypt room messages and the [`PrivateCrossSigningIdentity`]
//! holds our cross-signing keys.

mod account;
mod group_sessions;
mod session;
mod signing;
pub(crate) mod utility;

pub use account::{Account, PickledAccount, StaticAccountData};
pub(crate) use group_sessions::ciphertext_digest;
pub use group_sessions::{
    DecryptedMegolmPayload, EncryptionSettings, ExportedSessionKey, InboundGroupSession,
    OutboundGroupSession, PickledInboundGroupSession, PickledOutboundGroupSession, SessionKey,
    SessionOrdering, ShareInfo, ShareInfoSet, SharedWith,
};
pub use session::{PickledSession, Session};
pub use signing::{
    CrossSigningKeyExport, MasterSigning, PickledCrossSigningIdentity, PrivateCrossSigningIdentity,
    SelfSigning, Signing, SigningError, UserSigning,
};
pub use utility::VerifyJson;
