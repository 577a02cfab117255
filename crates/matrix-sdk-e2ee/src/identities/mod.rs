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

//! Collection of public identities used in Matrix.
//!
//! Matrix supports two main types of identities, a per-device identity and a
//! per-user identity.
//!
//! ## Device
//!
//! Every E2EE capable Matrix client will create a new Olm account and upload
//! the public keys of the Olm account to the server. This is represented as a
//! `DeviceData`.
//!
//! Devices can have a local trust state which needs to be saved in our
//! `CryptoStore`, to avoid reference cycles a wrapper for the
//! `DeviceData` exists which adds the trust the [`TrustResolver`] computed.
//!
//! ## User
//!
//! Cross-signing capable devices will upload 3 additional (master,
//! self-signing, user-signing) public keys which represent the user identity
//! owning all the devices. This is represented in two ways, as a
//! `UserIdentityData` for the public keys and as a
//! `PrivateCrossSigningIdentity` for the private parts of our own identity.

pub(crate) mod device;
mod manager;
mod trust;
pub(crate) mod user;

pub use device::{Device, DeviceData, LocalTrust};
pub use manager::{DeviceChanges, IdentityChanges, IdentityManager};
pub use trust::{TrustLevel, TrustResolver};
pub use user::{MasterPubkey, SelfSigningPubkey, UserIdentityData, UserSigningPubkey};
