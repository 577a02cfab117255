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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub mod backups;
mod ciphers;
mod engine_events;
mod error;
mod gossiping;
mod identities;
pub mod key_export;
mod machine;
pub mod migration;
pub mod olm;
mod session_manager;
mod settings;
pub mod store;
#[cfg(test)]
mod test_helpers;
pub mod transport;
pub mod types;

pub use engine_events::{AnomalyKind, EngineEvent, SecurityAnomaly};
pub use error::{
    CrossSigningError, EventError, MegolmError, MegolmResult, OlmError, OlmResult,
    SessionCreationError, SignatureError,
};
pub use gossiping::{GossipMachine, GossipRequest, KeyForwardDecision, KeyRequestState};
pub use identities::{
    Device, DeviceChanges, DeviceData, IdentityChanges, IdentityManager, LocalTrust,
    MasterPubkey, SelfSigningPubkey, TrustLevel, TrustResolver, UserIdentityData,
    UserSigningPubkey,
};
pub use machine::{DecryptedRoomEvent, OlmMachine, VerificationState};
pub use olm::{Account, InboundGroupSession, OutboundGroupSession, Session};
pub use session_manager::{GroupSessionManager, Recipients, SessionManager, ShareResult};
pub use settings::{
    BackoffSettings, BackupSettings, EncryptionSettings, EngineSettings, GossipSettings,
};
pub use store::{CryptoStore, CryptoStoreError, MemoryStore, PickleKey, RoomSettings, Store};
pub use transport::{CryptoTransport, RetryPolicy, TransportError};
#[doc(no_inline)]
pub use vodozemac;

/// The version of the matrix-sdk-e2ee crate being used
pub static VERSION: &str = env!("CARGO_PKG_VERSION");

// Enable tracing for tests in this crate
#[cfg(all(test, not(target_arch = "wasm32")))]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
