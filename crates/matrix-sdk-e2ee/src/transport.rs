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

//! The seam between the engine and the homeserver.
//!
//! The engine never talks HTTP itself. Every request it needs answered goes
//! through a [`CryptoTransport`], crypto relevant calls are retried with a
//! [`RetryPolicy`].

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use ruma::{OwnedDeviceId, OwnedUserId, RoomId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    settings::BackoffSettings,
    types::{
        backup::{BackupVersion, KeyBackupData, RoomKeyBackup, RoomKeyBackupInfo},
        requests::{
            KeysClaimResponse, KeysQueryResponse, KeysUploadRequest, SignatureUploadRequest,
            ToDeviceRequest, UploadSigningKeysRequest,
        },
    },
};

/// Errors a [`CryptoTransport`] can return.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request didn't complete in time.
    #[error("the request timed out")]
    Timeout,

    /// The server answered with an error.
    #[error("the server returned an error, status {status}: {message}")]
    Server {
        /// The HTTP status code.
        status: u16,
        /// The error message the server returned.
        message: String,
    },

    /// The requested resource doesn't exist.
    #[error("the requested resource doesn't exist on the server")]
    NotFound,

    /// The backup version we tried to use isn't the current one.
    #[error("the backup version {0} isn't the current backup version")]
    WrongBackupVersion(String),
}

impl TransportError {
    /// Is the failure likely to go away if the request is repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Server { status, .. } => *status == 429 || *status >= 500,
            TransportError::NotFound | TransportError::WrongBackupVersion(_) => false,
        }
    }
}

/// The requests the engine needs a homeserver to answer.
#[async_trait]
pub trait CryptoTransport: fmt::Debug + Send + Sync {
    /// Upload our device keys and one-time keys.
    ///
    /// Returns the number of signed one-time keys the server holds for us.
    async fn upload_keys(&self, request: KeysUploadRequest) -> Result<u64, TransportError>;

    /// Query the device and cross-signing keys of the given users.
    async fn query_keys(&self, users: &[OwnedUserId])
        -> Result<KeysQueryResponse, TransportError>;

    /// Claim a one-time key for each of the given devices.
    async fn claim_one_time_keys(
        &self,
        devices: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    ) -> Result<KeysClaimResponse, TransportError>;

    /// Send a batch of to-device messages.
    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError>;

    /// Create a new backup version, returns the version string.
    async fn create_backup_version(
        &self,
        info: RoomKeyBackupInfo,
    ) -> Result<String, TransportError>;

    /// Get the current backup version, if there is one.
    async fn get_backup_version(&self) -> Result<Option<BackupVersion>, TransportError>;

    /// Delete the given backup version.
    async fn delete_backup_version(&self, version: &str) -> Result<(), TransportError>;

    /// Upload room keys into the given backup version.
    async fn put_room_keys(
        &self,
        version: &str,
        keys: RoomKeyBackup,
    ) -> Result<(), TransportError>;

    /// Download a single room key from the given backup version.
    async fn get_room_key(
        &self,
        version: &str,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<KeyBackupData>, TransportError>;

    /// Download all room keys of the given backup version.
    async fn get_room_keys(&self, version: &str) -> Result<RoomKeyBackup, TransportError>;

    /// Upload our public cross-signing keys.
    async fn upload_signing_keys(
        &self,
        request: UploadSigningKeysRequest,
    ) -> Result<(), TransportError>;

    /// Upload signatures of devices or master keys.
    async fn upload_signatures(
        &self,
        request: SignatureUploadRequest,
    ) -> Result<(), TransportError>;
}

/// Retries transient transport failures with exponential backoff.
#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    settings: BackoffSettings,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(settings: BackoffSettings) -> Self {
        Self { settings }
    }

    /// Run the given request, retrying it while it fails with a transient
    /// error and attempts are left.
    pub async fn run<T, F, Fut>(&self, name: &str, mut request: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut delay = self.settings.initial;
        let mut attempt = 1;

        loop {
            match request().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.settings.max_attempts => {
                    debug!(request = name, attempt, ?delay, error = ?e, "Retrying a request");

                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.settings.max);
                    attempt += 1;
                }
                Err(e) => {
                    warn!(request = name, attempt, error = ?e, "Giving up on a failed request");
                    return Err(e);
                }
            }
        }
    }
}

/// Tracks a doubling wait window after consecutive failures.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
    not_before: Option<Instant>,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: None, not_before: None }
    }

    /// Are we still inside the wait window of the last failure.
    pub(crate) fn is_waiting(&self) -> bool {
        self.not_before.is_some_and(|t| Instant::now() < t)
    }

    /// Record a failure, doubling the wait window.
    pub(crate) fn failure(&mut self) -> Duration {
        let delay = self.current.map_or(self.initial, |d| (d * 2).min(self.max));

        self.current = Some(delay);
        self.not_before = Some(Instant::now() + delay);

        delay
    }

    /// Forget previous failures.
    pub(crate) fn success(&mut self) {
        self.current = None;
        self.not_before = None;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use assert_matches2::assert_matches;

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(BackoffSettings {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            max_attempts,
        })
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result = policy(5)
            .run("test", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransportError::Timeout)
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<(), _> = policy(3)
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Server { status: 502, message: "Bad gateway".to_owned() })
            })
            .await;

        assert_matches!(result, Err(TransportError::Server { status: 502, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<(), _> = policy(5)
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::NotFound)
            })
            .await;

        assert_eq!(result, Err(TransportError::NotFound));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(3));

        assert!(!backoff.is_waiting());
        assert_eq!(backoff.failure(), Duration::from_secs(1));
        assert!(backoff.is_waiting());
        assert_eq!(backoff.failure(), Duration::from_secs(2));
        assert_eq!(backoff.failure(), Duration::from_secs(3));
        assert_eq!(backoff.failure(), Duration::from_secs(3));

        backoff.success();
        assert!(!backoff.is_waiting());
        assert_eq!(backoff.failure(), Duration::from_secs(1));
    }
}
