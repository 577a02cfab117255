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

//! Tunable policy values of the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::olm::EncryptionSettings;

/// All the policy knobs of an [`OlmMachine`](crate::OlmMachine).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EngineSettings {
    /// Default settings for new outbound group sessions.
    #[serde(default)]
    pub encryption: EncryptionSettings,
    /// Settings for the room key backup.
    #[serde(default)]
    pub backup: BackupSettings,
    /// Settings for room key requests.
    #[serde(default)]
    pub gossip: GossipSettings,
    /// Retry policy for the crypto relevant network calls.
    #[serde(default)]
    pub retry: BackoffSettings,
}

/// Settings for the room key backup.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BackupSettings {
    /// How many room keys are uploaded in a single request.
    pub batch_size: usize,
    /// How long to wait after the first failed upload.
    pub initial_backoff: Duration,
    /// The upper bound of the wait between failed uploads.
    pub max_backoff: Duration,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60 * 60),
        }
    }
}

/// Settings for room key requests.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GossipSettings {
    /// Should key requests also be sent to the devices of the user that
    /// created the session, not only to our own devices.
    #[serde(default)]
    pub request_from_sender: bool,
    /// The initial window during which a repeated request for the same
    /// session is suppressed.
    pub initial_backoff: Duration,
    /// The upper bound of the suppression window.
    pub max_backoff: Duration,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            request_from_sender: false,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60 * 60),
        }
    }
}

/// Exponential backoff for retried network calls.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackoffSettings {
    /// The delay before the first retry.
    pub initial: Duration,
    /// The maximal delay between two attempts.
    pub max: Duration,
    /// How many times a call is attempted in total.
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ruma::events::room::history_visibility::HistoryVisibility;
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults() {
        let settings = EngineSettings::default();

        assert_eq!(settings.encryption.rotation_period, Duration::from_millis(604_800_000));
        assert_eq!(settings.encryption.rotation_period_msgs, 100);
        assert_eq!(settings.encryption.history_visibility, HistoryVisibility::Shared);
        assert!(!settings.encryption.only_allow_trusted_devices);

        assert_eq!(settings.backup.batch_size, 100);
        assert_eq!(settings.backup.initial_backoff, Duration::from_secs(10));
        assert_eq!(settings.backup.max_backoff, Duration::from_secs(3600));

        assert!(!settings.gossip.request_from_sender);
        assert_eq!(settings.gossip.initial_backoff, Duration::from_secs(1));
        assert_eq!(settings.gossip.max_backoff, Duration::from_secs(3600));

        assert_eq!(settings.retry.initial, Duration::from_millis(10));
        assert_eq!(settings.retry.max, Duration::from_millis(1000));
        assert_eq!(settings.retry.max_attempts, 5);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let settings: EngineSettings = serde_json::from_value(json!({
            "retry": {
                "initial": { "secs": 1, "nanos": 0 },
                "max": { "secs": 2, "nanos": 0 },
                "max_attempts": 2,
            }
        }))
        .unwrap();

        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.backup.batch_size, 100);
    }
}
