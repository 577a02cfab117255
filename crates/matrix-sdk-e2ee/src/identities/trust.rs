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

use std::{
    collections::HashMap,
    sync::{Arc, RwLock as StdRwLock},
};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{DeviceData, LocalTrust, MasterPubkey, UserIdentityData, UserSigningPubkey};
use crate::store::{CryptoStoreError, Store};

/// The trust the engine computed for a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    /// The device was verified locally, or it was cross-signed by an owner we
    /// trust.
    Verified,
    /// The device was cross-signed by its owner, but we don't trust the
    /// owner's identity.
    CrossSignedUnverifiedOwner,
    /// We know the device, but nothing vouches for it.
    Unverified,
    /// The device was blacklisted locally.
    Blacklisted,
    /// We don't know about the device.
    Unknown,
}

#[derive(Debug, Default)]
struct TrustMemo {
    /// The fingerprint of our own master key the memo was computed with.
    fingerprint: Option<String>,
    levels: HashMap<(OwnedUserId, OwnedDeviceId), TrustLevel>,
}

/// Derives the trust of devices from local verification and the
/// cross-signing chain.
///
/// The chain is walked from the device over the owner's self-signing key to
/// the owner's master key, and from there over our user-signing key to our
/// own master key. Results are memoized for the current fingerprint of our
/// master key.
#[derive(Clone, Debug)]
pub struct TrustResolver {
    store: Store,
    memo: Arc<StdRwLock<TrustMemo>>,
}

impl TrustResolver {
    /// Create a new resolver reading from the given store.
    pub fn new(store: Store) -> Self {
        Self { store, memo: Default::default() }
    }

    /// Forget all memoized results.
    pub fn clear(&self) {
        let mut memo = self.memo.write().unwrap();
        memo.levels.clear();
        memo.fingerprint = None;
    }

    async fn own_master_fingerprint(&self) -> Result<Option<String>, CryptoStoreError> {
        if let Some(master) = self.store.private_identity().master_public_key().await {
            return Ok(master.fingerprint());
        }

        Ok(self
            .store
            .get_user_identity(self.store.user_id())
            .await?
            .and_then(|i| i.master_key().fingerprint()))
    }

    /// Compute the trust level of the given device.
    ///
    /// Broken or missing links in the cross-signing chain lead to
    /// [`TrustLevel::Unverified`], only store failures are errors.
    pub async fn compute_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<TrustLevel, CryptoStoreError> {
        let fingerprint = self.own_master_fingerprint().await?;
        let key = (user_id.to_owned(), device_id.to_owned());

        {
            let mut memo = self.memo.write().unwrap();

            if memo.fingerprint != fingerprint {
                memo.levels.clear();
                memo.fingerprint = fingerprint.clone();
            } else if let Some(level) = memo.levels.get(&key) {
                return Ok(*level);
            }
        }

        let level = match self.store.get_device_data(user_id, device_id).await? {
            Some(device) => self.device_trust(&device).await?,
            None => TrustLevel::Unknown,
        };

        trace!(?user_id, ?device_id, ?level, "Computed the trust of a device");

        let mut memo = self.memo.write().unwrap();

        if memo.fingerprint == fingerprint {
            memo.levels.insert(key, level);
        }

        Ok(level)
    }

    async fn device_trust(&self, device: &DeviceData) -> Result<TrustLevel, CryptoStoreError> {
        match device.local_trust_state() {
            LocalTrust::BlackListed => return Ok(TrustLevel::Blacklisted),
            LocalTrust::Verified => return Ok(TrustLevel::Verified),
            LocalTrust::Ignored | LocalTrust::Unset => {}
        }

        let Some(identity) = self.store.get_user_identity(device.user_id()).await? else {
            return Ok(TrustLevel::Unverified);
        };

        if !identity.is_device_signed(device) {
            return Ok(TrustLevel::Unverified);
        }

        if self.is_identity_trusted(&identity).await? {
            Ok(TrustLevel::Verified)
        } else {
            Ok(TrustLevel::CrossSignedUnverifiedOwner)
        }
    }

    /// Do we trust the master key of the given identity.
    pub async fn is_identity_trusted(
        &self,
        identity: &UserIdentityData,
    ) -> Result<bool, CryptoStoreError> {
        if identity.user_id() == self.store.user_id() {
            return self.is_own_master_trusted(identity.master_key()).await;
        }

        let Some(user_signing_key) = self.trusted_user_signing_key().await? else {
            return Ok(false);
        };

        Ok(user_signing_key.verify_master_key(identity.master_key()).is_ok())
    }

    /// Get our user-signing key, if the chain up to our master key holds.
    async fn trusted_user_signing_key(
        &self,
    ) -> Result<Option<UserSigningPubkey>, CryptoStoreError> {
        // Holding the private part is as good as it gets.
        if let Some(key) = self.store.private_identity().user_signing_public_key().await {
            return Ok(Some(key));
        }

        let Some(own_identity) = self.store.get_user_identity(self.store.user_id()).await? else {
            return Ok(None);
        };

        if !self.is_own_master_trusted(own_identity.master_key()).await? {
            return Ok(None);
        }

        Ok(own_identity.user_signing_key().cloned())
    }

    async fn is_own_master_trusted(&self, master: &MasterPubkey) -> Result<bool, CryptoStoreError> {
        if self.store.private_identity().master_public_key().await.as_ref() == Some(master) {
            return Ok(true);
        }

        let own_keys = self.store.static_account().unsigned_device_keys();
        let own_device = DeviceData::new(own_keys, LocalTrust::Verified);

        if master.is_signed_by_device(&own_device).is_ok() {
            return Ok(true);
        }

        let devices = self.store.get_user_devices_data(self.store.user_id()).await?;

        Ok(devices
            .values()
            .filter(|d| d.is_locally_trusted() && d.device_id() != self.store.device_id())
            .any(|d| master.is_signed_by_device(d).is_ok()))
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;
    use crate::{
        identities::device::testing::signed_device_keys,
        olm::PrivateCrossSigningIdentity,
        store::{Changes, MemoryStore, PickleKey},
    };

    async fn store() -> Store {
        Store::open(
            user_id!("@alice:localhost"),
            device_id!("ALICE"),
            Arc::new(MemoryStore::new()),
            PickleKey::new(),
        )
        .await
        .unwrap()
    }

    async fn save_device(store: &Store, device: DeviceData) {
        store.save_changes(Changes { devices: vec![device], ..Default::default() }).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_and_local_trust() {
        let store = store().await;
        let resolver = TrustResolver::new(store.clone());
        let bob = user_id!("@bob:localhost");

        assert_eq!(
            resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap(),
            TrustLevel::Unknown
        );

        let (keys, _) = signed_device_keys("@bob:localhost", "BOBDEVICE");
        let mut device = DeviceData::try_from(&keys).unwrap();
        save_device(&store, device.clone()).await;

        let level = resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert_eq!(level, TrustLevel::Unverified);

        device.set_trust_state(LocalTrust::BlackListed);
        save_device(&store, device.clone()).await;
        resolver.clear();
        let level = resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert_eq!(level, TrustLevel::Blacklisted);

        device.set_trust_state(LocalTrust::Verified);
        save_device(&store, device).await;
        resolver.clear();
        let level = resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert_eq!(level, TrustLevel::Verified);
    }

    #[tokio::test]
    async fn results_are_memoized_until_cleared() {
        let store = store().await;
        let resolver = TrustResolver::new(store.clone());
        let bob = user_id!("@bob:localhost");

        let (keys, _) = signed_device_keys("@bob:localhost", "BOBDEVICE");
        let mut device = DeviceData::try_from(&keys).unwrap();
        save_device(&store, device.clone()).await;

        let first = resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap();
        let second = resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert_eq!(first, second);

        device.set_trust_state(LocalTrust::Verified);
        save_device(&store, device).await;

        let memoized = resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert_eq!(memoized, TrustLevel::Unverified);

        resolver.clear();
        let level = resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert_eq!(level, TrustLevel::Verified);
    }

    #[tokio::test]
    async fn cross_signing_chain() {
        let store = store().await;
        let resolver = TrustResolver::new(store.clone());
        let bob = user_id!("@bob:localhost");

        // Our own identity, we hold the private keys.
        let (own_identity, _, _) =
            PrivateCrossSigningIdentity::with_account(&*store.account().await).await.unwrap();
        store.private_identity().replace_with(own_identity).await;

        // Bob's identity and a device signed by it.
        let bob_identity = PrivateCrossSigningIdentity::new(bob.to_owned());
        let (keys, _) = signed_device_keys("@bob:localhost", "BOBDEVICE");
        let device = DeviceData::try_from(&keys).unwrap();
        let request = bob_identity.sign_device(&device).await.unwrap();
        let signed_keys = serde_json::from_value(
            request.signed_keys[bob]["BOBDEVICE"].clone(),
        )
        .unwrap();
        let device = DeviceData::new(signed_keys, LocalTrust::Unset);

        let bob_public = bob_identity.to_public_identity().await.unwrap();
        let bob_public = UserIdentityData::new(
            bob_public.master_key().clone(),
            bob_public.self_signing_key().clone(),
            None,
        )
        .unwrap();

        store
            .save_changes(Changes {
                devices: vec![device],
                identities: vec![bob_public.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let level = resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert_eq!(level, TrustLevel::CrossSignedUnverifiedOwner);

        // Sign Bob's master key with our user-signing key.
        let request = store.private_identity().sign_user(&bob_public).await.unwrap();
        let master_key_id = bob_public.master_key().get_first_key().unwrap().to_base64();
        let signature: crate::types::CrossSigningKey =
            serde_json::from_value(request.signed_keys[bob][&master_key_id].clone()).unwrap();

        let mut master = crate::types::CrossSigningKey::from(bob_public.master_key().clone());
        master.signatures.extend(signature.signatures);
        let bob_public = UserIdentityData::new(
            MasterPubkey::try_from(master).unwrap(),
            bob_public.self_signing_key().clone(),
            None,
        )
        .unwrap();

        store
            .save_changes(Changes { identities: vec![bob_public], ..Default::default() })
            .await
            .unwrap();
        resolver.clear();

        let level = resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert_eq!(level, TrustLevel::Verified);

        // Idempotent.
        let again = resolver.compute_trust(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert_eq!(level, again);
    }

    #[tokio::test]
    async fn own_master_signed_by_our_device_is_trusted() {
        let store = store().await;
        let resolver = TrustResolver::new(store.clone());

        let (identity, _, _) =
            PrivateCrossSigningIdentity::with_account(&*store.account().await).await.unwrap();
        let public = identity.to_public_identity().await.unwrap();

        // We don't hold the private keys, the device signature is enough.
        assert!(resolver.is_identity_trusted(&public).await.unwrap());

        let stranger = PrivateCrossSigningIdentity::new(store.user_id().to_owned());
        let stranger = stranger.to_public_identity().await.unwrap();
        assert!(!resolver.is_identity_trusted(&stranger).await.unwrap());
    }
}
