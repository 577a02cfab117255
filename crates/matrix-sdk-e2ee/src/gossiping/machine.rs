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
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use dashmap::{mapref::entry::Entry, DashMap};
use ruma::{
    events::room::history_visibility::HistoryVisibility, OwnedDeviceId, OwnedTransactionId,
    OwnedUserId, RoomId, TransactionId, UserId,
};
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::Curve25519PublicKey;

use super::{GossipRequest, KeyForwardDecision, KeyRequestState, RequestInfo};
use crate::{
    error::{MegolmError, MegolmResult, OlmError, OlmResult},
    identities::{Device, IdentityManager},
    olm::InboundGroupSession,
    session_manager::SessionManager,
    settings::GossipSettings,
    store::{ImportOutcome, RoomSettings, Store},
    transport::Backoff,
    types::{
        events::{
            ForwardedRoomKeyContent, KeyRequestAction, RequestedKeyInfo, RoomKeyRequestContent,
            FORWARDED_ROOM_KEY, ROOM_ENCRYPTED,
        },
        requests::ToDeviceRequest,
        EventEncryptionAlgorithm,
    },
};

#[derive(Debug)]
struct KeyRequestEntry {
    request: GossipRequest,
    backoff: Backoff,
}

/// Requests room keys we're missing from our other devices and forwards
/// room keys to our other devices when they ask for them.
#[derive(Debug, Clone)]
pub struct GossipMachine {
    store: Store,
    identities: IdentityManager,
    sessions: SessionManager,
    settings: GossipSettings,
    /// Key requests and cancellations waiting to be sent, keyed by their
    /// transaction id.
    outgoing_requests: Arc<DashMap<OwnedTransactionId, ToDeviceRequest>>,
    /// The latest key request of every session we asked for, keyed by the
    /// session id.
    key_requests: Arc<DashMap<String, KeyRequestEntry>>,
    incoming_key_requests: Arc<DashMap<RequestInfo, RequestedKeyInfo>>,
}

impl GossipMachine {
    pub(crate) fn new(
        store: Store,
        identities: IdentityManager,
        sessions: SessionManager,
        settings: GossipSettings,
    ) -> Self {
        Self {
            store,
            identities,
            sessions,
            settings,
            outgoing_requests: Default::default(),
            key_requests: Default::default(),
            incoming_key_requests: Default::default(),
        }
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        self.store.user_id()
    }

    /// The to-device requests that still need to be sent out, key requests
    /// and their cancellations.
    pub fn outgoing_requests(&self) -> Vec<ToDeviceRequest> {
        self.outgoing_requests.iter().map(|r| r.value().clone()).collect()
    }

    /// The state of the latest key request for the given session.
    pub fn request_state(&self, session_id: &str) -> Option<KeyRequestState> {
        self.key_requests.get(session_id).map(|e| e.request.state)
    }

    fn queue(&self, request: ToDeviceRequest) {
        self.outgoing_requests.insert(request.txn_id.clone(), request);
    }

    /// The devices a key request for a session of the given sender goes to.
    async fn recipients(
        &self,
        sender: &UserId,
    ) -> OlmResult<BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>> {
        let own_user_id = self.store.user_id();
        let own_device_id = self.store.device_id();

        let mut users = vec![own_user_id];

        if self.settings.request_from_sender && sender != own_user_id {
            users.push(sender);
        }

        let recipients = self
            .identities
            .devices_for_users(&users)
            .await?
            .into_iter()
            .map(|(user_id, devices)| {
                let devices: BTreeSet<_> = devices
                    .into_values()
                    .filter(|d| !(d.user_id() == own_user_id && d.device_id() == own_device_id))
                    .filter(|d| !d.is_blacklisted())
                    .map(|d| d.device_id().to_owned())
                    .collect();

                (user_id, devices)
            })
            .filter(|(_, devices)| !devices.is_empty())
            .collect();

        Ok(recipients)
    }

    /// Create a new outgoing key request for the key with the given session
    /// id.
    ///
    /// This will queue up a new to-device request and remember the key info
    /// so once we receive a forwarded room key we can check that it matches
    /// the key we requested.
    ///
    /// Only one request per session is outstanding at a time. Repeated calls
    /// are suppressed while the backoff window of the session is open, the
    /// window doubles with every request that didn't bring the key.
    ///
    /// Returns `true` if a new request was queued.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The id of the room where the key is used in.
    ///
    /// * `sender` - The user that sent the undecryptable event.
    ///
    /// * `sender_key` - The curve25519 key of the sender that owns the key.
    ///
    /// * `session_id` - The id that uniquely identifies the session.
    #[instrument(skip_all, fields(?room_id, session_id))]
    pub async fn create_key_request(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> OlmResult<bool> {
        if self.is_suppressed(session_id) {
            return Ok(false);
        }

        let recipients = self.recipients(sender).await?;

        if recipients.is_empty() {
            debug!("No other device could answer a key request, not requesting the key");
            return Ok(false);
        }

        let info = RequestedKeyInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id.to_owned(),
            sender_key,
            session_id: session_id.to_owned(),
        };
        let request = GossipRequest::new(info, recipients);
        let own_device_id = self.store.device_id();

        let mut entry = match self.key_requests.entry(session_id.to_owned()) {
            Entry::Occupied(previous) if previous.get().backoff.is_waiting() => {
                // Someone else created a request while we were looking up the
                // recipients.
                return Ok(false);
            }
            Entry::Occupied(mut previous) => {
                let previous_request = &previous.get().request;

                match previous_request.state {
                    KeyRequestState::Idle => {
                        self.outgoing_requests.remove(&previous_request.request_id);
                    }
                    KeyRequestState::Requested => {
                        self.queue(previous_request.to_cancellation(own_device_id));
                    }
                    _ => {}
                }

                previous.get_mut().request = request;
                previous.into_ref()
            }
            Entry::Vacant(slot) => slot.insert(KeyRequestEntry {
                request,
                backoff: Backoff::new(self.settings.initial_backoff, self.settings.max_backoff),
            }),
        };

        let window = entry.backoff.failure();

        info!(
            request_id = ?entry.request.request_id,
            recipients = ?entry.request.recipients,
            ?window,
            "Creating a new outgoing key request"
        );

        self.queue(entry.request.to_request(own_device_id));

        Ok(true)
    }

    fn is_suppressed(&self, session_id: &str) -> bool {
        match self.key_requests.get(session_id) {
            Some(entry) if entry.backoff.is_waiting() => {
                trace!(state = ?entry.request.state, "Suppressing a repeated key request");
                true
            }
            _ => false,
        }
    }

    /// Mark the outgoing request as sent.
    pub fn mark_request_as_sent(&self, request_id: &TransactionId) {
        self.outgoing_requests.remove(request_id);

        let entry = self.key_requests.iter_mut().find(|e| {
            &*e.request.request_id == request_id && e.request.state == KeyRequestState::Idle
        });

        if let Some(mut entry) = entry {
            trace!(
                request_id = ?request_id,
                session_id = %entry.request.info.session_id,
                "Marking outgoing key request as sent"
            );
            entry.request.state = KeyRequestState::Requested;
        }
    }

    /// Give up on the outstanding key request for the given session.
    ///
    /// The request is marked as timed out and the session can be requested
    /// again once its backoff window closes. Devices that already received
    /// the request get a cancellation.
    ///
    /// Returns `false` if no request was outstanding.
    pub fn cancel_key_request(&self, session_id: &str) -> bool {
        let Some(mut entry) =
            self.key_requests.get_mut(session_id).filter(|e| e.request.state.is_outstanding())
        else {
            return false;
        };

        debug!(request_id = ?entry.request.request_id, session_id, "Cancelling a key request");

        if entry.request.state == KeyRequestState::Requested {
            self.queue(entry.request.to_cancellation(self.store.device_id()));
        } else {
            self.outgoing_requests.remove(&entry.request.request_id);
        }

        entry.request.state = KeyRequestState::TimedOut;

        true
    }

    /// Move an outstanding request into a final state and tell its
    /// recipients that we don't need an answer anymore.
    fn finish_request(
        &self,
        request_id: &TransactionId,
        session_id: &str,
        new_state: KeyRequestState,
    ) {
        let Some(mut entry) = self
            .key_requests
            .get_mut(session_id)
            .filter(|e| &*e.request.request_id == request_id && e.request.state.is_outstanding())
        else {
            return;
        };

        trace!(?request_id, session_id, state = ?new_state, "Finishing a key request");

        if entry.request.state == KeyRequestState::Idle {
            self.outgoing_requests.remove(request_id);
        }

        if new_state == KeyRequestState::Fulfilled {
            entry.backoff.success();
        }

        entry.request.state = new_state;
        self.queue(entry.request.to_cancellation(self.store.device_id()));
    }

    /// Get an outstanding request that matches the forwarded room key.
    fn get_key_info(
        &self,
        sender: &UserId,
        content: &ForwardedRoomKeyContent,
    ) -> Option<GossipRequest> {
        self.key_requests
            .get(&content.session_id)
            .map(|e| e.request.clone())
            .filter(|r| r.state.is_outstanding() && r.recipients.contains_key(sender))
            .filter(|r| {
                r.info.algorithm == content.algorithm
                    && r.info.room_id == content.room_id
                    && r.info.sender_key == content.sender_key
            })
    }

    /// Receive a forwarded room key.
    ///
    /// The key is only accepted if it answers one of our outstanding
    /// requests. Accepted keys are imported, the forwarder is appended to
    /// the forwarding chain of the session.
    ///
    /// # Arguments
    ///
    /// * `sender` - The user that sent us the key.
    ///
    /// * `forwarder_key` - The Curve25519 key of the device that sent us the
    ///   key, taken from the Olm message that carried it.
    ///
    /// * `content` - The decrypted `m.forwarded_room_key` content.
    #[instrument(
        skip_all,
        fields(?sender, room_id = ?content.room_id, session_id = %content.session_id)
    )]
    pub async fn receive_forwarded_room_key(
        &self,
        sender: &UserId,
        forwarder_key: Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
    ) -> MegolmResult<Option<ImportOutcome>> {
        let Some(request) = self.get_key_info(sender, content) else {
            warn!(
                forwarder_key = %forwarder_key.to_base64(),
                claimed_sender_key = %content.sender_key.to_base64(),
                "Received a forwarded room key that we didn't request",
            );
            return Ok(None);
        };

        let session = match InboundGroupSession::from_forwarded_key(forwarder_key, content) {
            Ok(session) => session,
            Err(error) => {
                warn!(
                    forwarder_key = %forwarder_key.to_base64(),
                    ?error,
                    "Couldn't create a group session from a forwarded room key"
                );
                return Ok(None);
            }
        };

        match self.store.import_inbound_group_session(session).await {
            Ok(outcome) => {
                info!(
                    forwarder_key = %forwarder_key.to_base64(),
                    ?outcome,
                    "Received a forwarded room key"
                );
                self.finish_request(
                    &request.request_id,
                    &content.session_id,
                    KeyRequestState::Fulfilled,
                );

                Ok(Some(outcome))
            }
            Err(error @ MegolmError::Store(_)) => Err(error),
            Err(error) => {
                warn!(?error, "Rejected a forwarded room key");
                self.finish_request(
                    &request.request_id,
                    &content.session_id,
                    KeyRequestState::Declined,
                );

                Err(error)
            }
        }
    }

    /// Receive a room key request event.
    ///
    /// Requests are queued until [`GossipMachine::collect_incoming_requests`]
    /// runs, a cancellation removes the queued request it refers to.
    pub fn receive_incoming_key_request(&self, sender: &UserId, content: &RoomKeyRequestContent) {
        // Requests can reach us if they were sent to all of our devices,
        // ignore the ones we sent ourselves.
        if sender == self.user_id() && &*content.requesting_device_id == self.store.device_id() {
            trace!("Received a room key request from ourselves, ignoring");
            return;
        }

        let info = RequestInfo::new(
            sender.to_owned(),
            content.requesting_device_id.clone(),
            content.request_id.clone(),
        );
        match content.action {
            KeyRequestAction::Request => {
                if let Some(body) = &content.body {
                    self.incoming_key_requests.insert(info, body.clone());
                } else {
                    warn!(
                        ?sender,
                        requesting_device_id = ?content.requesting_device_id,
                        "Received a key request without key info"
                    );
                }
            }
            KeyRequestAction::RequestCancellation => {
                if self.incoming_key_requests.remove(&info).is_some() {
                    trace!(
                        ?sender,
                        request_id = ?content.request_id,
                        "A queued key request was cancelled"
                    );
                }
            }
        }
    }

    /// Handle all the incoming key requests that are queued up and empty our
    /// key request queue.
    ///
    /// Returns the encrypted `m.forwarded_room_key` messages that answer the
    /// requests we decided to serve.
    pub async fn collect_incoming_requests(&self) -> OlmResult<Vec<ToDeviceRequest>> {
        let requests: Vec<_> =
            self.incoming_key_requests.iter().map(|e| e.key().clone()).collect();
        let mut forwards = Vec::new();

        for info in requests {
            let Some((info, key_info)) = self.incoming_key_requests.remove(&info) else {
                continue;
            };

            if let Some(request) = self.handle_key_request(&info, &key_info).await? {
                forwards.push(request);
            }
        }

        Ok(forwards)
    }

    /// Handle a single incoming key request.
    async fn handle_key_request(
        &self,
        info: &RequestInfo,
        key_info: &RequestedKeyInfo,
    ) -> OlmResult<Option<ToDeviceRequest>> {
        let session = self
            .store
            .get_inbound_group_session(&key_info.sender_key.to_base64(), &key_info.session_id)
            .await?;

        let Some(session) = session else {
            debug!(
                user_id = ?info.sender,
                device_id = ?info.requesting_device_id,
                session_id = %key_info.session_id,
                room_id = ?key_info.room_id,
                "Received a room key request for an unknown inbound group session",
            );
            return Ok(None);
        };

        let device = self.identities.get_device(&info.sender, &info.requesting_device_id).await?;

        let Some(device) = device else {
            warn!(
                user_id = ?info.sender,
                device_id = ?info.requesting_device_id,
                "Received a key request from an unknown device",
            );
            return Ok(None);
        };

        let room_settings = self.store.get_room_settings(session.room_id()).await?;

        if let Err(reason) = self.should_share_key(&device, &session, key_info, &room_settings) {
            debug!(
                user_id = ?device.user_id(),
                device_id = ?device.device_id(),
                ?reason,
                "Received a key request that we won't serve",
            );
            return Ok(None);
        }

        info!(
            user_id = ?device.user_id(),
            device_id = ?device.device_id(),
            session_id = %key_info.session_id,
            room_id = ?key_info.room_id,
            "Serving a room key request",
        );

        match self.share_session(&session, &device).await {
            Ok(request) => Ok(Some(request)),
            Err(OlmError::NoOlmSessionAvailable(..)) => {
                info!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    "Can't serve a key request, no Olm session could be established"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn share_session(
        &self,
        session: &InboundGroupSession,
        device: &Device,
    ) -> OlmResult<ToDeviceRequest> {
        let content = serde_json::to_value(session.to_forwarded_content().await)?;
        let content =
            self.sessions.encrypt_for_device(device.data(), FORWARDED_ROOM_KEY, content).await?;

        let mut request = ToDeviceRequest::new(ROOM_ENCRYPTED);
        request.add_message(device.user_id(), device.device_id().to_owned(), content);

        Ok(request)
    }

    /// Check if it's ok to share a session with the given device.
    ///
    /// Sessions are only shared in full with our own devices that we
    /// verified, either locally or through cross-signing, and only if the
    /// room lets new members read its history.
    fn should_share_key(
        &self,
        device: &Device,
        session: &InboundGroupSession,
        key_info: &RequestedKeyInfo,
        room_settings: &RoomSettings,
    ) -> Result<(), KeyForwardDecision> {
        let visibility =
            room_settings.history_visibility.as_ref().or(session.history_visibility());
        let hides_history =
            matches!(visibility, Some(HistoryVisibility::Joined | HistoryVisibility::Invited));

        if device.user_id() != self.user_id() {
            Err(KeyForwardDecision::NotOwnDevice)
        } else if !device.is_verified() {
            Err(KeyForwardDecision::UntrustedDevice)
        } else if session.room_id() != &*key_info.room_id {
            Err(KeyForwardDecision::MismatchedRoom)
        } else if hides_history {
            Err(KeyForwardDecision::HistoryNotShared)
        } else {
            Ok(())
        }
    }
}
