// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! `ClientSession`, spec.md §4.1: the host-facing entry point that owns one
//! device's set of known endpoints and drives them through discovery,
//! authentication, connection, payload exchange, and bandwidth upgrade.
//! Built the way the teacher wires its own connection-level state machine
//! to the endpoint manager below it: one long-lived `Arc`, constructed with
//! `Arc::new_cyclic` so the listener adapters it hands down to
//! `EndpointManager`/`PayloadManager`/`UpgradeEngine` can hold a `Weak` back
//! to it.

use crate::endpoint::{ConnectionState, Endpoint};
use crate::listener::{ConnectionListener, DiscoveryListener, PayloadListener as HostPayloadListener};
use crate::payload::IncomingPayload;
use crate::router::Router;
use crate::status::Status;
use crate::strategy::Strategy;

use nearby_core::random::{Generator, OsGenerator};
use nearby_core::time::{Clock, MonotonicClock};
use nearby_core::{Limits, Medium, Role};
use nearby_crypto::derive_upgrade_cipher;
use nearby_transport::frame::{
    ConnectionRequest, ConnectionResponse, ControlEvent, Frame, PayloadHeader, UpgradePathInfo,
};
use nearby_transport::medium::{BoxedStream, DiscoveryEvent, DiscoverySink, MediumDriver};
use nearby_transport::{
    run_initiator, run_responder, Channel, DisconnectListener, EndpointManager, FrameProcessor,
    FrameType, IncomingEvent, Payload, PayloadListener as TransportPayloadListener,
    PayloadManager, SendEvent, UpgradeEngine, UpgradeListener, UpgradeOutcome,
};

use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CONNECTION_RESPONSE_ACCEPTED: i32 = 0;
const CONNECTION_RESPONSE_REJECTED: i32 = 1;

/// Bridges `nearby_transport`'s process-wide listener traits back onto the
/// `ClientSession` they were built for. Held by a `Weak` reference so the
/// engines below it don't keep the session alive past the last `Arc`.
struct ListenerAdapter {
    session: Weak<ClientSession>,
}

#[async_trait::async_trait]
impl DisconnectListener for ListenerAdapter {
    async fn on_endpoint_disconnected(&self, endpoint_id: &str, notify: bool) {
        if let Some(session) = self.session.upgrade() {
            session.handle_endpoint_disconnected(endpoint_id, notify).await;
        }
    }
}

#[async_trait::async_trait]
impl TransportPayloadListener for ListenerAdapter {
    async fn on_payload_started(&self, endpoint_id: &str, header: PayloadHeader) {
        if let Some(session) = self.session.upgrade() {
            session.handle_payload_started(endpoint_id, header).await;
        }
    }

    async fn on_payload_chunk(&self, endpoint_id: &str, payload_id: i64, event: IncomingEvent) {
        if let Some(session) = self.session.upgrade() {
            session.handle_payload_chunk(endpoint_id, payload_id, event).await;
        }
    }

    async fn on_remote_status(&self, endpoint_id: &str, payload_id: i64, event: ControlEvent) {
        if let Some(session) = self.session.upgrade() {
            session.handle_remote_status(endpoint_id, payload_id, event).await;
        }
    }

    async fn on_send_update(&self, endpoint_id: &str, payload_id: i64, event: SendEvent) {
        if let Some(session) = self.session.upgrade() {
            session.handle_send_update(endpoint_id, payload_id, event).await;
        }
    }
}

#[async_trait::async_trait]
impl UpgradeListener for ListenerAdapter {
    async fn on_upgrade_outcome(&self, endpoint_id: &str, outcome: UpgradeOutcome) {
        if let Some(session) = self.session.upgrade() {
            session.handle_upgrade_outcome(endpoint_id, outcome).await;
        }
    }

    async fn on_upgrade_path_available(&self, endpoint_id: &str, info: UpgradePathInfo) {
        if let Some(session) = self.session.upgrade() {
            let endpoint_id = endpoint_id.to_string();
            tokio::spawn(async move {
                session.handle_upgrade_path_available(&endpoint_id, info).await;
            });
        }
    }
}

struct AdvertisingState {
    service_id: String,
    driver: Arc<dyn MediumDriver>,
    listener: Arc<dyn ConnectionListener>,
    accept_task: JoinHandle<()>,
}

struct DiscoveryState {
    service_id: String,
    driver: Arc<dyn MediumDriver>,
}

struct DiscoverySinkAdapter {
    session: Weak<ClientSession>,
    service_id: String,
    medium: Medium,
    listener: Arc<dyn DiscoveryListener>,
}

#[async_trait::async_trait]
impl DiscoverySink for DiscoverySinkAdapter {
    async fn on_discovery_event(&self, _service_id: &str, event: DiscoveryEvent) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match event {
            DiscoveryEvent::Found { medium, advertisement } => {
                let Some((endpoint_id, endpoint_info)) = split_advertisement(&advertisement) else {
                    warn!("discovered advertisement too short to carry an endpoint id");
                    return;
                };
                session
                    .handle_endpoint_found(&self.service_id, &endpoint_id, endpoint_info, medium)
                    .await;
                self.listener.on_endpoint_found(&endpoint_id, endpoint_info, medium).await;
            }
            DiscoveryEvent::Lost { advertisement } => {
                let Some((endpoint_id, _)) = split_advertisement(&advertisement) else {
                    return;
                };
                session.handle_endpoint_lost(&endpoint_id).await;
                self.listener.on_endpoint_lost(&endpoint_id).await;
            }
        }
    }
}

/// spec.md §GLOSSARY convention: an advertisement is the advertiser's
/// 4-character endpoint id followed by its opaque endpoint info.
const ENDPOINT_ID_LEN: usize = 4;

fn split_advertisement(advertisement: &[u8]) -> Option<(String, &[u8])> {
    if advertisement.len() < ENDPOINT_ID_LEN {
        return None;
    }
    let (id_bytes, info) = advertisement.split_at(ENDPOINT_ID_LEN);
    let endpoint_id = std::str::from_utf8(id_bytes).ok()?.to_string();
    Some((endpoint_id, info))
}

/// One device's set of known endpoints and the strategy/medium plumbing
/// that gets them connected, spec.md §4.1.
pub struct ClientSession {
    client_id: u64,
    router: Arc<Router>,
    limits: Limits,
    clock: Arc<dyn Clock>,
    endpoint_manager: Arc<EndpointManager>,
    payload_manager: Arc<PayloadManager>,
    upgrade_engine: Arc<UpgradeEngine>,
    endpoints: tokio::sync::RwLock<HashMap<String, Endpoint>>,
    strategy: tokio::sync::RwLock<Option<Strategy>>,
    advertising: tokio::sync::RwLock<Option<AdvertisingState>>,
    discovery: tokio::sync::RwLock<Option<DiscoveryState>>,
    /// Mediums this session can dial for a bandwidth upgrade, registered by
    /// the host alongside `initiate_bandwidth_upgrade` and reused when the
    /// peer offers an upgrade path of its own.
    upgrade_drivers: tokio::sync::RwLock<HashMap<Medium, Arc<dyn MediumDriver>>>,
    local_endpoint_id: tokio::sync::RwLock<Option<String>>,
}

impl ClientSession {
    /// Builds and fully wires a new session sharing `router`'s strategy gate.
    pub async fn new(router: Arc<Router>) -> Arc<Self> {
        Self::with_limits(router, Limits::default()).await
    }

    pub async fn with_limits(router: Arc<Router>, limits: Limits) -> Arc<Self> {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        let mut generator = OsGenerator;
        let client_id = generator.next_u64();

        let session = Arc::new_cyclic(|weak: &Weak<ClientSession>| {
            let adapter = Arc::new(ListenerAdapter { session: weak.clone() });
            let endpoint_manager = EndpointManager::new(limits, clock.clone(), adapter.clone());
            let payload_manager =
                PayloadManager::new(limits, endpoint_manager.clone(), adapter.clone());
            let upgrade_engine =
                UpgradeEngine::new(limits, clock.clone(), endpoint_manager.clone(), adapter);

            ClientSession {
                client_id,
                router,
                limits,
                clock,
                endpoint_manager,
                payload_manager,
                upgrade_engine,
                endpoints: tokio::sync::RwLock::new(HashMap::new()),
                strategy: tokio::sync::RwLock::new(None),
                advertising: tokio::sync::RwLock::new(None),
                discovery: tokio::sync::RwLock::new(None),
                upgrade_drivers: tokio::sync::RwLock::new(HashMap::new()),
                local_endpoint_id: tokio::sync::RwLock::new(None),
            }
        });
        session.attach().await;
        session
    }

    async fn attach(self: &Arc<Self>) {
        self.endpoint_manager
            .register_processor(FrameType::ConnectionRequest, self.clone())
            .await;
        self.endpoint_manager
            .register_processor(FrameType::ConnectionResponse, self.clone())
            .await;
        self.payload_manager.attach().await;
        self.upgrade_engine.attach().await;
    }

    /// spec.md §4.1's `GetLocalEndpointId`: generated lazily from a random
    /// per-session client id, and cleared once the session has no endpoints
    /// and isn't advertising or discovering.
    pub async fn get_local_endpoint_id(&self) -> Option<String> {
        {
            let existing = self.local_endpoint_id.read().await;
            if let Some(id) = existing.as_ref() {
                return Some(id.clone());
            }
        }
        let id = derive_local_endpoint_id(self.client_id);
        *self.local_endpoint_id.write().await = Some(id.clone());
        Some(id)
    }

    /// The endpoint ids this session currently knows about, in any state
    /// from `Discovered` through `Connected`. Mainly useful to a host (or a
    /// test) driving the responder side of a connection, which otherwise has
    /// no way to learn the inbound endpoint id `accept_connection` needs
    /// until a `ConnectionListener::on_connection_initiated` callback fires.
    pub async fn known_endpoint_ids(&self) -> Vec<String> {
        self.endpoints.read().await.keys().cloned().collect()
    }

    async fn maybe_clear_local_endpoint_id(&self) {
        let idle = self.endpoints.read().await.is_empty()
            && self.advertising.read().await.is_none()
            && self.discovery.read().await.is_none();
        if idle {
            *self.local_endpoint_id.write().await = None;
        }
    }

    fn generate_nonce() -> i32 {
        let mut bytes = [0u8; 4];
        OsGenerator.public_random_fill(&mut bytes);
        i32::from_le_bytes(bytes)
    }

    fn build_connection_request(&self, endpoint_id: String, endpoint_info: Vec<u8>) -> ConnectionRequest {
        ConnectionRequest {
            endpoint_id,
            endpoint_info,
            nonce: Self::generate_nonce(),
            supports_5_ghz: false,
            bssid: String::new(),
            mediums: Vec::new(),
            keep_alive_interval_ms: self.limits.keep_alive_interval.as_millis() as u32,
            keep_alive_timeout_ms: self.limits.keep_alive_read_timeout.as_millis() as u32,
        }
    }

    // ---- advertising / discovery -----------------------------------

    pub async fn start_advertising(
        self: &Arc<Self>,
        service_id: String,
        endpoint_info: Vec<u8>,
        strategy: Strategy,
        driver: Arc<dyn MediumDriver>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Status {
        if self.advertising.read().await.is_some() {
            return Status::AlreadyAdvertising;
        }
        let has_connected = !self.endpoints.read().await.is_empty();
        let acquired = self.router.acquire(self.client_id, strategy, has_connected).await;
        if !acquired.is_success() {
            return acquired;
        }
        *self.strategy.write().await = Some(strategy);

        let local_endpoint_id = self.get_local_endpoint_id().await.unwrap_or_default();
        let mut advertisement = local_endpoint_id.into_bytes();
        advertisement.extend_from_slice(&endpoint_info);

        if let Err(error) = driver.advertise(&service_id, &advertisement).await {
            warn!(%error, "failed to start advertising");
            self.router.release(self.client_id).await;
            return Status::Error;
        }

        let session = self.clone();
        let accept_driver = driver.clone();
        let accept_service_id = service_id.clone();
        let accept_listener = listener.clone();
        let accept_task = tokio::spawn(async move {
            session.accept_loop(accept_service_id, accept_driver, accept_listener).await;
        });

        *self.advertising.write().await = Some(AdvertisingState {
            service_id,
            driver,
            listener,
            accept_task,
        });
        Status::Success
    }

    pub async fn stop_advertising(&self) -> Status {
        let Some(state) = self.advertising.write().await.take() else {
            return Status::Success;
        };
        let _ = state.driver.stop_advertise(&state.service_id).await;
        let _ = state.driver.teardown(&state.service_id).await;
        state.accept_task.abort();
        self.router.release(self.client_id).await;
        self.maybe_clear_local_endpoint_id().await;
        Status::Success
    }

    async fn accept_loop(
        self: Arc<Self>,
        service_id: String,
        driver: Arc<dyn MediumDriver>,
        listener: Arc<dyn ConnectionListener>,
    ) {
        loop {
            match driver.accept(&service_id).await {
                Ok(accepted) => {
                    let session = self.clone();
                    let service_id = service_id.clone();
                    let listener = listener.clone();
                    tokio::spawn(async move {
                        session
                            .handle_inbound_stream(service_id, accepted.medium, accepted.stream, listener)
                            .await;
                    });
                }
                Err(error) => {
                    debug!(%error, "accept loop ending");
                    return;
                }
            }
        }
    }

    async fn handle_inbound_stream(
        self: Arc<Self>,
        service_id: String,
        medium: Medium,
        mut stream: BoxedStream,
        listener: Arc<dyn ConnectionListener>,
    ) {
        let handshake = tokio::time::timeout(
            self.limits.handshake_timeout,
            run_responder(&mut stream, &mut OsRng),
        )
        .await;
        let output = match handshake {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                warn!(%error, "inbound handshake failed");
                return;
            }
            Err(_) => {
                warn!("inbound handshake timed out");
                return;
            }
        };

        let cipher = output.cipher.swapped();
        let channel = Arc::new(Channel::new(medium, stream, cipher, self.clock.as_ref()));

        let first_frame = channel.read_frame(self.clock.as_ref()).await;
        let request = match first_frame {
            Ok(Frame::ConnectionRequest(request)) => request,
            Ok(other) => {
                warn!(frame = other.name(), "expected CONNECTION_REQUEST first");
                return;
            }
            Err(error) => {
                warn!(%error, "failed to read CONNECTION_REQUEST");
                return;
            }
        };
        let endpoint_id = request.endpoint_id.clone();

        let allowed = {
            let strategy = self.strategy.read().await;
            let current = self.endpoints.read().await.len();
            strategy.map(|s| s.allows_additional_connection(current)).unwrap_or(true)
        };
        if !allowed {
            let _ = channel
                .write_frame(
                    &Frame::ConnectionResponse(ConnectionResponse {
                        status: CONNECTION_RESPONSE_REJECTED,
                    }),
                    self.clock.as_ref(),
                )
                .await;
            return;
        }

        let already_connected = matches!(
            self.endpoints.read().await.get(&endpoint_id).map(|e| e.state),
            Some(ConnectionState::Connected)
        );
        if already_connected {
            warn!(endpoint_id, "rejecting inbound CONNECTION_REQUEST for an already-connected endpoint");
            let _ = channel
                .write_frame(
                    &Frame::ConnectionResponse(ConnectionResponse {
                        status: CONNECTION_RESPONSE_REJECTED,
                    }),
                    self.clock.as_ref(),
                )
                .await;
            return;
        }

        let mut endpoint = Endpoint::new_discovered(
            endpoint_id.clone(),
            request.endpoint_info.clone(),
            medium,
            service_id.clone(),
        );
        endpoint.direction = Role::Responder;
        endpoint.state = ConnectionState::Pending;
        endpoint.raw_auth_token = output.raw_auth_token;
        endpoint.human_readable_token = output.human_readable_token.clone();
        endpoint.connection_listener = Some(listener.clone());
        self.endpoints.write().await.insert(endpoint_id.clone(), endpoint);

        self.endpoint_manager.register_endpoint(endpoint_id.clone(), channel).await;

        let local_endpoint_id = self.get_local_endpoint_id().await.unwrap_or_default();
        let our_request = self.build_connection_request(local_endpoint_id, Vec::new());
        if self
            .endpoint_manager
            .send_frame(&endpoint_id, &Frame::ConnectionRequest(our_request))
            .await
            .is_err()
        {
            warn!(endpoint_id, "failed to send our CONNECTION_REQUEST");
            self.endpoint_manager.disconnect(&endpoint_id).await;
            return;
        }

        listener
            .on_connection_initiated(&endpoint_id, &request.endpoint_info, &output.human_readable_token)
            .await;
    }

    pub async fn start_discovery(
        self: &Arc<Self>,
        service_id: String,
        strategy: Strategy,
        driver: Arc<dyn MediumDriver>,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Status {
        if self.discovery.read().await.is_some() {
            return Status::AlreadyDiscovering;
        }
        let has_connected = !self.endpoints.read().await.is_empty();
        let acquired = self.router.acquire(self.client_id, strategy, has_connected).await;
        if !acquired.is_success() {
            return acquired;
        }
        *self.strategy.write().await = Some(strategy);

        let sink = Arc::new(DiscoverySinkAdapter {
            session: Arc::downgrade(self),
            service_id: service_id.clone(),
            medium: driver.medium(),
            listener,
        });
        if let Err(error) = driver.discover(&service_id, sink).await {
            warn!(%error, "failed to start discovery");
            self.router.release(self.client_id).await;
            return Status::Error;
        }

        *self.discovery.write().await = Some(DiscoveryState { service_id, driver });
        Status::Success
    }

    pub async fn stop_discovery(&self) -> Status {
        let Some(state) = self.discovery.write().await.take() else {
            return Status::Success;
        };
        let _ = state.driver.stop_discover(&state.service_id).await;
        self.router.release(self.client_id).await;
        self.maybe_clear_local_endpoint_id().await;
        Status::Success
    }

    async fn handle_endpoint_found(
        &self,
        service_id: &str,
        endpoint_id: &str,
        endpoint_info: &[u8],
        medium: Medium,
    ) {
        let mut endpoints = self.endpoints.write().await;
        endpoints.entry(endpoint_id.to_string()).or_insert_with(|| {
            Endpoint::new_discovered(
                endpoint_id.to_string(),
                endpoint_info.to_vec(),
                medium,
                service_id.to_string(),
            )
        });
    }

    async fn handle_endpoint_lost(&self, endpoint_id: &str) {
        let mut endpoints = self.endpoints.write().await;
        if matches!(
            endpoints.get(endpoint_id).map(|e| e.state),
            Some(ConnectionState::Discovered)
        ) {
            endpoints.remove(endpoint_id);
        }
    }

    /// spec.md §9's restricted `InjectEndpoint`: Bluetooth only, a 6-byte
    /// MAC, and a 4-character endpoint id — see DESIGN.md.
    pub async fn inject_endpoint(
        &self,
        service_id: &str,
        endpoint_id: String,
        endpoint_info: Vec<u8>,
        _mac: [u8; 6],
    ) -> Status {
        if endpoint_id.len() != ENDPOINT_ID_LEN {
            return Status::Error;
        }
        let mut endpoints = self.endpoints.write().await;
        endpoints.entry(endpoint_id.clone()).or_insert_with(|| {
            Endpoint::new_discovered(
                endpoint_id,
                endpoint_info,
                Medium::BluetoothClassic,
                service_id.to_string(),
            )
        });
        Status::Success
    }

    // ---- connecting --------------------------------------------------

    pub async fn request_connection(
        self: &Arc<Self>,
        endpoint_id: &str,
        local_endpoint_info: Vec<u8>,
        driver: Arc<dyn MediumDriver>,
        connection_listener: Arc<dyn ConnectionListener>,
        payload_listener: Arc<dyn HostPayloadListener>,
    ) -> Status {
        let (service_id, medium) = {
            let mut endpoints = self.endpoints.write().await;
            let Some(endpoint) = endpoints.get_mut(endpoint_id) else {
                return Status::EndpointUnknown;
            };
            match endpoint.state {
                ConnectionState::Discovered => {}
                ConnectionState::Connected => return Status::AlreadyConnectedToEndpoint,
                _ => return Status::AlreadyConnecting,
            }
            endpoint.state = ConnectionState::Requesting;
            endpoint.direction = Role::Initiator;
            endpoint.connection_listener = Some(connection_listener.clone());
            endpoint.payload_listener = Some(payload_listener.clone());
            (endpoint.service_id.clone(), endpoint.medium)
        };

        let session = self.clone();
        let endpoint_id = endpoint_id.to_string();
        tokio::spawn(async move {
            session
                .dial_endpoint(endpoint_id, service_id, medium, driver, local_endpoint_info, connection_listener)
                .await;
        });
        Status::Success
    }

    async fn dial_endpoint(
        self: Arc<Self>,
        endpoint_id: String,
        service_id: String,
        medium: Medium,
        driver: Arc<dyn MediumDriver>,
        local_endpoint_info: Vec<u8>,
        listener: Arc<dyn ConnectionListener>,
    ) {
        let mut stream = match driver.connect(&endpoint_id, &service_id).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(endpoint_id, %error, "failed to dial endpoint");
                listener.on_connection_result(&endpoint_id, Status::EndpointIoError).await;
                self.drop_endpoint(&endpoint_id).await;
                return;
            }
        };

        let handshake = tokio::time::timeout(
            self.limits.handshake_timeout,
            run_initiator(&mut stream, &mut OsRng),
        )
        .await;
        let output = match handshake {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                warn!(endpoint_id, %error, "outbound handshake failed");
                listener.on_connection_result(&endpoint_id, Status::AuthError).await;
                self.drop_endpoint(&endpoint_id).await;
                return;
            }
            Err(_) => {
                warn!(endpoint_id, "outbound handshake timed out");
                listener.on_connection_result(&endpoint_id, Status::EndpointIoError).await;
                self.drop_endpoint(&endpoint_id).await;
                return;
            }
        };

        let channel = Arc::new(Channel::new(medium, stream, output.cipher, self.clock.as_ref()));
        self.endpoint_manager.register_endpoint(endpoint_id.clone(), channel).await;

        let local_endpoint_id = self.get_local_endpoint_id().await.unwrap_or_default();
        let request = self.build_connection_request(local_endpoint_id, local_endpoint_info);
        if self
            .endpoint_manager
            .send_frame(&endpoint_id, &Frame::ConnectionRequest(request))
            .await
            .is_err()
        {
            warn!(endpoint_id, "failed to send CONNECTION_REQUEST");
            listener.on_connection_result(&endpoint_id, Status::EndpointIoError).await;
            self.endpoint_manager.disconnect(&endpoint_id).await;
            return;
        }

        let remote_endpoint_info = {
            let mut endpoints = self.endpoints.write().await;
            let Some(endpoint) = endpoints.get_mut(&endpoint_id) else {
                return;
            };
            endpoint.raw_auth_token = output.raw_auth_token;
            endpoint.human_readable_token = output.human_readable_token.clone();
            endpoint.endpoint_info.clone()
        };

        listener
            .on_connection_initiated(&endpoint_id, &remote_endpoint_info, &output.human_readable_token)
            .await;
    }

    async fn drop_endpoint(&self, endpoint_id: &str) {
        self.endpoints.write().await.remove(endpoint_id);
        self.maybe_clear_local_endpoint_id().await;
    }

    pub async fn accept_connection(
        &self,
        endpoint_id: &str,
        payload_listener: Arc<dyn HostPayloadListener>,
    ) -> Status {
        self.respond(endpoint_id, true, Some(payload_listener)).await
    }

    pub async fn reject_connection(&self, endpoint_id: &str) -> Status {
        self.respond(endpoint_id, false, None).await
    }

    async fn respond(
        &self,
        endpoint_id: &str,
        accept: bool,
        payload_listener: Option<Arc<dyn HostPayloadListener>>,
    ) -> Status {
        {
            let mut endpoints = self.endpoints.write().await;
            let Some(endpoint) = endpoints.get_mut(endpoint_id) else {
                return Status::EndpointUnknown;
            };
            if endpoint.response.local.is_some() {
                return Status::OutOfOrderApiCall("accept/reject already called for this endpoint");
            }
            endpoint.response.local = Some(accept);
            if let Some(payload_listener) = payload_listener {
                endpoint.payload_listener = Some(payload_listener);
            }
        }

        let status = if accept {
            CONNECTION_RESPONSE_ACCEPTED
        } else {
            CONNECTION_RESPONSE_REJECTED
        };
        if self
            .endpoint_manager
            .send_frame(endpoint_id, &Frame::ConnectionResponse(ConnectionResponse { status }))
            .await
            .is_err()
        {
            warn!(endpoint_id, "failed to send CONNECTION_RESPONSE");
        }

        self.evaluate_response(endpoint_id).await;
        Status::Success
    }

    async fn evaluate_response(&self, endpoint_id: &str) {
        enum Outcome {
            None,
            Connected(Arc<dyn ConnectionListener>),
            Rejected(Arc<dyn ConnectionListener>),
        }

        let outcome = {
            let mut endpoints = self.endpoints.write().await;
            let Some(endpoint) = endpoints.get_mut(endpoint_id) else {
                return;
            };
            if endpoint.response.both_accepted() {
                endpoint.state = ConnectionState::Connected;
                endpoint
                    .connection_listener
                    .clone()
                    .map(Outcome::Connected)
                    .unwrap_or(Outcome::None)
            } else if endpoint.response.either_rejected() {
                endpoint.state = ConnectionState::Disconnected;
                endpoint
                    .connection_listener
                    .clone()
                    .map(Outcome::Rejected)
                    .unwrap_or(Outcome::None)
            } else {
                Outcome::None
            }
        };

        match outcome {
            Outcome::Connected(listener) => {
                listener.on_connection_result(endpoint_id, Status::Success).await;
            }
            Outcome::Rejected(listener) => {
                listener.on_connection_result(endpoint_id, Status::ConnectionRejected).await;
                self.endpoint_manager.remove_endpoint(endpoint_id, false).await;
                self.endpoints.write().await.remove(endpoint_id);
                self.maybe_clear_local_endpoint_id().await;
            }
            Outcome::None => {}
        }
    }

    // ---- payloads ------------------------------------------------------

    pub async fn send_payload(&self, endpoint_ids: Vec<String>, payload: Payload) -> Status {
        {
            let endpoints = self.endpoints.read().await;
            for endpoint_id in &endpoint_ids {
                match endpoints.get(endpoint_id).map(|e| e.state) {
                    Some(ConnectionState::Connected) | Some(ConnectionState::Upgrading) => {}
                    _ => return Status::NotConnectedToEndpoint,
                }
            }
        }
        self.payload_manager.send(endpoint_ids, payload).await;
        Status::Success
    }

    pub async fn cancel_payload(&self, payload_id: i64) -> Status {
        self.payload_manager.cancel(payload_id).await;
        Status::Success
    }

    async fn handle_payload_started(&self, endpoint_id: &str, header: PayloadHeader) {
        let listener = self
            .endpoints
            .read()
            .await
            .get(endpoint_id)
            .and_then(|e| e.payload_listener.clone());
        if let Some(listener) = listener {
            listener
                .on_payload_started(endpoint_id, IncomingPayload::from_header(&header))
                .await;
        }
    }

    async fn handle_payload_chunk(&self, endpoint_id: &str, payload_id: i64, event: IncomingEvent) {
        let listener = self
            .endpoints
            .read()
            .await
            .get(endpoint_id)
            .and_then(|e| e.payload_listener.clone());
        if let Some(listener) = listener {
            listener.on_payload_chunk(endpoint_id, payload_id, event).await;
        }
    }

    async fn handle_remote_status(&self, endpoint_id: &str, payload_id: i64, event: ControlEvent) {
        let listener = self
            .endpoints
            .read()
            .await
            .get(endpoint_id)
            .and_then(|e| e.payload_listener.clone());
        if let Some(listener) = listener {
            listener.on_remote_status(endpoint_id, payload_id, event).await;
        }
    }

    async fn handle_send_update(&self, endpoint_id: &str, payload_id: i64, event: SendEvent) {
        let listener = self
            .endpoints
            .read()
            .await
            .get(endpoint_id)
            .and_then(|e| e.payload_listener.clone());
        if let Some(listener) = listener {
            listener.on_send_update(endpoint_id, payload_id, event).await;
        }
    }

    // ---- bandwidth upgrade ----------------------------------------------

    /// Makes `driver`'s medium available to accept an upgrade a peer offers,
    /// without this session having to propose one of its own first. A host
    /// that can serve a medium (e.g. it is already running a Wi-Fi LAN
    /// socket) calls this once up front so `handle_upgrade_path_available`
    /// has somewhere to accept the peer's dial.
    pub async fn register_upgrade_driver(&self, medium: Medium, driver: Arc<dyn MediumDriver>) {
        self.upgrade_drivers.write().await.insert(medium, driver);
    }

    /// spec.md §4.7: offers `driver`'s medium as an upgrade path for an
    /// already-connected endpoint. Returns immediately; the outcome is
    /// reported later via the endpoint's `ConnectionListener::on_bandwidth_changed`.
    pub async fn initiate_bandwidth_upgrade(
        self: &Arc<Self>,
        endpoint_id: &str,
        driver: Arc<dyn MediumDriver>,
        path_info: UpgradePathInfo,
    ) -> Status {
        let (raw_auth_token, service_id) = {
            let mut endpoints = self.endpoints.write().await;
            let Some(endpoint) = endpoints.get_mut(endpoint_id) else {
                return Status::EndpointUnknown;
            };
            if endpoint.state != ConnectionState::Connected {
                return Status::NotConnectedToEndpoint;
            }
            if !endpoint.medium.can_upgrade_to(path_info.medium) {
                return Status::Unsupported;
            }
            endpoint.state = ConnectionState::Upgrading;
            (endpoint.raw_auth_token, endpoint.service_id.clone())
        };

        self.upgrade_drivers.write().await.insert(path_info.medium, driver.clone());
        let cipher = derive_upgrade_cipher(&raw_auth_token, path_info.medium.wire_tag());

        let engine = self.upgrade_engine.clone();
        let endpoint_id = endpoint_id.to_string();
        tokio::spawn(async move {
            engine.initiate(&endpoint_id, driver.as_ref(), &service_id, path_info, cipher).await;
        });
        Status::Success
    }

    async fn handle_upgrade_path_available(&self, endpoint_id: &str, info: UpgradePathInfo) {
        let raw_auth_token = {
            let mut endpoints = self.endpoints.write().await;
            let Some(endpoint) = endpoints.get_mut(endpoint_id) else {
                return;
            };
            endpoint.state = ConnectionState::Upgrading;
            endpoint.raw_auth_token
        };

        let driver = self.upgrade_drivers.read().await.get(&info.medium).cloned();
        let Some(driver) = driver else {
            info!(endpoint_id, medium = ?info.medium, "no driver registered for offered upgrade medium, ignoring");
            return;
        };
        let service_id = {
            let endpoints = self.endpoints.read().await;
            endpoints.get(endpoint_id).map(|e| e.service_id.clone())
        };
        let Some(service_id) = service_id else {
            return;
        };

        // the initiator dials the new medium from `UpgradeEngine::initiate`;
        // this side accepts that connection rather than dialing one of its
        // own, same as the raw engine's initiate/accept_upgrade pairing.
        let accepted = match driver.accept(&service_id).await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(endpoint_id, %error, "failed to accept peer's offered upgrade medium");
                return;
            }
        };
        let cipher = derive_upgrade_cipher(&raw_auth_token, info.medium.wire_tag()).swapped();
        self.upgrade_engine
            .accept_upgrade(endpoint_id, info.medium, accepted.stream, cipher)
            .await;
    }

    async fn handle_upgrade_outcome(&self, endpoint_id: &str, outcome: UpgradeOutcome) {
        let listener = {
            let mut endpoints = self.endpoints.write().await;
            let Some(endpoint) = endpoints.get_mut(endpoint_id) else {
                return;
            };
            endpoint.state = ConnectionState::Connected;
            if let UpgradeOutcome::Succeeded { medium } = outcome {
                endpoint.medium = medium;
                endpoint.upgrade_mediums.push(medium);
            }
            endpoint.connection_listener.clone()
        };
        if let (Some(listener), UpgradeOutcome::Succeeded { medium }) = (listener, outcome) {
            listener.on_bandwidth_changed(endpoint_id, medium).await;
        }
    }

    // ---- teardown --------------------------------------------------------

    pub async fn disconnect_from_endpoint(&self, endpoint_id: &str) -> Status {
        if !self.endpoint_manager.is_registered(endpoint_id).await {
            return Status::NotConnectedToEndpoint;
        }
        self.endpoint_manager.disconnect(endpoint_id).await;
        Status::Success
    }

    pub async fn stop_all_endpoints(&self) -> Status {
        let endpoint_ids: Vec<String> = self.endpoints.read().await.keys().cloned().collect();
        for endpoint_id in endpoint_ids {
            self.endpoint_manager.disconnect(&endpoint_id).await;
        }
        Status::Success
    }

    async fn handle_endpoint_disconnected(&self, endpoint_id: &str, notify: bool) {
        let listener = self.endpoints.write().await.remove(endpoint_id).and_then(|e| e.connection_listener);
        if notify {
            if let Some(listener) = listener {
                listener.on_disconnected(endpoint_id).await;
            }
        }
        self.maybe_clear_local_endpoint_id().await;
    }

    /// Detaches this session from its shared [`Router`] and tears down
    /// every endpoint and listening activity, spec.md §4.1.
    pub async fn detach_client(&self) -> Status {
        self.stop_advertising().await;
        self.stop_discovery().await;
        self.stop_all_endpoints().await;
        self.router.release(self.client_id).await;
        Status::Success
    }
}

#[async_trait::async_trait]
impl FrameProcessor for ClientSession {
    async fn process(&self, endpoint_id: &str, frame: Frame) {
        match frame {
            Frame::ConnectionRequest(request) => {
                let mut endpoints = self.endpoints.write().await;
                if let Some(endpoint) = endpoints.get_mut(endpoint_id) {
                    if endpoint.endpoint_info.is_empty() {
                        endpoint.endpoint_info = request.endpoint_info;
                    }
                    if endpoint.state == ConnectionState::Requesting {
                        endpoint.state = ConnectionState::Pending;
                    }
                }
                drop(endpoints);
            }
            Frame::ConnectionResponse(response) => {
                {
                    let mut endpoints = self.endpoints.write().await;
                    if let Some(endpoint) = endpoints.get_mut(endpoint_id) {
                        endpoint.response.remote = Some(response.status == CONNECTION_RESPONSE_ACCEPTED);
                    }
                }
                self.evaluate_response(endpoint_id).await;
            }
            _ => {}
        }
    }

    async fn on_endpoint_disconnect(&self, _endpoint_id: &str) {}
}

/// spec.md §GLOSSARY: "exactly 4 characters from the first 4 bytes of a
/// base64 encoding of SHA-256('client' || random_int64)". `client_id` is
/// the per-session random id generated once in [`ClientSession::new`].
fn derive_local_endpoint_id(client_id: u64) -> String {
    use base64::Engine;
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(b"client");
    hasher.update(client_id.to_le_bytes());
    let digest = hasher.finalize();

    let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    encoded[..ENDPOINT_ID_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_endpoint_id_is_four_characters() {
        let id = derive_local_endpoint_id(42);
        assert_eq!(id.len(), ENDPOINT_ID_LEN);
    }

    #[test]
    fn local_endpoint_id_is_deterministic_per_client_id() {
        assert_eq!(derive_local_endpoint_id(7), derive_local_endpoint_id(7));
        assert_ne!(derive_local_endpoint_id(7), derive_local_endpoint_id(8));
    }

    #[test]
    fn split_advertisement_parses_endpoint_id_and_info() {
        let mut advertisement = b"ABCD".to_vec();
        advertisement.extend_from_slice(b"phone");
        let (endpoint_id, info) = split_advertisement(&advertisement).unwrap();
        assert_eq!(endpoint_id, "ABCD");
        assert_eq!(info, b"phone");
    }

    #[test]
    fn split_advertisement_rejects_short_input() {
        assert!(split_advertisement(b"AB").is_none());
    }
}
