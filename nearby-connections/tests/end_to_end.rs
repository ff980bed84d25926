// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end coverage for [`nearby_connections::ClientSession`], pairing
//! two in-process sessions over `nearby_transport::medium::memory` the way
//! `nearby-transport`'s own test modules pair a `Channel` over a duplex pipe,
//! but one layer up: through the host-facing advertise/discover/connect API.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use nearby_connections::{
    ClientSession, ConnectionListener, DiscoveryListener, IncomingPayload, PayloadListener, Router,
    Status, Strategy,
};
use nearby_core::{Limits, Medium};
use nearby_transport::frame::{ControlEvent, Credentials, UpgradePathInfo};
use nearby_transport::medium::memory::Network;
use nearby_transport::medium::MediumDriver;
use nearby_transport::{IncomingEvent, Payload, SendEvent};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

/// Records every callback a host would receive for one endpoint, with a
/// `Notify` per event so tests can await a specific callback instead of
/// polling or sleeping.
#[derive(Default)]
struct Recorder {
    initiated: AtomicBool,
    connected: AtomicBool,
    rejected: AtomicBool,
    disconnected: AtomicBool,
    bandwidth_changed: AtomicUsize,
    payload_started: AtomicBool,
    payload_complete: AtomicBool,
    payload_canceled: AtomicBool,
    send_success: AtomicBool,
    send_canceled: AtomicBool,
    send_failure: AtomicBool,
    chunks: StdMutex<Vec<Vec<u8>>>,
    bytes_transferred: AtomicI64,
    on_connected: Notify,
    on_rejected: Notify,
    on_disconnected: Notify,
    on_bandwidth_changed: Notify,
    on_payload_complete: Notify,
    on_payload_chunk: Notify,
    on_payload_canceled: Notify,
    on_send_success: Notify,
    on_send_canceled: Notify,
    on_send_failure: Notify,
}

#[async_trait::async_trait]
impl ConnectionListener for Recorder {
    async fn on_connection_initiated(&self, _endpoint_id: &str, _endpoint_info: &[u8], _token: &str) {
        self.initiated.store(true, Ordering::SeqCst);
    }

    async fn on_connection_result(&self, _endpoint_id: &str, status: Status) {
        if status.is_success() {
            self.connected.store(true, Ordering::SeqCst);
            self.on_connected.notify_waiters();
        } else {
            self.rejected.store(true, Ordering::SeqCst);
            self.on_rejected.notify_waiters();
        }
    }

    async fn on_bandwidth_changed(&self, _endpoint_id: &str, _medium: Medium) {
        self.bandwidth_changed.fetch_add(1, Ordering::SeqCst);
        self.on_bandwidth_changed.notify_waiters();
    }

    async fn on_disconnected(&self, _endpoint_id: &str) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.on_disconnected.notify_waiters();
    }
}

#[async_trait::async_trait]
impl DiscoveryListener for Recorder {
    async fn on_endpoint_found(&self, _endpoint_id: &str, _endpoint_info: &[u8], _medium: Medium) {}
    async fn on_endpoint_lost(&self, _endpoint_id: &str) {}
}

#[async_trait::async_trait]
impl PayloadListener for Recorder {
    async fn on_payload_started(&self, _endpoint_id: &str, _payload: IncomingPayload) {
        self.payload_started.store(true, Ordering::SeqCst);
    }

    async fn on_payload_chunk(&self, _endpoint_id: &str, _payload_id: i64, event: IncomingEvent) {
        match event {
            IncomingEvent::Chunk(bytes) => {
                self.chunks.lock().unwrap().push(bytes);
                self.on_payload_chunk.notify_waiters();
            }
            IncomingEvent::Complete => {
                self.payload_complete.store(true, Ordering::SeqCst);
                self.on_payload_complete.notify_waiters();
            }
            IncomingEvent::Canceled => {
                self.payload_canceled.store(true, Ordering::SeqCst);
                self.on_payload_canceled.notify_waiters();
            }
        }
    }

    async fn on_remote_status(&self, _endpoint_id: &str, _payload_id: i64, _event: ControlEvent) {}

    async fn on_send_update(&self, _endpoint_id: &str, _payload_id: i64, event: SendEvent) {
        match event {
            SendEvent::Success => {
                self.send_success.store(true, Ordering::SeqCst);
                self.on_send_success.notify_waiters();
            }
            SendEvent::Canceled => {
                self.send_canceled.store(true, Ordering::SeqCst);
                self.on_send_canceled.notify_waiters();
            }
            SendEvent::Failure => {
                self.send_failure.store(true, Ordering::SeqCst);
                self.on_send_failure.notify_waiters();
            }
            SendEvent::Progress { bytes_transferred } => {
                self.bytes_transferred.store(bytes_transferred, Ordering::SeqCst);
            }
        }
    }
}

async fn await_notified(notify: &Notify) {
    tokio::time::timeout(Duration::from_secs(5), notify.notified())
        .await
        .expect("event did not fire in time");
}

/// Discovers the one endpoint a peer is advertising and returns its id.
async fn discover_one(network: &Network, service_id: &str) -> String {
    let medium = network.medium(Medium::Ble);
    let mut events = medium.subscribe(service_id);
    match tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("discovery timed out")
        .expect("discovery channel closed")
    {
        nearby_transport::medium::DiscoveryEvent::Found { advertisement, .. } => {
            String::from_utf8(advertisement[..4].to_vec()).unwrap()
        }
        other => panic!("unexpected discovery event: {other:?}"),
    }
}

/// Advertises on one session, discovers and requests from the other, accepts
/// on the first, and waits for both sides to report `Connected`. Returns the
/// two sessions plus each side's recorder so a test can drive payloads or a
/// bandwidth upgrade on top of an established connection.
async fn connect_pair() -> (
    Arc<ClientSession>,
    Arc<Recorder>,
    Arc<ClientSession>,
    Arc<Recorder>,
) {
    connect_pair_with_limits(Limits::default()).await
}

async fn connect_pair_with_limits(
    limits: Limits,
) -> (
    Arc<ClientSession>,
    Arc<Recorder>,
    Arc<ClientSession>,
    Arc<Recorder>,
) {
    let network = Network::new();
    let advertiser_medium = Arc::new(network.medium(Medium::Ble));
    let discoverer_medium = Arc::new(network.medium(Medium::Ble));

    let router_a = Router::new();
    let session_a = ClientSession::with_limits(router_a, limits).await;
    let recorder_a = Arc::new(Recorder::default());

    let status = session_a
        .start_advertising(
            "com.example.chat".to_string(),
            b"phone-a".to_vec(),
            Strategy::P2pCluster,
            advertiser_medium,
            recorder_a.clone(),
        )
        .await;
    assert!(status.is_success(), "advertising failed: {status:?}");

    let endpoint_id = discover_one(&network, "com.example.chat").await;

    let router_b = Router::new();
    let session_b = ClientSession::with_limits(router_b, limits).await;
    let recorder_b = Arc::new(Recorder::default());

    session_b
        .inject_endpoint(
            "com.example.chat",
            endpoint_id.clone(),
            b"phone-a".to_vec(),
            [0u8; 6],
        )
        .await;

    let status = session_b
        .request_connection(
            &endpoint_id,
            b"phone-b".to_vec(),
            discoverer_medium,
            recorder_b.clone(),
            recorder_b.clone(),
        )
        .await;
    assert!(status.is_success(), "request_connection failed: {status:?}");

    // Wait until session B's CONNECTION_REQUEST arrives on A and A learns the
    // remote endpoint id it should accept.
    let remote_on_a = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ids: Vec<String> = session_a.known_endpoint_ids().await;
            if let Some(id) = ids.into_iter().next() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session A never saw an inbound endpoint");

    let status = session_a
        .accept_connection(&remote_on_a, recorder_a.clone())
        .await;
    assert!(status.is_success(), "accept_connection failed: {status:?}");

    let status = session_b.accept_connection(&endpoint_id, recorder_b.clone()).await;
    assert!(status.is_success(), "accept_connection (b) failed: {status:?}");

    await_notified(&recorder_a.on_connected).await;
    await_notified(&recorder_b.on_connected).await;
    assert!(recorder_a.initiated.load(Ordering::SeqCst));
    assert!(recorder_b.initiated.load(Ordering::SeqCst));

    (session_a, recorder_a, session_b, recorder_b)
}

#[tokio::test]
async fn advertise_discover_connect_round_trip() {
    let (session_a, recorder_a, session_b, recorder_b) = connect_pair().await;
    assert!(recorder_a.connected.load(Ordering::SeqCst));
    assert!(recorder_b.connected.load(Ordering::SeqCst));
    session_a.detach_client().await;
    session_b.detach_client().await;
}

#[tokio::test]
async fn rejecting_a_connection_notifies_both_sides() {
    let network = Network::new();
    let medium_a = Arc::new(network.medium(Medium::Ble));
    let medium_b = Arc::new(network.medium(Medium::Ble));

    let router_a = Router::new();
    let session_a = ClientSession::new(router_a).await;
    let recorder_a = Arc::new(Recorder::default());
    session_a
        .start_advertising(
            "svc".to_string(),
            b"a".to_vec(),
            Strategy::P2pCluster,
            medium_a,
            recorder_a.clone(),
        )
        .await;

    let endpoint_id = discover_one(&network, "svc").await;

    let router_b = Router::new();
    let session_b = ClientSession::new(router_b).await;
    let recorder_b = Arc::new(Recorder::default());
    session_b
        .inject_endpoint("svc", endpoint_id.clone(), b"a".to_vec(), [0u8; 6])
        .await;
    session_b
        .request_connection(&endpoint_id, b"b".to_vec(), medium_b, recorder_b.clone(), recorder_b.clone())
        .await;

    let remote_on_a = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(id) = session_a.known_endpoint_ids().await.into_iter().next() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    session_a.reject_connection(&remote_on_a).await;
    session_b.accept_connection(&endpoint_id, recorder_b.clone()).await;

    await_notified(&recorder_a.on_rejected).await;
    await_notified(&recorder_b.on_rejected).await;
    assert!(!recorder_a.connected.load(Ordering::SeqCst));
    assert!(!recorder_b.connected.load(Ordering::SeqCst));
}

#[tokio::test]
async fn payload_sent_from_one_side_arrives_complete_on_the_other() {
    let (session_a, _recorder_a, session_b, recorder_b) = connect_pair().await;

    let endpoint_id = session_a.known_endpoint_ids().await.into_iter().next().unwrap();
    let status = session_a
        .send_payload(vec![endpoint_id], Payload::bytes(1, b"hello from a".to_vec()))
        .await;
    assert!(status.is_success());

    await_notified(&recorder_b.on_payload_complete).await;
    assert!(recorder_b.payload_started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stream_payload_arrives_as_separate_chunks_and_completes() {
    let (session_a, _recorder_a, session_b, recorder_b) = connect_pair().await;
    let endpoint_id = session_a.known_endpoint_ids().await.into_iter().next().unwrap();

    let (mut writer, reader) = tokio::io::duplex(1024);
    let status = session_a
        .send_payload(vec![endpoint_id], Payload::stream(42, reader))
        .await;
    assert!(status.is_success());

    writer.write_all(b"message").await.unwrap();
    await_notified(&recorder_b.on_payload_chunk).await;
    assert_eq!(recorder_b.chunks.lock().unwrap().as_slice(), &[b"message".to_vec()]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    writer.write_all(b"second!").await.unwrap();
    let mut saw_both = false;
    for _ in 0..10 {
        await_notified(&recorder_b.on_payload_chunk).await;
        if recorder_b.chunks.lock().unwrap().len() == 2 {
            saw_both = true;
            break;
        }
    }
    assert!(saw_both, "second chunk never arrived");
    assert_eq!(
        recorder_b.chunks.lock().unwrap().as_slice(),
        &[b"message".to_vec(), b"second!".to_vec()]
    );

    writer.shutdown().await.unwrap();
    await_notified(&recorder_b.on_payload_complete).await;
}

#[tokio::test]
async fn receiver_can_cancel_a_payload_mid_stream() {
    let (session_a, recorder_a, session_b, recorder_b) = connect_pair().await;
    let endpoint_id = session_b.known_endpoint_ids().await.into_iter().next().unwrap();

    let (mut writer, reader) = tokio::io::duplex(1024);
    let status = session_b
        .send_payload(vec![endpoint_id], Payload::stream(7, reader))
        .await;
    assert!(status.is_success());

    writer.write_all(b"message").await.unwrap();
    await_notified(&recorder_a.on_payload_chunk).await;
    assert_eq!(recorder_a.chunks.lock().unwrap().as_slice(), &[b"message".to_vec()]);

    // the receiving side cancels a transfer it did not initiate; the
    // cancellation and its listener callback run synchronously here, so
    // there is nothing to await before checking the flag.
    let status = session_a.cancel_payload(7).await;
    assert!(status.is_success());
    assert!(recorder_a.payload_canceled.load(Ordering::SeqCst));

    // unblock the sender's blocked read so it notices the cancellation on
    // its next loop iteration instead of waiting forever.
    writer.write_all(b"never!!").await.unwrap();
    await_notified(&recorder_b.on_send_canceled).await;
    assert!(recorder_b.send_canceled.load(Ordering::SeqCst));
    assert!(!recorder_b.send_success.load(Ordering::SeqCst));
}

#[tokio::test]
async fn sender_can_cancel_a_payload_mid_stream() {
    let (session_a, recorder_a, session_b, recorder_b) = connect_pair().await;
    let endpoint_id = session_a.known_endpoint_ids().await.into_iter().next().unwrap();

    let (mut writer, reader) = tokio::io::duplex(1024);
    let status = session_a
        .send_payload(vec![endpoint_id], Payload::stream(9, reader))
        .await;
    assert!(status.is_success());

    writer.write_all(b"message").await.unwrap();
    await_notified(&recorder_b.on_payload_chunk).await;

    // the sending side cancels its own outgoing transfer.
    let status = session_a.cancel_payload(9).await;
    assert!(status.is_success());

    writer.write_all(b"never!!").await.unwrap();
    await_notified(&recorder_a.on_send_canceled).await;
    assert!(recorder_a.send_canceled.load(Ordering::SeqCst));

    await_notified(&recorder_b.on_payload_canceled).await;
    assert!(recorder_b.payload_canceled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn resumed_payload_starts_from_the_requested_offset() {
    let (session_a, _recorder_a, session_b, recorder_b) = connect_pair().await;
    let endpoint_id = session_a.known_endpoint_ids().await.into_iter().next().unwrap();

    let status = session_a
        .send_payload(
            vec![endpoint_id],
            Payload::bytes(11, b"message".to_vec()).with_offset(3),
        )
        .await;
    assert!(status.is_success());

    await_notified(&recorder_b.on_payload_complete).await;
    assert_eq!(recorder_b.chunks.lock().unwrap().as_slice(), &[b"sage".to_vec()]);
}

#[tokio::test]
async fn outbound_handshake_timeout_reports_connection_failure() {
    let network = Network::new();
    let medium_a = network.medium(Medium::Ble);
    let medium_b = Arc::new(network.medium(Medium::Ble));

    medium_a.advertise("svc", b"ABCD").await.unwrap();
    // accepts the inbound stream but never drives a handshake on it, and
    // holds it open rather than dropping it, so the initiator's attempt
    // genuinely times out waiting for a response instead of seeing the
    // stream reset.
    tokio::spawn(async move {
        let accepted = medium_a.accept("svc").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(accepted);
    });

    let limits = Limits::builder()
        .handshake_timeout(Duration::from_millis(100))
        .build();
    let router_b = Router::new();
    let session_b = ClientSession::with_limits(router_b, limits).await;
    let recorder_b = Arc::new(Recorder::default());

    session_b
        .inject_endpoint("svc", "ABCD".to_string(), b"a".to_vec(), [0u8; 6])
        .await;
    let status = session_b
        .request_connection(
            "ABCD",
            b"b".to_vec(),
            medium_b,
            recorder_b.clone(),
            recorder_b.clone(),
        )
        .await;
    assert!(status.is_success());

    await_notified(&recorder_b.on_rejected).await;
    assert!(!recorder_b.connected.load(Ordering::SeqCst));
    assert!(session_b.known_endpoint_ids().await.is_empty());
}

#[tokio::test]
async fn bandwidth_upgrade_through_client_session_switches_the_channel() {
    let (session_a, recorder_a, session_b, recorder_b) = connect_pair().await;
    let remote_of_a = session_a.known_endpoint_ids().await.into_iter().next().unwrap();

    let lan_network = Network::new();
    let lan_a = Arc::new(lan_network.medium(Medium::WifiLan));
    let lan_b = Arc::new(lan_network.medium(Medium::WifiLan));

    // B already has a Wi-Fi LAN socket standing by to accept the upgrade A
    // is about to offer.
    lan_b.advertise("com.example.chat", b"wifi-b").await.unwrap();
    session_b.register_upgrade_driver(Medium::WifiLan, lan_b).await;

    let path_info = UpgradePathInfo {
        medium: Medium::WifiLan,
        credentials: Credentials::WifiLan {
            ip_address: "10.0.0.5".to_string(),
            port: 9000,
        },
    };
    let status = session_a
        .initiate_bandwidth_upgrade(&remote_of_a, lan_a, path_info)
        .await;
    assert!(status.is_success());

    await_notified(&recorder_a.on_bandwidth_changed).await;
    await_notified(&recorder_b.on_bandwidth_changed).await;
    assert_eq!(recorder_a.bandwidth_changed.load(Ordering::SeqCst), 1);
    assert_eq!(recorder_b.bandwidth_changed.load(Ordering::SeqCst), 1);

    // the upgrade completed and the payload path still works over the new
    // channel.
    let endpoint_id = session_a.known_endpoint_ids().await.into_iter().next().unwrap();
    let status = session_a
        .send_payload(vec![endpoint_id], Payload::bytes(21, b"over wifi".to_vec()))
        .await;
    assert!(status.is_success());
    await_notified(&recorder_b.on_payload_complete).await;
}

#[tokio::test]
async fn a_second_strategy_is_rejected_while_the_first_is_active() {
    let router = Router::new();
    let session_a = ClientSession::new(router.clone()).await;
    let session_b = ClientSession::new(router).await;
    let network = Network::new();
    let recorder = Arc::new(Recorder::default());

    let status = session_a
        .start_advertising(
            "svc".to_string(),
            b"a".to_vec(),
            Strategy::P2pCluster,
            Arc::new(network.medium(Medium::Ble)),
            recorder.clone(),
        )
        .await;
    assert!(status.is_success());

    let status = session_b
        .start_advertising(
            "svc".to_string(),
            b"b".to_vec(),
            Strategy::P2pStar,
            Arc::new(network.medium(Medium::Ble)),
            recorder,
        )
        .await;
    assert!(matches!(status, Status::AlreadyHaveActiveStrategy));

    session_a.detach_client().await;
    session_b.detach_client().await;
}
