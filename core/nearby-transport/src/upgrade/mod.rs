// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! Drives the BANDWIDTH_UPGRADE_NEGOTIATION state machine, spec.md §4.7:
//! UPGRADE_PATH_AVAILABLE, CLIENT_INTRODUCTION, LAST_WRITE_TO_PRIOR_CHANNEL,
//! SAFE_TO_CLOSE_PRIOR_CHANNEL, ending in an atomic channel substitution on
//! [`EndpointManager`] with no payload loss. Registers as the
//! BANDWIDTH_UPGRADE_NEGOTIATION [`FrameProcessor`].

use crate::channel::Channel;
use crate::endpoint_manager::{EndpointManager, FrameProcessor, FrameType};
use crate::frame::{BandwidthUpgradeNegotiation, Frame, UpgradeEvent, UpgradePathInfo};
use crate::medium::MediumDriver;
use nearby_core::time::Clock;
use nearby_core::{Limits, Medium};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};

/// Outcome a host-facing listener is told about once an upgrade attempt
/// settles, spec.md §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Succeeded { medium: Medium },
    Reverted,
}

/// Notified when an upgrade attempt finishes, successfully or not.
#[async_trait::async_trait]
pub trait UpgradeListener: Send + Sync {
    async fn on_upgrade_outcome(&self, endpoint_id: &str, outcome: UpgradeOutcome);

    /// The peer offered a new medium via UPGRADE_PATH_AVAILABLE. This engine
    /// only sequences the handshake once a stream to `info`'s medium exists;
    /// dialing that medium and calling [`UpgradeEngine::accept_upgrade`] with
    /// the resulting stream is the host-facing layer's job.
    async fn on_upgrade_path_available(&self, endpoint_id: &str, info: UpgradePathInfo);
}

/// Per-endpoint state for an upgrade in flight. Both sides run the same
/// LAST_WRITE_TO_PRIOR_CHANNEL / SAFE_TO_CLOSE_PRIOR_CHANNEL exchange once
/// each has its own reason to believe the new channel is live: the
/// initiator once it reads the peer's CLIENT_INTRODUCTION off the new
/// channel, the responder as soon as it has sent its own. The swap itself
/// only happens once this side has both sent and received
/// SAFE_TO_CLOSE_PRIOR_CHANNEL — never on CLIENT_INTRODUCTION or
/// LAST_WRITE_TO_PRIOR_CHANNEL alone.
struct PendingUpgrade {
    new_channel: Arc<Channel>,
    new_medium: Medium,
    sent_last_write: bool,
    received_last_write: bool,
    sent_safe_to_close: bool,
    done: Option<oneshot::Sender<()>>,
}

/// Drives bandwidth upgrades for every endpoint registered with one
/// [`EndpointManager`]. One instance is shared across all endpoints of a
/// session; per-endpoint state lives in `pending`.
pub struct UpgradeEngine {
    limits: Limits,
    clock: Arc<dyn Clock>,
    endpoint_manager: Arc<EndpointManager>,
    listener: Arc<dyn UpgradeListener>,
    pending: RwLock<HashMap<String, PendingUpgrade>>,
}

impl UpgradeEngine {
    pub fn new(
        limits: Limits,
        clock: Arc<dyn Clock>,
        endpoint_manager: Arc<EndpointManager>,
        listener: Arc<dyn UpgradeListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            limits,
            clock,
            endpoint_manager,
            listener,
            pending: RwLock::new(HashMap::new()),
        })
    }

    pub async fn attach(self: &Arc<Self>) {
        self.endpoint_manager
            .register_processor(FrameType::BandwidthUpgradeNegotiation, self.clone())
            .await;
    }

    /// Initiates an upgrade for `endpoint_id`: connects over `driver`'s
    /// medium, advertises the path info to the peer, and waits for the
    /// handshake to either complete (atomically swapping the endpoint's
    /// channel) or time out (reverting with no effect on the existing
    /// channel). spec.md §4.7.
    pub async fn initiate(
        self: &Arc<Self>,
        endpoint_id: &str,
        driver: &dyn MediumDriver,
        service_id: &str,
        path_info: UpgradePathInfo,
        cipher: nearby_crypto::ChannelCipher,
    ) {
        let new_medium = driver.medium();
        let stream = match driver.connect(endpoint_id, service_id).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(endpoint_id, %error, "failed to open the upgrade path, reverting");
                self.listener
                    .on_upgrade_outcome(endpoint_id, UpgradeOutcome::Reverted)
                    .await;
                return;
            }
        };
        let new_channel = Arc::new(Channel::new(new_medium, stream, cipher, self.clock.as_ref()));

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(
            endpoint_id.to_string(),
            PendingUpgrade {
                new_channel: new_channel.clone(),
                new_medium,
                sent_last_write: false,
                received_last_write: false,
                sent_safe_to_close: false,
                done: Some(tx),
            },
        );

        // CLIENT_INTRODUCTION arrives on the new channel itself, not the
        // registered one `EndpointManager`'s reader loop watches, so this
        // engine reads it directly until the swap makes `new_channel` the
        // endpoint's current channel.
        tokio::spawn({
            let engine = self.clone();
            let endpoint_id = endpoint_id.to_string();
            let new_channel = new_channel.clone();
            async move { engine.await_client_introduction(endpoint_id, new_channel).await }
        });

        let negotiation = BandwidthUpgradeNegotiation {
            event: UpgradeEvent::UpgradePathAvailable(path_info),
        };
        if let Err(error) = self
            .endpoint_manager
            .send_frame(endpoint_id, &Frame::BandwidthUpgradeNegotiation(negotiation))
            .await
        {
            warn!(endpoint_id, %error, "failed to announce upgrade path, reverting");
            self.pending.write().await.remove(endpoint_id);
            self.listener
                .on_upgrade_outcome(endpoint_id, UpgradeOutcome::Reverted)
                .await;
            return;
        }

        let outcome = match tokio::time::timeout(self.limits.handshake_timeout, rx).await {
            Ok(Ok(())) => UpgradeOutcome::Succeeded { medium: new_medium },
            _ => {
                info!(endpoint_id, "upgrade handshake timed out, reverting");
                self.pending.write().await.remove(endpoint_id);
                UpgradeOutcome::Reverted
            }
        };
        self.listener.on_upgrade_outcome(endpoint_id, outcome).await;
    }

    async fn handle_upgrade_path_available(&self, endpoint_id: &str, info: UpgradePathInfo) {
        // A production responder would dial `info`'s credentials through the
        // matching `MediumDriver`; this engine's contract only covers the
        // negotiation sequencing once a stream to the new medium exists, so
        // acting on `info` here is left to the host-facing layer, which
        // calls `accept_upgrade` with the stream it opened.
        info!(endpoint_id, medium = ?info.medium, "peer offered an upgrade path");
        self.listener.on_upgrade_path_available(endpoint_id, info).await;
    }

    /// Called by the host-facing layer once it has dialed the medium `info`
    /// described, completing the responder half of the handshake.
    pub async fn accept_upgrade(
        self: &Arc<Self>,
        endpoint_id: &str,
        new_medium: Medium,
        stream: crate::medium::BoxedStream,
        cipher: nearby_crypto::ChannelCipher,
    ) {
        let new_channel = Arc::new(Channel::new(new_medium, stream, cipher, self.clock.as_ref()));
        self.pending.write().await.insert(
            endpoint_id.to_string(),
            PendingUpgrade {
                new_channel: new_channel.clone(),
                new_medium,
                sent_last_write: false,
                received_last_write: false,
                sent_safe_to_close: false,
                done: None,
            },
        );

        let our_id = endpoint_id.to_string();
        let negotiation = BandwidthUpgradeNegotiation {
            event: UpgradeEvent::ClientIntroduction { endpoint_id: our_id },
        };
        let frame = Frame::BandwidthUpgradeNegotiation(negotiation);
        if new_channel.write_frame(&frame, self.clock.as_ref()).await.is_err() {
            warn!(endpoint_id, "failed to send client introduction on the new channel");
            self.pending.write().await.remove(endpoint_id);
            self.listener
                .on_upgrade_outcome(endpoint_id, UpgradeOutcome::Reverted)
                .await;
            return;
        }

        // the responder already knows the new channel is live, having just
        // dialed and written to it; it does not wait for anything before
        // mirroring the initiator's steps 3-5.
        self.new_channel_confirmed(endpoint_id).await;
    }

    /// Reads frames off `new_channel` directly until CLIENT_INTRODUCTION
    /// arrives or the channel fails; only the initiator runs this, since it
    /// is the side waiting to be introduced to.
    async fn await_client_introduction(self: Arc<Self>, endpoint_id: String, new_channel: Arc<Channel>) {
        loop {
            if !self.pending.read().await.contains_key(&endpoint_id) {
                return;
            }
            match new_channel.read_frame(self.clock.as_ref()).await {
                Ok(Frame::BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiation {
                    event: UpgradeEvent::ClientIntroduction { .. },
                })) => {
                    self.new_channel_confirmed(&endpoint_id).await;
                    return;
                }
                Ok(_) => continue,
                Err(error) => {
                    warn!(endpoint_id, %error, "failed to read client introduction on the upgraded channel");
                    return;
                }
            }
        }
    }

    /// This side is now confident the new channel is usable: send our own
    /// LAST_WRITE_TO_PRIOR_CHANNEL, and if the peer's has already arrived,
    /// follow up with SAFE_TO_CLOSE_PRIOR_CHANNEL.
    async fn new_channel_confirmed(&self, endpoint_id: &str) {
        let received_last_write = {
            let mut pending = self.pending.write().await;
            let Some(state) = pending.get_mut(endpoint_id) else {
                return;
            };
            if state.sent_last_write {
                return;
            }
            state.sent_last_write = true;
            state.received_last_write
        };

        let negotiation = BandwidthUpgradeNegotiation {
            event: UpgradeEvent::LastWriteToPriorChannel,
        };
        let _ = self
            .endpoint_manager
            .send_frame(endpoint_id, &Frame::BandwidthUpgradeNegotiation(negotiation))
            .await;

        if received_last_write {
            self.send_safe_to_close(endpoint_id).await;
        }
    }

    async fn handle_last_write_to_prior_channel(&self, endpoint_id: &str) {
        let ready_to_confirm = {
            let mut pending = self.pending.write().await;
            let Some(state) = pending.get_mut(endpoint_id) else {
                return;
            };
            state.received_last_write = true;
            state.sent_last_write
        };
        if ready_to_confirm {
            self.send_safe_to_close(endpoint_id).await;
        }
    }

    async fn send_safe_to_close(&self, endpoint_id: &str) {
        {
            let mut pending = self.pending.write().await;
            let Some(state) = pending.get_mut(endpoint_id) else {
                return;
            };
            if state.sent_safe_to_close {
                return;
            }
            state.sent_safe_to_close = true;
        }
        let negotiation = BandwidthUpgradeNegotiation {
            event: UpgradeEvent::SafeToClosePriorChannel,
        };
        let _ = self
            .endpoint_manager
            .send_frame(endpoint_id, &Frame::BandwidthUpgradeNegotiation(negotiation))
            .await;
    }

    /// Both sides have now sent and received SAFE_TO_CLOSE_PRIOR_CHANNEL;
    /// only now is it safe to retire the prior channel and cut over.
    async fn handle_safe_to_close_prior_channel(&self, endpoint_id: &str) {
        let new_channel = {
            let pending = self.pending.read().await;
            pending.get(endpoint_id).map(|state| state.new_channel.clone())
        };
        let Some(new_channel) = new_channel else {
            return;
        };
        self.complete_swap(endpoint_id, new_channel).await;

        let (done, new_medium) = {
            let mut pending = self.pending.write().await;
            match pending.get_mut(endpoint_id) {
                Some(state) => (state.done.take(), state.new_medium),
                None => return,
            }
        };
        self.pending.write().await.remove(endpoint_id);

        match done {
            // the initiator learns the outcome through `initiate`'s own wait
            // on this signal; waking it is enough, it reports to `listener`
            // itself once `rx` resolves.
            Some(done) => {
                let _ = done.send(());
            }
            // the responder has no caller waiting on a signal, so report the
            // outcome here instead.
            None => {
                self.listener
                    .on_upgrade_outcome(endpoint_id, UpgradeOutcome::Succeeded { medium: new_medium })
                    .await;
            }
        }
    }

    async fn complete_swap(&self, endpoint_id: &str, new_channel: Arc<Channel>) {
        // spec.md §4.7: the floor under which the prior channel's close is
        // delayed, giving any frame already in flight on it a chance to
        // land before the peer stops reading it.
        tokio::time::sleep(self.limits.upgrade_min_close_delay).await;
        let old_channel = self.endpoint_manager.current_channel(endpoint_id).await;
        if self
            .endpoint_manager
            .replace_channel(endpoint_id, new_channel)
            .await
        {
            info!(endpoint_id, "switched to the upgraded channel");
            if let Some(old_channel) = old_channel {
                let _ = old_channel.close().await;
            }
        } else {
            warn!(endpoint_id, "endpoint disappeared during upgrade, dropping new channel");
        }
    }
}

#[async_trait::async_trait]
impl FrameProcessor for UpgradeEngine {
    async fn process(&self, endpoint_id: &str, frame: Frame) {
        let Frame::BandwidthUpgradeNegotiation(negotiation) = frame else {
            return;
        };
        match negotiation.event {
            UpgradeEvent::UpgradePathAvailable(info) => {
                self.handle_upgrade_path_available(endpoint_id, info).await
            }
            UpgradeEvent::ClientIntroduction { .. } => {
                // Always sent directly on the new channel and read by
                // `await_client_introduction`; seeing one dispatched through
                // the registered channel means the peer is confused about
                // which channel it is writing to.
                warn!(endpoint_id, "ignoring CLIENT_INTRODUCTION received on the registered channel");
            }
            UpgradeEvent::LastWriteToPriorChannel => {
                self.handle_last_write_to_prior_channel(endpoint_id).await
            }
            UpgradeEvent::SafeToClosePriorChannel => {
                self.handle_safe_to_close_prior_channel(endpoint_id).await
            }
        }
    }

    async fn on_endpoint_disconnect(&self, endpoint_id: &str) {
        self.pending.write().await.remove(endpoint_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_manager::DisconnectListener;
    use crate::medium::memory::Network;
    use nearby_core::time::MonotonicClock;
    use zeroize::Zeroizing;

    fn test_cipher(seed: u8) -> nearby_crypto::ChannelCipher {
        nearby_crypto::ChannelCipher::from_key_material(&Zeroizing::new([seed; 72]))
    }

    struct NoopDisconnectListener;
    #[async_trait::async_trait]
    impl DisconnectListener for NoopDisconnectListener {
        async fn on_endpoint_disconnected(&self, _endpoint_id: &str, _notify: bool) {}
    }

    struct RecordingUpgradeListener(std::sync::Mutex<Vec<UpgradeOutcome>>);
    #[async_trait::async_trait]
    impl UpgradeListener for RecordingUpgradeListener {
        async fn on_upgrade_outcome(&self, _endpoint_id: &str, outcome: UpgradeOutcome) {
            self.0.lock().unwrap().push(outcome);
        }

        async fn on_upgrade_path_available(&self, _endpoint_id: &str, _info: UpgradePathInfo) {}
    }

    #[tokio::test]
    async fn full_upgrade_sequence_swaps_the_channel() {
        let bt_network = Network::new();
        let lan_network = Network::new();
        let bt_a = bt_network.medium(Medium::BluetoothClassic);
        let bt_b = bt_network.medium(Medium::BluetoothClassic);
        bt_a.advertise("svc", b"ABCD").await.unwrap();
        let accept_fut = bt_a.accept("svc");
        let connect_fut = bt_b.connect("ABCD", "svc");
        let (accepted, connected) = tokio::join!(accept_fut, connect_fut);
        let clock = Arc::new(MonotonicClock);
        let a_channel = Arc::new(Channel::new(
            Medium::BluetoothClassic,
            accepted.unwrap().stream,
            test_cipher(1),
            clock.as_ref(),
        ));
        let b_channel = Arc::new(Channel::new(
            Medium::BluetoothClassic,
            connected.unwrap(),
            test_cipher(1),
            clock.as_ref(),
        ));

        let limits = Limits::builder()
            .upgrade_min_close_delay(std::time::Duration::from_millis(1))
            .build();
        let a_manager = EndpointManager::new(limits, clock.clone(), Arc::new(NoopDisconnectListener));
        let b_manager = EndpointManager::new(limits, clock.clone(), Arc::new(NoopDisconnectListener));
        a_manager.register_endpoint("b".into(), a_channel).await;
        b_manager.register_endpoint("a".into(), b_channel).await;

        let a_listener = Arc::new(RecordingUpgradeListener(std::sync::Mutex::new(Vec::new())));
        let b_listener = Arc::new(RecordingUpgradeListener(std::sync::Mutex::new(Vec::new())));
        let a_engine = UpgradeEngine::new(limits, clock.clone(), a_manager.clone(), a_listener.clone());
        let b_engine = UpgradeEngine::new(limits, clock.clone(), b_manager.clone(), b_listener.clone());
        a_engine.attach().await;
        b_engine.attach().await;

        let lan_a = lan_network.medium(Medium::WifiLan);
        let lan_b = lan_network.medium(Medium::WifiLan);
        lan_a.advertise("upgrade", b"ABCD").await.unwrap();

        let path_info = UpgradePathInfo {
            medium: Medium::WifiLan,
            credentials: crate::frame::Credentials::WifiLan {
                ip_address: "10.0.0.9".into(),
                port: 9000,
            },
        };

        let accept_fut = lan_a.accept("upgrade");
        let b_engine_clone = b_engine.clone();
        tokio::spawn(async move {
            let accepted = accept_fut.await.unwrap();
            b_engine_clone
                .accept_upgrade("a", Medium::WifiLan, accepted.stream, test_cipher(2))
                .await;
        });

        a_engine
            .initiate("b", &lan_b, "upgrade", path_info, test_cipher(2))
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(
            a_listener.0.lock().unwrap().as_slice(),
            &[UpgradeOutcome::Succeeded { medium: Medium::WifiLan }]
        );
        let a_current = a_manager.current_channel("b").await.unwrap();
        assert_eq!(a_current.medium(), Medium::WifiLan);
        let b_current = b_manager.current_channel("a").await.unwrap();
        assert_eq!(b_current.medium(), Medium::WifiLan);
    }

    #[tokio::test]
    async fn swap_waits_for_safe_to_close_in_both_directions() {
        let bt_network = Network::new();
        let lan_network = Network::new();
        let bt_a = bt_network.medium(Medium::BluetoothClassic);
        let bt_b = bt_network.medium(Medium::BluetoothClassic);
        bt_a.advertise("svc", b"ABCD").await.unwrap();
        let accept_fut = bt_a.accept("svc");
        let connect_fut = bt_b.connect("ABCD", "svc");
        let (accepted, connected) = tokio::join!(accept_fut, connect_fut);
        let clock = Arc::new(MonotonicClock);
        let a_channel = Arc::new(Channel::new(
            Medium::BluetoothClassic,
            accepted.unwrap().stream,
            test_cipher(1),
            clock.as_ref(),
        ));
        let b_channel = Arc::new(Channel::new(
            Medium::BluetoothClassic,
            connected.unwrap(),
            test_cipher(1),
            clock.as_ref(),
        ));

        // long enough that a premature swap (triggered off CLIENT_INTRODUCTION
        // or LAST_WRITE_TO_PRIOR_CHANNEL alone) and a correct one (triggered
        // off SAFE_TO_CLOSE_PRIOR_CHANNEL) land on opposite sides of the
        // mid-point sleep below.
        let limits = Limits::builder()
            .upgrade_min_close_delay(std::time::Duration::from_millis(250))
            .build();
        let a_manager = EndpointManager::new(limits, clock.clone(), Arc::new(NoopDisconnectListener));
        let b_manager = EndpointManager::new(limits, clock.clone(), Arc::new(NoopDisconnectListener));
        a_manager.register_endpoint("b".into(), a_channel).await;
        b_manager.register_endpoint("a".into(), b_channel).await;

        let a_listener = Arc::new(RecordingUpgradeListener(std::sync::Mutex::new(Vec::new())));
        let b_listener = Arc::new(RecordingUpgradeListener(std::sync::Mutex::new(Vec::new())));
        let a_engine = UpgradeEngine::new(limits, clock.clone(), a_manager.clone(), a_listener.clone());
        let b_engine = UpgradeEngine::new(limits, clock.clone(), b_manager.clone(), b_listener.clone());
        a_engine.attach().await;
        b_engine.attach().await;

        let lan_a = lan_network.medium(Medium::WifiLan);
        let lan_b = lan_network.medium(Medium::WifiLan);
        lan_a.advertise("upgrade", b"ABCD").await.unwrap();

        let path_info = UpgradePathInfo {
            medium: Medium::WifiLan,
            credentials: crate::frame::Credentials::WifiLan {
                ip_address: "10.0.0.9".into(),
                port: 9000,
            },
        };

        let accept_fut = lan_a.accept("upgrade");
        let b_engine_clone = b_engine.clone();
        tokio::spawn(async move {
            let accepted = accept_fut.await.unwrap();
            b_engine_clone
                .accept_upgrade("a", Medium::WifiLan, accepted.stream, test_cipher(2))
                .await;
        });

        let a_engine_clone = a_engine.clone();
        tokio::spawn(async move {
            a_engine_clone
                .initiate("b", &lan_b, "upgrade", path_info, test_cipher(2))
                .await;
        });

        // CLIENT_INTRODUCTION and LAST_WRITE_TO_PRIOR_CHANNEL have had time
        // to cross in both directions by now, but SAFE_TO_CLOSE_PRIOR_CHANNEL
        // is still behind the 250ms close delay: neither side may have cut
        // over to the new medium yet.
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(a_manager.current_channel("b").await.unwrap().medium(), Medium::BluetoothClassic);
        assert_eq!(b_manager.current_channel("a").await.unwrap().medium(), Medium::BluetoothClassic);

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert_eq!(a_manager.current_channel("b").await.unwrap().medium(), Medium::WifiLan);
        assert_eq!(b_manager.current_channel("a").await.unwrap().medium(), Medium::WifiLan);
    }
}
