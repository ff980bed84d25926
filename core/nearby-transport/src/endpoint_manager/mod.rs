// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! Owns channels and the read/keep-alive workers per endpoint, spec.md
//! §4.3. For each registered endpoint there are two cooperating tasks (the
//! reader and the keep-alive worker); frame dispatch goes through a
//! process-wide `FrameType -> FrameProcessor` map maintained here.

use crate::channel::{Channel, ChannelError};
use crate::frame::{ControlMessage, Frame, PayloadChunk, PayloadHeader};
use nearby_core::time::Clock;
use nearby_core::Limits;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which registered [`FrameProcessor`] a decoded frame is routed to.
/// KEEP_ALIVE has no processor: `Channel::read_frame` already refreshed
/// the endpoint's last-read timestamp simply by receiving it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    ConnectionRequest,
    ConnectionResponse,
    PayloadTransfer,
    BandwidthUpgradeNegotiation,
}

impl FrameType {
    fn of(frame: &Frame) -> Option<Self> {
        match frame {
            Frame::ConnectionRequest(_) => Some(Self::ConnectionRequest),
            Frame::ConnectionResponse(_) => Some(Self::ConnectionResponse),
            Frame::PayloadTransfer(_) => Some(Self::PayloadTransfer),
            Frame::BandwidthUpgradeNegotiation(_) => Some(Self::BandwidthUpgradeNegotiation),
            Frame::KeepAlive => None,
        }
    }
}

/// Handles one frame type for every endpoint. Implemented by
/// `nearby_connections::session` (CONNECTION_REQUEST/RESPONSE),
/// `PayloadManager` (PAYLOAD_TRANSFER) and `UpgradeEngine`
/// (BANDWIDTH_UPGRADE_NEGOTIATION).
#[async_trait::async_trait]
pub trait FrameProcessor: Send + Sync {
    async fn process(&self, endpoint_id: &str, frame: Frame);

    /// Fanned out to every registered processor when an endpoint
    /// disconnects, with a barrier so the caller can observe that every
    /// processor released its per-endpoint state (spec.md §4.3).
    async fn on_endpoint_disconnect(&self, endpoint_id: &str);
}

/// Notified once an endpoint is fully removed, after every
/// [`FrameProcessor::on_endpoint_disconnect`] has returned or the
/// disconnection-processing timeout elapsed.
#[async_trait::async_trait]
pub trait DisconnectListener: Send + Sync {
    async fn on_endpoint_disconnected(&self, endpoint_id: &str, notify: bool);
}

struct EndpointHandle {
    channel: RwLock<Arc<Channel>>,
    cancel: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    keep_alive_task: JoinHandle<()>,
}

/// Owns every registered endpoint's current channel and drives its reader
/// and keep-alive workers. Must be held behind an `Arc` so its workers can
/// hold a handle back to it.
pub struct EndpointManager {
    limits: Limits,
    clock: Arc<dyn Clock>,
    processors: RwLock<HashMap<FrameType, Arc<dyn FrameProcessor>>>,
    endpoints: RwLock<HashMap<String, EndpointHandle>>,
    disconnect_listener: Arc<dyn DisconnectListener>,
}

impl EndpointManager {
    pub fn new(
        limits: Limits,
        clock: Arc<dyn Clock>,
        disconnect_listener: Arc<dyn DisconnectListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            limits,
            clock,
            processors: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            disconnect_listener,
        })
    }

    pub async fn register_processor(&self, frame_type: FrameType, processor: Arc<dyn FrameProcessor>) {
        self.processors.write().await.insert(frame_type, processor);
    }

    /// Registers a freshly authenticated endpoint and starts its reader and
    /// keep-alive workers. `self` must be an `Arc<EndpointManager>` so the
    /// spawned tasks can keep it alive.
    pub async fn register_endpoint(
        self: &Arc<Self>,
        endpoint_id: String,
        channel: Arc<Channel>,
    ) {
        let cancel = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn({
            let manager = self.clone();
            let endpoint_id = endpoint_id.clone();
            let cancel = cancel.clone();
            async move { manager.reader_loop(endpoint_id, cancel).await }
        });
        let keep_alive_task = tokio::spawn({
            let manager = self.clone();
            let endpoint_id = endpoint_id.clone();
            let cancel = cancel.clone();
            async move { manager.keep_alive_loop(endpoint_id, cancel).await }
        });

        let previous = self.endpoints.write().await.insert(
            endpoint_id.clone(),
            EndpointHandle {
                channel: RwLock::new(channel),
                cancel,
                reader_task,
                keep_alive_task,
            },
        );
        // at most one active channel per endpoint id: tear the old one down
        // rather than let its reader/keep-alive tasks keep running against
        // a channel nothing else references.
        if let Some(previous) = previous {
            warn!(endpoint_id, "replacing an already-registered endpoint, tearing down its old channel");
            previous.cancel.store(true, Ordering::Release);
            previous.reader_task.abort();
            previous.keep_alive_task.abort();
            let _ = previous.channel.read().await.close().await;
        }
    }

    /// Returns the endpoint's current channel, if it is still registered.
    pub async fn current_channel(&self, endpoint_id: &str) -> Option<Arc<Channel>> {
        let endpoints = self.endpoints.read().await;
        let handle = endpoints.get(endpoint_id)?;
        Some(handle.channel.read().await.clone())
    }

    /// Atomically substitutes the channel backing `endpoint_id`, the only
    /// operation the bandwidth-upgrade engine needs from this manager
    /// (spec.md §4.7). Does not restart the reader/keep-alive workers —
    /// they re-fetch the current channel every iteration.
    pub async fn replace_channel(&self, endpoint_id: &str, new_channel: Arc<Channel>) -> bool {
        let endpoints = self.endpoints.read().await;
        let Some(handle) = endpoints.get(endpoint_id) else {
            return false;
        };
        *handle.channel.write().await = new_channel;
        true
    }

    /// Host- or error-initiated removal of an endpoint. Fans out
    /// `on_endpoint_disconnect` to every registered processor (bounded by
    /// `disconnection_processing_timeout`), then notifies
    /// `DisconnectListener` if `notify`.
    pub async fn remove_endpoint(&self, endpoint_id: &str, notify: bool) {
        let handle = self.endpoints.write().await.remove(endpoint_id);
        let Some(handle) = handle else {
            return;
        };
        handle.cancel.store(true, Ordering::Release);
        handle.reader_task.abort();
        handle.keep_alive_task.abort();
        if let Some(channel) = Some(handle.channel.read().await.clone()) {
            let _ = channel.close().await;
        }

        let processors: Vec<_> = self.processors.read().await.values().cloned().collect();
        let fan_out = async {
            for processor in &processors {
                processor.on_endpoint_disconnect(endpoint_id).await;
            }
        };
        if tokio::time::timeout(self.limits.disconnection_processing_timeout, fan_out)
            .await
            .is_err()
        {
            warn!(endpoint_id, "frame processors did not release endpoint state in time");
        }

        self.disconnect_listener
            .on_endpoint_disconnected(endpoint_id, notify)
            .await;
    }

    /// Host-initiated disconnect: out-of-band signal honored by the reader
    /// (next read returns an I/O error after the channel closes) and any
    /// in-flight payload send loop (next chunk boundary).
    pub async fn disconnect(&self, endpoint_id: &str) {
        self.remove_endpoint(endpoint_id, true).await;
    }

    async fn dispatch(&self, endpoint_id: &str, frame: Frame) {
        let Some(frame_type) = FrameType::of(&frame) else {
            // KEEP_ALIVE: receiving it already refreshed last-read.
            debug!(endpoint_id, "received keep-alive");
            return;
        };
        let processor = self.processors.read().await.get(&frame_type).cloned();
        match processor {
            Some(processor) => processor.process(endpoint_id, frame).await,
            None => warn!(endpoint_id, ?frame_type, "no frame processor registered"),
        }
    }

    async fn reader_loop(self: Arc<Self>, endpoint_id: String, cancel: Arc<AtomicBool>) {
        loop {
            if cancel.load(Ordering::Acquire) {
                return;
            }
            let Some(channel) = self.current_channel(&endpoint_id).await else {
                return;
            };
            match channel.read_frame(self.clock.as_ref()).await {
                Ok(frame) => self.dispatch(&endpoint_id, frame).await,
                Err(ChannelError::Frame(error)) => {
                    debug!(endpoint_id, %error, "dropped malformed frame");
                }
                Err(error) => {
                    warn!(endpoint_id, %error, "channel read failed, checking for a replacement channel");
                    let refreshed = self.current_channel(&endpoint_id).await;
                    match refreshed {
                        Some(refreshed) if !Arc::ptr_eq(&refreshed, &channel) => {
                            // the bandwidth-upgrade engine installed a new
                            // channel while we were failing; retry on it.
                            continue;
                        }
                        _ => {
                            info!(endpoint_id, "channel unchanged after I/O error, removing endpoint");
                            self.remove_endpoint(&endpoint_id, true).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn keep_alive_loop(self: Arc<Self>, endpoint_id: String, cancel: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval(self.limits.keep_alive_interval);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            if cancel.load(Ordering::Acquire) {
                return;
            }
            let Some(channel) = self.current_channel(&endpoint_id).await else {
                return;
            };

            let since_read = self.clock.now().saturating_duration_since(channel.last_read());
            if since_read > self.limits.keep_alive_read_timeout {
                warn!(endpoint_id, ?since_read, "keep-alive read timeout, aborting endpoint");
                self.remove_endpoint(&endpoint_id, true).await;
                return;
            }

            if let Err(error) = channel.write_frame(&Frame::KeepAlive, self.clock.as_ref()).await {
                debug!(endpoint_id, %error, "keep-alive write failed");
            }
        }
    }

    /// Assembles and writes a DATA transfer frame to each of `endpoint_ids`'
    /// current channel, returning the subset that failed (missing channel
    /// or write error) per spec.md §4.3.
    pub async fn send_data_chunk(
        &self,
        header: PayloadHeader,
        chunk: PayloadChunk,
        endpoint_ids: &[String],
    ) -> Vec<String> {
        let frame = Frame::PayloadTransfer(crate::frame::PayloadTransfer {
            header,
            body: crate::frame::PayloadBody::Data(chunk),
        });
        self.send_to(&frame, endpoint_ids).await
    }

    /// As [`Self::send_data_chunk`], but for a CONTROL sub-frame.
    pub async fn send_control(
        &self,
        header: PayloadHeader,
        control: ControlMessage,
        endpoint_ids: &[String],
    ) -> Vec<String> {
        let frame = Frame::PayloadTransfer(crate::frame::PayloadTransfer {
            header,
            body: crate::frame::PayloadBody::Control(control),
        });
        self.send_to(&frame, endpoint_ids).await
    }

    async fn send_to(&self, frame: &Frame, endpoint_ids: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        for endpoint_id in endpoint_ids {
            match self.current_channel(endpoint_id).await {
                Some(channel) => {
                    if channel.write_frame(frame, self.clock.as_ref()).await.is_err() {
                        failed.push(endpoint_id.clone());
                    }
                }
                None => failed.push(endpoint_id.clone()),
            }
        }
        failed
    }

    /// Writes an arbitrary frame (used by the upgrade engine for its
    /// negotiation sub-events) to one endpoint's current channel.
    pub async fn send_frame(&self, endpoint_id: &str, frame: &Frame) -> Result<(), ChannelError> {
        match self.current_channel(endpoint_id).await {
            Some(channel) => channel.write_frame(frame, self.clock.as_ref()).await,
            None => Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "endpoint has no current channel",
            ))),
        }
    }

    pub async fn is_registered(&self, endpoint_id: &str) -> bool {
        self.endpoints.read().await.contains_key(endpoint_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ConnectionRequest;
    use crate::medium::memory::{MemoryMedium, Network};
    use crate::medium::MediumDriver;
    use nearby_core::time::MonotonicClock;
    use nearby_core::Medium;
    use std::sync::Mutex as StdMutex;
    use zeroize::Zeroizing;

    fn test_cipher() -> nearby_crypto::ChannelCipher {
        nearby_crypto::ChannelCipher::from_key_material(&Zeroizing::new([5u8; 72]))
    }

    async fn connected_channels() -> (Arc<Channel>, Arc<Channel>) {
        let network = Network::new();
        let a = network.medium(Medium::WifiLan);
        let b = network.medium(Medium::WifiLan);
        a.advertise("svc", b"ABCD").await.unwrap();
        let accept_fut = a.accept("svc");
        let connect_fut = b.connect("ABCD", "svc");
        let (accepted, connected) = tokio::join!(accept_fut, connect_fut);
        let clock = MonotonicClock;
        (
            Arc::new(Channel::new(Medium::WifiLan, accepted.unwrap().stream, test_cipher(), &clock)),
            Arc::new(Channel::new(Medium::WifiLan, connected.unwrap(), test_cipher(), &clock)),
        )
    }

    struct RecordingProcessor {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl FrameProcessor for RecordingProcessor {
        async fn process(&self, endpoint_id: &str, _frame: Frame) {
            self.seen.lock().unwrap().push(endpoint_id.to_string());
        }
        async fn on_endpoint_disconnect(&self, _endpoint_id: &str) {}
    }

    struct RecordingDisconnectListener {
        disconnected: StdMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl DisconnectListener for RecordingDisconnectListener {
        async fn on_endpoint_disconnected(&self, endpoint_id: &str, _notify: bool) {
            self.disconnected.lock().unwrap().push(endpoint_id.to_string());
        }
    }

    #[tokio::test]
    async fn dispatches_frames_to_the_registered_processor() {
        let (server_channel, client_channel) = connected_channels().await;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        let disconnects = Arc::new(RecordingDisconnectListener {
            disconnected: StdMutex::new(Vec::new()),
        });
        let manager = EndpointManager::new(Limits::default(), clock, disconnects);
        let processor = Arc::new(RecordingProcessor {
            seen: StdMutex::new(Vec::new()),
        });
        manager
            .register_processor(FrameType::ConnectionRequest, processor.clone())
            .await;
        manager
            .register_endpoint("ABCD".into(), server_channel)
            .await;

        client_channel
            .write_frame(
                &Frame::ConnectionRequest(ConnectionRequest {
                    endpoint_id: "WXYZ".into(),
                    endpoint_info: vec![1],
                    nonce: 0,
                    supports_5_ghz: false,
                    bssid: String::new(),
                    mediums: vec![],
                    keep_alive_interval_ms: 0,
                    keep_alive_timeout_ms: 0,
                }),
                &MonotonicClock,
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*processor.seen.lock().unwrap(), vec!["ABCD".to_string()]);
    }

    #[tokio::test]
    async fn removing_an_endpoint_notifies_the_disconnect_listener() {
        let (server_channel, _client_channel) = connected_channels().await;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        let disconnects = Arc::new(RecordingDisconnectListener {
            disconnected: StdMutex::new(Vec::new()),
        });
        let manager = EndpointManager::new(Limits::default(), clock, disconnects.clone());
        manager
            .register_endpoint("ABCD".into(), server_channel)
            .await;
        manager.disconnect("ABCD").await;
        assert_eq!(*disconnects.disconnected.lock().unwrap(), vec!["ABCD".to_string()]);
        assert!(!manager.is_registered("ABCD").await);
    }
}
