// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fragments outgoing payloads into PAYLOAD_TRANSFER chunks and reassembles
//! inbound ones, spec.md §4.6. Registers itself as the PAYLOAD_TRANSFER
//! [`FrameProcessor`](crate::endpoint_manager::FrameProcessor) with an
//! [`EndpointManager`]; everything above this module deals in whole
//! [`Payload`]s, never individual chunks.

use crate::endpoint_manager::{EndpointManager, FrameProcessor, FrameType};
use crate::frame::{
    ControlEvent, ControlMessage, Frame, PayloadBody, PayloadChunk, PayloadHeader, PayloadType,
    INDETERMINATE_SIZE, LAST_CHUNK_FLAG,
};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// The content backing a [`Payload`] a host wants to send. `Stream`'s
/// `total_size` is `None` unless the host happens to know the length
/// up front (spec.md §3's `total_size: -1` for indeterminate streams).
pub enum PayloadContent {
    Bytes(Vec<u8>),
    Stream {
        reader: Pin<Box<dyn AsyncRead + Send>>,
        total_size: Option<u64>,
    },
}

impl PayloadContent {
    fn total_size(&self) -> i64 {
        match self {
            Self::Bytes(data) => data.len() as i64,
            Self::Stream { total_size, .. } => {
                total_size.map(|size| size as i64).unwrap_or(INDETERMINATE_SIZE)
            }
        }
    }
}

/// One outgoing or incoming transfer, spec.md §3's `Payload` entity.
pub struct Payload {
    pub id: i64,
    pub payload_type: PayloadType,
    pub content: PayloadContent,
    /// Byte offset into `content` at which sending should start, spec.md
    /// §3/§8 scenario 5: resuming a transfer the receiver already has a
    /// prefix of. Zero for a fresh send.
    pub offset: i64,
}

impl Payload {
    pub fn bytes(id: i64, data: Vec<u8>) -> Self {
        Self {
            id,
            payload_type: PayloadType::Bytes,
            content: PayloadContent::Bytes(data),
            offset: 0,
        }
    }

    pub fn stream(id: i64, reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            id,
            payload_type: PayloadType::Stream,
            content: PayloadContent::Stream {
                reader: Box::pin(reader),
                total_size: None,
            },
            offset: 0,
        }
    }

    pub fn file(id: i64, reader: impl AsyncRead + Send + 'static, total_size: u64) -> Self {
        Self {
            id,
            payload_type: PayloadType::File,
            content: PayloadContent::Stream {
                reader: Box::pin(reader),
                total_size: Some(total_size),
            },
            offset: 0,
        }
    }

    /// Resumes the transfer at `offset` bytes into the content instead of
    /// the start: the host already confirmed the receiver has that prefix.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// A chunk of bytes from an in-progress inbound payload, or its completion.
#[derive(Debug)]
pub enum IncomingEvent {
    Chunk(Vec<u8>),
    Complete,
    Canceled,
}

/// A progress or terminal notification for a payload this device is
/// sending to one endpoint, spec.md §4.6 point 4 / §8's monotonicity
/// requirement on `bytes_transferred`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendEvent {
    Progress { bytes_transferred: i64 },
    Success,
    Failure,
    Canceled,
}

/// Host-facing notifications from the payload manager, spec.md §6's payload
/// listener.
#[async_trait::async_trait]
pub trait PayloadListener: Send + Sync {
    /// A new inbound payload began; `total_size` is [`INDETERMINATE_SIZE`]
    /// if unknown. Subsequent chunks arrive via [`IncomingEvent`] through
    /// whatever channel the listener chooses to retain — this call is only
    /// the announcement.
    async fn on_payload_started(&self, endpoint_id: &str, header: PayloadHeader);

    async fn on_payload_chunk(&self, endpoint_id: &str, payload_id: i64, event: IncomingEvent);

    /// The remote side reported new progress or a terminal status on a
    /// payload this device is sending.
    async fn on_remote_status(&self, endpoint_id: &str, payload_id: i64, event: ControlEvent);

    /// Progress or terminal status for a payload this device is sending to
    /// `endpoint_id`, posted in order per (payload id, endpoint id) per
    /// spec.md §5's ordering guarantee. Exactly one terminal event
    /// (`Success`/`Failure`/`Canceled`) is posted per endpoint per payload.
    async fn on_send_update(&self, endpoint_id: &str, payload_id: i64, event: SendEvent);
}

struct OutgoingPayload {
    cancel: AtomicBool,
}

struct IncomingPayload {
    header: PayloadHeader,
    expected_offset: i64,
}

/// Owns in-flight send/receive state for every payload and drives the
/// chunking loop for outgoing ones.
pub struct PayloadManager {
    limits: nearby_core::Limits,
    endpoint_manager: Arc<EndpointManager>,
    listener: Arc<dyn PayloadListener>,
    outgoing: RwLock<HashMap<i64, Arc<OutgoingPayload>>>,
    incoming: RwLock<HashMap<(String, i64), IncomingPayload>>,
}

impl PayloadManager {
    pub fn new(
        limits: nearby_core::Limits,
        endpoint_manager: Arc<EndpointManager>,
        listener: Arc<dyn PayloadListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            limits,
            endpoint_manager,
            listener,
            outgoing: RwLock::new(HashMap::new()),
            incoming: RwLock::new(HashMap::new()),
        })
    }

    /// Registers this manager as the PAYLOAD_TRANSFER frame processor on
    /// `endpoint_manager`. Call once during setup.
    pub async fn attach(self: &Arc<Self>) {
        self.endpoint_manager
            .register_processor(FrameType::PayloadTransfer, self.clone())
            .await;
    }

    /// Begins sending `payload` to every endpoint in `endpoint_ids`,
    /// fragmenting at `Limits::payload_chunk_size`. Returns immediately; the
    /// transfer runs on its own task.
    pub async fn send(self: &Arc<Self>, endpoint_ids: Vec<String>, payload: Payload) {
        let header = PayloadHeader {
            id: payload.id,
            r#type: payload.payload_type,
            total_size: payload.content.total_size(),
        };
        let state = Arc::new(OutgoingPayload {
            cancel: AtomicBool::new(false),
        });
        self.outgoing.write().await.insert(payload.id, state.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .send_loop(header, payload.content, payload.offset, endpoint_ids, state)
                .await;
        });
    }

    /// Idempotent: cancels an in-flight payload with `payload_id`, whichever
    /// direction it is moving. If this device is sending it, the send loop
    /// notices on its next chunk boundary. If this device is receiving it,
    /// every still-open inbound transfer with that id is torn down and the
    /// sender is told via a CONTROL CANCEL. Does nothing if the payload
    /// already completed or never existed.
    pub async fn cancel(&self, payload_id: i64) {
        let had_outgoing = if let Some(state) = self.outgoing.read().await.get(&payload_id) {
            state.cancel.store(true, Ordering::Release);
            true
        } else {
            false
        };
        if !had_outgoing {
            self.cancel_incoming(payload_id).await;
        }
    }

    /// Cancels every still-open inbound transfer with `payload_id`, spec.md
    /// §8 scenario 3: the receiving host asked to stop a transfer it did
    /// not initiate.
    async fn cancel_incoming(&self, payload_id: i64) {
        let matching: Vec<(String, i64)> = self
            .incoming
            .read()
            .await
            .keys()
            .filter(|(_, id)| *id == payload_id)
            .cloned()
            .collect();
        for key in matching {
            let (endpoint_id, _) = key.clone();
            let Some(state) = self.incoming.write().await.remove(&key) else {
                continue;
            };
            let control = ControlMessage {
                event: ControlEvent::Canceled,
                offset: state.expected_offset,
            };
            self.endpoint_manager
                .send_control(state.header, control, std::slice::from_ref(&endpoint_id))
                .await;
            self.listener
                .on_payload_chunk(&endpoint_id, payload_id, IncomingEvent::Canceled)
                .await;
        }
    }

    async fn any_paused(&self, endpoint_ids: &[String]) -> bool {
        for endpoint_id in endpoint_ids {
            if let Some(channel) = self.endpoint_manager.current_channel(endpoint_id).await {
                if channel.is_paused() {
                    return true;
                }
            }
        }
        false
    }

    async fn notify_all(&self, payload_id: i64, endpoint_ids: &[String], event: SendEvent) {
        for endpoint_id in endpoint_ids {
            self.listener.on_send_update(endpoint_id, payload_id, event).await;
        }
    }

    async fn send_loop(
        self: Arc<Self>,
        header: PayloadHeader,
        mut content: PayloadContent,
        initial_offset: i64,
        mut endpoint_ids: Vec<String>,
        state: Arc<OutgoingPayload>,
    ) {
        let chunk_size = self.limits.payload_chunk_size;
        let mut offset: i64 = initial_offset;

        if let Err(error) = Self::skip_prefix(&mut content, initial_offset).await {
            warn!(payload_id = header.id, %error, "failed to seek to the resume offset, aborting send");
            let control = ControlMessage {
                event: ControlEvent::Error,
                offset: 0,
            };
            self.endpoint_manager
                .send_control(header, control, &endpoint_ids)
                .await;
            self.notify_all(header.id, &endpoint_ids, SendEvent::Failure).await;
            self.outgoing.write().await.remove(&header.id);
            return;
        }

        loop {
            if state.cancel.load(Ordering::Acquire) {
                let control = ControlMessage {
                    event: ControlEvent::Canceled,
                    offset,
                };
                self.endpoint_manager
                    .send_control(header, control, &endpoint_ids)
                    .await;
                self.notify_all(header.id, &endpoint_ids, SendEvent::Canceled).await;
                break;
            }

            while self.any_paused(&endpoint_ids).await {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if state.cancel.load(Ordering::Acquire) {
                    break;
                }
            }

            let (body, is_last) = match Self::next_chunk(&mut content, chunk_size).await {
                Ok(result) => result,
                Err(error) => {
                    warn!(payload_id = header.id, %error, "payload source read failed, aborting send");
                    let control = ControlMessage {
                        event: ControlEvent::Error,
                        offset,
                    };
                    self.endpoint_manager
                        .send_control(header, control, &endpoint_ids)
                        .await;
                    self.notify_all(header.id, &endpoint_ids, SendEvent::Failure).await;
                    break;
                }
            };

            let flags = if is_last { LAST_CHUNK_FLAG } else { 0 };
            let chunk_len = body.len() as i64;
            let chunk = PayloadChunk { flags, offset, body };
            let failed = self
                .endpoint_manager
                .send_data_chunk(header, chunk, &endpoint_ids)
                .await;
            offset += chunk_len;

            let terminal_event = if is_last { SendEvent::Success } else { SendEvent::Progress { bytes_transferred: offset } };
            for endpoint_id in &endpoint_ids {
                let event = if failed.contains(endpoint_id) { SendEvent::Failure } else { terminal_event };
                self.listener.on_send_update(endpoint_id, header.id, event).await;
            }
            if !failed.is_empty() {
                endpoint_ids.retain(|id| !failed.contains(id));
            }

            if is_last || endpoint_ids.is_empty() {
                break;
            }
        }

        self.outgoing.write().await.remove(&header.id);
    }

    /// Discards `amount` bytes from the front of `content` before the first
    /// chunk is cut, implementing [`Payload::with_offset`]'s resume point.
    async fn skip_prefix(content: &mut PayloadContent, amount: i64) -> std::io::Result<()> {
        if amount <= 0 {
            return Ok(());
        }
        match content {
            PayloadContent::Bytes(data) => {
                let take = (amount as usize).min(data.len());
                data.drain(..take);
                Ok(())
            }
            PayloadContent::Stream { reader, .. } => {
                let mut remaining = amount as u64;
                let mut buffer = [0u8; 4096];
                while remaining > 0 {
                    let take = buffer.len().min(remaining as usize);
                    let read = reader.read(&mut buffer[..take]).await?;
                    if read == 0 {
                        break;
                    }
                    remaining -= read as u64;
                }
                Ok(())
            }
        }
    }

    async fn next_chunk(content: &mut PayloadContent, max: usize) -> std::io::Result<(Vec<u8>, bool)> {
        match content {
            PayloadContent::Bytes(data) => {
                if data.is_empty() {
                    return Ok((Vec::new(), true));
                }
                let take = data.len().min(max);
                let body: Vec<u8> = data.drain(..take).collect();
                let is_last = data.is_empty();
                Ok((body, is_last))
            }
            PayloadContent::Stream { reader, .. } => {
                let mut buffer = vec![0u8; max];
                let read = reader.read(&mut buffer).await?;
                buffer.truncate(read);
                // a short or empty read is treated as end of stream; a
                // full-size read always gets a following probe chunk, so a
                // genuinely exhausted stream ends with one empty LAST chunk.
                let is_last = read == 0;
                Ok((buffer, is_last))
            }
        }
    }

    async fn handle_data(&self, endpoint_id: &str, header: PayloadHeader, chunk: PayloadChunk) {
        let key = (endpoint_id.to_string(), header.id);
        let mut incoming = self.incoming.write().await;

        if !incoming.contains_key(&key) {
            drop(incoming);
            self.listener.on_payload_started(endpoint_id, header).await;
            incoming = self.incoming.write().await;
            incoming.insert(
                key.clone(),
                IncomingPayload {
                    header,
                    expected_offset: 0,
                },
            );
        }

        let Some(state) = incoming.get_mut(&key) else {
            return;
        };
        if chunk.offset != state.expected_offset {
            let expected = state.expected_offset;
            incoming.remove(&key);
            drop(incoming);
            warn!(
                endpoint_id,
                payload_id = header.id,
                expected,
                actual = chunk.offset,
                "payload chunk offset mismatch, canceling the incoming transfer"
            );
            let control = ControlMessage {
                event: ControlEvent::Canceled,
                offset: expected,
            };
            self.endpoint_manager
                .send_control(header, control, std::slice::from_ref(&endpoint_id.to_string()))
                .await;
            self.listener
                .on_payload_chunk(endpoint_id, header.id, IncomingEvent::Canceled)
                .await;
            return;
        }
        state.expected_offset += chunk.body.len() as i64;
        let is_last = chunk.is_last_chunk();
        drop(incoming);

        if !chunk.body.is_empty() {
            self.listener
                .on_payload_chunk(endpoint_id, header.id, IncomingEvent::Chunk(chunk.body))
                .await;
        }
        if is_last {
            self.incoming.write().await.remove(&key);
            self.listener
                .on_payload_chunk(endpoint_id, header.id, IncomingEvent::Complete)
                .await;
        }
    }

    async fn handle_control(&self, endpoint_id: &str, header: PayloadHeader, control: ControlMessage) {
        match control.event {
            ControlEvent::Canceled | ControlEvent::Error => {
                let key = (endpoint_id.to_string(), header.id);
                if self.incoming.write().await.remove(&key).is_some() {
                    self.listener
                        .on_payload_chunk(endpoint_id, header.id, IncomingEvent::Canceled)
                        .await;
                }
                // this device may also be sending the same payload id to
                // this endpoint; let the remote's cancellation stop it too.
                // Only the outgoing side here: cancel_incoming() scans by
                // payload id alone and would otherwise reach into an
                // unrelated inbound transfer of the same id from another
                // endpoint.
                if let Some(state) = self.outgoing.read().await.get(&header.id) {
                    state.cancel.store(true, Ordering::Release);
                }
            }
            other => {
                self.listener.on_remote_status(endpoint_id, header.id, other).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl FrameProcessor for PayloadManager {
    async fn process(&self, endpoint_id: &str, frame: Frame) {
        let Frame::PayloadTransfer(transfer) = frame else {
            debug!(endpoint_id, "payload manager received a non-payload frame");
            return;
        };
        match transfer.body {
            PayloadBody::Data(chunk) => self.handle_data(endpoint_id, transfer.header, chunk).await,
            PayloadBody::Control(control) => {
                self.handle_control(endpoint_id, transfer.header, control).await
            }
        }
    }

    async fn on_endpoint_disconnect(&self, endpoint_id: &str) {
        let mut incoming = self.incoming.write().await;
        let lost: Vec<i64> = incoming
            .keys()
            .filter(|(id, _)| id == endpoint_id)
            .map(|(_, payload_id)| *payload_id)
            .collect();
        incoming.retain(|(id, _), _| id != endpoint_id);
        drop(incoming);
        for payload_id in lost {
            info!(endpoint_id, payload_id, "endpoint disconnected mid-transfer");
            self.listener
                .on_payload_chunk(endpoint_id, payload_id, IncomingEvent::Canceled)
                .await;
        }
    }
}
