// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-facing callback traits, spec.md §4.1/§6. A host passes one of each
//! to `start_advertising`/`start_discovery`/`request_connection`/etc.; every
//! call here is best-effort and must not block the caller, so implementors
//! should hand off long work rather than do it inline.

use crate::payload::IncomingPayload;
use crate::status::Status;
use nearby_core::Medium;
use nearby_transport::frame::ControlEvent;
use nearby_transport::{IncomingEvent, SendEvent};

/// Notified as other devices advertising the discovered service come and go.
#[async_trait::async_trait]
pub trait DiscoveryListener: Send + Sync {
    async fn on_endpoint_found(&self, endpoint_id: &str, endpoint_info: &[u8], medium: Medium);
    async fn on_endpoint_lost(&self, endpoint_id: &str);
}

/// Notified of a connection's lifecycle, spec.md §5's ordering guarantee:
/// initiated → accepted/rejected → connected → bandwidth_changed* → disconnected.
#[async_trait::async_trait]
pub trait ConnectionListener: Send + Sync {
    async fn on_connection_initiated(&self, endpoint_id: &str, endpoint_info: &[u8], human_readable_token: &str);
    async fn on_connection_result(&self, endpoint_id: &str, status: Status);
    async fn on_bandwidth_changed(&self, endpoint_id: &str, medium: Medium);
    async fn on_disconnected(&self, endpoint_id: &str);
}

/// Notified as payloads arrive from, or finish sending to, one endpoint.
/// A host registers one of these alongside a [`ConnectionListener`] when it
/// accepts or requests a connection; `crate::session::ClientSession` looks it
/// up per endpoint and forwards `nearby_transport`'s process-wide payload
/// callbacks to it.
#[async_trait::async_trait]
pub trait PayloadListener: Send + Sync {
    /// A new payload has started arriving; `payload.total_size` is `-1` if
    /// the sender didn't know its size up front (an indeterminate stream).
    async fn on_payload_started(&self, endpoint_id: &str, payload: IncomingPayload);
    /// A chunk of a previously-announced payload, or its completion/cancellation.
    async fn on_payload_chunk(&self, endpoint_id: &str, payload_id: i64, event: IncomingEvent);
    /// The remote paused, resumed, or canceled its end of a payload we sent.
    async fn on_remote_status(&self, endpoint_id: &str, payload_id: i64, event: ControlEvent);
    /// Progress or completion of a payload we are sending.
    async fn on_send_update(&self, endpoint_id: &str, payload_id: i64, event: SendEvent);
}
