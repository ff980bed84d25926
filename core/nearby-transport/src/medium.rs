// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! The polymorphic medium interface, spec.md §4.8/§9: a capability-set
//! trait per underlying transport, dispatched by the caller holding a
//! `Box<dyn MediumDriver>` rather than by inheritance. Concrete medium
//! drivers (Bluetooth/BLE/Wi-Fi/WebRTC radios and their OS glue) are
//! external collaborators per spec.md §1 — this crate only defines the
//! seam they plug into.

use nearby_core::Medium;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// A failure probing, advertising on, discovering over, or connecting
/// through a medium driver. Mapped to the medium-specific members of
/// `nearby_connections::Status` (`BluetoothError`/`BleError`/`WifiLanError`)
/// at the host-facing layer.
#[derive(Debug, displaydoc::Display, thiserror::Error)]
#[non_exhaustive]
pub enum MediumError {
    /// the medium is not available on this device
    Unavailable,
    /// the remote endpoint could not be reached over this medium
    ConnectFailed,
    /// the underlying radio returned an error: {0}
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A connected, framed-at-a-higher-layer byte stream over one medium.
///
/// `Channel` (see `crate::channel`) is the only thing that should read or
/// write through this directly; everything above that deals in `Frame`s.
pub trait MediumStream: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}

impl<T> MediumStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}

pub type BoxedStream = Box<dyn MediumStream>;

/// One incoming connection accepted on an advertising listener, paired
/// with the medium it arrived over so the endpoint manager can record it.
pub struct Accepted {
    pub medium: Medium,
    pub stream: BoxedStream,
}

/// A found-or-lost notification for one service id, spec.md §4.8's
/// "discover(service_id) with found/lost ... events".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// `advertisement` is whatever bytes the remote passed to `advertise`
    /// — by convention in this workspace, the remote's endpoint id
    /// followed by its opaque endpoint info.
    Found { medium: Medium, advertisement: Vec<u8> },
    Lost { advertisement: Vec<u8> },
}

/// Where a [`MediumDriver`] delivers [`DiscoveryEvent`]s once
/// [`MediumDriver::discover`] is active for a service id. Registered once
/// per `discover` call rather than returned from it, since discovery is
/// long-lived and push-style (spec.md §4.8: "asynchronous notifications
/// use the core's executor model").
#[async_trait::async_trait]
pub trait DiscoverySink: Send + Sync {
    async fn on_discovery_event(&self, service_id: &str, event: DiscoveryEvent);
}

/// spec.md §4.8: availability probe; advertise/stop_advertise;
/// discover with found/lost events; connect/accept returning a
/// bidirectional stream; teardown.
#[async_trait::async_trait]
pub trait MediumDriver: Send + Sync {
    fn medium(&self) -> Medium;

    /// Whether this medium's radio is usable right now.
    async fn is_available(&self) -> bool;

    /// Begins advertising `service_id` with opaque `info` so peers
    /// discovering the same service id can find this device.
    async fn advertise(&self, service_id: &str, info: &[u8]) -> Result<(), MediumError>;

    /// Stops a previously started advertisement.
    async fn stop_advertise(&self, service_id: &str) -> Result<(), MediumError>;

    /// Begins discovering other devices advertising `service_id`, pushing
    /// found/lost notifications to `sink` for as long as discovery stays
    /// active (spec.md §6's push-style discovery listener).
    async fn discover(&self, service_id: &str, sink: Arc<dyn DiscoverySink>) -> Result<(), MediumError>;

    /// Stops a previously started discovery.
    async fn stop_discover(&self, service_id: &str) -> Result<(), MediumError>;

    /// Opens a new connection to a remote endpoint advertising `service_id`
    /// over this medium, returning the raw byte stream before any framing
    /// or encryption is layered on.
    async fn connect(
        &self,
        remote_endpoint_id: &str,
        service_id: &str,
    ) -> Result<BoxedStream, MediumError>;

    /// Accepts the next incoming connection for `service_id`. Callers loop
    /// on this the way spec.md §4.3's reader worker loops on channel reads.
    async fn accept(&self, service_id: &str) -> Result<Accepted, MediumError>;

    /// Releases any medium-specific resources (e.g. a hosted hotspot)
    /// associated with `service_id`. Idempotent.
    async fn teardown(&self, service_id: &str) -> Result<(), MediumError>;
}

pub mod memory;
