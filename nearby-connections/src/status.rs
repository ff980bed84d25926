// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! The host-facing result type every API in [`crate::session`] resolves to,
//! spec.md §7.

/// The outcome of a host-facing operation. Distinct from `FrameError`/
/// `ChannelError`/`MediumError` (internal, `nearby_transport`-level):
/// `Status` is what a host sees after those internal failures are mapped
/// up through the session layer.
#[derive(Debug, displaydoc::Display, thiserror::Error)]
#[non_exhaustive]
pub enum Status {
    /// the operation completed successfully
    Success,
    /// an internal error occurred that was not otherwise mapped
    Error,
    /// this operation is not supported on the current platform or medium
    Unsupported,
    /// no device with that endpoint id is currently known
    EndpointUnknown,
    /// the endpoint is already connected
    AlreadyConnectedToEndpoint,
    /// a connection attempt to this endpoint is already in progress
    AlreadyConnecting,
    /// advertising is already in progress for this service
    AlreadyAdvertising,
    /// discovery is already in progress for this service
    AlreadyDiscovering,
    /// this strategy conflicts with one already active for a different service
    AlreadyListening,
    /// a different strategy is already active and cannot be replaced right now
    AlreadyHaveActiveStrategy,
    /// the requested connection was rejected by the remote endpoint
    ConnectionRejected,
    /// this endpoint is not currently connected
    NotConnectedToEndpoint,
    /// the authenticated channel's handshake did not complete in time
    EndpointIoError,
    /// the UKEY2-equivalent handshake failed to authenticate the peer
    AuthError,
    /// no payload with that id is in flight
    PayloadUnknown,
    /// the requested bandwidth medium is not available on this device
    BluetoothError,
    /// the requested bandwidth medium is not available on this device
    BleError,
    /// the requested bandwidth medium is not available on this device
    WifiLanError,
    /// out of order API call: {0}
    OutOfOrderApiCall(&'static str),
    /// operation canceled
    Canceled,
    /// reset performed
    Reset,
    /// a client must be attached to the router before calling this
    NotAttached,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_reports_as_success() {
        assert!(Status::Success.is_success());
        assert!(!Status::Error.is_success());
    }
}
