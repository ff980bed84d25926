// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-remote-peer record a [`crate::session::ClientSession`] keeps,
//! spec.md §3's `Endpoint` entity.

use crate::listener::{ConnectionListener, PayloadListener};
use nearby_core::{Medium, Role};
use std::sync::Arc;

/// Which side asked for the connection.
pub use nearby_core::Role as Direction;

/// An endpoint's position in the connection lifecycle, spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Requesting,
    Pending,
    Authenticating,
    LocalResponded,
    RemoteResponded,
    Connected,
    Upgrading,
    Disconnected,
}

/// Tracks which side(s) have called accept/reject so a second call from the
/// same side reports `OutOfOrderApiCall` rather than silently overwriting
/// the first response, spec.md §4.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseBitmask {
    pub local: Option<bool>,
    pub remote: Option<bool>,
}

impl ResponseBitmask {
    pub fn both_accepted(&self) -> bool {
        self.local == Some(true) && self.remote == Some(true)
    }

    pub fn either_rejected(&self) -> bool {
        self.local == Some(false) || self.remote == Some(false)
    }
}

/// A remote peer known to a [`crate::session::ClientSession`].
pub struct Endpoint {
    pub endpoint_id: String,
    pub endpoint_info: Vec<u8>,
    pub direction: Direction,
    pub state: ConnectionState,
    pub response: ResponseBitmask,
    pub human_readable_token: String,
    pub raw_auth_token: [u8; 32],
    pub medium: Medium,
    pub upgrade_mediums: Vec<Medium>,
    /// The advertise/discover service this endpoint was found or requested
    /// under, needed again to dial a bandwidth-upgrade medium.
    pub service_id: String,
    /// Set once the host calls `request_connection`/`accept_connection`, or
    /// when an inbound CONNECTION_REQUEST is accepted for dispatch. Absent
    /// for a merely-`Discovered` endpoint, which has no listener yet.
    pub connection_listener: Option<Arc<dyn ConnectionListener>>,
    pub payload_listener: Option<Arc<dyn PayloadListener>>,
}

impl Endpoint {
    pub fn new_discovered(
        endpoint_id: String,
        endpoint_info: Vec<u8>,
        medium: Medium,
        service_id: String,
    ) -> Self {
        Self {
            endpoint_id,
            endpoint_info,
            direction: Role::Responder,
            state: ConnectionState::Discovered,
            response: ResponseBitmask::default(),
            human_readable_token: String::new(),
            raw_auth_token: [0u8; 32],
            medium,
            upgrade_mediums: Vec::new(),
            service_id,
            connection_listener: None,
            payload_listener: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_bitmask_requires_both_sides_to_accept() {
        let mut response = ResponseBitmask::default();
        assert!(!response.both_accepted());
        response.local = Some(true);
        assert!(!response.both_accepted());
        response.remote = Some(true);
        assert!(response.both_accepted());
    }

    #[test]
    fn either_side_rejecting_is_detected() {
        let mut response = ResponseBitmask::default();
        response.remote = Some(false);
        assert!(response.either_rejected());
    }
}
