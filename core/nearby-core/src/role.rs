// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

/// Which side of a connection attempt an endpoint represents.
///
/// Mirrors the client/server duality of an ordinary endpoint type, but
/// named for what the connections core actually distinguishes: who asked
/// for the connection (`request_connection`) versus who is being asked
/// (`accept_connection`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// This side initiated `request_connection` and drives the UKEY2 client role.
    Initiator,
    /// This side is responding to an incoming connection and drives the UKEY2 server role.
    Responder,
}

impl Role {
    /// Returns true if this side initiated the connection.
    pub fn is_initiator(self) -> bool {
        self == Self::Initiator
    }

    /// Returns true if this side is responding to the connection.
    pub fn is_responder(self) -> bool {
        self == Self::Responder
    }

    /// Returns the [`Role`] the peer is playing.
    pub fn peer_role(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Identifies which side of an exchange produced a given outcome (e.g. who
/// closed a connection, or who rejected it). Distinct from [`Role`]: a
/// connection keeps its `Role` for its whole lifetime, but a `Location` is
/// attached to a single event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    /// The event originated from this process.
    Local,
    /// The event originated from the remote peer.
    Remote,
}

impl Location {
    /// Returns true if the event originated locally.
    pub fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }

    /// Returns true if the event originated from the peer.
    pub fn is_remote(self) -> bool {
        matches!(self, Self::Remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_role_is_involutive() {
        for role in [Role::Initiator, Role::Responder] {
            assert_eq!(role.peer_role().peer_role(), role);
        }
        assert_eq!(Role::Initiator.peer_role(), Role::Responder);
    }

    #[test]
    fn location_predicates() {
        assert!(Location::Local.is_local());
        assert!(!Location::Local.is_remote());
        assert!(Location::Remote.is_remote());
    }
}
