// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network topology policy, spec.md §4.2/GLOSSARY. A [`Router`](crate::router::Router)
//! owns at most one active strategy at a time; every session that wants to
//! advertise or discover must agree on which one is in force.

/// Which topology a [`Router`](crate::router::Router) is currently enforcing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Many-to-many: any number of devices may be mutually connected.
    P2pCluster,
    /// One-to-many: one device connects outward to several others, each of
    /// which may only be connected to that one device.
    P2pStar,
    /// Exactly one connection at a time.
    P2pPointToPoint,
}

impl Strategy {
    /// Whether a session already connected under this strategy may accept
    /// another inbound or outbound connection.
    pub fn allows_additional_connection(self, current_endpoint_count: usize) -> bool {
        match self {
            Strategy::P2pCluster => true,
            Strategy::P2pStar => true,
            Strategy::P2pPointToPoint => current_endpoint_count == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_to_point_rejects_a_second_connection() {
        assert!(Strategy::P2pPointToPoint.allows_additional_connection(0));
        assert!(!Strategy::P2pPointToPoint.allows_additional_connection(1));
    }

    #[test]
    fn cluster_and_star_always_allow_more() {
        assert!(Strategy::P2pCluster.allows_additional_connection(5));
        assert!(Strategy::P2pStar.allows_additional_connection(5));
    }
}
