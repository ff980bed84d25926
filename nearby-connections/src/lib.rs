// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! Peer-to-peer connections core: the host-facing API a device uses to
//! advertise, discover, connect, authenticate, exchange payloads with, and
//! bandwidth-upgrade another device, spec.md §1/§4.1.
//!
//! [`ClientSession`] is the entry point. It shares a process-wide
//! [`Router`] with every other attached session so only one [`Strategy`] is
//! active at a time, and wires a `nearby_transport::EndpointManager`,
//! `PayloadManager`, and `UpgradeEngine` underneath it per spec.md §4.3/§4.6/§4.7.

pub mod endpoint;
pub mod listener;
pub mod payload;
pub mod router;
pub mod session;
pub mod status;
pub mod strategy;

pub use endpoint::{ConnectionState, Endpoint};
pub use listener::{ConnectionListener, DiscoveryListener, PayloadListener};
pub use payload::IncomingPayload;
pub use router::Router;
pub use session::ClientSession;
pub use status::Status;
pub use strategy::Strategy;
