// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-endpoint transport core: frame codec, the medium abstraction
//! external drivers plug into, authenticated channels, the endpoint
//! manager's reader/keep-alive workers, the payload manager's chunking and
//! reassembly, and the bandwidth-upgrade engine. `nearby-connections` is
//! the only intended consumer; nothing here knows about strategies,
//! sessions, or the host-facing API (spec.md §4.1/§4.2 live one layer up).

pub mod channel;
pub mod encryption;
pub mod endpoint_manager;
pub mod frame;
pub mod medium;
pub mod payload;
pub mod upgrade;

pub use channel::{Channel, ChannelError};
pub use encryption::{run_initiator, run_responder, EncryptionError};
pub use endpoint_manager::{DisconnectListener, EndpointManager, FrameProcessor, FrameType};
pub use medium::{Accepted, BoxedStream, DiscoveryEvent, DiscoverySink, MediumDriver, MediumError, MediumStream};
pub use payload::{IncomingEvent, Payload, PayloadContent, PayloadListener, PayloadManager, SendEvent};
pub use upgrade::{UpgradeEngine, UpgradeListener, UpgradeOutcome};
