// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-facing payload types, spec.md §4.6/§6. Thin re-exports over
//! `nearby_transport`'s payload machinery plus the one type it has no
//! reason to know about: the announcement a host gets when a new inbound
//! payload starts arriving.

use nearby_transport::frame::PayloadType;

pub use nearby_transport::frame::{ControlEvent, PayloadHeader};
pub use nearby_transport::{IncomingEvent, Payload, PayloadContent, SendEvent};

/// Announces a newly-arrived payload to a [`crate::listener::PayloadListener`]
/// before any of its chunks. `total_size` is `-1` when the sender did not
/// know the size up front.
#[derive(Clone, Debug)]
pub struct IncomingPayload {
    pub id: i64,
    pub payload_type: PayloadType,
    pub total_size: i64,
}

impl IncomingPayload {
    pub(crate) fn from_header(header: &PayloadHeader) -> Self {
        Self {
            id: header.id,
            payload_type: header.r#type,
            total_size: header.total_size,
        }
    }
}
