// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! The V1 outer frame (spec.md §4.4/§6) and its codec. Every channel
//! carries a sequence of these; `Channel` (see `crate::channel`) is
//! responsible for the outer length prefix, this module only knows how to
//! turn one frame body into bytes and back, and how to validate it.
//!
//! No schema-compiler dependency appears anywhere in the reference corpus
//! (the teacher hand-writes its QUIC frames against `nearby_codec`'s
//! `Encoder`/`EncoderValue` traits instead of generating them from a
//! `.proto`), so this frame set is hand-written the same way.

pub mod connection;
pub mod error;
pub mod payload;
pub mod upgrade;
mod wire;

pub use connection::{ConnectionRequest, ConnectionResponse};
pub use error::{FrameError, FrameResult};
pub use payload::{
    ControlEvent, ControlMessage, PacketType, PayloadBody, PayloadChunk, PayloadHeader,
    PayloadTransfer, PayloadType, INDETERMINATE_SIZE, LAST_CHUNK_FLAG,
};
pub use upgrade::{BandwidthUpgradeNegotiation, Credentials, UpgradeEvent, UpgradePathInfo};

use nearby_codec::{DecoderBuffer, Encoder, EncoderBuffer, EncoderValue};

pub(crate) type Tag = u8;

const TAG_CONNECTION_REQUEST: Tag = 1;
const TAG_CONNECTION_RESPONSE: Tag = 2;
const TAG_PAYLOAD_TRANSFER: Tag = 3;
const TAG_BANDWIDTH_UPGRADE_NEGOTIATION: Tag = 4;
const TAG_KEEP_ALIVE: Tag = 5;

/// The outer V1 frame, spec.md §3's Frame entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    PayloadTransfer(PayloadTransfer),
    BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiation),
    KeepAlive,
}

impl Frame {
    pub fn tag(&self) -> Tag {
        match self {
            Self::ConnectionRequest(_) => TAG_CONNECTION_REQUEST,
            Self::ConnectionResponse(_) => TAG_CONNECTION_RESPONSE,
            Self::PayloadTransfer(_) => TAG_PAYLOAD_TRANSFER,
            Self::BandwidthUpgradeNegotiation(_) => TAG_BANDWIDTH_UPGRADE_NEGOTIATION,
            Self::KeepAlive => TAG_KEEP_ALIVE,
        }
    }

    /// A short name for `tracing` fields and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionRequest(_) => "CONNECTION_REQUEST",
            Self::ConnectionResponse(_) => "CONNECTION_RESPONSE",
            Self::PayloadTransfer(_) => "PAYLOAD_TRANSFER",
            Self::BandwidthUpgradeNegotiation(_) => "BANDWIDTH_UPGRADE_NEGOTIATION",
            Self::KeepAlive => "KEEP_ALIVE",
        }
    }

    /// spec.md §4.4: validates the frame's required fields. Out-of-scope
    /// frame types (KEEP_ALIVE) "pass validation unchanged".
    pub fn validate(&self) -> FrameResult<()> {
        match self {
            Self::ConnectionRequest(frame) => frame.validate(),
            Self::ConnectionResponse(frame) => frame.validate(),
            Self::PayloadTransfer(frame) => frame.validate(),
            Self::BandwidthUpgradeNegotiation(frame) => frame.validate(),
            Self::KeepAlive => Ok(()),
        }
    }

    /// Serializes the tag byte followed by the frame body. Does not include
    /// the outer wire length prefix — that is `Channel`'s job.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; self.encoding_size_hint()];
        let mut encoder = EncoderBuffer::new(&mut buffer);
        encoder.encode(&self.tag());
        match self {
            Self::ConnectionRequest(frame) => frame.encode_body(&mut encoder),
            Self::ConnectionResponse(frame) => frame.encode_body(&mut encoder),
            Self::PayloadTransfer(frame) => frame.encode_body(&mut encoder),
            Self::BandwidthUpgradeNegotiation(frame) => frame.encode_body(&mut encoder),
            Self::KeepAlive => {}
        }
        let len = encoder.len();
        buffer.truncate(len);
        buffer
    }

    /// Generous upper bound for the scratch buffer; actual fields are
    /// variable-length so this is not load-bearing for correctness, only
    /// avoids reallocating while encoding.
    fn encoding_size_hint(&self) -> usize {
        match self {
            Self::PayloadTransfer(frame) => match &frame.body {
                PayloadBody::Data(chunk) => 64 + chunk.body.len(),
                PayloadBody::Control(_) => 64,
            },
            _ => 512,
        }
    }

    /// Decodes and validates a frame body (without the outer length
    /// prefix). spec.md §4.4: a failure here means `InvalidProtocolBuffer`,
    /// which callers must drop without tearing down the channel.
    pub fn decode(bytes: &[u8]) -> FrameResult<Self> {
        let buffer = DecoderBuffer::new(bytes);
        let (tag, buffer) = buffer.decode::<u8>().map_err(|_| FrameError::Truncated)?;
        let frame = match tag {
            TAG_CONNECTION_REQUEST => Self::ConnectionRequest(ConnectionRequest::decode_body(buffer)?),
            TAG_CONNECTION_RESPONSE => Self::ConnectionResponse(ConnectionResponse::decode_body(buffer)?),
            TAG_PAYLOAD_TRANSFER => Self::PayloadTransfer(PayloadTransfer::decode_body(buffer)?),
            TAG_BANDWIDTH_UPGRADE_NEGOTIATION => {
                Self::BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiation::decode_body(buffer)?)
            }
            TAG_KEEP_ALIVE => {
                if !buffer.is_empty() {
                    return Err(FrameError::TrailingBytes(buffer.len()));
                }
                Self::KeepAlive
            }
            other => return Err(FrameError::UnknownTag(other)),
        };
        frame.validate()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_round_trips() {
        let bytes = Frame::KeepAlive.encode();
        assert_eq!(Frame::decode(&bytes).unwrap(), Frame::KeepAlive);
    }

    #[test]
    fn unknown_tag_is_invalid_protocol_buffer() {
        let bytes = [200u8];
        assert!(matches!(Frame::decode(&bytes), Err(FrameError::UnknownTag(200))));
    }

    #[test]
    fn connection_response_has_no_required_fields() {
        let frame = Frame::ConnectionResponse(ConnectionResponse { status: -1 });
        let bytes = frame.encode();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }
}
