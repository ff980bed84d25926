// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::frame::error::{FrameError, FrameResult};
use crate::frame::wire::*;
use nearby_codec::{DecoderBuffer, Encoder, EncoderValue};

/// Sentinel `total_size` meaning "indeterminate", for streams whose length
/// is not known up front. spec.md §3/§6.
pub const INDETERMINATE_SIZE: i64 = -1;

/// Flag bit 0 of [`PayloadChunk::flags`]: this chunk is the last one, and
/// its offset equals the total bytes transferred.
pub const LAST_CHUNK_FLAG: u32 = 0b1;

/// spec.md §3: the three payload kinds a host can send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    Bytes = 0,
    File = 1,
    Stream = 2,
}

impl PayloadType {
    fn from_wire(tag: u8) -> FrameResult<Self> {
        Ok(match tag {
            0 => Self::Bytes,
            1 => Self::File,
            2 => Self::Stream,
            _ => return Err(FrameError::InvalidValue("payload_header.type")),
        })
    }
}

/// Identifies a payload transfer across every frame that belongs to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadHeader {
    pub id: i64,
    pub r#type: PayloadType,
    pub total_size: i64,
}

impl PayloadHeader {
    pub(crate) fn encode_body<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.id);
        encoder.encode(&(self.r#type as u8));
        encoder.encode(&self.total_size);
    }

    fn decode_body(buffer: DecoderBuffer<'_>) -> FrameResult<(Self, DecoderBuffer<'_>)> {
        let (id, buffer) = decode_i64(buffer)?;
        let (type_tag, buffer) = decode_u8(buffer)?;
        let r#type = PayloadType::from_wire(type_tag)?;
        let (total_size, buffer) = decode_i64(buffer)?;
        Ok((
            Self {
                id,
                r#type,
                total_size,
            },
            buffer,
        ))
    }
}

/// Which of [`PayloadChunk`]/[`ControlMessage`] a PAYLOAD_TRANSFER carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Control = 1,
}

/// One fragment of a payload moving over the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadChunk {
    pub flags: u32,
    pub offset: i64,
    pub body: Vec<u8>,
}

impl PayloadChunk {
    pub fn is_last_chunk(&self) -> bool {
        self.flags & LAST_CHUNK_FLAG != 0
    }
}

/// spec.md §3's `RemoteStatus`: what the peer last reported about a
/// payload, carried in a [`ControlMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlEvent {
    Unknown = 0,
    Available = 1,
    Canceled = 2,
    Error = 3,
}

impl ControlEvent {
    fn from_wire(tag: u8) -> FrameResult<Self> {
        Ok(match tag {
            0 => Self::Unknown,
            1 => Self::Available,
            2 => Self::Canceled,
            3 => Self::Error,
            _ => return Err(FrameError::InvalidValue("control_message.event")),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    pub event: ControlEvent,
    pub offset: i64,
}

/// The two payload sub-message shapes a PAYLOAD_TRANSFER frame carries,
/// mutually exclusive per `packet_type`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadBody {
    Data(PayloadChunk),
    Control(ControlMessage),
}

/// PAYLOAD_TRANSFER, spec.md §6.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadTransfer {
    pub header: PayloadHeader,
    pub body: PayloadBody,
}

impl PayloadTransfer {
    pub fn packet_type(&self) -> PacketType {
        match self.body {
            PayloadBody::Data(_) => PacketType::Data,
            PayloadBody::Control(_) => PacketType::Control,
        }
    }

    /// spec.md §4.4's PAYLOAD_TRANSFER checks.
    pub fn validate(&self) -> FrameResult<()> {
        let total_size = self.header.total_size;
        let indeterminate = total_size == INDETERMINATE_SIZE;
        if !indeterminate && total_size < 0 {
            return Err(FrameError::InvalidValue("payload_header.total_size"));
        }
        match &self.body {
            PayloadBody::Data(chunk) => {
                if chunk.offset < 0 {
                    return Err(FrameError::InvalidValue("payload_chunk.offset"));
                }
                if !indeterminate && chunk.offset > total_size {
                    return Err(FrameError::InvalidValue("payload_chunk.offset"));
                }
                if chunk.body.is_empty() && !chunk.is_last_chunk() {
                    return Err(FrameError::MissingField("payload_chunk.body"));
                }
            }
            PayloadBody::Control(control) => {
                if control.offset < 0 {
                    return Err(FrameError::InvalidValue("control_message.offset"));
                }
                if !indeterminate && control.offset > total_size {
                    return Err(FrameError::InvalidValue("control_message.offset"));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn encode_body<E: Encoder>(&self, encoder: &mut E) {
        self.header.encode_body(encoder);
        encoder.encode(&(self.packet_type() as u8));
        match &self.body {
            PayloadBody::Data(chunk) => {
                encoder.encode(&chunk.flags);
                encoder.encode(&chunk.offset);
                encode_bytes(encoder, &chunk.body);
            }
            PayloadBody::Control(control) => {
                encoder.encode(&(control.event as u8));
                encoder.encode(&control.offset);
            }
        }
    }

    pub(crate) fn decode_body(buffer: DecoderBuffer<'_>) -> FrameResult<Self> {
        let (header, buffer) = PayloadHeader::decode_body(buffer)?;
        let (packet_tag, buffer) = decode_u8(buffer)?;
        let body = match packet_tag {
            0 => {
                let (flags, buffer) = decode_u32(buffer)?;
                let (offset, buffer) = decode_i64(buffer)?;
                let (body, buffer) = decode_bytes(buffer)?;
                if !buffer.is_empty() {
                    return Err(FrameError::TrailingBytes(buffer.len()));
                }
                PayloadBody::Data(PayloadChunk {
                    flags,
                    offset,
                    body,
                })
            }
            1 => {
                let (event_tag, buffer) = decode_u8(buffer)?;
                let event = ControlEvent::from_wire(event_tag)?;
                let (offset, buffer) = decode_i64(buffer)?;
                if !buffer.is_empty() {
                    return Err(FrameError::TrailingBytes(buffer.len()));
                }
                PayloadBody::Control(ControlMessage { event, offset })
            }
            _ => return Err(FrameError::InvalidValue("packet_type")),
        };
        let transfer = Self { header, body };
        transfer.validate()?;
        Ok(transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn header(total_size: i64) -> PayloadHeader {
        PayloadHeader {
            id: 7,
            r#type: PayloadType::Bytes,
            total_size,
        }
    }

    #[test]
    fn data_round_trips() {
        let frame = Frame::PayloadTransfer(PayloadTransfer {
            header: header(7),
            body: PayloadBody::Data(PayloadChunk {
                flags: LAST_CHUNK_FLAG,
                offset: 7,
                body: b"message".to_vec(),
            }),
        });
        let bytes = frame.encode();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn zero_length_non_final_chunk_fails_validation() {
        let transfer = PayloadTransfer {
            header: header(10),
            body: PayloadBody::Data(PayloadChunk {
                flags: 0,
                offset: 0,
                body: vec![],
            }),
        };
        assert!(transfer.validate().is_err());
    }

    #[test]
    fn offset_past_total_size_fails_validation() {
        let transfer = PayloadTransfer {
            header: header(4),
            body: PayloadBody::Data(PayloadChunk {
                flags: LAST_CHUNK_FLAG,
                offset: 5,
                body: vec![],
            }),
        };
        assert!(transfer.validate().is_err());
    }

    #[test]
    fn indeterminate_size_allows_any_offset() {
        let transfer = PayloadTransfer {
            header: header(INDETERMINATE_SIZE),
            body: PayloadBody::Control(ControlMessage {
                event: ControlEvent::Available,
                offset: 10_000,
            }),
        };
        assert!(transfer.validate().is_ok());
    }
}
