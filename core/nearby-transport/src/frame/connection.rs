// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::frame::error::{FrameError, FrameResult};
use crate::frame::wire::*;
use nearby_codec::{DecoderBuffer, Encoder, EncoderValue};
use nearby_core::Medium;

/// CONNECTION_REQUEST, spec.md §6: the opening message on a freshly
/// authenticated channel, carrying the endpoint's identity and the
/// mediums it is reachable over for a future bandwidth upgrade.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub endpoint_id: String,
    pub endpoint_info: Vec<u8>,
    pub nonce: i32,
    pub supports_5_ghz: bool,
    pub bssid: String,
    pub mediums: Vec<Medium>,
    pub keep_alive_interval_ms: u32,
    pub keep_alive_timeout_ms: u32,
}

impl ConnectionRequest {
    /// spec.md §4.4: `endpoint_id` present and non-empty, `endpoint_info` present.
    pub fn validate(&self) -> FrameResult<()> {
        if self.endpoint_id.is_empty() {
            return Err(FrameError::MissingField("endpoint_id"));
        }
        Ok(())
    }

    pub(crate) fn encode_body<E: Encoder>(&self, encoder: &mut E) {
        encode_str(encoder, &self.endpoint_id);
        encode_bytes(encoder, &self.endpoint_info);
        encoder.encode(&self.nonce);
        encode_bool(encoder, self.supports_5_ghz);
        encode_str(encoder, &self.bssid);
        encoder.encode(&(self.mediums.len() as u8));
        for medium in &self.mediums {
            encoder.encode(&medium.wire_tag());
        }
        encoder.encode(&self.keep_alive_interval_ms);
        encoder.encode(&self.keep_alive_timeout_ms);
    }

    pub(crate) fn decode_body(buffer: DecoderBuffer<'_>) -> FrameResult<Self> {
        let (endpoint_id, buffer) = decode_str(buffer, "endpoint_id")?;
        let (endpoint_info, buffer) = decode_bytes(buffer)?;
        let (nonce, buffer) = decode_i32(buffer)?;
        let (supports_5_ghz, buffer) = decode_bool(buffer)?;
        let (bssid, buffer) = decode_str(buffer, "bssid")?;
        let (medium_count, mut buffer) = decode_u8(buffer)?;
        let mut mediums = Vec::with_capacity(medium_count as usize);
        for _ in 0..medium_count {
            let (tag, rest) = decode_u8(buffer)?;
            buffer = rest;
            if let Some(medium) = Medium::from_wire_tag(tag) {
                mediums.push(medium);
            }
        }
        let (keep_alive_interval_ms, buffer) = decode_u32(buffer)?;
        let (keep_alive_timeout_ms, buffer) = decode_u32(buffer)?;
        if !buffer.is_empty() {
            return Err(FrameError::TrailingBytes(buffer.len()));
        }
        Ok(Self {
            endpoint_id,
            endpoint_info,
            nonce,
            supports_5_ghz,
            bssid,
            mediums,
            keep_alive_interval_ms,
            keep_alive_timeout_ms,
        })
    }
}

/// CONNECTION_RESPONSE, spec.md §6: forward-compatible, no required fields —
/// an unrecognized status is surfaced to the host rather than rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionResponse {
    pub status: i32,
}

impl ConnectionResponse {
    pub fn validate(&self) -> FrameResult<()> {
        Ok(())
    }

    pub(crate) fn encode_body<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.status);
    }

    pub(crate) fn decode_body(buffer: DecoderBuffer<'_>) -> FrameResult<Self> {
        let (status, buffer) = decode_i32(buffer)?;
        if !buffer.is_empty() {
            return Err(FrameError::TrailingBytes(buffer.len()));
        }
        Ok(Self { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn connection_request_round_trips() {
        let frame = Frame::ConnectionRequest(ConnectionRequest {
            endpoint_id: "ABCD".into(),
            endpoint_info: b"phone".to_vec(),
            nonce: 42,
            supports_5_ghz: true,
            bssid: "aa:bb".into(),
            mediums: vec![Medium::BluetoothClassic, Medium::WifiLan],
            keep_alive_interval_ms: 5000,
            keep_alive_timeout_ms: 30_000,
        });
        let bytes = frame.encode();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn empty_endpoint_id_fails_validation() {
        let request = ConnectionRequest {
            endpoint_id: String::new(),
            endpoint_info: vec![1],
            nonce: 0,
            supports_5_ghz: false,
            bssid: String::new(),
            mediums: vec![],
            keep_alive_interval_ms: 0,
            keep_alive_timeout_ms: 0,
        };
        assert!(request.validate().is_err());
    }
}
