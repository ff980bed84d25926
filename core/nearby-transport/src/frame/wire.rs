// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! Small encode/decode helpers shared by every sub-frame in this module:
//! length-prefixed UTF-8 strings and bytes, and a one-byte bool. Mirrors the
//! teacher's per-value `EncoderValue`/`DecoderValue` impls, just scoped to
//! the field shapes spec.md §6 actually needs instead of a schema compiler.

use crate::frame::error::{FrameError, FrameResult};
use nearby_codec::{DecoderBuffer, Encoder, EncoderValue};

pub(crate) fn encode_str<E: Encoder>(encoder: &mut E, value: &str) {
    encoder.encode_with_len_prefix::<u16, _>(&value.as_bytes());
}

pub(crate) fn decode_str<'a>(
    buffer: DecoderBuffer<'a>,
    field: &'static str,
) -> FrameResult<(String, DecoderBuffer<'a>)> {
    let (slice, buffer) = buffer
        .decode_slice_with_len_prefix::<u16>()
        .map_err(|_| FrameError::Truncated)?;
    let s = String::from_utf8(slice.as_less_safe_slice().to_vec())
        .map_err(|_| FrameError::InvalidValue(field))?;
    Ok((s, buffer))
}

pub(crate) fn encode_bytes<E: Encoder>(encoder: &mut E, value: &[u8]) {
    encoder.encode_with_len_prefix::<u32, _>(&value);
}

pub(crate) fn decode_bytes<'a>(
    buffer: DecoderBuffer<'a>,
) -> FrameResult<(Vec<u8>, DecoderBuffer<'a>)> {
    let (slice, buffer) = buffer
        .decode_slice_with_len_prefix::<u32>()
        .map_err(|_| FrameError::Truncated)?;
    Ok((slice.as_less_safe_slice().to_vec(), buffer))
}

pub(crate) fn encode_bool<E: Encoder>(encoder: &mut E, value: bool) {
    encoder.encode(&(value as u8));
}

pub(crate) fn decode_bool(buffer: DecoderBuffer<'_>) -> FrameResult<(bool, DecoderBuffer<'_>)> {
    let (byte, buffer) = buffer.decode::<u8>().map_err(|_| FrameError::Truncated)?;
    Ok((byte != 0, buffer))
}

pub(crate) fn decode_u8(buffer: DecoderBuffer<'_>) -> FrameResult<(u8, DecoderBuffer<'_>)> {
    buffer.decode::<u8>().map_err(|_| FrameError::Truncated)
}

pub(crate) fn decode_i32(buffer: DecoderBuffer<'_>) -> FrameResult<(i32, DecoderBuffer<'_>)> {
    buffer.decode::<i32>().map_err(|_| FrameError::Truncated)
}

pub(crate) fn decode_i64(buffer: DecoderBuffer<'_>) -> FrameResult<(i64, DecoderBuffer<'_>)> {
    buffer.decode::<i64>().map_err(|_| FrameError::Truncated)
}

pub(crate) fn decode_u32(buffer: DecoderBuffer<'_>) -> FrameResult<(u32, DecoderBuffer<'_>)> {
    buffer.decode::<u32>().map_err(|_| FrameError::Truncated)
}
