// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! A UKEY2-equivalent authenticated key agreement, fixed to the P256_SHA512
//! cipher suite per spec.md §4.5, plus the channel AEAD derived from it.
//!
//! This crate is pure computation: it produces and consumes the three
//! handshake messages (ClientInit, ServerInit, ClientFinish) as byte
//! buffers and never touches a socket. `nearby_transport::encryption`
//! drives it against a real [`Channel`](../../nearby_transport/channel/struct.Channel.html),
//! enforcing the 15-second deadline from spec.md §4.5/§5.

mod cipher;
mod error;
mod handshake;

pub use cipher::{ChannelCipher, DecryptError};
pub use error::HandshakeError;
pub use handshake::{
    derive_upgrade_cipher, HandshakeOutput, InitiatorHandshake, ReadyToFinish, ResponderHandshake,
};

/// Length in bytes of the UKEY2 verification string / raw auth token.
pub const VERIFICATION_STRING_LEN: usize = 32;

/// Length in characters of the human-readable auth token derived from it.
pub const HUMAN_TOKEN_LEN: usize = 5;

/// Upper-cases the first [`HUMAN_TOKEN_LEN`] base64 characters of `token`,
/// per spec.md §4.5/§6. Standard base64 can produce `+`/`/`, which are not
/// alphanumeric, so those two symbols are mapped onto digits — the token is
/// a display aid read aloud by a human, not key material, so this remapping
/// costs nothing.
fn to_human_readable(token: &[u8; VERIFICATION_STRING_LEN]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(token);
    encoded[..HUMAN_TOKEN_LEN]
        .to_ascii_uppercase()
        .chars()
        .map(|c| match c {
            '+' => '2',
            '/' => '9',
            other => other,
        })
        .collect()
}
