// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

/// Failure modes for a single UKEY2-equivalent handshake message exchange.
///
/// None of these carry I/O errors — the caller in `nearby_transport` is the
/// one holding the channel and is responsible for turning a read/write
/// failure into `Status::EndpointIoError` per spec.md §7.
#[derive(Debug, displaydoc::Display, thiserror::Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// the peer's handshake message could not be parsed
    MalformedMessage,
    /// the peer's ephemeral public key was not a valid P-256 point
    InvalidPublicKey,
    /// the peer's ClientFinish commitment did not match the expected value
    CommitmentMismatch,
}
