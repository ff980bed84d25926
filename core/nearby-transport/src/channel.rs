// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! One authenticated byte stream to one endpoint, spec.md §3's `Channel`
//! entity: framed length-prefixed messages, encrypted with the session
//! keys a UKEY2-equivalent handshake produced, with last-read/last-write
//! timestamps for the keep-alive worker and a pause flag for payload
//! backpressure.

use crate::frame::{Frame, FrameError};
use crate::medium::BoxedStream;
use nearby_core::time::{Clock, Timestamp};
use nearby_core::Medium;
use nearby_crypto::{ChannelCipher, DecryptError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// A failure reading or writing a framed message on a channel. Distinct
/// from [`FrameError`]: these mean the *stream* is unreliable (I/O failure,
/// a forged/corrupted ciphertext) where `Frame(_)` means the stream is fine
/// but this one message didn't parse — spec.md §7's "protocol-level decode
/// failures... are logged and skipped; they never tear the channel down"
/// vs. "I/O failures on the current channel" which do.
#[derive(Debug, displaydoc::Display, thiserror::Error)]
pub enum ChannelError {
    /// I/O error on the channel: {0}
    Io(#[from] std::io::Error),
    /// inbound frame failed AEAD authentication
    Decrypt(#[from] DecryptError),
    /// frame exceeded the maximum wire length of {max} bytes (was {actual})
    TooLarge { max: usize, actual: usize },
    /// frame body failed to parse or validate: {0}
    Frame(#[from] FrameError),
}

impl ChannelError {
    /// Whether this failure indicates the underlying stream itself is
    /// broken (I/O error, forged ciphertext) as opposed to one malformed
    /// frame on an otherwise-healthy stream.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChannelError::Frame(_))
    }
}

/// Generous upper bound on a single frame's wire length, chosen well above
/// `Limits::payload_chunk_size` so a legitimate DATA frame always fits
/// while a corrupted length prefix can't cause an unbounded allocation.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// One authenticated byte stream to one endpoint.
pub struct Channel {
    medium: Medium,
    reader: Mutex<ReadHalf<BoxedStream>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    cipher: ChannelCipher,
    read_sequence: AtomicU64,
    write_sequence: AtomicU64,
    last_read: StdMutex<Timestamp>,
    last_write: StdMutex<Timestamp>,
    paused: AtomicBool,
}

impl Channel {
    pub fn new(medium: Medium, stream: BoxedStream, cipher: ChannelCipher, clock: &dyn Clock) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let now = clock.now();
        Self {
            medium,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            cipher,
            read_sequence: AtomicU64::new(0),
            write_sequence: AtomicU64::new(0),
            last_read: StdMutex::new(now),
            last_write: StdMutex::new(now),
            paused: AtomicBool::new(false),
        }
    }

    pub fn medium(&self) -> Medium {
        self.medium
    }

    pub fn last_read(&self) -> Timestamp {
        *self.last_read.lock().unwrap()
    }

    pub fn last_write(&self) -> Timestamp {
        *self.last_write.lock().unwrap()
    }

    /// spec.md §4.6's backpressure signal: stream payload send loops check
    /// this between chunks and suspend while it's set.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    fn associated_data(&self) -> [u8; 1] {
        [self.medium.wire_tag()]
    }

    /// Writes one frame, encrypted and length-prefixed. May be called
    /// concurrently by payload writers and the keep-alive worker; the
    /// internal mutex serializes them so a frame is never interleaved with
    /// another on the wire.
    pub async fn write_frame(&self, frame: &Frame, clock: &dyn Clock) -> Result<(), ChannelError> {
        let plaintext = frame.encode();
        let sequence = self.write_sequence.fetch_add(1, Ordering::Relaxed);
        let ciphertext = self
            .cipher
            .encrypt(sequence, &self.associated_data(), &plaintext);

        let mut writer = self.writer.lock().await;
        writer.write_u32(ciphertext.len() as u32).await?;
        writer.write_all(&ciphertext).await?;
        writer.flush().await?;
        drop(writer);

        *self.last_write.lock().unwrap() = clock.now();
        Ok(())
    }

    /// Reads and decrypts the next frame. A `Frame(_)` error means the
    /// stream is intact and the caller should simply read again; any other
    /// error means the channel is no longer usable.
    pub async fn read_frame(&self, clock: &dyn Clock) -> Result<Frame, ChannelError> {
        let mut reader = self.reader.lock().await;
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::TooLarge {
                max: MAX_FRAME_LEN,
                actual: len,
            });
        }
        let mut ciphertext = vec![0u8; len];
        reader.read_exact(&mut ciphertext).await?;
        drop(reader);

        *self.last_read.lock().unwrap() = clock.now();

        let sequence = self.read_sequence.fetch_add(1, Ordering::Relaxed);
        let plaintext = self
            .cipher
            .decrypt(sequence, &self.associated_data(), &ciphertext)?;
        Ok(Frame::decode(&plaintext)?)
    }

    /// Closes the underlying stream's write half, causing any pending read
    /// on the peer to observe EOF and any pending write here to fail. This
    /// is the mechanism by which reader/keep-alive workers exit per
    /// spec.md §5.
    pub async fn close(&self) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ConnectionResponse;
    use crate::medium::memory::{MemoryMedium, Network};
    use crate::medium::MediumDriver;
    use nearby_core::time::MonotonicClock;
    use zeroize::Zeroizing;

    fn test_cipher() -> ChannelCipher {
        ChannelCipher::from_key_material(&Zeroizing::new([3u8; 72]))
    }

    async fn connected_pair() -> (BoxedStream, BoxedStream) {
        let network = Network::new();
        let a = network.medium(Medium::WifiLan);
        let b = network.medium(Medium::WifiLan);
        a.advertise("svc", b"ABCD").await.unwrap();
        let accept_fut = a.accept("svc");
        let connect_fut = b.connect("ABCD", "svc");
        let (accepted, connected) = tokio::join!(accept_fut, connect_fut);
        (accepted.unwrap().stream, connected.unwrap())
    }

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (server_stream, client_stream) = connected_pair().await;
        let clock = MonotonicClock;
        let server = Channel::new(Medium::WifiLan, server_stream, test_cipher(), &clock);
        let client = Channel::new(Medium::WifiLan, client_stream, test_cipher(), &clock);

        let frame = Frame::ConnectionResponse(ConnectionResponse { status: 0 });
        client.write_frame(&frame, &clock).await.unwrap();
        let received = server.read_frame(&clock).await.unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn updates_last_read_and_write_timestamps() {
        let (server_stream, client_stream) = connected_pair().await;
        let clock = MonotonicClock;
        let server = Channel::new(Medium::WifiLan, server_stream, test_cipher(), &clock);
        let client = Channel::new(Medium::WifiLan, client_stream, test_cipher(), &clock);

        let before = client.last_write();
        client
            .write_frame(&Frame::KeepAlive, &clock)
            .await
            .unwrap();
        assert!(client.last_write() >= before);

        let before = server.last_read();
        server.read_frame(&clock).await.unwrap();
        assert!(server.last_read() >= before);
    }
}
