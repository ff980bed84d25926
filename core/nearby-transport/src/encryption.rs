// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! The encryption runner: drives a [`nearby_crypto`] handshake to
//! completion against a raw medium stream, before any [`crate::channel`]
//! exists. spec.md §4.5's two one-shot state machines, each meant to run
//! on its own dedicated executor with a 15-second deadline — realized here
//! as plain `async fn`s the caller wraps in `tokio::time::timeout` and
//! `tokio::spawn`, per SPEC_FULL.md's concrete-realization table.

use crate::medium::BoxedStream;
use nearby_crypto::{HandshakeOutput, InitiatorHandshake, ResponderHandshake};
use rand::{CryptoRng, RngCore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A single byte written in place of a handshake message when this side
/// could not parse what it just read, so the peer doesn't hang waiting for
/// a reply that's never coming. spec.md §4.5 step 2.
const ALERT_TAG: u8 = 0xFF;

/// Failure modes for a full handshake attempt, spec.md §4.5/§7: any I/O
/// error, parse failure, or timeout "closes the channel and reports
/// encryption failure; the partially-initialized handshake is discarded."
#[derive(Debug, displaydoc::Display, thiserror::Error)]
pub enum EncryptionError {
    /// I/O error during handshake: {0}
    Io(#[from] std::io::Error),
    /// handshake message could not be parsed: {0}
    Handshake(#[from] nearby_crypto::HandshakeError),
    /// peer sent an alert instead of the expected handshake message
    PeerAlert,
}

async fn write_message(stream: &mut BoxedStream, message: &[u8]) -> std::io::Result<()> {
    stream.write_u32(message.len() as u32).await?;
    stream.write_all(message).await?;
    stream.flush().await
}

async fn write_alert(stream: &mut BoxedStream) {
    // best-effort: if this also fails there is nothing left to do but
    // report the original failure to the caller.
    let _ = write_message(stream, &[ALERT_TAG]).await;
}

async fn read_message(stream: &mut BoxedStream) -> Result<Vec<u8>, EncryptionError> {
    let len = stream.read_u32().await?;
    let mut buffer = vec![0u8; len as usize];
    stream.read_exact(&mut buffer).await?;
    if buffer == [ALERT_TAG] {
        return Err(EncryptionError::PeerAlert);
    }
    Ok(buffer)
}

/// Drives the initiator (client) side of the handshake: ClientInit,
/// read ServerInit, ClientFinish.
pub async fn run_initiator<R: RngCore + CryptoRng>(
    stream: &mut BoxedStream,
    rng: &mut R,
) -> Result<HandshakeOutput, EncryptionError> {
    let (initiator, client_init) = InitiatorHandshake::new(rng);
    write_message(stream, &client_init).await?;

    let server_init = read_message(stream).await?;
    let (ready, client_finish) = match initiator.process_server_init(&server_init) {
        Ok(ok) => ok,
        Err(error) => {
            write_alert(stream).await;
            return Err(error.into());
        }
    };
    write_message(stream, &client_finish).await?;

    Ok(ready.complete())
}

/// Drives the responder (server) side: read ClientInit, ServerInit,
/// read ClientFinish.
pub async fn run_responder<R: RngCore + CryptoRng>(
    stream: &mut BoxedStream,
    rng: &mut R,
) -> Result<HandshakeOutput, EncryptionError> {
    let client_init = read_message(stream).await?;
    let (responder, server_init) = match ResponderHandshake::process_client_init(rng, &client_init)
    {
        Ok(ok) => ok,
        Err(error) => {
            write_alert(stream).await;
            return Err(error.into());
        }
    };
    write_message(stream, &server_init).await?;

    let client_finish = read_message(stream).await?;
    let output = responder.process_client_finish(&client_init, &client_finish)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::memory::{MemoryMedium, Network};
    use crate::medium::MediumDriver;
    use nearby_core::Medium;
    use rand::rngs::OsRng;
    use std::time::Duration;
    use tokio::time::timeout;

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
    async fn initiator_and_responder_converge_over_a_real_stream() {
        let (mut server_stream, mut client_stream) = connected_pair().await;

        let server = tokio::spawn(async move {
            timeout(
                Duration::from_secs(15),
                run_responder(&mut server_stream, &mut OsRng),
            )
            .await
            .expect("handshake did not time out")
        });
        let client = tokio::spawn(async move {
            timeout(
                Duration::from_secs(15),
                run_initiator(&mut client_stream, &mut OsRng),
            )
            .await
            .expect("handshake did not time out")
        });

        let server_output = server.await.unwrap().unwrap();
        let client_output = client.await.unwrap().unwrap();
        assert_eq!(server_output.raw_auth_token, client_output.raw_auth_token);
        assert_eq!(
            server_output.human_readable_token,
            client_output.human_readable_token
        );
    }

    #[tokio::test]
    async fn initiator_times_out_if_responder_never_answers() {
        let (_server_stream, mut client_stream) = connected_pair().await;
        // server_stream is dropped without ever reading/writing, so the
        // initiator's read of ServerInit blocks until the timeout fires.
        let result = timeout(
            Duration::from_millis(50),
            run_initiator(&mut client_stream, &mut OsRng),
        )
        .await;
        assert!(result.is_err(), "expected the outer timeout to fire");
    }
}
