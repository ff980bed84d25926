// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{cipher::ChannelCipher, error::HandshakeError, to_human_readable, VERIFICATION_STRING_LEN};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::PublicKey;
use rand::{CryptoRng, RngCore};
use sha2::Sha512;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 32;
const COMMITMENT_LEN: usize = 32;

/// The three wire messages of the handshake, in the order spec.md §4.5
/// describes them: ClientInit, ServerInit, ClientFinish.
const HKDF_INFO_VERIFICATION: &[u8] = b"nearby-connections UKEY2 verification string";
const HKDF_INFO_COMMITMENT: &[u8] = b"nearby-connections UKEY2 commitment key";
const HKDF_INFO_CHANNEL: &[u8] = b"nearby-connections UKEY2 channel keys";

/// Encodes a length-prefixed (public key, nonce) pair — the shape shared by
/// ClientInit and ServerInit.
fn encode_init_message(public_key: &PublicKey, nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
    let point = public_key.to_encoded_point(true);
    let point_bytes = point.as_bytes();
    let mut out = Vec::with_capacity(2 + point_bytes.len() + NONCE_LEN);
    out.extend_from_slice(&(point_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(point_bytes);
    out.extend_from_slice(nonce);
    out
}

fn decode_init_message(bytes: &[u8]) -> Result<(PublicKey, [u8; NONCE_LEN]), HandshakeError> {
    if bytes.len() < 2 {
        return Err(HandshakeError::MalformedMessage);
    }
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let rest = &bytes[2..];
    if rest.len() != len + NONCE_LEN {
        return Err(HandshakeError::MalformedMessage);
    }
    let (point_bytes, nonce_bytes) = rest.split_at(len);
    let public_key =
        PublicKey::from_sec1_bytes(point_bytes).map_err(|_| HandshakeError::InvalidPublicKey)?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    Ok((public_key, nonce))
}

/// Runs the HKDF-SHA512 key schedule over the ECDH shared secret, binding
/// the full transcript (ClientInit || ServerInit) as salt so neither party
/// can influence the derived keys after seeing the other's contribution in
/// isolation.
struct KeySchedule {
    verification_string: [u8; VERIFICATION_STRING_LEN],
    commitment_key: [u8; 32],
    cipher: ChannelCipher,
}

fn derive(shared_secret: &p256::ecdh::SharedSecret, transcript: &[u8]) -> KeySchedule {
    let hkdf = Hkdf::<Sha512>::new(Some(transcript), shared_secret.raw_secret_bytes());

    let mut verification_string = [0u8; VERIFICATION_STRING_LEN];
    hkdf.expand(HKDF_INFO_VERIFICATION, &mut verification_string)
        .expect("32 bytes is a valid HKDF-SHA512 output length");

    let mut commitment_key = [0u8; 32];
    hkdf.expand(HKDF_INFO_COMMITMENT, &mut commitment_key)
        .expect("32 bytes is a valid HKDF-SHA512 output length");

    let mut channel_key_material = Zeroizing::new([0u8; 72]);
    hkdf.expand(HKDF_INFO_CHANNEL, channel_key_material.as_mut())
        .expect("72 bytes is a valid HKDF-SHA512 output length");
    let cipher = ChannelCipher::from_key_material(&channel_key_material);

    KeySchedule {
        verification_string,
        commitment_key,
        cipher,
    }
}

/// Derives a fresh channel cipher for a bandwidth upgrade's new medium from
/// the already-agreed `raw_auth_token`, keyed to `medium_tag` so upgrading to
/// two different mediums in sequence never reuses key material. Both sides
/// compute the same output independently — the token already matches on
/// both ends — so no further handshake round trip is needed to authenticate
/// the new channel.
pub fn derive_upgrade_cipher(
    raw_auth_token: &[u8; VERIFICATION_STRING_LEN],
    medium_tag: u8,
) -> ChannelCipher {
    let hkdf = Hkdf::<Sha512>::new(Some(&[medium_tag]), raw_auth_token);
    let mut channel_key_material = Zeroizing::new([0u8; 72]);
    hkdf.expand(HKDF_INFO_CHANNEL, channel_key_material.as_mut())
        .expect("72 bytes is a valid HKDF-SHA512 output length");
    ChannelCipher::from_key_material(&channel_key_material)
}

fn commitment_mac(commitment_key: &[u8; 32], transcript: &[u8]) -> [u8; COMMITMENT_LEN] {
    let mut mac =
        Hmac::<Sha512>::new_from_slice(commitment_key).expect("HMAC accepts any key length");
    mac.update(transcript);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; COMMITMENT_LEN];
    out.copy_from_slice(&full[..COMMITMENT_LEN]);
    out
}

/// The result of a successfully completed handshake, delivered to the
/// encryption runner's result callback per spec.md §4.5.
pub struct HandshakeOutput {
    /// The raw 32-byte auth token — equal on both sides.
    pub raw_auth_token: [u8; VERIFICATION_STRING_LEN],
    /// The 5-character uppercase alphanumeric form of `raw_auth_token`.
    pub human_readable_token: String,
    /// The derived per-direction AEAD state for the now-authenticated channel.
    pub cipher: ChannelCipher,
}

fn finish(key_schedule: KeySchedule) -> HandshakeOutput {
    let human_readable_token = to_human_readable(&key_schedule.verification_string);
    HandshakeOutput {
        raw_auth_token: key_schedule.verification_string,
        human_readable_token,
        cipher: key_schedule.cipher,
    }
}

/// Drives the client (initiator) side: generate ClientInit, consume
/// ServerInit, produce ClientFinish.
pub struct InitiatorHandshake {
    secret: EphemeralSecret,
    transcript: Vec<u8>,
}

impl InitiatorHandshake {
    /// Generates a fresh ephemeral P-256 keypair and returns the handshake
    /// state plus the serialized ClientInit message to write to the channel.
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> (Self, Vec<u8>) {
        let secret = EphemeralSecret::random(rng);
        let public = secret.public_key();
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let client_init = encode_init_message(&public, &nonce);
        (
            Self {
                secret,
                transcript: client_init.clone(),
            },
            client_init,
        )
    }

    /// Parses ServerInit, performs the ECDH, and returns the state ready to
    /// emit ClientFinish along with its serialized bytes.
    pub fn process_server_init(
        mut self,
        server_init: &[u8],
    ) -> Result<(ReadyToFinish, Vec<u8>), HandshakeError> {
        self.transcript.extend_from_slice(server_init);
        let (server_public, _server_nonce) = decode_init_message(server_init)?;

        let shared_secret = self.secret.diffie_hellman(&server_public);
        let key_schedule = derive(&shared_secret, &self.transcript);

        let commitment = commitment_mac(&key_schedule.commitment_key, &self.transcript);
        self.transcript.extend_from_slice(&commitment);

        Ok((ReadyToFinish { key_schedule }, commitment.to_vec()))
    }
}

/// Drives the server (responder) side: consume ClientInit, generate
/// ServerInit, consume and verify ClientFinish.
pub struct ResponderHandshake {
    secret: EphemeralSecret,
    transcript: Vec<u8>,
}

impl ResponderHandshake {
    /// Parses ClientInit, generates a fresh ephemeral keypair, and returns
    /// the handshake state plus the serialized ServerInit message.
    pub fn process_client_init<R: RngCore + CryptoRng>(
        rng: &mut R,
        client_init: &[u8],
    ) -> Result<(Self, Vec<u8>), HandshakeError> {
        // validate shape early so a malformed ClientInit never gets an ECDH computed against it
        let (_client_public, _client_nonce) = decode_init_message(client_init)?;

        let secret = EphemeralSecret::random(rng);
        let public = secret.public_key();
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let server_init = encode_init_message(&public, &nonce);

        let mut transcript = client_init.to_vec();
        transcript.extend_from_slice(&server_init);

        Ok((Self { secret, transcript }, server_init))
    }

    /// Parses and verifies ClientFinish's commitment, completing the
    /// handshake on success.
    pub fn process_client_finish(
        self,
        client_init: &[u8],
        client_finish: &[u8],
    ) -> Result<HandshakeOutput, HandshakeError> {
        let (client_public, _client_nonce) = decode_init_message(client_init)?;
        let shared_secret = self.secret.diffie_hellman(&client_public);
        let key_schedule = derive(&shared_secret, &self.transcript);

        if client_finish.len() != COMMITMENT_LEN {
            return Err(HandshakeError::MalformedMessage);
        }
        let expected = commitment_mac(&key_schedule.commitment_key, &self.transcript);
        if expected.ct_eq(client_finish).unwrap_u8() != 1 {
            return Err(HandshakeError::CommitmentMismatch);
        }

        Ok(finish(key_schedule))
    }
}

/// The initiator, having derived the session keys, is ready to emit
/// ClientFinish; calling [`Self::complete`] finalizes the handshake output
/// the same way the responder's [`ResponderHandshake::process_client_finish`]
/// does, so both sides arrive at an identical [`HandshakeOutput`].
pub struct ReadyToFinish {
    key_schedule: KeySchedule,
}

impl ReadyToFinish {
    pub fn complete(self) -> HandshakeOutput {
        finish(self.key_schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn initiator_and_responder_agree_on_auth_token() {
        let mut rng = OsRng;

        let (initiator, client_init) = InitiatorHandshake::new(&mut rng);
        let (responder, server_init) =
            ResponderHandshake::process_client_init(&mut rng, &client_init).unwrap();

        let (ready, client_finish) = initiator.process_server_init(&server_init).unwrap();
        let responder_output = responder
            .process_client_finish(&client_init, &client_finish)
            .unwrap();
        let initiator_output = ready.complete();

        assert_eq!(
            initiator_output.raw_auth_token,
            responder_output.raw_auth_token
        );
        assert_eq!(
            initiator_output.human_readable_token,
            responder_output.human_readable_token
        );
        assert_eq!(initiator_output.human_readable_token.len(), 5);
        assert!(initiator_output
            .human_readable_token
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn tampered_client_finish_is_rejected() {
        let mut rng = OsRng;

        let (initiator, client_init) = InitiatorHandshake::new(&mut rng);
        let (responder, server_init) =
            ResponderHandshake::process_client_init(&mut rng, &client_init).unwrap();

        let (_ready, mut client_finish) = initiator.process_server_init(&server_init).unwrap();
        client_finish[0] ^= 0xff;

        let result = responder.process_client_finish(&client_init, &client_finish);
        assert!(matches!(result, Err(HandshakeError::CommitmentMismatch)));
    }

    #[test]
    fn malformed_server_init_is_rejected() {
        let mut rng = OsRng;
        let (initiator, _client_init) = InitiatorHandshake::new(&mut rng);
        let result = initiator.process_server_init(&[0u8; 3]);
        assert!(matches!(result, Err(HandshakeError::MalformedMessage)));
    }
}
