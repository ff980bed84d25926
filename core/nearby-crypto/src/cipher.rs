// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_PREFIX_LEN: usize = 4;
/// Two directional keys plus two directional nonce prefixes.
pub(crate) const KEY_MATERIAL_LEN: usize = 2 * (KEY_LEN + NONCE_PREFIX_LEN);

/// A failure to decrypt an inbound channel frame — either it was corrupted
/// in transit or it was not produced by the peer holding the matching key.
#[derive(Debug, displaydoc::Display, thiserror::Error)]
#[non_exhaustive]
pub enum DecryptError {
    /// AEAD authentication failed for the inbound frame
    AuthenticationFailed,
}

struct Direction {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl Direction {
    fn nonce_for(&self, sequence_number: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..NONCE_PREFIX_LEN].copy_from_slice(&self.nonce_prefix);
        bytes[NONCE_PREFIX_LEN..].copy_from_slice(&sequence_number.to_be_bytes());
        *Nonce::from_slice(&bytes)
    }
}

/// Per-direction AES-256-GCM state for an established channel, derived from
/// the UKEY2-equivalent handshake's key schedule.
///
/// Each direction gets its own key and nonce prefix so that a frame replayed
/// from the initiator-to-responder stream can never be mistaken for one
/// going the other way. The nonce is built from the fixed prefix plus a
/// caller-supplied monotonic sequence number — the caller (the endpoint
/// manager's per-channel state in spec.md §4.3) owns sequencing and must
/// never reuse a number within a direction.
pub struct ChannelCipher {
    encrypt_to_peer: Direction,
    decrypt_from_peer: Direction,
}

impl ChannelCipher {
    /// Builds a cipher directly from already-derived key material, bypassing
    /// the handshake. Used by the handshake's own key schedule and by tests
    /// that need a channel's AEAD state without running a full handshake.
    pub fn from_key_material(material: &Zeroizing<[u8; KEY_MATERIAL_LEN]>) -> Self {
        let (a, b) = material.split_at(KEY_LEN + NONCE_PREFIX_LEN);

        let (a_key, a_prefix) = a.split_at(KEY_LEN);
        let (b_key, b_prefix) = b.split_at(KEY_LEN);

        let mut encrypt_prefix = [0u8; NONCE_PREFIX_LEN];
        encrypt_prefix.copy_from_slice(a_prefix);
        let mut decrypt_prefix = [0u8; NONCE_PREFIX_LEN];
        decrypt_prefix.copy_from_slice(b_prefix);

        Self {
            encrypt_to_peer: Direction {
                cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(a_key)),
                nonce_prefix: encrypt_prefix,
            },
            decrypt_from_peer: Direction {
                cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(b_key)),
                nonce_prefix: decrypt_prefix,
            },
        }
    }

    /// Encrypts `plaintext` for sending to the peer, binding `sequence_number`
    /// into the nonce. The frame header (medium tag, length) is passed as
    /// `associated_data` so it is authenticated but not duplicated in the
    /// ciphertext.
    pub fn encrypt(
        &self,
        sequence_number: u64,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Vec<u8> {
        let nonce = self.encrypt_to_peer.nonce_for(sequence_number);
        self.encrypt_to_peer
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .expect("AES-256-GCM encryption of an in-memory buffer cannot fail")
    }

    /// Swaps the two directions. The handshake's key schedule derives one
    /// `ChannelCipher` from material that is identical on both ends of the
    /// transcript, so without this both sides would treat the same half of
    /// the material as "my outgoing key" and end up unable to talk to each
    /// other. By convention the responder (see `nearby_connections::session`
    /// and the bandwidth-upgrade acceptor) calls this once on the cipher it
    /// gets back from the handshake or `derive_upgrade_cipher`; the
    /// initiator uses its cipher as derived.
    pub fn swapped(self) -> Self {
        Self {
            encrypt_to_peer: self.decrypt_from_peer,
            decrypt_from_peer: self.encrypt_to_peer,
        }
    }

    /// Decrypts a frame received from the peer at `sequence_number`.
    pub fn decrypt(
        &self,
        sequence_number: u64,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecryptError> {
        let nonce = self.decrypt_from_peer.nonce_for(sequence_number);
        self.decrypt_from_peer
            .cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|_| DecryptError::AuthenticationFailed)
    }
}
