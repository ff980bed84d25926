// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! A generator of random data, parameterized so callers that need
//! unpredictability on the wire (endpoint ids, nonces) and callers that need
//! secrecy (client ids, key material) can be backed by different sources
//! without the rest of the core caring which.

use rand::RngCore;

/// A source of randomness used throughout the connections core.
///
/// The two methods provide the same functionality for different use cases:
/// one for "public" data that ends up on the wire in the clear (endpoint
/// ids, nonces), and one for "private" data that must remain secret (client
/// ids, handshake key material). Keeping them separate means a weakness in
/// one generation path can't be used to predict the other.
pub trait Generator: Send + Sync {
    /// Fills `dest` with unpredictable bytes that may be sent over the wire.
    fn public_random_fill(&mut self, dest: &mut [u8]);

    /// Fills `dest` with unpredictable bytes that must remain secret.
    fn private_random_fill(&mut self, dest: &mut [u8]);

    /// Returns a random `u64`, used for client ids and nonces.
    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.public_random_fill(&mut bytes);
        u64::from_le_bytes(bytes)
    }
}

/// The default [`Generator`], backed by the operating system's CSPRNG via
/// [`rand::rngs::OsRng`] for both public and private fills — there is no
/// operational reason to use distinct algorithms here, only distinct call
/// sites.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsGenerator;

impl Generator for OsGenerator {
    fn public_random_fill(&mut self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest);
    }

    fn private_random_fill(&mut self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest);
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::Generator;

    /// A deterministic generator for tests: reproducible, not secure.
    #[derive(Debug)]
    pub struct Deterministic {
        pub seed: u8,
    }

    impl Default for Deterministic {
        fn default() -> Self {
            Self { seed: 7 }
        }
    }

    impl Generator for Deterministic {
        fn public_random_fill(&mut self, dest: &mut [u8]) {
            let seed = self.seed;
            for (i, elem) in dest.iter_mut().enumerate() {
                *elem = seed ^ i as u8;
            }
            self.seed = self.seed.wrapping_add(1);
        }

        fn private_random_fill(&mut self, dest: &mut [u8]) {
            let seed = u8::MAX - self.seed;
            for (i, elem) in dest.iter_mut().enumerate() {
                *elem = seed ^ i as u8;
            }
            self.seed = self.seed.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_generator_is_reproducible() {
        let mut a = testing::Deterministic::default();
        let mut b = testing::Deterministic::default();
        let mut buf_a = [0u8; 16];
        let mut buf_b = [0u8; 16];
        a.public_random_fill(&mut buf_a);
        b.public_random_fill(&mut buf_b);
        assert_eq!(buf_a, buf_b);
    }
}
