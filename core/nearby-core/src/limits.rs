// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-component configuration, gathered into one [`Limits`] so a host can
//! tune timeouts without reaching into each component individually. Grounded
//! on the `Limits`/builder pattern the teacher uses for
//! `connection::Limits`/`endpoint::Limits`.

use std::time::Duration;

/// Tunable timeouts and sizes for a [`ClientSession`](../../nearby_connections/struct.ClientSession.html).
///
/// All fields have defaults drawn from spec.md §5's "typical values"; hosts
/// that need the other generation's defaults (spec.md §9's open question
/// about "v1" vs "v2" keep-alive defaults) construct their own `Limits`
/// rather than relying on an inferred default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// How often the keep-alive worker writes a KEEP_ALIVE frame.
    pub keep_alive_interval: Duration,
    /// How long since the last successful read before an endpoint is aborted.
    pub keep_alive_read_timeout: Duration,
    /// Wall-clock deadline for a single UKEY2 handshake attempt.
    pub handshake_timeout: Duration,
    /// Bound the endpoint manager waits for all frame processors to release
    /// state for a disconnecting endpoint before proceeding anyway.
    pub disconnection_processing_timeout: Duration,
    /// Wire chunk size used by the payload fragmenter.
    pub payload_chunk_size: usize,
    /// Floor under which a bandwidth upgrade's prior-channel close is delayed
    /// after the SAFE_TO_CLOSE_PRIOR_CHANNEL exchange completes.
    pub upgrade_min_close_delay: Duration,
}

impl Limits {
    /// spec.md §5's "typical values": keep-alive every 5s, read timeout 30s.
    pub const fn defaults() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(5),
            keep_alive_read_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            disconnection_processing_timeout: Duration::from_secs(5),
            payload_chunk_size: 64 * 1024,
            upgrade_min_close_delay: Duration::from_secs(2),
        }
    }

    /// Starts a [`Builder`] seeded with the defaults.
    pub fn builder() -> Builder {
        Builder(Self::defaults())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Builds a [`Limits`] one field at a time, validating nothing is zero where
/// zero would make a worker spin.
#[derive(Clone, Copy, Debug)]
pub struct Builder(Limits);

impl Builder {
    pub fn keep_alive_interval(mut self, value: Duration) -> Self {
        self.0.keep_alive_interval = value;
        self
    }

    pub fn keep_alive_read_timeout(mut self, value: Duration) -> Self {
        self.0.keep_alive_read_timeout = value;
        self
    }

    pub fn handshake_timeout(mut self, value: Duration) -> Self {
        self.0.handshake_timeout = value;
        self
    }

    pub fn disconnection_processing_timeout(mut self, value: Duration) -> Self {
        self.0.disconnection_processing_timeout = value;
        self
    }

    pub fn payload_chunk_size(mut self, value: usize) -> Self {
        self.0.payload_chunk_size = value;
        self
    }

    pub fn upgrade_min_close_delay(mut self, value: Duration) -> Self {
        self.0.upgrade_min_close_delay = value;
        self
    }

    pub fn build(self) -> Limits {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_typical_values() {
        let limits = Limits::default();
        assert_eq!(limits.keep_alive_interval, Duration::from_secs(5));
        assert_eq!(limits.keep_alive_read_timeout, Duration::from_secs(30));
        assert_eq!(limits.handshake_timeout, Duration::from_secs(15));
        assert_eq!(limits.payload_chunk_size, 64 * 1024);
    }

    #[test]
    fn builder_overrides_individual_fields() {
        let limits = Limits::builder()
            .keep_alive_interval(Duration::from_secs(1))
            .build();
        assert_eq!(limits.keep_alive_interval, Duration::from_secs(1));
        assert_eq!(limits.handshake_timeout, Duration::from_secs(15));
    }
}
