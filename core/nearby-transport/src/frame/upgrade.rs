// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::frame::error::{FrameError, FrameResult};
use crate::frame::wire::*;
use nearby_codec::{DecoderBuffer, Encoder, EncoderValue};
use nearby_core::Medium;
use std::net::IpAddr;
use std::str::FromStr;

/// Medium-specific connection details for the new medium, per spec.md §4.4.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    WifiHotspot {
        ssid: String,
        password: String,
        gateway: String,
    },
    WifiDirect {
        ssid: String,
        password: String,
        frequency: i32,
    },
    WifiLan {
        ip_address: String,
        port: i32,
    },
    Bluetooth {
        service_name: String,
        mac: String,
    },
    WebRtc {
        peer_id: String,
    },
}

impl Credentials {
    fn wire_tag(&self) -> u8 {
        match self {
            Self::WifiHotspot { .. } => 0,
            Self::WifiDirect { .. } => 1,
            Self::WifiLan { .. } => 2,
            Self::Bluetooth { .. } => 3,
            Self::WebRtc { .. } => 4,
        }
    }
}

/// `^DIRECT-[A-Za-z0-9]{2}.*`, spec.md §4.4, without pulling in a regex
/// engine for one fixed-shape prefix check.
fn matches_wifi_direct_ssid(ssid: &str) -> bool {
    let Some(rest) = ssid.strip_prefix("DIRECT-") else {
        return false;
    };
    let mut chars = rest.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
}

/// UPGRADE_PATH_AVAILABLE's payload: the new medium plus its credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradePathInfo {
    pub medium: Medium,
    pub credentials: Credentials,
}

impl UpgradePathInfo {
    /// spec.md §4.4: validation is keyed off `medium`, which chooses which
    /// credentials sub-message is required and how it is shaped.
    pub fn validate(&self) -> FrameResult<()> {
        match (&self.medium, &self.credentials) {
            (Medium::WifiHotspot, Credentials::WifiHotspot { ssid, password, gateway }) => {
                if ssid.is_empty() {
                    return Err(FrameError::MissingField("credentials.ssid"));
                }
                if !(8..=64).contains(&password.len()) {
                    return Err(FrameError::InvalidValue("credentials.password"));
                }
                if IpAddr::from_str(gateway).is_err() {
                    return Err(FrameError::InvalidValue("credentials.gateway"));
                }
                Ok(())
            }
            (Medium::WifiDirect, Credentials::WifiDirect { ssid, password, frequency }) => {
                if !matches_wifi_direct_ssid(ssid) {
                    return Err(FrameError::InvalidValue("credentials.ssid"));
                }
                if ssid.len() >= 32 {
                    return Err(FrameError::InvalidValue("credentials.ssid"));
                }
                if !(8..=64).contains(&password.len()) {
                    return Err(FrameError::InvalidValue("credentials.password"));
                }
                if *frequency < -1 {
                    return Err(FrameError::InvalidValue("credentials.frequency"));
                }
                Ok(())
            }
            (Medium::WifiLan, Credentials::WifiLan { ip_address, port }) => {
                if ip_address.is_empty() {
                    return Err(FrameError::MissingField("credentials.ip_address"));
                }
                if *port < 0 {
                    return Err(FrameError::InvalidValue("credentials.port"));
                }
                Ok(())
            }
            (Medium::BluetoothClassic | Medium::Ble, Credentials::Bluetooth { service_name, mac }) => {
                if service_name.is_empty() {
                    return Err(FrameError::MissingField("credentials.service_name"));
                }
                if mac.is_empty() {
                    return Err(FrameError::MissingField("credentials.mac"));
                }
                Ok(())
            }
            (Medium::WebRtc, Credentials::WebRtc { peer_id }) => {
                if peer_id.is_empty() {
                    return Err(FrameError::MissingField("credentials.peer_id"));
                }
                Ok(())
            }
            _ => Err(FrameError::InvalidValue("upgrade_path_info.credentials")),
        }
    }

    pub(crate) fn encode_body<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.medium.wire_tag());
        encoder.encode(&self.credentials.wire_tag());
        match &self.credentials {
            Credentials::WifiHotspot { ssid, password, gateway } => {
                encode_str(encoder, ssid);
                encode_str(encoder, password);
                encode_str(encoder, gateway);
            }
            Credentials::WifiDirect { ssid, password, frequency } => {
                encode_str(encoder, ssid);
                encode_str(encoder, password);
                encoder.encode(frequency);
            }
            Credentials::WifiLan { ip_address, port } => {
                encode_str(encoder, ip_address);
                encoder.encode(port);
            }
            Credentials::Bluetooth { service_name, mac } => {
                encode_str(encoder, service_name);
                encode_str(encoder, mac);
            }
            Credentials::WebRtc { peer_id } => {
                encode_str(encoder, peer_id);
            }
        }
    }

    pub(crate) fn decode_body(buffer: DecoderBuffer<'_>) -> FrameResult<(Self, DecoderBuffer<'_>)> {
        let (medium_tag, buffer) = decode_u8(buffer)?;
        let medium = Medium::from_wire_tag(medium_tag)
            .ok_or(FrameError::InvalidValue("upgrade_path_info.medium"))?;
        let (credentials_tag, buffer) = decode_u8(buffer)?;
        let (credentials, buffer) = match credentials_tag {
            0 => {
                let (ssid, buffer) = decode_str(buffer, "credentials.ssid")?;
                let (password, buffer) = decode_str(buffer, "credentials.password")?;
                let (gateway, buffer) = decode_str(buffer, "credentials.gateway")?;
                (Credentials::WifiHotspot { ssid, password, gateway }, buffer)
            }
            1 => {
                let (ssid, buffer) = decode_str(buffer, "credentials.ssid")?;
                let (password, buffer) = decode_str(buffer, "credentials.password")?;
                let (frequency, buffer) = decode_i32(buffer)?;
                (Credentials::WifiDirect { ssid, password, frequency }, buffer)
            }
            2 => {
                let (ip_address, buffer) = decode_str(buffer, "credentials.ip_address")?;
                let (port, buffer) = decode_i32(buffer)?;
                (Credentials::WifiLan { ip_address, port }, buffer)
            }
            3 => {
                let (service_name, buffer) = decode_str(buffer, "credentials.service_name")?;
                let (mac, buffer) = decode_str(buffer, "credentials.mac")?;
                (Credentials::Bluetooth { service_name, mac }, buffer)
            }
            4 => {
                let (peer_id, buffer) = decode_str(buffer, "credentials.peer_id")?;
                (Credentials::WebRtc { peer_id }, buffer)
            }
            other => return Err(FrameError::UnknownTag(other)),
        };
        let info = Self { medium, credentials };
        info.validate()?;
        Ok((info, buffer))
    }
}

/// BANDWIDTH_UPGRADE_NEGOTIATION's `event_type`, spec.md §3/§4.4.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeEvent {
    UpgradePathAvailable(UpgradePathInfo),
    ClientIntroduction { endpoint_id: String },
    LastWriteToPriorChannel,
    SafeToClosePriorChannel,
}

impl UpgradeEvent {
    fn wire_tag(&self) -> u8 {
        match self {
            Self::UpgradePathAvailable(_) => 0,
            Self::ClientIntroduction { .. } => 1,
            Self::LastWriteToPriorChannel => 2,
            Self::SafeToClosePriorChannel => 3,
        }
    }
}

/// BANDWIDTH_UPGRADE_NEGOTIATION, spec.md §6.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandwidthUpgradeNegotiation {
    pub event: UpgradeEvent,
}

impl BandwidthUpgradeNegotiation {
    /// spec.md §4.4: `event_type` present; CLIENT_INTRODUCTION needs a
    /// non-empty `endpoint_id`; UPGRADE_PATH_AVAILABLE validates its
    /// nested `UpgradePathInfo`.
    pub fn validate(&self) -> FrameResult<()> {
        match &self.event {
            UpgradeEvent::UpgradePathAvailable(info) => info.validate(),
            UpgradeEvent::ClientIntroduction { endpoint_id } => {
                if endpoint_id.is_empty() {
                    Err(FrameError::MissingField("client_introduction.endpoint_id"))
                } else {
                    Ok(())
                }
            }
            UpgradeEvent::LastWriteToPriorChannel | UpgradeEvent::SafeToClosePriorChannel => {
                Ok(())
            }
        }
    }

    pub(crate) fn encode_body<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.event.wire_tag());
        match &self.event {
            UpgradeEvent::UpgradePathAvailable(info) => info.encode_body(encoder),
            UpgradeEvent::ClientIntroduction { endpoint_id } => encode_str(encoder, endpoint_id),
            UpgradeEvent::LastWriteToPriorChannel | UpgradeEvent::SafeToClosePriorChannel => {}
        }
    }

    pub(crate) fn decode_body(buffer: DecoderBuffer<'_>) -> FrameResult<Self> {
        let (event_tag, buffer) = decode_u8(buffer)?;
        let (event, buffer) = match event_tag {
            0 => {
                let (info, buffer) = UpgradePathInfo::decode_body(buffer)?;
                (UpgradeEvent::UpgradePathAvailable(info), buffer)
            }
            1 => {
                let (endpoint_id, buffer) = decode_str(buffer, "client_introduction.endpoint_id")?;
                (UpgradeEvent::ClientIntroduction { endpoint_id }, buffer)
            }
            2 => (UpgradeEvent::LastWriteToPriorChannel, buffer),
            3 => (UpgradeEvent::SafeToClosePriorChannel, buffer),
            other => return Err(FrameError::UnknownTag(other)),
        };
        if !buffer.is_empty() {
            return Err(FrameError::TrailingBytes(buffer.len()));
        }
        let negotiation = Self { event };
        negotiation.validate()?;
        Ok(negotiation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn wifi_lan_path_round_trips() {
        let frame = Frame::BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiation {
            event: UpgradeEvent::UpgradePathAvailable(UpgradePathInfo {
                medium: Medium::WifiLan,
                credentials: Credentials::WifiLan {
                    ip_address: "10.0.0.5".into(),
                    port: 4242,
                },
            }),
        });
        let bytes = frame.encode();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn wifi_direct_ssid_must_match_prefix_shape() {
        let info = UpgradePathInfo {
            medium: Medium::WifiDirect,
            credentials: Credentials::WifiDirect {
                ssid: "NOT-DIRECT".into(),
                password: "longenoughpw".into(),
                frequency: 2412,
            },
        };
        assert!(info.validate().is_err());

        let info = UpgradePathInfo {
            medium: Medium::WifiDirect,
            credentials: Credentials::WifiDirect {
                ssid: "DIRECT-a1-extra".into(),
                password: "longenoughpw".into(),
                frequency: 2412,
            },
        };
        assert!(info.validate().is_ok());
    }

    #[test]
    fn empty_client_introduction_endpoint_id_fails() {
        let negotiation = BandwidthUpgradeNegotiation {
            event: UpgradeEvent::ClientIntroduction {
                endpoint_id: String::new(),
            },
        };
        assert!(negotiation.validate().is_err());
    }
}
