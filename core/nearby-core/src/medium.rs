// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! The medium tag: a capability-set enum distinguishing the underlying
//! transport an endpoint is reachable over, dispatched by tag rather than by
//! inheritance (spec.md §9 "Polymorphism over mediums").

/// An underlying transport a [`Channel`](../../nearby_transport/channel/struct.Channel.html)
/// can run over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Medium {
    /// Bluetooth Classic (RFCOMM-style byte stream).
    BluetoothClassic = 1,
    /// Bluetooth Low Energy (GATT-based, low bandwidth).
    Ble = 2,
    /// An ordinary Wi-Fi LAN the two devices already share.
    WifiLan = 3,
    /// Wi-Fi Direct, a device-to-device Wi-Fi association.
    WifiDirect = 4,
    /// A locally-hosted Wi-Fi hotspot one side stands up for the other to join.
    WifiHotspot = 5,
    /// A WebRTC data channel, typically relayed through a signaling service.
    WebRtc = 6,
}

impl Medium {
    /// Returns the relative bandwidth ordering mediums are upgraded along.
    /// Higher is more desirable as an upgrade target.
    pub fn bandwidth_rank(self) -> u8 {
        match self {
            Medium::Ble => 0,
            Medium::BluetoothClassic => 1,
            Medium::WebRtc => 2,
            Medium::WifiHotspot => 3,
            Medium::WifiDirect => 4,
            Medium::WifiLan => 5,
        }
    }

    /// Returns true if `target` is a strict bandwidth upgrade over `self`.
    pub fn can_upgrade_to(self, target: Medium) -> bool {
        target.bandwidth_rank() > self.bandwidth_rank()
    }

    /// The wire tag used in CONNECTION_REQUEST.mediums and
    /// BANDWIDTH_UPGRADE_NEGOTIATION.UpgradePathInfo.medium.
    pub fn wire_tag(self) -> u8 {
        self as u8
    }

    /// Parses a wire tag back into a [`Medium`].
    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Medium::BluetoothClassic,
            2 => Medium::Ble,
            3 => Medium::WifiLan,
            4 => Medium::WifiDirect,
            5 => Medium::WifiHotspot,
            6 => Medium::WebRtc,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tag_round_trips() {
        for medium in [
            Medium::BluetoothClassic,
            Medium::Ble,
            Medium::WifiLan,
            Medium::WifiDirect,
            Medium::WifiHotspot,
            Medium::WebRtc,
        ] {
            assert_eq!(Medium::from_wire_tag(medium.wire_tag()), Some(medium));
        }
        assert_eq!(Medium::from_wire_tag(0), None);
        assert_eq!(Medium::from_wire_tag(200), None);
    }

    #[test]
    fn wifi_lan_outranks_bluetooth() {
        assert!(Medium::BluetoothClassic.can_upgrade_to(Medium::WifiLan));
        assert!(!Medium::WifiLan.can_upgrade_to(Medium::BluetoothClassic));
    }
}
