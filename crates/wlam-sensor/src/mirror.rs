//! Startup copy of the node radio's transmission parameters.

use serde::Serialize;
use tracing::warn;
use wlam_common::{LoraTag, RadioParams, UplinkPacket};
use wlam_lora::{dbm_to_mw, RadioEntity};

/// Radio parameters as they were when the node started.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadioSnapshot {
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Center frequency in Hz.
    pub center_frequency_hz: u32,
    /// Spreading factor.
    pub spreading_factor: u8,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Coding rate denominator.
    pub coding_rate: u8,
}

impl RadioSnapshot {
    /// Copy the given parameters.
    pub fn from_params(params: &RadioParams) -> Self {
        Self {
            tx_power_dbm: params.tx_power_dbm,
            center_frequency_hz: params.frequency_hz,
            spreading_factor: params.spreading_factor,
            bandwidth_hz: params.bandwidth_hz,
            coding_rate: params.coding_rate,
        }
    }

    /// Transmit power in linear milliwatts.
    pub fn tx_power_mw(&self) -> f64 {
        dbm_to_mw(self.tx_power_dbm)
    }

    /// Transmission metadata for one packet.
    pub fn to_tag(&self) -> LoraTag {
        LoraTag {
            tx_power_mw: self.tx_power_mw(),
            center_frequency_hz: self.center_frequency_hz,
            spreading_factor: self.spreading_factor,
            bandwidth_hz: self.bandwidth_hz,
            coding_rate: self.coding_rate,
        }
    }
}

/// Holds the snapshot, or nothing when the node has no radio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RadioMirror {
    snapshot: Option<RadioSnapshot>,
}

impl RadioMirror {
    /// Copy the parameters of `radio`. Later changes to the radio are not seen.
    pub fn capture(radio: Option<&dyn RadioEntity>) -> Self {
        match radio {
            Some(radio) => Self {
                snapshot: Some(RadioSnapshot::from_params(radio.radio_params())),
            },
            None => {
                warn!("no radio located, uplinks will be sent without transmission metadata");
                Self { snapshot: None }
            }
        }
    }

    /// The captured snapshot.
    pub fn snapshot(&self) -> Option<&RadioSnapshot> {
        self.snapshot.as_ref()
    }

    /// Attach the snapshot to an outgoing packet. No-op without a radio.
    pub fn tag(&self, packet: &mut UplinkPacket) {
        if let Some(snapshot) = &self.snapshot {
            packet.tag = Some(snapshot.to_tag());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wlam_common::{EntityId, SimTime};
    use wlam_lora::{default_radio_params, Radio};
    use wlam_metrics::MetricLabels;

    fn packet() -> UplinkPacket {
        UplinkPacket {
            node: "n".to_string(),
            payload: vec![0; 27],
            bitmap: 0x02,
            created_at: SimTime::ZERO,
            tag: None,
        }
    }

    #[test]
    fn test_capture_and_tag() {
        let mut params = default_radio_params();
        params.tx_power_dbm = -5.0;
        params.spreading_factor = 12;
        let radio = Radio::new(EntityId(1), params, EntityId(9), MetricLabels::new("n", "sensor"));

        let mirror = RadioMirror::capture(Some(&radio as &dyn RadioEntity));
        let mut pkt = packet();
        mirror.tag(&mut pkt);

        let tag = pkt.tag.unwrap();
        assert!((tag.tx_power_mw - 0.316_227_8).abs() < 1e-6);
        assert_eq!(tag.center_frequency_hz, 868_100_000);
        assert_eq!(tag.spreading_factor, 12);
        assert_eq!(tag.bandwidth_hz, 125_000);
        assert_eq!(tag.coding_rate, 5);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let radio = Radio::new(EntityId(1), default_radio_params(), EntityId(9), MetricLabels::new("n", "sensor"));
        let mirror = RadioMirror::capture(Some(&radio as &dyn RadioEntity));
        drop(radio);
        assert_eq!(mirror.snapshot().unwrap().spreading_factor, 7);
    }

    #[test]
    fn test_no_radio_leaves_packet_untagged() {
        let mirror = RadioMirror::capture(None);
        assert!(mirror.snapshot().is_none());
        let mut pkt = packet();
        mirror.tag(&mut pkt);
        assert!(pkt.tag.is_none());
    }
}
