//! # wlam-metrics
//!
//! Metric names, labels and the in-memory recorder for the WLAM simulator.
//!
//! Entities emit through the [`metrics`] facade using the names in
//! [`metric_defs`], always with the labels produced by [`MetricLabels`].
//! The runner installs an [`InMemoryRecorder`] and exports its snapshot
//! at the end of a run.

pub mod recorder;

pub use metrics;
pub use recorder::{HistogramSummary, InMemoryRecorder, MetricsSnapshot, NodeMetrics};

use metrics::Unit;

// ============================================================================
// Metric Definitions
// ============================================================================

/// Kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Point-in-time value.
    Gauge,
    /// Distribution of samples.
    Histogram,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Static description of a metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    /// Metric name.
    pub name: &'static str,
    /// Metric kind.
    pub kind: MetricKind,
    /// Unit of measurement.
    pub unit: Option<Unit>,
    /// Human-readable description.
    pub description: &'static str,
    /// Labels emitted in addition to `node` and `node_type`.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    /// Unit as a display string (empty if unitless).
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            Some(unit) => unit.as_str(),
            None => "",
        }
    }
}

/// All metric definitions.
pub mod metric_defs {
    use super::{MetricDef, MetricKind};
    use metrics::Unit;

    /// Temperature readings.
    pub const SENSOR_TEMPERATURE: MetricDef = MetricDef {
        name: "wlam.sensor.temperature",
        kind: MetricKind::Histogram,
        unit: None,
        description: "Temperature readings in degrees Celsius, one per sample",
        labels: &[],
    };

    /// Humidity readings.
    pub const SENSOR_HUMIDITY: MetricDef = MetricDef {
        name: "wlam.sensor.humidity",
        kind: MetricKind::Histogram,
        unit: Some(Unit::Percent),
        description: "Relative humidity readings, one per sample (including samples coupled to temperature)",
        labels: &[],
    };

    /// NO2 readings.
    pub const SENSOR_NO2: MetricDef = MetricDef {
        name: "wlam.sensor.no2",
        kind: MetricKind::Histogram,
        unit: None,
        description: "NO2 concentration readings in µg/m³, one per sample",
        labels: &[],
    };

    /// Event counter value.
    pub const SENSOR_COUNTER: MetricDef = MetricDef {
        name: "wlam.sensor.counter",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Count),
        description: "Latest value of the event counter",
        labels: &[],
    };

    /// Packets handed to the transport by the application.
    pub const APP_PACKETS_SENT: MetricDef = MetricDef {
        name: "wlam.app.packets_sent",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Aggregated uplink packets sent, keyed by presence bitmap value",
        labels: &["bitmap"],
    };

    /// Encoded uplink size.
    pub const APP_PACKET_SIZE: MetricDef = MetricDef {
        name: "wlam.app.packet_size",
        kind: MetricKind::Histogram,
        unit: Some(Unit::Bytes),
        description: "Wire size of each aggregated uplink",
        labels: &[],
    };

    /// Packets transmitted by node radios.
    pub const RADIO_TX_PACKETS: MetricDef = MetricDef {
        name: "wlam.radio.tx_packets",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Packets put on the air",
        labels: &[],
    };

    /// Airtime spent transmitting.
    pub const RADIO_TX_AIRTIME: MetricDef = MetricDef {
        name: "wlam.radio.tx_airtime",
        kind: MetricKind::Counter,
        unit: Some(Unit::Microseconds),
        description: "Total time on air spent transmitting",
        labels: &[],
    };

    /// Transmitted packet sizes.
    pub const RADIO_TX_PACKET_SIZE: MetricDef = MetricDef {
        name: "wlam.radio.tx_packet_size",
        kind: MetricKind::Histogram,
        unit: Some(Unit::Bytes),
        description: "Size of transmitted packets",
        labels: &[],
    };

    /// Packets dropped because a newer one replaced them while the radio was busy.
    pub const RADIO_TX_DROPPED: MetricDef = MetricDef {
        name: "wlam.radio.tx_dropped",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Queued packets replaced by a newer uplink before the radio was free",
        labels: &[],
    };

    /// Packets received at the gateway.
    pub const GATEWAY_RX_PACKETS: MetricDef = MetricDef {
        name: "wlam.gateway.rx_packets",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Uplinks demodulated by the gateway",
        labels: &[],
    };

    /// Packets lost to weak signal.
    pub const GATEWAY_RX_WEAK: MetricDef = MetricDef {
        name: "wlam.gateway.rx_weak",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Uplinks lost because SNR was below the spreading factor threshold",
        labels: &[],
    };

    /// Packets lost to collision.
    pub const GATEWAY_RX_COLLIDED: MetricDef = MetricDef {
        name: "wlam.gateway.rx_collided",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Uplinks destroyed by an overlapping transmission",
        labels: &[],
    };

    /// Packets delivered without PHY metadata.
    pub const GATEWAY_RX_UNTAGGED: MetricDef = MetricDef {
        name: "wlam.gateway.rx_untagged",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Uplinks from nodes without a radio, delivered without PHY evaluation",
        labels: &[],
    };

    /// SNR of received packets.
    pub const GATEWAY_RX_SNR: MetricDef = MetricDef {
        name: "wlam.gateway.rx_snr",
        kind: MetricKind::Histogram,
        unit: None,
        description: "SNR in dB of demodulated uplinks",
        labels: &[],
    };

    /// RSSI of received packets.
    pub const GATEWAY_RX_RSSI: MetricDef = MetricDef {
        name: "wlam.gateway.rx_rssi",
        kind: MetricKind::Histogram,
        unit: None,
        description: "RSSI in dBm of demodulated uplinks",
        labels: &[],
    };

    /// Every metric, in display order.
    pub const ALL: &[MetricDef] = &[
        SENSOR_TEMPERATURE,
        SENSOR_HUMIDITY,
        SENSOR_NO2,
        SENSOR_COUNTER,
        APP_PACKETS_SENT,
        APP_PACKET_SIZE,
        RADIO_TX_PACKETS,
        RADIO_TX_AIRTIME,
        RADIO_TX_PACKET_SIZE,
        RADIO_TX_DROPPED,
        GATEWAY_RX_PACKETS,
        GATEWAY_RX_WEAK,
        GATEWAY_RX_COLLIDED,
        GATEWAY_RX_UNTAGGED,
        GATEWAY_RX_SNR,
        GATEWAY_RX_RSSI,
    ];
}

/// Register descriptions for every metric with the installed recorder.
pub fn describe_metrics() {
    for def in metric_defs::ALL {
        match (def.kind, def.unit) {
            (MetricKind::Counter, Some(unit)) => metrics::describe_counter!(def.name, unit, def.description),
            (MetricKind::Counter, None) => metrics::describe_counter!(def.name, def.description),
            (MetricKind::Gauge, Some(unit)) => metrics::describe_gauge!(def.name, unit, def.description),
            (MetricKind::Gauge, None) => metrics::describe_gauge!(def.name, def.description),
            (MetricKind::Histogram, Some(unit)) => metrics::describe_histogram!(def.name, unit, def.description),
            (MetricKind::Histogram, None) => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

// ============================================================================
// Labels
// ============================================================================

/// Standard labels attached to every metric emitted by an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    node: String,
    node_type: String,
}

impl MetricLabels {
    /// Create labels for a node.
    pub fn new(node: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            node_type: node_type.into(),
        }
    }

    /// Node name.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Node type.
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// Labels as a vector ready for the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("node", self.node.clone()), ("node_type", self.node_type.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_unique_and_prefixed() {
        let mut seen = HashSet::new();
        for def in metric_defs::ALL {
            assert!(def.name.starts_with("wlam."), "{} lacks prefix", def.name);
            assert!(seen.insert(def.name), "duplicate metric {}", def.name);
        }
    }

    #[test]
    fn test_labels() {
        let labels = MetricLabels::new("loRaNodes[3]", "sensor");
        assert_eq!(
            labels.to_labels(),
            vec![("node", "loRaNodes[3]".to_string()), ("node_type", "sensor".to_string())]
        );
        assert_eq!(metric_defs::RADIO_TX_AIRTIME.unit_str(), "microseconds");
        assert_eq!(metric_defs::SENSOR_TEMPERATURE.unit_str(), "");
    }
}
