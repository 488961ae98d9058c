//! Gateway receiver.
//!
//! The gateway hears every node radio. For each transmission it computes the
//! received power from the link's path loss, derives SNR against the thermal
//! noise floor, tracks overlapping receptions for collisions, and reports a
//! [`DeliveryEvent`] once the packet has left the air.

use crate::pathloss::PathLossModel;
use crate::{noise_floor_dbm, sample_gaussian, LoraPhyConfig, CAPTURE_EFFECT_THRESHOLD_DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use wlam_common::{
    DeliveryEvent, DeliveryOutcome, Entity, EntityId, Event, EventPayload, SimContext, SimError, SimTime,
    TransmitAirEvent, UplinkPacket,
};
use wlam_metrics::{metric_defs, metrics, MetricLabels};

/// Reception IDs are added to this to form the completion timer ID.
const TIMER_RX_COMPLETE_BASE: u64 = 0x1000;

/// Gateway receiver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Receiver noise figure in dB.
    pub noise_figure_db: f64,
    /// Standard deviation of log-normal shadowing in dB (0 disables).
    pub shadowing_sigma_db: f64,
    /// PHY constants.
    pub phy: LoraPhyConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            noise_figure_db: 6.0,
            shadowing_sigma_db: 0.0,
            phy: LoraPhyConfig::default(),
        }
    }
}

/// Link from one node radio to the gateway.
#[derive(Debug, Clone)]
pub struct NodeLink {
    /// Distance to the gateway in metres.
    pub distance_m: f64,
    /// Propagation model for this link.
    pub path_loss: PathLossModel,
    /// Labels of the transmitting node.
    pub labels: MetricLabels,
}

/// Running totals kept by the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    /// Demodulated uplinks.
    pub received: u64,
    /// Uplinks below the SNR threshold.
    pub weak: u64,
    /// Uplinks destroyed by collision.
    pub collided: u64,
    /// Uplinks delivered without PHY evaluation.
    pub untagged: u64,
}

#[derive(Debug, Clone)]
struct ActiveReception {
    reception_id: u64,
    radio_id: EntityId,
    packet: UplinkPacket,
    frequency_hz: u32,
    spreading_factor: u8,
    start_time: SimTime,
    end_time: SimTime,
    snr_db: f64,
    rssi_dbm: f64,
    collided: bool,
}

impl ActiveReception {
    fn overlaps(&self, other: &ActiveReception) -> bool {
        self.frequency_hz == other.frequency_hz
            && self.spreading_factor == other.spreading_factor
            && self.start_time < other.end_time
            && self.end_time > other.start_time
    }
}

/// Single-antenna LoRa gateway.
pub struct Gateway {
    id: EntityId,
    config: GatewayConfig,
    links: BTreeMap<EntityId, NodeLink>,
    active_receptions: Vec<ActiveReception>,
    next_reception_id: u64,
    stats: GatewayStats,
}

impl Gateway {
    /// Create a gateway with no links.
    pub fn new(id: EntityId, config: GatewayConfig) -> Self {
        Gateway {
            id,
            config,
            links: BTreeMap::new(),
            active_receptions: Vec::new(),
            next_reception_id: 0,
            stats: GatewayStats::default(),
        }
    }

    /// Register the link of a node radio.
    pub fn add_link(&mut self, radio_id: EntityId, link: NodeLink) {
        self.links.insert(radio_id, link);
    }

    /// Totals so far.
    pub fn stats(&self) -> GatewayStats {
        self.stats
    }

    /// Number of receptions currently in progress.
    pub fn active_receptions(&self) -> usize {
        self.active_receptions.len()
    }

    fn handle_transmit_air(&mut self, tx: &TransmitAirEvent, ctx: &mut SimContext) -> Result<(), SimError> {
        let link = self.links.get(&tx.radio_id).ok_or_else(|| SimError::HandlerError {
            entity: self.id,
            message: format!("no link configured for radio {:?}", tx.radio_id),
        })?;

        let loss_db = link.path_loss.loss_db(link.distance_m, tx.params.frequency_hz as f64);
        let shadowing_db = if self.config.shadowing_sigma_db > 0.0 {
            sample_gaussian(ctx.rng(), 0.0, self.config.shadowing_sigma_db)
        } else {
            0.0
        };
        let rssi_dbm = tx.params.tx_power_dbm - loss_db + shadowing_db;
        let snr_db = rssi_dbm - noise_floor_dbm(tx.params.bandwidth_hz, self.config.noise_figure_db);

        let reception_id = self.next_reception_id;
        self.next_reception_id += 1;

        let mut reception = ActiveReception {
            reception_id,
            radio_id: tx.radio_id,
            packet: tx.packet.clone(),
            frequency_hz: tx.params.frequency_hz,
            spreading_factor: tx.params.spreading_factor,
            start_time: ctx.time(),
            end_time: tx.end_time,
            snr_db,
            rssi_dbm,
            collided: false,
        };

        // Capture effect: the stronger signal survives by a 6 dB margin
        for other in self.active_receptions.iter_mut() {
            if !reception.overlaps(other) {
                continue;
            }
            let diff = reception.snr_db - other.snr_db;
            if diff >= CAPTURE_EFFECT_THRESHOLD_DB {
                other.collided = true;
            } else if diff <= -CAPTURE_EFFECT_THRESHOLD_DB {
                reception.collided = true;
            } else {
                other.collided = true;
                reception.collided = true;
            }
        }

        debug!(
            "Gateway: reception {} from {} rssi={:.1} dBm snr={:.1} dB",
            reception_id, reception.packet.node, rssi_dbm, snr_db
        );

        let delay = tx.end_time - ctx.time();
        self.active_receptions.push(reception);
        ctx.post_event(
            delay,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_RX_COMPLETE_BASE + reception_id,
            },
        );
        Ok(())
    }

    fn handle_rx_complete(&mut self, reception_id: u64, ctx: &mut SimContext) {
        let Some(idx) = self
            .active_receptions
            .iter()
            .position(|r| r.reception_id == reception_id)
        else {
            warn!("Gateway: completion for unknown reception {}", reception_id);
            return;
        };
        let reception = self.active_receptions.remove(idx);

        let threshold = self.config.phy.snr_threshold(reception.spreading_factor);
        let outcome = if reception.collided {
            DeliveryOutcome::Collided
        } else if reception.snr_db < threshold {
            DeliveryOutcome::Weak
        } else {
            DeliveryOutcome::Received
        };

        let labels = self
            .links
            .get(&reception.radio_id)
            .map(|l| l.labels.to_labels())
            .unwrap_or_default();
        match outcome {
            DeliveryOutcome::Received => {
                self.stats.received += 1;
                metrics::counter!(metric_defs::GATEWAY_RX_PACKETS.name, &labels).increment(1);
                metrics::histogram!(metric_defs::GATEWAY_RX_SNR.name, &labels).record(reception.snr_db);
                metrics::histogram!(metric_defs::GATEWAY_RX_RSSI.name, &labels).record(reception.rssi_dbm);
            }
            DeliveryOutcome::Weak => {
                self.stats.weak += 1;
                metrics::counter!(metric_defs::GATEWAY_RX_WEAK.name, &labels).increment(1);
            }
            DeliveryOutcome::Collided => {
                self.stats.collided += 1;
                metrics::counter!(metric_defs::GATEWAY_RX_COLLIDED.name, &labels).increment(1);
            }
            DeliveryOutcome::Untagged => {}
        }

        ctx.post_immediate(
            vec![],
            EventPayload::Delivery(DeliveryEvent {
                node: reception.packet.node,
                outcome,
                payload_len: reception.packet.payload.len(),
                rssi_dbm: Some(reception.rssi_dbm),
                snr_db: Some(reception.snr_db),
                start_time: reception.start_time,
                end_time: reception.end_time,
            }),
        );
    }

    fn handle_untagged(&mut self, packet: &UplinkPacket, ctx: &mut SimContext) {
        self.stats.untagged += 1;
        let labels = vec![("node", packet.node.clone()), ("node_type", "sensor".to_string())];
        metrics::counter!(metric_defs::GATEWAY_RX_UNTAGGED.name, &labels).increment(1);
        ctx.post_immediate(
            vec![],
            EventPayload::Delivery(DeliveryEvent {
                node: packet.node.clone(),
                outcome: DeliveryOutcome::Untagged,
                payload_len: packet.payload.len(),
                rssi_dbm: None,
                snr_db: None,
                start_time: ctx.time(),
                end_time: ctx.time(),
            }),
        );
    }
}

impl Entity for Gateway {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::TransmitAir(tx) => self.handle_transmit_air(tx, ctx)?,
            EventPayload::Uplink(uplink) => self.handle_untagged(&uplink.packet, ctx),
            EventPayload::Timer { timer_id } if *timer_id >= TIMER_RX_COMPLETE_BASE => {
                self.handle_rx_complete(timer_id - TIMER_RX_COMPLETE_BASE, ctx);
            }
            _ => {}
        }
        Ok(())
    }
}
