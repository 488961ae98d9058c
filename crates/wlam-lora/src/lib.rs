//! # wlam-lora
//!
//! LoRa radio simulation for the WLAM sensor network.
//!
//! PHY arithmetic (airtime, demodulation floors, power units) lives at the
//! top level. [`pathloss`] models the forest link, [`Radio`] is the node
//! transmitter and [`Gateway`] the single receiver every uplink ends at.

pub mod gateway;
pub mod pathloss;

pub use gateway::{Gateway, GatewayConfig, GatewayStats, NodeLink};
pub use pathloss::{PathLossBreakdown, PathLossModel};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wlam_common::{
    Entity, EntityId, Event, EventPayload, SimContext, SimError, SimTime, TransmitAirEvent, UplinkPacket,
};
use wlam_metrics::{metric_defs, metrics, MetricLabels};

// Re-export common types
pub use wlam_common::{LoraTag, RadioParams};

// ============================================================================
// Radio Parameters
// ============================================================================

/// Default EU868 radio parameters: 868.1 MHz, 125 kHz, SF7, CR 4/5, 14 dBm.
pub fn default_radio_params() -> RadioParams {
    RadioParams {
        frequency_hz: 868_100_000,
        bandwidth_hz: 125_000,
        spreading_factor: 7,
        coding_rate: 5,
        tx_power_dbm: 14.0,
    }
}

/// LoRa arithmetic on top of the plain [`RadioParams`] record.
pub trait RadioParamsExt {
    /// Airtime of a frame carrying `payload_len` bytes.
    fn time_on_air(&self, payload_len: usize) -> SimTime;

    /// Transmit power in linear milliwatts.
    fn tx_power_mw(&self) -> f64;
}

impl RadioParamsExt for RadioParams {
    fn time_on_air(&self, payload_len: usize) -> SimTime {
        calculate_time_on_air(self, payload_len)
    }

    fn tx_power_mw(&self) -> f64 {
        dbm_to_mw(self.tx_power_dbm)
    }
}

/// Convert dBm to milliwatts: `P_mW = 10^(P_dBm / 10)`.
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Convert milliwatts to dBm: `P_dBm = 10 · log₁₀(P_mW)`.
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// Thermal noise floor of a receiver in dBm: `-174 + 10·log₁₀(BW) + NF`.
pub fn noise_floor_dbm(bandwidth_hz: u32, noise_figure_db: f64) -> f64 {
    -174.0 + 10.0 * (bandwidth_hz as f64).log10() + noise_figure_db
}

// ============================================================================
// PHY Configuration
// ============================================================================

/// PHY constants that shape airtime and demodulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraPhyConfig {
    /// Programmed preamble length, in symbols.
    pub preamble_symbols: u32,
    /// Demodulation floor in dB for SF7 through SF12.
    pub snr_thresholds: [f64; 6],
    /// Whether the 16-bit payload CRC is enabled.
    pub crc_enabled: bool,
    /// Whether the explicit header is used.
    pub explicit_header: bool,
}

impl LoraPhyConfig {
    /// LoRaWAN preamble.
    pub const DEFAULT_PREAMBLE_SYMBOLS: u32 = 8;

    /// Semtech datasheet floors.
    pub const DEFAULT_SNR_THRESHOLDS: [f64; 6] = [-7.5, -10.0, -12.5, -15.0, -17.5, -20.0];

    /// Floor for `spreading_factor`. Anything outside 7..=12 gets the SF8 value.
    pub fn snr_threshold(&self, spreading_factor: u8) -> f64 {
        let index = match spreading_factor {
            7..=12 => usize::from(spreading_factor - 7),
            _ => 1,
        };
        self.snr_thresholds[index]
    }
}

impl Default for LoraPhyConfig {
    fn default() -> Self {
        Self {
            preamble_symbols: Self::DEFAULT_PREAMBLE_SYMBOLS,
            snr_thresholds: Self::DEFAULT_SNR_THRESHOLDS,
            crc_enabled: true,
            explicit_header: true,
        }
    }
}

/// Airtime with the default PHY constants.
pub fn calculate_time_on_air(params: &RadioParams, payload_len: usize) -> SimTime {
    calculate_time_on_air_with_config(params, payload_len, &LoraPhyConfig::default())
}

/// Airtime of one frame:
///
/// ```text
/// T_sym   = 2^SF / BW
/// n_pre   = preamble + 4.25
/// n_pay   = 8 + max(ceil((8·PL − 4·SF + 28 + 16·CRC − 20·IH) / (4·(SF − 2·DE))) · CR, 0)
/// ToA     = (n_pre + n_pay) · T_sym
/// ```
///
/// Low data rate optimisation (DE) is enabled when the symbol time reaches 16 ms.
pub fn calculate_time_on_air_with_config(
    params: &RadioParams,
    payload_len: usize,
    config: &LoraPhyConfig,
) -> SimTime {
    let flag = |on: bool| if on { 1.0 } else { 0.0 };
    let sf = f64::from(params.spreading_factor);
    let symbol_s = 2f64.powf(sf) / f64::from(params.bandwidth_hz);
    let low_rate = flag(symbol_s >= 0.016);

    let payload_bits = 8.0 * payload_len as f64 - 4.0 * sf + 28.0 + 16.0 * flag(config.crc_enabled)
        - 20.0 * flag(!config.explicit_header);
    let blocks = (payload_bits / (4.0 * (sf - 2.0 * low_rate))).ceil();
    let payload_symbols = 8.0 + (blocks * f64::from(params.coding_rate)).max(0.0);
    let preamble_symbols = f64::from(config.preamble_symbols) + 4.25;

    SimTime::from_secs((preamble_symbols + payload_symbols) * symbol_s)
}

/// SNR demodulation threshold for a spreading factor, default thresholds.
pub fn calculate_snr_sensitivity(spreading_factor: u8) -> f64 {
    LoraPhyConfig::default().snr_threshold(spreading_factor)
}

/// A frame survives an overlap when it is at least this many dB above every interferer.
pub const CAPTURE_EFFECT_THRESHOLD_DB: f64 = 6.0;

/// Sample a value from a Gaussian distribution (Box-Muller).
pub fn sample_gaussian<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    let radius = (-2.0 * rng.gen::<f64>().max(f64::MIN_POSITIVE).ln()).sqrt();
    let angle = std::f64::consts::TAU * rng.gen::<f64>();
    mean + std_dev * radius * angle.cos()
}

// ============================================================================
// Radio Entity
// ============================================================================

/// Timer fired when the current transmission leaves the air.
const TIMER_TX_COMPLETE: u64 = 1;

/// Internal state of the transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    /// Ready to transmit.
    Idle,
    /// On the air until the given time.
    Transmitting { until: SimTime },
}

/// Node radio: the transport below the sensor application.
///
/// Holds the live radio parameters, turns each uplink into a transmission
/// to the gateway and accounts for time on air. The radio is half-duplex
/// with a single-slot queue; an uplink that arrives while a transmission
/// is in progress replaces any packet already waiting.
pub struct Radio {
    id: EntityId,
    params: RadioParams,
    gateway: EntityId,
    state: TxState,
    pending: Option<UplinkPacket>,
    metric_labels: MetricLabels,
}

impl Radio {
    /// Idle radio that hands its frames to `gateway`.
    pub fn new(id: EntityId, params: RadioParams, gateway: EntityId, metric_labels: MetricLabels) -> Self {
        Radio {
            id,
            params,
            gateway,
            state: TxState::Idle,
            pending: None,
            metric_labels,
        }
    }

    /// Configured PHY settings.
    pub fn params(&self) -> &RadioParams {
        &self.params
    }

    /// Whether a frame is on the air.
    pub fn is_transmitting(&self) -> bool {
        matches!(self.state, TxState::Transmitting { .. })
    }

    fn handle_uplink(&mut self, packet: UplinkPacket, ctx: &mut SimContext) {
        match self.state {
            TxState::Idle => self.start_transmission(packet, ctx),
            TxState::Transmitting { until } => {
                if self.pending.replace(packet).is_some() {
                    let labels = self.metric_labels.to_labels();
                    metrics::counter!(metric_defs::RADIO_TX_DROPPED.name, &labels).increment(1);
                }
                debug!(
                    "Radio[{}]: busy until {}, uplink queued",
                    self.id.0, until
                );
            }
        }
    }

    fn start_transmission(&mut self, packet: UplinkPacket, ctx: &mut SimContext) {
        let airtime = calculate_time_on_air(&self.params, packet.payload.len());
        let end_time = ctx.time() + airtime;
        let packet_size = packet.payload.len();

        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::RADIO_TX_PACKETS.name, &labels).increment(1);
        metrics::counter!(metric_defs::RADIO_TX_AIRTIME.name, &labels).increment(airtime.as_micros());
        metrics::histogram!(metric_defs::RADIO_TX_PACKET_SIZE.name, &labels).record(packet_size as f64);

        debug!(
            "Radio[{}]: transmitting {} bytes at SF{} for {}",
            self.id.0, packet_size, self.params.spreading_factor, airtime
        );

        self.state = TxState::Transmitting { until: end_time };

        ctx.post_immediate(
            vec![self.gateway],
            EventPayload::TransmitAir(TransmitAirEvent {
                radio_id: self.id,
                packet,
                params: self.params.clone(),
                end_time,
            }),
        );

        ctx.post_event(airtime, vec![self.id], EventPayload::Timer { timer_id: TIMER_TX_COMPLETE });
    }
}

impl Entity for Radio {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Uplink(uplink) => {
                self.handle_uplink(uplink.packet.clone(), ctx);
            }
            EventPayload::Timer { timer_id: TIMER_TX_COMPLETE } => {
                self.state = TxState::Idle;
                if let Some(packet) = self.pending.take() {
                    self.start_transmission(packet, ctx);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Entity with a LoRa front end whose settings can be inspected.
pub trait RadioEntity: Entity {
    /// Current PHY settings.
    fn radio_params(&self) -> &RadioParams;
}

impl RadioEntity for Radio {
    fn radio_params(&self) -> &RadioParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use wlam_common::{EventId, UplinkEvent};

    fn packet(len: usize) -> UplinkPacket {
        UplinkPacket {
            node: "n0".to_string(),
            payload: vec![0u8; len],
            bitmap: 0x02,
            created_at: SimTime::ZERO,
            tag: None,
        }
    }

    fn uplink_event(len: usize) -> Event {
        Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: EntityId(1),
            targets: vec![EntityId(2)],
            payload: EventPayload::Uplink(UplinkEvent { packet: packet(len) }),
        }
    }

    #[test]
    fn test_time_on_air_reference() {
        // SF7/125k, 27 bytes, CR 4/5, explicit header, CRC: 65.25 symbols of 1.024 ms
        let params = default_radio_params();
        let toa = calculate_time_on_air(&params, 27);
        assert!((toa.as_micros() as i64 - 66_816).abs() <= 1, "got {}", toa);
    }

    #[test]
    fn test_time_on_air_grows_with_sf() {
        let mut params = default_radio_params();
        let sf7 = calculate_time_on_air(&params, 27);
        params.spreading_factor = 12;
        let sf12 = calculate_time_on_air(&params, 27);
        assert!(sf12.as_micros() > 20 * sf7.as_micros());
    }

    #[test]
    fn test_snr_sensitivity_thresholds() {
        assert_eq!(calculate_snr_sensitivity(7), -7.5);
        assert_eq!(calculate_snr_sensitivity(12), -20.0);
        assert_eq!(calculate_snr_sensitivity(3), -10.0);
    }

    #[test]
    fn test_power_conversions() {
        assert!((dbm_to_mw(0.0) - 1.0).abs() < 1e-12);
        assert!((dbm_to_mw(14.0) - 25.118_864).abs() < 1e-5);
        assert!((dbm_to_mw(-5.0) - 0.316_227_8).abs() < 1e-6);
        assert!((mw_to_dbm(dbm_to_mw(7.3)) - 7.3).abs() < 1e-9);
    }

    #[test]
    fn test_noise_floor() {
        let nf = noise_floor_dbm(125_000, 6.0);
        assert!((nf - (-117.03)).abs() < 0.01);
    }

    #[test]
    fn test_gaussian_sampling() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let samples: Vec<f64> = (0..1000).map(|_| sample_gaussian(&mut rng, 10.0, 1.8)).collect();
        let mean: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((mean - 10.0).abs() < 0.2, "sample mean {} should be close to 10", mean);
    }

    #[test]
    fn test_radio_transmits_to_gateway() {
        let mut radio = Radio::new(EntityId(2), default_radio_params(), EntityId(9), MetricLabels::new("n0", "sensor"));
        let mut ctx = SimContext::new(0);
        radio.handle_event(&uplink_event(27), &mut ctx).unwrap();
        assert!(radio.is_transmitting());

        let events = ctx.take_pending_events();
        assert_eq!(events.len(), 2);
        match &events[0].payload {
            EventPayload::TransmitAir(tx) => {
                assert_eq!(events[0].targets, vec![EntityId(9)]);
                assert_eq!(tx.radio_id, EntityId(2));
                assert!((tx.end_time.as_micros() as i64 - 66_816).abs() <= 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events[1].payload, EventPayload::Timer { timer_id: TIMER_TX_COMPLETE }));
    }

    #[test]
    fn test_radio_queues_while_busy() {
        let mut radio = Radio::new(EntityId(2), default_radio_params(), EntityId(9), MetricLabels::new("n0", "sensor"));
        let mut ctx = SimContext::new(0);
        radio.handle_event(&uplink_event(27), &mut ctx).unwrap();
        ctx.take_pending_events();

        radio.handle_event(&uplink_event(35), &mut ctx).unwrap();
        assert!(ctx.take_pending_events().is_empty());

        let done = Event {
            id: EventId(1),
            time: SimTime::from_micros(66_816),
            source: EntityId(2),
            targets: vec![EntityId(2)],
            payload: EventPayload::Timer { timer_id: TIMER_TX_COMPLETE },
        };
        ctx.set_time(done.time);
        radio.handle_event(&done, &mut ctx).unwrap();
        let events = ctx.take_pending_events();
        match &events[0].payload {
            EventPayload::TransmitAir(tx) => assert_eq!(tx.packet.payload.len(), 35),
            other => panic!("unexpected {:?}", other),
        }
    }
}
