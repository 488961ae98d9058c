//! Sensor application configuration.

use crate::quantity::Quantity;
use crate::record::WireLayout;
use crate::signal::{DiurnalParams, SignalModel};
use serde::{Deserialize, Serialize};

/// Per-node application settings.
///
/// Missing fields take the defaults of a typical deployment. Values are not
/// range-checked; a negative jitter is treated as its magnitude and a zero or
/// negative interval disables the quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorAppConfig {
    /// Seconds between temperature samples.
    pub temperature_interval_s: f64,
    /// Seconds between NO2 samples.
    pub no2_interval_s: f64,
    /// Seconds between independent humidity samples.
    pub humidity_interval_s: f64,
    /// Seconds between counter increments.
    pub counter_interval_s: f64,
    /// Jitter window as a fraction of each interval.
    pub interval_jitter_fraction: f64,

    /// Mean temperature in °C.
    pub base_temperature: f64,
    /// Daily temperature swing in °C.
    pub amplitude_temperature: f64,
    /// Mean relative humidity in %.
    pub base_humidity: f64,
    /// Daily humidity swing in %.
    pub amplitude_humidity: f64,
    /// NO2 floor in µg/m³.
    pub base_no2: f64,
    /// NO2 peak above the floor in µg/m³.
    pub amplitude_no2: f64,

    /// Bytes of fixed header before the bitmap.
    pub base_payload_bytes: usize,
    /// Bytes of the counter field.
    pub counter_payload_bytes: usize,
}

impl Default for SensorAppConfig {
    fn default() -> Self {
        Self {
            temperature_interval_s: 300.0,
            no2_interval_s: 900.0,
            humidity_interval_s: 600.0,
            counter_interval_s: 3600.0,
            interval_jitter_fraction: 0.1,
            base_temperature: 20.0,
            amplitude_temperature: 5.0,
            base_humidity: 60.0,
            amplitude_humidity: 15.0,
            base_no2: 20.0,
            amplitude_no2: 10.0,
            base_payload_bytes: 10,
            counter_payload_bytes: 4,
        }
    }
}

impl SensorAppConfig {
    /// Sampling interval of a quantity in seconds.
    pub fn interval_s(&self, quantity: Quantity) -> f64 {
        match quantity {
            Quantity::Temperature => self.temperature_interval_s,
            Quantity::No2 => self.no2_interval_s,
            Quantity::Humidity => self.humidity_interval_s,
            Quantity::Counter => self.counter_interval_s,
        }
    }

    /// Wire sizes.
    pub fn wire_layout(&self) -> WireLayout {
        WireLayout {
            base_payload_bytes: self.base_payload_bytes,
            counter_payload_bytes: self.counter_payload_bytes,
        }
    }

    /// Diurnal signals.
    pub fn signal_model(&self) -> SignalModel {
        SignalModel {
            temperature: DiurnalParams::new(self.base_temperature, self.amplitude_temperature),
            humidity: DiurnalParams::new(self.base_humidity, self.amplitude_humidity),
            no2: DiurnalParams::new(self.base_no2, self.amplitude_no2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SensorAppConfig::default();
        assert_eq!(config.interval_s(Quantity::Counter), 3600.0);
        assert_eq!(config.wire_layout(), WireLayout::default());
        assert_eq!(config.signal_model().humidity, DiurnalParams::new(60.0, 15.0));
    }
}
