//! Diurnal signal generator.
//!
//! Readings are a sinusoid over the simulated hour of day plus Gaussian
//! noise drawn from the caller's random stream:
//!
//! ```text
//! temperature = base + amp · sin(2π · h/24)          + N(0, 0.2)
//! humidity    = base + amp · sin(2π · h/24 + π/4)    + N(0, 0.5)
//! no2         = base + amp · (0.5 + 0.5·sin(2π · h/12)) + N(0, 0.1)
//! ```

use crate::quantity::Quantity;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use wlam_common::SimTime;

/// Noise standard deviation of temperature readings.
pub const TEMPERATURE_NOISE_SIGMA: f64 = 0.2;
/// Noise standard deviation of humidity readings.
pub const HUMIDITY_NOISE_SIGMA: f64 = 0.5;
/// Noise standard deviation of NO2 readings.
pub const NO2_NOISE_SIGMA: f64 = 0.1;

/// Baseline and swing of one diurnal signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiurnalParams {
    /// Mean level.
    pub base: f64,
    /// Peak deviation from the mean.
    pub amplitude: f64,
}

impl DiurnalParams {
    /// Create parameters.
    pub fn new(base: f64, amplitude: f64) -> Self {
        Self { base, amplitude }
    }
}

fn hours(now: SimTime) -> f64 {
    now.as_secs_f64() / 3600.0
}

fn noise<R: Rng + ?Sized>(rng: &mut R, sigma: f64) -> f64 {
    match Normal::new(0.0, sigma) {
        Ok(dist) => dist.sample(rng),
        Err(_) => 0.0,
    }
}

/// Temperature reading at `now`.
pub fn temperature<R: Rng + ?Sized>(now: SimTime, params: &DiurnalParams, rng: &mut R) -> f64 {
    let phase = 2.0 * PI * hours(now) / 24.0;
    params.base + params.amplitude * phase.sin() + noise(rng, TEMPERATURE_NOISE_SIGMA)
}

/// Humidity reading at `now`, a quarter-π behind temperature.
pub fn humidity<R: Rng + ?Sized>(now: SimTime, params: &DiurnalParams, rng: &mut R) -> f64 {
    let phase = 2.0 * PI * hours(now) / 24.0 + PI / 4.0;
    params.base + params.amplitude * phase.sin() + noise(rng, HUMIDITY_NOISE_SIGMA)
}

/// NO2 reading at `now`. The 12-hour cycle term stays within `[0, amplitude]`.
pub fn no2<R: Rng + ?Sized>(now: SimTime, params: &DiurnalParams, rng: &mut R) -> f64 {
    let phase = 2.0 * PI * hours(now) / 12.0;
    params.base + params.amplitude * (0.5 + 0.5 * phase.sin()) + noise(rng, NO2_NOISE_SIGMA)
}

/// Signal parameters for every continuous quantity of a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalModel {
    /// Temperature signal.
    pub temperature: DiurnalParams,
    /// Humidity signal.
    pub humidity: DiurnalParams,
    /// NO2 signal.
    pub no2: DiurnalParams,
}

impl SignalModel {
    /// Reading of `quantity` at `now`. The counter has no signal and yields `None`.
    pub fn sample<R: Rng + ?Sized>(&self, quantity: Quantity, now: SimTime, rng: &mut R) -> Option<f64> {
        match quantity {
            Quantity::Temperature => Some(temperature(now, &self.temperature, rng)),
            Quantity::Humidity => Some(humidity(now, &self.humidity, rng)),
            Quantity::No2 => Some(no2(now, &self.no2, rng)),
            Quantity::Counter => None,
        }
    }
}
