//! Per-quantity sampling schedule.

use crate::quantity::{Quantity, QuantityMap};
use rand::Rng;
use wlam_common::SimTime;

/// Next sample time of a quantity. `None` means disabled.
pub type NextDue = Option<SimTime>;

/// Schedule and last output of one quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorState {
    /// Seconds between samples; zero or negative disables the quantity.
    pub interval_s: f64,
    /// Fraction of the interval used as a symmetric jitter window.
    pub jitter_fraction: f64,
    /// Absolute time of the next sample.
    pub next_due: NextDue,
    /// Last reading kept for this quantity, if any.
    pub last_value: Option<f64>,
    /// Running count, used only by the counter quantity.
    pub counter: u64,
}

impl SensorState {
    /// New state, not yet scheduled.
    pub fn new(interval_s: f64, jitter_fraction: f64) -> Self {
        Self {
            interval_s,
            jitter_fraction,
            next_due: None,
            last_value: None,
            counter: 0,
        }
    }

    /// Whether the quantity can ever fire.
    pub fn is_enabled(&self) -> bool {
        self.interval_s > 0.0
    }

    /// Whether the quantity is due at `now`.
    pub fn is_due(&self, now: SimTime) -> bool {
        matches!(self.next_due, Some(at) if at <= now)
    }

    /// Draw the next due time: `now + interval + U(-interval·jitter, +interval·jitter)`.
    ///
    /// Never earlier than `now`. With `jitter_fraction >= 1` the draw can land
    /// exactly on `now`, so the driver fires this quantity again in the same
    /// instant; successive due times are then non-decreasing rather than
    /// strictly increasing.
    pub fn compute_next_due<R: Rng + ?Sized>(&mut self, now: SimTime, rng: &mut R) {
        if !self.is_enabled() {
            self.next_due = None;
            return;
        }
        let interval_us = self.interval_s * 1_000_000.0;
        let window_us = (interval_us * self.jitter_fraction).abs();
        let offset_us = if window_us > 0.0 {
            rng.gen_range(-window_us..=window_us)
        } else {
            0.0
        };
        let now_us = now.as_micros() as f64;
        let next_us = (now_us + interval_us + offset_us).max(now_us);
        self.next_due = Some(SimTime::from_micros(next_us as u64));
    }
}

/// Schedule of all quantities of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorTimerSet {
    states: QuantityMap<SensorState>,
}

impl SensorTimerSet {
    /// Build from per-quantity `(interval_s, jitter_fraction)`.
    pub fn new(mut schedule: impl FnMut(Quantity) -> (f64, f64)) -> Self {
        Self {
            states: QuantityMap::from_fn(|q| {
                let (interval_s, jitter) = schedule(q);
                SensorState::new(interval_s, jitter)
            }),
        }
    }

    /// Schedule every quantity for the first time.
    pub fn start<R: Rng + ?Sized>(&mut self, now: SimTime, rng: &mut R) {
        for (_, state) in self.states.iter_mut() {
            state.compute_next_due(now, rng);
        }
    }

    /// Reschedule one quantity after it fired.
    pub fn compute_next_due<R: Rng + ?Sized>(&mut self, quantity: Quantity, now: SimTime, rng: &mut R) {
        self.states[quantity].compute_next_due(now, rng);
    }

    /// Earliest due time across all quantities, `None` when every quantity is disabled.
    pub fn earliest_next_due(&self) -> NextDue {
        self.states.iter().filter_map(|(_, s)| s.next_due).min()
    }

    /// Quantities due at `now`, in scan order.
    pub fn due(&self, now: SimTime) -> Vec<Quantity> {
        self.states
            .iter()
            .filter(|(_, s)| s.is_due(now))
            .map(|(q, _)| q)
            .collect()
    }

    /// State of one quantity.
    pub fn get(&self, quantity: Quantity) -> &SensorState {
        &self.states[quantity]
    }

    /// Mutable state of one quantity.
    pub fn get_mut(&mut self, quantity: Quantity) -> &mut SensorState {
        &mut self.states[quantity]
    }
}
