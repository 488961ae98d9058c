//! # wlam-sensor
//!
//! Environmental sensor node application for the WLAM simulator.
//!
//! A node samples temperature, NO2, humidity and an event counter on
//! independent jittered schedules, packs whatever is due into one
//! bitmap-tagged uplink, and hands it to its transport. Components:
//!
//! - [`signal`]: diurnal reading generator
//! - [`timers`]: per-quantity schedule ([`SensorTimerSet`])
//! - [`aggregate`] and [`record`]: per-wake-up record and wire format
//! - [`mirror`]: startup copy of the radio parameters
//! - [`app`]: the [`SensorApp`] entity driving it all from one timer

pub mod aggregate;
pub mod app;
pub mod config;
pub mod mirror;
pub mod quantity;
pub mod record;
pub mod signal;
pub mod timers;

pub use aggregate::{aggregate, Aggregation, Reading};
pub use app::{DriverState, SensorApp, TIMER_SAMPLE, TIMER_STARTUP};
pub use config::SensorAppConfig;
pub use mirror::{RadioMirror, RadioSnapshot};
pub use quantity::{Presence, Quantity, QuantityMap};
pub use record::{OutboundRecord, RecordError, WireLayout};
pub use signal::{DiurnalParams, SignalModel};
pub use timers::{NextDue, SensorState, SensorTimerSet};
