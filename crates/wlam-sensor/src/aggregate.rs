//! One wake-up's worth of sampling.

use crate::quantity::Quantity;
use crate::record::OutboundRecord;
use crate::signal::SignalModel;
use crate::timers::SensorTimerSet;
use rand::Rng;
use wlam_common::SimTime;

/// A value produced during a wake-up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Quantity the value belongs to.
    pub quantity: Quantity,
    /// The value; for the counter, its new count.
    pub value: f64,
}

/// Result of a wake-up.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Aggregation {
    /// The record to send, `None` when nothing was due.
    pub record: Option<OutboundRecord>,
    /// Every value produced, in the order produced.
    pub readings: Vec<Reading>,
}

/// Fire every quantity due at `now` and collect the results.
///
/// A temperature firing also takes a humidity reading for the same record
/// without touching humidity's own schedule or last value. Humidity firing
/// on its own stores its last value, as does NO2. Each fired quantity is
/// rescheduled.
pub fn aggregate<R: Rng + ?Sized>(
    timers: &mut SensorTimerSet,
    signals: &SignalModel,
    node_id: &str,
    now: SimTime,
    rng: &mut R,
) -> Aggregation {
    let due = timers.due(now);
    if due.is_empty() {
        return Aggregation::default();
    }

    let mut record = OutboundRecord::new(node_id, now);
    let mut readings = Vec::with_capacity(due.len() + 1);

    for quantity in due {
        match quantity {
            Quantity::Temperature => {
                for q in [Quantity::Temperature, Quantity::Humidity] {
                    if let Some(value) = signals.sample(q, now, rng) {
                        record.set_reading(q, value);
                        readings.push(Reading { quantity: q, value });
                    }
                }
            }
            Quantity::No2 | Quantity::Humidity => {
                if let Some(value) = signals.sample(quantity, now, rng) {
                    record.set_reading(quantity, value);
                    readings.push(Reading { quantity, value });
                    timers.get_mut(quantity).last_value = Some(value);
                }
            }
            Quantity::Counter => {
                let state = timers.get_mut(quantity);
                state.counter += 1;
                record.set_counter(state.counter);
                readings.push(Reading {
                    quantity,
                    value: state.counter as f64,
                });
            }
        }
        timers.compute_next_due(quantity, now, rng);
    }

    Aggregation {
        record: Some(record),
        readings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorAppConfig;
    use crate::quantity::Presence;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn timers(schedule: [f64; 4]) -> SensorTimerSet {
        SensorTimerSet::new(|q| (schedule[q.index()], 0.0))
    }

    fn signals() -> SignalModel {
        SensorAppConfig::default().signal_model()
    }

    #[test]
    fn test_nothing_due_builds_nothing() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut set = timers([300.0, 900.0, 600.0, 3600.0]);
        set.start(SimTime::ZERO, &mut rng);
        let before = set.clone();
        let out = aggregate(&mut set, &signals(), "n", SimTime::from_secs(299.0), &mut rng);
        assert_eq!(out, Aggregation::default());
        assert_eq!(set, before);
    }

    #[test]
    fn test_temperature_couples_humidity() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut set = timers([300.0, 900.0, 600.0, 3600.0]);
        set.start(SimTime::ZERO, &mut rng);
        let now = SimTime::from_secs(300.0);
        let out = aggregate(&mut set, &signals(), "n", now, &mut rng);

        let record = out.record.unwrap();
        assert_eq!(record.presence(), Presence::TEMPERATURE | Presence::HUMIDITY);
        assert_eq!(record.created_at, now);
        let kinds: Vec<Quantity> = out.readings.iter().map(|r| r.quantity).collect();
        assert_eq!(kinds, vec![Quantity::Temperature, Quantity::Humidity]);

        // humidity's own timer is untouched
        assert_eq!(set.get(Quantity::Humidity).next_due, Some(SimTime::from_secs(600.0)));
        assert_eq!(set.get(Quantity::Humidity).last_value, None);
        assert_eq!(set.get(Quantity::Temperature).last_value, None);
        assert_eq!(set.get(Quantity::Temperature).next_due, Some(SimTime::from_secs(600.0)));
    }

    #[test]
    fn test_disabled_humidity_still_rides_with_temperature() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let mut set = timers([300.0, 0.0, 0.0, 0.0]);
        set.start(SimTime::ZERO, &mut rng);
        assert!(!set.get(Quantity::Humidity).is_enabled());

        let out = aggregate(&mut set, &signals(), "n", SimTime::from_secs(300.0), &mut rng);
        let record = out.record.unwrap();
        assert_eq!(record.presence(), Presence::TEMPERATURE | Presence::HUMIDITY);
        assert!(record.reading(Quantity::Humidity).is_some());
        // the humidity schedule itself stays off
        assert_eq!(set.get(Quantity::Humidity).next_due, None);
        assert_eq!(set.get(Quantity::Humidity).last_value, None);
    }

    #[test]
    fn test_humidity_alone_is_not_coupled_back() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut set = timers([1000.0, 0.0, 200.0, 0.0]);
        set.start(SimTime::ZERO, &mut rng);
        let out = aggregate(&mut set, &signals(), "n", SimTime::from_secs(200.0), &mut rng);
        let record = out.record.unwrap();
        assert_eq!(record.presence(), Presence::HUMIDITY);
        assert_eq!(set.get(Quantity::Humidity).last_value, record.reading(Quantity::Humidity));
    }

    #[test]
    fn test_independent_humidity_overwrites_coupled() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut set = timers([300.0, 0.0, 300.0, 0.0]);
        set.start(SimTime::ZERO, &mut rng);
        let out = aggregate(&mut set, &signals(), "n", SimTime::from_secs(300.0), &mut rng);

        let humidity: Vec<f64> = out
            .readings
            .iter()
            .filter(|r| r.quantity == Quantity::Humidity)
            .map(|r| r.value)
            .collect();
        assert_eq!(humidity.len(), 2);
        let record = out.record.unwrap();
        assert_eq!(record.reading(Quantity::Humidity), Some(humidity[1]));
        assert_eq!(set.get(Quantity::Humidity).last_value, Some(humidity[1]));
    }

    #[test]
    fn test_no2_stores_last_value() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut set = timers([0.0, 60.0, 0.0, 0.0]);
        set.start(SimTime::ZERO, &mut rng);
        let out = aggregate(&mut set, &signals(), "n", SimTime::from_secs(60.0), &mut rng);
        let value = out.record.unwrap().reading(Quantity::No2);
        assert!(value.is_some());
        assert_eq!(set.get(Quantity::No2).last_value, value);
    }

    #[test]
    fn test_counter_counts_up() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut set = timers([0.0, 0.0, 0.0, 10.0]);
        set.start(SimTime::ZERO, &mut rng);
        let mut counts = Vec::new();
        for _ in 0..5 {
            let now = set.earliest_next_due().unwrap();
            let out = aggregate(&mut set, &signals(), "n", now, &mut rng);
            counts.push(out.record.unwrap().counter().unwrap());
        }
        assert_eq!(counts, vec![1, 2, 3, 4, 5]);
        assert_eq!(set.get(Quantity::Counter).counter, 5);
    }
}
