//! The sensor application entity.
//!
//! Owns one timer. On every wake-up it samples all due quantities, sends at
//! most one aggregated uplink, then re-arms at the earliest next due time.

use crate::aggregate::{aggregate, Reading};
use crate::config::SensorAppConfig;
use crate::mirror::RadioMirror;
use crate::quantity::Quantity;
use crate::record::{OutboundRecord, WireLayout};
use crate::signal::SignalModel;
use crate::timers::SensorTimerSet;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};
use wlam_common::{
    entity_rng, Entity, EntityId, Event, EventId, EventPayload, SimContext, SimError, SimTime, UplinkEvent,
    UplinkPacket,
};
use wlam_metrics::{metric_defs, metrics, MetricLabels};

/// Timer that starts sampling.
pub const TIMER_STARTUP: u64 = 1;
/// Timer of a sampling wake-up.
pub const TIMER_SAMPLE: u64 = 2;

/// State of the wake-up timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// No timer pending.
    Idle,
    /// One timer pending.
    Armed {
        /// The pending timer event.
        event: EventId,
        /// When it fires.
        at: SimTime,
    },
    /// Torn down; all events are ignored.
    Stopped,
}

/// Environmental sensor node application.
pub struct SensorApp {
    id: EntityId,
    name: String,
    uplink: EntityId,
    timers: SensorTimerSet,
    signals: SignalModel,
    layout: WireLayout,
    mirror: RadioMirror,
    state: DriverState,
    rng: ChaCha8Rng,
    metric_labels: MetricLabels,
    packets_sent: u64,
}

impl SensorApp {
    /// Create the application. Uplinks go to `uplink`, which is the node's
    /// radio or, for a node without one, the collector directly.
    pub fn new(
        id: EntityId,
        name: impl Into<String>,
        config: &SensorAppConfig,
        uplink: EntityId,
        mirror: RadioMirror,
        sim_seed: u64,
    ) -> Self {
        let name = name.into();
        let jitter = config.interval_jitter_fraction;
        SensorApp {
            id,
            metric_labels: MetricLabels::new(name.clone(), "sensor"),
            name,
            uplink,
            timers: SensorTimerSet::new(|q| (config.interval_s(q), jitter)),
            signals: config.signal_model(),
            layout: config.wire_layout(),
            mirror,
            state: DriverState::Idle,
            rng: entity_rng(sim_seed, id),
            packets_sent: 0,
        }
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current timer state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// The sampling schedule.
    pub fn timers(&self) -> &SensorTimerSet {
        &self.timers
    }

    /// The radio snapshot holder.
    pub fn mirror(&self) -> &RadioMirror {
        &self.mirror
    }

    /// Uplinks sent so far.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    fn start(&mut self, ctx: &mut SimContext) {
        if let DriverState::Armed { event, .. } = self.state {
            ctx.cancel_event(event);
        }
        self.timers.start(ctx.time(), &mut self.rng);
        self.arm(ctx);
    }

    fn wake(&mut self, ctx: &mut SimContext) {
        let now = ctx.time();
        self.state = DriverState::Idle;

        let result = aggregate(&mut self.timers, &self.signals, &self.name, now, &mut self.rng);
        for reading in &result.readings {
            self.report(reading);
        }
        match result.record {
            Some(record) => self.send(record, ctx),
            None => debug!("SensorApp[{}]: nothing due at {}", self.name, now),
        }

        self.arm(ctx);
    }

    fn arm(&mut self, ctx: &mut SimContext) {
        match self.timers.earliest_next_due() {
            Some(at) => {
                let event = ctx.post_event(at - ctx.time(), vec![self.id], EventPayload::Timer { timer_id: TIMER_SAMPLE });
                debug!("SensorApp[{}]: armed for {}", self.name, at);
                self.state = DriverState::Armed { event, at };
            }
            None => {
                debug!("SensorApp[{}]: all quantities disabled, idle", self.name);
                self.state = DriverState::Idle;
            }
        }
    }

    fn report(&self, reading: &Reading) {
        let labels = self.metric_labels.to_labels();
        match reading.quantity {
            Quantity::Temperature => {
                metrics::histogram!(metric_defs::SENSOR_TEMPERATURE.name, &labels).record(reading.value)
            }
            Quantity::No2 => metrics::histogram!(metric_defs::SENSOR_NO2.name, &labels).record(reading.value),
            Quantity::Humidity => {
                metrics::histogram!(metric_defs::SENSOR_HUMIDITY.name, &labels).record(reading.value)
            }
            Quantity::Counter => metrics::gauge!(metric_defs::SENSOR_COUNTER.name, &labels).set(reading.value),
        }
    }

    fn send(&mut self, record: OutboundRecord, ctx: &mut SimContext) {
        let presence = record.presence();
        let payload = record.encode(&self.layout);

        let mut packet = UplinkPacket {
            node: self.name.clone(),
            payload,
            bitmap: presence.bits(),
            created_at: record.created_at,
            tag: None,
        };
        self.mirror.tag(&mut packet);

        let mut labels = self.metric_labels.to_labels();
        metrics::histogram!(metric_defs::APP_PACKET_SIZE.name, &labels).record(packet.payload.len() as f64);
        labels.push(("bitmap", presence.bits().to_string()));
        metrics::counter!(metric_defs::APP_PACKETS_SENT.name, &labels).increment(1);

        debug!(
            "SensorApp[{}]: sending {} bytes, bitmap {:#04x}",
            self.name,
            packet.payload.len(),
            presence.bits()
        );

        self.packets_sent += 1;
        ctx.post_immediate(vec![self.uplink], EventPayload::Uplink(UplinkEvent { packet }));
    }
}

impl Entity for SensorApp {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state == DriverState::Stopped {
            return Ok(());
        }
        match &event.payload {
            EventPayload::Timer { timer_id: TIMER_STARTUP } => self.start(ctx),
            EventPayload::Timer { timer_id: TIMER_SAMPLE } => match self.state {
                DriverState::Armed { event: armed, .. } if armed == event.id => self.wake(ctx),
                _ => trace!("SensorApp[{}]: stale wake-up {:?} ignored", self.name, event.id),
            },
            EventPayload::Downlink(downlink) => {
                trace!("SensorApp[{}]: discarded {} byte downlink", self.name, downlink.payload.len());
            }
            _ => {}
        }
        Ok(())
    }

    fn teardown(&mut self, ctx: &mut SimContext) {
        if let DriverState::Armed { event, .. } = self.state {
            ctx.cancel_event(event);
        }
        self.state = DriverState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::Presence;
    use wlam_common::DownlinkEvent;
    use wlam_metrics::InMemoryRecorder;

    const APP: EntityId = EntityId(1);
    const RADIO: EntityId = EntityId(2);

    fn config(intervals: [f64; 4], jitter: f64) -> SensorAppConfig {
        SensorAppConfig {
            temperature_interval_s: intervals[0],
            no2_interval_s: intervals[1],
            humidity_interval_s: intervals[2],
            counter_interval_s: intervals[3],
            interval_jitter_fraction: jitter,
            ..SensorAppConfig::default()
        }
    }

    fn app(config: &SensorAppConfig) -> SensorApp {
        SensorApp::new(APP, "node-a", config, RADIO, RadioMirror::default(), 42)
    }

    fn timer(id: EventId, time: SimTime, timer_id: u64) -> Event {
        Event {
            id,
            time,
            source: APP,
            targets: vec![APP],
            payload: EventPayload::Timer { timer_id },
        }
    }

    /// Tiny event loop: delivers the app's own timers and collects its uplinks.
    fn drive(app: &mut SensorApp, ctx: &mut SimContext, wakeups: usize) -> Vec<UplinkPacket> {
        let mut uplinks = Vec::new();
        for _ in 0..wakeups {
            let DriverState::Armed { event, at } = app.state() else {
                break;
            };
            ctx.set_time(at);
            app.handle_event(&timer(event, at, TIMER_SAMPLE), ctx).unwrap();
            for ev in ctx.take_pending_events() {
                if let EventPayload::Uplink(up) = ev.payload {
                    assert_eq!(ev.targets, vec![RADIO]);
                    uplinks.push(up.packet);
                }
            }
        }
        uplinks
    }

    fn started(app: &mut SensorApp) -> SimContext {
        let mut ctx = SimContext::new(0);
        app.handle_event(&timer(EventId(0), SimTime::ZERO, TIMER_STARTUP), &mut ctx)
            .unwrap();
        ctx.take_pending_events();
        ctx
    }

    #[test]
    fn test_startup_arms_at_earliest() {
        let mut app = app(&config([300.0, 900.0, 600.0, 60.0], 0.0));
        started(&mut app);
        match app.state() {
            DriverState::Armed { at, .. } => assert_eq!(at, SimTime::from_secs(60.0)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_all_disabled_stays_idle() {
        let mut app = app(&config([0.0, 0.0, -1.0, 0.0], 0.1));
        let mut ctx = started(&mut app);
        assert_eq!(app.state(), DriverState::Idle);
        assert!(drive(&mut app, &mut ctx, 10).is_empty());
    }

    #[test]
    fn test_temperature_uplink_has_humidity() {
        let mut app = app(&config([300.0, 0.0, 10_000.0, 0.0], 0.1));
        let mut ctx = started(&mut app);
        let uplinks = drive(&mut app, &mut ctx, 5);
        assert_eq!(uplinks.len(), 5);
        for packet in &uplinks {
            assert_eq!(packet.bitmap, (Presence::TEMPERATURE | Presence::HUMIDITY).bits());
            assert_eq!(packet.payload.len(), 10 + 1 + 8 + 8 + 8);
            assert!(packet.tag.is_none());
        }
        let record = OutboundRecord::decode(&uplinks[0].payload, &WireLayout::default()).unwrap();
        assert_eq!(record.node_id, "node-a");
        assert_eq!(record.created_at, uplinks[0].created_at);
    }

    #[test]
    fn test_disabled_quantities_never_sent() {
        let mut app = app(&config([0.0, 120.0, 0.0, 0.0], 0.2));
        let mut ctx = started(&mut app);
        let uplinks = drive(&mut app, &mut ctx, 20);
        assert_eq!(uplinks.len(), 20);
        assert!(uplinks.iter().all(|p| p.bitmap == Presence::NO2.bits() && p.payload.len() == 27));
        assert_eq!(app.timers().get(Quantity::Temperature).next_due, None);
    }

    #[test]
    fn test_counter_uplinks_count_one_to_five() {
        let mut app = app(&config([0.0, 0.0, 0.0, 3600.0], 0.1));
        let mut ctx = started(&mut app);
        let uplinks = drive(&mut app, &mut ctx, 5);
        let counts: Vec<u64> = uplinks
            .iter()
            .map(|p| {
                assert_eq!(p.payload.len(), 23);
                OutboundRecord::decode(&p.payload, &WireLayout::default())
                    .unwrap()
                    .counter()
                    .unwrap()
            })
            .collect();
        assert_eq!(counts, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_wakeups_are_monotonic() {
        let mut app = app(&SensorAppConfig::default());
        let mut ctx = started(&mut app);
        let uplinks = drive(&mut app, &mut ctx, 50);
        assert!(uplinks.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[test]
    fn test_wakeup_with_nothing_due_is_silent() {
        let recorder = InMemoryRecorder::new();
        let mut app = app(&config([300.0, 900.0, 600.0, 3600.0], 0.1));
        let mut ctx = started(&mut app);
        let DriverState::Armed { event, at } = app.state() else {
            panic!("not armed");
        };

        metrics::with_local_recorder(&recorder, || {
            // early delivery of the armed timer: nothing is due yet
            ctx.set_time(SimTime::from_secs(1.0));
            app.handle_event(&timer(event, ctx.time(), TIMER_SAMPLE), &mut ctx)
                .unwrap();
        });

        let posted = ctx.take_pending_events();
        assert_eq!(posted.len(), 1);
        assert!(matches!(posted[0].payload, EventPayload::Timer { timer_id: TIMER_SAMPLE }));
        assert_eq!(posted[0].time, at);
        assert_eq!(recorder.total_activity(), 0);
        assert_eq!(app.packets_sent(), 0);
    }

    #[test]
    fn test_metrics_per_reading_and_packet() {
        let recorder = InMemoryRecorder::new();
        // humidity's own timer is off; it is only sampled alongside temperature
        let mut app = app(&config([300.0, 0.0, 0.0, 0.0], 0.0));
        let mut ctx = started(&mut app);
        metrics::with_local_recorder(&recorder, || {
            drive(&mut app, &mut ctx, 3);
        });

        assert_eq!(recorder.histogram_samples(metric_defs::SENSOR_TEMPERATURE.name).len(), 3);
        assert_eq!(recorder.histogram_samples(metric_defs::SENSOR_HUMIDITY.name).len(), 3);
        assert_eq!(recorder.counter_total(metric_defs::APP_PACKETS_SENT.name), 3);
        assert_eq!(recorder.counter_with_label(metric_defs::APP_PACKETS_SENT.name, "bitmap", "5"), 3);
        assert_eq!(recorder.histogram_samples(metric_defs::APP_PACKET_SIZE.name), vec![35.0; 3]);
    }

    #[test]
    fn test_counter_gauge_tracks_value() {
        let recorder = InMemoryRecorder::new();
        let mut app = app(&config([0.0, 0.0, 0.0, 10.0], 0.0));
        let mut ctx = started(&mut app);
        metrics::with_local_recorder(&recorder, || {
            drive(&mut app, &mut ctx, 4);
        });
        assert_eq!(recorder.gauge_for_node(metric_defs::SENSOR_COUNTER.name, "node-a"), Some(4.0));
    }

    #[test]
    fn test_teardown_cancels_and_stops() {
        let mut app = app(&config([60.0, 0.0, 0.0, 0.0], 0.0));
        let mut ctx = started(&mut app);
        let DriverState::Armed { event, at } = app.state() else {
            panic!("not armed");
        };

        app.teardown(&mut ctx);
        assert_eq!(ctx.take_cancelled(), vec![event]);
        assert_eq!(app.state(), DriverState::Stopped);

        // even a late delivery of the old timer does nothing
        ctx.set_time(at + SimTime::from_secs(86_400.0));
        app.handle_event(&timer(event, ctx.time(), TIMER_SAMPLE), &mut ctx)
            .unwrap();
        app.handle_event(&timer(EventId(99), ctx.time(), TIMER_STARTUP), &mut ctx)
            .unwrap();
        assert!(ctx.take_pending_events().is_empty());
        assert_eq!(app.packets_sent(), 0);
    }

    #[test]
    fn test_stale_timer_ignored() {
        let mut app = app(&config([60.0, 0.0, 0.0, 0.0], 0.0));
        let mut ctx = started(&mut app);
        ctx.set_time(SimTime::from_secs(60.0));
        app.handle_event(&timer(EventId(12345), ctx.time(), TIMER_SAMPLE), &mut ctx)
            .unwrap();
        assert!(ctx.take_pending_events().is_empty());
        assert_eq!(app.packets_sent(), 0);
    }

    #[test]
    fn test_downlink_discarded() {
        let mut app = app(&SensorAppConfig::default());
        let mut ctx = started(&mut app);
        let state = app.state();
        let downlink = Event {
            id: EventId(50),
            time: SimTime::ZERO,
            source: RADIO,
            targets: vec![APP],
            payload: EventPayload::Downlink(DownlinkEvent { payload: vec![1, 2, 3] }),
        };
        app.handle_event(&downlink, &mut ctx).unwrap();
        assert!(ctx.take_pending_events().is_empty());
        assert_eq!(app.state(), state);
    }

    #[test]
    fn test_radio_snapshot_tags_uplinks() {
        let radio = wlam_lora::Radio::new(
            RADIO,
            wlam_lora::default_radio_params(),
            EntityId(9),
            MetricLabels::new("node-a", "sensor"),
        );
        let mirror = RadioMirror::capture(Some(&radio as &dyn wlam_lora::RadioEntity));
        let mut app = SensorApp::new(APP, "node-a", &config([0.0, 30.0, 0.0, 0.0], 0.1), RADIO, mirror, 1);
        let mut ctx = started(&mut app);
        let uplinks = drive(&mut app, &mut ctx, 2);
        assert!(uplinks.iter().all(|p| p.tag.as_ref().map(|t| t.spreading_factor) == Some(7)));
    }

    #[test]
    fn test_same_seed_same_readings() {
        let run = |seed| {
            let mut app = SensorApp::new(APP, "n", &SensorAppConfig::default(), RADIO, RadioMirror::default(), seed);
            let mut ctx = started(&mut app);
            drive(&mut app, &mut ctx, 20)
                .into_iter()
                .map(|p| (p.created_at, p.payload))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
        assert_ne!(run(7), run(8));
    }
}
