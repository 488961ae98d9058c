//! # wlam-common
//!
//! Common types and traits for the WLAM sensor network simulator.
//!
//! Everything the discrete-event host offers to entities: microsecond
//! [`SimTime`], ids, the [`Event`] queue entry and its [`EventPayload`],
//! the [`SimContext`] handed to handlers (posting and cancelling events),
//! the [`Entity`] trait and the [`EntityRegistry`] that dispatches to it.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Invalid event target.
    #[error("Invalid event target: {0:?}")]
    InvalidTarget(EntityId),

    /// A time computation overflowed.
    #[error("Simulation time overflow")]
    TimeOverflow,

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Failing entity.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Microseconds since the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Time from a microsecond count.
    pub fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Time from a millisecond count.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1000)
    }

    /// Create from seconds (float). Negative values saturate to zero.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000.0) as u64)
    }

    /// Microsecond count.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Whole milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Seconds as a float.
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Checked addition; `None` on overflow.
    pub fn checked_add(self, other: SimTime) -> Option<SimTime> {
        self.0.checked_add(other.0).map(SimTime)
    }

    /// Checked subtraction; `None` below zero.
    pub fn checked_sub(self, other: SimTime) -> Option<SimTime> {
        self.0.checked_sub(other.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ============================================================================
// Entity Identity
// ============================================================================

/// Unique identifier for a simulation entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Wrap a raw id.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

/// Derive a per-entity RNG seed from the simulation seed.
///
/// Every entity that draws random numbers owns its own stream so that
/// nodes stay independent of each other and of dispatch order.
pub fn derive_entity_seed(sim_seed: u64, entity: EntityId) -> u64 {
    // splitmix64 finalizer over the combined value
    let mut z = sim_seed ^ entity.0.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Create the random stream owned by a single entity.
pub fn entity_rng(sim_seed: u64, entity: EntityId) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(derive_entity_seed(sim_seed, entity))
}

// ============================================================================
// Event Types
// ============================================================================

/// Id of a posted event, unique within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event id.
    pub id: EventId,
    /// Delivery time.
    pub time: SimTime,
    /// Posting entity.
    pub source: EntityId,
    /// Receivers, in delivery order.
    pub targets: Vec<EntityId>,
    /// What happened.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: invert so the earliest (then lowest id) pops first
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Live LoRa settings of a node radio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioParams {
    /// Center frequency in Hz.
    pub frequency_hz: u32,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Spreading factor (7-12).
    pub spreading_factor: u8,
    /// Coding rate denominator (5-8, representing 4/5 to 4/8).
    pub coding_rate: u8,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
}

/// Transmission metadata attached to an uplink by the sending application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraTag {
    /// Transmit power in linear milliwatts.
    pub tx_power_mw: f64,
    /// Center frequency in Hz.
    pub center_frequency_hz: u32,
    /// Spreading factor (7-12).
    pub spreading_factor: u8,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Coding rate denominator.
    pub coding_rate: u8,
}

/// An application packet handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkPacket {
    /// Name of the originating node.
    pub node: String,
    /// Encoded record bytes.
    pub payload: Vec<u8>,
    /// Presence bitmap of the encoded record.
    pub bitmap: u8,
    /// Time the record was created.
    pub created_at: SimTime,
    /// Transmission metadata, absent when the node has no radio.
    pub tag: Option<LoraTag>,
}

/// Application hands a packet to its transport.
#[derive(Debug, Clone)]
pub struct UplinkEvent {
    /// The packet.
    pub packet: UplinkPacket,
}

/// Inbound message on the downlink channel.
#[derive(Debug, Clone)]
pub struct DownlinkEvent {
    /// Raw message bytes.
    pub payload: Vec<u8>,
}

/// Radio puts a packet on the air (sent from a node radio to the gateway).
#[derive(Debug, Clone)]
pub struct TransmitAirEvent {
    /// Transmitting radio entity.
    pub radio_id: EntityId,
    /// Packet being transmitted.
    pub packet: UplinkPacket,
    /// Radio parameters in effect for this transmission.
    pub params: RadioParams,
    /// Time the transmission ends.
    pub end_time: SimTime,
}

/// Outcome of an uplink at the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Demodulated successfully.
    Received,
    /// SNR below the demodulation threshold.
    Weak,
    /// Destroyed by an overlapping transmission.
    Collided,
    /// Delivered without PHY metadata (node has no radio).
    Untagged,
}

impl DeliveryOutcome {
    /// Whether the packet reached the collector.
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Received | DeliveryOutcome::Untagged)
    }

    /// Label value for metrics and traces.
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Received => "received",
            DeliveryOutcome::Weak => "weak",
            DeliveryOutcome::Collided => "collided",
            DeliveryOutcome::Untagged => "untagged",
        }
    }
}

/// Reported by the gateway once an uplink has been resolved.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    /// Name of the originating node.
    pub node: String,
    /// Result of the reception.
    pub outcome: DeliveryOutcome,
    /// Payload length in bytes.
    pub payload_len: usize,
    /// Received signal strength, when evaluated over the air.
    pub rssi_dbm: Option<f64>,
    /// Signal-to-noise ratio, when evaluated over the air.
    pub snr_db: Option<f64>,
    /// Start of the reception.
    pub start_time: SimTime,
    /// End of the reception.
    pub end_time: SimTime,
}

/// Event payload types.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Timer fired for the target entity.
    Timer {
        /// Entity-specific timer kind.
        timer_id: u64,
    },
    /// Application packet handed to the transport.
    Uplink(UplinkEvent),
    /// Message arriving on the downlink channel.
    Downlink(DownlinkEvent),
    /// Transmission on the air.
    TransmitAir(TransmitAirEvent),
    /// Gateway reception outcome.
    Delivery(DeliveryEvent),
    /// End of simulation.
    SimulationEnd,
}

impl EventPayload {
    /// Short label for logs and traces.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Timer { .. } => "timer",
            EventPayload::Uplink(_) => "uplink",
            EventPayload::Downlink(_) => "downlink",
            EventPayload::TransmitAir(_) => "transmit_air",
            EventPayload::Delivery(_) => "delivery",
            EventPayload::SimulationEnd => "simulation_end",
        }
    }
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Handle given to an entity while it handles an event.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    cancelled: Vec<EventId>,
    next_event_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Context with ids starting at zero.
    pub fn new(seed: u64) -> Self {
        Self::with_first_event_id(seed, 0)
    }

    /// Create a context whose event IDs start at `first_event_id`.
    ///
    /// Used by the event loop so that IDs issued during the run never
    /// collide with those of the initial events.
    pub fn with_first_event_id(seed: u64, first_event_id: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            cancelled: Vec::new(),
            next_event_id: first_event_id,
            source_entity: EntityId(0),
        }
    }

    /// Current time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Shared run-level random stream.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Advance the clock (event loop only).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Entity whose handler is running (event loop only).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Post an event to occur after a delay. Returns the ID of the new event.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        let id = EventId(self.next_event_id());
        self.pending_events.push(Event {
            id,
            time: self.time + delay,
            source: self.source_entity,
            targets,
            payload,
        });
        id
    }

    /// Post an event for the current instant.
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Cancel a previously posted event. It will not be delivered.
    pub fn cancel_event(&mut self, id: EventId) {
        self.cancelled.push(id);
    }

    /// Drain posted events (event loop only).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Take all cancellations requested since the last call (used by event loop).
    pub fn take_cancelled(&mut self) -> Vec<EventId> {
        std::mem::take(&mut self.cancelled)
    }

    /// Reserve an id for an event built outside a handler.
    pub fn next_event_id(&mut self) -> u64 {
        self.next_event_id += 1;
        self.next_event_id - 1
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Anything that receives events.
pub trait Entity: Send {
    /// This entity's id.
    fn entity_id(&self) -> EntityId;

    /// React to one event, posting follow-ups through `ctx`.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;

    /// Release resources at the end of the run. Pending timers should be cancelled here.
    fn teardown(&mut self, _ctx: &mut SimContext) {}
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Owns every entity of a run and routes events to them.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Add an entity under its own id.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        self.entities.insert(entity.entity_id(), entity);
    }

    /// Look up an entity.
    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(Box::as_ref)
    }

    /// Look up an entity for mutation.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Hand `event` to each target in turn. Stops at the first failure.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for &target in &event.targets {
            let Some(entity) = self.entities.get_mut(&target) else {
                tracing::error!("no entity {:?} for {} event {:?}", target, event.payload.kind(), event.id);
                return Err(SimError::EntityNotFound(target));
            };
            ctx.set_source(target);
            entity.handle_event(event, ctx)?;
        }
        Ok(())
    }

    /// Tear down every entity in ascending ID order.
    pub fn teardown_all(&mut self, ctx: &mut SimContext) {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort();
        for id in ids {
            if let Some(entity) = self.entities.get_mut(&id) {
                ctx.set_source(id);
                entity.teardown(ctx);
            }
        }
    }

    /// Ids of every registered entity, unordered.
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Set of cancelled event IDs, consulted by the event loop before dispatch.
#[derive(Debug, Default)]
pub struct CancelSet {
    ids: HashSet<EventId>,
}

impl CancelSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record cancellations.
    pub fn extend(&mut self, ids: impl IntoIterator<Item = EventId>) {
        self.ids.extend(ids);
    }

    /// Returns true (and forgets the ID) if the event was cancelled.
    pub fn take(&mut self, id: EventId) -> bool {
        self.ids.remove(&id)
    }

    /// Number of outstanding cancellations.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no cancellations are outstanding.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
