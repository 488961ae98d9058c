//! # wlam-runner library
//!
//! Library interface for the WLAM simulation runner.
//!
//! Drives a built model through the event queue and tallies what reached the
//! gateway. The `wlam` binary and the integration tests both go through here.
//!
//! ## Cancellation
//!
//! Entities cancel scheduled events through [`SimContext::cancel_event`].
//! The loop collects those ids after every dispatch and drops a cancelled
//! event when it reaches the head of the queue. Once the end time is reached
//! every entity is torn down.

pub mod metrics_export;

pub use wlam_common::SimTime;
use serde::Serialize;
use std::collections::{BTreeMap, BinaryHeap};
use std::io::Write;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};
use wlam_common::{CancelSet, DeliveryOutcome, EntityId, Event, EventId, EventPayload, SimContext};
use wlam_metrics::{InMemoryRecorder, MetricsSnapshot};
use wlam_model::{BuiltSimulation, Model, NodeInfo};

// ============================================================================
// Error Types
// ============================================================================

/// Anything that can stop a run or a sweep.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] wlam_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] wlam_common::SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing stats or metrics as JSON failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Per-node statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeStats {
    /// Uplinks handed to the transport.
    pub uplinks: u64,
    /// Encoded bytes handed to the transport.
    pub bytes: u64,
    /// Uplinks demodulated by the gateway.
    pub received: u64,
    /// Uplinks below the SNR threshold.
    pub weak: u64,
    /// Uplinks lost to collisions.
    pub collided: u64,
    /// Uplinks delivered without a radio.
    pub untagged: u64,
}

/// Run-wide tallies, with a per-node split in `nodes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationStats {
    /// Events dispatched, cancelled ones excluded.
    pub total_events: u64,
    /// Uplinks produced by the sensor applications.
    pub uplinks_generated: u64,
    /// Packets put on the air.
    pub packets_transmitted: u64,
    /// Packets demodulated by the gateway.
    pub packets_received: u64,
    /// Packets below the SNR threshold.
    pub packets_weak: u64,
    /// Lost to an overlapping frame.
    pub packets_collided: u64,
    /// Packets delivered without PHY evaluation.
    pub packets_untagged: u64,
    /// Encoded bytes produced by the sensor applications.
    pub bytes_sent: u64,
    /// Delivered uplinks as a percentage of generated uplinks.
    pub pdr_percent: f64,
    /// Clock value when the run stopped.
    pub simulation_time_us: u64,
    /// Real time spent, in ms.
    pub wall_time_ms: u64,
    /// Per-node statistics keyed by node name.
    pub nodes: BTreeMap<String, NodeStats>,
}

impl SimulationStats {
    /// Uplinks that reached the collector, with or without a radio.
    pub fn delivered(&self) -> u64 {
        self.packets_received + self.packets_untagged
    }

    fn update_pdr(&mut self) {
        self.pdr_percent = if self.uplinks_generated == 0 {
            0.0
        } else {
            self.delivered() as f64 / self.uplinks_generated as f64 * 100.0
        };
    }
}

// ============================================================================
// Trace Recording
// ============================================================================

/// What a trace line describes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceKind {
    /// A sensor application handed a record to its transport.
    Uplink {
        /// Presence bitmap of the record.
        bitmap: u8,
        /// Encoded size in bytes.
        payload_len: usize,
        /// Whether the packet carries radio metadata.
        tagged: bool,
    },
    /// The gateway resolved a reception.
    Delivery {
        /// Reception outcome.
        outcome: DeliveryOutcome,
        /// Encoded size in bytes.
        payload_len: usize,
        /// RSSI at the gateway.
        #[serde(skip_serializing_if = "Option::is_none")]
        rssi_dbm: Option<f64>,
        /// SNR at the gateway.
        #[serde(skip_serializing_if = "Option::is_none")]
        snr_db: Option<f64>,
        /// Start of the reception in seconds.
        start_time_s: f64,
    },
}

/// One line of the trace file.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    /// Simulation time in seconds.
    pub time_s: f64,
    /// Originating node name.
    pub node: String,
    /// Event-specific fields (flattened into this object).
    #[serde(flatten)]
    pub kind: TraceKind,
}

/// Trace recorder writing one JSON object per line.
pub struct TraceRecorder {
    output: Option<Box<dyn Write>>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    /// Create a new trace recorder. With no output, entries are dropped.
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        TraceRecorder {
            output,
            entries: Vec::new(),
        }
    }

    /// Record an entry.
    pub fn record(&mut self, entry: TraceEntry) {
        if self.output.is_some() {
            self.entries.push(entry);
        }
    }

    /// Write out all buffered entries.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(ref mut output) = self.output {
            for entry in self.entries.drain(..) {
                serde_json::to_writer(&mut *output, &entry)?;
                writeln!(output)?;
            }
            output.flush()?;
        }
        Ok(())
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Pops events in time order and dispatches them until the end marker.
pub struct EventLoop {
    event_queue: BinaryHeap<Event>,
    simulation: BuiltSimulation,
    context: SimContext,
    cancelled: CancelSet,
    trace: TraceRecorder,
    stats: SimulationStats,
}

impl EventLoop {
    /// Queue the model's initial events.
    pub fn new(simulation: BuiltSimulation, seed: u64, trace_output: Option<Box<dyn Write>>) -> Self {
        let mut event_queue = BinaryHeap::new();
        for event in simulation.initial_events.iter().cloned() {
            event_queue.push(event);
        }

        // fresh ids start past the initial events
        let first_event_id = simulation
            .initial_events
            .iter()
            .map(|e| e.id.0 + 1)
            .max()
            .unwrap_or(0);

        let mut stats = SimulationStats::default();
        for info in &simulation.node_infos {
            stats.nodes.insert(info.name.clone(), NodeStats::default());
        }

        EventLoop {
            event_queue,
            simulation,
            context: SimContext::with_first_event_id(seed, first_event_id),
            cancelled: CancelSet::new(),
            trace: TraceRecorder::new(trace_output),
            stats,
        }
    }

    /// Run the simulation until `duration`, then tear every entity down.
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        let start_time = Instant::now();
        info!(
            "Starting simulation: {} nodes, {} entities, until {}",
            self.simulation.node_infos.len(),
            self.simulation.entities.len(),
            duration
        );

        self.event_queue.push(Event {
            id: EventId(u64::MAX),
            time: duration,
            source: EntityId::new(0),
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        });

        while let Some(event) = self.event_queue.pop() {
            if matches!(event.payload, EventPayload::SimulationEnd) {
                self.context.set_time(event.time);
                break;
            }

            if self.cancelled.take(event.id) {
                debug!("Dropping cancelled {} event {:?}", event.payload.kind(), event.id);
                continue;
            }

            self.context.set_time(event.time);
            self.simulation.entities.dispatch_event(&event, &mut self.context)?;

            for new_event in self.context.take_pending_events() {
                self.event_queue.push(new_event);
            }
            self.cancelled.extend(self.context.take_cancelled());

            self.stats.total_events += 1;
            self.update_stats(&event);
            self.record_trace(&event);
        }

        self.simulation.entities.teardown_all(&mut self.context);
        self.cancelled.extend(self.context.take_cancelled());
        // anything posted during teardown is past the end of the run
        self.context.take_pending_events();

        self.stats.simulation_time_us = self.context.time().as_micros();
        self.stats.wall_time_ms = start_time.elapsed().as_millis() as u64;
        self.stats.update_pdr();
        self.trace.flush()?;

        info!(
            "Simulation finished: {} events, {} uplinks, PDR {:.1}%",
            self.stats.total_events, self.stats.uplinks_generated, self.stats.pdr_percent
        );

        Ok(self.stats.clone())
    }

    /// Tallies so far.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// One entry per sensor node.
    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.simulation.node_infos
    }

    /// Clock of the last processed event.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    /// Events still queued, cancelled ones included.
    pub fn pending_events(&self) -> usize {
        self.event_queue.len()
    }

    /// Cancelled events not yet dropped from the queue.
    pub fn cancelled_events(&self) -> usize {
        self.cancelled.len()
    }

    fn node_mut(&mut self, name: &str) -> &mut NodeStats {
        self.stats.nodes.entry(name.to_string()).or_default()
    }

    /// Fold one dispatched event into the tallies.
    fn update_stats(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::Uplink(uplink) => {
                // an uplink event is posted exactly once per record, by the app
                let len = uplink.packet.payload.len() as u64;
                self.stats.uplinks_generated += 1;
                self.stats.bytes_sent += len;
                let node = self.node_mut(&uplink.packet.node);
                node.uplinks += 1;
                node.bytes += len;
            }
            EventPayload::TransmitAir(_) => {
                self.stats.packets_transmitted += 1;
            }
            EventPayload::Delivery(delivery) => {
                match delivery.outcome {
                    DeliveryOutcome::Received => self.stats.packets_received += 1,
                    DeliveryOutcome::Weak => self.stats.packets_weak += 1,
                    DeliveryOutcome::Collided => self.stats.packets_collided += 1,
                    DeliveryOutcome::Untagged => self.stats.packets_untagged += 1,
                }
                let node = self.node_mut(&delivery.node);
                match delivery.outcome {
                    DeliveryOutcome::Received => node.received += 1,
                    DeliveryOutcome::Weak => node.weak += 1,
                    DeliveryOutcome::Collided => node.collided += 1,
                    DeliveryOutcome::Untagged => node.untagged += 1,
                }
            }
            _ => {}
        }
    }

    /// Trace uplinks and deliveries; other events are internal.
    fn record_trace(&mut self, event: &Event) {
        let (node, kind) = match &event.payload {
            EventPayload::Uplink(uplink) => (
                uplink.packet.node.clone(),
                TraceKind::Uplink {
                    bitmap: uplink.packet.bitmap,
                    payload_len: uplink.packet.payload.len(),
                    tagged: uplink.packet.tag.is_some(),
                },
            ),
            EventPayload::Delivery(delivery) => (
                delivery.node.clone(),
                TraceKind::Delivery {
                    outcome: delivery.outcome,
                    payload_len: delivery.payload_len,
                    rssi_dbm: delivery.rssi_dbm,
                    snr_db: delivery.snr_db,
                    start_time_s: delivery.start_time.as_secs_f64(),
                },
            ),
            _ => return,
        };

        self.trace.record(TraceEntry {
            time_s: event.time.as_secs_f64(),
            node,
            kind,
        });
    }
}

/// Event loop without a trace sink.
pub fn create_event_loop(simulation: BuiltSimulation, seed: u64) -> EventLoop {
    EventLoop::new(simulation, seed, None)
}

// ============================================================================
// Recorded Runs
// ============================================================================

/// Result of a run with its own metrics recorder.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Run statistics.
    pub stats: SimulationStats,
    /// Everything the entities recorded during the run.
    pub metrics: MetricsSnapshot,
}

/// Build and run `model` with a metrics recorder local to this run.
///
/// Runs do not share metric state, so sweeps can run one model after another
/// in the same process.
pub fn run_recorded(
    model: &Model,
    seed: u64,
    duration: SimTime,
    trace_output: Option<Box<dyn Write>>,
) -> Result<RunOutput, RunnerError> {
    let recorder = InMemoryRecorder::new();
    let stats = metrics::with_local_recorder(&recorder, || -> Result<SimulationStats, RunnerError> {
        wlam_metrics::describe_metrics();
        let simulation = build_simulation(model, seed)?;
        let mut event_loop = EventLoop::new(simulation, seed, trace_output);
        event_loop.run(duration)
    })?;
    Ok(RunOutput {
        stats,
        metrics: recorder.snapshot(),
    })
}

// ============================================================================
// Parameter Sweeps
// ============================================================================

/// Grid of configurations for [`run_sweep`].
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Spreading factors to try.
    pub spreading_factors: Vec<u8>,
    /// Transmit powers to try, in dBm.
    pub tx_powers_dbm: Vec<f64>,
    /// Node counts to try.
    pub node_counts: Vec<usize>,
    /// Runs per configuration; repetition `r` uses seed `seed + r`.
    pub repetitions: u32,
    /// Base seed.
    pub seed: u64,
    /// Duration of each run.
    pub duration: SimTime,
}

/// One finished sweep run.
#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    /// Configuration name, `SF{sf}_TP{tp}_N{n}_GW1`.
    pub name: String,
    /// Spreading factor.
    pub sf: u8,
    /// TX power of every node in this run, dBm.
    pub tx_power_dbm: f64,
    /// Number of nodes.
    pub nodes: usize,
    /// Repetition index.
    pub repetition: u32,
    /// Seed of this run.
    pub seed: u64,
    /// Delivered uplinks as a percentage of generated uplinks.
    pub pdr_percent: f64,
    /// Uplinks produced.
    pub uplinks_generated: u64,
    /// Packets demodulated by the gateway.
    pub packets_received: u64,
    /// Packets below the SNR threshold.
    pub packets_weak: u64,
    /// Lost to an overlapping frame.
    pub packets_collided: u64,
}

/// Name of a sweep configuration.
pub fn sweep_run_name(sf: u8, tx_power_dbm: f64, nodes: usize) -> String {
    format!("SF{}_TP{}_N{}_GW1", sf, tx_power_dbm, nodes)
}

/// Run every combination in `config` using the first node of `model` as the
/// template.
pub fn run_sweep(model: &Model, config: &SweepConfig) -> Result<Vec<SweepResult>, RunnerError> {
    if config.repetitions == 0 {
        return Err(RunnerError::ConfigError("repetitions must be at least 1".to_string()));
    }
    if config.duration == SimTime::ZERO {
        return Err(RunnerError::ConfigError("sweep duration must be positive".to_string()));
    }

    let mut results = Vec::new();
    for &sf in &config.spreading_factors {
        for &tp in &config.tx_powers_dbm {
            for &n in &config.node_counts {
                let variant = model.sweep_variant(sf, tp, n)?;
                let name = sweep_run_name(sf, tp, n);
                for repetition in 0..config.repetitions {
                    let seed = config.seed.wrapping_add(repetition as u64);
                    let _span = tracing::info_span!("sweep", run = %name, repetition).entered();
                    let output = run_recorded(&variant, seed, config.duration, None)?;
                    let stats = output.stats;
                    results.push(SweepResult {
                        name: name.clone(),
                        sf,
                        tx_power_dbm: tp,
                        nodes: n,
                        repetition,
                        seed,
                        pdr_percent: stats.pdr_percent,
                        uplinks_generated: stats.uplinks_generated,
                        packets_received: stats.packets_received,
                        packets_weak: stats.packets_weak,
                        packets_collided: stats.packets_collided,
                    });
                }
            }
        }
    }
    Ok(results)
}

// Model loading, so callers need only this crate
pub use wlam_model::{build_simulation, load_model, load_model_from_str};
