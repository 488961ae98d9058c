//! # wlam-model
//!
//! YAML scenario loading and simulation building for WLAM.
//!
//! This crate provides:
//! - YAML schema types for scenarios
//! - Model loading from files and strings
//! - Simulation building from loaded models
//!
//! ## Defaults
//!
//! The `defaults` section is a partial node. It is merged under every node
//! entry before the entry is parsed: mappings merge key by key, any other
//! value set on the node replaces the default. Setting `radio: null` on a
//! node removes a radio inherited from `defaults`.
//!
//! ```yaml
//! simulation:
//!   duration_s: 86400
//!   seed: 7
//! defaults:
//!   radio:
//!     spreading_factor: 9
//!   link:
//!     vegetation_depth_m: 20
//! nodes:
//!   - name: loRaNodes
//!     count: 10
//!     link:
//!       distance_m: 800
//! ```

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info_span};
use wlam_common::{EntityId, EntityRegistry, Event, EventId, EventPayload, RadioParams, SimTime};
use wlam_lora::{default_radio_params, Gateway, GatewayConfig, NodeLink, PathLossModel, Radio, RadioEntity};
use wlam_metrics::MetricLabels;
use wlam_sensor::{RadioMirror, SensorApp, SensorAppConfig, TIMER_STARTUP};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during model operations.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Duplicate node name.
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// The scenario defines no nodes.
    #[error("Model defines no nodes")]
    NoNodes,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// Configuration Sections
// ============================================================================

/// Simulation-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Simulated duration in seconds.
    pub duration_s: f64,
    /// Seed of every random stream in the run.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration_s: 86_400.0,
            seed: 0,
        }
    }
}

/// Initial radio parameters of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RadioConfig {
    /// Center frequency in Hz.
    pub frequency_hz: u32,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Spreading factor (7-12).
    pub spreading_factor: u8,
    /// Coding rate denominator (5-8).
    pub coding_rate: u8,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        let p = default_radio_params();
        Self {
            frequency_hz: p.frequency_hz,
            bandwidth_hz: p.bandwidth_hz,
            spreading_factor: p.spreading_factor,
            coding_rate: p.coding_rate,
            tx_power_dbm: p.tx_power_dbm,
        }
    }
}

impl From<&RadioConfig> for RadioParams {
    fn from(c: &RadioConfig) -> Self {
        RadioParams {
            frequency_hz: c.frequency_hz,
            bandwidth_hz: c.bandwidth_hz,
            spreading_factor: c.spreading_factor,
            coding_rate: c.coding_rate,
            tx_power_dbm: c.tx_power_dbm,
        }
    }
}

/// Geometry of the link from a node to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Straight-line distance in metres.
    pub distance_m: f64,
    /// Foliage depth along the path in metres.
    pub vegetation_depth_m: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            distance_m: 1000.0,
            vegetation_depth_m: 0.0,
        }
    }
}

/// A node entry after `defaults` have been merged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Node name, or name prefix when `count` is set.
    pub name: String,
    /// Number of identical nodes named `name[0]..name[count-1]`.
    #[serde(default)]
    pub count: Option<usize>,
    /// Sensor application settings.
    #[serde(default)]
    pub app: SensorAppConfig,
    /// Radio settings. A node without a radio sends untagged uplinks straight to the gateway.
    #[serde(default)]
    pub radio: Option<RadioConfig>,
    /// Link to the gateway.
    #[serde(default)]
    pub link: LinkConfig,
}

/// Root scenario structure (YAML schema).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelYaml {
    #[serde(default)]
    simulation: SimulationConfig,
    #[serde(default)]
    defaults: Value,
    #[serde(default)]
    gateway: GatewayConfig,
    #[serde(default)]
    nodes: Vec<Value>,
}

// ============================================================================
// Public Model API
// ============================================================================

/// A fully resolved sensor node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique node name.
    pub name: String,
    /// Application settings.
    pub app: SensorAppConfig,
    /// Radio parameters, if the node has a radio.
    pub radio: Option<RadioParams>,
    /// Link to the gateway.
    pub link: LinkConfig,
}

/// A loaded scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    /// Simulation-wide settings.
    pub simulation: SimulationConfig,
    /// Gateway receiver settings.
    pub gateway: GatewayConfig,
    nodes: Vec<Node>,
}

impl Model {
    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Find a node by name.
    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Copy of this model with the first node replicated `count` times,
    /// every copy transmitting at the given spreading factor and power.
    ///
    /// The first node keeps its application and link settings; a node
    /// without a radio gets the default radio.
    pub fn sweep_variant(&self, spreading_factor: u8, tx_power_dbm: f64, count: usize) -> Result<Model, ModelError> {
        let template = self.nodes.first().ok_or(ModelError::NoNodes)?;
        if count == 0 {
            return Err(ModelError::InvalidConfig("sweep node count must be at least 1".to_string()));
        }
        let base = template.name.split('[').next().unwrap_or(&template.name).to_string();
        let mut radio = template.radio.clone().unwrap_or_else(default_radio_params);
        radio.spreading_factor = spreading_factor;
        radio.tx_power_dbm = tx_power_dbm;

        let nodes = (0..count)
            .map(|i| Node {
                name: format!("{}[{}]", base, i),
                radio: Some(radio.clone()),
                ..template.clone()
            })
            .collect();
        Ok(Model {
            simulation: self.simulation.clone(),
            gateway: self.gateway.clone(),
            nodes,
        })
    }
}

// ============================================================================
// Model Loading
// ============================================================================

/// Load a scenario from a file.
pub fn load_model(path: &Path) -> Result<Model, ModelError> {
    let yaml = std::fs::read_to_string(path)?;
    load_model_from_str(&yaml)
}

/// Parse a scenario from a YAML string.
pub fn load_model_from_str(yaml_str: &str) -> Result<Model, ModelError> {
    let yaml: ModelYaml = serde_yaml::from_str(yaml_str)?;

    let mut nodes = Vec::new();
    let mut names = BTreeSet::new();
    for entry in yaml.nodes {
        let config: NodeConfig = serde_yaml::from_value(merge_defaults(&yaml.defaults, entry))?;
        for node in expand(config)? {
            if !names.insert(node.name.clone()) {
                return Err(ModelError::DuplicateNode(node.name));
            }
            nodes.push(node);
        }
    }
    if nodes.is_empty() {
        return Err(ModelError::NoNodes);
    }

    Ok(Model {
        simulation: yaml.simulation,
        gateway: yaml.gateway,
        nodes,
    })
}

/// Merge `defaults` under `node`. Node values win.
fn merge_defaults(defaults: &Value, node: Value) -> Value {
    match (defaults, node) {
        (Value::Mapping(defaults), Value::Mapping(mut node)) => {
            for (key, default) in defaults {
                let merged = match node.remove(key) {
                    Some(value) => merge_defaults(default, value),
                    None => default.clone(),
                };
                node.insert(key.clone(), merged);
            }
            Value::Mapping(node)
        }
        (_, node) => node,
    }
}

fn expand(config: NodeConfig) -> Result<Vec<Node>, ModelError> {
    let radio = config.radio.as_ref().map(RadioParams::from);
    let make = |name: String| Node {
        name,
        app: config.app.clone(),
        radio: radio.clone(),
        link: config.link,
    };
    match config.count {
        None => Ok(vec![make(config.name.clone())]),
        Some(0) => Err(ModelError::InvalidConfig(format!("node '{}' has count 0", config.name))),
        Some(n) => Ok((0..n).map(|i| make(format!("{}[{}]", config.name, i))).collect()),
    }
}

// ============================================================================
// Model Building
// ============================================================================

/// Information about a node for display and statistics.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Node name.
    pub name: String,
    /// Entity ID of the sensor application.
    pub app_entity_id: u64,
    /// Entity ID of the radio, if any.
    pub radio_entity_id: Option<u64>,
    /// Distance to the gateway in metres.
    pub distance_m: f64,
    /// Foliage depth in metres.
    pub vegetation_depth_m: f64,
    /// Mean path loss at the node's frequency, if it has a radio.
    pub path_loss_db: Option<f64>,
}

/// Result of building a simulation from a model.
pub struct BuiltSimulation {
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Initial events to seed the simulation.
    pub initial_events: Vec<Event>,
    /// Information about each node.
    pub node_infos: Vec<NodeInfo>,
    /// Entity ID of the gateway.
    pub gateway_id: EntityId,
}

/// Build a simulation from a model.
///
/// Entity 0 is the gateway. Each node then gets an application entity and,
/// when configured, a radio entity. Every application starts at time zero.
pub fn build_simulation(model: &Model, seed: u64) -> Result<BuiltSimulation, ModelError> {
    let mut entities = EntityRegistry::new();
    let mut initial_events = Vec::new();
    let mut node_infos = Vec::new();

    let gateway_id = EntityId::new(0);
    let mut gateway = Gateway::new(gateway_id, model.gateway.clone());
    let mut next_entity_id: u64 = 1;

    for node in model.nodes() {
        let _span = info_span!("node", name = %node.name).entered();

        let app_id = EntityId::new(next_entity_id);
        next_entity_id += 1;
        let labels = MetricLabels::new(node.name.clone(), "sensor");
        let path_loss = PathLossModel::new(node.link.vegetation_depth_m);

        let (uplink, mirror, radio_id, path_loss_db) = match &node.radio {
            Some(params) => {
                let radio_id = EntityId::new(next_entity_id);
                next_entity_id += 1;
                let radio = Radio::new(radio_id, params.clone(), gateway_id, labels.clone());
                let mirror = RadioMirror::capture(Some(&radio as &dyn RadioEntity));
                entities.register(Box::new(radio));

                gateway.add_link(
                    radio_id,
                    NodeLink {
                        distance_m: node.link.distance_m,
                        path_loss,
                        labels: labels.clone(),
                    },
                );
                let loss = path_loss.loss_db(node.link.distance_m, params.frequency_hz as f64);
                (radio_id, mirror, Some(radio_id), Some(loss))
            }
            None => (gateway_id, RadioMirror::capture(None), None, None),
        };

        debug!(
            "Node '{}': app={:?} radio={:?} distance={} m",
            node.name, app_id, radio_id, node.link.distance_m
        );

        entities.register(Box::new(SensorApp::new(app_id, node.name.clone(), &node.app, uplink, mirror, seed)));

        initial_events.push(Event {
            id: EventId(initial_events.len() as u64),
            time: SimTime::ZERO,
            source: app_id,
            targets: vec![app_id],
            payload: EventPayload::Timer { timer_id: TIMER_STARTUP },
        });

        node_infos.push(NodeInfo {
            name: node.name.clone(),
            app_entity_id: app_id.0,
            radio_entity_id: radio_id.map(|id| id.0),
            distance_m: node.link.distance_m,
            vegetation_depth_m: node.link.vegetation_depth_m,
            path_loss_db,
        });
    }

    entities.register(Box::new(gateway));

    Ok(BuiltSimulation {
        entities,
        initial_events,
        node_infos,
        gateway_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
simulation:
  duration_s: 3600
  seed: 5
defaults:
  app:
    interval_jitter_fraction: 0.2
  radio:
    spreading_factor: 9
  link:
    vegetation_depth_m: 25
nodes:
  - name: field
    count: 3
    link:
      distance_m: 400
  - name: bare
    radio: null
    app:
      no2_interval_s: 0
"#;

    #[test]
    fn test_load_and_merge_defaults() {
        let model = load_model_from_str(BASIC).unwrap();
        assert_eq!(model.simulation.duration_s, 3600.0);
        assert_eq!(model.simulation.seed, 5);

        let names: Vec<&str> = model.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["field[0]", "field[1]", "field[2]", "bare"]);

        let field = model.find_node("field[1]").unwrap();
        let radio = field.radio.as_ref().unwrap();
        assert_eq!(radio.spreading_factor, 9);
        assert_eq!(radio.frequency_hz, 868_100_000);
        assert_eq!(field.link.distance_m, 400.0);
        assert_eq!(field.link.vegetation_depth_m, 25.0);
        assert_eq!(field.app.interval_jitter_fraction, 0.2);
        assert_eq!(field.app.temperature_interval_s, 300.0);

        let bare = model.find_node("bare").unwrap();
        assert!(bare.radio.is_none());
        assert_eq!(bare.app.no2_interval_s, 0.0);
        assert_eq!(bare.app.interval_jitter_fraction, 0.2);
        assert_eq!(bare.link.distance_m, 1000.0);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = "nodes:\n  - name: a\n  - name: a\n";
        assert!(matches!(load_model_from_str(yaml), Err(ModelError::DuplicateNode(n)) if n == "a"));

        let yaml = "nodes:\n  - name: a\n    count: 2\n  - name: a[1]\n";
        assert!(matches!(load_model_from_str(yaml), Err(ModelError::DuplicateNode(n)) if n == "a[1]"));
    }

    #[test]
    fn test_empty_and_zero_count_rejected() {
        assert!(matches!(load_model_from_str("nodes: []\n"), Err(ModelError::NoNodes)));
        assert!(matches!(load_model_from_str("simulation:\n  seed: 1\n"), Err(ModelError::NoNodes)));
        assert!(matches!(
            load_model_from_str("nodes:\n  - name: a\n    count: 0\n"),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = "nodes:\n  - name: a\n    app:\n      temprature_interval_s: 5\n";
        assert!(matches!(load_model_from_str(yaml), Err(ModelError::YamlError(_))));
        let yaml = "nodes:\n  - name: a\nedges: []\n";
        assert!(matches!(load_model_from_str(yaml), Err(ModelError::YamlError(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = load_model(Path::new("/nonexistent/wlam/model.yaml"));
        assert!(matches!(result, Err(ModelError::IoError(_))));
    }

    #[test]
    fn test_build_simulation() {
        let model = load_model_from_str(BASIC).unwrap();
        let built = build_simulation(&model, 5).unwrap();

        // gateway + 3 × (app + radio) + bare app
        assert_eq!(built.entities.len(), 8);
        assert_eq!(built.gateway_id, EntityId(0));
        assert_eq!(built.initial_events.len(), 4);
        assert!(built
            .initial_events
            .iter()
            .all(|e| matches!(e.payload, EventPayload::Timer { timer_id: TIMER_STARTUP })));

        let ids: BTreeSet<u64> = built.initial_events.iter().map(|e| e.id.0).collect();
        assert_eq!(ids.len(), 4);

        let field = &built.node_infos[0];
        assert_eq!(field.app_entity_id, 1);
        assert_eq!(field.radio_entity_id, Some(2));
        assert!(field.path_loss_db.unwrap() > 80.0);

        let bare = &built.node_infos[3];
        assert_eq!(bare.radio_entity_id, None);
        assert_eq!(bare.path_loss_db, None);
    }

    #[test]
    fn test_sweep_variant() {
        let model = load_model_from_str(BASIC).unwrap();
        let variant = model.sweep_variant(12, -5.0, 10).unwrap();
        assert_eq!(variant.nodes().len(), 10);
        assert_eq!(variant.nodes()[9].name, "field[9]");
        for node in variant.nodes() {
            let radio = node.radio.as_ref().unwrap();
            assert_eq!(radio.spreading_factor, 12);
            assert_eq!(radio.tx_power_dbm, -5.0);
            assert_eq!(node.link.distance_m, 400.0);
        }
        assert!(matches!(model.sweep_variant(7, 14.0, 0), Err(ModelError::InvalidConfig(_))));
    }
}
