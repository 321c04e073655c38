//! Artifact Generator
//!
//! Turns a validated channel into the four deployable artifacts: the flow
//! document, runtime settings, the build manifest and the credentials map.
//! A stage that cannot be rendered becomes a single placeholder node and a
//! stage-scoped warning; the rest of the channel still compiles.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::{BuildMode, Channel, Edge, OutletRef, ParamValue, Position, RuntimeTarget, Stage};
use crate::credentials::CredentialsMap;
use crate::hashing::{generate_flow_id, generate_node_id};
use crate::settings::build_settings;
use crate::substitution::{apply_defaults, validate_parameters, SubstitutionContext, SubstitutionEngine};
use crate::templates::{FetchOptions, NexonTemplate, TemplateError, TemplateResolver};
use crate::ENGINE_VERSION;

pub const FLOWS_FILE: &str = "flows.json";
pub const SETTINGS_FILE: &str = "settings.js";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CREDENTIALS_MAP_FILE: &str = "credentials.map.json";
pub const MANIFEST_FORMAT_VERSION: &str = "1";

const GRID_ORIGIN: f64 = 100.0;
const GRID_COLUMNS: usize = 4;
const GRID_DX: f64 = 250.0;
const GRID_DY: f64 = 150.0;
const NODE_SPACING: f64 = 180.0;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a stage fell back to a placeholder node.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("template unavailable: {0}")]
    Template(#[from] TemplateError),

    #[error("nexon {nexon} does not support runtime target '{target}'")]
    IncompatibleTarget { nexon: String, target: RuntimeTarget },

    #[error("nexon {nexon} requires engine >= {required}, current is {current}")]
    EngineTooOld {
        nexon: String,
        required: String,
        current: String,
    },

    #[error("parameter validation failed: {}", .0.join("; "))]
    Parameters(Vec<String>),

    #[error("substitution failed in template node '{node}': {}", .errors.join("; "))]
    Substitution { node: String, errors: Vec<String> },
}

impl StageError {
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Template(_) => "template",
            StageError::IncompatibleTarget { .. } | StageError::EngineTooOld { .. } => "compatibility",
            StageError::Parameters(_) => "parameters",
            StageError::Substitution { .. } => "substitution",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationIssue {
    pub level: IssueLevel,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub build_id: String,
    pub mode: BuildMode,
    /// Overrides the channel's own runtime target when set.
    pub target: Option<RuntimeTarget>,
    pub fetch: FetchOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedArtifacts {
    pub flows_json: Value,
    pub settings: Value,
    pub manifest: Value,
    pub credentials_map: Value,
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub artifacts: GeneratedArtifacts,
    pub issues: Vec<GenerationIssue>,
    /// Stages rendered as placeholder nodes.
    pub fallback_stages: Vec<String>,
}

impl GenerationOutput {
    pub fn warnings(&self) -> impl Iterator<Item = &GenerationIssue> {
        self.issues.iter().filter(|i| i.level == IssueLevel::Warning)
    }
}

/// One node in the generated flow document.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowNode {
    pub id: String,
    pub node_type: String,
    pub z: String,
    pub x: f64,
    pub y: f64,
    pub wires: Vec<Vec<String>>,
    pub properties: Map<String, Value>,
}

impl FlowNode {
    /// Add `target` to output `port`; false when already connected.
    pub fn connect(&mut self, port: usize, target: &str) -> bool {
        if self.wires.len() <= port {
            self.wires.resize_with(port + 1, Vec::new);
        }
        let outputs = &mut self.wires[port];
        if outputs.iter().any(|t| t == target) {
            return false;
        }
        outputs.push(target.to_string());
        true
    }

    pub fn to_value(&self) -> Value {
        let mut obj = self.properties.clone();
        obj.insert("id".into(), Value::String(self.id.clone()));
        obj.insert("type".into(), Value::String(self.node_type.clone()));
        obj.insert("z".into(), Value::String(self.z.clone()));
        obj.insert("x".into(), json!(self.x));
        obj.insert("y".into(), json!(self.y));
        obj.insert("wires".into(), json!(self.wires));
        Value::Object(obj)
    }
}

/// Nodes of a flow plus the node range each stage produced.
#[derive(Debug, Default)]
pub struct FlowGraph {
    nodes: Vec<FlowNode>,
    spans: HashMap<String, (usize, usize)>,
    outlets: HashMap<String, Vec<String>>,
}

impl FlowGraph {
    pub fn add_stage(&mut self, stage_id: &str, nodes: Vec<FlowNode>, outlets: Vec<String>) {
        if nodes.is_empty() {
            return;
        }
        let first = self.nodes.len();
        self.nodes.extend(nodes);
        self.spans
            .insert(stage_id.to_string(), (first, self.nodes.len() - 1));
        self.outlets.insert(stage_id.to_string(), outlets);
    }

    pub fn nodes(&self) -> &[FlowNode] {
        &self.nodes
    }

    /// Wire the last node of the source stage to the first node of the
    /// target stage. Returns whether a new connection was made.
    pub fn connect_edge(&mut self, edge: &Edge) -> Result<bool, String> {
        let (_, from_last) = *self
            .spans
            .get(&edge.from.stage_id)
            .ok_or_else(|| format!("edge '{}': unknown source stage", edge.id))?;
        let (to_first, _) = *self
            .spans
            .get(&edge.to.stage_id)
            .ok_or_else(|| format!("edge '{}': unknown target stage", edge.id))?;

        let ports = self.nodes[from_last].wires.len().max(1);
        let port = match &edge.from.outlet {
            None => 0,
            Some(OutletRef::Index(i)) if (*i as usize) < ports => *i as usize,
            Some(OutletRef::Index(i)) => {
                return Err(format!(
                    "edge '{}': stage '{}' has {} outlet(s), outlet {} is out of range",
                    edge.id, edge.from.stage_id, ports, i
                ))
            }
            Some(OutletRef::Name(name)) => self
                .outlets
                .get(&edge.from.stage_id)
                .and_then(|o| o.iter().position(|n| n == name))
                .ok_or_else(|| {
                    format!(
                        "edge '{}': stage '{}' has no outlet named '{}'",
                        edge.id, edge.from.stage_id, name
                    )
                })?,
        };

        let target = self.nodes[to_first].id.clone();
        Ok(self.nodes[from_last].connect(port, &target))
    }
}

/// Node type used for a stage that could not be rendered.
pub fn fallback_node_type(nexon_id: &str) -> &'static str {
    const MAPPING: &[(&str, &str)] = &[
        ("http-in", "http in"),
        ("http-response", "http response"),
        ("http", "http request"),
        ("mqtt-in", "mqtt in"),
        ("mqtt", "mqtt out"),
        ("tcp-in", "tcp in"),
        ("tcp", "tcp out"),
        ("udp-in", "udp in"),
        ("udp", "udp out"),
        ("inject", "inject"),
        ("timer", "inject"),
        ("schedule", "inject"),
        ("debug", "debug"),
        ("log", "debug"),
        ("switch", "switch"),
        ("change", "change"),
        ("delay", "delay"),
        ("template", "template"),
        ("split", "split"),
        ("join", "join"),
    ];
    MAPPING
        .iter()
        .find(|(prefix, _)| nexon_id.starts_with(prefix))
        .map(|(_, t)| *t)
        .unwrap_or("function")
}

fn grid_position(index: usize) -> Position {
    Position {
        x: GRID_ORIGIN + (index % GRID_COLUMNS) as f64 * GRID_DX,
        y: GRID_ORIGIN + (index / GRID_COLUMNS) as f64 * GRID_DY,
    }
}

struct StageRender {
    nodes: Vec<FlowNode>,
    outlets: Vec<String>,
    resolved: String,
    notes: Vec<String>,
}

pub struct ArtifactGenerator {
    resolver: Arc<TemplateResolver>,
    engine: SubstitutionEngine,
}

impl ArtifactGenerator {
    pub fn new(resolver: Arc<TemplateResolver>) -> Self {
        Self {
            resolver,
            engine: SubstitutionEngine::new(),
        }
    }

    pub async fn generate(
        &self,
        channel: &Channel,
        options: &GenerateOptions,
    ) -> Result<GenerationOutput, GeneratorError> {
        let target = options.target.unwrap_or(channel.runtime.target);
        let flow_id = generate_flow_id(&channel.channel_id);
        let credentials = CredentialsMap::from_channel(channel);
        let secret_env = credentials.env_by_ref();
        let env = channel.metadata_env();

        let base_ctx = SubstitutionContext {
            parameters: Value::Object(Map::new()),
            stage: Value::Null,
            channel: json!({
                "id": channel.channel_id,
                "title": channel.title,
                "version": channel.version,
            }),
            runtime: json!({
                "target": target,
                "mode": options.mode,
                "flowId": flow_id,
                "engineVersion": ENGINE_VERSION,
            }),
            env: serde_json::to_value(&env)?,
            secret_env,
        };

        let mut issues = vec![];
        let mut fallback_stages = vec![];
        let mut stage_table = BTreeMap::new();
        let mut graph = FlowGraph::default();

        for (index, stage) in channel.stages.iter().enumerate() {
            let origin = stage.position.unwrap_or_else(|| grid_position(index));
            let mut ctx = base_ctx.clone();
            ctx.stage = json!({
                "id": stage.id,
                "title": stage.display_name(),
                "nexonId": stage.nexon_id,
                "nexonVersion": stage.nexon_version,
            });

            let render = match self
                .render_stage(stage, &flow_id, origin, target, ctx, &options.fetch)
                .await
            {
                Ok(render) => render,
                Err(e) => {
                    warn!(stage = %stage.id, nexon = %stage.nexon_id, error = %e, "stage rendered as placeholder");
                    issues.push(GenerationIssue {
                        level: IssueLevel::Warning,
                        code: format!("generate.{}", e.code()),
                        stage_id: Some(stage.id.clone()),
                        message: format!("Stage '{}' replaced by a placeholder node: {}", stage.id, e),
                    });
                    fallback_stages.push(stage.id.clone());
                    fallback_render(stage, &flow_id, origin, &e)
                }
            };

            for note in render.notes {
                issues.push(GenerationIssue {
                    level: IssueLevel::Info,
                    code: "generate.substitution".to_string(),
                    stage_id: Some(stage.id.clone()),
                    message: note,
                });
            }
            stage_table.insert(stage.id.clone(), render.resolved);
            graph.add_stage(&stage.id, render.nodes, render.outlets);
        }

        for edge in &channel.edges {
            match graph.connect_edge(edge) {
                Ok(true) => {}
                Ok(false) => debug!(edge = %edge.id, "duplicate connection skipped"),
                Err(message) => issues.push(GenerationIssue {
                    level: IssueLevel::Warning,
                    code: "generate.wiring".to_string(),
                    stage_id: Some(edge.from.stage_id.clone()),
                    message,
                }),
            }
        }

        let mut flows = vec![json!({
            "id": flow_id,
            "type": "tab",
            "label": channel.title,
            "disabled": false,
            "info": channel
                .documentation
                .as_ref()
                .and_then(|d| d.summary.clone())
                .unwrap_or_default(),
        })];
        flows.extend(graph.nodes().iter().map(FlowNode::to_value));

        let artifacts = GeneratedArtifacts {
            flows_json: Value::Array(flows),
            settings: build_settings(&env, options.mode),
            manifest: json!({
                "formatVersion": MANIFEST_FORMAT_VERSION,
                "channelId": channel.channel_id,
                "title": channel.title,
                "channelVersion": channel.version,
                "buildId": options.build_id,
                "mode": options.mode,
                "target": target,
                "engineVersion": ENGINE_VERSION,
                "flowId": flow_id,
                "nodeCount": graph.nodes().len(),
                "artifacts": {
                    "flows": FLOWS_FILE,
                    "settings": SETTINGS_FILE,
                    "manifest": MANIFEST_FILE,
                    "credentialsMap": CREDENTIALS_MAP_FILE,
                },
                "stages": stage_table,
                "fallbackStages": fallback_stages,
                "secretEnv": credentials.env_vars(),
            }),
            credentials_map: serde_json::to_value(&credentials)?,
        };

        Ok(GenerationOutput {
            artifacts,
            issues,
            fallback_stages,
        })
    }

    async fn render_stage(
        &self,
        stage: &Stage,
        flow_id: &str,
        origin: Position,
        target: RuntimeTarget,
        mut ctx: SubstitutionContext,
        fetch: &FetchOptions,
    ) -> Result<StageRender, StageError> {
        let template = self
            .resolver
            .resolve(&stage.nexon_id, stage.nexon_version.as_deref(), fetch)
            .await?;
        check_compatibility(&template, target)?;

        let defs = template.manifest.parameter_defs().cloned().unwrap_or_default();
        let resolved = self.engine.resolve_params(&stage.params, &ctx);
        let mut notes = resolved.warnings;
        let mut params = match resolved.value {
            Some(v) if resolved.errors.is_empty() => v,
            _ => {
                return Err(StageError::Parameters(
                    resolved.errors.iter().map(ToString::to_string).collect(),
                ))
            }
        };
        apply_defaults(&mut params, &defs);
        let errors = validate_parameters(&params, &defs);
        if !errors.is_empty() {
            return Err(StageError::Parameters(
                errors.iter().map(ToString::to_string).collect(),
            ));
        }
        ctx.parameters = params;

        let ids: HashMap<&str, String> = template
            .template
            .iter()
            .map(|n| (n.id.as_str(), generate_node_id(&stage.id, &n.id)))
            .collect();

        let mut nodes = Vec::with_capacity(template.template.len());
        for (j, node) in template.template.iter().enumerate() {
            let mut props = node.properties.clone();
            let dx = props.remove("x").and_then(|v| v.as_f64()).unwrap_or(j as f64 * NODE_SPACING);
            let dy = props.remove("y").and_then(|v| v.as_f64()).unwrap_or(0.0);
            props.remove("z");

            let outcome = self.engine.substitute(&Value::Object(props), &ctx, None);
            notes.extend(outcome.warnings);
            let properties = match outcome.value {
                Some(Value::Object(map)) if outcome.errors.is_empty() => map,
                _ => {
                    return Err(StageError::Substitution {
                        node: node.id.clone(),
                        errors: outcome.errors.iter().map(ToString::to_string).collect(),
                    })
                }
            };

            let wires = node
                .wires
                .iter()
                .map(|port| {
                    port.iter()
                        .filter_map(|t| ids.get(t.as_str()).cloned())
                        .collect()
                })
                .collect();

            nodes.push(FlowNode {
                id: generate_node_id(&stage.id, &node.id),
                node_type: node.node_type.clone(),
                z: flow_id.to_string(),
                x: origin.x + dx,
                y: origin.y + dy,
                wires,
                properties,
            });
        }

        let outlets = template.manifest.outlets.clone();
        if let Some(last) = nodes.last_mut() {
            let ports = outlets.len().max(1);
            if last.wires.len() < ports {
                last.wires.resize_with(ports, Vec::new);
            }
        }

        debug!(stage = %stage.id, template = %template.key(), nodes = nodes.len(), "stage rendered");
        Ok(StageRender {
            nodes,
            outlets,
            resolved: template.key(),
            notes,
        })
    }
}

fn check_compatibility(template: &NexonTemplate, target: RuntimeTarget) -> Result<(), StageError> {
    let Some(compat) = &template.manifest.compatibility else {
        return Ok(());
    };
    if !compat.targets.is_empty() && !compat.targets.contains(&target) {
        return Err(StageError::IncompatibleTarget {
            nexon: template.key(),
            target,
        });
    }
    if let Some(min) = &compat.min_engine_version {
        let too_old = match (semver::Version::parse(min), semver::Version::parse(ENGINE_VERSION)) {
            (Ok(required), Ok(current)) => current < required,
            _ => true,
        };
        if too_old {
            return Err(StageError::EngineTooOld {
                nexon: template.key(),
                required: min.clone(),
                current: ENGINE_VERSION.to_string(),
            });
        }
    }
    Ok(())
}

fn fallback_render(stage: &Stage, flow_id: &str, origin: Position, error: &StageError) -> StageRender {
    let node_type = fallback_node_type(&stage.nexon_id);
    let mut properties = Map::new();
    properties.insert("name".into(), Value::String(stage.display_name().to_string()));
    properties.insert(
        "info".into(),
        Value::String(format!("Placeholder for nexon '{}': {}", stage.nexon_id, error)),
    );
    if node_type == "function" {
        let code = match stage.params.get("code") {
            Some(ParamValue::Literal(Value::String(code))) => code.clone(),
            _ => "return msg;".to_string(),
        };
        properties.insert("func".into(), Value::String(code));
        properties.insert("outputs".into(), json!(1));
    }

    StageRender {
        nodes: vec![FlowNode {
            id: generate_node_id(&stage.id, "fallback"),
            node_type: node_type.to_string(),
            z: flow_id.to_string(),
            x: origin.x,
            y: origin.y,
            wires: vec![vec![]],
            properties,
        }],
        outlets: vec![],
        resolved: format!(
            "{}@{}",
            stage.nexon_id,
            stage.nexon_version.as_deref().unwrap_or("unresolved")
        ),
        notes: vec![],
    }
}
