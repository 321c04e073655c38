//! Channel Validation - Schema then Semantics
//!
//! Schema checks run on the raw document so that malformed input yields
//! issues instead of a deserialization failure. Semantic rules then run on
//! the typed [`Channel`]. Errors make the channel invalid; warnings never do.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::channel::{Channel, EXPR_KEY, SECRET_KEY};
use crate::expression;
use crate::hashing::{compute_content_hash, derive_id};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_ids: Vec<String>,
}

impl ValidationIssue {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: IssueSeverity::Error,
            message: message.into(),
            path: None,
            stage_ids: vec![],
        }
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            ..Self::error(code, message)
        }
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_stages(mut self, ids: Vec<String>) -> Self {
        self.stage_ids = ids;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelValidation {
    pub valid: bool,
    #[serde(skip)]
    pub channel: Option<Channel>,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ChannelValidation {
    fn from_issues(channel: Option<Channel>, issues: Vec<ValidationIssue>) -> Self {
        let (errors, warnings): (Vec<_>, Vec<_>) = issues
            .into_iter()
            .partition(|i| i.severity == IssueSeverity::Error);
        let valid = errors.is_empty() && channel.is_some();
        Self {
            valid,
            channel: if valid { channel } else { None },
            errors,
            warnings,
        }
    }
}

/// Semantic rule over a typed channel.
pub trait ChannelRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, channel: &Channel) -> Vec<ValidationIssue>;
}

pub struct DuplicateStageRule;

impl ChannelRule for DuplicateStageRule {
    fn name(&self) -> &'static str {
        "stage.duplicate-id"
    }

    fn check(&self, channel: &Channel) -> Vec<ValidationIssue> {
        let mut seen = HashSet::new();
        let mut reported = BTreeSet::new();
        for stage in &channel.stages {
            if !seen.insert(stage.id.as_str()) {
                reported.insert(stage.id.clone());
            }
        }
        reported
            .into_iter()
            .map(|id| {
                ValidationIssue::error(self.name(), format!("Duplicate stage id '{}'", id))
                    .with_stages(vec![id])
            })
            .collect()
    }
}

pub struct DuplicateEdgeRule;

impl ChannelRule for DuplicateEdgeRule {
    fn name(&self) -> &'static str {
        "edge.duplicate-id"
    }

    fn check(&self, channel: &Channel) -> Vec<ValidationIssue> {
        let mut seen = HashSet::new();
        let mut reported = BTreeSet::new();
        for edge in &channel.edges {
            if !seen.insert(edge.id.as_str()) {
                reported.insert(edge.id.clone());
            }
        }
        reported
            .into_iter()
            .map(|id| ValidationIssue::error(self.name(), format!("Duplicate edge id '{}'", id)))
            .collect()
    }
}

pub struct EdgeEndpointRule;

impl ChannelRule for EdgeEndpointRule {
    fn name(&self) -> &'static str {
        "edge.unknown-stage"
    }

    fn check(&self, channel: &Channel) -> Vec<ValidationIssue> {
        let ids: HashSet<&str> = channel.stages.iter().map(|s| s.id.as_str()).collect();
        let mut issues = vec![];
        for (i, edge) in channel.edges.iter().enumerate() {
            for (end, stage_id) in [("from", &edge.from.stage_id), ("to", &edge.to.stage_id)] {
                if !ids.contains(stage_id.as_str()) {
                    issues.push(
                        ValidationIssue::error(
                            self.name(),
                            format!("Edge '{}' references unknown stage '{}'", edge.id, stage_id),
                        )
                        .at(format!("edges[{}].{}.stageId", i, end)),
                    );
                }
            }
        }
        issues
    }
}

/// Stages with no incoming or outgoing edge.
pub struct OrphanStageRule;

impl ChannelRule for OrphanStageRule {
    fn name(&self) -> &'static str {
        "stage.orphan"
    }

    fn check(&self, channel: &Channel) -> Vec<ValidationIssue> {
        let connected: HashSet<&str> = channel
            .edges
            .iter()
            .flat_map(|e| [e.from.stage_id.as_str(), e.to.stage_id.as_str()])
            .collect();
        let orphans: Vec<String> = channel
            .stages
            .iter()
            .filter(|s| !connected.contains(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect();

        if orphans.is_empty() {
            return vec![];
        }
        vec![ValidationIssue::warning(
            self.name(),
            format!("Orphaned stages with no connections: {}", orphans.join(", ")),
        )
        .with_stages(orphans)]
    }
}

/// Directed stage graph built from edge endpoints.
pub struct StageGraph<'a> {
    order: Vec<&'a str>,
    edges: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> StageGraph<'a> {
    pub fn from_channel(channel: &'a Channel) -> Self {
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &channel.edges {
            edges
                .entry(edge.from.stage_id.as_str())
                .or_default()
                .push(edge.to.stage_id.as_str());
        }
        Self {
            order: channel.stage_ids(),
            edges,
        }
    }

    /// Every distinct cycle reachable by depth-first search from each stage
    /// in declaration order. A cycle is reported as its path with the
    /// repeated stage appended.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut visited = HashSet::new();
        let mut cycles = Vec::new();
        let mut seen = HashSet::new();

        for start in &self.order {
            if !visited.contains(start) {
                self.walk_from(*start, &mut visited, &mut cycles, &mut seen);
            }
        }
        cycles
    }

    fn children(&self, node: &str) -> std::slice::Iter<'_, &'a str> {
        self.edges.get(node).map_or(&[][..], Vec::as_slice).iter()
    }

    /// Iterative DFS: each frame holds the stage on the path and the
    /// children still to visit, so chain length never touches the call stack.
    fn walk_from(
        &self,
        start: &'a str,
        visited: &mut HashSet<&'a str>,
        cycles: &mut Vec<Vec<String>>,
        seen: &mut HashSet<BTreeSet<&'a str>>,
    ) {
        let mut path: Vec<&'a str> = vec![start];
        let mut on_path: HashMap<&'a str, usize> = HashMap::from([(start, 0)]);
        let mut frames = vec![self.children(start)];

        while let Some(frame) = frames.last_mut() {
            match frame.next() {
                Some(&child) => {
                    if let Some(&pos) = on_path.get(child) {
                        let members: BTreeSet<&str> = path[pos..].iter().copied().collect();
                        if seen.insert(members) {
                            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                            cycle.push(child.to_string());
                            cycles.push(cycle);
                        }
                    } else if !visited.contains(child) {
                        on_path.insert(child, path.len());
                        path.push(child);
                        frames.push(self.children(child));
                    }
                }
                None => {
                    frames.pop();
                    if let Some(done) = path.pop() {
                        on_path.remove(done);
                        visited.insert(done);
                    }
                }
            }
        }
    }
}

pub struct CycleRule;

impl ChannelRule for CycleRule {
    fn name(&self) -> &'static str {
        "graph.cycle"
    }

    fn check(&self, channel: &Channel) -> Vec<ValidationIssue> {
        StageGraph::from_channel(channel)
            .detect_cycles()
            .into_iter()
            .map(|cycle| {
                let mut members: Vec<String> = cycle.clone();
                members.pop();
                ValidationIssue::warning(
                    self.name(),
                    format!("Potential circular dependency: {}", cycle.join(" -> ")),
                )
                .with_stages(members)
            })
            .collect()
    }
}

/// Validator runs the schema pass, then every semantic rule.
pub struct ChannelValidator {
    rules: Vec<Box<dyn ChannelRule>>,
}

impl ChannelValidator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(DuplicateStageRule),
                Box::new(DuplicateEdgeRule),
                Box::new(EdgeEndpointRule),
                Box::new(OrphanStageRule),
                Box::new(CycleRule),
            ],
        }
    }

    pub fn validate(&self, raw: &Value) -> ChannelValidation {
        let mut issues = check_schema(raw);
        if issues.iter().any(|i| i.severity == IssueSeverity::Error) {
            return ChannelValidation::from_issues(None, issues);
        }

        let mut channel: Channel = match serde_json::from_value(raw.clone()) {
            Ok(c) => c,
            Err(e) => {
                issues.push(ValidationIssue::error(
                    "schema.invalid",
                    format!("Channel document could not be read: {}", e),
                ));
                return ChannelValidation::from_issues(None, issues);
            }
        };

        if channel.channel_id.is_empty() {
            let content = compute_content_hash(raw).unwrap_or_default();
            channel.channel_id = derive_id("channel", &content);
            issues.push(
                ValidationIssue::warning(
                    "channel.id-defaulted",
                    format!("channelId missing; using derived id '{}'", channel.channel_id),
                )
                .at("channelId"),
            );
        }
        if channel.title.trim().is_empty() {
            channel.title = channel.channel_id.clone();
        }

        for rule in &self.rules {
            issues.extend(rule.check(&channel));
        }

        ChannelValidation::from_issues(Some(channel), issues)
    }
}

impl Default for ChannelValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a raw channel document with the default rule set.
pub fn validate_channel(raw: &Value) -> ChannelValidation {
    ChannelValidator::new().validate(raw)
}

/// Identifier syntax for channel, stage and edge ids.
pub fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    id.len() <= 128 && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

struct Schema {
    issues: Vec<ValidationIssue>,
}

impl Schema {
    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.issues
            .push(ValidationIssue::error("schema.invalid", message).at(path));
    }

    fn optional_string(&mut self, obj: &Map<String, Value>, key: &str, path: &str) {
        match obj.get(key) {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(_) => self.error(format!("{}.{}", path, key), format!("'{}' must be a string", key)),
        }
    }

    fn id(&mut self, obj: &Map<String, Value>, key: &str, path: &str, required: bool) {
        let at = format!("{}.{}", path, key).trim_start_matches('.').to_string();
        match obj.get(key) {
            None | Some(Value::Null) if !required => {}
            None | Some(Value::Null) => self.error(at, format!("'{}' is required", key)),
            Some(Value::String(s)) if is_valid_id(s) => {}
            Some(Value::String(s)) => self.error(at, format!("'{}' is not a valid identifier", s)),
            Some(_) => self.error(at, format!("'{}' must be a string", key)),
        }
    }

    fn object<'v>(&mut self, v: Option<&'v Value>, path: &str) -> Option<&'v Map<String, Value>> {
        match v {
            None | Some(Value::Null) => None,
            Some(Value::Object(m)) => Some(m),
            Some(_) => {
                self.error(path, "must be an object");
                None
            }
        }
    }

    fn root(&mut self, doc: &Map<String, Value>) {
        self.optional_string(doc, "version", "");
        self.optional_string(doc, "title", "");
        self.id(doc, "channelId", "", false);

        if let Some(runtime) = self.object(doc.get("runtime"), "runtime") {
            match runtime.get("target") {
                None | Some(Value::Null) => {}
                Some(Value::String(t)) if t == "onprem" || t == "cloud" => {}
                Some(_) => self.error("runtime.target", "target must be 'onprem' or 'cloud'"),
            }
        }

        if let Some(security) = self.object(doc.get("security"), "security") {
            for (k, v) in security {
                if !v.is_boolean() {
                    self.error(format!("security.{}", k), "security flags must be booleans");
                }
            }
        }

        if let Some(docs) = self.object(doc.get("documentation"), "documentation") {
            for key in ["summary", "owner", "notes"] {
                self.optional_string(docs, key, "documentation");
            }
        }

        match doc.get("stages") {
            Some(Value::Array(stages)) => {
                for (i, stage) in stages.iter().enumerate() {
                    self.stage(stage, &format!("stages[{}]", i));
                }
            }
            Some(_) => self.error("stages", "'stages' must be an array"),
            None => self.error("stages", "'stages' is required"),
        }

        match doc.get("edges") {
            None | Some(Value::Null) => {}
            Some(Value::Array(edges)) => {
                for (i, edge) in edges.iter().enumerate() {
                    self.edge(edge, &format!("edges[{}]", i));
                }
            }
            Some(_) => self.error("edges", "'edges' must be an array"),
        }
    }

    fn stage(&mut self, stage: &Value, path: &str) {
        let Value::Object(stage) = stage else {
            self.error(path, "stage must be an object");
            return;
        };
        self.id(stage, "id", path, true);
        self.optional_string(stage, "title", path);
        self.optional_string(stage, "nexonVersion", path);
        match stage.get("nexonId") {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            _ => self.error(format!("{}.nexonId", path), "'nexonId' is required"),
        }

        if let Some(position) = self.object(stage.get("position"), &format!("{}.position", path)) {
            for axis in ["x", "y"] {
                if !position.get(axis).map_or(false, Value::is_number) {
                    self.error(format!("{}.position.{}", path, axis), "coordinate must be a number");
                }
            }
        }

        let params_path = format!("{}.params", path);
        if let Some(params) = self.object(stage.get("params"), &params_path) {
            for (k, v) in params {
                self.param(v, &format!("{}.{}", params_path, k));
            }
        }
    }

    fn param(&mut self, v: &Value, path: &str) {
        match v {
            Value::Object(map) if map.contains_key(SECRET_KEY) || map.contains_key(EXPR_KEY) => {
                self.token(map, path)
            }
            Value::Object(map) => {
                for (k, child) in map {
                    self.param(child, &format!("{}.{}", path, k));
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    self.param(child, &format!("{}[{}]", path, i));
                }
            }
            _ => {}
        }
    }

    fn token(&mut self, map: &Map<String, Value>, path: &str) {
        if map.len() != 1 {
            self.error(path, "a $secret or $expr token must be the only key of its object");
            return;
        }
        if let Some(r) = map.get(SECRET_KEY) {
            match r {
                Value::String(s) if !s.trim().is_empty() => {}
                _ => self.error(path, "$secret must be a non-empty reference string"),
            }
        }
        if let Some(e) = map.get(EXPR_KEY) {
            match e {
                Value::String(src) => {
                    if let Err(err) = expression::parse(src) {
                        self.error(path, format!("invalid expression: {}", err));
                    }
                }
                _ => self.error(path, "$expr must be an expression string"),
            }
        }
    }

    fn edge(&mut self, edge: &Value, path: &str) {
        let Value::Object(edge) = edge else {
            self.error(path, "edge must be an object");
            return;
        };
        self.id(edge, "id", path, true);

        let from_path = format!("{}.from", path);
        match self.object(edge.get("from"), &from_path) {
            Some(from) => {
                self.id(from, "stageId", &from_path, true);
                match from.get("outlet") {
                    None | Some(Value::Null) | Some(Value::String(_)) => {}
                    Some(v) if v.is_u64() && v.as_u64().map_or(false, |n| n <= u32::MAX as u64) => {}
                    Some(_) => self.error(
                        format!("{}.outlet", from_path),
                        "outlet must be a port index or an outlet name",
                    ),
                }
            }
            None => self.error(from_path.clone(), "'from' is required"),
        }

        let to_path = format!("{}.to", path);
        match self.object(edge.get("to"), &to_path) {
            Some(to) => {
                self.id(to, "stageId", &to_path, true);
                match to.get("inlet") {
                    None | Some(Value::Null) => {}
                    Some(v) if v.is_u64() && v.as_u64().map_or(false, |n| n <= u32::MAX as u64) => {}
                    Some(_) => self.error(format!("{}.inlet", to_path), "inlet must be a port index"),
                }
            }
            None => self.error(to_path.clone(), "'to' is required"),
        }
    }
}

fn check_schema(raw: &Value) -> Vec<ValidationIssue> {
    let Value::Object(doc) = raw else {
        return vec![ValidationIssue::error(
            "schema.invalid",
            "Channel document must be a JSON object",
        )];
    };
    let mut schema = Schema { issues: vec![] };
    schema.root(doc);
    schema.issues
}

/// Group warning messages by the stage they name, for result summaries.
pub fn warnings_by_stage(validation: &ChannelValidation) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for w in &validation.warnings {
        for id in &w.stage_ids {
            out.entry(id.clone()).or_default().push(w.message.clone());
        }
    }
    out
}
