//! Template System - Nexon contracts, sources and cache
//!
//! A Nexon is a versioned, parameterized template for one or more flow
//! nodes. The resolver looks in the cache first, then each configured source
//! in order (local directory, then remote registry).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{classify_token, RuntimeTarget, Token};
use crate::config::CompilerConfig;
use crate::expression::{self, Namespace, Piece, Segment};
use crate::hashing::compute_content_hash;
use crate::sources::{FetchedTemplate, LocalSource, RemoteSource, TemplateSource};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {id}@{version}")]
    NotFound { id: String, version: String },

    #[error("Template {key} is invalid: {}", .errors.join("; "))]
    Validation { key: String, errors: Vec<String> },

    #[error("Template {key} checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Fetch from {source_kind} failed: {message}")]
    Fetch {
        source_kind: SourceKind,
        message: String,
    },

    #[error("Template parse error in {locator}: {message}")]
    Parse { locator: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NexonManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, ParameterDefinition>>,
    /// Named continuation outlets, in port order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outlets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<Compatibility>,
}

impl NexonManifest {
    pub fn parameter_defs(&self) -> Option<&BTreeMap<String, ParameterDefinition>> {
        self.parameters.as_ref()
    }

    pub fn outlet_index(&self, name: &str) -> Option<usize> {
        self.outlets.iter().position(|o| o == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub network: NetworkCapabilities,
    #[serde(default)]
    pub filesystem: bool,
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkCapabilities {
    #[serde(default)]
    pub http_out: bool,
    #[serde(default)]
    pub tcp_out: bool,
    #[serde(default)]
    pub udp_out: bool,
    #[serde(default)]
    pub http_in: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Secret,
    Any,
}

impl Default for ParamType {
    fn default() -> Self {
        Self::Any
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDefinition {
    #[serde(default, rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ParamConstraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compatibility {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<RuntimeTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_engine_version: Option<String>,
}

/// One node in a Nexon template. Everything beyond `id`, `type` and `wires`
/// is a placeholder-bearing property bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub node_type: String,
    /// Intra-template wiring by template node id, one list per output port.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wires: Vec<Vec<String>>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Remote,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Local => write!(f, "local"),
            SourceKind::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSourceInfo {
    pub kind: SourceKind,
    pub locator: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NexonTemplate {
    pub manifest: NexonManifest,
    pub template: Vec<NodeTemplate>,
    pub source: TemplateSourceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ttl_secs: u64,
}

impl NexonTemplate {
    pub fn key(&self) -> String {
        cache_key(&self.manifest.id, Some(&self.manifest.version))
    }
}

/// Wire/disk form of a Nexon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDocument {
    pub manifest: NexonManifest,
    #[serde(default)]
    pub template: Vec<NodeTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Checksum over the canonical `{manifest, template}` content.
pub fn compute_checksum(
    manifest: &NexonManifest,
    template: &[NodeTemplate],
) -> Result<String, serde_json::Error> {
    compute_content_hash(&serde_json::json!({
        "manifest": manifest,
        "template": template,
    }))
}

pub fn cache_key(id: &str, version: Option<&str>) -> String {
    format!("{}@{}", id, version.unwrap_or("latest"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Check manifest completeness and template well-formedness.
pub fn validate_template(manifest: &NexonManifest, template: &[NodeTemplate]) -> TemplateValidation {
    let mut errors = vec![];
    let mut warnings = vec![];

    if manifest.id.trim().is_empty() {
        errors.push("manifest.id is missing".to_string());
    }
    if manifest.version.trim().is_empty() {
        errors.push("manifest.version is missing".to_string());
    } else if semver::Version::parse(&manifest.version).is_err() {
        errors.push(format!(
            "manifest.version '{}' is not a semantic version",
            manifest.version
        ));
    }
    if manifest.title.trim().is_empty() {
        errors.push("manifest.title is missing".to_string());
    }
    if manifest.capabilities.is_none() {
        errors.push("manifest.capabilities is missing".to_string());
    }

    match &manifest.parameters {
        None => errors.push("manifest.parameters is missing".to_string()),
        Some(params) => {
            if params.is_empty() {
                warnings.push("manifest declares no parameters".to_string());
            }
            for (name, def) in params {
                check_parameter_definition(name, def, &mut errors);
            }
        }
    }

    if let Some(compat) = &manifest.compatibility {
        if let Some(v) = &compat.min_engine_version {
            if semver::Version::parse(v).is_err() {
                errors.push(format!(
                    "compatibility.minEngineVersion '{}' is not a semantic version",
                    v
                ));
            }
        }
    }

    if template.is_empty() {
        errors.push("template contains no nodes".to_string());
    }

    let mut seen = HashSet::new();
    for (i, node) in template.iter().enumerate() {
        if node.id.trim().is_empty() {
            errors.push(format!("template[{}] has no id", i));
        } else if !seen.insert(node.id.as_str()) {
            errors.push(format!("template[{}] duplicates node id '{}'", i, node.id));
        }
        if node.node_type.trim().is_empty() {
            errors.push(format!("template[{}] has no type", i));
        }
    }

    for node in template {
        for target in node.wires.iter().flatten() {
            if !seen.contains(target.as_str()) {
                errors.push(format!(
                    "template node '{}' wires to unknown node '{}'",
                    node.id, target
                ));
            }
        }
    }

    let declared: HashSet<&str> = manifest
        .parameters
        .iter()
        .flat_map(|p| p.keys().map(String::as_str))
        .collect();
    let mut undeclared = BTreeMap::new();
    for node in template {
        for v in node.properties.values() {
            collect_param_refs(v, &mut |name: &str| {
                if !declared.contains(name) {
                    undeclared.entry(name.to_string()).or_insert_with(|| node.id.clone());
                }
            });
        }
    }
    for (name, node_id) in undeclared {
        warnings.push(format!(
            "template node '{}' references undeclared parameter '{}'",
            node_id, name
        ));
    }

    TemplateValidation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn check_parameter_definition(name: &str, def: &ParameterDefinition, errors: &mut Vec<String>) {
    let Some(c) = &def.validation else {
        return;
    };
    if let (Some(min), Some(max)) = (c.min, c.max) {
        if min > max {
            errors.push(format!("parameter '{}': min {} exceeds max {}", name, min, max));
        }
    }
    if let (Some(min), Some(max)) = (c.min_length, c.max_length) {
        if min > max {
            errors.push(format!(
                "parameter '{}': minLength {} exceeds maxLength {}",
                name, min, max
            ));
        }
    }
    if let Some(p) = &c.pattern {
        if let Err(e) = regex::Regex::new(p) {
            errors.push(format!("parameter '{}': invalid pattern: {}", name, e));
        }
    }
}

fn visit_param_expr(src: &str, found: &mut dyn FnMut(&str)) {
    if let Ok(expr) = expression::parse(src) {
        for path in expression::referenced_paths(&expr) {
            if path.root == Namespace::Params {
                if let Some(Segment::Key(k)) = path.segments.first() {
                    found(k);
                }
            }
        }
    }
}

/// Report the first segment of every `params.*` path used in a placeholder tree.
fn collect_param_refs(v: &Value, found: &mut dyn FnMut(&str)) {
    match v {
        Value::String(s) if expression::has_interpolation(s) => {
            if let Ok(pieces) = expression::split_interpolations(s) {
                for piece in pieces {
                    if let Piece::Expr(src) = piece {
                        visit_param_expr(src, found);
                    }
                }
            }
        }
        Value::Object(map) => match classify_token(map) {
            Some(Token::Expr(src)) => visit_param_expr(src, found),
            Some(Token::Secret(_)) => {}
            None => {
                for child in map.values() {
                    collect_param_refs(child, found);
                }
            }
        },
        Value::Array(items) => {
            for child in items {
                collect_param_refs(child, found);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub force_refresh: bool,
    pub timeout: Option<Duration>,
    pub auth_token: Option<String>,
}

struct CacheEntry {
    template: Arc<NexonTemplate>,
    inserted: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_stale(&self) -> bool {
        self.inserted.elapsed() >= self.ttl
    }
}

/// Process-wide template cache keyed by `id@version`.
///
/// Safe for concurrent use. Entries are replaced whole; readers holding an
/// `Arc` from a previous `get` are unaffected by later `put`s.
pub struct TemplateCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
}

impl TemplateCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fresh entry for `key`, evicting it if stale.
    pub fn get(&self, key: &str) -> Option<Arc<NexonTemplate>> {
        let stale = match self.entries.get(key) {
            Some(entry) if !entry.is_stale() => return Some(entry.template.clone()),
            Some(_) => true,
            None => false,
        };
        if stale {
            self.entries.remove_if(key, |_, e| e.is_stale());
        }
        None
    }

    pub fn put(&self, key: impl Into<String>, template: Arc<NexonTemplate>) {
        self.put_with_ttl(key, template, self.default_ttl);
    }

    pub fn put_with_ttl(&self, key: impl Into<String>, template: Arc<NexonTemplate>, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                template,
                inserted: Instant::now(),
                ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::config::DEFAULT_TEMPLATE_TTL_SECS))
    }
}

/// Cache-first template lookup over an ordered list of sources.
pub struct TemplateResolver {
    cache: Arc<TemplateCache>,
    sources: Vec<Box<dyn TemplateSource>>,
    default_timeout: Duration,
}

impl TemplateResolver {
    pub fn new(cache: Arc<TemplateCache>, sources: Vec<Box<dyn TemplateSource>>) -> Self {
        Self {
            cache,
            sources,
            default_timeout: Duration::from_secs(crate::config::DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Local source (if configured) followed by remote source (if configured).
    pub fn from_config(config: &CompilerConfig, cache: Arc<TemplateCache>) -> Self {
        let mut sources: Vec<Box<dyn TemplateSource>> = vec![];
        if let Some(dir) = &config.nexon_dir {
            sources.push(Box::new(LocalSource::new(dir.clone())));
        }
        if let Some(url) = &config.nexon_remote_url {
            sources.push(Box::new(RemoteSource::new(
                url.clone(),
                config.nexon_remote_token.clone(),
            )));
        }
        Self::new(cache, sources).with_timeout(config.fetch_timeout)
    }

    pub fn cache(&self) -> &Arc<TemplateCache> {
        &self.cache
    }

    pub async fn resolve(
        &self,
        id: &str,
        version: Option<&str>,
        options: &FetchOptions,
    ) -> Result<Arc<NexonTemplate>, TemplateError> {
        let key = cache_key(id, version);

        if !options.force_refresh {
            if let Some(hit) = self.cache.get(&key) {
                debug!(template = %key, "template cache hit");
                return Ok(hit);
            }
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let options = FetchOptions {
            timeout: Some(timeout),
            ..options.clone()
        };

        for source in &self.sources {
            let fetched = match tokio::time::timeout(timeout, source.fetch(id, version, &options)).await {
                Err(_) => {
                    warn!(template = %key, source = %source.kind(), ?timeout, "template fetch timed out");
                    continue;
                }
                Ok(Err(TemplateError::Fetch { source_kind, message })) => {
                    warn!(template = %key, source = %source_kind, %message, "template fetch failed");
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(None)) => continue,
                Ok(Ok(Some(fetched))) => fetched,
            };

            let template = Arc::new(self.admit(&key, version, source.kind(), fetched)?);
            self.cache.put(key.clone(), template.clone());
            if version.is_none() {
                self.cache.put(template.key(), template.clone());
            }
            info!(
                template = %key,
                source = %source.kind(),
                version = %template.manifest.version,
                "template resolved"
            );
            return Ok(template);
        }

        Err(TemplateError::NotFound {
            id: id.to_string(),
            version: version.unwrap_or("latest").to_string(),
        })
    }

    /// Checksum, validate and stamp a fetched document.
    fn admit(
        &self,
        key: &str,
        version: Option<&str>,
        kind: SourceKind,
        fetched: FetchedTemplate,
    ) -> Result<NexonTemplate, TemplateError> {
        let FetchedTemplate { document, locator } = fetched;

        let checksum = compute_checksum(&document.manifest, &document.template).map_err(|e| {
            TemplateError::Parse {
                locator: locator.clone(),
                message: e.to_string(),
            }
        })?;
        if let Some(expected) = &document.checksum {
            if !expected.eq_ignore_ascii_case(&checksum) {
                return Err(TemplateError::ChecksumMismatch {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }

        let mut report = validate_template(&document.manifest, &document.template);
        let requested_id = key.split('@').next().unwrap_or_default();
        if !document.manifest.id.is_empty() && document.manifest.id != requested_id {
            report.errors.push(format!(
                "manifest.id '{}' does not match requested '{}'",
                document.manifest.id, requested_id
            ));
        }
        if let Some(v) = version {
            if !document.manifest.version.is_empty() && document.manifest.version != v {
                report.errors.push(format!(
                    "manifest.version '{}' does not match requested '{}'",
                    document.manifest.version, v
                ));
            }
        }
        if !report.errors.is_empty() {
            return Err(TemplateError::Validation {
                key: key.to_string(),
                errors: report.errors,
            });
        }
        for w in &report.warnings {
            debug!(template = %key, warning = %w, "template warning");
        }

        Ok(NexonTemplate {
            manifest: document.manifest,
            template: document.template,
            source: TemplateSourceInfo {
                kind,
                locator,
                checksum,
            },
            cached_at: Some(Utc::now()),
            ttl_secs: self.cache.default_ttl().as_secs(),
        })
    }
}
