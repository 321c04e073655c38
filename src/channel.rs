//! Channel Document Model
//!
//! A Channel is the user-authored flow graph. It arrives as untyped JSON,
//! is checked by [`crate::validation`], and is immutable from then on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Key marking an object as an external secret reference.
pub const SECRET_KEY: &str = "$secret";
/// Key marking an object as a compile-time expression.
pub const EXPR_KEY: &str = "$expr";

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub security: SecurityFlags,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<Documentation>,
}

impl Channel {
    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id.as_str()).collect()
    }

    /// Non-secret metadata exposed to the runtime environment and to `env.*`
    /// expressions.
    pub fn metadata_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("GJ_CHANNEL_ID".to_string(), self.channel_id.clone());
        env.insert("GJ_CHANNEL_TITLE".to_string(), self.title.clone());
        env.insert("GJ_CHANNEL_VERSION".to_string(), self.version.clone());
        env.insert("GJ_RUNTIME_TARGET".to_string(), self.runtime.target.to_string());
        env
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default)]
    pub target: RuntimeTarget,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeTarget {
    #[default]
    Onprem,
    Cloud,
}

impl fmt::Display for RuntimeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeTarget::Onprem => write!(f, "onprem"),
            RuntimeTarget::Cloud => write!(f, "cloud"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Production,
    Development,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Production => write!(f, "production"),
            BuildMode::Development => write!(f, "development"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityFlags {
    #[serde(default)]
    pub allow_internet_http_out: bool,
    #[serde(default)]
    pub allow_internet_tcp_out: bool,
    #[serde(default)]
    pub allow_internet_udp_out: bool,
    #[serde(default)]
    pub allow_http_in_from_internet: bool,
}

impl SecurityFlags {
    pub fn any_egress(&self) -> bool {
        self.allow_internet_http_out || self.allow_internet_tcp_out || self.allow_internet_udp_out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Documentation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Documentation {
    /// Total length of the trimmed documentation text.
    pub fn text_len(&self) -> usize {
        [&self.summary, &self.notes]
            .iter()
            .filter_map(|s| s.as_deref())
            .map(|s| s.trim().len())
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub nexon_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nexon_version: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl Stage {
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from: EdgeSource,
    pub to: EdgeTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSource {
    pub stage_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlet: Option<OutletRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeTarget {
    pub stage_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inlet: Option<u32>,
}

/// A source port: zero-based index or a named continuation outlet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OutletRef {
    Index(u32),
    Name(String),
}

/// Opaque pointer to an externally stored secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub reference: String,
}

/// Unevaluated source of a compile-time expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprToken {
    pub expr: String,
}

/// A stage parameter value.
///
/// Objects with the single key `$secret` or `$expr` (and a string value) are
/// tokens; every other object is a plain map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ParamValue {
    Literal(Value),
    SecretRef(SecretRef),
    Expression(ExprToken),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

/// Token classification shared by parameters and template placeholder trees.
pub enum Token<'a> {
    Secret(&'a str),
    Expr(&'a str),
}

/// Classify a JSON object as a token, if it is one.
pub fn classify_token(map: &Map<String, Value>) -> Option<Token<'_>> {
    if map.len() != 1 {
        return None;
    }
    match map.iter().next() {
        Some((k, Value::String(s))) if k == SECRET_KEY => Some(Token::Secret(s)),
        Some((k, Value::String(s))) if k == EXPR_KEY => Some(Token::Expr(s)),
        _ => None,
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => {
                match classify_token(&map) {
                    Some(Token::Secret(r)) => {
                        return ParamValue::SecretRef(SecretRef { reference: r.to_string() })
                    }
                    Some(Token::Expr(e)) => {
                        return ParamValue::Expression(ExprToken { expr: e.to_string() })
                    }
                    None => {}
                }
                ParamValue::Map(map.into_iter().map(|(k, v)| (k, ParamValue::from(v))).collect())
            }
            Value::Array(items) => ParamValue::List(items.into_iter().map(ParamValue::from).collect()),
            scalar => ParamValue::Literal(scalar),
        }
    }
}

impl From<ParamValue> for Value {
    fn from(value: ParamValue) -> Self {
        match value {
            ParamValue::Literal(v) => v,
            ParamValue::SecretRef(s) => {
                let mut map = Map::new();
                map.insert(SECRET_KEY.to_string(), Value::String(s.reference));
                Value::Object(map)
            }
            ParamValue::Expression(e) => {
                let mut map = Map::new();
                map.insert(EXPR_KEY.to_string(), Value::String(e.expr));
                Value::Object(map)
            }
            ParamValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            ParamValue::Map(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl ParamValue {
    /// Collect every secret reference below this value with its dotted path.
    /// List positions appear as numeric path segments.
    pub fn collect_secrets<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a SecretRef)>) {
        match self {
            ParamValue::SecretRef(s) => out.push((path.to_string(), s)),
            ParamValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_secrets(&format!("{}.{}", path, i), out);
                }
            }
            ParamValue::Map(map) => {
                for (k, v) in map {
                    v.collect_secrets(&format!("{}.{}", path, k), out);
                }
            }
            ParamValue::Literal(_) | ParamValue::Expression(_) => {}
        }
    }

    pub fn contains_secret(&self) -> bool {
        let mut found = vec![];
        self.collect_secrets("", &mut found);
        !found.is_empty()
    }
}
