//! Substitution Engine
//!
//! Resolves a template placeholder tree against a per-stage context.
//! `$expr` tokens and `{{...}}` spans are evaluated; `$secret` tokens are
//! never resolved to plaintext, only to `${ENV}` placeholders filled in at
//! deploy time.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::channel::{classify_token, ParamValue, Token};
use crate::expression::{self, ExpressionError, Namespace, Piece, Scope};
use crate::templates::{ParamType, ParameterDefinition};

/// Environment variable prefix for deploy-time secrets.
pub const SECRET_ENV_PREFIX: &str = "GJ_SECRET_";
pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SubstitutionError {
    #[error("missing required parameter '{name}'")]
    MissingRequired { name: String },

    #[error("parameter '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("parameter '{name}': {message}")]
    Constraint { name: String, message: String },

    #[error("{path}: {message}")]
    Expression { path: String, message: String },

    #[error("{path}: secret reference is not registered")]
    UnregisteredSecret { path: String },

    #[error("{path}: nesting exceeds {limit} levels")]
    TooDeep { path: String, limit: usize },

    #[error("{path}: value re-entered while resolving")]
    Cycle { path: String },
}

impl SubstitutionError {
    fn expression(path: &str, err: ExpressionError) -> Self {
        SubstitutionError::Expression {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

/// Everything an expression may read while rendering one stage.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    pub parameters: Value,
    pub stage: Value,
    pub channel: Value,
    pub runtime: Value,
    pub env: Value,
    /// Secret reference → environment variable name.
    pub secret_env: BTreeMap<String, String>,
}

impl Scope for SubstitutionContext {
    fn namespace(&self, ns: Namespace) -> Option<&Value> {
        match ns {
            Namespace::Params => Some(&self.parameters),
            Namespace::Stage => Some(&self.stage),
            Namespace::Channel => Some(&self.channel),
            Namespace::Runtime => Some(&self.runtime),
            Namespace::Env => Some(&self.env),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubstitutionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub errors: Vec<SubstitutionError>,
    pub warnings: Vec<String>,
}

impl SubstitutionOutcome {
    fn finish(value: Value, errors: Vec<SubstitutionError>, warnings: Vec<String>) -> Self {
        let success = errors.is_empty();
        Self {
            success,
            value: success.then_some(value),
            errors,
            warnings,
        }
    }
}

pub fn secret_placeholder(env_var: &str) -> String {
    format!("${{{}}}", env_var)
}

pub fn is_secret_placeholder(s: &str) -> bool {
    s.strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map_or(false, |name| {
            name.starts_with(SECRET_ENV_PREFIX)
                && name.len() > SECRET_ENV_PREFIX.len()
                && name
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        })
}

/// Turn interpolated text back into its typed form when it looks typed.
pub fn coerce_interpolated(s: String) -> Value {
    match s.as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    let trimmed = s.trim_start();
    let looks_typed = trimmed.starts_with('{')
        || trimmed.starts_with('[')
        || trimmed.starts_with('-')
        || trimmed.chars().next().map_or(false, |c| c.is_ascii_digit());
    if looks_typed {
        if let Ok(v) = serde_json::from_str::<Value>(&s) {
            if v.is_number() || v.is_object() || v.is_array() {
                return v;
            }
        }
    }
    Value::String(s)
}

fn render_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Addresses of the nodes on the current resolution path.
///
/// Borrowed trees cannot move during a walk, so a node's address is a
/// stable identity for the duration of one `substitute` call.
#[derive(Default)]
struct IdentityIndex {
    active: HashSet<usize>,
}

impl IdentityIndex {
    fn enter(&mut self, v: &Value) -> bool {
        self.active.insert(v as *const Value as usize)
    }

    fn leave(&mut self, v: &Value) {
        self.active.remove(&(v as *const Value as usize));
    }
}

struct Walk<'a> {
    ctx: &'a SubstitutionContext,
    max_depth: usize,
    index: IdentityIndex,
    errors: Vec<SubstitutionError>,
    warnings: Vec<String>,
}

impl<'a> Walk<'a> {
    fn resolve(&mut self, v: &Value, path: &str, depth: usize) -> Value {
        if depth > self.max_depth {
            self.errors.push(SubstitutionError::TooDeep {
                path: path.to_string(),
                limit: self.max_depth,
            });
            return Value::Null;
        }
        if !self.index.enter(v) {
            self.errors.push(SubstitutionError::Cycle {
                path: path.to_string(),
            });
            return Value::Null;
        }

        let out = match v {
            Value::Object(map) => match classify_token(map) {
                Some(Token::Secret(reference)) => self.secret(reference, v, path),
                Some(Token::Expr(src)) => self.expression(src, path),
                None => {
                    let mut out = Map::new();
                    for (k, child) in map {
                        let child_path = format!("{}.{}", path, k);
                        out.insert(k.clone(), self.resolve(child, &child_path, depth + 1));
                    }
                    Value::Object(out)
                }
            },
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.resolve(item, &format!("{}[{}]", path, i), depth + 1))
                    .collect(),
            ),
            Value::String(s) if expression::has_interpolation(s) => self.interpolate(s, path),
            literal => literal.clone(),
        };

        self.index.leave(v);
        out
    }

    fn secret(&mut self, reference: &str, token: &Value, path: &str) -> Value {
        match self.ctx.secret_env.get(reference) {
            Some(env) => {
                self.warnings
                    .push(format!("{}: secret deferred to deploy time as {}", path, env));
                Value::String(secret_placeholder(env))
            }
            None => {
                self.warnings
                    .push(format!("{}: secret reference left unresolved", path));
                token.clone()
            }
        }
    }

    fn expression(&mut self, src: &str, path: &str) -> Value {
        match expression::parse(src).and_then(|e| expression::evaluate(&e, self.ctx)) {
            Ok(v) => v,
            Err(e) => {
                self.errors.push(SubstitutionError::expression(path, e));
                Value::Null
            }
        }
    }

    fn interpolate(&mut self, s: &str, path: &str) -> Value {
        let pieces = match expression::split_interpolations(s) {
            Ok(p) => p,
            Err(e) => {
                self.errors.push(SubstitutionError::expression(path, e));
                return Value::Null;
            }
        };

        let mut out = String::with_capacity(s.len());
        for piece in pieces {
            match piece {
                Piece::Text(t) => out.push_str(t),
                Piece::Expr(src) => {
                    let v = self.expression(src, path);
                    if v.is_null() {
                        self.warnings
                            .push(format!("{}: '{{{{{}}}}}' resolved to nothing", path, src));
                    }
                    out.push_str(&render_text(&v));
                }
            }
        }
        coerce_interpolated(out)
    }
}

pub struct SubstitutionEngine {
    max_depth: usize,
}

impl SubstitutionEngine {
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    fn walk<'a>(&self, ctx: &'a SubstitutionContext) -> Walk<'a> {
        Walk {
            ctx,
            max_depth: self.max_depth,
            index: IdentityIndex::default(),
            errors: vec![],
            warnings: vec![],
        }
    }

    /// Resolve `tree` against `ctx`, validating `ctx.parameters` first when
    /// definitions are given.
    pub fn substitute(
        &self,
        tree: &Value,
        ctx: &SubstitutionContext,
        defs: Option<&BTreeMap<String, ParameterDefinition>>,
    ) -> SubstitutionOutcome {
        let mut walk = self.walk(ctx);
        if let Some(defs) = defs {
            walk.errors.extend(validate_parameters(&ctx.parameters, defs));
        }
        let value = walk.resolve(tree, "$", 0);
        SubstitutionOutcome::finish(value, walk.errors, walk.warnings)
    }

    /// Resolve a stage's declared parameters into plain JSON.
    ///
    /// Expressions are evaluated against `ctx` (whose `parameters` are not
    /// yet populated), secrets become `${ENV}` placeholders.
    pub fn resolve_params(
        &self,
        params: &BTreeMap<String, ParamValue>,
        ctx: &SubstitutionContext,
    ) -> SubstitutionOutcome {
        let mut walk = self.walk(ctx);
        let mut out = Map::new();
        for (name, value) in params {
            let v = self.resolve_param(value, name, ctx, &mut walk, 0);
            out.insert(name.clone(), v);
        }
        SubstitutionOutcome::finish(Value::Object(out), walk.errors, walk.warnings)
    }

    fn resolve_param(
        &self,
        value: &ParamValue,
        path: &str,
        ctx: &SubstitutionContext,
        walk: &mut Walk<'_>,
        depth: usize,
    ) -> Value {
        if depth > self.max_depth {
            walk.errors.push(SubstitutionError::TooDeep {
                path: path.to_string(),
                limit: self.max_depth,
            });
            return Value::Null;
        }
        match value {
            ParamValue::Literal(v) => v.clone(),
            ParamValue::SecretRef(s) => match ctx.secret_env.get(&s.reference) {
                Some(env) => Value::String(secret_placeholder(env)),
                None => {
                    walk.errors.push(SubstitutionError::UnregisteredSecret {
                        path: path.to_string(),
                    });
                    Value::Null
                }
            },
            ParamValue::Expression(e) => walk.expression(&e.expr, path),
            ParamValue::List(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        self.resolve_param(item, &format!("{}[{}]", path, i), ctx, walk, depth + 1)
                    })
                    .collect(),
            ),
            ParamValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, item)| {
                        let child = format!("{}.{}", path, k);
                        (k.clone(), self.resolve_param(item, &child, ctx, walk, depth + 1))
                    })
                    .collect(),
            ),
        }
    }
}

impl Default for SubstitutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Fill absent parameters from their definitions' defaults.
pub fn apply_defaults(values: &mut Value, defs: &BTreeMap<String, ParameterDefinition>) {
    let Value::Object(map) = values else {
        return;
    };
    for (name, def) in defs {
        let missing = map.get(name).map_or(true, Value::is_null);
        if missing {
            if let Some(default) = &def.default {
                map.insert(name.clone(), default.clone());
            }
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &ParamType, v: &Value) -> bool {
    match expected {
        ParamType::Any => true,
        ParamType::String | ParamType::Secret => v.is_string(),
        ParamType::Number => v.is_number(),
        ParamType::Integer => {
            v.is_i64() || v.is_u64() || v.as_f64().map_or(false, |f| f.fract() == 0.0)
        }
        ParamType::Boolean => v.is_boolean(),
        ParamType::Object => v.is_object(),
        ParamType::Array => v.is_array(),
    }
}

fn expected_name(t: &ParamType) -> &'static str {
    match t {
        ParamType::String => "string",
        ParamType::Number => "number",
        ParamType::Integer => "integer",
        ParamType::Boolean => "boolean",
        ParamType::Object => "object",
        ParamType::Array => "array",
        ParamType::Secret => "secret reference",
        ParamType::Any => "any",
    }
}

/// Check required-ness, type and constraints of resolved parameter values.
pub fn validate_parameters(
    values: &Value,
    defs: &BTreeMap<String, ParameterDefinition>,
) -> Vec<SubstitutionError> {
    let mut errors = vec![];

    for (name, def) in defs {
        let value = values.get(name).filter(|v| !v.is_null());
        let Some(value) = value else {
            if def.required {
                errors.push(SubstitutionError::MissingRequired { name: name.clone() });
            }
            continue;
        };

        if !type_matches(&def.param_type, value) {
            errors.push(SubstitutionError::TypeMismatch {
                name: name.clone(),
                expected: expected_name(&def.param_type).to_string(),
                actual: type_name(value).to_string(),
            });
            continue;
        }

        if def.param_type == ParamType::Secret {
            if let Some(s) = value.as_str() {
                if !is_secret_placeholder(s) {
                    errors.push(SubstitutionError::TypeMismatch {
                        name: name.clone(),
                        expected: "secret reference".to_string(),
                        actual: "plain string".to_string(),
                    });
                    continue;
                }
            }
        }

        if let Some(c) = &def.validation {
            let constraint = |message: String| SubstitutionError::Constraint {
                name: name.clone(),
                message,
            };

            if let Some(n) = value.as_f64() {
                if let Some(min) = c.min {
                    if n < min {
                        errors.push(constraint(format!("{} is below minimum {}", n, min)));
                    }
                }
                if let Some(max) = c.max {
                    if n > max {
                        errors.push(constraint(format!("{} is above maximum {}", n, max)));
                    }
                }
            }

            let length = match value {
                Value::String(s) => Some(s.chars().count()),
                Value::Array(a) => Some(a.len()),
                _ => None,
            };
            if let Some(len) = length {
                if let Some(min) = c.min_length {
                    if len < min {
                        errors.push(constraint(format!("length {} is below minLength {}", len, min)));
                    }
                }
                if let Some(max) = c.max_length {
                    if len > max {
                        errors.push(constraint(format!("length {} is above maxLength {}", len, max)));
                    }
                }
            }

            if let (Some(pattern), Some(s)) = (&c.pattern, value.as_str()) {
                match Regex::new(pattern) {
                    Ok(re) if !re.is_match(s) => {
                        errors.push(constraint(format!("value does not match pattern '{}'", pattern)))
                    }
                    Ok(_) => {}
                    Err(e) => errors.push(constraint(format!("invalid pattern: {}", e))),
                }
            }

            if let Some(allowed) = &c.allowed {
                if !allowed.contains(value) {
                    errors.push(constraint(format!(
                        "{} is not one of {}",
                        value,
                        Value::Array(allowed.clone())
                    )));
                }
            }
        }
    }

    errors
}
