//! Expression Language
//!
//! A deliberately small grammar evaluated at compile time:
//!
//! ```text
//! expr    := or ( '?' expr ':' expr )?
//! or      := primary ( '||' primary )*
//! primary := STRING | NUMBER | 'true' | 'false' | 'null'
//!          | 'JSON' '.' 'stringify' '(' expr ')'
//!          | '(' expr ')'
//!          | path
//! path    := NAMESPACE ( '.' IDENT | '[' NUMBER ']' | '[' STRING ']' )*
//! ```
//!
//! Anything outside the grammar is rejected with an [`ExpressionError`].

use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at {0}")]
    UnterminatedString(usize),

    #[error("unexpected {found} at {pos}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        pos: usize,
    },

    #[error("unexpected end of expression, expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("unknown namespace '{0}' (expected params, stage, channel, runtime or env)")]
    UnknownNamespace(String),

    #[error("unsupported expression: {0}")]
    Unsupported(String),

    #[error("cannot stringify value: {0}")]
    Stringify(String),

    #[error("unterminated '{{{{' starting at {0}")]
    UnterminatedInterpolation(usize),

    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
}

/// Deepest expression tree `parse` will build.
pub const MAX_NESTING: usize = 64;

/// Root of a path lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Params,
    Stage,
    Channel,
    Runtime,
    Env,
}

impl Namespace {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "params" => Some(Namespace::Params),
            "stage" => Some(Namespace::Stage),
            "channel" => Some(Namespace::Channel),
            "runtime" => Some(Namespace::Runtime),
            "env" => Some(Namespace::Env),
            _ => None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Namespace::Params => "params",
            Namespace::Stage => "stage",
            Namespace::Channel => "channel",
            Namespace::Runtime => "runtime",
            Namespace::Env => "env",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathRef {
    pub root: Namespace,
    pub segments: Vec<Segment>,
}

impl fmt::Display for PathRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for seg in &self.segments {
            match seg {
                Segment::Key(k) => write!(f, ".{}", k)?,
                Segment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(PathRef),
    Or(Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Stringify(Box<Expr>),
}

/// Lookup surface for path evaluation.
pub trait Scope {
    fn namespace(&self, ns: Namespace) -> Option<&Value>;
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(Value),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    OrOr,
    Question,
    Colon,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Ident(s) => write!(f, "identifier '{}'", s),
            Tok::Str(_) => write!(f, "string"),
            Tok::Num(n) => write!(f, "number {}", n),
            Tok::Dot => write!(f, "'.'"),
            Tok::LBracket => write!(f, "'['"),
            Tok::RBracket => write!(f, "']'"),
            Tok::LParen => write!(f, "'('"),
            Tok::RParen => write!(f, "')'"),
            Tok::OrOr => write!(f, "'||'"),
            Tok::Question => write!(f, "'?'"),
            Tok::Colon => write!(f, "':'"),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(Tok, usize)>, ExpressionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = vec![];
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                out.push((Tok::Dot, i));
                i += 1;
            }
            '[' => {
                out.push((Tok::LBracket, i));
                i += 1;
            }
            ']' => {
                out.push((Tok::RBracket, i));
                i += 1;
            }
            '(' => {
                out.push((Tok::LParen, i));
                i += 1;
            }
            ')' => {
                out.push((Tok::RParen, i));
                i += 1;
            }
            '?' => {
                out.push((Tok::Question, i));
                i += 1;
            }
            ':' => {
                out.push((Tok::Colon, i));
                i += 1;
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    out.push((Tok::OrOr, i));
                    i += 2;
                } else {
                    return Err(ExpressionError::Unsupported(format!(
                        "operator '|' at {}",
                        i
                    )));
                }
            }
            '\'' | '"' => {
                let start = i;
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::UnterminatedString(start)),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&other) => s.push(other),
                                None => return Err(ExpressionError::UnterminatedString(start)),
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                out.push((Tok::Str(s), start));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).map_or(false, |d| d.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = serde_json::from_str::<Value>(&text)
                    .ok()
                    .filter(Value::is_number)
                    .ok_or(ExpressionError::UnexpectedChar { ch: c, pos: start })?;
                out.push((Tok::Num(num), start));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                out.push((Tok::Ident(chars[start..i].iter().collect()), start));
            }
            '&' | '=' | '!' | '+' | '*' | '/' | '<' | '>' | '%' | '-' => {
                return Err(ExpressionError::Unsupported(format!(
                    "operator '{}' at {}",
                    c, i
                )));
            }
            other => return Err(ExpressionError::UnexpectedChar { ch: other, pos: i }),
        }
    }

    Ok(out)
}

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self, levels: usize) -> Result<(), ExpressionError> {
        self.depth += levels;
        if self.depth > MAX_NESTING {
            return Err(ExpressionError::TooDeep(MAX_NESTING));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Tok, usize)> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: Tok, expected: &'static str) -> Result<(), ExpressionError> {
        match self.next() {
            Some((t, _)) if t == want => Ok(()),
            Some((t, pos)) => Err(ExpressionError::UnexpectedToken {
                found: t.to_string(),
                expected,
                pos,
            }),
            None => Err(ExpressionError::UnexpectedEnd(expected)),
        }
    }

    fn expr(&mut self) -> Result<Expr, ExpressionError> {
        self.descend(1)?;
        let out = self.ternary();
        self.depth -= 1;
        out
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        let cond = self.or()?;
        if self.peek() == Some(&Tok::Question) {
            self.pos += 1;
            let then = self.expr()?;
            self.expect(Tok::Colon, "':'")?;
            let otherwise = self.expr()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)));
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.primary()?;
        // each operand adds a level to the left-leaning tree
        let mut chained = 0;
        while self.peek() == Some(&Tok::OrOr) {
            self.pos += 1;
            chained += 1;
            self.descend(1)?;
            let right = self.primary()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth -= chained;
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some((Tok::Str(s), _)) => Ok(Expr::Literal(Value::String(s))),
            Some((Tok::Num(n), _)) => Ok(Expr::Literal(n)),
            Some((Tok::LParen, _)) => {
                let inner = self.expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some((Tok::Ident(name), _)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "JSON" => {
                    self.expect(Tok::Dot, "'.'")?;
                    match self.next() {
                        Some((Tok::Ident(f), _)) if f == "stringify" => {}
                        Some((t, pos)) => {
                            return Err(ExpressionError::Unsupported(format!(
                                "JSON.{} at {}",
                                match t {
                                    Tok::Ident(s) => s,
                                    other => other.to_string(),
                                },
                                pos
                            )))
                        }
                        None => return Err(ExpressionError::UnexpectedEnd("'stringify'")),
                    }
                    self.expect(Tok::LParen, "'('")?;
                    let inner = self.expr()?;
                    self.expect(Tok::RParen, "')'")?;
                    Ok(Expr::Stringify(Box::new(inner)))
                }
                _ => {
                    let root = Namespace::parse(&name)
                        .ok_or_else(|| ExpressionError::UnknownNamespace(name.clone()))?;
                    self.path(root)
                }
            },
            Some((t, pos)) => Err(ExpressionError::UnexpectedToken {
                found: t.to_string(),
                expected: "a value or path",
                pos,
            }),
            None => Err(ExpressionError::UnexpectedEnd("a value or path")),
        }
    }

    fn path(&mut self, root: Namespace) -> Result<Expr, ExpressionError> {
        let mut segments = vec![];
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some((Tok::Ident(key), _)) => segments.push(Segment::Key(key)),
                        Some((t, pos)) => {
                            return Err(ExpressionError::UnexpectedToken {
                                found: t.to_string(),
                                expected: "a property name",
                                pos,
                            })
                        }
                        None => return Err(ExpressionError::UnexpectedEnd("a property name")),
                    }
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some((Tok::Num(n), pos)) => {
                            let idx = n.as_u64().ok_or_else(|| ExpressionError::UnexpectedToken {
                                found: format!("number {}", n),
                                expected: "a non-negative integer index",
                                pos,
                            })?;
                            segments.push(Segment::Index(idx as usize));
                        }
                        Some((Tok::Str(key), _)) => segments.push(Segment::Key(key)),
                        Some((t, pos)) => {
                            return Err(ExpressionError::UnexpectedToken {
                                found: t.to_string(),
                                expected: "an index or quoted key",
                                pos,
                            })
                        }
                        None => return Err(ExpressionError::UnexpectedEnd("an index")),
                    }
                    self.expect(Tok::RBracket, "']'")?;
                }
                Some(Tok::LParen) => {
                    return Err(ExpressionError::Unsupported(format!(
                        "function call on path '{}'",
                        PathRef { root, segments }
                    )))
                }
                _ => break,
            }
        }
        Ok(Expr::Path(PathRef { root, segments }))
    }
}

/// Parse expression source into an AST.
pub fn parse(src: &str) -> Result<Expr, ExpressionError> {
    let toks = tokenize(src)?;
    if toks.is_empty() {
        return Err(ExpressionError::UnexpectedEnd("an expression"));
    }
    let mut parser = Parser { toks, pos: 0, depth: 0 };
    let expr = parser.expr()?;
    if let Some((t, pos)) = parser.next() {
        return Err(ExpressionError::UnexpectedToken {
            found: t.to_string(),
            expected: "end of expression",
            pos,
        });
    }
    Ok(expr)
}

/// A segment of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Piece<'a> {
    Text(&'a str),
    Expr(&'a str),
}

pub fn has_interpolation(s: &str) -> bool {
    s.contains("{{")
}

/// Split `s` into literal text and `{{expr}}` spans (expression source trimmed).
pub fn split_interpolations(s: &str) -> Result<Vec<Piece<'_>>, ExpressionError> {
    let mut pieces = vec![];
    let mut rest = s;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            pieces.push(Piece::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(ExpressionError::UnterminatedInterpolation(offset + start))?;
        pieces.push(Piece::Expr(after[..end].trim()));
        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

/// JavaScript-style truthiness.
pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Resolve a path against the scope. Missing segments yield `None`.
pub fn lookup<'a>(path: &PathRef, scope: &'a dyn Scope) -> Option<&'a Value> {
    let mut current = scope.namespace(path.root)?;
    for seg in &path.segments {
        current = match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(k)?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
            (Segment::Key(k), Value::Array(items)) => items.get(k.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluate an AST. Unresolved paths evaluate to `null`.
pub fn evaluate(expr: &Expr, scope: &dyn Scope) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(p) => Ok(lookup(p, scope).cloned().unwrap_or(Value::Null)),
        Expr::Or(l, r) => {
            let left = evaluate(l, scope)?;
            if is_truthy(&left) {
                Ok(left)
            } else {
                evaluate(r, scope)
            }
        }
        Expr::Ternary(c, t, e) => {
            if is_truthy(&evaluate(c, scope)?) {
                evaluate(t, scope)
            } else {
                evaluate(e, scope)
            }
        }
        Expr::Stringify(inner) => {
            let v = evaluate(inner, scope)?;
            serde_json::to_string(&v)
                .map(Value::String)
                .map_err(|e| ExpressionError::Stringify(e.to_string()))
        }
    }
}

/// Collect every path an expression reads.
pub fn referenced_paths(expr: &Expr) -> Vec<&PathRef> {
    let mut out = vec![];
    fn walk<'a>(e: &'a Expr, out: &mut Vec<&'a PathRef>) {
        match e {
            Expr::Literal(_) => {}
            Expr::Path(p) => out.push(p),
            Expr::Or(l, r) => {
                walk(l, out);
                walk(r, out);
            }
            Expr::Ternary(c, t, f) => {
                walk(c, out);
                walk(t, out);
                walk(f, out);
            }
            Expr::Stringify(inner) => walk(inner, out),
        }
    }
    walk(expr, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TestScope {
        params: Value,
        env: Value,
    }

    impl Scope for TestScope {
        fn namespace(&self, ns: Namespace) -> Option<&Value> {
            match ns {
                Namespace::Params => Some(&self.params),
                Namespace::Env => Some(&self.env),
                _ => None,
            }
        }
    }

    fn scope() -> TestScope {
        TestScope {
            params: json!({
                "host": "",
                "port": 8080,
                "tls": true,
                "tags": ["a", "b"],
                "nested": {"x-key": 1}
            }),
            env: json!({"REGION": "eu"}),
        }
    }

    fn eval(src: &str) -> Value {
        evaluate(&parse(src).unwrap(), &scope()).unwrap()
    }

    #[test]
    fn test_path_lookup() {
        assert_eq!(eval("params.port"), json!(8080));
        assert_eq!(eval("params.tags[1]"), json!("b"));
        assert_eq!(eval("params.nested['x-key']"), json!(1));
        assert_eq!(eval("env.REGION"), json!("eu"));
        assert_eq!(eval("params.missing.deeper"), Value::Null);
    }

    #[test]
    fn test_or_fallback() {
        assert_eq!(eval("params.host || 'localhost'"), json!("localhost"));
        assert_eq!(eval("params.port || 80"), json!(8080));
        assert_eq!(eval("params.a || params.b || \"last\""), json!("last"));
    }

    #[test]
    fn test_ternary() {
        assert_eq!(eval("params.tls ? 'https' : 'http'"), json!("https"));
        assert_eq!(eval("params.host ? 'set' : params.port"), json!(8080));
        assert_eq!(
            eval("params.tls ? params.host ? 'a' : 'b' : 'c'"),
            json!("b")
        );
    }

    #[test]
    fn test_stringify() {
        assert_eq!(eval("JSON.stringify(params.tags)"), json!("[\"a\",\"b\"]"));
        assert_eq!(
            eval("JSON.stringify(params.missing || 'x')"),
            json!("\"x\"")
        );
    }

    #[test]
    fn test_quoted_operators_do_not_split() {
        assert_eq!(eval("params.host || 'a || b ? c : d'"), json!("a || b ? c : d"));
    }

    #[test]
    fn test_unsupported_shapes_are_errors() {
        assert!(matches!(parse("params.a + 1"), Err(ExpressionError::Unsupported(_))));
        assert!(matches!(parse("params.a && params.b"), Err(ExpressionError::Unsupported(_))));
        assert!(matches!(parse("Math.max(1)"), Err(ExpressionError::UnknownNamespace(_))));
        assert!(matches!(parse("JSON.parse(params.a)"), Err(ExpressionError::Unsupported(_))));
        assert!(matches!(parse("params.a ? 1"), Err(ExpressionError::UnexpectedEnd(_))));
        assert!(matches!(parse("'open"), Err(ExpressionError::UnterminatedString(0))));
        assert!(parse("").is_err());
        assert!(parse("params.a params.b").is_err());
    }

    #[test]
    fn test_nesting_is_bounded() {
        let shallow = format!("{}params.port{}", "(".repeat(60), ")".repeat(60));
        assert_eq!(eval(&shallow), json!(8080));

        let deep = format!("{}params.a{}", "(".repeat(100_000), ")".repeat(100_000));
        assert_eq!(parse(&deep), Err(ExpressionError::TooDeep(MAX_NESTING)));

        let chain = vec!["params.a"; 10_000].join(" || ");
        assert_eq!(parse(&chain), Err(ExpressionError::TooDeep(MAX_NESTING)));
        assert!(parse(&vec!["params.a"; 20].join(" || ")).is_ok());
    }

    #[test]
    fn test_split_interpolations() {
        let pieces = split_interpolations("http://{{ params.host }}:{{params.port}}/x").unwrap();
        assert_eq!(
            pieces,
            vec![
                Piece::Text("http://"),
                Piece::Expr("params.host"),
                Piece::Text(":"),
                Piece::Expr("params.port"),
                Piece::Text("/x"),
            ]
        );
        assert_eq!(split_interpolations("plain").unwrap(), vec![Piece::Text("plain")]);
        assert_eq!(
            split_interpolations("a {{ params.b").unwrap_err(),
            ExpressionError::UnterminatedInterpolation(2)
        );
    }

    #[test]
    fn test_referenced_paths() {
        let e = parse("params.a ? stage.id : (channel.title || 'x')").unwrap();
        let paths: Vec<String> = referenced_paths(&e).iter().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["params.a", "stage.id", "channel.title"]);
    }
}
