// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Expression evaluation for pause matching.
//!
//! Pause expressions relate an incoming event (`async.*`) to data captured
//! when the pause was created (`event.*`, interpolated into literals at save
//! time). The engine only ever emits and matches a small canonical form:
//! dotted paths, scalar literals, comparisons, `&&` and `||`. The built-in
//! evaluator covers exactly that form; a custom evaluator can be injected
//! through the executor's evaluator factory.

mod aggregator;

pub use aggregator::{Aggregator, MemoryAggregator};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

/// Expression errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExprError {
    /// The expression source could not be parsed.
    #[error("error compiling expression: {0}")]
    Parse(String),

    /// The expression could not be evaluated against the given data.
    #[error("error evaluating expression: {0}")]
    Eval(String),
}

/// A compiled expression.
pub trait Evaluator: Send + Sync {
    /// Evaluate against a data root (an object with `event`/`async` keys).
    /// Matching requires the result to be exactly `true`.
    fn evaluate(&self, data: &Value) -> Result<Value, ExprError>;

    /// The subset of `data` actually referenced by the expression, preserving
    /// nesting. Stored on pauses so matching needs no state reads.
    fn filtered_attributes(&self, data: &Value) -> Map<String, Value>;
}

/// Builds evaluators from expression source.
pub type EvaluatorFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn Evaluator>, ExprError> + Send + Sync>;

/// The default factory, producing the built-in evaluator.
pub fn default_evaluator_factory() -> EvaluatorFactory {
    Arc::new(|source| {
        let eval = BuiltinEvaluator::compile(source)?;
        Ok(Arc::new(eval) as Arc<dyn Evaluator>)
    })
}

/// Check that an expression parses.
pub fn validate(source: &str) -> Result<(), ExprError> {
    parse(source).map(|_| ())
}

/// Replace references rooted at keys of `data` with scalar literals.
///
/// Called at pause-save time with the triggering event so that saved
/// expressions compare the incoming event against constants, which the
/// aggregate matcher can index. Paths resolving to non-scalar values are
/// left in place; paths rooted in `data` but missing resolve to `null`.
pub fn interpolate(source: &str, data: &Value) -> Result<String, ExprError> {
    let node = parse(source)?;
    let node = interpolate_node(node, data);
    Ok(render(&node))
}

/// Deep-merge `src` into `dst`, `src` winning only where `dst` has no value.
pub fn merge_missing(dst: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (k, v) in src {
        match dst.get_mut(k) {
            None => {
                dst.insert(k.clone(), v.clone());
            }
            Some(Value::Object(dst_child)) => {
                if let Value::Object(src_child) = v {
                    let mut merged = dst_child.clone();
                    merge_missing(&mut merged, src_child);
                    *dst_child = merged;
                }
            }
            Some(_) => {}
        }
    }
}

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Or(Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Cmp {
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
    },
    Operand(Operand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Path(Vec<String>),
    Lit(Value),
}

/// The built-in evaluator over the canonical expression form.
pub struct BuiltinEvaluator {
    node: Node,
    paths: Vec<Vec<String>>,
}

impl BuiltinEvaluator {
    /// Compile an expression.
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let node = parse(source)?;
        let mut paths = BTreeSet::new();
        collect_paths(&node, &mut paths);
        Ok(Self {
            node,
            paths: paths.into_iter().collect(),
        })
    }

    /// Equality constants of the form `path == literal` reachable from the
    /// root through `&&` only. These hold for every match and are what the
    /// aggregate matcher indexes.
    pub(crate) fn equality_constants(&self) -> Vec<(Vec<String>, Value)> {
        let mut out = Vec::new();
        collect_equality_constants(&self.node, &mut out);
        out
    }
}

impl Evaluator for BuiltinEvaluator {
    fn evaluate(&self, data: &Value) -> Result<Value, ExprError> {
        Ok(eval_node(&self.node, data))
    }

    fn filtered_attributes(&self, data: &Value) -> Map<String, Value> {
        let mut out = Map::new();
        for path in &self.paths {
            if let Some(v) = lookup(data, path) {
                insert_nested(&mut out, path, v.clone());
            }
        }
        out
    }
}

fn collect_paths(node: &Node, out: &mut BTreeSet<Vec<String>>) {
    match node {
        Node::Or(l, r) | Node::And(l, r) => {
            collect_paths(l, out);
            collect_paths(r, out);
        }
        Node::Cmp { lhs, rhs, .. } => {
            for op in [lhs, rhs] {
                if let Operand::Path(p) = op {
                    out.insert(p.clone());
                }
            }
        }
        Node::Operand(Operand::Path(p)) => {
            out.insert(p.clone());
        }
        Node::Operand(Operand::Lit(_)) => {}
    }
}

fn collect_equality_constants(node: &Node, out: &mut Vec<(Vec<String>, Value)>) {
    match node {
        Node::And(l, r) => {
            collect_equality_constants(l, out);
            collect_equality_constants(r, out);
        }
        Node::Cmp {
            op: CmpOp::Eq,
            lhs,
            rhs,
        } => match (lhs, rhs) {
            (Operand::Path(p), Operand::Lit(v)) | (Operand::Lit(v), Operand::Path(p)) => {
                out.push((p.clone(), v.clone()));
            }
            _ => {}
        },
        _ => {}
    }
}

fn interpolate_node(node: Node, data: &Value) -> Node {
    match node {
        Node::Or(l, r) => Node::Or(
            Box::new(interpolate_node(*l, data)),
            Box::new(interpolate_node(*r, data)),
        ),
        Node::And(l, r) => Node::And(
            Box::new(interpolate_node(*l, data)),
            Box::new(interpolate_node(*r, data)),
        ),
        Node::Cmp { op, lhs, rhs } => Node::Cmp {
            op,
            lhs: interpolate_operand(lhs, data),
            rhs: interpolate_operand(rhs, data),
        },
        Node::Operand(op) => Node::Operand(interpolate_operand(op, data)),
    }
}

fn interpolate_operand(op: Operand, data: &Value) -> Operand {
    let path = match &op {
        Operand::Path(path) => path.clone(),
        Operand::Lit(_) => return op,
    };
    if data.get(path[0].as_str()).is_none() {
        return op;
    }
    match lookup(data, &path) {
        Some(v) if is_scalar(v) => Operand::Lit(v.clone()),
        Some(_) => op,
        None => Operand::Lit(Value::Null),
    }
}

fn is_scalar(v: &Value) -> bool {
    !matches!(v, Value::Object(_) | Value::Array(_))
}

fn render(node: &Node) -> String {
    match node {
        Node::Or(l, r) => format!("{} || {}", render(l), render(r)),
        Node::And(l, r) => {
            let left = match l.as_ref() {
                Node::Or(..) => format!("({})", render(l)),
                _ => render(l),
            };
            let right = match r.as_ref() {
                Node::Or(..) => format!("({})", render(r)),
                _ => render(r),
            };
            format!("{} && {}", left, right)
        }
        Node::Cmp { op, lhs, rhs } => format!(
            "{} {} {}",
            render_operand(lhs),
            op.as_str(),
            render_operand(rhs)
        ),
        Node::Operand(op) => render_operand(op),
    }
}

fn render_operand(op: &Operand) -> String {
    match op {
        Operand::Path(p) => p.join("."),
        Operand::Lit(v) => serde_json::to_string(v).unwrap_or_else(|_| "null".to_string()),
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn eval_node(node: &Node, data: &Value) -> Value {
    match node {
        Node::Or(l, r) => Value::Bool(truthy(&eval_node(l, data)) || truthy(&eval_node(r, data))),
        Node::And(l, r) => Value::Bool(truthy(&eval_node(l, data)) && truthy(&eval_node(r, data))),
        Node::Cmp { op, lhs, rhs } => {
            let l = resolve(lhs, data);
            let r = resolve(rhs, data);
            Value::Bool(compare(*op, &l, &r))
        }
        Node::Operand(op) => resolve(op, data),
    }
}

fn truthy(v: &Value) -> bool {
    matches!(v, Value::Bool(true))
}

fn resolve(op: &Operand, data: &Value) -> Value {
    match op {
        Operand::Path(p) => lookup(data, p).cloned().unwrap_or(Value::Null),
        Operand::Lit(v) => v.clone(),
    }
}

fn lookup<'a>(data: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cur = data;
    for seg in path {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

fn insert_nested(map: &mut Map<String, Value>, path: &[String], value: Value) {
    if path.len() == 1 {
        map.insert(path[0].clone(), value);
        return;
    }
    let entry = map
        .entry(path[0].clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(child) = entry {
        insert_nested(child, &path[1..], value);
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> bool {
    match op {
        CmpOp::Eq => json_eq(l, r),
        CmpOp::Ne => !json_eq(l, r),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => ordered(op, l, r),
    }
}

fn json_eq(l: &Value, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) {
        return a == b;
    }
    l == r
}

fn ordered(op: CmpOp, l: &Value, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) {
        return match op {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            _ => unreachable!(),
        };
    }
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return match op {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            _ => unreachable!(),
        };
    }
    false
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

// ============================================================================
// Parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    AndAnd,
    OrOr,
    Dot,
    Op(CmpOp),
    Ident(String),
    Str(String),
    Num(serde_json::Number),
}

fn parse(source: &str) -> Result<Node, ExprError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Parse(format!(
            "unexpected trailing input in '{}'",
            source
        )));
    }
    Ok(node)
}

fn lex(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(ExprError::Parse("expected '&&'".to_string()));
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(ExprError::Parse("expected '||'".to_string()));
                }
                tokens.push(Token::OrOr);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(ExprError::Parse("expected '=='".to_string()));
                }
                tokens.push(Token::Op(CmpOp::Eq));
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(ExprError::Parse("expected '!='".to_string()));
                }
                tokens.push(Token::Op(CmpOp::Ne));
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Le));
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ge));
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err(ExprError::Parse("unterminated string".to_string())),
                        Some(ch) if ch == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(esc @ ('\\' | '\'' | '"' | '/')) => s.push(esc),
                            other => {
                                return Err(ExprError::Parse(format!(
                                    "unsupported escape: {:?}",
                                    other
                                )))
                            }
                        },
                        Some(ch) => s.push(ch),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '-' | '0'..='9' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_digit() || n == '.' {
                        // A number followed by an identifier char is a path
                        // segment error, caught by the parse below.
                        s.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let num: serde_json::Number = s
                    .parse::<serde_json::Number>()
                    .map_err(|_| ExprError::Parse(format!("invalid number '{}'", s)))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        s.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            other => {
                return Err(ExprError::Parse(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let rhs = self.parse_and()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_primary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let rhs = self.parse_primary()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let node = self.parse_or()?;
            if self.next() != Some(Token::RParen) {
                return Err(ExprError::Parse("expected ')'".to_string()));
            }
            return Ok(node);
        }

        let lhs = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_operand()?;
            return Ok(Node::Cmp { op, lhs, rhs });
        }
        Ok(Node::Operand(lhs))
    }

    fn parse_operand(&mut self) -> Result<Operand, ExprError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Operand::Lit(Value::String(s))),
            Some(Token::Num(n)) => Ok(Operand::Lit(Value::Number(n))),
            Some(Token::Ident(first)) => {
                match first.as_str() {
                    "true" => return Ok(Operand::Lit(Value::Bool(true))),
                    "false" => return Ok(Operand::Lit(Value::Bool(false))),
                    "null" => return Ok(Operand::Lit(Value::Null)),
                    _ => {}
                }
                let mut path = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(seg)) => path.push(seg),
                        other => {
                            return Err(ExprError::Parse(format!(
                                "expected identifier after '.', got {:?}",
                                other
                            )))
                        }
                    }
                }
                Ok(Operand::Path(path))
            }
            other => Err(ExprError::Parse(format!("unexpected token: {:?}", other))),
        }
    }
}
