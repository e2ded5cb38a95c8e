//! The JSON data model's expression language.
//!
//! Expressions reference the instance context and the current event:
//!
//! - `ctx.field` / `ctx.field.nested` - context field access
//! - `_event.data.field` - current event payload access
//! - literals: numbers, `'strings'` / `"strings"`, `true`, `false`, `null`
//! - `a == b`, `a != b`, `a > b`, `a >= b`, `a < b`, `a <= b`
//! - `a + b`, `a - b` - numeric arithmetic
//! - `!expr`, `expr && expr`, `expr || expr`, `(expr)`
//!
//! Examples:
//! - `ctx.enabled` - truthy check
//! - `ctx.count + 1` - counter increment expression
//! - `ctx.amount > 100 && ctx.approved` - compound guard
//! - `_event.data.code == 'retry'` - payload match
//!
//! Evaluation is lenient (missing fields read as null, ordering on
//! non-numbers is false); only a malformed expression is an error.

use crate::datamodel::DataModelError;
use serde_json::{Number, Value};
use statech_event::Event;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A parsed expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Literal value.
    Literal(Value),
    /// Context field path.
    Field(Vec<String>),
    /// Current-event field path (`_event`, `_event.data.x`, ...).
    EventField(Vec<String>),
    /// Comparison.
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    /// Numeric addition.
    Add(Box<Expr>, Box<Expr>),
    /// Numeric subtraction.
    Sub(Box<Expr>, Box<Expr>),
    /// Logical AND.
    And(Box<Expr>, Box<Expr>),
    /// Logical OR.
    Or(Box<Expr>, Box<Expr>),
    /// Logical NOT.
    Not(Box<Expr>),
}

impl Expr {
    /// Parses an expression from a string.
    pub fn parse(s: &str) -> Result<Self, DataModelError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DataModelError::Parse {
                expr: s.to_string(),
                reason: "empty expression".to_string(),
            });
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos != parser.input.len() {
            return Err(DataModelError::Parse {
                expr: s.to_string(),
                reason: format!("unexpected trailing input at offset {}", parser.pos),
            });
        }
        Ok(expr)
    }

    /// Evaluates the expression against a context and the current event.
    pub fn evaluate(&self, ctx: &Value, event: Option<&Event>) -> Result<Value, DataModelError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Field(path) => Ok(get_path(ctx, path)),
            Expr::EventField(path) => {
                let event_value = match event {
                    Some(e) => serde_json::to_value(e).unwrap_or(Value::Null),
                    None => Value::Null,
                };
                Ok(get_path(&event_value, path))
            }
            Expr::Cmp(op, left, right) => {
                let left = left.evaluate(ctx, event)?;
                let right = right.evaluate(ctx, event)?;
                Ok(Value::Bool(compare(*op, &left, &right)))
            }
            Expr::Add(left, right) => {
                arith(left.evaluate(ctx, event)?, right.evaluate(ctx, event)?, "+")
            }
            Expr::Sub(left, right) => {
                arith(left.evaluate(ctx, event)?, right.evaluate(ctx, event)?, "-")
            }
            Expr::And(left, right) => {
                let value = is_truthy(&left.evaluate(ctx, event)?)
                    && is_truthy(&right.evaluate(ctx, event)?);
                Ok(Value::Bool(value))
            }
            Expr::Or(left, right) => {
                let value = is_truthy(&left.evaluate(ctx, event)?)
                    || is_truthy(&right.evaluate(ctx, event)?);
                Ok(Value::Bool(value))
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.evaluate(ctx, event)?))),
        }
    }
}

fn get_path(root: &Value, path: &[String]) -> Value {
    let mut current = root;
    for part in path {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }
    current.clone()
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        _ => match (as_f64(left), as_f64(right)) {
            (Some(l), Some(r)) => match op {
                CmpOp::Gt => l > r,
                CmpOp::Ge => l >= r,
                CmpOp::Lt => l < r,
                CmpOp::Le => l <= r,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            },
            _ => false,
        },
    }
}

fn arith(left: Value, right: Value, op: &str) -> Result<Value, DataModelError> {
    // String concatenation for `+`, numbers otherwise. Integers stay
    // integral as long as both sides are.
    if op == "+" {
        if let (Value::String(l), Value::String(r)) = (&left, &right) {
            return Ok(Value::String(format!("{l}{r}")));
        }
    }
    let (l, r) = match (&left, &right) {
        (Value::Number(l), Value::Number(r)) => (l, r),
        _ => {
            return Err(DataModelError::Evaluation {
                reason: format!("cannot apply '{op}' to {left} and {right}"),
            })
        }
    };
    if let (Some(l), Some(r)) = (l.as_i64(), r.as_i64()) {
        let value = if op == "+" {
            l.checked_add(r)
        } else {
            l.checked_sub(r)
        };
        if let Some(v) = value {
            return Ok(Value::Number(v.into()));
        }
    }
    let (l, r) = (l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0));
    let result = if op == "+" { l + r } else { l - r };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| DataModelError::Evaluation {
            reason: format!("non-finite result of '{op}'"),
        })
}

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> DataModelError {
        DataModelError::Parse {
            expr: self.input.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, DataModelError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, DataModelError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();
        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, DataModelError> {
        let mut left = self.parse_cmp()?;
        self.skip_whitespace();
        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr, DataModelError> {
        let left = self.parse_sum()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            Some((CmpOp::Eq, 2))
        } else if self.peek_str("!=") {
            Some((CmpOp::Ne, 2))
        } else if self.peek_str(">=") {
            Some((CmpOp::Ge, 2))
        } else if self.peek_str("<=") {
            Some((CmpOp::Le, 2))
        } else if self.peek_char() == Some('>') {
            Some((CmpOp::Gt, 1))
        } else if self.peek_char() == Some('<') {
            Some((CmpOp::Lt, 1))
        } else {
            None
        };

        match op {
            Some((op, width)) => {
                self.pos += width;
                let right = self.parse_sum()?;
                Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_sum(&mut self) -> Result<Expr, DataModelError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();
        loop {
            match self.peek_char() {
                Some('+') => {
                    self.pos += 1;
                    let right = self.parse_unary()?;
                    left = Expr::Add(Box::new(left), Box::new(right));
                }
                Some('-') => {
                    self.pos += 1;
                    let right = self.parse_unary()?;
                    left = Expr::Sub(Box::new(left), Box::new(right));
                }
                _ => break,
            }
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, DataModelError> {
        self.skip_whitespace();
        // `!` recurses to allow `!!ctx.a`, but `!=` belongs to parse_cmp.
        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, DataModelError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err(self.error("expected ')'"));
                }
                self.pos += 1;
                Ok(expr)
            }
            Some('\'') | Some('"') => self.parse_string(),
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            Some('-') => self.parse_number(),
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_word(),
            _ => Err(self.error("expected expression")),
        }
    }

    fn parse_string(&mut self) -> Result<Expr, DataModelError> {
        let quote = match self.peek_char() {
            Some(q) => q,
            None => return Err(self.error("expected string")),
        };
        self.pos += quote.len_utf8();
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == quote {
                let value = self.input[start..self.pos].to_string();
                self.pos += quote.len_utf8();
                return Ok(Expr::Literal(Value::String(value)));
            }
            self.pos += c.len_utf8();
        }
        Err(self.error("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Expr, DataModelError> {
        let start = self.pos;
        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error(format!("invalid number '{text}'")))?;
            Number::from_f64(value)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| self.error(format!("invalid number '{text}'")))
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error(format!("invalid number '{text}'")))?;
            Ok(Expr::Literal(Value::Number(value.into())))
        }
    }

    fn parse_word(&mut self) -> Result<Expr, DataModelError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        let word = &self.input[start..self.pos];
        match word {
            "true" => Ok(Expr::Literal(Value::Bool(true))),
            "false" => Ok(Expr::Literal(Value::Bool(false))),
            "null" => Ok(Expr::Literal(Value::Null)),
            _ => {
                let mut parts = word.split('.');
                match parts.next() {
                    Some("ctx") => Ok(Expr::Field(parts.map(str::to_string).collect())),
                    Some("_event") => Ok(Expr::EventField(parts.map(str::to_string).collect())),
                    _ => Err(self.error(format!(
                        "unknown identifier '{word}' (expected ctx.* or _event.*)"
                    ))),
                }
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }
}
