//! Condition expressions gating a run, evaluated against host identity.
//!
//! The language is a tiny, side-effect-free subset of JavaScript expressions:
//!
//! - Literals: `true`, `false`, `null`, numbers, `'single'` / `"double"` strings
//! - Bindings: `name` (host name) and `tags` (merged host tag object)
//! - Member access: `tags.role`, `tags["role"]`, `name.length`
//! - String methods: `startsWith`, `endsWith`, `includes`, `matches` (regex)
//! - Operators: `!`, `==`, `!=`, `===`, `!==`, `&&`, `||`, parentheses
//!
//! `&&` and `||` short-circuit and yield operand values like JavaScript; the
//! final value is coerced with JavaScript truthiness.
//!
//! Does NOT support assignment, function definitions, or any binding beyond
//! the two host facts.

use regex::Regex;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::core::types::HostIdentity;

/// Expression used when none is configured.
pub const DEFAULT_CONDITION: &str = "true";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("{0}")]
    Runtime(String),
}

type EvalResult<T> = Result<T, ConditionError>;

/// Read-only facts bound into an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Facts {
    pub name: String,
    pub tags: Map<String, Value>,
}

impl Facts {
    pub fn from_host(host: &HostIdentity) -> Self {
        let tags = host
            .merged_tags()
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        Self {
            name: host.hostname.clone(),
            tags,
        }
    }
}

/// A parsed condition, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse `source`. Blank input means [`DEFAULT_CONDITION`].
    pub fn parse(source: &str) -> EvalResult<Self> {
        let trimmed = source.trim();
        let text = if trimmed.is_empty() {
            DEFAULT_CONDITION
        } else {
            trimmed
        };
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_expr()?;
        parser.expect_end()?;
        Ok(Self {
            source: text.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, facts: &Facts) -> EvalResult<bool> {
        let value = eval(&self.expr, facts)?;
        Ok(is_truthy(&value))
    }
}

/// Parse and evaluate `expression` against `host` in one call.
pub fn evaluate(expression: &str, host: &HostIdentity) -> EvalResult<bool> {
    Condition::parse(expression)?.evaluate(&Facts::from_host(host))
}

/// JavaScript truthiness for JSON values.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Not,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
    EqEqEq,
    NotEqEq,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn tokenize(input: &str) -> EvalResult<Vec<(usize, Token)>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let ch = bytes[pos];
        match ch {
            b' ' | b'\t' | b'\n' | b'\r' => {
                pos += 1;
                continue;
            }
            b'(' => tokens.push((start, Token::LParen)),
            b')' => tokens.push((start, Token::RParen)),
            b'[' => tokens.push((start, Token::LBracket)),
            b']' => tokens.push((start, Token::RBracket)),
            b'.' if !bytes.get(pos + 1).is_some_and(u8::is_ascii_digit) => {
                tokens.push((start, Token::Dot));
            }
            b',' => tokens.push((start, Token::Comma)),
            b'&' if bytes.get(pos + 1) == Some(&b'&') => {
                pos += 1;
                tokens.push((start, Token::AndAnd));
            }
            b'|' if bytes.get(pos + 1) == Some(&b'|') => {
                pos += 1;
                tokens.push((start, Token::OrOr));
            }
            b'=' if input[pos..].starts_with("===") => {
                pos += 2;
                tokens.push((start, Token::EqEqEq));
            }
            b'=' if input[pos..].starts_with("==") => {
                pos += 1;
                tokens.push((start, Token::EqEq));
            }
            b'!' if input[pos..].starts_with("!==") => {
                pos += 2;
                tokens.push((start, Token::NotEqEq));
            }
            b'!' if input[pos..].starts_with("!=") => {
                pos += 1;
                tokens.push((start, Token::NotEq));
            }
            b'!' => tokens.push((start, Token::Not)),
            b'"' | b'\'' => {
                let (text, end) = read_string(input, pos)?;
                tokens.push((start, Token::Str(text)));
                pos = end;
                continue;
            }
            b'0'..=b'9' | b'.' => {
                let end = input[pos..]
                    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                    .map_or(input.len(), |idx| pos + idx);
                let literal = &input[pos..end];
                let num = literal.parse::<f64>().map_err(|_| ConditionError::Syntax {
                    offset: start,
                    message: format!("invalid number {literal:?}"),
                })?;
                tokens.push((start, Token::Num(num)));
                pos = end;
                continue;
            }
            c if c.is_ascii_alphabetic() || c == b'_' || c == b'$' => {
                let end = input[pos..]
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$'))
                    .map_or(input.len(), |idx| pos + idx);
                tokens.push((start, Token::Ident(input[pos..end].to_string())));
                pos = end;
                continue;
            }
            _ => {
                let found = input[pos..].chars().next().unwrap_or_default();
                return Err(ConditionError::Syntax {
                    offset: start,
                    message: format!("unexpected character {found:?}"),
                });
            }
        }
        pos += 1;
    }

    Ok(tokens)
}

/// Read a quoted string starting at `start`; returns the text and the offset after the closing quote.
fn read_string(input: &str, start: usize) -> EvalResult<(String, usize)> {
    let mut chars = input[start..].char_indices();
    let (_, quote) = chars.next().ok_or(ConditionError::Syntax {
        offset: start,
        message: "expected string".to_string(),
    })?;
    let mut text = String::new();

    while let Some((idx, ch)) = chars.next() {
        match ch {
            c if c == quote => return Ok((text, start + idx + c.len_utf8())),
            '\\' => match chars.next() {
                Some((_, 'n')) => text.push('\n'),
                Some((_, 't')) => text.push('\t'),
                Some((_, escaped)) => text.push(escaped),
                None => break,
            },
            c => text.push(c),
        }
    }

    Err(ConditionError::Syntax {
        offset: start,
        message: "unterminated string".to_string(),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Binding(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Member {
        target: Box<Expr>,
        key: Box<Expr>,
    },
    Call {
        target: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
}

/// Deepest expression tree the parser will build.
const MAX_DEPTH: usize = 128;

/// Recursive descent parser, lowest precedence first.
struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    /// Depth of the node being parsed; bounded by [`MAX_DEPTH`].
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, tok)| tok)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or_else(|| self.tokens.last().map_or(0, |(at, _)| *at + 1), |(at, _)| *at)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, tok)| tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> EvalResult<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected {what}")))
        }
    }

    fn expect_end(&self) -> EvalResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(tok) => Err(self.syntax(format!("unexpected token {tok:?}"))),
        }
    }

    fn syntax(&self, message: String) -> ConditionError {
        ConditionError::Syntax {
            offset: self.offset(),
            message,
        }
    }

    /// Go one level deeper, failing past [`MAX_DEPTH`].
    fn descend(&mut self) -> EvalResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.syntax(format!(
                "expression nested deeper than {MAX_DEPTH} levels"
            )));
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> EvalResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> EvalResult<Expr> {
        let depth = self.depth;
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            self.descend()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_and(&mut self) -> EvalResult<Expr> {
        let depth = self.depth;
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            self.descend()?;
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_equality(&mut self) -> EvalResult<Expr> {
        let depth = self.depth;
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => CompareOp::LooseEq,
                Some(Token::NotEq) => CompareOp::LooseNe,
                Some(Token::EqEqEq) => CompareOp::StrictEq,
                Some(Token::NotEqEq) => CompareOp::StrictNe,
                _ => {
                    self.depth = depth;
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.descend()?;
            let right = self.parse_unary()?;
            left = Expr::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> EvalResult<Expr> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> EvalResult<Expr> {
        let depth = self.depth;
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                self.descend()?;
                let name = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    _ => return Err(self.syntax("expected property name after '.'".to_string())),
                };
                if self.eat(&Token::LParen) {
                    let args = self.parse_args()?;
                    expr = Expr::Call {
                        target: Box::new(expr),
                        method: name,
                        args,
                    };
                } else {
                    expr = Expr::Member {
                        target: Box::new(expr),
                        key: Box::new(Expr::Literal(Value::String(name))),
                    };
                }
            } else if self.eat(&Token::LBracket) {
                self.descend()?;
                let key = self.parse_expr()?;
                self.expect(&Token::RBracket, "']'")?;
                expr = Expr::Member {
                    target: Box::new(expr),
                    key: Box::new(key),
                };
            } else {
                self.depth = depth;
                return Ok(expr);
            }
        }
    }

    fn parse_args(&mut self) -> EvalResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma, "',' or ')'")?;
        }
    }

    fn parse_primary(&mut self) -> EvalResult<Expr> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::Num(num)) => Ok(Expr::Literal(number(num))),
            Some(Token::Ident(ident)) => Ok(match ident.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Binding(ident),
            }),
            Some(tok) => Err(ConditionError::Syntax {
                offset,
                message: format!("unexpected token {tok:?}"),
            }),
            None => Err(ConditionError::Syntax {
                offset,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }
}

fn number(num: f64) -> Value {
    if num.fract() == 0.0 && num.abs() < i64::MAX as f64 {
        Value::Number(Number::from(num as i64))
    } else {
        Number::from_f64(num).map_or(Value::Null, Value::Number)
    }
}

fn eval(expr: &Expr, facts: &Facts) -> EvalResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Binding(ident) => match ident.as_str() {
            "name" => Ok(Value::String(facts.name.clone())),
            "tags" => Ok(Value::Object(facts.tags.clone())),
            other => Err(ConditionError::Runtime(format!(
                "ReferenceError: {other} is not defined"
            ))),
        },
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, facts)?))),
        Expr::And(left, right) => {
            let left = eval(left, facts)?;
            if is_truthy(&left) {
                eval(right, facts)
            } else {
                Ok(left)
            }
        }
        Expr::Or(left, right) => {
            let left = eval(left, facts)?;
            if is_truthy(&left) {
                Ok(left)
            } else {
                eval(right, facts)
            }
        }
        Expr::Compare { op, left, right } => {
            let left = eval(left, facts)?;
            let right = eval(right, facts)?;
            let result = match op {
                CompareOp::StrictEq => strict_eq(&left, &right),
                CompareOp::StrictNe => !strict_eq(&left, &right),
                CompareOp::LooseEq => loose_eq(&left, &right),
                CompareOp::LooseNe => !loose_eq(&left, &right),
            };
            Ok(Value::Bool(result))
        }
        Expr::Member { target, key } => {
            let target = eval(target, facts)?;
            let key = eval(key, facts)?;
            member(&target, &key)
        }
        Expr::Call {
            target,
            method,
            args,
        } => {
            let target = eval(target, facts)?;
            let args = args
                .iter()
                .map(|arg| eval(arg, facts))
                .collect::<EvalResult<Vec<_>>>()?;
            call(&target, method, &args)
        }
    }
}

fn member(target: &Value, key: &Value) -> EvalResult<Value> {
    let key = display(key);
    match target {
        Value::Null => Err(ConditionError::Runtime(format!(
            "TypeError: cannot read property {key:?} of null"
        ))),
        Value::Object(map) => Ok(map.get(&key).cloned().unwrap_or(Value::Null)),
        Value::String(s) if key == "length" => Ok(Value::from(s.chars().count())),
        Value::Array(items) if key == "length" => Ok(Value::from(items.len())),
        Value::Array(items) => Ok(key
            .parse::<usize>()
            .ok()
            .and_then(|idx| items.get(idx).cloned())
            .unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

fn call(target: &Value, method: &str, args: &[Value]) -> EvalResult<Value> {
    let Value::String(subject) = target else {
        return Err(ConditionError::Runtime(format!(
            "TypeError: {method} is not a function"
        )));
    };
    let arg = args.first().map(display).unwrap_or_default();
    let result = match method {
        "startsWith" => subject.starts_with(&arg),
        "endsWith" => subject.ends_with(&arg),
        "includes" => subject.contains(&arg),
        "matches" => {
            let re = Regex::new(&arg).map_err(|err| {
                ConditionError::Runtime(format!("SyntaxError: invalid regex {arg:?}: {err}"))
            })?;
            re.is_match(subject)
        }
        _ => {
            return Err(ConditionError::Runtime(format!(
                "TypeError: {method} is not a function"
            )));
        }
    };
    Ok(Value::Bool(result))
}

fn strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(_), Value::String(_)) | (Value::Bool(_), Value::Bool(_)) => left == right,
        (Value::Object(_) | Value::Array(_), _) | (_, Value::Object(_) | Value::Array(_)) => {
            left == right
        }
        _ => match (to_number(left), to_number(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
