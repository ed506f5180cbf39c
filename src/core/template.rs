//! A small expression language used by conditions, selection rules and policy
//! configuration values.
//!
//! Templates embed expressions as `{#<expr>}`. Expressions support dotted paths
//! (`request.headers.host`), bracket indexing (`request.headers['X-Api-Key']`,
//! `items[0]`), string/number/boolean/null literals, comparisons (`==`, `!=`, `<`, `<=`,
//! `>`, `>=`), regular expression matching (`matches`, full match), `&&`, `||`, `!` and
//! parentheses.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("Invalid expression '{expression}': {message}")]
    Parse { expression: String, message: String },

    #[error("Unable to evaluate expression: {0}")]
    Evaluation(String),
}

/// Contributes variables to every template engine built for a deployment.
pub trait TemplateVariableProvider: Send + Sync {
    fn provide(&self, variables: &mut Map<String, Value>);
}

/// Provider backed by a fixed variable name and value.
pub struct StaticVariableProvider {
    name: String,
    value: Value,
}

impl StaticVariableProvider {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl TemplateVariableProvider for StaticVariableProvider {
    fn provide(&self, variables: &mut Map<String, Value>) {
        variables.insert(self.name.clone(), self.value.clone());
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Matches,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') if chars.get(i + 1) == Some(&quote) => {
                            value.push(quote);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{literal}'"))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected:?}, found {token:?}")),
            None => Err(format!("expected {expected:?}, found end of expression")),
        }
    }

    fn parse(mut self) -> Result<Expr, String> {
        let expr = self.parse_or()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(format!("unexpected trailing token {token:?}")),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::Ident(word)) if word == "matches" => BinaryOp::Matches,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_primary()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Str(value)) => Ok(Expr::Literal(Value::String(value))),
            Some(Token::Num(number)) => Ok(Expr::Literal(number_value(number))),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => self.parse_path(word),
            },
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_path(&mut self, root: String) -> Result<Expr, String> {
        let mut segments = vec![Segment::Key(root)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(name)) => segments.push(Segment::Key(name)),
                        other => return Err(format!("expected a name after '.', found {other:?}")),
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    match self.next() {
                        Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                        Some(Token::Num(index)) if index >= 0.0 && index.fract() == 0.0 => {
                            segments.push(Segment::Index(index as usize))
                        }
                        other => return Err(format!("invalid index {other:?}")),
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => return Ok(Expr::Path(segments)),
            }
        }
    }
}

fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Value::from(number as i64)
    } else {
        Value::from(number)
    }
}

/// Truthiness used for conditions and logical operators
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value the way it appears when interpolated into a string
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lookup<'a>(value: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match (value, segment) {
        (Value::Object(map), Segment::Key(key)) => map.get(key).or_else(|| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        }),
        (Value::Array(items), Segment::Index(index)) => items.get(*index),
        (Value::Object(map), Segment::Index(index)) => map.get(&index.to_string()),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(a), Value::Number(b)) | (Value::Number(b), Value::String(a)) => {
            a.parse::<f64>().ok() == b.as_f64()
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::Number(b)) => a.parse::<f64>().ok()?.partial_cmp(&b.as_f64()?),
        (Value::Number(a), Value::String(b)) => a.as_f64()?.partial_cmp(&b.parse::<f64>().ok()?),
        _ => None,
    }
}

/// Expression evaluator built once per execution context.
///
/// Static variables come from the registered [`TemplateVariableProvider`]s; request
/// scoped variables are passed at evaluation time so they always reflect the current
/// state of the request.
pub struct TemplateEngine {
    variables: Map<String, Value>,
    cache: Mutex<HashMap<String, Arc<Expr>>>,
}

impl TemplateEngine {
    pub fn new(providers: &[Arc<dyn TemplateVariableProvider>]) -> Self {
        let mut variables = Map::new();
        for provider in providers {
            provider.provide(&mut variables);
        }
        Self {
            variables,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn compile(&self, expression: &str) -> Result<Arc<Expr>, TemplateError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(expr) = cache.get(expression) {
                return Ok(expr.clone());
            }
        }

        let parsed = tokenize(expression)
            .and_then(|tokens| {
                Parser {
                    tokens,
                    position: 0,
                }
                .parse()
            })
            .map_err(|message| TemplateError::Parse {
                expression: expression.to_string(),
                message,
            })?;
        let parsed = Arc::new(parsed);

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(expression.to_string(), parsed.clone());
        }
        Ok(parsed)
    }

    /// Evaluate a bare expression (without the `{# }` delimiters)
    pub fn evaluate(&self, expression: &str, scope: &Map<String, Value>) -> Result<Value, TemplateError> {
        let expr = self.compile(expression.trim())?;
        self.eval(&expr, scope)
    }

    /// Evaluate a condition; `{#expr}` and bare `expr` are both accepted
    pub fn evaluate_condition(
        &self,
        condition: &str,
        scope: &Map<String, Value>,
    ) -> Result<bool, TemplateError> {
        let trimmed = condition.trim();
        let expression = trimmed
            .strip_prefix("{#")
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(trimmed);
        Ok(is_truthy(&self.evaluate(expression, scope)?))
    }

    /// Replace every `{#expr}` in `template` with the value of `expr`
    pub fn render(&self, template: &str, scope: &Map<String, Value>) -> Result<String, TemplateError> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{#") {
            output.push_str(&rest[..start]);
            let body = &rest[start + 2..];
            let end = find_closing_brace(body).ok_or_else(|| TemplateError::Parse {
                expression: template.to_string(),
                message: "missing closing '}'".to_string(),
            })?;
            let value = self.evaluate(&body[..end], scope)?;
            output.push_str(&value_to_string(&value));
            rest = &body[end + 1..];
        }

        output.push_str(rest);
        Ok(output)
    }

    fn resolve(&self, segments: &[Segment], scope: &Map<String, Value>) -> Value {
        let Some(Segment::Key(root)) = segments.first() else {
            return Value::Null;
        };
        let Some(mut current) = scope.get(root).or_else(|| self.variables.get(root)) else {
            return Value::Null;
        };
        for segment in &segments[1..] {
            match lookup(current, segment) {
                Some(next) => current = next,
                None => return Value::Null,
            }
        }
        current.clone()
    }

    fn eval(&self, expr: &Expr, scope: &Map<String, Value>) -> Result<Value, TemplateError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(segments) => Ok(self.resolve(segments, scope)),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&self.eval(inner, scope)?))),
            Expr::Binary(BinaryOp::And, left, right) => {
                if !is_truthy(&self.eval(left, scope)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&self.eval(right, scope)?)))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                if is_truthy(&self.eval(left, scope)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&self.eval(right, scope)?)))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                let result = match op {
                    BinaryOp::Eq => values_equal(&left, &right),
                    BinaryOp::Ne => !values_equal(&left, &right),
                    BinaryOp::Lt => compare(&left, &right).is_some_and(|o| o.is_lt()),
                    BinaryOp::Le => compare(&left, &right).is_some_and(|o| o.is_le()),
                    BinaryOp::Gt => compare(&left, &right).is_some_and(|o| o.is_gt()),
                    BinaryOp::Ge => compare(&left, &right).is_some_and(|o| o.is_ge()),
                    BinaryOp::Matches => {
                        let Value::String(pattern) = &right else {
                            return Err(TemplateError::Evaluation(
                                "the right side of 'matches' must be a string".to_string(),
                            ));
                        };
                        let regex = Regex::new(&format!("^(?:{pattern})$"))
                            .map_err(|e| TemplateError::Evaluation(e.to_string()))?;
                        match &left {
                            Value::Null => false,
                            other => regex.is_match(&value_to_string(other)),
                        }
                    }
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                };
                Ok(Value::Bool(result))
            }
        }
    }
}

/// Position of the `}` closing an expression, skipping braces inside string literals
fn find_closing_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for (index, c) in body.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '{') => depth += 1,
            (None, '}') if depth == 0 => return Some(index),
            (None, '}') => depth -= 1,
            _ => {}
        }
    }
    None
}
