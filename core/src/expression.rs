//! Expression evaluator for guards and action parameters
//!
//! Guards and action parameters in a state-chart definition are plain strings
//! evaluated against the variables of the current workflow context.
//!
//! # Supported Expressions
//!
//! - **Path Access**: `draft.holder`, `payload.newName`, `requests.0.type`
//! - **Comparisons**: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - **Boolean Operators**: `&&`, `||`, `!` (short-circuit)
//! - **Numeric Operations**: `+`, `-`, `*`, `/`
//! - **Literals**: strings, numbers, booleans, null
//! - **Functions**: `exists(path)`, `len(value)`, `lower(text)`, `now()`
//!
//! Evaluation never touches the content store; it only reads the
//! variables it was handed.
//!
//! # Example
//!
//! ```rust
//! use docflow_core::expression::{ExpressionEvaluator, EvalContext};
//! use serde_json::json;
//!
//! let context = EvalContext::new()
//!     .with_variable("user", json!("alice"))
//!     .with_variable("draft", json!({ "holder": "alice" }));
//!
//! let evaluator = ExpressionEvaluator::new();
//! assert!(evaluator
//!     .evaluate_bool("draft != null && draft.holder == user", &context)
//!     .unwrap());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during expression evaluation
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvalError {
    #[error("Parse error at position {position}: {message}")]
    ParseError { position: usize, message: String },

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Cannot coerce {found} to {expected}")]
    TypeCoercion { expected: String, found: String },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Empty expression")]
    EmptyExpression,
}

pub type EvalResult<T> = Result<T, EvalError>;

// ============================================================================
// EVALUATION CONTEXT
// ============================================================================

/// Variables visible to an expression
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    variables: HashMap<String, Value>,
    /// Time reported by `now()`; the wall clock when unset
    now: Option<DateTime<Utc>>,
}

impl EvalContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable to the context
    pub fn with_variable(mut self, name: &str, value: Value) -> Self {
        self.variables.insert(name.to_string(), value);
        self
    }

    /// Set a variable
    pub fn set(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    /// Pin the time seen by `now()`
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    /// Get a value by path (e.g. "draft.holder" or just "user")
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let root = self.variables.get(parts.next()?)?;
        let rest: Vec<&str> = parts.collect();
        Self::traverse_path(root, &rest)
    }

    fn traverse_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
        let Some((head, tail)) = path.split_first() else {
            return Some(value);
        };

        match value {
            Value::Object(map) => map.get(*head).and_then(|next| Self::traverse_path(next, tail)),
            Value::Array(arr) => head
                .parse::<usize>()
                .ok()
                .and_then(|index| arr.get(index))
                .and_then(|next| Self::traverse_path(next, tail)),
            _ => None,
        }
    }
}

// ============================================================================
// AST TYPES
// ============================================================================

/// AST node for parsed expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value (number, string, bool, null)
    Literal(Value),

    /// Variable or path reference (e.g. "user" or "draft.holder")
    Variable(String),

    /// Binary operation (left op right)
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// Unary operation (op expr)
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// Built-in function call
    Call { name: String, args: Vec<Expr> },

    /// Parenthesized expression
    Group(Box<Expr>),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical
    And,
    Or,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div => 6,
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

// ============================================================================
// TOKENIZER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    String(String),
    Bool(bool),
    Null,
    Ident(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Dot,
    Comma,
    Eof,
}

struct Tokenizer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
            current_pos: 0,
        }
    }

    fn next_token(&mut self) -> EvalResult<Token> {
        self.skip_whitespace();

        let (pos, ch) = match self.chars.next() {
            Some((pos, ch)) => {
                self.current_pos = pos;
                (pos, ch)
            }
            None => return Ok(Token::Eof),
        };

        match ch {
            '+' => Ok(Token::Plus),
            '-' => Ok(Token::Minus),
            '*' => Ok(Token::Star),
            '/' => Ok(Token::Slash),
            '(' => Ok(Token::LParen),
            ')' => Ok(Token::RParen),
            '.' => Ok(Token::Dot),
            ',' => Ok(Token::Comma),
            '=' => self.expect_pair(pos, '=', Token::Eq, "Expected '==' for equality comparison"),
            '&' => self.expect_pair(pos, '&', Token::And, "Expected '&&' for logical AND"),
            '|' => self.expect_pair(pos, '|', Token::Or, "Expected '||' for logical OR"),
            '!' => Ok(self.optional_pair('=', Token::Ne, Token::Not)),
            '<' => Ok(self.optional_pair('=', Token::Le, Token::Lt)),
            '>' => Ok(self.optional_pair('=', Token::Ge, Token::Gt)),
            '"' | '\'' => self.read_string(ch),
            '0'..='9' => self.read_number(pos, ch),
            'a'..='z' | 'A'..='Z' | '_' => Ok(self.read_identifier(ch)),
            _ => Err(EvalError::ParseError {
                position: pos,
                message: format!("Unexpected character: '{}'", ch),
            }),
        }
    }

    fn expect_pair(
        &mut self,
        pos: usize,
        second: char,
        token: Token,
        message: &str,
    ) -> EvalResult<Token> {
        if self.peek_char() == Some(second) {
            self.chars.next();
            Ok(token)
        } else {
            Err(EvalError::ParseError {
                position: pos,
                message: message.to_string(),
            })
        }
    }

    fn optional_pair(&mut self, second: char, paired: Token, single: Token) -> Token {
        if self.peek_char() == Some(second) {
            self.chars.next();
            paired
        } else {
            single
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn skip_whitespace(&mut self) {
        while let Some((_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self, quote: char) -> EvalResult<Token> {
        let mut s = String::new();

        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(Token::String(s)),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => s.push('\n'),
                    Some((_, 't')) => s.push('\t'),
                    Some((_, '\\')) => s.push('\\'),
                    Some((_, '"')) => s.push('"'),
                    Some((_, '\'')) => s.push('\''),
                    Some((pos, c)) => {
                        return Err(EvalError::ParseError {
                            position: pos,
                            message: format!("Unknown escape sequence: \\{}", c),
                        })
                    }
                    None => break,
                },
                Some((_, ch)) => s.push(ch),
                None => break,
            }
        }

        Err(EvalError::ParseError {
            position: self.input.len(),
            message: "Unterminated string".to_string(),
        })
    }

    fn read_number(&mut self, start: usize, first: char) -> EvalResult<Token> {
        let mut s = String::new();
        s.push(first);

        while let Some((_, ch)) = self.chars.peek() {
            if ch.is_ascii_digit() || *ch == '.' {
                s.push(*ch);
                self.chars.next();
            } else {
                break;
            }
        }

        s.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| EvalError::ParseError {
                position: start,
                message: format!("Invalid number: {}", s),
            })
    }

    fn read_identifier(&mut self, first: char) -> Token {
        let mut s = String::new();
        s.push(first);

        while let Some((_, ch)) = self.chars.peek() {
            if ch.is_alphanumeric() || *ch == '_' {
                s.push(*ch);
                self.chars.next();
            } else {
                break;
            }
        }

        match s.as_str() {
            "true" => Token::Bool(true),
            "false" => Token::Bool(false),
            "null" => Token::Null,
            _ => Token::Ident(s),
        }
    }
}

// ============================================================================
// PARSER
// ============================================================================

struct Parser<'a> {
    tokenizer: Tokenizer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> EvalResult<Self> {
        let mut tokenizer = Tokenizer::new(input);
        let current = tokenizer.next_token()?;
        Ok(Self { tokenizer, current })
    }

    fn parse(&mut self) -> EvalResult<Expr> {
        if self.current == Token::Eof {
            return Err(EvalError::EmptyExpression);
        }
        let expr = self.parse_expression(0)?;
        if self.current != Token::Eof {
            return Err(self.unexpected());
        }
        Ok(expr)
    }

    fn advance(&mut self) -> EvalResult<()> {
        self.current = self.tokenizer.next_token()?;
        Ok(())
    }

    fn unexpected(&self) -> EvalError {
        EvalError::ParseError {
            position: self.tokenizer.current_pos,
            message: format!("Unexpected token: {:?}", self.current),
        }
    }

    fn parse_expression(&mut self, min_precedence: u8) -> EvalResult<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match &self.current {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                Token::And => BinaryOp::And,
                Token::Or => BinaryOp::Or,
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };

            if op.precedence() < min_precedence {
                break;
            }

            self.advance()?;
            let right = self.parse_expression(op.precedence() + 1)?;

            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> EvalResult<Expr> {
        let op = match &self.current {
            Token::Not => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.parse_primary(),
        };
        self.advance()?;
        let expr = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_primary(&mut self) -> EvalResult<Expr> {
        let expr = match &self.current {
            Token::Number(n) => {
                let value = serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
                self.advance()?;
                Expr::Literal(value)
            }
            Token::String(s) => {
                let s = s.clone();
                self.advance()?;
                Expr::Literal(Value::String(s))
            }
            Token::Bool(b) => {
                let b = *b;
                self.advance()?;
                Expr::Literal(Value::Bool(b))
            }
            Token::Null => {
                self.advance()?;
                Expr::Literal(Value::Null)
            }
            Token::Ident(name) => {
                let name = name.clone();
                self.advance()?;
                if self.current == Token::LParen {
                    self.advance()?;
                    let args = self.parse_arguments()?;
                    return Ok(Expr::Call { name, args });
                }
                Expr::Variable(self.parse_path(name)?)
            }
            Token::LParen => {
                self.advance()?;
                let expr = self.parse_expression(0)?;
                if self.current != Token::RParen {
                    return Err(EvalError::ParseError {
                        position: self.tokenizer.current_pos,
                        message: "Expected ')'".to_string(),
                    });
                }
                self.advance()?;
                Expr::Group(Box::new(expr))
            }
            _ => return Err(self.unexpected()),
        };

        Ok(expr)
    }

    /// Dotted path segments; numeric segments index into arrays.
    fn parse_path(&mut self, mut path: String) -> EvalResult<String> {
        while self.current == Token::Dot {
            self.advance()?;
            let segment = match &self.current {
                Token::Ident(next) => next.clone(),
                Token::Number(n) if n.fract() == 0.0 && *n >= 0.0 => format!("{}", *n as u64),
                _ => {
                    return Err(EvalError::ParseError {
                        position: self.tokenizer.current_pos,
                        message: "Expected identifier after '.'".to_string(),
                    })
                }
            };
            path.push('.');
            path.push_str(&segment);
            self.advance()?;
        }
        Ok(path)
    }

    fn parse_arguments(&mut self) -> EvalResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.current == Token::RParen {
            self.advance()?;
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression(0)?);
            match self.current {
                Token::Comma => self.advance()?,
                Token::RParen => {
                    self.advance()?;
                    return Ok(args);
                }
                _ => {
                    return Err(EvalError::ParseError {
                        position: self.tokenizer.current_pos,
                        message: "Expected ',' or ')' in argument list".to_string(),
                    })
                }
            }
        }
    }
}

// ============================================================================
// EVALUATOR
// ============================================================================

/// Expression evaluator for guards and action parameters
#[derive(Debug, Clone, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    /// Create a new expression evaluator
    pub fn new() -> Self {
        Self
    }

    /// Parse an expression into an AST
    pub fn parse(&self, expression: &str) -> EvalResult<Expr> {
        let mut parser = Parser::new(expression)?;
        parser.parse()
    }

    /// Evaluate an expression against the given context
    pub fn evaluate(&self, expression: &str, context: &EvalContext) -> EvalResult<Value> {
        let ast = self.parse(expression)?;
        self.eval_expr(&ast, context)
    }

    /// Evaluate an expression and coerce result to boolean
    pub fn evaluate_bool(&self, expression: &str, context: &EvalContext) -> EvalResult<bool> {
        let result = self.evaluate(expression, context)?;
        Ok(truthy(&result))
    }

    fn eval_expr(&self, expr: &Expr, context: &EvalContext) -> EvalResult<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),

            Expr::Variable(path) => context
                .get(path)
                .cloned()
                .ok_or_else(|| EvalError::UnknownVariable(path.clone())),

            Expr::Binary {
                left,
                op: BinaryOp::And,
                right,
            } => {
                if !truthy(&self.eval_expr(left, context)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&self.eval_expr(right, context)?)))
            }

            Expr::Binary {
                left,
                op: BinaryOp::Or,
                right,
            } => {
                if truthy(&self.eval_expr(left, context)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&self.eval_expr(right, context)?)))
            }

            Expr::Binary { left, op, right } => {
                let left_val = self.eval_expr(left, context)?;
                let right_val = self.eval_expr(right, context)?;
                self.eval_binary(*op, &left_val, &right_val)
            }

            Expr::Unary { op, expr } => {
                let val = self.eval_expr(expr, context)?;
                self.eval_unary(*op, &val)
            }

            Expr::Call { name, args } => self.eval_call(name, args, context),

            Expr::Group(inner) => self.eval_expr(inner, context),
        }
    }

    fn eval_call(&self, name: &str, args: &[Expr], context: &EvalContext) -> EvalResult<Value> {
        match (name, args) {
            // exists() tolerates unresolved paths, everything else propagates
            ("exists", [arg]) => match self.eval_expr(arg, context) {
                Ok(value) => Ok(Value::Bool(!value.is_null())),
                Err(EvalError::UnknownVariable(_)) => Ok(Value::Bool(false)),
                Err(e) => Err(e),
            },
            ("len", [arg]) => {
                let value = self.eval_expr(arg, context)?;
                let len = match &value {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    Value::Null => 0,
                    other => {
                        return Err(EvalError::TypeError(format!(
                            "len() is not defined for {}",
                            type_name(other)
                        )))
                    }
                };
                Ok(Value::from(len as u64))
            }
            ("lower", [arg]) => match self.eval_expr(arg, context)? {
                Value::String(s) => Ok(Value::String(s.to_lowercase())),
                other => Err(EvalError::TypeError(format!(
                    "lower() expects a string, got {}",
                    type_name(&other)
                ))),
            },
            ("now", []) => Ok(Value::String(context.now().to_rfc3339())),
            ("exists" | "len" | "lower" | "now", _) => Err(EvalError::TypeError(format!(
                "Wrong number of arguments for {}()",
                name
            ))),
            _ => Err(EvalError::UnknownFunction(name.to_string())),
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Value> {
        match op {
            BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
            BinaryOp::Lt => self.compare_values(left, right, |o| o.is_lt()),
            BinaryOp::Le => self.compare_values(left, right, |o| o.is_le()),
            BinaryOp::Gt => self.compare_values(left, right, |o| o.is_gt()),
            BinaryOp::Ge => self.compare_values(left, right, |o| o.is_ge()),
            BinaryOp::And => Ok(Value::Bool(truthy(left) && truthy(right))),
            BinaryOp::Or => Ok(Value::Bool(truthy(left) || truthy(right))),
            BinaryOp::Add => match (left, right) {
                (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
                _ => self.numeric_op(left, right, |a, b| a + b),
            },
            BinaryOp::Sub => self.numeric_op(left, right, |a, b| a - b),
            BinaryOp::Mul => self.numeric_op(left, right, |a, b| a * b),
            BinaryOp::Div => {
                let r = to_number(right)?;
                if r == 0.0 {
                    return Err(EvalError::DivisionByZero);
                }
                let l = to_number(left)?;
                Ok(number_to_value(l / r))
            }
        }
    }

    fn eval_unary(&self, op: UnaryOp, val: &Value) -> EvalResult<Value> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!truthy(val))),
            UnaryOp::Neg => Ok(number_to_value(-to_number(val)?)),
        }
    }

    fn compare_values<F>(&self, left: &Value, right: &Value, cmp: F) -> EvalResult<Value>
    where
        F: Fn(std::cmp::Ordering) -> bool,
    {
        let ordering = match (left, right) {
            (Value::Number(a), Value::Number(b)) => a
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&b.as_f64().unwrap_or(0.0)),
            (Value::String(a), Value::String(b)) => {
                match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
                    (Ok(a), Ok(b)) => Some(a.cmp(&b)),
                    _ => Some(a.cmp(b)),
                }
            }
            _ => None,
        };
        ordering.map(|o| Value::Bool(cmp(o))).ok_or_else(|| {
            EvalError::TypeError(format!(
                "Cannot compare {} with {}",
                type_name(left),
                type_name(right)
            ))
        })
    }

    fn numeric_op<F>(&self, left: &Value, right: &Value, op: F) -> EvalResult<Value>
    where
        F: Fn(f64, f64) -> f64,
    {
        let l = to_number(left)?;
        let r = to_number(right)?;
        Ok(number_to_value(op(l, r)))
    }
}

// ============================================================================
// VALUE HELPERS
// ============================================================================

/// Truthiness used by guards
pub fn truthy(val: &Value) -> bool {
    match val {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().unwrap_or(f64::NAN) == b.as_f64().unwrap_or(f64::NAN)
        }
        _ => left == right,
    }
}

fn to_number(val: &Value) -> EvalResult<f64> {
    match val {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        Value::String(s) => s.parse::<f64>().map_err(|_| {
            EvalError::TypeError(format!("Cannot convert string '{}' to number", s))
        }),
        _ => Err(EvalError::TypeError(format!(
            "Cannot convert {} to number",
            type_name(val)
        ))),
    }
}

fn number_to_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Short JSON type name used in error messages
pub fn type_name(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coercion_error(expected: &str, found: &Value) -> EvalError {
    EvalError::TypeCoercion {
        expected: expected.to_string(),
        found: type_name(found).to_string(),
    }
}

// ============================================================================
// COERCION
// ============================================================================

/// Coerce to an optional string; `null` maps to `None`.
pub fn coerce_optional_string(value: &Value) -> EvalResult<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(coercion_error("string", other)),
    }
}

/// Coerce to a non-null string.
pub fn coerce_string(value: &Value) -> EvalResult<String> {
    coerce_optional_string(value)?.ok_or_else(|| coercion_error("string", value))
}

/// Coerce to a boolean; strings must read "true" or "false".
pub fn coerce_bool(value: &Value) -> EvalResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => s
            .trim()
            .parse::<bool>()
            .map_err(|_| coercion_error("boolean", value)),
        other => Err(coercion_error("boolean", other)),
    }
}

/// Coerce to a UTC timestamp from an RFC 3339 string.
pub fn coerce_timestamp(value: &Value) -> EvalResult<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| EvalError::TypeCoercion {
                expected: "timestamp".to_string(),
                found: format!("string '{}'", s),
            }),
        other => Err(coercion_error("timestamp", other)),
    }
}

/// Extract the `id` field of an object value (variants and requests).
pub fn coerce_object_id(value: &Value, expected: &str) -> EvalResult<String> {
    match value {
        Value::Object(map) => match map.get("id") {
            Some(Value::String(id)) => Ok(id.clone()),
            _ => Err(coercion_error(expected, value)),
        },
        other => Err(coercion_error(expected, other)),
    }
}

// ============================================================================
// CONVENIENCE FUNCTIONS
// ============================================================================

/// Evaluate an expression against a context
pub fn evaluate(expression: &str, context: &EvalContext) -> EvalResult<Value> {
    ExpressionEvaluator::new().evaluate(expression, context)
}

/// Evaluate an expression as a boolean
pub fn evaluate_bool(expression: &str, context: &EvalContext) -> EvalResult<bool> {
    ExpressionEvaluator::new().evaluate_bool(expression, context)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document_context() -> EvalContext {
        EvalContext::new()
            .with_variable("user", json!("alice"))
            .with_variable("draft", json!({ "id": "d-1", "holder": "alice", "state": "draft" }))
            .with_variable("published", Value::Null)
            .with_variable("requests", json!([{ "type": "rejected" }, { "type": "publish" }]))
    }

    #[test]
    fn test_literal_evaluation() {
        let eval = ExpressionEvaluator::new();
        let ctx = EvalContext::new();

        assert_eq!(eval.evaluate("42", &ctx).unwrap(), json!(42.0));
        assert_eq!(eval.evaluate("\"hello\"", &ctx).unwrap(), json!("hello"));
        assert_eq!(eval.evaluate("'single'", &ctx).unwrap(), json!("single"));
        assert_eq!(eval.evaluate("true", &ctx).unwrap(), json!(true));
        assert_eq!(eval.evaluate("null", &ctx).unwrap(), json!(null));
    }

    #[test]
    fn test_path_access() {
        let eval = ExpressionEvaluator::new();
        let ctx = document_context();

        assert_eq!(eval.evaluate("draft.holder", &ctx).unwrap(), json!("alice"));
        assert_eq!(eval.evaluate("requests.1.type", &ctx).unwrap(), json!("publish"));
        assert_eq!(eval.evaluate("published", &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn test_comparison_operators() {
        let eval = ExpressionEvaluator::new();
        let ctx = EvalContext::new()
            .with_variable("a", json!(10))
            .with_variable("b", json!(5));

        assert_eq!(eval.evaluate("a == 10", &ctx).unwrap(), json!(true));
        assert_eq!(eval.evaluate("a != b", &ctx).unwrap(), json!(true));
        assert_eq!(eval.evaluate("a > b", &ctx).unwrap(), json!(true));
        assert_eq!(eval.evaluate("a < b", &ctx).unwrap(), json!(false));
        assert_eq!(eval.evaluate("b <= 5", &ctx).unwrap(), json!(true));
    }

    #[test]
    fn test_timestamp_strings_compare_in_order() {
        let eval = ExpressionEvaluator::new();
        let ctx = EvalContext::new()
            .with_variable("older", json!("2024-03-01T09:00:00Z"))
            .with_variable("newer", json!("2024-03-01T09:00:00.500Z"));

        assert!(eval.evaluate_bool("newer > older", &ctx).unwrap());
        assert!(eval.evaluate_bool("\"abc\" < \"abd\"", &ctx).unwrap());
    }

    #[test]
    fn test_short_circuit_skips_unresolvable_operand() {
        let eval = ExpressionEvaluator::new();
        let ctx = document_context();

        // published is null, so published.holder is never looked at
        assert!(!eval
            .evaluate_bool("published != null && published.holder == user", &ctx)
            .unwrap());
        assert!(eval
            .evaluate_bool("draft != null || missing.value", &ctx)
            .unwrap());
    }

    #[test]
    fn test_unresolved_path_is_an_error() {
        let eval = ExpressionEvaluator::new();
        let ctx = document_context();

        assert!(matches!(
            eval.evaluate("published.holder", &ctx),
            Err(EvalError::UnknownVariable(path)) if path == "published.holder"
        ));
    }

    #[test]
    fn test_functions() {
        let eval = ExpressionEvaluator::new();
        let ctx = document_context();

        assert_eq!(eval.evaluate("exists(draft)", &ctx).unwrap(), json!(true));
        assert_eq!(eval.evaluate("exists(published)", &ctx).unwrap(), json!(false));
        assert_eq!(eval.evaluate("exists(nothing.here)", &ctx).unwrap(), json!(false));
        assert_eq!(eval.evaluate("len(requests)", &ctx).unwrap(), json!(2));
        assert_eq!(eval.evaluate("lower(\"PUBLISH\")", &ctx).unwrap(), json!("publish"));
        assert!(eval.evaluate("now()", &ctx).unwrap().is_string());
        assert!(matches!(
            eval.evaluate("shout(user)", &ctx),
            Err(EvalError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_pinned_now() {
        let eval = ExpressionEvaluator::new();
        let at = DateTime::parse_from_rfc3339("2030-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let ctx = EvalContext::new()
            .with_variable("scheduled", json!("2030-01-01T11:00:00+00:00"))
            .with_now(at);

        assert_eq!(eval.evaluate("now()", &ctx).unwrap(), json!(at.to_rfc3339()));
        assert!(eval.evaluate_bool("scheduled <= now()", &ctx).unwrap());

        let earlier = ctx.with_now(at - chrono::Duration::hours(2));
        assert!(!eval.evaluate_bool("scheduled <= now()", &earlier).unwrap());
    }

    #[test]
    fn test_operator_precedence() {
        let eval = ExpressionEvaluator::new();
        let ctx = EvalContext::new();

        assert_eq!(eval.evaluate("2 + 3 * 4", &ctx).unwrap(), json!(14.0));
        assert_eq!(eval.evaluate("(2 + 3) * 4", &ctx).unwrap(), json!(20.0));
        assert_eq!(eval.evaluate("5 > 3 && 2 < 4", &ctx).unwrap(), json!(true));
        assert_eq!(eval.evaluate("--5", &ctx).unwrap(), json!(5.0));
    }

    #[test]
    fn test_error_handling() {
        let eval = ExpressionEvaluator::new();
        let ctx = EvalContext::new();

        assert!(matches!(
            eval.evaluate("10 / 0", &ctx),
            Err(EvalError::DivisionByZero)
        ));
        assert!(matches!(
            eval.evaluate("", &ctx),
            Err(EvalError::EmptyExpression)
        ));
        assert!(matches!(
            eval.evaluate("a = b", &ctx),
            Err(EvalError::ParseError { .. })
        ));
        assert!(matches!(
            eval.evaluate("1 2", &ctx),
            Err(EvalError::ParseError { .. })
        ));
    }

    #[test]
    fn test_coercion() {
        assert_eq!(coerce_optional_string(&Value::Null).unwrap(), None);
        assert_eq!(coerce_string(&json!("bob")).unwrap(), "bob");
        assert!(coerce_bool(&json!("true")).unwrap());
        assert!(matches!(
            coerce_bool(&json!([1])),
            Err(EvalError::TypeCoercion { .. })
        ));

        let ts = coerce_timestamp(&json!("2024-05-01T12:00:00Z")).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert!(coerce_timestamp(&json!("yesterday")).is_err());

        assert_eq!(
            coerce_object_id(&json!({ "id": "v-1" }), "variant").unwrap(),
            "v-1"
        );
        assert_eq!(
            coerce_object_id(&json!("draft"), "variant"),
            Err(EvalError::TypeCoercion {
                expected: "variant".to_string(),
                found: "string".to_string()
            })
        );
    }
}
