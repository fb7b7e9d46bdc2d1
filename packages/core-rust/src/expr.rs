//! Operator expression language.
//!
//! Operators carry their configuration as a string expression. Two forms are
//! compiled here:
//!
//! - [`Expr`]: a single value expression, used as a predicate (`filter`), a
//!   dedup key (`dedup`), or a correlation key (`joiner`).
//! - [`Program`]: `;`-separated assignments applied to a message (`transform`).
//!
//! ```text
//! prop.region == 'eu' && len(body) > 0
//! prop.seq % 2 == 1
//! body = upper(body); prop.routed = 'yes'; unset prop.trace
//! ```
//!
//! Property values are strings; arithmetic and comparisons against integers
//! coerce numeric strings. A missing property evaluates to `null`.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::iter::Peekable;
use std::str::CharIndices;

use regex::Regex;

use crate::message::Message;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Runtime value produced by evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the value's type, for error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Interprets the value as a predicate result. `null` is false.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::Type`] for non-boolean, non-null values.
    pub fn truthy(&self) -> Result<bool, ExprError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Null => Ok(false),
            other => Err(ExprError::Type {
                op: "predicate",
                detail: other.type_name().to_string(),
            }),
        }
    }

    /// Textual rendering used when a value is written into a property or body.
    #[must_use]
    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            Value::Null => Cow::Borrowed(""),
            Value::Bool(b) => Cow::Owned(b.to_string()),
            Value::Int(i) => Cow::Owned(i.to_string()),
            Value::Str(s) => Cow::Borrowed(s),
            Value::Bytes(b) => String::from_utf8_lossy(b),
        }
    }

    /// Consumes the value into body bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Value::Bytes(b) => b,
            Value::Str(s) => s.into_bytes(),
            other => other.to_text().into_owned().into_bytes(),
        }
    }

    /// Stable encoding for hashing and key comparison.
    ///
    /// Strings and bytes with the same content encode identically, matching
    /// the equality used by `==`.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Value::Null => vec![0],
            Value::Bool(b) => vec![1, u8::from(*b)],
            Value::Int(i) => {
                let mut out = vec![2];
                out.extend_from_slice(&i.to_be_bytes());
                out
            }
            Value::Str(s) => {
                let mut out = vec![3];
                out.extend_from_slice(s.as_bytes());
                out
            }
            Value::Bytes(b) => {
                let mut out = vec![3];
                out.extend_from_slice(b);
                out
            }
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            Value::Null | Value::Bool(_) => None,
        }
    }

    fn as_raw(&self) -> Cow<'_, [u8]> {
        match self {
            Value::Str(s) => Cow::Borrowed(s.as_bytes()),
            Value::Bytes(b) => Cow::Borrowed(b),
            other => Cow::Owned(other.to_text().into_owned().into_bytes()),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("type error: `{op}` cannot be applied to {detail}")]
    Type { op: &'static str, detail: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow in `{op}`")]
    Overflow { op: &'static str },
}

fn parse_error(offset: usize, message: impl Into<String>) -> ExprError {
    ExprError::Parse {
        offset,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Semi,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

struct Lexer<'a> {
    src: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn next_if(&mut self, expected: char) -> bool {
        self.chars.next_if(|&(_, c)| c == expected).is_some()
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, ExprError> {
        let mut tokens = Vec::new();
        while let Some((offset, c)) = self.chars.next() {
            let token = match c {
                c if c.is_whitespace() => continue,
                '(' => Token::LParen,
                ')' => Token::RParen,
                '[' => Token::LBracket,
                ']' => Token::RBracket,
                ',' => Token::Comma,
                '.' => Token::Dot,
                ';' => Token::Semi,
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '%' => Token::Percent,
                '=' if self.next_if('=') => Token::Eq,
                '=' if self.next_if('~') => Token::Match,
                '=' => Token::Assign,
                '!' if self.next_if('=') => Token::Ne,
                '!' => Token::Not,
                '<' if self.next_if('=') => Token::Le,
                '<' => Token::Lt,
                '>' if self.next_if('=') => Token::Ge,
                '>' => Token::Gt,
                '&' if self.next_if('&') => Token::And,
                '|' if self.next_if('|') => Token::Or,
                '\'' | '"' => Token::Str(self.string(offset, c)?),
                c if c.is_ascii_digit() => self.integer(offset)?,
                c if c.is_ascii_alphabetic() || c == '_' => self.ident(offset),
                other => return Err(parse_error(offset, format!("unexpected character `{other}`"))),
            };
            tokens.push((token, offset));
        }
        Ok(tokens)
    }

    fn string(&mut self, start: usize, quote: char) -> Result<String, ExprError> {
        let mut out = String::new();
        while let Some((offset, c)) = self.chars.next() {
            match c {
                c if c == quote => return Ok(out),
                '\\' => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, escaped @ ('\\' | '\'' | '"'))) => out.push(escaped),
                    Some((_, other)) => {
                        return Err(parse_error(offset, format!("unknown escape `\\{other}`")))
                    }
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(parse_error(start, "unterminated string literal"))
    }

    fn scan_while(&mut self, start: usize, pred: impl Fn(char) -> bool) -> &'a str {
        let mut end = start + 1;
        while let Some(&(offset, c)) = self.chars.peek() {
            if !pred(c) {
                break;
            }
            end = offset + c.len_utf8();
            self.chars.next();
        }
        &self.src[start..end]
    }

    fn integer(&mut self, start: usize) -> Result<Token, ExprError> {
        let text = self.scan_while(start, |c| c.is_ascii_digit());
        text.parse()
            .map(Token::Int)
            .map_err(|_| parse_error(start, format!("integer literal `{text}` out of range")))
    }

    fn ident(&mut self, start: usize) -> Token {
        let text = self.scan_while(start, |c| c.is_ascii_alphanumeric() || c == '_');
        Token::Ident(text.to_string())
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A readable message field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Body,
    Topic,
    Property(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Len,
    Upper,
    Lower,
    Concat,
    Contains,
    StartsWith,
    Exists,
    Int,
    Str,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Func::Len,
            "upper" => Func::Upper,
            "lower" => Func::Lower,
            "concat" => Func::Concat,
            "contains" => Func::Contains,
            "starts_with" => Func::StartsWith,
            "exists" => Func::Exists,
            "int" => Func::Int,
            "str" => Func::Str,
            _ => return None,
        })
    }

    fn accepts(self, argc: usize) -> bool {
        match self {
            Func::Concat => argc >= 1,
            Func::Contains | Func::StartsWith => argc == 2,
            _ => argc == 1,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Literal(Value),
    Field(Field),
    Not(Box<Node>),
    Neg(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Matches(Box<Node>, Regex),
    Call(Func, Vec<Node>),
}

#[derive(Debug, Clone)]
enum Statement {
    Assign(Field, Node),
    Unset(String),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Deepest allowed nesting of parentheses, calls and unary operators.
const MAX_NESTING: usize = 128;
/// Most binary operators one source may chain.
const MAX_OPERATORS: usize = 1024;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    depth: usize,
    operators: usize,
}

impl Parser {
    fn new(src: &str) -> Result<Self, ExprError> {
        Ok(Self {
            tokens: Lexer::new(src).tokenize()?,
            pos: 0,
            end: src.len(),
            depth: 0,
            operators: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, o)| *o)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ExprError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(parse_error(self.offset(), format!("expected {what}")))
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn expression(&mut self) -> Result<Node, ExprError> {
        self.nested(Self::or)
    }

    /// Runs `parse` one level deeper, failing instead of exhausting the stack.
    fn nested(&mut self, parse: fn(&mut Self) -> Result<Node, ExprError>) -> Result<Node, ExprError> {
        if self.depth >= MAX_NESTING {
            return Err(parse_error(
                self.offset(),
                format!("expression nested deeper than {MAX_NESTING} levels"),
            ));
        }
        self.depth += 1;
        let node = parse(self);
        self.depth -= 1;
        node
    }

    /// Counts one binary operator against the per-source limit.
    fn chain(&mut self) -> Result<(), ExprError> {
        self.operators += 1;
        if self.operators > MAX_OPERATORS {
            return Err(parse_error(
                self.offset(),
                format!("more than {MAX_OPERATORS} operators"),
            ));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            self.chain()?;
            lhs = Node::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.comparison()?;
        while self.eat(&Token::And) {
            self.chain()?;
            lhs = Node::And(Box::new(lhs), Box::new(self.comparison()?));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Node, ExprError> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Match) => {
                self.pos += 1;
                let offset = self.offset();
                let Some(Token::Str(pattern)) = self.advance() else {
                    return Err(parse_error(offset, "`=~` expects a string literal pattern"));
                };
                let regex = Regex::new(&pattern)
                    .map_err(|e| parse_error(offset, format!("invalid regex: {e}")))?;
                return Ok(Node::Matches(Box::new(lhs), regex));
            }
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            self.chain()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(self.term()?));
        }
    }

    fn term(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            self.chain()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        if self.eat(&Token::Not) {
            return Ok(Node::Not(Box::new(self.nested(Self::unary)?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Node::Neg(Box::new(self.nested(Self::unary)?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Int(i)) => Ok(Node::Literal(Value::Int(i))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::Str(s))),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(&Token::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.identifier(name, offset),
            Some(other) => Err(parse_error(offset, format!("unexpected token {other:?}"))),
            None => Err(parse_error(offset, "unexpected end of expression")),
        }
    }

    fn identifier(&mut self, name: String, offset: usize) -> Result<Node, ExprError> {
        match name.as_str() {
            "true" => return Ok(Node::Literal(Value::Bool(true))),
            "false" => return Ok(Node::Literal(Value::Bool(false))),
            "null" => return Ok(Node::Literal(Value::Null)),
            _ => {}
        }
        if self.eat(&Token::LParen) {
            let func = Func::lookup(&name)
                .ok_or_else(|| parse_error(offset, format!("unknown function `{name}`")))?;
            let mut args = Vec::new();
            if !self.eat(&Token::RParen) {
                loop {
                    args.push(self.expression()?);
                    if self.eat(&Token::RParen) {
                        break;
                    }
                    self.expect(&Token::Comma, "`,` or `)`")?;
                }
            }
            if !func.accepts(args.len()) {
                return Err(parse_error(
                    offset,
                    format!("`{name}` does not take {} argument(s)", args.len()),
                ));
            }
            return Ok(Node::Call(func, args));
        }
        self.field_after(&name, offset).map(Node::Field)
    }

    fn field_after(&mut self, name: &str, offset: usize) -> Result<Field, ExprError> {
        match name {
            "body" => Ok(Field::Body),
            "topic" => Ok(Field::Topic),
            "prop" => {
                if self.eat(&Token::Dot) {
                    let at = self.offset();
                    match self.advance() {
                        Some(Token::Ident(key)) => Ok(Field::Property(key)),
                        _ => Err(parse_error(at, "expected property name after `prop.`")),
                    }
                } else if self.eat(&Token::LBracket) {
                    let at = self.offset();
                    let Some(Token::Str(key)) = self.advance() else {
                        return Err(parse_error(at, "expected quoted property name"));
                    };
                    self.expect(&Token::RBracket, "`]`")?;
                    Ok(Field::Property(key))
                } else {
                    Err(parse_error(offset, "expected `.` or `[` after `prop`"))
                }
            }
            other => Err(parse_error(offset, format!("unknown identifier `{other}`"))),
        }
    }

    fn statement(&mut self) -> Result<Statement, ExprError> {
        let offset = self.offset();
        let Some(Token::Ident(name)) = self.advance() else {
            return Err(parse_error(offset, "expected assignment target"));
        };
        if name == "unset" {
            let at = self.offset();
            let Some(Token::Ident(target)) = self.advance() else {
                return Err(parse_error(at, "expected property after `unset`"));
            };
            return match self.field_after(&target, at)? {
                Field::Property(key) => Ok(Statement::Unset(key)),
                _ => Err(parse_error(at, "only properties can be unset")),
            };
        }
        let target = self.field_after(&name, offset)?;
        if target == Field::Topic {
            return Err(parse_error(offset, "`topic` is read-only"));
        }
        self.expect(&Token::Assign, "`=`")?;
        Ok(Statement::Assign(target, self.expression()?))
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(node: &Node, msg: &Message) -> Result<Value, ExprError> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Field(Field::Body) => Ok(Value::Bytes(msg.body.clone())),
        Node::Field(Field::Topic) => Ok(Value::Str(msg.topic.clone())),
        Node::Field(Field::Property(key)) => Ok(msg
            .property(key)
            .map_or(Value::Null, |v| Value::Str(v.to_string()))),
        Node::Not(inner) => Ok(Value::Bool(!eval(inner, msg)?.truthy()?)),
        Node::Neg(inner) => {
            let value = eval(inner, msg)?;
            let i = value.as_int().ok_or_else(|| ExprError::Type {
                op: "-",
                detail: value.type_name().to_string(),
            })?;
            i.checked_neg()
                .map(Value::Int)
                .ok_or(ExprError::Overflow { op: "-" })
        }
        Node::And(lhs, rhs) => Ok(Value::Bool(
            eval(lhs, msg)?.truthy()? && eval(rhs, msg)?.truthy()?,
        )),
        Node::Or(lhs, rhs) => Ok(Value::Bool(
            eval(lhs, msg)?.truthy()? || eval(rhs, msg)?.truthy()?,
        )),
        Node::Matches(inner, regex) => {
            let value = eval(inner, msg)?;
            Ok(Value::Bool(!value.is_null() && regex.is_match(&value.to_text())))
        }
        Node::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, msg)?;
            let rhs = eval(rhs, msg)?;
            match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                    arithmetic(*op, &lhs, &rhs)
                }
                _ => compare(*op, &lhs, &rhs).map(Value::Bool),
            }
        }
        Node::Call(func, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, msg))
                .collect::<Result<Vec<_>, _>>()?;
            call(*func, args)
        }
    }
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
    }
}

fn arithmetic(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, ExprError> {
    let symbol = op_symbol(op);
    let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) else {
        return Err(ExprError::Type {
            op: symbol,
            detail: format!("{} and {}", lhs.type_name(), rhs.type_name()),
        });
    };
    let result = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div | BinOp::Rem if b == 0 => return Err(ExprError::DivisionByZero),
        BinOp::Div => a.checked_div(b),
        BinOp::Rem => a.checked_rem(b),
        _ => unreachable!("comparison operators are handled by compare()"),
    };
    result.map(Value::Int).ok_or(ExprError::Overflow { op: symbol })
}

fn compare(op: BinOp, lhs: &Value, rhs: &Value) -> Result<bool, ExprError> {
    let ordering = match (lhs, rhs) {
        (Value::Null, _) | (_, Value::Null) => {
            let both = lhs.is_null() && rhs.is_null();
            return Ok(match op {
                BinOp::Eq => both,
                BinOp::Ne => !both,
                _ => false,
            });
        }
        (Value::Bool(a), Value::Bool(b)) if matches!(op, BinOp::Eq | BinOp::Ne) => a.cmp(b),
        (Value::Bool(_), _) | (_, Value::Bool(_)) => {
            return match op {
                BinOp::Eq => Ok(false),
                BinOp::Ne => Ok(true),
                _ => Err(ExprError::Type {
                    op: op_symbol(op),
                    detail: format!("{} and {}", lhs.type_name(), rhs.type_name()),
                }),
            };
        }
        (Value::Int(_), _) | (_, Value::Int(_)) => match (lhs.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => lhs.as_raw().cmp(&rhs.as_raw()),
        },
        _ => lhs.as_raw().cmp(&rhs.as_raw()),
    };
    Ok(match op {
        BinOp::Eq => ordering == Ordering::Equal,
        BinOp::Ne => ordering != Ordering::Equal,
        BinOp::Lt => ordering == Ordering::Less,
        BinOp::Le => ordering != Ordering::Greater,
        BinOp::Gt => ordering == Ordering::Greater,
        BinOp::Ge => ordering != Ordering::Less,
        _ => unreachable!("arithmetic operators are handled by arithmetic()"),
    })
}

fn call(func: Func, mut args: Vec<Value>) -> Result<Value, ExprError> {
    let first = args.first().cloned().unwrap_or(Value::Null);
    Ok(match func {
        Func::Len => match &first {
            Value::Null => Value::Int(0),
            Value::Bytes(b) => Value::Int(i64::try_from(b.len()).unwrap_or(i64::MAX)),
            Value::Bool(_) => {
                return Err(ExprError::Type {
                    op: "len",
                    detail: "bool".to_string(),
                })
            }
            other => Value::Int(i64::try_from(other.to_text().chars().count()).unwrap_or(i64::MAX)),
        },
        Func::Upper if first.is_null() => Value::Null,
        Func::Upper => Value::Str(first.to_text().to_uppercase()),
        Func::Lower if first.is_null() => Value::Null,
        Func::Lower => Value::Str(first.to_text().to_lowercase()),
        Func::Concat => Value::Str(args.iter().map(Value::to_text).collect()),
        Func::Contains | Func::StartsWith => {
            let needle = args.pop().unwrap_or(Value::Null);
            if first.is_null() {
                return Ok(Value::Bool(false));
            }
            let haystack = first.to_text();
            let needle = needle.to_text();
            Value::Bool(if func == Func::Contains {
                haystack.contains(needle.as_ref())
            } else {
                haystack.starts_with(needle.as_ref())
            })
        }
        Func::Exists => Value::Bool(!first.is_null()),
        Func::Int if first.is_null() => Value::Null,
        Func::Int => Value::Int(first.as_int().ok_or_else(|| ExprError::Type {
            op: "int",
            detail: first.type_name().to_string(),
        })?),
        Func::Str if first.is_null() => Value::Null,
        Func::Str => Value::Str(first.to_text().into_owned()),
    })
}

// ---------------------------------------------------------------------------
// Public compiled forms
// ---------------------------------------------------------------------------

/// A compiled value expression.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    /// Compiles `source` into an expression.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::Parse`] if the source is empty or malformed.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut parser = Parser::new(source)?;
        if parser.at_end() {
            return Err(parse_error(0, "empty expression"));
        }
        let root = parser.expression()?;
        if !parser.at_end() {
            return Err(parse_error(parser.offset(), "unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Evaluates the expression against a message.
    ///
    /// # Errors
    ///
    /// Returns a type, overflow, or division error raised during evaluation.
    pub fn eval(&self, msg: &Message) -> Result<Value, ExprError> {
        eval(&self.root, msg)
    }

    /// Evaluates the expression as a predicate. `null` is false.
    ///
    /// # Errors
    ///
    /// Returns an error if evaluation fails or yields a non-boolean value.
    pub fn matches(&self, msg: &Message) -> Result<bool, ExprError> {
        self.eval(msg)?.truthy()
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// A compiled sequence of assignments applied to a message in order.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    statements: Vec<Statement>,
}

impl Program {
    /// Compiles a `;`-separated assignment program.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::Parse`] if the program is malformed or has no statements.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut parser = Parser::new(source)?;
        let mut statements = Vec::new();
        while !parser.at_end() {
            if parser.eat(&Token::Semi) {
                continue;
            }
            statements.push(parser.statement()?);
            if !parser.at_end() {
                parser.expect(&Token::Semi, "`;`")?;
            }
        }
        if statements.is_empty() {
            return Err(parse_error(0, "empty program"));
        }
        Ok(Self {
            source: source.to_string(),
            statements,
        })
    }

    /// Applies every statement in order. Each statement observes the effects
    /// of the ones before it. On error the message may be partially rewritten.
    ///
    /// # Errors
    ///
    /// Returns the first evaluation error.
    pub fn apply(&self, msg: &mut Message) -> Result<(), ExprError> {
        for statement in &self.statements {
            match statement {
                Statement::Assign(Field::Body, node) => {
                    msg.body = eval(node, msg)?.into_bytes();
                }
                Statement::Assign(Field::Property(key), node) => match eval(node, msg)? {
                    Value::Null => {
                        msg.properties.remove(key);
                    }
                    value => {
                        msg.properties
                            .insert(key.clone(), value.to_text().into_owned());
                    }
                },
                Statement::Assign(Field::Topic, _) => {
                    unreachable!("parser rejects assignments to topic")
                }
                Statement::Unset(key) => {
                    msg.properties.remove(key);
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        Message::new("orders", "hello world")
            .with_property("seq", "7")
            .with_property("region", "eu-west")
            .with_property("x-trace", "abc")
    }

    fn eval_str(src: &str) -> Value {
        Expr::parse(src).unwrap().eval(&msg()).unwrap()
    }

    #[test]
    fn property_and_literal_comparisons() {
        assert_eq!(eval_str("prop.region == 'eu-west'"), Value::Bool(true));
        assert_eq!(eval_str("prop[\"x-trace\"] != \"abc\""), Value::Bool(false));
        assert_eq!(eval_str("topic == 'orders'"), Value::Bool(true));
        assert_eq!(eval_str("body == 'hello world'"), Value::Bool(true));
    }

    #[test]
    fn numeric_strings_coerce_in_arithmetic() {
        assert_eq!(eval_str("prop.seq % 2"), Value::Int(1));
        assert_eq!(eval_str("prop.seq * 2 + 1 == 15"), Value::Bool(true));
        assert_eq!(eval_str("prop.seq > 10"), Value::Bool(false));
        assert_eq!(eval_str("-prop.seq"), Value::Int(-7));
    }

    #[test]
    fn precedence_and_short_circuit() {
        assert_eq!(eval_str("1 + 2 * 3"), Value::Int(7));
        assert_eq!(eval_str("(1 + 2) * 3"), Value::Int(9));
        // rhs would be a type error if evaluated
        assert_eq!(eval_str("false && (body + 1 == 2)"), Value::Bool(false));
        assert_eq!(eval_str("true || (body + 1 == 2)"), Value::Bool(true));
        assert_eq!(eval_str("!(prop.seq == 7)"), Value::Bool(false));
    }

    #[test]
    fn missing_property_is_null() {
        assert_eq!(eval_str("prop.nope"), Value::Null);
        assert_eq!(eval_str("prop.nope == null"), Value::Bool(true));
        assert_eq!(eval_str("prop.nope > 1"), Value::Bool(false));
        assert_eq!(eval_str("exists(prop.nope)"), Value::Bool(false));
        assert!(!Expr::parse("prop.nope").unwrap().matches(&msg()).unwrap());
    }

    #[test]
    fn regex_and_functions() {
        assert_eq!(eval_str("prop.region =~ '^eu-'"), Value::Bool(true));
        assert_eq!(eval_str("len(body)"), Value::Int(11));
        assert_eq!(eval_str("upper(prop.region)"), Value::Str("EU-WEST".into()));
        assert_eq!(
            eval_str("concat(topic, ':', prop.seq)"),
            Value::Str("orders:7".into())
        );
        assert_eq!(eval_str("contains(body, 'lo w')"), Value::Bool(true));
        assert_eq!(eval_str("starts_with(body, 'world')"), Value::Bool(false));
        assert_eq!(eval_str("int(prop.seq) + 1"), Value::Int(8));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let depth = 3_000;
        let parens = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(matches!(Expr::parse(&parens), Err(ExprError::Parse { .. })));
        let negations = format!("{}true", "!".repeat(depth));
        assert!(matches!(Expr::parse(&negations), Err(ExprError::Parse { .. })));
        let chain = vec!["1"; depth].join(" + ");
        assert!(matches!(Expr::parse(&chain), Err(ExprError::Parse { .. })));
        let calls = format!("{}body{}", "upper(".repeat(depth), ")".repeat(depth));
        assert!(Program::parse(&format!("body = {calls}")).is_err());

        let shallow = format!("{}1{}", "(".repeat(64), ")".repeat(64));
        assert_eq!(eval_str(&shallow), Value::Int(1));
    }

    #[test]
    fn parse_errors_carry_offsets() {
        assert!(matches!(Expr::parse(""), Err(ExprError::Parse { offset: 0, .. })));
        assert!(matches!(
            Expr::parse("prop.a ==="),
            Err(ExprError::Parse { .. })
        ));
        assert!(matches!(
            Expr::parse("nope(1)"),
            Err(ExprError::Parse { offset: 0, .. })
        ));
        assert!(matches!(
            Expr::parse("prop.a =~ prop.b"),
            Err(ExprError::Parse { .. })
        ));
        assert!(matches!(Expr::parse("'open"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expr::parse("len()"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expr::parse("1 2"), Err(ExprError::Parse { offset: 2, .. })));
    }

    #[test]
    fn runtime_errors() {
        let m = msg();
        assert_eq!(
            Expr::parse("1 / (prop.seq - 7)").unwrap().eval(&m),
            Err(ExprError::DivisionByZero)
        );
        assert!(matches!(
            Expr::parse("prop.region + 1").unwrap().eval(&m),
            Err(ExprError::Type { op: "+", .. })
        ));
        assert!(matches!(
            Expr::parse("prop.seq").unwrap().matches(&m),
            Err(ExprError::Type { op: "predicate", .. })
        ));
    }

    #[test]
    fn program_applies_statements_in_order() {
        let program =
            Program::parse("body = upper(body); prop.len = len(body); unset prop.x-trace;")
                .unwrap_err();
        // `-` is not part of identifiers; bracket syntax is required
        assert!(matches!(program, ExprError::Parse { .. }));

        let program = Program::parse(
            "body = upper(body); prop.len = len(body); unset prop[\"x-trace\"]; prop.seq = null",
        )
        .unwrap();
        let mut m = msg();
        program.apply(&mut m).unwrap();
        assert_eq!(m.body, b"HELLO WORLD");
        assert_eq!(m.property("len"), Some("11"));
        assert_eq!(m.property("x-trace"), None);
        assert_eq!(m.property("seq"), None);
        assert_eq!(m.property("region"), Some("eu-west"));
    }

    #[test]
    fn program_rejects_topic_and_empty() {
        assert!(Program::parse("topic = 'x'").is_err());
        assert!(Program::parse(" ; ").is_err());
        assert!(Program::parse("prop.a 1").is_err());
    }

    #[test]
    fn canonical_bytes_equate_strings_and_bytes() {
        assert_eq!(
            Value::Str("ab".into()).canonical_bytes(),
            Value::Bytes(b"ab".to_vec()).canonical_bytes()
        );
        assert_ne!(
            Value::Int(1).canonical_bytes(),
            Value::Str("1".into()).canonical_bytes()
        );
    }

    proptest::proptest! {
        #[test]
        fn parse_never_panics(src in "[a-z0-9 ()+*%=!<>&|'._\\[\\]-]{0,48}") {
            let _ = Expr::parse(&src);
            let _ = Program::parse(&src);
        }

        #[test]
        fn integer_arithmetic_matches_i64(a in 0i64..1_000_000, b in 1i64..1_000) {
            let src = format!("{a} + {b} * 3 - {a} % {b}");
            proptest::prop_assert_eq!(
                Expr::parse(&src).unwrap().eval(&msg()).unwrap(),
                Value::Int(a + b * 3 - a % b)
            );
        }
    }
}
