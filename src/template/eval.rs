//! Action parsing and evaluation.
//!
//! ```text
//! pipeline := command ('|' command)*
//! command  := operand+
//! operand  := .field | . | int | string | '(' pipeline ')' | ident
//! ```
//!
//! A piped value is passed as the last argument of the next command.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, SecondsFormat};
use serde_json::Value;
use std::fmt::Write as _;

use super::lexer::Token;

// =============================================================================
// AST
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(Vec<String>),
    Dot,
    Int(i64),
    Str(String),
    Bool(bool),
    Nil,
    Func(Func),
    Group(Pipeline),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub commands: Vec<Command>,
}

/// The fixed function set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Now,
    Today,
    Timestamp,
    Unix,
    FormatDate,
    Add,
    Sub,
}

impl Func {
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "now" => Func::Now,
            "today" => Func::Today,
            "timestamp" => Func::Timestamp,
            "unix" => Func::Unix,
            "formatDate" => Func::FormatDate,
            "add" => Func::Add,
            "sub" => Func::Sub,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Func::Now => "now",
            Func::Today => "today",
            Func::Timestamp => "timestamp",
            Func::Unix => "unix",
            Func::FormatDate => "formatDate",
            Func::Add => "add",
            Func::Sub => "sub",
        }
    }

    fn arity(self) -> usize {
        match self {
            Func::Now | Func::Today | Func::Timestamp | Func::Unix => 0,
            Func::FormatDate | Func::Add | Func::Sub => 2,
        }
    }
}

// =============================================================================
// Parser
// =============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Parse a tokenized action into a pipeline.
pub fn parse(tokens: Vec<Token>) -> Result<Pipeline, String> {
    if tokens.is_empty() {
        return Err("missing value for command".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let pipeline = parser.pipeline()?;
    if let Some(extra) = parser.tokens.get(parser.pos) {
        return Err(format!("unexpected {extra:?} in action"));
    }
    Ok(pipeline)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn pipeline(&mut self) -> Result<Pipeline, String> {
        let mut commands = vec![self.command()?];
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            commands.push(self.command()?);
        }
        Ok(Pipeline { commands })
    }

    fn command(&mut self) -> Result<Command, String> {
        let mut operands = Vec::new();
        while let Some(token) = self.peek() {
            if matches!(token, Token::Pipe | Token::RParen) {
                break;
            }
            operands.push(self.operand()?);
        }
        if operands.is_empty() {
            return Err("missing value for command".to_string());
        }
        Ok(Command { operands })
    }

    fn operand(&mut self) -> Result<Operand, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of action".to_string())?;
        self.pos += 1;
        Ok(match token {
            Token::Field(path) => Operand::Field(path),
            Token::Dot => Operand::Dot,
            Token::Int(n) => Operand::Int(n),
            Token::Str(s) => Operand::Str(s),
            Token::Ident(name) => match name.as_str() {
                "true" => Operand::Bool(true),
                "false" => Operand::Bool(false),
                "nil" => Operand::Nil,
                _ => Operand::Func(
                    Func::lookup(&name).ok_or_else(|| format!("function {name:?} not defined"))?,
                ),
            },
            Token::LParen => {
                let inner = self.pipeline()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err("unclosed left paren".to_string());
                }
                self.pos += 1;
                Operand::Group(inner)
            }
            Token::RParen => return Err("unexpected right paren".to_string()),
            Token::Pipe => return Err("missing command before pipe".to_string()),
        })
    }
}

// =============================================================================
// Values
// =============================================================================

/// Evaluated value: JSON data or a point in time.
#[derive(Debug, Clone, PartialEq)]
pub enum TValue {
    Json(Value),
    Time(DateTime<Local>),
}

impl TValue {
    /// Text as written into the output. Null renders empty.
    pub fn render(&self) -> String {
        match self {
            TValue::Json(Value::Null) => String::new(),
            TValue::Json(Value::String(s)) => s.clone(),
            TValue::Json(other) => other.to_string(),
            TValue::Time(t) => t.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    fn as_int(&self, func: Func) -> Result<i64, String> {
        match self {
            TValue::Json(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| format!("{}: {n} is not an integer", func.name())),
            TValue::Json(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("{}: {s:?} is not an integer", func.name())),
            other => Err(format!("{}: expected integer, got {}", func.name(), other.render())),
        }
    }

    fn as_time(&self, func: Func) -> Result<DateTime<Local>, String> {
        match self {
            TValue::Time(t) => Ok(*t),
            TValue::Json(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Local))
                .map_err(|_| format!("{}: {s:?} is not an RFC 3339 time", func.name())),
            other => Err(format!("{}: expected time, got {}", func.name(), other.render())),
        }
    }
}

// =============================================================================
// Evaluation
// =============================================================================

pub struct Scope<'a> {
    pub data: &'a Value,
    pub now: DateTime<Local>,
}

pub fn eval_pipeline(pipeline: &Pipeline, scope: &Scope<'_>) -> Result<TValue, String> {
    let mut piped: Option<TValue> = None;
    for command in &pipeline.commands {
        piped = Some(eval_command(command, scope, piped.take())?);
    }
    piped.ok_or_else(|| "empty pipeline".to_string())
}

fn eval_command(command: &Command, scope: &Scope<'_>, piped: Option<TValue>) -> Result<TValue, String> {
    let (head, rest) = command
        .operands
        .split_first()
        .ok_or_else(|| "missing value for command".to_string())?;

    if let Operand::Func(func) = head {
        let mut args = rest
            .iter()
            .map(|op| eval_operand(op, scope))
            .collect::<Result<Vec<_>, _>>()?;
        args.extend(piped);
        return call(*func, args, scope.now);
    }

    if !rest.is_empty() || piped.is_some() {
        return Err("can't give argument to non-function".to_string());
    }
    eval_operand(head, scope)
}

fn eval_operand(operand: &Operand, scope: &Scope<'_>) -> Result<TValue, String> {
    Ok(match operand {
        Operand::Field(path) => TValue::Json(lookup_field(scope.data, path)),
        Operand::Dot => TValue::Json(scope.data.clone()),
        Operand::Int(n) => TValue::Json(Value::from(*n)),
        Operand::Str(s) => TValue::Json(Value::String(s.clone())),
        Operand::Bool(b) => TValue::Json(Value::Bool(*b)),
        Operand::Nil => TValue::Json(Value::Null),
        Operand::Func(func) => call(*func, Vec::new(), scope.now)?,
        Operand::Group(inner) => eval_pipeline(inner, scope)?,
    })
}

/// Missing keys resolve to null.
fn lookup_field(data: &Value, path: &[String]) -> Value {
    let mut current = data;
    for segment in path {
        match current.get(segment.as_str()) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn call(func: Func, args: Vec<TValue>, now: DateTime<Local>) -> Result<TValue, String> {
    if args.len() != func.arity() {
        return Err(format!(
            "wrong number of args for {}: want {} got {}",
            func.name(),
            func.arity(),
            args.len()
        ));
    }
    Ok(match func {
        Func::Now => TValue::Time(now),
        Func::Today => TValue::Json(Value::String(now.format("%Y-%m-%d").to_string())),
        Func::Timestamp => TValue::Json(Value::String(
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
        )),
        Func::Unix => TValue::Json(Value::from(now.timestamp())),
        Func::FormatDate => {
            let time = args[0].as_time(func)?;
            let layout = match &args[1] {
                TValue::Json(Value::String(s)) => s.clone(),
                other => return Err(format!("formatDate: layout must be a string, got {}", other.render())),
            };
            TValue::Json(Value::String(format_date(&time, &layout)?))
        }
        Func::Add => {
            let (a, b) = (args[0].as_int(func)?, args[1].as_int(func)?);
            TValue::Json(Value::from(
                a.checked_add(b).ok_or_else(|| "add: integer overflow".to_string())?,
            ))
        }
        Func::Sub => {
            let (a, b) = (args[0].as_int(func)?, args[1].as_int(func)?);
            TValue::Json(Value::from(
                a.checked_sub(b).ok_or_else(|| "sub: integer overflow".to_string())?,
            ))
        }
    })
}

// =============================================================================
// Date layouts
// =============================================================================

/// Format with a strftime layout (contains `%`) or a reference-date layout
/// such as `2006-01-02 15:04`.
pub fn format_date(time: &DateTime<Local>, layout: &str) -> Result<String, String> {
    let strftime = if layout.contains('%') {
        layout.to_string()
    } else {
        translate_reference_layout(layout)
    };
    let items: Vec<Item<'_>> = StrftimeItems::new(&strftime).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(format!("formatDate: invalid layout {layout:?}"));
    }
    let mut out = String::new();
    write!(out, "{}", time.format_with_items(items.into_iter()))
        .map_err(|_| format!("formatDate: cannot format with {layout:?}"))?;
    Ok(out)
}

// Longest tokens first.
const REFERENCE_TOKENS: &[(&str, &str)] = &[
    ("Z07:00", "%:z"),
    ("-07:00", "%:z"),
    ("-0700", "%z"),
    (".000000000", "%.9f"),
    (".999999999", "%.9f"),
    (".000000", "%.6f"),
    (".000", "%.3f"),
    ("January", "%B"),
    ("Monday", "%A"),
    ("2006", "%Y"),
    ("Jan", "%b"),
    ("Mon", "%a"),
    ("MST", "%Z"),
    ("_2", "%e"),
    ("01", "%m"),
    ("02", "%d"),
    ("03", "%I"),
    ("04", "%M"),
    ("05", "%S"),
    ("06", "%y"),
    ("15", "%H"),
    ("PM", "%p"),
    ("pm", "%P"),
    ("1", "%-m"),
    ("2", "%-d"),
    ("3", "%-I"),
    ("4", "%-M"),
    ("5", "%-S"),
];

fn translate_reference_layout(layout: &str) -> String {
    let mut out = String::with_capacity(layout.len() * 2);
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (token, strftime) in REFERENCE_TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(strftime);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }
    out
}
