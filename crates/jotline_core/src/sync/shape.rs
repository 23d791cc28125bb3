//! Shape log decoding.
//!
//! # Responsibility
//! - Decode the JSON message array returned by a shape request.
//! - Convert wire column values into typed JSON using the shape schema.
//!
//! # Invariants
//! - Column values arrive in Postgres text form; only `timestamptz` (and
//!   plain `timestamp`) receive custom date parsing, other types map to the
//!   matching JSON scalar.
//! - Unknown control messages are skipped, unknown operations are errors.

use crate::model::record::{ServerId, TxId};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

static KEY_PK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"/"((?:[^"]|"")*)"$"#).expect("valid shape key regex"));

pub type ShapeResult<T> = Result<T, ShapeError>;

/// Shape decoding and transport errors.
#[derive(Debug)]
pub enum ShapeError {
    /// Body or header is not valid JSON of the expected form.
    Json(serde_json::Error),
    /// A column value could not be parsed for its declared type.
    InvalidValue {
        column: String,
        column_type: String,
        value: String,
    },
    /// A change message carried an unsupported operation.
    UnknownOperation(String),
    /// A change message had no usable primary key.
    MissingKey,
    /// Feed request failed.
    Transport(reqwest::Error),
    /// Feed request returned an unexpected status.
    Status(u16),
    /// Feed response was missing a protocol header.
    MissingHeader(&'static str),
}

impl Display for ShapeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(err) => write!(f, "invalid shape json: {err}"),
            Self::InvalidValue {
                column,
                column_type,
                value,
            } => write!(
                f,
                "column `{column}` value `{value}` is not a valid {column_type}"
            ),
            Self::UnknownOperation(op) => write!(f, "unknown shape operation `{op}`"),
            Self::MissingKey => write!(f, "shape change message has no primary key"),
            Self::Transport(err) => write!(f, "shape request failed: {err}"),
            Self::Status(status) => write!(f, "shape request returned status {status}"),
            Self::MissingHeader(name) => write!(f, "shape response missing header `{name}`"),
        }
    }
}

impl Error for ShapeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ShapeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<reqwest::Error> for ShapeError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value)
    }
}

/// Row operation of a change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeOperation {
    Insert,
    /// Carries the primary key plus changed columns only.
    Update,
    Delete,
}

/// One decoded shape log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeMessage {
    Change {
        operation: ShapeOperation,
        id: ServerId,
        value: Map<String, Value>,
        txids: Vec<TxId>,
    },
    /// The client has caught up with the server log.
    UpToDate,
    /// The shape was reset server-side; local synced state must be dropped.
    MustRefetch,
}

/// Messages received from one feed request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeBatch {
    pub messages: Vec<ShapeMessage>,
}

impl ShapeBatch {
    pub fn new(messages: Vec<ShapeMessage>) -> Self {
        Self { messages }
    }

    pub fn is_up_to_date(&self) -> bool {
        self.messages
            .iter()
            .any(|message| matches!(message, ShapeMessage::UpToDate))
    }
}

/// Declared Postgres type of one shape column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Float,
    Bool,
    Text,
    Json,
    Timestamptz,
    Timestamp,
    Other(String),
}

impl ColumnType {
    pub fn from_pg(name: &str) -> Self {
        match name {
            "int2" | "int4" | "int8" | "oid" => Self::Int,
            "float4" | "float8" | "numeric" => Self::Float,
            "bool" => Self::Bool,
            "text" | "varchar" | "bpchar" | "uuid" => Self::Text,
            "json" | "jsonb" => Self::Json,
            "timestamptz" => Self::Timestamptz,
            "timestamp" => Self::Timestamp,
            other => Self::Other(other.to_string()),
        }
    }

    fn label(&self) -> &str {
        match self {
            Self::Int => "integer",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Text => "text",
            Self::Json => "json",
            Self::Timestamptz => "timestamptz",
            Self::Timestamp => "timestamp",
            Self::Other(name) => name.as_str(),
        }
    }
}

/// Column name to type mapping from the `electric-schema` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeSchema {
    columns: HashMap<String, ColumnType>,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    #[serde(rename = "type")]
    pg_type: String,
}

impl ShapeSchema {
    /// Parses the schema header value: `{"id":{"type":"int4"}, ...}`.
    pub fn from_header(raw: &str) -> ShapeResult<Self> {
        let parsed: HashMap<String, RawColumn> = serde_json::from_str(raw)?;
        Ok(Self {
            columns: parsed
                .into_iter()
                .map(|(name, column)| (name, ColumnType::from_pg(&column.pg_type)))
                .collect(),
        })
    }

    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    pub fn column_type(&self, name: &str) -> Option<&ColumnType> {
        self.columns.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Parser for timestamp-with-timezone wire values.
pub type TimestamptzParser = fn(&str) -> Option<DateTime<Utc>>;

/// Per-type value conversion used while decoding change messages.
#[derive(Debug, Clone, Copy)]
pub struct ValueParser {
    timestamptz: TimestamptzParser,
}

impl Default for ValueParser {
    fn default() -> Self {
        Self {
            timestamptz: parse_timestamptz,
        }
    }
}

impl ValueParser {
    /// Replaces the `timestamptz` conversion.
    pub fn with_timestamptz(mut self, parser: TimestamptzParser) -> Self {
        self.timestamptz = parser;
        self
    }

    /// Converts one wire value to its typed JSON form.
    ///
    /// Values that are already typed JSON (numbers, booleans) pass through.
    pub fn parse(&self, column: &str, column_type: &ColumnType, raw: Value) -> ShapeResult<Value> {
        let text = match raw {
            Value::String(text) => text,
            other => return Ok(other),
        };
        let invalid = |text: &str| ShapeError::InvalidValue {
            column: column.to_string(),
            column_type: column_type.label().to_string(),
            value: text.to_string(),
        };

        match column_type {
            ColumnType::Int => text
                .trim()
                .parse::<i64>()
                .map(|value| Value::Number(value.into()))
                .map_err(|_| invalid(&text)),
            ColumnType::Float => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid(&text)),
            ColumnType::Bool => match text.trim() {
                "t" | "true" => Ok(Value::Bool(true)),
                "f" | "false" => Ok(Value::Bool(false)),
                _ => Err(invalid(&text)),
            },
            ColumnType::Json => serde_json::from_str(&text).map_err(|_| invalid(&text)),
            ColumnType::Timestamptz => (self.timestamptz)(&text)
                .map(timestamp_value)
                .ok_or_else(|| invalid(&text)),
            ColumnType::Timestamp => parse_naive_timestamp(&text)
                .map(timestamp_value)
                .ok_or_else(|| invalid(&text)),
            ColumnType::Text | ColumnType::Other(_) => Ok(Value::String(text)),
        }
    }
}

/// Parses a wire `timestamptz` value into UTC.
///
/// Accepts RFC 3339 and the Postgres text form
/// (`2024-05-01 08:30:00.123456+00`, `+05:30` offsets, optional fraction).
pub fn parse_timestamptz(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn parse_naive_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn timestamp_value(value: DateTime<Utc>) -> Value {
    Value::String(value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<Map<String, Value>>,
    headers: RawHeaders,
}

#[derive(Debug, Deserialize)]
struct RawHeaders {
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    control: Option<String>,
    #[serde(default)]
    txids: Vec<Value>,
}

/// Decodes one response body into shape messages.
pub fn decode_messages(
    body: &[u8],
    schema: &ShapeSchema,
    parser: &ValueParser,
) -> ShapeResult<Vec<ShapeMessage>> {
    let raw: Vec<RawMessage> = serde_json::from_slice(body)?;
    let mut messages = Vec::with_capacity(raw.len());
    for message in raw {
        if let Some(control) = message.headers.control.as_deref() {
            match control {
                "up-to-date" => messages.push(ShapeMessage::UpToDate),
                "must-refetch" => messages.push(ShapeMessage::MustRefetch),
                _ => {}
            }
            continue;
        }

        let operation = match message.headers.operation.as_deref() {
            Some("insert") => ShapeOperation::Insert,
            Some("update") => ShapeOperation::Update,
            Some("delete") => ShapeOperation::Delete,
            Some(other) => return Err(ShapeError::UnknownOperation(other.to_string())),
            None => return Err(ShapeError::UnknownOperation(String::new())),
        };

        let mut value = Map::new();
        for (column, raw_value) in message.value.unwrap_or_default() {
            let parsed = match schema.column_type(&column) {
                Some(column_type) => parser.parse(&column, column_type, raw_value)?,
                None => raw_value,
            };
            value.insert(column, parsed);
        }

        let id = row_id(&value, message.key.as_deref()).ok_or(ShapeError::MissingKey)?;
        value.insert("id".to_string(), Value::Number(id.get().into()));

        let txids = message
            .headers
            .txids
            .iter()
            .filter_map(txid_from_value)
            .collect();

        messages.push(ShapeMessage::Change {
            operation,
            id,
            value,
            txids,
        });
    }
    Ok(messages)
}

fn row_id(value: &Map<String, Value>, key: Option<&str>) -> Option<ServerId> {
    let from_value = value.get("id").and_then(|raw| match raw {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    });
    let from_key = || {
        key.and_then(|key| KEY_PK_RE.captures(key))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok())
    };
    from_value
        .or_else(from_key)
        .and_then(|id| ServerId::new(id).ok())
}

fn txid_from_value(value: &Value) -> Option<TxId> {
    match value {
        Value::Number(number) => number.as_u64().map(TxId),
        Value::String(text) => text.trim().parse::<u64>().ok().map(TxId),
        _ => None,
    }
}
