//! Type definitions for the DSL execution host.
//!
//! This module contains the host-side value model, invocation requests and
//! outcomes, resource budgets and entry point descriptions shared by every
//! component of the host.

use super::error::{BridgeError, HostError};
use crate::constants::{DEFAULT_MAX_MEMORY_BYTES, DEFAULT_TIMEOUT_MS};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Insertion-ordered mapping used by [`BridgedValue::Mapping`].
pub type BridgedMap = IndexMap<String, BridgedValue>;

/// Host-native structured value exchanged with scripts.
///
/// The union is closed: anything a script returns that does not fit one of
/// these shapes is a bridging error. Values are trees; cycles cannot be
/// represented.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BridgedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Sequence(Vec<BridgedValue>),
    Mapping(BridgedMap),
}

impl BridgedValue {
    /// Builds a mapping from key/value pairs, keeping their order.
    pub fn mapping<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, BridgedValue)>,
    {
        BridgedValue::Mapping(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            BridgedValue::Null => "null",
            BridgedValue::Bool(_) => "bool",
            BridgedValue::Int(_) => "int",
            BridgedValue::Float(_) => "float",
            BridgedValue::Text(_) => "text",
            BridgedValue::Sequence(_) => "sequence",
            BridgedValue::Mapping(_) => "mapping",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, BridgedValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            BridgedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BridgedValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            BridgedValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            BridgedValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[BridgedValue]> {
        match self {
            BridgedValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&BridgedMap> {
        match self {
            BridgedValue::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a key when the value is a mapping.
    pub fn get(&self, key: &str) -> Option<&BridgedValue> {
        self.as_mapping().and_then(|map| map.get(key))
    }

    /// Nesting depth of the tree; scalars have depth 0.
    pub fn depth(&self) -> usize {
        match self {
            BridgedValue::Sequence(items) => {
                1 + items.iter().map(BridgedValue::depth).max().unwrap_or(0)
            }
            BridgedValue::Mapping(map) => 1 + map.values().map(BridgedValue::depth).max().unwrap_or(0),
            _ => 0,
        }
    }
}

impl fmt::Display for BridgedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::Value::from(self.clone());
        write!(f, "{}", json)
    }
}

impl From<bool> for BridgedValue {
    fn from(value: bool) -> Self {
        BridgedValue::Bool(value)
    }
}

impl From<i64> for BridgedValue {
    fn from(value: i64) -> Self {
        BridgedValue::Int(value)
    }
}

impl From<i32> for BridgedValue {
    fn from(value: i32) -> Self {
        BridgedValue::Int(i64::from(value))
    }
}

impl From<f64> for BridgedValue {
    fn from(value: f64) -> Self {
        BridgedValue::Float(value)
    }
}

impl From<&str> for BridgedValue {
    fn from(value: &str) -> Self {
        BridgedValue::Text(value.to_string())
    }
}

impl From<String> for BridgedValue {
    fn from(value: String) -> Self {
        BridgedValue::Text(value)
    }
}

impl<T: Into<BridgedValue>> From<Vec<T>> for BridgedValue {
    fn from(values: Vec<T>) -> Self {
        BridgedValue::Sequence(values.into_iter().map(Into::into).collect())
    }
}

impl From<BridgedMap> for BridgedValue {
    fn from(map: BridgedMap) -> Self {
        BridgedValue::Mapping(map)
    }
}

impl TryFrom<serde_json::Value> for BridgedValue {
    type Error = BridgeError;

    /// JSON integers above `i64::MAX` are rejected rather than widened to a
    /// float.
    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value as JsonValue;

        Ok(match value {
            JsonValue::Null => BridgedValue::Null,
            JsonValue::Bool(b) => BridgedValue::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    BridgedValue::Int(i)
                } else if n.is_u64() {
                    return Err(BridgeError::NumericOverflow {
                        value: n.to_string(),
                    });
                } else {
                    BridgedValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => BridgedValue::Text(s),
            JsonValue::Array(items) => BridgedValue::Sequence(
                items
                    .into_iter()
                    .map(BridgedValue::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            JsonValue::Object(map) => BridgedValue::Mapping(
                map.into_iter()
                    .map(|(k, v)| BridgedValue::try_from(v).map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

impl From<BridgedValue> for serde_json::Value {
    fn from(value: BridgedValue) -> Self {
        use serde_json::Value as JsonValue;

        match value {
            BridgedValue::Null => JsonValue::Null,
            BridgedValue::Bool(b) => JsonValue::Bool(b),
            BridgedValue::Int(i) => JsonValue::Number(i.into()),
            BridgedValue::Float(f) => serde_json::Number::from_f64(f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            BridgedValue::Text(s) => JsonValue::String(s),
            BridgedValue::Sequence(items) => {
                JsonValue::Array(items.into_iter().map(JsonValue::from).collect())
            }
            BridgedValue::Mapping(map) => JsonValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, JsonValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Time and memory ceiling attached to one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    /// Maximum wall-clock time
    pub max_wall_time: Duration,
    /// Maximum bytes of script-held data, enforced per value
    pub max_memory_bytes: usize,
}

impl ResourceBudget {
    pub fn new(max_wall_time: Duration, max_memory_bytes: usize) -> Self {
        Self {
            max_wall_time,
            max_memory_bytes,
        }
    }

    /// Same memory ceiling with a different time limit.
    pub fn with_timeout(mut self, max_wall_time: Duration) -> Self {
        self.max_wall_time = max_wall_time;
        self
    }

    /// Same time limit with a different memory ceiling.
    pub fn with_max_memory(mut self, max_memory_bytes: usize) -> Self {
        self.max_memory_bytes = max_memory_bytes;
        self
    }
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            max_wall_time: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
        }
    }
}

/// A request to run one entry point.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Logical module name
    pub module: String,
    /// Entry point to call
    pub entry_point: String,
    /// Positional arguments
    pub args: Vec<BridgedValue>,
    /// Mandatory resource budget
    pub budget: ResourceBudget,
}

impl InvocationRequest {
    pub fn new(
        module: impl Into<String>,
        entry_point: impl Into<String>,
        args: Vec<BridgedValue>,
        budget: ResourceBudget,
    ) -> Self {
        Self {
            module: module.into(),
            entry_point: entry_point.into(),
            args,
            budget,
        }
    }
}

/// Result of one invocation: exactly one of a value or an error.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Success(BridgedValue),
    Failure(HostError),
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Success(_))
    }

    pub fn value(&self) -> Option<&BridgedValue> {
        match self {
            InvocationOutcome::Success(value) => Some(value),
            InvocationOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&HostError> {
        match self {
            InvocationOutcome::Success(_) => None,
            InvocationOutcome::Failure(error) => Some(error),
        }
    }

    pub fn into_result(self) -> Result<BridgedValue, HostError> {
        match self {
            InvocationOutcome::Success(value) => Ok(value),
            InvocationOutcome::Failure(error) => Err(error),
        }
    }
}

impl<E: Into<HostError>> From<Result<BridgedValue, E>> for InvocationOutcome {
    fn from(result: Result<BridgedValue, E>) -> Self {
        match result {
            Ok(value) => InvocationOutcome::Success(value),
            Err(error) => InvocationOutcome::Failure(error.into()),
        }
    }
}

/// A callable exposed by a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Function name
    pub name: String,
    /// Parameter names, in order
    pub params: Vec<String>,
}

impl EntryPoint {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.params.join(", "))
    }
}

/// Unique identifier for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(pub Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an interpreter session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
