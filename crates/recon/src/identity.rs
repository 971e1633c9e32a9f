//! Identity keys: the natural key of a source row and the destination id it
//! was written to.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::source::SourceRow;

// ---------------------------------------------------------------------------
// Scalar
// ---------------------------------------------------------------------------

/// One scalar element of an identity key or destination id.
///
/// Equality is exact: `Int(1)` and `Str("1")` are different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdentityValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl IdentityValue {
    /// Convert a JSON value into a scalar. Floats, arrays and objects have no
    /// stable identity and are rejected.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Str(s) => Value::String(s.clone()),
        }
    }

    /// Null and the empty string never identify anything.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Str(s) => s.is_empty(),
            Self::Bool(_) | Self::Int(_) => false,
        }
    }

    /// Parse a command-line value: integers become `Int`, everything else `Str`.
    pub fn parse_loose(s: &str) -> Self {
        s.parse::<i64>().map(Self::Int).unwrap_or_else(|_| Self::Str(s.to_string()))
    }
}

impl fmt::Display for IdentityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for IdentityValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for IdentityValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for IdentityValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

// ---------------------------------------------------------------------------
// Identity key
// ---------------------------------------------------------------------------

/// Ordered tuple of scalars identifying one logical source record across runs.
/// Two keys are equal iff every element is equal, in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(Vec<IdentityValue>);

impl IdentityKey {
    pub fn new(values: Vec<IdentityValue>) -> Self {
        Self(values)
    }

    /// Build a key from the configured id fields of a row. Returns `None` when
    /// any id field is missing, empty, or not a scalar.
    pub fn from_row(row: &SourceRow, id_fields: &[String]) -> Option<Self> {
        let mut values = Vec::with_capacity(id_fields.len());
        for field in id_fields {
            let value = IdentityValue::from_json(row.get(field)?)?;
            if value.is_empty() {
                return None;
            }
            values.push(value);
        }
        Some(Self(values))
    }

    pub fn values(&self) -> &[IdentityValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

impl<V: Into<IdentityValue>> FromIterator<V> for IdentityKey {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

// ---------------------------------------------------------------------------
// Destination id
// ---------------------------------------------------------------------------

/// Destination id as recorded by a mapping store: a scalar, or a composite of
/// nested ids for destinations keyed by more than one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DestinationId {
    Scalar(IdentityValue),
    Composite(Vec<DestinationId>),
}

impl DestinationId {
    /// Reduce to a single scalar by repeatedly taking the first element.
    ///
    /// Lossy for destinations with true composite keys: only the first
    /// component survives. Null, empty-string and empty composites yield
    /// `None`.
    pub fn into_scalar(self) -> Option<IdentityValue> {
        let mut current = self;
        loop {
            match current {
                Self::Scalar(v) => return if v.is_empty() { None } else { Some(v) },
                Self::Composite(parts) => current = parts.into_iter().next()?,
            }
        }
    }

    /// Flatten into the scalar components, in order.
    pub fn components(&self) -> Vec<IdentityValue> {
        match self {
            Self::Scalar(v) => vec![v.clone()],
            Self::Composite(parts) => parts.iter().flat_map(|p| p.components()).collect(),
        }
    }
}

impl From<IdentityValue> for DestinationId {
    fn from(v: IdentityValue) -> Self {
        Self::Scalar(v)
    }
}
