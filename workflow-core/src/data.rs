//! Field-path schemas for workflow data and step properties.
//!
//! Bindings between a workflow's data object and a step's properties are plain
//! data: a [`FieldPath`] on each side and a [`ValueType`] tag. Both sides are
//! described by a [`Schema`], usually produced with `#[derive(DataSchema)]`,
//! so that bindings can be validated once when a definition is built instead
//! of being evaluated as closures at runtime.

use crate::error::{DefinitionError, MappingError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

/// The value type carried by a field or property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Integer,
    Float,
    String,
    Array,
    Object,
    /// Any non-null JSON value.
    Any,
}

impl ValueType {
    /// Whether a field of this type can receive a value declared as `source`.
    pub fn accepts(self, source: ValueType) -> bool {
        self == source
            || self == ValueType::Any
            || source == ValueType::Any
            || (self == ValueType::Float && source == ValueType::Integer)
    }

    /// The type of a runtime value, or `None` for `null`.
    pub fn of(value: &Value) -> Option<ValueType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Number(n) if n.is_f64() => Some(ValueType::Float),
            Value::Number(_) => Some(ValueType::Integer),
            Value::String(_) => Some(ValueType::String),
            Value::Array(_) => Some(ValueType::Array),
            Value::Object(_) => Some(ValueType::Object),
        }
    }

    /// Check a runtime value against this type.
    pub fn check(self, path: &FieldPath, value: &Value, nullable: bool) -> Result<(), MappingError> {
        let ok = match (self, value) {
            (_, Value::Null) => nullable,
            (ValueType::Any, _) => true,
            (ValueType::Float, Value::Number(_)) => true,
            (ValueType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (expected, v) => ValueType::of(v) == Some(expected),
        };
        if ok {
            Ok(())
        } else {
            Err(MappingError::TypeMismatch {
                path: path.to_string(),
                expected: self.to_string(),
                found: ValueType::of(value)
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "null".to_string()),
            })
        }
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::Array => "array",
            ValueType::Object => "object",
            ValueType::Any => "any",
        };
        f.write_str(name)
    }
}

/// A dotted selector into a JSON-shaped value, e.g. `address.city`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parse a dotted path. Each segment must be an identifier.
    pub fn parse(path: &str) -> Result<Self, DefinitionError> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        let valid = segments.iter().all(|s| {
            let mut chars = s.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
        if !valid {
            return Err(DefinitionError::InvalidPath(path.to_string()));
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// This path prefixed with `parent`.
    pub fn under(&self, parent: &FieldPath) -> FieldPath {
        let mut segments = parent.0.clone();
        segments.extend(self.0.iter().cloned());
        FieldPath(segments)
    }

    /// Read the value at this path.
    pub fn get<'v>(&self, value: &'v Value) -> Option<&'v Value> {
        self.0
            .iter()
            .try_fold(value, |current, segment| current.as_object()?.get(segment))
    }

    /// Write `new` at this path. Every parent segment must already be an object.
    pub fn set(&self, value: &mut Value, new: Value) -> Result<(), MappingError> {
        let (last, parents) = self
            .0
            .split_last()
            .ok_or_else(|| MappingError::MissingPath(self.to_string()))?;
        let mut current = value;
        for segment in parents {
            current = current
                .as_object_mut()
                .and_then(|map| map.get_mut(segment))
                .ok_or_else(|| MappingError::MissingPath(self.to_string()))?;
        }
        let map: &mut Map<String, Value> = current
            .as_object_mut()
            .ok_or_else(|| MappingError::MissingPath(self.to_string()))?;
        map.insert(last.clone(), new);
        Ok(())
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl FromStr for FieldPath {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldPath::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = DefinitionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FieldPath::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

/// Declared shape of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub ty: ValueType,
    /// Whether `null` is an acceptable runtime value.
    pub nullable: bool,
}

/// The set of addressable fields of a data type, keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: BTreeMap<FieldPath, FieldSpec>,
    // Names that failed to parse, reported by `check`
    invalid: Vec<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field.
    ///
    /// A name that is not a valid path is kept aside and reported by
    /// [`Schema::check`], which the workflow builder calls.
    #[must_use]
    pub fn field(mut self, name: &str, ty: ValueType, nullable: bool) -> Self {
        match FieldPath::parse(name) {
            Ok(path) => {
                self.fields.insert(path, FieldSpec { ty, nullable });
            }
            Err(_) => self.invalid.push(name.to_string()),
        }
        self
    }

    /// Add an object field and flatten `inner` underneath it.
    #[must_use]
    pub fn nested(self, name: &str, nullable: bool, inner: Schema) -> Self {
        let Ok(parent) = FieldPath::parse(name) else {
            return self.field(name, ValueType::Object, nullable);
        };
        let mut this = self.field(name, ValueType::Object, nullable);
        for (path, spec) in inner.fields {
            this.fields.insert(path.under(&parent), spec);
        }
        this.invalid
            .extend(inner.invalid.into_iter().map(|bad| format!("{parent}.{bad}")));
        this
    }

    /// Fail on the first field name that is not a valid path.
    pub fn check(&self) -> Result<(), DefinitionError> {
        match self.invalid.first() {
            Some(name) => Err(DefinitionError::InvalidPath(name.clone())),
            None => Ok(()),
        }
    }

    pub fn resolve(&self, path: &FieldPath) -> Option<FieldSpec> {
        self.fields.get(path).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &FieldSpec)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Types that can describe their fields as a [`Schema`].
///
/// Implemented by workflow data types and step property sets. Usually derived.
pub trait DataSchema {
    fn schema() -> Schema;
}
