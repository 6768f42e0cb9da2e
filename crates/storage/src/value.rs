//! Column values, type tags and the slots through which values are delivered.
//!
//! The schema of a partition is only known once it is opened, so columns are
//! addressed by name and checked at runtime: a caller declares the
//! [`TypeInfo`] it expects, a partition reports the [`TypeInfo`] it stores,
//! and [`TypeInfo::compatibility`] decides how (not whether) the two are
//! connected.

use std::cell::RefCell;
use std::fmt::{self, Display};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Type tag of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
    Bytes,
    /// A composite value made of named members.
    Record,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            DataType::Int32
                | DataType::Int64
                | DataType::UInt64
                | DataType::Float32
                | DataType::Float64
        )
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
            DataType::Bytes => "bytes",
            DataType::Record => "record",
        };
        f.write_str(name)
    }
}

/// Declared or stored type of a column.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeInfo {
    /// Name of the record type, for [`DataType::Record`] columns.
    #[serde(default)]
    pub class_name: Option<String>,
    pub kind: DataType,
    /// The caller's slot holds a reference to the value rather than the
    /// value itself.
    #[serde(default)]
    pub is_pointer: bool,
}

impl TypeInfo {
    pub fn scalar(kind: DataType) -> Self {
        Self {
            class_name: None,
            kind,
            is_pointer: false,
        }
    }

    pub fn record(class_name: impl Into<String>) -> Self {
        Self {
            class_name: Some(class_name.into()),
            kind: DataType::Record,
            is_pointer: false,
        }
    }

    pub fn pointer(self) -> Self {
        Self {
            is_pointer: true,
            ..self
        }
    }

    /// Checks a declared type (`self`) against the type a partition stores
    /// for the column (`source`).
    ///
    /// Incompatible pairs are never refused: they fall back to member-wise
    /// delivery so that schema drift between partitions does not abort a
    /// scan.
    pub fn compatibility(&self, source: &TypeInfo) -> BindOutcome {
        if self.kind == source.kind {
            if self.kind != DataType::Record || self.class_name == source.class_name {
                return BindOutcome::Match;
            }
            return BindOutcome::Decomposed;
        }
        if self.kind.is_numeric() && source.kind.is_numeric() {
            return BindOutcome::MatchConversion;
        }
        BindOutcome::Decomposed
    }
}

impl Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.class_name {
            Some(class_name) => write!(f, "{class_name}")?,
            None => write!(f, "{}", self.kind)?,
        }
        if self.is_pointer {
            f.write_str("*")?;
        }
        Ok(())
    }
}

/// Result of attaching a slot to a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BindOutcome {
    /// No partition was open, nothing was checked.
    NoCheck,
    /// Declared and stored types are identical.
    Match,
    /// Both types are numeric; values are converted on delivery.
    MatchConversion,
    /// The types differ; the value is delivered member-wise, as stored.
    Decomposed,
    /// The column does not exist in the partition; the slot stays attached
    /// to nothing.
    MissingColumn,
}

impl BindOutcome {
    pub fn is_attached(self) -> bool {
        matches!(
            self,
            BindOutcome::Match | BindOutcome::MatchConversion | BindOutcome::Decomposed
        )
    }
}

/// A single column value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Record(Vec<(String, Value)>),
}

impl Value {
    /// Converts a numeric value to the representation of `kind`.
    ///
    /// Non-numeric values, and non-numeric targets, are returned unchanged.
    pub fn convert_to(&self, kind: DataType) -> Value {
        let as_f64 = match self {
            Value::Int(v) => *v as f64,
            Value::UInt(v) => *v as f64,
            Value::Float(v) => *v,
            _ => return self.clone(),
        };
        match kind {
            DataType::Int32 => Value::Int(as_f64 as i32 as i64),
            DataType::Int64 => match self {
                Value::UInt(v) => Value::Int(*v as i64),
                Value::Int(v) => Value::Int(*v),
                _ => Value::Int(as_f64 as i64),
            },
            DataType::UInt64 => match self {
                Value::Int(v) => Value::UInt(*v as u64),
                Value::UInt(v) => Value::UInt(*v),
                _ => Value::UInt(as_f64 as u64),
            },
            DataType::Float32 => Value::Float(as_f64 as f32 as f64),
            DataType::Float64 => Value::Float(as_f64),
            _ => self.clone(),
        }
    }

    /// Decodes a JSON value stored in a column of type `kind`.
    pub fn from_json(json: &serde_json::Value, kind: DataType) -> Result<Value, String> {
        use serde_json::Value as Json;

        let mismatch = || format!("expected {kind}, found {json}");
        Ok(match (kind, json) {
            (_, Json::Null) => Value::Null,
            (DataType::Bool, Json::Bool(b)) => Value::Bool(*b),
            (DataType::Int32 | DataType::Int64, Json::Number(n)) => {
                Value::Int(n.as_i64().ok_or_else(mismatch)?)
            }
            (DataType::UInt64, Json::Number(n)) => Value::UInt(n.as_u64().ok_or_else(mismatch)?),
            (DataType::Float32 | DataType::Float64, Json::Number(n)) => {
                Value::Float(n.as_f64().ok_or_else(mismatch)?)
            }
            (DataType::String, Json::String(s)) => Value::String(s.clone()),
            (DataType::Bytes, Json::Array(items)) => Value::Bytes(
                items
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .and_then(|byte| u8::try_from(byte).ok())
                            .ok_or_else(mismatch)
                    })
                    .collect::<Result<_, _>>()?,
            ),
            (DataType::Record, Json::Object(members)) => Value::Record(
                members
                    .iter()
                    .map(|(name, member)| Ok((name.clone(), Self::untyped_json(member)?)))
                    .collect::<Result<_, String>>()?,
            ),
            _ => return Err(mismatch()),
        })
    }

    fn untyped_json(json: &serde_json::Value) -> Result<Value, String> {
        use serde_json::Value as Json;

        let kind = match json {
            Json::Null => return Ok(Value::Null),
            Json::Bool(_) => DataType::Bool,
            Json::Number(n) if n.is_i64() => DataType::Int64,
            Json::Number(n) if n.is_u64() => DataType::UInt64,
            Json::Number(_) => DataType::Float64,
            Json::String(_) => DataType::String,
            Json::Array(_) => DataType::Bytes,
            Json::Object(_) => DataType::Record,
        };
        Self::from_json(json, kind)
    }
}

/// A caller-owned location that receives a column's value each time a record
/// is read.
///
/// Cloning a slot yields another handle to the same location.
#[derive(Clone, Debug, Default)]
pub struct ColumnSlot(Rc<RefCell<Option<Value>>>);

impl ColumnSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last delivered value, if any.
    pub fn get(&self) -> Option<Value> {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.borrow_mut() = Some(value);
    }

    pub fn clear(&self) {
        *self.0.borrow_mut() = None;
    }

    /// Returns true if `self` and `other` refer to the same location.
    pub fn same_as(&self, other: &ColumnSlot) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
