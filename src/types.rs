//! First-class type descriptors and runtime values.
//!
//! A query's parameter and row shapes are described by a [`Type`] tree that
//! the drivers walk at runtime: parameter encoding, row decoding, and OID
//! assignment are all interpreters over this tree. Runtime data travels as
//! the mirror [`Value`] tree.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};

// ============================================================================
// Field kinds
// ============================================================================

/// The primitive field kinds understood by the drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    /// Native integer, transferred as INT8.
    Int,
    Int16,
    Int32,
    Int64,
    Float,
    Text,
    Octets,
    Date,
    Timestamp,
    /// A time span (interval).
    Span,
    /// A user-defined enum type, resolved to an OID by name at request time.
    Enum(String),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Bool => f.write_str("bool"),
            FieldType::Int => f.write_str("int"),
            FieldType::Int16 => f.write_str("int16"),
            FieldType::Int32 => f.write_str("int32"),
            FieldType::Int64 => f.write_str("int64"),
            FieldType::Float => f.write_str("float"),
            FieldType::Text => f.write_str("string"),
            FieldType::Octets => f.write_str("octets"),
            FieldType::Date => f.write_str("date"),
            FieldType::Timestamp => f.write_str("timestamp"),
            FieldType::Span => f.write_str("span"),
            FieldType::Enum(name) => write!(f, "enum({})", name),
        }
    }
}

// ============================================================================
// Custom codings
// ============================================================================

/// A user-supplied coding layer between a custom value and its wire
/// representation. `encode` maps the user value to a value of the
/// representation type; `decode` maps back.
pub trait CustomCodec: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, value: &Value) -> std::result::Result<Value, String>;
    fn decode(&self, rep: Value) -> std::result::Result<Value, String>;
}

// ============================================================================
// Type descriptors
// ============================================================================

/// A type descriptor: the shape of a parameter tuple or a result row.
///
/// The number of field leaves equals the width of the corresponding
/// parameter or row array ([`Type::length`]).
#[derive(Clone)]
pub enum Type {
    Unit,
    Field(FieldType),
    Option(Box<Type>),
    Tup2(Box<Type>, Box<Type>),
    Tup3(Box<Type>, Box<Type>, Box<Type>),
    Tup4(Box<Type>, Box<Type>, Box<Type>, Box<Type>),
    Custom {
        rep: Box<Type>,
        codec: Arc<dyn CustomCodec>,
    },
    Annot(String, Box<Type>),
}

impl Type {
    pub fn option(t: Type) -> Type {
        Type::Option(Box::new(t))
    }

    pub fn tup2(a: Type, b: Type) -> Type {
        Type::Tup2(Box::new(a), Box::new(b))
    }

    pub fn tup3(a: Type, b: Type, c: Type) -> Type {
        Type::Tup3(Box::new(a), Box::new(b), Box::new(c))
    }

    pub fn tup4(a: Type, b: Type, c: Type, d: Type) -> Type {
        Type::Tup4(Box::new(a), Box::new(b), Box::new(c), Box::new(d))
    }

    pub fn custom(rep: Type, codec: Arc<dyn CustomCodec>) -> Type {
        Type::Custom {
            rep: Box::new(rep),
            codec,
        }
    }

    pub fn annot(name: impl Into<String>, t: Type) -> Type {
        Type::Annot(name.into(), Box::new(t))
    }

    pub fn enum_(name: impl Into<String>) -> Type {
        Type::Field(FieldType::Enum(name.into()))
    }

    /// Number of field leaves, i.e. the parameter or row array width.
    pub fn length(&self) -> usize {
        match self {
            Type::Unit => 0,
            Type::Field(_) => 1,
            Type::Option(t) => t.length(),
            Type::Tup2(a, b) => a.length() + b.length(),
            Type::Tup3(a, b, c) => a.length() + b.length() + c.length(),
            Type::Tup4(a, b, c, d) => a.length() + b.length() + c.length() + d.length(),
            Type::Custom { rep, .. } => rep.length(),
            Type::Annot(_, t) => t.length(),
        }
    }

    /// Collect the names of all enum fields in the descriptor, left to right.
    pub fn enum_names(&self, out: &mut Vec<String>) {
        match self {
            Type::Unit => {}
            Type::Field(FieldType::Enum(name)) => out.push(name.clone()),
            Type::Field(_) => {}
            Type::Option(t) | Type::Annot(_, t) => t.enum_names(out),
            Type::Tup2(a, b) => {
                a.enum_names(out);
                b.enum_names(out);
            }
            Type::Tup3(a, b, c) => {
                a.enum_names(out);
                b.enum_names(out);
                c.enum_names(out);
            }
            Type::Tup4(a, b, c, d) => {
                a.enum_names(out);
                b.enum_names(out);
                c.enum_names(out);
                d.enum_names(out);
            }
            Type::Custom { rep, .. } => rep.enum_names(out),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unit => f.write_str("unit"),
            Type::Field(ft) => ft.fmt(f),
            Type::Option(t) => write!(f, "{}?", t),
            Type::Tup2(a, b) => write!(f, "({}, {})", a, b),
            Type::Tup3(a, b, c) => write!(f, "({}, {}, {})", a, b, c),
            Type::Tup4(a, b, c, d) => write!(f, "({}, {}, {}, {})", a, b, c, d),
            Type::Custom { codec, rep } => write!(f, "{}<{}>", codec.name(), rep),
            Type::Annot(_, t) => t.fmt(f),
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ============================================================================
// Runtime values
// ============================================================================

/// A runtime value shaped like a [`Type`] descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f64),
    Text(String),
    Octets(Vec<u8>),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Span(Duration),
    /// An enum value, carried as its label.
    Enum(String),
    /// An absent optional group.
    Null,
    /// A present optional group.
    Some(Box<Value>),
    Tup2(Box<Value>, Box<Value>),
    Tup3(Box<Value>, Box<Value>, Box<Value>),
    Tup4(Box<Value>, Box<Value>, Box<Value>, Box<Value>),
}

impl Value {
    pub fn some(v: Value) -> Value {
        Value::Some(Box::new(v))
    }

    pub fn tup2(a: Value, b: Value) -> Value {
        Value::Tup2(Box::new(a), Box::new(b))
    }

    pub fn tup3(a: Value, b: Value, c: Value) -> Value {
        Value::Tup3(Box::new(a), Box::new(b), Box::new(c))
    }

    pub fn tup4(a: Value, b: Value, c: Value, d: Value) -> Value {
        Value::Tup4(Box::new(a), Box::new(b), Box::new(c), Box::new(d))
    }

    pub fn text(s: impl Into<String>) -> Value {
        Value::Text(s.into())
    }
}
