//! Dynamically typed values.

use std::fmt;

use chainerror::*;
use dbuslink_signature::{BasicType, Signature, Type};

use crate::error::*;
use crate::names::ObjectPath;
use crate::variant::Variant;

/// Index into the out-of-band file descriptor list of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnixFd(pub u32);

/// Array of non dict-entry elements. Keeps its element type so that empty
/// arrays still have a signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    element: Type,
    items: Vec<Value>,
}

impl Array {
    pub fn new(element: Type) -> Result<Array> {
        if let Type::DictEntry(_, _) = element {
            return Err(ErrorKind::TypeMismatch {
                expected: "array element".into(),
                found: element.signature(),
            }.into_error());
        }
        Ok(Array {
            element,
            items: Vec::new(),
        })
    }

    /// Append an item; its type must be the element type.
    pub fn push(&mut self, value: Value) -> Result<()> {
        let t = value.value_type();
        if t != self.element {
            return Err(ErrorKind::TypeMismatch {
                expected: self.element.signature(),
                found: t.signature(),
            }.into_error());
        }
        self.items.push(value);
        Ok(())
    }

    pub fn element_type(&self) -> &Type {
        &self.element
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Array of dict entries, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct Dict {
    key: BasicType,
    value: Type,
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new(key: BasicType, value: Type) -> Dict {
        Dict {
            key,
            value,
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, key: Value, value: Value) -> Result<()> {
        let k = key.value_type();
        if k != Type::Basic(self.key) {
            return Err(ErrorKind::TypeMismatch {
                expected: self.key.to_string(),
                found: k.signature(),
            }.into_error());
        }
        let v = value.value_type();
        if v != self.value {
            return Err(ErrorKind::TypeMismatch {
                expected: self.value.signature(),
                found: v.signature(),
            }.into_error());
        }
        self.entries.push((key, value));
        Ok(())
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn key_type(&self) -> BasicType {
        self.key
    }

    pub fn value_type(&self) -> &Type {
        &self.value
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Any marshalable value, with its type known at run time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    UnixFd(UnixFd),
    Array(Array),
    Dict(Dict),
    Struct(Vec<Value>),
    Variant(Box<Variant>),
}

impl Value {
    pub fn value_type(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Basic(BasicType::Byte),
            Value::Boolean(_) => Type::Basic(BasicType::Boolean),
            Value::Int16(_) => Type::Basic(BasicType::Int16),
            Value::UInt16(_) => Type::Basic(BasicType::UInt16),
            Value::Int32(_) => Type::Basic(BasicType::Int32),
            Value::UInt32(_) => Type::Basic(BasicType::UInt32),
            Value::Int64(_) => Type::Basic(BasicType::Int64),
            Value::UInt64(_) => Type::Basic(BasicType::UInt64),
            Value::Double(_) => Type::Basic(BasicType::Double),
            Value::String(_) => Type::Basic(BasicType::String),
            Value::ObjectPath(_) => Type::Basic(BasicType::ObjectPath),
            Value::Signature(_) => Type::Basic(BasicType::Signature),
            Value::UnixFd(_) => Type::Basic(BasicType::UnixFd),
            Value::Array(a) => Type::Array(Box::new(a.element.clone())),
            Value::Dict(d) => Type::Array(Box::new(Type::DictEntry(
                d.key,
                Box::new(d.value.clone()),
            ))),
            Value::Struct(fields) => Type::Struct(fields.iter().map(Value::value_type).collect()),
            Value::Variant(_) => Type::Variant,
        }
    }

    /// The signature of this single value, checked against the protocol
    /// limits.
    pub fn signature(&self) -> Result<Signature> {
        Signature::try_from(self.value_type()).map_context(ErrorKind::from_parse)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    /// Look through any number of variant layers.
    pub fn flatten(&self) -> &Value {
        match self {
            Value::Variant(v) => v.value().flatten(),
            other => other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::ObjectPath(v) => write!(f, "{}", v),
            Value::Signature(v) => write!(f, "{}", v),
            Value::UnixFd(v) => write!(f, "fd#{}", v.0),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, item) in a.items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(d) => {
                write!(f, "{{")?;
                for (i, (k, v)) in d.entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Struct(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, ")")
            }
            Value::Variant(v) => write!(f, "<{}: {}>", v.value().value_type(), v.value()),
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )+
    };
}

value_from!(
    u8 => Byte,
    bool => Boolean,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => String,
    ObjectPath => ObjectPath,
    Signature => Signature,
    UnixFd => UnixFd,
    Array => Array,
    Dict => Dict,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Variant> for Value {
    fn from(v: Variant) -> Self {
        Value::Variant(Box::new(v))
    }
}
