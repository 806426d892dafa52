use std::fmt;

use dbuslink_signature::Signature;

use crate::error::*;
use crate::marshal::{Marshal, Unmarshal};
use crate::reader::Reader;
use crate::value::Value;
use crate::writer::Writer;

/// A self-describing value: any marshalable value together with its
/// signature.
///
/// ```rust
/// use dbuslink::Variant;
///
/// let v = Variant::wrap(&("pi", 3.14_f64)).unwrap();
/// assert_eq!(v.signature().unwrap(), "(sd)");
/// let (name, value): (String, f64) = v.unwrap().unwrap();
/// assert_eq!(name, "pi");
/// assert_eq!(value, 3.14);
/// assert!(v.unwrap::<String>().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct Variant {
    value: Value,
}

impl Variant {
    pub fn new(value: Value) -> Variant {
        Variant { value }
    }

    /// Capture `value` and its signature.
    pub fn wrap<T: Marshal + ?Sized>(value: &T) -> Result<Variant> {
        let signature = T::signature()?;
        let mut w = Writer::new(&signature);
        value.marshal(&mut w)?;
        let bytes = w.finish()?;
        let mut r = Reader::new(&bytes, &signature);
        let value = r.read_value()?;
        Ok(Variant { value })
    }

    /// Convert back to a native value; `T`'s signature must equal the
    /// carried one exactly.
    pub fn unwrap<T: Unmarshal>(&self) -> Result<T> {
        let signature = self.signature()?;
        let wanted = T::signature()?;
        if wanted != signature {
            return Err(ErrorKind::TypeMismatch {
                expected: signature.to_string(),
                found: wanted.to_string(),
            }.into_error());
        }
        let mut w = Writer::new(&signature);
        w.append_value(&self.value)?;
        let bytes = w.finish()?;
        let mut r = Reader::new(&bytes, &signature);
        T::unmarshal(&mut r)
    }

    /// Fails if the value has no valid signature, like a struct without
    /// fields.
    pub fn signature(&self) -> Result<Signature> {
        self.value.signature()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        self.value.value_type() == other.value.value_type() && self.value == other.value
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}: {}>", self.value.value_type(), self.value)
    }
}

impl From<Value> for Variant {
    fn from(value: Value) -> Self {
        Variant::new(value)
    }
}
