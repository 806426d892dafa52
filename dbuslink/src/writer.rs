use chainerror::*;
use dbuslink_signature::{BasicType, Signature, Type};

use crate::cursor::*;
use crate::error::*;
use crate::marshal::Marshal;
use crate::names::ObjectPath;
use crate::value::{UnixFd, Value};
use crate::variant::Variant;

/// Single-pass encoder of a message body against its signature.
///
/// Every `append_*` call checks the value against the next type of the
/// signature and pads to the type's alignment relative to the start of the
/// buffer.
///
/// ```rust
/// use dbuslink::{Signature, Writer};
///
/// let sig = Signature::parse("yu").unwrap();
/// let mut w = Writer::new(&sig);
/// w.append_byte(7).unwrap();
/// w.append_u32(1).unwrap();
/// assert_eq!(w.finish().unwrap(), vec![7, 0, 0, 0, 1, 0, 0, 0]);
/// ```
#[derive(Debug)]
pub struct Writer {
    buf: Vec<u8>,
    endian: Endianness,
    types: TypeStack,
    signature: Signature,
}

impl Writer {
    pub fn new(signature: &Signature) -> Writer {
        Writer::with_endianness(signature, Endianness::Little)
    }

    pub fn with_endianness(signature: &Signature, endian: Endianness) -> Writer {
        Writer {
            buf: Vec::new(),
            endian,
            types: TypeStack::new(signature),
            signature: signature.clone(),
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The type the next value must have.
    pub fn next_type(&self) -> Option<&Type> {
        self.types.peek()
    }

    /// Verify the whole signature was written and return the bytes.
    pub fn finish(self) -> Result<Vec<u8>> {
        self.types.ensure_complete()?;
        Ok(self.buf)
    }

    pub(crate) fn pad(&mut self, alignment: usize) {
        let target = align_up(self.buf.len(), alignment);
        self.buf.resize(target, 0);
    }

    pub(crate) fn extend_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn basic(&mut self, b: BasicType) -> Result<()> {
        self.types.expect(&Type::Basic(b))?;
        self.pad(b.alignment());
        Ok(())
    }

    fn put_u16(&mut self, v: u16) {
        let bytes = self.endian.u16_bytes(v);
        self.buf.extend_from_slice(&bytes);
    }

    fn put_u32(&mut self, v: u32) {
        let bytes = self.endian.u32_bytes(v);
        self.buf.extend_from_slice(&bytes);
    }

    fn put_u64(&mut self, v: u64) {
        let bytes = self.endian.u64_bytes(v);
        self.buf.extend_from_slice(&bytes);
    }

    fn put_string(&mut self, v: &str) -> Result<()> {
        if v.as_bytes().contains(&0) {
            return Err(ErrorKind::InvalidData(
                "string contains a NUL byte".into()
            ).into_error());
        }
        let len = u32::try_from(v.len())
            .context(ErrorKind::InvalidData("string too long".into()))?;
        self.put_u32(len);
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    fn put_signature(&mut self, v: &Signature) -> Result<()> {
        let len = u8::try_from(v.as_str().len())
            .context(ErrorKind::InvalidData("signature longer than 255 bytes".into()))?;
        self.buf.push(len);
        self.buf.extend_from_slice(v.as_str().as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub fn append_byte(&mut self, v: u8) -> Result<()> {
        self.basic(BasicType::Byte)?;
        self.buf.push(v);
        Ok(())
    }

    pub fn append_bool(&mut self, v: bool) -> Result<()> {
        self.basic(BasicType::Boolean)?;
        self.put_u32(v as u32);
        Ok(())
    }

    pub fn append_i16(&mut self, v: i16) -> Result<()> {
        self.basic(BasicType::Int16)?;
        self.put_u16(v as u16);
        Ok(())
    }

    pub fn append_u16(&mut self, v: u16) -> Result<()> {
        self.basic(BasicType::UInt16)?;
        self.put_u16(v);
        Ok(())
    }

    pub fn append_i32(&mut self, v: i32) -> Result<()> {
        self.basic(BasicType::Int32)?;
        self.put_u32(v as u32);
        Ok(())
    }

    pub fn append_u32(&mut self, v: u32) -> Result<()> {
        self.basic(BasicType::UInt32)?;
        self.put_u32(v);
        Ok(())
    }

    pub fn append_i64(&mut self, v: i64) -> Result<()> {
        self.basic(BasicType::Int64)?;
        self.put_u64(v as u64);
        Ok(())
    }

    pub fn append_u64(&mut self, v: u64) -> Result<()> {
        self.basic(BasicType::UInt64)?;
        self.put_u64(v);
        Ok(())
    }

    pub fn append_f64(&mut self, v: f64) -> Result<()> {
        self.basic(BasicType::Double)?;
        self.put_u64(v.to_bits());
        Ok(())
    }

    pub fn append_str(&mut self, v: &str) -> Result<()> {
        self.basic(BasicType::String)?;
        self.put_string(v)
    }

    pub fn append_object_path(&mut self, v: &ObjectPath) -> Result<()> {
        self.basic(BasicType::ObjectPath)?;
        self.put_string(v.as_str())
    }

    pub fn append_signature(&mut self, v: &Signature) -> Result<()> {
        self.basic(BasicType::Signature)?;
        self.put_signature(v)
    }

    pub fn append_unix_fd(&mut self, v: UnixFd) -> Result<()> {
        self.basic(BasicType::UnixFd)?;
        self.put_u32(v.0);
        Ok(())
    }

    /// Write the length placeholder and padding; elements follow until
    /// [`close_array`](Writer::close_array).
    pub fn open_array(&mut self) -> Result<()> {
        let element = match self.types.peek() {
            Some(Type::Array(element)) => (**element).clone(),
            _ => return Err(self.types.mismatch("a")),
        };
        self.types.advance("a")?;
        self.pad(4);
        let len_at = self.buf.len();
        self.put_u32(0);
        // The padding to the first element is not part of the length.
        self.pad(element.alignment());
        let start = self.buf.len();
        self.types
            .push_array(element, ArrayBound::Write { len_at, start });
        Ok(())
    }

    pub fn close_array(&mut self) -> Result<()> {
        let (len_at, start) = match self.types.current_array() {
            Some(ArrayBound::Write { len_at, start }) => (len_at, start),
            _ => return Err(self.types.mismatch("end of array")),
        };
        let len = self.buf.len() - start;
        if len > MAX_ARRAY_LENGTH {
            return Err(ErrorKind::InvalidData(format!(
                "array of {} bytes exceeds the maximum of {}",
                len, MAX_ARRAY_LENGTH
            )).into_error());
        }
        self.types.pop_array()?;
        let bytes = self.endian.u32_bytes(len as u32);
        self.buf[len_at..len_at + 4].copy_from_slice(&bytes);
        Ok(())
    }

    pub fn open_struct(&mut self) -> Result<()> {
        let fields = match self.types.peek() {
            Some(Type::Struct(fields)) => fields.clone(),
            _ => return Err(self.types.mismatch("(")),
        };
        self.types.advance("(")?;
        self.pad(8);
        self.types.push_seq(fields, Container::Struct);
        Ok(())
    }

    pub fn close_struct(&mut self) -> Result<()> {
        self.types.pop_seq(Container::Struct)
    }

    pub fn open_dict_entry(&mut self) -> Result<()> {
        let (key, value) = match self.types.peek() {
            Some(Type::DictEntry(key, value)) => (*key, (**value).clone()),
            _ => return Err(self.types.mismatch("{")),
        };
        self.types.advance("{")?;
        self.pad(8);
        self.types
            .push_seq(vec![Type::Basic(key), value], Container::DictEntry);
        Ok(())
    }

    pub fn close_dict_entry(&mut self) -> Result<()> {
        self.types.pop_seq(Container::DictEntry)
    }

    /// Write the variant's signature; exactly one value of that type
    /// follows until [`close_variant`](Writer::close_variant).
    pub fn open_variant(&mut self, signature: &Signature) -> Result<()> {
        let inner = match signature.single() {
            Some(t) => t.clone(),
            None => {
                return Err(ErrorKind::InvalidData(format!(
                    "variant signature '{}' is not a single complete type",
                    signature
                )).into_error())
            }
        };
        if self.types.peek() != Some(&Type::Variant) {
            return Err(self.types.mismatch("v"));
        }
        if self.types.depth() >= MAX_DEPTH {
            return Err(ErrorKind::InvalidData(
                "values nested too deeply".into()
            ).into_error());
        }
        self.types.advance("v")?;
        self.put_signature(signature)?;
        self.types.push_seq(vec![inner], Container::Variant);
        Ok(())
    }

    pub fn close_variant(&mut self) -> Result<()> {
        self.types.pop_seq(Container::Variant)
    }

    /// Encode elements with `f` between `open_array` and `close_array`.
    pub fn append_array<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Writer) -> Result<()>,
    {
        self.open_array()?;
        f(self)?;
        self.close_array()
    }

    pub fn append_struct<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Writer) -> Result<()>,
    {
        self.open_struct()?;
        f(self)?;
        self.close_struct()
    }

    pub fn append<T: Marshal + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.marshal(self)
    }

    pub fn append_variant(&mut self, v: &Variant) -> Result<()> {
        self.open_variant(&v.signature()?)?;
        self.append_value(v.value())?;
        self.close_variant()
    }

    /// Encode a dynamically typed value; its type must be the next type of
    /// the signature.
    pub fn append_value(&mut self, value: &Value) -> Result<()> {
        let t = value.value_type();
        if self.types.peek() != Some(&t) {
            return Err(self.types.mismatch(&t.signature()));
        }
        match value {
            Value::Byte(v) => self.append_byte(*v),
            Value::Boolean(v) => self.append_bool(*v),
            Value::Int16(v) => self.append_i16(*v),
            Value::UInt16(v) => self.append_u16(*v),
            Value::Int32(v) => self.append_i32(*v),
            Value::UInt32(v) => self.append_u32(*v),
            Value::Int64(v) => self.append_i64(*v),
            Value::UInt64(v) => self.append_u64(*v),
            Value::Double(v) => self.append_f64(*v),
            Value::String(v) => self.append_str(v),
            Value::ObjectPath(v) => self.append_object_path(v),
            Value::Signature(v) => self.append_signature(v),
            Value::UnixFd(v) => self.append_unix_fd(*v),
            Value::Array(a) => {
                self.open_array()?;
                for item in a.items() {
                    self.append_value(item)?;
                }
                self.close_array()
            }
            Value::Dict(d) => {
                self.open_array()?;
                for (k, v) in d.entries() {
                    self.open_dict_entry()?;
                    self.append_value(k)?;
                    self.append_value(v)?;
                    self.close_dict_entry()?;
                }
                self.close_array()
            }
            Value::Struct(fields) => {
                self.open_struct()?;
                for field in fields {
                    self.append_value(field)?;
                }
                self.close_struct()
            }
            Value::Variant(v) => self.append_variant(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_offsets() {
        let sig = Signature::parse("y(yt)").unwrap();
        let mut w = Writer::new(&sig);
        w.append_byte(1).unwrap();
        w.open_struct().unwrap();
        assert_eq!(w.len(), 8);
        w.append_byte(2).unwrap();
        w.append_u64(3).unwrap();
        w.close_struct().unwrap();
        let bytes = w.finish().unwrap();
        let mut expected = vec![0u8; 24];
        expected[0] = 1;
        expected[8] = 2;
        expected[16] = 3;
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_typed_append_mismatch() {
        let sig = Signature::parse("s").unwrap();
        let mut w = Writer::new(&sig);
        let e = w.append_u32(1).unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::TypeMismatch { .. }));
        assert!(w.is_empty());
        w.append_str("x").unwrap();
        assert!(w.finish().is_ok());
    }

    #[test]
    fn test_variant_of_empty_struct() {
        let sig = Signature::parse("v").unwrap();
        let mut w = Writer::new(&sig);
        let v = Variant::new(Value::Struct(vec![]));
        assert!(w.append_variant(&v).is_err());
        assert!(w.is_empty());
    }

    #[test]
    fn test_variant_signature_too_long() {
        let sig = Signature::parse("v").unwrap();
        let mut w = Writer::new(&sig);
        // "(" + 300 * "y" + ")" does not fit the one byte length.
        let v = Variant::new(Value::Struct(vec![Value::Byte(0); 300]));
        let e = w.append_variant(&v).unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::Signature(_)));
        assert!(w.is_empty());
    }

    #[test]
    fn test_unfinished_body() {
        let sig = Signature::parse("yy").unwrap();
        let mut w = Writer::new(&sig);
        w.append_byte(1).unwrap();
        assert!(w.finish().is_err());
    }
}
