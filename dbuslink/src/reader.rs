use chainerror::*;
use dbuslink_signature::{BasicType, Signature, Type};

use crate::cursor::*;
use crate::error::*;
use crate::marshal::Unmarshal;
use crate::names::ObjectPath;
use crate::value::{Array, Dict, UnixFd, Value};
use crate::variant::Variant;

/// Single-pass decoder of a message body against its signature.
///
/// Reads are bounded by the innermost enclosing array: a read crossing the
/// array's declared byte length fails, whatever follows in the buffer.
///
/// ```rust
/// use dbuslink::{Reader, Signature};
///
/// let sig = Signature::parse("ai").unwrap();
/// // length 8, two int32, then trailing garbage
/// let data = [8, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 0xff, 0xff];
/// let mut r = Reader::new(&data, &sig);
/// let v: Vec<i32> = r.get().unwrap();
/// assert_eq!(v, vec![1, 2]);
/// assert_eq!(r.position(), 12);
/// ```
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endianness,
    types: TypeStack,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], signature: &Signature) -> Reader<'a> {
        Reader::with_endianness(data, signature, Endianness::Little)
    }

    pub fn with_endianness(data: &'a [u8], signature: &Signature, endian: Endianness) -> Reader<'a> {
        Reader::at_offset(data, 0, signature, endian)
    }

    /// Start reading at `offset`; alignment stays relative to the start of
    /// `data`.
    pub(crate) fn at_offset(
        data: &'a [u8],
        offset: usize,
        signature: &Signature,
        endian: Endianness,
    ) -> Reader<'a> {
        Reader {
            data,
            pos: offset,
            endian,
            types: TypeStack::new(signature),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    /// The type the next value has.
    pub fn next_type(&self) -> Option<&Type> {
        self.types.peek()
    }

    /// `true` once every type of the signature has been read.
    pub fn is_finished(&self) -> bool {
        self.types.is_complete()
    }

    fn limit(&self) -> usize {
        match self.types.innermost_array() {
            Some(ArrayBound::Read { end }) => end,
            _ => self.data.len(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let limit = self.limit();
        let end = match self.pos.checked_add(n) {
            Some(end) if end <= limit => end,
            _ => {
                let reason = if limit < self.data.len() {
                    "read past the end of the array"
                } else {
                    "data truncated"
                };
                return Err(ErrorKind::InvalidData(reason.into()).into_error());
            }
        };
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn skip_pad(&mut self, alignment: usize) -> Result<()> {
        let target = align_up(self.pos, alignment);
        let pad = self.take(target - self.pos)?;
        if pad.iter().any(|b| *b != 0) {
            return Err(ErrorKind::InvalidData("non-zero padding".into()).into_error());
        }
        Ok(())
    }

    fn basic(&mut self, b: BasicType) -> Result<()> {
        self.types.expect(&Type::Basic(b))?;
        self.skip_pad(b.alignment())
    }

    fn raw_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(self.endian.read_u16(b))
    }

    fn raw_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(self.endian.read_u32(b))
    }

    fn raw_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(self.endian.read_u64(b))
    }

    fn raw_str(&mut self) -> Result<&'a str> {
        let len = self.raw_u32()? as usize;
        let bytes = self.take(len)?;
        if self.take(1)?[0] != 0 {
            return Err(ErrorKind::InvalidData(
                "string is not NUL terminated".into()
            ).into_error());
        }
        if bytes.contains(&0) {
            return Err(ErrorKind::InvalidData(
                "string contains a NUL byte".into()
            ).into_error());
        }
        std::str::from_utf8(bytes).context(ErrorKind::InvalidData(
            "string is not valid UTF-8".into()
        ))
    }

    fn raw_signature(&mut self) -> Result<Signature> {
        let len = self.take(1)?[0] as usize;
        let bytes = self.take(len)?;
        if self.take(1)?[0] != 0 {
            return Err(ErrorKind::InvalidData(
                "signature is not NUL terminated".into()
            ).into_error());
        }
        let text = std::str::from_utf8(bytes).context(ErrorKind::InvalidData(
            "signature is not ASCII".into()
        ))?;
        Signature::parse(text).map_context(ErrorKind::from_parse)
    }

    pub fn get_byte(&mut self) -> Result<u8> {
        self.basic(BasicType::Byte)?;
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        self.basic(BasicType::Boolean)?;
        match self.raw_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(ErrorKind::InvalidData(format!(
                "boolean value {}",
                v
            )).into_error()),
        }
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        self.basic(BasicType::Int16)?;
        Ok(self.raw_u16()? as i16)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.basic(BasicType::UInt16)?;
        self.raw_u16()
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.basic(BasicType::Int32)?;
        Ok(self.raw_u32()? as i32)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.basic(BasicType::UInt32)?;
        self.raw_u32()
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.basic(BasicType::Int64)?;
        Ok(self.raw_u64()? as i64)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.basic(BasicType::UInt64)?;
        self.raw_u64()
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        self.basic(BasicType::Double)?;
        Ok(f64::from_bits(self.raw_u64()?))
    }

    /// Borrow a string from the underlying buffer.
    pub fn get_str(&mut self) -> Result<&'a str> {
        self.basic(BasicType::String)?;
        self.raw_str()
    }

    pub fn get_string(&mut self) -> Result<String> {
        self.get_str().map(str::to_string)
    }

    pub fn get_object_path(&mut self) -> Result<ObjectPath> {
        self.basic(BasicType::ObjectPath)?;
        let s = self.raw_str()?;
        ObjectPath::new(s).map_err(|_| {
            ErrorKind::InvalidData(format!("invalid object path '{}'", s)).into_error()
        })
    }

    pub fn get_signature(&mut self) -> Result<Signature> {
        self.basic(BasicType::Signature)?;
        self.raw_signature()
    }

    pub fn get_unix_fd(&mut self) -> Result<UnixFd> {
        self.basic(BasicType::UnixFd)?;
        Ok(UnixFd(self.raw_u32()?))
    }

    /// Enter an array; read elements while [`has_more`](Reader::has_more)
    /// holds, then [`close_array`](Reader::close_array).
    pub fn open_array(&mut self) -> Result<()> {
        let element = match self.types.peek() {
            Some(Type::Array(element)) => (**element).clone(),
            _ => return Err(self.types.mismatch("a")),
        };
        self.types.advance("a")?;
        self.skip_pad(4)?;
        let len = self.raw_u32()? as usize;
        if len > MAX_ARRAY_LENGTH {
            return Err(ErrorKind::InvalidData(format!(
                "array of {} bytes exceeds the maximum of {}",
                len, MAX_ARRAY_LENGTH
            )).into_error());
        }
        self.skip_pad(element.alignment())?;
        let end = self.pos + len;
        if end > self.limit() {
            return Err(ErrorKind::InvalidData(
                "array length exceeds the available data".into()
            ).into_error());
        }
        self.types.push_array(element, ArrayBound::Read { end });
        Ok(())
    }

    /// `true` while the current array has unread elements.
    pub fn has_more(&self) -> bool {
        match self.types.current_array() {
            Some(ArrayBound::Read { end }) => self.pos < end,
            _ => false,
        }
    }

    /// Leave the current array, skipping unread elements.
    pub fn close_array(&mut self) -> Result<()> {
        let end = match self.types.current_array() {
            Some(ArrayBound::Read { end }) => end,
            _ => return Err(self.types.mismatch("end of array")),
        };
        self.types.pop_array()?;
        self.pos = end;
        Ok(())
    }

    pub fn open_struct(&mut self) -> Result<()> {
        let fields = match self.types.peek() {
            Some(Type::Struct(fields)) => fields.clone(),
            _ => return Err(self.types.mismatch("(")),
        };
        self.types.advance("(")?;
        self.skip_pad(8)?;
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
        self.skip_pad(8)?;
        self.types
            .push_seq(vec![Type::Basic(key), value], Container::DictEntry);
        Ok(())
    }

    pub fn close_dict_entry(&mut self) -> Result<()> {
        self.types.pop_seq(Container::DictEntry)
    }

    /// Enter a variant and return the signature of the value it holds.
    pub fn open_variant(&mut self) -> Result<Signature> {
        if self.types.peek() != Some(&Type::Variant) {
            return Err(self.types.mismatch("v"));
        }
        if self.types.depth() >= MAX_DEPTH {
            return Err(ErrorKind::InvalidData(
                "values nested too deeply".into()
            ).into_error());
        }
        self.types.advance("v")?;
        let signature = self.raw_signature()?;
        let inner = match signature.single() {
            Some(t) => t.clone(),
            None => {
                return Err(ErrorKind::InvalidData(format!(
                    "variant signature '{}' is not a single complete type",
                    signature
                )).into_error())
            }
        };
        self.types.push_seq(vec![inner], Container::Variant);
        Ok(signature)
    }

    pub fn close_variant(&mut self) -> Result<()> {
        self.types.pop_seq(Container::Variant)
    }

    pub fn get<T: Unmarshal>(&mut self) -> Result<T> {
        T::unmarshal(self)
    }

    pub fn get_variant(&mut self) -> Result<Variant> {
        self.open_variant()?;
        let value = self.read_value()?;
        self.close_variant()?;
        Ok(Variant::new(value))
    }

    /// Decode the next value, whatever its type.
    pub fn read_value(&mut self) -> Result<Value> {
        let t = match self.types.peek() {
            Some(t) => t.clone(),
            None => return Err(self.types.mismatch("value")),
        };
        let value = match t {
            Type::Basic(b) => match b {
                BasicType::Byte => Value::Byte(self.get_byte()?),
                BasicType::Boolean => Value::Boolean(self.get_bool()?),
                BasicType::Int16 => Value::Int16(self.get_i16()?),
                BasicType::UInt16 => Value::UInt16(self.get_u16()?),
                BasicType::Int32 => Value::Int32(self.get_i32()?),
                BasicType::UInt32 => Value::UInt32(self.get_u32()?),
                BasicType::Int64 => Value::Int64(self.get_i64()?),
                BasicType::UInt64 => Value::UInt64(self.get_u64()?),
                BasicType::Double => Value::Double(self.get_f64()?),
                BasicType::String => Value::String(self.get_string()?),
                BasicType::ObjectPath => Value::ObjectPath(self.get_object_path()?),
                BasicType::Signature => Value::Signature(self.get_signature()?),
                BasicType::UnixFd => Value::UnixFd(self.get_unix_fd()?),
            },
            Type::Array(element) => match *element {
                Type::DictEntry(key, value) => {
                    let mut dict = Dict::new(key, *value);
                    self.open_array()?;
                    while self.has_more() {
                        self.open_dict_entry()?;
                        let k = self.read_value()?;
                        let v = self.read_value()?;
                        self.close_dict_entry()?;
                        dict.insert(k, v)?;
                    }
                    self.close_array()?;
                    Value::Dict(dict)
                }
                element => {
                    let mut array = Array::new(element)?;
                    self.open_array()?;
                    while self.has_more() {
                        array.push(self.read_value()?)?;
                    }
                    self.close_array()?;
                    Value::Array(array)
                }
            },
            Type::Struct(fields) => {
                self.open_struct()?;
                let mut values = Vec::with_capacity(fields.len());
                for _ in 0..fields.len() {
                    values.push(self.read_value()?);
                }
                self.close_struct()?;
                Value::Struct(values)
            }
            Type::Variant => Value::Variant(Box::new(self.get_variant()?)),
            Type::DictEntry(_, _) => return Err(self.types.mismatch("{")),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_offsets() {
        let sig = Signature::parse("y(yt)").unwrap();
        let mut data = vec![0u8; 24];
        data[0] = 1;
        data[8] = 2;
        data[16] = 3;
        let mut r = Reader::new(&data, &sig);
        assert_eq!(r.get_byte().unwrap(), 1);
        assert_eq!(r.position(), 1);
        r.open_struct().unwrap();
        assert_eq!(r.position(), 8);
        assert_eq!(r.get_byte().unwrap(), 2);
        assert_eq!(r.get_u64().unwrap(), 3);
        assert_eq!(r.position(), 24);
        r.close_struct().unwrap();
        assert!(r.is_finished());
    }

    #[test]
    fn test_struct_rejects_nonzero_padding() {
        let sig = Signature::parse("y(yt)").unwrap();
        let mut data = vec![0u8; 24];
        data[4] = 0xff;
        let mut r = Reader::new(&data, &sig);
        r.get_byte().unwrap();
        assert!(r.open_struct().is_err());
    }

    #[test]
    fn test_exact_array_then_trailing_value() {
        let sig = Signature::parse("aiu").unwrap();
        let data = [8, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 9, 0, 0, 0];
        let mut r = Reader::new(&data, &sig);
        let items: Vec<i32> = r.get().unwrap();
        assert_eq!(items, vec![1, 2]);
        assert_eq!(r.position(), 12);
        assert_eq!(r.get_u32().unwrap(), 9);
        assert!(r.is_finished());
    }

    #[test]
    fn test_element_crossing_array_end() {
        let sig = Signature::parse("aiu").unwrap();
        // The array claims 6 bytes, so the second int32 would cross its end
        // into the trailing value.
        let data = [6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 9, 0, 0, 0, 0, 0];
        let mut r = Reader::new(&data, &sig);
        r.open_array().unwrap();
        assert_eq!(r.get_i32().unwrap(), 1);
        assert!(r.has_more());
        let e = r.get_i32().unwrap_err();
        assert_eq!(
            *e.kind(),
            ErrorKind::InvalidData("read past the end of the array".into())
        );
    }

    #[test]
    fn test_typed_getter_mismatch() {
        let sig = Signature::parse("s").unwrap();
        let data = [1, 0, 0, 0, b'x', 0];
        let mut r = Reader::new(&data, &sig);
        let e = r.get_u32().unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::TypeMismatch { .. }));
        assert!(r.open_array().is_err());
        assert!(r.open_variant().is_err());
        // A failed getter consumes nothing.
        assert_eq!(r.position(), 0);
        assert_eq!(r.get_str().unwrap(), "x");
    }

    #[test]
    fn test_nested_variant_roundtrip() {
        let inner = Variant::new(Value::Struct(vec![
            Value::Byte(7),
            Value::String("x".into()),
        ]));
        let outer = Variant::new(Value::Variant(Box::new(inner.clone())));
        let sig = Signature::parse("v").unwrap();

        let mut w = crate::writer::Writer::new(&sig);
        w.append_variant(&outer).unwrap();
        let bytes = w.finish().unwrap();
        assert_eq!(&bytes[..9], &[1, b'v', 0, 4, b'(', b'y', b's', b')', 0]);
        assert_eq!(bytes[16], 7);
        assert_eq!(bytes.len(), 26);

        let mut r = Reader::new(&bytes, &sig);
        let back = r.get_variant().unwrap();
        assert_eq!(back, outer);
        assert!(r.is_finished());
        assert_eq!(r.position(), bytes.len());
        match back.value() {
            Value::Variant(v) => assert_eq!(**v, inner),
            other => panic!("expected a variant, got {}", other),
        }
    }
}
