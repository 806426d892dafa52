/*!
 dbuslink_signature crate for parsing D-Bus type signatures.

 A signature is a compact string describing the shape of a marshaled value,
 e.g. `"a{sv}"` for a map from strings to variants. Parsing turns it into a
 sequence of complete [`Type`] nodes.

 # Examples

 ```rust
 use dbuslink_signature::{BasicType, Signature, Type};

 let sig = Signature::parse("sa{sv}").unwrap();
 assert_eq!(sig.types().len(), 2);
 assert_eq!(sig.types()[0], Type::Basic(BasicType::String));
 assert_eq!(
     sig.types()[1],
     Type::Array(Box::new(Type::DictEntry(
         BasicType::String,
         Box::new(Type::Variant)
     )))
 );
 assert_eq!(sig.to_string(), "sa{sv}");
 ```
!*/

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

#[cfg(test)]
mod test;

/// Maximum length of a signature string in bytes.
pub const MAX_SIGNATURE_LENGTH: usize = 255;
/// Maximum nesting of arrays.
pub const MAX_ARRAY_DEPTH: usize = 32;
/// Maximum nesting of structs and dict entries.
pub const MAX_STRUCT_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed signature '{signature}' at offset {offset}: {reason}")]
    Malformed {
        signature: String,
        offset: usize,
        reason: &'static str,
    },
    #[error("signature '{signature}' exceeds protocol limits: {reason}")]
    LimitExceeded {
        signature: String,
        reason: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Fixed primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BasicType {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
}

impl BasicType {
    pub fn code(self) -> char {
        match self {
            BasicType::Byte => 'y',
            BasicType::Boolean => 'b',
            BasicType::Int16 => 'n',
            BasicType::UInt16 => 'q',
            BasicType::Int32 => 'i',
            BasicType::UInt32 => 'u',
            BasicType::Int64 => 'x',
            BasicType::UInt64 => 't',
            BasicType::Double => 'd',
            BasicType::String => 's',
            BasicType::ObjectPath => 'o',
            BasicType::Signature => 'g',
            BasicType::UnixFd => 'h',
        }
    }

    pub fn from_code(code: char) -> Option<BasicType> {
        Some(match code {
            'y' => BasicType::Byte,
            'b' => BasicType::Boolean,
            'n' => BasicType::Int16,
            'q' => BasicType::UInt16,
            'i' => BasicType::Int32,
            'u' => BasicType::UInt32,
            'x' => BasicType::Int64,
            't' => BasicType::UInt64,
            'd' => BasicType::Double,
            's' => BasicType::String,
            'o' => BasicType::ObjectPath,
            'g' => BasicType::Signature,
            'h' => BasicType::UnixFd,
            _ => return None,
        })
    }

    /// Wire alignment in bytes, relative to the start of the message.
    pub fn alignment(self) -> usize {
        match self {
            BasicType::Byte | BasicType::Signature => 1,
            BasicType::Int16 | BasicType::UInt16 => 2,
            BasicType::Boolean
            | BasicType::Int32
            | BasicType::UInt32
            | BasicType::UnixFd
            | BasicType::String
            | BasicType::ObjectPath => 4,
            BasicType::Int64 | BasicType::UInt64 | BasicType::Double => 8,
        }
    }

    /// Encoded size for fixed-width types, `None` for strings.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            BasicType::String | BasicType::ObjectPath | BasicType::Signature => None,
            BasicType::Byte => Some(1),
            other => Some(other.alignment()),
        }
    }
}

impl fmt::Display for BasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One complete type.
///
/// A `DictEntry` only ever appears as the element of an `Array`; its key is
/// a [`BasicType`] by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Basic(BasicType),
    Array(Box<Type>),
    Struct(Vec<Type>),
    DictEntry(BasicType, Box<Type>),
    Variant,
}

impl Type {
    /// Parse a string holding exactly one complete type.
    pub fn parse_single(s: &str) -> Result<Type> {
        let sig = Signature::parse(s)?;
        let mut types = sig.types;
        if types.len() != 1 {
            return Err(ParseError::Malformed {
                signature: s.to_string(),
                offset: 0,
                reason: "expected exactly one complete type",
            });
        }
        Ok(types.remove(0))
    }

    pub fn alignment(&self) -> usize {
        match self {
            Type::Basic(b) => b.alignment(),
            Type::Array(_) => 4,
            Type::Struct(_) | Type::DictEntry(_, _) => 8,
            Type::Variant => 1,
        }
    }

    pub fn is_basic(&self) -> bool {
        matches!(self, Type::Basic(_))
    }

    pub fn as_basic(&self) -> Option<BasicType> {
        match self {
            Type::Basic(b) => Some(*b),
            _ => None,
        }
    }

    /// The signature text of this single type.
    pub fn signature(&self) -> String {
        let mut s = String::new();
        self.write_to(&mut s);
        s
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Type::Basic(b) => out.push(b.code()),
            Type::Array(element) => {
                out.push('a');
                element.write_to(out);
            }
            Type::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_to(out);
                }
                out.push(')');
            }
            Type::DictEntry(key, value) => {
                out.push('{');
                out.push(key.code());
                value.write_to(out);
                out.push('}');
            }
            Type::Variant => out.push('v'),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

impl From<BasicType> for Type {
    fn from(b: BasicType) -> Self {
        Type::Basic(b)
    }
}

/// A parsed, immutable signature: an ordered sequence of complete types.
///
/// The empty signature is valid and describes an empty message body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    text: String,
    types: Vec<Type>,
}

impl Signature {
    pub fn parse(s: &str) -> Result<Signature> {
        if s.len() > MAX_SIGNATURE_LENGTH {
            return Err(ParseError::LimitExceeded {
                signature: s.to_string(),
                reason: "longer than 255 bytes",
            });
        }

        let mut parser = Parser { text: s, pos: 0 };
        let mut types = Vec::new();
        while parser.pos < s.len() {
            types.push(parser.parse_type(0, 0)?);
        }

        Ok(Signature {
            text: s.to_string(),
            types,
        })
    }

    pub fn empty() -> Signature {
        Signature::default()
    }

    /// Build a signature from type nodes, checking every grammar rule and
    /// limit as if it had been parsed.
    pub fn from_types<I: IntoIterator<Item = Type>>(types: I) -> Result<Signature> {
        let mut text = String::new();
        for t in types {
            t.write_to(&mut text);
        }
        Signature::parse(&text)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn types(&self) -> &[Type] {
        &self.types
    }

    pub fn into_types(self) -> Vec<Type> {
        self.types
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Number of complete types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// The type if this signature holds exactly one complete type.
    pub fn single(&self) -> Option<&Type> {
        match self.types.as_slice() {
            [t] => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        Signature::parse(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = ParseError;

    fn try_from(s: &str) -> Result<Self> {
        Signature::parse(s)
    }
}

impl TryFrom<String> for Signature {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self> {
        Signature::parse(&s)
    }
}

/// Checked like [`Signature::from_types`]; a struct without fields, nesting
/// past the limits or a text longer than 255 bytes is an error.
impl TryFrom<Type> for Signature {
    type Error = ParseError;

    fn try_from(t: Type) -> Result<Self> {
        Signature::from_types(Some(t))
    }
}

impl AsRef<str> for Signature {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

impl PartialEq<str> for Signature {
    fn eq(&self, other: &str) -> bool {
        self.text == other
    }
}

impl PartialEq<&str> for Signature {
    fn eq(&self, other: &&str) -> bool {
        self.text == *other
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn malformed(&self, offset: usize, reason: &'static str) -> ParseError {
        ParseError::Malformed {
            signature: self.text.to_string(),
            offset,
            reason,
        }
    }

    fn limit(&self, reason: &'static str) -> ParseError {
        ParseError::LimitExceeded {
            signature: self.text.to_string(),
            reason,
        }
    }

    fn parse_type(&mut self, array_depth: usize, struct_depth: usize) -> Result<Type> {
        let offset = self.pos;
        let code = match self.peek() {
            Some(c) => c,
            None => return Err(self.malformed(offset, "expected a complete type")),
        };
        self.pos += 1;

        match code {
            b'a' => {
                if array_depth >= MAX_ARRAY_DEPTH {
                    return Err(self.limit("arrays nested deeper than 32"));
                }
                if self.peek() == Some(b'{') {
                    self.pos += 1;
                    self.parse_dict_entry(offset + 1, array_depth + 1, struct_depth)
                } else {
                    let element = self.parse_type(array_depth + 1, struct_depth)?;
                    Ok(Type::Array(Box::new(element)))
                }
            }
            b'(' => {
                if struct_depth >= MAX_STRUCT_DEPTH {
                    return Err(self.limit("structs nested deeper than 32"));
                }
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        None => return Err(self.malformed(offset, "unmatched '('")),
                        Some(_) => fields.push(self.parse_type(array_depth, struct_depth + 1)?),
                    }
                }
                if fields.is_empty() {
                    return Err(self.malformed(offset, "empty struct"));
                }
                Ok(Type::Struct(fields))
            }
            b'{' => Err(self.malformed(offset, "dict entry outside of an array")),
            b')' => Err(self.malformed(offset, "unmatched ')'")),
            b'}' => Err(self.malformed(offset, "unmatched '}'")),
            b'v' => Ok(Type::Variant),
            other => match BasicType::from_code(other as char) {
                Some(b) => Ok(Type::Basic(b)),
                None => Err(self.malformed(offset, "unknown type code")),
            },
        }
    }

    // Called with `pos` just past the opening '{'.
    fn parse_dict_entry(
        &mut self,
        offset: usize,
        array_depth: usize,
        struct_depth: usize,
    ) -> Result<Type> {
        if struct_depth >= MAX_STRUCT_DEPTH {
            return Err(self.limit("structs nested deeper than 32"));
        }
        match self.peek() {
            None => return Err(self.malformed(offset, "unmatched '{'")),
            Some(b'}') => return Err(self.malformed(offset, "empty dict entry")),
            Some(_) => {}
        }

        let key_offset = self.pos;
        let key = match self.parse_type(array_depth, struct_depth + 1)? {
            Type::Basic(b) => b,
            _ => return Err(self.malformed(key_offset, "dict entry key must be a basic type")),
        };

        match self.peek() {
            None => return Err(self.malformed(offset, "unmatched '{'")),
            Some(b'}') => return Err(self.malformed(self.pos, "dict entry requires a value type")),
            Some(_) => {}
        }
        let value = self.parse_type(array_depth, struct_depth + 1)?;

        match self.peek() {
            Some(b'}') => {
                self.pos += 1;
                Ok(Type::Array(Box::new(Type::DictEntry(key, Box::new(value)))))
            }
            Some(_) => Err(self.malformed(self.pos, "dict entry must hold exactly two types")),
            None => Err(self.malformed(offset, "unmatched '{'")),
        }
    }
}
