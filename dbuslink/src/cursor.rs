//! Shared machinery of the [`Reader`](crate::Reader) and
//! [`Writer`](crate::Writer): byte order and the signature type stack that
//! decides which type comes next.

use dbuslink_signature::{Signature, Type};
use serde_derive::{Deserialize, Serialize};

use crate::error::*;

/// Maximum encoded length of one array in bytes.
pub const MAX_ARRAY_LENGTH: usize = 1 << 26;
/// Maximum length of a whole message in bytes.
pub const MAX_MESSAGE_LENGTH: usize = 1 << 27;
/// Maximum container nesting, variants included.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn native() -> Endianness {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    /// The marker byte opening every message.
    pub fn marker(self) -> u8 {
        match self {
            Endianness::Little => b'l',
            Endianness::Big => b'B',
        }
    }

    pub fn from_marker(marker: u8) -> Option<Endianness> {
        match marker {
            b'l' => Some(Endianness::Little),
            b'B' => Some(Endianness::Big),
            _ => None,
        }
    }

    pub(crate) fn u16_bytes(self, v: u16) -> [u8; 2] {
        match self {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        }
    }

    pub(crate) fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        }
    }

    pub(crate) fn u64_bytes(self, v: u64) -> [u8; 8] {
        match self {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        }
    }

    pub(crate) fn read_u16(self, b: [u8; 2]) -> u16 {
        match self {
            Endianness::Little => u16::from_le_bytes(b),
            Endianness::Big => u16::from_be_bytes(b),
        }
    }

    pub(crate) fn read_u32(self, b: [u8; 4]) -> u32 {
        match self {
            Endianness::Little => u32::from_le_bytes(b),
            Endianness::Big => u32::from_be_bytes(b),
        }
    }

    pub(crate) fn read_u64(self, b: [u8; 8]) -> u64 {
        match self {
            Endianness::Little => u64::from_le_bytes(b),
            Endianness::Big => u64::from_be_bytes(b),
        }
    }
}

impl Default for Endianness {
    fn default() -> Self {
        Endianness::Little
    }
}

pub(crate) fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) / alignment * alignment
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Container {
    Body,
    Struct,
    DictEntry,
    Variant,
}

impl Container {
    fn name(self) -> &'static str {
        match self {
            Container::Body => "end of body",
            Container::Struct => "end of struct",
            Container::DictEntry => "end of dict entry",
            Container::Variant => "end of variant",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ArrayBound {
    /// Offset of the length prefix and of the first element.
    Write { len_at: usize, start: usize },
    /// Offset one past the last element.
    Read { end: usize },
}

#[derive(Debug)]
enum Frame {
    Seq {
        types: Vec<Type>,
        next: usize,
        container: Container,
    },
    Array {
        element: Type,
        bound: ArrayBound,
    },
}

/// Tracks the position within a signature while a cursor walks a body.
#[derive(Debug)]
pub(crate) struct TypeStack {
    frames: Vec<Frame>,
}

impl TypeStack {
    pub(crate) fn new(signature: &Signature) -> TypeStack {
        TypeStack {
            frames: vec![Frame::Seq {
                types: signature.types().to_vec(),
                next: 0,
                container: Container::Body,
            }],
        }
    }

    /// The type the next value must have, if any.
    pub(crate) fn peek(&self) -> Option<&Type> {
        match self.frames.last()? {
            Frame::Seq { types, next, .. } => types.get(*next),
            Frame::Array { element, .. } => Some(element),
        }
    }

    fn remaining(&self) -> String {
        match self.frames.last() {
            Some(Frame::Seq {
                types,
                next,
                container,
            }) => {
                if *next >= types.len() {
                    container.name().to_string()
                } else {
                    types[*next..].iter().map(Type::signature).collect()
                }
            }
            Some(Frame::Array { element, .. }) => element.signature(),
            None => "end of body".to_string(),
        }
    }

    pub(crate) fn mismatch(&self, found: &str) -> Error {
        ErrorKind::TypeMismatch {
            expected: self.remaining(),
            found: found.to_string(),
        }.into_error()
    }

    /// Consume the next type, whatever it is.
    pub(crate) fn advance(&mut self, found: &str) -> Result<Type> {
        let t = match self.frames.last_mut() {
            Some(Frame::Seq { types, next, .. }) => match types.get(*next) {
                Some(t) => {
                    *next += 1;
                    Some(t.clone())
                }
                None => None,
            },
            Some(Frame::Array { element, .. }) => Some(element.clone()),
            None => None,
        };
        match t {
            Some(t) => Ok(t),
            None => Err(self.mismatch(found)),
        }
    }

    /// Consume the next type, which must equal `wanted`.
    pub(crate) fn expect(&mut self, wanted: &Type) -> Result<()> {
        match self.peek() {
            Some(t) if t == wanted => {
                self.advance(&wanted.signature())?;
                Ok(())
            }
            _ => Err(self.mismatch(&wanted.signature())),
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub(crate) fn push_seq(&mut self, types: Vec<Type>, container: Container) {
        self.frames.push(Frame::Seq {
            types,
            next: 0,
            container,
        });
    }

    pub(crate) fn push_array(&mut self, element: Type, bound: ArrayBound) {
        self.frames.push(Frame::Array { element, bound });
    }

    /// Leave a struct, dict entry or variant; all of its types must have
    /// been consumed.
    pub(crate) fn pop_seq(&mut self, container: Container) -> Result<()> {
        match self.frames.last() {
            Some(Frame::Seq {
                types,
                next,
                container: c,
            }) if *c == container && container != Container::Body => {
                if *next < types.len() {
                    return Err(self.mismatch(container.name()));
                }
            }
            _ => return Err(self.mismatch(container.name())),
        }
        self.frames.pop();
        Ok(())
    }

    pub(crate) fn pop_array(&mut self) -> Result<ArrayBound> {
        match self.frames.last() {
            Some(Frame::Array { bound, .. }) => {
                let bound = *bound;
                self.frames.pop();
                Ok(bound)
            }
            _ => Err(self.mismatch("end of array")),
        }
    }

    /// Bound of the innermost array, if inside one.
    pub(crate) fn innermost_array(&self) -> Option<ArrayBound> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Array { bound, .. } => Some(*bound),
            _ => None,
        })
    }

    /// Bound of the array directly on top of the stack.
    pub(crate) fn current_array(&self) -> Option<ArrayBound> {
        match self.frames.last() {
            Some(Frame::Array { bound, .. }) => Some(*bound),
            _ => None,
        }
    }

    /// `true` when every type of the signature has been consumed.
    pub(crate) fn is_complete(&self) -> bool {
        match self.frames.as_slice() {
            [Frame::Seq { types, next, .. }] => *next >= types.len(),
            _ => false,
        }
    }

    pub(crate) fn ensure_complete(&self) -> Result<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(self.mismatch("end of body"))
        }
    }
}
