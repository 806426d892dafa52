//! Messages and their wire framing.
//!
//! A frame is a 12 byte preamble (endianness marker, type, flags, protocol
//! version, body length, serial), an array of header fields `a(yv)` padded
//! to 8 bytes, then exactly body-length bytes of body.

use std::fmt;

use bitflags::bitflags;
use chainerror::*;
use dbuslink_signature::{BasicType, Signature, Type};
use serde_derive::{Deserialize, Serialize};

use crate::cursor::{align_up, Endianness, MAX_MESSAGE_LENGTH};
use crate::error::*;
use crate::marshal::{Arguments, FromArguments};
use crate::names::{self, ObjectPath};
use crate::reader::Reader;
use crate::value::Value;
use crate::variant::Variant;
use crate::writer::Writer;

pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed preamble plus the header field array length.
pub(crate) const MIN_HEADER_LENGTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<MessageType> {
        match v {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    /// The name used in match rules.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u8 {
        const NO_REPLY_EXPECTED = 0x1;
        const NO_AUTO_START = 0x2;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

mod field {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
    pub const UNIX_FDS: u8 = 9;
}

fn header_fields_type() -> Type {
    Type::Array(Box::new(Type::Struct(vec![
        Type::Basic(BasicType::Byte),
        Type::Variant,
    ])))
}

fn header_signature() -> Result<Signature> {
    let fixed = [
        BasicType::Byte,
        BasicType::Byte,
        BasicType::Byte,
        BasicType::Byte,
        BasicType::UInt32,
        BasicType::UInt32,
    ];
    let types = fixed
        .iter()
        .map(|b| Type::Basic(*b))
        .chain(std::iter::once(header_fields_type()));
    Signature::from_types(types).map_context(ErrorKind::from_parse)
}

/// The unit of communication. Built with a [`MessageBuilder`], read-only
/// afterwards; the serial is assigned by the connection sending it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    message_type: MessageType,
    flags: Flags,
    serial: u32,
    endian: Endianness,
    path: Option<ObjectPath>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    destination: Option<String>,
    sender: Option<String>,
    signature: Signature,
    unix_fds: Option<u32>,
    body: Vec<u8>,
}

impl Message {
    pub fn method_call(path: &str, member: &str) -> MessageBuilder {
        MessageBuilder::new(MessageType::MethodCall)
            .path(path)
            .member(member)
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> MessageBuilder {
        MessageBuilder::new(MessageType::Signal)
            .path(path)
            .interface(interface)
            .member(member)
    }

    /// Start the return for `call`, addressed to its sender.
    pub fn method_return(call: &Message) -> MessageBuilder {
        let mut b = MessageBuilder::new(MessageType::MethodReturn)
            .reply_serial(call.serial)
            .endianness(call.endian);
        if let Some(sender) = &call.sender {
            b = b.destination(sender);
        }
        b
    }

    /// Start an error reply for `call`, addressed to its sender.
    pub fn error(call: &Message, error_name: &str) -> MessageBuilder {
        let mut b = MessageBuilder::new(MessageType::Error)
            .reply_serial(call.serial)
            .error_name(error_name)
            .endianness(call.endian);
        if let Some(sender) = &call.sender {
            b = b.destination(sender);
        }
        b
    }

    /// A complete error reply carrying the kind's name and text.
    pub fn error_reply(call: &Message, kind: &ErrorKind) -> Result<Message> {
        Message::error(call, kind.error_name())
            .body(&(kind.error_text(),))?
            .build()
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Zero until the message is sent or when it was never sent.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    pub fn path(&self) -> Option<&ObjectPath> {
        self.path.as_ref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn unix_fds(&self) -> Option<u32> {
        self.unix_fds
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(Flags::NO_REPLY_EXPECTED)
    }

    pub(crate) fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    /// A cursor over the body.
    pub fn reader(&self) -> Reader<'_> {
        Reader::with_endianness(&self.body, &self.signature, self.endian)
    }

    /// Decode the whole body; `T`'s signature must equal the body's.
    pub fn body<T: FromArguments>(&self) -> Result<T> {
        let wanted = T::signature()?;
        if wanted != self.signature {
            return Err(ErrorKind::TypeMismatch {
                expected: self.signature.to_string(),
                found: wanted.to_string(),
            }.into_error());
        }
        let mut r = self.reader();
        T::unmarshal_args(&mut r)
    }

    pub fn body_values(&self) -> Result<Vec<Value>> {
        let mut r = self.reader();
        let mut values = Vec::new();
        while !r.is_finished() {
            values.push(r.read_value()?);
        }
        Ok(values)
    }

    /// First string argument, as carried by error replies.
    pub fn error_text(&self) -> String {
        match self.signature.types().first() {
            Some(Type::Basic(BasicType::String)) => {
                self.reader().get_string().unwrap_or_default()
            }
            _ => String::new(),
        }
    }

    fn header_fields(&self) -> Vec<(u8, Value)> {
        let mut fields = Vec::new();
        if let Some(v) = &self.path {
            fields.push((field::PATH, Value::ObjectPath(v.clone())));
        }
        if let Some(v) = &self.interface {
            fields.push((field::INTERFACE, Value::String(v.clone())));
        }
        if let Some(v) = &self.member {
            fields.push((field::MEMBER, Value::String(v.clone())));
        }
        if let Some(v) = &self.error_name {
            fields.push((field::ERROR_NAME, Value::String(v.clone())));
        }
        if let Some(v) = self.reply_serial {
            fields.push((field::REPLY_SERIAL, Value::UInt32(v)));
        }
        if let Some(v) = &self.destination {
            fields.push((field::DESTINATION, Value::String(v.clone())));
        }
        if let Some(v) = &self.sender {
            fields.push((field::SENDER, Value::String(v.clone())));
        }
        if !self.signature.is_empty() {
            fields.push((field::SIGNATURE, Value::Signature(self.signature.clone())));
        }
        if let Some(v) = self.unix_fds {
            fields.push((field::UNIX_FDS, Value::UInt32(v)));
        }
        fields
    }

    /// Serialize with the serial assigned on send.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.encode(self.serial)
    }

    pub(crate) fn encode(&self, serial: u32) -> Result<Vec<u8>> {
        if serial == 0 {
            return Err(ErrorKind::MalformedMessage(
                "message has no serial".into()
            ).into_error());
        }
        let body_len = u32::try_from(self.body.len())
            .context(ErrorKind::MalformedMessage("body too long".into()))?;

        let mut w = Writer::with_endianness(&header_signature()?, self.endian);
        w.append_byte(self.endian.marker())?;
        w.append_byte(self.message_type as u8)?;
        w.append_byte(self.flags.bits())?;
        w.append_byte(PROTOCOL_VERSION)?;
        w.append_u32(body_len)?;
        w.append_u32(serial)?;
        w.open_array()?;
        for (code, value) in self.header_fields() {
            w.open_struct()?;
            w.append_byte(code)?;
            w.append_variant(&Variant::new(value))?;
            w.close_struct()?;
        }
        w.close_array()?;
        w.pad(8);
        w.extend_raw(&self.body);
        if w.len() > MAX_MESSAGE_LENGTH {
            return Err(ErrorKind::MalformedMessage(format!(
                "message of {} bytes exceeds the maximum of {}",
                w.len(),
                MAX_MESSAGE_LENGTH
            )).into_error());
        }
        w.finish()
    }

    /// Parse one complete frame. `bytes` must hold exactly the frame.
    pub fn parse(bytes: &[u8]) -> Result<Message> {
        let framing = |reason: String| ErrorKind::Framing(reason).into_error();

        if bytes.len() < MIN_HEADER_LENGTH {
            return Err(framing("frame shorter than the fixed header".into()));
        }
        let endian = Endianness::from_marker(bytes[0])
            .ok_or_else(|| framing(format!("invalid endianness marker {:#04x}", bytes[0])))?;
        let message_type = MessageType::from_u8(bytes[1])
            .ok_or_else(|| framing(format!("unknown message type {}", bytes[1])))?;
        let flags = Flags::from_bits_truncate(bytes[2]);
        if bytes[3] != PROTOCOL_VERSION {
            return Err(framing(format!("unsupported protocol version {}", bytes[3])));
        }
        let lengths = frame_lengths(endian, bytes);
        let serial = lengths.serial;
        if serial == 0 {
            return Err(framing("serial is zero".into()));
        }
        let total = lengths.total();
        if total != bytes.len() {
            return Err(framing(format!(
                "declared length {} does not match frame length {}",
                total,
                bytes.len()
            )));
        }

        let mut message = Message {
            message_type,
            flags,
            serial,
            endian,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            unix_fds: None,
            body: Vec::new(),
        };

        let fields_signature =
            Signature::try_from(header_fields_type()).map_err(|e| framing(e.to_string()))?;
        let mut r = Reader::at_offset(bytes, 12, &fields_signature, endian);
        let fields = r.read_value().map_err(|e| framing(e.to_string()))?;
        if let Value::Array(fields) = fields {
            for field in fields.into_items() {
                if let Value::Struct(mut pair) = field {
                    if let (Some(Value::Variant(v)), Some(Value::Byte(code))) = (pair.pop(), pair.pop())
                    {
                        message.set_header_field(code, v.into_value())?;
                    }
                }
            }
        }

        let fields_end = r.position();
        if bytes[fields_end..lengths.header_end].iter().any(|b| *b != 0) {
            return Err(framing("non-zero header padding".into()));
        }
        if message.signature.is_empty() && lengths.body_len > 0 {
            return Err(framing("body without a signature".into()));
        }
        message.body = bytes[lengths.header_end..].to_vec();
        message.check_required().map_err(|e| framing(e.to_string()))?;
        Ok(message)
    }

    fn set_header_field(&mut self, code: u8, value: Value) -> Result<()> {
        let bad = |code: u8, value: &Value| {
            ErrorKind::Framing(format!(
                "header field {} has signature '{}'",
                code,
                value.value_type()
            )).into_error()
        };
        match (code, value) {
            (field::PATH, Value::ObjectPath(v)) => self.path = Some(v),
            (field::INTERFACE, Value::String(v)) => self.interface = Some(v),
            (field::MEMBER, Value::String(v)) => self.member = Some(v),
            (field::ERROR_NAME, Value::String(v)) => self.error_name = Some(v),
            (field::REPLY_SERIAL, Value::UInt32(v)) => self.reply_serial = Some(v),
            (field::DESTINATION, Value::String(v)) => self.destination = Some(v),
            (field::SENDER, Value::String(v)) => self.sender = Some(v),
            (field::SIGNATURE, Value::Signature(v)) => self.signature = v,
            (field::UNIX_FDS, Value::UInt32(v)) => self.unix_fds = Some(v),
            (code, value) if (field::PATH..=field::UNIX_FDS).contains(&code) => {
                return Err(bad(code, &value))
            }
            // Unknown header fields are ignored.
            _ => {}
        }
        Ok(())
    }

    fn check_required(&self) -> Result<()> {
        let missing = |what: &str| {
            ErrorKind::MalformedMessage(format!(
                "{} without {}",
                self.message_type, what
            )).into_error()
        };
        match self.message_type {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return Err(missing("path"));
                }
                if self.member.is_none() {
                    return Err(missing("member"));
                }
            }
            MessageType::Signal => {
                if self.path.is_none() {
                    return Err(missing("path"));
                }
                if self.interface.is_none() {
                    return Err(missing("interface"));
                }
                if self.member.is_none() {
                    return Err(missing("member"));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err(missing("reply serial"));
                }
            }
            MessageType::Error => {
                if self.reply_serial.is_none() {
                    return Err(missing("reply serial"));
                }
                if self.error_name.is_none() {
                    return Err(missing("error name"));
                }
            }
        }
        if self.reply_serial == Some(0) {
            return Err(missing("a non-zero reply serial"));
        }
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} serial={}", self.message_type, self.serial)?;
        if let Some(v) = self.reply_serial {
            write!(f, " reply_serial={}", v)?;
        }
        if let Some(v) = &self.path {
            write!(f, " path={}", v)?;
        }
        if let Some(v) = &self.interface {
            write!(f, " interface={}", v)?;
        }
        if let Some(v) = &self.member {
            write!(f, " member={}", v)?;
        }
        if let Some(v) = &self.error_name {
            write!(f, " error_name={}", v)?;
        }
        write!(f, " signature=\"{}\"", self.signature)
    }
}

/// Lengths decoded from the first 16 bytes of a frame.
pub(crate) struct FrameLengths {
    pub body_len: usize,
    pub serial: u32,
    pub header_end: usize,
}

impl FrameLengths {
    pub fn total(&self) -> usize {
        self.header_end + self.body_len
    }
}

/// Decode the length fields; `bytes` must hold at least
/// [`MIN_HEADER_LENGTH`] bytes.
pub(crate) fn frame_lengths(endian: Endianness, bytes: &[u8]) -> FrameLengths {
    let word = |at: usize| {
        let mut b = [0u8; 4];
        b.copy_from_slice(&bytes[at..at + 4]);
        endian.read_u32(b) as usize
    };
    FrameLengths {
        body_len: word(4),
        serial: word(8) as u32,
        header_end: align_up(MIN_HEADER_LENGTH + word(12), 8),
    }
}

/// Check `body` against `signature`: every value decodes and nothing
/// trails.
pub fn validate_body(signature: &Signature, body: &[u8], endian: Endianness) -> Result<()> {
    let mut r = Reader::with_endianness(body, signature, endian);
    while !r.is_finished() {
        r.read_value()?;
    }
    if r.position() != body.len() {
        return Err(ErrorKind::InvalidData(format!(
            "{} bytes trail the body",
            body.len() - r.position()
        )).into_error());
    }
    Ok(())
}

/// Mutable form of a [`Message`].
///
/// ```rust
/// use dbuslink::{Message, MessageType};
///
/// let msg = Message::method_call("/org/example/Echo", "Echo")
///     .interface("org.example.Echo")
///     .body(&("ping",))
///     .unwrap()
///     .build()
///     .unwrap();
/// assert_eq!(msg.message_type(), MessageType::MethodCall);
/// assert_eq!(msg.signature(), "s");
/// let (s,): (String,) = msg.body().unwrap();
/// assert_eq!(s, "ping");
/// ```
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message_type: MessageType,
    flags: Flags,
    endian: Endianness,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    destination: Option<String>,
    sender: Option<String>,
    signature: Signature,
    unix_fds: Option<u32>,
    body: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(message_type: MessageType) -> MessageBuilder {
        MessageBuilder {
            message_type,
            flags: Flags::empty(),
            endian: Endianness::default(),
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            unix_fds: None,
            body: Vec::new(),
        }
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }

    pub fn member(mut self, member: &str) -> Self {
        self.member = Some(member.to_string());
        self
    }

    pub fn error_name(mut self, error_name: &str) -> Self {
        self.error_name = Some(error_name.to_string());
        self
    }

    pub fn reply_serial(mut self, serial: u32) -> Self {
        self.reply_serial = Some(serial);
        self
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn no_reply_expected(mut self) -> Self {
        self.flags |= Flags::NO_REPLY_EXPECTED;
        self
    }

    pub fn unix_fds(mut self, count: u32) -> Self {
        self.unix_fds = Some(count);
        self
    }

    /// Byte order of the frame; set before encoding a body.
    pub fn endianness(mut self, endian: Endianness) -> Self {
        self.endian = endian;
        self
    }

    pub fn body<A: Arguments + ?Sized>(mut self, args: &A) -> Result<Self> {
        let signature = A::signature()?;
        let mut w = Writer::with_endianness(&signature, self.endian);
        args.marshal_args(&mut w)?;
        self.body = w.finish()?;
        self.signature = signature;
        Ok(self)
    }

    /// Encode the body with a writer over `signature`.
    pub fn body_with<F>(mut self, signature: &Signature, f: F) -> Result<Self>
    where
        F: FnOnce(&mut Writer) -> Result<()>,
    {
        let mut w = Writer::with_endianness(signature, self.endian);
        f(&mut w)?;
        self.body = w.finish()?;
        self.signature = signature.clone();
        Ok(self)
    }

    pub fn body_values(self, values: &[Value]) -> Result<Self> {
        let signature = Signature::from_types(values.iter().map(Value::value_type))
            .map_context(ErrorKind::from_parse)?;
        self.body_with(&signature, |w| {
            for v in values {
                w.append_value(v)?;
            }
            Ok(())
        })
    }

    /// Use an already encoded body; it is validated by
    /// [`build`](MessageBuilder::build).
    pub fn body_raw(mut self, signature: Signature, body: Vec<u8>) -> Self {
        self.signature = signature;
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Message> {
        let path = match self.path {
            Some(p) => Some(ObjectPath::new(p)?),
            None => None,
        };
        if let Some(v) = &self.interface {
            names::check_interface(v)?;
        }
        if let Some(v) = &self.member {
            names::check_member(v)?;
        }
        if let Some(v) = &self.error_name {
            names::check_error_name(v)?;
        }
        if let Some(v) = &self.destination {
            names::check_bus_name(v)?;
        }
        if let Some(v) = &self.sender {
            names::check_bus_name(v)?;
        }
        validate_body(&self.signature, &self.body, self.endian)?;
        if self.body.len() > MAX_MESSAGE_LENGTH {
            return Err(ErrorKind::MalformedMessage(
                "body exceeds the maximum message length".into()
            ).into_error());
        }

        let message = Message {
            message_type: self.message_type,
            flags: self.flags,
            serial: 0,
            endian: self.endian,
            path,
            interface: self.interface,
            member: self.member,
            error_name: self.error_name,
            reply_serial: self.reply_serial,
            destination: self.destination,
            sender: self.sender,
            signature: self.signature,
            unix_fds: self.unix_fds,
            body: self.body,
        };
        message.check_required()?;
        Ok(message)
    }
}
