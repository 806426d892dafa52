//! Binding core for the [D-Bus](https://dbus.freedesktop.org) message protocol
//!
//! The crate covers the parts between a byte stream and application code:
//!
//! * type signatures (re-exported from `dbuslink_signature`), the
//!   [`Writer`] and [`Reader`] cursors that encode and decode message bodies
//!   with the protocol's alignment rules, and [`Variant`] values;
//! * [`Message`] framing, including a sans-I/O [`sansio::Framer`] that
//!   splits a byte stream into messages;
//! * the [`Connection`], which assigns serials, matches replies to
//!   [`PendingCall`]s, routes inbound calls to registered [`Object`]s and
//!   fans out signals to subscribers;
//! * the [`Dispatcher`], which serves connections on background I/O threads
//!   and hands handlers to [`Worker`] threads where an object asks for it;
//! * client proxies: [`ObjectProxy`], [`InterfaceProxy`], [`MethodProxy`]
//!   and [`SignalProxy`].
//!
//! The authentication handshake with a bus daemon is not part of this crate;
//! a [`Transport`] is expected to be connected and authenticated already.
//!
//! An object is exported by registering its interfaces on a connection:
//!
//!```rust
//! use std::time::Duration;
//! use dbuslink::*;
//!
//! # fn main() -> dbuslink::Result<()> {
//! let (server, client) = Connection::pair(ConnectionConfig::default());
//!
//! let echo = Interface::new("org.example.Echo")?
//!     .with_method(Method::typed("Echo", |(s,): (String,)| Ok((s,)))?)?
//!     .with_method(Method::new("Count", "as", "u", |call| {
//!         let (items,): (Vec<String>,) = call.args()?;
//!         call.reply(&(items.len() as u32,))
//!     })?)?;
//! server.register_object(Object::new("/org/example/Echo")?.with_interface(echo)?)?;
//!
//! let dispatcher = Dispatcher::new(DispatcherConfig::default());
//! dispatcher.add_connection(&server)?;
//! dispatcher.start()?;
//!
//! let call = Message::method_call("/org/example/Echo", "Echo")
//!     .interface("org.example.Echo")
//!     .body(&("hello",))?
//!     .build()?;
//! let reply = client.send_and_block(call, Some(Duration::from_secs(5)))?;
//! let (s,): (String,) = reply.body()?;
//! assert_eq!(s, "hello");
//!
//! let count = ObjectProxy::new(&client, None, "/org/example/Echo")?
//!     .interface("org.example.Echo")?
//!     .method("Count", "as", "u")?;
//! let (n,): (u32,) = count.call(&(vec!["a", "b"],))?;
//! assert_eq!(n, 2);
//!
//! dispatcher.stop();
//! # Ok(())
//! # }
//!```
//!
//! Without a dispatcher, a thread calling [`Connection::send_and_block`]
//! reads the connection itself until its reply arrives, and
//! [`Connection::process`] dispatches queued calls and signals on the
//! calling thread.
//!
//! Bodies can also be written and read value by value:
//!
//!```rust
//! use dbuslink::{Reader, Signature, Writer};
//!
//! let sig = Signature::parse("a{sv}").unwrap();
//! let mut w = Writer::new(&sig);
//! w.open_array().unwrap();
//! w.open_dict_entry().unwrap();
//! w.append_str("answer").unwrap();
//! w.append_variant(&dbuslink::Variant::wrap(&42u32).unwrap()).unwrap();
//! w.close_dict_entry().unwrap();
//! w.close_array().unwrap();
//! let bytes = w.finish().unwrap();
//!
//! let mut r = Reader::new(&bytes, &sig);
//! r.open_array().unwrap();
//! assert!(r.has_more());
//! r.open_dict_entry().unwrap();
//! assert_eq!(r.get_str().unwrap(), "answer");
//! assert_eq!(r.get_variant().unwrap().unwrap::<u32>().unwrap(), 42);
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use dbuslink_signature::{BasicType, ParseError, Signature, Type};

pub use crate::address::{BusAddress, BusType, SYSTEM_BUS_DEFAULT_ADDRESS};
pub use crate::config::{ConnectionConfig, DispatcherConfig};
pub use crate::connection::{
    Connection, ReleaseNameReply, RequestNameFlags, RequestNameReply, SignalStream, SignalToken,
    WeakConnection, BUS_INTERFACE, BUS_NAME, BUS_PATH,
};
pub use crate::cursor::{Endianness, MAX_ARRAY_LENGTH, MAX_DEPTH, MAX_MESSAGE_LENGTH};
pub use crate::dispatcher::Dispatcher;
pub use crate::error::*;
pub use crate::introspect::{
    InterfaceDescription, MethodDescription, ObjectDescription, SignalDescription,
};
pub use crate::marshal::{
    encode_args, Arguments, BasicWireType, FromArguments, Marshal, Unmarshal, WireType,
};
pub use crate::match_rule::MatchRule;
pub use crate::message::{validate_body, Flags, Message, MessageBuilder, MessageType, PROTOCOL_VERSION};
pub use crate::names::{
    is_valid_bus_name, is_valid_error_name, is_valid_interface_name, is_valid_member_name,
    is_valid_object_path, ObjectPath,
};
pub use crate::object::{Call, Interface, Method, MethodHandler, Object};
pub use crate::peer::{machine_id, PEER_INTERFACE};
pub use crate::pending::PendingCall;
pub use crate::proxy::{
    InterfaceProxy, MethodProxy, ObjectProxy, PendingReply, SignalProxy,
};
pub use crate::reader::Reader;
pub use crate::stream::Stream;
pub use crate::transport::{MemoryTransport, StreamTransport, Transport};
pub use crate::value::{Array, Dict, UnixFd, Value};
pub use crate::variant::Variant;
pub use crate::worker::{worker_channel, DeliveryPolicy, Worker, WorkerHandle, WorkerQueue};
pub use crate::writer::Writer;

mod error;
mod address;
mod config;
mod connection;
mod cursor;
mod dispatcher;
mod introspect;
mod marshal;
mod match_rule;
mod message;
mod names;
mod object;
mod peer;
mod pending;
mod proxy;
mod reader;
mod registry;
pub mod sansio;
mod stream;
#[cfg(test)]
mod test;
mod timer;
mod transport;
mod value;
mod variant;
mod worker;
mod writer;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
