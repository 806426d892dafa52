//! Client side: proxies for remote objects, their methods and signals.
//!
//! Proxies hold a weak reference to their connection; using one after the
//! connection closed fails with [`ErrorKind::ConnectionClosed`].
//!
//! ```rust
//! use dbuslink::{Connection, ConnectionConfig, Method, ObjectProxy};
//!
//! let (server, client) = Connection::pair(ConnectionConfig::default());
//! server
//!     .register_method(
//!         "/org/example/Calc",
//!         "org.example.Calc",
//!         Method::typed("Add", |(a, b): (i32, i32)| Ok((a + b,))).unwrap(),
//!     )
//!     .unwrap();
//! std::thread::spawn(move || while server.process(std::time::Duration::from_millis(10)).is_ok() {});
//!
//! let add = ObjectProxy::new(&client, None, "/org/example/Calc")
//!     .unwrap()
//!     .interface("org.example.Calc")
//!     .unwrap()
//!     .method("Add", "ii", "i")
//!     .unwrap();
//! let (sum,): (i32,) = add.call(&(2, 3)).unwrap();
//! assert_eq!(sum, 5);
//! ```

use std::marker::PhantomData;
use std::time::Duration;

use chainerror::*;
use dbuslink_signature::Signature;
use tracing::warn;

use crate::connection::{Connection, SignalStream, SignalToken, WeakConnection};
use crate::error::*;
use crate::marshal::{Arguments, FromArguments};
use crate::match_rule::MatchRule;
use crate::message::{Message, MessageBuilder};
use crate::names::{self, ObjectPath};
use crate::peer::PEER_INTERFACE;
use crate::pending::PendingCall;
use crate::writer::Writer;

fn check_signature(expected: &Signature, found: Signature) -> Result<()> {
    if *expected != found {
        return Err(ErrorKind::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }.into_error());
    }
    Ok(())
}

fn decode_reply<R: FromArguments>(output: &Signature, reply: Message) -> Result<R> {
    check_signature(output, reply.signature().clone())?;
    reply.body::<R>()
}

/// A remote object: an optional destination and an object path.
#[derive(Clone, Debug)]
pub struct ObjectProxy {
    conn: WeakConnection,
    destination: Option<String>,
    path: ObjectPath,
    timeout: Option<Duration>,
}

impl ObjectProxy {
    /// `destination` is the bus name of the peer; `None` on peer-to-peer
    /// connections.
    pub fn new(conn: &Connection, destination: Option<&str>, path: &str) -> Result<ObjectProxy> {
        if let Some(d) = destination {
            names::check_bus_name(d)?;
        }
        Ok(ObjectProxy {
            conn: conn.downgrade(),
            destination: destination.map(str::to_string),
            path: ObjectPath::new(path)?,
            timeout: None,
        })
    }

    /// Timeout of calls through this proxy, instead of the connection's
    /// default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn interface(&self, name: &str) -> Result<InterfaceProxy> {
        names::check_interface(name)?;
        Ok(InterfaceProxy {
            object: self.clone(),
            name: name.to_string(),
        })
    }

    /// `org.freedesktop.DBus.Peer.Ping`
    pub fn ping(&self) -> Result<()> {
        let ping = self.interface(PEER_INTERFACE)?.method("Ping", "", "")?;
        ping.call::<(), ()>(&())
    }

    fn connection(&self) -> Result<Connection> {
        self.conn
            .upgrade()
            .ok_or_else(|| ErrorKind::ConnectionClosed.into_error())
    }

    fn message(&self, conn: &Connection, interface: &str, member: &str) -> MessageBuilder {
        let mut builder = Message::method_call(self.path.as_str(), member)
            .interface(interface)
            .endianness(conn.config().endianness);
        if let Some(d) = &self.destination {
            builder = builder.destination(d);
        }
        builder
    }
}

/// One interface of a remote object.
#[derive(Clone, Debug)]
pub struct InterfaceProxy {
    object: ObjectProxy,
    name: String,
}

impl InterfaceProxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object(&self) -> &ObjectProxy {
        &self.object
    }

    /// Bind `member` with its argument and return signatures.
    pub fn method(&self, member: &str, input: &str, output: &str) -> Result<MethodProxy> {
        names::check_member(member)?;
        Ok(MethodProxy {
            object: self.object.clone(),
            interface: self.name.clone(),
            member: member.to_string(),
            input: Signature::parse(input).map_context(ErrorKind::from_parse)?,
            output: Signature::parse(output).map_context(ErrorKind::from_parse)?,
        })
    }

    pub fn signal(&self, member: &str, signature: &str) -> Result<SignalProxy> {
        names::check_member(member)?;
        Ok(SignalProxy {
            object: self.object.clone(),
            interface: self.name.clone(),
            member: member.to_string(),
            signature: Signature::parse(signature).map_context(ErrorKind::from_parse)?,
        })
    }
}

/// A remote method with known signatures. Arguments and results whose
/// signatures differ from these fail with [`ErrorKind::TypeMismatch`].
#[derive(Clone, Debug)]
pub struct MethodProxy {
    object: ObjectProxy,
    interface: String,
    member: String,
    input: Signature,
    output: Signature,
}

impl MethodProxy {
    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn input(&self) -> &Signature {
        &self.input
    }

    pub fn output(&self) -> &Signature {
        &self.output
    }

    fn build<A: Arguments + ?Sized>(&self, conn: &Connection, args: &A, no_reply: bool) -> Result<Message> {
        check_signature(&self.input, A::signature()?)?;
        let mut builder = self.object.message(conn, &self.interface, &self.member);
        if no_reply {
            builder = builder.no_reply_expected();
        }
        builder.body(args)?.build()
    }

    /// Call and block until the reply.
    pub fn call<A, R>(&self, args: &A) -> Result<R>
    where
        A: Arguments + ?Sized,
        R: FromArguments,
    {
        check_signature(&self.output, R::signature()?)?;
        let conn = self.object.connection()?;
        let message = self.build(&conn, args, false)?;
        let reply = conn.send_and_block(message, self.object.timeout)?;
        decode_reply(&self.output, reply)
    }

    /// Send the call and return a handle to its typed reply.
    pub fn call_async<A, R>(&self, args: &A) -> Result<PendingReply<R>>
    where
        A: Arguments + ?Sized,
        R: FromArguments,
    {
        check_signature(&self.output, R::signature()?)?;
        let conn = self.object.connection()?;
        let message = self.build(&conn, args, false)?;
        let pending = conn.send_with_reply(message, self.object.timeout)?;
        Ok(PendingReply {
            pending,
            output: self.output.clone(),
            _marker: PhantomData,
        })
    }

    /// Send the call flagged `NO_REPLY_EXPECTED`.
    pub fn call_no_reply<A: Arguments + ?Sized>(&self, args: &A) -> Result<()> {
        let conn = self.object.connection()?;
        let message = self.build(&conn, args, true)?;
        conn.send(message).map(|_| ())
    }

    /// Call with a body written by `f` over the input signature; the reply
    /// is returned undecoded.
    pub fn call_with<F>(&self, f: F) -> Result<Message>
    where
        F: FnOnce(&mut Writer) -> Result<()>,
    {
        let conn = self.object.connection()?;
        let message = self
            .object
            .message(&conn, &self.interface, &self.member)
            .body_with(&self.input, f)?
            .build()?;
        let reply = conn.send_and_block(message, self.object.timeout)?;
        check_signature(&self.output, reply.signature().clone())?;
        Ok(reply)
    }
}

/// A call sent through a [`MethodProxy`] whose reply decodes to `R`.
pub struct PendingReply<R> {
    pending: PendingCall,
    output: Signature,
    _marker: PhantomData<fn() -> R>,
}

impl<R: FromArguments> PendingReply<R> {
    pub fn serial(&self) -> u32 {
        self.pending.serial()
    }

    pub fn is_resolved(&self) -> bool {
        self.pending.is_resolved()
    }

    pub fn wait(self) -> Result<R> {
        let reply = self.pending.wait()?;
        decode_reply(&self.output, reply)
    }

    /// Run `f` with the decoded reply once it arrives.
    pub fn on_resolved<F>(self, f: F)
    where
        R: 'static,
        F: FnOnce(Result<R>) + Send + 'static,
    {
        let output = self.output;
        self.pending
            .on_resolved(move |reply| f(reply.and_then(|m| decode_reply(&output, m))));
    }

    pub fn cancel(self) -> bool {
        self.pending.cancel()
    }
}

/// A signal of a remote object with its argument signature.
#[derive(Clone, Debug)]
pub struct SignalProxy {
    object: ObjectProxy,
    interface: String,
    member: String,
    signature: Signature,
}

impl SignalProxy {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The match rule subscribed for this signal.
    pub fn rule(&self) -> MatchRule {
        MatchRule::for_signal(
            self.object.destination(),
            self.object.path.as_str(),
            &self.interface,
            &self.member,
        )
    }

    /// Call `f` with the decoded arguments of each matching signal. Signals
    /// whose arguments do not decode as `A` are dropped.
    pub fn connect<A, F>(&self, f: F) -> Result<SignalToken>
    where
        A: FromArguments + 'static,
        F: Fn(A, &Message) + Send + Sync + 'static,
    {
        check_signature(&self.signature, A::signature()?)?;
        let conn = self.object.connection()?;
        conn.add_signal_handler(self.rule(), move |message| match message.body::<A>() {
            Ok(args) => f(args, message),
            Err(e) => warn!("dropping signal {}: {}", message, e),
        })
    }

    pub fn connect_raw<F>(&self, f: F) -> Result<SignalToken>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let conn = self.object.connection()?;
        conn.add_signal_handler(self.rule(), f)
    }

    pub fn subscribe(&self) -> Result<SignalStream> {
        let conn = self.object.connection()?;
        conn.signal_stream(self.rule())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    #[test]
    fn test_signature_checked_before_sending() {
        let (a, _b) = Connection::pair(ConnectionConfig::default());
        let m = ObjectProxy::new(&a, None, "/x")
            .unwrap()
            .interface("org.example.X")
            .unwrap()
            .method("M", "s", "u")
            .unwrap();

        let e = m.call::<_, (u32,)>(&(1u32,)).unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::TypeMismatch { .. }));
        let e = m.call::<_, (String,)>(&("x",)).unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::TypeMismatch { .. }));
        assert_eq!(a.pending_count(), 0);
    }

    #[test]
    fn test_closed_connection() {
        let (a, _b) = Connection::pair(ConnectionConfig::default());
        let iface = ObjectProxy::new(&a, Some("org.example.Service"), "/x")
            .unwrap()
            .interface("org.example.X")
            .unwrap();
        drop(a);
        let m = iface.method("M", "", "").unwrap();
        let e = m.call::<(), ()>(&()).unwrap_err();
        assert_eq!(*e.kind(), ErrorKind::ConnectionClosed);
    }

    #[test]
    fn test_signal_rule() {
        let (a, _b) = Connection::pair(ConnectionConfig::default());
        let s = ObjectProxy::new(&a, None, "/x")
            .unwrap()
            .interface("org.example.X")
            .unwrap()
            .signal("Changed", "u")
            .unwrap();
        assert_eq!(
            s.rule().to_string(),
            "type='signal',interface='org.example.X',member='Changed',path='/x'"
        );
        assert!(s.connect(|_: (String,), _| {}).is_err());
    }

    #[test]
    fn test_invalid_names() {
        let (a, _b) = Connection::pair(ConnectionConfig::default());
        assert!(ObjectProxy::new(&a, None, "no/slash").is_err());
        assert!(ObjectProxy::new(&a, Some("not a name"), "/x").is_err());
        let o = ObjectProxy::new(&a, None, "/x").unwrap();
        assert!(o.interface("nodots").is_err());
    }
}
