//! Exported objects: interfaces of methods and signals at an object path.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chainerror::*;
use dbuslink_signature::Signature;

use crate::connection::Connection;
use crate::error::*;
use crate::marshal::{Arguments, FromArguments};
use crate::message::Message;
use crate::names::{self, ObjectPath};
use crate::reader::Reader;
use crate::worker::DeliveryPolicy;
use crate::writer::Writer;

pub type MethodHandler = Arc<dyn Fn(&mut Call) -> Result<()> + Send + Sync>;

/// A method: name, input and output signatures and its handler.
#[derive(Clone)]
pub struct Method {
    name: String,
    input: Signature,
    output: Signature,
    handler: MethodHandler,
}

impl Method {
    /// A handler working on the raw [`Call`]. It replies with
    /// [`Call::reply`]; returning `Ok` without replying sends an empty
    /// return when `output` is empty.
    pub fn new<F>(name: &str, input: &str, output: &str, handler: F) -> Result<Method>
    where
        F: Fn(&mut Call) -> Result<()> + Send + Sync + 'static,
    {
        names::check_member(name)?;
        Ok(Method {
            name: name.to_string(),
            input: Signature::parse(input).map_context(ErrorKind::from_parse)?,
            output: Signature::parse(output).map_context(ErrorKind::from_parse)?,
            handler: Arc::new(handler),
        })
    }

    /// A handler from native arguments to native results; the signatures
    /// are those of `A` and `R`.
    ///
    /// ```rust
    /// use dbuslink::Method;
    ///
    /// let m = Method::typed("Add", |(a, b): (i32, i32)| Ok((a + b,))).unwrap();
    /// assert_eq!(m.input(), "ii");
    /// assert_eq!(m.output(), "i");
    /// ```
    pub fn typed<A, R, F>(name: &str, f: F) -> Result<Method>
    where
        A: FromArguments,
        R: Arguments,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        names::check_member(name)?;
        Ok(Method {
            name: name.to_string(),
            input: <A as FromArguments>::signature()?,
            output: <R as Arguments>::signature()?,
            handler: Arc::new(move |call: &mut Call| {
                let args = call.args::<A>()?;
                let result = f(args)?;
                call.reply(&result)
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &Signature {
        &self.input
    }

    pub fn output(&self) -> &Signature {
        &self.output
    }

    pub(crate) fn invoke(&self, call: &mut Call) -> Result<()> {
        (self.handler)(call)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("input", &self.input.as_str())
            .field("output", &self.output.as_str())
            .finish()
    }
}

/// A named group of methods and signals.
#[derive(Clone, Debug)]
pub struct Interface {
    name: String,
    methods: BTreeMap<String, Arc<Method>>,
    signals: BTreeMap<String, Signature>,
}

impl Interface {
    pub fn new(name: &str) -> Result<Interface> {
        names::check_interface(name)?;
        Ok(Interface {
            name: name.to_string(),
            methods: BTreeMap::new(),
            signals: BTreeMap::new(),
        })
    }

    pub fn with_method(mut self, method: Method) -> Result<Self> {
        self.add_method(method)?;
        Ok(self)
    }

    /// Declare a signal this interface emits.
    pub fn with_signal(mut self, name: &str, signature: &str) -> Result<Self> {
        names::check_member(name)?;
        let signature = Signature::parse(signature).map_context(ErrorKind::from_parse)?;
        if self.signals.contains_key(name) {
            return Err(ErrorKind::DuplicateRegistration(format!(
                "signal '{}' of '{}'",
                name, self.name
            )).into_error());
        }
        self.signals.insert(name.to_string(), signature);
        Ok(self)
    }

    pub(crate) fn add_method(&mut self, method: Method) -> Result<()> {
        if self.methods.contains_key(&method.name) {
            return Err(ErrorKind::DuplicateRegistration(format!(
                "method '{}' of '{}'",
                method.name, self.name
            )).into_error());
        }
        self.methods.insert(method.name.clone(), Arc::new(method));
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<Method>> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.values().map(|m| m.as_ref())
    }

    pub fn signals(&self) -> impl Iterator<Item = (&str, &Signature)> {
        self.signals.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub(crate) fn has_member(&self, name: &str) -> bool {
        self.methods.contains_key(name) || self.signals.contains_key(name)
    }
}

/// Interfaces to export at one path.
///
/// ```rust
/// use dbuslink::{Interface, Method, Object};
///
/// let echo = Interface::new("org.example.Echo")
///     .and_then(|i| i.with_method(Method::typed("Echo", |(s,): (String,)| Ok((s,)))?))
///     .and_then(|i| i.with_signal("Echoed", "s"))
///     .unwrap();
/// let object = Object::new("/org/example/Echo")
///     .unwrap()
///     .with_interface(echo)
///     .unwrap();
/// assert_eq!(object.path(), "/org/example/Echo");
/// ```
#[derive(Clone, Debug)]
pub struct Object {
    path: ObjectPath,
    policy: Option<DeliveryPolicy>,
    interfaces: BTreeMap<String, Interface>,
}

impl Object {
    pub fn new(path: &str) -> Result<Object> {
        Ok(Object {
            path: ObjectPath::new(path)?,
            policy: None,
            interfaces: BTreeMap::new(),
        })
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_interface(mut self, interface: Interface) -> Result<Self> {
        if self.interfaces.contains_key(&interface.name) {
            return Err(ErrorKind::DuplicateRegistration(format!(
                "interface '{}' at '{}'",
                interface.name, self.path
            )).into_error());
        }
        self.interfaces.insert(interface.name.clone(), interface);
        Ok(self)
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub(crate) fn into_parts(self) -> (ObjectPath, Option<DeliveryPolicy>, BTreeMap<String, Interface>) {
        (self.path, self.policy, self.interfaces)
    }
}

/// An inbound method call being handled.
pub struct Call {
    message: Message,
    connection: Connection,
    method: Arc<Method>,
    reply: Option<Message>,
}

impl Call {
    pub(crate) fn new(message: Message, connection: Connection, method: Arc<Method>) -> Call {
        Call {
            message,
            connection,
            method,
            reply: None,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The connection the call arrived on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Decode the arguments; a signature mismatch is `InvalidArgs`.
    pub fn args<A: FromArguments>(&self) -> Result<A> {
        self.message.body::<A>().map_err(|e| match e.kind() {
            ErrorKind::TypeMismatch { expected, found } => ErrorKind::InvalidArgs(format!(
                "expected arguments '{}', got '{}'",
                found, expected
            )).into_error(),
            _ => e,
        })
    }

    pub fn reader(&self) -> Reader<'_> {
        self.message.reader()
    }

    fn check_unreplied(&self) -> Result<()> {
        if self.reply.is_some() {
            return Err(ErrorKind::AlreadyReplied.into_error());
        }
        Ok(())
    }

    /// Reply with `results`, whose signature must be the method's output.
    pub fn reply<R: Arguments + ?Sized>(&mut self, results: &R) -> Result<()> {
        self.check_unreplied()?;
        let found = R::signature()?;
        if &found != self.method.output() {
            return Err(ErrorKind::TypeMismatch {
                expected: self.method.output().to_string(),
                found: found.to_string(),
            }.into_error());
        }
        self.reply = Some(Message::method_return(&self.message).body(results)?.build()?);
        Ok(())
    }

    /// Reply with values written by `f` against the method's output.
    pub fn reply_with<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Writer) -> Result<()>,
    {
        self.check_unreplied()?;
        let output = self.method.output().clone();
        self.reply = Some(Message::method_return(&self.message).body_with(&output, f)?.build()?);
        Ok(())
    }

    pub fn reply_error(&mut self, name: &str, text: &str) -> Result<()> {
        self.check_unreplied()?;
        let mut b = Message::error(&self.message, name);
        if !text.is_empty() {
            b = b.body(&(text,))?;
        }
        self.reply = Some(b.build()?);
        Ok(())
    }

    pub fn has_replied(&self) -> bool {
        self.reply.is_some()
    }

    pub(crate) fn take_reply(&mut self) -> Option<Message> {
        self.reply.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_rejected() {
        let m = || Method::new("Ping", "", "", |_| Ok(())).unwrap();
        let e = Interface::new("org.example.A")
            .unwrap()
            .with_method(m())
            .unwrap()
            .with_method(m())
            .unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::DuplicateRegistration(_)));

        let e = Object::new("/a")
            .unwrap()
            .with_interface(Interface::new("org.example.A").unwrap())
            .unwrap()
            .with_interface(Interface::new("org.example.A").unwrap())
            .unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::DuplicateRegistration(_)));
    }

    #[test]
    fn test_invalid_names() {
        assert!(Method::new("9bad", "", "", |_| Ok(())).is_err());
        assert!(Method::new("Good", "a", "", |_| Ok(())).is_err());
        assert!(Interface::new("nodots").is_err());
        assert!(Object::new("/trailing/").is_err());
    }
}
