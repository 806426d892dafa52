//! A connection: serial allocation, reply matching and routing of inbound
//! calls and signals.
//!
//! Reading is serialized by a reader lock. Whoever holds it (an I/O
//! thread, a caller blocked on its reply, or [`Connection::process`])
//! reads one chunk, resolves the replies it contains and queues calls and
//! signals in arrival order. Queued calls and signals are dispatched only
//! from `process` or a dispatcher's I/O thread, never from a blocked
//! caller. Handler code never runs while a table lock is held.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, TryLockError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, error, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::*;
use crate::introspect::ObjectDescription;
use crate::marshal::Arguments;
use crate::match_rule::MatchRule;
use crate::message::{Message, MessageBuilder, MessageType};
use crate::names::{self, ObjectPath};
use crate::object::{Call, Method, Object};
use crate::pending::{Outcome, PendingCall, PendingSlot};
use crate::peer;
use crate::registry::Registry;
use crate::sansio::{FrameEvent, Framer};
use crate::timer::Deadlines;
use crate::transport::{MemoryTransport, Transport};
use crate::worker::DeliveryPolicy;
use crate::{lock, read, write};

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

bitflags! {
    /// Flags of `RequestName`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestNameFlags: u32 {
        const ALLOW_REPLACEMENT = 0x1;
        const REPLACE_EXISTING = 0x2;
        const DO_NOT_QUEUE = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

#[derive(Default)]
struct Running {
    count: usize,
    inline: Vec<ThreadId>,
}

/// Counts handler invocations that have not finished yet.
#[derive(Default)]
pub(crate) struct InFlight {
    running: Mutex<Running>,
    idle: Condvar,
}

impl InFlight {
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        lock(&self.running).count += 1;
        InFlightGuard {
            in_flight: self.clone(),
            inline: None,
        }
    }

    /// Like [`enter`](InFlight::enter) for a handler that runs on the
    /// calling thread.
    pub fn enter_inline(self: &Arc<Self>) -> InFlightGuard {
        let id = thread::current().id();
        let mut running = lock(&self.running);
        running.count += 1;
        running.inline.push(id);
        InFlightGuard {
            in_flight: self.clone(),
            inline: Some(id),
        }
    }

    pub fn count(&self) -> usize {
        lock(&self.running).count
    }

    /// `true` if nothing was in flight within `timeout`. Handlers running
    /// inline on the calling thread are not waited for.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let me = thread::current().id();
        let others = |r: &Running| r.count - r.inline.iter().filter(|t| **t == me).count();
        let running = lock(&self.running);
        let (running, _) = self
            .idle
            .wait_timeout_while(running, timeout, |r| others(r) > 0)
            .unwrap_or_else(PoisonError::into_inner);
        others(&running) == 0
    }
}

pub(crate) struct InFlightGuard {
    in_flight: Arc<InFlight>,
    inline: Option<ThreadId>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut running = lock(&self.in_flight.running);
        running.count -= 1;
        if let Some(id) = self.inline {
            if let Some(i) = running.inline.iter().position(|t| *t == id) {
                running.inline.swap_remove(i);
            }
        }
        self.in_flight.idle.notify_all();
    }
}

type SignalCallback = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Callback(SignalCallback),
    Channel(mpsc::Sender<Message>),
}

struct Subscription {
    id: u64,
    rule: MatchRule,
    sink: Sink,
}

struct ReaderState {
    framer: Framer,
    buf: Vec<u8>,
}

struct ReadResult {
    resolutions: Vec<(Arc<PendingSlot>, Outcome)>,
    fatal: Option<Error>,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    transport: Box<dyn Transport>,
    config: ConnectionConfig,
    reader: Mutex<ReaderState>,
    inbound: Mutex<VecDeque<Message>>,
    dispatching: Mutex<()>,
    pending: Mutex<HashMap<u32, Arc<PendingSlot>>>,
    deadlines: Arc<Deadlines>,
    next_serial: AtomicU32,
    registry: RwLock<Registry>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,
    bus_matches: Mutex<HashMap<String, usize>>,
    unique_name: Mutex<Option<String>>,
    in_flight: Arc<InFlight>,
    closed: AtomicBool,
}

impl Inner {
    fn read_locked(&self, state: &mut ReaderState, timeout: Option<Duration>) -> ReadResult {
        let mut result = ReadResult {
            resolutions: Vec::new(),
            fatal: None,
        };
        if self.closed.load(Ordering::SeqCst) {
            result.fatal = Some(ErrorKind::ConnectionClosed.into_error());
            return result;
        }

        let ReaderState { framer, buf } = state;
        match self.transport.recv(buf, timeout) {
            Ok(0) => {
                debug!("connection {}: end of stream", self.id);
                result.fatal = Some(ErrorKind::ConnectionClosed.into_error());
            }
            Ok(n) => {
                if let Err(e) = framer.handle_input(&buf[..n]) {
                    result.fatal = Some(e);
                }
            }
            Err(e) if *e.kind() == ErrorKind::Timeout => {}
            Err(e) => result.fatal = Some(e),
        }

        while let Some(event) = framer.poll_event() {
            if let FrameEvent::Message(m) = event {
                self.route(m, &mut result.resolutions);
            }
        }
        result
    }

    fn route(&self, message: Message, resolutions: &mut Vec<(Arc<PendingSlot>, Outcome)>) {
        match message.message_type() {
            MessageType::MethodReturn | MessageType::Error => {
                let slot = message
                    .reply_serial()
                    .and_then(|serial| lock(&self.pending).remove(&serial));
                match slot {
                    Some(slot) => resolutions.push((slot, Outcome::Reply(message))),
                    None => debug!("connection {}: dropping stale reply {}", self.id, message),
                }
            }
            MessageType::MethodCall | MessageType::Signal => {
                let mut inbound = lock(&self.inbound);
                if inbound.len() >= self.config.max_queued_messages {
                    if let Some(old) = inbound.pop_front() {
                        warn!("connection {}: inbound queue full, dropping {}", self.id, old);
                    }
                }
                inbound.push_back(message);
            }
        }
    }

    fn finish_read(&self, result: ReadResult) -> Result<()> {
        for (slot, outcome) in result.resolutions {
            slot.resolve(outcome);
        }
        match result.fatal {
            Some(e) => {
                self.shutdown(ErrorKind::ConnectionClosed);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Close once; every outstanding call fails with `kind`.
    fn shutdown(&self, kind: ErrorKind) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("connection {}: closing ({})", self.id, kind);
        self.transport.shutdown();
        self.deadlines.stop();
        let drained: Vec<Arc<PendingSlot>> = lock(&self.pending).drain().map(|(_, s)| s).collect();
        for slot in drained {
            slot.resolve(Outcome::Failed(kind.clone()));
        }
        lock(&self.inbound).clear();
        lock(&self.subscriptions).clear();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown(ErrorKind::ConnectionClosed);
    }
}

/// A message connection over a [`Transport`]. Cloning yields another
/// handle to the same connection; it closes when the last handle is
/// dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// A handle that does not keep the connection open.
#[derive(Clone, Default)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("unique_name", &self.unique_name())
            .field("open", &self.is_open())
            .finish()
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(conn) => write!(f, "{:?}", conn),
            None => f.write_str("Connection(closed)"),
        }
    }
}

impl Connection {
    pub fn new<T: Transport + 'static>(transport: T, config: ConnectionConfig) -> Connection {
        Connection::with_transport(Box::new(transport), config)
    }

    pub fn with_transport(transport: Box<dyn Transport>, config: ConnectionConfig) -> Connection {
        let buf = vec![0u8; config.read_buffer_size.max(16)];
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("connection {}: opened", id);
        Connection {
            inner: Arc::new(Inner {
                id,
                transport,
                config,
                reader: Mutex::new(ReaderState {
                    framer: Framer::new(),
                    buf,
                }),
                inbound: Mutex::new(VecDeque::new()),
                dispatching: Mutex::new(()),
                pending: Mutex::new(HashMap::new()),
                deadlines: Deadlines::new(),
                next_serial: AtomicU32::new(1),
                registry: RwLock::new(Registry::new()),
                subscriptions: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                bus_matches: Mutex::new(HashMap::new()),
                unique_name: Mutex::new(None),
                in_flight: Arc::new(InFlight::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Two connections linked in memory, for peer-to-peer use in-process.
    pub fn pair(config: ConnectionConfig) -> (Connection, Connection) {
        let (a, b) = MemoryTransport::pair();
        (Connection::new(a, config.clone()), Connection::new(b, config))
    }

    /// Open a connection to a message bus over an authenticated transport
    /// and register with `Hello`.
    pub fn open_bus<T: Transport + 'static>(transport: T, config: ConnectionConfig) -> Result<Connection> {
        let conn = Connection::new(transport, config);
        let (name,): (String,) = conn.bus_call("Hello", &())?.body()?;
        debug!("connection {}: unique name {}", conn.inner.id, name);
        *lock(&conn.inner.unique_name) = Some(name);
        Ok(conn)
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.inner.config.poll_interval
    }

    /// The name the bus assigned; `None` on peer-to-peer connections.
    pub fn unique_name(&self) -> Option<String> {
        lock(&self.inner.unique_name).clone()
    }

    pub fn is_bus(&self) -> bool {
        lock(&self.inner.unique_name).is_some()
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && self.inner.transport.is_connected()
    }

    /// Calls sent whose reply has not arrived yet.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Calls and signals received but not dispatched yet.
    pub fn queued_count(&self) -> usize {
        lock(&self.inner.inbound).len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ErrorKind::ConnectionClosed.into_error());
        }
        Ok(())
    }

    fn allocate_serial(&self, pending: &HashMap<u32, Arc<PendingSlot>>) -> u32 {
        loop {
            let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 && !pending.contains_key(&serial) {
                return serial;
            }
        }
    }

    fn transmit(&self, message: &Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        trace!("connection {}: sending {}", self.inner.id, message);
        self.inner.transport.send(&bytes).map_err(|e| {
            if *e.kind() == ErrorKind::ConnectionClosed {
                self.inner.shutdown(ErrorKind::ConnectionClosed);
            }
            e
        })
    }

    /// Send any message and return the serial it was sent with. A method
    /// call expecting a reply gets a detached pending entry, so its reply
    /// is consumed.
    pub fn send(&self, mut message: Message) -> Result<u32> {
        if message.expects_reply() {
            let pending = self.send_with_reply(message, None)?;
            return Ok(pending.serial());
        }
        self.ensure_open()?;
        let serial = self.allocate_serial(&lock(&self.inner.pending));
        message.set_serial(serial);
        self.transmit(&message)?;
        Ok(serial)
    }

    /// Send a method call and return the handle its reply resolves.
    /// `None` uses the configured default timeout.
    ///
    /// The call expires at its deadline even if nothing reads the
    /// connection; a callback registered with
    /// [`PendingCall::on_resolved`] then runs on the connection's timer
    /// thread.
    pub fn send_with_reply(
        &self,
        mut message: Message,
        timeout: Option<Duration>,
    ) -> Result<PendingCall> {
        if !message.expects_reply() {
            let reason = "only method calls expecting a reply have one";
            return Err(ErrorKind::MalformedMessage(reason.into()).into_error());
        }
        self.ensure_open()?;
        let deadline = timeout
            .or(self.inner.config.default_timeout)
            .map(|t| Instant::now() + t);

        let slot = {
            let mut pending = lock(&self.inner.pending);
            let serial = self.allocate_serial(&pending);
            let slot = PendingSlot::new(serial, deadline);
            pending.insert(serial, slot.clone());
            slot
        };
        let serial = slot.serial();
        message.set_serial(serial);

        // A close racing the insert has already drained the table.
        if self.inner.closed.load(Ordering::SeqCst) {
            lock(&self.inner.pending).remove(&serial);
            return Err(ErrorKind::ConnectionClosed.into_error());
        }
        if let Err(e) = self.transmit(&message) {
            lock(&self.inner.pending).remove(&serial);
            return Err(e);
        }
        if let Some(deadline) = deadline {
            self.inner
                .deadlines
                .track(deadline, self.downgrade(), self.inner.id);
        }
        Ok(PendingCall::new(slot, self.downgrade()))
    }

    /// Send a method call and block until its reply. Error replies are
    /// returned as `Err`.
    pub fn send_and_block(&self, message: Message, timeout: Option<Duration>) -> Result<Message> {
        self.send_with_reply(message, timeout)?.wait()
    }

    /// Read one chunk, waiting up to `timeout`.
    fn read_once(&self, timeout: Option<Duration>) -> Result<()> {
        let result = {
            let mut state = lock(&self.inner.reader);
            self.inner.read_locked(&mut state, timeout)
        };
        self.inner.finish_read(result)
    }

    /// Like `read_once`, but `Ok(false)` without reading if another thread
    /// is reading.
    fn try_read_once(&self, timeout: Option<Duration>) -> Result<bool> {
        let result = match self.inner.reader.try_lock() {
            Ok(mut state) => self.inner.read_locked(&mut state, timeout),
            Err(TryLockError::WouldBlock) => return Ok(false),
            Err(TryLockError::Poisoned(p)) => {
                let mut state = p.into_inner();
                self.inner.read_locked(&mut state, timeout)
            }
        };
        self.inner.finish_read(result)?;
        Ok(true)
    }

    /// One slice of a blocked caller's wait: read if nobody else is
    /// reading, else sleep until the slot resolves or `slice` passes.
    pub(crate) fn wait_slice(&self, slot: &PendingSlot, slice: Duration) {
        if slot.is_resolved() {
            return;
        }
        match self.try_read_once(Some(slice)) {
            Ok(true) => {}
            Ok(false) => slot.wait_for(slice),
            // Closing resolved every pending slot.
            Err(_) => {}
        }
    }

    /// Fail the call `serial` with a timeout.
    pub(crate) fn expire(&self, serial: u32) {
        let slot = lock(&self.inner.pending).remove(&serial);
        if let Some(slot) = slot {
            debug!("connection {}: call {} timed out", self.inner.id, serial);
            slot.resolve(Outcome::Failed(ErrorKind::Timeout));
        }
    }

    /// Drop the call `serial` without resolving it.
    pub(crate) fn forget(&self, serial: u32) -> bool {
        lock(&self.inner.pending).remove(&serial).is_some()
    }

    pub(crate) fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<PendingSlot>> = {
            let mut pending = lock(&self.inner.pending);
            let serials: Vec<u32> = pending
                .iter()
                .filter(|(_, slot)| slot.is_expired(now))
                .map(|(serial, _)| *serial)
                .collect();
            serials
                .into_iter()
                .filter_map(|serial| pending.remove(&serial))
                .collect()
        };
        for slot in expired {
            debug!("connection {}: call {} timed out", self.inner.id, slot.serial());
            slot.resolve(Outcome::Failed(ErrorKind::Timeout));
        }
    }

    /// Read for up to `timeout`, expire overdue calls and dispatch what is
    /// queued. Returns the number of calls and signals dispatched.
    pub fn process(&self, timeout: Duration) -> Result<usize> {
        let timeout = if self.queued_count() > 0 {
            Duration::ZERO
        } else {
            timeout
        };
        self.read_once(Some(timeout))?;
        self.sweep_timeouts();
        Ok(self.dispatch_pending())
    }

    pub(crate) fn dispatch_pending(&self) -> usize {
        let _dispatching = match self.inner.dispatching.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return 0,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };
        let mut n = 0;
        loop {
            let message = lock(&self.inner.inbound).pop_front();
            let message = match message {
                Some(m) => m,
                None => return n,
            };
            n += 1;
            match message.message_type() {
                MessageType::MethodCall => self.dispatch_call(message),
                MessageType::Signal => self.dispatch_signal(&message),
                _ => {}
            }
        }
    }

    fn send_error(&self, call: &Message, kind: &ErrorKind) {
        if !call.expects_reply() {
            return;
        }
        match Message::error_reply(call, kind) {
            Ok(reply) => {
                if let Err(e) = self.send(reply) {
                    debug!("connection {}: could not send error reply: {}", self.inner.id, e);
                }
            }
            Err(e) => error!("connection {}: could not build error reply: {}", self.inner.id, e),
        }
    }

    fn dispatch_call(&self, message: Message) {
        if let Some(reply) = peer::handle(&message) {
            if message.expects_reply() {
                match reply.and_then(|r| self.send(r)) {
                    Ok(_) => {}
                    Err(e) => debug!("connection {}: could not answer peer call: {}", self.inner.id, e),
                }
            }
            return;
        }

        let (path, member) = match (message.path(), message.member()) {
            (Some(p), Some(m)) => (p.clone(), m.to_string()),
            _ => return,
        };
        let lookup = read(&self.inner.registry).lookup(&path, message.interface(), &member);
        let (method, policy) = match lookup {
            Ok(found) => found,
            Err(e) => {
                debug!("connection {}: {}", self.inner.id, e);
                self.send_error(&message, e.kind());
                return;
            }
        };

        if message.signature() != method.input() {
            self.send_error(
                &message,
                &ErrorKind::InvalidArgs(format!(
                    "method '{}' expects arguments '{}', got '{}'",
                    member,
                    method.input(),
                    message.signature()
                )),
            );
            return;
        }

        match policy {
            DeliveryPolicy::Inline => {
                let _guard = self.inner.in_flight.enter_inline();
                self.invoke(method, message);
            }
            DeliveryPolicy::Worker(worker) => {
                let guard = self.inner.in_flight.enter();
                let conn = self.clone();
                let fallback = message.clone();
                let job = move || {
                    let _guard = guard;
                    conn.invoke(method, message);
                };
                if let Err(e) = worker.execute(job) {
                    warn!("connection {}: {}", self.inner.id, e);
                    self.send_error(&fallback, e.kind());
                }
            }
        }
    }

    fn invoke(&self, method: Arc<Method>, message: Message) {
        let expects_reply = message.expects_reply();
        let mut call = Call::new(message, self.clone(), method.clone());
        let result = panic::catch_unwind(AssertUnwindSafe(|| method.invoke(&mut call)));

        let reply = match result {
            Ok(Ok(())) => match call.take_reply() {
                Some(reply) => Ok(reply),
                None if method.output().is_empty() => Message::method_return(call.message()).build(),
                None => Message::error_reply(
                    call.message(),
                    &ErrorKind::Failed(format!("method '{}' did not reply", method.name())),
                ),
            },
            Ok(Err(e)) => {
                debug!("method '{}' failed: {}", method.name(), e);
                Message::error_reply(call.message(), e.kind())
            }
            Err(_) => {
                error!("method '{}' panicked", method.name());
                Message::error_reply(
                    call.message(),
                    &ErrorKind::Failed(format!("method '{}' panicked", method.name())),
                )
            }
        };

        if !expects_reply {
            return;
        }
        match reply.and_then(|r| self.send(r)) {
            Ok(_) => {}
            Err(e) => debug!("connection {}: could not send reply: {}", self.inner.id, e),
        }
    }

    fn dispatch_signal(&self, message: &Message) {
        let sinks: Vec<(u64, Sink)> = lock(&self.inner.subscriptions)
            .iter()
            .filter(|s| s.rule.matches(message))
            .map(|s| (s.id, s.sink.clone()))
            .collect();
        if sinks.is_empty() {
            trace!("connection {}: no subscriber for {}", self.inner.id, message);
            return;
        }
        for (id, sink) in sinks {
            match sink {
                Sink::Callback(f) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| f(message))).is_err() {
                        error!("signal handler {} panicked", id);
                    }
                }
                Sink::Channel(tx) => {
                    if tx.send(message.clone()).is_err() {
                        warn!("signal stream {} is gone, dropping {}", id, message);
                        self.unsubscribe(id);
                    }
                }
            }
        }
    }

    fn subscribe(&self, rule: MatchRule, sink: Sink) -> Result<SignalToken> {
        self.ensure_open()?;
        self.add_match(&rule)?;
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscriptions).push(Subscription { id, rule, sink });
        Ok(SignalToken {
            conn: self.downgrade(),
            id,
            active: true,
        })
    }

    fn unsubscribe(&self, id: u64) {
        let removed = {
            let mut subs = lock(&self.inner.subscriptions);
            subs.iter()
                .position(|s| s.id == id)
                .map(|i| subs.remove(i))
        };
        if let Some(sub) = removed {
            if self.is_open() {
                if let Err(e) = self.remove_match(&sub.rule) {
                    debug!("connection {}: RemoveMatch failed: {}", self.inner.id, e);
                }
            }
        }
    }

    /// Call `f` for every signal matching `rule`, on the dispatching
    /// thread, until the token is dropped.
    pub fn add_signal_handler<F>(&self, rule: MatchRule, f: F) -> Result<SignalToken>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscribe(rule, Sink::Callback(Arc::new(f)))
    }

    /// Queue every signal matching `rule` into a stream.
    pub fn signal_stream(&self, rule: MatchRule) -> Result<SignalStream> {
        let (tx, rx) = mpsc::channel();
        let token = self.subscribe(rule, Sink::Channel(tx))?;
        Ok(SignalStream {
            receiver: rx,
            _token: token,
        })
    }

    fn bus_message(&self, member: &str) -> MessageBuilder {
        Message::method_call(BUS_PATH, member)
            .interface(BUS_INTERFACE)
            .destination(BUS_NAME)
            .endianness(self.inner.config.endianness)
    }

    fn bus_call<A: Arguments + ?Sized>(&self, member: &str, args: &A) -> Result<Message> {
        let message = self.bus_message(member).body(args)?.build()?;
        self.send_and_block(message, None)
    }

    pub fn request_name(&self, name: &str, flags: RequestNameFlags) -> Result<RequestNameReply> {
        names::check_bus_name(name)?;
        let (code,): (u32,) = self.bus_call("RequestName", &(name, flags.bits()))?.body()?;
        match code {
            1 => Ok(RequestNameReply::PrimaryOwner),
            2 => Ok(RequestNameReply::InQueue),
            3 => Ok(RequestNameReply::Exists),
            4 => Ok(RequestNameReply::AlreadyOwner),
            other => Err(ErrorKind::InvalidData(format!(
                "unknown RequestName reply {}",
                other
            )).into_error()),
        }
    }

    pub fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        names::check_bus_name(name)?;
        let (code,): (u32,) = self.bus_call("ReleaseName", &(name,))?.body()?;
        match code {
            1 => Ok(ReleaseNameReply::Released),
            2 => Ok(ReleaseNameReply::NonExistent),
            3 => Ok(ReleaseNameReply::NotOwner),
            other => Err(ErrorKind::InvalidData(format!(
                "unknown ReleaseName reply {}",
                other
            )).into_error()),
        }
    }

    /// Ask the bus to route messages matching `rule` here. Rules are
    /// reference counted; peer-to-peer connections filter locally only.
    pub fn add_match(&self, rule: &MatchRule) -> Result<()> {
        if !self.is_bus() {
            return Ok(());
        }
        let key = rule.to_string();
        {
            let mut matches = lock(&self.inner.bus_matches);
            let count = matches.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                return Ok(());
            }
        }
        if let Err(e) = self.bus_call("AddMatch", &(key.as_str(),)) {
            let mut matches = lock(&self.inner.bus_matches);
            if let Some(count) = matches.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    matches.remove(&key);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        if !self.is_bus() {
            return Ok(());
        }
        let key = rule.to_string();
        {
            let mut matches = lock(&self.inner.bus_matches);
            let remaining = match matches.get_mut(&key) {
                Some(count) => {
                    *count -= 1;
                    *count
                }
                None => return Ok(()),
            };
            if remaining > 0 {
                return Ok(());
            }
            matches.remove(&key);
        }
        let message = self
            .bus_message("RemoveMatch")
            .no_reply_expected()
            .body(&(key.as_str(),))?
            .build()?;
        self.send(message).map(|_| ())
    }

    /// Emit a signal from an object of this connection.
    pub fn emit_signal<A: Arguments + ?Sized>(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: &A,
    ) -> Result<u32> {
        let message = Message::signal(path, interface, member)
            .endianness(self.inner.config.endianness)
            .body(args)?
            .build()?;
        self.send(message)
    }

    /// Register a single method handler at (path, interface, member).
    pub fn register_method(&self, path: &str, interface: &str, method: Method) -> Result<()> {
        let path = ObjectPath::new(path)?;
        write(&self.inner.registry).register_method(&path, interface, method)
    }

    pub fn register_object(&self, object: Object) -> Result<()> {
        write(&self.inner.registry).register_object(object)
    }

    /// Returns `false` if nothing was registered at `path`.
    pub fn unregister_object(&self, path: &str) -> bool {
        match ObjectPath::new(path) {
            Ok(path) => write(&self.inner.registry).unregister_object(&path),
            Err(_) => false,
        }
    }

    pub fn set_delivery_policy(&self, path: &str, policy: DeliveryPolicy) -> Result<()> {
        let path = ObjectPath::new(path)?;
        write(&self.inner.registry).set_policy(&path, policy)
    }

    /// Describe what is exported at and below `path`.
    pub fn describe(&self, path: &str) -> Option<ObjectDescription> {
        let path = ObjectPath::new(path).ok()?;
        read(&self.inner.registry).describe(&path)
    }

    pub(crate) fn in_flight(&self) -> &Arc<InFlight> {
        &self.inner.in_flight
    }

    /// Close the connection; outstanding calls fail with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.shutdown(ErrorKind::ConnectionClosed);
    }

    pub(crate) fn close_with(&self, kind: ErrorKind) {
        self.inner.shutdown(kind);
    }
}

/// Keeps a signal subscription alive; dropping it unsubscribes.
pub struct SignalToken {
    conn: WeakConnection,
    id: u64,
    active: bool,
}

impl SignalToken {
    /// Keep the subscription for the lifetime of the connection.
    pub fn detach(mut self) {
        self.active = false;
    }
}

impl Drop for SignalToken {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(conn) = self.conn.upgrade() {
            conn.unsubscribe(self.id);
        }
    }
}

/// Signals matching a subscription, in arrival order. The stream ends
/// when the connection closes.
pub struct SignalStream {
    receiver: mpsc::Receiver<Message>,
    _token: SignalToken,
}

impl SignalStream {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ErrorKind::Timeout.into_error(),
            RecvTimeoutError::Disconnected => ErrorKind::ConnectionClosed.into_error(),
        })
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

impl Iterator for SignalStream {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(serial: u32) -> Message {
        let mut m = Message::signal("/org/example", "org.example.Ticks", "Tick")
            .body(&(serial,))
            .unwrap()
            .build()
            .unwrap();
        m.set_serial(serial);
        m
    }

    #[test]
    fn test_inbound_queue_drops_oldest() {
        let (conn, _other) = Connection::pair(ConnectionConfig {
            max_queued_messages: 2,
            ..Default::default()
        });
        let mut resolutions = Vec::new();
        for serial in 1..=5 {
            conn.inner.route(signal(serial), &mut resolutions);
        }
        assert!(resolutions.is_empty());
        let queued: Vec<u32> = lock(&conn.inner.inbound).iter().map(Message::serial).collect();
        assert_eq!(queued, vec![4, 5]);
    }

    #[test]
    fn test_serials_skip_zero_and_pending() {
        let (conn, _other) = Connection::pair(ConnectionConfig::default());
        conn.inner.next_serial.store(u32::MAX, Ordering::SeqCst);
        let mut pending = HashMap::new();
        pending.insert(1, PendingSlot::new(1, None));
        assert_eq!(conn.allocate_serial(&pending), u32::MAX);
        assert_eq!(conn.allocate_serial(&pending), 2);
    }

    #[test]
    fn test_send_with_reply_needs_a_call() {
        let (conn, _other) = Connection::pair(ConnectionConfig::default());
        let m = Message::method_call("/", "M").no_reply_expected().build().unwrap();
        let e = conn.send_with_reply(m, None).unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::MalformedMessage(_)));
        let s = Message::signal("/", "org.example.X", "S").build().unwrap();
        assert!(conn.send_with_reply(s, None).is_err());
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_in_flight_wait_idle() {
        let in_flight = Arc::new(InFlight::default());
        let guard = in_flight.enter();
        assert_eq!(in_flight.count(), 1);
        assert!(!in_flight.wait_idle(Duration::from_millis(10)));
        std::thread::spawn(move || drop(guard));
        assert!(in_flight.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_in_flight_skips_own_inline_handler() {
        let in_flight = Arc::new(InFlight::default());
        let own = in_flight.enter_inline();
        assert_eq!(in_flight.count(), 1);
        assert!(in_flight.wait_idle(Duration::from_millis(10)));

        // Another thread still waits for it.
        let other = in_flight.clone();
        let waited = std::thread::spawn(move || other.wait_idle(Duration::from_millis(10)));
        assert!(!waited.join().unwrap());

        let queued = in_flight.enter();
        assert!(!in_flight.wait_idle(Duration::from_millis(10)));
        drop(queued);
        drop(own);
        assert_eq!(in_flight.count(), 0);
        assert!(lock(&in_flight.running).inline.is_empty());
    }
}
