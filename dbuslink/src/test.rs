use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use static_assertions::assert_impl_all;

use crate::sansio::serialize_message;
use crate::*;

assert_impl_all!(Connection: Send, Sync, Clone);
assert_impl_all!(WeakConnection: Send, Sync);
assert_impl_all!(Message: Send, Sync, Clone);
assert_impl_all!(Dispatcher: Send, Sync);
assert_impl_all!(PendingCall: Send);
assert_impl_all!(ObjectProxy: Send, Sync);
assert_impl_all!(MethodProxy: Send, Sync);
assert_impl_all!(SignalToken: Send);
assert_impl_all!(WorkerHandle: Send, Sync);

const ECHO_PATH: &str = "/org/example/Echo";
const ECHO_IFACE: &str = "org.example.Echo";
const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn config() -> ConnectionConfig {
    ConnectionConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(DispatcherConfig {
        poll_interval: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(1),
        ..Default::default()
    })
}

fn echo_interface() -> Interface {
    Interface::new(ECHO_IFACE)
        .unwrap()
        .with_method(Method::typed("Echo", |(s,): (String,)| Ok((s,))).unwrap())
        .unwrap()
        .with_method(
            Method::new("Fail", "", "", |call| {
                call.reply_error("org.example.Error.Nope", "not today")
            })
            .unwrap(),
        )
        .unwrap()
        .with_method(
            Method::new("Broken", "", "s", |_| {
                Err(ErrorKind::Failed("broken".into()).into_error())
            })
            .unwrap(),
        )
        .unwrap()
        .with_method(Method::new("Panic", "", "", |_| panic!("handler panic")).unwrap())
        .unwrap()
        .with_method(Method::new("Silent", "", "s", |_| Ok(())).unwrap())
        .unwrap()
        .with_signal("Echoed", "s")
        .unwrap()
}

/// A served echo object on one end, the client end of the pair.
fn echo_pair() -> (Dispatcher, Connection, Connection) {
    let (server, client) = Connection::pair(config());
    server
        .register_object(Object::new(ECHO_PATH).unwrap().with_interface(echo_interface()).unwrap())
        .unwrap();
    let d = dispatcher();
    d.add_connection(&server).unwrap();
    d.start().unwrap();
    (d, server, client)
}

fn call(path: &str, interface: Option<&str>, member: &str) -> MessageBuilder {
    let mut b = Message::method_call(path, member);
    if let Some(i) = interface {
        b = b.interface(i);
    }
    b
}

#[test]
fn test_echo() {
    let (d, _server, client) = echo_pair();

    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo")
        .body(&("hello",))
        .unwrap()
        .build()
        .unwrap();
    let reply = client.send_and_block(m, WAIT).unwrap();
    assert_eq!(reply.message_type(), MessageType::MethodReturn);
    let (s,): (String,) = reply.body().unwrap();
    assert_eq!(s, "hello");
    assert_eq!(client.pending_count(), 0);

    // without an interface, every interface of the object is searched
    let m = call(ECHO_PATH, None, "Echo").body(&("again",)).unwrap().build().unwrap();
    let (s,): (String,) = client.send_and_block(m, WAIT).unwrap().body().unwrap();
    assert_eq!(s, "again");

    d.stop();
}

#[test]
fn test_unknown_targets() {
    let (d, _server, client) = echo_pair();

    let e = client
        .send_and_block(call("/nowhere", Some(ECHO_IFACE), "Echo").build().unwrap(), WAIT)
        .unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::UnknownObject(_)));

    let e = client
        .send_and_block(call(ECHO_PATH, Some("org.example.Other"), "Echo").build().unwrap(), WAIT)
        .unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::UnknownInterface(_)));

    let e = client
        .send_and_block(call(ECHO_PATH, Some(ECHO_IFACE), "Nope").build().unwrap(), WAIT)
        .unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::UnknownMethod(_)));
    assert_eq!(e.kind().error_name(), ERROR_UNKNOWN_METHOD);

    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo")
        .body(&(42u32,))
        .unwrap()
        .build()
        .unwrap();
    let e = client.send_and_block(m, WAIT).unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::InvalidArgs(_)));

    assert_eq!(client.pending_count(), 0);
    assert!(client.is_open());
    d.stop();
}

#[test]
fn test_handler_failures() {
    let (d, _server, client) = echo_pair();

    let e = client
        .send_and_block(call(ECHO_PATH, Some(ECHO_IFACE), "Fail").build().unwrap(), WAIT)
        .unwrap_err();
    assert_eq!(
        *e.kind(),
        ErrorKind::ErrorReply {
            name: "org.example.Error.Nope".into(),
            message: "not today".into(),
        }
    );

    let e = client
        .send_and_block(call(ECHO_PATH, Some(ECHO_IFACE), "Broken").build().unwrap(), WAIT)
        .unwrap_err();
    assert_eq!(e.kind().error_name(), ERROR_FAILED);

    let e = client
        .send_and_block(call(ECHO_PATH, Some(ECHO_IFACE), "Panic").build().unwrap(), WAIT)
        .unwrap_err();
    assert_eq!(e.kind().error_name(), ERROR_FAILED);

    // returning without a reply for a method with results
    let e = client
        .send_and_block(call(ECHO_PATH, Some(ECHO_IFACE), "Silent").build().unwrap(), WAIT)
        .unwrap_err();
    assert_eq!(e.kind().error_name(), ERROR_FAILED);

    // the I/O thread survived the panic
    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo").body(&("x",)).unwrap().build().unwrap();
    assert!(client.send_and_block(m, WAIT).is_ok());
    d.stop();
}

#[test]
fn test_no_reply_expected() {
    let (server, client) = Connection::pair(config());
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    server
        .register_method(
            ECHO_PATH,
            ECHO_IFACE,
            Method::new("Note", "s", "", move |call| {
                let (s,): (String,) = call.args()?;
                tx.lock().unwrap().send(s).unwrap();
                Ok(())
            })
            .unwrap(),
        )
        .unwrap();

    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Note")
        .no_reply_expected()
        .body(&("fire and forget",))
        .unwrap()
        .build()
        .unwrap();
    client.send(m).unwrap();
    assert_eq!(client.pending_count(), 0);

    let deadline = Instant::now() + Duration::from_secs(5);
    while rx.try_recv().is_err() {
        assert!(Instant::now() < deadline);
        server.process(Duration::from_millis(10)).unwrap();
    }
    // nothing was sent back
    client.process(Duration::from_millis(50)).unwrap();
    assert_eq!(client.queued_count(), 0);
}

#[test]
fn test_timeout_removes_pending() {
    let (_server, client) = Connection::pair(config());
    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo").body(&("x",)).unwrap().build().unwrap();
    let start = Instant::now();
    let e = client
        .send_and_block(m, Some(Duration::from_millis(100)))
        .unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(client.pending_count(), 0);
    assert!(client.is_open());
}

#[test]
fn test_callback_times_out_without_reader() {
    // no dispatcher and no process(): only the timer thread sees the deadline
    let (_server, client) = Connection::pair(config());
    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo").body(&("x",)).unwrap().build().unwrap();
    let pending = client.send_with_reply(m, Some(Duration::from_millis(50))).unwrap();
    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    pending.on_resolved(move |r| tx.send(r.map(|_| ()).map_err(|e| e.kind().clone())).unwrap());

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Err(ErrorKind::Timeout));
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert_eq!(client.pending_count(), 0);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_expired_call_is_swept_by_process() {
    let (_server, client) = Connection::pair(config());
    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo").body(&("x",)).unwrap().build().unwrap();
    let pending = client.send_with_reply(m, Some(Duration::from_millis(20))).unwrap();
    let (tx, rx) = mpsc::channel();
    pending.on_resolved(move |r| tx.send(r.map(|_| ()).map_err(|e| e.kind().clone())).unwrap());

    thread::sleep(Duration::from_millis(40));
    client.process(Duration::ZERO).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Err(ErrorKind::Timeout));
    assert_eq!(client.pending_count(), 0);
}

#[test]
fn test_dispatcher_stop_fails_outstanding_calls_once() {
    let (_server, client) = Connection::pair(config());
    let d = dispatcher();
    d.add_connection(&client).unwrap();
    d.start().unwrap();

    let resolutions = Arc::new(AtomicUsize::new(0));
    let mut threads = Vec::new();
    for i in 0..3 {
        let client = client.clone();
        let resolutions = resolutions.clone();
        threads.push(thread::spawn(move || {
            let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo")
                .body(&(format!("call {}", i),))
                .unwrap()
                .build()
                .unwrap();
            let r = client.send_and_block(m, None);
            resolutions.fetch_add(1, Ordering::SeqCst);
            r.unwrap_err().kind().clone()
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while client.pending_count() < 3 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }
    d.stop();

    for t in threads {
        assert_eq!(t.join().unwrap(), ErrorKind::DispatcherStopped);
    }
    assert_eq!(resolutions.load(Ordering::SeqCst), 3);
    assert_eq!(client.pending_count(), 0);
    assert!(!client.is_open());

    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo").body(&("late",)).unwrap().build().unwrap();
    assert_eq!(*client.send(m).unwrap_err().kind(), ErrorKind::ConnectionClosed);
}

#[test]
fn test_stop_from_inline_handler() {
    let (server, client) = Connection::pair(config());
    let d = Arc::new(Dispatcher::new(DispatcherConfig {
        poll_interval: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(5),
        ..Default::default()
    }));
    let slot = Arc::new(std::sync::Mutex::new(Some(d.clone())));
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    server
        .register_method(
            ECHO_PATH,
            ECHO_IFACE,
            Method::new("Stop", "", "", move |_| {
                if let Some(d) = slot.lock().unwrap().take() {
                    let start = Instant::now();
                    d.stop();
                    tx.lock().unwrap().send(start.elapsed()).unwrap();
                }
                Ok(())
            })
            .unwrap(),
        )
        .unwrap();
    d.add_connection(&server).unwrap();
    d.start().unwrap();

    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Stop")
        .no_reply_expected()
        .build()
        .unwrap();
    client.send(m).unwrap();

    // The handler does not wait out the drain timeout for itself.
    let took = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(took < Duration::from_secs(2));
    assert!(!d.is_running());
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.is_open() {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_close_fails_pending_calls() {
    let (_server, client) = Connection::pair(config());
    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo").body(&("x",)).unwrap().build().unwrap();
    let pending = client.send_with_reply(m, None).unwrap();
    client.close();
    assert_eq!(*pending.wait().unwrap_err().kind(), ErrorKind::ConnectionClosed);
    client.close();
}

#[test]
fn test_peer_closing_fails_pending_calls() {
    let (server, client) = Connection::pair(config());
    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo").body(&("x",)).unwrap().build().unwrap();
    let pending = client.send_with_reply(m, None).unwrap();
    drop(server);
    assert_eq!(*pending.wait().unwrap_err().kind(), ErrorKind::ConnectionClosed);
    assert!(!client.is_open());
}

#[test]
fn test_signals() {
    let (d, server, client) = echo_pair();
    d.add_connection(&client).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let token = client
        .add_signal_handler(
            MatchRule::for_signal(None, ECHO_PATH, ECHO_IFACE, "Echoed"),
            move |m| {
                let (s,): (String,) = m.body().unwrap();
                tx.lock().unwrap().send(s).unwrap();
            },
        )
        .unwrap();
    let stream = client
        .signal_stream(MatchRule::new().message_type(MessageType::Signal).path_namespace("/org/example"))
        .unwrap();

    server.emit_signal("/elsewhere", ECHO_IFACE, "Echoed", &("ignored",)).unwrap();
    server.emit_signal(ECHO_PATH, ECHO_IFACE, "Echoed", &("one",)).unwrap();
    server.emit_signal(ECHO_PATH, ECHO_IFACE, "Other", &()).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "one");
    let first = stream.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.member(), Some("Echoed"));
    let second = stream.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second.member(), Some("Other"));

    drop(token);
    server.emit_signal(ECHO_PATH, ECHO_IFACE, "Echoed", &("two",)).unwrap();
    let third = stream.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(third.member(), Some("Echoed"));
    assert!(rx.try_recv().is_err());

    d.stop();
    assert!(stream.recv_timeout(Duration::from_millis(10)).is_err());
}

#[test]
fn test_signal_proxy() {
    let (d, server, client) = echo_pair();
    d.add_connection(&client).unwrap();

    let echoed = ObjectProxy::new(&client, None, ECHO_PATH)
        .unwrap()
        .interface(ECHO_IFACE)
        .unwrap()
        .signal("Echoed", "s")
        .unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let _token = echoed
        .connect(move |(s,): (String,), m: &Message| {
            tx.lock().unwrap().send((s, m.serial())).unwrap();
        })
        .unwrap();

    let serial = server.emit_signal(ECHO_PATH, ECHO_IFACE, "Echoed", &("hi",)).unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ("hi".to_string(), serial)
    );
    d.stop();
}

#[test]
fn test_method_proxy() {
    let (d, _server, client) = echo_pair();
    let iface = ObjectProxy::new(&client, None, ECHO_PATH)
        .unwrap()
        .with_timeout(Duration::from_secs(5))
        .interface(ECHO_IFACE)
        .unwrap();
    let echo = iface.method("Echo", "s", "s").unwrap();

    let (s,): (String,) = echo.call(&("sync",)).unwrap();
    assert_eq!(s, "sync");

    let pending = echo.call_async::<_, (String,)>(&("async",)).unwrap();
    assert_eq!(pending.wait().unwrap().0, "async");

    let (tx, rx) = mpsc::channel();
    echo.call_async::<_, (String,)>(&("callback",))
        .unwrap()
        .on_resolved(move |r| tx.send(r.unwrap().0).unwrap());
    // nothing else reads the client side
    let start = Instant::now();
    let s = loop {
        client.process(Duration::from_millis(20)).unwrap();
        if let Ok(s) = rx.try_recv() {
            break s;
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    };
    assert_eq!(s, "callback");

    let reply = echo.call_with(|w| w.append_str("raw")).unwrap();
    assert_eq!(reply.body::<(String,)>().unwrap().0, "raw");

    // the remote side returns 's'; a proxy expecting 'u' must not truncate
    let wrong = iface.method("Echo", "s", "u").unwrap();
    let e = wrong.call::<_, (u32,)>(&("x",)).unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::TypeMismatch { .. }));

    echo.call_no_reply(&("ignored",)).unwrap();
    iface.object().ping().unwrap();
    d.stop();
}

#[test]
fn test_worker_policy_runs_off_io_thread() {
    let worker = Worker::spawn("echo-worker").unwrap();
    let (server, client) = Connection::pair(config());
    let object = Object::new(ECHO_PATH)
        .unwrap()
        .with_policy(worker.policy())
        .with_interface(
            Interface::new(ECHO_IFACE)
                .unwrap()
                .with_method(
                    Method::new("Where", "", "s", |call| {
                        let name = thread::current().name().unwrap_or("").to_string();
                        call.reply(&(name,))
                    })
                    .unwrap(),
                )
                .unwrap(),
        )
        .unwrap();
    server.register_object(object).unwrap();
    let d = dispatcher();
    d.add_connection(&server).unwrap();
    d.start().unwrap();

    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Where").build().unwrap();
    let (name,): (String,) = client.send_and_block(m, WAIT).unwrap().body().unwrap();
    assert_eq!(name, "echo-worker");

    d.stop();
}

#[test]
fn test_worker_channel_on_caller_thread() {
    let (handle, queue) = worker_channel("caller");
    let (server, client) = Connection::pair(config());
    server
        .register_method(
            ECHO_PATH,
            ECHO_IFACE,
            Method::new("Where", "", "s", |call| {
                let id = format!("{:?}", thread::current().id());
                call.reply(&(id,))
            })
            .unwrap(),
        )
        .unwrap();
    server
        .set_delivery_policy(ECHO_PATH, DeliveryPolicy::Worker(handle))
        .unwrap();
    let d = dispatcher();
    d.add_connection(&server).unwrap();
    d.start().unwrap();

    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Where").build().unwrap();
    let pending = client.send_with_reply(m, WAIT).unwrap();
    assert!(queue.run_once(Duration::from_secs(5)));
    let (id,): (String,) = pending.wait().unwrap().body().unwrap();
    assert_eq!(id, format!("{:?}", thread::current().id()));

    d.stop();
}

#[test]
fn test_stale_reply_dropped() {
    let (raw, other) = MemoryTransport::pair();
    let conn = Connection::new(other, config());

    let mut orphan = Message::method_call("/", "Gone").build().unwrap();
    orphan.set_serial(999);
    let stale = Message::method_return(&orphan).build().unwrap();
    raw.send(&serialize_message(&stale, 5).unwrap()).unwrap();

    conn.process(Duration::from_millis(50)).unwrap();
    assert!(conn.is_open());
    assert_eq!(conn.queued_count(), 0);
}

#[test]
fn test_malformed_frame_dropped() {
    let (raw, other) = MemoryTransport::pair();
    let conn = Connection::new(other, config());
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    conn.register_method(
        ECHO_PATH,
        ECHO_IFACE,
        Method::new("Note", "u", "", move |call| {
            let (n,): (u32,) = call.args()?;
            tx.lock().unwrap().send(n).unwrap();
            Ok(())
        })
        .unwrap(),
    )
    .unwrap();

    let note = |n: u32, serial: u32| {
        let m = call(ECHO_PATH, Some(ECHO_IFACE), "Note")
            .no_reply_expected()
            .body(&(n,))
            .unwrap()
            .build()
            .unwrap();
        serialize_message(&m, serial).unwrap()
    };
    let mut bytes = note(1, 1);
    // an unknown protocol version keeps the frame boundary
    bytes[3] = 9;
    bytes.extend(note(2, 2));
    raw.send(&bytes).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let got = loop {
        conn.process(Duration::from_millis(10)).unwrap();
        if let Ok(n) = rx.try_recv() {
            break n;
        }
        assert!(Instant::now() < deadline);
    };
    assert_eq!(got, 2);
    assert!(conn.is_open());
}

#[test]
fn test_lost_sync_closes_connection() {
    let (raw, other) = MemoryTransport::pair();
    let conn = Connection::new(other, config());
    let pending = conn
        .send_with_reply(call("/", None, "Any").build().unwrap(), None)
        .unwrap();
    raw.send(&[b'X'; 16]).unwrap();
    assert!(conn.process(Duration::from_millis(50)).is_err());
    assert!(!conn.is_open());
    assert_eq!(*pending.wait().unwrap_err().kind(), ErrorKind::ConnectionClosed);
}

#[test]
fn test_registration() {
    let (server, _client) = Connection::pair(config());
    server
        .register_object(Object::new(ECHO_PATH).unwrap().with_interface(echo_interface()).unwrap())
        .unwrap();
    let e = server
        .register_method(
            ECHO_PATH,
            ECHO_IFACE,
            Method::typed("Echo", |(s,): (String,)| Ok((s,))).unwrap(),
        )
        .unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::DuplicateRegistration(_)));

    let root = server.describe("/").unwrap();
    assert_eq!(root.children, vec!["org".to_string()]);
    let echo = server.describe(ECHO_PATH).unwrap();
    let iface = echo.interface(ECHO_IFACE).unwrap();
    assert!(iface.methods.iter().any(|m| m.name == "Echo" && m.input == "s"));

    assert!(server.unregister_object(ECHO_PATH));
    assert!(server.describe(ECHO_PATH).is_none());
    assert!(server.set_delivery_policy(ECHO_PATH, DeliveryPolicy::Inline).is_err());
}

/// A stand-in for the bus daemon answering the calls a client makes.
fn fake_bus(add_matches: Arc<AtomicUsize>) -> (Dispatcher, MemoryTransport) {
    let (daemon_end, client_end) = MemoryTransport::pair();
    let daemon = Connection::new(daemon_end, config());
    let bus = Interface::new(BUS_INTERFACE)
        .unwrap()
        .with_method(Method::typed("Hello", |(): ()| Ok((":1.42".to_string(),))).unwrap())
        .unwrap()
        .with_method(
            Method::typed("RequestName", |(name, _flags): (String, u32)| {
                Ok((if name == "org.example.Taken" { 3u32 } else { 1u32 },))
            })
            .unwrap(),
        )
        .unwrap()
        .with_method(
            Method::typed("ReleaseName", |(_name,): (String,)| Ok((1u32,))).unwrap(),
        )
        .unwrap()
        .with_method(
            Method::new("AddMatch", "s", "", move |call| {
                let (rule,): (String,) = call.args()?;
                MatchRule::parse(&rule)?;
                add_matches.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap(),
        )
        .unwrap()
        .with_method(Method::new("RemoveMatch", "s", "", |_| Ok(())).unwrap())
        .unwrap();
    daemon
        .register_object(Object::new(BUS_PATH).unwrap().with_interface(bus).unwrap())
        .unwrap();
    let d = dispatcher();
    d.add_connection(&daemon).unwrap();
    d.start().unwrap();
    (d, client_end)
}

#[test]
fn test_bus_connection() {
    let add_matches = Arc::new(AtomicUsize::new(0));
    let (d, transport) = fake_bus(add_matches.clone());

    let conn = Connection::open_bus(transport, config()).unwrap();
    assert_eq!(conn.unique_name().as_deref(), Some(":1.42"));
    assert!(conn.is_bus());

    assert_eq!(
        conn.request_name("org.example.Mine", RequestNameFlags::DO_NOT_QUEUE).unwrap(),
        RequestNameReply::PrimaryOwner
    );
    assert_eq!(
        conn.request_name("org.example.Taken", RequestNameFlags::empty()).unwrap(),
        RequestNameReply::Exists
    );
    assert!(conn.request_name("not a name", RequestNameFlags::empty()).is_err());
    assert_eq!(conn.release_name("org.example.Mine").unwrap(), ReleaseNameReply::Released);

    // one AddMatch per distinct rule
    let rule = MatchRule::for_signal(None, ECHO_PATH, ECHO_IFACE, "Echoed");
    let a = conn.add_signal_handler(rule.clone(), |_| {}).unwrap();
    let b = conn.signal_stream(rule).unwrap();
    assert_eq!(add_matches.load(Ordering::SeqCst), 1);
    drop(a);
    drop(b);

    d.stop();
}

#[cfg(unix)]
#[test]
fn test_unix_socket() {
    use std::os::unix::net::UnixListener;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus");
    let listener = UnixListener::bind(&path).unwrap();

    let server_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let transport = StreamTransport::new(Box::new(stream)).unwrap();
        let server = Connection::new(transport, config());
        server
            .register_object(Object::new(ECHO_PATH).unwrap().with_interface(echo_interface()).unwrap())
            .unwrap();
        while server.process(Duration::from_millis(10)).is_ok() {}
    });

    let address = BusAddress::parse(&format!("unix:path={}", path.display())).unwrap();
    let transport = StreamTransport::new(address.connect().unwrap()).unwrap();
    let client = Connection::new(transport, config());

    let echo = ObjectProxy::new(&client, None, ECHO_PATH)
        .unwrap()
        .interface(ECHO_IFACE)
        .unwrap()
        .method("Echo", "s", "s")
        .unwrap();
    for word in ["over", "a", "socket"] {
        let (s,): (String,) = echo.call(&(word,)).unwrap();
        assert_eq!(s, word);
    }

    client.close();
    server_thread.join().unwrap();
}

#[test]
fn test_config_from_json() {
    let c: ConnectionConfig = serde_json::from_str(
        r#"{ "default_timeout": 50, "poll_interval": 5, "max_queued_messages": 2 }"#,
    )
    .unwrap();
    assert_eq!(c.default_timeout, Some(Duration::from_millis(50)));
    assert_eq!(c.read_buffer_size, 8192);

    let (_server, client) = Connection::pair(c);
    let m = call(ECHO_PATH, None, "Echo").body(&("x",)).unwrap().build().unwrap();
    assert_eq!(*client.send_and_block(m, None).unwrap_err().kind(), ErrorKind::Timeout);

    let d: DispatcherConfig = serde_json::from_str(r#"{ "thread_name": "io" }"#).unwrap();
    assert_eq!(d.poll_interval, Duration::from_millis(100));
    assert_eq!(serde_json::to_value(&d).unwrap()["drain_timeout"], 5000);
}

#[cfg(feature = "tokio")]
#[tokio::test]
async fn test_wait_async() {
    let (_server, client) = Connection::pair(config());
    let m = call(ECHO_PATH, Some(ECHO_IFACE), "Echo").body(&("x",)).unwrap().build().unwrap();
    let pending = client
        .send_with_reply(m, Some(Duration::from_millis(20)))
        .unwrap();
    let e = pending.wait_async().await.unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Timeout);
}
