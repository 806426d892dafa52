//! Byte transports a [`Connection`](crate::Connection) runs over.
//!
//! Authentication is done before a stream is handed to a transport.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chainerror::*;
use tracing::debug;

use crate::error::*;
use crate::lock;
use crate::stream::Stream;

/// A reliable, ordered byte pipe.
///
/// `send` and `recv` may be called concurrently from different threads.
pub trait Transport: Send + Sync {
    /// Write all of `bytes`.
    fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Read at most `buf.len()` bytes. `Ok(0)` is end of stream; an error
    /// of kind [`ErrorKind::Timeout`] means nothing arrived in time.
    /// `None` blocks until data arrives or the transport is shut down.
    fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;

    fn is_connected(&self) -> bool;

    /// Close both directions; blocked `recv` calls return.
    fn shutdown(&self);
}

/// Transport over a connected socket stream.
pub struct StreamTransport {
    reader: Mutex<Box<dyn Read + Send + Sync>>,
    writer: Mutex<Box<dyn Write + Send + Sync>>,
    control: Mutex<Box<dyn Stream>>,
    connected: AtomicBool,
}

impl StreamTransport {
    pub fn new(mut stream: Box<dyn Stream>) -> Result<StreamTransport> {
        let (reader, writer) = stream.split()?;
        Ok(StreamTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control: Mutex::new(stream),
            connected: AtomicBool::new(true),
        })
    }
}

impl Transport for StreamTransport {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(ErrorKind::ConnectionClosed.into_error());
        }
        let mut writer = lock(&self.writer);
        writer.write_all(bytes).map_context(ErrorKind::from_io)?;
        writer.flush().map_context(ErrorKind::from_io)?;
        Ok(())
    }

    fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if !self.is_connected() {
            return Ok(0);
        }
        // A zero timeout means "block forever" to the socket.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        lock(&self.control).set_read_timeout(timeout)?;

        let mut reader = lock(&self.reader);
        loop {
            match reader.read(buf) {
                Ok(0) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let e = ErrorKind::chain_error_from(e, None);
                    if *e.kind() == ErrorKind::ConnectionClosed {
                        self.connected.store(false, Ordering::SeqCst);
                        return Ok(0);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Err(e) = lock(&self.control).shutdown() {
                debug!("stream shutdown: {}", e);
            }
        }
    }
}

struct MemoryReader {
    rx: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
}

/// In-process transport; [`MemoryTransport::pair`] returns both ends of a
/// peer-to-peer link.
pub struct MemoryTransport {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Mutex<MemoryReader>,
    connected: AtomicBool,
}

const MEMORY_POLL_SLICE: Duration = Duration::from_millis(20);

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (MemoryTransport::new(a_tx, a_rx), MemoryTransport::new(b_tx, b_rx))
    }

    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> MemoryTransport {
        MemoryTransport {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(MemoryReader {
                rx,
                leftover: Vec::new(),
            }),
            connected: AtomicBool::new(true),
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx
                .send(bytes.to_vec())
                .map_err(|_| ErrorKind::ConnectionClosed.into_error()),
            None => Err(ErrorKind::ConnectionClosed.into_error()),
        }
    }

    fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut reader = lock(&self.rx);
        if reader.leftover.is_empty() {
            // Sliced waits notice a local shutdown.
            let chunk = loop {
                if !self.is_connected() {
                    return Ok(0);
                }
                let slice = match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return Err(ErrorKind::Timeout.into_error());
                        }
                        (d - now).min(MEMORY_POLL_SLICE)
                    }
                    None => MEMORY_POLL_SLICE,
                };
                match reader.rx.recv_timeout(slice) {
                    Ok(chunk) => break chunk,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        self.connected.store(false, Ordering::SeqCst);
                        return Ok(0);
                    }
                }
            };
            reader.leftover = chunk;
        }
        let n = buf.len().min(reader.leftover.len());
        buf[..n].copy_from_slice(&reader.leftover[..n]);
        reader.leftover.drain(..n);
        Ok(n)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.tx).take();
    }
}
