//! Background I/O threads serving connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chainerror::*;
use tracing::{debug, warn};

use crate::config::DispatcherConfig;
use crate::connection::Connection;
use crate::error::*;
use crate::lock;

#[derive(Default)]
struct State {
    connections: Vec<Connection>,
    threads: Vec<JoinHandle<()>>,
    running: bool,
    stopped: bool,
}

/// Reads each added connection on its own I/O thread and dispatches its
/// calls and signals there.
///
/// Stopping joins the threads, waits up to the drain timeout for handlers
/// still running and then closes the connections. Calls still waiting for
/// a reply fail with [`ErrorKind::DispatcherStopped`].
///
/// ```rust
/// use dbuslink::{Connection, ConnectionConfig, Dispatcher, DispatcherConfig};
///
/// let (a, _b) = Connection::pair(ConnectionConfig::default());
/// let dispatcher = Dispatcher::new(DispatcherConfig::default());
/// dispatcher.add_connection(&a).unwrap();
/// dispatcher.start().unwrap();
/// assert!(dispatcher.is_running());
/// dispatcher.stop();
/// assert!(!a.is_open());
/// assert!(dispatcher.start().is_err());
/// ```
pub struct Dispatcher {
    config: DispatcherConfig,
    stop: Arc<AtomicBool>,
    state: Mutex<State>,
}

fn io_loop(conn: Connection, stop: Arc<AtomicBool>, poll: Duration) {
    debug!("I/O thread for {:?} started", conn);
    while !stop.load(Ordering::SeqCst) {
        if let Err(e) = conn.process(poll) {
            if !conn.is_open() {
                debug!("I/O thread exits: {}", e);
                return;
            }
            warn!("I/O error: {}", e);
        }
    }
    debug!("I/O thread for {:?} stopped", conn);
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Dispatcher {
        Dispatcher {
            config,
            stop: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(State::default()),
        }
    }

    fn spawn(&self, conn: Connection, index: usize) -> Result<JoinHandle<()>> {
        let stop = self.stop.clone();
        let poll = self.config.poll_interval;
        thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name, index))
            .spawn(move || io_loop(conn, stop, poll))
            .map_context(ErrorKind::from_io)
    }

    /// Serve `conn`; it gets its I/O thread now if the dispatcher runs.
    pub fn add_connection(&self, conn: &Connection) -> Result<()> {
        let mut state = lock(&self.state);
        if state.stopped {
            return Err(ErrorKind::DispatcherStopped.into_error());
        }
        let index = state.connections.len();
        state.connections.push(conn.clone());
        if state.running {
            let handle = self.spawn(conn.clone(), index)?;
            state.threads.push(handle);
        }
        Ok(())
    }

    /// Start the I/O threads. Starting a running dispatcher does nothing;
    /// a stopped one cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.stopped {
            return Err(ErrorKind::DispatcherStopped.into_error());
        }
        if state.running {
            return Ok(());
        }
        let connections = state.connections.clone();
        for (index, conn) in connections.into_iter().enumerate() {
            let handle = self.spawn(conn, index)?;
            state.threads.push(handle);
        }
        state.running = true;
        debug!("dispatcher started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        let state = lock(&self.state);
        state.running && !state.stopped
    }

    /// Stop serving. Idempotent.
    pub fn stop(&self) {
        let (threads, connections) = {
            let mut state = lock(&self.state);
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.running = false;
            (
                std::mem::take(&mut state.threads),
                std::mem::take(&mut state.connections),
            )
        };

        self.stop.store(true, Ordering::SeqCst);
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("an I/O thread panicked");
            }
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        for conn in &connections {
            let left = deadline.saturating_duration_since(Instant::now());
            if !conn.in_flight().wait_idle(left) {
                warn!(
                    "{} handler(s) of {:?} still running after the drain timeout",
                    conn.in_flight().count(),
                    conn
                );
            }
        }
        for conn in &connections {
            conn.close_with(ErrorKind::DispatcherStopped);
        }
        debug!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::message::Message;

    #[test]
    fn test_start_stop_idempotent() {
        let d = Dispatcher::new(DispatcherConfig::default());
        d.start().unwrap();
        d.start().unwrap();
        assert!(d.is_running());
        d.stop();
        d.stop();
        assert!(!d.is_running());
        assert_eq!(*d.start().unwrap_err().kind(), ErrorKind::DispatcherStopped);
    }

    #[test]
    fn test_stop_fails_outstanding_calls() {
        let (a, _b) = Connection::pair(ConnectionConfig::default());
        let d = Dispatcher::new(DispatcherConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        d.add_connection(&a).unwrap();
        d.start().unwrap();

        let call = Message::method_call("/", "Never").build().unwrap();
        let pending = a.send_with_reply(call, None).unwrap();
        d.stop();

        let e = pending.wait().unwrap_err();
        assert_eq!(*e.kind(), ErrorKind::DispatcherStopped);
        assert_eq!(a.pending_count(), 0);
        assert!(d.add_connection(&a).is_err());
    }
}
