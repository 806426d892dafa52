//! Expiry of pending calls when nobody reads the connection.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use tracing::{debug, warn};

use crate::connection::WeakConnection;
use crate::lock;

#[derive(Default)]
struct State {
    deadlines: BinaryHeap<Reverse<Instant>>,
    started: bool,
    stopped: bool,
}

/// Deadlines of a connection's pending calls, watched by one thread that
/// is started with the first deadline.
///
/// A due deadline sweeps the whole pending table, so an entry left behind
/// by a call that resolved early only causes a harmless sweep.
#[derive(Default)]
pub(crate) struct Deadlines {
    state: Mutex<State>,
    cond: Condvar,
}

impl Deadlines {
    pub fn new() -> Arc<Deadlines> {
        Arc::new(Deadlines::default())
    }

    pub fn track(self: &Arc<Self>, deadline: Instant, conn: WeakConnection, id: u64) {
        let mut state = lock(&self.state);
        if state.stopped {
            return;
        }
        state.deadlines.push(Reverse(deadline));
        if state.started {
            drop(state);
            self.cond.notify_one();
            return;
        }

        let deadlines = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("dbuslink-timer-{}", id))
            .spawn(move || deadlines.run(conn));
        match spawned {
            Ok(_) => state.started = true,
            // Blocked callers and `process` still expire their calls.
            Err(e) => warn!("connection {}: no timer thread: {}", id, e),
        }
    }

    pub fn stop(&self) {
        lock(&self.state).stopped = true;
        self.cond.notify_all();
    }

    fn run(&self, conn: WeakConnection) {
        let mut state = lock(&self.state);
        while !state.stopped {
            let next = state.deadlines.peek().map(|Reverse(d)| *d);
            let now = Instant::now();
            state = match next {
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) if deadline > now => {
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                Some(_) => {
                    while matches!(state.deadlines.peek(), Some(Reverse(d)) if *d <= now) {
                        state.deadlines.pop();
                    }
                    drop(state);
                    match conn.upgrade() {
                        Some(conn) => conn.sweep_timeouts(),
                        None => break,
                    }
                    lock(&self.state)
                }
            };
        }
        debug!("timer thread finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stop_before_start_ignores_deadlines() {
        let deadlines = Deadlines::new();
        deadlines.stop();
        deadlines.track(Instant::now(), WeakConnection::default(), 0);
        let state = lock(&deadlines.state);
        assert!(!state.started);
        assert!(state.deadlines.is_empty());
    }

    #[test]
    fn test_thread_exits_without_connection() {
        let deadlines = Deadlines::new();
        deadlines.track(
            Instant::now() + Duration::from_millis(10),
            WeakConnection::default(),
            0,
        );
        assert!(lock(&deadlines.state).started);
        // The due deadline finds no connection and ends the thread.
        let start = Instant::now();
        while Arc::strong_count(&deadlines) > 1 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }
    }
}
