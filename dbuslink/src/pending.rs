//! Outstanding method calls awaiting their reply.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::connection::WeakConnection;
use crate::error::*;
use crate::lock;
use crate::message::{Message, MessageType};

/// How a pending call ended.
pub(crate) enum Outcome {
    Reply(Message),
    Failed(ErrorKind),
}

impl Outcome {
    fn into_result(self) -> Result<Message> {
        match self {
            Outcome::Reply(m) if m.message_type() == MessageType::Error => {
                Err(ErrorKind::from_reply(&m).into_error())
            }
            Outcome::Reply(m) => Ok(m),
            Outcome::Failed(kind) => Err(kind.into_error()),
        }
    }
}

type Callback = Box<dyn FnOnce(Result<Message>) + Send + 'static>;

enum SlotState {
    Waiting(Option<Callback>),
    /// `None` once the outcome was taken or handed to the callback.
    Done(Option<Outcome>),
}

/// The single-transition resolution cell shared by the pending table and
/// the [`PendingCall`].
pub(crate) struct PendingSlot {
    serial: u32,
    deadline: Option<Instant>,
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl PendingSlot {
    pub fn new(serial: u32, deadline: Option<Instant>) -> Arc<PendingSlot> {
        Arc::new(PendingSlot {
            serial,
            deadline,
            state: Mutex::new(SlotState::Waiting(None)),
            cond: Condvar::new(),
        })
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |d| now >= d)
    }

    /// Resolve once; later attempts return `false`. A registered callback
    /// runs on the calling thread with no lock held.
    pub fn resolve(&self, outcome: Outcome) -> bool {
        let mut state = lock(&self.state);
        let callback = match std::mem::replace(&mut *state, SlotState::Done(None)) {
            SlotState::Waiting(callback) => callback,
            done => {
                *state = done;
                return false;
            }
        };
        match callback {
            Some(callback) => {
                drop(state);
                callback(outcome.into_result());
            }
            None => {
                *state = SlotState::Done(Some(outcome));
                drop(state);
                self.cond.notify_all();
            }
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*lock(&self.state), SlotState::Done(_))
    }

    fn take(&self) -> Option<Outcome> {
        match &mut *lock(&self.state) {
            SlotState::Done(outcome) => outcome.take(),
            SlotState::Waiting(_) => None,
        }
    }

    /// Run `callback` on resolution, or now if already resolved.
    fn set_callback(&self, callback: Callback) {
        let mut state = lock(&self.state);
        let ready = match &mut *state {
            SlotState::Waiting(slot) => {
                *slot = Some(callback);
                return;
            }
            SlotState::Done(outcome) => outcome.take(),
        };
        drop(state);
        if let Some(outcome) = ready {
            callback(outcome.into_result());
        }
    }

    /// Block up to `timeout` for a resolution.
    pub fn wait_for(&self, timeout: Duration) {
        let state = lock(&self.state);
        if matches!(*state, SlotState::Waiting(_)) {
            let _ = self
                .cond
                .wait_timeout_while(state, timeout, |s| matches!(s, SlotState::Waiting(_)));
        }
    }
}

/// Handle to a method call whose reply has not been consumed yet.
///
/// The call resolves exactly once: with the reply, an error reply (as
/// `Err`), a timeout, or the closing of its connection. Dropping the
/// handle leaves the call outstanding; its reply is then discarded.
pub struct PendingCall {
    slot: Arc<PendingSlot>,
    conn: WeakConnection,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("serial", &self.slot.serial())
            .field("deadline", &self.slot.deadline())
            .field("resolved", &self.slot.is_resolved())
            .finish()
    }
}

impl PendingCall {
    pub(crate) fn new(slot: Arc<PendingSlot>, conn: WeakConnection) -> PendingCall {
        PendingCall { slot, conn }
    }

    pub fn serial(&self) -> u32 {
        self.slot.serial()
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Block until the call resolves. Without a dispatcher the waiting
    /// thread reads the connection itself.
    pub fn wait(self) -> Result<Message> {
        loop {
            if let Some(outcome) = self.slot.take() {
                return outcome.into_result();
            }
            let conn = match self.conn.upgrade() {
                Some(conn) => conn,
                None => return Err(ErrorKind::ConnectionClosed.into_error()),
            };
            let now = Instant::now();
            if self.slot.is_expired(now) {
                conn.expire(self.slot.serial());
                continue;
            }
            let mut slice = conn.poll_interval();
            if let Some(deadline) = self.slot.deadline() {
                slice = slice.min(deadline - now);
            }
            conn.wait_slice(&self.slot, slice);
        }
    }

    /// Run `f` with the outcome instead of waiting for it.
    pub fn on_resolved<F>(self, f: F)
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        self.slot.set_callback(Box::new(f));
    }

    /// Withdraw the call; a later reply is dropped as stale. Returns
    /// `false` if it had already resolved.
    pub fn cancel(self) -> bool {
        match self.conn.upgrade() {
            Some(conn) => conn.forget(self.slot.serial()),
            None => false,
        }
    }

    /// Wait without blocking the async runtime.
    #[cfg(feature = "tokio")]
    pub async fn wait_async(self) -> Result<Message> {
        tokio::task::spawn_blocking(move || self.wait())
            .await
            .map_err(|e| ErrorKind::Failed(e.to_string()).into_error())?
    }
}
