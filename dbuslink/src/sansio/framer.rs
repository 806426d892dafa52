//! Inbound framing state machine.
//!
//! This module implements stream reassembly without any I/O operations.

use std::collections::VecDeque;

use tracing::{error, trace, warn};

use super::protocol::parse_frame;
use super::types::{FrameEvent, ParseResult};
use crate::{ErrorKind, Message, Result};

/// Framer state
#[derive(Debug, Clone, PartialEq)]
pub enum FramerState {
    /// Accepting input
    Open,
    /// The stream lost frame synchronisation
    Failed {
        /// Error message
        message: String,
    },
}

/// Sans-IO reassembly of messages from a byte stream.
///
/// - `handle_input()`: Process incoming bytes
/// - `poll_event()`: Get decoded messages and dropped-frame notices
///
/// A frame whose boundary is known but whose content is invalid produces
/// [`FrameEvent::Dropped`] and framing continues. When no boundary can be
/// determined the framer fails for good; events decoded before the failure
/// stay available.
#[derive(Debug)]
pub struct Framer {
    state: FramerState,
    recv_buf: Vec<u8>,
    pending_events: VecDeque<FrameEvent>,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            state: FramerState::Open,
            recv_buf: Vec::new(),
            pending_events: VecDeque::new(),
        }
    }

    /// Process incoming data from the transport.
    ///
    /// Returns an error only when the stream is unrecoverable.
    pub fn handle_input(&mut self, data: &[u8]) -> Result<()> {
        if let FramerState::Failed { message } = &self.state {
            return Err(ErrorKind::Framing(message.clone()).into_error());
        }

        self.recv_buf.extend_from_slice(data);

        let mut start = 0;
        let result = loop {
            match parse_frame(&self.recv_buf[start..]) {
                ParseResult::Complete { message, consumed } => {
                    start += consumed;
                    match Message::parse(&message) {
                        Ok(m) => {
                            trace!("received {}", m);
                            self.pending_events.push_back(FrameEvent::Message(m));
                        }
                        Err(e) => {
                            warn!("dropping malformed frame of {} bytes: {}", consumed, e);
                            self.pending_events.push_back(FrameEvent::Dropped {
                                error: e.to_string(),
                            });
                        }
                    }
                }
                ParseResult::Incomplete { .. } => break Ok(()),
                ParseResult::Invalid { error } => {
                    error!("lost frame synchronisation: {}", error);
                    self.state = FramerState::Failed {
                        message: error.clone(),
                    };
                    break Err(ErrorKind::Framing(error).into_error());
                }
            }
        };

        self.recv_buf.drain(..start);
        result
    }

    /// Poll for decoded messages.
    pub fn poll_event(&mut self) -> Option<FrameEvent> {
        self.pending_events.pop_front()
    }

    pub fn state(&self) -> &FramerState {
        &self.state
    }

    /// Bytes received but not yet framed.
    pub fn buffered(&self) -> usize {
        self.recv_buf.len()
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sansio::serialize_message;

    fn ping(serial: u32) -> Vec<u8> {
        let msg = Message::method_call("/", "Ping")
            .interface("org.freedesktop.DBus.Peer")
            .build()
            .unwrap();
        serialize_message(&msg, serial).unwrap()
    }

    fn next_serial(framer: &mut Framer) -> u32 {
        match framer.poll_event() {
            Some(FrameEvent::Message(m)) => m.serial(),
            other => panic!("Expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut framer = Framer::new();
        let bytes = ping(1);
        for b in &bytes {
            framer.handle_input(std::slice::from_ref(b)).unwrap();
        }
        assert_eq!(next_serial(&mut framer), 1);
        assert!(framer.poll_event().is_none());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_several_frames_in_one_chunk() {
        let mut framer = Framer::new();
        let mut bytes = ping(1);
        bytes.extend(ping(2));
        bytes.extend(&ping(3)[..7]);
        framer.handle_input(&bytes).unwrap();
        assert_eq!(next_serial(&mut framer), 1);
        assert_eq!(next_serial(&mut framer), 2);
        assert!(framer.poll_event().is_none());
        assert_eq!(framer.buffered(), 7);
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let mut framer = Framer::new();
        let mut bad = ping(1);
        // Protocol version 9 keeps the boundary but fails decoding.
        bad[3] = 9;
        bad.extend(ping(2));
        framer.handle_input(&bad).unwrap();
        match framer.poll_event() {
            Some(FrameEvent::Dropped { .. }) => {}
            other => panic!("Expected a dropped frame, got {:?}", other),
        }
        assert_eq!(next_serial(&mut framer), 2);
        assert_eq!(framer.state(), &FramerState::Open);
    }

    #[test]
    fn test_lost_synchronisation() {
        let mut framer = Framer::new();
        let mut bytes = ping(1);
        let mut garbage = ping(2);
        garbage[0] = 0;
        bytes.extend(garbage);
        assert!(framer.handle_input(&bytes).is_err());
        assert_eq!(next_serial(&mut framer), 1);
        assert!(matches!(framer.state(), FramerState::Failed { .. }));
        let e = framer.handle_input(&ping(3)).unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::Framing(_)));
    }
}
