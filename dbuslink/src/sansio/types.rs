//! Core types for sans-io framing.

use crate::Message;

/// Result of looking for a frame at the start of a byte buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// A complete frame; it may still fail to decode
    Complete {
        /// The frame bytes
        message: Vec<u8>,
        /// Number of bytes consumed from input
        consumed: usize,
    },
    /// More data is needed to complete the frame
    Incomplete {
        /// Minimum number of additional bytes needed
        needed: usize,
    },
    /// No frame boundary can be determined; the stream is unusable
    Invalid {
        /// Description of the parse error
        error: String,
    },
}

/// Events emitted by the [`Framer`](super::Framer).
#[derive(Debug, Clone)]
pub enum FrameEvent {
    /// A decoded message
    Message(Message),
    /// A frame with a known boundary whose content did not decode. The
    /// stream continues with the next frame.
    Dropped {
        /// Why the frame was dropped
        error: String,
    },
}
