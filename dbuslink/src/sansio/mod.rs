//! Sans-IO framing of the message stream.
//!
//! Frame boundaries are found and frames decoded without performing any
//! I/O, so the same code serves every transport and the tests.
//!
//! - `handle_input()`: feed incoming bytes to the framer
//! - `poll_event()`: take decoded messages and dropped-frame notices
//!
//! # Example
//!
//! ```
//! use dbuslink::sansio::{serialize_message, FrameEvent, Framer};
//! use dbuslink::Message;
//!
//! let ping = Message::method_call("/", "Ping")
//!     .interface("org.freedesktop.DBus.Peer")
//!     .build()?;
//! let bytes = serialize_message(&ping, 1)?;
//!
//! let mut framer = Framer::new();
//! // Bytes arrive in arbitrary chunks.
//! framer.handle_input(&bytes[..10])?;
//! assert!(framer.poll_event().is_none());
//! framer.handle_input(&bytes[10..])?;
//! match framer.poll_event() {
//!     Some(FrameEvent::Message(m)) => assert_eq!(m.member(), Some("Ping")),
//!     other => panic!("unexpected {:?}", other),
//! }
//! # Ok::<(), dbuslink::Error>(())
//! ```

pub mod framer;
pub mod protocol;
pub mod types;

pub use self::framer::Framer;
pub use self::protocol::{parse_frame, serialize_message};
pub use self::types::{FrameEvent, ParseResult};
