use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::cursor::Endianness;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// `ConnectionConfig` specifies the parameters of a [`Connection`].
///
/// Durations are given in milliseconds when deserialized.
///
/// Examples:
///
/// ```rust
/// use std::time::Duration;
///
/// let c = dbuslink::ConnectionConfig::default();
/// assert_eq!(c.default_timeout, Some(Duration::from_secs(25)));
/// assert_eq!(c.read_buffer_size, 8192);
///
/// let c: dbuslink::ConnectionConfig =
///     serde_json::from_str(r#"{ "default_timeout": null, "endianness": "Big" }"#).unwrap();
/// assert!(c.default_timeout.is_none());
/// assert_eq!(c.max_queued_messages, 4096);
/// ```
///
/// [`Connection`]: crate::Connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Timeout for calls made without an explicit one; `None` waits forever
    #[serde(with = "option_duration_ms")]
    pub default_timeout: Option<Duration>,
    /// Size of a single transport read
    pub read_buffer_size: usize,
    /// Calls and signals waiting for dispatch; the oldest is dropped beyond this
    pub max_queued_messages: usize,
    /// Byte order of messages this connection builds itself
    pub endianness: Endianness,
    /// Read slice of blocked callers
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            default_timeout: Some(Duration::from_secs(25)),
            read_buffer_size: 8192,
            max_queued_messages: 4096,
            endianness: Endianness::Little,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// `DispatcherConfig` specifies the parameters of a [`Dispatcher`].
///
/// ```rust
/// let d = dbuslink::DispatcherConfig::default();
/// assert_eq!(d.thread_name, "dbuslink-io");
/// assert_eq!(d.drain_timeout, std::time::Duration::from_secs(5));
/// ```
///
/// [`Dispatcher`]: crate::Dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How long an I/O thread blocks in a read before checking for stop
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// How long `stop` waits for running handlers
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,
    /// Name prefix of the I/O threads
    pub thread_name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(5),
            thread_name: "dbuslink-io".into(),
        }
    }
}
