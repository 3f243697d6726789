// ABOUTME: Connection and driver tunables with builder-style constructors
// ABOUTME: Covers protocol version, compression negotiation, stream and queue capacities, flush back-off

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::DriverResult;
use crate::stream::MAX_STREAMS;

/// Frame-body compression negotiated during STARTUP.
///
/// The mode only selects the `COMPRESSION` option sent to the server; the
/// actual body transform is supplied by a [`CompressionCodec`]. Without a
/// codec installed, only [`Compression::None`] is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Snappy,
    Lz4,
}

impl Compression {
    /// The value carried in the STARTUP option map, if any.
    pub fn option_value(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Snappy => Some("snappy"),
            Compression::Lz4 => Some("lz4"),
        }
    }
}

/// Pluggable frame-body transform applied when compression is negotiated
/// and the frame's compression flag is set.
pub trait CompressionCodec: Send + Sync {
    fn compress(&self, body: &[u8]) -> DriverResult<Bytes>;
    fn decompress(&self, body: &[u8]) -> DriverResult<Bytes>;
}

/// Per-connection settings.
///
/// # Example
///
/// ```rust
/// use cqlink::config::{Compression, ConnectionConfig};
///
/// let config = ConnectionConfig::new()
///     .with_protocol_version("3.0.0")
///     .with_compression(Compression::None)
///     .with_max_streams(64);
/// ```
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Value of `CQL_VERSION` sent in STARTUP (default: `"3.0.0"`).
    pub protocol_version: String,

    /// Compression mode to negotiate (default: none).
    pub compression: Compression,

    /// Codec used to transform frame bodies once compression is
    /// negotiated. Required for any mode other than `None`.
    pub compression_codec: Option<Arc<dyn CompressionCodec>>,

    /// Maximum concurrent in-flight requests per connection, at most 128
    /// (default: 128).
    pub max_streams: usize,

    /// Inbound frames with a larger body are rejected as malformed
    /// (default: 64 MiB).
    pub max_frame_body_len: usize,

    /// Disable Nagle's algorithm on the socket (default: true).
    pub tcp_nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: "3.0.0".to_string(),
            compression: Compression::None,
            compression_codec: None,
            max_streams: MAX_STREAMS,
            max_frame_body_len: 64 * 1024 * 1024,
            tcp_nodelay: true,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("protocol_version", &self.protocol_version)
            .field("compression", &self.compression)
            .field("has_codec", &self.compression_codec.is_some())
            .field("max_streams", &self.max_streams)
            .field("max_frame_body_len", &self.max_frame_body_len)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_compression_codec(mut self, codec: Arc<dyn CompressionCodec>) -> Self {
        self.compression_codec = Some(codec);
        self
    }

    pub fn with_max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = max_streams.min(MAX_STREAMS);
        self
    }

    pub fn with_max_frame_body_len(mut self, len: usize) -> Self {
        self.max_frame_body_len = len;
        self
    }

    pub fn without_tcp_nodelay(mut self) -> Self {
        self.tcp_nodelay = false;
        self
    }
}

/// Driver-wide settings: event-loop count, queue sizing and flush back-off.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Number of event loops, each on its own thread (default: 1).
    pub num_event_loops: usize,

    /// Capacity of each loop's request queue; rounded up to a power of
    /// two (default: 16384).
    pub queue_capacity: usize,

    /// Empty flushes tolerated before the back-off timer stops rearming
    /// (default: 4).
    pub flush_backoff_threshold: u32,

    /// Delay of the flush back-off timer (default: 1 ms).
    pub flush_backoff_interval: Duration,

    /// Settings applied to every connection the driver opens.
    pub connection: ConnectionConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            num_event_loops: 1,
            queue_capacity: 16 * 1024,
            flush_backoff_threshold: 4,
            flush_backoff_interval: Duration::from_millis(1),
            connection: ConnectionConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_event_loops(mut self, n: usize) -> Self {
        self.num_event_loops = n.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.next_power_of_two();
        self
    }

    pub fn with_flush_backoff(mut self, threshold: u32, interval: Duration) -> Self {
        self.flush_backoff_threshold = threshold;
        self.flush_backoff_interval = interval;
        self
    }

    pub fn with_connection_config(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_capacity_rounds_to_power_of_two() {
        let config = DriverConfig::new().with_queue_capacity(1000);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn max_streams_is_capped() {
        let config = ConnectionConfig::new().with_max_streams(4096);
        assert_eq!(config.max_streams, MAX_STREAMS);
    }

    #[test]
    fn compression_option_values() {
        assert_eq!(Compression::None.option_value(), None);
        assert_eq!(Compression::Snappy.option_value(), Some("snappy"));
        assert_eq!(Compression::Lz4.option_value(), Some("lz4"));
    }
}
