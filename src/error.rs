// ABOUTME: Driver error taxonomy covering stream accounting, queueing, codec and transport failures
// ABOUTME: Provides structured error reporting with automatic conversion from underlying I/O errors

use std::io;
use thiserror::Error;

/// Errors produced by the connection and request-dispatch core.
///
/// Synchronous failures on the write path (`NoStreamsAvailable`, `Encode`)
/// are returned to the executing caller; asynchronous failures (I/O, parse,
/// TLS, server errors) are delivered through the pending request's future
/// or through the connect observer when they occur before the connection
/// reaches `Ready`.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Every stream id on the connection is tied to an in-flight request.
    /// The caller should retry once a response frees a slot, or apply
    /// backpressure.
    #[error("no streams available on connection")]
    NoStreamsAvailable,

    /// The request queue is at capacity; nothing was enqueued.
    #[error("request queue full")]
    QueueFull,

    /// Outbound frame serialization failed.
    #[error("frame encode failed: {0}")]
    Encode(String),

    /// The inbound byte stream does not form a valid frame.
    #[error("frame parse failed: {0}")]
    FrameParse(String),

    /// TCP-level failure: connect, read, write, or EOF outside a graceful
    /// close.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The TLS engine reported a fatal condition.
    #[error("tls error: {0}")]
    Tls(String),

    /// Terminal: the connection went away with the request still pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// An ERROR frame from the server, carrying its error code and text.
    #[error("server error {code:#010x}: {message}")]
    Server { code: i32, message: String },

    /// A response referenced a stream id with no pending request, or a
    /// stream id outside the table's capacity.
    #[error("invalid stream id {0}")]
    InvalidStream(i8),

    /// The driver configuration is unusable (e.g. compression negotiated
    /// without a codec installed).
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias used throughout the crate.
pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    /// Fatal errors close the connection unconditionally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Io(_) | DriverError::Tls(_) | DriverError::FrameParse(_)
        )
    }
}
