//! Connection and request-dispatch core for a CQL native protocol v3
//! client.
//!
//! The crate drives single connections through TCP (optionally TLS)
//! setup, the OPTIONS/SUPPORTED/STARTUP/READY handshake and multiplexed
//! stream dispatch, and batches request submissions from arbitrary
//! threads onto the event loop owning each connection.
//!
//! # Examples
//!
//! ## Connect and run a query
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cqlink::{Consistency, DriverConfig, EventLoopGroup, Host, NoopObserver, Request};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let group = EventLoopGroup::new(DriverConfig::default())?;
//! let conn = group.connect(
//!     Host::new("127.0.0.1".parse()?, 9042),
//!     Arc::new(NoopObserver),
//! );
//!
//! // An observer normally gates this on `on_connected`; a freshly
//! // created connection rejects requests until the handshake finished.
//! let response = group.submit(
//!     &conn,
//!     Request::query("SELECT cluster_name FROM system.local", Consistency::One),
//! )?;
//! let result = response.await??;
//! println!("{result:?}");
//!
//! group.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod frame;
pub mod manager;
pub mod observer;
pub mod queue;
pub mod stream;
pub mod tls;


// Re-export the protocol surface for direct access
pub use codec::{FrameDecoder, FrameHeader, Opcode};
pub use frame::{Consistency, Frame, QueryResult};

// Re-export the main driver API for easy access
pub use config::{Compression, CompressionCodec, ConnectionConfig, DriverConfig};
pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionState, Host, Request, ResponseFuture,
};
pub use error::{DriverError, DriverResult};
pub use event_loop::EventLoopGroup;
pub use manager::QueueManager;
pub use observer::{ConnectionObserver, NoopObserver};
pub use queue::{RequestItem, RequestQueue};
pub use stream::StreamTable;
pub use tls::{TlsSession, TlsTraffic};
