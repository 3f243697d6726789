// ABOUTME: Observer capability set a collaborator attaches to a connection
// ABOUTME: All hooks default to no-ops and are invoked from the connection's owning loop thread

use crate::connection::ConnectionId;
use crate::error::DriverError;
use crate::frame::Frame;

/// Callbacks a connection raises as it moves through its lifecycle.
///
/// Every hook runs on the connection's owning event-loop thread and must
/// return quickly; anything long-running belongs on another task.
pub trait ConnectionObserver: Send + Sync {
    /// The handshake finished. `error` is `None` when the connection
    /// reached `Ready`, otherwise the reason it failed. Raised exactly
    /// once per connection.
    fn on_connected(&self, conn: ConnectionId, error: Option<&DriverError>) {
        let _ = (conn, error);
    }

    /// A pending request was resolved (successfully or not) and its
    /// stream id returned to the pool.
    fn on_request_finished(&self, conn: ConnectionId) {
        let _ = conn;
    }

    /// The server switched the connection's keyspace (RESULT /
    /// SET_KEYSPACE).
    fn on_keyspace_changed(&self, conn: ConnectionId, keyspace: &str) {
        let _ = (conn, keyspace);
    }

    /// A statement preparation completed (RESULT / PREPARED) or failed.
    /// `query` is the originating statement text when the request carried
    /// it; `id` is empty on failure.
    fn on_prepared(
        &self,
        conn: ConnectionId,
        error: Option<&DriverError>,
        query: Option<&str>,
        id: &[u8],
    ) {
        let _ = (conn, error, query, id);
    }

    /// A frame with a negative stream id arrived: a server-initiated
    /// event. The core never treats these as protocol errors; routing
    /// them anywhere useful is the collaborator's business.
    fn on_server_event(&self, conn: ConnectionId, frame: &Frame) {
        let _ = (conn, frame);
    }
}

/// Observer that ignores everything; the default when none is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}
