// ABOUTME: Duplex TLS transform contract the connection drives for encrypted transports
// ABOUTME: The engine itself is a collaborator; the core only pumps bytes through this trait

use bytes::Bytes;

use crate::error::DriverResult;

/// Output of one [`TlsSession::read_write`] pump step.
///
/// All buffers are owned by the caller once returned; nothing borrowed
/// from the engine crosses the trait boundary.
#[derive(Debug, Default)]
pub struct TlsTraffic {
    /// How many bytes of the `ciphertext_in` argument the engine
    /// consumed. The connection keeps feeding the remainder until every
    /// inbound byte has been accepted.
    pub consumed: usize,

    /// Decrypted application bytes to hand to the frame decoder.
    pub plaintext: Bytes,

    /// Encrypted bytes to write to the socket (handshake records or
    /// encrypted application data).
    pub ciphertext: Bytes,

    /// True once the handshake has completed. The connection reacts to
    /// the first `true` by advancing out of its transport-connected
    /// state; later repetitions are ignored.
    pub handshake_done: bool,
}

/// A TLS session as the connection sees it: an opaque duplex transform
/// with separate read-side and write-side byte streams.
///
/// The connection calls [`read_write`](TlsSession::read_write) in three
/// situations:
///
/// * with both inputs empty, to let the engine emit its first handshake
///   record after the TCP connect;
/// * with inbound socket bytes in `ciphertext_in`, looping until all of
///   them are consumed;
/// * with outbound frame bytes in `plaintext_in` when sending requests.
///
/// `plaintext_in` is always accepted in full; only `ciphertext_in` may
/// be partially consumed (reported via [`TlsTraffic::consumed`]).
/// Plaintext output is only ever produced while pumping inbound
/// ciphertext.
///
/// A fatal engine condition is reported as `Err`, which tears down the
/// connection.
pub trait TlsSession: Send {
    fn read_write(&mut self, ciphertext_in: &[u8], plaintext_in: &[u8])
    -> DriverResult<TlsTraffic>;
}
