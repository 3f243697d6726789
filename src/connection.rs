// ABOUTME: Per-connection protocol engine driving TCP/TLS setup, handshake and frame dispatch
// ABOUTME: Owns the stream table and resolves pending request futures on its event loop's thread

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::codec::{FLAG_COMPRESSED, FrameDecoder, FrameHeader, Opcode};
use crate::config::{Compression, ConnectionConfig};
use crate::error::{DriverError, DriverResult};
use crate::frame::{self, Consistency, Frame, QueryResult};
use crate::observer::ConnectionObserver;
use crate::stream::StreamTable;
use crate::tls::TlsSession;

/// Driver-assigned identifier, unique per connection for the lifetime of
/// the event-loop group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Remote host descriptor: address family plus address bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Host {
    pub addr: IpAddr,
    pub port: u16,
}

impl Host {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl From<SocketAddr> for Host {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Connection lifecycle states. Transitions are strictly forward;
/// `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    New,
    Connected,
    Handshake,
    Supported,
    Ready,
    Disconnecting,
    Disconnected,
}

/// An outbound request as submitted through the queue: the opcode, the
/// already-encoded body, and optionally the statement text for prepare
/// observer dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    pub opcode: Opcode,
    pub body: Bytes,
    pub prepared_query: Option<String>,
}

impl Request {
    /// A QUERY request for the given statement text.
    pub fn query(text: &str, consistency: Consistency) -> Self {
        Self {
            opcode: Opcode::Query,
            body: frame::query_body(text, consistency),
            prepared_query: None,
        }
    }

    /// A request with a caller-encoded body.
    pub fn raw(opcode: Opcode, body: Bytes) -> Self {
        Self {
            opcode,
            body,
            prepared_query: None,
        }
    }

    /// Attach the originating statement text so a PREPARED result (or a
    /// failure) reaches the prepare observer with it.
    pub fn with_prepared_query(mut self, query: impl Into<String>) -> Self {
        self.prepared_query = Some(query.into());
        self
    }
}

/// Sender half of a pending request's future.
pub(crate) type ResponseSender = oneshot::Sender<DriverResult<QueryResult>>;

/// The caller-visible future for a submitted request.
pub type ResponseFuture = oneshot::Receiver<DriverResult<QueryResult>>;

/// What a live stream-table slot holds.
pub(crate) enum PendingRequest {
    /// OPTIONS/STARTUP sent by the state machine itself; the response is
    /// handled by state, not by a caller future.
    Handshake,
    /// A caller-submitted request.
    Caller {
        tx: ResponseSender,
        query: Option<String>,
    },
}

impl PendingRequest {
    fn query(&self) -> Option<&str> {
        match self {
            PendingRequest::Handshake => None,
            PendingRequest::Caller { query, .. } => query.as_deref(),
        }
    }

    /// Deliver the outcome; returns whether a caller was listening.
    fn resolve(self, result: DriverResult<QueryResult>) -> bool {
        match self {
            PendingRequest::Handshake => false,
            PendingRequest::Caller { tx, .. } => {
                let _ = tx.send(result);
                true
            }
        }
    }
}

/// Commands delivered to the connection's driver task by its event loop.
pub(crate) enum Command {
    /// One flush cycle's worth of requests for this connection; encoded
    /// back to back and written with a single socket flush.
    Execute(Vec<crate::queue::RequestItem>),
    /// Locally initiated close.
    Close,
}

/// Non-owning reference to a connection.
///
/// Queue items carry this instead of the connection itself; the owning
/// event loop keeps the connection alive until it reaches
/// `Disconnected`, so a handle can always be resolved or fails cleanly.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    loop_index: usize,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Index of the event loop this connection is bound to.
    pub fn loop_index(&self) -> usize {
        self.loop_index
    }

    /// Ask the connection to close; pending requests resolve with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub(crate) fn send(&self, command: Command) -> Result<(), Command> {
        self.commands.send(command).map_err(|e| e.0)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("loop_index", &self.loop_index)
            .finish()
    }
}

/// A single connection's protocol engine.
///
/// Created by the event-loop group and driven by [`run`](Connection::run)
/// as a task on the owning loop's thread. All state mutation happens
/// there; other threads interact only through the request queue and the
/// [`ConnectionHandle`].
pub(crate) struct Connection {
    id: ConnectionId,
    host: Host,
    config: ConnectionConfig,
    state: ConnectionState,
    decoder: FrameDecoder,
    streams: StreamTable<PendingRequest>,
    observer: Arc<dyn ConnectionObserver>,
    tls: Option<Box<dyn TlsSession>>,
    supported_options: HashMap<String, Vec<String>>,
    commands: Option<mpsc::UnboundedReceiver<Command>>,
    terminated: mpsc::UnboundedSender<ConnectionId>,
    notified_connected: bool,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        loop_index: usize,
        host: Host,
        config: ConnectionConfig,
        observer: Arc<dyn ConnectionObserver>,
        tls: Option<Box<dyn TlsSession>>,
        terminated: mpsc::UnboundedSender<ConnectionId>,
    ) -> (Self, ConnectionHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id,
            loop_index,
            commands: command_tx,
        };
        let connection = Self {
            id,
            host,
            decoder: FrameDecoder::new(config.max_frame_body_len),
            streams: StreamTable::new(config.max_streams),
            config,
            state: ConnectionState::New,
            observer,
            tls,
            supported_options: HashMap::new(),
            commands: Some(command_rx),
            terminated,
            notified_connected: false,
        };
        (connection, handle)
    }

    /// Drive the connection from `New` to termination. Runs as its event
    /// loop's task and returns only once the socket is fully released.
    pub(crate) async fn run(mut self) {
        let Some(mut commands) = self.commands.take() else {
            return;
        };
        let error = self.drive(&mut commands).await.err();
        self.teardown(&mut commands, error);
        let _ = self.terminated.send(self.id);
    }

    async fn drive(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> DriverResult<()> {
        if self.config.compression != Compression::None && self.config.compression_codec.is_none()
        {
            return Err(DriverError::Config(
                "compression negotiated without a codec installed".to_string(),
            ));
        }

        debug!(conn = %self.id, host = %self.host, "connecting");
        let connect = TcpStream::connect(self.host.socket_addr());
        tokio::pin!(connect);
        let socket = loop {
            tokio::select! {
                result = &mut connect => break result?,
                command = commands.recv() => match command {
                    Some(Command::Execute(items)) => {
                        for item in items {
                            item.fail(DriverError::ConnectionClosed);
                        }
                    }
                    Some(Command::Close) | None => return Ok(()),
                },
            }
        };
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        self.set_state(ConnectionState::Connected);

        let (mut reader, mut writer) = socket.into_split();
        self.advance(&mut writer).await?;

        let mut read_buf = BytesMut::with_capacity(16 * 1024);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Execute(items)) => {
                        self.execute_batch(&mut writer, items).await?;
                    }
                    Some(Command::Close) | None => {
                        let _ = writer.shutdown().await;
                        return Ok(());
                    }
                },
                read = reader.read_buf(&mut read_buf) => {
                    let n = read?;
                    if n == 0 {
                        if self.decoder.partial_bytes() > 0 {
                            return Err(DriverError::FrameParse(
                                "socket closed mid-frame".to_string(),
                            ));
                        }
                        return Err(DriverError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection reset by peer",
                        )));
                    }
                    let chunk = read_buf.split();
                    self.on_socket_bytes(&mut writer, &chunk).await?;
                }
            }
        }
    }

    /// React to inbound socket bytes: through the TLS engine when one is
    /// attached, otherwise straight into the frame decoder.
    async fn on_socket_bytes(
        &mut self,
        writer: &mut OwnedWriteHalf,
        input: &[u8],
    ) -> DriverResult<()> {
        if self.tls.is_none() {
            return self.on_plaintext(writer, input).await;
        }

        // Feed ciphertext until the engine has consumed all of it,
        // forwarding emitted plaintext to the decoder and emitted
        // ciphertext (handshake records) back to the socket.
        let mut offset = 0;
        loop {
            let Some(tls) = self.tls.as_mut() else {
                return Ok(());
            };
            let traffic = tls.read_write(&input[offset..], &[])?;
            offset += traffic.consumed;
            if !traffic.ciphertext.is_empty() {
                writer.write_all(&traffic.ciphertext).await?;
            }
            let handshake_done = traffic.handshake_done;
            if !traffic.plaintext.is_empty() {
                self.on_plaintext(writer, &traffic.plaintext).await?;
            }
            if handshake_done && self.state == ConnectionState::Connected {
                self.set_state(ConnectionState::Handshake);
                self.advance(writer).await?;
            }
            if offset >= input.len() {
                return Ok(());
            }
            if traffic.consumed == 0
                && traffic.ciphertext.is_empty()
                && traffic.plaintext.is_empty()
            {
                // The engine made no progress and emitted nothing; it
                // needs more input than we have.
                return Ok(());
            }
        }
    }

    /// Feed decrypted bytes to the frame decoder and dispatch every
    /// completed frame.
    async fn on_plaintext(
        &mut self,
        writer: &mut OwnedWriteHalf,
        input: &[u8],
    ) -> DriverResult<()> {
        let mut offset = 0;
        while offset < input.len() {
            offset += self.decoder.consume(&input[offset..])?;
            if let Some(frame) = self.decoder.take_frame() {
                self.dispatch(writer, frame).await?;
            }
        }
        Ok(())
    }

    /// Advance the handshake whenever the state machine owes the server
    /// the next message.
    async fn advance(&mut self, writer: &mut OwnedWriteHalf) -> DriverResult<()> {
        loop {
            match self.state {
                ConnectionState::Connected => match &mut self.tls {
                    Some(tls) => {
                        // A zero-byte read makes the engine emit its
                        // first outbound handshake record.
                        let traffic = tls.read_write(&[], &[])?;
                        if !traffic.ciphertext.is_empty() {
                            writer.write_all(&traffic.ciphertext).await?;
                        }
                        if traffic.handshake_done {
                            self.set_state(ConnectionState::Handshake);
                            continue;
                        }
                        return Ok(());
                    }
                    None => {
                        self.set_state(ConnectionState::Handshake);
                        continue;
                    }
                },
                ConnectionState::Handshake => {
                    let stream = self.reserve_handshake_stream()?;
                    let frame = Frame::options(stream);
                    return self.send_frame(writer, &frame).await;
                }
                ConnectionState::Supported => {
                    let stream = self.reserve_handshake_stream()?;
                    let frame = Frame::startup(stream, &self.config);
                    return self.send_frame(writer, &frame).await;
                }
                _ => return Ok(()),
            }
        }
    }

    fn reserve_handshake_stream(&mut self) -> DriverResult<i8> {
        self.streams
            .set_stream(PendingRequest::Handshake)
            .map_err(|_| DriverError::NoStreamsAvailable)
    }

    /// Dispatch one complete inbound frame according to the current
    /// state. Unexpected opcodes are protocol errors, never assertions.
    async fn dispatch(&mut self, writer: &mut OwnedWriteHalf, frame: Frame) -> DriverResult<()> {
        let frame = self.decompressed(frame)?;

        if frame.is_server_event() {
            self.observer.on_server_event(self.id, &frame);
            return Ok(());
        }

        match (self.state, frame.opcode()) {
            (ConnectionState::Handshake, Opcode::Supported) => {
                self.streams.get_stream(frame.stream())?;
                self.supported_options = frame::parse_supported(&frame.body)?;
                if !frame::supports_compression(&self.supported_options, self.config.compression)
                {
                    return Err(DriverError::Config(format!(
                        "server does not support {:?} compression",
                        self.config.compression
                    )));
                }
                self.set_state(ConnectionState::Supported);
                self.advance(writer).await
            }
            (ConnectionState::Supported, Opcode::Ready) => {
                self.streams.get_stream(frame.stream())?;
                self.set_state(ConnectionState::Ready);
                self.notified_connected = true;
                self.observer.on_connected(self.id, None);
                Ok(())
            }
            (ConnectionState::Handshake | ConnectionState::Supported, Opcode::Error) => {
                // Pre-Ready server error fails the connect; teardown
                // routes it to the connected observer.
                Err(frame::parse_error(&frame.body))
            }
            (ConnectionState::Ready, Opcode::Result) => {
                let result = frame::parse_result(&frame.body)?;
                let pending = match self.streams.get_stream(frame.stream()) {
                    Ok(pending) => pending,
                    Err(_) => {
                        warn!(conn = %self.id, stream = frame.stream(),
                            "RESULT for unknown stream, dropping");
                        return Ok(());
                    }
                };
                match &result {
                    QueryResult::SetKeyspace(keyspace) => {
                        self.observer.on_keyspace_changed(self.id, keyspace);
                    }
                    QueryResult::Prepared { id, .. } => {
                        self.observer
                            .on_prepared(self.id, None, pending.query(), id);
                    }
                    _ => {}
                }
                if pending.resolve(Ok(result)) {
                    self.observer.on_request_finished(self.id);
                }
                Ok(())
            }
            (ConnectionState::Ready, Opcode::Error) => {
                let pending = match self.streams.get_stream(frame.stream()) {
                    Ok(pending) => pending,
                    Err(_) => {
                        warn!(conn = %self.id, stream = frame.stream(),
                            "ERROR for unknown stream, dropping");
                        return Ok(());
                    }
                };
                let error = frame::parse_error(&frame.body);
                if let Some(query) = pending.query() {
                    self.observer
                        .on_prepared(self.id, Some(&error), Some(query), &[]);
                }
                if pending.resolve(Err(error)) {
                    self.observer.on_request_finished(self.id);
                }
                Ok(())
            }
            (state, opcode) => Err(DriverError::FrameParse(format!(
                "unexpected {opcode:?} frame in state {state:?}"
            ))),
        }
    }

    /// Run the body through the negotiated codec when the compressed
    /// flag is set.
    fn decompressed(&self, mut frame: Frame) -> DriverResult<Frame> {
        if frame.header.flags & FLAG_COMPRESSED == 0 {
            return Ok(frame);
        }
        let Some(codec) = self.config.compression_codec.as_ref() else {
            return Err(DriverError::FrameParse(
                "compressed frame but no codec negotiated".to_string(),
            ));
        };
        frame.body = codec.decompress(&frame.body)?;
        frame.header.flags &= !FLAG_COMPRESSED;
        Ok(frame)
    }

    /// Execute one flush cycle's batch: reserve a stream and encode each
    /// request, then push the whole batch through a single socket flush.
    async fn execute_batch(
        &mut self,
        writer: &mut OwnedWriteHalf,
        items: Vec<crate::queue::RequestItem>,
    ) -> DriverResult<()> {
        let mut batch = BytesMut::new();
        for item in items {
            if self.state != ConnectionState::Ready {
                item.fail(DriverError::ConnectionClosed);
                continue;
            }
            self.stage_request(item, &mut batch);
        }
        if !batch.is_empty() {
            self.write_bytes(writer, &batch).await?;
        }
        Ok(())
    }

    /// Reserve a stream id, encode the frame, and append it to the
    /// batch. Failures resolve the item's future synchronously and leave
    /// the table untouched.
    fn stage_request(&mut self, item: crate::queue::RequestItem, batch: &mut BytesMut) {
        let (request, tx) = item.into_parts();

        if request.body.len() > u32::MAX as usize {
            let _ = tx.send(Err(DriverError::Encode(
                "frame body exceeds u32 length".to_string(),
            )));
            return;
        }

        // Request-less opcodes go out without a stream reservation; the
        // future resolves as soon as the frame is staged.
        if request.opcode.is_fire_and_forget() {
            match self.encode_frame(0, request.opcode, request.body) {
                Ok(encoded) => {
                    batch.extend_from_slice(&encoded);
                    let _ = tx.send(Ok(QueryResult::Void));
                }
                Err(error) => {
                    let _ = tx.send(Err(error));
                }
            }
            return;
        }

        let pending = PendingRequest::Caller {
            tx,
            query: request.prepared_query,
        };
        let stream = match self.streams.set_stream(pending) {
            Ok(stream) => stream,
            Err(pending) => {
                pending.resolve(Err(DriverError::NoStreamsAvailable));
                return;
            }
        };

        match self.encode_frame(stream, request.opcode, request.body) {
            Ok(encoded) => batch.extend_from_slice(&encoded),
            Err(error) => {
                // Encode failed: release the slot before reporting.
                if let Ok(pending) = self.streams.get_stream(stream) {
                    pending.resolve(Err(error));
                }
            }
        }
    }

    /// Encode one outbound frame, running the body through the
    /// negotiated compression codec when one is installed.
    fn encode_frame(&self, stream: i8, opcode: Opcode, body: Bytes) -> DriverResult<BytesMut> {
        let mut frame = Frame::new(FrameHeader::request(stream, opcode), body);
        if self.config.compression != Compression::None && !frame.body.is_empty() {
            // A missing codec was rejected back in drive().
            if let Some(codec) = self.config.compression_codec.as_ref() {
                frame.body = codec
                    .compress(&frame.body)
                    .map_err(|error| DriverError::Encode(error.to_string()))?;
                frame.header.flags |= FLAG_COMPRESSED;
            }
        }
        Ok(frame.encode())
    }

    /// Write raw frame bytes, encrypting through the TLS engine when one
    /// is attached.
    async fn write_bytes(
        &mut self,
        writer: &mut OwnedWriteHalf,
        bytes: &[u8],
    ) -> DriverResult<()> {
        match &mut self.tls {
            Some(tls) => {
                let traffic = tls.read_write(&[], bytes)?;
                if !traffic.ciphertext.is_empty() {
                    writer.write_all(&traffic.ciphertext).await?;
                }
                Ok(())
            }
            None => {
                writer.write_all(bytes).await?;
                Ok(())
            }
        }
    }

    async fn send_frame(&mut self, writer: &mut OwnedWriteHalf, frame: &Frame) -> DriverResult<()> {
        let buf = frame.encode();
        self.write_bytes(writer, &buf).await
    }

    /// Enter `Disconnecting`, fail every pending request exactly once,
    /// drain late commands, and settle in `Disconnected`.
    fn teardown(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        error: Option<DriverError>,
    ) {
        self.set_state(ConnectionState::Disconnecting);

        if !self.notified_connected {
            self.notified_connected = true;
            let error = error.unwrap_or(DriverError::ConnectionClosed);
            self.observer.on_connected(self.id, Some(&error));
        } else if let Some(error) = &error {
            debug!(conn = %self.id, %error, "connection failed");
        }

        for pending in self.streams.drain() {
            if pending.resolve(Err(DriverError::ConnectionClosed)) {
                self.observer.on_request_finished(self.id);
            }
        }

        // Requests that raced the close and are still sitting in the
        // command channel fail the same way.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Execute(items) = command {
                for item in items {
                    item.fail(DriverError::ConnectionClosed);
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(conn = %self.id, from = ?self.state, to = ?next, "state change");
        self.state = next;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A handle whose command channel goes nowhere; enough for queue
    /// bookkeeping tests.
    pub(crate) fn dummy_handle(loop_index: usize) -> ConnectionHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        std::mem::forget(receiver);
        ConnectionHandle {
            id: ConnectionId(0),
            loop_index,
            commands,
        }
    }
}
