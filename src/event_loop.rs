// ABOUTME: Event loops owning connections and draining their request queue in coalesced flush cycles
// ABOUTME: The group runs one loop per thread on a current-thread runtime and round-robins new connections

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep, sleep};
use tracing::{debug, error, trace};

use crate::config::DriverConfig;
use crate::connection::{
    Command, Connection, ConnectionHandle, ConnectionId, Host, Request, ResponseFuture,
};
use crate::error::{DriverError, DriverResult};
use crate::manager::QueueManager;
use crate::observer::ConnectionObserver;
use crate::queue::{RequestItem, RequestQueue};
use crate::tls::TlsSession;

pub(crate) enum LoopControl {
    Register(ConnectionHandle),
    Shutdown,
}

/// One event loop: owns a disjoint set of connections and exactly one
/// request queue, and is the only place that queue is drained.
pub(crate) struct EventLoop {
    index: usize,
    config: DriverConfig,
    queue: Arc<RequestQueue>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    // Connections that terminated before their registration arrived.
    orphaned: HashSet<ConnectionId>,
    control: mpsc::UnboundedReceiver<LoopControl>,
    terminated: mpsc::UnboundedReceiver<ConnectionId>,
    flushes_without_writes: u32,
}

impl EventLoop {
    pub(crate) fn new(
        index: usize,
        config: DriverConfig,
        queue: Arc<RequestQueue>,
        control: mpsc::UnboundedReceiver<LoopControl>,
        terminated: mpsc::UnboundedReceiver<ConnectionId>,
    ) -> Self {
        Self {
            index,
            config,
            queue,
            connections: HashMap::new(),
            orphaned: HashSet::new(),
            control,
            terminated,
            flushes_without_writes: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(loop_index = self.index, "event loop started");
        let queue = self.queue.clone();
        let mut backoff = Box::pin(sleep(Duration::ZERO));
        let mut backoff_armed = false;
        let mut queue_closed = false;
        let mut shutting_down = false;

        loop {
            tokio::select! {
                _ = queue.notified() => {
                    if !queue.is_closing() {
                        self.flush(backoff.as_mut(), &mut backoff_armed);
                    }
                }
                _ = backoff.as_mut(), if backoff_armed => {
                    backoff_armed = false;
                    self.flush(backoff.as_mut(), &mut backoff_armed);
                }
                control = self.control.recv() => match control {
                    Some(LoopControl::Register(handle)) => {
                        if !self.orphaned.remove(&handle.id()) {
                            self.connections.insert(handle.id(), handle);
                        }
                    }
                    Some(LoopControl::Shutdown) => {
                        shutting_down = true;
                        for handle in self.connections.values() {
                            handle.close();
                        }
                    }
                    // The group is gone; nothing can reach this loop
                    // anymore.
                    None => break,
                },
                finished = self.terminated.recv() => {
                    if let Some(id) = finished {
                        if self.connections.remove(&id).is_none() {
                            self.orphaned.insert(id);
                        }
                    }
                }
            }

            if queue.is_closing() && !queue_closed {
                queue_closed = true;
                backoff_armed = false;
                self.drain_closing();
            }
            if shutting_down && self.connections.is_empty() {
                break;
            }
        }
        debug!(loop_index = self.index, "event loop stopped");
    }

    /// One flush cycle.
    ///
    /// Drains up to a ring's worth of items, hands each touched
    /// connection its portion as one batch (one socket flush per
    /// connection per cycle), then settles the wakeup bookkeeping: if
    /// anything was written, release `is_flushing` and re-arm a wakeup
    /// when the ring refilled behind us; otherwise walk the back-off
    /// ladder before giving the signal right back to producers.
    fn flush(&mut self, backoff: Pin<&mut Sleep>, backoff_armed: &mut bool) {
        let mut touched: Vec<(ConnectionHandle, Vec<RequestItem>)> = Vec::new();
        let mut by_connection: HashMap<ConnectionId, usize> = HashMap::new();

        let mut drained = 0usize;
        while drained < self.queue.capacity() {
            let Some(item) = self.queue.pop() else { break };
            drained += 1;
            let id = item.connection().id();
            let slot = *by_connection.entry(id).or_insert_with(|| {
                touched.push((item.connection().clone(), Vec::new()));
                touched.len() - 1
            });
            touched[slot].1.push(item);
        }
        trace!(
            loop_index = self.index,
            drained,
            connections = touched.len(),
            "flush cycle"
        );

        for (handle, items) in touched {
            if let Err(Command::Execute(items)) = handle.send(Command::Execute(items)) {
                // The connection's driver task is gone; the loop only
                // learns about it asynchronously.
                for item in items {
                    item.fail(DriverError::ConnectionClosed);
                }
            }
        }

        if drained > 0 {
            self.flushes_without_writes = 0;
            self.queue.release_flush();
            // A producer that saw is_flushing=true did not signal; if
            // the ring is non-empty we must schedule the next flush
            // ourselves.
            if !self.queue.is_empty() && self.queue.claim_flush() {
                self.queue.signal_wakeup();
            }
        } else {
            self.flushes_without_writes += 1;
            if self.flushes_without_writes < self.config.flush_backoff_threshold {
                // Keep the flag claimed and retry shortly; this absorbs
                // tight producer bursts without a wakeup per item.
                backoff.reset(Instant::now() + self.config.flush_backoff_interval);
                *backoff_armed = true;
            } else {
                self.queue.release_flush();
                // An item pushed while we still held the flag would
                // otherwise strand until the next write.
                if !self.queue.is_empty() && self.queue.claim_flush() {
                    self.queue.signal_wakeup();
                }
            }
        }
    }

    /// The queue is closing: fail whatever is still in the ring and stop
    /// flushing.
    fn drain_closing(&mut self) {
        let mut failed = 0usize;
        while let Some(item) = self.queue.pop() {
            item.fail(DriverError::ConnectionClosed);
            failed += 1;
        }
        if failed > 0 {
            debug!(loop_index = self.index, failed, "request queue closed with items pending");
        }
        self.queue.release_flush();
    }
}

struct LoopSlot {
    runtime: tokio::runtime::Handle,
    control: mpsc::UnboundedSender<LoopControl>,
    terminated: mpsc::UnboundedSender<ConnectionId>,
    thread: Option<JoinHandle<()>>,
}

/// The driver's reactor binding: N event loops, each on a dedicated
/// thread running a current-thread tokio runtime, so every connection's
/// I/O and timer work executes on its owning loop's thread.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cqlink::config::DriverConfig;
/// use cqlink::connection::{Host, Request};
/// use cqlink::event_loop::EventLoopGroup;
/// use cqlink::frame::Consistency;
/// use cqlink::observer::NoopObserver;
///
/// # fn main() -> Result<(), cqlink::error::DriverError> {
/// let group = EventLoopGroup::new(DriverConfig::default())?;
/// let conn = group.connect(Host::new("127.0.0.1".parse().unwrap(), 9042), Arc::new(NoopObserver));
///
/// // ... once the connected observer fires:
/// let future = group.submit(&conn, Request::query("SELECT now() FROM system.local", Consistency::One))?;
/// # drop(future);
/// # Ok(())
/// # }
/// ```
pub struct EventLoopGroup {
    config: DriverConfig,
    manager: Arc<QueueManager>,
    loops: Vec<LoopSlot>,
    next_connection: AtomicU64,
    next_loop: AtomicUsize,
}

impl EventLoopGroup {
    /// Spawn the loop threads and their queues.
    pub fn new(config: DriverConfig) -> DriverResult<Self> {
        let num_loops = config.num_event_loops.max(1);
        let manager = Arc::new(QueueManager::new(num_loops, config.queue_capacity));

        let mut loops = Vec::with_capacity(num_loops);
        for index in 0..num_loops {
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let (terminated_tx, terminated_rx) = mpsc::unbounded_channel();
            let queue = manager.get(index).clone();
            let loop_config = config.clone();
            let (ready_tx, ready_rx) = std::sync::mpsc::channel();

            let thread = std::thread::Builder::new()
                .name(format!("cqlink-loop-{index}"))
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(error) => {
                            let _ = ready_tx.send(Err(error));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(runtime.handle().clone()));
                    let event_loop =
                        EventLoop::new(index, loop_config, queue, control_rx, terminated_rx);
                    runtime.block_on(event_loop.run());
                })?;

            let runtime = match ready_rx.recv() {
                Ok(Ok(handle)) => handle,
                Ok(Err(error)) => return Err(DriverError::Io(error)),
                Err(_) => {
                    return Err(DriverError::Io(io::Error::other(
                        "event loop thread exited during startup",
                    )));
                }
            };

            loops.push(LoopSlot {
                runtime,
                control: control_tx,
                terminated: terminated_tx,
                thread: Some(thread),
            });
        }

        Ok(Self {
            config,
            manager,
            loops,
            next_connection: AtomicU64::new(0),
            next_loop: AtomicUsize::new(0),
        })
    }

    /// Open a plain TCP connection to `host`, bound round-robin to one of
    /// the loops. The handshake outcome arrives through the observer's
    /// `on_connected`.
    pub fn connect(&self, host: Host, observer: Arc<dyn ConnectionObserver>) -> ConnectionHandle {
        self.connect_with_tls(host, observer, None)
    }

    /// Open a connection whose traffic is pushed through the given TLS
    /// session.
    pub fn connect_with_tls(
        &self,
        host: Host,
        observer: Arc<dyn ConnectionObserver>,
        tls: Option<Box<dyn TlsSession>>,
    ) -> ConnectionHandle {
        let loop_index = self.next_loop.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let slot = &self.loops[loop_index];

        let (connection, handle) = Connection::new(
            id,
            loop_index,
            host,
            self.config.connection.clone(),
            observer,
            tls,
            slot.terminated.clone(),
        );
        let _ = slot.control.send(LoopControl::Register(handle.clone()));
        slot.runtime.spawn(connection.run());
        handle
    }

    /// Submit a request for `connection` through its loop's queue.
    pub fn submit(
        &self,
        connection: &ConnectionHandle,
        request: Request,
    ) -> DriverResult<ResponseFuture> {
        self.manager.submit(connection, request)
    }

    /// The per-loop queue director.
    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    pub fn num_event_loops(&self) -> usize {
        self.loops.len()
    }

    /// Close every queue, ask every connection to disconnect, and join
    /// the loop threads.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if self.loops.iter().all(|slot| slot.thread.is_none()) {
            return;
        }
        self.manager.close_all();
        for slot in &self.loops {
            let _ = slot.control.send(LoopControl::Shutdown);
        }
        for slot in &mut self.loops {
            if let Some(thread) = slot.thread.take() {
                if thread.join().is_err() {
                    error!("event loop thread panicked during shutdown");
                }
            }
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
