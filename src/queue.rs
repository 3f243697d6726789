// ABOUTME: Bounded MPMC request queue with coalesced wakeups toward the owning event loop
// ABOUTME: Producers on any thread push (connection, request) items; the loop drains them in flush cycles

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

use crate::connection::{ConnectionHandle, Request, ResponseFuture, ResponseSender};
use crate::error::DriverError;

/// A queued unit of work: which connection to execute on, the request,
/// and the sender half of the caller's future.
pub struct RequestItem {
    connection: ConnectionHandle,
    request: Request,
    tx: ResponseSender,
}

impl RequestItem {
    /// Build an item together with the future the caller keeps.
    pub fn new(connection: ConnectionHandle, request: Request) -> (Self, ResponseFuture) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (
            Self {
                connection,
                request,
                tx,
            },
            rx,
        )
    }

    pub(crate) fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub(crate) fn into_parts(self) -> (Request, ResponseSender) {
        (self.request, self.tx)
    }

    /// Resolve the caller's future with `error`.
    pub(crate) fn fail(self, error: DriverError) {
        let _ = self.tx.send(Err(error));
    }
}

impl fmt::Debug for RequestItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestItem")
            .field("connection", &self.connection)
            .field("opcode", &self.request.opcode)
            .finish()
    }
}

/// Thread-safe bounded queue feeding one event loop.
///
/// Any thread may [`write`](RequestQueue::write); only the owning loop
/// drains. Wakeups are coalesced: whichever producer flips `is_flushing`
/// from `false` to `true` wins the right to signal, so between two
/// consecutive flushes at most one wakeup reaches the loop. The loop
/// releases the flag when a flush cycle ends (or keeps it through the
/// back-off window, absorbing bursts without per-item signals).
pub struct RequestQueue {
    ring: ArrayQueue<RequestItem>,
    is_flushing: AtomicBool,
    is_closing: AtomicBool,
    wakeup: Notify,
    signals: AtomicU64,
    rejected: AtomicU64,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.next_power_of_two()),
            is_flushing: AtomicBool::new(false),
            is_closing: AtomicBool::new(false),
            wakeup: Notify::new(),
            signals: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Enqueue an item and make sure a flush is scheduled.
    ///
    /// Returns the item back when the ring is full or the queue is
    /// closing, so the caller can apply backpressure without losing the
    /// future's sender.
    pub fn write(&self, item: RequestItem) -> Result<(), RequestItem> {
        if self.is_closing.load(Ordering::Acquire) {
            return Err(item);
        }
        if let Err(item) = self.ring.push(item) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(item);
        }
        // If a flush is already in flight it will drain this item; only
        // the producer that claims the flag signals the loop.
        if self.claim_flush() {
            self.signal_wakeup();
        }
        Ok(())
    }

    /// Refuse further enqueues and wake the loop so it can tear down its
    /// wakeup and timer handles.
    pub fn close_handles(&self) {
        if !self.is_closing.swap(true, Ordering::AcqRel) {
            self.wakeup.notify_one();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.is_closing.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Total wakeup signals issued since creation.
    pub fn wakeups_signaled(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }

    /// Writes refused because the ring was at capacity.
    pub fn rejected_writes(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Claim the right to signal; true when `is_flushing` went
    /// false -> true.
    pub(crate) fn claim_flush(&self) -> bool {
        self.is_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// End of a flush cycle: producers may claim the signal right again.
    pub(crate) fn release_flush(&self) {
        self.is_flushing.store(false, Ordering::Release);
    }

    pub(crate) fn signal_wakeup(&self) {
        self.signals.fetch_add(1, Ordering::Relaxed);
        self.wakeup.notify_one();
    }

    /// Await the next coalesced wakeup. Loop side only.
    pub(crate) async fn notified(&self) {
        self.wakeup.notified().await;
    }

    /// Dequeue one item. Loop side only.
    pub(crate) fn pop(&self) -> Option<RequestItem> {
        self.ring.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Consistency, query_body};

    fn item_for(query: &str) -> (RequestItem, ResponseFuture) {
        RequestItem::new(
            crate::connection::test_support::dummy_handle(0),
            Request::query(query, Consistency::One),
        )
    }

    fn item() -> (RequestItem, ResponseFuture) {
        item_for("SELECT 1")
    }

    #[test]
    fn writes_drain_in_fifo_order() {
        let queue = RequestQueue::new(8);
        let mut futures = Vec::new();
        for text in ["q0", "q1", "q2"] {
            let (item, future) = item_for(text);
            queue.write(item).unwrap();
            futures.push(future);
        }
        assert_eq!(queue.len(), 3);

        for text in ["q0", "q1", "q2"] {
            let (request, _tx) = queue.pop().unwrap().into_parts();
            assert_eq!(request.body, query_body(text, Consistency::One));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn full_ring_returns_item_to_caller() {
        let queue = RequestQueue::new(2);
        let (a, _fa) = item();
        let (b, _fb) = item();
        let (c, _fc) = item();
        queue.write(a).unwrap();
        queue.write(b).unwrap();
        assert!(queue.write(c).is_err());
        assert_eq!(queue.rejected_writes(), 1);
    }

    #[test]
    fn signals_coalesce_while_flush_in_flight() {
        let queue = RequestQueue::new(16);
        for _ in 0..10 {
            let (i, _f) = item();
            queue.write(i).unwrap();
        }
        // First write claimed the flag; the other nine saw it set.
        assert_eq!(queue.wakeups_signaled(), 1);

        while queue.pop().is_some() {}
        queue.release_flush();

        let (i, _f) = item();
        queue.write(i).unwrap();
        assert_eq!(queue.wakeups_signaled(), 2);
    }

    #[test]
    fn closing_queue_refuses_writes() {
        let queue = RequestQueue::new(4);
        queue.close_handles();
        assert!(queue.is_closing());
        let (i, _f) = item();
        assert!(queue.write(i).is_err());
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let queue = RequestQueue::new(100);
        assert_eq!(queue.capacity(), 128);
    }
}
