// ABOUTME: Directs request submissions to the queue owned by the target connection's event loop
// ABOUTME: Holds one queue per loop in dense storage sized once at driver start

use std::sync::Arc;

use crate::connection::{ConnectionHandle, Request, ResponseFuture};
use crate::error::{DriverError, DriverResult};
use crate::queue::{RequestItem, RequestQueue};

/// Process-wide director of per-loop request queues.
///
/// Allocated once when the event-loop group starts and torn down with
/// it; the queue storage is dense, indexed by loop, and never resized.
pub struct QueueManager {
    queues: Vec<Arc<RequestQueue>>,
}

impl QueueManager {
    pub(crate) fn new(num_loops: usize, queue_capacity: usize) -> Self {
        let queues = (0..num_loops.max(1))
            .map(|_| Arc::new(RequestQueue::new(queue_capacity)))
            .collect();
        Self { queues }
    }

    /// The queue owned by the given event loop. O(1); loop indexes come
    /// from connection handles and are always in range.
    pub fn get(&self, loop_index: usize) -> &Arc<RequestQueue> {
        &self.queues[loop_index]
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    /// Route a request to the queue of the loop owning `connection` and
    /// hand back the response future.
    ///
    /// `Err(QueueFull)` applies backpressure; nothing was enqueued and no
    /// wakeup was signalled.
    pub fn submit(
        &self,
        connection: &ConnectionHandle,
        request: Request,
    ) -> DriverResult<ResponseFuture> {
        let queue = self.get(connection.loop_index());
        let (item, future) = RequestItem::new(connection.clone(), request);
        match queue.write(item) {
            Ok(()) => Ok(future),
            Err(_) => Err(DriverError::QueueFull),
        }
    }

    /// Propagate close to every queue.
    pub fn close_all(&self) {
        for queue in &self.queues {
            queue.close_handles();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Consistency;

    #[test]
    fn one_queue_per_loop() {
        let manager = QueueManager::new(4, 64);
        assert_eq!(manager.num_queues(), 4);
        for index in 0..4 {
            assert_eq!(manager.get(index).capacity(), 64);
        }
    }

    #[test]
    fn submit_routes_by_loop_index() {
        let manager = QueueManager::new(3, 16);
        let handle = crate::connection::test_support::dummy_handle(2);
        manager
            .submit(&handle, Request::query("SELECT 1", Consistency::One))
            .unwrap();
        assert_eq!(manager.get(0).len(), 0);
        assert_eq!(manager.get(1).len(), 0);
        assert_eq!(manager.get(2).len(), 1);
    }

    #[test]
    fn full_queue_is_backpressure() {
        let manager = QueueManager::new(1, 2);
        let handle = crate::connection::test_support::dummy_handle(0);
        let request = || Request::query("SELECT 1", Consistency::One);
        manager.submit(&handle, request()).unwrap();
        manager.submit(&handle, request()).unwrap();
        assert!(matches!(
            manager.submit(&handle, request()),
            Err(DriverError::QueueFull)
        ));
    }

    #[test]
    fn close_propagates_to_all_queues() {
        let manager = QueueManager::new(2, 8);
        manager.close_all();
        assert!(manager.get(0).is_closing());
        assert!(manager.get(1).is_closing());
    }
}
