// ABOUTME: Fixed-capacity stream-id table mapping protocol stream ids to pending requests
// ABOUTME: Allocates the lowest free id via a bitmap; release is O(1) and double-release is an error

use crate::error::{DriverError, DriverResult};

/// Protocol limit on concurrently allocated stream ids. Stream ids are a
/// signed byte on the wire and negative values belong to the server, so a
/// connection can never have more than 128 requests in flight.
pub const MAX_STREAMS: usize = 128;

/// Fixed-capacity mapping from stream id to a pending-request handle.
///
/// Accessed only from the connection's owning event-loop thread, so there
/// is no internal locking. Allocation always picks the lowest free id,
/// which keeps ids dense and makes reuse after release deterministic.
pub struct StreamTable<T> {
    slots: Vec<Option<T>>,
    // Bit i set = stream id i is free. Bits at or above `capacity` stay
    // zero.
    free: u128,
    capacity: usize,
}

impl<T> StreamTable<T> {
    /// A table handing out ids `0..capacity`, `capacity` clamped to
    /// [1, 128].
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_STREAMS);
        let free = if capacity == MAX_STREAMS {
            u128::MAX
        } else {
            (1u128 << capacity) - 1
        };
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            free,
            capacity,
        }
    }

    /// Reserve the lowest free id and associate `request` with it.
    ///
    /// When the table is saturated the request is handed back so the
    /// caller can fail it with `NoStreamsAvailable`.
    pub fn set_stream(&mut self, request: T) -> Result<i8, T> {
        if self.free == 0 {
            return Err(request);
        }
        let id = self.free.trailing_zeros() as usize;
        self.free &= !(1u128 << id);
        self.slots[id] = Some(request);
        Ok(id as i8)
    }

    /// Take the pending request for `id`, releasing the slot for reuse.
    ///
    /// Unknown, negative, or already-released ids are an error; a slot is
    /// never released twice.
    pub fn get_stream(&mut self, id: i8) -> DriverResult<T> {
        if id < 0 || id as usize >= self.capacity {
            return Err(DriverError::InvalidStream(id));
        }
        let index = id as usize;
        match self.slots[index].take() {
            Some(request) => {
                self.free |= 1u128 << index;
                Ok(request)
            }
            None => Err(DriverError::InvalidStream(id)),
        }
    }

    /// Count of ids currently free for allocation.
    pub fn available_streams(&self) -> usize {
        self.free.count_ones() as usize
    }

    /// Count of ids tied to pending requests.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available_streams()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Release every live slot, returning the pending requests in id
    /// order. Used when the connection goes down to fail everything that
    /// is still in flight.
    pub fn drain(&mut self) -> Vec<T> {
        let mut pending = Vec::with_capacity(self.in_flight());
        for index in 0..self.capacity {
            if let Some(request) = self.slots[index].take() {
                self.free |= 1u128 << index;
                pending.push(request);
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_id_first() {
        let mut table = StreamTable::new(MAX_STREAMS);
        assert_eq!(table.set_stream("a").unwrap(), 0);
        assert_eq!(table.set_stream("b").unwrap(), 1);
        assert_eq!(table.set_stream("c").unwrap(), 2);

        assert_eq!(table.get_stream(1).unwrap(), "b");
        // Released slot is the new lowest and gets reused.
        assert_eq!(table.set_stream("d").unwrap(), 1);
        assert_eq!(table.set_stream("e").unwrap(), 3);
    }

    #[test]
    fn available_plus_in_flight_is_capacity() {
        let mut table = StreamTable::new(MAX_STREAMS);
        assert_eq!(table.available_streams(), MAX_STREAMS);
        for i in 0..10 {
            table.set_stream(i).unwrap();
            assert_eq!(table.available_streams() + table.in_flight(), MAX_STREAMS);
        }
        table.get_stream(4).unwrap();
        assert_eq!(table.available_streams(), MAX_STREAMS - 9);
        assert_eq!(table.available_streams() + table.in_flight(), MAX_STREAMS);
    }

    #[test]
    fn exhaustion_and_reuse() {
        let mut table = StreamTable::new(MAX_STREAMS);
        for i in 0..MAX_STREAMS {
            assert_eq!(table.set_stream(i).unwrap(), i as i8);
        }
        assert!(table.set_stream(999).is_err());
        assert_eq!(table.available_streams(), 0);

        assert_eq!(table.get_stream(0).unwrap(), 0);
        assert_eq!(table.set_stream(1000).unwrap(), 0);
        assert!(table.set_stream(1001).is_err());
    }

    #[test]
    fn double_release_is_an_error() {
        let mut table = StreamTable::new(8);
        let id = table.set_stream(()).unwrap();
        table.get_stream(id).unwrap();
        assert!(matches!(
            table.get_stream(id),
            Err(DriverError::InvalidStream(_))
        ));
    }

    #[test]
    fn negative_and_out_of_range_ids_are_rejected() {
        let mut table = StreamTable::<()>::new(8);
        assert!(matches!(
            table.get_stream(-1),
            Err(DriverError::InvalidStream(-1))
        ));
        assert!(matches!(
            table.get_stream(8),
            Err(DriverError::InvalidStream(8))
        ));
    }

    #[test]
    fn drain_returns_all_pending_in_id_order() {
        let mut table = StreamTable::new(16);
        for i in 0..5 {
            table.set_stream(i).unwrap();
        }
        table.get_stream(2).unwrap();
        let pending = table.drain();
        assert_eq!(pending, vec![0, 1, 3, 4]);
        assert!(table.is_empty());
        assert_eq!(table.available_streams(), 16);
    }

    #[test]
    fn small_capacity_table() {
        let mut table = StreamTable::new(2);
        assert_eq!(table.set_stream('x').unwrap(), 0);
        assert_eq!(table.set_stream('y').unwrap(), 1);
        assert!(table.set_stream('z').is_err());
    }
}
