//! Reserve/commit/consume bookkeeping over a fixed-size ring.
//!
//! Counters are monotonic, so `read <= write <= current` always holds and
//! positions are recovered modulo the ring size. Bytes (or query slots)
//! between `read` and `current` are live and must not be handed out again.

#[derive(Clone, Debug)]
pub struct RingControl {
    size: u64,
    current: u64,
    write: u64,
    read: u64,
}

impl RingControl {
    pub fn new(size: u64) -> Self {
        assert_ne!(size, 0, "ring of zero size");
        Self {
            size,
            current: 0,
            write: 0,
            read: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Space that can still be reserved.
    pub fn available(&self) -> u64 {
        self.size - (self.current - self.read)
    }

    /// Reserved but not yet committed.
    pub fn num_reserved(&self) -> u64 {
        self.current - self.write
    }

    /// Committed but not yet consumed.
    pub fn num_committed(&self) -> u64 {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.current
    }

    /// Reserves up to `count` units and returns how many were reserved.
    /// With `must_fit` set, either all of `count` or nothing is reserved.
    pub fn reserve(&mut self, count: u64, must_fit: bool) -> u64 {
        let available = self.available();
        let count = if must_fit && available < count {
            0
        } else {
            count.min(available)
        };
        self.current += count;
        count
    }

    pub fn commit(&mut self, count: u64) {
        debug_assert!(self.write + count <= self.current, "commit past reserve");
        self.write = (self.write + count).min(self.current);
    }

    pub fn consume(&mut self, count: u64) {
        debug_assert!(self.read + count <= self.write, "consume past commit");
        self.read = (self.read + count).min(self.write);
    }

    /// Rewinds an empty ring to position 0.
    pub fn reset(&mut self) {
        debug_assert!(self.is_empty(), "reset of a ring with live units");
        if self.is_empty() {
            self.current = 0;
            self.write = 0;
            self.read = 0;
        }
    }

    /// Ring position of the next reservation.
    pub fn current_index(&self) -> u64 {
        self.current % self.size
    }

    /// Ring position of the oldest committed unit.
    pub fn read_index(&self) -> u64 {
        self.read % self.size
    }

    /// Ring position one past the last committed unit.
    pub fn write_index(&self) -> u64 {
        self.write % self.size
    }
}
