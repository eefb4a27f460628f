//! Send and reorder buffers indexed by packet number.
//!
//! Both buffers are windows over the `u32` packet number space starting at
//! `start`; numbers wrap, so all comparisons are done on offsets from the
//! start.

use std::collections::VecDeque;
use std::time::Instant;

/// A lossless packet waiting for acknowledgement
#[derive(Debug, Clone)]
pub struct SendSlot {
    /// `packet_id || body`
    pub data: Vec<u8>,
    /// First transmission, `None` while queued behind the window
    pub first_sent: Option<Instant>,
    /// Latest transmission
    pub last_sent: Option<Instant>,
    /// Times resent
    pub retransmits: u32,
    /// Peer asked for this packet again
    pub requested: bool,
}

impl SendSlot {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            first_sent: None,
            last_sent: None,
            retransmits: 0,
            requested: false,
        }
    }
}

/// Outgoing lossless packets from `start` (oldest unacknowledged) to `end`
#[derive(Debug, Clone)]
pub struct SendBuffer {
    start: u32,
    slots: VecDeque<SendSlot>,
    capacity: usize,
}

impl SendBuffer {
    /// Empty buffer holding at most `capacity` packets
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            slots: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Oldest unacknowledged packet number
    #[must_use]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Number the next packet will get
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn end(&self) -> u32 {
        self.start.wrapping_add(self.slots.len() as u32)
    }

    /// Packets held
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether another packet fits
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Queue a packet and return its number, or `None` when full
    pub fn push(&mut self, data: Vec<u8>) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let number = self.end();
        self.slots.push_back(SendSlot::new(data));
        Some(number)
    }

    fn offset(&self, number: u32) -> Option<usize> {
        let offset = number.wrapping_sub(self.start) as usize;
        (offset < self.slots.len()).then_some(offset)
    }

    /// Slot for `number` if still held
    #[must_use]
    pub fn get(&self, number: u32) -> Option<&SendSlot> {
        self.offset(number).map(|i| &self.slots[i])
    }

    /// Mutable slot for `number` if still held
    pub fn get_mut(&mut self, number: u32) -> Option<&mut SendSlot> {
        self.offset(number).map(|i| &mut self.slots[i])
    }

    /// Whether `upto` is a valid acknowledgement point (`start..=end`)
    #[must_use]
    pub fn can_ack(&self, upto: u32) -> bool {
        upto.wrapping_sub(self.start) as usize <= self.slots.len()
    }

    /// Drop every packet below `upto` and return them.
    ///
    /// Callers check [`can_ack`](Self::can_ack) first; an invalid point
    /// acknowledges nothing.
    pub fn ack(&mut self, upto: u32) -> Vec<(u32, SendSlot)> {
        if !self.can_ack(upto) {
            return Vec::new();
        }
        let count = upto.wrapping_sub(self.start) as usize;
        let mut acked = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(slot) = self.slots.pop_front() {
                acked.push((self.start, slot));
                self.start = self.start.wrapping_add(1);
            }
        }
        acked
    }

    /// Iterate `(number, slot)` oldest first
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut SendSlot)> {
        let start = self.start;
        self.slots
            .iter_mut()
            .enumerate()
            .map(move |(i, slot)| (start.wrapping_add(i as u32), slot))
    }

    /// Discard everything
    pub fn clear(&mut self) {
        self.start = self.end();
        self.slots.clear();
    }
}

/// Result of inserting into the reorder buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// Stored (possibly already deliverable)
    Stored,
    /// Below the delivery point or already held
    Duplicate,
    /// Beyond the reorder window
    TooFar,
}

/// Incoming lossless packets waiting for the gap before them to fill
#[derive(Debug, Clone)]
pub struct RecvBuffer {
    /// Next packet number to deliver
    start: u32,
    slots: VecDeque<Option<Vec<u8>>>,
    capacity: usize,
}

impl RecvBuffer {
    /// Empty buffer accepting numbers in `start..start + capacity`
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            slots: VecDeque::new(),
            capacity,
        }
    }

    /// Next number to deliver; everything below it was received
    #[must_use]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Reorder window size
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Packets held out of order
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Store packet `number`
    pub fn insert(&mut self, number: u32, data: Vec<u8>) -> Inserted {
        let offset = number.wrapping_sub(self.start) as usize;
        if offset >= self.capacity {
            // Numbers just below start wrap to huge offsets
            return if number.wrapping_sub(self.start) > u32::MAX / 2 {
                Inserted::Duplicate
            } else {
                Inserted::TooFar
            };
        }
        if offset >= self.slots.len() {
            self.slots.resize(offset + 1, None);
        }
        if self.slots[offset].is_some() {
            return Inserted::Duplicate;
        }
        self.slots[offset] = Some(data);
        Inserted::Stored
    }

    /// Next in-order packet, if it has arrived
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        match self.slots.front() {
            Some(Some(_)) => {
                self.start = self.start.wrapping_add(1);
                self.slots.pop_front().flatten()
            }
            _ => None,
        }
    }

    /// Numbers missing between `start` and the highest buffered packet
    #[must_use]
    pub fn missing(&self) -> Vec<u32> {
        let Some(last) = self.slots.iter().rposition(Option::is_some) else {
            return Vec::new();
        };
        self.slots
            .iter()
            .take(last)
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| self.start.wrapping_add(i as u32))
            .collect()
    }

    /// Discard everything
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
