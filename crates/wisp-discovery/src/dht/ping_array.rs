//! Request correlation arena.
//!
//! A fixed number of slots, reused in ring order. Each request id encodes
//! its slot index, the slot's generation at the time of issue, and 32
//! random bits:
//!
//! ```text
//! id = random(32) << 32 | generation(16) << 16 | slot(16)
//! ```
//!
//! A reply is honoured only if the whole id matches the slot's current
//! occupant and the entry has not expired, so a reply for an overwritten
//! slot, a guessed id, or a late reply is rejected.

use std::time::{Duration, Instant};
use wisp_crypto::constant_time::verify_u64;
use wisp_crypto::random::random_u32;

/// Largest supported capacity (slot index fits in 16 bits)
pub const MAX_CAPACITY: usize = 1 << 16;

#[derive(Debug)]
struct Entry<T> {
    id: u64,
    issued: Instant,
    data: T,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u16,
    entry: Option<Entry<T>>,
}

/// Fixed-capacity request arena with generation counters
#[derive(Debug)]
pub struct PingArray<T> {
    slots: Vec<Slot<T>>,
    timeout: Duration,
    next: usize,
    len: usize,
}

impl<T> PingArray<T> {
    /// Create an arena with `capacity` slots (clamped to `1..=MAX_CAPACITY`)
    #[must_use]
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect();
        Self {
            slots,
            timeout,
            next: 0,
            len: 0,
        }
    }

    /// Entry lifetime
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Live entries (including expired ones not yet collected)
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// No live entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `data` and return the id to send with the request.
    ///
    /// When every slot is busy the oldest entry is overwritten; use
    /// [`PingArray::add_evicting`] when the loss matters.
    pub fn add(&mut self, data: T, now: Instant) -> u64 {
        self.add_evicting(data, now).0
    }

    /// Like [`PingArray::add`], also handing back the entry whose slot was
    /// reused, if it was still pending
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_evicting(&mut self, data: T, now: Instant) -> (u64, Option<T>) {
        let index = self.next;
        self.next = (self.next + 1) % self.slots.len();

        let slot = &mut self.slots[index];
        let evicted = slot.entry.take().map(|e| e.data);
        if evicted.is_some() {
            self.len -= 1;
        }
        slot.generation = slot.generation.wrapping_add(1);

        let id = (u64::from(random_u32()) << 32)
            | (u64::from(slot.generation) << 16)
            | (index as u64 & 0xffff);
        slot.entry = Some(Entry {
            id,
            issued: now,
            data,
        });
        self.len += 1;
        (id, evicted)
    }

    /// Claim the entry for `id`.
    ///
    /// Returns `None` for unknown, stale or expired ids. A matched entry is
    /// removed, so a replayed reply finds nothing.
    #[allow(clippy::cast_possible_truncation)]
    pub fn check(&mut self, id: u64, now: Instant) -> Option<T> {
        let index = (id & 0xffff) as usize;
        let timeout = self.timeout;
        let slot = self.slots.get_mut(index)?;

        let matches = slot
            .entry
            .as_ref()
            .is_some_and(|e| verify_u64(e.id, id) && now.saturating_duration_since(e.issued) < timeout);
        if !matches {
            return None;
        }

        self.len -= 1;
        slot.entry.take().map(|e| e.data)
    }

    /// Peek at the entry for `id` without claiming it
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&T> {
        let slot = self.slots.get((id & 0xffff) as usize)?;
        slot.entry
            .as_ref()
            .filter(|e| verify_u64(e.id, id))
            .map(|e| &e.data)
    }

    /// Remove and return every expired entry
    pub fn expire(&mut self, now: Instant) -> Vec<T> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        for slot in &mut self.slots {
            let is_expired = slot
                .entry
                .as_ref()
                .is_some_and(|e| now.saturating_duration_since(e.issued) >= timeout);
            if is_expired {
                if let Some(entry) = slot.entry.take() {
                    expired.push(entry.data);
                }
            }
        }
        self.len -= expired.len();
        expired
    }

    /// Drop entries matching a predicate (used when their owner goes away)
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        for slot in &mut self.slots {
            if slot.entry.as_ref().is_some_and(|e| !keep(&e.data)) {
                slot.entry = None;
                self.len -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_add_check() {
        let now = Instant::now();
        let mut array = PingArray::new(8, TIMEOUT);
        let id = array.add("alice", now);

        assert_eq!(array.len(), 1);
        assert_eq!(array.check(id, now), Some("alice"));
        assert!(array.is_empty());
    }

    #[test]
    fn test_replayed_reply_rejected() {
        let now = Instant::now();
        let mut array = PingArray::new(8, TIMEOUT);
        let id = array.add(1u32, now);

        assert!(array.check(id, now).is_some());
        assert!(array.check(id, now).is_none());
    }

    #[test]
    fn test_guessed_id_rejected() {
        let now = Instant::now();
        let mut array = PingArray::new(8, TIMEOUT);
        let id = array.add(1u32, now);

        // Same slot and generation, different random bits
        let forged = id ^ (1 << 40);
        assert!(array.check(forged, now).is_none());
        assert!(array.check(id, now).is_some());
    }

    #[test]
    fn test_late_reply_rejected() {
        let now = Instant::now();
        let mut array = PingArray::new(8, TIMEOUT);
        let id = array.add(1u32, now);

        assert!(array.check(id, now + TIMEOUT).is_none());
        assert_eq!(array.expire(now + TIMEOUT), vec![1]);
        assert!(array.is_empty());
    }

    #[test]
    fn test_reused_slot_invalidates_old_id() {
        let now = Instant::now();
        let mut array = PingArray::new(2, TIMEOUT);
        let first = array.add('a', now);
        array.add('b', now);
        // Wraps around and overwrites slot 0
        let third = array.add('c', now);

        assert_eq!(first & 0xffff, third & 0xffff);
        assert_ne!((first >> 16) & 0xffff, (third >> 16) & 0xffff);
        assert!(array.check(first, now).is_none());
        assert_eq!(array.check(third, now), Some('c'));
        assert_eq!(array.len(), 1);
    }

    #[test]
    fn test_full_arena_hands_back_evicted() {
        let now = Instant::now();
        let mut array = PingArray::new(2, TIMEOUT);
        assert_eq!(array.add_evicting('a', now).1, None);
        let second = array.add('b', now);
        assert!(array.check(second, now).is_some());

        let (_, evicted) = array.add_evicting('c', now);
        assert_eq!(evicted, Some('a'));
        // Slot 1 was already claimed
        assert_eq!(array.add_evicting('d', now).1, None);
        assert_eq!(array.len(), 2);
    }

    #[test]
    fn test_out_of_range_index() {
        let now = Instant::now();
        let mut array: PingArray<u8> = PingArray::new(4, TIMEOUT);
        assert!(array.check(0xffff, now).is_none());
    }

    #[test]
    fn test_expire_keeps_fresh_entries() {
        let now = Instant::now();
        let mut array = PingArray::new(8, TIMEOUT);
        array.add(1u32, now);
        let fresh = array.add(2u32, now + Duration::from_secs(3));

        assert_eq!(array.expire(now + TIMEOUT), vec![1]);
        assert_eq!(array.get(fresh), Some(&2));
    }

    #[test]
    fn test_retain() {
        let now = Instant::now();
        let mut array = PingArray::new(8, TIMEOUT);
        let keep = array.add(1u32, now);
        let drop_id = array.add(2u32, now);

        array.retain(|v| *v != 2);
        assert!(array.get(drop_id).is_none());
        assert!(array.get(keep).is_some());
        assert_eq!(array.len(), 1);
    }
}
