//! Cycle-deadline callback scheduler.
//!
//! Each logical entry is identified by `(slot, tag)`: re-scheduling the same
//! pair replaces the previous deadline, cancelling an unknown pair is a
//! no-op. The heap itself never holds a device, only its slot index; when an
//! entry comes due the bus dispatches `Device::tick` on the owning device.
//!
//! Replaced and cancelled entries stay in the heap and are discarded lazily
//! at pop time: the live map holds the sequence number of the one heap entry
//! that is still current for its key. Ties at the same deadline pop in
//! insertion order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: u64,
    seq: u64,
    slot: u8,
    tag: String,
}

#[derive(Default)]
pub struct Scheduler {
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<(u8, String), u64>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_at(&mut self, slot: u8, tag: &str, deadline: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert((slot, tag.to_string()), seq);
        self.heap.push(Reverse(Entry {
            deadline,
            seq,
            slot,
            tag: tag.to_string(),
        }));
    }

    pub fn cancel(&mut self, slot: u8, tag: &str) {
        self.live.remove(&(slot, tag.to_string()));
    }

    pub fn cancel_all_for(&mut self, slot: u8) {
        self.live.retain(|(s, _), _| *s != slot);
    }

    pub fn is_scheduled(&self, slot: u8, tag: &str) -> bool {
        self.live.contains_key(&(slot, tag.to_string()))
    }

    fn peek_is_stale(&self, entry: &Entry) -> bool {
        self.live
            .get(&(entry.slot, entry.tag.clone()))
            .map_or(true, |&seq| seq != entry.seq)
    }

    /// Deadline of the earliest live entry, discarding stale heap entries on
    /// the way. Used by the loop to size the next quantum.
    pub fn earliest_deadline(&mut self) -> Option<u64> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.peek_is_stale(entry) {
                self.heap.pop();
                continue;
            }
            return Some(entry.deadline);
        }
        None
    }

    /// Pop the next live entry with `deadline <= now`, retiring it from the
    /// live map. Entries come out in non-decreasing deadline order.
    pub fn pop_due(&mut self, now: u64) -> Option<(u8, String)> {
        loop {
            let Reverse(entry) = self.heap.peek()?;
            if self.peek_is_stale(entry) {
                self.heap.pop();
                continue;
            }
            if entry.deadline > now {
                return None;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked");
            self.live.remove(&(entry.slot, entry.tag.clone()));
            return Some((entry.slot, entry.tag));
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }
}
