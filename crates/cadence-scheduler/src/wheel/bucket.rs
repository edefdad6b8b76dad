//! One wheel slot: a doubly linked list of entries stored in a slab.
//!
//! Links are slot indices instead of pointers. Freed slots go on a freelist
//! and are reused, so insert and unlink stay O(1) without reallocating per
//! task. Only the worker thread touches a bucket.

use super::task::TimerEntry;

struct Node {
    entry: TimerEntry,
    /// Full wheel revolutions left before the entry is due.
    remaining_rounds: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

enum Slot {
    Occupied(Node),
    Vacant { next_free: Option<usize> },
}

#[derive(Default)]
pub(crate) struct WheelBucket {
    slots: Vec<Slot>,
    free: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl WheelBucket {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&TimerEntry> {
        match self.slots.get(slot) {
            Some(Slot::Occupied(node)) => Some(&node.entry),
            _ => None,
        }
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node> {
        match self.slots.get_mut(slot) {
            Some(Slot::Occupied(node)) => Some(node),
            _ => None,
        }
    }

    /// Append at the tail; returns the slot the entry now occupies.
    pub(crate) fn push_back(&mut self, entry: TimerEntry, remaining_rounds: u64) -> usize {
        let node = Node {
            entry,
            remaining_rounds,
            prev: self.tail,
            next: None,
        };

        let slot = match self.free {
            Some(i) => {
                self.free = match &self.slots[i] {
                    Slot::Vacant { next_free } => *next_free,
                    Slot::Occupied(_) => None,
                };
                self.slots[i] = Slot::Occupied(node);
                i
            }
            None => {
                self.slots.push(Slot::Occupied(node));
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(t) => {
                if let Some(tail) = self.node_mut(t) {
                    tail.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        slot
    }

    /// Unlink the entry at `slot` and return it.
    pub(crate) fn remove(&mut self, slot: usize) -> Option<TimerEntry> {
        let free = self.free;
        let vacated = match self.slots.get_mut(slot) {
            Some(s) if matches!(s, Slot::Occupied(_)) => {
                std::mem::replace(s, Slot::Vacant { next_free: free })
            }
            _ => return None,
        };
        let Slot::Occupied(node) = vacated else {
            return None;
        };
        self.free = Some(slot);

        match node.prev {
            Some(p) => {
                if let Some(prev) = self.node_mut(p) {
                    prev.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => {
                if let Some(next) = self.node_mut(n) {
                    next.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.len -= 1;
        Some(node.entry)
    }

    /// Swap the entry at `slot` in place, keeping its position and rounds.
    ///
    /// Returns the displaced entry, or gives `entry` back if `slot` is empty.
    pub(crate) fn replace(
        &mut self,
        slot: usize,
        entry: TimerEntry,
    ) -> std::result::Result<TimerEntry, TimerEntry> {
        match self.node_mut(slot) {
            Some(node) => Ok(std::mem::replace(&mut node.entry, entry)),
            None => Err(entry),
        }
    }

    /// Walk the list once for the current tick.
    ///
    /// Entries with no rounds left, and cancelled entries, are unlinked and
    /// handed to `on_removed` in FIFO order together with their old slot.
    /// Every other entry loses one round.
    pub(crate) fn expire(&mut self, mut on_removed: impl FnMut(usize, TimerEntry)) {
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let Some(node) = self.node_mut(slot) else {
                break;
            };
            cursor = node.next;
            if node.remaining_rounds == 0 || node.entry.is_cancelled() {
                if let Some(entry) = self.remove(slot) {
                    on_removed(slot, entry);
                }
            } else {
                node.remaining_rounds -= 1;
            }
        }
    }

    /// Drop every entry without running it; returns how many were dropped.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.slots.clear();
        self.free = None;
        self.head = None;
        self.tail = None;
        self.len = 0;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::super::task::test_entry;
    use super::*;

    fn ids_in_order(bucket: &mut WheelBucket) -> Vec<u64> {
        let mut ids = Vec::new();
        bucket.expire(|_, e| ids.push(e.handle.id()));
        ids
    }

    #[test]
    fn expire_is_fifo() {
        let mut bucket = WheelBucket::new();
        for id in 0..5 {
            bucket.push_back(test_entry(id, 0), 0);
        }
        assert_eq!(ids_in_order(&mut bucket), vec![0, 1, 2, 3, 4]);
        assert_eq!(bucket.len(), 0);
    }

    #[test]
    fn remove_relinks_head_middle_and_tail() {
        let mut bucket = WheelBucket::new();
        let slots: Vec<usize> = (0..5).map(|id| bucket.push_back(test_entry(id, 0), 0)).collect();

        assert_eq!(bucket.remove(slots[0]).map(|e| e.handle.id()), Some(0));
        assert_eq!(bucket.remove(slots[2]).map(|e| e.handle.id()), Some(2));
        assert_eq!(bucket.remove(slots[4]).map(|e| e.handle.id()), Some(4));
        assert!(bucket.remove(slots[4]).is_none());
        assert_eq!(bucket.len(), 2);

        assert_eq!(ids_in_order(&mut bucket), vec![1, 3]);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut bucket = WheelBucket::new();
        let a = bucket.push_back(test_entry(1, 0), 0);
        let _b = bucket.push_back(test_entry(2, 0), 0);
        bucket.remove(a);
        let c = bucket.push_back(test_entry(3, 0), 0);
        assert_eq!(a, c);
        // Reused slot is linked at the tail, not where it used to be.
        assert_eq!(ids_in_order(&mut bucket), vec![2, 3]);
    }

    #[test]
    fn rounds_count_down_before_expiry() {
        let mut bucket = WheelBucket::new();
        bucket.push_back(test_entry(1, 0), 2);
        bucket.push_back(test_entry(2, 0), 0);

        assert_eq!(ids_in_order(&mut bucket), vec![2]);
        assert!(ids_in_order(&mut bucket).is_empty());
        assert_eq!(ids_in_order(&mut bucket), vec![1]);
    }

    #[test]
    fn cancelled_entries_leave_early() {
        let mut bucket = WheelBucket::new();
        let slot = bucket.push_back(test_entry(1, 0), 10);
        assert!(bucket.get(slot).map(|e| e.handle.cancel()).unwrap_or(false));
        assert_eq!(ids_in_order(&mut bucket), vec![1]);
    }

    #[test]
    fn replace_keeps_position() {
        let mut bucket = WheelBucket::new();
        bucket.push_back(test_entry(1, 0), 0);
        let slot = bucket.push_back(test_entry(2, 0), 0);
        bucket.push_back(test_entry(3, 0), 0);

        let old = bucket.replace(slot, test_entry(20, 0)).ok().map(|e| e.handle.id());
        assert_eq!(old, Some(2));
        assert_eq!(ids_in_order(&mut bucket), vec![1, 20, 3]);
        assert!(bucket.replace(slot, test_entry(30, 0)).is_err());
    }

    #[test]
    fn clear_drops_everything() {
        let mut bucket = WheelBucket::new();
        for id in 0..3 {
            bucket.push_back(test_entry(id, 0), 1);
        }
        assert_eq!(bucket.clear(), 3);
        assert_eq!(bucket.len(), 0);
        assert!(ids_in_order(&mut bucket).is_empty());
    }
}
