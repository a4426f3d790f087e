use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Restores log order for results that complete out of order.
///
/// Items tagged with a sequence number are held until every lower number
/// has been released. Untagged items have no place in the log order and
/// are released immediately.
pub struct ReorderBuffer<T> {
    next_seq: u64,
    heap: BinaryHeap<Reverse<HeapEntry<T>>>,
}

struct HeapEntry<T> {
    seq: u64,
    item: T,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    /// Sequence numbers are expected to start at 0.
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            heap: BinaryHeap::new(),
        }
    }

    /// Accept one item and return everything that is now releasable, in
    /// order.
    pub fn push(&mut self, seq: Option<u64>, item: T) -> Vec<T> {
        let Some(seq) = seq else {
            return vec![item];
        };

        if seq < self.next_seq {
            // Already past this number; nothing to wait for.
            return vec![item];
        }

        self.heap.push(Reverse(HeapEntry { seq, item }));

        let mut ready = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.seq != self.next_seq {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                self.next_seq += 1;
                ready.push(entry.item);
            }
        }
        ready
    }

    /// Number of items waiting on a gap.
    pub fn held(&self) -> usize {
        self.heap.len()
    }

    /// The sequence number the buffer is waiting for.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Release everything still held, in sequence order, regardless of gaps.
    pub fn drain(&mut self) -> Vec<T> {
        let mut remaining = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(entry)) = self.heap.pop() {
            self.next_seq = entry.seq + 1;
            remaining.push(entry.item);
        }
        remaining
    }
}
