use std::{collections::HashMap, rc::Rc};

use crate::{
    id::CallbackId,
    record::{CallbackKind, CallbackRecord},
};

/// `(expiration, insertion_sequence)` key a heap slot is ordered by.
///
/// Equal expirations break ties by sequence, giving the stable FIFO
/// order among siblings the spec's TimerQueue invariant requires.
type HeapKey = (f64, u64);

fn timer_key(record: &CallbackRecord) -> HeapKey {
    match &*record.kind() {
        CallbackKind::Timer {
            expiration,
            sequence,
            ..
        } => (expiration.get(), sequence.get()),
        _ => unreachable!("TimerQueue only holds Timer records"),
    }
}

/// A binary min-heap over `Timer` records, ordered by `(expiration,
/// insertion_sequence)`, with an index map supporting O(log n) removal
/// of an arbitrary, not-necessarily-root record by id (spec §4.2).
#[derive(Default)]
pub struct TimerQueue {
    heap: Vec<Rc<CallbackRecord>>,
    positions: HashMap<CallbackId, usize>,
    next_sequence: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            positions: HashMap::new(),
            next_sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The next stable tie-break value; callers stamp it into the
    /// record's `Timer::sequence` before calling [`insert`].
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Insert a `Timer` record. O(log n).
    pub fn insert(&mut self, record: Rc<CallbackRecord>) {
        debug_assert!(record.kind().is_timer());
        let idx = self.heap.len();
        self.positions.insert(record.id(), idx);
        self.heap.push(record);
        self.sift_up(idx);
    }

    /// Remove a record by id, wherever it sits in the heap. A no-op if
    /// the id was never inserted, or was already removed. O(log n).
    pub fn remove(&mut self, id: CallbackId) {
        let Some(&idx) = self.positions.get(&id) else {
            return;
        };
        self.positions.remove(&id);
        let last = self.heap.len() - 1;
        if idx != last {
            self.heap.swap(idx, last);
            self.positions.insert(self.heap[idx].id(), idx);
        }
        self.heap.pop();
        if idx < self.heap.len() {
            // The swapped-in element could need to move either way.
            self.sift_down(idx);
            self.sift_up(idx);
        }
    }

    /// The smallest expiration currently queued, if any. O(1).
    pub fn peek(&self) -> Option<f64> {
        self.heap.first().map(|r| timer_key(r).0)
    }

    /// Pop the root iff its expiration is `<= now`. O(log n).
    pub fn extract(&mut self, now: f64) -> Option<Rc<CallbackRecord>> {
        let ready = matches!(self.peek(), Some(expiration) if expiration <= now);
        if !ready {
            return None;
        }
        let root = self.heap[0].clone();
        self.positions.remove(&root.id());
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        self.heap.pop();
        if !self.heap.is_empty() {
            self.positions.insert(self.heap[0].id(), 0);
            self.sift_down(0);
        }
        Some(root)
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if timer_key(&self.heap[idx]) < timer_key(&self.heap[parent]) {
                self.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < len && timer_key(&self.heap[left]) < timer_key(&self.heap[smallest]) {
                smallest = left;
            }
            if right < len && timer_key(&self.heap[right]) < timer_key(&self.heap[smallest]) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].id(), a);
        self.positions.insert(self.heap[b].id(), b);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{id::IdGenerator, record::CallbackOutcome};

    fn timer_record(gen: &IdGenerator, queue: &mut TimerQueue, expiration: f64, repeat: bool) -> Rc<CallbackRecord> {
        let seq = queue.next_sequence();
        let id = gen.next();
        let kind = CallbackKind::Timer {
            interval: 1.0,
            expiration: Cell::new(expiration),
            repeat,
            sequence: Cell::new(seq),
        };
        let cb: crate::record::BoxedCallback = Box::new(|_, _| CallbackOutcome::Void);
        Rc::new(CallbackRecord::new(id, kind, cb, seq))
    }

    #[test]
    fn extract_returns_root_in_expiration_order() {
        let gen = IdGenerator::new();
        let mut q = TimerQueue::new();
        let late = timer_record(&gen, &mut q, 5.0, false);
        let early = timer_record(&gen, &mut q, 1.0, false);
        q.insert(late.clone());
        q.insert(early.clone());

        assert_eq!(q.peek(), Some(1.0));
        let popped = q.extract(10.0).unwrap();
        assert_eq!(popped.id(), early.id());
        let popped = q.extract(10.0).unwrap();
        assert_eq!(popped.id(), late.id());
        assert!(q.is_empty());
    }

    #[test]
    fn extract_respects_now_threshold() {
        let gen = IdGenerator::new();
        let mut q = TimerQueue::new();
        let r = timer_record(&gen, &mut q, 5.0, false);
        q.insert(r);
        assert!(q.extract(4.0).is_none());
        assert!(q.extract(5.0).is_some());
    }

    #[test]
    fn equal_expirations_break_ties_by_insertion_sequence() {
        let gen = IdGenerator::new();
        let mut q = TimerQueue::new();
        let a = timer_record(&gen, &mut q, 1.0, false);
        let b = timer_record(&gen, &mut q, 1.0, false);
        q.insert(a.clone());
        q.insert(b.clone());
        let first = q.extract(1.0).unwrap();
        let second = q.extract(1.0).unwrap();
        assert_eq!(first.id(), a.id());
        assert_eq!(second.id(), b.id());
    }

    #[test]
    fn remove_is_safe_on_unknown_and_double_remove() {
        let gen = IdGenerator::new();
        let mut q = TimerQueue::new();
        let a = timer_record(&gen, &mut q, 1.0, false);
        let unknown_id = gen.next();

        q.remove(unknown_id); // never inserted: no-op
        q.insert(a.clone());
        q.remove(a.id());
        q.remove(a.id()); // double remove: no-op
        assert!(q.is_empty());
        assert!(q.extract(100.0).is_none());
    }

    #[test]
    fn remove_non_root_preserves_heap_order() {
        let gen = IdGenerator::new();
        let mut q = TimerQueue::new();
        let a = timer_record(&gen, &mut q, 1.0, false);
        let b = timer_record(&gen, &mut q, 2.0, false);
        let c = timer_record(&gen, &mut q, 3.0, false);
        q.insert(a.clone());
        q.insert(b.clone());
        q.insert(c.clone());

        q.remove(b.id());
        assert_eq!(q.len(), 2);
        let first = q.extract(10.0).unwrap();
        assert_eq!(first.id(), a.id());
        let second = q.extract(10.0).unwrap();
        assert_eq!(second.id(), c.id());
    }
}
