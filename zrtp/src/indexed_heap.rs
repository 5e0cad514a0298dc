/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

/// A generational index into a `DeadlineQueue`.
///
/// It stays valid for as long as its item remains in the queue. Once the item is removed,
/// functions taking this index safely return `None`.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct QueueIndex(usize, u64);

const RESERVED_MARKER: u64 = 1;
const EMPTY_MARKER: u64 = 0;
const NO_FREE_SLOT: usize = usize::MAX;

struct Entry<T> {
    item: T,
    deadline: i64,
    slot: usize,
}

/// A min-heap of items ordered by deadline, addressable through generational indices.
///
/// Sessions keep their index for their whole lifetime and move their deadline whenever a
/// retransmission timer changes, so the scheduler only ever has to look at the top.
pub struct DeadlineQueue<T> {
    generation: u64,
    free_list_head: usize,
    heap: Vec<Entry<T>>,
    /// Maps a slot to `(heap position, generation)`.
    slots: Vec<(usize, u64)>,
}

impl<T> DeadlineQueue<T> {
    pub fn new() -> Self {
        Self { generation: 1, free_list_head: NO_FREE_SLOT, heap: Vec::new(), slots: Vec::new() }
    }

    /// The item with the earliest deadline.
    ///
    /// Amortized runtime: O(1).
    pub fn peek(&self) -> Option<(&T, i64, QueueIndex)> {
        self.heap
            .first()
            .map(|e| (&e.item, e.deadline, QueueIndex(e.slot, self.slots[e.slot].1)))
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.slots[self.heap[a].slot].0 = b;
        self.slots[self.heap[b].slot].0 = a;
        self.heap.swap(a, b);
    }
    fn sift_down(&mut self, mut parent: usize) {
        loop {
            let left = parent * 2 + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let earliest = if right < self.heap.len() && self.heap[right].deadline < self.heap[left].deadline {
                right
            } else {
                left
            };
            if self.heap[earliest].deadline < self.heap[parent].deadline {
                self.swap(parent, earliest);
                parent = earliest;
            } else {
                break;
            }
        }
    }
    fn sift_up(&mut self, mut child: usize) {
        while child > 0 {
            let parent = (child - 1) / 2;
            if self.heap[child].deadline < self.heap[parent].deadline {
                self.swap(parent, child);
                child = parent;
            } else {
                break;
            }
        }
    }
    fn remove_at(&mut self, pos: usize) -> (T, i64) {
        let last = self.heap.len() - 1;
        self.swap(pos, last);
        let Some(e) = self.heap.pop() else { unreachable!() };
        self.slots[e.slot] = (self.free_list_head, EMPTY_MARKER);
        self.free_list_head = e.slot;
        // The entry moved into `pos` came from the bottom and may belong on either side.
        if pos < self.heap.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        (e.item, e.deadline)
    }
    fn position(&self, idx: QueueIndex) -> Option<usize> {
        (idx.0 < self.slots.len() && self.slots[idx.0].1 == idx.1).then(|| self.slots[idx.0].0)
    }

    /// Remove and return the item with the earliest deadline.
    pub fn pop(&mut self) -> Option<(T, i64)> {
        (!self.heap.is_empty()).then(|| self.remove_at(0))
    }
    pub fn push(&mut self, item: T, deadline: i64) -> QueueIndex {
        let idx = self.reserve_index();
        self.push_reserved(idx, item, deadline);
        idx
    }
    /// Reserve an index before the item that will own it exists.
    ///
    /// A session stores its index inside itself, so the index has to be known before the
    /// session can be wrapped in an `Arc` and pushed.
    pub fn reserve_index(&mut self) -> QueueIndex {
        self.generation += 1;
        let slot = if self.free_list_head != NO_FREE_SLOT {
            let slot = self.free_list_head;
            self.free_list_head = self.slots[slot].0;
            self.slots[slot] = (0, RESERVED_MARKER);
            slot
        } else {
            self.slots.push((0, RESERVED_MARKER));
            self.slots.len() - 1
        };
        QueueIndex(slot, self.generation)
    }
    /// Returns false if `idx` was not reserved or already holds an item.
    pub fn push_reserved(&mut self, idx: QueueIndex, item: T, deadline: i64) -> bool {
        if idx.0 < self.slots.len() && self.slots[idx.0].1 == RESERVED_MARKER {
            let pos = self.heap.len();
            self.slots[idx.0] = (pos, idx.1);
            self.heap.push(Entry { item, deadline, slot: idx.0 });
            self.sift_up(pos);
            true
        } else {
            false
        }
    }
    /// Move the item at `idx` to a new deadline, returning the previous one.
    ///
    /// Amortized runtime: O(log(n)).
    pub fn change_deadline(&mut self, idx: QueueIndex, deadline: i64) -> Option<i64> {
        self.position(idx).map(|pos| {
            let old = std::mem::replace(&mut self.heap[pos].deadline, deadline);
            if deadline < old {
                self.sift_up(pos);
            } else if deadline > old {
                self.sift_down(pos);
            }
            old
        })
    }
    pub fn get(&self, idx: QueueIndex) -> Option<(&T, i64)> {
        self.position(idx).map(|pos| (&self.heap[pos].item, self.heap[pos].deadline))
    }
    /// Remove an item, or release a reserved index that never received one.
    pub fn remove(&mut self, idx: QueueIndex) -> Option<(T, i64)> {
        if idx.0 >= self.slots.len() {
            return None;
        }
        if self.slots[idx.0].1 == RESERVED_MARKER {
            self.slots[idx.0] = (self.free_list_head, EMPTY_MARKER);
            self.free_list_head = idx.0;
            None
        } else if self.slots[idx.0].1 == idx.1 {
            Some(self.remove_at(self.slots[idx.0].0))
        } else {
            None
        }
    }
    pub fn len(&self) -> usize {
        self.heap.len()
    }
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for DeadlineQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test() {
    let mut queue = DeadlineQueue::new();
    let r0 = queue.push(1234, 1234);
    for i in 0..100 {
        queue.push(2 * i, 2 * i);
    }
    let r1 = queue.push(12, 12);
    assert_eq!(queue.remove(r0), Some((1234, 1234)));
    for i in (0..100).rev() {
        queue.push(2 * i + 1, 2 * i + 1);
    }
    assert_eq!(queue.change_deadline(r1, 1234), Some(12));
    assert_eq!(queue.get(r1), Some((&12, 1234)));
    assert_eq!(queue.remove(r0), None);
    let mut last = i64::MIN;
    while let Some((_, d)) = queue.pop() {
        assert!(d >= last);
        last = d;
    }
    assert!(queue.is_empty());
}

#[test]
fn removal_from_the_middle_keeps_order() {
    let mut queue = DeadlineQueue::new();
    let idx: Vec<QueueIndex> = [50, 10, 40, 5, 60, 1, 70, 3].iter().map(|d| queue.push(*d, *d)).collect();
    assert_eq!(queue.remove(idx[4]), Some((60, 60)));
    assert_eq!(queue.remove(idx[1]), Some((10, 10)));
    let reserved = queue.reserve_index();
    assert!(queue.push_reserved(reserved, 2, 2));
    assert!(!queue.push_reserved(reserved, 2, 2));
    let order: Vec<i64> = std::iter::from_fn(|| queue.pop().map(|e| e.1)).collect();
    assert_eq!(order, vec![1, 2, 3, 5, 40, 50, 70]);
}
