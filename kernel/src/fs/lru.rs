//! Doubly linked recency list over a fixed arena of nodes.
//!
//! Node 0 is the sentinel: `nodes[0].next` is the most recently used entry,
//! `nodes[0].prev` the least. Unused nodes are chained through `next` from
//! `vacant`. Indices returned by `push_front` stay valid until `remove`.

use alloc::vec::Vec;

const HEAD: usize = 0;
const NIL: usize = usize::MAX;

struct Node<T> {
    prev: usize,
    next: usize,
    value: Option<T>,
}

pub(crate) struct LruList<T> {
    nodes: Vec<Node<T>>,
    vacant: usize,
    len: usize,
}

impl<T> LruList<T> {
    /// A list that can hold up to `capacity` entries without allocating.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity + 1);
        nodes.push(Node {
            prev: HEAD,
            next: HEAD,
            value: None,
        });
        for i in 1..=capacity {
            nodes.push(Node {
                prev: NIL,
                next: if i < capacity { i + 1 } else { NIL },
                value: None,
            });
        }
        Self {
            nodes,
            vacant: if capacity > 0 { 1 } else { NIL },
            len: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Insert at the most recently used end.
    ///
    /// # Panics
    /// Panics if the arena is full.
    pub(crate) fn push_front(&mut self, value: T) -> usize {
        let idx = self.vacant;
        if idx == NIL {
            panic!("lru: arena full ({} entries)", self.len);
        }
        self.vacant = self.nodes[idx].next;
        self.nodes[idx].value = Some(value);
        self.link_front(idx);
        self.len += 1;
        idx
    }

    /// Take an entry out of the list and return its node to the arena.
    pub(crate) fn remove(&mut self, idx: usize) -> T {
        let value = match self.nodes[idx].value.take() {
            Some(v) => v,
            None => panic!("lru: remove of vacant node {}", idx),
        };
        self.unlink(idx);
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.vacant;
        self.vacant = idx;
        self.len -= 1;
        value
    }

    /// Move an entry to the most recently used end. Its index is unchanged.
    pub(crate) fn move_to_front(&mut self, idx: usize) {
        debug_assert!(self.nodes[idx].value.is_some());
        self.unlink(idx);
        self.link_front(idx);
    }

    pub(crate) fn get(&self, idx: usize) -> &T {
        match &self.nodes[idx].value {
            Some(v) => v,
            None => panic!("lru: vacant node {}", idx),
        }
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut T {
        match &mut self.nodes[idx].value {
            Some(v) => v,
            None => panic!("lru: vacant node {}", idx),
        }
    }

    /// First entry, walking from the most recently used end, that matches.
    pub(crate) fn find_mru(&self, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
        let mut idx = self.nodes[HEAD].next;
        while idx != HEAD {
            if pred(self.get(idx)) {
                return Some(idx);
            }
            idx = self.nodes[idx].next;
        }
        None
    }

    /// First entry, walking from the least recently used end, that matches.
    pub(crate) fn find_lru(&self, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
        let mut idx = self.nodes[HEAD].prev;
        while idx != HEAD {
            if pred(self.get(idx)) {
                return Some(idx);
            }
            idx = self.nodes[idx].prev;
        }
        None
    }

    /// Entries from most to least recently used.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut idx = self.nodes[HEAD].next;
        core::iter::from_fn(move || {
            if idx == HEAD {
                return None;
            }
            let value = self.get(idx);
            idx = self.nodes[idx].next;
            Some(value)
        })
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    fn link_front(&mut self, idx: usize) {
        let first = self.nodes[HEAD].next;
        self.nodes[idx].prev = HEAD;
        self.nodes[idx].next = first;
        self.nodes[first].prev = idx;
        self.nodes[HEAD].next = idx;
    }
}
