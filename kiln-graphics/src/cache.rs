//! Bounded least-recently-used map keyed by 32-bit hashes.

use std::collections::HashMap;

struct Entry<V> {
    key: u32,
    value: Option<V>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Fixed-capacity LRU cache.
///
/// Entries live in a slab threaded by an intrusive doubly linked list,
/// most recent at the head. Inserting into a full cache evicts the tail and
/// hands it back so the caller can release the GPU object it holds.
pub struct LruCache<V> {
    capacity: usize,
    map: HashMap<u32, usize>,
    entries: Vec<Entry<V>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<V> LruCache<V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU capacity must be non-zero");
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: u32) -> bool {
        self.map.contains_key(&key)
    }

    /// Looks up `key` and marks it most recently used.
    pub fn get(&mut self, key: u32) -> Option<&V> {
        let index = *self.map.get(&key)?;
        self.unlink(index);
        self.push_front(index);
        self.entries[index].value.as_ref()
    }

    /// Looks up `key` without touching the recency order.
    pub fn peek(&self, key: u32) -> Option<&V> {
        let index = *self.map.get(&key)?;
        self.entries[index].value.as_ref()
    }

    /// Inserts or replaces `key`. Returns the replaced or evicted entry.
    pub fn insert(&mut self, key: u32, value: V) -> Option<(u32, V)> {
        if let Some(&index) = self.map.get(&key) {
            self.unlink(index);
            self.push_front(index);
            return self.entries[index]
                .value
                .replace(value)
                .map(|old| (key, old));
        }

        let evicted = match self.tail {
            Some(tail) if self.map.len() >= self.capacity => {
                let tail_key = self.entries[tail].key;
                self.remove(tail_key).map(|old| (tail_key, old))
            }
            _ => None,
        };

        let entry = Entry {
            key,
            value: Some(value),
            prev: None,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index] = entry;
                index
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        self.map.insert(key, index);
        self.push_front(index);
        evicted
    }

    pub fn remove(&mut self, key: u32) -> Option<V> {
        let index = self.map.remove(&key)?;
        self.unlink(index);
        self.free.push(index);
        self.entries[index].value.take()
    }

    /// Removes every entry, most recent first.
    pub fn drain(&mut self) -> Vec<(u32, V)> {
        let mut out = Vec::with_capacity(self.map.len());
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let entry = &mut self.entries[index];
            cursor = entry.next;
            if let Some(value) = entry.value.take() {
                out.push((entry.key, value));
            }
        }
        self.map.clear();
        self.entries.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        out
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let index = cursor?;
            cursor = self.entries[index].next;
            Some(self.entries[index].key)
        })
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.entries[index].prev, self.entries[index].next);
        match prev {
            Some(prev) => self.entries[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.entries[next].prev = prev,
            None => self.tail = prev,
        }
        self.entries[index].prev = None;
        self.entries[index].next = None;
    }

    fn push_front(&mut self, index: usize) {
        self.entries[index].next = self.head;
        if let Some(head) = self.head {
            self.entries[head].prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }
}
