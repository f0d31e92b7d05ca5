use slotmap::{Key, SlotMap};

use crate::Error;

/// Fixed-capacity arena addressed by generational handles.
pub(crate) struct Pool<K: Key, V> {
    name: &'static str,
    capacity: usize,
    slots: SlotMap<K, V>,
}

impl<K: Key, V> Pool<K, V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            slots: SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, value: V) -> Result<K, Error> {
        if self.slots.len() >= self.capacity {
            log::warn!("{} pool is full ({} entries)", self.name, self.capacity);
            return Err(Error::PoolExhausted(self.name));
        }
        Ok(self.slots.insert(value))
    }

    pub fn get(&self, key: K) -> Result<&V, Error> {
        self.slots.get(key).ok_or(Error::InvalidHandle(self.name))
    }

    pub fn get_mut(&mut self, key: K) -> Result<&mut V, Error> {
        self.slots.get_mut(key).ok_or(Error::InvalidHandle(self.name))
    }

    pub fn try_get(&self, key: K) -> Option<&V> {
        self.slots.get(key)
    }

    pub fn remove(&mut self, key: K) -> Result<V, Error> {
        self.slots.remove(key).ok_or(Error::InvalidHandle(self.name))
    }

    pub fn contains(&self, key: K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut V)> {
        self.slots.iter_mut()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        self.slots.drain()
    }
}
