//! Incremental MurmurHash2A.
//!
//! Order sensitive and stable across runs, so it is used for every cache key
//! in the engine: pipelines, bind groups, layouts, shaders and attachments.

const M: u32 = 0x5bd1_e995;
const R: u32 = 24;

#[inline]
fn mmix(h: &mut u32, mut k: u32) {
    k = k.wrapping_mul(M);
    k ^= k >> R;
    k = k.wrapping_mul(M);
    *h = h.wrapping_mul(M);
    *h ^= k;
}

#[derive(Clone, Debug)]
pub struct Murmur2A {
    hash: u32,
    tail: u32,
    count: u32,
    size: u32,
}

impl Default for Murmur2A {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Murmur2A {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: u32) -> Self {
        Self {
            hash: seed,
            tail: 0,
            count: 0,
            size: 0,
        }
    }

    pub fn add(&mut self, mut data: &[u8]) {
        self.size = self.size.wrapping_add(data.len() as u32);
        data = self.mix_tail(data);
        while data.len() >= 4 {
            let k = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            mmix(&mut self.hash, k);
            data = &data[4..];
        }
        self.mix_tail(data);
    }

    pub fn add_u8(&mut self, value: u8) {
        self.add(&[value]);
    }

    pub fn add_u16(&mut self, value: u16) {
        self.add(&value.to_le_bytes());
    }

    pub fn add_u32(&mut self, value: u32) {
        self.add(&value.to_le_bytes());
    }

    pub fn add_u64(&mut self, value: u64) {
        self.add(&value.to_le_bytes());
    }

    fn mix_tail<'a>(&mut self, mut data: &'a [u8]) -> &'a [u8] {
        while !data.is_empty() && (data.len() < 4 || self.count != 0) {
            self.tail |= (data[0] as u32) << (self.count * 8);
            self.count += 1;
            data = &data[1..];
            if self.count == 4 {
                mmix(&mut self.hash, self.tail);
                self.tail = 0;
                self.count = 0;
            }
        }
        data
    }

    pub fn end(&self) -> u32 {
        let mut hash = self.hash;
        mmix(&mut hash, self.tail);
        mmix(&mut hash, self.size);
        hash ^= hash >> 13;
        hash = hash.wrapping_mul(M);
        hash ^= hash >> 15;
        hash
    }
}

impl std::hash::Hasher for Murmur2A {
    fn finish(&self) -> u64 {
        self.end() as u64
    }

    fn write(&mut self, bytes: &[u8]) {
        self.add(bytes);
    }
}

/// Hashes a byte slice in one go.
pub fn murmur2a(data: &[u8]) -> u32 {
    let mut murmur = Murmur2A::new();
    murmur.add(data);
    murmur.end()
}
