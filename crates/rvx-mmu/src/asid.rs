use tracing::debug;

/// Retired-instruction window over which ASID evictions are counted.
pub const GROWTH_WINDOW: u64 = 100_000;

/// Address-space key tracked by the MRU cache.
///
/// Non-virtual entries use `vmid = 0`; G-stage entries use `asid = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AsidKey {
    pub vmid: u16,
    pub asid: u16,
}

/// Bounded most-recently-used list of address spaces with live TLB entries.
///
/// TLB entries are dropped only when their key falls off the end of this list. Capacity doubles
/// (up to a ceiling) whenever more than one eviction happens within [`GROWTH_WINDOW`] retired
/// instructions.
#[derive(Debug, Clone)]
pub struct AsidCache {
    mru: Vec<AsidKey>,
    capacity: usize,
    max_capacity: usize,
    window_start: u64,
    window_evictions: u32,
}

impl AsidCache {
    pub fn new(capacity: usize, max_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            mru: Vec::with_capacity(capacity),
            capacity,
            max_capacity: max_capacity.max(capacity),
            window_start: 0,
            window_evictions: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn keys(&self) -> &[AsidKey] {
        &self.mru
    }

    #[inline]
    pub fn contains(&self, key: AsidKey) -> bool {
        self.mru.contains(&key)
    }

    /// Moves `key` to the front if present. Never evicts.
    pub fn touch(&mut self, key: AsidKey) {
        if let Some(pos) = self.mru.iter().position(|k| *k == key) {
            if pos != 0 {
                let k = self.mru.remove(pos);
                self.mru.insert(0, k);
            }
        }
    }

    /// Makes `key` the most recently used, returning the key evicted to make room.
    pub fn promote(&mut self, key: AsidKey, instret: u64) -> Option<AsidKey> {
        if self.mru.contains(&key) {
            self.touch(key);
            return None;
        }

        self.mru.insert(0, key);
        if self.mru.len() <= self.capacity {
            return None;
        }

        let evicted = self.mru.pop();
        self.note_eviction(instret);
        evicted
    }

    fn note_eviction(&mut self, instret: u64) {
        if instret.wrapping_sub(self.window_start) >= GROWTH_WINDOW {
            self.window_start = instret;
            self.window_evictions = 0;
        }
        self.window_evictions += 1;

        if self.window_evictions > 1 && self.capacity < self.max_capacity {
            let grown = (self.capacity * 2).min(self.max_capacity);
            debug!(from = self.capacity, to = grown, "growing ASID cache");
            self.capacity = grown;
            self.window_start = instret;
            self.window_evictions = 0;
        }
    }

    pub fn clear(&mut self) {
        self.mru.clear();
    }

    pub(crate) fn window(&self) -> (u64, u32) {
        (self.window_start, self.window_evictions)
    }

    pub(crate) fn restore(
        &mut self,
        keys: Vec<AsidKey>,
        capacity: usize,
        window_start: u64,
        window_evictions: u32,
    ) {
        self.capacity = capacity.clamp(1, self.max_capacity);
        self.mru = keys;
        self.mru.truncate(self.capacity);
        self.window_start = window_start;
        self.window_evictions = window_evictions;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(asid: u16) -> AsidKey {
        AsidKey { vmid: 0, asid }
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = AsidCache::new(2, 2);
        assert_eq!(cache.promote(key(1), 0), None);
        assert_eq!(cache.promote(key(2), 0), None);
        cache.touch(key(1));
        assert_eq!(cache.promote(key(3), 0), Some(key(2)));
        assert_eq!(cache.keys(), &[key(3), key(1)]);
    }

    #[test]
    fn grows_when_evictions_are_frequent() {
        let mut cache = AsidCache::new(2, 8);
        cache.promote(key(1), 0);
        cache.promote(key(2), 0);
        assert_eq!(cache.promote(key(3), 10), Some(key(1)));
        assert_eq!(cache.capacity(), 2);
        // Second eviction inside the same window doubles capacity.
        assert_eq!(cache.promote(key(4), 20), Some(key(2)));
        assert_eq!(cache.capacity(), 4);
        assert_eq!(cache.promote(key(5), 30), None);
    }

    #[test]
    fn sparse_evictions_do_not_grow() {
        let mut cache = AsidCache::new(1, 8);
        cache.promote(key(1), 0);
        cache.promote(key(2), 10);
        cache.promote(key(3), 10 + GROWTH_WINDOW);
        cache.promote(key(4), 10 + 2 * GROWTH_WINDOW);
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn capacity_stops_at_ceiling() {
        let mut cache = AsidCache::new(1, 2);
        for (i, asid) in (0..16u16).enumerate() {
            cache.promote(key(asid), i as u64);
        }
        assert_eq!(cache.capacity(), 2);
    }
}
