//! Open-addressing hash map keyed by 32-byte hashes.
//!
//! Linear probing over a power-of-two table; resize-by-copy once fill
//! reaches half of capacity. Keys are protocol hashes, so the first eight
//! bytes are already uniformly distributed.

pub const KEY_WIDTH: usize = 32;

type Key = [u8; KEY_WIDTH];

#[derive(Debug, Clone)]
pub struct IndexMap<V> {
    slots: Vec<Option<(Key, V)>>,
    len: usize,
}

impl<V: Clone> Default for IndexMap<V> {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl<V: Clone> IndexMap<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(8);
        IndexMap {
            slots: vec![None; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_of(&self, key: &Key) -> usize {
        let prefix = u64::from_le_bytes(key[..8].try_into().unwrap());
        prefix as usize & (self.slots.len() - 1)
    }

    /// Index of the key's slot, or of the empty slot where it would go.
    fn probe(&self, key: &Key) -> usize {
        let mut index = self.slot_of(key);
        loop {
            match &self.slots[index] {
                Some((existing, _)) if existing == key => return index,
                Some(_) => index = (index + 1) & (self.slots.len() - 1),
                None => return index,
            }
        }
    }

    pub fn insert(&mut self, key: Key, value: V) -> Option<V> {
        if (self.len + 1) * 2 > self.slots.len() {
            self.grow();
        }
        let index = self.probe(&key);
        match self.slots[index].replace((key, value)) {
            Some((_, old)) => Some(old),
            None => {
                self.len += 1;
                None
            }
        }
    }

    pub fn get(&self, key: &Key) -> Option<&V> {
        let index = self.probe(key);
        self.slots[index]
            .as_ref()
            .filter(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &V)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|(key, value)| (key, value)))
    }

    fn grow(&mut self) {
        let doubled = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![None; doubled]);
        self.len = 0;
        for (key, value) in old.into_iter().flatten() {
            self.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_key(rng: &mut impl RngCore) -> Key {
        let mut key = [0u8; KEY_WIDTH];
        rng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_random_inserts_all_retrievable() {
        let mut rng = rand::thread_rng();
        let mut map = IndexMap::with_capacity(8);
        let mut keys = Vec::new();

        for i in 0..4096u32 {
            let key = random_key(&mut rng);
            keys.push((key, i));
            map.insert(key, i);
        }

        assert_eq!(map.len(), keys.len());
        for (key, value) in &keys {
            assert_eq!(map.get(key), Some(value));
        }

        for _ in 0..64 {
            let absent = random_key(&mut rng);
            if !keys.iter().any(|(k, _)| k == &absent) {
                assert_eq!(map.get(&absent), None);
            }
        }
    }

    #[test]
    fn test_insert_replaces_and_returns_old() {
        let mut map = IndexMap::with_capacity(8);
        let key = [7u8; KEY_WIDTH];
        assert_eq!(map.insert(key, "a"), None);
        assert_eq!(map.insert(key, "b"), Some("a"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&key), Some(&"b"));
    }

    #[test]
    fn test_fill_factor_resize() {
        let mut map = IndexMap::with_capacity(8);
        // Adjacent prefixes force probing and several grows.
        for i in 0..64u64 {
            let mut key = [0u8; KEY_WIDTH];
            key[..8].copy_from_slice(&i.to_le_bytes());
            map.insert(key, i);
        }
        assert_eq!(map.len(), 64);
        // Fill stays under half of capacity.
        assert!(map.capacity() >= 2 * map.len());
        for i in 0..64u64 {
            let mut key = [0u8; KEY_WIDTH];
            key[..8].copy_from_slice(&i.to_le_bytes());
            assert_eq!(map.get(&key), Some(&i));
        }
    }

    #[test]
    fn test_iter_covers_all() {
        let mut map = IndexMap::with_capacity(8);
        for i in 0..10u8 {
            map.insert([i; KEY_WIDTH], i);
        }
        let mut seen: Vec<u8> = map.iter().map(|(_, v)| *v).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }
}
