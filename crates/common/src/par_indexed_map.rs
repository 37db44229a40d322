// SPDX-License-Identifier: Apache-2.0

//! A thread-safe map from keys to values through stable sequential ids.
//!
//! Entries live in fixed-size spans and each entry has its own lock, so
//! unrelated entries can be read and written concurrently. Ids are assigned
//! on first sight and entries are never freed before the map is.
//!
//! Typical workflow:
//! - grab the key's id with [`ParIndexedMap::get_id`] (serialized through one
//!   lock)
//! - operate on the entry with [`ParIndexedMap::on_id`] (per-entry lock)

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::OnceLock;

use parking_lot::Mutex;

/// Stable id of an entry in a [`ParIndexedMap`].
pub type ParId = i64;

/// Result of [`ParIndexedMap::get_id`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetResult {
    /// The entry's id, or -1 when the map is full.
    pub id: ParId,
    /// Whether this call created the entry.
    pub just_created: bool,
}

const SPAN_SIZE: usize = 1_000;
const MAX_ENTRIES: usize = 10_000_000;
const NUM_SPANS: usize = MAX_ENTRIES / SPAN_SIZE;

struct Span<V> {
    entries: Vec<Mutex<V>>,
}

impl<V: Default> Span<V> {
    fn new() -> Self {
        Self {
            entries: (0..SPAN_SIZE).map(|_| Mutex::new(V::default())).collect(),
        }
    }
}

/// See the module docs.
pub struct ParIndexedMap<K, V> {
    spans: Vec<OnceLock<Span<V>>>,
    add: Mutex<AddState<K>>,
}

struct AddState<K> {
    id_map: HashMap<K, ParId>,
    len: usize,
}

impl<K: Eq + Hash + Clone, V: Default> Default for ParIndexedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: Default> ParIndexedMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        let mut spans = Vec::with_capacity(NUM_SPANS);
        spans.resize_with(NUM_SPANS, OnceLock::new);
        Self {
            spans,
            add: Mutex::new(AddState {
                id_map: HashMap::new(),
                len: 0,
            }),
        }
    }

    /// Looks up the id for `key`, allocating one on first sight. Returns an
    /// id of -1 when the map holds the maximum number of entries.
    pub fn get_id(&self, key: &K) -> GetResult {
        let mut add = self.add.lock();
        if let Some(&id) = add.id_map.get(key) {
            return GetResult {
                id,
                just_created: false,
            };
        }
        if add.len == MAX_ENTRIES {
            return GetResult {
                id: -1,
                just_created: false,
            };
        }
        let id = add.len;
        if id % SPAN_SIZE == 0 {
            let _ = self.spans[id / SPAN_SIZE].set(Span::new());
        }
        add.len += 1;
        let _ = add.id_map.insert(key.clone(), id as ParId);
        GetResult {
            id: id as ParId,
            just_created: true,
        }
    }

    /// Runs `func` on the entry with the given id, holding only that entry's
    /// lock.
    ///
    /// # Panics
    ///
    /// Panics when `id` has not been allocated.
    pub fn on_id<R>(&self, id: ParId, func: impl FnOnce(&mut V) -> R) -> R {
        assert!(id >= 0, "invalid ParId {id}");
        let id = id as usize;
        assert!(id < self.num_ids() as usize, "ParId {id} out of range");
        let span = self.spans[id / SPAN_SIZE]
            .get()
            .expect("span missing for allocated id");
        let mut entry = span.entries[id % SPAN_SIZE].lock();
        func(&mut entry)
    }

    /// Calls `func` for every id in `[start, end)`, locking entries one at a
    /// time in id order.
    pub fn for_each(&self, start: ParId, end: ParId, mut func: impl FnMut(ParId, &mut V)) {
        let end = end.min(self.num_ids());
        for id in start.max(0)..end {
            self.on_id(id, |v| func(id, v));
        }
    }

    /// Number of ids currently allocated. All ids in `[0, num_ids())` are
    /// valid.
    pub fn num_ids(&self) -> ParId {
        self.add.lock().len as ParId
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ids_are_stable_and_sequential() {
        let map: ParIndexedMap<u64, i32> = ParIndexedMap::new();
        assert_eq!(
            map.get_id(&7),
            GetResult {
                id: 0,
                just_created: true
            }
        );
        assert_eq!(
            map.get_id(&9),
            GetResult {
                id: 1,
                just_created: true
            }
        );
        assert_eq!(
            map.get_id(&7),
            GetResult {
                id: 0,
                just_created: false
            }
        );
        assert_eq!(map.num_ids(), 2);
    }

    #[test]
    fn on_id_reads_and_writes() {
        let map: ParIndexedMap<String, Vec<i32>> = ParIndexedMap::new();
        let id = map.get_id(&"a".to_string()).id;
        map.on_id(id, |v| v.push(5));
        map.on_id(id, |v| v.push(6));
        map.on_id(id, |v| assert_eq!(v, &vec![5, 6]));
    }

    #[test]
    fn for_each_visits_in_order() {
        let map: ParIndexedMap<u64, u64> = ParIndexedMap::new();
        for key in 0..10u64 {
            let id = map.get_id(&key).id;
            map.on_id(id, |v| *v = key * 2);
        }
        let mut seen = Vec::new();
        map.for_each(0, map.num_ids(), |id, v| seen.push((id, *v)));
        let expected: Vec<(ParId, u64)> = (0..10).map(|i| (i as ParId, i as u64 * 2)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn concurrent_get_and_update() {
        let map: Arc<ParIndexedMap<u64, u64>> = Arc::new(ParIndexedMap::new());
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                for i in 0..200u64 {
                    let key = (t * 200 + i) % 50;
                    let id = map.get_id(&key).id;
                    map.on_id(id, |v| *v += 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.num_ids(), 50);
        let mut total = 0;
        map.for_each(0, map.num_ids(), |_, v| total += *v);
        assert_eq!(total, 8 * 200);
    }
}
