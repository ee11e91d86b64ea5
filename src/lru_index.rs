//! An [LruIndex] is an Lru index which uses the cost of the items to decide when to evict, and which never evicts
//! items that are pinned by a reader.
//!
//! This is implemented as a vec-backed linked list where the items are allocated on the heap behind `Arc`, plus an
//! auxiliary hash-based index.  Unlike a plain Lru, inserting never evicts on its own: the owner calls
//! [LruIndex::evict_over_budget] when it is ready to deal with what falls out (for the disk cache, deleting files).
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::SystemTime;

use ahash::RandomState;

struct OccupiedEntry<K, V> {
    key: Arc<K>,
    item: Arc<V>,
    prev: Option<usize>,
    next: Option<usize>,
    cost: u64,
    /// Number of outstanding readers; non-zero means the entry can't be evicted.
    pins: u32,
    last_used: SystemTime,
}

struct EmptyEntry {
    next_empty: Option<usize>,
}

enum IndexEntry<K, V> {
    /// This entry is empty, possibly with a pointer at the next empty entry.
    Empty(EmptyEntry),
    /// This entry is occupied, and doubly linked to the previous and next entry.
    Occupied(OccupiedEntry<K, V>),
}

impl<K, V> IndexEntry<K, V> {
    fn as_occupied_mut(&mut self) -> &mut OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref mut x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_occupied(&self) -> &OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_empty_mut(&mut self) -> &mut EmptyEntry {
        match self {
            IndexEntry::Empty(ref mut x) => x,
            _ => panic!("Entry should be empty"),
        }
    }
}

pub struct LruIndex<K: Hash + Eq, V> {
    entries: Vec<IndexEntry<K, V>>,
    /// Points at the index of the key.
    index: HashMap<Arc<K>, usize, RandomState>,
    // At what cost do we start evicting?
    max_cost: u64,
    /// Most recently used.
    entries_head: Option<usize>,
    /// Least recently used.
    entries_tail: Option<usize>,
    empty_head: Option<usize>,
    /// Current cost of the items in the index.
    current_cost: u64,
}

impl<K: Hash + Eq, V> LruIndex<K, V> {
    pub fn new(max_cost: u64) -> LruIndex<K, V> {
        LruIndex {
            entries: Default::default(),
            index: Default::default(),
            max_cost,
            entries_head: None,
            entries_tail: None,
            empty_head: None,
            current_cost: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn current_cost(&self) -> u64 {
        self.current_cost
    }

    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }

    /// Entirely unlink an occupied index from the list.
    /// Used as a precursor step to lots of things such as patching up the head.
    fn unlink_index(&mut self, index: usize) {
        // Easiest to handle the tail first.
        if Some(index) == self.entries_tail {
            self.entries_tail = self.entries[index].as_occupied().prev;
        }

        if Some(index) == self.entries_head {
            // unlinking the head is special.
            self.entries_head = self.entries[index].as_occupied_mut().next;
            if let Some(n) = self.entries_head {
                self.entries[n].as_occupied_mut().prev = None;
            }

            return;
        }

        // Otherwise we just do a standard linked list unlink.
        let old_prev = self.entries[index]
            .as_occupied_mut()
            .prev
            .expect("Isn't the head");
        let old_next = self.entries[index].as_occupied_mut().next;
        self.entries[old_prev].as_occupied_mut().next = old_next;
        if let Some(n) = old_next {
            self.entries[n].as_occupied_mut().prev = Some(old_prev);
        }
    }

    /// Given the index of an occupied entry, make it the most recent item.
    fn make_most_recent(&mut self, index: usize) {
        self.unlink_index(index);
        {
            let entry = self.entries[index].as_occupied_mut();
            entry.prev = None;
            entry.next = self.entries_head;
            entry.last_used = SystemTime::now();
        }
        if let Some(i) = self.entries_head {
            self.entries[i].as_occupied_mut().prev = Some(index);
        }
        self.entries_head = Some(index);

        // If this is the only entry, then unlinking it broke the tail.
        if self.entries_tail.is_none() {
            self.entries_tail = Some(index);
        }
    }

    /// Get an item, marking it as the most recently used.
    pub fn get(&mut self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        self.make_most_recent(ind);
        Some(self.entries[ind].as_occupied().item.clone())
    }

    /// Get an item without affecting recency.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        Some(self.entries[ind].as_occupied().item.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Mark an item as used.  Returns whether it was present.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.index.get(key) {
            Some(&ind) => {
                self.make_most_recent(ind);
                true
            }
            None => false,
        }
    }

    pub fn last_used(&self, key: &K) -> Option<SystemTime> {
        let ind = *self.index.get(key)?;
        Some(self.entries[ind].as_occupied().last_used)
    }

    /// Stop an item from being evicted until a matching [LruIndex::unpin].
    pub fn pin(&mut self, key: &K) -> bool {
        match self.index.get(key) {
            Some(&ind) => {
                self.entries[ind].as_occupied_mut().pins += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, key: &K) {
        if let Some(&ind) = self.index.get(key) {
            let entry = self.entries[ind].as_occupied_mut();
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Overwrite an item's pin count.  Returns whether it was present.
    pub fn set_pins(&mut self, key: &K, pins: u32) -> bool {
        match self.index.get(key) {
            Some(&ind) => {
                self.entries[ind].as_occupied_mut().pins = pins;
                true
            }
            None => false,
        }
    }

    pub fn is_pinned(&self, key: &K) -> bool {
        self.index
            .get(key)
            .map(|&ind| self.entries[ind].as_occupied().pins > 0)
            .unwrap_or(false)
    }

    /// Make a specific index of the map become empty.
    fn become_empty(&mut self, index: usize) -> (Arc<K>, Arc<V>) {
        self.unlink_index(index);
        let mut old = IndexEntry::Empty(EmptyEntry {
            next_empty: self.empty_head,
        });
        std::mem::swap(&mut old, &mut self.entries[index]);
        self.empty_head = Some(index);
        match old {
            IndexEntry::Occupied(OccupiedEntry {
                key, item, cost, ..
            }) => {
                self.index.remove(&key);
                self.current_cost -= cost;
                (key, item)
            }
            _ => panic!("Should have been occupied"),
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        let (_, old) = self.become_empty(ind);
        Some(old)
    }

    /// Find an available empty index, or make one if necessary.
    fn find_empty(&mut self) -> usize {
        if let Some(e) = self.empty_head {
            self.empty_head = self.entries[e].as_empty_mut().next_empty;
            return e;
        }

        self.entries
            .push(IndexEntry::Empty(EmptyEntry { next_empty: None }));
        self.entries.len() - 1
    }

    /// Add an entry as the most recently used.  Return the old entry if this key was already present.
    ///
    /// Pins held on a replaced entry carry over to the new one, since readers are tracked by key.
    pub fn insert(&mut self, key: K, value: V, cost: u64) -> Option<Arc<V>> {
        self.insert_at(key, value, cost, SystemTime::now())
    }

    /// Like [LruIndex::insert], but recording a specific last-use time.  Used when rebuilding an index from
    /// persisted state, where items must be inserted oldest first.
    pub fn insert_at(&mut self, key: K, value: V, cost: u64, last_used: SystemTime) -> Option<Arc<V>> {
        let key_arc = Arc::new(key);
        let pins = self
            .index
            .get(&*key_arc)
            .map(|&i| self.entries[i].as_occupied().pins)
            .unwrap_or(0);
        let ret = self.remove(&*key_arc);
        let ind = self.find_empty();
        let old_head = self.entries_head;

        self.entries[ind] = IndexEntry::Occupied(OccupiedEntry {
            key: key_arc.clone(),
            item: Arc::new(value),
            prev: None,
            next: self.entries_head,
            cost,
            pins,
            last_used,
        });
        self.entries_head = Some(ind);
        self.index.insert(key_arc, ind);
        self.current_cost += cost;

        // Link up the prev of the old head.
        if let Some(h) = old_head {
            self.entries[h].as_occupied_mut().prev = self.entries_head;
        }

        // If there's no tail this was the first insert and we need one.
        if self.entries_tail.is_none() {
            self.entries_tail = Some(ind);
        }

        ret
    }

    /// Evict least recently used, unpinned entries until the cost is within budget, returning what was evicted.
    ///
    /// If everything left is pinned the index stays over budget.
    pub fn evict_over_budget(&mut self) -> Vec<(Arc<K>, Arc<V>)> {
        let mut evicted = vec![];
        let mut cur = self.entries_tail;
        while self.current_cost > self.max_cost {
            let ind = match cur {
                Some(i) => i,
                None => break,
            };
            let entry = self.entries[ind].as_occupied();
            cur = entry.prev;
            if entry.pins == 0 {
                evicted.push(self.become_empty(ind));
            }
        }
        evicted
    }

    /// Iterator visiting entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let mut ind = self.entries_head;
        std::iter::from_fn(move || {
            let next = ind?;
            let ret = self.entries[next].as_occupied();
            ind = ret.next;
            Some((&*ret.key, &*ret.item))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lru::LruCache;
    use proptest::prelude::*;

    /// Simple helper to build proptest strategies so that we can test the unpinned case against [LruCache].
    #[derive(Copy, Clone, Debug, Ord, Eq, PartialOrd, PartialEq)]
    enum CacheCommand {
        Put(u64, u64),
        Get(u64),
        Delete(u64),
    }

    fn cache_command_strat(
        max_key: std::ops::Range<u64>,
        max_value: std::ops::Range<u64>,
    ) -> prop::strategy::BoxedStrategy<CacheCommand> {
        proptest::prop_oneof![
            max_key.clone().prop_map(CacheCommand::Get),
            (max_key.clone(), max_value).prop_map(|(x, y)| CacheCommand::Put(x, y)),
            max_key.prop_map(CacheCommand::Delete),
        ]
        .boxed()
    }

    // With nothing pinned, every cost set to 1, and eviction run after each insert, we get something exactly
    // equivalent to [LruCache].
    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 500,
            max_shrink_iters: 100000,
            ..Default::default()
        })]
        #[test]
        fn test_against_lru_cache_bounded(
            bound in 1..200u64,
            commands in prop::collection::vec(cache_command_strat(0..100, 0..10000), 0..2000)
        ) {
            let mut known_good = LruCache::<u64, u64>::new(bound as usize);
            let mut ours = LruIndex::<u64, u64>::new(bound);

            for c in commands {
                use CacheCommand::*;

                match c {
                    Get(k) => {
                        let left: Option<u64> = known_good.get(&k).cloned();
                        let right: Option<u64> = ours.get(&k).as_deref().cloned();
                        prop_assert_eq!(left, right);
                    },
                    Put(k, v) => {
                        let right = ours.insert(k, v, 1).as_deref().cloned();
                        ours.evict_over_budget();
                        prop_assert_eq!(known_good.put(k, v), right);
                    },
                    Delete(k) => prop_assert_eq!(known_good.pop(&k), ours.remove(&k).as_deref().cloned()),
                }

                let good_state = known_good.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
                let our_state = ours.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
                prop_assert_eq!(&good_state, &our_state);
                prop_assert_eq!(good_state.len() as u64, ours.current_cost());
            }
        }
    }

    #[test]
    fn test_eviction() {
        let mut index = LruIndex::<u64, u64>::new(10);
        index.insert(1, 1, 1);
        index.insert(2, 2, 2);
        index.insert(3, 3, 3);
        index.insert(4, 4, 4);
        index.insert(5, 5, 5);

        // Nothing happens until asked.
        assert_eq!(index.current_cost(), 15);

        let evicted = index
            .evict_over_budget()
            .into_iter()
            .map(|(k, _)| *k)
            .collect::<Vec<u64>>();
        assert_eq!(evicted, vec![1, 2, 3]);

        let state = index
            .iter()
            .map(|x| (*x.0, *x.1))
            .collect::<Vec<(u64, u64)>>();
        assert_eq!(state, vec![(5, 5), (4, 4)]);
    }

    #[test]
    fn test_pinned_entries_survive() {
        let mut index = LruIndex::<u64, u64>::new(5);
        index.insert(1, 1, 3);
        index.insert(2, 2, 3);
        index.insert(3, 3, 3);

        // 1 is the oldest, but a reader holds it, as does 3.
        assert!(index.pin(&1));
        assert!(index.pin(&3));
        let evicted = index
            .evict_over_budget()
            .into_iter()
            .map(|(k, _)| *k)
            .collect::<Vec<u64>>();
        assert_eq!(evicted, vec![2]);
        assert!(index.contains(&1));
        assert!(index.contains(&3));

        // Everything left is pinned, so we stay over budget.
        assert!(index.evict_over_budget().is_empty());
        assert_eq!(index.current_cost(), 6);

        index.unpin(&1);
        assert!(!index.is_pinned(&1));
        let evicted = index
            .evict_over_budget()
            .into_iter()
            .map(|(k, _)| *k)
            .collect::<Vec<u64>>();
        assert_eq!(evicted, vec![1]);
    }

    #[test]
    fn test_touch_changes_order_and_pins_carry_over() {
        let mut index = LruIndex::<u64, u64>::new(100);
        index.insert(1, 10, 1);
        index.insert(2, 20, 1);
        let before = index.last_used(&1).unwrap();
        assert!(index.touch(&1));
        assert!(index.last_used(&1).unwrap() >= before);
        assert_eq!(index.iter().map(|x| *x.0).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(index.peek(&2).as_deref(), Some(&20));
        assert!(!index.touch(&3));

        index.pin(&2);
        assert_eq!(index.insert(2, 21, 1).as_deref(), Some(&20));
        assert!(index.is_pinned(&2));
    }
}
