//! Fixed-Capacity LRU Cache
//!
//! A bounded key/value store that evicts the least-recently-used entry when a
//! new key arrives at capacity. It backs both the conversation history store
//! and the per-endpoint budget table of the load distributor, which touch it on
//! every message and every upstream response.
//!
//! Recency is kept in a doubly-linked list threaded through an arena of nodes,
//! with two sentinel nodes (head = most recent, tail = least recent) so that
//! linking and unlinking never special-case the ends. A hash index maps each
//! key to its arena slot, giving O(1) `get` and `put`.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// Capacity used when none is given explicitly.
pub const DEFAULT_CAPACITY: usize = 20;

const HEAD: usize = 0;
const TAIL: usize = 1;

#[derive(Debug)]
struct Node<K, V> {
    key: Option<K>,
    value: Option<V>,
    prev: usize,
    next: usize,
}

impl<K, V> Node<K, V> {
    fn sentinel() -> Self {
        Self {
            key: None,
            value: None,
            prev: HEAD,
            next: TAIL,
        }
    }
}

/// A least-recently-used cache with a fixed number of slots.
///
/// Every successful `get`, `get_mut` or `put` on a key moves it to the
/// most-recently-used position. Inserting a new key while full evicts exactly
/// one entry: the least recently used one.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    nodes: Vec<Node<K, V>>,
    index: HashMap<K, usize>,
    free: Vec<usize>,
}

impl<K, V> Default for LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Creates an empty cache. A capacity of zero is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut nodes = Vec::with_capacity(capacity + 2);
        nodes.push(Node::sentinel());
        nodes.push(Node::sentinel());
        Self {
            capacity,
            nodes,
            index: HashMap::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[cfg(test)]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Returns the value for `key` and marks it as most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.index.get(key)?;
        self.promote(idx);
        self.nodes[idx].value.as_ref()
    }

    /// Mutable variant of [`get`](Self::get); also promotes the key.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.index.get(key)?;
        self.promote(idx);
        self.nodes[idx].value.as_mut()
    }

    /// Reads a value without touching its recency.
    #[cfg(test)]
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.index.get(key)?;
        self.nodes[idx].value.as_ref()
    }

    /// Inserts or overwrites `key`, making it the most recently used entry.
    ///
    /// Returns the entry evicted to make room, if any.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.index.get(&key) {
            self.nodes[idx].value = Some(value);
            self.promote(idx);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.evict()
        } else {
            None
        };

        let node = Node {
            key: Some(key.clone()),
            value: Some(value),
            prev: HEAD,
            next: TAIL,
        };
        let idx = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.attach_front(idx);
        self.index.insert(key, idx);
        evicted
    }

    /// Keys ordered from most to least recently used.
    #[cfg(test)]
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        let mut cursor = self.nodes[HEAD].next;
        std::iter::from_fn(move || {
            if cursor == TAIL {
                return None;
            }
            let node = &self.nodes[cursor];
            cursor = node.next;
            node.key.as_ref()
        })
    }

    fn evict(&mut self) -> Option<(K, V)> {
        let lru = self.nodes[TAIL].prev;
        if lru == HEAD {
            return None;
        }
        self.detach(lru);
        self.free.push(lru);
        let key = self.nodes[lru].key.take()?;
        self.index.remove(&key);
        let value = self.nodes[lru].value.take()?;
        Some((key, value))
    }

    fn promote(&mut self, idx: usize) {
        if self.nodes[HEAD].next == idx {
            return;
        }
        self.detach(idx);
        self.attach_front(idx);
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    fn attach_front(&mut self, idx: usize) {
        let first = self.nodes[HEAD].next;
        self.nodes[idx].prev = HEAD;
        self.nodes[idx].next = first;
        self.nodes[first].prev = idx;
        self.nodes[HEAD].next = idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_of(cache: &LruCache<String, i32>) -> Vec<String> {
        cache.keys().cloned().collect()
    }

    #[test]
    fn test_put_beyond_capacity_evicts_oldest() {
        let mut cache = LruCache::new(2);
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        let evicted = cache.put("c".to_string(), 3);

        assert_eq!(evicted, Some(("a".to_string(), 1)));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(&2));
        assert_eq!(cache.get("c"), Some(&3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_get_promotes_recency() {
        let mut cache = LruCache::new(2);
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        assert_eq!(cache.get("a"), Some(&1));
        cache.put("c".to_string(), 3);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(&1));
        assert_eq!(cache.get("c"), Some(&3));
    }

    #[test]
    fn test_put_existing_key_updates_and_promotes() {
        let mut cache = LruCache::new(3);
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        cache.put("c".to_string(), 3);

        assert_eq!(cache.put("a".to_string(), 10), None);
        assert_eq!(cache.len(), 3);
        assert_eq!(keys_of(&cache), vec!["a", "c", "b"]);

        cache.put("d".to_string(), 4);
        assert!(!cache.contains("b"));
        assert_eq!(cache.peek("a"), Some(&10));
    }

    #[test]
    fn test_capacity_c_plus_one_keeps_most_recent_c() {
        let capacity = 20;
        let mut cache = LruCache::new(capacity);
        for i in 0..=capacity {
            cache.put(format!("k{i}"), i as i32);
        }

        assert_eq!(cache.len(), capacity);
        assert!(!cache.contains("k0"));
        for i in 1..=capacity {
            assert_eq!(cache.peek(format!("k{i}").as_str()), Some(&(i as i32)));
        }
    }

    #[test]
    fn test_peek_does_not_promote() {
        let mut cache = LruCache::new(2);
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        assert_eq!(cache.peek("a"), Some(&1));
        cache.put("c".to_string(), 3);

        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[test]
    fn test_get_mut_promotes_and_mutates() {
        let mut cache: LruCache<String, Vec<i32>> = LruCache::new(2);
        cache.put("a".to_string(), vec![1]);
        cache.put("b".to_string(), vec![2]);
        cache.get_mut("a").unwrap().push(11);
        cache.put("c".to_string(), vec![3]);

        assert_eq!(cache.get("a"), Some(&vec![1, 11]));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = LruCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        assert_eq!(keys_of(&cache), vec!["b"]);
    }

    #[test]
    fn test_default_capacity() {
        let cache: LruCache<String, i32> = LruCache::default();
        assert_eq!(cache.capacity(), DEFAULT_CAPACITY);
        assert!(cache.is_empty());
    }
}
