//! A bounded least-recently-used cache mapping inode identifiers to
//! directory entries on the read path.
//!
//! The LRU order lives in a doubly linked list threaded through an
//! arena of nodes addressed by index; the hash map stores indices into
//! the arena. Hits and evictions are O(1).
use std::collections::HashMap;
use std::hash::Hash;

use tracing::debug;

use crate::entry::{CacheEntry, InodeId};

/// Key values reserved for the inode cache's internal slots. Inode
/// assignment starts far below these, so they never collide with a real
/// inode.
pub const RESERVED_INODE_KEYS: [InodeId; 2] = [u64::MAX - 1, u64::MAX];

/// The cache used by the read path.
pub type InodeCache = LruCache<InodeId, CacheEntry>;

struct Node<K, V> {
    key: K,
    value: Option<V>,
    prev: usize,
    next: usize,
}

/// A fixed-capacity LRU cache.
///
/// Two reserved key values are configured at construction; they occupy
/// the cache's sentinel slots (the list head and recycled nodes) and
/// are never accepted as real keys. The cache is not thread-safe:
/// callers serialize externally.
pub struct LruCache<K, V> {
    max_size: usize,
    reserved: [K; 2],
    map: HashMap<K, usize>,
    nodes: Vec<Node<K, V>>,
    free: Vec<usize>,
}

// Index of the list-head sentinel in the arena.
const HEAD: usize = 0;

impl<K: Eq + Hash + Copy, V> LruCache<K, V> {
    pub fn new(max_size: usize, reserved: [K; 2]) -> Self {
        assert!(max_size > 0, "cache capacity must be positive");
        let mut nodes = Vec::with_capacity(max_size + 1);
        nodes.push(Node {
            key: reserved[0],
            value: None,
            prev: HEAD,
            next: HEAD,
        });
        Self {
            max_size,
            reserved,
            map: HashMap::with_capacity(max_size),
            nodes,
            free: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    fn is_reserved(&self, key: &K) -> bool {
        *key == self.reserved[0] || *key == self.reserved[1]
    }

    /// Inserts or updates the value stored under `key` and marks it
    /// most recently used. When the cache is full, the least recently
    /// used entry is evicted first. Returns false for a reserved key.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if self.is_reserved(&key) {
            debug!("refusing to cache a reserved key");
            return false;
        }

        if let Some(&idx) = self.map.get(&key) {
            self.nodes[idx].value = Some(value);
            self.touch(idx);
            return true;
        }

        if self.map.len() >= self.max_size {
            self.evict_oldest();
        }

        let idx = self.allocate(key, value);
        self.link_back(idx);
        self.map.insert(key, idx);
        true
    }

    /// Retrieves the value stored under `key`, promoting it to most
    /// recently used on a hit.
    pub fn lookup(&mut self, key: &K) -> Option<&V> {
        if self.is_reserved(key) {
            return None;
        }
        let idx = *self.map.get(key)?;
        self.touch(idx);
        self.nodes[idx].value.as_ref()
    }

    /// Empties the cache. Arena nodes are recycled, not deallocated.
    pub fn clear(&mut self) {
        let mut idx = self.nodes[HEAD].next;
        while idx != HEAD {
            let next = self.nodes[idx].next;
            self.release(idx);
            idx = next;
        }
        self.nodes[HEAD].next = HEAD;
        self.nodes[HEAD].prev = HEAD;
        self.map.clear();
    }

    /// Shrinks or grows the capacity, evicting least recently used
    /// entries until the current content fits.
    pub fn resize(&mut self, new_size: usize) {
        assert!(new_size > 0, "cache capacity must be positive");
        while self.map.len() > new_size {
            self.evict_oldest();
        }
        self.max_size = new_size;
    }

    fn allocate(&mut self, key: K, value: V) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx].key = key;
                self.nodes[idx].value = Some(value);
                idx
            }
            None => {
                self.nodes.push(Node {
                    key,
                    value: Some(value),
                    prev: HEAD,
                    next: HEAD,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) {
        self.nodes[idx].key = self.reserved[1];
        self.nodes[idx].value = None;
        self.free.push(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    /// Links `idx` in just before the head sentinel, i.e. at the most
    /// recently used end.
    fn link_back(&mut self, idx: usize) {
        let tail = self.nodes[HEAD].prev;
        self.nodes[idx].prev = tail;
        self.nodes[idx].next = HEAD;
        self.nodes[tail].next = idx;
        self.nodes[HEAD].prev = idx;
    }

    fn touch(&mut self, idx: usize) {
        self.unlink(idx);
        self.link_back(idx);
    }

    fn evict_oldest(&mut self) {
        let oldest = self.nodes[HEAD].next;
        debug_assert_ne!(oldest, HEAD, "evicting from an empty cache");
        if oldest == HEAD {
            return;
        }
        self.unlink(oldest);
        let key = self.nodes[oldest].key;
        self.map.remove(&key);
        self.release(oldest);
    }
}
